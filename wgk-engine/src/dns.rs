//! DNS contract
//!
//! Applying DNS settings is left to an OS-specific [`DnsProvider`]. The
//! lifecycle only builds a [`DnsEntry`] from the tunnel configuration and
//! hands it over.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// DNS settings for one interface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsEntry {
    /// Native interface name
    pub iface: String,
    pub ipv4: Vec<String>,
    pub ipv6: Vec<String>,
    /// Search domains
    pub domains: Vec<String>,
}

impl DnsEntry {
    /// Split a configuration `dns` list into servers and search domains
    pub fn from_spec<S: AsRef<str>>(iface: &str, dns: &[S]) -> Self {
        let mut entry = DnsEntry {
            iface: iface.to_string(),
            ..Default::default()
        };
        for item in dns.iter().map(|s| s.as_ref().trim()).filter(|s| !s.is_empty()) {
            match item.parse::<IpAddr>() {
                Ok(IpAddr::V4(_)) => entry.ipv4.push(item.to_string()),
                Ok(IpAddr::V6(_)) => entry.ipv6.push(item.to_string()),
                Err(_) => entry.domains.push(item.to_string()),
            }
        }
        entry
    }

    /// All servers, IPv4 first
    pub fn servers(&self) -> Vec<String> {
        self.ipv4.iter().chain(self.ipv6.iter()).cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.ipv4.is_empty() && self.ipv6.is_empty() && self.domains.is_empty()
    }
}

/// Applies and removes per-interface DNS settings
pub trait DnsProvider: Send + Sync {
    /// Prepare the provider; called once before first use
    fn init(&self) -> Result<()>;

    /// Entries currently applied
    fn entries(&self) -> Result<Vec<DnsEntry>>;

    fn set(&self, entry: &DnsEntry) -> Result<()>;

    fn unset(&self, entry: &DnsEntry) -> Result<()>;
}

/// Provider that applies nothing
pub struct NoDns;

impl DnsProvider for NoDns {
    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn entries(&self) -> Result<Vec<DnsEntry>> {
        Ok(Vec::new())
    }

    fn set(&self, entry: &DnsEntry) -> Result<()> {
        log::info!(
            "No DNS provider, not applying {} for {}",
            entry.servers().join(" "),
            entry.iface
        );
        Ok(())
    }

    fn unset(&self, entry: &DnsEntry) -> Result<()> {
        log::debug!("No DNS provider, nothing to remove for {}", entry.iface);
        Ok(())
    }
}
