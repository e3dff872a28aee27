//! Tunnel configuration
//!
//! A tunnel is described by one TOML document: an `[interface]` table with
//! our own key pair and local settings, and a `[[peers]]` array.
//!
//! # Example Configuration
//!
//! ```toml
//! [interface]
//! private_key = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk="
//! public_key = "HIgo9xNzJMWLKASShiTqIybxZ0U3wGLiUeJ1PKf8ykw="
//! addresses = ["10.8.0.2/32"]
//! dns = ["10.8.0.1", "corp.example.com"]
//!
//! [[peers]]
//! public_key = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg="
//! endpoint = "vpn.example.com:51820"
//! allowed_ips = ["10.8.0.0/24", "0.0.0.0/0"]
//! persistent_keepalive = 25
//! ```

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::path::Path;

use base64::Engine;
use serde::{Deserialize, Serialize};
use wgk_tun::route::parse_route;
use wgk_tun::RouteTable;

use crate::error::{Error, Result};

/// Port used when a peer endpoint does not name one
pub const DEFAULT_ENDPOINT_PORT: u16 = 51820;

/// Decoded length of a WireGuard key
const KEY_LEN: usize = 32;

/// Full configuration of one tunnel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpnConfiguration {
    /// Local side of the tunnel
    pub interface: InterfaceConfig,

    /// Remote peers, in the order they were configured
    #[serde(default)]
    pub peers: Vec<VpnPeer>,
}

/// The `[interface]` table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Base64 private key (required)
    pub private_key: String,

    /// Base64 public key matching the private key (required)
    pub public_key: String,

    /// UDP port to listen on; random when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,

    /// Tunnel addresses in CIDR form
    #[serde(default)]
    pub addresses: Vec<String>,

    /// DNS servers and search domains
    #[serde(default)]
    pub dns: Vec<String>,

    /// Interface MTU; detected from the default route when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,

    #[serde(default)]
    pub pre_up: Vec<String>,

    #[serde(default)]
    pub post_up: Vec<String>,

    #[serde(default)]
    pub pre_down: Vec<String>,

    #[serde(default)]
    pub post_down: Vec<String>,

    /// Routing table selector: `auto`, `off` or a table number/name
    #[serde(default)]
    pub table: RouteTable,

    /// Write the live configuration back when the tunnel goes down
    #[serde(default)]
    pub save: bool,
}

/// One `[[peers]]` entry
///
/// Peers are identified by their public key alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VpnPeer {
    /// Base64 public key (required)
    pub public_key: String,

    /// `host`, `host:port` or `[v6]:port`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub allowed_ips: Vec<String>,

    /// Keepalive interval in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_keepalive: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,
}

impl PartialEq for VpnPeer {
    fn eq(&self, other: &Self) -> bool {
        self.public_key == other.public_key
    }
}

impl Eq for VpnPeer {}

impl Hash for VpnPeer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.public_key.hash(state);
    }
}

impl VpnPeer {
    pub fn new(public_key: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_allowed_ips<I, S>(mut self, ips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_ips = ips.into_iter().map(Into::into).collect();
        self
    }

    /// Host part of the endpoint, without brackets
    pub fn endpoint_address(&self) -> Option<&str> {
        self.endpoint.as_deref().map(|e| split_endpoint(e).0)
    }

    /// Port part of the endpoint, if one was given
    pub fn endpoint_port(&self) -> Option<u16> {
        self.endpoint.as_deref().and_then(|e| split_endpoint(e).1)
    }

    /// Endpoint as written into the backend configuration (port always present)
    pub fn endpoint_socket(&self) -> Option<String> {
        let host = self.endpoint_address()?;
        let port = self.endpoint_port().unwrap_or(DEFAULT_ENDPOINT_PORT);
        Some(if host.contains(':') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        })
    }

    fn validate(&self) -> Result<()> {
        validate_key("peer public_key", &self.public_key)?;
        if let Some(ref psk) = self.preshared_key {
            validate_key("preshared_key", psk)?;
        }
        if let Some(ref endpoint) = self.endpoint {
            let (host, _) = split_endpoint(endpoint);
            if host.is_empty() {
                return Err(Error::ConfigurationInvalid(format!(
                    "peer {} has an empty endpoint",
                    self.public_key
                )));
            }
            if endpoint.rsplit_once(':').is_some_and(|(h, p)| {
                !h.contains(':') && p.parse::<u16>().is_err()
            }) {
                return Err(Error::ConfigurationInvalid(format!(
                    "invalid endpoint port in {}",
                    endpoint
                )));
            }
        }
        for ip in &self.allowed_ips {
            parse_route(ip).map_err(|_| {
                Error::ConfigurationInvalid(format!("invalid allowed IP {} for peer {}", ip, self.public_key))
            })?;
        }
        Ok(())
    }
}

/// Split `host:port`, `[v6]:port`, bare hosts and bare IPv6 addresses
fn split_endpoint(endpoint: &str) -> (&str, Option<u16>) {
    if let Some(rest) = endpoint.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((host, tail)) => (host, tail.strip_prefix(':').and_then(|p| p.parse().ok())),
            None => (rest, None),
        };
    }
    match endpoint.rsplit_once(':') {
        // More than one colon without brackets is a bare IPv6 address
        Some((host, _)) if host.contains(':') => (endpoint, None),
        Some((host, port)) => (host, port.parse().ok()),
        None => (endpoint, None),
    }
}

fn validate_key(what: &str, key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::ConfigurationInvalid(format!("{} is required", what)));
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(key)
        .map_err(|e| Error::ConfigurationInvalid(format!("{} is not valid base64: {}", what, e)))?;
    if decoded.len() != KEY_LEN {
        return Err(Error::ConfigurationInvalid(format!(
            "{} must decode to {} bytes, got {}",
            what,
            KEY_LEN,
            decoded.len()
        )));
    }
    Ok(())
}

impl VpnConfiguration {
    /// Configuration with a key pair and nothing else
    pub fn new(private_key: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            interface: InterfaceConfig {
                private_key: private_key.into(),
                public_key: public_key.into(),
                ..Default::default()
            },
            peers: Vec::new(),
        }
    }

    pub fn with_peer(mut self, peer: VpnPeer) -> Self {
        self.peers.push(peer);
        self
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: VpnConfiguration = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize back to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigurationInvalid(format!("cannot serialize configuration: {}", e)))
    }

    /// Write the configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_key("private_key", &self.interface.private_key)?;
        validate_key("public_key", &self.interface.public_key)?;

        for address in &self.interface.addresses {
            parse_route(address).map_err(|_| {
                Error::ConfigurationInvalid(format!("invalid interface address {}", address))
            })?;
        }

        if let Some(mtu) = self.interface.mtu {
            if mtu != 0 && mtu < 576 {
                return Err(Error::ConfigurationInvalid(format!(
                    "MTU {} is too small (minimum 576)",
                    mtu
                )));
            }
        }

        let mut seen = BTreeSet::new();
        for peer in &self.peers {
            peer.validate()?;
            if !seen.insert(peer.public_key.as_str()) {
                return Err(Error::ConfigurationInvalid(format!(
                    "peer {} is listed more than once",
                    peer.public_key
                )));
            }
        }
        Ok(())
    }

    /// Our public key
    pub fn public_key(&self) -> &str {
        &self.interface.public_key
    }

    /// Peer with the given public key
    pub fn peer(&self, public_key: &str) -> Option<&VpnPeer> {
        self.peers.iter().find(|p| p.public_key == public_key)
    }

    /// Peers that have an endpoint, in configuration order
    pub fn endpoint_peers(&self) -> impl Iterator<Item = &VpnPeer> {
        self.peers.iter().filter(|p| p.endpoint.is_some())
    }

    /// Render the backend's `setconf` format with each peer's configured allowed IPs
    pub fn to_backend_conf(&self) -> String {
        self.render_backend_conf(|peer| peer.allowed_ips.clone())
    }

    /// Render the backend's `setconf` format, choosing each peer's allowed IPs
    ///
    /// Keys only understood by wg-quick (addresses, DNS, MTU, hooks, table)
    /// are left out.
    pub fn render_backend_conf<F>(&self, allowed_ips: F) -> String
    where
        F: Fn(&VpnPeer) -> Vec<String>,
    {
        let mut out = String::from("[Interface]\n");
        out.push_str(&format!("PrivateKey = {}\n", self.interface.private_key));
        if let Some(port) = self.interface.listen_port {
            out.push_str(&format!("ListenPort = {}\n", port));
        }

        for peer in &self.peers {
            out.push_str("\n[Peer]\n");
            out.push_str(&format!("PublicKey = {}\n", peer.public_key));
            if let Some(ref psk) = peer.preshared_key {
                out.push_str(&format!("PresharedKey = {}\n", psk));
            }
            if let Some(endpoint) = peer.endpoint_socket() {
                out.push_str(&format!("Endpoint = {}\n", endpoint));
            }
            let ips = allowed_ips(peer);
            if !ips.is_empty() {
                out.push_str(&format!("AllowedIPs = {}\n", ips.join(", ")));
            }
            if let Some(keepalive) = peer.persistent_keepalive {
                out.push_str(&format!("PersistentKeepalive = {}\n", keepalive));
            }
        }
        out
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# wgkeeper tunnel configuration

[interface]
# Our key pair (required, base64)
private_key = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk="
public_key = "HIgo9xNzJMWLKASShiTqIybxZ0U3wGLiUeJ1PKf8ykw="

# UDP listen port (optional, random when unset)
# listen_port = 51820

# Tunnel addresses
addresses = ["10.8.0.2/32"]

# DNS servers and search domains (optional)
dns = ["10.8.0.1"]

# MTU (optional, detected from the default route when unset)
# mtu = 1420

# Routing table: "auto" (default), "off", or a table number/name
# table = "auto"

# Hooks, run through bash with WGK_* variables in the environment
# pre_up = []
# post_up = []
# pre_down = []
# post_down = []

# Write the live peer configuration back to this file on `down`
# save = false

[[peers]]
public_key = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg="
endpoint = "vpn.example.com:51820"
allowed_ips = ["10.8.0.0/24"]
persistent_keepalive = 25
"#
        .to_string()
    }
}
