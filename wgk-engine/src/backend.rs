//! WireGuard control plane
//!
//! The [`Backend`] trait is the narrow set of control-plane calls the
//! lifecycle needs. [`WgTool`] implements it by driving the `wg` binary
//! through the privileged executor.

use std::io::Write;

use serde::{Deserialize, Serialize};
use wgk_tun::SystemCommands;

use crate::error::{Error, Result};

/// How a configuration is pushed to an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Replace everything (`setconf`)
    Set,
    /// Add peers and settings, keep the rest (`addconf`)
    Add,
    /// Make the live state match without dropping sessions (`syncconf`)
    Sync,
}

impl ApplyMode {
    pub fn subcommand(&self) -> &'static str {
        match self {
            ApplyMode::Set => "setconf",
            ApplyMode::Add => "addconf",
            ApplyMode::Sync => "syncconf",
        }
    }
}

/// Live state of one interface, from `wg show <if> dump`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInformation {
    pub public_key: Option<String>,
    pub listen_port: Option<u16>,
    pub fwmark: Option<u32>,
    pub peers: Vec<PeerInformation>,
}

/// Live state of one peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInformation {
    pub public_key: String,
    pub preshared_key: bool,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    /// Epoch seconds of the last handshake, `None` if there has not been one
    pub latest_handshake: Option<u64>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub persistent_keepalive: Option<u16>,
}

impl InterfaceInformation {
    /// Parse `wg show <if> dump` output
    pub fn parse<S: AsRef<str>>(lines: &[S]) -> Result<Self> {
        let mut lines = lines.iter().map(|l| l.as_ref()).filter(|l| !l.trim().is_empty());
        let header = lines
            .next()
            .ok_or_else(|| Error::ConfigurationInvalid("empty interface dump".into()))?;
        let cols: Vec<&str> = header.split('\t').collect();
        if cols.len() < 4 {
            return Err(Error::ConfigurationInvalid(format!(
                "unexpected interface dump line: {}",
                header
            )));
        }

        let mut info = InterfaceInformation {
            public_key: present(cols[1]).map(str::to_string),
            listen_port: cols[2].parse().ok().filter(|p| *p != 0),
            fwmark: parse_fwmark(cols[3]),
            peers: Vec::new(),
        };

        for line in lines {
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() < 8 {
                log::debug!("Skipping short dump line: {}", line);
                continue;
            }
            info.peers.push(PeerInformation {
                public_key: cols[0].to_string(),
                preshared_key: present(cols[1]).is_some(),
                endpoint: present(cols[2]).map(str::to_string),
                allowed_ips: split_ips(cols[3]),
                latest_handshake: cols[4].parse().ok().filter(|t| *t != 0),
                rx_bytes: cols[5].parse().unwrap_or(0),
                tx_bytes: cols[6].parse().unwrap_or(0),
                persistent_keepalive: cols[7].parse().ok().filter(|k| *k != 0),
            });
        }
        Ok(info)
    }

    pub fn peer(&self, public_key: &str) -> Option<&PeerInformation> {
        self.peers.iter().find(|p| p.public_key == public_key)
    }
}

fn present(value: &str) -> Option<&str> {
    let value = value.trim();
    match value {
        "" | "(none)" | "off" => None,
        v => Some(v),
    }
}

fn split_ips(value: &str) -> Vec<String> {
    match present(value) {
        Some(v) => v
            .split([',', ' '])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        None => Vec::new(),
    }
}

/// `off`, decimal or `0x` hex; zero means no mark
fn parse_fwmark(value: &str) -> Option<u32> {
    let value = present(value)?;
    let mark = match value.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => value.parse().ok()?,
    };
    (mark != 0).then_some(mark)
}

/// Control-plane operations on a WireGuard interface
pub trait Backend: Send + Sync {
    /// Push a rendered configuration
    fn apply(&self, native: &str, conf: &str, mode: ApplyMode) -> Result<()>;

    /// Public key the interface is configured with
    fn public_key(&self, native: &str) -> Result<Option<String>>;

    /// Epoch seconds of the peer's last handshake
    fn latest_handshake(&self, native: &str, peer: &str) -> Result<Option<u64>>;

    /// Union of every peer's allowed IPs as the interface reports them
    fn allowed_ips(&self, native: &str) -> Result<Vec<String>>;

    /// Replace one peer's allowed IPs
    fn set_allowed_ips(&self, native: &str, peer: &str, ips: &[String]) -> Result<()>;

    fn fwmark(&self, native: &str) -> Result<Option<u32>>;

    fn set_fwmark(&self, native: &str, mark: u32) -> Result<()>;

    /// Full interface dump
    fn information(&self, native: &str) -> Result<InterfaceInformation>;
}

/// [`Backend`] driving the `wg` command line tool
pub struct WgTool {
    commands: SystemCommands,
    tool: String,
}

impl WgTool {
    pub fn new(commands: SystemCommands, tool: impl Into<String>) -> Self {
        Self {
            commands: commands.privileged(),
            tool: tool.into(),
        }
    }

    fn show(&self, native: &str, what: &str) -> Result<Vec<String>> {
        Ok(self
            .commands
            .output(&[self.tool.as_str(), "show", native, what])?)
    }
}

impl Backend for WgTool {
    fn apply(&self, native: &str, conf: &str, mode: ApplyMode) -> Result<()> {
        // Private key material; the temp file is 0600 and removed on drop
        let mut file = tempfile::Builder::new()
            .prefix("wgkeeper-")
            .suffix(".conf")
            .tempfile()?;
        file.write_all(conf.as_bytes())?;
        file.flush()?;

        let path = file.path().to_string_lossy().to_string();
        log::debug!("Applying configuration to {} with {}", native, mode.subcommand());
        self.commands
            .logged()
            .run(&[self.tool.as_str(), mode.subcommand(), native, path.as_str()])?;
        Ok(())
    }

    fn public_key(&self, native: &str) -> Result<Option<String>> {
        Ok(self
            .show(native, "public-key")?
            .first()
            .and_then(|k| present(k))
            .map(str::to_string))
    }

    fn latest_handshake(&self, native: &str, peer: &str) -> Result<Option<u64>> {
        for line in self.show(native, "latest-handshakes")? {
            let mut cols = line.split_whitespace();
            if cols.next() == Some(peer) {
                return Ok(cols.next().and_then(|t| t.parse().ok()).filter(|t| *t != 0));
            }
        }
        Ok(None)
    }

    fn allowed_ips(&self, native: &str) -> Result<Vec<String>> {
        let mut ips = Vec::new();
        for line in self.show(native, "allowed-ips")? {
            if let Some((_, rest)) = line.split_once(char::is_whitespace) {
                for ip in split_ips(rest) {
                    if !ips.contains(&ip) {
                        ips.push(ip);
                    }
                }
            }
        }
        Ok(ips)
    }

    fn set_allowed_ips(&self, native: &str, peer: &str, ips: &[String]) -> Result<()> {
        let joined = ips.join(",");
        self.commands.logged().run(&[
            self.tool.as_str(),
            "set",
            native,
            "peer",
            peer,
            "allowed-ips",
            joined.as_str(),
        ])?;
        Ok(())
    }

    fn fwmark(&self, native: &str) -> Result<Option<u32>> {
        Ok(self
            .show(native, "fwmark")?
            .first()
            .and_then(|m| parse_fwmark(m)))
    }

    fn set_fwmark(&self, native: &str, mark: u32) -> Result<()> {
        let mark = mark.to_string();
        self.commands
            .logged()
            .run(&[self.tool.as_str(), "set", native, "fwmark", mark.as_str()])?;
        Ok(())
    }

    fn information(&self, native: &str) -> Result<InterfaceInformation> {
        InterfaceInformation::parse(&self.show(native, "dump")?)
    }
}
