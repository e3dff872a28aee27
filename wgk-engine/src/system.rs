//! Process-wide settings

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Settings shared by every tunnel this process manages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfiguration {
    /// Seconds to wait for the first handshake after bringing a tunnel up; `0` disables the wait
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Seconds after which a tunnel without a fresh handshake is considered dead
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,

    /// Drop allowed IPs that cover addresses of the host's own interfaces
    #[serde(default = "default_true")]
    pub ignore_local_routes: bool,

    /// MTU used when a tunnel configuration does not set one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_mtu: Option<u32>,

    /// Number of interface indices scanned when allocating a name
    #[serde(default = "default_max_interfaces")]
    pub max_interfaces: u32,

    /// Prefix for allocated interface names; platform default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_prefix: Option<String>,

    /// Allowed IPs that are never installed as routes (exact match)
    #[serde(default)]
    pub ignore_routes: Vec<String>,

    /// Public key of the peer that carries all traffic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_gateway_peer: Option<String>,

    /// Where the friendly/native name mapping is kept
    #[serde(default = "default_names_file")]
    pub names_file: PathBuf,

    /// Socket of the privileged helper; commands run in-process when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helper_socket: Option<PathBuf>,

    /// Permission bits of the helper socket (Unix); owner only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helper_socket_mode: Option<u32>,

    /// Group given the helper socket (Unix), as a name or a number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helper_socket_group: Option<String>,

    /// WireGuard control tool
    #[serde(default = "default_wg_tool")]
    pub wg_tool: String,

    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for SystemConfiguration {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            handshake_timeout: default_handshake_timeout(),
            ignore_local_routes: true,
            default_mtu: None,
            max_interfaces: default_max_interfaces(),
            interface_prefix: None,
            ignore_routes: Vec::new(),
            default_gateway_peer: None,
            names_file: default_names_file(),
            helper_socket: None,
            helper_socket_mode: None,
            helper_socket_group: None,
            wg_tool: default_wg_tool(),
            log_level: default_log_level(),
        }
    }
}

impl SystemConfiguration {
    /// Load settings from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse settings from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: SystemConfiguration = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.max_interfaces == 0 {
            return Err(Error::ConfigurationInvalid(
                "max_interfaces must be at least 1".into(),
            ));
        }
        if let Some(ref prefix) = self.interface_prefix {
            if prefix.is_empty() || prefix.chars().any(|c| c.is_whitespace() || c == '/') {
                return Err(Error::ConfigurationInvalid(format!(
                    "invalid interface prefix '{}'",
                    prefix
                )));
            }
        }
        if let Some(mode) = self.helper_socket_mode {
            if mode > 0o777 {
                return Err(Error::ConfigurationInvalid(format!(
                    "helper_socket_mode {:o} is not a permission mode",
                    mode
                )));
            }
        }
        if self.wg_tool.is_empty() {
            return Err(Error::ConfigurationInvalid("wg_tool must not be empty".into()));
        }
        Ok(())
    }

    /// Generate a sample settings file
    pub fn sample() -> String {
        r#"# wgkeeper system settings

# Seconds to wait for the first handshake (0 disables the wait)
connect_timeout = 12

# Seconds without a handshake before a tunnel is considered dead
handshake_timeout = 180

# Skip allowed IPs that overlap the host's own networks
ignore_local_routes = true

# MTU when the tunnel configuration has none (default: detected)
# default_mtu = 1420

# Interface indices scanned when allocating a name
max_interfaces = 250

# Prefix for allocated interface names (default: "wg", "utun" on macOS)
# interface_prefix = "wg"

# Allowed IPs never installed as routes
ignore_routes = []

# Public key of the peer that should carry all traffic
# default_gateway_peer = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg="

# Name mapping store
names_file = "/var/lib/wgkeeper/names.json"

# Privileged helper socket (default: run commands in this process)
# helper_socket = "/var/run/wgkeeper.sock"

# Let a group of unprivileged users reach the helper socket
# helper_socket_mode = 0o660
# helper_socket_group = "wgkeeper"

wg_tool = "wg"
log_level = "info"
"#
        .to_string()
    }
}

fn default_connect_timeout() -> u64 {
    12
}

fn default_handshake_timeout() -> u64 {
    180
}

fn default_true() -> bool {
    true
}

fn default_max_interfaces() -> u32 {
    250
}

fn default_names_file() -> PathBuf {
    #[cfg(windows)]
    {
        PathBuf::from(r"C:\ProgramData\wgkeeper\names.json")
    }
    #[cfg(not(windows))]
    {
        PathBuf::from("/var/lib/wgkeeper/names.json")
    }
}

fn default_wg_tool() -> String {
    "wg".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}
