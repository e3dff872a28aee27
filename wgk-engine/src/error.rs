//! Error types for the tunnel lifecycle engine

use thiserror::Error;

use crate::lifecycle::Adapter;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing tunnels
#[derive(Debug, Error)]
pub enum Error {
    /// Every candidate interface index is taken by another tunnel
    #[error("no free interface among {0} candidates")]
    AllocationExhausted(u32),

    /// Another interface already carries this configuration's public key
    #[error("interface {0} is already in use by this configuration")]
    InUseConflict(String),

    /// The peer never completed a handshake within the connect timeout
    #[error("no handshake with {}{} before the connect timeout", .endpoint, .reverse.as_ref().map(|r| format!(" ({})", r)).unwrap_or_default())]
    HandshakeTimeout {
        endpoint: String,
        reverse: Option<String>,
    },

    /// An external command exited with a non-zero status
    #[error("command `{command}` failed with exit code {code}: {message}")]
    Command {
        command: String,
        code: i32,
        message: String,
    },

    /// The privilege boundary could not be crossed
    #[error("elevation error: {0}")]
    Elevation(String),

    /// The configuration or request is not usable
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// A pre/post up/down hook failed
    #[error("hook failed: {0}")]
    Hook(String),

    /// The tunnel is up but a post-up hook failed
    #[error("post-up hook failed for {}: {}", .adapter.name(), .source)]
    PostUp {
        adapter: Box<Adapter>,
        #[source]
        source: Box<Error>,
    },

    /// The default gateway could not be found or redirected
    #[error("gateway error: {0}")]
    Gateway(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse a configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Error from the OS layer
    #[error("TUN error: {0}")]
    Tun(wgk_tun::Error),
}

impl From<wgk_tun::Error> for Error {
    fn from(e: wgk_tun::Error) -> Self {
        match e {
            wgk_tun::Error::CommandFailed {
                command,
                code,
                message,
            } => Error::Command {
                command,
                code,
                message,
            },
            wgk_tun::Error::Elevation(msg) => Error::Elevation(msg),
            other => Error::Tun(other),
        }
    }
}

impl Error {
    /// Check if retrying later may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::HandshakeTimeout { .. } | Error::AllocationExhausted(_) | Error::PostUp { .. }
        )
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::ConfigurationInvalid(_) | Error::ConfigParse(_))
    }

    /// Check if an external command exited with a non-zero status
    pub fn is_command_failure(&self) -> bool {
        matches!(self, Error::Command { .. })
    }

    /// Check if the privileged helper could not be reached
    pub fn is_elevation_failure(&self) -> bool {
        matches!(self, Error::Elevation(_))
    }

    /// Check if something looked up does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Tun(e) => e.is_not_found(),
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Take the adapter out of a post-up failure
    ///
    /// The tunnel behind it is up and must still be stopped by the caller.
    pub fn into_adapter(self) -> Option<Adapter> {
        match self {
            Error::PostUp { adapter, .. } => Some(*adapter),
            _ => None,
        }
    }
}
