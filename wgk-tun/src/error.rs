//! Error types for wgk-tun

use std::io;
use thiserror::Error;

/// Result type alias for wgk-tun operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the OS layer
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An external command ran but exited with a non-zero status
    #[error("command `{command}` exited with code {code}: {message}")]
    CommandFailed {
        command: String,
        code: i32,
        message: String,
    },

    /// The privileged call could not be dispatched, or its result could not be returned
    #[error("elevation error: {0}")]
    Elevation(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Interface not found
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The program to run is not installed or not on the search path
    #[error("program not found: {0}")]
    ProgramNotFound(String),

    /// Route management error
    #[error("route error: {0}")]
    Route(String),

    /// Firewall mark / connmark rule error
    #[error("firewall error: {0}")]
    Firewall(String),

    /// Invalid IP address
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid network prefix
    #[error("invalid network prefix: {0}")]
    InvalidPrefix(String),

    /// Operation not supported on this platform
    #[error("operation not supported: {0}")]
    NotSupported(String),
}

impl Error {
    /// Check if the error came from a command's exit status
    pub fn is_command_failure(&self) -> bool {
        matches!(self, Error::CommandFailed { .. })
    }

    /// Check if the privilege boundary itself failed
    pub fn is_elevation_failure(&self) -> bool {
        matches!(self, Error::Elevation(_))
    }

    /// Check if the error is a not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::DeviceNotFound(_))
            || matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }

    /// Check if a required program is missing
    pub fn is_program_missing(&self) -> bool {
        matches!(self, Error::ProgramNotFound(_))
    }

    /// Check if the error is a permission-related error
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::PermissionDenied)
    }

    /// Exit code of a failed command, if this is one
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::CommandFailed { code, .. } => Some(*code),
            _ => None,
        }
    }
}
