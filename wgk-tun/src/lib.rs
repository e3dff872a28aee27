//! OS layer for wgkeeper
//!
//! Everything that touches the host goes through this crate: running external
//! commands (optionally through an elevated helper process), reading and
//! writing privileged files, interface and route control per operating system,
//! and the firewall marks needed for policy-routed default routes.
//!
//! # Privilege
//!
//! Commands are run through [`SystemCommands`]. Calls made on its
//! [`privileged`](SystemCommands::privileged) copy go to the elevated
//! executor, which is either the local process (when already running as root)
//! or an [`ElevatedClient`] talking to an [`ElevatedServer`] over a local
//! socket.
//!
//! # Platform Requirements
//!
//! ## Linux
//! - `iproute2` and the kernel WireGuard module
//! - `nft` or `iptables` for default routes
//!
//! ## macOS
//! - `wireguard-go` and `wg` on the search path
//!
//! ## Windows
//! - WireGuard for Windows; tunnels must already be installed as services

pub mod elevate;
pub mod error;
pub mod exec;
pub mod firewall;
pub mod platform;
pub mod route;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use elevate::{ElevatedClient, ElevatedServer, DEFAULT_SOCKET_MODE, DEFAULT_SOCKET_PATH};
pub use error::{Error, Result};
pub use exec::{CommandOutput, CommandRequest, Executor, LocalExecutor, SystemCommands};
pub use platform::Platform;
pub use route::{Gateway, Route, RouteTable, POLICY_TABLE_BASE};

/// Default WireGuard listen port, also used as the first policy routing table
pub const DEFAULT_PORT: u16 = 51820;
