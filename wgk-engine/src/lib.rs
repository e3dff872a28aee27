//! wgkeeper engine
//!
//! Lifecycle orchestration for WireGuard tunnels, shared by the command line
//! tool and anything else that wants to drive tunnels from Rust.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    AdapterLifecycle                     │
//! │  start / stop / reconfigure / append / sync / adapters  │
//! └──────┬─────────────┬──────────────┬─────────────┬───────┘
//!        ▼             ▼              ▼             ▼
//! ┌────────────┐ ┌────────────┐ ┌────────────┐ ┌────────────┐
//! │ Interface  │ │ RoutePolicy│ │  Gateway   │ │ hooks, DNS │
//! │ Allocator  │ │            │ │ Redirector │ │            │
//! └──────┬─────┘ └──────┬─────┘ └──────┬─────┘ └──────┬─────┘
//!        └──────────────┴───────┬──────┴──────────────┘
//!                               ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │   Backend (wg) and wgk-tun Platform / SystemCommands    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use wgk_engine::{AdapterLifecycle, StartRequest, SystemConfiguration, VpnConfiguration};
//! use wgk_tun::SystemCommands;
//!
//! # fn main() -> wgk_engine::Result<()> {
//! let configuration = VpnConfiguration::load("office.toml")?;
//! let lifecycle = AdapterLifecycle::native(SystemConfiguration::default(), SystemCommands::local());
//! let adapter = lifecycle.start(StartRequest::new(configuration))?;
//! println!("{} is up on {}", adapter.name(), adapter.native());
//! lifecycle.stop(adapter)?;
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod backend;
pub mod config;
pub mod dns;
pub mod error;
pub mod event;
pub mod gateway;
pub mod hooks;
pub mod lifecycle;
pub mod names;
pub mod routes;
pub mod system;

#[cfg(test)]
mod testing;

pub use allocator::{Allocation, InterfaceAllocator, ResolvedName};
pub use backend::{ApplyMode, Backend, InterfaceInformation, PeerInformation, WgTool};
pub use config::{InterfaceConfig, VpnConfiguration, VpnPeer};
pub use dns::{DnsEntry, DnsProvider, NoDns};
pub use error::{Error, Result};
pub use event::{AdapterState, EventHandler, LifecycleEvent, LoggingEventHandler, RecordingEventHandler};
pub use gateway::GatewayRedirector;
pub use lifecycle::{Adapter, AdapterLifecycle, StartRequest, VirtualInterface};
pub use names::{FileKeyStore, KeyStore, MemoryKeyStore, NameMapping};
pub use routes::{effective_allowed_ips, RoutePolicy, RouteState};
pub use system::SystemConfiguration;
