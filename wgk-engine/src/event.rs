//! Lifecycle events and adapter state

use std::sync::Arc;

use parking_lot::Mutex;

/// Where an adapter is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// Nothing done yet
    Idle,
    /// Resolving or creating the interface
    Allocating,
    /// Backend configuration and addresses are in place
    ConfigApplied,
    /// Interface is up
    Up,
    /// Waiting for the first handshake
    AwaitingHandshake,
    /// Routes, DNS and hooks done
    Connected,
    /// Undoing a failed start
    RollingBack,
    /// Tearing down a connected adapter
    Disconnecting,
    /// Gone
    Closed,
}

impl AdapterState {
    /// Check if the interface exists in this state
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            AdapterState::ConfigApplied
                | AdapterState::Up
                | AdapterState::AwaitingHandshake
                | AdapterState::Connected
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, AdapterState::Connected)
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            AdapterState::Idle => "Idle",
            AdapterState::Allocating => "Allocating...",
            AdapterState::ConfigApplied => "Configured",
            AdapterState::Up => "Up",
            AdapterState::AwaitingHandshake => "Waiting for handshake...",
            AdapterState::Connected => "Connected",
            AdapterState::RollingBack => "Rolling back...",
            AdapterState::Disconnecting => "Disconnecting...",
            AdapterState::Closed => "Closed",
        }
    }
}

impl std::fmt::Display for AdapterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Events emitted by the lifecycle
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// State changed
    StateChanged {
        /// Friendly name of the interface, once known
        name: Option<String>,
        old: AdapterState,
        new: AdapterState,
    },

    /// An interface was created for this tunnel
    InterfaceCreated { name: String, native: String },

    /// First handshake seen
    Handshake { name: String, peer: String, at: u64 },

    /// The tunnel is fully up
    Connected { name: String, native: String },

    /// The tunnel was taken down
    Disconnected { name: String },

    /// A start failed and was rolled back
    Failed { name: Option<String>, message: String },
}

/// Receiver of lifecycle events
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: LifecycleEvent);
}

/// Simple event handler that logs events
pub struct LoggingEventHandler;

impl EventHandler for LoggingEventHandler {
    fn on_event(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::StateChanged { name, old, new } => {
                log::debug!(
                    "{}: {} -> {}",
                    name.as_deref().unwrap_or("(unallocated)"),
                    old,
                    new
                );
            }
            LifecycleEvent::InterfaceCreated { name, native } => {
                if name == native {
                    log::info!("Created interface {}", name);
                } else {
                    log::info!("Created interface {} ({})", name, native);
                }
            }
            LifecycleEvent::Handshake { name, peer, at } => {
                log::info!("{}: handshake with {} at {}", name, peer, at);
            }
            LifecycleEvent::Connected { name, native } => {
                log::info!("Connected: {} ({})", name, native);
            }
            LifecycleEvent::Disconnected { name } => {
                log::info!("Disconnected: {}", name);
            }
            LifecycleEvent::Failed { name, message } => {
                log::error!(
                    "Failed to start {}: {}",
                    name.as_deref().unwrap_or("tunnel"),
                    message
                );
            }
        }
    }
}

/// Handler that keeps every event, for callers that want to inspect them
#[derive(Default, Clone)]
pub struct RecordingEventHandler {
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
}

impl RecordingEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    /// The `new` state of every state change, in order
    pub fn states(&self) -> Vec<AdapterState> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                LifecycleEvent::StateChanged { new, .. } => Some(*new),
                _ => None,
            })
            .collect()
    }
}

impl EventHandler for RecordingEventHandler {
    fn on_event(&self, event: LifecycleEvent) {
        self.events.lock().push(event);
    }
}
