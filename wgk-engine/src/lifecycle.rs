//! Tunnel lifecycle
//!
//! [`AdapterLifecycle`] strings the other components together. Starting a
//! tunnel allocates an interface, applies the configuration, raises the link,
//! waits for the first handshake and then installs gateway redirection, DNS
//! and routes. A start that fails once the interface exists is rolled back
//! before the error is returned, so the caller either gets a fully attached
//! [`Adapter`] or nothing.
//!
//! All calls block. The only wait is the handshake poll, bounded by the
//! connect timeout of the [`SystemConfiguration`].

use std::net::IpAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hickory_resolver::Resolver;
use ipnet::IpNet;
use parking_lot::Mutex;
use serde::Serialize;
use wgk_tun::platform::Platform;
use wgk_tun::route::parse_route;
use wgk_tun::{RouteTable, SystemCommands};

use crate::allocator::{Allocation, InterfaceAllocator};
use crate::backend::{ApplyMode, Backend, InterfaceInformation, PeerInformation, WgTool};
use crate::config::{VpnConfiguration, VpnPeer};
use crate::dns::{DnsEntry, DnsProvider, NoDns};
use crate::error::{Error, Result};
use crate::event::{AdapterState, EventHandler, LifecycleEvent, LoggingEventHandler};
use crate::gateway::{resolve_endpoint, GatewayRedirector};
use crate::hooks::{hook_environment, run_hooks};
use crate::names::{FileKeyStore, NameMapping};
use crate::routes::{effective_allowed_ips, RoutePolicy, RouteState};
use crate::system::SystemConfiguration;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn reverse_name(address: IpAddr) -> Option<String> {
    let resolver = Resolver::from_system_conf().ok()?;
    let lookup = resolver.reverse_lookup(address).ok()?;
    let name = lookup.iter().next()?.to_string();
    Some(name.trim_end_matches('.').to_string())
}

fn is_default_route(ip: &str) -> bool {
    ip.ends_with("/0")
}

/// What to start: a configuration plus optional naming and peer choice
#[derive(Debug, Clone)]
pub struct StartRequest {
    name: Option<String>,
    native_name: Option<String>,
    configuration: VpnConfiguration,
    peer: Option<VpnPeer>,
}

impl StartRequest {
    pub fn new(configuration: VpnConfiguration) -> Self {
        Self {
            name: None,
            native_name: None,
            configuration,
            peer: None,
        }
    }

    /// Friendly interface name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// OS interface name; only valid together with a friendly name
    pub fn with_native_name(mut self, native: impl Into<String>) -> Self {
        self.native_name = Some(native.into());
        self
    }

    pub fn with_peer(mut self, peer: VpnPeer) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn configuration(&self) -> &VpnConfiguration {
        &self.configuration
    }

    /// The peer the tunnel is for: the one given, else the first with an endpoint
    pub fn peer(&self) -> Option<&VpnPeer> {
        self.peer
            .as_ref()
            .or_else(|| self.configuration.endpoint_peers().next())
    }

    pub fn validate(&self) -> Result<()> {
        if self.native_name.is_some() && self.name.is_none() {
            return Err(Error::ConfigurationInvalid(
                "a native interface name needs a friendly name as well".into(),
            ));
        }
        self.configuration.validate()
    }
}

/// An interface as the lifecycle sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualInterface {
    /// Friendly name
    pub name: String,
    /// Name the OS knows the interface by
    pub native: String,
    pub mtu: Option<u32>,
    /// Public key of the peer the tunnel was started for
    pub peer: Option<String>,
    pub table: RouteTable,
    pub up: bool,
    pub display_name: Option<String>,
    pub mac: Option<String>,
}

/// Handle on an attached tunnel
///
/// Owns the routing, DNS and gateway state installed for the interface, so
/// that [`AdapterLifecycle::stop`] can remove exactly that.
#[derive(Debug, Clone)]
pub struct Adapter {
    interface: VirtualInterface,
    configuration: Option<VpnConfiguration>,
    state: AdapterState,
    routes: RouteState,
    dns: Option<DnsEntry>,
    gateway_peer: Option<VpnPeer>,
}

impl Adapter {
    pub fn name(&self) -> &str {
        &self.interface.name
    }

    pub fn native(&self) -> &str {
        &self.interface.native
    }

    pub fn interface(&self) -> &VirtualInterface {
        &self.interface
    }

    /// Configuration the tunnel was started with; unknown for adapters attached later
    pub fn configuration(&self) -> Option<&VpnConfiguration> {
        self.configuration.as_ref()
    }

    /// Supply the configuration of an attached adapter so its down hooks can run
    pub fn with_configuration(mut self, configuration: VpnConfiguration) -> Self {
        self.interface.table = configuration.interface.table.clone();
        self.configuration = Some(configuration);
        self
    }

    pub fn state(&self) -> AdapterState {
        self.state
    }

    pub fn routes(&self) -> &RouteState {
        &self.routes
    }

    pub fn dns(&self) -> Option<&DnsEntry> {
        self.dns.as_ref()
    }

    /// The peer whose endpoint is routed through the real default gateway
    pub fn gateway_peer(&self) -> Option<&VpnPeer> {
        self.gateway_peer.as_ref()
    }
}

/// Collects teardown failures: the first is returned, every one is logged
#[derive(Default)]
struct Teardown {
    first: Option<Error>,
}

impl Teardown {
    fn record<E: Into<Error>>(&mut self, stage: &str, result: std::result::Result<(), E>) {
        if let Err(e) = result {
            let e = e.into();
            log::warn!("{} failed: {}", stage, e);
            if self.first.is_none() {
                self.first = Some(e);
            }
        }
    }

    fn into_result(self) -> Result<()> {
        self.first.map_or(Ok(()), Err)
    }
}

fn peer_from_information(info: &PeerInformation) -> VpnPeer {
    VpnPeer {
        public_key: info.public_key.clone(),
        endpoint: info.endpoint.clone(),
        allowed_ips: info.allowed_ips.clone(),
        persistent_keepalive: info.persistent_keepalive,
        preshared_key: None,
    }
}

fn build_allocator(
    system: &SystemConfiguration,
    platform: &Arc<dyn Platform>,
    backend: &Arc<dyn Backend>,
    names: &NameMapping,
) -> InterfaceAllocator {
    InterfaceAllocator::new(
        platform.clone(),
        backend.clone(),
        names.clone(),
        system.interface_prefix.clone(),
        system.max_interfaces,
    )
}

/// Starts, updates and stops tunnels
pub struct AdapterLifecycle {
    system: SystemConfiguration,
    commands: SystemCommands,
    platform: Arc<dyn Platform>,
    backend: Arc<dyn Backend>,
    dns: Arc<dyn DnsProvider>,
    dns_ready: Mutex<bool>,
    names: NameMapping,
    allocator: InterfaceAllocator,
    routes: RoutePolicy,
    gateway: GatewayRedirector,
    handler: Arc<dyn EventHandler>,
    poll_interval: Duration,
    reverse_lookup: bool,
}

impl AdapterLifecycle {
    /// Lifecycle over the given platform and backend
    ///
    /// Names are kept in the system configuration's names file and DNS is
    /// not touched until a provider is set with [`with_dns`](Self::with_dns).
    pub fn new(
        system: SystemConfiguration,
        commands: SystemCommands,
        platform: Arc<dyn Platform>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        let names = NameMapping::new(Arc::new(FileKeyStore::new(
            commands.clone(),
            system.names_file.clone(),
        )));
        let allocator = build_allocator(&system, &platform, &backend, &names);
        Self {
            routes: RoutePolicy::new(platform.clone(), backend.clone()),
            gateway: GatewayRedirector::new(platform.clone()),
            system,
            commands,
            platform,
            backend,
            dns: Arc::new(NoDns),
            dns_ready: Mutex::new(false),
            names,
            allocator,
            handler: Arc::new(LoggingEventHandler),
            poll_interval: DEFAULT_POLL_INTERVAL,
            reverse_lookup: true,
        }
    }

    /// Lifecycle for the host OS, driving the configured `wg` tool
    pub fn native(system: SystemConfiguration, commands: SystemCommands) -> Self {
        let platform: Arc<dyn Platform> =
            Arc::from(wgk_tun::platform::native(commands.clone(), &system.wg_tool));
        let backend: Arc<dyn Backend> =
            Arc::new(WgTool::new(commands.clone(), system.wg_tool.clone()));
        Self::new(system, commands, platform, backend)
    }

    pub fn with_names(mut self, names: NameMapping) -> Self {
        self.allocator = build_allocator(&self.system, &self.platform, &self.backend, &names);
        self.names = names;
        self
    }

    pub fn with_dns(mut self, dns: Arc<dyn DnsProvider>) -> Self {
        self.dns = dns;
        *self.dns_ready.get_mut() = false;
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Time between handshake probes
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Leave the endpoint's reverse DNS name out of handshake timeouts
    pub fn without_reverse_lookup(mut self) -> Self {
        self.reverse_lookup = false;
        self
    }

    pub fn system(&self) -> &SystemConfiguration {
        &self.system
    }

    fn publish_state(&self, name: Option<&str>, old: AdapterState, new: AdapterState) {
        self.handler.on_event(LifecycleEvent::StateChanged {
            name: name.map(str::to_string),
            old,
            new,
        });
    }

    fn set_state(&self, adapter: &mut Adapter, new: AdapterState) {
        let old = adapter.state;
        adapter.state = new;
        self.publish_state(Some(adapter.name()), old, new);
    }

    fn fail(&self, name: Option<&str>, from: AdapterState, error: &Error) {
        self.publish_state(name, from, AdapterState::Closed);
        self.handler.on_event(LifecycleEvent::Failed {
            name: name.map(str::to_string),
            message: error.to_string(),
        });
    }

    fn is_gateway_peer(&self, peer: &VpnPeer) -> bool {
        self.system.default_gateway_peer.as_deref() == Some(peer.public_key.as_str())
    }

    fn ensure_dns(&self) -> Result<()> {
        let mut ready = self.dns_ready.lock();
        if !*ready {
            self.dns.init()?;
            *ready = true;
        }
        Ok(())
    }

    /// Bring a tunnel up
    pub fn start(&self, request: StartRequest) -> Result<Adapter> {
        request.validate()?;
        let configuration = request.configuration.clone();
        let peer = request.peer().cloned();
        let label = request.name.clone();

        let env = hook_environment(&configuration, None);
        if let Err(e) = run_hooks(&self.commands, &configuration.interface.pre_up, env) {
            self.fail(label.as_deref(), AdapterState::Idle, &e);
            return Err(e);
        }

        self.publish_state(label.as_deref(), AdapterState::Idle, AdapterState::Allocating);
        let allocation = match self.allocate(&request) {
            Ok(a) => a,
            Err(e) => {
                self.fail(label.as_deref(), AdapterState::Allocating, &e);
                return Err(e);
            }
        };
        if allocation.created {
            self.handler.on_event(LifecycleEvent::InterfaceCreated {
                name: allocation.name.clone(),
                native: allocation.native.clone(),
            });
        }

        let mut adapter = Adapter {
            interface: VirtualInterface {
                display_name: self.platform.display_name(&allocation.native),
                mac: self.platform.mac_address(&allocation.native),
                name: allocation.name,
                native: allocation.native,
                mtu: None,
                peer: peer.as_ref().map(|p| p.public_key.clone()),
                table: configuration.interface.table.clone(),
                up: false,
            },
            configuration: Some(configuration.clone()),
            state: AdapterState::Allocating,
            routes: RouteState::default(),
            dns: None,
            gateway_peer: None,
        };

        if let Err(e) = self.bring_up(&mut adapter, &configuration, peer.as_ref()) {
            self.rollback(&mut adapter);
            self.handler.on_event(LifecycleEvent::Failed {
                name: Some(adapter.name().to_string()),
                message: e.to_string(),
            });
            return Err(e);
        }

        self.set_state(&mut adapter, AdapterState::Connected);
        self.handler.on_event(LifecycleEvent::Connected {
            name: adapter.name().to_string(),
            native: adapter.native().to_string(),
        });

        let env = hook_environment(&configuration, Some(&adapter.interface));
        if let Err(e) = run_hooks(&self.commands, &configuration.interface.post_up, env) {
            return Err(Error::PostUp {
                adapter: Box::new(adapter),
                source: Box::new(e),
            });
        }
        Ok(adapter)
    }

    fn allocate(&self, request: &StartRequest) -> Result<Allocation> {
        let resolved = self.allocator.resolve(
            &request.configuration,
            request.name.as_deref(),
            request.native_name.as_deref(),
        )?;
        self.allocator
            .find_or_create(&resolved, &request.configuration, true)
    }

    /// Render the backend configuration with filtered allowed IPs
    fn render(&self, configuration: &VpnConfiguration, gateway: Option<&VpnPeer>) -> Result<String> {
        // Snapshot per apply, addresses come and go
        let local = if self.system.ignore_local_routes {
            self.platform.local_addresses()?
        } else {
            Vec::new()
        };
        Ok(configuration.render_backend_conf(|peer| {
            effective_allowed_ips(
                peer,
                gateway == Some(peer),
                &local,
                self.system.ignore_local_routes,
                &self.system.ignore_routes,
            )
        }))
    }

    fn bring_up(
        &self,
        adapter: &mut Adapter,
        configuration: &VpnConfiguration,
        peer: Option<&VpnPeer>,
    ) -> Result<()> {
        let native = adapter.native().to_string();

        // Handshake times have whole second resolution
        let start = epoch_secs().saturating_sub(1);
        let conf = self.render(configuration, None)?;
        self.backend.apply(&native, &conf, ApplyMode::Set)?;
        self.set_state(adapter, AdapterState::ConfigApplied);

        if !configuration.interface.addresses.is_empty() {
            self.platform
                .set_addresses(&native, &configuration.interface.addresses)?;
        }

        let mtu = configuration.interface.mtu.or(self.system.default_mtu);
        let mtu = self.platform.up(&native, mtu)?;
        adapter.interface.mtu = Some(mtu);
        adapter.interface.up = true;
        self.set_state(adapter, AdapterState::Up);

        if let Some(peer) = peer {
            let gated = configuration.peers.len() == 1
                && peer.endpoint.is_some()
                && self.system.connect_timeout > 0;
            if gated {
                self.set_state(adapter, AdapterState::AwaitingHandshake);
                let at = self.wait_for_handshake(&native, peer, start)?;
                self.handler.on_event(LifecycleEvent::Handshake {
                    name: adapter.name().to_string(),
                    peer: peer.public_key.clone(),
                    at,
                });
            }

            if self.is_gateway_peer(peer) {
                self.gateway.set_default_gateway_peer(peer)?;
                adapter.gateway_peer = Some(peer.clone());
                let ips = effective_allowed_ips(peer, true, &[], false, &[]);
                self.backend.set_allowed_ips(&native, &peer.public_key, &ips)?;
            }
        }

        if configuration.interface.dns.is_empty() {
            let full_tunnel = adapter.gateway_peer.is_some()
                || configuration
                    .peers
                    .iter()
                    .any(|p| p.allowed_ips.iter().any(|ip| is_default_route(ip)));
            if full_tunnel {
                log::warn!(
                    "{} routes all traffic but has no DNS servers, lookups may leak",
                    adapter.name()
                );
            }
        } else {
            self.ensure_dns()?;
            let entry = DnsEntry::from_spec(&native, &configuration.interface.dns);
            self.dns.set(&entry)?;
            adapter.dns = Some(entry);
        }

        self.reconcile(adapter)
    }

    /// Poll for a handshake with `peer` at or after `start` (epoch seconds)
    pub(crate) fn wait_for_handshake(&self, native: &str, peer: &VpnPeer, start: u64) -> Result<u64> {
        let endpoint = peer
            .endpoint_socket()
            .unwrap_or_else(|| peer.public_key.clone());
        log::info!(
            "Waiting up to {}s for a handshake with {}",
            self.system.connect_timeout,
            endpoint
        );

        for attempt in 0..=self.system.connect_timeout {
            if attempt > 0 {
                thread::sleep(self.poll_interval);
            }
            if let Some(at) = self.backend.latest_handshake(native, &peer.public_key)? {
                if at >= start {
                    return Ok(at);
                }
            }
        }

        let reverse = if self.reverse_lookup {
            resolve_endpoint(peer).ok().and_then(reverse_name)
        } else {
            None
        };
        Err(Error::HandshakeTimeout { endpoint, reverse })
    }

    fn reconcile(&self, adapter: &mut Adapter) -> Result<()> {
        let native = adapter.native().to_string();
        let live = self.backend.allowed_ips(&native)?;
        self.routes
            .reconcile(&native, &adapter.interface.table, &live, &mut adapter.routes)
    }

    /// Undo a partial start; failures are only logged
    fn rollback(&self, adapter: &mut Adapter) {
        self.set_state(adapter, AdapterState::RollingBack);
        let native = adapter.native().to_string();
        log::warn!("Rolling back {}", native);

        let mut teardown = Teardown::default();
        if let Some(entry) = adapter.dns.take() {
            teardown.record("DNS removal", self.dns.unset(&entry));
        }
        teardown.record("interface down", self.platform.down(&native));
        teardown.record("interface removal", self.platform.delete(&native));
        adapter.interface.up = false;
        if let Some(peer) = adapter.gateway_peer.take() {
            teardown.record("gateway reset", self.gateway.reset_default_gateway_peer(&peer));
        }
        teardown.record("routing release", self.routes.release(&native, &mut adapter.routes));
        teardown.record("name release", self.allocator.release(adapter.name()));

        self.set_state(adapter, AdapterState::Closed);
    }

    /// Take a tunnel down
    ///
    /// Every stage runs even if an earlier one failed; the first failure is
    /// returned.
    pub fn stop(&self, mut adapter: Adapter) -> Result<()> {
        self.set_state(&mut adapter, AdapterState::Disconnecting);
        let native = adapter.native().to_string();
        let mut teardown = Teardown::default();

        if let Some(entry) = adapter.dns.take() {
            teardown.record("DNS removal", self.dns.unset(&entry));
        }
        if let Some(configuration) = adapter.configuration.as_ref() {
            let env = hook_environment(configuration, Some(&adapter.interface));
            teardown.record(
                "pre-down hooks",
                run_hooks(&self.commands, &configuration.interface.pre_down, env),
            );
        }

        teardown.record("interface down", self.platform.down(&native));
        teardown.record("interface removal", self.platform.delete(&native));
        adapter.interface.up = false;

        if let Some(peer) = adapter.gateway_peer.take() {
            teardown.record("gateway reset", self.gateway.reset_default_gateway_peer(&peer));
        }
        teardown.record("routing release", self.routes.release(&native, &mut adapter.routes));
        teardown.record("name release", self.allocator.release(adapter.name()));

        if let Some(configuration) = adapter.configuration.as_ref() {
            let env = hook_environment(configuration, Some(&adapter.interface));
            teardown.record(
                "post-down hooks",
                run_hooks(&self.commands, &configuration.interface.post_down, env),
            );
        }

        self.set_state(&mut adapter, AdapterState::Closed);
        self.handler.on_event(LifecycleEvent::Disconnected {
            name: adapter.name().to_string(),
        });
        teardown.into_result()
    }

    /// Replace the interface configuration (`setconf`)
    pub fn reconfigure(&self, adapter: &mut Adapter, configuration: VpnConfiguration) -> Result<()> {
        self.update(adapter, configuration, ApplyMode::Set)
    }

    /// Add peers to the interface (`addconf`)
    pub fn append(&self, adapter: &mut Adapter, configuration: VpnConfiguration) -> Result<()> {
        self.update(adapter, configuration, ApplyMode::Add)
    }

    /// Converge the interface on a configuration without disturbing live sessions (`syncconf`)
    pub fn sync(&self, adapter: &mut Adapter, configuration: VpnConfiguration) -> Result<()> {
        self.update(adapter, configuration, ApplyMode::Sync)
    }

    fn update(
        &self,
        adapter: &mut Adapter,
        configuration: VpnConfiguration,
        mode: ApplyMode,
    ) -> Result<()> {
        configuration.validate()?;
        let native = adapter.native().to_string();
        log::info!("Updating {} with {}", native, mode.subcommand());

        let conf = self.render(&configuration, adapter.gateway_peer.as_ref())?;
        self.backend.apply(&native, &conf, mode)?;

        let configuration = match (mode, adapter.configuration.take()) {
            (ApplyMode::Add, Some(mut current)) => {
                for peer in configuration.peers {
                    if !current.peers.contains(&peer) {
                        current.peers.push(peer);
                    }
                }
                current
            }
            _ => configuration,
        };
        adapter.configuration = Some(configuration);
        self.reconcile(adapter)
    }

    /// Tunnels currently on the host
    pub fn adapters(&self) -> Result<Vec<Adapter>> {
        let mut adapters = Vec::new();
        for native in self.platform.interfaces()? {
            if self.backend.public_key(&native)?.is_some() {
                adapters.push(self.attach(&native)?);
            }
        }
        Ok(adapters)
    }

    /// Attach to an existing tunnel by friendly or native name
    pub fn adapter(&self, name: &str) -> Result<Adapter> {
        let native = self
            .names
            .native_of(name)?
            .unwrap_or_else(|| name.to_string());
        if !self.platform.exists(&native)? {
            return Err(wgk_tun::Error::DeviceNotFound(name.to_string()).into());
        }
        self.attach(&native)
    }

    fn attach(&self, native: &str) -> Result<Adapter> {
        let name = self
            .names
            .friendly_of(native)?
            .unwrap_or_else(|| native.to_string());
        let info = self.backend.information(native)?;

        let gateway_peer = info
            .peers
            .iter()
            .filter(|p| p.endpoint.is_some())
            .map(peer_from_information)
            .find(|p| self.is_gateway_peer(p));
        if let Some(ref peer) = gateway_peer {
            if let Err(e) = self.gateway.adopt(peer) {
                log::warn!("Cannot take over gateway route of {}: {}", name, e);
            }
        }
        let peer = gateway_peer
            .as_ref()
            .map(|p| p.public_key.clone())
            .or_else(|| {
                info.peers
                    .iter()
                    .find(|p| p.endpoint.is_some())
                    .map(|p| p.public_key.clone())
            });

        self.ensure_dns()?;
        let dns = self.dns.entries()?.into_iter().find(|e| e.iface == native);

        // With a mark set, live default routes already sit in the policy table
        let mut policy_routes: Vec<IpNet> = Vec::new();
        if info.fwmark.is_some() {
            for ip in info.peers.iter().flat_map(|p| p.allowed_ips.iter()) {
                if let Ok(net) = parse_route(ip) {
                    if net.prefix_len() == 0 && !policy_routes.contains(&net) {
                        policy_routes.push(net);
                    }
                }
            }
        }

        Ok(Adapter {
            interface: VirtualInterface {
                name,
                native: native.to_string(),
                mtu: None,
                peer,
                table: RouteTable::Auto,
                up: true,
                display_name: self.platform.display_name(native),
                mac: self.platform.mac_address(native),
            },
            configuration: None,
            state: AdapterState::Connected,
            routes: RouteState {
                installed: self.platform.installed_routes(native)?,
                policy_table: info.fwmark,
                policy_routes,
            },
            dns,
            gateway_peer,
        })
    }

    /// The backend's view of the interface
    pub fn information(&self, adapter: &Adapter) -> Result<InterfaceInformation> {
        self.backend.information(adapter.native())
    }

    /// Whether the tunnel's peer handshook within the handshake timeout
    pub fn is_alive(&self, adapter: &Adapter) -> Result<bool> {
        let peer = match adapter.interface.peer.clone() {
            Some(key) => key,
            None => match self.information(adapter)?.peers.first() {
                Some(p) => p.public_key.clone(),
                None => return Ok(false),
            },
        };
        Ok(match self.backend.latest_handshake(adapter.native(), &peer)? {
            Some(at) => epoch_secs().saturating_sub(at) < self.system.handshake_timeout,
            None => false,
        })
    }

    /// The adapter's configuration with peers as the interface has them now
    ///
    /// The default gateway peer keeps its configured allowed IPs.
    pub fn live_configuration(&self, adapter: &Adapter) -> Result<VpnConfiguration> {
        let mut configuration = adapter.configuration.clone().ok_or_else(|| {
            Error::ConfigurationInvalid(format!("no configuration known for {}", adapter.name()))
        })?;
        let info = self.information(adapter)?;

        let peers = info
            .peers
            .iter()
            .map(|live| {
                let mut peer = peer_from_information(live);
                if let Some(known) = configuration.peer(&live.public_key) {
                    peer.preshared_key = known.preshared_key.clone();
                    if peer.endpoint.is_none() {
                        peer.endpoint = known.endpoint.clone();
                    }
                    if adapter.gateway_peer.as_ref() == Some(known) {
                        peer.allowed_ips = known.allowed_ips.clone();
                    }
                }
                peer
            })
            .collect();
        configuration.peers = peers;
        if info.listen_port.is_some() {
            configuration.interface.listen_port = info.listen_port;
        }
        Ok(configuration)
    }
}
