//! In-memory platform, backend and DNS used by the engine's tests

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use ipnet::IpNet;
use parking_lot::Mutex;
use wgk_tun::platform::Platform;
use wgk_tun::route::Gateway;

use crate::backend::{ApplyMode, Backend, InterfaceInformation, PeerInformation};
use crate::dns::{DnsEntry, DnsProvider};
use crate::error::{Error, Result};

fn failure(op: &str) -> wgk_tun::Error {
    wgk_tun::Error::CommandFailed {
        command: op.to_string(),
        code: 1,
        message: "scripted failure".into(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeLink {
    pub addresses: Vec<String>,
    pub up: bool,
    pub mtu: Option<u32>,
    pub routes: Vec<IpNet>,
}

#[derive(Default)]
struct PlatformState {
    links: BTreeMap<String, FakeLink>,
    gateway: Option<Gateway>,
    host_routes: Vec<IpAddr>,
    local: Vec<IpAddr>,
    policy: BTreeMap<u32, Vec<(String, IpNet)>>,
    busy_tables: BTreeSet<u32>,
    next_native: u32,
    calls: Vec<String>,
    failing: BTreeSet<String>,
}

/// Platform keeping interfaces and routes in memory
pub struct FakePlatform {
    prefix: String,
    free_names: bool,
    state: Mutex<PlatformState>,
}

impl FakePlatform {
    /// Platform where we pick interface names
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            free_names: true,
            state: Mutex::new(PlatformState::default()),
        }
    }

    /// Platform that hands out `utunN` names itself
    pub fn assigned_names(prefix: &str, first: u32) -> Self {
        let p = Self {
            prefix: prefix.to_string(),
            free_names: false,
            state: Mutex::new(PlatformState::default()),
        };
        p.state.lock().next_native = first;
        p
    }

    pub fn with_link(self, native: &str) -> Self {
        self.state
            .lock()
            .links
            .insert(native.to_string(), FakeLink::default());
        self
    }

    pub fn with_gateway(self, address: &str, interface: &str) -> Self {
        self.state.lock().gateway = Some(Gateway {
            interface: interface.to_string(),
            address: address.parse().unwrap(),
        });
        self
    }

    pub fn with_local(self, address: &str) -> Self {
        self.state.lock().local.push(address.parse().unwrap());
        self
    }

    pub fn with_busy_table(self, table: u32) -> Self {
        self.state.lock().busy_tables.insert(table);
        self
    }

    /// Make an operation (`create`, `up`, `down`, `delete`, ...) fail
    pub fn fail(&self, op: &str) {
        self.state.lock().failing.insert(op.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn link(&self, native: &str) -> Option<FakeLink> {
        self.state.lock().links.get(native).cloned()
    }

    pub fn host_routes(&self) -> Vec<IpAddr> {
        self.state.lock().host_routes.clone()
    }

    pub fn policy_routes(&self, table: u32) -> Vec<(String, IpNet)> {
        self.state.lock().policy.get(&table).cloned().unwrap_or_default()
    }

    fn record(&self, call: String) -> wgk_tun::Result<()> {
        let mut state = self.state.lock();
        let op = call.split(' ').next().unwrap_or_default().to_string();
        state.calls.push(call);
        if state.failing.contains(&op) {
            return Err(failure(&op));
        }
        Ok(())
    }

    fn with_link_mut<F>(&self, native: &str, f: F) -> wgk_tun::Result<()>
    where
        F: FnOnce(&mut FakeLink),
    {
        let mut state = self.state.lock();
        let link = state
            .links
            .get_mut(native)
            .ok_or_else(|| wgk_tun::Error::DeviceNotFound(native.to_string()))?;
        f(link);
        Ok(())
    }
}

impl Platform for FakePlatform {
    fn interface_prefix(&self) -> &str {
        &self.prefix
    }

    fn names_freely_chosen(&self) -> bool {
        self.free_names
    }

    fn interfaces(&self) -> wgk_tun::Result<Vec<String>> {
        Ok(self.state.lock().links.keys().cloned().collect())
    }

    fn create(&self, name: &str) -> wgk_tun::Result<String> {
        self.record(format!("create {}", name))?;
        let mut state = self.state.lock();
        let native = if self.free_names {
            name.to_string()
        } else {
            let n = format!("utun{}", state.next_native);
            state.next_native += 1;
            n
        };
        state.links.insert(native.clone(), FakeLink::default());
        Ok(native)
    }

    fn delete(&self, native: &str) -> wgk_tun::Result<()> {
        self.record(format!("delete {}", native))?;
        self.state.lock().links.remove(native);
        Ok(())
    }

    fn set_addresses(&self, native: &str, addresses: &[String]) -> wgk_tun::Result<()> {
        self.record(format!("addresses {} {}", native, addresses.join(",")))?;
        self.with_link_mut(native, |l| l.addresses = addresses.to_vec())
    }

    fn up(&self, native: &str, mtu: Option<u32>) -> wgk_tun::Result<u32> {
        let mtu = mtu.unwrap_or(1420);
        self.record(format!("up {} {}", native, mtu))?;
        self.with_link_mut(native, |l| {
            l.up = true;
            l.mtu = Some(mtu);
        })?;
        Ok(mtu)
    }

    fn down(&self, native: &str) -> wgk_tun::Result<()> {
        self.record(format!("down {}", native))?;
        self.with_link_mut(native, |l| {
            l.up = false;
            l.routes.clear();
        })
    }

    fn default_gateway(&self) -> wgk_tun::Result<Option<Gateway>> {
        Ok(self.state.lock().gateway.clone())
    }

    fn add_host_route(&self, address: IpAddr, gateway: &Gateway) -> wgk_tun::Result<()> {
        self.record(format!("hostroute-add {} {}", address, gateway.address))?;
        self.state.lock().host_routes.push(address);
        Ok(())
    }

    fn remove_host_route(&self, address: IpAddr, gateway: &Gateway) -> wgk_tun::Result<()> {
        self.record(format!("hostroute-del {} {}", address, gateway.address))?;
        self.state.lock().host_routes.retain(|a| *a != address);
        Ok(())
    }

    fn installed_routes(&self, native: &str) -> wgk_tun::Result<Vec<IpNet>> {
        Ok(self
            .state
            .lock()
            .links
            .get(native)
            .map(|l| l.routes.clone())
            .unwrap_or_default())
    }

    fn add_route(&self, native: &str, route: &IpNet, table: Option<&str>) -> wgk_tun::Result<()> {
        match table {
            Some(t) => self.record(format!("route-add {} {} table {}", native, route, t))?,
            None => self.record(format!("route-add {} {}", native, route))?,
        }
        if table.is_none() {
            self.with_link_mut(native, |l| l.routes.push(*route))?;
        }
        Ok(())
    }

    fn remove_route(&self, native: &str, route: &IpNet) -> wgk_tun::Result<()> {
        self.record(format!("route-del {} {}", native, route))?;
        self.with_link_mut(native, |l| l.routes.retain(|r| r != route))
    }

    fn free_policy_table(&self, base: u32) -> wgk_tun::Result<u32> {
        let state = self.state.lock();
        let mut table = base;
        while state.busy_tables.contains(&table) || state.policy.contains_key(&table) {
            table += 1;
        }
        Ok(table)
    }

    fn install_policy_route(&self, native: &str, route: &IpNet, table: u32) -> wgk_tun::Result<()> {
        self.record(format!("policy-add {} {} {}", native, route, table))?;
        let mut state = self.state.lock();
        let routes = state.policy.entry(table).or_default();
        // Same answer as the kernel for a route that is already in the table
        if routes.iter().any(|(_, r)| r == route) {
            return Err(wgk_tun::Error::CommandFailed {
                command: format!("ip route add {} dev {} table {}", route, native, table),
                code: 2,
                message: "RTNETLINK answers: File exists".into(),
            });
        }
        routes.push((native.to_string(), *route));
        Ok(())
    }

    fn release_policy_routing(&self, native: &str, table: u32) -> wgk_tun::Result<()> {
        self.record(format!("policy-release {} {}", native, table))?;
        // Rules and the table's routes go together
        self.state.lock().policy.remove(&table);
        Ok(())
    }

    fn local_addresses(&self) -> wgk_tun::Result<Vec<IpAddr>> {
        Ok(self.state.lock().local.clone())
    }

    fn mac_address(&self, _native: &str) -> Option<String> {
        None
    }
}

#[derive(Default)]
struct BackendState {
    key_pairs: BTreeMap<String, String>,
    keys: BTreeMap<String, String>,
    peers: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    handshakes: BTreeMap<(String, String), u64>,
    fwmarks: BTreeMap<String, u32>,
    applied: Vec<(String, String, ApplyMode)>,
    handshake_on_probe: bool,
    failing: BTreeSet<String>,
    probes: usize,
}

/// Backend keeping interface state in memory
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<BackendState>,
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interfaces configured with `private` report `public` as their key
    pub fn with_key_pair(self, private: &str, public: &str) -> Self {
        self.state
            .lock()
            .key_pairs
            .insert(private.to_string(), public.to_string());
        self
    }

    /// Pretend `native` is already configured with `public`
    pub fn with_bound(self, native: &str, public: &str) -> Self {
        self.state
            .lock()
            .keys
            .insert(native.to_string(), public.to_string());
        self
    }

    /// Every handshake probe reports a handshake happening now
    pub fn handshaking(self) -> Self {
        self.state.lock().handshake_on_probe = true;
        self
    }

    pub fn set_handshake(&self, native: &str, peer: &str, at: u64) {
        self.state
            .lock()
            .handshakes
            .insert((native.to_string(), peer.to_string()), at);
    }

    pub fn fail(&self, op: &str) {
        self.state.lock().failing.insert(op.to_string());
    }

    pub fn applied(&self) -> Vec<(String, String, ApplyMode)> {
        self.state.lock().applied.clone()
    }

    pub fn probes(&self) -> usize {
        self.state.lock().probes
    }

    pub fn peer_allowed_ips(&self, native: &str, peer: &str) -> Vec<String> {
        self.state
            .lock()
            .peers
            .get(native)
            .and_then(|p| p.get(peer).cloned())
            .unwrap_or_default()
    }

    fn check(&self, op: &str) -> Result<()> {
        if self.state.lock().failing.contains(op) {
            return Err(failure(op).into());
        }
        Ok(())
    }
}

/// `(private key, [(peer, allowed ips)])` from a rendered configuration
fn parse_conf(conf: &str) -> (Option<String>, Vec<(String, Vec<String>)>) {
    let mut private = None;
    let mut peers: Vec<(String, Vec<String>)> = Vec::new();
    for line in conf.lines() {
        let Some((key, value)) = line.split_once(" = ") else {
            continue;
        };
        match key {
            "PrivateKey" => private = Some(value.to_string()),
            "PublicKey" => peers.push((value.to_string(), Vec::new())),
            "AllowedIPs" => {
                if let Some(last) = peers.last_mut() {
                    last.1 = value.split(", ").map(str::to_string).collect();
                }
            }
            _ => {}
        }
    }
    (private, peers)
}

impl Backend for FakeBackend {
    fn apply(&self, native: &str, conf: &str, mode: ApplyMode) -> Result<()> {
        self.check("apply")?;
        let (private, peers) = parse_conf(conf);
        let mut state = self.state.lock();
        state.applied.push((native.to_string(), conf.to_string(), mode));
        if let Some(public) = private.and_then(|p| state.key_pairs.get(&p).cloned()) {
            state.keys.insert(native.to_string(), public);
        }
        let live = state.peers.entry(native.to_string()).or_default();
        if mode != ApplyMode::Add {
            live.clear();
        }
        live.extend(peers);
        Ok(())
    }

    fn public_key(&self, native: &str) -> Result<Option<String>> {
        Ok(self.state.lock().keys.get(native).cloned())
    }

    fn latest_handshake(&self, native: &str, peer: &str) -> Result<Option<u64>> {
        self.check("handshake")?;
        let mut state = self.state.lock();
        state.probes += 1;
        if state.handshake_on_probe {
            return Ok(Some(now()));
        }
        Ok(state
            .handshakes
            .get(&(native.to_string(), peer.to_string()))
            .copied())
    }

    fn allowed_ips(&self, native: &str) -> Result<Vec<String>> {
        let mut ips: Vec<String> = Vec::new();
        if let Some(peers) = self.state.lock().peers.get(native) {
            for ip in peers.values().flatten() {
                if !ips.contains(ip) {
                    ips.push(ip.clone());
                }
            }
        }
        Ok(ips)
    }

    fn set_allowed_ips(&self, native: &str, peer: &str, ips: &[String]) -> Result<()> {
        self.check("set_allowed_ips")?;
        self.state
            .lock()
            .peers
            .entry(native.to_string())
            .or_default()
            .insert(peer.to_string(), ips.to_vec());
        Ok(())
    }

    fn fwmark(&self, native: &str) -> Result<Option<u32>> {
        Ok(self.state.lock().fwmarks.get(native).copied())
    }

    fn set_fwmark(&self, native: &str, mark: u32) -> Result<()> {
        self.check("fwmark")?;
        let mut state = self.state.lock();
        if mark == 0 {
            state.fwmarks.remove(native);
        } else {
            state.fwmarks.insert(native.to_string(), mark);
        }
        Ok(())
    }

    fn information(&self, native: &str) -> Result<InterfaceInformation> {
        let state = self.state.lock();
        let peers = state
            .peers
            .get(native)
            .ok_or_else(|| Error::Tun(wgk_tun::Error::DeviceNotFound(native.to_string())))?;
        Ok(InterfaceInformation {
            public_key: state.keys.get(native).cloned(),
            listen_port: None,
            fwmark: state.fwmarks.get(native).copied(),
            peers: peers
                .iter()
                .map(|(key, ips)| PeerInformation {
                    public_key: key.clone(),
                    allowed_ips: ips.clone(),
                    latest_handshake: state
                        .handshakes
                        .get(&(native.to_string(), key.clone()))
                        .copied(),
                    ..Default::default()
                })
                .collect(),
        })
    }
}

/// DNS provider remembering what was applied
#[derive(Default)]
pub struct MemoryDns {
    entries: Mutex<Vec<DnsEntry>>,
}

impl DnsProvider for MemoryDns {
    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn entries(&self) -> Result<Vec<DnsEntry>> {
        Ok(self.entries.lock().clone())
    }

    fn set(&self, entry: &DnsEntry) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.retain(|e| e.iface != entry.iface);
        entries.push(entry.clone());
        Ok(())
    }

    fn unset(&self, entry: &DnsEntry) -> Result<()> {
        self.entries.lock().retain(|e| e.iface != entry.iface);
        Ok(())
    }
}
