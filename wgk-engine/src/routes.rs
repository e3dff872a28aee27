//! Route policy
//!
//! Decides which allowed IPs become routes, and installs them so that a
//! tunnel's default route never replaces the host's own: with the `auto`
//! table, `/0` routes are moved into a dedicated policy table selected by the
//! interface's firewall mark.

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use wgk_tun::platform::Platform;
use wgk_tun::route::{parse_route, sort_routes};
use wgk_tun::{RouteTable, POLICY_TABLE_BASE};

use crate::backend::Backend;
use crate::config::VpnPeer;
use crate::error::Result;

/// The full-tunnel route given to the default gateway peer
pub const DEFAULT_ROUTE: &str = "0.0.0.0/0";

/// Allowed IPs to configure for a peer
///
/// The default gateway peer gets [`DEFAULT_ROUTE`] only. For other peers,
/// entries covering one of `host_local` are dropped when `ignore_local` is
/// set (default routes excepted), then anything listed in `ignore` is dropped.
pub fn effective_allowed_ips(
    peer: &VpnPeer,
    is_gateway_peer: bool,
    host_local: &[IpAddr],
    ignore_local: bool,
    ignore: &[String],
) -> Vec<String> {
    if is_gateway_peer {
        return vec![DEFAULT_ROUTE.to_string()];
    }

    peer.allowed_ips
        .iter()
        .filter(|ip| {
            if !ignore_local {
                return true;
            }
            match parse_route(ip) {
                Ok(net) if net.prefix_len() > 0 => {
                    let local = host_local.iter().find(|a| net.contains(*a));
                    if let Some(addr) = local {
                        log::info!("Not routing {} as it covers local address {}", ip, addr);
                    }
                    local.is_none()
                }
                _ => true,
            }
        })
        .filter(|ip| {
            let ignored = ignore.iter().any(|i| i == *ip);
            if ignored {
                log::info!("Not routing {}, it is in the ignore list", ip);
            }
            !ignored
        })
        .cloned()
        .collect()
}

/// Routing state owned by one adapter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteState {
    /// Routes installed in the main table (or the configured table)
    pub installed: Vec<IpNet>,
    /// Table holding default routes, once one has been allocated
    pub policy_table: Option<u32>,
    /// Default routes living in the policy table
    pub policy_routes: Vec<IpNet>,
}

/// Installs and removes routes for an interface
pub struct RoutePolicy {
    platform: Arc<dyn Platform>,
    backend: Arc<dyn Backend>,
}

impl RoutePolicy {
    pub fn new(platform: Arc<dyn Platform>, backend: Arc<dyn Backend>) -> Self {
        Self { platform, backend }
    }

    /// Make the routes of `native` match the allowed IPs the backend reports
    pub fn reconcile(
        &self,
        native: &str,
        table: &RouteTable,
        live: &[String],
        state: &mut RouteState,
    ) -> Result<()> {
        if table.is_off() {
            log::debug!("Routing is off for {}", native);
            return Ok(());
        }

        let mut targets: Vec<IpNet> = Vec::new();
        for ip in live {
            match parse_route(ip) {
                Ok(net) if !targets.contains(&net) => targets.push(net),
                Ok(_) => {}
                Err(e) => log::warn!("Skipping route {}: {}", ip, e),
            }
        }
        sort_routes(&mut targets);

        let installed = self.platform.installed_routes(native)?;
        for route in &installed {
            let keep = targets.contains(route) && !(table.is_auto() && route.prefix_len() == 0);
            if !keep {
                self.platform.remove_route(native, route)?;
            }
        }

        if let Some(t) = state.policy_table {
            // Releasing flushes the whole table; what is still wanted is reinstalled below
            if state.policy_routes.iter().any(|r| !targets.contains(r)) {
                log::info!("Default route for {} withdrawn, releasing table {}", native, t);
                self.platform.release_policy_routing(native, t)?;
                state.policy_routes.clear();
            }
            let wants_policy = table.is_auto() && targets.iter().any(|r| r.prefix_len() == 0);
            if !wants_policy {
                log::info!("No default route left on {}, clearing fwmark {}", native, t);
                self.backend.set_fwmark(native, 0)?;
                state.policy_table = None;
            }
        }

        let mut now_installed = Vec::new();
        for route in targets {
            match table {
                RouteTable::Table(t) => {
                    self.platform.add_route(native, &route, Some(t.as_str()))?;
                    now_installed.push(route);
                }
                RouteTable::Auto if route.prefix_len() == 0 => {
                    if !state.policy_routes.contains(&route) {
                        let t = self.policy_table(native, state)?;
                        log::info!("Routing {} for {} through table {}", route, native, t);
                        self.platform.install_policy_route(native, &route, t)?;
                        state.policy_routes.push(route);
                    }
                }
                _ => {
                    if !installed.contains(&route) {
                        self.platform.add_route(native, &route, None)?;
                    }
                    now_installed.push(route);
                }
            }
        }
        state.installed = now_installed;
        Ok(())
    }

    /// The interface's policy table, allocating one and marking the interface if needed
    fn policy_table(&self, native: &str, state: &mut RouteState) -> Result<u32> {
        if let Some(t) = state.policy_table {
            return Ok(t);
        }
        let table = match self.backend.fwmark(native)? {
            Some(mark) => mark,
            None => {
                let t = self.platform.free_policy_table(POLICY_TABLE_BASE)?;
                self.backend.set_fwmark(native, t)?;
                t
            }
        };
        state.policy_table = Some(table);
        Ok(table)
    }

    /// Remove the policy rules and firewall marks of an interface
    pub fn release(&self, native: &str, state: &mut RouteState) -> Result<()> {
        if let Some(t) = state.policy_table.take() {
            state.policy_routes.clear();
            self.platform.release_policy_routing(native, t)?;
        }
        state.installed.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::PEER;
    use crate::testing::{FakeBackend, FakePlatform};

    fn locals(addrs: &[&str]) -> Vec<IpAddr> {
        addrs.iter().map(|a| a.parse().unwrap()).collect()
    }

    fn routes(state: &RouteState) -> Vec<String> {
        state.installed.iter().map(|r| r.to_string()).collect()
    }

    #[test]
    fn test_local_ranges_filtered() {
        let peer = VpnPeer::new(PEER).with_allowed_ips(["10.0.0.0/24", "192.168.7.0/24"]);
        let local = locals(&["10.0.0.5"]);
        assert_eq!(
            effective_allowed_ips(&peer, false, &local, true, &[]),
            vec!["192.168.7.0/24"]
        );
        assert_eq!(
            effective_allowed_ips(&peer, false, &local, false, &[]),
            vec!["10.0.0.0/24", "192.168.7.0/24"]
        );
    }

    #[test]
    fn test_default_route_exempt_and_ignore_list() {
        let peer = VpnPeer::new(PEER).with_allowed_ips(["0.0.0.0/0", "fd00::/64", "10.9.0.0/16"]);
        let local = locals(&["192.168.1.10", "fd00::10"]);
        let ignore = vec!["10.9.0.0/16".to_string()];
        assert_eq!(
            effective_allowed_ips(&peer, false, &local, true, &ignore),
            vec!["0.0.0.0/0"]
        );
    }

    #[test]
    fn test_gateway_peer_gets_default_route() {
        let peer = VpnPeer::new(PEER).with_allowed_ips(["10.8.0.0/24"]);
        assert_eq!(
            effective_allowed_ips(&peer, true, &[], true, &[]),
            vec!["0.0.0.0/0"]
        );
    }

    fn policy(platform: FakePlatform) -> (Arc<FakePlatform>, Arc<FakeBackend>, RoutePolicy) {
        let platform = Arc::new(platform.with_link("wg0"));
        let backend = Arc::new(FakeBackend::new());
        let p = RoutePolicy::new(platform.clone(), backend.clone());
        (platform, backend, p)
    }

    fn ips(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_reconcile_installs_sorted_routes() {
        let (platform, _, p) = policy(FakePlatform::new("wg"));
        let mut state = RouteState::default();
        p.reconcile("wg0", &RouteTable::Auto, &ips(&["10.8.0.0/16", "10.8.1.0/24"]), &mut state)
            .unwrap();
        assert_eq!(
            platform.calls(),
            vec!["route-add wg0 10.8.1.0/24", "route-add wg0 10.8.0.0/16"]
        );
        assert_eq!(routes(&state), vec!["10.8.1.0/24", "10.8.0.0/16"]);

        p.reconcile("wg0", &RouteTable::Auto, &ips(&["10.8.0.0/16"]), &mut state)
            .unwrap();
        assert_eq!(platform.count("route-del wg0 10.8.1.0/24"), 1);
        assert_eq!(platform.count("route-add"), 2);
        assert_eq!(routes(&state), vec!["10.8.0.0/16"]);
    }

    #[test]
    fn test_default_route_goes_to_policy_table() {
        let (platform, backend, p) = policy(FakePlatform::new("wg").with_busy_table(51820));
        let mut state = RouteState::default();
        p.reconcile("wg0", &RouteTable::Auto, &ips(&["0.0.0.0/0", "10.8.0.0/24"]), &mut state)
            .unwrap();

        assert_eq!(state.policy_table, Some(51821));
        assert_eq!(backend.fwmark("wg0").unwrap(), Some(51821));
        assert_eq!(platform.policy_routes(51821).len(), 1);
        assert!(!platform.link("wg0").unwrap().routes.iter().any(|r| r.prefix_len() == 0));

        // Second pass keeps the policy route as it is
        p.reconcile("wg0", &RouteTable::Auto, &ips(&["0.0.0.0/0", "10.8.0.0/24"]), &mut state)
            .unwrap();
        assert_eq!(platform.count("policy-add"), 1);

        p.release("wg0", &mut state).unwrap();
        assert_eq!(state.policy_table, None);
        assert_eq!(platform.count("policy-release wg0 51821"), 1);
    }

    #[test]
    fn test_withdrawing_one_default_route_keeps_the_other() {
        let (platform, backend, p) = policy(FakePlatform::new("wg"));
        let mut state = RouteState::default();
        p.reconcile("wg0", &RouteTable::Auto, &ips(&["0.0.0.0/0", "::/0"]), &mut state)
            .unwrap();
        assert_eq!(platform.policy_routes(51820).len(), 2);

        p.reconcile("wg0", &RouteTable::Auto, &ips(&["0.0.0.0/0"]), &mut state)
            .unwrap();
        let left: Vec<String> = platform
            .policy_routes(51820)
            .iter()
            .map(|(_, r)| r.to_string())
            .collect();
        assert_eq!(left, vec!["0.0.0.0/0"]);
        assert_eq!(state.policy_table, Some(51820));
        assert_eq!(state.policy_routes.len(), 1);
        assert_eq!(backend.fwmark("wg0").unwrap(), Some(51820));
        assert_eq!(platform.count("policy-release wg0 51820"), 1);

        p.reconcile("wg0", &RouteTable::Auto, &ips(&["10.8.0.0/24"]), &mut state)
            .unwrap();
        assert!(platform.policy_routes(51820).is_empty());
        assert_eq!(platform.count("policy-release wg0 51820"), 2);
        assert_eq!(state.policy_table, None);
        assert!(state.policy_routes.is_empty());
        assert_eq!(backend.fwmark("wg0").unwrap(), None);

        // Nothing is left to release at teardown
        p.release("wg0", &mut state).unwrap();
        assert_eq!(platform.count("policy-release"), 2);
    }

    #[test]
    fn test_existing_fwmark_is_reused() {
        let (platform, backend, p) = policy(FakePlatform::new("wg"));
        backend.set_fwmark("wg0", 4242).unwrap();
        let mut state = RouteState::default();
        p.reconcile("wg0", &RouteTable::Auto, &ips(&["0.0.0.0/0"]), &mut state)
            .unwrap();
        assert_eq!(state.policy_table, Some(4242));
        assert_eq!(platform.policy_routes(4242).len(), 1);
    }

    #[test]
    fn test_table_off_and_named_table() {
        let (platform, _, p) = policy(FakePlatform::new("wg"));
        let mut state = RouteState::default();
        p.reconcile("wg0", &RouteTable::Off, &ips(&["10.8.0.0/24"]), &mut state)
            .unwrap();
        assert!(platform.calls().is_empty());

        p.reconcile(
            "wg0",
            &RouteTable::Table("1234".into()),
            &ips(&["0.0.0.0/0"]),
            &mut state,
        )
        .unwrap();
        assert_eq!(platform.calls(), vec!["route-add wg0 0.0.0.0/0 table 1234"]);
        assert_eq!(state.policy_table, None);
    }
}
