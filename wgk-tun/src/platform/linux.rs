//! Linux interface control through iproute2
//!
//! Interfaces are kernel WireGuard links (`ip link add ... type wireguard`),
//! so names are chosen by us. Default routes are policy routed: the `/0`
//! route goes into its own table, tunnel traffic is tagged with a firewall
//! mark equal to the table number, and `suppress_prefixlength 0` keeps the
//! main table's default route from winning for everything else.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::{Error, Result};
use crate::exec::SystemCommands;
use crate::firewall::{Family, MarkFirewall};
use crate::platform::{host_addresses, token_after, Platform, FALLBACK_MTU, WIREGUARD_OVERHEAD};
use crate::route::{family_flag, parse_route_lines, Gateway};

/// Default interface prefix on Linux
pub const DEFAULT_PREFIX: &str = "wg";

/// Upper bound on rule deletions per table, in case `ip rule delete` keeps failing
const MAX_RULE_DELETES: usize = 64;

/// Smallest MTU an IPv4 host must accept
const MIN_TUNNEL_MTU: u32 = 576;

/// Linux [`Platform`]
pub struct LinuxPlatform {
    commands: SystemCommands,
    prefix: String,
    firewall: MarkFirewall,
}

impl LinuxPlatform {
    /// Create the platform; `wg_tool` is unused on Linux since links are made with `ip`
    pub fn new(commands: SystemCommands, _wg_tool: &str) -> Self {
        Self {
            firewall: MarkFirewall::new(commands.clone()),
            commands,
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }

    /// Use a different prefix for allocated interface names
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn root(&self) -> SystemCommands {
        self.commands.privileged().logged()
    }

    /// MTU of the device carrying the default route, minus WireGuard overhead
    pub fn detect_mtu(&self) -> u32 {
        let device = self
            .commands
            .silent_output(&["ip", "route", "show", "default"])
            .first()
            .and_then(|l| token_after(l, "dev").map(str::to_string));

        let link_mtu = device.and_then(|dev| {
            self.commands
                .silent_output(&["ip", "link", "show", "dev", dev.as_str()])
                .first()
                .and_then(|l| token_after(l, "mtu").and_then(|m| m.parse::<u32>().ok()))
        });

        match link_mtu.map(|m| m.saturating_sub(WIREGUARD_OVERHEAD)) {
            Some(mtu) if mtu >= MIN_TUNNEL_MTU => mtu,
            Some(mtu) => {
                log::warn!("Default route device leaves a tunnel MTU of {}, ignoring it", mtu);
                FALLBACK_MTU - WIREGUARD_OVERHEAD
            }
            None => FALLBACK_MTU - WIREGUARD_OVERHEAD,
        }
    }

    /// Tunnel addresses of the interface, from `ip -o addr show`
    fn interface_addresses(&self, native: &str, proto: &str) -> Vec<IpAddr> {
        self.commands
            .silent_output(&["ip", "-o", proto, "addr", "show", "dev", native])
            .iter()
            .filter_map(|l| {
                token_after(l, "inet")
                    .or_else(|| token_after(l, "inet6"))
                    .and_then(|a| a.split('/').next())
                    .and_then(|a| a.parse().ok())
            })
            .collect()
    }

    fn delete_rules_matching<F>(&self, proto: &str, matches: F, delete: &[&str])
    where
        F: Fn(&str) -> bool,
    {
        for _ in 0..MAX_RULE_DELETES {
            let found = self
                .commands
                .silent_output(&["ip", proto, "rule", "show"])
                .iter()
                .any(|l| matches(l));
            if !found {
                return;
            }
            let mut args = vec!["ip", proto, "rule", "delete"];
            args.extend_from_slice(delete);
            match self.root().result(&args) {
                Ok(0) => {}
                Ok(code) => {
                    log::warn!("`{}` exited with {}", args.join(" "), code);
                    return;
                }
                Err(e) => {
                    log::warn!("Failed to delete rule: {}", e);
                    return;
                }
            }
        }
    }
}

fn is_up(name: &str) -> bool {
    std::fs::read_to_string(format!("/sys/class/net/{}/flags", name))
        .ok()
        .and_then(|s| u32::from_str_radix(s.trim().trim_start_matches("0x"), 16).ok())
        .map(|flags| (flags & libc::IFF_UP as u32) != 0)
        .unwrap_or(true)
}

/// Interface name from an `ip -o link show` line such as `5: wg0: <...> mtu 1420`
fn link_name(line: &str) -> Option<String> {
    let name = line.split(':').nth(1)?.trim();
    let name = name.split('@').next()?;
    (!name.is_empty()).then(|| name.to_string())
}

impl Platform for LinuxPlatform {
    fn interface_prefix(&self) -> &str {
        &self.prefix
    }

    fn interfaces(&self) -> Result<Vec<String>> {
        Ok(self
            .commands
            .output(&["ip", "-o", "link", "show", "type", "wireguard"])?
            .iter()
            .filter_map(|l| link_name(l))
            .collect())
    }

    fn exists(&self, native: &str) -> Result<bool> {
        Ok(self.commands.result(&["ip", "link", "show", "dev", native])? == 0)
    }

    fn create(&self, name: &str) -> Result<String> {
        self.root()
            .run(&["ip", "link", "add", "dev", name, "type", "wireguard"])?;
        log::info!("Created {}", name);
        Ok(name.to_string())
    }

    fn delete(&self, native: &str) -> Result<()> {
        self.root().run(&["ip", "link", "del", "dev", native])
    }

    fn set_addresses(&self, native: &str, addresses: &[String]) -> Result<()> {
        self.root().run(&["ip", "address", "flush", "dev", native])?;
        for address in addresses {
            let proto = if address.contains(':') { "-6" } else { "-4" };
            self.root()
                .run(&["ip", proto, "address", "add", address.as_str(), "dev", native])?;
        }
        Ok(())
    }

    fn up(&self, native: &str, mtu: Option<u32>) -> Result<u32> {
        let mtu = mtu.filter(|m| *m > 0).unwrap_or_else(|| self.detect_mtu());
        let mtu_str = mtu.to_string();
        self.root()
            .run(&["ip", "link", "set", "mtu", mtu_str.as_str(), "up", "dev", native])?;
        Ok(mtu)
    }

    fn down(&self, native: &str) -> Result<()> {
        if let Err(e) = self.firewall.remove(native) {
            log::warn!("Failed to remove firewall rules for {}: {}", native, e);
        }
        for route in self.installed_routes(native)? {
            self.remove_route(native, &route)?;
        }
        self.root().run(&["ip", "link", "set", "down", "dev", native])
    }

    fn default_gateway(&self) -> Result<Option<Gateway>> {
        for line in self.commands.output(&["ip", "route"])? {
            if !line.starts_with("default ") {
                continue;
            }
            let address = token_after(&line, "via").and_then(|a| a.parse::<IpAddr>().ok());
            let interface = token_after(&line, "dev");
            if let (Some(address), Some(interface)) = (address, interface) {
                return Ok(Some(Gateway {
                    interface: interface.to_string(),
                    address,
                }));
            }
        }
        Ok(None)
    }

    fn add_host_route(&self, address: IpAddr, gateway: &Gateway) -> Result<()> {
        let dest = IpNet::from(address).to_string();
        let via = gateway.address.to_string();
        self.root().run(&[
            "ip",
            family_flag(&IpNet::from(address)),
            "route",
            "add",
            dest.as_str(),
            "via",
            via.as_str(),
            "dev",
            gateway.interface.as_str(),
        ])
    }

    fn remove_host_route(&self, address: IpAddr, gateway: &Gateway) -> Result<()> {
        let dest = IpNet::from(address).to_string();
        let via = gateway.address.to_string();
        self.root().run(&[
            "ip",
            family_flag(&IpNet::from(address)),
            "route",
            "del",
            dest.as_str(),
            "via",
            via.as_str(),
            "dev",
            gateway.interface.as_str(),
        ])
    }

    fn installed_routes(&self, native: &str) -> Result<Vec<IpNet>> {
        let mut routes = Vec::new();
        for (proto, v6) in [("-4", false), ("-6", true)] {
            let lines: Vec<String> = self
                .commands
                .output(&["ip", proto, "route", "show", "dev", native])?
                .into_iter()
                .filter(|l| !l.contains("proto kernel"))
                .collect();
            routes.extend(parse_route_lines(&lines, v6));
        }
        Ok(routes)
    }

    fn add_route(&self, native: &str, route: &IpNet, table: Option<&str>) -> Result<()> {
        let dest = route.to_string();
        // Routes in other tables are not diffed, so replace keeps repeats harmless
        let verb = if table.is_some() { "replace" } else { "add" };
        let mut args = vec!["ip", family_flag(route), "route", verb, dest.as_str(), "dev", native];
        if let Some(table) = table {
            args.extend(["table", table]);
        }
        log::info!("Adding route {} to {}", dest, native);
        self.root().run(&args)
    }

    fn remove_route(&self, native: &str, route: &IpNet) -> Result<()> {
        let dest = route.to_string();
        log::info!("Removing route {} for {}", dest, native);
        self.root()
            .run(&["ip", family_flag(route), "route", "del", dest.as_str(), "dev", native])
    }

    fn free_policy_table(&self, base: u32) -> Result<u32> {
        let mut table = base;
        loop {
            let t = table.to_string();
            let used = ["-4", "-6"].iter().any(|proto| {
                !self
                    .commands
                    .silent_output(&["ip", proto, "route", "show", "table", t.as_str()])
                    .is_empty()
            });
            if !used {
                return Ok(table);
            }
            table = table
                .checked_add(1)
                .ok_or_else(|| Error::Route("no free policy routing table".into()))?;
        }
    }

    fn install_policy_route(&self, native: &str, route: &IpNet, table: u32) -> Result<()> {
        let proto = family_flag(route);
        let dest = route.to_string();
        let t = table.to_string();

        self.root().run(&[
            "ip", proto, "route", "add", dest.as_str(), "dev", native, "table", t.as_str(),
        ])?;
        self.root().run(&[
            "ip", proto, "rule", "add", "not", "fwmark", t.as_str(), "table", t.as_str(),
        ])?;
        self.root().run(&[
            "ip", proto, "rule", "add", "table", "main", "suppress_prefixlength", "0",
        ])?;

        let family = match route {
            IpNet::V4(_) => Family::V4,
            IpNet::V6(_) => Family::V6,
        };
        if family == Family::V4 {
            let code = self
                .root()
                .result(&["sysctl", "-q", "net.ipv4.conf.all.src_valid_mark=1"])?;
            if code != 0 {
                log::warn!("Could not enable src_valid_mark, return traffic may be dropped");
            }
        }

        let addresses = self.interface_addresses(native, proto);
        self.firewall.install(native, family, table, &addresses)
    }

    fn release_policy_routing(&self, native: &str, table: u32) -> Result<()> {
        let t = table.to_string();
        let firewall = self.firewall.remove(native);
        for proto in ["-4", "-6"] {
            self.delete_rules_matching(
                proto,
                |l| token_after(l, "lookup") == Some(t.as_str()),
                &["table", t.as_str()],
            );
            self.delete_rules_matching(
                proto,
                |l| l.contains("from all lookup main suppress_prefixlength 0"),
                &["table", "main", "suppress_prefixlength", "0"],
            );
            match self.root().result(&["ip", proto, "route", "flush", "table", t.as_str()]) {
                Ok(0) => {}
                Ok(code) => log::warn!("Flushing table {} ({}) exited with {}", t, proto, code),
                Err(e) => log::warn!("Failed to flush table {}: {}", t, e),
            }
        }
        firewall
    }

    fn local_addresses(&self) -> Result<Vec<IpAddr>> {
        host_addresses(is_up)
    }

    fn mac_address(&self, native: &str) -> Option<String> {
        let mac = std::fs::read_to_string(format!("/sys/class/net/{}/address", native)).ok()?;
        let mac = mac.trim();
        if mac.is_empty() || mac.chars().all(|c| c == '0' || c == ':') {
            None
        } else {
            Some(mac.to_ascii_uppercase())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedExecutor;
    use std::sync::Arc;

    fn platform() -> (Arc<ScriptedExecutor>, LinuxPlatform) {
        let exec = Arc::new(ScriptedExecutor::new());
        let p = LinuxPlatform::new(SystemCommands::new(exec.clone()), "wg");
        (exec, p)
    }

    #[test]
    fn test_link_name() {
        assert_eq!(
            link_name("5: wg0: <POINTOPOINT,NOARP,UP,LOWER_UP> mtu 1420 qdisc noqueue"),
            Some("wg0".to_string())
        );
        assert_eq!(link_name("7: veth1@if6: <BROADCAST> mtu 1500"), Some("veth1".to_string()));
        assert_eq!(link_name("garbage"), None);
    }

    #[test]
    fn test_detect_mtu_from_default_route() {
        let (exec, p) = platform();
        exec.respond("ip route show default", &["default via 192.168.1.1 dev eth0 proto dhcp"]);
        exec.respond(
            "ip link show dev eth0",
            &["2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 9000 qdisc fq_codel state UP"],
        );
        assert_eq!(p.detect_mtu(), 8920);
    }

    #[test]
    fn test_detect_mtu_falls_back() {
        let (_exec, p) = platform();
        assert_eq!(p.detect_mtu(), 1420);
    }

    #[test]
    fn test_detect_mtu_ignores_tiny_links() {
        let (exec, p) = platform();
        exec.respond("ip route show default", &["default dev ppp0 scope link"]);
        exec.respond("ip link show dev ppp0", &["4: ppp0: <POINTOPOINT,UP> mtu 60 qdisc fq"]);
        assert_eq!(p.detect_mtu(), 1420);

        exec.respond("ip link show dev ppp0", &["4: ppp0: <POINTOPOINT,UP> mtu 600 qdisc fq"]);
        assert_eq!(p.detect_mtu(), 1420);
    }

    #[test]
    fn test_default_gateway() {
        let (exec, p) = platform();
        exec.respond(
            "ip route",
            &[
                "10.8.0.0/24 dev wg0 scope link",
                "default via 192.168.1.1 dev eth0 proto dhcp metric 100",
            ],
        );
        let gw = p.default_gateway().unwrap().unwrap();
        assert_eq!(gw.interface, "eth0");
        assert_eq!(gw.address, "192.168.1.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_installed_routes_skip_kernel_routes() {
        let (exec, p) = platform();
        exec.respond(
            "ip -4 route show dev wg0",
            &["10.8.0.0/24 proto kernel scope link src 10.8.0.2", "10.9.0.0/16 scope link"],
        );
        exec.respond("ip -6 route show dev wg0", &["fd00:1::/64 metric 1024 pref medium"]);
        let routes: Vec<String> = p
            .installed_routes("wg0")
            .unwrap()
            .iter()
            .map(|r| r.to_string())
            .collect();
        assert_eq!(routes, vec!["10.9.0.0/16", "fd00:1::/64"]);
    }

    #[test]
    fn test_free_policy_table_skips_used_tables() {
        let (exec, p) = platform();
        exec.respond("ip -4 route show table 51820", &["default dev wg1 scope link"]);
        exec.respond("ip -6 route show table 51821", &["default dev wg2 metric 1024"]);
        assert_eq!(p.free_policy_table(51820).unwrap(), 51822);
    }

    #[test]
    fn test_install_policy_route_sequence() {
        let (exec, p) = platform();
        exec.fail("sh -c command -v nft", 1, "");
        exec.respond("ip -o -4 addr show dev wg0", &["9: wg0    inet 10.8.0.2/32 scope global wg0"]);

        let route: IpNet = "0.0.0.0/0".parse().unwrap();
        p.install_policy_route("wg0", &route, 51820).unwrap();

        let calls = exec.calls();
        let pos = |c: &str| calls.iter().position(|x| x == c).unwrap();
        let r = pos("ip -4 route add 0.0.0.0/0 dev wg0 table 51820");
        let a = pos("ip -4 rule add not fwmark 51820 table 51820");
        let b = pos("ip -4 rule add table main suppress_prefixlength 0");
        let s = pos("sysctl -q net.ipv4.conf.all.src_valid_mark=1");
        let f = pos("iptables-restore -n");
        assert!(r < a && a < b && b < s && s < f);
        assert!(!calls.iter().any(|c| c.starts_with("ip -4 route add 0.0.0.0/0 dev wg0") && !c.contains("table")));

        let restore = exec
            .requests()
            .into_iter()
            .find(|r| r.program == "iptables-restore")
            .and_then(|r| r.stdin)
            .unwrap();
        assert!(restore.contains("-d 10.8.0.2 "));
    }

    #[test]
    fn test_release_policy_routing_loops_until_rules_gone() {
        let (exec, p) = platform();
        exec.fail("sh -c command -v", 1, "");
        exec.respond_times(
            "ip -4 rule show",
            2,
            &["32764:\tfrom all lookup main suppress_prefixlength 0"],
        );
        exec.respond_times(
            "ip -4 rule show",
            1,
            &[
                "32764:\tfrom all lookup main suppress_prefixlength 0",
                "32765:\tnot from all fwmark 0xca6c lookup 51820",
            ],
        );

        p.release_policy_routing("wg0", 51820).unwrap();

        assert_eq!(exec.count("ip -4 rule delete table 51820"), 1);
        assert_eq!(exec.count("ip -4 rule delete table main suppress_prefixlength 0"), 1);
        assert_eq!(exec.count("ip -6 rule delete"), 0);
    }

    #[test]
    fn test_release_policy_routing_flushes_table() {
        let (exec, p) = platform();
        exec.fail("sh -c command -v", 1, "");
        exec.fail("ip -6 route flush", 2, "RTNETLINK answers: Operation not supported");

        p.release_policy_routing("wg0", 51820).unwrap();

        assert_eq!(exec.count("ip -4 route flush table 51820"), 1);
        assert_eq!(exec.count("ip -6 route flush table 51820"), 1);
    }
}
