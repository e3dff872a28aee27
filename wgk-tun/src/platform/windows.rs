//! Windows interface control through the WireGuard tunnel service and netsh
//!
//! Tunnels are owned by the WireGuard for Windows service, which needs a full
//! configuration file to install one. Interfaces are therefore not created
//! here; allocation adopts tunnels that already exist. Default routes use the
//! split half-route scheme since there are no policy tables.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::{Error, Result};
use crate::exec::SystemCommands;
use crate::platform::{host_addresses, Platform, FALLBACK_MTU, WIREGUARD_OVERHEAD};
use crate::route::Gateway;

/// Default interface prefix on Windows
pub const DEFAULT_PREFIX: &str = "wg";

/// Windows [`Platform`]
pub struct WindowsPlatform {
    commands: SystemCommands,
    wg: String,
    service: String,
    prefix: String,
}

impl WindowsPlatform {
    pub fn new(commands: SystemCommands, wg_tool: &str) -> Self {
        Self {
            commands,
            wg: wg_tool.to_string(),
            service: "wireguard".to_string(),
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

    fn ip_version(net: &IpNet) -> &'static str {
        match net {
            IpNet::V4(_) => "ipv4",
            IpNet::V6(_) => "ipv6",
        }
    }

    fn split_routes(route: &IpNet) -> Vec<IpNet> {
        let halves: [&str; 2] = match route {
            IpNet::V4(_) => ["0.0.0.0/1", "128.0.0.0/1"],
            IpNet::V6(_) => ["::/1", "8000::/1"],
        };
        halves.iter().filter_map(|h| h.parse().ok()).collect()
    }
}

/// Gateway from a `route print -4 0.0.0.0` active route line
fn parse_default_route(line: &str) -> Option<Gateway> {
    let cols: Vec<&str> = line.split_whitespace().collect();
    match cols.as_slice() {
        ["0.0.0.0", "0.0.0.0", gateway, interface, _metric] => Some(Gateway {
            interface: interface.to_string(),
            address: gateway.parse().ok()?,
        }),
        _ => None,
    }
}

/// Route prefix from a `netsh interface ipvX show route` line owned by `native`
fn parse_netsh_route(line: &str, native: &str) -> Option<IpNet> {
    let cols: Vec<&str> = line.split_whitespace().collect();
    if cols.len() < 6 || cols[5..].join(" ") != native {
        return None;
    }
    cols[3].parse().ok()
}

impl Platform for WindowsPlatform {
    fn interface_prefix(&self) -> &str {
        &self.prefix
    }

    fn interfaces(&self) -> Result<Vec<String>> {
        Ok(self
            .commands
            .privileged()
            .output(&[self.wg.as_str(), "show", "interfaces"])?
            .iter()
            .flat_map(|l| l.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .collect())
    }

    fn create(&self, name: &str) -> Result<String> {
        Err(Error::NotSupported(format!(
            "creating {} requires installing a tunnel service with {}",
            name, self.service
        )))
    }

    fn delete(&self, native: &str) -> Result<()> {
        self.root()
            .run(&[self.service.as_str(), "/uninstalltunnelservice", native])
    }

    fn set_addresses(&self, native: &str, addresses: &[String]) -> Result<()> {
        for address in addresses {
            let version = if address.contains(':') { "ipv6" } else { "ipv4" };
            let name = format!("name={}", native);
            let addr = format!("address={}", address);
            self.root().run(&[
                "netsh", "interface", version, "add", "address", name.as_str(), addr.as_str(),
            ])?;
        }
        Ok(())
    }

    fn up(&self, native: &str, mtu: Option<u32>) -> Result<u32> {
        let mtu = mtu
            .filter(|m| *m > 0)
            .unwrap_or(FALLBACK_MTU - WIREGUARD_OVERHEAD);
        let mtu_arg = format!("mtu={}", mtu);
        let name = format!("name={}", native);
        self.root().run(&[
            "netsh", "interface", "ipv4", "set", "subinterface", native, mtu_arg.as_str(), "store=active",
        ])?;
        self.root()
            .run(&["netsh", "interface", "set", "interface", name.as_str(), "admin=enabled"])?;
        Ok(mtu)
    }

    fn down(&self, native: &str) -> Result<()> {
        for route in self.installed_routes(native)? {
            self.remove_route(native, &route)?;
        }
        let name = format!("name={}", native);
        self.root()
            .run(&["netsh", "interface", "set", "interface", name.as_str(), "admin=disabled"])
    }

    fn default_gateway(&self) -> Result<Option<Gateway>> {
        Ok(self
            .commands
            .output(&["route", "print", "-4", "0.0.0.0"])?
            .iter()
            .find_map(|l| parse_default_route(l)))
    }

    fn add_host_route(&self, address: IpAddr, gateway: &Gateway) -> Result<()> {
        let addr = address.to_string();
        let gw = gateway.address.to_string();
        self.root()
            .run(&["route", "add", addr.as_str(), "mask", "255.255.255.255", gw.as_str()])
    }

    fn remove_host_route(&self, address: IpAddr, gateway: &Gateway) -> Result<()> {
        let addr = address.to_string();
        let gw = gateway.address.to_string();
        self.root()
            .run(&["route", "delete", addr.as_str(), "mask", "255.255.255.255", gw.as_str()])
    }

    fn installed_routes(&self, native: &str) -> Result<Vec<IpNet>> {
        let mut routes = Vec::new();
        for version in ["ipv4", "ipv6"] {
            for line in self
                .commands
                .output(&["netsh", "interface", version, "show", "route"])?
            {
                if line.contains("System") {
                    continue;
                }
                if let Some(net) = parse_netsh_route(&line, native) {
                    routes.push(net);
                }
            }
        }
        Ok(routes)
    }

    fn add_route(&self, native: &str, route: &IpNet, table: Option<&str>) -> Result<()> {
        if let Some(table) = table {
            log::warn!("Routing tables are not supported on Windows, ignoring table {}", table);
        }
        let dest = route.to_string();
        let iface = format!("interface={}", native);
        log::info!("Adding route {} to {}", dest, native);
        self.root().run(&[
            "netsh", "interface", Self::ip_version(route), "add", "route", dest.as_str(), iface.as_str(), "store=active",
        ])
    }

    fn remove_route(&self, native: &str, route: &IpNet) -> Result<()> {
        let dest = route.to_string();
        let iface = format!("interface={}", native);
        log::info!("Removing route {} for {}", dest, native);
        self.root().run(&[
            "netsh", "interface", Self::ip_version(route), "delete", "route", dest.as_str(), iface.as_str(),
        ])
    }

    fn free_policy_table(&self, base: u32) -> Result<u32> {
        Ok(base)
    }

    fn install_policy_route(&self, native: &str, route: &IpNet, _table: u32) -> Result<()> {
        for half in Self::split_routes(route) {
            self.add_route(native, &half, None)?;
        }
        Ok(())
    }

    fn release_policy_routing(&self, native: &str, _table: u32) -> Result<()> {
        for net in ["0.0.0.0/0", "::/0"].iter().filter_map(|r| r.parse::<IpNet>().ok()) {
            for half in Self::split_routes(&net) {
                if let Err(e) = self.remove_route(native, &half) {
                    log::debug!("Route {} already gone: {}", half, e);
                }
            }
        }
        Ok(())
    }

    fn local_addresses(&self) -> Result<Vec<IpAddr>> {
        host_addresses(|_| true)
    }

    fn mac_address(&self, _native: &str) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_route() {
        let gw = parse_default_route("          0.0.0.0          0.0.0.0      192.168.1.1    192.168.1.20     25").unwrap();
        assert_eq!(gw.address, "192.168.1.1".parse::<IpAddr>().unwrap());
        assert_eq!(gw.interface, "192.168.1.20");
        assert!(parse_default_route("On-link 127.0.0.1").is_none());
    }

    #[test]
    fn test_parse_netsh_route() {
        let line = "No       Manual    0    10.9.0.0/16                33  wg0";
        assert_eq!(parse_netsh_route(line, "wg0").unwrap().to_string(), "10.9.0.0/16");
        assert!(parse_netsh_route(line, "wg1").is_none());
    }
}
