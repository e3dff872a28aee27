//! macOS interface control through wireguard-go, ifconfig and route
//!
//! The kernel picks `utunN` names, so the friendly name asked for at creation
//! is only used to find the name file wireguard-go writes. There are no policy
//! routing tables; default routes are installed as the two half routes
//! (`0.0.0.0/1` and `128.0.0.0/1`), which win over the real default route
//! without replacing it.

use std::net::IpAddr;
use std::path::PathBuf;

use ipnet::IpNet;

use crate::error::{Error, Result};
use crate::exec::{CommandRequest, SystemCommands};
use crate::platform::{host_addresses, token_after, Platform, FALLBACK_MTU, WIREGUARD_OVERHEAD};
use crate::route::{parse_route, Gateway};

/// Default interface prefix on macOS
pub const DEFAULT_PREFIX: &str = "utun";

/// Where wireguard-go keeps its sockets and name files
pub const RUN_DIR: &str = "/var/run/wireguard";

/// macOS [`Platform`]
pub struct MacOsPlatform {
    commands: SystemCommands,
    wg: String,
    userspace: String,
    prefix: String,
}

impl MacOsPlatform {
    pub fn new(commands: SystemCommands, wg_tool: &str) -> Self {
        Self {
            commands,
            wg: wg_tool.to_string(),
            userspace: "wireguard-go".to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }

    /// Use a different userspace implementation binary
    pub fn with_userspace(mut self, binary: impl Into<String>) -> Self {
        self.userspace = binary.into();
        self
    }

    /// Use a different prefix for allocated interface names
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn root(&self) -> SystemCommands {
        self.commands.privileged().logged()
    }

    fn ifconfig(&self, native: &str) -> Vec<String> {
        self.commands.silent_output(&["ifconfig", native])
    }

    /// MTU of the interface carrying the default route, minus WireGuard overhead
    pub fn detect_mtu(&self) -> u32 {
        let link_mtu = self
            .default_route_interface()
            .and_then(|iface| {
                self.ifconfig(&iface)
                    .first()
                    .and_then(|l| token_after(l, "mtu").and_then(|m| m.parse::<u32>().ok()))
            });
        link_mtu.unwrap_or(FALLBACK_MTU) - WIREGUARD_OVERHEAD
    }

    fn default_route_interface(&self) -> Option<String> {
        self.commands
            .silent_output(&["route", "-n", "get", "default"])
            .iter()
            .find_map(|l| token_after(l, "interface:").map(str::to_string))
    }

    fn split_routes(route: &IpNet) -> Vec<IpNet> {
        let halves: [&str; 2] = match route {
            IpNet::V4(_) => ["0.0.0.0/1", "128.0.0.0/1"],
            IpNet::V6(_) => ["::/1", "8000::/1"],
        };
        halves.iter().filter_map(|h| h.parse().ok()).collect()
    }
}

fn inet_flag(net: &IpNet) -> &'static str {
    match net {
        IpNet::V4(_) => "-inet",
        IpNet::V6(_) => "-inet6",
    }
}

/// Expand a BSD `netstat -nr` destination such as `10.9/16` or `default`
pub fn parse_bsd_destination(dest: &str) -> Option<IpNet> {
    if dest == "default" {
        return parse_route("0.0.0.0/0").ok();
    }
    let (addr, prefix) = match dest.split_once('/') {
        Some((a, p)) => (a, Some(p)),
        None => (dest, None),
    };
    if addr.contains(':') {
        let addr = addr.split('%').next()?;
        return match prefix {
            Some(p) => format!("{}/{}", addr, p).parse().ok(),
            None => parse_route(addr).ok(),
        };
    }
    let octets: Vec<&str> = addr.split('.').collect();
    if octets.is_empty() || octets.len() > 4 {
        return None;
    }
    let mut full = octets.clone();
    full.resize(4, "0");
    let prefix = prefix
        .map(str::to_string)
        .unwrap_or_else(|| (octets.len() * 8).to_string());
    format!("{}/{}", full.join("."), prefix).parse().ok()
}

impl Platform for MacOsPlatform {
    fn interface_prefix(&self) -> &str {
        &self.prefix
    }

    fn names_freely_chosen(&self) -> bool {
        false
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

    fn exists(&self, native: &str) -> Result<bool> {
        Ok(self.commands.result(&["ifconfig", native])? == 0)
    }

    fn create(&self, name: &str) -> Result<String> {
        let name_file = PathBuf::from(RUN_DIR).join(format!("{}.name", name));
        let request = CommandRequest::new(self.userspace.as_str())
            .arg("utun")
            .env("WG_TUN_NAME_FILE", name_file.to_string_lossy());
        self.root()
            .execute(request.clone())?
            .into_result(&request)?;

        let native = self
            .root()
            .read_file(&name_file)?
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                Error::DeviceNotFound(format!("{} did not report an interface name for {}", self.userspace, name))
            })?;
        log::info!("Created {} as {}", name, native);
        Ok(native)
    }

    fn delete(&self, native: &str) -> Result<()> {
        let socket = PathBuf::from(RUN_DIR).join(format!("{}.sock", native));
        self.root().remove_file(&socket)
    }

    fn set_addresses(&self, native: &str, addresses: &[String]) -> Result<()> {
        for address in addresses {
            if address.contains(':') {
                self.root()
                    .run(&["ifconfig", native, "inet6", address.as_str(), "alias"])?;
            } else {
                let host = address.split('/').next().unwrap_or(address);
                self.root()
                    .run(&["ifconfig", native, "inet", address.as_str(), host, "alias"])?;
            }
        }
        Ok(())
    }

    fn up(&self, native: &str, mtu: Option<u32>) -> Result<u32> {
        let mtu = mtu.filter(|m| *m > 0).unwrap_or_else(|| self.detect_mtu());
        let mtu_str = mtu.to_string();
        self.root()
            .run(&["ifconfig", native, "mtu", mtu_str.as_str(), "up"])?;
        Ok(mtu)
    }

    fn down(&self, native: &str) -> Result<()> {
        for route in self.installed_routes(native)? {
            self.remove_route(native, &route)?;
        }
        self.root().run(&["ifconfig", native, "down"])
    }

    fn default_gateway(&self) -> Result<Option<Gateway>> {
        let lines = self.commands.output(&["route", "-n", "get", "default"])?;
        let address = lines
            .iter()
            .find_map(|l| token_after(l, "gateway:"))
            .and_then(|a| a.parse::<IpAddr>().ok());
        let interface = lines.iter().find_map(|l| token_after(l, "interface:"));
        Ok(match (address, interface) {
            (Some(address), Some(interface)) => Some(Gateway {
                interface: interface.to_string(),
                address,
            }),
            _ => None,
        })
    }

    fn add_host_route(&self, address: IpAddr, gateway: &Gateway) -> Result<()> {
        let net = IpNet::from(address);
        let addr = address.to_string();
        let gw = gateway.address.to_string();
        self.root().run(&[
            "route", "-q", "-n", "add", inet_flag(&net), addr.as_str(), "-gateway", gw.as_str(),
        ])
    }

    fn remove_host_route(&self, address: IpAddr, gateway: &Gateway) -> Result<()> {
        let net = IpNet::from(address);
        let addr = address.to_string();
        let gw = gateway.address.to_string();
        self.root().run(&[
            "route", "-q", "-n", "delete", inet_flag(&net), addr.as_str(), "-gateway", gw.as_str(),
        ])
    }

    fn installed_routes(&self, native: &str) -> Result<Vec<IpNet>> {
        let mut routes = Vec::new();
        for family in ["inet", "inet6"] {
            for line in self.commands.output(&["netstat", "-nr", "-f", family])? {
                let cols: Vec<&str> = line.split_whitespace().collect();
                if cols.len() < 4 || !cols.contains(&native) {
                    continue;
                }
                // Link-local and host entries created by the kernel
                if cols[2].contains('H') && !cols[2].contains('S') {
                    continue;
                }
                if let Some(net) = parse_bsd_destination(cols[0]) {
                    routes.push(net);
                }
            }
        }
        Ok(routes)
    }

    fn add_route(&self, native: &str, route: &IpNet, table: Option<&str>) -> Result<()> {
        if let Some(table) = table {
            log::warn!("Routing tables are not supported on macOS, ignoring table {}", table);
        }
        let dest = route.to_string();
        log::info!("Adding route {} to {}", dest, native);
        self.root().run(&[
            "route", "-q", "-n", "add", inet_flag(route), dest.as_str(), "-interface", native,
        ])
    }

    fn remove_route(&self, native: &str, route: &IpNet) -> Result<()> {
        let dest = route.to_string();
        log::info!("Removing route {} for {}", dest, native);
        self.root().run(&[
            "route", "-q", "-n", "delete", inet_flag(route), dest.as_str(), "-interface", native,
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
        host_addresses(|name| {
            self.ifconfig(name)
                .first()
                .map(|l| l.contains("<UP"))
                .unwrap_or(true)
        })
    }

    fn mac_address(&self, native: &str) -> Option<String> {
        self.ifconfig(native)
            .iter()
            .find_map(|l| token_after(l, "ether").map(|m| m.to_ascii_uppercase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bsd_destination() {
        assert_eq!(parse_bsd_destination("10.9/16").unwrap().to_string(), "10.9.0.0/16");
        assert_eq!(parse_bsd_destination("10.8.0.2").unwrap().to_string(), "10.8.0.2/32");
        assert_eq!(parse_bsd_destination("default").unwrap().to_string(), "0.0.0.0/0");
        assert_eq!(parse_bsd_destination("fd00::/64").unwrap().to_string(), "fd00::/64");
        assert_eq!(parse_bsd_destination("fe80::%utun3/64").unwrap().to_string(), "fe80::/64");
    }

    #[test]
    fn test_split_routes() {
        let v4: Vec<String> = MacOsPlatform::split_routes(&"0.0.0.0/0".parse().unwrap())
            .iter()
            .map(|r| r.to_string())
            .collect();
        assert_eq!(v4, vec!["0.0.0.0/1", "128.0.0.0/1"]);
    }
}
