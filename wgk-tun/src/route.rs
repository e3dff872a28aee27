//! Route types shared by the platform layer and the route policy
//!
//! Routes are carried around as [`ipnet::IpNet`] values. The helpers here turn
//! the loose strings found in configuration files and `ip route` output into
//! those values and give them a deterministic install order.

use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Base table number used when allocating a policy table for default routes
pub const POLICY_TABLE_BASE: u32 = 51820;

/// Routing table selector of an interface
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum RouteTable {
    /// Main table, with default routes moved into a dedicated marked table
    #[default]
    Auto,
    /// Do not install routes at all
    Off,
    /// Install every route into this table, as given
    Table(String),
}

impl RouteTable {
    pub fn is_auto(&self) -> bool {
        matches!(self, RouteTable::Auto)
    }

    pub fn is_off(&self) -> bool {
        matches!(self, RouteTable::Off)
    }
}

impl FromStr for RouteTable {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(RouteTable::Auto),
            "off" => Ok(RouteTable::Off),
            _ if s.chars().any(char::is_whitespace) => {
                Err(Error::Config(format!("invalid routing table '{}'", s)))
            }
            _ => Ok(RouteTable::Table(s.to_string())),
        }
    }
}

impl fmt::Display for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteTable::Auto => write!(f, "auto"),
            RouteTable::Off => write!(f, "off"),
            RouteTable::Table(t) => write!(f, "{}", t),
        }
    }
}

impl Serialize for RouteTable {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RouteTable {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Parse a CIDR, or a bare address as a host route
pub fn parse_route(s: &str) -> Result<IpNet> {
    let s = s.trim();
    if s == "default" {
        return Ok(IpNet::V4(Default::default()));
    }
    if let Ok(net) = s.parse::<IpNet>() {
        return Ok(net);
    }
    s.parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| Error::InvalidPrefix(s.to_string()))
}

/// Most specific first, then lexicographic on the textual form
pub fn route_order(a: &IpNet, b: &IpNet) -> Ordering {
    b.prefix_len()
        .cmp(&a.prefix_len())
        .then_with(|| a.to_string().cmp(&b.to_string()))
}

/// Sort routes into install order, see [`route_order`]
pub fn sort_routes(routes: &mut [IpNet]) {
    routes.sort_by(route_order);
}

/// Destinations from `ip route show dev X` style output
///
/// The first token of each line is the destination; `default` maps to the
/// unspecified network of the family the caller asked about.
pub fn parse_route_lines<S: AsRef<str>>(lines: &[S], ipv6: bool) -> Vec<IpNet> {
    lines
        .iter()
        .filter_map(|l| l.as_ref().split_whitespace().next())
        .filter_map(|dest| {
            if dest == "default" {
                return Some(if ipv6 {
                    IpNet::V6(Default::default())
                } else {
                    IpNet::V4(Default::default())
                });
            }
            match parse_route(dest) {
                Ok(net) => Some(net),
                Err(_) => {
                    log::debug!("Ignoring unparseable route '{}'", dest);
                    None
                }
            }
        })
        .collect()
}

/// `ip` family switch for a network
pub fn family_flag(net: &IpNet) -> &'static str {
    match net {
        IpNet::V4(_) => "-4",
        IpNet::V6(_) => "-6",
    }
}

/// A network route entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination network
    pub destination: IpNet,
    /// Gateway address (None for interface routes)
    pub gateway: Option<IpAddr>,
    /// Interface name
    pub interface: Option<String>,
    /// Table the route lives in (None for main)
    pub table: Option<String>,
}

impl Route {
    /// Route to a destination through a gateway
    pub fn via(destination: IpNet, gateway: IpAddr) -> Self {
        Self {
            destination,
            gateway: Some(gateway),
            interface: None,
            table: None,
        }
    }

    /// Host route to a single address through a gateway
    pub fn host(address: IpAddr, gateway: IpAddr) -> Self {
        Self::via(IpNet::from(address), gateway)
    }

    /// Interface route (no gateway, traffic goes directly to interface)
    pub fn interface_route(destination: IpNet, interface: impl Into<String>) -> Self {
        Self {
            destination,
            gateway: None,
            interface: Some(interface.into()),
            table: None,
        }
    }

    /// Set the interface for this route
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Place this route in a specific table
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Check if this is a default route
    pub fn is_default(&self) -> bool {
        self.destination.prefix_len() == 0
    }

    /// Check if this is an IPv6 route
    pub fn is_ipv6(&self) -> bool {
        matches!(self.destination, IpNet::V6(_))
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(ref gw) = self.gateway {
            write!(f, " via {}", gw)?;
        }
        if let Some(ref iface) = self.interface {
            write!(f, " dev {}", iface)?;
        }
        if let Some(ref table) = self.table {
            write!(f, " table {}", table)?;
        }
        Ok(())
    }
}

/// The host's real default gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gateway {
    /// Native name of the interface the default route leaves through
    pub interface: String,
    /// Gateway address
    pub address: IpAddr,
}

impl fmt::Display for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.address, self.interface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nets(v: &[&str]) -> Vec<IpNet> {
        v.iter().map(|s| parse_route(s).unwrap()).collect()
    }

    #[test]
    fn test_sort_most_specific_first_then_lexicographic() {
        let mut routes = nets(&["0.0.0.0/0", "10.0.0.0/8", "192.168.1.0/24", "10.1.0.0/24", "172.16.5.5"]);
        sort_routes(&mut routes);
        let order: Vec<String> = routes.iter().map(|r| r.to_string()).collect();
        assert_eq!(
            order,
            vec!["172.16.5.5/32", "10.1.0.0/24", "192.168.1.0/24", "10.0.0.0/8", "0.0.0.0/0"]
        );
    }

    #[test]
    fn test_parse_route_accepts_hosts() {
        assert_eq!(parse_route("10.0.0.1").unwrap().prefix_len(), 32);
        assert_eq!(parse_route("fd00::1").unwrap().prefix_len(), 128);
        assert_eq!(parse_route("default").unwrap().prefix_len(), 0);
        assert!(parse_route("not-a-route").is_err());
    }

    #[test]
    fn test_parse_route_lines() {
        let lines = [
            "10.8.0.0/24 proto kernel scope link src 10.8.0.2",
            "192.168.7.1 scope link",
            "default scope link",
            "",
        ];
        let routes = parse_route_lines(&lines, false);
        assert_eq!(routes, nets(&["10.8.0.0/24", "192.168.7.1/32", "0.0.0.0/0"]));
    }

    #[test]
    fn test_route_table_parse() {
        assert_eq!("auto".parse::<RouteTable>().unwrap(), RouteTable::Auto);
        assert_eq!("".parse::<RouteTable>().unwrap(), RouteTable::Auto);
        assert_eq!("Off".parse::<RouteTable>().unwrap(), RouteTable::Off);
        assert_eq!(
            "1234".parse::<RouteTable>().unwrap(),
            RouteTable::Table("1234".into())
        );
        assert!("a b".parse::<RouteTable>().is_err());
    }

    #[test]
    fn test_route_display() {
        let r = Route::interface_route(parse_route("0.0.0.0/0").unwrap(), "wg0").with_table("51820");
        assert!(r.is_default());
        assert_eq!(r.to_string(), "0.0.0.0/0 dev wg0 table 51820");
    }
}
