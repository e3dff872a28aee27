//! Per-OS interface, route and gateway control
//!
//! Each operating system gets one implementation of [`Platform`]. They are
//! thin: every method maps onto one or a few external commands run through
//! [`SystemCommands`], privileged where the OS requires it. Policy (what to
//! install, in which order, when to roll back) lives in the engine.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::Result;
use crate::exec::SystemCommands;
use crate::route::Gateway;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(target_os = "windows")]
pub mod windows;

/// Default MTU assumed when nothing better is known
pub const FALLBACK_MTU: u32 = 1500;

/// WireGuard encapsulation overhead subtracted from the underlying MTU
pub const WIREGUARD_OVERHEAD: u32 = 80;

/// OS capabilities the tunnel lifecycle needs
pub trait Platform: Send + Sync {
    /// Prefix for allocated interface names
    fn interface_prefix(&self) -> &str;

    /// Whether native names can be picked by us (otherwise the OS assigns them)
    fn names_freely_chosen(&self) -> bool {
        true
    }

    /// Native names of existing WireGuard interfaces
    fn interfaces(&self) -> Result<Vec<String>>;

    /// Whether a native interface exists
    fn exists(&self, native: &str) -> Result<bool> {
        Ok(self.interfaces()?.iter().any(|n| n == native))
    }

    /// Create an interface, returning the native name actually created
    fn create(&self, name: &str) -> Result<String>;

    /// Delete an interface
    fn delete(&self, native: &str) -> Result<()>;

    /// Replace the interface's addresses
    fn set_addresses(&self, native: &str, addresses: &[String]) -> Result<()>;

    /// Set the MTU (or pick the platform default) and bring the interface up
    ///
    /// Returns the MTU that was applied.
    fn up(&self, native: &str, mtu: Option<u32>) -> Result<u32>;

    /// Bring the interface down and drop its routes
    fn down(&self, native: &str) -> Result<()>;

    /// The host's real default gateway, if there is one
    fn default_gateway(&self) -> Result<Option<Gateway>>;

    /// Route a single address through `gateway`
    fn add_host_route(&self, address: IpAddr, gateway: &Gateway) -> Result<()>;

    /// Remove a route added with [`add_host_route`](Self::add_host_route)
    fn remove_host_route(&self, address: IpAddr, gateway: &Gateway) -> Result<()>;

    /// Routes currently installed for the interface in the main table
    fn installed_routes(&self, native: &str) -> Result<Vec<IpNet>>;

    /// Install a route through the interface, optionally into a named table
    fn add_route(&self, native: &str, route: &IpNet, table: Option<&str>) -> Result<()>;

    /// Remove a route through the interface
    fn remove_route(&self, native: &str, route: &IpNet) -> Result<()>;

    /// Lowest policy table at or above `base` that holds no routes
    fn free_policy_table(&self, base: u32) -> Result<u32>;

    /// Install a default route into `table` plus the mark-based rules around it
    fn install_policy_route(&self, native: &str, route: &IpNet, table: u32) -> Result<()>;

    /// Remove the rules and marks installed for `table`
    fn release_policy_routing(&self, native: &str, table: u32) -> Result<()>;

    /// Addresses of non-loopback host interfaces that are up
    fn local_addresses(&self) -> Result<Vec<IpAddr>>;

    /// Hardware address of the interface, if it has one
    fn mac_address(&self, native: &str) -> Option<String>;

    /// Name the OS shows to users
    fn display_name(&self, native: &str) -> Option<String> {
        Some(native.to_string())
    }
}

/// Host addresses of interfaces that are not loopback and pass `is_up`
pub(crate) fn host_addresses<F>(is_up: F) -> Result<Vec<IpAddr>>
where
    F: Fn(&str) -> bool,
{
    let mut addrs = Vec::new();
    for iface in get_if_addrs::get_if_addrs()? {
        if iface.is_loopback() || !is_up(&iface.name) {
            continue;
        }
        let ip = iface.ip();
        if !addrs.contains(&ip) {
            addrs.push(ip);
        }
    }
    Ok(addrs)
}

/// Value following `key` in a whitespace separated line
pub(crate) fn token_after<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let mut tokens = line.split_whitespace();
    while let Some(t) = tokens.next() {
        if t == key {
            return tokens.next();
        }
    }
    None
}

/// The platform implementation for the OS we were built for
#[cfg(target_os = "linux")]
pub fn native(commands: SystemCommands, wg_tool: &str) -> Box<dyn Platform> {
    Box::new(linux::LinuxPlatform::new(commands, wg_tool))
}

/// The platform implementation for the OS we were built for
#[cfg(target_os = "macos")]
pub fn native(commands: SystemCommands, wg_tool: &str) -> Box<dyn Platform> {
    Box::new(macos::MacOsPlatform::new(commands, wg_tool))
}

/// The platform implementation for the OS we were built for
#[cfg(target_os = "windows")]
pub fn native(commands: SystemCommands, wg_tool: &str) -> Box<dyn Platform> {
    Box::new(windows::WindowsPlatform::new(commands, wg_tool))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_after() {
        let line = "default via 192.168.1.1 dev eth0 proto dhcp metric 100";
        assert_eq!(token_after(line, "via"), Some("192.168.1.1"));
        assert_eq!(token_after(line, "dev"), Some("eth0"));
        assert_eq!(token_after(line, "mtu"), None);
        assert_eq!(token_after("metric", "metric"), None);
    }
}
