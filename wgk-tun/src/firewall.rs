//! Connection-mark firewall rules for policy-routed default routes
//!
//! When a tunnel carries a default route, its own encapsulated UDP traffic is
//! tagged with a firewall mark so that it keeps using the main table. Replies
//! have to carry the same mark, which is what the connmark rules installed here
//! do. Spoofed packets addressed to the tunnel's own addresses but arriving on
//! another interface are dropped.
//!
//! # Platform Support
//!
//! - **Linux**: nftables when `nft` is available, iptables-restore otherwise
//!
//! Rules are tied to the interface name, so they can be found and removed
//! after the interface itself is gone.

use std::net::IpAddr;

use crate::error::{Error, Result};
use crate::exec::SystemCommands;

/// Prefix of the nftables tables we create
pub const TABLE_PREFIX: &str = "wgkeeper-";

/// Family of a set of firewall rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    fn nft(&self) -> &'static str {
        match self {
            Family::V4 => "ip",
            Family::V6 => "ip6",
        }
    }

    fn iptables(&self) -> &'static str {
        match self {
            Family::V4 => "iptables",
            Family::V6 => "ip6tables",
        }
    }
}

/// Name of the nftables table holding the rules of `interface`
pub fn table_name(interface: &str) -> String {
    format!("{}{}", TABLE_PREFIX, interface)
}

fn comment_marker(interface: &str) -> String {
    format!("wgkeeper rule for {}", interface)
}

/// nftables script adding the mark rules for one family
pub fn nft_script(interface: &str, family: Family, mark: u32, addresses: &[IpAddr]) -> String {
    let pf = family.nft();
    let table = table_name(interface);
    let mut script = String::new();
    script.push_str(&format!("add table {} {}\n", pf, table));
    script.push_str(&format!(
        "add chain {} {} preraw {{ type filter hook prerouting priority -300; }}\n",
        pf, table
    ));
    script.push_str(&format!(
        "add chain {} {} premangle {{ type filter hook prerouting priority -150; }}\n",
        pf, table
    ));
    script.push_str(&format!(
        "add chain {} {} postmangle {{ type filter hook postrouting priority -150; }}\n",
        pf, table
    ));
    for addr in addresses.iter().filter(|a| Family::of(a) == family) {
        script.push_str(&format!(
            "add rule {} {} preraw iifname != \"{}\" {} daddr {} fib saddr type != local drop\n",
            pf, table, interface, pf, addr
        ));
    }
    script.push_str(&format!(
        "add rule {} {} postmangle meta l4proto udp mark {} ct mark set mark\n",
        pf, table, mark
    ));
    script.push_str(&format!(
        "add rule {} {} premangle meta l4proto udp meta mark set ct mark\n",
        pf, table
    ));
    script
}

/// iptables-restore input adding the mark rules for one family
pub fn iptables_script(interface: &str, family: Family, mark: u32, addresses: &[IpAddr]) -> String {
    let marker = format!("-m comment --comment \"{}\"", comment_marker(interface));
    let mut script = String::from("*raw\n");
    for addr in addresses.iter().filter(|a| Family::of(a) == family) {
        script.push_str(&format!(
            "-I PREROUTING ! -i {} -d {} -m addrtype ! --src-type LOCAL -j DROP {}\n",
            interface, addr, marker
        ));
    }
    script.push_str("COMMIT\n*mangle\n");
    script.push_str(&format!(
        "-I POSTROUTING -m mark --mark {} -p udp -j CONNMARK --save-mark {}\n",
        mark, marker
    ));
    script.push_str(&format!(
        "-I PREROUTING -p udp -j CONNMARK --restore-mark {}\n",
        marker
    ));
    script.push_str("COMMIT\n");
    script
}

/// Turn `iptables-save` output into a restore script deleting our rules
///
/// Returns `None` when none of the rules belong to `interface`.
pub fn iptables_removal_script<S: AsRef<str>>(interface: &str, saved: &[S]) -> Option<String> {
    let marker = comment_marker(interface);
    let mut script = String::new();
    let mut found = false;
    for line in saved.iter().map(|l| l.as_ref()) {
        if line.starts_with('*') || line == "COMMIT" {
            script.push_str(line);
            script.push('\n');
        } else if line.starts_with("-A ") && line.contains(&marker) {
            found = true;
            script.push_str(&line.replacen("-A ", "-D ", 1));
            script.push('\n');
        }
    }
    found.then_some(script)
}

/// Installs and removes the mark rules for one interface
pub struct MarkFirewall {
    commands: SystemCommands,
}

impl MarkFirewall {
    pub fn new(commands: SystemCommands) -> Self {
        Self {
            commands: commands.privileged(),
        }
    }

    fn has_nft(&self) -> bool {
        self.commands.command_exists("nft")
    }

    /// Add the mark rules for `family`, protecting the given tunnel addresses
    pub fn install(&self, interface: &str, family: Family, mark: u32, addresses: &[IpAddr]) -> Result<()> {
        if self.has_nft() {
            let script = nft_script(interface, family, mark, addresses);
            log::info!("Updating firewall for {} using nft", interface);
            log::debug!("{}", script);
            self.commands
                .logged()
                .pipe_to(&script, &["nft", "-f", "-"])
                .map_err(|e| Error::Firewall(format!("nft failed: {}", e)))
        } else {
            let script = iptables_script(interface, family, mark, addresses);
            let restore = format!("{}-restore", family.iptables());
            log::info!("Updating firewall for {} using {}", interface, restore);
            log::debug!("{}", script);
            self.commands
                .logged()
                .pipe_to(&script, &[restore.as_str(), "-n"])
                .map_err(|e| Error::Firewall(format!("{} failed: {}", restore, e)))
        }
    }

    /// Remove every mark rule belonging to `interface`
    pub fn remove(&self, interface: &str) -> Result<()> {
        if self.has_nft() {
            let wanted = table_name(interface);
            let mut script = String::new();
            for line in self.commands.silent_output(&["nft", "list", "tables"]) {
                let parts: Vec<&str> = line.split_whitespace().collect();
                if let ["table", family, name] = parts.as_slice() {
                    if *name == wanted {
                        script.push_str(&format!("delete table {} {}\n", family, name));
                    }
                }
            }
            if !script.is_empty() {
                self.commands
                    .logged()
                    .pipe_to(&script, &["nft", "-f", "-"])
                    .map_err(|e| Error::Firewall(format!("nft failed: {}", e)))?;
            }
        }

        if self.commands.command_exists("iptables") {
            for family in [Family::V4, Family::V6] {
                let save = format!("{}-save", family.iptables());
                let saved = self.commands.silent_output(&[save.as_str()]);
                if let Some(script) = iptables_removal_script(interface, &saved) {
                    let restore = format!("{}-restore", family.iptables());
                    self.commands
                        .logged()
                        .pipe_to(&script, &[restore.as_str(), "-n"])
                        .map_err(|e| Error::Firewall(format!("{} failed: {}", restore, e)))?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nft_script_filters_family() {
        let addrs: Vec<IpAddr> = vec!["10.8.0.2".parse().unwrap(), "fd00::2".parse().unwrap()];
        let script = nft_script("wg0", Family::V4, 51820, &addrs);
        assert!(script.starts_with("add table ip wgkeeper-wg0\n"));
        assert!(script.contains("iifname != \"wg0\" ip daddr 10.8.0.2 fib saddr type != local drop"));
        assert!(!script.contains("fd00::2"));
        assert!(script.contains("mark 51820 ct mark set mark"));
    }

    #[test]
    fn test_iptables_script_marks_rules() {
        let addrs: Vec<IpAddr> = vec!["10.8.0.2".parse().unwrap()];
        let script = iptables_script("wg0", Family::V4, 51821, &addrs);
        assert!(script.contains("-I PREROUTING ! -i wg0 -d 10.8.0.2 -m addrtype ! --src-type LOCAL -j DROP"));
        assert!(script.contains("--mark 51821"));
        assert_eq!(script.matches("wgkeeper rule for wg0").count(), 3);
        assert!(script.ends_with("COMMIT\n"));
    }

    #[test]
    fn test_iptables_removal_only_touches_our_rules() {
        let saved = [
            "# Generated by iptables-save",
            "*raw",
            ":PREROUTING ACCEPT [0:0]",
            "-A PREROUTING ! -i wg0 -d 10.8.0.2/32 -m addrtype ! --src-type LOCAL -m comment --comment \"wgkeeper rule for wg0\" -j DROP",
            "-A PREROUTING -m comment --comment \"wgkeeper rule for wg1\" -j DROP",
            "COMMIT",
        ];
        let script = iptables_removal_script("wg0", &saved).unwrap();
        assert_eq!(
            script,
            "*raw\n-D PREROUTING ! -i wg0 -d 10.8.0.2/32 -m addrtype ! --src-type LOCAL -m comment --comment \"wgkeeper rule for wg0\" -j DROP\nCOMMIT\n"
        );
        assert!(iptables_removal_script("wg7", &saved).is_none());
    }
}
