//! Pre/post up/down hook execution
//!
//! Hooks are shell command lists from the tunnel configuration. They run
//! privileged, with a `WGK_` environment describing the tunnel. A hook can
//! report a readable failure by printing a line starting with `[ERROR] `.

use std::collections::BTreeMap;

use wgk_tun::SystemCommands;

use crate::config::VpnConfiguration;
use crate::error::{Error, Result};
use crate::lifecycle::VirtualInterface;

const ERROR_MARKER: &str = "[ERROR] ";

/// Longest interface name most kernels accept
const SHORT_NAME_LEN: usize = 15;

/// Environment handed to hooks
pub fn hook_environment(
    configuration: &VpnConfiguration,
    interface: Option<&VirtualInterface>,
) -> BTreeMap<String, String> {
    let iface = &configuration.interface;
    let mut env = BTreeMap::new();
    env.insert("WGK_ADDRESS".to_string(), iface.addresses.join(","));
    env.insert(
        "WGK_USER_PUBLIC_KEY".to_string(),
        configuration.public_key().to_string(),
    );
    env.insert("WGK_DNS".to_string(), iface.dns.join(" "));
    env.insert(
        "WGK_MTU".to_string(),
        iface.mtu.unwrap_or(0).to_string(),
    );

    for (i, peer) in configuration.endpoint_peers().enumerate() {
        let n = i + 1;
        env.insert(
            format!("WGK_ENDPOINT_ADDRESS_{}", n),
            peer.endpoint_address().unwrap_or_default().to_string(),
        );
        env.insert(
            format!("WGK_ENDPOINT_PORT_{}", n),
            peer.endpoint_port().unwrap_or(0).to_string(),
        );
        env.insert(format!("WGK_PEER_PUBLIC_KEY_{}", n), peer.public_key.clone());
    }

    if let Some(vif) = interface {
        env.insert("WGK_IP_MAC".into(), vif.mac.clone().unwrap_or_default());
        env.insert("WGK_IP_NAME".into(), vif.name.clone());
        env.insert("WGK_IP_NATIVE_NAME".into(), vif.native.clone());
        env.insert(
            "WGK_IP_SHORT_NAME".into(),
            vif.name.chars().take(SHORT_NAME_LEN).collect(),
        );
        env.insert(
            "WGK_IP_DISPLAY_NAME".into(),
            vif.display_name.clone().unwrap_or_else(|| vif.name.clone()),
        );
        env.insert("WGK_IP_PEER".into(), vif.peer.clone().unwrap_or_default());
        env.insert("WGK_IP_TABLE".into(), vif.table.to_string());
    }
    env
}

fn shell_command(script: String) -> Vec<String> {
    if cfg!(windows) {
        vec!["cmd".into(), "/C".into(), script]
    } else {
        vec!["bash".into(), "-c".into(), script]
    }
}

/// Run a hook list as one shell invocation
///
/// An empty list does nothing.
pub fn run_hooks(
    commands: &SystemCommands,
    hooks: &[String],
    env: BTreeMap<String, String>,
) -> Result<()> {
    let hooks: Vec<&str> = hooks
        .iter()
        .map(|h| h.trim())
        .filter(|h| !h.is_empty())
        .collect();
    if hooks.is_empty() {
        return Ok(());
    }

    let script = hooks.join(" ; ");
    for (key, value) in &env {
        log::debug!("    {} = {}", key, value);
    }

    let mut error_message: Option<String> = None;
    let code = commands
        .privileged()
        .logged()
        .with_env(env)
        .consume(&shell_command(script), |line| {
            log::debug!("    {}", line);
            if let Some(message) = line.strip_prefix(ERROR_MARKER) {
                error_message = Some(message.to_string());
            }
        })?;

    if code != 0 {
        return Err(Error::Hook(error_message.unwrap_or_else(|| {
            format!("Hook exited with non-zero status of {}.", code)
        })));
    }
    Ok(())
}
