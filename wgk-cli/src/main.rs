//! wgkeeper CLI
//!
//! Brings WireGuard tunnels up and down, and runs the privileged helper.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wgk_engine::{
    Adapter, AdapterLifecycle, Error as EngineError, InterfaceInformation, StartRequest,
    SystemConfiguration, VirtualInterface, VpnConfiguration, VpnPeer,
};
use wgk_tun::{
    ElevatedClient, ElevatedServer, LocalExecutor, SystemCommands, DEFAULT_SOCKET_MODE,
    DEFAULT_SOCKET_PATH,
};

#[cfg(not(windows))]
const DEFAULT_SYSTEM_CONFIG: &str = "/etc/wgkeeper/system.toml";
#[cfg(windows)]
const DEFAULT_SYSTEM_CONFIG: &str = r"C:\ProgramData\wgkeeper\system.toml";

/// wgkeeper - WireGuard tunnel lifecycle manager
#[derive(Parser)]
#[command(name = "wgkeeper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the system settings file
    #[arg(short, long)]
    system: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace); overrides the settings file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring a tunnel up
    Up {
        /// Tunnel configuration file
        config: PathBuf,

        /// Friendly interface name
        #[arg(short, long)]
        name: Option<String>,

        /// OS interface name (requires --name)
        #[arg(long)]
        native_name: Option<String>,

        /// Public key of the peer to connect to (default: first peer with an endpoint)
        #[arg(short, long)]
        peer: Option<String>,

        /// Stay in the foreground and take the tunnel down on SIGINT/SIGTERM
        #[arg(short, long)]
        foreground: bool,
    },

    /// Take a tunnel down
    Down {
        /// Friendly or native interface name
        name: String,

        /// Tunnel configuration, for down hooks and saving
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Replace a running tunnel's configuration
    Reconfigure {
        name: String,
        config: PathBuf,
    },

    /// Add the peers of a configuration to a running tunnel
    Append {
        name: String,
        config: PathBuf,
    },

    /// Converge a running tunnel on a configuration without resetting sessions
    Sync {
        name: String,
        config: PathBuf,
    },

    /// Show running tunnels
    Status {
        /// Only this tunnel
        name: Option<String>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Run the privileged helper (as root / Administrator)
    Helper {
        /// Socket or pipe to listen on
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Octal permission bits of the socket, e.g. 660
        #[arg(long, value_parser = parse_mode)]
        mode: Option<u32>,

        /// Group given the socket, so its members can use the helper
        #[arg(long)]
        group: Option<String>,
    },

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "wgkeeper.toml")]
        output: PathBuf,

        /// Write system settings instead of a tunnel configuration
        #[arg(long)]
        system: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let system = load_system(cli.system.as_deref())?;
    init_logging(cli.log_level.as_deref().unwrap_or(&system.log_level));

    match cli.command {
        Commands::Up {
            config,
            name,
            native_name,
            peer,
            foreground,
        } => run_up(system, &config, name, native_name, peer, foreground),
        Commands::Down { name, config } => run_down(system, &name, config.as_deref()),
        Commands::Reconfigure { name, config } => {
            run_update(system, &name, &config, |l, a, c| l.reconfigure(a, c))
        }
        Commands::Append { name, config } => {
            run_update(system, &name, &config, |l, a, c| l.append(a, c))
        }
        Commands::Sync { name, config } => {
            run_update(system, &name, &config, |l, a, c| l.sync(a, c))
        }
        Commands::Status { name, json } => run_status(system, name.as_deref(), json),
        Commands::Helper {
            socket,
            mode,
            group,
        } => run_helper(system, socket, mode, group),
        Commands::GenConfig { output, system } => generate_config(output, system),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Settings from `path`, else from the default location when present, else defaults
fn load_system(path: Option<&Path>) -> Result<SystemConfiguration> {
    match path {
        Some(path) => SystemConfiguration::load(path)
            .with_context(|| format!("Failed to load system settings from {:?}", path)),
        None if Path::new(DEFAULT_SYSTEM_CONFIG).exists() => {
            SystemConfiguration::load(DEFAULT_SYSTEM_CONFIG).with_context(|| {
                format!("Failed to load system settings from {}", DEFAULT_SYSTEM_CONFIG)
            })
        }
        None => Ok(SystemConfiguration::default()),
    }
}

fn load_config(path: &Path) -> Result<VpnConfiguration> {
    VpnConfiguration::load(path)
        .with_context(|| format!("Failed to load configuration from {:?}", path))
}

fn commands(system: &SystemConfiguration) -> SystemCommands {
    let commands = SystemCommands::local();
    match system.helper_socket {
        Some(ref socket) => {
            info!("Privileged commands go through the helper at {:?}", socket);
            commands.with_elevated(Arc::new(ElevatedClient::new(socket)))
        }
        None => commands,
    }
}

fn lifecycle(system: SystemConfiguration) -> AdapterLifecycle {
    let commands = commands(&system);
    AdapterLifecycle::native(system, commands)
}

/// A running tunnel by name; a missing tool is not reported as a missing tunnel
fn attach(lifecycle: &AdapterLifecycle, name: &str) -> Result<Adapter> {
    match lifecycle.adapter(name) {
        Ok(adapter) => Ok(adapter),
        Err(e) if e.is_not_found() => bail!("No tunnel named {}", name),
        Err(e) => Err(e).with_context(|| format!("Failed to look up tunnel {}", name)),
    }
}

fn run_up(
    system: SystemConfiguration,
    config_path: &Path,
    name: Option<String>,
    native_name: Option<String>,
    peer: Option<String>,
    foreground: bool,
) -> Result<()> {
    let configuration = load_config(config_path)?;
    let mut request = StartRequest::new(configuration.clone());
    if let Some(name) = name {
        request = request.with_name(name);
    }
    if let Some(native) = native_name {
        request = request.with_native_name(native);
    }
    if let Some(key) = peer {
        let peer = configuration
            .peer(&key)
            .cloned()
            .with_context(|| format!("No peer {} in {:?}", key, config_path))?;
        request = request.with_peer(peer);
    }

    let lifecycle = lifecycle(system);
    let adapter = match lifecycle.start(request) {
        Ok(adapter) => adapter,
        Err(EngineError::PostUp { adapter, source }) => {
            warn!("Tunnel is up but its post-up hooks failed: {}", source);
            *adapter
        }
        Err(e) => return Err(e).context("Failed to bring the tunnel up"),
    };

    println!("{} is up on {}", adapter.name(), adapter.native());
    if !foreground {
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start the runtime")?;
    runtime.block_on(wait_for_shutdown())?;

    info!("Taking {} down", adapter.name());
    save_if_requested(&lifecycle, &adapter, config_path)?;
    lifecycle
        .stop(adapter)
        .context("Failed to take the tunnel down cleanly")
}

fn run_down(system: SystemConfiguration, name: &str, config_path: Option<&Path>) -> Result<()> {
    let lifecycle = lifecycle(system);
    let mut adapter = attach(&lifecycle, name)?;

    if let Some(path) = config_path {
        adapter = adapter.with_configuration(load_config(path)?);
        save_if_requested(&lifecycle, &adapter, path)?;
    }

    lifecycle
        .stop(adapter)
        .with_context(|| format!("Failed to take {} down cleanly", name))?;
    println!("{} is down", name);
    Ok(())
}

/// Write the live configuration back when the tunnel configuration asks for it
fn save_if_requested(lifecycle: &AdapterLifecycle, adapter: &Adapter, path: &Path) -> Result<()> {
    let wants_save = adapter
        .configuration()
        .map(|c| c.interface.save)
        .unwrap_or(false);
    if !wants_save {
        return Ok(());
    }
    let live = lifecycle.live_configuration(adapter)?;
    live.save(path)
        .with_context(|| format!("Failed to save configuration to {:?}", path))?;
    info!("Saved live configuration to {:?}", path);
    Ok(())
}

fn run_update<F>(system: SystemConfiguration, name: &str, config_path: &Path, update: F) -> Result<()>
where
    F: FnOnce(&AdapterLifecycle, &mut Adapter, VpnConfiguration) -> wgk_engine::Result<()>,
{
    let configuration = load_config(config_path)?;
    let lifecycle = lifecycle(system);
    let mut adapter = attach(&lifecycle, name)?;
    update(&lifecycle, &mut adapter, configuration)
        .with_context(|| format!("Failed to update {}", name))?;
    println!("{} updated", name);
    Ok(())
}

#[derive(Serialize)]
struct TunnelStatus {
    interface: VirtualInterface,
    alive: bool,
    gateway_peer: Option<String>,
    information: InterfaceInformation,
}

fn run_status(system: SystemConfiguration, name: Option<&str>, json: bool) -> Result<()> {
    let lifecycle = lifecycle(system);
    let adapters = match name {
        Some(name) => vec![attach(&lifecycle, name)?],
        None => lifecycle.adapters().context("Failed to list tunnels")?,
    };

    let mut tunnels = Vec::new();
    for adapter in adapters {
        tunnels.push(TunnelStatus {
            alive: lifecycle.is_alive(&adapter)?,
            gateway_peer: adapter.gateway_peer().map(|p: &VpnPeer| p.public_key.clone()),
            information: lifecycle.information(&adapter)?,
            interface: adapter.interface().clone(),
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&tunnels)?);
        return Ok(());
    }
    if tunnels.is_empty() {
        println!("No tunnels are up");
    }
    for tunnel in &tunnels {
        print_status(tunnel);
    }
    Ok(())
}

fn print_status(tunnel: &TunnelStatus) {
    let iface = &tunnel.interface;
    let info = &tunnel.information;
    if iface.name == iface.native {
        println!("interface: {}", iface.name);
    } else {
        println!("interface: {} ({})", iface.name, iface.native);
    }
    if let Some(ref key) = info.public_key {
        println!("  public key: {}", key);
    }
    if let Some(port) = info.listen_port {
        println!("  listening port: {}", port);
    }
    if let Some(mark) = info.fwmark {
        println!("  fwmark: {:#x}", mark);
    }
    println!("  state: {}", if tunnel.alive { "alive" } else { "stale" });

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    for peer in &info.peers {
        let marker = if tunnel.gateway_peer.as_deref() == Some(peer.public_key.as_str()) {
            " (default gateway)"
        } else {
            ""
        };
        println!();
        println!("peer: {}{}", peer.public_key, marker);
        if let Some(ref endpoint) = peer.endpoint {
            println!("  endpoint: {}", endpoint);
        }
        if !peer.allowed_ips.is_empty() {
            println!("  allowed ips: {}", peer.allowed_ips.join(", "));
        }
        if let Some(at) = peer.latest_handshake {
            println!("  latest handshake: {} seconds ago", now.saturating_sub(at));
        }
        println!(
            "  transfer: {} B received, {} B sent",
            peer.rx_bytes, peer.tx_bytes
        );
        if let Some(keepalive) = peer.persistent_keepalive {
            println!("  persistent keepalive: every {} seconds", keepalive);
        }
    }
    println!();
}

fn parse_mode(value: &str) -> std::result::Result<u32, String> {
    let digits = value.trim_start_matches("0o");
    match u32::from_str_radix(digits, 8) {
        Ok(mode) if mode <= 0o777 => Ok(mode),
        _ => Err(format!("'{}' is not an octal permission mode", value)),
    }
}

#[cfg(unix)]
fn with_socket_group(server: ElevatedServer, group: &str) -> Result<ElevatedServer> {
    let gid = wgk_tun::elevate::group_id(group)
        .with_context(|| format!("Cannot give the helper socket to group {}", group))?;
    Ok(server.with_group(gid))
}

#[cfg(windows)]
fn with_socket_group(server: ElevatedServer, group: &str) -> Result<ElevatedServer> {
    warn!("Named pipes have no group, ignoring {}", group);
    Ok(server)
}

fn run_helper(
    system: SystemConfiguration,
    socket: Option<PathBuf>,
    mode: Option<u32>,
    group: Option<String>,
) -> Result<()> {
    let socket = socket
        .or(system.helper_socket)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH));
    let mode = mode
        .or(system.helper_socket_mode)
        .unwrap_or(DEFAULT_SOCKET_MODE);
    let mut server = ElevatedServer::new(&socket, Arc::new(LocalExecutor::new())).with_mode(mode);
    if let Some(group) = group.or(system.helper_socket_group) {
        server = with_socket_group(server, &group)?;
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start the runtime")?;
    runtime.block_on(async {
        tokio::select! {
            result = server.run() => result.context("Helper stopped"),
            result = wait_for_shutdown() => {
                info!("Helper shutting down");
                result
            }
        }
    })
}

fn generate_config(output: PathBuf, system: bool) -> Result<()> {
    if output.exists() {
        bail!("{:?} already exists, not overwriting it", output);
    }
    let sample = if system {
        SystemConfiguration::sample()
    } else {
        VpnConfiguration::sample()
    };

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);
    if !system {
        println!("\nFill in your keys and peers before running `wgkeeper up`.");
    }

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to register SIGTERM handler")?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("Failed to register SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("660").unwrap(), 0o660);
        assert_eq!(parse_mode("0o600").unwrap(), 0o600);
        assert!(parse_mode("888").is_err());
        assert!(parse_mode("4755").is_err());
    }

    #[test]
    fn test_helper_flags() {
        let cli = Cli::try_parse_from(["wgkeeper", "helper", "--mode", "660", "--group", "wgkeeper"])
            .unwrap();
        match cli.command {
            Commands::Helper { mode, group, .. } => {
                assert_eq!(mode, Some(0o660));
                assert_eq!(group.as_deref(), Some("wgkeeper"));
            }
            _ => panic!("expected the helper command"),
        }
    }
}
