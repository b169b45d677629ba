//! lobby-node command-line entry point.
//!
//! Hosts a lobby, browses the LAN for lobbies, or joins one, then exchanges
//! a small JSON heartbeat with the peer until Ctrl-C.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load NodeConfig        -- --config file, or defaults
//!  └─ LobbyService::new()
//!  └─ run the subcommand
//!       ├─ host    start_discovery + host(), tick until joined, heartbeat
//!       ├─ browse  start_discovery, print get_lobbies() every second
//!       └─ join    join(), heartbeat
//! ```

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use lobby_core::LobbyFilter;
use lobby_node::application::LobbyService;
use lobby_node::infrastructure::storage::config::{default_config_path, load_config, NodeConfig};

/// Application tick.
const TICK: Duration = Duration::from_millis(50);
/// Ticks between two heartbeats / two lobby listings.
const TICKS_PER_REPORT: u64 = 20;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Two-player LAN lobby: host, browse, join.
#[derive(Debug, Parser)]
#[command(name = "lobby-node", about = "Host, discover and join two-player LAN lobbies", version)]
struct Cli {
    /// Path to a TOML config file.  Defaults to the platform config dir.
    #[arg(long, global = true, env = "LOBBY_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `network.discovery_port` from the config file.
    #[arg(long, global = true, env = "LOBBY_DISCOVERY_PORT")]
    discovery_port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Advertise a lobby and wait for one player to join.
    Host {
        /// TCP port to accept the session on; 0 picks a free port.
        #[arg(long)]
        port: Option<u16>,

        /// Lobby name shown to browsers.
        #[arg(long)]
        name: Option<String>,

        /// Extra advertisement field, `key=value`.  Repeatable.
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, Value)>,
    },
    /// List lobbies on the LAN.
    Browse {
        /// Only show lobbies with this status (`open` or `in_game`).
        #[arg(long)]
        status: Option<String>,
    },
    /// Join the lobby hosted at IP.
    Join {
        ip: IpAddr,

        /// Host's session port; defaults to `network.session_port`.
        #[arg(long)]
        port: Option<u16>,
    },
}

/// Parses `key=value`.  The value is read as a JSON scalar when it is one
/// (`3`, `true`, `"x"`), otherwise kept as a plain string.
fn parse_field(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    if key.is_empty() {
        return Err(format!("empty key in `{raw}`"));
    }
    let value = match serde_json::from_str::<Value>(value) {
        Ok(v) if !v.is_array() && !v.is_object() => v,
        _ => Value::String(value.to_string()),
    };
    Ok((key.to_string(), value))
}

impl Cli {
    fn load_node_config(&self) -> anyhow::Result<NodeConfig> {
        let path = match &self.config {
            Some(path) => path.clone(),
            None => match default_config_path() {
                Ok(path) => path,
                Err(_) => return Ok(self.apply_overrides(NodeConfig::default())),
            },
        };
        let config = load_config(&path).with_context(|| format!("loading {}", path.display()))?;
        Ok(self.apply_overrides(config))
    }

    fn apply_overrides(&self, mut config: NodeConfig) -> NodeConfig {
        if let Some(port) = self.discovery_port {
            config.network.discovery_port = port;
        }
        config
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_node_config()?;

    // `RUST_LOG` wins; otherwise the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.log_level)),
        )
        .init();

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => error!("failed to listen for Ctrl-C: {e}"),
        }
    });

    let mut service = LobbyService::new(config);

    match cli.command {
        Command::Host { port, name, fields } => {
            if let Err(e) = service.start_discovery() {
                // Hosting works without it; we only lose the listing.
                warn!("discovery unavailable: {e}");
            }
            let port = port.unwrap_or(service.config().network.session_port);
            let mut fields = fields;
            if let Some(name) = name {
                fields.push(("name".to_string(), Value::String(name)));
            }
            let addr = service.try_host(port, fields).context("hosting lobby")?;
            info!("lobby open on {addr}; waiting for a player.  Press Ctrl-C to exit.");
            run_session(&mut service, &running, "host").await;
        }
        Command::Browse { status } => {
            service.start_discovery().context("starting discovery")?;
            let filter = status.map_or_else(LobbyFilter::new, |s| LobbyFilter::new().with("status", s));
            browse(&mut service, &running, &filter).await;
        }
        Command::Join { ip, port } => {
            let port = port.unwrap_or(service.config().network.session_port);
            if !service.join(ip, port).await {
                bail!("could not join {ip}:{port}");
            }
            run_session(&mut service, &running, "client").await;
        }
    }

    service.stop();
    info!("lobby-node stopped");
    Ok(())
}

/// Ticks the service and exchanges heartbeats until Ctrl-C or disconnect.
async fn run_session(service: &mut LobbyService, running: &AtomicBool, role: &str) {
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut was_connected = false;
    let mut tick: u64 = 0;

    while running.load(Ordering::Relaxed) {
        ticker.tick().await;
        service.update();

        if !service.is_connected() {
            if was_connected {
                warn!("peer disconnected");
                break;
            }
            continue;
        }
        if !was_connected {
            if let Some(peer) = service.peer_addr() {
                info!("session with {peer} established");
            }
            was_connected = true;
        }

        if let Some(record) = service.receive() {
            info!("received {record}");
        }
        tick += 1;
        if tick % TICKS_PER_REPORT == 0 {
            let sent = service.send(&json!({ "tick": tick / TICKS_PER_REPORT, "from": role }));
            if !sent {
                warn!("heartbeat dropped");
            }
        }
    }
}

/// Prints the lobby list once per second until Ctrl-C.
async fn browse(service: &mut LobbyService, running: &AtomicBool, filter: &LobbyFilter) {
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut tick: u64 = 0;

    while running.load(Ordering::Relaxed) {
        ticker.tick().await;
        service.update();
        tick += 1;
        if tick % TICKS_PER_REPORT != 0 {
            continue;
        }

        let lobbies = service.get_lobbies(filter);
        println!("{} lobby(ies)", lobbies.len());
        for (addr, ad) in lobbies {
            let fields = serde_json::to_string(&ad.fields).unwrap_or_default();
            println!(
                "  {}:{}  status={}  players={}  {fields}",
                addr.ip(),
                ad.port,
                ad.status,
                ad.players
            );
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
