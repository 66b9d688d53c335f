//! hybrid-node: runs one [`NetworkManager`] with the echo handler.
//!
//! The node listens for peers, optionally connects to others, and pings every
//! established connection at a fixed interval.  Pings travel over UDP once a
//! link's UDP path is verified and over TCP otherwise, so the debug log shows
//! the fallback working in real time.
//!
//! # Usage
//!
//! ```text
//! hybrid-node [OPTIONS]
//!
//! Options:
//!   --config <PATH>        Config file [default: platform config dir]
//!   --tcp-port <PORT>      TCP listening port
//!   --udp-port <PORT>      Requested UDP port
//!   --bind <IP>            Bind address for both sockets
//!   --greeting <TEXT>      Greeting of the echo handler
//!   --connect <ADDR>       Peer to connect to (repeatable)
//!   --interval-ms <MS>     Ping interval, 0 disables pings
//!   --no-listen            Do not accept inbound connections
//! ```
//!
//! Command-line values override the config file; each option also reads a
//! `HYBRID_*` environment variable.  Logging honours `RUST_LOG` and falls back
//! to the config file's `log_level`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use hybrid_manager::infrastructure::storage::config::{default_config_path, load_config};
use hybrid_manager::{EchoHandler, EchoMessage, NetworkManager, NodeConfig, Probe};

/// Grace period for reader tasks to report `connection_lost` after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Hybrid TCP/UDP node with an echo handler.
#[derive(Debug, Parser)]
#[command(
    name = "hybrid-node",
    about = "Hybrid TCP/UDP peer node running the echo handler",
    version
)]
struct Cli {
    /// Path of the TOML config file.
    #[arg(long, env = "HYBRID_CONFIG")]
    config: Option<PathBuf>,

    /// TCP listening port.
    #[arg(long, env = "HYBRID_TCP_PORT")]
    tcp_port: Option<u16>,

    /// Requested UDP port; an unavailable port falls back to an ephemeral one.
    #[arg(long, env = "HYBRID_UDP_PORT")]
    udp_port: Option<u16>,

    /// IP address both sockets bind to.
    #[arg(long, env = "HYBRID_BIND")]
    bind: Option<String>,

    /// Greeting the echo handler registers under.
    #[arg(long, env = "HYBRID_GREETING")]
    greeting: Option<String>,

    /// Peer address to connect to at startup; may be repeated.
    #[arg(long = "connect", value_name = "ADDR")]
    connect: Vec<SocketAddr>,

    /// Milliseconds between pings to every connection; 0 disables pings.
    #[arg(long, env = "HYBRID_PING_INTERVAL_MS")]
    interval_ms: Option<u64>,

    /// Run without a TCP listener.
    #[arg(long)]
    no_listen: bool,
}

impl Cli {
    /// Overlays command-line values on `config`.
    fn apply(&self, config: &mut NodeConfig) {
        if let Some(port) = self.tcp_port {
            config.network.tcp_port = port;
        }
        if let Some(port) = self.udp_port {
            config.network.udp_port = port;
        }
        if let Some(bind) = &self.bind {
            config.network.bind_address = bind.clone();
        }
        if let Some(greeting) = &self.greeting {
            config.node.greeting = greeting.clone();
        }
        if let Some(ms) = self.interval_ms {
            config.node.ping_interval_ms = ms;
        }
        if self.no_listen {
            config.network.accept_connections = false;
        }
        config.network.peers.extend(self.connect.iter().copied());
    }

    fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .or_else(|| default_config_path().ok())
            .unwrap_or_else(|| PathBuf::from("hybridnet.toml"))
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config_path();
    let mut config = load_config(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    cli.apply(&mut config);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.node.log_level)),
        )
        .init();

    info!("hybrid-node starting (config {})", config_path.display());

    let listen = config.listen_config().context("invalid network settings")?;
    let net = NetworkManager::listen_with(listen)
        .await
        .context("failed to start network manager")?;

    let echo = Arc::new(EchoHandler::new(config.node.greeting.clone()));
    net.add_handler(Arc::clone(&echo))
        .context("failed to register echo handler")?;

    for peer in &config.network.peers {
        match net.connect(Arc::clone(&echo), *peer) {
            Ok(id) => info!("connecting to {peer} as {id}"),
            Err(e) => warn!("cannot connect to {peer}: {e}"),
        }
    }

    let pinger = (config.node.ping_interval_ms > 0).then(|| {
        tokio::spawn(ping_loop(
            net.clone(),
            Duration::from_millis(config.node.ping_interval_ms),
        ))
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("received Ctrl+C; shutting down");

    if let Some(pinger) = pinger {
        pinger.abort();
    }
    net.shutdown();
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    info!("hybrid-node stopped");
    Ok(())
}

/// Sends a `Ping` to every established connection once per `interval`.
async fn ping_loop(net: NetworkManager, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    let mut seq = 0u64;
    loop {
        ticker.tick().await;
        seq += 1;
        for id in net.connection_ids() {
            let udp = net.get_udp_status(id);
            match net.send(id, &EchoMessage::Ping(Probe::now(seq))) {
                Ok(()) => debug!("ping {seq} to {id} via {}", if udp { "UDP" } else { "TCP" }),
                Err(e) => debug!("ping {seq} to {id} not sent: {e}"),
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
