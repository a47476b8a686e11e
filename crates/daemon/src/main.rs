//! circuitnet daemon
//!
//! Runs a node that relays circuits for others and echoes circuits addressed
//! to it, or acts as a one-shot client dialing and probing relays.

use anyhow::{bail, Context, Result};
use circuitnet_common::{NodeConfig, PeerInfo};
use circuitnet_core::{CircuitAddress, Host};
use circuitnet_daemon::{CircuitNode, NodeStats};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// circuitnet - circuit relay node
#[derive(Parser)]
#[command(name = "circuitnet-daemon")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until interrupted
    Run {
        /// Relay circuits for other peers
        #[arg(long)]
        hop: bool,

        /// Dial destinations on demand when relaying
        #[arg(long)]
        active: bool,
    },

    /// Open a circuit and pipe stdin/stdout through it
    Dial {
        /// Circuit address, e.g. /ip4/1.2.3.4/udp/4050/quic/p2p/<relay>/p2p-circuit/p2p/<dest>
        address: String,
    },

    /// Ask a peer whether it relays for others
    Probe {
        /// Peer address, e.g. /ip4/1.2.3.4/udp/4050/quic/p2p/<id>
        peer: String,
    },

    /// Write a default configuration file
    InitConfig {
        /// Where to write it
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run { hop, active } => {
            let mut config = load_config(cli.config.as_deref())?;
            config.relay.hop |= hop;
            config.relay.active |= active;
            run(config).await
        }
        Commands::Dial { address } => {
            let config = client_config(cli.config.as_deref())?;
            dial(config, &address).await
        }
        Commands::Probe { peer } => {
            let config = client_config(cli.config.as_deref())?;
            probe(config, &peer).await
        }
        Commands::InitConfig { path } => {
            if path.exists() {
                bail!("{:?} already exists", path);
            }
            NodeConfig::default().to_file(&path)?;
            println!("Wrote default configuration to {:?}", path);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    match path {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            NodeConfig::from_file(path).with_context(|| format!("loading {:?}", path))
        }
        None => {
            info!("No configuration file given, using defaults");
            Ok(NodeConfig::default())
        }
    }
}

/// Configuration for short-lived client commands: an ephemeral port and no
/// inbound circuits
fn client_config(path: Option<&Path>) -> Result<NodeConfig> {
    let mut config = load_config(path)?;
    config.listen_addr = "0.0.0.0:0".to_string();
    config.accept_relayed = false;
    Ok(config)
}

async fn run(config: NodeConfig) -> Result<()> {
    info!("Starting circuitnet daemon v{}", env!("CARGO_PKG_VERSION"));
    let node = CircuitNode::start(&config).await?;
    print_node_stats(&node.stats(), &node.local_info());

    info!("Node is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received");
    node.stop();
    Ok(())
}

async fn dial(config: NodeConfig, address: &str) -> Result<()> {
    let address: CircuitAddress = address.parse()?;
    let node = CircuitNode::start(&config).await?;

    let conn = node.relay().dialer().dial(&address).await?;
    info!("Circuit to {} open", conn.remote_peer());

    let (mut reader, mut writer) = tokio::io::split(conn);
    let upstream = async {
        tokio::io::copy(&mut tokio::io::stdin(), &mut writer).await?;
        writer.shutdown().await
    };
    let downstream = async {
        let mut stdout = tokio::io::stdout();
        tokio::io::copy(&mut reader, &mut stdout).await?;
        stdout.flush().await
    };
    let result = tokio::try_join!(upstream, downstream);

    node.stop();
    result.context("circuit failed")?;
    Ok(())
}

async fn probe(config: NodeConfig, peer: &str) -> Result<()> {
    let peer: PeerInfo = peer.parse()?;
    let node = CircuitNode::start(&config).await?;

    node.host().connect(&peer).await?;
    let result = node.relay().can_hop(&peer.id).await;
    node.stop();

    match result {
        Ok(true) => println!("{} relays circuits", peer.id),
        Ok(false) => println!("{} does not relay circuits", peer.id),
        Err(e) => {
            warn!("Probe of {} failed: {}", peer.id, e);
            return Err(e.into());
        }
    }
    Ok(())
}

fn print_node_stats(stats: &NodeStats, info: &PeerInfo) {
    println!("\n========================================");
    println!("         circuitnet Node Status");
    println!("========================================");
    println!("Peer ID:          {}", stats.peer_id);
    println!("Address:          {}", info);
    println!("Listening on:     {}", stats.listen_addr);
    println!("Peers:            {}", stats.connected_peers);
    println!("Known relays:     {}", stats.known_relays);
    println!("Hop:              {}", if stats.hop { "yes" } else { "no" });
    println!("Active:           {}", if stats.active { "yes" } else { "no" });
    println!("========================================\n");
}
