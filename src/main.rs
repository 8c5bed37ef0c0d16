//! mesh-relay node
//!
//! Runs one relay node: a star host or client over TCP plus the flood relay,
//! reads lines from stdin and prints every message that arrives.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use mesh_relay::mesh::BroadcastRadio;
use mesh_relay::{MeshConfig, MessageRouter, SimulatedAir, TcpTransport};

#[derive(Parser)]
#[command(name = "mesh-relay")]
#[command(about = "Relay short text messages across a star socket and a broadcast mesh", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Display name sent with star messages
    #[arg(short, long, global = true)]
    nickname: Option<String>,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Scan for mesh frames with the local Bluetooth adapter
    #[cfg(feature = "ble")]
    #[arg(long, global = true)]
    ble: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept star connections
    Host {
        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:7878")]
        listen: String,
    },

    /// Connect to a star host
    Join {
        /// Local bind address (unused while joined)
        #[arg(short, long, default_value = "127.0.0.1:0")]
        listen: String,

        /// Host address
        #[arg(short, long)]
        peer: String,
    },
}

fn load_config(cli: &Cli) -> Result<MeshConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            MeshConfig::from_json_str(&json).context("Invalid configuration")?
        }
        None => MeshConfig::new(),
    };

    if let Some(nickname) = &cli.nickname {
        config.set_nickname(nickname).context("Invalid nickname")?;
    }
    Ok(config)
}

async fn open_radio(cli: &Cli, node_name: &str) -> Result<Arc<dyn BroadcastRadio>> {
    #[cfg(feature = "ble")]
    if cli.ble {
        let radio = mesh_relay::mesh::BtleRadio::open()
            .await
            .context("Failed to open Bluetooth adapter")?;
        return Ok(Arc::new(radio));
    }
    let _ = cli;

    // nobody else shares this medium; it keeps the flood relay exercised
    Ok(Arc::new(SimulatedAir::new().radio(node_name)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let config = load_config(&cli)?;
    let listen = match &cli.command {
        Commands::Host { listen } | Commands::Join { listen, .. } => listen.clone(),
    };

    let radio = open_radio(&cli, &config.nickname).await?;
    let transport = Arc::new(TcpTransport::new(listen));
    let router = MessageRouter::new(config, radio, transport).context("Failed to build router")?;

    info!("=== mesh-relay node {} ===", router.nickname());

    if let Err(e) = router.start_flood_relay().await {
        warn!("Flood relay unavailable: {}", e);
    }

    match &cli.command {
        Commands::Host { .. } => {
            let address = router.start_star_host().await.context("Failed to start star host")?;
            println!("hosting on {}", address);
        }
        Commands::Join { peer, .. } => {
            router
                .connect_to(peer)
                .await
                .with_context(|| format!("Failed to join {}", peer))?;
            println!("joined {}", peer);
        }
    }

    let mut updates = router.subscribe();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(message) if !message.is_local() => println!("{}", message),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Skipped {} history updates", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" => break,
            "/status" => {
                let status = router.status().await;
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
            "/peers" => {
                println!("star: {:?}", router.star_peers());
                println!("mesh: {:?}", router.mesh_peers());
            }
            text => {
                if let Err(e) = router.send_local(text).await {
                    error!("Failed to send: {}", e);
                }
            }
        }
    }

    router.close().await;
    info!("Node stopped");
    Ok(())
}
