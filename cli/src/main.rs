// meshlink-cli: desktop harness for the mesh core
//
// Runs a Wi-Fi-only node over TCP with static peers and prints what the
// aggregate transport reports.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use meshlink_core::transport::NoServiceDiscovery;
use meshlink_core::{MeshBuilder, MeshEvent, NodeId};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "meshlink")]
#[command(about = "Meshlink: local mesh transport node", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a mesh node until Ctrl-C
    Run {
        /// Address to listen on (overrides config)
        #[arg(short, long)]
        listen: Option<SocketAddr>,
        /// Peer to dial; may be repeated
        #[arg(short, long)]
        connect: Vec<SocketAddr>,
        /// Text sent to every peer once it connects
        #[arg(short, long)]
        send: Option<String>,
    },
    /// Print a freshly generated node id
    Id,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    /// Print the config file location
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    meshlink_core::init_logging(if cli.verbose { "debug" } else { "warn" });

    match cli.command {
        Commands::Run {
            listen,
            connect,
            send,
        } => cmd_run(listen, connect, send).await,
        Commands::Id => cmd_id(),
        Commands::Config { action } => cmd_config(action),
    }
}

fn cmd_id() -> Result<()> {
    println!("{}", NodeId::generate());
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
    }

    Ok(())
}

async fn cmd_run(
    listen: Option<SocketAddr>,
    connect: Vec<SocketAddr>,
    send: Option<String>,
) -> Result<()> {
    let mut config = config::Config::load()?;
    if let Some(listen) = listen {
        config.core.wifi.listen_addr = listen;
    }
    debug!("Running with {:?}", config);

    let node_id = NodeId::generate();
    let (mesh, mut events) = MeshBuilder::new(config.app_id, node_id, config.core.clone())
        .with_wifi(Box::new(NoServiceDiscovery))
        .build()
        .context("Invalid mesh configuration")?;

    println!("{}", "Meshlink starting...".bold());
    println!();
    println!("Node ID: {}", node_id.to_string().bright_cyan());

    mesh.start().context("Failed to start mesh")?;
    let wifi = mesh.wifi().context("Wi-Fi transport missing")?;

    // The listener is bound asynchronously by the transport task
    let mut local_addr = None;
    for _ in 0..50 {
        local_addr = wifi.local_addr().await?;
        if local_addr.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    match local_addr {
        Some(addr) => println!("{} Listening on {}", "✓".green(), addr),
        None => println!("{} Not listening, dialing only", "!".yellow()),
    }

    for peer in config.peers.iter().chain(connect.iter()) {
        println!("{} Dialing {}", "→".bright_blue(), peer);
        wifi.connect(*peer)?;
    }
    println!();

    let mut peers = 0usize;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    MeshEvent::LinkConnected(link) => {
                        peers += 1;
                        println!(
                            "{} Connected: node {} ({} peers)",
                            "✓".green(),
                            link.node_id().to_string().bright_cyan(),
                            peers
                        );
                        if let Some(text) = &send {
                            link.send_frame(text.as_bytes().to_vec())?;
                        }
                    }
                    MeshEvent::LinkDisconnected(link) => {
                        peers = peers.saturating_sub(1);
                        println!(
                            "{} Disconnected: node {} ({} peers)",
                            "✗".red(),
                            link.node_id().to_string().bright_cyan(),
                            peers
                        );
                    }
                    MeshEvent::FrameReceived { link, data } => {
                        println!(
                            "{} {}: {}",
                            "←".bright_blue(),
                            link.node_id().to_string().bright_cyan(),
                            String::from_utf8_lossy(&data)
                        );
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Shutting down...");
                break;
            }
        }
    }

    mesh.stop()?;
    info!("Mesh stopped with {} peers connected", peers);
    // Let queued disconnects reach the sockets
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}
