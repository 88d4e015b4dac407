use clap::{Parser, Subcommand};
use mini_sync::utils::setup_logging;
use mini_sync::{Config, Node, Result};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mini-sync")]
#[command(about = "Keep a directory synchronised between peers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a sync node
    Start {
        /// Directory to synchronise
        #[arg(short, long)]
        dir: Option<PathBuf>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Peer address to connect to (host:port), may be repeated
        #[arg(long = "peer")]
        peers: Vec<String>,
        /// Node name for identification
        #[arg(short, long)]
        name: Option<String>,
        /// Only peers announcing the same logical library are accepted
        #[arg(short, long)]
        logical_name: Option<String>,
        /// JSON config file; flags override its values
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            dir,
            port,
            peers,
            name,
            logical_name,
            config,
        } => {
            let mut config = match config {
                Some(path) => Config::load(&path)?,
                None => Config::default(),
            };
            if let Some(dir) = dir {
                config.library_dir = dir;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if !peers.is_empty() {
                config.peers = peers;
            }
            if let Some(name) = name {
                config.node_name = name;
            }
            if let Some(logical_name) = logical_name {
                config.logical_name = logical_name;
            }

            setup_logging(&config.node_name)?;
            let mut node = Node::new(config).await?;
            node.start().await?;
        }
    }

    Ok(())
}
