//! CLI for repsub
//!
//! Subcommands:
//! - `server`: run one broker node (also the default with no subcommand)

use std::sync::Arc;

use clap::{Parser, Subcommand};
use repsub::cluster::discovery::PortScanDiscovery;
use repsub::config::load_config;
use repsub::node::NodeContext;
use repsub::utils::logging;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "repsub")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start a broker node using the environment configuration
    Server,
}

#[tokio::main]
async fn main() {
    logging::init("info");

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Server) {
        Command::Server => {
            if let Err(e) = run_server().await {
                error!("Server failed: {}", e);
                std::process::exit(1);
            }
        }
    }
}

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    let discovery = Arc::new(PortScanDiscovery::from_settings(&config));

    let ctx = NodeContext::start(config, discovery).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully.");
    ctx.stop().await;

    Ok(())
}
