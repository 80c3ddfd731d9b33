use anyhow::Result;
use clap::Parser;
use moult_handoff::{watch_signals, ProcessRespawner};
use tracing::info;

mod config;
mod server;
mod state;
mod telemetry;

use config::{Cli, ServerConfig};
use server::{Exit, Orchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::from_cli(cli)
        .map_err(|e| anyhow::anyhow!("Failed to load server configuration: {}", e))?;

    telemetry::init(config.log_format)
        .map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;

    info!("Moult Server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());
    config.log_config();

    // Subscribe before anything else so an early signal is not lost.
    let signals = watch_signals()?;

    let listener = server::open_listener(&config).await?;
    let respawner = ProcessRespawner::current()?;

    let orchestrator = Orchestrator::start(&config, listener, Box::new(respawner)).await?;
    match orchestrator.run(signals).await? {
        Exit::Stopped => info!("Moult Server stopped"),
        Exit::Respawned { pid } => info!(successor = pid, "Moult Server handed off to successor"),
    }

    telemetry::shutdown();

    Ok(())
}
