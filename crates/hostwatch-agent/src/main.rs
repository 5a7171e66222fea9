//! # hostwatch-agent
//!
//! Agent binary: loads settings, starts the reporting service, and runs
//! until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hostwatch_agent::{AgentService, SysinfoSampler};
use hostwatch_core::ErrorLog;

/// Hostwatch metrics agent.
#[derive(Parser, Debug)]
#[command(name = "hostwatch-agent", about = "Stream host metrics to a hostwatch dashboard")]
struct Cli {
    /// Path to the agent settings file.
    #[arg(long, short, default_value = "hostwatch-agent.json")]
    config: PathBuf,

    /// Log filter (overrides the settings file).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings = hostwatch_settings::load_agent_settings(&args.config)
        .with_context(|| format!("Failed to load settings from {}", args.config.display()))?;
    let level = args.log_level.as_deref().unwrap_or(&settings.log_level);
    hostwatch_core::logging::init_subscriber(level);

    tracing::info!(
        server_id = %settings.server_id,
        server_addr = %settings.server_addr,
        "hostwatch agent starting"
    );

    let errors = Arc::new(ErrorLog::new());
    let service = AgentService::new(settings, Arc::new(SysinfoSampler::new()), errors);
    service.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    service.stop().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
