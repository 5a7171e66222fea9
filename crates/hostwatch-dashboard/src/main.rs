//! # hostwatch-dashboard
//!
//! Dashboard binary: loads settings, binds the HTTP server, follows settings
//! edits, and runs until ctrl-c.

#![deny(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hostwatch_core::{ErrorKind, ErrorLog, RetryExecutor, RetryPolicy};
use hostwatch_dashboard::Dashboard;
use hostwatch_settings::SettingsWatcher;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Hostwatch dashboard server.
#[derive(Parser, Debug)]
#[command(name = "hostwatch-dashboard", about = "Collect agent metrics and serve them to browsers")]
struct Cli {
    /// Path to the dashboard settings file.
    #[arg(long, short, default_value = "hostwatch-dashboard.json")]
    config: PathBuf,

    /// Log filter (overrides the settings file).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings = hostwatch_settings::load_dashboard_settings(&args.config)
        .with_context(|| format!("Failed to load settings from {}", args.config.display()))?;
    let level = args.log_level.as_deref().unwrap_or(&settings.log_level);
    hostwatch_core::logging::init_subscriber(level);

    let addr: SocketAddr = settings
        .bind_addr()
        .parse()
        .with_context(|| format!("Invalid bind address {}", settings.bind_addr()))?;
    info!(%addr, servers = settings.servers.len(), "hostwatch dashboard starting");

    let metrics = hostwatch_dashboard::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;
    let errors = Arc::new(ErrorLog::new());
    let dashboard = Dashboard::new(settings, errors.clone(), Some(metrics));

    let cancel = CancellationToken::new();
    let retry = RetryExecutor::new(RetryPolicy::default(), errors);
    let local = retry
        .run(&cancel, ErrorKind::Network, || {
            let dashboard = dashboard.clone();
            async move { dashboard.listen(addr).await }
        })
        .await
        .context("Failed to start HTTP server")?;
    info!(%local, "dashboard ready");

    let watch = match SettingsWatcher::new(&args.config) {
        Ok(watcher) => Some(tokio::spawn(dashboard.clone().follow_settings(watcher, cancel.clone()))),
        Err(e) => {
            warn!(error = %e, "settings watcher unavailable, live reload disabled");
            None
        }
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    info!("Shutting down...");
    cancel.cancel();
    if let Some(watch) = watch {
        let _ = watch.await;
    }
    dashboard.stop().await;
    info!("Shutdown complete");
    Ok(())
}
