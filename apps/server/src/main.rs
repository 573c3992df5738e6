//! Chorus Server - headless coordinator for a shared-listening room.
//!
//! This binary wires up the core library and runs it as a background
//! daemon: one process serving HTTP, the WebSocket channel, and the
//! playback reconciliation loop.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;

use crate::config::ServerConfig;

/// Chorus Server - shared-listening room coordinator.
#[derive(Parser, Debug)]
#[command(name = "chorus-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "CHORUS_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Listen port (overrides config file).
    #[arg(short = 'p', long, env = "CHORUS_LISTEN_PORT")]
    port: Option<u16>,

    /// Data directory for persistent state (queue, sessions, history).
    #[arg(short = 'd', long, env = "CHORUS_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Chorus Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.listen_port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = Some(data_dir);
    }

    log::info!(
        "Configuration: listen_port={}, poll_interval={}ms, data_dir={}",
        config.listen_port,
        config.poll_interval_ms,
        config
            .data_dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "(none)".into())
    );

    // Bootstrap services and restore persisted state
    let mut services = chorus_core::bootstrap_services(config.to_core_config())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bootstrap services: {e}"))?;

    services.start_background_tasks();
    log::info!("Background tasks started");

    // Spawn the HTTP + WebSocket server
    let app_state = services.app_state();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = chorus_core::start_server(app_state).await {
            log::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");

    // Graceful shutdown: stop tasks and write final state
    services.shutdown().await;
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
