//! Pulsecast Server - Standalone headless server for Pulsecast.
//!
//! This binary wires the session supervisor, scheduler and health monitor
//! from `pulsecast-core`, reconciles state left behind by a previous run,
//! and serves the HTTP/WebSocket control surface until a shutdown signal
//! arrives.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use pulsecast_core::{bootstrap_services, start_server};
use tokio::signal;

use crate::config::ServerConfig;

/// Pulsecast Server - Headless 24/7 live-streaming control plane.
#[derive(Parser, Debug)]
#[command(name = "pulsecast-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "PULSECAST_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "PULSECAST_BIND_PORT")]
    port: Option<u16>,

    /// SQLite database path (overrides config file).
    #[arg(short = 'd', long, env = "PULSECAST_DATABASE_PATH")]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Pulsecast Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.bind_port = port;
    }
    if let Some(database) = args.database {
        config.database_path = database;
    }

    log::info!(
        "Configuration: bind_port={}, database={}, encoder={}, max_streams={}",
        config.bind_port,
        config.database_path.display(),
        config.encoder_binary.display(),
        config.max_concurrent_streams
    );

    // Bootstrap services
    let services =
        bootstrap_services(config.to_core_config()).context("Failed to bootstrap services")?;
    log::info!("Services bootstrapped successfully");

    // Reconcile state from a previous run BEFORE accepting any traffic:
    // orphaned encoder processes, ghost sessions, and scheduler timers.
    services
        .reconcile_on_boot()
        .await
        .context("Boot reconciliation failed")?;

    // Start background tasks (supervisor watcher, health monitor)
    services.start_background_tasks();
    log::info!("Background tasks started");

    // Spawn the HTTP server on the main tokio runtime.
    let app_state = services.app_state();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(app_state).await {
            log::error!("Server error: {}", e);
        }
    });

    log::info!("HTTP server started on port {}", config.bind_port);

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");

    // Graceful shutdown. Encoder subprocesses stay up on purpose; the next
    // boot re-adopts or reaps them.
    services.shutdown().await;
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives.
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
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
