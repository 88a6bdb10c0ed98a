//! Wagate server - multi-tenant WhatsApp gateway over HTTP/WebSocket.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use wagate_server::{config, logging, routes, state};

use config::Config;
use logging::{LogConfig, LogFormat};
use state::AppState;

/// Wagate server - one WhatsApp session per tenant phone number.
#[derive(Parser, Debug)]
#[command(name = "wagate-server")]
#[command(about = "HTTP/WebSocket gateway managing per-tenant WhatsApp sessions")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override port from config
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the bridge WebSocket URL
    #[arg(long, value_name = "URL")]
    bridge_url: Option<String>,

    /// Do not reopen sessions found in the credentials directory
    #[arg(long)]
    no_restore: bool,

    /// Enable verbose logging (INFO level for every target)
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable trace logging, including bridge frame types
    #[arg(long)]
    trace: bool,

    /// Quiet mode (WARN and ERROR only)
    #[arg(short, long)]
    quiet: bool,

    /// Set log level for specific targets (e.g., "registry=debug").
    /// Can be specified multiple times. Targets are prefixed with "wagate::" automatically.
    #[arg(long = "log", value_name = "TARGET=LEVEL")]
    log_overrides: Vec<String>,

    /// Log output format
    #[arg(long = "log-format", value_name = "FORMAT", default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = LogConfig::from_cli(
        cli.verbose,
        cli.debug,
        cli.trace,
        cli.quiet,
        cli.log_overrides,
        cli.log_format,
    );
    logging::init(&log_config)?;

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(url) = cli.bridge_url {
        config.bridge_url = url;
    }
    if cli.no_restore {
        config.restore_on_startup = false;
    }

    tracing::info!(
        target: "wagate::startup",
        "Loaded configuration (port: {}, bridge: {}, credentials: {})",
        config.port,
        config.bridge_url,
        config.credentials_dir.display()
    );

    let state = Arc::new(AppState::new(config.clone())?);
    tracing::info!(target: "wagate::startup", "Initialized application state");

    if config.restore_on_startup {
        let restored = state.registry.restore_persisted().await?;
        tracing::info!(target: "wagate::startup", "Restored {} sessions from stored credentials", restored);
    }

    let app = routes::router(state.clone());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!(target: "wagate::startup", "Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Credentials stay on disk so the next start resumes every session.
    state.registry.shutdown().await;
    tracing::info!(target: "wagate::startup", "Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(target: "wagate::startup", "Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!(target: "wagate::startup", "Shutdown signal received");
}
