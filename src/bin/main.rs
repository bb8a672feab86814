//! llmgate binary.
//!
//! Loads the settings file, brings up the model session and serves the HTTP
//! API until SIGINT or SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use llmgate_core::{server, GatewayConfig, ModelSession, ServerState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "llmgate=info,tower_http=info";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file
    #[arg(short, long, env = "LLMGATE_CONFIG", default_value = "config/settings.toml")]
    config: PathBuf,

    /// Override the bind host
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port
    #[arg(short, long)]
    port: Option<u16>,
}

/// Console logging, or a daily rolling file when `LLMGATE_LOG_DIR` is set.
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || {
        EnvFilter::builder().parse_lossy(
            std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_owned()),
        )
    };

    if let Ok(log_dir) = std::env::var("LLMGATE_LOG_DIR") {
        let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "llmgate.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(non_blocking)
            .init();

        info!("File logging enabled to {}/llmgate.log", log_dir);
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .init();
        None
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Received shutdown signal");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging();

    let mut config = GatewayConfig::load(&cli.config)
        .with_context(|| format!("Failed to load settings from {}", cli.config.display()))?;

    let mut server_builder = config.server.clone().to_builder().from_env();
    if let Some(host) = cli.host {
        server_builder = server_builder.host(host);
    }
    if let Some(port) = cli.port {
        server_builder = server_builder.port(port);
    }
    config.server = server_builder.build();
    config.validate().context("Invalid server overrides")?;

    let session = Arc::new(ModelSession::from_config(&config));
    session
        .start()
        .await
        .context("Failed to start the model session")?;

    let addr: SocketAddr = config
        .server
        .bind_address()
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.server.bind_address()))?;

    let state = ServerState::new(session.clone(), config.server.clone());
    let served = server::start_server(addr, state, shutdown_signal()).await;

    session.stop();
    served?;

    info!("llmgate shut down cleanly");
    Ok(())
}
