//! # attendo-server
//!
//! HTTP server for the attendo presence and attendance service.
//!
//! This binary provides:
//! - REST API for sighting ingestion, presence and attendance queries
//! - A background sweep that ages silent devices into departures
//! - OpenAPI documentation via Swagger UI
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development
//! cargo run --package attendo-server
//!
//! # Explicit config file
//! ./attendo-server /etc/attendo/config.toml
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use attendo_core::config::default_config_path;
use attendo_core::{sweep, Config};
use attendo_server::api;
use attendo_server::logging;
use attendo_server::state::SharedState;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args_os()
        .nth(1)
        .map_or_else(default_config_path, PathBuf::from);
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    logging::init(config.server.production)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "Starting attendo-server"
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server.host / server.port")?;
    let sweep_period = config.sweep_interval();

    let state = SharedState::from_config(config).await?;

    let cancel_token = CancellationToken::new();
    let sweeper = sweep::spawn(state.tracker().clone(), sweep_period, cancel_token.clone());

    let app = api::create_router(state);
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    let shutdown_token = cancel_token.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
            shutdown_token.cancel();
        })
        .await?;

    cancel_token.cancel();
    if let Err(e) = sweeper.await {
        error!(error = %e, "Sweep task panicked");
    }
    info!("attendo-server stopped");

    Ok(())
}
