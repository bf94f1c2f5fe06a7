//! # convoy-server
//!
//! Device agent for the convoy driving-safety monitoring system.
//!
//! ## Running
//!
//! ```bash
//! # Development, driver role, in-memory backend
//! cargo run --package convoy-server
//!
//! # Validator with a custom config file
//! CONVOY_CONFIG=./validator.toml cargo run --package convoy-server
//!
//! # In-vehicle logging: JSON files under {data_dir}/logs plus stdout
//! CONVOY_ENV=production ./convoy-server
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use convoy_core::Config;
use convoy_server::api::create_router;
use convoy_server::logging::{self, LogOutput};
use convoy_server::state::AppState;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::var_os("CONVOY_CONFIG") {
        Some(path) => Config::load_from(&PathBuf::from(path))?,
        None => Config::load()?,
    };

    let in_vehicle = std::env::var("CONVOY_ENV").is_ok_and(|env| env == "production");
    let output = if in_vehicle {
        LogOutput::device(&config.data_dir()?, config.device.role)
    } else {
        LogOutput::Console
    };
    logging::init(&output)?;
    info!(
        role = %config.device.role,
        device = %config.device.name,
        "Starting convoy-server"
    );

    let addr: SocketAddr = config
        .server
        .bind_address
        .parse()
        .context("server.bind_address is not a socket address")?;

    let state = AppState::new(config)?;
    state.start_background().await?;

    let app = create_router(state.clone());
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.shutdown().await;
    info!("convoy-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for the shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
