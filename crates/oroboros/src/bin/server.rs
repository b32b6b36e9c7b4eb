//! # OROBOROS Server
//!
//! Serves the ledger API and the scheduler API from one process.
//!
//! ## Production Deployment
//!
//! ```bash
//! # Default config path: config/server.toml
//! RUST_LOG=info ./oroboros_server config/server.toml
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use oroboros::{maintenance, AppState, ServerConfig, ServerError};
use oroboros_economy::SystemClock;
use tracing_subscriber::prelude::*;

const DEFAULT_CONFIG: &str = "config/server.toml";

#[tokio::main]
async fn main() -> ExitCode {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    match run(&path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, config = %path, "server stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(path: &str) -> Result<(), ServerError> {
    let config = ServerConfig::load(path)?;
    if config.service_token.is_none() {
        tracing::warn!("no service_token configured; ledger writes are closed");
    }

    let state = tokio::task::spawn_blocking({
        let config = config.clone();
        move || AppState::bootstrap(&config, Arc::new(SystemClock))
    })
    .await
    .map_err(|e| ServerError::Io(std::io::Error::other(e)))??;

    let _maintenance = maintenance::spawn(
        state.clone(),
        config.maintenance_interval(),
        config.reconcile_after(),
    );

    tracing::info!(
        bind = %config.bind,
        ledger_config = %config.ledger_config.display(),
        factory_config = %config.factory_config.display(),
        "OROBOROS server ready"
    );
    oroboros::serve(config.bind, state).await
}
