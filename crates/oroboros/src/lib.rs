//! # OROBOROS
//!
//! The HTTP edge over the item ledger and the production scheduler.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            OROBOROS SERVER                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   axum (tokio)                                                          │
//! │   ┌──────────────────────┐          ┌──────────────────────┐            │
//! │   │  Ledger API          │          │  Scheduler API       │            │
//! │   │  /inventory          │          │  /recipes            │            │
//! │   │  /add-items /adjust  │          │  /factory/start ...  │            │
//! │   │  /reserve ...        │          │                      │            │
//! │   └──────────┬───────────┘          └──────────┬───────────┘            │
//! │              │ spawn_blocking                   │ spawn_blocking         │
//! │   ┌──────────▼───────────┐  InProcess ┌─────────▼────────────┐          │
//! │   │  oroboros_economy    │<───────────│  oroboros_factory    │          │
//! │   │  (LedgerService)     │   Ledger   │  (FactoryService)    │          │
//! │   └──────────────────────┘            └──────────────────────┘          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `auth`: header credentials
//! - `config`: `ServerConfig`
//! - `maintenance`: periodic reconciliation and snapshots
//! - `routes`: the two routers

pub mod auth;
pub mod config;
pub mod error;
pub mod maintenance;
pub mod routes;
pub mod state;

use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;

pub use oroboros_economy as economy;
pub use oroboros_factory as factory;

pub use auth::Credentials;
pub use config::ServerConfig;
pub use error::{HttpError, ServerError};
pub use state::AppState;

/// Both APIs on one router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(routes::ledger::router())
        .merge(routes::factory::router())
        .with_state(state)
}

/// Serves until the listener fails.
///
/// # Errors
///
/// Returns `Io` if the address cannot be bound or the server stops.
pub async fn serve(addr: SocketAddr, state: AppState) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests;
