//! Routers of the two APIs.

pub mod factory;
pub mod ledger;

use axum::Json;
use oroboros_economy::ApiError;

use crate::error::HttpError;

/// Runs a synchronous service call on the blocking pool.
pub(crate) async fn blocking<T, F>(work: F) -> Result<Json<T>, HttpError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result.map(Json).map_err(HttpError::from),
        Err(e) => {
            tracing::error!(error = %e, "request worker failed");
            Err(HttpError::internal("request worker failed"))
        }
    }
}
