//! Startup errors and the HTTP error envelope.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use oroboros_economy::{ApiError, EconomyError, ErrorCode};
use oroboros_factory::FactoryError;
use thiserror::Error;

/// Errors that stop the server from starting or serving.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Socket or file failure.
    #[error("server io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed server configuration.
    #[error("invalid server config: {0}")]
    InvalidConfig(String),

    /// Ledger could not be built.
    #[error(transparent)]
    Economy(#[from] EconomyError),

    /// Scheduler could not be built.
    #[error(transparent)]
    Factory(#[from] FactoryError),
}

/// An [`ApiError`] with the HTTP status it is sent with.
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    error: ApiError,
}

impl HttpError {
    /// Missing or wrong credentials.
    #[must_use]
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            error: ApiError::new(ErrorCode::Forbidden, message),
        }
    }

    /// Body or query that could not be parsed.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::new(ErrorCode::ValidationError, message).into()
    }

    /// Failure of the server itself.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::new(ErrorCode::InternalError, message).into()
    }

    /// Status the error is sent with.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// The envelope.
    #[must_use]
    pub const fn error(&self) -> &ApiError {
        &self.error
    }
}

/// HTTP status of each taxonomy code.
#[must_use]
pub const fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
        ErrorCode::InsufficientItems => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::LimitExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ApiError> for HttpError {
    fn from(error: ApiError) -> Self {
        Self {
            status: status_for(error.error_code),
            error,
        }
    }
}

impl From<JsonRejection> for HttpError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for HttpError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (self.status, Json(self.error)).into_response()
    }
}
