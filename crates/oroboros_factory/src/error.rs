//! # Factory Error Types
//!
//! All errors that can occur in the production scheduler.

use oroboros_economy::{ApiError, EconomyError, ErrorCode};
use serde_json::json;
use thiserror::Error;

use crate::limits::LimitBreach;
use crate::task::{TaskId, TaskStatus};

/// Errors that can occur in the scheduler.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FactoryError {
    /// Malformed request, rejected before any side effect.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown recipe.
    #[error("recipe not found: {0}")]
    RecipeNotFound(String),

    /// Unknown task.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// The task belongs to someone else.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The transition is not allowed from the task's current state.
    #[error("task {task} is {status}, cannot {action}")]
    InvalidState {
        /// Task.
        task: TaskId,
        /// Status at the time of the request.
        status: TaskStatus,
        /// Attempted transition.
        action: &'static str,
    },

    /// Every slot the operation class may use is taken.
    #[error("no free {operation_class} slot ({used}/{total} in use)")]
    NoFreeSlot {
        /// Operation class.
        operation_class: String,
        /// Occupied slots.
        used: u32,
        /// Slots available to the class.
        total: u32,
    },

    /// A usage cap was reached.
    #[error("{0}")]
    LimitExceeded(LimitBreach),

    /// The ledger confirmed a rejection; passed to the caller as is.
    #[error("ledger rejected the request: {0}")]
    Ledger(ApiError),

    /// The ledger did not answer within the retry budget.
    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(String),

    /// Task store failure.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Invalid configuration file.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Classifier or ledger-side failure.
    #[error(transparent)]
    Economy(#[from] EconomyError),
}

impl FactoryError {
    /// Maps the error onto the wire taxonomy.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) | Self::InvalidState { .. } => ErrorCode::ValidationError,
            Self::RecipeNotFound(_) | Self::TaskNotFound(_) => ErrorCode::NotFound,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::NoFreeSlot { .. } | Self::LimitExceeded(_) => ErrorCode::LimitExceeded,
            Self::Ledger(api) => api.error_code,
            Self::Economy(err) => err.error_code(),
            Self::LedgerUnavailable(_) | Self::Storage(_) | Self::InvalidConfig(_) => {
                ErrorCode::InternalError
            }
        }
    }

    /// Wire form, with structured details.
    #[must_use]
    pub fn to_api(&self) -> ApiError {
        match self {
            Self::Ledger(api) => api.clone(),
            Self::LimitExceeded(breach) => ApiError::new(self.error_code(), self.to_string())
                .with_details(json!(breach)),
            Self::NoFreeSlot {
                operation_class,
                used,
                total,
            } => ApiError::new(self.error_code(), self.to_string()).with_details(json!({
                "limit_type": "slots",
                "window": operation_class,
                "current": used,
                "max": total,
                "reset_time": null,
            })),
            _ => ApiError::new(self.error_code(), self.to_string()),
        }
    }
}

impl From<FactoryError> for ApiError {
    fn from(err: FactoryError) -> Self {
        err.to_api()
    }
}

/// Result type for scheduler operations.
pub type FactoryResult<T> = Result<T, FactoryError>;
