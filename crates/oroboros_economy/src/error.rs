//! # Economy Error Types
//!
//! All errors that can occur in the ledger.

use thiserror::Error;

use crate::api::{ApiError, ErrorCode, MissingItemView};
use crate::classifier::ClassifierKind;
use crate::item::MissingItem;

/// Errors that can occur in the ledger.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EconomyError {
    /// Malformed or missing fields, rejected before any side effect.
    #[error("validation failed: {0}")]
    Validation(String),

    /// One or more stacks cannot cover the request.
    #[error("insufficient items: {} stack(s) short", .0.len())]
    InsufficientItems(Vec<MissingItem>),

    /// A classifier code is not registered.
    #[error("unknown {kind} code: {code}")]
    UnknownCode {
        /// Classifier family.
        kind: ClassifierKind,
        /// The code that failed to resolve.
        code: String,
    },

    /// A classifier id has no code.
    #[error("unknown {kind} id: {id}")]
    UnknownId {
        /// Classifier family.
        kind: ClassifierKind,
        /// The id that failed to resolve.
        id: u32,
    },

    /// Referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The record belongs to someone else, or the caller lacks the credential.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The request collides with an already committed batch.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Operation log I/O failed; the transaction was not applied.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Invalid configuration file.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A balance sum left the i64 range.
    #[error("arithmetic overflow in ledger calculation")]
    ArithmeticOverflow,
}

impl EconomyError {
    /// Maps the error onto the wire taxonomy.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) | Self::UnknownCode { .. } => ErrorCode::ValidationError,
            Self::InsufficientItems(_) => ErrorCode::InsufficientItems,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::UnknownId { .. }
            | Self::Storage(_)
            | Self::InvalidConfig(_)
            | Self::ArithmeticOverflow => ErrorCode::InternalError,
        }
    }
}

impl From<EconomyError> for ApiError {
    /// Wire form with raw ids. Services that can resolve codes render
    /// shortfalls themselves.
    fn from(err: EconomyError) -> Self {
        match &err {
            EconomyError::InsufficientItems(missing) => {
                let items: Vec<MissingItemView> = missing
                    .iter()
                    .map(|m| MissingItemView {
                        item: m.item.to_string(),
                        collection: m.variant.collection.to_string(),
                        quality: m.variant.quality.to_string(),
                        required: m.required,
                        available: m.available,
                    })
                    .collect();
                ApiError::insufficient(&items)
            }
            _ => ApiError::new(err.error_code(), err.to_string()),
        }
    }
}

/// Result type for ledger operations.
pub type EconomyResult<T> = Result<T, EconomyError>;
