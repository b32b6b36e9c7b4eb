//! # Ledger Wire Types
//!
//! Request/response shapes of the ledger API and the error envelope shared
//! with the production scheduler. Everything on the wire speaks classifier
//! codes; ids stay inside the ledger.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::item::{OperationId, UserId};

/// Error taxonomy shared by both services.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed or missing fields.
    ValidationError,
    /// Affordability failure; details carry `items`.
    InsufficientItems,
    /// Usage cap reached; details carry the limit and its reset time.
    LimitExceeded,
    /// Referenced record does not exist.
    NotFound,
    /// Record belongs to another caller or credential missing.
    Forbidden,
    /// Idempotency key reused for a different request.
    Conflict,
    /// Unexpected failure.
    InternalError,
}

impl ErrorCode {
    /// Wire spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::InsufficientItems => "insufficient_items",
            Self::LimitExceeded => "limit_exceeded",
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::Conflict => "conflict",
            Self::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error envelope returned by every endpoint.
#[derive(Error, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[error("{error_code}: {message}")]
pub struct ApiError {
    /// Taxonomy code.
    pub error_code: ErrorCode,
    /// Human-readable summary.
    pub message: String,
    /// Structured detail a client can act on without re-querying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ApiError {
    /// Creates an error without details.
    #[must_use]
    pub fn new(error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
            details: None,
        }
    }

    /// Attaches structured details.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Builds an `insufficient_items` error.
    #[must_use]
    pub fn insufficient(items: &[MissingItemView]) -> Self {
        Self::new(ErrorCode::InsufficientItems, "not enough items")
            .with_details(json!({ "items": items }))
    }

    /// Reads back the shortfall list of an `insufficient_items` error.
    #[must_use]
    pub fn missing_items(&self) -> Option<Vec<MissingItemView>> {
        if self.error_code != ErrorCode::InsufficientItems {
            return None;
        }
        let items = self.details.as_ref()?.get("items")?.clone();
        serde_json::from_value(items).ok()
    }
}

/// An item line in a request or response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemQuantity {
    /// Item code.
    pub item: String,
    /// Collection code; the default collection when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    /// Quality code; the default quality when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    /// Quantity, or signed delta for `adjust`.
    pub quantity: i64,
}

impl ItemQuantity {
    /// An item line in the default variant.
    #[must_use]
    pub fn plain(item: impl Into<String>, quantity: i64) -> Self {
        Self {
            item: item.into(),
            collection: None,
            quality: None,
            quantity,
        }
    }
}

/// One shortfall, as shown to clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingItemView {
    /// Item code.
    pub item: String,
    /// Collection code.
    pub collection: String,
    /// Quality code.
    pub quality: String,
    /// Quantity needed.
    pub required: u64,
    /// Quantity held.
    pub available: u64,
}

/// One non-empty pile in an inventory listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    /// Item code.
    pub item: String,
    /// Collection code.
    pub collection: String,
    /// Quality code.
    pub quality: String,
    /// Current balance.
    pub quantity: i64,
}

/// `GET /inventory` response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryResponse {
    /// Section code that was listed.
    pub section: String,
    /// Non-empty piles, ordered by item then variant.
    pub items: Vec<InventoryEntry>,
}

/// `POST /add-items` body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddItemsRequest {
    /// Owner.
    pub user: UserId,
    /// Section code.
    pub section: String,
    /// Operation type code.
    pub operation_type: String,
    /// Idempotency key; a retried request with the same key is answered from the log.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Free-form audit note.
    #[serde(default)]
    pub comment: Option<String>,
    /// Recipe reference for audit.
    #[serde(default)]
    pub recipe: Option<u32>,
    /// Signed item lines.
    pub items: Vec<ItemQuantity>,
}

/// `POST /add-items` response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddItemsResponse {
    /// Ids of the rows of the batch.
    pub operation_ids: Vec<OperationId>,
    /// True when the batch had already been committed by an earlier attempt.
    pub replayed: bool,
}

/// `POST /adjust` body (admin only).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustRequest {
    /// Owner.
    pub user: UserId,
    /// Section code.
    pub section: String,
    /// Signed deltas.
    pub items: Vec<ItemQuantity>,
    /// Mandatory audit reason.
    pub reason: String,
}

/// `POST /reserve` body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveRequest {
    /// Owner.
    pub user: UserId,
    /// Idempotency key; also the handle for return/consume.
    pub correlation_id: String,
    /// Items to hold.
    pub items: Vec<ItemQuantity>,
}

/// `POST /return-reserve` and `POST /consume-reserve` body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettleRequest {
    /// Owner.
    pub user: UserId,
    /// Key of the original reservation.
    pub correlation_id: String,
    /// Optional cross-check of the held items.
    #[serde(default)]
    pub items: Option<Vec<ItemQuantity>>,
}

/// Response of the three reservation primitives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationResponse {
    /// Key of the reservation.
    pub correlation_id: String,
    /// Rows written by this call (or by the attempt it replays).
    pub operation_ids: Vec<OperationId>,
    /// Items moved.
    pub items: Vec<ItemQuantity>,
    /// True when answered from an earlier committed attempt.
    pub replayed: bool,
}
