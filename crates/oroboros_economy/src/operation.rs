//! # Ledger Records
//!
//! Persisted record types: immutable [`LedgerOperation`] rows (the system of
//! record), [`DailyBalanceSnapshot`] checkpoints (derived, upserted per day,
//! only there to bound replay cost) and [`ReturnTombstone`] markers.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::item::{ItemStack, OperationId, OperationTypeId, RecipeRef, Timestamp, UserId};

/// One immutable row of the operation log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerOperation {
    /// Monotonic id.
    pub id: OperationId,
    /// The pile this row changes.
    pub stack: ItemStack,
    /// Signed quantity change.
    pub delta: i64,
    /// Operation type id.
    pub operation_type: OperationTypeId,
    /// Groups the rows of one multi-row write (reservation pairs, claims).
    pub correlation_id: Option<String>,
    /// Recipe the row was written for.
    pub recipe: Option<RecipeRef>,
    /// Audit note.
    pub comment: Option<String>,
    /// Commit time.
    pub created_at: Timestamp,
}

/// Balance of one stack at 00:00 UTC of `date`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyBalanceSnapshot {
    /// The pile.
    pub stack: ItemStack,
    /// Checkpoint day; covers every operation created before its midnight.
    pub date: NaiveDate,
    /// Balance at that point.
    pub quantity: i64,
}

/// A `return_reserve` that arrived before any reservation under its id.
///
/// Closes the id: a reservation arriving later is rejected, so a compensated
/// start can never end up holding items.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnTombstone {
    /// The closed correlation id.
    pub correlation_id: String,
    /// User the return was made for.
    pub user: UserId,
    /// Commit time.
    pub created_at: Timestamp,
}

/// Resolved metadata shared by every row of a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationMeta {
    /// Operation type id.
    pub operation_type: OperationTypeId,
    /// Idempotency key of the batch.
    pub correlation_id: Option<String>,
    /// Recipe reference.
    pub recipe: Option<RecipeRef>,
    /// Audit note.
    pub comment: Option<String>,
}

impl OperationMeta {
    /// Metadata with only a type.
    #[must_use]
    pub const fn of_type(operation_type: OperationTypeId) -> Self {
        Self {
            operation_type,
            correlation_id: None,
            recipe: None,
            comment: None,
        }
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn correlated(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets the recipe reference.
    #[must_use]
    pub const fn for_recipe(mut self, recipe: Option<RecipeRef>) -> Self {
        self.recipe = recipe;
        self
    }

    /// Sets the audit note.
    #[must_use]
    pub fn with_comment(mut self, comment: Option<String>) -> Self {
        self.comment = comment;
        self
    }
}

/// Unique index key of a committed batch.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BatchKey {
    /// Correlation id.
    pub correlation_id: String,
    /// Operation type id.
    pub operation_type: OperationTypeId,
}

impl BatchKey {
    /// Creates a key.
    #[must_use]
    pub fn new(correlation_id: impl Into<String>, operation_type: OperationTypeId) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            operation_type,
        }
    }
}
