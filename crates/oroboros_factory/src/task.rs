//! # Production Tasks
//!
//! A task is created by `start`, moved only by the scheduler's own
//! transitions, and never deleted.
//!
//! ```text
//! pending -> in_progress -> (completed) -> claimed
//!    |            |
//!    +------------+--> cancelled | failed
//! ```
//!
//! `completed` is never stored: [`status`] derives it from the clock.

use std::fmt;

use chrono::Duration;
use oroboros_economy::{ItemAmount, ItemId, ItemVariant, Timestamp, UserId};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::modifiers::Modifiers;
use crate::recipe::RecipeId;

/// Unique task identifier; also the correlation id of every ledger call
/// made for the task.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// A fresh random id (128 bits, hex).
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("{:032x}", rand::thread_rng().gen::<u128>()))
    }

    /// Wraps an existing id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Persisted, inputs not yet confirmed reserved.
    Pending,
    /// Inputs reserved, outputs frozen, waiting for the completion time.
    InProgress,
    /// Completion time reached (derived, never stored).
    Completed,
    /// Outputs granted.
    Claimed,
    /// Reservation returned by the owner.
    Cancelled,
    /// A saga step failed; see `failure`.
    Failed,
}

impl TaskStatus {
    /// Wire spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Claimed => "claimed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    /// Cancelled and failed tasks never reached their reward.
    #[must_use]
    pub const fn is_aborted(self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rolled reward line. Immutable once the task is in progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutputItem {
    /// Execution index (0-based) within the task.
    pub execution: u32,
    /// Output group index within the recipe.
    pub group: u32,
    /// Granted item.
    pub item: ItemId,
    /// Granted variant.
    pub variant: ItemVariant,
    /// Granted quantity, yield bonus included.
    pub quantity: u64,
}

/// A production task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionTask {
    /// Id and ledger correlation id.
    pub id: TaskId,
    /// Owner.
    pub user: UserId,
    /// Recipe.
    pub recipe: RecipeId,
    /// Operation class of the recipe (slot scope).
    pub operation_class: String,
    /// Stored state; read through [`status`].
    pub status: TaskStatus,
    /// Number of recipe executions bundled in the task.
    pub execution_count: u32,
    /// Booster codes spent on the task.
    pub boosters: Vec<String>,
    /// Everything reserved for the task, boosters included.
    pub inputs: Vec<ItemAmount>,
    /// Variant of each recipe input, by input index.
    pub input_variants: Vec<ItemVariant>,
    /// Bonuses resolved at start.
    pub modifiers: Modifiers,
    /// Frozen reward.
    pub outputs: Vec<TaskOutputItem>,
    /// Submission time (limit windows count from here).
    pub created_at: Timestamp,
    /// Time the reservation was confirmed.
    pub started_at: Option<Timestamp>,
    /// Time the reward becomes claimable.
    pub completion_at: Option<Timestamp>,
    /// Time of the last transition out of the active states.
    pub finished_at: Option<Timestamp>,
    /// Why the task failed.
    pub failure: Option<String>,
    /// Set when a compensation could not be confirmed; an operator must
    /// settle the reservation by hand.
    pub needs_reconciliation: bool,
}

impl ProductionTask {
    /// A fresh pending task.
    #[must_use]
    pub fn pending(
        id: TaskId,
        user: UserId,
        recipe: RecipeId,
        operation_class: impl Into<String>,
        execution_count: u32,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            user,
            recipe,
            operation_class: operation_class.into(),
            status: TaskStatus::Pending,
            execution_count,
            boosters: Vec::new(),
            inputs: Vec::new(),
            input_variants: Vec::new(),
            modifiers: Modifiers::default(),
            outputs: Vec::new(),
            created_at,
            started_at: None,
            completion_at: None,
            finished_at: None,
            failure: None,
            needs_reconciliation: false,
        }
    }

    /// Whether the task still holds a slot.
    #[must_use]
    pub const fn holds_slot(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::InProgress)
    }

    /// Time left until completion, zero once reached.
    #[must_use]
    pub fn remaining(&self, now: Timestamp) -> Duration {
        self.completion_at
            .map_or(Duration::zero(), |at| (at - now).max(Duration::zero()))
    }

    /// Rolled reward summed per item and variant, first-seen order.
    #[must_use]
    pub fn granted_items(&self) -> Vec<ItemAmount> {
        let rolled: Vec<ItemAmount> = self
            .outputs
            .iter()
            .filter(|o| o.quantity > 0)
            .map(|o| ItemAmount::new(o.item, o.variant, o.quantity))
            .collect();
        oroboros_economy::item::merge_amounts(&rolled)
    }
}

/// Status of a task at `now`.
///
/// An in-progress task whose completion time has passed reads as
/// completed; nothing is written.
#[must_use]
pub fn status(task: &ProductionTask, now: Timestamp) -> TaskStatus {
    match (task.status, task.completion_at) {
        (TaskStatus::InProgress, Some(at)) if now >= at => TaskStatus::Completed,
        (stored, _) => stored,
    }
}
