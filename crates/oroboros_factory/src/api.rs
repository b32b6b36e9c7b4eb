//! # Scheduler Wire Types
//!
//! Request/response shapes of the user-facing scheduler API. Items are
//! named by classifier codes, like the ledger API.

use oroboros_economy::Timestamp;
use serde::{Deserialize, Serialize};

use crate::limits::{LimitKind, LimitWindow};
use crate::recipe::RecipeId;
use crate::task::{TaskId, TaskStatus};

fn one() -> u32 {
    1
}

/// An item line with its variant spelled out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemView {
    /// Item code.
    pub item: String,
    /// Collection code.
    pub collection: String,
    /// Quality code.
    pub quality: String,
    /// Quantity.
    pub quantity: u64,
}

/// Variant chosen for one recipe input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputVariant {
    /// Input index within the recipe.
    pub input: usize,
    /// Collection code; the default collection when absent.
    #[serde(default)]
    pub collection: Option<String>,
    /// Quality code; the default quality when absent.
    #[serde(default)]
    pub quality: Option<String>,
}

/// `POST /factory/start` body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    /// Recipe to run.
    pub recipe_id: RecipeId,
    /// Executions bundled in the task.
    #[serde(default = "one")]
    pub execution_count: u32,
    /// Booster item codes to spend.
    #[serde(default)]
    pub boosters: Vec<String>,
    /// Variants for inputs the recipe leaves open.
    #[serde(default)]
    pub input_variants: Vec<InputVariant>,
}

/// `POST /factory/start` response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResponse {
    /// New task.
    pub task_id: TaskId,
    /// Status right after the start.
    pub status: TaskStatus,
    /// Expected completion time.
    pub completion_time: Option<Timestamp>,
}

/// A task as shown to its owner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskView {
    /// Task id.
    pub task_id: TaskId,
    /// Recipe id.
    pub recipe_id: RecipeId,
    /// Recipe code.
    pub recipe_code: String,
    /// Slot scope.
    pub operation_class: String,
    /// Status at the time of the read.
    pub status: TaskStatus,
    /// Executions bundled in the task.
    pub execution_count: u32,
    /// Submission time.
    pub created_at: Timestamp,
    /// Completion time, once started.
    pub completion_time: Option<Timestamp>,
    /// Seconds left until completion.
    pub remaining_secs: i64,
    /// Reward, shown once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<ItemView>>,
}

/// Slot occupancy of one pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotView {
    /// `universal` or a specialized operation class.
    pub operation_class: String,
    /// Capacity.
    pub total: u32,
    /// Occupied.
    pub used: u32,
    /// Free.
    pub free: u32,
}

/// `GET /factory/queue` response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueResponse {
    /// Tasks holding a slot.
    pub tasks: Vec<TaskView>,
    /// Slot totals.
    pub slots: Vec<SlotView>,
}

/// `GET /factory/completed` response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedResponse {
    /// Claimable tasks.
    pub tasks: Vec<TaskView>,
}

/// `POST /factory/claim` body.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequest {
    /// Task to claim; every completed task when absent.
    #[serde(default)]
    pub task_id: Option<TaskId>,
}

/// One claimed task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedTask {
    /// Task id.
    pub task_id: TaskId,
    /// Items granted.
    pub items: Vec<ItemView>,
}

/// `POST /factory/claim` response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimResponse {
    /// Claimed tasks.
    pub tasks: Vec<ClaimedTask>,
}

/// `POST /factory/cancel` body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    /// Task to cancel.
    pub task_id: TaskId,
}

/// `POST /factory/cancel` response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelResponse {
    /// Task id.
    pub task_id: TaskId,
    /// Always `cancelled`.
    pub status: TaskStatus,
    /// Items given back.
    pub returned: Vec<ItemView>,
}

/// Usage of one limit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitView {
    /// What is counted.
    pub limit_type: LimitKind,
    /// Window.
    pub window: LimitWindow,
    /// Item counted by a reward limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
    /// Usage so far.
    pub current: u64,
    /// Cap.
    pub max: u64,
    /// Next reset; absent for total limits.
    pub reset_time: Option<Timestamp>,
}

/// A recipe with the caller's usage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeView {
    /// Recipe id.
    pub recipe_id: RecipeId,
    /// Recipe code.
    pub code: String,
    /// Slot scope.
    pub operation_class: String,
    /// Base duration of one execution.
    pub duration_secs: i64,
    /// Whether it can be started.
    pub active: bool,
    /// Inputs per execution, in the default variant where not pinned.
    pub inputs: Vec<ItemView>,
    /// Limits with current usage.
    pub limits: Vec<LimitView>,
}

/// `GET /recipes` response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipesResponse {
    /// Recipes, by id.
    pub recipes: Vec<RecipeView>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_request_defaults() {
        let request: StartRequest = serde_json::from_str(r#"{"recipe_id": 3}"#).unwrap();
        assert_eq!(request.execution_count, 1);
        assert!(request.boosters.is_empty());
    }

    #[test]
    fn test_claim_all_when_id_missing() {
        let request: ClaimRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request.task_id, None);
    }
}
