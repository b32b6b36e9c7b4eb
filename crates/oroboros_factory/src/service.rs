//! # Scheduler Service
//!
//! The typed form of the scheduler API: resolves classifier codes, calls
//! the [`ProductionScheduler`] and renders every failure as an
//! [`ApiError`]. Every call acts for the authenticated player.

use oroboros_economy::{ApiError, ClassifierKind, ErrorCode, ItemAmount, ItemVariant, Timestamp, UserId};

use crate::api::{
    CancelRequest, CancelResponse, ClaimRequest, ClaimResponse, ClaimedTask, CompletedResponse,
    ItemView, LimitView, QueueResponse, RecipeView, RecipesResponse, SlotView, StartRequest,
    StartResponse, TaskView,
};
use crate::error::FactoryResult;
use crate::limits::LimitUsage;
use crate::recipe::Recipe;
use crate::scheduler::{ProductionScheduler, StartOrder};
use crate::task::{self, ProductionTask, TaskId, TaskStatus};

/// The scheduler API.
#[derive(Debug)]
pub struct FactoryService {
    scheduler: ProductionScheduler,
}

impl FactoryService {
    /// Wraps a scheduler.
    #[must_use]
    pub fn new(scheduler: ProductionScheduler) -> Self {
        Self { scheduler }
    }

    /// The underlying scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &ProductionScheduler {
        &self.scheduler
    }

    /// Lists recipes with the caller's limit usage.
    ///
    /// # Errors
    ///
    /// `internal_error` if the task store fails.
    pub fn recipes(&self, user: UserId, operation_class: Option<&str>) -> Result<RecipesResponse, ApiError> {
        self.respond(|| {
            let recipes = self
                .scheduler
                .list_recipes(user, operation_class)?
                .into_iter()
                .map(|(recipe, usage)| self.render_recipe(recipe, &usage))
                .collect::<FactoryResult<Vec<_>>>()?;
            Ok(RecipesResponse { recipes })
        })
    }

    /// Starts a task.
    ///
    /// # Errors
    ///
    /// See [`ProductionScheduler::start`].
    pub fn start(&self, user: UserId, request: &StartRequest) -> Result<StartResponse, ApiError> {
        self.respond(|| {
            let order = StartOrder {
                recipe: request.recipe_id,
                execution_count: request.execution_count,
                boosters: request.boosters.clone(),
                input_variants: request
                    .input_variants
                    .iter()
                    .map(|v| Ok((v.input, self.variant(v.collection.as_deref(), v.quality.as_deref())?)))
                    .collect::<FactoryResult<Vec<_>>>()?,
            };
            let task = self.scheduler.start(user, &order)?;
            Ok(StartResponse {
                task_id: task.id,
                status: task.status,
                completion_time: task.completion_at,
            })
        })
    }

    /// Active tasks and slot occupancy.
    ///
    /// # Errors
    ///
    /// `internal_error` if the task store fails.
    pub fn queue(&self, user: UserId) -> Result<QueueResponse, ApiError> {
        self.respond(|| {
            let queue = self.scheduler.queue(user)?;
            let now = self.scheduler.now();
            Ok(QueueResponse {
                tasks: queue
                    .tasks
                    .iter()
                    .map(|t| self.render_task(t, now))
                    .collect::<FactoryResult<_>>()?,
                slots: queue
                    .slots
                    .into_iter()
                    .map(|s| SlotView {
                        operation_class: s.operation_class,
                        total: s.total,
                        used: s.used,
                        free: s.free,
                    })
                    .collect(),
            })
        })
    }

    /// Tasks waiting for a claim.
    ///
    /// # Errors
    ///
    /// `internal_error` if the task store fails.
    pub fn completed(&self, user: UserId) -> Result<CompletedResponse, ApiError> {
        self.respond(|| {
            let now = self.scheduler.now();
            Ok(CompletedResponse {
                tasks: self
                    .scheduler
                    .completed(user)?
                    .iter()
                    .map(|t| self.render_task(t, now))
                    .collect::<FactoryResult<_>>()?,
            })
        })
    }

    /// One task.
    ///
    /// # Errors
    ///
    /// `not_found` or `forbidden`.
    pub fn task(&self, user: UserId, id: &TaskId) -> Result<TaskView, ApiError> {
        self.respond(|| {
            let task = self.scheduler.task(user, id)?;
            self.render_task(&task, self.scheduler.now())
        })
    }

    /// Claims one task or every completed one.
    ///
    /// # Errors
    ///
    /// See [`ProductionScheduler::claim`].
    pub fn claim(&self, user: UserId, request: &ClaimRequest) -> Result<ClaimResponse, ApiError> {
        self.respond(|| {
            let tasks = self
                .scheduler
                .claim(user, request.task_id.as_ref())?
                .iter()
                .map(|t| {
                    Ok(ClaimedTask {
                        task_id: t.id.clone(),
                        items: self.render_items(&t.granted_items())?,
                    })
                })
                .collect::<FactoryResult<_>>()?;
            Ok(ClaimResponse { tasks })
        })
    }

    /// Cancels a task and returns its reservation.
    ///
    /// # Errors
    ///
    /// See [`ProductionScheduler::cancel`].
    pub fn cancel(&self, user: UserId, request: &CancelRequest) -> Result<CancelResponse, ApiError> {
        self.respond(|| {
            let task = self.scheduler.cancel(user, &request.task_id)?;
            Ok(CancelResponse {
                returned: self.render_items(&task.inputs)?,
                task_id: task.id,
                status: task.status,
            })
        })
    }

    fn respond<T>(&self, f: impl FnOnce() -> FactoryResult<T>) -> Result<T, ApiError> {
        f().map_err(|err| {
            if err.error_code() == ErrorCode::InternalError {
                tracing::error!(error = %err, "scheduler request failed");
            }
            err.to_api()
        })
    }

    fn code(&self, kind: ClassifierKind, id: u32) -> FactoryResult<String> {
        Ok(self.scheduler.classifiers().code(kind, id)?)
    }

    fn variant(&self, collection: Option<&str>, quality: Option<&str>) -> FactoryResult<ItemVariant> {
        let classifiers = self.scheduler.classifiers();
        let mut variant = self.scheduler.default_variant();
        if let Some(code) = collection {
            variant.collection = classifiers.resolve(ClassifierKind::Collection, code)?;
        }
        if let Some(code) = quality {
            variant.quality = classifiers.resolve(ClassifierKind::Quality, code)?;
        }
        Ok(variant)
    }

    fn render_item(&self, item: u32, variant: ItemVariant, quantity: u64) -> FactoryResult<ItemView> {
        Ok(ItemView {
            item: self.code(ClassifierKind::Item, item)?,
            collection: self.code(ClassifierKind::Collection, variant.collection)?,
            quality: self.code(ClassifierKind::Quality, variant.quality)?,
            quantity,
        })
    }

    fn render_items(&self, amounts: &[ItemAmount]) -> FactoryResult<Vec<ItemView>> {
        amounts
            .iter()
            .map(|a| self.render_item(a.item, a.variant, a.quantity))
            .collect()
    }

    fn render_task(&self, task: &ProductionTask, now: Timestamp) -> FactoryResult<TaskView> {
        let status = task::status(task, now);
        let recipe_code = self
            .scheduler
            .recipes()
            .get(task.recipe)
            .map(|r| r.code.clone())
            .unwrap_or_default();
        let outputs = match status {
            TaskStatus::Completed | TaskStatus::Claimed => Some(self.render_items(&task.granted_items())?),
            _ => None,
        };
        Ok(TaskView {
            task_id: task.id.clone(),
            recipe_id: task.recipe,
            recipe_code,
            operation_class: task.operation_class.clone(),
            status,
            execution_count: task.execution_count,
            created_at: task.created_at,
            completion_time: task.completion_at,
            remaining_secs: task.remaining(now).num_seconds(),
            outputs,
        })
    }

    fn render_recipe(&self, recipe: &Recipe, usage: &[LimitUsage]) -> FactoryResult<RecipeView> {
        let default_variant = self.scheduler.default_variant();
        let inputs = recipe
            .inputs
            .iter()
            .map(|i| self.render_item(i.item, i.variant.unwrap_or(default_variant), i.quantity))
            .collect::<FactoryResult<_>>()?;
        let limits = usage
            .iter()
            .map(|u| {
                Ok(LimitView {
                    limit_type: u.limit.kind,
                    window: u.limit.window,
                    item: u.limit.item.map(|id| self.code(ClassifierKind::Item, id)).transpose()?,
                    current: u.used,
                    max: u.limit.max,
                    reset_time: u.reset_time,
                })
            })
            .collect::<FactoryResult<_>>()?;
        Ok(RecipeView {
            recipe_id: recipe.id,
            code: recipe.code.clone(),
            operation_class: recipe.operation_class.clone(),
            duration_secs: recipe.duration.num_seconds(),
            active: recipe.active,
            inputs,
            limits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FactoryConfig;
    use crate::gateway::InProcessLedger;
    use crate::store::MemoryTaskStore;
    use chrono::{Duration, TimeZone, Utc};
    use oroboros_economy::api::AddItemsRequest;
    use oroboros_economy::{Caller, ItemQuantity, LedgerConfig, LedgerService, ManualClock};
    use std::sync::Arc;

    const FACTORY: &str = r#"
        [[recipe]]
        code = "plank"
        operation_class = "crafting"
        duration_secs = 10

        [[recipe.input]]
        item = "wood"
        quantity = 1

        [[recipe.output_group]]
        [[recipe.output_group.rule]]
        item = "plank"
        min = 4
        max = 4
        probability = 100

        [[recipe.limit]]
        kind = "executions"
        window = "daily"
        max = 1
    "#;

    fn service() -> (Arc<ManualClock>, Arc<LedgerService>, FactoryService) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 5, 23, 0, 0).unwrap()));
        let mut ledger_config = LedgerConfig::default();
        ledger_config.classifiers.items = vec!["wood".to_string(), "plank".to_string()];
        let ledger = Arc::new(LedgerService::from_config(ledger_config, clock.clone()).unwrap());
        let scheduler = ProductionScheduler::new(
            &FactoryConfig::from_toml_str(FACTORY).unwrap(),
            Arc::clone(ledger.engine().classifiers()),
            Arc::new(InProcessLedger::new(Arc::clone(&ledger))),
            Arc::new(MemoryTaskStore::new()),
            clock.clone(),
        )
        .unwrap();
        ledger
            .add_items(
                Caller::Service,
                &AddItemsRequest {
                    user: 5,
                    section: "main".to_string(),
                    operation_type: "add_items".to_string(),
                    correlation_id: None,
                    comment: None,
                    recipe: None,
                    items: vec![ItemQuantity::plain("wood", 3)],
                },
            )
            .unwrap();
        (clock, ledger, FactoryService::new(scheduler))
    }

    fn start(service: &FactoryService) -> Result<StartResponse, ApiError> {
        service.start(
            5,
            &StartRequest {
                recipe_id: 1,
                execution_count: 1,
                boosters: Vec::new(),
                input_variants: Vec::new(),
            },
        )
    }

    #[test]
    fn test_outputs_hidden_until_completed() {
        let (clock, _ledger, service) = service();
        let started = start(&service).unwrap();
        let view = service.task(5, &started.task_id).unwrap();
        assert_eq!(view.status, TaskStatus::InProgress);
        assert_eq!(view.remaining_secs, 10);
        assert!(view.outputs.is_none());

        clock.advance(Duration::seconds(10));
        let view = service.task(5, &started.task_id).unwrap();
        assert_eq!(view.status, TaskStatus::Completed);
        assert_eq!(view.outputs.unwrap()[0].quantity, 4);
        assert_eq!(service.completed(5).unwrap().tasks.len(), 1);
    }

    #[test]
    fn test_limit_error_carries_details() {
        let (_clock, _ledger, service) = service();
        start(&service).unwrap();
        let err = start(&service).unwrap_err();
        assert_eq!(err.error_code, ErrorCode::LimitExceeded);
        let details = err.details.unwrap();
        assert_eq!(details["current"], 1);
        assert_eq!(details["reset_time"], serde_json::json!(Utc.with_ymd_and_hms(2024, 5, 6, 0, 0, 0).unwrap()));

        let recipes = service.recipes(5, Some("crafting")).unwrap();
        assert_eq!(recipes.recipes[0].limits[0].current, 1);
        assert!(service.recipes(5, Some("smelting")).unwrap().recipes.is_empty());
    }

    #[test]
    fn test_claim_and_cancel_render_codes() {
        let (clock, ledger, service) = service();
        let started = start(&service).unwrap();
        clock.advance(Duration::seconds(10));
        let claimed = service.claim(5, &ClaimRequest::default()).unwrap();
        assert_eq!(claimed.tasks[0].items[0].item, "plank");

        let inventory = ledger.inventory(Caller::Player(5), None, None).unwrap();
        let plank = inventory.items.iter().find(|e| e.item == "plank").unwrap();
        assert_eq!(plank.quantity, 4);

        let err = service
            .cancel(5, &CancelRequest { task_id: started.task_id })
            .unwrap_err();
        assert_eq!(err.error_code, ErrorCode::ValidationError);
    }

    #[test]
    fn test_insufficient_items_passes_through() {
        let (_clock, ledger, service) = service();
        ledger
            .adjust(
                Caller::Admin,
                &oroboros_economy::api::AdjustRequest {
                    user: 5,
                    section: "main".to_string(),
                    items: vec![ItemQuantity::plain("wood", -3)],
                    reason: "test cleanup of wood".to_string(),
                },
            )
            .unwrap();
        let err = start(&service).unwrap_err();
        assert_eq!(err.error_code, ErrorCode::InsufficientItems);
        let missing = err.missing_items().unwrap();
        assert_eq!((missing[0].required, missing[0].available), (1, 0));
    }
}
