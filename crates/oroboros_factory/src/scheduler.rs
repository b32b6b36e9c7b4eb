//! # Production Scheduler
//!
//! Orchestrates recipes, slots, limits and the reservation saga into a
//! per-user task queue.
//!
//! ## Start
//!
//! ```text
//! validate ─> slot free? ─> limits ─> persist pending task
//!     ─> saga { reserve inputs ─> roll + freeze outputs ─> in_progress }
//! ```
//!
//! Reservation happens at submission; there is no queued-but-unreserved
//! state. Completion is read from the clock ([`task::status`]); nothing
//! runs in the background.
//!
//! ## Locking
//!
//! Operations on one user's queue are serialized by a per-user lock, so
//! two concurrent starts cannot both take the last slot or the last unit
//! of a limit. Different users never contend.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Duration;
use oroboros_economy::api::{AddItemsRequest, ItemQuantity};
use oroboros_economy::item::merge_amounts;
use oroboros_economy::{
    ClassifierKind, ClassifierRegistry, Clock, ItemAmount, ItemId, ItemVariant, Timestamp, UserId,
};
use parking_lot::Mutex;

use crate::config::FactoryConfig;
use crate::error::{FactoryError, FactoryResult};
use crate::limits::{LimitTracker, LimitUsage};
use crate::lottery::RecipeEngine;
use crate::modifiers::{ModifierSource, Modifiers, NoModifiers};
use crate::recipe::{Recipe, RecipeBook, RecipeId};
use crate::saga::{LedgerGateway, ReservationHandle, ReservationSaga, RetryPolicy, SagaOutcome};
use crate::slots::{SlotPolicy, SlotUsage};
use crate::store::TaskStore;
use crate::task::{self, ProductionTask, TaskId, TaskStatus};

/// A start request with codes resolved.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StartOrder {
    /// Recipe.
    pub recipe: RecipeId,
    /// Executions bundled in the task.
    pub execution_count: u32,
    /// Booster item codes, one unit each.
    pub boosters: Vec<String>,
    /// Chosen variant per input index, for inputs the recipe leaves open.
    pub input_variants: Vec<(usize, ItemVariant)>,
}

impl StartOrder {
    /// One plain execution of `recipe`.
    #[must_use]
    pub fn once(recipe: RecipeId) -> Self {
        Self {
            recipe,
            execution_count: 1,
            ..Self::default()
        }
    }
}

/// Active tasks and slot occupancy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Queue {
    /// Tasks holding a slot, oldest first.
    pub tasks: Vec<ProductionTask>,
    /// Universal pool first, then each specialized class.
    pub slots: Vec<SlotUsage>,
}

#[derive(Clone, Copy, Debug)]
struct Booster {
    item: ItemId,
    modifiers: Modifiers,
}

/// The scheduler.
pub struct ProductionScheduler {
    recipes: RecipeBook,
    engine: RecipeEngine,
    limits: LimitTracker,
    slots: SlotPolicy,
    boosters: HashMap<String, Booster>,
    modifiers: Arc<dyn ModifierSource>,
    store: Arc<dyn TaskStore>,
    gateway: Arc<dyn LedgerGateway>,
    classifiers: Arc<ClassifierRegistry>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    default_variant: ItemVariant,
    max_execution_count: u32,
    player_section: String,
    reward_operation_type: String,
    user_locks: Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
}

impl ProductionScheduler {
    /// Builds a scheduler from configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for broken recipes, unknown booster items or
    /// a malformed secret.
    pub fn new(
        config: &FactoryConfig,
        classifiers: Arc<ClassifierRegistry>,
        gateway: Arc<dyn LedgerGateway>,
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
    ) -> FactoryResult<Self> {
        let recipes = config.recipe_book(&classifiers)?;
        let mut boosters = HashMap::with_capacity(config.boosters.len());
        for booster in &config.boosters {
            let item = classifiers
                .resolve(ClassifierKind::Item, &booster.item)
                .map_err(|e| FactoryError::InvalidConfig(format!("booster {}: {e}", booster.item)))?;
            boosters.insert(
                booster.item.clone(),
                Booster {
                    item,
                    modifiers: booster.modifiers(),
                },
            );
        }

        Ok(Self {
            recipes,
            engine: RecipeEngine::new(config.secure_seed()?),
            limits: LimitTracker::new(config.season_calendar()),
            slots: config.slots.clone(),
            boosters,
            modifiers: Arc::new(NoModifiers),
            store,
            gateway,
            default_variant: config.default_variant(&classifiers)?,
            classifiers,
            clock,
            retry: config.retry_policy(),
            max_execution_count: config.max_execution_count,
            player_section: config.player_section.clone(),
            reward_operation_type: config.reward_operation_type.clone(),
            user_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Replaces the external bonus source.
    #[must_use]
    pub fn with_modifiers(mut self, modifiers: Arc<dyn ModifierSource>) -> Self {
        self.modifiers = modifiers;
        self
    }

    /// Replaces the output engine (e.g. with a fixed secret in tests).
    #[must_use]
    pub fn with_engine(mut self, engine: RecipeEngine) -> Self {
        self.engine = engine;
        self
    }

    /// Current time.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// The recipe book.
    #[must_use]
    pub fn recipes(&self) -> &RecipeBook {
        &self.recipes
    }

    /// Variant used where a request leaves it open.
    #[must_use]
    pub const fn default_variant(&self) -> ItemVariant {
        self.default_variant
    }

    /// The classifier registry.
    #[must_use]
    pub fn classifiers(&self) -> &Arc<ClassifierRegistry> {
        &self.classifiers
    }

    fn user_lock(&self, user: UserId) -> Arc<Mutex<()>> {
        Arc::clone(self.user_locks.lock().entry(user).or_default())
    }

    fn saga(&self) -> ReservationSaga<'_> {
        ReservationSaga::new(self.gateway.as_ref(), self.retry)
    }

    // =========================================================================
    // Start
    // =========================================================================

    /// Submits a task: reserves its inputs and freezes its reward.
    ///
    /// # Errors
    ///
    /// - `Validation` for a bad count, inactive recipe, unknown booster or
    ///   a variant choice the recipe does not allow
    /// - `RecipeNotFound`
    /// - `NoFreeSlot` / `LimitExceeded`
    /// - `Ledger` with `insufficient_items` when the player is short
    /// - `LedgerUnavailable` when the ledger could not be reached
    pub fn start(&self, user: UserId, order: &StartOrder) -> FactoryResult<ProductionTask> {
        if order.execution_count == 0 || order.execution_count > self.max_execution_count {
            return Err(FactoryError::Validation(format!(
                "execution_count must be between 1 and {}",
                self.max_execution_count
            )));
        }
        let recipe = self
            .recipes
            .get(order.recipe)
            .ok_or_else(|| FactoryError::RecipeNotFound(order.recipe.to_string()))?;
        if !recipe.active {
            return Err(FactoryError::Validation(format!("recipe {} is not active", recipe.code)));
        }
        let input_variants = self.input_variants(recipe, &order.input_variants)?;
        let boosters = self.resolve_boosters(&order.boosters)?;

        let lock = self.user_lock(user);
        let _guard = lock.lock();

        let now = self.clock.now();
        let history = self.store.for_user(user)?;
        let slot = self.slots.usage(&recipe.operation_class, &history);
        if slot.free == 0 {
            return Err(FactoryError::NoFreeSlot {
                operation_class: recipe.operation_class.clone(),
                used: slot.used,
                total: slot.total,
            });
        }
        self.limits
            .check_before_start(recipe, &history, now, order.execution_count)?;

        let mut task = ProductionTask::pending(
            TaskId::generate(),
            user,
            recipe.id,
            recipe.operation_class.clone(),
            order.execution_count,
            now,
        );
        task.boosters = order.boosters.clone();
        task.inputs = self.task_inputs(recipe, &input_variants, order.execution_count, &boosters);
        task.input_variants = input_variants;
        self.store.insert(task.clone())?;

        let handle = self.handle(&task)?;
        let extra = boosters
            .iter()
            .fold(Modifiers::default(), |m, b| m.combine(b.modifiers));
        let outcome = self.saga().start(&handle, || {
            self.begin(recipe, &history, task.clone(), extra)
        });

        match outcome {
            SagaOutcome::Committed(task) => {
                tracing::info!(
                    user,
                    task_id = %task.id,
                    recipe = %recipe.code,
                    executions = task.execution_count,
                    "production started"
                );
                Ok(task)
            }
            SagaOutcome::Compensated(error) => {
                self.mark_failed(&task.id, &error, false);
                Err(error)
            }
            SagaOutcome::Failed { error, .. } => {
                self.mark_failed(&task.id, &error, true);
                Err(error)
            }
        }
    }

    /// The local half of a start: runs while the inputs are reserved.
    fn begin(
        &self,
        recipe: &Recipe,
        history: &[ProductionTask],
        mut task: ProductionTask,
        boosters: Modifiers,
    ) -> FactoryResult<ProductionTask> {
        let now = self.clock.now();
        let modifiers = self.modifiers.modifiers(task.user, recipe).combine(boosters);
        let outputs = self.engine.resolve_task(
            recipe,
            &task.input_variants,
            &task.id,
            task.execution_count,
            modifiers,
        )?;
        self.limits.check_rolled(recipe, history, now, &outputs)?;

        let completion_at = recipe
            .duration
            .num_milliseconds()
            .checked_mul(i64::from(task.execution_count))
            .and_then(Duration::try_milliseconds)
            .map(|total| modifiers.apply_speed(total))
            .and_then(|duration| now.checked_add_signed(duration))
            .ok_or_else(|| {
                FactoryError::Validation(format!(
                    "{} executions of {} end out of range",
                    task.execution_count, recipe.code
                ))
            })?;

        task.modifiers = modifiers;
        task.outputs = outputs;
        task.status = TaskStatus::InProgress;
        task.started_at = Some(now);
        task.completion_at = Some(completion_at);
        self.store.update(&task)?;
        Ok(task)
    }

    fn input_variants(
        &self,
        recipe: &Recipe,
        chosen: &[(usize, ItemVariant)],
    ) -> FactoryResult<Vec<ItemVariant>> {
        let mut variants: Vec<Option<ItemVariant>> = recipe.inputs.iter().map(|i| i.variant).collect();
        for &(index, variant) in chosen {
            let input = recipe.inputs.get(index).ok_or_else(|| {
                FactoryError::Validation(format!("recipe {} has no input {index}", recipe.code))
            })?;
            match input.variant {
                Some(pinned) if pinned != variant => {
                    return Err(FactoryError::Validation(format!(
                        "input {index} of recipe {} requires a fixed variant",
                        recipe.code
                    )));
                }
                _ => variants[index] = Some(variant),
            }
        }
        Ok(variants
            .into_iter()
            .map(|v| v.unwrap_or(self.default_variant))
            .collect())
    }

    fn resolve_boosters(&self, codes: &[String]) -> FactoryResult<Vec<Booster>> {
        let mut seen = HashSet::with_capacity(codes.len());
        codes
            .iter()
            .map(|code| {
                if !seen.insert(code.as_str()) {
                    return Err(FactoryError::Validation(format!("booster {code} named twice")));
                }
                self.boosters
                    .get(code)
                    .copied()
                    .ok_or_else(|| FactoryError::Validation(format!("unknown booster {code}")))
            })
            .collect()
    }

    fn task_inputs(
        &self,
        recipe: &Recipe,
        variants: &[ItemVariant],
        executions: u32,
        boosters: &[Booster],
    ) -> Vec<ItemAmount> {
        let inputs = recipe.inputs.iter().zip(variants).map(|(input, variant)| {
            ItemAmount::new(
                input.item,
                *variant,
                input.quantity.saturating_mul(u64::from(executions)),
            )
        });
        let boosters = boosters
            .iter()
            .map(|b| ItemAmount::new(b.item, self.default_variant, 1));
        merge_amounts(&inputs.chain(boosters).collect::<Vec<_>>())
    }

    fn wire_items(&self, amounts: &[ItemAmount]) -> FactoryResult<Vec<ItemQuantity>> {
        amounts
            .iter()
            .map(|a| {
                Ok(ItemQuantity {
                    item: self.classifiers.code(ClassifierKind::Item, a.item)?,
                    collection: Some(self.classifiers.code(ClassifierKind::Collection, a.variant.collection)?),
                    quality: Some(self.classifiers.code(ClassifierKind::Quality, a.variant.quality)?),
                    quantity: i64::try_from(a.quantity)
                        .map_err(|_| FactoryError::Validation("quantity too large".to_string()))?,
                })
            })
            .collect()
    }

    fn handle(&self, task: &ProductionTask) -> FactoryResult<ReservationHandle> {
        Ok(ReservationHandle {
            user: task.user,
            correlation_id: task.id.to_string(),
            items: self.wire_items(&task.inputs)?,
        })
    }

    fn mark_failed(&self, id: &TaskId, error: &FactoryError, needs_reconciliation: bool) {
        let result = self.store.get(id).and_then(|stored| {
            let Some(mut task) = stored else {
                return Ok(());
            };
            task.status = TaskStatus::Failed;
            task.failure = Some(error.to_string());
            task.finished_at = Some(self.clock.now());
            task.needs_reconciliation = needs_reconciliation;
            self.store.update(&task)
        });
        if let Err(e) = result {
            tracing::error!(task_id = %id, error = %e, "could not record task failure");
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    fn owned(&self, user: UserId, id: &TaskId) -> FactoryResult<ProductionTask> {
        let task = self
            .store
            .get(id)?
            .ok_or_else(|| FactoryError::TaskNotFound(id.clone()))?;
        if task.user != user {
            return Err(FactoryError::Forbidden(format!("task {id} belongs to another user")));
        }
        Ok(task)
    }

    /// One task of `user`.
    ///
    /// # Errors
    ///
    /// `TaskNotFound`, or `Forbidden` for another user's task.
    pub fn task(&self, user: UserId, id: &TaskId) -> FactoryResult<ProductionTask> {
        self.owned(user, id)
    }

    /// Tasks holding a slot, with slot occupancy.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the task store fails.
    pub fn queue(&self, user: UserId) -> FactoryResult<Queue> {
        let tasks = self.store.for_user(user)?;
        let slots = self.slots.summary(&tasks);
        Ok(Queue {
            tasks: tasks.into_iter().filter(ProductionTask::holds_slot).collect(),
            slots,
        })
    }

    /// Tasks whose completion time has passed and that wait for a claim.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the task store fails.
    pub fn completed(&self, user: UserId) -> FactoryResult<Vec<ProductionTask>> {
        let now = self.clock.now();
        Ok(self
            .store
            .for_user(user)?
            .into_iter()
            .filter(|t| task::status(t, now) == TaskStatus::Completed)
            .collect())
    }

    /// Recipes, optionally of one class, with the caller's limit usage.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the task store fails.
    pub fn list_recipes(
        &self,
        user: UserId,
        operation_class: Option<&str>,
    ) -> FactoryResult<Vec<(&Recipe, Vec<LimitUsage>)>> {
        let now = self.clock.now();
        let history = self.store.for_user(user)?;
        Ok(self
            .recipes
            .iter()
            .filter(|r| operation_class.map_or(true, |class| r.operation_class == class))
            .map(|r| (r, self.limits.usage(r, &history, now)))
            .collect())
    }

    // =========================================================================
    // Claim / cancel
    // =========================================================================

    /// Grants the frozen reward of one task, or of every completed task.
    ///
    /// Claiming an already claimed task returns it unchanged.
    ///
    /// # Errors
    ///
    /// - `TaskNotFound` / `Forbidden`
    /// - `InvalidState` before completion or for aborted tasks
    /// - `Ledger` / `LedgerUnavailable`; the task stays claimable
    pub fn claim(&self, user: UserId, id: Option<&TaskId>) -> FactoryResult<Vec<ProductionTask>> {
        let ids: Vec<TaskId> = match id {
            Some(id) => vec![self.owned(user, id)?.id],
            None => self.completed(user)?.into_iter().map(|t| t.id).collect(),
        };

        let lock = self.user_lock(user);
        let _guard = lock.lock();
        ids.iter().map(|id| self.claim_one(user, id)).collect()
    }

    fn claim_one(&self, user: UserId, id: &TaskId) -> FactoryResult<ProductionTask> {
        let mut task = self.owned(user, id)?;
        let now = self.clock.now();
        match task::status(&task, now) {
            TaskStatus::Claimed => return Ok(task),
            TaskStatus::Completed => {}
            status => {
                return Err(FactoryError::InvalidState {
                    task: task.id,
                    status,
                    action: "claim",
                })
            }
        }

        let saga = self.saga();
        saga.consume(&self.handle(&task)?)?;

        let granted = task.granted_items();
        if !granted.is_empty() {
            saga.grant(&AddItemsRequest {
                user,
                section: self.player_section.clone(),
                operation_type: self.reward_operation_type.clone(),
                correlation_id: Some(task.id.to_string()),
                comment: Some(format!("production task {}", task.id)),
                recipe: Some(task.recipe),
                items: self.wire_items(&granted)?,
            })?;
        }

        task.status = TaskStatus::Claimed;
        task.finished_at = Some(now);
        self.store.update(&task)?;
        tracing::info!(user, task_id = %task.id, stacks = granted.len(), "production claimed");
        Ok(task)
    }

    /// Returns the reservation of a task that has not completed yet.
    ///
    /// # Errors
    ///
    /// - `TaskNotFound` / `Forbidden`
    /// - `InvalidState` once the task completed, was claimed or aborted
    /// - `Ledger` / `LedgerUnavailable`; the task is left as it was
    pub fn cancel(&self, user: UserId, id: &TaskId) -> FactoryResult<ProductionTask> {
        let lock = self.user_lock(user);
        let _guard = lock.lock();

        let mut task = self.owned(user, id)?;
        let now = self.clock.now();
        let status = task::status(&task, now);
        if !matches!(status, TaskStatus::Pending | TaskStatus::InProgress) {
            return Err(FactoryError::InvalidState {
                task: task.id,
                status,
                action: "cancel",
            });
        }

        self.saga().compensate(&self.handle(&task)?)?;
        task.status = TaskStatus::Cancelled;
        task.finished_at = Some(now);
        self.store.update(&task)?;
        tracing::info!(user, task_id = %task.id, "production cancelled");
        Ok(task)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Settles tasks stuck in `pending` for longer than `older_than`.
    ///
    /// A task stays pending only if the process died between persisting it
    /// and confirming the reservation. Each one gets its reservation
    /// returned (a no-op if it never landed) and is marked failed.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the task store fails.
    pub fn reconcile_pending(&self, older_than: Duration) -> FactoryResult<Vec<ProductionTask>> {
        let cutoff = self.clock.now() - older_than;
        let stale: Vec<ProductionTask> = self
            .store
            .with_status(TaskStatus::Pending)?
            .into_iter()
            .filter(|t| t.created_at <= cutoff)
            .collect();

        let mut settled = Vec::with_capacity(stale.len());
        for task in stale {
            let lock = self.user_lock(task.user);
            let _guard = lock.lock();
            let Some(mut task) = self.store.get(&task.id)? else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }

            let compensation = self.handle(&task).and_then(|h| self.saga().compensate(&h));
            task.status = TaskStatus::Failed;
            task.finished_at = Some(self.clock.now());
            match compensation {
                Ok(_) => {
                    task.failure = Some("abandoned before the reservation was confirmed".to_string());
                    tracing::warn!(user = task.user, task_id = %task.id, "stale pending task compensated");
                }
                Err(e) => {
                    task.failure = Some(format!("abandoned; compensation failed: {e}"));
                    task.needs_reconciliation = true;
                    tracing::error!(user = task.user, task_id = %task.id, error = %e, "stale pending task needs reconciliation");
                }
            }
            self.store.update(&task)?;
            settled.push(task);
        }
        Ok(settled)
    }

    /// Returns every listed reservation that no stored task owns.
    ///
    /// `holds` are `(user, correlation id)` pairs of open reservations; a
    /// hold whose id is not a known task id was left behind by a task that
    /// was never persisted. Failed releases are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the task store fails.
    pub fn release_orphaned(&self, holds: &[(UserId, String)]) -> FactoryResult<Vec<String>> {
        let mut released = Vec::new();
        for (user, correlation_id) in holds {
            if self.store.get(&TaskId::new(correlation_id.as_str()))?.is_some() {
                continue;
            }
            match self.saga().release(*user, correlation_id) {
                Ok(receipt) => {
                    tracing::warn!(
                        user,
                        correlation_id = %correlation_id,
                        stacks = receipt.items.len(),
                        "orphaned reservation returned"
                    );
                    released.push(correlation_id.clone());
                }
                Err(e) => {
                    tracing::error!(
                        user,
                        correlation_id = %correlation_id,
                        error = %e,
                        "orphaned reservation could not be returned"
                    );
                }
            }
        }
        Ok(released)
    }
}

impl std::fmt::Debug for ProductionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductionScheduler")
            .field("recipes", &self.recipes.len())
            .field("slots", &self.slots)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
