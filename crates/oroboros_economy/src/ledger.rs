//! # Ledger Engine
//!
//! Per-player item balances derived from snapshots + the operation log.
//!
//! ## Rules
//!
//! 1. **Append-only**: rows are never mutated or deleted, only countered
//! 2. **Atomic batches**: all rows of one call commit or none do
//! 3. **No affordability check**: callers validate before writing, inside
//!    the same transaction (see [`LedgerEngine::transaction`])

use std::sync::Arc;

use crate::classifier::ClassifierRegistry;
use crate::clock::Clock;
use crate::error::EconomyResult;
use crate::item::{ItemStack, SectionId, StackDelta, UserId};
use crate::operation::{LedgerOperation, OperationMeta};
use crate::store::{AddOutcome, LedgerStore, LedgerTx};

/// Balance reads and raw batch writes.
pub struct LedgerEngine {
    store: Arc<LedgerStore>,
    classifiers: Arc<ClassifierRegistry>,
    clock: Arc<dyn Clock>,
}

impl LedgerEngine {
    /// Creates an engine over a store.
    #[must_use]
    pub fn new(
        store: Arc<LedgerStore>,
        classifiers: Arc<ClassifierRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            classifiers,
            clock,
        }
    }

    /// The classifier cache this engine resolves codes through.
    #[must_use]
    pub fn classifiers(&self) -> &Arc<ClassifierRegistry> {
        &self.classifiers
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    /// The injected clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Current balance of one stack.
    ///
    /// # Errors
    ///
    /// Returns `ArithmeticOverflow` if the sum leaves the i64 range.
    pub fn get_balance(&self, stack: &ItemStack) -> EconomyResult<i64> {
        self.store.balance(stack, self.clock.now())
    }

    /// Non-empty piles of one user in one section.
    ///
    /// # Errors
    ///
    /// Returns `ArithmeticOverflow` if a sum leaves the i64 range.
    pub fn inventory(&self, user: UserId, section: SectionId) -> EconomyResult<Vec<(ItemStack, i64)>> {
        let now = self.clock.now();
        self.store.read(|view| view.balances_for(user, section, now))
    }

    /// Appends one batch of rows as a single transaction.
    ///
    /// # Errors
    ///
    /// - `Validation` for an empty batch or a zero delta
    /// - `Conflict` when the correlation key was used for a different batch
    /// - `Storage` when the log write fails
    pub fn add_operations(&self, deltas: &[StackDelta], meta: &OperationMeta) -> EconomyResult<AddOutcome> {
        let outcome = self.transaction(|tx| tx.append_batch(deltas, meta))?;
        if !outcome.replayed {
            tracing::debug!(
                rows = outcome.operation_ids.len(),
                operation_type = meta.operation_type,
                correlation_id = meta.correlation_id.as_deref(),
                "operations added"
            );
        }
        Ok(outcome)
    }

    /// Every row tagged with a correlation id, oldest first.
    #[must_use]
    pub fn operations_by_correlation_id(&self, correlation_id: &str) -> Vec<LedgerOperation> {
        self.store.read(|view| {
            view.operations_by_correlation(correlation_id)
                .into_iter()
                .cloned()
                .collect()
        })
    }

    /// Runs a validated multi-batch write at the clock's current time.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns, or `Storage` if the log write fails.
    pub fn transaction<T, F>(&self, f: F) -> EconomyResult<T>
    where
        F: FnOnce(&mut LedgerTx<'_>) -> EconomyResult<T>,
    {
        self.store.transaction(self.clock.now(), f)
    }
}

impl std::fmt::Debug for LedgerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerEngine")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::item::ItemVariant;
    use chrono::{TimeZone, Utc};

    fn engine() -> LedgerEngine {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 5, 9, 0, 0).unwrap());
        LedgerEngine::new(
            Arc::new(LedgerStore::in_memory()),
            Arc::new(ClassifierRegistry::in_memory()),
            Arc::new(clock),
        )
    }

    #[test]
    fn test_add_and_balance() {
        let engine = engine();
        let stack = ItemStack::new(4, 1, 10, ItemVariant::new(1, 1));
        engine
            .add_operations(&[StackDelta::new(stack, 12)], &OperationMeta::of_type(1))
            .unwrap();
        engine
            .add_operations(&[StackDelta::new(stack, -5)], &OperationMeta::of_type(1))
            .unwrap();
        assert_eq!(engine.get_balance(&stack).unwrap(), 7);
        assert_eq!(engine.inventory(4, 1).unwrap(), vec![(stack, 7)]);
        assert!(engine.inventory(4, 2).unwrap().is_empty());
    }

    #[test]
    fn test_correlation_lookup() {
        let engine = engine();
        let a = ItemStack::new(4, 1, 10, ItemVariant::new(1, 1));
        let b = a.in_section(2);
        engine
            .add_operations(
                &[StackDelta::new(a, -3), StackDelta::new(b, 3)],
                &OperationMeta::of_type(1).correlated("move-1"),
            )
            .unwrap();
        let rows = engine.operations_by_correlation_id("move-1");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].stack, a);
        assert!(engine.operations_by_correlation_id("move-2").is_empty());
    }
}
