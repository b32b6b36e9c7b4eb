//! # Snapshot Compaction
//!
//! Periodic job writing one [`DailyBalanceSnapshot`] per stack so balance
//! reads only replay the rows since the last checkpoint. Runs outside the
//! request path; rerunning it for the same day writes nothing new.

use std::sync::Arc;

use chrono::NaiveDate;

use crate::clock::{start_of_day, Clock};
use crate::error::{EconomyError, EconomyResult};
use crate::operation::DailyBalanceSnapshot;
use crate::store::LedgerStore;

/// Outcome of one compaction run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompactionReport {
    /// Checkpoint day.
    pub date: NaiveDate,
    /// Stacks examined.
    pub stacks: usize,
    /// Snapshots inserted or changed.
    pub written: usize,
}

/// Writes daily balance checkpoints.
pub struct SnapshotCompactor {
    store: Arc<LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl SnapshotCompactor {
    /// Creates a compactor.
    #[must_use]
    pub fn new(store: Arc<LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Upserts the 00:00 UTC balance of `date` for every stack.
    ///
    /// # Errors
    ///
    /// - `Validation` if `date` has not started yet
    /// - `Storage` if the log write fails
    pub fn compact(&self, date: NaiveDate) -> EconomyResult<CompactionReport> {
        if start_of_day(date) > self.clock.now() {
            return Err(EconomyError::Validation(format!("cannot snapshot future date {date}")));
        }

        let (stacks, changed) = self.store.read(|view| {
            let mut stacks = 0usize;
            let mut changed = Vec::new();
            for stack in view.stacks() {
                stacks += 1;
                let quantity = view.balance_at_start_of(stack, date)?;
                if view.snapshot(stack, date) != Some(quantity) {
                    changed.push(DailyBalanceSnapshot {
                        stack: *stack,
                        date,
                        quantity,
                    });
                }
            }
            Ok::<_, EconomyError>((stacks, changed))
        })?;

        self.store.upsert_snapshots(&changed)?;

        tracing::info!(%date, stacks, written = changed.len(), "balance snapshots compacted");

        Ok(CompactionReport {
            date,
            stacks,
            written: changed.len(),
        })
    }

    /// Compacts the current UTC day.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the log write fails.
    pub fn compact_today(&self) -> EconomyResult<CompactionReport> {
        self.compact(self.clock.now().date_naive())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::item::{ItemStack, ItemVariant, StackDelta};
    use crate::operation::OperationMeta;
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn test_compact_is_idempotent() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 1, 20, 0, 0).unwrap()));
        let store = Arc::new(LedgerStore::in_memory());
        let stack = ItemStack::new(1, 1, 1, ItemVariant::new(1, 1));
        store
            .transaction(clock.now(), |tx| {
                tx.append_batch(&[StackDelta::new(stack, 9)], &OperationMeta::of_type(1))
            })
            .unwrap();

        clock.advance(Duration::hours(6));
        let compactor = SnapshotCompactor::new(store.clone(), clock.clone());
        let first = compactor.compact_today().unwrap();
        let second = compactor.compact_today().unwrap();

        assert_eq!(first.written, 1);
        assert_eq!(second.written, 0);
        assert_eq!(store.read(|v| v.snapshot(&stack, first.date)), Some(9));
        assert_eq!(store.balance(&stack, clock.now()).unwrap(), 9);
    }

    #[test]
    fn test_future_date_rejected() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 1, 20, 0, 0).unwrap()));
        let compactor = SnapshotCompactor::new(Arc::new(LedgerStore::in_memory()), clock);
        let tomorrow = NaiveDate::from_ymd_opt(2024, 2, 2).unwrap();
        assert!(matches!(
            compactor.compact(tomorrow),
            Err(EconomyError::Validation(_))
        ));
    }
}
