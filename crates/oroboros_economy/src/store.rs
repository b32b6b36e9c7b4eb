//! # Ledger Store
//!
//! The operation log and the snapshot table, behind one lock.
//!
//! Every write goes through [`LedgerStore::transaction`]: the closure sees
//! committed state plus whatever it has staged so far, and its rows are
//! logged and applied together only if it returns `Ok`. Validation done
//! inside the closure is therefore serializable with every other write.
//!
//! A log write that fails poisons the store: the batch may or may not be on
//! disk, so further writes are refused until the log is reopened and
//! recovery decides. Reads keep working.
//!
//! The store is also the durable [`ClassifierSource`]: classifier rows are
//! logged like operations and replayed before any configured code is seeded.
//!
//! ## Balance rule
//!
//! ```text
//! balance(stack, now) = snapshot(latest date <= today)
//!                     + sum(delta of ops created at or after that date's 00:00 UTC)
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveDate;
use parking_lot::Mutex;

use crate::classifier::{Classifier, ClassifierKind, ClassifierSource};
use crate::clock::start_of_day;
use crate::error::{EconomyError, EconomyResult};
use crate::item::{ItemStack, OperationId, SectionId, StackDelta, Timestamp, UserId};
use crate::operation::{
    BatchKey, DailyBalanceSnapshot, LedgerOperation, OperationMeta, ReturnTombstone,
};
use crate::wal::OperationLog;

/// Result of appending one batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddOutcome {
    /// Ids of the batch rows, in request order.
    pub operation_ids: Vec<OperationId>,
    /// True when the batch had been committed earlier under the same key.
    pub replayed: bool,
}

#[derive(Debug, Default)]
struct LedgerState {
    /// Append-only; position `i` holds the row with id `i + 1`.
    operations: Vec<LedgerOperation>,
    by_stack: HashMap<ItemStack, Vec<usize>>,
    by_correlation: HashMap<String, Vec<usize>>,
    batches: HashMap<BatchKey, Vec<OperationId>>,
    snapshots: HashMap<ItemStack, BTreeMap<NaiveDate, i64>>,
    tombstones: HashMap<String, ReturnTombstone>,
    classifiers: HashMap<ClassifierKind, Vec<Classifier>>,
}

impl LedgerState {
    fn next_id(&self) -> OperationId {
        self.operations.len() as OperationId + 1
    }

    fn apply(&mut self, op: LedgerOperation) {
        let idx = self.operations.len();
        self.by_stack.entry(op.stack).or_default().push(idx);
        if let Some(correlation_id) = &op.correlation_id {
            self.by_correlation
                .entry(correlation_id.clone())
                .or_default()
                .push(idx);
            self.batches
                .entry(BatchKey::new(correlation_id.clone(), op.operation_type))
                .or_default()
                .push(op.id);
        }
        self.operations.push(op);
    }

    fn apply_snapshot(&mut self, snapshot: DailyBalanceSnapshot) {
        self.snapshots
            .entry(snapshot.stack)
            .or_default()
            .insert(snapshot.date, snapshot.quantity);
    }

    fn apply_tombstone(&mut self, tombstone: ReturnTombstone) {
        self.tombstones
            .entry(tombstone.correlation_id.clone())
            .or_insert(tombstone);
    }

    fn apply_classifier(&mut self, kind: ClassifierKind, row: Classifier) -> EconomyResult<()> {
        let table = self.classifiers.entry(kind).or_default();
        if let Some(clash) = table.iter().find(|r| r.id == row.id || r.code == row.code) {
            return Err(EconomyError::Storage(format!(
                "{kind} row {} ({}) clashes with stored row {} ({})",
                row.id, row.code, clash.id, clash.code
            )));
        }
        table.push(row);
        Ok(())
    }
}

/// Read access to committed state.
#[derive(Clone, Copy)]
pub struct LedgerView<'a> {
    state: &'a LedgerState,
}

impl<'a> LedgerView<'a> {
    fn sum(&self, stack: &ItemStack, today: NaiveDate, cutoff: Option<Timestamp>) -> EconomyResult<i64> {
        let snapshot = self
            .state
            .snapshots
            .get(stack)
            .and_then(|days| days.range(..=today).next_back());
        let (mut total, since) = match snapshot {
            Some((date, quantity)) => (*quantity, Some(start_of_day(*date))),
            None => (0, None),
        };

        let rows = self.state.by_stack.get(stack).map_or(&[][..], Vec::as_slice);
        for &idx in rows {
            let op = &self.state.operations[idx];
            if since.is_some_and(|s| op.created_at < s) || cutoff.is_some_and(|c| op.created_at >= c) {
                continue;
            }
            total = total
                .checked_add(op.delta)
                .ok_or(EconomyError::ArithmeticOverflow)?;
        }
        Ok(total)
    }

    /// Current balance of a stack, as seen at `now`.
    ///
    /// # Errors
    ///
    /// Returns `ArithmeticOverflow` if the sum leaves the i64 range.
    pub fn balance(&self, stack: &ItemStack, now: Timestamp) -> EconomyResult<i64> {
        self.sum(stack, now.date_naive(), None)
    }

    /// Balance at 00:00 UTC of `date`: every row created before that instant.
    ///
    /// # Errors
    ///
    /// Returns `ArithmeticOverflow` if the sum leaves the i64 range.
    pub fn balance_at_start_of(&self, stack: &ItemStack, date: NaiveDate) -> EconomyResult<i64> {
        // Only snapshots strictly before `date` can describe an earlier instant.
        match date.pred_opt() {
            Some(day_before) => self.sum(stack, day_before, Some(start_of_day(date))),
            None => Ok(0),
        }
    }

    /// Non-zero balances of one user in one section, ordered by stack key.
    ///
    /// # Errors
    ///
    /// Returns `ArithmeticOverflow` if a sum leaves the i64 range.
    pub fn balances_for(
        &self,
        user: UserId,
        section: SectionId,
        now: Timestamp,
    ) -> EconomyResult<Vec<(ItemStack, i64)>> {
        let mut stacks: Vec<&ItemStack> = self
            .stacks()
            .filter(|s| s.user == user && s.section == section)
            .collect();
        stacks.sort_unstable();

        let mut out = Vec::with_capacity(stacks.len());
        for stack in stacks {
            let quantity = self.balance(stack, now)?;
            if quantity != 0 {
                out.push((*stack, quantity));
            }
        }
        Ok(out)
    }

    /// Every stack that has a row or a snapshot.
    pub fn stacks(&self) -> impl Iterator<Item = &'a ItemStack> + 'a {
        let state = self.state;
        let snapshot_only = state
            .snapshots
            .keys()
            .filter(move |s| !state.by_stack.contains_key(*s));
        state.by_stack.keys().chain(snapshot_only)
    }

    /// The snapshot stored for one stack and day.
    #[must_use]
    pub fn snapshot(&self, stack: &ItemStack, date: NaiveDate) -> Option<i64> {
        self.state.snapshots.get(stack)?.get(&date).copied()
    }

    /// Rows of one stack, oldest first.
    #[must_use]
    pub fn operations_for(&self, stack: &ItemStack) -> Vec<&'a LedgerOperation> {
        self.state
            .by_stack
            .get(stack)
            .map(|rows| rows.iter().map(|&i| &self.state.operations[i]).collect())
            .unwrap_or_default()
    }

    /// Rows tagged with a correlation id, oldest first.
    #[must_use]
    pub fn operations_by_correlation(&self, correlation_id: &str) -> Vec<&'a LedgerOperation> {
        self.state
            .by_correlation
            .get(correlation_id)
            .map(|rows| rows.iter().map(|&i| &self.state.operations[i]).collect())
            .unwrap_or_default()
    }

    /// Rows of a committed batch.
    #[must_use]
    pub fn batch(&self, key: &BatchKey) -> Option<Vec<&'a LedgerOperation>> {
        let ids = self.state.batches.get(key)?;
        Some(ids.iter().map(|&id| &self.state.operations[(id - 1) as usize]).collect())
    }

    /// Keys of every committed batch, in no particular order.
    pub fn batch_keys(&self) -> impl Iterator<Item = &'a BatchKey> + 'a {
        self.state.batches.keys()
    }

    /// Number of committed rows.
    #[must_use]
    pub fn operation_count(&self) -> usize {
        self.state.operations.len()
    }

    /// The tombstone closing a correlation id, if any.
    #[must_use]
    pub fn tombstone(&self, correlation_id: &str) -> Option<&'a ReturnTombstone> {
        self.state.tombstones.get(correlation_id)
    }
}

/// A write in progress. Dropped without commit if the closure fails.
pub struct LedgerTx<'a> {
    view: LedgerView<'a>,
    now: Timestamp,
    next_id: OperationId,
    staged: Vec<LedgerOperation>,
    staged_tombstones: Vec<ReturnTombstone>,
}

impl<'a> LedgerTx<'a> {
    /// Commit time of every row in this transaction.
    #[must_use]
    pub const fn now(&self) -> Timestamp {
        self.now
    }

    /// Committed state, without this transaction's rows.
    #[must_use]
    pub const fn committed(&self) -> LedgerView<'a> {
        self.view
    }

    /// Balance including rows staged by this transaction.
    ///
    /// # Errors
    ///
    /// Returns `ArithmeticOverflow` if the sum leaves the i64 range.
    pub fn balance(&self, stack: &ItemStack) -> EconomyResult<i64> {
        let mut total = self.view.balance(stack, self.now)?;
        for op in self.staged.iter().filter(|op| op.stack == *stack) {
            total = total
                .checked_add(op.delta)
                .ok_or(EconomyError::ArithmeticOverflow)?;
        }
        Ok(total)
    }

    /// Rows of a batch, committed or staged here.
    #[must_use]
    pub fn batch(&self, key: &BatchKey) -> Option<Vec<LedgerOperation>> {
        if let Some(rows) = self.view.batch(key) {
            return Some(rows.into_iter().cloned().collect());
        }
        let staged: Vec<LedgerOperation> = self
            .staged
            .iter()
            .filter(|op| {
                op.operation_type == key.operation_type
                    && op.correlation_id.as_deref() == Some(key.correlation_id.as_str())
            })
            .cloned()
            .collect();
        (!staged.is_empty()).then_some(staged)
    }

    /// Rows tagged with a correlation id, committed or staged here.
    #[must_use]
    pub fn operations_by_correlation(&self, correlation_id: &str) -> Vec<LedgerOperation> {
        let mut rows: Vec<LedgerOperation> = self
            .view
            .operations_by_correlation(correlation_id)
            .into_iter()
            .cloned()
            .collect();
        rows.extend(
            self.staged
                .iter()
                .filter(|op| op.correlation_id.as_deref() == Some(correlation_id))
                .cloned(),
        );
        rows
    }

    /// The tombstone closing a correlation id, committed or staged here.
    #[must_use]
    pub fn tombstone(&self, correlation_id: &str) -> Option<ReturnTombstone> {
        self.view.tombstone(correlation_id).cloned().or_else(|| {
            self.staged_tombstones
                .iter()
                .find(|t| t.correlation_id == correlation_id)
                .cloned()
        })
    }

    /// Stages a tombstone for a correlation id that has no rows yet.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if rows already carry the id.
    pub fn close_correlation(&mut self, correlation_id: &str, user: UserId) -> EconomyResult<()> {
        if !self.operations_by_correlation(correlation_id).is_empty() {
            return Err(EconomyError::Conflict(format!(
                "correlation id {correlation_id} is already in use"
            )));
        }
        if self.tombstone(correlation_id).is_none() {
            self.staged_tombstones.push(ReturnTombstone {
                correlation_id: correlation_id.to_string(),
                user,
                created_at: self.now,
            });
        }
        Ok(())
    }

    /// Stages one batch of rows sharing `meta`.
    ///
    /// Does not check affordability; callers validate through
    /// [`Self::balance`] first. A batch whose `(correlation_id, operation_type)`
    /// was already written is answered with the original ids when the rows
    /// match, and rejected as a conflict when they differ.
    ///
    /// # Errors
    ///
    /// - `Validation` for an empty batch or a zero delta
    /// - `Conflict` for a reused key with a different payload
    pub fn append_batch(
        &mut self,
        deltas: &[StackDelta],
        meta: &OperationMeta,
    ) -> EconomyResult<AddOutcome> {
        if deltas.is_empty() {
            return Err(EconomyError::Validation("batch has no rows".to_string()));
        }
        if deltas.iter().any(|d| d.delta == 0) {
            return Err(EconomyError::Validation("zero delta".to_string()));
        }

        if let Some(correlation_id) = &meta.correlation_id {
            let key = BatchKey::new(correlation_id.clone(), meta.operation_type);
            if let Some(existing) = self.batch(&key) {
                let same = existing.len() == deltas.len()
                    && existing
                        .iter()
                        .zip(deltas)
                        .all(|(op, d)| op.stack == d.stack && op.delta == d.delta);
                if !same {
                    return Err(EconomyError::Conflict(format!(
                        "correlation id {correlation_id} already used for a different batch"
                    )));
                }
                tracing::info!(
                    correlation_id = %correlation_id,
                    operation_type = meta.operation_type,
                    "duplicate batch answered from the log"
                );
                return Ok(AddOutcome {
                    operation_ids: existing.iter().map(|op| op.id).collect(),
                    replayed: true,
                });
            }
        }

        let mut ids = Vec::with_capacity(deltas.len());
        for d in deltas {
            let id = self.next_id;
            self.next_id += 1;
            ids.push(id);
            self.staged.push(LedgerOperation {
                id,
                stack: d.stack,
                delta: d.delta,
                operation_type: meta.operation_type,
                correlation_id: meta.correlation_id.clone(),
                recipe: meta.recipe,
                comment: meta.comment.clone(),
                created_at: self.now,
            });
        }

        Ok(AddOutcome {
            operation_ids: ids,
            replayed: false,
        })
    }
}

/// Operation log + snapshots, optionally backed by a WAL file.
#[derive(Debug)]
pub struct LedgerStore {
    state: Mutex<LedgerState>,
    log: Option<OperationLog>,
    poisoned: AtomicBool,
}

impl LedgerStore {
    /// A store that lives only in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            log: None,
            poisoned: AtomicBool::new(false),
        }
    }

    /// Opens a WAL-backed store, replaying every committed batch.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the log cannot be opened or decoded.
    pub fn open(path: impl AsRef<Path>) -> EconomyResult<Self> {
        let (log, recovered) = OperationLog::open(path)?;

        let mut state = LedgerState::default();
        for op in recovered.operations {
            if op.id != state.next_id() {
                tracing::error!(
                    expected = state.next_id(),
                    found = op.id,
                    "operation log is out of sequence"
                );
                return Err(EconomyError::Storage(format!(
                    "operation {} out of sequence (expected {})",
                    op.id,
                    state.next_id()
                )));
            }
            state.apply(op);
        }
        for snapshot in recovered.snapshots {
            state.apply_snapshot(snapshot);
        }
        for tombstone in recovered.tombstones {
            state.apply_tombstone(tombstone);
        }
        for (kind, row) in recovered.classifiers {
            state.apply_classifier(kind, row)?;
        }

        tracing::info!(
            path = %log.path().display(),
            operations = state.operations.len(),
            stacks = state.by_stack.len(),
            tombstones = state.tombstones.len(),
            "ledger recovered"
        );

        Ok(Self {
            state: Mutex::new(state),
            log: Some(log),
            poisoned: AtomicBool::new(false),
        })
    }

    /// True once a log write has failed; writes are refused until reopen.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    fn ensure_writable(&self) -> EconomyResult<()> {
        if self.is_poisoned() {
            return Err(EconomyError::Storage(
                "ledger store is poisoned by a failed log write, reopen required".to_string(),
            ));
        }
        Ok(())
    }

    /// Runs a log write, poisoning the store if it fails.
    fn logged(&self, write: impl FnOnce(&OperationLog) -> EconomyResult<()>) -> EconomyResult<()> {
        let Some(log) = &self.log else {
            return Ok(());
        };
        write(log).map_err(|e| {
            self.poisoned.store(true, Ordering::SeqCst);
            tracing::error!(error = %e, "log write failed, ledger store poisoned");
            e
        })
    }

    /// Runs `f` against committed state and commits its staged rows.
    ///
    /// Rows reach the log before they become visible. If `f` fails nothing is
    /// written.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns, or `Storage` if the store is poisoned or
    /// the log write fails.
    pub fn transaction<T, F>(&self, now: Timestamp, f: F) -> EconomyResult<T>
    where
        F: FnOnce(&mut LedgerTx<'_>) -> EconomyResult<T>,
    {
        self.ensure_writable()?;
        let mut state = self.state.lock();

        let (value, staged, tombstones) = {
            let mut tx = LedgerTx {
                view: LedgerView { state: &state },
                now,
                next_id: state.next_id(),
                staged: Vec::new(),
                staged_tombstones: Vec::new(),
            };
            let value = f(&mut tx)?;
            (value, tx.staged, tx.staged_tombstones)
        };

        if staged.is_empty() && tombstones.is_empty() {
            return Ok(value);
        }

        self.logged(|log| log.append_batch(&staged, &tombstones))?;

        let rows = staged.len();
        for op in staged {
            state.apply(op);
        }
        for tombstone in tombstones {
            state.apply_tombstone(tombstone);
        }
        tracing::debug!(rows, "ledger batch committed");

        Ok(value)
    }

    /// Runs `f` against a consistent view of committed state.
    pub fn read<T>(&self, f: impl FnOnce(LedgerView<'_>) -> T) -> T {
        let state = self.state.lock();
        f(LedgerView { state: &state })
    }

    /// Upserts snapshots (logged first when a WAL is attached).
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the store is poisoned or the log write fails.
    pub fn upsert_snapshots(&self, snapshots: &[DailyBalanceSnapshot]) -> EconomyResult<()> {
        if snapshots.is_empty() {
            return Ok(());
        }
        self.ensure_writable()?;
        let mut state = self.state.lock();
        self.logged(|log| log.append_snapshots(snapshots))?;
        for snapshot in snapshots {
            state.apply_snapshot(*snapshot);
        }
        Ok(())
    }

    /// Current balance of one stack.
    ///
    /// # Errors
    ///
    /// Returns `ArithmeticOverflow` if the sum leaves the i64 range.
    pub fn balance(&self, stack: &ItemStack, now: Timestamp) -> EconomyResult<i64> {
        self.read(|view| view.balance(stack, now))
    }
}

impl ClassifierSource for LedgerStore {
    fn load(&self, kind: ClassifierKind) -> EconomyResult<Vec<Classifier>> {
        Ok(self.state.lock().classifiers.get(&kind).cloned().unwrap_or_default())
    }

    /// Known codes keep their stored id; a new code gets the next free id.
    fn insert(&self, kind: ClassifierKind, code: &str) -> EconomyResult<Classifier> {
        let mut state = self.state.lock();
        let table = state.classifiers.entry(kind).or_default();
        if let Some(existing) = table.iter().find(|row| row.code == code) {
            return Ok(existing.clone());
        }
        let id = table
            .iter()
            .map(|row| row.id)
            .max()
            .unwrap_or(0)
            .checked_add(1)
            .ok_or_else(|| EconomyError::Storage(format!("{kind} table is full")))?;
        let row = Classifier {
            id,
            code: code.to_string(),
        };

        self.ensure_writable()?;
        self.logged(|log| log.append_classifier(kind, &row))?;
        state.apply_classifier(kind, row.clone())?;
        tracing::info!(%kind, id, code, "classifier registered");
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemVariant;
    use chrono::{Duration, TimeZone, Utc};

    fn stack(item: u32) -> ItemStack {
        ItemStack::new(1, 1, item, ItemVariant::new(1, 1))
    }

    fn now() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 6, 10, 15, 0, 0).unwrap()
    }

    #[test]
    fn test_failed_closure_writes_nothing() {
        let store = LedgerStore::in_memory();
        let result: EconomyResult<()> = store.transaction(now(), |tx| {
            tx.append_batch(&[StackDelta::new(stack(1), 5)], &OperationMeta::of_type(1))?;
            Err(EconomyError::Validation("nope".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(store.balance(&stack(1), now()).unwrap(), 0);
        assert_eq!(store.read(|v| v.operation_count()), 0);
    }

    #[test]
    fn test_staged_rows_are_visible_inside() {
        let store = LedgerStore::in_memory();
        store
            .transaction(now(), |tx| {
                tx.append_batch(&[StackDelta::new(stack(1), 5)], &OperationMeta::of_type(1))?;
                assert_eq!(tx.balance(&stack(1))?, 5);
                assert_eq!(tx.committed().balance(&stack(1), now())?, 0);
                Ok(())
            })
            .unwrap();
        assert_eq!(store.balance(&stack(1), now()).unwrap(), 5);
    }

    #[test]
    fn test_duplicate_key_replays() {
        let store = LedgerStore::in_memory();
        let meta = OperationMeta::of_type(2).correlated("req-1");
        let rows = [StackDelta::new(stack(1), 5), StackDelta::new(stack(2), 3)];

        let first = store.transaction(now(), |tx| tx.append_batch(&rows, &meta)).unwrap();
        let second = store.transaction(now(), |tx| tx.append_batch(&rows, &meta)).unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.operation_ids, second.operation_ids);
        assert_eq!(store.balance(&stack(1), now()).unwrap(), 5);
    }

    #[test]
    fn test_duplicate_key_with_other_payload_conflicts() {
        let store = LedgerStore::in_memory();
        let meta = OperationMeta::of_type(2).correlated("req-1");
        store
            .transaction(now(), |tx| tx.append_batch(&[StackDelta::new(stack(1), 5)], &meta))
            .unwrap();
        let err = store
            .transaction(now(), |tx| tx.append_batch(&[StackDelta::new(stack(1), 6)], &meta))
            .unwrap_err();
        assert!(matches!(err, EconomyError::Conflict(_)));
    }

    #[test]
    fn test_same_key_other_type_is_independent() {
        let store = LedgerStore::in_memory();
        let rows = [StackDelta::new(stack(1), 5)];
        store
            .transaction(now(), |tx| tx.append_batch(&rows, &OperationMeta::of_type(1).correlated("t")))
            .unwrap();
        let second = store
            .transaction(now(), |tx| tx.append_batch(&rows, &OperationMeta::of_type(2).correlated("t")))
            .unwrap();
        assert!(!second.replayed);
        assert_eq!(store.balance(&stack(1), now()).unwrap(), 10);
    }

    #[test]
    fn test_snapshot_bounds_replay() {
        let store = LedgerStore::in_memory();
        let yesterday = now() - Duration::days(1);
        store
            .transaction(yesterday, |tx| {
                tx.append_batch(&[StackDelta::new(stack(1), 7)], &OperationMeta::of_type(1))
            })
            .unwrap();
        store
            .transaction(now(), |tx| {
                tx.append_batch(&[StackDelta::new(stack(1), -2)], &OperationMeta::of_type(1))
            })
            .unwrap();

        let today = now().date_naive();
        let at_midnight = store.read(|v| v.balance_at_start_of(&stack(1), today)).unwrap();
        assert_eq!(at_midnight, 7);

        store
            .upsert_snapshots(&[DailyBalanceSnapshot {
                stack: stack(1),
                date: today,
                quantity: at_midnight,
            }])
            .unwrap();
        assert_eq!(store.balance(&stack(1), now()).unwrap(), 5);
    }

    fn temp_path(tag: &str) -> std::path::PathBuf {
        let id = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("test_store_{tag}_{id}.wal"))
    }

    fn grant(store: &LedgerStore, quantity: i64) -> EconomyResult<AddOutcome> {
        store.transaction(now(), |tx| {
            tx.append_batch(&[StackDelta::new(stack(1), quantity)], &OperationMeta::of_type(1))
        })
    }

    #[test]
    fn test_failed_commit_poisons_until_reopen() {
        let path = temp_path("poison");
        {
            let store = LedgerStore::open(&path).unwrap();
            grant(&store, 5).unwrap();

            store.log.as_ref().unwrap().fail_syncs(true);
            assert!(matches!(grant(&store, 7), Err(EconomyError::Storage(_))));
            assert!(store.is_poisoned());

            store.log.as_ref().unwrap().fail_syncs(false);
            assert!(matches!(grant(&store, 1), Err(EconomyError::Storage(_))));
            assert!(store
                .upsert_snapshots(&[DailyBalanceSnapshot {
                    stack: stack(1),
                    date: now().date_naive(),
                    quantity: 5,
                }])
                .is_err());
            // Reads still answer from the state applied before the failure.
            assert_eq!(store.balance(&stack(1), now()).unwrap(), 5);
        }
        {
            // The undecided batch reached the file; recovery keeps it and the
            // ids stay in sequence.
            let store = LedgerStore::open(&path).unwrap();
            assert!(!store.is_poisoned());
            assert_eq!(store.read(|v| v.operation_count()), 2);
            assert_eq!(store.balance(&stack(1), now()).unwrap(), 12);
            grant(&store, 1).unwrap();
            assert_eq!(store.read(|v| v.operation_count()), 3);
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_classifier_ids_survive_reopen() {
        let path = temp_path("classifiers");
        {
            let store = LedgerStore::open(&path).unwrap();
            assert_eq!(store.insert(ClassifierKind::Item, "stone").unwrap().id, 1);
            assert_eq!(store.insert(ClassifierKind::Item, "wood").unwrap().id, 2);
            assert_eq!(store.insert(ClassifierKind::Section, "main").unwrap().id, 1);
        }
        {
            let store = LedgerStore::open(&path).unwrap();
            assert_eq!(store.insert(ClassifierKind::Item, "coal").unwrap().id, 3);
            assert_eq!(store.insert(ClassifierKind::Item, "wood").unwrap().id, 2);
            assert_eq!(store.load(ClassifierKind::Item).unwrap().len(), 3);
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_tombstone_needs_unused_id() {
        let store = LedgerStore::in_memory();
        let meta = OperationMeta::of_type(1).correlated("used");
        store
            .transaction(now(), |tx| tx.append_batch(&[StackDelta::new(stack(1), 5)], &meta))
            .unwrap();
        let err = store
            .transaction(now(), |tx| tx.close_correlation("used", 1))
            .unwrap_err();
        assert!(matches!(err, EconomyError::Conflict(_)));

        store
            .transaction(now(), |tx| tx.close_correlation("fresh", 1))
            .unwrap();
        assert_eq!(store.read(|v| v.tombstone("fresh").map(|t| t.user)), Some(1));
    }

    #[test]
    fn test_rejects_empty_and_zero() {
        let store = LedgerStore::in_memory();
        let meta = OperationMeta::of_type(1);
        assert!(store.transaction(now(), |tx| tx.append_batch(&[], &meta)).is_err());
        assert!(store
            .transaction(now(), |tx| tx.append_batch(&[StackDelta::new(stack(1), 0)], &meta))
            .is_err());
    }
}
