//! # Reservation Coordinator
//!
//! **The saga primitives.** Items are "locked" for a pending task by moving
//! them from the player's section into the factory section, and later either
//! moved back (`return_reserve`, the compensating action) or destroyed
//! (`consume_reserve`).
//!
//! ## Idempotency
//!
//! Every call is keyed by its correlation id. Each primitive writes exactly
//! one batch under `(correlation_id, operation_type)`, so a retry after
//! success is answered from the log instead of writing again.
//!
//! A `return_reserve` for an id with no reservation leaves a tombstone, so a
//! reserve that was lost in transit and lands after its compensation is
//! rejected instead of holding items for a task that already failed.
//!
//! ```text
//! reserve:  main  -q  /  factory +q     (type: reservation)
//! return:   main  +q  /  factory -q     (type: return_reserve)
//! consume:  factory -q                   (type: consume_reserve)
//! ```

use std::sync::Arc;

use crate::classifier::ClassifierKind;
use crate::config::{LedgerConfig, OP_CONSUME_RESERVE, OP_RESERVATION, OP_RETURN_RESERVE};
use crate::error::{EconomyError, EconomyResult};
use crate::item::{
    merge_amounts, ItemAmount, ItemStack, MissingItem, OperationId, OperationTypeId, SectionId,
    StackDelta, UserId,
};
use crate::ledger::LedgerEngine;
use crate::operation::{BatchKey, LedgerOperation, OperationMeta};
use crate::store::LedgerTx;

/// What a reservation primitive did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReservationReceipt {
    /// Key of the reservation.
    pub correlation_id: String,
    /// Rows written (or found, when replayed).
    pub operation_ids: Vec<OperationId>,
    /// Items moved.
    pub items: Vec<ItemAmount>,
    /// True when an earlier attempt had already done the work.
    pub replayed: bool,
}

impl ReservationReceipt {
    fn noop(correlation_id: &str) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            operation_ids: Vec::new(),
            items: Vec::new(),
            replayed: false,
        }
    }
}

/// Moves items between the player and factory sections.
#[derive(Debug)]
pub struct ReservationCoordinator {
    engine: Arc<LedgerEngine>,
    player_section: SectionId,
    factory_section: SectionId,
    op_reservation: OperationTypeId,
    op_return: OperationTypeId,
    op_consume: OperationTypeId,
}

impl ReservationCoordinator {
    /// Resolves the configured section and operation type codes.
    ///
    /// # Errors
    ///
    /// Returns `UnknownCode` if the registry has not been seeded.
    pub fn new(engine: Arc<LedgerEngine>, config: &LedgerConfig) -> EconomyResult<Self> {
        let classifiers = engine.classifiers();
        let player_section = classifiers.resolve(ClassifierKind::Section, &config.player_section)?;
        let factory_section = classifiers.resolve(ClassifierKind::Section, &config.factory_section)?;
        let op_reservation = classifiers.resolve(ClassifierKind::OperationType, OP_RESERVATION)?;
        let op_return = classifiers.resolve(ClassifierKind::OperationType, OP_RETURN_RESERVE)?;
        let op_consume = classifiers.resolve(ClassifierKind::OperationType, OP_CONSUME_RESERVE)?;
        Ok(Self {
            engine,
            player_section,
            factory_section,
            op_reservation,
            op_return,
            op_consume,
        })
    }

    /// Section items are reserved from.
    #[must_use]
    pub const fn player_section(&self) -> SectionId {
        self.player_section
    }

    /// Section holding reserved items.
    #[must_use]
    pub const fn factory_section(&self) -> SectionId {
        self.factory_section
    }

    /// Moves `items` from the player's section into the factory section.
    ///
    /// # Errors
    ///
    /// - `Validation` for a blank id, no items or a zero quantity
    /// - `InsufficientItems` listing every short stack; nothing is written
    /// - `Forbidden` if the id belongs to another user
    /// - `Conflict` if the id was reserved with different items, or was
    ///   returned before any reservation arrived
    pub fn reserve(
        &self,
        user: UserId,
        correlation_id: &str,
        items: &[ItemAmount],
    ) -> EconomyResult<ReservationReceipt> {
        validate_request(correlation_id, items)?;
        let items = merge_amounts(items);

        let receipt = self.engine.transaction(|tx| {
            check_owner(&tx.operations_by_correlation(correlation_id), user, correlation_id)?;
            if tx.tombstone(correlation_id).is_some() {
                return Err(EconomyError::Conflict(format!(
                    "reservation {correlation_id} was returned before it was made"
                )));
            }

            let key = BatchKey::new(correlation_id, self.op_reservation);
            let already = tx.batch(&key).is_some();

            if !already {
                let mut missing = Vec::new();
                for amount in &items {
                    let stack = ItemStack::new(user, self.player_section, amount.item, amount.variant);
                    let available = tx.balance(&stack)?.max(0) as u64;
                    if available < amount.quantity {
                        missing.push(MissingItem {
                            item: amount.item,
                            variant: amount.variant,
                            required: amount.quantity,
                            available,
                        });
                    }
                }
                if !missing.is_empty() {
                    return Err(EconomyError::InsufficientItems(missing));
                }
            }

            let mut deltas = Vec::with_capacity(items.len() * 2);
            for amount in &items {
                let stack = ItemStack::new(user, self.player_section, amount.item, amount.variant);
                let quantity = to_delta(amount.quantity)?;
                deltas.push(StackDelta::new(stack, -quantity));
                deltas.push(StackDelta::new(stack.in_section(self.factory_section), quantity));
            }

            let meta = OperationMeta::of_type(self.op_reservation).correlated(correlation_id);
            let outcome = tx.append_batch(&deltas, &meta)?;
            Ok(ReservationReceipt {
                correlation_id: correlation_id.to_string(),
                operation_ids: outcome.operation_ids,
                items: items.clone(),
                replayed: outcome.replayed,
            })
        })?;

        tracing::info!(
            user,
            correlation_id,
            stacks = receipt.items.len(),
            replayed = receipt.replayed,
            "items reserved"
        );
        Ok(receipt)
    }

    /// Writes the exact inverse of a reservation.
    ///
    /// Returning an id that was never reserved moves nothing but closes the
    /// id against later reservations.
    ///
    /// # Errors
    ///
    /// - `Validation` for a blank id
    /// - `Forbidden` if the reservation or tombstone belongs to another user
    /// - `Conflict` if it was already consumed, or `expected` disagrees
    pub fn return_reserve(
        &self,
        user: UserId,
        correlation_id: &str,
        expected: Option<&[ItemAmount]>,
    ) -> EconomyResult<ReservationReceipt> {
        if correlation_id.trim().is_empty() {
            return Err(EconomyError::Validation("correlation_id is required".to_string()));
        }
        let receipt = self.engine.transaction(|tx| {
            let Some(reserved) = tx.batch(&BatchKey::new(correlation_id, self.op_reservation)) else {
                return close_unreserved(tx, user, correlation_id);
            };
            check_owner(&reserved, user, correlation_id)?;
            let held = self.held_items(&reserved);
            check_expected(&held, expected)?;

            if tx.batch(&BatchKey::new(correlation_id, self.op_consume)).is_some() {
                return Err(EconomyError::Conflict(format!(
                    "reservation {correlation_id} was already consumed"
                )));
            }

            let deltas: Vec<StackDelta> = reserved
                .iter()
                .map(|op| StackDelta::new(op.stack, -op.delta))
                .collect();
            if tx.batch(&BatchKey::new(correlation_id, self.op_return)).is_none() {
                ensure_covered(tx, &deltas)?;
            }

            let meta = OperationMeta::of_type(self.op_return).correlated(correlation_id);
            let outcome = tx.append_batch(&deltas, &meta)?;
            Ok(ReservationReceipt {
                correlation_id: correlation_id.to_string(),
                operation_ids: outcome.operation_ids,
                items: held,
                replayed: outcome.replayed,
            })
        })?;

        tracing::info!(
            user,
            correlation_id,
            rows = receipt.operation_ids.len(),
            replayed = receipt.replayed,
            "reservation returned"
        );
        Ok(receipt)
    }

    /// Permanently removes reserved items from the factory section.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the id was never reserved
    /// - `Forbidden` if the reservation belongs to another user
    /// - `Conflict` if it was already returned, or `expected` disagrees
    pub fn consume_reserve(
        &self,
        user: UserId,
        correlation_id: &str,
        expected: Option<&[ItemAmount]>,
    ) -> EconomyResult<ReservationReceipt> {
        let receipt = self.engine.transaction(|tx| {
            let reserved = tx
                .batch(&BatchKey::new(correlation_id, self.op_reservation))
                .ok_or_else(|| EconomyError::NotFound(format!("reservation {correlation_id}")))?;
            check_owner(&reserved, user, correlation_id)?;
            let held = self.held_items(&reserved);
            check_expected(&held, expected)?;

            if tx.batch(&BatchKey::new(correlation_id, self.op_return)).is_some() {
                return Err(EconomyError::Conflict(format!(
                    "reservation {correlation_id} was already returned"
                )));
            }

            let deltas: Vec<StackDelta> = reserved
                .iter()
                .filter(|op| op.stack.section == self.factory_section && op.delta > 0)
                .map(|op| StackDelta::new(op.stack, -op.delta))
                .collect();
            if tx.batch(&BatchKey::new(correlation_id, self.op_consume)).is_none() {
                ensure_covered(tx, &deltas)?;
            }

            let meta = OperationMeta::of_type(self.op_consume).correlated(correlation_id);
            let outcome = tx.append_batch(&deltas, &meta)?;
            Ok(ReservationReceipt {
                correlation_id: correlation_id.to_string(),
                operation_ids: outcome.operation_ids,
                items: held,
                replayed: outcome.replayed,
            })
        })?;

        tracing::info!(
            user,
            correlation_id,
            rows = receipt.operation_ids.len(),
            replayed = receipt.replayed,
            "reservation consumed"
        );
        Ok(receipt)
    }

    /// Reservations neither returned nor consumed, as `(user, correlation id)`
    /// ordered by first row.
    #[must_use]
    pub fn open_reservations(&self) -> Vec<(UserId, String)> {
        self.engine.store().read(|view| {
            let settled = |id: &str| {
                view.batch(&BatchKey::new(id, self.op_return)).is_some()
                    || view.batch(&BatchKey::new(id, self.op_consume)).is_some()
            };
            let mut open: Vec<(OperationId, UserId, String)> = view
                .batch_keys()
                .filter(|key| key.operation_type == self.op_reservation)
                .filter(|key| !settled(key.correlation_id.as_str()))
                .filter_map(|key| {
                    let rows = view.batch(key)?;
                    let first = rows.first()?;
                    Some((first.id, first.stack.user, key.correlation_id.clone()))
                })
                .collect();
            open.sort_unstable();
            open.into_iter().map(|(_, user, id)| (user, id)).collect()
        })
    }

    fn held_items(&self, reserved: &[LedgerOperation]) -> Vec<ItemAmount> {
        reserved
            .iter()
            .filter(|op| op.stack.section == self.factory_section && op.delta > 0)
            .map(|op| ItemAmount::new(op.stack.item, op.stack.variant, op.delta as u64))
            .collect()
    }
}

fn close_unreserved(
    tx: &mut LedgerTx<'_>,
    user: UserId,
    correlation_id: &str,
) -> EconomyResult<ReservationReceipt> {
    if let Some(tombstone) = tx.tombstone(correlation_id) {
        if tombstone.user != user {
            return Err(EconomyError::Forbidden(format!(
                "correlation id {correlation_id} belongs to another user"
            )));
        }
        return Ok(ReservationReceipt {
            replayed: true,
            ..ReservationReceipt::noop(correlation_id)
        });
    }
    check_owner(&tx.operations_by_correlation(correlation_id), user, correlation_id)?;
    tx.close_correlation(correlation_id, user)?;
    tracing::warn!(user, correlation_id, "return before reservation, id closed");
    Ok(ReservationReceipt::noop(correlation_id))
}

fn validate_request(correlation_id: &str, items: &[ItemAmount]) -> EconomyResult<()> {
    if correlation_id.trim().is_empty() {
        return Err(EconomyError::Validation("correlation_id is required".to_string()));
    }
    if items.is_empty() {
        return Err(EconomyError::Validation("items must not be empty".to_string()));
    }
    if items.iter().any(|a| a.quantity == 0) {
        return Err(EconomyError::Validation("quantity must be positive".to_string()));
    }
    Ok(())
}

fn to_delta(quantity: u64) -> EconomyResult<i64> {
    i64::try_from(quantity).map_err(|_| EconomyError::ArithmeticOverflow)
}

fn check_owner(rows: &[LedgerOperation], user: UserId, correlation_id: &str) -> EconomyResult<()> {
    if rows.iter().any(|op| op.stack.user != user) {
        return Err(EconomyError::Forbidden(format!(
            "correlation id {correlation_id} belongs to another user"
        )));
    }
    Ok(())
}

fn check_expected(held: &[ItemAmount], expected: Option<&[ItemAmount]>) -> EconomyResult<()> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let mut want = merge_amounts(expected);
    let mut have = held.to_vec();
    let order = |a: &ItemAmount| (a.item, a.variant);
    want.sort_unstable_by_key(order);
    have.sort_unstable_by_key(order);
    if want != have {
        return Err(EconomyError::Conflict(
            "items do not match the reservation".to_string(),
        ));
    }
    Ok(())
}

/// Rejects a counter-write that would drive a stack negative.
fn ensure_covered(tx: &LedgerTx<'_>, deltas: &[StackDelta]) -> EconomyResult<()> {
    let mut missing = Vec::new();
    for d in deltas.iter().filter(|d| d.delta < 0) {
        let available = tx.balance(&d.stack)?.max(0) as u64;
        let required = d.delta.unsigned_abs();
        if available < required {
            missing.push(MissingItem {
                item: d.stack.item,
                variant: d.stack.variant,
                required,
                available,
            });
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(EconomyError::InsufficientItems(missing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ClassifierRegistry;
    use crate::clock::ManualClock;
    use crate::item::ItemVariant;
    use crate::store::LedgerStore;
    use chrono::{TimeZone, Utc};

    struct Fixture {
        engine: Arc<LedgerEngine>,
        coordinator: ReservationCoordinator,
        variant: ItemVariant,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ClassifierRegistry::in_memory());
        let config = LedgerConfig::default();
        config.seed(&registry).unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 4, 1, 8, 0, 0).unwrap()));
        let engine = Arc::new(LedgerEngine::new(
            Arc::new(LedgerStore::in_memory()),
            registry,
            clock,
        ));
        let coordinator = ReservationCoordinator::new(engine.clone(), &config).unwrap();
        Fixture {
            engine,
            coordinator,
            variant: ItemVariant::new(1, 1),
        }
    }

    impl Fixture {
        fn grant(&self, user: UserId, item: u32, quantity: i64) {
            let stack = ItemStack::new(user, self.coordinator.player_section(), item, self.variant);
            self.engine
                .add_operations(&[StackDelta::new(stack, quantity)], &OperationMeta::of_type(1))
                .unwrap();
        }

        fn main(&self, user: UserId, item: u32) -> i64 {
            let stack = ItemStack::new(user, self.coordinator.player_section(), item, self.variant);
            self.engine.get_balance(&stack).unwrap()
        }

        fn held(&self, user: UserId, item: u32) -> i64 {
            let stack = ItemStack::new(user, self.coordinator.factory_section(), item, self.variant);
            self.engine.get_balance(&stack).unwrap()
        }
    }

    #[test]
    fn test_reserve_moves_items() {
        let f = fixture();
        f.grant(1, 10, 30);
        let receipt = f
            .coordinator
            .reserve(1, "task-1", &[ItemAmount::new(10, f.variant, 20)])
            .unwrap();
        assert_eq!(receipt.operation_ids.len(), 2);
        assert_eq!(f.main(1, 10), 10);
        assert_eq!(f.held(1, 10), 20);
    }

    #[test]
    fn test_reserve_retry_is_noop() {
        let f = fixture();
        f.grant(1, 10, 30);
        let items = [ItemAmount::new(10, f.variant, 20)];
        let first = f.coordinator.reserve(1, "task-1", &items).unwrap();
        let second = f.coordinator.reserve(1, "task-1", &items).unwrap();
        assert!(second.replayed);
        assert_eq!(first.operation_ids, second.operation_ids);
        assert_eq!(f.main(1, 10), 10);
    }

    #[test]
    fn test_consume_after_return_conflicts() {
        let f = fixture();
        f.grant(1, 10, 5);
        f.coordinator.reserve(1, "t", &[ItemAmount::new(10, f.variant, 5)]).unwrap();
        f.coordinator.return_reserve(1, "t", None).unwrap();
        let err = f.coordinator.consume_reserve(1, "t", None).unwrap_err();
        assert!(matches!(err, EconomyError::Conflict(_)));
    }

    #[test]
    fn test_return_after_consume_conflicts() {
        let f = fixture();
        f.grant(1, 10, 5);
        f.coordinator.reserve(1, "t", &[ItemAmount::new(10, f.variant, 5)]).unwrap();
        f.coordinator.consume_reserve(1, "t", None).unwrap();
        assert_eq!(f.held(1, 10), 0);
        let err = f.coordinator.return_reserve(1, "t", None).unwrap_err();
        assert!(matches!(err, EconomyError::Conflict(_)));
    }

    #[test]
    fn test_unknown_ids() {
        let f = fixture();
        let noop = f.coordinator.return_reserve(1, "ghost", None).unwrap();
        assert!(noop.operation_ids.is_empty());
        assert!(!noop.replayed);
        assert!(matches!(
            f.coordinator.consume_reserve(1, "ghost", None),
            Err(EconomyError::NotFound(_))
        ));
    }

    #[test]
    fn test_late_reserve_after_return_is_rejected() {
        let f = fixture();
        f.grant(1, 10, 5);
        f.coordinator.return_reserve(1, "task-x", None).unwrap();

        let err = f
            .coordinator
            .reserve(1, "task-x", &[ItemAmount::new(10, f.variant, 5)])
            .unwrap_err();
        assert!(matches!(err, EconomyError::Conflict(_)));
        assert_eq!(f.main(1, 10), 5);
        assert_eq!(f.held(1, 10), 0);

        let again = f.coordinator.return_reserve(1, "task-x", None).unwrap();
        assert!(again.replayed);
        assert!(matches!(
            f.coordinator.return_reserve(2, "task-x", None),
            Err(EconomyError::Forbidden(_))
        ));
    }

    #[test]
    fn test_open_reservations() {
        let f = fixture();
        f.grant(1, 10, 9);
        f.grant(2, 10, 9);
        let three = [ItemAmount::new(10, f.variant, 3)];
        f.coordinator.reserve(1, "a", &three).unwrap();
        f.coordinator.reserve(2, "b", &three).unwrap();
        f.coordinator.reserve(1, "c", &three).unwrap();
        f.coordinator.return_reserve(1, "a", None).unwrap();
        f.coordinator.consume_reserve(1, "c", None).unwrap();

        assert_eq!(f.coordinator.open_reservations(), vec![(2, "b".to_string())]);
    }

    #[test]
    fn test_other_users_reservation_is_forbidden() {
        let f = fixture();
        f.grant(1, 10, 5);
        f.coordinator.reserve(1, "t", &[ItemAmount::new(10, f.variant, 5)]).unwrap();
        assert!(matches!(
            f.coordinator.consume_reserve(2, "t", None),
            Err(EconomyError::Forbidden(_))
        ));
        assert!(matches!(
            f.coordinator.return_reserve(2, "t", None),
            Err(EconomyError::Forbidden(_))
        ));
    }

    #[test]
    fn test_expected_items_must_match() {
        let f = fixture();
        f.grant(1, 10, 5);
        f.coordinator.reserve(1, "t", &[ItemAmount::new(10, f.variant, 5)]).unwrap();
        let wrong = [ItemAmount::new(10, f.variant, 4)];
        assert!(matches!(
            f.coordinator.consume_reserve(1, "t", Some(&wrong)),
            Err(EconomyError::Conflict(_))
        ));
        let right = [ItemAmount::new(10, f.variant, 5)];
        assert!(f.coordinator.consume_reserve(1, "t", Some(&right)).is_ok());
    }
}
