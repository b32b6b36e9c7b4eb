//! # Ledger Service
//!
//! The typed form of the ledger API. Speaks classifier codes on the wire,
//! checks the caller's credential class, and turns every failure into an
//! [`ApiError`] with structured details.
//!
//! | call | caller |
//! |------|--------|
//! | `inventory` | player (own items), service, admin |
//! | `add_items` | service, admin |
//! | `adjust` | admin |
//! | `reserve` / `return_reserve` / `consume_reserve` | service |

use std::collections::HashMap;
use std::sync::Arc;

use crate::api::{
    AddItemsRequest, AddItemsResponse, AdjustRequest, ApiError, ErrorCode, InventoryEntry,
    InventoryResponse, ItemQuantity, MissingItemView, ReservationResponse, ReserveRequest,
    SettleRequest,
};
use crate::classifier::{ClassifierKind, ClassifierRegistry, ClassifierSource};
use crate::clock::Clock;
use crate::config::{LedgerConfig, OP_ADJUST};
use crate::error::{EconomyError, EconomyResult};
use crate::item::{ItemAmount, ItemStack, ItemVariant, MissingItem, SectionId, StackDelta, UserId};
use crate::ledger::LedgerEngine;
use crate::operation::{BatchKey, OperationMeta};
use crate::reservation::{ReservationCoordinator, ReservationReceipt};
use crate::snapshot::SnapshotCompactor;
use crate::store::{LedgerStore, LedgerTx};

/// Credential class of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Caller {
    /// An authenticated end user.
    Player(UserId),
    /// Another backend service.
    Service,
    /// An operator.
    Admin,
}

/// The ledger API.
#[derive(Debug)]
pub struct LedgerService {
    engine: Arc<LedgerEngine>,
    reservations: ReservationCoordinator,
    config: LedgerConfig,
}

impl LedgerService {
    /// Wraps an engine whose registry is already seeded.
    ///
    /// # Errors
    ///
    /// Returns `UnknownCode` if the configured sections are not registered.
    pub fn new(engine: Arc<LedgerEngine>, config: LedgerConfig) -> EconomyResult<Self> {
        let reservations = ReservationCoordinator::new(Arc::clone(&engine), &config)?;
        Ok(Self {
            engine,
            reservations,
            config,
        })
    }

    /// Builds the whole ledger from configuration: store, registry and engine.
    ///
    /// The registry reads through the store, so codes recovered from the log
    /// keep their ids and configured codes not seen before are appended.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation log cannot be opened or seeding fails.
    pub fn from_config(config: LedgerConfig, clock: Arc<dyn Clock>) -> EconomyResult<Self> {
        let store = Arc::new(match &config.wal_path {
            Some(path) => LedgerStore::open(path)?,
            None => LedgerStore::in_memory(),
        });
        let source: Arc<dyn ClassifierSource> = Arc::clone(&store) as Arc<dyn ClassifierSource>;
        let classifiers = Arc::new(ClassifierRegistry::new(source));
        config.seed(&classifiers)?;

        let engine = Arc::new(LedgerEngine::new(store, classifiers, clock));
        Self::new(engine, config)
    }

    /// The underlying engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<LedgerEngine> {
        &self.engine
    }

    /// The saga primitives.
    #[must_use]
    pub fn reservations(&self) -> &ReservationCoordinator {
        &self.reservations
    }

    /// A snapshot job over this ledger.
    #[must_use]
    pub fn compactor(&self) -> SnapshotCompactor {
        SnapshotCompactor::new(Arc::clone(self.engine.store()), Arc::clone(self.engine.clock()))
    }

    fn classifiers(&self) -> &ClassifierRegistry {
        self.engine.classifiers()
    }

    /// Lists the non-empty piles of one section.
    ///
    /// Players may only list their own items; other callers name the user.
    ///
    /// # Errors
    ///
    /// `forbidden` for another player's items, `validation_error` for an
    /// unknown section or a missing user.
    pub fn inventory(
        &self,
        caller: Caller,
        user: Option<UserId>,
        section: Option<&str>,
    ) -> Result<InventoryResponse, ApiError> {
        let user = match (caller, user) {
            (Caller::Player(me), None) => me,
            (Caller::Player(me), Some(other)) if other == me => me,
            (Caller::Player(_), Some(_)) => {
                return Err(ApiError::new(ErrorCode::Forbidden, "cannot read another user's items"))
            }
            (_, Some(user)) => user,
            (_, None) => return Err(ApiError::new(ErrorCode::ValidationError, "user is required")),
        };
        let section_code = section.unwrap_or(&self.config.player_section);

        self.inventory_inner(user, section_code)
            .map_err(|e| self.to_api(e))
    }

    fn inventory_inner(&self, user: UserId, section_code: &str) -> EconomyResult<InventoryResponse> {
        let section = self.classifiers().resolve(ClassifierKind::Section, section_code)?;
        let mut items = Vec::new();
        for (stack, quantity) in self.engine.inventory(user, section)? {
            let (collection, quality) = self.variant_codes(stack.variant)?;
            items.push(InventoryEntry {
                item: self.classifiers().code(ClassifierKind::Item, stack.item)?,
                collection,
                quality,
                quantity,
            });
        }
        Ok(InventoryResponse {
            section: section_code.to_string(),
            items,
        })
    }

    /// Writes a batch of signed deltas.
    ///
    /// A request carrying a `correlation_id` that was already committed is
    /// answered with the original ids. No balance may end negative.
    ///
    /// # Errors
    ///
    /// `forbidden` for player callers; `validation_error`,
    /// `insufficient_items` or `conflict` otherwise.
    pub fn add_items(&self, caller: Caller, request: &AddItemsRequest) -> Result<AddItemsResponse, ApiError> {
        if matches!(caller, Caller::Player(_)) {
            return Err(ApiError::new(ErrorCode::Forbidden, "service credentials required"));
        }
        self.add_items_inner(request).map_err(|e| self.to_api(e))
    }

    fn add_items_inner(&self, request: &AddItemsRequest) -> EconomyResult<AddItemsResponse> {
        let section = self.classifiers().resolve(ClassifierKind::Section, &request.section)?;
        let operation_type = self
            .classifiers()
            .resolve(ClassifierKind::OperationType, &request.operation_type)?;
        let deltas = self.deltas(request.user, section, &request.items)?;
        if let Some(id) = &request.correlation_id {
            if id.trim().is_empty() {
                return Err(EconomyError::Validation("correlation_id must not be blank".to_string()));
            }
        }

        let mut meta = OperationMeta::of_type(operation_type)
            .for_recipe(request.recipe)
            .with_comment(request.comment.clone());
        meta.correlation_id.clone_from(&request.correlation_id);

        let outcome = self.engine.transaction(|tx| {
            let replay = meta
                .correlation_id
                .as_ref()
                .is_some_and(|id| tx.batch(&BatchKey::new(id.clone(), operation_type)).is_some());
            if !replay {
                ensure_non_negative(tx, &deltas)?;
            }
            tx.append_batch(&deltas, &meta)
        })?;

        Ok(AddItemsResponse {
            operation_ids: outcome.operation_ids,
            replayed: outcome.replayed,
        })
    }

    /// Admin correction with a mandatory audit reason.
    ///
    /// # Errors
    ///
    /// `forbidden` for non-admin callers, `validation_error` for a short
    /// reason, `insufficient_items` if a balance would go negative.
    pub fn adjust(&self, caller: Caller, request: &AdjustRequest) -> Result<AddItemsResponse, ApiError> {
        if caller != Caller::Admin {
            return Err(ApiError::new(ErrorCode::Forbidden, "admin credentials required"));
        }
        self.adjust_inner(request).map_err(|e| self.to_api(e))
    }

    fn adjust_inner(&self, request: &AdjustRequest) -> EconomyResult<AddItemsResponse> {
        let reason = request.reason.trim();
        if reason.chars().count() < self.config.adjust_min_reason_len {
            return Err(EconomyError::Validation(format!(
                "reason must be at least {} characters",
                self.config.adjust_min_reason_len
            )));
        }
        let section = self.classifiers().resolve(ClassifierKind::Section, &request.section)?;
        let operation_type = self.classifiers().resolve(ClassifierKind::OperationType, OP_ADJUST)?;
        let deltas = self.deltas(request.user, section, &request.items)?;
        let meta = OperationMeta::of_type(operation_type).with_comment(Some(reason.to_string()));

        let outcome = self.engine.transaction(|tx| {
            ensure_non_negative(tx, &deltas)?;
            tx.append_batch(&deltas, &meta)
        })?;

        tracing::info!(
            user = request.user,
            section = %request.section,
            rows = outcome.operation_ids.len(),
            reason,
            "admin adjustment"
        );

        Ok(AddItemsResponse {
            operation_ids: outcome.operation_ids,
            replayed: false,
        })
    }

    /// Moves items into the factory section.
    ///
    /// # Errors
    ///
    /// `forbidden` for non-service callers; `insufficient_items` with the
    /// full shortfall list when the player cannot cover the request.
    pub fn reserve(&self, caller: Caller, request: &ReserveRequest) -> Result<ReservationResponse, ApiError> {
        require_service(caller)?;
        self.amounts(&request.items)
            .and_then(|items| self.reservations.reserve(request.user, &request.correlation_id, &items))
            .and_then(|receipt| self.render_receipt(receipt))
            .map_err(|e| self.to_api(e))
    }

    /// Undoes a reservation.
    ///
    /// # Errors
    ///
    /// `forbidden` for non-service callers or foreign reservations,
    /// `conflict` after consume.
    pub fn return_reserve(&self, caller: Caller, request: &SettleRequest) -> Result<ReservationResponse, ApiError> {
        require_service(caller)?;
        self.expected(request)
            .and_then(|expected| {
                self.reservations
                    .return_reserve(request.user, &request.correlation_id, expected.as_deref())
            })
            .and_then(|receipt| self.render_receipt(receipt))
            .map_err(|e| self.to_api(e))
    }

    /// Destroys reserved items.
    ///
    /// # Errors
    ///
    /// `forbidden` for non-service callers or foreign reservations,
    /// `not_found` for unknown ids, `conflict` after return.
    pub fn consume_reserve(&self, caller: Caller, request: &SettleRequest) -> Result<ReservationResponse, ApiError> {
        require_service(caller)?;
        self.expected(request)
            .and_then(|expected| {
                self.reservations
                    .consume_reserve(request.user, &request.correlation_id, expected.as_deref())
            })
            .and_then(|receipt| self.render_receipt(receipt))
            .map_err(|e| self.to_api(e))
    }

    fn expected(&self, request: &SettleRequest) -> EconomyResult<Option<Vec<ItemAmount>>> {
        request.items.as_deref().map(|items| self.amounts(items)).transpose()
    }

    fn variant(&self, line: &ItemQuantity) -> EconomyResult<ItemVariant> {
        let collection = line.collection.as_deref().unwrap_or(&self.config.default_collection);
        let quality = line.quality.as_deref().unwrap_or(&self.config.default_quality);
        Ok(ItemVariant::new(
            self.classifiers().resolve(ClassifierKind::Collection, collection)?,
            self.classifiers().resolve(ClassifierKind::Quality, quality)?,
        ))
    }

    fn variant_codes(&self, variant: ItemVariant) -> EconomyResult<(String, String)> {
        Ok((
            self.classifiers().code(ClassifierKind::Collection, variant.collection)?,
            self.classifiers().code(ClassifierKind::Quality, variant.quality)?,
        ))
    }

    /// Resolves positive item lines.
    fn amounts(&self, items: &[ItemQuantity]) -> EconomyResult<Vec<ItemAmount>> {
        if items.is_empty() {
            return Err(EconomyError::Validation("items must not be empty".to_string()));
        }
        items
            .iter()
            .map(|line| {
                if line.quantity <= 0 {
                    return Err(EconomyError::Validation(format!(
                        "quantity of {} must be positive",
                        line.item
                    )));
                }
                Ok(ItemAmount::new(
                    self.classifiers().resolve(ClassifierKind::Item, &line.item)?,
                    self.variant(line)?,
                    line.quantity as u64,
                ))
            })
            .collect()
    }

    /// Resolves signed item lines into deltas for one user and section.
    fn deltas(&self, user: UserId, section: SectionId, items: &[ItemQuantity]) -> EconomyResult<Vec<StackDelta>> {
        if items.is_empty() {
            return Err(EconomyError::Validation("items must not be empty".to_string()));
        }
        items
            .iter()
            .map(|line| {
                if line.quantity == 0 {
                    return Err(EconomyError::Validation(format!("delta of {} is zero", line.item)));
                }
                let item = self.classifiers().resolve(ClassifierKind::Item, &line.item)?;
                let stack = ItemStack::new(user, section, item, self.variant(line)?);
                Ok(StackDelta::new(stack, line.quantity))
            })
            .collect()
    }

    fn render_amount(&self, amount: &ItemAmount) -> EconomyResult<ItemQuantity> {
        let (collection, quality) = self.variant_codes(amount.variant)?;
        Ok(ItemQuantity {
            item: self.classifiers().code(ClassifierKind::Item, amount.item)?,
            collection: Some(collection),
            quality: Some(quality),
            quantity: i64::try_from(amount.quantity).map_err(|_| EconomyError::ArithmeticOverflow)?,
        })
    }

    fn render_receipt(&self, receipt: ReservationReceipt) -> EconomyResult<ReservationResponse> {
        let items = receipt
            .items
            .iter()
            .map(|a| self.render_amount(a))
            .collect::<EconomyResult<Vec<_>>>()?;
        Ok(ReservationResponse {
            correlation_id: receipt.correlation_id,
            operation_ids: receipt.operation_ids,
            items,
            replayed: receipt.replayed,
        })
    }

    fn render_missing(&self, missing: &MissingItem) -> MissingItemView {
        let code = |kind, id: u32| self.classifiers().code(kind, id).unwrap_or_else(|_| id.to_string());
        MissingItemView {
            item: code(ClassifierKind::Item, missing.item),
            collection: code(ClassifierKind::Collection, missing.variant.collection),
            quality: code(ClassifierKind::Quality, missing.variant.quality),
            required: missing.required,
            available: missing.available,
        }
    }

    /// Converts an engine error, rendering shortfalls with codes.
    fn to_api(&self, err: EconomyError) -> ApiError {
        match err {
            EconomyError::InsufficientItems(missing) => {
                let items: Vec<MissingItemView> = missing.iter().map(|m| self.render_missing(m)).collect();
                ApiError::insufficient(&items)
            }
            other => {
                if other.error_code() == ErrorCode::InternalError {
                    tracing::error!(error = %other, "ledger request failed");
                }
                ApiError::from(other)
            }
        }
    }
}

fn require_service(caller: Caller) -> Result<(), ApiError> {
    if caller == Caller::Service {
        Ok(())
    } else {
        Err(ApiError::new(ErrorCode::Forbidden, "service credentials required"))
    }
}

/// Rejects a batch that would leave any stack below zero.
fn ensure_non_negative(tx: &LedgerTx<'_>, deltas: &[StackDelta]) -> EconomyResult<()> {
    let mut net: HashMap<ItemStack, i64> = HashMap::new();
    for d in deltas {
        let entry = net.entry(d.stack).or_insert(0);
        *entry = entry.checked_add(d.delta).ok_or(EconomyError::ArithmeticOverflow)?;
    }

    let mut missing = Vec::new();
    for (stack, delta) in net {
        let balance = tx.balance(&stack)?;
        let after = balance.checked_add(delta).ok_or(EconomyError::ArithmeticOverflow)?;
        if after < 0 {
            missing.push(MissingItem {
                item: stack.item,
                variant: stack.variant,
                required: delta.unsigned_abs(),
                available: balance.max(0) as u64,
            });
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        missing.sort_unstable_by_key(|m| (m.item, m.variant));
        Err(EconomyError::InsufficientItems(missing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    fn service() -> LedgerService {
        let mut config = LedgerConfig::default();
        config.classifiers.items = vec!["stone".to_string(), "wood".to_string()];
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap()));
        LedgerService::from_config(config, clock).unwrap()
    }

    fn grant(service: &LedgerService, user: UserId, item: &str, quantity: i64) {
        service
            .add_items(
                Caller::Service,
                &AddItemsRequest {
                    user,
                    section: "main".to_string(),
                    operation_type: "add_items".to_string(),
                    correlation_id: None,
                    comment: None,
                    recipe: None,
                    items: vec![ItemQuantity::plain(item, quantity)],
                },
            )
            .unwrap();
    }

    #[test]
    fn test_player_reads_own_inventory() {
        let svc = service();
        grant(&svc, 5, "stone", 3);
        let inv = svc.inventory(Caller::Player(5), None, None).unwrap();
        assert_eq!(inv.items.len(), 1);
        assert_eq!(inv.items[0].item, "stone");
        assert_eq!(inv.items[0].collection, "base");

        let err = svc.inventory(Caller::Player(6), Some(5), None).unwrap_err();
        assert_eq!(err.error_code, ErrorCode::Forbidden);
    }

    #[test]
    fn test_players_cannot_write() {
        let svc = service();
        let request = ReserveRequest {
            user: 5,
            correlation_id: "x".to_string(),
            items: vec![ItemQuantity::plain("stone", 1)],
        };
        let err = svc.reserve(Caller::Player(5), &request).unwrap_err();
        assert_eq!(err.error_code, ErrorCode::Forbidden);
    }

    #[test]
    fn test_adjust_requires_reason() {
        let svc = service();
        let mut request = AdjustRequest {
            user: 5,
            section: "main".to_string(),
            items: vec![ItemQuantity::plain("wood", 4)],
            reason: "fix".to_string(),
        };
        assert_eq!(
            svc.adjust(Caller::Admin, &request).unwrap_err().error_code,
            ErrorCode::ValidationError
        );
        assert_eq!(
            svc.adjust(Caller::Service, &request).unwrap_err().error_code,
            ErrorCode::Forbidden
        );
        request.reason = "ticket 4411 stuck reservation".to_string();
        assert!(svc.adjust(Caller::Admin, &request).is_ok());
    }

    #[test]
    fn test_add_items_cannot_go_negative() {
        let svc = service();
        grant(&svc, 5, "stone", 3);
        let err = svc
            .add_items(
                Caller::Service,
                &AddItemsRequest {
                    user: 5,
                    section: "main".to_string(),
                    operation_type: "add_items".to_string(),
                    correlation_id: None,
                    comment: None,
                    recipe: None,
                    items: vec![ItemQuantity::plain("stone", -4)],
                },
            )
            .unwrap_err();
        let missing = err.missing_items().unwrap();
        assert_eq!(missing[0].item, "stone");
        assert_eq!(missing[0].available, 3);
    }

    #[test]
    fn test_unknown_item_is_validation_error() {
        let svc = service();
        let request = ReserveRequest {
            user: 5,
            correlation_id: "x".to_string(),
            items: vec![ItemQuantity::plain("mithril", 1)],
        };
        let err = svc.reserve(Caller::Service, &request).unwrap_err();
        assert_eq!(err.error_code, ErrorCode::ValidationError);
    }
}
