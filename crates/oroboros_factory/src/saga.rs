//! # Reservation Saga
//!
//! The scheduler and the ledger share no transaction. Every start is a
//! saga over one [`ReservationHandle`]:
//!
//! ```text
//! reserve ──ok──> local step ──ok──> Committed
//!    │                 │
//!    │ unknown         └──err──> return_reserve ──ok──> Compensated
//!    └──────────────────────────>        │
//!                                        └──err──> Failed (needs reconciliation)
//! ```
//!
//! Every ledger call is keyed by the handle's correlation id, so a call
//! whose answer was lost is simply sent again.

use std::thread;
use std::time::Duration;

use oroboros_economy::api::{
    AddItemsRequest, AddItemsResponse, ItemQuantity, ReservationResponse, ReserveRequest,
    SettleRequest,
};
use oroboros_economy::{ApiError, UserId};
use thiserror::Error;

use crate::error::{FactoryError, FactoryResult};

/// Outcome of one ledger call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// The ledger answered and said no.
    #[error("rejected: {0}")]
    Rejected(ApiError),
    /// No confirmed answer; the call may or may not have been applied.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// The ledger as seen from the scheduler.
///
/// Implementations must be idempotent per correlation id; the saga relies
/// on it to retry.
pub trait LedgerGateway: Send + Sync {
    /// Moves items into the factory area.
    ///
    /// # Errors
    ///
    /// `Rejected` with `insufficient_items` when the user is short.
    fn reserve(&self, request: &ReserveRequest) -> Result<ReservationResponse, GatewayError>;

    /// Undoes a reservation.
    ///
    /// # Errors
    ///
    /// `Rejected` with `conflict` once the reservation was consumed.
    fn return_reserve(&self, request: &SettleRequest) -> Result<ReservationResponse, GatewayError>;

    /// Destroys reserved items.
    ///
    /// # Errors
    ///
    /// `Rejected` with `conflict` once the reservation was returned.
    fn consume_reserve(&self, request: &SettleRequest) -> Result<ReservationResponse, GatewayError>;

    /// Credits items.
    ///
    /// # Errors
    ///
    /// `Rejected` for unknown codes or a conflicting replay.
    fn add_items(&self, request: &AddItemsRequest) -> Result<AddItemsResponse, GatewayError>;
}

/// How often an unanswered call is repeated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first one included.
    pub attempts: u32,
    /// Pause before the n-th retry is `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// A policy without pauses.
    #[must_use]
    pub const fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            backoff: Duration::ZERO,
        }
    }

    /// Runs `call` until it gets a confirmed answer or the budget is spent.
    ///
    /// # Errors
    ///
    /// `Ledger` for a rejection, `LedgerUnavailable` when every attempt went
    /// unanswered.
    pub fn run<T>(
        &self,
        what: &str,
        correlation_id: &str,
        mut call: impl FnMut() -> Result<T, GatewayError>,
    ) -> FactoryResult<T> {
        let attempts = self.attempts.max(1);
        let mut last = String::new();
        for attempt in 1..=attempts {
            match call() {
                Ok(value) => return Ok(value),
                Err(GatewayError::Rejected(api)) => return Err(FactoryError::Ledger(api)),
                Err(GatewayError::Unavailable(reason)) => {
                    tracing::warn!(what, correlation_id, attempt, %reason, "ledger call unanswered");
                    last = reason;
                    if attempt < attempts && !self.backoff.is_zero() {
                        thread::sleep(self.backoff * attempt);
                    }
                }
            }
        }
        Err(FactoryError::LedgerUnavailable(format!(
            "{what} {correlation_id}: {last}"
        )))
    }
}

/// Typed handle of one reservation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReservationHandle {
    /// Owner.
    pub user: UserId,
    /// Idempotency key, equal to the task id.
    pub correlation_id: String,
    /// Items held, in wire form.
    pub items: Vec<ItemQuantity>,
}

impl ReservationHandle {
    fn reserve_request(&self) -> ReserveRequest {
        ReserveRequest {
            user: self.user,
            correlation_id: self.correlation_id.clone(),
            items: self.items.clone(),
        }
    }

    fn settle_request(&self) -> SettleRequest {
        SettleRequest {
            user: self.user,
            correlation_id: self.correlation_id.clone(),
            items: Some(self.items.clone()),
        }
    }
}

/// Result of a saga.
#[derive(Debug, Clone, PartialEq)]
pub enum SagaOutcome<T> {
    /// Every step succeeded; the reservation stays in place.
    Committed(T),
    /// A step failed and nothing remains reserved.
    Compensated(FactoryError),
    /// A step failed and the compensation could not be confirmed either.
    Failed {
        /// Original failure.
        error: FactoryError,
        /// Why the compensation did not go through.
        compensation: FactoryError,
    },
}

/// Runs sagas against a ledger gateway.
pub struct ReservationSaga<'a> {
    gateway: &'a dyn LedgerGateway,
    retry: RetryPolicy,
}

impl<'a> ReservationSaga<'a> {
    /// Creates a saga runner.
    #[must_use]
    pub fn new(gateway: &'a dyn LedgerGateway, retry: RetryPolicy) -> Self {
        Self { gateway, retry }
    }

    /// Reserves the handle's items, then runs `step`.
    ///
    /// Any failure after the reservation may have been applied is paired
    /// with a `return_reserve`. A confirmed rejection of the reserve itself
    /// needs none.
    pub fn start<T>(
        &self,
        handle: &ReservationHandle,
        step: impl FnOnce() -> FactoryResult<T>,
    ) -> SagaOutcome<T> {
        let request = handle.reserve_request();
        let reserved = self.retry.run("reserve", &handle.correlation_id, || {
            self.gateway.reserve(&request)
        });
        let error = match reserved {
            Ok(_) => match step() {
                Ok(value) => return SagaOutcome::Committed(value),
                Err(err) => err,
            },
            Err(err @ FactoryError::Ledger(_)) => return SagaOutcome::Compensated(err),
            Err(err) => err,
        };

        match self.compensate(handle) {
            Ok(_) => {
                tracing::warn!(
                    user = handle.user,
                    correlation_id = %handle.correlation_id,
                    error = %error,
                    "saga compensated"
                );
                SagaOutcome::Compensated(error)
            }
            Err(compensation) => {
                tracing::error!(
                    user = handle.user,
                    correlation_id = %handle.correlation_id,
                    error = %error,
                    compensation = %compensation,
                    "saga compensation failed, reservation needs reconciliation"
                );
                SagaOutcome::Failed { error, compensation }
            }
        }
    }

    /// Undoes the reservation.
    ///
    /// # Errors
    ///
    /// Returns the ledger's rejection or `LedgerUnavailable`.
    pub fn compensate(&self, handle: &ReservationHandle) -> FactoryResult<ReservationResponse> {
        let request = handle.settle_request();
        self.retry.run("return_reserve", &handle.correlation_id, || {
            self.gateway.return_reserve(&request)
        })
    }

    /// Returns a reservation known only by its key, whatever it holds.
    ///
    /// # Errors
    ///
    /// Returns the ledger's rejection or `LedgerUnavailable`.
    pub fn release(&self, user: UserId, correlation_id: &str) -> FactoryResult<ReservationResponse> {
        let request = SettleRequest {
            user,
            correlation_id: correlation_id.to_string(),
            items: None,
        };
        self.retry.run("return_reserve", correlation_id, || {
            self.gateway.return_reserve(&request)
        })
    }

    /// Destroys the reserved items.
    ///
    /// # Errors
    ///
    /// Returns the ledger's rejection or `LedgerUnavailable`.
    pub fn consume(&self, handle: &ReservationHandle) -> FactoryResult<ReservationResponse> {
        let request = handle.settle_request();
        self.retry.run("consume_reserve", &handle.correlation_id, || {
            self.gateway.consume_reserve(&request)
        })
    }

    /// Credits a reward.
    ///
    /// # Errors
    ///
    /// Returns the ledger's rejection or `LedgerUnavailable`.
    pub fn grant(&self, request: &AddItemsRequest) -> FactoryResult<AddItemsResponse> {
        let key = request.correlation_id.as_deref().unwrap_or_default();
        self.retry.run("add_items", key, || self.gateway.add_items(request))
    }
}
