//! In-process ledger gateway.
//!
//! Both services run in one binary; calls go straight to the
//! [`LedgerService`] with service credentials.

use std::sync::Arc;

use oroboros_economy::api::{
    AddItemsRequest, AddItemsResponse, ReservationResponse, ReserveRequest, SettleRequest,
};
use oroboros_economy::{ApiError, Caller, ErrorCode, LedgerService};

use crate::saga::{GatewayError, LedgerGateway};

/// Calls a ledger living in the same process.
#[derive(Clone, Debug)]
pub struct InProcessLedger {
    service: Arc<LedgerService>,
}

impl InProcessLedger {
    /// Wraps a ledger service.
    #[must_use]
    pub fn new(service: Arc<LedgerService>) -> Self {
        Self { service }
    }

    /// The wrapped service.
    #[must_use]
    pub fn service(&self) -> &Arc<LedgerService> {
        &self.service
    }
}

/// Internal errors carry no verdict on the request, so they count as unanswered.
fn classify(err: ApiError) -> GatewayError {
    if err.error_code == ErrorCode::InternalError {
        GatewayError::Unavailable(err.message)
    } else {
        GatewayError::Rejected(err)
    }
}

impl LedgerGateway for InProcessLedger {
    fn reserve(&self, request: &ReserveRequest) -> Result<ReservationResponse, GatewayError> {
        self.service.reserve(Caller::Service, request).map_err(classify)
    }

    fn return_reserve(&self, request: &SettleRequest) -> Result<ReservationResponse, GatewayError> {
        self.service.return_reserve(Caller::Service, request).map_err(classify)
    }

    fn consume_reserve(&self, request: &SettleRequest) -> Result<ReservationResponse, GatewayError> {
        self.service.consume_reserve(Caller::Service, request).map_err(classify)
    }

    fn add_items(&self, request: &AddItemsRequest) -> Result<AddItemsResponse, GatewayError> {
        self.service.add_items(Caller::Service, request).map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_errors_are_unanswered() {
        let err = classify(ApiError::new(ErrorCode::InternalError, "wal write failed"));
        assert_eq!(err, GatewayError::Unavailable("wal write failed".to_string()));

        let err = classify(ApiError::new(ErrorCode::Conflict, "consumed"));
        assert!(matches!(err, GatewayError::Rejected(_)));
    }
}
