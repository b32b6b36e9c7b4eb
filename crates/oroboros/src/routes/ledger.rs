//! # Ledger API
//!
//! Internal, service-to-service. Players may only read their own
//! inventory; writes need the service token, `adjust` the admin token.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use oroboros_economy::api::{
    AddItemsRequest, AddItemsResponse, AdjustRequest, InventoryResponse, ReservationResponse,
    ReserveRequest, SettleRequest,
};
use oroboros_economy::UserId;
use serde::Deserialize;

use super::blocking;
use crate::error::HttpError;
use crate::state::AppState;

/// Routes of the ledger API.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/inventory", get(inventory))
        .route("/add-items", post(add_items))
        .route("/adjust", post(adjust))
        .route("/reserve", post(reserve))
        .route("/return-reserve", post(return_reserve))
        .route("/consume-reserve", post(consume_reserve))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct InventoryQuery {
    section: Option<String>,
    user: Option<UserId>,
}

pub(crate) async fn inventory(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<InventoryQuery>, QueryRejection>,
) -> Result<Json<InventoryResponse>, HttpError> {
    let caller = state.credentials().caller(&headers)?;
    let Query(query) = query?;
    let ledger = state.ledger();
    blocking(move || ledger.inventory(caller, query.user, query.section.as_deref())).await
}

pub(crate) async fn add_items(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<AddItemsRequest>, JsonRejection>,
) -> Result<Json<AddItemsResponse>, HttpError> {
    let caller = state.credentials().caller(&headers)?;
    let Json(request) = body?;
    let ledger = state.ledger();
    blocking(move || ledger.add_items(caller, &request)).await
}

pub(crate) async fn adjust(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<AdjustRequest>, JsonRejection>,
) -> Result<Json<AddItemsResponse>, HttpError> {
    let caller = state.credentials().caller(&headers)?;
    let Json(request) = body?;
    let ledger = state.ledger();
    blocking(move || ledger.adjust(caller, &request)).await
}

pub(crate) async fn reserve(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ReserveRequest>, JsonRejection>,
) -> Result<Json<ReservationResponse>, HttpError> {
    let caller = state.credentials().caller(&headers)?;
    let Json(request) = body?;
    let ledger = state.ledger();
    blocking(move || ledger.reserve(caller, &request)).await
}

pub(crate) async fn return_reserve(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<SettleRequest>, JsonRejection>,
) -> Result<Json<ReservationResponse>, HttpError> {
    let caller = state.credentials().caller(&headers)?;
    let Json(request) = body?;
    let ledger = state.ledger();
    blocking(move || ledger.return_reserve(caller, &request)).await
}

pub(crate) async fn consume_reserve(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<SettleRequest>, JsonRejection>,
) -> Result<Json<ReservationResponse>, HttpError> {
    let caller = state.credentials().caller(&headers)?;
    let Json(request) = body?;
    let ledger = state.ledger();
    blocking(move || ledger.consume_reserve(caller, &request)).await
}
