//! # Scheduler API
//!
//! User-facing; every route acts for the `x-user-id` of the request.

use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use oroboros_factory::api::{
    CancelRequest, CancelResponse, ClaimRequest, ClaimResponse, CompletedResponse, QueueResponse,
    RecipesResponse, StartRequest, StartResponse, TaskView,
};
use oroboros_factory::TaskId;
use serde::Deserialize;

use super::blocking;
use crate::error::HttpError;
use crate::state::AppState;

/// Routes of the scheduler API.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/recipes", get(recipes))
        .route("/factory/start", post(start))
        .route("/factory/queue", get(queue))
        .route("/factory/completed", get(completed))
        .route("/factory/tasks/{task_id}", get(task))
        .route("/factory/claim", post(claim))
        .route("/factory/cancel", post(cancel))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RecipesQuery {
    operation_class: Option<String>,
}

pub(crate) async fn recipes(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<RecipesQuery>, QueryRejection>,
) -> Result<Json<RecipesResponse>, HttpError> {
    let user = state.credentials().player(&headers)?;
    let Query(query) = query?;
    let factory = state.factory();
    blocking(move || factory.recipes(user, query.operation_class.as_deref())).await
}

pub(crate) async fn start(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<StartRequest>, JsonRejection>,
) -> Result<Json<StartResponse>, HttpError> {
    let user = state.credentials().player(&headers)?;
    let Json(request) = body?;
    let factory = state.factory();
    blocking(move || factory.start(user, &request)).await
}

pub(crate) async fn queue(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<QueueResponse>, HttpError> {
    let user = state.credentials().player(&headers)?;
    let factory = state.factory();
    blocking(move || factory.queue(user)).await
}

pub(crate) async fn completed(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CompletedResponse>, HttpError> {
    let user = state.credentials().player(&headers)?;
    let factory = state.factory();
    blocking(move || factory.completed(user)).await
}

pub(crate) async fn task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<Json<TaskView>, HttpError> {
    let user = state.credentials().player(&headers)?;
    let id = TaskId::new(task_id);
    let factory = state.factory();
    blocking(move || factory.task(user, &id)).await
}

/// The body is optional: an empty body claims every completed task.
pub(crate) async fn claim(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ClaimResponse>, HttpError> {
    let user = state.credentials().player(&headers)?;
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        ClaimRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| HttpError::bad_request(e.to_string()))?
    };
    let factory = state.factory();
    blocking(move || factory.claim(user, &request)).await
}

pub(crate) async fn cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CancelRequest>, JsonRejection>,
) -> Result<Json<CancelResponse>, HttpError> {
    let user = state.credentials().player(&headers)?;
    let Json(request) = body?;
    let factory = state.factory();
    blocking(move || factory.cancel(user, &request)).await
}
