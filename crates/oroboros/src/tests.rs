use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::Json;
use chrono::{Duration, TimeZone, Utc};
use oroboros_economy::api::{AddItemsRequest, AdjustRequest, ReserveRequest};
use oroboros_economy::{ErrorCode, ItemQuantity, LedgerConfig, ManualClock};
use oroboros_factory::{CancelRequest, FactoryConfig, StartRequest, TaskStatus};

use super::*;
use crate::auth::{ADMIN_TOKEN_HEADER, SERVICE_TOKEN_HEADER, USER_HEADER};
use crate::routes::{factory, ledger};

const USER: u64 = 7;

const FACTORY: &str = r#"
    reward_secret = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff"
    ledger_retry_backoff_ms = 0

    [slots]
    universal = 2

    [[recipe]]
    code = "smelt_ingot"
    operation_class = "crafting"
    duration_secs = 30

    [[recipe.input]]
    item = "ore"
    quantity = 3

    [[recipe.output_group]]
    [[recipe.output_group.rule]]
    item = "ingot"
    min = 4
    max = 4
    probability = 100
"#;

struct Harness {
    clock: Arc<ManualClock>,
    state: AppState,
}

fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 9, 2, 10, 0, 0).unwrap()));
    let mut ledger_config = LedgerConfig::default();
    ledger_config.classifiers.items = vec!["ore".to_string(), "ingot".to_string()];
    let state = AppState::from_configs(
        ledger_config,
        &FactoryConfig::from_toml_str(FACTORY).unwrap(),
        Credentials {
            service_token: Some("svc-token".to_string()),
            admin_token: Some("admin-token".to_string()),
        },
        clock.clone(),
    )
    .unwrap();
    Harness { clock, state }
}

fn headers(name: &'static str, value: &'static str) -> HeaderMap {
    let mut map = HeaderMap::new();
    map.insert(name, HeaderValue::from_static(value));
    map
}

fn player() -> HeaderMap {
    headers(USER_HEADER, "7")
}

fn service() -> HeaderMap {
    headers(SERVICE_TOKEN_HEADER, "svc-token")
}

fn grant_request(quantity: i64) -> AddItemsRequest {
    AddItemsRequest {
        user: USER,
        section: "main".to_string(),
        operation_type: "add_items".to_string(),
        correlation_id: None,
        comment: None,
        recipe: None,
        items: vec![ItemQuantity::plain("ore", quantity)],
    }
}

async fn held(state: &AppState, item: &str) -> i64 {
    let Json(inventory) = ledger::inventory(
        State(state.clone()),
        player(),
        Ok(Query(ledger::InventoryQuery::default())),
    )
    .await
    .unwrap();
    inventory
        .items
        .iter()
        .filter(|e| e.item == item)
        .map(|e| e.quantity)
        .sum()
}

#[test]
fn test_router_builds() {
    let _ = router(harness().state);
}

#[tokio::test]
async fn test_service_grant_then_player_reads_inventory() {
    let h = harness();
    let Json(granted) = ledger::add_items(State(h.state.clone()), service(), Ok(Json(grant_request(9))))
        .await
        .unwrap();
    assert_eq!(granted.operation_ids.len(), 1);
    assert_eq!(held(&h.state, "ore").await, 9);
}

#[tokio::test]
async fn test_player_cannot_write_ledger() {
    let h = harness();
    let err = ledger::add_items(State(h.state.clone()), player(), Ok(Json(grant_request(9))))
        .await
        .unwrap_err();
    assert_eq!(err.status(), StatusCode::FORBIDDEN);

    let err = ledger::reserve(
        State(h.state.clone()),
        player(),
        Ok(Json(ReserveRequest {
            user: USER,
            correlation_id: "r-1".to_string(),
            items: vec![ItemQuantity::plain("ore", 1)],
        })),
    )
    .await
    .unwrap_err();
    assert_eq!(err.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_adjust_needs_admin_and_reason() {
    let h = harness();
    let request = AdjustRequest {
        user: USER,
        section: "main".to_string(),
        items: vec![ItemQuantity::plain("ore", 2)],
        reason: "short".to_string(),
    };

    let err = ledger::adjust(State(h.state.clone()), service(), Ok(Json(request.clone())))
        .await
        .unwrap_err();
    assert_eq!(err.status(), StatusCode::FORBIDDEN);

    let admin = headers(ADMIN_TOKEN_HEADER, "admin-token");
    let err = ledger::adjust(State(h.state.clone()), admin.clone(), Ok(Json(request.clone())))
        .await
        .unwrap_err();
    assert_eq!(err.status(), StatusCode::BAD_REQUEST);

    let request = AdjustRequest {
        reason: "support ticket 1182: lost ore".to_string(),
        ..request
    };
    let _ = ledger::adjust(State(h.state.clone()), admin, Ok(Json(request)))
        .await
        .unwrap();
    assert_eq!(held(&h.state, "ore").await, 2);
}

#[tokio::test]
async fn test_factory_requires_user_header() {
    let h = harness();
    let err = factory::queue(State(h.state.clone()), HeaderMap::new())
        .await
        .unwrap_err();
    assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_start_wait_claim() {
    let h = harness();
    let _ = ledger::add_items(State(h.state.clone()), service(), Ok(Json(grant_request(3))))
        .await
        .unwrap();

    let start = StartRequest {
        recipe_id: 1,
        execution_count: 1,
        boosters: Vec::new(),
        input_variants: Vec::new(),
    };
    let Json(started) = factory::start(State(h.state.clone()), player(), Ok(Json(start)))
        .await
        .unwrap();
    assert_eq!(started.status, TaskStatus::InProgress);
    assert_eq!(held(&h.state, "ore").await, 0);

    let Json(queue) = factory::queue(State(h.state.clone()), player()).await.unwrap();
    assert_eq!(queue.tasks.len(), 1);

    let Json(view) = factory::task(
        State(h.state.clone()),
        player(),
        Path(started.task_id.to_string()),
    )
    .await
    .unwrap();
    assert!(view.outputs.is_none());

    h.clock.advance(Duration::seconds(30));
    let Json(completed) = factory::completed(State(h.state.clone()), player()).await.unwrap();
    assert_eq!(completed.tasks.len(), 1);

    let Json(claimed) = factory::claim(State(h.state.clone()), player(), Bytes::new())
        .await
        .unwrap();
    assert_eq!(claimed.tasks.len(), 1);
    assert_eq!(claimed.tasks[0].items[0].quantity, 4);
    assert_eq!(held(&h.state, "ingot").await, 4);
}

#[tokio::test]
async fn test_insufficient_items_carry_details() {
    let h = harness();
    let start = StartRequest {
        recipe_id: 1,
        execution_count: 2,
        boosters: Vec::new(),
        input_variants: Vec::new(),
    };
    let err = factory::start(State(h.state.clone()), player(), Ok(Json(start)))
        .await
        .unwrap_err();
    assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let missing = err.error().missing_items().unwrap();
    assert_eq!(missing[0].item, "ore");
    assert_eq!(missing[0].required, 6);
    assert_eq!(missing[0].available, 0);
}

#[tokio::test]
async fn test_cancel_returns_inputs() {
    let h = harness();
    let _ = ledger::add_items(State(h.state.clone()), service(), Ok(Json(grant_request(3))))
        .await
        .unwrap();
    let start = StartRequest {
        recipe_id: 1,
        execution_count: 1,
        boosters: Vec::new(),
        input_variants: Vec::new(),
    };
    let Json(started) = factory::start(State(h.state.clone()), player(), Ok(Json(start)))
        .await
        .unwrap();

    let Json(cancelled) = factory::cancel(
        State(h.state.clone()),
        player(),
        Ok(Json(CancelRequest {
            task_id: started.task_id,
        })),
    )
    .await
    .unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert_eq!(held(&h.state, "ore").await, 3);
}

#[tokio::test]
async fn test_malformed_claim_body() {
    let h = harness();
    let err = factory::claim(State(h.state.clone()), player(), Bytes::from_static(b"{oops"))
        .await
        .unwrap_err();
    assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    assert_eq!(err.error().error_code, ErrorCode::ValidationError);
}

#[tokio::test]
async fn test_maintenance_pass() {
    let h = harness();
    let _ = ledger::add_items(State(h.state.clone()), service(), Ok(Json(grant_request(5))))
        .await
        .unwrap();
    let state = h.state.clone();
    let report = tokio::task::spawn_blocking(move || {
        maintenance::run_once(&state, Duration::minutes(5))
    })
    .await
    .unwrap();
    assert_eq!(report.reconciled, 0);
    assert!(report.compaction.is_some());
}
