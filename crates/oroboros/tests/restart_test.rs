//! A rebuilt server must pick up the tasks and holds of the previous one.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use oroboros::{AppState, ServerConfig};
use oroboros_economy::api::AddItemsRequest;
use oroboros_economy::{Caller, ItemQuantity, LedgerConfig, ManualClock};
use oroboros_factory::{CancelRequest, FactoryConfig, StartRequest, TaskStatus};

const USER: u64 = 42;

fn config_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../config")
}

fn temp_path(tag: &str) -> PathBuf {
    let id = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("test_restart_{tag}_{id}.log"))
}

struct Deployment {
    ledger: LedgerConfig,
    factory: FactoryConfig,
    clock: Arc<ManualClock>,
}

impl Deployment {
    fn new(task_log: Option<PathBuf>) -> Self {
        let mut ledger = LedgerConfig::load(config_dir().join("ledger.toml")).unwrap();
        ledger.wal_path = Some(temp_path("ledger"));
        let mut factory = FactoryConfig::load(config_dir().join("factory.toml")).unwrap();
        factory.task_log_path = task_log;
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 10, 1, 12, 0, 0).unwrap()));
        Self { ledger, factory, clock }
    }

    fn boot(&self) -> AppState {
        AppState::from_configs(
            self.ledger.clone(),
            &self.factory,
            ServerConfig::default().credentials(),
            self.clock.clone(),
        )
        .unwrap()
    }

    fn held(&self, state: &AppState, section: &str) -> i64 {
        state
            .ledger()
            .inventory(Caller::Admin, Some(USER), Some(section))
            .unwrap()
            .items
            .iter()
            .filter(|e| e.item == "resource_chest_s")
            .map(|e| e.quantity)
            .sum()
    }

    fn cleanup(&self) {
        for path in [self.ledger.wal_path.as_ref(), self.factory.task_log_path.as_ref()]
            .into_iter()
            .flatten()
        {
            std::fs::remove_file(path).ok();
        }
    }
}

fn open_chest(state: &AppState) -> oroboros_factory::StartResponse {
    state
        .ledger()
        .add_items(
            Caller::Service,
            &AddItemsRequest {
                user: USER,
                section: "main".to_string(),
                operation_type: "add_items".to_string(),
                correlation_id: Some("grant-chest".to_string()),
                comment: None,
                recipe: None,
                items: vec![ItemQuantity::plain("resource_chest_s", 1)],
            },
        )
        .unwrap();
    let recipe = state
        .factory()
        .scheduler()
        .recipes()
        .by_code("resource_chest_s_open")
        .unwrap()
        .id;
    state
        .factory()
        .start(
            USER,
            &StartRequest {
                recipe_id: recipe,
                execution_count: 1,
                boosters: Vec::new(),
                input_variants: Vec::new(),
            },
        )
        .unwrap()
}

#[test]
fn test_task_survives_restart_and_can_be_cancelled() {
    let deployment = Deployment::new(Some(temp_path("tasks")));
    let task_id = {
        let state = deployment.boot();
        let started = open_chest(&state);
        assert_eq!(started.status, TaskStatus::InProgress);
        assert_eq!(deployment.held(&state, "factory"), 1);
        started.task_id
    };

    let state = deployment.boot();
    assert_eq!(deployment.held(&state, "factory"), 1);
    let queue = state.factory().queue(USER).unwrap();
    assert_eq!(queue.tasks.len(), 1);
    assert_eq!(queue.tasks[0].task_id, task_id);

    let cancelled = state
        .factory()
        .cancel(USER, &CancelRequest { task_id })
        .unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert_eq!(deployment.held(&state, "factory"), 0);
    assert_eq!(deployment.held(&state, "main"), 1);

    deployment.cleanup();
}

#[test]
fn test_memory_tasks_release_their_holds_on_restart() {
    let deployment = Deployment::new(None);
    {
        let state = deployment.boot();
        open_chest(&state);
        assert_eq!(deployment.held(&state, "main"), 0);
    }

    let state = deployment.boot();
    assert!(state.factory().queue(USER).unwrap().tasks.is_empty());
    assert_eq!(deployment.held(&state, "factory"), 0);
    assert_eq!(deployment.held(&state, "main"), 1);
    assert!(state.ledger().reservations().open_reservations().is_empty());

    deployment.cleanup();
}
