//! The config files under `config/` must load and build a working server.

use std::path::PathBuf;
use std::sync::Arc;

use oroboros::{AppState, ServerConfig};
use oroboros_economy::{LedgerConfig, SystemClock};
use oroboros_factory::FactoryConfig;

fn config_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../config")
}

#[test]
fn test_server_config_loads() {
    let config = ServerConfig::load(config_dir().join("server.toml")).unwrap();
    assert!(config.service_token.is_some());
    assert!(config.admin_token.is_some());
    assert_eq!(config.ledger_config, PathBuf::from("config/ledger.toml"));
}

#[test]
fn test_ledger_and_factory_configs_build_services() {
    let mut ledger = LedgerConfig::load(config_dir().join("ledger.toml")).unwrap();
    ledger.wal_path = None;
    let mut factory = FactoryConfig::load(config_dir().join("factory.toml")).unwrap();
    assert!(factory.task_log_path.is_some());
    factory.task_log_path = None;

    let state = AppState::from_configs(
        ledger,
        &factory,
        ServerConfig::default().credentials(),
        Arc::new(SystemClock),
    )
    .unwrap();

    let factory = state.factory();
    let recipes = factory.scheduler().recipes();
    assert!(recipes.by_code("resource_chest_s_open").is_some());
    assert!(recipes.by_code("smelt_ingot").is_some());
}
