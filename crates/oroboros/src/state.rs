//! Shared handler state: both services and the accepted tokens.

use std::sync::Arc;

use oroboros_economy::{Clock, LedgerConfig, LedgerService};
use oroboros_factory::{FactoryConfig, FactoryService, InProcessLedger, ProductionScheduler};

use crate::auth::Credentials;
use crate::config::ServerConfig;
use crate::error::ServerError;

/// Cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    ledger: Arc<LedgerService>,
    factory: Arc<FactoryService>,
    credentials: Arc<Credentials>,
}

impl AppState {
    /// Wraps already-built services.
    #[must_use]
    pub fn new(
        ledger: Arc<LedgerService>,
        factory: Arc<FactoryService>,
        credentials: Credentials,
    ) -> Self {
        Self {
            ledger,
            factory,
            credentials: Arc::new(credentials),
        }
    }

    /// Loads both config files named by the server config.
    ///
    /// # Errors
    ///
    /// Returns an error if a file is missing or invalid, or the operation
    /// log cannot be opened.
    pub fn bootstrap(config: &ServerConfig, clock: Arc<dyn Clock>) -> Result<Self, ServerError> {
        let ledger_config = LedgerConfig::load(&config.ledger_config)?;
        let factory_config = FactoryConfig::load(&config.factory_config)?;
        Self::from_configs(ledger_config, &factory_config, config.credentials(), clock)
    }

    /// Builds the combined deployment: the scheduler reaches the ledger
    /// in-process and both share one classifier registry and clock.
    ///
    /// The scheduler is the only caller of `reserve` here, so an open
    /// reservation whose id is not a stored task is returned before serving.
    ///
    /// # Errors
    ///
    /// Returns an error if either service rejects its configuration or a
    /// log cannot be opened.
    pub fn from_configs(
        ledger_config: LedgerConfig,
        factory_config: &FactoryConfig,
        credentials: Credentials,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ServerError> {
        let ledger = Arc::new(LedgerService::from_config(ledger_config, Arc::clone(&clock))?);
        let scheduler = ProductionScheduler::new(
            factory_config,
            Arc::clone(ledger.engine().classifiers()),
            Arc::new(InProcessLedger::new(Arc::clone(&ledger))),
            factory_config.task_store()?,
            clock,
        )?;

        let holds = ledger.reservations().open_reservations();
        let released = scheduler.release_orphaned(&holds)?;

        tracing::info!(
            recipes = scheduler.recipes().len(),
            operations = ledger.engine().store().read(|v| v.operation_count()),
            open_reservations = holds.len(),
            orphans_released = released.len(),
            "services ready"
        );
        Ok(Self::new(ledger, Arc::new(FactoryService::new(scheduler)), credentials))
    }

    /// The ledger API.
    #[must_use]
    pub fn ledger(&self) -> Arc<LedgerService> {
        Arc::clone(&self.ledger)
    }

    /// The scheduler API.
    #[must_use]
    pub fn factory(&self) -> Arc<FactoryService> {
        Arc::clone(&self.factory)
    }

    /// Accepted tokens.
    #[must_use]
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }
}
