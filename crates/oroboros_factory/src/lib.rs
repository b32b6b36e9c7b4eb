//! # OROBOROS Factory
//!
//! The production scheduler: recipes consume items, wait, and yield new
//! items rolled by a weighted lottery.
//!
//! ## Design Principles
//!
//! 1. **Roll once** - Outputs are resolved at start and frozen on the task
//! 2. **Lazy completion** - `completed` is read from the clock, never written by a timer
//! 3. **Saga, not transaction** - Every reservation failure path ends in a compensation
//! 4. **Idempotent by task id** - The task id is the correlation id of every ledger call
//! 5. **External configuration** - Recipes, slots and boosters live in TOML
//!
//! ## Example
//!
//! ```rust,ignore
//! use oroboros_factory::{FactoryConfig, FactoryService, InProcessLedger, ProductionScheduler,
//!     StartRequest};
//!
//! let config = FactoryConfig::load("data/factory.toml")?;
//! let scheduler = ProductionScheduler::new(
//!     &config,
//!     Arc::clone(ledger.engine().classifiers()),
//!     Arc::new(InProcessLedger::new(Arc::clone(&ledger))),
//!     config.task_store()?,
//!     Arc::new(SystemClock),
//! )?;
//! let factory = FactoryService::new(scheduler);
//!
//! let started = factory.start(42, &StartRequest { recipe_id: 1, ..request })?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod api;
pub mod config;
pub mod error;
pub mod gateway;
pub mod limits;
pub mod lottery;
pub mod modifiers;
pub mod recipe;
pub mod saga;
pub mod scheduler;
pub mod service;
pub mod slots;
pub mod store;
pub mod task;
pub mod task_log;

pub use api::{
    CancelRequest, CancelResponse, ClaimRequest, ClaimResponse, CompletedResponse, QueueResponse,
    RecipesResponse, StartRequest, StartResponse, TaskView,
};
pub use config::FactoryConfig;
pub use error::{FactoryError, FactoryResult};
pub use gateway::InProcessLedger;
pub use limits::{LimitBreach, LimitKind, LimitTracker, LimitWindow, RecipeLimit, SeasonCalendar};
pub use lottery::{RecipeEngine, SecureSeed};
pub use modifiers::{ModifierSource, Modifiers, NoModifiers, StaticModifiers};
pub use recipe::{Recipe, RecipeBook, RecipeId};
pub use saga::{GatewayError, LedgerGateway, ReservationHandle, ReservationSaga, RetryPolicy, SagaOutcome};
pub use scheduler::{ProductionScheduler, Queue, StartOrder};
pub use service::FactoryService;
pub use slots::{SlotPolicy, SlotUsage};
pub use store::{MemoryTaskStore, TaskStore};
pub use task::{status, ProductionTask, TaskId, TaskOutputItem, TaskStatus};
pub use task_log::LogTaskStore;
