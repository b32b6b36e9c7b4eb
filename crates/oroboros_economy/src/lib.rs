//! # OROBOROS Economy System
//!
//! The item ledger: every player's holdings, derived from an append-only
//! operation log.
//!
//! ## Design Principles
//!
//! 1. **Append-only** - Operations are never mutated or deleted, only countered
//! 2. **Snapshots are checkpoints** - The log is the system of record
//! 3. **Transactional writes** - All rows of one call commit or none do
//! 4. **Idempotent by key** - A batch is unique per (correlation id, operation type)
//! 5. **External configuration** - All service data in TOML files
//!
//! ## Thread Safety
//!
//! All writes serialize on the store lock, so validation done inside a
//! transaction can never be invalidated by a concurrent write.
//!
//! ## Example
//!
//! ```rust,ignore
//! use oroboros_economy::{Caller, LedgerConfig, LedgerService, SystemClock};
//!
//! let config = LedgerConfig::load("data/ledger.toml")?;
//! let ledger = LedgerService::from_config(config, Arc::new(SystemClock))?;
//!
//! let hold = ledger.reserve(Caller::Service, &ReserveRequest {
//!     user: 42,
//!     correlation_id: task_id.to_string(),
//!     items: vec![ItemQuantity::plain("stone", 20)],
//! })?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod api;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod error;
pub mod item;
pub mod ledger;
pub mod operation;
pub mod reservation;
pub mod service;
pub mod snapshot;
pub mod store;
pub mod wal;

pub use api::{ApiError, ErrorCode, ItemQuantity};
pub use classifier::{ClassifierKind, ClassifierRegistry, ClassifierSource, MemoryClassifierSource};
pub use clock::{start_of_day, Clock, ManualClock, SystemClock};
pub use config::LedgerConfig;
pub use error::{EconomyError, EconomyResult};
pub use item::{
    ItemAmount, ItemId, ItemStack, ItemVariant, OperationId, SectionId, StackDelta, Timestamp,
    UserId,
};
pub use ledger::LedgerEngine;
pub use operation::{DailyBalanceSnapshot, LedgerOperation, OperationMeta, ReturnTombstone};
pub use reservation::{ReservationCoordinator, ReservationReceipt};
pub use service::{Caller, LedgerService};
pub use snapshot::{CompactionReport, SnapshotCompactor};
pub use store::{AddOutcome, LedgerStore};
pub use wal::OperationLog;
