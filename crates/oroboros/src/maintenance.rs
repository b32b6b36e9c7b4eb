//! # Maintenance Job
//!
//! Runs on a fixed period next to the HTTP server:
//!
//! 1. **Reconcile** - `pending` tasks older than the threshold are compensated
//! 2. **Compact** - today's 00:00 UTC balances are checkpointed (idempotent)

use std::time::Duration;

use oroboros_economy::CompactionReport;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::state::AppState;

/// What one pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Pending tasks moved to `failed`.
    pub reconciled: usize,
    /// Snapshot pass, if it succeeded.
    pub compaction: Option<CompactionReport>,
}

/// One synchronous pass. Failures are logged, never propagated: the next
/// tick retries.
pub fn run_once(state: &AppState, reconcile_after: chrono::Duration) -> MaintenanceReport {
    let mut report = MaintenanceReport::default();

    match state.factory().scheduler().reconcile_pending(reconcile_after) {
        Ok(tasks) => {
            report.reconciled = tasks.len();
            if !tasks.is_empty() {
                tracing::warn!(count = tasks.len(), "reconciled stale pending tasks");
            }
        }
        Err(e) => tracing::error!(error = %e, "pending task reconciliation failed"),
    }

    match state.ledger().compactor().compact_today() {
        Ok(compaction) => {
            tracing::debug!(
                date = %compaction.date,
                stacks = compaction.stacks,
                written = compaction.written,
                "daily snapshot"
            );
            report.compaction = Some(compaction);
        }
        Err(e) => tracing::error!(error = %e, "snapshot compaction failed"),
    }

    report
}

/// Starts the periodic job on the runtime.
pub fn spawn(state: AppState, every: Duration, reconcile_after: chrono::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let state = state.clone();
            if let Err(e) =
                tokio::task::spawn_blocking(move || run_once(&state, reconcile_after)).await
            {
                tracing::error!(error = %e, "maintenance pass panicked");
            }
        }
    })
}
