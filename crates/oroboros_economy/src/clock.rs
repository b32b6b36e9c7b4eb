//! # Wall Clock
//!
//! Every "now" in the ledger and the scheduler comes from one injected
//! [`Clock`]. Task completion and limit windows are derived from it lazily,
//! so tests move time instead of sleeping.

use chrono::{Duration, NaiveDate, NaiveTime, Utc};
use parking_lot::Mutex;

use crate::item::Timestamp;

/// Source of the current UTC time.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Timestamp;
}

/// The real clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    #[must_use]
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Jumps to an instant.
    pub fn set(&self, now: Timestamp) {
        *self.now.lock() = now;
    }

    /// Moves forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock()
    }
}

/// 00:00 UTC of `date`.
#[inline]
#[must_use]
pub fn start_of_day(date: NaiveDate) -> Timestamp {
    date.and_time(NaiveTime::MIN).and_utc()
}
