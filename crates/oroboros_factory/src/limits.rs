//! # Limit Tracker
//!
//! Usage caps per user per recipe. Windows are computed from the wall
//! clock, not from first use:
//!
//! | window | start | reset |
//! |--------|-------|-------|
//! | total | - | never |
//! | daily | 00:00 UTC today | next 00:00 UTC |
//! | weekly | Monday 00:00 UTC of the ISO week | next Monday |
//! | seasonal | latest season start | next season start |
//!
//! Usage is counted from the user's tasks created inside the window that
//! were not cancelled or failed, so aborted tasks never consume quota.

use std::fmt;

use chrono::{Datelike, Duration, NaiveDate};
use oroboros_economy::{start_of_day, ItemId, Timestamp};
use serde::{Deserialize, Serialize};

use crate::error::{FactoryError, FactoryResult};
use crate::recipe::Recipe;
use crate::task::{ProductionTask, TaskOutputItem};

/// What a limit counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    /// Recipe executions.
    Executions,
    /// Rolled reward quantity.
    RewardQuantity,
}

impl LimitKind {
    /// Wire spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Executions => "executions",
            Self::RewardQuantity => "reward_quantity",
        }
    }
}

/// Counting window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitWindow {
    /// Since the beginning of time.
    Total,
    /// Current UTC calendar day.
    Daily,
    /// Current ISO week.
    Weekly,
    /// Current season.
    Seasonal,
}

impl LimitWindow {
    /// Wire spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Total => "total",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Seasonal => "seasonal",
        }
    }
}

/// A cap on one recipe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecipeLimit {
    /// What is counted.
    pub kind: LimitKind,
    /// Over which window.
    pub window: LimitWindow,
    /// Cap.
    pub max: u64,
    /// For reward limits: only this item counts.
    pub item: Option<ItemId>,
}

/// A rejected start, with everything a client needs to show.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitBreach {
    /// `executions` or `reward_quantity`.
    pub limit_type: LimitKind,
    /// Window the cap applies to.
    pub window: LimitWindow,
    /// Usage already counted.
    pub current: u64,
    /// Cap.
    pub max: u64,
    /// When the window rolls over; `None` for total limits.
    pub reset_time: Option<Timestamp>,
}

impl fmt::Display for LimitBreach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} limit reached ({}/{})",
            self.window.as_str(),
            self.limit_type.as_str(),
            self.current,
            self.max
        )
    }
}

/// Current usage against one limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LimitUsage {
    /// The limit.
    pub limit: RecipeLimit,
    /// Counted usage.
    pub used: u64,
    /// Next reset.
    pub reset_time: Option<Timestamp>,
}

/// Start and end of the active window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowBounds {
    /// Inclusive start; unbounded when `None`.
    pub start: Option<Timestamp>,
    /// Exclusive end, i.e. the reset time; unbounded when `None`.
    pub reset: Option<Timestamp>,
}

impl WindowBounds {
    fn contains(&self, at: Timestamp) -> bool {
        self.start.map_or(true, |s| at >= s) && self.reset.map_or(true, |r| at < r)
    }
}

/// Season start dates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SeasonCalendar {
    starts: Vec<NaiveDate>,
}

impl SeasonCalendar {
    /// Builds a calendar; dates are sorted and deduplicated.
    #[must_use]
    pub fn new(mut starts: Vec<NaiveDate>) -> Self {
        starts.sort_unstable();
        starts.dedup();
        Self { starts }
    }

    /// The season containing `now`.
    #[must_use]
    pub fn bounds(&self, now: Timestamp) -> WindowBounds {
        let today = now.date_naive();
        let next = self.starts.partition_point(|d| *d <= today);
        WindowBounds {
            start: next.checked_sub(1).map(|i| start_of_day(self.starts[i])),
            reset: self.starts.get(next).map(|d| start_of_day(*d)),
        }
    }
}

/// Computes windows and enforces caps.
#[derive(Clone, Debug, Default)]
pub struct LimitTracker {
    seasons: SeasonCalendar,
}

impl LimitTracker {
    /// Creates a tracker.
    #[must_use]
    pub const fn new(seasons: SeasonCalendar) -> Self {
        Self { seasons }
    }

    /// The active window at `now`.
    #[must_use]
    pub fn window(&self, window: LimitWindow, now: Timestamp) -> WindowBounds {
        match window {
            LimitWindow::Total => WindowBounds {
                start: None,
                reset: None,
            },
            LimitWindow::Daily => {
                let start = start_of_day(now.date_naive());
                WindowBounds {
                    start: Some(start),
                    reset: Some(start + Duration::days(1)),
                }
            }
            LimitWindow::Weekly => {
                let today = now.date_naive();
                let monday = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
                let start = start_of_day(monday);
                WindowBounds {
                    start: Some(start),
                    reset: Some(start + Duration::weeks(1)),
                }
            }
            LimitWindow::Seasonal => self.seasons.bounds(now),
        }
    }

    fn counted<'a>(
        recipe: &'a Recipe,
        tasks: &'a [ProductionTask],
        bounds: WindowBounds,
    ) -> impl Iterator<Item = &'a ProductionTask> + 'a {
        tasks.iter().filter(move |t| {
            t.recipe == recipe.id && !t.status.is_aborted() && bounds.contains(t.created_at)
        })
    }

    fn used(limit: &RecipeLimit, recipe: &Recipe, tasks: &[ProductionTask], bounds: WindowBounds) -> u64 {
        let counted = Self::counted(recipe, tasks, bounds);
        match limit.kind {
            LimitKind::Executions => counted.map(|t| u64::from(t.execution_count)).sum(),
            LimitKind::RewardQuantity => counted.map(|t| rolled_quantity(limit, &t.outputs)).sum(),
        }
    }

    /// Usage of every limit of `recipe`, given one user's tasks.
    #[must_use]
    pub fn usage(&self, recipe: &Recipe, tasks: &[ProductionTask], now: Timestamp) -> Vec<LimitUsage> {
        recipe
            .limits
            .iter()
            .map(|limit| {
                let bounds = self.window(limit.window, now);
                LimitUsage {
                    limit: *limit,
                    used: Self::used(limit, recipe, tasks, bounds),
                    reset_time: bounds.reset,
                }
            })
            .collect()
    }

    /// Checks a start before anything is reserved.
    ///
    /// Execution limits reject when `used + executions > max`; reward limits
    /// reject once `used >= max`, since the roll is not known yet.
    ///
    /// # Errors
    ///
    /// Returns `LimitExceeded` for the first breached limit.
    pub fn check_before_start(
        &self,
        recipe: &Recipe,
        tasks: &[ProductionTask],
        now: Timestamp,
        executions: u32,
    ) -> FactoryResult<()> {
        for usage in self.usage(recipe, tasks, now) {
            let breached = match usage.limit.kind {
                LimitKind::Executions => usage.used.saturating_add(u64::from(executions)) > usage.limit.max,
                LimitKind::RewardQuantity => usage.used >= usage.limit.max,
            };
            if breached {
                return Err(breach(&usage));
            }
        }
        Ok(())
    }

    /// Checks the rolled reward against reward limits.
    ///
    /// `tasks` must not contain the task being started.
    ///
    /// # Errors
    ///
    /// Returns `LimitExceeded` when `used + rolled > max`.
    pub fn check_rolled(
        &self,
        recipe: &Recipe,
        tasks: &[ProductionTask],
        now: Timestamp,
        outputs: &[TaskOutputItem],
    ) -> FactoryResult<()> {
        for usage in self.usage(recipe, tasks, now) {
            if usage.limit.kind != LimitKind::RewardQuantity {
                continue;
            }
            let rolled = rolled_quantity(&usage.limit, outputs);
            if usage.used.saturating_add(rolled) > usage.limit.max {
                return Err(breach(&usage));
            }
        }
        Ok(())
    }
}

fn rolled_quantity(limit: &RecipeLimit, outputs: &[TaskOutputItem]) -> u64 {
    outputs
        .iter()
        .filter(|o| limit.item.map_or(true, |item| o.item == item))
        .map(|o| o.quantity)
        .sum()
}

fn breach(usage: &LimitUsage) -> FactoryError {
    FactoryError::LimitExceeded(LimitBreach {
        limit_type: usage.limit.kind,
        window: usage.limit.window,
        current: usage.used,
        max: usage.limit.max,
        reset_time: usage.reset_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskId, TaskStatus};
    use chrono::{TimeZone, Utc};
    use oroboros_economy::ItemVariant;

    fn recipe(limits: Vec<RecipeLimit>) -> Recipe {
        Recipe {
            id: 1,
            code: "r".to_string(),
            operation_class: "crafting".to_string(),
            duration: Duration::seconds(10),
            active: true,
            inputs: Vec::new(),
            output_groups: Vec::new(),
            limits,
        }
    }

    fn task(created_at: Timestamp, status: TaskStatus) -> ProductionTask {
        let mut task = ProductionTask::pending(TaskId::generate(), 1, 1, "crafting", 1, created_at);
        task.status = status;
        task
    }

    fn daily(max: u64) -> RecipeLimit {
        RecipeLimit {
            kind: LimitKind::Executions,
            window: LimitWindow::Daily,
            max,
            item: None,
        }
    }

    #[test]
    fn test_daily_window_resets_at_midnight() {
        let tracker = LimitTracker::default();
        let now = Utc.with_ymd_and_hms(2024, 3, 14, 22, 30, 0).unwrap();
        let bounds = tracker.window(LimitWindow::Daily, now);
        assert_eq!(bounds.start, Some(Utc.with_ymd_and_hms(2024, 3, 14, 0, 0, 0).unwrap()));
        assert_eq!(bounds.reset, Some(Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap()));
    }

    #[test]
    fn test_weekly_window_is_iso_week() {
        let tracker = LimitTracker::default();
        // Sunday
        let now = Utc.with_ymd_and_hms(2024, 3, 17, 12, 0, 0).unwrap();
        let bounds = tracker.window(LimitWindow::Weekly, now);
        assert_eq!(bounds.start, Some(Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap()));
        assert_eq!(bounds.reset, Some(Utc.with_ymd_and_hms(2024, 3, 18, 0, 0, 0).unwrap()));
    }

    #[test]
    fn test_seasonal_window() {
        let d = |m, day| NaiveDate::from_ymd_opt(2024, m, day).unwrap();
        let tracker = LimitTracker::new(SeasonCalendar::new(vec![d(6, 1), d(3, 1), d(9, 1)]));
        let bounds = tracker.window(LimitWindow::Seasonal, Utc.with_ymd_and_hms(2024, 7, 4, 0, 0, 0).unwrap());
        assert_eq!(bounds.start, Some(start_of_day(d(6, 1))));
        assert_eq!(bounds.reset, Some(start_of_day(d(9, 1))));

        let before = tracker.window(LimitWindow::Seasonal, Utc.with_ymd_and_hms(2024, 1, 4, 0, 0, 0).unwrap());
        assert_eq!(before.start, None);
        assert_eq!(before.reset, Some(start_of_day(d(3, 1))));
    }

    #[test]
    fn test_nth_plus_one_rejected() {
        let tracker = LimitTracker::default();
        let now = Utc.with_ymd_and_hms(2024, 3, 14, 10, 0, 0).unwrap();
        let recipe = recipe(vec![daily(2)]);
        let tasks = vec![task(now, TaskStatus::Claimed), task(now, TaskStatus::InProgress)];

        let err = tracker.check_before_start(&recipe, &tasks, now, 1).unwrap_err();
        let FactoryError::LimitExceeded(breach) = err else {
            panic!("expected limit error");
        };
        assert_eq!(breach.current, 2);
        assert_eq!(breach.reset_time, Some(Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap()));

        let tomorrow = Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 1).unwrap();
        assert!(tracker.check_before_start(&recipe, &tasks, tomorrow, 1).is_ok());
    }

    #[test]
    fn test_aborted_tasks_do_not_count() {
        let tracker = LimitTracker::default();
        let now = Utc.with_ymd_and_hms(2024, 3, 14, 10, 0, 0).unwrap();
        let recipe = recipe(vec![daily(1)]);
        let tasks = vec![task(now, TaskStatus::Cancelled), task(now, TaskStatus::Failed)];
        assert!(tracker.check_before_start(&recipe, &tasks, now, 1).is_ok());
    }

    #[test]
    fn test_reward_quantity_two_phase() {
        let tracker = LimitTracker::default();
        let now = Utc.with_ymd_and_hms(2024, 3, 14, 10, 0, 0).unwrap();
        let recipe = recipe(vec![RecipeLimit {
            kind: LimitKind::RewardQuantity,
            window: LimitWindow::Total,
            max: 10,
            item: Some(7),
        }]);
        let v = ItemVariant::new(1, 1);
        let out = |item, quantity| TaskOutputItem { execution: 0, group: 0, item, variant: v, quantity };

        let mut done = task(now, TaskStatus::Claimed);
        done.outputs = vec![out(7, 8), out(9, 50)];
        let tasks = vec![done];

        assert!(tracker.check_before_start(&recipe, &tasks, now, 1).is_ok());
        assert!(tracker.check_rolled(&recipe, &tasks, now, &[out(7, 2)]).is_ok());
        assert!(tracker.check_rolled(&recipe, &tasks, now, &[out(7, 3)]).is_err());
        assert!(tracker.check_rolled(&recipe, &tasks, now, &[out(9, 3)]).is_ok());
    }
}
