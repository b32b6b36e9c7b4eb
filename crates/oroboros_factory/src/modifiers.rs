//! # Production Modifiers
//!
//! Speed and yield bonuses applied once, at start. They come from two
//! places: external player data (achievements, perks) behind the
//! [`ModifierSource`] trait, and boosters the player spends on the task.

use std::collections::HashMap;

use chrono::Duration;
use oroboros_economy::UserId;
use serde::{Deserialize, Serialize};

use crate::recipe::Recipe;

/// Hard ceiling on the speed bonus, in percent.
pub const MAX_SPEED_PERCENT: u32 = 90;

/// Bonuses frozen on a task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modifiers {
    /// Duration reduction in percent (capped at [`MAX_SPEED_PERCENT`]).
    pub speed_percent: u32,
    /// Extra quantity per rolled line, in percent (floor).
    pub yield_percent: u32,
}

impl Modifiers {
    /// Sums two sets of bonuses, capping speed.
    #[must_use]
    pub fn combine(self, other: Self) -> Self {
        Self {
            speed_percent: self
                .speed_percent
                .saturating_add(other.speed_percent)
                .min(MAX_SPEED_PERCENT),
            yield_percent: self.yield_percent.saturating_add(other.yield_percent),
        }
    }

    /// Shortens a duration by the speed bonus.
    #[must_use]
    pub fn apply_speed(self, base: Duration) -> Duration {
        let speed = i128::from(self.speed_percent.min(MAX_SPEED_PERCENT));
        let millis = i128::from(base.num_milliseconds());
        let kept = millis * (100 - speed) / 100;
        i64::try_from(kept).map_or(base, Duration::milliseconds)
    }

    /// Raises a rolled quantity by the yield bonus.
    #[must_use]
    pub fn apply_yield(self, quantity: u64) -> u64 {
        let bonus = quantity.saturating_mul(u64::from(self.yield_percent)) / 100;
        quantity.saturating_add(bonus)
    }
}

/// External bonus data.
pub trait ModifierSource: Send + Sync {
    /// Bonuses of `user` for `recipe`.
    fn modifiers(&self, user: UserId, recipe: &Recipe) -> Modifiers;
}

/// No external bonuses.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoModifiers;

impl ModifierSource for NoModifiers {
    fn modifiers(&self, _user: UserId, _recipe: &Recipe) -> Modifiers {
        Modifiers::default()
    }
}

/// Fixed per-user bonuses.
#[derive(Clone, Debug, Default)]
pub struct StaticModifiers {
    by_user: HashMap<UserId, Modifiers>,
}

impl StaticModifiers {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bonuses of one user.
    #[must_use]
    pub fn with(mut self, user: UserId, modifiers: Modifiers) -> Self {
        self.by_user.insert(user, modifiers);
        self
    }
}

impl ModifierSource for StaticModifiers {
    fn modifiers(&self, user: UserId, _recipe: &Recipe) -> Modifiers {
        self.by_user.get(&user).copied().unwrap_or_default()
    }
}

/// A booster item definition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoosterConfig {
    /// Item code spent (one per task).
    pub item: String,
    /// Speed bonus in percent.
    #[serde(default)]
    pub speed_percent: u32,
    /// Yield bonus in percent.
    #[serde(default)]
    pub yield_percent: u32,
}

impl BoosterConfig {
    /// The bonuses this booster grants.
    #[must_use]
    pub const fn modifiers(&self) -> Modifiers {
        Modifiers {
            speed_percent: self.speed_percent,
            yield_percent: self.yield_percent,
        }
    }
}
