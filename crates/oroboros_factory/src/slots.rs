//! # Production Slots
//!
//! Per-user concurrency. A task of class `C` first occupies one of the
//! `specialized[C]` slots; once those are full it overflows into the
//! universal slots shared by every class. A task holds its slot from
//! submission until it is claimed, cancelled or failed.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::task::ProductionTask;

/// Slot capacities.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotPolicy {
    /// Slots usable by any operation class.
    pub universal: u32,
    /// Slots reserved for one operation class.
    pub specialized: HashMap<String, u32>,
}

impl Default for SlotPolicy {
    fn default() -> Self {
        Self {
            universal: 2,
            specialized: HashMap::new(),
        }
    }
}

/// Occupancy as seen by one operation class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotUsage {
    /// Operation class.
    pub operation_class: String,
    /// Slots this class may use.
    pub total: u32,
    /// Of those, occupied.
    pub used: u32,
    /// Of those, free.
    pub free: u32,
}

impl SlotPolicy {
    fn specialized_for(&self, class: &str) -> u32 {
        self.specialized.get(class).copied().unwrap_or(0)
    }

    /// Active tasks per class.
    fn active_by_class(tasks: &[ProductionTask]) -> BTreeMap<&str, u32> {
        let mut counts = BTreeMap::new();
        for task in tasks.iter().filter(|t| t.holds_slot()) {
            *counts.entry(task.operation_class.as_str()).or_insert(0) += 1;
        }
        counts
    }

    fn universal_used(&self, counts: &BTreeMap<&str, u32>) -> u32 {
        counts
            .iter()
            .map(|(class, n)| n.saturating_sub(self.specialized_for(class)))
            .sum()
    }

    /// Occupancy for `class`, given one user's tasks.
    #[must_use]
    pub fn usage(&self, class: &str, tasks: &[ProductionTask]) -> SlotUsage {
        let counts = Self::active_by_class(tasks);
        let specialized = self.specialized_for(class);
        let own = counts.get(class).copied().unwrap_or(0);

        let total = specialized + self.universal;
        let used = (own.min(specialized) + self.universal_used(&counts)).min(total);
        SlotUsage {
            operation_class: class.to_string(),
            total,
            used,
            free: total - used,
        }
    }

    /// Occupancy of the universal pool and of every specialized class.
    #[must_use]
    pub fn summary(&self, tasks: &[ProductionTask]) -> Vec<SlotUsage> {
        let counts = Self::active_by_class(tasks);
        let universal_used = self.universal_used(&counts).min(self.universal);
        let mut out = vec![SlotUsage {
            operation_class: "universal".to_string(),
            total: self.universal,
            used: universal_used,
            free: self.universal - universal_used,
        }];

        let mut classes: Vec<(&String, &u32)> = self.specialized.iter().collect();
        classes.sort_unstable();
        for (class, &total) in classes {
            let used = counts.get(class.as_str()).copied().unwrap_or(0).min(total);
            out.push(SlotUsage {
                operation_class: class.clone(),
                total,
                used,
                free: total - used,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskId, TaskStatus};
    use chrono::Utc;

    fn active(class: &str) -> ProductionTask {
        let mut task = ProductionTask::pending(TaskId::generate(), 1, 1, class, 1, Utc::now());
        task.status = TaskStatus::InProgress;
        task
    }

    fn policy() -> SlotPolicy {
        SlotPolicy {
            universal: 1,
            specialized: HashMap::from([("crafting".to_string(), 2)]),
        }
    }

    #[test]
    fn test_specialized_then_universal() {
        let policy = policy();
        let tasks = vec![active("crafting"), active("crafting")];
        let usage = policy.usage("crafting", &tasks);
        assert_eq!((usage.total, usage.used, usage.free), (3, 2, 1));

        let tasks = vec![active("crafting"), active("crafting"), active("crafting")];
        assert_eq!(policy.usage("crafting", &tasks).free, 0);
        // The overflow took the universal slot other classes share.
        assert_eq!(policy.usage("chest_opening", &tasks).free, 0);
    }

    #[test]
    fn test_finished_tasks_release() {
        let policy = policy();
        let mut done = active("chest_opening");
        done.status = TaskStatus::Claimed;
        assert_eq!(policy.usage("chest_opening", &[done]).free, 1);
    }

    #[test]
    fn test_summary() {
        let policy = policy();
        let summary = policy.summary(&[active("chest_opening")]);
        assert_eq!(summary[0].operation_class, "universal");
        assert_eq!(summary[0].used, 1);
        assert_eq!(summary[1].operation_class, "crafting");
        assert_eq!(summary[1].free, 2);
    }
}
