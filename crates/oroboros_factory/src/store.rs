//! # Task Store
//!
//! Persistence seam for production tasks. Tasks are never deleted, and the
//! rolled reward of a task cannot be rewritten once stored.

use std::collections::HashMap;

use oroboros_economy::UserId;
use parking_lot::RwLock;

use crate::error::{FactoryError, FactoryResult};
use crate::task::{ProductionTask, TaskId, TaskStatus};

/// Backing storage for tasks.
pub trait TaskStore: Send + Sync {
    /// Inserts a new task.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the id is taken or the write fails.
    fn insert(&self, task: ProductionTask) -> FactoryResult<()>;

    /// Replaces a stored task.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the task is unknown, or if the update would
    /// rewrite already frozen outputs.
    fn update(&self, task: &ProductionTask) -> FactoryResult<()>;

    /// Reads one task.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the read fails.
    fn get(&self, id: &TaskId) -> FactoryResult<Option<ProductionTask>>;

    /// All tasks of one user, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the read fails.
    fn for_user(&self, user: UserId) -> FactoryResult<Vec<ProductionTask>>;

    /// All tasks with a stored status.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the read fails.
    fn with_status(&self, status: TaskStatus) -> FactoryResult<Vec<ProductionTask>>;
}

/// Task rows and the per-user index.
#[derive(Debug, Default)]
pub(crate) struct Tables {
    tasks: HashMap<TaskId, ProductionTask>,
    by_user: HashMap<UserId, Vec<TaskId>>,
}

impl Tables {
    pub(crate) fn check_insert(&self, task: &ProductionTask) -> FactoryResult<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(FactoryError::Storage(format!("task {} already exists", task.id)));
        }
        Ok(())
    }

    pub(crate) fn check_update(&self, task: &ProductionTask) -> FactoryResult<()> {
        let stored = self
            .tasks
            .get(&task.id)
            .ok_or_else(|| FactoryError::Storage(format!("task {} does not exist", task.id)))?;
        if !stored.outputs.is_empty() && stored.outputs != task.outputs {
            return Err(FactoryError::Storage(format!("outputs of task {} are frozen", task.id)));
        }
        Ok(())
    }

    /// Inserts or replaces a task.
    pub(crate) fn put(&mut self, task: ProductionTask) {
        if !self.tasks.contains_key(&task.id) {
            self.by_user.entry(task.user).or_default().push(task.id.clone());
        }
        self.tasks.insert(task.id.clone(), task);
    }

    pub(crate) fn get(&self, id: &TaskId) -> Option<ProductionTask> {
        self.tasks.get(id).cloned()
    }

    pub(crate) fn for_user(&self, user: UserId) -> Vec<ProductionTask> {
        self.by_user
            .get(&user)
            .map(|ids| ids.iter().filter_map(|id| self.tasks.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn with_status(&self, status: TaskStatus) -> Vec<ProductionTask> {
        let mut tasks: Vec<ProductionTask> = self
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }
}

/// In-process task table. Lost on restart; see [`crate::task_log::LogTaskStore`].
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tables: RwLock<Tables>,
}

impl MemoryTaskStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryTaskStore {
    fn insert(&self, task: ProductionTask) -> FactoryResult<()> {
        let mut tables = self.tables.write();
        tables.check_insert(&task)?;
        tables.put(task);
        Ok(())
    }

    fn update(&self, task: &ProductionTask) -> FactoryResult<()> {
        let mut tables = self.tables.write();
        tables.check_update(task)?;
        tables.put(task.clone());
        Ok(())
    }

    fn get(&self, id: &TaskId) -> FactoryResult<Option<ProductionTask>> {
        Ok(self.tables.read().get(id))
    }

    fn for_user(&self, user: UserId) -> FactoryResult<Vec<ProductionTask>> {
        Ok(self.tables.read().for_user(user))
    }

    fn with_status(&self, status: TaskStatus) -> FactoryResult<Vec<ProductionTask>> {
        Ok(self.tables.read().with_status(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskOutputItem;
    use chrono::Utc;
    use oroboros_economy::ItemVariant;

    #[test]
    fn test_insert_and_query() {
        let store = MemoryTaskStore::new();
        let task = ProductionTask::pending(TaskId::new("a"), 7, 1, "crafting", 1, Utc::now());
        store.insert(task.clone()).unwrap();
        assert!(store.insert(task.clone()).is_err());
        assert_eq!(store.get(&task.id).unwrap(), Some(task.clone()));
        assert_eq!(store.for_user(7).unwrap().len(), 1);
        assert!(store.for_user(8).unwrap().is_empty());
        assert_eq!(store.with_status(TaskStatus::Pending).unwrap().len(), 1);
    }

    #[test]
    fn test_outputs_are_frozen() {
        let store = MemoryTaskStore::new();
        let mut task = ProductionTask::pending(TaskId::new("a"), 7, 1, "crafting", 1, Utc::now());
        store.insert(task.clone()).unwrap();

        let line = TaskOutputItem {
            execution: 0,
            group: 0,
            item: 1,
            variant: ItemVariant::new(1, 1),
            quantity: 3,
        };
        task.outputs = vec![line];
        task.status = TaskStatus::InProgress;
        store.update(&task).unwrap();

        task.outputs[0].quantity = 300;
        assert!(store.update(&task).is_err());
    }
}
