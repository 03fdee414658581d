//! Bounded stores of finished tasks, oldest evicted first.

use std::collections::{HashMap, VecDeque};

use crate::domain::{Task, TaskId};

#[derive(Debug)]
pub(crate) struct BoundedStore {
    order: VecDeque<TaskId>,
    tasks: HashMap<TaskId, Task>,
    limit: usize,
}

impl BoundedStore {
    pub fn new(limit: usize) -> Self {
        Self {
            order: VecDeque::new(),
            tasks: HashMap::new(),
            limit,
        }
    }

    /// Insert and evict the oldest entries beyond the limit.
    pub fn push(&mut self, task: Task) {
        debug_assert!(task.is_terminal(), "live task {} pushed to history", task.id);
        let id = task.id;
        if self.tasks.insert(id, task).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.tasks.remove(&oldest);
            }
        }
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Oldest first.
    pub fn to_vec(&self) -> Vec<Task> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id).cloned())
            .collect()
    }
}

/// Completed, failed, dead-lettered and cancelled tasks kept for inspection.
#[derive(Debug)]
pub(crate) struct History {
    pub completed: BoundedStore,
    pub failed: BoundedStore,
    pub dead_letter: BoundedStore,
    pub cancelled: BoundedStore,
}

impl History {
    pub fn new(limit: usize) -> Self {
        Self {
            completed: BoundedStore::new(limit),
            failed: BoundedStore::new(limit),
            dead_letter: BoundedStore::new(limit),
            cancelled: BoundedStore::new(limit),
        }
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.completed
            .get(id)
            .or_else(|| self.failed.get(id))
            .or_else(|| self.dead_letter.get(id))
            .or_else(|| self.cancelled.get(id))
    }

    /// A failed or dead-lettered task, for replay.
    pub fn replayable_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        if self.failed.get(id).is_some() {
            return self.failed.get_mut(id);
        }
        self.dead_letter.get_mut(id)
    }
}
