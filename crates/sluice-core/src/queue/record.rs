//! Task record: the queue's mutable view of one task.

use chrono::{DateTime, Utc};

use super::levels::QueueKey;
use crate::domain::{StatusChange, Task, TaskStatus};

/// Where a pending task is currently parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Level(QueueKey),
    Batch(QueueKey),
}

/// Single source of truth for a live task.
///
/// - Priority levels and the batch buffer hold `TaskId` only.
/// - All status changes go through the methods below.
#[derive(Debug, Clone)]
pub(crate) struct TaskRecord {
    pub task: Task,
    pub slot: Option<Slot>,
}

impl TaskRecord {
    pub fn new(mut task: Task) -> Self {
        task.history.push(StatusChange {
            status: task.status,
            at: task.created_at,
        });
        Self { task, slot: None }
    }

    /// Pending -> Processing. Returns the attempt number.
    pub fn start_attempt(&mut self, now: DateTime<Utc>) -> u32 {
        self.transition(TaskStatus::Processing, now);
        self.slot = None;
        self.task.attempts += 1;
        self.task.total_attempts += 1;
        self.task.attempts
    }

    pub fn complete(&mut self, now: DateTime<Utc>, result: serde_json::Value, latency_ms: u64) {
        self.transition(TaskStatus::Completed, now);
        self.task.result = Some(result);
        self.task.latency_ms = Some(latency_ms);
        self.task.completed_at = Some(now);
    }

    /// Are there attempts left after the current one?
    pub fn can_retry(&self) -> bool {
        self.task.attempts <= self.task.max_retries
    }

    /// Processing -> Retrying -> Pending, parked at `slot`.
    pub fn schedule_retry(
        &mut self,
        now: DateTime<Utc>,
        error: String,
        run_at: DateTime<Utc>,
        slot: Slot,
    ) {
        self.task.last_error = Some(error);
        self.transition(TaskStatus::Retrying, now);
        self.transition(TaskStatus::Pending, now);
        self.task.scheduled_at = run_at;
        self.slot = Some(slot);
    }

    /// Processing -> Failed.
    pub fn fail(&mut self, now: DateTime<Utc>, error: String) {
        self.task.last_error = Some(error);
        self.transition(TaskStatus::Failed, now);
        self.task.completed_at = Some(now);
    }

    /// Failed -> DeadLetter.
    pub fn dead_letter(&mut self, now: DateTime<Utc>) {
        self.transition(TaskStatus::DeadLetter, now);
    }

    /// Pending -> Cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.transition(TaskStatus::Cancelled, now);
        self.slot = None;
        self.task.completed_at = Some(now);
    }

    fn transition(&mut self, to: TaskStatus, at: DateTime<Utc>) {
        debug_assert!(
            self.task.status.can_transition_to(to),
            "illegal transition {:?} -> {:?} for {}",
            self.task.status,
            to,
            self.task.id
        );
        self.task.status = to;
        self.task.history.push(StatusChange { status: to, at });
    }
}
