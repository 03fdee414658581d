use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{TaskId, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Dispatch precedence bucket. Larger values are dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub u8);

impl Priority {
    pub const LOW: Priority = Priority(0);
    pub const NORMAL: Priority = Priority(1);
    pub const HIGH: Priority = Priority(2);
    pub const CRITICAL: Priority = Priority(3);

    pub fn level(self) -> usize {
        self.0 as usize
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// 投入リクエスト。ID・時刻・状態はキューが付与する。
///
/// ```ignore
/// let id = queue
///     .enqueue(
///         NewTask::new("viz.render", json!({"chart": "bar"}))
///             .with_priority(Priority::HIGH)
///             .with_max_retries(2),
///     )
///     .await?;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub batchable: bool,
}

impl NewTask {
    pub fn new(task_type: impl Into<TaskType>, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            priority: Priority::default(),
            scheduled_at: None,
            timeout_ms: None,
            max_retries: None,
            metadata: serde_json::Map::new(),
            batchable: false,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn batchable(mut self) -> Self {
        self.batchable = true;
        self
    }
}

/// One status change, kept for inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: TaskStatus,
    pub at: DateTime<Utc>,
}

/// A unit of work owned by the queue until it reaches a terminal status.
///
/// Callers only ever see clones; mutation goes through `queue::TaskRecord`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub status: TaskStatus,

    /// Attempts in this run (reset when a failed task is replayed).
    pub attempts: u32,
    /// Attempts across all replays of the same work; drives dead-lettering.
    pub total_attempts: u32,
    pub max_retries: u32,

    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub timeout_ms: u64,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub batchable: bool,

    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub latency_ms: Option<u64>,
    pub completed_at: Option<DateTime<Utc>>,

    pub replay_of: Option<TaskId>,
    pub replayed_as: Option<TaskId>,

    pub history: Vec<StatusChange>,
}

impl Task {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_task_defaults() {
        let t = NewTask::new("viz.render", json!({}));
        assert_eq!(t.priority, Priority::NORMAL);
        assert!(t.scheduled_at.is_none());
        assert!(!t.batchable);
    }

    #[test]
    fn new_task_from_minimal_json() {
        let t: NewTask =
            serde_json::from_str(r#"{ "task_type": "viz.render", "payload": {"a": 1}, "priority": 3 }"#)
                .expect("deserialize");
        assert_eq!(t.priority, Priority::CRITICAL);
        assert_eq!(t.payload["a"], 1);
        assert!(t.metadata.is_empty());
    }

    #[test]
    fn priorities_order_by_value() {
        assert!(Priority::CRITICAL > Priority::HIGH);
        assert!(Priority::LOW < Priority::NORMAL);
        assert_eq!(Priority::HIGH.level(), 2);
    }
}
