//! Events - 監視・協調コンポーネント向けのイベント
//!
//! コアはイベントを `EventSink` に渡すだけで、消費はしません。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{BatchId, Priority, TaskId, TaskType};
use crate::governance::circuit_breaker::CircuitState;

/// Severity of a monitoring alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    TaskEnqueued {
        task_id: TaskId,
        task_type: TaskType,
        priority: Priority,
    },
    TaskStarted {
        task_id: TaskId,
        attempt: u32,
    },
    TaskCompleted {
        task_id: TaskId,
        latency_ms: u64,
    },
    TaskRetry {
        task_id: TaskId,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    TaskFailed {
        task_id: TaskId,
        attempts: u32,
        error: String,
    },
    TaskDeadLettered {
        task_id: TaskId,
        total_attempts: u32,
    },
    TaskCancelled {
        task_id: TaskId,
    },
    BatchStarted {
        batch_id: BatchId,
        task_type: TaskType,
        size: usize,
    },
    BatchProgress {
        batch_id: BatchId,
        succeeded: usize,
        failed: usize,
    },
    BatchCompleted {
        batch_id: BatchId,
        ok: bool,
    },
    ServerHealthChanged {
        server_id: String,
        healthy: bool,
    },
    CircuitStateChanged {
        name: String,
        from: CircuitState,
        to: CircuitState,
    },
    QueueAlert {
        level: AlertLevel,
        message: String,
    },
    MetricsCollected {
        queue_depth: usize,
        in_flight: usize,
        throughput_per_sec: f64,
        success_rate: f64,
        dead_letter_size: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_is_tagged() {
        let e = Event::ServerHealthChanged {
            server_id: "s1".to_string(),
            healthy: false,
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["event"], "server_health_changed");
        assert_eq!(v["healthy"], false);
    }
}
