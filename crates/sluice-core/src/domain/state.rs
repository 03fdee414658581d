//! State - タスクの状態
//!
//! # 状態遷移
//! ```text
//! Pending -> Processing -> Completed
//! Pending -> Processing -> Retrying -> Pending (backoff 後に再投入)
//! Pending -> Processing -> Failed -> DeadLetter
//! Pending -> Cancelled
//! ```
//! Cancelled はキューに残っている間だけ可能です（dispatch 後は不可）。

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in a priority level (possibly scheduled in the future).
    Pending,

    /// Claimed by exactly one worker.
    Processing,

    /// Failed an attempt; about to be re-inserted with backoff.
    Retrying,

    Completed,

    /// Retries exhausted.
    Failed,

    /// Retries exhausted past the dead-letter ceiling.
    DeadLetter,

    Cancelled,
}

impl TaskStatus {
    /// Is this a terminal state (no further automatic transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::DeadLetter | TaskStatus::Cancelled
        )
    }

    /// Legal edges of the task state machine.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Retrying)
                | (Processing, Failed)
                | (Retrying, Pending)
                | (Failed, DeadLetter)
        )
    }
}
