//! Priority levels: one time-ordered lane per priority.
//!
//! Lane は `(scheduled_at, seq)` 順の BTreeMap なので、先頭が due でなければ
//! その lane に due なタスクはない（線形スキャン不要）。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};

use crate::domain::{Priority, TaskId};

/// Ordering key inside a lane. `seq` keeps FIFO order for equal times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct QueueKey {
    pub scheduled_at: DateTime<Utc>,
    pub seq: u64,
}

pub(crate) type Lane = BTreeMap<QueueKey, TaskId>;

/// Due entries, earliest first.
pub(crate) fn due(lane: &Lane, now: DateTime<Utc>) -> impl Iterator<Item = (&QueueKey, &TaskId)> {
    lane.iter().take_while(move |(key, _)| key.scheduled_at <= now)
}

pub(crate) struct PriorityLevels {
    lanes: Vec<Mutex<Lane>>,
}

impl PriorityLevels {
    pub fn new(levels: u8) -> Self {
        Self {
            lanes: (0..levels).map(|_| Mutex::new(Lane::new())).collect(),
        }
    }

    pub fn count(&self) -> usize {
        self.lanes.len()
    }

    pub async fn lock(&self, priority: Priority) -> Option<MutexGuard<'_, Lane>> {
        match self.lanes.get(priority.level()) {
            Some(lane) => Some(lane.lock().await),
            None => None,
        }
    }

    /// Priorities from highest to lowest.
    pub fn descending(&self) -> impl Iterator<Item = Priority> + '_ {
        (0..self.lanes.len()).rev().map(|p| Priority(p as u8))
    }

    /// Earliest scheduled time across all lanes.
    pub async fn next_due(&self) -> Option<DateTime<Utc>> {
        let mut earliest: Option<DateTime<Utc>> = None;
        for lane in &self.lanes {
            if let Some((key, _)) = lane.lock().await.first_key_value() {
                earliest = Some(earliest.map_or(key.scheduled_at, |e| e.min(key.scheduled_at)));
            }
        }
        earliest
    }
}
