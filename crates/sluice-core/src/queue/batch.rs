//! Batch execution for batchable tasks.
//!
//! batch buffer から due なタスクを task_type ごとに最大 `batch_size` 件取り出し、
//! BatchProcessor に 1 回で渡す。
//! - item ごとの `Err` はそのタスクだけ通常の retry へ
//! - batch 全体の失敗は全メンバーを batchable を外して個別 retry へ
//! - `with_concurrency` の型は 1 batch で permit を 1 つ使う。空きがなければその型は次の tick まで待つ

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};

use super::levels::{Lane, QueueKey};
use super::task_queue::{PriorityTaskQueue, policy_for};
use crate::domain::{Event, Task, TaskType};
use crate::error::SluiceError;
use crate::ports::IdGenerator;

impl PriorityTaskQueue {
    /// Drain due batchable tasks and run them. Returns how many tasks ran.
    pub async fn process_batches(&self) -> usize {
        let groups = self.drain_batches().await;
        let mut ran = 0;
        for (task_type, tasks, permit) in groups {
            ran += tasks.len();
            self.run_batch(task_type, tasks).await;
            if let Some(permit) = permit {
                drop(permit);
                self.notify.notify_one();
            }
        }
        ran
    }

    /// Claim up to `batch_size` due tasks per type, in schedule order.
    /// Types whose concurrency slots are all taken stay in the buffer.
    async fn drain_batches(&self) -> Vec<(TaskType, Vec<Task>, Option<OwnedSemaphorePermit>)> {
        let now = self.clock.now();
        let limit = self.config.batch_size;
        let mut buffer = self.batch_buffer.lock().await;
        let mut state = self.state.lock().await;

        let mut order: Vec<TaskType> = Vec::new();
        // None = saturated
        let mut groups: HashMap<TaskType, Option<(Vec<Task>, Option<OwnedSemaphorePermit>)>> =
            HashMap::new();
        let mut taken = Vec::new();
        for (key, id) in buffer.iter() {
            if key.scheduled_at > now {
                break;
            }
            let Some(record) = state.active.get_mut(id) else {
                continue;
            };
            let group = groups.entry(record.task.task_type.clone()).or_insert_with(|| {
                let task_type = &record.task.task_type;
                let permit = match self.registry.get(task_type).and_then(|r| r.permits) {
                    None => Ok(None),
                    Some(permits) => permits.try_acquire_owned().map(Some),
                };
                match permit {
                    Ok(permit) => {
                        order.push(task_type.clone());
                        Some((Vec::new(), permit))
                    }
                    Err(_) => {
                        debug!(%task_type, "batch type saturated, left buffered");
                        None
                    }
                }
            });
            let Some((group, _)) = group else {
                continue;
            };
            if group.len() >= limit {
                continue;
            }
            let attempt = record.start_attempt(now);
            group.push(record.task.clone());
            taken.push(*key);
            self.events.emit(Event::TaskStarted {
                task_id: *id,
                attempt,
            });
        }
        remove_keys(&mut buffer, &taken);
        drop(state);
        drop(buffer);

        order
            .into_iter()
            .filter_map(|t| match groups.remove(&t) {
                Some(Some((tasks, permit))) if !tasks.is_empty() => Some((t, tasks, permit)),
                _ => None,
            })
            .collect()
    }

    async fn run_batch(&self, task_type: TaskType, tasks: Vec<Task>) {
        let Some(registration) = self.registry.get(&task_type) else {
            return;
        };
        let Some(batch) = registration.batch.clone() else {
            return;
        };
        let batch_id = self.ids.generate_batch_id();
        let size = tasks.len();
        info!(%batch_id, %task_type, size, "batch started");
        self.events.emit(Event::BatchStarted {
            batch_id,
            task_type: task_type.clone(),
            size,
        });

        let started = Instant::now();
        let outcome =
            match tokio::time::timeout(registration.timeout, batch.process_batch(&tasks)).await {
                Ok(Ok(items)) if items.len() == size => Ok(items),
                Ok(Ok(items)) => Err(SluiceError::processor(format!(
                    "batch returned {} outcomes for {size} tasks",
                    items.len()
                ))),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(SluiceError::TaskTimeout(registration.timeout)),
            };
        let latency_ms = started.elapsed().as_millis() as u64;
        let policy = policy_for(&registration);

        let (succeeded, failed) = match outcome {
            Ok(items) => {
                let mut succeeded = 0;
                for (task, item) in tasks.iter().zip(items) {
                    match item {
                        Ok(value) => {
                            self.complete(task.id, value, latency_ms).await;
                            succeeded += 1;
                        }
                        Err(message) => {
                            self.handle_failure(
                                task,
                                SluiceError::Processor(message),
                                policy.clone(),
                                true,
                            )
                            .await;
                        }
                    }
                }
                (succeeded, size - succeeded)
            }
            Err(err) => {
                warn!(%batch_id, %task_type, error = %err, "batch failed, retrying members individually");
                let members = self.unbatch(&tasks).await;
                for task in &members {
                    self.handle_failure(task, err.clone(), policy.clone(), false)
                        .await;
                }
                (0, size)
            }
        };

        self.events.emit(Event::BatchProgress {
            batch_id,
            succeeded,
            failed,
        });
        self.events.emit(Event::BatchCompleted {
            batch_id,
            ok: failed == 0,
        });
        info!(%batch_id, succeeded, failed, "batch completed");
    }

    /// Clear `batchable` so retries go through the per-task processor.
    async fn unbatch(&self, tasks: &[Task]) -> Vec<Task> {
        let mut state = self.state.lock().await;
        tasks
            .iter()
            .map(|task| {
                if let Some(record) = state.active.get_mut(&task.id) {
                    record.task.batchable = false;
                }
                Task {
                    batchable: false,
                    ..task.clone()
                }
            })
            .collect()
    }
}

fn remove_keys(lane: &mut Lane, keys: &[QueueKey]) {
    for key in keys {
        lane.remove(key);
    }
}
