//! PriorityTaskQueue - priority-ordered, time-ordered task dispatch
//!
//! # ロック順序
//! lane (priority level か batch buffer) -> state の順で必ず取る。
//! lane から TaskId を取り出した側がそのタスクの所有者になる
//! （worker の dequeue と cancel はどちらも「lane から remove できたか」で勝敗が決まる）。
//!
//! # 失敗時の流れ
//! ```text
//! Processing -> Retrying -> Pending (scheduled_at = now + backoff)   attempts <= max_retries
//! Processing -> Failed                                               retries exhausted
//! Processing -> Failed -> DeadLetter                                 total_attempts > dead_letter_max_retries
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard, Notify, OwnedSemaphorePermit};
use tracing::{debug, error, info, warn};

use super::history::History;
use super::levels::{Lane, PriorityLevels, QueueKey, due};
use super::processor::{Processor, ProcessorOptions, ProcessorRegistry, Registration};
use super::record::{Slot, TaskRecord};
use super::retry::RetryPolicy;
use crate::config::QueueConfig;
use crate::domain::{Event, NewTask, Priority, Task, TaskId, TaskStatus, TaskType};
use crate::error::SluiceError;
use crate::observability::QueueMetrics;
use crate::ports::clock::{self, Clock};
use crate::ports::{EventSink, IdGenerator, UlidGenerator};

/// Bookkeeping guarded by one mutex.
pub(super) struct QueueState {
    /// Tasks that are not terminal yet.
    pub active: HashMap<TaskId, TaskRecord>,
    pub history: History,
    next_seq: u64,
    pub completed_total: u64,
    pub failed_total: u64,
    pub retried_total: u64,
    /// Completion times inside the metrics window.
    pub recent_completions: VecDeque<DateTime<Utc>>,
}

impl QueueState {
    fn new(history_limit: usize) -> Self {
        Self {
            active: HashMap::new(),
            history: History::new(history_limit),
            next_seq: 0,
            completed_total: 0,
            failed_total: 0,
            retried_total: 0,
            recent_completions: VecDeque::new(),
        }
    }

    fn next_key(&mut self, scheduled_at: DateTime<Utc>) -> QueueKey {
        self.next_seq += 1;
        QueueKey {
            scheduled_at,
            seq: self.next_seq,
        }
    }

    /// Drop completion times older than `window`.
    fn prune_completions(&mut self, now: DateTime<Utc>, window: Duration) {
        while let Some(&oldest) = self.recent_completions.front() {
            if clock::elapsed(oldest, now) > window {
                self.recent_completions.pop_front();
            } else {
                break;
            }
        }
    }

        pub fn count(&self, status: TaskStatus) -> usize {
        self.active
            .values()
            .filter(|r| r.task.status == status)
            .count()
    }
}

pub struct PriorityTaskQueue {
    pub(super) config: QueueConfig,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) ids: UlidGenerator<Arc<dyn Clock>>,
    pub(super) events: Arc<dyn EventSink>,
    pub(super) registry: ProcessorRegistry,
    levels: PriorityLevels,
    /// Batchable tasks waiting for the batch loop.
    pub(super) batch_buffer: Mutex<Lane>,
    pub(super) state: Mutex<QueueState>,
    pub(super) notify: Notify,
    accepting: AtomicBool,
}

impl PriorityTaskQueue {
    pub fn new(
        config: QueueConfig,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, SluiceError> {
        config.validate()?;
        Ok(Self {
            levels: PriorityLevels::new(config.priority_levels),
            batch_buffer: Mutex::new(Lane::new()),
            state: Mutex::new(QueueState::new(config.history_limit)),
            ids: UlidGenerator::new(Arc::clone(&clock)),
            registry: ProcessorRegistry::default(),
            notify: Notify::new(),
            accepting: AtomicBool::new(true),
            config,
            clock,
            events,
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Register the processor for `task_type`. Registrations cannot be replaced.
    pub fn register_processor(
        &self,
        task_type: impl Into<TaskType>,
        processor: Arc<dyn Processor>,
        options: ProcessorOptions,
    ) -> Result<(), SluiceError> {
        let task_type = task_type.into();
        info!(%task_type, ?options, "processor registered");
        self.registry
            .register(task_type, processor, options, &self.config)
    }

    pub fn registered_types(&self) -> Vec<TaskType> {
        self.registry.registered_types()
    }

    /// Accept a task. Unknown types and out-of-range priorities are refused here,
    /// never after dispatch.
    pub async fn enqueue(&self, new: NewTask) -> Result<TaskId, SluiceError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(SluiceError::ShuttingDown);
        }
        let registration = self
            .registry
            .get(&new.task_type)
            .ok_or_else(|| SluiceError::UnregisteredTaskType(new.task_type.clone()))?;
        if new.priority.level() >= self.levels.count() {
            return Err(SluiceError::InvalidPriority {
                priority: new.priority.0,
                levels: self.config.priority_levels,
            });
        }

        let now = self.clock.now();
        let to_batch = new.batchable && registration.batch.is_some();
        let task = Task {
            id: self.ids.generate_task_id(),
            task_type: new.task_type,
            payload: new.payload,
            priority: new.priority,
            status: TaskStatus::Pending,
            attempts: 0,
            total_attempts: 0,
            max_retries: new.max_retries.unwrap_or(registration.max_retries),
            created_at: now,
            scheduled_at: new.scheduled_at.unwrap_or(now),
            timeout_ms: new
                .timeout_ms
                .unwrap_or(registration.timeout.as_millis() as u64),
            metadata: new.metadata,
            batchable: new.batchable,
            last_error: None,
            result: None,
            latency_ms: None,
            completed_at: None,
            replay_of: None,
            replayed_as: None,
            history: Vec::new(),
        };
        let (id, task_type, priority) = (task.id, task.task_type.clone(), task.priority);

        self.insert_pending(task, to_batch, |_| true).await?;

        debug!(task_id = %id, %task_type, %priority, "task enqueued");
        self.events.emit(Event::TaskEnqueued {
            task_id: id,
            task_type,
            priority,
        });
        self.notify.notify_one();
        Ok(id)
    }

    /// Current view of a task, live or from history.
    pub async fn get_task_status(&self, id: TaskId) -> Option<Task> {
        let state = self.state.lock().await;
        state
            .active
            .get(&id)
            .map(|r| r.task.clone())
            .or_else(|| state.history.get(&id).cloned())
    }

    /// Withdraw a pending task. `false` once a worker has claimed it.
    pub async fn cancel_task(&self, id: TaskId) -> bool {
        let (priority, slot) = {
            let state = self.state.lock().await;
            match state.active.get(&id) {
                Some(r) if r.task.status == TaskStatus::Pending => (r.task.priority, r.slot),
                _ => return false,
            }
        };
        let Some(slot) = slot else {
            return false;
        };

        let (mut lane, key) = match slot {
            Slot::Level(key) => match self.levels.lock(priority).await {
                Some(lane) => (lane, key),
                None => return false,
            },
            Slot::Batch(key) => (self.batch_buffer.lock().await, key),
        };
        if lane.remove(&key).is_none() {
            // worker が先に取った
            return false;
        }

        let mut state = self.state.lock().await;
        let Some(mut record) = state.active.remove(&id) else {
            return false;
        };
        record.cancel(self.clock.now());
        state.history.cancelled.push(record.task);
        drop(state);
        drop(lane);

        info!(task_id = %id, "task cancelled");
        self.events.emit(Event::TaskCancelled { task_id: id });
        true
    }

    /// Replay a failed or dead-lettered task as a new task.
    ///
    /// The new task keeps the cumulative attempt count, so a task that keeps
    /// failing eventually lands in the dead-letter store. Returns `None` if the
    /// task is not replayable or was already replayed.
    pub async fn retry_failed_task(&self, id: TaskId) -> Option<TaskId> {
        if !self.accepting.load(Ordering::Acquire) {
            return None;
        }
        let old = {
            let state = self.state.lock().await;
            let task = state
                .history
                .failed
                .get(&id)
                .or_else(|| state.history.dead_letter.get(&id))?;
            if task.replayed_as.is_some() {
                return None;
            }
            task.clone()
        };
        let registration = self.registry.get(&old.task_type)?;

        let now = self.clock.now();
        let new_id = self.ids.generate_task_id();
        let task = Task {
            id: new_id,
            status: TaskStatus::Pending,
            attempts: 0,
            created_at: now,
            scheduled_at: now,
            last_error: None,
            result: None,
            latency_ms: None,
            completed_at: None,
            replay_of: Some(id),
            replayed_as: None,
            history: Vec::new(),
            ..old
        };
        let to_batch = task.batchable && registration.batch.is_some();
        let (task_type, priority) = (task.task_type.clone(), task.priority);

        let linked = self
            .insert_pending(task, to_batch, |state| {
                match state.history.replayable_mut(&id) {
                    Some(old) if old.replayed_as.is_none() => {
                        old.replayed_as = Some(new_id);
                        true
                    }
                    _ => false,
                }
            })
            .await
            .ok()?;
        if !linked {
            return None;
        }

        info!(task_id = %id, replay = %new_id, "failed task replayed");
        self.events.emit(Event::TaskEnqueued {
            task_id: new_id,
            task_type,
            priority,
        });
        self.notify.notify_one();
        Some(new_id)
    }

    /// Claim and execute one due task. Returns the task id, or `None` when
    /// nothing is eligible.
    pub async fn process_next(&self) -> Option<TaskId> {
        let (task, permit) = self.claim_next().await?;
        let id = task.id;
        self.execute(task, permit).await;
        Some(id)
    }

    /// Tasks waiting in a priority level or the batch buffer.
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.count(TaskStatus::Pending)
    }

    /// Tasks that are not terminal yet.
    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active.len()
    }

    pub async fn completed_tasks(&self) -> Vec<Task> {
        self.state.lock().await.history.completed.to_vec()
    }

    pub async fn failed_tasks(&self) -> Vec<Task> {
        self.state.lock().await.history.failed.to_vec()
    }

    pub async fn dead_letter_tasks(&self) -> Vec<Task> {
        self.state.lock().await.history.dead_letter.to_vec()
    }

    pub async fn metrics(&self) -> QueueMetrics {
        let now = self.clock.now();
        let window = self.config.metrics_interval();
        let mut state = self.state.lock().await;
        state.prune_completions(now, window);

        let finished = state.completed_total + state.failed_total;
        QueueMetrics {
            queue_depth: state.count(TaskStatus::Pending),
            in_flight: state.count(TaskStatus::Processing),
            completed_total: state.completed_total,
            failed_total: state.failed_total,
            retried_total: state.retried_total,
            dead_letter_size: state.history.dead_letter.len(),
            throughput_per_sec: state.recent_completions.len() as f64
                / window.as_secs_f64().max(f64::EPSILON),
            success_rate: if finished == 0 {
                1.0
            } else {
                state.completed_total as f64 / finished as f64
            },
            collected_at: Some(now),
        }
    }

    /// Refuse new work from now on.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Earliest `scheduled_at` among tasks in the priority levels.
    pub(super) async fn next_due(&self) -> Option<DateTime<Utc>> {
        self.levels.next_due().await
    }

    /// Highest priority first; within a level the earliest due task whose
    /// type has a free concurrency slot.
    async fn claim_next(&self) -> Option<(Task, Option<OwnedSemaphorePermit>)> {
        for priority in self.levels.descending() {
            let Some(mut lane) = self.levels.lock(priority).await else {
                continue;
            };
            let now = self.clock.now();
            let mut state = self.state.lock().await;
            let Some((key, id, permit)) = self.first_claimable(&lane, &state, now) else {
                continue;
            };
            lane.remove(&key);
            let Some(record) = state.active.get_mut(&id) else {
                continue;
            };
            let attempt = record.start_attempt(now);
            let task = record.task.clone();
            drop(state);
            drop(lane);

            debug!(task_id = %id, attempt, %priority, "task claimed");
            self.events.emit(Event::TaskStarted {
                task_id: id,
                attempt,
            });
            return Some((task, permit));
        }
        None
    }

    /// Saturated types are skipped, not waited on.
    fn first_claimable(
        &self,
        lane: &Lane,
        state: &QueueState,
        now: DateTime<Utc>,
    ) -> Option<(QueueKey, TaskId, Option<OwnedSemaphorePermit>)> {
        let mut saturated: Vec<&TaskType> = Vec::new();
        for (key, id) in due(lane, now) {
            let Some(record) = state.active.get(id) else {
                continue;
            };
            let task_type = &record.task.task_type;
            if saturated.contains(&task_type) {
                continue;
            }
            match self.registry.get(task_type).and_then(|r| r.permits) {
                None => return Some((*key, *id, None)),
                Some(permits) => match permits.try_acquire_owned() {
                    Ok(permit) => return Some((*key, *id, Some(permit))),
                    Err(_) => saturated.push(task_type),
                },
            }
        }
        None
    }

    /// Run a claimed task under its timeout and record the outcome.
    async fn execute(&self, task: Task, permit: Option<OwnedSemaphorePermit>) {
        let Some(registration) = self.registry.get(&task.task_type) else {
            let err = SluiceError::UnregisteredTaskType(task.task_type.clone());
            self.handle_failure(&task, err, RetryPolicy::default(), false)
                .await;
            return;
        };

        self.run_claimed(&task, &registration).await;
        if let Some(permit) = permit {
            drop(permit);
            // 飽和で残っていた同じ型のタスクを拾わせる
            self.notify.notify_one();
        }
    }

    async fn run_claimed(&self, task: &Task, registration: &Registration) {
        let timeout = task.timeout();
        let started = Instant::now();
        let outcome = match tokio::time::timeout(timeout, registration.processor.process(task)).await
        {
            Ok(result) => result,
            Err(_) => Err(SluiceError::TaskTimeout(timeout)),
        };
        let latency = started.elapsed();

        match outcome {
            Ok(value) => self.complete(task.id, value, latency.as_millis() as u64).await,
            Err(err) => {
                let to_batch = task.batchable && registration.batch.is_some();
                self.handle_failure(task, err, policy_for(registration), to_batch)
                    .await
            }
        }
    }

    pub(super) async fn complete(&self, id: TaskId, value: serde_json::Value, latency_ms: u64) {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(mut record) = state.active.remove(&id) else {
            return;
        };
        record.complete(now, value, latency_ms);
        state.completed_total += 1;
        state.recent_completions.push_back(now);
        state.prune_completions(now, self.config.metrics_interval());
        state.history.completed.push(record.task);
        drop(state);

        debug!(task_id = %id, latency_ms, "task completed");
        self.events.emit(Event::TaskCompleted {
            task_id: id,
            latency_ms,
        });
    }

    /// Reschedule with backoff while attempts remain; otherwise fail or dead-letter.
    ///
    /// `task` is the worker's copy taken at claim time.
    pub(super) async fn handle_failure(
        &self,
        task: &Task,
        err: SluiceError,
        policy: RetryPolicy,
        to_batch: bool,
    ) {
        let now = self.clock.now();
        let message = err.to_string();

        // record は claim した worker だけが触る。ここで読んでから lane を取っても変わらない
        let retry = err.is_retryable() && {
            let state = self.state.lock().await;
            state.active.get(&task.id).is_some_and(TaskRecord::can_retry)
        };
        if retry {
            let delay = policy.next_delay(task.attempts);
            let run_at = clock::add(now, delay);
            let Ok(mut lane) = self.lane_for(task.priority, to_batch).await else {
                return;
            };
            let mut state = self.state.lock().await;
            let key = state.next_key(run_at);
            let Some(record) = state.active.get_mut(&task.id) else {
                return;
            };
            let slot = if to_batch {
                Slot::Batch(key)
            } else {
                Slot::Level(key)
            };
            record.schedule_retry(now, message.clone(), run_at, slot);
            lane.insert(key, task.id);
            state.retried_total += 1;
            drop(state);
            drop(lane);

            warn!(
                task_id = %task.id,
                attempt = task.attempts,
                ?delay,
                error = %message,
                "task failed, retry scheduled"
            );
            self.events.emit(Event::TaskRetry {
                task_id: task.id,
                attempt: task.attempts,
                delay,
                error: message,
            });
            return;
        }

        let mut state = self.state.lock().await;
        let Some(mut record) = state.active.remove(&task.id) else {
            return;
        };
        record.fail(now, message.clone());
        state.failed_total += 1;
        let total_attempts = record.task.total_attempts;
        let dead = total_attempts > self.config.dead_letter_max_retries;
        if dead {
            record.dead_letter(now);
            state.history.dead_letter.push(record.task);
        } else {
            state.history.failed.push(record.task);
        }
        drop(state);

        error!(
            task_id = %task.id,
            attempts = task.attempts,
            total_attempts,
            dead_letter = dead,
            error = %message,
            "task failed permanently"
        );
        self.events.emit(Event::TaskFailed {
            task_id: task.id,
            attempts: task.attempts,
            error: message,
        });
        if dead {
            self.events.emit(Event::TaskDeadLettered {
                task_id: task.id,
                total_attempts,
            });
        }
    }

    /// Park a new pending task. `precondition` runs under the state lock and
    /// can veto the insert.
    async fn insert_pending<F>(
        &self,
        task: Task,
        to_batch: bool,
        precondition: F,
    ) -> Result<bool, SluiceError>
    where
        F: FnOnce(&mut QueueState) -> bool,
    {
        let mut lane = self.lane_for(task.priority, to_batch).await?;
        let mut state = self.state.lock().await;
        if !precondition(&mut state) {
            return Ok(false);
        }
        let key = state.next_key(task.scheduled_at);
        let id = task.id;
        let mut record = TaskRecord::new(task);
        record.slot = Some(if to_batch {
            Slot::Batch(key)
        } else {
            Slot::Level(key)
        });
        state.active.insert(id, record);
        lane.insert(key, id);
        Ok(true)
    }

    async fn lane_for(
        &self,
        priority: Priority,
        to_batch: bool,
    ) -> Result<MutexGuard<'_, Lane>, SluiceError> {
        if to_batch {
            return Ok(self.batch_buffer.lock().await);
        }
        self.levels
            .lock(priority)
            .await
            .ok_or(SluiceError::InvalidPriority {
                priority: priority.0,
                levels: self.config.priority_levels,
            })
    }
}

pub(super) fn policy_for(registration: &Registration) -> RetryPolicy {
    RetryPolicy::exponential(registration.retry_delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::MemoryEventSink;
    use crate::ports::{FixedClock, SystemClock};
    use crate::queue::processor_fn;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn queue_with(config: QueueConfig, clock: Arc<dyn Clock>) -> (Arc<MemoryEventSink>, PriorityTaskQueue) {
        let sink = Arc::new(MemoryEventSink::new());
        let queue = PriorityTaskQueue::new(config, clock, sink.clone()).unwrap();
        (sink, queue)
    }

    fn fast_config() -> QueueConfig {
        QueueConfig {
            retry_delay_ms: 0,
            ..QueueConfig::default()
        }
    }

    fn echo() -> Arc<dyn Processor> {
        processor_fn(|task| async move { Ok(json!({ "echo": task.payload })) })
    }

    fn always_fail() -> Arc<dyn Processor> {
        processor_fn(|_| async { Err(SluiceError::processor("render backend down")) })
    }

    #[tokio::test]
    async fn unregistered_type_is_refused_at_enqueue() {
        let (_sink, queue) = queue_with(fast_config(), Arc::new(SystemClock));
        let err = queue
            .enqueue(NewTask::new("viz.unknown", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, SluiceError::UnregisteredTaskType(_)));
    }

    #[tokio::test]
    async fn out_of_range_priority_is_refused() {
        let (_sink, queue) = queue_with(fast_config(), Arc::new(SystemClock));
        queue
            .register_processor("viz.render", echo(), ProcessorOptions::default())
            .unwrap();
        let err = queue
            .enqueue(NewTask::new("viz.render", json!({})).with_priority(Priority(4)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SluiceError::InvalidPriority { priority: 4, levels: 4 }
        ));
    }

    #[tokio::test]
    async fn higher_priority_dispatches_first_then_time_order() {
        let (_sink, queue) = queue_with(fast_config(), Arc::new(SystemClock));
        queue
            .register_processor("viz.render", echo(), ProcessorOptions::default())
            .unwrap();

        let low = queue
            .enqueue(NewTask::new("viz.render", json!(1)).with_priority(Priority::LOW))
            .await
            .unwrap();
        let normal_a = queue
            .enqueue(NewTask::new("viz.render", json!(2)))
            .await
            .unwrap();
        let critical = queue
            .enqueue(NewTask::new("viz.render", json!(3)).with_priority(Priority::CRITICAL))
            .await
            .unwrap();
        let normal_b = queue
            .enqueue(NewTask::new("viz.render", json!(4)))
            .await
            .unwrap();

        let mut order = Vec::new();
        while let Some(id) = queue.process_next().await {
            order.push(id);
        }
        assert_eq!(order, vec![critical, normal_a, normal_b, low]);

        let done = queue.get_task_status(critical).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result, Some(json!({ "echo": 3 })));
        assert_eq!(done.attempts, 1);
    }

    #[tokio::test]
    async fn failing_task_retries_then_fails() {
        let (sink, queue) = queue_with(fast_config(), Arc::new(SystemClock));
        queue
            .register_processor("x", always_fail(), ProcessorOptions::default())
            .unwrap();
        let id = queue
            .enqueue(NewTask::new("x", json!({})).with_max_retries(2))
            .await
            .unwrap();

        while queue.process_next().await.is_some() {}

        let task = queue.get_task_status(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 3);
        assert_eq!(task.last_error.as_deref(), Some("processor error: render backend down"));
        for pair in task.history.windows(2) {
            assert!(pair[0].status.can_transition_to(pair[1].status));
        }

        let retries = sink
            .events()
            .iter()
            .filter(|e| matches!(e, Event::TaskRetry { .. }))
            .count();
        assert_eq!(retries, 2);
        assert_eq!(queue.failed_tasks().await.len(), 1);
        assert!(queue.dead_letter_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn exhausted_task_past_ceiling_is_dead_lettered() {
        let config = QueueConfig {
            dead_letter_max_retries: 2,
            ..fast_config()
        };
        let (sink, queue) = queue_with(config, Arc::new(SystemClock));
        queue
            .register_processor("x", always_fail(), ProcessorOptions::default())
            .unwrap();
        let id = queue
            .enqueue(NewTask::new("x", json!({})).with_max_retries(2))
            .await
            .unwrap();
        while queue.process_next().await.is_some() {}

        let task = queue.get_task_status(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::DeadLetter);
        assert_eq!(task.attempts, 3);
        assert!(sink
            .events()
            .contains(&Event::TaskDeadLettered { task_id: id, total_attempts: 3 }));
    }

    #[tokio::test]
    async fn backoff_delays_retry_until_due() {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let config = QueueConfig {
            retry_delay_ms: 1_000,
            ..QueueConfig::default()
        };
        let (_sink, queue) = queue_with(config, clock.clone());
        queue
            .register_processor("x", always_fail(), ProcessorOptions::default())
            .unwrap();
        let id = queue
            .enqueue(NewTask::new("x", json!({})).with_max_retries(2))
            .await
            .unwrap();

        assert_eq!(queue.process_next().await, Some(id));
        let task = queue.get_task_status(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.scheduled_at, clock::add(clock.now(), Duration::from_secs(1)));

        // 1s 経つまで取れない
        assert_eq!(queue.process_next().await, None);
        clock.advance(Duration::from_secs(1));
        assert_eq!(queue.process_next().await, Some(id));

        // 2 回目の失敗は 2s
        clock.advance(Duration::from_millis(1_999));
        assert_eq!(queue.process_next().await, None);
        clock.advance(Duration::from_millis(1));
        assert_eq!(queue.process_next().await, Some(id));
        assert_eq!(
            queue.get_task_status(id).await.unwrap().status,
            TaskStatus::Failed
        );
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let (_sink, queue) = queue_with(fast_config(), Arc::new(SystemClock));
        queue
            .register_processor(
                "slow",
                processor_fn(|_| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(json!(null))
                }),
                ProcessorOptions::default()
                    .with_timeout(Duration::from_millis(20))
                    .with_max_retries(0),
            )
            .unwrap();
        let id = queue.enqueue(NewTask::new("slow", json!({}))).await.unwrap();
        queue.process_next().await;

        let task = queue.get_task_status(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn cancel_before_dispatch_prevents_execution() {
        let calls = Arc::new(AtomicU32::new(0));
        let (_sink, queue) = queue_with(fast_config(), Arc::new(SystemClock));
        let counter = Arc::clone(&calls);
        queue
            .register_processor(
                "viz.render",
                processor_fn(move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(json!(null))
                    }
                }),
                ProcessorOptions::default(),
            )
            .unwrap();

        let id = queue
            .enqueue(NewTask::new("viz.render", json!({})))
            .await
            .unwrap();
        assert!(queue.cancel_task(id).await);
        assert!(!queue.cancel_task(id).await);
        assert_eq!(queue.process_next().await, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            queue.get_task_status(id).await.unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn cancel_after_dispatch_is_a_no_op() {
        let (_sink, queue) = queue_with(fast_config(), Arc::new(SystemClock));
        queue
            .register_processor("viz.render", echo(), ProcessorOptions::default())
            .unwrap();
        let id = queue
            .enqueue(NewTask::new("viz.render", json!({})))
            .await
            .unwrap();
        queue.process_next().await;
        assert!(!queue.cancel_task(id).await);
        assert_eq!(
            queue.get_task_status(id).await.unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn replay_creates_linked_task_once() {
        let config = QueueConfig {
            dead_letter_max_retries: 3,
            ..fast_config()
        };
        let (_sink, queue) = queue_with(config, Arc::new(SystemClock));
        queue
            .register_processor("x", always_fail(), ProcessorOptions::default().with_max_retries(1))
            .unwrap();
        let id = queue.enqueue(NewTask::new("x", json!({}))).await.unwrap();
        while queue.process_next().await.is_some() {}
        assert_eq!(queue.get_task_status(id).await.unwrap().status, TaskStatus::Failed);

        let replay = queue.retry_failed_task(id).await.unwrap();
        assert_ne!(replay, id);
        assert!(queue.retry_failed_task(id).await.is_none());

        let old = queue.get_task_status(id).await.unwrap();
        assert_eq!(old.replayed_as, Some(replay));
        let new = queue.get_task_status(replay).await.unwrap();
        assert_eq!(new.replay_of, Some(id));
        assert_eq!(new.total_attempts, 2);

        // 累積 4 回目で dead letter へ
        while queue.process_next().await.is_some() {}
        let new = queue.get_task_status(replay).await.unwrap();
        assert_eq!(new.status, TaskStatus::DeadLetter);
        assert_eq!(new.attempts, 2);
        assert_eq!(new.total_attempts, 4);
    }

    #[tokio::test]
    async fn metrics_reflect_outcomes() {
        let (_sink, queue) = queue_with(fast_config(), Arc::new(SystemClock));
        queue
            .register_processor("ok", echo(), ProcessorOptions::default())
            .unwrap();
        queue
            .register_processor("bad", always_fail(), ProcessorOptions::default().with_max_retries(0))
            .unwrap();
        for _ in 0..3 {
            queue.enqueue(NewTask::new("ok", json!({}))).await.unwrap();
        }
        queue.enqueue(NewTask::new("bad", json!({}))).await.unwrap();
        queue
            .enqueue(NewTask::new("ok", json!({})).scheduled_at(clock::add(
                Utc::now(),
                Duration::from_secs(3_600),
            )))
            .await
            .unwrap();

        while queue.process_next().await.is_some() {}
        let m = queue.metrics().await;
        assert_eq!(m.queue_depth, 1);
        assert_eq!(m.in_flight, 0);
        assert_eq!(m.completed_total, 3);
        assert_eq!(m.failed_total, 1);
        assert!((m.success_rate - 0.75).abs() < 1e-9);
        assert!(m.throughput_per_sec > 0.0);
        assert_eq!(queue.pending_count().await, 1);
    }

    #[tokio::test]
    async fn saturated_type_does_not_block_other_types() {
        let (_sink, queue) = queue_with(fast_config(), Arc::new(SystemClock));
        let queue = Arc::new(queue);
        let gate = Arc::new(Notify::new());
        let release = Arc::clone(&gate);
        queue
            .register_processor(
                "viz.render",
                processor_fn(move |_| {
                    let release = Arc::clone(&release);
                    async move {
                        release.notified().await;
                        Ok(json!("rendered"))
                    }
                }),
                ProcessorOptions::default().with_concurrency(1),
            )
            .unwrap();
        queue
            .register_processor("viz.thumb", echo(), ProcessorOptions::default())
            .unwrap();

        let first = queue.enqueue(NewTask::new("viz.render", json!(1))).await.unwrap();
        let second = queue.enqueue(NewTask::new("viz.render", json!(2))).await.unwrap();
        let thumb = queue.enqueue(NewTask::new("viz.thumb", json!(3))).await.unwrap();

        let busy = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.process_next().await }
        });
        for _ in 0..200 {
            if queue.get_task_status(first).await.unwrap().status == TaskStatus::Processing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // second は thumb より前だが viz.render の枠が埋まっている
        assert_eq!(queue.process_next().await, Some(thumb));
        assert_eq!(queue.process_next().await, None);
        let waiting = queue.get_task_status(second).await.unwrap();
        assert_eq!(waiting.status, TaskStatus::Pending);
        assert_eq!(waiting.attempts, 0);

        gate.notify_one();
        assert_eq!(busy.await.unwrap(), Some(first));
        gate.notify_one();
        assert_eq!(queue.process_next().await, Some(second));
        assert_eq!(
            queue.get_task_status(second).await.unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn completion_window_is_pruned_without_reading_metrics() {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let (_sink, queue) = queue_with(fast_config(), clock.clone());
        queue
            .register_processor("ok", echo(), ProcessorOptions::default())
            .unwrap();

        for _ in 0..5 {
            queue.enqueue(NewTask::new("ok", json!({}))).await.unwrap();
            queue.process_next().await.unwrap();
        }
        assert_eq!(queue.state.lock().await.recent_completions.len(), 5);

        clock.advance(queue.config().metrics_interval() + Duration::from_millis(1));
        queue.enqueue(NewTask::new("ok", json!({}))).await.unwrap();
        queue.process_next().await.unwrap();
        assert_eq!(queue.state.lock().await.recent_completions.len(), 1);
    }

    #[tokio::test]
    async fn stopped_queue_refuses_work() {
        let (_sink, queue) = queue_with(fast_config(), Arc::new(SystemClock));
        queue
            .register_processor("ok", echo(), ProcessorOptions::default())
            .unwrap();
        queue.stop_accepting();
        assert!(matches!(
            queue.enqueue(NewTask::new("ok", json!({}))).await,
            Err(SluiceError::ShuttingDown)
        ));
    }
}
