//! Processors - task_type ごとの実行ロジック
//!
//! # 学習ポイント
//! - object-safe な async trait (`Processor`, `BatchProcessor`)
//! - 登録は初期化時に行い、実行時は `Arc` を clone して使う

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::config::QueueConfig;
use crate::domain::{Task, TaskType};
use crate::error::SluiceError;

/// Executes one task. The returned value is stored as the task result.
///
/// The queue guarantees at most one concurrent call per task instance and
/// bounds each call with the task's timeout.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, task: &Task) -> Result<serde_json::Value, SluiceError>;
}

/// Executes a group of same-type tasks in one call.
///
/// `Ok` must hold one outcome per input task, in order. An `Err` (or a length
/// mismatch) sends every member back for individual retry.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process_batch(
        &self,
        tasks: &[Task],
    ) -> Result<Vec<Result<serde_json::Value, String>>, SluiceError>;
}

/// Adapter so an async closure can be registered as a processor.
pub struct FnProcessor<F>(F);

/// ```ignore
/// queue.register_processor(
///     "viz.render",
///     processor_fn(|task| async move { Ok(json!({ "id": task.id.to_string() })) }),
///     ProcessorOptions::default(),
/// )?;
/// ```
pub fn processor_fn<F, Fut>(f: F) -> Arc<FnProcessor<F>>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, SluiceError>> + Send + 'static,
{
    Arc::new(FnProcessor(f))
}

#[async_trait]
impl<F, Fut> Processor for FnProcessor<F>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, SluiceError>> + Send + 'static,
{
    async fn process(&self, task: &Task) -> Result<serde_json::Value, SluiceError> {
        (self.0)(task.clone()).await
    }
}

/// Per-type overrides. `None` falls back to the queue defaults.
#[derive(Clone, Default)]
pub struct ProcessorOptions {
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    /// Max simultaneous executions of this type.
    pub concurrency: Option<usize>,
    pub batch: Option<Arc<dyn BatchProcessor>>,
}

impl ProcessorOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = Some(n);
        self
    }

    pub fn with_batch(mut self, batch: Arc<dyn BatchProcessor>) -> Self {
        self.batch = Some(batch);
        self
    }
}

impl std::fmt::Debug for ProcessorOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorOptions")
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("concurrency", &self.concurrency)
            .field("batch", &self.batch.is_some())
            .finish()
    }
}

/// Resolved registration for one task type.
#[derive(Clone)]
pub(crate) struct Registration {
    pub processor: Arc<dyn Processor>,
    pub batch: Option<Arc<dyn BatchProcessor>>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub permits: Option<Arc<Semaphore>>,
}

/// Registry of processors (task_type -> registration).
///
/// Registrations are immutable once made.
#[derive(Default)]
pub(crate) struct ProcessorRegistry {
    entries: RwLock<HashMap<TaskType, Registration>>,
}

impl ProcessorRegistry {
    pub fn register(
        &self,
        task_type: TaskType,
        processor: Arc<dyn Processor>,
        options: ProcessorOptions,
        defaults: &QueueConfig,
    ) -> Result<(), SluiceError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&task_type) {
            return Err(SluiceError::DuplicateProcessor(task_type));
        }
        let registration = Registration {
            processor,
            batch: options.batch,
            timeout: options.timeout.unwrap_or_else(|| defaults.default_timeout()),
            max_retries: options.max_retries.unwrap_or(defaults.max_retries),
            retry_delay: options.retry_delay.unwrap_or_else(|| defaults.retry_delay()),
            permits: options
                .concurrency
                .map(|n| Arc::new(Semaphore::new(n.max(1)))),
        };
        entries.insert(task_type, registration);
        Ok(())
    }

    pub fn get(&self, task_type: &TaskType) -> Option<Registration> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_type)
            .cloned()
    }

    pub fn registered_types(&self) -> Vec<TaskType> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}
