//! Priority task queue: levels, retries, batching and background loops.
//!
//! 状態遷移はすべて queue 内で完結する。processor は結果を返すだけで、
//! retry / dead letter の判断は queue 側が行う。

mod batch;
mod history;
mod levels;
mod monitor;
mod processor;
mod record;
mod retry;
mod task_queue;
mod worker;

pub use monitor::check_thresholds;
pub use processor::{BatchProcessor, FnProcessor, Processor, ProcessorOptions, processor_fn};
pub use retry::RetryPolicy;
pub use task_queue::PriorityTaskQueue;
pub use worker::QueueHandle;
