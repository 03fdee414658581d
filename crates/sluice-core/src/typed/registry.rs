//! Typed registration on the queue.

use std::sync::Arc;

use super::handler::{Handler, TypedProcessor};
use super::task::TaskKind;
use crate::error::SluiceError;
use crate::queue::{PriorityTaskQueue, ProcessorOptions};

impl PriorityTaskQueue {
    /// Register `handler` for `T::TYPE`.
    ///
    /// ```ignore
    /// queue.register_typed::<RenderChart, _>(ChartHandler, ProcessorOptions::default())?;
    /// queue.enqueue(typed::encode(&RenderChart { .. })?).await?;
    /// ```
    pub fn register_typed<T, H>(&self, handler: H, options: ProcessorOptions) -> Result<(), SluiceError>
    where
        T: TaskKind,
        H: Handler<T> + 'static,
    {
        self.register_processor(
            T::task_type(),
            Arc::new(TypedProcessor::<T, H>::new(handler)),
            options,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::config::QueueConfig;
    use crate::domain::{Task, TaskStatus};
    use crate::error::SluiceError;
    use crate::impls::NoopEventSink;
    use crate::ports::SystemClock;
    use crate::queue::{PriorityTaskQueue, ProcessorOptions};
    use crate::typed::task::fixtures::{ExportReport, RenderChart};
    use crate::typed::{Handler, TaskKind, encode};

    struct ChartHandler;

    #[async_trait]
    impl Handler<RenderChart> for ChartHandler {
        async fn handle(&self, chart: RenderChart, _task: &Task) -> Result<serde_json::Value, SluiceError> {
            Ok(json!(chart.width * 2))
        }
    }

    struct ReportHandler;

    #[async_trait]
    impl Handler<ExportReport> for ReportHandler {
        async fn handle(&self, report: ExportReport, _task: &Task) -> Result<serde_json::Value, SluiceError> {
            Ok(json!(report.labels.len()))
        }
    }

    fn queue() -> PriorityTaskQueue {
        PriorityTaskQueue::new(
            QueueConfig::default(),
            Arc::new(SystemClock),
            Arc::new(NoopEventSink),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn typed_round_trip_through_queue() {
        let queue = queue();
        queue
            .register_typed::<RenderChart, _>(ChartHandler, ProcessorOptions::default())
            .unwrap();
        queue
            .register_typed::<ExportReport, _>(ReportHandler, ProcessorOptions::default())
            .unwrap();

        let mut types: Vec<String> = queue
            .registered_types()
            .iter()
            .map(|t| t.to_string())
            .collect();
        types.sort();
        assert_eq!(types, vec![RenderChart::TYPE, ExportReport::TYPE]);

        let id = queue
            .enqueue(
                encode(&RenderChart {
                    dataset: "d".into(),
                    width: 21,
                })
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(queue.process_next().await, Some(id));
        let task = queue.get_task_status(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(json!(42)));
    }

    #[test]
    fn double_typed_registration_is_rejected() {
        let queue = queue();
        queue
            .register_typed::<RenderChart, _>(ChartHandler, ProcessorOptions::default())
            .unwrap();
        let err = queue
            .register_typed::<RenderChart, _>(ChartHandler, ProcessorOptions::default())
            .unwrap_err();
        assert!(matches!(err, SluiceError::DuplicateProcessor(_)));
    }
}
