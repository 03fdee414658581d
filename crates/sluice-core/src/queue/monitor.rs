//! Queue health monitoring.

use tracing::{error, info, warn};

use super::task_queue::PriorityTaskQueue;
use crate::config::AlertThresholds;
use crate::domain::{AlertLevel, Event};
use crate::observability::QueueMetrics;

/// Threshold breaches for one metrics sample.
pub fn check_thresholds(metrics: &QueueMetrics, thresholds: &AlertThresholds) -> Vec<(AlertLevel, String)> {
    let mut alerts = Vec::new();
    if metrics.queue_depth > thresholds.max_queue_depth {
        alerts.push((
            AlertLevel::Warning,
            format!(
                "queue depth {} exceeds {}",
                metrics.queue_depth, thresholds.max_queue_depth
            ),
        ));
    }
    let failure_rate = 1.0 - metrics.success_rate;
    if failure_rate > thresholds.max_failure_rate {
        alerts.push((
            AlertLevel::Error,
            format!(
                "failure rate {:.1}% exceeds {:.1}%",
                failure_rate * 100.0,
                thresholds.max_failure_rate * 100.0
            ),
        ));
    }
    if metrics.dead_letter_size > thresholds.max_dead_letter {
        alerts.push((
            AlertLevel::Error,
            format!(
                "dead letter size {} exceeds {}",
                metrics.dead_letter_size, thresholds.max_dead_letter
            ),
        ));
    }
    alerts
}

impl PriorityTaskQueue {
    /// Take a metrics sample, publish it and raise alerts for breached thresholds.
    pub async fn collect_metrics(&self) -> QueueMetrics {
        let metrics = self.metrics().await;
        info!(
            queue_depth = metrics.queue_depth,
            in_flight = metrics.in_flight,
            throughput_per_sec = metrics.throughput_per_sec,
            success_rate = metrics.success_rate,
            dead_letter_size = metrics.dead_letter_size,
            "queue metrics"
        );
        self.events.emit(Event::MetricsCollected {
            queue_depth: metrics.queue_depth,
            in_flight: metrics.in_flight,
            throughput_per_sec: metrics.throughput_per_sec,
            success_rate: metrics.success_rate,
            dead_letter_size: metrics.dead_letter_size,
        });

        for (level, message) in check_thresholds(&metrics, &self.config.alert_thresholds) {
            match level {
                AlertLevel::Warning => warn!(alert = %message, "queue alert"),
                AlertLevel::Error => error!(alert = %message, "queue alert"),
            }
            self.events.emit(Event::QueueAlert { level, message });
        }
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn metrics(queue_depth: usize, success_rate: f64, dead_letter_size: usize) -> QueueMetrics {
        QueueMetrics {
            queue_depth,
            success_rate,
            dead_letter_size,
            ..QueueMetrics::default()
        }
    }

    #[rstest]
    #[case::healthy(metrics(10, 1.0, 0), vec![])]
    #[case::deep(metrics(1_001, 1.0, 0), vec![AlertLevel::Warning])]
    #[case::failing(metrics(0, 0.8, 0), vec![AlertLevel::Error])]
    #[case::dead_letters(metrics(0, 1.0, 101), vec![AlertLevel::Error])]
    #[case::everything(metrics(5_000, 0.0, 500), vec![AlertLevel::Warning, AlertLevel::Error, AlertLevel::Error])]
    fn thresholds(#[case] m: QueueMetrics, #[case] expected: Vec<AlertLevel>) {
        let levels: Vec<AlertLevel> = check_thresholds(&m, &AlertThresholds::default())
            .into_iter()
            .map(|(level, _)| level)
            .collect();
        assert_eq!(levels, expected);
    }

    #[tokio::test]
    async fn collection_publishes_metrics_and_alerts() {
        use crate::config::QueueConfig;
        use crate::impls::MemoryEventSink;
        use crate::ports::SystemClock;
        use std::sync::Arc;

        let sink = Arc::new(MemoryEventSink::new());
        let mut config = QueueConfig::default();
        config.alert_thresholds.max_queue_depth = 0;
        let queue = PriorityTaskQueue::new(config, Arc::new(SystemClock), sink.clone()).unwrap();
        queue
            .register_processor(
                "viz.render",
                crate::queue::processor_fn(|_| async { Ok(serde_json::json!(null)) }),
                Default::default(),
            )
            .unwrap();
        queue
            .enqueue(crate::domain::NewTask::new("viz.render", serde_json::json!({})))
            .await
            .unwrap();

        let m = queue.collect_metrics().await;
        assert_eq!(m.queue_depth, 1);

        let events = sink.events();
        assert!(events.iter().any(|e| matches!(e, Event::MetricsCollected { queue_depth: 1, .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            Event::QueueAlert { level: AlertLevel::Warning, .. }
        )));
    }
}
