//! Background loops for a running queue.
//!
//! `start()` で以下を spawn する
//! - worker x `concurrency`: `process_next()` を回し、空なら notify / poll / shutdown を待つ
//! - batch loop: `batch_interval` ごとに `process_batches()`
//! - monitor loop: `metrics_interval` ごとに `collect_metrics()`
//!
//! 各ループは `Weak` で queue を参照するので、queue が drop されれば自然に終わる。

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::task_queue::PriorityTaskQueue;
use crate::ports::clock;

/// Handle to the loops spawned by [`PriorityTaskQueue::start`].
/// - `request_shutdown()` で新しい claim を止める (実行中のタスクは最後まで走る)
/// - `shutdown_and_join()` で全ループの終了を待つ
pub struct QueueHandle {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    queue: Weak<PriorityTaskQueue>,
}

impl QueueHandle {
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop accepting work, signal every loop and wait for them to exit.
    pub async fn shutdown_and_join(self) {
        if let Some(queue) = self.queue.upgrade() {
            queue.stop_accepting();
        }
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
        info!("queue stopped");
    }
}

impl PriorityTaskQueue {
    /// Spawn the worker, batch and monitor loops.
    pub fn start(self: &Arc<Self>) -> QueueHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = self.config.concurrency.max(1);
        let mut joins = Vec::with_capacity(workers + 2);

        for worker_id in 0..workers {
            let queue = Arc::downgrade(self);
            let rx = shutdown_rx.clone();
            joins.push(tokio::spawn(worker_loop(worker_id, queue, rx)));
        }
        joins.push(tokio::spawn(ticker_loop(
            "batch",
            Arc::downgrade(self),
            self.config.batch_interval(),
            shutdown_rx.clone(),
            |q| async move {
                q.process_batches().await;
            },
        )));
        joins.push(tokio::spawn(ticker_loop(
            "monitor",
            Arc::downgrade(self),
            self.config.metrics_interval(),
            shutdown_rx,
            |q| async move {
                q.collect_metrics().await;
            },
        )));

        info!(workers, "queue started");
        QueueHandle {
            shutdown_tx,
            joins,
            queue: Arc::downgrade(self),
        }
    }

    /// How long an idle worker may sleep before polling again.
    async fn idle_wait(&self) -> Duration {
        let poll = self.config.poll_interval();
        let now = self.clock.now();
        match self.next_due().await {
            Some(due) if due > now => clock::elapsed(now, due).min(poll),
            // due だが claim できない（型の同時実行数が埋まっている）: 解放の notify か poll を待つ
            _ => poll,
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Weak<PriorityTaskQueue>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(worker_id, "worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let Some(q) = queue.upgrade() else {
            break;
        };
        if q.process_next().await.is_some() {
            continue;
        }

        let wait = q.idle_wait().await;
        let woken = async {
            tokio::select! {
                _ = q.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        };
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = woken => {}
        }
    }
    debug!(worker_id, "worker stopped");
}

async fn ticker_loop<F, Fut>(
    name: &'static str,
    queue: Weak<PriorityTaskQueue>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    tick: F,
) where
    F: Fn(Arc<PriorityTaskQueue>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                let Some(q) = queue.upgrade() else {
                    break;
                };
                tick(q).await;
            }
        }
    }
    debug!(loop_name = name, "loop stopped");
}
