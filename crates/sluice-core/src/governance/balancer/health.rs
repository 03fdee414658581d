//! Active health checking for the server pool.
//!
//! 全サーバーを並行に probe する。1 台の失敗・タイムアウトは他の probe に影響しない。

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::LoadBalancer;
use crate::config::HealthCheckConfig;
use crate::error::SluiceError;
use crate::ports::HealthProbe;

pub struct HealthChecker {
    balancer: Weak<LoadBalancer>,
    probe: Arc<dyn HealthProbe>,
    config: HealthCheckConfig,
}

impl HealthChecker {
    pub fn new(
        balancer: &Arc<LoadBalancer>,
        probe: Arc<dyn HealthProbe>,
        config: HealthCheckConfig,
    ) -> Self {
        Self {
            balancer: Arc::downgrade(balancer),
            probe,
            config,
        }
    }

    /// Probe every server once and apply the results. Returns how many are healthy.
    pub async fn check_all(&self) -> usize {
        let Some(balancer) = self.balancer.upgrade() else {
            return 0;
        };
        let servers = balancer.all();
        let timeout = self.config.timeout();

        let checks = servers.iter().map(|server| {
            let probe = Arc::clone(&self.probe);
            let snapshot = server.snapshot();
            async move {
                match tokio::time::timeout(timeout, probe.probe(&snapshot)).await {
                    Ok(result) => result,
                    Err(_) => Err(SluiceError::Probe(format!(
                        "{} timed out after {timeout:?}",
                        snapshot.address
                    ))),
                }
            }
        });
        let results = join_all(checks).await;

        let mut healthy = 0;
        for (server, result) in servers.iter().zip(results) {
            match result {
                Ok(rt) => {
                    debug!(server = %server.id(), ?rt, "health probe ok");
                    balancer.record_probe(server, true, Some(rt));
                    healthy += 1;
                }
                Err(e) => {
                    warn!(server = %server.id(), error = %e, "health probe failed");
                    balancer.record_probe(server, false, None);
                }
            }
        }
        healthy
    }

    /// Probe on every interval tick until the balancer is dropped.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval().max(Duration::from_millis(1)));
            loop {
                interval.tick().await;
                if self.balancer.strong_count() == 0 {
                    break;
                }
                self.check_all().await;
            }
        })
    }

    pub fn interval(&self) -> Duration {
        self.config.interval()
    }
}
