//! RequestGovernor - admission pipeline for inbound requests
//!
//! rate limit -> server selection -> circuit breaker の順に通す。
//! 接続数は `ServerGuard` で管理するので、operation が失敗しても必ず解放される。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::balancer::{HealthChecker, LoadBalancer, Server};
use super::circuit_breaker::CircuitBreaker;
use super::context::RequestContext;
use super::rate_limit::{Admission, SlidingWindowRateLimiter};
use crate::config::{HealthCheckConfig, SluiceConfig};
use crate::domain::{NewTask, TaskId};
use crate::error::SluiceError;
use crate::ports::{Clock, EventSink, HealthProbe};
use crate::queue::PriorityTaskQueue;

/// Rate-limit state reported back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    pub reset: DateTime<Utc>,
    pub retry_after: Option<Duration>,
}

impl From<&Admission> for RateLimitHeaders {
    fn from(a: &Admission) -> Self {
        Self {
            limit: a.limit,
            remaining: a.remaining,
            reset: a.reset_at,
            retry_after: a.retry_after,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseMetadata {
    pub rate_limit: RateLimitHeaders,
    pub served_by: Option<String>,
}

impl ResponseMetadata {
    /// HTTP header rendering. `Retry-After` is whole seconds, rounded up.
    pub fn to_header_pairs(&self) -> Vec<(&'static str, String)> {
        let rl = &self.rate_limit;
        let mut headers = vec![
            ("X-RateLimit-Limit", rl.limit.to_string()),
            ("X-RateLimit-Remaining", rl.remaining.to_string()),
            ("X-RateLimit-Reset", rl.reset.timestamp().to_string()),
        ];
        if let Some(retry) = rl.retry_after {
            headers.push(("Retry-After", ceil_secs(retry).to_string()));
        }
        if let Some(server) = &self.served_by {
            headers.push(("X-Served-By", server.clone()));
        }
        headers
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RejectionStatus {
    BadRequest,
    TooManyRequests,
    BadGateway,
    ServiceUnavailable,
}

impl RejectionStatus {
    pub fn code(self) -> u16 {
        match self {
            RejectionStatus::BadRequest => 400,
            RejectionStatus::TooManyRequests => 429,
            RejectionStatus::BadGateway => 502,
            RejectionStatus::ServiceUnavailable => 503,
        }
    }
}

/// A structured refusal with a machine-readable retry hint.
#[derive(Debug, Clone, Error)]
#[error("{} {error}", .status.code())]
pub struct Rejection {
    pub status: RejectionStatus,
    pub error: SluiceError,
    pub retry_after: Option<Duration>,
    pub metadata: ResponseMetadata,
}

#[derive(Debug, Clone)]
pub struct Governed<T> {
    pub value: T,
    pub metadata: ResponseMetadata,
}

#[derive(Debug, Clone)]
pub struct Submitted {
    pub task_id: TaskId,
    pub metadata: ResponseMetadata,
}

/// Background loops spawned by [`RequestGovernor::start`].
/// 各ループは対象を `Weak` で持つので、governor を drop しても止まる。
pub struct GovernorHandle {
    joins: Vec<JoinHandle<()>>,
}

impl GovernorHandle {
    /// Abort the sweeper, the breaker monitor and the health checker.
    pub async fn shutdown(self) {
        for join in &self.joins {
            join.abort();
        }
        for join in self.joins {
            let _ = join.await;
        }
        info!("governor loops stopped");
    }
}

pub struct RequestGovernor {
    limiter: Arc<SlidingWindowRateLimiter>,
    balancer: Arc<LoadBalancer>,
    breaker: Arc<CircuitBreaker>,
    queue: Option<Arc<PriorityTaskQueue>>,
    /// Probe period and timeout; the interval doubles as the retry hint when
    /// no server is healthy.
    health_check: HealthCheckConfig,
}

impl RequestGovernor {
    pub fn new(
        limiter: Arc<SlidingWindowRateLimiter>,
        balancer: Arc<LoadBalancer>,
        breaker: Arc<CircuitBreaker>,
        health_check: HealthCheckConfig,
    ) -> Self {
        Self {
            limiter,
            balancer,
            breaker,
            queue: None,
            health_check,
        }
    }

    /// Spawn the rate-limit sweeper, the breaker monitor and a health checker
    /// probing the pool with `probe`.
    pub fn start(&self, probe: Arc<dyn HealthProbe>) -> GovernorHandle {
        let checker = HealthChecker::new(&self.balancer, probe, self.health_check.clone());
        let joins = vec![
            self.limiter.spawn_sweeper(),
            self.breaker.spawn_monitor(),
            checker.spawn(),
        ];
        info!(
            servers = self.balancer.servers().len(),
            health_interval = ?self.health_check.interval(),
            "governor loops started"
        );
        GovernorHandle { joins }
    }

    pub fn from_config(
        config: &SluiceConfig,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, SluiceError> {
        config.validate()?;
        let limiter = SlidingWindowRateLimiter::new(config.rate_limit.clone(), Arc::clone(&clock));
        let balancer = LoadBalancer::new(&config.balancer, Arc::clone(&clock), Arc::clone(&events))?;
        let breaker = CircuitBreaker::new("backend", config.circuit_breaker.clone(), clock, events);
        Ok(Self::new(
            Arc::new(limiter),
            Arc::new(balancer),
            Arc::new(breaker),
            config.health_check.clone(),
        ))
    }

    pub fn with_queue(mut self, queue: Arc<PriorityTaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn limiter(&self) -> &Arc<SlidingWindowRateLimiter> {
        &self.limiter
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Synchronous path: admit, pick a server and run `op` against it.
    pub async fn call<T, F, Fut>(&self, ctx: &RequestContext, op: F) -> Result<Governed<T>, Rejection>
    where
        F: FnOnce(Arc<Server>) -> Fut,
        Fut: Future<Output = Result<T, SluiceError>>,
    {
        let mut metadata = self.admit(ctx)?;

        let guard = self.balancer.acquire(Some(ctx)).map_err(|error| {
            warn!(client = %ctx.client_key, %error, "no backend available");
            Rejection {
                status: RejectionStatus::ServiceUnavailable,
                error,
                retry_after: Some(self.health_check.interval()),
                metadata: metadata.clone(),
            }
        })?;
        let server = Arc::clone(guard.server());
        metadata.served_by = Some(server.id().to_string());

        let result = self.breaker.execute(|| op(Arc::clone(&server))).await;
        drop(guard);

        match result {
            Ok(value) => Ok(Governed { value, metadata }),
            Err(SluiceError::CircuitOpen(open)) => {
                debug!(circuit = %open.name, retry_in = ?open.retry_in, "request short-circuited");
                Err(Rejection {
                    status: RejectionStatus::ServiceUnavailable,
                    retry_after: Some(open.retry_in),
                    error: SluiceError::CircuitOpen(open),
                    metadata,
                })
            }
            Err(error) => {
                self.balancer.record_failure(&server, &error);
                Err(Rejection {
                    status: RejectionStatus::BadGateway,
                    error,
                    retry_after: None,
                    metadata,
                })
            }
        }
    }

    /// Asynchronous path: admit, then hand the work to the task queue.
    pub async fn submit(&self, ctx: &RequestContext, task: NewTask) -> Result<Submitted, Rejection> {
        let metadata = self.admit(ctx)?;
        let Some(queue) = &self.queue else {
            return Err(Rejection {
                status: RejectionStatus::ServiceUnavailable,
                error: SluiceError::ShuttingDown,
                retry_after: None,
                metadata,
            });
        };
        match queue.enqueue(task).await {
            Ok(task_id) => Ok(Submitted { task_id, metadata }),
            Err(error) => {
                let status = match error {
                    SluiceError::ShuttingDown => RejectionStatus::ServiceUnavailable,
                    _ => RejectionStatus::BadRequest,
                };
                Err(Rejection {
                    status,
                    error,
                    retry_after: None,
                    metadata,
                })
            }
        }
    }

    fn admit(&self, ctx: &RequestContext) -> Result<ResponseMetadata, Rejection> {
        let admission = self.limiter.check(&ctx.client_key);
        let metadata = ResponseMetadata {
            rate_limit: RateLimitHeaders::from(&admission),
            served_by: None,
        };
        if admission.allowed {
            return Ok(metadata);
        }
        let retry_after = admission.retry_after.unwrap_or(Duration::from_millis(1));
        debug!(client = %ctx.client_key, ?retry_after, "request rate limited");
        Err(Rejection {
            status: RejectionStatus::TooManyRequests,
            error: SluiceError::RateLimitExceeded { retry_after },
            retry_after: Some(retry_after),
            metadata,
        })
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_millis().div_ceil(1_000) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BalancerConfig, CircuitBreakerConfig, RateLimitConfig, ServerConfig};
    use crate::governance::BalancingStrategy;
    use crate::impls::NoopEventSink;
    use crate::ports::FixedClock;
    use chrono::TimeZone;

    fn governor(max_requests: u32, servers: usize) -> (Arc<FixedClock>, RequestGovernor) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let config = SluiceConfig {
            rate_limit: RateLimitConfig::new(Duration::from_millis(1_000), max_requests),
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 2,
                timeout_ms: 5_000,
                ..CircuitBreakerConfig::default()
            },
            balancer: BalancerConfig {
                strategy: BalancingStrategy::RoundRobin,
                servers: (1..=servers)
                    .map(|i| ServerConfig::new(format!("s{i}"), format!("10.0.0.{i}:80")))
                    .collect(),
            },
            ..SluiceConfig::default()
        };
        let gov = RequestGovernor::from_config(&config, clock.clone(), Arc::new(NoopEventSink))
            .unwrap();
        (clock, gov)
    }

    async fn echo(gov: &RequestGovernor, ctx: &RequestContext) -> Result<Governed<String>, Rejection> {
        gov.call(ctx, |server| async move { Ok(server.id().to_string()) })
            .await
    }

    #[tokio::test]
    async fn admitted_call_reports_server_and_quota() {
        let (_clock, gov) = governor(3, 2);
        let ctx = RequestContext::new("client-1");

        let out = echo(&gov, &ctx).await.unwrap();
        assert_eq!(out.value, "s1");
        assert_eq!(out.metadata.served_by.as_deref(), Some("s1"));
        assert_eq!(out.metadata.rate_limit.remaining, 2);

        let headers = out.metadata.to_header_pairs();
        assert!(headers.contains(&("X-RateLimit-Limit", "3".to_string())));
        assert!(headers.contains(&("X-Served-By", "s1".to_string())));
        assert!(!headers.iter().any(|(k, _)| *k == "Retry-After"));

        // 接続は解放済み
        assert!(gov.balancer().servers().iter().all(|s| s.current_connections == 0));
    }

    #[tokio::test]
    async fn over_quota_is_429_with_retry_after() {
        let (_clock, gov) = governor(1, 1);
        let ctx = RequestContext::new("client-1");
        echo(&gov, &ctx).await.unwrap();

        let rejection = echo(&gov, &ctx).await.unwrap_err();
        assert_eq!(rejection.status.code(), 429);
        assert!(matches!(rejection.error, SluiceError::RateLimitExceeded { .. }));
        assert_eq!(rejection.retry_after, Some(Duration::from_millis(1_000)));
        assert!(rejection
            .metadata
            .to_header_pairs()
            .contains(&("Retry-After", "1".to_string())));
        // server は選ばれていない
        assert_eq!(gov.balancer().servers()[0].total_requests, 1);
    }

    #[tokio::test]
    async fn no_healthy_server_is_503() {
        let (_clock, gov) = governor(10, 1);
        gov.balancer().set_server_health("s1", false).unwrap();

        let rejection = echo(&gov, &RequestContext::new("c")).await.unwrap_err();
        assert_eq!(rejection.status, RejectionStatus::ServiceUnavailable);
        assert!(matches!(rejection.error, SluiceError::NoHealthyServer));
        assert!(rejection.retry_after.is_some());
    }

    #[tokio::test]
    async fn failing_backend_opens_circuit_and_releases_connections() {
        let (_clock, gov) = governor(100, 1);
        let ctx = RequestContext::new("c");

        for _ in 0..2 {
            let rejection = gov
                .call(&ctx, |_| async { Err::<(), _>(SluiceError::processor("502 from backend")) })
                .await
                .unwrap_err();
            assert_eq!(rejection.status, RejectionStatus::BadGateway);
        }

        let rejection = echo(&gov, &ctx).await.unwrap_err();
        assert_eq!(rejection.status, RejectionStatus::ServiceUnavailable);
        assert!(matches!(rejection.error, SluiceError::CircuitOpen(_)));
        assert_eq!(rejection.retry_after, Some(Duration::from_millis(5_000)));

        let snap = &gov.balancer().servers()[0];
        assert_eq!(snap.current_connections, 0);
        assert_eq!(snap.total_failures, 2);
        // 失敗しても health は prober の管轄
        assert!(snap.healthy);
    }

    #[tokio::test]
    async fn submit_without_queue_is_unavailable() {
        let (_clock, gov) = governor(10, 1);
        let rejection = gov
            .submit(
                &RequestContext::new("c"),
                NewTask::new("render", serde_json::json!({})),
            )
            .await
            .unwrap_err();
        assert_eq!(rejection.status.code(), 503);
    }

    /// s2 は常に接続拒否
    struct RefusingProbe;

    #[async_trait::async_trait]
    impl HealthProbe for RefusingProbe {
        async fn probe(
            &self,
            server: &crate::observability::ServerSnapshot,
        ) -> Result<Duration, SluiceError> {
            if server.id == "s2" {
                return Err(SluiceError::Probe("connection refused".to_string()));
            }
            Ok(Duration::from_millis(2))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn started_loops_check_health_and_sweep_idle_clients() {
        let (clock, gov) = governor(3, 2);
        let handle = gov.start(Arc::new(RefusingProbe));

        // first health check runs on the immediate tick
        tokio::time::sleep(Duration::from_millis(10)).await;
        let snaps = gov.balancer().servers();
        assert!(snaps[0].healthy);
        assert!(!snaps[1].healthy);
        for _ in 0..3 {
            let out = echo(&gov, &RequestContext::new("client-1")).await.unwrap();
            assert_eq!(out.value, "s1");
        }
        assert_eq!(gov.limiter().tracked_keys(), 1);

        clock.advance(Duration::from_millis(1_000));
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(gov.limiter().tracked_keys(), 0);

        handle.shutdown().await;
    }

    #[test]
    fn retry_after_rounds_up() {
        assert_eq!(ceil_secs(Duration::from_millis(1)), 1);
        assert_eq!(ceil_secs(Duration::from_millis(1_000)), 1);
        assert_eq!(ceil_secs(Duration::from_millis(1_001)), 2);
    }
}
