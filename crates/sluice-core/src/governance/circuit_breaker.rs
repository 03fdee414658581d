//! Circuit breaker - 不健全な依存先への呼び出しを即座に失敗させる
//!
//! # 状態遷移
//! ```text
//! Closed   -> Open     : 連続失敗が failure_threshold に達した
//! Open     -> HalfOpen : 最後の失敗から timeout 経過（次の呼び出し時 or monitor）
//! HalfOpen -> Closed   : 連続 success_threshold 回成功
//! HalfOpen -> Open     : 1 回でも失敗
//! ```
//!
//! 状態は Mutex で保護し、operation の実行中はロックを持たない。

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::domain::Event;
use crate::error::SluiceError;
use crate::ports::clock::{self, Clock};
use crate::ports::EventSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Raised instead of invoking the operation while the circuit is open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit '{name}' is open (failures: {failures}, retry in {retry_in:?})")]
pub struct CircuitOpenError {
    pub name: String,
    pub failures: u32,
    /// Time left until the breaker will let a probe through.
    pub retry_in: Duration,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure: Option<DateTime<Utc>>,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            events,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                last_failure: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying a due OPEN -> HALF_OPEN transition first.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        let change = self.maybe_half_open(&mut inner);
        let state = inner.state;
        drop(inner);
        self.announce(change);
        state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().failures
    }

    /// Run `operation` through the breaker.
    ///
    /// While OPEN the operation is never invoked and `CircuitOpen` is returned.
    /// Any `Err` from the operation counts as a failure and is passed through.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, SluiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SluiceError>>,
    {
        self.try_acquire()?;
        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        result
    }

    /// Fail fast if OPEN; otherwise let one call through.
    pub fn try_acquire(&self) -> Result<(), CircuitOpenError> {
        let mut inner = self.lock();
        let change = self.maybe_half_open(&mut inner);
        let verdict = if inner.state == CircuitState::Open {
            let since = inner
                .last_failure
                .map(|t| clock::elapsed(t, self.clock.now()))
                .unwrap_or_default();
            Err(CircuitOpenError {
                name: self.name.clone(),
                failures: inner.failures,
                retry_in: self.config.timeout().saturating_sub(since),
            })
        } else {
            Ok(())
        };
        drop(inner);
        self.announce(change);
        verdict
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        let change = match inner.state {
            CircuitState::Closed => {
                inner.failures = 0;
                None
            }
            CircuitState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    Some(transition(&mut inner, CircuitState::Closed))
                } else {
                    None
                }
            }
            // 実行中に別の呼び出しが Open にした
            CircuitState::Open => None,
        };
        drop(inner);
        self.announce(change);
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failures += 1;
        inner.last_failure = Some(self.clock.now());
        let change = match inner.state {
            CircuitState::Closed if inner.failures >= self.config.failure_threshold => {
                Some(transition(&mut inner, CircuitState::Open))
            }
            CircuitState::HalfOpen => Some(transition(&mut inner, CircuitState::Open)),
            _ => None,
        };
        drop(inner);
        self.announce(change);
    }

    /// Periodically apply OPEN -> HALF_OPEN even without traffic.
    pub fn spawn_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.monitor_interval().max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(breaker) = weak.upgrade() else {
                    break;
                };
                breaker.state();
            }
        })
    }

    fn maybe_half_open(&self, inner: &mut BreakerState) -> Option<(CircuitState, CircuitState)> {
        if inner.state != CircuitState::Open {
            return None;
        }
        let due = inner
            .last_failure
            .map(|t| clock::elapsed(t, self.clock.now()) >= self.config.timeout())
            .unwrap_or(true);
        due.then(|| transition(inner, CircuitState::HalfOpen))
    }

    fn announce(&self, change: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = change else {
            return;
        };
        match to {
            CircuitState::Open => warn!(circuit = %self.name, %from, %to, "circuit opened"),
            _ => info!(circuit = %self.name, %from, %to, "circuit state changed"),
        }
        self.events.emit(Event::CircuitStateChanged {
            name: self.name.clone(),
            from,
            to,
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn transition(inner: &mut BreakerState, to: CircuitState) -> (CircuitState, CircuitState) {
    let from = inner.state;
    inner.state = to;
    match to {
        CircuitState::Closed => {
            inner.failures = 0;
            inner.successes = 0;
        }
        CircuitState::HalfOpen => inner.successes = 0,
        CircuitState::Open => inner.successes = 0,
    }
    (from, to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{MemoryEventSink, NoopEventSink};
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, timeout_ms: u64) -> (Arc<FixedClock>, CircuitBreaker) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let config = CircuitBreakerConfig {
            failure_threshold: threshold,
            timeout_ms,
            ..CircuitBreakerConfig::default()
        };
        let cb = CircuitBreaker::new("render", config, clock.clone(), Arc::new(NoopEventSink));
        (clock, cb)
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), SluiceError> {
        cb.execute(|| async { Err::<(), _>(SluiceError::processor("down")) })
            .await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32, SluiceError> {
        cb.execute(|| async { Ok(7) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_half_opens_without_traffic() {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let sink = Arc::new(MemoryEventSink::new());
        let cb = Arc::new(CircuitBreaker::new(
            "render",
            CircuitBreakerConfig {
                failure_threshold: 1,
                timeout_ms: 60_000,
                monitor_interval_ms: 10_000,
                ..CircuitBreakerConfig::default()
            },
            clock.clone(),
            sink.clone(),
        ));
        assert!(fail(&cb).await.is_err());

        let monitor = cb.spawn_monitor();
        clock.advance(Duration::from_millis(60_000));
        tokio::time::sleep(Duration::from_millis(10_500)).await;

        let half_opened = sink.events().into_iter().any(|e| {
            matches!(
                e,
                Event::CircuitStateChanged {
                    from: CircuitState::Open,
                    to: CircuitState::HalfOpen,
                    ..
                }
            )
        });
        assert!(half_opened);

        drop(cb);
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert!(monitor.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_monitor_interval_is_clamped() {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let sink = Arc::new(MemoryEventSink::new());
        let cb = Arc::new(CircuitBreaker::new(
            "render",
            CircuitBreakerConfig {
                failure_threshold: 1,
                timeout_ms: 1_000,
                monitor_interval_ms: 0,
                ..CircuitBreakerConfig::default()
            },
            clock.clone(),
            sink.clone(),
        ));
        assert!(fail(&cb).await.is_err());

        let monitor = cb.spawn_monitor();
        clock.advance(Duration::from_millis(1_000));
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(!monitor.is_finished());
        assert!(sink.events().into_iter().any(|e| matches!(
            e,
            Event::CircuitStateChanged {
                to: CircuitState::HalfOpen,
                ..
            }
        )));
        monitor.abort();
    }

    #[tokio::test]
    async fn opens_after_threshold_and_fails_fast() {
        let (_clock, cb) = breaker(5, 60_000);
        for _ in 0..4 {
            assert!(fail(&cb).await.is_err());
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let err = cb
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SluiceError::CircuitOpen(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn success_resets_failure_run() {
        let (_clock, cb) = breaker(3, 60_000);
        fail(&cb).await.ok();
        fail(&cb).await.ok();
        succeed(&cb).await.unwrap();
        fail(&cb).await.ok();
        fail(&cb).await.ok();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 2);
    }

    #[tokio::test]
    async fn half_open_closes_after_three_successes() {
        let (clock, cb) = breaker(2, 1_000);
        fail(&cb).await.ok();
        fail(&cb).await.ok();
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_millis(1_000));
        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let (clock, cb) = breaker(1, 1_000);
        fail(&cb).await.ok();
        clock.advance(Duration::from_millis(1_500));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        fail(&cb).await.ok();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(succeed(&cb).await, Err(SluiceError::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn open_error_reports_remaining_wait() {
        let (clock, cb) = breaker(1, 10_000);
        fail(&cb).await.ok();
        clock.advance(Duration::from_millis(4_000));
        let err = cb.try_acquire().unwrap_err();
        assert_eq!(err.retry_in, Duration::from_millis(6_000));
        assert_eq!(err.failures, 1);
    }

    #[tokio::test]
    async fn state_changes_are_published() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let sink = Arc::new(MemoryEventSink::new());
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            timeout_ms: 10,
            ..CircuitBreakerConfig::default()
        };
        let cb = CircuitBreaker::new("db", config, clock.clone(), sink.clone());

        fail(&cb).await.ok();
        clock.advance(Duration::from_millis(10));
        cb.state();

        let changes: Vec<_> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::CircuitStateChanged { from, to, .. } => Some((from, to)),
                _ => None,
            })
            .collect();
        assert_eq!(
            changes,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
            ]
        );
    }
}
