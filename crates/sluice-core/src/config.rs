//! Configuration - コンポーネントごとの設定
//!
//! すべてのフィールドに既定値があり、TOML の一部だけを書けば残りは既定値になる。
//! 時間は `*_ms` (ミリ秒) で持ち、`Duration` のアクセサを用意する。
//!
//! ```toml
//! [rate_limit]
//! window_ms = 1000
//! max_requests = 3
//!
//! [queue]
//! concurrency = 8
//!
//! [[balancer.servers]]
//! id = "render-1"
//! address = "10.0.0.5:8080"
//! weight = 3
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::SluiceError;
use crate::governance::balancer::BalancingStrategy;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SluiceConfig {
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub balancer: BalancerConfig,
    pub health_check: HealthCheckConfig,
    pub queue: QueueConfig,
}

impl SluiceConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, SluiceError> {
        let config: Self = toml::from_str(s).map_err(|e| SluiceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SluiceError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SluiceError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), SluiceError> {
        self.rate_limit.validate()?;
        self.circuit_breaker.validate()?;
        self.health_check.validate()?;
        self.queue.validate()?;
        Ok(())
    }
}

/// Sliding-window rate limiter settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Trailing window length (default: 60s).
    pub window_ms: u64,
    /// Admitted requests per key per window (default: 100).
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests: 100,
        }
    }
}

impl RateLimitConfig {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window_ms: window.as_millis() as u64,
            max_requests,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn validate(&self) -> Result<(), SluiceError> {
        if self.window_ms == 0 || self.max_requests == 0 {
            return Err(SluiceError::Config(
                "rate_limit.window_ms and rate_limit.max_requests must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit (default: 5).
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again (default: 3).
    pub success_threshold: u32,
    /// Time spent open before probing (default: 60s).
    pub timeout_ms: u64,
    /// Period of the background OPEN -> HALF_OPEN check (default: 10s).
    pub monitor_interval_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout_ms: 60_000,
            monitor_interval_ms: 10_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    fn validate(&self) -> Result<(), SluiceError> {
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(SluiceError::Config(
                "circuit_breaker thresholds must be > 0".to_string(),
            ));
        }
        if self.monitor_interval_ms == 0 {
            return Err(SluiceError::Config(
                "circuit_breaker.monitor_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl ServerConfig {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            weight: default_weight(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub strategy: BalancingStrategy,
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Probe period (default: 30s).
    pub interval_ms: u64,
    /// Per-probe timeout (default: 5s).
    pub timeout_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 5_000,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self) -> Result<(), SluiceError> {
        if self.interval_ms == 0 || self.timeout_ms == 0 {
            return Err(SluiceError::Config(
                "health_check.interval_ms and health_check.timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Thresholds checked by the queue monitor on each collection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub max_queue_depth: usize,
    /// Fraction of finished tasks that failed, in `[0, 1]`.
    pub max_failure_rate: f64,
    pub max_dead_letter: usize,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            max_queue_depth: 1_000,
            max_failure_rate: 0.1,
            max_dead_letter: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of priority levels L; valid priorities are `0..L`.
    pub priority_levels: u8,
    /// Worker loops.
    pub concurrency: usize,
    pub max_retries: u32,
    /// Base backoff; attempt n waits `retry_delay * 2^(n-1)`.
    pub retry_delay_ms: u64,
    pub default_timeout_ms: u64,
    /// Idle sleep between empty polls.
    pub poll_interval_ms: u64,
    /// Cumulative attempts after which a failed task is dead-lettered.
    pub dead_letter_max_retries: u32,
    /// Ceiling for each history store (completed, failed, dead letter, cancelled).
    pub history_limit: usize,
    pub batch_size: usize,
    pub batch_interval_ms: u64,
    pub metrics_interval_ms: u64,
    pub alert_thresholds: AlertThresholds,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            priority_levels: 4,
            concurrency: 5,
            max_retries: 3,
            retry_delay_ms: 1_000,
            default_timeout_ms: 30_000,
            poll_interval_ms: 100,
            dead_letter_max_retries: 10,
            history_limit: 1_000,
            batch_size: 10,
            batch_interval_ms: 5_000,
            metrics_interval_ms: 60_000,
            alert_thresholds: AlertThresholds::default(),
        }
    }
}

impl QueueConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    pub fn validate(&self) -> Result<(), SluiceError> {
        if self.priority_levels == 0 {
            return Err(SluiceError::Config("queue.priority_levels must be > 0".to_string()));
        }
        if self.concurrency == 0 {
            return Err(SluiceError::Config("queue.concurrency must be > 0".to_string()));
        }
        if self.history_limit == 0 || self.batch_size == 0 {
            return Err(SluiceError::Config(
                "queue.history_limit and queue.batch_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
