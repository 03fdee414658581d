//! Sliding-window rate limiter.
//!
//! キーごとに直近 `window` 内のリクエスト時刻を保持し、`max_requests` を超えたら拒否する。
//! 窓は `DashMap` のエントリとして持つ。check も sweep もそのキーの shard lock の中で
//! prune / push / remove するので、同じキーに対する判定は常に直列になる。
//! 窓が空になったキーは定期 sweep で削除するので、メモリはアクティブなクライアント数に比例する。

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::ports::clock::{self, Clock};

/// Result of one admission check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Admission {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// When the oldest counted request leaves the window.
    pub reset_at: DateTime<Utc>,
    /// Set only when rejected.
    pub retry_after: Option<Duration>,
}

pub struct SlidingWindowRateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    windows: DashMap<String, VecDeque<DateTime<Utc>>>,
}

impl SlidingWindowRateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            windows: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check and, if allowed, record one request for `key`. Never fails.
    pub fn check(&self, key: &str) -> Admission {
        let span = self.config.window();
        let limit = self.config.max_requests;

        let mut stamps = self.windows.entry(key.to_string()).or_default();
        // shard lock を取ってから時刻を読む（sweep と順序が逆転しない）
        let now = self.clock.now();
        prune(&mut stamps, now, span);

        if stamps.len() >= limit as usize {
            let oldest = stamps.front().copied().unwrap_or(now);
            let reset_at = clock::add(oldest, span);
            let retry_after = clock::elapsed(now, reset_at).max(Duration::from_millis(1));
            debug!(key, count = stamps.len(), ?retry_after, "rate limit exceeded");
            return Admission {
                allowed: false,
                limit,
                remaining: 0,
                reset_at,
                retry_after: Some(retry_after),
            };
        }

        stamps.push_back(now);
        let oldest = stamps.front().copied().unwrap_or(now);
        Admission {
            allowed: true,
            limit,
            remaining: limit.saturating_sub(stamps.len() as u32),
            reset_at: clock::add(oldest, span),
            retry_after: None,
        }
    }

    /// Drop expired timestamps and forget keys with an empty window.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let span = self.config.window();
        let before = self.windows.len();
        self.windows.retain(|_, stamps| {
            prune(stamps, now, span);
            !stamps.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Sweep every `window` until the limiter is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.window().max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                let removed = limiter.sweep();
                if removed > 0 {
                    debug!(removed, "rate limiter swept idle keys");
                }
            }
        })
    }
}

fn prune(stamps: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, span: Duration) {
    while let Some(&oldest) = stamps.front() {
        if clock::elapsed(oldest, now) >= span {
            stamps.pop_front();
        } else {
            break;
        }
    }
}
