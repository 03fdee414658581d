//! HealthProbe port - バックエンドサーバーの死活確認

use std::time::Duration;

use async_trait::async_trait;

use crate::error::SluiceError;
use crate::observability::ServerSnapshot;

/// Probes one backend. The caller bounds each call with its own timeout.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Returns the observed response time on success.
    async fn probe(&self, server: &ServerSnapshot) -> Result<Duration, SluiceError>;
}
