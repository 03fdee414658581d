//! TcpHealthProbe - TCP 接続できれば healthy とみなす

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::error::SluiceError;
use crate::observability::ServerSnapshot;
use crate::ports::HealthProbe;

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpHealthProbe;

#[async_trait]
impl HealthProbe for TcpHealthProbe {
    async fn probe(&self, server: &ServerSnapshot) -> Result<Duration, SluiceError> {
        let started = Instant::now();
        TcpStream::connect(server.address.as_str())
            .await
            .map_err(|e| SluiceError::Probe(format!("{}: {e}", server.address)))?;
        Ok(started.elapsed())
    }
}
