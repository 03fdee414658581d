//! Serializable status views for monitoring and the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time view of the queue, produced by the monitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    /// Tasks waiting in the priority levels and the batch buffer.
    pub queue_depth: usize,
    pub in_flight: usize,
    pub completed_total: u64,
    pub failed_total: u64,
    pub retried_total: u64,
    pub dead_letter_size: usize,
    /// Completions per second since the previous collection.
    pub throughput_per_sec: f64,
    /// completed / (completed + failed); 1.0 when nothing finished yet.
    pub success_rate: f64,
    pub collected_at: Option<DateTime<Utc>>,
}

/// Copy of a server's counters. Live counters stay inside the balancer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSnapshot {
    pub id: String,
    pub address: String,
    pub weight: u32,
    pub current_connections: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub healthy: bool,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_response_time_ms: Option<u64>,
}
