//! Selection algorithms over the healthy subset.
//!
//! どの関数も空でない `healthy` を前提にする（空チェックは LoadBalancer 側）。

use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::Server;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancingStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
    Weighted,
    /// Stable hash of a caller key; alias `ip_hash`.
    #[serde(alias = "ip_hash")]
    KeyHash,
}

pub(crate) fn round_robin(healthy: &[Arc<Server>], cursor: usize) -> &Arc<Server> {
    &healthy[cursor % healthy.len()]
}

/// Smallest open-connection count; ties go to the earliest server.
pub(crate) fn least_connections(healthy: &[Arc<Server>]) -> &Arc<Server> {
    let mut best = &healthy[0];
    for server in &healthy[1..] {
        if server.current_connections() < best.current_connections() {
            best = server;
        }
    }
    best
}

/// Uniform draw in `[0, total_weight)` walked over cumulative weights.
/// `None` when every weight is zero.
pub(crate) fn weighted<'a, R: Rng>(
    healthy: &'a [Arc<Server>],
    rng: &mut R,
) -> Option<&'a Arc<Server>> {
    let total: u64 = healthy.iter().map(|s| u64::from(s.weight())).sum();
    if total == 0 {
        return None;
    }
    let mut point = rng.gen_range(0..total);
    for server in healthy {
        let w = u64::from(server.weight());
        if point < w {
            return Some(server);
        }
        point -= w;
    }
    None
}

pub(crate) fn key_hash<'a>(healthy: &'a [Arc<Server>], key: &str) -> &'a Arc<Server> {
    let idx = (fnv1a(key.as_bytes()) % healthy.len() as u64) as usize;
    &healthy[idx]
}

/// FNV-1a 64-bit. Stable across processes and releases, unlike `DefaultHasher`.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}
