//! Load balancer over a health-checked server pool.
//!
//! - 選択アルゴリズムは `BalancingStrategy` で切り替え（同時に 1 つ）
//! - healthy フラグを変えるのは HealthChecker と `set_server_health`（手動）だけ
//! - 接続数・リクエスト数・失敗数は atomic カウンタでリクエスト経路が更新

mod health;
mod strategy;

pub use health::HealthChecker;
pub use strategy::BalancingStrategy;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::{BalancerConfig, ServerConfig};
use crate::domain::Event;
use crate::error::SluiceError;
use crate::governance::RequestContext;
use crate::observability::ServerSnapshot;
use crate::ports::{Clock, EventSink};

/// A backend server. Shared between the pool, in-flight guards and the prober.
#[derive(Debug)]
pub struct Server {
    id: String,
    address: String,
    weight: u32,
    current_connections: AtomicU32,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    healthy: AtomicBool,
    last_health_check: Mutex<Option<DateTime<Utc>>>,
    last_response_time: Mutex<Option<Duration>>,
}

impl Server {
    pub(crate) fn from_config(config: &ServerConfig) -> Self {
        Self {
            id: config.id.clone(),
            address: config.address.clone(),
            weight: config.weight,
            current_connections: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
            last_health_check: Mutex::new(None),
            last_response_time: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn current_connections(&self) -> u32 {
        self.current_connections.load(Ordering::Acquire)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            id: self.id.clone(),
            address: self.address.clone(),
            weight: self.weight,
            current_connections: self.current_connections(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            healthy: self.is_healthy(),
            last_health_check: *self
                .last_health_check
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            last_response_time_ms: self
                .last_response_time
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .map(|d| d.as_millis() as u64),
        }
    }

    pub(crate) fn acquire_connection(&self) {
        self.current_connections.fetch_add(1, Ordering::AcqRel);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    fn release_connection(&self, response_time: Option<Duration>) {
        // 0 未満にはしない
        let _ = self
            .current_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if let Some(rt) = response_time {
            self.set_response_time(rt);
        }
    }

    fn set_response_time(&self, rt: Duration) {
        *self
            .last_response_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(rt);
    }

    /// Returns the previous health value.
    fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::AcqRel)
    }
}

/// Holds one connection slot; dropping it releases the slot.
#[derive(Debug)]
pub struct ServerGuard {
    server: Arc<Server>,
    started: Instant,
}

impl ServerGuard {
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        self.server.release_connection(Some(self.started.elapsed()));
    }
}

pub struct LoadBalancer {
    servers: RwLock<Vec<Arc<Server>>>,
    strategy: RwLock<BalancingStrategy>,
    cursor: AtomicUsize,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl LoadBalancer {
    pub fn new(
        config: &BalancerConfig,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, SluiceError> {
        let lb = Self {
            servers: RwLock::new(Vec::new()),
            strategy: RwLock::new(config.strategy),
            cursor: AtomicUsize::new(0),
            clock,
            events,
        };
        for server in &config.servers {
            lb.add_server(server.clone())?;
        }
        Ok(lb)
    }

    pub fn strategy(&self) -> BalancingStrategy {
        *self.strategy.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_strategy(&self, strategy: BalancingStrategy) {
        *self.strategy.write().unwrap_or_else(PoisonError::into_inner) = strategy;
        info!(?strategy, "balancing strategy changed");
    }

    pub fn add_server(&self, config: ServerConfig) -> Result<(), SluiceError> {
        let mut servers = self.servers.write().unwrap_or_else(PoisonError::into_inner);
        if servers.iter().any(|s| s.id == config.id) {
            return Err(SluiceError::DuplicateServer(config.id));
        }
        info!(server = %config.id, address = %config.address, weight = config.weight, "server added");
        servers.push(Arc::new(Server::from_config(&config)));
        Ok(())
    }

    pub fn remove_server(&self, id: &str) -> Result<(), SluiceError> {
        let mut servers = self.servers.write().unwrap_or_else(PoisonError::into_inner);
        let before = servers.len();
        servers.retain(|s| s.id != id);
        if servers.len() == before {
            return Err(SluiceError::ServerNotFound(id.to_string()));
        }
        info!(server = %id, "server removed");
        Ok(())
    }

    pub fn server(&self, id: &str) -> Option<Arc<Server>> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    pub fn servers(&self) -> Vec<ServerSnapshot> {
        self.all().iter().map(|s| s.snapshot()).collect()
    }

    pub fn healthy_count(&self) -> usize {
        self.all().iter().filter(|s| s.is_healthy()).count()
    }

    /// Pick a healthy server and count one open connection on it.
    ///
    /// The caller must pair this with `release`; `acquire` does it automatically.
    pub fn select_server(&self, ctx: Option<&RequestContext>) -> Result<Arc<Server>, SluiceError> {
        let healthy: Vec<Arc<Server>> = self
            .all()
            .into_iter()
            .filter(|s| s.is_healthy())
            .collect();
        if healthy.is_empty() {
            return Err(SluiceError::NoHealthyServer);
        }

        let chosen = match (self.strategy(), ctx) {
            (BalancingStrategy::RoundRobin, _) => self.next_round_robin(&healthy),
            (BalancingStrategy::LeastConnections, _) => strategy::least_connections(&healthy),
            (BalancingStrategy::Weighted, _) => {
                match strategy::weighted(&healthy, &mut rand::thread_rng()) {
                    Some(server) => server,
                    None => self.next_round_robin(&healthy),
                }
            }
            (BalancingStrategy::KeyHash, Some(ctx)) => strategy::key_hash(&healthy, ctx.hash_key()),
            (BalancingStrategy::KeyHash, None) => self.next_round_robin(&healthy),
        };
        chosen.acquire_connection();
        Ok(Arc::clone(chosen))
    }

    /// `select_server` with a scoped release.
    pub fn acquire(&self, ctx: Option<&RequestContext>) -> Result<ServerGuard, SluiceError> {
        let server = self.select_server(ctx)?;
        Ok(ServerGuard {
            server,
            started: Instant::now(),
        })
    }

    pub fn release(&self, server: &Server, response_time: Option<Duration>) {
        server.release_connection(response_time);
    }

    /// Counts a failed call. Health is left to the prober.
    pub fn record_failure(&self, server: &Server, error: &SluiceError) {
        let failures = server.total_failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(server = %server.id, failures, %error, "request to server failed");
    }

    /// Manual override of the health flag.
    pub fn set_server_health(&self, id: &str, healthy: bool) -> Result<(), SluiceError> {
        let server = self
            .server(id)
            .ok_or_else(|| SluiceError::ServerNotFound(id.to_string()))?;
        self.apply_health(&server, healthy);
        Ok(())
    }

    /// Record a probe outcome.
    pub(crate) fn record_probe(&self, server: &Server, healthy: bool, response_time: Option<Duration>) {
        *server
            .last_health_check
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(self.clock.now());
        if let Some(rt) = response_time {
            server.set_response_time(rt);
        }
        self.apply_health(server, healthy);
    }

    pub(crate) fn all(&self) -> Vec<Arc<Server>> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn apply_health(&self, server: &Server, healthy: bool) {
        let was = server.set_healthy(healthy);
        if was == healthy {
            return;
        }
        if healthy {
            info!(server = %server.id, "server marked healthy");
        } else {
            warn!(server = %server.id, "server marked unhealthy");
        }
        self.events.emit(Event::ServerHealthChanged {
            server_id: server.id.clone(),
            healthy,
        });
    }

    fn next_round_robin<'a>(&self, healthy: &'a [Arc<Server>]) -> &'a Arc<Server> {
        let cursor = self.cursor.fetch_add(1, Ordering::Relaxed);
        strategy::round_robin(healthy, cursor)
    }
}
