//! sluice-core
//!
//! Admission control and asynchronous task execution for a backend that
//! fronts an expensive generation pipeline.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, state, events）
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator, EventSink, HealthProbe）
//! - **impls**: ports の実装（event sinks, TCP probe）
//! - **governance**: rate limiter, circuit breaker, load balancer, request governor
//! - **queue**: priority task queue（retry, batch, workers, monitor）
//! - **typed**: 型付き Task API（TaskKind, Handler, TypedProcessor）
//! - **config / error / observability**: 設定・エラー・メトリクス

pub mod config;
pub mod domain;
pub mod error;
pub mod governance;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod typed;

pub use config::SluiceConfig;
pub use error::SluiceError;
pub use governance::{CircuitBreaker, LoadBalancer, RequestGovernor, SlidingWindowRateLimiter};
pub use queue::{PriorityTaskQueue, QueueHandle};
