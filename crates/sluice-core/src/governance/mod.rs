//! Governance - inbound request admission
//!
//! - **SlidingWindowRateLimiter**: キー単位の流量制限
//! - **CircuitBreaker**: 不健全な依存先を fail fast
//! - **LoadBalancer / HealthChecker**: health-aware なサーバー選択
//! - **RequestGovernor**: 上記を 1 本のパイプラインに合成

pub mod balancer;
pub mod circuit_breaker;
pub mod context;
pub mod governor;
pub mod rate_limit;

pub use self::balancer::{BalancingStrategy, HealthChecker, LoadBalancer, Server, ServerGuard};
pub use self::circuit_breaker::{CircuitBreaker, CircuitOpenError, CircuitState};
pub use self::context::RequestContext;
pub use self::governor::{
    Governed, RateLimitHeaders, Rejection, RejectionStatus, RequestGovernor, ResponseMetadata,
    Submitted,
};
pub use self::rate_limit::{Admission, SlidingWindowRateLimiter};
