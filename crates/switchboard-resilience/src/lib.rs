//! # switchboard-resilience
//!
//! Composable resilience policies for async operations.
//!
//! | Primitive | Concern |
//! |-----------|---------|
//! | [`Bulkhead`] | bounded concurrent calls plus a bounded wait queue |
//! | [`RateLimiter`] | fixed number of permits per refresh period |
//! | [`Retry`] | repeated attempts with exponential backoff |
//! | [`CircuitBreaker`] | sliding-window failure and slow-call rates |
//! | [`TimeLimiter`] | per-call deadline |
//!
//! Every primitive wraps an operation returning `Result<T, PolicyError<E>>`,
//! so they nest freely. [`PolicyStack`] composes all five in the order
//! `Bulkhead -> RateLimiter -> Retry -> CircuitBreaker -> TimeLimiter`.
//!
//! All timing uses `tokio::time`, so tests can run with a paused clock.
//!
//! ```rust,ignore
//! use switchboard_resilience::{PolicyError, PolicyStack, PolicyStackConfig};
//!
//! let stack = PolicyStack::new("http", PolicyStackConfig::default());
//! let body = stack
//!     .execute(|| async { client.get(url).await.map_err(PolicyError::Inner) })
//!     .await?;
//! ```

pub mod bulkhead;
pub mod circuit_breaker;
pub mod error;
pub mod rate_limiter;
pub mod retry;
pub mod stack;
pub mod time_limiter;

pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadPermit, BulkheadStats};
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
    SharedCircuitBreaker,
};
pub use error::PolicyError;
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterStats};
pub use retry::{default_retry_predicate, Backoff, Retry, RetryConfig, RetryStats};
pub use stack::{CallOptions, PolicyStack, PolicyStackConfig, PolicyStackStats};
pub use time_limiter::{time_limit, TimeLimiter, TimeLimiterConfig, TimeLimiterStats};
