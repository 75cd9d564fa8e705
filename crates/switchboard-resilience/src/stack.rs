//! Policy stack: the five primitives composed around one operation
//!
//! Order, outermost first:
//!
//! ```text
//! Bulkhead -> RateLimiter -> Retry -> CircuitBreaker -> TimeLimiter -> operation
//! ```
//!
//! Admission (bulkhead, rate limiter) happens once per logical call, before
//! any retrying; the slot is held until the last attempt finishes. The circuit
//! breaker sits inside the retry loop so each attempt sees the breaker's
//! current state, and the deadline applies to each attempt on its own.
//! Any primitive can be disabled, in which case its layer is skipped.

use crate::bulkhead::{Bulkhead, BulkheadConfig, BulkheadStats};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::error::PolicyError;
use crate::rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterStats};
use crate::retry::{default_retry_predicate, Retry, RetryConfig, RetryStats};
use crate::time_limiter::{time_limit, TimeLimiter, TimeLimiterConfig, TimeLimiterStats};
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Which primitives a stack carries, and how each is configured
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyStackConfig {
    /// Concurrency admission; `None` disables it
    pub bulkhead: Option<BulkheadConfig>,
    /// Throughput admission; `None` disables it
    pub rate_limiter: Option<RateLimiterConfig>,
    /// Attempt iteration; `None` disables it
    pub retry: Option<RetryConfig>,
    /// Failure-rate gating; `None` disables it
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Per-attempt deadline; `None` disables it
    pub time_limiter: Option<TimeLimiterConfig>,
}

impl Default for PolicyStackConfig {
    fn default() -> Self {
        Self {
            bulkhead: Some(BulkheadConfig::default()),
            rate_limiter: Some(RateLimiterConfig::default()),
            retry: Some(RetryConfig::default()),
            circuit_breaker: Some(CircuitBreakerConfig::default()),
            time_limiter: Some(TimeLimiterConfig::default()),
        }
    }
}

impl PolicyStackConfig {
    /// A stack with every primitive disabled
    pub fn passthrough() -> Self {
        Self {
            bulkhead: None,
            rate_limiter: None,
            retry: None,
            circuit_breaker: None,
            time_limiter: None,
        }
    }

    /// Enable the bulkhead
    pub fn with_bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.bulkhead = Some(config);
        self
    }

    /// Enable the rate limiter
    pub fn with_rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limiter = Some(config);
        self
    }

    /// Enable retry
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    /// Enable the circuit breaker
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Enable the time limiter
    pub fn with_time_limiter(mut self, config: TimeLimiterConfig) -> Self {
        self.time_limiter = Some(config);
        self
    }

    /// Disable the bulkhead
    pub fn without_bulkhead(mut self) -> Self {
        self.bulkhead = None;
        self
    }

    /// Disable the rate limiter
    pub fn without_rate_limiter(mut self) -> Self {
        self.rate_limiter = None;
        self
    }

    /// Disable retry
    pub fn without_retry(mut self) -> Self {
        self.retry = None;
        self
    }

    /// Disable the circuit breaker
    pub fn without_circuit_breaker(mut self) -> Self {
        self.circuit_breaker = None;
        self
    }

    /// Disable the time limiter
    pub fn without_time_limiter(mut self) -> Self {
        self.time_limiter = None;
        self
    }
}

/// Per-call adjustments applied on top of the stack's configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallOptions {
    /// Replaces the stack's retry config for this call
    pub retry: Option<RetryConfig>,
    /// Replaces the per-attempt deadline for this call
    pub timeout: Option<Duration>,
}

impl CallOptions {
    /// Override the retry config
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    /// Override the per-attempt deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// The composed decorator chain for one scope (typically one connector type)
#[derive(Debug)]
pub struct PolicyStack {
    name: String,
    bulkhead: Option<Bulkhead>,
    rate_limiter: Option<RateLimiter>,
    retry: Option<Retry>,
    circuit_breaker: Option<CircuitBreaker>,
    time_limiter: Option<TimeLimiter>,
}

impl PolicyStack {
    /// Build a stack; each primitive is named `<name>-<primitive>`
    pub fn new(name: impl Into<String>, config: PolicyStackConfig) -> Self {
        let name = name.into();
        Self {
            bulkhead: config
                .bulkhead
                .map(|c| Bulkhead::new(format!("{}-bulkhead", name), c)),
            rate_limiter: config
                .rate_limiter
                .map(|c| RateLimiter::new(format!("{}-rate-limiter", name), c)),
            retry: config
                .retry
                .map(|c| Retry::new(format!("{}-retry", name), c)),
            circuit_breaker: config
                .circuit_breaker
                .map(|c| CircuitBreaker::new(format!("{}-circuit-breaker", name), c)),
            time_limiter: config
                .time_limiter
                .map(|c| TimeLimiter::new(format!("{}-time-limiter", name), c)),
            name,
        }
    }

    /// Scope name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bulkhead, if enabled
    pub fn bulkhead(&self) -> Option<&Bulkhead> {
        self.bulkhead.as_ref()
    }

    /// The rate limiter, if enabled
    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    /// The retry policy, if enabled
    pub fn retry(&self) -> Option<&Retry> {
        self.retry.as_ref()
    }

    /// The circuit breaker, if enabled
    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.circuit_breaker.as_ref()
    }

    /// The time limiter, if enabled
    pub fn time_limiter(&self) -> Option<&TimeLimiter> {
        self.time_limiter.as_ref()
    }

    /// Run `op` through the full stack with the default retry predicate
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, PolicyError<E>>
    where
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PolicyError<E>>>,
    {
        self.execute_with(&CallOptions::default(), default_retry_predicate, op)
            .await
    }

    /// Run `op` through the full stack with per-call options and predicate.
    ///
    /// `op` is invoked once per attempt.
    pub async fn execute_with<T, E, F, Fut, P>(
        &self,
        options: &CallOptions,
        predicate: P,
        mut op: F,
    ) -> Result<T, PolicyError<E>>
    where
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PolicyError<E>>>,
        P: Fn(&PolicyError<E>) -> bool,
    {
        let _slot = match &self.bulkhead {
            Some(bulkhead) => Some(bulkhead.acquire::<E>().await?),
            None => None,
        };
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire::<E>().await?;
        }

        let timeout = options.timeout.or_else(|| {
            self.time_limiter
                .as_ref()
                .map(|t| t.config().timeout_duration)
        });
        let attempt = || {
            let fut = op();
            self.attempt(timeout, fut)
        };

        match (&self.retry, &options.retry) {
            (Some(retry), Some(config)) => retry.call_with(config, predicate, attempt).await,
            (Some(retry), None) => retry.call_with(retry.config(), predicate, attempt).await,
            (None, Some(config)) => {
                Retry::new(format!("{}-retry", self.name), config.clone())
                    .call_with(config, predicate, attempt)
                    .await
            }
            (None, None) => {
                let mut attempt = attempt;
                attempt().await
            }
        }
    }

    /// One attempt: circuit breaker around the deadline around the operation
    async fn attempt<T, E, Fut>(
        &self,
        timeout: Option<Duration>,
        fut: Fut,
    ) -> Result<T, PolicyError<E>>
    where
        Fut: Future<Output = Result<T, PolicyError<E>>>,
    {
        let limited = async {
            match (timeout, &self.time_limiter) {
                (Some(after), Some(limiter)) => limiter.call_with(after, fut).await,
                (Some(after), None) => {
                    time_limit(&format!("{}-time-limiter", self.name), after, fut).await
                }
                (None, _) => fut.await,
            }
        };
        match &self.circuit_breaker {
            Some(breaker) => breaker.call(|| limited).await,
            None => limited.await,
        }
    }

    /// Stop admitting new calls through the bulkhead
    pub fn close(&self) {
        if let Some(bulkhead) = &self.bulkhead {
            bulkhead.close();
        }
    }

    /// Snapshot of every enabled primitive's counters
    pub fn stats(&self) -> PolicyStackStats {
        PolicyStackStats {
            bulkhead: self.bulkhead.as_ref().map(Bulkhead::stats),
            rate_limiter: self.rate_limiter.as_ref().map(RateLimiter::stats),
            retry: self.retry.as_ref().map(Retry::stats),
            circuit_breaker: self.circuit_breaker.as_ref().map(CircuitBreaker::stats),
            time_limiter: self.time_limiter.as_ref().map(TimeLimiter::stats),
        }
    }
}

/// Counters of every enabled primitive in a stack
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyStackStats {
    /// Bulkhead counters
    pub bulkhead: Option<BulkheadStats>,
    /// Rate limiter counters
    pub rate_limiter: Option<RateLimiterStats>,
    /// Retry counters
    pub retry: Option<RetryStats>,
    /// Circuit breaker counters
    pub circuit_breaker: Option<CircuitBreakerStats>,
    /// Time limiter counters
    pub time_limiter: Option<TimeLimiterStats>,
}
