//! Time limiter: deadline enforcement
//!
//! Cancellation is best-effort. When the deadline expires the wrapped future
//! is dropped, which stops it at its next suspension point. Work that was
//! already handed off elsewhere (a spawned task, a request already written to
//! a socket) may still complete after the caller has observed
//! [`PolicyError::TimedOut`]. Backends must tolerate that.

use crate::error::PolicyError;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Configuration for a time limiter
#[derive(Debug, Clone, PartialEq)]
pub struct TimeLimiterConfig {
    /// Deadline applied to each call
    pub timeout_duration: Duration,
}

impl Default for TimeLimiterConfig {
    fn default() -> Self {
        Self {
            timeout_duration: Duration::from_secs(30),
        }
    }
}

impl TimeLimiterConfig {
    /// Create a config with the given deadline
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout_duration: timeout,
        }
    }
}

/// Deadline-enforcement policy
#[derive(Debug)]
pub struct TimeLimiter {
    name: String,
    config: TimeLimiterConfig,
    completed: AtomicU64,
    timed_out: AtomicU64,
}

impl TimeLimiter {
    /// Create a time limiter
    pub fn new(name: impl Into<String>, config: TimeLimiterConfig) -> Self {
        Self {
            name: name.into(),
            config,
            completed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        }
    }

    /// Name used in errors and logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in effect
    pub fn config(&self) -> &TimeLimiterConfig {
        &self.config
    }

    /// Run `fut` under the configured deadline
    pub async fn call<T, E, Fut>(&self, fut: Fut) -> Result<T, PolicyError<E>>
    where
        Fut: Future<Output = Result<T, PolicyError<E>>>,
    {
        self.call_with(self.config.timeout_duration, fut).await
    }

    /// Run `fut` under an explicit deadline
    pub async fn call_with<T, E, Fut>(
        &self,
        timeout: Duration,
        fut: Fut,
    ) -> Result<T, PolicyError<E>>
    where
        Fut: Future<Output = Result<T, PolicyError<E>>>,
    {
        match time_limit(&self.name, timeout, fut).await {
            Err(e) if e.is_timeout() => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
            other => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                other
            }
        }
    }

    /// Current statistics
    pub fn stats(&self) -> TimeLimiterStats {
        TimeLimiterStats {
            completed_calls: self.completed.load(Ordering::Relaxed),
            timed_out_calls: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

/// Apply a one-off deadline without a limiter instance
pub async fn time_limit<T, E, Fut>(
    name: &str,
    timeout: Duration,
    fut: Fut,
) -> Result<T, PolicyError<E>>
where
    Fut: Future<Output = Result<T, PolicyError<E>>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            debug!(time_limiter = %name, "call timed out after {:?}", timeout);
            Err(PolicyError::TimedOut {
                name: name.to_string(),
                after: timeout,
            })
        }
    }
}

/// Time limiter statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeLimiterStats {
    /// Calls that finished before the deadline (successfully or not)
    pub completed_calls: u64,
    /// Calls cut off by the deadline
    pub timed_out_calls: u64,
}
