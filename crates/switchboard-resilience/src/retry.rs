//! Retry with exponential backoff
//!
//! Re-invokes an operation up to `max_attempts` times, sleeping
//! `initial * multiplier^(attempt - 1)` between attempts (capped by an optional
//! maximum). Admission rejections (bulkhead, rate limiter, open circuit) are
//! final for the attempt that produced them and are returned as-is. Other
//! failures are retried while the predicate allows it. When every attempt
//! fails the last failure is wrapped in [`PolicyError::RetryExhausted`].

use crate::error::PolicyError;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Exponential backoff schedule
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Wait before the second attempt
    pub initial: Duration,
    /// Growth factor applied per attempt
    pub multiplier: f64,
    /// Upper bound on any single wait
    pub max: Option<Duration>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: None,
        }
    }
}

impl Backoff {
    /// Exponential backoff without a cap
    pub fn exponential(initial: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            multiplier,
            max: None,
        }
    }

    /// Constant wait between attempts
    pub fn fixed(wait: Duration) -> Self {
        Self::exponential(wait, 1.0)
    }

    /// Cap every wait at `max`
    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = Some(max);
        self
    }

    /// Wait after the given failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        // cap the exponent to keep the float finite
        let exponent = attempt.min(30) as i32 - 1;
        let millis = self.initial.as_millis() as f64 * self.multiplier.max(1.0).powi(exponent);
        let delay = Duration::from_millis(millis.min(u64::MAX as f64) as u64);
        match self.max {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Wait schedule between attempts
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryConfig {
    /// Create a retry config
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// A config that runs the operation exactly once
    pub fn no_retry() -> Self {
        Self::new(1, Backoff::fixed(Duration::ZERO))
    }

    /// Set max attempts (builder pattern)
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the backoff schedule (builder pattern)
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Default retry-eligibility check.
///
/// Admission rejections are never retried, and neither are failures whose
/// message mentions validation or authentication.
pub fn default_retry_predicate<E: fmt::Display>(error: &PolicyError<E>) -> bool {
    if error.is_rejection() {
        return false;
    }
    let message = error.to_string().to_lowercase();
    !(message.contains("validation") || message.contains("authentication"))
}

/// Attempt-iteration policy
#[derive(Debug)]
pub struct Retry {
    name: String,
    config: RetryConfig,
    successful_without_retry: AtomicU64,
    successful_with_retry: AtomicU64,
    failed_without_retry: AtomicU64,
    failed_with_retry: AtomicU64,
}

impl Retry {
    /// Create a retry policy
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Self {
        Self {
            name: name.into(),
            config,
            successful_without_retry: AtomicU64::new(0),
            successful_with_retry: AtomicU64::new(0),
            failed_without_retry: AtomicU64::new(0),
            failed_with_retry: AtomicU64::new(0),
        }
    }

    /// Name used in errors and logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in effect
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `op` with the configured attempts and the default predicate
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, PolicyError<E>>
    where
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PolicyError<E>>>,
    {
        self.call_with(&self.config, default_retry_predicate, op).await
    }

    /// Run `op` with an explicit config and predicate.
    ///
    /// Per-call overrides pass their own config; counters still accrue here.
    pub async fn call_with<T, E, F, Fut, P>(
        &self,
        config: &RetryConfig,
        predicate: P,
        mut op: F,
    ) -> Result<T, PolicyError<E>>
    where
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PolicyError<E>>>,
        P: Fn(&PolicyError<E>) -> bool,
    {
        let max_attempts = config.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let error = match op().await {
                Ok(value) => {
                    self.count_success(attempt);
                    return Ok(value);
                }
                Err(e) => e,
            };

            if error.is_rejection() || !predicate(&error) {
                debug!(retry = %self.name, attempt, "not retrying: {}", error);
                self.count_failure(attempt);
                return Err(error);
            }

            if attempt >= max_attempts {
                warn!(retry = %self.name, attempts = attempt, "retries exhausted: {}", error);
                self.count_failure(attempt);
                return Err(PolicyError::RetryExhausted {
                    name: self.name.clone(),
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            let delay = config.backoff.delay_for_attempt(attempt);
            debug!(
                retry = %self.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "attempt failed, retrying: {}",
                error
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Current statistics
    pub fn stats(&self) -> RetryStats {
        RetryStats {
            successful_calls_without_retry: self.successful_without_retry.load(Ordering::Relaxed),
            successful_calls_with_retry: self.successful_with_retry.load(Ordering::Relaxed),
            failed_calls_without_retry: self.failed_without_retry.load(Ordering::Relaxed),
            failed_calls_with_retry: self.failed_with_retry.load(Ordering::Relaxed),
        }
    }

    fn count_success(&self, attempts: u32) {
        let counter = if attempts > 1 {
            &self.successful_with_retry
        } else {
            &self.successful_without_retry
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn count_failure(&self, attempts: u32) {
        let counter = if attempts > 1 {
            &self.failed_with_retry
        } else {
            &self.failed_without_retry
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Retry statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    /// Calls that succeeded on the first attempt
    pub successful_calls_without_retry: u64,
    /// Calls that succeeded after at least one retry
    pub successful_calls_with_retry: u64,
    /// Calls that failed on the first attempt and were not retried
    pub failed_calls_without_retry: u64,
    /// Calls that failed after at least one retry
    pub failed_calls_with_retry: u64,
}
