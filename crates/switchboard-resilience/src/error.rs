//! Error type shared by every policy primitive
//!
//! Each primitive takes an operation returning `Result<T, PolicyError<E>>` and
//! returns the same type, so primitives nest without conversion glue. Failures of
//! the wrapped operation travel as [`PolicyError::Inner`].

use crate::circuit_breaker::CircuitState;
use std::fmt;
use std::time::Duration;

/// Failure raised by a policy primitive or by the operation it wraps
#[derive(Debug)]
pub enum PolicyError<E> {
    /// No bulkhead slot became available within the configured wait
    BulkheadFull {
        /// Name of the rejecting bulkhead
        name: String,
        /// How long the caller was allowed to wait
        max_wait: Duration,
    },
    /// No rate limiter permit became available within the configured timeout
    RateLimited {
        /// Name of the rejecting rate limiter
        name: String,
        /// How long the caller was allowed to wait
        timeout: Duration,
    },
    /// The circuit breaker rejected the call without invoking the operation
    CircuitOpen {
        /// Name of the rejecting circuit breaker
        name: String,
        /// State the breaker was in when it rejected the call
        state: CircuitState,
    },
    /// The operation did not complete before its deadline
    TimedOut {
        /// Name of the time limiter
        name: String,
        /// The deadline that expired
        after: Duration,
    },
    /// Every allowed attempt failed; `last` is the failure of the final attempt
    RetryExhausted {
        /// Name of the retry policy
        name: String,
        /// Number of attempts performed
        attempts: u32,
        /// Failure of the last attempt
        last: Box<PolicyError<E>>,
    },
    /// The wrapped operation failed
    Inner(E),
}

impl<E> PolicyError<E> {
    /// True for admission rejections (bulkhead, rate limiter, open circuit).
    ///
    /// Rejections are final for the attempt that produced them and are never
    /// retried by the retry primitive.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::BulkheadFull { .. } | Self::RateLimited { .. } | Self::CircuitOpen { .. }
        )
    }

    /// True if the deadline of a time limiter expired
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    /// True if retries were exhausted
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    /// The innermost operation failure, looking through retry exhaustion
    pub fn inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { last, .. } => last.inner(),
            _ => None,
        }
    }

    /// Consume the error and return the innermost operation failure, if any
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { last, .. } => last.into_inner(),
            _ => None,
        }
    }

    /// Map the operation failure type, preserving the policy structure
    pub fn map_inner<F, O>(self, f: F) -> PolicyError<O>
    where
        F: FnOnce(E) -> O,
    {
        match self {
            Self::BulkheadFull { name, max_wait } => PolicyError::BulkheadFull { name, max_wait },
            Self::RateLimited { name, timeout } => PolicyError::RateLimited { name, timeout },
            Self::CircuitOpen { name, state } => PolicyError::CircuitOpen { name, state },
            Self::TimedOut { name, after } => PolicyError::TimedOut { name, after },
            Self::RetryExhausted {
                name,
                attempts,
                last,
            } => PolicyError::RetryExhausted {
                name,
                attempts,
                last: Box::new(last.map_inner(f)),
            },
            Self::Inner(e) => PolicyError::Inner(f(e)),
        }
    }
}

impl<E: fmt::Display> fmt::Display for PolicyError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BulkheadFull { name, max_wait } => {
                write!(f, "bulkhead '{}' is full (waited {:?})", name, max_wait)
            }
            Self::RateLimited { name, timeout } => write!(
                f,
                "rate limiter '{}' has no permits available (waited {:?})",
                name, timeout
            ),
            Self::CircuitOpen { name, state } => write!(
                f,
                "circuit breaker '{}' is {} and does not permit further calls",
                name, state
            ),
            Self::TimedOut { name, after } => {
                write!(f, "time limiter '{}' expired after {:?}", name, after)
            }
            Self::RetryExhausted {
                name,
                attempts,
                last,
            } => write!(
                f,
                "retry '{}' exhausted after {} attempt(s): {}",
                name, attempts, last
            ),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for PolicyError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::RetryExhausted { last, .. } => Some(last.as_ref()),
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}
