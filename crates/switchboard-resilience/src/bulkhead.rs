//! Bulkhead: bounded concurrent admission
//!
//! At most `max_concurrent_calls` operations run at once. Callers that find no
//! free slot join a bounded wait queue and give up after `max_wait_duration`.
//! A rejected call is never executed. Slots are released when the returned
//! [`BulkheadPermit`] is dropped, whether the operation succeeded or failed.

use crate::error::PolicyError;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

/// Configuration for a bulkhead
#[derive(Debug, Clone, PartialEq)]
pub struct BulkheadConfig {
    /// Maximum number of operations running at the same time
    pub max_concurrent_calls: usize,
    /// Maximum time a caller waits for a free slot
    pub max_wait_duration: Duration,
    /// Maximum number of callers allowed to wait for a slot
    pub max_waiting_calls: usize,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 25,
            max_wait_duration: Duration::from_secs(5),
            max_waiting_calls: 100,
        }
    }
}

impl BulkheadConfig {
    /// Set the concurrency limit
    pub fn with_max_concurrent_calls(mut self, calls: usize) -> Self {
        self.max_concurrent_calls = calls;
        self
    }

    /// Set the admission wait
    pub fn with_max_wait_duration(mut self, wait: Duration) -> Self {
        self.max_wait_duration = wait;
        self
    }

    /// Set the wait queue capacity
    pub fn with_max_waiting_calls(mut self, calls: usize) -> Self {
        self.max_waiting_calls = calls;
        self
    }
}

/// A held bulkhead slot; dropping it frees the slot
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

/// Concurrency-admission policy
#[derive(Debug)]
pub struct Bulkhead {
    name: String,
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl Bulkhead {
    /// Create a bulkhead
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Self {
        Self {
            name: name.into(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_calls)),
            config,
            waiting: AtomicUsize::new(0),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Name used in errors and logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in effect
    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    /// Acquire a slot, waiting at most `max_wait_duration`
    pub async fn acquire<E>(&self) -> Result<BulkheadPermit, PolicyError<E>> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => return Ok(self.admit(permit)),
            Err(TryAcquireError::Closed) => return Err(self.reject()),
            Err(TryAcquireError::NoPermits) => {}
        }

        if self.config.max_wait_duration.is_zero() {
            return Err(self.reject());
        }

        // Join the wait queue unless it is already full
        let queued = self
            .waiting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                (w < self.config.max_waiting_calls).then_some(w + 1)
            })
            .is_ok();
        if !queued {
            debug!(bulkhead = %self.name, "wait queue full");
            return Err(self.reject());
        }
        let _waiter = WaitingGuard(&self.waiting);

        match tokio::time::timeout(
            self.config.max_wait_duration,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Ok(self.admit(permit)),
            _ => Err(self.reject()),
        }
    }

    /// Run `f` inside a bulkhead slot
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, PolicyError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PolicyError<E>>>,
    {
        let _permit = self.acquire::<E>().await?;
        f().await
    }

    /// Stop admitting callers; waiting callers are rejected
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Current statistics
    pub fn stats(&self) -> BulkheadStats {
        BulkheadStats {
            available_concurrent_calls: self.semaphore.available_permits(),
            max_concurrent_calls: self.config.max_concurrent_calls,
            waiting_calls: self.waiting.load(Ordering::Relaxed),
            admitted_calls: self.admitted.load(Ordering::Relaxed),
            rejected_calls: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> BulkheadPermit {
        self.admitted.fetch_add(1, Ordering::Relaxed);
        BulkheadPermit { _permit: permit }
    }

    fn reject<E>(&self) -> PolicyError<E> {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        debug!(bulkhead = %self.name, "call rejected");
        PolicyError::BulkheadFull {
            name: self.name.clone(),
            max_wait: self.config.max_wait_duration,
        }
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bulkhead statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadStats {
    /// Free slots right now
    pub available_concurrent_calls: usize,
    /// Configured slot count
    pub max_concurrent_calls: usize,
    /// Callers currently waiting for a slot
    pub waiting_calls: usize,
    /// Total admitted calls
    pub admitted_calls: u64,
    /// Total rejected calls
    pub rejected_calls: u64,
}
