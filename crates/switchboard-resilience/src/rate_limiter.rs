//! Rate limiter: throughput admission
//!
//! Grants `limit_for_period` permits per `limit_refresh_period`. The permit
//! budget is refilled at the start of each period. A caller that finds the
//! budget empty waits for the next refill, but never longer than
//! `timeout_duration`; if the next refill lies beyond that, it is rejected
//! straight away instead of sleeping for nothing.

use crate::error::PolicyError;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Configuration for a rate limiter
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    /// Permits granted per refresh period
    pub limit_for_period: u32,
    /// Length of one refresh period
    pub limit_refresh_period: Duration,
    /// Maximum time a caller waits for a permit
    pub timeout_duration: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            limit_for_period: 100,
            limit_refresh_period: Duration::from_secs(1),
            timeout_duration: Duration::from_secs(2),
        }
    }
}

impl RateLimiterConfig {
    /// Create a config granting `limit` permits per `period`
    pub fn new(limit: u32, period: Duration) -> Self {
        Self {
            limit_for_period: limit,
            limit_refresh_period: period,
            ..Default::default()
        }
    }

    /// Set the permit wait timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_duration = timeout;
        self
    }
}

#[derive(Debug)]
struct Cycle {
    started: Instant,
    permits: u32,
}

/// Throughput-admission policy
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    config: RateLimiterConfig,
    cycle: Mutex<Cycle>,
    waiting: AtomicUsize,
    permitted: AtomicU64,
    rejected: AtomicU64,
    total_wait_ns: AtomicU64,
}

impl RateLimiter {
    /// Create a rate limiter with a full budget
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Self {
        Self {
            name: name.into(),
            cycle: Mutex::new(Cycle {
                started: Instant::now(),
                permits: config.limit_for_period,
            }),
            config,
            waiting: AtomicUsize::new(0),
            permitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            total_wait_ns: AtomicU64::new(0),
        }
    }

    /// Name used in errors and logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in effect
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Acquire one permit, waiting at most `timeout_duration`
    pub async fn acquire<E>(&self) -> Result<(), PolicyError<E>> {
        let start = Instant::now();
        let deadline = start + self.config.timeout_duration;
        let mut waiting: Option<WaitingGuard<'_>> = None;

        loop {
            let now = Instant::now();
            let wait = match self.try_take(now) {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            if now + wait > deadline {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(rate_limiter = %self.name, "no permit within {:?}", self.config.timeout_duration);
                return Err(PolicyError::RateLimited {
                    name: self.name.clone(),
                    timeout: self.config.timeout_duration,
                });
            }

            if waiting.is_none() {
                waiting = Some(WaitingGuard::enter(self, start));
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Take a permit without waiting
    pub fn try_acquire(&self) -> bool {
        self.try_take(Instant::now()).is_ok()
    }

    /// Run `f` after acquiring a permit
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, PolicyError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PolicyError<E>>>,
    {
        self.acquire::<E>().await?;
        f().await
    }

    /// Current statistics
    pub fn stats(&self) -> RateLimiterStats {
        let available_permits = {
            let mut cycle = self.cycle.lock();
            self.refresh(&mut cycle, Instant::now());
            cycle.permits
        };
        RateLimiterStats {
            available_permits,
            waiting_calls: self.waiting.load(Ordering::Relaxed),
            permitted_calls: self.permitted.load(Ordering::Relaxed),
            rejected_calls: self.rejected.load(Ordering::Relaxed),
            total_wait_ms: self.total_wait_ns.load(Ordering::Relaxed) / 1_000_000,
        }
    }

    /// Take a permit, or report how long until the next refill
    fn try_take(&self, now: Instant) -> Result<(), Duration> {
        let mut cycle = self.cycle.lock();
        self.refresh(&mut cycle, now);
        if cycle.permits > 0 {
            cycle.permits -= 1;
            self.permitted.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        let next = cycle.started + self.config.limit_refresh_period;
        Err(next.saturating_duration_since(now).max(Duration::from_millis(1)))
    }

    fn refresh(&self, cycle: &mut Cycle, now: Instant) {
        let period = self.config.limit_refresh_period;
        if period.is_zero() {
            cycle.permits = self.config.limit_for_period;
            return;
        }
        let elapsed = now.saturating_duration_since(cycle.started);
        if elapsed >= period {
            let into_cycle = elapsed.as_nanos() % period.as_nanos();
            cycle.started = now - Duration::from_nanos(into_cycle as u64);
            cycle.permits = self.config.limit_for_period;
        }
    }
}

/// Counts a caller as waiting until it is granted, rejected or dropped
struct WaitingGuard<'a> {
    limiter: &'a RateLimiter,
    since: Instant,
}

impl<'a> WaitingGuard<'a> {
    fn enter(limiter: &'a RateLimiter, since: Instant) -> Self {
        limiter.waiting.fetch_add(1, Ordering::AcqRel);
        Self { limiter, since }
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.limiter.waiting.fetch_sub(1, Ordering::AcqRel);
        self.limiter
            .total_wait_ns
            .fetch_add(self.since.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }
}

/// Rate limiter statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterStats {
    /// Permits left in the current period
    pub available_permits: u32,
    /// Callers currently waiting for a permit
    pub waiting_calls: usize,
    /// Total granted permits
    pub permitted_calls: u64,
    /// Total rejected callers
    pub rejected_calls: u64,
    /// Total time callers spent waiting, in milliseconds
    pub total_wait_ms: u64,
}

impl std::fmt::Display for RateLimiterStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RateLimiter({} available, {} waiting, {} permitted, {} rejected, {}ms waited)",
            self.available_permits,
            self.waiting_calls,
            self.permitted_calls,
            self.rejected_calls,
            self.total_wait_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausted_without_timeout_rejects() {
        let limiter = RateLimiter::new(
            "test",
            RateLimiterConfig::new(2, Duration::from_secs(1)).with_timeout(Duration::ZERO),
        );

        assert!(limiter.acquire::<()>().await.is_ok());
        assert!(limiter.acquire::<()>().await.is_ok());
        let third = limiter.acquire::<()>().await;
        assert!(matches!(third, Err(PolicyError::RateLimited { .. })));

        let stats = limiter.stats();
        assert_eq!(stats.permitted_calls, 2);
        assert_eq!(stats.rejected_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_next_period() {
        let limiter = RateLimiter::new(
            "test",
            RateLimiterConfig::new(1, Duration::from_secs(1)).with_timeout(Duration::from_secs(2)),
        );

        limiter.acquire::<()>().await.unwrap();
        let started = Instant::now();
        limiter.acquire::<()>().await.unwrap();

        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(990), "waited {:?}", waited);
        assert!(waited <= Duration::from_millis(1010), "waited {:?}", waited);
        assert_eq!(limiter.stats().waiting_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_stops_counting() {
        let limiter = RateLimiter::new(
            "test",
            RateLimiterConfig::new(1, Duration::from_secs(1)).with_timeout(Duration::from_secs(2)),
        );
        limiter.acquire::<()>().await.unwrap();

        let cancelled =
            tokio::time::timeout(Duration::from_millis(10), limiter.acquire::<()>()).await;
        assert!(cancelled.is_err());
        tokio::time::advance(Duration::from_secs(5)).await;

        let stats = limiter.stats();
        assert_eq!(stats.waiting_calls, 0);
        assert_eq!(stats.permitted_calls, 1);
        assert!(stats.total_wait_ms >= 10, "waited {}ms", stats.total_wait_ms);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_when_refill_beyond_timeout() {
        let limiter = RateLimiter::new(
            "test",
            RateLimiterConfig::new(1, Duration::from_secs(10))
                .with_timeout(Duration::from_millis(100)),
        );

        limiter.acquire::<()>().await.unwrap();
        let started = Instant::now();
        assert!(limiter.acquire::<()>().await.is_err());
        // rejected without sleeping toward an unreachable refill
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_refills() {
        let limiter = RateLimiter::new(
            "test",
            RateLimiterConfig::new(3, Duration::from_millis(500)).with_timeout(Duration::ZERO),
        );
        for _ in 0..3 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());

        tokio::time::advance(Duration::from_millis(501)).await;
        assert_eq!(limiter.stats().available_permits, 3);
        assert!(limiter.try_acquire());
    }
}
