//! Circuit breaker with a count-based sliding window
//!
//! # States
//!
//! - **Closed**: calls pass through; outcomes fill the sliding window
//! - **Open**: calls fail immediately with [`PolicyError::CircuitOpen`]
//! - **Half-Open**: a limited number of probe calls decide whether to close again
//!
//! The breaker opens once the window holds at least `minimum_number_of_calls`
//! outcomes and either the failure rate or the slow-call rate reaches its
//! threshold. After `wait_duration_in_open_state` the next permission request
//! moves it to Half-Open. Once all probe outcomes are in, the same rate rules
//! decide between Closed and Open.
//!
//! Every transition bumps a generation counter. Outcomes are only recorded
//! against the generation that issued the permission, so a slow call that
//! started before a transition cannot skew the new state's statistics.
//!
//! # Example
//!
//! ```rust,ignore
//! let breaker = CircuitBreaker::new("http-circuit-breaker", CircuitBreakerConfig::default());
//! let body = breaker.call(|| async { fetch().await.map_err(PolicyError::Inner) }).await?;
//! ```

use crate::error::PolicyError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed = 0,
    /// Circuit is open - requests fail immediately
    Open = 1,
    /// Probing whether the dependency has recovered
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl CircuitState {
    /// Lowercase name used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failure rate in percent at which the breaker opens
    pub failure_rate_threshold: f32,
    /// Slow-call rate in percent at which the breaker opens
    pub slow_call_rate_threshold: f32,
    /// Calls taking longer than this count as slow
    pub slow_call_duration_threshold: Duration,
    /// Number of most recent outcomes kept in the window
    pub sliding_window_size: usize,
    /// Outcomes required before rates are evaluated
    pub minimum_number_of_calls: usize,
    /// Time spent Open before probing
    pub wait_duration_in_open_state: Duration,
    /// Probe calls allowed while Half-Open
    pub permitted_number_of_calls_in_half_open_state: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            sliding_window_size: 20,
            minimum_number_of_calls: 10,
            wait_duration_in_open_state: Duration::from_secs(30),
            permitted_number_of_calls_in_half_open_state: 5,
        }
    }
}

impl CircuitBreakerConfig {
    /// Set the failure rate threshold (percent)
    pub fn with_failure_rate_threshold(mut self, percent: f32) -> Self {
        self.failure_rate_threshold = percent;
        self
    }

    /// Set the slow-call rate threshold (percent)
    pub fn with_slow_call_rate_threshold(mut self, percent: f32) -> Self {
        self.slow_call_rate_threshold = percent;
        self
    }

    /// Set the duration above which a call is slow
    pub fn with_slow_call_duration_threshold(mut self, duration: Duration) -> Self {
        self.slow_call_duration_threshold = duration;
        self
    }

    /// Set the sliding window size
    pub fn with_sliding_window_size(mut self, size: usize) -> Self {
        self.sliding_window_size = size;
        self
    }

    /// Set the minimum number of calls before rates are evaluated
    pub fn with_minimum_number_of_calls(mut self, calls: usize) -> Self {
        self.minimum_number_of_calls = calls;
        self
    }

    /// Set the time spent Open before probing
    pub fn with_wait_duration_in_open_state(mut self, wait: Duration) -> Self {
        self.wait_duration_in_open_state = wait;
        self
    }

    /// Set the number of Half-Open probe calls
    pub fn with_permitted_calls_in_half_open_state(mut self, calls: usize) -> Self {
        self.permitted_number_of_calls_in_half_open_state = calls;
        self
    }

    fn window_size(&self) -> usize {
        self.sliding_window_size.max(1)
    }

    fn minimum_calls(&self) -> usize {
        self.minimum_number_of_calls.clamp(1, self.window_size())
    }

    fn half_open_calls(&self) -> usize {
        self.permitted_number_of_calls_in_half_open_state.max(1)
    }
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    failed: bool,
    slow: bool,
}

/// Fixed-size buffer of recent outcomes with running counts
#[derive(Debug)]
struct SlidingWindow {
    capacity: usize,
    outcomes: VecDeque<Outcome>,
    failed: usize,
    slow: usize,
}

impl SlidingWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            outcomes: VecDeque::with_capacity(capacity),
            failed: 0,
            slow: 0,
        }
    }

    fn record(&mut self, outcome: Outcome) {
        if self.outcomes.len() == self.capacity {
            if let Some(evicted) = self.outcomes.pop_front() {
                self.failed -= evicted.failed as usize;
                self.slow -= evicted.slow as usize;
            }
        }
        self.failed += outcome.failed as usize;
        self.slow += outcome.slow as usize;
        self.outcomes.push_back(outcome);
    }

    fn len(&self) -> usize {
        self.outcomes.len()
    }

    fn failure_rate(&self) -> f32 {
        rate(self.failed, self.len())
    }

    fn slow_call_rate(&self) -> f32 {
        rate(self.slow, self.len())
    }

    /// Rebuild with a new capacity, keeping the most recent outcomes
    fn resized(&self, capacity: usize) -> Self {
        let mut window = SlidingWindow::new(capacity);
        let skip = self.outcomes.len().saturating_sub(capacity);
        for outcome in self.outcomes.iter().skip(skip) {
            window.record(*outcome);
        }
        window
    }
}

fn rate(count: usize, total: usize) -> f32 {
    if total == 0 {
        0.0
    } else {
        count as f32 * 100.0 / total as f32
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    generation: u64,
    entered_at: Instant,
    window: SlidingWindow,
    probes_issued: usize,
    probes: SlidingWindow,
}

/// Failure-rate driven circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: Mutex<CircuitBreakerConfig>,
    inner: Mutex<BreakerState>,
    state: AtomicU8,
    successful: AtomicU64,
    failed: AtomicU64,
    slow: AtomicU64,
    not_permitted: AtomicU64,
}

/// Permission to run one call, issued by [`CircuitBreaker::try_acquire_permission`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPermit {
    generation: u64,
    state: CircuitState,
}

impl CircuitBreaker {
    /// Create a Closed circuit breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let window = SlidingWindow::new(config.window_size());
        let probes = SlidingWindow::new(config.half_open_calls());
        Self {
            name: name.into(),
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                generation: 0,
                entered_at: Instant::now(),
                window,
                probes_issued: 0,
                probes,
            }),
            config: Mutex::new(config),
            state: AtomicU8::new(CircuitState::Closed as u8),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            slow: AtomicU64::new(0),
            not_permitted: AtomicU64::new(0),
        }
    }

    /// Name used in errors and logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in effect
    pub fn config(&self) -> CircuitBreakerConfig {
        self.config.lock().clone()
    }

    /// Get the current state
    pub fn state(&self) -> CircuitState {
        self.state.load(Ordering::Acquire).into()
    }

    /// Ask for permission to run a call.
    ///
    /// An Open breaker whose wait has elapsed moves to Half-Open here.
    pub fn try_acquire_permission(&self) -> Option<CallPermit> {
        let config = self.config.lock().clone();
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open
            && inner.entered_at.elapsed() >= config.wait_duration_in_open_state
        {
            self.transition(&mut inner, &config, CircuitState::HalfOpen);
        }

        let permitted = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.probes_issued < config.half_open_calls() {
                    inner.probes_issued += 1;
                    true
                } else {
                    false
                }
            }
        };

        if permitted {
            Some(CallPermit {
                generation: inner.generation,
                state: inner.state,
            })
        } else {
            self.not_permitted.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Return a permission without recording an outcome (call cancelled)
    pub fn release_permission(&self, permit: CallPermit) {
        let mut inner = self.inner.lock();
        if permit.state == CircuitState::HalfOpen && permit.generation == inner.generation {
            inner.probes_issued = inner.probes_issued.saturating_sub(1);
        }
    }

    /// Record the outcome of a permitted call
    pub fn on_result(&self, permit: CallPermit, duration: Duration, failed: bool) {
        let config = self.config.lock().clone();
        let slow = duration > config.slow_call_duration_threshold;

        if failed {
            self.failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.successful.fetch_add(1, Ordering::Relaxed);
        }
        if slow {
            self.slow.fetch_add(1, Ordering::Relaxed);
        }

        let mut inner = self.inner.lock();
        if permit.generation != inner.generation {
            return;
        }
        let outcome = Outcome { failed, slow };

        match inner.state {
            CircuitState::Closed => {
                inner.window.record(outcome);
                if inner.window.len() >= config.minimum_calls()
                    && exceeds_thresholds(&inner.window, &config)
                {
                    self.transition(&mut inner, &config, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.probes.record(outcome);
                if inner.probes.len() >= config.half_open_calls() {
                    let next = if exceeds_thresholds(&inner.probes, &config) {
                        CircuitState::Open
                    } else {
                        CircuitState::Closed
                    };
                    self.transition(&mut inner, &config, next);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Execute a function through the circuit breaker.
    ///
    /// Any `Err` returned by `f` counts as a failed call. If the returned future
    /// is dropped before `f` completes, its permission is released unrecorded.
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, PolicyError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PolicyError<E>>>,
    {
        let permit = self.try_acquire_permission().ok_or_else(|| PolicyError::CircuitOpen {
            name: self.name.clone(),
            state: self.state(),
        })?;

        let mut guard = CallGuard {
            breaker: self,
            permit: Some(permit),
        };
        let started = Instant::now();
        let result = f().await;
        if let Some(permit) = guard.permit.take() {
            self.on_result(permit, started.elapsed(), result.is_err());
        }
        result
    }

    /// Manually reset the breaker to Closed with an empty window
    pub fn reset(&self) {
        let config = self.config.lock().clone();
        let mut inner = self.inner.lock();
        self.transition(&mut inner, &config, CircuitState::Closed);
    }

    /// Manually open the breaker
    pub fn trip(&self) {
        let config = self.config.lock().clone();
        let mut inner = self.inner.lock();
        self.transition(&mut inner, &config, CircuitState::Open);
    }

    /// Replace the configuration, keeping state and the most recent outcomes
    pub fn reconfigure(&self, config: CircuitBreakerConfig) {
        let mut current = self.config.lock();
        if *current == config {
            return;
        }
        let mut inner = self.inner.lock();
        inner.window = inner.window.resized(config.window_size());
        inner.probes = inner.probes.resized(config.half_open_calls());
        info!(
            circuit_breaker = %self.name,
            window = config.window_size(),
            failure_rate_threshold = config.failure_rate_threshold,
            "circuit breaker reconfigured"
        );
        *current = config;
    }

    /// Current statistics
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        let window = match inner.state {
            CircuitState::HalfOpen => &inner.probes,
            _ => &inner.window,
        };
        CircuitBreakerStats {
            state: inner.state,
            failure_rate: window.failure_rate(),
            slow_call_rate: window.slow_call_rate(),
            buffered_calls: window.len(),
            failed_buffered_calls: window.failed,
            slow_buffered_calls: window.slow,
            successful_calls: self.successful.load(Ordering::Relaxed),
            failed_calls: self.failed.load(Ordering::Relaxed),
            slow_calls: self.slow.load(Ordering::Relaxed),
            not_permitted_calls: self.not_permitted.load(Ordering::Relaxed),
        }
    }

    fn transition(
        &self,
        inner: &mut BreakerState,
        config: &CircuitBreakerConfig,
        to: CircuitState,
    ) {
        let from = inner.state;
        let failure_rate = inner.window.failure_rate();

        inner.state = to;
        inner.generation += 1;
        inner.entered_at = Instant::now();
        inner.probes_issued = 0;
        inner.probes = SlidingWindow::new(config.half_open_calls());
        if to == CircuitState::Closed {
            inner.window = SlidingWindow::new(config.window_size());
        }
        self.state.store(to as u8, Ordering::Release);

        if from == to {
            return;
        }
        match to {
            CircuitState::Open => warn!(
                circuit_breaker = %self.name,
                from = %from,
                failure_rate,
                "circuit breaker opened"
            ),
            _ => info!(
                circuit_breaker = %self.name,
                from = %from,
                to = %to,
                "circuit breaker state changed"
            ),
        }
    }
}

fn exceeds_thresholds(window: &SlidingWindow, config: &CircuitBreakerConfig) -> bool {
    window.failure_rate() >= config.failure_rate_threshold
        || window.slow_call_rate() >= config.slow_call_rate_threshold
}

struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    permit: Option<CallPermit>,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.breaker.release_permission(permit);
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerStats {
    /// Current state
    pub state: CircuitState,
    /// Failure rate of the buffered outcomes, in percent
    pub failure_rate: f32,
    /// Slow-call rate of the buffered outcomes, in percent
    pub slow_call_rate: f32,
    /// Outcomes currently in the window
    pub buffered_calls: usize,
    /// Failed outcomes currently in the window
    pub failed_buffered_calls: usize,
    /// Slow outcomes currently in the window
    pub slow_buffered_calls: usize,
    /// Total successful calls
    pub successful_calls: u64,
    /// Total failed calls
    pub failed_calls: u64,
    /// Total slow calls
    pub slow_calls: u64,
    /// Total calls rejected without running
    pub not_permitted_calls: u64,
}

/// A shared circuit breaker that can be cloned
#[derive(Debug, Clone)]
pub struct SharedCircuitBreaker {
    inner: Arc<CircuitBreaker>,
}

impl SharedCircuitBreaker {
    /// Create a new shared circuit breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(CircuitBreaker::new(name, config)),
        }
    }
}

impl std::ops::Deref for SharedCircuitBreaker {
    type Target = CircuitBreaker;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(window: usize, min_calls: usize) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::default()
                .with_sliding_window_size(window)
                .with_minimum_number_of_calls(min_calls)
                .with_wait_duration_in_open_state(Duration::from_secs(30))
                .with_permitted_calls_in_half_open_state(2),
        )
    }

    fn record(breaker: &CircuitBreaker, failed: bool) {
        let permit = breaker.try_acquire_permission().expect("permitted");
        breaker.on_result(permit, Duration::from_millis(1), failed);
    }

    #[test]
    fn test_initial_state() {
        let breaker = breaker(10, 5);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire_permission().is_some());
    }

    #[test]
    fn test_waits_for_minimum_calls() {
        let breaker = breaker(10, 5);
        for _ in 0..4 {
            record(&breaker, true);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        record(&breaker, true);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire_permission().is_none());
    }

    #[test]
    fn test_opens_at_failure_rate() {
        let breaker = breaker(4, 4);
        record(&breaker, false);
        record(&breaker, false);
        record(&breaker, true);
        assert_eq!(breaker.state(), CircuitState::Closed);

        // 2 of 4 failed = 50%
        record(&breaker, true);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_window_evicts_old_outcomes() {
        let breaker = breaker(4, 4);
        record(&breaker, true);
        for _ in 0..6 {
            record(&breaker, false);
        }
        let stats = breaker.stats();
        assert_eq!(stats.buffered_calls, 4);
        assert_eq!(stats.failed_buffered_calls, 0);
        assert_eq!(stats.failed_calls, 1);
    }

    #[test]
    fn test_slow_calls_open_breaker() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::default()
                .with_sliding_window_size(2)
                .with_minimum_number_of_calls(2)
                .with_slow_call_rate_threshold(50.0)
                .with_slow_call_duration_threshold(Duration::from_millis(100)),
        );
        let permit = breaker.try_acquire_permission().unwrap();
        breaker.on_result(permit, Duration::from_millis(10), false);
        let permit = breaker.try_acquire_permission().unwrap();
        breaker.on_result(permit, Duration::from_millis(500), false);

        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.stats().slow_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probes_close_breaker() {
        let breaker = breaker(2, 2);
        breaker.trip();
        assert!(breaker.try_acquire_permission().is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        let first = breaker.try_acquire_permission().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let second = breaker.try_acquire_permission().unwrap();
        // only two probes allowed
        assert!(breaker.try_acquire_permission().is_none());

        breaker.on_result(first, Duration::from_millis(1), false);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.on_result(second, Duration::from_millis(1), false);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probes_reopen_breaker() {
        let breaker = breaker(2, 2);
        breaker.trip();
        tokio::time::advance(Duration::from_secs(31)).await;

        record(&breaker, true);
        record(&breaker, true);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire_permission().is_none());
    }

    #[test]
    fn test_stale_outcome_ignored() {
        let breaker = breaker(2, 2);
        let permit = breaker.try_acquire_permission().unwrap();
        breaker.reset();
        breaker.on_result(permit, Duration::from_millis(1), true);
        assert_eq!(breaker.stats().buffered_calls, 0);
    }

    #[tokio::test]
    async fn test_open_breaker_never_invokes_operation() {
        let breaker = breaker(2, 2);
        breaker.trip();

        let mut invoked = false;
        let result: Result<(), PolicyError<&str>> = breaker
            .call(|| {
                invoked = true;
                async { Ok(()) }
            })
            .await;

        assert!(matches!(
            result,
            Err(PolicyError::CircuitOpen {
                state: CircuitState::Open,
                ..
            })
        ));
        assert!(!invoked);
        assert_eq!(breaker.stats().not_permitted_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_probe_releases_permission() {
        let breaker = breaker(2, 2);
        breaker.trip();
        tokio::time::advance(Duration::from_secs(31)).await;

        let pending = breaker.call(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<(), PolicyError<&str>>(())
        });
        let _ = tokio::time::timeout(Duration::from_millis(10), pending).await;

        // both probes are available again
        assert!(breaker.try_acquire_permission().is_some());
        assert!(breaker.try_acquire_permission().is_some());
    }

    #[test]
    fn test_reconfigure_keeps_recent_outcomes() {
        let breaker = breaker(10, 10);
        record(&breaker, true);
        record(&breaker, false);
        record(&breaker, false);

        breaker.reconfigure(
            breaker
                .config()
                .with_sliding_window_size(2)
                .with_minimum_number_of_calls(2),
        );
        let stats = breaker.stats();
        assert_eq!(stats.buffered_calls, 2);
        assert_eq!(stats.failed_buffered_calls, 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_shared_circuit_breaker() {
        let breaker = SharedCircuitBreaker::new("shared", CircuitBreakerConfig::default());
        let other = breaker.clone();
        breaker.trip();
        assert_eq!(other.state(), CircuitState::Open);
    }

    #[test]
    fn test_circuit_state_from_u8() {
        assert_eq!(CircuitState::from(0), CircuitState::Closed);
        assert_eq!(CircuitState::from(1), CircuitState::Open);
        assert_eq!(CircuitState::from(2), CircuitState::HalfOpen);
        assert_eq!(CircuitState::from(255), CircuitState::Closed);
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }
}
