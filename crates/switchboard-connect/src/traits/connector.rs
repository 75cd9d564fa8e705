//! Resilient connector
//!
//! [`ResilientConnector`] decorates any [`Backend`] with a policy stack scoped
//! to the backend's connector type and exposes the uniform call surface:
//! `send_sync`, `send_async`, `send_async_no_response`, `is_healthy`,
//! `close`, plus metrics.
//!
//! Every call runs
//!
//! ```text
//! Bulkhead -> RateLimiter -> Retry -> CircuitBreaker -> TimeLimiter -> Backend hook
//! ```
//!
//! and any failure, whether a policy rejection or a backend error, surfaces
//! as one [`ConnectorError`] tagged with the connector type, endpoint,
//! datacenter and operation.
//!
//! A timed-out attempt is abandoned, not aborted: the backend hook's future
//! is dropped at the deadline, but work the backend already handed to its own
//! tasks or to the network may still complete after the caller sees
//! [`ErrorKind::TimedOut`](crate::error::ErrorKind::TimedOut).

use super::backend::Backend;
use crate::error::{ConnectorError, ConnectorResult};
use crate::metrics::ConnectorMetrics;
use crate::types::{ConnectorContext, ConnectorType};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use switchboard_resilience::{
    default_retry_predicate, time_limit, CircuitBreakerConfig, CircuitState, PolicyError,
    PolicyStack, PolicyStackConfig,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default time `close` waits for in-flight calls
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle status of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectorStatus {
    /// Accepting calls
    Running = 0,
    /// Draining in-flight calls; new calls are refused
    Closing = 1,
    /// Backend resources released
    Closed = 2,
}

impl From<u8> for ConnectorStatus {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Closing,
            2 => Self::Closed,
            _ => Self::Running,
        }
    }
}

impl ConnectorStatus {
    /// Lowercase name used in logs and reports
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Shared<B> {
    backend: B,
    connector_type: ConnectorType,
    policies: PolicyStack,
    breaker_config: Option<CircuitBreakerConfig>,
    status: AtomicU8,
    in_flight: AtomicUsize,
    drained: Notify,
    drain_timeout: Duration,
    health_context: Option<ConnectorContext>,
    calls_total: AtomicU64,
    calls_succeeded: AtomicU64,
    calls_failed: AtomicU64,
}

impl<B> Shared<B> {
    fn status(&self) -> ConnectorStatus {
        ConnectorStatus::from(self.status.load(Ordering::Acquire))
    }
}

/// Keeps the in-flight count up while a call is inside the connector
struct InFlight<'a, B> {
    shared: &'a Shared<B>,
}

impl<'a, B> InFlight<'a, B> {
    fn enter(shared: &'a Shared<B>) -> Self {
        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        Self { shared }
    }
}

impl<B> Drop for InFlight<'_, B> {
    fn drop(&mut self) {
        if self.shared.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.drained.notify_waiters();
        }
    }
}

/// A backend wrapped with the policy stack of its connector type.
///
/// Cloning is cheap; clones share the backend, the policy state and the
/// lifecycle.
pub struct ResilientConnector<B: Backend> {
    shared: Arc<Shared<B>>,
}

impl<B: Backend> Clone for ResilientConnector<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: Backend> fmt::Debug for ResilientConnector<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientConnector")
            .field("connector_type", &self.shared.connector_type)
            .field("status", &self.shared.status())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl<B: Backend> ResilientConnector<B> {
    /// Wrap `backend` with the default policies of its type
    pub fn new(backend: B) -> Self {
        Self::builder(backend).build()
    }

    /// Wrap `backend` with the given policies
    pub fn with_policies(backend: B, policies: PolicyStackConfig) -> Self {
        Self::builder(backend).policies(policies).build()
    }

    /// Start configuring a connector around `backend`
    pub fn builder(backend: B) -> ConnectorBuilder<B> {
        ConnectorBuilder {
            backend,
            policies: PolicyStackConfig::default(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            health_context: None,
        }
    }

    /// Connector type of the wrapped backend
    pub fn connector_type(&self) -> ConnectorType {
        self.shared.connector_type
    }

    /// The wrapped backend
    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    /// The policy stack guarding the backend
    pub fn policies(&self) -> &PolicyStack {
        &self.shared.policies
    }

    /// Lifecycle status
    pub fn status(&self) -> ConnectorStatus {
        self.shared.status()
    }

    /// Calls currently inside the connector
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Context used when a health probe is requested without one
    pub fn health_context(&self) -> Option<&ConnectorContext> {
        self.shared.health_context.as_ref()
    }

    /// Send and wait for the response
    pub async fn send_sync(
        &self,
        request: &B::Request,
        context: &ConnectorContext,
    ) -> ConnectorResult<B::Response> {
        let backend = &self.shared.backend;
        self.invoke("send_sync", context, || backend.do_send_sync(request, context))
            .await
    }

    /// Send on a spawned task; the returned future yields the response.
    ///
    /// The call keeps running if the future is dropped.
    pub fn send_async(
        &self,
        request: B::Request,
        context: ConnectorContext,
    ) -> ConnectorFuture<B::Response> {
        let connector = self.clone();
        ConnectorFuture::spawn(async move { connector.send_async_inline(&request, &context).await })
    }

    /// Fire-and-forget on a spawned task.
    ///
    /// Success means the backend accepted the message; failures are only
    /// visible through the returned future, the logs and the metrics.
    pub fn send_async_no_response(
        &self,
        request: B::Request,
        context: ConnectorContext,
    ) -> ConnectorFuture<()> {
        let connector = self.clone();
        ConnectorFuture::spawn(async move {
            connector
                .send_async_no_response_inline(&request, &context)
                .await
        })
    }

    /// The `send_async` path without spawning
    pub(crate) async fn send_async_inline(
        &self,
        request: &B::Request,
        context: &ConnectorContext,
    ) -> ConnectorResult<B::Response> {
        let backend = &self.shared.backend;
        self.invoke("send_async", context, || {
            backend.do_send_async(request, context)
        })
        .await
    }

    /// The `send_async_no_response` path without spawning
    pub(crate) async fn send_async_no_response_inline(
        &self,
        request: &B::Request,
        context: &ConnectorContext,
    ) -> ConnectorResult<()> {
        let backend = &self.shared.backend;
        self.invoke("send_async_no_response", context, || {
            backend.do_send_async_no_response(request, context)
        })
        .await
    }

    /// Healthy when running, the circuit is closed and the probe passes.
    ///
    /// Never fails: probe errors and timeouts degrade to `false`.
    pub async fn is_healthy(&self, context: &ConnectorContext) -> bool {
        let shared = &self.shared;
        if shared.status() != ConnectorStatus::Running {
            return false;
        }
        if let Some(breaker) = shared.policies.circuit_breaker() {
            if breaker.state() != CircuitState::Closed {
                return false;
            }
        }

        let probe = async {
            shared
                .backend
                .do_health_check(context)
                .await
                .map_err(PolicyError::Inner)
        };
        let result = match context.timeout().or_else(|| {
            shared
                .policies
                .time_limiter()
                .map(|t| t.config().timeout_duration)
        }) {
            Some(after) => {
                let name = format!("{}-health-check", shared.connector_type);
                time_limit(&name, after, probe).await
            }
            None => probe.await,
        };

        match result {
            Ok(healthy) => healthy,
            Err(err) => {
                debug!(
                    connector = %shared.connector_type,
                    endpoint = context.endpoint(),
                    error = %err,
                    "health check failed"
                );
                false
            }
        }
    }

    /// Snapshot of status, circuit state and counters
    pub fn metrics(&self) -> ConnectorMetrics {
        let shared = &self.shared;
        ConnectorMetrics {
            connector_type: shared.connector_type,
            status: shared.status(),
            circuit_state: shared.policies.circuit_breaker().map(|b| b.state()),
            calls_total: shared.calls_total.load(Ordering::Relaxed),
            calls_succeeded: shared.calls_succeeded.load(Ordering::Relaxed),
            calls_failed: shared.calls_failed.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
            policies: shared.policies.stats(),
        }
    }

    /// Stop admitting calls, drain in-flight ones, then release the backend.
    ///
    /// Idempotent. Drain timeouts and backend close failures are logged and
    /// do not stop the shutdown.
    pub async fn close(&self) {
        let shared = &self.shared;
        if shared
            .status
            .compare_exchange(
                ConnectorStatus::Running as u8,
                ConnectorStatus::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!(connector = %shared.connector_type, "connector already closing");
            return;
        }

        info!(connector = %shared.connector_type, in_flight = self.in_flight(), "closing connector");
        shared.policies.close();

        if !self.drain().await {
            warn!(
                connector = %shared.connector_type,
                in_flight = self.in_flight(),
                timeout = ?shared.drain_timeout,
                "in-flight calls did not drain before timeout"
            );
        }

        if let Err(err) = shared.backend.do_close().await {
            warn!(connector = %shared.connector_type, error = %err, "backend close failed");
        }

        shared
            .status
            .store(ConnectorStatus::Closed as u8, Ordering::Release);
        info!(connector = %shared.connector_type, "connector closed");
    }

    async fn drain(&self) -> bool {
        let shared = &self.shared;
        let deadline = tokio::time::Instant::now() + shared.drain_timeout;
        loop {
            let notified = shared.drained.notified();
            if shared.in_flight.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return shared.in_flight.load(Ordering::SeqCst) == 0;
            }
        }
    }

    async fn invoke<T, F, Fut>(
        &self,
        operation: &'static str,
        context: &ConnectorContext,
        mut op: F,
    ) -> ConnectorResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ConnectorResult<T>>,
    {
        let shared = &self.shared;
        let ty = shared.connector_type;
        let _in_flight = InFlight::enter(shared);
        shared.calls_total.fetch_add(1, Ordering::Relaxed);

        let status = shared.status();
        if status != ConnectorStatus::Running {
            shared.calls_failed.fetch_add(1, Ordering::Relaxed);
            return Err(
                ConnectorError::unavailable(format!("{} connector is {}", ty, status))
                    .or_context(ty, context.endpoint(), context.datacenter(), operation),
            );
        }

        // an override holds for this call only; plain calls restore the built config
        if let (Some(breaker), Some(built)) = (
            shared.policies.circuit_breaker(),
            shared.breaker_config.as_ref(),
        ) {
            let wanted = context.circuit_breaker_override().unwrap_or(built);
            if breaker.config() != *wanted {
                breaker.reconfigure(wanted.clone());
            }
        }

        let result = shared
            .policies
            .execute_with(&context.call_options(), retry_eligible, || {
                let fut = op();
                async move { fut.await.map_err(PolicyError::Inner) }
            })
            .await;

        match result {
            Ok(response) => {
                shared.calls_succeeded.fetch_add(1, Ordering::Relaxed);
                debug!(
                    connector = %ty,
                    operation,
                    endpoint = context.endpoint(),
                    correlation_id = context.correlation_id(),
                    "connector call succeeded"
                );
                Ok(response)
            }
            Err(err) => {
                shared.calls_failed.fetch_add(1, Ordering::Relaxed);
                let err = ConnectorError::from_policy(err).or_context(
                    ty,
                    context.endpoint(),
                    context.datacenter(),
                    operation,
                );
                warn!(
                    connector = %ty,
                    operation,
                    endpoint = context.endpoint(),
                    datacenter = context.datacenter(),
                    correlation_id = context.correlation_id(),
                    kind = %err.kind(),
                    error = %err,
                    "connector call failed"
                );
                Err(err)
            }
        }
    }
}

fn retry_eligible(err: &PolicyError<ConnectorError>) -> bool {
    match err {
        PolicyError::Inner(e) => e.is_retryable(),
        other => default_retry_predicate(other),
    }
}

/// Builder for [`ResilientConnector`]
pub struct ConnectorBuilder<B: Backend> {
    backend: B,
    policies: PolicyStackConfig,
    drain_timeout: Duration,
    health_context: Option<ConnectorContext>,
}

impl<B: Backend> ConnectorBuilder<B> {
    /// Replace the default policies
    pub fn policies(mut self, policies: PolicyStackConfig) -> Self {
        self.policies = policies;
        self
    }

    /// How long `close` waits for in-flight calls
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Context used for registry-driven health probes
    pub fn health_context(mut self, context: ConnectorContext) -> Self {
        self.health_context = Some(context);
        self
    }

    /// Build the connector; policy instances are named after the connector type
    pub fn build(self) -> ResilientConnector<B> {
        let connector_type = self.backend.connector_type();
        let policies = PolicyStack::new(connector_type.as_str(), self.policies);
        let breaker_config = policies.circuit_breaker().map(|b| b.config());
        ResilientConnector {
            shared: Arc::new(Shared {
                policies,
                breaker_config,
                backend: self.backend,
                connector_type,
                status: AtomicU8::new(ConnectorStatus::Running as u8),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
                drain_timeout: self.drain_timeout,
                health_context: self.health_context,
                calls_total: AtomicU64::new(0),
                calls_succeeded: AtomicU64::new(0),
                calls_failed: AtomicU64::new(0),
            }),
        }
    }
}

/// Completion of a call running on its own task.
///
/// Dropping the future detaches the call; it is not cancelled.
#[must_use = "the call result is only observable through this future"]
pub struct ConnectorFuture<T> {
    handle: JoinHandle<ConnectorResult<T>>,
}

impl<T: Send + 'static> ConnectorFuture<T> {
    pub(crate) fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = ConnectorResult<T>> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(fut),
        }
    }
}

impl<T> ConnectorFuture<T> {
    /// Whether the call has completed
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<T> Future for ConnectorFuture<T> {
    type Output = ConnectorResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(err) => Err(ConnectorError::backend("connector task failed").with_cause(err)),
        })
    }
}

impl<T> fmt::Debug for ConnectorFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorFuture")
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}
