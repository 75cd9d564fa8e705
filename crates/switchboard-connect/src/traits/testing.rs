//! Testing utilities for connectors
//!
//! [`MockBackend`] implements [`Backend`] without any external system. It
//! answers from a script of queued outcomes, then from a persistent failure
//! mode if one is set, then from a responder function. Every call is counted
//! and every request recorded, so tests can assert exactly what reached the
//! backend.
//!
//! # Example
//!
//! ```rust,ignore
//! use switchboard_connect::testing::*;
//!
//! #[tokio::test]
//! async fn test_retry_then_success() {
//!     let backend = MockBackend::http()
//!         .then_fail(ErrorKind::BackendCommunication, "connection reset")
//!         .then_respond(HttpResponse::new(200, None));
//!     let connector = ResilientConnector::new(backend.clone());
//!
//!     let response = connector.send_sync(&request, &context).await.unwrap();
//!
//!     assert_eq!(response.status(), 200);
//!     assert_eq!(backend.sync_calls(), 2);
//! }
//! ```

use super::backend::Backend;
use crate::error::{ConnectorError, ConnectorResult, ErrorKind};
use crate::types::{
    ConnectorContext, ConnectorType, GraphQueryRequest, GraphQueryResponse, HttpRequest,
    HttpResponse, LogRequest, LogResponse, QueueRequest, QueueResponse,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Responder<Req, Resp> = Arc<dyn Fn(&Req) -> Resp + Send + Sync>;

/// One scripted outcome
#[derive(Debug, Clone)]
pub enum MockStep<Resp> {
    /// Return this response
    Respond(Resp),
    /// Fail with this kind and message
    Fail(ErrorKind, String),
}

struct MockState<Req, Resp> {
    connector_type: ConnectorType,
    script: Mutex<VecDeque<MockStep<Resp>>>,
    responder: RwLock<Responder<Req, Resp>>,
    failure: Mutex<Option<(ErrorKind, String)>>,
    latency: Mutex<Option<Duration>>,
    healthy: AtomicBool,
    health_fails: AtomicBool,
    close_fails: AtomicBool,
    requests: Mutex<Vec<Req>>,
    sync_calls: AtomicU64,
    async_calls: AtomicU64,
    no_response_calls: AtomicU64,
    health_checks: AtomicU64,
    close_calls: AtomicU64,
}

/// A scriptable in-memory backend.
///
/// Clones share state, so a test can hand one clone to a connector and
/// inspect the other.
pub struct MockBackend<Req, Resp> {
    state: Arc<MockState<Req, Resp>>,
}

/// Mock for the HTTP backend
pub type MockHttpBackend = MockBackend<HttpRequest, HttpResponse>;
/// Mock for the queue backend
pub type MockQueueBackend = MockBackend<QueueRequest, QueueResponse>;
/// Mock for the log backend
pub type MockLogBackend = MockBackend<LogRequest, LogResponse>;
/// Mock for the graph query backend
pub type MockGraphBackend = MockBackend<GraphQueryRequest, GraphQueryResponse>;

impl<Req, Resp> Clone for MockBackend<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<Req, Resp> fmt::Debug for MockBackend<Req, Resp>
where
    Req: Clone + Send + Sync + 'static,
    Resp: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockBackend")
            .field("connector_type", &self.state.connector_type)
            .field("sync_calls", &self.sync_calls())
            .field("async_calls", &self.async_calls())
            .field("no_response_calls", &self.no_response_calls())
            .finish_non_exhaustive()
    }
}

impl<Req, Resp> MockBackend<Req, Resp>
where
    Req: Clone + Send + Sync + 'static,
    Resp: Send + 'static,
{
    /// A healthy mock answering every request with `responder`
    pub fn new<F>(connector_type: ConnectorType, responder: F) -> Self
    where
        F: Fn(&Req) -> Resp + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(MockState {
                connector_type,
                script: Mutex::new(VecDeque::new()),
                responder: RwLock::new(Arc::new(responder)),
                failure: Mutex::new(None),
                latency: Mutex::new(None),
                healthy: AtomicBool::new(true),
                health_fails: AtomicBool::new(false),
                close_fails: AtomicBool::new(false),
                requests: Mutex::new(Vec::new()),
                sync_calls: AtomicU64::new(0),
                async_calls: AtomicU64::new(0),
                no_response_calls: AtomicU64::new(0),
                health_checks: AtomicU64::new(0),
                close_calls: AtomicU64::new(0),
            }),
        }
    }

    /// Replace the responder
    pub fn respond_with<F>(self, responder: F) -> Self
    where
        F: Fn(&Req) -> Resp + Send + Sync + 'static,
    {
        *self.state.responder.write() = Arc::new(responder);
        self
    }

    /// Queue one response
    pub fn then_respond(self, response: Resp) -> Self {
        self.push_step(MockStep::Respond(response));
        self
    }

    /// Queue one failure
    pub fn then_fail(self, kind: ErrorKind, message: impl Into<String>) -> Self {
        self.push_step(MockStep::Fail(kind, message.into()));
        self
    }

    /// Fail every unscripted call until [`MockBackend::recover`]
    pub fn fail_with(self, kind: ErrorKind, message: impl Into<String>) -> Self {
        self.set_failure(kind, message);
        self
    }

    /// Delay every call
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.state.latency.lock() = Some(latency);
        self
    }

    /// Make `do_close` fail
    pub fn fail_on_close(self, fail: bool) -> Self {
        self.state.close_fails.store(fail, Ordering::SeqCst);
        self
    }

    /// Append a scripted outcome
    pub fn push_step(&self, step: MockStep<Resp>) {
        self.state.script.lock().push_back(step);
    }

    /// Start failing every unscripted call
    pub fn set_failure(&self, kind: ErrorKind, message: impl Into<String>) {
        *self.state.failure.lock() = Some((kind, message.into()));
    }

    /// Stop the persistent failure mode
    pub fn recover(&self) {
        *self.state.failure.lock() = None;
    }

    /// Value returned by the health probe
    pub fn set_healthy(&self, healthy: bool) {
        self.state.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Make the health probe return an error
    pub fn fail_health_checks(&self, fail: bool) {
        self.state.health_fails.store(fail, Ordering::SeqCst);
    }

    /// Requests received so far, in arrival order
    pub fn requests(&self) -> Vec<Req> {
        self.state.requests.lock().clone()
    }

    /// Number of `do_send_sync` calls
    pub fn sync_calls(&self) -> u64 {
        self.state.sync_calls.load(Ordering::SeqCst)
    }

    /// Number of `do_send_async` calls
    pub fn async_calls(&self) -> u64 {
        self.state.async_calls.load(Ordering::SeqCst)
    }

    /// Number of `do_send_async_no_response` calls
    pub fn no_response_calls(&self) -> u64 {
        self.state.no_response_calls.load(Ordering::SeqCst)
    }

    /// Calls across all three send hooks
    pub fn total_calls(&self) -> u64 {
        self.sync_calls() + self.async_calls() + self.no_response_calls()
    }

    /// Number of health probes
    pub fn health_checks(&self) -> u64 {
        self.state.health_checks.load(Ordering::SeqCst)
    }

    /// Number of `do_close` calls
    pub fn close_calls(&self) -> u64 {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    async fn answer(&self, counter: &AtomicU64, request: &Req) -> ConnectorResult<Resp> {
        counter.fetch_add(1, Ordering::SeqCst);
        let latency = *self.state.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.state.requests.lock().push(request.clone());

        let step = self.state.script.lock().pop_front();
        match step {
            Some(MockStep::Respond(response)) => return Ok(response),
            Some(MockStep::Fail(kind, message)) => return Err(ConnectorError::new(kind, message)),
            None => {}
        }
        if let Some((kind, message)) = self.state.failure.lock().clone() {
            return Err(ConnectorError::new(kind, message));
        }
        let responder = Arc::clone(&self.state.responder.read());
        Ok(responder(request))
    }
}

impl MockHttpBackend {
    /// An HTTP mock answering `200` with no body
    pub fn http() -> Self {
        Self::new(ConnectorType::Http, |_| HttpResponse::new(200, None))
    }
}

impl MockQueueBackend {
    /// A queue mock accepting every message with a sequential id
    pub fn queue() -> Self {
        let seq = AtomicU64::new(0);
        Self::new(ConnectorType::Queue, move |request: &QueueRequest| {
            let id = seq.fetch_add(1, Ordering::Relaxed) + 1;
            let response = QueueResponse::accepted(format!("ID:mock-{}", id));
            match request.correlation_id() {
                Some(correlation_id) => response.with_correlation_id(correlation_id),
                None => response,
            }
        })
    }
}

impl MockLogBackend {
    /// A log mock appending to partition 0 with increasing offsets
    pub fn log() -> Self {
        let offset = AtomicU64::new(0);
        Self::new(ConnectorType::Log, move |request: &LogRequest| {
            LogResponse::stored(
                request.topic(),
                request.partition().unwrap_or(0),
                offset.fetch_add(1, Ordering::Relaxed),
            )
        })
    }
}

impl MockGraphBackend {
    /// A graph mock answering `200` with an empty result set
    pub fn graph() -> Self {
        Self::new(ConnectorType::GraphQuery, |_| {
            GraphQueryResponse::new(200, Some(serde_json::json!({ "value": [] })))
        })
    }
}

#[async_trait]
impl<Req, Resp> Backend for MockBackend<Req, Resp>
where
    Req: Clone + Send + Sync + 'static,
    Resp: Send + 'static,
{
    type Request = Req;
    type Response = Resp;

    fn connector_type(&self) -> ConnectorType {
        self.state.connector_type
    }

    async fn do_send_sync(&self, request: &Req, _context: &ConnectorContext) -> ConnectorResult<Resp> {
        self.answer(&self.state.sync_calls, request).await
    }

    async fn do_send_async(&self, request: &Req, _context: &ConnectorContext) -> ConnectorResult<Resp> {
        self.answer(&self.state.async_calls, request).await
    }

    async fn do_send_async_no_response(
        &self,
        request: &Req,
        _context: &ConnectorContext,
    ) -> ConnectorResult<()> {
        self.answer(&self.state.no_response_calls, request)
            .await
            .map(|_| ())
    }

    async fn do_health_check(&self, _context: &ConnectorContext) -> ConnectorResult<bool> {
        self.state.health_checks.fetch_add(1, Ordering::SeqCst);
        if self.state.health_fails.load(Ordering::SeqCst) {
            return Err(ConnectorError::backend("health probe failed"));
        }
        Ok(self.state.healthy.load(Ordering::SeqCst))
    }

    async fn do_close(&self) -> ConnectorResult<()> {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.close_fails.load(Ordering::SeqCst) {
            return Err(ConnectorError::backend("close failed"));
        }
        Ok(())
    }
}
