//! Connector registry
//!
//! Maps each [`ConnectorType`] to one long-lived connector, routes calls by
//! type, aggregates health and metrics, and owns shutdown. Connectors are
//! stored type-erased behind [`AnyConnector`] so one registry can hold an
//! HTTP, a queue, a log and a graph query connector side by side.

use super::backend::Backend;
use super::connector::{ConnectorFuture, ResilientConnector};
use crate::error::{ConnectorError, ConnectorResult};
use crate::health::HealthReport;
use crate::metrics::ConnectorMetrics;
use crate::types::{BackendRequest, BackendResponse, ConnectorContext, ConnectorType};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// A connector that accepts the type-erased request envelope
#[async_trait]
pub trait AnyConnector: Send + Sync + fmt::Debug {
    /// Connector type served
    fn connector_type(&self) -> ConnectorType;

    /// Send and wait for the response
    async fn send_sync(
        &self,
        request: BackendRequest,
        context: &ConnectorContext,
    ) -> ConnectorResult<BackendResponse>;

    /// Send on a spawned task
    fn send_async(
        &self,
        request: BackendRequest,
        context: ConnectorContext,
    ) -> ConnectorFuture<BackendResponse>;

    /// Fire-and-forget on a spawned task
    fn send_async_no_response(
        &self,
        request: BackendRequest,
        context: ConnectorContext,
    ) -> ConnectorFuture<()>;

    /// Circuit closed and probe passing
    async fn is_healthy(&self, context: &ConnectorContext) -> bool;

    /// Context for registry-driven probes
    fn health_context(&self) -> Option<ConnectorContext>;

    /// Metrics snapshot
    fn metrics(&self) -> ConnectorMetrics;

    /// Drain and release the backend
    async fn close(&self);
}

fn unwrap_envelope<R>(
    ty: ConnectorType,
    request: BackendRequest,
    context: &ConnectorContext,
    operation: &str,
) -> ConnectorResult<R>
where
    R: TryFrom<BackendRequest, Error = ConnectorError>,
{
    R::try_from(request)
        .map_err(|e| e.or_context(ty, context.endpoint(), context.datacenter(), operation))
}

#[async_trait]
impl<B> AnyConnector for ResilientConnector<B>
where
    B: Backend,
    B::Request: TryFrom<BackendRequest, Error = ConnectorError>,
    B::Response: Into<BackendResponse>,
{
    fn connector_type(&self) -> ConnectorType {
        ResilientConnector::connector_type(self)
    }

    async fn send_sync(
        &self,
        request: BackendRequest,
        context: &ConnectorContext,
    ) -> ConnectorResult<BackendResponse> {
        let request: B::Request =
            unwrap_envelope(self.connector_type(), request, context, "send_sync")?;
        ResilientConnector::send_sync(self, &request, context)
            .await
            .map(Into::into)
    }

    fn send_async(
        &self,
        request: BackendRequest,
        context: ConnectorContext,
    ) -> ConnectorFuture<BackendResponse> {
        let connector = self.clone();
        ConnectorFuture::spawn(async move {
            let request: B::Request =
                unwrap_envelope(connector.connector_type(), request, &context, "send_async")?;
            connector
                .send_async_inline(&request, &context)
                .await
                .map(Into::into)
        })
    }

    fn send_async_no_response(
        &self,
        request: BackendRequest,
        context: ConnectorContext,
    ) -> ConnectorFuture<()> {
        let connector = self.clone();
        ConnectorFuture::spawn(async move {
            let request: B::Request = unwrap_envelope(
                connector.connector_type(),
                request,
                &context,
                "send_async_no_response",
            )?;
            connector
                .send_async_no_response_inline(&request, &context)
                .await
        })
    }

    async fn is_healthy(&self, context: &ConnectorContext) -> bool {
        ResilientConnector::is_healthy(self, context).await
    }

    fn health_context(&self) -> Option<ConnectorContext> {
        ResilientConnector::health_context(self).cloned()
    }

    fn metrics(&self) -> ConnectorMetrics {
        ResilientConnector::metrics(self)
    }

    async fn close(&self) {
        ResilientConnector::close(self).await
    }
}

/// Routes calls to the connector registered for each type.
///
/// The registry owns the connectors it holds and is the component that
/// closes them, on replacement or on [`ConnectorRegistry::shutdown`].
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: RwLock<HashMap<ConnectorType, Arc<dyn AnyConnector>>>,
    shut_down: AtomicBool,
}

impl fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("connectors", &self.connector_types())
            .field("shut_down", &self.shut_down.load(Ordering::Acquire))
            .finish()
    }
}

impl ConnectorRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `connector` under `ty`.
    ///
    /// Fails with a validation error when the connector serves another type,
    /// and with `Unavailable` after shutdown. A connector already registered
    /// under `ty` is replaced and closed.
    pub async fn register<C>(&self, ty: ConnectorType, connector: C) -> ConnectorResult<()>
    where
        C: AnyConnector + 'static,
    {
        if connector.connector_type() != ty {
            return Err(ConnectorError::validation(format!(
                "cannot register a {} connector as {}",
                connector.connector_type(),
                ty
            ))
            .with_connector(ty)
            .with_operation("register"));
        }
        let previous = {
            let mut connectors = self.connectors.write();
            // shutdown flips the flag before draining under this lock
            if self.shut_down.load(Ordering::Acquire) {
                return Err(ConnectorError::unavailable("registry is shut down")
                    .with_connector(ty)
                    .with_operation("register"));
            }
            connectors.insert(ty, Arc::new(connector))
        };
        info!(connector = %ty, replaced = previous.is_some(), "connector registered");
        if let Some(previous) = previous {
            previous.close().await;
        }
        Ok(())
    }

    /// Connector registered for `ty`
    pub fn get(&self, ty: ConnectorType) -> Option<Arc<dyn AnyConnector>> {
        self.connectors.read().get(&ty).cloned()
    }

    /// Whether a connector is registered for `ty`
    pub fn contains(&self, ty: ConnectorType) -> bool {
        self.connectors.read().contains_key(&ty)
    }

    /// Registered types in declaration order
    pub fn connector_types(&self) -> Vec<ConnectorType> {
        let connectors = self.connectors.read();
        ConnectorType::ALL
            .into_iter()
            .filter(|ty| connectors.contains_key(ty))
            .collect()
    }

    /// Number of registered connectors
    pub fn len(&self) -> usize {
        self.connectors.read().len()
    }

    /// Whether no connector is registered
    pub fn is_empty(&self) -> bool {
        self.connectors.read().is_empty()
    }

    fn require(&self, ty: ConnectorType, operation: &str) -> ConnectorResult<Arc<dyn AnyConnector>> {
        self.get(ty).ok_or_else(|| {
            ConnectorError::unavailable(format!("no {} connector registered", ty))
                .with_connector(ty)
                .with_operation(operation)
        })
    }

    /// Send through the connector registered for `ty` and wait
    pub async fn send_sync(
        &self,
        ty: ConnectorType,
        request: impl Into<BackendRequest>,
        context: &ConnectorContext,
    ) -> ConnectorResult<BackendResponse> {
        let connector = self.require(ty, "send_sync")?;
        connector.send_sync(request.into(), context).await
    }

    /// Send through the connector registered for `ty` on a spawned task
    pub fn send_async(
        &self,
        ty: ConnectorType,
        request: impl Into<BackendRequest>,
        context: ConnectorContext,
    ) -> ConnectorFuture<BackendResponse> {
        match self.require(ty, "send_async") {
            Ok(connector) => connector.send_async(request.into(), context),
            Err(err) => ConnectorFuture::spawn(async move { Err(err) }),
        }
    }

    /// Fire-and-forget through the connector registered for `ty`
    pub fn send_async_no_response(
        &self,
        ty: ConnectorType,
        request: impl Into<BackendRequest>,
        context: ConnectorContext,
    ) -> ConnectorFuture<()> {
        match self.require(ty, "send_async_no_response") {
            Ok(connector) => connector.send_async_no_response(request.into(), context),
            Err(err) => ConnectorFuture::spawn(async move { Err(err) }),
        }
    }

    /// Health of the connector for `ty`; unregistered types are unhealthy
    pub async fn is_healthy(&self, ty: ConnectorType, context: &ConnectorContext) -> bool {
        match self.get(ty) {
            Some(connector) => connector.is_healthy(context).await,
            None => false,
        }
    }

    fn snapshot(&self) -> Vec<(ConnectorType, Arc<dyn AnyConnector>)> {
        self.connectors
            .read()
            .iter()
            .map(|(ty, c)| (*ty, Arc::clone(c)))
            .collect()
    }

    /// Probe every connector concurrently.
    ///
    /// Each probe uses the connector's health context, or a local context
    /// named after its type when none was configured.
    pub async fn health_of_all(&self) -> HashMap<ConnectorType, bool> {
        let probes = self.snapshot().into_iter().map(|(ty, connector)| async move {
            let context = connector
                .health_context()
                .unwrap_or_else(|| ConnectorContext::local(ty));
            (ty, connector.is_healthy(&context).await)
        });
        join_all(probes).await.into_iter().collect()
    }

    /// Metrics of every connector
    pub fn metrics_of_all(&self) -> HashMap<ConnectorType, ConnectorMetrics> {
        self.connectors
            .read()
            .iter()
            .map(|(ty, c)| (*ty, c.metrics()))
            .collect()
    }

    /// Probe everything and summarize
    pub async fn health_report(&self) -> HealthReport {
        let health = self.health_of_all().await;
        HealthReport::from_parts(&health, &self.metrics_of_all())
    }

    /// Close every connector concurrently and empty the registry.
    ///
    /// Idempotent; later registrations are refused.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let connectors: Vec<_> = self.connectors.write().drain().collect();
        info!(connectors = connectors.len(), "shutting down connector registry");

        join_all(connectors.iter().map(|(_, c)| c.close())).await;

        for (ty, connector) in &connectors {
            let remaining = connector.metrics().in_flight;
            if remaining > 0 {
                warn!(connector = %ty, in_flight = remaining, "connector closed with calls in flight");
            }
        }
        info!("connector registry shut down");
    }
}
