//! Backend capability contract
//!
//! A backend adapter implements the protocol-specific hooks. It knows nothing
//! about bulkheads, retries or circuit breakers; [`ResilientConnector`]
//! decorates it with the policy stack.
//!
//! [`ResilientConnector`]: super::connector::ResilientConnector
//!
//! # Example
//!
//! ```rust,ignore
//! struct OrdersApi { client: reqwest::Client }
//!
//! #[async_trait]
//! impl Backend for OrdersApi {
//!     type Request = HttpRequest;
//!     type Response = HttpResponse;
//!
//!     fn connector_type(&self) -> ConnectorType { ConnectorType::Http }
//!
//!     async fn do_send_sync(&self, req: &HttpRequest, ctx: &ConnectorContext)
//!         -> ConnectorResult<HttpResponse> {
//!         // perform the request
//!     }
//!
//!     async fn do_health_check(&self, ctx: &ConnectorContext) -> ConnectorResult<bool> {
//!         Ok(true)
//!     }
//! }
//! ```

use crate::error::ConnectorResult;
use crate::types::{ConnectorContext, ConnectorType};
use async_trait::async_trait;

/// Protocol-specific hooks wrapped by the resilient connector
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Request type accepted by this backend
    type Request: Send + Sync + 'static;
    /// Response type produced by this backend
    type Response: Send + 'static;

    /// Backend kind; scopes the connector's policy instances
    fn connector_type(&self) -> ConnectorType;

    /// Send and wait for the backend's response
    async fn do_send_sync(
        &self,
        request: &Self::Request,
        context: &ConnectorContext,
    ) -> ConnectorResult<Self::Response>;

    /// Send on the non-blocking path.
    ///
    /// Backends with a distinct asynchronous client override this; the
    /// default delegates to [`Backend::do_send_sync`].
    async fn do_send_async(
        &self,
        request: &Self::Request,
        context: &ConnectorContext,
    ) -> ConnectorResult<Self::Response> {
        self.do_send_sync(request, context).await
    }

    /// Fire-and-forget send; success means the backend accepted the message
    async fn do_send_async_no_response(
        &self,
        request: &Self::Request,
        context: &ConnectorContext,
    ) -> ConnectorResult<()> {
        self.do_send_async(request, context).await.map(|_| ())
    }

    /// Backend-specific health probe
    async fn do_health_check(&self, context: &ConnectorContext) -> ConnectorResult<bool>;

    /// Release backend resources
    async fn do_close(&self) -> ConnectorResult<()> {
        Ok(())
    }
}
