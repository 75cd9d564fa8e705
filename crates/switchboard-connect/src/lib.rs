//! switchboard-connect - Resilient backend connectors and message pipeline
//!
//! Calls to HTTP APIs, message queues, partitioned logs and graph query APIs
//! go through one contract. Each backend adapter implements the four
//! [`Backend`] hooks; [`ResilientConnector`] wraps it in the policy stack of
//! its connector type and normalizes every failure into a [`ConnectorError`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ ConnectorRegistry         route by ConnectorType, health, close  │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ ResilientConnector<B>     Bulkhead → RateLimiter → Retry →       │
//! │                           CircuitBreaker → TimeLimiter → B       │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Backend                   do_send_sync / do_send_async /         │
//! │                           do_send_async_no_response / health     │
//! └──────────────────────────────────────────────────────────────────┘
//!
//! Pipeline: Validate → Enrich → Transform → Route → Operate
//!           (retry derives a new ProcessingContext; terminal failure
//!            rolls back and dead-letters)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use switchboard_connect::prelude::*;
//!
//! let registry = ConnectorRegistry::new();
//! let http = ResilientConnector::with_policies(MyHttpBackend::new(), config.policy_for(ConnectorType::Http));
//! registry.register(ConnectorType::Http, http).await?;
//!
//! let ctx = ConnectorContext::builder("https://orders.internal")
//!     .datacenter("eu-west-1")
//!     .build()?;
//! let request = HttpRequest::builder(HttpMethod::Get).path("/orders/42").build()?;
//! let response = registry.send_sync(ConnectorType::Http, request, &ctx).await?;
//! ```

pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod processing;
pub mod telemetry;
pub mod traits;
pub mod types;

pub use error::{ConnectorError, ConnectorResult, ErrorKind};
pub use traits::testing;
pub use traits::{
    AnyConnector, Backend, ConnectorBuilder, ConnectorFuture, ConnectorRegistry, ConnectorStatus,
    ResilientConnector,
};
pub use types::{BackendRequest, BackendResponse, ConnectorContext, ConnectorType};

// Re-export for adapter implementations
pub use async_trait::async_trait;
pub use switchboard_resilience as resilience;

/// Everything an adapter or pipeline author usually needs
pub mod prelude {
    pub use crate::config::SwitchboardConfig;
    pub use crate::error::{ConnectorError, ConnectorResult, ErrorKind};
    pub use crate::health::{HealthReport, HealthStatus};
    pub use crate::metrics::ConnectorMetrics;
    pub use crate::processing::{
        DeadLetter, DeadLetterSink, DeliverySession, Pipeline, PipelineError, PipelinePolicy,
        ProcessingContext, RetryEntry, SharedProcessingContext, Stage, StageError, StageHandler,
    };
    pub use crate::traits::{AnyConnector, Backend, ConnectorRegistry, ResilientConnector};
    pub use crate::types::{
        BackendRequest, BackendResponse, ConnectorContext, ConnectorType, GraphQueryRequest,
        GraphQueryResponse, HttpMethod, HttpRequest, HttpResponse, LogRequest, LogResponse,
        QueueRequest, QueueResponse,
    };
    pub use async_trait::async_trait;
    pub use switchboard_resilience::{
        CircuitBreakerConfig, CircuitState, PolicyError, PolicyStackConfig, RetryConfig,
    };
}
