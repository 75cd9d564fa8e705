//! Per-call connector context

use super::ConnectorType;
use crate::error::{ConnectorError, ConnectorResult};
use std::collections::HashMap;
use std::time::Duration;
use switchboard_resilience::{CallOptions, CircuitBreakerConfig, RetryConfig};

/// Immutable per-call configuration passed alongside every request
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorContext {
    endpoint: String,
    datacenter: Option<String>,
    headers: HashMap<String, String>,
    properties: HashMap<String, serde_json::Value>,
    timeout: Option<Duration>,
    correlation_id: Option<String>,
    is_async: bool,
    retry_override: Option<RetryConfig>,
    circuit_breaker_override: Option<CircuitBreakerConfig>,
}

impl ConnectorContext {
    /// Start building a context for `endpoint`
    pub fn builder(endpoint: impl Into<String>) -> ConnectorContextBuilder {
        ConnectorContextBuilder {
            endpoint: endpoint.into(),
            datacenter: None,
            headers: HashMap::new(),
            properties: HashMap::new(),
            timeout: None,
            correlation_id: None,
            is_async: false,
            retry_override: None,
            circuit_breaker_override: None,
        }
    }

    /// Shorthand for a context with only an endpoint
    pub fn for_endpoint(endpoint: impl Into<String>) -> ConnectorResult<Self> {
        Self::builder(endpoint).build()
    }

    /// Context for in-process calls that have no real endpoint, such as
    /// registry-driven health probes; the endpoint is the type name
    pub fn local(connector: ConnectorType) -> Self {
        Self {
            endpoint: connector.as_str().to_string(),
            datacenter: None,
            headers: HashMap::new(),
            properties: HashMap::new(),
            timeout: None,
            correlation_id: None,
            is_async: false,
            retry_override: None,
            circuit_breaker_override: None,
        }
    }

    /// Target endpoint
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Logical datacenter / region tag
    pub fn datacenter(&self) -> Option<&str> {
        self.datacenter.as_deref()
    }

    /// Transport headers
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Look up one header
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Arbitrary backend-specific properties
    pub fn properties(&self) -> &HashMap<String, serde_json::Value> {
        &self.properties
    }

    /// Look up one property
    pub fn property(&self, name: &str) -> Option<&serde_json::Value> {
        self.properties.get(name)
    }

    /// Per-attempt deadline override
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Correlation id of the logical message this call belongs to
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Whether the caller asked for non-blocking invocation
    pub fn is_async(&self) -> bool {
        self.is_async
    }

    /// Retry override for this call
    pub fn retry_override(&self) -> Option<&RetryConfig> {
        self.retry_override.as_ref()
    }

    /// Circuit breaker override for this call
    pub fn circuit_breaker_override(&self) -> Option<&CircuitBreakerConfig> {
        self.circuit_breaker_override.as_ref()
    }

    /// Policy-stack options derived from the overrides
    pub fn call_options(&self) -> CallOptions {
        CallOptions {
            retry: self.retry_override.clone(),
            timeout: self.timeout,
        }
    }

    /// Copy of this context with a different correlation id
    pub fn with_correlation_id(&self, correlation_id: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.correlation_id = Some(correlation_id.into());
        next
    }
}

/// Builder for [`ConnectorContext`]
#[derive(Debug, Clone)]
pub struct ConnectorContextBuilder {
    endpoint: String,
    datacenter: Option<String>,
    headers: HashMap<String, String>,
    properties: HashMap<String, serde_json::Value>,
    timeout: Option<Duration>,
    correlation_id: Option<String>,
    is_async: bool,
    retry_override: Option<RetryConfig>,
    circuit_breaker_override: Option<CircuitBreakerConfig>,
}

impl ConnectorContextBuilder {
    /// Set the datacenter tag
    pub fn datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Add a property
    pub fn property(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Set the per-attempt deadline
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the correlation id
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Mark the call as non-blocking
    pub fn asynchronous(mut self, is_async: bool) -> Self {
        self.is_async = is_async;
        self
    }

    /// Override retry for this call
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry_override = Some(config);
        self
    }

    /// Override the circuit breaker for this call
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker_override = Some(config);
        self
    }

    /// Build the context; an empty endpoint is rejected
    pub fn build(self) -> ConnectorResult<ConnectorContext> {
        if self.endpoint.trim().is_empty() {
            return Err(ConnectorError::validation(
                "connector context requires a non-empty endpoint",
            ));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConnectorError::validation("timeout must be greater than zero"));
        }
        Ok(ConnectorContext {
            endpoint: self.endpoint,
            datacenter: self.datacenter,
            headers: self.headers,
            properties: self.properties,
            timeout: self.timeout,
            correlation_id: self.correlation_id,
            is_async: self.is_async,
            retry_override: self.retry_override,
            circuit_breaker_override: self.circuit_breaker_override,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_builder_reads_back() {
        let ctx = ConnectorContext::builder("https://orders.internal")
            .datacenter("eu-west-1")
            .header("x-tenant", "acme")
            .property("priority", 5)
            .timeout(Duration::from_secs(2))
            .correlation_id("abc-123")
            .asynchronous(true)
            .build()
            .unwrap();

        assert_eq!(ctx.endpoint(), "https://orders.internal");
        assert_eq!(ctx.datacenter(), Some("eu-west-1"));
        assert_eq!(ctx.header("x-tenant"), Some("acme"));
        assert_eq!(ctx.property("priority"), Some(&serde_json::json!(5)));
        assert_eq!(ctx.timeout(), Some(Duration::from_secs(2)));
        assert_eq!(ctx.correlation_id(), Some("abc-123"));
        assert!(ctx.is_async());
        assert!(ctx.retry_override().is_none());
    }

    #[test]
    fn test_empty_endpoint_rejected() {
        let err = ConnectorContext::for_endpoint("  ").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_overrides_become_call_options() {
        let ctx = ConnectorContext::builder("queue://orders")
            .retry(RetryConfig::no_retry())
            .timeout(Duration::from_millis(250))
            .build()
            .unwrap();
        let options = ctx.call_options();
        assert_eq!(options.retry, Some(RetryConfig::no_retry()));
        assert_eq!(options.timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_local_context() {
        let ctx = ConnectorContext::local(ConnectorType::GraphQuery);
        assert_eq!(ctx.endpoint(), "graph_query");
        assert!(ctx.timeout().is_none());
    }

    #[test]
    fn test_with_correlation_id_leaves_original() {
        let ctx = ConnectorContext::for_endpoint("log://events").unwrap();
        let stamped = ctx.with_correlation_id("c-1");
        assert_eq!(ctx.correlation_id(), None);
        assert_eq!(stamped.correlation_id(), Some("c-1"));
    }
}
