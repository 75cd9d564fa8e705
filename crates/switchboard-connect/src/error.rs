//! Error types for switchboard-connect
//!
//! Every policy rejection and backend failure surfaces as one normalized
//! [`ConnectorError`]. Its [`ErrorKind`] plus the structured context fields
//! (connector type, endpoint, datacenter, operation, code) are enough to route
//! or alert on a failure without parsing its message.

use crate::types::ConnectorType;
use serde::Serialize;
use std::fmt;
use switchboard_resilience::PolicyError;
use thiserror::Error;

/// Result type alias for connector operations
pub type ConnectorResult<T> = std::result::Result<T, ConnectorError>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Classification of a connector failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid request, context or configuration
    Validation,
    /// Credentials rejected by the backend
    Authentication,
    /// No bulkhead slot within the admission wait
    BulkheadRejected,
    /// No rate limiter permit within the timeout
    RateLimited,
    /// Circuit breaker rejected the call
    CircuitOpen,
    /// Deadline expired
    TimedOut,
    /// Transport or backend-side failure
    BackendCommunication,
    /// Committing the delivery session failed
    SessionCommit,
    /// Rolling back the delivery session failed
    SessionRollback,
    /// All attempts failed; the cause is the last failure
    RetryExhausted,
    /// No connector registered for the type, or the connector is closed
    Unavailable,
}

impl ErrorKind {
    /// Human-readable label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation error",
            Self::Authentication => "authentication error",
            Self::BulkheadRejected => "bulkhead rejected",
            Self::RateLimited => "rate limited",
            Self::CircuitOpen => "circuit open",
            Self::TimedOut => "timed out",
            Self::BackendCommunication => "backend communication error",
            Self::SessionCommit => "session commit error",
            Self::SessionRollback => "session rollback error",
            Self::RetryExhausted => "retry exhausted",
            Self::Unavailable => "connector unavailable",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized connector failure
#[derive(Debug, Error)]
#[error("{kind}: {message}{}", render_context(.connector, .operation, .endpoint, .code))]
pub struct ConnectorError {
    kind: ErrorKind,
    message: String,
    connector: Option<ConnectorType>,
    endpoint: Option<String>,
    datacenter: Option<String>,
    operation: Option<String>,
    code: Option<i32>,
    #[source]
    cause: Option<BoxError>,
}

fn render_context(
    connector: &Option<ConnectorType>,
    operation: &Option<String>,
    endpoint: &Option<String>,
    code: &Option<i32>,
) -> String {
    let mut parts = Vec::new();
    if let Some(connector) = connector {
        parts.push(format!("connector={}", connector));
    }
    if let Some(operation) = operation {
        parts.push(format!("operation={}", operation));
    }
    if let Some(endpoint) = endpoint {
        parts.push(format!("endpoint={}", endpoint));
    }
    if let Some(code) = code {
        parts.push(format!("code={}", code));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl ConnectorError {
    /// Create an error of the given kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            connector: None,
            endpoint: None,
            datacenter: None,
            operation: None,
            code: None,
            cause: None,
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, msg)
    }

    /// Create an authentication error
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, msg)
    }

    /// Create a backend communication error
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::BackendCommunication, msg)
    }

    /// Create a timeout error
    pub fn timed_out(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::TimedOut, msg)
    }

    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, msg)
    }

    /// Set the connector type
    pub fn with_connector(mut self, connector: ConnectorType) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Set the target endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the datacenter tag
    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }

    /// Set the failing operation name
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Set a numeric error code (HTTP status, broker code, ...)
    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach the causing failure
    pub fn with_cause(mut self, cause: impl Into<BoxError>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Fill in context fields that are still unset
    pub fn or_context(
        mut self,
        connector: ConnectorType,
        endpoint: &str,
        datacenter: Option<&str>,
        operation: &str,
    ) -> Self {
        self.connector.get_or_insert(connector);
        if self.endpoint.is_none() {
            self.endpoint = Some(endpoint.to_string());
        }
        if self.datacenter.is_none() {
            self.datacenter = datacenter.map(str::to_string);
        }
        if self.operation.is_none() {
            self.operation = Some(operation.to_string());
        }
        self
    }

    /// Normalize a policy-stack failure.
    ///
    /// Exhausted retries become [`ErrorKind::RetryExhausted`] with the last
    /// attempt's normalized failure as cause; see [`ConnectorError::last_failure`].
    pub fn from_policy(err: PolicyError<ConnectorError>) -> Self {
        let message = err.to_string();
        match err {
            PolicyError::Inner(e) => e,
            PolicyError::BulkheadFull { .. } => Self::new(ErrorKind::BulkheadRejected, message),
            PolicyError::RateLimited { .. } => Self::new(ErrorKind::RateLimited, message),
            PolicyError::CircuitOpen { .. } => Self::new(ErrorKind::CircuitOpen, message),
            PolicyError::TimedOut { .. } => Self::new(ErrorKind::TimedOut, message),
            PolicyError::RetryExhausted { attempts, last, .. } => {
                let last = Self::from_policy(*last);
                Self::new(
                    ErrorKind::RetryExhausted,
                    format!("giving up after {} attempt(s)", attempts),
                )
                .with_cause(last)
            }
        }
    }

    /// Failure classification
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Message without context
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Connector type the failure belongs to
    pub fn connector(&self) -> Option<ConnectorType> {
        self.connector
    }

    /// Target endpoint
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Datacenter tag
    pub fn datacenter(&self) -> Option<&str> {
        self.datacenter.as_deref()
    }

    /// Failing operation
    pub fn operation(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    /// Numeric error code
    pub fn code(&self) -> Option<i32> {
        self.code
    }

    /// The failure of the final attempt, for [`ErrorKind::RetryExhausted`]
    pub fn last_failure(&self) -> Option<&ConnectorError> {
        if self.kind != ErrorKind::RetryExhausted {
            return None;
        }
        self.cause
            .as_deref()
            .and_then(|c| c.downcast_ref::<ConnectorError>())
    }

    /// Kind of the underlying failure, looking through retry exhaustion
    pub fn root_kind(&self) -> ErrorKind {
        self.last_failure()
            .map(ConnectorError::root_kind)
            .unwrap_or(self.kind)
    }

    /// Whether another attempt could succeed.
    ///
    /// Admission rejections count as retryable here: they are final for the
    /// attempt that hit them but a later pipeline attempt may be admitted.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.kind,
            ErrorKind::Validation
                | ErrorKind::Authentication
                | ErrorKind::SessionCommit
                | ErrorKind::SessionRollback
                | ErrorKind::Unavailable
        )
    }
}

impl From<validator::ValidationErrors> for ConnectorError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::validation(errors.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        let err = ConnectorError::backend("connection refused")
            .with_connector(ConnectorType::Http)
            .with_operation("send_sync")
            .with_endpoint("https://api.internal")
            .with_code(502);
        assert_eq!(
            err.to_string(),
            "backend communication error: connection refused (connector=http, operation=send_sync, endpoint=https://api.internal, code=502)"
        );
    }

    #[test]
    fn test_retryable_check() {
        assert!(ConnectorError::backend("reset").is_retryable());
        assert!(ConnectorError::timed_out("5s").is_retryable());
        assert!(ConnectorError::new(ErrorKind::CircuitOpen, "open").is_retryable());
        assert!(!ConnectorError::validation("no payload").is_retryable());
        assert!(!ConnectorError::authentication("bad token").is_retryable());
        assert!(!ConnectorError::new(ErrorKind::SessionCommit, "commit").is_retryable());
        assert!(!ConnectorError::unavailable("closed").is_retryable());
    }

    #[test]
    fn test_from_policy_rejections() {
        let err = ConnectorError::from_policy(PolicyError::BulkheadFull {
            name: "queue-bulkhead".into(),
            max_wait: Duration::from_secs(5),
        });
        assert_eq!(err.kind(), ErrorKind::BulkheadRejected);
        assert!(err.message().contains("queue-bulkhead"));

        let err = ConnectorError::from_policy(PolicyError::TimedOut {
            name: "http-time-limiter".into(),
            after: Duration::from_secs(1),
        });
        assert_eq!(err.kind(), ErrorKind::TimedOut);
    }

    #[test]
    fn test_from_policy_exhaustion_keeps_last_kind() {
        let err = ConnectorError::from_policy(PolicyError::RetryExhausted {
            name: "http-retry".into(),
            attempts: 3,
            last: Box::new(PolicyError::Inner(ConnectorError::backend("503").with_code(503))),
        });
        assert_eq!(err.kind(), ErrorKind::RetryExhausted);
        assert_eq!(err.root_kind(), ErrorKind::BackendCommunication);
        assert_eq!(err.last_failure().and_then(|e| e.code()), Some(503));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_or_context_keeps_existing_fields() {
        let err = ConnectorError::backend("down")
            .with_endpoint("primary")
            .or_context(ConnectorType::Log, "fallback", Some("eu-west"), "send_async");
        assert_eq!(err.endpoint(), Some("primary"));
        assert_eq!(err.datacenter(), Some("eu-west"));
        assert_eq!(err.operation(), Some("send_async"));
        assert_eq!(err.connector(), Some(ConnectorType::Log));
    }
}
