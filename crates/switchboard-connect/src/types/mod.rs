//! Request, response and context types
//!
//! Each backend kind has an immutable request built through a validating
//! builder, and an immutable response. [`BackendRequest`] and
//! [`BackendResponse`] wrap the four pairs so a registry can route them by
//! [`ConnectorType`] without knowing the concrete types.

mod connector_type;
mod context;
pub mod graph;
pub mod http;
pub mod log;
pub mod queue;

pub use connector_type::ConnectorType;
pub use context::{ConnectorContext, ConnectorContextBuilder};
pub use graph::{GraphQueryRequest, GraphQueryRequestBuilder, GraphQueryResponse};
pub use http::{HttpMethod, HttpRequest, HttpRequestBuilder, HttpResponse};
pub use log::{Acks, LogRequest, LogRequestBuilder, LogResponse, RecordPosition};
pub use queue::{
    DeliveryMode, ExchangePattern, QueueRequest, QueueRequestBuilder, QueueResponse,
};

use crate::error::ConnectorError;
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Any backend request
#[derive(Debug, Clone, PartialEq)]
pub enum BackendRequest {
    Http(HttpRequest),
    Queue(QueueRequest),
    Log(LogRequest),
    GraphQuery(GraphQueryRequest),
}

impl BackendRequest {
    /// Connector type able to serve this request
    pub fn connector_type(&self) -> ConnectorType {
        match self {
            Self::Http(_) => ConnectorType::Http,
            Self::Queue(_) => ConnectorType::Queue,
            Self::Log(_) => ConnectorType::Log,
            Self::GraphQuery(_) => ConnectorType::GraphQuery,
        }
    }

    /// Correlation id carried by the request
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::Http(r) => r.correlation_id(),
            Self::Queue(r) => r.correlation_id(),
            Self::Log(r) => r.correlation_id(),
            Self::GraphQuery(r) => r.correlation_id(),
        }
    }

    /// A copy re-stamped with a new correlation id
    pub fn with_correlation_id(&self, id: impl Into<String>) -> Self {
        match self {
            Self::Http(r) => Self::Http(r.with_correlation_id(id)),
            Self::Queue(r) => Self::Queue(r.with_correlation_id(id)),
            Self::Log(r) => Self::Log(r.with_correlation_id(id)),
            Self::GraphQuery(r) => Self::GraphQuery(r.with_correlation_id(id)),
        }
    }
}

/// Any backend response
#[derive(Debug, Clone, PartialEq)]
pub enum BackendResponse {
    Http(HttpResponse),
    Queue(QueueResponse),
    Log(LogResponse),
    GraphQuery(GraphQueryResponse),
}

impl BackendResponse {
    /// Connector type that produced this response
    pub fn connector_type(&self) -> ConnectorType {
        match self {
            Self::Http(_) => ConnectorType::Http,
            Self::Queue(_) => ConnectorType::Queue,
            Self::Log(_) => ConnectorType::Log,
            Self::GraphQuery(_) => ConnectorType::GraphQuery,
        }
    }

    /// Backend success flag
    pub fn is_success(&self) -> bool {
        match self {
            Self::Http(r) => r.is_success(),
            Self::Queue(r) => r.is_success(),
            Self::Log(r) => r.is_success(),
            Self::GraphQuery(r) => r.is_success(),
        }
    }

    /// Backend-assigned identifier: status code, message id or record position
    pub fn identifier(&self) -> Option<String> {
        match self {
            Self::Http(r) => Some(r.status().to_string()),
            Self::Queue(r) => Some(r.message_id().to_string()),
            Self::Log(r) => r.position().map(ToString::to_string),
            Self::GraphQuery(r) => r
                .request_id()
                .map(str::to_string)
                .or_else(|| Some(r.status().to_string())),
        }
    }

    /// When the response was received
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Http(r) => r.timestamp(),
            Self::Queue(r) => r.timestamp(),
            Self::Log(r) => r.timestamp(),
            Self::GraphQuery(r) => r.timestamp(),
        }
    }

    /// Response payload, if any
    pub fn payload(&self) -> Option<Bytes> {
        match self {
            Self::Http(r) => r.body().cloned(),
            Self::Queue(r) => r.payload().cloned(),
            Self::Log(_) => None,
            Self::GraphQuery(r) => r
                .data()
                .and_then(|d| serde_json::to_vec(d).ok())
                .map(Bytes::from),
        }
    }
}

macro_rules! envelope_conversions {
    ($($variant:ident => $request:ty, $response:ty;)*) => {
        $(
            impl From<$request> for BackendRequest {
                fn from(request: $request) -> Self {
                    Self::$variant(request)
                }
            }

            impl TryFrom<BackendRequest> for $request {
                type Error = ConnectorError;

                fn try_from(request: BackendRequest) -> Result<Self, Self::Error> {
                    match request {
                        BackendRequest::$variant(r) => Ok(r),
                        other => Err(kind_mismatch(ConnectorType::$variant, other.connector_type())),
                    }
                }
            }

            impl From<$response> for BackendResponse {
                fn from(response: $response) -> Self {
                    Self::$variant(response)
                }
            }

            impl TryFrom<BackendResponse> for $response {
                type Error = ConnectorError;

                fn try_from(response: BackendResponse) -> Result<Self, Self::Error> {
                    match response {
                        BackendResponse::$variant(r) => Ok(r),
                        other => Err(kind_mismatch(ConnectorType::$variant, other.connector_type())),
                    }
                }
            }
        )*
    };
}

envelope_conversions! {
    Http => HttpRequest, HttpResponse;
    Queue => QueueRequest, QueueResponse;
    Log => LogRequest, LogResponse;
    GraphQuery => GraphQueryRequest, GraphQueryResponse;
}

fn kind_mismatch(expected: ConnectorType, actual: ConnectorType) -> ConnectorError {
    ConnectorError::validation(format!(
        "{} connector cannot handle a {} message",
        expected, actual
    ))
    .with_connector(expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_envelope_roundtrip_and_mismatch() {
        let req = LogRequest::builder().topic("t").payload("x").build().unwrap();
        let envelope = BackendRequest::from(req.clone());
        assert_eq!(envelope.connector_type(), ConnectorType::Log);

        let err = HttpRequest::try_from(envelope.clone()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(LogRequest::try_from(envelope).unwrap(), req);
    }

    #[test]
    fn test_response_identifier() {
        let resp = BackendResponse::from(LogResponse::stored("orders", 1, 7));
        assert_eq!(resp.identifier().as_deref(), Some("orders-1@7"));
        let resp = BackendResponse::from(QueueResponse::accepted("ID:42"));
        assert_eq!(resp.identifier().as_deref(), Some("ID:42"));
        assert!(resp.is_success());
    }

    #[test]
    fn test_restamp_envelope() {
        let req: BackendRequest = QueueRequest::builder()
            .destination("q")
            .payload("x")
            .build()
            .unwrap()
            .into();
        assert_eq!(req.with_correlation_id("z").correlation_id(), Some("z"));
        assert_eq!(req.correlation_id(), None);
    }
}
