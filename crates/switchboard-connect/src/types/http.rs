//! HTTP request/response pair

use crate::error::{ConnectorError, ConnectorResult};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// HTTP method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// Whether requests with this method carry a body
    pub fn has_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// An immutable HTTP request
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    method: HttpMethod,
    path: String,
    query: Vec<(String, String)>,
    headers: HashMap<String, String>,
    body: Option<Bytes>,
    correlation_id: Option<String>,
}

impl HttpRequest {
    /// Start building a request
    pub fn builder(method: HttpMethod) -> HttpRequestBuilder {
        HttpRequestBuilder {
            method,
            path: None,
            query: Vec::new(),
            headers: HashMap::new(),
            body: None,
            correlation_id: None,
        }
    }

    /// Request method
    pub fn method(&self) -> HttpMethod {
        self.method
    }

    /// Request path, starting with `/`
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Query parameters in insertion order
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// Request headers
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Request body
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Correlation id, sent as a header by adapters
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// A copy re-stamped with a new correlation id
    pub fn with_correlation_id(&self, id: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.correlation_id = Some(id.into());
        next
    }
}

/// Validating builder for [`HttpRequest`]
#[derive(Debug, Clone)]
pub struct HttpRequestBuilder {
    method: HttpMethod,
    path: Option<String>,
    query: Vec<(String, String)>,
    headers: HashMap<String, String>,
    body: Option<Bytes>,
    correlation_id: Option<String>,
}

impl HttpRequestBuilder {
    /// Set the path (mandatory)
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Append a query parameter
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the body (mandatory for POST, PUT and PATCH)
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set the correlation id
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Validate and build
    pub fn build(self) -> ConnectorResult<HttpRequest> {
        let path = match self.path {
            Some(p) if !p.trim().is_empty() => p,
            _ => return Err(ConnectorError::validation("http request requires a path")),
        };
        if !path.starts_with('/') {
            return Err(ConnectorError::validation(format!(
                "http path '{}' must start with '/'",
                path
            )));
        }
        match (self.method.has_body(), &self.body) {
            (true, None) => {
                return Err(ConnectorError::validation(format!(
                    "{} request requires a body",
                    self.method
                )))
            }
            (false, Some(_)) => {
                return Err(ConnectorError::validation(format!(
                    "{} request must not carry a body",
                    self.method
                )))
            }
            _ => {}
        }
        Ok(HttpRequest {
            method: self.method,
            path,
            query: self.query,
            headers: self.headers,
            body: self.body,
            correlation_id: self.correlation_id,
        })
    }
}

/// An immutable HTTP response
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    status: u16,
    headers: HashMap<String, String>,
    body: Option<Bytes>,
    timestamp: DateTime<Utc>,
}

impl HttpResponse {
    /// Create a response received now
    pub fn new(status: u16, body: Option<Bytes>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body,
            timestamp: Utc::now(),
        }
    }

    /// Attach response headers
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Status code
    pub fn status(&self) -> u16 {
        self.status
    }

    /// True for 2xx statuses
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Response headers
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Response body
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// When the response was received
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_reads_back() {
        let req = HttpRequest::builder(HttpMethod::Post)
            .path("/v1/orders")
            .query("dry_run", "true")
            .header("content-type", "application/json")
            .body(r#"{"id":1}"#)
            .correlation_id("c-1")
            .build()
            .unwrap();

        assert_eq!(req.method(), HttpMethod::Post);
        assert_eq!(req.path(), "/v1/orders");
        assert_eq!(req.query(), &[("dry_run".to_string(), "true".to_string())]);
        assert_eq!(
            req.headers().get("content-type").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(req.body().unwrap().as_ref(), br#"{"id":1}"#);
        assert_eq!(req.correlation_id(), Some("c-1"));
    }

    #[test]
    fn test_missing_path_rejected() {
        assert!(HttpRequest::builder(HttpMethod::Get).build().is_err());
        assert!(HttpRequest::builder(HttpMethod::Get)
            .path("orders")
            .build()
            .is_err());
    }

    #[test]
    fn test_body_rules() {
        assert!(HttpRequest::builder(HttpMethod::Post)
            .path("/x")
            .build()
            .is_err());
        assert!(HttpRequest::builder(HttpMethod::Get)
            .path("/x")
            .body("nope")
            .build()
            .is_err());
    }

    #[test]
    fn test_response_success() {
        assert!(HttpResponse::new(204, None).is_success());
        assert!(!HttpResponse::new(503, None).is_success());
    }
}
