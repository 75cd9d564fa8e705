//! Graph query request/response pair

use crate::error::{ConnectorError, ConnectorResult};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Largest page a single query may request
pub const MAX_PAGE_SIZE: u32 = 999;

/// An immutable graph query
#[derive(Debug, Clone, PartialEq)]
pub struct GraphQueryRequest {
    resource: String,
    query: String,
    variables: Map<String, Value>,
    api_version: Option<String>,
    page_size: Option<u32>,
    headers: HashMap<String, String>,
    correlation_id: Option<String>,
}

impl GraphQueryRequest {
    /// Start building a query
    pub fn builder() -> GraphQueryRequestBuilder {
        GraphQueryRequestBuilder::default()
    }

    /// Resource path the query targets
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Query text (filter / select expression)
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Bound variables
    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    /// API version
    pub fn api_version(&self) -> Option<&str> {
        self.api_version.as_deref()
    }

    /// Requested page size
    pub fn page_size(&self) -> Option<u32> {
        self.page_size
    }

    /// Request headers
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Correlation id
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

/// Validating builder for [`GraphQueryRequest`]
#[derive(Debug, Clone, Default)]
pub struct GraphQueryRequestBuilder {
    resource: Option<String>,
    query: Option<String>,
    variables: Map<String, Value>,
    api_version: Option<String>,
    page_size: Option<u32>,
    headers: HashMap<String, String>,
    correlation_id: Option<String>,
}

impl GraphQueryRequestBuilder {
    /// Set the resource path (mandatory)
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Set the query text (mandatory)
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Bind a variable
    pub fn variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Set the API version
    pub fn api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = Some(version.into());
        self
    }

    /// Set the page size (1..=999)
    pub fn page_size(mut self, size: u32) -> Self {
        self.page_size = Some(size);
        self
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the correlation id
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Validate and build
    pub fn build(self) -> ConnectorResult<GraphQueryRequest> {
        let resource = self
            .resource
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| ConnectorError::validation("graph query requires a resource"))?;
        let query = self
            .query
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| ConnectorError::validation("graph query requires a query"))?;
        if let Some(size) = self.page_size {
            if size == 0 || size > MAX_PAGE_SIZE {
                return Err(ConnectorError::validation(format!(
                    "page size {} out of range 1..={}",
                    size, MAX_PAGE_SIZE
                )));
            }
        }
        Ok(GraphQueryRequest {
            resource,
            query,
            variables: self.variables,
            api_version: self.api_version,
            page_size: self.page_size,
            headers: self.headers,
            correlation_id: self.correlation_id,
        })
    }
}

/// Result of a graph query
#[derive(Debug, Clone, PartialEq)]
pub struct GraphQueryResponse {
    status: u16,
    request_id: Option<String>,
    data: Option<Value>,
    next_link: Option<String>,
    errors: Vec<String>,
    timestamp: DateTime<Utc>,
}

impl GraphQueryResponse {
    /// A response received now
    pub fn new(status: u16, data: Option<Value>) -> Self {
        Self {
            status,
            request_id: None,
            data,
            next_link: None,
            errors: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attach the backend request id
    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Attach the link to the next page
    pub fn with_next_link(mut self, link: impl Into<String>) -> Self {
        self.next_link = Some(link.into());
        self
    }

    /// Attach backend-reported errors
    pub fn with_errors(mut self, errors: Vec<String>) -> Self {
        self.errors = errors;
        self
    }

    /// Status code
    pub fn status(&self) -> u16 {
        self.status
    }

    /// 2xx status and no reported errors
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) && self.errors.is_empty()
    }

    /// Backend request id
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Result data
    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// Link to the next page, when paged
    pub fn next_link(&self) -> Option<&str> {
        self.next_link.as_deref()
    }

    /// Backend-reported errors
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// When the response was received
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_reads_back() {
        let req = GraphQueryRequest::builder()
            .resource("/users")
            .query("department eq 'Sales'")
            .variable("top", 10)
            .api_version("v1.0")
            .page_size(50)
            .header("consistency", "eventual")
            .correlation_id("c-2")
            .build()
            .unwrap();

        assert_eq!(req.resource(), "/users");
        assert_eq!(req.query(), "department eq 'Sales'");
        assert_eq!(req.variables().get("top"), Some(&json!(10)));
        assert_eq!(req.api_version(), Some("v1.0"));
        assert_eq!(req.page_size(), Some(50));
        assert_eq!(
            req.headers().get("consistency").map(String::as_str),
            Some("eventual")
        );
        assert_eq!(req.correlation_id(), Some("c-2"));
    }

    #[test]
    fn test_mandatory_fields() {
        assert!(GraphQueryRequest::builder().query("x").build().is_err());
        assert!(GraphQueryRequest::builder().resource("/x").build().is_err());
    }

    #[test]
    fn test_page_size_range() {
        let build = |size| {
            GraphQueryRequest::builder()
                .resource("/x")
                .query("q")
                .page_size(size)
                .build()
        };
        assert!(build(0).is_err());
        assert!(build(1000).is_err());
        assert!(build(999).is_ok());
    }

    #[test]
    fn test_response_success_requires_no_errors() {
        let ok = GraphQueryResponse::new(200, Some(json!({"value": []})));
        assert!(ok.is_success());
        let partial = ok.clone().with_errors(vec!["throttled shard".into()]);
        assert!(!partial.is_success());
    }
}
