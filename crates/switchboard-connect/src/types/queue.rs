//! Message queue request/response pair
//!
//! Request-response exchanges only name where a reply should go. The core
//! never waits for or correlates the reply; that is up to the adapter.

use crate::error::{ConnectorError, ConnectorResult};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Highest message priority accepted by queue backends
pub const MAX_PRIORITY: u8 = 9;

/// Message persistence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Survives a broker restart
    #[default]
    Persistent,
    /// May be lost on broker restart
    NonPersistent,
}

/// Exchange pattern of a queue send
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangePattern {
    /// Send only
    #[default]
    FireAndForget,
    /// Send with a reply destination
    RequestResponse,
}

/// An immutable queue message to send
#[derive(Debug, Clone, PartialEq)]
pub struct QueueRequest {
    destination: String,
    payload: Bytes,
    headers: HashMap<String, String>,
    correlation_id: Option<String>,
    message_group: Option<String>,
    delivery_mode: DeliveryMode,
    priority: Option<u8>,
    time_to_live: Option<Duration>,
    exchange_pattern: ExchangePattern,
    reply_to: Option<String>,
}

impl QueueRequest {
    /// Start building a request
    pub fn builder() -> QueueRequestBuilder {
        QueueRequestBuilder::default()
    }

    /// Destination queue
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Message payload
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Message headers
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Correlation id
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Ordering group for FIFO queues
    pub fn message_group(&self) -> Option<&str> {
        self.message_group.as_deref()
    }

    /// Persistence
    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    /// Priority (0-9)
    pub fn priority(&self) -> Option<u8> {
        self.priority
    }

    /// Expiry after send
    pub fn time_to_live(&self) -> Option<Duration> {
        self.time_to_live
    }

    /// Exchange pattern
    pub fn exchange_pattern(&self) -> ExchangePattern {
        self.exchange_pattern
    }

    /// Reply destination for request-response exchanges
    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    /// A copy re-stamped with a new correlation id
    pub fn with_correlation_id(&self, id: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.correlation_id = Some(id.into());
        next
    }
}

/// Validating builder for [`QueueRequest`]
#[derive(Debug, Clone, Default)]
pub struct QueueRequestBuilder {
    destination: Option<String>,
    payload: Option<Bytes>,
    headers: HashMap<String, String>,
    correlation_id: Option<String>,
    message_group: Option<String>,
    delivery_mode: DeliveryMode,
    priority: Option<u8>,
    time_to_live: Option<Duration>,
    exchange_pattern: ExchangePattern,
    reply_to: Option<String>,
}

impl QueueRequestBuilder {
    /// Set the destination queue (mandatory)
    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Set the payload (mandatory, non-empty)
    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
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

    /// Set the FIFO ordering group
    pub fn message_group(mut self, group: impl Into<String>) -> Self {
        self.message_group = Some(group.into());
        self
    }

    /// Set persistence
    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Set the priority (0-9)
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the time to live
    pub fn time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    /// Set the exchange pattern
    pub fn exchange_pattern(mut self, pattern: ExchangePattern) -> Self {
        self.exchange_pattern = pattern;
        self
    }

    /// Set the reply destination
    pub fn reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Validate and build
    pub fn build(self) -> ConnectorResult<QueueRequest> {
        let destination = non_empty(self.destination)
            .ok_or_else(|| ConnectorError::validation("queue request requires a destination"))?;
        let payload = self
            .payload
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ConnectorError::validation("queue request requires a payload"))?;

        if let Some(priority) = self.priority {
            if priority > MAX_PRIORITY {
                return Err(ConnectorError::validation(format!(
                    "priority {} out of range 0..={}",
                    priority, MAX_PRIORITY
                )));
            }
        }
        if self.time_to_live.is_some_and(|ttl| ttl.is_zero()) {
            return Err(ConnectorError::validation("time to live must be greater than zero"));
        }

        let reply_to = non_empty(self.reply_to);
        match (self.exchange_pattern, &reply_to) {
            (ExchangePattern::RequestResponse, None) => {
                return Err(ConnectorError::validation(
                    "request-response exchange requires a reply destination",
                ))
            }
            (ExchangePattern::FireAndForget, Some(_)) => {
                return Err(ConnectorError::validation(
                    "reply destination is only valid for request-response exchanges",
                ))
            }
            _ => {}
        }

        Ok(QueueRequest {
            destination,
            payload,
            headers: self.headers,
            correlation_id: self.correlation_id,
            message_group: self.message_group,
            delivery_mode: self.delivery_mode,
            priority: self.priority,
            time_to_live: self.time_to_live,
            exchange_pattern: self.exchange_pattern,
            reply_to,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Broker acknowledgement of a queue send
#[derive(Debug, Clone, PartialEq)]
pub struct QueueResponse {
    message_id: String,
    success: bool,
    correlation_id: Option<String>,
    payload: Option<Bytes>,
    timestamp: DateTime<Utc>,
}

impl QueueResponse {
    /// A successful acknowledgement received now
    pub fn accepted(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            success: true,
            correlation_id: None,
            payload: None,
            timestamp: Utc::now(),
        }
    }

    /// A negative acknowledgement received now
    pub fn rejected(message_id: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::accepted(message_id)
        }
    }

    /// Attach the correlation id echoed by the broker
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Attach a reply payload supplied by the adapter
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Broker-assigned message id
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Whether the broker accepted the message
    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Correlation id
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Reply payload, if the adapter correlated one
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// When the acknowledgement was received
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
