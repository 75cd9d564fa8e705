//! Pub/sub log request/response pair

use crate::error::{ConnectorError, ConnectorResult};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Acknowledgement level requested from the log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Acks {
    /// Do not wait for any acknowledgement
    None,
    /// Wait for the partition leader
    Leader,
    /// Wait for all in-sync replicas
    #[default]
    All,
}

/// An immutable record to append to a topic
#[derive(Debug, Clone, PartialEq)]
pub struct LogRequest {
    topic: String,
    key: Option<Bytes>,
    payload: Bytes,
    partition: Option<u32>,
    headers: HashMap<String, String>,
    timestamp: Option<DateTime<Utc>>,
    acks: Acks,
    idempotent: bool,
}

impl LogRequest {
    /// Start building a record
    pub fn builder() -> LogRequestBuilder {
        LogRequestBuilder::default()
    }

    /// Target topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Partitioning key
    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    /// Record value
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Explicit partition, overriding key-based assignment
    pub fn partition(&self) -> Option<u32> {
        self.partition
    }

    /// Record headers
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Producer-assigned timestamp
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    /// Acknowledgement level
    pub fn acks(&self) -> Acks {
        self.acks
    }

    /// Whether the producer deduplicates retried sends
    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    /// Correlation id carried in the headers
    pub fn correlation_id(&self) -> Option<&str> {
        self.headers.get(CORRELATION_HEADER).map(String::as_str)
    }

    /// A copy with the correlation header re-stamped
    pub fn with_correlation_id(&self, id: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.headers.insert(CORRELATION_HEADER.to_string(), id.into());
        next
    }
}

/// Header used to carry the correlation id on log records
pub const CORRELATION_HEADER: &str = "correlation-id";

/// Validating builder for [`LogRequest`]
#[derive(Debug, Clone, Default)]
pub struct LogRequestBuilder {
    topic: Option<String>,
    key: Option<Bytes>,
    payload: Option<Bytes>,
    partition: Option<u32>,
    headers: HashMap<String, String>,
    timestamp: Option<DateTime<Utc>>,
    acks: Acks,
    idempotent: bool,
}

impl LogRequestBuilder {
    /// Set the topic (mandatory)
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set the partitioning key
    pub fn key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the value (mandatory)
    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Pin the record to a partition
    pub fn partition(mut self, partition: u32) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the correlation id header
    pub fn correlation_id(self, id: impl Into<String>) -> Self {
        self.header(CORRELATION_HEADER, id)
    }

    /// Set the producer timestamp
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Set the acknowledgement level
    pub fn acks(mut self, acks: Acks) -> Self {
        self.acks = acks;
        self
    }

    /// Request idempotent delivery
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    /// Validate and build
    pub fn build(self) -> ConnectorResult<LogRequest> {
        let topic = self
            .topic
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ConnectorError::validation("log record requires a topic"))?;
        if topic.chars().any(char::is_whitespace) {
            return Err(ConnectorError::validation(format!(
                "topic '{}' must not contain whitespace",
                topic
            )));
        }
        let payload = self
            .payload
            .ok_or_else(|| ConnectorError::validation("log record requires a payload"))?;
        if self.idempotent && self.acks != Acks::All {
            return Err(ConnectorError::validation(
                "idempotent delivery requires acks=all",
            ));
        }

        Ok(LogRequest {
            topic,
            key: self.key,
            payload,
            partition: self.partition,
            headers: self.headers,
            timestamp: self.timestamp,
            acks: self.acks,
            idempotent: self.idempotent,
        })
    }
}

/// Position assigned to an appended record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordPosition {
    /// Topic name
    pub topic: String,
    /// Partition index
    pub partition: u32,
    /// Offset within the partition
    pub offset: u64,
}

impl fmt::Display for RecordPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}@{}", self.topic, self.partition, self.offset)
    }
}

/// Acknowledgement of an append
#[derive(Debug, Clone, PartialEq)]
pub struct LogResponse {
    position: Option<RecordPosition>,
    success: bool,
    timestamp: DateTime<Utc>,
}

impl LogResponse {
    /// A record stored at `position`
    pub fn stored(topic: impl Into<String>, partition: u32, offset: u64) -> Self {
        Self {
            position: Some(RecordPosition {
                topic: topic.into(),
                partition,
                offset,
            }),
            success: true,
            timestamp: Utc::now(),
        }
    }

    /// A send with `acks=none`; no position is known
    pub fn unacknowledged() -> Self {
        Self {
            position: None,
            success: true,
            timestamp: Utc::now(),
        }
    }

    /// Where the record landed
    pub fn position(&self) -> Option<&RecordPosition> {
        self.position.as_ref()
    }

    /// Whether the append succeeded
    pub fn is_success(&self) -> bool {
        self.success
    }

    /// When the acknowledgement was received
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
