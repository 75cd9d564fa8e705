//! Per-message processing context

use super::retry_context::{FailureCause, RetryContext};
use crate::error::{ConnectorError, ConnectorResult, ErrorKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use switchboard_resilience::Backoff;
use tracing::debug;
use uuid::Uuid;

/// Delivery session the inbound message was received on
#[async_trait]
pub trait DeliverySession: Send + Sync {
    /// Whether commit / rollback have any effect
    fn is_transactional(&self) -> bool;

    /// Acknowledge the message
    async fn commit(&self) -> anyhow::Result<()>;

    /// Return the message to the source
    async fn rollback(&self) -> anyhow::Result<()>;
}

/// State of one inbound message while it moves through the pipeline.
///
/// Cheap to clone: the message, the session and the attribute map are
/// shared. Setting an attribute copies the map only if another context still
/// holds it, so a retired context keeps the attributes it was retired with.
pub struct ProcessingContext<M> {
    message: Arc<M>,
    session: Option<Arc<dyn DeliverySession>>,
    correlation_id: String,
    attributes: Arc<HashMap<String, Value>>,
    retry: Option<RetryContext>,
    max_attempts: u32,
    first_attempt_at: DateTime<Utc>,
    processing_started_at: DateTime<Utc>,
}

impl<M> Clone for ProcessingContext<M> {
    fn clone(&self) -> Self {
        Self {
            message: Arc::clone(&self.message),
            session: self.session.clone(),
            correlation_id: self.correlation_id.clone(),
            attributes: Arc::clone(&self.attributes),
            retry: self.retry.clone(),
            max_attempts: self.max_attempts,
            first_attempt_at: self.first_attempt_at,
            processing_started_at: self.processing_started_at,
        }
    }
}

impl<M> fmt::Debug for ProcessingContext<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingContext")
            .field("correlation_id", &self.correlation_id)
            .field("attempt", &self.attempt())
            .field("max_attempts", &self.max_attempts)
            .field("transactional", &self.is_transactional())
            .field("attributes", &self.attributes.len())
            .finish()
    }
}

impl<M> ProcessingContext<M> {
    /// Context for a freshly received message with a generated correlation id
    pub fn new(message: M, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            message: Arc::new(message),
            session: None,
            correlation_id: Uuid::new_v4().to_string(),
            attributes: Arc::new(HashMap::new()),
            retry: None,
            max_attempts: max_attempts.max(1),
            first_attempt_at: now,
            processing_started_at: now,
        }
    }

    /// Use the correlation id the message arrived with
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Attach the session the message was received on
    pub fn with_session(mut self, session: Arc<dyn DeliverySession>) -> Self {
        self.session = Some(session);
        self
    }

    /// The inbound message
    pub fn message(&self) -> &M {
        &self.message
    }

    /// Correlation id shared by every attempt
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Look up an attribute
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// All attributes
    pub fn attributes(&self) -> &HashMap<String, Value> {
        &self.attributes
    }

    /// Set an attribute; carried over to derived contexts
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        Arc::make_mut(&mut self.attributes).insert(name.into(), value.into());
    }

    /// Retry snapshot; `None` until the first failure
    pub fn retry_context(&self) -> Option<&RetryContext> {
        self.retry.as_ref()
    }

    /// Attempt number, starting at 1
    pub fn attempt(&self) -> u32 {
        self.retry.as_ref().map_or(1, RetryContext::attempt)
    }

    /// Attempts allowed in total
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether this attempt is the final one allowed
    pub fn is_last_attempt(&self) -> bool {
        self.attempt() >= self.max_attempts
    }

    /// When the first attempt started
    pub fn first_attempt_at(&self) -> DateTime<Utc> {
        self.first_attempt_at
    }

    /// When this attempt started
    pub fn processing_started_at(&self) -> DateTime<Utc> {
        self.processing_started_at
    }

    /// Whether the message belongs to a transactional session
    pub fn is_transactional(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_transactional())
    }

    /// Retire this context and derive the one for the next attempt.
    ///
    /// Hands the context back unchanged when this is already the last
    /// attempt.
    pub fn derive_retry(
        self,
        stage: impl Into<String>,
        cause: FailureCause,
        backoff: &Backoff,
    ) -> Result<Self, Self> {
        if self.is_last_attempt() {
            return Err(self);
        }
        let current = self.retry.clone().unwrap_or_else(|| {
            RetryContext::initial(
                self.correlation_id.clone(),
                self.max_attempts,
                self.first_attempt_at,
            )
        });
        let next = current.next(stage, cause, backoff);
        debug!(
            correlation_id = %self.correlation_id,
            attempt = next.attempt(),
            stage = next.failed_stage(),
            backoff = ?next.next_backoff(),
            "derived retry context"
        );
        Ok(Self {
            retry: Some(next),
            processing_started_at: Utc::now(),
            ..self
        })
    }

    /// Commit the delivery session, if transactional
    pub async fn commit(&self) -> ConnectorResult<()> {
        let Some(session) = self.transactional_session() else {
            return Ok(());
        };
        session.commit().await.map_err(|e| {
            ConnectorError::new(
                ErrorKind::SessionCommit,
                format!("commit failed for message {}", self.correlation_id),
            )
            .with_operation("commit")
            .with_cause(e)
        })
    }

    /// Roll back the delivery session, if transactional
    pub async fn rollback(&self) -> ConnectorResult<()> {
        let Some(session) = self.transactional_session() else {
            return Ok(());
        };
        session.rollback().await.map_err(|e| {
            ConnectorError::new(
                ErrorKind::SessionRollback,
                format!("rollback failed for message {}", self.correlation_id),
            )
            .with_operation("rollback")
            .with_cause(e)
        })
    }

    fn transactional_session(&self) -> Option<&Arc<dyn DeliverySession>> {
        self.session.as_ref().filter(|s| s.is_transactional())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Session that records what happened to it
    #[derive(Default)]
    pub(crate) struct RecordingSession {
        pub transactional: bool,
        pub fail_commit: bool,
        pub fail_rollback: bool,
        pub events: Mutex<Vec<&'static str>>,
    }

    impl RecordingSession {
        pub(crate) fn transactional() -> Self {
            Self {
                transactional: true,
                ..Default::default()
            }
        }

        pub(crate) fn events(&self) -> Vec<&'static str> {
            self.events.lock().clone()
        }
    }

    #[async_trait]
    impl DeliverySession for RecordingSession {
        fn is_transactional(&self) -> bool {
            self.transactional
        }

        async fn commit(&self) -> anyhow::Result<()> {
            self.events.lock().push("commit");
            if self.fail_commit {
                anyhow::bail!("broker went away");
            }
            Ok(())
        }

        async fn rollback(&self) -> anyhow::Result<()> {
            self.events.lock().push("rollback");
            if self.fail_rollback {
                anyhow::bail!("broker went away");
            }
            Ok(())
        }
    }

    fn cause() -> FailureCause {
        Arc::new(ConnectorError::backend("route unavailable"))
    }

    #[test]
    fn test_derived_context_increments_attempt() {
        let mut ctx = ProcessingContext::new("order-1", 3).with_correlation_id("corr-9");
        ctx.set_attribute("tenant", "acme");
        let first = ctx.first_attempt_at();
        let parent_attempt = ctx.attempt();

        let derived = ctx.derive_retry("route", cause(), &Backoff::default()).unwrap();

        assert_eq!(derived.attempt(), parent_attempt + 1);
        assert_eq!(derived.correlation_id(), "corr-9");
        assert_eq!(derived.first_attempt_at(), first);
        assert_eq!(derived.attribute("tenant"), Some(&Value::from("acme")));
        let retry = derived.retry_context().unwrap();
        assert_eq!(retry.failed_stage(), Some("route"));
        assert_eq!(retry.next_backoff(), Duration::from_secs(1));
    }

    #[test]
    fn test_last_attempt_is_not_derived() {
        let ctx = ProcessingContext::new((), 2);
        let ctx = ctx.derive_retry("enrich", cause(), &Backoff::default()).unwrap();
        assert!(ctx.is_last_attempt());

        let retired = ctx.derive_retry("enrich", cause(), &Backoff::default()).unwrap_err();
        assert_eq!(retired.attempt(), 2);
    }

    #[test]
    fn test_attributes_are_copy_on_write() {
        let mut parent = ProcessingContext::new((), 3);
        parent.set_attribute("a", 1);
        let snapshot = parent.clone();

        parent.set_attribute("b", 2);

        assert!(snapshot.attribute("b").is_none());
        assert_eq!(parent.attributes().len(), 2);
    }

    #[tokio::test]
    async fn test_commit_failure_is_session_commit_error() {
        let session = Arc::new(RecordingSession {
            fail_commit: true,
            ..RecordingSession::transactional()
        });
        let ctx = ProcessingContext::new((), 1).with_session(session.clone());

        let err = ctx.commit().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SessionCommit);
        assert!(!err.is_retryable());
        assert_eq!(session.events(), vec!["commit"]);
    }

    #[tokio::test]
    async fn test_non_transactional_session_is_untouched() {
        let session = Arc::new(RecordingSession::default());
        let ctx = ProcessingContext::new((), 1).with_session(session.clone());

        ctx.commit().await.unwrap();
        ctx.rollback().await.unwrap();

        assert!(session.events().is_empty());
    }
}
