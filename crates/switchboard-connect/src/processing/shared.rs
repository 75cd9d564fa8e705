//! Thread-safe processing context with a per-stage audit trail

use super::context::ProcessingContext;
use super::retry_context::FailureCause;
use crate::error::ConnectorResult;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use switchboard_resilience::Backoff;

/// How a stage run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "result", content = "reason")]
pub enum StageOutcome {
    Success,
    Failure(String),
}

/// One stage run of one attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageRecord {
    pub stage: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: Option<StageOutcome>,
    pub duration: Option<Duration>,
}

impl StageRecord {
    /// Whether the run has not finished yet
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// A [`ProcessingContext`] that stage handlers on different tasks can share.
///
/// Attributes can be set through a shared reference, and every stage run is
/// recorded in an audit trail that survives retries: contexts derived from
/// this one append to the same trail. The trail is for observation only;
/// the pipeline never reads it to decide what to do.
pub struct SharedProcessingContext<M> {
    inner: RwLock<ProcessingContext<M>>,
    audit: Arc<Mutex<Vec<StageRecord>>>,
}

impl<M> fmt::Debug for SharedProcessingContext<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedProcessingContext")
            .field("context", &*self.inner.read())
            .field("stage_runs", &self.audit.lock().len())
            .finish()
    }
}

impl<M> From<ProcessingContext<M>> for SharedProcessingContext<M> {
    fn from(context: ProcessingContext<M>) -> Self {
        Self::new(context)
    }
}

impl<M> SharedProcessingContext<M> {
    /// Wrap a context with an empty audit trail
    pub fn new(context: ProcessingContext<M>) -> Self {
        Self {
            inner: RwLock::new(context),
            audit: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Snapshot of the wrapped context
    pub fn context(&self) -> ProcessingContext<M> {
        self.inner.read().clone()
    }

    /// Unwrap the context, dropping this handle on the audit trail
    pub fn into_context(self) -> ProcessingContext<M> {
        self.inner.into_inner()
    }

    /// Correlation id shared by every attempt
    pub fn correlation_id(&self) -> String {
        self.inner.read().correlation_id().to_string()
    }

    /// Attempt number, starting at 1
    pub fn attempt(&self) -> u32 {
        self.inner.read().attempt()
    }

    /// Whether this attempt is the final one allowed
    pub fn is_last_attempt(&self) -> bool {
        self.inner.read().is_last_attempt()
    }

    /// Look up an attribute
    pub fn attribute(&self, name: &str) -> Option<Value> {
        self.inner.read().attribute(name).cloned()
    }

    /// Set an attribute; carried over to derived contexts
    pub fn set_attribute(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.inner.write().set_attribute(name, value);
    }

    /// Run `f` against the inbound message
    pub fn with_message<R>(&self, f: impl FnOnce(&M) -> R) -> R {
        f(self.inner.read().message())
    }

    /// Record that `stage` started on the current attempt
    pub fn stage_started(&self, stage: &str) {
        let attempt = self.attempt();
        self.audit.lock().push(StageRecord {
            stage: stage.to_string(),
            attempt,
            started_at: Utc::now(),
            ended_at: None,
            outcome: None,
            duration: None,
        });
    }

    /// Close the open run of `stage` as a success
    pub fn stage_succeeded(&self, stage: &str) {
        self.finish(stage, StageOutcome::Success);
    }

    /// Close the open run of `stage` as a failure
    pub fn stage_failed(&self, stage: &str, reason: impl Into<String>) {
        self.finish(stage, StageOutcome::Failure(reason.into()));
    }

    fn finish(&self, stage: &str, outcome: StageOutcome) {
        let now = Utc::now();
        let mut audit = self.audit.lock();
        if let Some(record) = audit
            .iter_mut()
            .rev()
            .find(|r| r.stage == stage && r.is_open())
        {
            record.ended_at = Some(now);
            record.duration = Some((now - record.started_at).to_std().unwrap_or_default());
            record.outcome = Some(outcome);
        }
    }

    /// Every stage run so far, across all attempts
    pub fn audit_trail(&self) -> Vec<StageRecord> {
        self.audit.lock().clone()
    }

    /// Runs of one stage
    pub fn stage_history(&self, stage: &str) -> Vec<StageRecord> {
        self.audit
            .lock()
            .iter()
            .filter(|r| r.stage == stage)
            .cloned()
            .collect()
    }

    /// Time spent in `stage` across all finished runs
    pub fn cumulative_duration(&self, stage: &str) -> Duration {
        self.audit
            .lock()
            .iter()
            .filter(|r| r.stage == stage)
            .filter_map(|r| r.duration)
            .sum()
    }

    /// Retire this context and derive the next attempt's, sharing the trail.
    ///
    /// Hands the context back when this is already the last attempt.
    pub fn derive_retry(
        self,
        stage: impl Into<String>,
        cause: FailureCause,
        backoff: &Backoff,
    ) -> Result<Self, Self> {
        let audit = self.audit;
        match self.inner.into_inner().derive_retry(stage, cause, backoff) {
            Ok(next) => Ok(Self {
                inner: RwLock::new(next),
                audit,
            }),
            Err(current) => Err(Self {
                inner: RwLock::new(current),
                audit,
            }),
        }
    }

    /// Commit the delivery session, if transactional
    pub async fn commit(&self) -> ConnectorResult<()> {
        let context = self.context();
        context.commit().await
    }

    /// Roll back the delivery session, if transactional
    pub async fn rollback(&self) -> ConnectorResult<()> {
        let context = self.context();
        context.rollback().await
    }
}
