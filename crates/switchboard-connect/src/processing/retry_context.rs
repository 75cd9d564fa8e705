//! Attempt history of one logical message

use chrono::{DateTime, Utc};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use switchboard_resilience::Backoff;

/// Shared failure cause carried between attempts
pub type FailureCause = Arc<dyn Error + Send + Sync>;

/// Immutable snapshot of where a message stands in its retry sequence.
///
/// A new snapshot is derived per retry with [`RetryContext::next`]; the
/// attempt number only grows and the correlation id and first-attempt time
/// never change.
#[derive(Clone)]
pub struct RetryContext {
    attempt: u32,
    max_attempts: u32,
    correlation_id: String,
    first_attempt_at: DateTime<Utc>,
    current_attempt_at: DateTime<Utc>,
    elapsed: Duration,
    last_failure: Option<FailureCause>,
    failed_stage: Option<String>,
    next_backoff: Duration,
}

impl RetryContext {
    /// Snapshot of a first attempt
    pub fn initial(
        correlation_id: impl Into<String>,
        max_attempts: u32,
        first_attempt_at: DateTime<Utc>,
    ) -> Self {
        Self {
            attempt: 1,
            max_attempts: max_attempts.max(1),
            correlation_id: correlation_id.into(),
            first_attempt_at,
            current_attempt_at: first_attempt_at,
            elapsed: Duration::ZERO,
            last_failure: None,
            failed_stage: None,
            next_backoff: Duration::ZERO,
        }
    }

    /// Snapshot for the attempt after this one failed in `stage`
    pub fn next(&self, stage: impl Into<String>, cause: FailureCause, backoff: &Backoff) -> Self {
        let now = Utc::now();
        Self {
            attempt: self.attempt + 1,
            max_attempts: self.max_attempts,
            correlation_id: self.correlation_id.clone(),
            first_attempt_at: self.first_attempt_at,
            current_attempt_at: now,
            elapsed: (now - self.first_attempt_at).to_std().unwrap_or_default(),
            last_failure: Some(cause),
            failed_stage: Some(stage.into()),
            next_backoff: backoff.delay_for_attempt(self.attempt),
        }
    }

    /// Attempt number, starting at 1
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Attempts allowed in total
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Attempts left after this one
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt)
    }

    /// Whether this is the final allowed attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Correlation id of the logical message
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// When the first attempt started
    pub fn first_attempt_at(&self) -> DateTime<Utc> {
        self.first_attempt_at
    }

    /// When this attempt started
    pub fn current_attempt_at(&self) -> DateTime<Utc> {
        self.current_attempt_at
    }

    /// Time from the first attempt to this one
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Failure that caused this retry
    pub fn last_failure(&self) -> Option<&FailureCause> {
        self.last_failure.as_ref()
    }

    /// Stage that failed on the previous attempt
    pub fn failed_stage(&self) -> Option<&str> {
        self.failed_stage.as_deref()
    }

    /// Suggested wait before running this attempt
    pub fn next_backoff(&self) -> Duration {
        self.next_backoff
    }
}

impl fmt::Debug for RetryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryContext")
            .field("attempt", &self.attempt)
            .field("max_attempts", &self.max_attempts)
            .field("correlation_id", &self.correlation_id)
            .field("failed_stage", &self.failed_stage)
            .field("last_failure", &self.last_failure.as_ref().map(|e| e.to_string()))
            .field("elapsed", &self.elapsed)
            .field("next_backoff", &self.next_backoff)
            .finish()
    }
}
