//! VETRO pipeline: Validate -> Enrich -> Transform -> Route -> Operate
//!
//! A message runs through the five stages in order. When a stage fails:
//!
//! 1. a non-retryable failure, or a failure in a stage the policy marks
//!    non-retryable (Validate by default), ends the message at once;
//! 2. otherwise a context for the next attempt is derived, the pipeline
//!    waits the derived backoff and re-enters at the failing stage or at
//!    Validate, per [`RetryEntry`];
//! 3. a failure on the last allowed attempt ends the message.
//!
//! A message that completes commits its delivery session. A message that
//! ends rolls its session back, is handed to the [`DeadLetterSink`] and is
//! returned as [`PipelineError::DeadLettered`]. Session failures surface as
//! [`PipelineError::Session`] and are never swallowed.

use super::context::ProcessingContext;
use super::retry_context::FailureCause;
use super::shared::{SharedProcessingContext, StageRecord};
use crate::error::ConnectorError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchboard_resilience::Backoff;
use thiserror::Error;
use tracing::{debug, error, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Pipeline stage, in execution order
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    Enrich,
    Transform,
    Route,
    Operate,
}

impl Stage {
    /// Every stage in execution order
    pub const ALL: [Stage; 5] = [
        Stage::Validate,
        Stage::Enrich,
        Stage::Transform,
        Stage::Route,
        Stage::Operate,
    ];

    /// Lowercase name used in logs and audit records
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Enrich => "enrich",
            Self::Transform => "transform",
            Self::Route => "route",
            Self::Operate => "operate",
        }
    }

    /// Position in [`Stage::ALL`]
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a retried message re-enters the pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RetryEntry {
    /// Re-run the stage that failed, with the input it failed on
    #[default]
    FailingStage,
    /// Start over at Validate with the original payload
    Start,
}

/// Retry behavior of a pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct PipelinePolicy {
    /// Attempts per message, including the first
    pub max_attempts: u32,
    /// Re-entry point on retry
    pub retry_entry: RetryEntry,
    /// Stages whose failures are never retried
    pub non_retryable_stages: HashSet<Stage>,
    /// Wait before each retry
    pub backoff: Backoff,
}

impl Default for PipelinePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_entry: RetryEntry::FailingStage,
            non_retryable_stages: HashSet::from([Stage::Validate]),
            backoff: Backoff::exponential(Duration::from_secs(1), 2.0)
                .with_max(Duration::from_secs(30)),
        }
    }
}

impl PipelinePolicy {
    /// Set the attempt budget
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the re-entry point
    pub fn with_retry_entry(mut self, entry: RetryEntry) -> Self {
        self.retry_entry = entry;
        self
    }

    /// Replace the non-retryable stages
    pub fn with_non_retryable_stages(mut self, stages: impl IntoIterator<Item = Stage>) -> Self {
        self.non_retryable_stages = stages.into_iter().collect();
        self
    }

    /// Set the backoff schedule
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Failure raised by a stage handler
#[derive(Debug, Error)]
#[error("{message}")]
pub struct StageError {
    message: String,
    retryable: bool,
    #[source]
    source: Option<BoxError>,
}

impl StageError {
    /// A failure another attempt may get past
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            source: None,
        }
    }

    /// A failure no retry will fix
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            source: None,
        }
    }

    /// Attach the underlying failure
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Failure message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<ConnectorError> for StageError {
    fn from(err: ConnectorError) -> Self {
        Self {
            message: err.to_string(),
            retryable: err.is_retryable(),
            source: Some(Box::new(err)),
        }
    }
}

/// Logic of one stage
#[async_trait]
pub trait StageHandler<M, P>: Send + Sync {
    /// Process `payload` and forward the result to the next stage
    async fn handle(&self, context: &SharedProcessingContext<M>, payload: P)
        -> Result<P, StageError>;
}

/// Why a message was dead-lettered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The failure or the stage is not retryable
    NonRetryable,
    /// The last allowed attempt failed
    Exhausted,
}

/// Record handed to the dead-letter sink
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub correlation_id: String,
    pub stage: Stage,
    pub attempts: u32,
    pub reason: DeadLetterReason,
    pub error: String,
    pub first_attempt_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Destination for messages that end in failure
#[async_trait]
pub trait DeadLetterSink<M>: Send + Sync {
    /// Store `message`; errors are logged, not propagated
    async fn dead_letter(&self, message: &M, letter: &DeadLetter) -> anyhow::Result<()>;
}

/// Terminal pipeline failure
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The message ended in a stage failure and was dead-lettered
    #[error(
        "message {} dead-lettered at {} after {} attempt(s): {}",
        .letter.correlation_id, .letter.stage, .letter.attempts, .letter.error
    )]
    DeadLettered {
        letter: DeadLetter,
        #[source]
        source: Arc<StageError>,
    },

    /// Committing or rolling back the delivery session failed
    #[error("delivery session failed: {error}")]
    Session {
        #[source]
        error: ConnectorError,
        /// Set when the rollback belonged to a dead-lettered message
        dead_letter: Option<DeadLetter>,
    },
}

impl PipelineError {
    /// The dead-letter record, if the message was dead-lettered
    pub fn dead_letter(&self) -> Option<&DeadLetter> {
        match self {
            Self::DeadLettered { letter, .. } => Some(letter),
            Self::Session { dead_letter, .. } => dead_letter.as_ref(),
        }
    }
}

/// Pipeline counters
#[derive(Debug, Default)]
pub struct PipelineStats {
    processed: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    session_failures: AtomicU64,
}

impl PipelineStats {
    fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    fn record_session_failure(&self) {
        self.session_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            session_failures: self.session_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of pipeline statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineStatsSnapshot {
    pub processed: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub session_failures: u64,
}

impl PipelineStatsSnapshot {
    /// Completed share of processed messages (0.0 - 1.0)
    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            return 1.0;
        }
        self.completed as f64 / self.processed as f64
    }
}

type Handler<M, P> = Arc<dyn StageHandler<M, P>>;

/// Builder for [`Pipeline`]
pub struct PipelineBuilder<M, P> {
    handlers: [Option<Handler<M, P>>; 5],
    policy: PipelinePolicy,
    dead_letters: Option<Arc<dyn DeadLetterSink<M>>>,
}

impl<M, P> Default for PipelineBuilder<M, P> {
    fn default() -> Self {
        Self {
            handlers: [None, None, None, None, None],
            policy: PipelinePolicy::default(),
            dead_letters: None,
        }
    }
}

impl<M, P> PipelineBuilder<M, P> {
    /// Set the handler of `stage`; stages without one pass the payload through
    pub fn stage(mut self, stage: Stage, handler: impl StageHandler<M, P> + 'static) -> Self {
        self.handlers[stage.index()] = Some(Arc::new(handler));
        self
    }

    /// Set the Validate handler
    pub fn validate(self, handler: impl StageHandler<M, P> + 'static) -> Self {
        self.stage(Stage::Validate, handler)
    }

    /// Set the Enrich handler
    pub fn enrich(self, handler: impl StageHandler<M, P> + 'static) -> Self {
        self.stage(Stage::Enrich, handler)
    }

    /// Set the Transform handler
    pub fn transform(self, handler: impl StageHandler<M, P> + 'static) -> Self {
        self.stage(Stage::Transform, handler)
    }

    /// Set the Route handler
    pub fn route(self, handler: impl StageHandler<M, P> + 'static) -> Self {
        self.stage(Stage::Route, handler)
    }

    /// Set the Operate handler
    pub fn operate(self, handler: impl StageHandler<M, P> + 'static) -> Self {
        self.stage(Stage::Operate, handler)
    }

    /// Set the retry policy
    pub fn policy(mut self, policy: PipelinePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set where terminally failed messages go
    pub fn dead_letter_sink(mut self, sink: impl DeadLetterSink<M> + 'static) -> Self {
        self.dead_letters = Some(Arc::new(sink));
        self
    }

    /// Build the pipeline
    pub fn build(self) -> Pipeline<M, P> {
        Pipeline {
            handlers: self.handlers,
            policy: self.policy,
            dead_letters: self.dead_letters,
            stats: PipelineStats::default(),
        }
    }
}

/// A five-stage message pipeline with retry and dead-lettering
pub struct Pipeline<M, P> {
    handlers: [Option<Handler<M, P>>; 5],
    policy: PipelinePolicy,
    dead_letters: Option<Arc<dyn DeadLetterSink<M>>>,
    stats: PipelineStats,
}

impl<M, P> fmt::Debug for Pipeline<M, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stages: Vec<&str> = Stage::ALL
            .iter()
            .filter(|s| self.handlers[s.index()].is_some())
            .map(Stage::as_str)
            .collect();
        f.debug_struct("Pipeline")
            .field("stages", &stages)
            .field("policy", &self.policy)
            .field("dead_letter_sink", &self.dead_letters.is_some())
            .finish()
    }
}

impl<M, P> Pipeline<M, P>
where
    M: Send + Sync + 'static,
    P: Clone + Send + 'static,
{
    /// Start building a pipeline
    pub fn builder() -> PipelineBuilder<M, P> {
        PipelineBuilder::default()
    }

    /// Retry policy in effect
    pub fn policy(&self) -> &PipelinePolicy {
        &self.policy
    }

    /// Counter snapshot
    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Context for a freshly received message, sized to this pipeline's policy
    pub fn context(&self, message: M) -> ProcessingContext<M> {
        ProcessingContext::new(message, self.policy.max_attempts)
    }

    /// Run a message to completion or dead-letter
    pub async fn run(&self, context: ProcessingContext<M>, payload: P) -> Result<P, PipelineError> {
        self.run_audited(context, payload).await.0
    }

    /// Like [`Pipeline::run`], also returning the stage audit trail
    pub async fn run_audited(
        &self,
        context: ProcessingContext<M>,
        payload: P,
    ) -> (Result<P, PipelineError>, Vec<StageRecord>) {
        self.stats.record_processed();
        let mut ctx = SharedProcessingContext::new(context);
        // inputs[i] is what stage i received on its latest run
        let mut inputs: Vec<P> = Vec::with_capacity(Stage::ALL.len());
        let mut start = 0;
        let mut input = payload;

        loop {
            inputs.truncate(start);
            let (stage, err) = match self.run_stages(start, &ctx, input, &mut inputs).await {
                Ok(output) => {
                    let result = self.complete(&ctx).await.map(|()| output);
                    return (result, ctx.audit_trail());
                }
                Err(failure) => failure,
            };

            let retryable =
                err.is_retryable() && !self.policy.non_retryable_stages.contains(&stage);
            let err = Arc::new(err);
            if !retryable {
                let trail = ctx.audit_trail();
                let result = self
                    .terminate(ctx, stage, err, DeadLetterReason::NonRetryable)
                    .await;
                return (Err(result), trail);
            }

            let cause: FailureCause = err.clone();
            match ctx.derive_retry(stage.as_str(), cause, &self.policy.backoff) {
                Ok(next) => {
                    ctx = next;
                    self.stats.record_retried();
                    let backoff = ctx
                        .context()
                        .retry_context()
                        .map(|r| r.next_backoff())
                        .unwrap_or_default();
                    warn!(
                        correlation_id = %ctx.correlation_id(),
                        stage = %stage,
                        attempt = ctx.attempt(),
                        backoff = ?backoff,
                        error = %err,
                        "stage failed, retrying"
                    );
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                    }
                    start = match self.policy.retry_entry {
                        RetryEntry::FailingStage => stage.index(),
                        RetryEntry::Start => 0,
                    };
                    input = inputs[start].clone();
                }
                Err(last) => {
                    let trail = last.audit_trail();
                    let result = self
                        .terminate(last, stage, err, DeadLetterReason::Exhausted)
                        .await;
                    return (Err(result), trail);
                }
            }
        }
    }

    async fn run_stages(
        &self,
        start: usize,
        ctx: &SharedProcessingContext<M>,
        mut payload: P,
        inputs: &mut Vec<P>,
    ) -> Result<P, (Stage, StageError)> {
        for stage in &Stage::ALL[start..] {
            inputs.push(payload.clone());
            ctx.stage_started(stage.as_str());
            match self.run_stage(*stage, ctx, payload).await {
                Ok(next) => {
                    ctx.stage_succeeded(stage.as_str());
                    payload = next;
                }
                Err(err) => {
                    ctx.stage_failed(stage.as_str(), err.to_string());
                    return Err((*stage, err));
                }
            }
        }
        Ok(payload)
    }

    async fn run_stage(
        &self,
        stage: Stage,
        ctx: &SharedProcessingContext<M>,
        payload: P,
    ) -> Result<P, StageError> {
        match &self.handlers[stage.index()] {
            Some(handler) => handler.handle(ctx, payload).await,
            None => Ok(payload),
        }
    }

    async fn complete(&self, ctx: &SharedProcessingContext<M>) -> Result<(), PipelineError> {
        match ctx.commit().await {
            Ok(()) => {
                self.stats.record_completed();
                debug!(
                    correlation_id = %ctx.correlation_id(),
                    attempt = ctx.attempt(),
                    "message processed"
                );
                Ok(())
            }
            Err(error) => {
                self.stats.record_session_failure();
                error!(
                    correlation_id = %ctx.correlation_id(),
                    error = %error,
                    "commit failed after successful processing"
                );
                Err(PipelineError::Session {
                    error,
                    dead_letter: None,
                })
            }
        }
    }

    async fn terminate(
        &self,
        ctx: SharedProcessingContext<M>,
        stage: Stage,
        err: Arc<StageError>,
        reason: DeadLetterReason,
    ) -> PipelineError {
        let context = ctx.into_context();
        let letter = DeadLetter {
            correlation_id: context.correlation_id().to_string(),
            stage,
            attempts: context.attempt(),
            reason,
            error: err.to_string(),
            first_attempt_at: context.first_attempt_at(),
            dead_lettered_at: Utc::now(),
        };

        let rollback = context.rollback().await;

        if let Some(sink) = &self.dead_letters {
            if let Err(sink_err) = sink.dead_letter(context.message(), &letter).await {
                error!(
                    correlation_id = %letter.correlation_id,
                    error = %sink_err,
                    "dead-letter sink failed"
                );
            }
        }
        self.stats.record_dead_lettered();
        error!(
            correlation_id = %letter.correlation_id,
            stage = %stage,
            attempts = letter.attempts,
            reason = ?reason,
            error = %err,
            "message dead-lettered"
        );

        match rollback {
            Ok(()) => PipelineError::DeadLettered {
                letter,
                source: err,
            },
            Err(error) => {
                self.stats.record_session_failure();
                PipelineError::Session {
                    error,
                    dead_letter: Some(letter),
                }
            }
        }
    }
}
