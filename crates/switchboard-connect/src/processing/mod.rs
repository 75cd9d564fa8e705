//! Message processing
//!
//! A message received on a [`DeliverySession`] is wrapped in a
//! [`ProcessingContext`] and driven through the five-stage [`Pipeline`].
//! Retries never mutate a context in place: each retry derives a new context
//! carrying a fresh [`RetryContext`], with the same correlation id and
//! first-attempt time.

pub mod context;
pub mod pipeline;
pub mod retry_context;
pub mod shared;

pub use context::{DeliverySession, ProcessingContext};
pub use pipeline::{
    DeadLetter, DeadLetterReason, DeadLetterSink, Pipeline, PipelineBuilder, PipelineError,
    PipelinePolicy, PipelineStats, PipelineStatsSnapshot, RetryEntry, Stage, StageError,
    StageHandler,
};
pub use retry_context::{FailureCause, RetryContext};
pub use shared::{SharedProcessingContext, StageOutcome, StageRecord};
