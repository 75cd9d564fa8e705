//! End-to-end pipeline tests: inbound message -> VETRO stages -> connector
//!
//! Run with: cargo test -p switchboard-connect --test pipeline_e2e

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use switchboard_connect::config::SwitchboardConfig;
use switchboard_connect::prelude::*;
use switchboard_connect::processing::DeadLetterReason;
use switchboard_connect::testing::{MockBackend, MockLogBackend};
use switchboard_resilience::Backoff;

/// Inbound message as received from a source
#[derive(Debug, Clone)]
struct Order {
    id: u32,
    body: &'static str,
}

/// Session recording acknowledgements
#[derive(Default)]
struct AckLog {
    events: Mutex<Vec<&'static str>>,
}

#[async_trait]
impl DeliverySession for AckLog {
    fn is_transactional(&self) -> bool {
        true
    }

    async fn commit(&self) -> anyhow::Result<()> {
        self.events.lock().push("commit");
        Ok(())
    }

    async fn rollback(&self) -> anyhow::Result<()> {
        self.events.lock().push("rollback");
        Ok(())
    }
}

struct RejectEmpty;

#[async_trait]
impl StageHandler<Order, Option<LogRequest>> for RejectEmpty {
    async fn handle(
        &self,
        context: &SharedProcessingContext<Order>,
        payload: Option<LogRequest>,
    ) -> Result<Option<LogRequest>, StageError> {
        if context.with_message(|m| m.body.is_empty()) {
            return Err(StageError::retryable("order body is empty"));
        }
        Ok(payload)
    }
}

struct BuildRecord;

#[async_trait]
impl StageHandler<Order, Option<LogRequest>> for BuildRecord {
    async fn handle(
        &self,
        context: &SharedProcessingContext<Order>,
        _payload: Option<LogRequest>,
    ) -> Result<Option<LogRequest>, StageError> {
        let (id, body) = context.with_message(|m| (m.id, m.body));
        context.set_attribute("order_id", id);
        let record = LogRequest::builder()
            .topic("orders")
            .key(id.to_string())
            .payload(body)
            .correlation_id(context.correlation_id())
            .build()?;
        Ok(Some(record))
    }
}

struct Publish {
    registry: Arc<ConnectorRegistry>,
}

#[async_trait]
impl StageHandler<Order, Option<LogRequest>> for Publish {
    async fn handle(
        &self,
        _context: &SharedProcessingContext<Order>,
        payload: Option<LogRequest>,
    ) -> Result<Option<LogRequest>, StageError> {
        let record = payload.ok_or_else(|| StageError::fatal("nothing to publish"))?;
        let context = ConnectorContext::builder("log://cluster-a")
            .build()
            .map_err(StageError::from)?;
        self.registry
            .send_sync(ConnectorType::Log, record.clone(), &context)
            .await?;
        Ok(Some(record))
    }
}

#[derive(Default)]
struct Parking {
    letters: Mutex<Vec<(u32, DeadLetter)>>,
}

#[async_trait]
impl DeadLetterSink<Order> for Arc<Parking> {
    async fn dead_letter(&self, message: &Order, letter: &DeadLetter) -> anyhow::Result<()> {
        self.letters.lock().push((message.id, letter.clone()));
        Ok(())
    }
}

async fn log_registry(backend: MockLogBackend) -> Arc<ConnectorRegistry> {
    let registry = Arc::new(ConnectorRegistry::new());
    // no connector-level retry; retries happen at pipeline level
    let connector =
        ResilientConnector::with_policies(backend, PolicyStackConfig::passthrough());
    registry.register(ConnectorType::Log, connector).await.unwrap();
    registry
}

fn pipeline(
    registry: Arc<ConnectorRegistry>,
    policy: PipelinePolicy,
    parking: Arc<Parking>,
) -> Pipeline<Order, Option<LogRequest>> {
    Pipeline::builder()
        .validate(RejectEmpty)
        .transform(BuildRecord)
        .operate(Publish { registry })
        .policy(policy)
        .dead_letter_sink(parking)
        .build()
}

fn fast_policy(max_attempts: u32) -> PipelinePolicy {
    PipelinePolicy::default()
        .with_max_attempts(max_attempts)
        .with_backoff(Backoff::fixed(Duration::from_millis(100)))
}

#[tokio::test(start_paused = true)]
async fn transient_publish_failure_is_retried_then_committed() {
    let backend = MockBackend::log().then_fail(ErrorKind::BackendCommunication, "leader moved");
    let registry = log_registry(backend.clone()).await;
    let parking = Arc::new(Parking::default());
    let pipeline = pipeline(registry.clone(), fast_policy(3), parking.clone());
    let session = Arc::new(AckLog::default());

    let ctx = pipeline
        .context(Order { id: 42, body: "{\"qty\":1}" })
        .with_correlation_id("order-42")
        .with_session(session.clone());
    let (result, trail) = pipeline.run_audited(ctx, None).await;

    let record = result.unwrap().unwrap();
    assert_eq!(record.correlation_id(), Some("order-42"));
    assert_eq!(backend.sync_calls(), 2);
    assert!(backend
        .requests()
        .iter()
        .all(|r| r.correlation_id() == Some("order-42")));
    assert_eq!(*session.events.lock(), vec!["commit"]);
    assert!(parking.letters.lock().is_empty());

    let operate: Vec<_> = trail.iter().filter(|r| r.stage == "operate").collect();
    assert_eq!(operate.len(), 2);
    assert_eq!(operate[1].attempt, 2);
    assert_eq!(trail.iter().filter(|r| r.stage == "validate").count(), 1);

    let stats = pipeline.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.retried, 1);
}

#[tokio::test(start_paused = true)]
async fn validate_failure_dead_letters_regardless_of_max_attempts() {
    let backend = MockBackend::log();
    let registry = log_registry(backend.clone()).await;
    let parking = Arc::new(Parking::default());
    let pipeline = pipeline(registry, fast_policy(10), parking.clone());
    let session = Arc::new(AckLog::default());

    let ctx = pipeline
        .context(Order { id: 7, body: "" })
        .with_session(session.clone());
    let correlation_id = ctx.correlation_id().to_string();
    let err = pipeline.run(ctx, None).await.unwrap_err();

    let letter = err.dead_letter().unwrap();
    assert_eq!(letter.stage, Stage::Validate);
    assert_eq!(letter.attempts, 1);
    assert_eq!(letter.reason, DeadLetterReason::NonRetryable);
    assert_eq!(letter.correlation_id, correlation_id);
    assert_eq!(*session.events.lock(), vec!["rollback"]);
    assert_eq!(parking.letters.lock()[0].0, 7);
    assert_eq!(backend.total_calls(), 0);
    assert_eq!(pipeline.stats().retried, 0);
}

#[tokio::test(start_paused = true)]
async fn connector_outage_exhausts_attempts() {
    let backend = MockBackend::log().fail_with(ErrorKind::BackendCommunication, "cluster down");
    let registry = log_registry(backend.clone()).await;
    let parking = Arc::new(Parking::default());
    let pipeline = pipeline(registry, fast_policy(3), parking.clone());

    let started = tokio::time::Instant::now();
    let err = pipeline
        .run(pipeline.context(Order { id: 1, body: "x" }), None)
        .await
        .unwrap_err();

    assert_eq!(backend.sync_calls(), 3);
    assert!(started.elapsed() >= Duration::from_millis(200));
    match &err {
        PipelineError::DeadLettered { letter, source } => {
            assert_eq!(letter.stage, Stage::Operate);
            assert_eq!(letter.attempts, 3);
            assert_eq!(letter.reason, DeadLetterReason::Exhausted);
            assert!(source.message().contains("cluster down"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(parking.letters.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn authentication_failure_is_not_retried() {
    let backend = MockBackend::log().fail_with(ErrorKind::Authentication, "token expired");
    let registry = log_registry(backend.clone()).await;
    let pipeline = pipeline(registry, fast_policy(5), Arc::new(Parking::default()));

    let err = pipeline
        .run(pipeline.context(Order { id: 3, body: "x" }), None)
        .await
        .unwrap_err();

    assert_eq!(backend.sync_calls(), 1);
    assert_eq!(err.dead_letter().unwrap().reason, DeadLetterReason::NonRetryable);
}

#[tokio::test(start_paused = true)]
async fn pipeline_policy_from_configuration() {
    let config = SwitchboardConfig::from_yaml(
        r#"
pipeline:
  max_attempts: 2
  retry_entry: start
  backoff_initial_ms: 10
"#,
    )
    .unwrap();
    let backend = MockBackend::log().fail_with(ErrorKind::BackendCommunication, "down");
    let registry = log_registry(backend.clone()).await;
    let pipeline = pipeline(registry, config.pipeline.to_policy(), Arc::new(Parking::default()));

    let (result, trail) = pipeline
        .run_audited(pipeline.context(Order { id: 9, body: "x" }), None)
        .await;

    assert!(result.is_err());
    assert_eq!(backend.sync_calls(), 2);
    // restarting from validate re-runs every stage on the second attempt
    assert_eq!(trail.iter().filter(|r| r.stage == "validate").count(), 2);
}
