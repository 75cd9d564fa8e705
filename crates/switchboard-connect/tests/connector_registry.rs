//! Connector and registry behavior through the public API
//!
//! Run with: cargo test -p switchboard-connect --test connector_registry

use std::time::Duration;
use switchboard_connect::health::HealthStatus;
use switchboard_connect::metrics::render_prometheus;
use switchboard_connect::prelude::*;
use switchboard_connect::testing::{MockBackend, MockStep};
use switchboard_connect::types::{ExchangePattern, LogResponse};
use switchboard_resilience::{Backoff, BulkheadConfig};

fn ctx() -> ConnectorContext {
    ConnectorContext::builder("https://backend.internal")
        .datacenter("dc-1")
        .build()
        .unwrap()
}

fn get(path: &str) -> HttpRequest {
    HttpRequest::builder(HttpMethod::Get).path(path).build().unwrap()
}

fn queue_message(destination: &str) -> QueueRequest {
    QueueRequest::builder()
        .destination(destination)
        .payload("payload")
        .build()
        .unwrap()
}

fn log_record(topic: &str) -> LogRequest {
    LogRequest::builder().topic(topic).payload("payload").build().unwrap()
}

#[tokio::test]
async fn open_breaker_rejects_every_connector_type() {
    let http = ResilientConnector::new(MockBackend::http());
    let queue = ResilientConnector::new(MockBackend::queue());
    let log = ResilientConnector::new(MockBackend::log());
    let graph = ResilientConnector::new(MockBackend::graph());

    for breaker in [
        http.policies().circuit_breaker(),
        queue.policies().circuit_breaker(),
        log.policies().circuit_breaker(),
        graph.policies().circuit_breaker(),
    ] {
        breaker.unwrap().trip();
    }

    let errors = [
        http.send_sync(&get("/a"), &ctx()).await.unwrap_err(),
        queue.send_sync(&queue_message("q"), &ctx()).await.unwrap_err(),
        log.send_sync(&log_record("t"), &ctx()).await.unwrap_err(),
        graph
            .send_sync(
                &GraphQueryRequest::builder()
                    .resource("users")
                    .query("$top=1")
                    .build()
                    .unwrap(),
                &ctx(),
            )
            .await
            .unwrap_err(),
    ];

    for err in &errors {
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(err.datacenter(), Some("dc-1"));
    }
    assert_eq!(http.backend().total_calls(), 0);
    assert_eq!(queue.backend().total_calls(), 0);
    assert_eq!(log.backend().total_calls(), 0);
    assert_eq!(graph.backend().total_calls(), 0);
}

#[tokio::test]
async fn breaker_opens_once_failure_rate_reaches_threshold() {
    let backend = MockBackend::http().fail_with(ErrorKind::BackendCommunication, "503");
    let connector = ResilientConnector::with_policies(
        backend.clone(),
        PolicyStackConfig::passthrough().with_circuit_breaker(
            CircuitBreakerConfig::default()
                .with_sliding_window_size(4)
                .with_minimum_number_of_calls(4)
                .with_failure_rate_threshold(50.0),
        ),
    );
    let breaker = connector.policies().circuit_breaker().unwrap();

    for _ in 0..3 {
        let err = connector.send_sync(&get("/x"), &ctx()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendCommunication);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
    connector.send_sync(&get("/x"), &ctx()).await.unwrap_err();
    assert_eq!(breaker.state(), CircuitState::Open);

    let err = connector.send_sync(&get("/x"), &ctx()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    assert_eq!(backend.sync_calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn retry_waits_one_then_two_seconds() {
    let backend = MockBackend::log().fail_with(ErrorKind::BackendCommunication, "leader moved");
    let connector = ResilientConnector::with_policies(
        backend.clone(),
        PolicyStackConfig::passthrough().with_retry(RetryConfig::new(
            3,
            Backoff::exponential(Duration::from_secs(1), 2.0),
        )),
    );

    let started = tokio::time::Instant::now();
    let err = connector
        .send_sync(&log_record("orders"), &ctx())
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(backend.sync_calls(), 3);
    assert_eq!(err.kind(), ErrorKind::RetryExhausted);
    assert_eq!(err.root_kind(), ErrorKind::BackendCommunication);
    assert!(elapsed >= Duration::from_secs(3), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(3100), "{:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn bulkhead_of_one_rejects_after_wait_expires() {
    let backend = MockBackend::http().with_latency(Duration::from_secs(1));
    let connector = ResilientConnector::with_policies(
        backend.clone(),
        PolicyStackConfig::passthrough().with_bulkhead(
            BulkheadConfig::default()
                .with_max_concurrent_calls(1)
                .with_max_wait_duration(Duration::from_millis(100)),
        ),
    );

    let first = connector.send_async(get("/a"), ctx());
    tokio::task::yield_now().await;
    let second = connector.send_async(get("/b"), ctx());

    assert!(first.await.is_ok());
    let err = second.await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BulkheadRejected);
    assert_eq!(backend.async_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn bulkhead_of_one_admits_waiter_within_wait() {
    let backend = MockBackend::http().with_latency(Duration::from_millis(50));
    let connector = ResilientConnector::with_policies(
        backend.clone(),
        PolicyStackConfig::passthrough().with_bulkhead(
            BulkheadConfig::default()
                .with_max_concurrent_calls(1)
                .with_max_wait_duration(Duration::from_secs(1)),
        ),
    );

    let first = connector.send_async(get("/a"), ctx());
    let second = connector.send_async(get("/b"), ctx());

    assert!(first.await.is_ok());
    assert!(second.await.is_ok());
    assert_eq!(backend.async_calls(), 2);
}

#[tokio::test]
async fn fire_and_forget_completes_and_counts_as_success() {
    let backend = MockBackend::queue();
    let connector = ResilientConnector::new(backend.clone());

    connector
        .send_async_no_response(queue_message("audit"), ctx())
        .await
        .unwrap();

    let breaker = connector.policies().circuit_breaker().unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
    let stats = breaker.stats();
    assert_eq!(stats.buffered_calls, 1);
    assert_eq!(stats.failed_buffered_calls, 0);
    assert_eq!(connector.metrics().calls_succeeded, 1);
}

#[tokio::test]
async fn registry_routes_by_connector_type() {
    let registry = ConnectorRegistry::new();
    let http = MockBackend::http();
    let queue = MockBackend::queue();
    registry
        .register(ConnectorType::Http, ResilientConnector::new(http.clone()))
        .await
        .unwrap();
    registry
        .register(ConnectorType::Queue, ResilientConnector::new(queue.clone()))
        .await
        .unwrap();

    let response = registry
        .send_sync(ConnectorType::Http, get("/orders"), &ctx())
        .await
        .unwrap();
    assert_eq!(response.connector_type(), ConnectorType::Http);

    let request = QueueRequest::builder()
        .destination("orders")
        .payload("x")
        .correlation_id("corr-7")
        .build()
        .unwrap();
    let response = registry
        .send_async(ConnectorType::Queue, request, ctx())
        .await
        .unwrap();
    match response {
        BackendResponse::Queue(reply) => assert_eq!(reply.correlation_id(), Some("corr-7")),
        other => panic!("unexpected response: {:?}", other),
    }

    assert_eq!(http.requests()[0].path(), "/orders");
    assert_eq!(queue.async_calls(), 1);
    assert_eq!(
        registry.connector_types(),
        vec![ConnectorType::Http, ConnectorType::Queue]
    );
}

#[tokio::test]
async fn registry_rejects_mismatched_and_missing_types() {
    let registry = ConnectorRegistry::new();
    let queue = MockBackend::queue();
    registry
        .register(ConnectorType::Queue, ResilientConnector::new(queue.clone()))
        .await
        .unwrap();

    let err = registry
        .send_sync(ConnectorType::Queue, get("/x"), &ctx())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(err.connector(), Some(ConnectorType::Queue));
    assert_eq!(queue.total_calls(), 0);

    let err = registry
        .send_async_no_response(ConnectorType::Log, log_record("t"), ctx())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);

    let err = registry
        .register(ConnectorType::Http, ResilientConnector::new(MockBackend::log()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(!registry.contains(ConnectorType::Http));
}

#[tokio::test]
async fn replacing_a_connector_closes_the_previous_one() {
    let registry = ConnectorRegistry::new();
    let old = MockBackend::log();
    let new = MockBackend::log();
    registry
        .register(ConnectorType::Log, ResilientConnector::new(old.clone()))
        .await
        .unwrap();
    registry
        .register(ConnectorType::Log, ResilientConnector::new(new.clone()))
        .await
        .unwrap();

    registry
        .send_sync(ConnectorType::Log, log_record("t"), &ctx())
        .await
        .unwrap();

    assert_eq!(old.close_calls(), 1);
    assert_eq!(old.total_calls(), 0);
    assert_eq!(new.sync_calls(), 1);
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn health_report_aggregates_connectors() {
    let registry = ConnectorRegistry::new();
    let http = MockBackend::http();
    let graph = MockBackend::graph();
    registry
        .register(ConnectorType::Http, ResilientConnector::new(http.clone()))
        .await
        .unwrap();
    registry
        .register(ConnectorType::GraphQuery, ResilientConnector::new(graph.clone()))
        .await
        .unwrap();

    let report = registry.health_report().await;
    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(report.http_status(), 200);

    graph.fail_health_checks(true);
    let health = registry.health_of_all().await;
    assert!(health[&ConnectorType::Http]);
    assert!(!health[&ConnectorType::GraphQuery]);

    let report = registry.health_report().await;
    assert_eq!(report.status, HealthStatus::Degraded);
    assert!(report.is_ready());
    assert!(!report.connector(ConnectorType::GraphQuery).unwrap().healthy);
    assert!(!registry.is_healthy(ConnectorType::Log, &ctx()).await);
}

#[tokio::test]
async fn shutdown_closes_everything_and_refuses_new_work() {
    let registry = ConnectorRegistry::new();
    let http = MockBackend::http();
    let log = MockBackend::log();
    registry
        .register(ConnectorType::Http, ResilientConnector::new(http.clone()))
        .await
        .unwrap();
    registry
        .register(ConnectorType::Log, ResilientConnector::new(log.clone()))
        .await
        .unwrap();

    registry.shutdown().await;
    registry.shutdown().await;

    assert_eq!(http.close_calls(), 1);
    assert_eq!(log.close_calls(), 1);
    assert!(registry.is_empty());

    let err = registry
        .send_sync(ConnectorType::Http, get("/x"), &ctx())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);

    let err = registry
        .register(ConnectorType::Http, ResilientConnector::new(MockBackend::http()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);

    let report = registry.health_report().await;
    assert_eq!(report.status, HealthStatus::Unhealthy);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn register_racing_shutdown_never_leaves_an_open_connector() {
    for _ in 0..200 {
        let registry = std::sync::Arc::new(ConnectorRegistry::new());
        let backend = MockBackend::queue();

        let registering = {
            let registry = registry.clone();
            let connector = ResilientConnector::new(backend.clone());
            tokio::spawn(async move { registry.register(ConnectorType::Queue, connector).await })
        };
        let shutting_down = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.shutdown().await })
        };

        let registered = registering.await.unwrap();
        shutting_down.await.unwrap();

        assert!(registry.is_empty());
        match registered {
            Ok(()) => assert_eq!(backend.close_calls(), 1),
            Err(err) => {
                assert_eq!(err.kind(), ErrorKind::Unavailable);
                assert_eq!(backend.close_calls(), 0);
            }
        }
    }
}

#[tokio::test]
async fn scripted_outcomes_show_up_in_metrics() {
    let backend = MockBackend::log()
        .then_fail(ErrorKind::BackendCommunication, "broker down")
        .then_respond(LogResponse::stored("orders", 2, 11));
    let connector = ResilientConnector::with_policies(
        backend.clone(),
        PolicyStackConfig::passthrough().with_circuit_breaker(CircuitBreakerConfig::default()),
    );

    connector.send_sync(&log_record("orders"), &ctx()).await.unwrap_err();
    let stored = connector
        .send_sync(&log_record("orders"), &ctx())
        .await
        .unwrap();
    assert_eq!(stored.position().map(|p| p.partition), Some(2));

    backend.push_step(MockStep::Fail(ErrorKind::Authentication, "expired".into()));
    let err = connector
        .send_sync(&log_record("orders"), &ctx())
        .await
        .unwrap_err();
    assert!(!err.is_retryable());

    let registry = ConnectorRegistry::new();
    registry.register(ConnectorType::Log, connector).await.unwrap();
    let metrics = registry.metrics_of_all();
    let log_metrics = &metrics[&ConnectorType::Log];
    assert_eq!(log_metrics.calls_total, 3);
    assert_eq!(log_metrics.calls_failed, 2);

    let text = render_prometheus(&metrics);
    assert!(text.contains("switchboard_connector_calls_total{connector=\"log\"} 3"));
}

#[test]
fn request_response_queue_message_requires_reply_destination() {
    let err = QueueRequest::builder()
        .destination("rpc")
        .payload("ping")
        .exchange_pattern(ExchangePattern::RequestResponse)
        .build()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let request = QueueRequest::builder()
        .destination("rpc")
        .payload("ping")
        .exchange_pattern(ExchangePattern::RequestResponse)
        .reply_to("rpc.replies")
        .build()
        .unwrap();
    assert_eq!(request.reply_to(), Some("rpc.replies"));
}
