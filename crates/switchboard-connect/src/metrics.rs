//! Connector metrics and Prometheus rendering
//!
//! A [`ConnectorMetrics`] value is a read-only snapshot of one connector:
//! its lifecycle status, circuit state, call counters and the internal
//! counters of each enabled policy primitive. [`render_prometheus`] turns a
//! registry-wide map of snapshots into the text exposition format.

use crate::traits::ConnectorStatus;
use crate::types::ConnectorType;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use switchboard_resilience::{CircuitState, PolicyStackStats};

/// Snapshot of one connector's state and counters
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorMetrics {
    /// Connector type the snapshot belongs to
    pub connector_type: ConnectorType,
    /// Lifecycle status
    pub status: ConnectorStatus,
    /// Circuit state, when the breaker is enabled
    pub circuit_state: Option<CircuitState>,
    /// Logical calls started (admitted or not)
    pub calls_total: u64,
    /// Logical calls that returned a response
    pub calls_succeeded: u64,
    /// Logical calls that surfaced an error
    pub calls_failed: u64,
    /// Calls currently inside the connector
    pub in_flight: usize,
    /// Counters of every enabled policy primitive
    pub policies: PolicyStackStats,
}

impl ConnectorMetrics {
    /// Flattened view suitable for JSON output
    pub fn summary(&self) -> MetricsSummary {
        let breaker = self.policies.circuit_breaker;
        MetricsSummary {
            connector_type: self.connector_type,
            status: self.status.as_str(),
            circuit_state: self.circuit_state.map(|s| s.as_str()),
            calls_total: self.calls_total,
            calls_succeeded: self.calls_succeeded,
            calls_failed: self.calls_failed,
            in_flight: self.in_flight,
            failure_rate: breaker.map(|b| b.failure_rate),
            bulkhead_rejected: self.policies.bulkhead.map(|b| b.rejected_calls),
            rate_limited: self.policies.rate_limiter.map(|r| r.rejected_calls),
            not_permitted: breaker.map(|b| b.not_permitted_calls),
            timed_out: self.policies.time_limiter.map(|t| t.timed_out_calls),
        }
    }
}

/// Serializable digest of [`ConnectorMetrics`]
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub connector_type: ConnectorType,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_state: Option<&'static str>,
    pub calls_total: u64,
    pub calls_succeeded: u64,
    pub calls_failed: u64,
    pub in_flight: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_rate: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bulkhead_rejected: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limited: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_permitted: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timed_out: Option<u64>,
}

/// One metric family: header plus one sample per connector
fn family<I>(out: &mut String, name: &str, kind: &str, help: &str, samples: I)
where
    I: IntoIterator<Item = (ConnectorType, Option<String>)>,
{
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} {}", name, kind);
    for (ty, value) in samples {
        if let Some(value) = value {
            let _ = writeln!(out, "{}{{connector=\"{}\"}} {}", name, ty, value);
        }
    }
    out.push('\n');
}

/// Render snapshots in the Prometheus text exposition format.
///
/// Connectors are emitted in [`ConnectorType::ALL`] order so the output is
/// stable; families for a disabled primitive carry no samples for that type.
pub fn render_prometheus(metrics: &HashMap<ConnectorType, ConnectorMetrics>) -> String {
    let ordered: Vec<&ConnectorMetrics> = ConnectorType::ALL
        .iter()
        .filter_map(|ty| metrics.get(ty))
        .collect();
    let sample = |f: &dyn Fn(&ConnectorMetrics) -> Option<String>| {
        ordered
            .iter()
            .map(|m| (m.connector_type, f(m)))
            .collect::<Vec<_>>()
    };

    let mut out = String::new();

    family(
        &mut out,
        "switchboard_connector_calls_total",
        "counter",
        "Logical calls started",
        sample(&|m| Some(m.calls_total.to_string())),
    );
    family(
        &mut out,
        "switchboard_connector_calls_failed_total",
        "counter",
        "Logical calls that surfaced an error",
        sample(&|m| Some(m.calls_failed.to_string())),
    );
    family(
        &mut out,
        "switchboard_connector_in_flight",
        "gauge",
        "Calls currently inside the connector",
        sample(&|m| Some(m.in_flight.to_string())),
    );
    family(
        &mut out,
        "switchboard_connector_running",
        "gauge",
        "Whether the connector accepts calls (1=yes, 0=no)",
        sample(&|m| Some(u8::from(m.status == ConnectorStatus::Running).to_string())),
    );

    family(
        &mut out,
        "switchboard_circuit_breaker_state",
        "gauge",
        "Circuit state (0=closed, 1=open, 2=half_open)",
        sample(&|m| m.circuit_state.map(|s| (s as u8).to_string())),
    );
    family(
        &mut out,
        "switchboard_circuit_breaker_failure_rate",
        "gauge",
        "Failure rate over the sliding window in percent",
        sample(&|m| {
            m.policies
                .circuit_breaker
                .map(|b| format!("{:.2}", b.failure_rate))
        }),
    );
    family(
        &mut out,
        "switchboard_circuit_breaker_not_permitted_total",
        "counter",
        "Calls rejected by the circuit breaker",
        sample(&|m| {
            m.policies
                .circuit_breaker
                .map(|b| b.not_permitted_calls.to_string())
        }),
    );
    family(
        &mut out,
        "switchboard_bulkhead_available",
        "gauge",
        "Free bulkhead slots",
        sample(&|m| {
            m.policies
                .bulkhead
                .map(|b| b.available_concurrent_calls.to_string())
        }),
    );
    family(
        &mut out,
        "switchboard_bulkhead_rejected_total",
        "counter",
        "Calls rejected by the bulkhead",
        sample(&|m| m.policies.bulkhead.map(|b| b.rejected_calls.to_string())),
    );
    family(
        &mut out,
        "switchboard_rate_limiter_rejected_total",
        "counter",
        "Calls rejected by the rate limiter",
        sample(&|m| m.policies.rate_limiter.map(|r| r.rejected_calls.to_string())),
    );
    family(
        &mut out,
        "switchboard_rate_limiter_wait_ms_total",
        "counter",
        "Time spent waiting for rate limiter permits",
        sample(&|m| m.policies.rate_limiter.map(|r| r.total_wait_ms.to_string())),
    );
    family(
        &mut out,
        "switchboard_retry_failed_with_retry_total",
        "counter",
        "Calls that failed after retrying",
        sample(&|m| {
            m.policies
                .retry
                .map(|r| r.failed_calls_with_retry.to_string())
        }),
    );
    family(
        &mut out,
        "switchboard_retry_succeeded_with_retry_total",
        "counter",
        "Calls that succeeded after retrying",
        sample(&|m| {
            m.policies
                .retry
                .map(|r| r.successful_calls_with_retry.to_string())
        }),
    );
    family(
        &mut out,
        "switchboard_time_limiter_timed_out_total",
        "counter",
        "Attempts that exceeded their deadline",
        sample(&|m| {
            m.policies
                .time_limiter
                .map(|t| t.timed_out_calls.to_string())
        }),
    );

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_resilience::{PolicyStack, PolicyStackConfig};

    fn snapshot(ty: ConnectorType, config: PolicyStackConfig) -> ConnectorMetrics {
        let stack = PolicyStack::new(ty.as_str(), config);
        ConnectorMetrics {
            connector_type: ty,
            status: ConnectorStatus::Running,
            circuit_state: stack.circuit_breaker().map(|b| b.state()),
            calls_total: 12,
            calls_succeeded: 10,
            calls_failed: 2,
            in_flight: 1,
            policies: stack.stats(),
        }
    }

    #[test]
    fn test_render_prometheus() {
        let mut all = HashMap::new();
        all.insert(
            ConnectorType::Http,
            snapshot(ConnectorType::Http, PolicyStackConfig::default()),
        );
        all.insert(
            ConnectorType::Log,
            snapshot(ConnectorType::Log, PolicyStackConfig::passthrough()),
        );

        let output = render_prometheus(&all);

        assert!(output.contains("switchboard_connector_calls_total{connector=\"http\"} 12"));
        assert!(output.contains("switchboard_connector_calls_failed_total{connector=\"log\"} 2"));
        assert!(output.contains("switchboard_circuit_breaker_state{connector=\"http\"} 0"));
        assert!(output.contains("switchboard_bulkhead_available{connector=\"http\"} 25"));
        // passthrough stack has no breaker samples
        assert!(!output.contains("switchboard_circuit_breaker_state{connector=\"log\"}"));
        assert!(output.contains("# TYPE switchboard_bulkhead_rejected_total counter"));
    }

    #[test]
    fn test_summary_serializes() {
        let metrics = snapshot(ConnectorType::Queue, PolicyStackConfig::default());
        let json = serde_json::to_value(metrics.summary()).unwrap();
        assert_eq!(json["connector_type"], "queue");
        assert_eq!(json["status"], "running");
        assert_eq!(json["circuit_state"], "closed");
        assert_eq!(json["bulkhead_rejected"], 0);
    }
}
