//! Health reporting
//!
//! Aggregates per-connector probe results and metrics into one
//! [`HealthReport`] that renders to JSON for liveness / readiness checks.

use crate::metrics::ConnectorMetrics;
use crate::types::ConnectorType;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Overall health of the registered connectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Every connector is healthy
    Healthy,
    /// Some connectors are healthy
    Degraded,
    /// No connector is healthy, or none is registered
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        })
    }
}

/// Health of a single connector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectorHealth {
    pub connector_type: ConnectorType,
    pub healthy: bool,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_state: Option<&'static str>,
    pub calls_failed: u64,
    pub in_flight: usize,
}

/// Point-in-time health of every registered connector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub connectors: Vec<ConnectorHealth>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Combine probe results with metric snapshots.
    ///
    /// Connectors without a probe result count as unhealthy.
    pub fn from_parts(
        health: &HashMap<ConnectorType, bool>,
        metrics: &HashMap<ConnectorType, ConnectorMetrics>,
    ) -> Self {
        let connectors: Vec<ConnectorHealth> = ConnectorType::ALL
            .iter()
            .filter_map(|ty| metrics.get(ty))
            .map(|m| ConnectorHealth {
                connector_type: m.connector_type,
                healthy: health.get(&m.connector_type).copied().unwrap_or(false),
                status: m.status.as_str(),
                circuit_state: m.circuit_state.map(|s| s.as_str()),
                calls_failed: m.calls_failed,
                in_flight: m.in_flight,
            })
            .collect();

        let healthy = connectors.iter().filter(|c| c.healthy).count();
        let status = match healthy {
            0 => HealthStatus::Unhealthy,
            n if n == connectors.len() => HealthStatus::Healthy,
            _ => HealthStatus::Degraded,
        };

        Self {
            status,
            connectors,
            checked_at: Utc::now(),
        }
    }

    /// All connectors healthy
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    /// At least one connector can serve calls
    pub fn is_ready(&self) -> bool {
        self.status != HealthStatus::Unhealthy
    }

    /// HTTP status a health endpoint would answer with
    pub fn http_status(&self) -> u16 {
        if self.is_healthy() {
            200
        } else {
            503
        }
    }

    /// Health of one connector
    pub fn connector(&self, ty: ConnectorType) -> Option<&ConnectorHealth> {
        self.connectors.iter().find(|c| c.connector_type == ty)
    }

    /// Pretty-printed JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ConnectorStatus;
    use switchboard_resilience::{CircuitState, PolicyStack, PolicyStackConfig};

    fn metrics(ty: ConnectorType, state: CircuitState) -> ConnectorMetrics {
        ConnectorMetrics {
            connector_type: ty,
            status: ConnectorStatus::Running,
            circuit_state: Some(state),
            calls_total: 4,
            calls_succeeded: 3,
            calls_failed: 1,
            in_flight: 0,
            policies: PolicyStack::new(ty.as_str(), PolicyStackConfig::passthrough()).stats(),
        }
    }

    #[test]
    fn test_all_healthy() {
        let health = HashMap::from([(ConnectorType::Http, true), (ConnectorType::Log, true)]);
        let metrics = HashMap::from([
            (ConnectorType::Http, metrics(ConnectorType::Http, CircuitState::Closed)),
            (ConnectorType::Log, metrics(ConnectorType::Log, CircuitState::Closed)),
        ]);

        let report = HealthReport::from_parts(&health, &metrics);

        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.http_status(), 200);
        assert_eq!(report.connectors[0].connector_type, ConnectorType::Http);
    }

    #[test]
    fn test_degraded_when_one_breaker_open() {
        let health = HashMap::from([(ConnectorType::Http, true), (ConnectorType::Queue, false)]);
        let metrics = HashMap::from([
            (ConnectorType::Http, metrics(ConnectorType::Http, CircuitState::Closed)),
            (ConnectorType::Queue, metrics(ConnectorType::Queue, CircuitState::Open)),
        ]);

        let report = HealthReport::from_parts(&health, &metrics);

        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.is_ready());
        assert!(!report.is_healthy());
        assert_eq!(
            report.connector(ConnectorType::Queue).unwrap().circuit_state,
            Some("open")
        );
    }

    #[test]
    fn test_empty_registry_is_unhealthy() {
        let report = HealthReport::from_parts(&HashMap::new(), &HashMap::new());
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(!report.is_ready());
    }

    #[test]
    fn test_json_rendering() {
        let health = HashMap::from([(ConnectorType::GraphQuery, true)]);
        let metrics = HashMap::from([(
            ConnectorType::GraphQuery,
            metrics(ConnectorType::GraphQuery, CircuitState::Closed),
        )]);

        let json: serde_json::Value =
            serde_json::from_str(&HealthReport::from_parts(&health, &metrics).to_json().unwrap())
                .unwrap();

        assert_eq!(json["status"], "healthy");
        assert_eq!(json["connectors"][0]["connector_type"], "graph_query");
        assert_eq!(json["connectors"][0]["status"], "running");
    }
}
