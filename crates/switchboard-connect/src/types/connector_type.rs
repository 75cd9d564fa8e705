//! Connector type key

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The closed set of backend kinds a registry routes between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorType {
    /// Request/response HTTP APIs
    Http,
    /// Point-to-point message queues
    Queue,
    /// Partitioned pub/sub log
    Log,
    /// Graph query APIs
    GraphQuery,
}

impl ConnectorType {
    /// Every connector type, in declaration order
    pub const ALL: [ConnectorType; 4] = [
        ConnectorType::Http,
        ConnectorType::Queue,
        ConnectorType::Log,
        ConnectorType::GraphQuery,
    ];

    /// Stable lowercase identifier, used as the policy scope name
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorType::Http => "http",
            ConnectorType::Queue => "queue",
            ConnectorType::Log => "log",
            ConnectorType::GraphQuery => "graph_query",
        }
    }

    /// Name of this type's circuit breaker instance
    pub fn circuit_breaker_name(&self) -> String {
        format!("{}-circuit-breaker", self.as_str())
    }
}

impl fmt::Display for ConnectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "http" => Ok(ConnectorType::Http),
            "queue" => Ok(ConnectorType::Queue),
            "log" => Ok(ConnectorType::Log),
            "graph_query" | "graphquery" | "graph" => Ok(ConnectorType::GraphQuery),
            other => Err(format!(
                "unknown connector type '{}' (expected one of: http, queue, log, graph_query)",
                other
            )),
        }
    }
}
