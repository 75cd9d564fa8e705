//! Configuration for switchboard
//!
//! A YAML file declares default policy settings, per-connector overrides and
//! the pipeline's retry policy:
//!
//! ```yaml
//! version: "1.0"
//! defaults:
//!   retry:
//!     max_attempts: 3
//!     wait_duration_ms: 1000
//! connectors:
//!   http:
//!     endpoint: ${ORDERS_API:-https://orders.internal}
//!     datacenter: eu-west-1
//!     policies:
//!       time_limiter:
//!         timeout_duration_ms: 5000
//! pipeline:
//!   max_attempts: 5
//!   retry_entry: failing_stage
//! ```
//!
//! Durations are plain milliseconds. `${VAR}` and `${VAR:-default}` are
//! expanded from the environment before parsing.

use crate::error::ConnectorResult;
use crate::processing::{PipelinePolicy, RetryEntry, Stage};
use crate::types::{ConnectorContext, ConnectorType};
use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use switchboard_resilience::{
    Backoff, BulkheadConfig, CircuitBreakerConfig, PolicyStackConfig, RateLimiterConfig,
    RetryConfig, TimeLimiterConfig,
};
use validator::Validate;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct SwitchboardConfig {
    /// Configuration version
    #[serde(default = "default_version")]
    pub version: String,

    /// Policy settings every connector starts from
    #[serde(default)]
    pub defaults: PolicyConfig,

    /// Per-type connector settings
    #[serde(default)]
    pub connectors: HashMap<ConnectorType, ConnectorSettings>,

    /// Message pipeline retry policy
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            defaults: PolicyConfig::default(),
            connectors: HashMap::new(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl SwitchboardConfig {
    /// Load and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse and validate YAML content
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            serde_yaml::from_str(&expanded).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> anyhow::Result<()> {
        self.defaults
            .check()
            .context("invalid default policies")?;

        for ty in ConnectorType::ALL {
            let Some(settings) = self.connectors.get(&ty) else {
                continue;
            };
            if settings.endpoint.as_deref().is_some_and(str::is_empty) {
                anyhow::bail!("Connector '{}': endpoint must not be empty", ty);
            }
            self.resolved_policies(ty)
                .check()
                .with_context(|| format!("Connector '{}': invalid policies", ty))?;
        }

        Validate::validate(&self.pipeline)
            .map_err(|e| anyhow::anyhow!("Pipeline: config validation failed: {}", e))?;
        Ok(())
    }

    /// Settings of `ty`, if configured
    pub fn connector(&self, ty: ConnectorType) -> Option<&ConnectorSettings> {
        self.connectors.get(&ty)
    }

    /// Configured and enabled connector types, in declaration order
    pub fn enabled_connectors(&self) -> Vec<ConnectorType> {
        ConnectorType::ALL
            .into_iter()
            .filter(|ty| self.connectors.get(ty).is_some_and(|s| s.enabled))
            .collect()
    }

    /// Policy settings of `ty`: the defaults with the connector's sections laid over
    pub fn resolved_policies(&self, ty: ConnectorType) -> PolicyConfig {
        match self.connectors.get(&ty).and_then(|s| s.policies.as_ref()) {
            Some(overrides) => self.defaults.overlay(overrides),
            None => self.defaults.clone(),
        }
    }

    /// Effective policy stack of `ty`
    pub fn policy_for(&self, ty: ConnectorType) -> PolicyStackConfig {
        self.resolved_policies(ty).to_stack_config()
    }
}

/// Expand environment variables in the format ${VAR} or ${VAR:-default}
fn expand_env_vars(content: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());

            std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
        })
        .to_string()
}

/// Settings of one connector type
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ConnectorSettings {
    /// Whether the connector should be registered
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Target endpoint used for health probes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Datacenter / region tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,

    /// Policy sections replacing the defaults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policies: Option<PolicyOverrides>,
}

impl ConnectorSettings {
    /// Health-probe context for the configured endpoint
    pub fn context(&self) -> ConnectorResult<Option<ConnectorContext>> {
        let Some(endpoint) = &self.endpoint else {
            return Ok(None);
        };
        let mut builder = ConnectorContext::builder(endpoint.clone());
        if let Some(dc) = &self.datacenter {
            builder = builder.datacenter(dc.clone());
        }
        builder.build().map(Some)
    }
}

/// Settings for all five policy primitives
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, Validate, JsonSchema)]
#[serde(default)]
pub struct PolicyConfig {
    #[validate(nested)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[validate(nested)]
    pub retry: RetrySettings,
    #[validate(nested)]
    pub bulkhead: BulkheadSettings,
    #[validate(nested)]
    pub rate_limiter: RateLimiterSettings,
    #[validate(nested)]
    pub time_limiter: TimeLimiterSettings,
}

impl PolicyConfig {
    /// Field ranges plus cross-field rules
    pub fn check(&self) -> anyhow::Result<()> {
        Validate::validate(self)
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;
        let cb = &self.circuit_breaker;
        if cb.minimum_number_of_calls > cb.sliding_window_size {
            anyhow::bail!(
                "circuit_breaker.minimum_number_of_calls ({}) exceeds sliding_window_size ({})",
                cb.minimum_number_of_calls,
                cb.sliding_window_size
            );
        }
        Ok(())
    }

    /// Replace whole sections with the ones `overrides` sets
    pub fn overlay(&self, overrides: &PolicyOverrides) -> PolicyConfig {
        PolicyConfig {
            circuit_breaker: overrides
                .circuit_breaker
                .clone()
                .unwrap_or_else(|| self.circuit_breaker.clone()),
            retry: overrides.retry.clone().unwrap_or_else(|| self.retry.clone()),
            bulkhead: overrides
                .bulkhead
                .clone()
                .unwrap_or_else(|| self.bulkhead.clone()),
            rate_limiter: overrides
                .rate_limiter
                .clone()
                .unwrap_or_else(|| self.rate_limiter.clone()),
            time_limiter: overrides
                .time_limiter
                .clone()
                .unwrap_or_else(|| self.time_limiter.clone()),
        }
    }

    /// Policy stack with disabled sections left out
    pub fn to_stack_config(&self) -> PolicyStackConfig {
        PolicyStackConfig {
            bulkhead: self.bulkhead.to_config(),
            rate_limiter: self.rate_limiter.to_config(),
            retry: self.retry.to_config(),
            circuit_breaker: self.circuit_breaker.to_config(),
            time_limiter: self.time_limiter.to_config(),
        }
    }
}

/// Per-connector policy sections; unset sections fall back to the defaults
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct PolicyOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bulkhead: Option<BulkheadSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limiter: Option<RateLimiterSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_limiter: Option<TimeLimiterSettings>,
}

/// Circuit breaker section
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Validate, JsonSchema)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub enabled: bool,
    /// Failure percentage that opens the circuit
    #[validate(range(exclusive_min = 0.0, max = 100.0))]
    pub failure_rate_threshold: f32,
    /// Slow-call percentage that opens the circuit
    #[validate(range(exclusive_min = 0.0, max = 100.0))]
    pub slow_call_rate_threshold: f32,
    pub slow_call_duration_threshold_ms: u64,
    #[validate(range(min = 1))]
    pub sliding_window_size: usize,
    #[validate(range(min = 1))]
    pub minimum_number_of_calls: usize,
    pub wait_duration_in_open_state_ms: u64,
    #[validate(range(min = 1))]
    pub permitted_number_of_calls_in_half_open_state: usize,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self::from(&CircuitBreakerConfig::default())
    }
}

impl From<&CircuitBreakerConfig> for CircuitBreakerSettings {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            enabled: true,
            failure_rate_threshold: config.failure_rate_threshold,
            slow_call_rate_threshold: config.slow_call_rate_threshold,
            slow_call_duration_threshold_ms: millis(config.slow_call_duration_threshold),
            sliding_window_size: config.sliding_window_size,
            minimum_number_of_calls: config.minimum_number_of_calls,
            wait_duration_in_open_state_ms: millis(config.wait_duration_in_open_state),
            permitted_number_of_calls_in_half_open_state: config
                .permitted_number_of_calls_in_half_open_state,
        }
    }
}

impl CircuitBreakerSettings {
    /// Breaker config, or `None` when disabled
    pub fn to_config(&self) -> Option<CircuitBreakerConfig> {
        self.enabled.then(|| CircuitBreakerConfig {
            failure_rate_threshold: self.failure_rate_threshold,
            slow_call_rate_threshold: self.slow_call_rate_threshold,
            slow_call_duration_threshold: Duration::from_millis(
                self.slow_call_duration_threshold_ms,
            ),
            sliding_window_size: self.sliding_window_size,
            minimum_number_of_calls: self.minimum_number_of_calls,
            wait_duration_in_open_state: Duration::from_millis(self.wait_duration_in_open_state_ms),
            permitted_number_of_calls_in_half_open_state: self
                .permitted_number_of_calls_in_half_open_state,
        })
    }
}

/// Retry section
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Validate, JsonSchema)]
#[serde(default)]
pub struct RetrySettings {
    pub enabled: bool,
    /// Total attempts including the first
    #[validate(range(min = 1, max = 100))]
    pub max_attempts: u32,
    /// Wait before the second attempt
    pub wait_duration_ms: u64,
    #[validate(range(min = 1.0))]
    pub backoff_multiplier: f64,
    /// Upper bound on any single wait
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_wait_duration_ms: Option<u64>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let config = RetryConfig::default();
        Self {
            enabled: true,
            max_attempts: config.max_attempts,
            wait_duration_ms: millis(config.backoff.initial),
            backoff_multiplier: config.backoff.multiplier,
            max_wait_duration_ms: config.backoff.max.map(millis),
        }
    }
}

impl RetrySettings {
    /// Retry config, or `None` when disabled
    pub fn to_config(&self) -> Option<RetryConfig> {
        self.enabled.then(|| {
            RetryConfig::new(
                self.max_attempts,
                backoff(
                    self.wait_duration_ms,
                    self.backoff_multiplier,
                    self.max_wait_duration_ms,
                ),
            )
        })
    }
}

/// Bulkhead section
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Validate, JsonSchema)]
#[serde(default)]
pub struct BulkheadSettings {
    pub enabled: bool,
    #[validate(range(min = 1))]
    pub max_concurrent_calls: usize,
    /// Longest wait for a slot
    pub max_wait_duration_ms: u64,
    /// Callers allowed to queue for a slot
    pub max_waiting_calls: usize,
}

impl Default for BulkheadSettings {
    fn default() -> Self {
        let config = BulkheadConfig::default();
        Self {
            enabled: true,
            max_concurrent_calls: config.max_concurrent_calls,
            max_wait_duration_ms: millis(config.max_wait_duration),
            max_waiting_calls: config.max_waiting_calls,
        }
    }
}

impl BulkheadSettings {
    /// Bulkhead config, or `None` when disabled
    pub fn to_config(&self) -> Option<BulkheadConfig> {
        self.enabled.then(|| BulkheadConfig {
            max_concurrent_calls: self.max_concurrent_calls,
            max_wait_duration: Duration::from_millis(self.max_wait_duration_ms),
            max_waiting_calls: self.max_waiting_calls,
        })
    }
}

/// Rate limiter section
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Validate, JsonSchema)]
#[serde(default)]
pub struct RateLimiterSettings {
    pub enabled: bool,
    /// Permits granted per refresh period
    #[validate(range(min = 1))]
    pub limit_for_period: u32,
    #[validate(range(min = 1))]
    pub limit_refresh_period_ms: u64,
    /// Longest wait for a permit
    pub timeout_duration_ms: u64,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        let config = RateLimiterConfig::default();
        Self {
            enabled: true,
            limit_for_period: config.limit_for_period,
            limit_refresh_period_ms: millis(config.limit_refresh_period),
            timeout_duration_ms: millis(config.timeout_duration),
        }
    }
}

impl RateLimiterSettings {
    /// Rate limiter config, or `None` when disabled
    pub fn to_config(&self) -> Option<RateLimiterConfig> {
        self.enabled.then(|| {
            RateLimiterConfig::new(
                self.limit_for_period,
                Duration::from_millis(self.limit_refresh_period_ms),
            )
            .with_timeout(Duration::from_millis(self.timeout_duration_ms))
        })
    }
}

/// Time limiter section
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Validate, JsonSchema)]
#[serde(default)]
pub struct TimeLimiterSettings {
    pub enabled: bool,
    #[validate(range(min = 1))]
    pub timeout_duration_ms: u64,
}

impl Default for TimeLimiterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_duration_ms: millis(TimeLimiterConfig::default().timeout_duration),
        }
    }
}

impl TimeLimiterSettings {
    /// Time limiter config, or `None` when disabled
    pub fn to_config(&self) -> Option<TimeLimiterConfig> {
        self.enabled
            .then(|| TimeLimiterConfig::new(Duration::from_millis(self.timeout_duration_ms)))
    }
}

/// Pipeline retry section
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Validate, JsonSchema)]
#[serde(default)]
pub struct PipelineConfig {
    /// Attempts per message, including the first
    #[validate(range(min = 1, max = 100))]
    pub max_attempts: u32,
    /// Re-entry point on retry
    pub retry_entry: RetryEntry,
    /// Stages whose failures dead-letter immediately
    pub non_retryable_stages: Vec<Stage>,
    pub backoff_initial_ms: u64,
    #[validate(range(min = 1.0))]
    pub backoff_multiplier: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_max_ms: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_entry: RetryEntry::FailingStage,
            non_retryable_stages: vec![Stage::Validate],
            backoff_initial_ms: 1000,
            backoff_multiplier: 2.0,
            backoff_max_ms: Some(30_000),
        }
    }
}

impl PipelineConfig {
    /// Runtime policy for [`crate::processing::Pipeline`]
    pub fn to_policy(&self) -> PipelinePolicy {
        PipelinePolicy::default()
            .with_max_attempts(self.max_attempts)
            .with_retry_entry(self.retry_entry)
            .with_non_retryable_stages(self.non_retryable_stages.iter().copied())
            .with_backoff(backoff(
                self.backoff_initial_ms,
                self.backoff_multiplier,
                self.backoff_max_ms,
            ))
    }
}

fn backoff(initial_ms: u64, multiplier: f64, max_ms: Option<u64>) -> Backoff {
    let backoff = Backoff::exponential(Duration::from_millis(initial_ms), multiplier);
    match max_ms {
        Some(max) => backoff.with_max(Duration::from_millis(max)),
        None => backoff,
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let stack = SwitchboardConfig::default().policy_for(ConnectorType::Http);

        let cb = stack.circuit_breaker.unwrap();
        assert_eq!(cb.failure_rate_threshold, 50.0);
        assert_eq!(cb.sliding_window_size, 20);
        assert_eq!(cb.minimum_number_of_calls, 10);
        assert_eq!(cb.wait_duration_in_open_state, Duration::from_secs(30));
        assert_eq!(cb.permitted_number_of_calls_in_half_open_state, 5);

        let retry = stack.retry.unwrap();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.backoff.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(retry.backoff.delay_for_attempt(2), Duration::from_secs(2));

        let bulkhead = stack.bulkhead.unwrap();
        assert_eq!(bulkhead.max_concurrent_calls, 25);
        assert_eq!(bulkhead.max_wait_duration, Duration::from_secs(5));

        let rl = stack.rate_limiter.unwrap();
        assert_eq!(rl.limit_for_period, 100);
        assert_eq!(rl.limit_refresh_period, Duration::from_secs(1));
        assert_eq!(rl.timeout_duration, Duration::from_secs(2));

        assert_eq!(
            stack.time_limiter.unwrap().timeout_duration,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_connector_sections_override_defaults() {
        let yaml = r#"
defaults:
  retry:
    max_attempts: 4
connectors:
  queue:
    endpoint: amqp://broker
    policies:
      bulkhead:
        enabled: false
      time_limiter:
        timeout_duration_ms: 500
"#;
        let config = SwitchboardConfig::from_yaml(yaml).unwrap();

        let queue = config.policy_for(ConnectorType::Queue);
        assert!(queue.bulkhead.is_none());
        assert_eq!(
            queue.time_limiter.unwrap().timeout_duration,
            Duration::from_millis(500)
        );
        assert_eq!(queue.retry.unwrap().max_attempts, 4);

        let http = config.policy_for(ConnectorType::Http);
        assert!(http.bulkhead.is_some());
        assert_eq!(config.enabled_connectors(), vec![ConnectorType::Queue]);
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("SWITCHBOARD_TEST_ENDPOINT", "https://api.test");
        let yaml = r#"
connectors:
  http:
    endpoint: ${SWITCHBOARD_TEST_ENDPOINT}
    datacenter: ${SWITCHBOARD_TEST_UNSET_DC:-dc-2}
"#;
        let config = SwitchboardConfig::from_yaml(yaml).unwrap();
        let http = config.connector(ConnectorType::Http).unwrap();
        assert_eq!(http.endpoint.as_deref(), Some("https://api.test"));
        assert_eq!(http.datacenter.as_deref(), Some("dc-2"));

        let ctx = http.context().unwrap().unwrap();
        assert_eq!(ctx.endpoint(), "https://api.test");
        assert_eq!(ctx.datacenter(), Some("dc-2"));
    }

    #[test]
    fn test_min_calls_above_window_names_connector() {
        let yaml = r#"
connectors:
  log:
    policies:
      circuit_breaker:
        sliding_window_size: 5
        minimum_number_of_calls: 10
"#;
        let err = SwitchboardConfig::from_yaml(yaml).unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("Connector 'log'"), "{}", msg);
        assert!(msg.contains("minimum_number_of_calls"), "{}", msg);
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let yaml = r#"
defaults:
  circuit_breaker:
    failure_rate_threshold: 150.0
"#;
        let err = SwitchboardConfig::from_yaml(yaml).unwrap_err();
        assert!(format!("{:#}", err).contains("validation failed"));
    }

    #[test]
    fn test_zero_threshold_rejected() {
        for field in ["failure_rate_threshold", "slow_call_rate_threshold"] {
            let yaml = format!("defaults:\n  circuit_breaker:\n    {}: 0.0\n", field);
            let err = SwitchboardConfig::from_yaml(&yaml).unwrap_err();
            let msg = format!("{:#}", err);
            assert!(msg.contains(field), "{}", msg);
        }

        let yaml = "defaults:\n  circuit_breaker:\n    failure_rate_threshold: 0.5\n";
        assert!(SwitchboardConfig::from_yaml(yaml).is_ok());
    }

    #[test]
    fn test_pipeline_config_to_policy() {
        let yaml = r#"
pipeline:
  max_attempts: 5
  retry_entry: start
  non_retryable_stages: [validate, route]
  backoff_initial_ms: 200
  backoff_multiplier: 3.0
"#;
        let config = SwitchboardConfig::from_yaml(yaml).unwrap();
        let policy = config.pipeline.to_policy();

        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.retry_entry, RetryEntry::Start);
        assert!(policy.non_retryable_stages.contains(&Stage::Route));
        assert_eq!(policy.backoff.delay_for_attempt(2), Duration::from_millis(600));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "version: \"2.0\"\nconnectors:\n  graph_query:\n    enabled: false").unwrap();

        let config = SwitchboardConfig::from_file(file.path()).unwrap();
        assert_eq!(config.version, "2.0");
        assert!(config.enabled_connectors().is_empty());

        assert!(SwitchboardConfig::from_file("/nonexistent/switchboard.yaml").is_err());
    }

    #[test]
    fn test_schema_covers_sections() {
        let schema = schemars::schema_for!(SwitchboardConfig);
        let json = serde_json::to_value(&schema).unwrap();

        let props = &json["properties"];
        for section in ["version", "defaults", "connectors", "pipeline"] {
            assert!(props.get(section).is_some(), "missing {}", section);
        }
        assert!(json["definitions"].get("CircuitBreakerSettings").is_some());
    }
}
