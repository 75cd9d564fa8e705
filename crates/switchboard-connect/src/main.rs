//! switchboard - inspect and validate connector configuration
//!
//! # Usage
//!
//! ```bash
//! # Validate configuration
//! switchboard -c switchboard.yaml validate
//!
//! # Print effective policies of every connector type
//! switchboard -c switchboard.yaml policies
//!
//! # Print effective policies of one connector type
//! switchboard -c switchboard.yaml policies --connector queue
//!
//! # Print the configuration JSON schema
//! switchboard schema --format yaml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use switchboard_connect::config::{PolicyConfig, SwitchboardConfig};
use switchboard_connect::telemetry::init_logging;
use switchboard_connect::ConnectorType;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(version, about = "Resilient backend connectors")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "switchboard.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration file
    Validate,
    /// Print effective per-connector policy configuration as YAML
    Policies {
        /// Only this connector type (http, queue, log, graph_query)
        #[arg(long)]
        connector: Option<ConnectorType>,
    },
    /// Print the configuration JSON schema
    Schema {
        /// Output format (json, yaml)
        #[arg(long, default_value = "json")]
        format: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(if cli.verbose { "debug" } else { "info" }, cli.log_json)?;

    // schema output needs no config file
    if let Commands::Schema { format } = &cli.command {
        return show_schema(format);
    }

    let config = SwitchboardConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    debug!(path = %cli.config.display(), "configuration loaded");

    match cli.command {
        Commands::Validate => validate_config(&config),
        Commands::Policies { connector } => show_policies(&config, connector),
        Commands::Schema { .. } => Ok(()),
    }
}

fn validate_config(config: &SwitchboardConfig) -> Result<()> {
    println!("✓ Configuration valid!\n");
    println!("Version: {}", config.version);
    println!();

    println!("Connectors:");
    if config.connectors.is_empty() {
        println!("  (none configured, defaults apply to every type)");
    }
    for ty in ConnectorType::ALL {
        let Some(settings) = config.connector(ty) else {
            continue;
        };
        println!(
            "  {} [{}]",
            ty,
            if settings.enabled { "enabled" } else { "disabled" }
        );
        if let Some(endpoint) = &settings.endpoint {
            println!("    Endpoint: {}", endpoint);
        }
        if let Some(dc) = &settings.datacenter {
            println!("    Datacenter: {}", dc);
        }
        let stack = config.policy_for(ty);
        let enabled: Vec<&str> = [
            ("bulkhead", stack.bulkhead.is_some()),
            ("rate_limiter", stack.rate_limiter.is_some()),
            ("retry", stack.retry.is_some()),
            ("circuit_breaker", stack.circuit_breaker.is_some()),
            ("time_limiter", stack.time_limiter.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, on)| on.then_some(name))
        .collect();
        println!("    Policies: {}", enabled.join(", "));
    }
    println!();

    let pipeline = &config.pipeline;
    println!("Pipeline:");
    println!("  Max attempts: {}", pipeline.max_attempts);
    println!("  Retry entry: {:?}", pipeline.retry_entry);
    let stages: Vec<String> = pipeline
        .non_retryable_stages
        .iter()
        .map(ToString::to_string)
        .collect();
    println!("  Non-retryable stages: {}", stages.join(", "));

    info!(connectors = config.connectors.len(), "configuration validated");
    Ok(())
}

fn show_policies(config: &SwitchboardConfig, connector: Option<ConnectorType>) -> Result<()> {
    let types = match connector {
        Some(ty) => vec![ty],
        None => ConnectorType::ALL.to_vec(),
    };
    let view: BTreeMap<ConnectorType, PolicyConfig> = types
        .into_iter()
        .map(|ty| (ty, config.resolved_policies(ty)))
        .collect();

    let yaml = serde_yaml::to_string(&view).context("Failed to render policies")?;
    print!("{}", yaml);
    Ok(())
}

fn show_schema(format: &str) -> Result<()> {
    let schema = schemars::schema_for!(SwitchboardConfig);
    let output = match format {
        "yaml" => serde_yaml::to_string(&schema)?,
        "json" => serde_json::to_string_pretty(&schema)?,
        other => anyhow::bail!("Unknown format: {} (use json or yaml)", other),
    };
    println!("{}", output);
    Ok(())
}
