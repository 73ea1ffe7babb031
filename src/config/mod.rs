/// Configuration management for the Mechaflow engine
///
/// Handles database location, engine execution defaults and scheduler timing.
/// Every value can be overridden through a MECHAFLOW_* environment variable.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,
    /// Execution engine defaults
    pub engine: EngineConfig,
    /// Cron scheduler configuration
    pub scheduler: SchedulerConfig,
}

/// Database configuration for durable engine state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding the engine database (default: "data")
    /// Creates: {data_dir}/mechaflow.db
    pub data_dir: String,
}

/// Execution engine defaults
///
/// Per-flow and per-node settings take precedence over these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retries for a retryable node error when neither node nor flow sets one
    pub default_max_retries: u32,
    /// Per-action retry defaults, keyed by action name (e.g. "http_request")
    #[serde(default)]
    pub max_retries_by_action: HashMap<String, u32>,
    /// Delay between retry attempts
    pub retry_backoff_ms: u64,
    /// Wall-clock budget per run; None disables the watchdog
    pub execution_budget_ms: Option<u64>,
    /// Upper bound on visits of a single node within one run (loop guard)
    pub max_node_visits: u32,
    /// Lifetime of a checkpoint before cleanup cancels the run; None keeps forever
    pub checkpoint_ttl_ms: Option<u64>,
    /// Maximum subflow nesting depth
    pub max_subflow_depth: u32,
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Tick interval of the driving loop in seconds
    pub tick_interval_secs: u64,
    /// Consecutive failures after which a schedule expires
    pub failure_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 0,
            max_retries_by_action: HashMap::new(),
            retry_backoff_ms: 0,
            execution_budget_ms: None,
            max_node_visits: 10_000,
            checkpoint_ttl_ms: None,
            max_subflow_depth: 8,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 1,
            failure_threshold: 5,
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        let engine_defaults = EngineConfig::default();
        let scheduler_defaults = SchedulerConfig::default();

        Self {
            database: DatabaseConfig {
                data_dir: std::env::var("MECHAFLOW_DATA_DIR")
                    .unwrap_or_else(|_| "data".to_string()),
            },
            engine: EngineConfig {
                default_max_retries: env_parse("MECHAFLOW_MAX_RETRIES")
                    .unwrap_or(engine_defaults.default_max_retries),
                retry_backoff_ms: env_parse("MECHAFLOW_RETRY_BACKOFF_MS")
                    .unwrap_or(engine_defaults.retry_backoff_ms),
                execution_budget_ms: env_parse("MECHAFLOW_EXECUTION_BUDGET_MS"),
                max_node_visits: env_parse("MECHAFLOW_MAX_NODE_VISITS")
                    .unwrap_or(engine_defaults.max_node_visits),
                checkpoint_ttl_ms: env_parse("MECHAFLOW_CHECKPOINT_TTL_MS"),
                ..engine_defaults
            },
            scheduler: SchedulerConfig {
                tick_interval_secs: env_parse("MECHAFLOW_TICK_INTERVAL_SECS")
                    .unwrap_or(scheduler_defaults.tick_interval_secs),
                failure_threshold: env_parse("MECHAFLOW_SCHEDULE_FAILURE_THRESHOLD")
                    .unwrap_or(scheduler_defaults.failure_threshold),
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl EngineConfig {
    /// Engine-level retry default for an action, before flow/node overrides
    pub fn max_retries_for(&self, action: &str) -> u32 {
        self.max_retries_by_action
            .get(action)
            .copied()
            .unwrap_or(self.default_max_retries)
    }
}
