use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::alert::AlertThresholds;

/// Main configuration structure for the dispatch engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Ledger call retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Claimed-task dedup cache
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Worker pool and shutdown behavior
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Metrics sampling
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Alert thresholds and hysteresis
    #[serde(default)]
    pub alerts: AlertThresholds,

    /// Realtime fan-out
    #[serde(default)]
    pub broadcaster: BroadcasterConfig,

    /// Monitoring HTTP server
    #[serde(default)]
    pub server: ServerConfig,

    /// Named capability providers agents can be configured with
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rotated log files; stdout only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,

    /// Rotation for file output: daily, hourly or never
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    200
}

const fn default_max_backoff_ms() -> u64 {
    5_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Dedup store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DedupConfig {
    /// How long a claimed task id is remembered. Must exceed every agent's
    /// task timeout.
    #[serde(default = "default_dedup_ttl_ms")]
    pub ttl_ms: u64,
}

const fn default_dedup_ttl_ms() -> u64 {
    600_000
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_dedup_ttl_ms(),
        }
    }
}

impl DedupConfig {
    pub const fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Executor pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExecutorConfig {
    /// How long `stop()` waits for in-flight tasks before abandoning them
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Ledger failures in a row (after retries) that put an agent in error
    #[serde(default = "default_max_consecutive_ledger_failures")]
    pub max_consecutive_ledger_failures: u32,

    /// Capacity of the per-agent dispatch queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

const fn default_shutdown_grace_ms() -> u64 {
    10_000
}

const fn default_max_consecutive_ledger_failures() -> u32 {
    5
}

const fn default_queue_capacity() -> usize {
    1024
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_consecutive_ledger_failures: default_max_consecutive_ledger_failures(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl ExecutorConfig {
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Metrics collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MetricsConfig {
    #[serde(default = "default_collection_interval_ms")]
    pub collection_interval_ms: u64,

    /// Snapshots kept per agent for `getAgentHistory`
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

const fn default_collection_interval_ms() -> u64 {
    30_000
}

const fn default_history_limit() -> usize {
    100
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            collection_interval_ms: default_collection_interval_ms(),
            history_limit: default_history_limit(),
        }
    }
}

impl MetricsConfig {
    pub const fn collection_interval(&self) -> Duration {
        Duration::from_millis(self.collection_interval_ms)
    }
}

/// Realtime broadcaster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BroadcasterConfig {
    /// Outbound messages buffered per observer before the oldest is dropped
    #[serde(default = "default_observer_buffer")]
    pub observer_buffer_capacity: usize,

    /// Capacity of the internal event bus
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

const fn default_observer_buffer() -> usize {
    256
}

const fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            observer_buffer_capacity: default_observer_buffer(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

/// Monitoring server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_true")]
    pub enable_cors: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    9400
}

const fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            enable_cors: default_true(),
        }
    }
}

/// Capability provider backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// Deterministic in-process provider
    Mock {
        #[serde(default)]
        canned_response: Option<String>,
    },
    /// OpenAI-compatible HTTP API
    Openai {
        #[serde(default = "default_openai_base_url")]
        base_url: String,
        #[serde(default = "default_openai_model")]
        model: String,
        #[serde(default = "default_embedding_model")]
        embedding_model: String,
        /// Falls back to OPENAI_API_KEY when unset
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
        #[serde(default = "default_provider_timeout_secs")]
        timeout_secs: u64,
    },
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

const fn default_provider_timeout_secs() -> u64 {
    120
}
