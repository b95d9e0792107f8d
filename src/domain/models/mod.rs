pub mod agent;
pub mod alert;
pub mod config;
pub mod metrics;
pub mod task;

pub use agent::{AgentConfig, AgentId, AgentRecord, AgentState, AgentSummary};
pub use alert::{AlertChange, AlertMetric, AlertSeverity, AlertState, AlertThresholds};
pub use config::{
    BroadcasterConfig, Config, DedupConfig, ExecutorConfig, LoggingConfig, MetricsConfig,
    ProviderConfig, RetryConfig, ServerConfig,
};
pub use metrics::{success_rate, AggregatedMetrics, MetricsSnapshot, RawCounters};
pub use task::{Task, TaskId, TaskStatus};
