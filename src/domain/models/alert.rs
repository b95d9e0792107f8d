use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::agent::AgentId;

/// Alert severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    None,
    Warning,
    Critical,
}

impl Default for AlertSeverity {
    fn default() -> Self {
        Self::None
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Which metric drove an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMetric {
    SuccessRate,
    AverageExecutionTime,
}

/// Current alert state of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertState {
    pub agent_id: AgentId,
    pub severity: AlertSeverity,
    pub metric: AlertMetric,
    /// Metric value that triggered the current severity
    pub value: f64,
    pub entered_at: DateTime<Utc>,
}

/// Emitted once per severity change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertChange {
    pub agent_id: AgentId,
    pub previous: AlertSeverity,
    pub severity: AlertSeverity,
    pub metric: AlertMetric,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl AlertChange {
    pub fn is_escalation(&self) -> bool {
        self.severity > self.previous
    }
}

/// Threshold configuration for the alert engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AlertThresholds {
    /// Success rate below this is a warning-level breach
    #[serde(default = "default_warning_success_rate")]
    pub warning_success_rate: f64,

    /// Success rate below this is a critical-level breach
    #[serde(default = "default_critical_success_rate")]
    pub critical_success_rate: f64,

    /// Average latency above this is a warning-level breach
    #[serde(default = "default_max_average_execution_time_ms")]
    pub max_average_execution_time_ms: f64,

    #[serde(default = "default_consecutive_breaches")]
    pub consecutive_breaches_to_escalate: u32,

    #[serde(default = "default_consecutive_clean")]
    pub consecutive_clean_to_recover: u32,

    /// Samples with fewer executions skip the success-rate check
    #[serde(default = "default_min_executions")]
    pub min_executions: u64,
}

const fn default_warning_success_rate() -> f64 {
    0.8
}

const fn default_critical_success_rate() -> f64 {
    0.5
}

const fn default_max_average_execution_time_ms() -> f64 {
    30_000.0
}

const fn default_consecutive_breaches() -> u32 {
    3
}

const fn default_consecutive_clean() -> u32 {
    3
}

const fn default_min_executions() -> u64 {
    1
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            warning_success_rate: default_warning_success_rate(),
            critical_success_rate: default_critical_success_rate(),
            max_average_execution_time_ms: default_max_average_execution_time_ms(),
            consecutive_breaches_to_escalate: default_consecutive_breaches(),
            consecutive_clean_to_recover: default_consecutive_clean(),
            min_executions: default_min_executions(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(AlertSeverity::None < AlertSeverity::Warning);
        assert!(AlertSeverity::Warning < AlertSeverity::Critical);
        assert_eq!(AlertSeverity::default(), AlertSeverity::None);
    }

    #[test]
    fn test_thresholds_yaml_partial() {
        let thresholds: AlertThresholds =
            serde_yaml::from_str("warning_success_rate: 0.9\nconsecutive_breaches_to_escalate: 5")
                .unwrap();
        assert!((thresholds.warning_success_rate - 0.9).abs() < f64::EPSILON);
        assert_eq!(thresholds.consecutive_breaches_to_escalate, 5);
        assert!((thresholds.critical_success_rate - 0.5).abs() < f64::EPSILON);
    }
}
