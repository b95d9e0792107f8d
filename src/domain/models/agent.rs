use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::errors::DomainError;

/// Ledger-assigned agent identifier.
pub type AgentId = Uuid;

/// Agent lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Running,
    Stopped,
    Error,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl FromStr for AgentState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            _ => Err(anyhow::anyhow!("Invalid agent state: {s}")),
        }
    }
}

impl AgentState {
    /// States from which `start()` may be issued.
    pub const fn can_start(self) -> bool {
        matches!(self, Self::Idle | Self::Stopped | Self::Error)
    }
}

/// Agent configuration, immutable while running except through `update()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Capability tags advertised on the ledger
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Interval between pending-task polls
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,

    /// Upper bound on tasks in progress at once
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Per-task execution timeout
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
}

const fn default_polling_interval_ms() -> u64 {
    5_000
}

const fn default_max_concurrent_tasks() -> usize {
    1
}

const fn default_task_timeout_ms() -> u64 {
    60_000
}

impl AgentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            capabilities: Vec::new(),
            polling_interval_ms: default_polling_interval_ms(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            task_timeout_ms: default_task_timeout_ms(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_capability(mut self, tag: impl Into<String>) -> Self {
        self.capabilities.push(tag.into());
        self
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub const fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub const fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// Check the configuration on its own; cross-checks against engine
    /// settings happen in the controller at `start()`.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::InvalidConfiguration(
                "agent name cannot be empty".to_string(),
            ));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(DomainError::InvalidConfiguration(format!(
                "agent '{}': max_concurrent_tasks must be at least 1",
                self.name
            )));
        }
        if self.polling_interval_ms == 0 {
            return Err(DomainError::InvalidConfiguration(format!(
                "agent '{}': polling_interval_ms must be positive",
                self.name
            )));
        }
        if self.task_timeout_ms == 0 {
            return Err(DomainError::InvalidConfiguration(format!(
                "agent '{}': task_timeout_ms must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

/// Agent as stored on the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub config: AgentConfig,
    pub active: bool,
    pub registered_at: DateTime<Utc>,
}

/// Read model for `listAgents`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: AgentId,
    pub name: String,
    pub description: String,
    pub capabilities: Vec<String>,
    pub state: AgentState,
    pub max_concurrent_tasks: usize,
    pub in_flight_tasks: usize,
    pub provider: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_state_display() {
        assert_eq!(AgentState::Idle.to_string(), "idle");
        assert_eq!(AgentState::Running.to_string(), "running");
        assert_eq!(AgentState::Stopped.to_string(), "stopped");
        assert_eq!(AgentState::Error.to_string(), "error");
    }

    #[test]
    fn test_agent_state_from_str() {
        assert_eq!("RUNNING".parse::<AgentState>().unwrap(), AgentState::Running);
        assert_eq!("stopped".parse::<AgentState>().unwrap(), AgentState::Stopped);
        assert!("paused".parse::<AgentState>().is_err());
    }

    #[test]
    fn test_can_start() {
        assert!(AgentState::Idle.can_start());
        assert!(AgentState::Stopped.can_start());
        assert!(AgentState::Error.can_start());
        assert!(!AgentState::Running.can_start());
    }

    #[test]
    fn test_config_builder_and_validate() {
        let config = AgentConfig::new("summarizer")
            .with_description("summarizes documents")
            .with_capability("text")
            .with_polling_interval(Duration::from_millis(250))
            .with_max_concurrent_tasks(4)
            .with_task_timeout(Duration::from_secs(2));

        assert_eq!(config.polling_interval(), Duration::from_millis(250));
        assert_eq!(config.task_timeout(), Duration::from_secs(2));
        assert_eq!(config.capabilities, vec!["text".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = AgentConfig::new("a").with_max_concurrent_tasks(0);
        assert!(matches!(
            config.validate(),
            Err(DomainError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_blank_name() {
        assert!(AgentConfig::new("  ").validate().is_err());
    }

    #[test]
    fn test_config_yaml_defaults() {
        let config: AgentConfig = serde_yaml::from_str("name: worker").unwrap();
        assert_eq!(config.polling_interval_ms, 5_000);
        assert_eq!(config.max_concurrent_tasks, 1);
        assert!(config.capabilities.is_empty());
    }
}
