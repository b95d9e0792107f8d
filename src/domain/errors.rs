//! Domain errors for the dispatch engine.

use thiserror::Error;
use uuid::Uuid;

use crate::domain::ports::LedgerError;

/// Domain-level errors surfaced to callers of the engine.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Agent already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Agent '{0}' is not registered on the ledger")]
    NotRegistered(String),

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition { from: String, to: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Agent '{0}' has no task handler attached")]
    MissingTaskHandler(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(Uuid),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl DomainError {
    /// Errors that indicate a caller bug rather than an environmental failure.
    pub const fn is_state_violation(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRegistered(_) | Self::NotRegistered(_) | Self::InvalidStateTransition { .. }
        )
    }

    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::InvalidConfiguration(_) | Self::MissingTaskHandler(_))
    }
}
