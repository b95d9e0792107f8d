//! Ledger gateway port - the narrow contract the engine needs from the
//! external transactional ledger.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::models::{AgentConfig, AgentId, AgentRecord, RawCounters, Task, TaskId};

/// Errors returned by a ledger gateway.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// Network failure, timeout or temporary unavailability
    #[error("Ledger temporarily unavailable: {0}")]
    Transient(String),

    /// Another claimant already advanced the task
    #[error("Task {0} already claimed")]
    ClaimLost(TaskId),

    #[error("Not found on ledger: {0}")]
    NotFound(String),

    /// The ledger refused the transition
    #[error("Rejected by ledger: {0}")]
    Rejected(String),
}

impl LedgerError {
    /// Whether retrying the same call may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Live "task created" subscription for one agent.
///
/// The stream ends when the ledger drops the subscription; callers treat that
/// as a disconnect.
pub struct TaskSubscription {
    receiver: mpsc::Receiver<TaskId>,
}

impl TaskSubscription {
    pub const fn new(receiver: mpsc::Receiver<TaskId>) -> Self {
        Self { receiver }
    }

    /// Next announced task, `None` once disconnected.
    pub async fn recv(&mut self) -> Option<TaskId> {
        self.receiver.recv().await
    }
}

impl std::fmt::Debug for TaskSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSubscription").finish_non_exhaustive()
    }
}

/// Gateway to the ledger holding agent and task records.
///
/// Implementations must make `start_task` atomic: of any number of concurrent
/// callers for the same pending task exactly one succeeds and the rest get
/// [`LedgerError::ClaimLost`].
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Create an agent record and return its ledger id.
    async fn register_agent(&self, config: &AgentConfig) -> LedgerResult<AgentId>;

    /// Replace the stored configuration of an agent.
    async fn update_agent(&self, agent_id: AgentId, config: &AgentConfig) -> LedgerResult<()>;

    async fn activate_agent(&self, agent_id: AgentId) -> LedgerResult<()>;

    async fn deactivate_agent(&self, agent_id: AgentId) -> LedgerResult<()>;

    async fn get_agent(&self, agent_id: AgentId) -> LedgerResult<AgentRecord>;

    /// Ids of tasks for this agent still waiting to be claimed.
    async fn list_pending_tasks(&self, agent_id: AgentId) -> LedgerResult<Vec<TaskId>>;

    /// Push notifications for tasks created for this agent.
    async fn subscribe_task_created(&self, agent_id: AgentId) -> LedgerResult<TaskSubscription>;

    /// Claim a pending task, moving it to `in_progress`.
    async fn start_task(&self, task_id: TaskId) -> LedgerResult<Task>;

    async fn get_task(&self, task_id: TaskId) -> LedgerResult<Task>;

    async fn complete_task(&self, task_id: TaskId, result: serde_json::Value) -> LedgerResult<()>;

    async fn fail_task(&self, task_id: TaskId, error: String) -> LedgerResult<()>;

    /// Fold one execution into the agent's counters.
    async fn record_execution(
        &self,
        agent_id: AgentId,
        success: bool,
        elapsed_ms: u64,
    ) -> LedgerResult<()>;

    async fn get_agent_metrics(&self, agent_id: AgentId) -> LedgerResult<RawCounters>;
}
