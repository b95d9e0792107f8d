//! In-memory ledger.
//!
//! Serves the demo binary and the test suites. Claims are atomic under a
//! single lock, mirroring the guarantee a real ledger gives. Test hooks allow
//! injecting transient failures and inspecting subscriptions and claim calls.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::models::{
    AgentConfig, AgentId, AgentRecord, RawCounters, Task, TaskId, TaskStatus,
};
use crate::domain::ports::{LedgerError, LedgerGateway, LedgerResult, TaskSubscription};

const SUBSCRIPTION_BUFFER: usize = 256;

#[derive(Default)]
struct LedgerState {
    agents: HashMap<AgentId, AgentRecord>,
    tasks: HashMap<TaskId, Task>,
    /// Creation order, for stable pending listings
    task_order: Vec<TaskId>,
    counters: HashMap<AgentId, RawCounters>,
    subscribers: HashMap<AgentId, Vec<mpsc::Sender<TaskId>>>,
    start_calls: HashMap<TaskId, usize>,
    subscriptions_disabled: bool,
    fail_next: u32,
    unavailable: bool,
}

/// Ledger held entirely in process memory.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Lock the state, failing if a fault is injected.
    fn guarded(&self) -> LedgerResult<MutexGuard<'_, LedgerState>> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(LedgerError::Transient("ledger unavailable".to_string()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(LedgerError::Transient("injected failure".to_string()));
        }
        Ok(state)
    }

    /// Create a pending task and announce it to live subscribers.
    pub async fn submit_task(&self, agent_id: AgentId, payload: serde_json::Value) -> TaskId {
        let task = Task::new(agent_id, payload);
        let task_id = task.id;
        let mut state = self.lock();
        state.tasks.insert(task_id, task);
        state.task_order.push(task_id);
        if let Some(senders) = state.subscribers.get_mut(&agent_id) {
            senders.retain(|tx| !tx.is_closed());
            for tx in senders.iter() {
                let _ = tx.try_send(task_id);
            }
        }
        task_id
    }

    /// Snapshot of a task, bypassing fault injection.
    pub fn task(&self, task_id: TaskId) -> Option<Task> {
        self.lock().tasks.get(&task_id).cloned()
    }

    pub fn agent(&self, agent_id: AgentId) -> Option<AgentRecord> {
        self.lock().agents.get(&agent_id).cloned()
    }

    /// How many times `start_task` was called for this task.
    pub fn start_task_calls(&self, task_id: TaskId) -> usize {
        self.lock().start_calls.get(&task_id).copied().unwrap_or(0)
    }

    /// Subscriptions whose receiving side is still alive.
    pub fn active_subscriptions(&self, agent_id: AgentId) -> usize {
        self.lock()
            .subscribers
            .get(&agent_id)
            .map_or(0, |senders| senders.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Drop every subscription for an agent, as a ledger disconnect would.
    pub fn close_subscriptions(&self, agent_id: AgentId) {
        self.lock().subscribers.remove(&agent_id);
    }

    pub fn set_subscriptions_enabled(&self, enabled: bool) {
        self.lock().subscriptions_disabled = !enabled;
    }

    /// Fail the next `n` gateway calls with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// Fail every gateway call until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn set_counters(&self, agent_id: AgentId, counters: RawCounters) {
        self.lock().counters.insert(agent_id, counters);
    }

    fn settle(
        state: &mut LedgerState,
        task_id: TaskId,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> LedgerResult<()> {
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| LedgerError::NotFound(format!("task {task_id}")))?;
        if !task.status.can_transition_to(status) {
            return Err(LedgerError::Rejected(format!(
                "task {task_id} cannot move from {} to {status}",
                task.status
            )));
        }
        task.status = status;
        task.completed_at = Some(Utc::now());
        task.result = result;
        task.error = error;
        Ok(())
    }
}

#[async_trait]
impl LedgerGateway for InMemoryLedger {
    async fn register_agent(&self, config: &AgentConfig) -> LedgerResult<AgentId> {
        let mut state = self.guarded()?;
        let id = Uuid::new_v4();
        state.agents.insert(
            id,
            AgentRecord {
                id,
                config: config.clone(),
                active: false,
                registered_at: Utc::now(),
            },
        );
        state.counters.insert(id, RawCounters::default());
        Ok(id)
    }

    async fn update_agent(&self, agent_id: AgentId, config: &AgentConfig) -> LedgerResult<()> {
        let mut state = self.guarded()?;
        let record = state
            .agents
            .get_mut(&agent_id)
            .ok_or_else(|| LedgerError::NotFound(format!("agent {agent_id}")))?;
        record.config = config.clone();
        Ok(())
    }

    async fn activate_agent(&self, agent_id: AgentId) -> LedgerResult<()> {
        let mut state = self.guarded()?;
        let record = state
            .agents
            .get_mut(&agent_id)
            .ok_or_else(|| LedgerError::NotFound(format!("agent {agent_id}")))?;
        record.active = true;
        Ok(())
    }

    async fn deactivate_agent(&self, agent_id: AgentId) -> LedgerResult<()> {
        let mut state = self.guarded()?;
        let record = state
            .agents
            .get_mut(&agent_id)
            .ok_or_else(|| LedgerError::NotFound(format!("agent {agent_id}")))?;
        record.active = false;
        Ok(())
    }

    async fn get_agent(&self, agent_id: AgentId) -> LedgerResult<AgentRecord> {
        self.guarded()?
            .agents
            .get(&agent_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("agent {agent_id}")))
    }

    async fn list_pending_tasks(&self, agent_id: AgentId) -> LedgerResult<Vec<TaskId>> {
        let state = self.guarded()?;
        Ok(state
            .task_order
            .iter()
            .filter(|id| {
                state
                    .tasks
                    .get(*id)
                    .is_some_and(|t| t.agent_id == agent_id && t.status == TaskStatus::Pending)
            })
            .copied()
            .collect())
    }

    async fn subscribe_task_created(&self, agent_id: AgentId) -> LedgerResult<TaskSubscription> {
        let mut state = self.guarded()?;
        if state.subscriptions_disabled {
            return Err(LedgerError::Transient(
                "subscriptions unavailable".to_string(),
            ));
        }
        if !state.agents.contains_key(&agent_id) {
            return Err(LedgerError::NotFound(format!("agent {agent_id}")));
        }
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let senders = state.subscribers.entry(agent_id).or_default();
        senders.retain(|tx| !tx.is_closed());
        senders.push(tx);
        Ok(TaskSubscription::new(rx))
    }

    async fn start_task(&self, task_id: TaskId) -> LedgerResult<Task> {
        let mut state = self.guarded()?;
        *state.start_calls.entry(task_id).or_insert(0) += 1;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| LedgerError::NotFound(format!("task {task_id}")))?;
        if task.status != TaskStatus::Pending {
            return Err(LedgerError::ClaimLost(task_id));
        }
        task.status = TaskStatus::InProgress;
        task.started_at = Some(Utc::now());
        Ok(task.clone())
    }

    async fn get_task(&self, task_id: TaskId) -> LedgerResult<Task> {
        self.guarded()?
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("task {task_id}")))
    }

    async fn complete_task(&self, task_id: TaskId, result: serde_json::Value) -> LedgerResult<()> {
        let mut state = self.guarded()?;
        Self::settle(&mut state, task_id, TaskStatus::Completed, Some(result), None)
    }

    async fn fail_task(&self, task_id: TaskId, error: String) -> LedgerResult<()> {
        let mut state = self.guarded()?;
        Self::settle(&mut state, task_id, TaskStatus::Failed, None, Some(error))
    }

    async fn record_execution(
        &self,
        agent_id: AgentId,
        success: bool,
        elapsed_ms: u64,
    ) -> LedgerResult<()> {
        let mut state = self.guarded()?;
        let counters = state.counters.entry(agent_id).or_default();
        let previous_total = counters.total_executions as f64;
        counters.average_execution_time_ms = (counters.average_execution_time_ms * previous_total
            + elapsed_ms as f64)
            / (previous_total + 1.0);
        counters.total_executions += 1;
        if success {
            counters.successful_executions += 1;
        } else {
            counters.failed_executions += 1;
        }
        Ok(())
    }

    async fn get_agent_metrics(&self, agent_id: AgentId) -> LedgerResult<RawCounters> {
        let state = self.guarded()?;
        if !state.agents.contains_key(&agent_id) {
            return Err(LedgerError::NotFound(format!("agent {agent_id}")));
        }
        Ok(state.counters.get(&agent_id).copied().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_start_task_is_claimed_once() {
        let ledger = InMemoryLedger::new();
        let agent = ledger.register_agent(&AgentConfig::new("a")).await.unwrap();
        let task_id = ledger.submit_task(agent, json!({"x": 1})).await;

        let task = ledger.start_task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(
            ledger.start_task(task_id).await.unwrap_err(),
            LedgerError::ClaimLost(task_id)
        );
        assert_eq!(ledger.start_task_calls(task_id), 2);
        assert!(ledger.list_pending_tasks(agent).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_tasks_cannot_be_resettled() {
        let ledger = InMemoryLedger::new();
        let agent = ledger.register_agent(&AgentConfig::new("a")).await.unwrap();
        let task_id = ledger.submit_task(agent, json!(null)).await;
        ledger.start_task(task_id).await.unwrap();
        ledger.complete_task(task_id, json!("done")).await.unwrap();

        let err = ledger.fail_task(task_id, "late".into()).await.unwrap_err();
        assert!(matches!(err, LedgerError::Rejected(_)));
        assert_eq!(ledger.task(task_id).unwrap().result, Some(json!("done")));
    }

    #[tokio::test]
    async fn test_record_execution_running_average() {
        let ledger = InMemoryLedger::new();
        let agent = ledger.register_agent(&AgentConfig::new("a")).await.unwrap();
        ledger.record_execution(agent, true, 100).await.unwrap();
        ledger.record_execution(agent, false, 300).await.unwrap();

        let counters = ledger.get_agent_metrics(agent).await.unwrap();
        assert_eq!(counters.total_executions, 2);
        assert_eq!(counters.successful_executions, 1);
        assert_eq!(counters.failed_executions, 1);
        assert!((counters.average_execution_time_ms - 200.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_subscribers_receive_new_tasks() {
        let ledger = InMemoryLedger::new();
        let agent = ledger.register_agent(&AgentConfig::new("a")).await.unwrap();
        let mut sub = ledger.subscribe_task_created(agent).await.unwrap();
        assert_eq!(ledger.active_subscriptions(agent), 1);

        let task_id = ledger.submit_task(agent, json!({})).await;
        assert_eq!(sub.recv().await, Some(task_id));

        ledger.close_subscriptions(agent);
        assert_eq!(sub.recv().await, None);

        drop(sub);
        assert_eq!(ledger.active_subscriptions(agent), 0);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let ledger = InMemoryLedger::new();
        ledger.fail_next(1);
        let err = ledger.register_agent(&AgentConfig::new("a")).await.unwrap_err();
        assert!(err.is_transient());
        let agent = ledger.register_agent(&AgentConfig::new("a")).await.unwrap();

        ledger.set_unavailable(true);
        assert!(ledger.get_agent(agent).await.unwrap_err().is_transient());
        ledger.set_unavailable(false);
        assert!(!ledger.get_agent(agent).await.unwrap().active);
    }
}
