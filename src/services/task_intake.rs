//! Task intake - merges ledger push notifications and periodic polling into one
//! stream of task ids for the executor.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dedup_store::DedupStore;
use super::ledger_health::LedgerHealth;
use super::retry::RetryPolicy;
use crate::domain::models::{AgentId, TaskId};
use crate::domain::ports::{LedgerGateway, TaskSubscription};

/// Where a task signal came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalSource {
    Push,
    Poll,
}

impl SignalSource {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Poll => "poll",
        }
    }
}

/// Intake loop for a single running agent.
pub struct TaskIntake {
    agent_id: AgentId,
    ledger: Arc<dyn LedgerGateway>,
    dedup: Arc<DedupStore>,
    retry: RetryPolicy,
    health: Arc<LedgerHealth>,
    poll_interval: Duration,
    dispatch_tx: mpsc::Sender<TaskId>,
}

impl TaskIntake {
    pub fn new(
        agent_id: AgentId,
        ledger: Arc<dyn LedgerGateway>,
        dedup: Arc<DedupStore>,
        retry: RetryPolicy,
        health: Arc<LedgerHealth>,
        poll_interval: Duration,
        dispatch_tx: mpsc::Sender<TaskId>,
    ) -> Self {
        Self {
            agent_id,
            ledger,
            dedup,
            retry,
            health,
            poll_interval,
            dispatch_tx,
        }
    }

    /// Run the loop until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(self, cancel: CancellationToken) {
        info!(agent_id = %self.agent_id, poll_interval_ms = self.poll_interval.as_millis() as u64, "Task intake started");

        // Subscription is (re)established on poll ticks; the first tick fires
        // immediately so the initial subscribe precedes the initial poll.
        let mut subscription: Option<TaskSubscription> = None;
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                signal = next_push(&mut subscription) => match signal {
                    Some(task_id) => {
                        if !self.offer(task_id, SignalSource::Push, &cancel).await {
                            break;
                        }
                    }
                    None => {
                        warn!(agent_id = %self.agent_id, "Task subscription closed, falling back to polling");
                        subscription = None;
                    }
                },

                _ = ticker.tick() => {
                    let evicted = self.dedup.evict_expired().await;
                    if evicted > 0 {
                        debug!(agent_id = %self.agent_id, evicted, "Evicted expired dedup entries");
                    }
                    if subscription.is_none() {
                        subscription = self.try_subscribe().await;
                    }
                    if !self.poll_once(&cancel).await {
                        break;
                    }
                }
            }
        }

        info!(agent_id = %self.agent_id, "Task intake stopped");
    }

    async fn try_subscribe(&self) -> Option<TaskSubscription> {
        match self.ledger.subscribe_task_created(self.agent_id).await {
            Ok(subscription) => {
                debug!(agent_id = %self.agent_id, "Subscribed to task creation events");
                Some(subscription)
            }
            Err(e) => {
                warn!(agent_id = %self.agent_id, error = %e, "Task subscription failed, polling only");
                None
            }
        }
    }

    /// One poll of the ledger's pending list. Returns `false` once the
    /// dispatch side is gone.
    async fn poll_once(&self, cancel: &CancellationToken) -> bool {
        let ledger = &self.ledger;
        let agent_id = self.agent_id;
        let result = self
            .retry
            .execute("list_pending_tasks", || ledger.list_pending_tasks(agent_id))
            .await;
        self.health.observe(&result, "list_pending_tasks");

        match result {
            Ok(pending) => {
                for task_id in pending {
                    if !self.offer(task_id, SignalSource::Poll, cancel).await {
                        return false;
                    }
                }
                true
            }
            Err(e) => {
                warn!(agent_id = %self.agent_id, error = %e, "Polling pending tasks failed");
                true
            }
        }
    }

    /// Forward `task_id` to the executor unless it was seen recently.
    /// Returns `false` once the dispatch side is gone.
    async fn offer(&self, task_id: TaskId, source: SignalSource, cancel: &CancellationToken) -> bool {
        if !self.dedup.try_claim(task_id).await {
            debug!(agent_id = %self.agent_id, %task_id, source = source.as_str(), "Duplicate task signal dropped");
            return true;
        }

        debug!(agent_id = %self.agent_id, %task_id, source = source.as_str(), "Task queued");
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            res = self.dispatch_tx.send(task_id) => res.is_ok(),
        };
        if !sent {
            self.dedup.forget(&task_id).await;
        }
        sent
    }
}

async fn next_push(subscription: &mut Option<TaskSubscription>) -> Option<TaskId> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryLedger;
    use crate::domain::models::AgentConfig;
    use serde_json::json;

    async fn setup(
        poll: Duration,
    ) -> (
        Arc<InMemoryLedger>,
        AgentId,
        Arc<DedupStore>,
        mpsc::Receiver<TaskId>,
        CancellationToken,
        JoinHandle<()>,
    ) {
        let ledger = Arc::new(InMemoryLedger::new());
        let agent_id = ledger.register_agent(&AgentConfig::new("intake")).await.unwrap();
        let dedup = Arc::new(DedupStore::new(Duration::from_secs(600)));
        let (tx, rx) = mpsc::channel(64);
        let intake = TaskIntake::new(
            agent_id,
            ledger.clone(),
            dedup.clone(),
            RetryPolicy::none(),
            Arc::new(LedgerHealth::new(5)),
            poll,
            tx,
        );
        let cancel = CancellationToken::new();
        let handle = intake.spawn(cancel.clone());
        (ledger, agent_id, dedup, rx, cancel, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_and_poll_deliver_task_once() {
        let (ledger, agent_id, _dedup, mut rx, cancel, handle) =
            setup(Duration::from_millis(100)).await;

        // Let the first tick subscribe before the task is created.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let task_id = ledger.submit_task(agent_id, json!({"n": 1})).await;

        assert_eq!(rx.recv().await, Some(task_id));

        // Several poll ticks see the same pending task again.
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_continues_without_subscription() {
        let (ledger, agent_id, _dedup, mut rx, cancel, handle) =
            setup(Duration::from_millis(50)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        ledger.close_subscriptions(agent_id);
        ledger.set_subscriptions_enabled(false);
        let task_id = ledger.submit_task(agent_id, json!({})).await;

        assert_eq!(rx.recv().await, Some(task_id));
        assert_eq!(ledger.active_subscriptions(agent_id), 0);

        ledger.set_subscriptions_enabled(true);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(ledger.active_subscriptions(agent_id), 1);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(ledger.active_subscriptions(agent_id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_entry_is_forgotten_when_dispatch_closed() {
        let (ledger, agent_id, dedup, rx, _cancel, handle) =
            setup(Duration::from_millis(50)).await;
        drop(rx);
        let task_id = ledger.submit_task(agent_id, json!({})).await;

        handle.await.unwrap();
        assert!(!dedup.contains(&task_id).await);
    }
}
