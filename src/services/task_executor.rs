//! Bounded worker pool executing tasks for one agent.
//!
//! A dispatcher reads task ids in FIFO order, waits for a semaphore permit and
//! spawns a worker. Each worker claims the task on the ledger, runs the
//! handler in its own tokio task (so panics stay contained), settles the
//! outcome and records the execution before releasing its permit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::dedup_store::DedupStore;
use super::event_bus::{EventBus, EventPayload};
use super::ledger_health::LedgerHealth;
use super::retry::RetryPolicy;
use crate::domain::models::{AgentId, TaskId};
use crate::domain::ports::{
    CapabilityProvider, ExecutionContext, LedgerError, LedgerGateway, MetadataStore, TaskHandler,
};

/// Collaborators shared by every worker of one pool.
pub struct ExecutorDeps {
    pub agent_id: AgentId,
    pub ledger: Arc<dyn LedgerGateway>,
    pub handler: Arc<dyn TaskHandler>,
    pub provider: Option<Arc<dyn CapabilityProvider>>,
    pub metadata: Arc<dyn MetadataStore>,
    pub dedup: Arc<DedupStore>,
    pub event_bus: Arc<EventBus>,
    pub retry: RetryPolicy,
    pub health: Arc<LedgerHealth>,
    pub task_timeout: Duration,
}

type WorkerMap = Arc<StdMutex<HashMap<TaskId, AbortHandle>>>;

/// Read-only handle on a pool's in-flight count, usable without the pool.
#[derive(Clone)]
pub struct InFlight(WorkerMap);

impl InFlight {
    pub fn count(&self) -> usize {
        self.0.lock().map(|w| w.len()).unwrap_or(0)
    }
}

/// Running pool for one agent.
pub struct TaskExecutorPool {
    agent_id: AgentId,
    max_concurrent: usize,
    semaphore: Arc<Semaphore>,
    workers: WorkerMap,
    cancel: CancellationToken,
    dispatcher: JoinHandle<()>,
    event_bus: Arc<EventBus>,
}

impl TaskExecutorPool {
    /// Start the dispatcher over `queue`. Cancelling `cancel` stops dispatch
    /// and signals in-flight handlers.
    pub fn spawn(
        deps: ExecutorDeps,
        max_concurrent: usize,
        queue: mpsc::Receiver<TaskId>,
        cancel: CancellationToken,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let workers: WorkerMap = Arc::new(StdMutex::new(HashMap::new()));
        let agent_id = deps.agent_id;
        let event_bus = deps.event_bus.clone();

        let dispatcher = tokio::spawn(dispatch_loop(
            Arc::new(deps),
            queue,
            semaphore.clone(),
            workers.clone(),
            cancel.clone(),
        ));

        Self {
            agent_id,
            max_concurrent,
            semaphore,
            workers,
            cancel,
            dispatcher,
            event_bus,
        }
    }

    /// Tasks currently held by a worker.
    pub fn in_flight(&self) -> usize {
        self.in_flight_gauge().count()
    }

    pub fn in_flight_gauge(&self) -> InFlight {
        InFlight(self.workers.clone())
    }

    /// Stop dispatching, cancel in-flight handlers and wait up to `grace` for
    /// workers to settle. Returns the ids of tasks abandoned in `in_progress`.
    pub async fn shutdown(self, grace: Duration) -> Vec<TaskId> {
        self.cancel.cancel();
        if let Err(e) = self.dispatcher.await {
            error!(agent_id = %self.agent_id, error = %e, "Task dispatcher terminated abnormally");
        }

        let permits = u32::try_from(self.max_concurrent).unwrap_or(u32::MAX);
        if timeout(grace, self.semaphore.acquire_many(permits)).await.is_ok() {
            debug!(agent_id = %self.agent_id, "Executor drained");
            return Vec::new();
        }

        let stragglers: Vec<(TaskId, AbortHandle)> = match self.workers.lock() {
            Ok(mut workers) => workers.drain().collect(),
            Err(poisoned) => poisoned.into_inner().drain().collect(),
        };

        let mut abandoned = Vec::with_capacity(stragglers.len());
        for (task_id, handle) in stragglers {
            handle.abort();
            warn!(
                agent_id = %self.agent_id,
                %task_id,
                grace_ms = grace.as_millis() as u64,
                "Task abandoned in progress after shutdown grace period"
            );
            self.event_bus.publish(EventPayload::TaskAbandoned {
                agent_id: self.agent_id,
                task_id,
            });
            abandoned.push(task_id);
        }
        abandoned
    }
}

async fn dispatch_loop(
    deps: Arc<ExecutorDeps>,
    mut queue: mpsc::Receiver<TaskId>,
    semaphore: Arc<Semaphore>,
    workers: WorkerMap,
    cancel: CancellationToken,
) {
    loop {
        let task_id = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = queue.recv() => match next {
                Some(task_id) => task_id,
                None => break,
            },
        };

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                deps.dedup.forget(&task_id).await;
                break;
            }
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        // Hold the map lock across spawn so the worker's own removal can
        // never run before its insertion.
        let Ok(mut map) = workers.lock() else {
            break;
        };
        let worker_deps = deps.clone();
        let worker_map = workers.clone();
        let worker_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            run_task(&worker_deps, task_id, &worker_cancel).await;
            if let Ok(mut map) = worker_map.lock() {
                map.remove(&task_id);
            }
            drop(permit);
        });
        map.insert(task_id, handle.abort_handle());
    }

    // Queued but never claimed: let a later start rediscover them.
    queue.close();
    let mut released = 0usize;
    while let Ok(task_id) = queue.try_recv() {
        deps.dedup.forget(&task_id).await;
        released += 1;
    }
    if released > 0 {
        debug!(agent_id = %deps.agent_id, released, "Released queued tasks");
    }
}

async fn run_task(deps: &ExecutorDeps, task_id: TaskId, cancel: &CancellationToken) {
    let agent_id = deps.agent_id;
    let ledger = &deps.ledger;

    let claim = deps
        .retry
        .execute("start_task", || ledger.start_task(task_id))
        .await;
    let task = match claim {
        Ok(task) => {
            deps.health.record_success();
            task
        }
        Err(LedgerError::ClaimLost(_)) => {
            deps.health.record_success();
            debug!(%agent_id, %task_id, "Task already claimed elsewhere");
            return;
        }
        Err(e) => {
            deps.health.record_failure("start_task");
            warn!(%agent_id, %task_id, error = %e, "Failed to claim task");
            deps.dedup.forget(&task_id).await;
            return;
        }
    };

    deps.event_bus
        .publish(EventPayload::TaskStarted { agent_id, task_id });

    let started = Instant::now();
    let outcome = invoke_handler(deps, task_id, task.payload, cancel).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let success = outcome.is_ok();

    match outcome {
        Ok(result) => {
            let settled = deps
                .retry
                .execute("complete_task", || ledger.complete_task(task_id, result.clone()))
                .await;
            deps.health.observe(&settled, "complete_task");
            match settled {
                Ok(()) => {
                    info!(%agent_id, %task_id, elapsed_ms, "Task completed");
                    deps.event_bus.publish(EventPayload::TaskCompleted {
                        agent_id,
                        task_id,
                        elapsed_ms,
                    });
                }
                Err(e) => error!(%agent_id, %task_id, error = %e, "Failed to settle completed task"),
            }
        }
        Err(message) => {
            let settled = deps
                .retry
                .execute("fail_task", || ledger.fail_task(task_id, message.clone()))
                .await;
            deps.health.observe(&settled, "fail_task");
            match settled {
                Ok(()) => {
                    warn!(%agent_id, %task_id, elapsed_ms, error = %message, "Task failed");
                    deps.event_bus.publish(EventPayload::TaskFailed {
                        agent_id,
                        task_id,
                        error: message,
                        elapsed_ms,
                    });
                }
                Err(e) => error!(%agent_id, %task_id, error = %e, "Failed to settle failed task"),
            }
        }
    }

    let recorded = deps
        .retry
        .execute("record_execution", || {
            ledger.record_execution(agent_id, success, elapsed_ms)
        })
        .await;
    deps.health.observe(&recorded, "record_execution");
    if let Err(e) = recorded {
        error!(%agent_id, %task_id, error = %e, "Failed to record execution");
    }
}

/// Run the handler in its own task under the agent's timeout.
async fn invoke_handler(
    deps: &ExecutorDeps,
    task_id: TaskId,
    payload: serde_json::Value,
    cancel: &CancellationToken,
) -> Result<serde_json::Value, String> {
    let span = info_span!("task", agent_id = %deps.agent_id, %task_id);
    let token = cancel.child_token();
    let ctx = ExecutionContext {
        agent_id: deps.agent_id,
        task_id,
        provider: deps.provider.clone(),
        metadata: deps.metadata.clone(),
        cancellation: token.clone(),
        span: span.clone(),
    };

    let handler = deps.handler.clone();
    let mut handle = tokio::spawn(async move { handler.handle(payload, ctx).await }.instrument(span));
    // Aborted with the worker if the pool gives up on it.
    let _guard = AbortOnDrop(handle.abort_handle());

    match timeout(deps.task_timeout, &mut handle).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(e))) => Err(format!("{e:#}")),
        Ok(Err(join_err)) => Err(describe_join_error(join_err)),
        Err(_) => {
            token.cancel();
            handle.abort();
            Err(format!(
                "execution timed out after {}ms",
                deps.task_timeout.as_millis()
            ))
        }
    }
}

fn describe_join_error(err: JoinError) -> String {
    if err.is_panic() {
        let panic = err.into_panic();
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        format!("execution panicked: {message}")
    } else {
        "execution aborted".to_string()
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryLedger, InMemoryMetadataStore};
    use crate::domain::models::{AgentConfig, TaskStatus};
    use crate::domain::ports::handler_fn;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        ledger: Arc<InMemoryLedger>,
        agent_id: AgentId,
        dedup: Arc<DedupStore>,
        bus: Arc<EventBus>,
    }

    async fn harness() -> Harness {
        let ledger = Arc::new(InMemoryLedger::new());
        let agent_id = ledger
            .register_agent(&AgentConfig::new("executor"))
            .await
            .unwrap();
        Harness {
            ledger,
            agent_id,
            dedup: Arc::new(DedupStore::new(Duration::from_secs(600))),
            bus: Arc::new(EventBus::new(64)),
        }
    }

    fn deps(h: &Harness, handler: Arc<dyn TaskHandler>, task_timeout: Duration) -> ExecutorDeps {
        ExecutorDeps {
            agent_id: h.agent_id,
            ledger: h.ledger.clone(),
            handler,
            provider: None,
            metadata: Arc::new(InMemoryMetadataStore::new()),
            dedup: h.dedup.clone(),
            event_bus: h.bus.clone(),
            retry: RetryPolicy::none(),
            health: Arc::new(LedgerHealth::new(10)),
            task_timeout,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_outcomes_are_settled() {
        let h = harness().await;
        let handler = handler_fn(|payload: Value, _ctx| async move {
            match payload["mode"].as_str() {
                Some("ok") => Ok::<_, anyhow::Error>(json!({"echo": payload})),
                Some("err") => Err(anyhow::anyhow!("bad input")),
                _ => panic!("handler exploded"),
            }
        });
        let (tx, rx) = mpsc::channel(8);
        let pool = TaskExecutorPool::spawn(
            deps(&h, handler, Duration::from_secs(5)),
            3,
            rx,
            CancellationToken::new(),
        );

        let ok = h.ledger.submit_task(h.agent_id, json!({"mode": "ok"})).await;
        let err = h.ledger.submit_task(h.agent_id, json!({"mode": "err"})).await;
        let boom = h.ledger.submit_task(h.agent_id, json!({"mode": "panic"})).await;
        for id in [ok, err, boom] {
            tx.send(id).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.ledger.task(ok).unwrap().status, TaskStatus::Completed);
        let failed = h.ledger.task(err).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("bad input"));
        let panicked = h.ledger.task(boom).unwrap();
        assert_eq!(panicked.status, TaskStatus::Failed);
        assert!(panicked.error.unwrap().contains("handler exploded"));

        let counters = h.ledger.get_agent_metrics(h.agent_id).await.unwrap();
        assert_eq!(counters.total_executions, 3);
        assert_eq!(counters.successful_executions, 1);

        assert!(pool.shutdown(Duration::from_secs(1)).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let h = harness().await;
        let handler = handler_fn(|_payload, _ctx| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, anyhow::Error>(Value::Null)
        });
        let (tx, rx) = mpsc::channel(8);
        let pool = TaskExecutorPool::spawn(
            deps(&h, handler, Duration::from_millis(100)),
            1,
            rx,
            CancellationToken::new(),
        );
        let mut events = h.bus.subscribe();

        let id = h.ledger.submit_task(h.agent_id, json!({})).await;
        tx.send(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let task = h.ledger.task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("timed out"));

        assert_eq!(events.recv().await.unwrap().kind(), "task:started");
        assert_eq!(events.recv().await.unwrap().kind(), "task:failed");

        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_lost_is_dropped_silently() {
        let h = harness().await;
        let invocations = Arc::new(AtomicUsize::new(0));
        let counter = invocations.clone();
        let handler = handler_fn(move |_payload, _ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(Value::Null)
            }
        });
        let (tx, rx) = mpsc::channel(8);
        let pool = TaskExecutorPool::spawn(
            deps(&h, handler, Duration::from_secs(1)),
            1,
            rx,
            CancellationToken::new(),
        );

        let id = h.ledger.submit_task(h.agent_id, json!({})).await;
        h.ledger.start_task(id).await.unwrap();
        tx.send(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(invocations.load(Ordering::SeqCst), 0);
        assert_eq!(h.ledger.task(id).unwrap().status, TaskStatus::InProgress);
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_stuck_tasks_and_releases_queue() {
        let h = harness().await;
        // Ignores cancellation on purpose.
        let handler = handler_fn(|_payload, _ctx| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, anyhow::Error>(Value::Null)
        });
        let (tx, rx) = mpsc::channel(8);
        let pool = TaskExecutorPool::spawn(
            deps(&h, handler, Duration::from_secs(7200)),
            1,
            rx,
            CancellationToken::new(),
        );
        let mut events = h.bus.subscribe();

        let stuck = h.ledger.submit_task(h.agent_id, json!({})).await;
        let queued = h.ledger.submit_task(h.agent_id, json!({})).await;
        assert!(h.dedup.try_claim(stuck).await);
        assert!(h.dedup.try_claim(queued).await);
        tx.send(stuck).await.unwrap();
        tx.send(queued).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.in_flight(), 1);

        let abandoned = pool.shutdown(Duration::from_millis(500)).await;
        assert_eq!(abandoned, vec![stuck]);
        assert_eq!(h.ledger.task(stuck).unwrap().status, TaskStatus::InProgress);
        assert_eq!(h.ledger.task(queued).unwrap().status, TaskStatus::Pending);
        assert!(!h.dedup.contains(&queued).await);

        assert_eq!(events.recv().await.unwrap().kind(), "task:started");
        assert_eq!(events.recv().await.unwrap().kind(), "task:abandoned");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooperative_handler_settles_within_grace() {
        let h = harness().await;
        let handler = handler_fn(|_payload, ctx: ExecutionContext| async move {
            ctx.cancellation.cancelled().await;
            Err::<Value, _>(anyhow::anyhow!("cancelled"))
        });
        let (tx, rx) = mpsc::channel(8);
        let pool = TaskExecutorPool::spawn(
            deps(&h, handler, Duration::from_secs(60)),
            2,
            rx,
            CancellationToken::new(),
        );
        let id = h.ledger.submit_task(h.agent_id, json!({})).await;
        tx.send(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let abandoned = pool.shutdown(Duration::from_secs(1)).await;
        assert!(abandoned.is_empty());
        let task = h.ledger.task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("cancelled"));
    }
}
