//! Agent lifecycle controller.
//!
//! ```text
//!            register()         start()
//!   (idle) ────────────► (idle, registered) ──────► running
//!                                                   │  ▲
//!                                 stop()            │  │ start()
//!                        ┌──────────────────────────┘  │
//!                        ▼                             │
//!                     stopped ─────────────────────────┘
//!
//!   running ──(ledger failure threshold)──► error ──start()──► running
//! ```
//!
//! Public transitions hold the controller lock for their whole duration, so
//! `restart()` and `update()` are never observed halfway. Read paths never
//! take that lock: they see the last published `Profile` and state.

use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::models::{AgentConfig, AgentId, AgentState, AgentSummary, ExecutorConfig};
use crate::domain::ports::{CapabilityProvider, LedgerGateway, MetadataStore, TaskHandler};
use crate::domain::{DomainError, DomainResult};
use crate::services::{
    DedupStore, EventBus, EventPayload, ExecutorDeps, InFlight, LedgerHealth, RetryPolicy,
    TaskExecutorPool, TaskIntake,
};

/// Engine-wide collaborators every controller uses.
#[derive(Clone)]
pub struct ControllerDeps {
    pub ledger: Arc<dyn LedgerGateway>,
    pub event_bus: Arc<EventBus>,
    pub metadata: Arc<dyn MetadataStore>,
    pub retry: RetryPolicy,
    pub dedup_ttl: Duration,
    pub executor: ExecutorConfig,
}

/// Loops and pool owned by one running period of an agent.
struct RunningAgent {
    cancel: CancellationToken,
    intake: JoinHandle<()>,
    pool: TaskExecutorPool,
    supervisor: Option<JoinHandle<()>>,
}

impl RunningAgent {
    /// Close intake, then drain the pool. Returns abandoned task count.
    async fn shutdown(mut self, agent_id: AgentId, grace: Duration) -> usize {
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
        self.cancel.cancel();
        if let Err(e) = self.intake.await {
            error!(%agent_id, error = %e, "Task intake terminated abnormally");
        }
        self.pool.shutdown(grace).await.len()
    }
}

struct ControllerInner {
    state: AgentState,
    agent_id: Option<AgentId>,
    config: AgentConfig,
    runtime: Option<RunningAgent>,
    /// Bumped on every start so stale supervisors can tell they are stale
    generation: u64,
}

/// Published copy of identity and configuration, updated as transitions commit.
#[derive(Clone)]
struct Profile {
    agent_id: Option<AgentId>,
    config: AgentConfig,
    in_flight: Option<InFlight>,
}

pub struct AgentController {
    deps: ControllerDeps,
    handler: Option<Arc<dyn TaskHandler>>,
    provider: Option<Arc<dyn CapabilityProvider>>,
    dedup: Arc<DedupStore>,
    inner: Mutex<ControllerInner>,
    profile: RwLock<Profile>,
    state_tx: watch::Sender<AgentState>,
}

impl fmt::Debug for AgentController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let profile = self.profile();
        f.debug_struct("AgentController")
            .field("agent_id", &profile.agent_id)
            .field("name", &profile.config.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl AgentController {
    pub fn new(config: AgentConfig, deps: ControllerDeps) -> Self {
        let (state_tx, _) = watch::channel(AgentState::Idle);
        Self {
            dedup: Arc::new(DedupStore::new(deps.dedup_ttl)),
            deps,
            handler: None,
            provider: None,
            profile: RwLock::new(Profile {
                agent_id: None,
                config: config.clone(),
                in_flight: None,
            }),
            inner: Mutex::new(ControllerInner {
                state: AgentState::Idle,
                agent_id: None,
                config,
                runtime: None,
                generation: 0,
            }),
            state_tx,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn CapabilityProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Last published lifecycle state.
    pub fn state(&self) -> AgentState {
        *self.state_tx.borrow()
    }

    /// Watch published lifecycle states.
    pub fn subscribe_state(&self) -> watch::Receiver<AgentState> {
        self.state_tx.subscribe()
    }

    fn profile(&self) -> RwLockReadGuard<'_, Profile> {
        self.profile
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn profile_mut(&self) -> RwLockWriteGuard<'_, Profile> {
        self.profile
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn agent_id(&self) -> Option<AgentId> {
        self.profile().agent_id
    }

    pub fn config(&self) -> AgentConfig {
        self.profile().config.clone()
    }

    pub fn dedup_store(&self) -> &Arc<DedupStore> {
        &self.dedup
    }

    /// Snapshot for listings. Does not wait on in-progress transitions.
    pub fn summary(&self) -> Option<AgentSummary> {
        let profile = self.profile();
        let id = profile.agent_id?;
        Some(AgentSummary {
            id,
            name: profile.config.name.clone(),
            description: profile.config.description.clone(),
            capabilities: profile.config.capabilities.clone(),
            state: self.state(),
            max_concurrent_tasks: profile.config.max_concurrent_tasks,
            in_flight_tasks: profile.in_flight.as_ref().map_or(0, InFlight::count),
            provider: self.provider.as_ref().map(|p| p.name().to_string()),
        })
    }

    /// Create the agent record on the ledger.
    pub async fn register(&self) -> DomainResult<AgentId> {
        let mut inner = self.inner.lock().await;
        if inner.agent_id.is_some() || inner.state != AgentState::Idle {
            return Err(DomainError::AlreadyRegistered(inner.config.name.clone()));
        }
        inner.config.validate()?;

        let ledger = &self.deps.ledger;
        let config = inner.config.clone();
        let agent_id = self
            .deps
            .retry
            .execute("register_agent", || ledger.register_agent(&config))
            .await?;

        inner.agent_id = Some(agent_id);
        self.profile_mut().agent_id = Some(agent_id);
        info!(%agent_id, name = %config.name, "Agent registered");
        self.deps.event_bus.publish(EventPayload::AgentRegistered {
            agent_id,
            name: config.name,
        });
        Ok(agent_id)
    }

    /// idle/stopped/error -> running. No-op when already running.
    pub async fn start(self: &Arc<Self>) -> DomainResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == AgentState::Running {
            debug!(agent_id = ?inner.agent_id, "Start ignored, agent already running");
            return Ok(());
        }
        let agent_id = self.start_locked(&mut inner).await?;
        drop(inner);

        self.state_tx.send_replace(AgentState::Running);
        self.deps
            .event_bus
            .publish(EventPayload::AgentStarted { agent_id });
        Ok(())
    }

    /// running/error -> stopped. No-op when already stopped.
    pub async fn stop(&self) -> DomainResult<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            AgentState::Stopped => return Ok(()),
            AgentState::Idle => {
                return Err(DomainError::InvalidStateTransition {
                    from: AgentState::Idle.to_string(),
                    to: AgentState::Stopped.to_string(),
                    reason: "agent was never started".to_string(),
                })
            }
            AgentState::Running | AgentState::Error => {}
        }
        let agent_id = self.stop_locked(&mut inner).await;
        drop(inner);

        self.state_tx.send_replace(AgentState::Stopped);
        if let Some(agent_id) = agent_id {
            self.deps
                .event_bus
                .publish(EventPayload::AgentStopped { agent_id });
        }
        Ok(())
    }

    /// Stop then start without publishing `stopped`, unless the start half
    /// fails and the agent is left stopped.
    pub async fn restart(self: &Arc<Self>) -> DomainResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == AgentState::Idle {
            return Err(DomainError::InvalidStateTransition {
                from: AgentState::Idle.to_string(),
                to: AgentState::Running.to_string(),
                reason: "restart requires a started agent".to_string(),
            });
        }
        let previous = inner.state;
        let result = self.restart_locked(&mut inner).await;
        let state = inner.state;
        let registered = inner.agent_id;
        drop(inner);

        self.state_tx.send_replace(state);
        let agent_id = match result {
            Ok(agent_id) => agent_id,
            Err(e) => {
                self.publish_left_stopped(registered, previous, state, &e);
                return Err(e);
            }
        };
        info!(%agent_id, "Agent restarted");
        self.deps
            .event_bus
            .publish(EventPayload::AgentStarted { agent_id });
        Ok(())
    }

    /// Validate and persist a new configuration, restarting if running.
    pub async fn update(self: &Arc<Self>, config: AgentConfig) -> DomainResult<()> {
        config.validate()?;
        let mut inner = self.inner.lock().await;

        if let Some(agent_id) = inner.agent_id {
            let ledger = &self.deps.ledger;
            self.deps
                .retry
                .execute("update_agent", || ledger.update_agent(agent_id, &config))
                .await?;
        }
        inner.config = config.clone();
        self.profile_mut().config = config;

        let previous = inner.state;
        let result = if previous == AgentState::Running {
            self.restart_locked(&mut inner).await.map(|_| ())
        } else {
            Ok(())
        };
        let state = inner.state;
        let agent_id = inner.agent_id;
        drop(inner);

        self.state_tx.send_replace(state);
        if let Err(e) = result {
            self.publish_left_stopped(agent_id, previous, state, &e);
            return Err(e);
        }
        if let Some(agent_id) = agent_id {
            info!(%agent_id, %state, "Agent configuration updated");
            self.deps
                .event_bus
                .publish(EventPayload::AgentUpdated { agent_id, state });
        }
        Ok(())
    }

    /// A restart whose start half failed still took the agent down.
    fn publish_left_stopped(
        &self,
        agent_id: Option<AgentId>,
        previous: AgentState,
        state: AgentState,
        cause: &DomainError,
    ) {
        let Some(agent_id) = agent_id else {
            return;
        };
        if previous == AgentState::Stopped || state != AgentState::Stopped {
            return;
        }
        warn!(%agent_id, error = %cause, "Restart failed, agent left stopped");
        self.deps
            .event_bus
            .publish(EventPayload::AgentStopped { agent_id });
    }

    async fn restart_locked(self: &Arc<Self>, inner: &mut ControllerInner) -> DomainResult<AgentId> {
        self.stop_locked(inner).await;
        self.start_locked(inner).await
    }

    /// Validate, activate on the ledger and spawn intake, pool and supervisor.
    async fn start_locked(self: &Arc<Self>, inner: &mut ControllerInner) -> DomainResult<AgentId> {
        let Some(agent_id) = inner.agent_id else {
            return Err(DomainError::NotRegistered(inner.config.name.clone()));
        };
        if !inner.state.can_start() {
            return Err(DomainError::InvalidStateTransition {
                from: inner.state.to_string(),
                to: AgentState::Running.to_string(),
                reason: "agent is not startable".to_string(),
            });
        }

        let config = inner.config.clone();
        config.validate()?;
        let handler = self
            .handler
            .clone()
            .ok_or_else(|| DomainError::MissingTaskHandler(config.name.clone()))?;
        if self.deps.dedup_ttl <= config.task_timeout() {
            return Err(DomainError::InvalidConfiguration(format!(
                "dedup ttl ({}ms) must exceed task timeout ({}ms) for agent '{}'",
                self.deps.dedup_ttl.as_millis(),
                config.task_timeout_ms,
                config.name
            )));
        }

        let ledger = &self.deps.ledger;
        self.deps
            .retry
            .execute("activate_agent", || ledger.activate_agent(agent_id))
            .await?;

        let cancel = CancellationToken::new();
        let health = Arc::new(LedgerHealth::new(
            self.deps.executor.max_consecutive_ledger_failures,
        ));
        let (dispatch_tx, dispatch_rx) = mpsc::channel(self.deps.executor.queue_capacity.max(1));

        let pool = TaskExecutorPool::spawn(
            ExecutorDeps {
                agent_id,
                ledger: self.deps.ledger.clone(),
                handler,
                provider: self.provider.clone(),
                metadata: self.deps.metadata.clone(),
                dedup: self.dedup.clone(),
                event_bus: self.deps.event_bus.clone(),
                retry: self.deps.retry.clone(),
                health: health.clone(),
                task_timeout: config.task_timeout(),
            },
            config.max_concurrent_tasks,
            dispatch_rx,
            cancel.child_token(),
        );

        let intake = TaskIntake::new(
            agent_id,
            self.deps.ledger.clone(),
            self.dedup.clone(),
            self.deps.retry.clone(),
            health.clone(),
            config.polling_interval(),
            dispatch_tx,
        )
        .spawn(cancel.child_token());

        inner.generation += 1;
        let supervisor = spawn_supervisor(
            Arc::downgrade(self),
            health,
            inner.generation,
            cancel.clone(),
        );

        self.profile_mut().in_flight = Some(pool.in_flight_gauge());
        inner.runtime = Some(RunningAgent {
            cancel,
            intake,
            pool,
            supervisor: Some(supervisor),
        });
        inner.state = AgentState::Running;
        info!(
            %agent_id,
            max_concurrent_tasks = config.max_concurrent_tasks,
            polling_interval_ms = config.polling_interval_ms,
            "Agent started"
        );
        Ok(agent_id)
    }

    /// Best effort; the agent goes down either way.
    async fn deactivate(&self, agent_id: AgentId) {
        let ledger = &self.deps.ledger;
        if let Err(e) = self
            .deps
            .retry
            .execute("deactivate_agent", || ledger.deactivate_agent(agent_id))
            .await
        {
            warn!(%agent_id, error = %e, "Failed to deactivate agent on ledger");
        }
    }

    /// Deactivate and tear down the running period, if any.
    async fn stop_locked(&self, inner: &mut ControllerInner) -> Option<AgentId> {
        let agent_id = inner.agent_id?;

        self.deactivate(agent_id).await;

        if let Some(runtime) = inner.runtime.take() {
            let abandoned = runtime
                .shutdown(agent_id, self.deps.executor.shutdown_grace())
                .await;
            if abandoned > 0 {
                warn!(%agent_id, abandoned, "Agent stopped with abandoned tasks");
            }
        }
        self.profile_mut().in_flight = None;
        inner.state = AgentState::Stopped;
        info!(%agent_id, "Agent stopped");
        Some(agent_id)
    }

    /// Move a running agent to `error` after repeated ledger failures.
    async fn fail(&self, generation: u64, reason: String) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation || inner.state != AgentState::Running {
            return;
        }
        let Some(agent_id) = inner.agent_id else {
            return;
        };

        if let Some(mut runtime) = inner.runtime.take() {
            // This runs on the supervisor itself; detach rather than abort.
            runtime.supervisor.take();
            runtime
                .shutdown(agent_id, self.deps.executor.shutdown_grace())
                .await;
        }
        self.profile_mut().in_flight = None;
        // Still under the lock, so a later start() activates after this.
        self.deactivate(agent_id).await;
        inner.state = AgentState::Error;
        drop(inner);

        error!(%agent_id, reason = %reason, "Agent moved to error state");
        self.state_tx.send_replace(AgentState::Error);
        self.deps.event_bus.publish(EventPayload::AgentError {
            agent_id,
            error: reason,
        });
    }
}

fn spawn_supervisor(
    controller: Weak<AgentController>,
    health: Arc<LedgerHealth>,
    generation: u64,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = health.tripped() => {
                if let Some(controller) = controller.upgrade() {
                    let reason = format!(
                        "{} consecutive ledger failures",
                        health.consecutive_failures()
                    );
                    controller.fail(generation, reason).await;
                }
            }
        }
    })
}
