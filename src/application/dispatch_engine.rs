//! Dispatch engine: agent registry plus the metrics, alerting and realtime
//! loops shared by all agents.
//!
//! ```text
//!  ┌──────────────────────────── DispatchEngine ────────────────────────────┐
//!  │  AgentController ×N ── intake ─► executor pool ─► ledger settlement    │
//!  │          │                              │                              │
//!  │          └────────────── EventBus ◄─────┘                              │
//!  │                            │  ▲                                        │
//!  │   MetricsCollector ────────┘  │  ──► AlertEngine (every snapshot)       │
//!  │                               ▼                                        │
//!  │                      RealtimeBroadcaster ──► observers                 │
//!  └────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::agent_controller::{AgentController, ControllerDeps};
use crate::domain::models::{AgentConfig, AgentId, AgentSummary, Config};
use crate::domain::ports::{CapabilityProvider, LedgerGateway, MetadataStore, TaskHandler};
use crate::domain::{DomainError, DomainResult};
use crate::services::{
    AlertEngine, Collection, EventBus, MetricsCollector, RealtimeBroadcaster, RetryPolicy,
};

struct Background {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct DispatchEngine {
    config: Config,
    deps: ControllerDeps,
    providers: HashMap<String, Arc<dyn CapabilityProvider>>,
    controllers: RwLock<HashMap<AgentId, Arc<AgentController>>>,
    /// Names reserved by registered agents and registrations in flight
    names: StdMutex<HashSet<String>>,
    collector: Arc<MetricsCollector>,
    alerts: Arc<AlertEngine>,
    broadcaster: Arc<RealtimeBroadcaster>,
    background: Mutex<Option<Background>>,
}

impl DispatchEngine {
    pub fn new(
        config: Config,
        ledger: Arc<dyn LedgerGateway>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        let event_bus = Arc::new(EventBus::new(config.broadcaster.event_bus_capacity));
        let retry = RetryPolicy::from_config(&config.retry);

        let deps = ControllerDeps {
            ledger: ledger.clone(),
            event_bus: event_bus.clone(),
            metadata,
            retry: retry.clone(),
            dedup_ttl: config.dedup.ttl(),
            executor: config.executor.clone(),
        };

        let alerts = Arc::new(AlertEngine::new(config.alerts.clone(), event_bus.clone()));
        let collector = Arc::new(
            MetricsCollector::new(ledger, retry, event_bus, &config.metrics)
                .with_alerts(alerts.clone()),
        );
        let broadcaster = Arc::new(RealtimeBroadcaster::new(
            config.broadcaster.observer_buffer_capacity,
        ));

        Self {
            config,
            deps,
            providers: HashMap::new(),
            controllers: RwLock::new(HashMap::new()),
            names: StdMutex::new(HashSet::new()),
            collector,
            alerts,
            broadcaster,
            background: Mutex::new(None),
        }
    }

    /// Make named capability providers available to agents.
    pub fn with_providers(mut self, providers: HashMap<String, Arc<dyn CapabilityProvider>>) -> Self {
        self.providers.extend(providers);
        self
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.deps.event_bus
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerGateway> {
        &self.deps.ledger
    }

    pub fn collector(&self) -> &Arc<MetricsCollector> {
        &self.collector
    }

    pub fn alerts(&self) -> &Arc<AlertEngine> {
        &self.alerts
    }

    pub fn broadcaster(&self) -> &Arc<RealtimeBroadcaster> {
        &self.broadcaster
    }

    /// Start the metrics and broadcast loops.
    pub async fn start(&self) -> DomainResult<()> {
        AlertEngine::validate_thresholds(&self.config.alerts)?;
        if self.config.metrics.collection_interval_ms == 0 {
            return Err(DomainError::InvalidConfiguration(
                "metrics.collection_interval_ms must be positive".to_string(),
            ));
        }

        let mut background = self.background.lock().await;
        if background.is_some() {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let handles = vec![
            self.broadcaster
                .clone()
                .spawn(&self.deps.event_bus, cancel.child_token()),
            self.collector.clone().spawn(cancel.child_token()),
        ];
        *background = Some(Background { cancel, handles });
        info!("Dispatch engine started");
        Ok(())
    }

    /// Stop every running agent, then the shared loops.
    pub async fn shutdown(&self) {
        let controllers: Vec<Arc<AgentController>> =
            self.controllers.read().await.values().cloned().collect();
        for controller in controllers {
            if let Err(e) = controller.stop().await {
                if !e.is_state_violation() {
                    warn!(error = %e, "Failed to stop agent during shutdown");
                }
            }
        }

        if let Some(background) = self.background.lock().await.take() {
            background.cancel.cancel();
            for handle in background.handles {
                let _ = handle.await;
            }
        }
        info!("Dispatch engine stopped");
    }

    /// Register a new agent on the ledger. Names are unique per engine.
    pub async fn register_agent(
        &self,
        config: AgentConfig,
        handler: Arc<dyn TaskHandler>,
        provider: Option<&str>,
    ) -> DomainResult<Arc<AgentController>> {
        let provider = match provider {
            Some(name) => Some(self.providers.get(name).cloned().ok_or_else(|| {
                DomainError::InvalidConfiguration(format!("unknown capability provider '{name}'"))
            })?),
            None => None,
        };

        self.reserve_name(&config.name)?;
        let name = config.name.clone();

        let mut controller = AgentController::new(config, self.deps.clone()).with_handler(handler);
        if let Some(provider) = provider {
            controller = controller.with_provider(provider);
        }
        let agent_id = match controller.register().await {
            Ok(agent_id) => agent_id,
            Err(e) => {
                self.release_name(&name);
                return Err(e);
            }
        };
        let controller = Arc::new(controller);

        self.controllers
            .write()
            .await
            .insert(agent_id, controller.clone());
        self.collector.monitor(agent_id);
        debug!(%agent_id, "Agent added to registry");
        Ok(controller)
    }

    fn names(&self) -> MutexGuard<'_, HashSet<String>> {
        self.names
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn reserve_name(&self, name: &str) -> DomainResult<()> {
        if !self.names().insert(name.to_string()) {
            return Err(DomainError::AlreadyRegistered(name.to_string()));
        }
        Ok(())
    }

    fn release_name(&self, name: &str) {
        self.names().remove(name);
    }

    pub async fn agent(&self, agent_id: AgentId) -> Option<Arc<AgentController>> {
        self.controllers.read().await.get(&agent_id).cloned()
    }

    async fn require(&self, agent_id: AgentId) -> DomainResult<Arc<AgentController>> {
        self.agent(agent_id)
            .await
            .ok_or(DomainError::AgentNotFound(agent_id))
    }

    pub async fn start_agent(&self, agent_id: AgentId) -> DomainResult<()> {
        self.require(agent_id).await?.start().await
    }

    pub async fn stop_agent(&self, agent_id: AgentId) -> DomainResult<()> {
        self.require(agent_id).await?.stop().await
    }

    pub async fn restart_agent(&self, agent_id: AgentId) -> DomainResult<()> {
        self.require(agent_id).await?.restart().await
    }

    pub async fn update_agent(&self, agent_id: AgentId, config: AgentConfig) -> DomainResult<()> {
        let controller = self.require(agent_id).await?;
        let current = controller.config().name;
        let requested = config.name.clone();
        let renamed = current != requested;
        if renamed {
            self.reserve_name(&requested)?;
        }

        let result = controller.update(config).await;
        if renamed {
            // Keep whichever name the controller ended up with.
            if controller.config().name == requested {
                self.release_name(&current);
            } else {
                self.release_name(&requested);
            }
        }
        result
    }

    /// Summaries of all registered agents, sorted by name.
    pub async fn list_agents(&self) -> Vec<AgentSummary> {
        let controllers: Vec<Arc<AgentController>> =
            self.controllers.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(controllers.len());
        for controller in controllers {
            if let Some(summary) = controller.summary() {
                summaries.push(summary);
            }
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Collect metrics now, outside the timer.
    pub async fn collect_now(&self) -> Collection {
        self.collector.collect_once().await
    }
}
