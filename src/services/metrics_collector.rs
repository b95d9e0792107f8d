//! Periodic sampling of per-agent execution counters.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::alert_engine::AlertEngine;
use super::event_bus::{EventBus, EventPayload};
use super::retry::RetryPolicy;
use crate::domain::models::{AgentId, AggregatedMetrics, MetricsConfig, MetricsSnapshot};
use crate::domain::ports::LedgerGateway;

/// Result of one collection tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub snapshots: Vec<MetricsSnapshot>,
    pub aggregate: AggregatedMetrics,
    /// Agents whose counters could not be fetched this tick
    pub skipped: Vec<AgentId>,
}

pub struct MetricsCollector {
    ledger: Arc<dyn LedgerGateway>,
    retry: RetryPolicy,
    event_bus: Arc<EventBus>,
    interval: Duration,
    history_limit: usize,
    /// Monitored agents in registration order
    monitored: RwLock<Vec<AgentId>>,
    history: RwLock<HashMap<AgentId, VecDeque<MetricsSnapshot>>>,
    aggregate: RwLock<Option<AggregatedMetrics>>,
    /// Evaluates every snapshot in collection order
    alerts: Option<Arc<AlertEngine>>,
    /// Serializes collections, forced ones included
    collect_lock: Mutex<()>,
}

impl MetricsCollector {
    pub fn new(
        ledger: Arc<dyn LedgerGateway>,
        retry: RetryPolicy,
        event_bus: Arc<EventBus>,
        config: &MetricsConfig,
    ) -> Self {
        Self {
            ledger,
            retry,
            event_bus,
            interval: config.collection_interval(),
            history_limit: config.history_limit.max(1),
            monitored: RwLock::new(Vec::new()),
            history: RwLock::new(HashMap::new()),
            aggregate: RwLock::new(None),
            alerts: None,
            collect_lock: Mutex::new(()),
        }
    }

    pub fn with_alerts(mut self, alerts: Arc<AlertEngine>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn monitor(&self, agent_id: AgentId) {
        if let Ok(mut monitored) = self.monitored.write() {
            if !monitored.contains(&agent_id) {
                monitored.push(agent_id);
            }
        }
    }

    pub fn monitored(&self) -> Vec<AgentId> {
        self.monitored.read().map(|m| m.clone()).unwrap_or_default()
    }

    /// Sample every monitored agent once. Collections never overlap, so the
    /// alert engine sees each agent's samples in order.
    pub async fn collect_once(&self) -> Collection {
        let _guard = self.collect_lock.lock().await;
        let agents = self.monitored();
        let ledger = &self.ledger;

        let mut snapshots = Vec::with_capacity(agents.len());
        let mut skipped = Vec::new();
        for agent_id in agents {
            match self
                .retry
                .execute("get_agent_metrics", || ledger.get_agent_metrics(agent_id))
                .await
            {
                Ok(counters) => {
                    let snapshot = MetricsSnapshot::from_counters(agent_id, counters);
                    self.record(snapshot.clone());
                    self.event_bus
                        .publish(EventPayload::MetricsCollected(snapshot.clone()));
                    if let Some(alerts) = &self.alerts {
                        alerts.evaluate(&snapshot);
                    }
                    snapshots.push(snapshot);
                }
                Err(e) => {
                    warn!(%agent_id, error = %e, "Failed to collect agent metrics, skipping");
                    skipped.push(agent_id);
                }
            }
        }

        let aggregate = AggregatedMetrics::from_snapshots(&snapshots);
        if let Ok(mut slot) = self.aggregate.write() {
            *slot = Some(aggregate.clone());
        }
        self.event_bus
            .publish(EventPayload::AggregateCollected(aggregate.clone()));

        debug!(
            agents = snapshots.len(),
            skipped = skipped.len(),
            total_executions = aggregate.total_executions,
            "Metrics collected"
        );

        Collection {
            snapshots,
            aggregate,
            skipped,
        }
    }

    fn record(&self, snapshot: MetricsSnapshot) {
        let Ok(mut history) = self.history.write() else {
            return;
        };
        let entries = history.entry(snapshot.agent_id).or_default();
        entries.push_back(snapshot);
        while entries.len() > self.history_limit {
            entries.pop_front();
        }
    }

    pub fn latest(&self, agent_id: AgentId) -> Option<MetricsSnapshot> {
        self.history
            .read()
            .ok()
            .and_then(|h| h.get(&agent_id).and_then(|e| e.back().cloned()))
    }

    /// Retained snapshots for an agent, oldest first.
    pub fn history(&self, agent_id: AgentId) -> Vec<MetricsSnapshot> {
        self.history
            .read()
            .ok()
            .and_then(|h| h.get(&agent_id).map(|e| e.iter().cloned().collect()))
            .unwrap_or_default()
    }

    pub fn aggregate(&self) -> Option<AggregatedMetrics> {
        self.aggregate.read().ok().and_then(|a| a.clone())
    }

    /// Collect on a fixed interval until cancelled. The first tick fires one
    /// interval after start.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_ms = self.interval.as_millis() as u64, "Metrics collector started");
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.collect_once().await;
                    }
                }
            }
            info!("Metrics collector stopped");
        })
    }
}
