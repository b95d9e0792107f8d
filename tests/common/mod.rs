//! Common test utilities for integration tests
//!
//! Shared fixtures for building an engine over the in-memory ledger and for
//! waiting on asynchronous outcomes.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use agent_dispatch::adapters::memory::{InMemoryLedger, InMemoryMetadataStore};
use agent_dispatch::domain::models::{AgentConfig, AgentId, Config, TaskId};
use agent_dispatch::domain::ports::TaskHandler;
use agent_dispatch::{AgentController, DispatchEngine};

/// Setup test logging
///
/// Call this at the beginning of tests that need logging.
pub fn setup_test_logging() {
    use tracing_subscriber::fmt;

    let _ = fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Configuration with short retry delays so failure paths finish quickly.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.retry.initial_backoff_ms = 5;
    config.retry.max_backoff_ms = 20;
    config.executor.shutdown_grace_ms = 200;
    config.dedup.ttl_ms = 60_000;
    config
}

pub fn engine(config: Config) -> (Arc<InMemoryLedger>, Arc<DispatchEngine>) {
    let ledger = Arc::new(InMemoryLedger::new());
    let engine = Arc::new(DispatchEngine::new(
        config,
        ledger.clone(),
        Arc::new(InMemoryMetadataStore::new()),
    ));
    (ledger, engine)
}

pub fn agent_config(name: &str, max_concurrent: usize) -> AgentConfig {
    AgentConfig::new(name)
        .with_polling_interval(Duration::from_millis(50))
        .with_max_concurrent_tasks(max_concurrent)
        .with_task_timeout(Duration::from_secs(5))
}

/// Register and start an agent, returning its controller and id.
pub async fn running_agent(
    engine: &DispatchEngine,
    config: AgentConfig,
    handler: Arc<dyn TaskHandler>,
) -> (Arc<AgentController>, AgentId) {
    let controller = engine
        .register_agent(config, handler, None)
        .await
        .expect("agent registers");
    let agent_id = controller.agent_id().expect("registered agent has an id");
    engine.start_agent(agent_id).await.expect("agent starts");
    (controller, agent_id)
}

/// Poll `predicate` every 10ms until it holds or `timeout_ms` elapses.
pub async fn wait_for<F>(mut predicate: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}

pub fn is_terminal(ledger: &InMemoryLedger, task_id: TaskId) -> bool {
    ledger
        .task(task_id)
        .is_some_and(|task| task.status.is_terminal())
}
