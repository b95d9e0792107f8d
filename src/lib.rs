//! Agent Dispatch - ledger-backed agent lifecycle and task dispatch engine
//!
//! Agents are registered against an external task ledger, receive work through
//! a push subscription backed by periodic polling, and execute tasks in a
//! bounded worker pool. A metrics pipeline samples per-agent counters,
//! evaluates alert thresholds with hysteresis and fans everything out to
//! realtime observers.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): models, errors and the ports the engine consumes
//! - **Service Layer** (`services`): intake, execution, metrics, alerting, fan-out
//! - **Application Layer** (`application`): agent controller and dispatch engine
//! - **Adapters** (`adapters`): in-memory ledger, providers, monitoring HTTP
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//! - **CLI Layer** (`cli`): command-line interface
//!
//! # Example
//!
//! ```ignore
//! use agent_dispatch::adapters::memory::{InMemoryLedger, InMemoryMetadataStore};
//! use agent_dispatch::{handler_fn, AgentConfig, Config, DispatchEngine};
//!
//! let engine = DispatchEngine::new(
//!     Config::default(),
//!     Arc::new(InMemoryLedger::new()),
//!     Arc::new(InMemoryMetadataStore::new()),
//! );
//! engine.start().await?;
//! let agent = engine
//!     .register_agent(AgentConfig::new("echo"), handler_fn(|p, _ctx| async move { Ok(p) }), None)
//!     .await?;
//! agent.start().await?;
//! ```

pub mod adapters;
pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use application::{AgentController, ControllerDeps, DispatchEngine};
pub use domain::models::{
    AgentConfig, AgentId, AgentState, AggregatedMetrics, AlertChange, AlertSeverity,
    AlertThresholds, Config, MetricsSnapshot, RawCounters, Task, TaskId, TaskStatus,
};
pub use domain::ports::{
    handler_fn, CapabilityProvider, ExecutionContext, LedgerError, LedgerGateway, MetadataStore,
    TaskHandler,
};
pub use domain::{DomainError, DomainResult};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{EngineEvent, EventBus, EventPayload, RealtimeBroadcaster};
