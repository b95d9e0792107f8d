pub mod alert_engine;
pub mod broadcaster;
pub mod dedup_store;
pub mod event_bus;
pub mod ledger_health;
pub mod metrics_collector;
pub mod retry;
pub mod task_executor;
pub mod task_intake;

pub use alert_engine::{AlertEngine, SampleLevel};
pub use broadcaster::{
    Interest, ObserverHandle, ObserverId, OutboundMessage, RealtimeBroadcaster, SubscriptionAck,
};
pub use dedup_store::DedupStore;
pub use event_bus::{EngineEvent, EventBus, EventId, EventPayload, SequenceNumber};
pub use ledger_health::LedgerHealth;
pub use metrics_collector::{Collection, MetricsCollector};
pub use retry::RetryPolicy;
pub use task_executor::{ExecutorDeps, InFlight, TaskExecutorPool};
pub use task_intake::{SignalSource, TaskIntake};
