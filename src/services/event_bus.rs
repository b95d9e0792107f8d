//! EventBus service for engine-wide event distribution.
//!
//! Broadcast-based: every published event gets a sequence number and is fanned
//! out to all current subscribers. Slow subscribers lag and skip, they never
//! block publishers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::domain::models::{
    AgentId, AgentState, AggregatedMetrics, AlertChange, MetricsSnapshot, TaskId,
};

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing sequence number assigned by EventBus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceNumber(pub u64);

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub id: EventId,
    pub sequence: SequenceNumber,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl EngineEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: EventId::new(),
            sequence: SequenceNumber(0),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Event name such as `agent:started` or `task:failed`.
    pub const fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    /// Agent the event concerns; `None` for system-wide events.
    pub const fn agent_id(&self) -> Option<AgentId> {
        self.payload.agent_id()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    // Agent lifecycle
    AgentRegistered {
        agent_id: AgentId,
        name: String,
    },
    AgentStarted {
        agent_id: AgentId,
    },
    AgentStopped {
        agent_id: AgentId,
    },
    AgentUpdated {
        agent_id: AgentId,
        state: AgentState,
    },
    AgentError {
        agent_id: AgentId,
        error: String,
    },

    // Task lifecycle
    TaskStarted {
        agent_id: AgentId,
        task_id: TaskId,
    },
    TaskCompleted {
        agent_id: AgentId,
        task_id: TaskId,
        elapsed_ms: u64,
    },
    TaskFailed {
        agent_id: AgentId,
        task_id: TaskId,
        error: String,
        elapsed_ms: u64,
    },
    /// In flight when the shutdown grace period ran out
    TaskAbandoned {
        agent_id: AgentId,
        task_id: TaskId,
    },

    // Metrics and alerting
    MetricsCollected(MetricsSnapshot),
    AggregateCollected(AggregatedMetrics),
    AlertChanged(AlertChange),
}

impl EventPayload {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::AgentRegistered { .. } => "agent:registered",
            Self::AgentStarted { .. } => "agent:started",
            Self::AgentStopped { .. } => "agent:stopped",
            Self::AgentUpdated { .. } => "agent:updated",
            Self::AgentError { .. } => "agent:error",
            Self::TaskStarted { .. } => "task:started",
            Self::TaskCompleted { .. } => "task:completed",
            Self::TaskFailed { .. } => "task:failed",
            Self::TaskAbandoned { .. } => "task:abandoned",
            Self::MetricsCollected(_) => "metrics:collected",
            Self::AggregateCollected(_) => "metrics:aggregate",
            Self::AlertChanged(_) => "alert:changed",
        }
    }

    pub const fn agent_id(&self) -> Option<AgentId> {
        match self {
            Self::AgentRegistered { agent_id, .. }
            | Self::AgentStarted { agent_id }
            | Self::AgentStopped { agent_id }
            | Self::AgentUpdated { agent_id, .. }
            | Self::AgentError { agent_id, .. }
            | Self::TaskStarted { agent_id, .. }
            | Self::TaskCompleted { agent_id, .. }
            | Self::TaskFailed { agent_id, .. }
            | Self::TaskAbandoned { agent_id, .. } => Some(*agent_id),
            Self::MetricsCollected(snapshot) => Some(snapshot.agent_id),
            Self::AlertChanged(change) => Some(change.agent_id),
            Self::AggregateCollected(_) => None,
        }
    }
}

impl From<EventPayload> for EngineEvent {
    fn from(payload: EventPayload) -> Self {
        Self::new(payload)
    }
}

/// Central event bus for broadcasting events to multiple consumers.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
    sequence: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sequence: AtomicU64::new(0),
        }
    }

    /// Publish an event. Never blocks; having no subscribers is not an error.
    pub fn publish(&self, payload: impl Into<EngineEvent>) {
        let mut event = payload.into();
        event.sequence = SequenceNumber(self.sequence.fetch_add(1, Ordering::SeqCst));
        tracing::trace!(kind = event.kind(), sequence = event.sequence.0, "Publishing event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn current_sequence(&self) -> SequenceNumber {
        SequenceNumber(self.sequence.load(Ordering::SeqCst))
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
