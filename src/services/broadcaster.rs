//! Realtime fan-out of engine events to connected observers.
//!
//! Each observer owns a bounded outbox. Delivery never waits on an observer:
//! a full outbox drops its oldest message and counts the drop.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::event_bus::{EngineEvent, EventBus, EventPayload};
use crate::domain::models::{AgentId, AggregatedMetrics, AlertChange, MetricsSnapshot};

pub type ObserverId = Uuid;

/// Message pushed to an observer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum OutboundMessage {
    Metrics(MetricsSnapshot),
    Aggregate(AggregatedMetrics),
    Alert(AlertChange),
    Event(EngineEvent),
    Subscribed(SubscriptionAck),
    Error { message: String },
}

impl OutboundMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    fn from_event(event: &EngineEvent) -> Self {
        match &event.payload {
            EventPayload::MetricsCollected(snapshot) => Self::Metrics(snapshot.clone()),
            EventPayload::AggregateCollected(aggregate) => Self::Aggregate(aggregate.clone()),
            EventPayload::AlertChanged(change) => Self::Alert(change.clone()),
            _ => Self::Event(event.clone()),
        }
    }
}

/// Current subscription set, echoed after every (un)subscribe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionAck {
    pub all: bool,
    pub agent_ids: Vec<AgentId>,
}

/// What an observer wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interest {
    All,
    Agents(HashSet<AgentId>),
}

impl Interest {
    fn matches(&self, agent_id: Option<AgentId>) -> bool {
        match (self, agent_id) {
            (Self::All, _) => true,
            (Self::Agents(set), Some(id)) => set.contains(&id),
            (Self::Agents(_), None) => false,
        }
    }

    fn ack(&self) -> SubscriptionAck {
        match self {
            Self::All => SubscriptionAck {
                all: true,
                agent_ids: Vec::new(),
            },
            Self::Agents(set) => {
                let mut agent_ids: Vec<AgentId> = set.iter().copied().collect();
                agent_ids.sort();
                SubscriptionAck {
                    all: false,
                    agent_ids,
                }
            }
        }
    }
}

/// Bounded drop-oldest queue for one observer.
struct Outbox {
    queue: Mutex<VecDeque<OutboundMessage>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl Outbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn push(&self, message: OutboundMessage) {
        if let Ok(mut queue) = self.queue.lock() {
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(message);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<OutboundMessage> {
        self.queue.lock().ok().and_then(|mut q| q.pop_front())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Receiving end handed to a connection. Dropping it marks the observer gone.
pub struct ObserverHandle {
    id: ObserverId,
    outbox: Arc<Outbox>,
}

impl ObserverHandle {
    pub const fn id(&self) -> ObserverId {
        self.id
    }

    /// Next queued message; `None` once disconnected and drained.
    pub async fn recv(&self) -> Option<OutboundMessage> {
        loop {
            if let Some(message) = self.outbox.pop() {
                return Some(message);
            }
            if self.outbox.is_closed() {
                return None;
            }
            self.outbox.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<OutboundMessage> {
        self.outbox.pop()
    }

    pub fn dropped(&self) -> u64 {
        self.outbox.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.outbox.close();
    }
}

struct Observer {
    interest: Interest,
    outbox: Arc<Outbox>,
}

pub struct RealtimeBroadcaster {
    observers: RwLock<HashMap<ObserverId, Observer>>,
    buffer_capacity: usize,
}

impl RealtimeBroadcaster {
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
            buffer_capacity,
        }
    }

    /// Register a new observer with no subscriptions.
    pub fn connect(&self) -> ObserverHandle {
        let id = Uuid::new_v4();
        let outbox = Arc::new(Outbox::new(self.buffer_capacity));
        if let Ok(mut observers) = self.observers.write() {
            observers.insert(
                id,
                Observer {
                    interest: Interest::Agents(HashSet::new()),
                    outbox: outbox.clone(),
                },
            );
        }
        debug!(observer_id = %id, "Observer connected");
        ObserverHandle { id, outbox }
    }

    pub fn disconnect(&self, observer_id: ObserverId) {
        if let Ok(mut observers) = self.observers.write() {
            if let Some(observer) = observers.remove(&observer_id) {
                observer.outbox.close();
                debug!(%observer_id, "Observer disconnected");
            }
        }
    }

    /// Subscribe to one agent, or to everything when `agent_id` is `None`.
    pub fn subscribe(
        &self,
        observer_id: ObserverId,
        agent_id: Option<AgentId>,
    ) -> Option<SubscriptionAck> {
        let mut observers = self.observers.write().ok()?;
        let observer = observers.get_mut(&observer_id)?;
        match agent_id {
            None => observer.interest = Interest::All,
            Some(id) => {
                if let Interest::Agents(set) = &mut observer.interest {
                    set.insert(id);
                }
            }
        }
        Some(observer.interest.ack())
    }

    /// Drop one agent from the set, or every subscription when `agent_id` is
    /// `None`. An "all" subscription is only cleared by the latter.
    pub fn unsubscribe(
        &self,
        observer_id: ObserverId,
        agent_id: Option<AgentId>,
    ) -> Option<SubscriptionAck> {
        let mut observers = self.observers.write().ok()?;
        let observer = observers.get_mut(&observer_id)?;
        match agent_id {
            None => observer.interest = Interest::Agents(HashSet::new()),
            Some(id) => {
                if let Interest::Agents(set) = &mut observer.interest {
                    set.remove(&id);
                }
            }
        }
        Some(observer.interest.ack())
    }

    /// Queue a message for a single observer. Returns `false` if unknown.
    pub fn send_to(&self, observer_id: ObserverId, message: OutboundMessage) -> bool {
        let Ok(observers) = self.observers.read() else {
            return false;
        };
        match observers.get(&observer_id) {
            Some(observer) if !observer.outbox.is_closed() => {
                observer.outbox.push(message);
                true
            }
            _ => false,
        }
    }

    /// Fan an event out to interested observers, pruning dead ones.
    pub fn deliver(&self, event: &EngineEvent) -> usize {
        let agent_id = event.agent_id();
        let message = OutboundMessage::from_event(event);
        let mut delivered = 0;
        let mut dead = Vec::new();

        if let Ok(observers) = self.observers.read() {
            for (id, observer) in observers.iter() {
                if observer.outbox.is_closed() {
                    dead.push(*id);
                    continue;
                }
                if observer.interest.matches(agent_id) {
                    observer.outbox.push(message.clone());
                    delivered += 1;
                }
            }
        }

        if !dead.is_empty() {
            if let Ok(mut observers) = self.observers.write() {
                for id in &dead {
                    observers.remove(id);
                }
            }
            debug!(pruned = dead.len(), "Pruned disconnected observers");
        }
        delivered
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().map(|o| o.len()).unwrap_or(0)
    }

    /// Relay every bus event until cancelled.
    pub fn spawn(self: Arc<Self>, event_bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let mut events = event_bus.subscribe();
        tokio::spawn(async move {
            info!("Realtime broadcaster started");
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) => {
                            self.deliver(&event);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Broadcaster lagged behind event bus");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            if let Ok(observers) = self.observers.read() {
                for observer in observers.values() {
                    observer.outbox.close();
                }
            }
            info!("Realtime broadcaster stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(agent_id: AgentId) -> EngineEvent {
        EngineEvent::new(EventPayload::AgentStarted { agent_id })
    }

    #[tokio::test]
    async fn test_routing_by_interest() {
        let hub = RealtimeBroadcaster::new(8);
        let agent_a = Uuid::new_v4();
        let agent_b = Uuid::new_v4();

        let all = hub.connect();
        let only_a = hub.connect();
        let nothing = hub.connect();
        hub.subscribe(all.id(), None).unwrap();
        let ack = hub.subscribe(only_a.id(), Some(agent_a)).unwrap();
        assert_eq!(ack.agent_ids, vec![agent_a]);

        assert_eq!(hub.deliver(&started(agent_a)), 2);
        assert_eq!(hub.deliver(&started(agent_b)), 1);
        let aggregate = EngineEvent::new(EventPayload::AggregateCollected(
            AggregatedMetrics::from_snapshots(&[]),
        ));
        assert_eq!(hub.deliver(&aggregate), 1);

        assert!(matches!(all.recv().await, Some(OutboundMessage::Event(_))));
        assert!(matches!(all.recv().await, Some(OutboundMessage::Event(_))));
        assert!(matches!(all.recv().await, Some(OutboundMessage::Aggregate(_))));
        assert!(matches!(only_a.recv().await, Some(OutboundMessage::Event(_))));
        assert!(only_a.try_recv().is_none());
        assert!(nothing.try_recv().is_none());
    }

    #[test]
    fn test_full_outbox_drops_oldest() {
        let hub = RealtimeBroadcaster::new(2);
        let observer = hub.connect();
        hub.subscribe(observer.id(), None);

        for n in 0..5 {
            hub.send_to(observer.id(), OutboundMessage::error(format!("m{n}")));
        }
        assert_eq!(observer.dropped(), 3);
        match observer.try_recv() {
            Some(OutboundMessage::Error { message }) => assert_eq!(message, "m3"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_dropped_handles_are_pruned() {
        let hub = RealtimeBroadcaster::new(4);
        let keep = hub.connect();
        let gone = hub.connect();
        hub.subscribe(keep.id(), None);
        hub.subscribe(gone.id(), None);
        drop(gone);

        assert_eq!(hub.deliver(&started(Uuid::new_v4())), 1);
        assert_eq!(hub.observer_count(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let hub = RealtimeBroadcaster::new(4);
        let agent = Uuid::new_v4();
        let observer = hub.connect();
        hub.subscribe(observer.id(), Some(agent));
        let ack = hub.unsubscribe(observer.id(), Some(agent)).unwrap();
        assert!(ack.agent_ids.is_empty());
        assert_eq!(hub.deliver(&started(agent)), 0);

        hub.subscribe(observer.id(), None);
        let ack = hub.unsubscribe(observer.id(), None).unwrap();
        assert!(!ack.all);
        assert!(hub.unsubscribe(Uuid::new_v4(), None).is_none());
    }

    #[test]
    fn test_message_wire_format() {
        let json = serde_json::to_value(OutboundMessage::error("bad")).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["data"]["message"], "bad");

        let ack = OutboundMessage::Subscribed(SubscriptionAck {
            all: true,
            agent_ids: vec![],
        });
        let json = serde_json::to_value(ack).unwrap();
        assert_eq!(json["type"], "subscribed");
        assert_eq!(json["data"]["agentIds"], serde_json::json!([]));
    }
}
