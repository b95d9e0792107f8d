//! WebSocket duplex channel for realtime observers.
//!
//! ## Protocol
//!
//! Client to server:
//!
//! ```text
//! {"type":"subscribe"}                       all agents
//! {"type":"subscribe","agentId":"<uuid>"}    one agent
//! {"type":"unsubscribe","agentId":"<uuid>"}  omit agentId to clear everything
//! {"type":"getMetrics","agentId":"<uuid>"}
//! ```
//!
//! Server to client: `metrics`, `aggregate`, `alert`, `event`, `subscribed`
//! and `error` frames, each `{"type":..., "data":...}`.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::DispatchEngine;
use crate::domain::models::AgentId;
use crate::services::{ObserverId, OutboundMessage};

/// Message sent by an observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Subscribe {
        #[serde(rename = "agentId", default)]
        agent_id: Option<AgentId>,
    },
    Unsubscribe {
        #[serde(rename = "agentId", default)]
        agent_id: Option<AgentId>,
    },
    GetMetrics {
        #[serde(rename = "agentId")]
        agent_id: AgentId,
    },
}

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(engine): State<Arc<DispatchEngine>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, engine))
}

async fn handle_socket(socket: WebSocket, engine: Arc<DispatchEngine>) {
    let broadcaster = engine.broadcaster().clone();
    let observer = broadcaster.connect();
    let observer_id = observer.id();
    info!(%observer_id, "WebSocket observer connected");

    let (mut sender, mut receiver) = socket.split();

    let recv_engine = engine.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    handle_client_text(&recv_engine, observer_id, text.as_str());
                }
                Ok(Message::Close(_)) => {
                    debug!(%observer_id, "Client sent close frame");
                    break;
                }
                Ok(Message::Binary(data)) => {
                    debug!(%observer_id, len = data.len(), "Ignoring binary frame");
                }
                Ok(Message::Ping(_) | Message::Pong(_)) => {}
                Err(e) => {
                    warn!(%observer_id, error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            message = observer.recv() => {
                let Some(message) = message else { break };
                if let Err(e) = send_message(&mut sender, &message).await {
                    debug!(%observer_id, error = %e, "Failed to send, closing connection");
                    break;
                }
            }
            _ = &mut recv_task => {
                debug!(%observer_id, "Receiver task finished");
                break;
            }
        }
    }

    recv_task.abort();
    broadcaster.disconnect(observer_id);
    info!(
        %observer_id,
        dropped = observer.dropped(),
        "WebSocket observer disconnected"
    );
}

async fn send_message(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    message: &OutboundMessage,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(message).map_err(axum::Error::new)?;
    sender.send(Message::Text(json.into())).await
}

/// Parse and apply one client frame. Replies are queued on the observer's
/// outbox.
pub(crate) fn handle_client_text(engine: &DispatchEngine, observer_id: ObserverId, text: &str) {
    let broadcaster = engine.broadcaster();
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            broadcaster.send_to(
                observer_id,
                OutboundMessage::error(format!("invalid message: {e}")),
            );
            return;
        }
    };

    let reply = match message {
        ClientMessage::Subscribe { agent_id } => broadcaster
            .subscribe(observer_id, agent_id)
            .map(OutboundMessage::Subscribed),
        ClientMessage::Unsubscribe { agent_id } => broadcaster
            .unsubscribe(observer_id, agent_id)
            .map(OutboundMessage::Subscribed),
        ClientMessage::GetMetrics { agent_id } => Some(
            engine
                .collector()
                .latest(agent_id)
                .map_or_else(
                    || OutboundMessage::error(format!("no metrics for agent {agent_id}")),
                    OutboundMessage::Metrics,
                ),
        ),
    };

    if let Some(reply) = reply {
        broadcaster.send_to(observer_id, reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryLedger, InMemoryMetadataStore};
    use crate::domain::models::Config;
    use crate::services::SubscriptionAck;
    use serde_json::json;
    use uuid::Uuid;

    fn engine() -> DispatchEngine {
        DispatchEngine::new(
            Config::default(),
            Arc::new(InMemoryLedger::new()),
            Arc::new(InMemoryMetadataStore::new()),
        )
    }

    #[test]
    fn test_client_message_parsing() {
        let id = Uuid::new_v4();
        let all: ClientMessage = serde_json::from_value(json!({"type": "subscribe"})).unwrap();
        assert_eq!(all, ClientMessage::Subscribe { agent_id: None });

        let one: ClientMessage =
            serde_json::from_value(json!({"type": "getMetrics", "agentId": id})).unwrap();
        assert_eq!(one, ClientMessage::GetMetrics { agent_id: id });

        assert!(serde_json::from_value::<ClientMessage>(json!({"type": "getMetrics"})).is_err());
    }

    #[tokio::test]
    async fn test_subscribe_is_acknowledged() {
        let engine = engine();
        let observer = engine.broadcaster().connect();
        let agent = Uuid::new_v4();

        let frame = json!({"type": "subscribe", "agentId": agent}).to_string();
        handle_client_text(&engine, observer.id(), &frame);

        match observer.try_recv() {
            Some(OutboundMessage::Subscribed(SubscriptionAck { all, agent_ids })) => {
                assert!(!all);
                assert_eq!(agent_ids, vec![agent]);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bad_frames_and_missing_metrics_reply_with_errors() {
        let engine = engine();
        let observer = engine.broadcaster().connect();

        handle_client_text(&engine, observer.id(), "not json");
        assert!(matches!(observer.try_recv(), Some(OutboundMessage::Error { .. })));

        let frame = json!({"type": "getMetrics", "agentId": Uuid::new_v4()}).to_string();
        handle_client_text(&engine, observer.id(), &frame);
        match observer.try_recv() {
            Some(OutboundMessage::Error { message }) => assert!(message.starts_with("no metrics")),
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
