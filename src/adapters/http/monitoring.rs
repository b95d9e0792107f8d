//! REST handlers for the monitoring surface.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::sync::Arc;

use crate::application::DispatchEngine;
use crate::domain::models::{
    AgentId, AgentState, AgentSummary, AggregatedMetrics, AlertState, MetricsSnapshot,
};
use crate::services::Collection;

/// Error body returned by every failing route.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

pub(crate) struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn not_found(code: &str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            body: ErrorResponse {
                error: message.into(),
                code: code.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub agents: usize,
    pub running_agents: usize,
    pub observers: usize,
    pub active_alerts: usize,
    pub current_sequence: u64,
}

async fn require_agent(engine: &DispatchEngine, agent_id: AgentId) -> Result<(), ApiError> {
    match engine.agent(agent_id).await {
        Some(_) => Ok(()),
        None => Err(ApiError::not_found(
            "agent_not_found",
            format!("Agent {agent_id} not found"),
        )),
    }
}

pub(crate) async fn list_agents(
    State(engine): State<Arc<DispatchEngine>>,
) -> Json<Vec<AgentSummary>> {
    Json(engine.list_agents().await)
}

pub(crate) async fn get_agent_metrics(
    State(engine): State<Arc<DispatchEngine>>,
    Path(agent_id): Path<AgentId>,
) -> ApiResult<MetricsSnapshot> {
    require_agent(&engine, agent_id).await?;
    engine.collector().latest(agent_id).map(Json).ok_or_else(|| {
        ApiError::not_found(
            "no_metrics",
            format!("No metrics collected yet for agent {agent_id}"),
        )
    })
}

pub(crate) async fn get_agent_history(
    State(engine): State<Arc<DispatchEngine>>,
    Path(agent_id): Path<AgentId>,
) -> ApiResult<Vec<MetricsSnapshot>> {
    require_agent(&engine, agent_id).await?;
    Ok(Json(engine.collector().history(agent_id)))
}

/// Latest rollup, or an empty one before the first tick.
pub(crate) async fn get_aggregated_metrics(
    State(engine): State<Arc<DispatchEngine>>,
) -> Json<AggregatedMetrics> {
    Json(
        engine
            .collector()
            .aggregate()
            .unwrap_or_else(|| AggregatedMetrics::from_snapshots(&[])),
    )
}

pub(crate) async fn force_collect(State(engine): State<Arc<DispatchEngine>>) -> Json<Collection> {
    Json(engine.collect_now().await)
}

pub(crate) async fn list_alerts(State(engine): State<Arc<DispatchEngine>>) -> Json<Vec<AlertState>> {
    Json(engine.alerts().active_alerts())
}

pub(crate) async fn health_check(State(engine): State<Arc<DispatchEngine>>) -> Json<HealthResponse> {
    let agents = engine.list_agents().await;
    let running_agents = agents
        .iter()
        .filter(|a| a.state == AgentState::Running)
        .count();
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "agent-dispatch".to_string(),
        agents: agents.len(),
        running_agents,
        observers: engine.broadcaster().observer_count(),
        active_alerts: engine.alerts().active_alerts().len(),
        current_sequence: engine.event_bus().current_sequence().0,
    })
}
