//! Monitoring HTTP server.
//!
//! REST queries over metrics, alerts and agents plus a WebSocket channel
//! backed by the realtime broadcaster.

pub mod monitoring;
pub mod ws;

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::application::DispatchEngine;
use crate::domain::models::ServerConfig;

pub use monitoring::{ErrorResponse, HealthResponse};
pub use ws::ClientMessage;

/// Build the monitoring router.
pub fn router(engine: Arc<DispatchEngine>, enable_cors: bool) -> Router {
    let mut router = Router::new()
        .route("/agents", get(monitoring::list_agents))
        .route("/agents/{agent_id}/metrics", get(monitoring::get_agent_metrics))
        .route("/agents/{agent_id}/history", get(monitoring::get_agent_history))
        .route("/metrics/aggregate", get(monitoring::get_aggregated_metrics))
        .route("/metrics/collect", post(monitoring::force_collect))
        .route("/alerts", get(monitoring::list_alerts))
        .route("/health", get(monitoring::health_check))
        .route("/ws", get(ws::ws_handler))
        .with_state(engine)
        .layer(TraceLayer::new_for_http());

    if enable_cors {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    router
}

pub struct MonitoringServer {
    engine: Arc<DispatchEngine>,
    config: ServerConfig,
}

impl MonitoringServer {
    pub fn new(engine: Arc<DispatchEngine>, config: ServerConfig) -> Self {
        Self { engine, config }
    }

    /// Serve until `shutdown` resolves.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port).parse()?;
        let router = router(self.engine, self.config.enable_cors);

        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "Monitoring server listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}
