//! Task handler port - the user-supplied execution logic of an agent.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::capability_provider::CapabilityProvider;
use super::metadata_store::MetadataStore;
use crate::domain::models::{AgentId, TaskId};

/// Everything a handler may use while executing one task.
#[derive(Clone)]
pub struct ExecutionContext {
    pub agent_id: AgentId,
    pub task_id: TaskId,
    /// Generative backend configured for the agent, if any
    pub provider: Option<Arc<dyn CapabilityProvider>>,
    pub metadata: Arc<dyn MetadataStore>,
    /// Cancelled when the task times out or the agent shuts down
    pub cancellation: CancellationToken,
    /// Span carrying `agent_id` and `task_id`; handler code runs inside it
    pub span: tracing::Span,
}

impl ExecutionContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("agent_id", &self.agent_id)
            .field("task_id", &self.task_id)
            .field("provider", &self.provider.as_ref().map(|p| p.name().to_string()))
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Executes a task payload and produces a JSON result.
///
/// An `Err` or a panic both mark the task failed; neither affects other tasks
/// or the agent's state.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, payload: Value, ctx: ExecutionContext) -> anyhow::Result<Value>;
}

/// Adapts an async closure into a [`TaskHandler`].
pub struct FnTaskHandler<F> {
    f: F,
}

impl<F> FnTaskHandler<F> {
    pub const fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnTaskHandler<F>
where
    F: Fn(Value, ExecutionContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<Value>> + Send,
{
    async fn handle(&self, payload: Value, ctx: ExecutionContext) -> anyhow::Result<Value> {
        (self.f)(payload, ctx).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(Value, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnTaskHandler::new(f))
}
