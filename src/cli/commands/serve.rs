//! Implementation of the `agent-dispatch serve` command.

use anyhow::{Context, Result};
use clap::Args;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::adapters::http::MonitoringServer;
use crate::adapters::memory::{InMemoryLedger, InMemoryMetadataStore};
use crate::adapters::providers::build_providers;
use crate::application::DispatchEngine;
use crate::domain::models::{AgentConfig, AgentId, Config};
use crate::domain::ports::{handler_fn, ExecutionContext, MetadataStoreExt, TaskHandler};

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Register an echo agent and seed it with tasks
    #[arg(long)]
    pub demo: bool,

    /// Tasks seeded when running with --demo
    #[arg(long, default_value_t = 5)]
    pub demo_tasks: usize,
}

pub async fn execute(args: ServeArgs, config: Config) -> Result<()> {
    let ledger = Arc::new(InMemoryLedger::new());
    let providers = build_providers(&config.providers).context("Failed to build providers")?;
    let server_config = config.server.clone();

    let engine = Arc::new(
        DispatchEngine::new(config, ledger.clone(), Arc::new(InMemoryMetadataStore::new()))
            .with_providers(providers),
    );
    engine.start().await.context("Failed to start dispatch engine")?;

    if args.demo {
        let agent_id = start_demo_agent(&engine).await?;
        for n in 0..args.demo_tasks {
            ledger.submit_task(agent_id, json!({ "n": n })).await;
        }
        info!(%agent_id, tasks = args.demo_tasks, "Demo agent seeded");
    }

    let server = MonitoringServer::new(engine.clone(), server_config);
    let result = server
        .serve_with_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await;

    engine.shutdown().await;
    result
}

async fn start_demo_agent(engine: &DispatchEngine) -> Result<AgentId> {
    let config = AgentConfig::new("demo-echo")
        .with_description("Echoes payloads and records them in the metadata store")
        .with_capability("echo")
        .with_polling_interval(Duration::from_secs(1))
        .with_max_concurrent_tasks(2);

    let controller = engine.register_agent(config, echo_handler(), None).await?;
    let agent_id = controller
        .agent_id()
        .context("Demo agent has no id after registration")?;
    engine.start_agent(agent_id).await?;
    Ok(agent_id)
}

fn echo_handler() -> Arc<dyn TaskHandler> {
    handler_fn(|payload: Value, ctx: ExecutionContext| async move {
        let content_id = ctx.metadata.put_json(&payload).await?;
        tracing::debug!(task_id = %ctx.task_id, %content_id, "Payload recorded");
        Ok::<_, anyhow::Error>(json!({ "echo": payload, "content_id": content_id.as_str() }))
    })
}
