//! `quoracle`: spawns a root agent and drives it from stdin/stdout.
//!
//! Grounded on the teacher's `main.rs` shape (`setup_logging()` then
//! `CliArgs::parse()` then build a provider via a builder), collapsed to
//! the single run mode this binary needs — no plugin registry, no OAuth,
//! no subcommands, since those all served the teacher's multi-provider
//! plugin host, which this crate has no counterpart for.

mod action_router;
mod cli_args;
mod provider;
mod tracing_setup;

use action_router::CliActionRouter;
use anyhow::{Context, Result};
use clap::Parser;
use cli_args::CliArgs;
use provider::HttpLLMProvider;
use quoracle_llm::ModelSpec;
use quoracle_runtime::agent_messages::UserMessage;
use quoracle_runtime::config::RuntimeConfig;
use quoracle_runtime::history::{AgentConfig, PromptFields};
use quoracle_runtime::mcp::McpClientPool;
use quoracle_runtime::persistence::{InMemoryPersistenceStore, PersistenceStore, SqlitePersistenceStore};
use quoracle_runtime::supervisor::{Profile, SpawnRequest, StaticProfileCatalog, TreeSupervisor};
use quoracle_runtime::{AgentDeps, EventBus, ProfileCatalog, PublishedEvent};
use std::io::IsTerminal;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_setup::init();
    let args = CliArgs::parse();

    let runtime_config = match &args.config {
        Some(path) => RuntimeConfig::load(path).context("failed to load runtime config")?,
        None => RuntimeConfig::default(),
    };

    let catalog: quoracle_llm::SharedModelCatalog = Arc::new(runtime_config.model_catalog());

    let api_key = args
        .api_key
        .clone()
        .or_else(|| std::env::var("QUORACLE_API_KEY").ok())
        .unwrap_or_default();
    let provider: quoracle_llm::SharedLLMProvider =
        Arc::new(HttpLLMProvider::new(args.base_url.clone(), api_key));

    let model_pool: Vec<ModelSpec> = args.models.iter().map(ModelSpec::new).collect();
    let embedding_model = ModelSpec::new(args.embedding_model.clone());

    let event_bus = Arc::new(EventBus::new());
    let persistence: Arc<dyn PersistenceStore> = match &runtime_config.persistence_path {
        Some(path) => Arc::new(
            SqlitePersistenceStore::connect(Path::new(path))
                .await
                .context("failed to open persistence store")?,
        ),
        None => Arc::new(InMemoryPersistenceStore::new()),
    };

    let default_profile = Profile {
        capability_groups: vec!["core".to_string()],
        max_refinement_rounds: runtime_config.default_max_refinement_rounds,
    };
    let profiles = Arc::new(StaticProfileCatalog::new(default_profile));
    let supervisor = Arc::new(TreeSupervisor::new(profiles.clone(), event_bus.clone(), persistence.clone()));

    let router = CliActionRouter::new(
        supervisor.clone(),
        profiles.clone(),
        event_bus.clone(),
        persistence.clone(),
        provider.clone(),
        catalog.clone(),
        runtime_config.mcp_servers.clone(),
        model_pool.clone(),
        embedding_model.clone(),
        runtime_config.lesson_manager_max,
        runtime_config.lesson_manager_sim_threshold,
        runtime_config.embedding_cache_capacity,
        runtime_config.consensus_retry_budget,
    );

    let root_agent_id = format!("agent-{}", uuid::Uuid::new_v4());
    let mcp_pool = Arc::new(McpClientPool::new(root_agent_id.clone()));
    for server in &runtime_config.mcp_servers {
        if let Err(err) = mcp_pool.connect(server).await {
            tracing::warn!(server = %server.name, error = %err, "mcp server failed to connect for root agent");
        }
    }
    router.register_mcp_pool(root_agent_id.clone(), mcp_pool.clone()).await;

    let root_profile = profiles.resolve(&args.profile);
    let config = AgentConfig {
        agent_id: root_agent_id.clone(),
        task_id: args.task_id.clone(),
        parent_id: None,
        profile_name: args.profile.clone(),
        model_pool: model_pool.clone(),
        capability_groups: root_profile.capability_groups,
        prompt_fields: PromptFields {
            role: args.role.clone(),
            style: String::new(),
            constraints: Vec::new(),
        },
        max_refinement_rounds: root_profile.max_refinement_rounds,
    };

    let deps = AgentDeps {
        provider: provider.clone(),
        catalog: catalog.clone(),
        router,
        event_bus: event_bus.clone(),
        persistence: persistence.clone(),
        mcp_pool,
        embedding_model,
        lesson_manager_max: runtime_config.lesson_manager_max,
        lesson_manager_sim_threshold: runtime_config.lesson_manager_sim_threshold,
        embedding_cache_capacity: runtime_config.embedding_cache_capacity,
        consensus_retry_budget: runtime_config.consensus_retry_budget,
        parent: None,
    };

    let root = supervisor
        .spawn(SpawnRequest { config, deps })
        .await
        .context("failed to spawn root agent")?;

    let mut events = event_bus.subscribe();
    tokio::spawn(async move {
        while let Ok(envelope) = events.recv().await {
            log_published_event(&envelope.event);
        }
    });

    let stdin = tokio::io::stdin();
    if !std::io::stdin().is_terminal() {
        tracing::info!(agent_id = %root_agent_id, "reading stimuli from a pipe");
    }
    let mut lines = BufReader::new(stdin).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        root.tell(UserMessage { content: line }).await.context("agent actor stopped")?;
    }

    supervisor.dismiss_tree(&root_agent_id, "stdin closed").await;
    event_bus.shutdown().await;
    Ok(())
}

fn log_published_event(event: &PublishedEvent) {
    match event {
        PublishedEvent::ActionCompleted { agent_id, action_id, result } => {
            println!("[{agent_id}] action {action_id} completed: {result}");
        }
        PublishedEvent::TodosUpdated { agent_id, items } => {
            println!("[{agent_id}] todos updated: {items}");
        }
        PublishedEvent::MessageSent { agent_id, recipient } => {
            println!("[{agent_id}] -> {recipient}");
        }
        other => tracing::debug!(?other, "published event"),
    }
}
