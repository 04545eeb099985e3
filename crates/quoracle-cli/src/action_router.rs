//! The concrete Action Router this binary plugs into the runtime (§4.7):
//! the runtime only depends on the `ActionRouter` trait, so this is where
//! "send_message" and "spawn" reach back into the `TreeSupervisor`, where
//! `shell`/`web_fetch`/`http_call` actually touch the outside world, and
//! where `mcp_tool` calls through a connected `McpClientPool`.
//!
//! Grounded on the teacher's tool-execution split (`agent/tool_execution.rs`
//! dispatches a function call to either a provider-native tool or an MCP
//! adapter's `call`): here the dispatch is by action name instead of a tool
//! catalog, since the runtime's action set is fixed by spec rather than
//! discovered from a provider.

use quoracle_llm::ModelSpec;
use quoracle_runtime::agent_messages::{AgentMessage, UpdateTodos};
use quoracle_runtime::config::McpServerConfig;
use quoracle_runtime::event_bus::EventBus;
use quoracle_runtime::history::{AgentConfig, PromptFields};
use quoracle_runtime::mcp::McpClientPool;
use quoracle_runtime::persistence::PersistenceStore;
use quoracle_runtime::router::{ActionResultEnvelope, ActionRouter, SchemaActionRouter};
use quoracle_runtime::{AgentDeps, Profile, ProfileCatalog, SpawnRequest, StaticProfileCatalog, TreeSupervisor};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::RwLock;

pub struct CliActionRouter {
    schema: SchemaActionRouter,
    supervisor: Arc<TreeSupervisor<StaticProfileCatalog>>,
    profiles: Arc<StaticProfileCatalog>,
    event_bus: Arc<EventBus>,
    persistence: Arc<dyn PersistenceStore>,
    provider: quoracle_llm::SharedLLMProvider,
    catalog: quoracle_llm::SharedModelCatalog,
    mcp_servers: Vec<McpServerConfig>,
    mcp_pools: RwLock<HashMap<String, Arc<McpClientPool>>>,
    default_model_pool: Vec<ModelSpec>,
    embedding_model: ModelSpec,
    lesson_manager_max: usize,
    lesson_manager_sim_threshold: f32,
    embedding_cache_capacity: u64,
    consensus_retry_budget: u32,
    http: reqwest::Client,
    self_ref: OnceLock<Weak<CliActionRouter>>,
}

#[allow(clippy::too_many_arguments)]
impl CliActionRouter {
    pub fn new(
        supervisor: Arc<TreeSupervisor<StaticProfileCatalog>>,
        profiles: Arc<StaticProfileCatalog>,
        event_bus: Arc<EventBus>,
        persistence: Arc<dyn PersistenceStore>,
        provider: quoracle_llm::SharedLLMProvider,
        catalog: quoracle_llm::SharedModelCatalog,
        mcp_servers: Vec<McpServerConfig>,
        default_model_pool: Vec<ModelSpec>,
        embedding_model: ModelSpec,
        lesson_manager_max: usize,
        lesson_manager_sim_threshold: f32,
        embedding_cache_capacity: u64,
        consensus_retry_budget: u32,
    ) -> Arc<Self> {
        let router = Arc::new(Self {
            schema: default_schema(),
            supervisor,
            profiles,
            event_bus,
            persistence,
            provider,
            catalog,
            mcp_servers,
            mcp_pools: RwLock::new(HashMap::new()),
            default_model_pool,
            embedding_model,
            lesson_manager_max,
            lesson_manager_sim_threshold,
            embedding_cache_capacity,
            consensus_retry_budget,
            http: reqwest::Client::new(),
            self_ref: OnceLock::new(),
        });
        let _ = router.self_ref.set(Arc::downgrade(&router));
        router
    }

    /// Connect a freshly spawned agent's MCP pool and make it reachable for
    /// `mcp_tool` actions. The root agent's pool is registered the same way
    /// from `main`.
    pub async fn register_mcp_pool(&self, agent_id: impl Into<String>, pool: Arc<McpClientPool>) {
        self.mcp_pools.write().await.insert(agent_id.into(), pool);
    }

    async fn connect_pool_for(&self, agent_id: &str) -> Arc<McpClientPool> {
        let pool = Arc::new(McpClientPool::new(agent_id));
        for server in &self.mcp_servers {
            if let Err(err) = pool.connect(server).await {
                tracing::warn!(agent_id, server = %server.name, error = %err, "mcp server failed to connect for spawned agent");
            }
        }
        self.register_mcp_pool(agent_id, pool.clone()).await;
        pool
    }

    fn self_arc(&self) -> Arc<dyn ActionRouter> {
        let arc: Arc<CliActionRouter> = self
            .self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("CliActionRouter always constructed via Self::new, which sets self_ref");
        arc
    }

    async fn do_spawn(&self, params: &Value, parent_agent_id: &str) -> Result<Value, String> {
        let profile_name = params["profile"]
            .as_str()
            .ok_or("spawn requires a 'profile' string")?
            .to_string();
        let profile: Profile = self.profiles.resolve(&profile_name);

        let model_pool = match params.get("model_pool").and_then(Value::as_array) {
            Some(models) => models
                .iter()
                .filter_map(Value::as_str)
                .map(ModelSpec::new)
                .collect::<Vec<_>>(),
            None => self.default_model_pool.clone(),
        };
        if model_pool.is_empty() {
            return Err("spawn: resolved model_pool is empty".to_string());
        }

        let role = params["role"].as_str().unwrap_or("a helpful sub-agent").to_string();
        let style = params["style"].as_str().unwrap_or("").to_string();
        let constraints = params["constraints"]
            .as_array()
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        let task_id = params["task_id"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{parent_agent_id}-child"));

        let child_agent_id = format!("agent-{}", uuid::Uuid::new_v4());
        let config = AgentConfig {
            agent_id: child_agent_id.clone(),
            task_id,
            parent_id: Some(parent_agent_id.to_string()),
            profile_name,
            model_pool,
            capability_groups: profile.capability_groups,
            prompt_fields: PromptFields { role, style, constraints },
            max_refinement_rounds: profile.max_refinement_rounds,
        };

        let mcp_pool = self.connect_pool_for(&child_agent_id).await;
        let deps = AgentDeps {
            provider: self.provider.clone(),
            catalog: self.catalog.clone(),
            router: self.self_arc(),
            event_bus: self.event_bus.clone(),
            persistence: self.persistence.clone(),
            mcp_pool,
            embedding_model: self.embedding_model.clone(),
            lesson_manager_max: self.lesson_manager_max,
            lesson_manager_sim_threshold: self.lesson_manager_sim_threshold,
            embedding_cache_capacity: self.embedding_cache_capacity,
            consensus_retry_budget: self.consensus_retry_budget,
            parent: None,
        };

        self.supervisor
            .spawn(SpawnRequest { config, deps })
            .await
            .map_err(|e| e.to_string())?;

        Ok(json!({ "child_agent_id": child_agent_id }))
    }

    async fn do_send_message(&self, params: &Value, sender: &str) -> Result<Value, String> {
        let to = params["to"].as_str().ok_or("send_message requires a 'to' string")?;
        let content = params["content"]
            .as_str()
            .ok_or("send_message requires a 'content' string")?
            .to_string();

        let recipient = self
            .supervisor
            .get(to)
            .await
            .ok_or_else(|| format!("unknown recipient agent_id: {to}"))?;
        recipient
            .tell(AgentMessage { sender: sender.to_string(), content })
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({ "delivered_to": to }))
    }

    async fn do_update_todos(&self, params: &Value, agent_id: &str) -> Result<Value, String> {
        let items = params["items"].as_array().cloned().unwrap_or_default();
        if let Some(actor_ref) = self.supervisor.get(agent_id).await {
            actor_ref
                .tell(UpdateTodos { items: items.clone() })
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok(json!({ "updated": true, "count": items.len() }))
    }

    async fn do_shell(&self, params: &Value) -> Result<Value, String> {
        let command = params["command"].as_str().ok_or("shell requires a 'command' string")?;
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| format!("failed to spawn shell: {e}"))?;
        Ok(json!({
            "exit_code": output.status.code(),
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
        }))
    }

    async fn do_http(&self, params: &Value, default_method: &str) -> Result<Value, String> {
        let url = params["url"].as_str().ok_or("missing 'url'")?;
        let method = params["method"].as_str().unwrap_or(default_method).to_uppercase();
        let method = reqwest::Method::from_bytes(method.as_bytes()).map_err(|e| e.to_string())?;

        let mut request = self.http.request(method, url);
        if let Some(headers) = params["headers"].as_object() {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(key, value);
                }
            }
        }
        if let Some(body) = params.get("body") {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(json!({ "status": status, "body": body }))
    }

    async fn do_mcp_tool(&self, params: &Value, agent_id: &str) -> Result<Value, String> {
        let server = params["server"].as_str().ok_or("mcp_tool requires a 'server' string")?;
        let tool = params["tool"].as_str().ok_or("mcp_tool requires a 'tool' string")?;
        let arguments = params["arguments"].as_object().cloned().unwrap_or_default();

        let pool = self
            .mcp_pools
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| format!("no mcp pool registered for agent {agent_id}"))?;

        let result = pool.call_tool(server, tool, arguments).await.map_err(|e| e.to_string())?;
        serde_json::to_value(result).map_err(|e| e.to_string())
    }
}

fn default_schema() -> SchemaActionRouter {
    SchemaActionRouter::new()
        .with_action("orient", vec![], vec![])
        .with_action("update_todos", vec!["items"], vec!["items"])
        .with_action("wait", vec![], vec![])
        .with_action("send_message", vec!["to", "content"], vec![])
        .with_action("spawn", vec!["profile"], vec!["constraints", "model_pool"])
        .with_action("shell", vec!["command"], vec![])
        .with_action("web_fetch", vec!["url"], vec![])
        .with_action("http_call", vec!["url"], vec![])
        .with_action("mcp_tool", vec!["server", "tool"], vec![])
        .with_action("answer_engine", vec!["query"], vec![])
}

#[async_trait::async_trait]
impl ActionRouter for CliActionRouter {
    fn validate_params(&self, action: &str, params: Value) -> Result<Value, String> {
        self.schema.validate_params(action, params)
    }

    async fn execute(&self, action: &str, params: &Value, agent_id: &str) -> Result<ActionResultEnvelope, String> {
        let value = match action {
            "orient" => Ok(json!({ "acknowledged": true })),
            "update_todos" => self.do_update_todos(params, agent_id).await,
            "wait" => Ok(json!({})),
            "send_message" => self.do_send_message(params, agent_id).await,
            "spawn" => self.do_spawn(params, agent_id).await,
            "shell" => self.do_shell(params).await,
            "web_fetch" => self.do_http(params, "GET").await,
            "http_call" => self.do_http(params, "GET").await,
            "mcp_tool" => self.do_mcp_tool(params, agent_id).await,
            "answer_engine" => Err("answer_engine has no backing implementation in this deployment".to_string()),
            other => Err(format!("unknown action: {other}")),
        }?;
        Ok(ActionResultEnvelope { ok: true, value })
    }
}
