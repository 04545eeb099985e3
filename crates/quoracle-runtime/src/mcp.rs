//! MCP Client Subsystem (§2's "MCP Client Subsystem" row; §7's MCP init
//! timeout row): a per-agent connection pool to external tool servers, with
//! crash propagation and an idle capability poll.
//!
//! Grounded on the teacher's MCP wiring (`crates/agent/src/agent/protocol.rs`):
//! `rmcp::transport::child_process::TokioChildProcess` + `serve_client` to
//! spawn and speak to a stdio MCP server, `RunningService` kept alive for
//! the connection's lifetime. The runtime only needs the behavioral
//! contract spec §1 grants it (connect, list capabilities, detect crash) —
//! tool *invocation* is routed through the Action Router, an external
//! collaborator.

use crate::config::McpServerConfig;
use crate::error::RuntimeError;
use rmcp::handler::client::ClientHandler;
use rmcp::model::ServerCapabilities;
use rmcp::service::{serve_client, RoleClient, RunningService};
use rmcp::transport::child_process::TokioChildProcess;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::RwLock;

/// The runtime core never drives MCP elicitation itself (§1: action
/// implementations are external collaborators) so the client side of the
/// protocol needs no behavior beyond `ClientHandler`'s defaults.
#[derive(Clone, Default)]
struct NoopClientHandler;

impl ClientHandler for NoopClientHandler {}

/// Default time an MCP server is given to report its capabilities after the
/// handshake before the connection is considered hung (§7 `McpInitTimeout`).
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// How often an idle client is polled to confirm the server process is
/// still responsive ("idle capability poll" per §2).
pub const DEFAULT_IDLE_POLL_INTERVAL: Duration = Duration::from_secs(60);

struct McpConnection {
    service: RunningService<RoleClient, NoopClientHandler>,
    capabilities: ServerCapabilities,
}

/// One agent's pool of MCP server connections (§3's `mcp_client_handle`).
/// Connections are keyed by server name; a crashed connection is removed
/// from the pool so the next reference to it surfaces as a fresh
/// `McpServerCrashed` rather than silently hanging.
pub struct McpClientPool {
    agent_id: String,
    connections: RwLock<HashMap<String, Arc<McpConnection>>>,
}

impl McpClientPool {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Spawn and connect to a stdio MCP server, waiting up to
    /// `DEFAULT_INIT_TIMEOUT` for it to report capabilities (§7).
    pub async fn connect(&self, config: &McpServerConfig) -> Result<(), RuntimeError> {
        let mut command = Command::new(&config.command);
        command.args(&config.args);
        for (key, value) in &config.env {
            command.env(key, value);
        }

        let transport = TokioChildProcess::new(command).map_err(|e| RuntimeError::McpServerCrashed {
            server: config.name.clone(),
            reason: format!("failed to spawn: {e}"),
        })?;

        let service = tokio::time::timeout(
            DEFAULT_INIT_TIMEOUT,
            serve_client(NoopClientHandler, transport),
        )
        .await
            .map_err(|_| RuntimeError::McpInitTimeout {
                server: config.name.clone(),
            })?
            .map_err(|e| RuntimeError::McpServerCrashed {
                server: config.name.clone(),
                reason: extract_crash_reason(&e.to_string()),
            })?;

        let capabilities = service.peer_info().capabilities.clone();

        self.connections.write().await.insert(
            config.name.clone(),
            Arc::new(McpConnection {
                service,
                capabilities,
            }),
        );

        tracing::info!(
            agent_id = %self.agent_id,
            server = %config.name,
            "mcp server connected"
        );
        Ok(())
    }

    pub async fn capabilities(&self, server: &str) -> Option<ServerCapabilities> {
        self.connections
            .read()
            .await
            .get(server)
            .map(|c| c.capabilities.clone())
    }

    pub async fn is_connected(&self, server: &str) -> bool {
        self.connections.read().await.contains_key(server)
    }

    /// Invoke a tool on a connected server (§1: tool invocation is the
    /// Action Router's job; this is the primitive it calls through).
    pub async fn call_tool(
        &self,
        server: &str,
        tool_name: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<rmcp::model::CallToolResult, RuntimeError> {
        let connection = {
            let guard = self.connections.read().await;
            guard.get(server).cloned()
        };
        let Some(connection) = connection else {
            return Err(RuntimeError::McpServerCrashed {
                server: server.to_string(),
                reason: "not connected".into(),
            });
        };

        connection
            .service
            .peer()
            .call_tool(rmcp::model::CallToolRequestParam {
                name: tool_name.to_string().into(),
                arguments: Some(arguments),
            })
            .await
            .map_err(|e| RuntimeError::ActionFailed {
                action: "mcp_tool".to_string(),
                reason: e.to_string(),
            })
    }

    /// Idle capability poll: re-request the tool list to confirm the
    /// server process is still alive. A failure here is treated as a crash
    /// and the connection is dropped from the pool.
    pub async fn poll(&self, server: &str) -> Result<(), RuntimeError> {
        let connection = {
            let guard = self.connections.read().await;
            guard.get(server).cloned()
        };
        let Some(connection) = connection else {
            return Err(RuntimeError::McpServerCrashed {
                server: server.to_string(),
                reason: "not connected".into(),
            });
        };

        match connection.service.peer().list_all_tools().await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.connections.write().await.remove(server);
                Err(RuntimeError::McpServerCrashed {
                    server: server.to_string(),
                    reason: extract_crash_reason(&e.to_string()),
                })
            }
        }
    }

    /// Graceful shutdown of every connection (§4.9 Dismiss tree: "so
    /// cleanup callbacks — including any MCP client shutdown — can
    /// complete"). Best-effort; individual failures are logged, not
    /// propagated, matching the tree teardown's best-effort policy.
    pub async fn shutdown_all(&self) {
        let connections = {
            let mut guard = self.connections.write().await;
            std::mem::take(&mut *guard)
        };
        for (name, connection) in connections {
            if let Ok(connection) = Arc::try_unwrap(connection) {
                if let Err(e) = connection.service.cancel().await {
                    tracing::warn!(agent_id = %self.agent_id, server = %name, error = %e, "mcp shutdown failed");
                }
            }
        }
    }

    pub async fn server_names(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }
}

/// Extract a readable crash reason from an rmcp transport error string
/// (§7's `{:initialization_timeout, context: [...]}` pattern generalizes to:
/// surface enough of the underlying error that a caller can diagnose
/// without needing the raw transport exception type).
fn extract_crash_reason(raw: &str) -> String {
    raw.lines().next().unwrap_or(raw).trim().to_string()
}
