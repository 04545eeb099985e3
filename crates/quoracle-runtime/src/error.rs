//! Structured error type for the runtime crate.
//!
//! One flat enum covering every branch point a caller actually needs to
//! distinguish (spec §7's error taxonomy), plus a catch-all for everything
//! else.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum RuntimeError {
    // --- Agent init / registry ---
    #[error("agent_id already registered: {agent_id}")]
    DuplicateAgentId { agent_id: String },

    #[error("parent '{parent_id}' is dismissing, spawn rejected")]
    ParentDismissing { parent_id: String },

    #[error("model_pool must not be empty")]
    EmptyModelPool,

    // --- Consensus (§4.6, §7) ---
    #[error("all responses failed schema validation")]
    AllResponsesInvalid,

    #[error("all models failed to respond")]
    AllModelsFailed,

    #[error("all models unavailable (permanent errors only)")]
    AllModelsUnavailable,

    // --- ACE (§4.2, §4.4) ---
    #[error("condensation could not reduce tokens below the context limit")]
    CondensationFailed,

    #[error("reflection failed after retries: {reason}")]
    ReflectionFailed { reason: String },

    // --- Action Router (contract only, §4.7) ---
    #[error("action {action} failed: {reason}")]
    ActionFailed { action: String, reason: String },

    #[error("action params invalid for {action}: {reason}")]
    InvalidParams { action: String, reason: String },

    // --- MCP subsystem (§4.9, §7) ---
    #[error("mcp server '{server}' never reported capabilities within the init timeout")]
    McpInitTimeout { server: String },

    #[error("mcp server '{server}' crashed: {reason}")]
    McpServerCrashed { server: String, reason: String },

    // --- Model-pool switching (§4.10) ---
    #[error("model pool switch failed: {reason}")]
    ModelPoolSwitch { reason: String },

    // --- Generic internal ---
    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Retryable per spec §4.8's consensus-cycle retry policy: up to
    /// `consensus_retry_count < 2` retries before parent notification.
    pub fn is_consensus_retryable(&self) -> bool {
        matches!(
            self,
            RuntimeError::AllResponsesInvalid | RuntimeError::AllModelsFailed
        )
    }
}

impl From<anyhow::Error> for RuntimeError {
    fn from(e: anyhow::Error) -> Self {
        RuntimeError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(e: serde_json::Error) -> Self {
        RuntimeError::Internal(format!("serialization error: {e}"))
    }
}

impl From<quoracle_llm::LLMError> for RuntimeError {
    fn from(e: quoracle_llm::LLMError) -> Self {
        RuntimeError::Internal(e.to_string())
    }
}
