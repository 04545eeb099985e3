//! `quoracle-llm` — the opaque `Generate`/`Embed` contract the runtime speaks to.
//!
//! This crate deliberately knows nothing about any concrete provider's wire
//! format. Per spec §1, LLM wire protocols are an external collaborator: the
//! runtime only needs `Generate(messages, model_spec, opts) -> Response` and
//! `Embed(text, model_spec) -> vector`. A real deployment plugs in adapters
//! that implement [`LLMProvider`] against Anthropic/OpenAI/etc — none of that
//! lives here.

pub mod chat;
pub mod error;
pub mod model;
pub mod usage;

pub use chat::{ChatMessage, ChatRole};
pub use error::LLMError;
pub use model::{ModelCatalog, ModelCatalogEntry, ModelPricing, ModelSpec, SharedModelCatalog};
pub use usage::{CostAccumulator, CostSummary, Usage};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Reasoning-effort hint for "thinking" model families (o1/o3, Claude extended
/// thinking, ...). Ignored by providers that don't support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

/// Extended-thinking budget for model families that expose one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThinkingConfig {
    pub budget_tokens: u32,
}

/// Provider-specific options the Consensus Engine / Multi-LLM Query Layer
/// build per model_spec before dispatch (§4.6): reasoning effort, prompt
/// cache hints, thinking config, and the per-call token/temperature budget.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub max_tokens: usize,
    pub temperature: f32,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub prompt_cache: bool,
    pub thinking: Option<ThinkingConfig>,
}

/// Why a generation stopped. `Length` signals the caller may want to raise
/// `max_tokens`; `Error` is surfaced by an adapter that detected a
/// provider-side failure after a 200 response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    Error,
}

/// A single `generate` response. `text` is the raw model output — the
/// Consensus Engine is responsible for parsing it as a decision envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub text: String,
    pub usage: Usage,
    pub finish_reason: FinishReason,
}

/// The opaque contract every model in an agent's pool is queried through.
///
/// Implementations are expected to handle their own wire protocol, auth, and
/// low-level timeouts; the runtime's Multi-LLM Query Layer (§4.5) owns
/// retry/backoff policy on top of whatever this trait returns.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        model: &ModelSpec,
        opts: &GenerateOptions,
    ) -> Result<GenerateResponse, LLMError>;

    async fn embed(&self, text: &str, model: &ModelSpec) -> Result<Vec<f32>, LLMError>;
}

pub type SharedLLMProvider = std::sync::Arc<dyn LLMProvider>;
