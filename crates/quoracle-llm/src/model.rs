//! Model specifications and the read-only model catalog (§4.1).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Identifies one LLM in an agent's model pool, e.g. `"anthropic/claude-opus-4"`.
///
/// Deliberately a thin string wrapper rather than a `(provider, model)` tuple:
/// the catalog, the query layer and every map keyed on "which model" only ever
/// need equality/ordering/hash, never provider-specific structure.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelSpec(pub String);

impl ModelSpec {
    pub fn new(spec: impl Into<String>) -> Self {
        Self(spec.into())
    }
}

impl std::fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ModelSpec {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ModelSpec {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Per-token pricing for a model, in USD per million tokens.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_cost_per_million: f64,
    pub output_cost_per_million: f64,
}

impl ModelPricing {
    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_cost_per_million
            + (output_tokens as f64 / 1_000_000.0) * self.output_cost_per_million
    }
}

/// Catalog entry for one model: the limits and prices the Token/Context
/// Calculator and Multi-LLM Query Layer need.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelCatalogEntry {
    pub context_window: usize,
    pub output_limit: usize,
    pub pricing: ModelPricing,
}

/// Models not present in the catalog default to this — the calculator must
/// never panic on an unknown model (§4.1).
pub const DEFAULT_CONTEXT_WINDOW: usize = 128_000;
pub const DEFAULT_OUTPUT_LIMIT: usize = 128_000;

fn default_entry() -> ModelCatalogEntry {
    ModelCatalogEntry {
        context_window: DEFAULT_CONTEXT_WINDOW,
        output_limit: DEFAULT_OUTPUT_LIMIT,
        pricing: ModelPricing::default(),
    }
}

/// Read-only source of per-model limits and pricing.
///
/// Treated as an external collaborator: this crate doesn't refresh it from
/// the network (that would be a provider's concern), it just exposes a
/// lookup surface callers can populate however they like (static table,
/// loaded config, cached HTTP response).
pub trait ModelCatalog: Send + Sync {
    fn entry(&self, model: &ModelSpec) -> ModelCatalogEntry;

    fn context_limit(&self, model: &ModelSpec) -> usize {
        self.entry(model).context_window
    }

    fn output_limit(&self, model: &ModelSpec) -> usize {
        self.entry(model).output_limit
    }

    fn pricing(&self, model: &ModelSpec) -> ModelPricing {
        self.entry(model).pricing
    }
}

/// A static, in-memory catalog. The common case: load once from config at
/// startup, share via `Arc<dyn ModelCatalog>` across every agent.
#[derive(Debug, Clone, Default)]
pub struct StaticModelCatalog {
    entries: HashMap<ModelSpec, ModelCatalogEntry>,
}

impl StaticModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, model: impl Into<ModelSpec>, entry: ModelCatalogEntry) -> Self {
        self.entries.insert(model.into(), entry);
        self
    }

    pub fn insert(&mut self, model: ModelSpec, entry: ModelCatalogEntry) {
        self.entries.insert(model, entry);
    }
}

impl ModelCatalog for StaticModelCatalog {
    fn entry(&self, model: &ModelSpec) -> ModelCatalogEntry {
        self.entries.get(model).copied().unwrap_or_else(default_entry)
    }
}

pub type SharedModelCatalog = Arc<dyn ModelCatalog>;
