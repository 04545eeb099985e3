//! Runtime configuration (SPEC_FULL.md §D).
//!
//! TOML-backed, grounded on the teacher's `config.rs`: `serde` derive with
//! `#[serde(default)]` on every field that has a sane runtime default, so a
//! config file only needs to name what it wants to override.

use crate::lesson_manager::{DEFAULT_MAX_LESSONS, DEFAULT_SIM_THRESHOLD};
use quoracle_llm::{ModelCatalogEntry, ModelPricing, StaticModelCatalog};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_max_refinement_rounds() -> u32 {
    4
}

fn default_max_lessons() -> usize {
    DEFAULT_MAX_LESSONS
}

fn default_sim_threshold() -> f32 {
    DEFAULT_SIM_THRESHOLD
}

fn default_embedding_cache_capacity() -> u64 {
    10_000
}

fn default_consensus_retry_budget() -> u32 {
    2
}

/// Top-level runtime config. Deserializes from a TOML file (or an inline
/// table embedded in a larger config) via `toml::from_str`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub models: Vec<ModelCatalogRow>,

    #[serde(default = "default_max_refinement_rounds")]
    pub default_max_refinement_rounds: u32,

    #[serde(default = "default_max_lessons")]
    pub lesson_manager_max: usize,

    #[serde(default = "default_sim_threshold")]
    pub lesson_manager_sim_threshold: f32,

    #[serde(default = "default_embedding_cache_capacity")]
    pub embedding_cache_capacity: u64,

    /// §9 open question (b): hard-coded at 2 in the source; exposed here as
    /// a per-deployment override rather than a per-profile one (the open
    /// question is left unresolved at the profile level, see DESIGN.md).
    #[serde(default = "default_consensus_retry_budget")]
    pub consensus_retry_budget: u32,

    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,

    #[serde(default)]
    pub persistence_path: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            default_max_refinement_rounds: default_max_refinement_rounds(),
            lesson_manager_max: default_max_lessons(),
            lesson_manager_sim_threshold: default_sim_threshold(),
            embedding_cache_capacity: default_embedding_cache_capacity(),
            consensus_retry_budget: default_consensus_retry_budget(),
            mcp_servers: Vec::new(),
            persistence_path: None,
        }
    }
}

/// One row of the model catalog, as it appears in config (§4.1's catalog is
/// read-only from the runtime's perspective; this is how a deployment
/// populates it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCatalogRow {
    pub model_spec: String,
    pub context_window: usize,
    pub output_limit: usize,
    #[serde(default)]
    pub input_cost_per_million: f64,
    #[serde(default)]
    pub output_cost_per_million: f64,
}

/// An MCP server this runtime's agents may connect to (§4's MCP Client
/// Subsystem; command/transport only — credentials are an external
/// collaborator per spec §1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn model_catalog(&self) -> StaticModelCatalog {
        let mut catalog = StaticModelCatalog::new();
        for row in &self.models {
            catalog.insert(
                row.model_spec.clone().into(),
                ModelCatalogEntry {
                    context_window: row.context_window,
                    output_limit: row.output_limit,
                    pricing: ModelPricing {
                        input_cost_per_million: row.input_cost_per_million,
                        output_cost_per_million: row.output_cost_per_million,
                    },
                },
            );
        }
        catalog
    }
}
