//! Token usage accounting, aggregated across a multi-LLM query fan-out (§4.5).

use crate::model::ModelPricing;
use serde::{Deserialize, Serialize};

/// Token usage for a single `generate` call.
///
/// Field names follow the union of what the major provider families report;
/// a provider adapter normalizes into this shape so the query layer never
/// needs to know which wire format produced it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_tokens: u64,
    pub cached_tokens: u64,
    pub cache_creation_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
        self.cached_tokens += other.cached_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
    }
}

/// Cost roll-up, either computed per-request or accumulated across a whole
/// consensus cycle (including embedding calls made by the Lesson Manager).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CostSummary {
    pub input_cost_usd: f64,
    pub output_cost_usd: f64,
}

impl CostSummary {
    pub fn total(&self) -> f64 {
        self.input_cost_usd + self.output_cost_usd
    }

    pub fn add(&mut self, other: &CostSummary) {
        self.input_cost_usd += other.input_cost_usd;
        self.output_cost_usd += other.output_cost_usd;
    }

    pub fn from_usage(usage: &Usage, pricing: &ModelPricing) -> Self {
        Self {
            input_cost_usd: (usage.input_tokens as f64 / 1_000_000.0)
                * pricing.input_cost_per_million,
            output_cost_usd: (usage.output_tokens as f64 / 1_000_000.0)
                * pricing.output_cost_per_million,
        }
    }
}

/// Thread-safe running total for a consensus cycle. The query layer and the
/// lesson manager's embedding calls both append to the same accumulator so
/// a single cost figure can be attached to consensus `meta`.
#[derive(Debug, Default)]
pub struct CostAccumulator(std::sync::Mutex<CostSummary>);

impl CostAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, cost: CostSummary) {
        let mut guard = self.0.lock().expect("cost accumulator mutex poisoned");
        guard.add(&cost);
    }

    pub fn snapshot(&self) -> CostSummary {
        *self.0.lock().expect("cost accumulator mutex poisoned")
    }
}
