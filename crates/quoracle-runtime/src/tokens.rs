//! Token/Context Calculator (§4.1).
//!
//! Counts tokens per history entry and resolves per-model context/output
//! limits from a read-only model catalog. The encoder is a fixed
//! cl100k-equivalent estimator rather than a full BPE table: exact tokenizer
//! parity with any one provider isn't the contract here (§1 treats LLM wire
//! protocols as external collaborators), only a stable, monotonic estimate
//! the condenser and query layer can budget against.

use crate::history::{HistoryEntry, HistoryEntryContent};
use quoracle_llm::{ChatMessage, ModelCatalog, ModelSpec};

/// Average characters per token for the cl100k family, used as the
/// estimator's scaling constant. Deliberately conservative (slightly
/// under-counts tokens) so budget checks err on the side of leaving headroom.
const CHARS_PER_TOKEN: f64 = 3.8;

/// Estimate the token count of a string without a real tokenizer.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    ((text.chars().count() as f64) / CHARS_PER_TOKEN).ceil() as usize
}

pub fn history_entry_tokens(entry: &HistoryEntry) -> usize {
    match &entry.content {
        HistoryEntryContent::Decision(decision) => {
            estimate_tokens(&format!("{:?} {}", decision.params, decision.reasoning))
        }
        HistoryEntryContent::Text(text) => estimate_tokens(text),
    }
}

pub fn history_tokens(entries: &[HistoryEntry]) -> usize {
    entries.iter().map(history_entry_tokens).sum()
}

pub fn messages_tokens(messages: &[ChatMessage], excluding_system: bool) -> usize {
    messages
        .iter()
        .filter(|m| !(excluding_system && m.role == quoracle_llm::ChatRole::System))
        .map(|m| estimate_tokens(&m.content))
        .sum()
}

pub struct TokenCalculator {
    catalog: quoracle_llm::SharedModelCatalog,
}

impl TokenCalculator {
    pub fn new(catalog: quoracle_llm::SharedModelCatalog) -> Self {
        Self { catalog }
    }

    pub fn context_limit(&self, model: &ModelSpec) -> usize {
        self.catalog.context_limit(model)
    }

    pub fn output_limit(&self, model: &ModelSpec) -> usize {
        self.catalog.output_limit(model)
    }

    /// `max_tokens` for a generate call: what's left of the context window
    /// after `input_tokens`, capped by the model's output limit, floored at 1
    /// (§4.2's reflection prompt budget and §4.6's per-model query build both
    /// use this formula).
    pub fn dynamic_max_tokens(&self, model: &ModelSpec, input_tokens: usize) -> usize {
        let remaining = self.context_limit(model).saturating_sub(input_tokens);
        remaining.min(self.output_limit(model)).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::Decision;
    use quoracle_llm::{ModelCatalogEntry, ModelPricing, StaticModelCatalog};
    use std::sync::Arc;

    #[test]
    fn empty_string_is_zero_tokens() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn longer_text_yields_more_tokens() {
        assert!(estimate_tokens("a much longer sentence than the other one") > estimate_tokens("short"));
    }

    #[test]
    fn decision_entry_tokenizes_params_and_reasoning() {
        let entry = HistoryEntry::decision(Decision {
            action: "orient".into(),
            params: serde_json::json!({"focus": "x"}),
            reasoning: "because".into(),
            wait: crate::history::Wait::No,
            auto_complete_todo: false,
        });
        assert!(history_entry_tokens(&entry) > 0);
    }

    #[test]
    fn dynamic_max_tokens_never_zero() {
        let catalog: quoracle_llm::SharedModelCatalog = Arc::new(
            StaticModelCatalog::new().with_entry(
                "acme/small",
                ModelCatalogEntry {
                    context_window: 100,
                    output_limit: 50,
                    pricing: ModelPricing::default(),
                },
            ),
        );
        let calc = TokenCalculator::new(catalog);
        let spec = ModelSpec::new("acme/small");
        assert_eq!(calc.dynamic_max_tokens(&spec, 1_000), 1);
    }
}
