//! ACE Condenser (§4.4): orchestrates the Reflector + Lesson Manager,
//! removing oldest history entries until a model's history fits its context
//! window.

use crate::error::RuntimeError;
use crate::history::HistoryEntry;
use crate::lesson_manager::{self, EmbeddingCache};
use crate::reflector::{self, ReflectionFailure};
use crate::tokens::{TokenCalculator, history_entry_tokens, history_tokens};
use quoracle_llm::{LLMProvider, ModelSpec};

use crate::history::AgentState;

/// Whether condensation should even run for this model (§4.4: "reactive; no
/// headroom").
pub fn needs_condensation(calculator: &TokenCalculator, model: &ModelSpec, entries: &[HistoryEntry]) -> bool {
    history_tokens(entries) >= calculator.context_limit(model)
}

/// Condense one model's history in place. Removes the oldest entries
/// accounting for more than 80% of current tokens, reflects on them, merges
/// resulting lessons via the Lesson Manager, and replaces that model's
/// situational summary.
pub async fn condense_model(
    provider: &dyn LLMProvider,
    embedding_model: &ModelSpec,
    cache: &EmbeddingCache,
    calculator: &TokenCalculator,
    state: &mut AgentState,
    model: &ModelSpec,
    lesson_max: usize,
    sim_threshold: f32,
) -> Result<(), RuntimeError> {
    let history = state
        .model_histories
        .get(model)
        .cloned()
        .unwrap_or_default();

    let total_tokens = history_tokens(&history);
    let drop_threshold = (total_tokens as f64 * 0.8).ceil() as usize;

    // If even the single newest entry alone can't fit, no drop order can
    // recover — the model has nothing left to keep. Catch this up front
    // rather than letting the loop below silently sweep the whole history
    // into `dropped` and leave `kept` empty.
    if let Some(newest) = history.first() {
        if history_entry_tokens(newest) >= calculator.context_limit(model) {
            return Err(RuntimeError::CondensationFailed);
        }
    }

    // Histories are stored newest-at-head (§3), so the oldest entries sit at
    // the tail. Walk from the tail inward, oldest-first, collecting the slice
    // to drop; `dropped` ends up oldest-first, matching what the Reflector
    // expects for the slice "about to be dropped".
    let mut dropped = Vec::new();
    let mut dropped_tokens = 0usize;
    let mut keep_up_to = history.len();
    for (idx, entry) in history.iter().enumerate().rev() {
        if dropped_tokens > drop_threshold {
            break;
        }
        dropped_tokens += history_entry_tokens(entry);
        dropped.push(entry.clone());
        keep_up_to = idx;
    }

    if dropped.is_empty() {
        return Err(RuntimeError::CondensationFailed);
    }

    let kept = history[..keep_up_to].to_vec();
    if kept.is_empty() {
        // Every entry ended up in the drop set — a single oversized entry
        // (or several) consumed the whole 80% budget and then some, leaving
        // nothing to keep. No progress is possible.
        return Err(RuntimeError::CondensationFailed);
    }

    match reflector::reflect(provider, calculator, model, &dropped).await {
        Ok(output) => {
            let existing = state.context_lessons.remove(model).unwrap_or_default();
            let merged = lesson_manager::accumulate(
                provider,
                embedding_model,
                cache,
                existing,
                output.lessons,
                lesson_max,
                sim_threshold,
            )
            .await;
            state.context_lessons.insert(model.clone(), merged);
            if let Some(summary) = output.state {
                state.model_states.insert(model.clone(), summary);
            }
        }
        Err(ReflectionFailure::MalformedResponseAfterRetries)
        | Err(ReflectionFailure::ReflectionFailed) => {
            // §4.2 Failure: drop the slice, emit no lessons. Condensation
            // itself still succeeds — the point was to shrink the history.
        }
    }

    state.model_histories.insert(model.clone(), kept);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{AgentConfig, PromptFields};
    use crate::testing::FakeLLMProvider;
    use quoracle_llm::{ModelCatalogEntry, ModelPricing, StaticModelCatalog};
    use std::sync::Arc;

    fn state_with_history(entries: usize, tokens_each: usize) -> AgentState {
        let config = AgentConfig {
            agent_id: "a1".into(),
            task_id: "t1".into(),
            parent_id: None,
            profile_name: "default".into(),
            model_pool: vec![ModelSpec::new("mA")],
            capability_groups: vec![],
            prompt_fields: PromptFields {
                role: "x".into(),
                style: "".into(),
                constraints: vec![],
            },
            max_refinement_rounds: 4,
        };
        let mut state = AgentState::new(config);
        let filler = "x".repeat(tokens_each * 4);
        let history = (0..entries)
            .map(|i| HistoryEntry::event(filler.clone(), i as i64))
            .collect();
        state.model_histories.insert(ModelSpec::new("mA"), history);
        state
    }

    #[tokio::test]
    async fn condensation_removes_oldest_entries_and_shrinks_below_limit() {
        let catalog: quoracle_llm::SharedModelCatalog = Arc::new(
            StaticModelCatalog::new().with_entry(
                "mA",
                ModelCatalogEntry {
                    context_window: 1_000,
                    output_limit: 500,
                    pricing: ModelPricing::default(),
                },
            ),
        );
        let calculator = TokenCalculator::new(catalog);
        let mut state = state_with_history(20, 60);
        let model = ModelSpec::new("mA");

        assert!(needs_condensation(
            &calculator,
            &model,
            &state.model_histories[&model]
        ));

        let provider = FakeLLMProvider::with_responses(
            "mA",
            vec![Ok(
                r#"{"lessons":[{"type":"factual","content":"learned something"}],"state":[{"summary":"ok"}]}"#
                    .to_string(),
            )],
        );
        let cache = EmbeddingCache::new(100);

        condense_model(
            &provider,
            &model,
            &cache,
            &calculator,
            &mut state,
            &model,
            crate::lesson_manager::DEFAULT_MAX_LESSONS,
            crate::lesson_manager::DEFAULT_SIM_THRESHOLD,
        )
        .await
        .expect("condensation should succeed");

        assert!(history_tokens(&state.model_histories[&model]) < 1_000);
        assert!(!state.context_lessons[&model].is_empty());
        assert_eq!(state.model_states[&model], "ok");
    }

    #[tokio::test]
    async fn a_single_entry_exceeding_the_context_limit_raises_condensation_failed() {
        let catalog: quoracle_llm::SharedModelCatalog = Arc::new(
            StaticModelCatalog::new().with_entry(
                "mA",
                ModelCatalogEntry {
                    context_window: 1_000,
                    output_limit: 500,
                    pricing: ModelPricing::default(),
                },
            ),
        );
        let calculator = TokenCalculator::new(catalog);
        // One entry alone already exceeds the context window; no drop order
        // can make it fit.
        let mut state = state_with_history(1, 2_000);
        let model = ModelSpec::new("mA");

        let provider = FakeLLMProvider::with_responses("mA", vec![]);
        let cache = EmbeddingCache::new(100);

        let err = condense_model(
            &provider,
            &model,
            &cache,
            &calculator,
            &mut state,
            &model,
            crate::lesson_manager::DEFAULT_MAX_LESSONS,
            crate::lesson_manager::DEFAULT_SIM_THRESHOLD,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RuntimeError::CondensationFailed));
        // The original history is untouched — condensation made no progress
        // and must not have silently emptied it.
        assert_eq!(state.model_histories[&model].len(), 1);
    }
}
