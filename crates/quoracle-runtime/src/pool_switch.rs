//! History Transfer / Model-Pool Switching (§4.10).
//!
//! Re-keys an agent's per-model state when its model pool changes at
//! runtime. Per §5, the caller (the Agent Core actor) is expected to
//! serialize this against consensus itself — a `kameo` actor only processes
//! one message at a time, which gives the same "no consensus in flight
//! during the switch" guarantee the source got from OTP call-serialization.

use crate::condenser;
use crate::error::RuntimeError;
use crate::history::AgentState;
use crate::lesson_manager::EmbeddingCache;
use crate::tokens::{TokenCalculator, history_tokens};
use quoracle_llm::{LLMProvider, ModelSpec, SharedModelCatalog};

/// `SwitchModelPool` (§4.10). Validates `new_pool` is non-empty, picks a
/// source model from the old histories (the one with the most tokens that
/// still fits `target_limit`, or the smallest repeatedly condensed until it
/// fits), then re-keys `model_histories`, `context_lessons`, and
/// `model_states` under `new_pool`, all sharing the chosen source's state.
pub async fn switch_model_pool(
    provider: &dyn LLMProvider,
    catalog: &SharedModelCatalog,
    cache: &EmbeddingCache,
    embedding_model: &ModelSpec,
    state: &mut AgentState,
    new_pool: Vec<ModelSpec>,
    lesson_max: usize,
    sim_threshold: f32,
) -> Result<(), RuntimeError> {
    if new_pool.is_empty() {
        return Err(RuntimeError::EmptyModelPool);
    }

    let calculator = TokenCalculator::new(catalog.clone());
    let target_limit = new_pool
        .iter()
        .map(|m| calculator.context_limit(m))
        .min()
        .unwrap_or(usize::MAX);

    let source_model = select_source_model(state, &calculator, target_limit);
    let source_model = match source_model {
        Some(m) => m,
        None => {
            condense_until_fits(
                provider,
                embedding_model,
                cache,
                &calculator,
                state,
                target_limit,
                lesson_max,
                sim_threshold,
            )
            .await?
        }
    };

    let history = state
        .model_histories
        .get(&source_model)
        .cloned()
        .unwrap_or_default();
    let lessons = state
        .context_lessons
        .get(&source_model)
        .cloned()
        .unwrap_or_default();
    let summary = state.model_states.get(&source_model).cloned();

    state.model_histories.clear();
    state.context_lessons.clear();
    state.model_states.clear();
    for model in &new_pool {
        state.model_histories.insert(model.clone(), history.clone());
        state.context_lessons.insert(model.clone(), lessons.clone());
        if let Some(summary) = &summary {
            state.model_states.insert(model.clone(), summary.clone());
        }
    }
    state.config.model_pool = new_pool;

    debug_assert!(state.model_pool_consistent());
    Ok(())
}

/// Among old histories whose token count fits `target_limit`, pick the one
/// with the *most* tokens (preserves the most context). `None` if none fit.
fn select_source_model(
    state: &AgentState,
    calculator: &TokenCalculator,
    target_limit: usize,
) -> Option<ModelSpec> {
    let _ = calculator;
    state
        .model_histories
        .iter()
        .map(|(model, entries)| (model.clone(), history_tokens(entries)))
        .filter(|(_, tokens)| *tokens <= target_limit)
        .max_by_key(|(_, tokens)| *tokens)
        .map(|(model, _)| model)
}

/// No history fits: take the smallest and repeatedly condense it until it
/// does, or fail with `condensation_failed` if condensation stops making
/// progress (§4.10).
async fn condense_until_fits(
    provider: &dyn LLMProvider,
    embedding_model: &ModelSpec,
    cache: &EmbeddingCache,
    calculator: &TokenCalculator,
    state: &mut AgentState,
    target_limit: usize,
    lesson_max: usize,
    sim_threshold: f32,
) -> Result<ModelSpec, RuntimeError> {
    let smallest = state
        .model_histories
        .iter()
        .map(|(model, entries)| (model.clone(), history_tokens(entries)))
        .min_by_key(|(_, tokens)| *tokens)
        .map(|(model, _)| model)
        .ok_or(RuntimeError::CondensationFailed)?;

    loop {
        let tokens = history_tokens(&state.model_histories[&smallest]);
        if tokens <= target_limit {
            return Ok(smallest);
        }

        let before = tokens;
        condenser::condense_model(
            provider,
            embedding_model,
            cache,
            calculator,
            state,
            &smallest,
            lesson_max,
            sim_threshold,
        )
        .await
        .map_err(|_| RuntimeError::CondensationFailed)?;

        let after = history_tokens(&state.model_histories[&smallest]);
        if after >= before {
            return Err(RuntimeError::CondensationFailed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{AgentConfig, HistoryEntry, PromptFields};
    use crate::testing::FakeLLMProvider;
    use quoracle_llm::{ModelCatalogEntry, ModelPricing, StaticModelCatalog};
    use std::sync::Arc;

    fn config(pool: Vec<&str>) -> AgentConfig {
        AgentConfig {
            agent_id: "a1".into(),
            task_id: "t1".into(),
            parent_id: None,
            profile_name: "default".into(),
            model_pool: pool.into_iter().map(ModelSpec::new).collect(),
            capability_groups: vec![],
            prompt_fields: PromptFields {
                role: "x".into(),
                style: "".into(),
                constraints: vec![],
            },
            max_refinement_rounds: 4,
        }
    }

    fn catalog_with(entries: &[(&str, usize)]) -> quoracle_llm::SharedModelCatalog {
        let mut catalog = StaticModelCatalog::new();
        for (model, window) in entries {
            catalog.insert(
                ModelSpec::new(*model),
                ModelCatalogEntry {
                    context_window: *window,
                    output_limit: *window / 2,
                    pricing: ModelPricing::default(),
                },
            );
        }
        Arc::new(catalog)
    }

    #[tokio::test]
    async fn switching_rekeys_histories_to_new_pool() {
        let mut state = AgentState::new(config(vec!["mA"]));
        state.append_to_all_histories(HistoryEntry::event("hello", 1));
        let catalog = catalog_with(&[("mA", 1_000), ("mB", 1_000), ("mC", 1_000)]);
        let cache = EmbeddingCache::new(10);
        let provider = FakeLLMProvider::with_responses("mA", vec![]);

        switch_model_pool(
            &provider,
            &catalog,
            &cache,
            &ModelSpec::new("mA"),
            &mut state,
            vec![ModelSpec::new("mB"), ModelSpec::new("mC")],
            100,
            0.9,
        )
        .await
        .expect("switch should succeed");

        assert!(state.model_pool_consistent());
        assert_eq!(state.model_histories.len(), 2);
        assert_eq!(state.model_histories[&ModelSpec::new("mB")].len(), 1);
        assert_eq!(state.model_histories[&ModelSpec::new("mC")].len(), 1);
    }

    #[tokio::test]
    async fn empty_new_pool_is_rejected() {
        let mut state = AgentState::new(config(vec!["mA"]));
        let catalog = catalog_with(&[("mA", 1_000)]);
        let cache = EmbeddingCache::new(10);
        let provider = FakeLLMProvider::with_responses("mA", vec![]);

        let err = switch_model_pool(
            &provider,
            &catalog,
            &cache,
            &ModelSpec::new("mA"),
            &mut state,
            vec![],
            100,
            0.9,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RuntimeError::EmptyModelPool));
    }

    #[tokio::test]
    async fn picks_history_with_most_tokens_that_still_fits() {
        let mut state = AgentState::new(config(vec!["mA", "mB"]));
        state
            .model_histories
            .insert(ModelSpec::new("mA"), vec![HistoryEntry::event("short", 1)]);
        state.model_histories.insert(
            ModelSpec::new("mB"),
            vec![HistoryEntry::event("x".repeat(400), 1)],
        );
        let catalog = catalog_with(&[("mA", 1_000), ("mB", 1_000), ("mC", 1_000)]);
        let cache = EmbeddingCache::new(10);
        let provider = FakeLLMProvider::with_responses("mA", vec![]);

        switch_model_pool(
            &provider,
            &catalog,
            &cache,
            &ModelSpec::new("mA"),
            &mut state,
            vec![ModelSpec::new("mC")],
            100,
            0.9,
        )
        .await
        .expect("switch should succeed");

        // mB's history (more tokens, still fits) should have been selected.
        assert_eq!(
            state.model_histories[&ModelSpec::new("mC")][0].timestamp,
            1
        );
        assert!(
            matches!(&state.model_histories[&ModelSpec::new("mC")][0].content, crate::history::HistoryEntryContent::Text(t) if t.len() > 100)
        );
    }
}
