//! Consensus Engine (§4.6): parse → validate-and-coerce → cluster →
//! majority-or-refine loop → single decision.

use crate::condenser;
use crate::error::RuntimeError;
use crate::history::{AgentState, Decision, DecisionFingerprint, Wait};
use crate::lesson_manager::EmbeddingCache;
use crate::query_layer::{self, Concurrency, PoolQueryResult};
use crate::router::ActionRouter;
use quoracle_llm::{
    ChatMessage, CostAccumulator, CostSummary, GenerateOptions, ModelCatalog, ModelSpec,
    SharedLLMProvider, SharedModelCatalog,
};
use serde::Deserialize;
use std::collections::HashMap;

/// Collaborators needed to condense a single model's history mid-round when
/// its built request still exceeds the context window (§4.6's "critical"
/// per-model query build step). Bundled so `run_consensus`/`run_round` don't
/// need half a dozen extra positional parameters.
pub struct CondenseDeps<'a> {
    pub embedding_model: &'a ModelSpec,
    pub cache: &'a EmbeddingCache,
    pub lesson_manager_max: usize,
    pub lesson_manager_sim_threshold: f32,
}

/// Raw decision envelope as returned by a model, before coercion (§6).
#[derive(Debug, Deserialize)]
struct RawDecision {
    action: String,
    #[serde(default)]
    params: serde_json::Value,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    wait: Wait,
    #[serde(default)]
    auto_complete_todo: bool,
}

pub struct ConsensusMeta {
    pub round: u32,
    pub cluster_votes: Vec<(String, usize)>,
    pub temperatures_used: HashMap<ModelSpec, f32>,
    pub cost: Option<CostSummary>,
}

pub enum ConsensusOutcome {
    Consensus {
        decision: Decision,
        meta: ConsensusMeta,
    },
    ForcedDecision {
        decision: Decision,
        meta: ConsensusMeta,
    },
}

struct SurvivingResponse {
    model: ModelSpec,
    decision: Decision,
    fingerprint: DecisionFingerprint,
}

/// `BuildConversationMessages` (§4.6 step 1-3): history in chronological
/// order (oldest first — histories are stored newest-at-head per §3), ACE
/// lessons/state injected into the first user message (never a system
/// message — load-bearing per §9), TODOs and children-context folded into
/// the final user message.
pub fn build_conversation_messages(state: &AgentState, model: &ModelSpec) -> Vec<ChatMessage> {
    let history = state.model_histories.get(model).cloned().unwrap_or_default();
    let mut messages: Vec<ChatMessage> = history
        .iter()
        .rev()
        .map(|entry| match &entry.content {
            crate::history::HistoryEntryContent::Text(t) => ChatMessage::user(t.clone()),
            crate::history::HistoryEntryContent::Decision(d) => {
                ChatMessage::assistant(format!("{} {}", d.action, d.reasoning))
            }
        })
        .collect();

    let ace_prefix = render_ace_context(state, model);
    if !ace_prefix.is_empty() {
        match messages.iter_mut().find(|m| m.role == quoracle_llm::ChatRole::User) {
            Some(first_user) => {
                first_user.content = format!("{ace_prefix}\n\n{}", first_user.content);
            }
            None => messages.insert(0, ChatMessage::user(ace_prefix)),
        }
    }

    let tail = render_todos_and_children(state);
    if !tail.is_empty() {
        messages.push(ChatMessage::user(tail));
    }

    quoracle_llm::chat::merge_consecutive_same_role(messages)
}

fn render_ace_context(state: &AgentState, model: &ModelSpec) -> String {
    let mut out = String::new();
    if let Some(lessons) = state.context_lessons.get(model) {
        if !lessons.is_empty() {
            out.push_str("Lessons learned so far:\n");
            for lesson in lessons {
                out.push_str(&format!("- ({:?}) {}\n", lesson.kind, lesson.content));
            }
        }
    }
    if let Some(summary) = state.model_states.get(model) {
        out.push_str(&format!("Current situation: {summary}\n"));
    }
    out
}

fn render_todos_and_children(state: &AgentState) -> String {
    let mut out = String::new();
    if !state.todos.is_empty() {
        out.push_str("TODOs:\n");
        for todo in state.todos.iter().take(20) {
            out.push_str(&format!("- {todo}\n"));
        }
    }
    if !state.children.is_empty() {
        out.push_str("Children:\n");
        for child in state.children.iter().take(20) {
            out.push_str(&format!("- {}\n", child.child_agent_id));
        }
    }
    out
}

fn system_prompt(state: &AgentState) -> String {
    state.config.prompt_fields.render_system_prompt()
}

/// Temperature schedule: rises modestly each refinement round, then the
/// decision rule forces a winner at `max_refinement_rounds` regardless
/// (§4.6).
fn temperature_for_round(round: u32) -> f32 {
    (0.2 + 0.15 * (round.saturating_sub(1) as f32)).min(0.9)
}

fn parse_and_validate(
    router: &dyn ActionRouter,
    model: ModelSpec,
    raw_text: &str,
) -> Option<SurvivingResponse> {
    let raw: RawDecision = serde_json::from_str(raw_text).ok()?;
    let coerced = router.validate_params(&raw.action, raw.params).ok()?;
    let fingerprint = DecisionFingerprint::of(&raw.action, &coerced);
    Some(SurvivingResponse {
        model,
        decision: Decision {
            action: raw.action,
            params: coerced,
            reasoning: raw.reasoning,
            wait: raw.wait,
            auto_complete_todo: raw.auto_complete_todo,
        },
        fingerprint,
    })
}

struct Cluster {
    fingerprint: DecisionFingerprint,
    representative: Decision,
    votes: usize,
}

fn cluster_responses(responses: &[SurvivingResponse]) -> Vec<Cluster> {
    let mut clusters: Vec<Cluster> = Vec::new();
    for response in responses {
        if let Some(cluster) = clusters.iter_mut().find(|c| c.fingerprint == response.fingerprint) {
            cluster.votes += 1;
        } else {
            clusters.push(Cluster {
                fingerprint: response.fingerprint.clone(),
                representative: response.decision.clone(),
                votes: 1,
            });
        }
    }
    clusters
}

/// Run one full consensus cycle, recursing through refinement rounds as
/// needed (§4.6). Takes `state` mutably because a per-model request that
/// still overflows its context window after ACE/TODO injection triggers an
/// in-place condensation of that one model's history (§4.6 step 5).
pub async fn run_consensus(
    provider: SharedLLMProvider,
    catalog: &SharedModelCatalog,
    router: &dyn ActionRouter,
    state: &mut AgentState,
    condense_deps: &CondenseDeps<'_>,
    cost_accumulator: Option<&CostAccumulator>,
) -> Result<ConsensusOutcome, RuntimeError> {
    run_round(provider, catalog, router, state, condense_deps, cost_accumulator, 1, &[]).await
}

/// Build one model's request, condensing its history in place and retrying
/// once if it still overflows the context window after ACE/TODO injection
/// (§4.6: "trigger ACE condensation for that one model and retry once; if
/// the retry also exceeds, record `context_length_exceeded` ... and continue").
async fn build_request_for_model(
    provider: &SharedLLMProvider,
    catalog: &SharedModelCatalog,
    state: &mut AgentState,
    condense_deps: &CondenseDeps<'_>,
    model: &ModelSpec,
    temperature: f32,
    prior_clusters: &[Cluster],
) -> Option<(ModelSpec, Vec<ChatMessage>, GenerateOptions)> {
    let calculator = crate::tokens::TokenCalculator::new(catalog.clone());

    let build = |state: &AgentState| {
        let mut messages = build_conversation_messages(state, model);
        messages.insert(0, ChatMessage::system(system_prompt(state)));
        if !prior_clusters.is_empty() {
            messages.push(ChatMessage::user(render_refinement_prompt(prior_clusters)));
        }
        messages
    };

    let mut messages = build(state);
    let mut input_tokens = crate::tokens::messages_tokens(&messages, false);
    let mut attempted_condense = false;

    while input_tokens >= calculator.context_limit(model) {
        if attempted_condense {
            tracing::warn!(model = %model.0, "context_length_exceeded after condensation retry");
            return None;
        }
        attempted_condense = true;
        if condenser::condense_model(
            provider.as_ref(),
            condense_deps.embedding_model,
            condense_deps.cache,
            &calculator,
            state,
            model,
            condense_deps.lesson_manager_max,
            condense_deps.lesson_manager_sim_threshold,
        )
        .await
        .is_err()
        {
            tracing::warn!(model = %model.0, "context_length_exceeded: condensation made no progress");
            return None;
        }
        messages = build(state);
        input_tokens = crate::tokens::messages_tokens(&messages, false);
    }

    let max_tokens = calculator.dynamic_max_tokens(model, input_tokens);
    Some((
        model.clone(),
        messages,
        GenerateOptions {
            max_tokens,
            temperature,
            ..Default::default()
        },
    ))
}

async fn run_round(
    provider: SharedLLMProvider,
    catalog: &SharedModelCatalog,
    router: &dyn ActionRouter,
    state: &mut AgentState,
    condense_deps: &CondenseDeps<'_>,
    cost_accumulator: Option<&CostAccumulator>,
    round: u32,
    prior_clusters: &[Cluster],
) -> Result<ConsensusOutcome, RuntimeError> {
    let pool = state.config.model_pool.clone();
    let temperature = temperature_for_round(round);
    let mut temperatures_used = HashMap::new();

    let mut requests = Vec::with_capacity(pool.len());
    for model in &pool {
        match build_request_for_model(
            &provider,
            catalog,
            state,
            condense_deps,
            model,
            temperature,
            prior_clusters,
        )
        .await
        {
            Some(request) => {
                temperatures_used.insert(model.clone(), temperature);
                requests.push(request);
            }
            None => continue, // context_length_exceeded for this model — the round continues without it
        }
    }

    if requests.is_empty() {
        return Err(RuntimeError::AllModelsFailed);
    }

    let PoolQueryResult {
        successful, failed, ..
    } = query_layer::query_pool(provider.clone(), requests, Concurrency::Parallel, catalog, cost_accumulator)
        .await?;

    if successful.is_empty() {
        if failed.iter().all(|(_, e)| e.is_permanent()) {
            return Err(RuntimeError::AllModelsUnavailable);
        }
        return Err(RuntimeError::AllModelsFailed);
    }

    let surviving: Vec<SurvivingResponse> = successful
        .into_iter()
        .filter_map(|(model, response)| parse_and_validate(router, model, &response.text))
        .collect();

    if surviving.is_empty() {
        return Err(RuntimeError::AllResponsesInvalid);
    }

    let clusters = cluster_responses(&surviving);
    let majority_threshold = pool.len() / 2;
    let winner = clusters.iter().max_by_key(|c| c.votes);

    let cost = cost_accumulator.map(|a| a.snapshot());
    let meta_votes: Vec<(String, usize)> = clusters
        .iter()
        .map(|c| (c.representative.action.clone(), c.votes))
        .collect();

    if let Some(winner) = winner {
        if winner.votes > majority_threshold {
            return Ok(ConsensusOutcome::Consensus {
                decision: winner.representative.clone(),
                meta: ConsensusMeta {
                    round,
                    cluster_votes: meta_votes,
                    temperatures_used,
                    cost,
                },
            });
        }
    }

    if round >= state.config.max_refinement_rounds {
        let forced = clusters
            .into_iter()
            .max_by_key(|c| c.votes)
            .expect("non-empty clusters checked above");
        return Ok(ConsensusOutcome::ForcedDecision {
            decision: forced.representative,
            meta: ConsensusMeta {
                round,
                cluster_votes: meta_votes,
                temperatures_used,
                cost,
            },
        });
    }

    Box::pin(run_round(
        provider,
        catalog,
        router,
        state,
        condense_deps,
        cost_accumulator,
        round + 1,
        &clusters,
    ))
    .await
}

fn render_refinement_prompt(clusters: &[Cluster]) -> String {
    let mut out = String::from("Other models proposed:\n");
    for cluster in clusters {
        out.push_str(&format!(
            "- action={} params={} reasoning={} (votes={})\n",
            cluster.representative.action,
            cluster.representative.params,
            cluster.representative.reasoning,
            cluster.votes
        ));
    }
    out.push_str("Reconsider your answer in light of these.");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{AgentConfig, PromptFields};
    use crate::router::SchemaActionRouter;
    use crate::testing::FakeLLMProvider;
    use quoracle_llm::{ModelCatalogEntry, ModelPricing, StaticModelCatalog};
    use std::sync::Arc;

    fn state(pool: Vec<&str>) -> AgentState {
        let config = AgentConfig {
            agent_id: "a1".into(),
            task_id: "t1".into(),
            parent_id: None,
            profile_name: "default".into(),
            model_pool: pool.into_iter().map(ModelSpec::new).collect(),
            capability_groups: vec![],
            prompt_fields: PromptFields {
                role: "an assistant".into(),
                style: "".into(),
                constraints: vec![],
            },
            max_refinement_rounds: 2,
        };
        AgentState::new(config)
    }

    fn catalog(models: &[&str]) -> SharedModelCatalog {
        let mut catalog = StaticModelCatalog::new();
        for model in models {
            catalog.insert(
                ModelSpec::new(*model),
                ModelCatalogEntry {
                    context_window: 50_000,
                    output_limit: 4_000,
                    pricing: ModelPricing::default(),
                },
            );
        }
        Arc::new(catalog)
    }

    fn decision_json(action: &str) -> String {
        serde_json::json!({
            "action": action,
            "params": {},
            "reasoning": "seems right",
            "wait": false,
            "auto_complete_todo": false
        })
        .to_string()
    }

    fn no_condense_deps() -> (ModelSpec, EmbeddingCache) {
        (ModelSpec::new("embed"), EmbeddingCache::new(10))
    }

    #[tokio::test]
    async fn majority_agreement_produces_consensus_on_round_one() {
        let provider = FakeLLMProvider::with_pool_responses(vec![
            ("mA", vec![Ok(decision_json("orient"))]),
            ("mB", vec![Ok(decision_json("orient"))]),
            ("mC", vec![Ok(decision_json("wait"))]),
        ]);
        let catalog = catalog(&["mA", "mB", "mC"]);
        let router = SchemaActionRouter::new()
            .with_action("orient", vec![], vec![])
            .with_action("wait", vec![], vec![]);
        let mut s = state(vec!["mA", "mB", "mC"]);
        let (embedding_model, cache) = no_condense_deps();
        let condense_deps = CondenseDeps {
            embedding_model: &embedding_model,
            cache: &cache,
            lesson_manager_max: 100,
            lesson_manager_sim_threshold: 0.9,
        };

        let outcome = run_consensus(Arc::new(provider), &catalog, &router, &mut s, &condense_deps, None)
            .await
            .expect("consensus should resolve");

        match outcome {
            ConsensusOutcome::Consensus { decision, meta } => {
                assert_eq!(decision.action, "orient");
                assert_eq!(meta.round, 1);
            }
            ConsensusOutcome::ForcedDecision { .. } => panic!("expected clean majority"),
        }
    }

    #[tokio::test]
    async fn split_vote_forces_a_decision_at_the_round_cap() {
        let provider = FakeLLMProvider::with_pool_responses(vec![
            (
                "mA",
                vec![Ok(decision_json("orient")), Ok(decision_json("orient"))],
            ),
            (
                "mB",
                vec![Ok(decision_json("wait")), Ok(decision_json("wait"))],
            ),
        ]);
        let catalog = catalog(&["mA", "mB"]);
        let router = SchemaActionRouter::new()
            .with_action("orient", vec![], vec![])
            .with_action("wait", vec![], vec![]);
        let mut s = state(vec!["mA", "mB"]);
        let (embedding_model, cache) = no_condense_deps();
        let condense_deps = CondenseDeps {
            embedding_model: &embedding_model,
            cache: &cache,
            lesson_manager_max: 100,
            lesson_manager_sim_threshold: 0.9,
        };

        let outcome = run_consensus(Arc::new(provider), &catalog, &router, &mut s, &condense_deps, None)
            .await
            .expect("forced decision should still resolve");

        match outcome {
            ConsensusOutcome::ForcedDecision { meta, .. } => assert_eq!(meta.round, 2),
            ConsensusOutcome::Consensus { .. } => panic!("2-way tie should never reach majority"),
        }
    }

    #[tokio::test]
    async fn malformed_responses_from_every_model_is_an_error() {
        let provider = FakeLLMProvider::with_pool_responses(vec![(
            "mA",
            vec![Ok("not json at all".to_string())],
        )]);
        let catalog = catalog(&["mA"]);
        let router = SchemaActionRouter::new();
        let mut s = state(vec!["mA"]);
        let (embedding_model, cache) = no_condense_deps();
        let condense_deps = CondenseDeps {
            embedding_model: &embedding_model,
            cache: &cache,
            lesson_manager_max: 100,
            lesson_manager_sim_threshold: 0.9,
        };

        let err = run_consensus(Arc::new(provider), &catalog, &router, &mut s, &condense_deps, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::AllResponsesInvalid));
    }

    /// §4.6: a model whose built request still overflows its context window
    /// after the retry-once condensation attempt is excluded from the round
    /// rather than aborting consensus outright; with only one model in the
    /// pool, exclusion leaves no requests to send at all.
    #[tokio::test]
    async fn context_length_exceeded_model_is_excluded_from_the_round() {
        let provider = FakeLLMProvider::with_pool_responses(vec![("mA", vec![])]);
        let mut catalog = StaticModelCatalog::new();
        catalog.insert(
            ModelSpec::new("mA"),
            ModelCatalogEntry {
                context_window: 1,
                output_limit: 50,
                pricing: ModelPricing::default(),
            },
        );
        let catalog: SharedModelCatalog = Arc::new(catalog);
        let router = SchemaActionRouter::new();
        let mut s = state(vec!["mA"]);
        let (embedding_model, cache) = no_condense_deps();
        let condense_deps = CondenseDeps {
            embedding_model: &embedding_model,
            cache: &cache,
            lesson_manager_max: 100,
            lesson_manager_sim_threshold: 0.9,
        };

        let err = run_consensus(Arc::new(provider), &catalog, &router, &mut s, &condense_deps, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::AllModelsFailed));
    }

    #[test]
    fn ace_context_is_rendered_into_the_first_user_message() {
        let mut s = state(vec!["mA"]);
        let model = ModelSpec::new("mA");
        s.append_to_all_histories(crate::history::HistoryEntry::event("hello", 1));
        s.context_lessons.insert(
            model.clone(),
            vec![crate::history::Lesson {
                kind: crate::history::LessonKind::Factual,
                content: "the sky is blue".into(),
                confidence: 80,
            }],
        );

        let messages = build_conversation_messages(&s, &model);
        let first_user = messages
            .iter()
            .find(|m| m.role == quoracle_llm::ChatRole::User)
            .expect("at least one user message");
        assert!(first_user.content.contains("the sky is blue"));
    }
}

