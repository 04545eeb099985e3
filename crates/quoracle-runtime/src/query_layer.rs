//! Multi-LLM Query Layer (§4.5): parallel fan-out to the model pool, retry
//! with `Retry-After` honored, aggregate usage/cost roll-up.

use crate::error::RuntimeError;
use quoracle_llm::{
    ChatMessage, CostAccumulator, CostSummary, GenerateOptions, GenerateResponse, LLMError,
    LLMProvider, ModelCatalog, ModelSpec, SharedLLMProvider, SharedModelCatalog, Usage,
};
use std::time::Duration;
use tokio::task::JoinSet;

pub struct PoolQueryResult {
    pub successful: Vec<(ModelSpec, GenerateResponse)>,
    pub failed: Vec<(ModelSpec, LLMError)>,
    pub total_latency_ms: u64,
    pub aggregate_usage: Usage,
}

#[derive(Debug, Clone, Copy)]
pub enum Concurrency {
    Parallel,
    Sequential,
}

/// `QueryPool` (§4.5). Each model's request independently retries transient
/// failures (429/5xx) with exponential backoff, honoring `Retry-After` when
/// present, unbounded — a higher-level timeout is the caller's concern.
/// Permanent errors (401/403) short-circuit that model's task immediately.
pub async fn query_pool(
    provider: SharedLLMProvider,
    messages_by_model: Vec<(ModelSpec, Vec<ChatMessage>, GenerateOptions)>,
    concurrency: Concurrency,
    catalog: &SharedModelCatalog,
    cost_accumulator: Option<&CostAccumulator>,
) -> Result<PoolQueryResult, RuntimeError> {
    let started = std::time::Instant::now();
    let mut successful = Vec::new();
    let mut failed = Vec::new();

    match concurrency {
        Concurrency::Sequential => {
            for (model, messages, opts) in messages_by_model {
                match call_with_retry(provider.as_ref(), &messages, &model, &opts).await {
                    Ok(response) => successful.push((model, response)),
                    Err(err) => failed.push((model, err)),
                }
            }
        }
        Concurrency::Parallel => {
            let mut set: JoinSet<(ModelSpec, Result<GenerateResponse, LLMError>)> = JoinSet::new();
            for (model, messages, opts) in messages_by_model {
                let provider = provider.clone();
                set.spawn(async move {
                    let result = call_with_retry(provider.as_ref(), &messages, &model, &opts).await;
                    (model, result)
                });
            }
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((model, Ok(response))) => successful.push((model, response)),
                    Ok((model, Err(err))) => failed.push((model, err)),
                    Err(join_err) => {
                        tracing::error!(error = %join_err, "query pool task panicked");
                    }
                }
            }
        }
    }

    if successful.is_empty() && failed.iter().all(|(_, e)| e.is_permanent()) && !failed.is_empty() {
        return Err(RuntimeError::AllModelsUnavailable);
    }

    let mut aggregate_usage = Usage::default();
    let mut aggregate_cost = CostSummary::default();
    for (model, response) in &successful {
        aggregate_usage.add(&response.usage);
        let pricing = catalog.pricing(model);
        aggregate_cost.add(&CostSummary::from_usage(&response.usage, &pricing));
    }
    if let Some(accumulator) = cost_accumulator {
        accumulator.record(aggregate_cost);
    }

    Ok(PoolQueryResult {
        successful,
        failed,
        total_latency_ms: started.elapsed().as_millis() as u64,
        aggregate_usage,
    })
}

async fn call_with_retry(
    provider: &(dyn LLMProvider + Send + Sync),
    messages: &[ChatMessage],
    model: &ModelSpec,
    opts: &GenerateOptions,
) -> Result<GenerateResponse, LLMError> {
    let mut backoff = Duration::from_millis(250);
    loop {
        match provider.generate(messages, model, opts).await {
            Ok(response) => return Ok(response),
            Err(err) if err.is_permanent() => return Err(err),
            Err(err) if err.is_transient() => {
                let wait = err
                    .retry_after_ms()
                    .map(Duration::from_millis)
                    .unwrap_or(backoff);
                tokio::time::sleep(wait).await;
                backoff = (backoff * 2).min(Duration::from_secs(30));
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLLMProvider;
    use quoracle_llm::{FinishReason, LLMProvider, ModelCatalogEntry, ModelPricing, StaticModelCatalog};
    use std::sync::Arc;

    #[tokio::test]
    async fn permanent_errors_short_circuit_and_are_reported_failed() {
        let provider = FakeLLMProvider::with_pool_responses(vec![
            ("mA", vec![Err(LLMError::AuthFailed("bad key".into()))]),
            (
                "mB",
                vec![Ok(serde_json::json!({"ok": true}).to_string())],
            ),
        ]);
        let catalog: quoracle_llm::SharedModelCatalog = Arc::new(StaticModelCatalog::new());
        let messages = vec![
            (
                ModelSpec::new("mA"),
                vec![ChatMessage::user("hi")],
                GenerateOptions::default(),
            ),
            (
                ModelSpec::new("mB"),
                vec![ChatMessage::user("hi")],
                GenerateOptions::default(),
            ),
        ];

        let result = query_pool(Arc::new(provider), messages, Concurrency::Parallel, &catalog, None)
            .await
            .expect("should not be all_models_unavailable since mB succeeds");
        assert_eq!(result.successful.len(), 1);
        assert_eq!(result.failed.len(), 1);
    }

    #[tokio::test]
    async fn all_permanent_failures_yields_all_models_unavailable() {
        let provider = FakeLLMProvider::with_pool_responses(vec![(
            "mA",
            vec![Err(LLMError::Forbidden("nope".into()))],
        )]);
        let catalog: quoracle_llm::SharedModelCatalog = Arc::new(StaticModelCatalog::new());
        let messages = vec![(
            ModelSpec::new("mA"),
            vec![ChatMessage::user("hi")],
            GenerateOptions::default(),
        )];

        let err = query_pool(Arc::new(provider), messages, Concurrency::Sequential, &catalog, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::AllModelsUnavailable));
    }

    #[tokio::test]
    async fn aggregate_usage_sums_across_successful_responses() {
        struct TwoModelFake;
        #[async_trait::async_trait]
        impl LLMProvider for TwoModelFake {
            async fn generate(
                &self,
                _messages: &[ChatMessage],
                _model: &ModelSpec,
                _opts: &GenerateOptions,
            ) -> Result<GenerateResponse, LLMError> {
                Ok(GenerateResponse {
                    text: "ok".into(),
                    usage: Usage {
                        input_tokens: 10,
                        output_tokens: 5,
                        ..Default::default()
                    },
                    finish_reason: FinishReason::Stop,
                })
            }
            async fn embed(&self, _text: &str, _model: &ModelSpec) -> Result<Vec<f32>, LLMError> {
                Ok(vec![0.0])
            }
        }

        let provider = TwoModelFake;
        let catalog: quoracle_llm::SharedModelCatalog = Arc::new(
            StaticModelCatalog::new().with_entry(
                "mA",
                ModelCatalogEntry {
                    context_window: 1000,
                    output_limit: 500,
                    pricing: ModelPricing {
                        input_cost_per_million: 1.0,
                        output_cost_per_million: 2.0,
                    },
                },
            ),
        );
        let messages = vec![
            (
                ModelSpec::new("mA"),
                vec![ChatMessage::user("hi")],
                GenerateOptions::default(),
            ),
            (
                ModelSpec::new("mB"),
                vec![ChatMessage::user("hi")],
                GenerateOptions::default(),
            ),
        ];

        let result = query_pool(Arc::new(provider), messages, Concurrency::Parallel, &catalog, None)
            .await
            .unwrap();
        assert_eq!(result.aggregate_usage.input_tokens, 20);
        assert_eq!(result.aggregate_usage.output_tokens, 10);
    }
}
