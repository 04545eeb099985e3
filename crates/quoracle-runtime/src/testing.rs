//! Test-only fakes (§SPEC_FULL.md E). The teacher hand-rolls fakes rather
//! than reaching for `mockall`; this module follows suit.

#![cfg(test)]

use async_trait::async_trait;
use quoracle_llm::{
    ChatMessage, FinishReason, GenerateOptions, GenerateResponse, LLMError, LLMProvider,
    ModelSpec, Usage,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Scriptable per-model queue of `generate` responses, consumed in order.
pub struct FakeLLMProvider {
    queues: Mutex<HashMap<String, VecDeque<Result<String, LLMError>>>>,
}

impl FakeLLMProvider {
    pub fn with_responses(model: &str, responses: Vec<Result<String, LLMError>>) -> Self {
        let mut queues = HashMap::new();
        queues.insert(model.to_string(), responses.into_iter().collect());
        Self {
            queues: Mutex::new(queues),
        }
    }

    pub fn with_pool_responses(entries: Vec<(&str, Vec<Result<String, LLMError>>)>) -> Self {
        let queues = entries
            .into_iter()
            .map(|(model, responses)| (model.to_string(), responses.into_iter().collect()))
            .collect();
        Self {
            queues: Mutex::new(queues),
        }
    }
}

#[async_trait]
impl LLMProvider for FakeLLMProvider {
    async fn generate(
        &self,
        _messages: &[ChatMessage],
        model: &ModelSpec,
        _opts: &GenerateOptions,
    ) -> Result<GenerateResponse, LLMError> {
        let mut queues = self.queues.lock().unwrap();
        let queue = queues
            .get_mut(&model.0)
            .unwrap_or_else(|| panic!("no scripted responses for model {}", model.0));
        let next = queue
            .pop_front()
            .unwrap_or_else(|| panic!("scripted responses exhausted for model {}", model.0));
        next.map(|text| GenerateResponse {
            text,
            usage: Usage::default(),
            finish_reason: FinishReason::Stop,
        })
    }

    async fn embed(&self, _text: &str, _model: &ModelSpec) -> Result<Vec<f32>, LLMError> {
        Ok(vec![0.0])
    }
}

/// Fake embedder for the Lesson Manager's dedup tests: either always returns
/// the same vector (everything looks like a duplicate), always returns
/// distinct per-call vectors (nothing merges), or always fails.
pub struct FakeEmbeddingProvider {
    mode: EmbedMode,
    counter: Mutex<u32>,
}

enum EmbedMode {
    Identical(Vec<f32>),
    Distinct,
    Failing,
}

impl FakeEmbeddingProvider {
    pub fn identical(vector: Vec<f32>) -> Self {
        Self {
            mode: EmbedMode::Identical(vector),
            counter: Mutex::new(0),
        }
    }

    pub fn distinct() -> Self {
        Self {
            mode: EmbedMode::Distinct,
            counter: Mutex::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            mode: EmbedMode::Failing,
            counter: Mutex::new(0),
        }
    }
}

#[async_trait]
impl LLMProvider for FakeEmbeddingProvider {
    async fn generate(
        &self,
        _messages: &[ChatMessage],
        _model: &ModelSpec,
        _opts: &GenerateOptions,
    ) -> Result<GenerateResponse, LLMError> {
        unimplemented!("FakeEmbeddingProvider only serves embed() in tests")
    }

    async fn embed(&self, _text: &str, _model: &ModelSpec) -> Result<Vec<f32>, LLMError> {
        match &self.mode {
            EmbedMode::Identical(v) => Ok(v.clone()),
            EmbedMode::Distinct => {
                let mut counter = self.counter.lock().unwrap();
                *counter += 1;
                let mut v = vec![0.0; *counter as usize + 1];
                v[*counter as usize] = 1.0;
                Ok(v)
            }
            EmbedMode::Failing => Err(LLMError::Provider("embedding unavailable".into())),
        }
    }
}
