//! A minimal OpenAI-compatible `LLMProvider` (`/chat/completions`,
//! `/embeddings`), grounded on the teacher's HTTP provider adapters
//! (`crates/querymt/src/chat/http.rs`, `.../embedding/http.rs`) but collapsed
//! into a single concrete struct — the split between request-building and
//! transport existed there to serve an extism plugin host this crate has no
//! counterpart for.

use async_trait::async_trait;
use quoracle_llm::{
    ChatMessage, ChatRole, FinishReason, GenerateOptions, GenerateResponse, LLMError, LLMProvider,
    ModelSpec, Usage,
};
use serde_json::json;

pub struct HttpLLMProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpLLMProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn map_status(status: reqwest::StatusCode, body: &str) -> LLMError {
        match status.as_u16() {
            401 => LLMError::AuthFailed(body.to_string()),
            403 => LLMError::Forbidden(body.to_string()),
            429 => LLMError::RateLimited { retry_after_ms: None },
            400..=499 => LLMError::InvalidRequest(body.to_string()),
            _ => LLMError::Server {
                status: status.as_u16(),
                message: body.to_string(),
            },
        }
    }
}

fn role_str(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    }
}

#[async_trait]
impl LLMProvider for HttpLLMProvider {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        model: &ModelSpec,
        opts: &GenerateOptions,
    ) -> Result<GenerateResponse, LLMError> {
        let payload = json!({
            "model": model.0,
            "messages": messages.iter().map(|m| json!({
                "role": role_str(m.role),
                "content": m.content,
            })).collect::<Vec<_>>(),
            "temperature": opts.temperature,
            "max_tokens": opts.max_tokens,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Self::map_status(status, &body));
        }

        let parsed: serde_json::Value = serde_json::from_str(&body).map_err(|e| LLMError::ResponseFormat {
            message: e.to_string(),
            raw: body.clone(),
        })?;

        let text = parsed["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| LLMError::ResponseFormat {
                message: "missing choices[0].message.content".to_string(),
                raw: body.clone(),
            })?
            .to_string();

        let finish_reason = match parsed["choices"][0]["finish_reason"].as_str() {
            Some("length") => FinishReason::Length,
            Some("stop") | None => FinishReason::Stop,
            Some(_) => FinishReason::Stop,
        };

        let usage = Usage {
            input_tokens: parsed["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: parsed["usage"]["completion_tokens"].as_u64().unwrap_or(0),
            reasoning_tokens: 0,
            cached_tokens: 0,
            cache_creation_tokens: 0,
        };

        Ok(GenerateResponse {
            text,
            usage,
            finish_reason,
        })
    }

    async fn embed(&self, text: &str, model: &ModelSpec) -> Result<Vec<f32>, LLMError> {
        let payload = json!({
            "model": model.0,
            "input": text,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Self::map_status(status, &body));
        }

        let parsed: serde_json::Value = serde_json::from_str(&body).map_err(|e| LLMError::ResponseFormat {
            message: e.to_string(),
            raw: body.clone(),
        })?;

        let values = parsed["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| LLMError::ResponseFormat {
                message: "missing data[0].embedding".to_string(),
                raw: body.clone(),
            })?;

        Ok(values.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect())
    }
}
