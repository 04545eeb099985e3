//! Reflector (§4.2): self-reflection lesson extraction from a history slice
//! about to be dropped.

use crate::history::{HistoryEntry, Lesson, LessonKind};
use crate::tokens::{TokenCalculator, history_tokens};
use quoracle_llm::{ChatMessage, GenerateOptions, LLMProvider, ModelSpec};
use serde::Deserialize;
use std::time::Duration;

const REFLECTION_PROMPT: &str = "Extract specific, actionable information from the conversation \
history below before it is discarded. Return JSON matching: \
{\"lessons\": [{\"type\": \"factual\"|\"behavioral\", \"content\": string}], \
\"state\": [{\"summary\": string}]}.";

const MAX_RETRIES: u32 = 2;

#[derive(Debug, Deserialize)]
struct RawReflection {
    lessons: Vec<RawLesson>,
    state: Vec<RawState>,
}

#[derive(Debug, Deserialize)]
struct RawLesson {
    #[serde(rename = "type")]
    kind: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct RawState {
    summary: String,
}

pub struct ReflectionOutput {
    pub lessons: Vec<Lesson>,
    /// Situational summary replacing any prior one for this model. `None`
    /// when the model returned no state entries.
    pub state: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectionFailure {
    MalformedResponseAfterRetries,
    ReflectionFailed,
}

/// Build the reflection prompt for a dropped history slice.
fn build_messages(dropped: &[HistoryEntry]) -> Vec<ChatMessage> {
    let mut body = String::new();
    for entry in dropped {
        match &entry.content {
            crate::history::HistoryEntryContent::Text(t) => body.push_str(t),
            crate::history::HistoryEntryContent::Decision(d) => {
                body.push_str(&format!("{} {}", d.params, d.reasoning))
            }
        }
        body.push('\n');
    }
    vec![
        ChatMessage::system(REFLECTION_PROMPT),
        ChatMessage::user(body),
    ]
}

/// Run the Reflector contract: on repeated parse failure or transport
/// failure, the condenser treats it as "drop the slice, emit no lessons"
/// (§4.2 Failure).
pub async fn reflect(
    provider: &dyn LLMProvider,
    calculator: &TokenCalculator,
    model: &ModelSpec,
    dropped: &[HistoryEntry],
) -> Result<ReflectionOutput, ReflectionFailure> {
    let messages = build_messages(dropped);
    let input_tokens = history_tokens(dropped);
    let max_tokens = calculator.dynamic_max_tokens(model, input_tokens);

    let mut backoff = Duration::from_millis(100);
    let mut last_parse_err = false;

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }

        let opts = GenerateOptions {
            max_tokens,
            temperature: 0.0,
            ..Default::default()
        };

        let response = match provider.generate(&messages, model, &opts).await {
            Ok(r) => r,
            Err(_) => {
                // transport failure: keep retrying within budget, same as a
                // parse failure, then surface `reflection_failed`.
                last_parse_err = false;
                continue;
            }
        };

        match serde_json::from_str::<RawReflection>(&response.text) {
            Ok(raw) => {
                let lessons = raw
                    .lessons
                    .into_iter()
                    .filter_map(|l| {
                        let kind = match l.kind.as_str() {
                            "factual" => Some(LessonKind::Factual),
                            "behavioral" => Some(LessonKind::Behavioral),
                            _ => None,
                        }?;
                        Some(Lesson {
                            kind,
                            content: l.content,
                            confidence: 1,
                        })
                    })
                    .collect();
                let state = raw.state.into_iter().next().map(|s| s.summary);
                return Ok(ReflectionOutput { lessons, state });
            }
            Err(_) => {
                last_parse_err = true;
                continue;
            }
        }
    }

    if last_parse_err {
        Err(ReflectionFailure::MalformedResponseAfterRetries)
    } else {
        Err(ReflectionFailure::ReflectionFailed)
    }
}
