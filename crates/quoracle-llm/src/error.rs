//! Error types returned by LLM provider implementations.

use thiserror::Error;

/// Errors that can occur when talking to an opaque LLM or embedding backend.
///
/// Providers are external collaborators — this crate never speaks a provider's
/// wire protocol directly, it only classifies the *shape* of failure so the
/// query layer and consensus engine can apply the right retry/short-circuit
/// policy (see the query layer's `is_permanent` check).
#[derive(Debug, Error, Clone)]
pub enum LLMError {
    #[error("http transport error: {0}")]
    Http(String),

    #[error("rate limited{}", retry_after_ms.map(|ms| format!(", retry after {ms}ms")).unwrap_or_default())]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("response did not parse as JSON: {message}")]
    ResponseFormat { message: String, raw: String },

    #[error("provider error: {0}")]
    Provider(String),
}

impl LLMError {
    /// Permanent errors short-circuit retries in the multi-LLM query layer (§4.5, §7).
    pub fn is_permanent(&self) -> bool {
        matches!(self, LLMError::AuthFailed(_) | LLMError::Forbidden(_))
    }

    /// Transient errors (429/5xx) are retried with backoff, honoring `Retry-After`.
    pub fn is_transient(&self) -> bool {
        matches!(self, LLMError::RateLimited { .. } | LLMError::Server { .. })
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            LLMError::RateLimited { retry_after_ms } => *retry_after_ms,
            _ => None,
        }
    }
}

#[cfg(feature = "http-client")]
impl From<reqwest::Error> for LLMError {
    fn from(err: reqwest::Error) -> Self {
        LLMError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for LLMError {
    fn from(err: serde_json::Error) -> Self {
        LLMError::ResponseFormat {
            message: err.to_string(),
            raw: String::new(),
        }
    }
}
