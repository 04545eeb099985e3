//! Minimal chat message shape passed across the `Generate` boundary.
//!
//! Kept intentionally thin: the runtime owns conversation construction
//! (history, ACE injection, TODOs); this crate only needs a wire-agnostic
//! envelope a provider adapter can translate into its own request format.

use serde::{Deserialize, Serialize};

/// Role of a participant in a chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single message passed to `LLMProvider::generate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Merge consecutive same-role messages.
///
/// Some providers require strict user/assistant alternation; §4.6 requires
/// `BuildConversationMessages` to merge consecutive same-role entries before
/// sending them to a model.
pub fn merge_consecutive_same_role(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut merged: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    for msg in messages {
        match merged.last_mut() {
            Some(prev) if prev.role == msg.role => {
                prev.content.push('\n');
                prev.content.push_str(&msg.content);
            }
            _ => merged.push(msg),
        }
    }
    merged
}
