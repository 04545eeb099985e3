//! Published lifecycle events (§6): the runtime's pubsub surface.
//!
//! These are distinct from [`crate::agent::AgentEvent`], which is the
//! internal mailbox enum the Agent Core state machine consumes. Published
//! events are what external observers (a UI, a logger, a test harness) see
//! on the topics named in spec §6.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topic an event was published on, mirroring §6's topic list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Topic {
    Agent(String),
    AgentMessages(String),
    AgentTodos(String),
    Task(String),
    ActionsAll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PublishedEvent {
    AgentSpawned {
        agent_id: String,
        parent_id: Option<String>,
    },
    AgentDismissed {
        agent_id: String,
        reason: String,
    },
    AgentTerminated {
        agent_id: String,
    },
    StateChange {
        agent_id: String,
        old: String,
        new: String,
    },
    MessageReceived {
        agent_id: String,
        sender: String,
    },
    MessageProcessed {
        agent_id: String,
    },
    MessageSent {
        agent_id: String,
        recipient: String,
    },
    TodosUpdated {
        agent_id: String,
        items: Value,
    },
    UserMessage {
        task_id: String,
        agent_id: String,
        content: String,
    },
    ActionCompleted {
        agent_id: String,
        action_id: String,
        result: Value,
    },
}

impl PublishedEvent {
    pub fn topic(&self) -> Topic {
        match self {
            PublishedEvent::AgentSpawned { agent_id, .. }
            | PublishedEvent::AgentDismissed { agent_id, .. }
            | PublishedEvent::AgentTerminated { agent_id }
            | PublishedEvent::StateChange { agent_id, .. } => Topic::Agent(agent_id.clone()),
            PublishedEvent::MessageReceived { agent_id, .. }
            | PublishedEvent::MessageProcessed { agent_id }
            | PublishedEvent::MessageSent { agent_id, .. } => {
                Topic::AgentMessages(agent_id.clone())
            }
            PublishedEvent::TodosUpdated { agent_id, .. } => Topic::AgentTodos(agent_id.clone()),
            PublishedEvent::UserMessage { task_id, .. } => Topic::Task(task_id.clone()),
            PublishedEvent::ActionCompleted { .. } => Topic::ActionsAll,
        }
    }
}

/// One published event, sequenced and timestamped by the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    pub timestamp: i64,
    pub event: PublishedEvent,
}

/// A sink for structured log records, per §6 ("Logging channel: structured
/// records `{level, agent_id, message, metadata}`"). The default
/// implementation forwards to `tracing`; tests can swap in a capturing sink.
pub trait LogSink: Send + Sync {
    fn record(&self, level: tracing::Level, agent_id: &str, message: &str, metadata: &Value);
}

#[derive(Debug, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn record(&self, level: tracing::Level, agent_id: &str, message: &str, metadata: &Value) {
        match level {
            tracing::Level::ERROR => {
                tracing::error!(agent_id, %metadata, "{message}")
            }
            tracing::Level::WARN => tracing::warn!(agent_id, %metadata, "{message}"),
            tracing::Level::INFO => tracing::info!(agent_id, %metadata, "{message}"),
            tracing::Level::DEBUG => tracing::debug!(agent_id, %metadata, "{message}"),
            tracing::Level::TRACE => tracing::trace!(agent_id, %metadata, "{message}"),
        }
    }
}
