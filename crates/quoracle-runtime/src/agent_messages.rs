//! Message types for the Agent Core state machine (§4.8's event table).
//!
//! Each event in the spec table gets its own struct, grounded on the
//! teacher's one-struct-per-message layout in `agent/messages.rs`.

use serde_json::Value;

// ══════════════════════════════════════════════════════════════════════════
//  Stimuli
// ══════════════════════════════════════════════════════════════════════════

/// A message from another agent.
pub struct AgentMessage {
    pub sender: String,
    pub content: String,
}

/// A message from a human user driving the task.
pub struct UserMessage {
    pub content: String,
}

// ══════════════════════════════════════════════════════════════════════════
//  Action lifecycle
// ══════════════════════════════════════════════════════════════════════════

/// The final result of a dispatched action.
pub struct ActionResult {
    pub action_id: String,
    pub action_type: String,
    pub result: Value,
}

/// Acknowledgement that a long-running action has started, letting message
/// batching resume while the action is still in flight.
pub struct ActionAck {
    pub action_id: String,
}

// ══════════════════════════════════════════════════════════════════════════
//  Wait timer / consensus scheduling (internal)
// ══════════════════════════════════════════════════════════════════════════

/// Self-sent when an armed wait timer elapses. Discarded unless it matches
/// the timer currently armed on the actor (§5 staleness check).
pub(crate) struct WaitExpired {
    pub timer_id: u64,
    pub generation: u64,
}

/// Self-sent to kick off a consensus cycle. Discarded unless
/// `consensus_scheduled` or a wait timer is still set (§4.8).
pub(crate) struct TriggerConsensus;

// ══════════════════════════════════════════════════════════════════════════
//  Tree lifecycle
// ══════════════════════════════════════════════════════════════════════════

pub struct ChildSpawned {
    pub child_agent_id: String,
}

pub struct ChildDismissed {
    pub child_agent_id: String,
}

pub struct ChildRestored {
    pub child_agent_id: String,
}

/// The agent's parent actor went down. Logged and otherwise ignored — tree
/// descent on dismissal is the supervisor's job, not this agent's.
pub struct ParentDown;

// ══════════════════════════════════════════════════════════════════════════
//  Administrative (§6 inbound API; §4.10)
// ══════════════════════════════════════════════════════════════════════════

pub struct UpdateTodos {
    pub items: Vec<Value>,
}

pub struct SwitchModelPool {
    pub new_pool: Vec<quoracle_llm::ModelSpec>,
}

pub struct SetDismissing {
    pub dismissing: bool,
}

/// Snapshot query for tests/observers; returns a clone of the agent's state.
pub struct GetState;

/// Graceful stop. Per §4.9 Dismiss tree this is given an unbounded timeout
/// by the supervisor so cleanup (MCP shutdown, final persist) can finish.
pub struct Shutdown;
