//! Core data model (§3): `AgentState` and everything it's built from.

use quoracle_llm::ModelSpec;
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// `wait` field of a [`Decision`]. On the wire (§3/§6) this is
/// `false | true | <non-negative int ms>`; `No` and `Timed(0)` are treated as
/// equivalent per §9's open question (a), but both still parse — a model
/// that sends `"wait": false` must not be rejected as malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    No,
    Indefinite,
    Timed(u64),
}

impl Default for Wait {
    fn default() -> Self {
        Wait::No
    }
}

impl Wait {
    pub fn is_blocking_or_timed(&self) -> bool {
        !matches!(self, Wait::No)
    }
}

impl From<bool> for Wait {
    fn from(b: bool) -> Self {
        if b { Wait::Indefinite } else { Wait::No }
    }
}

/// Serializes back to the wire shape: `false`, `true`, or a millisecond count.
impl Serialize for Wait {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Wait::No => serializer.serialize_bool(false),
            Wait::Indefinite => serializer.serialize_bool(true),
            Wait::Timed(ms) => serializer.serialize_u64(*ms),
        }
    }
}

struct WaitVisitor;

impl<'de> Visitor<'de> for WaitVisitor {
    type Value = Wait;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a boolean or a non-negative integer millisecond count")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Wait, E> {
        Ok(Wait::from(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Wait, E> {
        Ok(Wait::Timed(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Wait, E> {
        u64::try_from(v)
            .map(Wait::Timed)
            .map_err(|_| de::Error::custom("wait must be a non-negative integer"))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Wait, E> {
        if v >= 0.0 && v.fract() == 0.0 {
            Ok(Wait::Timed(v as u64))
        } else {
            Err(de::Error::custom("wait must be a non-negative integer"))
        }
    }
}

/// `false | true | <non-negative int ms>` — not `#[serde(untagged)]`, which
/// would only ever match unit variants against JSON `null` and leave a
/// present `"wait": false`/`"wait": true` matching no variant at all.
impl<'de> Deserialize<'de> for Wait {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(WaitVisitor)
    }
}

/// Consensus output (§3, §4.6): `{action, params, reasoning, wait, auto_complete_todo}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action: String,
    pub params: serde_json::Value,
    pub reasoning: String,
    pub wait: Wait,
    pub auto_complete_todo: bool,
}

/// A canonical `(action, params)` fingerprint used to cluster decisions in
/// consensus (§4.6). `reasoning` and `wait` are deliberately excluded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecisionFingerprint(String);

impl DecisionFingerprint {
    pub fn of(action: &str, params: &serde_json::Value) -> Self {
        // serde_json's "preserve_order" feature (workspace default) keeps key
        // order stable across identical inputs, so two structurally equal
        // param maps always serialize identically here.
        let canonical = serde_json::to_string(params).unwrap_or_default();
        Self(format!("{action}\u{0}{canonical}"))
    }
}

/// One entry in a per-model conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub content: HistoryEntryContent,
    pub timestamp: i64,
    pub action_id: Option<String>,
    pub action_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEntryContent {
    /// `prompt | event | result | user | assistant | image` all collapse to
    /// a plain string payload; `action_type`/`action_id` on the containing
    /// [`HistoryEntry`] carry the distinction the spec's `type` field makes.
    Text(String),
    Decision(Decision),
}

impl HistoryEntry {
    pub fn event(text: impl Into<String>, now: i64) -> Self {
        Self {
            content: HistoryEntryContent::Text(text.into()),
            timestamp: now,
            action_id: None,
            action_type: None,
        }
    }

    pub fn result(
        text: impl Into<String>,
        now: i64,
        action_id: impl Into<String>,
        action_type: impl Into<String>,
    ) -> Self {
        Self {
            content: HistoryEntryContent::Text(text.into()),
            timestamp: now,
            action_id: Some(action_id.into()),
            action_type: Some(action_type.into()),
        }
    }

    pub fn decision(decision: Decision) -> Self {
        Self {
            content: HistoryEntryContent::Decision(decision),
            timestamp: 0,
            action_id: None,
            action_type: None,
        }
    }
}

/// A durable lesson extracted by the Reflector and deduplicated by the
/// Lesson Manager (§4.2, §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lesson {
    pub kind: LessonKind,
    pub content: String,
    pub confidence: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonKind {
    Factual,
    Behavioral,
}

/// Bookkeeping for one in-flight action (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAction {
    pub kind: String,
    pub async_acked: bool,
    pub dispatched_at: i64,
}

/// A message that arrived while an action was pending or consensus was
/// already scheduled (§3, §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub sender: String,
    pub content: String,
    pub queued_at: i64,
}

/// At most one of these is armed at any instant (invariant 2, §3).
/// `generation` lets a stale `wait_expired` event be discarded (§5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitTimer {
    pub timer_id: u64,
    pub generation: u64,
}

/// Immutable identity/config fields, separate from the mutable runtime
/// record below so restore (§4.9 Restore) can rebuild them independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,
    pub task_id: String,
    pub parent_id: Option<String>,
    pub profile_name: String,
    pub model_pool: Vec<ModelSpec>,
    pub capability_groups: Vec<String>,
    pub prompt_fields: PromptFields,
    pub max_refinement_rounds: u32,
}

/// Immutable role/style/constraints the system prompt is derived from.
/// Never persisted separately from `AgentConfig` (invariant 5, §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptFields {
    pub role: String,
    pub style: String,
    pub constraints: Vec<String>,
}

impl PromptFields {
    /// Re-derive the system prompt. Called both at startup and on restore —
    /// `system_prompt` itself is never persisted (invariant 5).
    pub fn render_system_prompt(&self) -> String {
        let mut out = format!("You are {}.\n", self.role);
        if !self.style.is_empty() {
            out.push_str(&format!("Style: {}\n", self.style));
        }
        if !self.constraints.is_empty() {
            out.push_str("Constraints:\n");
            for c in &self.constraints {
                out.push_str(&format!("- {c}\n"));
            }
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildRef {
    pub child_agent_id: String,
    pub spawned_at: i64,
}

/// The authoritative in-memory runtime record for one agent (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub config: AgentConfig,

    pub model_histories: HashMap<ModelSpec, Vec<HistoryEntry>>,
    pub pending_actions: HashMap<String, PendingAction>,
    pub queued_messages: Vec<QueuedMessage>,
    pub wait_timer: Option<WaitTimer>,
    pub consensus_scheduled: bool,
    pub consensus_retry_count: u32,
    pub context_lessons: HashMap<ModelSpec, Vec<Lesson>>,
    pub model_states: HashMap<ModelSpec, String>,
    pub children: Vec<ChildRef>,
    pub dismissing: bool,
    pub todos: Vec<serde_json::Value>,

    /// Suppresses the first re-persist write after a restore (§9).
    #[serde(skip, default)]
    pub restoration_mode: bool,
}

impl AgentState {
    pub fn new(config: AgentConfig) -> Self {
        let model_histories = config
            .model_pool
            .iter()
            .map(|m| (m.clone(), Vec::new()))
            .collect();
        Self {
            config,
            model_histories,
            pending_actions: HashMap::new(),
            queued_messages: Vec::new(),
            wait_timer: None,
            consensus_scheduled: false,
            consensus_retry_count: 0,
            context_lessons: HashMap::new(),
            model_states: HashMap::new(),
            children: Vec::new(),
            dismissing: false,
            todos: Vec::new(),
            restoration_mode: false,
        }
    }

    /// Invariant 1 (§3): `model_histories`' keys always equal `model_pool`.
    pub fn model_pool_consistent(&self) -> bool {
        self.config.model_pool.len() == self.model_histories.len()
            && self
                .config
                .model_pool
                .iter()
                .all(|m| self.model_histories.contains_key(m))
    }

    /// Append an entry to every model's history (§3 invariant 3 path (a)).
    /// Histories keep newest entries at the head (§3), so this inserts at
    /// index 0 rather than pushing.
    pub fn append_to_all_histories(&mut self, entry: HistoryEntry) {
        for history in self.model_histories.values_mut() {
            history.insert(0, entry.clone());
        }
    }

    /// §4.8: `pending_actions` non-empty with an un-acked entry, or consensus
    /// already scheduled, means new stimuli must queue rather than append.
    pub fn must_queue_stimuli(&self) -> bool {
        self.consensus_scheduled
            || self
                .pending_actions
                .values()
                .any(|a| !a.async_acked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AgentConfig {
        AgentConfig {
            agent_id: "a1".into(),
            task_id: "t1".into(),
            parent_id: None,
            profile_name: "default".into(),
            model_pool: vec![ModelSpec::new("mA"), ModelSpec::new("mB")],
            capability_groups: vec!["core".into()],
            prompt_fields: PromptFields {
                role: "an assistant".into(),
                style: "terse".into(),
                constraints: vec!["never lie".into()],
            },
            max_refinement_rounds: 4,
        }
    }

    #[test]
    fn new_state_has_consistent_model_pool() {
        let state = AgentState::new(config());
        assert!(state.model_pool_consistent());
    }

    #[test]
    fn append_to_all_histories_keeps_entry_counts_equal() {
        let mut state = AgentState::new(config());
        state.append_to_all_histories(HistoryEntry::event("hello", 1));
        state.append_to_all_histories(HistoryEntry::event("world", 2));
        for history in state.model_histories.values() {
            assert_eq!(history.len(), 2);
        }
    }

    #[test]
    fn must_queue_stimuli_when_unacked_action_pending() {
        let mut state = AgentState::new(config());
        assert!(!state.must_queue_stimuli());
        state.pending_actions.insert(
            "act-1".into(),
            PendingAction {
                kind: "shell".into(),
                async_acked: false,
                dispatched_at: 0,
            },
        );
        assert!(state.must_queue_stimuli());
    }

    #[test]
    fn acked_pending_action_does_not_force_queueing() {
        let mut state = AgentState::new(config());
        state.pending_actions.insert(
            "act-1".into(),
            PendingAction {
                kind: "shell".into(),
                async_acked: true,
                dispatched_at: 0,
            },
        );
        assert!(!state.must_queue_stimuli());
    }

    #[test]
    fn fingerprint_ignores_reasoning_and_wait() {
        let a = DecisionFingerprint::of("orient", &serde_json::json!({"focus": "x"}));
        let b = DecisionFingerprint::of("orient", &serde_json::json!({"focus": "x"}));
        assert_eq!(a, b);
        let c = DecisionFingerprint::of("orient", &serde_json::json!({"focus": "y"}));
        assert_ne!(a, c);
    }

    #[test]
    fn system_prompt_is_rederived_from_prompt_fields() {
        let cfg = config();
        let rendered = cfg.prompt_fields.render_system_prompt();
        assert!(rendered.contains("an assistant"));
        assert!(rendered.contains("never lie"));
    }

    #[test]
    fn wait_deserializes_from_the_wire_shapes() {
        assert_eq!(serde_json::from_str::<Wait>("false").unwrap(), Wait::No);
        assert_eq!(
            serde_json::from_str::<Wait>("true").unwrap(),
            Wait::Indefinite
        );
        assert_eq!(
            serde_json::from_str::<Wait>("5000").unwrap(),
            Wait::Timed(5000)
        );
        assert_eq!(serde_json::from_str::<Wait>("0").unwrap(), Wait::Timed(0));
        assert!(serde_json::from_str::<Wait>("-1").is_err());
    }

    #[test]
    fn wait_serializes_back_to_the_wire_shapes() {
        assert_eq!(serde_json::to_string(&Wait::No).unwrap(), "false");
        assert_eq!(serde_json::to_string(&Wait::Indefinite).unwrap(), "true");
        assert_eq!(serde_json::to_string(&Wait::Timed(250)).unwrap(), "250");
    }
}
