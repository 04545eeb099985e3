//! Action Router contract (§4.7). The core only depends on this behavioral
//! contract — concrete action implementations (shell, HTTP, MCP tool
//! invocation, ...) are external collaborators per §1.

use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct ActionResultEnvelope {
    pub ok: bool,
    pub value: Value,
}

#[async_trait]
pub trait ActionRouter: Send + Sync {
    /// Validate an action's params against its schema, returning the
    /// coerced params on success (§4.6 pre-cluster validation: e.g. an
    /// empty object coerces to an empty list for list-typed fields).
    fn validate_params(&self, action: &str, params: Value) -> Result<Value, String>;

    /// §4.8: whether a decision for this action requires the core to wait
    /// for an external result before resuming (vs. self-contained actions).
    fn wait_required(&self, action: &str) -> bool {
        !self.is_self_contained(action)
    }

    /// §6 NO_EXECUTE: untrusted actions get their result wrapped before
    /// being stored in history.
    fn is_untrusted(&self, action: &str) -> bool {
        matches!(
            action,
            "shell" | "web_fetch" | "http_call" | "mcp_tool" | "answer_engine"
        )
    }

    /// §4.7: actions whose effect is wholly within the agent (TODO update,
    /// orient) immediately schedule the next consensus cycle on success with
    /// `wait:false`, without re-dispatching through the message queue.
    fn is_self_contained(&self, action: &str) -> bool {
        matches!(action, "orient" | "update_todos" | "wait" | "send_message" | "spawn")
    }

    /// Execute a decided action. Long-running actions may send an ack before
    /// the final result (§4.7 Async dispatch); that path is modeled by the
    /// caller observing `action_ack` before `action_result`, not by this
    /// method's return type.
    async fn execute(
        &self,
        action: &str,
        params: &Value,
        agent_id: &str,
    ) -> Result<ActionResultEnvelope, String>;
}

/// A router whose validation is entirely schema-driven: every action maps
/// to a list of required parameter names, with empty-object-to-empty-list
/// coercion applied for any field whose name is listed in `list_fields`.
pub struct SchemaActionRouter {
    required_fields: std::collections::HashMap<String, Vec<String>>,
    list_fields: std::collections::HashMap<String, Vec<String>>,
}

impl SchemaActionRouter {
    pub fn new() -> Self {
        Self {
            required_fields: std::collections::HashMap::new(),
            list_fields: std::collections::HashMap::new(),
        }
    }

    pub fn with_action(
        mut self,
        action: impl Into<String>,
        required: Vec<&str>,
        list_fields: Vec<&str>,
    ) -> Self {
        let action = action.into();
        self.required_fields.insert(
            action.clone(),
            required.into_iter().map(str::to_string).collect(),
        );
        self.list_fields.insert(
            action,
            list_fields.into_iter().map(str::to_string).collect(),
        );
        self
    }
}

impl Default for SchemaActionRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionRouter for SchemaActionRouter {
    fn validate_params(&self, action: &str, mut params: Value) -> Result<Value, String> {
        let required = self
            .required_fields
            .get(action)
            .ok_or_else(|| format!("unknown action: {action}"))?;

        if !params.is_object() {
            return Err(format!("params for {action} must be an object"));
        }

        if let Some(list_fields) = self.list_fields.get(action) {
            let obj = params.as_object_mut().expect("checked above");
            for field in list_fields {
                if let Some(value) = obj.get(field) {
                    if value.is_object() && value.as_object().map(|o| o.is_empty()).unwrap_or(false) {
                        obj.insert(field.clone(), Value::Array(vec![]));
                    }
                }
            }
        }

        let obj = params.as_object().expect("checked above");
        for field in required {
            if !obj.contains_key(field) {
                return Err(format!("missing required field '{field}' for action {action}"));
            }
        }

        Ok(params)
    }

    async fn execute(
        &self,
        action: &str,
        _params: &Value,
        _agent_id: &str,
    ) -> Result<ActionResultEnvelope, String> {
        Err(format!(
            "action execution for '{action}' is an external collaborator; \
             SchemaActionRouter only validates"
        ))
    }
}
