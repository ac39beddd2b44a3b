//! Tool descriptions and the external execution contract.
//!
//! The gateway never implements tools.  Callers describe each tool with a
//! [`ToolSpec`] (JSON-schema parameters, optional pre-bound `params`, and a
//! [`UsageControl`] knob) and hand the gateway a [`ToolExecutor`] that routes
//! `execute_tool(name, params, moderated)` into their registry.  Tool failures
//! are never fatal: the orchestrator feeds an error payload back to the model
//! so it can recover.
//!
//! # Example
//!
//! ```rust
//! use modelgate::tools::{ToolSpec, UsageControl};
//!
//! let spec = ToolSpec::new(
//!     "get_time",
//!     "Returns the current time in the given timezone.",
//!     serde_json::json!({
//!         "type": "object",
//!         "properties": {
//!             "timezone": {"type": "string", "description": "IANA timezone name"}
//!         },
//!         "required": ["timezone"]
//!     }),
//! )
//! .with_usage_control(UsageControl::Force);
//! assert_eq!(spec.id, "get_time");
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// How the caller wants a tool exposed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UsageControl {
    /// The model decides whether to call the tool.
    #[default]
    Auto,
    /// The orchestrator forces the model to call the tool (once, in the order
    /// the forced tools were supplied) before finishing the turn.
    Force,
    /// The tool is removed from the request entirely.
    None,
}

/// A tool the model may call, as described by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool id as it appears in the provider `tools` array.
    pub id: String,
    /// Description surfaced to the model to aid selection.
    pub description: String,
    /// JSON Schema describing the accepted arguments.
    pub parameters: serde_json::Value,
    /// Pre-bound key/value pairs supplied by the workflow.  Merged under any
    /// model-supplied arguments; the model wins when both set the same key.
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
    /// Exposure knob; see [`UsageControl`].
    #[serde(default)]
    pub usage_control: UsageControl,
}

impl ToolSpec {
    /// Build a tool spec with `Auto` usage control and no pre-bound params.
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        ToolSpec {
            id: id.into(),
            description: description.into(),
            parameters,
            params: HashMap::new(),
            usage_control: UsageControl::Auto,
        }
    }

    /// Set the usage control (builder pattern).
    pub fn with_usage_control(mut self, control: UsageControl) -> Self {
        self.usage_control = control;
        self
    }

    /// Pre-bind a workflow-supplied argument (builder pattern).
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// A tool call normalized out of any provider's wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned (or gateway-synthesized) call id.
    pub id: String,
    /// Tool name; matched against [`ToolSpec::id`].
    pub name: String,
    /// Parsed JSON arguments.
    pub arguments: serde_json::Value,
}

impl ToolCall {
    /// Stable `(name, arguments)` signature used by the duplicate-call guard.
    pub fn signature(&self) -> String {
        format!(
            "{}:{}",
            self.name,
            serde_json::to_string(&self.arguments).unwrap_or_default()
        )
    }
}

/// Result of one tool execution, as reported by the external registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Whether the execution succeeded.
    pub success: bool,
    /// Output payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    /// Successful outcome wrapping the tool's output.
    pub fn success(output: serde_json::Value) -> Self {
        ToolOutcome {
            success: true,
            output: Some(output),
            error: None,
        }
    }

    /// Failed outcome carrying the error message.
    pub fn failure(error: impl Into<String>) -> Self {
        ToolOutcome {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// External tool registry contract.  Implementations are opaque to the
/// gateway; no side-effect guarantees are assumed.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Execute `name` with the merged `params`.  `moderated` is always `true`
    /// for calls issued from the orchestrator loop.
    async fn execute_tool(
        &self,
        name: &str,
        params: serde_json::Value,
        moderated: bool,
    ) -> ToolOutcome;
}

/// Merge pre-bound workflow params with model-supplied arguments.
///
/// Pre-bound values seed the object and the model's arguments are laid over
/// them, so the model wins when both set the same key.  Non-object arguments
/// from the model are ignored (the pre-bound params alone are used).
pub fn merge_arguments(
    prebound: &HashMap<String, serde_json::Value>,
    arguments: &serde_json::Value,
) -> serde_json::Value {
    let mut merged = serde_json::Map::new();
    for (key, value) in prebound {
        merged.insert(key.clone(), value.clone());
    }
    if let Some(object) = arguments.as_object() {
        for (key, value) in object {
            merged.insert(key.clone(), value.clone());
        }
    }
    serde_json::Value::Object(merged)
}

/// Merge arguments for the caller's logged view: the model's arguments seed
/// the object and the workflow's pre-bound values overlay them, so the
/// record shows what the workflow pinned.
pub fn merge_for_display(
    prebound: &HashMap<String, serde_json::Value>,
    arguments: &serde_json::Value,
) -> serde_json::Value {
    let mut merged = serde_json::Map::new();
    if let Some(object) = arguments.as_object() {
        for (key, value) in object {
            merged.insert(key.clone(), value.clone());
        }
    }
    for (key, value) in prebound {
        merged.insert(key.clone(), value.clone());
    }
    serde_json::Value::Object(merged)
}

/// Attach the execution context (workflow id, chat id, environment variables)
/// the external registry expects alongside the tool arguments.
pub fn with_execution_context(
    mut params: serde_json::Value,
    workflow_id: Option<&str>,
    chat_id: Option<&str>,
    env_vars: Option<&HashMap<String, String>>,
) -> serde_json::Value {
    if let Some(object) = params.as_object_mut() {
        if let Some(workflow_id) = workflow_id {
            object.insert(
                "_context".to_string(),
                serde_json::json!({ "workflowId": workflow_id }),
            );
        }
        if let Some(chat_id) = chat_id {
            object.insert("_chatId".to_string(), serde_json::json!(chat_id));
        }
        if let Some(env_vars) = env_vars {
            if !env_vars.is_empty() {
                object.insert(
                    "envVars".to_string(),
                    serde_json::to_value(env_vars).unwrap_or(serde_json::Value::Null),
                );
            }
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_arguments_win_over_prebound_params() {
        let mut prebound = HashMap::new();
        prebound.insert("city".to_string(), serde_json::json!("Lisbon"));
        prebound.insert("units".to_string(), serde_json::json!("metric"));

        let merged = merge_arguments(&prebound, &serde_json::json!({"city": "Porto"}));
        assert_eq!(merged["city"], "Porto");
        assert_eq!(merged["units"], "metric");
    }

    #[test]
    fn non_object_arguments_keep_prebound_params() {
        let mut prebound = HashMap::new();
        prebound.insert("path".to_string(), serde_json::json!("/tmp"));
        let merged = merge_arguments(&prebound, &serde_json::json!("garbage"));
        assert_eq!(merged["path"], "/tmp");
    }

    #[test]
    fn display_merge_favors_prebound_params() {
        let mut prebound = HashMap::new();
        prebound.insert("city".to_string(), serde_json::json!("Lisbon"));
        let merged = merge_for_display(
            &prebound,
            &serde_json::json!({"city": "Porto", "units": "metric"}),
        );
        assert_eq!(merged["city"], "Lisbon");
        assert_eq!(merged["units"], "metric");
    }

    #[test]
    fn execution_context_is_attached_when_provided() {
        let params = with_execution_context(
            serde_json::json!({"q": 1}),
            Some("wf-1"),
            Some("chat-9"),
            None,
        );
        assert_eq!(params["_context"]["workflowId"], "wf-1");
        assert_eq!(params["_chatId"], "chat-9");
        assert!(params.get("envVars").is_none());
    }

    #[test]
    fn duplicate_signature_ignores_call_id() {
        let a = ToolCall {
            id: "call_1".to_string(),
            name: "search".to_string(),
            arguments: serde_json::json!({"q": "rust"}),
        };
        let b = ToolCall {
            id: "call_2".to_string(),
            name: "search".to_string(),
            arguments: serde_json::json!({"q": "rust"}),
        };
        assert_eq!(a.signature(), b.signature());
    }
}
