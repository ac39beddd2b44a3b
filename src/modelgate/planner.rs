//! Tool-usage planning: usage-control filtering, per-provider steering, and
//! the forced-tool queue.
//!
//! The planner decides which tools each provider call may see and how hard
//! the model is steered toward them.  Tools marked `none` are filtered out
//! before any call; tools marked `force` enter an ordered queue that the
//! orchestrator drains one tool per iteration.  Providers that cannot force
//! (Cerebras, Groq, Ollama) have forcing downgraded to `auto`.
//!
//! # Example
//!
//! ```rust
//! use modelgate::planner::{plan_tools, ToolChoice};
//! use modelgate::registry::ProviderId;
//! use modelgate::tools::{ToolSpec, UsageControl};
//!
//! let tools = vec![
//!     ToolSpec::new("a", "", serde_json::json!({})).with_usage_control(UsageControl::Force),
//!     ToolSpec::new("b", "", serde_json::json!({})).with_usage_control(UsageControl::None),
//! ];
//! let plan = plan_tools(&tools, ProviderId::OpenAi);
//! assert_eq!(plan.tools.len(), 1);
//! assert_eq!(plan.initial_choice, ToolChoice::Force("a".to_string()));
//! ```

use std::collections::HashSet;

use serde_json::json;

use crate::modelgate::registry::{self, ProviderId};
use crate::modelgate::tools::{ToolSpec, UsageControl};

/// Canonical steering: which tools the model may or must call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    /// The model decides.
    Auto,
    /// Tool calling is switched off for this call.
    None,
    /// The model must call the named tool.
    Force(String),
}

/// Output of [`plan_tools`]: the filtered tool list, the forced queue, and
/// the steering for the first model call.
#[derive(Debug, Clone)]
pub struct ToolPlan {
    /// Tools that survive usage-control filtering, in caller order.
    pub tools: Vec<ToolSpec>,
    /// Ids of `force` tools, in caller order.
    pub forced_queue: Vec<String>,
    /// Steering for the initial call.
    pub initial_choice: ToolChoice,
    /// Whether any tool was removed by `none` filtering.
    pub filtered: bool,
}

/// Filter tools by usage control and compute the initial steering.
pub fn plan_tools(tools: &[ToolSpec], provider: ProviderId) -> ToolPlan {
    let mut kept = Vec::new();
    let mut forced_queue = Vec::new();
    let mut filtered = false;

    for tool in tools {
        match tool.usage_control {
            UsageControl::None => {
                filtered = true;
                if log::log_enabled!(log::Level::Debug) {
                    log::debug!("plan_tools: filtering out tool '{}' (usage control none)", tool.id);
                }
            }
            UsageControl::Force => {
                forced_queue.push(tool.id.clone());
                kept.push(tool.clone());
            }
            UsageControl::Auto => kept.push(tool.clone()),
        }
    }

    let initial_choice = if kept.is_empty() {
        ToolChoice::None
    } else if let Some(head) = forced_queue.first() {
        effective_choice(provider, ToolChoice::Force(head.clone()))
    } else {
        ToolChoice::Auto
    };

    ToolPlan {
        tools: kept,
        forced_queue,
        initial_choice,
        filtered,
    }
}

/// Downgrade forcing on providers that only honor auto.
pub fn effective_choice(provider: ProviderId, choice: ToolChoice) -> ToolChoice {
    match choice {
        ToolChoice::Force(name) if !registry::supports_tool_usage_control(provider) => {
            if log::log_enabled!(log::Level::Warn) {
                log::warn!(
                    "Provider '{}' does not support forced tool usage; downgrading '{}' to auto",
                    provider,
                    name
                );
            }
            ToolChoice::Auto
        }
        other => other,
    }
}

/// The forced-tool queue state machine: `{queue head, used set}` advanced on
/// every observed response.
#[derive(Debug, Clone, Default)]
pub struct ForcedToolTracker {
    queue: Vec<String>,
    used: HashSet<String>,
}

impl ForcedToolTracker {
    /// Track the plan's forced queue.
    pub fn new(queue: Vec<String>) -> Self {
        ForcedToolTracker {
            queue,
            used: HashSet::new(),
        }
    }

    /// Advance the queue with the tool names observed in the just-completed
    /// response and return the steering for the next call.
    ///
    /// Every queued name present in `observed` is marked used and removed, in
    /// insertion order; a tool already marked used is never revisited.  The
    /// returned steering forces the new queue head, or falls back to `Auto`
    /// once the queue drains.
    pub fn advance(&mut self, observed: &[String]) -> ToolChoice {
        if !observed.is_empty() {
            let observed: HashSet<&str> = observed.iter().map(String::as_str).collect();
            self.queue.retain(|name| {
                if observed.contains(name.as_str()) {
                    self.used.insert(name.clone());
                    false
                } else {
                    true
                }
            });
        }
        match self.queue.first() {
            Some(head) => ToolChoice::Force(head.clone()),
            None => ToolChoice::Auto,
        }
    }

    /// True once every forced tool has been observed.
    pub fn is_drained(&self) -> bool {
        self.queue.is_empty()
    }

    /// Names marked used so far.
    pub fn used(&self) -> &HashSet<String> {
        &self.used
    }
}

/// Map canonical steering to the OpenAI-family / Anthropic `tool_choice`
/// value.  Returns `None` when the parameter must be omitted (Anthropic with
/// tool calling switched off).
pub fn wire_tool_choice(provider: ProviderId, choice: &ToolChoice) -> Option<serde_json::Value> {
    let choice = effective_choice(provider, choice.clone());
    match provider {
        ProviderId::Anthropic => match choice {
            ToolChoice::Auto => Some(json!("auto")),
            // Anthropic rejects "none"; drop the parameter instead.
            ToolChoice::None => None,
            ToolChoice::Force(name) => Some(json!({"type": "tool", "name": name})),
        },
        ProviderId::Google => None,
        _ => match choice {
            ToolChoice::Auto => Some(json!("auto")),
            ToolChoice::None => Some(json!("none")),
            ToolChoice::Force(name) => {
                Some(json!({"type": "function", "function": {"name": name}}))
            }
        },
    }
}

/// Map canonical steering to Google's `toolConfig` object.
pub fn wire_tool_config(choice: &ToolChoice) -> serde_json::Value {
    match choice {
        ToolChoice::Auto => json!({"functionCallingConfig": {"mode": "AUTO"}}),
        ToolChoice::None => json!({"functionCallingConfig": {"mode": "NONE"}}),
        ToolChoice::Force(name) => json!({
            "functionCallingConfig": {
                "mode": "ANY",
                "allowedFunctionNames": [name]
            }
        }),
    }
}
