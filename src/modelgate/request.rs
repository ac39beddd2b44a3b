//! Canonical request/response shapes used inside the gateway.
//!
//! Every provider adapter translates between these model-and-backend
//! independent types and its own wire format, so the orchestrator, planner,
//! and accounting components never see provider JSON.
//!
//! # Building a request
//!
//! ```rust
//! use modelgate::request::{ChatMessage, ProviderRequest, Role};
//! use modelgate::tools::{ToolSpec, UsageControl};
//!
//! let request = ProviderRequest::new("gpt-4o")
//!     .with_system_prompt("You are terse.")
//!     .with_message(ChatMessage::user("Say hi."))
//!     .with_tool(
//!         ToolSpec::new("get_time", "Returns the time.", serde_json::json!({"type": "object"}))
//!             .with_usage_control(UsageControl::Force),
//!     );
//! assert_eq!(request.model, "gpt-4o");
//! assert!(matches!(request.messages[0].role, Role::User));
//! ```

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::modelgate::error::GatewayError;
use crate::modelgate::registry::ProviderId;
use crate::modelgate::tools::{ToolCall, ToolSpec};

/// Role of a conversation turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// System priming message.
    System,
    /// User-authored message.
    User,
    /// Assistant message; may carry tool calls.
    Assistant,
    /// Tool-result message correlating with a prior assistant tool call.
    Tool {
        /// The provider-assigned call id this result answers.
        call_id: String,
    },
}

/// One turn of the canonical conversation.
///
/// Content is stored as `Arc<str>` so conversations can be cheaply cloned on
/// every adapter translation pass.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Arc<str>,
    /// Tool calls requested by the assistant.  Non-empty only on assistant
    /// turns produced by a model response that selected tools.
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    /// System turn.
    pub fn system(content: impl AsRef<str>) -> Self {
        ChatMessage {
            role: Role::System,
            content: Arc::from(content.as_ref()),
            tool_calls: Vec::new(),
        }
    }

    /// User turn.
    pub fn user(content: impl AsRef<str>) -> Self {
        ChatMessage {
            role: Role::User,
            content: Arc::from(content.as_ref()),
            tool_calls: Vec::new(),
        }
    }

    /// Plain assistant turn.
    pub fn assistant(content: impl AsRef<str>) -> Self {
        ChatMessage {
            role: Role::Assistant,
            content: Arc::from(content.as_ref()),
            tool_calls: Vec::new(),
        }
    }

    /// Assistant turn carrying the tool calls the model requested.
    pub fn assistant_with_tool_calls(content: impl AsRef<str>, tool_calls: Vec<ToolCall>) -> Self {
        ChatMessage {
            role: Role::Assistant,
            content: Arc::from(content.as_ref()),
            tool_calls,
        }
    }

    /// Tool-result turn answering `call_id`.
    pub fn tool_result(call_id: impl Into<String>, content: impl AsRef<str>) -> Self {
        ChatMessage {
            role: Role::Tool {
                call_id: call_id.into(),
            },
            content: Arc::from(content.as_ref()),
            tool_calls: Vec::new(),
        }
    }
}

/// A canonical request describing one gateway turn.  Immutable once
/// execution starts; the sanitizer returns an adjusted copy.
#[derive(Debug, Clone, Default)]
pub struct ProviderRequest {
    /// Target model id, e.g. `"gpt-4o"` or `"azure/gpt-4o"`.
    pub model: String,
    /// Optional system prompt.
    pub system_prompt: Option<String>,
    /// Optional prior context, appended as a leading user turn.
    pub context: Option<String>,
    /// Ordered conversation turns.
    pub messages: Vec<ChatMessage>,
    /// Tools offered to the model.
    pub tools: Vec<ToolSpec>,
    /// Response format: either a JSON Schema or the legacy `{fields: [...]}`
    /// shape the sanitizer converts into prompt instructions.
    pub response_format: Option<serde_json::Value>,
    /// Sampling temperature; dropped when the model does not support it.
    pub temperature: Option<f64>,
    /// Completion token cap.
    pub max_tokens: Option<u32>,
    /// Stream the final assistant text instead of buffering it.
    pub stream: bool,
    /// Interleave structured tool-call event frames into the stream
    /// (Anthropic path only).
    pub stream_tool_calls: bool,
    /// Caller-supplied API key; the rotation helper takes precedence for
    /// hosted OpenAI/Anthropic.
    pub api_key: Option<String>,
    /// Azure resource endpoint, e.g. `https://my-resource.openai.azure.com`.
    pub azure_endpoint: Option<String>,
    /// Azure api-version query value.
    pub azure_api_version: Option<String>,
    /// Workflow id forwarded to tool executions only.
    pub workflow_id: Option<String>,
    /// Chat id forwarded to tool executions only.
    pub chat_id: Option<String>,
    /// Environment variables forwarded to tool executions only.
    pub environment_variables: Option<HashMap<String, String>>,
    /// Explicit provider override; when absent the registry resolves the
    /// provider from the model id.
    pub provider: Option<ProviderId>,
}

impl ProviderRequest {
    /// Start a request for `model` with everything else empty.
    pub fn new(model: impl Into<String>) -> Self {
        ProviderRequest {
            model: model.into(),
            ..Default::default()
        }
    }

    /// Set the system prompt (builder pattern).
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Append a conversation turn (builder pattern).
    pub fn with_message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    /// Offer a tool to the model (builder pattern).
    pub fn with_tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    /// Request a structured response (builder pattern).
    pub fn with_response_format(mut self, format: serde_json::Value) -> Self {
        self.response_format = Some(format);
        self
    }

    /// Request streaming delivery of the final response (builder pattern).
    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Supply the provider API key (builder pattern).
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

/// Token accounting accumulated across iterations.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt/input tokens billed by the provider.
    pub prompt: usize,
    /// Generated/output tokens billed by the provider.
    pub completion: usize,
    /// Total as reported (or the sum when the provider omits it).
    pub total: usize,
}

impl TokenUsage {
    /// Fold another turn's usage into the running totals.
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.prompt += other.prompt;
        self.completion += other.completion;
        self.total += other.total;
    }
}

/// What a time segment measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    /// A model round-trip.
    Model,
    /// A tool execution.
    Tool,
}

/// A timed span of either a model round-trip or a tool execution.  The
/// segment list on [`Timing`] is append-only and chronologically ordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSegment {
    #[serde(rename = "type")]
    pub kind: SegmentKind,
    /// Model id for model segments, tool name for tool segments.
    pub name: String,
    /// Epoch milliseconds at segment start.
    pub start_time: u128,
    /// Epoch milliseconds at segment end.
    pub end_time: u128,
    /// `end_time - start_time`.
    pub duration_ms: u128,
}

/// Timing breakdown for one gateway execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timing {
    /// ISO-8601 timestamp when execution entered the gateway.
    pub start_time: String,
    /// ISO-8601 timestamp when the final response was assembled.
    pub end_time: String,
    /// Total wall-clock milliseconds.
    pub duration_ms: u128,
    /// Milliseconds spent inside model round-trips.
    pub model_time_ms: u128,
    /// Milliseconds spent executing tools.
    pub tools_time_ms: u128,
    /// Duration of the initial model segment.
    pub first_response_time_ms: u128,
    /// Number of model calls (initial + follow-ups).
    pub iterations: usize,
    /// Ordered record of every model and tool span.
    pub time_segments: Vec<TimeSegment>,
}

/// One executed tool call, as recorded for the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    /// Arguments in the caller's logged view: model-supplied values overlaid
    /// with the workflow's pre-bound params.
    pub arguments: serde_json::Value,
    /// ISO-8601 start of the execution.
    pub start_time: String,
    /// ISO-8601 end of the execution.
    pub end_time: String,
    pub duration_ms: u128,
    /// Output payload when the tool succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Dollar cost of one execution, computed from the registry's price table.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Cost {
    pub input: f64,
    pub output: f64,
    pub total: f64,
}

/// Terminal response for one gateway execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Final assistant content; JSON text when structured output was asked.
    pub content: String,
    /// Model that served the request.
    pub model: String,
    /// Token totals accumulated across iterations.
    pub tokens: TokenUsage,
    /// Every tool call executed by the orchestrator, in execution order.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tool_calls: Vec<ToolCallRecord>,
    /// Raw tool outputs in the same order.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tool_results: Vec<serde_json::Value>,
    /// Timing breakdown.
    pub timing: Timing,
    /// Cost breakdown when pricing is known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<Cost>,
    /// True on the partially-filled record attached to a streaming execution.
    pub is_streaming: bool,
}

/// Lazy byte sequence of assistant text, optionally multiplexed with
/// tool-call event frames.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, GatewayError>> + Send>>;

/// A streaming execution: the byte stream plus a partially-filled response
/// record.  Token totals for the streamed final call arrive with the
/// stream's terminal usage frame and are published into
/// [`final_usage`](StreamingExecution::final_usage) once the stream ends.
pub struct StreamingExecution {
    /// Assistant text as bytes; closed when the provider finishes or the
    /// caller aborts.
    pub stream: ByteStream,
    /// Partially-filled execution record with `is_streaming == true`.
    pub execution: ProviderResponse,
    /// Slot the bridge fills with the stream's terminal token usage.
    pub final_usage: Arc<Mutex<Option<TokenUsage>>>,
}

/// What [`Gateway::execute`](crate::modelgate::orchestrator::Gateway::execute)
/// hands back: a buffered response or a streaming execution.
pub enum ExecutionOutput {
    Completed(Box<ProviderResponse>),
    Streaming(StreamingExecution),
}

impl std::fmt::Debug for ExecutionOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionOutput::Completed(response) => {
                f.debug_tuple("Completed").field(response).finish()
            }
            ExecutionOutput::Streaming(_) => f.debug_tuple("Streaming").field(&"..").finish(),
        }
    }
}

impl ExecutionOutput {
    /// Unwrap a buffered response; panics on a streaming execution.  Intended
    /// for tests and non-streaming call sites.
    pub fn into_response(self) -> ProviderResponse {
        match self {
            ExecutionOutput::Completed(response) => *response,
            ExecutionOutput::Streaming(_) => {
                panic!("expected a buffered response, got a streaming execution")
            }
        }
    }
}
