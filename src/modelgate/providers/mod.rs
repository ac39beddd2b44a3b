//! Provider adapters: one wire translation module per backend family.
//!
//! Each adapter owns exactly the translation between the canonical payload
//! and its backend's JSON: building request bodies, parsing responses into
//! a normalized [`ModelTurn`], and opening raw event streams.  The tool loop,
//! forced-tool sequencing, and accounting all live in the orchestrator;
//! adding a provider means adding one adapter.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::modelgate::error::{ErrorKind, GatewayError, GatewayResult};
use crate::modelgate::planner::ToolChoice;
use crate::modelgate::registry::ProviderId;
use crate::modelgate::request::{ChatMessage, ProviderRequest, TokenUsage};
use crate::modelgate::tools::{ToolCall, ToolSpec};

pub mod anthropic;
pub mod google;
pub mod http;
pub mod ollama;
pub mod openai;

/// The provider-independent shape of one model call, assembled by the
/// orchestrator each iteration.
#[derive(Debug, Clone)]
pub struct ModelPayload {
    /// System prompt, carried separately so adapters can place it where
    /// their wire format wants it.
    pub system_prompt: Option<String>,
    /// Conversation turns, oldest first.
    pub messages: Vec<ChatMessage>,
    /// Tools offered on this call; empty once the orchestrator strips them
    /// for the structured final phase.
    pub tools: Vec<ToolSpec>,
    /// Steering for this call.
    pub tool_choice: ToolChoice,
    /// Native structured-output schema attached to this call, if any.
    pub response_schema: Option<serde_json::Value>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl ModelPayload {
    /// True when this call carries at least one tool.
    pub fn has_tools(&self) -> bool {
        !self.tools.is_empty()
    }
}

/// A model response normalized out of any wire format.
#[derive(Debug, Clone, Default)]
pub struct ModelTurn {
    /// Assistant text (may be empty on pure tool-call turns).
    pub content: String,
    /// Tool calls the model requested, in wire order.
    pub tool_calls: Vec<ToolCall>,
    /// Token usage for this turn; zeroes when the backend omitted it.
    pub usage: TokenUsage,
}

/// An event produced by an adapter's raw response stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A chunk of assistant text.
    Text(String),
    /// A tool call assembled from streamed deltas.
    ToolUse(ToolCall),
    /// The stream's terminal token usage.
    Usage(TokenUsage),
}

/// Lazy sequence of [`StreamEvent`]s from one streaming model call.
pub type ModelStream = Pin<Box<dyn Stream<Item = GatewayResult<StreamEvent>> + Send>>;

/// Id synthesized for tool calls on wire formats that do not assign one:
/// `{toolName}-{epochMillis}-{rand}`.
pub(crate) fn synthesize_call_id(tool_name: &str) -> String {
    let rand = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        tool_name,
        crate::modelgate::accounting::now_ms(),
        &rand[..8]
    )
}

/// Contract every backend adapter implements.  Translation only; the
/// multi-iteration loop never lives here.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Which backend this adapter talks to.
    fn provider(&self) -> ProviderId;

    /// Model id to report on responses (the canonical id, not the wire id).
    fn model(&self) -> &str;

    /// Issue one buffered model call.
    async fn call_model(
        &self,
        payload: &ModelPayload,
        cancel: &CancellationToken,
    ) -> GatewayResult<ModelTurn>;

    /// Open a streaming model call.
    async fn open_stream(
        &self,
        payload: &ModelPayload,
        cancel: &CancellationToken,
    ) -> GatewayResult<ModelStream>;
}

/// Build the adapter for `provider`, wiring credentials and provider
/// extras from the sanitized request.
pub fn adapter_for(
    provider: ProviderId,
    request: &ProviderRequest,
    api_key: String,
) -> GatewayResult<Box<dyn ProviderAdapter>> {
    match provider {
        ProviderId::OpenAi
        | ProviderId::Xai
        | ProviderId::Cerebras
        | ProviderId::Deepseek
        | ProviderId::Groq => Ok(Box::new(openai::OpenAiAdapter::hosted(
            provider,
            &request.model,
            api_key,
        ))),
        ProviderId::Azure => {
            let endpoint = request
                .azure_endpoint
                .clone()
                .or_else(crate::modelgate::environment::azure_endpoint)
                .ok_or_else(|| {
                    GatewayError::new(ErrorKind::InvalidRequest(
                        "Azure OpenAI requests need an endpoint (request field or AZURE_OPENAI_ENDPOINT)"
                            .to_string(),
                    ))
                })?;
            let api_version = request
                .azure_api_version
                .clone()
                .unwrap_or_else(crate::modelgate::environment::azure_api_version);
            Ok(Box::new(openai::OpenAiAdapter::azure(
                &request.model,
                api_key,
                endpoint,
                api_version,
            )))
        }
        ProviderId::Anthropic => Ok(Box::new(anthropic::AnthropicAdapter::new(
            &request.model,
            api_key,
            request.max_tokens,
        ))),
        ProviderId::Google => Ok(Box::new(google::GoogleAdapter::new(&request.model, api_key))),
        ProviderId::Ollama => Ok(Box::new(ollama::OllamaAdapter::new(&request.model))),
    }
}
