//! Adapter for the OpenAI-compatible wire family: OpenAI, Azure OpenAI, xAI,
//! DeepSeek, Groq, and Cerebras.
//!
//! The family shares one JSON dialect; what varies is the base URL, the auth
//! header, and a handful of capability quirks (xAI accepts `json_schema`
//! response formats but not combined with tools; Azure addresses the
//! deployment in the path and authenticates with `api-key`).  The message
//! serialisation table:
//!
//! | Canonical turn | Wire representation |
//! |---|---|
//! | `System` | `{"role":"system","content":"..."}` |
//! | `User` | `{"role":"user","content":"..."}` |
//! | `Assistant` with tool calls | `{"role":"assistant","content":null,"tool_calls":[...]}` |
//! | `Assistant` without | `{"role":"assistant","content":"..."}` |
//! | `Tool { call_id }` | `{"role":"tool","tool_call_id":"<id>","content":"..."}` |

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::modelgate::error::{ErrorKind, GatewayError, GatewayResult};
use crate::modelgate::planner::{wire_tool_choice, ToolChoice};
use crate::modelgate::providers::http::{post_json, post_stream};
use crate::modelgate::providers::{ModelPayload, ModelStream, ModelTurn, ProviderAdapter, StreamEvent};
use crate::modelgate::registry::ProviderId;
use crate::modelgate::request::{ChatMessage, Role, TokenUsage};
use crate::modelgate::stream::sse_data_stream;
use crate::modelgate::tools::{ToolCall, ToolSpec};

/// Azure-specific addressing: deployment in the path, api-version in the
/// query, `api-key` header auth.
#[derive(Debug, Clone)]
struct AzureConfig {
    endpoint: String,
    api_version: String,
}

/// Client for every backend speaking the OpenAI chat-completions dialect.
pub struct OpenAiAdapter {
    provider: ProviderId,
    /// Canonical model id reported on responses.
    model: String,
    /// Model id sent on the wire (namespace prefixes stripped; the Azure
    /// deployment name).
    wire_model: String,
    api_key: String,
    base_url: String,
    azure: Option<AzureConfig>,
}

impl OpenAiAdapter {
    /// Adapter for a hosted family member (OpenAI, xAI, DeepSeek, Groq,
    /// Cerebras).
    pub fn hosted(provider: ProviderId, model: &str, api_key: String) -> Self {
        let base_url = match provider {
            ProviderId::Xai => "https://api.x.ai/v1",
            ProviderId::Deepseek => "https://api.deepseek.com/v1",
            ProviderId::Groq => "https://api.groq.com/openai/v1",
            ProviderId::Cerebras => "https://api.cerebras.ai/v1",
            _ => "https://api.openai.com/v1",
        };
        OpenAiAdapter {
            provider,
            model: model.to_string(),
            wire_model: strip_namespace(provider, model),
            api_key,
            base_url: base_url.to_string(),
            azure: None,
        }
    }

    /// Adapter for an Azure OpenAI deployment.  The deployment name is the
    /// portion of the model id after `"azure/"`.
    pub fn azure(model: &str, api_key: String, endpoint: String, api_version: String) -> Self {
        OpenAiAdapter {
            provider: ProviderId::Azure,
            model: model.to_string(),
            wire_model: model.strip_prefix("azure/").unwrap_or(model).to_string(),
            api_key,
            base_url: String::new(),
            azure: Some(AzureConfig {
                endpoint,
                api_version,
            }),
        }
    }

    /// Adapter pointed at a custom OpenAI-compatible base URL (used by the
    /// Ollama adapter).
    pub fn with_base_url(provider: ProviderId, model: &str, api_key: String, base_url: &str) -> Self {
        OpenAiAdapter {
            provider,
            model: model.to_string(),
            wire_model: strip_namespace(provider, model),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            azure: None,
        }
    }

    fn url(&self) -> String {
        match &self.azure {
            Some(azure) => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                azure.endpoint.trim_end_matches('/'),
                self.wire_model,
                azure.api_version
            ),
            None => format!("{}/chat/completions", self.base_url),
        }
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        if self.azure.is_some() {
            vec![("api-key", self.api_key.clone())]
        } else if self.api_key.is_empty() {
            Vec::new()
        } else {
            vec![("Authorization", format!("Bearer {}", self.api_key))]
        }
    }

    /// Build the request body for one call.  Pure; unit-tested without HTTP.
    pub fn wire_request(&self, payload: &ModelPayload, stream: bool) -> Value {
        let mut body = json!({
            "model": self.wire_model,
            "messages": wire_messages(payload.system_prompt.as_deref(), &payload.messages),
        });

        if payload.has_tools() {
            body["tools"] = Value::Array(payload.tools.iter().map(wire_tool).collect());
            if let Some(choice) = wire_tool_choice(self.provider, &payload.tool_choice) {
                body["tool_choice"] = choice;
            }
        }

        if let Some(schema) = &payload.response_schema {
            // xAI accepts json_schema but rejects it combined with tools.
            if self.provider == ProviderId::Xai && payload.has_tools() {
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!(
                        "OpenAiAdapter: dropping response_format for xAI call carrying tools"
                    );
                }
            } else {
                body["response_format"] = response_format(schema);
            }
        }

        if let Some(temperature) = payload.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = payload.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }

        body
    }
}

/// Strip a provider namespace prefix (`groq/`, `cerebras/`) from a model id.
fn strip_namespace(provider: ProviderId, model: &str) -> String {
    let prefix = match provider {
        ProviderId::Groq => "groq/",
        ProviderId::Cerebras => "cerebras/",
        _ => return model.to_string(),
    };
    model.strip_prefix(prefix).unwrap_or(model).to_string()
}

/// Serialise the canonical conversation (with the system prompt up front)
/// into the family's messages array.
pub(crate) fn wire_messages(system_prompt: Option<&str>, messages: &[ChatMessage]) -> Vec<Value> {
    let mut wire = Vec::with_capacity(messages.len() + 1);
    if let Some(prompt) = system_prompt {
        if !prompt.is_empty() {
            wire.push(json!({"role": "system", "content": prompt}));
        }
    }
    for message in messages {
        wire.push(match &message.role {
            Role::System => json!({"role": "system", "content": message.content.as_ref()}),
            Role::User => json!({"role": "user", "content": message.content.as_ref()}),
            Role::Assistant => {
                if message.tool_calls.is_empty() {
                    json!({"role": "assistant", "content": message.content.as_ref()})
                } else {
                    let tool_calls: Vec<Value> = message
                        .tool_calls
                        .iter()
                        .map(|tc| {
                            json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": serde_json::to_string(&tc.arguments)
                                        .unwrap_or_else(|_| "{}".to_string()),
                                }
                            })
                        })
                        .collect();
                    json!({
                        "role": "assistant",
                        "content": Value::Null,
                        "tool_calls": tool_calls,
                    })
                }
            }
            Role::Tool { call_id } => json!({
                "role": "tool",
                "tool_call_id": call_id,
                "content": message.content.as_ref(),
            }),
        });
    }
    wire
}

fn wire_tool(tool: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.id,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

/// Build the `response_format` value from a native format: either an
/// envelope already carrying `schema` or a bare JSON Schema.
fn response_format(format: &Value) -> Value {
    let (name, schema, strict) = match format.get("schema") {
        Some(schema) => (
            format.get("name").and_then(Value::as_str).unwrap_or("response"),
            schema.clone(),
            format.get("strict").and_then(Value::as_bool).unwrap_or(true),
        ),
        None => ("response", format.clone(), true),
    };
    json!({
        "type": "json_schema",
        "json_schema": {"name": name, "schema": schema, "strict": strict}
    })
}

/// Parse a buffered chat-completions response into a normalized turn.
pub(crate) fn parse_turn(provider: ProviderId, body: &Value) -> GatewayResult<ModelTurn> {
    let message = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| {
            GatewayError::new(ErrorKind::Parse {
                provider,
                detail: "no choices in response".to_string(),
            })
        })?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| calls.iter().filter_map(parse_tool_call).collect())
        .unwrap_or_default();

    Ok(ModelTurn {
        content,
        tool_calls,
        usage: parse_usage(body.get("usage")),
    })
}

fn parse_tool_call(value: &Value) -> Option<ToolCall> {
    let id = value.get("id")?.as_str()?.to_string();
    let function = value.get("function")?;
    let name = function.get("name")?.as_str()?.to_string();
    let arguments = match function.get("arguments") {
        Some(Value::String(raw)) => {
            serde_json::from_str(raw).unwrap_or(Value::Object(serde_json::Map::new()))
        }
        Some(value) => value.clone(),
        None => Value::Object(serde_json::Map::new()),
    };
    Some(ToolCall { id, name, arguments })
}

pub(crate) fn parse_usage(usage: Option<&Value>) -> TokenUsage {
    let usage = match usage {
        Some(usage) if !usage.is_null() => usage,
        _ => return TokenUsage::default(),
    };
    let prompt = usage
        .get("prompt_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize;
    let completion = usage
        .get("completion_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize;
    let total = usage
        .get("total_tokens")
        .and_then(Value::as_u64)
        .unwrap_or((prompt + completion) as u64) as usize;
    TokenUsage {
        prompt,
        completion,
        total,
    }
}

/// Map one SSE chunk payload to a stream event.
fn parse_stream_payload(payload: &str) -> Option<StreamEvent> {
    let chunk: Value = match serde_json::from_str(payload) {
        Ok(chunk) => chunk,
        Err(e) => {
            // Parse errors do not close the stream.
            if log::log_enabled!(log::Level::Warn) {
                log::warn!("OpenAiAdapter: skipping unparseable stream chunk: {}", e);
            }
            return None;
        }
    };

    if let Some(usage) = chunk.get("usage") {
        if !usage.is_null() {
            return Some(StreamEvent::Usage(parse_usage(Some(usage))));
        }
    }

    chunk
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(|text| StreamEvent::Text(text.to_string()))
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn provider(&self) -> ProviderId {
        self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn call_model(
        &self,
        payload: &ModelPayload,
        cancel: &CancellationToken,
    ) -> GatewayResult<ModelTurn> {
        let body = self.wire_request(payload, false);
        let response = post_json(self.provider, &self.url(), &self.headers(), &body, cancel).await?;
        parse_turn(self.provider, &response)
    }

    async fn open_stream(
        &self,
        payload: &ModelPayload,
        cancel: &CancellationToken,
    ) -> GatewayResult<ModelStream> {
        let body = self.wire_request(payload, true);
        let response =
            post_stream(self.provider, &self.url(), &self.headers(), &body, cancel).await?;

        let stream = sse_data_stream(response, cancel.clone())
            .take_while(|item| {
                let done = matches!(item, Ok(payload) if payload.trim() == "[DONE]");
                futures_util::future::ready(!done)
            })
            .filter_map(|item| async move {
                match item {
                    Err(e) => Some(Err(e)),
                    Ok(payload) => parse_stream_payload(&payload).map(Ok),
                }
            });
        Ok(Box::pin(stream))
    }
}
