//! Adapter for Anthropic's Messages API.
//!
//! Anthropic departs from the OpenAI dialect in several load-bearing ways:
//! the system prompt is a top-level `system` field rather than a role, tool
//! results ride inside user turns as `tool_result` blocks, assistant tool
//! calls are `tool_use` blocks, an empty `messages` array is rejected
//! outright, and `tool_choice` must be omitted entirely (not sent as
//! `"none"`) when tool calling is switched off.  Structured output has no
//! native enforcement, so when the caller asks for it on a toolless call the
//! system prompt is augmented with a rigid JSON template.

use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

use crate::modelgate::error::{ErrorKind, GatewayError, GatewayResult};
use crate::modelgate::planner::wire_tool_choice;
use crate::modelgate::providers::http::{post_json, post_stream};
use crate::modelgate::providers::{synthesize_call_id, ModelPayload, ModelStream, ModelTurn, ProviderAdapter, StreamEvent};
use crate::modelgate::registry::ProviderId;
use crate::modelgate::request::{ChatMessage, Cost, Role, TokenUsage};
use crate::modelgate::stream::sse_data_stream;
use crate::modelgate::tools::{ToolCall, ToolSpec};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Per-token placeholder rate used to estimate tool-loop cost when the price
/// table has no entry for the model.
const FALLBACK_RATE_PER_TOKEN: f64 = 0.0001;

/// Client for Anthropic's `/v1/messages` endpoint.
pub struct AnthropicAdapter {
    model: String,
    api_key: String,
    max_tokens: u32,
}

impl AnthropicAdapter {
    pub fn new(model: &str, api_key: String, max_tokens: Option<u32>) -> Self {
        AnthropicAdapter {
            model: model.to_string(),
            api_key,
            max_tokens: max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        }
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("x-api-key", self.api_key.clone()),
            ("anthropic-version", API_VERSION.to_string()),
        ]
    }

    /// Build the request body for one call.  Pure; unit-tested without HTTP.
    pub fn wire_request(&self, payload: &ModelPayload, stream: bool) -> Value {
        let mut system = payload.system_prompt.clone().filter(|s| !s.is_empty());

        // Prompt-enforced structured output, only when no tools ride along;
        // with tools in play the orchestrator defers the schema to the final
        // toolless call.
        if let Some(schema) = &payload.response_schema {
            if !payload.has_tools() {
                let instructions = structured_output_instructions(schema);
                system = Some(match system {
                    Some(existing) => format!("{}\n\n{}", existing, instructions),
                    None => instructions,
                });
            }
        }

        let mut messages = wire_messages(&payload.messages);
        if messages.is_empty() {
            // The API rejects an empty conversation: demote the system prompt
            // to a user turn, or inject a greeting when there is none.
            match system.take() {
                Some(prompt) => messages.push(json!({"role": "user", "content": prompt})),
                None => messages.push(json!({"role": "user", "content": "Hello"})),
            }
        }

        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": messages,
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if payload.has_tools() {
            body["tools"] = Value::Array(payload.tools.iter().map(wire_tool).collect());
            if let Some(choice) = wire_tool_choice(ProviderId::Anthropic, &payload.tool_choice) {
                body["tool_choice"] = choice;
            }
        }
        if let Some(temperature) = payload.temperature {
            body["temperature"] = json!(temperature);
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }
}

fn wire_tool(tool: &ToolSpec) -> Value {
    json!({
        "name": tool.id,
        "description": tool.description,
        "input_schema": tool.parameters,
    })
}

/// Serialise canonical turns into Anthropic messages.  System turns embedded
/// in the conversation are demoted to user turns; the real system prompt
/// travels in the top-level field.
pub(crate) fn wire_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| match &message.role {
            Role::System | Role::User => {
                json!({"role": "user", "content": message.content.as_ref()})
            }
            Role::Assistant => {
                if message.tool_calls.is_empty() {
                    json!({"role": "assistant", "content": message.content.as_ref()})
                } else {
                    let mut blocks = Vec::new();
                    if !message.content.is_empty() {
                        blocks.push(json!({"type": "text", "text": message.content.as_ref()}));
                    }
                    for call in &message.tool_calls {
                        let id = if call.id.is_empty() {
                            synthesize_call_id(&call.name)
                        } else {
                            call.id.clone()
                        };
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": id,
                            "name": call.name,
                            "input": call.arguments,
                        }));
                    }
                    json!({"role": "assistant", "content": blocks})
                }
            }
            Role::Tool { call_id } => json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": call_id,
                    "content": message.content.as_ref(),
                }]
            }),
        })
        .collect()
}


/// System-prompt appendix enforcing a JSON-schema response shape.
fn structured_output_instructions(format: &Value) -> String {
    let schema = format.get("schema").unwrap_or(format);
    let mut template_lines = Vec::new();
    let mut description_lines = Vec::new();

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, property) in properties {
            let field_type = property
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("any");
            template_lines.push(format!("  \"{}\": <{}>", name, field_type));
            match property.get("description").and_then(Value::as_str) {
                Some(description) => {
                    description_lines.push(format!("- {} ({}): {}", name, field_type, description))
                }
                None => description_lines.push(format!("- {} ({})", name, field_type)),
            }
        }
    }

    format!(
        "Your response must be a single JSON object with exactly this shape:\n{{\n{}\n}}\n\nFields:\n{}\n\nRules:\n1. Output nothing but the JSON object, with no prose before or after.\n2. Do not wrap the object in an array.\n3. Do not add fields that are not in the shape above.\n4. The output must parse as valid JSON.\n5. Every field in the shape must be present.",
        template_lines.join(",\n"),
        description_lines.join("\n")
    )
}

/// Tool-loop cost estimate at the placeholder per-token rate, for models the
/// price table does not know.
pub fn fallback_cost(tokens: &TokenUsage) -> Cost {
    let input = tokens.prompt as f64 * FALLBACK_RATE_PER_TOKEN;
    let output = tokens.completion as f64 * FALLBACK_RATE_PER_TOKEN;
    Cost {
        input,
        output,
        total: input + output,
    }
}

/// Parse a buffered messages response into a normalized turn.
pub(crate) fn parse_turn(body: &Value) -> GatewayResult<ModelTurn> {
    let blocks = body
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            GatewayError::new(ErrorKind::Parse {
                provider: ProviderId::Anthropic,
                detail: "response has no content blocks".to_string(),
            })
        })?;

    let mut content = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    content.push_str(text);
                }
            }
            Some("tool_use") => {
                let id = block
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| synthesize_call_id("tool"));
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let arguments = block.get("input").cloned().unwrap_or(json!({}));
                tool_calls.push(ToolCall { id, name, arguments });
            }
            _ => {}
        }
    }

    Ok(ModelTurn {
        content,
        tool_calls,
        usage: parse_usage(body.get("usage")),
    })
}

fn parse_usage(usage: Option<&Value>) -> TokenUsage {
    let usage = match usage {
        Some(usage) if !usage.is_null() => usage,
        _ => return TokenUsage::default(),
    };
    let prompt = usage
        .get("input_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize;
    let completion = usage
        .get("output_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize;
    TokenUsage {
        prompt,
        completion,
        total: prompt + completion,
    }
}

/// State carried across SSE frames while assembling stream events.
#[derive(Default)]
struct StreamState {
    pending: VecDeque<StreamEvent>,
    /// `(id, name, partial json)` of the tool_use block being streamed.
    current_tool: Option<(String, String, String)>,
    input_tokens: usize,
    output_tokens: usize,
    done: bool,
}

impl StreamState {
    /// Ingest one SSE `data:` payload, queueing any events it completes.
    fn ingest(&mut self, payload: &str) {
        let event: Value = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(e) => {
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!("AnthropicAdapter: skipping unparseable SSE frame: {}", e);
                }
                return;
            }
        };

        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                self.input_tokens = event
                    .pointer("/message/usage/input_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as usize;
            }
            Some("content_block_start") => {
                let block = event.get("content_block");
                if block.and_then(|b| b.get("type")).and_then(Value::as_str) == Some("tool_use") {
                    let id = block
                        .and_then(|b| b.get("id"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let name = block
                        .and_then(|b| b.get("name"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    self.current_tool = Some((id, name, String::new()));
                }
            }
            Some("content_block_delta") => match event.pointer("/delta/type").and_then(Value::as_str) {
                Some("text_delta") => {
                    // Only text deltas become bytes; tool_use deltas are
                    // accumulated and surfaced as events.
                    if let Some(text) = event.pointer("/delta/text").and_then(Value::as_str) {
                        if !text.is_empty() {
                            self.pending.push_back(StreamEvent::Text(text.to_string()));
                        }
                    }
                }
                Some("input_json_delta") => {
                    if let Some((_, _, buffer)) = self.current_tool.as_mut() {
                        if let Some(partial) =
                            event.pointer("/delta/partial_json").and_then(Value::as_str)
                        {
                            buffer.push_str(partial);
                        }
                    }
                }
                _ => {}
            },
            Some("content_block_stop") => {
                if let Some((id, name, buffer)) = self.current_tool.take() {
                    let arguments = if buffer.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&buffer).unwrap_or(json!({}))
                    };
                    self.pending
                        .push_back(StreamEvent::ToolUse(ToolCall { id, name, arguments }));
                }
            }
            Some("message_delta") => {
                if let Some(output) = event
                    .pointer("/usage/output_tokens")
                    .and_then(Value::as_u64)
                {
                    self.output_tokens = output as usize;
                }
            }
            Some("message_stop") => {
                self.pending.push_back(StreamEvent::Usage(TokenUsage {
                    prompt: self.input_tokens,
                    completion: self.output_tokens,
                    total: self.input_tokens + self.output_tokens,
                }));
                self.done = true;
            }
            _ => {}
        }
    }
}

fn event_stream(
    data: impl Stream<Item = GatewayResult<String>> + Send + 'static,
) -> ModelStream {
    let data: Pin<Box<dyn Stream<Item = GatewayResult<String>> + Send>> = Box::pin(data);
    let stream = stream::unfold(
        (data, StreamState::default()),
        |(mut data, mut state)| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((Ok(event), (data, state)));
                }
                if state.done {
                    return None;
                }
                match data.next().await {
                    None => return None,
                    Some(Err(e)) => return Some((Err(e), (data, state))),
                    Some(Ok(payload)) => state.ingest(&payload),
                }
            }
        },
    );
    Box::pin(stream)
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Anthropic
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
        let response =
            post_json(ProviderId::Anthropic, API_URL, &self.headers(), &body, cancel).await?;
        parse_turn(&response)
    }

    async fn open_stream(
        &self,
        payload: &ModelPayload,
        cancel: &CancellationToken,
    ) -> GatewayResult<ModelStream> {
        let body = self.wire_request(payload, true);
        let response =
            post_stream(ProviderId::Anthropic, API_URL, &self.headers(), &body, cancel).await?;
        Ok(event_stream(sse_data_stream(response, cancel.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modelgate::planner::ToolChoice;

    fn payload(messages: Vec<ChatMessage>) -> ModelPayload {
        ModelPayload {
            system_prompt: None,
            messages,
            tools: Vec::new(),
            tool_choice: ToolChoice::None,
            response_schema: None,
            temperature: None,
            max_tokens: None,
        }
    }

    #[test]
    fn system_prompt_is_a_top_level_field() {
        let adapter = AnthropicAdapter::new("claude-sonnet-4-0", "key".to_string(), None);
        let mut request = payload(vec![ChatMessage::user("hi")]);
        request.system_prompt = Some("You are terse.".to_string());
        let body = adapter.wire_request(&request, false);
        assert_eq!(body["system"], "You are terse.");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["max_tokens"], 4096);
    }

    #[test]
    fn empty_conversation_demotes_system_prompt_to_user_turn() {
        let adapter = AnthropicAdapter::new("claude-sonnet-4-0", "key".to_string(), None);
        let mut request = payload(Vec::new());
        request.system_prompt = Some("Prime directive.".to_string());
        let body = adapter.wire_request(&request, false);
        assert!(body.get("system").is_none());
        assert_eq!(body["messages"][0]["content"], "Prime directive.");
    }

    #[test]
    fn empty_everything_injects_hello() {
        let adapter = AnthropicAdapter::new("claude-sonnet-4-0", "key".to_string(), None);
        let body = adapter.wire_request(&payload(Vec::new()), false);
        assert_eq!(body["messages"][0]["content"], "Hello");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn tool_results_become_user_tool_result_blocks() {
        let call = ToolCall {
            id: "toolu_1".to_string(),
            name: "get_time".to_string(),
            arguments: json!({"timezone": "UTC"}),
        };
        let messages = wire_messages(&[
            ChatMessage::assistant_with_tool_calls("Checking.", vec![call]),
            ChatMessage::tool_result("toolu_1", "noon"),
        ]);

        assert_eq!(messages[0]["role"], "assistant");
        assert_eq!(messages[0]["content"][0]["type"], "text");
        assert_eq!(messages[0]["content"][1]["type"], "tool_use");
        assert_eq!(messages[0]["content"][1]["id"], "toolu_1");
        assert_eq!(messages[0]["content"][1]["input"]["timezone"], "UTC");

        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[1]["content"][0]["type"], "tool_result");
        assert_eq!(messages[1]["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn synthesized_ids_carry_name_and_timestamp() {
        let id = synthesize_call_id("get_time");
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts[0], "get_time");
        assert!(parts[1].parse::<u128>().is_ok());
        assert_eq!(parts[2].len(), 8);
    }

    #[test]
    fn structured_output_augments_system_only_without_tools() {
        let adapter = AnthropicAdapter::new("claude-sonnet-4-0", "key".to_string(), None);
        let schema = json!({"type": "object", "properties": {"answer": {"type": "string"}}});

        let mut request = payload(vec![ChatMessage::user("hi")]);
        request.response_schema = Some(schema.clone());
        let body = adapter.wire_request(&request, false);
        let system = body["system"].as_str().unwrap();
        assert!(system.contains("\"answer\": <string>"));
        assert!(system.contains("no prose"));
        assert!(system.contains("valid JSON"));

        request.tools = vec![ToolSpec::new("t", "", json!({"type": "object"}))];
        request.tool_choice = ToolChoice::Auto;
        let body = adapter.wire_request(&request, false);
        assert!(body.get("system").is_none());
    }

    #[test]
    fn tool_choice_is_omitted_when_switched_off() {
        let adapter = AnthropicAdapter::new("claude-sonnet-4-0", "key".to_string(), None);
        let mut request = payload(vec![ChatMessage::user("hi")]);
        request.tools = vec![ToolSpec::new("t", "", json!({"type": "object"}))];
        request.tool_choice = ToolChoice::None;
        let body = adapter.wire_request(&request, false);
        assert!(body.get("tool_choice").is_none());

        request.tool_choice = ToolChoice::Force("t".to_string());
        let body = adapter.wire_request(&request, false);
        assert_eq!(body["tool_choice"]["type"], "tool");
        assert_eq!(body["tool_choice"]["name"], "t");
    }

    #[test]
    fn parse_turn_concatenates_text_and_collects_tool_use() {
        let body = json!({
            "content": [
                {"type": "text", "text": "It is "},
                {"type": "text", "text": "noon."},
                {"type": "tool_use", "id": "toolu_9", "name": "get_time", "input": {"tz": "UTC"}}
            ],
            "usage": {"input_tokens": 20, "output_tokens": 10}
        });
        let turn = parse_turn(&body).unwrap();
        assert_eq!(turn.content, "It is noon.");
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].id, "toolu_9");
        assert_eq!(turn.usage.total, 30);
    }

    #[test]
    fn stream_state_assembles_tool_use_and_usage() {
        let mut state = StreamState::default();
        state.ingest(r#"{"type":"message_start","message":{"usage":{"input_tokens":12}}}"#);
        state.ingest(
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hi"}}"#,
        );
        state.ingest(
            r#"{"type":"content_block_start","content_block":{"type":"tool_use","id":"toolu_1","name":"get_time"}}"#,
        );
        state.ingest(
            r#"{"type":"content_block_delta","delta":{"type":"input_json_delta","partial_json":"{\"tz\":"}}"#,
        );
        state.ingest(
            r#"{"type":"content_block_delta","delta":{"type":"input_json_delta","partial_json":"\"UTC\"}"}}"#,
        );
        state.ingest(r#"{"type":"content_block_stop"}"#);
        state.ingest(r#"{"type":"message_delta","usage":{"output_tokens":7}}"#);
        state.ingest(r#"{"type":"message_stop"}"#);

        let events: Vec<StreamEvent> = state.pending.drain(..).collect();
        assert!(matches!(&events[0], StreamEvent::Text(t) if t == "Hi"));
        match &events[1] {
            StreamEvent::ToolUse(call) => {
                assert_eq!(call.name, "get_time");
                assert_eq!(call.arguments["tz"], "UTC");
            }
            other => panic!("expected tool use, got {:?}", other),
        }
        assert!(matches!(&events[2], StreamEvent::Usage(u) if u.total == 19));
        assert!(state.done);
    }
}
