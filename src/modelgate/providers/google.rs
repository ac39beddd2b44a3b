//! Adapter for Google's Gemini `generateContent` API (v1beta).
//!
//! Gemini collapses roles to `user` and `model`, replaces the tools array
//! with `functionDeclarations`, and rejects several JSON Schema keywords, so
//! every schema is recursively cleaned before it is sent.  Structured output
//! (`responseMimeType` + `responseSchema`) is mutually exclusive with tools
//! in the same call; the orchestrator defers the schema to the final
//! toolless call and this adapter guards the combination besides.
//!
//! Streaming uses `streamGenerateContent`, whose body is a JSON array of
//! response objects assembled incrementally.  The moment a `functionCall`
//! part appears the text stream ends cleanly: function calls must never be
//! forwarded as user-visible bytes.

use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

use crate::modelgate::error::{ErrorKind, GatewayError, GatewayResult};
use crate::modelgate::planner::wire_tool_config;
use crate::modelgate::providers::http::{post_json, post_stream};
use crate::modelgate::providers::{
    synthesize_call_id, ModelPayload, ModelStream, ModelTurn, ProviderAdapter, StreamEvent,
};
use crate::modelgate::registry::ProviderId;
use crate::modelgate::request::{ChatMessage, Role, TokenUsage};
use crate::modelgate::stream::JsonObjectAssembler;
use crate::modelgate::tools::{ToolCall, ToolSpec};

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Client for Gemini chat models.
pub struct GoogleAdapter {
    model: String,
    api_key: String,
}

impl GoogleAdapter {
    pub fn new(model: &str, api_key: String) -> Self {
        GoogleAdapter {
            model: model.to_string(),
            api_key,
        }
    }

    fn url(&self, stream: bool) -> String {
        let method = if stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        format!("{}/{}:{}?key={}", BASE_URL, self.model, method, self.api_key)
    }

    /// Build the request body for one call.  Pure; unit-tested without HTTP.
    pub fn wire_request(&self, payload: &ModelPayload) -> Value {
        let mut body = json!({
            "contents": wire_contents(&payload.messages),
        });

        if let Some(system) = payload.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }

        if payload.has_tools() {
            let declarations: Vec<Value> = payload
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.id,
                        "description": tool.description,
                        "parameters": clean_schema(&tool.parameters),
                    })
                })
                .collect();
            body["tools"] = json!([{"functionDeclarations": declarations}]);
            body["toolConfig"] = wire_tool_config(&payload.tool_choice);
        }

        let mut generation_config = Map::new();
        if let Some(temperature) = payload.temperature {
            generation_config.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(max_tokens) = payload.max_tokens {
            generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
        }
        if let Some(schema) = &payload.response_schema {
            // responseSchema cannot ride with tools in the same call.
            if payload.has_tools() {
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!("GoogleAdapter: dropping responseSchema for call carrying tools");
                }
            } else {
                let schema = schema.get("schema").unwrap_or(schema);
                generation_config
                    .insert("responseMimeType".to_string(), json!("application/json"));
                generation_config.insert("responseSchema".to_string(), clean_schema(schema));
            }
        }
        if !generation_config.is_empty() {
            body["generationConfig"] = Value::Object(generation_config);
        }

        body
    }
}

/// Collapse canonical turns onto Gemini's `user`/`model` roles.  Tool results
/// become user turns prefixed with `"Function result: "`.
pub(crate) fn wire_contents(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| match &message.role {
            Role::System | Role::User => json!({
                "role": "user",
                "parts": [{"text": message.content.as_ref()}],
            }),
            Role::Assistant => {
                if message.tool_calls.is_empty() {
                    json!({
                        "role": "model",
                        "parts": [{"text": message.content.as_ref()}],
                    })
                } else {
                    let mut parts = Vec::new();
                    if !message.content.is_empty() {
                        parts.push(json!({"text": message.content.as_ref()}));
                    }
                    for call in &message.tool_calls {
                        parts.push(json!({
                            "functionCall": {"name": call.name, "args": call.arguments}
                        }));
                    }
                    json!({"role": "model", "parts": parts})
                }
            }
            Role::Tool { .. } => json!({
                "role": "user",
                "parts": [{"text": format!("Function result: {}", message.content)}],
            }),
        })
        .collect()
}

/// Recursively strip schema keywords Gemini rejects (`additionalProperties`
/// everywhere, `default` on properties).  A pure copy; the caller's schema is
/// never altered, and cleaning an already-clean schema is a no-op.
pub fn clean_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(object) => {
            let mut cleaned = Map::new();
            for (key, value) in object {
                if key == "additionalProperties" || key == "default" {
                    continue;
                }
                cleaned.insert(key.clone(), clean_schema(value));
            }
            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(items.iter().map(clean_schema).collect()),
        other => other.clone(),
    }
}

/// Normalize one `functionCall` part.  Gemini sends `args` either as an
/// object or a JSON-encoded string.
fn parse_function_call(part: &Value) -> Option<ToolCall> {
    let call = part.get("functionCall")?;
    let name = call.get("name")?.as_str()?.to_string();
    let arguments = match call.get("args") {
        Some(Value::String(raw)) => serde_json::from_str(raw).unwrap_or(json!({})),
        Some(value) => value.clone(),
        None => json!({}),
    };
    Some(ToolCall {
        id: synthesize_call_id(&name),
        name,
        arguments,
    })
}

/// Parse a buffered `generateContent` response into a normalized turn.
pub(crate) fn parse_turn(body: &Value) -> GatewayResult<ModelTurn> {
    let parts = body
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            GatewayError::new(ErrorKind::Parse {
                provider: ProviderId::Google,
                detail: "response has no candidate parts".to_string(),
            })
        })?;

    let mut content = String::new();
    let mut tool_calls = Vec::new();
    for part in parts {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            content.push_str(text);
        }
        if let Some(call) = parse_function_call(part) {
            tool_calls.push(call);
        }
    }

    Ok(ModelTurn {
        content,
        tool_calls,
        usage: parse_usage(body.get("usageMetadata")),
    })
}

fn parse_usage(usage: Option<&Value>) -> TokenUsage {
    let usage = match usage {
        Some(usage) if !usage.is_null() => usage,
        _ => return TokenUsage::default(),
    };
    let prompt = usage
        .get("promptTokenCount")
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize;
    let completion = usage
        .get("candidatesTokenCount")
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize;
    let total = usage
        .get("totalTokenCount")
        .and_then(Value::as_u64)
        .unwrap_or((prompt + completion) as u64) as usize;
    TokenUsage {
        prompt,
        completion,
        total,
    }
}

struct GoogleStreamState {
    bytes: Pin<Box<dyn Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>,
    assembler: JsonObjectAssembler,
    pending: VecDeque<StreamEvent>,
    cancel: CancellationToken,
    done: bool,
}

impl GoogleStreamState {
    /// Queue the events one assembled response object produces.  Returns
    /// `true` when the stream must close (a function call appeared).
    fn ingest(&mut self, object: &Value) -> bool {
        if let Some(usage) = object.get("usageMetadata") {
            if !usage.is_null() {
                self.pending
                    .push_back(StreamEvent::Usage(parse_usage(Some(usage))));
            }
        }
        let parts = match object
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
        {
            Some(parts) => parts,
            None => return false,
        };
        for part in parts {
            if part.get("functionCall").is_some() {
                // Function calls are not user-visible bytes: end the text
                // stream here.
                return true;
            }
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if !text.is_empty() {
                    self.pending.push_back(StreamEvent::Text(text.to_string()));
                }
            }
        }
        false
    }
}

fn event_stream(state: GoogleStreamState) -> ModelStream {
    let stream = stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.done {
                return None;
            }

            let cancel = state.cancel.clone();
            let chunk = tokio::select! {
                _ = cancel.cancelled() => None,
                chunk = state.bytes.next() => Some(chunk),
            };
            let chunk = match chunk {
                None => {
                    state.done = true;
                    return Some((Err(GatewayError::new(ErrorKind::Aborted)), state));
                }
                Some(chunk) => chunk,
            };

            match chunk {
                None => state.done = true,
                Some(Err(e)) => {
                    state.done = true;
                    return Some((
                        Err(GatewayError::new(ErrorKind::Http(e.to_string()))),
                        state,
                    ));
                }
                Some(Ok(bytes)) => {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    for object in state.assembler.push(&text) {
                        if state.ingest(&object) {
                            state.done = true;
                            break;
                        }
                    }
                }
            }
        }
    });
    Box::pin(stream)
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Google
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn call_model(
        &self,
        payload: &ModelPayload,
        cancel: &CancellationToken,
    ) -> GatewayResult<ModelTurn> {
        let body = self.wire_request(payload);
        let response = post_json(ProviderId::Google, &self.url(false), &[], &body, cancel).await?;
        parse_turn(&response)
    }

    async fn open_stream(
        &self,
        payload: &ModelPayload,
        cancel: &CancellationToken,
    ) -> GatewayResult<ModelStream> {
        let body = self.wire_request(payload);
        let response =
            post_stream(ProviderId::Google, &self.url(true), &[], &body, cancel).await?;
        Ok(event_stream(GoogleStreamState {
            bytes: Box::pin(response.bytes_stream()),
            assembler: JsonObjectAssembler::new(),
            pending: VecDeque::new(),
            cancel: cancel.clone(),
            done: false,
        }))
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
    fn roles_collapse_to_user_and_model() {
        let contents = wire_contents(&[
            ChatMessage::system("Be brief."),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
            ChatMessage::tool_result("call_1", "{\"time\":\"noon\"}"),
        ]);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "user");
        assert_eq!(contents[2]["role"], "model");
        assert_eq!(contents[3]["role"], "user");
        assert_eq!(
            contents[3]["parts"][0]["text"],
            "Function result: {\"time\":\"noon\"}"
        );
    }

    #[test]
    fn schema_cleaning_strips_rejected_keywords_recursively() {
        let schema = json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "name": {"type": "string", "default": "anon"},
                "nested": {
                    "type": "object",
                    "additionalProperties": true,
                    "properties": {"inner": {"type": "number", "default": 0}}
                },
                "list": {
                    "type": "array",
                    "items": {"type": "object", "additionalProperties": false}
                }
            }
        });

        let cleaned = clean_schema(&schema);
        assert!(cleaned.get("additionalProperties").is_none());
        assert!(cleaned["properties"]["name"].get("default").is_none());
        assert!(cleaned["properties"]["nested"].get("additionalProperties").is_none());
        assert!(cleaned["properties"]["nested"]["properties"]["inner"]
            .get("default")
            .is_none());
        assert!(cleaned["properties"]["list"]["items"]
            .get("additionalProperties")
            .is_none());
        // Valid keywords survive.
        assert_eq!(cleaned["properties"]["name"]["type"], "string");
    }

    #[test]
    fn schema_cleaning_is_idempotent() {
        let schema = json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {"a": {"type": "string", "default": "x"}}
        });
        let once = clean_schema(&schema);
        let twice = clean_schema(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn tools_and_response_schema_are_mutually_exclusive() {
        let adapter = GoogleAdapter::new("gemini-2.5-flash", "key".to_string());
        let schema = json!({"type": "object", "properties": {"answer": {"type": "string"}}});

        let mut request = payload(vec![ChatMessage::user("hi")]);
        request.tools = vec![ToolSpec::new("t", "", json!({"type": "object"}))];
        request.tool_choice = ToolChoice::Auto;
        request.response_schema = Some(schema.clone());
        let body = adapter.wire_request(&request);
        assert!(body.get("tools").is_some());
        assert!(body.pointer("/generationConfig/responseSchema").is_none());

        request.tools.clear();
        let body = adapter.wire_request(&request);
        assert!(body.get("tools").is_none());
        assert_eq!(
            body.pointer("/generationConfig/responseMimeType").unwrap(),
            "application/json"
        );
        assert!(body.pointer("/generationConfig/responseSchema").is_some());
    }

    #[test]
    fn string_args_are_json_parsed() {
        let part = json!({"functionCall": {"name": "get_time", "args": "{\"tz\":\"UTC\"}"}});
        let call = parse_function_call(&part).unwrap();
        assert_eq!(call.name, "get_time");
        assert_eq!(call.arguments["tz"], "UTC");
        assert!(call.id.starts_with("get_time-"));
    }

    #[test]
    fn parse_turn_collects_text_and_function_calls() {
        let body = json!({
            "candidates": [{
                "content": {
                    "parts": [
                        {"text": "Checking. "},
                        {"functionCall": {"name": "get_time", "args": {"tz": "UTC"}}}
                    ]
                }
            }],
            "usageMetadata": {"promptTokenCount": 8, "candidatesTokenCount": 4, "totalTokenCount": 12}
        });
        let turn = parse_turn(&body).unwrap();
        assert_eq!(turn.content, "Checking. ");
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.usage.total, 12);
    }

    #[test]
    fn stream_state_closes_on_function_call() {
        let mut state = GoogleStreamState {
            bytes: Box::pin(stream::empty()),
            assembler: JsonObjectAssembler::new(),
            pending: VecDeque::new(),
            cancel: CancellationToken::new(),
            done: false,
        };

        let text_object = json!({
            "candidates": [{"content": {"parts": [{"text": "Hello"}]}}]
        });
        assert!(!state.ingest(&text_object));
        assert!(matches!(
            state.pending.pop_front(),
            Some(StreamEvent::Text(t)) if t == "Hello"
        ));

        let call_object = json!({
            "candidates": [{"content": {"parts": [{"functionCall": {"name": "t", "args": {}}}]}}]
        });
        assert!(state.ingest(&call_object));
        // The function call itself never becomes a text event.
        assert!(state.pending.is_empty());
    }
}
