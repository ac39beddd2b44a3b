//! Streaming bridge: uniform byte streams over provider-specific chunked
//! responses.
//!
//! Adapters expose raw [`StreamEvent`] sequences; the helpers here turn them
//! into the lazy byte stream callers consume, parse SSE transports, assemble
//! Google's incremental JSON objects, and build the delimited tool-call event
//! frames interleaved on the Anthropic streaming path.  Buffers are owned by
//! a single producer and copied on handoff; nothing here is shared mutable.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::stream::{self, Stream, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::modelgate::error::{ErrorKind, GatewayError, GatewayResult};
use crate::modelgate::providers::{ModelStream, StreamEvent};
use crate::modelgate::request::{ByteStream, TokenUsage};
use crate::modelgate::tools::ToolCall;

/// Delimiter wrapping structured tool-call event frames in a byte stream.
pub const TOOL_CALL_EVENT_DELIMITER: &str = "__TOOL_CALL_EVENT__";

struct SseState {
    bytes: Pin<Box<dyn Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>,
    buffer: String,
    pending: VecDeque<String>,
    done: bool,
    cancel: CancellationToken,
}

/// Turn an SSE response body into a stream of `data:` payload strings.
///
/// `event:` lines, comments, and blank separators are dropped; terminal
/// markers like `[DONE]` are passed through for the adapter to interpret.
/// Cancellation closes the stream after an `Aborted` error item.
pub fn sse_data_stream(
    response: reqwest::Response,
    cancel: CancellationToken,
) -> impl Stream<Item = GatewayResult<String>> + Send {
    let state = SseState {
        bytes: Box::pin(response.bytes_stream()),
        buffer: String::new(),
        pending: VecDeque::new(),
        done: false,
        cancel,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.pending.pop_front() {
                return Some((Ok(line), state));
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
                None => {
                    state.done = true;
                    // Flush a trailing line that arrived without a newline.
                    let remainder = state.buffer.trim_end_matches('\r');
                    if let Some(data) = remainder.strip_prefix("data: ") {
                        let data = data.to_string();
                        state.buffer.clear();
                        return Some((Ok(data), state));
                    }
                    return None;
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((
                        Err(GatewayError::new(ErrorKind::Http(e.to_string()))),
                        state,
                    ));
                }
                Some(Ok(bytes)) => {
                    state.buffer.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(newline) = state.buffer.find('\n') {
                        let line: String = state.buffer[..newline].trim_end_matches('\r').to_string();
                        state.buffer.drain(..=newline);
                        if let Some(data) = line.strip_prefix("data: ") {
                            state.pending.push_back(data.to_string());
                        } else if let Some(data) = line.strip_prefix("data:") {
                            state.pending.push_back(data.trim_start().to_string());
                        }
                    }
                }
            }
        }
    })
}

/// Incremental assembler for Google's `streamGenerateContent` body: a JSON
/// array of response objects that arrives in arbitrary byte chunks.
///
/// Top-level objects are extracted with string-aware brace matching; array
/// punctuation between them is ignored.
#[derive(Debug, Default)]
pub struct JsonObjectAssembler {
    current: String,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl JsonObjectAssembler {
    pub fn new() -> Self {
        JsonObjectAssembler::default()
    }

    /// Feed a chunk; returns every complete top-level object it closed.
    pub fn push(&mut self, chunk: &str) -> Vec<serde_json::Value> {
        let mut completed = Vec::new();
        for ch in chunk.chars() {
            if self.depth == 0 {
                if ch == '{' {
                    self.depth = 1;
                    self.in_string = false;
                    self.escaped = false;
                    self.current.clear();
                    self.current.push(ch);
                }
                // Array brackets, commas, and whitespace between objects.
                continue;
            }

            self.current.push(ch);
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if ch == '\\' {
                    self.escaped = true;
                } else if ch == '"' {
                    self.in_string = false;
                }
                continue;
            }
            match ch {
                '"' => self.in_string = true,
                '{' => self.depth += 1,
                '}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        if let Ok(value) = serde_json::from_str(&self.current) {
                            completed.push(value);
                        } else if log::log_enabled!(log::Level::Warn) {
                            log::warn!(
                                "JsonObjectAssembler: dropping unparseable object ({} bytes)",
                                self.current.len()
                            );
                        }
                        self.current.clear();
                    }
                }
                _ => {}
            }
        }
        completed
    }
}

/// Convert an adapter's event stream into the byte stream handed to callers.
///
/// Text events become UTF-8 bytes, tool-use events are suppressed (they are
/// surfaced as event frames, never as text), and the terminal usage event is
/// published into `final_usage` so accounting can finalize token counts.
pub fn text_byte_stream(
    events: ModelStream,
    final_usage: Arc<Mutex<Option<TokenUsage>>>,
) -> ByteStream {
    let stream = stream::unfold(
        (events, final_usage),
        |(mut events, final_usage)| async move {
            loop {
                match events.next().await {
                    None => return None,
                    Some(Err(e)) => return Some((Err(e), (events, final_usage))),
                    Some(Ok(StreamEvent::Text(text))) => {
                        if text.is_empty() {
                            continue;
                        }
                        return Some((Ok(text.into_bytes()), (events, final_usage)));
                    }
                    Some(Ok(StreamEvent::ToolUse(_))) => continue,
                    Some(Ok(StreamEvent::Usage(usage))) => {
                        let mut slot = final_usage.lock().await;
                        match slot.as_mut() {
                            Some(totals) => totals.accumulate(&usage),
                            None => *slot = Some(usage),
                        }
                    }
                }
            }
        },
    );
    Box::pin(stream)
}

/// Prepend already-buffered frames (tool-call events from earlier
/// iterations) to a live byte stream.
pub fn with_prelude(frames: Vec<Vec<u8>>, rest: ByteStream) -> ByteStream {
    Box::pin(stream::iter(frames.into_iter().map(Ok)).chain(rest))
}

/// Wrap a structured event in the delimited envelope:
/// `\n__TOOL_CALL_EVENT__{json}__TOOL_CALL_EVENT__\n`.
pub fn tool_call_event_frame(event: &serde_json::Value) -> Vec<u8> {
    format!(
        "\n{}{}{}\n",
        TOOL_CALL_EVENT_DELIMITER, event, TOOL_CALL_EVENT_DELIMITER
    )
    .into_bytes()
}

/// `tool_call_detected` frame: the model asked for a tool.
pub fn detected_event(call: &ToolCall) -> serde_json::Value {
    serde_json::json!({
        "type": "tool_call_detected",
        "toolCall": {
            "id": call.id,
            "name": call.name,
            "displayName": display_name(&call.name),
            "arguments": call.arguments,
        }
    })
}

/// `tool_calls_start` frame: execution of this iteration's calls begins.
pub fn start_event(calls: &[ToolCall]) -> serde_json::Value {
    let calls: Vec<serde_json::Value> = calls
        .iter()
        .map(|call| {
            serde_json::json!({
                "id": call.id,
                "name": call.name,
                "displayName": display_name(&call.name),
            })
        })
        .collect();
    serde_json::json!({"type": "tool_calls_start", "toolCalls": calls})
}

/// `tool_call_complete` frame: one call finished (successfully or not).
pub fn complete_event(
    call: &ToolCall,
    success: bool,
    duration_ms: u128,
) -> serde_json::Value {
    serde_json::json!({
        "type": "tool_call_complete",
        "toolCall": {
            "id": call.id,
            "name": call.name,
            "displayName": display_name(&call.name),
            "success": success,
            "durationMs": duration_ms,
        }
    })
}

/// Human-readable label for a tool id.  Known ids get a fixed label;
/// everything else is title-cased from its snake_case id.
pub fn display_name(tool_id: &str) -> String {
    match tool_id {
        "web_search" => "Searching the web".to_string(),
        "knowledge_search" => "Searching knowledge base".to_string(),
        "read_document" => "Reading document".to_string(),
        "run_query" => "Running query".to_string(),
        "send_email" => "Sending email".to_string(),
        "http_request" => "Calling API".to_string(),
        other => {
            let mut label = String::new();
            for (i, part) in other.split('_').enumerate() {
                if i > 0 {
                    label.push(' ');
                }
                let mut chars = part.chars();
                if let Some(first) = chars.next() {
                    if i == 0 {
                        label.extend(first.to_uppercase());
                    } else {
                        label.push(first);
                    }
                    label.push_str(chars.as_str());
                }
            }
            label
        }
    }
}
