use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use modelgate::providers::{ModelPayload, ModelStream, ModelTurn, ProviderAdapter, StreamEvent};
use modelgate::registry::ProviderId;
use modelgate::request::{ChatMessage, ExecutionOutput, ProviderRequest, TokenUsage};
use modelgate::stream::TOOL_CALL_EVENT_DELIMITER;
use modelgate::tools::{ToolCall, ToolExecutor, ToolOutcome, ToolSpec, UsageControl};
use modelgate::Gateway;

/// Adapter with scripted buffered turns and scripted stream events.
struct MockAdapter {
    provider: ProviderId,
    model: String,
    turns: Mutex<VecDeque<ModelTurn>>,
    stream_scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
    streamed_payloads: Mutex<Vec<ModelPayload>>,
}

impl MockAdapter {
    fn new(provider: ProviderId, model: &str) -> Self {
        MockAdapter {
            provider,
            model: model.to_string(),
            turns: Mutex::new(VecDeque::new()),
            stream_scripts: Mutex::new(VecDeque::new()),
            streamed_payloads: Mutex::new(Vec::new()),
        }
    }

    async fn push_turn(&self, turn: ModelTurn) {
        self.turns.lock().await.push_back(turn);
    }

    async fn push_stream(&self, events: Vec<StreamEvent>) {
        self.stream_scripts.lock().await.push_back(events);
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn provider(&self) -> ProviderId {
        self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn call_model(
        &self,
        _payload: &ModelPayload,
        _cancel: &CancellationToken,
    ) -> Result<ModelTurn, modelgate::error::GatewayError> {
        Ok(self
            .turns
            .lock()
            .await
            .pop_front()
            .expect("buffered call script exhausted"))
    }

    async fn open_stream(
        &self,
        payload: &ModelPayload,
        _cancel: &CancellationToken,
    ) -> Result<ModelStream, modelgate::error::GatewayError> {
        self.streamed_payloads.lock().await.push(payload.clone());
        let events = self
            .stream_scripts
            .lock()
            .await
            .pop_front()
            .expect("stream script exhausted");
        Ok(Box::pin(futures_util::stream::iter(
            events.into_iter().map(Ok),
        )))
    }
}

struct EchoExecutor;

#[async_trait]
impl ToolExecutor for EchoExecutor {
    async fn execute_tool(
        &self,
        name: &str,
        _params: serde_json::Value,
        _moderated: bool,
    ) -> ToolOutcome {
        ToolOutcome::success(json!({"tool": name}))
    }
}

async fn drain(stream: &mut modelgate::request::ByteStream) -> String {
    let mut bytes = Vec::new();
    while let Some(chunk) = stream.next().await {
        bytes.extend(chunk.unwrap());
    }
    String::from_utf8(bytes).unwrap()
}

#[tokio::test]
async fn streaming_without_tools_streams_the_first_call() {
    let adapter = MockAdapter::new(ProviderId::OpenAi, "gpt-4o");
    adapter
        .push_stream(vec![
            StreamEvent::Text("Hello ".to_string()),
            StreamEvent::Text("world.".to_string()),
            StreamEvent::Usage(TokenUsage {
                prompt: 9,
                completion: 4,
                total: 13,
            }),
        ])
        .await;

    let mut request = ProviderRequest::new("gpt-4o").with_message(ChatMessage::user("hi"));
    request.stream = true;

    let output = Gateway::new()
        .execute_with_adapter(request, &adapter, CancellationToken::new())
        .await
        .unwrap();

    let mut execution = match output {
        ExecutionOutput::Streaming(execution) => execution,
        ExecutionOutput::Completed(_) => panic!("expected a streaming execution"),
    };

    assert!(execution.execution.is_streaming);
    assert_eq!(execution.execution.timing.iterations, 1);

    let text = drain(&mut execution.stream).await;
    assert_eq!(text, "Hello world.");

    // Terminal usage was published for accounting.
    let usage = execution.final_usage.lock().await.unwrap();
    assert_eq!(usage.total, 13);
}

#[tokio::test]
async fn streaming_with_forced_tool_buffers_the_loop_and_streams_the_final_call() {
    let adapter = MockAdapter::new(ProviderId::Anthropic, "claude-sonnet-4-0");
    adapter
        .push_turn(ModelTurn {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: "toolu_1".to_string(),
                name: "get_time".to_string(),
                arguments: json!({"timezone": "UTC"}),
            }],
            usage: TokenUsage {
                prompt: 15,
                completion: 8,
                total: 23,
            },
        })
        .await;
    adapter
        .push_stream(vec![
            StreamEvent::Text("It is noon.".to_string()),
            StreamEvent::Usage(TokenUsage {
                prompt: 30,
                completion: 5,
                total: 35,
            }),
        ])
        .await;

    let mut request = ProviderRequest::new("claude-sonnet-4-0")
        .with_message(ChatMessage::user("What time is it?"))
        .with_tool(
            ToolSpec::new("get_time", "", json!({"type": "object"}))
                .with_usage_control(UsageControl::Force),
        );
    request.stream = true;
    request.stream_tool_calls = true;

    let output = Gateway::new()
        .with_tool_executor(Arc::new(EchoExecutor))
        .execute_with_adapter(request, &adapter, CancellationToken::new())
        .await
        .unwrap();

    let mut execution = match output {
        ExecutionOutput::Streaming(execution) => execution,
        ExecutionOutput::Completed(_) => panic!("expected a streaming execution"),
    };

    // The buffered iteration already recorded the executed call.
    assert_eq!(execution.execution.tool_calls.len(), 1);
    assert_eq!(execution.execution.tool_calls[0].name, "get_time");
    assert_eq!(execution.execution.timing.iterations, 2);

    let text = drain(&mut execution.stream).await;

    // Exactly three event frames, in lifecycle order, then the final text.
    assert_eq!(text.matches(TOOL_CALL_EVENT_DELIMITER).count(), 6);
    let detected = text.find("tool_call_detected").unwrap();
    let started = text.find("tool_calls_start").unwrap();
    let completed = text.find("tool_call_complete").unwrap();
    assert!(detected < started && started < completed);

    // The assistant's final text is present and tool arguments never leak
    // outside the event frames.
    assert!(text.ends_with("It is noon."));
    let plain: String = text
        .split(TOOL_CALL_EVENT_DELIMITER)
        .enumerate()
        .filter(|(i, _)| i % 2 == 0)
        .map(|(_, part)| part)
        .collect();
    assert!(!plain.contains("timezone"));
}

#[tokio::test]
async fn streaming_without_frames_when_stream_tool_calls_is_unset() {
    let adapter = MockAdapter::new(ProviderId::Anthropic, "claude-sonnet-4-0");
    adapter
        .push_turn(ModelTurn {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: "toolu_1".to_string(),
                name: "get_time".to_string(),
                arguments: json!({}),
            }],
            usage: TokenUsage::default(),
        })
        .await;
    adapter
        .push_stream(vec![StreamEvent::Text("Noon.".to_string())])
        .await;

    let mut request = ProviderRequest::new("claude-sonnet-4-0")
        .with_message(ChatMessage::user("time?"))
        .with_tool(
            ToolSpec::new("get_time", "", json!({"type": "object"}))
                .with_usage_control(UsageControl::Force),
        );
    request.stream = true;

    let output = Gateway::new()
        .with_tool_executor(Arc::new(EchoExecutor))
        .execute_with_adapter(request, &adapter, CancellationToken::new())
        .await
        .unwrap();

    let mut execution = match output {
        ExecutionOutput::Streaming(execution) => execution,
        ExecutionOutput::Completed(_) => panic!("expected a streaming execution"),
    };
    let text = drain(&mut execution.stream).await;
    assert_eq!(text, "Noon.");
}

#[tokio::test]
async fn streaming_replays_buffered_text_when_the_model_skips_its_tools() {
    let adapter = MockAdapter::new(ProviderId::OpenAi, "gpt-4o");
    adapter
        .push_turn(ModelTurn {
            content: "Direct answer.".to_string(),
            tool_calls: Vec::new(),
            usage: TokenUsage {
                prompt: 7,
                completion: 3,
                total: 10,
            },
        })
        .await;

    let mut request = ProviderRequest::new("gpt-4o")
        .with_message(ChatMessage::user("hi"))
        .with_tool(ToolSpec::new("unused", "", json!({"type": "object"})));
    request.stream = true;

    let output = Gateway::new()
        .with_tool_executor(Arc::new(EchoExecutor))
        .execute_with_adapter(request, &adapter, CancellationToken::new())
        .await
        .unwrap();

    let mut execution = match output {
        ExecutionOutput::Streaming(execution) => execution,
        ExecutionOutput::Completed(_) => panic!("expected a streaming execution"),
    };
    let text = drain(&mut execution.stream).await;
    assert_eq!(text, "Direct answer.");
    assert_eq!(execution.execution.tokens.total, 10);
}

#[tokio::test]
async fn streaming_structured_final_call_carries_schema_and_no_tools() {
    let adapter = MockAdapter::new(ProviderId::Google, "gemini-2.5-flash");
    adapter
        .push_turn(ModelTurn {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: "lookup-1".to_string(),
                name: "lookup".to_string(),
                arguments: json!({"q": "rust"}),
            }],
            usage: TokenUsage::default(),
        })
        .await;
    adapter
        .push_stream(vec![StreamEvent::Text("{\"answer\": \"ok\"}".to_string())])
        .await;

    let mut request = ProviderRequest::new("gemini-2.5-flash")
        .with_message(ChatMessage::user("look it up"))
        .with_tool(
            ToolSpec::new("lookup", "", json!({"type": "object"}))
                .with_usage_control(UsageControl::Force),
        )
        .with_response_format(json!({
            "type": "object",
            "properties": {"answer": {"type": "string"}}
        }));
    request.stream = true;

    let output = Gateway::new()
        .with_tool_executor(Arc::new(EchoExecutor))
        .execute_with_adapter(request, &adapter, CancellationToken::new())
        .await
        .unwrap();

    let mut execution = match output {
        ExecutionOutput::Streaming(execution) => execution,
        ExecutionOutput::Completed(_) => panic!("expected a streaming execution"),
    };
    let text = drain(&mut execution.stream).await;
    assert_eq!(text, "{\"answer\": \"ok\"}");

    let streamed = adapter.streamed_payloads.lock().await;
    assert_eq!(streamed.len(), 1);
    assert!(streamed[0].tools.is_empty());
    assert!(streamed[0].response_schema.is_some());
}
