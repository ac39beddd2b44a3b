//! The tool-call orchestrator and the gateway entry point.
//!
//! [`Gateway::execute`] drives the whole lifecycle of one request: sanitize,
//! plan tool usage, resolve credentials, pick the adapter, then run the
//! multi-iteration loop: parse tool calls out of each response, execute
//! them through the external registry, feed results back, advance the
//! forced-tool queue, and finish with a buffered response or a streaming
//! execution carrying full timing, token, and cost accounting.
//!
//! The loop is sequential with respect to one request: one model call at a
//! time, tool executions run in observed order so time segments stay
//! deterministic.
//!
//! # Example
//!
//! ```rust,no_run
//! use modelgate::orchestrator::Gateway;
//! use modelgate::request::{ChatMessage, ExecutionOutput, ProviderRequest};
//!
//! # async fn run() -> Result<(), modelgate::error::GatewayError> {
//! let gateway = Gateway::new();
//! let request = ProviderRequest::new("gpt-4o")
//!     .with_system_prompt("You are terse.")
//!     .with_message(ChatMessage::user("Say hi."))
//!     .with_api_key(std::env::var("OPENAI_API_KEY").unwrap());
//!
//! match gateway.execute(request).await? {
//!     ExecutionOutput::Completed(response) => println!("{}", response.content),
//!     ExecutionOutput::Streaming(_) => unreachable!("stream flag was not set"),
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::modelgate::accounting::{compute_cost, now_iso, now_ms, SegmentRecorder};
use crate::modelgate::environment::{ApiKeyProvider, HostedEnv, NoRotation};
use crate::modelgate::error::{ErrorKind, GatewayError, GatewayResult};
use crate::modelgate::planner::{effective_choice, plan_tools, ForcedToolTracker, ToolChoice};
use crate::modelgate::providers::{
    adapter_for, anthropic, ModelPayload, ProviderAdapter, StreamEvent,
};
use crate::modelgate::registry::{provider_of, ProviderId};
use crate::modelgate::request::{
    ChatMessage, Cost, ExecutionOutput, ProviderRequest, ProviderResponse, StreamingExecution,
    TokenUsage, ToolCallRecord,
};
use crate::modelgate::sanitize::sanitize_request;
use crate::modelgate::stream::{
    complete_event, detected_event, start_event, text_byte_stream, tool_call_event_frame,
    with_prelude,
};
use crate::modelgate::tools::{
    merge_arguments, merge_for_display, with_execution_context, ToolCall, ToolExecutor, ToolSpec,
};

/// Upper bound on follow-up model calls in one execution.
pub const MAX_ITERATIONS: usize = 10;

/// The provider gateway.  Holds the external collaborators (tool executor,
/// key rotation, hosted flags) and exposes [`execute`](Gateway::execute).
pub struct Gateway {
    tool_executor: Option<Arc<dyn ToolExecutor>>,
    key_provider: Arc<dyn ApiKeyProvider>,
    hosted: HostedEnv,
}

impl Default for Gateway {
    fn default() -> Self {
        Gateway::new()
    }
}

impl Gateway {
    /// Gateway with no tool executor, no key rotation, and self-hosted
    /// defaults.
    pub fn new() -> Self {
        Gateway {
            tool_executor: None,
            key_provider: Arc::new(NoRotation),
            hosted: HostedEnv::default(),
        }
    }

    /// Attach the external tool registry (builder pattern).  Without one,
    /// every tool call the model makes is skipped as unknown.
    pub fn with_tool_executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.tool_executor = Some(executor);
        self
    }

    /// Attach the rotating-key provider used for hosted OpenAI/Anthropic
    /// traffic (builder pattern).
    pub fn with_key_provider(mut self, provider: Arc<dyn ApiKeyProvider>) -> Self {
        self.key_provider = provider;
        self
    }

    /// Set hosted-deployment flags (builder pattern).
    pub fn with_hosted_env(mut self, hosted: HostedEnv) -> Self {
        self.hosted = hosted;
        self
    }

    /// Execute a request with a fresh cancellation token.
    pub async fn execute(&self, request: ProviderRequest) -> GatewayResult<ExecutionOutput> {
        self.execute_with_cancellation(request, CancellationToken::new())
            .await
    }

    /// Execute a request.  Cancelling `cancel` aborts in-flight provider
    /// calls, closes any active stream reader, and skips tool executions
    /// that have not started.
    pub async fn execute_with_cancellation(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> GatewayResult<ExecutionOutput> {
        let provider = request
            .provider
            .unwrap_or_else(|| provider_of(&request.model));
        let recorder = SegmentRecorder::start();

        let api_key = match self.resolve_api_key(provider, &request).await {
            Ok(key) => key,
            Err(e) => return Err(e.with_timing(recorder.error_timing())),
        };
        let sanitized = sanitize_request(&request);
        let adapter = match adapter_for(provider, &sanitized, api_key) {
            Ok(adapter) => adapter,
            Err(e) => return Err(e.with_timing(recorder.error_timing())),
        };

        self.run(adapter.as_ref(), sanitized, recorder, cancel).await
    }

    /// Execute against a caller-supplied adapter.  This is the seam custom
    /// backends plug into; the stock providers go through
    /// [`execute`](Gateway::execute).
    pub async fn execute_with_adapter(
        &self,
        request: ProviderRequest,
        adapter: &dyn ProviderAdapter,
        cancel: CancellationToken,
    ) -> GatewayResult<ExecutionOutput> {
        let recorder = SegmentRecorder::start();
        let sanitized = sanitize_request(&request);
        self.run(adapter, sanitized, recorder, cancel).await
    }

    /// Resolve the API key: rotation first for hosted OpenAI/Anthropic,
    /// then the caller's key, else fail before any HTTP call.
    async fn resolve_api_key(
        &self,
        provider: ProviderId,
        request: &ProviderRequest,
    ) -> GatewayResult<String> {
        if provider == ProviderId::Ollama {
            return Ok(String::new());
        }
        if self.hosted.hosted
            && matches!(provider, ProviderId::OpenAi | ProviderId::Anthropic)
        {
            match self.key_provider.rotating_key(provider).await {
                Ok(key) => return Ok(key),
                Err(e) => {
                    if log::log_enabled!(log::Level::Warn) {
                        log::warn!(
                            "Gateway: key rotation failed for '{}', falling back to request key: {}",
                            provider,
                            e
                        );
                    }
                }
            }
        }
        request
            .api_key
            .clone()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| GatewayError::new(ErrorKind::MissingApiKey(provider)))
    }

    /// The orchestration loop proper.
    async fn run(
        &self,
        adapter: &dyn ProviderAdapter,
        request: ProviderRequest,
        mut recorder: SegmentRecorder,
        cancel: CancellationToken,
    ) -> GatewayResult<ExecutionOutput> {
        let provider = adapter.provider();
        let plan = plan_tools(&request.tools, provider);
        let mut tracker = ForcedToolTracker::new(plan.forced_queue.clone());
        let mut steering = plan.initial_choice.clone();

        // Native structured output; the sanitizer already folded legacy
        // formats into the system prompt.
        let structured = request.response_format.clone();
        // Anthropic, Google and xAI reject structured output combined with
        // tools in one call; for them the schema waits for the final phase.
        let schema_with_tools = !matches!(
            provider,
            ProviderId::Anthropic | ProviderId::Google | ProviderId::Xai
        );

        let mut conversation: Vec<ChatMessage> = Vec::new();
        if let Some(context) = request.context.as_deref().filter(|c| !c.is_empty()) {
            conversation.push(ChatMessage::user(context));
        }
        conversation.extend(request.messages.iter().cloned());

        let emit_frames =
            request.stream && request.stream_tool_calls && provider == ProviderId::Anthropic;
        let mut frames: Vec<Vec<u8>> = Vec::new();

        let mut tokens = TokenUsage::default();
        let mut tool_call_records: Vec<ToolCallRecord> = Vec::new();
        let mut tool_results: Vec<serde_json::Value> = Vec::new();
        let mut executed_ids: HashSet<String> = HashSet::new();
        let mut executed_signatures: HashSet<String> = HashSet::new();

        let payload = |messages: &[ChatMessage],
                       tools: &[ToolSpec],
                       choice: &ToolChoice,
                       schema: Option<&serde_json::Value>| {
            ModelPayload {
                system_prompt: request.system_prompt.clone(),
                messages: messages.to_vec(),
                tools: tools.to_vec(),
                tool_choice: choice.clone(),
                response_schema: schema.cloned(),
                temperature: request.temperature,
                max_tokens: request.max_tokens,
            }
        };

        // No tools at all: a single call, streamed or buffered.
        if plan.tools.is_empty() {
            let body = payload(&conversation, &[], &ToolChoice::None, structured.as_ref());
            if request.stream {
                let start = now_ms();
                let events = adapter
                    .open_stream(&body, &cancel)
                    .await
                    .map_err(|e| e.with_timing(recorder.error_timing()))?;
                recorder.record_model(adapter.model(), start, now_ms());
                return Ok(self.streaming_output(
                    adapter,
                    events,
                    frames,
                    tokens,
                    tool_call_records,
                    tool_results,
                    recorder,
                ));
            }
            let start = now_ms();
            let turn = adapter
                .call_model(&body, &cancel)
                .await
                .map_err(|e| e.with_timing(recorder.error_timing()))?;
            recorder.record_model(adapter.model(), start, now_ms());
            tokens.accumulate(&turn.usage);
            return Ok(self.completed_output(
                adapter,
                &request,
                turn.content,
                tokens,
                tool_call_records,
                tool_results,
                recorder,
            ));
        }

        // Initial model call.  Tool-bearing calls are always buffered; tool
        // arguments cannot be safely streamed to the user.
        let call_schema = if schema_with_tools {
            structured.as_ref()
        } else {
            None
        };
        let body = payload(&conversation, &plan.tools, &steering, call_schema);
        log_dispatch(provider, adapter.model(), &body);
        let start = now_ms();
        let mut turn = adapter
            .call_model(&body, &cancel)
            .await
            .map_err(|e| e.with_timing(recorder.error_timing()))?;
        recorder.record_model(adapter.model(), start, now_ms());
        tokens.accumulate(&turn.usage);
        let observed: Vec<String> = turn.tool_calls.iter().map(|c| c.name.clone()).collect();
        steering = effective_choice(provider, tracker.advance(&observed));

        let mut iteration = 0usize;
        // Set when a terminal model call was already issued inside the loop
        // (duplicate guard or structured final phase).
        let mut final_call_made = false;
        while iteration < MAX_ITERATIONS {
            if cancel.is_cancelled() {
                return Err(
                    GatewayError::new(ErrorKind::Aborted).with_timing(recorder.error_timing())
                );
            }
            if turn.tool_calls.is_empty() {
                break;
            }

            // Drop calls already processed this request (providers have been
            // observed to repeat themselves) and calls naming unknown tools.
            let mut runnable: Vec<ToolCall> = Vec::new();
            for call in &turn.tool_calls {
                if executed_ids.contains(&call.id)
                    || executed_signatures.contains(&call.signature())
                {
                    if log::log_enabled!(log::Level::Warn) {
                        log::warn!("Gateway: skipping repeated tool call '{}'", call.name);
                    }
                    continue;
                }
                if !plan.tools.iter().any(|tool| tool.id == call.name) {
                    if log::log_enabled!(log::Level::Warn) {
                        log::warn!("Gateway: model requested unknown tool '{}'", call.name);
                    }
                    continue;
                }
                runnable.push(call.clone());
            }

            if runnable.is_empty() {
                // Every call was a repeat: stop tool usage outright and ask
                // for a final answer.
                steering = ToolChoice::None;
                let (final_tools, final_schema) = self.final_call_shape(
                    schema_with_tools,
                    &plan.tools,
                    structured.as_ref(),
                );
                if request.stream {
                    return self
                        .stream_final_call(
                            adapter,
                            payload(&conversation, final_tools, &steering, final_schema),
                            frames,
                            tokens,
                            tool_call_records,
                            tool_results,
                            recorder,
                            &cancel,
                        )
                        .await;
                }
                let start = now_ms();
                turn = adapter
                    .call_model(
                        &payload(&conversation, final_tools, &steering, final_schema),
                        &cancel,
                    )
                    .await
                    .map_err(|e| e.with_timing(recorder.error_timing()))?;
                recorder.record_model(adapter.model(), start, now_ms());
                tokens.accumulate(&turn.usage);
                final_call_made = true;
                break;
            }

            if emit_frames {
                for call in &runnable {
                    frames.push(tool_call_event_frame(&detected_event(call)));
                }
                frames.push(tool_call_event_frame(&start_event(&runnable)));
            }

            // Execute in observed order; each processed call appends one
            // assistant turn and one tool-result turn, in that order.
            for call in &runnable {
                if cancel.is_cancelled() {
                    return Err(
                        GatewayError::new(ErrorKind::Aborted).with_timing(recorder.error_timing())
                    );
                }

                let spec = plan
                    .tools
                    .iter()
                    .find(|tool| tool.id == call.name)
                    .expect("runnable calls name a planned tool");

                let merged = merge_arguments(&spec.params, &call.arguments);
                let exec_params = with_execution_context(
                    merged,
                    request.workflow_id.as_deref(),
                    request.chat_id.as_deref(),
                    request.environment_variables.as_ref(),
                );

                let start_iso = now_iso();
                let start = now_ms();
                let outcome = match &self.tool_executor {
                    Some(executor) => executor.execute_tool(&call.name, exec_params, true).await,
                    None => crate::modelgate::tools::ToolOutcome::failure(format!(
                        "no tool executor is configured (tool '{}')",
                        call.name
                    )),
                };
                let end = now_ms();
                recorder.record_tool(&call.name, start, end);

                executed_ids.insert(call.id.clone());
                executed_signatures.insert(call.signature());

                let feedback = if outcome.success {
                    let output = outcome.output.clone().unwrap_or(serde_json::Value::Null);
                    tool_results.push(output.clone());
                    serde_json::to_string(&output).unwrap_or_else(|_| "null".to_string())
                } else {
                    let message = outcome
                        .error
                        .clone()
                        .unwrap_or_else(|| "Unknown error".to_string());
                    json!({"error": true, "message": message, "tool": call.name}).to_string()
                };

                tool_call_records.push(ToolCallRecord {
                    name: call.name.clone(),
                    arguments: merge_for_display(&spec.params, &call.arguments),
                    start_time: start_iso,
                    end_time: now_iso(),
                    duration_ms: end.saturating_sub(start),
                    result: outcome.output.clone(),
                    success: outcome.success,
                    error: outcome.error.clone(),
                });

                conversation.push(ChatMessage::assistant_with_tool_calls(
                    "",
                    vec![call.clone()],
                ));
                conversation.push(ChatMessage::tool_result(call.id.clone(), feedback));

                if emit_frames {
                    let record = tool_call_records.last().expect("record just pushed");
                    frames.push(tool_call_event_frame(&complete_event(
                        call,
                        record.success,
                        record.duration_ms,
                    )));
                }
            }

            // Structured final phase: once the forced queue is empty, the
            // deferred schema rides on a toolless call and ends the loop.
            if structured.is_some() && !schema_with_tools && tracker.is_drained() {
                let schema = structured.as_ref();
                if request.stream {
                    return self
                        .stream_final_call(
                            adapter,
                            payload(&conversation, &[], &ToolChoice::None, schema),
                            frames,
                            tokens,
                            tool_call_records,
                            tool_results,
                            recorder,
                            &cancel,
                        )
                        .await;
                }
                let start = now_ms();
                turn = adapter
                    .call_model(&payload(&conversation, &[], &ToolChoice::None, schema), &cancel)
                    .await
                    .map_err(|e| e.with_timing(recorder.error_timing()))?;
                recorder.record_model(adapter.model(), start, now_ms());
                tokens.accumulate(&turn.usage);
                final_call_made = true;
                break;
            }

            // Streaming delivery: the first non-forced call after tools ran
            // is the final one, and it streams.
            if request.stream && tracker.is_drained() {
                let call_schema = if schema_with_tools {
                    structured.as_ref()
                } else {
                    None
                };
                return self
                    .stream_final_call(
                        adapter,
                        payload(&conversation, &plan.tools, &steering, call_schema),
                        frames,
                        tokens,
                        tool_call_records,
                        tool_results,
                        recorder,
                        &cancel,
                    )
                    .await;
            }

            // Follow-up buffered call.
            let call_schema = if schema_with_tools {
                structured.as_ref()
            } else {
                None
            };
            let body = payload(&conversation, &plan.tools, &steering, call_schema);
            log_dispatch(provider, adapter.model(), &body);
            let start = now_ms();
            turn = adapter
                .call_model(&body, &cancel)
                .await
                .map_err(|e| e.with_timing(recorder.error_timing()))?;
            recorder.record_model(adapter.model(), start, now_ms());
            tokens.accumulate(&turn.usage);
            let observed: Vec<String> = turn.tool_calls.iter().map(|c| c.name.clone()).collect();
            steering =
                effective_choice(provider, tracker.advance(&observed));
            iteration += 1;
        }

        // The loop finished without a terminal call of its own.  Backends
        // that cannot combine schema and tools still owe the deferred schema
        // one toolless call.
        if structured.is_some() && !schema_with_tools && !final_call_made {
            let body = payload(&conversation, &[], &ToolChoice::None, structured.as_ref());
            if request.stream {
                return self
                    .stream_final_call(
                        adapter,
                        body,
                        frames,
                        tokens,
                        tool_call_records,
                        tool_results,
                        recorder,
                        &cancel,
                    )
                    .await;
            }
            let start = now_ms();
            turn = adapter
                .call_model(&body, &cancel)
                .await
                .map_err(|e| e.with_timing(recorder.error_timing()))?;
            recorder.record_model(adapter.model(), start, now_ms());
            tokens.accumulate(&turn.usage);
        }

        if request.stream {
            // Tools were offered but the model answered directly; replay the
            // buffered text so the caller still gets the stream it asked for.
            let content = turn.content.clone();
            let events: crate::modelgate::providers::ModelStream = Box::pin(
                futures_util::stream::iter(vec![Ok(StreamEvent::Text(content))]),
            );
            return Ok(self.streaming_output(
                adapter,
                events,
                frames,
                tokens,
                tool_call_records,
                tool_results,
                recorder,
            ));
        }

        Ok(self.completed_output(
            adapter,
            &request,
            turn.content,
            tokens,
            tool_call_records,
            tool_results,
            recorder,
        ))
    }

    /// Tools and schema for a "stop calling tools" final call: exclusive
    /// backends drop the tools to let the schema ride, the rest keep the
    /// tools with steering switched off.
    fn final_call_shape<'a>(
        &self,
        schema_with_tools: bool,
        tools: &'a [ToolSpec],
        structured: Option<&'a serde_json::Value>,
    ) -> (&'a [ToolSpec], Option<&'a serde_json::Value>) {
        if structured.is_some() && !schema_with_tools {
            (&[], structured)
        } else {
            (tools, structured.filter(|_| schema_with_tools))
        }
    }

    /// Open the final streaming call and wrap it for the caller.
    #[allow(clippy::too_many_arguments)]
    async fn stream_final_call(
        &self,
        adapter: &dyn ProviderAdapter,
        body: ModelPayload,
        frames: Vec<Vec<u8>>,
        tokens: TokenUsage,
        tool_call_records: Vec<ToolCallRecord>,
        tool_results: Vec<serde_json::Value>,
        mut recorder: SegmentRecorder,
        cancel: &CancellationToken,
    ) -> GatewayResult<ExecutionOutput> {
        let start = now_ms();
        let events = adapter
            .open_stream(&body, cancel)
            .await
            .map_err(|e| e.with_timing(recorder.error_timing()))?;
        recorder.record_model(adapter.model(), start, now_ms());
        Ok(self.streaming_output(
            adapter,
            events,
            frames,
            tokens,
            tool_call_records,
            tool_results,
            recorder,
        ))
    }

    /// Assemble the [`StreamingExecution`] handed back to the caller.
    #[allow(clippy::too_many_arguments)]
    fn streaming_output(
        &self,
        adapter: &dyn ProviderAdapter,
        events: crate::modelgate::providers::ModelStream,
        frames: Vec<Vec<u8>>,
        tokens: TokenUsage,
        tool_call_records: Vec<ToolCallRecord>,
        tool_results: Vec<serde_json::Value>,
        recorder: SegmentRecorder,
    ) -> ExecutionOutput {
        let final_usage = Arc::new(Mutex::new(None));
        let bytes = text_byte_stream(events, final_usage.clone());
        let stream = if frames.is_empty() {
            bytes
        } else {
            with_prelude(frames, bytes)
        };

        let execution = ProviderResponse {
            content: String::new(),
            model: adapter.model().to_string(),
            tokens,
            tool_calls: tool_call_records,
            tool_results,
            timing: recorder.finish(),
            cost: None,
            is_streaming: true,
        };

        ExecutionOutput::Streaming(StreamingExecution {
            stream,
            execution,
            final_usage,
        })
    }

    /// Assemble the buffered [`ProviderResponse`].
    #[allow(clippy::too_many_arguments)]
    fn completed_output(
        &self,
        adapter: &dyn ProviderAdapter,
        request: &ProviderRequest,
        content: String,
        tokens: TokenUsage,
        tool_call_records: Vec<ToolCallRecord>,
        tool_results: Vec<serde_json::Value>,
        recorder: SegmentRecorder,
    ) -> ExecutionOutput {
        let use_cached_input = request
            .context
            .as_deref()
            .map(|context| !context.is_empty())
            .unwrap_or(false);
        let cost = compute_cost(
            adapter.model(),
            &tokens,
            use_cached_input,
            self.hosted.cost_multiplier,
        )
        .or_else(|| self.fallback_cost(adapter.provider(), &tokens, &tool_call_records));

        ExecutionOutput::Completed(Box::new(ProviderResponse {
            content,
            model: adapter.model().to_string(),
            tokens,
            tool_calls: tool_call_records,
            tool_results,
            timing: recorder.finish(),
            cost,
            is_streaming: false,
        }))
    }

    /// Anthropic tool loops get a flat placeholder estimate when the price
    /// table has no entry for the model.
    fn fallback_cost(
        &self,
        provider: ProviderId,
        tokens: &TokenUsage,
        tool_call_records: &[ToolCallRecord],
    ) -> Option<Cost> {
        if provider == ProviderId::Anthropic && !tool_call_records.is_empty() {
            Some(anthropic::fallback_cost(tokens))
        } else {
            None
        }
    }
}

/// One-shot entry point: execute `request` against an explicit provider with
/// default collaborators (no tool executor, no key rotation, self-hosted).
///
/// Most callers hold a configured [`Gateway`] instead; this exists for the
/// simple "one request, one provider" shape.
///
/// # Example
///
/// ```rust,no_run
/// use modelgate::orchestrator::execute_provider_request;
/// use modelgate::registry::ProviderId;
/// use modelgate::request::{ChatMessage, ProviderRequest};
///
/// # async fn run() -> Result<(), modelgate::error::GatewayError> {
/// let request = ProviderRequest::new("gpt-4o")
///     .with_message(ChatMessage::user("Say hi."))
///     .with_api_key("sk-...");
/// let output = execute_provider_request(ProviderId::OpenAi, request).await?;
/// # let _ = output;
/// # Ok(())
/// # }
/// ```
pub async fn execute_provider_request(
    provider: ProviderId,
    mut request: ProviderRequest,
) -> GatewayResult<ExecutionOutput> {
    request.provider = Some(provider);
    Gateway::new().execute(request).await
}

/// Debug-log the shape of an outbound call.
fn log_dispatch(provider: ProviderId, model: &str, payload: &ModelPayload) {
    if log::log_enabled!(log::Level::Debug) {
        log::debug!(
            "Gateway: dispatching to '{}' model={} messages={} tools={} structured={}",
            provider,
            model,
            payload.messages.len(),
            payload.tools.len(),
            payload.response_schema.is_some()
        );
    }
}
