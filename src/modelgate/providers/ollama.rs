//! Adapter for a local Ollama instance.
//!
//! Ollama exposes an OpenAI-compatible surface at `/v1/chat/completions`, so
//! the wire work delegates to the OpenAI-family adapter pointed at
//! `OLLAMA_URL`.  Two quirks are handled here: local models like to wrap
//! JSON answers in a ```` ```json ```` fence, which is stripped before the
//! content is returned, and the model list is discovered from `/api/tags` on
//! first use; a failed discovery logs and leaves the provider with no
//! models rather than raising.

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::modelgate::environment::ollama_url;
use crate::modelgate::error::GatewayResult;
use crate::modelgate::providers::http::get_json;
use crate::modelgate::providers::openai::OpenAiAdapter;
use crate::modelgate::providers::{ModelPayload, ModelStream, ModelTurn, ProviderAdapter};
use crate::modelgate::registry::{self, ProviderId};

static DISCOVERY: OnceCell<()> = OnceCell::const_new();

/// Client for Ollama's OpenAI-compatible endpoint.
pub struct OllamaAdapter {
    inner: OpenAiAdapter,
}

impl OllamaAdapter {
    pub fn new(model: &str) -> Self {
        let base_url = format!("{}/v1", ollama_url().trim_end_matches('/'));
        OllamaAdapter {
            inner: OpenAiAdapter::with_base_url(ProviderId::Ollama, model, String::new(), &base_url),
        }
    }
}

/// Populate the registry's Ollama slot from `/api/tags`, once per process.
async fn discover_models() {
    DISCOVERY
        .get_or_init(|| async {
            let url = format!("{}/api/tags", ollama_url().trim_end_matches('/'));
            match get_json(&url).await {
                Ok(body) => {
                    let models: Vec<String> = body
                        .get("models")
                        .and_then(serde_json::Value::as_array)
                        .map(|models| {
                            models
                                .iter()
                                .filter_map(|m| m.get("name").and_then(serde_json::Value::as_str))
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default();
                    if log::log_enabled!(log::Level::Info) {
                        log::info!("OllamaAdapter: discovered {} local models", models.len());
                    }
                    registry::update_ollama_models(models);
                }
                Err(e) => {
                    // No local Ollama: the provider stays registered with an
                    // empty model list.
                    if log::log_enabled!(log::Level::Warn) {
                        log::warn!("OllamaAdapter: model discovery failed: {}", e);
                    }
                }
            }
        })
        .await;
}

/// Strip a Markdown code fence from a model answer, when the whole answer is
/// fenced.
pub(crate) fn strip_code_fence(content: &str) -> String {
    let trimmed = content.trim();
    if !trimmed.starts_with("```") {
        return content.to_string();
    }
    let without_close = match trimmed.strip_suffix("```") {
        Some(inner) => inner,
        None => return content.to_string(),
    };
    match without_close.find('\n') {
        // Drop the opening fence line ("```json", "```", ...).
        Some(newline) => without_close[newline + 1..].trim_end().to_string(),
        None => String::new(),
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Ollama
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn call_model(
        &self,
        payload: &ModelPayload,
        cancel: &CancellationToken,
    ) -> GatewayResult<ModelTurn> {
        discover_models().await;
        let mut turn = self.inner.call_model(payload, cancel).await?;
        turn.content = strip_code_fence(&turn.content);
        Ok(turn)
    }

    async fn open_stream(
        &self,
        payload: &ModelPayload,
        cancel: &CancellationToken,
    ) -> GatewayResult<ModelStream> {
        discover_models().await;
        self.inner.open_stream(payload, cancel).await
    }
}
