//! Environment lookups and hosted-deployment contracts.
//!
//! The gateway reads three environment variables (`OLLAMA_URL`,
//! `AZURE_OPENAI_ENDPOINT`, `AZURE_OPENAI_API_VERSION`) and consumes two
//! hosted-deployment collaborators: a rotating API-key provider and the
//! hosted cost-multiplier flags.  Both are traits/values supplied by the
//! caller so the gateway itself stays deployment-agnostic.

use async_trait::async_trait;

use crate::modelgate::registry::ProviderId;

/// Default Azure `api-version` when neither the request nor the environment
/// supplies one.
pub const DEFAULT_AZURE_API_VERSION: &str = "2024-07-01-preview";

/// Base URL of the local Ollama instance (`OLLAMA_URL`, default
/// `http://localhost:11434`).
pub fn ollama_url() -> String {
    std::env::var("OLLAMA_URL").unwrap_or_else(|_| "http://localhost:11434".to_string())
}

/// Azure OpenAI endpoint from `AZURE_OPENAI_ENDPOINT`, if set.
pub fn azure_endpoint() -> Option<String> {
    std::env::var("AZURE_OPENAI_ENDPOINT").ok().filter(|v| !v.is_empty())
}

/// Azure api-version from `AZURE_OPENAI_API_VERSION`, with the documented
/// default.
pub fn azure_api_version() -> String {
    std::env::var("AZURE_OPENAI_API_VERSION")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string())
}

/// Hosted-deployment flags.  On hosted installs the gateway bills through its
/// own keys and scales costs by a multiplier; self-hosted installs keep the
/// identity multiplier and always use caller keys.
#[derive(Debug, Clone, Copy)]
pub struct HostedEnv {
    /// Whether this install is the hosted offering.
    pub hosted: bool,
    /// Applied to computed costs after unit-cost calculation.
    pub cost_multiplier: f64,
}

impl Default for HostedEnv {
    fn default() -> Self {
        HostedEnv {
            hosted: false,
            cost_multiplier: 1.0,
        }
    }
}

/// Rotating API-key retrieval for hosted OpenAI/Anthropic traffic.
///
/// The orchestrator asks this first for those providers on hosted installs;
/// on failure it falls back to the caller's key and, lacking both, fails the
/// request before any HTTP call.
#[async_trait]
pub trait ApiKeyProvider: Send + Sync {
    /// Return the next key for `provider`, or an error when rotation is
    /// unavailable.
    async fn rotating_key(&self, provider: ProviderId) -> Result<String, String>;
}

/// Key provider that never yields a key.  The default for self-hosted
/// installs, where the caller's key is the only source.
pub struct NoRotation;

#[async_trait]
impl ApiKeyProvider for NoRotation {
    async fn rotating_key(&self, _provider: ProviderId) -> Result<String, String> {
        Err("key rotation is not configured".to_string())
    }
}
