//! Model and capability registry.
//!
//! A static table of the nine supported providers: display names, default
//! models, per-model pricing (USD per million tokens), temperature ranges, and
//! tool-usage-control support.  Model ids resolve to a provider by exact
//! case-insensitive match first, then by regex pattern, and finally fall back
//! to Ollama so that locally pulled models never fail resolution.
//!
//! The table is read-only after initialization except for the Ollama model
//! slot, which is refreshed from `/api/tags` discovery and swapped
//! copy-on-write.
//!
//! # Example
//!
//! ```rust
//! use modelgate::registry::{provider_of, supports_temperature, ProviderId};
//!
//! assert_eq!(provider_of("gpt-4o"), ProviderId::OpenAi);
//! assert_eq!(provider_of("claude-sonnet-4-0"), ProviderId::Anthropic);
//! assert_eq!(provider_of("some-local-model"), ProviderId::Ollama);
//! assert!(!supports_temperature("o1"));
//! ```

use std::fmt;
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;
use regex::Regex;

/// Identifier for every supported backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderId {
    OpenAi,
    Azure,
    Anthropic,
    Google,
    Xai,
    Cerebras,
    Deepseek,
    Groq,
    Ollama,
}

impl ProviderId {
    /// Stable lowercase identifier, e.g. `"openai"` or `"azure-openai"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "openai",
            ProviderId::Azure => "azure-openai",
            ProviderId::Anthropic => "anthropic",
            ProviderId::Google => "google",
            ProviderId::Xai => "xai",
            ProviderId::Cerebras => "cerebras",
            ProviderId::Deepseek => "deepseek",
            ProviderId::Groq => "groq",
            ProviderId::Ollama => "ollama",
        }
    }

    /// All providers in registry order.
    pub fn all() -> &'static [ProviderId] {
        &[
            ProviderId::OpenAi,
            ProviderId::Azure,
            ProviderId::Anthropic,
            ProviderId::Google,
            ProviderId::Xai,
            ProviderId::Cerebras,
            ProviderId::Deepseek,
            ProviderId::Groq,
            ProviderId::Ollama,
        ]
    }

    /// True when this backend is part of the OpenAI-compatible wire family.
    pub fn is_openai_family(&self) -> bool {
        matches!(
            self,
            ProviderId::OpenAi
                | ProviderId::Azure
                | ProviderId::Xai
                | ProviderId::Cerebras
                | ProviderId::Deepseek
                | ProviderId::Groq
                | ProviderId::Ollama
        )
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive temperature bounds accepted by a model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureRange {
    pub min: f64,
    pub max: f64,
}

/// Per-model capability record.  Reasoning-tier models (o1, o3, o4-mini,
/// deepseek-reasoner) declare no temperature range at all, which is how the
/// sanitizer knows to drop the knob.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelCapabilities {
    /// Accepted temperature range, or `None` when the knob must not be sent.
    pub temperature: Option<TemperatureRange>,
    /// Whether the model supports computer-use style tooling.
    pub computer_use: bool,
}

/// USD per million tokens, with an optional discounted rate for cached input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input: f64,
    pub cached_input: Option<f64>,
    pub output: f64,
    /// Date the rates were last checked against the provider's price sheet.
    pub updated_at: &'static str,
}

impl ModelPricing {
    const fn new(
        input: f64,
        cached_input: Option<f64>,
        output: f64,
        updated_at: &'static str,
    ) -> Self {
        ModelPricing {
            input,
            cached_input,
            output,
            updated_at,
        }
    }

    /// Zero-rate pricing used for locally served models.
    pub const fn free() -> Self {
        ModelPricing::new(0.0, None, 0.0, "2025-06-01")
    }
}

/// A chat model known to the registry.
#[derive(Debug, Clone)]
pub struct ModelEntry {
    pub id: &'static str,
    pub pricing: ModelPricing,
    pub capabilities: ModelCapabilities,
}

/// A provider's registry row.
pub struct ProviderEntry {
    pub id: ProviderId,
    pub display_name: &'static str,
    pub default_model: &'static str,
    pub models: Vec<ModelEntry>,
    /// Fallback patterns tried after exact model-id lookup fails.
    pub patterns: Vec<Regex>,
    /// Whether the backend honors `tool_choice`-style forcing.  Cerebras,
    /// Groq and Ollama accept a tools array but only run in auto mode.
    pub tool_usage_control: bool,
}

const TEMP_0_2: Option<TemperatureRange> = Some(TemperatureRange { min: 0.0, max: 2.0 });
const TEMP_0_1: Option<TemperatureRange> = Some(TemperatureRange { min: 0.0, max: 1.0 });
const TEMP_0_1_5: Option<TemperatureRange> = Some(TemperatureRange { min: 0.0, max: 1.5 });

fn chat_model(
    id: &'static str,
    pricing: ModelPricing,
    temperature: Option<TemperatureRange>,
) -> ModelEntry {
    ModelEntry {
        id,
        pricing,
        capabilities: ModelCapabilities {
            temperature,
            computer_use: false,
        },
    }
}

fn openai_models() -> Vec<ModelEntry> {
    vec![
        chat_model("gpt-4o", ModelPricing::new(2.5, Some(1.25), 10.0, "2025-06-01"), TEMP_0_2),
        chat_model("gpt-4o-mini", ModelPricing::new(0.15, Some(0.075), 0.6, "2025-06-01"), TEMP_0_2),
        chat_model("gpt-4.1", ModelPricing::new(2.0, Some(0.5), 8.0, "2025-06-01"), TEMP_0_2),
        chat_model("gpt-4.1-mini", ModelPricing::new(0.4, Some(0.1), 1.6, "2025-06-01"), TEMP_0_2),
        chat_model("gpt-4.1-nano", ModelPricing::new(0.1, Some(0.025), 0.4, "2025-06-01"), TEMP_0_2),
        // Reasoning tiers: no temperature knob.
        chat_model("o1", ModelPricing::new(15.0, Some(7.5), 60.0, "2025-06-01"), None),
        chat_model("o3", ModelPricing::new(2.0, Some(0.5), 8.0, "2025-06-01"), None),
        chat_model("o4-mini", ModelPricing::new(1.1, Some(0.275), 4.4, "2025-06-01"), None),
    ]
}

fn azure_models() -> Vec<ModelEntry> {
    vec![
        chat_model("azure/gpt-4o", ModelPricing::new(2.5, Some(1.25), 10.0, "2025-06-01"), TEMP_0_2),
        chat_model("azure/gpt-4.1", ModelPricing::new(2.0, Some(0.5), 8.0, "2025-06-01"), TEMP_0_2),
        chat_model("azure/o4-mini", ModelPricing::new(1.1, Some(0.275), 4.4, "2025-06-01"), None),
    ]
}

fn anthropic_models() -> Vec<ModelEntry> {
    vec![
        chat_model("claude-opus-4-1", ModelPricing::new(15.0, Some(1.5), 75.0, "2025-08-01"), TEMP_0_1),
        chat_model("claude-opus-4-0", ModelPricing::new(15.0, Some(1.5), 75.0, "2025-06-01"), TEMP_0_1),
        chat_model("claude-sonnet-4-0", ModelPricing::new(3.0, Some(0.3), 15.0, "2025-06-01"), TEMP_0_1),
        chat_model("claude-3-7-sonnet-latest", ModelPricing::new(3.0, Some(0.3), 15.0, "2025-06-01"), TEMP_0_1),
        chat_model("claude-3-5-haiku-latest", ModelPricing::new(0.8, Some(0.08), 4.0, "2025-06-01"), TEMP_0_1),
    ]
}

fn google_models() -> Vec<ModelEntry> {
    vec![
        chat_model("gemini-2.5-pro", ModelPricing::new(1.25, Some(0.31), 10.0, "2025-06-01"), TEMP_0_2),
        chat_model("gemini-2.5-flash", ModelPricing::new(0.3, Some(0.075), 2.5, "2025-06-01"), TEMP_0_2),
        chat_model("gemini-2.0-flash", ModelPricing::new(0.1, Some(0.025), 0.4, "2025-06-01"), TEMP_0_2),
    ]
}

fn xai_models() -> Vec<ModelEntry> {
    vec![
        chat_model("grok-4", ModelPricing::new(3.0, Some(0.75), 15.0, "2025-08-01"), TEMP_0_2),
        chat_model("grok-3", ModelPricing::new(3.0, Some(0.75), 15.0, "2025-06-01"), TEMP_0_2),
        chat_model("grok-3-mini", ModelPricing::new(0.3, Some(0.075), 0.5, "2025-06-01"), TEMP_0_2),
    ]
}

fn cerebras_models() -> Vec<ModelEntry> {
    vec![
        chat_model("cerebras/llama-3.3-70b", ModelPricing::new(0.85, None, 1.2, "2025-06-01"), TEMP_0_1_5),
        chat_model("cerebras/llama-3.1-8b", ModelPricing::new(0.1, None, 0.1, "2025-06-01"), TEMP_0_1_5),
    ]
}

fn deepseek_models() -> Vec<ModelEntry> {
    vec![
        chat_model("deepseek-chat", ModelPricing::new(0.27, Some(0.07), 1.1, "2025-06-01"), TEMP_0_2),
        // R1: reasoning model, temperature unsupported.
        chat_model("deepseek-reasoner", ModelPricing::new(0.55, Some(0.14), 2.19, "2025-06-01"), None),
    ]
}

fn groq_models() -> Vec<ModelEntry> {
    vec![
        chat_model("groq/llama-3.3-70b-versatile", ModelPricing::new(0.59, None, 0.79, "2025-06-01"), TEMP_0_2),
        chat_model("groq/llama-3.1-8b-instant", ModelPricing::new(0.05, None, 0.08, "2025-06-01"), TEMP_0_2),
    ]
}

fn patterns(sources: &[&str]) -> Vec<Regex> {
    sources
        .iter()
        .map(|p| Regex::new(p).expect("registry pattern must compile"))
        .collect()
}

lazy_static! {
    static ref PROVIDERS: Vec<ProviderEntry> = vec![
        ProviderEntry {
            id: ProviderId::OpenAi,
            display_name: "OpenAI",
            default_model: "gpt-4o",
            models: openai_models(),
            patterns: patterns(&[r"^gpt-", r"^o\d"]),
            tool_usage_control: true,
        },
        ProviderEntry {
            id: ProviderId::Azure,
            display_name: "Azure OpenAI",
            default_model: "azure/gpt-4o",
            models: azure_models(),
            patterns: patterns(&[r"^azure/"]),
            tool_usage_control: true,
        },
        ProviderEntry {
            id: ProviderId::Anthropic,
            display_name: "Anthropic",
            default_model: "claude-sonnet-4-0",
            models: anthropic_models(),
            patterns: patterns(&[r"^claude"]),
            tool_usage_control: true,
        },
        ProviderEntry {
            id: ProviderId::Google,
            display_name: "Google Gemini",
            default_model: "gemini-2.5-flash",
            models: google_models(),
            patterns: patterns(&[r"^gemini"]),
            tool_usage_control: true,
        },
        ProviderEntry {
            id: ProviderId::Xai,
            display_name: "xAI",
            default_model: "grok-3",
            models: xai_models(),
            patterns: patterns(&[r"^grok"]),
            tool_usage_control: true,
        },
        ProviderEntry {
            id: ProviderId::Cerebras,
            display_name: "Cerebras",
            default_model: "cerebras/llama-3.3-70b",
            models: cerebras_models(),
            patterns: patterns(&[r"^cerebras/"]),
            tool_usage_control: false,
        },
        ProviderEntry {
            id: ProviderId::Deepseek,
            display_name: "DeepSeek",
            default_model: "deepseek-chat",
            models: deepseek_models(),
            patterns: patterns(&[r"^deepseek"]),
            tool_usage_control: true,
        },
        ProviderEntry {
            id: ProviderId::Groq,
            display_name: "Groq",
            default_model: "groq/llama-3.3-70b-versatile",
            models: groq_models(),
            patterns: patterns(&[r"^groq/"]),
            tool_usage_control: false,
        },
        ProviderEntry {
            id: ProviderId::Ollama,
            display_name: "Ollama",
            default_model: "llama3.1",
            models: Vec::new(),
            patterns: Vec::new(),
            tool_usage_control: false,
        },
    ];

    /// Embedding models live in a separate price table; `pricing()` checks the
    /// chat table first and falls through to this one.
    static ref EMBEDDING_PRICES: Vec<(&'static str, ModelPricing)> = vec![
        ("text-embedding-3-small", ModelPricing::new(0.02, None, 0.0, "2025-06-01")),
        ("text-embedding-3-large", ModelPricing::new(0.13, None, 0.0, "2025-06-01")),
        ("text-embedding-ada-002", ModelPricing::new(0.1, None, 0.0, "2025-06-01")),
    ];

    /// Models discovered from a local Ollama instance.  Swapped wholesale on
    /// refresh so readers never observe a partially updated list.
    static ref OLLAMA_MODELS: RwLock<Arc<Vec<String>>> = RwLock::new(Arc::new(Vec::new()));
}

/// Look up a provider's registry row.
pub fn provider_entry(id: ProviderId) -> &'static ProviderEntry {
    PROVIDERS
        .iter()
        .find(|entry| entry.id == id)
        .expect("every ProviderId has a registry row")
}

fn find_model(model_id: &str) -> Option<(&'static ProviderEntry, &'static ModelEntry)> {
    let lowered = model_id.to_lowercase();
    for entry in PROVIDERS.iter() {
        if let Some(model) = entry.models.iter().find(|m| m.id.to_lowercase() == lowered) {
            return Some((entry, model));
        }
    }
    None
}

/// Resolve a model id to its provider.
///
/// Exact case-insensitive lookup first, then the first provider whose
/// pattern matches, and finally Ollama.  Locally pulled models are never
/// part of the static table, so anything unrecognized is assumed local.
pub fn provider_of(model_id: &str) -> ProviderId {
    if let Some((entry, _)) = find_model(model_id) {
        return entry.id;
    }
    let lowered = model_id.to_lowercase();
    for entry in PROVIDERS.iter() {
        if entry.patterns.iter().any(|p| p.is_match(&lowered)) {
            return entry.id;
        }
    }
    ProviderId::Ollama
}

/// Pricing for a model: chat table first, then the embedding table.  Unknown
/// models (including discovered Ollama models) report `None` and cost zero.
pub fn pricing(model_id: &str) -> Option<ModelPricing> {
    if let Some((_, model)) = find_model(model_id) {
        return Some(model.pricing);
    }
    let lowered = model_id.to_lowercase();
    EMBEDDING_PRICES
        .iter()
        .find(|(id, _)| id.to_lowercase() == lowered)
        .map(|(_, pricing)| *pricing)
}

/// Whether the temperature knob may be sent to this model.  Unknown models
/// (Ollama pulls, fine-tunes) default to `false`, matching the empty
/// capability record they carry.
pub fn supports_temperature(model_id: &str) -> bool {
    find_model(model_id)
        .map(|(_, m)| m.capabilities.temperature.is_some())
        .unwrap_or(false)
}

/// Upper temperature bound for the model, when it declares one.
pub fn max_temperature(model_id: &str) -> Option<f64> {
    find_model(model_id).and_then(|(_, m)| m.capabilities.temperature.map(|t| t.max))
}

/// Whether the provider honors forced tool selection.
pub fn supports_tool_usage_control(provider: ProviderId) -> bool {
    provider_entry(provider).tool_usage_control
}

/// Replace the dynamic Ollama model list.  Discovered models carry zero
/// pricing and empty capabilities.
pub fn update_ollama_models(models: Vec<String>) {
    let fresh = Arc::new(models);
    let mut slot = OLLAMA_MODELS.write().expect("ollama model slot poisoned");
    *slot = fresh;
}

/// Current snapshot of the discovered Ollama models.
pub fn ollama_models() -> Arc<Vec<String>> {
    OLLAMA_MODELS
        .read()
        .expect("ollama model slot poisoned")
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_lookup_is_case_insensitive() {
        assert_eq!(provider_of("GPT-4O"), ProviderId::OpenAi);
        assert_eq!(provider_of("Claude-Sonnet-4-0"), ProviderId::Anthropic);
    }

    #[test]
    fn pattern_fallback_covers_unlisted_models() {
        assert_eq!(provider_of("gpt-5-preview"), ProviderId::OpenAi);
        assert_eq!(provider_of("claude-next"), ProviderId::Anthropic);
        assert_eq!(provider_of("gemini-3.0-ultra"), ProviderId::Google);
        assert_eq!(provider_of("azure/my-deployment"), ProviderId::Azure);
        assert_eq!(provider_of("deepseek-v4"), ProviderId::Deepseek);
    }

    #[test]
    fn unknown_models_fall_back_to_ollama() {
        assert_eq!(provider_of("llama3.1"), ProviderId::Ollama);
        assert_eq!(provider_of("qwen2.5-coder"), ProviderId::Ollama);
    }

    #[test]
    fn reasoning_models_have_no_temperature() {
        assert!(!supports_temperature("o1"));
        assert!(!supports_temperature("o3"));
        assert!(!supports_temperature("o4-mini"));
        assert!(!supports_temperature("deepseek-reasoner"));
        assert!(supports_temperature("gpt-4o"));
        assert_eq!(max_temperature("claude-sonnet-4-0"), Some(1.0));
    }

    #[test]
    fn pricing_checks_chat_then_embedding_table() {
        assert!(pricing("gpt-4o").is_some());
        let embed = pricing("text-embedding-3-small").unwrap();
        assert_eq!(embed.input, 0.02);
        assert_eq!(embed.output, 0.0);
        assert!(pricing("no-such-model").is_none());
    }

    #[test]
    fn ollama_slot_swaps_copy_on_write() {
        let before = ollama_models();
        let before_snapshot: Vec<String> = before.to_vec();
        update_ollama_models(vec!["llama3.1".to_string(), "mistral".to_string()]);
        let after = ollama_models();
        assert_eq!(after.len(), 2);
        // The earlier snapshot still points at the list it was taken from.
        assert_eq!(*before, before_snapshot);
        update_ollama_models(Vec::new());
    }

    #[test]
    fn tool_usage_control_is_per_provider() {
        assert!(supports_tool_usage_control(ProviderId::OpenAi));
        assert!(supports_tool_usage_control(ProviderId::Anthropic));
        assert!(!supports_tool_usage_control(ProviderId::Cerebras));
        assert!(!supports_tool_usage_control(ProviderId::Groq));
        assert!(!supports_tool_usage_control(ProviderId::Ollama));
    }
}
