use async_trait::async_trait;

use modelgate::environment::{ApiKeyProvider, HostedEnv};
use modelgate::error::ErrorKind;
use modelgate::registry::ProviderId;
use modelgate::request::{ChatMessage, ProviderRequest};
use modelgate::Gateway;

struct StaticKeys;

#[async_trait]
impl ApiKeyProvider for StaticKeys {
    async fn rotating_key(&self, _provider: ProviderId) -> Result<String, String> {
        Ok("rotated-key".to_string())
    }
}

#[tokio::test]
async fn missing_api_key_fails_before_any_http_call() {
    let request = ProviderRequest::new("gpt-4o").with_message(ChatMessage::user("hi"));

    let error = Gateway::new().execute(request).await.unwrap_err();
    assert!(matches!(
        error.kind,
        ErrorKind::MissingApiKey(ProviderId::OpenAi)
    ));
    // Failed work still carries a timing bracket for billing.
    assert!(error.timing.is_some());
}

#[tokio::test]
async fn empty_api_key_counts_as_missing() {
    let request = ProviderRequest::new("claude-sonnet-4-0")
        .with_message(ChatMessage::user("hi"))
        .with_api_key("");

    let error = Gateway::new().execute(request).await.unwrap_err();
    assert!(matches!(
        error.kind,
        ErrorKind::MissingApiKey(ProviderId::Anthropic)
    ));
}

#[tokio::test]
async fn azure_requires_an_endpoint() {
    // Guard against an ambient endpoint leaking into the test.
    std::env::remove_var("AZURE_OPENAI_ENDPOINT");

    let request = ProviderRequest::new("azure/gpt-4o")
        .with_message(ChatMessage::user("hi"))
        .with_api_key("key");

    let error = Gateway::new().execute(request).await.unwrap_err();
    assert!(matches!(error.kind, ErrorKind::InvalidRequest(_)));
}

#[tokio::test]
async fn explicit_provider_override_beats_model_resolution() {
    // The model id resolves to OpenAI, but the caller pins Anthropic; the
    // missing-key error names the pinned provider.
    let mut request = ProviderRequest::new("gpt-4o").with_message(ChatMessage::user("hi"));
    request.provider = Some(ProviderId::Anthropic);

    let error = Gateway::new().execute(request).await.unwrap_err();
    assert!(matches!(
        error.kind,
        ErrorKind::MissingApiKey(ProviderId::Anthropic)
    ));
}

#[tokio::test]
async fn key_rotation_only_applies_to_hosted_openai_and_anthropic() {
    // Hosted install with rotation: a Groq request still needs the caller's
    // key, because rotation covers OpenAI/Anthropic only.
    let gateway = Gateway::new()
        .with_key_provider(std::sync::Arc::new(StaticKeys))
        .with_hosted_env(HostedEnv {
            hosted: true,
            cost_multiplier: 1.5,
        });

    let request = ProviderRequest::new("groq/llama-3.3-70b-versatile")
        .with_message(ChatMessage::user("hi"));
    let error = gateway.execute(request).await.unwrap_err();
    assert!(matches!(
        error.kind,
        ErrorKind::MissingApiKey(ProviderId::Groq)
    ));
}
