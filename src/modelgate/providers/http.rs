//! Shared HTTP plumbing for the provider adapters.
//!
//! A single lazily initialized [`reqwest::Client`] keeps TLS sessions and DNS
//! lookups warm across requests.  The helpers here add what every adapter
//! needs on top: cancellation-aware JSON POSTs that capture status, body, and
//! elapsed time on failure, and an equivalent entry point that hands back the
//! raw response for streaming reads.

use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use tokio_util::sync::CancellationToken;

use crate::modelgate::error::{ErrorKind, GatewayError, GatewayResult};
use crate::modelgate::registry::ProviderId;

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
pub fn shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

fn build_post(
    url: &str,
    headers: &[(&str, String)],
    body: &serde_json::Value,
) -> reqwest::RequestBuilder {
    let mut request = shared_http_client()
        .post(url)
        .header("Content-Type", "application/json");
    for (name, value) in headers {
        request = request.header(*name, value.as_str());
    }
    request.json(body)
}

/// POST a JSON body and parse the JSON response.
///
/// Cancellation is checked for the whole round-trip; a non-2xx status is
/// reported as [`ErrorKind::Transport`] with the raw body and elapsed time
/// attached.
pub async fn post_json(
    provider: ProviderId,
    url: &str,
    headers: &[(&str, String)],
    body: &serde_json::Value,
    cancel: &CancellationToken,
) -> GatewayResult<serde_json::Value> {
    let started = Instant::now();

    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(GatewayError::new(ErrorKind::Aborted)),
        result = build_post(url, headers, body).send() => {
            result.map_err(|e| GatewayError::new(ErrorKind::Http(e.to_string())))?
        }
    };

    let status = response.status();
    let text = tokio::select! {
        _ = cancel.cancelled() => return Err(GatewayError::new(ErrorKind::Aborted)),
        result = response.text() => {
            result.map_err(|e| GatewayError::new(ErrorKind::Http(e.to_string())))?
        }
    };

    if !status.is_success() {
        let elapsed_ms = started.elapsed().as_millis();
        if log::log_enabled!(log::Level::Error) {
            log::error!(
                "post_json: HTTP {} from {} after {}ms: {}",
                status,
                url,
                elapsed_ms,
                text
            );
        }
        return Err(GatewayError::new(ErrorKind::Transport {
            provider,
            status: status.as_u16(),
            body: text,
            elapsed_ms,
        }));
    }

    serde_json::from_str(&text).map_err(|e| {
        GatewayError::new(ErrorKind::Parse {
            provider,
            detail: format!("invalid JSON body: {}", e),
        })
    })
}

/// POST a JSON body and return the raw response for incremental reads.
/// The status is checked here so stream consumers only see payload bytes.
pub async fn post_stream(
    provider: ProviderId,
    url: &str,
    headers: &[(&str, String)],
    body: &serde_json::Value,
    cancel: &CancellationToken,
) -> GatewayResult<reqwest::Response> {
    let started = Instant::now();

    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(GatewayError::new(ErrorKind::Aborted)),
        result = build_post(url, headers, body).send() => {
            result.map_err(|e| GatewayError::new(ErrorKind::Http(e.to_string())))?
        }
    };

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        let elapsed_ms = started.elapsed().as_millis();
        if log::log_enabled!(log::Level::Error) {
            log::error!(
                "post_stream: HTTP {} from {} after {}ms: {}",
                status,
                url,
                elapsed_ms,
                text
            );
        }
        return Err(GatewayError::new(ErrorKind::Transport {
            provider,
            status: status.as_u16(),
            body: text,
            elapsed_ms,
        }));
    }

    Ok(response)
}

/// GET a JSON document.  Used by Ollama model discovery.
pub async fn get_json(url: &str) -> Result<serde_json::Value, String> {
    let response = shared_http_client()
        .get(url)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("HTTP {}", response.status()));
    }
    response.json().await.map_err(|e| e.to_string())
}
