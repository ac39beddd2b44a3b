//! Error types surfaced by the gateway.
//!
//! Everything recoverable is recovered locally (failed tools are fed back to
//! the model, malformed legacy schema fields are skipped, duplicate tool calls
//! are dropped).  What remains here are the failures that end a call: missing
//! credentials, non-2xx provider responses, unparseable response bodies, and
//! caller-initiated aborts.
//!
//! A [`GatewayError`] that terminates an execution carries an optional
//! [`ErrorTiming`] so callers can bill the partial work that happened before
//! the failure.

use std::error::Error;
use std::fmt;

use crate::modelgate::registry::ProviderId;

/// Wall-clock bracket attached to errors that end a call.
#[derive(Debug, Clone)]
pub struct ErrorTiming {
    /// ISO-8601 timestamp taken when the gateway entered `execute`.
    pub start_time: String,
    /// ISO-8601 timestamp taken when the error was raised.
    pub end_time: String,
    /// Elapsed milliseconds between the two.
    pub duration_ms: u128,
}

/// The distinct failure kinds the gateway can report.
#[derive(Debug)]
pub enum ErrorKind {
    /// No usable API key: the rotation helper failed and the request carried
    /// none.  Raised before any HTTP traffic.
    MissingApiKey(ProviderId),

    /// A provider returned a non-2xx status.  `body` is the raw response text
    /// and `elapsed_ms` the time spent on that round-trip.
    Transport {
        provider: ProviderId,
        status: u16,
        body: String,
        elapsed_ms: u128,
    },

    /// The HTTP request itself failed (connect, TLS, body read).
    Http(String),

    /// A provider response did not have the shape the adapter expects.
    Parse { provider: ProviderId, detail: String },

    /// The caller's cancellation token fired.
    Aborted,

    /// Invalid combination of request fields detected before dispatch
    /// (e.g. an Azure request with no endpoint configured).
    InvalidRequest(String),
}

/// Error returned from [`Gateway::execute`](crate::modelgate::orchestrator::Gateway::execute).
#[derive(Debug)]
pub struct GatewayError {
    /// What went wrong.
    pub kind: ErrorKind,
    /// Timing bracket for the partial work, present when the error ended an
    /// execution that had already started.
    pub timing: Option<ErrorTiming>,
}

impl GatewayError {
    /// Wrap a bare [`ErrorKind`] with no timing attached yet.
    pub fn new(kind: ErrorKind) -> Self {
        GatewayError { kind, timing: None }
    }

    /// Attach (or replace) the timing bracket.  The orchestrator calls this on
    /// every error that escapes the loop.
    pub fn with_timing(mut self, timing: ErrorTiming) -> Self {
        self.timing = Some(timing);
        self
    }

    /// True when the error was caused by caller cancellation.
    pub fn is_aborted(&self) -> bool {
        matches!(self.kind, ErrorKind::Aborted)
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ErrorKind::MissingApiKey(provider) => {
                write!(f, "No API key available for provider '{}'", provider)
            }
            ErrorKind::Transport {
                provider,
                status,
                body,
                elapsed_ms,
            } => write!(
                f,
                "Provider '{}' returned HTTP {} after {}ms: {}",
                provider, status, elapsed_ms, body
            ),
            ErrorKind::Http(detail) => write!(f, "HTTP request failed: {}", detail),
            ErrorKind::Parse { provider, detail } => {
                write!(f, "Unexpected response shape from '{}': {}", provider, detail)
            }
            ErrorKind::Aborted => write!(f, "Execution aborted by caller"),
            ErrorKind::InvalidRequest(detail) => write!(f, "Invalid request: {}", detail),
        }
    }
}

impl Error for GatewayError {}

impl From<ErrorKind> for GatewayError {
    fn from(kind: ErrorKind) -> Self {
        GatewayError::new(kind)
    }
}

/// Convenience alias used across the crate.
pub type GatewayResult<T> = Result<T, GatewayError>;
