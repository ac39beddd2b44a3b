//! Timing segments and token-based cost accounting.
//!
//! Every model round-trip and every tool execution appends a [`TimeSegment`]
//! in the order the work started; the recorder aggregates them into the
//! [`Timing`] block on the final response.  Costs come from the registry's
//! price table: `(prompt × input) + (completion × output)` per million
//! tokens, with the cached-input discount applied when prior context was
//! supplied and the hosted cost multiplier applied after unit-cost
//! computation, rounded to 8 decimal places.
//!
//! # Example
//!
//! ```rust
//! use modelgate::accounting::format_cost;
//!
//! assert_eq!(format_cost(Some(1.5)), "$1.50");
//! assert_eq!(format_cost(Some(0.0042)), "$0.0042");
//! assert_eq!(format_cost(Some(0.0)), "$0");
//! assert_eq!(format_cost(None), "—");
//! ```

use chrono::{SecondsFormat, Utc};

use crate::modelgate::registry;
use crate::modelgate::request::{Cost, SegmentKind, TimeSegment, Timing, TokenUsage};

/// Current wall clock as epoch milliseconds.
pub fn now_ms() -> u128 {
    Utc::now().timestamp_millis().max(0) as u128
}

/// Current wall clock as an ISO-8601 string with millisecond precision.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Collects time segments and aggregates them into a [`Timing`] record.
#[derive(Debug)]
pub struct SegmentRecorder {
    start_iso: String,
    start_ms: u128,
    segments: Vec<TimeSegment>,
    model_time_ms: u128,
    tools_time_ms: u128,
    first_response_time_ms: Option<u128>,
    iterations: usize,
}

impl SegmentRecorder {
    /// Start recording; captures the execution's start timestamps.
    pub fn start() -> Self {
        SegmentRecorder {
            start_iso: now_iso(),
            start_ms: now_ms(),
            segments: Vec::new(),
            model_time_ms: 0,
            tools_time_ms: 0,
            first_response_time_ms: None,
            iterations: 0,
        }
    }

    /// ISO-8601 timestamp captured at [`SegmentRecorder::start`].
    pub fn start_iso(&self) -> &str {
        &self.start_iso
    }

    /// Epoch milliseconds captured at [`SegmentRecorder::start`].
    pub fn start_ms(&self) -> u128 {
        self.start_ms
    }

    /// Record one model round-trip.  The first model segment's duration
    /// becomes `first_response_time_ms`; every model segment bumps
    /// `iterations`.
    pub fn record_model(&mut self, model: &str, start_ms: u128, end_ms: u128) {
        let duration = end_ms.saturating_sub(start_ms);
        self.model_time_ms += duration;
        self.iterations += 1;
        if self.first_response_time_ms.is_none() {
            self.first_response_time_ms = Some(duration);
        }
        self.segments.push(TimeSegment {
            kind: SegmentKind::Model,
            name: model.to_string(),
            start_time: start_ms,
            end_time: end_ms,
            duration_ms: duration,
        });
    }

    /// Record one tool execution.
    pub fn record_tool(&mut self, tool: &str, start_ms: u128, end_ms: u128) {
        let duration = end_ms.saturating_sub(start_ms);
        self.tools_time_ms += duration;
        self.segments.push(TimeSegment {
            kind: SegmentKind::Tool,
            name: tool.to_string(),
            start_time: start_ms,
            end_time: end_ms,
            duration_ms: duration,
        });
    }

    /// Number of model segments recorded so far.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Close the recorder and produce the final [`Timing`] block.
    pub fn finish(self) -> Timing {
        let end_ms = now_ms();
        Timing {
            start_time: self.start_iso,
            end_time: now_iso(),
            duration_ms: end_ms.saturating_sub(self.start_ms),
            model_time_ms: self.model_time_ms,
            tools_time_ms: self.tools_time_ms,
            first_response_time_ms: self.first_response_time_ms.unwrap_or(0),
            iterations: self.iterations,
            time_segments: self.segments,
        }
    }

    /// Timing snapshot for an error that ends the call early.
    pub fn error_timing(&self) -> crate::modelgate::error::ErrorTiming {
        let end_ms = now_ms();
        crate::modelgate::error::ErrorTiming {
            start_time: self.start_iso.clone(),
            end_time: now_iso(),
            duration_ms: end_ms.saturating_sub(self.start_ms),
        }
    }
}

fn round8(value: f64) -> f64 {
    (value * 1e8).round() / 1e8
}

/// Compute the dollar cost of an execution.
///
/// `use_cached_input` selects the discounted input rate (when the model has
/// one); the discount is applied before `multiplier` scales the result.
/// Returns `None` for models with no known pricing.
pub fn compute_cost(
    model: &str,
    tokens: &TokenUsage,
    use_cached_input: bool,
    multiplier: f64,
) -> Option<Cost> {
    let pricing = registry::pricing(model)?;
    let input_rate = if use_cached_input {
        pricing.cached_input.unwrap_or(pricing.input)
    } else {
        pricing.input
    };

    let input = round8((tokens.prompt as f64 / 1_000_000.0) * input_rate * multiplier);
    let output = round8((tokens.completion as f64 / 1_000_000.0) * pricing.output * multiplier);

    Some(Cost {
        input,
        output,
        total: round8(input + output),
    })
}

/// Format a dollar amount for display.
///
/// `$1` and above show two decimal places, one cent and above three, a tenth
/// of a cent and above four; smaller values show the first significant digit
/// plus two more.  Zero renders as `"$0"` and a missing amount as `"—"`.
pub fn format_cost(cost: Option<f64>) -> String {
    let cost = match cost {
        Some(cost) => cost,
        None => return "—".to_string(),
    };
    if cost == 0.0 {
        return "$0".to_string();
    }
    if cost >= 1.0 {
        format!("${:.2}", cost)
    } else if cost >= 0.01 {
        format!("${:.3}", cost)
    } else if cost >= 0.001 {
        format!("${:.4}", cost)
    } else {
        let leading_zeros = (-cost.abs().log10()).ceil() as usize;
        format!("${:.*}", leading_zeros + 2, cost)
    }
}
