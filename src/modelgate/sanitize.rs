//! Request sanitizer and structured-output preparer.
//!
//! Runs before planning and dispatch.  Drops knobs the target model does not
//! accept (temperature on reasoning tiers), clears empty response formats,
//! and converts the legacy `{fields: [...]}` response format into a
//! natural-language JSON appendix on the system prompt.  Native JSON-schema
//! formats pass through unchanged for the adapter to enforce.
//!
//! The sanitizer never mutates the caller's request; it returns a new value.

use serde_json::Value;

use crate::modelgate::registry;
use crate::modelgate::request::ProviderRequest;

/// Produce the sanitized copy of `request` used for the rest of the
/// execution.
pub fn sanitize_request(request: &ProviderRequest) -> ProviderRequest {
    let mut sanitized = request.clone();

    if sanitized.temperature.is_some() && !registry::supports_temperature(&sanitized.model) {
        if log::log_enabled!(log::Level::Debug) {
            log::debug!(
                "sanitize_request: dropping temperature for model '{}' (not supported)",
                sanitized.model
            );
        }
        sanitized.temperature = None;
    }

    match sanitized.response_format.take() {
        None => {}
        Some(Value::String(s)) if s.is_empty() => {
            // An empty string means "no format"; leave it cleared.
        }
        Some(format) if is_native_schema(&format) => {
            sanitized.response_format = Some(format);
        }
        Some(format) => {
            if let Some(instructions) = legacy_format_instructions(&format) {
                let prompt = match &sanitized.system_prompt {
                    Some(existing) if !existing.is_empty() => {
                        format!("{}\n\n{}", existing, instructions)
                    }
                    _ => instructions,
                };
                sanitized.system_prompt = Some(prompt);
            } else {
                // Unrecognized shape: pass it through and let the adapter
                // decide what to do with it.
                sanitized.response_format = Some(format);
            }
        }
    }

    sanitized
}

/// True for formats the adapters can enforce natively: either an envelope
/// carrying a `schema` key or a bare `{type: "object", properties: {...}}`
/// JSON Schema.
pub fn is_native_schema(format: &Value) -> bool {
    if format.get("schema").is_some() {
        return true;
    }
    format.get("type").and_then(Value::as_str) == Some("object")
        && format.get("properties").is_some()
}

/// Build the system-prompt appendix for a legacy `{fields: [...]}` format.
/// Returns `None` when the value carries no usable `fields` array.
fn legacy_format_instructions(format: &Value) -> Option<String> {
    let fields = format.get("fields")?.as_array()?;

    let mut shape_lines = Vec::new();
    let mut description_lines = Vec::new();

    for field in fields {
        // A field without a name or type cannot be described; skip it rather
        // than failing the turn.
        let name = match field.get("name").and_then(Value::as_str) {
            Some(name) if !name.is_empty() => name,
            _ => continue,
        };
        let field_type = match field.get("type").and_then(Value::as_str) {
            Some(t) if !t.is_empty() => t,
            _ => continue,
        };

        shape_lines.push(format!("  \"{}\": <{}>", name, field_type));

        let mut line = match field.get("description").and_then(Value::as_str) {
            Some(desc) if !desc.is_empty() => format!("- {} ({}): {}", name, field_type, desc),
            _ => format!("- {} ({})", name, field_type),
        };
        if let Some(properties) = field.get("properties").and_then(Value::as_object) {
            for (prop_name, prop) in properties {
                let prop_type = prop
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("any");
                line.push_str(&format!("\n  - {} ({})", prop_name, prop_type));
            }
        }
        description_lines.push(line);
    }

    if shape_lines.is_empty() {
        return None;
    }

    Some(format!(
        "Respond with JSON in exactly this shape:\n{{\n{}\n}}\n\nFields:\n{}\n\nReturn only the JSON object. Do not include prose, markdown fences, or additional fields.",
        shape_lines.join(",\n"),
        description_lines.join("\n")
    ))
}
