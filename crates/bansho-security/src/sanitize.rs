//! Bounded, redacting sanitizer for audit payloads.
//!
//! Request, response, and decision payloads are sanitized independently
//! before persistence: nesting depth, collection width, key length, and
//! string length are all capped, values under credential-shaped keys are
//! replaced without descending, and a payload that still encodes beyond the
//! byte budget is replaced wholesale by a truncation stub. The walk is a
//! pure function over `serde_json::Value`.

use serde_json::{json, Map, Value};

pub const MAX_JSON_BYTES: usize = 4_096;
pub const MAX_JSON_DEPTH: usize = 6;
pub const MAX_JSON_ITEMS: usize = 40;
pub const MAX_JSON_KEY_CHARS: usize = 64;
pub const MAX_JSON_STRING_CHARS: usize = 512;

pub const REDACTED_VALUE: &str = "[REDACTED]";
pub const TRUNCATED_VALUE: &str = "[TRUNCATED]";

/// Lower-cased key names whose values are never persisted.
const SENSITIVE_KEYS: &[&str] = &[
    "api_key",
    "authorization",
    "password",
    "secret",
    "token",
    "x-api-key",
    "x_api_key",
    "xapikey",
    "x-api-key-id",
    "x_api_key_id",
    "x-api-keyid",
    "x_api_keyid",
    "x-api-key_hash",
];

fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_lowercase();
    SENSITIVE_KEYS.iter().any(|k| *k == lowered)
}

/// Sanitize and bound one payload.
///
/// If the sanitized value still encodes to more than [`MAX_JSON_BYTES`], the
/// whole payload is replaced by `{truncated, original_bytes, preview}` with
/// a preview of the encoded form.
pub fn bound_payload(value: &Value) -> Value {
    let sanitized = sanitize_value(value, 0);
    let encoded = match serde_json::to_string(&sanitized) {
        Ok(encoded) => encoded,
        Err(_) => return json!({ "unserializable": true }),
    };

    if encoded.len() <= MAX_JSON_BYTES {
        return sanitized;
    }

    json!({
        "truncated": true,
        "original_bytes": encoded.len(),
        "preview": truncate_text(&encoded, MAX_JSON_BYTES / 2),
    })
}

/// Recursive sanitization walk.
///
/// Booleans and numbers pass through unchanged (`serde_json` cannot
/// represent non-finite floats, so the printed-infinity case never reaches
/// a `Value`). Strings are truncated; subtrees at the depth cap collapse to
/// `"[TRUNCATED]"`.
pub fn sanitize_value(value: &Value, depth: usize) -> Value {
    if depth >= MAX_JSON_DEPTH {
        return Value::String(TRUNCATED_VALUE.to_string());
    }

    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => value.clone(),
        Value::String(text) => Value::String(truncate_text(text, MAX_JSON_STRING_CHARS)),
        Value::Array(items) => {
            let mut sanitized = Vec::with_capacity(items.len().min(MAX_JSON_ITEMS + 1));
            for (index, item) in items.iter().enumerate() {
                if index >= MAX_JSON_ITEMS {
                    sanitized.push(Value::String(TRUNCATED_VALUE.to_string()));
                    break;
                }
                sanitized.push(sanitize_value(item, depth + 1));
            }
            Value::Array(sanitized)
        }
        Value::Object(entries) => {
            let mut sanitized = Map::new();
            for (index, (key, item)) in entries.iter().enumerate() {
                if index >= MAX_JSON_ITEMS {
                    sanitized.insert(
                        "_truncated_items".to_string(),
                        Value::String(format!("{} omitted", entries.len() - MAX_JSON_ITEMS)),
                    );
                    break;
                }

                let key_text = truncate_text(key, MAX_JSON_KEY_CHARS);
                if is_sensitive_key(&key_text) {
                    sanitized.insert(key_text, Value::String(REDACTED_VALUE.to_string()));
                    continue;
                }
                sanitized.insert(key_text, sanitize_value(item, depth + 1));
            }
            Value::Object(sanitized)
        }
    }
}

/// Truncate to `max_chars` characters, appending `"..."` when anything was
/// cut. Below the marker length the marker itself is sliced.
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    let marker = "...";
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars <= marker.len() {
        return marker.chars().take(max_chars).collect();
    }
    let mut truncated: String = text.chars().take(max_chars - marker.len()).collect();
    truncated.push_str(marker);
    truncated
}
