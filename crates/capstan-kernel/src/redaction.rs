//! Masking of sensitive parameter values.
//!
//! A key is sensitive when its lowercase form contains any entry of
//! [`SENSITIVE_KEYS`].  Redaction recurses into nested objects and arrays
//! and replaces the value (whatever its type) with [`REDACTED`].
//!
//! ```
//! use capstan_kernel::redaction::redact;
//! use serde_json::json;
//!
//! let params = json!({"api_key": "sk-123", "count": 2}).as_object().cloned().unwrap();
//! let clean = redact(&params);
//! assert_eq!(clean["api_key"], json!("[REDACTED]"));
//! assert_eq!(clean["count"], json!(2));
//! ```

use capstan_types::Params;
use serde_json::Value;

pub const REDACTED: &str = "[REDACTED]";

/// Case-insensitive substrings that mark a key as sensitive.
pub const SENSITIVE_KEYS: &[&str] = &[
    "path",
    "dataset_path",
    "directory",
    "target_path",
    "source_path",
    "destination_path",
    "file_path",
    "password",
    "token",
    "secret",
    "key",
    "api_key",
    "private_key",
    "certificate",
    "credentials",
];

pub fn is_sensitive(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|s| key.contains(s))
}

/// A copy of `params` with every sensitive value masked.
pub fn redact(params: &Params) -> Params {
    params
        .iter()
        .map(|(k, v)| {
            let v = if is_sensitive(k) {
                Value::String(REDACTED.to_string())
            } else {
                redact_value(v)
            };
            (k.clone(), v)
        })
        .collect()
}

/// Recursively mask sensitive keys inside `value`.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(redact(map)),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        other => other.clone(),
    }
}
