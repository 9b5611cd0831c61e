//! Cache key derivation
//!
//! Keys are `tscached:<name>:<sha256 of canonical JSON>`. Canonical means
//! object keys sorted, no insignificant whitespace, so two semantically equal
//! query bodies map to the same key regardless of field order.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Namespace prefix shared by every key this cache writes
pub const KEY_PREFIX: &str = "tscached";

/// Fixed key for a named entry, e.g. `tscached:metricnames`
pub fn named_key(name: &str) -> String {
    format!("{}:{}", KEY_PREFIX, name)
}

/// Derive a stable key from any serializable body
pub fn fingerprint<T: Serialize + ?Sized>(body: &T, name: &str) -> Result<String> {
    let canonical = canonicalize(serde_json::to_value(body)?);
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(fingerprint_bytes(&bytes, name))
}

/// Derive a key from a raw request body
///
/// JSON bodies are canonicalized first; anything else is hashed verbatim.
pub fn fingerprint_raw(body: &str, name: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => match serde_json::to_vec(&canonicalize(value)) {
            Ok(bytes) => fingerprint_bytes(&bytes, name),
            Err(_) => fingerprint_bytes(body.as_bytes(), name),
        },
        Err(_) => fingerprint_bytes(body.as_bytes(), name),
    }
}

/// Rebuild objects with sorted keys, independent of the map backing `Value`
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

fn fingerprint_bytes(bytes: &[u8], name: &str) -> String {
    let digest = Sha256::digest(bytes);
    format!("{}:{}:{}", KEY_PREFIX, name, hex::encode(digest))
}
