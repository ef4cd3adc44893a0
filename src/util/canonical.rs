//! Canonical JSON serialization and stable hashing.
//!
//! Idempotency keys, approval fingerprints, and contract content hashes must
//! be identical across platforms and process restarts, so values are
//! serialized with sorted object keys before SHA-256.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize `value` with object keys sorted recursively.
///
/// `serde_json::Map` preserves insertion order by default, so two logically
/// equal objects can serialize differently; this normalizes them.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                out.push('{');
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&Value::String((*key).clone()).to_string());
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    out
}

/// Hex-encoded SHA-256 of the canonical serialization.
#[must_use]
pub fn hash_value(value: &Value) -> String {
    hash_str(&canonical_json(value))
}

/// Hex-encoded SHA-256 of an arbitrary string.
#[must_use]
pub fn hash_str(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash a list of fingerprint parts joined with `|` (the shape used for
/// approval input fingerprints).
#[must_use]
pub fn hash_parts(parts: &[String]) -> String {
    hash_str(&parts.join("|"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_hash() {
        let a = json!({"b": 1, "a": {"y": 2, "x": [3, {"q": 4, "p": 5}]}});
        let b = json!({"a": {"x": [3, {"p": 5, "q": 4}], "y": 2}, "b": 1});
        assert_eq!(hash_value(&a), hash_value(&b));
    }

    #[test]
    fn array_order_does_change_hash() {
        assert_ne!(hash_value(&json!([1, 2])), hash_value(&json!([2, 1])));
    }

    #[test]
    fn canonical_form_is_sorted_and_compact() {
        let v = json!({"z": "s", "a": true, "m": null});
        assert_eq!(canonical_json(&v), r#"{"a":true,"m":null,"z":"s"}"#);
    }
}
