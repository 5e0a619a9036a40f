//! Canonical input hashing for change detection
//!
//! Object keys are sorted at every depth before hashing so that two inputs
//! which only differ in key order produce the same digest. Array order is
//! kept: it is meaningful for item lists.

use crate::error::CacheResult;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Recursively sort object keys, leaving arrays in place
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key.as_str()]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Compact JSON text with keys emitted in sorted order.
///
/// Written out explicitly instead of relying on `serde_json::Map` ordering,
/// which depends on whether `preserve_order` is enabled somewhere in the
/// dependency graph.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// SHA-256 hex digest of an already-converted JSON value
pub fn hash_value(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// SHA-256 hex digest of any serializable input
pub fn input_hash<T: Serialize + ?Sized>(inputs: &T) -> CacheResult<String> {
    let value = serde_json::to_value(inputs)?;
    Ok(hash_value(&value))
}
