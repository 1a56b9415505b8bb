//! JSON normalization utilities.
//!
//! Canonicalizes JSON by sorting object keys recursively so generated
//! configuration documents diff cleanly between builds.

use serde_json::{Map, Value};

/// Recursively normalize a JSON value by sorting object keys.
///
/// - Objects: Keys are sorted, values are recursively normalized
/// - Arrays: Order is preserved, elements are recursively normalized
/// - Scalars: Returned as-is
///
/// # Examples
/// ```
/// use serde_json::json;
/// use mf_config::json_norm::normalize_value;
///
/// let output = normalize_value(json!({"z": 1, "a": 2}));
/// assert_eq!(output.as_object().unwrap().keys().next().unwrap(), "a");
/// ```
#[must_use]
pub fn normalize_value(v: Value) -> Value {
    match v {
        Value::Object(mut m) => {
            let mut nm = Map::new();
            let mut keys: Vec<_> = m.keys().cloned().collect();
            keys.sort_unstable();
            for k in keys {
                if let Some(vv) = m.remove(&k) {
                    nm.insert(k, normalize_value(vv));
                }
            }
            Value::Object(nm)
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(normalize_value).collect()),
        x => x,
    }
}

/// Pretty-print with sorted keys.
///
/// # Errors
/// Returns an error if serialization fails.
pub fn to_canonical_string(v: &Value) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&normalize_value(v.clone()))
}
