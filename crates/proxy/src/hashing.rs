//! Content hashing for discovered tools.
//!
//! Two hashes are computed per tool, over canonicalized JSON so that key
//! order never affects the result:
//!
//! - the *structure hash* covers the callable contract (name + input schema)
//!   and changes when a caller would have to change how it invokes the tool;
//! - the *full hash* covers the record content that survives a rename
//!   (server, description, input schema) and doubles as the tool's stable
//!   reference id, so a renamed-but-otherwise-identical tool keeps its id.

use serde_json::{Value, json};
use sha2::{Digest as _, Sha256};

/// Hash of the callable contract: `(original_name, input_schema)`.
#[must_use]
pub fn structure_hash(original_name: &str, input_schema: &Value) -> String {
    let v = json!({
        "name": original_name,
        "inputSchema": canonicalize_json(input_schema),
    });
    digest(&v)
}

/// Hash of the rename-stable record content, used as the tool's `refId`.
#[must_use]
pub fn full_hash(server_name: &str, description: Option<&str>, input_schema: &Value) -> String {
    let v = json!({
        "serverName": server_name,
        "description": description.unwrap_or_default(),
        "inputSchema": canonicalize_json(input_schema),
    });
    digest(&v)
}

fn digest(v: &Value) -> String {
    let serialized = serde_json::to_string(&canonicalize_json(v)).expect("valid json");
    hex::encode(Sha256::digest(serialized.as_bytes()))
}

/// Recursively sort object keys so serialization is deterministic.
#[must_use]
pub fn canonicalize_json(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                if let Some(val) = map.get(&k) {
                    out.insert(k, canonicalize_json(val));
                }
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonicalize_json).collect()),
        other => other.clone(),
    }
}
