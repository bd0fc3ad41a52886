//! Deterministic cache-key derivation for units of work.
//!
//! The key is a SHA-256 digest over the job id, the canonical form of each
//! input in argument order, and the cache partition. The digest is for
//! cache correctness, not security.
//!
//! Canonical total order: JSON objects are rewritten with their keys sorted
//! lexicographically by Unicode code point, recursively; arrays keep their
//! element order; scalars render as `serde_json` renders them. Two values
//! that differ only in object key ordering therefore canonicalize - and
//! hash - identically, while input order and the job id always matter.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Render a JSON value in canonical form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            // serde_json string escaping is deterministic.
            out.push_str(&Value::String(s.clone()).to_string());
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
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

/// Compute the cache key for `(job_id, inputs, partition)`.
///
/// Insensitive to JSON object key ordering inside each input, sensitive to
/// the order of inputs themselves and to the job id. Each component is
/// length-framed before hashing so concatenation is unambiguous.
pub fn cache_key(job_id: &str, inputs: &[Value], partition: &str) -> String {
    let mut hasher = Sha256::new();
    feed(&mut hasher, job_id.as_bytes());
    for input in inputs {
        feed(&mut hasher, canonical_json(input).as_bytes());
    }
    feed(&mut hasher, partition.as_bytes());
    hex::encode(hasher.finalize())
}

fn feed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}
