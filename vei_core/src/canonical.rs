//! Canonical JSON encoding and SHA-256 digests.
//!
//! Object keys are emitted in sorted order (serde_json's default map is
//! ordered), so two logically equal argument objects always encode to
//! the same bytes regardless of the order the caller wrote them in.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Compact, key-sorted JSON text.
pub fn canonical_json(value: &Value) -> String {
    value.to_string()
}

/// Hex SHA-256 of the canonical encoding.
pub fn digest(value: &Value) -> String {
    hex::encode(Sha256::digest(canonical_json(value).as_bytes()))
}

/// Replay signature of a tool call: digest over `{tool, args}`.
pub fn call_signature(tool: &str, args: &Value) -> String {
    let args = if args.is_null() { json!({}) } else { args.clone() };
    digest(&json!({ "tool": tool, "args": args }))
}
