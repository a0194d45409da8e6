//! Canonical JSON encoding.
//!
//! All hashed/signed objects use canonical JSON: keys sorted, no trailing
//! whitespace, UTF-8. `serde_json::Map` is backed by a `BTreeMap` whenever the
//! `preserve_order` feature is off (the default, and the only configuration
//! this workspace enables), so round-tripping a value through
//! `serde_json::Value` before re-serializing is sufficient to get
//! deterministic key ordering — no hand-rolled sorting pass is needed.

use crate::error::{Error, Result};
use serde::Serialize;

/// Serialize a value to canonical JSON bytes.
///
/// This is the normative encoding for all hashing and signing operations in
/// this workspace; peers on both ends of a wire exchange must agree on it
/// byte-for-byte.
pub fn canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let v = serde_json::to_value(value).map_err(Error::from)?;
    serde_json::to_vec(&v).map_err(Error::from)
}

/// Serialize a `serde_json::Value` directly to canonical JSON bytes.
///
/// Used for config blobs, whose `data` field is already an arbitrary JSON
/// value rather than a typed struct.
pub fn canonical_json_value_bytes(value: &serde_json::Value) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_is_sorted() {
        let a = json!({"b": 1, "a": 2, "c": 3});
        let b = json!({"c": 3, "a": 2, "b": 1});
        assert_eq!(
            canonical_json_value_bytes(&a).unwrap(),
            canonical_json_value_bytes(&b).unwrap()
        );
    }

    #[test]
    fn canonical_bytes_deterministic() {
        #[derive(Serialize)]
        struct T {
            x: u32,
            y: String,
        }
        let t = T { x: 1, y: "hi".into() };
        assert_eq!(
            canonical_json_bytes(&t).unwrap(),
            canonical_json_bytes(&t).unwrap()
        );
    }
}
