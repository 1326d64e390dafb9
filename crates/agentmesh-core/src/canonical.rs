//! Canonical JSON serialization for signing
//!
//! Sender and receiver must sign and verify over bit-identical bytes, so the
//! signing input is a deterministic rendering of the envelope: object keys
//! sorted lexicographically at every level, no insignificant whitespace,
//! UTF-8, integers in shortest form.
//!
//! `serde_json::Value` stores objects in a `BTreeMap`, which already iterates
//! keys in lexicographic order, and compact serialization emits no
//! whitespace. Canonicalization is therefore: convert to `Value`, serialize
//! compact. The conversion step is what normalizes away struct-declaration
//! field order.

use serde::Serialize;
use serde_json::Value;

use crate::error::{MeshError, MeshResult};

/// Render any serializable value to its canonical JSON bytes.
///
/// # Errors
///
/// Returns `Serialization` if the value cannot be represented as JSON.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> MeshResult<Vec<u8>> {
    let value: Value = serde_json::to_value(value)
        .map_err(|e| MeshError::Serialization(format!("canonicalization failed: {e}")))?;
    serde_json::to_vec(&value)
        .map_err(|e| MeshError::Serialization(format!("canonicalization failed: {e}")))
}

/// Render any serializable value to its canonical JSON string.
pub fn to_canonical_string<T: Serialize>(value: &T) -> MeshResult<String> {
    let bytes = to_canonical_bytes(value)?;
    // Canonical bytes are valid UTF-8 by construction
    String::from_utf8(bytes).map_err(|e| MeshError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use serde_json::json;

    #[test]
    fn test_keys_sorted() {
        let value = json!({"zulu": 1, "alpha": 2, "mike": {"z": 1, "a": 2}});
        let canonical = to_canonical_string(&value).unwrap();
        assert_eq!(canonical, r#"{"alpha":2,"mike":{"a":2,"z":1},"zulu":1}"#);
    }

    #[test]
    fn test_struct_field_order_irrelevant() {
        #[derive(Serialize)]
        struct DeclaredOrder {
            zebra: u32,
            apple: u32,
        }

        let canonical = to_canonical_string(&DeclaredOrder { zebra: 1, apple: 2 }).unwrap();
        assert_eq!(canonical, r#"{"apple":2,"zebra":1}"#);
    }

    #[test]
    fn test_no_whitespace() {
        let value = json!({"a": [1, 2, 3], "b": "x y"});
        let canonical = to_canonical_string(&value).unwrap();
        assert!(!canonical.contains(": "));
        assert!(!canonical.contains(", "));
    }

    #[test]
    fn test_reserialization_stable() {
        let value = json!({"n": 42, "nested": {"deep": [{"k": "v"}]}, "s": "hi"});
        let first = to_canonical_bytes(&value).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&first).unwrap();
        let second = to_canonical_bytes(&parsed).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_integers_shortest_form() {
        let value = json!({"n": 1000000});
        assert_eq!(to_canonical_string(&value).unwrap(), r#"{"n":1000000}"#);
    }

    #[test]
    fn test_unicode_preserved() {
        let value = json!({"msg": "héllo ☀"});
        let canonical = to_canonical_string(&value).unwrap();
        assert!(canonical.contains("héllo ☀"));
    }
}
