//! Canonical Serializer (C1) and Hasher (C2).
//!
//! Grounded on `bpi-enc::domain_hash` (BLAKE3 over a byte buffer, hex
//! output) but without the domain separator: the hash chain links plain
//! canonical JSON, and a domain tag would change every `leaf_hash` value,
//! breaking compatibility with previously computed hashes.

use serde_json::Value;

/// Legacy hash-compatibility literal for missing/`null`-like input,
/// preserved rather than changed.
const MISSING_INPUT_LITERAL: &str = "null";

/// Deterministic byte encoding of a JSON value for hashing.
///
/// Rules: object keys sorted by code point, no insignificant whitespace,
/// strings minimally escaped, numbers in their shortest unambiguous form,
/// arrays keep their order. `serde_json` already gives us minimal escaping
/// and shortest-round-trip number formatting; the only rule it does not
/// enforce on its own is key ordering, which we restore by re-sorting every
/// object recursively before serializing.
pub fn canonicalize(value: &Value) -> Result<Vec<u8>, crate::error::AuditError> {
    reject_non_representable(value)?;
    let sorted = sort_keys(value);
    serde_json::to_vec(&sorted)
        .map_err(|e| crate::error::AuditError::Encoding(format!("canonical encode failed: {e}")))
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for k in keys {
                sorted.insert(k.clone(), sort_keys(&map[k]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Defensive walk for non-finite numbers. `Value` cannot represent cycles,
/// so only NaN/infinity need checking here.
fn reject_non_representable(value: &Value) -> Result<(), crate::error::AuditError> {
    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if !f.is_finite() {
                    return Err(crate::error::AuditError::Encoding(
                        "non-finite number cannot be canonicalized".into(),
                    ));
                }
            }
            Ok(())
        }
        Value::Object(map) => map.values().try_for_each(reject_non_representable),
        Value::Array(items) => items.iter().try_for_each(reject_non_representable),
        _ => Ok(()),
    }
}

/// BLAKE3 digest over canonical bytes, as 64-character lowercase hex (C2).
///
/// `input` of `None` maps to the literal string `"null"` for legacy
/// hash-compatibility with pre-existing records.
pub fn hash_canonical(input: Option<&Value>) -> Result<String, crate::error::AuditError> {
    let bytes = match input {
        Some(v) => canonicalize(v)?,
        None => MISSING_INPUT_LITERAL.as_bytes().to_vec(),
    };
    Ok(hash_bytes(&bytes))
}

/// BLAKE3 over raw bytes, hex-encoded. Used directly by the hash chain,
/// which canonicalizes its own record view before calling this.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let digest = blake3::hash(bytes);
    hex::encode(digest.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_affect_canonical_bytes() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonicalize(&a).unwrap(), canonicalize(&b).unwrap());
    }

    #[test]
    fn nested_objects_are_sorted_recursively() {
        let v = json!({"z": {"y": 1, "x": 2}, "a": [3, {"d": 4, "c": 5}]});
        let bytes = canonicalize(&v).unwrap();
        let s = String::from_utf8(bytes).unwrap();
        assert_eq!(s, r#"{"a":[3,{"c":5,"d":4}],"z":{"x":2,"y":1}}"#);
    }

    #[test]
    fn hash_is_64_char_lowercase_hex() {
        let h = hash_canonical(Some(&json!({"a": 1}))).unwrap();
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn hash_is_stable_across_calls() {
        let v = json!({"prompt": "hi", "response": "yo"});
        assert_eq!(hash_canonical(Some(&v)).unwrap(), hash_canonical(Some(&v)).unwrap());
    }

    #[test]
    fn missing_input_hashes_as_null_literal() {
        let via_none = hash_canonical(None).unwrap();
        let via_string = hash_bytes(b"null");
        assert_eq!(via_none, via_string);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::Map;

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(|n| Value::Number(n.into())),
            "[a-z]{1,8}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::hash_map("[a-z]{1,6}", inner, 0..6)
                    .prop_map(|m| Value::Object(Map::from_iter(m))),
            ]
        })
    }

    fn shuffle_object_keys(value: &Value, seed: u64) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<(String, Value)> =
                    map.iter().map(|(k, v)| (k.clone(), shuffle_object_keys(v, seed))).collect();
                // rotate insertion order deterministically from `seed`; canonicalize
                // must not care about it.
                if !entries.is_empty() {
                    let split = (seed as usize) % entries.len();
                    entries.rotate_left(split);
                }
                Value::Object(entries.into_iter().collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| shuffle_object_keys(v, seed)).collect()),
            other => other.clone(),
        }
    }

    proptest! {
        /// Canonical bytes never depend on object key insertion order, for
        /// arbitrarily nested JSON values (invariant: canonical determinism).
        #[test]
        fn canonical_bytes_are_independent_of_key_insertion_order(v in arb_value(), seed in any::<u64>()) {
            let shuffled = shuffle_object_keys(&v, seed);
            prop_assert_eq!(canonicalize(&v).unwrap(), canonicalize(&shuffled).unwrap());
        }

        /// Hashing the same canonical bytes always yields the same digest
        /// (invariant: hash stability).
        #[test]
        fn hash_canonical_is_deterministic(v in arb_value()) {
            prop_assert_eq!(hash_canonical(Some(&v)).unwrap(), hash_canonical(Some(&v)).unwrap());
        }
    }
}
