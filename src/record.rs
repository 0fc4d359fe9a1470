//! Data model: `Record`, `EncryptedBundle`, and the small value types that
//! keep call sites from mixing up bare `String`s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Supported upstream model vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelVendor {
    Openai,
    Anthropic,
    Grok,
    Local,
}

/// Algorithm suite identifying how `EncryptedBundle::ciphertext` is framed.
/// `1` is the only suite this crate emits: AES-256-GCM, 12-byte IV, 16-byte
/// tag.
pub const SUITE_AES_256_GCM: u32 = 1;

/// Envelope-encrypted `{prompt, response}` bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBundle {
    /// base64 of the full AEAD-framed ciphertext (header + IV + body + tag).
    pub ciphertext: String,
    /// base64 of the wrapped data-encryption key.
    pub encrypted_data_key: String,
    /// Algorithm suite identifier.
    pub suite_id: u32,
}

/// One observed LLM interaction, linked into the process-wide hash chain.
///
/// Mutated only by append to the chain and the outbox; once constructed a
/// `Record` is never edited in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub tenant_id: String,
    pub model_vendor: ModelVendor,
    pub model_name: String,
    /// Not `skip_serializing_if`-omitted on `None`: the field must always
    /// be present so `to_hashable_value()` matches the object `HashChain`
    /// actually hashed when the record was created.
    pub user_id: Option<String>,
    pub ts_client: DateTime<Utc>,
    pub latency_ms: f64,
    pub prompt_tokens: u64,
    pub response_tokens: u64,
    pub static_meta: serde_json::Map<String, serde_json::Value>,
    pub enc: EncryptedBundle,
    pub prev_hash: Option<String>,
    pub leaf_hash: String,
}

impl Record {
    /// `latency_ms` rounded to 2-decimal precision.
    pub fn round_latency(ms: f64) -> f64 {
        (ms * 100.0).round() / 100.0
    }

    /// Canonicalizable view of this record with `leaf_hash` excluded —
    /// `leaf_hash` is computed *over* the rest of the fields, excluding
    /// `leaf_hash` itself.
    pub fn to_hashable_value(&self) -> serde_json::Value {
        let mut v = serde_json::to_value(self).expect("Record fields are always JSON-representable");
        if let serde_json::Value::Object(ref mut map) = v {
            map.remove("leaf_hash");
        }
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canon::hash_canonical;
    use crate::chain::HashChain;

    fn hashable_fields_for_chain(record: &Record) -> serde_json::Value {
        let mut v = record.to_hashable_value();
        if let serde_json::Value::Object(ref mut map) = v {
            map.remove("prev_hash");
        }
        v
    }

    #[test]
    fn to_hashable_value_lets_audit_tooling_recompute_leaf_hash() {
        let chain = HashChain::new();
        let fields = serde_json::json!({
            "id": "11111111-1111-1111-1111-111111111111",
            "tenant_id": "t1",
            "model_vendor": "openai",
            "model_name": "gpt",
            "user_id": serde_json::Value::Null,
            "ts_client": "2026-01-01T00:00:00Z",
            "latency_ms": 12.3,
            "prompt_tokens": 1,
            "response_tokens": 2,
            "static_meta": {},
            "enc": {"ciphertext": "c", "encrypted_data_key": "k", "suite_id": 1},
        });
        let (prev_hash, leaf_hash) = chain.link(&fields).unwrap();

        let record = Record {
            id: uuid::Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap(),
            tenant_id: "t1".into(),
            model_vendor: ModelVendor::Openai,
            model_name: "gpt".into(),
            user_id: None,
            ts_client: "2026-01-01T00:00:00Z".parse().unwrap(),
            latency_ms: 12.3,
            prompt_tokens: 1,
            response_tokens: 2,
            static_meta: Default::default(),
            enc: EncryptedBundle { ciphertext: "c".into(), encrypted_data_key: "k".into(), suite_id: 1 },
            prev_hash,
            leaf_hash: leaf_hash.clone(),
        };

        let recomputed = hash_canonical(Some(&record.to_hashable_value())).unwrap();
        assert_eq!(recomputed, leaf_hash);
        // sanity: the prev-hash-stripped view is what the chain hashed before
        // `prev_hash` was attached.
        assert_eq!(hashable_fields_for_chain(&record)["tenant_id"], "t1");
    }
}
