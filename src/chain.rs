//! Hash Chain (C5): process-wide prev-hash linkage.
//!
//! Single mutable head behind a `parking_lot::Mutex`, a cheap lock for
//! non-async-held critical sections — it is taken only long enough to
//! read-then-replace the head.

use parking_lot::Mutex;
use serde_json::Value;

use crate::canon::hash_canonical;
use crate::error::Result;

/// Tracks the most recent `leaf_hash` produced by this process.
///
/// Chain linkage is single-producer: callers serialize through this
/// struct's own lock, so record order in the chain always matches the
/// order `link` was called.
pub struct HashChain {
    head: Mutex<Option<String>>,
}

impl HashChain {
    pub fn new() -> Self {
        Self { head: Mutex::new(None) }
    }

    /// Compute `leaf_hash` for a record, given its non-hash fields already
    /// assembled as a JSON value (without `prev_hash`/`leaf_hash`). Sets
    /// `chain_head` to the new leaf and returns `(prev_hash, leaf_hash)`.
    pub fn link(&self, record_fields: &Value) -> Result<(Option<String>, String)> {
        let mut head = self.head.lock();
        let prev_hash = head.clone();

        let mut with_prev = record_fields.clone();
        if let Value::Object(ref mut map) = with_prev {
            map.insert(
                "prev_hash".to_string(),
                prev_hash.clone().map(Value::String).unwrap_or(Value::Null),
            );
        }
        let leaf = hash_canonical(Some(&with_prev))?;

        *head = Some(leaf.clone());
        Ok((prev_hash, leaf))
    }

    /// Current chain head, for diagnostics/tests.
    pub fn head(&self) -> Option<String> {
        self.head.lock().clone()
    }
}

impl Default for HashChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_record_has_null_prev_hash() {
        let chain = HashChain::new();
        let (prev, _leaf) = chain.link(&json!({"tenant_id": "t1"})).unwrap();
        assert!(prev.is_none());
    }

    #[test]
    fn chain_links_sequentially() {
        let chain = HashChain::new();
        let (prev0, leaf0) = chain.link(&json!({"i": 0})).unwrap();
        let (prev1, leaf1) = chain.link(&json!({"i": 1})).unwrap();
        let (prev2, leaf2) = chain.link(&json!({"i": 2})).unwrap();

        assert!(prev0.is_none());
        assert_eq!(prev1, Some(leaf0));
        assert_eq!(prev2, Some(leaf1));
        assert_ne!(leaf2, prev2.unwrap());
    }
}
