//! Content-addressed hashing for checkpoints.
//!
//! Uses SHA-256 for both state content digests and checkpoint identities.
//! Comparisons always use the full 32 bytes; [`Hash::short`] is for display.

use crate::error::TimelineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct Hash([u8; 32]);

impl Hash {
    /// Create a hash from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }

    /// Get the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Create from a full-length hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 64 {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex_str = std::str::from_utf8(chunk).ok()?;
            bytes[i] = u8::from_str_radix(hex_str, 16).ok()?;
        }
        Some(Hash(bytes))
    }

    /// Truncated form for logs and status output. Never compare on this.
    pub fn short(&self) -> String {
        self.to_hex()[..16].to_string()
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}...)", self.short())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Hasher utility for computing content hashes.
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    /// Create a new hasher.
    pub fn new() -> Self {
        Hasher {
            inner: Sha256::new(),
        }
    }

    /// Update the hasher with data.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Update with a length-prefixed string so adjacent fields cannot alias.
    pub fn update_str(&mut self, s: &str) {
        self.inner.update((s.len() as u64).to_le_bytes());
        self.inner.update(s.as_bytes());
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> Hash {
        let result = self.inner.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&result);
        Hash(bytes)
    }

    /// Hash data directly.
    pub fn hash(data: &[u8]) -> Hash {
        let mut hasher = Self::new();
        hasher.update(data);
        hasher.finalize()
    }

    /// Hash any serializable state over its canonical JSON encoding.
    ///
    /// Object keys are sorted at every depth, so two snapshots that differ
    /// only in key insertion order hash identically.
    pub fn hash_state<S: Serialize + ?Sized>(state: &S) -> Result<Hash, TimelineError> {
        let value = serde_json::to_value(state)?;
        let bytes = canonical_bytes(&value)?;
        Ok(Self::hash(&bytes))
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialize a JSON value with object keys stable-sorted at every level.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, TimelineError> {
    Ok(serde_json::to_vec(&canonicalize(value))?)
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = serde_json::Map::new();
            for (key, inner) in entries {
                sorted.insert(key.clone(), canonicalize(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_deterministic() {
        let data = b"hello world";
        assert_eq!(Hasher::hash(data), Hasher::hash(data));
        assert_ne!(Hasher::hash(b"hello"), Hasher::hash(b"world"));
    }

    #[test]
    fn test_hex_roundtrip() {
        let h1 = Hasher::hash(b"test data");
        let h2 = Hash::from_hex(&h1.to_hex()).unwrap();
        assert_eq!(h1, h2);
        assert!(Hash::from_hex(&h1.short()).is_none());
    }

    #[test]
    fn test_state_hash_ignores_key_order() {
        let a: serde_json::Map<String, Value> =
            serde_json::from_str(r#"{"x": 1, "nested": {"b": 2, "a": [3, {"z": 0, "y": 1}]}}"#)
                .unwrap();
        let b = json!({"nested": {"a": [3, {"y": 1, "z": 0}], "b": 2}, "x": 1});

        assert_eq!(Hasher::hash_state(&a).unwrap(), Hasher::hash_state(&b).unwrap());
    }

    #[test]
    fn test_state_hash_sensitive_to_values() {
        let a = Hasher::hash_state(&json!({"x": 1})).unwrap();
        let b = Hasher::hash_state(&json!({"x": 2})).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_short_is_prefix_of_full() {
        let h = Hasher::hash(b"display");
        assert!(h.to_hex().starts_with(&h.short()));
        assert_eq!(h.to_hex().len(), 64);
    }

    #[test]
    fn test_update_str_separates_fields() {
        let mut a = Hasher::new();
        a.update_str("ab");
        a.update_str("c");
        let mut b = Hasher::new();
        b.update_str("a");
        b.update_str("bc");
        assert_ne!(a.finalize(), b.finalize());
    }
}
