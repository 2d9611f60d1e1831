//! Content fingerprinting: BLAKE3 hashing of chunk plaintext

use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A 32-byte BLAKE3 hash of a chunk's plaintext. Used as the content-store key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkHash(pub [u8; 32]);

impl ChunkHash {
    /// Return the hash as a lowercase hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> StoreResult<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| StoreError::Serialization(format!("bad chunk hash {s:?}: {e}")))?;
        Ok(ChunkHash(bytes))
    }

    /// Return the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Two-level shard path relative to the chunk root: `ab/cd/abcd...`.
    pub fn shard_path(&self) -> PathBuf {
        let hex = self.to_hex();
        PathBuf::from(&hex[0..2]).join(&hex[2..4]).join(hex)
    }
}

impl std::fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Compute the BLAKE3 hash of data
pub fn blake3_hash(data: &[u8]) -> ChunkHash {
    let hash = blake3::hash(data);
    ChunkHash(*hash.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn blake3_hash_is_deterministic() {
        let h1 = blake3_hash(b"hello world");
        let h2 = blake3_hash(b"hello world");
        assert_eq!(h1, h2);
    }

    #[test]
    fn different_data_produces_different_hashes() {
        assert_ne!(blake3_hash(b"hello"), blake3_hash(b"world"));
    }

    #[test]
    fn hex_parses_back() {
        let h = blake3_hash(b"hello");
        assert_eq!(ChunkHash::from_hex(&h.to_hex()).unwrap(), h);
        assert!(ChunkHash::from_hex("zz").is_err());
        assert!(ChunkHash::from_hex("abcd").is_err());
    }

    #[test]
    fn shard_path_uses_prefix() {
        let h = blake3_hash(b"hello");
        let hex = h.to_hex();
        let path = h.shard_path();
        let parts: Vec<_> = path.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        assert_eq!(parts, vec![hex[0..2].to_string(), hex[2..4].to_string(), hex.clone()]);
    }

    proptest! {
        #[test]
        fn prop_blake3_deterministic(data in prop::collection::vec(0u8..=255, 0..10_000)) {
            prop_assert_eq!(blake3_hash(&data), blake3_hash(&data));
        }
    }
}
