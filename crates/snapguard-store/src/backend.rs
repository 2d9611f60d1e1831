//! Backing stores for encrypted chunk records.

use crate::fingerprint::ChunkHash;
use crate::persist;
use dashmap::DashMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Where chunk records physically live.
/// Object-safe and sync so it can be shared across blocking workers.
pub trait ChunkBackend: Send + Sync {
    /// Durably store the record for `hash`, replacing any previous one.
    fn put(&self, hash: &ChunkHash, record: &[u8]) -> io::Result<()>;

    /// Fetch the record for `hash`, or `None` if it is not stored.
    fn get(&self, hash: &ChunkHash) -> io::Result<Option<Vec<u8>>>;

    /// Remove the record. Returns false if it was already gone.
    fn delete(&self, hash: &ChunkHash) -> io::Result<bool>;

    /// Every stored hash.
    fn list(&self) -> io::Result<Vec<ChunkHash>>;
}

/// Chunk files sharded by hash prefix: `<root>/ab/cd/abcd...`.
pub struct DiskBackend {
    root: PathBuf,
}

impl DiskBackend {
    /// Use (and create) `root` as the chunk directory.
    pub fn open(root: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Path of the record for `hash`.
    pub fn path_of(&self, hash: &ChunkHash) -> PathBuf {
        self.root.join(hash.shard_path())
    }
}

impl ChunkBackend for DiskBackend {
    fn put(&self, hash: &ChunkHash, record: &[u8]) -> io::Result<()> {
        persist::write_atomic(&self.path_of(hash), record)
    }

    fn get(&self, hash: &ChunkHash) -> io::Result<Option<Vec<u8>>> {
        persist::read_optional(&self.path_of(hash))
    }

    fn delete(&self, hash: &ChunkHash) -> io::Result<bool> {
        let removed = persist::remove_if_exists(&self.path_of(hash))?;
        debug!(hash = %hash, removed, "deleted chunk file");
        Ok(removed)
    }

    fn list(&self) -> io::Result<Vec<ChunkHash>> {
        let mut hashes = Vec::new();
        for l1 in std::fs::read_dir(&self.root)? {
            let l1 = l1?.path();
            if !l1.is_dir() {
                continue;
            }
            for l2 in std::fs::read_dir(&l1)? {
                let l2 = l2?.path();
                if !l2.is_dir() {
                    continue;
                }
                for file in std::fs::read_dir(&l2)? {
                    let path = file?.path();
                    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    match ChunkHash::from_hex(name) {
                        Ok(hash) => hashes.push(hash),
                        // Leftover temp files from an interrupted write.
                        Err(_) => warn!(path = %path.display(), "ignoring stray file in chunk store"),
                    }
                }
            }
        }
        Ok(hashes)
    }
}

/// Chunk records held in memory.
#[derive(Default)]
pub struct MemoryBackend {
    records: DashMap<ChunkHash, Vec<u8>>,
}

impl MemoryBackend {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a stored record in place.
    pub fn corrupt(&self, hash: &ChunkHash, f: impl FnOnce(&mut Vec<u8>)) -> bool {
        match self.records.get_mut(hash) {
            Some(mut r) => {
                f(r.value_mut());
                true
            }
            None => false,
        }
    }
}

impl ChunkBackend for MemoryBackend {
    fn put(&self, hash: &ChunkHash, record: &[u8]) -> io::Result<()> {
        self.records.insert(*hash, record.to_vec());
        Ok(())
    }

    fn get(&self, hash: &ChunkHash) -> io::Result<Option<Vec<u8>>> {
        Ok(self.records.get(hash).map(|r| r.value().clone()))
    }

    fn delete(&self, hash: &ChunkHash) -> io::Result<bool> {
        Ok(self.records.remove(hash).is_some())
    }

    fn list(&self) -> io::Result<Vec<ChunkHash>> {
        Ok(self.records.iter().map(|r| *r.key()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::blake3_hash;

    fn exercise(backend: &dyn ChunkBackend) {
        let a = blake3_hash(b"a");
        let b = blake3_hash(b"b");
        backend.put(&a, b"record-a").unwrap();
        backend.put(&b, b"record-b").unwrap();
        assert_eq!(backend.get(&a).unwrap().unwrap(), b"record-a");

        let mut listed = backend.list().unwrap();
        listed.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(listed, expected);

        assert!(backend.delete(&a).unwrap());
        assert!(!backend.delete(&a).unwrap());
        assert!(backend.get(&a).unwrap().is_none());
    }

    #[test]
    fn memory_backend() {
        exercise(&MemoryBackend::new());
    }

    #[test]
    fn disk_backend_shards_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::open(dir.path()).unwrap();
        exercise(&backend);

        let h = blake3_hash(b"shard me");
        backend.put(&h, b"x").unwrap();
        let hex = h.to_hex();
        assert!(dir.path().join(&hex[0..2]).join(&hex[2..4]).join(&hex).exists());
    }
}
