//! Common fixtures for snapguard-store integration tests.
#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use snapguard_store::crypto::MIN_KDF_ITERATIONS;
use snapguard_store::{ChunkBackend, MemoryBackend, SnapshotEngine, SourceEntry, StoreConfig};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub const PASSPHRASE: &[u8] = b"correct horse battery staple";

/// Store config with the cheapest allowed KDF and two workers.
pub fn test_config(root: &Path) -> StoreConfig {
    let mut config = StoreConfig::with_root(root);
    config.crypto.kdf_iterations = MIN_KDF_ITERATIONS;
    config.workers = 2;
    config
}

/// An engine over an in-memory chunk backend that tests can corrupt.
pub struct TestStore {
    pub dir: TempDir,
    pub backend: Arc<MemoryBackend>,
    pub engine: SnapshotEngine,
}

impl TestStore {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut StoreConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir.path().join("store"));
        tweak(&mut config);
        let backend = Arc::new(MemoryBackend::new());
        let engine = SnapshotEngine::open_with_backend(
            config,
            PASSPHRASE,
            Arc::clone(&backend) as Arc<dyn ChunkBackend>,
            None,
        )
        .unwrap();
        Self { dir, backend, engine }
    }

    pub fn root(&self) -> std::path::PathBuf {
        self.engine.config().root_dir.clone()
    }

    /// Drop the engine and open the same store again.
    pub fn reopen(self) -> Self {
        let config = self.engine.config().clone();
        let TestStore { dir, backend, engine } = self;
        drop(engine);
        let engine = SnapshotEngine::open_with_backend(
            config,
            PASSPHRASE,
            Arc::clone(&backend) as Arc<dyn ChunkBackend>,
            None,
        )
        .unwrap();
        Self { dir, backend, engine }
    }

    pub fn stored_chunks(&self) -> usize {
        self.backend.list().unwrap().len()
    }

    /// Ingest `files` as one snapshot and return its id.
    pub async fn snapshot(&self, files: &[(&str, &[u8])], at: DateTime<Utc>) -> String {
        self.engine
            .create_snapshot_from_entries("home", vec![], entries(files), at)
            .await
            .unwrap()
            .snapshot_id
    }
}

pub fn entries(files: &[(&str, &[u8])]) -> Vec<SourceEntry> {
    files
        .iter()
        .map(|(path, data)| SourceEntry::memory(*path, data.to_vec()))
        .collect()
}

/// Noon UTC, `days_ago` days before 2024-03-20.
pub fn day(days_ago: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap() - Duration::days(days_ago)
}

pub fn read_tree(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut out = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            if entry.file_type().unwrap().is_dir() {
                pending.push(path);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/");
                out.push((rel, std::fs::read(&path).unwrap()));
            }
        }
    }
    out.sort();
    out
}
