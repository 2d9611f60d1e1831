//! Per-path version history across snapshots.
//!
//! A [`TimeMachineIndex`] maps every file path to the snapshots that hold a
//! copy of it, oldest first, and marks the copies whose content differs from
//! the one before. It is built from verified manifests and can be written
//! out as JSON for tools that browse history without opening the store.

use crate::error::StoreResult;
use crate::fingerprint::ChunkHash;
use crate::manifest::SnapshotManifest;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// One snapshot's copy of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileVersion {
    /// Snapshot holding this copy
    pub snapshot_id: String,
    /// When that snapshot was taken
    pub created_at: DateTime<Utc>,
    /// Size in bytes
    pub size: u64,
    /// Hex BLAKE3 over the chunk hashes; equal ids mean equal content
    pub content_id: String,
    /// Number of chunks
    pub chunks: usize,
    /// Content differs from the previous version (always true for the first)
    pub changed: bool,
}

/// Snapshot-level fields carried in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexedSnapshot {
    /// Source subvolume
    pub subvolume: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Labels
    pub tags: Vec<String>,
    /// Files in the snapshot
    pub files: usize,
    /// Logical bytes
    pub bytes: u64,
}

/// Version history of every path across a set of snapshots.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TimeMachineIndex {
    /// Snapshots included, by id
    pub snapshots: BTreeMap<String, IndexedSnapshot>,
    /// Versions of each path, oldest first
    pub files: BTreeMap<String, Vec<FileVersion>>,
}

/// Identity of a file's content, derived from its chunk list.
pub fn content_id(chunks: &[ChunkHash]) -> String {
    let mut hasher = blake3::Hasher::new();
    for hash in chunks {
        hasher.update(hash.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

impl TimeMachineIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every file of `manifest`. Manifests may arrive in any order.
    pub fn add_manifest(&mut self, manifest: &SnapshotManifest) {
        if self.snapshots.contains_key(&manifest.snapshot_id) {
            return;
        }
        self.snapshots.insert(
            manifest.snapshot_id.clone(),
            IndexedSnapshot {
                subvolume: manifest.subvolume.clone(),
                created_at: manifest.created_at,
                tags: manifest.tags.clone(),
                files: manifest.entries.len(),
                bytes: manifest.total_bytes(),
            },
        );
        for entry in &manifest.entries {
            let versions = self.files.entry(entry.path.clone()).or_default();
            versions.push(FileVersion {
                snapshot_id: manifest.snapshot_id.clone(),
                created_at: manifest.created_at,
                size: entry.size,
                content_id: content_id(&entry.chunks),
                chunks: entry.chunks.len(),
                changed: true,
            });
            let len = versions.len();
            if len > 1 && order(&versions[len - 2]) > order(&versions[len - 1]) {
                versions.sort_by(|a, b| order(a).cmp(&order(b)));
            }
            mark_changes(versions);
        }
    }

    /// Versions of `path`, oldest first. Empty if no snapshot holds it.
    pub fn history(&self, path: &str) -> &[FileVersion] {
        self.files.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Newest version of `path`.
    pub fn latest(&self, path: &str) -> Option<&FileVersion> {
        self.history(path).last()
    }

    /// The copy of `path` held by `snapshot_id`.
    pub fn version(&self, path: &str, snapshot_id: &str) -> Option<&FileVersion> {
        self.history(path).iter().find(|v| v.snapshot_id == snapshot_id)
    }

    /// Versions of `path` whose content differs from the one before.
    pub fn changes(&self, path: &str) -> impl Iterator<Item = &FileVersion> {
        self.history(path).iter().filter(|v| v.changed)
    }

    /// Number of distinct paths.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True if no path is indexed.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> StoreResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

fn order(v: &FileVersion) -> (DateTime<Utc>, &str) {
    (v.created_at, v.snapshot_id.as_str())
}

fn mark_changes(versions: &mut [FileVersion]) {
    let mut previous: Option<&str> = None;
    let mut flags = Vec::with_capacity(versions.len());
    for v in versions.iter() {
        flags.push(previous != Some(v.content_id.as_str()));
        previous = Some(v.content_id.as_str());
    }
    for (v, changed) in versions.iter_mut().zip(flags) {
        v.changed = changed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::blake3_hash;
    use crate::manifest::{ManifestEntry, SnapshotManifest};
    use crate::crypto::Signature;

    fn manifest(id: &str, at_secs: i64, files: &[(&str, &[u8])]) -> SnapshotManifest {
        SnapshotManifest {
            version: 1,
            snapshot_id: id.to_string(),
            subvolume: "vol".to_string(),
            created_at: DateTime::from_timestamp(at_secs, 0).unwrap(),
            tags: vec![],
            entries: files
                .iter()
                .map(|(path, data)| ManifestEntry {
                    path: path.to_string(),
                    size: data.len() as u64,
                    chunks: vec![blake3_hash(data)],
                })
                .collect(),
            checksum: [0u8; 32],
            signature: Signature([0u8; 32]),
            signing_key_id: crate::key_manager::KeyId::new("signing_1_test"),
        }
    }

    #[test]
    fn test_history_is_oldest_first_regardless_of_insert_order() {
        let mut index = TimeMachineIndex::new();
        index.add_manifest(&manifest("snap_c", 300, &[("a.txt", b"v2")]));
        index.add_manifest(&manifest("snap_a", 100, &[("a.txt", b"v1")]));
        index.add_manifest(&manifest("snap_b", 200, &[("a.txt", b"v1"), ("b.txt", b"x")]));

        let ids: Vec<_> = index.history("a.txt").iter().map(|v| v.snapshot_id.as_str()).collect();
        assert_eq!(ids, vec!["snap_a", "snap_b", "snap_c"]);
        let changed: Vec<_> = index.history("a.txt").iter().map(|v| v.changed).collect();
        assert_eq!(changed, vec![true, false, true]);
        assert_eq!(index.changes("a.txt").count(), 2);
        assert_eq!(index.latest("a.txt").unwrap().snapshot_id, "snap_c");
        assert_eq!(index.history("b.txt").len(), 1);
        assert!(index.history("missing").is_empty());
        assert_eq!(index.len(), 2);
        assert_eq!(index.snapshots.len(), 3);
    }

    #[test]
    fn test_version_lookup_and_content_identity() {
        let mut index = TimeMachineIndex::new();
        index.add_manifest(&manifest("snap_a", 100, &[("f", b"same")]));
        index.add_manifest(&manifest("snap_b", 200, &[("f", b"same")]));
        let a = index.version("f", "snap_a").unwrap();
        let b = index.version("f", "snap_b").unwrap();
        assert_eq!(a.content_id, b.content_id);
        assert_eq!(a.content_id, content_id(&[blake3_hash(b"same")]));
        assert!(index.version("f", "snap_z").is_none());
    }

    #[test]
    fn test_adding_a_snapshot_twice_is_ignored() {
        let mut index = TimeMachineIndex::new();
        let m = manifest("snap_a", 100, &[("f", b"x")]);
        index.add_manifest(&m);
        index.add_manifest(&m);
        assert_eq!(index.history("f").len(), 1);
    }

    #[test]
    fn test_json_layout() {
        let mut index = TimeMachineIndex::new();
        index.add_manifest(&manifest("snap_a", 100, &[("dir/f", b"x")]));
        let json: serde_json::Value = serde_json::from_slice(&index.to_json().unwrap()).unwrap();
        assert_eq!(json["snapshots"]["snap_a"]["files"], 1);
        assert_eq!(json["files"]["dir/f"][0]["snapshot_id"], "snap_a");
        assert_eq!(json["files"]["dir/f"][0]["size"], 1);
    }
}
