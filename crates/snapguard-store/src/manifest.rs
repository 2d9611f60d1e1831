//! Signed snapshot manifests and their durable store.

use crate::crypto::{self, Signature};
use crate::error::{StoreError, StoreResult};
use crate::fingerprint::ChunkHash;
use crate::key_manager::{KeyHandle, KeyId, KeyManager, KeyRole};
use crate::persist;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Current manifest format.
pub const MANIFEST_VERSION: u32 = 1;

/// One file in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestEntry {
    /// Relative path, `/`-separated
    pub path: String,
    /// File size in bytes
    pub size: u64,
    /// Chunk hashes in file order
    pub chunks: Vec<ChunkHash>,
}

/// Immutable, signed record of one snapshot.
///
/// The JSON form is compact and strict: unknown fields, hex spellings and
/// fractional timestamps are all rejected, so no bit of the persisted record
/// can change without changing what it decodes to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotManifest {
    /// Format version
    pub version: u32,
    /// Snapshot id
    pub snapshot_id: String,
    /// Source subvolume label
    pub subvolume: String,
    /// Creation time
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Retention tags
    pub tags: Vec<String>,
    /// Files in snapshot order
    pub entries: Vec<ManifestEntry>,
    /// SHA-256 of the canonical serialization
    pub checksum: [u8; 32],
    /// HMAC-SHA256 over canonical bytes and checksum
    pub signature: Signature,
    /// Key that produced `signature`
    pub signing_key_id: KeyId,
}

/// Unsigned manifest content.
#[derive(Debug, Clone)]
pub struct ManifestDraft {
    /// Snapshot id
    pub snapshot_id: String,
    /// Source subvolume label
    pub subvolume: String,
    /// Creation time (millisecond precision is kept)
    pub created_at: DateTime<Utc>,
    /// Retention tags
    pub tags: Vec<String>,
    /// Files in snapshot order
    pub entries: Vec<ManifestEntry>,
}

impl SnapshotManifest {
    /// Sign `draft` with `key`, normally a leased active signing key.
    pub fn build(draft: ManifestDraft, key: &KeyHandle) -> StoreResult<Self> {
        validate_id(&draft.snapshot_id)?;
        if key.role() != KeyRole::Signing {
            return Err(StoreError::InvalidAlgorithm {
                algorithm: key.algorithm().to_string(),
                role: KeyRole::Signing.to_string(),
            });
        }
        let created_at = DateTime::from_timestamp_millis(draft.created_at.timestamp_millis())
            .unwrap_or(draft.created_at);
        let mut manifest = SnapshotManifest {
            version: MANIFEST_VERSION,
            snapshot_id: draft.snapshot_id,
            subvolume: draft.subvolume,
            created_at,
            tags: draft.tags,
            entries: draft.entries,
            checksum: [0u8; 32],
            signature: Signature([0u8; 32]),
            signing_key_id: key.id().clone(),
        };
        let canonical = manifest.canonical_bytes();
        manifest.checksum = sha256(&canonical);
        manifest.signature = crypto::sign(&signed_message(&canonical, &manifest.checksum), key.material())?;
        debug!(
            snapshot_id = %manifest.snapshot_id,
            files = manifest.entries.len(),
            key_id = %manifest.signing_key_id,
            "manifest signed"
        );
        Ok(manifest)
    }

    /// Recompute the checksum and check the signature against the recorded
    /// key, which may be retired.
    pub fn verify(&self, keys: &KeyManager) -> StoreResult<()> {
        let tampered = |reason: &str| StoreError::TamperedManifest {
            snapshot_id: self.snapshot_id.clone(),
            reason: reason.to_string(),
        };
        if self.version != MANIFEST_VERSION {
            return Err(tampered("unknown format version"));
        }
        let canonical = self.canonical_bytes();
        let checksum = sha256(&canonical);
        if checksum != self.checksum {
            return Err(tampered("checksum mismatch"));
        }
        let key = keys
            .get_key(&self.signing_key_id)
            .map_err(|_| tampered("signing key unavailable"))?;
        if key.role() != KeyRole::Signing {
            return Err(tampered("recorded key is not a signing key"));
        }
        crypto::verify(&signed_message(&canonical, &self.checksum), &self.signature, key.material())
            .map_err(|_| tampered("signature mismatch"))
    }

    /// Every chunk reference in order, one item per occurrence.
    pub fn chunk_refs(&self) -> impl Iterator<Item = &ChunkHash> {
        self.entries.iter().flat_map(|e| e.chunks.iter())
    }

    /// Sum of file sizes.
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Length-prefixed little-endian encoding of everything except
    /// checksum and signature:
    ///
    /// version (4) || id || subvolume || created_at ms (8) || tag count (8) || tags ||
    /// entry count (8) || for each entry: path || size (8) || chunk count (8) || hashes (32 each) ||
    /// signing key id
    ///
    /// where every string is its byte length (8) followed by its UTF-8 bytes.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut msg = Vec::with_capacity(256 + self.entries.len() * 64);
        msg.extend_from_slice(&self.version.to_le_bytes());
        put_str(&mut msg, &self.snapshot_id);
        put_str(&mut msg, &self.subvolume);
        msg.extend_from_slice(&self.created_at.timestamp_millis().to_le_bytes());
        msg.extend_from_slice(&(self.tags.len() as u64).to_le_bytes());
        for tag in &self.tags {
            put_str(&mut msg, tag);
        }
        msg.extend_from_slice(&(self.entries.len() as u64).to_le_bytes());
        for entry in &self.entries {
            put_str(&mut msg, &entry.path);
            msg.extend_from_slice(&entry.size.to_le_bytes());
            msg.extend_from_slice(&(entry.chunks.len() as u64).to_le_bytes());
            for hash in &entry.chunks {
                msg.extend_from_slice(hash.as_bytes());
            }
        }
        put_str(&mut msg, self.signing_key_id.as_str());
        msg
    }

    /// Compact JSON as persisted.
    pub fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a persisted record. Any decoding failure is reported as tampering.
    pub fn from_bytes(snapshot_id: &str, bytes: &[u8]) -> StoreResult<Self> {
        let manifest: SnapshotManifest =
            serde_json::from_slice(bytes).map_err(|e| StoreError::TamperedManifest {
                snapshot_id: snapshot_id.to_string(),
                reason: format!("unreadable record: {e}"),
            })?;
        if manifest.snapshot_id != snapshot_id {
            return Err(StoreError::TamperedManifest {
                snapshot_id: snapshot_id.to_string(),
                reason: format!("record claims id {}", manifest.snapshot_id),
            });
        }
        Ok(manifest)
    }
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

fn put_str(msg: &mut Vec<u8>, s: &str) {
    msg.extend_from_slice(&(s.len() as u64).to_le_bytes());
    msg.extend_from_slice(s.as_bytes());
}

fn signed_message(canonical: &[u8], checksum: &[u8; 32]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(canonical.len() + checksum.len());
    msg.extend_from_slice(canonical);
    msg.extend_from_slice(checksum);
    msg
}

/// Snapshot ids double as file names.
pub fn validate_id(id: &str) -> StoreResult<()> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::SnapshotNotFound(format!("invalid snapshot id {id:?}")))
    }
}

/// One immutable JSON record per snapshot under `manifests/`.
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    /// Use (and create) `dir`.
    pub fn open(dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_of(&self, snapshot_id: &str) -> PathBuf {
        self.dir.join(format!("{snapshot_id}.json"))
    }

    /// Write a signed manifest atomically. Existing records are never replaced.
    pub fn persist(&self, manifest: &SnapshotManifest) -> StoreResult<()> {
        validate_id(&manifest.snapshot_id)?;
        let path = self.path_of(&manifest.snapshot_id);
        if path.exists() {
            return Err(StoreError::IntegrityError(format!(
                "manifest {} already exists",
                manifest.snapshot_id
            )));
        }
        persist::write_atomic(&path, &manifest.to_bytes()?)?;
        Ok(())
    }

    /// Raw persisted bytes.
    pub fn load_raw(&self, snapshot_id: &str) -> StoreResult<Vec<u8>> {
        validate_id(snapshot_id)?;
        persist::read_optional(&self.path_of(snapshot_id))?
            .ok_or_else(|| StoreError::SnapshotNotFound(snapshot_id.to_string()))
    }

    /// Decode without checking the signature.
    pub fn load(&self, snapshot_id: &str) -> StoreResult<SnapshotManifest> {
        SnapshotManifest::from_bytes(snapshot_id, &self.load_raw(snapshot_id)?)
    }

    /// Decode and verify.
    pub fn load_verified(&self, snapshot_id: &str, keys: &KeyManager) -> StoreResult<SnapshotManifest> {
        let manifest = self.load(snapshot_id)?;
        manifest.verify(keys)?;
        Ok(manifest)
    }

    /// Ids of every persisted manifest, sorted.
    pub fn list_ids(&self) -> StoreResult<Vec<String>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map_or(true, |e| e != "json") {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()) {
                Some(id) if validate_id(id).is_ok() => ids.push(id.to_string()),
                _ => warn!(path = %path.display(), "ignoring stray file in manifest store"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Remove a manifest. Returns false if it was already gone.
    pub fn delete(&self, snapshot_id: &str) -> StoreResult<bool> {
        validate_id(snapshot_id)?;
        Ok(persist::remove_if_exists(&self.path_of(snapshot_id))?)
    }

    /// Overwrite the raw record. Only for corruption tests.
    #[cfg(test)]
    pub(crate) fn overwrite_raw(&self, snapshot_id: &str, bytes: &[u8]) -> StoreResult<()> {
        Ok(persist::write_atomic(&self.path_of(snapshot_id), bytes)?)
    }
}
