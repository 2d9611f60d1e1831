//! Error types for the snapshot storage engine.

use thiserror::Error;

/// Result type alias for storage engine operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// All errors surfaced by the storage engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No key with this identifier (or no active key for a role) exists.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// The key is still referenced and cannot be purged.
    #[error("Key {key_id} is still in use ({references} references)")]
    KeyInUse {
        /// The key that was asked to be purged.
        key_id: String,
        /// Number of chunks and manifests still citing it.
        references: usize,
    },

    /// The algorithm is unknown or not usable for the requested key role.
    #[error("Invalid algorithm {algorithm} for {role} keys")]
    InvalidAlgorithm {
        /// Algorithm name as supplied.
        algorithm: String,
        /// Role the key was requested for.
        role: String,
    },

    /// Authentication tag or content hash mismatch.
    #[error("Integrity check failed: {0}")]
    IntegrityError(String),

    /// Manifest checksum or signature mismatch, or an unreadable manifest record.
    #[error("Manifest {snapshot_id} has been tampered with: {reason}")]
    TamperedManifest {
        /// Snapshot whose manifest failed verification.
        snapshot_id: String,
        /// What did not match.
        reason: String,
    },

    /// The index references a chunk that the backing store does not hold.
    #[error("Chunk missing from backing store: {hash}")]
    ChunkMissing {
        /// Hex content hash of the missing chunk.
        hash: String,
    },

    /// A refcount update kept losing races and exhausted its retry budget.
    #[error("Concurrent modification of chunk {hash} after {attempts} attempts")]
    ConcurrentModification {
        /// Hex content hash of the contended chunk.
        hash: String,
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// Refcount decremented below zero; the index disagrees with the manifests.
    #[error("Refcount underflow on chunk {hash}")]
    RefcountUnderflow {
        /// Hex content hash of the chunk.
        hash: String,
    },

    /// The I/O throttle could not grant the requested budget in time.
    #[error("I/O throttle timeout: {direction} of {bytes} bytes not granted within {waited_ms} ms")]
    IoThrottleTimeout {
        /// `read` or `write`.
        direction: &'static str,
        /// Size of the request.
        bytes: u64,
        /// How long the caller was allowed to wait.
        waited_ms: u64,
    },

    /// Retention configuration is invalid or contradictory.
    #[error("Invalid retention policy: {0}")]
    RetentionPolicy(String),

    /// A configuration field is out of range.
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfig {
        /// Dotted field name.
        field: String,
        /// Why it was rejected.
        reason: String,
    },

    /// No manifest exists for this snapshot.
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// A manifest entry path would escape the restore target.
    #[error("Invalid path in manifest: {0}")]
    InvalidPath(String),

    /// The operation was cancelled between chunk boundaries.
    #[error("Operation cancelled")]
    Cancelled,

    /// AEAD setup or sealing failed.
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Encoding or decoding of a persisted record failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The filesystem snapshot collaborator failed.
    #[error("Snapshot source error: {0}")]
    Source(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True for errors that indicate on-disk corruption or tampering.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::IntegrityError(_)
                | StoreError::TamperedManifest { .. }
                | StoreError::ChunkMissing { .. }
                | StoreError::RefcountUnderflow { .. }
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
