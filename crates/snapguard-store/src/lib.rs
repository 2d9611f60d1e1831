#![warn(missing_docs)]

//! SnapGuard storage engine: deduplicated (BLAKE3), encrypted (AES-GCM/ChaCha20), signed snapshot store
//!
//! Ingest path:  Source tree → Chunk → Fingerprint (BLAKE3) → Dedupe → Encrypt → Store → Signed manifest
//! Restore path: Verify manifest → Read chunk → Decrypt + authenticate → Stage → Move into place
//! Prune path:   Retention (daily/weekly/monthly) → Delete manifest → Release refs → Sweep after grace

pub mod audit;
pub mod backend;
pub mod chunker;
pub mod config;
pub mod content_store;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod gc;
pub mod history;
pub mod key_manager;
pub mod lifecycle;
pub mod logging;
pub mod manifest;
pub mod persist;
pub mod restore;
pub mod retention;
pub mod source;
pub mod throttle;
pub mod worker;

pub use audit::{AuditEvent, AuditFilter, AuditLog, AuditOperation};
pub use backend::{ChunkBackend, DiskBackend, MemoryBackend};
pub use chunker::{Chunk, Chunker, ChunkingMode};
pub use config::StoreConfig;
pub use content_store::{ContentStore, ContentStoreStats, SweepReport};
pub use crypto::{Algorithm, Sealed, SecretKey, Signature};
pub use engine::{
    ChunkFailure, CreatedSnapshot, IngestStats, PruneReport, RestoreReport, SnapshotEngine,
    SnapshotSummary, VerifyReport,
};
pub use error::{StoreError, StoreResult};
pub use fingerprint::ChunkHash;
pub use gc::{GarbageCollector, GcReport};
pub use history::{FileVersion, IndexedSnapshot, TimeMachineIndex};
pub use key_manager::{KeyHandle, KeyId, KeyLease, KeyManager, KeyRecord, KeyReferences, KeyRole, KeyStatus};
pub use lifecycle::SnapshotState;
pub use logging::init_logging;
pub use manifest::{ManifestEntry, ManifestStore, SnapshotManifest};
pub use retention::{RetentionClass, RetentionDecision, RetentionPolicy};
pub use source::{BtrfsSource, MemorySource, OverlaySource, SnapshotSource, SourceEntry, SnapshotTree};
pub use throttle::IoThrottle;
pub use worker::WorkerPool;
