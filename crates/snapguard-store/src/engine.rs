//! The snapshot engine: one context object owning every subsystem.
//!
//! Ingestion and restore run file-level jobs on the [`WorkerPool`]; manifest
//! signing, retention and collection run on the calling task. Only one
//! prune runs at a time. Snapshot creation may run concurrently with other
//! creations and with a prune.

use crate::audit::{AuditLog, AuditOperation};
use crate::backend::{ChunkBackend, DiskBackend};
use crate::chunker::Chunker;
use crate::config::StoreConfig;
use crate::content_store::{ContentStore, ContentStoreStats, IngestedFile, SweepReport};
use crate::crypto::Algorithm;
use crate::error::{StoreError, StoreResult};
use crate::fingerprint::ChunkHash;
use crate::gc::GarbageCollector;
use crate::history::{FileVersion, TimeMachineIndex};
use crate::key_manager::{KeyId, KeyLease, KeyManager, KeyReferences, KeyRole};
use crate::lifecycle::{LifecycleTracker, PinRegistry, SnapshotState};
use crate::manifest::{self, ManifestDraft, ManifestEntry, ManifestStore, SnapshotManifest};
use crate::persist;
use crate::restore::{self, PathFilter};
use crate::retention::{self, RetentionCandidate, RetentionClass, RetentionPolicy};
use crate::source::{SnapshotSource, SourceEntry};
use crate::throttle::IoThrottle;
use crate::worker::WorkerPool;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const KEYS_DIR: &str = "keys";
const CHUNKS_DIR: &str = "chunks";
const MANIFESTS_DIR: &str = "manifests";
const PINS_FILE: &str = "pins.json";
const AUDIT_FILE: &str = "audit.log";

/// Catalog entry for a persisted snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotSummary {
    /// Snapshot id
    pub id: String,
    /// Subvolume the snapshot was taken from
    pub subvolume: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Caller-supplied labels
    pub tags: Vec<String>,
    /// Number of files
    pub files: usize,
    /// Logical size in bytes
    pub bytes: u64,
    /// Key that signed the manifest
    pub signing_key_id: KeyId,
    /// Exempt from pruning
    pub pinned: bool,
}

impl SnapshotSummary {
    fn from_manifest(manifest: &SnapshotManifest) -> Self {
        Self {
            id: manifest.snapshot_id.clone(),
            subvolume: manifest.subvolume.clone(),
            created_at: manifest.created_at,
            tags: manifest.tags.clone(),
            files: manifest.entries.len(),
            bytes: manifest.total_bytes(),
            signing_key_id: manifest.signing_key_id.clone(),
            pinned: false,
        }
    }
}

/// Counters from one snapshot ingestion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Files recorded in the manifest
    pub files: usize,
    /// Unreadable files left out
    pub skipped: Vec<String>,
    /// Chunk references taken
    pub chunks: u64,
    /// Chunks written for the first time
    pub new_chunks: u64,
    /// Chunks that were already stored
    pub dedup_hits: u64,
    /// Plaintext bytes read
    pub input_bytes: u64,
    /// Sealed bytes written
    pub stored_bytes: u64,
}

impl IngestStats {
    /// Bytes that did not have to be written thanks to deduplication.
    pub fn bytes_saved(&self) -> u64 {
        self.input_bytes.saturating_sub(self.stored_bytes)
    }

    fn add(&mut self, file: &IngestedFile) {
        self.files += 1;
        self.chunks += file.chunks.len() as u64;
        self.new_chunks += file.new_chunks;
        self.dedup_hits += file.dedup_hits;
        self.input_bytes += file.size;
        self.stored_bytes += file.stored_bytes;
    }
}

/// Result of a successful snapshot creation.
#[derive(Debug, Clone)]
pub struct CreatedSnapshot {
    /// New snapshot id
    pub snapshot_id: String,
    /// Ingestion counters
    pub stats: IngestStats,
}

/// A chunk that failed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    /// Chunk hash
    pub hash: ChunkHash,
    /// Why it failed
    pub error: String,
}

/// Outcome of [`SnapshotEngine::verify_snapshot`].
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    /// Snapshot id
    pub snapshot_id: String,
    /// Files in the manifest
    pub files: usize,
    /// Distinct chunks read back
    pub chunks_checked: usize,
    /// Plaintext bytes authenticated
    pub bytes_checked: u64,
    /// Chunks that were missing or failed authentication
    pub failures: Vec<ChunkFailure>,
}

impl VerifyReport {
    /// True if every chunk authenticated.
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Outcome of [`SnapshotEngine::restore_snapshot`].
#[derive(Debug, Clone)]
pub struct RestoreReport {
    /// Snapshot id
    pub snapshot_id: String,
    /// Restore root
    pub target: PathBuf,
    /// Relative paths written
    pub files: Vec<String>,
    /// Bytes written
    pub bytes: u64,
}

/// Outcome of [`SnapshotEngine::prune`].
#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    /// Snapshots whose manifests were removed
    pub deleted: Vec<String>,
    /// Snapshots kept and the classes that kept them
    pub kept: BTreeMap<String, Vec<RetentionClass>>,
    /// Snapshots selected for deletion that could not be collected
    pub failed: Vec<(String, String)>,
    /// Chunk references dropped
    pub refs_released: u64,
    /// Physical sweep, if it ran
    pub sweep: Option<SweepReport>,
    /// Retired keys purged after the sweep
    pub purged_keys: Vec<KeyId>,
}

enum EntryOutcome {
    Ingested(IngestedFile),
    Skipped(String),
}

/// Remembers whether the wrapped reader ever failed, so source read errors
/// can be told apart from store errors.
struct TrackedReader<R> {
    inner: R,
    failed: bool,
}

impl<R: Read> Read for TrackedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = self.inner.read(buf);
        if matches!(&result, Err(e) if e.kind() != io::ErrorKind::Interrupted) {
            self.failed = true;
        }
        result
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn join_error(e: tokio::task::JoinError) -> StoreError {
    StoreError::Io(io::Error::other(format!("background task failed: {e}")))
}

fn new_snapshot_id(created_at: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("snap_{}_{}", created_at.format("%Y%m%dT%H%M%S%3f"), &suffix[..8])
}

fn check_entries(entries: &[SourceEntry]) -> StoreResult<()> {
    let mut seen = HashSet::with_capacity(entries.len());
    for entry in entries {
        restore::safe_relative(&entry.path)?;
        if !seen.insert(entry.path.as_str()) {
            return Err(StoreError::InvalidPath(format!("duplicate path {}", entry.path)));
        }
    }
    Ok(())
}

fn ingest_entry(
    content: &ContentStore,
    chunker: &Chunker,
    entry: SourceEntry,
    skip_unreadable: bool,
    cancel: &CancellationToken,
) -> StoreResult<EntryOutcome> {
    let reader = match entry.content.open() {
        Ok(reader) => reader,
        Err(e) if skip_unreadable => {
            warn!(path = %entry.path, error = %e, "skipping unopenable file");
            return Ok(EntryOutcome::Skipped(entry.path));
        }
        Err(e) => return Err(e.into()),
    };
    let mut reader = TrackedReader { inner: reader, failed: false };
    match content.ingest_file(chunker, &entry.path, &mut reader, cancel) {
        Ok(file) => {
            if file.size != entry.size {
                debug!(path = %entry.path, listed = entry.size, read = file.size, "file changed size during ingest");
            }
            Ok(EntryOutcome::Ingested(file))
        }
        Err(e) if reader.failed && skip_unreadable => {
            warn!(path = %entry.path, error = %e, "skipping unreadable file");
            Ok(EntryOutcome::Skipped(entry.path))
        }
        Err(e) => Err(e),
    }
}

/// Deduplicated, encrypted, signed snapshot store.
pub struct SnapshotEngine {
    config: StoreConfig,
    audit: Arc<AuditLog>,
    keys: Arc<KeyManager>,
    content: Arc<ContentStore>,
    manifests: Arc<ManifestStore>,
    throttle: Arc<IoThrottle>,
    gc: GarbageCollector,
    pool: WorkerPool,
    chunker: Chunker,
    pins: PinRegistry,
    lifecycle: LifecycleTracker,
    catalog: RwLock<BTreeMap<String, SnapshotSummary>>,
    quarantined: RwLock<BTreeSet<String>>,
    source: Option<Arc<dyn SnapshotSource>>,
    prune_lock: tokio::sync::Mutex<()>,
}

impl SnapshotEngine {
    /// Open the store under `config.root_dir` with chunks on local disk.
    pub fn open(
        config: StoreConfig,
        passphrase: &[u8],
        source: Option<Arc<dyn SnapshotSource>>,
    ) -> StoreResult<Self> {
        config.validate()?;
        let backend = DiskBackend::open(&config.root_dir.join(CHUNKS_DIR))?;
        Self::open_with_backend(config, passphrase, Arc::new(backend), source)
    }

    /// Open the store with chunks kept in `backend`.
    ///
    /// Keys are unlocked with `passphrase`, each role gets an active key if
    /// it has none, and chunk refcounts are rebuilt from the manifests on
    /// disk. Manifests that cannot be parsed are quarantined: they stay on
    /// disk, are excluded from listing and retention, and block chunk sweeps
    /// and key purges until they are removed.
    pub fn open_with_backend(
        config: StoreConfig,
        passphrase: &[u8],
        backend: Arc<dyn ChunkBackend>,
        source: Option<Arc<dyn SnapshotSource>>,
    ) -> StoreResult<Self> {
        config.validate()?;
        let root = config.root_dir.clone();
        std::fs::create_dir_all(&root)?;

        let audit = Arc::new(AuditLog::open(&root.join(AUDIT_FILE), config.audit.actor.clone())?);
        let keys = Arc::new(KeyManager::open(
            &root.join(KEYS_DIR),
            passphrase,
            config.crypto.kdf_iterations,
            Arc::clone(&audit),
        )?);
        keys.ensure_active(KeyRole::Encryption, config.crypto.algorithm)?;
        keys.ensure_active(KeyRole::Signing, Algorithm::HmacSha256)?;

        let throttle = Arc::new(IoThrottle::new(&config.throttle));
        let content = Arc::new(ContentStore::new(
            backend,
            Arc::clone(&keys),
            Arc::clone(&throttle),
            config.ingest.refcount_retry_budget,
        ));
        let manifests = Arc::new(ManifestStore::open(&root.join(MANIFESTS_DIR))?);

        let mut catalog = BTreeMap::new();
        let mut quarantined = BTreeSet::new();
        let mut references: Vec<ChunkHash> = Vec::new();
        for id in manifests.list_ids()? {
            match manifests.load(&id) {
                Ok(m) => {
                    references.extend(m.chunk_refs().copied());
                    catalog.insert(id, SnapshotSummary::from_manifest(&m));
                }
                Err(e) => {
                    error!(snapshot_id = %id, error = %e, "quarantining unreadable manifest");
                    quarantined.insert(id);
                }
            }
        }
        let rebuilt = content.rebuild(references.iter(), Utc::now())?;
        if !rebuilt.missing.is_empty() {
            error!(missing = rebuilt.missing.len(), "manifests reference chunks that are not stored");
        }

        let lifecycle = LifecycleTracker::new();
        for id in catalog.keys() {
            lifecycle.restore_active(id);
        }
        let pins = PinRegistry::open(&root.join(PINS_FILE))?;
        let known: BTreeSet<String> = catalog.keys().chain(quarantined.iter()).cloned().collect();
        pins.retain_known(&known)?;

        info!(
            root = %root.display(),
            snapshots = catalog.len(),
            quarantined = quarantined.len(),
            chunks = rebuilt.chunks,
            unreferenced = rebuilt.unreferenced,
            source = source.as_ref().map(|s| s.kind()).unwrap_or("none"),
            "snapshot engine opened"
        );

        Ok(Self {
            gc: GarbageCollector::new(Duration::seconds(config.gc.grace_period_secs as i64)),
            pool: WorkerPool::new(config.workers),
            chunker: Chunker::new(config.chunking.mode, config.chunking.block_size),
            config,
            audit,
            keys,
            content,
            manifests,
            throttle,
            pins,
            lifecycle,
            catalog: RwLock::new(catalog),
            quarantined: RwLock::new(quarantined),
            source,
            prune_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Configuration in effect.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Key manager.
    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    /// Content store.
    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    /// Audit trail.
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// A token that cancels work started with it; also cancelled by shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.pool.job_token()
    }

    /// Take a snapshot of `subvolume` through the configured source and ingest it.
    #[instrument(skip(self, tags))]
    pub async fn create_snapshot(&self, subvolume: &str, tags: Vec<String>) -> StoreResult<String> {
        let source = self
            .source
            .clone()
            .ok_or_else(|| StoreError::Source("no snapshot source configured".to_string()))?;
        let tree = {
            let source = Arc::clone(&source);
            let subvolume = subvolume.to_string();
            tokio::task::spawn_blocking(move || source.take_snapshot(&subvolume))
                .await
                .map_err(join_error)??
        };
        let tree_id = tree.id.clone();
        let created = if tree.unreadable.is_empty() || self.config.ingest.skip_unreadable {
            for path in &tree.unreadable {
                warn!(tree = %tree.id, path = %path, "skipping unreadable source entry");
            }
            self.create_snapshot_from_entries(subvolume, tags, tree.entries, Utc::now())
                .await
                .map(|mut c| {
                    c.stats.skipped.extend(tree.unreadable);
                    c
                })
        } else {
            Err(StoreError::InvalidPath(format!(
                "{} unreadable source entries, first: {}",
                tree.unreadable.len(),
                tree.unreadable[0]
            )))
        };
        let dropped = tokio::task::spawn_blocking(move || source.delete(&tree_id))
            .await
            .map_err(join_error)
            .and_then(|r| r);
        if let Err(e) = dropped {
            warn!(tree = %tree.id, error = %e, "failed to drop source snapshot");
        }
        created.map(|c| c.snapshot_id)
    }

    /// Ingest `entries` as a new snapshot of `subvolume`.
    pub async fn create_snapshot_from_entries(
        &self,
        subvolume: &str,
        tags: Vec<String>,
        entries: Vec<SourceEntry>,
        created_at: DateTime<Utc>,
    ) -> StoreResult<CreatedSnapshot> {
        let token = self.pool.job_token();
        self.create_snapshot_cancellable(subvolume, tags, entries, created_at, token)
            .await
    }

    /// Ingest `entries`, stopping early if `cancel` fires.
    ///
    /// Cancellation or any failure before the manifest is signed releases
    /// every chunk reference this snapshot took; no manifest is written.
    pub async fn create_snapshot_cancellable(
        &self,
        subvolume: &str,
        tags: Vec<String>,
        entries: Vec<SourceEntry>,
        created_at: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> StoreResult<CreatedSnapshot> {
        if self.pool.is_shut_down() {
            return Err(StoreError::Cancelled);
        }
        check_entries(&entries)?;
        let snapshot_id = new_snapshot_id(created_at);
        self.lifecycle.begin(&snapshot_id)?;
        let result = self
            .ingest_and_commit(&snapshot_id, subvolume, tags, entries, created_at, &cancel)
            .await;
        if let Err(e) = &result {
            warn!(snapshot_id = %snapshot_id, error = %e, "snapshot aborted");
            self.advance(&snapshot_id, SnapshotState::Aborted);
        }
        result
    }

    async fn ingest_and_commit(
        &self,
        snapshot_id: &str,
        subvolume: &str,
        tags: Vec<String>,
        entries: Vec<SourceEntry>,
        created_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> StoreResult<CreatedSnapshot> {
        self.lifecycle.transition(snapshot_id, SnapshotState::Ingesting)?;
        let skip_unreadable = self.config.ingest.skip_unreadable;
        let jobs: Vec<_> = entries
            .into_iter()
            .map(|entry| {
                let content = Arc::clone(&self.content);
                let chunker = self.chunker.clone();
                move |token: CancellationToken| {
                    ingest_entry(&content, &chunker, entry, skip_unreadable, &token)
                }
            })
            .collect();

        let mut stats = IngestStats::default();
        let mut files = Vec::with_capacity(jobs.len());
        let mut failure = None;
        for result in self.pool.run_all(jobs, cancel).await {
            match result {
                Ok(EntryOutcome::Ingested(file)) => files.push(file),
                Ok(EntryOutcome::Skipped(path)) => stats.skipped.push(path),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        if failure.is_none() && cancel.is_cancelled() {
            failure = Some(StoreError::Cancelled);
        }
        if let Some(e) = failure {
            self.roll_back(snapshot_id, &files);
            return Err(e);
        }

        for file in &files {
            stats.add(file);
        }
        let draft = ManifestDraft {
            snapshot_id: snapshot_id.to_string(),
            subvolume: subvolume.to_string(),
            created_at,
            tags,
            entries: files
                .iter()
                .map(|f| ManifestEntry {
                    path: f.path.clone(),
                    size: f.size,
                    chunks: f.chunks.clone(),
                })
                .collect(),
        };
        let committed = self
            .keys
            .lease_active(KeyRole::Signing)
            .and_then(|signing| self.commit_manifest(draft, &signing));
        let manifest = match committed {
            Ok(m) => m,
            Err(e) => {
                self.audit
                    .record(AuditOperation::ManifestCreate, snapshot_id, false, e.to_string());
                self.roll_back(snapshot_id, &files);
                return Err(e);
            }
        };

        self.audit.record(
            AuditOperation::ManifestCreate,
            snapshot_id,
            true,
            format!(
                "subvolume={subvolume} files={} bytes={} key={}",
                stats.files, stats.input_bytes, manifest.signing_key_id
            ),
        );
        self.advance(snapshot_id, SnapshotState::Active);

        info!(
            snapshot_id,
            subvolume,
            files = stats.files,
            skipped = stats.skipped.len(),
            new_chunks = stats.new_chunks,
            dedup_hits = stats.dedup_hits,
            bytes_saved = stats.bytes_saved(),
            "snapshot created"
        );
        Ok(CreatedSnapshot {
            snapshot_id: snapshot_id.to_string(),
            stats,
        })
    }

    /// Sign, persist, and catalog a manifest. The lease keeps the signing key
    /// from being purged until the catalog entry that references it exists.
    fn commit_manifest(&self, draft: ManifestDraft, signing: &KeyLease) -> StoreResult<SnapshotManifest> {
        let manifest = SnapshotManifest::build(draft, signing.key())?;
        self.manifests.persist(&manifest)?;
        self.advance(&manifest.snapshot_id, SnapshotState::Manifested);
        write_lock(&self.catalog).insert(
            manifest.snapshot_id.clone(),
            SnapshotSummary::from_manifest(&manifest),
        );
        Ok(manifest)
    }

    fn roll_back(&self, snapshot_id: &str, files: &[IngestedFile]) {
        let now = Utc::now();
        let mut released = 0usize;
        let mut failed = 0usize;
        for file in files {
            failed += self.content.release_all(&file.chunks, now);
            released += file.chunks.len();
        }
        if failed > 0 {
            error!(snapshot_id, released, failed, "rollback left chunk references behind");
        } else {
            debug!(snapshot_id, released, "rolled back chunk references");
        }
    }

    fn advance(&self, snapshot_id: &str, next: SnapshotState) {
        if let Err(e) = self.lifecycle.transition(snapshot_id, next) {
            warn!(snapshot_id, error = %e, "lifecycle transition rejected");
        }
    }

    fn load_verified(&self, snapshot_id: &str) -> StoreResult<SnapshotManifest> {
        self.manifests
            .load_verified(snapshot_id, &self.keys)
            .inspect_err(|e| {
                if matches!(e, StoreError::TamperedManifest { .. }) {
                    error!(snapshot_id, error = %e, "manifest failed verification");
                }
            })
    }

    /// Check the manifest signature and read back every referenced chunk.
    ///
    /// A bad manifest is an error; chunk failures are reported in the result.
    #[instrument(skip(self))]
    pub async fn verify_snapshot(&self, snapshot_id: &str) -> StoreResult<VerifyReport> {
        let manifest = self.load_verified(snapshot_id)?;
        let unique: Vec<ChunkHash> = manifest
            .chunk_refs()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let per_job = unique.len().div_ceil(self.pool.size()).max(1);
        let jobs: Vec<_> = unique
            .chunks(per_job)
            .map(|batch| {
                let batch = batch.to_vec();
                let content = Arc::clone(&self.content);
                move |token: CancellationToken| {
                    let mut bytes = 0u64;
                    let mut failures = Vec::new();
                    for hash in &batch {
                        if token.is_cancelled() {
                            return Err(StoreError::Cancelled);
                        }
                        match content.read_chunk(hash) {
                            Ok(data) => bytes += data.len() as u64,
                            Err(e) => failures.push(ChunkFailure {
                                hash: *hash,
                                error: e.to_string(),
                            }),
                        }
                    }
                    Ok((batch.len(), bytes, failures))
                }
            })
            .collect();

        let mut report = VerifyReport {
            snapshot_id: snapshot_id.to_string(),
            files: manifest.entries.len(),
            ..VerifyReport::default()
        };
        for result in self.pool.run_all(jobs, &self.pool.job_token()).await {
            let (checked, bytes, failures) = result?;
            report.chunks_checked += checked;
            report.bytes_checked += bytes;
            report.failures.extend(failures);
        }
        if report.is_ok() {
            info!(snapshot_id, chunks = report.chunks_checked, "snapshot verified");
        } else {
            error!(snapshot_id, failures = report.failures.len(), "snapshot verification failed");
        }
        Ok(report)
    }

    /// Restore the files of `snapshot_id` selected by `filter` under `target`.
    ///
    /// `filter` is a glob (`*.txt`, `logs/202?-*`) or a path prefix
    /// (`docs` selects `docs` and everything below it). Files are staged in a
    /// hidden directory under `target` and moved into place only after every
    /// selected file restored and authenticated.
    #[instrument(skip(self, target))]
    pub async fn restore_snapshot(
        &self,
        snapshot_id: &str,
        target: &Path,
        filter: Option<&str>,
    ) -> StoreResult<RestoreReport> {
        let manifest = self.load_verified(snapshot_id)?;
        let filter = PathFilter::parse(filter)?;
        let selected: Vec<ManifestEntry> = manifest
            .entries
            .iter()
            .filter(|e| filter.matches(&e.path))
            .cloned()
            .collect();
        let relative: Vec<PathBuf> = selected
            .iter()
            .map(|e| restore::safe_relative(&e.path))
            .collect::<StoreResult<_>>()?;
        if selected.is_empty() {
            warn!(snapshot_id, "restore filter selected no files");
        }

        std::fs::create_dir_all(target)?;
        let staging = restore::staging_dir(target, snapshot_id);
        if staging.exists() {
            warn!(staging = %staging.display(), "removing stale restore staging directory");
            std::fs::remove_dir_all(&staging)?;
        }
        std::fs::create_dir_all(&staging)?;

        let jobs: Vec<_> = selected
            .iter()
            .cloned()
            .map(|entry| {
                let content = Arc::clone(&self.content);
                let throttle = Arc::clone(&self.throttle);
                let staging = staging.clone();
                move |token: CancellationToken| {
                    restore::restore_file(&content, &throttle, &entry, &staging, &token)
                }
            })
            .collect();
        let mut bytes = 0u64;
        let mut failure = None;
        for result in self.pool.run_all(jobs, &self.pool.job_token()).await {
            match result {
                Ok(written) => bytes += written,
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        let promoted = match failure {
            Some(e) => Err(e),
            None => promote(&staging, target, &relative),
        };
        if let Err(e) = std::fs::remove_dir_all(&staging) {
            warn!(staging = %staging.display(), error = %e, "failed to remove staging directory");
        }
        if let Err(e) = promoted {
            error!(snapshot_id, error = %e, "restore failed");
            return Err(e);
        }

        info!(snapshot_id, files = selected.len(), bytes, target = %target.display(), "snapshot restored");
        Ok(RestoreReport {
            snapshot_id: snapshot_id.to_string(),
            target: target.to_path_buf(),
            files: selected.into_iter().map(|e| e.path).collect(),
            bytes,
        })
    }

    /// Index the files of `snapshot_ids` (every cataloged snapshot if `None`)
    /// by path. Unknown ids are left out with a warning; a manifest that fails
    /// verification is an error.
    pub fn time_machine_index(&self, snapshot_ids: Option<&[String]>) -> StoreResult<TimeMachineIndex> {
        let ids: Vec<String> = match snapshot_ids {
            Some(ids) => ids.to_vec(),
            None => read_lock(&self.catalog).keys().cloned().collect(),
        };
        let mut index = TimeMachineIndex::new();
        for id in &ids {
            if !read_lock(&self.catalog).contains_key(id) {
                warn!(snapshot_id = %id, "snapshot not found; left out of index");
                continue;
            }
            match self.load_verified(id) {
                Ok(manifest) => index.add_manifest(&manifest),
                // Pruned since the catalog check.
                Err(StoreError::SnapshotNotFound(_)) => {
                    warn!(snapshot_id = %id, "snapshot not found; left out of index");
                }
                Err(e) => return Err(e),
            }
        }
        debug!(snapshots = index.snapshots.len(), paths = index.len(), "time machine index built");
        Ok(index)
    }

    /// Build the index and write it to `path` as JSON.
    pub fn write_time_machine_index(
        &self,
        snapshot_ids: Option<&[String]>,
        path: &Path,
    ) -> StoreResult<TimeMachineIndex> {
        let index = self.time_machine_index(snapshot_ids)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        persist::write_atomic(path, &index.to_json()?)?;
        info!(path = %path.display(), snapshots = index.snapshots.len(), paths = index.len(), "time machine index written");
        Ok(index)
    }

    /// Every stored version of `path`, oldest first.
    pub fn file_history(&self, path: &str) -> StoreResult<Vec<FileVersion>> {
        restore::safe_relative(path)?;
        Ok(self.time_machine_index(None)?.history(path).to_vec())
    }

    /// Restore the copy of `path` held by `snapshot_id` to `target_file`.
    ///
    /// The file is staged next to `target_file` and renamed over it once it
    /// has been fully decrypted and authenticated. Returns the bytes written.
    #[instrument(skip(self, target_file))]
    pub async fn restore_file_version(
        &self,
        snapshot_id: &str,
        path: &str,
        target_file: &Path,
    ) -> StoreResult<u64> {
        let manifest = self.load_verified(snapshot_id)?;
        let entry = manifest
            .entries
            .into_iter()
            .find(|e| e.path == path)
            .ok_or_else(|| StoreError::InvalidPath(format!("{path} is not in snapshot {snapshot_id}")))?;
        let relative = restore::safe_relative(&entry.path)?;
        let parent = target_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        std::fs::create_dir_all(&parent)?;
        let staging = restore::staging_dir(&parent, snapshot_id);
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }

        let job = {
            let content = Arc::clone(&self.content);
            let throttle = Arc::clone(&self.throttle);
            let staging = staging.clone();
            move |token: CancellationToken| restore::restore_file(&content, &throttle, &entry, &staging, &token)
        };
        let restored = self
            .pool
            .run_all(vec![job], &self.pool.job_token())
            .await
            .into_iter()
            .next()
            .unwrap_or(Err(StoreError::Cancelled))
            .and_then(|bytes| {
                std::fs::rename(staging.join(&relative), target_file)?;
                Ok(bytes)
            });
        if let Err(e) = std::fs::remove_dir_all(&staging) {
            warn!(staging = %staging.display(), error = %e, "failed to remove staging directory");
        }
        match &restored {
            Ok(bytes) => info!(snapshot_id, path, bytes, target = %target_file.display(), "file version restored"),
            Err(e) => error!(snapshot_id, path, error = %e, "file version restore failed"),
        }
        restored
    }

    /// Apply `policy` (or the configured one) and collect what it drops.
    pub async fn prune(&self, policy: Option<&RetentionPolicy>) -> StoreResult<PruneReport> {
        self.prune_at(policy, Utc::now()).await
    }

    /// [`SnapshotEngine::prune`] with an explicit clock for the chunk sweep.
    #[instrument(skip(self, policy))]
    pub async fn prune_at(
        &self,
        policy: Option<&RetentionPolicy>,
        now: DateTime<Utc>,
    ) -> StoreResult<PruneReport> {
        let _prune = self.prune_lock.lock().await;
        let policy = policy.unwrap_or(&self.config.retention);
        policy.validate()?;

        let candidates: Vec<RetentionCandidate> = read_lock(&self.catalog)
            .values()
            .map(|s| RetentionCandidate {
                id: s.id.clone(),
                created_at: s.created_at,
                pinned: self.pins.is_pinned(&s.id),
            })
            .collect();
        let decision = retention::select(policy, &candidates)?;
        let doomed: Vec<String> = decision
            .delete
            .iter()
            .filter(|id| !self.pins.is_pinned(id))
            .cloned()
            .collect();
        for id in &doomed {
            self.advance(id, SnapshotState::EligibleForPrune);
        }

        let collected = {
            let gc = self.gc.clone();
            let manifests = Arc::clone(&self.manifests);
            let content = Arc::clone(&self.content);
            let doomed = doomed.clone();
            tokio::task::spawn_blocking(move || gc.release_manifests(&manifests, &content, &doomed, now))
                .await
                .map_err(join_error)?
        };
        for id in &collected.deleted {
            write_lock(&self.catalog).remove(id);
            self.advance(id, SnapshotState::Deleted);
            self.audit
                .record(AuditOperation::ManifestDelete, id, true, "retention");
        }
        for (id, reason) in &collected.failed {
            self.advance(id, SnapshotState::Active);
            self.audit
                .record(AuditOperation::ManifestDelete, id, false, reason.clone());
        }

        let sweep = match self.gc_sweep(now).await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "chunk sweep skipped");
                None
            }
        };
        let purged_keys = if self.config.gc.purge_unreferenced_keys {
            self.purge_unreferenced_keys()?
        } else {
            Vec::new()
        };

        info!(
            candidates = candidates.len(),
            deleted = collected.deleted.len(),
            failed = collected.failed.len(),
            refs_released = collected.refs_released,
            purged_chunks = sweep.as_ref().map_or(0, |s| s.purged.len()),
            purged_keys = purged_keys.len(),
            "prune complete"
        );
        Ok(PruneReport {
            deleted: collected.deleted,
            kept: decision.keep,
            failed: collected.failed,
            refs_released: collected.refs_released,
            sweep,
            purged_keys,
        })
    }

    /// Physically remove chunks unreferenced for longer than the grace period.
    ///
    /// Refused while any manifest is quarantined, since its references are unknown.
    pub async fn gc_sweep(&self, now: DateTime<Utc>) -> StoreResult<SweepReport> {
        let quarantined = read_lock(&self.quarantined).len();
        if quarantined > 0 {
            return Err(StoreError::IntegrityError(format!(
                "{quarantined} unreadable manifests; refusing to sweep"
            )));
        }
        let gc = self.gc.clone();
        let content = Arc::clone(&self.content);
        tokio::task::spawn_blocking(move || gc.sweep(&content, now))
            .await
            .map_err(join_error)
    }

    /// Replace the active key for `role`.
    pub fn rotate_key(&self, role: KeyRole) -> StoreResult<KeyId> {
        self.keys.rotate_key(role)
    }

    /// Rotate every role whose active key is older than `keys.max_age_days`.
    pub fn rotate_due_keys(&self) -> StoreResult<Vec<KeyId>> {
        self.rotate_due_keys_at(Utc::now())
    }

    /// [`SnapshotEngine::rotate_due_keys`] against an explicit clock.
    pub fn rotate_due_keys_at(&self, now: DateTime<Utc>) -> StoreResult<Vec<KeyId>> {
        let max_age = Duration::days(i64::from(self.config.keys.max_age_days));
        self.keys
            .rotation_due(max_age, now)
            .into_iter()
            .map(|role| self.keys.rotate_key(role))
            .collect()
    }

    /// Retire a key. Retiring the active key rotates its role.
    pub fn retire_key(&self, key_id: &KeyId) -> StoreResult<()> {
        self.keys.retire_key(key_id)
    }

    /// Destroy a retired key that nothing references.
    pub fn purge_key(&self, key_id: &KeyId) -> StoreResult<()> {
        self.keys.purge_key(key_id, self)
    }

    /// Purge every retired key with no remaining references.
    pub fn purge_unreferenced_keys(&self) -> StoreResult<Vec<KeyId>> {
        let mut purged = Vec::new();
        for id in self.gc.eligible_keys(&self.keys, self)? {
            match self.purge_key(&id) {
                Ok(()) => purged.push(id),
                Err(e) => warn!(key_id = %id, error = %e, "key purge skipped"),
            }
        }
        Ok(purged)
    }

    /// Exempt a snapshot from pruning. Returns false if it was already pinned.
    pub fn pin_snapshot(&self, snapshot_id: &str) -> StoreResult<bool> {
        self.require_known(snapshot_id)?;
        let result = self.pins.pin(snapshot_id);
        self.audit_pin(AuditOperation::SnapshotPin, snapshot_id, &result);
        result
    }

    /// Remove a pin. Returns false if the snapshot was not pinned.
    pub fn unpin_snapshot(&self, snapshot_id: &str) -> StoreResult<bool> {
        self.require_known(snapshot_id)?;
        let result = self.pins.unpin(snapshot_id);
        self.audit_pin(AuditOperation::SnapshotUnpin, snapshot_id, &result);
        result
    }

    fn require_known(&self, snapshot_id: &str) -> StoreResult<()> {
        manifest::validate_id(snapshot_id)?;
        if read_lock(&self.catalog).contains_key(snapshot_id) {
            Ok(())
        } else {
            Err(StoreError::SnapshotNotFound(snapshot_id.to_string()))
        }
    }

    fn audit_pin(&self, op: AuditOperation, snapshot_id: &str, result: &StoreResult<bool>) {
        match result {
            Ok(changed) => self
                .audit
                .record(op, snapshot_id, true, if *changed { "changed" } else { "unchanged" }),
            Err(e) => self.audit.record(op, snapshot_id, false, e.to_string()),
        };
    }

    /// Every persisted snapshot, newest first.
    pub fn list_snapshots(&self) -> Vec<SnapshotSummary> {
        let mut all: Vec<SnapshotSummary> = read_lock(&self.catalog)
            .values()
            .cloned()
            .map(|mut s| {
                s.pinned = self.pins.is_pinned(&s.id);
                s
            })
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        all
    }

    /// One snapshot's catalog entry.
    pub fn snapshot(&self, snapshot_id: &str) -> Option<SnapshotSummary> {
        let mut summary = read_lock(&self.catalog).get(snapshot_id).cloned()?;
        summary.pinned = self.pins.is_pinned(snapshot_id);
        Some(summary)
    }

    /// Lifecycle state of a snapshot seen by this process.
    pub fn snapshot_state(&self, snapshot_id: &str) -> Option<SnapshotState> {
        self.lifecycle.state(snapshot_id)
    }

    /// Manifests that could not be parsed at open.
    pub fn quarantined(&self) -> Vec<String> {
        read_lock(&self.quarantined).iter().cloned().collect()
    }

    /// Chunk index counters.
    pub fn content_stats(&self) -> ContentStoreStats {
        self.content.stats()
    }

    /// Cancel outstanding jobs and wait for running ones.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        info!("snapshot engine shut down");
    }
}

impl KeyReferences for SnapshotEngine {
    fn key_references(&self, key_id: &KeyId) -> StoreResult<usize> {
        let signed = read_lock(&self.catalog)
            .values()
            .filter(|s| &s.signing_key_id == key_id)
            .count();
        // Quarantined manifests may cite any key.
        let unknown = read_lock(&self.quarantined).len();
        Ok(self.content.chunks_with_key(key_id) + signed + unknown)
    }
}

fn promote(staging: &Path, target: &Path, relative: &[PathBuf]) -> StoreResult<()> {
    for rel in relative {
        let dest = target.join(rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(staging.join(rel), &dest)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::crypto::MIN_KDF_ITERATIONS;
    use crate::fingerprint::blake3_hash;
    use crate::source::MemorySource;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> StoreConfig {
        let mut config = StoreConfig::with_root(dir.path().join("store"));
        config.crypto.kdf_iterations = MIN_KDF_ITERATIONS;
        config.workers = 2;
        config
    }

    fn engine(dir: &TempDir) -> SnapshotEngine {
        SnapshotEngine::open_with_backend(
            config(dir),
            b"test passphrase",
            Arc::new(MemoryBackend::new()),
            None,
        )
        .unwrap()
    }

    fn files(pairs: &[(&str, &str)]) -> Vec<SourceEntry> {
        pairs
            .iter()
            .map(|(p, d)| SourceEntry::memory(*p, d.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn test_snapshot_id_shape() {
        let at = DateTime::parse_from_rfc3339("2024-03-05T06:07:08.009Z")
            .unwrap()
            .with_timezone(&Utc);
        let id = new_snapshot_id(at);
        assert!(id.starts_with("snap_20240305T060708009_"), "{id}");
        assert_eq!(id.len(), "snap_20240305T060708009_".len() + 8);
        manifest::validate_id(&id).unwrap();
    }

    #[test]
    fn test_check_entries_rejects_escape_and_duplicates() {
        assert!(check_entries(&files(&[("a", "1"), ("b/c", "2")])).is_ok());
        assert!(matches!(
            check_entries(&files(&[("../a", "1")])),
            Err(StoreError::InvalidPath(_))
        ));
        assert!(matches!(
            check_entries(&files(&[("a", "1"), ("a", "2")])),
            Err(StoreError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_same_content_twice_counts_two_refs() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let created = engine
            .create_snapshot_from_entries("vol", vec![], files(&[("a", "hello"), ("b", "hello")]), Utc::now())
            .await
            .unwrap();
        assert_eq!(created.stats.files, 2);
        assert_eq!(created.stats.new_chunks, 1);
        assert_eq!(created.stats.dedup_hits, 1);
        assert_eq!(engine.content().refcount(&blake3_hash(b"hello")), Some(2));
        assert_eq!(
            engine.snapshot_state(&created.snapshot_id),
            Some(SnapshotState::Active)
        );
    }

    #[tokio::test]
    async fn test_cancelled_ingest_leaves_no_refs() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let token = engine.cancellation_token();
        token.cancel();
        let err = engine
            .create_snapshot_cancellable("vol", vec![], files(&[("a", "data")]), Utc::now(), token)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
        assert!(engine.list_snapshots().is_empty());
        assert_eq!(engine.content_stats().references, 0);
    }

    #[tokio::test]
    async fn test_unreadable_file_skipped_when_configured() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.ingest.skip_unreadable = true;
        let engine =
            SnapshotEngine::open_with_backend(cfg, b"pw", Arc::new(MemoryBackend::new()), None).unwrap();
        let mut entries = files(&[("ok", "fine")]);
        entries.push(SourceEntry {
            path: "gone".to_string(),
            size: 3,
            content: crate::source::SourceContent::File(dir.path().join("does-not-exist")),
        });
        let created = engine
            .create_snapshot_from_entries("vol", vec![], entries, Utc::now())
            .await
            .unwrap();
        assert_eq!(created.stats.files, 1);
        assert_eq!(created.stats.skipped, vec!["gone".to_string()]);
    }

    #[tokio::test]
    async fn test_unreadable_file_aborts_by_default() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let mut entries = files(&[("ok", "fine")]);
        entries.push(SourceEntry {
            path: "gone".to_string(),
            size: 3,
            content: crate::source::SourceContent::File(dir.path().join("does-not-exist")),
        });
        assert!(engine
            .create_snapshot_from_entries("vol", vec![], entries, Utc::now())
            .await
            .is_err());
        assert_eq!(engine.content_stats().references, 0);
    }

    #[tokio::test]
    async fn test_create_without_source() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        assert!(matches!(
            engine.create_snapshot("vol", vec![]).await,
            Err(StoreError::Source(_))
        ));
    }

    #[tokio::test]
    async fn test_create_through_memory_source() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(MemorySource::new());
        source.put("vol", "x.txt", "x");
        let engine = SnapshotEngine::open_with_backend(
            config(&dir),
            b"pw",
            Arc::new(MemoryBackend::new()),
            Some(source.clone()),
        )
        .unwrap();
        let id = engine.create_snapshot("vol", vec!["nightly".into()]).await.unwrap();
        let summary = engine.snapshot(&id).unwrap();
        assert_eq!(summary.files, 1);
        assert_eq!(summary.tags, vec!["nightly".to_string()]);
        assert!(source.list().unwrap().is_empty());
    }

    #[cfg(unix)]
    fn tree_with_bad_name() -> TempDir {
        use std::os::unix::ffi::OsStrExt;
        let src = TempDir::new().unwrap();
        std::fs::write(src.path().join("ok.txt"), b"ok").unwrap();
        std::fs::write(src.path().join(std::ffi::OsStr::from_bytes(b"bad\xff")), b"bad").unwrap();
        src
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_utf8_name_aborts_and_drops_tree_by_default() {
        let dir = TempDir::new().unwrap();
        let src = tree_with_bad_name();
        let source = Arc::new(crate::source::OverlaySource::new(dir.path().join("trees")));
        let engine = SnapshotEngine::open_with_backend(
            config(&dir),
            b"pw",
            Arc::new(MemoryBackend::new()),
            Some(source.clone()),
        )
        .unwrap();
        let err = engine
            .create_snapshot(src.path().to_str().unwrap(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidPath(_)));
        assert!(engine.list_snapshots().is_empty());
        assert!(source.list().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_utf8_name_skipped_when_configured() {
        let dir = TempDir::new().unwrap();
        let src = tree_with_bad_name();
        let mut cfg = config(&dir);
        cfg.ingest.skip_unreadable = true;
        let source = Arc::new(crate::source::OverlaySource::new(dir.path().join("trees")));
        let engine = SnapshotEngine::open_with_backend(
            cfg,
            b"pw",
            Arc::new(MemoryBackend::new()),
            Some(source.clone()),
        )
        .unwrap();
        let id = engine
            .create_snapshot(src.path().to_str().unwrap(), vec![])
            .await
            .unwrap();
        assert_eq!(engine.snapshot(&id).unwrap().files, 1);
        assert!(source.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pin_unknown_snapshot() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        assert!(matches!(
            engine.pin_snapshot("snap_missing"),
            Err(StoreError::SnapshotNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_key_references_count_chunks_and_manifests() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        engine
            .create_snapshot_from_entries("vol", vec![], files(&[("a", "1"), ("b", "2")]), Utc::now())
            .await
            .unwrap();
        let enc = engine.keys().get_active_key(KeyRole::Encryption).unwrap().id().clone();
        let sig = engine.keys().get_active_key(KeyRole::Signing).unwrap().id().clone();
        assert_eq!(engine.key_references(&enc).unwrap(), 2);
        assert_eq!(engine.key_references(&sig).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_signing_key_leased_by_commit_survives_rotation_and_purge() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let lease = engine.keys().lease_active(KeyRole::Signing).unwrap();
        let old = lease.key().id().clone();

        // Rotation and purge land between signing and cataloging.
        engine.rotate_key(KeyRole::Signing).unwrap();
        assert!(engine.purge_unreferenced_keys().unwrap().is_empty());
        assert!(matches!(engine.purge_key(&old), Err(StoreError::KeyInUse { .. })));

        let created_at = Utc::now();
        let id = new_snapshot_id(created_at);
        engine.lifecycle.begin(&id).unwrap();
        engine.lifecycle.transition(&id, SnapshotState::Ingesting).unwrap();
        let draft = ManifestDraft {
            snapshot_id: id.clone(),
            subvolume: "vol".to_string(),
            created_at,
            tags: vec![],
            entries: vec![],
        };
        let manifest = engine.commit_manifest(draft, &lease).unwrap();
        drop(lease);
        assert_eq!(manifest.signing_key_id, old);

        assert!(engine.verify_snapshot(&id).await.unwrap().is_ok());
        assert!(matches!(engine.purge_key(&old), Err(StoreError::KeyInUse { .. })));
        assert_eq!(engine.snapshot(&id).unwrap().signing_key_id, old);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        engine.shutdown().await;
        assert!(matches!(
            engine
                .create_snapshot_from_entries("vol", vec![], files(&[("a", "1")]), Utc::now())
                .await,
            Err(StoreError::Cancelled)
        ));
    }
}
