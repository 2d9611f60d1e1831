//! Content-addressed, deduplicated store of encrypted chunks.
//!
//! The index maps a plaintext hash to a shared entry holding an atomic
//! refcount. Lookup-and-insert is atomic per hash through the index's
//! per-shard entry API; refcount updates are compare-and-swap loops bounded
//! by a retry budget. A chunk is encrypted once, on first sight, and only
//! referenced afterwards.
//!
//! Physical deletion follows tombstone, then file removal, then index
//! removal, so an ingester racing with GC either revives the chunk before the
//! tombstone lands or starts a fresh copy after it.

use crate::backend::ChunkBackend;
use crate::chunker::{Chunk, Chunker};
use crate::crypto::{self, Algorithm, Sealed};
use crate::error::{StoreError, StoreResult};
use crate::fingerprint::{blake3_hash, ChunkHash};
use crate::key_manager::{KeyHandle, KeyId, KeyManager, KeyRole};
use crate::throttle::{Direction, IoThrottle};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const TOMBSTONE: u64 = u64::MAX;
const NOT_RELEASED: i64 = i64::MIN;

/// On-disk chunk record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredChunk {
    /// Plaintext hash; also the AEAD associated data.
    pub hash: ChunkHash,
    /// Plaintext size
    pub size: u64,
    /// Key that sealed this chunk
    pub key_id: KeyId,
    /// Cipher used
    pub algorithm: Algorithm,
    /// Ciphertext, nonce and tag
    pub sealed: Sealed,
}

/// What the index knows about a stored chunk.
#[derive(Debug, Clone)]
pub struct ChunkMeta {
    /// Plaintext size
    pub size: u64,
    /// Size of the stored record
    pub stored_size: u64,
    /// Key that sealed this chunk
    pub key_id: KeyId,
}

struct IndexEntry {
    refcount: AtomicU64,
    released_at_ms: AtomicI64,
    /// `None` while the creating writer is still storing the chunk, or
    /// forever if it failed.
    meta: Mutex<Option<ChunkMeta>>,
}

impl IndexEntry {
    fn new(refcount: u64, meta: Option<ChunkMeta>) -> Self {
        Self {
            refcount: AtomicU64::new(refcount),
            released_at_ms: AtomicI64::new(NOT_RELEASED),
            meta: Mutex::new(meta),
        }
    }

    /// Increment unless tombstoned.
    fn try_acquire(&self) -> bool {
        self.refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n != TOMBSTONE).then_some(n + 1)
            })
            .is_ok()
    }

    fn meta(&self) -> Option<ChunkMeta> {
        self.meta.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Result of storing one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOutcome {
    /// Content hash
    pub hash: ChunkHash,
    /// True if this call encrypted and wrote the chunk.
    pub new: bool,
    /// Bytes written to the backend (0 on a dedup hit).
    pub stored_bytes: u64,
}

/// One ingested file.
#[derive(Debug, Clone)]
pub struct IngestedFile {
    /// Path relative to the snapshot root
    pub path: String,
    /// Bytes read
    pub size: u64,
    /// Chunk hashes in file order
    pub chunks: Vec<ChunkHash>,
    /// Chunks written by this file
    pub new_chunks: u64,
    /// Chunks that were already stored
    pub dedup_hits: u64,
    /// Bytes written to the backend
    pub stored_bytes: u64,
}

/// Result of a GC sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Zero-refcount entries looked at
    pub examined: usize,
    /// Entries still inside the grace period
    pub deferred: usize,
    /// Hashes physically removed
    pub purged: Vec<ChunkHash>,
    /// Stored bytes freed
    pub bytes_reclaimed: u64,
    /// Removals that failed and were left for the next pass
    pub errors: usize,
}

/// Result of rebuilding the index at open.
#[derive(Debug, Clone, Default)]
pub struct RebuildReport {
    /// Chunk records found
    pub chunks: usize,
    /// Records no manifest references
    pub unreferenced: usize,
    /// Hashes referenced by manifests but absent from the backend
    pub missing: Vec<ChunkHash>,
}

/// Store-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentStoreStats {
    /// Distinct chunks stored
    pub chunks: usize,
    /// Chunks with refcount zero awaiting GC
    pub unreferenced: usize,
    /// Sum of all refcounts
    pub references: u64,
    /// Plaintext bytes of distinct chunks
    pub unique_bytes: u64,
    /// Plaintext bytes counted once per reference
    pub logical_bytes: u64,
    /// Bytes held by the backend
    pub stored_bytes: u64,
    /// Dedup hits since open
    pub dedup_hits: u64,
    /// Chunks written since open
    pub new_chunks: u64,
}

impl ContentStoreStats {
    /// Logical bytes not stored thanks to deduplication.
    pub fn bytes_saved(&self) -> u64 {
        self.logical_bytes.saturating_sub(self.unique_bytes)
    }
}

/// Source reader that charges the read budget and stops on cancellation.
/// The store error behind a failed read is kept in `stopped`.
struct ThrottledReader<'a, R> {
    inner: R,
    throttle: &'a IoThrottle,
    cancel: &'a CancellationToken,
    stopped: Option<StoreError>,
}

impl<R> ThrottledReader<'_, R> {
    fn stop(&mut self, e: StoreError) -> io::Result<usize> {
        let message = e.to_string();
        self.stopped = Some(e);
        Err(io::Error::other(message))
    }
}

impl<R: Read> Read for ThrottledReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return self.stop(StoreError::Cancelled);
        }
        let n = self.inner.read(buf)?;
        if let Err(e) = self.throttle.acquire(Direction::Read, n as u64) {
            return self.stop(e);
        }
        Ok(n)
    }
}

/// Deduplicated chunk repository.
pub struct ContentStore {
    backend: Arc<dyn ChunkBackend>,
    index: DashMap<ChunkHash, Arc<IndexEntry>>,
    keys: Arc<KeyManager>,
    throttle: Arc<IoThrottle>,
    retry_budget: u32,
    dedup_hits: AtomicU64,
    new_chunks: AtomicU64,
}

impl ContentStore {
    /// Empty index over `backend`. Call [`ContentStore::rebuild`] to load
    /// existing chunks.
    pub fn new(
        backend: Arc<dyn ChunkBackend>,
        keys: Arc<KeyManager>,
        throttle: Arc<IoThrottle>,
        retry_budget: u32,
    ) -> Self {
        Self {
            backend,
            index: DashMap::new(),
            keys,
            throttle,
            retry_budget: retry_budget.max(1),
            dedup_hits: AtomicU64::new(0),
            new_chunks: AtomicU64::new(0),
        }
    }

    /// Load every stored chunk into the index with refcounts taken from
    /// `references` (one item per manifest occurrence). Chunks nobody
    /// references start their grace period at `now`.
    pub fn rebuild<'a>(
        &self,
        references: impl IntoIterator<Item = &'a ChunkHash>,
        now: DateTime<Utc>,
    ) -> StoreResult<RebuildReport> {
        let mut counts: HashMap<ChunkHash, u64> = HashMap::new();
        for hash in references {
            *counts.entry(*hash).or_insert(0) += 1;
        }

        let mut report = RebuildReport::default();
        for hash in self.backend.list()? {
            let Some(bytes) = self.backend.get(&hash)? else {
                continue;
            };
            let stored: StoredChunk = match bincode::deserialize(&bytes) {
                Ok(s) => s,
                Err(e) => {
                    // Left in place; reads of it fail with IntegrityError.
                    error!(hash = %hash, error = %e, "unreadable chunk record");
                    continue;
                }
            };
            let refs = counts.remove(&hash).unwrap_or(0);
            let entry = IndexEntry::new(
                refs,
                Some(ChunkMeta {
                    size: stored.size,
                    stored_size: bytes.len() as u64,
                    key_id: stored.key_id,
                }),
            );
            if refs == 0 {
                entry.released_at_ms.store(now.timestamp_millis(), Ordering::Release);
                report.unreferenced += 1;
            }
            self.index.insert(hash, Arc::new(entry));
            report.chunks += 1;
        }
        report.missing = counts.into_keys().collect();
        for hash in &report.missing {
            error!(hash = %hash, "manifest references a chunk missing from the backend");
        }
        info!(
            chunks = report.chunks,
            unreferenced = report.unreferenced,
            missing = report.missing.len(),
            "content index rebuilt"
        );
        Ok(report)
    }

    /// Store one chunk or take another reference to an existing copy.
    pub fn store_chunk(&self, chunk: &Chunk) -> StoreResult<StoreOutcome> {
        let hash = chunk.hash;
        for _ in 0..self.retry_budget {
            match self.index.entry(hash) {
                Entry::Occupied(occupied) => {
                    let entry = occupied.get().clone();
                    drop(occupied);
                    if !entry.try_acquire() {
                        // Being purged; wait for it to leave the index.
                        std::thread::yield_now();
                        continue;
                    }
                    // Blocks until a concurrent creator has finished.
                    if entry.meta().is_some() {
                        self.dedup_hits.fetch_add(1, Ordering::Relaxed);
                        debug!(hash = %hash, "dedup hit");
                        return Ok(StoreOutcome {
                            hash,
                            new: false,
                            stored_bytes: 0,
                        });
                    }
                    // The creator failed.
                    entry.refcount.fetch_sub(1, Ordering::AcqRel);
                }
                Entry::Vacant(vacant) => {
                    let entry = Arc::new(IndexEntry::new(1, None));
                    let mut meta = entry.meta.lock().unwrap_or_else(|e| e.into_inner());
                    vacant.insert(entry.clone());
                    // The lease outlives the write until `meta` names the key.
                    let written = self
                        .keys
                        .lease_active(KeyRole::Encryption)
                        .and_then(|lease| Ok((self.write_new(chunk, lease.key())?, lease)));
                    return match written {
                        Ok((written, _lease)) => {
                            let stored_bytes = written.stored_size;
                            *meta = Some(written);
                            self.new_chunks.fetch_add(1, Ordering::Relaxed);
                            Ok(StoreOutcome {
                                hash,
                                new: true,
                                stored_bytes,
                            })
                        }
                        Err(e) => {
                            entry.refcount.store(TOMBSTONE, Ordering::Release);
                            self.index.remove_if(&hash, |_, v| Arc::ptr_eq(v, &entry));
                            Err(e)
                        }
                    };
                }
            }
        }
        Err(StoreError::ConcurrentModification {
            hash: hash.to_hex(),
            attempts: self.retry_budget,
        })
    }

    fn write_new(&self, chunk: &Chunk, key: &KeyHandle) -> StoreResult<ChunkMeta> {
        let sealed = crypto::encrypt_with_aad(
            &chunk.data,
            chunk.hash.as_bytes(),
            key.material(),
            key.algorithm(),
        )?;
        let record = StoredChunk {
            hash: chunk.hash,
            size: chunk.data.len() as u64,
            key_id: key.id().clone(),
            algorithm: key.algorithm(),
            sealed,
        };
        let bytes = bincode::serialize(&record)?;
        self.throttle.acquire(Direction::Write, bytes.len() as u64)?;
        self.backend.put(&chunk.hash, &bytes)?;
        debug!(hash = %chunk.hash, key_id = %record.key_id, bytes = bytes.len(), "stored new chunk");
        Ok(ChunkMeta {
            size: record.size,
            stored_size: bytes.len() as u64,
            key_id: record.key_id,
        })
    }

    /// Drop one reference. A chunk reaching zero starts its grace period at `now`.
    pub fn release(&self, hash: &ChunkHash, now: DateTime<Utc>) -> StoreResult<u64> {
        let entry = self
            .index
            .get(hash)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::ChunkMissing { hash: hash.to_hex() })?;

        for _ in 0..self.retry_budget {
            let current = entry.refcount.load(Ordering::Acquire);
            if current == 0 || current == TOMBSTONE {
                return Err(StoreError::RefcountUnderflow { hash: hash.to_hex() });
            }
            if current == 1 {
                // Published before the count can reach zero, so a sweep never
                // pairs a zero count with an older release time.
                entry.released_at_ms.store(now.timestamp_millis(), Ordering::Release);
            }
            if entry
                .refcount
                .compare_exchange_weak(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if current == 1 {
                    debug!(hash = %hash, "chunk unreferenced");
                }
                return Ok(current - 1);
            }
        }
        Err(StoreError::ConcurrentModification {
            hash: hash.to_hex(),
            attempts: self.retry_budget,
        })
    }

    /// Release every hash, logging failures. Used to undo partial work.
    pub fn release_all(&self, hashes: &[ChunkHash], now: DateTime<Utc>) -> usize {
        let mut failed = 0;
        for hash in hashes {
            if let Err(e) = self.release(hash, now) {
                error!(hash = %hash, error = %e, "failed to release chunk reference");
                failed += 1;
            }
        }
        failed
    }

    /// Decrypt and authenticate a chunk, using whichever key sealed it.
    pub fn read_chunk(&self, hash: &ChunkHash) -> StoreResult<Bytes> {
        let bytes = self
            .backend
            .get(hash)?
            .ok_or_else(|| StoreError::ChunkMissing { hash: hash.to_hex() })?;
        self.throttle.acquire(Direction::Read, bytes.len() as u64)?;
        let stored: StoredChunk = bincode::deserialize(&bytes)
            .map_err(|e| StoreError::IntegrityError(format!("chunk {hash} record unreadable: {e}")))?;
        if stored.hash != *hash {
            return Err(StoreError::IntegrityError(format!(
                "chunk {hash} record claims hash {}",
                stored.hash
            )));
        }
        let key = self.keys.get_key(&stored.key_id)?;
        let plain = crypto::decrypt_with_aad(&stored.sealed, hash.as_bytes(), key.material(), stored.algorithm)?;
        if blake3_hash(&plain) != *hash || plain.len() as u64 != stored.size {
            return Err(StoreError::IntegrityError(format!("chunk {hash} content does not match its hash")));
        }
        Ok(Bytes::from(plain))
    }

    /// Stream one file's content through the chunker into the store.
    ///
    /// Only the chunk being stored is held in memory, except in whole-file
    /// mode where the file is the chunk. Cancellation is checked on every
    /// read and between chunks. On any failure the references this file
    /// already took are released before the error is returned.
    pub fn ingest_file(
        &self,
        chunker: &Chunker,
        path: &str,
        content: &mut dyn Read,
        cancel: &CancellationToken,
    ) -> StoreResult<IngestedFile> {
        let mut file = IngestedFile {
            path: path.to_string(),
            size: 0,
            chunks: Vec::new(),
            new_chunks: 0,
            dedup_hits: 0,
            stored_bytes: 0,
        };
        let mut reader = ThrottledReader {
            inner: content,
            throttle: &self.throttle,
            cancel,
            stopped: None,
        };
        if let Err(e) = self.store_stream(chunker, &mut reader, &mut file, cancel) {
            let e = reader.stopped.take().unwrap_or(e);
            warn!(path, error = %e, taken = file.chunks.len(), "rolling back partial file");
            self.release_all(&file.chunks, Utc::now());
            return Err(e);
        }
        debug!(
            path,
            size = file.size,
            chunks = file.chunks.len(),
            new = file.new_chunks,
            "ingested file"
        );
        Ok(file)
    }

    fn store_stream(
        &self,
        chunker: &Chunker,
        reader: &mut dyn Read,
        file: &mut IngestedFile,
        cancel: &CancellationToken,
    ) -> StoreResult<()> {
        for next in chunker.chunk_stream(reader) {
            let chunk = next?;
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            let outcome = self.store_chunk(&chunk)?;
            file.size += chunk.data.len() as u64;
            file.chunks.push(outcome.hash);
            if outcome.new {
                file.new_chunks += 1;
            } else {
                file.dedup_hits += 1;
            }
            file.stored_bytes += outcome.stored_bytes;
        }
        Ok(())
    }

    /// Physically remove chunks that have been unreferenced for at least `grace`.
    pub fn sweep(&self, now: DateTime<Utc>, grace: Duration) -> SweepReport {
        let mut report = SweepReport::default();
        let cutoff_ms = (now - grace).timestamp_millis();
        let candidates: Vec<(ChunkHash, Arc<IndexEntry>)> = self
            .index
            .iter()
            .filter(|e| e.value().refcount.load(Ordering::Acquire) == 0)
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        for (hash, entry) in candidates {
            report.examined += 1;
            let released = entry.released_at_ms.load(Ordering::Acquire);
            if released == NOT_RELEASED || released > cutoff_ms {
                report.deferred += 1;
                continue;
            }
            if entry
                .refcount
                .compare_exchange(0, TOMBSTONE, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Revived by a concurrent ingestion.
                continue;
            }
            // Revived and released again since the first look.
            if entry.released_at_ms.load(Ordering::Acquire) > cutoff_ms {
                entry.refcount.store(0, Ordering::Release);
                report.deferred += 1;
                continue;
            }
            match self.backend.delete(&hash) {
                Ok(_) => {
                    self.index.remove_if(&hash, |_, v| Arc::ptr_eq(v, &entry));
                    report.bytes_reclaimed += entry.meta().map(|m| m.stored_size).unwrap_or(0);
                    report.purged.push(hash);
                }
                Err(e) => {
                    entry.refcount.store(0, Ordering::Release);
                    error!(hash = %hash, error = %e, "failed to delete chunk; will retry next sweep");
                    report.errors += 1;
                }
            }
        }
        if !report.purged.is_empty() || report.errors > 0 {
            info!(
                purged = report.purged.len(),
                deferred = report.deferred,
                bytes = report.bytes_reclaimed,
                errors = report.errors,
                "chunk sweep"
            );
        }
        report
    }

    /// Current refcount, or `None` if the chunk is not indexed.
    pub fn refcount(&self, hash: &ChunkHash) -> Option<u64> {
        self.index
            .get(hash)
            .map(|e| e.refcount.load(Ordering::Acquire))
            .filter(|&n| n != TOMBSTONE)
    }

    /// True if the chunk is indexed and fully stored.
    pub fn contains(&self, hash: &ChunkHash) -> bool {
        self.index
            .get(hash)
            .map(|e| e.value().clone())
            .is_some_and(|e| e.refcount.load(Ordering::Acquire) != TOMBSTONE && e.meta().is_some())
    }

    /// Key that sealed a chunk.
    pub fn chunk_key(&self, hash: &ChunkHash) -> Option<KeyId> {
        let entry = self.index.get(hash).map(|e| e.value().clone())?;
        entry.meta().map(|m| m.key_id)
    }

    /// Indexed chunks sealed by `key_id`, including ones waiting out their grace period.
    pub fn chunks_with_key(&self, key_id: &KeyId) -> usize {
        let entries: Vec<Arc<IndexEntry>> = self.index.iter().map(|e| e.value().clone()).collect();
        entries
            .iter()
            .filter(|e| e.refcount.load(Ordering::Acquire) != TOMBSTONE)
            .filter(|e| e.meta().is_some_and(|m| &m.key_id == key_id))
            .count()
    }

    /// Aggregate counters.
    pub fn stats(&self) -> ContentStoreStats {
        let entries: Vec<Arc<IndexEntry>> = self.index.iter().map(|e| e.value().clone()).collect();
        let mut stats = ContentStoreStats {
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
            new_chunks: self.new_chunks.load(Ordering::Relaxed),
            ..Default::default()
        };
        for entry in entries {
            let refs = entry.refcount.load(Ordering::Acquire);
            let Some(meta) = entry.meta() else { continue };
            if refs == TOMBSTONE {
                continue;
            }
            stats.chunks += 1;
            if refs == 0 {
                stats.unreferenced += 1;
            }
            stats.references += refs;
            stats.unique_bytes += meta.size;
            stats.logical_bytes += meta.size * refs;
            stats.stored_bytes += meta.stored_size;
        }
        stats
    }
}
