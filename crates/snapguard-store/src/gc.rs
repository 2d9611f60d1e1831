//! Garbage collection: dereference deleted manifests, then reclaim chunks
//! and keys nothing references any more.
//!
//! Refcount decrements are the only trigger for chunk reclamation; age alone
//! never deletes anything.

use crate::content_store::{ContentStore, SweepReport};
use crate::error::StoreResult;
use crate::key_manager::{KeyId, KeyManager, KeyReferences};
use crate::manifest::ManifestStore;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info};

/// Outcome of one GC cycle.
#[derive(Debug, Clone, Default)]
pub struct GcReport {
    /// Manifests removed and dereferenced
    pub deleted: Vec<String>,
    /// Manifests that could not be processed, with the reason
    pub failed: Vec<(String, String)>,
    /// Chunk references dropped
    pub refs_released: u64,
    /// Chunk sweep result
    pub sweep: SweepReport,
}

/// Reclaims manifests, chunks and keys.
#[derive(Debug, Clone)]
pub struct GarbageCollector {
    grace: Duration,
}

impl GarbageCollector {
    /// Collector with the given chunk grace period.
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Grace period applied by [`GarbageCollector::sweep`].
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Delete each manifest in `doomed` and drop its chunk references.
    ///
    /// The manifest record is removed before its references are released, so
    /// the store never holds a manifest whose chunks may be gone. A failure is
    /// fatal only to that manifest; the rest are still processed.
    pub fn release_manifests(
        &self,
        manifests: &ManifestStore,
        content: &ContentStore,
        doomed: &[String],
        now: DateTime<Utc>,
    ) -> GcReport {
        let mut report = GcReport::default();
        for id in doomed {
            match self.release_one(manifests, content, id, now) {
                Ok(released) => {
                    report.refs_released += released;
                    report.deleted.push(id.clone());
                }
                Err(e) => {
                    error!(snapshot_id = %id, error = %e, "failed to collect manifest; continuing");
                    report.failed.push((id.clone(), e.to_string()));
                }
            }
        }
        report
    }

    fn release_one(
        &self,
        manifests: &ManifestStore,
        content: &ContentStore,
        id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let manifest = manifests.load(id)?;
        manifests.delete(id)?;
        let refs: Vec<_> = manifest.chunk_refs().copied().collect();
        let failed = content.release_all(&refs, now);
        debug!(snapshot_id = %id, refs = refs.len(), failed, "manifest dereferenced");
        Ok((refs.len() - failed) as u64)
    }

    /// Physically remove chunks unreferenced for longer than the grace period.
    pub fn sweep(&self, content: &ContentStore, now: DateTime<Utc>) -> SweepReport {
        content.sweep(now, self.grace)
    }

    /// Retired keys with no remaining chunk or manifest reference.
    pub fn eligible_keys(&self, keys: &KeyManager, refs: &dyn KeyReferences) -> StoreResult<Vec<KeyId>> {
        let mut eligible = Vec::new();
        for id in keys.retired_keys() {
            if refs.key_references(&id)? == 0 {
                eligible.push(id);
            }
        }
        if !eligible.is_empty() {
            info!(count = eligible.len(), "keys eligible for purge");
        }
        Ok(eligible)
    }
}
