//! Per-snapshot lifecycle state machine and the pin registry.

use crate::error::{StoreError, StoreResult};
use crate::persist;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock, RwLockWriteGuard};
use tracing::{debug, warn};

/// Where a snapshot is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    /// Accepted, nothing read yet.
    Pending,
    /// Chunks are being stored.
    Ingesting,
    /// Signed manifest persisted.
    Manifested,
    /// Visible to restore and retention.
    Active,
    /// Selected for deletion by a retention pass.
    EligibleForPrune,
    /// Manifest removed. Terminal.
    Deleted,
    /// Ingestion failed or was cancelled before a manifest existed. Terminal.
    Aborted,
}

impl SnapshotState {
    /// True if the machine allows `self -> next`.
    pub fn can_transition_to(self, next: SnapshotState) -> bool {
        use SnapshotState::*;
        matches!(
            (self, next),
            (Pending, Ingesting)
                | (Pending, Aborted)
                | (Ingesting, Manifested)
                | (Ingesting, Aborted)
                | (Manifested, Active)
                | (Active, EligibleForPrune)
                | (EligibleForPrune, Deleted)
                // A failed collection leaves the snapshot in place.
                | (EligibleForPrune, Active)
        )
    }

    /// Deleted or aborted.
    pub fn is_terminal(self) -> bool {
        matches!(self, SnapshotState::Deleted | SnapshotState::Aborted)
    }
}

/// Terminal snapshots remembered after they finish.
pub const TERMINAL_RETAINED: usize = 1024;

#[derive(Debug, Default)]
struct States {
    current: HashMap<String, SnapshotState>,
    // Terminal ids, oldest first.
    terminal: VecDeque<String>,
}

/// Current state of every live snapshot this process knows about, plus the
/// most recent terminal ones. Older terminal entries are forgotten.
#[derive(Debug)]
pub struct LifecycleTracker {
    states: RwLock<States>,
    terminal_capacity: usize,
}

impl Default for LifecycleTracker {
    fn default() -> Self {
        Self::with_terminal_capacity(TERMINAL_RETAINED)
    }
}

impl LifecycleTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty tracker that remembers at most `capacity` terminal snapshots.
    pub fn with_terminal_capacity(capacity: usize) -> Self {
        Self {
            states: RwLock::new(States::default()),
            terminal_capacity: capacity,
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, States> {
        self.states.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Start tracking a new snapshot in `Pending`.
    pub fn begin(&self, id: &str) -> StoreResult<()> {
        let mut states = self.write();
        if states.current.contains_key(id) {
            return Err(StoreError::IntegrityError(format!("snapshot {id} already tracked")));
        }
        states.current.insert(id.to_string(), SnapshotState::Pending);
        Ok(())
    }

    /// Register a snapshot loaded from disk as `Active`.
    pub fn restore_active(&self, id: &str) {
        self.write().current.insert(id.to_string(), SnapshotState::Active);
    }

    /// Move `id` to `next`, rejecting illegal transitions.
    pub fn transition(&self, id: &str, next: SnapshotState) -> StoreResult<()> {
        let mut guard = self.write();
        let states = &mut *guard;
        let current = states
            .current
            .get_mut(id)
            .ok_or_else(|| StoreError::SnapshotNotFound(id.to_string()))?;
        if !current.can_transition_to(next) {
            return Err(StoreError::IntegrityError(format!(
                "snapshot {id}: illegal transition {current:?} -> {next:?}"
            )));
        }
        debug!(snapshot_id = id, from = ?*current, to = ?next, "snapshot state");
        *current = next;
        if next.is_terminal() {
            states.terminal.push_back(id.to_string());
            while states.terminal.len() > self.terminal_capacity {
                if let Some(old) = states.terminal.pop_front() {
                    states.current.remove(&old);
                }
            }
        }
        Ok(())
    }

    /// Current state.
    pub fn state(&self, id: &str) -> Option<SnapshotState> {
        self.states
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .current
            .get(id)
            .copied()
    }

    /// Number of snapshots tracked, terminal ones included.
    pub fn len(&self) -> usize {
        self.states.read().unwrap_or_else(|e| e.into_inner()).current.len()
    }

    /// True if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PinFile {
    pinned: BTreeSet<String>,
}

/// Snapshots exempt from pruning, persisted in `pins.json`.
pub struct PinRegistry {
    path: PathBuf,
    pinned: Mutex<BTreeSet<String>>,
}

impl PinRegistry {
    /// Load pins from `path`; a missing file means no pins.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let pinned = match persist::read_optional(path)? {
            Some(bytes) => serde_json::from_slice::<PinFile>(&bytes)?.pinned,
            None => BTreeSet::new(),
        };
        Ok(Self {
            path: path.to_path_buf(),
            pinned: Mutex::new(pinned),
        })
    }

    /// Pin `id`. Returns false if it was already pinned.
    pub fn pin(&self, id: &str) -> StoreResult<bool> {
        self.update(|set| set.insert(id.to_string()))
    }

    /// Unpin `id`. Returns false if it was not pinned.
    pub fn unpin(&self, id: &str) -> StoreResult<bool> {
        self.update(|set| set.remove(id))
    }

    fn update(&self, f: impl FnOnce(&mut BTreeSet<String>) -> bool) -> StoreResult<bool> {
        let mut pinned = self.pinned.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = pinned.clone();
        if !f(&mut next) {
            return Ok(false);
        }
        let file = PinFile { pinned: next };
        persist::write_atomic(&self.path, &serde_json::to_vec_pretty(&file)?)?;
        *pinned = file.pinned;
        Ok(true)
    }

    /// True if `id` is pinned.
    pub fn is_pinned(&self, id: &str) -> bool {
        self.pinned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
    }

    /// Every pinned id.
    pub fn pinned(&self) -> BTreeSet<String> {
        self.pinned.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Drop pins whose snapshot no longer exists.
    pub fn retain_known(&self, known: &BTreeSet<String>) -> StoreResult<()> {
        let stale: Vec<String> = self.pinned().difference(known).cloned().collect();
        for id in stale {
            warn!(snapshot_id = %id, "dropping pin for unknown snapshot");
            self.unpin(&id)?;
        }
        Ok(())
    }
}
