//! Append-only audit trail of key and manifest mutations.
//!
//! Events go to `audit.log` as JSON lines, to a bounded in-memory ring for
//! queries, and to the `snapguard::audit` tracing target.

use crate::error::StoreResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info};

const MAX_EVENTS: usize = 10_000;

/// What was done.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    /// A key was generated (first use or explicit).
    KeyGenerate,
    /// A role's active key was replaced.
    KeyRotate,
    /// A key was demoted to retired.
    KeyRetire,
    /// Key material was destroyed.
    KeyPurge,
    /// A signed manifest was persisted.
    ManifestCreate,
    /// A manifest was removed by pruning.
    ManifestDelete,
    /// A snapshot was pinned against pruning.
    SnapshotPin,
    /// A pin was removed.
    SnapshotUnpin,
}

/// A single audit record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Monotonic sequence number within the log.
    pub id: u64,
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Who performed the operation.
    pub actor: String,
    /// What was done.
    pub operation: AuditOperation,
    /// Key id or snapshot id acted upon.
    pub target: String,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Free-form detail (error text on failure).
    pub detail: String,
}

/// Query filter over recorded events.
#[derive(Clone, Debug, Default)]
pub struct AuditFilter {
    /// Only this operation.
    pub operation: Option<AuditOperation>,
    /// Only this target.
    pub target: Option<String>,
    /// Only events at or after this time.
    pub since: Option<DateTime<Utc>>,
    /// Drop failed operations.
    pub success_only: bool,
}

impl AuditFilter {
    /// True if the event passes every set criterion.
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(op) = self.operation {
            if event.operation != op {
                return false;
            }
        }
        if let Some(ref t) = self.target {
            if &event.target != t {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if self.success_only && !event.success {
            return false;
        }
        true
    }
}

struct AuditState {
    file: Option<File>,
    recent: VecDeque<AuditEvent>,
    next_id: u64,
}

/// Append-only audit log.
pub struct AuditLog {
    actor: String,
    path: Option<PathBuf>,
    state: Mutex<AuditState>,
}

impl AuditLog {
    /// Open (or create) the log file and resume numbering after its last event.
    pub fn open(path: &Path, actor: impl Into<String>) -> StoreResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut recent = VecDeque::with_capacity(MAX_EVENTS.min(1024));
        let mut next_id = 1;
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<AuditEvent>(&line) {
                    Ok(event) => {
                        next_id = next_id.max(event.id + 1);
                        if recent.len() >= MAX_EVENTS {
                            recent.pop_front();
                        }
                        recent.push_back(event);
                    }
                    Err(e) => error!(path = %path.display(), error = %e, "skipping unreadable audit line"),
                }
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            actor: actor.into(),
            path: Some(path.to_path_buf()),
            state: Mutex::new(AuditState {
                file: Some(file),
                recent,
                next_id,
            }),
        })
    }

    /// An audit log that only keeps events in memory.
    pub fn in_memory(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            path: None,
            state: Mutex::new(AuditState {
                file: None,
                recent: VecDeque::new(),
                next_id: 1,
            }),
        }
    }

    /// The actor recorded on every event.
    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Record an event and return its id.
    ///
    /// A failed append is logged, not returned: the mutation it describes has
    /// already happened.
    pub fn record(
        &self,
        operation: AuditOperation,
        target: &str,
        success: bool,
        detail: impl Into<String>,
    ) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let event = AuditEvent {
            id: state.next_id,
            timestamp: Utc::now(),
            actor: self.actor.clone(),
            operation,
            target: target.to_string(),
            success,
            detail: detail.into(),
        };
        state.next_id += 1;

        info!(
            target: "snapguard::audit",
            id = event.id,
            actor = %event.actor,
            operation = ?event.operation,
            target_id = %event.target,
            success = event.success,
            detail = %event.detail,
            "audit"
        );

        if let Some(file) = state.file.as_mut() {
            let written = serde_json::to_vec(&event)
                .map_err(std::io::Error::other)
                .and_then(|mut line| {
                    line.push(b'\n');
                    file.write_all(&line)?;
                    file.sync_data()
                });
            if let Err(e) = written {
                error!(path = ?self.path, error = %e, "failed to append audit event");
            }
        }

        let id = event.id;
        if state.recent.len() >= MAX_EVENTS {
            state.recent.pop_front();
        }
        state.recent.push_back(event);
        id
    }

    /// Events matching `filter`, oldest first.
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditEvent> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .recent
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    /// Number of events held in memory.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .recent
            .len()
    }

    /// True if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_query() {
        let log = AuditLog::in_memory("tester");
        log.record(AuditOperation::KeyGenerate, "k1", true, "");
        log.record(AuditOperation::KeyPurge, "k1", false, "in use");
        log.record(AuditOperation::ManifestCreate, "snap-1", true, "");

        assert_eq!(log.len(), 3);
        let purges = log.query(&AuditFilter {
            operation: Some(AuditOperation::KeyPurge),
            ..Default::default()
        });
        assert_eq!(purges.len(), 1);
        assert!(!purges[0].success);
        assert_eq!(purges[0].actor, "tester");

        let ok = log.query(&AuditFilter {
            target: Some("k1".into()),
            success_only: true,
            ..Default::default()
        });
        assert_eq!(ok.len(), 1);
    }

    #[test]
    fn reopen_continues_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        {
            let log = AuditLog::open(&path, "a").unwrap();
            assert_eq!(log.record(AuditOperation::KeyGenerate, "k1", true, ""), 1);
            assert_eq!(log.record(AuditOperation::KeyRotate, "k2", true, ""), 2);
        }
        let log = AuditLog::open(&path, "a").unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.record(AuditOperation::KeyRetire, "k1", true, ""), 3);

        let lines = std::fs::read_to_string(&path).unwrap();
        assert_eq!(lines.lines().count(), 3);
    }
}
