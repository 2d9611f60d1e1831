//! Filesystem snapshot sources.
//!
//! A source freezes a subvolume into a point-in-time tree and lists its
//! files; the engine ingests the tree and then asks the source to drop it.

use crate::error::{StoreError, StoreResult};
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Where a file's bytes come from.
#[derive(Debug, Clone)]
pub enum SourceContent {
    /// A file on disk.
    File(PathBuf),
    /// Bytes held in memory.
    Memory(Bytes),
}

impl SourceContent {
    /// Open a fresh reader.
    pub fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        match self {
            SourceContent::File(path) => Ok(Box::new(std::fs::File::open(path)?)),
            SourceContent::Memory(bytes) => Ok(Box::new(io::Cursor::new(bytes.clone()))),
        }
    }
}

/// One file of a snapshot tree.
#[derive(Debug, Clone)]
pub struct SourceEntry {
    /// Relative, `/`-separated path
    pub path: String,
    /// Size reported by the source
    pub size: u64,
    /// Content
    pub content: SourceContent,
}

impl SourceEntry {
    /// In-memory entry.
    pub fn memory(path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            path: path.into(),
            size: data.len() as u64,
            content: SourceContent::Memory(data),
        }
    }
}

/// A frozen point-in-time tree.
#[derive(Debug, Clone)]
pub struct SnapshotTree {
    /// Source-level identifier, passed back to [`SnapshotSource::delete`]
    pub id: String,
    /// Files in path order
    pub entries: Vec<SourceEntry>,
    /// Paths left out because their names are not UTF-8 or they could not be
    /// read, lossily decoded
    pub unreadable: Vec<String>,
}

/// Capability to take and drop filesystem-level snapshots.
pub trait SnapshotSource: Send + Sync {
    /// Short name for logs.
    fn kind(&self) -> &'static str;

    /// Freeze `subvolume` and enumerate its files.
    fn take_snapshot(&self, subvolume: &str) -> StoreResult<SnapshotTree>;

    /// Drop a tree returned by `take_snapshot`.
    fn delete(&self, tree_id: &str) -> StoreResult<()>;

    /// Trees currently held by this source.
    fn list(&self) -> StoreResult<Vec<String>>;
}

fn tree_name(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}_{}", Utc::now().timestamp(), &suffix[..8])
}

/// Run `build` for a freshly created tree, dropping the tree if it fails.
fn build_or_drop(
    source: &dyn SnapshotSource,
    id: String,
    build: impl FnOnce() -> StoreResult<(Vec<SourceEntry>, Vec<String>)>,
) -> StoreResult<SnapshotTree> {
    match build() {
        Ok((entries, unreadable)) => Ok(SnapshotTree { id, entries, unreadable }),
        Err(e) => {
            if let Err(cleanup) = source.delete(&id) {
                warn!(tree = %id, error = %cleanup, "failed to drop partial snapshot tree");
            }
            Err(e)
        }
    }
}

/// Read-only btrfs subvolume snapshots taken with the `btrfs` tool.
pub struct BtrfsSource {
    snapshot_dir: PathBuf,
    btrfs: PathBuf,
}

impl BtrfsSource {
    /// Snapshots are created under `snapshot_dir`, which must be on the same
    /// btrfs filesystem as the subvolumes.
    pub fn new(snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_dir: snapshot_dir.into(),
            btrfs: PathBuf::from("btrfs"),
        }
    }

    /// Use a specific `btrfs` binary.
    pub fn with_binary(mut self, btrfs: impl Into<PathBuf>) -> Self {
        self.btrfs = btrfs.into();
        self
    }

    fn run(&self, args: &[&OsStr]) -> StoreResult<()> {
        let output = Command::new(&self.btrfs)
            .args(args)
            .output()
            .map_err(|e| StoreError::Source(format!("cannot run {}: {e}", self.btrfs.display())))?;
        if !output.status.success() {
            return Err(StoreError::Source(format!(
                "btrfs {:?} failed: {}",
                args,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

impl SnapshotSource for BtrfsSource {
    fn kind(&self) -> &'static str {
        "btrfs"
    }

    fn take_snapshot(&self, subvolume: &str) -> StoreResult<SnapshotTree> {
        std::fs::create_dir_all(&self.snapshot_dir)?;
        let id = tree_name("btrfs");
        let target = self.snapshot_dir.join(&id);
        self.run(&[
            OsStr::new("subvolume"),
            OsStr::new("snapshot"),
            OsStr::new("-r"),
            OsStr::new(subvolume),
            target.as_os_str(),
        ])?;
        info!(subvolume, tree = %id, "btrfs snapshot taken");
        build_or_drop(self, id, || walk_tree(&target))
    }

    fn delete(&self, tree_id: &str) -> StoreResult<()> {
        let target = self.snapshot_dir.join(tree_id);
        self.run(&[OsStr::new("subvolume"), OsStr::new("delete"), target.as_os_str()])?;
        debug!(tree = tree_id, "btrfs snapshot deleted");
        Ok(())
    }

    fn list(&self) -> StoreResult<Vec<String>> {
        list_prefixed(&self.snapshot_dir, "btrfs_")
    }
}

/// Copies the source directory into a private lower layer, as an overlay
/// mount would expose it, and reads from that copy.
pub struct OverlaySource {
    snapshot_dir: PathBuf,
}

impl OverlaySource {
    /// Lower layers are created under `snapshot_dir`.
    pub fn new(snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_dir: snapshot_dir.into(),
        }
    }
}

impl SnapshotSource for OverlaySource {
    fn kind(&self) -> &'static str {
        "overlay"
    }

    fn take_snapshot(&self, subvolume: &str) -> StoreResult<SnapshotTree> {
        let source = Path::new(subvolume);
        if !source.is_dir() {
            return Err(StoreError::Source(format!("{subvolume} is not a directory")));
        }
        let id = tree_name("overlay");
        let lower = self.snapshot_dir.join(&id).join("lower");
        build_or_drop(self, id.clone(), || {
            let mut unreadable = Vec::new();
            copy_tree(source, &lower, Path::new(""), &mut unreadable)?;
            info!(subvolume, tree = %id, "overlay lower layer prepared");
            let (entries, undecodable) = walk_tree(&lower)?;
            unreadable.extend(undecodable);
            unreadable.sort();
            Ok((entries, unreadable))
        })
    }

    fn delete(&self, tree_id: &str) -> StoreResult<()> {
        if tree_id.contains(['/', '\\']) || tree_id.starts_with('.') {
            return Err(StoreError::InvalidPath(tree_id.to_string()));
        }
        match std::fs::remove_dir_all(self.snapshot_dir.join(tree_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> StoreResult<Vec<String>> {
        list_prefixed(&self.snapshot_dir, "overlay_")
    }
}

/// Subvolumes held in memory.
#[derive(Default)]
pub struct MemorySource {
    subvolumes: Mutex<HashMap<String, Vec<SourceEntry>>>,
    taken: Mutex<Vec<String>>,
}

impl MemorySource {
    /// Empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file.
    pub fn put(&self, subvolume: &str, path: &str, data: impl Into<Bytes>) {
        let mut subvolumes = self.subvolumes.lock().unwrap_or_else(|e| e.into_inner());
        let files = subvolumes.entry(subvolume.to_string()).or_default();
        files.retain(|e| e.path != path);
        files.push(SourceEntry::memory(path, data));
        files.sort_by(|a, b| a.path.cmp(&b.path));
    }

    /// Remove a file.
    pub fn remove(&self, subvolume: &str, path: &str) {
        if let Some(files) = self
            .subvolumes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(subvolume)
        {
            files.retain(|e| e.path != path);
        }
    }
}

impl SnapshotSource for MemorySource {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn take_snapshot(&self, subvolume: &str) -> StoreResult<SnapshotTree> {
        let entries = self
            .subvolumes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(subvolume)
            .cloned()
            .ok_or_else(|| StoreError::Source(format!("no such subvolume: {subvolume}")))?;
        let id = tree_name("memory");
        self.taken.lock().unwrap_or_else(|e| e.into_inner()).push(id.clone());
        Ok(SnapshotTree {
            id,
            entries,
            unreadable: Vec::new(),
        })
    }

    fn delete(&self, tree_id: &str) -> StoreResult<()> {
        self.taken
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|t| t != tree_id);
        Ok(())
    }

    fn list(&self) -> StoreResult<Vec<String>> {
        Ok(self.taken.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

fn list_prefixed(dir: &Path, prefix: &str) -> StoreResult<Vec<String>> {
    let mut ids = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ids),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let name = entry?.file_name();
        if let Some(name) = name.to_str().filter(|n| n.starts_with(prefix)) {
            ids.push(name.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}

/// Regular files under `root`, sorted by relative path, and the paths that
/// were left out because their names are not UTF-8. Symlinks are not followed.
pub fn walk_tree(root: &Path) -> StoreResult<(Vec<SourceEntry>, Vec<String>)> {
    let mut entries = Vec::new();
    let mut undecodable = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if !file_type.is_dir() && !file_type.is_file() {
                debug!(path = %path.display(), "skipping non-regular file");
                continue;
            }
            let Some(relative) = relative_path(root, &path)? else {
                warn!(path = %path.display(), "skipping non UTF-8 file name");
                undecodable.push(lossy_relative(root, &path));
                continue;
            };
            if file_type.is_dir() {
                pending.push(path);
            } else {
                let size = entry.metadata()?.len();
                entries.push(SourceEntry {
                    path: relative,
                    size,
                    content: SourceContent::File(path),
                });
            }
        }
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    undecodable.sort();
    Ok((entries, undecodable))
}

/// `/`-joined path of `path` below `root`, or None if a name is not UTF-8.
fn relative_path(root: &Path, path: &Path) -> StoreResult<Option<String>> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| StoreError::InvalidPath(path.display().to_string()))?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(s) => parts.push(s),
                None => return Ok(None),
            },
            _ => return Err(StoreError::InvalidPath(path.display().to_string())),
        }
    }
    Ok(Some(parts.join("/")))
}

fn lossy_relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Copy regular files from `from` into `to`. Files the process may not read
/// are recorded in `unreadable` (relative to the copy root) and skipped.
fn copy_tree(from: &Path, to: &Path, rel: &Path, unreadable: &mut Vec<String>) -> StoreResult<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let name = entry.file_name();
        let target = to.join(&name);
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target, &rel.join(&name), unreadable)?;
        } else if file_type.is_file() {
            match std::fs::copy(entry.path(), &target) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                    warn!(path = %entry.path().display(), "skipping unreadable file");
                    unreadable.push(rel.join(&name).to_string_lossy().replace('\\', "/"));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}
