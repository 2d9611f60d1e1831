//! Restore helpers: path selection, path safety and per-file materialization.

use crate::content_store::ContentStore;
use crate::error::{StoreError, StoreResult};
use crate::manifest::ManifestEntry;
use crate::throttle::{Direction, IoThrottle};
use glob::{MatchOptions, Pattern};
use std::fs::File;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Name of the staging directory created inside the restore target.
pub fn staging_dir(target: &Path, snapshot_id: &str) -> PathBuf {
    target.join(format!(".snapguard-restore-{snapshot_id}"))
}

/// Which manifest paths a restore selects.
#[derive(Debug, Clone)]
pub enum PathFilter {
    /// Everything.
    All,
    /// Shell-style pattern over the whole relative path.
    Glob(Pattern),
    /// A file or a directory and everything below it.
    Prefix(String),
}

impl PathFilter {
    /// Glob if the text contains `*`, `?` or `[`, otherwise a path prefix.
    pub fn parse(filter: Option<&str>) -> StoreResult<Self> {
        let Some(text) = filter.map(str::trim).filter(|t| !t.is_empty()) else {
            return Ok(PathFilter::All);
        };
        if text.contains(['*', '?', '[']) {
            let pattern = Pattern::new(text)
                .map_err(|e| StoreError::InvalidPath(format!("bad pattern {text:?}: {e}")))?;
            Ok(PathFilter::Glob(pattern))
        } else {
            Ok(PathFilter::Prefix(text.trim_matches('/').to_string()))
        }
    }

    /// True if `path` is selected.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathFilter::All => true,
            PathFilter::Glob(p) => p.matches_with(
                path,
                MatchOptions {
                    case_sensitive: true,
                    require_literal_separator: false,
                    require_literal_leading_dot: false,
                },
            ),
            PathFilter::Prefix(prefix) => {
                prefix.is_empty()
                    || path == prefix
                    || path
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
        }
    }
}

/// Convert a manifest path into a relative path that cannot leave its root.
pub fn safe_relative(path: &str) -> StoreResult<PathBuf> {
    let invalid = || StoreError::InvalidPath(path.to_string());
    if path.is_empty() || path.contains('\0') || path.contains('\\') {
        return Err(invalid());
    }
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            _ => return Err(invalid()),
        }
    }
    if out.as_os_str().is_empty() {
        return Err(invalid());
    }
    Ok(out)
}

/// Decrypt one file into `staging`. Checks cancellation between chunks.
pub fn restore_file(
    content: &ContentStore,
    throttle: &IoThrottle,
    entry: &ManifestEntry,
    staging: &Path,
    cancel: &CancellationToken,
) -> StoreResult<u64> {
    let dest = staging.join(safe_relative(&entry.path)?);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = File::create(&dest)?;
    let mut written = 0u64;
    for hash in &entry.chunks {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let data = content.read_chunk(hash)?;
        throttle.acquire(Direction::Write, data.len() as u64)?;
        file.write_all(&data)?;
        written += data.len() as u64;
    }
    file.sync_all()?;
    if written != entry.size {
        return Err(StoreError::IntegrityError(format!(
            "{}: restored {written} bytes, manifest records {}",
            entry.path, entry.size
        )));
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_filter() {
        let f = PathFilter::parse(Some("docs/")).unwrap();
        assert!(f.matches("docs"));
        assert!(f.matches("docs/a.txt"));
        assert!(f.matches("docs/sub/b.txt"));
        assert!(!f.matches("docs2/a.txt"));
        assert!(!f.matches("other"));
    }

    #[test]
    fn test_glob_filter() {
        let f = PathFilter::parse(Some("*.txt")).unwrap();
        assert!(f.matches("a.txt"));
        assert!(f.matches("dir/b.txt"));
        assert!(!f.matches("c.bin"));
        let f = PathFilter::parse(Some("logs/202?-*")).unwrap();
        assert!(f.matches("logs/2024-01"));
        assert!(!f.matches("logs/1999-01"));
    }

    #[test]
    fn test_empty_filter_selects_all() {
        assert!(PathFilter::parse(None).unwrap().matches("anything"));
        assert!(PathFilter::parse(Some("  ")).unwrap().matches("anything"));
    }

    #[test]
    fn test_bad_glob() {
        assert!(matches!(PathFilter::parse(Some("[")), Err(StoreError::InvalidPath(_))));
    }

    #[test]
    fn test_safe_relative() {
        assert_eq!(safe_relative("a/b/c.txt").unwrap(), PathBuf::from("a/b/c.txt"));
        assert_eq!(safe_relative("./a").unwrap(), PathBuf::from("a"));
        for bad in ["", "../x", "a/../../x", "/etc/passwd", "a\\b", "."] {
            assert!(matches!(safe_relative(bad), Err(StoreError::InvalidPath(_))), "{bad:?}");
        }
    }
}
