//! Validated engine configuration, loaded from TOML or JSON.

use crate::chunker::ChunkingMode;
use crate::crypto::{Algorithm, MIN_KDF_ITERATIONS};
use crate::error::{StoreError, StoreResult};
use crate::retention::RetentionPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const MAX_KDF_ITERATIONS: u32 = 10_000_000;
const MIN_BLOCK_SIZE: usize = 4 * 1024;
const MAX_BLOCK_SIZE: usize = 16 * 1024 * 1024;
const MAX_GRACE_PERIOD_SECS: u64 = 30 * 24 * 3600;
const MAX_WORKERS: usize = 256;

/// Cipher and KDF settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// AEAD cipher for new encryption keys.
    pub algorithm: Algorithm,
    /// PBKDF2 iterations for passphrase-derived keys and the master key.
    pub kdf_iterations: u32,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Aes256Gcm,
            kdf_iterations: 210_000,
        }
    }
}

/// How file content is split into chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Whole-file, fixed-size or content-defined chunking.
    pub mode: ChunkingMode,
    /// Block size for `fixed`, average size for `content-defined`.
    pub block_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            mode: ChunkingMode::ContentDefined,
            block_size: 64 * 1024,
        }
    }
}

/// Garbage collection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// How long a zero-refcount chunk lingers before it is physically removed.
    pub grace_period_secs: u64,
    /// Purge retired keys that no chunk or manifest references after each prune.
    pub purge_unreferenced_keys: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 3600,
            purge_unreferenced_keys: false,
        }
    }
}

/// Global I/O throttle shared by ingestion and restore workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Maximum read bytes per second (0 = unlimited).
    pub max_read_bytes_per_sec: u64,
    /// Maximum write bytes per second (0 = unlimited).
    pub max_write_bytes_per_sec: u64,
    /// Burst allowance as a multiple of the per-second rate.
    pub burst_factor: f64,
    /// Longest a single request may wait for budget.
    pub acquire_timeout_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_read_bytes_per_sec: 0,
            max_write_bytes_per_sec: 0,
            burst_factor: 1.5,
            acquire_timeout_ms: 30_000,
        }
    }
}

/// Ingestion behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Skip files that cannot be read instead of aborting the snapshot.
    pub skip_unreadable: bool,
    /// Attempts a refcount update may make before giving up.
    pub refcount_retry_budget: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            skip_unreadable: false,
            refcount_retry_budget: 64,
        }
    }
}

/// Key lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// Age after which an active key is due for rotation.
    pub max_age_days: u32,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self { max_age_days: 90 }
    }
}

/// Audit trail settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Actor name recorded on every audit event.
    pub actor: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            actor: "snapguard".to_string(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Repository root holding keys, chunks, manifests and the audit log.
    pub root_dir: PathBuf,
    /// Bounded worker pool size.
    pub workers: usize,
    /// Cipher and KDF settings.
    pub crypto: CryptoConfig,
    /// Chunking settings.
    pub chunking: ChunkingConfig,
    /// Default retention counts used by `prune`.
    pub retention: RetentionPolicy,
    /// Garbage collection settings.
    pub gc: GcConfig,
    /// I/O throttle settings.
    pub throttle: ThrottleConfig,
    /// Ingestion behaviour.
    pub ingest: IngestConfig,
    /// Key lifecycle settings.
    pub keys: KeyConfig,
    /// Audit trail settings.
    pub audit: AuditConfig,
    /// Log output settings.
    pub logging: LoggingConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/lib/snapguard/store"),
            workers: 4,
            crypto: CryptoConfig::default(),
            chunking: ChunkingConfig::default(),
            retention: RetentionPolicy::default(),
            gc: GcConfig::default(),
            throttle: ThrottleConfig::default(),
            ingest: IngestConfig::default(),
            keys: KeyConfig::default(),
            audit: AuditConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> StoreError {
    StoreError::InvalidConfig {
        field: field.to_string(),
        reason: reason.into(),
    }
}

impl StoreConfig {
    /// Defaults rooted at `root_dir`.
    pub fn with_root(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Self::default()
        }
    }

    /// Load from a `.toml` or `.json` file and validate.
    pub fn from_file(path: &Path) -> StoreResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: StoreConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| StoreError::Serialization(format!("{}: {e}", path.display())))?,
            "json" => serde_json::from_str(&contents)?,
            _ => return Err(invalid("config", format!("unsupported file extension {ext:?}"))),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject out-of-range or contradictory values.
    pub fn validate(&self) -> StoreResult<()> {
        if self.root_dir.as_os_str().is_empty() {
            return Err(invalid("root_dir", "must not be empty"));
        }
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(invalid("workers", format!("must be in 1..={MAX_WORKERS}")));
        }
        if !self.crypto.algorithm.is_aead() {
            return Err(StoreError::InvalidAlgorithm {
                algorithm: self.crypto.algorithm.to_string(),
                role: "encryption".to_string(),
            });
        }
        if !(MIN_KDF_ITERATIONS..=MAX_KDF_ITERATIONS).contains(&self.crypto.kdf_iterations) {
            return Err(invalid(
                "crypto.kdf_iterations",
                format!("must be in {MIN_KDF_ITERATIONS}..={MAX_KDF_ITERATIONS}"),
            ));
        }
        let bs = self.chunking.block_size;
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&bs) {
            return Err(invalid(
                "chunking.block_size",
                format!("must be in {MIN_BLOCK_SIZE}..={MAX_BLOCK_SIZE}"),
            ));
        }
        if self.chunking.mode == ChunkingMode::Fixed && !bs.is_power_of_two() {
            return Err(invalid("chunking.block_size", "fixed blocks must be a power of two"));
        }
        self.retention.validate()?;
        if self.gc.grace_period_secs > MAX_GRACE_PERIOD_SECS {
            return Err(invalid(
                "gc.grace_period_secs",
                format!("must be at most {MAX_GRACE_PERIOD_SECS}"),
            ));
        }
        if !(1.0..=16.0).contains(&self.throttle.burst_factor) {
            return Err(invalid("throttle.burst_factor", "must be in 1.0..=16.0"));
        }
        if self.throttle.acquire_timeout_ms == 0 {
            return Err(invalid("throttle.acquire_timeout_ms", "must be positive"));
        }
        if !(1..=10_000).contains(&self.ingest.refcount_retry_budget) {
            return Err(invalid("ingest.refcount_retry_budget", "must be in 1..=10000"));
        }
        if self.keys.max_age_days == 0 {
            return Err(invalid("keys.max_age_days", "must be at least 1"));
        }
        if self.audit.actor.trim().is_empty() {
            return Err(invalid("audit.actor", "must not be empty"));
        }
        Ok(())
    }
}
