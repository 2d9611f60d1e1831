//! Key lifecycle: generation, rotation, retirement and purge of encryption
//! and signing keys, with key material wrapped at rest under a master key.
//!
//! Exactly one key per role is active. Readers of the active key clone an
//! `Arc` out of a short-held lock, so a concurrent rotation is observed either
//! entirely or not at all. Rotations of the same role are serialized.
//!
//! Work that signs or seals with the active key holds a [`KeyLease`] until
//! its output is visible to reference counting. A leased key cannot be
//! purged, and only the active key can be leased, so a purge that sees a
//! retired key with no leases can never race a new user of it.

use crate::audit::{AuditLog, AuditOperation};
use crate::crypto::{self, Algorithm, Sealed, SecretKey, Signature, SALT_SIZE};
use crate::error::{StoreError, StoreResult};
use crate::persist;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

const MASTER_FILE: &str = "master.json";
const MASTER_CHECK_MESSAGE: &[u8] = b"snapguard master key check";
const WRAP_KEY_INFO: &[u8] = b"snapguard key-wrap v1";
const CHECK_KEY_INFO: &[u8] = b"snapguard master-check v1";

/// What a key is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyRole {
    /// Chunk encryption (AEAD).
    Encryption,
    /// Manifest signing (HMAC).
    Signing,
}

impl KeyRole {
    /// Both roles.
    pub const ALL: [KeyRole; 2] = [KeyRole::Encryption, KeyRole::Signing];

    fn index(self) -> usize {
        match self {
            KeyRole::Encryption => 0,
            KeyRole::Signing => 1,
        }
    }

    /// Lowercase name, also used as the key id prefix.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyRole::Encryption => "encryption",
            KeyRole::Signing => "signing",
        }
    }

    /// True if keys of this role may use `algorithm`.
    pub fn supports(&self, algorithm: Algorithm) -> bool {
        match self {
            KeyRole::Encryption => algorithm.is_aead(),
            KeyRole::Signing => algorithm == Algorithm::HmacSha256,
        }
    }
}

impl std::fmt::Display for KeyRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for KeyRole {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "encryption" => Ok(KeyRole::Encryption),
            "signing" => Ok(KeyRole::Signing),
            _ => Err(StoreError::KeyNotFound(format!("no such key role: {s}"))),
        }
    }
}

/// Lifecycle state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    /// Used for new encryption/signing.
    Active,
    /// Decrypt/verify only.
    Retired,
    /// Material destroyed; the record remains for audit.
    Purged,
}

/// Key identifier: `<role>_<unix seconds>_<8 hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyId(String);

impl KeyId {
    fn generate(role: KeyRole, at: DateTime<Utc>) -> Self {
        let mut suffix = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut suffix);
        KeyId(format!("{}_{}_{}", role, at.timestamp(), hex::encode(suffix)))
    }

    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        KeyId(id.into())
    }

    /// The identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key metadata. Never contains key material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Identifier
    pub id: KeyId,
    /// Encryption or signing
    pub role: KeyRole,
    /// Algorithm tag
    pub algorithm: Algorithm,
    /// Lifecycle state
    pub status: KeyStatus,
    /// When the key was created
    pub created_at: DateTime<Utc>,
    /// When the key was superseded
    #[serde(default)]
    pub retired_at: Option<DateTime<Utc>>,
    /// When the material was destroyed
    #[serde(default)]
    pub purged_at: Option<DateTime<Utc>>,
    /// Hex PBKDF2 salt if the key was derived from a passphrase
    #[serde(default)]
    pub kdf_salt: Option<String>,
}

/// A usable key. The material never leaves the crate.
pub struct KeyHandle {
    id: KeyId,
    role: KeyRole,
    algorithm: Algorithm,
    created_at: DateTime<Utc>,
    material: SecretKey,
}

impl KeyHandle {
    /// Key identifier
    pub fn id(&self) -> &KeyId {
        &self.id
    }

    /// Key role
    pub fn role(&self) -> KeyRole {
        self.role
    }

    /// Algorithm tag
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Creation time
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn material(&self) -> &SecretKey {
        &self.material
    }
}

type LeaseTable = Arc<Mutex<HashMap<KeyId, usize>>>;

fn lock_leases(leases: &LeaseTable) -> std::sync::MutexGuard<'_, HashMap<KeyId, usize>> {
    leases.lock().unwrap_or_else(|e| e.into_inner())
}

/// The active key of a role, held against purging until dropped.
pub struct KeyLease {
    handle: Arc<KeyHandle>,
    leases: LeaseTable,
}

impl KeyLease {
    /// The leased key.
    pub fn key(&self) -> &KeyHandle {
        &self.handle
    }
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        let mut leases = lock_leases(&self.leases);
        if let Some(count) = leases.get_mut(self.handle.id()) {
            *count -= 1;
            if *count == 0 {
                leases.remove(self.handle.id());
            }
        }
    }
}

impl Debug for KeyLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("KeyLease").field(self.handle.id()).finish()
    }
}

impl Debug for KeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyHandle")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("algorithm", &self.algorithm)
            .field("material", &"[REDACTED]")
            .finish()
    }
}

/// Counts chunks and manifests that still cite a key.
pub trait KeyReferences {
    /// Number of references to `key_id`.
    fn key_references(&self, key_id: &KeyId) -> StoreResult<usize>;
}

#[derive(Serialize, Deserialize)]
struct MasterFile {
    salt: [u8; SALT_SIZE],
    iterations: u32,
    check: Signature,
}

#[derive(Serialize, Deserialize)]
struct StoredKey {
    record: KeyRecord,
    /// Key material sealed under the wrap key, AAD = key id.
    wrapped: Option<Sealed>,
}

struct KeyEntry {
    record: KeyRecord,
    handle: Option<Arc<KeyHandle>>,
}

/// Owns all key material and its rotation state.
pub struct KeyManager {
    dir: Option<PathBuf>,
    wrap_key: SecretKey,
    kdf_iterations: u32,
    keys: RwLock<HashMap<KeyId, KeyEntry>>,
    active: [RwLock<Option<Arc<KeyHandle>>>; 2],
    rotation: [Mutex<()>; 2],
    leases: LeaseTable,
    audit: Arc<AuditLog>,
}

impl KeyManager {
    /// Open the key store in `dir`, creating it (and its master record) on first use.
    ///
    /// A passphrase that does not match the existing master record fails with
    /// `IntegrityError`.
    pub fn open(
        dir: &Path,
        passphrase: &[u8],
        kdf_iterations: u32,
        audit: Arc<AuditLog>,
    ) -> StoreResult<Self> {
        std::fs::create_dir_all(dir)?;
        let wrap_key = open_master(dir, passphrase, kdf_iterations)?;
        let km = Self::empty(Some(dir.to_path_buf()), wrap_key, kdf_iterations, audit);
        km.load()?;
        Ok(km)
    }

    /// A key manager that keeps everything in memory.
    pub fn in_memory(kdf_iterations: u32, audit: Arc<AuditLog>) -> Self {
        Self::empty(None, SecretKey::generate(), kdf_iterations, audit)
    }

    fn empty(
        dir: Option<PathBuf>,
        wrap_key: SecretKey,
        kdf_iterations: u32,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            dir,
            wrap_key,
            kdf_iterations,
            keys: RwLock::new(HashMap::new()),
            active: [RwLock::new(None), RwLock::new(None)],
            rotation: [Mutex::new(()), Mutex::new(())],
            leases: LeaseTable::default(),
            audit,
        }
    }

    fn load(&self) -> StoreResult<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let mut loaded = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_record = path.extension().is_some_and(|e| e == "json")
                && path.file_name().is_some_and(|n| n != MASTER_FILE);
            if !is_record {
                continue;
            }
            let stored: StoredKey = serde_json::from_slice(&std::fs::read(&path)?)?;
            let handle = match (&stored.wrapped, stored.record.status) {
                (_, KeyStatus::Purged) => None,
                (Some(sealed), _) => Some(Arc::new(self.unwrap_material(&stored.record, sealed)?)),
                (None, _) => {
                    return Err(StoreError::IntegrityError(format!(
                        "key {} has no material but is not purged",
                        stored.record.id
                    )))
                }
            };
            loaded.push(KeyEntry {
                record: stored.record,
                handle,
            });
        }

        // A crash between persisting a new key and retiring its predecessor leaves
        // two active records; the newest wins.
        loaded.sort_by_key(|e| e.record.created_at);
        for role in KeyRole::ALL {
            let actives: Vec<usize> = loaded
                .iter()
                .enumerate()
                .filter(|(_, e)| e.record.role == role && e.record.status == KeyStatus::Active)
                .map(|(i, _)| i)
                .collect();
            if let Some((&newest, older)) = actives.split_last() {
                for &i in older {
                    warn!(key_id = %loaded[i].record.id, "demoting stale active key");
                    loaded[i].record.status = KeyStatus::Retired;
                    loaded[i].record.retired_at = Some(loaded[newest].record.created_at);
                    let handle = loaded[i].handle.clone();
                    self.persist(&loaded[i].record, handle.as_deref())?;
                }
                *write(&self.active[role.index()]) = loaded[newest].handle.clone();
            }
        }

        let count = loaded.len();
        let mut keys = write(&self.keys);
        for entry in loaded {
            keys.insert(entry.record.id.clone(), entry);
        }
        info!(keys = count, "key store loaded");
        Ok(())
    }

    fn unwrap_material(&self, record: &KeyRecord, sealed: &Sealed) -> StoreResult<KeyHandle> {
        let plain = crypto::decrypt_with_aad(
            sealed,
            record.id.as_str().as_bytes(),
            &self.wrap_key,
            Algorithm::Aes256Gcm,
        )?;
        if plain.len() != crypto::KEY_SIZE {
            return Err(StoreError::IntegrityError(format!(
                "key {} material has wrong length",
                record.id
            )));
        }
        let mut bytes = [0u8; crypto::KEY_SIZE];
        bytes.copy_from_slice(&plain);
        Ok(KeyHandle {
            id: record.id.clone(),
            role: record.role,
            algorithm: record.algorithm,
            created_at: record.created_at,
            material: SecretKey::from_bytes(bytes),
        })
    }

    fn persist(&self, record: &KeyRecord, handle: Option<&KeyHandle>) -> StoreResult<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let wrapped = match handle {
            Some(h) if record.status != KeyStatus::Purged => Some(crypto::encrypt_with_aad(
                h.material().as_bytes(),
                record.id.as_str().as_bytes(),
                &self.wrap_key,
                Algorithm::Aes256Gcm,
            )?),
            _ => None,
        };
        let stored = StoredKey {
            record: record.clone(),
            wrapped,
        };
        let path = dir.join(format!("{}.json", record.id));
        persist::write_atomic(&path, &serde_json::to_vec_pretty(&stored)?)?;
        Ok(())
    }

    /// Create a random key for `role` and make it active, retiring the previous one.
    pub fn generate_key(&self, role: KeyRole, algorithm: Algorithm) -> StoreResult<KeyId> {
        let result = self.install(role, algorithm, SecretKey::generate(), None);
        self.audit_result(AuditOperation::KeyGenerate, role, &result);
        result
    }

    /// Derive a key for `role` from a passphrase (PBKDF2, random salt) and make it active.
    pub fn generate_key_from_passphrase(
        &self,
        role: KeyRole,
        algorithm: Algorithm,
        passphrase: &[u8],
    ) -> StoreResult<KeyId> {
        let salt = crypto::random_salt();
        let result = crypto::derive_key(passphrase, &salt, self.kdf_iterations)
            .and_then(|material| self.install(role, algorithm, material, Some(hex::encode(salt))));
        self.audit_result(AuditOperation::KeyGenerate, role, &result);
        result
    }

    /// Replace the active key of `role` with a fresh key of the same algorithm.
    pub fn rotate_key(&self, role: KeyRole) -> StoreResult<KeyId> {
        let result = self.get_active_key(role).and_then(|current| {
            let new_id = self.install(role, current.algorithm(), SecretKey::generate(), None)?;
            info!(role = %role, old = %current.id(), new = %new_id, "rotated key");
            Ok(new_id)
        });
        self.audit_result(AuditOperation::KeyRotate, role, &result);
        result
    }

    /// Generate a key for `role` unless one is already active.
    pub fn ensure_active(&self, role: KeyRole, algorithm: Algorithm) -> StoreResult<Option<KeyId>> {
        if read(&self.active[role.index()]).is_some() {
            return Ok(None);
        }
        self.generate_key(role, algorithm).map(Some)
    }

    fn install(
        &self,
        role: KeyRole,
        algorithm: Algorithm,
        material: SecretKey,
        kdf_salt: Option<String>,
    ) -> StoreResult<KeyId> {
        if !role.supports(algorithm) {
            return Err(StoreError::InvalidAlgorithm {
                algorithm: algorithm.to_string(),
                role: role.to_string(),
            });
        }
        let _rotation = self.rotation[role.index()]
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let now = Utc::now();
        let handle = Arc::new(KeyHandle {
            id: KeyId::generate(role, now),
            role,
            algorithm,
            created_at: now,
            material,
        });
        let record = KeyRecord {
            id: handle.id.clone(),
            role,
            algorithm,
            status: KeyStatus::Active,
            created_at: now,
            retired_at: None,
            purged_at: None,
            kdf_salt,
        };
        // New key is durable before the old one is demoted.
        self.persist(&record, Some(&handle))?;

        let previous = read(&self.active[role.index()]).clone();
        let mut keys = write(&self.keys);
        if let Some(prev) = &previous {
            if let Some(entry) = keys.get_mut(prev.id()) {
                let mut retired = entry.record.clone();
                retired.status = KeyStatus::Retired;
                retired.retired_at = Some(now);
                self.persist(&retired, Some(prev))?;
                entry.record = retired;
            }
        }
        keys.insert(
            record.id.clone(),
            KeyEntry {
                record,
                handle: Some(handle.clone()),
            },
        );
        let id = handle.id.clone();
        *write(&self.active[role.index()]) = Some(handle);
        debug!(role = %role, key_id = %id, algorithm = %algorithm, "installed active key");
        Ok(id)
    }

    /// The current key for `role`.
    pub fn get_active_key(&self, role: KeyRole) -> StoreResult<Arc<KeyHandle>> {
        read(&self.active[role.index()])
            .clone()
            .ok_or_else(|| StoreError::KeyNotFound(format!("no active {role} key")))
    }

    /// Lease the current key for `role` for one signing or sealing job.
    pub fn lease_active(&self, role: KeyRole) -> StoreResult<KeyLease> {
        let mut leases = lock_leases(&self.leases);
        let handle = self.get_active_key(role)?;
        *leases.entry(handle.id().clone()).or_insert(0) += 1;
        Ok(KeyLease {
            handle,
            leases: Arc::clone(&self.leases),
        })
    }

    /// Outstanding leases on `id`.
    pub fn leases(&self, id: &KeyId) -> usize {
        lock_leases(&self.leases).get(id).copied().unwrap_or(0)
    }

    /// Any non-purged key by id (active or retired).
    pub fn get_key(&self, id: &KeyId) -> StoreResult<Arc<KeyHandle>> {
        read(&self.keys)
            .get(id)
            .and_then(|e| e.handle.clone())
            .ok_or_else(|| StoreError::KeyNotFound(id.to_string()))
    }

    /// Demote a key to retired.
    ///
    /// Retiring the active key rotates its role first, so a role is never left
    /// without an active key.
    pub fn retire_key(&self, id: &KeyId) -> StoreResult<()> {
        let result = self.retire_inner(id);
        self.audit.record(
            AuditOperation::KeyRetire,
            id.as_str(),
            result.is_ok(),
            result.as_ref().err().map(|e| e.to_string()).unwrap_or_default(),
        );
        result
    }

    fn retire_inner(&self, id: &KeyId) -> StoreResult<()> {
        let record = self
            .record(id)
            .ok_or_else(|| StoreError::KeyNotFound(id.to_string()))?;
        match record.status {
            KeyStatus::Retired => Ok(()),
            KeyStatus::Purged => Err(StoreError::KeyNotFound(id.to_string())),
            KeyStatus::Active => {
                self.rotate_key(record.role)?;
                Ok(())
            }
        }
    }

    /// Destroy a retired key's material.
    ///
    /// Fails with `KeyInUse` while any chunk or manifest references the key, and
    /// for the active key of a role.
    pub fn purge_key(&self, id: &KeyId, refs: &dyn KeyReferences) -> StoreResult<()> {
        let result = self.purge_inner(id, refs);
        self.audit.record(
            AuditOperation::KeyPurge,
            id.as_str(),
            result.is_ok(),
            result.as_ref().err().map(|e| e.to_string()).unwrap_or_default(),
        );
        result
    }

    fn purge_inner(&self, id: &KeyId, refs: &dyn KeyReferences) -> StoreResult<()> {
        let record = self
            .record(id)
            .ok_or_else(|| StoreError::KeyNotFound(id.to_string()))?;
        if record.status == KeyStatus::Purged {
            return Ok(());
        }
        // Leases are counted after the status read: a retired key gains no new ones.
        let references = self.leases(id) + refs.key_references(id)?;
        match record.status {
            KeyStatus::Purged => return Ok(()),
            KeyStatus::Active => {
                return Err(StoreError::KeyInUse {
                    key_id: id.to_string(),
                    references: references + 1,
                })
            }
            KeyStatus::Retired if references > 0 => {
                return Err(StoreError::KeyInUse {
                    key_id: id.to_string(),
                    references,
                })
            }
            KeyStatus::Retired => {}
        }

        let mut purged = record;
        purged.status = KeyStatus::Purged;
        purged.purged_at = Some(Utc::now());
        self.persist(&purged, None)?;
        if let Some(entry) = write(&self.keys).get_mut(id) {
            entry.record = purged;
            entry.handle = None;
        }
        info!(key_id = %id, "purged key material");
        Ok(())
    }

    /// Metadata for one key.
    pub fn record(&self, id: &KeyId) -> Option<KeyRecord> {
        read(&self.keys).get(id).map(|e| e.record.clone())
    }

    /// Metadata for every key, oldest first.
    pub fn list_keys(&self) -> Vec<KeyRecord> {
        let mut records: Vec<KeyRecord> = read(&self.keys).values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    /// Retired keys, candidates for `purge_key`.
    pub fn retired_keys(&self) -> Vec<KeyId> {
        self.list_keys()
            .into_iter()
            .filter(|r| r.status == KeyStatus::Retired)
            .map(|r| r.id)
            .collect()
    }

    /// Roles whose active key is older than `max_age` at `now`.
    pub fn rotation_due(&self, max_age: Duration, now: DateTime<Utc>) -> Vec<KeyRole> {
        KeyRole::ALL
            .into_iter()
            .filter(|role| {
                read(&self.active[role.index()])
                    .as_ref()
                    .is_some_and(|k| now - k.created_at() > max_age)
            })
            .collect()
    }

    fn audit_result(&self, op: AuditOperation, role: KeyRole, result: &StoreResult<KeyId>) {
        match result {
            Ok(id) => self.audit.record(op, id.as_str(), true, role.as_str()),
            Err(e) => self.audit.record(op, role.as_str(), false, e.to_string()),
        };
    }
}

fn open_master(dir: &Path, passphrase: &[u8], kdf_iterations: u32) -> StoreResult<SecretKey> {
    let path = dir.join(MASTER_FILE);
    let (root, created) = match persist::read_optional(&path)? {
        Some(bytes) => {
            let master: MasterFile = serde_json::from_slice(&bytes)?;
            let root = crypto::derive_key(passphrase, &master.salt, master.iterations)?;
            let check_key = crypto::derive_subkey(&root, CHECK_KEY_INFO)?;
            crypto::verify(MASTER_CHECK_MESSAGE, &master.check, &check_key)
                .map_err(|_| StoreError::IntegrityError("wrong master passphrase".to_string()))?;
            (root, false)
        }
        None => {
            let salt = crypto::random_salt();
            let root = crypto::derive_key(passphrase, &salt, kdf_iterations)?;
            let check_key = crypto::derive_subkey(&root, CHECK_KEY_INFO)?;
            let master = MasterFile {
                salt,
                iterations: kdf_iterations,
                check: crypto::sign(MASTER_CHECK_MESSAGE, &check_key)?,
            };
            persist::write_atomic(&path, &serde_json::to_vec_pretty(&master)?)?;
            (root, true)
        }
    };
    debug!(dir = %dir.display(), created, "master key ready");
    crypto::derive_subkey(&root, WRAP_KEY_INFO)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
