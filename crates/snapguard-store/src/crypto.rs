//! Stateless crypto primitives: AES-256-GCM / ChaCha20-Poly1305 AEAD,
//! HMAC-SHA256 signing, PBKDF2 and HKDF key derivation.
//!
//! Nothing in here knows about chunks or manifests; callers pass the key and
//! algorithm explicitly.

use crate::error::{StoreError, StoreResult};
use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

/// Size of every symmetric key handled by the engine.
pub const KEY_SIZE: usize = 32;
/// PBKDF2 iteration floor.
pub const MIN_KDF_ITERATIONS: u32 = 100_000;
/// Salt length for passphrase derivation.
pub const SALT_SIZE: usize = 16;

/// 256-bit secret key material.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_SIZE]);

impl SecretKey {
    /// Fresh key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        SecretKey(bytes)
    }

    /// Wrap raw bytes. The caller's copy is not zeroized.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        SecretKey(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

/// 96-bit (12-byte) nonce for AEAD ciphers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nonce(pub [u8; 12]);

/// 128-bit AEAD authentication tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthTag(pub [u8; 16]);

/// HMAC-SHA256 output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub [u8; 32]);

/// Algorithm tag carried by every key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    /// AES-256-GCM, hardware accelerated on x86 with AES-NI
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    /// ChaCha20-Poly1305, constant-time and fast without AES-NI
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
    /// HMAC-SHA256 message authentication (signing keys only)
    #[serde(rename = "hmac-sha256")]
    HmacSha256,
}

impl Algorithm {
    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Aes256Gcm => "aes-256-gcm",
            Algorithm::ChaCha20Poly1305 => "chacha20-poly1305",
            Algorithm::HmacSha256 => "hmac-sha256",
        }
    }

    /// True for the AEAD ciphers.
    pub fn is_aead(&self) -> bool {
        !matches!(self, Algorithm::HmacSha256)
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Algorithm {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aes-256-gcm" => Ok(Algorithm::Aes256Gcm),
            "chacha20-poly1305" => Ok(Algorithm::ChaCha20Poly1305),
            "hmac-sha256" => Ok(Algorithm::HmacSha256),
            _ => Err(StoreError::InvalidAlgorithm {
                algorithm: s.to_string(),
                role: "any".to_string(),
            }),
        }
    }
}

/// Output of an AEAD seal: ciphertext with the tag split off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sealed {
    /// Ciphertext, same length as the plaintext
    pub ciphertext: Vec<u8>,
    /// Nonce used for this encryption operation
    pub nonce: Nonce,
    /// Authentication tag
    pub tag: AuthTag,
}

/// Generate a cryptographically random 12-byte nonce
pub fn random_nonce() -> Nonce {
    let mut bytes = [0u8; 12];
    OsRng.fill_bytes(&mut bytes);
    Nonce(bytes)
}

/// Generate a random PBKDF2 salt.
pub fn random_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

fn auth_failed() -> StoreError {
    StoreError::IntegrityError("authentication tag mismatch".to_string())
}

fn not_aead(algo: Algorithm) -> StoreError {
    StoreError::InvalidAlgorithm {
        algorithm: algo.to_string(),
        role: "encryption".to_string(),
    }
}

/// Encrypt plaintext under `key`. A fresh nonce is drawn for every call.
pub fn encrypt(plaintext: &[u8], key: &SecretKey, algo: Algorithm) -> StoreResult<Sealed> {
    encrypt_with_aad(plaintext, b"", key, algo)
}

/// Encrypt with associated data that must be presented again on decrypt.
pub fn encrypt_with_aad(
    plaintext: &[u8],
    aad: &[u8],
    key: &SecretKey,
    algo: Algorithm,
) -> StoreResult<Sealed> {
    let nonce = random_nonce();
    let mut buffer = plaintext.to_vec();
    let tag = match algo {
        Algorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
                .map_err(|e| StoreError::EncryptionFailed(e.to_string()))?;
            cipher
                .encrypt_in_place_detached(aes_gcm::Nonce::from_slice(&nonce.0), aad, &mut buffer)
                .map_err(|e| StoreError::EncryptionFailed(e.to_string()))?
        }
        Algorithm::ChaCha20Poly1305 => {
            use chacha20poly1305::KeyInit as _;
            let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
                .map_err(|e| StoreError::EncryptionFailed(e.to_string()))?;
            cipher
                .encrypt_in_place_detached(
                    chacha20poly1305::Nonce::from_slice(&nonce.0),
                    aad,
                    &mut buffer,
                )
                .map_err(|e| StoreError::EncryptionFailed(e.to_string()))?
        }
        Algorithm::HmacSha256 => return Err(not_aead(algo)),
    };
    let mut tag_bytes = [0u8; 16];
    tag_bytes.copy_from_slice(tag.as_slice());
    Ok(Sealed {
        ciphertext: buffer,
        nonce,
        tag: AuthTag(tag_bytes),
    })
}

/// Decrypt and authenticate. Returns `IntegrityError` if the tag does not verify.
pub fn decrypt(sealed: &Sealed, key: &SecretKey, algo: Algorithm) -> StoreResult<Vec<u8>> {
    decrypt_with_aad(sealed, b"", key, algo)
}

/// Decrypt with associated data.
pub fn decrypt_with_aad(
    sealed: &Sealed,
    aad: &[u8],
    key: &SecretKey,
    algo: Algorithm,
) -> StoreResult<Vec<u8>> {
    let mut buffer = sealed.ciphertext.clone();
    match algo {
        Algorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
                .map_err(|e| StoreError::EncryptionFailed(e.to_string()))?;
            cipher
                .decrypt_in_place_detached(
                    aes_gcm::Nonce::from_slice(&sealed.nonce.0),
                    aad,
                    &mut buffer,
                    aes_gcm::Tag::from_slice(&sealed.tag.0),
                )
                .map_err(|_| auth_failed())?;
        }
        Algorithm::ChaCha20Poly1305 => {
            use chacha20poly1305::KeyInit as _;
            let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
                .map_err(|e| StoreError::EncryptionFailed(e.to_string()))?;
            cipher
                .decrypt_in_place_detached(
                    chacha20poly1305::Nonce::from_slice(&sealed.nonce.0),
                    aad,
                    &mut buffer,
                    chacha20poly1305::Tag::from_slice(&sealed.tag.0),
                )
                .map_err(|_| auth_failed())?;
        }
        Algorithm::HmacSha256 => return Err(not_aead(algo)),
    }
    Ok(buffer)
}

/// HMAC-SHA256 over `data`.
pub fn sign(data: &[u8], key: &SecretKey) -> StoreResult<Signature> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        .map_err(|e| StoreError::EncryptionFailed(e.to_string()))?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(Signature(out))
}

/// Constant-time HMAC-SHA256 verification.
pub fn verify(data: &[u8], signature: &Signature, key: &SecretKey) -> StoreResult<()> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        .map_err(|e| StoreError::EncryptionFailed(e.to_string()))?;
    mac.update(data);
    mac.verify_slice(&signature.0)
        .map_err(|_| StoreError::IntegrityError("signature mismatch".to_string()))
}

/// PBKDF2-HMAC-SHA256 passphrase derivation.
pub fn derive_key(passphrase: &[u8], salt: &[u8], iterations: u32) -> StoreResult<SecretKey> {
    if iterations < MIN_KDF_ITERATIONS {
        return Err(StoreError::InvalidConfig {
            field: "crypto.kdf_iterations".to_string(),
            reason: format!("{iterations} is below the minimum of {MIN_KDF_ITERATIONS}"),
        });
    }
    let mut okm = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase, salt, iterations, &mut okm);
    let key = SecretKey::from_bytes(okm);
    okm.zeroize();
    Ok(key)
}

/// Derive a purpose-bound subkey from a root key using HKDF-SHA256.
pub fn derive_subkey(root: &SecretKey, info: &[u8]) -> StoreResult<SecretKey> {
    let hk = Hkdf::<Sha256>::new(None, root.as_bytes());
    let mut okm = [0u8; KEY_SIZE];
    hk.expand(info, &mut okm)
        .map_err(|e| StoreError::EncryptionFailed(format!("HKDF expand failed: {e}")))?;
    let key = SecretKey::from_bytes(okm);
    okm.zeroize();
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_key() -> SecretKey {
        SecretKey::from_bytes([42u8; 32])
    }

    proptest! {
        #[test]
        fn prop_aesgcm_roundtrip(data in prop::collection::vec(0u8..=255, 0..65_536)) {
            let key = test_key();
            let sealed = encrypt(&data, &key, Algorithm::Aes256Gcm).unwrap();
            prop_assert_eq!(decrypt(&sealed, &key, Algorithm::Aes256Gcm).unwrap(), data);
        }

        #[test]
        fn prop_chacha_roundtrip(data in prop::collection::vec(0u8..=255, 0..65_536)) {
            let key = test_key();
            let sealed = encrypt(&data, &key, Algorithm::ChaCha20Poly1305).unwrap();
            prop_assert_eq!(decrypt(&sealed, &key, Algorithm::ChaCha20Poly1305).unwrap(), data);
        }
    }

    #[test]
    fn ciphertext_length_matches_plaintext() {
        let sealed = encrypt(b"secret", &test_key(), Algorithm::Aes256Gcm).unwrap();
        assert_eq!(sealed.ciphertext.len(), 6);
        assert_ne!(sealed.ciphertext, b"secret");
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = test_key();
        let mut sealed = encrypt(b"secret", &key, Algorithm::Aes256Gcm).unwrap();
        sealed.ciphertext[0] ^= 0xff;
        assert!(matches!(
            decrypt(&sealed, &key, Algorithm::Aes256Gcm),
            Err(StoreError::IntegrityError(_))
        ));
    }

    #[test]
    fn tampered_tag_fails() {
        let key = test_key();
        let mut sealed = encrypt(b"secret", &key, Algorithm::ChaCha20Poly1305).unwrap();
        sealed.tag.0[15] ^= 0x01;
        assert!(matches!(
            decrypt(&sealed, &key, Algorithm::ChaCha20Poly1305),
            Err(StoreError::IntegrityError(_))
        ));
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = encrypt(b"secret", &test_key(), Algorithm::Aes256Gcm).unwrap();
        let wrong = SecretKey::from_bytes([99u8; 32]);
        assert!(matches!(
            decrypt(&sealed, &wrong, Algorithm::Aes256Gcm),
            Err(StoreError::IntegrityError(_))
        ));
    }

    #[test]
    fn aad_is_bound() {
        let key = test_key();
        let sealed = encrypt_with_aad(b"secret", b"chunk-a", &key, Algorithm::Aes256Gcm).unwrap();
        assert!(decrypt_with_aad(&sealed, b"chunk-a", &key, Algorithm::Aes256Gcm).is_ok());
        assert!(decrypt_with_aad(&sealed, b"chunk-b", &key, Algorithm::Aes256Gcm).is_err());
    }

    #[test]
    fn nonces_are_fresh() {
        let key = test_key();
        let a = encrypt(b"same", &key, Algorithm::Aes256Gcm).unwrap();
        let b = encrypt(b"same", &key, Algorithm::Aes256Gcm).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn hmac_algorithm_cannot_encrypt() {
        assert!(matches!(
            encrypt(b"x", &test_key(), Algorithm::HmacSha256),
            Err(StoreError::InvalidAlgorithm { .. })
        ));
    }

    #[test]
    fn sign_verify() {
        let key = test_key();
        let sig = sign(b"manifest bytes", &key).unwrap();
        assert!(verify(b"manifest bytes", &sig, &key).is_ok());
        assert!(verify(b"manifest bytez", &sig, &key).is_err());
        let other = SecretKey::from_bytes([7u8; 32]);
        assert!(verify(b"manifest bytes", &sig, &other).is_err());
    }

    #[test]
    fn pbkdf2_is_deterministic_and_salted() {
        let a = derive_key(b"correct horse", b"salt-one", MIN_KDF_ITERATIONS).unwrap();
        let b = derive_key(b"correct horse", b"salt-one", MIN_KDF_ITERATIONS).unwrap();
        let c = derive_key(b"correct horse", b"salt-two", MIN_KDF_ITERATIONS).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn pbkdf2_rejects_low_iterations() {
        assert!(matches!(
            derive_key(b"pw", b"salt", 1000),
            Err(StoreError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn subkeys_differ_by_info() {
        let root = test_key();
        let a = derive_subkey(&root, b"wrap").unwrap();
        let b = derive_subkey(&root, b"check").unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.as_bytes(), derive_subkey(&root, b"wrap").unwrap().as_bytes());
    }

    #[test]
    fn algorithm_parsing() {
        assert_eq!("AES-256-GCM".parse::<Algorithm>().unwrap(), Algorithm::Aes256Gcm);
        assert_eq!(
            "chacha20-poly1305".parse::<Algorithm>().unwrap(),
            Algorithm::ChaCha20Poly1305
        );
        assert!("rot13".parse::<Algorithm>().is_err());
        assert_eq!(Algorithm::HmacSha256.to_string(), "hmac-sha256");
    }
}
