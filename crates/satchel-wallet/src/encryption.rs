//! Password-based AES-256-GCM encryption of vault material.
//!
//! # Blob layout
//! ```text
//! header   = "satchel-vault" || schema_version || m_cost || t_cost || p_cost || salt
//! sealed   = AES-256-GCM(key, nonce, plaintext, aad = header)
//! checksum = SHA-256(header || nonce || sealed)
//! ```
//! All integers are little-endian `u32`. The header travels in clear so an
//! older engine can refuse a newer blob, and is bound to the ciphertext as
//! associated data so it cannot be swapped. The checksum lets
//! [`verify_integrity`] detect corruption without the password.
//!
//! # Schema versions
//! - **v1**: BLAKE3 `derive_key` over password and salt. Read-only; blobs are
//!   re-sealed as v2 the next time they are written.
//! - **v2**: Argon2id with the work factor stored in the header.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Legacy BLAKE3 key derivation.
pub const SCHEMA_V1: u32 = 1;
/// Argon2id key derivation.
pub const SCHEMA_V2: u32 = 2;
/// Version written by [`seal`] and [`reencrypt`].
pub const CURRENT_SCHEMA_VERSION: u32 = SCHEMA_V2;

/// BLAKE3 KDF context for v1 password-derived keys.
const PASSWORD_KDF_CONTEXT_V1: &str = "satchel-vault-password-kdf-v1";

const HEADER_MAGIC: &[u8] = b"satchel-vault";

/// Salt length in bytes.
pub const SALT_LEN: usize = 32;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Largest Argon2 memory cost accepted from a blob header, in KiB (1 GiB).
pub const MAX_M_COST: u32 = 1 << 20;
/// Largest Argon2 pass count accepted from a blob header.
pub const MAX_T_COST: u32 = 64;
/// Largest Argon2 parallelism accepted from a blob header.
pub const MAX_P_COST: u32 = 16;

/// Argon2id work factor. Stored in every v2 blob so old blobs keep
/// decrypting after the default changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub m_cost: u32,
    /// Number of passes.
    pub t_cost: u32,
    /// Degree of parallelism.
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_cost: 65_536,
            t_cost: 3,
            p_cost: 1,
        }
    }
}

impl KdfParams {
    /// Minimal work factor. Only for tests and benchmarks.
    pub fn fast_insecure() -> Self {
        Self {
            m_cost: 8,
            t_cost: 1,
            p_cost: 1,
        }
    }

    /// Refuse work factors above [`MAX_M_COST`], [`MAX_T_COST`] or
    /// [`MAX_P_COST`]. Header fields are read before the password is
    /// checked, so they must not dictate unbounded work.
    pub fn check_bounds(&self) -> Result<(), CryptoError> {
        if self.m_cost > MAX_M_COST || self.t_cost > MAX_T_COST || self.p_cost > MAX_P_COST {
            return Err(CryptoError::Kdf(format!(
                "work factor m={} t={} p={} exceeds m={MAX_M_COST} t={MAX_T_COST} p={MAX_P_COST}",
                self.m_cost, self.t_cost, self.p_cost
            )));
        }
        Ok(())
    }
}

/// The durable unit for all stored secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub schema_version: u32,
    pub kdf: KdfParams,
    #[serde(with = "hex::serde")]
    pub salt: [u8; SALT_LEN],
    #[serde(with = "hex::serde")]
    pub nonce: [u8; NONCE_LEN],
    /// Ciphertext including the GCM tag.
    #[serde(with = "hex::serde")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub checksum: [u8; 32],
}

impl EncryptedBlob {
    fn header(&self) -> Vec<u8> {
        header_bytes(self.schema_version, &self.kdf, &self.salt)
    }

    fn compute_checksum(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.header());
        hasher.update(self.nonce);
        hasher.update(&self.ciphertext);
        hasher.finalize().into()
    }
}

fn header_bytes(schema_version: u32, kdf: &KdfParams, salt: &[u8; SALT_LEN]) -> Vec<u8> {
    let mut header = Vec::with_capacity(HEADER_MAGIC.len() + 16 + SALT_LEN);
    header.extend_from_slice(HEADER_MAGIC);
    header.extend_from_slice(&schema_version.to_le_bytes());
    header.extend_from_slice(&kdf.m_cost.to_le_bytes());
    header.extend_from_slice(&kdf.t_cost.to_le_bytes());
    header.extend_from_slice(&kdf.p_cost.to_le_bytes());
    header.extend_from_slice(salt);
    header
}

/// A derived encryption key kept while the vault is unlocked, so material
/// can be re-sealed without asking for the password again.
pub struct SessionKey {
    key: Zeroizing<[u8; 32]>,
    schema_version: u32,
    kdf: KdfParams,
    salt: [u8; SALT_LEN],
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("schema_version", &self.schema_version)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl SessionKey {
    /// Derive the key for `password` under the given header parameters.
    pub fn derive(
        password: &[u8],
        schema_version: u32,
        kdf: KdfParams,
        salt: [u8; SALT_LEN],
    ) -> Result<Self, CryptoError> {
        let mut key = Zeroizing::new([0u8; 32]);
        match schema_version {
            SCHEMA_V1 => {
                let mut ikm = Zeroizing::new(Vec::with_capacity(password.len() + SALT_LEN));
                ikm.extend_from_slice(password);
                ikm.extend_from_slice(&salt);
                *key = blake3::derive_key(PASSWORD_KDF_CONTEXT_V1, &ikm);
            }
            SCHEMA_V2 => {
                kdf.check_bounds()?;
                let params = Params::new(kdf.m_cost, kdf.t_cost, kdf.p_cost, Some(32))
                    .map_err(|e| CryptoError::Kdf(e.to_string()))?;
                Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
                    .hash_password_into(password, &salt, &mut key[..])
                    .map_err(|e| CryptoError::Kdf(e.to_string()))?;
            }
            found => return Err(unsupported(found)),
        }
        Ok(Self {
            key,
            schema_version,
            kdf,
            salt,
        })
    }

    /// Derive a fresh current-schema key with a new random salt.
    pub fn fresh(password: &[u8], kdf: &KdfParams) -> Result<Self, CryptoError> {
        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        Self::derive(password, CURRENT_SCHEMA_VERSION, *kdf, salt)
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Encrypt `plaintext` under this key with a fresh nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<EncryptedBlob, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let header = header_bytes(self.schema_version, &self.kdf, &self.salt);
        let cipher = Aes256Gcm::new_from_slice(&self.key[..])
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &header,
                },
            )
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;

        let mut blob = EncryptedBlob {
            schema_version: self.schema_version,
            kdf: self.kdf,
            salt: self.salt,
            nonce,
            ciphertext,
            checksum: [0u8; 32],
        };
        blob.checksum = blob.compute_checksum();
        Ok(blob)
    }

    /// Decrypt a blob sealed under this key. The caller must already have
    /// checked schema and integrity.
    fn open(&self, blob: &EncryptedBlob) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key[..])
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;
        cipher
            .decrypt(
                Nonce::from_slice(&blob.nonce),
                Payload {
                    msg: &blob.ciphertext,
                    aad: &blob.header(),
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::WrongPassword)
    }
}

fn unsupported(found: u32) -> CryptoError {
    if found > CURRENT_SCHEMA_VERSION {
        CryptoError::SchemaUnsupported {
            found,
            supported: CURRENT_SCHEMA_VERSION,
        }
    } else {
        CryptoError::Corrupted(format!("unknown schema version {found}"))
    }
}

/// Encrypt `material` under `password`, with a fresh salt and nonce.
pub fn seal(
    material: &[u8],
    password: &[u8],
    params: &KdfParams,
) -> Result<EncryptedBlob, CryptoError> {
    SessionKey::fresh(password, params)?.seal(material)
}

/// Cheap, non-decrypting integrity check.
pub fn verify_integrity(blob: &EncryptedBlob) -> bool {
    blob.ciphertext.len() >= TAG_LEN && blob.compute_checksum() == blob.checksum
}

/// Decrypt `blob` and also return the derived key for later re-sealing.
///
/// Checks run in order: schema version, integrity checksum, authentication.
/// Only the last one can report [`CryptoError::WrongPassword`].
pub fn unlock_with_session(
    blob: &EncryptedBlob,
    password: &[u8],
) -> Result<(Zeroizing<Vec<u8>>, SessionKey), CryptoError> {
    if !matches!(blob.schema_version, SCHEMA_V1 | SCHEMA_V2) {
        return Err(unsupported(blob.schema_version));
    }
    if !verify_integrity(blob) {
        return Err(CryptoError::Corrupted("integrity checksum mismatch".into()));
    }
    let session = SessionKey::derive(password, blob.schema_version, blob.kdf, blob.salt)?;
    let plaintext = session.open(blob)?;
    Ok((plaintext, session))
}

/// Decrypt `blob` with `password`. The returned buffer is zeroized on drop.
pub fn unlock(blob: &EncryptedBlob, password: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    unlock_with_session(blob, password).map(|(plaintext, _)| plaintext)
}

/// Decrypt with `old` and seal again under `new` with a fresh salt and nonce.
///
/// The result always uses the current schema.
pub fn reencrypt(
    blob: &EncryptedBlob,
    old: &[u8],
    new: &[u8],
    params: &KdfParams,
) -> Result<EncryptedBlob, CryptoError> {
    let plaintext = unlock(blob, old)?;
    seal(&plaintext, new, params)
}

/// Seal with the legacy v1 KDF, for exercising the upgrade path.
#[cfg(test)]
pub(crate) fn seal_v1(material: &[u8], password: &[u8]) -> Result<EncryptedBlob, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    SessionKey::derive(password, SCHEMA_V1, KdfParams::default(), salt)?.seal(material)
}
