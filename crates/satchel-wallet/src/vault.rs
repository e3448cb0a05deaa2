//! The single access point for decrypted secrets.
//!
//! A [`Vault`] owns the sealed [`EncryptedBlob`] and, while unlocked, the
//! decrypted [`VaultMaterial`] together with the derived session key. All
//! access goes through one mutex, so at most one unlock, seal or update runs
//! at a time. Locking drops the material, which zeroizes it.

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::encryption::{
    self, EncryptedBlob, KdfParams, SessionKey, CURRENT_SCHEMA_VERSION,
};
use crate::error::{CryptoError, WalletError};

/// A single imported private key in WIF form.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ImportedKey {
    /// Index of the account that owns this key.
    pub account: u32,
    pub wif: String,
}

/// Everything secret the wallet knows.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct VaultMaterial {
    /// BIP-39 phrase, normalized.
    pub mnemonic: String,
    /// Optional BIP-39 passphrase.
    #[serde(default)]
    pub passphrase: String,
    #[serde(default)]
    pub imported_keys: Vec<ImportedKey>,
}

impl VaultMaterial {
    pub fn new(mnemonic: impl Into<String>, passphrase: impl Into<String>) -> Self {
        Self {
            mnemonic: mnemonic.into(),
            passphrase: passphrase.into(),
            imported_keys: Vec::new(),
        }
    }

    /// WIF of the key imported into `account`, if any.
    pub fn imported_key(&self, account: u32) -> Option<&str> {
        self.imported_keys
            .iter()
            .find(|k| k.account == account)
            .map(|k| k.wif.as_str())
    }

    fn encode(&self) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        serde_json::to_vec(self)
            .map(Zeroizing::new)
            .map_err(|e| CryptoError::Payload(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, CryptoError> {
        serde_json::from_slice(bytes).map_err(|e| CryptoError::Payload(e.to_string()))
    }
}

impl fmt::Debug for VaultMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultMaterial")
            .field("mnemonic", &"[REDACTED]")
            .field("passphrase", &"[REDACTED]")
            .field("imported_keys", &self.imported_keys.len())
            .finish()
    }
}

impl fmt::Debug for ImportedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportedKey")
            .field("account", &self.account)
            .field("wif", &"[REDACTED]")
            .finish()
    }
}

struct Unlocked {
    material: VaultMaterial,
    key: SessionKey,
}

struct VaultState {
    blob: EncryptedBlob,
    unlocked: Option<Unlocked>,
}

/// Sealed secret storage with an unlocked session.
pub struct Vault {
    state: Mutex<VaultState>,
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault")
            .field("unlocked", &self.is_unlocked())
            .finish()
    }
}

impl Vault {
    /// Seal `material` under `password` and keep the vault unlocked.
    pub fn create(
        material: VaultMaterial,
        password: &[u8],
        kdf: &KdfParams,
    ) -> Result<Self, WalletError> {
        let key = SessionKey::fresh(password, kdf)?;
        let blob = key.seal(&material.encode()?)?;
        info!(schema = blob.schema_version, "vault created");
        Ok(Self {
            state: Mutex::new(VaultState {
                blob,
                unlocked: Some(Unlocked { material, key }),
            }),
        })
    }

    /// Wrap an existing blob. The vault starts locked.
    pub fn from_blob(blob: EncryptedBlob) -> Self {
        Self {
            state: Mutex::new(VaultState {
                blob,
                unlocked: None,
            }),
        }
    }

    /// Current sealed form, suitable for persisting.
    pub fn blob(&self) -> EncryptedBlob {
        self.state.lock().blob.clone()
    }

    pub fn is_unlocked(&self) -> bool {
        self.state.lock().unlocked.is_some()
    }

    /// Cheap integrity check of the sealed blob.
    pub fn verify_integrity(&self) -> bool {
        encryption::verify_integrity(&self.state.lock().blob)
    }

    /// Decrypt the blob and hold the material in memory.
    ///
    /// Blobs written with an older schema are re-sealed under the current
    /// schema with `kdf` before returning.
    pub fn unlock(&self, password: &[u8], kdf: &KdfParams) -> Result<(), WalletError> {
        let mut state = self.state.lock();
        let (plaintext, mut key) = encryption::unlock_with_session(&state.blob, password)?;
        let material = VaultMaterial::decode(&plaintext)?;

        if key.schema_version() < CURRENT_SCHEMA_VERSION {
            let from = key.schema_version();
            key = SessionKey::fresh(password, kdf)?;
            state.blob = key.seal(&plaintext)?;
            info!(from, to = CURRENT_SCHEMA_VERSION, "vault schema upgraded");
        }

        state.unlocked = Some(Unlocked { material, key });
        debug!("vault unlocked");
        Ok(())
    }

    /// Drop decrypted material and the session key.
    pub fn lock(&self) {
        let mut state = self.state.lock();
        if state.unlocked.take().is_some() {
            debug!("vault locked");
        }
    }

    /// Run `f` against the decrypted material.
    pub fn with_material<T>(
        &self,
        f: impl FnOnce(&VaultMaterial) -> Result<T, WalletError>,
    ) -> Result<T, WalletError> {
        let state = self.state.lock();
        let unlocked = state.unlocked.as_ref().ok_or(WalletError::Locked)?;
        f(&unlocked.material)
    }

    /// Mutate the material and re-seal it with a fresh nonce.
    ///
    /// `f` works on a copy; nothing changes if it or the re-seal fails.
    pub fn update_material<T>(
        &self,
        f: impl FnOnce(&mut VaultMaterial) -> Result<T, WalletError>,
    ) -> Result<T, WalletError> {
        let mut state = self.state.lock();
        let unlocked = state.unlocked.as_mut().ok_or(WalletError::Locked)?;
        let mut draft = unlocked.material.clone();
        let out = f(&mut draft)?;
        let blob = unlocked.key.seal(&draft.encode()?)?;
        unlocked.material = draft;
        state.blob = blob;
        debug!("vault material re-sealed");
        Ok(out)
    }

    /// Re-encrypt under `new` with a fresh salt. Verifies `old` first.
    pub fn change_password(
        &self,
        old: &[u8],
        new: &[u8],
        kdf: &KdfParams,
    ) -> Result<(), WalletError> {
        let mut state = self.state.lock();
        let plaintext = encryption::unlock(&state.blob, old)?;
        let key = SessionKey::fresh(new, kdf)?;
        state.blob = key.seal(&plaintext)?;
        if let Some(unlocked) = state.unlocked.as_mut() {
            unlocked.key = key;
        }
        info!("vault password changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kdf() -> KdfParams {
        KdfParams::fast_insecure()
    }

    fn material() -> VaultMaterial {
        VaultMaterial::new("legal winner thank year wave sausage worth useful legal winner thank yellow", "")
    }

    #[test]
    fn create_is_unlocked_and_sealed() {
        let vault = Vault::create(material(), b"pw", &kdf()).unwrap();
        assert!(vault.is_unlocked());
        assert!(vault.verify_integrity());
        let words = vault.with_material(|m| Ok(m.mnemonic.clone())).unwrap();
        assert!(words.starts_with("legal winner"));
    }

    #[test]
    fn locked_vault_refuses_access() {
        let vault = Vault::create(material(), b"pw", &kdf()).unwrap();
        vault.lock();
        assert!(!vault.is_unlocked());
        assert_eq!(
            vault.with_material(|_| Ok(())).unwrap_err(),
            WalletError::Locked
        );
        assert_eq!(
            vault.update_material(|_| Ok(())).unwrap_err(),
            WalletError::Locked
        );
    }

    #[test]
    fn wrong_password_keeps_vault_locked() {
        let vault = Vault::from_blob(Vault::create(material(), b"pw", &kdf()).unwrap().blob());
        let err = vault.unlock(b"nope", &kdf()).unwrap_err();
        assert_eq!(err, WalletError::Crypto(CryptoError::WrongPassword));
        assert!(!vault.is_unlocked());
        vault.unlock(b"pw", &kdf()).unwrap();
        assert!(vault.is_unlocked());
    }

    #[test]
    fn update_material_persists_in_blob() {
        let vault = Vault::create(material(), b"pw", &kdf()).unwrap();
        let before = vault.blob();
        vault
            .update_material(|m| {
                m.imported_keys.push(ImportedKey {
                    account: 3,
                    wif: "KwDiBf89QgGbjEhKnhXJuH7LrciVrZi3qYjgd9M7rFU73sVHnoWn".into(),
                });
                Ok(())
            })
            .unwrap();
        let after = vault.blob();
        assert_ne!(before.nonce, after.nonce);

        let reopened = Vault::from_blob(after);
        reopened.unlock(b"pw", &kdf()).unwrap();
        let wif = reopened
            .with_material(|m| Ok(m.imported_key(3).map(str::to_string)))
            .unwrap();
        assert!(wif.is_some());
    }

    #[test]
    fn failed_update_changes_nothing() {
        let vault = Vault::create(material(), b"pw", &kdf()).unwrap();
        let before = vault.blob();
        let err = vault
            .update_material(|m| -> Result<(), WalletError> {
                m.passphrase = "changed".into();
                Err(WalletError::InvalidAmount("abort".into()))
            })
            .unwrap_err();
        assert!(matches!(err, WalletError::InvalidAmount(_)));
        assert_eq!(vault.blob(), before);
        let passphrase = vault.with_material(|m| Ok(m.passphrase.clone())).unwrap();
        assert!(passphrase.is_empty());
    }

    #[test]
    fn change_password_invalidates_old() {
        let vault = Vault::create(material(), b"old", &kdf()).unwrap();
        assert!(vault.change_password(b"wrong", b"new", &kdf()).is_err());
        vault.change_password(b"old", b"new", &kdf()).unwrap();
        assert!(vault.is_unlocked());

        let reopened = Vault::from_blob(vault.blob());
        assert!(reopened.unlock(b"old", &kdf()).is_err());
        reopened.unlock(b"new", &kdf()).unwrap();
    }

    #[test]
    fn updates_after_password_change_use_new_key() {
        let vault = Vault::create(material(), b"old", &kdf()).unwrap();
        vault.change_password(b"old", b"new", &kdf()).unwrap();
        vault
            .update_material(|m| {
                m.passphrase = "extra".into();
                Ok(())
            })
            .unwrap();
        let reopened = Vault::from_blob(vault.blob());
        reopened.unlock(b"new", &kdf()).unwrap();
        let passphrase = reopened.with_material(|m| Ok(m.passphrase.clone())).unwrap();
        assert_eq!(passphrase, "extra");
    }

    #[test]
    fn v1_blob_upgraded_on_unlock() {
        let plain = serde_json::to_vec(&material()).unwrap();
        let legacy = encryption::seal_v1(&plain, b"pw").unwrap();
        let vault = Vault::from_blob(legacy);
        vault.unlock(b"pw", &kdf()).unwrap();
        assert_eq!(vault.blob().schema_version, CURRENT_SCHEMA_VERSION);

        let reopened = Vault::from_blob(vault.blob());
        reopened.unlock(b"pw", &kdf()).unwrap();
        assert_eq!(
            reopened.with_material(|m| Ok(m.clone())).unwrap(),
            material()
        );
    }

    #[test]
    fn debug_output_is_redacted() {
        let m = material();
        let debug = format!("{m:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("legal"));
        let vault = Vault::create(m, b"pw", &kdf()).unwrap();
        assert!(format!("{vault:?}").contains("unlocked: true"));
    }
}
