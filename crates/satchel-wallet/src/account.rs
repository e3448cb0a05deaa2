//! Accounts and their append-only address pools.
//!
//! Addresses are derived from an account plus `(change, index)` and never
//! removed, so an index always re-derives to the same script. Only the
//! `used` flag of an [`AddressRecord`] ever changes.

use bitcoin::bip32::{DerivationPath, Fingerprint, Xpub};
use bitcoin::PublicKey;
use serde::{Deserialize, Serialize};
use tracing::debug;

use satchel_core::address::{single_sig_address, AddressType, GeneratedAddress, Network, ScriptType};

use crate::error::WalletError;
use crate::keys::{branch_path, KeyNode, KeyOrigin};
use crate::multisig::{derive_address, MultisigConfig};

/// What an account's keys come from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AccountKind {
    /// HD account from this wallet's seed. Only the account xpub is kept.
    SingleSig {
        address_type: AddressType,
        xpub: Xpub,
        fingerprint: Fingerprint,
        path: DerivationPath,
    },
    /// m-of-n account over co-signer xpubs.
    Multisig(MultisigConfig),
    /// One imported private key. The key itself lives in the vault.
    ImportedKey {
        address_type: AddressType,
        public_key: PublicKey,
    },
}

/// One generated address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub script_type: ScriptType,
    pub index: u32,
    pub change: bool,
    pub used: bool,
    /// Encoded address string.
    pub address: String,
}

/// Everything needed to build and sign spends from one address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressInfo {
    pub generated: GeneratedAddress,
    /// Keys in script order. Origins are absent for imported keys.
    pub keys: Vec<(PublicKey, Option<KeyOrigin>)>,
    /// Signatures needed to spend.
    pub required: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub index: u32,
    pub kind: AccountKind,
    #[serde(default)]
    pub receive: Vec<AddressRecord>,
    #[serde(default)]
    pub change: Vec<AddressRecord>,
}

impl Account {
    /// HD account rooted at `account_node` (an account-level node).
    pub fn single_sig(index: u32, address_type: AddressType, account_node: &KeyNode) -> Self {
        let origin = account_node.origin();
        Self::with_kind(
            index,
            AccountKind::SingleSig {
                address_type,
                xpub: *account_node.xpub(),
                fingerprint: origin.fingerprint,
                path: origin.path.clone(),
            },
        )
    }

    pub fn multisig(index: u32, config: MultisigConfig) -> Self {
        Self::with_kind(index, AccountKind::Multisig(config))
    }

    pub fn imported(index: u32, address_type: AddressType, public_key: PublicKey) -> Self {
        Self::with_kind(
            index,
            AccountKind::ImportedKey {
                address_type,
                public_key,
            },
        )
    }

    fn with_kind(index: u32, kind: AccountKind) -> Self {
        Self {
            index,
            kind,
            receive: Vec::new(),
            change: Vec::new(),
        }
    }

    pub fn script_type(&self) -> ScriptType {
        match &self.kind {
            AccountKind::SingleSig { address_type, .. }
            | AccountKind::ImportedKey { address_type, .. } => address_type.script_type(),
            AccountKind::Multisig(config) => config.address_type.script_type(),
        }
    }

    /// Signatures needed to spend from this account.
    pub fn required_signatures(&self) -> usize {
        match &self.kind {
            AccountKind::Multisig(config) => config.m,
            _ => 1,
        }
    }

    /// Re-derive the script and key metadata for `(change, index)`.
    pub fn address_info(
        &self,
        index: u32,
        is_change: bool,
        network: Network,
    ) -> Result<AddressInfo, WalletError> {
        match &self.kind {
            AccountKind::SingleSig {
                address_type,
                xpub,
                fingerprint,
                path,
            } => {
                let account = KeyNode::from_xpub(
                    *xpub,
                    KeyOrigin {
                        fingerprint: *fingerprint,
                        path: path.clone(),
                    },
                );
                let child = account.derive_path(&branch_path(is_change, index)?)?;
                let public_key = child.public_key();
                Ok(AddressInfo {
                    generated: single_sig_address(&public_key, *address_type, network)?,
                    keys: vec![(public_key, Some(child.origin().clone()))],
                    required: 1,
                })
            }
            AccountKind::Multisig(config) => {
                let derived = derive_address(config, index, is_change, network)?;
                Ok(AddressInfo {
                    generated: derived.generated,
                    keys: derived
                        .keys
                        .into_iter()
                        .map(|(k, origin)| (k, Some(origin)))
                        .collect(),
                    required: config.m,
                })
            }
            AccountKind::ImportedKey {
                address_type,
                public_key,
            } => {
                if index != 0 {
                    return Err(WalletError::UnsupportedAccount(
                        "imported-key accounts have a single address".into(),
                    ));
                }
                Ok(AddressInfo {
                    generated: single_sig_address(public_key, *address_type, network)?,
                    keys: vec![(*public_key, None)],
                    required: 1,
                })
            }
        }
    }

    fn pool(&self, is_change: bool) -> &Vec<AddressRecord> {
        if is_change { &self.change } else { &self.receive }
    }

    fn pool_mut(&mut self, is_change: bool) -> &mut Vec<AddressRecord> {
        if is_change { &mut self.change } else { &mut self.receive }
    }

    fn is_imported(&self) -> bool {
        matches!(self.kind, AccountKind::ImportedKey { .. })
    }

    /// Append a new address to the receive or change pool.
    ///
    /// Imported-key accounts have exactly one address, which serves as both
    /// receive and change.
    pub fn next_address(
        &mut self,
        is_change: bool,
        network: Network,
    ) -> Result<AddressRecord, WalletError> {
        if self.is_imported() {
            if let Some(existing) = self.receive.first() {
                return Ok(existing.clone());
            }
            let record = self.record_for(0, false, network)?;
            self.receive.push(record.clone());
            return Ok(record);
        }
        let index = u32::try_from(self.pool(is_change).len())
            .map_err(|_| WalletError::KeyDerivation("address pool exhausted".into()))?;
        let record = self.record_for(index, is_change, network)?;
        self.pool_mut(is_change).push(record.clone());
        debug!(account = self.index, index, change = is_change, "address generated");
        Ok(record)
    }

    fn record_for(
        &self,
        index: u32,
        is_change: bool,
        network: Network,
    ) -> Result<AddressRecord, WalletError> {
        let info = self.address_info(index, is_change, network)?;
        Ok(AddressRecord {
            script_type: info.generated.script_type,
            index,
            change: is_change,
            used: false,
            address: info.generated.encoded(),
        })
    }

    /// First unused receive address, generating one if every address is used.
    pub fn current_receive(&mut self, network: Network) -> Result<AddressRecord, WalletError> {
        if let Some(record) = self.receive.iter().find(|r| !r.used) {
            return Ok(record.clone());
        }
        self.next_address(false, network)
    }

    /// An unused change address. Callers mark it used once it appears in a
    /// built transaction, so repeated calls rotate to fresh addresses.
    pub fn next_unused_change(&mut self, network: Network) -> Result<AddressRecord, WalletError> {
        if self.is_imported() {
            return self.next_address(false, network);
        }
        if let Some(record) = self.change.iter().find(|r| !r.used) {
            return Ok(record.clone());
        }
        self.next_address(true, network)
    }

    /// Keep `gap_limit` unused receive addresses after the last used one.
    pub fn ensure_gap(&mut self, gap_limit: u32, network: Network) -> Result<(), WalletError> {
        if self.is_imported() {
            self.next_address(false, network)?;
            return Ok(());
        }
        let trailing_unused = self.receive.iter().rev().take_while(|r| !r.used).count();
        for _ in trailing_unused..gap_limit as usize {
            self.next_address(false, network)?;
        }
        Ok(())
    }

    /// Flag `address` as used. Returns whether it belongs to this account.
    pub fn mark_used(&mut self, address: &str) -> bool {
        match self
            .receive
            .iter_mut()
            .chain(self.change.iter_mut())
            .find(|r| r.address == address)
        {
            Some(record) => {
                record.used = true;
                true
            }
            None => false,
        }
    }

    pub fn find(&self, address: &str) -> Option<&AddressRecord> {
        self.addresses().find(|r| r.address == address)
    }

    /// Every generated address, receive pool first.
    pub fn addresses(&self) -> impl Iterator<Item = &AddressRecord> {
        self.receive.iter().chain(self.change.iter())
    }
}
