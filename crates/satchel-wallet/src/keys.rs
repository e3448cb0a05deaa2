//! Seed handling and BIP-32 hierarchical key derivation.
//!
//! Private key nodes live only as long as the operation that needs them and
//! erase their secret key on drop. Public-only nodes (from [`KeyNode::neuter`])
//! carry no secret and may be cached freely.

use std::fmt;
use std::str::FromStr;

use bitcoin::bip32::{ChainCode, ChildNumber, DerivationPath, Fingerprint, Xpriv, Xpub};
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::PublicKey;
use zeroize::{Zeroize, ZeroizeOnDrop};

use satchel_core::address::{AddressType, MultisigAddressType, Network};
use satchel_core::constants::{
    BIP48_SCRIPT_NATIVE, BIP48_SCRIPT_NESTED, PURPOSE_MULTISIG, PURPOSE_MULTISIG_LEGACY,
};
use satchel_core::error::ValidationError;

use crate::error::WalletError;

/// A 64-byte BIP-39 seed.
///
/// Secret material is zeroized on drop to prevent leaking key material
/// in freed memory.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Seed {
    bytes: [u8; 64],
}

impl Seed {
    /// Create a seed from raw bytes.
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self { bytes }
    }

    /// Get the raw seed bytes. Handle with care.
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.bytes
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seed")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Account-level derivation template.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Purpose {
    /// `m/44'/coin'/account'`
    Legacy,
    /// `m/49'/coin'/account'`
    NestedSegwit,
    /// `m/84'/coin'/account'`
    NativeSegwit,
    /// `m/45'/account'`
    MultisigP2sh,
    /// `m/48'/coin'/account'/1'`
    MultisigP2shP2wsh,
    /// `m/48'/coin'/account'/2'`
    MultisigP2wsh,
}

impl From<AddressType> for Purpose {
    fn from(ty: AddressType) -> Self {
        match ty {
            AddressType::Legacy => Purpose::Legacy,
            AddressType::NestedSegwit => Purpose::NestedSegwit,
            AddressType::NativeSegwit => Purpose::NativeSegwit,
        }
    }
}

impl From<MultisigAddressType> for Purpose {
    fn from(ty: MultisigAddressType) -> Self {
        match ty {
            MultisigAddressType::P2sh => Purpose::MultisigP2sh,
            MultisigAddressType::P2shP2wsh => Purpose::MultisigP2shP2wsh,
            MultisigAddressType::P2wsh => Purpose::MultisigP2wsh,
        }
    }
}

fn hardened(index: u32) -> Result<ChildNumber, WalletError> {
    ChildNumber::from_hardened_idx(index).map_err(|e| WalletError::KeyDerivation(e.to_string()))
}

fn normal(index: u32) -> Result<ChildNumber, WalletError> {
    ChildNumber::from_normal_idx(index).map_err(|e| WalletError::KeyDerivation(e.to_string()))
}

/// Account-level path for `purpose` on `network`.
pub fn account_path(
    purpose: Purpose,
    network: Network,
    account: u32,
) -> Result<DerivationPath, WalletError> {
    let coin = network.coin_type();
    let children = match purpose {
        Purpose::Legacy | Purpose::NestedSegwit | Purpose::NativeSegwit => {
            let number = match purpose {
                Purpose::Legacy => AddressType::Legacy.purpose(),
                Purpose::NestedSegwit => AddressType::NestedSegwit.purpose(),
                _ => AddressType::NativeSegwit.purpose(),
            };
            vec![hardened(number)?, hardened(coin)?, hardened(account)?]
        }
        Purpose::MultisigP2sh => vec![hardened(PURPOSE_MULTISIG_LEGACY)?, hardened(account)?],
        Purpose::MultisigP2shP2wsh => vec![
            hardened(PURPOSE_MULTISIG)?,
            hardened(coin)?,
            hardened(account)?,
            hardened(BIP48_SCRIPT_NESTED)?,
        ],
        Purpose::MultisigP2wsh => vec![
            hardened(PURPOSE_MULTISIG)?,
            hardened(coin)?,
            hardened(account)?,
            hardened(BIP48_SCRIPT_NATIVE)?,
        ],
    };
    Ok(DerivationPath::from(children))
}

/// Relative path `change/index` below an account node.
pub fn branch_path(is_change: bool, index: u32) -> Result<DerivationPath, WalletError> {
    Ok(DerivationPath::from(vec![
        normal(u32::from(is_change))?,
        normal(index)?,
    ]))
}

/// Parse `m/84'/1'/0'` or `84h/1h/0h` style paths.
pub fn parse_path(s: &str) -> Result<DerivationPath, ValidationError> {
    DerivationPath::from_str(s.trim()).map_err(|e| ValidationError::InvalidPath(format!("{s}: {e}")))
}

/// Render a path as `m/84'/1'/0'`.
pub fn format_path(path: &DerivationPath) -> String {
    let mut out = String::from("m");
    for child in path.as_ref() {
        out.push('/');
        out.push_str(&child.to_string());
    }
    out
}

/// Where a key sits relative to its master: fingerprint plus full path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyOrigin {
    pub fingerprint: Fingerprint,
    pub path: DerivationPath,
}

impl KeyOrigin {
    /// Origin of a child `relative` below this one.
    pub fn extend(&self, relative: &DerivationPath) -> Self {
        Self {
            fingerprint: self.fingerprint,
            path: self.path.extend(relative),
        }
    }

    /// The `(fingerprint, path)` pair PSBTs carry in `bip32_derivation`.
    pub fn key_source(&self) -> (Fingerprint, DerivationPath) {
        (self.fingerprint, self.path.clone())
    }
}

impl fmt::Display for KeyOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = format_path(&self.path);
        write!(f, "{}{}", self.fingerprint, path.trim_start_matches('m'))
    }
}

/// A node in a BIP-32 tree, private or public-only.
pub struct KeyNode {
    xpriv: Option<Xpriv>,
    xpub: Xpub,
    origin: KeyOrigin,
}

impl KeyNode {
    /// Master node for `seed`.
    pub fn master(seed: &Seed, network: Network) -> Result<Self, WalletError> {
        let secp = Secp256k1::new();
        let xpriv = Xpriv::new_master(network.to_bitcoin(), seed.as_bytes())
            .map_err(|e| WalletError::KeyDerivation(e.to_string()))?;
        let xpub = Xpub::from_priv(&secp, &xpriv);
        Ok(Self {
            origin: KeyOrigin {
                fingerprint: xpub.fingerprint(),
                path: DerivationPath::master(),
            },
            xpriv: Some(xpriv),
            xpub,
        })
    }

    /// Public-only node with a known origin, e.g. a co-signer's account xpub.
    pub fn from_xpub(xpub: Xpub, origin: KeyOrigin) -> Self {
        Self {
            xpriv: None,
            xpub,
            origin,
        }
    }

    /// Derive a descendant along `path`. Hardened steps need a private node.
    pub fn derive_path(&self, path: &DerivationPath) -> Result<KeyNode, WalletError> {
        match &self.xpriv {
            Some(xpriv) => {
                let secp = Secp256k1::new();
                let child = xpriv
                    .derive_priv(&secp, path)
                    .map_err(|e| WalletError::KeyDerivation(e.to_string()))?;
                Ok(Self {
                    xpub: Xpub::from_priv(&secp, &child),
                    xpriv: Some(child),
                    origin: self.origin.extend(path),
                })
            }
            None => {
                if path.as_ref().iter().any(ChildNumber::is_hardened) {
                    return Err(WalletError::KeyDerivation(
                        "hardened derivation requires a private key".into(),
                    ));
                }
                let secp = Secp256k1::verification_only();
                let child = self
                    .xpub
                    .derive_pub(&secp, path)
                    .map_err(|e| WalletError::KeyDerivation(e.to_string()))?;
                Ok(Self {
                    xpriv: None,
                    xpub: child,
                    origin: self.origin.extend(path),
                })
            }
        }
    }

    /// Derive a single child.
    pub fn derive_child(&self, child: ChildNumber) -> Result<KeyNode, WalletError> {
        self.derive_path(&DerivationPath::from(vec![child]))
    }

    /// Public-only copy of this node.
    pub fn neuter(&self) -> KeyNode {
        Self::from_xpub(self.xpub, self.origin.clone())
    }

    pub fn is_private(&self) -> bool {
        self.xpriv.is_some()
    }

    pub fn xpub(&self) -> &Xpub {
        &self.xpub
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::new(self.xpub.public_key)
    }

    /// The secret key, when this is a private node.
    pub fn private_key(&self) -> Option<&SecretKey> {
        self.xpriv.as_ref().map(|x| &x.private_key)
    }

    pub fn chain_code(&self) -> ChainCode {
        self.xpub.chain_code
    }

    pub fn depth(&self) -> u8 {
        self.xpub.depth
    }

    pub fn parent_fingerprint(&self) -> Fingerprint {
        self.xpub.parent_fingerprint
    }

    pub fn child_number(&self) -> ChildNumber {
        self.xpub.child_number
    }

    pub fn is_hardened(&self) -> bool {
        self.xpub.child_number.is_hardened()
    }

    /// This node's own fingerprint.
    pub fn fingerprint(&self) -> Fingerprint {
        self.xpub.fingerprint()
    }

    pub fn origin(&self) -> &KeyOrigin {
        &self.origin
    }
}

impl Drop for KeyNode {
    fn drop(&mut self) {
        if let Some(xpriv) = self.xpriv.as_mut() {
            xpriv.private_key.non_secure_erase();
        }
    }
}

impl fmt::Debug for KeyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyNode")
            .field("xpub", &self.xpub.to_string())
            .field("origin", &self.origin.to_string())
            .field("private", &self.is_private())
            .finish()
    }
}

/// Derive the node at absolute `path` from `seed`.
pub fn derive_node(
    seed: &Seed,
    path: &DerivationPath,
    network: Network,
) -> Result<KeyNode, WalletError> {
    KeyNode::master(seed, network)?.derive_path(path)
}
