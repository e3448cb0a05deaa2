//! m-of-n account assembly and address derivation from co-signer xpubs.
//!
//! The coordination protocol is a single rule: keys are sorted ascending by
//! their serialized bytes. Every co-signer applies it independently, so the
//! order in which keys were exchanged never matters.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use bitcoin::bip32::{DerivationPath, Fingerprint, Xpub};
use bitcoin::{NetworkKind, PublicKey};
use serde::{Deserialize, Serialize};
use tracing::debug;

use satchel_core::address::{multisig_address, GeneratedAddress, MultisigAddressType, Network};

use crate::error::{MultisigError, WalletError};
use crate::keys::{account_path, branch_path, derive_node, format_path, KeyNode, KeyOrigin, Seed};

/// SLIP-132 version bytes that normalize to mainnet `xpub`.
const MAINNET_VERSIONS: [[u8; 4]; 5] = [
    [0x04, 0x88, 0xB2, 0x1E], // xpub
    [0x04, 0x9D, 0x7C, 0xB2], // ypub
    [0x04, 0xB2, 0x47, 0x46], // zpub
    [0x02, 0x95, 0xB4, 0x3F], // Ypub
    [0x02, 0xAA, 0x7E, 0xD3], // Zpub
];

/// SLIP-132 version bytes that normalize to testnet `tpub`.
const TESTNET_VERSIONS: [[u8; 4]; 5] = [
    [0x04, 0x35, 0x87, 0xCF], // tpub
    [0x04, 0x4A, 0x52, 0x62], // upub
    [0x04, 0x5F, 0x1C, 0xF6], // vpub
    [0x02, 0x42, 0x89, 0xEF], // Upub
    [0x02, 0x57, 0x54, 0x83], // Vpub
];

/// Sort public keys ascending by serialized bytes.
///
/// The result depends only on the set of keys, never on input order.
pub fn canonical_order(keys: &[PublicKey]) -> Vec<PublicKey> {
    let mut sorted = keys.to_vec();
    sorted.sort_by_cached_key(|k| k.to_bytes());
    sorted
}

/// Parse an extended public key, accepting SLIP-132 variants.
pub fn normalize_xpub(encoded: &str) -> Result<Xpub, MultisigError> {
    let mut data = bs58::decode(encoded.trim())
        .with_check(None)
        .into_vec()
        .map_err(|e| MultisigError::InvalidKey(format!("{encoded}: {e}")))?;
    if data.len() != 78 {
        return Err(MultisigError::InvalidKey(format!(
            "{encoded}: expected 78 bytes, got {}",
            data.len()
        )));
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&data[..4]);
    let canonical = if MAINNET_VERSIONS.contains(&version) {
        MAINNET_VERSIONS[0]
    } else if TESTNET_VERSIONS.contains(&version) {
        TESTNET_VERSIONS[0]
    } else {
        return Err(MultisigError::InvalidKey(format!(
            "{encoded}: unknown version bytes {}",
            hex::encode(version)
        )));
    };
    data[..4].copy_from_slice(&canonical);
    Xpub::decode(&data).map_err(|e| MultisigError::InvalidKey(format!("{encoded}: {e}")))
}

/// One participant of a multisig account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CosignerRecord {
    /// Master fingerprint of the co-signer's seed.
    pub fingerprint: Fingerprint,
    /// Account-level extended public key.
    pub xpub: Xpub,
    /// Path from the co-signer's master to `xpub`.
    pub derivation_path: DerivationPath,
    /// Whether this is the local wallet's own branch.
    #[serde(default)]
    pub is_self: bool,
}

impl CosignerRecord {
    fn origin(&self) -> KeyOrigin {
        KeyOrigin {
            fingerprint: self.fingerprint,
            path: self.derivation_path.clone(),
        }
    }

    fn account_node(&self) -> KeyNode {
        KeyNode::from_xpub(self.xpub, self.origin())
    }
}

/// Key-origin form: `[fingerprint/path]xpub`.
impl fmt::Display for CosignerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]{}", self.origin(), self.xpub)
    }
}

impl FromStr for CosignerRecord {
    type Err = MultisigError;

    /// Parse `[fingerprint/path]xpub` or a bare extended key. A bare key is
    /// treated as its own root.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let Some(rest) = s.strip_prefix('[') else {
            let xpub = normalize_xpub(s)?;
            return Ok(Self {
                fingerprint: xpub.fingerprint(),
                xpub,
                derivation_path: DerivationPath::master(),
                is_self: false,
            });
        };
        let (origin, key) = rest
            .split_once(']')
            .ok_or_else(|| MultisigError::InvalidKey(format!("{s}: unterminated key origin")))?;
        let (fp, path) = origin.split_once('/').unwrap_or((origin, ""));
        let fingerprint = Fingerprint::from_str(fp)
            .map_err(|e| MultisigError::InvalidKey(format!("{s}: fingerprint: {e}")))?;
        let derivation_path = if path.is_empty() {
            DerivationPath::master()
        } else {
            DerivationPath::from_str(&format!("m/{path}"))
                .map_err(|e| MultisigError::InvalidKey(format!("{s}: path: {e}")))?
        };
        Ok(Self {
            fingerprint,
            xpub: normalize_xpub(key)?,
            derivation_path,
            is_self: false,
        })
    }
}

/// An assembled m-of-n account. Co-signers are stored in canonical order of
/// their account-level keys.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigConfig {
    pub m: usize,
    pub n: usize,
    pub address_type: MultisigAddressType,
    pub cosigners: Vec<CosignerRecord>,
}

impl MultisigConfig {
    /// The local wallet's own record, if it holds a share.
    pub fn self_cosigner(&self) -> Option<&CosignerRecord> {
        self.cosigners.iter().find(|c| c.is_self)
    }
}

/// Validate co-signers and build a [`MultisigConfig`].
pub fn assemble_account(
    cosigners: Vec<CosignerRecord>,
    m: usize,
    n: usize,
    address_type: MultisigAddressType,
    network: Network,
) -> Result<MultisigConfig, MultisigError> {
    if cosigners.len() != n {
        return Err(MultisigError::CountMismatch {
            expected: n,
            found: cosigners.len(),
        });
    }
    if m == 0 || m > n || n > address_type.max_keys() {
        return Err(MultisigError::InvalidThreshold { m, n });
    }

    let expected_kind = NetworkKind::from(network.to_bitcoin());
    let mut seen = HashSet::new();
    for cosigner in &cosigners {
        if cosigner.xpub.network != expected_kind {
            return Err(MultisigError::InvalidKey(format!(
                "{} is not a {network} key",
                cosigner.xpub
            )));
        }
        if !seen.insert(cosigner.xpub.public_key.serialize()) {
            return Err(MultisigError::DuplicateKey(cosigner.xpub.to_string()));
        }
    }
    if cosigners.iter().filter(|c| c.is_self).count() > 1 {
        return Err(MultisigError::MultipleSelf);
    }

    let mut cosigners = cosigners;
    cosigners.sort_by_key(|c| c.xpub.public_key.serialize());
    debug!(m, n, address_type = %address_type, "multisig account assembled");
    Ok(MultisigConfig {
        m,
        n,
        address_type,
        cosigners,
    })
}

/// A derived multisig address plus per-key origins for PSBT metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultisigAddress {
    pub generated: GeneratedAddress,
    /// Keys in script order with their origins.
    pub keys: Vec<(PublicKey, KeyOrigin)>,
}

/// Derive the address at `change/index` for every co-signer.
pub fn derive_address(
    config: &MultisigConfig,
    index: u32,
    is_change: bool,
    network: Network,
) -> Result<MultisigAddress, WalletError> {
    let branch = branch_path(is_change, index)?;
    let mut keys = Vec::with_capacity(config.cosigners.len());
    for cosigner in &config.cosigners {
        let child = cosigner.account_node().derive_path(&branch)?;
        keys.push((child.public_key(), child.origin().clone()));
    }
    keys.sort_by_cached_key(|(k, _)| k.to_bytes());
    let sorted: Vec<PublicKey> = keys.iter().map(|(k, _)| *k).collect();
    let generated = multisig_address(&sorted, config.m, config.address_type, network)?;
    Ok(MultisigAddress { generated, keys })
}

/// This wallet's co-signer record for a multisig account of `address_type`.
pub fn export_cosigner(
    seed: &Seed,
    address_type: MultisigAddressType,
    account: u32,
    network: Network,
) -> Result<CosignerRecord, WalletError> {
    let path = account_path(address_type.into(), network, account)?;
    let node = derive_node(seed, &path, network)?;
    debug!(path = %format_path(&path), "exported co-signer key");
    Ok(CosignerRecord {
        fingerprint: node.origin().fingerprint,
        xpub: *node.xpub(),
        derivation_path: path,
        is_self: true,
    })
}
