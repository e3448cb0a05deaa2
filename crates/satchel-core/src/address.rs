//! Address generation for single-sig and multisig scripts.
//!
//! Every function here is a pure function of its inputs: identical keys,
//! threshold, address type and network always produce byte-identical
//! scripts and encodings. Independent co-signer wallets rely on this to
//! agree on multisig addresses without exchanging anything but public keys.
//!
//! Multisig key *ordering* is not decided here. Callers pass keys already in
//! canonical order (see the wallet's multisig coordinator).

use std::fmt;
use std::str::FromStr;

use bitcoin::address::NetworkUnchecked;
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::script::Builder;
use bitcoin::{Address, CompressedPublicKey, PublicKey, Script, ScriptBuf};
use serde::{Deserialize, Serialize};

use crate::constants::{
    MAX_P2SH_MULTISIG_KEYS, MAX_WITNESS_MULTISIG_KEYS, PURPOSE_LEGACY, PURPOSE_NATIVE_SEGWIT,
    PURPOSE_NESTED_SEGWIT,
};
use crate::error::ValidationError;

/// Network selector determining address prefixes and coin type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Bitcoin mainnet (`1...`, `3...`, `bc1...`).
    Mainnet,
    /// Bitcoin testnet (`m/n...`, `2...`, `tb1...`).
    Testnet,
    /// Local regtest (`m/n...`, `2...`, `bcrt1...`).
    Regtest,
}

impl Network {
    /// The corresponding `bitcoin` crate network.
    pub fn to_bitcoin(self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }

    /// BIP-44 coin type: 0 for mainnet, 1 for every test network.
    pub fn coin_type(self) -> u32 {
        match self {
            Network::Mainnet => 0,
            Network::Testnet | Network::Regtest => 1,
        }
    }

    /// Lowercase name used in config files and error messages.
    pub fn name(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    /// Whether this is the production network.
    pub fn is_mainnet(self) -> bool {
        self == Network::Mainnet
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Network {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" | "bitcoin" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(ValidationError::InvalidFormat(format!("unknown network: {other}"))),
        }
    }
}

/// Single-sig address families.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressType {
    /// Pay-to-pubkey-hash.
    Legacy,
    /// P2WPKH wrapped in P2SH.
    NestedSegwit,
    /// Native P2WPKH.
    NativeSegwit,
}

impl AddressType {
    pub fn name(self) -> &'static str {
        match self {
            AddressType::Legacy => "legacy",
            AddressType::NestedSegwit => "nested-segwit",
            AddressType::NativeSegwit => "native-segwit",
        }
    }

    /// Derivation purpose for accounts of this type.
    pub fn purpose(self) -> u32 {
        match self {
            AddressType::Legacy => PURPOSE_LEGACY,
            AddressType::NestedSegwit => PURPOSE_NESTED_SEGWIT,
            AddressType::NativeSegwit => PURPOSE_NATIVE_SEGWIT,
        }
    }

    pub fn script_type(self) -> ScriptType {
        match self {
            AddressType::Legacy => ScriptType::P2pkh,
            AddressType::NestedSegwit => ScriptType::P2shP2wpkh,
            AddressType::NativeSegwit => ScriptType::P2wpkh,
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AddressType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "legacy" | "p2pkh" => Ok(AddressType::Legacy),
            "nested-segwit" | "segwit" | "p2sh-p2wpkh" => Ok(AddressType::NestedSegwit),
            "native-segwit" | "bech32" | "p2wpkh" => Ok(AddressType::NativeSegwit),
            other => Err(ValidationError::InvalidFormat(format!("unknown address type: {other}"))),
        }
    }
}

/// Multisig address families.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MultisigAddressType {
    /// Bare script-hash (redeem script in scriptSig).
    P2sh,
    /// Witness script-hash nested in P2SH.
    P2shP2wsh,
    /// Native witness script-hash.
    P2wsh,
}

impl MultisigAddressType {
    pub fn name(self) -> &'static str {
        match self {
            MultisigAddressType::P2sh => "p2sh",
            MultisigAddressType::P2shP2wsh => "p2sh-p2wsh",
            MultisigAddressType::P2wsh => "p2wsh",
        }
    }

    pub fn script_type(self) -> ScriptType {
        match self {
            MultisigAddressType::P2sh => ScriptType::P2sh,
            MultisigAddressType::P2shP2wsh => ScriptType::P2shP2wsh,
            MultisigAddressType::P2wsh => ScriptType::P2wsh,
        }
    }

    /// Largest key set allowed for this script family.
    pub fn max_keys(self) -> usize {
        match self {
            MultisigAddressType::P2sh => MAX_P2SH_MULTISIG_KEYS,
            MultisigAddressType::P2shP2wsh | MultisigAddressType::P2wsh => {
                MAX_WITNESS_MULTISIG_KEYS
            }
        }
    }

    /// Witness scripts must only contain compressed keys (standardness).
    pub fn requires_compressed(self) -> bool {
        !matches!(self, MultisigAddressType::P2sh)
    }
}

impl fmt::Display for MultisigAddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MultisigAddressType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "p2sh" | "legacy" => Ok(MultisigAddressType::P2sh),
            "p2sh-p2wsh" | "nested-segwit" => Ok(MultisigAddressType::P2shP2wsh),
            "p2wsh" | "native-segwit" => Ok(MultisigAddressType::P2wsh),
            other => Err(ValidationError::InvalidFormat(format!(
                "unknown multisig address type: {other}"
            ))),
        }
    }
}

/// Concrete output script kind of a wallet address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptType {
    P2pkh,
    P2shP2wpkh,
    P2wpkh,
    P2sh,
    P2shP2wsh,
    P2wsh,
}

impl ScriptType {
    /// Whether spending this script carries witness data.
    pub fn is_segwit(self) -> bool {
        !matches!(self, ScriptType::P2pkh | ScriptType::P2sh)
    }

    /// Whether the script commits to a multisig redeem/witness script.
    pub fn is_multisig(self) -> bool {
        matches!(self, ScriptType::P2sh | ScriptType::P2shP2wsh | ScriptType::P2wsh)
    }

    /// Length in bytes of the scriptPubKey for this type.
    pub fn script_pubkey_len(self) -> usize {
        match self {
            ScriptType::P2pkh => 25,
            ScriptType::P2shP2wpkh | ScriptType::P2sh | ScriptType::P2shP2wsh => 23,
            ScriptType::P2wpkh => 22,
            ScriptType::P2wsh => 34,
        }
    }
}

/// An address together with the scripts needed to later spend from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedAddress {
    /// The encoded, network-checked address.
    pub address: Address,
    /// Script family of the address.
    pub script_type: ScriptType,
    /// Redeem script for P2SH-based types.
    pub redeem_script: Option<ScriptBuf>,
    /// Witness script for P2WSH-based types.
    pub witness_script: Option<ScriptBuf>,
}

impl GeneratedAddress {
    /// Canonical string encoding of the address.
    pub fn encoded(&self) -> String {
        self.address.to_string()
    }

    /// The output script paying to this address.
    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }
}

fn compressed_key(
    public_key: &PublicKey,
    address_type: &str,
) -> Result<CompressedPublicKey, ValidationError> {
    if !public_key.compressed {
        return Err(ValidationError::UncompressedKey {
            address_type: address_type.to_string(),
        });
    }
    Ok(CompressedPublicKey(public_key.inner))
}

/// Build the standard single-key address of the requested type.
///
/// Uncompressed keys are only valid for [`AddressType::Legacy`]; requesting a
/// segwit type for one is a validation error rather than a silent fallback.
pub fn single_sig_address(
    public_key: &PublicKey,
    address_type: AddressType,
    network: Network,
) -> Result<GeneratedAddress, ValidationError> {
    let net = network.to_bitcoin();
    let generated = match address_type {
        AddressType::Legacy => GeneratedAddress {
            address: Address::p2pkh(public_key.pubkey_hash(), net),
            script_type: ScriptType::P2pkh,
            redeem_script: None,
            witness_script: None,
        },
        AddressType::NestedSegwit => {
            let key = compressed_key(public_key, address_type.name())?;
            GeneratedAddress {
                address: Address::p2shwpkh(&key, net),
                script_type: ScriptType::P2shP2wpkh,
                redeem_script: Some(ScriptBuf::new_p2wpkh(&key.wpubkey_hash())),
                witness_script: None,
            }
        }
        AddressType::NativeSegwit => {
            let key = compressed_key(public_key, address_type.name())?;
            GeneratedAddress {
                address: Address::p2wpkh(&key, net),
                script_type: ScriptType::P2wpkh,
                redeem_script: None,
                witness_script: None,
            }
        }
    };
    Ok(generated)
}

/// Build `OP_m <key_1> .. <key_n> OP_n OP_CHECKMULTISIG` from keys in the given order.
pub fn multisig_redeem_script(
    sorted_keys: &[PublicKey],
    m: usize,
) -> Result<ScriptBuf, ValidationError> {
    let n = sorted_keys.len();
    if m == 0 || m > n || n > MAX_WITNESS_MULTISIG_KEYS {
        return Err(ValidationError::InvalidThreshold { m, n });
    }
    let mut builder = Builder::new().push_int(m as i64);
    for key in sorted_keys {
        builder = builder.push_key(key);
    }
    Ok(builder
        .push_int(n as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script())
}

/// Build an m-of-n multisig address from keys already in canonical order.
pub fn multisig_address(
    sorted_keys: &[PublicKey],
    m: usize,
    multisig_type: MultisigAddressType,
    network: Network,
) -> Result<GeneratedAddress, ValidationError> {
    let n = sorted_keys.len();
    if n > multisig_type.max_keys() {
        return Err(ValidationError::InvalidThreshold { m, n });
    }
    if multisig_type.requires_compressed() && sorted_keys.iter().any(|k| !k.compressed) {
        return Err(ValidationError::UncompressedKey {
            address_type: multisig_type.name().to_string(),
        });
    }

    let script = multisig_redeem_script(sorted_keys, m)?;
    let net = network.to_bitcoin();
    let generated = match multisig_type {
        MultisigAddressType::P2sh => GeneratedAddress {
            address: Address::p2sh(&script, net)
                .map_err(|e| ValidationError::InvalidAddress(e.to_string()))?,
            script_type: ScriptType::P2sh,
            redeem_script: Some(script),
            witness_script: None,
        },
        MultisigAddressType::P2shP2wsh => GeneratedAddress {
            address: Address::p2shwsh(&script, net),
            script_type: ScriptType::P2shP2wsh,
            redeem_script: Some(ScriptBuf::new_p2wsh(&script.wscript_hash())),
            witness_script: Some(script),
        },
        MultisigAddressType::P2wsh => GeneratedAddress {
            address: Address::p2wsh(&script, net),
            script_type: ScriptType::P2wsh,
            redeem_script: None,
            witness_script: Some(script),
        },
    };
    Ok(generated)
}

/// Parse an address string and require that it belongs to `network`.
///
/// Distinguishes malformed input ([`ValidationError::InvalidAddress`]) from a
/// well-formed address of another network ([`ValidationError::WrongNetwork`]).
pub fn parse_address(s: &str, network: Network) -> Result<Address, ValidationError> {
    let trimmed = s.trim();
    let unchecked: Address<NetworkUnchecked> = trimmed
        .parse()
        .map_err(|e| ValidationError::InvalidAddress(format!("{trimmed}: {e}")))?;
    if !unchecked.is_valid_for_network(network.to_bitcoin()) {
        return Err(ValidationError::WrongNetwork {
            expected: network.to_string(),
            found: format!("address {trimmed}"),
        });
    }
    unchecked
        .require_network(network.to_bitcoin())
        .map_err(|e| ValidationError::InvalidAddress(e.to_string()))
}

/// Whether `s` is a well-formed address for `network`.
pub fn validate_address(s: &str, network: Network) -> bool {
    parse_address(s, network).is_ok()
}

/// Classify an output script. P2SH outputs are reported as [`ScriptType::P2sh`]
/// since the wrapped script is not visible on-chain.
pub fn script_type_of(script: &Script) -> Option<ScriptType> {
    if script.is_p2pkh() {
        Some(ScriptType::P2pkh)
    } else if script.is_p2wpkh() {
        Some(ScriptType::P2wpkh)
    } else if script.is_p2wsh() {
        Some(ScriptType::P2wsh)
    } else if script.is_p2sh() {
        Some(ScriptType::P2sh)
    } else {
        None
    }
}
