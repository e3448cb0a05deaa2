//! Single private keys imported in Wallet Import Format.
//!
//! ```text
//! base58check( version || secret[32] || [0x01 if compressed] )
//! ```
//! Version `0x80` is mainnet, `0xEF` any test network.

use std::fmt;

use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{NetworkKind, PrivateKey, PublicKey};
use zeroize::Zeroizing;

use satchel_core::address::{single_sig_address, AddressType, GeneratedAddress, Network};
use satchel_core::error::ValidationError;

const WIF_VERSION_MAINNET: u8 = 0x80;
const WIF_VERSION_TESTNET: u8 = 0xEF;
const COMPRESSED_FLAG: u8 = 0x01;

/// A decoded single private key.
pub struct RawKey {
    secret: SecretKey,
    mainnet: bool,
    compressed: bool,
}

/// Decode a WIF string.
///
/// Base58 checksum failures are [`ValidationError::InvalidChecksum`]; wrong
/// alphabet, length, version or flag are [`ValidationError::InvalidFormat`].
pub fn decode_raw_key(encoded: &str) -> Result<RawKey, ValidationError> {
    let data = bs58::decode(encoded.trim())
        .with_check(None)
        .into_vec()
        .map(Zeroizing::new)
        .map_err(|e| match e {
            bs58::decode::Error::InvalidChecksum { .. } => {
                ValidationError::InvalidChecksum("WIF checksum mismatch".into())
            }
            other => ValidationError::InvalidFormat(format!("WIF: {other}")),
        })?;

    let mainnet = match data.first() {
        Some(&WIF_VERSION_MAINNET) => true,
        Some(&WIF_VERSION_TESTNET) => false,
        Some(v) => {
            return Err(ValidationError::InvalidFormat(format!(
                "unknown WIF version byte 0x{v:02x}"
            )));
        }
        None => return Err(ValidationError::InvalidFormat("empty WIF payload".into())),
    };
    let compressed = match (data.len(), data.get(33)) {
        (33, None) => false,
        (34, Some(&COMPRESSED_FLAG)) => true,
        (len, _) => {
            return Err(ValidationError::InvalidFormat(format!(
                "unexpected WIF payload length {len}"
            )));
        }
    };
    let secret = SecretKey::from_slice(&data[1..33])
        .map_err(|e| ValidationError::InvalidKey(e.to_string()))?;

    Ok(RawKey {
        secret,
        mainnet,
        compressed,
    })
}

impl RawKey {
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Network family encoded in the WIF version byte.
    pub fn network(&self) -> Network {
        if self.mainnet {
            Network::Mainnet
        } else {
            Network::Testnet
        }
    }

    /// Whether this key may be used on `network`. Test WIFs cover regtest.
    pub fn is_for(&self, network: Network) -> bool {
        self.mainnet == network.is_mainnet()
    }

    pub fn public_key(&self) -> PublicKey {
        let secp = Secp256k1::signing_only();
        PublicKey {
            compressed: self.compressed,
            inner: self.secret.public_key(&secp),
        }
    }

    /// Address of `address_type` on `network`.
    ///
    /// Fails for segwit types when the key is uncompressed, and when the
    /// key's network family does not match.
    pub fn address(
        &self,
        address_type: AddressType,
        network: Network,
    ) -> Result<GeneratedAddress, ValidationError> {
        if !self.is_for(network) {
            return Err(ValidationError::WrongNetwork {
                expected: network.to_string(),
                found: self.network().to_string(),
            });
        }
        single_sig_address(&self.public_key(), address_type, network)
    }

    /// The key in `bitcoin` form, for signing.
    pub fn private_key(&self) -> PrivateKey {
        PrivateKey {
            compressed: self.compressed,
            network: if self.mainnet {
                NetworkKind::Main
            } else {
                NetworkKind::Test
            },
            inner: self.secret,
        }
    }

    pub fn to_wif(&self) -> Zeroizing<String> {
        Zeroizing::new(self.private_key().to_wif())
    }
}

impl Drop for RawKey {
    fn drop(&mut self) {
        self.secret.non_secure_erase();
    }
}

impl fmt::Debug for RawKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawKey")
            .field("network", &self.network())
            .field("compressed", &self.compressed)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}
