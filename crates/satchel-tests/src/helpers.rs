//! Shared test helpers for the integration suites.

use std::collections::HashMap;

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::{Address, OutPoint, ScriptBuf, Txid};
use parking_lot::Mutex;

use satchel_core::address::{parse_address, Network};
use satchel_core::error::ClientError;
use satchel_core::traits::BlockchainClient;
use satchel_core::types::{Confirmation, Recipient, TxSummary, Utxo};
use satchel_wallet::{KdfParams, Wallet, WalletConfig};

pub const PASSWORD: &[u8] = b"correct horse battery";

/// Valid phrases that are not published test vectors.
pub const OZONE: &str =
    "ozone drill grab fiber curtain grace pudding thank cruise elder eight picnic";
pub const SCHEME: &str =
    "scheme spot photo card baby mountain device kick cradle pact join borrow";

/// BIP-84 test vector phrase. Refused by the wallet, usable with the
/// lower-level derivation functions.
pub const ABANDON: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

/// External testnet address used as a payment destination.
pub const RECIPIENT: &str = "tb1q6rz28mcfaxtmd6v789l9rrlrusdprr9pqcpvkl";

/// Testnet config with a cheap KDF and a short gap limit.
pub fn test_config() -> WalletConfig {
    WalletConfig {
        kdf: KdfParams::fast_insecure(),
        gap_limit: 3,
        ..WalletConfig::for_network(Network::Testnet)
    }
}

pub fn restored(phrase: &str) -> Wallet {
    let mut wallet = Wallet::new(test_config()).expect("valid config");
    wallet.restore(phrase, "", PASSWORD).expect("restore");
    wallet
}

/// A wallet with a freshly generated phrase.
pub fn created() -> Wallet {
    let mut wallet = Wallet::new(test_config()).expect("valid config");
    wallet.create(PASSWORD, 12).expect("create");
    wallet
}

pub fn recipient(amount: u64) -> Recipient {
    Recipient::new(
        parse_address(RECIPIENT, Network::Testnet).expect("valid address"),
        amount,
    )
}

/// A confirmed UTXO with a distinct outpoint per `seq`.
pub fn utxo(seq: u32, value: u64) -> Utxo {
    let mut txid = [0u8; 32];
    txid[..4].copy_from_slice(&seq.to_le_bytes());
    Utxo {
        outpoint: OutPoint::new(Txid::from_byte_array(txid), 0),
        value,
        script_pubkey: ScriptBuf::new(),
        confirmation: Confirmation::Confirmed { height: 100 },
    }
}

/// In-memory chain backend keyed by address string.
#[derive(Default)]
pub struct MockClient {
    utxos: Mutex<HashMap<String, Vec<Utxo>>>,
    history: Mutex<HashMap<String, Vec<TxSummary>>>,
    pub broadcasts: Mutex<Vec<String>>,
    offline: bool,
}

impl MockClient {
    pub fn offline() -> Self {
        Self {
            offline: true,
            ..Self::default()
        }
    }

    /// Pay `value` to `address` in a transaction identified by `seq`.
    pub fn fund(&self, address: &str, value: u64, seq: u8, confirmed: bool) {
        let utxo = Utxo {
            outpoint: OutPoint::new(Txid::from_byte_array([seq; 32]), 0),
            value,
            script_pubkey: parse_address(address, Network::Testnet)
                .expect("testnet address")
                .script_pubkey(),
            confirmation: if confirmed {
                Confirmation::Confirmed { height: 100 }
            } else {
                Confirmation::Unconfirmed
            },
        };
        self.utxos
            .lock()
            .entry(address.to_string())
            .or_default()
            .push(utxo);
    }

    pub fn add_history(&self, address: &str, summary: TxSummary) {
        self.history
            .lock()
            .entry(address.to_string())
            .or_default()
            .push(summary);
    }
}

#[async_trait]
impl BlockchainClient for MockClient {
    async fn fetch_utxos(&self, address: &Address) -> Result<Vec<Utxo>, ClientError> {
        if self.offline {
            return Err(ClientError::Unavailable("offline".into()));
        }
        Ok(self
            .utxos
            .lock()
            .get(&address.to_string())
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_history(
        &self,
        address: &Address,
        limit: Option<usize>,
    ) -> Result<Vec<TxSummary>, ClientError> {
        if self.offline {
            return Err(ClientError::Unavailable("offline".into()));
        }
        let mut history = self
            .history
            .lock()
            .get(&address.to_string())
            .cloned()
            .unwrap_or_default();
        if let Some(limit) = limit {
            history.truncate(limit);
        }
        Ok(history)
    }

    async fn broadcast(&self, raw_tx_hex: &str) -> Result<Txid, ClientError> {
        if self.offline {
            return Err(ClientError::Unavailable("offline".into()));
        }
        self.broadcasts.lock().push(raw_tx_hex.to_string());
        Ok(Txid::from_byte_array([0xEE; 32]))
    }
}
