//! Chain-facing data types consumed by the signing core.
//!
//! Everything here arrives from (or is handed to) the external blockchain
//! client. The engine never mutates a [`Utxo`]; it only selects from them.

use std::collections::HashMap;

use bitcoin::{Address, Amount, OutPoint, ScriptBuf, TxOut, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Confirmation state of a transaction or output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Confirmation {
    Confirmed { height: u32 },
    Unconfirmed,
}

impl Confirmation {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Confirmation::Confirmed { .. })
    }

    pub fn height(&self) -> Option<u32> {
        match self {
            Confirmation::Confirmed { height } => Some(*height),
            Confirmation::Unconfirmed => None,
        }
    }
}

/// An unspent transaction output as reported by the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub outpoint: OutPoint,
    /// Value in satoshis.
    pub value: u64,
    pub script_pubkey: ScriptBuf,
    pub confirmation: Confirmation,
}

impl Utxo {
    pub fn is_confirmed(&self) -> bool {
        self.confirmation.is_confirmed()
    }

    /// The previous output this UTXO spends, as carried in a PSBT input.
    pub fn txout(&self) -> TxOut {
        TxOut {
            value: Amount::from_sat(self.value),
            script_pubkey: self.script_pubkey.clone(),
        }
    }
}

/// One entry of an address's transaction history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxSummary {
    pub txid: Txid,
    pub confirmation: Confirmation,
    /// Block time, when the client knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Fee paid in satoshis, when the client knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<u64>,
}

/// A payment destination and amount in satoshis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recipient {
    pub address: Address,
    pub amount: u64,
}

impl Recipient {
    pub fn new(address: Address, amount: u64) -> Self {
        Self { address, amount }
    }
}

/// Merge UTXO lists fetched per address into one list without duplicates.
///
/// The same outpoint can be reported twice when two queried addresses share
/// a script. Output is sorted by outpoint so results do not depend on the
/// order the client answered in.
pub fn dedup_utxos(utxos: impl IntoIterator<Item = Utxo>) -> Vec<Utxo> {
    let mut by_outpoint: HashMap<OutPoint, Utxo> = HashMap::new();
    for utxo in utxos {
        by_outpoint
            .entry(utxo.outpoint)
            .and_modify(|existing| {
                if !existing.is_confirmed() && utxo.is_confirmed() {
                    existing.confirmation = utxo.confirmation;
                }
            })
            .or_insert(utxo);
    }
    let mut merged: Vec<Utxo> = by_outpoint.into_values().collect();
    merged.sort_by(|a, b| a.outpoint.cmp(&b.outpoint));
    merged
}

/// Merge per-address histories into one deduplicated, ordered list.
///
/// Order: unconfirmed first, then by descending height, then by txid. When
/// the same transaction is reported with differing state, the confirmed view
/// and any known timestamp/fee win.
pub fn merge_histories(histories: impl IntoIterator<Item = Vec<TxSummary>>) -> Vec<TxSummary> {
    let mut by_txid: HashMap<Txid, TxSummary> = HashMap::new();
    for entry in histories.into_iter().flatten() {
        match by_txid.get_mut(&entry.txid) {
            Some(existing) => {
                if !existing.confirmation.is_confirmed() && entry.confirmation.is_confirmed() {
                    existing.confirmation = entry.confirmation;
                }
                if existing.timestamp.is_none() {
                    existing.timestamp = entry.timestamp;
                }
                if existing.fee.is_none() {
                    existing.fee = entry.fee;
                }
            }
            None => {
                by_txid.insert(entry.txid, entry);
            }
        }
    }
    let mut merged: Vec<TxSummary> = by_txid.into_values().collect();
    merged.sort_by(|a, b| {
        let ha = a.confirmation.height().unwrap_or(u32::MAX);
        let hb = b.confirmation.height().unwrap_or(u32::MAX);
        hb.cmp(&ha).then_with(|| a.txid.cmp(&b.txid))
    });
    merged
}
