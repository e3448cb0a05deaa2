//! Trait interfaces at the edge of the signing core.
//!
//! - [`BlockchainClient`]: UTXO/history lookup and broadcast, implemented
//!   outside the core (the CLI ships an Esplora-backed client).

use async_trait::async_trait;
use bitcoin::{Address, Txid};

use crate::error::ClientError;
use crate::types::{TxSummary, Utxo};

/// Narrow view of the blockchain data provider.
///
/// Implementations may be slow or unreliable and give no ordering guarantee
/// across calls for different addresses. Callers merge and sort results
/// themselves (see [`crate::types::dedup_utxos`] and
/// [`crate::types::merge_histories`]) and must propagate failures instead of
/// substituting empty results.
#[async_trait]
pub trait BlockchainClient: Send + Sync {
    /// Unspent outputs currently paying to `address`.
    async fn fetch_utxos(&self, address: &Address) -> Result<Vec<Utxo>, ClientError>;

    /// Transactions touching `address`, at most `limit` entries when given.
    async fn fetch_history(
        &self,
        address: &Address,
        limit: Option<usize>,
    ) -> Result<Vec<TxSummary>, ClientError>;

    /// Submit a fully signed transaction in hex. Returns its txid.
    async fn broadcast(&self, raw_tx_hex: &str) -> Result<Txid, ClientError>;
}
