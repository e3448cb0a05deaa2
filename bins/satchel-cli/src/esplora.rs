//! Esplora REST client implementing [`BlockchainClient`].

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bitcoin::{Address, OutPoint, Txid};
use chrono::DateTime;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use satchel_core::error::ClientError;
use satchel_core::traits::BlockchainClient;
use satchel_core::types::{Confirmation, TxSummary, Utxo};

#[derive(Debug, Deserialize)]
struct TxStatus {
    confirmed: bool,
    #[serde(default)]
    block_height: Option<u32>,
    #[serde(default)]
    block_time: Option<i64>,
}

impl TxStatus {
    fn confirmation(&self) -> Confirmation {
        match (self.confirmed, self.block_height) {
            (true, Some(height)) => Confirmation::Confirmed { height },
            _ => Confirmation::Unconfirmed,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EsploraUtxo {
    txid: Txid,
    vout: u32,
    value: u64,
    status: TxStatus,
}

#[derive(Debug, Deserialize)]
struct EsploraTx {
    txid: Txid,
    #[serde(default)]
    fee: Option<u64>,
    status: TxStatus,
}

pub struct EsploraClient {
    client: Client,
    base_url: String,
}

fn unavailable(e: reqwest::Error) -> ClientError {
    ClientError::Unavailable(e.to_string())
}

impl EsploraClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "esplora GET");
        let resp = self.client.get(&url).send().await.map_err(unavailable)?;
        if !resp.status().is_success() {
            return Err(ClientError::Unavailable(format!("{url}: HTTP {}", resp.status())));
        }
        resp.json()
            .await
            .map_err(|e| ClientError::InvalidResponse(format!("{url}: {e}")))
    }
}

#[async_trait]
impl BlockchainClient for EsploraClient {
    async fn fetch_utxos(&self, address: &Address) -> Result<Vec<Utxo>, ClientError> {
        let raw: Vec<EsploraUtxo> = self.get_json(&format!("/address/{address}/utxo")).await?;
        let script_pubkey = address.script_pubkey();
        Ok(raw
            .into_iter()
            .map(|u| Utxo {
                outpoint: OutPoint::new(u.txid, u.vout),
                value: u.value,
                script_pubkey: script_pubkey.clone(),
                confirmation: u.status.confirmation(),
            })
            .collect())
    }

    async fn fetch_history(
        &self,
        address: &Address,
        limit: Option<usize>,
    ) -> Result<Vec<TxSummary>, ClientError> {
        let raw: Vec<EsploraTx> = self.get_json(&format!("/address/{address}/txs")).await?;
        Ok(raw
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|tx| TxSummary {
                txid: tx.txid,
                confirmation: tx.status.confirmation(),
                timestamp: tx
                    .status
                    .block_time
                    .and_then(|secs| DateTime::from_timestamp(secs, 0)),
                fee: tx.fee,
            })
            .collect())
    }

    async fn broadcast(&self, raw_tx_hex: &str) -> Result<Txid, ClientError> {
        let url = format!("{}/tx", self.base_url);
        let resp = self
            .client
            .post(&url)
            .body(raw_tx_hex.to_owned())
            .send()
            .await
            .map_err(unavailable)?;
        let status = resp.status();
        let body = resp.text().await.map_err(unavailable)?;
        match status {
            s if s.is_success() => body
                .trim()
                .parse()
                .map_err(|e| ClientError::InvalidResponse(format!("txid {body:?}: {e}"))),
            StatusCode::BAD_REQUEST => Err(ClientError::Rejected(body)),
            s => Err(ClientError::Unavailable(format!("{url}: HTTP {s}: {body}"))),
        }
    }
}
