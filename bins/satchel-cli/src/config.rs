//! CLI configuration loaded from environment variables.
//!
//! Command-line flags override anything read here.

use std::path::PathBuf;

use anyhow::{Context, Result};
use satchel_core::address::Network;
use satchel_wallet::WalletConfig;

#[derive(Clone, Debug)]
pub struct Config {
    /// Path to the wallet file.
    pub wallet_path: PathBuf,
    pub network: Network,
    /// Esplora REST base URL.
    pub esplora_url: String,
    /// Default fee rate in sat/vB when `send` is given none.
    pub fee_rate: Option<u64>,
    pub gap_limit: Option<u32>,
    /// Payload bytes per chunk for `psbt chunk`.
    pub chunk_size: usize,
    /// Emit logs as JSON lines.
    pub json_logs: bool,
}

/// Public Esplora instance for `network`.
pub fn default_esplora_url(network: Network) -> &'static str {
    match network {
        Network::Mainnet => "https://blockstream.info/api",
        Network::Testnet => "https://blockstream.info/testnet/api",
        Network::Regtest => "http://127.0.0.1:3002",
    }
}

fn default_wallet_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".satchel")
        .join("wallet.json")
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let wallet_path = std::env::var("SATCHEL_WALLET_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_wallet_path());

        let network: Network = std::env::var("SATCHEL_NETWORK")
            .unwrap_or_else(|_| "testnet".to_string())
            .parse()
            .context("SATCHEL_NETWORK must be mainnet, testnet or regtest")?;

        let esplora_url = std::env::var("SATCHEL_ESPLORA_URL")
            .unwrap_or_else(|_| default_esplora_url(network).to_string());

        let fee_rate = std::env::var("SATCHEL_FEE_RATE")
            .ok()
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("SATCHEL_FEE_RATE must be a positive integer (sat/vB)")?;

        let gap_limit = std::env::var("SATCHEL_GAP_LIMIT")
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .context("SATCHEL_GAP_LIMIT must be a positive integer")?;

        let chunk_size: usize = std::env::var("SATCHEL_CHUNK_SIZE")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .context("SATCHEL_CHUNK_SIZE must be a positive integer")?;

        let json_logs = std::env::var("SATCHEL_LOG_FORMAT").is_ok_and(|v| v == "json");

        Ok(Config {
            wallet_path,
            network,
            esplora_url,
            fee_rate,
            gap_limit,
            chunk_size,
            json_logs,
        })
    }

    /// Switch network, moving the Esplora URL along unless it was set
    /// explicitly.
    pub fn with_network(mut self, network: Network) -> Self {
        if self.esplora_url == default_esplora_url(self.network) {
            self.esplora_url = default_esplora_url(network).to_string();
        }
        self.network = network;
        self
    }

    /// Wallet settings derived from this configuration.
    pub fn wallet_config(&self) -> WalletConfig {
        let mut config = WalletConfig::for_network(self.network);
        if let Some(rate) = self.fee_rate {
            config.fees.default_fee_rate = rate;
        }
        if let Some(gap) = self.gap_limit {
            config.gap_limit = gap;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            wallet_path: PathBuf::from("/tmp/w.json"),
            network: Network::Testnet,
            esplora_url: default_esplora_url(Network::Testnet).to_string(),
            fee_rate: None,
            gap_limit: None,
            chunk_size: 300,
            json_logs: false,
        }
    }

    #[test]
    fn network_switch_moves_default_url() {
        let cfg = base().with_network(Network::Mainnet);
        assert_eq!(cfg.esplora_url, "https://blockstream.info/api");
    }

    #[test]
    fn network_switch_keeps_custom_url() {
        let mut cfg = base();
        cfg.esplora_url = "http://localhost:3000".into();
        let cfg = cfg.with_network(Network::Mainnet);
        assert_eq!(cfg.esplora_url, "http://localhost:3000");
    }

    #[test]
    fn overrides_reach_wallet_config() {
        let mut cfg = base();
        cfg.fee_rate = Some(7);
        cfg.gap_limit = Some(5);
        let wc = cfg.wallet_config();
        assert_eq!(wc.network, Network::Testnet);
        assert_eq!(wc.fees.default_fee_rate, 7);
        assert_eq!(wc.gap_limit, 5);
    }
}
