//! Wallet configuration.
//!
//! Network-policy numbers (dust threshold, fee-rate bounds, gap limit, rate
//! limits) live here rather than inline. Every field has a default, and
//! partially written config files fill the rest from [`Default`].

use serde::{Deserialize, Serialize};

use satchel_core::address::Network;
use satchel_core::constants::{
    DEFAULT_DUST_THRESHOLD, DEFAULT_FEE_RATE, DEFAULT_GAP_LIMIT, MAX_FEE_RATE,
    MIN_RELAY_FEE_RATE,
};
use satchel_core::error::ValidationError;

use crate::encryption::KdfParams;

/// Fee and dust policy. Rates are whole sat/vB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeePolicy {
    /// Outputs (including change) below this many sats are never created.
    pub dust_threshold: u64,
    pub min_fee_rate: u64,
    /// Rate used when the caller does not supply one.
    pub default_fee_rate: u64,
    pub max_fee_rate: u64,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            dust_threshold: DEFAULT_DUST_THRESHOLD,
            min_fee_rate: MIN_RELAY_FEE_RATE,
            default_fee_rate: DEFAULT_FEE_RATE,
            max_fee_rate: MAX_FEE_RATE,
        }
    }
}

impl FeePolicy {
    /// Resolve an optional caller-supplied rate against the policy bounds.
    pub fn resolve_rate(&self, requested: Option<u64>) -> Result<u64, ValidationError> {
        let rate = requested.unwrap_or(self.default_fee_rate);
        if rate < self.min_fee_rate || rate > self.max_fee_rate {
            return Err(ValidationError::InvalidFeeRate(format!(
                "{rate} sat/vB outside [{}, {}]",
                self.min_fee_rate, self.max_fee_rate
            )));
        }
        Ok(rate)
    }
}

/// Attempts allowed per window for a rate-limited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_attempts: u32,
    pub window_secs: u64,
}

impl RateLimitConfig {
    pub const fn new(max_attempts: u32, window_secs: u64) -> Self {
        Self {
            max_attempts,
            window_secs,
        }
    }
}

/// Top-level configuration for a [`crate::wallet::Wallet`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub network: Network,
    /// Work factor for newly sealed vault blobs.
    pub kdf: KdfParams,
    pub fees: FeePolicy,
    /// Unused receive addresses kept ahead of the last used one.
    pub gap_limit: u32,
    pub wallet_creation_limit: RateLimitConfig,
    pub key_import_limit: RateLimitConfig,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            kdf: KdfParams::default(),
            fees: FeePolicy::default(),
            gap_limit: DEFAULT_GAP_LIMIT,
            wallet_creation_limit: RateLimitConfig::new(5, 60),
            key_import_limit: RateLimitConfig::new(10, 60),
        }
    }
}

impl WalletConfig {
    /// Defaults for `network`.
    pub fn for_network(network: Network) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    /// Reject configurations no operation could work with.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let fees = &self.fees;
        if fees.min_fee_rate == 0 || fees.min_fee_rate > fees.max_fee_rate {
            return Err(ValidationError::InvalidFeeRate(format!(
                "bounds [{}, {}]",
                fees.min_fee_rate, fees.max_fee_rate
            )));
        }
        fees.resolve_rate(None)?;
        if self.gap_limit == 0 {
            return Err(ValidationError::InvalidFormat("gap limit must be positive".into()));
        }
        Ok(())
    }
}
