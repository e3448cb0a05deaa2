//! Protocol and policy constants. All monetary values in satoshis (1 BTC = 10^8 sats).
//!
//! Protocol invariants (script limits, purposes) are fixed. Network-policy
//! numbers (dust threshold, fee rates, gap limit) are only *defaults*; the
//! wallet reads the effective values from its configuration.

pub const COIN: u64 = 100_000_000;

/// Maximum number of keys in a bare or nested P2SH multisig script.
///
/// A redeem script is limited to 520 bytes; 15 compressed keys is the
/// largest set that fits.
pub const MAX_P2SH_MULTISIG_KEYS: usize = 15;

/// Maximum number of keys in a native or nested witness multisig script.
pub const MAX_WITNESS_MULTISIG_KEYS: usize = 20;

/// BIP-44 purpose for legacy P2PKH accounts.
pub const PURPOSE_LEGACY: u32 = 44;
/// BIP-45 purpose for bare P2SH multisig accounts.
pub const PURPOSE_MULTISIG_LEGACY: u32 = 45;
/// BIP-48 purpose for witness multisig accounts.
pub const PURPOSE_MULTISIG: u32 = 48;
/// BIP-49 purpose for P2SH-wrapped P2WPKH accounts.
pub const PURPOSE_NESTED_SEGWIT: u32 = 49;
/// BIP-84 purpose for native P2WPKH accounts.
pub const PURPOSE_NATIVE_SEGWIT: u32 = 84;

/// BIP-48 script type for P2SH-P2WSH multisig.
pub const BIP48_SCRIPT_NESTED: u32 = 1;
/// BIP-48 script type for native P2WSH multisig.
pub const BIP48_SCRIPT_NATIVE: u32 = 2;

/// Default dust threshold in satoshis. Outputs below this are never created.
///
/// # Examples
///
/// ```
/// use satchel_core::constants::DEFAULT_DUST_THRESHOLD;
/// assert_eq!(DEFAULT_DUST_THRESHOLD, 546);
/// ```
pub const DEFAULT_DUST_THRESHOLD: u64 = 546;

/// Default fee rate in sat/vB when the caller supplies none.
pub const DEFAULT_FEE_RATE: u64 = 2;

/// Lowest fee rate in sat/vB accepted by default relay policy.
pub const MIN_RELAY_FEE_RATE: u64 = 1;

/// Sanity ceiling for fee rates in sat/vB. Higher rates are treated as input errors.
pub const MAX_FEE_RATE: u64 = 1_000;

/// Default number of unused receive addresses kept ahead of the last used one.
pub const DEFAULT_GAP_LIMIT: u32 = 20;

/// Transaction version used for new transactions (enables BIP-68 semantics).
pub const TX_VERSION: i32 = 2;
