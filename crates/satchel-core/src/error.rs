//! Error types shared by every Satchel crate.
use thiserror::Error;

/// Malformed or incompatible user input. Always reported synchronously with
/// enough detail to fix the input; never silently coerced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid mnemonic: {0}")] InvalidMnemonic(String),
    #[error("invalid checksum: {0}")] InvalidChecksum(String),
    #[error("invalid format: {0}")] InvalidFormat(String),
    #[error("weak mnemonic: {0}")] WeakMnemonic(String),
    #[error("wrong network: expected {expected}, found {found}")] WrongNetwork { expected: String, found: String },
    #[error("uncompressed key cannot be used for {address_type} addresses")] UncompressedKey { address_type: String },
    #[error("invalid address: {0}")] InvalidAddress(String),
    #[error("invalid derivation path: {0}")] InvalidPath(String),
    #[error("invalid key: {0}")] InvalidKey(String),
    #[error("invalid threshold: {m}-of-{n}")] InvalidThreshold { m: usize, n: usize },
    #[error("invalid amount: {0}")] InvalidAmount(String),
    #[error("output of {amount} sats is below the dust threshold of {threshold}")] DustOutput { amount: u64, threshold: u64 },
    #[error("invalid fee rate: {0}")] InvalidFeeRate(String),
}

/// Failures reported by the external blockchain data client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("client unavailable: {0}")] Unavailable(String),
    #[error("invalid client response: {0}")] InvalidResponse(String),
    #[error("broadcast rejected: {0}")] Rejected(String),
}
