//! Wallet error types.
//!
//! Each family maps to a different remediation: [`ValidationError`] means
//! "fix the input", [`CryptoError`] means "retry the password" or "restore
//! from backup", [`PsbtError`] and [`TransportError`] describe signing-round
//! state. [`WalletError`] wraps them all for the command surface.

use satchel_core::error::{ClientError, ValidationError};
use thiserror::Error;

/// Vault and encryption failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Authentication failed after the integrity checksum passed.
    #[error("wrong password")]
    WrongPassword,

    /// The blob's integrity checksum does not match its contents.
    #[error("vault data corrupted: {0}")]
    Corrupted(String),

    /// The blob was written by a newer engine.
    #[error("unsupported vault schema version {found} (newest supported: {supported})")]
    SchemaUnsupported {
        /// Version found in the blob header.
        found: u32,
        /// Newest version this build understands.
        supported: u32,
    },

    /// Key derivation function rejected its parameters.
    #[error("key derivation: {0}")]
    Kdf(String),

    /// Cipher failure while sealing.
    #[error("encryption: {0}")]
    Encryption(String),

    /// Decrypted payload could not be decoded.
    #[error("decoding vault payload: {0}")]
    Payload(String),
}

/// Multisig account assembly failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MultisigError {
    /// The same extended key appears more than once.
    #[error("duplicate co-signer key: {0}")]
    DuplicateKey(String),

    /// Number of co-signers differs from n.
    #[error("expected {expected} co-signers, got {found}")]
    CountMismatch { expected: usize, found: usize },

    /// A co-signer key is malformed or on the wrong network.
    #[error("invalid co-signer key: {0}")]
    InvalidKey(String),

    /// m and n are out of range for the address type.
    #[error("invalid threshold {m}-of-{n}")]
    InvalidThreshold { m: usize, n: usize },

    /// More than one co-signer is flagged as this wallet.
    #[error("more than one co-signer is marked as self")]
    MultipleSelf,
}

/// PSBT state-machine failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PsbtError {
    /// The two PSBTs do not describe the same unsigned transaction.
    #[error("unsigned transactions differ")]
    TransactionMismatch,

    /// Finalize attempted before enough signatures were collected.
    #[error("input {input}: {have} of {required} signatures")]
    InsufficientSignatures {
        input: usize,
        have: usize,
        required: usize,
    },

    /// Extraction attempted on an input that is not finalized.
    #[error("input {input} is not finalized")]
    NotFinalized { input: usize },

    /// An input lacks the previous output needed to sign or finalize it.
    #[error("input {input} is missing its previous output")]
    MissingUtxo { input: usize },

    /// An input's script is not one this engine can finalize.
    #[error("input {input} has an unsupported script")]
    UnsupportedScript { input: usize },

    /// Unlocking data that does not satisfy the output it spends.
    #[error("input {input} fails verification against its previous output")]
    InvalidSignature { input: usize },

    /// Sighash computation or signing failed.
    #[error("signing: {0}")]
    Signing(String),

    /// PSBT could not be decoded or encoded.
    #[error("psbt encoding: {0}")]
    Encoding(String),
}

/// Chunked-transport reassembly failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Nothing to chunk or reassemble.
    #[error("no data")]
    Empty,

    /// Chunk size too small to carry any payload.
    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(usize),

    /// A sequence longer than any payload this engine accepts.
    #[error("{total} chunks exceeds the limit of {max}")]
    TooManyChunks { total: usize, max: usize },

    /// Some chunks never arrived. Indices are zero-based.
    #[error("missing chunks: {missing:?}")]
    MissingChunks { missing: Vec<usize> },

    /// A chunk claims a position outside its sequence.
    #[error("chunk index {index} out of range for {total} chunks")]
    OutOfOrder { index: usize, total: usize },

    /// Chunks from different payloads were mixed.
    #[error("inconsistent chunks: {0}")]
    Inconsistent(String),

    /// The reassembled payload does not match the announced digest.
    #[error("reassembled payload checksum mismatch")]
    ChecksumMismatch,

    /// A chunk string could not be parsed.
    #[error("malformed chunk: {0}")]
    Malformed(String),
}

/// Backup container failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackupError {
    /// Written by a newer engine.
    #[error("unsupported backup version {found} (newest supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    /// Not a backup container.
    #[error("malformed backup: {0}")]
    Malformed(String),

    /// A migration step rejected its input.
    #[error("migrating backup from v{from}: {reason}")]
    Migration { from: u32, reason: String },
}

/// Errors that can occur in wallet operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    /// Malformed or incompatible input.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Vault failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Multisig assembly failure.
    #[error(transparent)]
    Multisig(#[from] MultisigError),

    /// PSBT failure.
    #[error(transparent)]
    Psbt(#[from] PsbtError),

    /// Chunk transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Backup import failure.
    #[error(transparent)]
    Backup(#[from] BackupError),

    /// Blockchain client failure, propagated unchanged.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Insufficient funds to cover the transaction amount plus fees.
    #[error("insufficient funds: have {have}, need {need}")]
    InsufficientFunds {
        /// Spendable value in satoshis.
        have: u64,
        /// Target plus fee in satoshis.
        need: u64,
    },

    /// No UTXOs available for spending.
    #[error("no UTXOs available")]
    NoUtxos,

    /// Invalid monetary amount.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Key derivation failure.
    #[error("key derivation: {0}")]
    KeyDerivation(String),

    /// Too many attempts within the rate-limit window.
    #[error("rate limited: retry in {remaining_secs}s")]
    RateLimited { remaining_secs: u64 },

    /// Operation needs the vault unlocked.
    #[error("wallet is locked")]
    Locked,

    /// No wallet has been created or restored yet.
    #[error("no wallet has been created")]
    Uninitialized,

    /// A wallet already exists and would be overwritten.
    #[error("a wallet already exists")]
    AlreadyInitialized,

    /// No account with this index.
    #[error("account {0} not found")]
    AccountNotFound(u32),

    /// Operation does not apply to this account kind.
    #[error("unsupported for this account: {0}")]
    UnsupportedAccount(String),

    /// No pending signing session with this id.
    #[error("pending session not found: {0}")]
    PendingNotFound(String),

    /// Wallet file is corrupted or has invalid format.
    #[error("corrupted file: {0}")]
    CorruptedFile(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(String),

    /// Transaction build error.
    #[error("build error: {0}")]
    BuildError(String),

    /// Serialization error.
    #[error("serialization: {0}")]
    Serialization(String),
}
