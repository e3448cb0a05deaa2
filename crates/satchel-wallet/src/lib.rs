//! # satchel-wallet: vault, key derivation, multisig and PSBT signing.
//!
//! Everything in Satchel that touches secrets lives here: the encrypted
//! vault, BIP-39/BIP-32 derivation, raw key import, multisig co-signer
//! coordination, coin selection, transaction building, the PSBT signing
//! state machine and the persisted backup container.
//!
//! # Modules
//!
//! - [`error`]: `WalletError` and the per-component error families
//! - [`config`]: fee policy, gap limit, rate limits, KDF work factor
//! - [`encryption`]: AES-256-GCM sealing with Argon2id password keys
//! - [`vault`]: single access point for decrypted material
//! - [`mnemonic`]: phrase generation, parsing, entropy gate
//! - [`keys`]: seeds, derivation paths, HD key nodes
//! - [`raw_key`]: WIF import
//! - [`multisig`]: co-signer records, account assembly, sorted-key addresses
//! - [`account`]: accounts and append-only address pools
//! - [`fee`]: weight and fee estimation
//! - [`coin_selection`]: branch-and-bound selection with rotation
//! - [`builder`]: unsigned transaction builder
//! - [`psbt`]: sign, combine, finalize, extract
//! - [`transport`]: chunked text transport for PSBTs
//! - [`backup`]: versioned backup container and migrations
//! - [`rate_limit`]: attempt counters
//! - [`wallet`]: high-level wallet composition

pub mod account;
pub mod backup;
pub mod builder;
pub mod coin_selection;
pub mod config;
pub mod encryption;
pub mod error;
pub mod fee;
pub mod keys;
pub mod mnemonic;
pub mod multisig;
pub mod psbt;
pub mod rate_limit;
pub mod raw_key;
pub mod transport;
pub mod vault;
pub mod wallet;

// Re-exports for convenient access
pub use account::{Account, AccountKind, AddressInfo, AddressRecord};
pub use backup::{BackupContainer, Contact, PendingSession};
pub use builder::{TransactionBuilder, UnsignedTransaction};
pub use coin_selection::{CoinSelection, CoinSelector, SelectionParams};
pub use config::{FeePolicy, RateLimitConfig, WalletConfig};
pub use encryption::{EncryptedBlob, KdfParams};
pub use error::{
    BackupError, CryptoError, MultisigError, PsbtError, TransportError, WalletError,
};
pub use fee::InputProfile;
pub use keys::{KeyNode, KeyOrigin, Seed};
pub use multisig::{CosignerRecord, MultisigConfig};
pub use psbt::PsbtState;
pub use rate_limit::RateLimiter;
pub use raw_key::RawKey;
pub use transport::{Chunk, ChunkCollector};
pub use vault::{Vault, VaultMaterial};
pub use wallet::{Wallet, WalletBalance};
