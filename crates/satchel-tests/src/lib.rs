//! Integration and adversarial test suite for Satchel.
//!
//! The suites under `tests/` drive the wallet end to end against an
//! in-memory chain backend and check published derivation vectors, signing
//! rounds across several co-signer wallets, and properties of coin
//! selection and chunked transport under random inputs.

pub mod helpers;
