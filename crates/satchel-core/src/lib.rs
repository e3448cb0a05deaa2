//! # satchel-core
//! Secret-free foundation types for the Satchel signing core: networks,
//! address generation, UTXO/history types, and the blockchain client trait.

pub mod address;
pub mod constants;
pub mod error;
pub mod traits;
pub mod types;
