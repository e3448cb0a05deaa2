//! Transaction builder.
//!
//! Provides a builder pattern for constructing transactions:
//! 1. Add recipients (address + amount)
//! 2. Build an unsigned transaction (performs coin selection)
//! 3. Wrap it in a PSBT for signing (see [`crate::psbt`])

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, Sequence, Transaction, TxIn, TxOut, Witness};
use tracing::debug;

use satchel_core::constants::{DEFAULT_DUST_THRESHOLD, DEFAULT_FEE_RATE, TX_VERSION};
use satchel_core::error::ValidationError;
use satchel_core::types::{Recipient, Utxo};

use crate::coin_selection::{CoinSelection, CoinSelector, SelectionParams};
use crate::error::WalletError;
use crate::fee::InputProfile;

/// An unsigned transaction ready for signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    /// The transaction with empty scriptSigs and witnesses.
    pub tx: Transaction,
    /// Spent outputs, aligned with `tx.input`.
    pub inputs: Vec<Utxo>,
    /// Position of the change output, if any.
    pub change_index: Option<usize>,
    /// Fee in satoshis.
    pub fee: u64,
}

impl UnsignedTransaction {
    pub fn total_input(&self) -> u64 {
        self.inputs.iter().map(|u| u.value).sum()
    }

    pub fn total_output(&self) -> u64 {
        self.tx.output.iter().map(|o| o.value.to_sat()).sum()
    }
}

/// Builder for unsigned transactions.
///
/// # Example
/// ```ignore
/// let unsigned = TransactionBuilder::new()
///     .add_recipient(address, 50_000)
///     .set_fee_rate(5)
///     .build(&utxos, &change_addr, InputProfile::P2wpkh, &mut selector)?;
/// ```
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    recipients: Vec<Recipient>,
    fee_rate: u64,
    dust_threshold: u64,
    lock_time: u32,
    rbf: bool,
}

impl TransactionBuilder {
    /// Create a builder with default fee rate and dust threshold, RBF enabled.
    pub fn new() -> Self {
        Self {
            recipients: Vec::new(),
            fee_rate: DEFAULT_FEE_RATE,
            dust_threshold: DEFAULT_DUST_THRESHOLD,
            lock_time: 0,
            rbf: true,
        }
    }

    /// Add a recipient to the transaction.
    pub fn add_recipient(&mut self, address: Address, amount: u64) -> &mut Self {
        self.recipients.push(Recipient::new(address, amount));
        self
    }

    /// Fee rate in sat/vB (default: [`DEFAULT_FEE_RATE`]).
    pub fn set_fee_rate(&mut self, fee_rate: u64) -> &mut Self {
        self.fee_rate = fee_rate;
        self
    }

    /// Override the dust threshold (default: [`DEFAULT_DUST_THRESHOLD`]).
    pub fn set_dust_threshold(&mut self, threshold: u64) -> &mut Self {
        self.dust_threshold = threshold;
        self
    }

    /// Set the transaction lock time (block height or timestamp).
    pub fn set_lock_time(&mut self, lock_time: u32) -> &mut Self {
        self.lock_time = lock_time;
        self
    }

    /// Signal BIP-125 replaceability on every input.
    pub fn enable_rbf(&mut self, enabled: bool) -> &mut Self {
        self.rbf = enabled;
        self
    }

    pub fn recipients(&self) -> &[Recipient] {
        &self.recipients
    }

    fn validate(&self) -> Result<u64, WalletError> {
        if self.recipients.is_empty() {
            return Err(WalletError::BuildError("no recipients".into()));
        }
        if self.fee_rate == 0 {
            return Err(ValidationError::InvalidFeeRate("fee rate must be non-zero".into()).into());
        }
        let mut total_send: u64 = 0;
        for r in &self.recipients {
            if r.amount == 0 {
                return Err(WalletError::InvalidAmount("recipient amount is zero".into()));
            }
            if r.amount < self.dust_threshold {
                return Err(ValidationError::DustOutput {
                    amount: r.amount,
                    threshold: self.dust_threshold,
                }
                .into());
            }
            total_send = total_send
                .checked_add(r.amount)
                .ok_or_else(|| WalletError::InvalidAmount("total amount overflow".into()))?;
        }
        Ok(total_send)
    }

    /// Select coins and construct the unsigned transaction.
    ///
    /// `input` describes how the account's inputs are spent, which drives
    /// the fee estimate.
    pub fn build(
        &self,
        utxos: &[Utxo],
        change_address: &Address,
        input: InputProfile,
        selector: &mut CoinSelector,
    ) -> Result<UnsignedTransaction, WalletError> {
        let total_send = self.validate()?;
        let params = SelectionParams {
            input,
            recipient_script_lens: self
                .recipients
                .iter()
                .map(|r| r.address.script_pubkey().len())
                .collect(),
            change_script_len: change_address.script_pubkey().len(),
            dust_threshold: self.dust_threshold,
        };
        let selection = selector.select(utxos, total_send, self.fee_rate, &params)?;
        self.build_unsigned(&selection, change_address)
    }

    /// Construct the transaction for an existing selection.
    ///
    /// Outputs are the recipients in insertion order, then change.
    pub fn build_unsigned(
        &self,
        selection: &CoinSelection,
        change_address: &Address,
    ) -> Result<UnsignedTransaction, WalletError> {
        let total_send = self.validate()?;
        if total_send != selection.target {
            return Err(WalletError::BuildError(format!(
                "selection targets {} but recipients total {total_send}",
                selection.target
            )));
        }

        let sequence = if self.rbf {
            Sequence::ENABLE_RBF_NO_LOCKTIME
        } else if self.lock_time > 0 {
            Sequence::ENABLE_LOCKTIME_NO_RBF
        } else {
            Sequence::MAX
        };

        let input = selection
            .selected
            .iter()
            .map(|u| TxIn {
                previous_output: u.outpoint,
                script_sig: Default::default(),
                sequence,
                witness: Witness::new(),
            })
            .collect();

        let mut output: Vec<TxOut> = self
            .recipients
            .iter()
            .map(|r| TxOut {
                value: Amount::from_sat(r.amount),
                script_pubkey: r.address.script_pubkey(),
            })
            .collect();

        let change_index = if selection.has_change() {
            output.push(TxOut {
                value: Amount::from_sat(selection.change),
                script_pubkey: change_address.script_pubkey(),
            });
            Some(output.len() - 1)
        } else {
            None
        };

        let tx = Transaction {
            version: Version(TX_VERSION),
            lock_time: LockTime::from_consensus(self.lock_time),
            input,
            output,
        };

        let unsigned = UnsignedTransaction {
            tx,
            inputs: selection.selected.clone(),
            change_index,
            fee: selection.fee,
        };
        if unsigned.total_input() != unsigned.total_output() + unsigned.fee {
            return Err(WalletError::BuildError("inputs do not balance outputs and fee".into()));
        }
        debug!(
            inputs = unsigned.inputs.len(),
            outputs = unsigned.tx.output.len(),
            fee = unsigned.fee,
            "unsigned transaction built"
        );
        Ok(unsigned)
    }
}

impl Default for TransactionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
