//! Transaction weight and fee estimation.
//!
//! Sizes follow BIP-141 accounting: non-witness bytes weigh 4, witness bytes
//! weigh 1, and `vsize = ceil(weight / 4)`. Signatures are counted at their
//! 72-byte DER maximum (plus sighash byte) so estimates never come in low.

use satchel_core::address::ScriptType;
use serde::{Deserialize, Serialize};

/// Worst-case DER signature plus sighash flag.
const SIGNATURE_LEN: usize = 72;
const COMPRESSED_KEY_LEN: usize = 33;
const UNCOMPRESSED_KEY_LEN: usize = 65;
/// txid + vout + sequence.
const INPUT_BASE_LEN: usize = 32 + 4 + 4;
/// version + lock time.
const TX_BASE_LEN: usize = 4 + 4;
/// Segwit marker and flag bytes, counted at witness weight.
const SEGWIT_HEADER_WEIGHT: usize = 2;
const WITNESS_SCALE: usize = 4;

/// How an input will be spent, which fixes its size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InputProfile {
    P2pkh { compressed: bool },
    P2shP2wpkh,
    P2wpkh,
    /// m-of-n multisig under one of the multisig script types.
    Multisig {
        script_type: ScriptType,
        m: usize,
        n: usize,
    },
}

/// Bytes needed to encode `n` as a Bitcoin compact size.
fn compact_size_len(n: usize) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Bytes of the push opcode(s) needed for `len` bytes of data.
fn push_len(len: usize) -> usize {
    match len {
        0..=75 => 1,
        76..=0xff => 2,
        0x100..=0xffff => 3,
        _ => 5,
    }
}

/// `OP_1..OP_16` are single opcodes; larger counts need a one-byte push.
fn small_int_len(v: usize) -> usize {
    if v <= 16 { 1 } else { 2 }
}

fn multisig_script_len(m: usize, n: usize) -> usize {
    // m, n pushes of 33-byte keys, n, OP_CHECKMULTISIG
    small_int_len(m) + n * (1 + COMPRESSED_KEY_LEN) + small_int_len(n) + 1
}

/// Weight of an input whose scriptSig is `script_sig` bytes and whose
/// witness items have the given lengths.
fn input_weight(script_sig: usize, witness_items: &[usize]) -> usize {
    let base = INPUT_BASE_LEN + compact_size_len(script_sig) + script_sig;
    let witness = if witness_items.is_empty() {
        0
    } else {
        compact_size_len(witness_items.len())
            + witness_items
                .iter()
                .map(|len| compact_size_len(*len) + len)
                .sum::<usize>()
    };
    base * WITNESS_SCALE + witness
}

impl InputProfile {
    /// Profile for spending a single-key script.
    pub fn single_sig(script_type: ScriptType, compressed: bool) -> Self {
        match script_type {
            ScriptType::P2shP2wpkh => InputProfile::P2shP2wpkh,
            ScriptType::P2wpkh => InputProfile::P2wpkh,
            _ => InputProfile::P2pkh { compressed },
        }
    }

    pub fn is_segwit(&self) -> bool {
        match self {
            InputProfile::P2pkh { .. } => false,
            InputProfile::P2shP2wpkh | InputProfile::P2wpkh => true,
            InputProfile::Multisig { script_type, .. } => script_type.is_segwit(),
        }
    }

    /// Weight units this input adds to a transaction.
    pub fn weight(&self) -> usize {
        match *self {
            InputProfile::P2pkh { compressed } => {
                let key = if compressed {
                    COMPRESSED_KEY_LEN
                } else {
                    UNCOMPRESSED_KEY_LEN
                };
                input_weight(1 + SIGNATURE_LEN + 1 + key, &[])
            }
            InputProfile::P2shP2wpkh => {
                // push of the 22-byte witness program
                input_weight(1 + 22, &[SIGNATURE_LEN, COMPRESSED_KEY_LEN])
            }
            InputProfile::P2wpkh => input_weight(0, &[SIGNATURE_LEN, COMPRESSED_KEY_LEN]),
            InputProfile::Multisig { script_type, m, n } => {
                let script = multisig_script_len(m, n);
                let mut witness = vec![0usize];
                witness.extend(std::iter::repeat_n(SIGNATURE_LEN, m));
                witness.push(script);
                match script_type {
                    ScriptType::P2wsh => input_weight(0, &witness),
                    ScriptType::P2shP2wsh => input_weight(1 + 34, &witness),
                    _ => {
                        // OP_0, m signature pushes, redeem script push
                        let script_sig =
                            1 + m * (1 + SIGNATURE_LEN) + push_len(script) + script;
                        input_weight(script_sig, &[])
                    }
                }
            }
        }
    }

    /// Virtual size of this input, rounded up.
    pub fn vsize(&self) -> u64 {
        self.weight().div_ceil(WITNESS_SCALE) as u64
    }
}

/// Weight of an output paying to a script of `script_len` bytes.
pub fn output_weight(script_len: usize) -> usize {
    (8 + compact_size_len(script_len) + script_len) * WITNESS_SCALE
}

/// Total weight of a transaction with these inputs and output script lengths.
pub fn estimate_weight(inputs: &[InputProfile], output_script_lens: &[usize]) -> usize {
    let segwit = inputs.iter().any(InputProfile::is_segwit);
    let inputs_weight: usize = inputs.iter().map(InputProfile::weight).sum();
    shape_weight(inputs.len(), inputs_weight, segwit, output_script_lens)
}

fn shape_weight(
    input_count: usize,
    inputs_weight: usize,
    segwit: bool,
    output_script_lens: &[usize],
) -> usize {
    let header = (TX_BASE_LEN
        + compact_size_len(input_count)
        + compact_size_len(output_script_lens.len()))
        * WITNESS_SCALE;
    let outputs: usize = output_script_lens.iter().map(|len| output_weight(*len)).sum();
    header + if segwit { SEGWIT_HEADER_WEIGHT } else { 0 } + inputs_weight + outputs
}

/// `ceil(weight / 4)`.
pub fn vsize(weight: usize) -> u64 {
    weight.div_ceil(WITNESS_SCALE) as u64
}

/// Fee in satoshis at `fee_rate` sat/vB.
pub fn estimate_fee(inputs: &[InputProfile], output_script_lens: &[usize], fee_rate: u64) -> u64 {
    vsize(estimate_weight(inputs, output_script_lens)).saturating_mul(fee_rate)
}

/// Fee for `input_count` identical inputs. Used by coin selection, which
/// evaluates many candidate sets of one account's inputs.
pub fn fee_for_inputs(
    input: &InputProfile,
    input_count: usize,
    output_script_lens: &[usize],
    fee_rate: u64,
) -> u64 {
    let weight = shape_weight(
        input_count,
        input.weight() * input_count,
        input.is_segwit(),
        output_script_lens,
    );
    vsize(weight).saturating_mul(fee_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_input_vsizes() {
        assert_eq!(InputProfile::P2pkh { compressed: true }.vsize(), 148);
        assert_eq!(InputProfile::P2pkh { compressed: false }.vsize(), 180);
        assert_eq!(InputProfile::P2shP2wpkh.vsize(), 91);
        assert_eq!(InputProfile::P2wpkh.vsize(), 68);
    }

    #[test]
    fn legacy_inputs_cost_more_than_segwit() {
        let legacy = InputProfile::P2pkh { compressed: true }.weight();
        let nested = InputProfile::P2shP2wpkh.weight();
        let native = InputProfile::P2wpkh.weight();
        assert!(legacy > nested && nested > native);
    }

    #[test]
    fn multisig_input_grows_with_threshold() {
        let two_of_three = InputProfile::Multisig {
            script_type: ScriptType::P2wsh,
            m: 2,
            n: 3,
        };
        let three_of_five = InputProfile::Multisig {
            script_type: ScriptType::P2wsh,
            m: 3,
            n: 5,
        };
        assert!(three_of_five.weight() > two_of_three.weight());
        // 41 non-witness bytes; witness: count, empty, 2 sigs, 105-byte script
        assert_eq!(two_of_three.weight(), 41 * 4 + 1 + 1 + 2 * 73 + 106);
    }

    #[test]
    fn large_key_counts_use_data_pushes() {
        assert_eq!(multisig_script_len(2, 3), 105);
        assert_eq!(multisig_script_len(2, 16), 1 + 16 * 34 + 1 + 1);
        assert_eq!(multisig_script_len(2, 17), 1 + 17 * 34 + 2 + 1);
        assert_eq!(multisig_script_len(17, 20), 2 + 20 * 34 + 2 + 1);
        let two_of_seventeen = InputProfile::Multisig {
            script_type: ScriptType::P2wsh,
            m: 2,
            n: 17,
        };
        // 582-byte script needs a 3-byte length prefix
        assert_eq!(two_of_seventeen.weight(), 41 * 4 + 1 + 1 + 2 * 73 + 3 + 582);
    }

    #[test]
    fn bare_p2sh_multisig_is_witness_free() {
        let p2sh = InputProfile::Multisig {
            script_type: ScriptType::P2sh,
            m: 2,
            n: 3,
        };
        assert!(!p2sh.is_segwit());
        assert_eq!(p2sh.weight() % 4, 0);
        // 2-of-3 redeem script is 105 bytes, so scriptSig = 1 + 146 + 2 + 105
        assert_eq!(p2sh.vsize(), 40 + 3 + 254);
    }

    #[test]
    fn output_weights() {
        assert_eq!(output_weight(22), 31 * 4);
        assert_eq!(output_weight(25), 34 * 4);
        assert_eq!(output_weight(34), 43 * 4);
    }

    #[test]
    fn one_in_two_out_p2wpkh() {
        // 10 base + 0.5 marker + 68 input + 2 x 31 outputs = 140.5 -> 141 vB
        let fee = estimate_fee(&[InputProfile::P2wpkh], &[22, 22], 1);
        assert_eq!(fee, 141);
        assert_eq!(estimate_fee(&[InputProfile::P2wpkh], &[22, 22], 2), 282);
    }

    #[test]
    fn legacy_transaction_has_no_marker() {
        let weight = estimate_weight(&[InputProfile::P2pkh { compressed: true }], &[25]);
        assert_eq!(weight, (10 + 148 + 34) * 4);
    }

    #[test]
    fn uniform_fee_matches_general_estimate() {
        let input = InputProfile::P2shP2wpkh;
        for count in 1..6 {
            let inputs = vec![input; count];
            assert_eq!(
                fee_for_inputs(&input, count, &[22, 23], 3),
                estimate_fee(&inputs, &[22, 23], 3)
            );
        }
    }

    #[test]
    fn single_sig_profile_mapping() {
        assert_eq!(
            InputProfile::single_sig(ScriptType::P2wpkh, true),
            InputProfile::P2wpkh
        );
        assert_eq!(
            InputProfile::single_sig(ScriptType::P2pkh, false),
            InputProfile::P2pkh { compressed: false }
        );
    }
}
