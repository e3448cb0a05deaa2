//! PSBT signing state machine.
//!
//! ```text
//! Unsigned -> PartiallySigned(k of m) -> Finalized -> (extract) raw tx
//! ```
//!
//! Every transition takes the PSBT by reference and returns a new value, so
//! a signing round can be interrupted and resumed from whatever copy the
//! caller persisted. Only [`finalize`] is one-way: it drops the partial
//! signatures in favour of the final unlocking scripts.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bitcoin::bip32::{ChildNumber, DerivationPath};
use bitcoin::consensus::encode::{serialize, serialize_hex};
use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_PUSHNUM_1, OP_PUSHNUM_16};
use bitcoin::psbt::{Input, Psbt};
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::secp256k1::{Message, Secp256k1, SecretKey, Signing, Verification};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{
    CompressedPublicKey, PublicKey, Script, ScriptBuf, Transaction, TxIn, TxOut, Witness,
};
use tracing::debug;

use satchel_core::address::ScriptType;

use crate::account::AddressInfo;
use crate::builder::UnsignedTransaction;
use crate::error::PsbtError;
use crate::keys::KeyNode;
use crate::raw_key::RawKey;

/// Where a PSBT is in its signing round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PsbtState {
    Unsigned,
    /// `signatures` is the lowest count across unfinalized inputs.
    PartiallySigned { signatures: usize, required: usize },
    Finalized,
}

/// How an input is spent, recovered from its PSBT fields.
#[derive(Debug, Clone)]
struct InputPlan {
    script_type: ScriptType,
    /// Multisig redeem or witness script.
    multisig_script: Option<ScriptBuf>,
    /// Script keys in script order (multisig only).
    keys: Vec<PublicKey>,
    required: usize,
}

impl InputPlan {
    /// Whether `key` can sign for this input.
    fn accepts(&self, input: &Input, key: &PublicKey) -> bool {
        match self.script_type {
            ScriptType::P2pkh => input
                .witness_utxo
                .as_ref()
                .is_some_and(|o| o.script_pubkey == ScriptBuf::new_p2pkh(&key.pubkey_hash())),
            ScriptType::P2wpkh => input
                .witness_utxo
                .as_ref()
                .is_some_and(|o| pays_to_wpkh(&o.script_pubkey, key)),
            ScriptType::P2shP2wpkh => input
                .redeem_script
                .as_ref()
                .is_some_and(|r| pays_to_wpkh(r, key)),
            _ => self.keys.contains(key),
        }
    }

    /// Signatures in script order from keys this input accepts.
    fn signatures<'a>(&self, input: &'a Input) -> Vec<(&'a PublicKey, &'a ecdsa::Signature)> {
        if self.script_type.is_multisig() {
            self.keys
                .iter()
                .filter_map(|k| input.partial_sigs.get_key_value(k))
                .collect()
        } else {
            input
                .partial_sigs
                .iter()
                .filter(|(k, _)| self.accepts(input, k))
                .collect()
        }
    }
}

fn pays_to_wpkh(program: &Script, key: &PublicKey) -> bool {
    key.compressed && *program == ScriptBuf::new_p2wpkh(&CompressedPublicKey(key.inner).wpubkey_hash())
}

/// A script number as multisig templates encode it: `OP_1..OP_16`, or a
/// one-byte push for 17 and up.
fn small_int(ins: &Instruction) -> Option<usize> {
    match ins {
        Instruction::Op(op)
            if op.to_u8() >= OP_PUSHNUM_1.to_u8() && op.to_u8() <= OP_PUSHNUM_16.to_u8() =>
        {
            Some((op.to_u8() - OP_PUSHNUM_1.to_u8() + 1) as usize)
        }
        Instruction::PushBytes(bytes) => match bytes.as_bytes() {
            [v] if (17..0x80).contains(v) => Some(*v as usize),
            _ => None,
        },
        _ => None,
    }
}

/// Parse `OP_m <keys..> OP_n OP_CHECKMULTISIG`.
fn parse_multisig(script: &Script) -> Option<(usize, Vec<PublicKey>)> {
    let ops = script.instructions().collect::<Result<Vec<_>, _>>().ok()?;
    let (last, body) = ops.split_last()?;
    if !matches!(last, Instruction::Op(op) if *op == OP_CHECKMULTISIG) {
        return None;
    }
    let (first, rest) = body.split_first()?;
    let (n_op, key_ops) = rest.split_last()?;
    let m = small_int(first)?;
    let n = small_int(n_op)?;
    let mut keys = Vec::with_capacity(n);
    for op in key_ops {
        match op {
            Instruction::PushBytes(bytes) => keys.push(PublicKey::from_slice(bytes.as_bytes()).ok()?),
            Instruction::Op(_) => return None,
        }
    }
    (keys.len() == n && m <= n).then_some((m, keys))
}

fn plan_input(input: &Input, index: usize) -> Result<InputPlan, PsbtError> {
    let spk = &input
        .witness_utxo
        .as_ref()
        .ok_or(PsbtError::MissingUtxo { input: index })?
        .script_pubkey;
    let unsupported = PsbtError::UnsupportedScript { input: index };

    let single = |script_type: ScriptType| InputPlan {
        script_type,
        multisig_script: None,
        keys: Vec::new(),
        required: 1,
    };
    let multisig = |script_type: ScriptType, script: &ScriptBuf| {
        parse_multisig(script).map(|(m, keys)| InputPlan {
            script_type,
            multisig_script: Some(script.clone()),
            keys,
            required: m,
        })
    };
    let witness_script = |expected: &Script| {
        input
            .witness_script
            .as_ref()
            .filter(|ws| *expected == ScriptBuf::new_p2wsh(&ws.wscript_hash()))
    };

    if spk.is_p2pkh() {
        Ok(single(ScriptType::P2pkh))
    } else if spk.is_p2wpkh() {
        Ok(single(ScriptType::P2wpkh))
    } else if spk.is_p2wsh() {
        let ws = witness_script(spk).ok_or(unsupported.clone())?;
        multisig(ScriptType::P2wsh, ws).ok_or(unsupported)
    } else if spk.is_p2sh() {
        let redeem = input
            .redeem_script
            .as_ref()
            .filter(|r| *spk == ScriptBuf::new_p2sh(&r.script_hash()))
            .ok_or(unsupported.clone())?;
        if redeem.is_p2wpkh() {
            Ok(single(ScriptType::P2shP2wpkh))
        } else if redeem.is_p2wsh() {
            let ws = witness_script(redeem).ok_or(unsupported.clone())?;
            multisig(ScriptType::P2shP2wsh, ws).ok_or(unsupported)
        } else {
            multisig(ScriptType::P2sh, redeem).ok_or(unsupported)
        }
    } else {
        Err(unsupported)
    }
}

fn is_finalized(input: &Input) -> bool {
    input.final_script_sig.is_some() || input.final_script_witness.is_some()
}

/// Wrap an unsigned transaction with the metadata each input needs to be
/// signed and finalized. `inputs` aligns with the transaction inputs.
pub fn create_psbt(
    unsigned: &UnsignedTransaction,
    inputs: &[AddressInfo],
) -> Result<Psbt, PsbtError> {
    if inputs.len() != unsigned.inputs.len() {
        return Err(PsbtError::Encoding(format!(
            "{} input descriptions for {} inputs",
            inputs.len(),
            unsigned.inputs.len()
        )));
    }
    let mut psbt = Psbt::from_unsigned_tx(unsigned.tx.clone())
        .map_err(|e| PsbtError::Encoding(e.to_string()))?;

    for (index, ((input, utxo), info)) in psbt
        .inputs
        .iter_mut()
        .zip(&unsigned.inputs)
        .zip(inputs)
        .enumerate()
    {
        if utxo.script_pubkey != info.generated.script_pubkey() {
            return Err(PsbtError::UnsupportedScript { input: index });
        }
        input.witness_utxo = Some(utxo.txout());
        input.redeem_script = info.generated.redeem_script.clone();
        input.witness_script = info.generated.witness_script.clone();
        for (key, origin) in &info.keys {
            if let Some(origin) = origin {
                input.bip32_derivation.insert(key.inner, origin.key_source());
            }
        }
    }
    debug!(inputs = psbt.inputs.len(), "psbt created");
    Ok(psbt)
}

/// Current state of the signing round.
pub fn state(psbt: &Psbt) -> Result<PsbtState, PsbtError> {
    let mut lowest: Option<(usize, usize)> = None;
    for (index, input) in psbt.inputs.iter().enumerate() {
        if is_finalized(input) {
            continue;
        }
        let plan = plan_input(input, index)?;
        let have = plan.signatures(input).len().min(plan.required);
        if lowest.is_none_or(|(h, _)| have < h) {
            lowest = Some((have, plan.required));
        }
    }
    Ok(match lowest {
        None => PsbtState::Finalized,
        Some((0, _)) if psbt.inputs.iter().all(|i| i.partial_sigs.is_empty()) => PsbtState::Unsigned,
        Some((signatures, required)) => PsbtState::PartiallySigned {
            signatures,
            required,
        },
    })
}

/// Signature count and requirement for input `index`.
pub fn input_progress(psbt: &Psbt, index: usize) -> Result<(usize, usize), PsbtError> {
    let input = psbt
        .inputs
        .get(index)
        .ok_or_else(|| PsbtError::Encoding(format!("no input {index}")))?;
    if is_finalized(input) {
        return Ok((1, 1));
    }
    let plan = plan_input(input, index)?;
    Ok((plan.signatures(input).len(), plan.required))
}

fn signature_for<C: Signing>(
    cache: &mut SighashCache<&Transaction>,
    index: usize,
    input: &Input,
    plan: &InputPlan,
    secret: &SecretKey,
    secp: &Secp256k1<C>,
) -> Result<ecdsa::Signature, PsbtError> {
    let sighash_type = EcdsaSighashType::All;
    let signing = |e: &dyn std::fmt::Display| PsbtError::Signing(format!("input {index}: {e}"));
    let prevout = input
        .witness_utxo
        .as_ref()
        .ok_or(PsbtError::MissingUtxo { input: index })?;
    let missing = || PsbtError::UnsupportedScript { input: index };

    let digest = match plan.script_type {
        ScriptType::P2pkh => cache
            .legacy_signature_hash(index, &prevout.script_pubkey, sighash_type.to_u32())
            .map_err(|e| signing(&e))?
            .to_byte_array(),
        ScriptType::P2sh => {
            let redeem = plan.multisig_script.as_ref().ok_or_else(missing)?;
            cache
                .legacy_signature_hash(index, redeem, sighash_type.to_u32())
                .map_err(|e| signing(&e))?
                .to_byte_array()
        }
        ScriptType::P2wpkh => cache
            .p2wpkh_signature_hash(index, &prevout.script_pubkey, prevout.value, sighash_type)
            .map_err(|e| signing(&e))?
            .to_byte_array(),
        ScriptType::P2shP2wpkh => {
            let redeem = input.redeem_script.as_ref().ok_or_else(missing)?;
            cache
                .p2wpkh_signature_hash(index, redeem, prevout.value, sighash_type)
                .map_err(|e| signing(&e))?
                .to_byte_array()
        }
        ScriptType::P2wsh | ScriptType::P2shP2wsh => {
            let script = plan.multisig_script.as_ref().ok_or_else(missing)?;
            cache
                .p2wsh_signature_hash(index, script, prevout.value, sighash_type)
                .map_err(|e| signing(&e))?
                .to_byte_array()
        }
    };
    let signature = secp.sign_ecdsa(&Message::from_digest(digest), secret);
    Ok(ecdsa::Signature {
        signature,
        sighash_type,
    })
}

/// Keys held by `node` that input `input` needs, with their secrets.
fn node_keys_for(input: &Input, plan: &InputPlan, node: &KeyNode) -> Vec<(PublicKey, SecretKey)> {
    let mut found: Vec<(PublicKey, SecretKey)> = Vec::new();
    let base: &[ChildNumber] = node.origin().path.as_ref();

    for (key, (fingerprint, path)) in &input.bip32_derivation {
        if *fingerprint != node.origin().fingerprint {
            continue;
        }
        let full: &[ChildNumber] = path.as_ref();
        if !full.starts_with(base) {
            continue;
        }
        let suffix = DerivationPath::from(full[base.len()..].to_vec());
        let Ok(child) = node.derive_path(&suffix) else {
            continue;
        };
        let public = child.public_key();
        if public.inner != *key || !plan.accepts(input, &public) {
            continue;
        }
        if let Some(secret) = child.private_key() {
            found.push((public, *secret));
        }
    }

    let own = node.public_key();
    if plan.accepts(input, &own) && !found.iter().any(|(k, _)| *k == own) {
        if let Some(secret) = node.private_key() {
            found.push((own, *secret));
        }
    }
    found
}

fn sign_inputs<F>(psbt: &Psbt, mut keys_for: F) -> Result<(Psbt, usize), PsbtError>
where
    F: FnMut(&Input, &InputPlan) -> Vec<(PublicKey, SecretKey)>,
{
    let mut signed = psbt.clone();
    let tx = signed.unsigned_tx.clone();
    let mut cache = SighashCache::new(&tx);
    let secp = Secp256k1::signing_only();
    let mut added = 0;

    for (index, input) in signed.inputs.iter_mut().enumerate() {
        if is_finalized(input) {
            continue;
        }
        // Inputs this engine cannot interpret are left for other signers.
        let Ok(plan) = plan_input(input, index) else {
            continue;
        };
        for (public, mut secret) in keys_for(input, &plan) {
            if !input.partial_sigs.contains_key(&public) {
                let signature = signature_for(&mut cache, index, input, &plan, &secret, &secp);
                secret.non_secure_erase();
                input.partial_sigs.insert(public, signature?);
                added += 1;
            } else {
                secret.non_secure_erase();
            }
        }
    }
    debug!(signatures = added, "psbt signed");
    Ok((signed, added))
}

/// Add signatures from `node` and its descendants. Returns the new PSBT and
/// the number of signatures added; zero when the node holds no needed key.
pub fn sign(psbt: &Psbt, node: &KeyNode) -> Result<(Psbt, usize), PsbtError> {
    sign_inputs(psbt, |input, plan| node_keys_for(input, plan, node))
}

/// Add signatures from a single imported key.
pub fn sign_with_raw_key(psbt: &Psbt, key: &RawKey) -> Result<(Psbt, usize), PsbtError> {
    let public = key.public_key();
    sign_inputs(psbt, |input, plan| {
        if plan.accepts(input, &public) {
            vec![(public, key.private_key().inner)]
        } else {
            Vec::new()
        }
    })
}

/// Union of signatures from two copies of the same unsigned transaction.
pub fn combine(a: &Psbt, b: &Psbt) -> Result<Psbt, PsbtError> {
    if serialize(&a.unsigned_tx) != serialize(&b.unsigned_tx) {
        return Err(PsbtError::TransactionMismatch);
    }
    let mut merged = a.clone();
    merged
        .combine(b.clone())
        .map_err(|_| PsbtError::TransactionMismatch)?;
    Ok(merged)
}

fn push_bytes(bytes: Vec<u8>) -> Result<PushBytesBuf, PsbtError> {
    PushBytesBuf::try_from(bytes).map_err(|e| PsbtError::Encoding(e.to_string()))
}

fn script_sig_push(script: &Script) -> Result<ScriptBuf, PsbtError> {
    Ok(Builder::new()
        .push_slice(push_bytes(script.to_bytes())?)
        .into_script())
}

fn finalize_input(input: &mut Input, index: usize) -> Result<(), PsbtError> {
    let plan = plan_input(input, index)?;
    let signatures = plan.signatures(input);
    if signatures.len() < plan.required {
        return Err(PsbtError::InsufficientSignatures {
            input: index,
            have: signatures.len(),
            required: plan.required,
        });
    }

    let (script_sig, witness) = match plan.script_type {
        ScriptType::P2pkh => {
            let (key, sig) = signatures[0];
            let script = Builder::new()
                .push_slice(push_bytes(sig.to_vec())?)
                .push_key(key)
                .into_script();
            (Some(script), None)
        }
        ScriptType::P2wpkh | ScriptType::P2shP2wpkh => {
            let (key, sig) = signatures[0];
            let mut witness = Witness::new();
            witness.push(sig.to_vec());
            witness.push(key.to_bytes());
            let script_sig = match (&plan.script_type, &input.redeem_script) {
                (ScriptType::P2shP2wpkh, Some(redeem)) => Some(script_sig_push(redeem)?),
                _ => None,
            };
            (script_sig, Some(witness))
        }
        ScriptType::P2wsh | ScriptType::P2shP2wsh => {
            let script = plan
                .multisig_script
                .as_ref()
                .ok_or(PsbtError::UnsupportedScript { input: index })?;
            let mut witness = Witness::new();
            // CHECKMULTISIG pops one extra stack element
            witness.push(Vec::<u8>::new());
            for (_, sig) in signatures.iter().take(plan.required) {
                witness.push(sig.to_vec());
            }
            witness.push(script.to_bytes());
            let script_sig = match (&plan.script_type, &input.redeem_script) {
                (ScriptType::P2shP2wsh, Some(redeem)) => Some(script_sig_push(redeem)?),
                _ => None,
            };
            (script_sig, Some(witness))
        }
        ScriptType::P2sh => {
            let script = plan
                .multisig_script
                .as_ref()
                .ok_or(PsbtError::UnsupportedScript { input: index })?;
            let mut builder = Builder::new().push_int(0);
            for (_, sig) in signatures.iter().take(plan.required) {
                builder = builder.push_slice(push_bytes(sig.to_vec())?);
            }
            let script_sig = builder
                .push_slice(push_bytes(script.to_bytes())?)
                .into_script();
            (Some(script_sig), None)
        }
    };

    input.final_script_sig = script_sig;
    input.final_script_witness = witness;
    input.partial_sigs.clear();
    input.bip32_derivation.clear();
    input.sighash_type = None;
    input.redeem_script = None;
    input.witness_script = None;
    Ok(())
}

/// Build the final unlocking data for every input.
///
/// Fails without changing anything when any input has fewer signatures than
/// it requires.
pub fn finalize(psbt: &Psbt) -> Result<Psbt, PsbtError> {
    let mut finalized = psbt.clone();
    for (index, input) in finalized.inputs.iter_mut().enumerate() {
        if !is_finalized(input) {
            finalize_input(input, index)?;
        }
    }
    debug!(inputs = finalized.inputs.len(), "psbt finalized");
    Ok(finalized)
}

/// The network-ready transaction from a finalized PSBT.
pub fn extract(psbt: &Psbt) -> Result<Transaction, PsbtError> {
    let mut tx = psbt.unsigned_tx.clone();
    for (index, (txin, input)) in tx.input.iter_mut().zip(&psbt.inputs).enumerate() {
        if !is_finalized(input) {
            return Err(PsbtError::NotFinalized { input: index });
        }
        txin.script_sig = input.final_script_sig.clone().unwrap_or_default();
        txin.witness = input.final_script_witness.clone().unwrap_or_default();
    }
    Ok(tx)
}

/// Data pushes of a push-only script, or `None` when it runs any opcode.
fn script_pushes(script: &Script) -> Option<Vec<Vec<u8>>> {
    script
        .instructions()
        .map(|ins| match ins.ok()? {
            Instruction::PushBytes(bytes) => Some(bytes.as_bytes().to_vec()),
            Instruction::Op(_) => None,
        })
        .collect()
}

type DigestFn<'a> = dyn FnMut(EcdsaSighashType) -> Result<[u8; 32], PsbtError> + 'a;

fn signature_valid<C: Verification>(
    secp: &Secp256k1<C>,
    bytes: &[u8],
    key: &PublicKey,
    digest: &mut DigestFn<'_>,
) -> Result<bool, PsbtError> {
    let Ok(sig) = ecdsa::Signature::from_slice(bytes) else {
        return Ok(false);
    };
    let message = Message::from_digest(digest(sig.sighash_type)?);
    Ok(secp.verify_ecdsa(&message, &sig.signature, &key.inner).is_ok())
}

/// CHECKMULTISIG matching: signatures must appear in key order, and each
/// key is tried at most once.
fn multisig_valid<C, F>(
    secp: &Secp256k1<C>,
    stack: &[Vec<u8>],
    script: &Script,
    mut digest: F,
) -> Result<bool, PsbtError>
where
    C: Verification,
    F: FnMut(EcdsaSighashType) -> Result<[u8; 32], PsbtError>,
{
    let Some((m, keys)) = parse_multisig(script) else {
        return Ok(false);
    };
    let Some((dummy, sigs)) = stack.split_first() else {
        return Ok(false);
    };
    if !dummy.is_empty() || sigs.len() != m {
        return Ok(false);
    }
    let mut keys = keys.iter();
    for sig in sigs {
        let mut matched = false;
        for key in keys.by_ref() {
            if signature_valid(secp, sig, key, &mut digest)? {
                matched = true;
                break;
            }
        }
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn verify_input<C: Verification>(
    cache: &mut SighashCache<&Transaction>,
    secp: &Secp256k1<C>,
    index: usize,
    txin: &TxIn,
    prevout: &TxOut,
) -> Result<(), PsbtError> {
    let invalid = PsbtError::InvalidSignature { input: index };
    let signing = |e: &dyn std::fmt::Display| PsbtError::Signing(format!("input {index}: {e}"));
    let spk = &prevout.script_pubkey;
    let mut pushes = script_pushes(&txin.script_sig).ok_or(invalid.clone())?;
    let witness: Vec<Vec<u8>> = txin.witness.iter().map(<[u8]>::to_vec).collect();

    let program = if spk.is_p2sh() {
        let redeem = ScriptBuf::from_bytes(pushes.pop().ok_or(invalid.clone())?);
        if *spk != ScriptBuf::new_p2sh(&redeem.script_hash()) {
            return Err(invalid);
        }
        redeem
    } else {
        spk.clone()
    };

    let valid = if program.is_p2wpkh() {
        let [sig, key] = witness.as_slice() else {
            return Err(invalid);
        };
        let key = PublicKey::from_slice(key).map_err(|_| invalid.clone())?;
        pushes.is_empty()
            && pays_to_wpkh(&program, &key)
            && signature_valid(secp, sig, &key, &mut |ty| {
                Ok(cache
                    .p2wpkh_signature_hash(index, &program, prevout.value, ty)
                    .map_err(|e| signing(&e))?
                    .to_byte_array())
            })?
    } else if program.is_p2wsh() {
        let (script, stack) = witness.split_last().ok_or(invalid.clone())?;
        let script = ScriptBuf::from_bytes(script.clone());
        pushes.is_empty()
            && program == ScriptBuf::new_p2wsh(&script.wscript_hash())
            && multisig_valid(secp, stack, &script, |ty| {
                Ok(cache
                    .p2wsh_signature_hash(index, &script, prevout.value, ty)
                    .map_err(|e| signing(&e))?
                    .to_byte_array())
            })?
    } else if program.is_p2pkh() {
        let [sig, key] = pushes.as_slice() else {
            return Err(invalid);
        };
        let key = PublicKey::from_slice(key).map_err(|_| invalid.clone())?;
        witness.is_empty()
            && program == ScriptBuf::new_p2pkh(&key.pubkey_hash())
            && signature_valid(secp, sig, &key, &mut |ty| {
                Ok(cache
                    .legacy_signature_hash(index, &program, ty.to_u32())
                    .map_err(|e| signing(&e))?
                    .to_byte_array())
            })?
    } else if spk.is_p2sh() {
        witness.is_empty()
            && multisig_valid(secp, &pushes, &program, |ty| {
                Ok(cache
                    .legacy_signature_hash(index, &program, ty.to_u32())
                    .map_err(|e| signing(&e))?
                    .to_byte_array())
            })?
    } else {
        return Err(PsbtError::UnsupportedScript { input: index });
    };

    if valid { Ok(()) } else { Err(invalid) }
}

/// Check a signed transaction against the outputs it spends.
///
/// Every revealed redeem or witness script must hash to its previous
/// output, and every signature must verify under the sighash it commits
/// to. Multisig signatures must follow the key order of the script.
pub fn verify_extracted(tx: &Transaction, prevouts: &[TxOut]) -> Result<(), PsbtError> {
    if prevouts.len() != tx.input.len() {
        return Err(PsbtError::Encoding(format!(
            "{} previous outputs for {} inputs",
            prevouts.len(),
            tx.input.len()
        )));
    }
    let secp = Secp256k1::verification_only();
    let mut cache = SighashCache::new(tx);
    for (index, (txin, prevout)) in tx.input.iter().zip(prevouts).enumerate() {
        verify_input(&mut cache, &secp, index, txin, prevout)?;
    }
    debug!(inputs = tx.input.len(), "transaction verified");
    Ok(())
}

/// [`extract`] as consensus-encoded hex, ready for broadcast.
pub fn extract_hex(psbt: &Psbt) -> Result<String, PsbtError> {
    Ok(serialize_hex(&extract(psbt)?))
}

pub fn to_base64(psbt: &Psbt) -> String {
    STANDARD.encode(psbt.serialize())
}

pub fn from_base64(encoded: &str) -> Result<Psbt, PsbtError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| PsbtError::Encoding(e.to_string()))?;
    Psbt::deserialize(&bytes).map_err(|e| PsbtError::Encoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Account;
    use crate::builder::TransactionBuilder;
    use crate::coin_selection::CoinSelector;
    use crate::fee::InputProfile;
    use crate::keys::{account_path, derive_node, KeyNode, Purpose};
    use crate::mnemonic::mnemonic_to_seed;
    use crate::multisig::{assemble_account, export_cosigner};
    use crate::raw_key::decode_raw_key;
    use bitcoin::{OutPoint, Txid};
    use satchel_core::address::{parse_address, AddressType, MultisigAddressType, Network};
    use satchel_core::types::{Confirmation, Utxo};

    const ABANDON_ABOUT: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
    const PHRASES: [&str; 3] = [
        ABANDON_ABOUT,
        "legal winner thank year wave sausage worth useful legal winner thank yellow",
        "letter advice cage absurd amount doctor acoustic avoid letter advice cage above",
    ];
    const NET: Network = Network::Testnet;
    const DEST: &str = "tb1q6rz28mcfaxtmd6v789l9rrlrusdprr9pqcpvkl";

    fn master(phrase: &str) -> KeyNode {
        KeyNode::master(&mnemonic_to_seed(phrase, "").unwrap(), NET).unwrap()
    }

    fn funded(account: &Account, values: &[u64]) -> (Vec<Utxo>, Vec<AddressInfo>) {
        let info = account.address_info(0, false, NET).unwrap();
        let utxos = values
            .iter()
            .enumerate()
            .map(|(i, v)| Utxo {
                outpoint: OutPoint::new(Txid::from_byte_array([i as u8 + 1; 32]), 0),
                value: *v,
                script_pubkey: info.generated.script_pubkey(),
                confirmation: Confirmation::Confirmed { height: 10 },
            })
            .collect();
        (utxos, vec![info; values.len()])
    }

    fn build_psbt(account: &Account, input: InputProfile, values: &[u64], amount: u64) -> Psbt {
        let (utxos, infos) = funded(account, values);
        let change = account.address_info(0, true, NET).unwrap().generated.address;
        let mut builder = TransactionBuilder::new();
        builder.add_recipient(parse_address(DEST, NET).unwrap(), amount);
        let unsigned = builder
            .build(&utxos, &change, input, &mut CoinSelector::new())
            .unwrap();
        let by_outpoint: Vec<AddressInfo> = unsigned
            .inputs
            .iter()
            .map(|u| {
                let i = utxos.iter().position(|x| x.outpoint == u.outpoint).unwrap();
                infos[i].clone()
            })
            .collect();
        create_psbt(&unsigned, &by_outpoint).unwrap()
    }

    fn single_sig_account(address_type: AddressType) -> Account {
        let seed = mnemonic_to_seed(ABANDON_ABOUT, "").unwrap();
        let path = account_path(address_type.into(), NET, 0).unwrap();
        Account::single_sig(0, address_type, &derive_node(&seed, &path, NET).unwrap())
    }

    fn multisig_account(m: usize, address_type: MultisigAddressType) -> Account {
        let cosigners = PHRASES
            .iter()
            .map(|p| {
                let seed = mnemonic_to_seed(p, "").unwrap();
                let mut record = export_cosigner(&seed, address_type, 0, NET).unwrap();
                record.is_self = false;
                record
            })
            .collect();
        Account::multisig(0, assemble_account(cosigners, m, 3, address_type, NET).unwrap())
    }

    fn verify_all(tx: &Transaction, prevouts: &[TxOut]) {
        assert_eq!(tx.input.len(), prevouts.len());
        verify_extracted(tx, prevouts).unwrap();
    }

    fn prevouts(psbt: &Psbt) -> Vec<TxOut> {
        psbt.inputs.iter().map(|i| i.witness_utxo.clone().unwrap()).collect()
    }

    /// A finalized 2-of-3 spend signed by the first and third co-signers.
    fn signed_multisig(
        address_type: MultisigAddressType,
        script_type: ScriptType,
    ) -> (Transaction, Vec<TxOut>) {
        let account = multisig_account(2, address_type);
        let profile = InputProfile::Multisig { script_type, m: 2, n: 3 };
        let psbt = build_psbt(&account, profile, &[300_000], 100_000);
        let (a, _) = sign(&psbt, &master(PHRASES[0])).unwrap();
        let (b, _) = sign(&a, &master(PHRASES[2])).unwrap();
        (extract(&finalize(&b).unwrap()).unwrap(), prevouts(&psbt))
    }

    fn with_witness(tx: &Transaction, items: Vec<Vec<u8>>) -> Transaction {
        let mut tampered = tx.clone();
        tampered.input[0].witness = Witness::from_slice(&items);
        tampered
    }

    #[test]
    fn single_sig_round_for_each_address_type() {
        for (address_type, profile) in [
            (AddressType::NativeSegwit, InputProfile::P2wpkh),
            (AddressType::NestedSegwit, InputProfile::P2shP2wpkh),
            (AddressType::Legacy, InputProfile::P2pkh { compressed: true }),
        ] {
            let account = single_sig_account(address_type);
            let psbt = build_psbt(&account, profile, &[100_000, 200_000], 150_000);
            assert_eq!(state(&psbt).unwrap(), PsbtState::Unsigned);

            let (signed, added) = sign(&psbt, &master(ABANDON_ABOUT)).unwrap();
            assert_eq!(added, signed.inputs.len());
            let finalized = finalize(&signed).unwrap();
            assert_eq!(state(&finalized).unwrap(), PsbtState::Finalized);
            let tx = extract(&finalized).unwrap();
            verify_all(&tx, &prevouts(&psbt));
            match address_type {
                AddressType::Legacy => assert!(tx.input[0].witness.is_empty()),
                AddressType::NativeSegwit => assert!(tx.input[0].script_sig.is_empty()),
                AddressType::NestedSegwit => {
                    assert!(!tx.input[0].script_sig.is_empty());
                    assert_eq!(tx.input[0].witness.len(), 2);
                }
            }
        }
    }

    #[test]
    fn p2wpkh_signature_verifies() {
        let account = single_sig_account(AddressType::NativeSegwit);
        let psbt = build_psbt(&account, InputProfile::P2wpkh, &[500_000], 100_000);
        let (signed, _) = sign(&psbt, &master(ABANDON_ABOUT)).unwrap();

        let input = &signed.inputs[0];
        let prevout = input.witness_utxo.as_ref().unwrap();
        let (key, sig) = input.partial_sigs.iter().next().unwrap();
        let mut cache = SighashCache::new(&signed.unsigned_tx);
        let sighash = cache
            .p2wpkh_signature_hash(0, &prevout.script_pubkey, prevout.value, EcdsaSighashType::All)
            .unwrap();
        let secp = Secp256k1::verification_only();
        secp.verify_ecdsa(&Message::from_digest(sighash.to_byte_array()), &sig.signature, &key.inner)
            .unwrap();
    }

    #[test]
    fn signing_is_idempotent() {
        let account = single_sig_account(AddressType::NativeSegwit);
        let psbt = build_psbt(&account, InputProfile::P2wpkh, &[500_000], 100_000);
        let node = master(ABANDON_ABOUT);
        let (once, first) = sign(&psbt, &node).unwrap();
        let (twice, second) = sign(&once, &node).unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0);
        assert_eq!(once, twice);
    }

    #[test]
    fn foreign_key_is_noop() {
        let account = single_sig_account(AddressType::NativeSegwit);
        let psbt = build_psbt(&account, InputProfile::P2wpkh, &[500_000], 100_000);
        let (after, added) = sign(&psbt, &master(PHRASES[1])).unwrap();
        assert_eq!(added, 0);
        assert_eq!(after, psbt);
    }

    #[test]
    fn sign_leaves_input_untouched() {
        let account = single_sig_account(AddressType::NativeSegwit);
        let psbt = build_psbt(&account, InputProfile::P2wpkh, &[500_000], 100_000);
        let before = psbt.clone();
        let _ = sign(&psbt, &master(ABANDON_ABOUT)).unwrap();
        assert_eq!(psbt, before);
    }

    #[test]
    fn account_level_node_can_sign() {
        let account = single_sig_account(AddressType::NativeSegwit);
        let psbt = build_psbt(&account, InputProfile::P2wpkh, &[500_000], 100_000);
        let seed = mnemonic_to_seed(ABANDON_ABOUT, "").unwrap();
        let path = account_path(Purpose::NativeSegwit, NET, 0).unwrap();
        let node = derive_node(&seed, &path, NET).unwrap();
        let (_, added) = sign(&psbt, &node).unwrap();
        assert_eq!(added, 1);
    }

    #[test]
    fn multisig_threshold_enforced() {
        let account = multisig_account(2, MultisigAddressType::P2wsh);
        let profile = InputProfile::Multisig {
            script_type: ScriptType::P2wsh,
            m: 2,
            n: 3,
        };
        let psbt = build_psbt(&account, profile, &[300_000], 100_000);

        let (one, _) = sign(&psbt, &master(PHRASES[0])).unwrap();
        assert_eq!(
            state(&one).unwrap(),
            PsbtState::PartiallySigned {
                signatures: 1,
                required: 2
            }
        );
        assert_eq!(
            finalize(&one),
            Err(PsbtError::InsufficientSignatures {
                input: 0,
                have: 1,
                required: 2
            })
        );

        let (other, _) = sign(&psbt, &master(PHRASES[2])).unwrap();
        let combined = combine(&one, &other).unwrap();
        assert_eq!(input_progress(&combined, 0).unwrap(), (2, 2));
        let finalized = finalize(&combined).unwrap();
        let tx = extract(&finalized).unwrap();
        // empty, two signatures, witness script
        assert_eq!(tx.input[0].witness.len(), 4);
        assert!(extract_hex(&finalized).unwrap().starts_with("02000000"));
    }

    #[test]
    fn bare_p2sh_multisig_finalizes() {
        let account = multisig_account(2, MultisigAddressType::P2sh);
        let profile = InputProfile::Multisig {
            script_type: ScriptType::P2sh,
            m: 2,
            n: 3,
        };
        let psbt = build_psbt(&account, profile, &[300_000], 100_000);
        let (a, _) = sign(&psbt, &master(PHRASES[1])).unwrap();
        let (b, _) = sign(&a, &master(PHRASES[2])).unwrap();
        let tx = extract(&finalize(&b).unwrap()).unwrap();
        assert!(tx.input[0].witness.is_empty());
        assert!(tx.input[0].script_sig.len() > 2 * 70);
        verify_all(&tx, &prevouts(&psbt));
    }

    #[test]
    fn every_multisig_form_verifies() {
        for (address_type, script_type) in [
            (MultisigAddressType::P2wsh, ScriptType::P2wsh),
            (MultisigAddressType::P2shP2wsh, ScriptType::P2shP2wsh),
            (MultisigAddressType::P2sh, ScriptType::P2sh),
        ] {
            let (tx, prevouts) = signed_multisig(address_type, script_type);
            verify_all(&tx, &prevouts);
        }
    }

    #[test]
    fn altered_signature_fails_verification() {
        let account = single_sig_account(AddressType::NativeSegwit);
        let psbt = build_psbt(&account, InputProfile::P2wpkh, &[500_000], 100_000);
        let (signed, _) = sign(&psbt, &master(ABANDON_ABOUT)).unwrap();
        let tx = extract(&finalize(&signed).unwrap()).unwrap();

        let mut items: Vec<Vec<u8>> = tx.input[0].witness.iter().map(<[u8]>::to_vec).collect();
        // inside the r value of the DER signature
        items[0][10] ^= 0x01;
        assert_eq!(
            verify_extracted(&with_witness(&tx, items), &prevouts(&psbt)),
            Err(PsbtError::InvalidSignature { input: 0 })
        );
    }

    #[test]
    fn multisig_signatures_must_follow_key_order() {
        let (tx, prevouts) = signed_multisig(MultisigAddressType::P2wsh, ScriptType::P2wsh);
        let mut items: Vec<Vec<u8>> = tx.input[0].witness.iter().map(<[u8]>::to_vec).collect();
        items.swap(1, 2);
        assert_eq!(
            verify_extracted(&with_witness(&tx, items), &prevouts),
            Err(PsbtError::InvalidSignature { input: 0 })
        );
    }

    #[test]
    fn witness_script_must_match_output() {
        let (tx, prevouts) = signed_multisig(MultisigAddressType::P2wsh, ScriptType::P2wsh);
        let mut items: Vec<Vec<u8>> = tx.input[0].witness.iter().map(<[u8]>::to_vec).collect();
        let script = ScriptBuf::from_bytes(items.pop().unwrap());
        let (_, keys) = parse_multisig(&script).unwrap();
        // 1-of-3 over the same keys hashes to a different program
        let looser = satchel_core::address::multisig_redeem_script(&keys, 1).unwrap();
        items.remove(2);
        items.push(looser.to_bytes());
        assert_eq!(
            verify_extracted(&with_witness(&tx, items), &prevouts),
            Err(PsbtError::InvalidSignature { input: 0 })
        );
    }

    #[test]
    fn signature_for_another_output_rejected() {
        let (tx, mut prevouts) = signed_multisig(MultisigAddressType::P2wsh, ScriptType::P2wsh);
        prevouts[0].value += bitcoin::Amount::from_sat(1);
        assert_eq!(
            verify_extracted(&tx, &prevouts),
            Err(PsbtError::InvalidSignature { input: 0 })
        );
        assert!(matches!(
            verify_extracted(&tx, &[]),
            Err(PsbtError::Encoding(_))
        ));
    }

    #[test]
    fn seventeen_key_script_parses() {
        let secp = Secp256k1::signing_only();
        let keys: Vec<PublicKey> = (1..=17u8)
            .map(|i| {
                let secret = SecretKey::from_slice(&[i; 32]).unwrap();
                PublicKey::new(secret.public_key(&secp))
            })
            .collect();
        let script = satchel_core::address::multisig_redeem_script(&keys, 2).unwrap();
        assert_eq!(parse_multisig(&script), Some((2, keys.clone())));

        let twenty: Vec<PublicKey> = (1..=20u8)
            .map(|i| PublicKey::new(SecretKey::from_slice(&[i; 32]).unwrap().public_key(&secp)))
            .collect();
        let script = satchel_core::address::multisig_redeem_script(&twenty, 18).unwrap();
        assert_eq!(parse_multisig(&script).map(|(m, k)| (m, k.len())), Some((18, 20)));

        // a push of 0x80 is a negative script number
        let negative = Builder::new()
            .push_slice(push_bytes(vec![0x80]).unwrap())
            .push_key(&keys[0])
            .push_int(1)
            .push_opcode(OP_CHECKMULTISIG)
            .into_script();
        assert_eq!(parse_multisig(&negative), None);
    }

    #[test]
    fn combine_rejects_different_transactions() {
        let account = single_sig_account(AddressType::NativeSegwit);
        let a = build_psbt(&account, InputProfile::P2wpkh, &[500_000], 100_000);
        let b = build_psbt(&account, InputProfile::P2wpkh, &[500_000], 120_000);
        assert_eq!(combine(&a, &b), Err(PsbtError::TransactionMismatch));
    }

    #[test]
    fn extract_requires_finalize() {
        let account = single_sig_account(AddressType::NativeSegwit);
        let psbt = build_psbt(&account, InputProfile::P2wpkh, &[500_000], 100_000);
        assert_eq!(extract(&psbt), Err(PsbtError::NotFinalized { input: 0 }));
    }

    #[test]
    fn base64_roundtrip() {
        let account = single_sig_account(AddressType::NativeSegwit);
        let psbt = build_psbt(&account, InputProfile::P2wpkh, &[500_000], 100_000);
        let text = to_base64(&psbt);
        assert!(text.starts_with("cHNidP8"));
        assert_eq!(from_base64(&text).unwrap(), psbt);
        assert!(matches!(from_base64("not a psbt"), Err(PsbtError::Encoding(_))));
    }

    #[test]
    fn raw_key_signs_imported_account() {
        let key = decode_raw_key("KwDiBf89QgGbjEhKnhXJuH7LrciVrZi3qYjgd9M7rFU73sVHnoWn").unwrap();
        // same secret as a testnet key
        let testnet = bitcoin::PrivateKey {
            network: bitcoin::NetworkKind::Test,
            ..key.private_key()
        };
        let key = decode_raw_key(&testnet.to_wif()).unwrap();
        let account = Account::imported(1, AddressType::Legacy, key.public_key());
        let psbt = build_psbt(&account, InputProfile::P2pkh { compressed: true }, &[500_000], 100_000);

        assert_eq!(sign(&psbt, &master(ABANDON_ABOUT)).unwrap().1, 0);
        let (signed, added) = sign_with_raw_key(&psbt, &key).unwrap();
        assert_eq!(added, 1);
        let tx = extract(&finalize(&signed).unwrap()).unwrap();
        assert!(!tx.input[0].script_sig.is_empty());
    }
}
