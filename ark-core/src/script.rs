use bitcoin::absolute;
use bitcoin::hashes::ripemd160;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::*;
use bitcoin::script::Builder;
use bitcoin::script::Instruction;
use bitcoin::taproot::LeafVersion;
use bitcoin::taproot::TaprootSpendInfo;
use bitcoin::ScriptBuf;
use bitcoin::TapNodeHash;
use bitcoin::XOnlyPublicKey;
use std::fmt;

/// An `N`-of-`N` multisignature [`ScriptBuf`]:
///
/// `<pk_1> OP_CHECKSIGVERIFY … <pk_{N-1}> OP_CHECKSIGVERIFY <pk_N> OP_CHECKSIG`.
///
/// # Panics
///
/// Panics if `pks` is empty.
pub fn multisig_script(pks: &[XOnlyPublicKey]) -> ScriptBuf {
    push_multisig(Builder::new(), pks).into_script()
}

/// A [`ScriptBuf`] allowing the owners of `pks` to spend together after the relative `locktime`
/// has passed from the time the corresponding output was included in a block.
pub fn csv_multisig_script(locktime: bitcoin::Sequence, pks: &[XOnlyPublicKey]) -> ScriptBuf {
    let builder = Builder::new()
        .push_int(locktime.to_consensus_u32() as i64)
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP);

    push_multisig(builder, pks).into_script()
}

/// A [`ScriptBuf`] allowing the owners of `pks` to spend together after the absolute `locktime`.
pub fn cltv_multisig_script(locktime: absolute::LockTime, pks: &[XOnlyPublicKey]) -> ScriptBuf {
    let builder = Builder::new()
        .push_int(locktime.to_consensus_u32() as i64)
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP);

    push_multisig(builder, pks).into_script()
}

/// A [`ScriptBuf`] allowing the owners of `pks` to spend together by revealing the preimage
/// behind `preimage_hash` (HASH160).
pub fn hash160_multisig_script(
    preimage_hash: &ripemd160::Hash,
    pks: &[XOnlyPublicKey],
) -> ScriptBuf {
    let builder = Builder::new()
        .push_opcode(OP_HASH160)
        .push_slice(preimage_hash.as_byte_array())
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_VERIFY);

    push_multisig(builder, pks).into_script()
}

fn push_multisig(mut builder: Builder, pks: &[XOnlyPublicKey]) -> Builder {
    let (last, rest) = pks.split_last().expect("at least one PK");

    for pk in rest {
        builder = builder.push_x_only_key(pk).push_opcode(OP_CHECKSIGVERIFY);
    }

    builder.push_x_only_key(last).push_opcode(OP_CHECKSIG)
}

/// The script pubkey for the Taproot output corresponding to the given [`TaprootSpendInfo`].
pub fn tr_script_pubkey(spend_info: &TaprootSpendInfo) -> ScriptBuf {
    let output_key = spend_info.output_key();

    Builder::new()
        .push_opcode(OP_PUSHNUM_1)
        .push_slice(output_key.serialize())
        .into_script()
}

/// The merkle root of the single _sweep_ leaf every shared internal output in a VTXO tree
/// commits to: after `expiry` the server can reclaim unspent tree outputs on its own.
pub fn sweep_tap_tree_root(expiry: bitcoin::Sequence, server_pk: XOnlyPublicKey) -> TapNodeHash {
    let sweep_script = csv_multisig_script(expiry, &[server_pk]);

    TapNodeHash::from_script(&sweep_script, LeafVersion::TapScript)
}

/// Extracts all [`XOnlyPublicKey`]s from checksig patterns in the script.
///
/// Finds all 32-byte data pushes that are immediately followed by
/// [`OP_CHECKSIG`] or [`OP_CHECKSIGVERIFY`] opcodes, in script order.
///
/// Returns an empty vector if no matching keys are found.
pub fn extract_checksig_pubkeys(script: &ScriptBuf) -> Vec<XOnlyPublicKey> {
    let instructions: Vec<_> = script.instructions().filter_map(|inst| inst.ok()).collect();

    let mut pubkeys = Vec::new();

    for window in instructions.windows(2) {
        let (push, checksig) = (&window[0], &window[1]);

        if let Instruction::PushBytes(bytes) = push {
            if bytes.len() != 32 {
                continue;
            }

            let is_checksig = matches!(
                checksig,
                Instruction::Op(op) if *op == OP_CHECKSIG || *op == OP_CHECKSIGVERIFY
            );

            if let Ok(pk) = XOnlyPublicKey::from_slice(bytes.as_bytes()) {
                if is_checksig {
                    pubkeys.push(pk);
                }
            }
        }
    }

    pubkeys
}

/// Extract the [`bitcoin::Sequence`] from a script starting with a CSV clause.
pub fn extract_sequence_from_csv_sig_script(
    script: &ScriptBuf,
) -> Result<bitcoin::Sequence, InvalidCsvSigScriptError> {
    let csv_index = script
        .to_bytes()
        .windows(2)
        .position(|window| *window == [OP_CSV.to_u8(), OP_DROP.to_u8()])
        .ok_or(InvalidCsvSigScriptError)?;

    let before_csv = &script.to_bytes()[..csv_index];

    // It is either `OP_PUSHNUM_X` (a single byte) or `OP_PUSH_BYTES_X BYTES` (more than one
    // byte).
    let sequence = if before_csv.len() > 1 {
        &before_csv[1..]
    } else {
        before_csv
    };

    let mut sequence = sequence.to_vec();
    sequence.reverse();

    let mut buffer = [0u8; 4];
    let input_len = sequence.len();
    let start_index = 4 - input_len;

    buffer[start_index..].copy_from_slice(&sequence);

    let sequence = u32::from_be_bytes(buffer);

    let sequence = bitcoin::Sequence::from_consensus(sequence);

    Ok(sequence)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidCsvSigScriptError;

impl fmt::Display for InvalidCsvSigScriptError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("invalid CSV-Sig script")
    }
}

impl std::error::Error for InvalidCsvSigScriptError {}
