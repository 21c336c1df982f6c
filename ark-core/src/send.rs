//! Building, signing and finalizing Ark (redeem) transactions: off-chain spends of VTXOs
//! submitted directly to the server, outside of a round.

use crate::anchor_output;
use crate::ArkAddress;
use crate::Error;
use crate::VTXO_CONDITION_KEY;
use bitcoin::absolute::LockTime;
use bitcoin::consensus;
use bitcoin::psbt;
use bitcoin::taproot::ControlBlock;
use bitcoin::taproot::LeafVersion;
use bitcoin::transaction;
use bitcoin::Amount;
use bitcoin::OutPoint;
use bitcoin::Psbt;
use bitcoin::ScriptBuf;
use bitcoin::TapSighashType;
use bitcoin::Transaction;
use bitcoin::TxIn;
use bitcoin::TxOut;
use bitcoin::Witness;
use std::collections::BTreeMap;

/// A VTXO to be spent into an unconfirmed VTXO.
#[derive(Debug, Clone)]
pub struct VtxoInput {
    /// The script path that will be used to spend the VTXO.
    spend_script: ScriptBuf,
    /// An optional locktime, only set if the `spend_script` uses `OP_CLTV`.
    locktime: Option<LockTime>,
    control_block: ControlBlock,
    script_pubkey: ScriptBuf,
    /// The amount of coins locked in the VTXO.
    amount: Amount,
    /// Where the VTXO would end up on the blockchain if it were to become a UTXO.
    outpoint: OutPoint,
}

impl VtxoInput {
    pub fn new(
        spend_script: ScriptBuf,
        locktime: Option<LockTime>,
        control_block: ControlBlock,
        script_pubkey: ScriptBuf,
        amount: Amount,
        outpoint: OutPoint,
    ) -> Self {
        Self {
            spend_script,
            locktime,
            control_block,
            script_pubkey,
            amount,
            outpoint,
        }
    }

    pub fn outpoint(&self) -> OutPoint {
        self.outpoint
    }

    pub fn amount(&self) -> Amount {
        self.amount
    }

    pub fn spend_info(&self) -> (&ScriptBuf, &ControlBlock) {
        (&self.spend_script, &self.control_block)
    }
}

/// Build a transaction to send VTXOs to other [`ArkAddress`]es.
///
/// Every input is annotated with its chosen spend path, ready to be signed and finalized. If
/// any input's spend path carries an absolute locktime, the transaction inherits the highest
/// one and the affected inputs get a locktime-enabling sequence number.
pub fn build_redeem_transaction(
    outputs: &[(&ArkAddress, Amount)],
    change_address: Option<&ArkAddress>,
    vtxo_inputs: &[VtxoInput],
) -> Result<Psbt, Error> {
    if vtxo_inputs.is_empty() {
        return Err(Error::transaction(
            "cannot build redeem transaction without inputs",
        ));
    }

    let mut tx_outputs = outputs
        .iter()
        .map(|(address, amount)| TxOut {
            value: *amount,
            script_pubkey: address.to_p2tr_script_pubkey(),
        })
        .collect::<Vec<_>>();

    let total_input_amount: Amount = vtxo_inputs.iter().map(|v| v.amount).sum();
    let total_output_amount: Amount = tx_outputs.iter().map(|v| v.value).sum();

    let change_amount = total_input_amount
        .checked_sub(total_output_amount)
        .ok_or_else(|| {
            Error::transaction(format!(
                "cannot cover total output amount ({total_output_amount}) with total input \
                 amount ({total_input_amount})"
            ))
        })?;

    if change_amount > Amount::ZERO {
        if let Some(change_address) = change_address {
            tx_outputs.push(TxOut {
                value: change_amount,
                script_pubkey: change_address.to_p2tr_script_pubkey(),
            });
        }
    }

    tx_outputs.push(anchor_output());

    let timelocked_inputs = vtxo_inputs
        .iter()
        .filter_map(|x| x.locktime)
        .collect::<Vec<_>>();

    let highest_timelock = timelocked_inputs
        .iter()
        .try_fold(None, |acc, a| match (acc, a) {
            (None, locktime) => Ok(Some(*locktime)),
            (Some(a @ LockTime::Blocks(h1)), LockTime::Blocks(h2)) if h1 > *h2 => Ok(Some(a)),
            (Some(LockTime::Blocks(_)), b @ LockTime::Blocks(_)) => Ok(Some(*b)),
            (Some(a @ LockTime::Seconds(t1)), LockTime::Seconds(t2)) if t1 > *t2 => Ok(Some(a)),
            (Some(LockTime::Seconds(_)), b @ LockTime::Seconds(_)) => Ok(Some(*b)),
            _ => Err(Error::transaction("incompatible locktimes")),
        })?;

    let lock_time = highest_timelock.unwrap_or(LockTime::ZERO);

    let inputs = vtxo_inputs
        .iter()
        .map(|vtxo_input| {
            let sequence = match vtxo_input.locktime {
                Some(_) => bitcoin::Sequence::ENABLE_LOCKTIME_NO_RBF,
                None => bitcoin::Sequence::MAX,
            };

            TxIn {
                previous_output: vtxo_input.outpoint,
                sequence,
                ..Default::default()
            }
        })
        .collect::<Vec<_>>();

    let unsigned_tx = Transaction {
        version: transaction::Version::non_standard(3),
        lock_time,
        input: inputs,
        output: tx_outputs,
    };

    let mut psbt = Psbt::from_unsigned_tx(unsigned_tx).map_err(Error::transaction)?;

    for (psbt_input, vtxo_input) in psbt.inputs.iter_mut().zip(vtxo_inputs.iter()) {
        psbt_input.witness_utxo = Some(TxOut {
            value: vtxo_input.amount,
            script_pubkey: vtxo_input.script_pubkey.clone(),
        });

        psbt_input.sighash_type = Some(TapSighashType::Default.into());

        psbt_input.tap_scripts = BTreeMap::from_iter([(
            vtxo_input.control_block.clone(),
            (vtxo_input.spend_script.clone(), LeafVersion::TapScript),
        )]);
    }

    Ok(psbt)
}

/// Record extra witness elements an input's spend path needs besides signatures, e.g. the
/// preimage of an HTLC gate.
///
/// The elements end up on the final witness stack directly below the leaf script.
pub fn set_condition_witness(input: &mut psbt::Input, condition_witness: &Witness) {
    let key = psbt::raw::Key {
        type_value: 222,
        key: VTXO_CONDITION_KEY.to_vec(),
    };

    input
        .unknown
        .insert(key, consensus::serialize(condition_witness));
}

/// The condition witness recorded on an input, if any.
pub fn condition_witness(input: &psbt::Input) -> Result<Option<Witness>, Error> {
    let key = psbt::raw::Key {
        type_value: 222,
        key: VTXO_CONDITION_KEY.to_vec(),
    };

    match input.unknown.get(&key) {
        Some(bytes) => {
            let witness = consensus::deserialize(bytes)
                .map_err(|e| Error::transaction(format!("invalid condition witness: {e}")))?;

            Ok(Some(witness))
        }
        None => Ok(None),
    }
}

/// Turn a fully signed PSBT into a broadcastable transaction by assembling the script-spend
/// witness of every input.
///
/// The witness stack is built to satisfy the annotated leaf script: one Schnorr signature per
/// checksig key (in reverse script order, so the first key checked is signed by the top
/// element), then any condition witness elements, then the leaf script and its control block.
pub fn finalize_redeem_transaction(psbt: &Psbt) -> Result<Transaction, Error> {
    let mut tx = psbt.unsigned_tx.clone();

    for (i, input) in psbt.inputs.iter().enumerate() {
        let (control_block, (script, leaf_version)) =
            input.tap_scripts.first_key_value().ok_or_else(|| {
                Error::transaction(format!("missing tap scripts for input {i}"))
            })?;

        let leaf_hash = bitcoin::TapLeafHash::from_script(script, *leaf_version);

        let pks = crate::script::extract_checksig_pubkeys(script);

        let mut witness = Witness::new();

        for pk in pks.iter().rev() {
            let sig = input.tap_script_sigs.get(&(*pk, leaf_hash)).ok_or_else(|| {
                Error::transaction(format!("missing signature for PK {pk} on input {i}"))
            })?;

            witness.push(sig.to_vec());
        }

        if let Some(condition_witness) = condition_witness(input)? {
            for element in condition_witness.iter() {
                witness.push(element);
            }
        }

        witness.push(script.as_bytes());
        witness.push(control_block.serialize());

        tx.input[i].witness = witness;
    }

    Ok(tx)
}
