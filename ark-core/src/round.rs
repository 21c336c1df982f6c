//! Participating in a round: the MuSig2 tree signing session, forfeit transactions and
//! signing the round transaction itself.

use crate::anchor_output;
use crate::conversions::from_zkp_xonly;
use crate::conversions::to_zkp_keypair;
use crate::conversions::to_zkp_pk;
use crate::server::AggNoncePks;
use crate::server::NoncePks;
use crate::server::PartialSigTree;
use crate::tree::TxTree;
use crate::tree::TxTreeNode;
use crate::BoardingOutput;
use crate::Error;
use crate::ErrorContext;
use crate::Vtxo;
use crate::UNSPENDABLE_KEY;
use crate::VTXO_INPUT_INDEX;
use bitcoin::absolute;
use bitcoin::hashes::Hash;
use bitcoin::key::Keypair;
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1;
use bitcoin::secp256k1::schnorr;
use bitcoin::sighash::Prevouts;
use bitcoin::sighash::SighashCache;
use bitcoin::taproot;
use bitcoin::transaction;
use bitcoin::Amount;
use bitcoin::FeeRate;
use bitcoin::OutPoint;
use bitcoin::Psbt;
use bitcoin::ScriptBuf;
use bitcoin::TapLeafHash;
use bitcoin::TapNodeHash;
use bitcoin::TapSighashType;
use bitcoin::Transaction;
use bitcoin::TxIn;
use bitcoin::TxOut;
use bitcoin::Weight;
use bitcoin::XOnlyPublicKey;
use rand::CryptoRng;
use rand::Rng;
use std::collections::BTreeMap;
use std::collections::HashMap;
use zkp::musig::new_musig_nonce_pair;
use zkp::musig::MusigAggNonce;
use zkp::musig::MusigKeyAggCache;
use zkp::musig::MusigPubNonce;
use zkp::musig::MusigSecNonce;
use zkp::musig::MusigSession;
use zkp::musig::MusigSessionId;

const FORFEIT_TX_CONNECTOR_INDEX: usize = 0;
const FORFEIT_TX_VTXO_INDEX: usize = 1;

/// A UTXO that is primed to become a VTXO. Alternatively, the owner of this UTXO may decide to
/// spend it into a vanilla UTXO.
///
/// Only UTXOs with a particular script (involving an Ark server) can become VTXOs.
#[derive(Debug, Clone)]
pub struct OnChainInput {
    /// The information needed to spend the UTXO.
    boarding_output: BoardingOutput,
    /// The amount of coins locked in the UTXO.
    amount: Amount,
    /// The location of this UTXO in the blockchain.
    outpoint: OutPoint,
}

impl OnChainInput {
    pub fn new(boarding_output: BoardingOutput, amount: Amount, outpoint: OutPoint) -> Self {
        Self {
            boarding_output,
            amount,
            outpoint,
        }
    }

    pub fn boarding_output(&self) -> &BoardingOutput {
        &self.boarding_output
    }

    pub fn amount(&self) -> Amount {
        self.amount
    }

    pub fn outpoint(&self) -> OutPoint {
        self.outpoint
    }
}

/// Either a confirmed VTXO that needs to be renewed, or a pre-confirmed VTXO that needs
/// confirmation.
///
/// Alternatively, the owner of this VTXO may decide to spend it into a vanilla UTXO.
#[derive(Debug, Clone)]
pub struct VtxoInput {
    /// The information needed to spend the VTXO, besides the amount.
    vtxo: Vtxo,
    /// The amount of coins locked in the VTXO.
    amount: Amount,
    /// Where the VTXO would end up on the blockchain if it were to become a UTXO.
    outpoint: OutPoint,
}

impl VtxoInput {
    pub fn new(vtxo: Vtxo, amount: Amount, outpoint: OutPoint) -> Self {
        Self {
            vtxo,
            amount,
            outpoint,
        }
    }

    pub fn vtxo(&self) -> &Vtxo {
        &self.vtxo
    }

    pub fn amount(&self) -> Amount {
        self.amount
    }

    pub fn outpoint(&self) -> OutPoint {
        self.outpoint
    }
}

/// An input to be registered for the next round.
#[derive(Debug, Clone)]
pub enum RoundInput {
    /// An opaque note credential, forwarded to the server as-is. Notes require no forfeit
    /// transaction.
    Note(String),
    /// An on-chain boarding output.
    OnChain(OnChainInput),
    /// An off-chain VTXO.
    Vtxo(VtxoInput),
}

impl RoundInput {
    /// The tapscripts the server needs to reconstruct the input's script tree, if any.
    pub fn tapscripts(&self) -> Vec<ScriptBuf> {
        match self {
            RoundInput::Note(_) => Vec::new(),
            RoundInput::OnChain(input) => input.boarding_output().tapscripts(),
            RoundInput::Vtxo(input) => input.vtxo().tapscripts(),
        }
    }

    pub fn outpoint(&self) -> Option<OutPoint> {
        match self {
            RoundInput::Note(_) => None,
            RoundInput::OnChain(input) => Some(input.outpoint()),
            RoundInput::Vtxo(input) => Some(input.outpoint()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    NoncesGenerated,
    NoncesPublished,
    AggregatedNoncesSet,
    Signed,
}

struct NodeSigningContext {
    msg: zkp::Message,
    sec_nonce: Option<MusigSecNonce>,
    pub_nonce: MusigPubNonce,
    agg_nonce: Option<MusigAggNonce>,
}

/// Per-round MuSig2 signing state for the shared internal transactions of the VTXO tree.
///
/// The session is strictly staged: [`TreeSigningSession::pub_nonces`] must be called before
/// [`TreeSigningSession::set_aggregated_nonces`], which must be called before
/// [`TreeSigningSession::sign`]. Secret nonces are consumed on signing and dropped with the
/// session, so a session cannot be reused across rounds.
pub struct TreeSigningSession {
    own_cosigner_kp: Keypair,
    cosigner_pks: Vec<zkp::PublicKey>,
    sweep_tap_tree_root: TapNodeHash,
    stage: Stage,
    contexts: Vec<Vec<Option<NodeSigningContext>>>,
}

impl TreeSigningSession {
    /// Derive the signing context for every shared internal (non-leaf) transaction in the
    /// VTXO tree, in level-major order.
    ///
    /// For each such transaction this computes the sighash of its single input under
    /// `SIGHASH_DEFAULT` and generates a fresh nonce pair bound to the tweaked aggregate
    /// cosigner key and that message.
    pub fn new<R>(
        rng: &mut R,
        own_cosigner_kp: Keypair,
        cosigners_pubkeys: &[secp256k1::PublicKey],
        vtxo_tree: &TxTree,
        sweep_tap_tree_root: TapNodeHash,
        round_psbt: &Psbt,
    ) -> Result<Self, Error>
    where
        R: Rng + CryptoRng,
    {
        let secp_zkp = zkp::Secp256k1::new();

        let unspendable_pk: bitcoin::key::PublicKey = UNSPENDABLE_KEY.parse().expect("valid key");

        let cosigner_pks = cosigners_pubkeys
            .iter()
            .filter(|pk| **pk != unspendable_pk.inner)
            .map(|pk| to_zkp_pk(*pk))
            .collect::<Vec<_>>();

        let own_cosigner_pk = to_zkp_pk(own_cosigner_kp.public_key());

        if !cosigner_pks.contains(&own_cosigner_pk) {
            return Err(Error::crypto(format!(
                "own cosigner PK {} not found among round cosigner PKs",
                own_cosigner_kp.public_key()
            )));
        }

        let key_agg_cache =
            tweaked_key_agg_cache(&secp_zkp, &cosigner_pks, sweep_tap_tree_root)?;

        let mut contexts = Vec::new();
        for (level, nodes) in vtxo_tree.iter_levels() {
            let mut row = Vec::new();

            for node in nodes {
                if node.leaf {
                    row.push(None);
                    continue;
                }

                let msg = tree_tx_sighash(node, vtxo_tree, round_psbt)?;

                let session_id = MusigSessionId::new(rng);
                let extra_rand: [u8; 32] = rng.gen();

                let (sec_nonce, pub_nonce) = new_musig_nonce_pair(
                    &secp_zkp,
                    session_id,
                    Some(&key_agg_cache),
                    None,
                    own_cosigner_pk,
                    Some(msg),
                    Some(extra_rand),
                )
                .map_err(Error::crypto)
                .with_context(|| {
                    format!("failed to generate nonce pair for tree TX at level {level}")
                })?;

                row.push(Some(NodeSigningContext {
                    msg,
                    sec_nonce: Some(sec_nonce),
                    pub_nonce,
                    agg_nonce: None,
                }));
            }

            contexts.push(row);
        }

        Ok(Self {
            own_cosigner_kp,
            cosigner_pks,
            sweep_tap_tree_root,
            stage: Stage::NoncesGenerated,
            contexts,
        })
    }

    pub fn own_cosigner_pk(&self) -> secp256k1::PublicKey {
        self.own_cosigner_kp.public_key()
    }

    /// The matrix of public nonces to be submitted to the server, shaped like the VTXO tree.
    pub fn pub_nonces(&mut self) -> Result<NoncePks, Error> {
        if self.stage != Stage::NoncesGenerated {
            return Err(Error::signing_stage(format!(
                "cannot take public nonces at stage {:?}",
                self.stage
            )));
        }

        let nonce_pks = self
            .contexts
            .iter()
            .map(|row| {
                row.iter()
                    .map(|ctx| ctx.as_ref().map(|ctx| ctx.pub_nonce))
                    .collect()
            })
            .collect();

        self.stage = Stage::NoncesPublished;

        Ok(NoncePks::new(nonce_pks))
    }

    /// Accept the matrix of server-aggregated nonces.
    pub fn set_aggregated_nonces(&mut self, agg_nonce_pks: AggNoncePks) -> Result<(), Error> {
        if self.stage != Stage::NoncesPublished {
            return Err(Error::signing_stage(format!(
                "cannot set aggregated nonces at stage {:?}",
                self.stage
            )));
        }

        for (level, row) in self.contexts.iter_mut().enumerate() {
            for (index, ctx) in row.iter_mut().enumerate() {
                if let Some(ctx) = ctx {
                    let agg_nonce = agg_nonce_pks.get(level, index).ok_or_else(|| {
                        Error::protocol(format!(
                            "missing aggregated nonce for tree TX at ({level}, {index})"
                        ))
                    })?;

                    ctx.agg_nonce = Some(agg_nonce);
                }
            }
        }

        self.stage = Stage::AggregatedNoncesSet;

        Ok(())
    }

    /// Produce a partial signature for every shared internal transaction in the VTXO tree,
    /// under the tweaked aggregate cosigner key.
    ///
    /// The secret nonces are consumed; calling this a second time fails.
    pub fn sign(&mut self) -> Result<PartialSigTree, Error> {
        if self.stage != Stage::AggregatedNoncesSet {
            return Err(Error::signing_stage(format!(
                "cannot sign at stage {:?}",
                self.stage
            )));
        }

        let secp_zkp = zkp::Secp256k1::new();

        let own_cosigner_kp = to_zkp_keypair(&secp_zkp, &self.own_cosigner_kp);

        let key_agg_cache =
            tweaked_key_agg_cache(&secp_zkp, &self.cosigner_pks, self.sweep_tap_tree_root)?;

        let mut partial_sig_tree = Vec::with_capacity(self.contexts.len());
        for (level, row) in self.contexts.iter_mut().enumerate() {
            let mut sig_row = Vec::with_capacity(row.len());

            for (index, ctx) in row.iter_mut().enumerate() {
                let sig = match ctx {
                    Some(ctx) => {
                        let agg_nonce = ctx.agg_nonce.ok_or_else(|| {
                            Error::crypto(format!(
                                "missing aggregated nonce for tree TX at ({level}, {index})"
                            ))
                        })?;

                        let sec_nonce = ctx.sec_nonce.take().ok_or_else(|| {
                            Error::crypto(format!(
                                "secret nonce already consumed for tree TX at ({level}, {index})"
                            ))
                        })?;

                        tracing::debug!(level, index, "Generating partial signature");

                        let session =
                            MusigSession::new(&secp_zkp, &key_agg_cache, agg_nonce, ctx.msg);

                        let sig = session
                            .partial_sign(&secp_zkp, sec_nonce, &own_cosigner_kp, &key_agg_cache)
                            .map_err(Error::crypto)
                            .with_context(|| {
                                format!("failed to sign tree TX at ({level}, {index})")
                            })?;

                        Some(sig)
                    }
                    None => None,
                };

                sig_row.push(sig);
            }

            partial_sig_tree.push(sig_row);
        }

        self.stage = Stage::Signed;

        Ok(PartialSigTree::new(partial_sig_tree))
    }
}

/// The aggregate cosigner key with the sweep tap tree root applied as a Taproot tweak.
fn tweaked_key_agg_cache(
    secp_zkp: &zkp::Secp256k1<zkp::All>,
    cosigner_pks: &[zkp::PublicKey],
    sweep_tap_tree_root: TapNodeHash,
) -> Result<MusigKeyAggCache, Error> {
    let mut key_agg_cache = MusigKeyAggCache::new(secp_zkp, cosigner_pks);
    let agg_pk = from_zkp_xonly(key_agg_cache.agg_pk());

    let tweak = taproot::TapTweakHash::from_key_and_tweak(agg_pk, Some(sweep_tap_tree_root));
    let tweak = zkp::SecretKey::from_slice(tweak.as_byte_array()).map_err(Error::crypto)?;

    key_agg_cache
        .pubkey_xonly_tweak_add(secp_zkp, tweak)
        .map_err(Error::crypto)
        .context("failed to apply taproot tweak to aggregate cosigner key")?;

    Ok(key_agg_cache)
}

/// The key-spend sighash of a tree transaction's single input under `SIGHASH_DEFAULT`.
fn tree_tx_sighash(
    node: &TxTreeNode,
    tree: &TxTree,
    round_psbt: &Psbt,
) -> Result<zkp::Message, Error> {
    let previous_output = tree.parent_output(node, round_psbt)?;

    let prevouts = [previous_output];
    let prevouts = Prevouts::All(&prevouts);

    // Tree outputs are shared by all the parties with VTXOs in this round; a MuSig2 key spend
    // lets them co-sign without revealing any script.
    let tap_sighash = SighashCache::new(&node.tx.unsigned_tx)
        .taproot_key_spend_signature_hash(VTXO_INPUT_INDEX, &prevouts, TapSighashType::Default)
        .map_err(Error::crypto)?;

    let msg = zkp::Message::from_digest_slice(tap_sighash.as_byte_array()).map_err(Error::crypto)?;

    Ok(msg)
}

/// Aggregate one nonce matrix per cosigner into the matrix of aggregated nonces.
///
/// Mostly useful for tests and mock servers; in production the Ark server performs the
/// aggregation.
pub fn aggregate_nonce_matrices(matrices: &[NoncePks]) -> Result<AggNoncePks, Error> {
    let secp_zkp = zkp::Secp256k1::new();

    let first = matrices
        .first()
        .ok_or_else(|| Error::crypto("no nonce matrices to aggregate"))?;

    let rows = first
        .rows()
        .iter()
        .enumerate()
        .map(|(level, row)| {
            (0..row.len())
                .map(|index| {
                    let nonces = matrices
                        .iter()
                        .map(|matrix| matrix.get(level, index))
                        .collect::<Option<Vec<_>>>();

                    nonces.map(|nonces| MusigAggNonce::new(&secp_zkp, &nonces))
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    Ok(AggNoncePks::new(rows))
}

/// Estimate the fee of a forfeit transaction using weight-unit accounting.
///
/// The transaction is assumed to spend the connector with a Taproot key spend and the VTXO
/// with the forfeit tapscript, paying out to a single P2WPKH-sized output plus the ephemeral
/// anchor.
pub fn estimate_forfeit_tx_fee(fee_rate: FeeRate) -> Result<Amount, Error> {
    // nVersion, nLockTime and the in/out counts, plus the segwit marker and flag.
    const TX_OVERHEAD_WEIGHT: Weight = Weight::from_wu(42);
    // Outpoint, empty script-sig length and nSequence, plus a 64-byte key-spend witness.
    const CONNECTOR_INPUT_WEIGHT: Weight = Weight::from_wu(230);
    // Same base, plus witness: signature, two-key multisig leaf script and control block.
    const VTXO_INPUT_WEIGHT: Weight = Weight::from_wu(368);
    // 8-byte value, script length and a 22-byte P2WPKH program.
    const P2WPKH_OUTPUT_WEIGHT: Weight = Weight::from_wu(124);
    // 8-byte value, script length and the 4-byte anchor script.
    const ANCHOR_OUTPUT_WEIGHT: Weight = Weight::from_wu(52);

    let weight = TX_OVERHEAD_WEIGHT
        + CONNECTOR_INPUT_WEIGHT
        + VTXO_INPUT_WEIGHT
        + P2WPKH_OUTPUT_WEIGHT
        + ANCHOR_OUTPUT_WEIGHT;

    fee_rate
        .fee_wu(weight)
        .ok_or_else(|| Error::ad_hoc("forfeit fee overflow"))
}

/// Build an unsigned forfeit transaction.
///
/// The transaction is version 3 and has two inputs: the connector published by the server
/// (left unsigned here, sequence `0xffffffff`) and the VTXO being forfeited
/// (`SIGHASH_DEFAULT`, sequence `0xfffffffe` iff an absolute `locktime` is set). Its outputs
/// are the server's and an ephemeral anchor.
pub fn build_forfeit_tx(
    connector_outpoint: OutPoint,
    connector_output: TxOut,
    vtxo_outpoint: OutPoint,
    vtxo_output: TxOut,
    server_script: ScriptBuf,
    fee_amount: Amount,
    locktime: Option<absolute::LockTime>,
) -> Result<Psbt, Error> {
    let forfeit_amount = (vtxo_output.value + connector_output.value)
        .checked_sub(fee_amount)
        .ok_or_else(|| {
            Error::ad_hoc(format!(
                "fee {fee_amount} exceeds forfeit value {}",
                vtxo_output.value + connector_output.value
            ))
        })?;

    let forfeit_output = TxOut {
        value: forfeit_amount,
        script_pubkey: server_script,
    };

    let vtxo_sequence = match locktime {
        Some(_) => bitcoin::Sequence::ENABLE_LOCKTIME_NO_RBF,
        None => bitcoin::Sequence::MAX,
    };

    let mut forfeit_psbt = Psbt::from_unsigned_tx(Transaction {
        version: transaction::Version::non_standard(3),
        lock_time: locktime.unwrap_or(absolute::LockTime::ZERO),
        input: vec![
            TxIn {
                previous_output: connector_outpoint,
                sequence: bitcoin::Sequence::MAX,
                ..Default::default()
            },
            TxIn {
                previous_output: vtxo_outpoint,
                sequence: vtxo_sequence,
                ..Default::default()
            },
        ],
        output: vec![forfeit_output, anchor_output()],
    })
    .map_err(Error::transaction)?;

    forfeit_psbt.inputs[FORFEIT_TX_CONNECTOR_INDEX].witness_utxo = Some(connector_output);

    forfeit_psbt.inputs[FORFEIT_TX_VTXO_INDEX].witness_utxo = Some(vtxo_output);
    forfeit_psbt.inputs[FORFEIT_TX_VTXO_INDEX].sighash_type =
        Some(TapSighashType::Default.into());

    Ok(forfeit_psbt)
}

/// Build and sign a forfeit transaction per [`VtxoInput`], exchanging each VTXO for its
/// connector in the upcoming round transaction.
///
/// The VTXO input is signed under the forfeit leaf; the connector input is left for the
/// server.
pub fn create_and_sign_forfeit_txs<F>(
    sign_fn: F,
    vtxo_inputs: &[VtxoInput],
    connector_tree: &TxTree,
    connectors_index: &HashMap<OutPoint, OutPoint>,
    server_forfeit_address: &bitcoin::Address,
    fee_rate: FeeRate,
) -> Result<Vec<Psbt>, Error>
where
    F: Fn(&secp256k1::Message, &Vtxo) -> Result<(schnorr::Signature, XOnlyPublicKey), Error>,
{
    let secp = Secp256k1::new();

    let fee_amount = estimate_forfeit_tx_fee(fee_rate)?;

    let mut signed_forfeit_psbts = Vec::new();
    for VtxoInput {
        vtxo,
        amount: vtxo_amount,
        outpoint: vtxo_outpoint,
    } in vtxo_inputs.iter()
    {
        let connector_outpoint = connectors_index.get(vtxo_outpoint).ok_or_else(|| {
            Error::ad_hoc(format!("connector outpoint missing for VTXO {vtxo_outpoint}"))
        })?;

        let connector_node = connector_tree
            .find_by_txid(&connector_outpoint.txid)
            .ok_or_else(|| {
                Error::ad_hoc(format!(
                    "connector transaction missing for VTXO {vtxo_outpoint}"
                ))
            })?;

        let connector_output = connector_node
            .tx
            .unsigned_tx
            .output
            .get(connector_outpoint.vout as usize)
            .ok_or_else(|| {
                Error::ad_hoc(format!("connector output missing for VTXO {vtxo_outpoint}"))
            })?;

        let mut forfeit_psbt = build_forfeit_tx(
            *connector_outpoint,
            connector_output.clone(),
            *vtxo_outpoint,
            TxOut {
                value: *vtxo_amount,
                script_pubkey: vtxo.script_pubkey(),
            },
            server_forfeit_address.script_pubkey(),
            fee_amount,
            None,
        )?;

        let (forfeit_script, forfeit_control_block) = vtxo.forfeit_spend_info();

        let leaf_version = forfeit_control_block.leaf_version;
        forfeit_psbt.inputs[FORFEIT_TX_VTXO_INDEX].tap_scripts = BTreeMap::from_iter([(
            forfeit_control_block,
            (forfeit_script.clone(), leaf_version),
        )]);

        let prevouts = forfeit_psbt
            .inputs
            .iter()
            .filter_map(|i| i.witness_utxo.clone())
            .collect::<Vec<_>>();
        let prevouts = Prevouts::All(&prevouts);

        let leaf_hash = TapLeafHash::from_script(&forfeit_script, leaf_version);

        let tap_sighash = SighashCache::new(&forfeit_psbt.unsigned_tx)
            .taproot_script_spend_signature_hash(
                FORFEIT_TX_VTXO_INDEX,
                &prevouts,
                leaf_hash,
                TapSighashType::Default,
            )
            .map_err(Error::crypto)?;

        let msg = secp256k1::Message::from_digest(tap_sighash.to_raw_hash().to_byte_array());

        let (sig, pk) = sign_fn(&msg, vtxo)?;

        secp.verify_schnorr(&sig, &msg, &pk)
            .map_err(Error::crypto)
            .context("failed to verify own forfeit signature")?;

        let sig = taproot::Signature {
            signature: sig,
            sighash_type: TapSighashType::Default,
        };

        forfeit_psbt.inputs[FORFEIT_TX_VTXO_INDEX].tap_script_sigs =
            BTreeMap::from_iter([((pk, leaf_hash), sig)]);

        signed_forfeit_psbts.push(forfeit_psbt);
    }

    Ok(signed_forfeit_psbts)
}

/// Sign every input of the `round_psbt` which is in the provided `onchain_inputs` list.
///
/// Boarding outputs are spent into the round via their forfeit path, so each matching input
/// is signed under the forfeit leaf.
pub fn sign_round_psbt<F>(
    sign_for_pk_fn: F,
    round_psbt: &mut Psbt,
    onchain_inputs: &[OnChainInput],
) -> Result<(), Error>
where
    F: Fn(&XOnlyPublicKey, &secp256k1::Message) -> Result<schnorr::Signature, Error>,
{
    let secp = Secp256k1::new();

    let prevouts = round_psbt
        .inputs
        .iter()
        .filter_map(|i| i.witness_utxo.clone())
        .collect::<Vec<_>>();

    // For every boarding output we are settling, we look through the round transaction inputs
    // to find a matching input.
    for OnChainInput {
        boarding_output,
        outpoint: boarding_outpoint,
        ..
    } in onchain_inputs.iter()
    {
        let (forfeit_script, forfeit_control_block) = boarding_output.forfeit_spend_info();

        for (i, input) in round_psbt.inputs.iter_mut().enumerate() {
            let previous_outpoint = round_psbt.unsigned_tx.input[i].previous_output;

            if previous_outpoint == *boarding_outpoint {
                let leaf_version = forfeit_control_block.leaf_version;
                input.tap_scripts = BTreeMap::from_iter([(
                    forfeit_control_block.clone(),
                    (forfeit_script.clone(), leaf_version),
                )]);

                let prevouts = Prevouts::All(&prevouts);

                let leaf_hash = TapLeafHash::from_script(&forfeit_script, leaf_version);

                let tap_sighash = SighashCache::new(&round_psbt.unsigned_tx)
                    .taproot_script_spend_signature_hash(
                        i,
                        &prevouts,
                        leaf_hash,
                        TapSighashType::Default,
                    )
                    .map_err(Error::crypto)?;

                let msg =
                    secp256k1::Message::from_digest(tap_sighash.to_raw_hash().to_byte_array());
                let pk = boarding_output.owner_pk();

                let sig = sign_for_pk_fn(&pk, &msg)?;

                secp.verify_schnorr(&sig, &msg, &pk)
                    .map_err(Error::crypto)
                    .context("failed to verify own round TX signature")?;

                let sig = taproot::Signature {
                    signature: sig,
                    sighash_type: TapSighashType::Default,
                };

                input.tap_script_sigs = BTreeMap::from_iter([((pk, leaf_hash), sig)]);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::sweep_tap_tree_root;
    use crate::tree::shared_output_script;
    use crate::tree::validate_vtxo_tree;
    use bitcoin::key::TweakedPublicKey;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::str::FromStr;

    fn keypair(byte: u8) -> Keypair {
        let secp = Secp256k1::new();
        let sk = secp256k1::SecretKey::from_slice(&[byte; 32]).unwrap();

        Keypair::from_secret_key(&secp, &sk)
    }

    fn server_pk() -> XOnlyPublicKey {
        XOnlyPublicKey::from_str(
            "18845781f631c48f1c9709e23092067d06837f30aa0cd0544ac887fe91ddd166",
        )
        .unwrap()
    }

    fn dummy_outpoint(byte: u8) -> OutPoint {
        OutPoint {
            txid: bitcoin::Txid::from_byte_array([byte; 32]),
            vout: 0,
        }
    }

    fn p2tr_script(byte: u8) -> ScriptBuf {
        let (pk, _) = keypair(byte).x_only_public_key();

        ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(pk))
    }

    /// A minimal round: one internal tree transaction spending the shared output, one leaf
    /// transaction paying the registered output.
    fn round_fixture(
        cosigner_pks: &[secp256k1::PublicKey],
        amount: Amount,
    ) -> (Psbt, TxTree, TapNodeHash, ScriptBuf) {
        let sweep_root = sweep_tap_tree_root(bitcoin::Sequence::from_height(144), server_pk());

        let internal_script = shared_output_script(cosigner_pks, sweep_root).unwrap();
        let leaf_script = p2tr_script(0x77);

        let round_tx = Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: dummy_outpoint(0x01),
                ..Default::default()
            }],
            output: vec![TxOut {
                value: amount,
                script_pubkey: internal_script.clone(),
            }],
        };
        let round_psbt = Psbt::from_unsigned_tx(round_tx).unwrap();
        let round_txid = round_psbt.unsigned_tx.compute_txid();

        let root_tx = Transaction {
            version: transaction::Version::non_standard(3),
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: round_txid,
                    vout: 0,
                },
                ..Default::default()
            }],
            output: vec![TxOut {
                value: amount,
                script_pubkey: internal_script,
            }],
        };
        let root_txid = root_tx.compute_txid();

        let leaf_tx = Transaction {
            version: transaction::Version::non_standard(3),
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: root_txid,
                    vout: 0,
                },
                ..Default::default()
            }],
            output: vec![TxOut {
                value: amount,
                script_pubkey: leaf_script.clone(),
            }],
        };
        let leaf_txid = leaf_tx.compute_txid();

        let mut tree = TxTree::new();
        tree.insert(TxTreeNode {
            txid: root_txid,
            tx: Psbt::from_unsigned_tx(root_tx).unwrap(),
            parent_txid: round_txid,
            level: 0,
            level_index: 0,
            leaf: false,
        });
        tree.insert(TxTreeNode {
            txid: leaf_txid,
            tx: Psbt::from_unsigned_tx(leaf_tx).unwrap(),
            parent_txid: root_txid,
            level: 1,
            level_index: 0,
            leaf: true,
        });

        (round_psbt, tree, sweep_root, leaf_script)
    }

    #[test]
    fn three_of_three_partial_signatures_aggregate_to_valid_schnorr() {
        let mut rng = StdRng::seed_from_u64(42);
        let secp = Secp256k1::new();
        let secp_zkp = zkp::Secp256k1::new();

        let cosigner_kps = [keypair(0x11), keypair(0x12), keypair(0x13)];
        let cosigner_pks = cosigner_kps
            .iter()
            .map(|kp| kp.public_key())
            .collect::<Vec<_>>();

        let (round_psbt, tree, sweep_root, leaf_script) =
            round_fixture(&cosigner_pks, Amount::from_sat(10_000));

        validate_vtxo_tree(
            &round_psbt,
            &tree,
            sweep_root,
            &cosigner_pks,
            &[leaf_script],
        )
        .unwrap();

        let mut sessions = cosigner_kps
            .iter()
            .map(|kp| {
                TreeSigningSession::new(
                    &mut rng,
                    *kp,
                    &cosigner_pks,
                    &tree,
                    sweep_root,
                    &round_psbt,
                )
                .unwrap()
            })
            .collect::<Vec<_>>();

        let nonce_matrices = sessions
            .iter_mut()
            .map(|session| session.pub_nonces().unwrap())
            .collect::<Vec<_>>();

        let agg_nonce_pks = aggregate_nonce_matrices(&nonce_matrices).unwrap();

        let partial_sig_trees = sessions
            .iter_mut()
            .map(|session| {
                session
                    .set_aggregated_nonces(agg_nonce_pks.clone())
                    .unwrap();
                session.sign().unwrap()
            })
            .collect::<Vec<_>>();

        // Combine the partial signatures for the single internal node and verify the result
        // as a plain Schnorr signature under the tweaked aggregate key.
        let zkp_cosigner_pks = cosigner_pks
            .iter()
            .map(|pk| to_zkp_pk(*pk))
            .collect::<Vec<_>>();
        let key_agg_cache =
            tweaked_key_agg_cache(&secp_zkp, &zkp_cosigner_pks, sweep_root).unwrap();

        let root = tree.get(0, 0).unwrap();
        let msg = tree_tx_sighash(root, &tree, &round_psbt).unwrap();

        let agg_nonce = agg_nonce_pks.get(0, 0).unwrap();
        let session = MusigSession::new(&secp_zkp, &key_agg_cache, agg_nonce, msg);

        let partial_sigs = partial_sig_trees
            .iter()
            .map(|tree| tree.get(0, 0).unwrap())
            .collect::<Vec<_>>();
        let sig = session.partial_sig_agg(&partial_sigs);

        let sig = schnorr::Signature::from_slice(sig.as_ref()).unwrap();
        let agg_pk = from_zkp_xonly(key_agg_cache.agg_pk());
        let msg = secp256k1::Message::from_digest_slice(msg.as_ref()).unwrap();

        secp.verify_schnorr(&sig, &msg, &agg_pk).unwrap();

        // The key everything verifies under is also the key the tree outputs pay to.
        let expected_script = shared_output_script(&cosigner_pks, sweep_root).unwrap();
        assert_eq!(
            expected_script,
            ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(agg_pk))
        );
    }

    #[test]
    fn signing_session_enforces_stage_order() {
        let mut rng = StdRng::seed_from_u64(43);

        let cosigner_kp = keypair(0x21);
        let cosigner_pks = vec![cosigner_kp.public_key()];

        let (round_psbt, tree, sweep_root, _) =
            round_fixture(&cosigner_pks, Amount::from_sat(10_000));

        let mut session = TreeSigningSession::new(
            &mut rng,
            cosigner_kp,
            &cosigner_pks,
            &tree,
            sweep_root,
            &round_psbt,
        )
        .unwrap();

        // Aggregated nonces cannot come before our own nonces are taken.
        let premature = session.set_aggregated_nonces(AggNoncePks::new(vec![]));
        assert!(premature.unwrap_err().is_signing_stage_violation());

        // Signing cannot come before the aggregated nonces.
        assert!(session.sign().unwrap_err().is_signing_stage_violation());

        let nonces = session.pub_nonces().unwrap();
        assert!(session.pub_nonces().unwrap_err().is_signing_stage_violation());

        let agg_nonce_pks = aggregate_nonce_matrices(&[nonces]).unwrap();
        session.set_aggregated_nonces(agg_nonce_pks).unwrap();

        session.sign().unwrap();

        // The secret nonces are gone; a second signing pass must fail.
        assert!(session.sign().unwrap_err().is_signing_stage_violation());
    }

    #[test]
    fn forfeit_tx_pays_server_minus_fee() {
        let connector_output = TxOut {
            value: Amount::from_sat(330),
            script_pubkey: p2tr_script(0x01),
        };
        let vtxo_output = TxOut {
            value: Amount::from_sat(10_000),
            script_pubkey: p2tr_script(0x02),
        };
        let server_script = p2tr_script(0x03);

        let forfeit_psbt = build_forfeit_tx(
            dummy_outpoint(0x0a),
            connector_output.clone(),
            dummy_outpoint(0x0b),
            vtxo_output.clone(),
            server_script.clone(),
            Amount::from_sat(200),
            None,
        )
        .unwrap();

        let tx = &forfeit_psbt.unsigned_tx;

        assert_eq!(tx.version, transaction::Version::non_standard(3));

        assert_eq!(tx.output[0].script_pubkey, server_script);
        assert_eq!(tx.output[0].value, Amount::from_sat(10_000 + 330 - 200));
        assert_eq!(tx.output[1], anchor_output());

        assert_eq!(tx.input[0].sequence, bitcoin::Sequence::MAX);
        assert_eq!(tx.input[1].sequence, bitcoin::Sequence::MAX);
        assert_eq!(tx.lock_time, absolute::LockTime::ZERO);

        assert_eq!(
            forfeit_psbt.inputs[1].sighash_type,
            Some(TapSighashType::Default.into())
        );
        assert!(forfeit_psbt.inputs[0].sighash_type.is_none());
    }

    #[test]
    fn forfeit_tx_locktime_sets_vtxo_sequence() {
        let connector_output = TxOut {
            value: Amount::from_sat(330),
            script_pubkey: p2tr_script(0x01),
        };
        let vtxo_output = TxOut {
            value: Amount::from_sat(10_000),
            script_pubkey: p2tr_script(0x02),
        };

        let forfeit_psbt = build_forfeit_tx(
            dummy_outpoint(0x0a),
            connector_output,
            dummy_outpoint(0x0b),
            vtxo_output,
            p2tr_script(0x03),
            Amount::from_sat(200),
            Some(absolute::LockTime::from_height(1_000).unwrap()),
        )
        .unwrap();

        let tx = &forfeit_psbt.unsigned_tx;

        assert_eq!(
            tx.lock_time,
            absolute::LockTime::from_height(1_000).unwrap()
        );
        assert_eq!(tx.input[0].sequence, bitcoin::Sequence::MAX);
        assert_eq!(tx.input[1].sequence, bitcoin::Sequence::ENABLE_LOCKTIME_NO_RBF);
    }

    #[test]
    fn forfeit_tx_rejects_excessive_fee() {
        let connector_output = TxOut {
            value: Amount::from_sat(330),
            script_pubkey: p2tr_script(0x01),
        };
        let vtxo_output = TxOut {
            value: Amount::from_sat(100),
            script_pubkey: p2tr_script(0x02),
        };

        let result = build_forfeit_tx(
            dummy_outpoint(0x0a),
            connector_output,
            dummy_outpoint(0x0b),
            vtxo_output,
            p2tr_script(0x03),
            Amount::from_sat(1_000),
            None,
        );

        assert!(result.is_err());
    }

    #[test]
    fn tree_validator_detects_mutations() {
        let cosigner_kp = keypair(0x31);
        let cosigner_pks = vec![cosigner_kp.public_key()];

        let (round_psbt, tree, sweep_root, leaf_script) =
            round_fixture(&cosigner_pks, Amount::from_sat(10_000));

        // The untouched tree is valid.
        validate_vtxo_tree(
            &round_psbt,
            &tree,
            sweep_root,
            &cosigner_pks,
            &[leaf_script.clone()],
        )
        .unwrap();

        // Inflating a node's output amount breaks conservation at that node.
        let mut mutated = tree.clone();
        mutated.get_mut(0, 0).unwrap().tx.unsigned_tx.output[0].value += Amount::from_sat(1);
        let error = validate_vtxo_tree(
            &round_psbt,
            &mutated,
            sweep_root,
            &cosigner_pks,
            &[leaf_script.clone()],
        )
        .unwrap_err();
        assert_eq!(error.tree_violation(), Some((0, 0)));

        // Replacing a leaf script with an unregistered one fails at the leaf.
        let mut mutated = tree.clone();
        mutated.get_mut(1, 0).unwrap().tx.unsigned_tx.output[0].script_pubkey =
            p2tr_script(0x99);
        let error = validate_vtxo_tree(
            &round_psbt,
            &mutated,
            sweep_root,
            &cosigner_pks,
            &[leaf_script.clone()],
        )
        .unwrap_err();
        assert_eq!(error.tree_violation(), Some((1, 0)));

        // Pointing the leaf at a non-existent parent breaks the linkage.
        let mut mutated = tree.clone();
        mutated.get_mut(1, 0).unwrap().tx.unsigned_tx.input[0].previous_output =
            dummy_outpoint(0x42);
        let error = validate_vtxo_tree(
            &round_psbt,
            &mutated,
            sweep_root,
            &cosigner_pks,
            &[leaf_script],
        )
        .unwrap_err();
        assert_eq!(error.tree_violation(), Some((1, 0)));
    }
}
