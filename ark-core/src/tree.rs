//! The level-indexed forest of pre-signed transactions shared by the server during a round,
//! and the structural validation a client performs before signing any of it.

use crate::conversions::from_zkp_xonly;
use crate::conversions::to_zkp_pk;
use crate::Error;
use crate::UNSPENDABLE_KEY;
use bitcoin::key::Secp256k1;
use bitcoin::key::TapTweak;
use bitcoin::secp256k1::PublicKey;
use bitcoin::Amount;
use bitcoin::OutPoint;
use bitcoin::Psbt;
use bitcoin::ScriptBuf;
use bitcoin::TapNodeHash;
use bitcoin::TxOut;
use bitcoin::Txid;
use std::collections::BTreeMap;
use zkp::musig::MusigKeyAggCache;

/// The output index of the shared output in a round transaction: the root of the VTXO tree.
pub const SHARED_OUTPUT_INDEX: usize = 0;

/// The output index of the connectors root in a round transaction.
pub const CONNECTORS_OUTPUT_INDEX: usize = 1;

/// A node in a [`TxTree`]: one pre-signed transaction, linked to its parent.
#[derive(Debug, Clone)]
pub struct TxTreeNode {
    pub txid: Txid,
    pub tx: Psbt,
    pub parent_txid: Txid,
    pub level: usize,
    pub level_index: usize,
    pub leaf: bool,
}

/// A level-indexed forest of partially signed transactions.
///
/// Both the VTXO tree and the connectors tree of a round share this shape.
#[derive(Debug, Clone, Default)]
pub struct TxTree {
    nodes: BTreeMap<(usize, usize), TxTreeNode>,
}

impl TxTree {
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, node: TxTreeNode) {
        self.nodes.insert((node.level, node.level_index), node);
    }

    pub fn get(&self, level: usize, index: usize) -> Option<&TxTreeNode> {
        self.nodes.get(&(level, index))
    }

    pub fn get_mut(&mut self, level: usize, index: usize) -> Result<&mut TxTreeNode, Error> {
        self.nodes
            .get_mut(&(level, index))
            .ok_or_else(|| Error::ad_hoc(format!("tree node not found at ({level}, {index})")))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TxTreeNode> {
        self.nodes.values()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nb_of_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Get all nodes at a specific level.
    pub fn get_level(&self, level: usize) -> Vec<&TxTreeNode> {
        self.nodes
            .range((level, 0)..(level + 1, 0))
            .map(|(_, node)| node)
            .collect()
    }

    /// Iterate over levels in order.
    pub fn iter_levels(&self) -> impl Iterator<Item = (usize, Vec<&TxTreeNode>)> {
        let max_level = self.nodes.keys().map(|(level, _)| *level).max().unwrap_or(0);

        (0..=max_level).map(move |level| (level, self.get_level(level)))
    }

    /// All nodes marked as leaves of the forest.
    pub fn leaves(&self) -> Vec<&TxTreeNode> {
        self.nodes.values().filter(|node| node.leaf).collect()
    }

    /// Find the node carrying the transaction identified by `txid`.
    pub fn find_by_txid(&self, txid: &Txid) -> Option<&TxTreeNode> {
        self.nodes.values().find(|node| node.txid == *txid)
    }

    /// The output of the parent transaction spent by `node`'s single input.
    ///
    /// The parent is either another node in the tree or the round transaction itself.
    pub fn parent_output(&self, node: &TxTreeNode, round_psbt: &Psbt) -> Result<TxOut, Error> {
        let previous_output = node.tx.unsigned_tx.input[crate::VTXO_INPUT_INDEX].previous_output;

        let parent_tx = match self.find_by_txid(&previous_output.txid) {
            Some(parent) => &parent.tx.unsigned_tx,
            None if previous_output.txid == round_psbt.unsigned_tx.compute_txid() => {
                &round_psbt.unsigned_tx
            }
            None => {
                return Err(Error::ad_hoc(format!(
                    "parent transaction {} not found for tree TX {}",
                    previous_output.txid, node.txid
                )))
            }
        };

        let output = parent_tx
            .output
            .get(previous_output.vout as usize)
            .ok_or_else(|| {
                Error::ad_hoc(format!(
                    "previous output {previous_output} not found for tree TX {}",
                    node.txid
                ))
            })?;

        Ok(output.clone())
    }
}

/// Validate the structure of the VTXO tree shared by the server for this round.
///
/// Holds iff:
///
/// 1. every root spends the shared output of the round transaction;
/// 2. every node conserves amounts: the sum of its outputs (zero-value ephemeral anchors
///    included, they do not consume) equals the amount of the parent output it spends;
/// 3. every non-leaf output pays to the cosigner aggregate key tweaked with
///    `sweep_tap_tree_root` as the single leaf, so each tree level inherits the same sweep
///    script;
/// 4. every leaf output pays to one of the outputs registered for this round.
///
/// Fails with the first violation found, naming the offending `(level, index)`.
pub fn validate_vtxo_tree(
    round_psbt: &Psbt,
    tree: &TxTree,
    sweep_tap_tree_root: TapNodeHash,
    cosigner_pks: &[PublicKey],
    registered_outputs: &[ScriptBuf],
) -> Result<(), Error> {
    let expected_internal_script =
        shared_output_script(cosigner_pks, sweep_tap_tree_root)?;

    let round_txid = round_psbt.unsigned_tx.compute_txid();
    let shared_outpoint = OutPoint {
        txid: round_txid,
        vout: SHARED_OUTPUT_INDEX as u32,
    };

    validate_tree(
        round_psbt,
        tree,
        shared_outpoint,
        |node, output| {
            if node.leaf {
                if !registered_outputs.contains(&output.script_pubkey) {
                    return Err("leaf output script was not registered".to_string());
                }
            } else if output.script_pubkey != expected_internal_script {
                return Err("internal output does not commit to the sweep script".to_string());
            }

            Ok(())
        },
    )
}

/// Validate the structure of the connectors tree shared by the server for this round.
///
/// Applies the same linkage and amount conservation rules as the VTXO tree, against the
/// connectors root output of the round transaction. Every connector output must pay to the
/// script the server declared via its forfeit address.
pub fn validate_connectors_tree(
    round_psbt: &Psbt,
    tree: &TxTree,
    server_forfeit_script: &ScriptBuf,
) -> Result<(), Error> {
    let round_txid = round_psbt.unsigned_tx.compute_txid();
    let connectors_outpoint = OutPoint {
        txid: round_txid,
        vout: CONNECTORS_OUTPUT_INDEX as u32,
    };

    validate_tree(round_psbt, tree, connectors_outpoint, |_, output| {
        if output.script_pubkey != *server_forfeit_script {
            return Err("connector output does not pay to the server".to_string());
        }

        Ok(())
    })
}

fn validate_tree<F>(
    round_psbt: &Psbt,
    tree: &TxTree,
    root_outpoint: OutPoint,
    validate_output: F,
) -> Result<(), Error>
where
    F: Fn(&TxTreeNode, &TxOut) -> Result<(), String>,
{
    for (level, nodes) in tree.iter_levels() {
        for node in nodes {
            let index = node.level_index;

            let violation =
                |reason: String| Error::invalid_tree_structure(level, index, reason);

            let tx = &node.tx.unsigned_tx;

            if tx.input.len() != 1 {
                return Err(violation(format!(
                    "expected a single input, got {}",
                    tx.input.len()
                )));
            }

            if tx.compute_txid() != node.txid {
                return Err(violation("transaction does not match declared txid".to_string()));
            }

            let previous_output = tx.input[crate::VTXO_INPUT_INDEX].previous_output;

            if level == 0 {
                if previous_output != root_outpoint {
                    return Err(violation(
                        "root does not spend the expected round transaction output".to_string(),
                    ));
                }
            } else {
                let parent = tree
                    .get_level(level - 1)
                    .into_iter()
                    .find(|parent| parent.txid == previous_output.txid);

                match parent {
                    Some(parent) => {
                        if parent
                            .tx
                            .unsigned_tx
                            .output
                            .get(previous_output.vout as usize)
                            .is_none()
                        {
                            return Err(violation(format!(
                                "parent {} has no output at index {}",
                                parent.txid, previous_output.vout
                            )));
                        }
                    }
                    None => {
                        return Err(violation(
                            "input does not reference a node in the previous level".to_string(),
                        ));
                    }
                }
            }

            let input_amount = tree
                .parent_output(node, round_psbt)
                .map_err(|e| violation(e.to_string()))?
                .value;

            let output_amount = tx
                .output
                .iter()
                .fold(Amount::ZERO, |acc, output| acc + output.value);

            if output_amount != input_amount {
                return Err(violation(format!(
                    "amounts not conserved: {output_amount} out of {input_amount} in"
                )));
            }

            for output in tx.output.iter() {
                // Zero-value ephemeral anchors are fee plumbing, not coins.
                if output.value == Amount::ZERO {
                    continue;
                }

                validate_output(node, output).map_err(violation)?;
            }
        }
    }

    Ok(())
}

/// The script every shared internal output of the VTXO tree is expected to pay to: the
/// cosigner aggregate key, tweaked with the sweep leaf as the only script path.
pub fn shared_output_script(
    cosigner_pks: &[PublicKey],
    sweep_tap_tree_root: TapNodeHash,
) -> Result<ScriptBuf, Error> {
    let secp = Secp256k1::new();
    let secp_zkp = zkp::Secp256k1::new();

    let unspendable_pk: bitcoin::key::PublicKey = UNSPENDABLE_KEY.parse().expect("valid key");

    let cosigner_pks = cosigner_pks
        .iter()
        .filter(|pk| **pk != unspendable_pk.inner)
        .map(|pk| to_zkp_pk(*pk))
        .collect::<Vec<_>>();

    if cosigner_pks.is_empty() {
        return Err(Error::crypto("no cosigner PKs to aggregate"));
    }

    let key_agg_cache = MusigKeyAggCache::new(&secp_zkp, &cosigner_pks);
    let agg_pk = from_zkp_xonly(key_agg_cache.agg_pk());

    let (output_key, _) = agg_pk.tap_tweak(&secp, Some(sweep_tap_tree_root));

    Ok(ScriptBuf::new_p2tr_tweaked(output_key))
}
