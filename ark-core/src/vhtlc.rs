//! Virtual Hash Time Lock Contract (VHTLC) scripts.
//!
//! A VHTLC is a VTXO whose spending policy encodes a hash-preimage swap plus a refund branch
//! plus unilateral exits, spread over six script paths with different conditions and
//! participants.

use crate::ArkAddress;
use crate::Error;
use crate::UNSPENDABLE_KEY;
use bitcoin::absolute;
use bitcoin::hashes::ripemd160;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::*;
use bitcoin::relative;
use bitcoin::taproot;
use bitcoin::taproot::LeafVersion;
use bitcoin::taproot::TaprootBuilder;
use bitcoin::taproot::TaprootSpendInfo;
use bitcoin::Network;
use bitcoin::PublicKey;
use bitcoin::ScriptBuf;
use bitcoin::Sequence;
use bitcoin::XOnlyPublicKey;
use serde::Deserialize;
use serde::Serialize;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum VhtlcError {
    #[error("invalid locktime: {0}")]
    InvalidLocktime(String),
    #[error("invalid delay: {0}")]
    InvalidDelay(String),
    #[error("taproot construction failed: {0}")]
    Taproot(String),
}

impl From<VhtlcError> for Error {
    fn from(e: VhtlcError) -> Self {
        Error::config(e)
    }
}

/// Represents a script with its weight for taproot tree construction.
#[derive(Debug, Clone)]
struct TaprootScriptItem {
    script: ScriptBuf,
    weight: u32,
}

/// Internal tree node for building the taproot tree structure.
#[derive(Debug, Clone)]
enum TaprootTreeNode {
    Leaf {
        script: ScriptBuf,
        weight: u32,
    },
    Branch {
        left: Box<TaprootTreeNode>,
        right: Box<TaprootTreeNode>,
        weight: u32,
    },
}

impl TaprootTreeNode {
    fn weight(&self) -> u32 {
        match self {
            TaprootTreeNode::Leaf { weight, .. } => *weight,
            TaprootTreeNode::Branch { weight, .. } => *weight,
        }
    }
}

/// Parameters of a VHTLC.
///
/// All three unilateral delays are relative (CSV); `refund_locktime` is absolute (CLTV).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VhtlcOptions {
    pub sender: XOnlyPublicKey,
    pub receiver: XOnlyPublicKey,
    pub server: XOnlyPublicKey,
    /// HASH160 of the swap preimage.
    pub preimage_hash: ripemd160::Hash,
    pub refund_locktime: absolute::LockTime,
    pub unilateral_claim_delay: Sequence,
    pub unilateral_refund_delay: Sequence,
    pub unilateral_refund_without_receiver_delay: Sequence,
}

impl VhtlcOptions {
    pub fn validate(&self) -> Result<(), VhtlcError> {
        if self.refund_locktime.to_consensus_u32() == 0 {
            return Err(VhtlcError::InvalidLocktime(
                "refund locktime must be greater than 0".to_string(),
            ));
        }

        for (name, delay) in [
            ("unilateral claim delay", self.unilateral_claim_delay),
            ("unilateral refund delay", self.unilateral_refund_delay),
            (
                "unilateral refund without receiver delay",
                self.unilateral_refund_without_receiver_delay,
            ),
        ] {
            if !delay.is_relative_lock_time() || delay.to_consensus_u32() == 0 {
                return Err(VhtlcError::InvalidDelay(format!(
                    "{name} must be a valid non-zero CSV relative lock time"
                )));
            }
        }

        // The claim path must always out-prioritise the refund paths.
        let claim = delay_value(self.unilateral_claim_delay)?;
        let refund = delay_value(self.unilateral_refund_delay)?;
        let refund_without_receiver = delay_value(self.unilateral_refund_without_receiver_delay)?;

        if claim.0 != refund.0 || refund.0 != refund_without_receiver.0 {
            return Err(VhtlcError::InvalidDelay(
                "unilateral delays must all use the same unit".to_string(),
            ));
        }

        if claim.1 >= refund.1 || refund.1 >= refund_without_receiver.1 {
            return Err(VhtlcError::InvalidDelay(
                "unilateral delays must be strictly increasing: claim < refund < refund \
                 without receiver"
                    .to_string(),
            ));
        }

        Ok(())
    }

    fn build_taproot(&self) -> Result<TaprootSpendInfo, VhtlcError> {
        let internal_pubkey = PublicKey::from_str(UNSPENDABLE_KEY)
            .map_err(|e| VhtlcError::Taproot(format!("failed to parse internal key: {e}")))?;
        let internal_key = XOnlyPublicKey::from(internal_pubkey);

        // Lower weight = more likely to be used = shallower in the tree.
        let scripts = vec![
            TaprootScriptItem {
                script: self.claim_script(),
                weight: 1,
            },
            TaprootScriptItem {
                script: self.refund_script(),
                weight: 1,
            },
            TaprootScriptItem {
                script: self.refund_without_receiver_script(),
                weight: 1,
            },
            TaprootScriptItem {
                script: self.unilateral_claim_script(),
                weight: 1,
            },
            TaprootScriptItem {
                script: self.unilateral_refund_script(),
                weight: 1,
            },
            TaprootScriptItem {
                script: self.unilateral_refund_without_receiver_script(),
                weight: 1,
            },
        ];

        let tree = Self::taproot_list_to_tree(scripts)?;

        let builder = TaprootBuilder::new();
        let builder = Self::add_tree_to_builder(builder, &tree, 0)?;

        let secp = bitcoin::secp256k1::Secp256k1::new();
        let taproot_spend_info = builder
            .finalize(&secp, internal_key)
            .map_err(|e| VhtlcError::Taproot(format!("failed to finalize taproot: {e:?}")))?;

        Ok(taproot_spend_info)
    }

    /// The claim script, where the receiver reveals the preimage.
    ///
    /// Requires: preimage hash verification + receiver signature + server signature.
    pub fn claim_script(&self) -> ScriptBuf {
        ScriptBuf::builder()
            .push_opcode(OP_HASH160)
            .push_slice(self.preimage_hash.as_byte_array())
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_VERIFY)
            .push_x_only_key(&self.receiver)
            .push_opcode(OP_CHECKSIGVERIFY)
            .push_x_only_key(&self.server)
            .push_opcode(OP_CHECKSIG)
            .into_script()
    }

    /// The collaborative refund script.
    ///
    /// Requires: sender + receiver + server signatures.
    pub fn refund_script(&self) -> ScriptBuf {
        ScriptBuf::builder()
            .push_x_only_key(&self.sender)
            .push_opcode(OP_CHECKSIGVERIFY)
            .push_x_only_key(&self.receiver)
            .push_opcode(OP_CHECKSIGVERIFY)
            .push_x_only_key(&self.server)
            .push_opcode(OP_CHECKSIG)
            .into_script()
    }

    /// The refund script for when the receiver is unavailable.
    ///
    /// Requires: CLTV timeout + sender + server signatures.
    pub fn refund_without_receiver_script(&self) -> ScriptBuf {
        ScriptBuf::builder()
            .push_int(self.refund_locktime.to_consensus_u32() as i64)
            .push_opcode(OP_CLTV)
            .push_opcode(OP_DROP)
            .push_x_only_key(&self.sender)
            .push_opcode(OP_CHECKSIGVERIFY)
            .push_x_only_key(&self.server)
            .push_opcode(OP_CHECKSIG)
            .into_script()
    }

    /// The unilateral claim script (no server cooperation needed).
    ///
    /// Requires: preimage hash verification + CSV delay + receiver signature.
    pub fn unilateral_claim_script(&self) -> ScriptBuf {
        ScriptBuf::builder()
            .push_opcode(OP_HASH160)
            .push_slice(self.preimage_hash.as_byte_array())
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_VERIFY)
            .push_int(self.unilateral_claim_delay.to_consensus_u32() as i64)
            .push_opcode(OP_CSV)
            .push_opcode(OP_DROP)
            .push_x_only_key(&self.receiver)
            .push_opcode(OP_CHECKSIG)
            .into_script()
    }

    /// The unilateral refund script.
    ///
    /// Requires: CSV delay + sender + receiver signatures.
    pub fn unilateral_refund_script(&self) -> ScriptBuf {
        ScriptBuf::builder()
            .push_int(self.unilateral_refund_delay.to_consensus_u32() as i64)
            .push_opcode(OP_CSV)
            .push_opcode(OP_DROP)
            .push_x_only_key(&self.sender)
            .push_opcode(OP_CHECKSIGVERIFY)
            .push_x_only_key(&self.receiver)
            .push_opcode(OP_CHECKSIG)
            .into_script()
    }

    /// The unilateral refund script for when the receiver is unavailable.
    ///
    /// Requires: CSV delay + sender signature.
    pub fn unilateral_refund_without_receiver_script(&self) -> ScriptBuf {
        ScriptBuf::builder()
            .push_int(
                self.unilateral_refund_without_receiver_delay
                    .to_consensus_u32() as i64,
            )
            .push_opcode(OP_CSV)
            .push_opcode(OP_DROP)
            .push_x_only_key(&self.sender)
            .push_opcode(OP_CHECKSIG)
            .into_script()
    }

    /// Build a balanced taproot tree from a list of scripts with weights, combining the
    /// lightest nodes first.
    fn taproot_list_to_tree(
        scripts: Vec<TaprootScriptItem>,
    ) -> Result<TaprootTreeNode, VhtlcError> {
        if scripts.is_empty() {
            return Err(VhtlcError::Taproot("empty script list".to_string()));
        }

        let mut lst: Vec<TaprootTreeNode> = scripts
            .into_iter()
            .map(|item| TaprootTreeNode::Leaf {
                script: item.script,
                weight: item.weight,
            })
            .collect();

        while lst.len() >= 2 {
            // Elements with the smallest weight end up at the end of the queue.
            lst.sort_by(|a, b| b.weight().cmp(&a.weight()));

            let b = lst.pop().expect("an element");
            let a = lst.pop().expect("an element");

            lst.push(TaprootTreeNode::Branch {
                weight: a.weight() + b.weight(),
                left: Box::new(a),
                right: Box::new(b),
            });
        }

        Ok(lst.into_iter().next().expect("a root node"))
    }

    fn add_tree_to_builder(
        builder: TaprootBuilder,
        node: &TaprootTreeNode,
        depth: u8,
    ) -> Result<TaprootBuilder, VhtlcError> {
        match node {
            TaprootTreeNode::Leaf { script, .. } => builder
                .add_leaf(depth, script.clone())
                .map_err(|e| VhtlcError::Taproot(format!("failed to add leaf: {e}"))),
            TaprootTreeNode::Branch { left, right, .. } => {
                let builder = Self::add_tree_to_builder(builder, left, depth + 1)?;
                Self::add_tree_to_builder(builder, right, depth + 1)
            }
        }
    }
}

fn delay_value(delay: Sequence) -> Result<(DelayUnit, u32), VhtlcError> {
    match delay.to_relative_lock_time() {
        Some(relative::LockTime::Blocks(height)) => Ok((DelayUnit::Blocks, height.value() as u32)),
        Some(relative::LockTime::Time(time)) => Ok((DelayUnit::Seconds, time.value() as u32)),
        None => Err(VhtlcError::InvalidDelay(format!(
            "not a relative lock time: {delay}"
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DelayUnit {
    Blocks,
    Seconds,
}

/// A VHTLC script tree with its six spending paths:
///
/// 1. **Claim**: receiver reveals the preimage (collaborative with the server).
/// 2. **Refund**: collaborative refund (all three parties).
/// 3. **Refund without receiver**: sender refunds after the locktime (with the server).
/// 4. **Unilateral claim**: receiver claims after a delay (no server needed).
/// 5. **Unilateral refund**: sender and receiver refund after a delay.
/// 6. **Unilateral refund without receiver**: sender refunds alone after the longest delay.
#[derive(Debug, Clone)]
pub struct VhtlcScript {
    options: VhtlcOptions,
    taproot_spend_info: TaprootSpendInfo,
    network: Network,
}

impl VhtlcScript {
    /// Validate the given options and build the complete taproot tree with all spending paths.
    pub fn new(options: VhtlcOptions, network: Network) -> Result<Self, Error> {
        options.validate()?;

        let taproot_spend_info = options.build_taproot()?;

        Ok(Self {
            options,
            taproot_spend_info,
            network,
        })
    }

    pub fn options(&self) -> &VhtlcOptions {
        &self.options
    }

    pub fn taproot_spend_info(&self) -> &TaprootSpendInfo {
        &self.taproot_spend_info
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        ScriptBuf::builder()
            .push_opcode(OP_PUSHNUM_1)
            .push_slice(self.taproot_spend_info.output_key().serialize())
            .into_script()
    }

    pub fn address(&self) -> ArkAddress {
        ArkAddress::new(
            self.network,
            self.options.server,
            self.taproot_spend_info.output_key(),
        )
    }

    pub fn refund_locktime(&self) -> absolute::LockTime {
        self.options.refund_locktime
    }

    pub fn claim_script(&self) -> ScriptBuf {
        self.options.claim_script()
    }

    pub fn refund_script(&self) -> ScriptBuf {
        self.options.refund_script()
    }

    pub fn refund_without_receiver_script(&self) -> ScriptBuf {
        self.options.refund_without_receiver_script()
    }

    pub fn unilateral_claim_script(&self) -> ScriptBuf {
        self.options.unilateral_claim_script()
    }

    pub fn unilateral_refund_script(&self) -> ScriptBuf {
        self.options.unilateral_refund_script()
    }

    pub fn unilateral_refund_without_receiver_script(&self) -> ScriptBuf {
        self.options.unilateral_refund_without_receiver_script()
    }

    /// The spend info for the claim branch.
    pub fn claim_spend_info(&self) -> (ScriptBuf, taproot::ControlBlock) {
        self.spend_info_for(self.claim_script())
    }

    /// The spend info for the collaborative refund branch.
    pub fn refund_spend_info(&self) -> (ScriptBuf, taproot::ControlBlock) {
        self.spend_info_for(self.refund_script())
    }

    /// The spend info for the refund-without-receiver branch.
    pub fn refund_without_receiver_spend_info(&self) -> (ScriptBuf, taproot::ControlBlock) {
        self.spend_info_for(self.refund_without_receiver_script())
    }

    /// The spend info for the unilateral claim branch.
    pub fn unilateral_claim_spend_info(&self) -> (ScriptBuf, taproot::ControlBlock) {
        self.spend_info_for(self.unilateral_claim_script())
    }

    /// The spend info for the unilateral refund branch.
    pub fn unilateral_refund_spend_info(&self) -> (ScriptBuf, taproot::ControlBlock) {
        self.spend_info_for(self.unilateral_refund_script())
    }

    /// The spend info for the unilateral refund-without-receiver branch.
    pub fn unilateral_refund_without_receiver_spend_info(
        &self,
    ) -> (ScriptBuf, taproot::ControlBlock) {
        self.spend_info_for(self.unilateral_refund_without_receiver_script())
    }

    /// The leaf scripts composing the VHTLC's script tree, in canonical order.
    pub fn tapscripts(&self) -> Vec<ScriptBuf> {
        vec![
            self.claim_script(),
            self.refund_script(),
            self.refund_without_receiver_script(),
            self.unilateral_claim_script(),
            self.unilateral_refund_script(),
            self.unilateral_refund_without_receiver_script(),
        ]
    }

    fn spend_info_for(&self, script: ScriptBuf) -> (ScriptBuf, taproot::ControlBlock) {
        let control_block = self
            .taproot_spend_info
            .control_block(&(script.clone(), LeafVersion::TapScript))
            .expect("script is in the tree");

        (script, control_block)
    }
}
