//! Messages exchanged between the client and the Ark server.

use crate::tree::TxTree;
use crate::tree::TxTreeNode;
use crate::ArkAddress;
use crate::Error;
use bitcoin::secp256k1::PublicKey;
use bitcoin::taproot;
use bitcoin::Amount;
use bitcoin::OutPoint;
use bitcoin::Psbt;
use bitcoin::ScriptBuf;
use bitcoin::TxOut;
use bitcoin::Txid;
use std::collections::HashMap;
use zkp::musig::MusigAggNonce;
use zkp::musig::MusigPartialSignature;
use zkp::musig::MusigPubNonce;

/// Two 33-byte compressed points.
const NONCE_CELL_LEN: usize = 66;
/// One 32-byte scalar.
const PARTIAL_SIG_CELL_LEN: usize = 32;

/// General information about the Ark server.
#[derive(Clone, Debug)]
pub struct Info {
    pub version: String,
    pub signer_pk: PublicKey,
    pub network: bitcoin::Network,
    pub dust: Amount,
    /// Relative locktime after which the server may sweep unspent VTXO tree outputs.
    pub vtxo_tree_expiry: bitcoin::Sequence,
    /// Relative locktime gating the unilateral exit path of a VTXO.
    pub unilateral_exit_delay: bitcoin::Sequence,
    /// Absolute delay added to the funding height of a boarding output to produce its exit
    /// locktime.
    pub boarding_exit_delay: bitcoin::Sequence,
    pub round_interval: i64,
    pub forfeit_address: bitcoin::Address,
    pub utxo_min_amount: Option<Amount>,
    pub utxo_max_amount: Option<Amount>,
    pub vtxo_min_amount: Option<Amount>,
    pub vtxo_max_amount: Option<Amount>,
}

/// The virtual lifecycle state of a VTXO, as reported by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VirtualStatus {
    /// Created off-chain, not yet part of a settled batch.
    Pending,
    /// Confirmed as a leaf of a settled batch.
    Settled,
    /// Reclaimed by the server after expiry.
    Swept,
    Spent,
}

/// A virtual UTXO, as reported by the server.
#[derive(Clone, Debug, PartialEq)]
pub struct VtxoOutPoint {
    pub outpoint: OutPoint,
    pub amount: Amount,
    pub script: ScriptBuf,
    pub status: VirtualStatus,
    /// The round the VTXO was created in, if it has been settled.
    pub batch_txid: Option<Txid>,
    /// Absolute height or timestamp after which the server may sweep the VTXO.
    pub batch_expiry: Option<u64>,
    pub created_at: i64,
}

impl VtxoOutPoint {
    pub fn is_spendable(&self) -> bool {
        matches!(self.status, VirtualStatus::Pending | VirtualStatus::Settled)
    }
}

/// An output requested from the next round.
#[derive(Debug, Clone)]
pub enum RoundOutput {
    /// A fresh VTXO.
    Offchain { address: ArkAddress, amount: Amount },
    /// A vanilla on-chain output, leaving the Ark.
    Onchain {
        address: bitcoin::Address,
        amount: Amount,
    },
}

impl RoundOutput {
    pub fn script_pubkey(&self) -> ScriptBuf {
        match self {
            RoundOutput::Offchain { address, .. } => address.to_p2tr_script_pubkey(),
            RoundOutput::Onchain { address, .. } => address.script_pubkey(),
        }
    }

    pub fn amount(&self) -> Amount {
        match self {
            RoundOutput::Offchain { amount, .. } => *amount,
            RoundOutput::Onchain { amount, .. } => *amount,
        }
    }

    pub fn to_tx_out(&self) -> TxOut {
        TxOut {
            value: self.amount(),
            script_pubkey: self.script_pubkey(),
        }
    }
}

/// A matrix of MuSig2 public nonces shaped like the VTXO tree: one cell per shared internal
/// transaction, indexed by `[level][index]`. Leaf positions are empty.
#[derive(Debug, Clone)]
pub struct NoncePks(Vec<Vec<Option<MusigPubNonce>>>);

impl NoncePks {
    pub fn new(rows: Vec<Vec<Option<MusigPubNonce>>>) -> Self {
        Self(rows)
    }

    /// Get the [`MusigPubNonce`] for the node at `(level, index)`.
    pub fn get(&self, level: usize, index: usize) -> Option<MusigPubNonce> {
        self.0.get(level).and_then(|row| row.get(index)).copied().flatten()
    }

    pub fn rows(&self) -> &[Vec<Option<MusigPubNonce>>] {
        &self.0
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_matrix(&self.0, |nonce| nonce.serialize().to_vec())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let rows = decode_matrix(bytes, NONCE_CELL_LEN, |cell| {
            MusigPubNonce::from_slice(cell).map_err(Error::protocol)
        })?;

        Ok(Self(rows))
    }
}

/// A matrix of server-aggregated MuSig2 nonces, one cell per shared internal transaction in
/// the VTXO tree.
#[derive(Debug, Clone)]
pub struct AggNoncePks(Vec<Vec<Option<MusigAggNonce>>>);

impl AggNoncePks {
    pub fn new(rows: Vec<Vec<Option<MusigAggNonce>>>) -> Self {
        Self(rows)
    }

    /// Get the [`MusigAggNonce`] for the node at `(level, index)`.
    pub fn get(&self, level: usize, index: usize) -> Option<MusigAggNonce> {
        self.0.get(level).and_then(|row| row.get(index)).copied().flatten()
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_matrix(&self.0, |nonce| nonce.serialize().to_vec())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let rows = decode_matrix(bytes, NONCE_CELL_LEN, |cell| {
            MusigAggNonce::from_slice(cell).map_err(Error::protocol)
        })?;

        Ok(Self(rows))
    }
}

/// A matrix of MuSig2 partial signatures, one cell per shared internal transaction in the
/// VTXO tree.
#[derive(Debug, Clone)]
pub struct PartialSigTree(Vec<Vec<Option<MusigPartialSignature>>>);

impl PartialSigTree {
    pub fn new(rows: Vec<Vec<Option<MusigPartialSignature>>>) -> Self {
        Self(rows)
    }

    /// Get the [`MusigPartialSignature`] for the node at `(level, index)`.
    pub fn get(&self, level: usize, index: usize) -> Option<MusigPartialSignature> {
        self.0.get(level).and_then(|row| row.get(index)).copied().flatten()
    }

    pub fn rows(&self) -> &[Vec<Option<MusigPartialSignature>>] {
        &self.0
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_matrix(&self.0, |sig| sig.serialize().to_vec())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let rows = decode_matrix(bytes, PARTIAL_SIG_CELL_LEN, |cell| {
            MusigPartialSignature::from_slice(cell).map_err(Error::protocol)
        })?;

        Ok(Self(rows))
    }
}

/// Encode a tree-shaped matrix: little-endian `u32` row count, then per row a little-endian
/// `u32` cell count followed by the cells, each a presence byte and, if present, the payload.
fn encode_matrix<T, F>(rows: &[Vec<Option<T>>], serialize_cell: F) -> Vec<u8>
where
    F: Fn(&T) -> Vec<u8>,
{
    let mut bytes = Vec::new();

    bytes.extend_from_slice(&(rows.len() as u32).to_le_bytes());

    for row in rows {
        bytes.extend_from_slice(&(row.len() as u32).to_le_bytes());

        for cell in row {
            match cell {
                Some(cell) => {
                    bytes.push(1);
                    bytes.extend_from_slice(&serialize_cell(cell));
                }
                None => {
                    bytes.push(0);
                }
            }
        }
    }

    bytes
}

fn decode_matrix<T, F>(
    bytes: &[u8],
    cell_len: usize,
    parse_cell: F,
) -> Result<Vec<Vec<Option<T>>>, Error>
where
    F: Fn(&[u8]) -> Result<T, Error>,
{
    fn take<'a>(bytes: &'a [u8], cursor: &mut usize, n: usize) -> Result<&'a [u8], Error> {
        let end = (*cursor)
            .checked_add(n)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| Error::protocol("truncated tree matrix"))?;

        let slice = &bytes[*cursor..end];
        *cursor = end;

        Ok(slice)
    }

    let mut cursor = 0;

    let row_count =
        u32::from_le_bytes(take(bytes, &mut cursor, 4)?.try_into().expect("4 bytes")) as usize;

    let mut rows = Vec::with_capacity(row_count);
    for _ in 0..row_count {
        let cell_count =
            u32::from_le_bytes(take(bytes, &mut cursor, 4)?.try_into().expect("4 bytes")) as usize;

        let mut row = Vec::with_capacity(cell_count);
        for _ in 0..cell_count {
            let presence = take(bytes, &mut cursor, 1)?[0];

            match presence {
                0 => row.push(None),
                1 => {
                    let cell = parse_cell(take(bytes, &mut cursor, cell_len)?)?;
                    row.push(Some(cell));
                }
                other => {
                    return Err(Error::protocol(format!(
                        "invalid presence byte in tree matrix: {other}"
                    )))
                }
            }
        }

        rows.push(row);
    }

    if cursor != bytes.len() {
        return Err(Error::protocol("trailing bytes after tree matrix"));
    }

    Ok(rows)
}

#[derive(Debug, Clone)]
pub struct BatchStartedEvent {
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct RoundSigningEvent {
    pub id: String,
    pub cosigners_pubkeys: Vec<PublicKey>,
    pub unsigned_vtxo_tree: Option<TxTree>,
    pub unsigned_round_tx: Psbt,
}

#[derive(Debug, Clone)]
pub struct RoundSigningNoncesGeneratedEvent {
    pub id: String,
    pub tree_nonces: AggNoncePks,
}

#[derive(Debug, Clone)]
pub struct RoundFinalizationEvent {
    pub id: String,
    pub round_tx: Psbt,
    pub connector_tree: TxTree,
    /// Maps the outpoint of each VTXO being forfeited to its connector outpoint.
    pub connectors_index: HashMap<OutPoint, OutPoint>,
    /// In sats per 1000 virtual bytes.
    pub min_relay_fee_rate: u64,
}

#[derive(Debug, Clone)]
pub struct RoundFinalizedEvent {
    pub id: String,
    pub round_txid: Txid,
}

#[derive(Debug, Clone)]
pub struct RoundFailedEvent {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct BatchTreeEvent {
    pub id: String,
    pub batch_tree_event_type: BatchTreeEventType,
    pub node: TxTreeNode,
}

#[derive(Debug, Clone)]
pub struct BatchTreeSignatureEvent {
    pub id: String,
    pub batch_tree_event_type: BatchTreeEventType,
    pub level: usize,
    pub level_index: usize,
    pub signature: taproot::Signature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchTreeEventType {
    Vtxo,
    Connector,
}

/// One event in the server's round stream.
#[derive(Debug, Clone)]
pub enum RoundStreamEvent {
    BatchStarted(BatchStartedEvent),
    RoundSigning(RoundSigningEvent),
    RoundSigningNoncesGenerated(RoundSigningNoncesGeneratedEvent),
    RoundFinalization(RoundFinalizationEvent),
    RoundFinalized(RoundFinalizedEvent),
    RoundFailed(RoundFailedEvent),
    BatchTree(BatchTreeEvent),
    BatchTreeSignature(BatchTreeSignatureEvent),
}

impl RoundStreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RoundStreamEvent::BatchStarted(_) => "BatchStarted",
            RoundStreamEvent::RoundSigning(_) => "RoundSigning",
            RoundStreamEvent::RoundSigningNoncesGenerated(_) => "RoundSigningNoncesGenerated",
            RoundStreamEvent::RoundFinalization(_) => "RoundFinalization",
            RoundStreamEvent::RoundFinalized(_) => "RoundFinalized",
            RoundStreamEvent::RoundFailed(_) => "RoundFailed",
            RoundStreamEvent::BatchTree(_) => "BatchTree",
            RoundStreamEvent::BatchTreeSignature(_) => "BatchTreeSignature",
        }
    }
}

pub fn parse_sequence_number(value: i64) -> Result<bitcoin::Sequence, Error> {
    /// The threshold that determines whether an expiry or exit delay should be parsed as a
    /// number of blocks or a number of seconds.
    ///
    /// - A value below 512 is considered a number of blocks.
    /// - A value of 512 or more is considered a number of seconds.
    const ARBITRARY_SEQUENCE_THRESHOLD: i64 = 512;

    let sequence = if value.is_negative() {
        return Err(Error::protocol(format!("invalid sequence number: {value}")));
    } else if value < ARBITRARY_SEQUENCE_THRESHOLD {
        bitcoin::Sequence::from_height(value as u16)
    } else {
        let secs = u32::try_from(value)
            .map_err(|_| Error::protocol(format!("sequence seconds overflow: {value}")))?;

        bitcoin::Sequence::from_seconds_ceil(secs).map_err(Error::protocol)?
    };

    Ok(sequence)
}
