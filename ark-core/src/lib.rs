use bitcoin::Amount;
use bitcoin::OutPoint;
use bitcoin::ScriptBuf;
use bitcoin::TxOut;

pub mod round;
pub mod script;
pub mod send;
pub mod server;
pub mod tree;
pub mod vhtlc;

mod ark_address;
mod boarding_output;
mod conversions;
mod error;
mod vtxo;

pub use ark_address::ArkAddress;
pub use boarding_output::BoardingOutput;
pub use conversions::from_zkp_pk;
pub use conversions::from_zkp_xonly;
pub use conversions::to_zkp_keypair;
pub use conversions::to_zkp_pk;
pub use error::Error;
pub use error::ErrorContext;
pub use vtxo::Vtxo;

/// A nothing-up-my-sleeve point, used as the internal key of every Taproot script the
/// protocol recognises: `lift_x(sha256(G.x))`.
pub const UNSPENDABLE_KEY: &str =
    "0250929b74c1a04954b78b4b6035e97a5e078a5a0f28ec96d547bfee9ace803ac0";

/// Transactions in the VTXO tree spend their parent through a single input.
pub const VTXO_INPUT_INDEX: usize = 0;

/// Extra witness elements required by an input's spend path are carried in the `unknown`
/// key-value map of that input in the PSBT, under this key.
///
/// The byte value corresponds to the string "condition".
pub const VTXO_CONDITION_KEY: [u8; 9] = [99, 111, 110, 100, 105, 116, 105, 111, 110];

const ANCHOR_SCRIPT_PUBKEY: [u8; 4] = [0x51, 0x02, 0x4e, 0x73];

/// Information about a UTXO that may be extracted from an on-chain explorer.
#[derive(Clone, Copy, Debug)]
pub struct ExplorerUtxo {
    pub outpoint: OutPoint,
    pub amount: Amount,
    pub confirmation_blocktime: Option<u64>,
    pub confirmation_height: Option<u64>,
    pub is_spent: bool,
}

/// The well-known Pay-to-Anchor output carried by protocol transactions so that fees can be
/// attached via CPFP.
pub fn anchor_output() -> TxOut {
    let script_pubkey = ScriptBuf::from_bytes(ANCHOR_SCRIPT_PUBKEY.to_vec());

    TxOut {
        value: Amount::ZERO,
        script_pubkey,
    }
}
