use bitcoin::Amount;
use bitcoin::OutPoint;
use bitcoin::ScriptBuf;
use bitcoin::TxOut;

pub mod asset;
pub mod boarding_output;
pub mod coin_select;
pub mod conversions;
pub mod forfeit;
pub mod history;
pub mod htlc;
pub mod intent;
pub mod psbt;
pub mod script;
pub mod send;
pub mod server;
pub mod sweep;
pub mod tree_signing;
pub mod tx_tree;
pub mod utils;
pub mod vtxo;
pub mod vtxo_list;

mod ark_address;
mod error;

pub use ark_address::ArkAddress;
pub use boarding_output::BoardingOutput;
pub use error::Error;
pub use error::ErrorContext;
pub use script::extract_sequence_from_csv_multisig_script;
pub use tx_tree::TxTree;
pub use vtxo::VtxoScript;
pub use vtxo_list::VtxoList;

/// A point on the curve with no known discrete logarithm, used as the internal key of every
/// Taproot output whose key-spend path must be unusable.
pub const UNSPENDABLE_KEY: &str =
    "0250929b74c1a04954b78b4b6035e97a5e078a5a0f28ec96d547bfee9ace803ac0";

/// Virtual transactions always spend the VTXO through their first input.
pub const VTXO_INPUT_INDEX: usize = 0;

/// The commitment transaction output funding the VTXO tree.
pub const BATCH_OUTPUT_INDEX: u32 = 0;

/// The commitment transaction output funding the connectors tree.
pub const CONNECTORS_OUTPUT_INDEX: u32 = 1;

/// `OP_1 <0x4e73>`, the pay-to-anchor script.
const ANCHOR_SCRIPT_PUBKEY: [u8; 4] = [0x51, 0x02, 0x4e, 0x73];

/// Information about a UTXO that may be extracted from an on-chain explorer.
#[derive(Clone, Copy, Debug)]
pub struct ExplorerUtxo {
    pub outpoint: OutPoint,
    pub amount: Amount,
    pub confirmation_blocktime: Option<u64>,
    pub is_spent: bool,
}

pub fn anchor_output() -> TxOut {
    let script_pubkey = ScriptBuf::from_bytes(ANCHOR_SCRIPT_PUBKEY.to_vec());

    TxOut {
        value: Amount::ZERO,
        script_pubkey,
    }
}
