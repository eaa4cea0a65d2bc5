//! Messages exchanged between the client and the server.

use crate::tree_signing::AggregatedNonces;
use crate::tx_tree::TxTree;
use crate::ArkAddress;
use bitcoin::secp256k1::PublicKey;
use bitcoin::Amount;
use bitcoin::FeeRate;
use bitcoin::Network;
use bitcoin::OutPoint;
use bitcoin::Psbt;
use bitcoin::ScriptBuf;
use bitcoin::Txid;

/// Fees charged by the server on registered intents.
#[derive(Clone, Copy, Debug, Default)]
pub struct FeeInfo {
    /// Flat fee per on-chain output of a commitment transaction.
    pub intent_onchain_output: Amount,
}

/// Static information about the server, as returned by `get_info`.
#[derive(Clone, Debug)]
pub struct Info {
    pub pk: PublicKey,
    pub vtxo_tree_expiry: bitcoin::Sequence,
    pub unilateral_exit_delay: bitcoin::Sequence,
    pub boarding_exit_delay: bitcoin::Sequence,
    /// Seconds between settlement rounds.
    pub round_interval: i64,
    pub network: Network,
    pub dust: Amount,
    pub forfeit_address: bitcoin::Address,
    pub version: String,
    pub fees: Option<FeeInfo>,
    pub checkpoint_tapscript: Option<ScriptBuf>,
    pub utxo_min_amount: Option<Amount>,
    pub utxo_max_amount: Option<Amount>,
    pub vtxo_min_amount: Option<Amount>,
    pub vtxo_max_amount: Option<Amount>,
}

/// A VTXO as reported by the server.
#[derive(Clone, Debug, PartialEq)]
pub struct VirtualTxOutPoint {
    pub outpoint: OutPoint,
    pub created_at: i64,
    pub expires_at: i64,
    pub amount: Amount,
    pub script: ScriptBuf,
    /// A pre-confirmed VTXO spends from another VTXO and is not a leaf of the original VTXO
    /// tree in a batch.
    pub is_preconfirmed: bool,
    pub is_swept: bool,
    pub is_unrolled: bool,
    pub is_spent: bool,
    /// If the VTXO is spent, this field references the transaction that actually spends it.
    pub spent_by: Option<Txid>,
    /// The list of commitment transactions that are ancestors to this VTXO.
    pub commitment_txids: Vec<Txid>,
    /// The commitment TXID onto which this VTXO was forfeited.
    pub settled_by: Option<Txid>,
    /// The Ark transaction that _spends_ this VTXO.
    pub ark_txid: Option<Txid>,
}

impl VirtualTxOutPoint {
    pub fn is_spendable(&self) -> bool {
        !self.is_spent && !self.is_unrolled && !self.is_swept
    }

    /// A swept but unspent VTXO can still be recovered through a settlement round.
    pub fn is_recoverable(&self) -> bool {
        self.is_swept && !self.is_spent
    }
}

#[derive(Clone, Debug)]
pub struct GetVtxosRequest {
    reference: GetVtxosRequestReference,
    filter: Option<GetVtxosRequestFilter>,
    page: Option<(i32, i32)>,
}

impl GetVtxosRequest {
    pub fn new_for_addresses(addresses: &[ArkAddress]) -> Self {
        let scripts = addresses
            .iter()
            .map(|a| a.to_p2tr_script_pubkey())
            .collect();

        Self {
            reference: GetVtxosRequestReference::Scripts(scripts),
            filter: None,
            page: None,
        }
    }

    pub fn new_for_outpoints(outpoints: &[OutPoint]) -> Self {
        Self {
            reference: GetVtxosRequestReference::OutPoints(outpoints.to_vec()),
            filter: None,
            page: None,
        }
    }

    pub fn spendable_only(self) -> Self {
        Self {
            filter: Some(GetVtxosRequestFilter::Spendable),
            ..self
        }
    }

    pub fn spent_only(self) -> Self {
        Self {
            filter: Some(GetVtxosRequestFilter::Spent),
            ..self
        }
    }

    pub fn with_page(self, size: i32, index: i32) -> Self {
        Self {
            page: Some((size, index)),
            ..self
        }
    }

    pub fn reference(&self) -> &GetVtxosRequestReference {
        &self.reference
    }

    pub fn filter(&self) -> Option<GetVtxosRequestFilter> {
        self.filter
    }

    pub fn page(&self) -> Option<(i32, i32)> {
        self.page
    }
}

#[derive(Clone, Debug)]
pub enum GetVtxosRequestReference {
    Scripts(Vec<ScriptBuf>),
    OutPoints(Vec<OutPoint>),
}

impl GetVtxosRequestReference {
    pub fn is_empty(&self) -> bool {
        match self {
            GetVtxosRequestReference::Scripts(scripts) => scripts.is_empty(),
            GetVtxosRequestReference::OutPoints(outpoints) => outpoints.is_empty(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum GetVtxosRequestFilter {
    Spendable,
    Spent,
}

#[derive(Debug)]
pub struct ListVtxosResponse {
    pub vtxos: Vec<VirtualTxOutPoint>,
    pub page: Option<Page>,
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub current: i32,
    pub next: i32,
    pub total: i32,
}

/// The server's response to `submit_tx`.
#[derive(Debug, Clone)]
pub struct SubmitTxResponse {
    pub ark_txid: Txid,
    pub signed_ark_tx: Psbt,
    pub signed_checkpoint_txs: Vec<Psbt>,
}

#[derive(Debug, Clone)]
pub struct BatchStartedEvent {
    pub id: String,
    pub intent_id_hashes: Vec<String>,
    pub batch_expiry: bitcoin::Sequence,
}

#[derive(Debug, Clone)]
pub struct SigningStartEvent {
    pub id: String,
    pub cosigners_pubkeys: Vec<PublicKey>,
    pub unsigned_commitment_tx: Psbt,
    pub vtxo_tree: TxTree,
}

#[derive(Debug, Clone)]
pub struct SigningNoncesGeneratedEvent {
    pub id: String,
    pub tree_nonces: AggregatedNonces,
}

#[derive(Debug, Clone)]
pub struct FinalizationEvent {
    pub id: String,
    pub commitment_tx: Psbt,
    pub connectors_tree: TxTree,
    pub min_relay_fee_rate: FeeRate,
}

#[derive(Debug, Clone)]
pub struct FinalizedEvent {
    pub id: String,
    pub commitment_txid: Txid,
}

#[derive(Debug, Clone)]
pub struct FailedEvent {
    pub id: String,
    pub reason: String,
}

/// The unidirectional event stream driving a settlement round.
#[derive(Debug, Clone)]
pub enum SettlementEvent {
    BatchStarted(BatchStartedEvent),
    SigningStart(SigningStartEvent),
    SigningNoncesGenerated(SigningNoncesGeneratedEvent),
    Finalization(FinalizationEvent),
    Finalized(FinalizedEvent),
    Failed(FailedEvent),
}

impl SettlementEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SettlementEvent::BatchStarted(_) => "BatchStarted",
            SettlementEvent::SigningStart(_) => "SigningStart",
            SettlementEvent::SigningNoncesGenerated(_) => "SigningNoncesGenerated",
            SettlementEvent::Finalization(_) => "Finalization",
            SettlementEvent::Finalized(_) => "Finalized",
            SettlementEvent::Failed(_) => "Failed",
        }
    }
}
