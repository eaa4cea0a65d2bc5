//! The interfaces the wallet requires of its external collaborators: the server RPC transport
//! and the on-chain block explorer.

use crate::Error;
use ark_wallet_core::intent;
use ark_wallet_core::intent::Intent;
use ark_wallet_core::server;
use ark_wallet_core::server::GetVtxosRequest;
use ark_wallet_core::server::ListVtxosResponse;
use ark_wallet_core::server::SettlementEvent;
use ark_wallet_core::server::SubmitTxResponse;
use ark_wallet_core::ExplorerUtxo;
use bitcoin::secp256k1::PublicKey;
use bitcoin::Address;
use bitcoin::BlockHash;
use bitcoin::FeeRate;
use bitcoin::Psbt;
use bitcoin::Transaction;
use bitcoin::Txid;
use futures::Future;
use futures::Stream;

/// The server RPC surface. The concrete transport (gRPC, REST, in-process) is injected by the
/// application.
pub trait ServerClient: Send + Sync {
    type EventStream: Stream<Item = Result<SettlementEvent, Error>> + Unpin + Send;

    fn get_info(&self) -> impl Future<Output = Result<server::Info, Error>> + Send;

    fn list_vtxos(
        &self,
        request: GetVtxosRequest,
    ) -> impl Future<Output = Result<ListVtxosResponse, Error>> + Send;

    /// Submit a signed Ark transaction together with its unsigned checkpoint transactions.
    fn submit_tx(
        &self,
        signed_ark_tx: Psbt,
        checkpoint_txs: Vec<Psbt>,
    ) -> impl Future<Output = Result<SubmitTxResponse, Error>> + Send;

    /// Return the countersigned checkpoint transactions to finalize an Ark transaction.
    fn finalize_tx(
        &self,
        ark_txid: Txid,
        final_checkpoint_txs: Vec<Psbt>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Register the signed intent for the next round. Returns the request id used by all
    /// subsequent round RPCs.
    fn register_inputs_for_next_round(
        &self,
        intent: Intent,
    ) -> impl Future<Output = Result<String, Error>> + Send;

    fn register_outputs_for_next_round(
        &self,
        request_id: String,
        outputs: Vec<intent::Output>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn submit_tree_nonces(
        &self,
        request_id: String,
        cosigner_pk: PublicKey,
        nonces: String,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn submit_tree_signatures(
        &self,
        request_id: String,
        cosigner_pk: PublicKey,
        signatures: String,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn submit_signed_forfeit_txs(
        &self,
        forfeit_psbts: Vec<Psbt>,
        commitment_psbt: Option<Psbt>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn ping(&self, request_id: String) -> impl Future<Output = Result<(), Error>> + Send;

    fn event_stream(&self) -> impl Future<Output = Result<Self::EventStream, Error>> + Send;
}

#[derive(Clone, Copy, Debug)]
pub struct BlockTip {
    pub height: u32,
    pub hash: BlockHash,
}

#[derive(Clone, Copy, Debug)]
pub struct SpendStatus {
    pub spend_txid: Option<Txid>,
}

/// The on-chain block explorer surface.
pub trait Explorer: Send + Sync {
    fn find_outpoints(
        &self,
        address: &Address,
    ) -> impl Future<Output = Result<Vec<ExplorerUtxo>, Error>> + Send;

    fn broadcast(&self, tx: &Transaction) -> impl Future<Output = Result<Txid, Error>> + Send;

    fn get_block_tip(&self) -> impl Future<Output = Result<BlockTip, Error>> + Send;

    fn is_tx_confirmed(&self, txid: &Txid) -> impl Future<Output = Result<bool, Error>> + Send;

    fn get_output_status(
        &self,
        txid: &Txid,
        vout: u32,
    ) -> impl Future<Output = Result<SpendStatus, Error>> + Send;

    fn get_fee_rate(&self) -> impl Future<Output = Result<FeeRate, Error>> + Send;
}
