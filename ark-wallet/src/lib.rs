//! Wallet orchestration over the Ark protocol core.
//!
//! The [`Wallet`] aggregates the injected collaborators (server RPC, block explorer, storage
//! repositories and identity) into send/balance/history/settlement operations. One wallet is
//! instantiated per identity; there is no process-wide state.

use crate::utils::timeout_op;
use ark_wallet_core::history;
use ark_wallet_core::history::generate_incoming_vtxo_transaction_history;
use ark_wallet_core::history::generate_outgoing_vtxo_transaction_history;
use ark_wallet_core::history::sort_transactions_by_created_at;
use ark_wallet_core::history::OutgoingTransaction;
use ark_wallet_core::server;
use ark_wallet_core::server::GetVtxosRequest;
use ark_wallet_core::server::VirtualTxOutPoint;
use ark_wallet_core::ArkAddress;
use ark_wallet_core::BoardingOutput;
use ark_wallet_core::htlc::HtlcScript;
use ark_wallet_core::ExplorerUtxo;
use ark_wallet_core::VtxoList;
use ark_wallet_core::VtxoScript;
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::All;
use bitcoin::Address;
use bitcoin::Amount;
use std::sync::Arc;
use std::time::Duration;

pub mod identity;
pub mod repository;
pub mod server_client;

mod error;
mod send;
mod settlement;
mod utils;

pub use error::Error;
pub use error::ErrorContext;
pub use identity::Identity;
pub use identity::KeypairIdentity;
pub use repository::Contract;
pub use repository::ContractRepository;
pub use repository::InMemoryContractRepository;
pub use repository::InMemoryWalletRepository;
pub use repository::VtxoFilter;
pub use repository::WalletRepository;
pub use repository::WalletState;
pub use send::SentTransaction;
pub use server_client::BlockTip;
pub use server_client::Explorer;
pub use server_client::ServerClient;
pub use server_client::SpendStatus;

/// A wallet that has not yet talked to the server.
///
/// Call [`OfflineWallet::connect`] to fetch the server info and obtain an operational
/// [`Wallet`].
pub struct OfflineWallet<S, E, W, C, I> {
    pub name: String,
    server: Arc<S>,
    explorer: Arc<E>,
    wallet_repository: Arc<W>,
    contract_repository: Arc<C>,
    identity: Arc<I>,
    secp: Secp256k1<All>,
    timeout: Duration,
}

/// A wallet connected to a server.
pub struct Wallet<S, E, W, C, I> {
    inner: OfflineWallet<S, E, W, C, I>,
    pub server_info: server::Info,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct OffChainBalance {
    pre_confirmed: Amount,
    confirmed: Amount,
    recoverable: Amount,
}

impl OffChainBalance {
    pub fn pre_confirmed(&self) -> Amount {
        self.pre_confirmed
    }

    pub fn confirmed(&self) -> Amount {
        self.confirmed
    }

    /// Balance which can only be settled, not spent off-chain.
    pub fn recoverable(&self) -> Amount {
        self.recoverable
    }

    pub fn total(&self) -> Amount {
        self.pre_confirmed + self.confirmed + self.recoverable
    }
}

impl<S, E, W, C, I> OfflineWallet<S, E, W, C, I>
where
    S: ServerClient,
    E: Explorer,
    W: WalletRepository,
    C: ContractRepository,
    I: Identity,
{
    pub fn new(
        name: String,
        identity: Arc<I>,
        server: Arc<S>,
        explorer: Arc<E>,
        wallet_repository: Arc<W>,
        contract_repository: Arc<C>,
        timeout: Duration,
    ) -> Self {
        Self {
            name,
            server,
            explorer,
            wallet_repository,
            contract_repository,
            identity,
            secp: Secp256k1::new(),
            timeout,
        }
    }

    /// Fetch the server info and turn this into an operational [`Wallet`].
    pub async fn connect(self) -> Result<Wallet<S, E, W, C, I>, Error> {
        let server_info = timeout_op(self.timeout, self.server.get_info())
            .await
            .context("failed to get server info")??;

        tracing::debug!(name = self.name, "Connected to server");

        Ok(Wallet {
            inner: self,
            server_info,
        })
    }
}

impl<S, E, W, C, I> Wallet<S, E, W, C, I>
where
    S: ServerClient + 'static,
    E: Explorer,
    W: WalletRepository,
    C: ContractRepository,
    I: Identity,
{
    /// The off-chain receiving address of this wallet.
    pub fn get_offchain_address(&self) -> Result<(ArkAddress, VtxoScript), Error> {
        let server_info = &self.server_info;

        let vtxo = VtxoScript::new_default(
            self.secp(),
            server_info.pk.x_only_public_key().0,
            self.inner.identity.x_only_public_key(),
            server_info.unilateral_exit_delay,
            server_info.network,
        )?;

        let ark_address = vtxo.to_ark_address();

        Ok((ark_address, vtxo))
    }

    /// The on-chain boarding address of this wallet.
    pub fn get_boarding_output(&self) -> Result<BoardingOutput, Error> {
        let server_info = &self.server_info;

        let boarding_output = BoardingOutput::new(
            self.secp(),
            server_info.pk.x_only_public_key().0,
            self.inner.identity.x_only_public_key(),
            server_info.boarding_exit_delay,
            server_info.network,
        )?;

        Ok(boarding_output)
    }

    pub fn get_boarding_address(&self) -> Result<Address, Error> {
        Ok(self.get_boarding_output()?.address().clone())
    }

    /// A plain P2TR address of the identity key, used for on-chain change and on-chain sends.
    pub fn get_onchain_address(&self) -> Address {
        Address::p2tr(
            self.secp(),
            self.inner.identity.x_only_public_key(),
            None,
            self.server_info.network,
        )
    }

    /// Fetch our VTXOs from the server and persist them.
    pub async fn list_vtxos(&self) -> Result<(VtxoList, VtxoScript), Error> {
        let (ark_address, vtxo_script) = self.get_offchain_address()?;

        let virtual_tx_outpoints = self
            .fetch_all_vtxos(GetVtxosRequest::new_for_addresses(&[ark_address]))
            .await
            .context("failed to get VTXOs for address")?;

        let owner_script = ark_address.to_p2tr_script_pubkey();
        let last_sync_time = now_unix();

        let persisted = self
            .inner
            .wallet_repository
            .save_vtxos(owner_script, virtual_tx_outpoints.clone(), last_sync_time)
            .await;

        match persisted {
            Ok(()) => {
                let settings = self
                    .inner
                    .wallet_repository
                    .load_state()
                    .await?
                    .map(|state| state.settings)
                    .unwrap_or_default();

                let saved = self
                    .inner
                    .wallet_repository
                    .save_state(WalletState {
                        last_sync_time,
                        settings,
                    })
                    .await;

                if let Err(error) = saved {
                    if !error.is_stale_write() {
                        return Err(error).context("failed to persist wallet state");
                    }
                }
            }
            // A fresher sync already landed; our view is the stale one.
            Err(error) if error.is_stale_write() => {
                tracing::debug!(%error, "Skipping persistence of stale VTXO view");
            }
            Err(error) => {
                return Err(error).context("failed to persist VTXOs");
            }
        }

        Ok((VtxoList::new(virtual_tx_outpoints), vtxo_script))
    }

    /// The VTXOs from the local repository, without talking to the server.
    pub async fn cached_vtxos(
        &self,
        filter: VtxoFilter,
    ) -> Result<Vec<VirtualTxOutPoint>, Error> {
        self.inner.wallet_repository.load_vtxos(filter).await
    }

    /// The persisted wallet state, if any sync has completed yet.
    pub async fn wallet_state(&self) -> Result<Option<WalletState>, Error> {
        self.inner.wallet_repository.load_state().await
    }

    pub async fn offchain_balance(&self) -> Result<OffChainBalance, Error> {
        let (vtxo_list, _) = self.list_vtxos().await.context("failed to list VTXOs")?;

        let pre_confirmed = vtxo_list
            .pre_confirmed()
            .fold(Amount::ZERO, |acc, x| acc + x.amount);

        let confirmed = vtxo_list
            .confirmed()
            .fold(Amount::ZERO, |acc, x| acc + x.amount);

        let recoverable = vtxo_list
            .recoverable()
            .fold(Amount::ZERO, |acc, x| acc + x.amount);

        Ok(OffChainBalance {
            pre_confirmed,
            confirmed,
            recoverable,
        })
    }

    /// All confirmed, unspent boarding UTXOs of this wallet.
    pub async fn get_boarding_utxos(&self) -> Result<Vec<(BoardingOutput, ExplorerUtxo)>, Error> {
        let boarding_output = self.get_boarding_output()?;

        let outpoints = timeout_op(
            self.inner.timeout,
            self.explorer().find_outpoints(boarding_output.address()),
        )
        .await
        .context("failed to find boarding outpoints")??;

        let utxos = outpoints
            .into_iter()
            .filter(|utxo| !utxo.is_spent && utxo.confirmation_blocktime.is_some())
            .map(|utxo| (boarding_output.clone(), utxo))
            .collect();

        Ok(utxos)
    }

    pub async fn transaction_history(&self) -> Result<Vec<history::Transaction>, Error> {
        let mut boarding_transactions = Vec::new();
        let mut boarding_commitment_transactions = Vec::new();

        let boarding_address = self.get_boarding_address()?;

        let outpoints = timeout_op(
            self.inner.timeout,
            self.explorer().find_outpoints(&boarding_address),
        )
        .await
        .context("failed to find outpoints")??;

        for ExplorerUtxo {
            outpoint,
            amount,
            confirmation_blocktime,
            ..
        } in outpoints.iter()
        {
            let confirmed_at = confirmation_blocktime.map(|t| t as i64);

            boarding_transactions.push(history::Transaction::Boarding {
                txid: outpoint.txid,
                amount: *amount,
                confirmed_at,
            });

            let status = timeout_op(
                self.inner.timeout,
                self.explorer()
                    .get_output_status(&outpoint.txid, outpoint.vout),
            )
            .await
            .context("failed to get output status")??;

            if let Some(spend_txid) = status.spend_txid {
                boarding_commitment_transactions.push(spend_txid);
            }
        }

        let (vtxo_list, _) = self.list_vtxos().await?;

        let spent_outpoints = vtxo_list.spent().cloned().collect::<Vec<_>>();
        let unspent_outpoints = vtxo_list.all_unspent().cloned().collect::<Vec<_>>();

        let incoming_transactions = generate_incoming_vtxo_transaction_history(
            &spent_outpoints,
            &unspent_outpoints,
            &boarding_commitment_transactions,
        )?;

        let outgoing_txs =
            generate_outgoing_vtxo_transaction_history(&spent_outpoints, &unspent_outpoints)?;

        let mut outgoing_transactions = vec![];
        for tx in outgoing_txs {
            let tx = match tx {
                OutgoingTransaction::Complete(tx) => tx,
                OutgoingTransaction::Incomplete(incomplete_tx) => {
                    let first_outpoint = incomplete_tx.first_outpoint();

                    let request = GetVtxosRequest::new_for_outpoints(&[first_outpoint]);
                    let vtxos = self.fetch_all_vtxos(request).await?;

                    match vtxos.first() {
                        Some(virtual_tx_outpoint) => {
                            match incomplete_tx.finish(virtual_tx_outpoint) {
                                Ok(tx) => tx,
                                Err(e) => {
                                    tracing::warn!(
                                        %first_outpoint,
                                        "Could not finish outgoing TX, skipping: {e}"
                                    );
                                    continue;
                                }
                            }
                        }
                        None => {
                            tracing::warn!(
                                %first_outpoint,
                                "Could not find virtual TX outpoint for outgoing TX, skipping"
                            );
                            continue;
                        }
                    }
                }
                OutgoingTransaction::IncompleteOffboard(incomplete_offboard) => {
                    let commitment_txid = incomplete_offboard.commitment_txid();

                    let confirmed = timeout_op(
                        self.inner.timeout,
                        self.explorer().is_tx_confirmed(&commitment_txid),
                    )
                    .await
                    .context("failed to get commitment TX status")??;

                    // Confirmation _time_ is not exposed by the explorer interface; the tip of
                    // the commitment transaction is close enough for history purposes.
                    let confirmed_at = confirmed.then(now_unix_i64);

                    incomplete_offboard.finish(confirmed_at)
                }
            };

            outgoing_transactions.push(tx);
        }

        let mut txs = [
            boarding_transactions,
            incoming_transactions,
            outgoing_transactions,
        ]
        .concat();

        sort_transactions_by_created_at(&mut txs);

        Ok(txs)
    }

    /// Fetch all VTXOs for a request, handling pagination internally.
    pub(crate) async fn fetch_all_vtxos(
        &self,
        request: GetVtxosRequest,
    ) -> Result<Vec<VirtualTxOutPoint>, Error> {
        if request.reference().is_empty() {
            return Ok(Vec::new());
        }

        let mut all_vtxos = Vec::new();
        let mut cursor = 0;
        const PAGE_SIZE: i32 = 100;

        loop {
            let paged_request = request.clone().with_page(PAGE_SIZE, cursor);
            let response = timeout_op(
                self.inner.timeout,
                self.server().list_vtxos(paged_request),
            )
            .await
            .context("failed to fetch list of VTXOs")??;

            all_vtxos.extend(response.vtxos);

            // The server cursor is authoritative; next == total means end.
            match response.page {
                Some(page) if page.next < page.total => {
                    cursor = page.next;
                }
                _ => break,
            }
        }

        Ok(all_vtxos)
    }

    /// Record an HTLC contract (e.g. one side of an atomic swap), so that its spending paths
    /// survive a restart.
    pub async fn track_htlc_contract(
        &self,
        id: impl Into<String>,
        htlc: &HtlcScript,
        state: impl Into<String>,
    ) -> Result<(), Error> {
        let contract = Contract {
            id: id.into(),
            state: state.into(),
            expires_at: Some(htlc.options().refund_locktime.to_consensus_u32() as i64),
            address: htlc.address().encode(),
            script: htlc.script_pubkey(),
        };

        self.inner.contract_repository.save_contract(contract).await
    }

    pub async fn set_contract_data(
        &self,
        id: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), Error> {
        self.inner
            .contract_repository
            .set_contract_data(id, key, value)
            .await
    }

    pub async fn get_contract_data(&self, id: &str, key: &str) -> Result<Option<Vec<u8>>, Error> {
        self.inner.contract_repository.get_contract_data(id, key).await
    }

    pub async fn list_contracts(&self) -> Result<Vec<Contract>, Error> {
        self.inner.contract_repository.list_contracts().await
    }

    pub(crate) fn server(&self) -> &Arc<S> {
        &self.inner.server
    }

    pub(crate) fn explorer(&self) -> &E {
        &self.inner.explorer
    }

    pub(crate) fn identity(&self) -> &I {
        &self.inner.identity
    }

    pub(crate) fn secp(&self) -> &Secp256k1<All> {
        &self.inner.secp
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.inner.timeout
    }
}

pub(crate) fn now_unix() -> u64 {
    jiff::Timestamp::now().as_second() as u64
}

pub(crate) fn now_unix_i64() -> i64 {
    jiff::Timestamp::now().as_second()
}
