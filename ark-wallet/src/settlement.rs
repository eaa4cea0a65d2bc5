//! The client side of a settlement round.
//!
//! The server drives the round through a unidirectional event stream; the client walks a
//! monotonic state machine from intent registration to finalization. Out-of-order events are
//! ignored so that replays are harmless; a `Failed` event (or any RPC error inside the round)
//! aborts the session, which is not resumable.

use crate::error::ErrorContext;
use crate::utils::retry_policy;
use crate::utils::timeout_op;
use crate::ContractRepository;
use crate::Error;
use crate::Explorer;
use crate::Identity;
use crate::ServerClient;
use crate::Wallet;
use crate::WalletRepository;
use ark_wallet_core::forfeit::create_and_sign_forfeit_txs;
use ark_wallet_core::forfeit::estimate_forfeit_fee;
use ark_wallet_core::forfeit::sign_commitment_psbt;
use ark_wallet_core::intent;
use ark_wallet_core::psbt::get_vtxo_tree_expiry;
use ark_wallet_core::script::extract_checksig_pubkeys;
use ark_wallet_core::server::SettlementEvent;
use ark_wallet_core::sweep::SweepScript;
use ark_wallet_core::tree_signing::TreeSignerSession;
use ark_wallet_core::tx_tree::validate_connectors_tx_tree;
use ark_wallet_core::tx_tree::validate_receivers;
use ark_wallet_core::tx_tree::validate_vtxo_tx_tree;
use ark_wallet_core::tx_tree::Receiver;
use ark_wallet_core::ArkAddress;
use ark_wallet_core::BATCH_OUTPUT_INDEX;
use ark_wallet_core::VTXO_INPUT_INDEX;
use backon::Retryable;
use bitcoin::key::Keypair;
use bitcoin::psbt;
use bitcoin::secp256k1;
use bitcoin::secp256k1::schnorr;
use bitcoin::Address;
use bitcoin::Amount;
use bitcoin::TxOut;
use bitcoin::Txid;
use bitcoin::XOnlyPublicKey;
use futures::StreamExt;
use rand::CryptoRng;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// The states of a settlement session, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Registered,
    SigningStart,
    NoncesGenerated,
    Finalizing,
}

/// What the round should produce for us.
#[derive(Debug, Clone)]
pub(crate) enum BatchOutputType {
    /// Settle everything into a fresh VTXO.
    Board {
        to_address: ArkAddress,
        to_amount: Amount,
    },
    /// Send value on-chain, with off-chain change.
    OffBoard {
        to_address: Address,
        to_amount: Amount,
        change_address: ArkAddress,
        change_amount: Amount,
    },
}

/// The 1 Hz keep-alive ping for a registered intent.
///
/// Exactly one ping task runs at a time: the task is aborted and restarted on every state
/// transition, and aborted for good when the session ends (or is dropped).
struct Heartbeat {
    handle: tokio::task::JoinHandle<()>,
}

impl Heartbeat {
    fn start<S>(server: Arc<S>, request_id: String) -> Self
    where
        S: ServerClient + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;

                if let Err(error) = server.ping(request_id.clone()).await {
                    tracing::debug!(%error, request_id, "Heartbeat ping failed");
                }
            }
        });

        Self { handle }
    }

    fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
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
    /// Settle _all_ prior VTXOs and boarding outputs into the next batch, generating a fresh
    /// confirmed VTXO.
    pub async fn settle<R>(&self, rng: &mut R) -> Result<Option<Txid>, Error>
    where
        R: Rng + CryptoRng + Clone,
    {
        let (to_address, _) = self.get_offchain_address()?;

        let (onchain_inputs, vtxo_inputs, total_amount) = self.fetch_round_inputs().await?;

        tracing::debug!(
            offchain_address = %to_address.encode(),
            ?onchain_inputs,
            n_vtxo_inputs = vtxo_inputs.len(),
            "Attempting to settle outputs"
        );

        if onchain_inputs.is_empty() && vtxo_inputs.is_empty() {
            tracing::debug!("No inputs to settle");
            return Ok(None);
        }

        let commitment_txid = self
            .join_next_round(
                rng,
                onchain_inputs,
                vtxo_inputs,
                BatchOutputType::Board {
                    to_address,
                    to_amount: total_amount,
                },
                None,
            )
            .await?;

        tracing::info!(%commitment_txid, "Settlement success");

        Ok(Some(commitment_txid))
    }

    /// Like [`Wallet::settle`], but cancellable: flip the watch channel to `true` to abort.
    ///
    /// On cancellation the heartbeat stops, the event stream is dropped and the signer session
    /// (with its secret nonces) is discarded.
    pub async fn settle_with_cancel<R>(
        &self,
        rng: &mut R,
        cancel: watch::Receiver<bool>,
    ) -> Result<Option<Txid>, Error>
    where
        R: Rng + CryptoRng + Clone,
    {
        let (to_address, _) = self.get_offchain_address()?;

        let (onchain_inputs, vtxo_inputs, total_amount) = self.fetch_round_inputs().await?;

        if onchain_inputs.is_empty() && vtxo_inputs.is_empty() {
            return Ok(None);
        }

        let commitment_txid = self
            .join_next_round(
                rng,
                onchain_inputs,
                vtxo_inputs,
                BatchOutputType::Board {
                    to_address,
                    to_amount: total_amount,
                },
                Some(cancel),
            )
            .await?;

        Ok(Some(commitment_txid))
    }

    /// Settle prior VTXOs and boarding outputs into an on-chain output of the next commitment
    /// transaction.
    pub async fn offboard<R>(
        &self,
        rng: &mut R,
        to_address: Address,
        to_amount: Amount,
    ) -> Result<Txid, Error>
    where
        R: Rng + CryptoRng + Clone,
    {
        let (change_address, _) = self.get_offchain_address()?;

        let (onchain_inputs, vtxo_inputs, total_amount) = self.fetch_round_inputs().await?;

        let onchain_fee = self
            .server_info
            .fees
            .map(|f| f.intent_onchain_output)
            .unwrap_or(Amount::ZERO);

        // The server charges its on-chain output fee out of the requested amount.
        let net_to_amount = to_amount.checked_sub(onchain_fee).ok_or_else(|| {
            Error::coin_select(format!(
                "cannot deduct fees from offboard amount ({onchain_fee} > {to_amount})"
            ))
        })?;

        let change_amount = total_amount.checked_sub(to_amount).ok_or_else(|| {
            Error::coin_select(format!(
                "cannot afford to send {to_amount}, only have {total_amount}"
            ))
        })?;

        tracing::info!(
            %to_address,
            gross_amount = %to_amount,
            net_amount = %net_to_amount,
            fee = %onchain_fee,
            change_address = %change_address.encode(),
            %change_amount,
            "Attempting to offboard outputs"
        );

        let commitment_txid = self
            .join_next_round(
                rng,
                onchain_inputs,
                vtxo_inputs,
                BatchOutputType::OffBoard {
                    to_address,
                    to_amount: net_to_amount,
                    change_address,
                    change_amount,
                },
                None,
            )
            .await?;

        tracing::info!(%commitment_txid, "Offboard success");

        Ok(commitment_txid)
    }

    /// Collect the [`intent::OnChainInput`]s and [`intent::Input`]s that can join an upcoming
    /// round.
    pub(crate) async fn fetch_round_inputs(
        &self,
    ) -> Result<(Vec<intent::OnChainInput>, Vec<intent::Input>, Amount), Error> {
        let now = crate::now_unix();

        let mut onchain_inputs = Vec::new();
        let mut total_amount = Amount::ZERO;

        for (boarding_output, utxo) in self.get_boarding_utxos().await? {
            let confirmation_blocktime = utxo
                .confirmation_blocktime
                .expect("only confirmed boarding UTXOs are returned");

            // Boarding outputs with an _active_ exit path should be exited unilaterally, not
            // settled.
            if boarding_output.can_be_claimed_unilaterally_by_owner(
                Duration::from_secs(now),
                Duration::from_secs(confirmation_blocktime),
            ) {
                continue;
            }

            total_amount += utxo.amount;
            onchain_inputs.push(intent::OnChainInput::new(
                boarding_output,
                utxo.amount,
                utxo.outpoint,
            ));
        }

        let (vtxo_list, vtxo_script) = self.list_vtxos().await?;

        let vtxo_inputs = vtxo_list
            .all_unspent()
            .map(|virtual_tx_outpoint| {
                let spend_info = vtxo_script.forfeit_spend_info()?;

                Ok(intent::Input::new(
                    virtual_tx_outpoint.outpoint,
                    vtxo_script.exit_delay(),
                    None,
                    TxOut {
                        value: virtual_tx_outpoint.amount,
                        script_pubkey: vtxo_script.script_pubkey(),
                    },
                    vtxo_script.tapscripts(),
                    spend_info,
                    false,
                    virtual_tx_outpoint.is_swept,
                ))
            })
            .collect::<Result<Vec<_>, ark_wallet_core::Error>>()?;

        total_amount += vtxo_list
            .all_unspent()
            .fold(Amount::ZERO, |acc, vtxo| acc + vtxo.amount);

        Ok((onchain_inputs, vtxo_inputs, total_amount))
    }

    pub(crate) async fn join_next_round<R>(
        &self,
        rng: &mut R,
        onchain_inputs: Vec<intent::OnChainInput>,
        vtxo_inputs: Vec<intent::Input>,
        output_type: BatchOutputType,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<Txid, Error>
    where
        R: Rng + CryptoRng,
    {
        if onchain_inputs.is_empty() && vtxo_inputs.is_empty() {
            return Err(Error::ad_hoc("cannot join round without inputs"));
        }

        let server_info = &self.server_info;
        let dust = server_info.dust;

        // An ephemeral cosigner keypair, one per session. Never reused.
        let own_cosigner_kp = Keypair::new(self.secp(), rng);
        let own_cosigner_pk = own_cosigner_kp.public_key();

        let (outputs, receivers) = match &output_type {
            BatchOutputType::Board {
                to_address,
                to_amount,
            } => {
                if *to_amount < dust {
                    return Err(Error::ad_hoc(format!(
                        "cannot settle into sub-dust VTXO: {to_amount} < {dust}"
                    )));
                }

                let outputs = vec![intent::Output::Offchain(TxOut {
                    value: *to_amount,
                    script_pubkey: to_address.to_p2tr_script_pubkey(),
                })];

                let receivers = vec![Receiver {
                    address: *to_address,
                    amount: *to_amount,
                    assets: vec![],
                }];

                (outputs, receivers)
            }
            BatchOutputType::OffBoard {
                to_address,
                to_amount,
                change_address,
                change_amount,
            } => {
                let mut outputs = vec![intent::Output::Onchain(TxOut {
                    value: *to_amount,
                    script_pubkey: to_address.script_pubkey(),
                })];

                let mut receivers = Vec::new();

                if *change_amount > Amount::ZERO {
                    if *change_amount < dust {
                        return Err(Error::ad_hoc(format!(
                            "cannot settle with sub-dust change VTXO: {change_amount} < {dust}"
                        )));
                    }

                    outputs.push(intent::Output::Offchain(TxOut {
                        value: *change_amount,
                        script_pubkey: change_address.to_p2tr_script_pubkey(),
                    }));

                    receivers.push(Receiver {
                        address: *change_address,
                        amount: *change_amount,
                        assets: vec![],
                    });
                }

                (outputs, receivers)
            }
        };

        // Whether this round must produce new VTXOs for us. Without off-chain outputs there is
        // no tree to co-sign, and the server takes us straight to finalization.
        let expects_offchain_outputs = outputs
            .iter()
            .any(|o| matches!(o, intent::Output::Offchain(_)));

        let intent = self.make_round_intent(
            &onchain_inputs,
            vtxo_inputs.clone(),
            &outputs,
            own_cosigner_pk,
        )?;

        // Registration happens before the round starts and may be retried.
        let register = || async {
            timeout_op(
                self.timeout(),
                self.server().register_inputs_for_next_round(intent.clone()),
            )
            .await
            .and_then(|res| res)
        };

        let request_id = register
            .retry(retry_policy())
            .sleep(crate::utils::sleep)
            .notify(|err: &Error, dur: Duration| {
                tracing::warn!("Retrying intent registration after {dur:?}. Error: {err}");
            })
            .await
            .context("failed to register intent")?;

        tracing::debug!(request_id, "Registered intent for round");

        let register_outputs = || async {
            timeout_op(
                self.timeout(),
                self.server()
                    .register_outputs_for_next_round(request_id.clone(), outputs.clone()),
            )
            .await
            .and_then(|res| res)
        };

        register_outputs
            .retry(retry_policy())
            .sleep(crate::utils::sleep)
            .await
            .context("failed to register outputs")?;

        let mut stream = self.server().event_stream().await?;

        let mut heartbeat = Some(Heartbeat::start(
            Arc::clone(self.server()),
            request_id.clone(),
        ));

        let restart_heartbeat = |heartbeat: &mut Option<Heartbeat>| {
            if let Some(heartbeat) = heartbeat.take() {
                heartbeat.stop();
            }
            *heartbeat = Some(Heartbeat::start(
                Arc::clone(self.server()),
                request_id.clone(),
            ));
        };

        let mut state = SessionState::Registered;

        let mut batch_expiry = None;
        let mut signer_session: Option<TreeSignerSession> = None;

        let server_pk = server_info.pk.x_only_public_key().0;
        let forfeit_script = server_info.forfeit_address.script_pubkey();

        // Resolves once (and only once) cancellation is requested. A dropped cancel handle
        // means the round can no longer be cancelled.
        let cancelled = async move {
            match cancel {
                Some(mut cancel) => loop {
                    if *cancel.borrow() {
                        return;
                    }

                    if cancel.changed().await.is_err() {
                        futures::future::pending::<()>().await;
                    }
                },
                None => futures::future::pending().await,
            }
        };
        tokio::pin!(cancelled);

        loop {
            let event = tokio::select! {
                biased;
                () = &mut cancelled => {
                    // Stop pinging and drop the in-memory session, secret nonces included.
                    if let Some(heartbeat) = heartbeat.take() {
                        heartbeat.stop();
                    }
                    drop(signer_session);

                    return Err(Error::cancelled());
                }
                event = stream.next() => event,
            };

            let event = match event {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    return Err(Error::settlement_aborted(format!(
                        "event stream error: {e}"
                    )));
                }
                None => {
                    return Err(Error::settlement_aborted("event stream dropped"));
                }
            };

            tracing::debug!(event = event.name(), ?state, "Round event");

            match event {
                SettlementEvent::BatchStarted(e) => {
                    if state != SessionState::Registered {
                        continue;
                    }

                    // The expiry of this batch fixes the sweep tweak of the whole tree.
                    batch_expiry = Some(e.batch_expiry);

                    tracing::debug!(batch_id = e.id, "Batch started");
                }
                SettlementEvent::SigningStart(e) => {
                    if state != SessionState::Registered || !expects_offchain_outputs {
                        continue;
                    }

                    if !e.cosigners_pubkeys.contains(&own_cosigner_pk) {
                        return Err(Error::settlement_aborted(format!(
                            "own cosigner PK is not present in cosigner PKs: {own_cosigner_pk}"
                        )));
                    }

                    // The tree may carry its own expiry; the batch event and the static
                    // server info are fallbacks.
                    let tree_expiry = e.vtxo_tree.root().ok().and_then(|root| {
                        get_vtxo_tree_expiry(&root.tx.inputs[VTXO_INPUT_INDEX])
                            .ok()
                            .flatten()
                    });

                    let sweep = SweepScript::new(
                        tree_expiry
                            .or(batch_expiry)
                            .unwrap_or(server_info.vtxo_tree_expiry),
                        server_pk,
                    );

                    validate_vtxo_tx_tree(&e.vtxo_tree, &e.unsigned_commitment_tx, &sweep)
                        .map_err(|e| Error::settlement_aborted(e.to_string()))?;

                    // The server must not omit or alter our registered outputs.
                    validate_receivers(&e.vtxo_tree, &receivers)
                        .map_err(|e| Error::settlement_aborted(e.to_string()))?;

                    let amount = e
                        .unsigned_commitment_tx
                        .unsigned_tx
                        .output
                        .get(BATCH_OUTPUT_INDEX as usize)
                        .map(|output| output.value)
                        .ok_or_else(|| {
                            Error::settlement_aborted("commitment TX has no batch output")
                        })?;

                    let mut session =
                        TreeSignerSession::new(own_cosigner_kp, e.vtxo_tree, sweep, amount);

                    session
                        .set_keys(e.cosigners_pubkeys)
                        .map_err(ark_wallet_core::Error::from)
                        .map_err(Error::from)?;

                    let nonces = session.get_nonces(rng).map_err(Error::from)?;

                    timeout_op(
                        self.timeout(),
                        self.server().submit_tree_nonces(
                            request_id.clone(),
                            own_cosigner_pk,
                            nonces.encode_hex(),
                        ),
                    )
                    .await
                    .context("failed to submit tree nonces")?
                    .map_err(|e| Error::settlement_aborted(format!("{e}")))?;

                    signer_session = Some(session);

                    restart_heartbeat(&mut heartbeat);
                    state = SessionState::SigningStart;
                }
                SettlementEvent::SigningNoncesGenerated(e) => {
                    if state != SessionState::SigningStart {
                        continue;
                    }

                    let session = signer_session
                        .as_mut()
                        .ok_or_else(|| Error::settlement_aborted("missing signer session"))?;

                    session
                        .set_aggregated_nonces(e.tree_nonces)
                        .map_err(ark_wallet_core::Error::from)
                        .map_err(Error::from)?;

                    let partial_sigs = session.sign().map_err(Error::from)?;

                    timeout_op(
                        self.timeout(),
                        self.server().submit_tree_signatures(
                            request_id.clone(),
                            own_cosigner_pk,
                            partial_sigs.encode_hex(),
                        ),
                    )
                    .await
                    .context("failed to submit tree signatures")?
                    .map_err(|e| Error::settlement_aborted(format!("{e}")))?;

                    restart_heartbeat(&mut heartbeat);
                    state = SessionState::NoncesGenerated;
                }
                SettlementEvent::Finalization(e) => {
                    let ready = match state {
                        SessionState::NoncesGenerated => true,
                        // Without off-chain outputs, the signing phases never ran.
                        SessionState::Registered => !expects_offchain_outputs,
                        SessionState::SigningStart | SessionState::Finalizing => false,
                    };

                    if !ready {
                        continue;
                    }

                    validate_connectors_tx_tree(&e.connectors_tree, &e.commitment_tx)
                        .map_err(|e| Error::settlement_aborted(e.to_string()))?;

                    let signed_forfeit_psbts = if vtxo_inputs.is_empty() {
                        Vec::new()
                    } else {
                        if let Some(first) = vtxo_inputs.first() {
                            let (script, control_block) = first.spend_info();
                            match estimate_forfeit_fee(
                                script,
                                control_block,
                                e.min_relay_fee_rate,
                            ) {
                                Ok(fee) => {
                                    tracing::debug!(%fee, "Estimated forfeit TX fee")
                                }
                                Err(error) => {
                                    tracing::debug!(%error, "Failed to estimate forfeit fee")
                                }
                            }
                        }

                        let connectors_leaves = e.connectors_tree.leaves();
                        let connectors_leaves = connectors_leaves
                            .iter()
                            .map(|node| &node.tx)
                            .collect::<Vec<_>>();

                        create_and_sign_forfeit_txs(
                            |input: &mut psbt::Input, msg: secp256k1::Message| {
                                self.sign_for_own_pks(input, msg)
                            },
                            &vtxo_inputs,
                            &connectors_leaves,
                            &forfeit_script,
                            dust,
                        )
                        .map_err(Error::from)?
                    };

                    let commitment_psbt = if onchain_inputs.is_empty() {
                        None
                    } else {
                        let mut commitment_psbt = e.commitment_tx;

                        let sign_for_pk_fn = |_: &XOnlyPublicKey,
                                              msg: &secp256k1::Message|
                         -> Result<
                            schnorr::Signature,
                            ark_wallet_core::Error,
                        > {
                            self.identity()
                                .sign_message(msg)
                                .map_err(|e| ark_wallet_core::Error::ad_hoc(e.to_string()))
                        };

                        sign_commitment_psbt(
                            sign_for_pk_fn,
                            &mut commitment_psbt,
                            &onchain_inputs,
                        )
                        .map_err(Error::from)?;

                        Some(commitment_psbt)
                    };

                    timeout_op(
                        self.timeout(),
                        self.server()
                            .submit_signed_forfeit_txs(signed_forfeit_psbts, commitment_psbt),
                    )
                    .await
                    .context("failed to submit forfeit transactions")?
                    .map_err(|e| Error::settlement_aborted(format!("{e}")))?;

                    restart_heartbeat(&mut heartbeat);
                    state = SessionState::Finalizing;
                }
                SettlementEvent::Finalized(e) => {
                    if state != SessionState::Finalizing {
                        continue;
                    }

                    if let Some(heartbeat) = heartbeat.take() {
                        heartbeat.stop();
                    }

                    tracing::info!(
                        batch_id = e.id,
                        commitment_txid = %e.commitment_txid,
                        "Round finalized"
                    );

                    return Ok(e.commitment_txid);
                }
                SettlementEvent::Failed(e) => {
                    if let Some(heartbeat) = heartbeat.take() {
                        heartbeat.stop();
                    }

                    return Err(Error::settlement_aborted(e.reason));
                }
            }
        }
    }

    fn make_round_intent(
        &self,
        onchain_inputs: &[intent::OnChainInput],
        vtxo_inputs: Vec<intent::Input>,
        outputs: &[intent::Output],
        own_cosigner_pk: bitcoin::secp256k1::PublicKey,
    ) -> Result<intent::Intent, Error> {
        let now = crate::now_unix();
        let expire_at = now + 2 * 60;

        let onchain_output_indexes = outputs
            .iter()
            .enumerate()
            .filter_map(|(i, o)| matches!(o, intent::Output::Onchain(_)).then_some(i))
            .collect();

        let message = intent::IntentMessage::Register {
            onchain_output_indexes,
            valid_at: now,
            expire_at,
            own_cosigner_pks: vec![own_cosigner_pk],
        };

        let inputs = onchain_inputs
            .iter()
            .map(|o| o.to_intent_input())
            .chain(vtxo_inputs)
            .collect::<Vec<_>>();

        let sign_for_vtxo_fn = |input: &mut psbt::Input,
                                msg: secp256k1::Message|
         -> Result<
            Vec<(schnorr::Signature, XOnlyPublicKey)>,
            ark_wallet_core::Error,
        > {
            self.sign_for_own_pks(input, msg)
        };

        let sign_for_onchain_fn = |_: &mut psbt::Input,
                                   msg: secp256k1::Message|
         -> Result<
            (schnorr::Signature, XOnlyPublicKey),
            ark_wallet_core::Error,
        > {
            let sig = self
                .identity()
                .sign_message(&msg)
                .map_err(|e| ark_wallet_core::Error::ad_hoc(e.to_string()))?;

            Ok((sig, self.identity().x_only_public_key()))
        };

        let intent = intent::make_intent(
            sign_for_vtxo_fn,
            sign_for_onchain_fn,
            inputs,
            outputs.to_vec(),
            message,
        )?;

        Ok(intent)
    }

    /// Sign for every key of ours found in the input's witness script.
    pub(crate) fn sign_for_own_pks(
        &self,
        input: &mut psbt::Input,
        msg: secp256k1::Message,
    ) -> Result<Vec<(schnorr::Signature, XOnlyPublicKey)>, ark_wallet_core::Error> {
        let script = input
            .witness_script
            .as_ref()
            .or_else(|| {
                input
                    .tap_scripts
                    .first_key_value()
                    .map(|(_, (script, _))| script)
            })
            .ok_or_else(|| {
                ark_wallet_core::Error::ad_hoc("missing witness script in psbt::Input")
            })?;

        let own_pk = self.identity().x_only_public_key();

        let mut res = vec![];
        for pk in extract_checksig_pubkeys(script) {
            if pk == own_pk {
                let sig = self
                    .identity()
                    .sign_message(&msg)
                    .map_err(|e| ark_wallet_core::Error::ad_hoc(e.to_string()))?;
                res.push((sig, pk));
            }
        }

        Ok(res)
    }
}
