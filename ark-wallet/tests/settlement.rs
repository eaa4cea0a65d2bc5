//! End-to-end settlement rounds against a scripted in-process server.

use ark_wallet::Error;
use ark_wallet::Explorer;
use ark_wallet::Identity;
use ark_wallet::InMemoryContractRepository;
use ark_wallet::InMemoryWalletRepository;
use ark_wallet::KeypairIdentity;
use ark_wallet::OfflineWallet;
use ark_wallet::ServerClient;
use ark_wallet::SpendStatus;
use ark_wallet_core::anchor_output;
use ark_wallet_core::intent;
use ark_wallet_core::psbt::set_cosigner_pks;
use ark_wallet_core::server;
use ark_wallet_core::server::GetVtxosRequest;
use ark_wallet_core::server::ListVtxosResponse;
use ark_wallet_core::server::SettlementEvent;
use ark_wallet_core::server::SubmitTxResponse;
use ark_wallet_core::server::VirtualTxOutPoint;
use ark_wallet_core::sweep::SweepScript;
use ark_wallet_core::tree_signing::aggregate_keys;
use ark_wallet_core::tree_signing::aggregate_nonces;
use ark_wallet_core::tree_signing::NoncePks;
use ark_wallet_core::tree_signing::TreeSignerSession;
use ark_wallet_core::tx_tree::TxTree;
use ark_wallet_core::tx_tree::TxTreeNode;
use ark_wallet_core::ExplorerUtxo;
use ark_wallet_core::VtxoScript;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::key::Keypair;
use bitcoin::key::Secp256k1;
use bitcoin::key::TweakedPublicKey;
use bitcoin::secp256k1::PublicKey;
use bitcoin::secp256k1::SecretKey;
use bitcoin::transaction;
use bitcoin::Address;
use bitcoin::Amount;
use bitcoin::BlockHash;
use bitcoin::FeeRate;
use bitcoin::Network;
use bitcoin::OutPoint;
use bitcoin::Psbt;
use bitcoin::ScriptBuf;
use bitcoin::Sequence;
use bitcoin::Transaction;
use bitcoin::TxIn;
use bitcoin::TxOut;
use bitcoin::Txid;
use futures::channel::mpsc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

const VTXO_AMOUNT: Amount = Amount::from_sat(100_000);
const DUST: Amount = Amount::from_sat(546);

fn batch_expiry() -> Sequence {
    Sequence::from_height(144)
}

fn keypair(byte: u8) -> Keypair {
    let secp = Secp256k1::new();
    Keypair::from_secret_key(&secp, &SecretKey::from_slice(&[byte; 32]).unwrap())
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Script {
    /// Run a full round to finalization.
    HappyPath,
    /// Emit `Failed` right after the batch starts.
    FailEarly,
    /// Emit `BatchStarted` and then go silent.
    Silent,
}

struct FakeServer {
    script: Script,
    server_kp: Keypair,
    server_cosigner_kp: Keypair,
    client_owner_pk: bitcoin::XOnlyPublicKey,
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    events: Option<mpsc::UnboundedSender<Result<SettlementEvent, Error>>>,
    client_cosigner_pks: Vec<PublicKey>,
    tree: Option<TxTree>,
    commitment_tx: Option<Psbt>,
    connectors_tree: Option<TxTree>,
    server_session: Option<TreeSignerSession>,
    pings: u32,
    forfeits_received: usize,
}

impl FakeServer {
    fn new(script: Script, client_owner_pk: bitcoin::XOnlyPublicKey) -> Self {
        Self {
            script,
            server_kp: keypair(0xA1),
            server_cosigner_kp: keypair(0xA2),
            client_owner_pk,
            state: Mutex::new(FakeState::default()),
        }
    }

    fn info(&self) -> server::Info {
        server::Info {
            pk: self.server_kp.public_key(),
            vtxo_tree_expiry: batch_expiry(),
            unilateral_exit_delay: Sequence::from_seconds_ceil(512).unwrap(),
            boarding_exit_delay: Sequence::from_seconds_ceil(604672).unwrap(),
            round_interval: 30,
            network: Network::Regtest,
            dust: DUST,
            forfeit_address: Address::p2tr_tweaked(
                TweakedPublicKey::dangerous_assume_tweaked(keypair(0xA3).x_only_public_key().0),
                Network::Regtest,
            ),
            version: "fake".to_string(),
            fees: None,
            checkpoint_tapscript: None,
            utxo_min_amount: None,
            utxo_max_amount: None,
            vtxo_min_amount: None,
            vtxo_max_amount: None,
        }
    }

    fn client_vtxo_script(&self) -> VtxoScript {
        let secp = Secp256k1::new();
        VtxoScript::new_default(
            &secp,
            self.server_kp.x_only_public_key().0,
            self.client_owner_pk,
            Sequence::from_seconds_ceil(512).unwrap(),
            Network::Regtest,
        )
        .unwrap()
    }

    fn sweep(&self) -> SweepScript {
        SweepScript::new(batch_expiry(), self.server_kp.x_only_public_key().0)
    }

    /// Build the commitment transaction and both trees for the registered cosigner set.
    fn build_round(&self, state: &mut FakeState) {
        let cosigner_pks = {
            let mut pks = state.client_cosigner_pks.clone();
            pks.push(self.server_cosigner_kp.public_key());
            pks
        };

        let aggregate = aggregate_keys(&cosigner_pks, Some(&self.sweep())).unwrap();
        let shared_script = ScriptBuf::new_p2tr_tweaked(
            TweakedPublicKey::dangerous_assume_tweaked(aggregate.final_pk),
        );

        let commitment_tx = Psbt::from_unsigned_tx(Transaction {
            version: transaction::Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::from_byte_array([0xCC; 32]),
                    vout: 0,
                },
                ..Default::default()
            }],
            output: vec![
                TxOut {
                    value: VTXO_AMOUNT,
                    script_pubkey: shared_script,
                },
                TxOut {
                    value: DUST,
                    script_pubkey: ScriptBuf::new(),
                },
            ],
        })
        .unwrap();
        let commitment_txid = commitment_tx.unsigned_tx.compute_txid();

        // A one-node VTXO tree: the root is also the only leaf, paying the client.
        let mut root = Psbt::from_unsigned_tx(Transaction {
            version: transaction::Version::non_standard(3),
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: commitment_txid,
                    vout: 0,
                },
                ..Default::default()
            }],
            output: vec![
                TxOut {
                    value: VTXO_AMOUNT,
                    script_pubkey: self.client_vtxo_script().script_pubkey(),
                },
                anchor_output(),
            ],
        })
        .unwrap();
        set_cosigner_pks(&mut root.inputs[0], &cosigner_pks);

        let tree = TxTree::from_nodes([TxTreeNode {
            txid: root.unsigned_tx.compute_txid(),
            tx: root,
            parent_txid: commitment_txid,
            leaf: true,
            level: 0,
            level_index: 0,
        }])
        .unwrap();

        // A one-node connectors tree with a single dust connector.
        let connectors_root = Psbt::from_unsigned_tx(Transaction {
            version: transaction::Version::non_standard(3),
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: commitment_txid,
                    vout: 1,
                },
                ..Default::default()
            }],
            output: vec![
                TxOut {
                    value: DUST,
                    script_pubkey: ScriptBuf::new(),
                },
                anchor_output(),
            ],
        })
        .unwrap();

        let connectors_tree = TxTree::from_nodes([TxTreeNode {
            txid: connectors_root.unsigned_tx.compute_txid(),
            tx: connectors_root,
            parent_txid: commitment_txid,
            leaf: true,
            level: 0,
            level_index: 0,
        }])
        .unwrap();

        let mut server_session = TreeSignerSession::new(
            self.server_cosigner_kp,
            tree.clone(),
            self.sweep(),
            VTXO_AMOUNT,
        );
        server_session.set_keys(cosigner_pks).unwrap();

        state.tree = Some(tree);
        state.commitment_tx = Some(commitment_tx);
        state.connectors_tree = Some(connectors_tree);
        state.server_session = Some(server_session);
    }

    fn emit(state: &FakeState, event: SettlementEvent) {
        state
            .events
            .as_ref()
            .expect("event stream requested")
            .unbounded_send(Ok(event))
            .expect("stream alive");
    }

    fn pings(&self) -> u32 {
        self.state.lock().unwrap().pings
    }
}

impl ServerClient for FakeServer {
    type EventStream = mpsc::UnboundedReceiver<Result<SettlementEvent, Error>>;

    async fn get_info(&self) -> Result<server::Info, Error> {
        Ok(self.info())
    }

    async fn list_vtxos(&self, _request: GetVtxosRequest) -> Result<ListVtxosResponse, Error> {
        let vtxo = VirtualTxOutPoint {
            outpoint: OutPoint {
                txid: Txid::from_byte_array([0xDD; 32]),
                vout: 0,
            },
            created_at: 1,
            expires_at: 600_000,
            amount: VTXO_AMOUNT,
            script: self.client_vtxo_script().script_pubkey(),
            is_preconfirmed: false,
            is_swept: false,
            is_unrolled: false,
            is_spent: false,
            spent_by: None,
            commitment_txids: vec![Txid::from_byte_array([0xCC; 32])],
            settled_by: None,
            ark_txid: None,
        };

        Ok(ListVtxosResponse {
            vtxos: vec![vtxo],
            page: None,
        })
    }

    async fn submit_tx(&self, _: Psbt, _: Vec<Psbt>) -> Result<SubmitTxResponse, Error> {
        Err(Error::server("not supported by fake"))
    }

    async fn finalize_tx(&self, _: Txid, _: Vec<Psbt>) -> Result<(), Error> {
        Err(Error::server("not supported by fake"))
    }

    async fn register_inputs_for_next_round(
        &self,
        intent: intent::Intent,
    ) -> Result<String, Error> {
        let message: serde_json::Value =
            serde_json::from_str(&intent.serialize_message().unwrap()).unwrap();

        let cosigner_pks = message["cosigners_public_keys"]
            .as_array()
            .unwrap()
            .iter()
            .map(|pk| PublicKey::from_str(pk.as_str().unwrap()).unwrap())
            .collect();

        self.state.lock().unwrap().client_cosigner_pks = cosigner_pks;

        Ok("request-1".to_string())
    }

    async fn register_outputs_for_next_round(
        &self,
        _request_id: String,
        _outputs: Vec<intent::Output>,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn submit_tree_nonces(
        &self,
        _request_id: String,
        _cosigner_pk: PublicKey,
        nonces: String,
    ) -> Result<(), Error> {
        let client_nonces = NoncePks::decode_hex(&nonces).map_err(Error::server)?;

        let mut state = self.state.lock().unwrap();

        let mut rng = StdRng::from_entropy();
        let server_nonces = state
            .server_session
            .as_mut()
            .expect("round built")
            .get_nonces(&mut rng)
            .map_err(Error::server)?;

        let agg_nonces =
            aggregate_nonces(&[client_nonces, server_nonces]).map_err(Error::server)?;

        FakeServer::emit(
            &state,
            SettlementEvent::SigningNoncesGenerated(server::SigningNoncesGeneratedEvent {
                id: "batch-1".to_string(),
                tree_nonces: agg_nonces,
            }),
        );

        Ok(())
    }

    async fn submit_tree_signatures(
        &self,
        _request_id: String,
        _cosigner_pk: PublicKey,
        _signatures: String,
    ) -> Result<(), Error> {
        let state = self.state.lock().unwrap();

        FakeServer::emit(
            &state,
            SettlementEvent::Finalization(server::FinalizationEvent {
                id: "batch-1".to_string(),
                commitment_tx: state.commitment_tx.clone().expect("round built"),
                connectors_tree: state.connectors_tree.clone().expect("round built"),
                min_relay_fee_rate: FeeRate::from_sat_per_vb_unchecked(1),
            }),
        );

        Ok(())
    }

    async fn submit_signed_forfeit_txs(
        &self,
        forfeit_psbts: Vec<Psbt>,
        _commitment_psbt: Option<Psbt>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.forfeits_received = forfeit_psbts.len();

        let commitment_txid = state
            .commitment_tx
            .as_ref()
            .expect("round built")
            .unsigned_tx
            .compute_txid();

        FakeServer::emit(
            &state,
            SettlementEvent::Finalized(server::FinalizedEvent {
                id: "batch-1".to_string(),
                commitment_txid,
            }),
        );

        Ok(())
    }

    async fn ping(&self, _request_id: String) -> Result<(), Error> {
        self.state.lock().unwrap().pings += 1;
        Ok(())
    }

    async fn event_stream(&self) -> Result<Self::EventStream, Error> {
        let (tx, rx) = mpsc::unbounded();

        let mut state = self.state.lock().unwrap();
        state.events = Some(tx);

        FakeServer::emit(
            &state,
            SettlementEvent::BatchStarted(server::BatchStartedEvent {
                id: "batch-1".to_string(),
                intent_id_hashes: vec![],
                batch_expiry: batch_expiry(),
            }),
        );

        match self.script {
            Script::HappyPath => {
                self.build_round(&mut state);

                let signing_start = SettlementEvent::SigningStart(server::SigningStartEvent {
                    id: "batch-1".to_string(),
                    cosigners_pubkeys: {
                        let mut pks = state.client_cosigner_pks.clone();
                        pks.push(self.server_cosigner_kp.public_key());
                        pks
                    },
                    unsigned_commitment_tx: state.commitment_tx.clone().expect("round built"),
                    vtxo_tree: state.tree.clone().expect("round built"),
                });

                FakeServer::emit(&state, signing_start);
            }
            Script::FailEarly => {
                FakeServer::emit(
                    &state,
                    SettlementEvent::Failed(server::FailedEvent {
                        id: "batch-1".to_string(),
                        reason: "boarding_tx_missing".to_string(),
                    }),
                );
            }
            Script::Silent => {}
        }

        Ok(rx)
    }
}

struct FakeExplorer;

impl Explorer for FakeExplorer {
    async fn find_outpoints(&self, _address: &Address) -> Result<Vec<ExplorerUtxo>, Error> {
        Ok(vec![])
    }

    async fn broadcast(&self, _tx: &Transaction) -> Result<Txid, Error> {
        Err(Error::explorer("not supported by fake"))
    }

    async fn get_block_tip(&self) -> Result<ark_wallet::BlockTip, Error> {
        Ok(ark_wallet::BlockTip {
            height: 0,
            hash: BlockHash::all_zeros(),
        })
    }

    async fn is_tx_confirmed(&self, _txid: &Txid) -> Result<bool, Error> {
        Ok(false)
    }

    async fn get_output_status(&self, _txid: &Txid, _vout: u32) -> Result<SpendStatus, Error> {
        Ok(SpendStatus { spend_txid: None })
    }

    async fn get_fee_rate(&self) -> Result<FeeRate, Error> {
        Ok(FeeRate::from_sat_per_vb_unchecked(1))
    }
}

type TestWallet = ark_wallet::Wallet<
    FakeServer,
    FakeExplorer,
    InMemoryWalletRepository,
    InMemoryContractRepository,
    KeypairIdentity,
>;

async fn wallet_with(script: Script) -> (TestWallet, Arc<FakeServer>) {
    let identity = KeypairIdentity::new(keypair(0x01));
    let server = Arc::new(FakeServer::new(script, identity.x_only_public_key()));

    let wallet = OfflineWallet::new(
        "test-wallet".to_string(),
        Arc::new(identity),
        Arc::clone(&server),
        Arc::new(FakeExplorer),
        Arc::new(InMemoryWalletRepository::default()),
        Arc::new(InMemoryContractRepository::default()),
        Duration::from_secs(5),
    )
    .connect()
    .await
    .unwrap();

    (wallet, server)
}

#[tokio::test(flavor = "multi_thread")]
async fn settle_completes_a_full_round() {
    let (wallet, server) = wallet_with(Script::HappyPath).await;

    let mut rng = StdRng::seed_from_u64(1);
    let commitment_txid = wallet.settle(&mut rng).await.unwrap();

    let expected = server
        .state
        .lock()
        .unwrap()
        .commitment_tx
        .as_ref()
        .unwrap()
        .unsigned_tx
        .compute_txid();

    assert_eq!(commitment_txid, Some(expected));

    // One forfeit transaction was signed for our single VTXO input.
    assert_eq!(server.state.lock().unwrap().forfeits_received, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_event_aborts_the_round() {
    let (wallet, _server) = wallet_with(Script::FailEarly).await;

    let mut rng = StdRng::seed_from_u64(2);
    let err = wallet.settle(&mut rng).await.unwrap_err();

    assert!(err.is_settlement_aborted());
    assert!(err.to_string().contains("boarding_tx_missing"));
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_stops_the_round_and_the_heartbeat() {
    let (wallet, server) = wallet_with(Script::Silent).await;

    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);

    let wallet = Arc::new(wallet);
    let task = {
        let wallet = Arc::clone(&wallet);
        tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(3);
            wallet.settle_with_cancel(&mut rng, cancel_rx).await
        })
    };

    // Let the round register and the heartbeat tick a few times.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let pings_before_cancel = server.pings();
    assert!(pings_before_cancel >= 2, "heartbeat should be ticking");

    cancel_tx.send(true).unwrap();

    let result = task.await.unwrap();
    assert!(result.unwrap_err().is_cancelled());

    // No more pings once the session is gone.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(server.pings() <= pings_before_cancel + 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn balances_and_addresses() {
    let (wallet, _server) = wallet_with(Script::Silent).await;

    let balance = wallet.offchain_balance().await.unwrap();
    assert_eq!(balance.confirmed(), VTXO_AMOUNT);
    assert_eq!(balance.total(), VTXO_AMOUNT);

    let (ark_address, vtxo_script) = wallet.get_offchain_address().unwrap();
    assert!(ark_address.encode().starts_with("tark1"));
    assert_eq!(
        ark_address.to_p2tr_script_pubkey(),
        vtxo_script.script_pubkey()
    );
}
