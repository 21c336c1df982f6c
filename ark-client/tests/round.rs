//! Round participation scenarios against a scripted in-process Ark server.

use ark_client::ArkServer;
use ark_client::Blockchain;
use ark_client::Client;
use ark_client::Error;
use ark_client::OfflineClient;
use ark_client::StaticIdentity;
use ark_core::round::OnChainInput;
use ark_core::round::RoundInput;
use ark_core::round::VtxoInput;
use ark_core::script::sweep_tap_tree_root;
use ark_core::server;
use ark_core::server::BatchStartedEvent;
use ark_core::server::BatchTreeEvent;
use ark_core::server::BatchTreeEventType;
use ark_core::server::NoncePks;
use ark_core::server::PartialSigTree;
use ark_core::server::RoundFailedEvent;
use ark_core::server::RoundFinalizationEvent;
use ark_core::server::RoundFinalizedEvent;
use ark_core::server::RoundOutput;
use ark_core::server::RoundSigningEvent;
use ark_core::server::RoundSigningNoncesGeneratedEvent;
use ark_core::server::RoundStreamEvent;
use ark_core::server::VtxoOutPoint;
use ark_core::tree::shared_output_script;
use ark_core::tree::TxTree;
use ark_core::tree::TxTreeNode;
use ark_core::ArkAddress;
use ark_core::BoardingOutput;
use ark_core::ExplorerUtxo;
use ark_core::Vtxo;
use bitcoin::absolute;
use bitcoin::hashes::Hash;
use bitcoin::key::Keypair;
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::PublicKey;
use bitcoin::secp256k1::SecretKey;
use bitcoin::transaction;
use bitcoin::Address;
use bitcoin::Amount;
use bitcoin::Network;
use bitcoin::OutPoint;
use bitcoin::Psbt;
use bitcoin::ScriptBuf;
use bitcoin::Transaction;
use bitcoin::TxIn;
use bitcoin::TxOut;
use bitcoin::Txid;
use futures::channel::mpsc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

const DUST: Amount = Amount::from_sat(330);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Play the full happy-path event sequence.
    Happy,
    /// Like `Happy`, but sprinkle duplicated and out-of-order events into the stream.
    Noisy,
    /// Fail the round right after the signing phase starts.
    FailAfterSigning,
    /// Register successfully, then never emit any event.
    Silent,
}

#[derive(Default)]
struct MockState {
    pings: usize,
    nonce_submissions: usize,
    signature_submissions: usize,
    forfeits: Vec<Psbt>,
    round_psbt: Option<Psbt>,
    registered_inputs: Vec<RoundInput>,
    registered_outputs: Vec<RoundOutput>,
    cosigner_pks: Vec<PublicKey>,
    round_psbt_template: Option<Psbt>,
}

struct MockArkServer {
    info: server::Info,
    mode: Mode,
    server_kp: Keypair,
    state: Mutex<MockState>,
    events_tx: mpsc::UnboundedSender<Result<RoundStreamEvent, Error>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<Result<RoundStreamEvent, Error>>>>,
}

impl MockArkServer {
    fn new(mode: Mode) -> Self {
        let secp = Secp256k1::new();

        let server_sk = SecretKey::from_slice(&[0x55; 32]).unwrap();
        let server_kp = Keypair::from_secret_key(&secp, &server_sk);

        let (server_xonly, _) = server_kp.x_only_public_key();

        let forfeit_address = Address::p2tr(&secp, server_xonly, None, Network::Regtest);

        let info = server::Info {
            version: "mock".to_string(),
            signer_pk: server_kp.public_key(),
            network: Network::Regtest,
            dust: DUST,
            vtxo_tree_expiry: bitcoin::Sequence::from_height(144),
            unilateral_exit_delay: bitcoin::Sequence::from_seconds_ceil(1024).unwrap(),
            boarding_exit_delay: bitcoin::Sequence::from_height(144),
            round_interval: 30,
            forfeit_address,
            utxo_min_amount: None,
            utxo_max_amount: None,
            vtxo_min_amount: None,
            vtxo_max_amount: None,
        };

        let (events_tx, events_rx) = mpsc::unbounded();

        Self {
            info,
            mode,
            server_kp,
            state: Mutex::new(MockState::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    fn forfeit_script(&self) -> ScriptBuf {
        self.info.forfeit_address.script_pubkey()
    }

    fn send(&self, event: RoundStreamEvent) {
        self.events_tx
            .unbounded_send(Ok(event))
            .expect("event stream is open");
    }

    fn pings(&self) -> usize {
        self.state.lock().unwrap().pings
    }

    fn nonce_submissions(&self) -> usize {
        self.state.lock().unwrap().nonce_submissions
    }

    fn signature_submissions(&self) -> usize {
        self.state.lock().unwrap().signature_submissions
    }

    fn forfeits(&self) -> Vec<Psbt> {
        self.state.lock().unwrap().forfeits.clone()
    }

    fn submitted_round_psbt(&self) -> Option<Psbt> {
        self.state.lock().unwrap().round_psbt.clone()
    }

    /// Build the round transaction and VTXO tree for the registered inputs and outputs, and
    /// play the opening events of the round.
    fn start_round(&self) {
        let (server_xonly, _) = self.server_kp.x_only_public_key();

        let mut state = self.state.lock().unwrap();

        let sweep_root = sweep_tap_tree_root(self.info.vtxo_tree_expiry, server_xonly);
        let internal_script =
            shared_output_script(&state.cosigner_pks, sweep_root).expect("aggregate script");

        let offchain_outputs = state
            .registered_outputs
            .iter()
            .filter(|output| matches!(output, RoundOutput::Offchain { .. }))
            .collect::<Vec<_>>();

        let shared_amount = offchain_outputs
            .iter()
            .fold(Amount::ZERO, |acc, output| acc + output.amount());

        let n_vtxos = state
            .registered_inputs
            .iter()
            .filter(|input| matches!(input, RoundInput::Vtxo(_)))
            .count() as u64;

        // The round transaction spends a server-funded input plus every registered boarding
        // output, and pays the shared output and the connectors root.
        let mut round_tx_inputs = vec![TxIn {
            previous_output: OutPoint {
                txid: Txid::from_byte_array([0x01; 32]),
                vout: 0,
            },
            ..Default::default()
        }];
        let mut round_tx_prevouts = vec![TxOut {
            value: Amount::ONE_BTC,
            script_pubkey: self.forfeit_script(),
        }];

        for input in state.registered_inputs.iter() {
            if let RoundInput::OnChain(onchain_input) = input {
                round_tx_inputs.push(TxIn {
                    previous_output: onchain_input.outpoint(),
                    ..Default::default()
                });
                round_tx_prevouts.push(TxOut {
                    value: onchain_input.amount(),
                    script_pubkey: onchain_input.boarding_output().script_pubkey(),
                });
            }
        }

        let round_tx = Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: round_tx_inputs,
            output: vec![
                TxOut {
                    value: shared_amount,
                    script_pubkey: internal_script.clone(),
                },
                TxOut {
                    value: DUST * n_vtxos,
                    script_pubkey: self.forfeit_script(),
                },
            ],
        };

        let mut round_psbt = Psbt::from_unsigned_tx(round_tx).unwrap();
        for (input, prevout) in round_psbt.inputs.iter_mut().zip(round_tx_prevouts) {
            input.witness_utxo = Some(prevout);
        }

        let round_txid = round_psbt.unsigned_tx.compute_txid();

        // A two-level VTXO tree: one shared internal transaction, one leaf per off-chain
        // output.
        let root_tx = Transaction {
            version: transaction::Version::non_standard(3),
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: round_txid,
                    vout: 0,
                },
                ..Default::default()
            }],
            output: vec![TxOut {
                value: shared_amount,
                script_pubkey: internal_script.clone(),
            }],
        };
        let root_txid = root_tx.compute_txid();

        let mut tree = TxTree::new();
        tree.insert(TxTreeNode {
            txid: root_txid,
            tx: Psbt::from_unsigned_tx(root_tx).unwrap(),
            parent_txid: round_txid,
            level: 0,
            level_index: 0,
            leaf: false,
        });

        // A single leaf spending the whole internal output keeps amounts conserved for any
        // number of registered outputs in these scenarios.
        assert_eq!(
            offchain_outputs.len(),
            1,
            "mock round supports a single off-chain output"
        );

        let leaf_tx = Transaction {
            version: transaction::Version::non_standard(3),
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: root_txid,
                    vout: 0,
                },
                ..Default::default()
            }],
            output: vec![TxOut {
                value: offchain_outputs[0].amount(),
                script_pubkey: offchain_outputs[0].script_pubkey(),
            }],
        };

        tree.insert(TxTreeNode {
            txid: leaf_tx.compute_txid(),
            tx: Psbt::from_unsigned_tx(leaf_tx).unwrap(),
            parent_txid: root_txid,
            level: 1,
            level_index: 0,
            leaf: true,
        });

        let cosigners_pubkeys = state.cosigner_pks.clone();

        state.round_psbt_template = Some(round_psbt.clone());

        drop(state);

        self.send(RoundStreamEvent::BatchStarted(BatchStartedEvent {
            id: "round-1".to_string(),
        }));

        if self.mode == Mode::Noisy {
            // An early finalized event must be dropped by the client.
            self.send(RoundStreamEvent::RoundFinalized(RoundFinalizedEvent {
                id: "round-1".to_string(),
                round_txid: Txid::from_byte_array([0xee; 32]),
            }));
        }

        for node in tree.nodes() {
            self.send(RoundStreamEvent::BatchTree(BatchTreeEvent {
                id: "round-1".to_string(),
                batch_tree_event_type: BatchTreeEventType::Vtxo,
                node: node.clone(),
            }));
        }

        let signing_event = RoundSigningEvent {
            id: "round-1".to_string(),
            cosigners_pubkeys,
            unsigned_vtxo_tree: None,
            unsigned_round_tx: round_psbt,
        };

        self.send(RoundStreamEvent::RoundSigning(signing_event.clone()));

        if self.mode == Mode::Noisy {
            // A duplicated signing event must be ignored.
            self.send(RoundStreamEvent::RoundSigning(signing_event));
        }
    }

    fn finish_signing(&self, nonces: NoncePks) {
        if self.mode == Mode::FailAfterSigning {
            self.send(RoundStreamEvent::RoundFailed(RoundFailedEvent {
                id: "round-1".to_string(),
                reason: "timeout".to_string(),
            }));

            return;
        }

        let agg_nonce_pks =
            ark_core::round::aggregate_nonce_matrices(&[nonces]).expect("aggregated nonces");

        self.send(RoundStreamEvent::RoundSigningNoncesGenerated(
            RoundSigningNoncesGeneratedEvent {
                id: "round-1".to_string(),
                tree_nonces: agg_nonce_pks,
            },
        ));
    }

    fn start_finalization(&self) {
        let state = self.state.lock().unwrap();

        let round_psbt = state
            .round_psbt_template
            .clone()
            .expect("round transaction was built");
        let round_txid = round_psbt.unsigned_tx.compute_txid();

        let vtxo_outpoints = state
            .registered_inputs
            .iter()
            .filter_map(|input| match input {
                RoundInput::Vtxo(vtxo_input) => Some(vtxo_input.outpoint()),
                _ => None,
            })
            .collect::<Vec<_>>();

        drop(state);

        let connector_amount = DUST * vtxo_outpoints.len() as u64;

        let connector_tx = Transaction {
            version: transaction::Version::non_standard(3),
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: round_txid,
                    vout: 1,
                },
                ..Default::default()
            }],
            output: vtxo_outpoints
                .iter()
                .map(|_| TxOut {
                    value: DUST,
                    script_pubkey: self.forfeit_script(),
                })
                .collect(),
        };
        let connector_txid = connector_tx.compute_txid();

        assert_eq!(
            connector_tx
                .output
                .iter()
                .fold(Amount::ZERO, |acc, o| acc + o.value),
            connector_amount
        );

        let node = TxTreeNode {
            txid: connector_txid,
            tx: Psbt::from_unsigned_tx(connector_tx).unwrap(),
            parent_txid: round_txid,
            level: 0,
            level_index: 0,
            leaf: true,
        };

        let mut connectors_index = HashMap::new();
        for (vout, vtxo_outpoint) in vtxo_outpoints.iter().enumerate() {
            connectors_index.insert(
                *vtxo_outpoint,
                OutPoint {
                    txid: connector_txid,
                    vout: vout as u32,
                },
            );
        }

        if !vtxo_outpoints.is_empty() {
            self.send(RoundStreamEvent::BatchTree(BatchTreeEvent {
                id: "round-1".to_string(),
                batch_tree_event_type: BatchTreeEventType::Connector,
                node,
            }));
        }

        self.send(RoundStreamEvent::RoundFinalization(RoundFinalizationEvent {
            id: "round-1".to_string(),
            round_tx: round_psbt,
            connector_tree: TxTree::new(),
            connectors_index,
            min_relay_fee_rate: 1000,
        }));
    }

    fn finish_round(&self) {
        self.send(RoundStreamEvent::RoundFinalized(RoundFinalizedEvent {
            id: "round-1".to_string(),
            round_txid: Txid::from_byte_array([0xaa; 32]),
        }));
    }
}

impl ArkServer for MockArkServer {
    type EventStream = mpsc::UnboundedReceiver<Result<RoundStreamEvent, Error>>;

    async fn get_info(&self) -> Result<server::Info, Error> {
        Ok(self.info.clone())
    }

    async fn register_inputs_for_next_round(
        &self,
        inputs: &[RoundInput],
    ) -> Result<String, Error> {
        let mut state = self.state.lock().unwrap();
        state.registered_inputs = inputs.to_vec();

        Ok("request-1".to_string())
    }

    async fn register_outputs_for_next_round(
        &self,
        _request_id: &str,
        outputs: &[RoundOutput],
        cosigner_pks: &[PublicKey],
        _sign_all: bool,
    ) -> Result<(), Error> {
        {
            let mut state = self.state.lock().unwrap();
            state.registered_outputs = outputs.to_vec();
            state.cosigner_pks = cosigner_pks.to_vec();
        }

        if self.mode != Mode::Silent {
            self.start_round();
        }

        Ok(())
    }

    async fn ping(&self, _request_id: &str) -> Result<(), Error> {
        self.state.lock().unwrap().pings += 1;

        Ok(())
    }

    async fn submit_tree_nonces(
        &self,
        _round_id: &str,
        _cosigner_pk: PublicKey,
        nonces: NoncePks,
    ) -> Result<(), Error> {
        self.state.lock().unwrap().nonce_submissions += 1;

        self.finish_signing(nonces);

        Ok(())
    }

    async fn submit_tree_signatures(
        &self,
        _round_id: &str,
        _cosigner_pk: PublicKey,
        _signatures: PartialSigTree,
    ) -> Result<(), Error> {
        self.state.lock().unwrap().signature_submissions += 1;

        self.start_finalization();

        Ok(())
    }

    async fn submit_signed_forfeit_txs(
        &self,
        forfeit_txs: Vec<Psbt>,
        round_psbt: Option<Psbt>,
    ) -> Result<(), Error> {
        {
            let mut state = self.state.lock().unwrap();
            state.forfeits = forfeit_txs;
            state.round_psbt = round_psbt;
        }

        self.finish_round();

        Ok(())
    }

    async fn submit_virtual_tx(&self, psbt: Psbt) -> Result<Txid, Error> {
        Ok(psbt.unsigned_tx.compute_txid())
    }

    async fn list_vtxos(&self, _address: &ArkAddress) -> Result<Vec<VtxoOutPoint>, Error> {
        Ok(Vec::new())
    }

    async fn get_event_stream(&self) -> Result<Self::EventStream, Error> {
        self.events_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::ark_server("event stream already consumed"))
    }
}

struct MockBlockchain;

impl Blockchain for MockBlockchain {
    async fn find_outpoints(&self, _address: &Address) -> Result<Vec<ExplorerUtxo>, Error> {
        Ok(Vec::new())
    }

    async fn broadcast(&self, _tx: &Transaction) -> Result<(), Error> {
        Ok(())
    }
}

async fn connected_client(
    mode: Mode,
) -> (
    Client<MockBlockchain, MockArkServer, StaticIdentity>,
    Arc<MockArkServer>,
) {
    let secp = Secp256k1::new();

    let owner_sk = SecretKey::from_slice(&[0x42; 32]).unwrap();
    let identity = StaticIdentity::new(Keypair::from_secret_key(&secp, &owner_sk));

    let ark_server = Arc::new(MockArkServer::new(mode));

    let client = OfflineClient::new(
        "test-client".to_string(),
        Arc::new(MockBlockchain),
        ark_server.clone(),
        identity,
    )
    .connect()
    .await
    .unwrap();

    (client, ark_server)
}

fn vtxo_round_input(client: &Client<MockBlockchain, MockArkServer, StaticIdentity>, amount: Amount, outpoint_byte: u8) -> (RoundInput, Vtxo) {
    let vtxo = client.default_vtxo().unwrap();

    let outpoint = OutPoint {
        txid: Txid::from_byte_array([outpoint_byte; 32]),
        vout: 0,
    };

    (
        RoundInput::Vtxo(VtxoInput::new(vtxo.clone(), amount, outpoint)),
        vtxo,
    )
}

fn boarding_round_input(
    client: &Client<MockBlockchain, MockArkServer, StaticIdentity>,
    amount: Amount,
    outpoint_byte: u8,
) -> (RoundInput, BoardingOutput, OutPoint) {
    let boarding_output = client
        .get_boarding_output(absolute::LockTime::from_height(10_144).unwrap())
        .unwrap();

    let outpoint = OutPoint {
        txid: Txid::from_byte_array([outpoint_byte; 32]),
        vout: 1,
    };

    (
        RoundInput::OnChain(OnChainInput::new(boarding_output.clone(), amount, outpoint)),
        boarding_output,
        outpoint,
    )
}

fn self_output(
    client: &Client<MockBlockchain, MockArkServer, StaticIdentity>,
    amount: Amount,
) -> RoundOutput {
    let (address, _) = client.get_offchain_address().unwrap();

    RoundOutput::Offchain { address, amount }
}

#[tokio::test]
async fn single_vtxo_roundtrip() {
    init_tracing();

    let mut rng = StdRng::seed_from_u64(1);

    let (client, mock) = connected_client(Mode::Happy).await;

    let (input, _) = vtxo_round_input(&client, Amount::from_sat(1_000), 0xb0);
    let output = self_output(&client, Amount::from_sat(1_000));

    let round_txid = client.settle(&mut rng, vec![input], vec![output]).await.unwrap();

    assert_eq!(round_txid, Txid::from_byte_array([0xaa; 32]));

    // Exactly one forfeit was submitted; no round transaction, since there were no boarding
    // inputs.
    let forfeits = mock.forfeits();
    assert_eq!(forfeits.len(), 1);
    assert_eq!(mock.signature_submissions(), 1);
    assert!(mock.submitted_round_psbt().is_none());

    let forfeit_tx = &forfeits[0].unsigned_tx;

    // The forfeit pays the server the VTXO plus the connector, minus the fee.
    let fee = ark_core::round::estimate_forfeit_tx_fee(
        bitcoin::FeeRate::from_sat_per_vb(1).unwrap(),
    )
    .unwrap();
    assert_eq!(
        forfeit_tx.output[0].value,
        Amount::from_sat(1_000) + DUST - fee
    );
    assert_eq!(
        forfeit_tx.output[0].script_pubkey,
        mock.info.forfeit_address.script_pubkey()
    );
    assert_eq!(forfeit_tx.output[1], ark_core::anchor_output());

    // The VTXO input is signed, the connector input is the server's to sign.
    assert_eq!(forfeits[0].inputs[1].tap_script_sigs.len(), 1);
    assert!(forfeits[0].inputs[0].tap_script_sigs.is_empty());
}

#[tokio::test]
async fn boarding_and_vtxo_settle() {
    init_tracing();

    let mut rng = StdRng::seed_from_u64(2);

    let (client, mock) = connected_client(Mode::Happy).await;

    let (boarding_input, _, boarding_outpoint) =
        boarding_round_input(&client, Amount::from_sat(100_000), 0xc0);
    let (vtxo_input, _) = vtxo_round_input(&client, Amount::from_sat(5_000), 0xb1);
    let output = self_output(&client, Amount::from_sat(105_000));

    let round_txid = client
        .settle(&mut rng, vec![boarding_input, vtxo_input], vec![output])
        .await
        .unwrap();

    assert_eq!(round_txid, Txid::from_byte_array([0xaa; 32]));

    // One forfeit for the VTXO input, and a co-signed round transaction for the boarding
    // input.
    assert_eq!(mock.forfeits().len(), 1);

    let round_psbt = mock.submitted_round_psbt().expect("signed round PSBT");

    let boarding_input_index = round_psbt
        .unsigned_tx
        .input
        .iter()
        .position(|input| input.previous_output == boarding_outpoint)
        .expect("boarding input in round transaction");

    assert_eq!(
        round_psbt.inputs[boarding_input_index].tap_script_sigs.len(),
        1
    );
}

#[tokio::test]
async fn round_failure_aborts_settlement() {
    init_tracing();

    let mut rng = StdRng::seed_from_u64(3);

    let (client, mock) = connected_client(Mode::FailAfterSigning).await;

    let (input, _) = vtxo_round_input(&client, Amount::from_sat(1_000), 0xb2);
    let output = self_output(&client, Amount::from_sat(1_000));

    let error = client
        .settle(&mut rng, vec![input], vec![output])
        .await
        .unwrap_err();

    assert_eq!(error.round_failure_reason(), Some("timeout"));

    // Nothing was forfeited and the keep-alive loop died with the settlement.
    assert!(mock.forfeits().is_empty());

    let pings_after_failure = mock.pings();
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert_eq!(mock.pings(), pings_after_failure);
}

#[tokio::test]
async fn out_of_order_and_duplicate_events_are_ignored() {
    init_tracing();

    let mut rng = StdRng::seed_from_u64(4);

    let (client, mock) = connected_client(Mode::Noisy).await;

    let (input, _) = vtxo_round_input(&client, Amount::from_sat(1_000), 0xb3);
    let output = self_output(&client, Amount::from_sat(1_000));

    let round_txid = client.settle(&mut rng, vec![input], vec![output]).await.unwrap();

    // The early finalized event carried a different txid; the duplicate signing event did not
    // produce a second nonce submission.
    assert_eq!(round_txid, Txid::from_byte_array([0xaa; 32]));
    assert_eq!(mock.nonce_submissions(), 1);
}

#[tokio::test]
async fn dropping_the_settle_future_stops_the_ping_loop() {
    init_tracing();

    let mut rng = StdRng::seed_from_u64(5);

    let (client, mock) = connected_client(Mode::Silent).await;

    let (input, _) = vtxo_round_input(&client, Amount::from_sat(1_000), 0xb4);
    let output = self_output(&client, Amount::from_sat(1_000));

    let result = tokio::time::timeout(
        Duration::from_millis(350),
        client.settle(&mut rng, vec![input], vec![output]),
    )
    .await;

    // The mock never advances the round, so the settlement is cancelled by dropping it.
    assert!(result.is_err());

    let pings_at_cancellation = mock.pings();
    assert!(pings_at_cancellation >= 1);

    tokio::time::sleep(Duration::from_millis(1_300)).await;
    assert_eq!(mock.pings(), pings_at_cancellation);
}
