//! The round participation engine: registering inputs and outputs, keeping the registration
//! alive, and driving the tree signing and forfeit flow from the server's event stream.

use crate::ArkServer;
use crate::Blockchain;
use crate::Client;
use crate::Error;
use crate::ErrorContext;
use crate::Identity;
use ark_core::round::create_and_sign_forfeit_txs;
use ark_core::round::sign_round_psbt;
use ark_core::round::RoundInput;
use ark_core::round::TreeSigningSession;
use ark_core::round::VtxoInput;
use ark_core::script::sweep_tap_tree_root;
use ark_core::server::BatchTreeEventType;
use ark_core::server::RoundOutput;
use ark_core::server::RoundStreamEvent;
use ark_core::tree::validate_connectors_tree;
use ark_core::tree::validate_vtxo_tree;
use ark_core::tree::TxTree;
use ark_core::ErrorContext as _;
use ark_core::Vtxo;
use bitcoin::secp256k1;
use bitcoin::secp256k1::schnorr;
use bitcoin::Amount;
use bitcoin::FeeRate;
use bitcoin::Psbt;
use bitcoin::Txid;
use bitcoin::XOnlyPublicKey;
use futures::StreamExt;
use rand::CryptoRng;
use rand::Rng;
use std::time::Duration;

/// How often a pending registration is kept alive before the round starts.
const PING_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Registering,
    NoncesSubmitted,
    SignaturesSubmitted,
    ForfeitsSubmitted,
}

impl<B, A, I> Client<B, A, I>
where
    B: Blockchain,
    A: ArkServer,
    I: Identity,
{
    /// Settle the given inputs into the next round, producing the requested outputs.
    ///
    /// This drives a whole round against the Ark server: the registered inputs are spent by
    /// the round transaction, VTXO inputs are forfeited in exchange for their connectors, and
    /// off-chain outputs become new confirmed VTXOs under the co-signed VTXO tree.
    ///
    /// The returned future is cancel-safe in the plain Rust sense: dropping it stops the
    /// keep-alive timer and aborts any in-flight request, and the signing session secrets die
    /// with it.
    pub async fn settle<R>(
        &self,
        rng: &mut R,
        inputs: Vec<RoundInput>,
        outputs: Vec<RoundOutput>,
    ) -> Result<Txid, Error>
    where
        R: Rng + CryptoRng,
    {
        if inputs.is_empty() {
            return Err(Error::ad_hoc("cannot join a round without inputs"));
        }

        let dust = self.server_info.dust;
        for output in outputs.iter() {
            if output.amount() == Amount::ZERO {
                return Err(ark_core::Error::amount_non_positive().into());
            }

            if matches!(output, RoundOutput::Offchain { .. }) && output.amount() < dust {
                return Err(ark_core::Error::amount_below_dust(output.amount(), dust).into());
            }
        }

        let own_cosigner_kp = self.identity().signer_session(rng)?;
        let own_cosigner_pk = own_cosigner_kp.public_key();

        let vtxo_inputs = inputs
            .iter()
            .filter_map(|input| match input {
                RoundInput::Vtxo(vtxo_input) => Some(vtxo_input.clone()),
                _ => None,
            })
            .collect::<Vec<_>>();
        let onchain_inputs = inputs
            .iter()
            .filter_map(|input| match input {
                RoundInput::OnChain(onchain_input) => Some(onchain_input.clone()),
                _ => None,
            })
            .collect::<Vec<_>>();

        let request_id = self
            .ark_server()
            .register_inputs_for_next_round(&inputs)
            .await
            .context("failed to register round inputs")?;

        self.ark_server()
            .register_outputs_for_next_round(&request_id, &outputs, &[own_cosigner_pk], false)
            .await
            .context("failed to register round outputs")?;

        tracing::info!(request_id, "Registered for next round");

        let registered_output_scripts = outputs
            .iter()
            .map(|output| output.script_pubkey())
            .collect::<Vec<_>>();

        let (server_pk, _) = self.server_info.signer_pk.x_only_public_key();
        let sweep_root = sweep_tap_tree_root(self.server_info.vtxo_tree_expiry, server_pk);

        let mut stream = self
            .ark_server()
            .get_event_stream()
            .await
            .context("failed to open round event stream")?;

        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The registration is kept alive until the first state-advancing event.
        let mut ping_active = true;

        let mut step = Step::Registering;

        let mut vtxo_tree = TxTree::new();
        let mut connector_tree_chunks = TxTree::new();
        let mut signing_session: Option<TreeSigningSession> = None;

        loop {
            tokio::select! {
                _ = ping_interval.tick(), if ping_active => {
                    self.ark_server()
                        .ping(&request_id)
                        .await
                        .context("failed to keep round registration alive")?;
                }
                event = stream.next() => {
                    let event = match event {
                        Some(Ok(event)) => event,
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "Round event stream error, reconnecting");

                            stream = self
                                .ark_server()
                                .get_event_stream()
                                .await
                                .context("failed to reconnect round event stream")?;

                            continue;
                        }
                        None => {
                            tracing::warn!("Round event stream ended, reconnecting");

                            stream = self
                                .ark_server()
                                .get_event_stream()
                                .await
                                .context("failed to reconnect round event stream")?;

                            continue;
                        }
                    };

                    match event {
                        RoundStreamEvent::BatchStarted(e) => {
                            tracing::debug!(round_id = e.id, "Batch started");
                        }
                        RoundStreamEvent::BatchTree(e) => match e.batch_tree_event_type {
                            BatchTreeEventType::Vtxo if step == Step::Registering => {
                                tracing::debug!(
                                    round_id = e.id,
                                    level = e.node.level,
                                    index = e.node.level_index,
                                    "Got new VTXO tree node"
                                );

                                vtxo_tree.insert(e.node);
                            }
                            BatchTreeEventType::Connector if step == Step::SignaturesSubmitted => {
                                tracing::debug!(
                                    round_id = e.id,
                                    level = e.node.level,
                                    index = e.node.level_index,
                                    "Got new connector tree node"
                                );

                                connector_tree_chunks.insert(e.node);
                            }
                            _ => {
                                tracing::warn!(
                                    round_id = e.id,
                                    step = ?step,
                                    "Dropping unexpected batch tree event"
                                );
                            }
                        },
                        RoundStreamEvent::RoundSigning(e) => {
                            if step != Step::Registering {
                                tracing::warn!(
                                    round_id = e.id,
                                    step = ?step,
                                    "Dropping out-of-order round signing event"
                                );
                                continue;
                            }

                            // The registration made it into a round; no need to keep it
                            // alive any longer.
                            ping_active = false;

                            tracing::info!(round_id = e.id, "Round signing started");

                            if let Some(tree) = e.unsigned_vtxo_tree {
                                vtxo_tree = tree;
                            }

                            validate_vtxo_tree(
                                &e.unsigned_round_tx,
                                &vtxo_tree,
                                sweep_root,
                                &e.cosigners_pubkeys,
                                &registered_output_scripts,
                            )
                            .context("invalid VTXO tree")?;

                            let mut session = TreeSigningSession::new(
                                rng,
                                own_cosigner_kp,
                                &e.cosigners_pubkeys,
                                &vtxo_tree,
                                sweep_root,
                                &e.unsigned_round_tx,
                            )
                            .context("failed to build tree signing session")?;

                            let nonces = session.pub_nonces()?;

                            self.ark_server()
                                .submit_tree_nonces(&e.id, own_cosigner_pk, nonces)
                                .await
                                .context("failed to submit tree nonces")?;

                            signing_session = Some(session);

                            step = Step::NoncesSubmitted;
                        }
                        RoundStreamEvent::RoundSigningNoncesGenerated(e) => {
                            if step != Step::NoncesSubmitted {
                                tracing::warn!(
                                    round_id = e.id,
                                    step = ?step,
                                    "Dropping out-of-order nonces event"
                                );
                                continue;
                            }

                            let session = signing_session
                                .as_mut()
                                .ok_or_else(|| Error::ad_hoc("missing signing session"))?;

                            session.set_aggregated_nonces(e.tree_nonces)?;

                            let partial_sig_tree = session.sign()?;

                            self.ark_server()
                                .submit_tree_signatures(&e.id, own_cosigner_pk, partial_sig_tree)
                                .await
                                .context("failed to submit tree signatures")?;

                            step = Step::SignaturesSubmitted;
                        }
                        RoundStreamEvent::BatchTreeSignature(e) => {
                            if step != Step::SignaturesSubmitted {
                                tracing::warn!(
                                    round_id = e.id,
                                    step = ?step,
                                    "Dropping out-of-order tree signature event"
                                );
                                continue;
                            }

                            match e.batch_tree_event_type {
                                BatchTreeEventType::Vtxo => {
                                    let node =
                                        vtxo_tree.get_mut(e.level, e.level_index)?;

                                    node.tx.inputs[ark_core::VTXO_INPUT_INDEX].tap_key_sig =
                                        Some(e.signature);
                                }
                                BatchTreeEventType::Connector => {
                                    return Err(Error::ark_server(
                                        "received batch tree signature for connectors tree",
                                    ));
                                }
                            }
                        }
                        RoundStreamEvent::RoundFinalization(e) => {
                            if step != Step::SignaturesSubmitted {
                                tracing::warn!(
                                    round_id = e.id,
                                    step = ?step,
                                    "Dropping out-of-order finalization event"
                                );
                                continue;
                            }

                            tracing::debug!(round_id = e.id, "Round finalization started");

                            let connector_tree = if e.connector_tree.is_empty() {
                                connector_tree_chunks.clone()
                            } else {
                                e.connector_tree
                            };

                            let signed_forfeit_psbts = if !vtxo_inputs.is_empty() {
                                validate_connectors_tree(
                                    &e.round_tx,
                                    &connector_tree,
                                    &self.server_info.forfeit_address.script_pubkey(),
                                )
                                .context("invalid connectors tree")?;

                                self.create_forfeit_txs(
                                    &vtxo_inputs,
                                    &connector_tree,
                                    &e.connectors_index,
                                    e.min_relay_fee_rate,
                                )?
                            } else {
                                Vec::new()
                            };

                            let round_psbt = if onchain_inputs.is_empty() {
                                None
                            } else {
                                let mut round_psbt = e.round_tx;

                                let sign_for_pk_fn = |_: &XOnlyPublicKey,
                                                      msg: &secp256k1::Message|
                                 -> Result<schnorr::Signature, ark_core::Error> {
                                    self.identity()
                                        .sign(msg)
                                        .map_err(|e| ark_core::Error::ad_hoc(e.to_string()))
                                };

                                sign_round_psbt(sign_for_pk_fn, &mut round_psbt, &onchain_inputs)?;

                                Some(round_psbt)
                            };

                            self.ark_server()
                                .submit_signed_forfeit_txs(signed_forfeit_psbts, round_psbt)
                                .await
                                .context("failed to submit signed forfeit TXs")?;

                            step = Step::ForfeitsSubmitted;
                        }
                        RoundStreamEvent::RoundFinalized(e) => {
                            if step != Step::ForfeitsSubmitted {
                                tracing::warn!(
                                    round_id = e.id,
                                    step = ?step,
                                    "Dropping out-of-order finalized event"
                                );
                                continue;
                            }

                            tracing::info!(
                                round_id = e.id,
                                round_txid = %e.round_txid,
                                "Round finalized"
                            );

                            return Ok(e.round_txid);
                        }
                        RoundStreamEvent::RoundFailed(e) => {
                            tracing::error!(
                                round_id = e.id,
                                reason = e.reason,
                                "Round failed"
                            );

                            return Err(ark_core::Error::round_failed(e.reason).into());
                        }
                    }
                }
            }
        }
    }

    fn create_forfeit_txs(
        &self,
        vtxo_inputs: &[VtxoInput],
        connector_tree: &TxTree,
        connectors_index: &std::collections::HashMap<bitcoin::OutPoint, bitcoin::OutPoint>,
        min_relay_fee_rate: u64,
    ) -> Result<Vec<Psbt>, Error> {
        // The server quotes the minimum relay fee rate in sats/kvb.
        let fee_rate = FeeRate::from_sat_per_vb(min_relay_fee_rate / 1000)
            .unwrap_or(FeeRate::BROADCAST_MIN)
            .max(FeeRate::BROADCAST_MIN);

        let sign_fn = |msg: &secp256k1::Message,
                       _: &Vtxo|
         -> Result<(schnorr::Signature, XOnlyPublicKey), ark_core::Error> {
            let sig = self
                .identity()
                .sign(msg)
                .map_err(|e| ark_core::Error::ad_hoc(e.to_string()))?;

            Ok((sig, self.identity().x_only_public_key()))
        };

        let signed_forfeit_psbts = create_and_sign_forfeit_txs(
            sign_fn,
            vtxo_inputs,
            connector_tree,
            connectors_index,
            &self.server_info.forfeit_address,
            fee_rate,
        )?;

        Ok(signed_forfeit_psbts)
    }
}

