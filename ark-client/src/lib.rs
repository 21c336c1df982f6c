//! A self-custodial client for the Ark protocol.
//!
//! The client drives round participation against three pluggable collaborators: an
//! [`ArkServer`] (the round coordinator's RPC surface), a [`Blockchain`] (chain indexer and
//! broadcaster) and an [`Identity`] (the key holder).

use ark_core::round::RoundInput;
use ark_core::round::VtxoInput;
use ark_core::server;
use ark_core::server::NoncePks;
use ark_core::server::PartialSigTree;
use ark_core::server::RoundOutput;
use ark_core::server::RoundStreamEvent;
use ark_core::server::VtxoOutPoint;
use ark_core::ArkAddress;
use ark_core::BoardingOutput;
use ark_core::ExplorerUtxo;
use ark_core::Vtxo;
use bitcoin::secp256k1::All;
use bitcoin::secp256k1::PublicKey;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::Address;
use bitcoin::Psbt;
use bitcoin::Transaction;
use bitcoin::Txid;
use futures::Future;
use futures::Stream;
use std::sync::Arc;

pub mod identity;

mod error;
mod round;

pub use error::Error;
pub use error::ErrorContext;
pub use identity::Identity;
pub use identity::StaticIdentity;
pub use identity::VhtlcClaimIdentity;

/// The RPC surface of the Ark server that round participation consumes.
pub trait ArkServer {
    type EventStream: Stream<Item = Result<RoundStreamEvent, Error>> + Unpin + Send;

    fn get_info(&self) -> impl Future<Output = Result<server::Info, Error>> + Send;

    /// Register inputs for the next round, returning the request ID to ping and register
    /// outputs under.
    fn register_inputs_for_next_round(
        &self,
        inputs: &[RoundInput],
    ) -> impl Future<Output = Result<String, Error>> + Send;

    fn register_outputs_for_next_round(
        &self,
        request_id: &str,
        outputs: &[RoundOutput],
        cosigner_pks: &[PublicKey],
        sign_all: bool,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Keep the registration identified by `request_id` alive.
    fn ping(&self, request_id: &str) -> impl Future<Output = Result<(), Error>> + Send;

    fn submit_tree_nonces(
        &self,
        round_id: &str,
        cosigner_pk: PublicKey,
        nonces: NoncePks,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn submit_tree_signatures(
        &self,
        round_id: &str,
        cosigner_pk: PublicKey,
        signatures: PartialSigTree,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn submit_signed_forfeit_txs(
        &self,
        forfeit_txs: Vec<Psbt>,
        round_psbt: Option<Psbt>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Submit an off-chain Ark transaction, outside of a round.
    fn submit_virtual_tx(&self, psbt: Psbt) -> impl Future<Output = Result<Txid, Error>> + Send;

    fn list_vtxos(
        &self,
        address: &ArkAddress,
    ) -> impl Future<Output = Result<Vec<VtxoOutPoint>, Error>> + Send;

    fn get_event_stream(&self)
        -> impl Future<Output = Result<Self::EventStream, Error>> + Send;
}

/// The on-chain collaborators of the client: a chain indexer and a transaction broadcaster.
pub trait Blockchain {
    fn find_outpoints(
        &self,
        address: &Address,
    ) -> impl Future<Output = Result<Vec<ExplorerUtxo>, Error>> + Send;

    fn broadcast(&self, tx: &Transaction) -> impl Future<Output = Result<(), Error>> + Send;
}

/// A client that has not yet talked to its Ark server.
///
/// Most operations need the server's [`server::Info`]; call [`OfflineClient::connect`] to
/// fetch it and obtain a [`Client`].
pub struct OfflineClient<B, A, I> {
    pub name: String,
    blockchain: Arc<B>,
    ark_server: Arc<A>,
    identity: I,
    secp: Secp256k1<All>,
}

/// A client connected to an Ark server.
pub struct Client<B, A, I> {
    inner: OfflineClient<B, A, I>,
    pub server_info: server::Info,
}

impl<B, A, I> OfflineClient<B, A, I>
where
    B: Blockchain,
    A: ArkServer,
    I: Identity,
{
    pub fn new(name: String, blockchain: Arc<B>, ark_server: Arc<A>, identity: I) -> Self {
        Self {
            name,
            blockchain,
            ark_server,
            identity,
            secp: Secp256k1::new(),
        }
    }

    /// Connect to the Ark server and retrieve server information.
    pub async fn connect(self) -> Result<Client<B, A, I>, Error> {
        let server_info = self.ark_server.get_info().await.context("failed to get Ark server info")?;

        tracing::debug!(
            name = self.name,
            network = %server_info.network,
            "Connected to Ark server"
        );

        Ok(Client {
            inner: self,
            server_info,
        })
    }
}

impl<B, A, I> Client<B, A, I>
where
    B: Blockchain,
    A: ArkServer,
    I: Identity,
{
    /// The default VTXO of this client's identity, from which its off-chain address derives.
    pub fn default_vtxo(&self) -> Result<Vtxo, Error> {
        let server_info = &self.server_info;

        let (server_pk, _) = server_info.signer_pk.x_only_public_key();

        let vtxo = Vtxo::new(
            self.secp(),
            server_pk,
            self.inner.identity.x_only_public_key(),
            server_info.unilateral_exit_delay,
            server_info.network,
        )?;

        Ok(vtxo)
    }

    /// Get an off-chain address to be paid at.
    pub fn get_offchain_address(&self) -> Result<(ArkAddress, Vtxo), Error> {
        let vtxo = self.default_vtxo()?;
        let ark_address = vtxo.to_ark_address();

        Ok((ark_address, vtxo))
    }

    /// Get an on-chain boarding address.
    ///
    /// The caller provides the absolute `exit_locktime` after which the boarding output can
    /// be reclaimed unilaterally, typically the current height plus the server's boarding
    /// exit delay.
    pub fn get_boarding_output(
        &self,
        exit_locktime: bitcoin::absolute::LockTime,
    ) -> Result<BoardingOutput, Error> {
        let server_info = &self.server_info;

        let (server_pk, _) = server_info.signer_pk.x_only_public_key();

        let boarding_output = BoardingOutput::new(
            self.secp(),
            server_pk,
            self.inner.identity.x_only_public_key(),
            exit_locktime,
            server_info.network,
        )?;

        Ok(boarding_output)
    }

    /// Collect the spendable [`RoundInput`]s for the given VTXOs and boarding outputs, as
    /// seen by the Ark server and the blockchain respectively.
    pub async fn spendable_round_inputs(
        &self,
        vtxos: &[Vtxo],
        boarding_outputs: &[(BoardingOutput, bitcoin::absolute::LockTime)],
    ) -> Result<Vec<RoundInput>, Error> {
        let mut inputs = Vec::new();

        for vtxo in vtxos {
            let vtxo_outpoints = self
                .ark_server()
                .list_vtxos(&vtxo.to_ark_address())
                .await
                .context("failed to list VTXOs")?;

            for vtxo_outpoint in vtxo_outpoints {
                if vtxo_outpoint.is_spendable() {
                    inputs.push(RoundInput::Vtxo(VtxoInput::new(
                        vtxo.clone(),
                        vtxo_outpoint.amount,
                        vtxo_outpoint.outpoint,
                    )));
                }
            }
        }

        for (boarding_output, tip) in boarding_outputs {
            let outpoints = self
                .blockchain()
                .find_outpoints(boarding_output.address())
                .await
                .context("failed to find boarding outpoints")?;

            for ExplorerUtxo {
                outpoint,
                amount,
                confirmation_blocktime,
                is_spent,
                ..
            } in outpoints
            {
                // Unconfirmed or spent boarding outputs cannot be settled; neither can
                // outputs whose exit path has already opened, since the server would be
                // racing the owner.
                if confirmation_blocktime.is_none() || is_spent {
                    continue;
                }

                if boarding_output.can_be_claimed_unilaterally_by_owner(*tip) {
                    continue;
                }

                inputs.push(RoundInput::OnChain(ark_core::round::OnChainInput::new(
                    boarding_output.clone(),
                    amount,
                    outpoint,
                )));
            }
        }

        Ok(inputs)
    }

    pub fn ark_server(&self) -> &A {
        &self.inner.ark_server
    }

    pub fn blockchain(&self) -> &B {
        &self.inner.blockchain
    }

    pub fn identity(&self) -> &I {
        &self.inner.identity
    }

    fn secp(&self) -> &Secp256k1<All> {
        &self.inner.secp
    }
}
