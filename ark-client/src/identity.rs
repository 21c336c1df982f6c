//! The key holder abstraction the client signs with.

use crate::Error;
use ark_core::send::set_condition_witness;
use bitcoin::hashes::Hash;
use bitcoin::key::Keypair;
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1;
use bitcoin::secp256k1::schnorr;
use bitcoin::secp256k1::All;
use bitcoin::sighash::Prevouts;
use bitcoin::sighash::SighashCache;
use bitcoin::taproot;
use bitcoin::Psbt;
use bitcoin::TapLeafHash;
use bitcoin::TapSighashType;
use bitcoin::Witness;
use bitcoin::XOnlyPublicKey;
use rand::CryptoRng;
use rand::Rng;

/// A holder of key material, able to produce the signatures the protocol needs.
pub trait Identity {
    fn x_only_public_key(&self) -> XOnlyPublicKey;

    /// Produce a Schnorr signature over `msg`.
    fn sign(&self, msg: &secp256k1::Message) -> Result<schnorr::Signature, Error>;

    /// Sign the selected inputs of `psbt` (all of them if `input_indexes` is `None`), each
    /// under the tapscript leaf already annotated on the input.
    fn sign_transaction(
        &self,
        psbt: &mut Psbt,
        input_indexes: Option<&[usize]>,
    ) -> Result<(), Error>;

    /// A fresh MuSig2 cosigner keypair, to be used for the tree signing session of a single
    /// round and then discarded.
    fn signer_session<R>(&self, rng: &mut R) -> Result<Keypair, Error>
    where
        R: Rng + CryptoRng;
}

/// An [`Identity`] backed by a single static keypair.
#[derive(Clone)]
pub struct StaticIdentity {
    kp: Keypair,
    secp: Secp256k1<All>,
}

impl StaticIdentity {
    pub fn new(kp: Keypair) -> Self {
        Self {
            kp,
            secp: Secp256k1::new(),
        }
    }
}

impl Identity for StaticIdentity {
    fn x_only_public_key(&self) -> XOnlyPublicKey {
        self.kp.x_only_public_key().0
    }

    fn sign(&self, msg: &secp256k1::Message) -> Result<schnorr::Signature, Error> {
        Ok(self.secp.sign_schnorr_no_aux_rand(msg, &self.kp))
    }

    fn sign_transaction(
        &self,
        psbt: &mut Psbt,
        input_indexes: Option<&[usize]>,
    ) -> Result<(), Error> {
        sign_annotated_inputs(
            |msg| Ok((self.secp.sign_schnorr_no_aux_rand(msg, &self.kp), self.x_only_public_key())),
            psbt,
            input_indexes,
        )
    }

    fn signer_session<R>(&self, rng: &mut R) -> Result<Keypair, Error>
    where
        R: Rng + CryptoRng,
    {
        Ok(Keypair::new(&self.secp, rng))
    }
}

/// An [`Identity`] wrapper for claiming a VHTLC: recording the preimage as the condition
/// witness of input 0 before signing, so that the finalized witness satisfies the HTLC gate.
pub struct VhtlcClaimIdentity<I> {
    inner: I,
    preimage: Vec<u8>,
}

impl<I> VhtlcClaimIdentity<I> {
    pub fn new(inner: I, preimage: Vec<u8>) -> Self {
        Self { inner, preimage }
    }
}

impl<I> Identity for VhtlcClaimIdentity<I>
where
    I: Identity,
{
    fn x_only_public_key(&self) -> XOnlyPublicKey {
        self.inner.x_only_public_key()
    }

    fn sign(&self, msg: &secp256k1::Message) -> Result<schnorr::Signature, Error> {
        self.inner.sign(msg)
    }

    fn sign_transaction(
        &self,
        psbt: &mut Psbt,
        input_indexes: Option<&[usize]>,
    ) -> Result<(), Error> {
        let input = psbt
            .inputs
            .first_mut()
            .ok_or_else(|| Error::ad_hoc("cannot claim VHTLC without inputs"))?;

        let mut condition_witness = Witness::new();
        condition_witness.push(&self.preimage);

        set_condition_witness(input, &condition_witness);

        self.inner.sign_transaction(psbt, input_indexes)
    }

    fn signer_session<R>(&self, rng: &mut R) -> Result<Keypair, Error>
    where
        R: Rng + CryptoRng,
    {
        self.inner.signer_session(rng)
    }
}

/// Sign the selected inputs of `psbt` under the tapscript leaf annotated on each input,
/// collecting the signature into the input's `tap_script_sigs`.
pub fn sign_annotated_inputs<F>(
    sign_fn: F,
    psbt: &mut Psbt,
    input_indexes: Option<&[usize]>,
) -> Result<(), Error>
where
    F: Fn(&secp256k1::Message) -> Result<(schnorr::Signature, XOnlyPublicKey), Error>,
{
    let secp = Secp256k1::new();

    let prevouts = psbt
        .inputs
        .iter()
        .map(|i| {
            i.witness_utxo
                .clone()
                .ok_or_else(|| Error::ad_hoc("missing witness UTXO on PSBT input"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let unsigned_tx = psbt.unsigned_tx.clone();

    for (i, input) in psbt.inputs.iter_mut().enumerate() {
        if let Some(indexes) = input_indexes {
            if !indexes.contains(&i) {
                continue;
            }
        }

        let (_, (script, leaf_version)) = input
            .tap_scripts
            .first_key_value()
            .ok_or_else(|| Error::ad_hoc(format!("missing tap scripts for input {i}")))?;

        let leaf_hash = TapLeafHash::from_script(script, *leaf_version);

        let prevouts = Prevouts::All(&prevouts);

        let tap_sighash = SighashCache::new(&unsigned_tx)
            .taproot_script_spend_signature_hash(i, &prevouts, leaf_hash, TapSighashType::Default)
            .map_err(Error::ad_hoc)?;

        let msg = secp256k1::Message::from_digest(tap_sighash.to_raw_hash().to_byte_array());

        let (sig, pk) = sign_fn(&msg)?;

        secp.verify_schnorr(&sig, &msg, &pk)
            .map_err(|e| Error::ad_hoc(format!("failed to verify own signature: {e}")))?;

        let sig = taproot::Signature {
            signature: sig,
            sighash_type: TapSighashType::Default,
        };

        input.tap_script_sigs.insert((pk, leaf_hash), sig);
    }

    Ok(())
}
