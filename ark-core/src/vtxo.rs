use crate::ark_address::ArkAddress;
use crate::script::csv_multisig_script;
use crate::script::multisig_script;
use crate::script::tr_script_pubkey;
use crate::Error;
use crate::UNSPENDABLE_KEY;
use bitcoin::key::PublicKey;
use bitcoin::key::Secp256k1;
use bitcoin::key::Verification;
use bitcoin::relative;
use bitcoin::taproot;
use bitcoin::taproot::LeafVersion;
use bitcoin::taproot::TaprootBuilder;
use bitcoin::taproot::TaprootSpendInfo;
use bitcoin::Address;
use bitcoin::Network;
use bitcoin::ScriptBuf;
use bitcoin::XOnlyPublicKey;
use std::time::Duration;

/// All the information needed to _spend_ a VTXO.
///
/// A default VTXO has two spend paths: a collaborative _forfeit_ path involving the owner and
/// the Ark server, and a unilateral _exit_ path for the owner behind a relative timelock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vtxo {
    server: XOnlyPublicKey,
    owner: XOnlyPublicKey,
    spend_info: TaprootSpendInfo,
    address: Address,
    exit_delay: bitcoin::Sequence,
    network: Network,
}

impl Vtxo {
    /// 64 bytes per pubkey.
    pub const FORFEIT_WITNESS_SIZE: usize = 64 * 2;

    /// Build a default VTXO.
    pub fn new<C>(
        secp: &Secp256k1<C>,
        server: XOnlyPublicKey,
        owner: XOnlyPublicKey,
        exit_delay: bitcoin::Sequence,
        network: Network,
    ) -> Result<Self, Error>
    where
        C: Verification,
    {
        let unspendable_key: PublicKey = UNSPENDABLE_KEY.parse().expect("valid key");
        let (unspendable_key, _) = unspendable_key.inner.x_only_public_key();

        let forfeit_script = multisig_script(&[owner, server]);
        let exit_script = csv_multisig_script(exit_delay, &[owner]);

        let spend_info = TaprootBuilder::new()
            .add_leaf(1, forfeit_script)
            .expect("valid forfeit leaf")
            .add_leaf(1, exit_script)
            .expect("valid exit leaf")
            .finalize(secp, unspendable_key)
            .expect("can be finalized");

        let script_pubkey = tr_script_pubkey(&spend_info);
        let address = Address::from_script(&script_pubkey, network).expect("valid script");

        Ok(Self {
            server,
            owner,
            spend_info,
            address,
            exit_delay,
            network,
        })
    }

    pub fn spend_info(&self) -> &TaprootSpendInfo {
        &self.spend_info
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn owner_pk(&self) -> XOnlyPublicKey {
        self.owner
    }

    pub fn server_pk(&self) -> XOnlyPublicKey {
        self.server
    }

    pub fn exit_delay(&self) -> bitcoin::Sequence {
        self.exit_delay
    }

    /// The unilateral exit delay, as a [`Duration`].
    ///
    /// # Panics
    ///
    /// Panics if the exit delay is expressed in blocks. We expect the Ark server to use a
    /// relative locktime in seconds.
    pub fn exit_delay_duration(&self) -> Duration {
        let exit_delay_seconds = match self.exit_delay.to_relative_lock_time() {
            Some(relative::LockTime::Time(time)) => time.value() as u64 * 512,
            _ => unreachable!("exit delay must be a relative lock time in seconds"),
        };

        Duration::from_secs(exit_delay_seconds)
    }

    pub fn to_ark_address(&self) -> ArkAddress {
        let vtxo_tap_key = self.spend_info.output_key();

        ArkAddress::new(self.network, self.server, vtxo_tap_key)
    }

    /// The spend info for the forfeit branch of the VTXO.
    pub fn forfeit_spend_info(&self) -> (ScriptBuf, taproot::ControlBlock) {
        let forfeit_script = self.forfeit_script();

        let control_block = self
            .spend_info
            .control_block(&(forfeit_script.clone(), LeafVersion::TapScript))
            .expect("forfeit script");

        (forfeit_script, control_block)
    }

    /// The spend info for the unilateral exit branch of the VTXO.
    pub fn exit_spend_info(&self) -> (ScriptBuf, taproot::ControlBlock) {
        let exit_script = self.exit_script();

        let control_block = self
            .spend_info
            .control_block(&(exit_script.clone(), LeafVersion::TapScript))
            .expect("exit script");

        (exit_script, control_block)
    }

    /// The leaf scripts composing the VTXO's script tree.
    pub fn tapscripts(&self) -> Vec<ScriptBuf> {
        vec![self.forfeit_script(), self.exit_script()]
    }

    /// Whether the VTXO can be claimed unilaterally by the owner or not, given the
    /// `confirmation_blocktime` of the transaction that included this VTXO as an output.
    pub fn can_be_claimed_unilaterally_by_owner(
        &self,
        now: Duration,
        confirmation_blocktime: Duration,
    ) -> bool {
        let exit_path_time = confirmation_blocktime + self.exit_delay_duration();

        now > exit_path_time
    }

    fn forfeit_script(&self) -> ScriptBuf {
        multisig_script(&[self.owner, self.server])
    }

    fn exit_script(&self) -> ScriptBuf {
        csv_multisig_script(self.exit_delay, &[self.owner])
    }
}

impl std::hash::Hash for Vtxo {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn vtxo() -> Vtxo {
        let secp = Secp256k1::new();

        let server = XOnlyPublicKey::from_str(
            "18845781f631c48f1c9709e23092067d06837f30aa0cd0544ac887fe91ddd166",
        )
        .unwrap();
        let owner = XOnlyPublicKey::from_str(
            "28845781f631c48f1c9709e23092067d06837f30aa0cd0544ac887fe91ddd166",
        )
        .unwrap();

        Vtxo::new(
            &secp,
            server,
            owner,
            bitcoin::Sequence::from_seconds_ceil(1024).unwrap(),
            Network::Regtest,
        )
        .unwrap()
    }

    #[test]
    fn output_script_commits_to_tapscripts() {
        let vtxo = vtxo();

        // Rebuilding the taproot tree from the declared tapscripts with the unspendable internal
        // key must produce the same output script.
        let secp = Secp256k1::new();
        let unspendable_key: PublicKey = UNSPENDABLE_KEY.parse().unwrap();
        let (unspendable_key, _) = unspendable_key.inner.x_only_public_key();

        let tapscripts = vtxo.tapscripts();

        let mut builder = TaprootBuilder::new();
        for tapscript in tapscripts {
            builder = builder.add_leaf(1, tapscript).unwrap();
        }
        let spend_info = builder.finalize(&secp, unspendable_key).unwrap();

        assert_eq!(tr_script_pubkey(&spend_info), vtxo.script_pubkey());
    }

    #[test]
    fn forfeit_and_exit_leaves_are_in_the_tree() {
        let vtxo = vtxo();

        let (forfeit_script, forfeit_control_block) = vtxo.forfeit_spend_info();
        let (exit_script, exit_control_block) = vtxo.exit_spend_info();

        assert_ne!(forfeit_script, exit_script);

        let secp = Secp256k1::new();

        assert!(forfeit_control_block.verify_taproot_commitment(
            &secp,
            vtxo.spend_info().output_key().to_inner(),
            &forfeit_script,
        ));
        assert!(exit_control_block.verify_taproot_commitment(
            &secp,
            vtxo.spend_info().output_key().to_inner(),
            &exit_script,
        ));
    }

    #[test]
    fn ark_address_round_trips_through_encoding() {
        let vtxo = vtxo();

        let address = vtxo.to_ark_address();
        let decoded = ArkAddress::decode(&address.encode()).unwrap();

        assert_eq!(decoded.to_p2tr_script_pubkey(), vtxo.script_pubkey());
    }
}
