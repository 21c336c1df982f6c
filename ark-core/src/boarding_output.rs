use crate::ark_address::ArkAddress;
use crate::script::cltv_multisig_script;
use crate::script::multisig_script;
use crate::script::tr_script_pubkey;
use crate::Error;
use crate::UNSPENDABLE_KEY;
use bitcoin::absolute;
use bitcoin::key::PublicKey;
use bitcoin::key::Secp256k1;
use bitcoin::key::Verification;
use bitcoin::taproot;
use bitcoin::taproot::LeafVersion;
use bitcoin::taproot::TaprootBuilder;
use bitcoin::taproot::TaprootSpendInfo;
use bitcoin::Address;
use bitcoin::Network;
use bitcoin::ScriptBuf;
use bitcoin::XOnlyPublicKey;

/// An on-chain UTXO with an Ark-compatible script, waiting to be converted into a VTXO at an
/// upcoming round.
///
/// The script tree mirrors a VTXO's, except that the exit path uses an absolute timelock: the
/// owner can reclaim the coin unilaterally once `exit_locktime` (the boarding exit delay added
/// to the funding height) is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardingOutput {
    server: XOnlyPublicKey,
    owner: XOnlyPublicKey,
    spend_info: TaprootSpendInfo,
    address: Address,
    exit_locktime: absolute::LockTime,
    network: Network,
}

impl BoardingOutput {
    pub fn new<C>(
        secp: &Secp256k1<C>,
        server: XOnlyPublicKey,
        owner: XOnlyPublicKey,
        exit_locktime: absolute::LockTime,
        network: Network,
    ) -> Result<Self, Error>
    where
        C: Verification,
    {
        let unspendable_key: PublicKey = UNSPENDABLE_KEY.parse().expect("valid key");
        let (unspendable_key, _) = unspendable_key.inner.x_only_public_key();

        let forfeit_script = multisig_script(&[owner, server]);
        let exit_script = cltv_multisig_script(exit_locktime, &[owner]);

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
            exit_locktime,
            network,
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }

    pub fn owner_pk(&self) -> XOnlyPublicKey {
        self.owner
    }

    pub fn server_pk(&self) -> XOnlyPublicKey {
        self.server
    }

    pub fn exit_locktime(&self) -> absolute::LockTime {
        self.exit_locktime
    }

    pub fn spend_info(&self) -> &TaprootSpendInfo {
        &self.spend_info
    }

    pub fn to_ark_address(&self) -> ArkAddress {
        let vtxo_tap_key = self.spend_info.output_key();

        ArkAddress::new(self.network, self.server, vtxo_tap_key)
    }

    /// The spend info for the forfeit branch of the boarding output.
    pub fn forfeit_spend_info(&self) -> (ScriptBuf, taproot::ControlBlock) {
        let forfeit_script = self.forfeit_script();

        let control_block = self
            .spend_info
            .control_block(&(forfeit_script.clone(), LeafVersion::TapScript))
            .expect("forfeit script");

        (forfeit_script, control_block)
    }

    /// The spend info for the unilateral exit branch of the boarding output.
    pub fn exit_spend_info(&self) -> (ScriptBuf, taproot::ControlBlock) {
        let exit_script = self.exit_script();

        let control_block = self
            .spend_info
            .control_block(&(exit_script.clone(), LeafVersion::TapScript))
            .expect("exit script");

        (exit_script, control_block)
    }

    /// The leaf scripts composing the boarding output's script tree.
    pub fn tapscripts(&self) -> Vec<ScriptBuf> {
        vec![self.forfeit_script(), self.exit_script()]
    }

    /// Whether the exit path is active, given the locktime implied by the current chain tip.
    pub fn can_be_claimed_unilaterally_by_owner(&self, tip: absolute::LockTime) -> bool {
        self.exit_locktime.is_implied_by(tip)
    }

    fn forfeit_script(&self) -> ScriptBuf {
        multisig_script(&[self.owner, self.server])
    }

    fn exit_script(&self) -> ScriptBuf {
        cltv_multisig_script(self.exit_locktime, &[self.owner])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn exit_path_activates_at_locktime() {
        let secp = Secp256k1::new();

        let server = XOnlyPublicKey::from_str(
            "18845781f631c48f1c9709e23092067d06837f30aa0cd0544ac887fe91ddd166",
        )
        .unwrap();
        let owner = XOnlyPublicKey::from_str(
            "28845781f631c48f1c9709e23092067d06837f30aa0cd0544ac887fe91ddd166",
        )
        .unwrap();

        let boarding_output = BoardingOutput::new(
            &secp,
            server,
            owner,
            absolute::LockTime::from_height(1_000).unwrap(),
            Network::Regtest,
        )
        .unwrap();

        let not_yet = absolute::LockTime::from_height(999).unwrap();
        let reached = absolute::LockTime::from_height(1_000).unwrap();

        assert!(!boarding_output.can_be_claimed_unilaterally_by_owner(not_yet));
        assert!(boarding_output.can_be_claimed_unilaterally_by_owner(reached));
    }
}
