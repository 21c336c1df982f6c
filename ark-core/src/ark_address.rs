use crate::Error;
use bech32::primitives::decode::CheckedHrpstring;
use bech32::Bech32m;
use bech32::Hrp;
use bitcoin::key::TweakedPublicKey;
use bitcoin::Network;
use bitcoin::ScriptBuf;
use bitcoin::XOnlyPublicKey;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

const MAINNET_HRP: &str = "ark";
const TESTNET_HRP: &str = "tark";

/// An address encoding everything needed to pay into an Ark: the server's public key and the
/// tweaked Taproot output key of the recipient's VTXO.
///
/// Addresses are bech32m strings of the 64-byte payload `server || vtxo_tap_key`, with a
/// network-specific human-readable prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArkAddress {
    hrp: Hrp,
    server: XOnlyPublicKey,
    vtxo_tap_key: TweakedPublicKey,
}

impl ArkAddress {
    pub fn new(network: Network, server: XOnlyPublicKey, vtxo_tap_key: TweakedPublicKey) -> Self {
        let hrp = match network {
            Network::Bitcoin => MAINNET_HRP,
            _ => TESTNET_HRP,
        };

        let hrp = Hrp::parse(hrp).expect("valid HRP");

        Self {
            hrp,
            server,
            vtxo_tap_key,
        }
    }

    pub fn decode(value: &str) -> Result<Self, Error> {
        let checked = CheckedHrpstring::new::<Bech32m>(value).map_err(Error::config)?;

        let hrp = checked.hrp();

        let mainnet_hrp = Hrp::parse(MAINNET_HRP).expect("valid HRP");
        let testnet_hrp = Hrp::parse(TESTNET_HRP).expect("valid HRP");

        if hrp != mainnet_hrp && hrp != testnet_hrp {
            return Err(Error::config(format!("unknown address prefix: {hrp}")));
        }

        let bytes = checked.byte_iter().collect::<Vec<_>>();

        if bytes.len() != 64 {
            return Err(Error::config(format!(
                "invalid address payload length: {}",
                bytes.len()
            )));
        }

        let server = XOnlyPublicKey::from_slice(&bytes[..32]).map_err(Error::config)?;
        let vtxo_tap_key = XOnlyPublicKey::from_slice(&bytes[32..]).map_err(Error::config)?;

        // It is safe to call `dangerous_assume_tweaked` because the VTXO taproot key is always
        // tweaked by construction.
        let vtxo_tap_key = TweakedPublicKey::dangerous_assume_tweaked(vtxo_tap_key);

        Ok(Self {
            hrp,
            server,
            vtxo_tap_key,
        })
    }

    pub fn encode(&self) -> String {
        let mut bytes = [0u8; 64];

        bytes[..32].copy_from_slice(&self.server.serialize());
        bytes[32..].copy_from_slice(&self.vtxo_tap_key.serialize());

        bech32::encode::<Bech32m>(self.hrp, bytes.as_slice()).expect("data length within limits")
    }

    /// The script pubkey of the Taproot output this address pays to.
    pub fn to_p2tr_script_pubkey(&self) -> ScriptBuf {
        ScriptBuf::new_p2tr_tweaked(self.vtxo_tap_key)
    }

    pub fn server_pk(&self) -> XOnlyPublicKey {
        self.server
    }

    pub fn vtxo_tap_key(&self) -> TweakedPublicKey {
        self.vtxo_tap_key
    }

    pub fn network(&self) -> Network {
        if self.hrp == Hrp::parse(MAINNET_HRP).expect("valid HRP") {
            Network::Bitcoin
        } else {
            Network::Testnet
        }
    }
}

impl fmt::Display for ArkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for ArkAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl Serialize for ArkAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for ArkAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        ArkAddress::decode(&s).map_err(serde::de::Error::custom)
    }
}
