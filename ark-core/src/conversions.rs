//! Conversions between `bitcoin::secp256k1` and `zkp` cryptographic types, needed wherever
//! the MuSig2 machinery meets regular Bitcoin signing.

use bitcoin::secp256k1::PublicKey;
use bitcoin::XOnlyPublicKey;

pub fn to_zkp_pk(pk: PublicKey) -> zkp::PublicKey {
    zkp::PublicKey::from_slice(&pk.serialize()).expect("valid conversion")
}

pub fn from_zkp_pk(pk: zkp::PublicKey) -> PublicKey {
    PublicKey::from_slice(&pk.serialize()).expect("valid conversion")
}

pub fn from_zkp_xonly(pk: zkp::XOnlyPublicKey) -> XOnlyPublicKey {
    XOnlyPublicKey::from_slice(&pk.serialize()).expect("valid conversion")
}

pub fn to_zkp_keypair(secp: &zkp::Secp256k1<zkp::All>, kp: &bitcoin::key::Keypair) -> zkp::Keypair {
    zkp::Keypair::from_seckey_slice(secp, &kp.secret_bytes()).expect("valid conversion")
}
