//! Tunnel keypair generation
//!
//! Generates Curve25519 keypairs in the base64 form the tunnel expects,
//! using native crypto. No external binary is required.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::rngs::OsRng;
use trellis_proto::KeyPair;
use x25519_dalek::{PublicKey, StaticSecret};

/// Generate a new keypair
pub fn generate_keypair() -> KeyPair {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);

    KeyPair {
        private_key: STANDARD.encode(secret.to_bytes()),
        public_key: STANDARD.encode(public.as_bytes()),
    }
}
