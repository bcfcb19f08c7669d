//! Crypto facade for the credential protocol.
//!
//! This module provides:
//! - Ed25519 signatures (call chains, certificate login challenges)
//! - Sealing of short secrets to a login key (Ristretto255 DH +
//!   ChaCha20-Poly1305)
//! - Keyed MAC and key derivation for credential authenticators
//!
//! Every primitive comes from a standard crate; nothing here implements
//! cryptography by hand.

pub mod backend;
pub mod sealing;
pub mod signing;

pub use backend::{derive_key, keyed_mac, mac_eq, Secret};
pub use sealing::{LoginKeyPair, LoginPublicKey};
pub use signing::{
    generate_signing_keypair, sign_bytes, signing_key_from_bytes, verify_bytes,
    verifying_key_from_bytes, SigningKey, VerifyingKey,
};
