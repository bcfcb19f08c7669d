//! Ed25519 signatures for call chains and certificate logins.
//!
//! The access-control service signs every call chain it issues so that any
//! server on the bus can verify a chain offline with the bus public key.
//! Entities that log in by certificate sign the login challenge with their
//! own key.
//!
//! # Domain Separation
//!
//! Each signature covers `domain || message`, where `domain` is a static
//! label such as [`CHAIN_DOMAIN`]. A chain signature can therefore never be
//! replayed as a challenge answer and vice versa.

use ed25519_dalek::{Signature, Signer, Verifier};
use zeroize::Zeroizing;

use crate::error::{BusError, BusResult};

// Re-export key types
pub use ed25519_dalek::{SigningKey, VerifyingKey};

/// Domain label for call-chain signatures.
pub const CHAIN_DOMAIN: &[u8] = b"busauth/chain/v1";

/// Domain label for certificate-login challenge answers.
pub const CHALLENGE_DOMAIN: &[u8] = b"busauth/challenge/v1";

/// Sign `domain || message`.
///
/// # Returns
///
/// 64-byte Ed25519 signature
pub fn sign_bytes(signing_key: &SigningKey, domain: &[u8], message: &[u8]) -> [u8; 64] {
    let mut buf = Vec::with_capacity(domain.len() + message.len());
    buf.extend_from_slice(domain);
    buf.extend_from_slice(message);
    signing_key.sign(&buf).to_bytes()
}

/// Verify a signature produced by [`sign_bytes`].
///
/// # Errors
///
/// Returns `BusError::Crypto` if the signature is malformed or does not
/// verify.
pub fn verify_bytes(
    verifying_key: &VerifyingKey,
    domain: &[u8],
    message: &[u8],
    signature: &[u8],
) -> BusResult<()> {
    let sig = Signature::from_slice(signature)
        .map_err(|e| BusError::Crypto(format!("malformed signature: {e}")))?;
    let mut buf = Vec::with_capacity(domain.len() + message.len());
    buf.extend_from_slice(domain);
    buf.extend_from_slice(message);
    verifying_key
        .verify(&buf, &sig)
        .map_err(|e| BusError::Crypto(format!("signature verification failed: {e}")))
}

/// Generate a new Ed25519 signing keypair.
pub fn generate_signing_keypair() -> (SigningKey, VerifyingKey) {
    let signing_key = SigningKey::generate(&mut rand::thread_rng());
    let verifying_key = signing_key.verifying_key();
    (signing_key, verifying_key)
}

/// Load a signing key from 32 secret bytes.
///
/// # Security
///
/// The input bytes are copied into `Zeroizing` storage and wiped after the
/// key is built.
pub fn signing_key_from_bytes(bytes: &[u8; 32]) -> SigningKey {
    let secret = Zeroizing::new(*bytes);
    SigningKey::from_bytes(&secret)
}

/// Load a verifying key from public key bytes.
///
/// # Errors
///
/// Returns `BusError::InvalidPublicKey` if the bytes are not a valid
/// Ed25519 public key.
pub fn verifying_key_from_bytes(bytes: &[u8]) -> BusResult<VerifyingKey> {
    let arr: [u8; 32] = bytes.try_into().map_err(|_| {
        BusError::InvalidPublicKey(format!("expected 32 bytes, got {}", bytes.len()))
    })?;
    VerifyingKey::from_bytes(&arr).map_err(|e| BusError::InvalidPublicKey(e.to_string()))
}
