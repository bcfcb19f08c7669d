//! Sealing short secrets to a login key.
//!
//! Every login owns a Ristretto255 key pair. The access-control service and
//! bus servers use the public half to hand secrets (session secrets, reset
//! challenges, shared-auth secrets) to exactly that login:
//!
//! ```text
//! eph      = random scalar
//! shared   = recipient_pub * eph
//! key      = derive_key(SEAL_CONTEXT, shared || eph_pub || recipient_pub)
//! sealed   = eph_pub (32) || nonce (12) || chacha20poly1305(key, nonce, secret, aad = eph_pub || recipient_pub)
//! ```
//!
//! Ristretto255 has a prime-order group, so no low-order point checks are
//! needed after decompression.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use curve25519_dalek::{
    constants::RISTRETTO_BASEPOINT_POINT,
    ristretto::{CompressedRistretto, RistrettoPoint},
    scalar::Scalar,
};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use super::backend::{derive_key, random_bytes};
use crate::error::{BusError, BusResult};

const SEAL_CONTEXT: &str = "busauth 2024-01 sealed secret v1";
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = 32 + NONCE_LEN;

/// Public half of a login key, as carried in chains and login requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoginPublicKey([u8; 32]);

impl LoginPublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn point(&self) -> BusResult<RistrettoPoint> {
        CompressedRistretto::from_slice(&self.0)
            .ok()
            .and_then(|c| c.decompress())
            .ok_or_else(|| BusError::InvalidPublicKey("invalid ristretto255 point encoding".into()))
    }

    /// Check that the key decodes to a valid group element.
    pub fn validate(&self) -> BusResult<()> {
        self.point().map(|_| ())
    }

    /// Seal `plaintext` so only the holder of the matching [`LoginKeyPair`]
    /// can open it.
    ///
    /// # Errors
    ///
    /// Returns `BusError::InvalidPublicKey` if this key is not a valid point.
    pub fn seal(&self, plaintext: &[u8]) -> BusResult<Vec<u8>> {
        let recipient = self.point()?;
        let mut eph = Scalar::random(&mut rand::thread_rng());
        let eph_pub = (RISTRETTO_BASEPOINT_POINT * eph).compress().to_bytes();
        let shared = Zeroizing::new((recipient * eph).compress().to_bytes());
        eph.zeroize();

        let key = seal_key(&shared, &eph_pub, &self.0);
        let nonce: [u8; NONCE_LEN] = random_bytes();
        let aad = associated_data(&eph_pub, &self.0);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: &aad })
            .map_err(|_| BusError::Crypto("seal failed".into()))?;

        let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        out.extend_from_slice(&eph_pub);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }
}

/// Per-login Ristretto255 key pair.
///
/// The scalar is zeroized on drop.
pub struct LoginKeyPair {
    secret: Scalar,
    public: LoginPublicKey,
}

impl LoginKeyPair {
    /// Generate a fresh key pair for a new login.
    pub fn generate() -> Self {
        let secret = Scalar::random(&mut rand::thread_rng());
        let public = (RISTRETTO_BASEPOINT_POINT * secret).compress().to_bytes();
        Self {
            secret,
            public: LoginPublicKey(public),
        }
    }

    pub fn public_key(&self) -> LoginPublicKey {
        self.public
    }

    /// Open a buffer produced by [`LoginPublicKey::seal`].
    ///
    /// # Errors
    ///
    /// Returns `BusError::Crypto` if the buffer is truncated, was sealed to
    /// another key, or was tampered with.
    pub fn open(&self, sealed: &[u8]) -> BusResult<Zeroizing<Vec<u8>>> {
        if sealed.len() < HEADER_LEN {
            return Err(BusError::Crypto(format!(
                "sealed secret too short: {} bytes",
                sealed.len()
            )));
        }
        let (eph_pub, rest) = sealed.split_at(32);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        let eph_pub: [u8; 32] = eph_pub
            .try_into()
            .map_err(|_| BusError::Crypto("malformed ephemeral key".into()))?;

        let eph_point = LoginPublicKey(eph_pub).point()?;
        let shared = Zeroizing::new((eph_point * self.secret).compress().to_bytes());
        let key = seal_key(&shared, &eph_pub, &self.public.0);
        let aad = associated_data(&eph_pub, &self.public.0);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad: &aad })
            .map(Zeroizing::new)
            .map_err(|_| BusError::Crypto("sealed secret failed authentication".into()))
    }
}

impl Drop for LoginKeyPair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl std::fmt::Debug for LoginKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginKeyPair")
            .field("public", &hex::encode(self.public.0))
            .finish_non_exhaustive()
    }
}

fn seal_key(shared: &[u8; 32], eph_pub: &[u8; 32], recipient: &[u8; 32]) -> Zeroizing<[u8; 32]> {
    let mut ikm = Zeroizing::new([0u8; 96]);
    ikm[..32].copy_from_slice(shared);
    ikm[32..64].copy_from_slice(eph_pub);
    ikm[64..].copy_from_slice(recipient);
    Zeroizing::new(derive_key(SEAL_CONTEXT, &ikm[..]))
}

fn associated_data(eph_pub: &[u8; 32], recipient: &[u8; 32]) -> [u8; 64] {
    let mut aad = [0u8; 64];
    aad[..32].copy_from_slice(eph_pub);
    aad[32..].copy_from_slice(recipient);
    aad
}
