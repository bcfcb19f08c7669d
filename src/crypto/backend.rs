//! Key derivation, keyed MAC and secret material.
//!
//! Blake3 is used for both: `derive_key()` for domain-separated KDF and
//! `keyed_hash()` for MACs.

use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{BusError, BusResult};

// ============================================================================
// Key Derivation Function (KDF)
// ============================================================================

/// Derive a 32-byte key from input material with domain separation.
///
/// # Arguments
///
/// * `context` - Static domain separation string (must be compile-time constant)
/// * `ikm` - Input key material
pub fn derive_key(context: &str, ikm: &[u8]) -> [u8; 32] {
    blake3::derive_key(context, ikm)
}

// ============================================================================
// Message Authentication Code (MAC)
// ============================================================================

/// Compute a 32-byte keyed MAC.
pub fn keyed_mac(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    *blake3::keyed_hash(key, data).as_bytes()
}

/// Constant-time comparison of two MAC tags.
pub fn mac_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a[..].ct_eq(&b[..]).into()
}

// ============================================================================
// Secrets
// ============================================================================

/// 32 bytes of shared secret material, wiped on drop.
///
/// Used for credential session secrets and shared-auth secrets.
#[derive(Clone)]
pub struct Secret(Zeroizing<[u8; 32]>);

impl Secret {
    /// Generate a fresh random secret.
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut bytes[..]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Build a secret from an opened (decrypted) buffer.
    ///
    /// # Errors
    ///
    /// Returns `BusError::Crypto` if the buffer is not exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> BusResult<Self> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            BusError::Crypto(format!("secret must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self::from_bytes(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Constant-time equality.
    pub fn ct_eq(&self, other: &Secret) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(..)")
    }
}

/// Random bytes for challenges and nonces.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_different_contexts() {
        let ikm = [0x42u8; 32];
        assert_ne!(derive_key("context a", &ikm), derive_key("context b", &ikm));
    }

    #[test]
    fn test_keyed_mac_depends_on_key_and_data() {
        let data = b"test data";
        let mac = keyed_mac(&[0x01u8; 32], data);
        assert_eq!(mac, keyed_mac(&[0x01u8; 32], data));
        assert_ne!(mac, keyed_mac(&[0x02u8; 32], data));
        assert_ne!(mac, keyed_mac(&[0x01u8; 32], b"other data"));
    }

    #[test]
    fn test_secret_from_slice_rejects_wrong_length() {
        assert!(Secret::from_slice(&[0u8; 31]).is_err());
        assert!(Secret::from_slice(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_generated_secrets_differ() {
        let a = Secret::generate();
        let b = Secret::generate();
        assert!(!a.ct_eq(&b));
        assert!(a.ct_eq(&a.clone()));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let s = Secret::from_bytes([7u8; 32]);
        assert_eq!(format!("{s:?}"), "Secret(..)");
    }
}
