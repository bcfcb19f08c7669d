//! Login and bus identities.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::{verifying_key_from_bytes, VerifyingKey};
use crate::error::BusResult;

/// Identity of one login: the login id issued by the access-control
/// service and the authenticated entity name.
///
/// Immutable; a relogin produces a new `LoginInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoginInfo {
    pub id: String,
    pub entity: String,
}

impl LoginInfo {
    pub fn new(id: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entity: entity.into(),
        }
    }
}

impl fmt::Display for LoginInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.entity, self.id)
    }
}

/// Public description of a bus, as returned to a login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusInfo {
    pub id: String,
    /// Ed25519 key the access-control service signs call chains with.
    pub key: [u8; 32],
}

impl BusInfo {
    pub fn new(id: impl Into<String>, key: &VerifyingKey) -> Self {
        Self {
            id: id.into(),
            key: key.to_bytes(),
        }
    }

    pub fn verifying_key(&self) -> BusResult<VerifyingKey> {
        verifying_key_from_bytes(&self.key)
    }

    /// The pseudo-login the bus itself uses as a call target.
    pub fn login(&self) -> LoginInfo {
        LoginInfo::new(self.id.clone(), self.id.clone())
    }
}
