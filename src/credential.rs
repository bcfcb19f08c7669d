//! Credential context attached to every authenticated call.
//!
//! # Wire Format
//!
//! The request context is a bincode-encoded [`CredentialData`]. A server
//! that cannot validate a credential answers with an
//! `InvalidCredential` rejection whose reply context is a bincode-encoded
//! [`CredentialReset`].
//!
//! # Authenticator
//!
//! ```text
//! K    = derive_key("busauth credential v1", secret)
//! M    = version || lp(bus) || lp(login) || session_le || ticket_le || lp(operation) || lp(chain_signature)
//! hash = keyed_hash(K, M)
//! ```
//!
//! `lp(x)` is a little-endian u32 length prefix followed by `x`, so field
//! boundaries can never be shifted.

use serde::{Deserialize, Serialize};

use crate::chain::SignedCallChain;
use crate::codec;
use crate::crypto::{derive_key, keyed_mac, Secret};
use crate::error::{BusError, BusResult};
use crate::identity::LoginInfo;

/// Credential format version.
pub const CREDENTIAL_VERSION: u8 = 1;

const AUTHENTICATOR_CONTEXT: &str = "busauth credential v1";

/// Session id used before any session exists with a target.
pub const FIRST_CONTACT_SESSION: u32 = 0;

/// Credential context stamped on outgoing calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialData {
    pub version: u8,
    pub bus: String,
    pub login: String,
    pub session: u32,
    pub ticket: u32,
    pub hash: [u8; 32],
    pub chain: SignedCallChain,
}

impl CredentialData {
    /// Credential for a target this login has no session with yet.
    ///
    /// Always fails validation and provokes a reset.
    pub fn first_contact(bus: &str, login: &str, chain: SignedCallChain) -> Self {
        Self {
            version: CREDENTIAL_VERSION,
            bus: bus.to_string(),
            login: login.to_string(),
            session: FIRST_CONTACT_SESSION,
            ticket: 0,
            hash: [0u8; 32],
            chain,
        }
    }

    /// Credential authenticated with `secret` for one ticket.
    pub fn stamped(
        bus: &str,
        login: &str,
        session: u32,
        ticket: u32,
        secret: &Secret,
        operation: &str,
        chain: SignedCallChain,
    ) -> Self {
        let hash = authenticator(secret, bus, login, session, ticket, operation, &chain);
        Self {
            version: CREDENTIAL_VERSION,
            bus: bus.to_string(),
            login: login.to_string(),
            session,
            ticket,
            hash,
            chain,
        }
    }

    pub fn encode(&self) -> BusResult<Vec<u8>> {
        codec::encode(self)
    }

    /// Decode a request context.
    ///
    /// # Errors
    ///
    /// Returns `BusError::InvalidCredential` for malformed blobs or an
    /// unsupported version.
    pub fn decode(bytes: &[u8]) -> BusResult<Self> {
        let data: Self = codec::decode(bytes)
            .map_err(|e| BusError::InvalidCredential(format!("malformed credential: {e}")))?;
        if data.version != CREDENTIAL_VERSION {
            return Err(BusError::InvalidCredential(format!(
                "unsupported credential version {}",
                data.version
            )));
        }
        Ok(data)
    }
}

/// Reply context asking the caller to (re)establish a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialReset {
    pub version: u8,
    /// Login of the server that issued the reset.
    pub target: LoginInfo,
    /// New session id.
    pub session: u32,
    /// New session secret, sealed to the caller's login key.
    pub challenge: Vec<u8>,
}

impl CredentialReset {
    pub fn new(target: LoginInfo, session: u32, challenge: Vec<u8>) -> Self {
        Self {
            version: CREDENTIAL_VERSION,
            target,
            session,
            challenge,
        }
    }

    pub fn encode(&self) -> BusResult<Vec<u8>> {
        codec::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> BusResult<Self> {
        let reset: Self = codec::decode(bytes)
            .map_err(|e| BusError::InvalidRemote(format!("malformed credential reset: {e}")))?;
        if reset.version != CREDENTIAL_VERSION {
            return Err(BusError::InvalidRemote(format!(
                "unsupported reset version {}",
                reset.version
            )));
        }
        Ok(reset)
    }
}

fn push_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

/// Compute the authenticator for one credential.
pub fn authenticator(
    secret: &Secret,
    bus: &str,
    login: &str,
    session: u32,
    ticket: u32,
    operation: &str,
    chain: &SignedCallChain,
) -> [u8; 32] {
    let key = zeroize::Zeroizing::new(derive_key(AUTHENTICATOR_CONTEXT, secret.as_bytes()));
    let mut msg = Vec::with_capacity(96 + bus.len() + login.len() + operation.len());
    msg.push(CREDENTIAL_VERSION);
    push_prefixed(&mut msg, bus.as_bytes());
    push_prefixed(&mut msg, login.as_bytes());
    msg.extend_from_slice(&session.to_le_bytes());
    msg.extend_from_slice(&ticket.to_le_bytes());
    push_prefixed(&mut msg, operation.as_bytes());
    push_prefixed(&mut msg, chain.signature());
    keyed_mac(&key, &msg)
}
