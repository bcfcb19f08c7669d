//! Access-control service contract.
//!
//! The access-control service authenticates entities, grants leased logins,
//! signs call chains and hands out shared-authentication secrets. Everything
//! a [`Connection`](crate::connection::Connection) needs from it goes
//! through the [`AccessControl`] trait, so a remote implementation can be
//! dropped in behind the same interface as [`InMemoryAccessControl`].
//!
//! Calls made on behalf of an existing login carry a [`CredentialData`]
//! stamped with the login's bus session for the operation names in
//! [`operation`].

mod memory;
mod passwords;

pub use memory::InMemoryAccessControl;
pub use passwords::{PasswordValidator, StaticPasswords};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chain::SignedCallChain;
use crate::credential::CredentialData;
use crate::crypto::signing::CHALLENGE_DOMAIN;
use crate::crypto::{sign_bytes, LoginPublicKey, Secret, SigningKey};
use crate::error::BusResult;
use crate::identity::{BusInfo, LoginInfo};

/// Operation names authenticated with the bus session.
pub mod operation {
    pub const RENEW_LEASE: &str = "renew_lease";
    pub const LOGOUT: &str = "logout";
    pub const SIGN_CHAIN_FOR: &str = "sign_chain_for";
    pub const START_SHARED_AUTH: &str = "start_shared_auth";
    pub const CANCEL_SHARED_AUTH: &str = "cancel_shared_auth";
}

/// Result of a successful login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginGrant {
    pub login: LoginInfo,
    pub bus: BusInfo,
    pub lease_secs: u32,
    /// Bus session id for calls back to the access-control service.
    pub session: u32,
    /// Bus session secret, sealed to the login key.
    pub sealed_secret: Vec<u8>,
    /// Chain addressed to the bus, used for first contact everywhere.
    pub chain: SignedCallChain,
}

/// Challenge issued for a certificate login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginChallenge {
    pub process: String,
    pub challenge: [u8; 32],
}

/// How a handed-off secret may be redeemed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandoffMode {
    /// Redeemable once, within the shared-auth TTL.
    SharedAuth,
    /// Redeemable any number of times until it expires or the originating
    /// login ends.
    SingleSignOn,
}

/// Secret handed to an already-logged-in process for another login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffGrant {
    pub process: String,
    pub mode: HandoffMode,
    /// Secret sealed to the requesting login's key.
    pub sealed_secret: Vec<u8>,
    pub expires_in_secs: u32,
}

/// Outcome of a lease renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseRenewal {
    /// Renewed; renew again after this many seconds.
    Renewed(u32),
    /// The service declined to renew.
    NotRenewed,
}

/// The access-control service endpoint contract.
#[async_trait]
pub trait AccessControl: Send + Sync {
    async fn login_by_password(
        &self,
        entity: &str,
        password: &[u8],
        domain: &str,
        login_key: &LoginPublicKey,
    ) -> BusResult<LoginGrant>;

    /// First half of a certificate login.
    ///
    /// Fails with `MissingCertificate` if no key is registered for `entity`.
    async fn start_login_by_certificate(&self, entity: &str) -> BusResult<LoginChallenge>;

    /// Second half of a certificate login; `answer` comes from
    /// [`answer_challenge`].
    async fn login_by_certificate(
        &self,
        process: &str,
        answer: &[u8],
        login_key: &LoginPublicKey,
    ) -> BusResult<LoginGrant>;

    async fn start_shared_auth(&self, credential: &CredentialData, mode: HandoffMode) -> BusResult<HandoffGrant>;

    async fn login_by_shared_auth(
        &self,
        process: &str,
        secret: &Secret,
        login_key: &LoginPublicKey,
    ) -> BusResult<LoginGrant>;

    async fn cancel_shared_auth(&self, credential: &CredentialData, process: &str) -> BusResult<()>;

    async fn renew_lease(&self, credential: &CredentialData) -> BusResult<LeaseRenewal>;

    /// Sign a chain addressed to `target` for the credential's login,
    /// optionally on behalf of everyone in `joined`.
    ///
    /// `joined` must be addressed to the requesting login.
    async fn sign_chain_for(
        &self,
        credential: &CredentialData,
        target: &str,
        joined: Option<&SignedCallChain>,
    ) -> BusResult<SignedCallChain>;

    async fn logout(&self, credential: &CredentialData) -> BusResult<()>;
}

/// Message an entity signs to answer a certificate challenge.
pub fn challenge_message(challenge: &[u8; 32], login_key: &LoginPublicKey) -> [u8; 64] {
    let mut msg = [0u8; 64];
    msg[..32].copy_from_slice(challenge);
    msg[32..].copy_from_slice(login_key.as_bytes());
    msg
}

/// Sign a certificate challenge with the entity's private key.
///
/// Binding the login key into the answer stops a captured answer from being
/// replayed for a login key the attacker controls.
pub fn answer_challenge(entity_key: &SigningKey, challenge: &[u8; 32], login_key: &LoginPublicKey) -> [u8; 64] {
    sign_bytes(entity_key, CHALLENGE_DOMAIN, &challenge_message(challenge, login_key))
}
