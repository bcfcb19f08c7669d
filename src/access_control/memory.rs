//! In-process access-control service.
//!
//! Implements the full [`AccessControl`] contract against in-memory tables.
//! Used by tests, the demo binary, and embedders that run the bus inside one
//! process.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::passwords::{PasswordValidator, StaticPasswords};
use super::{
    challenge_message, operation, AccessControl, HandoffGrant, HandoffMode, LeaseRenewal, LoginChallenge,
    LoginGrant,
};
use crate::chain::{CallChain, SignedCallChain};
use crate::config::AccessControlConfig;
use crate::credential::CredentialData;
use crate::crypto::backend::random_bytes;
use crate::crypto::signing::CHALLENGE_DOMAIN;
use crate::crypto::{
    generate_signing_keypair, verify_bytes, LoginPublicKey, Secret, SigningKey, VerifyingKey,
};
use crate::error::{BusError, BusResult};
use crate::identity::{BusInfo, LoginInfo};
use crate::session::InboundSessions;

/// Bus sessions are never evicted under normal load.
const MAX_BUS_SESSIONS: usize = 1 << 20;

#[derive(Clone)]
struct LoginRecord {
    info: LoginInfo,
    key: LoginPublicKey,
    expires_at: Instant,
    session: u32,
}

enum PendingProcess {
    Certificate {
        entity: String,
        challenge: [u8; 32],
        expires_at: Instant,
    },
    Handoff {
        entity: String,
        secret: Secret,
        mode: HandoffMode,
        origin: String,
        expires_at: Instant,
    },
}

impl PendingProcess {
    fn expires_at(&self) -> Instant {
        match self {
            Self::Certificate { expires_at, .. } | Self::Handoff { expires_at, .. } => *expires_at,
        }
    }
}

/// In-memory access-control service.
///
/// # Thread Safety
///
/// All tables are `DashMap`s; every operation is safe to call concurrently.
/// Expiry uses `tokio::time::Instant`, so paused-clock tests can drive
/// leases deterministically.
///
/// # Memory Usage
///
/// Logins that stop renewing, unanswered certificate challenges and
/// unredeemed handoffs are purged once expired. The purge runs at most once
/// per lease interval, from the operations that add entries, or on demand
/// through [`purge_expired`](Self::purge_expired).
pub struct InMemoryAccessControl {
    bus: BusInfo,
    signing_key: SigningKey,
    config: AccessControlConfig,
    passwords: Box<dyn PasswordValidator>,
    certificates: DashMap<String, VerifyingKey>,
    logins: DashMap<String, LoginRecord>,
    sessions: InboundSessions,
    processes: DashMap<String, PendingProcess>,
    last_purge: Mutex<Instant>,
}

impl InMemoryAccessControl {
    /// Create a service with a fresh bus key and the configured users.
    pub fn new(config: AccessControlConfig) -> Self {
        let (signing_key, _) = generate_signing_keypair();
        let passwords = StaticPasswords::from_entries(&config.users);
        Self::with_parts(config, signing_key, Box::new(passwords))
    }

    pub fn with_parts(
        config: AccessControlConfig,
        signing_key: SigningKey,
        passwords: Box<dyn PasswordValidator>,
    ) -> Self {
        let bus = BusInfo::new(config.bus_id.clone(), &signing_key.verifying_key());
        info!(bus = %bus.id, "access control ready");
        Self {
            bus,
            signing_key,
            config,
            passwords,
            certificates: DashMap::new(),
            logins: DashMap::new(),
            sessions: InboundSessions::new(MAX_BUS_SESSIONS),
            processes: DashMap::new(),
            last_purge: Mutex::new(Instant::now()),
        }
    }

    /// Convenience constructor returning an `Arc`.
    pub fn shared(config: AccessControlConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn bus_info(&self) -> &BusInfo {
        &self.bus
    }

    /// Register the public key an entity uses for certificate logins.
    pub fn register_certificate(&self, entity: &str, key: VerifyingKey) {
        self.certificates.insert(entity.to_string(), key);
    }

    pub fn remove_certificate(&self, entity: &str) {
        self.certificates.remove(entity);
    }

    pub fn is_logged_in(&self, login_id: &str) -> bool {
        self.logins
            .get(login_id)
            .is_some_and(|r| r.expires_at > Instant::now())
    }

    pub fn login_count(&self) -> usize {
        self.logins.len()
    }

    /// Certificate challenges and handoffs not yet redeemed.
    pub fn pending_process_count(&self) -> usize {
        self.processes.len()
    }

    /// Drop expired logins and login processes; returns how many went.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        *self.last_purge.lock() = now;

        let expired: Vec<String> = self
            .logins
            .iter()
            .filter(|r| r.expires_at <= now)
            .map(|r| r.key().clone())
            .collect();
        for login_id in &expired {
            if let Some((_, record)) = self.logins.remove(login_id) {
                self.sessions.discard(record.session, login_id);
                self.drop_processes_of(login_id);
                debug!(login = %record.info, "login expired");
            }
        }

        let before = self.processes.len();
        self.processes.retain(|_, p| p.expires_at() > now);
        let purged = expired.len() + before.saturating_sub(self.processes.len());
        if purged > 0 {
            debug!(purged, "expired entries purged");
        }
        purged
    }

    fn purge_if_due(&self) {
        let due = self.last_purge.lock().elapsed() >= self.config.lease();
        if due {
            self.purge_expired();
        }
    }

    /// Forcibly end a login, as an administrator would.
    pub fn invalidate_login(&self, login_id: &str) -> bool {
        match self.logins.remove(login_id) {
            Some((_, record)) => {
                self.sessions.discard(record.session, login_id);
                self.drop_processes_of(login_id);
                info!(login = %record.info, "login invalidated");
                true
            }
            None => false,
        }
    }

    fn grant_login(&self, entity: &str, login_key: &LoginPublicKey) -> BusResult<LoginGrant> {
        login_key.validate()?;
        self.purge_if_due();

        let info = LoginInfo::new(uuid::Uuid::new_v4().to_string(), entity);
        let (session, secret) = self.sessions.open(info.clone());
        let sealed_secret = login_key.seal(secret.as_bytes())?;
        let chain = CallChain::direct(&self.bus.id, &self.bus.id, info.clone(), *login_key)
            .sign(&self.signing_key)?;

        self.logins.insert(
            info.id.clone(),
            LoginRecord {
                info: info.clone(),
                key: *login_key,
                expires_at: Instant::now() + self.config.login_validity(),
                session,
            },
        );
        info!(login = %info, bus = %self.bus.id, "login granted");

        Ok(LoginGrant {
            login: info,
            bus: self.bus.clone(),
            lease_secs: self.config.lease_secs,
            session,
            sealed_secret,
            chain,
        })
    }

    /// Check a bus-session credential and return the caller's login record.
    fn authenticate(&self, credential: &CredentialData, operation: &str) -> BusResult<LoginRecord> {
        if credential.bus != self.bus.id {
            return Err(BusError::UnknownBus(credential.bus.clone()));
        }
        let record = self
            .logins
            .get(&credential.login)
            .map(|r| r.value().clone())
            .ok_or_else(|| BusError::InvalidLogin(credential.login.clone()))?;

        if record.expires_at <= Instant::now() {
            self.invalidate_login(&credential.login);
            return Err(BusError::InvalidLogin(credential.login.clone()));
        }

        self.sessions.validate(credential, operation).map_err(|e| {
            warn!(login = %record.info, operation, error = %e, "bus credential rejected");
            e
        })?;
        Ok(record)
    }

    fn drop_processes_of(&self, login_id: &str) {
        self.processes.retain(|_, p| match p {
            PendingProcess::Handoff { origin, .. } => origin.as_str() != login_id,
            PendingProcess::Certificate { .. } => true,
        });
    }

    fn chain_target_exists(&self, target: &str) -> bool {
        target == self.bus.id || self.is_logged_in(target)
    }
}

#[async_trait]
impl AccessControl for InMemoryAccessControl {
    async fn login_by_password(
        &self,
        entity: &str,
        password: &[u8],
        domain: &str,
        login_key: &LoginPublicKey,
    ) -> BusResult<LoginGrant> {
        if !self.passwords.validate(entity, password, domain) {
            warn!(entity, domain, "password login refused");
            return Err(BusError::AccessDenied(format!("bad credentials for '{entity}'")));
        }
        self.grant_login(entity, login_key)
    }

    async fn start_login_by_certificate(&self, entity: &str) -> BusResult<LoginChallenge> {
        if !self.certificates.contains_key(entity) {
            return Err(BusError::MissingCertificate(entity.to_string()));
        }
        self.purge_if_due();
        let process = uuid::Uuid::new_v4().to_string();
        let challenge: [u8; 32] = random_bytes();
        self.processes.insert(
            process.clone(),
            PendingProcess::Certificate {
                entity: entity.to_string(),
                challenge,
                expires_at: Instant::now() + self.config.challenge_ttl(),
            },
        );
        debug!(entity, %process, "certificate challenge issued");
        Ok(LoginChallenge { process, challenge })
    }

    async fn login_by_certificate(
        &self,
        process: &str,
        answer: &[u8],
        login_key: &LoginPublicKey,
    ) -> BusResult<LoginGrant> {
        let (entity, challenge, expires_at) = match self.processes.remove(process) {
            Some((_, PendingProcess::Certificate { entity, challenge, expires_at })) => {
                (entity, challenge, expires_at)
            }
            Some((key, other)) => {
                self.processes.insert(key, other);
                return Err(BusError::AccessDenied(format!("'{process}' is not a certificate login")));
            }
            None => return Err(BusError::AccessDenied(format!("unknown login process '{process}'"))),
        };
        if expires_at <= Instant::now() {
            return Err(BusError::AccessDenied("certificate challenge expired".into()));
        }
        let certificate = self
            .certificates
            .get(&entity)
            .map(|c| *c.value())
            .ok_or_else(|| BusError::MissingCertificate(entity.clone()))?;

        verify_bytes(
            &certificate,
            CHALLENGE_DOMAIN,
            &challenge_message(&challenge, login_key),
            answer,
        )
        .map_err(|_| {
            warn!(entity = %entity, "certificate challenge answer refused");
            BusError::AccessDenied(format!("bad challenge answer for '{entity}'"))
        })?;

        self.grant_login(&entity, login_key)
    }

    async fn start_shared_auth(&self, credential: &CredentialData, mode: HandoffMode) -> BusResult<HandoffGrant> {
        let record = self.authenticate(credential, operation::START_SHARED_AUTH)?;
        self.purge_if_due();
        let process = uuid::Uuid::new_v4().to_string();
        let secret = Secret::generate();
        let sealed_secret = record.key.seal(secret.as_bytes())?;
        let ttl = self.config.shared_auth_ttl();

        self.processes.insert(
            process.clone(),
            PendingProcess::Handoff {
                entity: record.info.entity.clone(),
                secret,
                mode,
                origin: record.info.id.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        info!(login = %record.info, %process, ?mode, "handoff started");
        Ok(HandoffGrant {
            process,
            mode,
            sealed_secret,
            expires_in_secs: self.config.shared_auth_ttl_secs,
        })
    }

    async fn login_by_shared_auth(
        &self,
        process: &str,
        secret: &Secret,
        login_key: &LoginPublicKey,
    ) -> BusResult<LoginGrant> {
        let now = Instant::now();
        let mode = match self.processes.get(process).map(|p| match p.value() {
            PendingProcess::Handoff { mode, .. } => Some(*mode),
            PendingProcess::Certificate { .. } => None,
        }) {
            Some(Some(mode)) => mode,
            _ => return Err(BusError::InvalidSharedAuth(format!("unknown process '{process}'"))),
        };

        let entity = match mode {
            HandoffMode::SharedAuth => {
                // Consumed by the first redemption attempt, right or wrong.
                let Some((_, PendingProcess::Handoff { entity, secret: expected, expires_at, .. })) =
                    self.processes.remove(process)
                else {
                    return Err(BusError::InvalidSharedAuth(format!("process '{process}' already redeemed")));
                };
                if expires_at <= now {
                    return Err(BusError::InvalidSharedAuth(format!("process '{process}' expired")));
                }
                if !expected.ct_eq(secret) {
                    return Err(BusError::AccessDenied("shared authentication secret mismatch".into()));
                }
                entity
            }
            HandoffMode::SingleSignOn => {
                let (entity, expected, origin, expires_at) = match self.processes.get(process).as_deref() {
                    Some(PendingProcess::Handoff { entity, secret, origin, expires_at, .. }) => {
                        (entity.clone(), secret.clone(), origin.clone(), *expires_at)
                    }
                    _ => return Err(BusError::InvalidSharedAuth(format!("unknown process '{process}'"))),
                };
                if expires_at <= now || !self.is_logged_in(&origin) {
                    self.processes.remove(process);
                    return Err(BusError::InvalidSharedAuth(format!("process '{process}' expired")));
                }
                if !expected.ct_eq(secret) {
                    return Err(BusError::AccessDenied("single sign-on secret mismatch".into()));
                }
                entity
            }
        };

        self.grant_login(&entity, login_key)
    }

    async fn cancel_shared_auth(&self, credential: &CredentialData, process: &str) -> BusResult<()> {
        let record = self.authenticate(credential, operation::CANCEL_SHARED_AUTH)?;
        let removed = self.processes.remove_if(process, |_, p| {
            matches!(p, PendingProcess::Handoff { origin, .. } if *origin == record.info.id)
        });
        if removed.is_none() {
            return Err(BusError::InvalidSharedAuth(format!("no pending process '{process}'")));
        }
        debug!(login = %record.info, %process, "handoff cancelled");
        Ok(())
    }

    async fn renew_lease(&self, credential: &CredentialData) -> BusResult<LeaseRenewal> {
        let record = self.authenticate(credential, operation::RENEW_LEASE)?;
        match self.logins.get_mut(&record.info.id) {
            Some(mut entry) => {
                entry.expires_at = Instant::now() + self.config.login_validity();
                debug!(login = %record.info, lease = self.config.lease_secs, "lease renewed");
                Ok(LeaseRenewal::Renewed(self.config.lease_secs))
            }
            None => Ok(LeaseRenewal::NotRenewed),
        }
    }

    async fn sign_chain_for(
        &self,
        credential: &CredentialData,
        target: &str,
        joined: Option<&SignedCallChain>,
    ) -> BusResult<SignedCallChain> {
        let record = self.authenticate(credential, operation::SIGN_CHAIN_FOR)?;
        if !self.chain_target_exists(target) {
            return Err(BusError::InvalidTarget(target.to_string()));
        }

        let chain = match joined {
            None => CallChain::direct(&self.bus.id, target, record.info.clone(), record.key),
            Some(joined) => {
                let joined = joined.verify(&self.signing_key.verifying_key())?;
                if joined.bus != self.bus.id {
                    return Err(BusError::InvalidChain(format!("chain issued by bus '{}'", joined.bus)));
                }
                if joined.target != record.info.id {
                    return Err(BusError::InvalidChain(format!(
                        "joined chain is addressed to '{}', not '{}'",
                        joined.target, record.info.id
                    )));
                }
                CallChain::delegated(&joined, target, record.info.clone(), record.key)
            }
        };
        debug!(
            login = %record.info,
            target,
            originators = chain.originators.len(),
            "chain signed"
        );
        chain.sign(&self.signing_key)
    }

    async fn logout(&self, credential: &CredentialData) -> BusResult<()> {
        let record = self.authenticate(credential, operation::LOGOUT)?;
        self.invalidate_login(&record.info.id);
        info!(login = %record.info, "logged out");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_control::answer_challenge;
    use crate::config::UserEntry;
    use crate::crypto::LoginKeyPair;
    use crate::session::CredentialSession;

    fn service() -> InMemoryAccessControl {
        InMemoryAccessControl::new(AccessControlConfig {
            bus_id: "bus-1".into(),
            users: vec![UserEntry {
                entity: "alice".into(),
                password: "pw".into(),
                domain: None,
            }],
            ..AccessControlConfig::default()
        })
    }

    fn bus_session(grant: &LoginGrant, keys: &LoginKeyPair) -> BusResult<CredentialSession> {
        let secret = Secret::from_slice(&keys.open(&grant.sealed_secret)?)?;
        Ok(CredentialSession::new(grant.bus.login(), grant.session, secret, grant.chain.clone(), 4))
    }

    #[tokio::test]
    async fn test_password_login_and_renew() -> BusResult<()> {
        let ac = service();
        let keys = LoginKeyPair::generate();
        let grant = ac.login_by_password("alice", b"pw", "", &keys.public_key()).await?;
        assert_eq!(grant.login.entity, "alice");
        assert!(ac.is_logged_in(&grant.login.id));

        let session = bus_session(&grant, &keys)?;
        let cred = session.stamp("bus-1", &grant.login.id, operation::RENEW_LEASE, None)?;
        assert_eq!(ac.renew_lease(&cred).await?, LeaseRenewal::Renewed(grant.lease_secs));

        // replaying the same credential fails
        assert!(ac.renew_lease(&cred).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_bad_password_denied() {
        let ac = service();
        let keys = LoginKeyPair::generate();
        let result = ac.login_by_password("alice", b"nope", "", &keys.public_key()).await;
        assert!(matches!(result, Err(BusError::AccessDenied(_))));
    }

    #[tokio::test]
    async fn test_certificate_login() -> BusResult<()> {
        let ac = service();
        let (entity_key, entity_pub) = generate_signing_keypair();
        let keys = LoginKeyPair::generate();

        assert!(matches!(
            ac.start_login_by_certificate("svc").await,
            Err(BusError::MissingCertificate(_))
        ));

        ac.register_certificate("svc", entity_pub);
        let challenge = ac.start_login_by_certificate("svc").await?;
        let answer = answer_challenge(&entity_key, &challenge.challenge, &keys.public_key());
        let grant = ac.login_by_certificate(&challenge.process, &answer, &keys.public_key()).await?;
        assert_eq!(grant.login.entity, "svc");

        // process is single use
        assert!(ac
            .login_by_certificate(&challenge.process, &answer, &keys.public_key())
            .await
            .is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_certificate_answer_bound_to_login_key() -> BusResult<()> {
        let ac = service();
        let (entity_key, entity_pub) = generate_signing_keypair();
        ac.register_certificate("svc", entity_pub);

        let challenge = ac.start_login_by_certificate("svc").await?;
        let honest = LoginKeyPair::generate();
        let attacker = LoginKeyPair::generate();
        let answer = answer_challenge(&entity_key, &challenge.challenge, &honest.public_key());
        let result = ac
            .login_by_certificate(&challenge.process, &answer, &attacker.public_key())
            .await;
        assert!(matches!(result, Err(BusError::AccessDenied(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_sign_chain_rejects_foreign_joined_chain() -> BusResult<()> {
        let ac = service();
        let a_keys = LoginKeyPair::generate();
        let b_keys = LoginKeyPair::generate();
        let a = ac.login_by_password("alice", b"pw", "", &a_keys.public_key()).await?;
        let b = ac.login_by_password("alice", b"pw", "", &b_keys.public_key()).await?;

        // alice(a) gets a chain addressed to b, then tries to join it herself
        let a_session = bus_session(&a, &a_keys)?;
        let cred = a_session.stamp("bus-1", &a.login.id, operation::SIGN_CHAIN_FOR, None)?;
        let chain_for_b = ac.sign_chain_for(&cred, &b.login.id, None).await?;

        let cred = a_session.stamp("bus-1", &a.login.id, operation::SIGN_CHAIN_FOR, None)?;
        let result = ac.sign_chain_for(&cred, &b.login.id, Some(&chain_for_b)).await;
        assert!(matches!(result, Err(BusError::InvalidChain(_))));

        let cred = a_session.stamp("bus-1", &a.login.id, operation::SIGN_CHAIN_FOR, None)?;
        let result = ac.sign_chain_for(&cred, "no-such-login", None).await;
        assert!(matches!(result, Err(BusError::InvalidTarget(_))));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_expires_without_renewal() -> BusResult<()> {
        let ac = service();
        let keys = LoginKeyPair::generate();
        let grant = ac.login_by_password("alice", b"pw", "", &keys.public_key()).await?;
        let session = bus_session(&grant, &keys)?;

        tokio::time::advance(ac.config.login_validity() + std::time::Duration::from_secs(1)).await;

        let cred = session.stamp("bus-1", &grant.login.id, operation::RENEW_LEASE, None)?;
        assert!(matches!(ac.renew_lease(&cred).await, Err(BusError::InvalidLogin(_))));
        assert!(!ac.is_logged_in(&grant.login.id));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_purged() -> BusResult<()> {
        let ac = service();
        let (_, entity_pub) = generate_signing_keypair();
        ac.register_certificate("svc", entity_pub);

        let keys = LoginKeyPair::generate();
        let idle = ac.login_by_password("alice", b"pw", "", &keys.public_key()).await?;
        let session = bus_session(&idle, &keys)?;
        let cred = session.stamp("bus-1", &idle.login.id, operation::START_SHARED_AUTH, None)?;
        ac.start_shared_auth(&cred, HandoffMode::SharedAuth).await?;
        ac.start_login_by_certificate("svc").await?;
        assert_eq!(ac.login_count(), 1);
        assert_eq!(ac.pending_process_count(), 2);

        // nobody renews, answers or redeems
        tokio::time::advance(ac.config.login_validity() + ac.config.lease()).await;

        let fresh = ac.login_by_password("alice", b"pw", "", &keys.public_key()).await?;
        assert_eq!(ac.login_count(), 1);
        assert!(ac.is_logged_in(&fresh.login.id));
        assert!(!ac.is_logged_in(&idle.login.id));
        assert_eq!(ac.pending_process_count(), 0);
        assert_eq!(ac.purge_expired(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_keeps_live_entries() -> BusResult<()> {
        let ac = service();
        let keys = LoginKeyPair::generate();
        let grant = ac.login_by_password("alice", b"pw", "", &keys.public_key()).await?;
        let session = bus_session(&grant, &keys)?;
        let cred = session.stamp("bus-1", &grant.login.id, operation::START_SHARED_AUTH, None)?;
        ac.start_shared_auth(&cred, HandoffMode::SingleSignOn).await?;

        tokio::time::advance(ac.config.lease()).await;
        let cred = session.stamp("bus-1", &grant.login.id, operation::RENEW_LEASE, None)?;
        ac.renew_lease(&cred).await?;

        // past the handoff TTL but within the renewed lease
        tokio::time::advance(ac.config.lease()).await;
        assert_eq!(ac.purge_expired(), 1);
        assert!(ac.is_logged_in(&grant.login.id));
        assert_eq!(ac.pending_process_count(), 0);
        Ok(())
    }
}
