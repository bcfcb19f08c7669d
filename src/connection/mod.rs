//! Bus connections and the login state machine.
//!
//! A [`Connection`] is one logical login to one bus. A process may hold
//! many, each with its own credential sessions, lease renewer and login key.
//!
//! # States
//!
//! ```text
//!             login_*             grant
//! Unlogged ───────────▶ LoggingIn ──────▶ LoggedIn ──logout──▶ Unlogged
//!     ▲                     │                 │
//!     └──── failure/drop ───┘                 │ lease refused / login rejected
//!                                             ▼
//!                        Invalid ──login_*──▶ LoggingIn
//! ```
//!
//! `LoggingIn` makes concurrent logins fail fast with `AlreadyLoggedIn`.
//! Dropping a login future mid-flight restores the previous state.

mod bus_channel;
mod shared_auth;

pub use shared_auth::SharedAuthSecret;

use parking_lot::Mutex;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::access_control::{answer_challenge, AccessControl, HandoffMode, LoginGrant};
use crate::chain::{CallerChain, SignedCallChain};
use crate::config::ConnectionConfig;
use crate::credential::{CredentialData, CredentialReset, FIRST_CONTACT_SESSION};
use crate::crypto::{LoginKeyPair, LoginPublicKey, Secret, SigningKey, VerifyingKey};
use crate::error::{BusError, BusResult, RejectCode};
use crate::identity::{BusInfo, LoginInfo};
use crate::interceptor::Rejection;
use crate::lease::{LeaseRenewer, RenewerState};
use crate::session::{CredentialSession, InboundSessions, OutboundSessions};
use bus_channel::BusChannel;

/// Observable login state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    Unlogged,
    LoggingIn,
    LoggedIn,
    Invalid,
}

/// Callback fired once each time a login becomes invalid.
///
/// Runs on the task that detected the failure, with no connection lock
/// held. It may call any `Connection` method; async ones (relogin,
/// `logout`) have to be spawned.
pub type InvalidLoginCallback = Arc<dyn Fn(&Connection, &LoginInfo) + Send + Sync>;

/// Notified when a connection gains or loses its login.
pub trait LoginObserver: Send + Sync {
    fn logged_in(&self, connection: &Connection, login: &LoginInfo, bus_id: &str);
    fn logged_out(&self, connection: &Connection, login: &LoginInfo, bus_id: &str);
}

/// Everything that exists only while logged in.
struct ActiveLogin {
    info: LoginInfo,
    bus: BusInfo,
    bus_key: VerifyingKey,
    keys: LoginKeyPair,
    login_chain: SignedCallChain,
    channel: Arc<BusChannel>,
    renewer: LeaseRenewer,
}

enum Slot {
    Unlogged,
    LoggingIn { previous: Option<LoginInfo> },
    LoggedIn(Arc<ActiveLogin>),
    Invalid(LoginInfo),
}

impl Slot {
    fn state(&self) -> LoginState {
        match self {
            Self::Unlogged => LoginState::Unlogged,
            Self::LoggingIn { .. } => LoginState::LoggingIn,
            Self::LoggedIn(_) => LoginState::LoggedIn,
            Self::Invalid(_) => LoginState::Invalid,
        }
    }
}

struct ConnectionInner {
    id: String,
    access: Arc<dyn AccessControl>,
    config: ConnectionConfig,
    slot: Mutex<Slot>,
    outbound: OutboundSessions,
    inbound: InboundSessions,
    on_invalid_login: Mutex<Option<InvalidLoginCallback>>,
    observers: Mutex<Vec<Weak<dyn LoginObserver>>>,
}

/// One logical login to a bus.
///
/// Cheap to clone; clones share the same login.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

/// Reverts `LoggingIn` unless the login completed.
struct LoginAttempt<'a> {
    connection: &'a Connection,
    previous: Option<LoginInfo>,
    armed: bool,
}

impl Drop for LoginAttempt<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slot = self.connection.inner.slot.lock();
        if matches!(*slot, Slot::LoggingIn { .. }) {
            *slot = match self.previous.take() {
                Some(info) => Slot::Invalid(info),
                None => Slot::Unlogged,
            };
            debug!(connection = %self.connection.inner.id, "login attempt abandoned");
        }
    }
}

impl Connection {
    pub fn new(access: Arc<dyn AccessControl>, config: ConnectionConfig) -> Self {
        let inner = ConnectionInner {
            id: uuid::Uuid::new_v4().to_string(),
            access,
            outbound: OutboundSessions::new(config.max_outbound_sessions),
            inbound: InboundSessions::new(config.max_inbound_sessions),
            config,
            slot: Mutex::new(Slot::Unlogged),
            on_invalid_login: Mutex::new(None),
            observers: Mutex::new(Vec::new()),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Process-unique identifier, for logs.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> LoginState {
        self.inner.slot.lock().state()
    }

    /// Current login, if logged in.
    pub fn login(&self) -> Option<LoginInfo> {
        self.active().ok().map(|a| a.info.clone())
    }

    /// Bus this connection is logged into.
    pub fn bus(&self) -> Option<BusInfo> {
        self.active().ok().map(|a| a.bus.clone())
    }

    pub fn bus_id(&self) -> Option<String> {
        self.active().ok().map(|a| a.bus.id.clone())
    }

    /// Whether two handles refer to the same connection.
    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// State of the lease renewer, if logged in.
    pub fn renewer_state(&self) -> Option<RenewerState> {
        self.active().ok().map(|a| a.renewer.state())
    }

    pub fn on_invalid_login<F>(&self, callback: F)
    where
        F: Fn(&Connection, &LoginInfo) + Send + Sync + 'static,
    {
        *self.inner.on_invalid_login.lock() = Some(Arc::new(callback));
    }

    pub fn subscribe(&self, observer: Weak<dyn LoginObserver>) {
        self.inner.observers.lock().push(observer);
    }

    // ========================================================================
    // Login
    // ========================================================================

    pub async fn login_by_password(&self, entity: &str, password: &[u8], domain: &str) -> BusResult<()> {
        let access = Arc::clone(&self.inner.access);
        self.login_with(|key| async move { access.login_by_password(entity, password, domain, &key).await })
            .await
    }

    /// Log in by answering a challenge with the entity's private key.
    pub async fn login_by_private_key(&self, entity: &str, private_key: &SigningKey) -> BusResult<()> {
        let access = Arc::clone(&self.inner.access);
        self.login_with(|key| async move {
            let challenge = access.start_login_by_certificate(entity).await?;
            let answer = answer_challenge(private_key, &challenge.challenge, &key);
            access.login_by_certificate(&challenge.process, &answer, &key).await
        })
        .await
    }

    /// Redeem a secret from [`start_shared_auth`](Self::start_shared_auth)
    /// or [`start_single_sign_on`](Self::start_single_sign_on).
    pub async fn login_by_shared_auth(&self, secret: &SharedAuthSecret) -> BusResult<()> {
        let access = Arc::clone(&self.inner.access);
        self.login_with(|key| async move {
            let grant = access
                .login_by_shared_auth(secret.process(), secret.secret(), &key)
                .await?;
            if grant.bus.id != secret.bus_id() {
                return Err(BusError::InvalidSharedAuth(format!(
                    "secret issued by bus '{}', redeemed at '{}'",
                    secret.bus_id(),
                    grant.bus.id
                )));
            }
            Ok(grant)
        })
        .await
    }

    pub async fn login_by_single_sign_on(&self, secret: &SharedAuthSecret) -> BusResult<()> {
        if secret.mode() != HandoffMode::SingleSignOn {
            return Err(BusError::InvalidSharedAuth("not a single sign-on secret".into()));
        }
        self.login_by_shared_auth(secret).await
    }

    async fn login_with<F, Fut>(&self, request: F) -> BusResult<()>
    where
        F: FnOnce(LoginPublicKey) -> Fut,
        Fut: Future<Output = BusResult<LoginGrant>>,
    {
        let attempt = self.begin_login()?;
        let keys = LoginKeyPair::generate();
        let grant = request(keys.public_key()).await?;
        self.complete_login(attempt, grant, keys)
    }

    fn begin_login(&self) -> BusResult<LoginAttempt<'_>> {
        let mut slot = self.inner.slot.lock();
        let previous = match &*slot {
            Slot::Unlogged => None,
            Slot::Invalid(info) => Some(info.clone()),
            Slot::LoggingIn { .. } | Slot::LoggedIn(_) => return Err(BusError::AlreadyLoggedIn),
        };
        *slot = Slot::LoggingIn {
            previous: previous.clone(),
        };
        Ok(LoginAttempt {
            connection: self,
            previous,
            armed: true,
        })
    }

    fn complete_login(&self, mut attempt: LoginAttempt<'_>, grant: LoginGrant, keys: LoginKeyPair) -> BusResult<()> {
        let secret = Secret::from_slice(&keys.open(&grant.sealed_secret)?)?;
        let bus_key = grant.bus.verifying_key()?;
        let login_chain = grant
            .chain
            .verify(&bus_key)
            .map_err(|e| BusError::InvalidRemote(format!("login chain: {e}")))?;
        if login_chain.caller != grant.login || login_chain.caller_key != keys.public_key() {
            return Err(BusError::InvalidRemote("login chain does not name this login".into()));
        }

        let session = CredentialSession::new(
            grant.bus.login(),
            grant.session,
            secret,
            grant.chain.clone(),
            self.inner.config.max_joined_chains,
        );
        let channel = Arc::new(BusChannel::new(
            Arc::clone(&self.inner.access),
            grant.bus.id.clone(),
            grant.login.id.clone(),
            session,
        ));

        let weak = Arc::downgrade(&self.inner);
        let login_id = grant.login.id.clone();
        let renewer = LeaseRenewer::start(
            channel.clone(),
            Duration::from_secs(u64::from(grant.lease_secs)),
            move |expiry| {
                if let Some(inner) = weak.upgrade() {
                    Connection { inner }.mark_invalid(&login_id, &format!("lease ended: {expiry:?}"));
                }
            },
        );

        let active = Arc::new(ActiveLogin {
            info: grant.login,
            bus: grant.bus,
            bus_key,
            keys,
            login_chain: grant.chain,
            channel,
            renewer,
        });

        self.inner.outbound.clear();
        self.inner.inbound.clear();
        *self.inner.slot.lock() = Slot::LoggedIn(Arc::clone(&active));
        attempt.armed = false;

        info!(
            connection = %self.inner.id,
            login = %active.info,
            bus = %active.bus.id,
            "logged in"
        );
        self.notify(|o| o.logged_in(self, &active.info, &active.bus.id));
        Ok(())
    }

    // ========================================================================
    // Logout / invalidation
    // ========================================================================

    /// End the login.
    ///
    /// Local state is torn down synchronously (renewer stopped, sessions
    /// dropped) before the access-control service is told; a failure to
    /// reach the service is logged, not returned. Returns `false` if there
    /// was no login to end. From `Invalid` this only resets to `Unlogged`.
    pub async fn logout(&self) -> BusResult<bool> {
        let active = {
            let mut slot = self.inner.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Unlogged) {
                Slot::LoggedIn(active) => active,
                Slot::Invalid(info) => {
                    debug!(connection = %self.inner.id, login = %info, "clearing invalid login");
                    return Ok(false);
                }
                other => {
                    *slot = other;
                    return Ok(false);
                }
            }
        };

        active.renewer.stop();
        self.inner.outbound.clear();
        self.inner.inbound.clear();
        self.notify(|o| o.logged_out(self, &active.info, &active.bus.id));
        info!(connection = %self.inner.id, login = %active.info, "logged out");

        if let Err(e) = active.channel.logout().await {
            warn!(login = %active.info, error = %e, "access control did not acknowledge logout");
        }
        Ok(true)
    }

    /// Move `login_id` from `LoggedIn` to `Invalid`.
    ///
    /// No-op if the connection is not (or no longer) logged in as
    /// `login_id`, so each login is invalidated at most once.
    pub(crate) fn mark_invalid(&self, login_id: &str, reason: &str) {
        let active = {
            let mut slot = self.inner.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Unlogged) {
                Slot::LoggedIn(active) if active.info.id == login_id => {
                    *slot = Slot::Invalid(active.info.clone());
                    active
                }
                other => {
                    *slot = other;
                    return;
                }
            }
        };

        active.renewer.stop();
        self.inner.outbound.clear();
        self.inner.inbound.clear();
        warn!(connection = %self.inner.id, login = %active.info, reason, "login invalid");
        self.notify(|o| o.logged_out(self, &active.info, &active.bus.id));

        let callback = self.inner.on_invalid_login.lock().clone();
        if let Some(callback) = callback {
            callback(self, &active.info);
        }
    }

    fn notify(&self, f: impl Fn(&dyn LoginObserver)) {
        let observers: Vec<Arc<dyn LoginObserver>> = {
            let mut list = self.inner.observers.lock();
            list.retain(|w| w.strong_count() > 0);
            list.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in observers {
            f(observer.as_ref());
        }
    }

    fn active(&self) -> BusResult<Arc<ActiveLogin>> {
        match &*self.inner.slot.lock() {
            Slot::LoggedIn(active) => Ok(Arc::clone(active)),
            _ => Err(BusError::NoLogin),
        }
    }

    /// Run a call on the bus channel; a login failure invalidates this login.
    async fn bus_call<T>(&self, active: &ActiveLogin, call: impl Future<Output = BusResult<T>>) -> BusResult<T> {
        call.await.map_err(|e| {
            if matches!(e, BusError::InvalidLogin(_) | BusError::NoLogin) {
                self.mark_invalid(&active.info.id, &e.to_string());
            }
            e
        })
    }

    // ========================================================================
    // Shared authentication
    // ========================================================================

    /// Create a one-time secret another process can log in with.
    pub async fn start_shared_auth(&self) -> BusResult<SharedAuthSecret> {
        self.start_handoff(HandoffMode::SharedAuth).await
    }

    /// Create a reusable single sign-on secret, valid until it expires or
    /// this login ends.
    pub async fn start_single_sign_on(&self) -> BusResult<SharedAuthSecret> {
        self.start_handoff(HandoffMode::SingleSignOn).await
    }

    async fn start_handoff(&self, mode: HandoffMode) -> BusResult<SharedAuthSecret> {
        let active = self.active()?;
        let grant = self.bus_call(&active, active.channel.start_shared_auth(mode)).await?;
        let secret = Secret::from_slice(&active.keys.open(&grant.sealed_secret)?)?;
        debug!(login = %active.info, process = %grant.process, ?mode, "handoff secret created");
        Ok(SharedAuthSecret::new(active.bus.id.clone(), grant.process, secret, mode))
    }

    pub async fn cancel_shared_auth(&self, secret: &SharedAuthSecret) -> BusResult<()> {
        let active = self.active()?;
        self.bus_call(&active, active.channel.cancel_shared_auth(secret.process()))
            .await
    }

    // ========================================================================
    // Outgoing calls
    // ========================================================================

    /// Chain to present to `endpoint` for a call made under `joined`.
    ///
    /// `None` means the session's default chain (or the login chain on
    /// first contact). A chain for a joined caller is requested from the
    /// access-control service once per session and cached.
    pub(crate) async fn chain_for_call(
        &self,
        endpoint: &str,
        joined: Option<&CallerChain>,
    ) -> BusResult<Option<SignedCallChain>> {
        let Some(joined) = joined else {
            return Ok(None);
        };
        let active = self.active()?;
        let Some(session) = self.inner.outbound.get(endpoint) else {
            return Ok(None);
        };
        let key = joined.signed().signature();
        if let Some(chain) = session.joined_chain(key) {
            return Ok(Some(chain));
        }
        let chain = self
            .bus_call(
                &active,
                active.channel.sign_chain_for(&session.target().id, Some(joined.signed())),
            )
            .await?;
        session.remember_joined_chain(key, chain.clone());
        Ok(Some(chain))
    }

    /// Build the credential for one call to `endpoint`.
    ///
    /// Synchronous: reads the session table and advances the ticket.
    pub(crate) fn stamp(
        &self,
        endpoint: &str,
        operation: &str,
        chain: Option<&SignedCallChain>,
    ) -> BusResult<CredentialData> {
        let active = self.active()?;
        match self.inner.outbound.get(endpoint) {
            Some(session) => session.stamp(&active.bus.id, &active.info.id, operation, chain),
            None => Ok(CredentialData::first_contact(
                &active.bus.id,
                &active.info.id,
                active.login_chain.clone(),
            )),
        }
    }

    /// Install the session offered by a reset reply from `endpoint`.
    pub(crate) async fn accept_reset(&self, endpoint: &str, reset: &CredentialReset) -> BusResult<()> {
        let active = self.active()?;
        let secret = active
            .keys
            .open(&reset.challenge)
            .and_then(|s| Secret::from_slice(&s))
            .map_err(|e| BusError::InvalidRemote(format!("reset challenge: {e}")))?;
        let chain = self
            .bus_call(&active, active.channel.sign_chain_for(&reset.target.id, None))
            .await?;

        // A relogin while the chain was being signed makes this reset stale.
        if !self.active().is_ok_and(|current| Arc::ptr_eq(&current, &active)) {
            return Err(BusError::NoLogin);
        }
        let session = CredentialSession::new(
            reset.target.clone(),
            reset.session,
            secret,
            chain,
            self.inner.config.max_joined_chains,
        );
        self.inner.outbound.install(endpoint, Arc::new(session));
        Ok(())
    }

    /// Gate ordering calls to `endpoint` around session resets.
    pub(crate) fn session_gate(&self, endpoint: &str) -> Arc<tokio::sync::RwLock<()>> {
        self.inner.outbound.gate(endpoint)
    }

    /// Session id the next call to `endpoint` presents.
    pub(crate) fn presented_session(&self, endpoint: &str) -> u32 {
        self.inner
            .outbound
            .session_id(endpoint)
            .unwrap_or(FIRST_CONTACT_SESSION)
    }

    pub fn outbound_session_count(&self) -> usize {
        self.inner.outbound.len()
    }

    // ========================================================================
    // Incoming calls
    // ========================================================================

    /// Validate an inbound credential for `operation`.
    ///
    /// On success returns the verified caller chain. A session mismatch, or
    /// a chain addressed to a previous login of this connection, yields an
    /// `InvalidCredential` rejection carrying a reset. The reset offers a
    /// pending session; the session the credential presented stays valid
    /// until the caller uses the new one.
    pub(crate) fn validate_inbound(&self, credential: &CredentialData, operation: &str) -> Result<CallerChain, Rejection> {
        let active = self
            .active()
            .map_err(|_| Rejection::new(RejectCode::UnknownBus, "connection is not logged in"))?;
        if credential.bus != active.bus.id {
            return Err(Rejection::new(
                RejectCode::UnknownBus,
                format!("credential for bus '{}'", credential.bus),
            ));
        }

        let caller_chain = CallerChain::verified(credential.chain.clone(), &active.bus_key)
            .map_err(|e| Rejection::from_error(&e))?;
        if caller_chain.caller().id != credential.login || caller_chain.bus_id() != active.bus.id {
            return Err(Rejection::new(
                RejectCode::InvalidChain,
                "chain does not belong to the credential's login",
            ));
        }

        if caller_chain.target() == active.info.id {
            match self.inner.inbound.validate(credential, operation) {
                Ok(_) => return Ok(caller_chain),
                Err(e) => debug!(
                    login = %active.info,
                    caller = %caller_chain.caller(),
                    error = %e,
                    "credential rejected, offering reset"
                ),
            }
        } else if credential.session != FIRST_CONTACT_SESSION {
            debug!(
                login = %active.info,
                caller = %caller_chain.caller(),
                addressed_to = caller_chain.target(),
                "chain addressed to another login, offering reset"
            );
        }

        let (session, secret) = self.inner.inbound.reset(caller_chain.caller(), credential.session);
        let challenge = caller_chain
            .chain()
            .caller_key
            .seal(secret.as_bytes())
            .map_err(|e| Rejection::from_error(&e))?;
        Err(Rejection::reset(CredentialReset::new(active.info.clone(), session, challenge)))
    }

    pub fn inbound_session_count(&self) -> usize {
        self.inner.inbound.len()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("login", &self.login())
            .finish()
    }
}
