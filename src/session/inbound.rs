//! Target side of credential sessions.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::credential::{authenticator, CredentialData, FIRST_CONTACT_SESSION};
use crate::crypto::{mac_eq, Secret};
use crate::error::{BusError, BusResult};
use crate::identity::LoginInfo;

/// Replacement sessions one caller login may have pending at a time.
pub const MAX_PENDING_RESETS: usize = 4;

/// One session a caller holds with this process.
pub struct InboundSession {
    id: u32,
    caller: LoginInfo,
    secret: Secret,
    /// Session this one was offered in place of, retired on first use.
    replaces: Option<u32>,
    /// Last accepted ticket.
    watermark: Mutex<u32>,
}

impl InboundSession {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn caller(&self) -> &LoginInfo {
        &self.caller
    }

    pub fn watermark(&self) -> u32 {
        *self.watermark.lock()
    }
}

/// Reset offered to a caller and not yet used.
#[derive(Debug, Clone, Copy)]
struct PendingReset {
    replaces: Option<u32>,
    session: u32,
}

/// Sessions opened by this process for its callers.
///
/// # Replay Protection
///
/// A credential is accepted only if its ticket is strictly greater than the
/// session's watermark. The watermark is advanced under the session's mutex
/// and only after the authenticator has been verified, so a forged or
/// failed credential never moves it.
///
/// # Resets
///
/// A rejected credential never tears down the session it presented.
/// [`reset`](Self::reset) opens a pending replacement instead, shared by
/// every rejection of the same presented session, and the presented session
/// is retired only once the replacement accepts its first ticket. Each
/// caller login has at most [`MAX_PENDING_RESETS`] pending replacements.
///
/// # Memory Usage
///
/// At most `max_sessions` sessions are stored. When the limit is exceeded
/// the oldest (lowest id) half is evicted; their callers reset on the next
/// call.
pub struct InboundSessions {
    sessions: DashMap<u32, Arc<InboundSession>>,
    pending: DashMap<String, Vec<PendingReset>>,
    next_id: AtomicU32,
    max_sessions: usize,
}

impl InboundSessions {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            pending: DashMap::new(),
            next_id: AtomicU32::new(FIRST_CONTACT_SESSION + 1),
            max_sessions: max_sessions.max(1),
        }
    }

    /// Open a new session for `caller` and return its id and secret.
    ///
    /// Session ids are never reused within the lifetime of this table.
    pub fn open(&self, caller: LoginInfo) -> (u32, Secret) {
        self.open_session(caller, None)
    }

    /// Session to offer `caller` after rejecting a credential that presented
    /// session `presented`.
    ///
    /// Returns the pending replacement for `presented` if there is one,
    /// otherwise opens it. The oldest pending replacement of the caller is
    /// dropped when the caller already has [`MAX_PENDING_RESETS`].
    pub fn reset(&self, caller: &LoginInfo, presented: u32) -> (u32, Secret) {
        let replaces = self
            .sessions
            .get(&presented)
            .filter(|s| s.caller.id == caller.id)
            .map(|s| s.id);

        let mut pending = self.pending.entry(caller.id.clone()).or_default();
        let offered = pending
            .iter()
            .find(|p| p.replaces == replaces)
            .and_then(|p| self.sessions.get(&p.session).map(|s| Arc::clone(s.value())));
        if let Some(session) = offered.filter(|s| s.watermark() == 0) {
            trace!(session = session.id, caller = %caller, "reusing pending reset");
            return (session.id, session.secret.clone());
        }

        pending.retain(|p| p.replaces != replaces && self.sessions.contains_key(&p.session));
        if pending.len() >= MAX_PENDING_RESETS {
            let dropped = pending.remove(0);
            self.sessions.remove(&dropped.session);
            debug!(session = dropped.session, caller = %caller, "dropping oldest pending reset");
        }
        let (id, secret) = self.open_session(caller.clone(), replaces);
        pending.push(PendingReset { replaces, session: id });
        (id, secret)
    }

    fn open_session(&self, caller: LoginInfo, replaces: Option<u32>) -> (u32, Secret) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let secret = Secret::generate();
        debug!(session = id, caller = %caller, ?replaces, "opening inbound session");
        self.sessions.insert(
            id,
            Arc::new(InboundSession {
                id,
                caller,
                secret: secret.clone(),
                replaces,
                watermark: Mutex::new(0),
            }),
        );
        if self.sessions.len() > self.max_sessions {
            self.evict_oldest();
        }
        (id, secret)
    }

    /// First ticket accepted on `session`: it is no longer pending, and the
    /// session it replaces is retired.
    fn confirm(&self, session: &InboundSession) {
        if let Some(mut pending) = self.pending.get_mut(&session.caller.id) {
            pending.retain(|p| p.session != session.id);
        }
        self.pending.remove_if(&session.caller.id, |_, p| p.is_empty());
        if let Some(old) = session.replaces {
            self.discard(old, &session.caller.id);
            debug!(session = session.id, retired = old, caller = %session.caller, "session replaced");
        }
    }

    /// Validate a credential for `operation` and advance the watermark.
    ///
    /// # Errors
    ///
    /// Returns `BusError::InvalidCredential` for the first-contact session,
    /// an unknown session, a session owned by another login, a bad
    /// authenticator, or a ticket at or below the watermark.
    pub fn validate(&self, credential: &CredentialData, operation: &str) -> BusResult<Arc<InboundSession>> {
        if credential.session == FIRST_CONTACT_SESSION {
            return Err(BusError::InvalidCredential("no session established".into()));
        }
        let session = self
            .sessions
            .get(&credential.session)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| BusError::InvalidCredential(format!("unknown session {}", credential.session)))?;

        if session.caller.id != credential.login {
            return Err(BusError::InvalidCredential(format!(
                "session {} does not belong to login {}",
                session.id, credential.login
            )));
        }

        let expected = authenticator(
            &session.secret,
            &credential.bus,
            &credential.login,
            credential.session,
            credential.ticket,
            operation,
            &credential.chain,
        );
        if !mac_eq(&expected, &credential.hash) {
            return Err(BusError::InvalidCredential("authenticator mismatch".into()));
        }

        let mut watermark = session.watermark.lock();
        if credential.ticket <= *watermark {
            return Err(BusError::InvalidCredential(format!(
                "ticket {} replayed (last accepted {})",
                credential.ticket, *watermark
            )));
        }
        let first = *watermark == 0;
        *watermark = credential.ticket;
        drop(watermark);
        if first {
            self.confirm(&session);
        }

        trace!(session = session.id, ticket = credential.ticket, "credential accepted");
        Ok(session)
    }

    /// Drop `session` if it belongs to `login_id`.
    pub fn discard(&self, session: u32, login_id: &str) {
        self.sessions.remove_if(&session, |_, s| s.caller.id == login_id);
    }

    pub fn clear(&self) {
        self.sessions.clear();
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, session: u32) -> bool {
        self.sessions.contains_key(&session)
    }

    fn evict_oldest(&self) {
        let mut ids: Vec<u32> = self.sessions.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        let to_keep = self.max_sessions / 2;
        for id in ids.iter().take(ids.len().saturating_sub(to_keep)) {
            self.sessions.remove(id);
        }
    }
}
