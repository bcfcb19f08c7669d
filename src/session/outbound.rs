//! Caller side of credential sessions.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::chain::SignedCallChain;
use crate::credential::CredentialData;
use crate::crypto::Secret;
use crate::error::{BusError, BusResult};
use crate::identity::LoginInfo;

/// Caller-held state for one target.
///
/// Session id and secret never change; a reset installs a new
/// `CredentialSession` in place of this one.
pub struct CredentialSession {
    target: LoginInfo,
    session_id: u32,
    secret: Secret,
    /// Last ticket handed out. Starts at 0; the first stamped call uses 1.
    ticket: AtomicU32,
    default_chain: SignedCallChain,
    /// Chains signed for this target on behalf of joined callers, keyed by
    /// the joined chain's signature.
    joined: Mutex<HashMap<Vec<u8>, SignedCallChain>>,
    max_joined: usize,
}

impl CredentialSession {
    pub fn new(
        target: LoginInfo,
        session_id: u32,
        secret: Secret,
        default_chain: SignedCallChain,
        max_joined: usize,
    ) -> Self {
        Self {
            target,
            session_id,
            secret,
            ticket: AtomicU32::new(0),
            default_chain,
            joined: Mutex::new(HashMap::new()),
            max_joined: max_joined.max(1),
        }
    }

    pub fn target(&self) -> &LoginInfo {
        &self.target
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn default_chain(&self) -> &SignedCallChain {
        &self.default_chain
    }

    /// Last ticket handed out (0 if none).
    pub fn current_ticket(&self) -> u32 {
        self.ticket.load(Ordering::Acquire)
    }

    /// Atomically advance the ticket counter and return the new value.
    ///
    /// # Errors
    ///
    /// Returns `BusError::InvalidCredential` once the counter is exhausted;
    /// the next call then goes through a reset and gets a fresh session.
    pub fn generate_next_ticket(&self) -> BusResult<u32> {
        self.ticket
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| t.checked_add(1))
            .map(|previous| previous + 1)
            .map_err(|_| {
                BusError::InvalidCredential(format!("session {} exhausted its tickets", self.session_id))
            })
    }

    /// Build the credential for one call to this session's target.
    ///
    /// Uses `chain` if given (a joined chain signed for this target),
    /// otherwise the session's default chain.
    pub fn stamp(
        &self,
        bus: &str,
        login: &str,
        operation: &str,
        chain: Option<&SignedCallChain>,
    ) -> BusResult<CredentialData> {
        let ticket = self.generate_next_ticket()?;
        trace!(session = self.session_id, ticket, operation, "stamping credential");
        let chain = chain.unwrap_or(&self.default_chain).clone();
        Ok(CredentialData::stamped(
            bus,
            login,
            self.session_id,
            ticket,
            &self.secret,
            operation,
            chain,
        ))
    }

    /// Chain previously signed for `joined_signature`, if cached.
    pub fn joined_chain(&self, joined_signature: &[u8]) -> Option<SignedCallChain> {
        self.joined.lock().get(joined_signature).cloned()
    }

    pub fn remember_joined_chain(&self, joined_signature: &[u8], chain: SignedCallChain) {
        let mut joined = self.joined.lock();
        if joined.len() >= self.max_joined {
            joined.clear();
        }
        joined.insert(joined_signature.to_vec(), chain);
    }
}

impl std::fmt::Debug for CredentialSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSession")
            .field("target", &self.target)
            .field("session_id", &self.session_id)
            .field("ticket", &self.current_ticket())
            .finish_non_exhaustive()
    }
}

/// Caller-side session table, keyed by target endpoint.
///
/// At most `max_sessions` entries are kept; when the limit is exceeded the
/// oldest half is evicted. An evicted target simply goes through a reset on
/// its next call.
///
/// Each endpoint also has a gate: ordinary calls hold it shared from
/// stamping until the reply arrives, and a reset holds it exclusively
/// together with the call resumed on the new session. That keeps the
/// resumed call from racing tickets stamped on the session it replaces.
pub struct OutboundSessions {
    sessions: DashMap<String, (u64, Arc<CredentialSession>)>,
    gates: DashMap<String, Arc<RwLock<()>>>,
    installed: AtomicU64,
    max_sessions: usize,
}

impl OutboundSessions {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            gates: DashMap::new(),
            installed: AtomicU64::new(0),
            max_sessions: max_sessions.max(1),
        }
    }

    pub fn get(&self, endpoint: &str) -> Option<Arc<CredentialSession>> {
        self.sessions.get(endpoint).map(|e| Arc::clone(&e.value().1))
    }

    /// Id of the session installed for `endpoint`, if any.
    pub fn session_id(&self, endpoint: &str) -> Option<u32> {
        self.sessions.get(endpoint).map(|e| e.value().1.session_id())
    }

    /// Reset gate for `endpoint`. Survives `clear()`.
    pub fn gate(&self, endpoint: &str) -> Arc<RwLock<()>> {
        Arc::clone(self.gates.entry(endpoint.to_string()).or_default().value())
    }

    /// Install `session` for `endpoint`, replacing any previous one.
    pub fn install(&self, endpoint: &str, session: Arc<CredentialSession>) {
        let seq = self.installed.fetch_add(1, Ordering::Relaxed);
        debug!(
            endpoint,
            target = %session.target(),
            session = session.session_id(),
            "installing credential session"
        );
        self.sessions.insert(endpoint.to_string(), (seq, session));
        if self.sessions.len() > self.max_sessions {
            self.evict_oldest();
        }
    }

    pub fn clear(&self) {
        self.sessions.clear();
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn evict_oldest(&self) {
        let mut entries: Vec<(String, u64)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().0))
            .collect();
        entries.sort_by_key(|(_, seq)| *seq);
        let to_keep = self.max_sessions / 2;
        for (endpoint, _) in entries.iter().take(entries.len().saturating_sub(to_keep)) {
            self.sessions.remove(endpoint);
            self.gates.remove_if(endpoint, |_, gate| Arc::strong_count(gate) == 1);
        }
    }
}
