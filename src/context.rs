//! Explicit context objects.
//!
//! [`BusContext`] is the process-level registry of connections: it owns the
//! dispatcher and the default connection and is handed explicitly to the
//! interceptors and the client stub.
//!
//! [`InvocationContext`] is the per-call (or per-task) state: which
//! connection outgoing calls use, the caller chain of the call being
//! handled, and the chain currently joined. Servers create one per inbound
//! call and drop it when the handler returns; clients create one per task.

use parking_lot::RwLock;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::access_control::AccessControl;
use crate::chain::CallerChain;
use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::dispatch::{DispatchRequest, Dispatcher};

/// Process-wide bus state.
pub struct BusContext {
    config: ConnectionConfig,
    dispatcher: Arc<Dispatcher>,
    default_connection: RwLock<Option<Connection>>,
}

impl BusContext {
    pub fn new(config: ConnectionConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            dispatcher: Dispatcher::new(),
            default_connection: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Create a connection and register it with the dispatcher.
    ///
    /// The connection starts unlogged; it becomes routable once it logs in.
    pub fn create_connection(&self, access: Arc<dyn AccessControl>) -> Connection {
        let connection = Connection::new(access, self.config.clone());
        self.dispatcher.attach(&connection);
        connection
    }

    pub fn set_default_connection(&self, connection: Option<Connection>) {
        *self.default_connection.write() = connection;
    }

    pub fn default_connection(&self) -> Option<Connection> {
        self.default_connection.read().clone()
    }

    /// Connection for an outgoing call: the invocation override, else the
    /// default.
    pub fn resolve_outgoing(&self, invocation: &InvocationContext) -> Option<Connection> {
        invocation
            .current_connection()
            .cloned()
            .or_else(|| self.default_connection())
    }

    /// Connection owning an inbound call: the dispatcher's answer, else the
    /// default.
    pub fn resolve_incoming(&self, request: &DispatchRequest<'_>) -> Option<Connection> {
        self.dispatcher
            .resolve(request)
            .or_else(|| self.default_connection())
    }
}

impl std::fmt::Debug for BusContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusContext")
            .field("default_connection", &self.default_connection())
            .finish_non_exhaustive()
    }
}

/// Per-call state for outgoing and incoming calls.
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    connection: Option<Connection>,
    caller_chain: Option<CallerChain>,
    joined_chain: Option<CallerChain>,
}

impl InvocationContext {
    /// Empty context: default connection, no chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context whose outgoing calls use `connection`.
    pub fn with_connection(connection: Connection) -> Self {
        Self {
            connection: Some(connection),
            ..Self::default()
        }
    }

    /// Context for a call accepted by the server interceptor.
    pub(crate) fn dispatched(connection: Connection, caller_chain: CallerChain) -> Self {
        Self {
            connection: Some(connection),
            caller_chain: Some(caller_chain),
            joined_chain: None,
        }
    }

    /// Override the connection used for outgoing calls (`None` restores
    /// the default).
    pub fn set_current_connection(&mut self, connection: Option<Connection>) {
        self.connection = connection;
    }

    pub fn current_connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    /// Chain of the call being handled; `None` outside a dispatch.
    pub fn caller_chain(&self) -> Option<&CallerChain> {
        self.caller_chain.as_ref()
    }

    /// Chain outgoing calls are currently made on behalf of.
    pub fn joined_chain(&self) -> Option<&CallerChain> {
        self.joined_chain.as_ref()
    }

    /// Make outgoing calls on behalf of `chain` until the guard is dropped.
    ///
    /// The prior joined chain (possibly none) is restored when the guard is
    /// dropped or [`ChainGuard::exit_chain`] is called, including on early
    /// return and unwinding.
    pub fn join_chain(&mut self, chain: CallerChain) -> ChainGuard<'_> {
        let previous = self.joined_chain.replace(chain);
        ChainGuard {
            context: self,
            previous: Some(previous),
        }
    }

    /// Join the chain of the call being handled.
    ///
    /// Returns `None` outside a dispatch.
    pub fn join_caller_chain(&mut self) -> Option<ChainGuard<'_>> {
        let chain = self.caller_chain.clone()?;
        Some(self.join_chain(chain))
    }
}

/// Scope of a joined chain. Derefs to the [`InvocationContext`].
#[must_use = "dropping the guard exits the chain immediately"]
pub struct ChainGuard<'a> {
    context: &'a mut InvocationContext,
    previous: Option<Option<CallerChain>>,
}

impl ChainGuard<'_> {
    /// Leave the joined chain now.
    pub fn exit_chain(self) {}
}

impl Deref for ChainGuard<'_> {
    type Target = InvocationContext;

    fn deref(&self) -> &InvocationContext {
        self.context
    }
}

impl DerefMut for ChainGuard<'_> {
    fn deref_mut(&mut self) -> &mut InvocationContext {
        self.context
    }
}

impl Drop for ChainGuard<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.context.joined_chain = previous;
        }
    }
}
