//! Inbound connection dispatch.
//!
//! A process may be logged into several buses (or into one bus several
//! times). The [`Dispatcher`] tracks every logged-in connection and picks
//! the one that owns an inbound request. Applications can replace the
//! routing decision with their own [`DispatchStrategy`].

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

use crate::connection::{Connection, LoginObserver, LoginState};
use crate::identity::LoginInfo;

/// What the dispatcher knows about an inbound request.
#[derive(Debug, Clone, Copy)]
pub struct DispatchRequest<'a> {
    /// Bus named by the request's credential.
    pub bus_id: &'a str,
    /// Login the request's chain is addressed to, if it could be read.
    pub login_id: Option<&'a str>,
    pub object_id: &'a str,
    pub operation: &'a str,
}

/// Custom routing of inbound requests.
///
/// Returning `None` falls back to the default connection of the
/// [`BusContext`](crate::context::BusContext).
pub trait DispatchStrategy: Send + Sync {
    fn dispatch(&self, dispatcher: &Dispatcher, request: &DispatchRequest<'_>) -> Option<Connection>;
}

impl<F> DispatchStrategy for F
where
    F: Fn(&Dispatcher, &DispatchRequest<'_>) -> Option<Connection> + Send + Sync,
{
    fn dispatch(&self, dispatcher: &Dispatcher, request: &DispatchRequest<'_>) -> Option<Connection> {
        self(dispatcher, request)
    }
}

/// Registry of logged-in connections.
pub struct Dispatcher {
    by_login: DashMap<String, Connection>,
    by_bus: DashMap<String, Vec<Connection>>,
    strategy: RwLock<Option<Arc<dyn DispatchStrategy>>>,
}

impl Dispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            by_login: DashMap::new(),
            by_bus: DashMap::new(),
            strategy: RwLock::new(None),
        })
    }

    /// Track `connection`: it is routable while logged in.
    pub fn attach(self: &Arc<Self>, connection: &Connection) {
        let weak: Weak<Self> = Arc::downgrade(self);
        connection.subscribe(weak);
        if connection.state() == LoginState::LoggedIn {
            if let (Some(login), Some(bus_id)) = (connection.login(), connection.bus_id()) {
                self.add(connection, &login, &bus_id);
            }
        }
    }

    /// Replace the routing decision (`None` restores the default).
    pub fn set_strategy(&self, strategy: Option<Arc<dyn DispatchStrategy>>) {
        *self.strategy.write() = strategy;
    }

    /// Connection that should handle `request`.
    pub fn resolve(&self, request: &DispatchRequest<'_>) -> Option<Connection> {
        let strategy = self.strategy.read().clone();
        let chosen = match strategy {
            Some(strategy) => strategy.dispatch(self, request),
            None => self.default_route(request),
        };
        trace!(
            bus = request.bus_id,
            operation = request.operation,
            connection = chosen.as_ref().map(Connection::id),
            "dispatched"
        );
        chosen
    }

    /// Built-in routing: the connection logged in as the chain's target,
    /// else the first connection logged into the request's bus.
    pub fn default_route(&self, request: &DispatchRequest<'_>) -> Option<Connection> {
        if let Some(connection) = request
            .login_id
            .and_then(|id| self.connection_for_login(id))
            .filter(|c| c.bus_id().as_deref() == Some(request.bus_id))
        {
            return Some(connection);
        }
        self.by_bus
            .get(request.bus_id)
            .and_then(|list| list.first().cloned())
    }

    pub fn connection_for_login(&self, login_id: &str) -> Option<Connection> {
        self.by_login.get(login_id).map(|c| c.clone())
    }

    pub fn connections_for_bus(&self, bus_id: &str) -> Vec<Connection> {
        self.by_bus
            .get(bus_id)
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_login.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_login.is_empty()
    }

    fn add(&self, connection: &Connection, login: &LoginInfo, bus_id: &str) {
        self.by_login.insert(login.id.clone(), connection.clone());
        let mut list = self.by_bus.entry(bus_id.to_string()).or_default();
        if !list.iter().any(|c| c.ptr_eq(connection)) {
            list.push(connection.clone());
        }
    }

    fn remove(&self, connection: &Connection, login: &LoginInfo, bus_id: &str) {
        self.by_login
            .remove_if(&login.id, |_, current| current.ptr_eq(connection));
        if let Some(mut list) = self.by_bus.get_mut(bus_id) {
            list.retain(|c| !c.ptr_eq(connection));
        }
        self.by_bus.remove_if(bus_id, |_, list| list.is_empty());
    }
}

impl LoginObserver for Dispatcher {
    fn logged_in(&self, connection: &Connection, login: &LoginInfo, bus_id: &str) {
        debug!(connection = connection.id(), login = %login, bus = bus_id, "connection routable");
        self.add(connection, login, bus_id);
    }

    fn logged_out(&self, connection: &Connection, login: &LoginInfo, bus_id: &str) {
        debug!(connection = connection.id(), login = %login, bus = bus_id, "connection no longer routable");
        self.remove(connection, login, bus_id);
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("logins", &self.by_login.len())
            .field("buses", &self.by_bus.len())
            .finish()
    }
}
