//! Access control for multiplexed bus connections.
//!
//! `busauth_core` authenticates processes against an access-control service,
//! stamps every outgoing call with a per-session credential and carries a
//! bus-signed call chain across multi-hop invocations.
//!
//! The pieces, leaves first:
//!
//! - [`crypto`]: signing, sealing and MAC primitives
//! - [`credential`], [`chain`]: wire formats
//! - [`session`]: caller- and server-side credential sessions
//! - [`connection`]: the login state machine, one per bus login
//! - [`lease`]: background lease renewal
//! - [`interceptor`]: the request hooks a transport calls
//! - [`dispatch`], [`context`]: routing and per-call state
//! - [`transport`], [`client`]: the transport seam and the client stub
//! - [`access_control`]: the service contract and an in-memory service

pub mod access_control;
pub mod chain;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod context;
pub mod credential;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod interceptor;
pub mod lease;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use access_control::{AccessControl, InMemoryAccessControl};
pub use chain::{CallChain, CallerChain, SignedCallChain};
pub use client::BusClient;
pub use config::BusConfig;
pub use connection::{Connection, LoginState, SharedAuthSecret};
pub use context::{BusContext, ChainGuard, InvocationContext};
pub use dispatch::{DispatchRequest, DispatchStrategy, Dispatcher};
pub use error::{BusError, BusResult, RejectCode};
pub use identity::{BusInfo, LoginInfo};
pub use transport::{BusService, LocalTransport, ObjectRef, ServiceEndpoint, Transport};
