//! Credential sessions.
//!
//! A session is the shared state between one caller login and one target
//! login: a session id, a secret only the two of them know, and a strictly
//! increasing ticket counter. The caller keeps [`CredentialSession`]s in its
//! [`OutboundSessions`] table (one per target endpoint); the target keeps
//! the matching [`InboundSession`]s with a replay watermark.

mod inbound;
mod outbound;

pub use inbound::{InboundSession, InboundSessions};
pub use outbound::{CredentialSession, OutboundSessions};
