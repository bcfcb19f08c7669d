//! Request interceptor pair.
//!
//! The transport calls [`ClientInterceptor::send_request`] on the calling
//! task right before a request leaves, and
//! [`ServerInterceptor::receive_request`] on the handling task before the
//! operation body runs. Both are synchronous and never block: anything that
//! needs the network (signing a joined chain, accepting a reset) happens in
//! the client stub around them.

mod client;
mod server;

pub use client::{ClientInterceptor, OutgoingRequest};
pub use server::{IncomingRequest, ServerInterceptor};

use crate::credential::CredentialReset;
use crate::error::{BusError, RejectCode};

/// A request refused by the server interceptor.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub code: RejectCode,
    pub message: String,
    /// Present for `InvalidCredential` rejections that open a new session.
    pub reset: Option<CredentialReset>,
}

impl Rejection {
    pub fn new(code: RejectCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            reset: None,
        }
    }

    /// `InvalidCredential` rejection carrying a session reset.
    pub fn reset(reset: CredentialReset) -> Self {
        Self {
            code: RejectCode::InvalidCredential,
            message: format!("credential reset by {}", reset.target),
            reset: Some(reset),
        }
    }

    /// Wire form of a local error; errors without a code become
    /// `InvalidRemote`.
    pub fn from_error(error: &BusError) -> Self {
        Self::new(error.code().unwrap_or(RejectCode::InvalidRemote), error.to_string())
    }

    pub fn into_error(self) -> BusError {
        BusError::from_code(self.code, self.message)
    }
}
