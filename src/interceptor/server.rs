//! Server-side interception: validate inbound calls.

use std::sync::Arc;
use tracing::{debug, trace};

use super::Rejection;
use crate::context::{BusContext, InvocationContext};
use crate::credential::CredentialData;
use crate::dispatch::DispatchRequest;
use crate::error::RejectCode;

/// Inbound call as seen by the interceptor.
#[derive(Debug, Clone, Copy)]
pub struct IncomingRequest<'a> {
    pub object_id: &'a str,
    pub operation: &'a str,
    /// Request context blob, if the caller attached one.
    pub context: Option<&'a [u8]>,
}

/// Validates credentials on inbound requests.
#[derive(Clone)]
pub struct ServerInterceptor {
    context: Arc<BusContext>,
}

impl ServerInterceptor {
    pub fn new(context: Arc<BusContext>) -> Self {
        Self { context }
    }

    /// Validate one inbound request.
    ///
    /// On success returns the [`InvocationContext`] for the handler: the
    /// verified caller chain plus the receiving connection as the current
    /// connection, so calls the handler makes leave through the same login.
    /// The context is dropped with the handler invocation.
    ///
    /// # Errors
    ///
    /// - `NoCredential`: no context on an authenticated operation
    /// - `InvalidCredential`: malformed context, or a session mismatch (the
    ///   rejection then carries a reset)
    /// - `UnknownBus`: no logged-in connection owns the credential's bus
    /// - `InvalidChain`: chain forged, or not addressed to this login
    pub fn receive_request(&self, request: &IncomingRequest<'_>) -> Result<InvocationContext, Rejection> {
        let Some(bytes) = request.context else {
            if self.context.config().is_unauthenticated(request.operation) {
                trace!(operation = request.operation, "unauthenticated operation");
                return Ok(InvocationContext::new());
            }
            debug!(operation = request.operation, "request without credential");
            return Err(Rejection::new(
                RejectCode::NoCredential,
                format!("operation '{}' requires a credential", request.operation),
            ));
        };

        let credential = CredentialData::decode(bytes).map_err(|e| Rejection::from_error(&e))?;

        // Routing only; the chain is verified by the owning connection.
        let target = credential.chain.decode_unverified().ok().map(|c| c.target);
        let dispatch = DispatchRequest {
            bus_id: &credential.bus,
            login_id: target.as_deref(),
            object_id: request.object_id,
            operation: request.operation,
        };
        let connection = self.context.resolve_incoming(&dispatch).ok_or_else(|| {
            Rejection::new(
                RejectCode::UnknownBus,
                format!("no connection for bus '{}'", credential.bus),
            )
        })?;

        let caller_chain = connection.validate_inbound(&credential, request.operation)?;
        trace!(
            connection = connection.id(),
            caller = %caller_chain.caller(),
            operation = request.operation,
            "request accepted"
        );
        Ok(InvocationContext::dispatched(connection, caller_chain))
    }
}
