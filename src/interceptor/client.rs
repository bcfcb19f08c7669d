//! Client-side interception: stamp outgoing calls.

use std::sync::Arc;
use tracing::trace;

use crate::chain::SignedCallChain;
use crate::connection::LoginState;
use crate::context::{BusContext, InvocationContext};
use crate::credential::CredentialData;
use crate::error::{BusError, BusResult};

/// Outgoing call as seen by the interceptor.
#[derive(Debug, Clone, Copy)]
pub struct OutgoingRequest<'a> {
    /// Address of the process the call goes to.
    pub endpoint: &'a str,
    pub operation: &'a str,
}

/// Attaches credentials to outgoing requests.
#[derive(Clone)]
pub struct ClientInterceptor {
    context: Arc<BusContext>,
}

impl ClientInterceptor {
    pub fn new(context: Arc<BusContext>) -> Self {
        Self { context }
    }

    /// Produce the credential for one outgoing call.
    ///
    /// 1. Resolve the connection: the invocation's override, else the
    ///    default connection.
    /// 2. No connection: send without context. Connection not logged in:
    ///    fail with `NoLogin`, unless the operation is configured as
    ///    unauthenticated.
    /// 3. Otherwise stamp a credential with the next ticket of the session
    ///    for `request.endpoint` (a first-contact credential if there is
    ///    none yet), presenting `chain` if given.
    pub fn send_request(
        &self,
        invocation: &InvocationContext,
        request: &OutgoingRequest<'_>,
        chain: Option<&SignedCallChain>,
    ) -> BusResult<Option<CredentialData>> {
        let Some(connection) = self.context.resolve_outgoing(invocation) else {
            trace!(operation = request.operation, "no connection, sending without credential");
            return Ok(None);
        };

        if connection.state() != LoginState::LoggedIn {
            if self.context.config().is_unauthenticated(request.operation) {
                return Ok(None);
            }
            return Err(BusError::NoLogin);
        }

        let credential = connection.stamp(request.endpoint, request.operation, chain)?;
        trace!(
            endpoint = request.endpoint,
            operation = request.operation,
            session = credential.session,
            ticket = credential.ticket,
            "request stamped"
        );
        Ok(Some(credential))
    }
}
