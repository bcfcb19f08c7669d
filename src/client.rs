//! Client stub.
//!
//! [`BusClient`] wraps a [`Transport`] with the client interceptor and the
//! asynchronous half of the credential protocol: obtaining chains for
//! joined callers and accepting session resets, one at a time per endpoint.

use std::sync::Arc;
use tracing::{debug, instrument, trace};

use crate::chain::SignedCallChain;
use crate::connection::LoginState;
use crate::context::{BusContext, InvocationContext};
use crate::credential::{CredentialData, CredentialReset};
use crate::error::{BusError, BusResult, RejectCode};
use crate::interceptor::{ClientInterceptor, OutgoingRequest};
use crate::transport::{ObjectRef, Transport, WireReply, WireRequest};

/// Makes authenticated calls on behalf of an [`InvocationContext`].
#[derive(Clone)]
pub struct BusClient {
    context: Arc<BusContext>,
    interceptor: ClientInterceptor,
    transport: Arc<dyn Transport>,
}

impl BusClient {
    pub fn new(context: Arc<BusContext>, transport: Arc<dyn Transport>) -> Self {
        Self {
            interceptor: ClientInterceptor::new(Arc::clone(&context)),
            context,
            transport,
        }
    }

    /// Invoke `operation` on `object`.
    ///
    /// A session reset from the server is accepted and the call retried, at
    /// most `connection.reset_retries` times; a further rejection is
    /// returned as the matching [`BusError`].
    ///
    /// Concurrent calls to one endpoint share its session. A rejected call
    /// waits for the calls in flight on that session, then accepts the reset
    /// and resumes alone. A call whose session another call has already
    /// replaced retries on the replacement without spending a reset. A
    /// handler must not call back into the endpoint that is calling it
    /// through the same connection while that endpoint resets.
    ///
    /// # Errors
    ///
    /// - `NoLogin` if the resolved connection is not logged in
    /// - the rejection code's error if the server refuses the call
    /// - `OperationFailed` if the handler ran and failed
    #[instrument(skip(self, invocation, payload), fields(endpoint = %object.endpoint, object_id = %object.object_id))]
    pub async fn call(
        &self,
        invocation: &InvocationContext,
        object: &ObjectRef,
        operation: &str,
        payload: &[u8],
    ) -> BusResult<Vec<u8>> {
        let Some(connection) = self.context.resolve_outgoing(invocation) else {
            return self.attempt(invocation, object, operation, payload).await?.into_result();
        };
        let gate = connection.session_gate(&object.endpoint);

        let attempt = {
            let _shared = gate.read().await;
            self.attempt(invocation, object, operation, payload).await?
        };
        let (mut presented, mut reset, mut message) = match attempt {
            Attempt::Done(result) => return result,
            Attempt::Reset { presented, reset, message } => (presented, reset, message),
        };

        let _exclusive = gate.write().await;
        let mut resets = 0u32;
        loop {
            if connection.presented_session(&object.endpoint) == presented {
                if resets >= self.context.config().reset_retries {
                    debug!(presented, resets, "reset limit reached");
                    return Err(BusError::InvalidCredential(message));
                }
                let reset = CredentialReset::decode(&reset)?;
                debug!(target_login = %reset.target, session = reset.session, "accepting session reset");
                connection.accept_reset(&object.endpoint, &reset).await?;
                resets += 1;
            } else {
                trace!(presented, "session already replaced, retrying");
            }

            match self.attempt(invocation, object, operation, payload).await? {
                Attempt::Done(result) => return result,
                Attempt::Reset {
                    presented: next,
                    reset: next_reset,
                    message: next_message,
                } => {
                    presented = next;
                    reset = next_reset;
                    message = next_message;
                }
            }
        }
    }

    /// Stamp and deliver the call once.
    async fn attempt(
        &self,
        invocation: &InvocationContext,
        object: &ObjectRef,
        operation: &str,
        payload: &[u8],
    ) -> BusResult<Attempt> {
        let chain = self.chain_for(invocation, &object.endpoint).await?;
        let request = OutgoingRequest {
            endpoint: &object.endpoint,
            operation,
        };
        let credential = self.interceptor.send_request(invocation, &request, chain.as_ref())?;
        let context = credential.as_ref().map(CredentialData::encode).transpose()?;

        let reply = self
            .transport
            .deliver(WireRequest {
                endpoint: object.endpoint.clone(),
                object_id: object.object_id.clone(),
                operation: operation.to_string(),
                context,
                payload: payload.to_vec(),
            })
            .await?;

        Ok(match reply {
            WireReply::Ok(body) => Attempt::Done(Ok(body)),
            WireReply::Failed(message) => Attempt::Done(Err(BusError::OperationFailed(message))),
            WireReply::Rejected {
                code: RejectCode::InvalidCredential,
                context: Some(reset),
                message,
            } => match credential {
                Some(credential) => Attempt::Reset {
                    presented: credential.session,
                    reset,
                    message,
                },
                None => Attempt::Done(Err(BusError::InvalidCredential(message))),
            },
            WireReply::Rejected { code, message, .. } => {
                debug!(?code, %message, "call rejected");
                Attempt::Done(Err(BusError::from_code(code, message)))
            }
        })
    }

    /// Chain to present for a call to `endpoint`, if the invocation has
    /// joined one.
    async fn chain_for(&self, invocation: &InvocationContext, endpoint: &str) -> BusResult<Option<SignedCallChain>> {
        let Some(joined) = invocation.joined_chain() else {
            return Ok(None);
        };
        match self.context.resolve_outgoing(invocation) {
            Some(connection) if connection.state() == LoginState::LoggedIn => {
                connection.chain_for_call(endpoint, Some(joined)).await
            }
            _ => Ok(None),
        }
    }
}

/// Outcome of one delivery.
enum Attempt {
    Done(BusResult<Vec<u8>>),
    /// Rejected with a reset blob; `presented` is the session the call used.
    Reset {
        presented: u32,
        reset: Vec<u8>,
        message: String,
    },
}

impl Attempt {
    fn into_result(self) -> BusResult<Vec<u8>> {
        match self {
            Self::Done(result) => result,
            Self::Reset { message, .. } => Err(BusError::InvalidCredential(message)),
        }
    }
}

impl std::fmt::Debug for BusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient").finish_non_exhaustive()
    }
}
