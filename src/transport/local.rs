//! In-process transport.
//!
//! Every [`ServiceEndpoint`] is a "process": an address, a server
//! interceptor bound to that process's [`BusContext`], and the objects it
//! serves. Requests are encoded, handed to a fresh tokio task, decoded and
//! dispatched there, so each call runs on its own task the way it would
//! under a networked transport.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::{Transport, WireReply, WireRequest};
use crate::codec;
use crate::context::{BusContext, InvocationContext};
use crate::error::{BusError, BusResult};
use crate::interceptor::{IncomingRequest, ServerInterceptor};

/// An object served at an endpoint.
///
/// Handlers receive the [`InvocationContext`] built by the server
/// interceptor: the verified caller chain and the receiving connection.
/// The context lives exactly as long as the call.
#[async_trait]
pub trait BusService: Send + Sync + 'static {
    /// Process one operation and return the reply payload.
    async fn handle_request(
        &self,
        ctx: &mut InvocationContext,
        operation: &str,
        payload: &[u8],
    ) -> anyhow::Result<Vec<u8>>;

    /// Service name (for logging).
    fn name(&self) -> &str;
}

/// The server side of one process.
pub struct ServiceEndpoint {
    address: String,
    interceptor: ServerInterceptor,
    services: DashMap<String, Arc<dyn BusService>>,
}

impl ServiceEndpoint {
    pub fn new(address: impl Into<String>, context: Arc<BusContext>) -> Arc<Self> {
        Arc::new(Self {
            address: address.into(),
            interceptor: ServerInterceptor::new(context),
            services: DashMap::new(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Serve `service` under `object_id`, replacing any previous one.
    pub fn register(&self, object_id: impl Into<String>, service: Arc<dyn BusService>) {
        let object_id = object_id.into();
        debug!(endpoint = %self.address, object = %object_id, service = service.name(), "service registered");
        self.services.insert(object_id, service);
    }

    pub fn unregister(&self, object_id: &str) -> bool {
        self.services.remove(object_id).is_some()
    }

    /// Run one request through the interceptor and the handler.
    pub async fn handle(&self, request: WireRequest) -> WireReply {
        let incoming = IncomingRequest {
            object_id: &request.object_id,
            operation: &request.operation,
            context: request.context.as_deref(),
        };
        let mut ctx = match self.interceptor.receive_request(&incoming) {
            Ok(ctx) => ctx,
            Err(rejection) => {
                debug!(
                    endpoint = %self.address,
                    operation = %request.operation,
                    code = ?rejection.code,
                    "request rejected"
                );
                let context = match rejection.reset.as_ref().map(|r| r.encode()).transpose() {
                    Ok(context) => context,
                    Err(e) => return WireReply::Failed(format!("encoding reset: {e}")),
                };
                return WireReply::Rejected {
                    code: rejection.code,
                    message: rejection.message,
                    context,
                };
            }
        };

        let Some(service) = self.services.get(&request.object_id).map(|s| Arc::clone(s.value())) else {
            return WireReply::Failed(format!("no object '{}' at {}", request.object_id, self.address));
        };

        trace!(endpoint = %self.address, service = service.name(), operation = %request.operation, "dispatching");
        let outcome = service
            .handle_request(&mut ctx, &request.operation, &request.payload)
            .await;
        drop(ctx);

        match outcome {
            Ok(reply) => WireReply::Ok(reply),
            Err(e) => {
                warn!(service = service.name(), operation = %request.operation, error = %e, "handler failed");
                WireReply::Failed(format!("{e:#}"))
            }
        }
    }
}

impl std::fmt::Debug for ServiceEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceEndpoint")
            .field("address", &self.address)
            .field("services", &self.services.len())
            .finish()
    }
}

/// Routes requests to endpoints in this process.
#[derive(Default)]
pub struct LocalTransport {
    endpoints: DashMap<String, Arc<ServiceEndpoint>>,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn bind(&self, endpoint: Arc<ServiceEndpoint>) {
        self.endpoints.insert(endpoint.address().to_string(), endpoint);
    }

    pub fn unbind(&self, address: &str) -> bool {
        self.endpoints.remove(address).is_some()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn deliver(&self, request: WireRequest) -> BusResult<WireReply> {
        let endpoint = self
            .endpoints
            .get(&request.endpoint)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| BusError::UnavailableBus(format!("nothing listens at '{}'", request.endpoint)))?;

        let bytes = codec::encode(&request)?;
        tokio::spawn(async move {
            let request: WireRequest = codec::decode(&bytes)?;
            Ok::<_, BusError>(endpoint.handle(request).await)
        })
        .await
        .map_err(|e| BusError::Transport(format!("request task failed: {e}")))?
    }
}
