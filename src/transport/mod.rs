//! Request transport seam.
//!
//! The access-control layer does not own a wire protocol. It needs a way to
//! deliver a request, with its opaque context blob, to the process at an
//! endpoint address and get a reply back. [`Transport`] is that seam;
//! [`LocalTransport`] implements it in-process for tests and the demo
//! binary.

mod local;

pub use local::{BusService, LocalTransport, ServiceEndpoint};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BusResult, RejectCode};

/// Address of a remote object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Process the object lives in; also keys the caller's credential
    /// session.
    pub endpoint: String,
    pub object_id: String,
}

impl ObjectRef {
    pub fn new(endpoint: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            object_id: object_id.into(),
        }
    }
}

/// One request as it travels between processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    pub endpoint: String,
    pub object_id: String,
    pub operation: String,
    /// Encoded credential, if the caller attached one.
    pub context: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

/// Reply to a [`WireRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireReply {
    Ok(Vec<u8>),
    /// Refused before the handler ran.
    Rejected {
        code: RejectCode,
        message: String,
        /// Encoded credential reset, for `InvalidCredential`.
        context: Option<Vec<u8>>,
    },
    /// The handler ran and returned an error.
    Failed(String),
}

/// Delivers requests to endpoints.
#[async_trait]
pub trait Transport: Send + Sync {
    /// # Errors
    ///
    /// `UnavailableBus` if nothing listens at the endpoint, `Transport` for
    /// delivery failures. Rejections and handler failures are replies, not
    /// errors.
    async fn deliver(&self, request: WireRequest) -> BusResult<WireReply>;
}
