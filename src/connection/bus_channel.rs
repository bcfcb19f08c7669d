//! Authenticated calls from a login back to the access-control service.

use async_trait::async_trait;
use std::sync::Arc;

use crate::access_control::{operation, AccessControl, HandoffGrant, HandoffMode, LeaseRenewal};
use crate::chain::SignedCallChain;
use crate::credential::CredentialData;
use crate::error::BusResult;
use crate::lease::LeaseProvider;
use crate::session::CredentialSession;

/// The bus session of one login plus the service it talks to.
///
/// Calls are serialized so that tickets reach the service in the order
/// they were generated; otherwise a renewal racing a chain request could be
/// rejected as a replay.
pub(crate) struct BusChannel {
    access: Arc<dyn AccessControl>,
    bus_id: String,
    login_id: String,
    session: CredentialSession,
    order: tokio::sync::Mutex<()>,
}

impl BusChannel {
    pub(crate) fn new(
        access: Arc<dyn AccessControl>,
        bus_id: String,
        login_id: String,
        session: CredentialSession,
    ) -> Self {
        Self {
            access,
            bus_id,
            login_id,
            session,
            order: tokio::sync::Mutex::new(()),
        }
    }

    fn credential(&self, operation: &str) -> BusResult<CredentialData> {
        self.session.stamp(&self.bus_id, &self.login_id, operation, None)
    }

    pub(crate) async fn renew_lease(&self) -> BusResult<LeaseRenewal> {
        let _order = self.order.lock().await;
        let credential = self.credential(operation::RENEW_LEASE)?;
        self.access.renew_lease(&credential).await
    }

    pub(crate) async fn sign_chain_for(
        &self,
        target: &str,
        joined: Option<&SignedCallChain>,
    ) -> BusResult<SignedCallChain> {
        let _order = self.order.lock().await;
        let credential = self.credential(operation::SIGN_CHAIN_FOR)?;
        self.access.sign_chain_for(&credential, target, joined).await
    }

    pub(crate) async fn start_shared_auth(&self, mode: HandoffMode) -> BusResult<HandoffGrant> {
        let _order = self.order.lock().await;
        let credential = self.credential(operation::START_SHARED_AUTH)?;
        self.access.start_shared_auth(&credential, mode).await
    }

    pub(crate) async fn cancel_shared_auth(&self, process: &str) -> BusResult<()> {
        let _order = self.order.lock().await;
        let credential = self.credential(operation::CANCEL_SHARED_AUTH)?;
        self.access.cancel_shared_auth(&credential, process).await
    }

    pub(crate) async fn logout(&self) -> BusResult<()> {
        let _order = self.order.lock().await;
        let credential = self.credential(operation::LOGOUT)?;
        self.access.logout(&credential).await
    }
}

#[async_trait]
impl LeaseProvider for BusChannel {
    async fn renew(&self) -> BusResult<LeaseRenewal> {
        self.renew_lease().await
    }
}
