//! Common test utilities: an in-process bus with recording transport and
//! fault-injecting access control.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use busauth_core::{
    access_control::{HandoffGrant, HandoffMode, LeaseRenewal, LoginChallenge, LoginGrant},
    config::{AccessControlConfig, ConnectionConfig, UserEntry},
    credential::CredentialData,
    crypto::{LoginPublicKey, Secret},
    error::{BusError, BusResult},
    transport::{WireReply, WireRequest},
    AccessControl, BusClient, BusContext, BusService, Connection, InMemoryAccessControl, InvocationContext,
    LocalTransport, ObjectRef, ServiceEndpoint, SignedCallChain, Transport,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

pub const BUS_ID: &str = "test-bus";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("busauth_core=debug")
        .try_init();
}

/// Password for every configured test entity.
pub fn password(entity: &str) -> String {
    format!("{entity}-pw")
}

pub fn access_config(bus_id: &str) -> AccessControlConfig {
    AccessControlConfig {
        bus_id: bus_id.into(),
        lease_secs: 10,
        users: ["alice", "bob", "forwarder", "echo"]
            .into_iter()
            .map(|entity| UserEntry {
                entity: entity.into(),
                password: password(entity),
                domain: None,
            })
            .collect(),
        ..AccessControlConfig::default()
    }
}

/// What a [`Recorder`] saw: entity names of the caller and originators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observed {
    pub bus: String,
    pub caller: String,
    pub originators: Vec<String>,
}

/// Replies to `whoami` with the caller chain it was invoked with.
#[derive(Default)]
pub struct Recorder {
    pub seen: Mutex<Vec<Observed>>,
}

#[async_trait]
impl BusService for Recorder {
    async fn handle_request(&self, ctx: &mut InvocationContext, operation: &str, _payload: &[u8]) -> Result<Vec<u8>> {
        match operation {
            "whoami" => {
                let chain = ctx.caller_chain().ok_or_else(|| anyhow!("no caller chain"))?;
                let observed = Observed {
                    bus: chain.bus_id().to_string(),
                    caller: chain.caller().entity.clone(),
                    originators: chain.originators().iter().map(|o| o.entity.clone()).collect(),
                };
                self.seen.lock().push(observed.clone());
                Ok(serde_json::to_vec(&observed)?)
            }
            "fail" => Err(anyhow!("requested failure")),
            other => Err(anyhow!("unsupported operation '{other}'")),
        }
    }

    fn name(&self) -> &str {
        "recorder"
    }
}

/// Relays `relay` to `next` under the caller's chain.
pub struct Forwarder {
    pub client: BusClient,
    pub next: ObjectRef,
}

#[async_trait]
impl BusService for Forwarder {
    async fn handle_request(&self, ctx: &mut InvocationContext, operation: &str, payload: &[u8]) -> Result<Vec<u8>> {
        if operation != "relay" {
            return Err(anyhow!("unsupported operation '{operation}'"));
        }
        let guard = ctx.join_caller_chain().ok_or_else(|| anyhow!("no caller chain"))?;
        Ok(self.client.call(&guard, &self.next, "whoami", payload).await?)
    }

    fn name(&self) -> &str {
        "forwarder"
    }
}

/// Transport that remembers every request it delivers.
pub struct RecordingTransport {
    pub inner: Arc<LocalTransport>,
    sent: Mutex<Vec<WireRequest>>,
}

impl RecordingTransport {
    pub fn new(inner: Arc<LocalTransport>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn deliveries(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn last(&self) -> Option<WireRequest> {
        self.sent.lock().last().cloned()
    }

    pub fn last_credential(&self) -> BusResult<CredentialData> {
        let context = self
            .last()
            .and_then(|r| r.context)
            .ok_or(BusError::NoCredential)?;
        CredentialData::decode(&context)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn deliver(&self, request: WireRequest) -> BusResult<WireReply> {
        self.sent.lock().push(request.clone());
        self.inner.deliver(request).await
    }
}

/// One simulated process.
pub struct Process {
    pub context: Arc<BusContext>,
    pub connection: Connection,
    pub endpoint: Arc<ServiceEndpoint>,
}

impl Process {
    pub fn login_id(&self) -> BusResult<String> {
        self.connection.login().map(|l| l.id).ok_or(BusError::NoLogin)
    }
}

/// A bus with an access-control service and an in-process transport.
pub struct Network {
    pub access: Arc<InMemoryAccessControl>,
    pub local: Arc<LocalTransport>,
    pub transport: Arc<RecordingTransport>,
}

impl Network {
    pub fn new() -> Self {
        Self::with_bus(BUS_ID)
    }

    pub fn with_bus(bus_id: &str) -> Self {
        init_tracing();
        let local = LocalTransport::new();
        Self {
            access: InMemoryAccessControl::shared(access_config(bus_id)),
            transport: RecordingTransport::new(local.clone()),
            local,
        }
    }

    /// Log `entity` in on a fresh process listening at `address`.
    pub async fn process(&self, address: &str, entity: &str) -> BusResult<Process> {
        self.process_with(address, entity, ConnectionConfig::default()).await
    }

    pub async fn process_with(&self, address: &str, entity: &str, config: ConnectionConfig) -> BusResult<Process> {
        let context = BusContext::new(config);
        let connection = context.create_connection(self.access.clone());
        connection
            .login_by_password(entity, password(entity).as_bytes(), "")
            .await?;
        context.set_default_connection(Some(connection.clone()));
        let endpoint = ServiceEndpoint::new(address, context.clone());
        self.local.bind(endpoint.clone());
        Ok(Process {
            context,
            connection,
            endpoint,
        })
    }

    /// Client stub for calls made from `process`.
    pub fn client(&self, process: &Process) -> BusClient {
        BusClient::new(process.context.clone(), self.transport.clone())
    }
}

pub async fn whoami(client: &BusClient, ctx: &InvocationContext, object: &ObjectRef) -> BusResult<Observed> {
    let body = client.call(ctx, object, "whoami", b"").await?;
    serde_json::from_slice(&body).map_err(|e| BusError::InvalidRemote(e.to_string()))
}

/// Access control that can be made to refuse renewals or stall logins.
pub struct Faulty {
    pub inner: Arc<InMemoryAccessControl>,
    pub renewals: AtomicU32,
    /// Renewals from this attempt on fail with `InvalidLogin`.
    pub fail_renewal_from: AtomicU32,
    pub stall_logins: AtomicBool,
}

impl Faulty {
    pub fn new(inner: Arc<InMemoryAccessControl>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            renewals: AtomicU32::new(0),
            fail_renewal_from: AtomicU32::new(u32::MAX),
            stall_logins: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl AccessControl for Faulty {
    async fn login_by_password(
        &self,
        entity: &str,
        password: &[u8],
        domain: &str,
        login_key: &LoginPublicKey,
    ) -> BusResult<LoginGrant> {
        if self.stall_logins.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.login_by_password(entity, password, domain, login_key).await
    }

    async fn start_login_by_certificate(&self, entity: &str) -> BusResult<LoginChallenge> {
        self.inner.start_login_by_certificate(entity).await
    }

    async fn login_by_certificate(
        &self,
        process: &str,
        answer: &[u8],
        login_key: &LoginPublicKey,
    ) -> BusResult<LoginGrant> {
        self.inner.login_by_certificate(process, answer, login_key).await
    }

    async fn start_shared_auth(&self, credential: &CredentialData, mode: HandoffMode) -> BusResult<HandoffGrant> {
        self.inner.start_shared_auth(credential, mode).await
    }

    async fn login_by_shared_auth(
        &self,
        process: &str,
        secret: &Secret,
        login_key: &LoginPublicKey,
    ) -> BusResult<LoginGrant> {
        self.inner.login_by_shared_auth(process, secret, login_key).await
    }

    async fn cancel_shared_auth(&self, credential: &CredentialData, process: &str) -> BusResult<()> {
        self.inner.cancel_shared_auth(credential, process).await
    }

    async fn renew_lease(&self, credential: &CredentialData) -> BusResult<LeaseRenewal> {
        let attempt = self.renewals.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt >= self.fail_renewal_from.load(Ordering::SeqCst) {
            return Err(BusError::InvalidLogin(credential.login.clone()));
        }
        self.inner.renew_lease(credential).await
    }

    async fn sign_chain_for(
        &self,
        credential: &CredentialData,
        target: &str,
        joined: Option<&SignedCallChain>,
    ) -> BusResult<SignedCallChain> {
        self.inner.sign_chain_for(credential, target, joined).await
    }

    async fn logout(&self, credential: &CredentialData) -> BusResult<()> {
        self.inner.logout(credential).await
    }
}
