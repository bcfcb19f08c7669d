//! Credential stamping, validation and the session-reset handshake.

mod common;

use busauth_core::{
    chain::CallChain,
    config::ConnectionConfig,
    credential::{CredentialData, CredentialReset},
    crypto::{generate_signing_keypair, LoginKeyPair},
    error::{BusError, BusResult, RejectCode},
    identity::LoginInfo,
    transport::{WireReply, WireRequest},
    InvocationContext, LoginState, ObjectRef, Transport,
};
use common::{whoami, Network, Recorder};
use std::sync::Arc;

fn echo_ref() -> ObjectRef {
    ObjectRef::new("proc-echo", "echo")
}

fn rejection(reply: WireReply) -> Option<(RejectCode, Option<Vec<u8>>)> {
    match reply {
        WireReply::Rejected { code, context, .. } => Some((code, context)),
        _ => None,
    }
}

async fn resend(net: &Network, request: WireRequest) -> BusResult<WireReply> {
    net.local.deliver(request).await
}

#[tokio::test]
async fn test_first_contact_resets_once_then_succeeds() -> BusResult<()> {
    let net = Network::new();
    let alice = net.process("proc-alice", "alice").await?;
    let echo = net.process("proc-echo", "echo").await?;
    echo.endpoint.register("echo", Arc::new(Recorder::default()));
    let client = net.client(&alice);
    let ctx = InvocationContext::new();

    let seen = whoami(&client, &ctx, &echo_ref()).await?;
    assert_eq!(seen.caller, "alice");
    assert!(seen.originators.is_empty());
    // first contact + retry
    assert_eq!(net.transport.deliveries(), 2);
    assert_eq!(alice.connection.outbound_session_count(), 1);
    assert_eq!(echo.connection.inbound_session_count(), 1);

    let first = net.transport.last_credential()?;
    assert_eq!(first.ticket, 1);

    whoami(&client, &ctx, &echo_ref()).await?;
    assert_eq!(net.transport.deliveries(), 3);
    let second = net.transport.last_credential()?;
    assert_eq!(second.session, first.session);
    assert_eq!(second.ticket, 2);
    Ok(())
}

#[tokio::test]
async fn test_replayed_ticket_is_rejected_with_reset() -> BusResult<()> {
    let net = Network::new();
    let alice = net.process("proc-alice", "alice").await?;
    let echo = net.process("proc-echo", "echo").await?;
    echo.endpoint.register("echo", Arc::new(Recorder::default()));
    let client = net.client(&alice);
    let ctx = InvocationContext::new();

    whoami(&client, &ctx, &echo_ref()).await?;
    let accepted = net.transport.last().ok_or(BusError::NoCredential)?;
    let original = net.transport.last_credential()?;

    let (code, context) = rejection(resend(&net, accepted.clone()).await?).ok_or(BusError::NoCredential)?;
    assert_eq!(code, RejectCode::InvalidCredential);
    let reset = CredentialReset::decode(&context.ok_or(BusError::NoCredential)?)?;
    assert_ne!(reset.session, original.session);
    assert_eq!(reset.target.id, echo.login_id()?);
    // the live session survives next to the pending replacement
    assert_eq!(echo.connection.inbound_session_count(), 2);

    // a second replay is offered the same replacement
    let (code, context) = rejection(resend(&net, accepted).await?).ok_or(BusError::NoCredential)?;
    assert_eq!(code, RejectCode::InvalidCredential);
    let again = CredentialReset::decode(&context.ok_or(BusError::NoCredential)?)?;
    assert_eq!(again.session, reset.session);
    assert_eq!(echo.connection.inbound_session_count(), 2);

    // the legitimate caller carries on without a reset
    let before = net.transport.deliveries();
    whoami(&client, &ctx, &echo_ref()).await?;
    assert_eq!(net.transport.deliveries(), before + 1);
    let next = net.transport.last_credential()?;
    assert_eq!(next.session, original.session);
    assert_eq!(next.ticket, original.ticket + 1);
    Ok(())
}

#[tokio::test]
async fn test_first_contact_flood_keeps_live_session() -> BusResult<()> {
    let net = Network::new();
    let alice = net.process("proc-alice", "alice").await?;
    let echo = net.process("proc-echo", "echo").await?;
    echo.endpoint.register("echo", Arc::new(Recorder::default()));
    let client = net.client(&alice);
    let ctx = InvocationContext::new();

    whoami(&client, &ctx, &echo_ref()).await?;
    let original = net.transport.last_credential()?;
    let chain = original.chain.clone();

    // first contacts replayed with alice's captured chain
    for _ in 0..50 {
        let credential = CredentialData::first_contact(common::BUS_ID, &original.login, chain.clone());
        let reply = resend(
            &net,
            WireRequest {
                endpoint: "proc-echo".into(),
                object_id: "echo".into(),
                operation: "whoami".into(),
                context: Some(credential.encode()?),
                payload: Vec::new(),
            },
        )
        .await?;
        let (code, _) = rejection(reply).ok_or(BusError::NoCredential)?;
        assert_eq!(code, RejectCode::InvalidCredential);
    }
    // one live session plus a single pending first-contact reset
    assert_eq!(echo.connection.inbound_session_count(), 2);

    let before = net.transport.deliveries();
    whoami(&client, &ctx, &echo_ref()).await?;
    assert_eq!(net.transport.deliveries(), before + 1);
    assert_eq!(net.transport.last_credential()?.session, original.session);
    Ok(())
}

#[tokio::test]
async fn test_caller_recovers_after_target_relogin() -> BusResult<()> {
    let net = Network::new();
    let alice = net.process("proc-alice", "alice").await?;
    let echo = net.process("proc-echo", "echo").await?;
    echo.endpoint.register("echo", Arc::new(Recorder::default()));
    let client = net.client(&alice);
    let ctx = InvocationContext::new();

    whoami(&client, &ctx, &echo_ref()).await?;
    let previous = echo.login_id()?;

    echo.connection.logout().await?;
    echo.connection
        .login_by_password("echo", common::password("echo").as_bytes(), "")
        .await?;
    let current = echo.login_id()?;
    assert_ne!(previous, current);

    for _ in 0..3 {
        let seen = whoami(&client, &ctx, &echo_ref()).await?;
        assert_eq!(seen.caller, "alice");
    }
    assert_eq!(echo.connection.inbound_session_count(), 1);
    let credential = net.transport.last_credential()?;
    assert_eq!(credential.chain.decode_unverified()?.target, current);
    Ok(())
}

#[tokio::test]
async fn test_forged_authenticator_rejected() -> BusResult<()> {
    let net = Network::new();
    let alice = net.process("proc-alice", "alice").await?;
    let echo = net.process("proc-echo", "echo").await?;
    echo.endpoint.register("echo", Arc::new(Recorder::default()));
    whoami(&net.client(&alice), &InvocationContext::new(), &echo_ref()).await?;

    let mut request = net.transport.last().ok_or(BusError::NoCredential)?;
    let mut credential = net.transport.last_credential()?;
    credential.ticket += 1;
    credential.hash[0] ^= 0x01;
    request.context = Some(credential.encode()?);

    let (code, context) = rejection(resend(&net, request).await?).ok_or(BusError::NoCredential)?;
    assert_eq!(code, RejectCode::InvalidCredential);
    assert!(context.is_some());
    Ok(())
}

#[tokio::test]
async fn test_chain_signed_by_foreign_key_rejected() -> BusResult<()> {
    let net = Network::new();
    let echo = net.process("proc-echo", "echo").await?;
    echo.endpoint.register("echo", Arc::new(Recorder::default()));

    let (rogue_key, _) = generate_signing_keypair();
    let forged = CallChain::direct(
        common::BUS_ID,
        &echo.login_id()?,
        LoginInfo::new("login-mallory", "mallory"),
        LoginKeyPair::generate().public_key(),
    )
    .sign(&rogue_key)?;
    let credential = CredentialData::first_contact(common::BUS_ID, "login-mallory", forged);

    let reply = resend(
        &net,
        WireRequest {
            endpoint: "proc-echo".into(),
            object_id: "echo".into(),
            operation: "whoami".into(),
            context: Some(credential.encode()?),
            payload: Vec::new(),
        },
    )
    .await?;
    let (code, context) = rejection(reply).ok_or(BusError::NoCredential)?;
    assert_eq!(code, RejectCode::InvalidChain);
    assert!(context.is_none());
    assert_eq!(echo.connection.inbound_session_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_chain_of_other_login_rejected() -> BusResult<()> {
    let net = Network::new();
    let alice = net.process("proc-alice", "alice").await?;
    let bob = net.process("proc-bob", "bob").await?;
    let echo = net.process("proc-echo", "echo").await?;
    echo.endpoint.register("echo", Arc::new(Recorder::default()));
    whoami(&net.client(&alice), &InvocationContext::new(), &echo_ref()).await?;

    // alice's chain presented under bob's login
    let mut request = net.transport.last().ok_or(BusError::NoCredential)?;
    let mut credential = net.transport.last_credential()?;
    credential.login = bob.login_id()?;
    request.context = Some(credential.encode()?);

    let (code, _) = rejection(resend(&net, request).await?).ok_or(BusError::NoCredential)?;
    assert_eq!(code, RejectCode::InvalidChain);
    Ok(())
}

#[tokio::test]
async fn test_missing_and_whitelisted_credentials() -> BusResult<()> {
    let net = Network::new();
    let config = ConnectionConfig {
        unauthenticated_operations: vec!["whoami".into()],
        ..ConnectionConfig::default()
    };
    let echo = net.process_with("proc-echo", "echo", config).await?;
    echo.endpoint.register("echo", Arc::new(Recorder::default()));

    let request = |operation: &str| WireRequest {
        endpoint: "proc-echo".into(),
        object_id: "echo".into(),
        operation: operation.into(),
        context: None,
        payload: Vec::new(),
    };

    let (code, _) = rejection(resend(&net, request("fail")).await?).ok_or(BusError::NoCredential)?;
    assert_eq!(code, RejectCode::NoCredential);

    // whitelisted: reaches the handler, which has no chain to report
    assert!(matches!(resend(&net, request("whoami")).await?, WireReply::Failed(_)));
    Ok(())
}

#[tokio::test]
async fn test_unlogged_connection_fails_fast() -> BusResult<()> {
    let net = Network::new();
    let alice = net.process("proc-alice", "alice").await?;
    let echo = net.process("proc-echo", "echo").await?;
    echo.endpoint.register("echo", Arc::new(Recorder::default()));
    let client = net.client(&alice);

    alice.connection.logout().await?;
    assert_eq!(alice.connection.state(), LoginState::Unlogged);
    let result = client.call(&InvocationContext::new(), &echo_ref(), "whoami", b"").await;
    assert!(matches!(result, Err(BusError::NoLogin)));
    assert_eq!(net.transport.deliveries(), 0);
    Ok(())
}

#[tokio::test]
async fn test_no_connection_sends_without_credential() -> BusResult<()> {
    let net = Network::new();
    let alice = net.process("proc-alice", "alice").await?;
    let echo = net.process("proc-echo", "echo").await?;
    echo.endpoint.register("echo", Arc::new(Recorder::default()));
    alice.context.set_default_connection(None);

    let result = net
        .client(&alice)
        .call(&InvocationContext::new(), &echo_ref(), "whoami", b"")
        .await;
    assert!(matches!(result, Err(BusError::NoCredential)));
    assert!(net.transport.last().is_some_and(|r| r.context.is_none()));
    Ok(())
}

#[tokio::test]
async fn test_handler_failure_is_not_a_rejection() -> BusResult<()> {
    let net = Network::new();
    let alice = net.process("proc-alice", "alice").await?;
    let echo = net.process("proc-echo", "echo").await?;
    echo.endpoint.register("echo", Arc::new(Recorder::default()));

    let result = net
        .client(&alice)
        .call(&InvocationContext::new(), &echo_ref(), "fail", b"")
        .await;
    assert!(matches!(result, Err(BusError::OperationFailed(msg)) if msg.contains("requested failure")));
    Ok(())
}
