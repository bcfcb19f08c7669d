//! Login state machine, lease renewal and shared authentication.

mod common;

use busauth_core::{
    config::ConnectionConfig,
    crypto::generate_signing_keypair,
    error::{BusError, BusResult},
    lease::RenewerState,
    BusContext, Connection, InMemoryAccessControl, LoginState, SharedAuthSecret,
};
use common::{access_config, password, Faulty, BUS_ID};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn connection(access: Arc<dyn busauth_core::AccessControl>) -> Connection {
    Connection::new(access, ConnectionConfig::default())
}

async fn logged_in(access: &Arc<InMemoryAccessControl>, entity: &str) -> BusResult<Connection> {
    let conn = connection(access.clone());
    conn.login_by_password(entity, password(entity).as_bytes(), "").await?;
    Ok(conn)
}

#[tokio::test(start_paused = true)]
async fn test_fourth_renewal_failure_invalidates_once() -> BusResult<()> {
    common::init_tracing();
    let faulty = Faulty::new(InMemoryAccessControl::shared(access_config(BUS_ID)));
    faulty.fail_renewal_from.store(4, Ordering::SeqCst);

    let context = BusContext::new(ConnectionConfig::default());
    let conn = context.create_connection(faulty.clone());
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    conn.on_invalid_login(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    conn.login_by_password("alice", password("alice").as_bytes(), "").await?;
    assert_eq!(context.dispatcher().len(), 1);

    // lease is 10s: renewals at 10, 20, 30 succeed, the one at 40 fails
    tokio::time::sleep(Duration::from_secs(35)).await;
    assert_eq!(conn.state(), LoginState::LoggedIn);
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(conn.state(), LoginState::Invalid);
    assert_eq!(faulty.renewals.load(Ordering::SeqCst), 4);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(context.dispatcher().is_empty());

    // relogin from Invalid
    faulty.fail_renewal_from.store(u32::MAX, Ordering::SeqCst);
    conn.login_by_password("alice", password("alice").as_bytes(), "").await?;
    assert_eq!(conn.state(), LoginState::LoggedIn);
    assert_eq!(conn.renewer_state(), Some(RenewerState::Running));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_relogin_from_invalid_callback() -> BusResult<()> {
    let faulty = Faulty::new(InMemoryAccessControl::shared(access_config(BUS_ID)));
    faulty.fail_renewal_from.store(1, Ordering::SeqCst);
    let conn = connection(faulty.clone());
    let faulty_in_cb = Arc::clone(&faulty);
    conn.on_invalid_login(move |conn, _| {
        faulty_in_cb.fail_renewal_from.store(u32::MAX, Ordering::SeqCst);
        let conn = conn.clone();
        tokio::spawn(async move {
            let _ = conn.login_by_password("alice", password("alice").as_bytes(), "").await;
        });
    });

    conn.login_by_password("alice", password("alice").as_bytes(), "").await?;
    let first = conn.login().ok_or(BusError::NoLogin)?;
    tokio::time::sleep(Duration::from_secs(15)).await;

    assert_eq!(conn.state(), LoginState::LoggedIn);
    let second = conn.login().ok_or(BusError::NoLogin)?;
    assert_ne!(first.id, second.id);
    assert_eq!(second.entity, "alice");
    Ok(())
}

#[tokio::test]
async fn test_abandoned_login_leaves_connection_unlogged() -> BusResult<()> {
    let faulty = Faulty::new(InMemoryAccessControl::shared(access_config(BUS_ID)));
    faulty.stall_logins.store(true, Ordering::SeqCst);
    let conn = connection(faulty.clone());

    let attempt = tokio::time::timeout(
        Duration::from_millis(20),
        conn.login_by_password("alice", password("alice").as_bytes(), ""),
    )
    .await;
    assert!(attempt.is_err());
    assert_eq!(conn.state(), LoginState::Unlogged);

    faulty.stall_logins.store(false, Ordering::SeqCst);
    conn.login_by_password("alice", password("alice").as_bytes(), "").await?;
    assert_eq!(conn.state(), LoginState::LoggedIn);
    Ok(())
}

#[tokio::test]
async fn test_certificate_login() -> BusResult<()> {
    let access = InMemoryAccessControl::shared(access_config(BUS_ID));
    let (entity_key, entity_pub) = generate_signing_keypair();
    let conn = connection(access.clone());

    assert!(matches!(
        conn.login_by_private_key("service-x", &entity_key).await,
        Err(BusError::MissingCertificate(_))
    ));
    assert_eq!(conn.state(), LoginState::Unlogged);

    access.register_certificate("service-x", entity_pub);
    let (wrong_key, _) = generate_signing_keypair();
    assert!(matches!(
        conn.login_by_private_key("service-x", &wrong_key).await,
        Err(BusError::AccessDenied(_))
    ));

    conn.login_by_private_key("service-x", &entity_key).await?;
    assert_eq!(conn.login().map(|l| l.entity), Some("service-x".to_string()));
    assert_eq!(conn.bus_id().as_deref(), Some(BUS_ID));
    Ok(())
}

#[tokio::test]
async fn test_shared_auth_redeemable_once() -> BusResult<()> {
    let access = InMemoryAccessControl::shared(access_config(BUS_ID));
    let alice = logged_in(&access, "alice").await?;
    let secret = alice.start_shared_auth().await?;

    let heir = connection(access.clone());
    heir.login_by_shared_auth(&secret).await?;
    let heir_login = heir.login().ok_or(BusError::NoLogin)?;
    assert_eq!(heir_login.entity, "alice");
    assert_ne!(Some(heir_login.id), alice.login().map(|l| l.id));

    let second = connection(access.clone());
    assert!(matches!(
        second.login_by_shared_auth(&secret).await,
        Err(BusError::InvalidSharedAuth(_))
    ));
    assert_eq!(second.state(), LoginState::Unlogged);
    Ok(())
}

#[tokio::test]
async fn test_single_sign_on_redeemable_twice() -> BusResult<()> {
    let access = InMemoryAccessControl::shared(access_config(BUS_ID));
    let alice = logged_in(&access, "alice").await?;
    let sso = alice.start_single_sign_on().await?;

    let first = connection(access.clone());
    let second = connection(access.clone());
    first.login_by_single_sign_on(&sso).await?;
    second.login_by_single_sign_on(&sso).await?;
    assert_ne!(first.login().map(|l| l.id), second.login().map(|l| l.id));

    // a one-time secret is not accepted as single sign-on
    let once = alice.start_shared_auth().await?;
    assert!(matches!(
        connection(access.clone()).login_by_single_sign_on(&once).await,
        Err(BusError::InvalidSharedAuth(_))
    ));

    // the origin logging out ends the single sign-on process
    alice.logout().await?;
    assert!(matches!(
        connection(access.clone()).login_by_single_sign_on(&sso).await,
        Err(BusError::InvalidSharedAuth(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_cancelled_shared_auth_cannot_be_redeemed() -> BusResult<()> {
    let access = InMemoryAccessControl::shared(access_config(BUS_ID));
    let alice = logged_in(&access, "alice").await?;
    let secret = alice.start_shared_auth().await?;
    alice.cancel_shared_auth(&secret).await?;

    assert!(matches!(
        connection(access.clone()).login_by_shared_auth(&secret).await,
        Err(BusError::InvalidSharedAuth(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_shared_auth_file_consumed() -> anyhow::Result<()> {
    let access = InMemoryAccessControl::shared(access_config(BUS_ID));
    let alice = logged_in(&access, "alice").await?;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("handoff.secret");

    alice.start_shared_auth().await?.write_to(&path)?;
    let secret = SharedAuthSecret::consume(&path)?;
    assert!(!path.exists());
    assert!(SharedAuthSecret::consume(&path).is_err());

    let heir = connection(access.clone());
    heir.login_by_shared_auth(&secret).await?;
    assert_eq!(heir.state(), LoginState::LoggedIn);
    Ok(())
}

#[tokio::test]
async fn test_logout_from_invalid_resets_to_unlogged() -> BusResult<()> {
    let access = InMemoryAccessControl::shared(access_config(BUS_ID));
    let alice = logged_in(&access, "alice").await?;
    let login = alice.login().ok_or(BusError::NoLogin)?;
    access.invalidate_login(&login.id);

    assert!(alice.start_shared_auth().await.is_err());
    assert_eq!(alice.state(), LoginState::Invalid);
    assert!(!alice.logout().await?);
    assert_eq!(alice.state(), LoginState::Unlogged);
    Ok(())
}
