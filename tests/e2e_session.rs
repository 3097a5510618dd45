//! End-to-end session tests.
//!
//! A real agent runs on a loopback port; the client connects, authenticates
//! with the native scheme and exchanges API messages over TCP.

mod common;

use std::sync::Arc;

use chrono::Utc;
use common::{agent_config, client_config, spawn_agent, store, NoPrompt, PASSWORD, USER, ZONE};
use gridlink::auth::{AuthContext, AuthFile, HashScheme, Password};
use gridlink::config::AgentConfig;
use gridlink::connection::Connection;
use gridlink::error::ErrorCode;
use gridlink::protocol::ECHO_AN;

fn ctx() -> AuthContext {
    AuthContext::new().with_prompt(Arc::new(NoPrompt))
}

// =============================================================================
// LOGIN
// =============================================================================

#[tokio::test]
async fn test_login_with_password() {
    let addr = spawn_agent(agent_config(), store()).await;
    let mut conn = Connection::open(client_config(addr)).await.unwrap();
    assert!(conn.is_connected());
    assert!(!conn.is_logged_in());
    assert!(!conn.is_secure());

    conn.authenticate(None, &ctx().with_password(PASSWORD))
        .await
        .unwrap();

    assert!(conn.is_logged_in());
    assert_eq!(conn.auth_scheme(), Some("native"));
    let signature = conn.session_signature().unwrap();
    assert_eq!(signature.as_str().len(), 32);
    assert!(signature.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    assert!(conn.errors().is_empty());

    // A second call is a no-op.
    conn.authenticate(None, &ctx()).await.unwrap();
    assert!(conn.disconnect().await.unwrap());
}

#[tokio::test]
async fn test_wrong_password_keeps_connection() {
    let addr = spawn_agent(agent_config(), store()).await;
    let mut conn = Connection::open(client_config(addr)).await.unwrap();

    let err = conn
        .authenticate(None, &ctx().with_password("not-the-password"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::CAT_INVALID_AUTHENTICATION);
    assert!(conn.is_connected());
    assert!(!conn.is_logged_in());
    assert_eq!(
        conn.errors().last().unwrap().code,
        ErrorCode::CAT_INVALID_AUTHENTICATION
    );

    conn.authenticate(None, &ctx().with_password(PASSWORD))
        .await
        .unwrap();
    assert!(conn.is_logged_in());
}

#[tokio::test]
async fn test_unknown_user_rejected() {
    let addr = spawn_agent(agent_config(), store()).await;
    let mut config = client_config(addr);
    config.user_name = "mallory".into();
    let mut conn = Connection::open(config).await.unwrap();

    let err = conn
        .authenticate(None, &ctx().with_password("whatever"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::CAT_INVALID_USER);
}

#[tokio::test]
async fn test_unknown_scheme_rejected_locally() {
    let addr = spawn_agent(agent_config(), store()).await;
    let mut conn = Connection::open(client_config(addr)).await.unwrap();

    let err = conn
        .authenticate(Some("kerberos"), &ctx().with_password(PASSWORD))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::AUTH_SCHEME_NOT_SUPPORTED);
    assert!(conn.is_connected());
}

#[tokio::test]
async fn test_no_password_source_fails() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_agent(agent_config(), store()).await;
    let mut conn = Connection::open(client_config(addr)).await.unwrap();

    let err = conn
        .authenticate(None, &ctx().with_auth_file(dir.path().join("missing")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::USER_AUTH_STRING_EMPTY);
    assert!(!conn.is_logged_in());
}

#[tokio::test]
async fn test_oversized_password_rejected() {
    let addr = spawn_agent(agent_config(), store()).await;
    let mut conn = Connection::open(client_config(addr)).await.unwrap();

    let err = conn
        .authenticate(None, &ctx().with_password("x".repeat(51)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::PASSWORD_EXCEEDS_MAX_SIZE);
}

// =============================================================================
// AUTH FILE AND LIMITED PASSWORDS
// =============================================================================

#[tokio::test]
async fn test_recorded_password_reused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".gridA");
    let addr = spawn_agent(agent_config(), store()).await;

    let mut conn = Connection::open(client_config(addr)).await.unwrap();
    conn.authenticate(
        None,
        &ctx()
            .with_password(PASSWORD)
            .record_auth_file(true)
            .with_auth_file(&path),
    )
    .await
    .unwrap();
    conn.disconnect().await.unwrap();

    let saved = AuthFile::new(&path).load().unwrap().unwrap();
    assert_eq!(saved, Password::new(PASSWORD).unwrap());

    let mut again = Connection::open(client_config(addr)).await.unwrap();
    again
        .authenticate(None, &ctx().with_auth_file(&path))
        .await
        .unwrap();
    assert!(again.is_logged_in());
}

#[tokio::test]
async fn test_ttl_login_records_limited_password() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".gridA");
    let addr = spawn_agent(agent_config(), store()).await;

    let mut conn = Connection::open(client_config(addr)).await.unwrap();
    conn.authenticate(
        None,
        &ctx()
            .with_password(PASSWORD)
            .with_ttl(1)
            .with_auth_file(&path),
    )
    .await
    .unwrap();
    assert!(conn.is_logged_in());
    conn.disconnect().await.unwrap();

    let saved = AuthFile::new(&path).load().unwrap().unwrap();
    assert_ne!(saved, Password::new(PASSWORD).unwrap());
    assert_eq!(saved.as_bytes().len(), 32);

    let mut again = Connection::open(client_config(addr)).await.unwrap();
    again
        .authenticate(None, &ctx().with_auth_file(&path))
        .await
        .unwrap();
    assert!(again.is_logged_in());
}

#[tokio::test]
async fn test_ttl_login_with_mismatched_hash_schemes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".gridA");
    let addr = spawn_agent(
        AgentConfig {
            default_hash_scheme: HashScheme::Sha256,
            ..agent_config()
        },
        store(),
    )
    .await;
    let client = client_config(addr);
    assert_eq!(client.default_hash_scheme, HashScheme::Md5);

    let mut conn = Connection::open(client.clone()).await.unwrap();
    conn.authenticate(
        None,
        &ctx()
            .with_password(PASSWORD)
            .with_ttl(1)
            .with_auth_file(&path),
    )
    .await
    .unwrap();
    assert!(conn.is_logged_in());
    conn.disconnect().await.unwrap();

    let mut again = Connection::open(client).await.unwrap();
    again
        .authenticate(None, &ctx().with_auth_file(&path))
        .await
        .unwrap();
    assert!(again.is_logged_in());
}

#[tokio::test]
async fn test_expired_limited_password_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".gridA");
    let store = store();
    let addr = spawn_agent(agent_config(), Arc::clone(&store)).await;

    let mut conn = Connection::open(client_config(addr)).await.unwrap();
    conn.authenticate(
        None,
        &ctx()
            .with_password(PASSWORD)
            .with_ttl(2)
            .with_auth_file(&path),
    )
    .await
    .unwrap();
    conn.disconnect().await.unwrap();

    store.expire_limited_passwords(USER, ZONE, Utc::now() - chrono::Duration::minutes(1));

    let mut again = Connection::open(client_config(addr)).await.unwrap();
    let err = again
        .authenticate(None, &ctx().with_auth_file(&path))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::CAT_PASSWORD_EXPIRED);
}

#[tokio::test]
async fn test_ttl_above_maximum_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_agent(
        AgentConfig {
            max_ttl_hours: 4,
            ..agent_config()
        },
        store(),
    )
    .await;

    let mut conn = Connection::open(client_config(addr)).await.unwrap();
    let err = conn
        .authenticate(
            None,
            &ctx()
                .with_password(PASSWORD)
                .with_ttl(5)
                .with_auth_file(dir.path().join(".gridA")),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::PAM_AUTH_PASSWORD_INVALID_TTL);
}

// =============================================================================
// API TRAFFIC AND TEARDOWN
// =============================================================================

#[tokio::test]
async fn test_api_requires_login() {
    let addr = spawn_agent(agent_config(), store()).await;
    let mut conn = Connection::open(client_config(addr)).await.unwrap();

    let err = conn.api_call(ECHO_AN, b"ping", &[]).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::SYS_NO_API_PRIV);
    assert!(conn.is_connected());

    conn.authenticate(None, &ctx().with_password(PASSWORD))
        .await
        .unwrap();
    let reply = conn.api_call(ECHO_AN, b"ping", b"\x00\x01").await.unwrap();
    assert_eq!(reply.int_info, 0);
    assert_eq!(&reply.structure[..], b"ping");
    assert_eq!(&reply.byte_stream[..], b"\x00\x01");
}

#[tokio::test]
async fn test_unserved_api_number() {
    let addr = spawn_agent(agent_config(), store()).await;
    let mut conn = Connection::open(client_config(addr)).await.unwrap();
    conn.authenticate(None, &ctx().with_password(PASSWORD))
        .await
        .unwrap();

    let err = conn.api_call(1234, &[], &[]).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::SYS_UNMATCHED_API_NUM);
}

#[tokio::test]
async fn test_disconnect_twice() {
    let addr = spawn_agent(agent_config(), store()).await;
    let mut conn = Connection::open(client_config(addr)).await.unwrap();

    assert!(conn.disconnect().await.unwrap());
    assert!(!conn.is_connected());
    assert!(!conn.disconnect().await.unwrap());

    let err = conn.api_call(ECHO_AN, &[], &[]).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::SYS_SOCK_READ_ERR);
}

#[tokio::test]
async fn test_connect_refused_when_nothing_listens() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = client_config(addr);
    config.connect_timeout_secs = 1;
    let err = Connection::open(config).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::USER_SOCK_CONNECT_ERR);
}

#[tokio::test]
async fn test_connection_limit() {
    let addr = spawn_agent(
        AgentConfig {
            max_connections: 1,
            ..agent_config()
        },
        store(),
    )
    .await;

    let first = Connection::open(client_config(addr)).await.unwrap();
    let err = Connection::open(client_config(addr)).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::SYS_EXCEED_CONNECT_CNT);
    drop(first);
}
