//! End-to-end transport negotiation tests.
//!
//! Covers the policy table over real sockets, the TLS upgrade with a
//! self-signed certificate, and signed negotiation tokens.

mod common;

use std::sync::Arc;

use common::{agent_config, client_config, spawn_agent, store, NoPrompt, PASSWORD};
use gridlink::auth::AuthContext;
use gridlink::config::{AgentConfig, ClientConfig};
use gridlink::connection::Connection;
use gridlink::error::ErrorCode;
use gridlink::net::tls::self_signed_pair;
use gridlink::net::TrustConfig;
use gridlink::protocol::{NegotiationKey, Policy, ZoneKeys, ECHO_AN};

const ZONE_KEY: &str = "TEMP_ZONE_KEY";

fn negotiation_key(c: char) -> NegotiationKey {
    NegotiationKey::new(c.to_string().repeat(32)).unwrap()
}

fn tls_agent(policy: Policy) -> (AgentConfig, TrustConfig) {
    let (cert, trust) = self_signed_pair("localhost").unwrap();
    let config = AgentConfig {
        negotiation_policy: policy,
        tls_cert: Some(cert),
        ..agent_config()
    };
    (config, trust)
}

fn negotiating_client(
    addr: std::net::SocketAddr,
    policy: Policy,
    trust: Option<TrustConfig>,
) -> ClientConfig {
    ClientConfig {
        client_server_negotiation: true,
        client_server_policy: policy,
        tls_trust: trust,
        tls_server_name: Some("localhost".into()),
        ..client_config(addr)
    }
}

// =============================================================================
// POLICY TABLE
// =============================================================================

#[tokio::test]
async fn test_require_both_sides_upgrades_to_tls() {
    let (config, trust) = tls_agent(Policy::Require);
    let addr = spawn_agent(config, store()).await;

    let mut conn = Connection::open(negotiating_client(addr, Policy::Require, Some(trust)))
        .await
        .unwrap();
    assert!(conn.is_secure());
    assert_eq!(conn.negotiated(), gridlink::Outcome::Secured);

    conn.authenticate(
        None,
        &AuthContext::new()
            .with_prompt(Arc::new(NoPrompt))
            .with_password(PASSWORD),
    )
    .await
    .unwrap();
    let reply = conn.api_call(ECHO_AN, b"over tls", &[]).await.unwrap();
    assert_eq!(&reply.structure[..], b"over tls");
    assert!(conn.disconnect().await.unwrap());
}

#[tokio::test]
async fn test_dont_care_meets_require() {
    let (config, trust) = tls_agent(Policy::Require);
    let addr = spawn_agent(config, store()).await;

    let conn = Connection::open(negotiating_client(addr, Policy::DontCare, Some(trust)))
        .await
        .unwrap();
    assert!(conn.is_secure());
}

#[tokio::test]
async fn test_dont_care_both_sides_stays_plain() {
    let (config, trust) = tls_agent(Policy::DontCare);
    let addr = spawn_agent(config, store()).await;

    let conn = Connection::open(negotiating_client(addr, Policy::DontCare, Some(trust)))
        .await
        .unwrap();
    assert!(!conn.is_secure());
    assert_eq!(conn.negotiated(), gridlink::Outcome::Plain);
}

#[tokio::test]
async fn test_require_against_refuse_fails() {
    let addr = spawn_agent(agent_config(), store()).await;

    let err = Connection::open(negotiating_client(addr, Policy::Require, None))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::CLIENT_NEGOTIATION_ERROR);
}

#[tokio::test]
async fn test_refuse_against_require_fails() {
    let (config, _) = tls_agent(Policy::Require);
    let addr = spawn_agent(config, store()).await;

    let err = Connection::open(negotiating_client(addr, Policy::Refuse, None))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::CLIENT_NEGOTIATION_ERROR);
}

#[tokio::test]
async fn test_secured_without_trust_fails() {
    let (config, _) = tls_agent(Policy::Require);
    let addr = spawn_agent(config, store()).await;

    let err = Connection::open(negotiating_client(addr, Policy::Require, None))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::CLIENT_NEGOTIATION_ERROR);
}

#[tokio::test]
async fn test_untrusted_certificate_fails_handshake() {
    let (config, _) = tls_agent(Policy::Require);
    let (_, other_trust) = self_signed_pair("localhost").unwrap();
    let addr = spawn_agent(config, store()).await;

    let err = Connection::open(negotiating_client(addr, Policy::Require, Some(other_trust)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::CLIENT_NEGOTIATION_ERROR);
}

// =============================================================================
// DECLINED AND SKIPPED NEGOTIATION
// =============================================================================

#[tokio::test]
async fn test_agent_declines_for_dont_care_client() {
    let addr = spawn_agent(
        AgentConfig {
            negotiation: false,
            ..agent_config()
        },
        store(),
    )
    .await;

    let conn = Connection::open(negotiating_client(addr, Policy::DontCare, None))
        .await
        .unwrap();
    assert!(!conn.is_secure());
}

#[tokio::test]
async fn test_agent_declines_for_require_client() {
    let addr = spawn_agent(
        AgentConfig {
            negotiation: false,
            ..agent_config()
        },
        store(),
    )
    .await;

    let err = Connection::open(negotiating_client(addr, Policy::Require, None))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::CLIENT_NEGOTIATION_ERROR);
}

#[tokio::test]
async fn test_client_without_negotiation_skips_exchange() {
    let (config, _) = tls_agent(Policy::Require);
    let addr = spawn_agent(config, store()).await;

    let conn = Connection::open(client_config(addr)).await.unwrap();
    assert!(!conn.is_secure());
}

// =============================================================================
// SIGNED NEGOTIATION
// =============================================================================

fn signed_agent(require_signed: bool) -> (AgentConfig, TrustConfig) {
    let (mut config, trust) = tls_agent(Policy::DontCare);
    config.zone_key = Some(ZONE_KEY.into());
    config.negotiation_key = Some(negotiation_key('a'));
    config.require_signed_negotiation = require_signed;
    (config, trust)
}

#[tokio::test]
async fn test_signed_require_upgrades() {
    let (config, trust) = signed_agent(true);
    let addr = spawn_agent(config, store()).await;

    let mut client = negotiating_client(addr, Policy::Require, Some(trust));
    client.zone_keys = Some(ZoneKeys {
        zone_key: ZONE_KEY.into(),
        negotiation_key: negotiation_key('a'),
    });
    let conn = Connection::open(client).await.unwrap();
    assert!(conn.is_secure());
}

#[tokio::test]
async fn test_bad_token_degrades_to_refuse() {
    let (config, trust) = signed_agent(false);
    let addr = spawn_agent(config, store()).await;

    let mut client = negotiating_client(addr, Policy::Require, Some(trust));
    client.zone_keys = Some(ZoneKeys {
        zone_key: ZONE_KEY.into(),
        negotiation_key: negotiation_key('b'),
    });
    let err = Connection::open(client).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::SERVER_NEGOTIATION_ERROR);
}

#[tokio::test]
async fn test_unsigned_client_refused_when_signing_required() {
    let (config, trust) = signed_agent(true);
    let addr = spawn_agent(config, store()).await;

    let err = Connection::open(negotiating_client(addr, Policy::Require, Some(trust)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::SERVER_NEGOTIATION_ERROR);
}

#[tokio::test]
async fn test_federated_key_accepted() {
    let (mut config, trust) = signed_agent(true);
    config.federation = vec![ZoneKeys {
        zone_key: "OTHER_ZONE_KEY".into(),
        negotiation_key: negotiation_key('c'),
    }];
    let addr = spawn_agent(config, store()).await;

    let mut client = negotiating_client(addr, Policy::Require, Some(trust));
    client.zone_keys = Some(ZoneKeys {
        zone_key: "OTHER_ZONE_KEY".into(),
        negotiation_key: negotiation_key('c'),
    });
    let conn = Connection::open(client).await.unwrap();
    assert!(conn.is_secure());
}
