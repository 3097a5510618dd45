//! Shared fixtures: an in-process agent and matching client settings.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use gridlink::auth::PasswordPrompt;
use gridlink::config::{AgentConfig, ClientConfig};
use gridlink::error::{ErrorCode, GridError, Result};
use gridlink::{Agent, MemoryCredentialStore, SchemeRegistry, UserType};

pub const ZONE: &str = "tempZone";
pub const USER: &str = "alice";
pub const PASSWORD: &str = "alice-secret";

/// Prompt that never answers, so tests fail instead of reading stdin.
#[derive(Debug, Default)]
pub struct NoPrompt;

impl PasswordPrompt for NoPrompt {
    fn read_password(&self, _prompt: &str) -> Result<String> {
        Err(GridError::auth(
            ErrorCode::USER_AUTH_STRING_EMPTY,
            "no interactive input in tests",
        ))
    }
}

/// Agent settings bound to loopback ports.
pub fn agent_config() -> AgentConfig {
    AgentConfig {
        listen_addr: "127.0.0.1:0".into(),
        reconnect_addr: "127.0.0.1:0".into(),
        local_zone: ZONE.into(),
        ..AgentConfig::default()
    }
}

/// Store with `alice` (rodsuser) and `rods` (rodsadmin).
pub fn store() -> Arc<MemoryCredentialStore> {
    let store = MemoryCredentialStore::new(ZONE);
    store
        .add_user(USER, ZONE, UserType::RodsUser, PASSWORD)
        .unwrap();
    store
        .add_user("rods", ZONE, UserType::RodsAdmin, "rods-secret")
        .unwrap();
    Arc::new(store)
}

/// Start an agent on a background task; returns its address.
pub async fn spawn_agent(config: AgentConfig, store: Arc<MemoryCredentialStore>) -> SocketAddr {
    let bound = Agent::new(config, store, SchemeRegistry::with_defaults())
        .bind()
        .await
        .unwrap();
    let addr = bound.local_addr();
    tokio::spawn(bound.serve());
    addr
}

/// Client settings for `alice` against `addr`.
pub fn client_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        user_name: USER.into(),
        zone_name: ZONE.into(),
        ..ClientConfig::default()
    }
}
