//! Per-connection agent state.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use super::store::CredentialStore;
use crate::auth::{Challenge, SessionSignature};
use crate::config::AgentConfig;
use crate::identity::{PrivilegeLevel, UserIdentity, UserType};
use crate::protocol::StartupPack;

/// State the agent keeps for one client connection.
pub struct AgentSession {
    id: Uuid,
    peer: Option<SocketAddr>,
    proxy: UserIdentity,
    client: UserIdentity,
    config: Arc<AgentConfig>,
    store: Arc<dyn CredentialStore>,
    challenge: Option<Challenge>,
    signature: Option<SessionSignature>,
    auth_scheme: Option<String>,
    authenticated: bool,
    secured: bool,
}

impl AgentSession {
    /// Session for the user named in `startup`.
    ///
    /// An empty client user means the proxy acts for itself.
    pub fn new(
        config: Arc<AgentConfig>,
        store: Arc<dyn CredentialStore>,
        startup: &StartupPack,
        peer: Option<SocketAddr>,
    ) -> Self {
        let proxy = UserIdentity::new(&startup.proxy_user, &startup.proxy_zone);
        let client = if startup.client_user.is_empty() {
            proxy.clone()
        } else {
            let zone = if startup.client_zone.is_empty() {
                &startup.proxy_zone
            } else {
                &startup.client_zone
            };
            UserIdentity::new(&startup.client_user, zone)
        };

        Self {
            id: Uuid::new_v4(),
            peer,
            proxy,
            client,
            config,
            store,
            challenge: None,
            signature: None,
            auth_scheme: None,
            authenticated: false,
            secured: false,
        }
    }

    /// Session id for log correlation.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Remote address.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Authenticating user.
    pub fn proxy_user(&self) -> &UserIdentity {
        &self.proxy
    }

    /// User acted for.
    pub fn client_user(&self) -> &UserIdentity {
        &self.client
    }

    /// Agent settings.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Credential store.
    pub fn store(&self) -> &dyn CredentialStore {
        self.store.as_ref()
    }

    /// Record a fresh challenge, replacing any outstanding one.
    ///
    /// The first challenge of a session fixes its signature.
    pub fn set_challenge(&mut self, challenge: Challenge) {
        if self.signature.is_none() {
            self.signature = Some(challenge.session_signature());
        }
        self.challenge = Some(challenge);
    }

    /// Consume the outstanding challenge.
    pub fn take_challenge(&mut self) -> Option<Challenge> {
        self.challenge.take()
    }

    /// Session signature, once a challenge was issued.
    pub fn session_signature(&self) -> Option<&SessionSignature> {
        self.signature.as_ref()
    }

    /// Record the scheme in use.
    pub fn set_auth_scheme(&mut self, scheme: &str) {
        self.auth_scheme = Some(scheme.to_string());
    }

    /// Scheme in use.
    pub fn auth_scheme(&self) -> Option<&str> {
        self.auth_scheme.as_deref()
    }

    /// Mark the session authenticated with resolved privileges.
    pub fn complete_login(
        &mut self,
        proxy_type: UserType,
        proxy: PrivilegeLevel,
        client: PrivilegeLevel,
    ) {
        self.proxy.user_type = Some(proxy_type);
        self.proxy.privilege = proxy;
        self.client.privilege = client;
        self.authenticated = true;
        info!(
            session = %self.id,
            "Authenticated {} ({}) acting for {} ({})",
            self.proxy.qualified(),
            proxy,
            self.client.qualified(),
            client
        );
    }

    /// Check if a login completed on this session.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Record that the stream was upgraded to TLS.
    pub fn set_secured(&mut self, secured: bool) {
        self.secured = secured;
    }

    /// Check if the stream is TLS.
    pub fn is_secured(&self) -> bool {
        self.secured
    }
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("proxy", &self.proxy)
            .field("client", &self.client)
            .field("auth_scheme", &self.auth_scheme)
            .field("authenticated", &self.authenticated)
            .field("secured", &self.secured)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::store::MemoryCredentialStore;

    fn startup(proxy: &str, client: &str) -> StartupPack {
        StartupPack {
            protocol: 1,
            reconnect_flag: 0,
            connect_count: 0,
            proxy_user: proxy.into(),
            proxy_zone: "tempZone".into(),
            client_user: client.into(),
            client_zone: String::new(),
            release_version: crate::protocol::RELEASE_VERSION.into(),
            api_version: crate::protocol::API_VERSION.into(),
            option: String::new(),
        }
    }

    fn session(proxy: &str, client: &str) -> AgentSession {
        AgentSession::new(
            Arc::new(AgentConfig::default()),
            Arc::new(MemoryCredentialStore::new("tempZone")),
            &startup(proxy, client),
            None,
        )
    }

    #[test]
    fn test_client_defaults_to_proxy() {
        let s = session("alice", "");
        assert_eq!(s.client_user(), s.proxy_user());

        let s = session("admin", "carol");
        assert_eq!(s.client_user().name, "carol");
        assert_eq!(s.client_user().zone, "tempZone");
    }

    #[test]
    fn test_signature_fixed_by_first_challenge() {
        let mut s = session("alice", "");
        let first = Challenge::random();
        let expected = first.session_signature();
        s.set_challenge(first);
        s.set_challenge(Challenge::random());
        assert_eq!(s.session_signature(), Some(&expected));
    }

    #[test]
    fn test_challenge_single_use() {
        let mut s = session("alice", "");
        s.set_challenge(Challenge::random());
        assert!(s.take_challenge().is_some());
        assert!(s.take_challenge().is_none());
    }
}
