//! Agent side of session setup.
//!
//! An [`Agent`] accepts client connections and drives each one through
//! startup, version reply, negotiation and authentication, then serves
//! API requests until the client disconnects.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use gridlink::agent::{Agent, MemoryCredentialStore};
//! use gridlink::auth::SchemeRegistry;
//! use gridlink::config::AgentConfig;
//!
//! let config = AgentConfig::default();
//! let store = Arc::new(MemoryCredentialStore::from_config(&config)?);
//! Agent::new(config, store, SchemeRegistry::with_defaults())
//!     .serve()
//!     .await?;
//! ```

pub mod api;
pub mod session;
pub mod store;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

pub use api::{ApiHandler, ApiRequest, ApiResponse, EchoApiHandler};
pub use session::AgentSession;
pub use store::{CatalogLocation, CredentialStore, MemoryCredentialStore, StoredSecret, UserRecord};

use crate::auth::{digest, dispatch_agent, AuthDocument, SchemeRegistry};
use crate::config::AgentConfig;
use crate::error::{ErrorCode, GridError, Result};
use crate::net::framer::{self, MessageBody, MsgType};
use crate::net::pack::{BinBytesBuf, PackStruct};
use crate::net::tls::{server_config, upgrade_server};
use crate::net::GridStream;
use crate::protocol::negotiation::{agent_decline, agent_negotiate};
use crate::protocol::{
    read_startup, send_version, LimitedPasswordInput, LimitedPasswordOutput, Outcome, Policy,
    RError, ReconnMsg, StartupPack, VersionInfo, API_VERSION, AUTHENTICATION_APN, DEFAULT_COOKIE,
    GET_LIMITED_PASSWORD_AN, RELEASE_VERSION,
};
use crate::reconnect::{ProcState, ReconnectRegistry, SocketSlot, RECONNECT_READ_TIMEOUT};

/// Length of the salt handed out for limited passwords.
pub const LIMITED_PASSWORD_SALT_LEN: usize = 32;

/// Session-setup agent.
pub struct Agent {
    config: Arc<AgentConfig>,
    store: Arc<dyn CredentialStore>,
    registry: SchemeRegistry,
    api: Arc<dyn ApiHandler>,
    reconnect: Option<Arc<ReconnectRegistry>>,
    tls: OnceCell<Arc<rustls::ServerConfig>>,
    active: AtomicUsize,
}

impl Agent {
    /// Agent over `store`, authenticating with the schemes in `registry`.
    pub fn new(
        config: AgentConfig,
        store: Arc<dyn CredentialStore>,
        registry: SchemeRegistry,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            registry,
            api: Arc::new(EchoApiHandler),
            reconnect: None,
            tls: OnceCell::new(),
            active: AtomicUsize::new(0),
        }
    }

    /// Serve post-login API numbers with `handler`.
    pub fn with_api_handler(mut self, handler: Arc<dyn ApiHandler>) -> Self {
        self.api = handler;
        self
    }

    /// Agent settings.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Bind the listener and, if enabled, the reconnect listener.
    pub async fn bind(mut self) -> Result<BoundAgent> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|e| {
                GridError::transport(
                    ErrorCode::USER_SOCK_OPEN_ERR,
                    format!("cannot bind {}: {e}", self.config.listen_addr),
                )
            })?;
        if self.config.reconnect {
            self.reconnect = Some(ReconnectRegistry::bind(&self.config.reconnect_addr).await?);
        }
        let local_addr = listener.local_addr()?;
        info!(
            "Agent for zone {} listening on {}",
            self.config.local_zone, local_addr
        );
        Ok(BoundAgent {
            agent: Arc::new(self),
            listener,
            local_addr,
        })
    }

    /// Bind and serve until the listener fails.
    pub async fn serve(self) -> Result<()> {
        self.bind().await?.serve().await
    }

    async fn tls_config(&self) -> Result<Arc<rustls::ServerConfig>> {
        let config = self
            .tls
            .get_or_try_init(|| async { server_config(&self.config.cert_source()) })
            .await?;
        Ok(Arc::clone(config))
    }

    /// Drive one client connection to completion.
    pub async fn serve_connection(&self, mut tcp: TcpStream) -> Result<()> {
        let _active = ActiveGuard::enter(&self.active);
        let peer = tcp.peer_addr().ok();

        let startup = read_startup(&mut tcp, self.config.startup_timeout()).await?;
        debug!(
            "Startup from {:?}: {}#{} (client {}#{})",
            peer, startup.proxy_user, startup.proxy_zone, startup.client_user, startup.client_zone
        );

        if self.active_connections() > self.config.max_connections {
            warn!(
                "Refusing {:?}: {} connections active",
                peer,
                self.active_connections()
            );
            send_version(&mut tcp, &refusal(ErrorCode::SYS_EXCEED_CONNECT_CNT)).await?;
            return Ok(());
        }

        let negotiating = startup.requests_negotiation() && self.config.negotiation;
        let reconnect = self.offer_reconnect(&startup, negotiating);
        let mut version = VersionInfo {
            status: 0,
            release_version: RELEASE_VERSION.to_string(),
            api_version: API_VERSION.to_string(),
            reconnect_port: 0,
            reconnect_addr: String::new(),
            cookie: DEFAULT_COOKIE,
        };
        if let Some((registry, cookie, _)) = &reconnect {
            let addr = advertised_addr(registry.local_addr(), &tcp);
            version.reconnect_port = i32::from(addr.port());
            version.reconnect_addr = addr.ip().to_string();
            version.cookie = *cookie;
        }
        send_version(&mut tcp, &version).await?;

        let outcome = if negotiating {
            agent_negotiate(
                &mut tcp,
                &self.config.negotiation_settings(),
                Some(self.config.startup_timeout()),
            )
            .await
        } else {
            if startup.requests_negotiation() {
                agent_decline(&mut tcp).await?;
            }
            Ok(Outcome::Plain)
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                forget_cookie(reconnect.as_ref());
                return Err(e);
            },
        };

        let mut session = AgentSession::new(
            Arc::clone(&self.config),
            Arc::clone(&self.store),
            &startup,
            peer,
        );
        let stream = if outcome == Outcome::Secured {
            forget_cookie(reconnect.as_ref());
            let tls = self.tls_config().await?;
            session.set_secured(true);
            upgrade_server(tcp, tls).await?
        } else {
            GridStream::from(tcp)
        };

        let slot = reconnect
            .as_ref()
            .filter(|_| outcome != Outcome::Secured)
            .map(|(_, cookie, slot)| (*cookie, Arc::clone(slot)));
        let result = self.serve_requests(&mut session, stream, slot.as_ref()).await;
        forget_cookie(reconnect.as_ref());
        info!(session = %session.id(), "Session from {:?} ended", peer);
        result
    }

    fn offer_reconnect(
        &self,
        startup: &StartupPack,
        negotiating: bool,
    ) -> Option<(Arc<ReconnectRegistry>, i32, Arc<SocketSlot>)> {
        let registry = self.reconnect.as_ref()?;
        if !startup.wants_reconnect() {
            return None;
        }
        if negotiating && self.config.negotiation_policy == Policy::Require {
            return None;
        }
        let (cookie, slot) = registry.register();
        Some((Arc::clone(registry), cookie, slot))
    }

    async fn serve_requests(
        &self,
        session: &mut AgentSession,
        mut stream: GridStream,
        reconnect: Option<&(i32, Arc<SocketSlot>)>,
    ) -> Result<()> {
        let set_state = |state: ProcState| {
            if let Some((_, slot)) = reconnect {
                slot.set_local(state);
            }
        };

        loop {
            set_state(ProcState::Receiving);
            let (deadline, max_segment) = if session.is_authenticated() {
                (None, framer::MAX_SEGMENT_LEN)
            } else {
                (
                    Some(self.config.challenge_timeout()),
                    framer::MAX_UNAUTHENTICATED_SEGMENT_LEN,
                )
            };
            let read = framer::read_message_within(&mut stream, deadline, max_segment).await;
            let (header, body) = match read {
                Ok(message) => message,
                Err(e) if e.code() == ErrorCode::SYS_SOCK_READ_ERR => {
                    debug!(session = %session.id(), "Client went away: {}", e);
                    break;
                },
                Err(e) => {
                    let _ = stream.close().await;
                    return Err(e);
                },
            };
            set_state(ProcState::Processing);

            match header.msg_type {
                MsgType::Disconnect => {
                    debug!(session = %session.id(), "Client disconnected");
                    break;
                },
                MsgType::Reconnect => {
                    let notice = ReconnMsg::unpack(&body.structure)?;
                    let replacement = match reconnect {
                        Some((cookie, slot)) if *cookie == notice.cookie => {
                            slot.take_within(RECONNECT_READ_TIMEOUT).await
                        },
                        _ => None,
                    };
                    let Some(replacement) = replacement else {
                        let _ = stream.close().await;
                        return Err(GridError::transport(
                            ErrorCode::SYS_RECONNECT_ERR,
                            format!("no reconnect socket parked for cookie {}", notice.cookie),
                        ));
                    };
                    let old = std::mem::replace(&mut stream, replacement);
                    let _ = old.close().await;
                    info!(session = %session.id(), "Switched to reconnect socket");
                },
                MsgType::ApiReq => {
                    let api_number = header.int_info;
                    let reply = self.dispatch_api(session, api_number, body).await;
                    set_state(ProcState::Sending);
                    match reply {
                        Ok(response) => {
                            framer::send_message(
                                &mut stream,
                                MsgType::ApiReply,
                                &response.structure,
                                &response.byte_stream,
                                &[],
                                response.int_info,
                            )
                            .await?;
                        },
                        Err(e) => {
                            warn!(
                                session = %session.id(),
                                "API {} failed: {} ({})",
                                api_number,
                                e,
                                e.code()
                            );
                            let status = e.code().0;
                            let rerror = RError::single(status, e.message());
                            framer::send_message(
                                &mut stream,
                                MsgType::ApiReply,
                                &[],
                                &[],
                                &rerror.pack(),
                                status,
                            )
                            .await?;
                        },
                    }
                },
                other => {
                    let _ = stream.close().await;
                    return Err(GridError::framing(
                        ErrorCode::SYS_HEADER_TYPE_LEN_ERR,
                        format!("unexpected {other} from client"),
                    ));
                },
            }
        }

        if let Err(e) = stream.close().await {
            debug!(session = %session.id(), "Closing stream: {}", e);
        }
        Ok(())
    }

    async fn dispatch_api(
        &self,
        session: &mut AgentSession,
        api_number: i32,
        body: MessageBody,
    ) -> Result<ApiResponse> {
        match api_number {
            AUTHENTICATION_APN => {
                let BinBytesBuf(json) = BinBytesBuf::unpack(&body.structure)?;
                let request = AuthDocument::from_bytes(&json)?;
                let reply = dispatch_agent(&self.registry, session, request).await?;
                Ok(ApiResponse::with_structure(BinBytesBuf(reply.to_bytes()?).pack()))
            },
            GET_LIMITED_PASSWORD_AN => self.issue_limited_password(session, &body.structure),
            _ => {
                if !session.is_authenticated() {
                    return Err(GridError::auth(
                        ErrorCode::SYS_NO_API_PRIV,
                        format!("API {api_number} requires authentication"),
                    ));
                }
                let request = ApiRequest {
                    api_number,
                    structure: body.structure,
                    byte_stream: body.byte_stream,
                };
                debug!(session = %session.id(), "API {} -> {}", api_number, self.api.name());
                self.api.handle(session, request).await
            },
        }
    }

    fn issue_limited_password(
        &self,
        session: &AgentSession,
        structure: &[u8],
    ) -> Result<ApiResponse> {
        if !session.is_authenticated() {
            return Err(GridError::auth(
                ErrorCode::SYS_NO_API_PRIV,
                "limited passwords require an authenticated session",
            ));
        }
        let input = LimitedPasswordInput::unpack(structure)?;
        let max = i64::from(self.config.max_ttl_hours);
        let ttl = i64::from(input.ttl);
        if ttl < 1 || ttl > max {
            return Err(GridError::auth(
                ErrorCode::PAM_AUTH_PASSWORD_INVALID_TTL,
                format!("TTL of {ttl} hours is outside 1..={max}"),
            ));
        }

        let user = session.proxy_user();
        let permanent = self
            .store
            .secrets(&user.name, &user.zone)
            .into_iter()
            .find(|s| !s.is_limited())
            .ok_or_else(|| {
                GridError::auth(
                    ErrorCode::CAT_INVALID_USER,
                    format!("{} has no password to derive from", user.qualified()),
                )
            })?;

        let salt: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(LIMITED_PASSWORD_SALT_LEN)
            .map(char::from)
            .collect();
        let limited = digest::limited_password(&salt, &permanent.password)?;
        let expires_at = Utc::now() + chrono::Duration::hours(ttl);
        self.store
            .add_limited_password(&user.name, &user.zone, limited, expires_at)?;
        info!(
            session = %session.id(),
            "Issued limited password for {} until {}",
            user.qualified(),
            expires_at
        );

        let output = LimitedPasswordOutput {
            string_to_hash_with: salt,
        };
        Ok(ApiResponse::with_structure(output.pack()))
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("listen_addr", &self.config.listen_addr)
            .field("local_zone", &self.config.local_zone)
            .field("schemes", &self.registry.schemes())
            .field("api", &self.api.name())
            .field("reconnect", &self.reconnect.as_ref().map(|r| r.local_addr()))
            .finish_non_exhaustive()
    }
}

/// An [`Agent`] with its listener bound.
#[derive(Debug)]
pub struct BoundAgent {
    agent: Arc<Agent>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl BoundAgent {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The agent.
    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    /// Accept connections, each served on its own task.
    pub async fn serve(self) -> Result<()> {
        loop {
            let (tcp, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept failed: {}", e);
                    continue;
                },
            };
            let agent = Arc::clone(&self.agent);
            tokio::spawn(async move {
                if let Err(e) = agent.serve_connection(tcp).await {
                    warn!("Connection from {} failed: {} ({})", peer, e, e.code());
                }
            });
        }
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn refusal(code: ErrorCode) -> VersionInfo {
    VersionInfo {
        status: code.0,
        release_version: RELEASE_VERSION.to_string(),
        api_version: API_VERSION.to_string(),
        reconnect_port: 0,
        reconnect_addr: String::new(),
        cookie: DEFAULT_COOKIE,
    }
}

fn forget_cookie(reconnect: Option<&(Arc<ReconnectRegistry>, i32, Arc<SocketSlot>)>) {
    if let Some((registry, cookie, _)) = reconnect {
        registry.unregister(*cookie);
    }
}

/// Reconnect address to hand the client; a wildcard bind advertises the
/// address the client already reached.
fn advertised_addr(listener: SocketAddr, tcp: &TcpStream) -> SocketAddr {
    if listener.ip().is_unspecified() {
        if let Ok(local) = tcp.local_addr() {
            return SocketAddr::new(local.ip(), listener.port());
        }
    }
    listener
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{keys, AgentOperation, Operation};
    use crate::protocol::{read_version, send_startup};
    use std::time::Duration;

    fn startup(user: &str, option: &str) -> StartupPack {
        StartupPack {
            protocol: 1,
            reconnect_flag: 0,
            connect_count: 0,
            proxy_user: user.into(),
            proxy_zone: "tempZone".into(),
            client_user: user.into(),
            client_zone: "tempZone".into(),
            release_version: RELEASE_VERSION.into(),
            api_version: API_VERSION.into(),
            option: option.into(),
        }
    }

    async fn bound(config: AgentConfig) -> SocketAddr {
        let store = MemoryCredentialStore::new("tempZone");
        store
            .add_user("alice", "tempZone", crate::identity::UserType::RodsUser, "secret")
            .unwrap();
        let bound = Agent::new(config, Arc::new(store), SchemeRegistry::with_defaults())
            .bind()
            .await
            .unwrap();
        let addr = bound.local_addr();
        tokio::spawn(bound.serve());
        addr
    }

    fn local_config() -> AgentConfig {
        AgentConfig {
            listen_addr: "127.0.0.1:0".into(),
            ..AgentConfig::default()
        }
    }

    async fn api(stream: &mut TcpStream, api_number: i32, structure: &[u8]) -> (i32, MessageBody) {
        framer::send_message(stream, MsgType::ApiReq, structure, &[], &[], api_number)
            .await
            .unwrap();
        let (header, body) = framer::read_message(stream, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        (header.int_info, body)
    }

    #[tokio::test]
    async fn test_version_reply_without_reconnect() {
        let addr = bound(local_config()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_startup(&mut stream, &startup("alice", "")).await.unwrap();
        let version = read_version(&mut stream, Duration::from_secs(5)).await.unwrap();
        assert_eq!(version.status, 0);
        assert_eq!(version.cookie, DEFAULT_COOKIE);
        assert!(!version.offers_reconnect());
    }

    #[tokio::test]
    async fn test_connection_limit_refuses() {
        let addr = bound(AgentConfig {
            max_connections: 0,
            ..local_config()
        })
        .await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_startup(&mut stream, &startup("alice", "")).await.unwrap();
        let err = read_version(&mut stream, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SYS_EXCEED_CONNECT_CNT);
    }

    #[tokio::test]
    async fn test_unauthenticated_api_refused() {
        let addr = bound(local_config()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_startup(&mut stream, &startup("alice", "")).await.unwrap();
        read_version(&mut stream, Duration::from_secs(5)).await.unwrap();

        let (status, body) = api(&mut stream, crate::protocol::ECHO_AN, b"hi").await;
        assert_eq!(status, ErrorCode::SYS_NO_API_PRIV.0);
        let rerror = RError::unpack(&body.error).unwrap();
        assert_eq!(rerror.messages[0].status, ErrorCode::SYS_NO_API_PRIV.0);

        let input = LimitedPasswordInput { ttl: 1, unused: 0 };
        let (status, _) = api(&mut stream, GET_LIMITED_PASSWORD_AN, &input.pack()).await;
        assert_eq!(status, ErrorCode::SYS_NO_API_PRIV.0);
    }

    async fn closed_within(stream: &mut TcpStream, limit: Duration) -> bool {
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 64];
        loop {
            match tokio::time::timeout(limit, stream.read(&mut buf)).await {
                Ok(Ok(0) | Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }

    #[tokio::test]
    async fn test_stalled_body_hits_challenge_timeout() {
        use tokio::io::AsyncWriteExt;
        let addr = bound(AgentConfig {
            challenge_timeout_secs: 1,
            ..local_config()
        })
        .await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_startup(&mut stream, &startup("alice", "")).await.unwrap();
        read_version(&mut stream, Duration::from_secs(5)).await.unwrap();

        // Header announces 100 struct bytes that never arrive.
        let mut wire = Vec::new();
        framer::send_message(&mut wire, MsgType::ApiReq, &[b'x'; 100], &[], &[], 0)
            .await
            .unwrap();
        wire.truncate(wire.len() - 100);
        stream.write_all(&wire).await.unwrap();

        assert!(closed_within(&mut stream, Duration::from_secs(4)).await);
    }

    #[tokio::test]
    async fn test_oversized_unauthenticated_segment_closes() {
        use tokio::io::AsyncWriteExt;
        let addr = bound(local_config()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_startup(&mut stream, &startup("alice", "")).await.unwrap();
        read_version(&mut stream, Duration::from_secs(5)).await.unwrap();

        let len = framer::MAX_UNAUTHENTICATED_SEGMENT_LEN + 1;
        let mut wire = Vec::new();
        framer::send_message(&mut wire, MsgType::ApiReq, &vec![b'x'; len], &[], &[], 0)
            .await
            .unwrap();
        wire.truncate(wire.len() - len);
        stream.write_all(&wire).await.unwrap();

        assert!(closed_within(&mut stream, Duration::from_secs(4)).await);
    }

    #[tokio::test]
    async fn test_auth_request_issues_challenge() {
        let addr = bound(local_config()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_startup(&mut stream, &startup("alice", "")).await.unwrap();
        read_version(&mut stream, Duration::from_secs(5)).await.unwrap();

        let mut request = AuthDocument::new();
        request
            .set(keys::SCHEME, "native")
            .set(keys::NEXT_OPERATION, AgentOperation::AgentRequest.as_str())
            .set(keys::USER_NAME, "alice")
            .set(keys::ZONE_NAME, "tempZone");
        let payload = BinBytesBuf(request.to_bytes().unwrap()).pack();
        let (status, body) = api(&mut stream, AUTHENTICATION_APN, &payload).await;
        assert_eq!(status, 0);

        let BinBytesBuf(json) = BinBytesBuf::unpack(&body.structure).unwrap();
        let reply = AuthDocument::from_bytes(&json).unwrap();
        let challenge = reply.get_str(keys::REQUEST_RESULT).unwrap();
        assert!(crate::auth::Challenge::from_base64(challenge).is_ok());
    }

    #[tokio::test]
    async fn test_unknown_scheme_keeps_connection() {
        let addr = bound(local_config()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_startup(&mut stream, &startup("alice", "")).await.unwrap();
        read_version(&mut stream, Duration::from_secs(5)).await.unwrap();

        let mut request = AuthDocument::new();
        request
            .set(keys::SCHEME, "kerberos")
            .set(keys::NEXT_OPERATION, AgentOperation::AgentRequest.as_str());
        let payload = BinBytesBuf(request.to_bytes().unwrap()).pack();
        let (status, _) = api(&mut stream, AUTHENTICATION_APN, &payload).await;
        assert_eq!(status, ErrorCode::AUTH_SCHEME_NOT_SUPPORTED.0);

        let (status, _) = api(&mut stream, crate::protocol::ECHO_AN, b"hi").await;
        assert_eq!(status, ErrorCode::SYS_NO_API_PRIV.0);
    }
}
