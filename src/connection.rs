//! Client connection: connect, handshake, negotiate, authenticate, call.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{authenticate_client, AuthContext, SchemeRegistry, SessionSignature};
use crate::config::ClientConfig;
use crate::error::{ErrorCode, ErrorStack, GridError, Result};
use crate::identity::UserIdentity;
use crate::net::framer::{self, MsgType};
use crate::net::pack::PackStruct;
use crate::net::{attempt_connect, tls, GridStream};
use crate::protocol::negotiation::{client_negotiate, Outcome};
use crate::protocol::{
    read_version, send_startup, LimitedPasswordInput, LimitedPasswordOutput, RError, ReconnMsg,
    StartupPack, VersionInfo, API_VERSION, GET_LIMITED_PASSWORD_AN, PROTOCOL_ID, RELEASE_VERSION,
    REQUEST_SERVER_NEGOTIATION,
};
use crate::reconnect::{send_reconn_msg, ProcState, ReconnectHandle, ReconnectTarget};

/// Reply to an API request.
#[derive(Debug, Clone, Default)]
pub struct ApiReply {
    /// Status (non-negative on success)
    pub int_info: i32,
    /// Packed structure
    pub structure: Bytes,
    /// Raw byte stream
    pub byte_stream: Bytes,
}

/// Connect to `host:port` as `user#zone`.
///
/// Fields of `config` other than the target and identity are used as is.
pub async fn connect(
    host: &str,
    port: u16,
    user: &str,
    zone: &str,
    reconnect: bool,
    mut config: ClientConfig,
) -> Result<Connection> {
    config.host = host.to_string();
    config.port = port;
    config.user_name = user.to_string();
    config.zone_name = zone.to_string();
    config.reconnect = reconnect;
    Connection::open(config).await
}

/// An established session with an agent.
pub struct Connection {
    id: Uuid,
    config: ClientConfig,
    registry: Arc<SchemeRegistry>,
    stream: Option<GridStream>,
    version: VersionInfo,
    outcome: Outcome,
    proxy: UserIdentity,
    client: UserIdentity,
    session_signature: Option<SessionSignature>,
    auth_scheme: Option<String>,
    logged_in: bool,
    errors: ErrorStack,
    reconnect: Option<ReconnectHandle>,
}

impl Connection {
    /// Connect, exchange versions and negotiate transport per `config`.
    pub async fn open(config: ClientConfig) -> Result<Self> {
        let id = Uuid::new_v4();
        let proxy = UserIdentity::new(&config.user_name, &config.zone_name);
        let client = UserIdentity::new(
            config.client_user_name.as_deref().unwrap_or(&config.user_name),
            config.client_zone_name.as_deref().unwrap_or(&config.zone_name),
        );
        if proxy.name.is_empty() {
            return Err(GridError::auth(
                ErrorCode::SYS_INVALID_INPUT_PARAM,
                "no user name configured",
            ));
        }

        let mut tcp = attempt_connect(&config.host, config.port, &config.connect_options()).await?;

        let mut option = config.program_name.clone();
        if config.client_server_negotiation {
            option.push(';');
            option.push_str(REQUEST_SERVER_NEGOTIATION);
        }
        let startup = StartupPack {
            protocol: PROTOCOL_ID,
            reconnect_flag: i32::from(config.reconnect),
            connect_count: 0,
            proxy_user: proxy.name.clone(),
            proxy_zone: proxy.zone.clone(),
            client_user: client.name.clone(),
            client_zone: client.zone.clone(),
            release_version: RELEASE_VERSION.to_string(),
            api_version: API_VERSION.to_string(),
            option,
        };
        let handshake = async {
            send_startup(&mut tcp, &startup).await?;
            let version = read_version(&mut tcp, config.version_timeout()).await?;
            debug!(
                connection = %id,
                "Agent release {} api {} cookie {}",
                version.release_version, version.api_version, version.cookie
            );

            let outcome = if config.client_server_negotiation {
                client_negotiate(
                    &mut tcp,
                    config.client_server_policy,
                    config.zone_keys.as_ref(),
                    Some(config.version_timeout()),
                )
                .await?
            } else {
                Outcome::Plain
            };
            Ok::<_, GridError>((version, outcome))
        };
        let (version, outcome) = match handshake.await {
            Ok(agreed) => agreed,
            Err(e) => {
                let _ = GridStream::from(tcp).close().await;
                return Err(e);
            },
        };

        let stream = match outcome {
            Outcome::Secured => {
                let tls_config = config
                    .trust()
                    .ok_or_else(|| {
                        GridError::negotiation(
                            ErrorCode::CLIENT_NEGOTIATION_ERROR,
                            "TLS negotiated but no CA certificate is configured",
                        )
                    })
                    .and_then(|trust| tls::client_config(&trust));
                let tls_config = match tls_config {
                    Ok(tls_config) => tls_config,
                    Err(e) => {
                        let _ = GridStream::from(tcp).close().await;
                        return Err(e);
                    },
                };
                tls::upgrade_client(tcp, tls_config, config.server_name()).await?
            },
            _ => GridStream::from(tcp),
        };

        let reconnect = if config.reconnect && version.offers_reconnect() && !stream.is_secure() {
            reconnect_port(&version).map(|port| {
                ReconnectHandle::spawn(ReconnectTarget {
                    host: version.reconnect_addr.clone(),
                    port,
                    cookie: version.cookie,
                    window: config.reconnect_window(),
                    options: config.connect_options(),
                })
            })
        } else {
            None
        };

        info!(
            connection = %id,
            "Connected to {}:{} as {} ({})",
            config.host,
            config.port,
            proxy.qualified(),
            if stream.is_secure() { "TLS" } else { "plain" }
        );

        Ok(Self {
            id,
            config,
            registry: Arc::new(SchemeRegistry::with_defaults()),
            stream: Some(stream),
            version,
            outcome,
            proxy,
            client,
            session_signature: None,
            auth_scheme: None,
            logged_in: false,
            errors: ErrorStack::new(),
            reconnect,
        })
    }

    /// Use `registry` for scheme lookups.
    pub fn with_registry(mut self, registry: Arc<SchemeRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Authenticate with the configured scheme or `scheme_override`.
    ///
    /// A failure leaves the connection open; retrying starts a fresh flow.
    pub async fn authenticate(
        &mut self,
        scheme_override: Option<&str>,
        ctx: &AuthContext,
    ) -> Result<()> {
        if self.logged_in {
            debug!(connection = %self.id, "Already authenticated");
            return Ok(());
        }
        self.stream_mut()?;

        let scheme = scheme_override
            .unwrap_or(self.config.authentication_scheme.as_str())
            .to_lowercase();
        let registry = Arc::clone(&self.registry);
        match authenticate_client(self, &registry, &scheme, ctx).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(connection = %self.id, "Authentication failed: {}", err);
                let already = self
                    .errors
                    .last()
                    .is_some_and(|e| e.code == err.code() && e.message == err.message());
                if !already {
                    self.errors.record(&err);
                }
                Err(err)
            },
        }
    }

    /// Send an API request and wait for its reply.
    pub async fn api_call(
        &mut self,
        api_number: i32,
        structure: &[u8],
        byte_stream: &[u8],
    ) -> Result<ApiReply> {
        self.api_call_within(api_number, structure, byte_stream, None)
            .await
    }

    /// [`api_call`](Self::api_call) with a reply deadline.
    pub async fn api_call_within(
        &mut self,
        api_number: i32,
        structure: &[u8],
        byte_stream: &[u8],
        deadline: Option<Duration>,
    ) -> Result<ApiReply> {
        let result = self
            .exchange(api_number, structure, byte_stream, deadline)
            .await;
        self.set_state(ProcState::Processing);
        match result {
            Ok(reply) => Ok(reply),
            Err(err) => {
                self.errors.record(&err);
                if err.is_fatal_to_stream() {
                    if let Some(stream) = self.stream.take() {
                        let _ = stream.close().await;
                    }
                    self.logged_in = false;
                }
                Err(err)
            },
        }
    }

    async fn exchange(
        &mut self,
        api_number: i32,
        structure: &[u8],
        byte_stream: &[u8],
        deadline: Option<Duration>,
    ) -> Result<ApiReply> {
        self.checkpoint().await?;

        self.set_state(ProcState::Sending);
        let stream = self.stream_mut()?;
        framer::send_message(
            stream,
            MsgType::ApiReq,
            structure,
            byte_stream,
            &[],
            api_number,
        )
        .await?;

        self.set_state(ProcState::Receiving);
        let stream = self.stream_mut()?;
        let header = framer::read_header(stream, deadline).await?;
        framer::expect_type(&header, MsgType::ApiReply)?;
        let body = framer::read_body(stream, &header).await?;

        if header.int_info < 0 {
            return Err(reply_error(header.int_info, &body.error));
        }
        Ok(ApiReply {
            int_info: header.int_info,
            structure: body.structure,
            byte_stream: body.byte_stream,
        })
    }

    /// Adopt a parked reconnect socket, if one is waiting.
    async fn checkpoint(&mut self) -> Result<()> {
        let Some(replacement) = self.reconnect.as_ref().and_then(|r| r.slot().take()) else {
            return Ok(());
        };
        let cookie = self.reconnect.as_ref().map_or(0, ReconnectHandle::cookie);

        let notice = ReconnMsg {
            status: 0,
            cookie,
            proc_state: ProcState::Processing.as_i32(),
            flag: 0,
        };
        let stream = self.stream_mut()?;
        send_reconn_msg(stream, &notice).await?;

        if let Some(old) = self.stream.replace(replacement) {
            if let Err(e) = old.close().await {
                debug!(connection = %self.id, "Closing replaced socket: {}", e);
            }
        }
        info!(connection = %self.id, "Switched to reconnect socket");
        Ok(())
    }

    fn set_state(&self, state: ProcState) {
        if let Some(reconnect) = &self.reconnect {
            reconnect.slot().set_local(state);
        }
    }

    fn stream_mut(&mut self) -> Result<&mut GridStream> {
        self.stream.as_mut().ok_or_else(|| {
            GridError::transport(ErrorCode::SYS_SOCK_READ_ERR, "connection is closed")
        })
    }

    /// Fetch salt for a limited password valid for `ttl_hours`.
    pub async fn get_limited_password(&mut self, ttl_hours: i32) -> Result<String> {
        let input = LimitedPasswordInput {
            ttl: ttl_hours,
            unused: 0,
        };
        let reply = self
            .api_call(GET_LIMITED_PASSWORD_AN, &input.pack(), &[])
            .await?;
        Ok(LimitedPasswordOutput::unpack(&reply.structure)?.string_to_hash_with)
    }

    /// Tell the agent goodbye and close the stream.
    ///
    /// Returns `Ok(false)` if the connection was already closed.
    pub async fn disconnect(&mut self) -> Result<bool> {
        let parked = self.reconnect.take().and_then(ReconnectHandle::shutdown);
        if let Some(parked) = parked {
            let _ = parked.close().await;
        }

        let Some(mut stream) = self.stream.take() else {
            return Ok(false);
        };
        if let Err(e) = framer::send_message(&mut stream, MsgType::Disconnect, &[], &[], &[], 0).await
        {
            debug!(connection = %self.id, "Sending disconnect: {}", e);
        }
        stream.close().await?;
        self.logged_in = false;
        info!(connection = %self.id, "Disconnected");
        Ok(true)
    }

    /// Connection id for log correlation.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Client settings.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Agent version reply.
    pub fn server_version(&self) -> &VersionInfo {
        &self.version
    }

    /// Negotiated transport.
    pub fn negotiated(&self) -> Outcome {
        self.outcome
    }

    /// Check if the stream is TLS.
    pub fn is_secure(&self) -> bool {
        self.stream.as_ref().is_some_and(GridStream::is_secure)
    }

    /// Check if the stream is open.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Local address of the active socket.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.stream.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Authenticating user.
    pub fn proxy_user(&self) -> &UserIdentity {
        &self.proxy
    }

    /// User acted for.
    pub fn client_user(&self) -> &UserIdentity {
        &self.client
    }

    /// Check if authentication completed.
    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    /// Scheme that completed authentication.
    pub fn auth_scheme(&self) -> Option<&str> {
        self.auth_scheme.as_deref()
    }

    /// Signature derived from the first challenge.
    pub fn session_signature(&self) -> Option<&SessionSignature> {
        self.session_signature.as_ref()
    }

    /// Recorded failures.
    pub fn errors(&self) -> &ErrorStack {
        &self.errors
    }

    /// Check if a reconnect socket is waiting for the next checkpoint.
    pub fn reconnect_ready(&self) -> bool {
        self.reconnect.as_ref().is_some_and(ReconnectHandle::is_ready)
    }

    /// Check if reconnect is active for this connection.
    pub fn reconnect_enabled(&self) -> bool {
        self.reconnect.is_some()
    }

    /// Fix the session signature; later calls are ignored.
    pub(crate) fn set_session_signature(&mut self, signature: SessionSignature) {
        if self.session_signature.is_none() {
            self.session_signature = Some(signature);
        }
    }

    /// Flip to logged in.
    pub(crate) fn mark_logged_in(&mut self, scheme: &str) {
        self.logged_in = true;
        self.auth_scheme = Some(scheme.to_string());
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = stream.close().await;
                });
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("proxy", &self.proxy)
            .field("client", &self.client)
            .field("outcome", &self.outcome)
            .field("logged_in", &self.logged_in)
            .field("connected", &self.stream.is_some())
            .finish_non_exhaustive()
    }
}

/// Reconnect port offered in `version`; an out-of-range port drops the offer.
fn reconnect_port(version: &VersionInfo) -> Option<u16> {
    match u16::try_from(version.reconnect_port) {
        Ok(port) if port != 0 => Some(port),
        _ => {
            warn!(
                "Ignoring reconnect offer with invalid port {}",
                version.reconnect_port
            );
            None
        },
    }
}

fn reply_error(status: i32, error: &[u8]) -> GridError {
    let code = ErrorCode(status);
    let message = if error.is_empty() {
        None
    } else {
        RError::unpack(error)
            .ok()
            .and_then(|e| e.messages.last().map(|m| m.msg.clone()))
    };
    GridError::from_code(
        code,
        message.unwrap_or_else(|| format!("agent returned {} ({})", code, code.name())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_error_uses_rerror_text() {
        let rerror = RError::single(ErrorCode::CAT_INVALID_AUTHENTICATION.0, "bad digest");
        let err = reply_error(ErrorCode::CAT_INVALID_AUTHENTICATION.0, &rerror.pack());
        assert_eq!(err.code(), ErrorCode::CAT_INVALID_AUTHENTICATION);
        assert_eq!(err.message(), "bad digest");
        assert!(matches!(err, GridError::Auth { .. }));
    }

    #[test]
    fn test_reply_error_without_segment() {
        let err = reply_error(ErrorCode::SYS_NO_API_PRIV.0, &[]);
        assert_eq!(err.code(), ErrorCode::SYS_NO_API_PRIV);
        assert!(!err.message().is_empty());
    }

    #[test]
    fn test_reconnect_port_range() {
        let mut version = VersionInfo {
            status: 0,
            release_version: RELEASE_VERSION.into(),
            api_version: API_VERSION.into(),
            reconnect_port: 1248,
            reconnect_addr: "127.0.0.1".into(),
            cookie: 77,
        };
        assert_eq!(reconnect_port(&version), Some(1248));

        version.reconnect_port = 70000;
        assert_eq!(reconnect_port(&version), None);
        version.reconnect_port = -1;
        assert_eq!(reconnect_port(&version), None);
        version.reconnect_port = 0;
        assert_eq!(reconnect_port(&version), None);
    }

    #[tokio::test]
    async fn test_open_requires_user() {
        let config = ClientConfig::default();
        let err = Connection::open(config).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SYS_INVALID_INPUT_PARAM);
    }
}
