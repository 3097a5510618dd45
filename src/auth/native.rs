//! Native challenge-response scheme.
//!
//! The agent issues a random challenge; the client answers with
//! `hash(challenge ‖ password)` truncated to [`RESPONSE_LEN`] bytes. The
//! password never crosses the wire.
//!
//! [`RESPONSE_LEN`]: super::secret::RESPONSE_LEN

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::digest::{challenge_response, limited_password};
use super::obf::AuthFile;
use super::secret::{Challenge, Password, Response};
use super::{
    keys, request_agent, AgentAuthScheme, AgentOperation, AuthContext, AuthDocument, BoxFuture,
    ClientAuthScheme, ClientOperation, Operation, SchemeFactory, Step, AUTH_CLIENT_START,
    FLOW_COMPLETE, NATIVE_SCHEME,
};
use crate::agent::store::CatalogLocation;
use crate::agent::AgentSession;
use crate::connection::Connection;
use crate::error::{ErrorCode, GridError, Result};
use crate::identity::{resolve_privileges, PrivilegeInputs, PrivilegeLevel};

const PASSWORD_PROMPT: &str = "Enter your current password: ";

/// Builds both roles of the native scheme.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeFactory;

impl SchemeFactory for NativeFactory {
    fn name(&self) -> &'static str {
        NATIVE_SCHEME
    }

    fn client(&self) -> Arc<dyn ClientAuthScheme> {
        Arc::new(NativeClient)
    }

    fn agent(&self) -> Arc<dyn AgentAuthScheme> {
        Arc::new(NativeAgent)
    }
}

fn no_such_operation(name: &str) -> GridError {
    GridError::auth(
        ErrorCode::AUTH_SCHEME_NOT_SUPPORTED,
        format!("native scheme has no operation {name:?}"),
    )
}

/// Overlay the agent's reply on the local request; local-only keys survive.
fn merge_reply(mut local: AuthDocument, reply: AuthDocument) -> AuthDocument {
    for key in reply.keys().map(str::to_string).collect::<Vec<_>>() {
        if let Some(value) = reply.get(&key) {
            local.set(&key, value.clone());
        }
    }
    local
}

/// Client role.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeClient;

impl NativeClient {
    fn start(&self, conn: &Connection, mut request: AuthDocument) -> Result<AuthDocument> {
        if let Some(password) = request.get_str(keys::A_PW) {
            Password::new(password)?;
        }
        let user = conn.proxy_user();
        request
            .set(keys::USER_NAME, user.name.as_str())
            .set(keys::ZONE_NAME, user.zone.as_str())
            .set(
                keys::NEXT_OPERATION,
                ClientOperation::ClientAuthRequest.as_str(),
            );
        Ok(request)
    }

    async fn client_auth_request(
        &self,
        conn: &mut Connection,
        request: AuthDocument,
    ) -> Result<AuthDocument> {
        let mut outgoing = request.clone();
        outgoing.set(keys::NEXT_OPERATION, AgentOperation::AgentRequest.as_str());
        let reply = request_agent(conn, &outgoing).await?;

        Challenge::from_base64(reply.require_str(keys::REQUEST_RESULT)?)?;
        let mut response = merge_reply(request, reply);
        response.set(
            keys::NEXT_OPERATION,
            ClientOperation::EstablishContext.as_str(),
        );
        Ok(response)
    }

    fn establish_context(
        &self,
        conn: &mut Connection,
        ctx: &AuthContext,
        mut request: AuthDocument,
    ) -> Result<AuthDocument> {
        let challenge = Challenge::from_base64(request.require_str(keys::REQUEST_RESULT)?)?;
        let password = resolve_password(conn, ctx, &request)?;
        let response =
            challenge_response(conn.config().default_hash_scheme, &challenge, password.as_bytes())?;
        conn.set_session_signature(challenge.session_signature());

        request
            .set(keys::DIGEST, response.to_base64())
            .set(keys::A_PW, password.expose())
            .set(
                keys::NEXT_OPERATION,
                ClientOperation::ClientAuthResponse.as_str(),
            );
        Ok(request)
    }

    async fn client_auth_response(
        &self,
        conn: &mut Connection,
        request: AuthDocument,
    ) -> Result<AuthDocument> {
        request.require_str(keys::DIGEST)?;
        let mut outgoing = request.clone();
        outgoing.set(keys::NEXT_OPERATION, AgentOperation::AgentResponse.as_str());
        let reply = request_agent(conn, &outgoing).await?;

        let mut response = merge_reply(request, reply);
        response.remove(keys::DIGEST);
        response.remove(keys::REQUEST_RESULT);
        let next = if response.get_flag(keys::RECORD_AUTH_FILE) {
            ClientOperation::RecordAuthFile
        } else {
            ClientOperation::CompleteAuthentication
        };
        response.set(keys::NEXT_OPERATION, next.as_str());
        Ok(response)
    }

    async fn record_auth_file(
        &self,
        conn: &mut Connection,
        ctx: &AuthContext,
        mut request: AuthDocument,
    ) -> Result<AuthDocument> {
        let password = Password::new(request.require_str(keys::A_PW)?)?;
        let file = auth_file(conn, ctx).ok_or_else(|| {
            GridError::Config("no location for the authentication file".to_string())
        })?;

        if let Some(ttl) = parse_ttl(&request)? {
            let salt = conn.get_limited_password(ttl).await?;
            let limited = limited_password(&salt, &password)?;
            file.save(&limited)?;
            info!(
                "Recorded {}-hour limited password in {}",
                ttl,
                file.path().display()
            );

            // Second round proves the persisted secret works.
            for key in [
                keys::A_PW,
                keys::A_TTL,
                keys::RECORD_AUTH_FILE,
                keys::FORCE_PASSWORD_PROMPT,
                keys::DIGEST,
                keys::REQUEST_RESULT,
            ] {
                request.remove(key);
            }
            request.set(keys::NEXT_OPERATION, AUTH_CLIENT_START);
            return Ok(request);
        }

        file.save(&password)?;
        info!("Recorded password in {}", file.path().display());
        request.set(
            keys::NEXT_OPERATION,
            ClientOperation::CompleteAuthentication.as_str(),
        );
        Ok(request)
    }

    fn complete_authentication(
        &self,
        conn: &mut Connection,
        mut request: AuthDocument,
    ) -> AuthDocument {
        conn.mark_logged_in(NATIVE_SCHEME);
        request.remove(keys::A_PW);
        request.set(keys::NEXT_OPERATION, FLOW_COMPLETE);
        request
    }
}

fn parse_ttl(request: &AuthDocument) -> Result<Option<i32>> {
    let text = match request.get_str(keys::A_TTL).map(str::trim) {
        None | Some("") => return Ok(None),
        Some(text) => text,
    };
    let ttl: i32 = text.parse().map_err(|_| {
        GridError::auth(
            ErrorCode::SYS_INVALID_INPUT_PARAM,
            format!("invalid time-to-live {text:?}"),
        )
    })?;
    if ttl < 0 {
        return Err(GridError::auth(
            ErrorCode::SYS_INVALID_INPUT_PARAM,
            format!("negative time-to-live {ttl}"),
        ));
    }
    Ok((ttl > 0).then_some(ttl))
}

fn auth_file(conn: &Connection, ctx: &AuthContext) -> Option<AuthFile> {
    ctx.auth_file()
        .cloned()
        .or_else(|| conn.config().auth_file.clone())
        .or_else(AuthFile::default_path)
        .map(AuthFile::new)
}

/// Password for this round, by priority: anonymous, forced prompt,
/// in-band, auth file, prompt.
fn resolve_password(
    conn: &Connection,
    ctx: &AuthContext,
    request: &AuthDocument,
) -> Result<Password> {
    if conn.proxy_user().is_anonymous() {
        return Ok(Password::empty());
    }
    if request.get_flag(keys::FORCE_PASSWORD_PROMPT) {
        return Password::new(&ctx.prompt(PASSWORD_PROMPT)?);
    }
    if let Some(password) = request.get_str(keys::A_PW) {
        return Password::new(password);
    }
    if let Some(file) = auth_file(conn, ctx) {
        if let Some(password) = file.load()? {
            debug!("Using password from {}", file.path().display());
            return Ok(password);
        }
    }
    Password::new(&ctx.prompt(PASSWORD_PROMPT)?)
}

impl ClientAuthScheme for NativeClient {
    fn name(&self) -> &'static str {
        NATIVE_SCHEME
    }

    fn call<'a>(
        &'a self,
        conn: &'a mut Connection,
        ctx: &'a AuthContext,
        step: Step<ClientOperation>,
        request: AuthDocument,
    ) -> BoxFuture<'a, Result<AuthDocument>> {
        Box::pin(async move {
            let op = match step {
                Step::Builtin(op) => op,
                Step::Extension(name) => return Err(no_such_operation(&name)),
            };
            match op {
                ClientOperation::Start => self.start(conn, request),
                ClientOperation::ClientAuthRequest => self.client_auth_request(conn, request).await,
                ClientOperation::EstablishContext => self.establish_context(conn, ctx, request),
                ClientOperation::ClientAuthResponse => {
                    self.client_auth_response(conn, request).await
                },
                ClientOperation::RecordAuthFile => self.record_auth_file(conn, ctx, request).await,
                ClientOperation::CompleteAuthentication => {
                    Ok(self.complete_authentication(conn, request))
                },
            }
        })
    }
}

/// Agent role.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeAgent;

impl NativeAgent {
    fn agent_request(&self, session: &mut AgentSession, mut request: AuthDocument) -> AuthDocument {
        let challenge = Challenge::random();
        request.set(keys::REQUEST_RESULT, challenge.to_base64());
        session.set_challenge(challenge);
        session.set_auth_scheme(NATIVE_SCHEME);
        debug!(session = %session.id(), "Issued challenge");
        request
    }

    fn agent_response(
        &self,
        session: &mut AgentSession,
        mut request: AuthDocument,
    ) -> Result<AuthDocument> {
        let digest = Response::from_base64(request.require_str(keys::DIGEST)?)?;
        let user = request.require_str(keys::USER_NAME)?.to_string();
        let zone = request.require_str(keys::ZONE_NAME)?.to_string();

        let challenge = session.take_challenge().ok_or_else(|| {
            GridError::auth(
                ErrorCode::CAT_INVALID_AUTHENTICATION,
                "no outstanding challenge for this session",
            )
        })?;

        let proxy = session.proxy_user();
        if user != proxy.name || zone != proxy.zone {
            return Err(GridError::auth(
                ErrorCode::CAT_INVALID_AUTHENTICATION,
                format!(
                    "{user}#{zone} does not match the connection user {}",
                    proxy.qualified()
                ),
            ));
        }

        let record = session.store().user(&user, &zone).ok_or_else(|| {
            GridError::auth(
                ErrorCode::CAT_INVALID_USER,
                format!("no such user {user}#{zone}"),
            )
        })?;

        verify_digest(session, &challenge, &digest, &user, &zone)?;

        let catalog_is_remote = session.store().catalog_location(&zone) == CatalogLocation::Remote;
        if catalog_is_remote {
            verify_remote_server(session, &challenge, &zone)?;
        }

        let proxy_level = PrivilegeLevel::for_user_type(record.user_type);
        let client = session.client_user().clone();
        let client_level = if client.name == user {
            proxy_level
        } else {
            session
                .store()
                .user(&client.name, &client.zone)
                .map(|r| PrivilegeLevel::for_user_type(r.user_type))
                .unwrap_or(PrivilegeLevel::NoUser)
        };
        let (proxy_level, client_level) = resolve_privileges(PrivilegeInputs {
            proxy_level,
            client_level,
            proxy_name: &user,
            client_name: &client.name,
            catalog_is_remote,
            client_zone_is_local: client.zone == session.config().local_zone,
        })?;

        session.complete_login(record.user_type, proxy_level, client_level);
        request.remove(keys::DIGEST);
        Ok(request)
    }
}

/// Compare `digest` against every accepted secret under every allowed scheme.
fn verify_digest(
    session: &AgentSession,
    challenge: &Challenge,
    digest: &Response,
    user: &str,
    zone: &str,
) -> Result<()> {
    let config = session.config();
    let schemes = config
        .match_hash_policy
        .candidates(config.default_hash_scheme);
    let now = Utc::now();
    let mut expired = false;

    for secret in session.store().secrets(user, zone) {
        for scheme in &schemes {
            let expected = challenge_response(*scheme, challenge, secret.password.as_bytes())?;
            if !expected.matches(digest) {
                continue;
            }
            if secret.is_expired(now) {
                expired = true;
                continue;
            }
            debug!(
                session = %session.id(),
                "Response matched with {} ({})",
                scheme,
                if secret.is_limited() { "limited" } else { "permanent" }
            );
            return Ok(());
        }
    }

    if expired {
        return Err(GridError::auth(
            ErrorCode::CAT_PASSWORD_EXPIRED,
            format!("password for {user}#{zone} has expired"),
        ));
    }
    warn!(session = %session.id(), "Authentication failed for {}#{}", user, zone);
    Err(GridError::auth(
        ErrorCode::CAT_INVALID_AUTHENTICATION,
        format!("authentication failed for {user}#{zone}"),
    ))
}

/// Check the remote catalog's signed answer for a federated user.
fn verify_remote_server(session: &AgentSession, challenge: &Challenge, zone: &str) -> Result<()> {
    let config = session.config();
    let provided = session
        .store()
        .remote_server_response(zone, challenge, config.default_hash_scheme)
        .ok_or_else(|| {
            GridError::auth(
                ErrorCode::REMOTE_SERVER_AUTH_NOT_PROVIDED,
                format!("zone {zone} returned no server response"),
            )
        })?;
    if provided.is_empty() {
        return Err(GridError::auth(
            ErrorCode::REMOTE_SERVER_AUTH_EMPTY,
            format!("zone {zone} returned an empty server response"),
        ));
    }
    let sid = config.remote_zone_sids.get(zone).ok_or_else(|| {
        GridError::auth(
            ErrorCode::REMOTE_SERVER_SID_NOT_DEFINED,
            format!("no SID configured for zone {zone}"),
        )
    })?;

    let expected = challenge_response(config.default_hash_scheme, challenge, sid.as_bytes())?;
    let matches = Response::from_base64(&provided)
        .map(|r| expected.matches(&r))
        .unwrap_or(false);
    if !matches {
        return Err(GridError::auth(
            ErrorCode::REMOTE_SERVER_AUTHENTICATION_FAILURE,
            format!("server response from zone {zone} does not verify"),
        ));
    }
    Ok(())
}

impl AgentAuthScheme for NativeAgent {
    fn name(&self) -> &'static str {
        NATIVE_SCHEME
    }

    fn call<'a>(
        &'a self,
        session: &'a mut AgentSession,
        step: Step<AgentOperation>,
        request: AuthDocument,
    ) -> BoxFuture<'a, Result<AuthDocument>> {
        Box::pin(async move {
            match step {
                Step::Builtin(AgentOperation::AgentStart) => Ok(request),
                Step::Builtin(AgentOperation::AgentRequest) => {
                    Ok(self.agent_request(session, request))
                },
                Step::Builtin(AgentOperation::AgentResponse) => {
                    self.agent_response(session, request)
                },
                Step::Extension(name) => Err(no_such_operation(&name)),
            }
        })
    }
}
