//! Pluggable authentication.
//!
//! A flow is a sequence of named operations. Each response names the next
//! operation; the client loop runs until the connection is logged in.
//!
//! ```text
//! auth_client_start ─▶ client_auth_request ─▶ establish_context
//!        ▲                                          │
//!        │ (TTL restart)                            ▼
//! record_authentication_file ◀──────────── client_auth_response
//!        │                                          │
//!        └──────────▶ complete_authentication ◀─────┘
//! ```
//!
//! Schemes are looked up by name in a [`SchemeRegistry`] holding one
//! instance per scheme and role. Request and response documents are open
//! key/value bags; keys a handler does not know travel through untouched.

pub mod digest;
pub mod native;
pub mod obf;
pub mod secret;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::agent::AgentSession;
use crate::connection::Connection;
use crate::error::{ErrorCode, GridError, Result};
use crate::net::pack::{BinBytesBuf, PackStruct};
use crate::protocol::AUTHENTICATION_APN;

pub use digest::{HashPolicy, HashScheme};
pub use native::NativeFactory;
pub use obf::AuthFile;
pub use secret::{Challenge, Password, Response, SessionSignature};

/// Boxed future returned by scheme operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Document keys.
pub mod keys {
    /// Scheme name
    pub const SCHEME: &str = "scheme";
    /// Authenticating user
    pub const USER_NAME: &str = "user_name";
    /// Authenticating user's zone
    pub const ZONE_NAME: &str = "zone_name";
    /// Operation to run next
    pub const NEXT_OPERATION: &str = "next_operation";
    /// Agent challenge, base64
    pub const REQUEST_RESULT: &str = "request_result";
    /// Challenge response, base64
    pub const DIGEST: &str = "digest";
    /// In-band password (never sent to the agent)
    pub const A_PW: &str = "a_pw";
    /// Requested time-to-live in hours
    pub const A_TTL: &str = "a_ttl";
    /// Prompt even if a password is available
    pub const FORCE_PASSWORD_PROMPT: &str = "force_password_prompt";
    /// Persist the secret after login
    pub const RECORD_AUTH_FILE: &str = "record_auth_file";
}

/// Operation every client flow starts with.
pub const AUTH_CLIENT_START: &str = "auth_client_start";

/// Operation name marking the end of a flow.
pub const FLOW_COMPLETE: &str = "auth_flow_complete";

/// Name of the built-in scheme.
pub const NATIVE_SCHEME: &str = "native";

/// Open key/value request or response.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthDocument(Map<String, Value>);

impl AuthDocument {
    /// Empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// String value of `key`.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// String value of `key`; missing is a protocol violation.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.get_str(key).ok_or_else(|| {
            GridError::auth(
                ErrorCode::SYS_INVALID_INPUT_PARAM,
                format!("missing required key {key:?}"),
            )
        })
    }

    /// Boolean flag; accepts JSON booleans and `"true"`/`"1"`.
    pub fn get_flag(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.as_str(), "true" | "1"),
            _ => false,
        }
    }

    /// Set `key`.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Remove `key`.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Check if `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Value of `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Keys in the document.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Name of the next operation, if any.
    pub fn next_operation(&self) -> Option<&str> {
        self.get_str(keys::NEXT_OPERATION)
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.0)?)
    }

    /// Parse JSON bytes; anything but an object is rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self(serde_json::from_slice(bytes)?))
    }

    /// Copy without the in-band password.
    pub fn without_password(&self) -> Self {
        let mut copy = self.clone();
        copy.remove(keys::A_PW);
        copy
    }
}

impl fmt::Debug for AuthDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.0 {
            if key == keys::A_PW || key == keys::DIGEST {
                map.entry(key, &"[REDACTED]");
            } else {
                map.entry(key, value);
            }
        }
        map.finish()
    }
}

/// A closed set of operation names for one role.
pub trait Operation: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Every operation in the set.
    const ALL: &'static [Self];

    /// Wire name.
    fn as_str(&self) -> &'static str;

    /// Operation named `name`.
    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.as_str() == name)
    }
}

/// Client-side operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientOperation {
    /// Fill in identity
    Start,
    /// Ask the agent for a challenge
    ClientAuthRequest,
    /// Answer the challenge locally
    EstablishContext,
    /// Send the answer
    ClientAuthResponse,
    /// Persist the secret
    RecordAuthFile,
    /// Flip the connection to logged in
    CompleteAuthentication,
}

impl Operation for ClientOperation {
    const ALL: &'static [Self] = &[
        Self::Start,
        Self::ClientAuthRequest,
        Self::EstablishContext,
        Self::ClientAuthResponse,
        Self::RecordAuthFile,
        Self::CompleteAuthentication,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            Self::Start => AUTH_CLIENT_START,
            Self::ClientAuthRequest => "client_auth_request",
            Self::EstablishContext => "establish_context",
            Self::ClientAuthResponse => "client_auth_response",
            Self::RecordAuthFile => "record_authentication_file",
            Self::CompleteAuthentication => "complete_authentication",
        }
    }
}

/// Agent-side operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentOperation {
    /// Prepare the session
    AgentStart,
    /// Issue a challenge
    AgentRequest,
    /// Verify the answer
    AgentResponse,
}

impl Operation for AgentOperation {
    const ALL: &'static [Self] = &[Self::AgentStart, Self::AgentRequest, Self::AgentResponse];

    fn as_str(&self) -> &'static str {
        match self {
            Self::AgentStart => "auth_agent_start",
            Self::AgentRequest => "agent_request",
            Self::AgentResponse => "agent_response",
        }
    }
}

/// An operation to run: built in, or an extension a scheme registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<O> {
    /// Member of the closed set
    Builtin(O),
    /// Scheme-specific operation
    Extension(String),
}

impl<O: Operation> Step<O> {
    /// Step named `name`.
    pub fn parse(name: &str) -> Self {
        O::from_name(name)
            .map(Self::Builtin)
            .unwrap_or_else(|| Self::Extension(name.to_string()))
    }

    /// Wire name.
    pub fn name(&self) -> &str {
        match self {
            Self::Builtin(op) => op.as_str(),
            Self::Extension(name) => name,
        }
    }
}

/// Client role of a scheme.
pub trait ClientAuthScheme: Send + Sync {
    /// Scheme name.
    fn name(&self) -> &'static str;

    /// Operation names served beyond the closed set.
    fn extra_operations(&self) -> &[&'static str] {
        &[]
    }

    /// Check if the scheme serves `step`.
    fn supports(&self, step: &Step<ClientOperation>) -> bool {
        match step {
            Step::Builtin(_) => true,
            Step::Extension(name) => self.extra_operations().contains(&name.as_str()),
        }
    }

    /// Run one operation.
    fn call<'a>(
        &'a self,
        conn: &'a mut Connection,
        ctx: &'a AuthContext,
        step: Step<ClientOperation>,
        request: AuthDocument,
    ) -> BoxFuture<'a, Result<AuthDocument>>;
}

/// Agent role of a scheme.
pub trait AgentAuthScheme: Send + Sync {
    /// Scheme name.
    fn name(&self) -> &'static str;

    /// Operation names served beyond the closed set.
    fn extra_operations(&self) -> &[&'static str] {
        &[]
    }

    /// Check if the scheme serves `step`.
    fn supports(&self, step: &Step<AgentOperation>) -> bool {
        match step {
            Step::Builtin(_) => true,
            Step::Extension(name) => self.extra_operations().contains(&name.as_str()),
        }
    }

    /// Run one operation.
    fn call<'a>(
        &'a self,
        session: &'a mut AgentSession,
        step: Step<AgentOperation>,
        request: AuthDocument,
    ) -> BoxFuture<'a, Result<AuthDocument>>;
}

/// Builds both roles of a scheme.
pub trait SchemeFactory: Send + Sync {
    /// Scheme name.
    fn name(&self) -> &'static str;

    /// Client role.
    fn client(&self) -> Arc<dyn ClientAuthScheme>;

    /// Agent role.
    fn agent(&self) -> Arc<dyn AgentAuthScheme>;
}

/// Scheme instances by name, one per role.
#[derive(Clone, Default)]
pub struct SchemeRegistry {
    client: HashMap<String, Arc<dyn ClientAuthScheme>>,
    agent: HashMap<String, Arc<dyn AgentAuthScheme>>,
}

impl SchemeRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in schemes.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(&NativeFactory);
        registry
    }

    /// Instantiate and register both roles of a scheme.
    pub fn register(&mut self, factory: &dyn SchemeFactory) -> &mut Self {
        let name = factory.name().to_lowercase();
        debug!("Registering authentication scheme {}", name);
        self.client.insert(name.clone(), factory.client());
        self.agent.insert(name, factory.agent());
        self
    }

    /// Client role of `name`.
    pub fn client(&self, name: &str) -> Result<Arc<dyn ClientAuthScheme>> {
        self.client
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| unsupported(name))
    }

    /// Agent role of `name`.
    pub fn agent(&self, name: &str) -> Result<Arc<dyn AgentAuthScheme>> {
        self.agent
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| unsupported(name))
    }

    /// Registered scheme names, sorted.
    pub fn schemes(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.client.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for SchemeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemeRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}

fn unsupported(name: &str) -> GridError {
    GridError::auth(
        ErrorCode::AUTH_SCHEME_NOT_SUPPORTED,
        format!("authentication scheme {name:?} is not supported"),
    )
}

/// Source of interactively entered passwords.
pub trait PasswordPrompt: Send + Sync {
    /// Ask for a password.
    fn read_password(&self, prompt: &str) -> Result<String>;
}

/// Prompt for a password. On a terminal the input is not echoed; piped
/// stdin is read as one line.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinPrompt;

impl PasswordPrompt for StdinPrompt {
    fn read_password(&self, prompt: &str) -> Result<String> {
        let password = if std::io::stdin().is_terminal() {
            rpassword::prompt_password(prompt)?
        } else {
            let mut stderr = std::io::stderr();
            write!(stderr, "{prompt}")?;
            stderr.flush()?;
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            line
        };
        entered_password(&password)
    }
}

fn entered_password(raw: &str) -> Result<String> {
    let password = raw.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        return Err(GridError::auth(
            ErrorCode::USER_AUTH_STRING_EMPTY,
            "no password entered",
        ));
    }
    Ok(password.to_string())
}

/// Caller-supplied inputs to one authentication.
#[derive(Clone)]
pub struct AuthContext {
    password: Option<String>,
    ttl_hours: Option<u32>,
    force_prompt: bool,
    record_auth_file: bool,
    auth_file: Option<PathBuf>,
    prompt: Arc<dyn PasswordPrompt>,
    extra: AuthDocument,
}

impl Default for AuthContext {
    fn default() -> Self {
        Self {
            password: None,
            ttl_hours: None,
            force_prompt: false,
            record_auth_file: false,
            auth_file: None,
            prompt: Arc::new(StdinPrompt),
            extra: AuthDocument::new(),
        }
    }
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("ttl_hours", &self.ttl_hours)
            .field("force_prompt", &self.force_prompt)
            .field("record_auth_file", &self.record_auth_file)
            .field("auth_file", &self.auth_file)
            .field("extra", &self.extra)
            .finish()
    }
}

impl AuthContext {
    /// Empty context: password from the auth file, else the prompt.
    pub fn new() -> Self {
        Self::default()
    }

    /// Supply the password in-band.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Mint a limited password valid for `hours`; implies recording the auth file.
    pub fn with_ttl(mut self, hours: u32) -> Self {
        self.ttl_hours = Some(hours);
        self.record_auth_file = true;
        self
    }

    /// Always prompt.
    pub fn force_prompt(mut self, force: bool) -> Self {
        self.force_prompt = force;
        self
    }

    /// Persist the secret after login.
    pub fn record_auth_file(mut self, record: bool) -> Self {
        self.record_auth_file = record;
        self
    }

    /// Use `path` instead of the configured auth file.
    pub fn with_auth_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.auth_file = Some(path.into());
        self
    }

    /// Use `prompt` for interactive input.
    pub fn with_prompt(mut self, prompt: Arc<dyn PasswordPrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    /// Forward an extra key to the scheme.
    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.set(key, value);
        self
    }

    /// Prompt for a password.
    pub fn prompt(&self, message: &str) -> Result<String> {
        self.prompt.read_password(message)
    }

    /// Explicit auth file override.
    pub fn auth_file(&self) -> Option<&PathBuf> {
        self.auth_file.as_ref()
    }

    /// First request of a flow for `scheme`.
    pub fn initial_request(&self, scheme: &str) -> AuthDocument {
        let mut request = self.extra.clone();
        request.set(keys::SCHEME, scheme);
        if let Some(password) = &self.password {
            request.set(keys::A_PW, password.as_str());
        }
        if let Some(ttl) = self.ttl_hours {
            request.set(keys::A_TTL, ttl.to_string());
        }
        if self.force_prompt {
            request.set(keys::FORCE_PASSWORD_PROMPT, true);
        }
        if self.record_auth_file {
            request.set(keys::RECORD_AUTH_FILE, true);
        }
        request
    }
}

/// Drive a client flow until the connection is logged in.
pub async fn authenticate_client(
    conn: &mut Connection,
    registry: &SchemeRegistry,
    scheme_name: &str,
    ctx: &AuthContext,
) -> Result<()> {
    let scheme = registry.client(scheme_name)?;
    let mut request = ctx.initial_request(scheme.name());
    let mut step = Step::Builtin(ClientOperation::Start);

    loop {
        if !scheme.supports(&step) {
            return Err(GridError::auth(
                ErrorCode::AUTH_SCHEME_NOT_SUPPORTED,
                format!(
                    "scheme {} has no operation {:?}",
                    scheme.name(),
                    step.name()
                ),
            ));
        }

        debug!("Authentication [{}]: {}", scheme.name(), step.name());
        let response = scheme.call(conn, ctx, step, request).await?;

        if conn.is_logged_in() {
            info!(
                "Authenticated {} with scheme {}",
                conn.proxy_user().qualified(),
                scheme.name()
            );
            return Ok(());
        }

        match response.next_operation() {
            None | Some("") => {
                return Err(GridError::auth(
                    ErrorCode::SYS_INVALID_INPUT_PARAM,
                    "authentication response carries no next_operation",
                ))
            },
            Some(FLOW_COMPLETE) => {
                return Err(GridError::auth(
                    ErrorCode::CAT_INVALID_AUTHENTICATION,
                    "authentication flow completed without logging in",
                ))
            },
            Some(next) => step = Step::parse(next),
        }
        request = response;
    }
}

/// Send one document to the agent's authentication API and return its reply.
pub async fn request_agent(conn: &mut Connection, request: &AuthDocument) -> Result<AuthDocument> {
    let payload = BinBytesBuf(request.without_password().to_bytes()?).pack();
    let deadline = conn.config().version_timeout();
    let reply = conn
        .api_call_within(AUTHENTICATION_APN, &payload, &[], Some(deadline))
        .await?;
    let bytes = BinBytesBuf::unpack(&reply.structure)?;
    AuthDocument::from_bytes(&bytes.0)
}

/// Agent side: run the operation a request names.
pub async fn dispatch_agent(
    registry: &SchemeRegistry,
    session: &mut AgentSession,
    request: AuthDocument,
) -> Result<AuthDocument> {
    let scheme = registry.agent(request.require_str(keys::SCHEME)?)?;
    let step = Step::<AgentOperation>::parse(request.require_str(keys::NEXT_OPERATION)?);
    if !scheme.supports(&step) {
        warn!(
            "Scheme {} asked for unknown operation {:?}",
            scheme.name(),
            step.name()
        );
        return Err(GridError::auth(
            ErrorCode::AUTH_SCHEME_NOT_SUPPORTED,
            format!("scheme {} has no operation {:?}", scheme.name(), step.name()),
        ));
    }
    debug!(
        "Agent authentication [{}]: {} for session {}",
        scheme.name(),
        step.name(),
        session.id()
    );
    scheme.call(session, step, request).await
}
