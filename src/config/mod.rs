//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`GRID_*`)
//! - CLI arguments (for the binary)

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::{HashPolicy, HashScheme, NATIVE_SCHEME};
use crate::error::{GridError, Result};
use crate::identity::UserType;
use crate::net::connector::{ConnectOptions, CONNECT_ATTEMPTS, DEFAULT_WINDOW_SIZE};
use crate::net::{CertSource, TrustConfig};
use crate::protocol::negotiation::{AgentNegotiation, NegotiationKey, Policy, ZoneKeys};

/// Default agent port.
pub const DEFAULT_PORT: u16 = 1247;

/// Default zone name.
pub const DEFAULT_ZONE: &str = "tempZone";

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Client configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Agent configuration
    #[serde(default)]
    pub agent: AgentConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| GridError::Config(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| GridError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// `~/.grid/gridlink.toml`, if a home directory is known.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".grid").join("gridlink.toml"))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        let client = &mut config.client;

        if let Ok(host) = std::env::var("GRID_HOST") {
            client.host = host;
        }
        if let Ok(port) = std::env::var("GRID_PORT") {
            if let Ok(port) = port.parse() {
                client.port = port;
            }
        }
        if let Ok(user) = std::env::var("GRID_USER_NAME") {
            client.user_name = user;
        }
        if let Ok(zone) = std::env::var("GRID_ZONE_NAME") {
            client.zone_name = zone;
        }
        if let Ok(scheme) = std::env::var("GRID_AUTHENTICATION_SCHEME") {
            client.authentication_scheme = scheme.to_lowercase();
        }
        if let Ok(scheme) = std::env::var("GRID_DEFAULT_HASH_SCHEME") {
            if let Ok(scheme) = scheme.parse() {
                client.default_hash_scheme = scheme;
            }
        }
        if let Ok(policy) = std::env::var("GRID_MATCH_HASH_POLICY") {
            if let Ok(policy) = policy.parse() {
                config.agent.match_hash_policy = policy;
            }
        }
        let client = &mut config.client;
        if let Ok(policy) = std::env::var("GRID_CLIENT_SERVER_POLICY") {
            if let Ok(policy) = policy.parse() {
                client.client_server_policy = policy;
            }
        }
        if let Ok(neg) = std::env::var("GRID_CLIENT_SERVER_NEGOTIATION") {
            client.client_server_negotiation =
                neg == crate::protocol::REQUEST_SERVER_NEGOTIATION || neg == "true";
        }
        if let Ok(secs) = std::env::var("GRID_CONNECT_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                client.connect_timeout_secs = secs;
            }
        }
        if let Ok(path) = std::env::var("GRID_AUTH_FILE") {
            client.auth_file = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("GRID_SSL_CA_CERTIFICATE_FILE") {
            client.ssl_ca_certificate_file = Some(PathBuf::from(path));
        }

        config
    }

    /// Merge with another config (other takes precedence)
    ///
    /// Agent settings stay with `self` apart from the hash policy.
    pub fn merge(self, other: Self) -> Self {
        let defaults = ClientConfig::default();
        let agent_defaults = AgentConfig::default();
        let base = self.client;
        let over = other.client;
        Self {
            client: ClientConfig {
                host: pick(base.host, over.host, &defaults.host),
                port: pick(base.port, over.port, &defaults.port),
                user_name: pick(base.user_name, over.user_name, &defaults.user_name),
                zone_name: pick(base.zone_name, over.zone_name, &defaults.zone_name),
                authentication_scheme: pick(
                    base.authentication_scheme,
                    over.authentication_scheme,
                    &defaults.authentication_scheme,
                ),
                default_hash_scheme: pick(
                    base.default_hash_scheme,
                    over.default_hash_scheme,
                    &defaults.default_hash_scheme,
                ),
                client_server_policy: pick(
                    base.client_server_policy,
                    over.client_server_policy,
                    &defaults.client_server_policy,
                ),
                client_server_negotiation: base.client_server_negotiation
                    || over.client_server_negotiation,
                connect_timeout_secs: pick(
                    base.connect_timeout_secs,
                    over.connect_timeout_secs,
                    &defaults.connect_timeout_secs,
                ),
                auth_file: over.auth_file.or(base.auth_file),
                ssl_ca_certificate_file: over
                    .ssl_ca_certificate_file
                    .or(base.ssl_ca_certificate_file),
                tls_server_name: over.tls_server_name.or(base.tls_server_name),
                zone_keys: over.zone_keys.or(base.zone_keys),
                client_user_name: over.client_user_name.or(base.client_user_name),
                client_zone_name: over.client_zone_name.or(base.client_zone_name),
                tls_trust: over.tls_trust.or(base.tls_trust),
                ..over
            },
            agent: AgentConfig {
                match_hash_policy: pick(
                    self.agent.match_hash_policy,
                    other.agent.match_hash_policy,
                    &agent_defaults.match_hash_policy,
                ),
                ..self.agent
            },
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        self.client.validate()?;
        self.agent.validate()
    }
}

fn pick<T: PartialEq>(base: T, over: T, default: &T) -> T {
    if over != *default {
        over
    } else {
        base
    }
}

/// Client-side connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Agent host
    pub host: String,

    /// Agent port
    pub port: u16,

    /// Authenticating (proxy) user
    pub user_name: String,

    /// Authenticating user's zone
    pub zone_name: String,

    /// User acted for; defaults to `user_name`
    pub client_user_name: Option<String>,

    /// Zone of the user acted for; defaults to `zone_name`
    pub client_zone_name: Option<String>,

    /// Scheme used when `authenticate` gets no override
    pub authentication_scheme: String,

    /// Digest used for challenge responses
    pub default_hash_scheme: HashScheme,

    /// Transport policy
    pub client_server_policy: Policy,

    /// Ask the agent to negotiate
    pub client_server_negotiation: bool,

    /// Keys used to sign negotiation
    pub zone_keys: Option<ZoneKeys>,

    /// Per-attempt connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Version reply timeout in seconds
    pub version_timeout_secs: u64,

    /// Socket buffer size, clamped on use
    pub window_size: usize,

    /// Auth file; defaults to `~/.grid/.gridA`
    pub auth_file: Option<PathBuf>,

    /// CA bundle trusted for TLS
    pub ssl_ca_certificate_file: Option<PathBuf>,

    /// Name checked against the agent certificate; defaults to `host`
    pub tls_server_name: Option<String>,

    /// Programmatic TLS trust, takes precedence over the CA file
    #[serde(skip)]
    pub tls_trust: Option<TrustConfig>,

    /// Ask the agent for reconnect support
    pub reconnect: bool,

    /// Seconds before the background reconnect dials
    pub reconnect_window_secs: u64,

    /// Program hint sent in the startup options
    pub program_name: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            user_name: String::new(),
            zone_name: DEFAULT_ZONE.to_string(),
            client_user_name: None,
            client_zone_name: None,
            authentication_scheme: NATIVE_SCHEME.to_string(),
            default_hash_scheme: HashScheme::default(),
            client_server_policy: Policy::Refuse,
            client_server_negotiation: false,
            zone_keys: None,
            connect_timeout_secs: 5,
            version_timeout_secs: 100,
            window_size: DEFAULT_WINDOW_SIZE,
            auth_file: None,
            ssl_ca_certificate_file: None,
            tls_server_name: None,
            tls_trust: None,
            reconnect: false,
            reconnect_window_secs: 600,
            program_name: "gridlink".to_string(),
        }
    }
}

impl ClientConfig {
    /// Connector settings.
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            window_size: self.window_size,
            timeout: Duration::from_secs(self.connect_timeout_secs),
            attempts: CONNECT_ATTEMPTS,
        }
    }

    /// Version reply deadline.
    pub fn version_timeout(&self) -> Duration {
        Duration::from_secs(self.version_timeout_secs)
    }

    /// Reconnect window.
    pub fn reconnect_window(&self) -> Duration {
        Duration::from_secs(self.reconnect_window_secs)
    }

    /// TLS trust, if any is configured.
    pub fn trust(&self) -> Option<TrustConfig> {
        self.tls_trust.clone().or_else(|| {
            self.ssl_ca_certificate_file
                .clone()
                .map(TrustConfig::CaFile)
        })
    }

    /// Name checked against the agent certificate.
    pub fn server_name(&self) -> &str {
        self.tls_server_name.as_deref().unwrap_or(&self.host)
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(GridError::Config("client port must be non-zero".into()));
        }
        if self.connect_timeout_secs == 0 {
            return Err(GridError::Config(
                "connect_timeout_secs must be non-zero".into(),
            ));
        }
        if self.authentication_scheme.is_empty() {
            return Err(GridError::Config(
                "authentication_scheme must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// A user account served by the in-memory credential store
#[derive(Clone, Serialize, Deserialize)]
pub struct UserEntry {
    /// Account name
    pub name: String,
    /// Zone; defaults to the agent's local zone
    #[serde(default)]
    pub zone: Option<String>,
    /// Account type
    #[serde(default = "default_user_type")]
    pub user_type: UserType,
    /// Password
    pub password: String,
}

fn default_user_type() -> UserType {
    UserType::RodsUser
}

impl fmt::Debug for UserEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserEntry")
            .field("name", &self.name)
            .field("zone", &self.zone)
            .field("user_type", &self.user_type)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Agent (server) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Address to listen on
    pub listen_addr: String,

    /// Zone served by this agent
    pub local_zone: String,

    /// Shared zone key
    pub zone_key: Option<String>,

    /// Negotiation key paired with `zone_key`
    pub negotiation_key: Option<NegotiationKey>,

    /// Keys of federated zones
    pub federation: Vec<ZoneKeys>,

    /// Remote zone SIDs, by zone name
    pub remote_zone_sids: HashMap<String, String>,

    /// Answer negotiation requests
    pub negotiation: bool,

    /// Transport policy
    pub negotiation_policy: Policy,

    /// Treat unsigned negotiation as CS_NEG_REFUSE
    pub require_signed_negotiation: bool,

    /// Digest tried first on responses
    pub default_hash_scheme: HashScheme,

    /// Which digests are accepted
    pub match_hash_policy: HashPolicy,

    /// Offer reconnect to clients that ask
    pub reconnect: bool,

    /// Reconnect listener address
    pub reconnect_addr: String,

    /// PEM certificate chain for TLS
    pub tls_cert_file: Option<PathBuf>,

    /// PEM private key for TLS
    pub tls_key_file: Option<PathBuf>,

    /// Programmatic certificate, takes precedence over the files
    #[serde(skip)]
    pub tls_cert: Option<CertSource>,

    /// Startup read timeout in seconds
    pub startup_timeout_secs: u64,

    /// Timeout for the next request while unauthenticated, in seconds
    pub challenge_timeout_secs: u64,

    /// Longest limited password lifetime, in hours
    pub max_ttl_hours: u32,

    /// Concurrent connections before refusing with SYS_EXCEED_CONNECT_CNT
    pub max_connections: usize,

    /// Accounts for the in-memory store
    pub users: Vec<UserEntry>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_addr: format!("127.0.0.1:{DEFAULT_PORT}"),
            local_zone: DEFAULT_ZONE.to_string(),
            zone_key: None,
            negotiation_key: None,
            federation: Vec::new(),
            remote_zone_sids: HashMap::new(),
            negotiation: true,
            negotiation_policy: Policy::Refuse,
            require_signed_negotiation: false,
            default_hash_scheme: HashScheme::default(),
            match_hash_policy: HashPolicy::default(),
            reconnect: false,
            reconnect_addr: "127.0.0.1:0".to_string(),
            tls_cert_file: None,
            tls_key_file: None,
            tls_cert: None,
            startup_timeout_secs: 100,
            challenge_timeout_secs: 100,
            max_ttl_hours: 336,
            max_connections: 256,
            users: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Local zone keys, when both halves are configured.
    pub fn local_keys(&self) -> Option<ZoneKeys> {
        match (&self.zone_key, &self.negotiation_key) {
            (Some(zone_key), Some(negotiation_key)) => Some(ZoneKeys {
                zone_key: zone_key.clone(),
                negotiation_key: negotiation_key.clone(),
            }),
            _ => None,
        }
    }

    /// Negotiation responder settings.
    pub fn negotiation_settings(&self) -> AgentNegotiation {
        AgentNegotiation {
            policy: self.negotiation_policy,
            local: self.local_keys(),
            federation: self.federation.clone(),
            require_signed: self.require_signed_negotiation,
        }
    }

    /// Certificate source for TLS upgrades.
    pub fn cert_source(&self) -> CertSource {
        if let Some(cert) = &self.tls_cert {
            return cert.clone();
        }
        match (&self.tls_cert_file, &self.tls_key_file) {
            (Some(cert), Some(key)) => CertSource::from_files(cert, key),
            _ => CertSource::default(),
        }
    }

    /// Startup read deadline.
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// Request deadline before login.
    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_secs(self.challenge_timeout_secs)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.zone_key.is_some() != self.negotiation_key.is_some() {
            return Err(GridError::Config(
                "zone_key and negotiation_key must be configured together".into(),
            ));
        }
        if self.tls_cert_file.is_some() != self.tls_key_file.is_some() {
            return Err(GridError::Config(
                "tls_cert_file and tls_key_file must be configured together".into(),
            ));
        }
        if self.max_ttl_hours == 0 {
            return Err(GridError::Config("max_ttl_hours must be non-zero".into()));
        }
        if self.local_zone.is_empty() {
            return Err(GridError::Config("local_zone must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.client.port, 1247);
        assert_eq!(config.client.authentication_scheme, "native");
        assert_eq!(config.client.client_server_policy, Policy::Refuse);
        assert_eq!(config.agent.max_ttl_hours, 336);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            [client]
            host = "grid.example.org"
            user_name = "alice"
            zone_name = "labZone"
            client_server_policy = "CS_NEG_REQUIRE"
            client_server_negotiation = true
            default_hash_scheme = "sha256"

            [agent]
            local_zone = "labZone"
            zone_key = "zone_secret"
            negotiation_key = "abcdefghijklmnopqrstuvwxyz012345"
            negotiation_policy = "CS_NEG_DONT_CARE"
            match_hash_policy = "strict"

            [agent.remote_zone_sids]
            otherZone = "remote_sid"

            [[agent.users]]
            name = "alice"
            user_type = "rodsadmin"
            password = "hunter2"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.client.host, "grid.example.org");
        assert_eq!(config.client.port, 1247);
        assert_eq!(config.client.client_server_policy, Policy::Require);
        assert_eq!(config.client.default_hash_scheme, HashScheme::Sha256);
        assert!(config.agent.local_keys().is_some());
        assert_eq!(config.agent.match_hash_policy, HashPolicy::Strict);
        assert_eq!(config.agent.remote_zone_sids["otherZone"], "remote_sid");
        assert_eq!(config.agent.users[0].user_type, UserType::RodsAdmin);
        assert!(!format!("{:?}", config.agent.users).contains("hunter2"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_negotiation_key_rejected_at_load() {
        let toml = r#"
            [agent]
            zone_key = "z"
            negotiation_key = "too-short"
        "#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }

    #[test]
    fn test_half_configured_keys_invalid() {
        let mut config = Config::default();
        config.agent.zone_key = Some("z".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gridlink.toml");
        std::fs::write(&path, "[client]\nport = 2000\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.client.port, 2000);

        assert!(Config::from_file(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_merge_prefers_non_default() {
        let mut base = Config::default();
        base.client.host = "base.example.org".into();
        base.client.user_name = "alice".into();

        let mut over = Config::default();
        over.client.port = 4000;
        over.client.auth_file = Some(PathBuf::from("/tmp/auth"));

        let merged = base.merge(over);
        assert_eq!(merged.client.host, "base.example.org");
        assert_eq!(merged.client.user_name, "alice");
        assert_eq!(merged.client.port, 4000);
        assert_eq!(merged.client.auth_file, Some(PathBuf::from("/tmp/auth")));
    }

    #[test]
    fn test_merge_keeps_agent_settings() {
        let mut base = Config::default();
        base.agent.local_zone = "otherZone".into();
        base.agent.max_ttl_hours = 8;

        let mut over = Config::default();
        over.agent.match_hash_policy = HashPolicy::Strict;

        let merged = base.merge(over);
        assert_eq!(merged.agent.local_zone, "otherZone");
        assert_eq!(merged.agent.max_ttl_hours, 8);
        assert_eq!(merged.agent.match_hash_policy, HashPolicy::Strict);
    }

    #[test]
    fn test_trust_prefers_programmatic() {
        let mut client = ClientConfig::default();
        assert!(client.trust().is_none());
        client.ssl_ca_certificate_file = Some(PathBuf::from("/etc/ca.pem"));
        assert!(matches!(client.trust(), Some(TrustConfig::CaFile(_))));
        client.tls_trust = Some(TrustConfig::AcceptAny);
        assert!(matches!(client.trust(), Some(TrustConfig::AcceptAny)));
        assert_eq!(client.server_name(), "localhost");
    }
}
