//! # Gridlink - data-grid session establishment
//!
//! Client and agent sides of the session setup that precedes any data-grid
//! API traffic: connect, exchange versions, negotiate transport security,
//! authenticate, and keep the session alive across socket replacement.
//!
//! ## Session Flow
//!
//! ```text
//! Client                                   Agent
//!    |-- TCP connect (3 attempts) ---------->|
//!    |-- RODS_CONNECT (StartupPack) -------->|
//!    |<- RODS_VERSION (status, cookie) ------|  status < 0: refused
//!    |<= RODS_CS_NEG exchange ==============>|  both opted in
//!    |== TLS upgrade =======================>|  CS_NEG_USE_SSL only
//!    |-- RODS_API_REQ 110000 auth rounds --->|
//!    |<- RODS_API_REPLY ---------------------|
//!    |-- RODS_API_REQ ... ------------------>|  logged in
//!    |-- RODS_DISCONNECT ------------------->|
//! ```
//!
//! ## Quick Start
//!
//! ### Client
//!
//! ```rust,ignore
//! use gridlink::{connect, AuthContext, ClientConfig};
//!
//! let mut conn = connect("grid.example.org", 1247, "alice", "tempZone", false,
//!     ClientConfig::default()).await?;
//! conn.authenticate(None, &AuthContext::new().with_password("secret")).await?;
//! assert!(conn.is_logged_in());
//! conn.disconnect().await?;
//! ```
//!
//! ### Agent
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use gridlink::{Agent, AgentConfig, MemoryCredentialStore, SchemeRegistry};
//!
//! let config = AgentConfig::default();
//! let store = Arc::new(MemoryCredentialStore::from_config(&config)?);
//! Agent::new(config, store, SchemeRegistry::with_defaults()).serve().await?;
//! ```
//!
//! ## Modules
//!
//! - [`net`]: Socket connector, wire framer and TLS plumbing
//! - [`protocol`]: Startup/version exchange and transport negotiation
//! - [`auth`]: Scheme registry, dispatcher and native challenge-response
//! - [`connection`]: Client connection lifecycle
//! - [`agent`]: Agent listener, sessions and credential store
//! - [`reconnect`]: Background reconnection and socket handoff
//! - [`identity`]: Users, types and privilege levels
//! - [`config`]: Configuration management
//! - [`error`]: Error codes, error stack and result alias

pub mod agent;
pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod net;
pub mod protocol;
pub mod reconnect;

// Re-exports for convenience
pub use agent::{Agent, AgentSession, BoundAgent, CredentialStore, MemoryCredentialStore};
pub use auth::{AuthContext, AuthDocument, HashPolicy, HashScheme, SchemeRegistry};
pub use config::{AgentConfig, ClientConfig, Config};
pub use connection::{connect, ApiReply, Connection};
pub use error::{ErrorCode, ErrorStack, GridError, Result};
pub use identity::{PrivilegeLevel, UserIdentity, UserType};
pub use protocol::{Outcome, Policy};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
