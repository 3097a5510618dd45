//! Session setup protocol.
//!
//! ## Message Flow
//!
//! ```text
//! Client                                Agent
//!    |------- RODS_CONNECT (startup) --->|
//!    |<------ RODS_VERSION --------------|  status < 0: refused
//!    |<====== RODS_CS_NEG exchange =====>|  only if both opted in
//!    |======= TLS upgrade ==============>|  only on CS_NEG_USE_SSL
//!    |------- RODS_API_REQ 110000 ------>|  authentication rounds
//!    |<------ RODS_API_REPLY ------------|
//!    |               ...                 |
//!    |------- RODS_DISCONNECT ---------->|
//! ```
//!
//! ## Constants
//!
//! | Name                  | Value     |
//! |-----------------------|-----------|
//! | `AUTHENTICATION_APN`  | 110000    |
//! | `GET_LIMITED_PASSWORD_AN` | 713   |
//! | `DEFAULT_COOKIE`      | 400       |
//! | version read timeout  | 100 s     |

pub mod message;
pub mod negotiation;
pub mod startup;

use std::time::Duration;

pub use message::{
    CsNeg, LimitedPasswordInput, LimitedPasswordOutput, RErrMsg, RError, ReconnMsg, StartupPack,
    VersionInfo,
};
pub use negotiation::{negotiate, AgentNegotiation, NegotiationKey, Outcome, Policy, ZoneKeys};
pub use startup::{read_startup, read_version, send_startup, send_version};

/// Release version advertised in startup and version messages.
pub const RELEASE_VERSION: &str = concat!("grid", env!("CARGO_PKG_VERSION"));

/// API version advertised in startup and version messages.
pub const API_VERSION: &str = "d";

/// Protocol id sent in the startup message (textual packing).
pub const PROTOCOL_ID: i32 = 1;

/// Options token asking the agent to negotiate.
pub const REQUEST_SERVER_NEGOTIATION: &str = "request_server_negotiation";

/// Cookie sent when reconnect is not offered.
pub const DEFAULT_COOKIE: i32 = 400;

/// Version message struct bound (a reply may use up to twice this).
pub const MAX_VERSION_STRUCT_LEN: usize = 396;

/// Startup message struct bound (a request may use up to twice this).
pub const MAX_STARTUP_STRUCT_LEN: usize = 1024;

/// Default wait for the version reply.
pub const VERSION_READ_TIMEOUT: Duration = Duration::from_secs(100);

/// API number of the authentication request.
pub const AUTHENTICATION_APN: i32 = 110000;

/// API number minting limited-password material.
pub const GET_LIMITED_PASSWORD_AN: i32 = 713;

/// API number of the built-in echo handler.
pub const ECHO_AN: i32 = 9999;
