//! Gridlink error types.
//!
//! # Error Taxonomy
//!
//! Every failure carries a numeric [`ErrorCode`] shared with the wire protocol
//! (negative `int_info` statuses) and a category that decides how the caller
//! may react:
//!
//! | Category      | Examples                                  | Retried?                     |
//! |---------------|-------------------------------------------|------------------------------|
//! | Transport     | resolution, connect refused/timeout       | bounded, inside the connector|
//! | Framing       | bad header type, out-of-bounds lengths    | never                        |
//! | Negotiation   | policy conflict, signature mismatch       | never (caller may redo all)  |
//! | Auth          | missing key, digest mismatch              | never (caller may redo all)  |
//! | Resource      | digest library state, allocation          | never                        |
//!
//! Errors that reach a connection are also recorded on its [`ErrorStack`].

use std::fmt;

use thiserror::Error;

/// Numeric status code exchanged on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    /// Agent refused the connection: too many concurrent connections.
    pub const SYS_EXCEED_CONNECT_CNT: Self = Self(-9000);
    /// Header length prefix out of range or unreadable.
    pub const SYS_HEADER_READ_LEN_ERR: Self = Self(-4000);
    /// Header could not be written completely.
    pub const SYS_HEADER_WRITE_LEN_ERR: Self = Self(-5000);
    /// Message type did not match the expected type.
    pub const SYS_HEADER_TYPE_LEN_ERR: Self = Self(-6000);
    /// API number not served by the agent.
    pub const SYS_UNMATCHED_API_NUM: Self = Self(-12000);
    /// Internal invariant broken (missing state).
    pub const SYS_INTERNAL_NULL_INPUT_ERR: Self = Self(-24000);
    /// Digest or random source failure.
    pub const SYS_LIBRARY_ERROR: Self = Self(-25000);
    /// Message body shorter than its header declared.
    pub const SYS_READ_MSG_BODY_LEN_ERR: Self = Self(-91000);
    /// Socket read exceeded its deadline.
    pub const SYS_SOCK_READ_TIMEDOUT: Self = Self(-115000);
    /// Socket read failed or the peer closed the stream.
    pub const SYS_SOCK_READ_ERR: Self = Self(-116000);
    /// Invalid or missing input parameter.
    pub const SYS_INVALID_INPUT_PARAM: Self = Self(-130000);
    /// API requires an authenticated session.
    pub const SYS_NO_API_PRIV: Self = Self(-158000);
    /// Reconnect handoff failed.
    pub const SYS_RECONNECT_ERR: Self = Self(-165000);
    /// Configuration could not be loaded or is invalid.
    pub const SYS_CONFIG_FILE_ERR: Self = Self(-170000);
    /// Local I/O failure (auth file, stdin).
    pub const SYS_IO_ERR: Self = Self(-171000);
    /// Client-side negotiation failure.
    pub const CLIENT_NEGOTIATION_ERROR: Self = Self(-189000);
    /// Agent-side negotiation failure.
    pub const SERVER_NEGOTIATION_ERROR: Self = Self(-190000);
    /// Empty authentication string.
    pub const USER_AUTH_STRING_EMPTY: Self = Self(-301000);
    /// Host name could not be resolved.
    pub const USER_RODS_HOSTNAME_ERR: Self = Self(-303000);
    /// Socket could not be created or tuned.
    pub const USER_SOCK_OPEN_ERR: Self = Self(-304000);
    /// Connect was refused.
    pub const USER_SOCK_CONNECT_ERR: Self = Self(-305000);
    /// Packed structure malformed.
    pub const USER_PACKSTRUCT_INPUT_ERR: Self = Self(-308000);
    /// Requested authentication scheme is not registered.
    pub const AUTH_SCHEME_NOT_SUPPORTED: Self = Self(-309000);
    /// Connect attempts exhausted.
    pub const USER_SOCK_CONNECT_TIMEDOUT: Self = Self(-347000);
    /// Digest did not match.
    pub const CAT_INVALID_AUTHENTICATION: Self = Self(-826000);
    /// User unknown to the catalog.
    pub const CAT_INVALID_USER: Self = Self(-827000);
    /// Proxy user lacks privilege to act for the client user.
    pub const CAT_INSUFFICIENT_PRIVILEGE_LEVEL: Self = Self(-830000);
    /// Limited password expired.
    pub const CAT_PASSWORD_EXPIRED: Self = Self(-840000);
    /// Password longer than the maximum length.
    pub const PASSWORD_EXCEEDS_MAX_SIZE: Self = Self(-903000);
    /// Remote catalog response did not match.
    pub const REMOTE_SERVER_AUTHENTICATION_FAILURE: Self = Self(-910000);
    /// Remote catalog response missing.
    pub const REMOTE_SERVER_AUTH_NOT_PROVIDED: Self = Self(-911000);
    /// Remote catalog response empty.
    pub const REMOTE_SERVER_AUTH_EMPTY: Self = Self(-912000);
    /// No shared secret configured for the remote zone.
    pub const REMOTE_SERVER_SID_NOT_DEFINED: Self = Self(-913000);
    /// Requested time-to-live out of range.
    pub const PAM_AUTH_PASSWORD_INVALID_TTL: Self = Self(-993000);

    /// Symbolic name of the code, if known.
    pub fn name(self) -> &'static str {
        match self {
            Self::SYS_EXCEED_CONNECT_CNT => "SYS_EXCEED_CONNECT_CNT",
            Self::SYS_HEADER_READ_LEN_ERR => "SYS_HEADER_READ_LEN_ERR",
            Self::SYS_HEADER_WRITE_LEN_ERR => "SYS_HEADER_WRITE_LEN_ERR",
            Self::SYS_HEADER_TYPE_LEN_ERR => "SYS_HEADER_TYPE_LEN_ERR",
            Self::SYS_UNMATCHED_API_NUM => "SYS_UNMATCHED_API_NUM",
            Self::SYS_INTERNAL_NULL_INPUT_ERR => "SYS_INTERNAL_NULL_INPUT_ERR",
            Self::SYS_LIBRARY_ERROR => "SYS_LIBRARY_ERROR",
            Self::SYS_READ_MSG_BODY_LEN_ERR => "SYS_READ_MSG_BODY_LEN_ERR",
            Self::SYS_SOCK_READ_TIMEDOUT => "SYS_SOCK_READ_TIMEDOUT",
            Self::SYS_SOCK_READ_ERR => "SYS_SOCK_READ_ERR",
            Self::SYS_INVALID_INPUT_PARAM => "SYS_INVALID_INPUT_PARAM",
            Self::SYS_NO_API_PRIV => "SYS_NO_API_PRIV",
            Self::SYS_RECONNECT_ERR => "SYS_RECONNECT_ERR",
            Self::SYS_CONFIG_FILE_ERR => "SYS_CONFIG_FILE_ERR",
            Self::SYS_IO_ERR => "SYS_IO_ERR",
            Self::CLIENT_NEGOTIATION_ERROR => "CLIENT_NEGOTIATION_ERROR",
            Self::SERVER_NEGOTIATION_ERROR => "SERVER_NEGOTIATION_ERROR",
            Self::USER_AUTH_STRING_EMPTY => "USER_AUTH_STRING_EMPTY",
            Self::USER_RODS_HOSTNAME_ERR => "USER_RODS_HOSTNAME_ERR",
            Self::USER_SOCK_OPEN_ERR => "USER_SOCK_OPEN_ERR",
            Self::USER_SOCK_CONNECT_ERR => "USER_SOCK_CONNECT_ERR",
            Self::USER_PACKSTRUCT_INPUT_ERR => "USER_PACKSTRUCT_INPUT_ERR",
            Self::AUTH_SCHEME_NOT_SUPPORTED => "AUTH_SCHEME_NOT_SUPPORTED",
            Self::USER_SOCK_CONNECT_TIMEDOUT => "USER_SOCK_CONNECT_TIMEDOUT",
            Self::CAT_INVALID_AUTHENTICATION => "CAT_INVALID_AUTHENTICATION",
            Self::CAT_INVALID_USER => "CAT_INVALID_USER",
            Self::CAT_INSUFFICIENT_PRIVILEGE_LEVEL => "CAT_INSUFFICIENT_PRIVILEGE_LEVEL",
            Self::CAT_PASSWORD_EXPIRED => "CAT_PASSWORD_EXPIRED",
            Self::PASSWORD_EXCEEDS_MAX_SIZE => "PASSWORD_EXCEEDS_MAX_SIZE",
            Self::REMOTE_SERVER_AUTHENTICATION_FAILURE => "REMOTE_SERVER_AUTHENTICATION_FAILURE",
            Self::REMOTE_SERVER_AUTH_NOT_PROVIDED => "REMOTE_SERVER_AUTH_NOT_PROVIDED",
            Self::REMOTE_SERVER_AUTH_EMPTY => "REMOTE_SERVER_AUTH_EMPTY",
            Self::REMOTE_SERVER_SID_NOT_DEFINED => "REMOTE_SERVER_SID_NOT_DEFINED",
            Self::PAM_AUTH_PASSWORD_INVALID_TTL => "PAM_AUTH_PASSWORD_INVALID_TTL",
            _ => "UNKNOWN_ERROR",
        }
    }

    /// Category a code belongs to when rebuilt from a wire status.
    pub fn category(self) -> ErrorCategory {
        match self {
            Self::SYS_EXCEED_CONNECT_CNT
            | Self::USER_RODS_HOSTNAME_ERR
            | Self::USER_SOCK_OPEN_ERR
            | Self::USER_SOCK_CONNECT_ERR
            | Self::USER_SOCK_CONNECT_TIMEDOUT
            | Self::SYS_SOCK_READ_TIMEDOUT
            | Self::SYS_SOCK_READ_ERR
            | Self::SYS_RECONNECT_ERR => ErrorCategory::Transport,
            Self::SYS_HEADER_READ_LEN_ERR
            | Self::SYS_HEADER_WRITE_LEN_ERR
            | Self::SYS_HEADER_TYPE_LEN_ERR
            | Self::SYS_READ_MSG_BODY_LEN_ERR
            | Self::USER_PACKSTRUCT_INPUT_ERR
            | Self::SYS_UNMATCHED_API_NUM => ErrorCategory::Framing,
            Self::CLIENT_NEGOTIATION_ERROR | Self::SERVER_NEGOTIATION_ERROR => {
                ErrorCategory::Negotiation
            },
            Self::SYS_LIBRARY_ERROR | Self::SYS_INTERNAL_NULL_INPUT_ERR => ErrorCategory::Resource,
            _ => ErrorCategory::Auth,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

/// Failure category, mirroring the variants of [`GridError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Socket-level failures.
    Transport,
    /// Malformed or unexpected frames.
    Framing,
    /// Transport-security negotiation failures.
    Negotiation,
    /// Authentication protocol or credential failures.
    Auth,
    /// Library or allocation failures.
    Resource,
}

/// Gridlink errors.
#[derive(Error, Debug)]
pub enum GridError {
    /// Resolution, connect, socket-option or read failure.
    #[error("Transport error [{code}]: {message}")]
    Transport {
        /// Wire status code.
        code: ErrorCode,
        /// Human readable detail.
        message: String,
    },

    /// Bad header type or out-of-bounds lengths.
    #[error("Framing error [{code}]: {message}")]
    Framing {
        /// Wire status code.
        code: ErrorCode,
        /// Human readable detail.
        message: String,
    },

    /// Policy conflict or signature mismatch.
    #[error("Negotiation error [{code}]: {message}")]
    Negotiation {
        /// Wire status code.
        code: ErrorCode,
        /// Human readable detail.
        message: String,
    },

    /// Missing key, malformed digest, digest mismatch or bad flow.
    #[error("Authentication error [{code}]: {message}")]
    Auth {
        /// Wire status code.
        code: ErrorCode,
        /// Human readable detail.
        message: String,
    },

    /// Digest library or allocation failure.
    #[error("Resource error [{code}]: {message}")]
    Resource {
        /// Wire status code.
        code: ErrorCode,
        /// Human readable detail.
        message: String,
    },

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for gridlink operations
pub type Result<T> = std::result::Result<T, GridError>;

impl GridError {
    /// Transport failure.
    pub fn transport(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Transport {
            code,
            message: message.into(),
        }
    }

    /// Framing failure.
    pub fn framing(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Framing {
            code,
            message: message.into(),
        }
    }

    /// Negotiation failure.
    pub fn negotiation(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Negotiation {
            code,
            message: message.into(),
        }
    }

    /// Authentication failure.
    pub fn auth(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Auth {
            code,
            message: message.into(),
        }
    }

    /// Resource failure.
    pub fn resource(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Resource {
            code,
            message: message.into(),
        }
    }

    /// Rebuild an error from a wire status and message.
    pub fn from_code(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match code.category() {
            ErrorCategory::Transport => Self::transport(code, message),
            ErrorCategory::Framing => Self::framing(code, message),
            ErrorCategory::Negotiation => Self::negotiation(code, message),
            ErrorCategory::Auth => Self::auth(code, message),
            ErrorCategory::Resource => Self::resource(code, message),
        }
    }

    /// Wire status code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Transport { code, .. }
            | Self::Framing { code, .. }
            | Self::Negotiation { code, .. }
            | Self::Auth { code, .. }
            | Self::Resource { code, .. } => *code,
            Self::Config(_) => ErrorCode::SYS_CONFIG_FILE_ERR,
            Self::Json(_) => ErrorCode::USER_PACKSTRUCT_INPUT_ERR,
            Self::Io(_) => ErrorCode::SYS_IO_ERR,
        }
    }

    /// Detail message without the category prefix.
    pub fn message(&self) -> String {
        match self {
            Self::Transport { message, .. }
            | Self::Framing { message, .. }
            | Self::Negotiation { message, .. }
            | Self::Auth { message, .. }
            | Self::Resource { message, .. } => message.clone(),
            Self::Config(msg) => msg.clone(),
            Self::Json(err) => err.to_string(),
            Self::Io(err) => err.to_string(),
        }
    }

    /// Whether the error leaves the stream in an unknown state.
    ///
    /// Transport and framing failures poison the stream; everything else
    /// arrives as a complete reply.
    pub fn is_fatal_to_stream(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Framing { .. } | Self::Io(_))
    }
}

impl From<toml::de::Error> for GridError {
    fn from(err: toml::de::Error) -> Self {
        GridError::Config(err.to_string())
    }
}

impl From<base64::DecodeError> for GridError {
    fn from(err: base64::DecodeError) -> Self {
        GridError::framing(
            ErrorCode::USER_PACKSTRUCT_INPUT_ERR,
            format!("Base64 decode error: {err}"),
        )
    }
}

/// Maximum number of entries kept on an [`ErrorStack`].
pub const MAX_ERROR_MESSAGES: usize = 100;

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEntry {
    /// Wire status code.
    pub code: ErrorCode,
    /// Human readable detail.
    pub message: String,
}

/// Bounded stack of structured errors attached to a connection.
#[derive(Debug, Default, Clone)]
pub struct ErrorStack {
    entries: Vec<ErrorEntry>,
}

impl ErrorStack {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entry, dropping the oldest one when full.
    pub fn push(&mut self, code: ErrorCode, message: impl Into<String>) {
        if self.entries.len() >= MAX_ERROR_MESSAGES {
            self.entries.remove(0);
        }
        self.entries.push(ErrorEntry {
            code,
            message: message.into(),
        });
    }

    /// Record a [`GridError`].
    pub fn record(&mut self, err: &GridError) {
        self.push(err.code(), err.message());
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> &[ErrorEntry] {
        &self.entries
    }

    /// Most recent entry.
    pub fn last(&self) -> Option<&ErrorEntry> {
        self.entries.last()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no errors were recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_code_picks_category() {
        let err = GridError::from_code(ErrorCode::CAT_INVALID_AUTHENTICATION, "bad digest");
        assert!(matches!(err, GridError::Auth { .. }));
        assert_eq!(err.code().0, -826000);

        let err = GridError::from_code(ErrorCode::SYS_HEADER_TYPE_LEN_ERR, "wrong type");
        assert!(matches!(err, GridError::Framing { .. }));

        let err = GridError::from_code(ErrorCode::SERVER_NEGOTIATION_ERROR, "conflict");
        assert!(matches!(err, GridError::Negotiation { .. }));

        let err = GridError::from_code(ErrorCode::SYS_EXCEED_CONNECT_CNT, "busy");
        assert!(err.is_fatal_to_stream());
    }

    #[test]
    fn test_unknown_code_defaults_to_auth() {
        let err = GridError::from_code(ErrorCode(-123), "?");
        assert!(matches!(err, GridError::Auth { .. }));
        assert_eq!(ErrorCode(-123).name(), "UNKNOWN_ERROR");
    }

    #[test]
    fn test_display_includes_code_name() {
        let err = GridError::transport(ErrorCode::USER_SOCK_CONNECT_TIMEDOUT, "gave up");
        let text = err.to_string();
        assert!(text.contains("USER_SOCK_CONNECT_TIMEDOUT"));
        assert!(text.contains("-347000"));
        assert!(text.contains("gave up"));
    }

    #[test]
    fn test_error_stack_bounded() {
        let mut stack = ErrorStack::new();
        for i in 0..(MAX_ERROR_MESSAGES + 5) {
            stack.push(ErrorCode::SYS_IO_ERR, format!("error {i}"));
        }
        assert_eq!(stack.len(), MAX_ERROR_MESSAGES);
        assert_eq!(stack.entries()[0].message, "error 5");
        assert_eq!(
            stack.last().map(|e| e.message.as_str()),
            Some("error 104")
        );
    }

    #[test]
    fn test_error_stack_record() {
        let mut stack = ErrorStack::new();
        stack.record(&GridError::Config("missing zone".to_string()));
        assert_eq!(stack.last().unwrap().code, ErrorCode::SYS_CONFIG_FILE_ERR);
        assert_eq!(stack.last().unwrap().message, "missing zone");
        stack.clear();
        assert!(stack.is_empty());
    }
}
