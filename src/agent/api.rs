//! Upper-layer API requests served after authentication.

use bytes::Bytes;

use super::session::AgentSession;
use crate::auth::BoxFuture;
use crate::error::{ErrorCode, GridError, Result};
use crate::protocol::ECHO_AN;

/// An API request as read off the wire.
#[derive(Debug, Clone, Default)]
pub struct ApiRequest {
    /// API number (the header's `intInfo`)
    pub api_number: i32,
    /// Packed structure
    pub structure: Bytes,
    /// Raw byte stream
    pub byte_stream: Bytes,
}

/// Reply to send back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiResponse {
    /// Status (non-negative)
    pub int_info: i32,
    /// Packed structure
    pub structure: Vec<u8>,
    /// Raw byte stream
    pub byte_stream: Vec<u8>,
}

impl ApiResponse {
    /// Status-0 reply carrying `structure`.
    pub fn with_structure(structure: Vec<u8>) -> Self {
        Self {
            int_info: 0,
            structure,
            byte_stream: Vec::new(),
        }
    }
}

/// Handler for API numbers outside the session setup set.
pub trait ApiHandler: Send + Sync {
    /// Handler name for logs.
    fn name(&self) -> &'static str;

    /// Serve one request on an authenticated session.
    fn handle<'a>(
        &'a self,
        session: &'a AgentSession,
        request: ApiRequest,
    ) -> BoxFuture<'a, Result<ApiResponse>>;
}

/// Echoes [`ECHO_AN`] requests; rejects every other API number.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoApiHandler;

impl ApiHandler for EchoApiHandler {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn handle<'a>(
        &'a self,
        _session: &'a AgentSession,
        request: ApiRequest,
    ) -> BoxFuture<'a, Result<ApiResponse>> {
        Box::pin(async move {
            if request.api_number != ECHO_AN {
                return Err(GridError::framing(
                    ErrorCode::SYS_UNMATCHED_API_NUM,
                    format!("API {} is not served here", request.api_number),
                ));
            }
            Ok(ApiResponse {
                int_info: 0,
                structure: request.structure.to_vec(),
                byte_stream: request.byte_stream.to_vec(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::store::MemoryCredentialStore;
    use crate::config::AgentConfig;
    use crate::protocol::StartupPack;
    use std::sync::Arc;

    fn session() -> AgentSession {
        let startup = StartupPack {
            protocol: 1,
            reconnect_flag: 0,
            connect_count: 0,
            proxy_user: "alice".into(),
            proxy_zone: "tempZone".into(),
            client_user: String::new(),
            client_zone: String::new(),
            release_version: String::new(),
            api_version: String::new(),
            option: String::new(),
        };
        AgentSession::new(
            Arc::new(AgentConfig::default()),
            Arc::new(MemoryCredentialStore::new("tempZone")),
            &startup,
            None,
        )
    }

    #[tokio::test]
    async fn test_echo() {
        let session = session();
        let response = EchoApiHandler
            .handle(
                &session,
                ApiRequest {
                    api_number: ECHO_AN,
                    structure: Bytes::from_static(b"ping"),
                    byte_stream: Bytes::from_static(&[0, 1, 2]),
                },
            )
            .await
            .unwrap();
        assert_eq!(response.structure, b"ping");
        assert_eq!(response.byte_stream, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_unknown_api() {
        let session = session();
        let err = EchoApiHandler
            .handle(
                &session,
                ApiRequest {
                    api_number: 42,
                    ..ApiRequest::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SYS_UNMATCHED_API_NUM);
    }
}
