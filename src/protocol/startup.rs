//! Startup and version exchange.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::message::{StartupPack, VersionInfo};
use super::{API_VERSION, MAX_STARTUP_STRUCT_LEN, MAX_VERSION_STRUCT_LEN, RELEASE_VERSION};
use crate::error::{ErrorCode, GridError, Result};
use crate::net::framer::{self, MsgType};
use crate::net::pack::PackStruct;

/// Send the client startup message.
pub async fn send_startup<S>(stream: &mut S, startup: &StartupPack) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    debug!(
        "Sending startup for {}#{} (client {}#{}, connect_cnt={}, reconnect={})",
        startup.proxy_user,
        startup.proxy_zone,
        startup.client_user,
        startup.client_zone,
        startup.connect_count,
        startup.reconnect_flag
    );
    framer::send_message(stream, MsgType::Connect, &startup.pack(), &[], &[], 0).await
}

/// Read the agent's version reply; a negative status is a refusal.
pub async fn read_version<S>(stream: &mut S, deadline: Duration) -> Result<VersionInfo>
where
    S: AsyncRead + Unpin,
{
    let header = framer::read_header(stream, Some(deadline)).await?;
    framer::expect_type(&header, MsgType::Version)?;
    framer::check_struct_len(&header, MAX_VERSION_STRUCT_LEN)?;
    framer::warn_unexpected_aux(&header);

    let body = framer::read_body(stream, &header).await?;
    let version = VersionInfo::unpack(&body.structure)?;

    if version.status < 0 {
        let code = ErrorCode(version.status);
        if code == ErrorCode::SYS_EXCEED_CONNECT_CNT {
            return Err(GridError::transport(
                code,
                "agent exceeded its concurrent connection count; \
                 add this host to the agent's trusted host list",
            ));
        }
        return Err(GridError::from_code(
            code,
            format!("connection refused by agent (status {})", version.status),
        ));
    }

    if version.release_version != RELEASE_VERSION {
        warn!(
            "Agent release {} differs from client release {}",
            version.release_version, RELEASE_VERSION
        );
    }
    if version.api_version != API_VERSION {
        warn!(
            "Agent API version {} differs from client API version {}",
            version.api_version, API_VERSION
        );
    }
    Ok(version)
}

/// Agent side: read and validate the startup message.
pub async fn read_startup<S>(stream: &mut S, deadline: Duration) -> Result<StartupPack>
where
    S: AsyncRead + Unpin,
{
    let header = framer::read_header(stream, Some(deadline)).await?;
    framer::expect_type(&header, MsgType::Connect)?;
    framer::check_struct_len(&header, MAX_STARTUP_STRUCT_LEN)?;
    framer::warn_unexpected_aux(&header);

    let body = framer::read_body(stream, &header).await?;
    let startup = StartupPack::unpack(&body.structure)?;
    if startup.proxy_user.is_empty() || startup.proxy_zone.is_empty() {
        return Err(GridError::auth(
            ErrorCode::SYS_INVALID_INPUT_PARAM,
            "startup carries no proxy user or zone",
        ));
    }
    Ok(startup)
}

/// Agent side: send the version reply.
pub async fn send_version<S>(stream: &mut S, version: &VersionInfo) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    framer::send_message(
        stream,
        MsgType::Version,
        &version.pack(),
        &[],
        &[],
        version.status,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_COOKIE;

    fn version(status: i32) -> VersionInfo {
        VersionInfo {
            status,
            release_version: RELEASE_VERSION.to_string(),
            api_version: API_VERSION.to_string(),
            reconnect_port: 0,
            reconnect_addr: String::new(),
            cookie: DEFAULT_COOKIE,
        }
    }

    #[tokio::test]
    async fn test_version_accepted() {
        let mut wire = Vec::new();
        send_version(&mut wire, &version(0)).await.unwrap();
        let parsed = read_version(&mut wire.as_slice(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(parsed.cookie, DEFAULT_COOKIE);
    }

    #[tokio::test]
    async fn test_connect_count_refusal_carries_hint() {
        let mut wire = Vec::new();
        send_version(&mut wire, &version(ErrorCode::SYS_EXCEED_CONNECT_CNT.0))
            .await
            .unwrap();
        let err = read_version(&mut wire.as_slice(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SYS_EXCEED_CONNECT_CNT);
        assert!(err.message().contains("trusted host"));
    }

    #[tokio::test]
    async fn test_other_negative_status_refused() {
        let mut wire = Vec::new();
        send_version(&mut wire, &version(-1234)).await.unwrap();
        let err = read_version(&mut wire.as_slice(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode(-1234));
    }

    #[tokio::test]
    async fn test_oversized_version_is_framing_error() {
        let mut huge = version(0);
        huge.reconnect_addr = "a".repeat(MAX_VERSION_STRUCT_LEN * 2);
        let mut wire = Vec::new();
        send_version(&mut wire, &huge).await.unwrap();
        let err = read_version(&mut wire.as_slice(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SYS_HEADER_READ_LEN_ERR);
    }

    #[tokio::test]
    async fn test_wrong_type_rejected() {
        let mut wire = Vec::new();
        framer::send_message(&mut wire, MsgType::CsNeg, b"x", &[], &[], 0)
            .await
            .unwrap();
        let err = read_version(&mut wire.as_slice(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SYS_HEADER_TYPE_LEN_ERR);
    }

    #[tokio::test]
    async fn test_startup_requires_proxy_user() {
        let pack = StartupPack {
            protocol: 1,
            reconnect_flag: 0,
            connect_count: 0,
            proxy_user: String::new(),
            proxy_zone: "tempZone".into(),
            client_user: String::new(),
            client_zone: "tempZone".into(),
            release_version: RELEASE_VERSION.into(),
            api_version: API_VERSION.into(),
            option: String::new(),
        };
        let mut wire = Vec::new();
        send_startup(&mut wire, &pack).await.unwrap();
        let err = read_startup(&mut wire.as_slice(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SYS_INVALID_INPUT_PARAM);
    }
}
