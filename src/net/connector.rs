//! Bounded-retry, timed TCP connect with socket tuning.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{ErrorCode, GridError, Result};

/// Connect attempts before giving up.
pub const CONNECT_ATTEMPTS: u32 = 3;

/// Per-attempt connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Smallest socket buffer size.
pub const MIN_WINDOW_SIZE: usize = 1024 * 1024;

/// Largest socket buffer size.
pub const MAX_WINDOW_SIZE: usize = 16 * 1024 * 1024;

/// Default socket buffer size.
pub const DEFAULT_WINDOW_SIZE: usize = 4 * 1024 * 1024;

/// Linger on close.
pub const LINGER: Duration = Duration::from_secs(5);

/// Connect parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Requested send/receive buffer size
    pub window_size: usize,
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Number of attempts
    pub attempts: u32,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            timeout: DEFAULT_CONNECT_TIMEOUT,
            attempts: CONNECT_ATTEMPTS,
        }
    }
}

/// Clamp a requested window to `[MIN_WINDOW_SIZE, MAX_WINDOW_SIZE]`.
pub fn clamp_window_size(size: usize) -> usize {
    size.clamp(MIN_WINDOW_SIZE, MAX_WINDOW_SIZE)
}

enum Failure {
    /// Interrupted, in progress or timed out.
    Retry(String),
    /// Refused or otherwise unrecoverable for this address.
    Fail(GridError),
}

fn open_error(what: &str, err: io::Error) -> GridError {
    GridError::transport(
        ErrorCode::USER_SOCK_OPEN_ERR,
        format!("failed to {what}: {err}"),
    )
}

fn tune(socket: &TcpSocket, window: usize) -> Result<()> {
    let window = window as u32;
    socket
        .set_send_buffer_size(window)
        .map_err(|e| open_error("set send buffer", e))?;
    socket
        .set_recv_buffer_size(window)
        .map_err(|e| open_error("set receive buffer", e))?;
    socket
        .set_reuseaddr(true)
        .map_err(|e| open_error("set address reuse", e))?;
    socket
        .set_keepalive(true)
        .map_err(|e| open_error("set keep-alive", e))?;
    // Linger blocks the thread that releases the socket; `GridStream::close`
    // releases it off the runtime.
    #[allow(deprecated)]
    socket
        .set_linger(Some(LINGER))
        .map_err(|e| open_error("set linger", e))?;
    Ok(())
}

async fn connect_once(
    addr: SocketAddr,
    window: usize,
    limit: Duration,
) -> std::result::Result<TcpStream, Failure> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| Failure::Fail(open_error("create socket", e)))?;
    tune(&socket, window).map_err(Failure::Fail)?;

    match timeout(limit, socket.connect(addr)).await {
        Err(_) => Err(Failure::Retry(format!(
            "timed out after {}s",
            limit.as_secs_f32()
        ))),
        Ok(Err(e)) => match e.kind() {
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                Err(Failure::Retry(e.to_string()))
            },
            _ => Err(Failure::Fail(GridError::transport(
                ErrorCode::USER_SOCK_CONNECT_ERR,
                format!("connect to {addr} failed: {e}"),
            ))),
        },
        Ok(Ok(stream)) => {
            stream
                .set_nodelay(true)
                .map_err(|e| Failure::Fail(open_error("set no-delay", e)))?;
            Ok(stream)
        },
    }
}

/// Resolve `host`, connect with bounded retries and tune the socket.
pub async fn attempt_connect(host: &str, port: u16, options: &ConnectOptions) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| {
            GridError::transport(
                ErrorCode::USER_RODS_HOSTNAME_ERR,
                format!("cannot resolve {host}: {e}"),
            )
        })?
        .collect();
    if addrs.is_empty() {
        return Err(GridError::transport(
            ErrorCode::USER_RODS_HOSTNAME_ERR,
            format!("{host} resolved to no addresses"),
        ));
    }

    let window = clamp_window_size(options.window_size);
    let attempts = options.attempts.max(1);
    for attempt in 1..=attempts {
        let mut retry = false;
        let mut last_failure = None;
        for addr in &addrs {
            debug!("Connecting to {} (attempt {}/{})", addr, attempt, attempts);
            match connect_once(*addr, window, options.timeout).await {
                Ok(stream) => {
                    info!("Connected to {}:{} via {}", host, port, addr);
                    return Ok(stream);
                },
                Err(Failure::Retry(reason)) => {
                    warn!("Connect to {} attempt {} failed: {}", addr, attempt, reason);
                    retry = true;
                },
                Err(Failure::Fail(err)) => {
                    debug!("Connect to {} failed: {}", addr, err);
                    last_failure = Some(err);
                },
            }
        }
        if !retry {
            if let Some(err) = last_failure {
                return Err(err);
            }
        }
    }

    Err(GridError::transport(
        ErrorCode::USER_SOCK_CONNECT_TIMEDOUT,
        format!("could not connect to {host}:{port} after {attempts} attempts"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_clamp_window_size() {
        assert_eq!(clamp_window_size(0), MIN_WINDOW_SIZE);
        assert_eq!(clamp_window_size(usize::MAX), MAX_WINDOW_SIZE);
        assert_eq!(clamp_window_size(DEFAULT_WINDOW_SIZE), DEFAULT_WINDOW_SIZE);
    }

    #[tokio::test]
    async fn test_connect_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let stream = attempt_connect("127.0.0.1", port, &ConnectOptions::default())
            .await
            .unwrap();
        assert!(stream.nodelay().unwrap());
        let (_accepted, _) = listener.accept().await.unwrap();
    }

    #[tokio::test]
    async fn test_lingering_socket_closes_promptly() {
        use tokio::io::AsyncWriteExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let stream = attempt_connect("127.0.0.1", port, &ConnectOptions::default())
            .await
            .unwrap();
        assert_eq!(stream.linger().unwrap(), Some(LINGER));
        let (_accepted, _) = listener.accept().await.unwrap();

        let mut stream = crate::net::GridStream::from(stream);
        stream.write_all(&[0u8; 4096]).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), stream.close())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = attempt_connect("127.0.0.1", port, &ConnectOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::USER_SOCK_CONNECT_ERR);
    }

    #[tokio::test]
    async fn test_unresolvable_host() {
        let err = attempt_connect("no-such-host.invalid", 1247, &ConnectOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::USER_RODS_HOSTNAME_ERR);
    }
}
