//! Session stream, plain or TLS-secured.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

/// Connection stream (plain TCP or TLS in either role).
pub enum GridStream {
    /// Plain TCP
    Plain(TcpStream),
    /// TLS, client role
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    /// TLS, agent role
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl GridStream {
    /// Check if the stream is secured.
    pub fn is_secure(&self) -> bool {
        !matches!(self, Self::Plain(_))
    }

    /// Underlying TCP stream.
    pub fn tcp(&self) -> &TcpStream {
        match self {
            Self::Plain(stream) => stream,
            Self::ClientTls(stream) => stream.get_ref().0,
            Self::ServerTls(stream) => stream.get_ref().0,
        }
    }

    /// Remote address.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    /// Local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().local_addr()
    }

    /// Shut down and close; consuming the stream makes a second close impossible.
    pub async fn close(mut self) -> io::Result<()> {
        let result = self.shutdown().await;
        let tcp = match self {
            Self::Plain(tcp) => tcp,
            Self::ClientTls(tls) => tls.into_inner().0,
            Self::ServerTls(tls) => tls.into_inner().0,
        };
        // With linger set, releasing the descriptor can block for the linger time.
        if let Ok(tcp) = tcp.into_std() {
            drop(tokio::task::spawn_blocking(move || drop(tcp)));
        }
        match result {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for GridStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Plain(_) => "Plain",
            Self::ClientTls(_) => "ClientTls",
            Self::ServerTls(_) => "ServerTls",
        };
        f.debug_struct("GridStream")
            .field("kind", &kind)
            .field("peer", &self.peer_addr().ok())
            .finish()
    }
}

impl From<TcpStream> for GridStream {
    fn from(stream: TcpStream) -> Self {
        Self::Plain(stream)
    }
}

impl AsyncRead for GridStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::ClientTls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            Self::ServerTls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for GridStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::ClientTls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            Self::ServerTls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::ClientTls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            Self::ServerTls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::ClientTls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            Self::ServerTls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
