//! Stream and listener seams between the core and the outside world.
//!
//! The core is written against [`Conn`], an abstract bidirectional byte
//! stream that may happen to be encrypted, and [`Listener`], a source of
//! such streams. TCP, UNIX-domain and TLS flavors are provided; tests run on
//! [`tokio::io::duplex`] pairs.

use std::{
    cmp, io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// A served byte stream.
///
/// Address accessors default to `None`; peers without an IPv4 address bypass
/// per-IP accounting.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Peer address, when the transport has one.
    #[inline(always)]
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Local address, when the transport has one.
    #[inline(always)]
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// A type-erased [`Conn`], the currency of the dispatcher and worker pool.
pub type BoxConn = Box<dyn Conn>;

impl Conn for TcpStream {
    #[inline(always)]
    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }

    #[inline(always)]
    fn local_addr(&self) -> Option<SocketAddr> {
        TcpStream::local_addr(self).ok()
    }
}

#[cfg(unix)]
impl Conn for UnixStream {}

impl Conn for DuplexStream {}

impl Conn for tokio_rustls::server::TlsStream<TcpStream> {
    #[inline(always)]
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.peer_addr().ok()
    }

    #[inline(always)]
    fn local_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.local_addr().ok()
    }
}

// LISTENER

/// A source of accepted streams.
pub trait Listener: Send + 'static {
    /// Waits for the next stream.
    ///
    /// Returning `Ok` with an already-closed stream is a listener bug; the
    /// accept loop classifies errors via their [`io::ErrorKind`], see
    /// [`classify_accept_error`].
    fn accept(&mut self) -> impl std::future::Future<Output = io::Result<BoxConn>> + Send;
}

impl Listener for TcpListener {
    async fn accept(&mut self) -> io::Result<BoxConn> {
        let (stream, _) = TcpListener::accept(self).await?;
        Ok(Box::new(stream))
    }
}

#[cfg(unix)]
impl Listener for UnixListener {
    async fn accept(&mut self) -> io::Result<BoxConn> {
        let (stream, _) = UnixListener::accept(self).await?;
        Ok(Box::new(stream))
    }
}

/// TCP listener completing a TLS handshake before handing the stream over.
///
/// Handshake failures are logged and skipped; they never surface to the
/// accept loop.
pub struct TlsListener {
    inner: TcpListener,
    acceptor: tokio_rustls::TlsAcceptor,
}

impl TlsListener {
    #[inline(always)]
    pub fn new(inner: TcpListener, acceptor: tokio_rustls::TlsAcceptor) -> Self {
        Self { inner, acceptor }
    }
}

impl Listener for TlsListener {
    async fn accept(&mut self) -> io::Result<BoxConn> {
        loop {
            let (stream, peer) = self.inner.accept().await?;
            match self.acceptor.accept(stream).await {
                Ok(tls) => return Ok(Box::new(tls)),
                Err(err) => {
                    tracing::debug!(%peer, error = %err, "tls handshake failed");
                }
            }
        }
    }
}

// ACCEPT ERROR TAXONOMY

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcceptErrorKind {
    /// Transient failure: log, back off one second, keep accepting.
    Temporary,
    /// The listener was closed; treated as clean shutdown.
    Closed,
    /// Permanent failure ending the accept loop.
    Fatal,
}

/// Classifies an accept error per the taxonomy above.
#[inline]
pub(crate) fn classify_accept_error(err: &io::Error) -> AcceptErrorKind {
    use io::ErrorKind::*;

    match err.kind() {
        ConnectionAborted | ConnectionReset | Interrupted | WouldBlock | TimedOut => {
            AcceptErrorKind::Temporary
        }
        UnexpectedEof | NotConnected => AcceptErrorKind::Closed,
        _ => AcceptErrorKind::Fatal,
    }
}

// HIJACKED STREAM

/// The duplex stream handed to a hijack handler.
///
/// Bytes the server had already buffered beyond the final HTTP request are
/// replayed before the raw stream is read, so protocol upgrades observe the
/// byte stream without loss. Server timeouts and limits no longer apply.
pub struct HijackedConn {
    prefix: Bytes,
    conn: BoxConn,
}

impl HijackedConn {
    #[inline(always)]
    pub(crate) fn new(conn: BoxConn, prefix: Bytes) -> Self {
        Self { prefix, conn }
    }
}

impl AsyncRead for HijackedConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = cmp::min(self.prefix.len(), buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.conn).poll_read(cx, buf)
    }
}

impl AsyncWrite for HijackedConn {
    #[inline]
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.conn).poll_write(cx, buf)
    }

    #[inline]
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.conn).poll_flush(cx)
    }

    #[inline]
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.conn).poll_shutdown(cx)
    }
}

impl Conn for HijackedConn {
    #[inline(always)]
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.peer_addr()
    }

    #[inline(always)]
    fn local_addr(&self) -> Option<SocketAddr> {
        self.conn.local_addr()
    }
}


#[cfg(test)]
mod classify_tests {
    use super::*;

    #[test]
    fn accept_error_taxonomy() {
        use io::ErrorKind::*;

        #[rustfmt::skip]
        let cases = [
            (ConnectionAborted, AcceptErrorKind::Temporary),
            (ConnectionReset,   AcceptErrorKind::Temporary),
            (Interrupted,       AcceptErrorKind::Temporary),
            (WouldBlock,        AcceptErrorKind::Temporary),
            (TimedOut,          AcceptErrorKind::Temporary),

            (UnexpectedEof,     AcceptErrorKind::Closed),
            (NotConnected,      AcceptErrorKind::Closed),

            (PermissionDenied,  AcceptErrorKind::Fatal),
            (AddrInUse,         AcceptErrorKind::Fatal),
            (Other,             AcceptErrorKind::Fatal),
        ];

        for (kind, expected) in cases {
            let err = io::Error::new(kind, "accept failed");
            assert_eq!(classify_accept_error(&err), expected);
        }
    }
}
