//! The server: handler contract, dispatcher, accept loop and entry points.

use std::{
    future::Future,
    io,
    net::SocketAddr,
    path::Path,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use tokio::net::{TcpListener, ToSocketAddrs};

use crate::{
    bufio::{ConnReader, ConnWriter},
    config::ServerConfig,
    conn::serve_connection,
    ctx::RequestCtx,
    errors::ServeError,
    ip_count::{conn_ip4, PerIpConn, PerIpCounter},
    pool::Pool,
    stream::{classify_accept_error, AcceptErrorKind, BoxConn, Conn, Listener, TlsListener},
    workers::WorkerPool,
};

const DEFAULT_SERVER_NAME: &[u8] = b"brisk_web";

// Repeated overflow conditions are logged at most this often.
const OVERFLOW_LOG_INTERVAL: Duration = Duration::from_secs(60);

// Backoff after a temporary accept failure.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Processes one request.
///
/// The ctx is received by value and returned; everything borrowed from it is
/// recycled afterwards. Any `async fn(Box<RequestCtx>) -> Box<RequestCtx>`
/// or equivalent closure is a handler:
///
/// ```
/// use brisk_web::RequestCtx;
///
/// async fn hello(mut ctx: Box<RequestCtx>) -> Box<RequestCtx> {
///     ctx.response.set_body(b"Hello world!");
///     ctx
/// }
/// ```
///
/// A handler that leaks the ctx into concurrent work it does not await must
/// call [`RequestCtx::timeout_error`] before returning; see
/// [`timeout_handler`](crate::timeout_handler) for the ready-made wrapper.
pub trait Handler: Send + Sync + 'static {
    /// Handles one request cycle.
    fn handle(&self, ctx: Box<RequestCtx>) -> impl Future<Output = Box<RequestCtx>> + Send;
}

impl<F, Fut> Handler for F
where
    F: Fn(Box<RequestCtx>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Box<RequestCtx>> + Send,
{
    #[inline(always)]
    fn handle(&self, ctx: Box<RequestCtx>) -> impl Future<Output = Box<RequestCtx>> + Send {
        self(ctx)
    }
}

// Shared server state: configuration, the handler and the object pools.
pub(crate) struct ServerInner<H> {
    pub(crate) config: ServerConfig,
    pub(crate) handler: H,

    pub(crate) concurrency: AtomicU32,
    pub(crate) per_ip: Arc<PerIpCounter>,
    server_name: OnceLock<Box<[u8]>>,

    pub(crate) ctx_pool: Pool<Box<RequestCtx>>,
    pub(crate) reader_pool: Pool<ConnReader>,
    pub(crate) writer_pool: Pool<ConnWriter>,
}

impl<H: Handler> ServerInner<H> {
    pub(crate) fn acquire_ctx(
        &self,
        remote: Option<SocketAddr>,
        local: Option<SocketAddr>,
    ) -> Box<RequestCtx> {
        let mut ctx = self.ctx_pool.get().unwrap_or_else(RequestCtx::new);
        ctx.remote_addr = remote;
        ctx.local_addr = local;
        ctx
    }

    pub(crate) fn release_ctx(&self, ctx: Box<RequestCtx>) {
        // A detached ctx escaped into user code and may never be reused.
        debug_assert!(ctx.timeout_response.is_none(), "releasing a detached ctx");
        if ctx.timeout_response.is_some() {
            return;
        }
        self.ctx_pool.put(ctx);
    }

    pub(crate) fn acquire_reader(&self) -> ConnReader {
        self.reader_pool
            .get()
            .unwrap_or_else(|| ConnReader::new(self.config.read_buffer()))
    }

    pub(crate) fn acquire_writer(&self) -> ConnWriter {
        self.writer_pool
            .get()
            .unwrap_or_else(|| ConnWriter::new(self.config.write_buffer()))
    }

    pub(crate) fn server_name(&self) -> &[u8] {
        self.server_name.get_or_init(|| {
            if self.config.name.is_empty() {
                DEFAULT_SERVER_NAME.into()
            } else {
                self.config.name.as_bytes().into()
            }
        })
    }
}

// Pairs the concurrency increment with exactly one decrement on every exit
// path.
struct ConcurrencyGuard<'a>(&'a AtomicU32);

impl Drop for ConcurrencyGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An HTTP/1.x server over pooled workers and pooled request state.
///
/// Cheap to clone; clones share configuration, pools and limits.
///
/// # Examples
///
/// ```no_run
/// use brisk_web::{RequestCtx, Server, ServerConfig};
///
/// async fn hello(mut ctx: Box<RequestCtx>) -> Box<RequestCtx> {
///     ctx.response.set_body(b"Hello world!");
///     ctx
/// }
///
/// # #[tokio::main]
/// # async fn main() -> std::io::Result<()> {
/// Server::new(ServerConfig::default(), hello)
///     .listen_and_serve("127.0.0.1:8080")
///     .await
/// # }
/// ```
pub struct Server<H: Handler> {
    inner: Arc<ServerInner<H>>,
}

impl<H: Handler> Clone for Server<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<H: Handler> Server<H> {
    /// Creates a server from configuration and a handler.
    pub fn new(config: ServerConfig, handler: H) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                handler,
                concurrency: AtomicU32::new(0),
                per_ip: Arc::new(PerIpCounter::default()),
                server_name: OnceLock::new(),
                ctx_pool: Pool::new(),
                reader_pool: Pool::new(),
                writer_pool: Pool::new(),
            }),
        }
    }

    /// Binds a TCP listener on `addr` and serves until a permanent accept
    /// error.
    pub async fn listen_and_serve(&self, addr: impl ToSocketAddrs) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serves on a UNIX socket at `path`, replacing a stale socket file and
    /// applying `mode` to the fresh one.
    #[cfg(unix)]
    pub async fn listen_and_serve_unix(&self, path: impl AsRef<Path>, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let path = path.as_ref();
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }

        let listener = tokio::net::UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        self.serve(listener).await
    }

    /// Serves TLS connections on `addr` with the certificate chain and
    /// private key loaded from PEM files.
    pub async fn listen_and_serve_tls(
        &self,
        addr: impl ToSocketAddrs,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> io::Result<()> {
        let acceptor = build_tls_acceptor(cert_path.as_ref(), key_path.as_ref())?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(TlsListener::new(listener, acceptor)).await
    }

    /// Runs the accept loop over `listener` until it fails permanently.
    ///
    /// Overload is admission-controlled: when every worker is busy, new
    /// streams are dropped and the event is logged at most once per minute.
    /// Returns `Ok(())` on clean listener close.
    pub async fn serve<L: Listener>(&self, mut listener: L) -> io::Result<()> {
        let pool = {
            let inner = self.inner.clone();
            WorkerPool::start(
                move |conn: BoxConn| {
                    let inner = inner.clone();
                    async move { serve_connection(&inner, conn).await }
                },
                self.inner.config.concurrency_limit(),
            )
        };

        let mut last_overflow_log: Option<Instant> = None;
        let mut last_per_ip_log: Option<Instant> = None;

        let result = loop {
            let conn = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => match classify_accept_error(&err) {
                    AcceptErrorKind::Temporary => {
                        tracing::warn!(
                            target: "brisk_web",
                            error = %err,
                            "temporary error when accepting new connections",
                        );
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                        continue;
                    }
                    AcceptErrorKind::Closed => break Ok(()),
                    AcceptErrorKind::Fatal => {
                        tracing::error!(
                            target: "brisk_web",
                            error = %err,
                            "permanent error when accepting new connections",
                        );
                        break Err(err);
                    }
                },
            };

            let Some(conn) = self.register_per_ip(conn, &mut last_per_ip_log) else {
                continue;
            };

            if !pool.serve(conn) {
                // The stream is dropped, closing it: overload sheds load
                // instead of queueing it.
                if passes_rate_limit(&mut last_overflow_log) {
                    tracing::warn!(
                        target: "brisk_web",
                        concurrency = self.inner.config.concurrency_limit(),
                        "connection dropped: all workers are busy",
                    );
                }
            }
        };

        pool.stop();
        result
    }

    /// Serves a single connection, enforcing the per-IP and concurrency
    /// limits inline.
    ///
    /// Returns once every request on `conn` has been served; the stream is
    /// closed before returning unless it was hijacked.
    pub async fn serve_conn(&self, conn: impl Conn) -> Result<(), ServeError> {
        let mut conn: BoxConn = Box::new(conn);

        if self.inner.config.max_conns_per_ip > 0 {
            if let Some(ip) = conn_ip4(conn.as_ref()) {
                let count = self.inner.per_ip.register(ip);
                if count as usize > self.inner.config.max_conns_per_ip {
                    self.inner.per_ip.unregister(ip);
                    return Err(ServeError::PerIpConnLimit);
                }
                conn = Box::new(PerIpConn::new(conn, ip, self.inner.per_ip.clone()));
            }
        }

        let count = self.inner.concurrency.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ConcurrencyGuard(&self.inner.concurrency);
        if count as usize > self.inner.config.concurrency_limit() {
            return Err(ServeError::ConcurrencyLimit);
        }

        match serve_connection(&self.inner, conn).await {
            // The hijack task owns the stream now; that is success here.
            Err(ServeError::Hijacked) => Ok(()),
            other => other,
        }
    }

    fn register_per_ip(
        &self,
        conn: BoxConn,
        last_log: &mut Option<Instant>,
    ) -> Option<BoxConn> {
        if self.inner.config.max_conns_per_ip == 0 {
            return Some(conn);
        }
        let Some(ip) = conn_ip4(conn.as_ref()) else {
            return Some(conn);
        };

        let count = self.inner.per_ip.register(ip);
        if count as usize > self.inner.config.max_conns_per_ip {
            self.inner.per_ip.unregister(ip);
            if passes_rate_limit(last_log) {
                tracing::warn!(
                    target: "brisk_web",
                    %ip,
                    limit = self.inner.config.max_conns_per_ip,
                    "per-ip connection limit exceeded",
                );
            }
            return None;
        }

        Some(Box::new(PerIpConn::new(conn, ip, self.inner.per_ip.clone())))
    }

    #[cfg(test)]
    pub(crate) fn starve_pools(&self) {
        self.inner.ctx_pool.starve();
        self.inner.reader_pool.starve();
        self.inner.writer_pool.starve();
    }
}

#[inline]
fn passes_rate_limit(last: &mut Option<Instant>) -> bool {
    let now = Instant::now();
    match last {
        Some(at) if now.duration_since(*at) < OVERFLOW_LOG_INTERVAL => false,
        _ => {
            *last = Some(now);
            true
        }
    }
}

fn build_tls_acceptor(cert_path: &Path, key_path: &Path) -> io::Result<tokio_rustls::TlsAcceptor> {
    use rustls::pki_types::CertificateDer;

    let cert_file = std::fs::File::open(cert_path)?;
    let mut cert_reader = io::BufReader::new(cert_file);
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_reader).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "no certificates found in cert file",
        ));
    }

    let key_file = std::fs::File::open(key_path)?;
    let mut key_reader = io::BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)?.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "no private key found in key file")
    })?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

    Ok(tokio_rustls::TlsAcceptor::from(Arc::new(config)))
}

// Free-function mirrors for one-line embedding.

/// Serves a single connection with `handler` under default configuration.
pub async fn serve_conn<H: Handler>(handler: H, conn: impl Conn) -> Result<(), ServeError> {
    Server::new(ServerConfig::default(), handler)
        .serve_conn(conn)
        .await
}

/// Serves `listener` with `handler` under default configuration.
pub async fn serve<H: Handler, L: Listener>(handler: H, listener: L) -> io::Result<()> {
    Server::new(ServerConfig::default(), handler)
        .serve(listener)
        .await
}

/// Listens on the TCP `addr` and serves with default configuration.
pub async fn listen_and_serve<H: Handler>(addr: impl ToSocketAddrs, handler: H) -> io::Result<()> {
    Server::new(ServerConfig::default(), handler)
        .listen_and_serve(addr)
        .await
}

/// Listens on the UNIX socket `path` (mode applied) and serves with default
/// configuration.
#[cfg(unix)]
pub async fn listen_and_serve_unix<H: Handler>(
    path: impl AsRef<Path>,
    mode: u32,
    handler: H,
) -> io::Result<()> {
    Server::new(ServerConfig::default(), handler)
        .listen_and_serve_unix(path, mode)
        .await
}

/// Listens for TLS connections on `addr` and serves with default
/// configuration.
pub async fn listen_and_serve_tls<H: Handler>(
    addr: impl ToSocketAddrs,
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
    handler: H,
) -> io::Result<()> {
    Server::new(ServerConfig::default(), handler)
        .listen_and_serve_tls(addr, cert_path, key_path)
        .await
}
