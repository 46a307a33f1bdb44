//! Per-request scratch state handed to handlers.

use std::{
    any::Any,
    future::Future,
    net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4},
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use crate::{
    http::{
        request::Request,
        response::Response,
        types::StatusCode,
    },
    stream::HijackedConn,
};

// Upper 32 bits of every ctx id; one serial per ctx instance, process-wide.
static NEXT_CTX_SERIAL: AtomicU64 = AtomicU64::new(0);

const ZERO_ADDR: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

pub(crate) type HijackFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub(crate) type HijackFn = Box<dyn FnOnce(HijackedConn) -> HijackFuture + Send>;

/// Incoming request plus outgoing response, with timing, user values and the
/// hijack/timeout escape hatches.
///
/// The ctx is a linear resource: the handler receives ownership and returns
/// it. Everything borrowed from it is recycled after the handler returns;
/// a handler that hands the ctx to concurrent work it does not await must
/// mark it escaped with one of the [`timeout_error`](Self::timeout_error)
/// calls before returning a replacement.
pub struct RequestCtx {
    /// Incoming request.
    pub request: Request,
    /// Outgoing response.
    pub response: Response,

    user_values: Vec<(Box<[u8]>, Box<dyn Any + Send + Sync>)>,

    pub(crate) id: u64,
    pub(crate) conn_request_num: u64,
    pub(crate) conn_time: Instant,
    pub(crate) time: Instant,
    pub(crate) last_read_duration: Duration,

    pub(crate) remote_addr: Option<SocketAddr>,
    pub(crate) local_addr: Option<SocketAddr>,

    pub(crate) timeout_response: Option<Response>,
    pub(crate) hijack_handler: Option<HijackFn>,
}

// Connection-scoped scalars carried over when a detached ctx is replaced.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CtxSnapshot {
    pub(crate) conn_request_num: u64,
    pub(crate) conn_time: Instant,
    pub(crate) time: Instant,
    pub(crate) remote_addr: Option<SocketAddr>,
    pub(crate) local_addr: Option<SocketAddr>,
}

impl RequestCtx {
    pub(crate) fn new() -> Box<Self> {
        let now = Instant::now();
        let serial = NEXT_CTX_SERIAL.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

        Box::new(Self {
            request: Request::new(),
            response: Response::new(),
            user_values: Vec::new(),
            id: serial << 32,
            conn_request_num: 0,
            conn_time: now,
            time: now,
            last_read_duration: Duration::ZERO,
            remote_addr: None,
            local_addr: None,
            timeout_response: None,
            hijack_handler: None,
        })
    }

    /// Standalone construction for unit tests and custom server embeddings.
    ///
    /// No stream is attached; the address helpers return `0.0.0.0:0` unless
    /// `remote_addr` is given.
    pub fn init(remote_addr: Option<SocketAddr>) -> Box<Self> {
        let mut ctx = Self::new();
        ctx.remote_addr = remote_addr;
        ctx.conn_request_num = 1;
        ctx
    }

    #[inline(always)]
    pub(crate) fn snapshot(&self) -> CtxSnapshot {
        CtxSnapshot {
            conn_request_num: self.conn_request_num,
            conn_time: self.conn_time,
            time: self.time,
            remote_addr: self.remote_addr,
            local_addr: self.local_addr,
        }
    }

    #[inline]
    pub(crate) fn apply_snapshot(&mut self, snap: CtxSnapshot) {
        self.conn_request_num = snap.conn_request_num;
        self.conn_time = snap.conn_time;
        self.time = snap.time;
        self.remote_addr = snap.remote_addr;
        self.local_addr = snap.local_addr;
    }

    #[inline(always)]
    pub(crate) fn clear_user_values(&mut self) {
        self.user_values.clear();
    }
}

// Identity and timing
impl RequestCtx {
    /// Process-unique request id: ctx serial in the upper 32 bits, request
    /// counter in the lower 32.
    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Handler invocation time of the current request.
    #[inline(always)]
    pub fn time(&self) -> Instant {
        self.time
    }

    /// Time the server started serving this connection.
    #[inline(always)]
    pub fn conn_time(&self) -> Instant {
        self.conn_time
    }

    /// Sequence number of the current request on its connection, starting
    /// at 1.
    #[inline(always)]
    pub fn conn_request_num(&self) -> u64 {
        self.conn_request_num
    }
}

// Addressing
impl RequestCtx {
    /// Peer address; `0.0.0.0:0` when the transport has none.
    #[inline(always)]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr.unwrap_or(ZERO_ADDR)
    }

    /// Local address; `0.0.0.0:0` when the transport has none.
    #[inline(always)]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr.unwrap_or(ZERO_ADDR)
    }

    /// Peer IP; `0.0.0.0` when the transport has none.
    #[inline(always)]
    pub fn remote_ip(&self) -> IpAddr {
        self.remote_addr().ip()
    }
}

// User values
impl RequestCtx {
    /// Stores an arbitrary value under `key`, replacing any previous one.
    ///
    /// All values are dropped after the handler returns.
    #[inline]
    pub fn set_user_value<V: Any + Send + Sync>(&mut self, key: &str, value: V) {
        self.set_user_value_bytes(key.as_bytes(), value);
    }

    /// Byte-keyed variant of [`set_user_value`](Self::set_user_value).
    pub fn set_user_value_bytes<V: Any + Send + Sync>(&mut self, key: &[u8], value: V) {
        for (existing, slot) in self.user_values.iter_mut() {
            if existing.as_ref() == key {
                *slot = Box::new(value);
                return;
            }
        }
        self.user_values.push((key.into(), Box::new(value)));
    }

    /// Returns the value stored under `key`, downcast to `T`.
    #[inline]
    pub fn user_value<T: Any>(&self, key: &str) -> Option<&T> {
        self.user_value_bytes(key.as_bytes())
    }

    /// Byte-keyed variant of [`user_value`](Self::user_value).
    pub fn user_value_bytes<T: Any>(&self, key: &[u8]) -> Option<&T> {
        self.user_values
            .iter()
            .find(|(k, _)| k.as_ref() == key)
            .and_then(|(_, v)| v.downcast_ref())
    }
}

// Response shorthands
impl RequestCtx {
    /// Closes the connection after the current response.
    #[inline(always)]
    pub fn set_connection_close(&mut self) {
        self.response.set_connection_close();
    }

    /// Resets the response to a plain-text error with the given status.
    #[inline]
    pub fn error(&mut self, msg: &str, status: StatusCode) {
        self.response.reset();
        self.response.set_status(status).set_body(msg.as_bytes());
    }

    /// Sets content type and body in one call.
    #[inline]
    pub fn success(&mut self, content_type: &str, body: &[u8]) {
        self.response.set_content_type(content_type).set_body(body);
    }
}

// Timeout detachment
impl RequestCtx {
    /// Marks the ctx as escaped and queues a `408 Request Timeout` response
    /// with the given body.
    ///
    /// Must be called before returning when references to the ctx remain in
    /// concurrent work. All response modifications after this call are
    /// ignored.
    #[inline]
    pub fn timeout_error(&mut self, msg: &str) {
        self.timeout_error_with_code(msg, StatusCode::RequestTimeout);
    }

    /// [`timeout_error`](Self::timeout_error) with an explicit status code.
    pub fn timeout_error_with_code(&mut self, msg: &str, status: StatusCode) {
        let mut resp = Response::new();
        resp.set_status(status).set_body(msg.as_bytes());
        self.timeout_error_with_response(&resp);
    }

    /// Marks the ctx as escaped; `resp` is sent to the client instead of
    /// [`response`](Self::response).
    pub fn timeout_error_with_response(&mut self, resp: &Response) {
        let mut copy = Response::new();
        resp.copy_to(&mut copy);
        self.timeout_response = Some(copy);
    }

    /// The response set by the last `timeout_error*` call, if any.
    ///
    /// Intended for custom server implementations.
    #[inline(always)]
    pub fn last_timeout_response(&self) -> Option<&Response> {
        self.timeout_response.as_ref()
    }
}

// Hijacking
impl RequestCtx {
    /// Registers `f` to take over the connection once the current response
    /// has been sent.
    ///
    /// The handler runs detached; the stream (with any bytes the server had
    /// buffered past the request) is closed when it returns. Server limits
    /// and timeouts no longer apply. Registration is skipped when either
    /// side requested `Connection: close` or the response write fails.
    pub fn hijack<F, Fut>(&mut self, f: F)
    where
        F: FnOnce(HijackedConn) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hijack_handler = Some(Box::new(move |conn| Box::pin(f(conn))));
    }
}

// Logging
impl RequestCtx {
    /// Logs a request-scoped message with id, peers, method and target
    /// attached.
    pub fn log(&self, msg: &str) {
        tracing::info!(
            target: "brisk_web",
            id = %format_args!("{:016x}", self.id),
            elapsed_ms = self.time.elapsed().as_millis() as u64,
            local = %self.local_addr(),
            remote = %self.remote_addr(),
            method = ?self.request.method(),
            path = %String::from_utf8_lossy(self.request.target()),
            "{msg}",
        );
    }
}
