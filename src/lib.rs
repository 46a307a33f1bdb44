//! brisk_web - high-throughput HTTP/1.x server core
//!
//! A performance-oriented HTTP/1.x server built around three pieces:
//!
//! - **Bounded worker dispatch** - accepted connections go to a pool of
//!   resident workers with per-worker mailboxes; overload drops new
//!   connections instead of queueing them.
//! - **A strict per-connection loop** - keep-alive pipelining with composed
//!   read/write deadlines, `Expect: 100-continue` handshaking, per-connection
//!   request caps, deferred flushing and connection hijacking for protocol
//!   upgrades.
//! - **Object and buffer pooling** - request contexts and read/write buffers
//!   are recycled through free-lists, so steady-state request processing
//!   stays off the allocator. Pool hits are an optimization, never a
//!   correctness requirement.
//!
//! Request routing, compression, file serving and HTTP/2+ are out of scope;
//! the crate hands every parsed request to one user handler.
//!
//! # Quick start
//!
//! ```no_run
//! use brisk_web::{RequestCtx, Server, ServerConfig};
//!
//! async fn handle(mut ctx: Box<RequestCtx>) -> Box<RequestCtx> {
//!     ctx.response.set_body(b"Hello world!");
//!     ctx
//! }
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     Server::new(ServerConfig::default(), handle)
//!         .listen_and_serve("127.0.0.1:8080")
//!         .await
//! }
//! ```
//!
//! The handler owns its [`RequestCtx`] for the duration of the call and
//! returns it. Handlers that outlive the request (response deadlines,
//! background work) use [`timeout_handler`] or [`RequestCtx::timeout_error`].
//! Protocol upgrades take the raw stream through [`RequestCtx::hijack`].

pub(crate) mod http {
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod bufio;
pub(crate) mod config;
pub(crate) mod conn;
pub(crate) mod ctx;
pub(crate) mod errors;
pub(crate) mod ip_count;
pub(crate) mod pool;
pub(crate) mod server;
pub(crate) mod stream;
pub(crate) mod timeout;
pub(crate) mod workers;

pub use crate::{
    config::{ServerConfig, DEFAULT_CONCURRENCY},
    ctx::RequestCtx,
    errors::{IoError, ParseError, ServeError},
    http::{
        request::Request,
        response::Response,
        types::{Method, StatusCode, Version},
    },
    server::{listen_and_serve, listen_and_serve_tls, serve, serve_conn, Handler, Server},
    stream::{BoxConn, Conn, HijackedConn, Listener, TlsListener},
    timeout::{timeout_handler, timeout_handler_with_code},
};

#[cfg(unix)]
pub use crate::server::listen_and_serve_unix;
