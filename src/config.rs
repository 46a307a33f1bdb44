//! Server tuning knobs.
//!
//! All values are fixed once serving starts. Defaults follow the
//! unlimited-unless-asked philosophy: only the concurrency ceiling and the
//! per-connection buffer sizes have built-in bounds, everything else is
//! opt-in.
//!
//! # Examples
//!
//! ```no_run
//! use brisk_web::{Server, ServerConfig, RequestCtx};
//! use std::time::Duration;
//!
//! # async fn handle(ctx: Box<RequestCtx>) -> Box<RequestCtx> { ctx }
//! # #[tokio::main]
//! # async fn main() -> std::io::Result<()> {
//! let server = Server::new(
//!     ServerConfig {
//!         name: "api-front".into(),
//!         read_timeout: Some(Duration::from_secs(5)),
//!         max_requests_per_conn: 10_000,
//!         max_request_body_size: 4 * 1024 * 1024,
//!         ..ServerConfig::default()
//!     },
//!     handle,
//! );
//! server.listen_and_serve("127.0.0.1:8080").await
//! # }
//! ```

use std::time::Duration;

/// Default ceiling for concurrently served connections.
pub const DEFAULT_CONCURRENCY: usize = 256 * 1024;

pub(crate) const DEFAULT_READ_BUFFER_SIZE: usize = 4096;
pub(crate) const DEFAULT_WRITE_BUFFER_SIZE: usize = 4096;

/// Server configuration, immutable after serving starts.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server name sent in the `Server` response header when the handler
    /// leaves it empty. A built-in default is used if blank.
    pub name: String,

    /// Maximum number of concurrently served connections
    /// (default: [`DEFAULT_CONCURRENCY`]).
    ///
    /// Accepted connections beyond this are dropped by the dispatcher
    /// ([`Server::serve`](crate::Server::serve)) or rejected with
    /// [`ServeError::ConcurrencyLimit`](crate::ServeError::ConcurrencyLimit)
    /// ([`Server::serve_conn`](crate::Server::serve_conn)).
    pub concurrency: usize,

    /// Per-connection read buffer size in bytes (default: `4096`).
    ///
    /// This also bounds the maximum request header block.
    pub read_buffer_size: usize,

    /// Per-connection write buffer size in bytes (default: `4096`).
    pub write_buffer_size: usize,

    /// Maximum duration for reading a full request, including the body
    /// (default: unlimited).
    pub read_timeout: Option<Duration>,

    /// Maximum duration for writing a full response (default: unlimited).
    pub write_timeout: Option<Duration>,

    /// Maximum number of concurrent connections accepted from a single
    /// IPv4 address (default: `0`, unlimited).
    ///
    /// Peers without an IPv4 address bypass the limit.
    pub max_conns_per_ip: usize,

    /// Maximum number of requests served per connection (default: `0`,
    /// unlimited).
    ///
    /// The last allowed response carries `Connection: close`.
    pub max_requests_per_conn: usize,

    /// Maximum keep-alive connection lifetime (default: unlimited).
    ///
    /// The lifetime caps every per-request read and write deadline; once it
    /// is spent the connection is closed with
    /// [`ServeError::KeepaliveTimeout`](crate::ServeError::KeepaliveTimeout).
    pub max_keepalive_duration: Option<Duration>,

    /// Maximum request body size in bytes (default: `0`, unlimited).
    pub max_request_body_size: usize,

    /// Trades CPU for memory on mostly-idle keep-alive workloads
    /// (default: `false`).
    ///
    /// While enabled, a connection waiting for its next request holds a
    /// single-byte probe instead of a request context and a read buffer.
    pub reduce_memory_usage: bool,

    /// Rejects every non-GET request at parse time (default: `false`).
    pub get_only: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            concurrency: DEFAULT_CONCURRENCY,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            read_timeout: None,
            write_timeout: None,
            max_conns_per_ip: 0,
            max_requests_per_conn: 0,
            max_keepalive_duration: None,
            max_request_body_size: 0,
            reduce_memory_usage: false,
            get_only: false,
        }
    }
}

impl ServerConfig {
    #[inline(always)]
    pub(crate) fn concurrency_limit(&self) -> usize {
        if self.concurrency == 0 {
            DEFAULT_CONCURRENCY
        } else {
            self.concurrency
        }
    }

    #[inline(always)]
    pub(crate) fn read_buffer(&self) -> usize {
        if self.read_buffer_size == 0 {
            DEFAULT_READ_BUFFER_SIZE
        } else {
            self.read_buffer_size
        }
    }

    #[inline(always)]
    pub(crate) fn write_buffer(&self) -> usize {
        if self.write_buffer_size == 0 {
            DEFAULT_WRITE_BUFFER_SIZE
        } else {
            self.write_buffer_size
        }
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn zero_values_fall_back() {
        let config = ServerConfig {
            concurrency: 0,
            read_buffer_size: 0,
            write_buffer_size: 0,
            ..ServerConfig::default()
        };

        assert_eq!(config.concurrency_limit(), DEFAULT_CONCURRENCY);
        assert_eq!(config.read_buffer(), DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(config.write_buffer(), DEFAULT_WRITE_BUFFER_SIZE);
    }

    #[test]
    fn defaults_are_unlimited() {
        let config = ServerConfig::default();

        assert_eq!(config.read_timeout, None);
        assert_eq!(config.write_timeout, None);
        assert_eq!(config.max_conns_per_ip, 0);
        assert_eq!(config.max_requests_per_conn, 0);
        assert_eq!(config.max_keepalive_duration, None);
        assert_eq!(config.max_request_body_size, 0);
        assert!(!config.reduce_memory_usage);
        assert!(!config.get_only);
    }
}
