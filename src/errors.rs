//! Error types surfaced by connection serving.

use std::{error, fmt, io};

/// Error returned from [`Server::serve_conn`](crate::Server::serve_conn) and
/// the accept loop.
#[derive(Debug, PartialEq)]
pub enum ServeError {
    /// The number of live connections from the peer IP exceeds
    /// [`max_conns_per_ip`](crate::ServerConfig::max_conns_per_ip).
    PerIpConnLimit,

    /// The number of concurrently served connections exceeds
    /// [`concurrency`](crate::ServerConfig::concurrency).
    ConcurrencyLimit,

    /// The keep-alive connection outlived
    /// [`max_keepalive_duration`](crate::ServerConfig::max_keepalive_duration).
    KeepaliveTimeout,

    /// The request could not be parsed.
    Parse(ParseError),

    /// I/O failure on the underlying stream.
    Io(IoError),

    // Internal sentinel: the connection was handed to a hijack handler and
    // must not be closed by the caller. Never escapes the crate.
    #[doc(hidden)]
    Hijacked,
}

impl error::Error for ServeError {}

impl fmt::Display for ServeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PerIpConnLimit => f.write_str("too many connections per ip"),
            Self::ConcurrencyLimit => {
                f.write_str("cannot serve the connection: concurrency limit exceeded")
            }
            Self::KeepaliveTimeout => f.write_str("keep-alive connection lifetime exceeded"),
            Self::Parse(err) => write!(f, "cannot parse request: {err}"),
            Self::Io(err) => write!(f, "connection i/o error: {}", err.0),
            Self::Hijacked => f.write_str("connection has been hijacked"),
        }
    }
}

impl From<ParseError> for ServeError {
    fn from(err: ParseError) -> Self {
        ServeError::Parse(err)
    }
}

impl From<io::Error> for ServeError {
    fn from(err: io::Error) -> Self {
        ServeError::Io(IoError(err))
    }
}

/// Request parsing failure kinds reported by the HTTP front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Unknown or malformed method token.
    InvalidMethod,
    /// Missing or malformed request target.
    InvalidUri,
    /// Malformed request line version token.
    InvalidVersion,
    /// A version other than HTTP/1.0 or HTTP/1.1.
    UnsupportedVersion,
    /// Malformed header line.
    InvalidHeader,
    /// The header block does not fit into the read buffer.
    HeaderTooLarge,
    /// Non-numeric or overflowing `Content-Length` value.
    InvalidContentLength,
    /// Request body exceeds
    /// [`max_request_body_size`](crate::ServerConfig::max_request_body_size).
    BodyTooLarge,
    /// A non-GET request arrived while
    /// [`get_only`](crate::ServerConfig::get_only) is set.
    NonGetRequest,
    /// `Transfer-Encoding` framing is not supported by this core.
    UnsupportedTransferEncoding,
}

impl error::Error for ParseError {}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::InvalidMethod => "invalid method",
            Self::InvalidUri => "invalid request target",
            Self::InvalidVersion => "invalid protocol version",
            Self::UnsupportedVersion => "unsupported protocol version",
            Self::InvalidHeader => "invalid header line",
            Self::HeaderTooLarge => "header block exceeds read buffer",
            Self::InvalidContentLength => "invalid content-length",
            Self::BodyTooLarge => "request body too large",
            Self::NonGetRequest => "non-GET request rejected",
            Self::UnsupportedTransferEncoding => "unsupported transfer-encoding",
        };
        f.write_str(msg)
    }
}

/// [`io::Error`] wrapper comparing by [`io::ErrorKind`], so serve results
/// stay usable in table-driven assertions.
#[derive(Debug)]
pub struct IoError(pub(crate) io::Error);

impl IoError {
    /// The wrapped error.
    #[inline(always)]
    pub fn get(&self) -> &io::Error {
        &self.0
    }
}

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

// Outcome of one request-read attempt; `Eof` is a clean peer shutdown on an
// idle connection and never surfaces as an error.
#[derive(Debug)]
pub(crate) enum ReadError {
    Eof,
    Io(io::Error),
    Parse(ParseError),
}

impl From<io::Error> for ReadError {
    fn from(err: io::Error) -> Self {
        ReadError::Io(err)
    }
}

impl From<ParseError> for ReadError {
    fn from(err: ParseError) -> Self {
        ReadError::Parse(err)
    }
}

#[cfg(test)]
mod errors_tests {
    use super::*;

    #[test]
    fn io_error_eq_by_kind() {
        let a = IoError(io::Error::new(io::ErrorKind::TimedOut, "read timeout"));
        let b = IoError(io::Error::new(io::ErrorKind::TimedOut, "other message"));
        let c = IoError(io::Error::new(io::ErrorKind::BrokenPipe, "read timeout"));

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn display_is_stable() {
        assert_eq!(
            ServeError::PerIpConnLimit.to_string(),
            "too many connections per ip"
        );
        assert_eq!(
            ServeError::KeepaliveTimeout.to_string(),
            "keep-alive connection lifetime exceeded"
        );
        assert_eq!(
            ServeError::Parse(ParseError::BodyTooLarge).to_string(),
            "cannot parse request: request body too large"
        );
    }
}
