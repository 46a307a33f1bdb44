//! Incoming request representation and the HTTP/1.x front end.
//!
//! The parser frames messages by `Content-Length` only; chunked uploads are
//! rejected. Header names are lowercased in place, values kept verbatim.
//! All storage is owned by the [`Request`] and reused across requests on the
//! same connection.

use std::{io, time::Instant};

use memchr::{memchr, memmem};
use tokio::io::AsyncRead;

use crate::{
    bufio::ConnReader,
    errors::{ParseError, ReadError},
    http::types::{self, Method, Version},
};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Span {
    start: usize,
    end: usize,
}

impl Span {
    #[inline(always)]
    fn slice<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.start..self.end]
    }
}

/// A parsed HTTP request.
///
/// Borrowed slices are valid until the handler returns; the storage is
/// recycled for the next request on the connection.
#[derive(Debug)]
pub struct Request {
    method: Method,
    uri: Vec<u8>,
    version: Version,

    // Lowercased names and raw values packed back to back; `headers` spans
    // index into it.
    head: Vec<u8>,
    headers: Vec<(Span, Span)>,

    content_length: Option<usize>,
    connection_close: bool,
    expect_continue: bool,

    body: Vec<u8>,
}

impl Request {
    #[inline(always)]
    pub(crate) fn new() -> Self {
        Self {
            method: Method::Get,
            uri: Vec::new(),
            version: Version::Http11,
            head: Vec::new(),
            headers: Vec::new(),
            content_length: None,
            connection_close: false,
            expect_continue: false,
            body: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.method = Method::Get;
        self.uri.clear();
        self.version = Version::Http11;
        self.head.clear();
        self.headers.clear();
        self.content_length = None;
        self.connection_close = false;
        self.expect_continue = false;
        self.body.clear();
    }
}

// Public API
impl Request {
    #[inline(always)]
    pub fn method(&self) -> Method {
        self.method
    }

    /// Raw request target from the request line, e.g. `/api/users?id=3`.
    #[inline(always)]
    pub fn target(&self) -> &[u8] {
        &self.uri
    }

    #[inline(always)]
    pub fn version(&self) -> Version {
        self.version
    }

    /// First header value under the given case-insensitive name.
    #[inline]
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.slice(&self.head).eq_ignore_ascii_case(name))
            .map(|(_, v)| v.slice(&self.head))
    }

    /// All headers in arrival order, names lowercased.
    #[inline]
    pub fn headers(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.headers
            .iter()
            .map(|(n, v)| (n.slice(&self.head), v.slice(&self.head)))
    }

    /// Value of the `Content-Length` header, if present.
    #[inline(always)]
    pub fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    /// Request body; empty when none was sent.
    #[inline(always)]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// True when the request asks for the connection to be closed after the
    /// response (explicit `Connection: close`, or HTTP/1.0 without
    /// `Connection: keep-alive`).
    #[inline(always)]
    pub fn connection_close(&self) -> bool {
        self.connection_close
    }

    /// True when the client declared `Expect: 100-continue`.
    #[inline(always)]
    pub fn may_continue(&self) -> bool {
        self.expect_continue
    }

    /// True for methods that carry no body by convention.
    #[inline(always)]
    pub fn no_body(&self) -> bool {
        matches!(self.method, Method::Get | Method::Head)
    }
}

// Reading
impl Request {
    /// Reads and parses one request from `r`, filling from `conn` under the
    /// given deadline.
    ///
    /// The body stays unread when the client declared `Expect: 100-continue`;
    /// the caller acknowledges and then calls [`continue_read_body`].
    ///
    /// [`continue_read_body`]: Request::continue_read_body
    pub(crate) async fn read_limited<C>(
        &mut self,
        r: &mut ConnReader,
        conn: &mut C,
        deadline: Option<Instant>,
        max_body_size: usize,
        get_only: bool,
    ) -> Result<(), ReadError>
    where
        C: AsyncRead + Unpin + ?Sized,
    {
        self.reset();

        let head_len = loop {
            if let Some(at) = memmem::find(r.slice(), b"\r\n\r\n") {
                break at + 4;
            }
            if r.is_full() {
                return Err(ParseError::HeaderTooLarge.into());
            }

            let had = r.buffered();
            if r.fill(conn, deadline).await? == 0 {
                if had == 0 {
                    return Err(ReadError::Eof);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside request headers",
                )
                .into());
            }
        };

        self.parse_head(&r.slice()[..head_len], get_only)?;
        r.consume(head_len);

        if let Some(length) = self.content_length {
            if max_body_size > 0 && length > max_body_size {
                return Err(ParseError::BodyTooLarge.into());
            }
            if self.expect_continue {
                return Ok(());
            }
            self.read_body(r, conn, deadline, length).await?;
        }

        Ok(())
    }

    /// Reads the deferred body after a `100 Continue` acknowledgement.
    pub(crate) async fn continue_read_body<C>(
        &mut self,
        r: &mut ConnReader,
        conn: &mut C,
        deadline: Option<Instant>,
        max_body_size: usize,
    ) -> Result<(), ReadError>
    where
        C: AsyncRead + Unpin + ?Sized,
    {
        let Some(length) = self.content_length else {
            return Ok(());
        };
        if max_body_size > 0 && length > max_body_size {
            return Err(ParseError::BodyTooLarge.into());
        }
        self.read_body(r, conn, deadline, length).await
    }

    async fn read_body<C>(
        &mut self,
        r: &mut ConnReader,
        conn: &mut C,
        deadline: Option<Instant>,
        length: usize,
    ) -> Result<(), ReadError>
    where
        C: AsyncRead + Unpin + ?Sized,
    {
        self.body.clear();
        self.body.reserve(length);

        loop {
            let take = std::cmp::min(length - self.body.len(), r.buffered());
            self.body.extend_from_slice(&r.slice()[..take]);
            r.consume(take);

            if self.body.len() == length {
                return Ok(());
            }
            if r.fill(conn, deadline).await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside request body",
                )
                .into());
            }
        }
    }
}

// Parsing
impl Request {
    fn parse_head(&mut self, head: &[u8], get_only: bool) -> Result<(), ParseError> {
        let line_end = memchr(b'\n', head).ok_or(ParseError::InvalidHeader)?;
        if line_end < 1 || head[line_end - 1] != b'\r' {
            return Err(ParseError::InvalidUri);
        }
        let line = &head[..line_end - 1];

        let (method, method_len) = Method::from_bytes(line)?;
        self.method = method;
        if get_only && method != Method::Get {
            return Err(ParseError::NonGetRequest);
        }

        let rest = &line[method_len..];
        let space = memchr(b' ', rest).ok_or(ParseError::InvalidUri)?;
        let target = &rest[..space];
        if target.is_empty() || target[0] != b'/' {
            return Err(ParseError::InvalidUri);
        }

        let version_bytes = &rest[space + 1..];
        if version_bytes.len() != 8 {
            return Err(ParseError::InvalidVersion);
        }
        self.version = Version::from_bytes(version_bytes)?;
        self.uri.extend_from_slice(target);

        // HTTP/1.0 closes by default; headers below may override either way.
        self.connection_close = !self.version.is_http11();

        self.parse_headers(&head[line_end + 1..])
    }

    fn parse_headers(&mut self, mut block: &[u8]) -> Result<(), ParseError> {
        loop {
            let line_end = memchr(b'\n', block).ok_or(ParseError::InvalidHeader)?;
            if line_end < 1 || block[line_end - 1] != b'\r' {
                return Err(ParseError::InvalidHeader);
            }
            let line = &block[..line_end - 1];
            block = &block[line_end + 1..];

            if line.is_empty() {
                return Ok(());
            }

            let colon = memchr(b':', line).ok_or(ParseError::InvalidHeader)?;
            if colon == 0 {
                return Err(ParseError::InvalidHeader);
            }

            let mut value = &line[colon + 1..];
            while let [b' ' | b'\t', rest @ ..] = value {
                value = rest;
            }

            let name_span = Span {
                start: self.head.len(),
                end: self.head.len() + colon,
            };
            self.head.extend_from_slice(&line[..colon]);
            types::to_lower_case(&mut self.head[name_span.start..name_span.end]);

            let value_span = Span {
                start: self.head.len(),
                end: self.head.len() + value.len(),
            };
            self.head.extend_from_slice(value);

            self.parse_special_header(name_span, value_span)?;
            self.headers.push((name_span, value_span));
        }
    }

    fn parse_special_header(&mut self, name: Span, value: Span) -> Result<(), ParseError> {
        let value_bytes = value.slice(&self.head);

        match name.slice(&self.head) {
            b"content-length" => {
                self.content_length = Some(
                    types::slice_to_usize(value_bytes).ok_or(ParseError::InvalidContentLength)?,
                );
            }
            b"transfer-encoding" => {
                if !value_bytes.eq_ignore_ascii_case(b"identity") {
                    return Err(ParseError::UnsupportedTransferEncoding);
                }
            }
            b"connection" => {
                // Unknown tokens such as `Upgrade` keep the default.
                if value_bytes.eq_ignore_ascii_case(b"close") {
                    self.connection_close = true;
                } else if value_bytes.eq_ignore_ascii_case(b"keep-alive") {
                    self.connection_close = false;
                }
            }
            b"expect" => {
                self.expect_continue = value_bytes.eq_ignore_ascii_case(b"100-continue");
            }
            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod read_tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    // Parses `input` as a single request through a small reader, returning
    // the request and the bytes left buffered (pipelined leftover).
    async fn parse(input: &str) -> Result<(Request, Vec<u8>), ReadError> {
        parse_with(input, 4096, 0, false).await
    }

    async fn parse_with(
        input: &str,
        reader_size: usize,
        max_body: usize,
        get_only: bool,
    ) -> Result<(Request, Vec<u8>), ReadError> {
        let (mut client, mut server) = tokio::io::duplex(reader_size.max(input.len()) + 1);
        client.write_all(input.as_bytes()).await.unwrap();
        drop(client);

        let mut reader = ConnReader::new(reader_size);
        let mut request = Request::new();
        request
            .read_limited(&mut reader, &mut server, None, max_body, get_only)
            .await?;
        Ok((request, reader.slice().to_vec()))
    }

    fn parse_err(result: Result<(Request, Vec<u8>), ReadError>) -> ParseError {
        match result {
            Err(ReadError::Parse(err)) => err,
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn parse_simple_get() {
        let (req, rest) = parse("GET /api/users HTTP/1.1\r\nHost: h\r\n\r\n")
            .await
            .unwrap();

        assert_eq!(req.method(), Method::Get);
        assert_eq!(req.target(), b"/api/users");
        assert_eq!(req.version(), Version::Http11);
        assert_eq!(req.header(b"host"), Some(b"h" as &[u8]));
        assert_eq!(req.header(b"HOST"), Some(b"h" as &[u8]));
        assert_eq!(req.content_length(), None);
        assert!(req.body().is_empty());
        assert!(!req.connection_close());
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn parse_post_with_body() {
        let (req, rest) = parse("POST /u HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();

        assert_eq!(req.method(), Method::Post);
        assert_eq!(req.content_length(), Some(5));
        assert_eq!(req.body(), b"hello");
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn pipelined_bytes_stay_buffered() {
        let (req, rest) = parse("GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\n")
            .await
            .unwrap();

        assert_eq!(req.target(), b"/a");
        assert_eq!(rest, b"GET /b HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn connection_semantics() {
        #[rustfmt::skip]
        let cases = [
            ("GET / HTTP/1.1\r\n\r\n",                              false),
            ("GET / HTTP/1.1\r\nConnection: close\r\n\r\n",         true),
            ("GET / HTTP/1.1\r\nConnection: CLOSE\r\n\r\n",         true),
            ("GET / HTTP/1.1\r\nConnection: Upgrade\r\n\r\n",       false),
            ("GET / HTTP/1.0\r\n\r\n",                              true),
            ("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n",    false),
        ];

        for (input, close) in cases {
            let (req, _) = parse(input).await.unwrap();
            assert_eq!(req.connection_close(), close, "case: {input:?}");
        }
    }

    #[tokio::test]
    async fn expect_continue_defers_body() {
        let (req, rest) = parse("POST / HTTP/1.1\r\nContent-Length: 5\r\nExpect: 100-continue\r\n\r\n")
            .await
            .unwrap();

        assert!(req.may_continue());
        assert!(!req.no_body());
        assert_eq!(req.content_length(), Some(5));
        assert!(req.body().is_empty());
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn continue_read_body_reads_deferred_body() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 5\r\nExpect: 100-continue\r\n\r\n")
            .await
            .unwrap();

        let mut reader = ConnReader::new(256);
        let mut req = Request::new();
        req.read_limited(&mut reader, &mut server, None, 0, false)
            .await
            .unwrap();
        assert!(req.body().is_empty());

        client.write_all(b"hello").await.unwrap();
        req.continue_read_body(&mut reader, &mut server, None, 0)
            .await
            .unwrap();
        assert_eq!(req.body(), b"hello");
    }

    #[tokio::test]
    async fn clean_eof_on_idle_connection() {
        match parse("").await {
            Err(ReadError::Eof) => {}
            other => panic!("expected clean eof, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_inside_request_is_an_error() {
        match parse("GET / HTTP/1.1\r\nHost:").await {
            Err(ReadError::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected io error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_inside_body_is_an_error() {
        match parse("POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nshort").await {
            Err(ReadError::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected io error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_requests() {
        #[rustfmt::skip]
        let cases = [
            ("PYU / HTTP/1.1\r\n\r\n",                       ParseError::InvalidMethod),
            ("GET  HTTP/1.1\r\n\r\n",                        ParseError::InvalidUri),
            ("GET nopath HTTP/1.1\r\n\r\n",                  ParseError::InvalidUri),
            ("GET / HTTP/2.0\r\n\r\n",                       ParseError::UnsupportedVersion),
            ("GET / HTTP/1.15\r\n\r\n",                      ParseError::InvalidVersion),
            ("GET / HTTP/1.1\r\nNoColon\r\n\r\n",            ParseError::InvalidHeader),
            ("GET / HTTP/1.1\r\n: novalue\r\n\r\n",          ParseError::InvalidHeader),
            ("GET / HTTP/1.1\r\nContent-Length: x\r\n\r\n",  ParseError::InvalidContentLength),
            (
                "POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
                ParseError::UnsupportedTransferEncoding,
            ),
        ];

        for (input, expected) in cases {
            let got = parse_err(parse(input).await);
            assert_eq!(got, expected, "case: {input:?}");
        }
    }

    #[tokio::test]
    async fn body_too_large_is_rejected_without_reading() {
        let result = parse_with(
            "POST / HTTP/1.1\r\nContent-Length: 100\r\n\r\n",
            4096,
            10,
            false,
        )
        .await;
        assert_eq!(parse_err(result), ParseError::BodyTooLarge);
    }

    #[tokio::test]
    async fn get_only_rejects_other_methods() {
        let result = parse_with("POST / HTTP/1.1\r\n\r\n", 4096, 0, true).await;
        assert_eq!(parse_err(result), ParseError::NonGetRequest);

        let (req, _) = parse_with("GET / HTTP/1.1\r\n\r\n", 4096, 0, true)
            .await
            .unwrap();
        assert_eq!(req.method(), Method::Get);
    }

    #[tokio::test]
    async fn oversized_header_block_is_rejected() {
        let input = format!("GET / HTTP/1.1\r\nBig: {}\r\n\r\n", "x".repeat(256));
        let result = parse_with(&input, 64, 0, false).await;
        assert_eq!(parse_err(result), ParseError::HeaderTooLarge);
    }

    #[tokio::test]
    async fn body_larger_than_reader_buffer() {
        let body = "b".repeat(300);
        let input = format!("POST / HTTP/1.1\r\nContent-Length: 300\r\n\r\n{body}");
        let (req, rest) = parse_with(&input, 64, 0, false).await.unwrap();

        assert_eq!(req.body().len(), 300);
        assert_eq!(req.body(), body.as_bytes());
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn reset_clears_previous_request() {
        let (mut client, mut server) = tokio::io::duplex(512);
        client
            .write_all(
                b"POST /a HTTP/1.0\r\nContent-Length: 2\r\nX-One: 1\r\n\r\nab\
                  GET /b HTTP/1.1\r\n\r\n",
            )
            .await
            .unwrap();

        let mut reader = ConnReader::new(512);
        let mut req = Request::new();

        req.read_limited(&mut reader, &mut server, None, 0, false)
            .await
            .unwrap();
        assert_eq!(req.target(), b"/a");
        assert!(req.connection_close());

        req.read_limited(&mut reader, &mut server, None, 0, false)
            .await
            .unwrap();
        assert_eq!(req.target(), b"/b");
        assert_eq!(req.method(), Method::Get);
        assert_eq!(req.header(b"x-one"), None);
        assert_eq!(req.content_length(), None);
        assert!(req.body().is_empty());
        assert!(!req.connection_close());
    }
}
