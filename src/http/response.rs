//! Outgoing response representation and serialization.

use crate::{
    bufio::ConnWriter,
    http::types::{StatusCode, Version},
};

const DEFAULT_CONTENT_TYPE: &[u8] = b"text/plain; charset=utf-8";

// Emitted `Connection` header; decided by the connection loop, not the
// handler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ConnHeader {
    None,
    Close,
    KeepAlive,
}

/// The response a handler populates.
///
/// Serialization order and the `Connection`/`Server` headers are owned by the
/// server; handlers only provide status, headers and body.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    pub(crate) version: Version,
    server: Vec<u8>,
    content_type: Vec<u8>,
    // Extra header lines, stored pre-rendered as `name: value\r\n`.
    headers: Vec<u8>,
    pub(crate) connection: ConnHeader,
    body: Vec<u8>,
}

impl Response {
    #[inline(always)]
    pub(crate) fn new() -> Self {
        Self {
            status: StatusCode::Ok,
            version: Version::Http11,
            server: Vec::new(),
            content_type: Vec::new(),
            headers: Vec::new(),
            connection: ConnHeader::None,
            body: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.status = StatusCode::Ok;
        self.version = Version::Http11;
        self.server.clear();
        self.content_type.clear();
        self.headers.clear();
        self.connection = ConnHeader::None;
        self.body.clear();
    }

    #[inline]
    pub(crate) fn copy_to(&self, target: &mut Response) {
        target.reset();
        target.status = self.status;
        target.version = self.version;
        target.server.extend_from_slice(&self.server);
        target.content_type.extend_from_slice(&self.content_type);
        target.headers.extend_from_slice(&self.headers);
        target.connection = self.connection;
        target.body.extend_from_slice(&self.body);
    }
}

// Public API
impl Response {
    #[inline(always)]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[inline(always)]
    pub fn set_status(&mut self, status: StatusCode) -> &mut Self {
        self.status = status;
        self
    }

    /// Overrides the `Server` header for this response.
    #[inline]
    pub fn set_server(&mut self, name: &str) -> &mut Self {
        self.server.clear();
        self.server.extend_from_slice(name.as_bytes());
        self
    }

    /// Sets the `Content-Type`. A non-empty body without one is sent as
    /// `text/plain; charset=utf-8`.
    #[inline]
    pub fn set_content_type(&mut self, value: &str) -> &mut Self {
        self.content_type.clear();
        self.content_type.extend_from_slice(value.as_bytes());
        self
    }

    /// Appends an extra response header.
    ///
    /// `Content-Length`, `Connection` and `Server` are managed by the server;
    /// do not add them here.
    #[inline]
    pub fn header(&mut self, name: &str, value: &str) -> &mut Self {
        self.headers.extend_from_slice(name.as_bytes());
        self.headers.extend_from_slice(b": ");
        self.headers.extend_from_slice(value.as_bytes());
        self.headers.extend_from_slice(b"\r\n");
        self
    }

    #[inline(always)]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Replaces the response body.
    #[inline]
    pub fn set_body(&mut self, body: &[u8]) -> &mut Self {
        self.body.clear();
        self.body.extend_from_slice(body);
        self
    }

    /// Appends to the response body.
    #[inline]
    pub fn append_body(&mut self, chunk: &[u8]) -> &mut Self {
        self.body.extend_from_slice(chunk);
        self
    }

    /// Closes the connection after this response.
    #[inline(always)]
    pub fn set_connection_close(&mut self) -> &mut Self {
        self.connection = ConnHeader::Close;
        self
    }

    #[inline(always)]
    pub fn connection_close(&self) -> bool {
        self.connection == ConnHeader::Close
    }
}

// Serialization
impl Response {
    /// Renders the full response into the staging writer.
    ///
    /// `server_name` fills the `Server` header when the handler left it
    /// empty. Headers land in the buffer before any body byte.
    pub(crate) fn write(&self, w: &mut ConnWriter, server_name: &[u8]) {
        w.extend(self.status.into_first_line(self.version));

        w.extend(b"Server: ");
        w.extend(if self.server.is_empty() {
            server_name
        } else {
            &self.server
        });
        w.extend(b"\r\n");

        if !self.content_type.is_empty() {
            w.extend(b"Content-Type: ");
            w.extend(&self.content_type);
            w.extend(b"\r\n");
        } else if !self.body.is_empty() {
            w.extend(b"Content-Type: ");
            w.extend(DEFAULT_CONTENT_TYPE);
            w.extend(b"\r\n");
        }

        match self.connection {
            ConnHeader::None => {}
            ConnHeader::Close => w.extend(b"Connection: close\r\n"),
            ConnHeader::KeepAlive => w.extend(b"Connection: keep-alive\r\n"),
        }

        w.extend(&self.headers);

        w.extend(b"Content-Length: ");
        push_usize(w.buf_mut(), self.body.len());
        w.extend(b"\r\n\r\n");

        w.extend(&self.body);
    }
}

#[inline]
fn push_usize(buf: &mut Vec<u8>, mut n: usize) {
    let mut digits = [0u8; 20];
    let mut at = digits.len();

    loop {
        at -= 1;
        digits[at] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }

    buf.extend_from_slice(&digits[at..]);
}

#[cfg(test)]
mod response_tests {
    use super::*;

    fn render(resp: &Response) -> String {
        let mut w = ConnWriter::new(256);
        resp.write(&mut w, b"unit-test");
        let mut out = Vec::new();
        std::mem::swap(&mut out, w.buf_mut());
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn minimal_response() {
        let resp = Response::new();
        assert_eq!(
            render(&resp),
            "HTTP/1.1 200 OK\r\nServer: unit-test\r\nContent-Length: 0\r\n\r\n"
        );
    }

    #[test]
    fn body_gets_default_content_type() {
        let mut resp = Response::new();
        resp.set_status(StatusCode::NotFound).set_body(b"missing");

        assert_eq!(
            render(&resp),
            "HTTP/1.1 404 Not Found\r\nServer: unit-test\r\n\
             Content-Type: text/plain; charset=utf-8\r\nContent-Length: 7\r\n\r\nmissing"
        );
    }

    #[test]
    fn explicit_headers_and_server() {
        let mut resp = Response::new();
        resp.set_server("custom/1.0")
            .set_content_type("application/json")
            .header("X-Request-Id", "42")
            .set_body(b"{}");

        assert_eq!(
            render(&resp),
            "HTTP/1.1 200 OK\r\nServer: custom/1.0\r\nContent-Type: application/json\r\n\
             X-Request-Id: 42\r\nContent-Length: 2\r\n\r\n{}"
        );
    }

    #[test]
    fn connection_header_variants() {
        #[rustfmt::skip]
        let cases = [
            (ConnHeader::None,      ""),
            (ConnHeader::Close,     "Connection: close\r\n"),
            (ConnHeader::KeepAlive, "Connection: keep-alive\r\n"),
        ];

        for (conn, header) in cases {
            let mut resp = Response::new();
            resp.connection = conn;

            assert_eq!(
                render(&resp),
                format!("HTTP/1.1 200 OK\r\nServer: unit-test\r\n{header}Content-Length: 0\r\n\r\n")
            );
        }
    }

    #[test]
    fn http10_status_line() {
        let mut resp = Response::new();
        resp.version = Version::Http10;

        assert!(render(&resp).starts_with("HTTP/1.0 200 OK\r\n"));
    }

    #[test]
    fn reset_then_rewrite_is_byte_identical() {
        let mut resp = Response::new();
        resp.set_status(StatusCode::Accepted)
            .header("X-A", "1")
            .set_body(b"first");
        let first = render(&resp);

        resp.reset();
        resp.set_status(StatusCode::Accepted)
            .header("X-A", "1")
            .set_body(b"first");
        assert_eq!(render(&resp), first);
    }

    #[test]
    fn copy_to_clones_everything() {
        let mut src = Response::new();
        src.set_status(StatusCode::RequestTimeout)
            .set_body(b"slow")
            .set_connection_close();

        let mut dst = Response::new();
        dst.set_body(b"junk to overwrite");
        src.copy_to(&mut dst);

        assert_eq!(render(&src), render(&dst));
    }

    #[test]
    fn push_usize_digits() {
        let cases = [(0, "0"), (7, "7"), (42, "42"), (65536, "65536")];

        for (n, expected) in cases {
            let mut buf = Vec::new();
            push_usize(&mut buf, n);
            assert_eq!(buf, expected.as_bytes());
        }
    }
}
