//! Pooled per-connection read and write buffers.
//!
//! Both buffers detach from the stream between operations, so an idle
//! connection pins no buffer memory once the loop releases them back to
//! their pools.

use std::{future::Future, io, time::Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Runs an I/O future under an optional absolute deadline.
///
/// A missed deadline surfaces as [`io::ErrorKind::TimedOut`], matching what a
/// socket read/write deadline would produce.
#[inline]
pub(crate) async fn with_deadline<T, F>(deadline: Option<Instant>, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match deadline {
        Some(at) => match tokio::time::timeout_at(tokio::time::Instant::from_std(at), fut).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")),
        },
        None => fut.await,
    }
}

// READER

/// Fixed-capacity read buffer with consume cursors.
///
/// The capacity also bounds the request header block: a header that does not
/// fit is rejected, never grown around.
pub(crate) struct ConnReader {
    buf: Box<[u8]>,
    pos: usize,
    len: usize,
}

impl ConnReader {
    #[inline(always)]
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity].into_boxed_slice(),
            pos: 0,
            len: 0,
        }
    }

    #[inline(always)]
    pub(crate) fn reset(&mut self) {
        self.pos = 0;
        self.len = 0;
    }

    /// Number of unconsumed bytes.
    #[inline(always)]
    pub(crate) fn buffered(&self) -> usize {
        self.len - self.pos
    }

    /// Unconsumed bytes.
    #[inline(always)]
    pub(crate) fn slice(&self) -> &[u8] {
        &self.buf[self.pos..self.len]
    }

    #[inline(always)]
    pub(crate) fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.buffered());
        self.pos += n;
    }

    /// True when no further `fill` can make progress.
    #[inline(always)]
    pub(crate) fn is_full(&self) -> bool {
        self.buffered() == self.buf.len()
    }

    /// Seeds an empty buffer with one byte prefetched from the raw stream.
    ///
    /// The buffer yields exactly this byte before the stream is read again,
    /// with no double read.
    #[inline(always)]
    pub(crate) fn prepend(&mut self, byte: u8) {
        debug_assert_eq!(self.buffered(), 0);
        self.buf[0] = byte;
        self.pos = 0;
        self.len = 1;
    }

    /// Reads once from `conn` into the free tail, compacting first.
    ///
    /// Returns the number of bytes read; `0` means EOF.
    pub(crate) async fn fill<C>(&mut self, conn: &mut C, deadline: Option<Instant>) -> io::Result<usize>
    where
        C: AsyncRead + Unpin + ?Sized,
    {
        if self.pos > 0 {
            self.buf.copy_within(self.pos..self.len, 0);
            self.len -= self.pos;
            self.pos = 0;
        }
        debug_assert!(self.len < self.buf.len());

        let n = with_deadline(deadline, conn.read(&mut self.buf[self.len..])).await?;
        self.len += n;
        Ok(n)
    }
}

// WRITER

/// Response staging buffer flushed to the stream at the loop's discretion.
pub(crate) struct ConnWriter {
    buf: Vec<u8>,
    capacity: usize,
}

impl ConnWriter {
    #[inline(always)]
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    #[inline(always)]
    pub(crate) fn reset(&mut self) {
        // A response much larger than the configured buffer must not stay
        // pinned in the pool.
        if self.buf.capacity() > self.capacity * 4 {
            self.buf = Vec::with_capacity(self.capacity);
        } else {
            self.buf.clear();
        }
    }

    #[inline(always)]
    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline(always)]
    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    #[inline(always)]
    pub(crate) fn buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    /// Writes out everything buffered, then clears the buffer.
    pub(crate) async fn flush<C>(&mut self, conn: &mut C, deadline: Option<Instant>) -> io::Result<()>
    where
        C: AsyncWrite + Unpin + ?Sized,
    {
        if self.buf.is_empty() {
            return Ok(());
        }

        with_deadline(deadline, async {
            conn.write_all(&self.buf).await?;
            conn.flush().await
        })
        .await?;

        self.buf.clear();
        Ok(())
    }
}

#[cfg(test)]
mod reader_tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn fill_and_consume() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let mut reader = ConnReader::new(16);

        client.write_all(b"hello world").await.unwrap();

        let n = reader.fill(&mut server, None).await.unwrap();
        assert_eq!(n, 11);
        assert_eq!(reader.slice(), b"hello world");

        reader.consume(6);
        assert_eq!(reader.slice(), b"world");
        assert_eq!(reader.buffered(), 5);
    }

    #[tokio::test]
    async fn fill_compacts_consumed_prefix() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let mut reader = ConnReader::new(8);

        client.write_all(b"abcdefgh").await.unwrap();
        reader.fill(&mut server, None).await.unwrap();
        assert!(reader.is_full());

        reader.consume(6);
        client.write_all(b"XY").await.unwrap();
        reader.fill(&mut server, None).await.unwrap();

        assert_eq!(reader.slice(), b"ghXY");
    }

    #[tokio::test]
    async fn prepend_yields_probe_byte_first() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let mut reader = ConnReader::new(8);

        reader.prepend(b'G');
        client.write_all(b"ET /").await.unwrap();
        reader.fill(&mut server, None).await.unwrap();

        assert_eq!(reader.slice(), b"GET /");
    }

    #[tokio::test]
    async fn fill_deadline_times_out() {
        let (_client, mut server) = tokio::io::duplex(64);
        let mut reader = ConnReader::new(8);

        let deadline = Some(Instant::now() + Duration::from_millis(20));
        let err = reader.fill(&mut server, deadline).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn fill_reports_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let mut reader = ConnReader::new(8);
        let n = reader.fill(&mut server, None).await.unwrap();
        assert_eq!(n, 0);
    }
}
