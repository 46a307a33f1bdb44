//! The per-connection request/response loop.
//!
//! One worker drives one connection through repeated
//! read → handle → write cycles until keep-alive ends, an error occurs, or a
//! hijack hands the stream away. Pooled objects (ctx, reader, writer) are
//! held only while needed and released on every exit path.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use tokio::io::AsyncReadExt;

use crate::{
    bufio::with_deadline,
    ctx::HijackFn,
    errors::{ReadError, ServeError},
    http::response::ConnHeader,
    server::{Handler, ServerInner},
    stream::{BoxConn, HijackedConn},
};

// Idle phases longer than this push the connection into byte-probe mode for
// its next read, releasing ctx and buffer memory while it waits.
const SLOW_READ_THRESHOLD: Duration = Duration::from_secs(1);

// Write budget granted for the final response of a connection whose
// keep-alive lifetime expired mid-cycle.
const EXPIRED_WRITE_GRACE: Duration = Duration::from_millis(100);

const RESPONSE_CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Serves every request arriving on `conn` until the connection ends.
///
/// Returns `Err(ServeError::Hijacked)` when the stream was handed to a
/// hijack handler; the caller must not close it in that case (dropping the
/// moved stream is the hijack task's job).
pub(crate) async fn serve_connection<H: Handler>(
    inner: &Arc<ServerInner<H>>,
    mut conn: BoxConn,
) -> Result<(), ServeError> {
    let remote = conn.peer_addr();
    let local = conn.local_addr();

    let mut current_time = Instant::now();
    let conn_time = current_time;
    let mut conn_request_num: u64 = 0;
    let mut last_read_duration = Duration::ZERO;

    let mut ctx = Some(inner.acquire_ctx(remote, local));
    let mut reader = None;
    let mut writer = None;

    let result = 'conn: loop {
        conn_request_num += 1;
        {
            let ctx = ctx.as_mut().unwrap();
            ctx.id = ctx.id.wrapping_add(1);
            ctx.time = current_time;
        }

        // Read deadline: the tighter of the read timeout and what is left of
        // the keep-alive budget.
        let read_deadline = match compose_read_deadline(inner, conn_time, current_time) {
            Ok(deadline) => deadline,
            Err(err) => break 'conn Err(err),
        };

        // Reader acquisition. Mostly-idle connections give their ctx and
        // buffer back to the pools and wait in a single-byte read instead.
        let probe = inner.config.reduce_memory_usage || last_read_duration > SLOW_READ_THRESHOLD;
        if !probe || reader.is_some() {
            if reader.is_none() {
                reader = Some(inner.acquire_reader());
            }
        } else {
            let request_time = ctx.as_ref().unwrap().time;
            inner.release_ctx(ctx.take().unwrap());

            let mut scratch = [0u8; 1];
            let n = match with_deadline(read_deadline, conn.read(&mut scratch)).await {
                Ok(n) => n,
                Err(err) => break 'conn Err(err.into()),
            };

            let mut fresh = inner.acquire_ctx(remote, local);
            fresh.time = request_time;
            ctx = Some(fresh);

            if n == 0 {
                // Peer closed while idle.
                break 'conn Ok(());
            }

            let r = reader.insert(inner.acquire_reader());
            r.prepend(scratch[0]);
        }

        // Parse the request; drop the reader as soon as it holds nothing.
        let read_result = {
            let ctx = ctx.as_mut().unwrap();
            ctx.request
                .read_limited(
                    reader.as_mut().unwrap(),
                    &mut conn,
                    read_deadline,
                    inner.config.max_request_body_size,
                    inner.config.get_only,
                )
                .await
        };
        if reader.as_ref().unwrap().buffered() == 0 || read_result.is_err() {
            release_reader(inner, &mut reader);
        }

        current_time = Instant::now();
        last_read_duration = current_time - ctx.as_ref().unwrap().time;
        ctx.as_mut().unwrap().last_read_duration = last_read_duration;

        match read_result {
            Ok(()) => {}
            Err(ReadError::Eof) => break 'conn Ok(()),
            Err(ReadError::Io(err)) => break 'conn Err(err.into()),
            Err(ReadError::Parse(err)) => break 'conn Err(err.into()),
        }

        // 'Expect: 100-continue' handshake: acknowledge, then pull the body.
        let expects_continue = {
            let req = &ctx.as_ref().unwrap().request;
            !req.no_body() && req.may_continue()
        };
        if expects_continue {
            let w = writer.get_or_insert_with(|| inner.acquire_writer());
            w.extend(RESPONSE_CONTINUE);
            let flushed = w.flush(&mut conn, None).await;
            release_writer(inner, &mut writer);
            if let Err(err) = flushed {
                break 'conn Err(err.into());
            }

            if reader.is_none() {
                reader = Some(inner.acquire_reader());
            }
            let body_result = {
                let ctx = ctx.as_mut().unwrap();
                ctx.request
                    .continue_read_body(
                        reader.as_mut().unwrap(),
                        &mut conn,
                        read_deadline,
                        inner.config.max_request_body_size,
                    )
                    .await
            };
            if reader.as_ref().unwrap().buffered() == 0 || body_result.is_err() {
                release_reader(inner, &mut reader);
            }
            match body_result {
                Ok(()) => {}
                Err(ReadError::Eof) => {
                    break 'conn Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed inside continued body",
                    )
                    .into());
                }
                Err(ReadError::Io(err)) => break 'conn Err(err.into()),
                Err(ReadError::Parse(err)) => break 'conn Err(err.into()),
            }
        }

        // Handler invocation on a fully stamped ctx.
        let mut owned = ctx.take().unwrap();
        owned.conn_request_num = conn_request_num;
        owned.conn_time = conn_time;
        owned.time = current_time;
        owned.response.reset();
        owned.response.version = owned.request.version();

        let mut owned = inner.handler.handle(owned).await;

        let hijack = owned.hijack_handler.take();
        owned.clear_user_values();

        // A set timeout_response means the returned ctx escaped into user
        // code: swap in a fresh one and answer with the prepared response.
        if owned.timeout_response.is_some() {
            let timeout_response = owned.timeout_response.take().unwrap();
            let snapshot = owned.snapshot();
            drop(owned);

            let mut fresh = inner.acquire_ctx(remote, local);
            fresh.apply_snapshot(snapshot);
            timeout_response.copy_to(&mut fresh.response);
            if reader.is_some() {
                // Buffered input may interleave with body bytes the escaped
                // request never consumed; the stream is not resumable.
                fresh.response.set_connection_close();
            }
            owned = fresh;
        }

        if inner.config.max_requests_per_conn > 0
            && conn_request_num >= inner.config.max_requests_per_conn as u64
        {
            owned.response.set_connection_close();
        }

        // Write deadline, with a short grace period when the keep-alive
        // budget ran out under the handler.
        let write_deadline = compose_write_deadline(inner, conn_time, &mut owned);

        // Connection header negotiation.
        let connection_close =
            owned.response.connection_close() || owned.request.connection_close();
        if connection_close {
            owned.response.connection = ConnHeader::Close;
        } else if !owned.request.version().is_http11() {
            owned.response.connection = ConnHeader::KeepAlive;
        }

        debug_assert!(owned.timeout_response.is_none());
        let w = writer.get_or_insert_with(|| inner.acquire_writer());
        owned.response.write(w, inner.server_name());
        ctx = Some(owned);

        // Flush only when no more input is buffered or the connection is
        // closing; a pipelined client keeps the writer warm instead.
        if reader.is_none() || connection_close {
            let flushed = writer.as_mut().unwrap().flush(&mut conn, write_deadline).await;
            release_writer(inner, &mut writer);
            if let Err(err) = flushed {
                break 'conn Err(err.into());
            }
            if connection_close {
                break 'conn Ok(());
            }
        }

        if let Some(handler) = hijack {
            match start_hijack(inner, conn, handler, &mut reader, &mut writer).await {
                Ok(()) => {
                    inner.release_ctx(ctx.take().unwrap());
                    return Err(ServeError::Hijacked);
                }
                Err(err) => break 'conn Err(err),
            }
        }

        current_time = Instant::now();
    };

    if let Some(r) = reader.take() {
        release_one_reader(inner, r);
    }
    if let Some(w) = writer.take() {
        release_one_writer(inner, w);
    }
    if let Some(c) = ctx.take() {
        inner.release_ctx(c);
    }

    result
}

// Consumes the stream on success; an `Err` means the pending response flush
// failed and the connection must die normally (stream already dropped).
async fn start_hijack<H: Handler>(
    inner: &Arc<ServerInner<H>>,
    mut conn: BoxConn,
    handler: HijackFn,
    reader: &mut Option<crate::bufio::ConnReader>,
    writer: &mut Option<crate::bufio::ConnWriter>,
) -> Result<(), ServeError> {
    // Unconsumed buffered input belongs to the hijacked protocol now.
    let prefix = match reader.take() {
        Some(r) => {
            let bytes = Bytes::copy_from_slice(r.slice());
            release_one_reader(inner, r);
            bytes
        }
        None => Bytes::new(),
    };

    if writer.is_some() {
        let flushed = writer.as_mut().unwrap().flush(&mut conn, None).await;
        release_writer(inner, writer);
        if let Err(err) = flushed {
            return Err(err.into());
        }
    }

    tokio::spawn(run_hijacked(prefix, conn, handler));
    Ok(())
}

// Detached task driving the user's hijack handler. Panics are caught and
// logged; the stream is closed on every exit path by dropping it.
async fn run_hijacked(prefix: Bytes, conn: BoxConn, handler: HijackFn) {
    let fut = handler(HijackedConn::new(conn, prefix));

    if let Err(err) = tokio::spawn(fut).await {
        if err.is_panic() {
            tracing::error!(target: "brisk_web", error = %err, "panic on hijacked connection");
        }
    }
}

fn compose_read_deadline<H: Handler>(
    inner: &Arc<ServerInner<H>>,
    conn_time: Instant,
    now: Instant,
) -> Result<Option<Instant>, ServeError> {
    let mut timeout = inner.config.read_timeout;

    if let Some(max_keepalive) = inner.config.max_keepalive_duration {
        let left = max_keepalive.saturating_sub(now - conn_time);
        if left.is_zero() {
            return Err(ServeError::KeepaliveTimeout);
        }
        timeout = Some(match timeout {
            Some(t) if t < left => t,
            _ => left,
        });
    }

    Ok(timeout.map(|t| now + t))
}

fn compose_write_deadline<H: Handler>(
    inner: &Arc<ServerInner<H>>,
    conn_time: Instant,
    ctx: &mut crate::ctx::RequestCtx,
) -> Option<Instant> {
    let mut timeout = inner.config.write_timeout;

    if let Some(max_keepalive) = inner.config.max_keepalive_duration {
        let mut left = max_keepalive.saturating_sub(conn_time.elapsed());
        if left.is_zero() {
            // Budget spent under the handler: close, but still try to get
            // the response out.
            ctx.response.set_connection_close();
            left = EXPIRED_WRITE_GRACE;
        }
        timeout = Some(match timeout {
            Some(t) if t < left => t,
            _ => left,
        });
    }

    timeout.map(|t| Instant::now() + t)
}

#[inline]
fn release_reader<H: Handler>(
    inner: &Arc<ServerInner<H>>,
    reader: &mut Option<crate::bufio::ConnReader>,
) {
    if let Some(r) = reader.take() {
        release_one_reader(inner, r);
    }
}

#[inline]
fn release_one_reader<H: Handler>(inner: &Arc<ServerInner<H>>, mut r: crate::bufio::ConnReader) {
    r.reset();
    inner.reader_pool.put(r);
}

#[inline]
fn release_writer<H: Handler>(
    inner: &Arc<ServerInner<H>>,
    writer: &mut Option<crate::bufio::ConnWriter>,
) {
    if let Some(w) = writer.take() {
        release_one_writer(inner, w);
    }
}

#[inline]
fn release_one_writer<H: Handler>(inner: &Arc<ServerInner<H>>, mut w: crate::bufio::ConnWriter) {
    w.reset();
    inner.writer_pool.put(w);
}
