//! Response-deadline wrapper for handlers.

use std::{sync::Arc, time::Duration};

use crate::{
    ctx::{CtxSnapshot, RequestCtx},
    http::types::StatusCode,
    server::Handler,
};

/// Wraps `h` so the client receives a `408 Request Timeout` response with
/// `msg` as body when `h` has not returned within `timeout`.
///
/// This is a response timeout, not cancellation: the wrapped handler keeps
/// running with its (now escaped) ctx and must plumb its own cancellation if
/// it needs any. The connection loop swaps in a fresh ctx and carries on.
/// A zero `timeout` disables the wrapper.
///
/// # Examples
///
/// ```no_run
/// use brisk_web::{timeout_handler, RequestCtx, Server, ServerConfig};
/// use std::time::Duration;
///
/// async fn slow(ctx: Box<RequestCtx>) -> Box<RequestCtx> {
///     tokio::time::sleep(Duration::from_secs(30)).await;
///     ctx
/// }
///
/// let wrapped = timeout_handler(slow, Duration::from_millis(500), "processing took too long");
/// let server = Server::new(ServerConfig::default(), wrapped);
/// ```
pub fn timeout_handler<H: Handler>(h: H, timeout: Duration, msg: &str) -> impl Handler {
    timeout_handler_with_code(h, timeout, msg, StatusCode::RequestTimeout)
}

/// [`timeout_handler`] with an explicit status code for the synthesized
/// response.
pub fn timeout_handler_with_code<H: Handler>(
    h: H,
    timeout: Duration,
    msg: &str,
    status: StatusCode,
) -> impl Handler {
    let h = Arc::new(h);
    let msg: Arc<str> = Arc::from(msg);

    move |ctx: Box<RequestCtx>| {
        let h = h.clone();
        let msg = msg.clone();

        async move {
            if timeout.is_zero() {
                return h.handle(ctx).await;
            }

            let snapshot = ctx.snapshot();
            let mut task = tokio::spawn(async move { h.handle(ctx).await });

            match tokio::time::timeout(timeout, &mut task).await {
                Ok(Ok(ctx)) => ctx,
                Ok(Err(join_err)) => {
                    if join_err.is_panic() {
                        // A panicking handler behaves as if called directly.
                        std::panic::resume_unwind(join_err.into_panic());
                    }
                    detached_replacement(snapshot, &msg, status)
                }
                // Timer won. The task keeps running and owns the escaped
                // ctx; it is dropped there, never recycled.
                Err(_elapsed) => detached_replacement(snapshot, &msg, status),
            }
        }
    }
}

fn detached_replacement(snapshot: CtxSnapshot, msg: &str, status: StatusCode) -> Box<RequestCtx> {
    let mut ctx = RequestCtx::new();
    ctx.apply_snapshot(snapshot);
    ctx.timeout_error_with_code(msg, status);
    ctx
}
