//! Bounded worker pool with per-worker mailboxes.
//!
//! `serve` hands a stream to an idle worker or reports saturation; nothing is
//! ever queued, so overload turns into an immediate drop at the accept loop
//! (admission control) instead of unbounded buffering. Each worker owns a
//! single-slot mailbox, avoiding the thundering herd of one shared queue.

use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::sync::mpsc;

use crate::{errors::ServeError, stream::BoxConn};

// Idle workers beyond this horizon are reaped by the background cleaner.
const MAX_IDLE_WORKER_DURATION: Duration = Duration::from_secs(10);

/// The per-connection entry point a worker runs for each stream.
pub(crate) trait WorkerFunc: Send + Sync + 'static {
    fn serve(&self, conn: BoxConn) -> impl Future<Output = Result<(), ServeError>> + Send;
}

impl<F, Fut> WorkerFunc for F
where
    F: Fn(BoxConn) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ServeError>> + Send,
{
    #[inline(always)]
    fn serve(&self, conn: BoxConn) -> impl Future<Output = Result<(), ServeError>> + Send {
        self(conn)
    }
}

// A worker is stopped by `None`; a stream is work.
type WorkerMsg = Option<BoxConn>;

struct ReadyWorker {
    since: Instant,
    mailbox: mpsc::Sender<WorkerMsg>,
}

struct PoolState {
    // LIFO stack: the most recently parked worker is handed the next stream,
    // so the longest-idle workers sink to the bottom where the cleaner finds
    // them.
    ready: Vec<ReadyWorker>,
    workers_count: usize,
    must_stop: bool,
}

pub(crate) struct WorkerPool<F> {
    worker_func: F,
    max_workers: usize,
    max_idle: Duration,
    state: Mutex<PoolState>,
}

impl<F: WorkerFunc> WorkerPool<F> {
    pub(crate) fn start(worker_func: F, max_workers: usize) -> Arc<Self> {
        Self::start_with_idle(worker_func, max_workers, MAX_IDLE_WORKER_DURATION)
    }

    pub(crate) fn start_with_idle(
        worker_func: F,
        max_workers: usize,
        max_idle: Duration,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            worker_func,
            max_workers,
            max_idle,
            state: Mutex::new(PoolState {
                ready: Vec::new(),
                workers_count: 0,
                must_stop: false,
            }),
        });

        let cleaner = Arc::downgrade(&pool);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(max_idle / 2).await;
                let Some(pool) = cleaner.upgrade() else { return };
                if pool.state.lock().unwrap().must_stop {
                    return;
                }
                pool.clean();
            }
        });

        pool
    }

    /// Hands `conn` to an idle worker. Returns `false` when the pool is
    /// saturated or stopping; the caller then drops the stream.
    pub(crate) fn serve(self: &Arc<Self>, conn: BoxConn) -> bool {
        let Some(mailbox) = self.ready_worker() else {
            return false;
        };
        // The worker is idle, so its single-slot mailbox has room.
        mailbox.try_send(Some(conn)).is_ok()
    }

    /// Lets all workers exit after their current connection. `serve` always
    /// returns `false` afterwards.
    pub(crate) fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.must_stop = true;
        for worker in state.ready.drain(..) {
            let _ = worker.mailbox.try_send(None);
        }
    }

    #[cfg(test)]
    pub(crate) fn workers_count(&self) -> usize {
        self.state.lock().unwrap().workers_count
    }

    fn ready_worker(self: &Arc<Self>) -> Option<mpsc::Sender<WorkerMsg>> {
        let mut state = self.state.lock().unwrap();
        if state.must_stop {
            return None;
        }
        if let Some(worker) = state.ready.pop() {
            return Some(worker.mailbox);
        }
        if state.workers_count < self.max_workers {
            state.workers_count += 1;
            let (tx, rx) = mpsc::channel(1);
            let pool = self.clone();
            let mailbox = tx.clone();
            tokio::spawn(async move { pool.worker_loop(mailbox, rx).await });
            return Some(tx);
        }
        None
    }

    async fn worker_loop(
        self: Arc<Self>,
        mailbox: mpsc::Sender<WorkerMsg>,
        mut rx: mpsc::Receiver<WorkerMsg>,
    ) {
        while let Some(msg) = rx.recv().await {
            let Some(conn) = msg else { break };

            match self.worker_func.serve(conn).await {
                Ok(()) | Err(ServeError::Hijacked) => {}
                Err(err) => tracing::debug!(error = %err, "connection ended with error"),
            }

            if !self.park(mailbox.clone()) {
                break;
            }
        }

        self.state.lock().unwrap().workers_count -= 1;
    }

    // Returns the worker to the ready stack; `false` means the pool is
    // stopping and the worker must exit instead.
    fn park(&self, mailbox: mpsc::Sender<WorkerMsg>) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.must_stop {
            return false;
        }
        state.ready.push(ReadyWorker {
            since: Instant::now(),
            mailbox,
        });
        true
    }

    fn clean(&self) {
        let critical = Instant::now() - self.max_idle;

        let stale: Vec<ReadyWorker> = {
            let mut state = self.state.lock().unwrap();
            let keep_from = state
                .ready
                .iter()
                .position(|w| w.since > critical)
                .unwrap_or(state.ready.len());
            state.ready.drain(..keep_from).collect()
        };

        for worker in stale {
            let _ = worker.mailbox.try_send(None);
        }
    }
}

#[cfg(test)]
mod worker_pool_tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn dummy_conn() -> BoxConn {
        let (_client, server) = tokio::io::duplex(16);
        // The client half is dropped; workers treat the stream as data.
        Box::new(server)
    }

    async fn eventually<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn dispatches_to_workers() {
        let served = Arc::new(AtomicUsize::new(0));
        let counter = served.clone();

        let pool = WorkerPool::start(
            move |_conn: BoxConn| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            4,
        );

        for _ in 0..3 {
            assert!(pool.serve(dummy_conn()));
        }
        eventually(|| served.load(Ordering::SeqCst) == 3).await;
    }

    #[tokio::test]
    async fn saturated_pool_refuses() {
        let gate = Arc::new(Notify::new());
        let release = gate.clone();

        let pool = WorkerPool::start(
            move |_conn: BoxConn| {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    Ok(())
                }
            },
            1,
        );

        assert!(pool.serve(dummy_conn()));
        assert!(!pool.serve(dummy_conn()));

        release.notify_one();
        eventually(|| pool.serve(dummy_conn())).await;
        release.notify_one();
    }

    #[tokio::test]
    async fn workers_are_reused_not_respawned() {
        let pool = WorkerPool::start(|_conn: BoxConn| async { Ok(()) }, 8);

        for _ in 0..5 {
            assert!(pool.serve(dummy_conn()));
            eventually(|| pool.state.lock().unwrap().ready.len() == 1).await;
        }
        assert_eq!(pool.workers_count(), 1);
    }

    #[tokio::test]
    async fn serve_after_stop_returns_false() {
        let pool = WorkerPool::start(|_conn: BoxConn| async { Ok(()) }, 4);

        assert!(pool.serve(dummy_conn()));
        eventually(|| pool.state.lock().unwrap().ready.len() == 1).await;

        pool.stop();
        assert!(!pool.serve(dummy_conn()));
        eventually(|| pool.workers_count() == 0).await;
    }

    #[tokio::test]
    async fn idle_workers_are_reaped() {
        let pool = WorkerPool::start_with_idle(
            |_conn: BoxConn| async { Ok(()) },
            4,
            Duration::from_millis(20),
        );

        assert!(pool.serve(dummy_conn()));
        eventually(|| pool.state.lock().unwrap().ready.len() == 1).await;

        eventually(|| pool.workers_count() == 0).await;
        // A reaped pool still serves new connections.
        assert!(pool.serve(dummy_conn()));
    }
}
