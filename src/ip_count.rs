//! Per-IP live-connection accounting.

use std::{
    collections::HashMap,
    io,
    net::{Ipv4Addr, SocketAddr},
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::stream::{BoxConn, Conn};

/// Live-connection counts per client IPv4 address.
///
/// Touched only at accept and close, so one global lock is enough.
#[derive(Default)]
pub(crate) struct PerIpCounter {
    map: Mutex<HashMap<Ipv4Addr, u32>>,
}

impl PerIpCounter {
    /// Increments the count for `ip` and returns the new value.
    pub(crate) fn register(&self, ip: Ipv4Addr) -> u32 {
        let mut map = self.map.lock().unwrap();
        let count = map.entry(ip).or_insert(0);
        *count += 1;
        *count
    }

    /// Decrements the count for `ip`, removing the entry at zero.
    pub(crate) fn unregister(&self, ip: Ipv4Addr) {
        let mut map = self.map.lock().unwrap();
        match map.get_mut(&ip) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                map.remove(&ip);
            }
            None => debug_assert!(false, "unregister of an unknown ip"),
        }
    }

    #[cfg(test)]
    pub(crate) fn count(&self, ip: Ipv4Addr) -> u32 {
        self.map.lock().unwrap().get(&ip).copied().unwrap_or(0)
    }
}

/// Extracts the peer IPv4 address, if the stream has one.
///
/// Non-IPv4 peers (UNIX sockets, in-memory streams, IPv6) are not counted.
#[inline]
pub(crate) fn conn_ip4(conn: &dyn Conn) -> Option<Ipv4Addr> {
    match conn.peer_addr() {
        Some(SocketAddr::V4(addr)) => Some(*addr.ip()),
        _ => None,
    }
}

/// Stream wrapper pairing a registered IP with exactly one unregister.
///
/// The unregister runs in `Drop`, so layered wrappers or repeated shutdowns
/// cannot run it twice.
pub(crate) struct PerIpConn {
    inner: BoxConn,
    ip: Ipv4Addr,
    counter: Arc<PerIpCounter>,
}

impl PerIpConn {
    #[inline(always)]
    pub(crate) fn new(inner: BoxConn, ip: Ipv4Addr, counter: Arc<PerIpCounter>) -> Self {
        Self { inner, ip, counter }
    }
}

impl Drop for PerIpConn {
    fn drop(&mut self) {
        self.counter.unregister(self.ip);
    }
}

impl AsyncRead for PerIpConn {
    #[inline]
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PerIpConn {
    #[inline]
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    #[inline]
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    #[inline]
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Conn for PerIpConn {
    #[inline(always)]
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr()
    }

    #[inline(always)]
    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod ip_count_tests {
    use super::*;

    const IP: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);
    const OTHER: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);

    #[test]
    fn register_counts_per_ip() {
        let counter = PerIpCounter::default();

        assert_eq!(counter.register(IP), 1);
        assert_eq!(counter.register(IP), 2);
        assert_eq!(counter.register(OTHER), 1);
        assert_eq!(counter.register(IP), 3);
    }

    #[test]
    fn unregister_removes_at_zero() {
        let counter = PerIpCounter::default();

        counter.register(IP);
        counter.register(IP);

        counter.unregister(IP);
        assert_eq!(counter.count(IP), 1);

        counter.unregister(IP);
        assert_eq!(counter.count(IP), 0);
        assert!(counter.map.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn wrapper_unregisters_exactly_once_on_drop() {
        let counter = Arc::new(PerIpCounter::default());
        counter.register(IP);

        let (_client, server) = tokio::io::duplex(16);
        let conn = PerIpConn::new(Box::new(server), IP, counter.clone());
        assert_eq!(counter.count(IP), 1);

        drop(conn);
        assert_eq!(counter.count(IP), 0);
    }

    #[test]
    fn parallel_register_unregister() {
        let counter = Arc::new(PerIpCounter::default());
        let mut tasks = Vec::new();

        for _ in 0..8 {
            let counter = counter.clone();
            tasks.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    counter.register(IP);
                    counter.unregister(IP);
                }
            }));
        }
        for task in tasks {
            task.join().unwrap();
        }

        assert_eq!(counter.count(IP), 0);
    }
}
