//! Idle shutdown
//!
//! The runner exits once no connection has been open for the idle timeout.
//! [`IdleListener`] wraps the TCP listener so every accepted connection is
//! counted until its stream is dropped.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::serve::Listener;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::debug;

/// Counts open connections and fires after a quiet period.
#[derive(Debug)]
pub struct IdleTracker {
    timeout: Duration,
    active: watch::Sender<usize>,
}

impl IdleTracker {
    /// Start tracking; the timer runs from construction
    #[must_use]
    pub fn new(timeout: Duration) -> Arc<Self> {
        let (active, _) = watch::channel(0);
        Arc::new(Self { timeout, active })
    }

    /// Currently open connections
    #[must_use]
    pub fn active(&self) -> usize {
        *self.active.borrow()
    }

    /// Register a connection; it counts until the guard is dropped
    #[must_use]
    pub fn connect(self: &Arc<Self>) -> ConnectionGuard {
        self.active.send_modify(|n| *n += 1);
        ConnectionGuard {
            tracker: Arc::clone(self),
        }
    }

    /// Resolves once no connection has been open for the timeout.
    ///
    /// Any connection opening or closing restarts the timer.
    pub async fn done(&self) {
        let mut rx = self.active.subscribe();
        loop {
            if *rx.borrow_and_update() > 0 {
                if rx.changed().await.is_err() {
                    return;
                }
                continue;
            }
            tokio::select! {
                () = tokio::time::sleep(self.timeout) => {
                    debug!(timeout = ?self.timeout, "idle timer fired");
                    return;
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Keeps a connection counted while alive.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: Arc<IdleTracker>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// TCP listener reporting connections to an [`IdleTracker`].
pub struct IdleListener {
    inner: TcpListener,
    tracker: Arc<IdleTracker>,
}

impl IdleListener {
    /// Wrap a bound listener
    #[must_use]
    pub fn new(inner: TcpListener, tracker: Arc<IdleTracker>) -> Self {
        Self { inner, tracker }
    }
}

impl Listener for IdleListener {
    type Io = TrackedStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        let (stream, addr) = Listener::accept(&mut self.inner).await;
        let guard = self.tracker.connect();
        (TrackedStream { stream, _guard: guard }, addr)
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

/// A TCP stream that counts as active until dropped.
pub struct TrackedStream {
    stream: TcpStream,
    _guard: ConnectionGuard,
}

impl AsyncRead for TrackedStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}
