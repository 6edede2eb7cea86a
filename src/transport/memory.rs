//! In-process connection pair built on `tokio::io::duplex`.
//!
//! Used by the tests and the benches to run both ends of a session without a
//! network. Stream buffers are small on purpose so that flow control is
//! actually exercised.

use crate::error::{Result, SyncError};
use crate::transport::{Connection, SendHalf};
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex};

/// Default per-direction stream buffer
pub const DEFAULT_STREAM_BUFFER: usize = 64 * 1024;

pub struct MemorySend {
    inner: WriteHalf<DuplexStream>,
    aborted: Arc<AtomicBool>,
}

pub struct MemoryRecv {
    inner: ReadHalf<DuplexStream>,
    aborted: Arc<AtomicBool>,
}

fn aborted_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "stream aborted by peer")
}

impl AsyncWrite for MemorySend {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.aborted.load(Ordering::Acquire) {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl SendHalf for MemorySend {
    fn abort(&mut self, code: u32) {
        tracing::debug!("Aborting in-memory stream with code {}", code);
        self.aborted.store(true, Ordering::Release);
    }
}

impl AsyncRead for MemoryRecv {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.aborted.load(Ordering::Acquire) {
            return Poll::Ready(Err(aborted_error()));
        }
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        // The peer may have aborted while we were parked.
        if self.aborted.load(Ordering::Acquire) {
            return Poll::Ready(Err(aborted_error()));
        }
        Poll::Ready(Ok(()))
    }
}

type StreamPair = (MemorySend, MemoryRecv);

fn stream_pair(buffer: usize) -> (StreamPair, StreamPair) {
    let (a, b) = tokio::io::duplex(buffer);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    let a_to_b = Arc::new(AtomicBool::new(false));
    let b_to_a = Arc::new(AtomicBool::new(false));
    (
        (
            MemorySend {
                inner: a_write,
                aborted: Arc::clone(&a_to_b),
            },
            MemoryRecv {
                inner: a_read,
                aborted: Arc::clone(&b_to_a),
            },
        ),
        (
            MemorySend {
                inner: b_write,
                aborted: b_to_a,
            },
            MemoryRecv {
                inner: b_read,
                aborted: a_to_b,
            },
        ),
    )
}

/// One end of an in-process connection.
pub struct MemoryConnection {
    label: &'static str,
    buffer: usize,
    outgoing: mpsc::UnboundedSender<StreamPair>,
    incoming: Mutex<mpsc::UnboundedReceiver<StreamPair>>,
    closed: Arc<watch::Sender<bool>>,
}

impl MemoryConnection {
    /// Returns `(client, server)`.
    pub fn pair() -> (Self, Self) {
        Self::pair_with_buffer(DEFAULT_STREAM_BUFFER)
    }

    pub fn pair_with_buffer(buffer: usize) -> (Self, Self) {
        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        let client = Self {
            label: "memory-server",
            buffer,
            outgoing: to_server,
            incoming: Mutex::new(from_server),
            closed: Arc::clone(&closed),
        };
        let server = Self {
            label: "memory-client",
            buffer,
            outgoing: to_client,
            incoming: Mutex::new(from_client),
            closed,
        };
        (client, server)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

async fn wait_closed(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    type Send = MemorySend;
    type Recv = MemoryRecv;

    async fn open_stream(&self) -> Result<(MemorySend, MemoryRecv)> {
        if self.is_closed() {
            return Err(SyncError::Transport("connection closed".to_string()));
        }
        let (local, remote) = stream_pair(self.buffer);
        self.outgoing
            .send(remote)
            .map_err(|_| SyncError::Transport("peer is gone".to_string()))?;
        Ok(local)
    }

    async fn accept_stream(&self) -> Result<Option<(MemorySend, MemoryRecv)>> {
        if self.is_closed() {
            return Ok(None);
        }
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            stream = incoming.recv() => Ok(stream),
            _ = wait_closed(self.closed.subscribe()) => Ok(None),
        }
    }

    fn close(&self, code: u32, reason: &str) {
        tracing::debug!("Closing in-memory connection ({}): {}", code, reason);
        self.closed.send_replace(true);
    }

    async fn closed(&self) {
        wait_closed(self.closed.subscribe()).await
    }

    fn peer(&self) -> String {
        self.label.to_string()
    }
}
