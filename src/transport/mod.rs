//! Multiplexed-stream transport.
//!
//! The engine only needs bidirectional byte streams on one connection. Each
//! stream comes as a write half and a read half; shutting down the write half
//! is a graceful half-close and reading is what releases receive credit.

use crate::error::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod auth;
pub mod memory;
pub mod quic;

pub use auth::PasswordAuthority;
pub use memory::{MemoryConnection, MemoryRecv, MemorySend};
pub use quic::QuicConnection;

/// Write half of a stream.
pub trait SendHalf: AsyncWrite + Unpin + Send + 'static {
    /// Abandon the stream; the peer's reads fail instead of seeing a clean
    /// end of stream.
    fn abort(&mut self, code: u32);
}

#[async_trait]
pub trait Connection: Send + Sync + 'static {
    type Send: SendHalf;
    type Recv: AsyncRead + Unpin + Send + 'static;

    /// Open a new bidirectional stream.
    async fn open_stream(&self) -> Result<(Self::Send, Self::Recv)>;

    /// Wait for the peer to open a stream. `None` once the connection is
    /// closed.
    async fn accept_stream(&self) -> Result<Option<(Self::Send, Self::Recv)>>;

    /// Close the whole connection with an application code.
    fn close(&self, code: u32, reason: &str);

    /// Resolves once the connection is closed by either side.
    async fn closed(&self);

    /// Peer description for logs.
    fn peer(&self) -> String;
}
