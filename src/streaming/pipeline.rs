//! Sync session orchestration.
//!
//! One connection carries one control stream, opened by the sender, and one
//! content stream per pulled file, opened by the receiver. Every stream is
//! driven by a [`StreamRole`] task.
//!
//! ```text
//! Sender                                  Receiver
//!   scan -> advertise --- control ----->  reassemble -> decide
//!   retire ids <--------- acks ---------  (current / dir / symlink)
//!   serve_pull <--------- id -- content - pull (needs transfer)
//!              ---------- file bytes --->  temp file -> rename
//! ```

use crate::error::{Result, SyncError};
use crate::scanner::Scanner;
use crate::streaming::channel::{
    record_channel, Counter, SyncStats, ABORT_CODE, CONTROL_READ_SIZE, DONE_CODE,
};
use crate::streaming::frame::{encode_ack, FrameLimits};
use crate::streaming::inventory::IdAllocator;
use crate::streaming::reassembly::{Reassembled, Reassembler};
use crate::streaming::receiver::{Disposition, Receiver, TransferContext};
use crate::streaming::sender::Sender;
use crate::transport::{Connection, SendHalf};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::{JoinError, JoinSet};

pub type RoleFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// Which end of the control stream this is.
pub enum ControlSide<C: Connection> {
    /// Scan and advertise, retire acknowledged ids.
    Advertise { sender: Arc<Sender>, scanner: Scanner },
    /// Decide on records, acknowledge or pull them.
    Consume { receiver: Arc<Receiver>, conn: Arc<C> },
}

/// A stream and the state its task needs.
pub enum StreamRole<C: Connection> {
    Control {
        send: C::Send,
        recv: C::Recv,
        side: ControlSide<C>,
    },
    /// Sender end of a content pull.
    ContentSend {
        send: C::Send,
        recv: C::Recv,
        sender: Arc<Sender>,
    },
    /// Receiver end of a content pull. The permit holds a pull slot until
    /// the stream is done.
    ContentReceive {
        send: C::Send,
        recv: C::Recv,
        context: Arc<TransferContext>,
        receiver: Arc<Receiver>,
        permit: OwnedSemaphorePermit,
    },
}

impl<C: Connection> StreamRole<C> {
    pub fn name(&self) -> &'static str {
        match self {
            StreamRole::Control {
                side: ControlSide::Advertise { .. },
                ..
            } => "control (sender)",
            StreamRole::Control {
                side: ControlSide::Consume { .. },
                ..
            } => "control (receiver)",
            StreamRole::ContentSend { .. } => "content (sender)",
            StreamRole::ContentReceive { .. } => "content (receiver)",
        }
    }

    /// Run the stream to completion.
    pub fn drive(self) -> RoleFuture {
        match self {
            StreamRole::Control {
                send,
                recv,
                side: ControlSide::Advertise { sender, scanner },
            } => Box::pin(advertise_inventory(send, recv, sender, scanner)),
            StreamRole::Control {
                send,
                recv,
                side: ControlSide::Consume { receiver, conn },
            } => Box::pin(consume_inventory(send, recv, receiver, conn)),
            StreamRole::ContentSend { send, recv, sender } => Box::pin(async move {
                let state = sender.serve_pull(send, recv).await?;
                tracing::debug!(
                    "Pull served: {} bytes, peak {} chunks in flight",
                    state.read_cursor,
                    state.peak
                );
                Ok(())
            }),
            StreamRole::ContentReceive {
                send,
                recv,
                context,
                receiver,
                permit,
            } => Box::pin(async move {
                let result = receiver
                    .receive_content(Arc::clone(&context), send, recv)
                    .await;
                receiver.record_pull(&context, &result);
                drop(permit);
                result.map(|_| ())
            }),
        }
    }
}

fn log_joined(joined: std::result::Result<Result<()>, JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        // Already logged by the stream task.
        Ok(Err(e)) => tracing::debug!("Stream finished with error: {}", e),
        Err(e) => tracing::warn!("Stream task failed: {}", e),
    }
}

// =============================================================================
// Sender session
// =============================================================================

async fn advertise_inventory<S, R>(
    mut send: S,
    mut recv: R,
    sender: Arc<Sender>,
    scanner: Scanner,
) -> Result<()>
where
    S: SendHalf,
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let (tx, mut rx) = record_channel();
    let scan = tokio::task::spawn_blocking(move || {
        let ids = IdAllocator::new();
        scanner.scan(&ids, |record| {
            tx.blocking_send(record)
                .map_err(|_| SyncError::Transport("inventory stream closed".to_string()))
        })
    });

    let inventory = sender.inventory();
    let outcome = tokio::try_join!(
        inventory.advertise_all(&mut send, &mut rx),
        inventory.service_acks(&mut recv),
    );
    drop(rx);
    let scanned = scan
        .await
        .map_err(|e| SyncError::Transport(format!("scan task failed: {}", e)))?;

    let (advertised, acked) = match outcome {
        Ok(counts) => counts,
        Err(e) => {
            send.abort(ABORT_CODE);
            return Err(e);
        }
    };
    let summary = scanned?;
    tracing::info!(
        "Inventory closed: {} of {} scanned records advertised, {} acknowledged",
        advertised,
        summary.records(),
        acked
    );
    Ok(())
}

/// Run the sending side of a session: advertise everything under the
/// scanner's root and serve content pulls until the receiver closes its
/// side of the control stream, then close the connection.
pub async fn run_sender<C: Connection>(
    conn: Arc<C>,
    sender: Arc<Sender>,
    scanner: Scanner,
) -> Result<SyncStats> {
    let root = scanner.root().to_path_buf();
    let meta = tokio::fs::metadata(&root)
        .await
        .map_err(|e| SyncError::io_path(&root, e))?;
    if !meta.is_dir() {
        return Err(SyncError::InvalidPath(format!(
            "{} is not a directory",
            root.display()
        )));
    }

    let (send, recv) = conn.open_stream().await?;
    tracing::info!("Syncing {} to {}", root.display(), conn.peer());
    let control = StreamRole::<C>::Control {
        send,
        recv,
        side: ControlSide::Advertise {
            sender: Arc::clone(&sender),
            scanner,
        },
    };
    let mut control = tokio::spawn(control.drive());

    let mut content = JoinSet::new();
    let mut accepting = true;
    let control_result = loop {
        tokio::select! {
            joined = &mut control => break joined,
            accepted = conn.accept_stream(), if accepting => match accepted {
                Ok(Some((send, recv))) => {
                    let role = StreamRole::<C>::ContentSend {
                        send,
                        recv,
                        sender: Arc::clone(&sender),
                    };
                    content.spawn(role.drive());
                }
                Ok(None) => accepting = false,
                Err(e) => {
                    tracing::warn!("Failed to accept content stream: {}", e);
                    accepting = false;
                }
            },
        }
        while let Some(joined) = content.try_join_next() {
            log_joined(joined);
        }
    };

    while let Some(joined) = content.join_next().await {
        log_joined(joined);
    }

    let result = control_result
        .map_err(|e| SyncError::Transport(format!("control task failed: {}", e)))
        .and_then(|r| r);
    match result {
        Ok(()) => {
            let leftover = sender.inventory().pending().len();
            if leftover > 0 {
                tracing::warn!("{} records were never acknowledged or pulled", leftover);
            }
            conn.close(DONE_CODE, "done");
            let stats = sender.counters().snapshot();
            tracing::info!(
                "Sync complete: {} records, {} pulls, {} bytes sent",
                stats.records_advertised,
                stats.pulls_served,
                stats.bytes_transferred
            );
            Ok(stats)
        }
        Err(e) => {
            tracing::error!("Sync aborted: {}", e);
            conn.close(ABORT_CODE, "aborted");
            Err(e)
        }
    }
}

// =============================================================================
// Receiver session
// =============================================================================

async fn consume_inventory<C: Connection>(
    mut send: C::Send,
    mut recv: C::Recv,
    receiver: Arc<Receiver>,
    conn: Arc<C>,
) -> Result<()> {
    let limits = FrameLimits::with_max(receiver.config().max_frame_len);
    let mut reasm = Reassembler::new(limits);
    let mut buf = vec![0u8; CONTROL_READ_SIZE];
    let mut items: Vec<Reassembled> = Vec::new();
    let mut pulls = JoinSet::new();

    loop {
        let n = recv
            .read(&mut buf)
            .await
            .map_err(|e| SyncError::Transport(format!("control stream failed: {}", e)))?;
        if n == 0 {
            break;
        }
        reasm.feed(&[&buf[..n]], |item| items.push(item));

        for item in items.drain(..) {
            let payload = match item.into_frame() {
                Ok(payload) => payload,
                Err(e) => {
                    receiver.counters().incr(Counter::FramesDiscarded);
                    tracing::warn!("Dropped control frame: {}", e);
                    continue;
                }
            };
            let record = match receiver.decode(&payload) {
                Ok(record) => record,
                Err(e) => {
                    receiver.counters().incr(Counter::FilesErr);
                    tracing::warn!("Undecodable record ({} bytes): {}", payload.len(), e);
                    continue;
                }
            };
            match receiver.handle_record(record).await? {
                Disposition::Ack(id) => send.write_all(&encode_ack(id)).await?,
                Disposition::Pull(context) => {
                    let permit = receiver.acquire_pull_slot().await?;
                    let (content_send, content_recv) = conn.open_stream().await?;
                    let role = StreamRole::<C>::ContentReceive {
                        send: content_send,
                        recv: content_recv,
                        context,
                        receiver: Arc::clone(&receiver),
                        permit,
                    };
                    pulls.spawn(role.drive());
                }
            }
        }
        while let Some(joined) = pulls.try_join_next() {
            log_joined(joined);
        }
    }

    if !reasm.at_boundary() {
        tracing::warn!("Control stream ended inside a frame");
    }
    tracing::debug!(
        "Inventory received: {} frames, {} discarded",
        reasm.frames(),
        reasm.discarded()
    );

    while let Some(joined) = pulls.join_next().await {
        log_joined(joined);
    }
    let dirs = receiver.finish_dirs().await?;
    tracing::debug!("Restored mtimes on {} directories", dirs);
    send.shutdown().await?;
    Ok(())
}

/// Run the receiving side of a session until the sender closes the
/// connection.
pub async fn run_receiver<C: Connection>(conn: Arc<C>, receiver: Arc<Receiver>) -> Result<SyncStats> {
    let Some((send, recv)) = conn.accept_stream().await? else {
        return Err(SyncError::Transport(
            "connection closed before the control stream opened".to_string(),
        ));
    };
    tracing::info!(
        "Receiving from {} into {}",
        conn.peer(),
        receiver.config().root.display()
    );

    let control = StreamRole::<C>::Control {
        send,
        recv,
        side: ControlSide::Consume {
            receiver: Arc::clone(&receiver),
            conn: Arc::clone(&conn),
        },
    };
    if let Err(e) = control.drive().await {
        tracing::error!("Session with {} failed: {}", conn.peer(), e);
        conn.close(ABORT_CODE, "aborted");
        return Err(e);
    }

    conn.closed().await;
    let stats = receiver.stats();
    tracing::info!(
        "Sync complete: {} files committed ({} bytes), {} current, {} dirs, {} symlinks, {} errors",
        stats.files_ok,
        stats.bytes_transferred,
        stats.files_current,
        stats.dirs_created,
        stats.symlinks_created,
        stats.files_err
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::streaming::frame::encode_frame;
    use crate::streaming::protocol::{BincodeCodec, Record, RecordCodec, Timestamp};
    use crate::streaming::receiver::ReceiverConfig;
    use crate::streaming::sender::SenderConfig;
    use crate::transport::MemoryConnection;
    use std::fs;
    use tempfile::TempDir;

    fn endpoints(src: &TempDir, dst: &TempDir) -> (Arc<Sender>, Arc<Receiver>) {
        let config = Config::default();
        let codec: Arc<dyn RecordCodec> = Arc::new(BincodeCodec);
        let sender = Sender::new(SenderConfig::new(src.path(), &config), Arc::clone(&codec)).unwrap();
        let receiver = Receiver::new(ReceiverConfig::new(dst.path(), &config), codec).unwrap();
        (Arc::new(sender), Arc::new(receiver))
    }

    #[tokio::test]
    async fn test_session_over_memory() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::create_dir(src.path().join("d")).unwrap();
        fs::write(src.path().join("d/x.txt"), b"xxx").unwrap();
        fs::write(src.path().join("big.bin"), vec![7u8; 300_000]).unwrap();

        let (sender, receiver) = endpoints(&src, &dst);
        let (client, server) = MemoryConnection::pair();
        let recv_task = tokio::spawn(run_receiver(Arc::new(server), receiver));
        let sent = run_sender(Arc::new(client), sender.clone(), Scanner::new(src.path()))
            .await
            .unwrap();
        let received = recv_task.await.unwrap().unwrap();

        assert_eq!(sent.records_advertised, 3);
        assert_eq!(sent.acks_received, 1);
        assert_eq!(sent.pulls_served, 2);
        assert_eq!(received.files_ok, 2);
        assert_eq!(received.dirs_created, 1);
        assert_eq!(received.bytes_transferred, 300_003);
        assert!(sender.inventory().pending().is_empty());
        assert_eq!(fs::read(dst.path().join("d/x.txt")).unwrap(), b"xxx");
        assert_eq!(fs::read(dst.path().join("big.bin")).unwrap().len(), 300_000);
    }

    #[tokio::test]
    async fn test_empty_source() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let (sender, receiver) = endpoints(&src, &dst);
        let (client, server) = MemoryConnection::pair();
        let recv_task = tokio::spawn(run_receiver(Arc::new(server), receiver));
        let sent = run_sender(Arc::new(client), sender, Scanner::new(src.path()))
            .await
            .unwrap();
        let received = recv_task.await.unwrap().unwrap();
        assert_eq!(sent.records_advertised, 0);
        assert_eq!(received, SyncStats::default());
    }

    #[tokio::test]
    async fn test_missing_source_fails_before_connecting() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let (sender, _) = endpoints(&src, &dst);
        let (client, _server) = MemoryConnection::pair();
        let result = run_sender(Arc::new(client), sender, Scanner::new(src.path().join("nope"))).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_receiver_skips_oversized_and_garbage_frames() {
        let dst = TempDir::new().unwrap();
        let mut config = Config::default();
        config.max_frame_len = 256;
        let receiver = Arc::new(
            Receiver::new(ReceiverConfig::new(dst.path(), &config), Arc::new(BincodeCodec)).unwrap(),
        );
        let (client, server) = MemoryConnection::pair();
        let client = Arc::new(client);
        let recv_task = tokio::spawn(run_receiver(Arc::new(server), Arc::clone(&receiver)));

        let (mut send, mut recv) = client.open_stream().await.unwrap();
        let good = BincodeCodec
            .encode(&Record::dir(7, "kept", Timestamp::new(1_600_000_000, 0)))
            .unwrap();
        send.write_all(&encode_frame(&vec![0u8; 1000]).unwrap()).await.unwrap();
        send.write_all(&encode_frame(b"not a record").unwrap()).await.unwrap();
        send.write_all(&encode_frame(&good).unwrap()).await.unwrap();
        send.shutdown().await.unwrap();

        let mut acks = Vec::new();
        recv.read_to_end(&mut acks).await.unwrap();
        assert_eq!(acks, encode_ack(7).to_vec());
        client.close(DONE_CODE, "done");

        let stats = recv_task.await.unwrap().unwrap();
        assert_eq!(stats.frames_discarded, 1);
        assert_eq!(stats.files_err, 1);
        assert_eq!(stats.dirs_created, 1);
        assert!(dst.path().join("kept").is_dir());
    }
}
