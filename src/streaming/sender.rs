//! Sender side of content pulls.
//!
//! The receiver opens one stream per file it wants and writes the record id.
//! The sender takes the id out of the pending table and streams the file
//! back through a self-feeding pipeline: a writer task owns the stream and
//! reports each completed send, and the driver reads the next chunk on the
//! read pool only while fewer than `max_outstanding_sends` chunks are in
//! flight.

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::pool::WorkerPool;
use crate::streaming::channel::{Counter, StatsCounters, ABORT_CODE};
use crate::streaming::decision::resolve;
use crate::streaming::inventory::Inventory;
use crate::streaming::protocol::{decode_id, RecordCodec, RecordKind, ID_LEN};
use crate::transport::SendHalf;
use bytes::Bytes;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

/// Sender configuration
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Root path for reading files
    pub root: PathBuf,
    /// Bytes per content read
    pub chunk_size: usize,
    /// Chunks in flight per file
    pub max_outstanding_sends: usize,
    /// Threads in the read pool
    pub read_workers: usize,
}

impl SenderConfig {
    pub fn new(root: impl Into<PathBuf>, config: &Config) -> Self {
        Self {
            root: root.into(),
            chunk_size: config.chunk_size,
            max_outstanding_sends: config.max_outstanding_sends,
            read_workers: config.read_workers,
        }
    }
}

/// Progress of one file through the send pipeline.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SendPipelineState {
    /// Bytes read from the file so far
    pub read_cursor: u64,
    /// Chunks handed to the stream and not yet completed
    pub outstanding: usize,
    pub end_of_file: bool,
    /// Highest `outstanding` observed
    pub peak: usize,
}

pub struct Sender {
    config: SenderConfig,
    codec: Arc<dyn RecordCodec>,
    read_pool: WorkerPool,
    inventory: Inventory,
    stats: Arc<StatsCounters>,
}

impl Sender {
    pub fn new(config: SenderConfig, codec: Arc<dyn RecordCodec>) -> Result<Self> {
        let read_pool = WorkerPool::new("io-read", config.read_workers)?;
        let stats = Arc::new(StatsCounters::new());
        let inventory = Inventory::new(Arc::clone(&codec), Arc::clone(&stats));
        Ok(Self {
            config,
            codec,
            read_pool,
            inventory,
            stats,
        })
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn counters(&self) -> &StatsCounters {
        &self.stats
    }

    /// Serve one content pull. An unknown id aborts this stream only.
    pub async fn serve_pull<S, R>(&self, mut send: S, mut recv: R) -> Result<SendPipelineState>
    where
        S: SendHalf,
        R: AsyncRead + Unpin + Send,
    {
        let mut raw = [0u8; ID_LEN];
        recv.read_exact(&mut raw).await.map_err(|e| {
            SyncError::Transport(format!("content stream closed before its id: {}", e))
        })?;
        let id = decode_id(&raw).ok_or_else(|| SyncError::Codec("bad id".to_string()))?;

        let encoded = match self.inventory.pending().take(id) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("Rejecting content pull: {}", e);
                send.abort(ABORT_CODE);
                return Err(e);
            }
        };

        let opened = self.open_source(&encoded).await;
        let (path, file) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                tracing::warn!("Cannot serve record {}: {}", id, e);
                self.stats.incr(Counter::FilesErr);
                send.abort(ABORT_CODE);
                return Err(e);
            }
        };

        tracing::debug!("Sending {} for record {}", path.display(), id);
        match stream_file(
            file,
            send,
            &self.read_pool,
            self.config.chunk_size,
            self.config.max_outstanding_sends,
        )
        .await
        {
            Ok(state) => {
                self.stats.incr(Counter::PullsServed);
                self.stats.add(Counter::BytesTransferred, state.read_cursor);
                Ok(state)
            }
            Err(e) => {
                tracing::warn!("Failed to send {}: {}", path.display(), e);
                self.stats.incr(Counter::FilesErr);
                Err(e)
            }
        }
    }

    async fn open_source(&self, encoded: &Bytes) -> Result<(PathBuf, File)> {
        let record = self.codec.decode(encoded)?;
        if record.kind != RecordKind::File {
            return Err(SyncError::Codec(format!(
                "record {} ({}) is not a regular file",
                record.id, record.path
            )));
        }
        let path = resolve(&self.config.root, &record.path)?;
        let open_path = path.clone();
        let file = self
            .read_pool
            .run(move || File::open(&open_path))
            .await?
            .map_err(|e| SyncError::io_path(&path, e))?;
        Ok((path, file))
    }
}

/// Fill `buf` from `file`, stopping early only at end of file.
fn read_chunk(file: &mut File, chunk_size: usize) -> io::Result<Bytes> {
    let mut buf = vec![0u8; chunk_size];
    let mut filled = 0;
    while filled < chunk_size {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(Bytes::from(buf))
}

/// Stream `file` into `writer`, finishing the stream after the last chunk.
///
/// A short read marks end of file; a file whose size is a multiple of
/// `chunk_size` ends with an empty final chunk. On failure the stream is
/// aborted so the peer never mistakes a truncated file for a complete one.
pub async fn stream_file<W>(
    file: File,
    writer: W,
    pool: &WorkerPool,
    chunk_size: usize,
    max_outstanding: usize,
) -> Result<SendPipelineState>
where
    W: SendHalf,
{
    let max_outstanding = max_outstanding.max(1);
    let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<(Bytes, bool)>();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<io::Result<()>>();

    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some((chunk, last)) = chunk_rx.recv().await {
            let mut res = writer.write_all(&chunk).await;
            if res.is_ok() && last {
                res = writer.shutdown().await;
            }
            let failed = res.is_err();
            if done_tx.send(res).is_err() || failed {
                break;
            }
        }
        writer
    });

    let mut state = SendPipelineState::default();
    let mut file = Some(file);
    let result: Result<()> = async {
        loop {
            while !state.end_of_file && state.outstanding < max_outstanding {
                let Some(mut f) = file.take() else { break };
                let (f, chunk) = pool
                    .run(move || {
                        let chunk = read_chunk(&mut f, chunk_size);
                        (f, chunk)
                    })
                    .await?;
                file = Some(f);
                let chunk = chunk?;
                state.end_of_file = chunk.len() < chunk_size;
                state.read_cursor += chunk.len() as u64;
                chunk_tx
                    .send((chunk, state.end_of_file))
                    .map_err(|_| SyncError::Transport("content writer stopped".to_string()))?;
                state.outstanding += 1;
                state.peak = state.peak.max(state.outstanding);
            }
            if state.outstanding == 0 {
                return Ok(());
            }
            match done_rx.recv().await {
                Some(Ok(())) => state.outstanding -= 1,
                Some(Err(e)) => {
                    return Err(SyncError::Transport(format!("content send failed: {}", e)))
                }
                None => return Err(SyncError::Transport("content writer stopped".to_string())),
            }
        }
    }
    .await;

    drop(chunk_tx);
    match writer_task.await {
        Ok(mut writer) if result.is_err() => writer.abort(ABORT_CODE),
        Ok(_) => {}
        Err(e) => tracing::warn!("Content writer task failed: {}", e),
    }
    result.map(|()| state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::protocol::{encode_id, BincodeCodec, Record, Timestamp};
    use tokio::io::AsyncWrite;
    use std::fs;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};
    use tempfile::TempDir;

    /// Collects bytes, at most 1000 per write, and remembers whether it was
    /// shut down.
    struct SlowSink {
        received: Arc<std::sync::Mutex<Vec<u8>>>,
        finished: Arc<AtomicBool>,
    }

    impl AsyncWrite for SlowSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let n = buf.len().min(1000);
            self.received.lock().unwrap().extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.finished.store(true, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }

    struct RecordingSend {
        inner: tokio::io::DuplexStream,
        aborted: Arc<AtomicBool>,
    }

    impl SendHalf for SlowSink {
        fn abort(&mut self, _code: u32) {}
    }

    impl AsyncWrite for RecordingSend {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    impl SendHalf for RecordingSend {
        fn abort(&mut self, _code: u32) {
            self.aborted.store(true, Ordering::SeqCst);
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn run_pipeline(len: usize, chunk: usize, bound: usize) -> (SendPipelineState, Vec<u8>, bool) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("src.bin");
        fs::write(&path, pattern(len)).unwrap();

        let received = Arc::new(std::sync::Mutex::new(Vec::new()));
        let finished = Arc::new(AtomicBool::new(false));
        let sink = SlowSink {
            received: received.clone(),
            finished: finished.clone(),
        };
        let pool = WorkerPool::new("io-read", 2).unwrap();
        let state = stream_file(File::open(&path).unwrap(), sink, &pool, chunk, bound)
            .await
            .unwrap();
        let bytes = received.lock().unwrap().clone();
        (state, bytes, finished.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_pipeline_never_exceeds_bound() {
        let (state, bytes, finished) = run_pipeline(1024 * 1024 + 17, 4096, 4).await;
        assert!(state.peak <= 4, "peak {} exceeded bound", state.peak);
        assert!(state.peak >= 1);
        assert_eq!(state.outstanding, 0);
        assert!(state.end_of_file);
        assert_eq!(state.read_cursor, 1024 * 1024 + 17);
        assert_eq!(bytes, pattern(1024 * 1024 + 17));
        assert!(finished);
    }

    #[tokio::test]
    async fn test_pipeline_bound_of_one() {
        let (state, bytes, _) = run_pipeline(50_000, 1000, 1).await;
        assert_eq!(state.peak, 1);
        assert_eq!(bytes.len(), 50_000);
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_with_empty_chunk() {
        let (state, bytes, finished) = run_pipeline(8192, 4096, 4).await;
        assert_eq!(state.read_cursor, 8192);
        assert_eq!(bytes.len(), 8192);
        assert!(finished);
    }

    #[tokio::test]
    async fn test_empty_file() {
        let (state, bytes, finished) = run_pipeline(0, 4096, 4).await;
        assert_eq!(state.read_cursor, 0);
        assert!(bytes.is_empty());
        assert!(finished);
    }

    fn sender_for(root: &std::path::Path) -> Sender {
        let mut config = SenderConfig::new(root, &Config::default());
        config.read_workers = 1;
        Sender::new(config, Arc::new(BincodeCodec)).unwrap()
    }

    #[tokio::test]
    async fn test_serve_pull_streams_file_and_retires_id() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "hello").unwrap();
        let sender = sender_for(tmp.path());

        let mut sink = Vec::new();
        sender
            .inventory()
            .advertise(&mut sink, &Record::file(1, "a.txt", 5, Timestamp::new(0, 0)))
            .await
            .unwrap();

        let (send, mut peer) = tokio::io::duplex(64);
        let aborted = Arc::new(AtomicBool::new(false));
        let send = RecordingSend {
            inner: send,
            aborted: aborted.clone(),
        };
        let id = encode_id(1);
        // Id arrives in two pieces.
        let recv = AsyncReadExt::chain(&id[..3], &id[3..]);

        let state = sender.serve_pull(send, recv).await.unwrap();
        assert_eq!(state.read_cursor, 5);
        let mut out = Vec::new();
        peer.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
        assert!(!aborted.load(Ordering::SeqCst));
        assert!(sender.inventory().pending().is_empty());
        assert_eq!(sender.counters().snapshot().pulls_served, 1);
    }

    #[tokio::test]
    async fn test_unknown_id_aborts_stream() {
        let tmp = TempDir::new().unwrap();
        let sender = sender_for(tmp.path());
        let (send, _peer) = tokio::io::duplex(64);
        let aborted = Arc::new(AtomicBool::new(false));
        let send = RecordingSend {
            inner: send,
            aborted: aborted.clone(),
        };
        let id = encode_id(42);
        let err = sender.serve_pull(send, &id[..]).await.unwrap_err();
        assert!(matches!(err, SyncError::UnknownId { id: 42 }));
        assert!(err.is_fatal());
        assert!(aborted.load(Ordering::SeqCst));
    }
}
