//! Receiver side of a sync session.
//!
//! Decides what to do with each advertised record, materializes directories
//! and symlinks, and pulls file content into `<destination>.<suffix>` before
//! committing it with a rename. Every filesystem call runs on the write pool.

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::pool::WorkerPool;
use crate::streaming::channel::{Counter, StatsCounters, SyncStats};
use crate::streaming::decision::{decide, resolve, Decision, Snapshot};
use crate::streaming::protocol::{encode_id, Record, RecordCodec, RecordKind, Timestamp};
use crate::temp_file::TempFileGuard;
use bytes::BytesMut;
use filetime::FileTime;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Receiver configuration
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Root path for writing files
    pub root: PathBuf,
    /// Read size on content streams
    pub chunk_size: usize,
    /// Largest record frame accepted on the control stream
    pub max_frame_len: u32,
    /// Content streams open at once
    pub max_concurrent_pulls: usize,
    /// Extension for in-progress files
    pub temp_suffix: String,
    /// Threads in the write pool
    pub write_workers: usize,
}

impl ReceiverConfig {
    pub fn new(root: impl Into<PathBuf>, config: &Config) -> Self {
        Self {
            root: root.into(),
            chunk_size: config.chunk_size,
            max_frame_len: config.max_frame_len,
            max_concurrent_pulls: config.max_concurrent_pulls,
            temp_suffix: config.temp_suffix.clone(),
            write_workers: config.write_workers,
        }
    }
}

/// `dir/a.txt` -> `dir/a.txt.qsync`
pub fn temp_path_for(destination: &Path, suffix: &str) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

// =============================================================================
// Transfer context
// =============================================================================

#[derive(Debug, Default)]
struct WriteState {
    file: Option<File>,
    guard: Option<TempFileGuard>,
    bytes_written: u64,
    finished: bool,
}

/// Per-file state of one content pull.
///
/// Shared through `Arc` by the stream task and whichever write job is in
/// flight. Dropping the last reference tears the transfer down, removing the
/// temp file unless it was committed.
#[derive(Debug)]
pub struct TransferContext {
    id: u64,
    destination: PathBuf,
    temp_path: PathBuf,
    advertised_size: u64,
    advertised_mtime: Timestamp,
    snapshot: Option<Snapshot>,
    state: Mutex<WriteState>,
}

impl TransferContext {
    pub fn new(
        id: u64,
        destination: PathBuf,
        temp_path: PathBuf,
        advertised_size: u64,
        advertised_mtime: Timestamp,
        snapshot: Option<Snapshot>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            destination,
            temp_path,
            advertised_size,
            advertised_mtime,
            snapshot,
            state: Mutex::new(WriteState::default()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn existed_before(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn bytes_written(&self) -> u64 {
        self.lock().bytes_written
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    fn lock(&self) -> MutexGuard<'_, WriteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one delivery from the content stream. Blocking; runs on the
    /// write pool. `fin` marks the last delivery, which commits the file and
    /// returns the committed byte count.
    ///
    /// Any error abandons the transfer and removes the temp file.
    pub fn deliver(&self, data: &[u8], fin: bool) -> Result<Option<u64>> {
        let mut state = self.lock();
        if state.finished {
            return Err(SyncError::Transport(format!(
                "data for {} after the transfer finished",
                self.destination.display()
            )));
        }
        let result = self.apply(&mut state, data, fin);
        if result.is_err() {
            state.finished = true;
            state.file.take();
            state.guard.take();
        }
        result
    }

    fn apply(&self, state: &mut WriteState, data: &[u8], fin: bool) -> Result<Option<u64>> {
        if !data.is_empty() {
            if state.file.is_none() {
                let file = self.open_temp(&mut state.guard)?;
                state.file = Some(file);
            }
            if let Some(file) = state.file.as_mut() {
                file.write_all(data)
                    .map_err(|e| SyncError::io_path(&self.temp_path, e))?;
            }
            state.bytes_written += data.len() as u64;
        }
        if !fin {
            return Ok(None);
        }
        state.finished = true;
        self.commit(state).map(Some)
    }

    /// Create or truncate the temp file beside the destination.
    fn open_temp(&self, guard: &mut Option<TempFileGuard>) -> Result<File> {
        if let Some(parent) = self.destination.parent() {
            fs::create_dir_all(parent).map_err(|e| SyncError::io_path(parent, e))?;
        }
        *guard = Some(TempFileGuard::new(&self.temp_path));
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.temp_path)
            .map_err(|e| SyncError::io_path(&self.temp_path, e))
    }

    fn commit(&self, state: &mut WriteState) -> Result<u64> {
        let file = match state.file.take() {
            Some(file) => file,
            // Nothing was delivered: an empty file.
            None => self.open_temp(&mut state.guard)?,
        };
        file.sync_all()
            .map_err(|e| SyncError::io_path(&self.temp_path, e))?;
        drop(file);

        // Dropped on every early return below, which removes the temp file.
        let guard = state.guard.take();

        if let Some(snapshot) = self.snapshot {
            let current = fs::symlink_metadata(&self.destination)
                .ok()
                .map(|meta| Snapshot::of(&meta));
            if current != Some(snapshot) {
                return Err(SyncError::ModifiedDuringTransfer {
                    path: self.destination.clone(),
                });
            }
        }

        if state.bytes_written != self.advertised_size {
            return Err(SyncError::SizeMismatch {
                path: self.destination.clone(),
                expected: self.advertised_size,
                actual: state.bytes_written,
            });
        }

        // A directory in the way was part of the snapshot, so it goes too.
        if fs::symlink_metadata(&self.destination).map_or(false, |meta| meta.is_dir()) {
            fs::remove_dir_all(&self.destination)
                .map_err(|e| SyncError::io_path(&self.destination, e))?;
        }
        fs::rename(&self.temp_path, &self.destination)
            .map_err(|e| SyncError::io_path(&self.destination, e))?;
        if let Some(guard) = guard {
            guard.defuse();
        }

        if let Err(e) = filetime::set_file_mtime(&self.destination, FileTime::from(self.advertised_mtime)) {
            tracing::warn!(
                "Failed to set mtime on {}: {}",
                self.destination.display(),
                e
            );
        }
        Ok(state.bytes_written)
    }
}

impl Drop for TransferContext {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        // Close before the guard unlinks the file.
        state.file.take();
        if state.guard.take().is_some() && !state.finished {
            tracing::debug!(
                "Abandoned transfer of {} after {} bytes",
                self.destination.display(),
                state.bytes_written
            );
        }
    }
}

// =============================================================================
// Receiver
// =============================================================================

/// What the control stream should do with a record.
#[derive(Debug)]
pub enum Disposition {
    /// Resolved locally; acknowledge the id.
    Ack(u64),
    /// Pull the content on a new stream.
    Pull(Arc<TransferContext>),
}

pub struct Receiver {
    config: ReceiverConfig,
    codec: Arc<dyn RecordCodec>,
    write_pool: WorkerPool,
    pulls: Arc<Semaphore>,
    dir_times: Arc<Mutex<Vec<(PathBuf, Timestamp)>>>,
    stats: Arc<StatsCounters>,
}

impl Receiver {
    pub fn new(config: ReceiverConfig, codec: Arc<dyn RecordCodec>) -> Result<Self> {
        let write_pool = WorkerPool::new("io-write", config.write_workers)?;
        let pulls = Arc::new(Semaphore::new(config.max_concurrent_pulls.max(1)));
        Ok(Self {
            config,
            codec,
            write_pool,
            pulls,
            dir_times: Arc::new(Mutex::new(Vec::new())),
            stats: Arc::new(StatsCounters::new()),
        })
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.snapshot()
    }

    pub fn counters(&self) -> &StatsCounters {
        &self.stats
    }

    pub fn decode(&self, payload: &[u8]) -> Result<Record> {
        self.codec.decode(payload)
    }

    /// Wait for a free content stream slot.
    pub async fn acquire_pull_slot(&self) -> Result<OwnedSemaphorePermit> {
        self.pulls
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SyncError::Transport("pull limiter closed".to_string()))
    }

    /// Decide on `record` and carry out everything except a content pull.
    pub async fn handle_record(&self, record: Record) -> Result<Disposition> {
        let root = self.config.root.clone();
        let suffix = self.config.temp_suffix.clone();
        let stats = Arc::clone(&self.stats);
        let dir_times = Arc::clone(&self.dir_times);
        self.write_pool
            .run(move || dispose(&root, &suffix, record, &stats, &dir_times))
            .await
    }

    /// Run a content pull: send the id, then write every delivery before
    /// reading the next one. Returns the committed byte count.
    pub async fn receive_content<S, R>(
        &self,
        ctx: Arc<TransferContext>,
        mut send: S,
        mut recv: R,
    ) -> Result<u64>
    where
        S: AsyncWrite + Unpin + Send,
        R: AsyncRead + Unpin + Send,
    {
        send.write_all(&encode_id(ctx.id())).await?;
        send.shutdown().await?;

        let chunk_size = self.config.chunk_size;
        let mut buf = BytesMut::with_capacity(chunk_size);
        loop {
            buf.reserve(chunk_size);
            let n = recv.read_buf(&mut buf).await.map_err(|e| {
                SyncError::Transport(format!(
                    "content stream for {} failed: {}",
                    ctx.destination().display(),
                    e
                ))
            })?;
            let fin = n == 0;
            let data = buf.split().freeze();
            let job = Arc::clone(&ctx);
            if let Some(bytes) = self.write_pool.run(move || job.deliver(&data, fin)).await?? {
                return Ok(bytes);
            }
        }
    }

    /// Record the outcome of a finished pull.
    pub fn record_pull(&self, ctx: &TransferContext, result: &Result<u64>) {
        match result {
            Ok(bytes) => {
                self.stats.incr(Counter::FilesOk);
                self.stats.add(Counter::BytesTransferred, *bytes);
                tracing::debug!(
                    "Committed {} ({} bytes)",
                    ctx.destination().display(),
                    bytes
                );
            }
            Err(e) => {
                self.stats.incr(Counter::FilesErr);
                tracing::warn!("Transfer of {} (id {}) failed: {}", ctx.destination().display(), ctx.id(), e);
            }
        }
    }

    /// Re-apply directory mtimes disturbed by entries created inside them.
    pub async fn finish_dirs(&self) -> Result<usize> {
        let dirs = std::mem::take(&mut *self.dir_times.lock().unwrap_or_else(PoisonError::into_inner));
        self.write_pool
            .run(move || {
                for (path, mtime) in dirs.iter().rev() {
                    if let Err(e) = filetime::set_file_mtime(path, FileTime::from(*mtime)) {
                        tracing::warn!("Failed to set mtime on {}: {}", path.display(), e);
                    }
                }
                dirs.len()
            })
            .await
    }
}

/// Decision plus the immediate actions. Runs on the write pool.
fn dispose(
    root: &Path,
    temp_suffix: &str,
    record: Record,
    stats: &StatsCounters,
    dir_times: &Mutex<Vec<(PathBuf, Timestamp)>>,
) -> Disposition {
    let id = record.id;
    match decide(root, &record) {
        Decision::Unreachable(e) => {
            tracing::warn!("Skipping {} (id {}): {}", record.path, id, e);
            stats.incr(Counter::FilesErr);
        }
        Decision::Current => {
            tracing::debug!("{} is up to date", record.path);
            stats.incr(Counter::FilesCurrent);
        }
        Decision::CreateDir => match create_dir(root, &record) {
            Ok(path) => {
                stats.incr(Counter::DirsCreated);
                dir_times
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((path, record.mtime));
            }
            Err(e) => {
                tracing::warn!("Failed to create directory {}: {}", record.path, e);
                stats.incr(Counter::FilesErr);
            }
        },
        Decision::CreateSymlink => match create_symlink(root, &record) {
            Ok(()) => stats.incr(Counter::SymlinksCreated),
            Err(e) => {
                tracing::warn!("Failed to create symlink {}: {}", record.path, e);
                stats.incr(Counter::FilesErr);
            }
        },
        Decision::NeedsTransfer { snapshot } => match resolve(root, &record.path) {
            Ok(destination) => {
                let temp_path = temp_path_for(&destination, temp_suffix);
                return Disposition::Pull(TransferContext::new(
                    id,
                    destination,
                    temp_path,
                    record.size,
                    record.mtime,
                    snapshot,
                ));
            }
            Err(e) => {
                tracing::warn!("Skipping {} (id {}): {}", record.path, id, e);
                stats.incr(Counter::FilesErr);
            }
        },
    }
    Disposition::Ack(id)
}

fn create_dir(root: &Path, record: &Record) -> Result<PathBuf> {
    let path = resolve(root, &record.path)?;
    match fs::symlink_metadata(&path) {
        Ok(meta) if !meta.is_dir() => {
            fs::remove_file(&path).map_err(|e| SyncError::io_path(&path, e))?
        }
        _ => {}
    }
    fs::create_dir_all(&path).map_err(|e| SyncError::io_path(&path, e))?;
    filetime::set_file_mtime(&path, FileTime::from(record.mtime))
        .map_err(|e| SyncError::io_path(&path, e))?;
    Ok(path)
}

fn create_symlink(root: &Path, record: &Record) -> Result<()> {
    let path = resolve(root, &record.path)?;
    let target = record
        .link_target
        .as_deref()
        .ok_or_else(|| SyncError::Codec(format!("symlink {} without target", record.path)))?;

    match fs::symlink_metadata(&path) {
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir_all(&path).map_err(|e| SyncError::io_path(&path, e))?
        }
        Ok(_) => fs::remove_file(&path).map_err(|e| SyncError::io_path(&path, e))?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| SyncError::io_path(parent, e))?;
            }
        }
        Err(e) => return Err(SyncError::io_path(&path, e)),
    }

    make_symlink(target, &path, record.kind).map_err(|e| SyncError::io_path(&path, e))?;

    let mtime = FileTime::from(record.mtime);
    filetime::set_symlink_file_times(&path, mtime, mtime)
        .map_err(|e| SyncError::io_path(&path, e))?;
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &str, path: &Path, _kind: RecordKind) -> io::Result<()> {
    std::os::unix::fs::symlink(target, path)
}

#[cfg(windows)]
fn make_symlink(target: &str, path: &Path, kind: RecordKind) -> io::Result<()> {
    if kind == RecordKind::DirSymlink {
        std::os::windows::fs::symlink_dir(target, path)
    } else {
        std::os::windows::fs::symlink_file(target, path)
    }
}
