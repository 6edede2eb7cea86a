use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("I/O error on {path}: {source}")]
    IoPath {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// An id was advertised while a record with the same id was still pending.
    #[error("Duplicate record id {id} while still pending")]
    DuplicateId { id: u64 },

    /// A content pull named an id that was never advertised or was already retired.
    #[error("Pull request for unknown or retired record id {id}")]
    UnknownId { id: u64 },

    #[error("Discarded {len}-byte frame: {reason}")]
    FrameDiscarded { len: u32, reason: String },

    #[error("Record codec error: {0}")]
    Codec(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Destination {path} changed during transfer, keeping existing file")]
    ModifiedDuringTransfer { path: PathBuf },

    #[error("Received {actual} bytes for {path}, expected {expected}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker pool is shut down")]
    WorkerPoolClosed,
}

impl SyncError {
    pub fn io_path(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SyncError::IoPath {
            path: path.into(),
            source,
        }
    }

    /// Protocol violations abort the affected stream or session.
    /// Everything else only affects a single record.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::DuplicateId { .. } | SyncError::UnknownId { .. }
        )
    }

    /// Integrity aborts leave the previous destination file untouched.
    pub fn is_integrity_abort(&self) -> bool {
        matches!(
            self,
            SyncError::ModifiedDuringTransfer { .. } | SyncError::SizeMismatch { .. }
        )
    }
}

impl From<bincode::Error> for SyncError {
    fn from(e: bincode::Error) -> Self {
        SyncError::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
