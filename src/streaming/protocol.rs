//! Records, record encoding, and the fixed wire constants.
//!
//! Wire format: all multi-byte integers are big-endian.
//!
//! Control channel (one long-lived stream, opened by the sender):
//!   sender -> receiver: frame(len:u32 | encoded Record)
//!   receiver -> sender: frame(len:u32 = 8 | id:u64)        acknowledgment
//!
//! Content channel (one stream per pulled file, opened by the receiver):
//!   receiver -> sender: id:u64, then finish
//!   sender -> receiver: raw file bytes, then finish

use crate::error::{Result, SyncError};
use bytes::Bytes;
use filetime::FileTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// ALPN token negotiated on QUIC connections.
pub const ALPN: &[u8] = b"qsync";

/// Width of a record id on the wire.
pub const ID_LEN: usize = 8;

/// Width of the frame length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

// =============================================================================
// Record
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    File,
    Dir,
    FileSymlink,
    DirSymlink,
}

impl RecordKind {
    pub fn is_symlink(self) -> bool {
        matches!(self, RecordKind::FileSymlink | RecordKind::DirSymlink)
    }
}

/// Modification time with nanosecond resolution, ordered chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub const fn new(secs: i64, nanos: u32) -> Self {
        Self { secs, nanos }
    }

    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        FileTime::from_last_modification_time(meta).into()
    }
}

impl From<FileTime> for Timestamp {
    fn from(ft: FileTime) -> Self {
        Self {
            secs: ft.unix_seconds(),
            nanos: ft.nanoseconds(),
        }
    }
}

impl From<Timestamp> for FileTime {
    fn from(ts: Timestamp) -> Self {
        FileTime::from_unix_time(ts.secs, ts.nanos)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

/// One advertised filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: u64,
    pub kind: RecordKind,
    /// Relative to the sync root, '/'-separated.
    pub path: String,
    pub size: u64,
    pub mtime: Timestamp,
    /// Present iff `kind` is a symlink kind.
    pub link_target: Option<String>,
}

impl Record {
    pub fn file(id: u64, path: impl Into<String>, size: u64, mtime: Timestamp) -> Self {
        Self {
            id,
            kind: RecordKind::File,
            path: path.into(),
            size,
            mtime,
            link_target: None,
        }
    }

    pub fn dir(id: u64, path: impl Into<String>, mtime: Timestamp) -> Self {
        Self {
            id,
            kind: RecordKind::Dir,
            path: path.into(),
            size: 0,
            mtime,
            link_target: None,
        }
    }

    pub fn symlink(
        id: u64,
        path: impl Into<String>,
        target: impl Into<String>,
        to_dir: bool,
        mtime: Timestamp,
    ) -> Self {
        Self {
            id,
            kind: if to_dir {
                RecordKind::DirSymlink
            } else {
                RecordKind::FileSymlink
            },
            path: path.into(),
            size: 0,
            mtime,
            link_target: Some(target.into()),
        }
    }

    /// Checks the kind/link_target pairing.
    pub fn validate(&self) -> Result<()> {
        if self.kind.is_symlink() != self.link_target.is_some() {
            return Err(SyncError::Codec(format!(
                "record {} ({}) has kind {:?} but link target {:?}",
                self.id, self.path, self.kind, self.link_target
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Record encoding
// =============================================================================

/// Turns records into opaque byte blobs and back.
///
/// The engine never looks inside an encoded record; it only frames it.
pub trait RecordCodec: Send + Sync + 'static {
    fn encode(&self, record: &Record) -> Result<Bytes>;
    fn decode(&self, bytes: &[u8]) -> Result<Record>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl RecordCodec for BincodeCodec {
    fn encode(&self, record: &Record) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(record)?))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Record> {
        let record: Record = bincode::deserialize(bytes)?;
        record.validate()?;
        Ok(record)
    }
}

// =============================================================================
// Ids on the wire
// =============================================================================

pub fn encode_id(id: u64) -> [u8; ID_LEN] {
    id.to_be_bytes()
}

pub fn decode_id(bytes: &[u8]) -> Option<u64> {
    let raw: [u8; ID_LEN] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(raw))
}
