//! Channel types and shared counters for a sync session.
//!
//! The scanner runs on a blocking thread and feeds records to the control
//! stream through a bounded channel, so a slow peer backs up the scan
//! instead of buffering the whole inventory.

use crate::streaming::protocol::Record;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Channel size for Scanner -> control stream (records)
pub const RECORD_CHANNEL_SIZE: usize = 1024;

/// Read buffer for the control stream
pub const CONTROL_READ_SIZE: usize = 16 * 1024;

/// Application error code used when aborting a stream or connection.
pub const ABORT_CODE: u32 = 1;

/// Application code for a clean connection close.
pub const DONE_CODE: u32 = 0;

// =============================================================================
// Channel types
// =============================================================================

/// Sender for records from the scanner
pub type RecordSender = mpsc::Sender<Record>;

/// Receiver for records on the control stream task
pub type RecordReceiver = mpsc::Receiver<Record>;

/// Create a bounded channel for Scanner -> control stream communication
pub fn record_channel() -> (RecordSender, RecordReceiver) {
    mpsc::channel(RECORD_CHANNEL_SIZE)
}

// =============================================================================
// Sync statistics
// =============================================================================

/// Statistics for one side of a sync session
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncStats {
    /// Records advertised on the control stream (sender)
    pub records_advertised: u64,

    /// Acknowledgments received (sender)
    pub acks_received: u64,

    /// Content pulls served (sender)
    pub pulls_served: u64,

    /// Content bytes sent (sender) or committed (receiver)
    pub bytes_transferred: u64,

    /// Files committed (receiver)
    pub files_ok: u64,

    /// Entries that failed or were aborted (both sides)
    pub files_err: u64,

    /// Entries already up to date (receiver)
    pub files_current: u64,

    /// Directories created or refreshed (receiver)
    pub dirs_created: u64,

    /// Symlinks created (receiver)
    pub symlinks_created: u64,

    /// Frames skipped as malformed (both sides)
    pub frames_discarded: u64,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Lock-free counters updated from stream tasks and pool workers.
#[derive(Debug, Default)]
pub struct StatsCounters {
    records_advertised: AtomicU64,
    acks_received: AtomicU64,
    pulls_served: AtomicU64,
    bytes_transferred: AtomicU64,
    files_ok: AtomicU64,
    files_err: AtomicU64,
    files_current: AtomicU64,
    dirs_created: AtomicU64,
    symlinks_created: AtomicU64,
    frames_discarded: AtomicU64,
}

/// Which counter to bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    RecordsAdvertised,
    AcksReceived,
    PullsServed,
    BytesTransferred,
    FilesOk,
    FilesErr,
    FilesCurrent,
    DirsCreated,
    SymlinksCreated,
    FramesDiscarded,
}

impl StatsCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::RecordsAdvertised => &self.records_advertised,
            Counter::AcksReceived => &self.acks_received,
            Counter::PullsServed => &self.pulls_served,
            Counter::BytesTransferred => &self.bytes_transferred,
            Counter::FilesOk => &self.files_ok,
            Counter::FilesErr => &self.files_err,
            Counter::FilesCurrent => &self.files_current,
            Counter::DirsCreated => &self.dirs_created,
            Counter::SymlinksCreated => &self.symlinks_created,
            Counter::FramesDiscarded => &self.frames_discarded,
        }
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.slot(counter).fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SyncStats {
        let get = |c| self.slot(c).load(Ordering::Relaxed);
        SyncStats {
            records_advertised: get(Counter::RecordsAdvertised),
            acks_received: get(Counter::AcksReceived),
            pulls_served: get(Counter::PullsServed),
            bytes_transferred: get(Counter::BytesTransferred),
            files_ok: get(Counter::FilesOk),
            files_err: get(Counter::FilesErr),
            files_current: get(Counter::FilesCurrent),
            dirs_created: get(Counter::DirsCreated),
            symlinks_created: get(Counter::SymlinksCreated),
            frames_discarded: get(Counter::FramesDiscarded),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::protocol::Timestamp;

    #[tokio::test]
    async fn test_record_channel() {
        let (tx, mut rx) = record_channel();

        tx.send(Record::file(1, "test.txt", 100, Timestamp::new(0, 0)))
            .await
            .unwrap();
        drop(tx);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.path, "test.txt");
        assert_eq!(received.size, 100);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_counters_snapshot() {
        let counters = StatsCounters::new();
        counters.incr(Counter::FilesOk);
        counters.incr(Counter::FilesOk);
        counters.add(Counter::BytesTransferred, 1024 * 1024);
        counters.incr(Counter::FramesDiscarded);

        let stats = counters.snapshot();
        assert_eq!(stats.files_ok, 2);
        assert_eq!(stats.bytes_transferred, 1024 * 1024);
        assert_eq!(stats.frames_discarded, 1);
        assert_eq!(stats.files_err, 0);
    }
}
