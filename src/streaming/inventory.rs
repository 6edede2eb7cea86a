//! Sender-side inventory: id assignment, advertisement and the pending table.
//!
//! Every advertised record stays in the [`PendingTable`] until the receiver
//! resolves it, either with an acknowledgment on the control stream or by
//! pulling its content on a dedicated stream.

use crate::error::{Result, SyncError};
use crate::streaming::channel::{
    Counter, RecordReceiver, StatsCounters, CONTROL_READ_SIZE,
};
use crate::streaming::frame::{encode_frame, FrameLimits};
use crate::streaming::protocol::{decode_id, Record, RecordCodec};
use crate::streaming::reassembly::{Reassembled, Reassembler};
use bytes::Bytes;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hands out record ids, strictly increasing from 1.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Pending table
// =============================================================================

/// Serialized records advertised but not yet acknowledged or pulled.
#[derive(Debug, Clone, Default)]
pub struct PendingTable {
    entries: Arc<Mutex<HashMap<u64, Bytes>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Bytes>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails with [`SyncError::DuplicateId`] if `id` is still pending.
    pub fn insert(&self, id: u64, encoded: Bytes) -> Result<()> {
        match self.lock().entry(id) {
            Entry::Occupied(_) => Err(SyncError::DuplicateId { id }),
            Entry::Vacant(slot) => {
                slot.insert(encoded);
                Ok(())
            }
        }
    }

    /// Acknowledgment path. Returns false if `id` was not pending.
    pub fn retire(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Pull path: remove `id` and hand back its serialized record.
    pub fn take(&self, id: u64) -> Result<Bytes> {
        self.lock()
            .remove(&id)
            .ok_or(SyncError::UnknownId { id })
    }

    pub fn contains(&self, id: u64) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Unresolved ids, ascending.
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

// =============================================================================
// Inventory session
// =============================================================================

pub struct Inventory {
    codec: Arc<dyn RecordCodec>,
    pending: PendingTable,
    stats: Arc<StatsCounters>,
}

impl Inventory {
    pub fn new(codec: Arc<dyn RecordCodec>, stats: Arc<StatsCounters>) -> Self {
        Self {
            codec,
            pending: PendingTable::new(),
            stats,
        }
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// Encode, register and frame one record onto the control stream.
    ///
    /// The record is pending before its frame is written, so an
    /// acknowledgment can never arrive for an id the table does not hold.
    pub async fn advertise<W>(&self, writer: &mut W, record: &Record) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let encoded = self.codec.encode(record)?;
        let frame = encode_frame(&encoded)?;
        self.pending.insert(record.id, encoded)?;
        writer.write_all(&frame).await?;
        self.stats.incr(Counter::RecordsAdvertised);
        tracing::debug!("Advertised {:?} {} as id {}", record.kind, record.path, record.id);
        Ok(())
    }

    /// Advertise everything the scanner produces, then half-close the
    /// control stream to mark the end of the inventory.
    ///
    /// A duplicate id aborts the advertisement; a record that fails to
    /// encode is skipped.
    pub async fn advertise_all<W>(&self, writer: &mut W, records: &mut RecordReceiver) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut count = 0u64;
        while let Some(record) = records.recv().await {
            match self.advertise(writer, &record).await {
                Ok(()) => count += 1,
                Err(e) if e.is_fatal() => {
                    tracing::error!("Aborting inventory at {}: {}", record.path, e);
                    return Err(e);
                }
                Err(SyncError::Codec(msg)) => {
                    tracing::warn!("Failed to encode {}: {}", record.path, msg);
                    self.stats.incr(Counter::FilesErr);
                }
                Err(e) => return Err(e),
            }
        }
        writer.flush().await?;
        writer.shutdown().await?;
        tracing::info!("Inventory complete: {} records advertised", count);
        Ok(count)
    }

    /// Retire ids acknowledged by the receiver until it closes its side of
    /// the control stream. Returns the number of acknowledgments applied.
    pub async fn service_acks<R>(&self, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut reasm = Reassembler::new(FrameLimits::acknowledgments());
        let mut buf = vec![0u8; CONTROL_READ_SIZE];
        let mut acked = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            reasm.feed(&[&buf[..n]], |item| {
                if self.apply_ack(item) {
                    acked += 1;
                }
            });
        }
        if !reasm.at_boundary() {
            tracing::warn!("Control stream closed in the middle of an acknowledgment");
        }
        Ok(acked)
    }

    fn apply_ack(&self, item: Reassembled) -> bool {
        let payload = match item.into_frame() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Ignoring acknowledgment frame: {}", e);
                self.stats.incr(Counter::FramesDiscarded);
                return false;
            }
        };
        let Some(id) = decode_id(&payload) else {
            return false;
        };
        if self.pending.retire(id) {
            self.stats.incr(Counter::AcksReceived);
            tracing::debug!("Record {} acknowledged", id);
            true
        } else {
            tracing::warn!("Acknowledgment for unknown or retired record id {}", id);
            false
        }
    }
}
