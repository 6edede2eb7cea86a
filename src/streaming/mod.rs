//! Inventory streaming with per-file content pulls.
//!
//! # Architecture
//!
//! ```text
//! +--------------+  control  +--------------+
//! |    Sender    | --------> |   Receiver   |
//! | scan + serve | <-------- | decide + pull|
//! +--------------+   acks    +--------------+
//!        ^                          |
//!        |   content (one per file) |
//!        +--------------------------+
//! ```
//!
//! The sender advertises every entry of its tree as a length-prefixed record
//! on a single control stream and half-closes it when the scan is done. The
//! receiver decides per record: up-to-date entries, directories and symlinks
//! are settled locally and acknowledged; stale files are pulled by opening a
//! content stream that carries the record id one way and the file bytes the
//! other. Ids are retired on acknowledgment or pull, so the sender's pending
//! table drains once the session is complete.

pub mod channel;
pub mod decision;
pub mod frame;
pub mod inventory;
pub mod pipeline;
pub mod protocol;
pub mod reassembly;
pub mod receiver;
pub mod sender;

pub use channel::{
    record_channel, Counter, RecordReceiver, RecordSender, StatsCounters, SyncStats,
    RECORD_CHANNEL_SIZE,
};
pub use decision::{decide, Decision, Snapshot};
pub use frame::{encode_ack, encode_frame, try_parse_frame, FrameLimits, Parse};
pub use inventory::{IdAllocator, Inventory, PendingTable};
pub use pipeline::{run_receiver, run_sender, ControlSide, StreamRole};
pub use protocol::{BincodeCodec, Record, RecordCodec, RecordKind, Timestamp};
pub use reassembly::{Cursor, Reassembled, Reassembler, ReserveFn};
pub use receiver::{Disposition, Receiver, ReceiverConfig, TransferContext};
pub use sender::{SendPipelineState, Sender, SenderConfig};
