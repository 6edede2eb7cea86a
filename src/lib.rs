//! qsync - directory synchronization over QUIC.
//!
//! The sender streams its inventory over a control stream; the receiver
//! pulls only the files it is missing or holds an older copy of, each on its
//! own stream, and commits them atomically.

pub mod config;
pub mod error;
pub mod pool;
pub mod scanner;
pub mod server;
pub mod streaming;
pub mod temp_file;
pub mod transport;

pub use config::Config;
pub use error::{Result, SyncError};
