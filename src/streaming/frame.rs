//! Length-prefixed frame codec for the control channel.
//!
//! A frame is `len:u32 (big-endian) | payload[len]`. Parsing is a pure
//! function of a byte window that starts on a frame boundary; the
//! [`Reassembler`](crate::streaming::reassembly::Reassembler) handles windows
//! that stop in the middle of a frame.

use crate::error::{Result, SyncError};
use crate::streaming::protocol::{ID_LEN, LENGTH_PREFIX_LEN};
use bytes::{BufMut, Bytes, BytesMut};

/// Which payload lengths a stream accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub max_len: u32,
    pub exact_len: Option<u32>,
}

impl FrameLimits {
    /// Any length, including zero.
    pub const UNBOUNDED: FrameLimits = FrameLimits {
        max_len: u32::MAX,
        exact_len: None,
    };

    pub fn with_max(max_len: u32) -> Self {
        Self {
            max_len,
            exact_len: None,
        }
    }

    /// Acknowledgment frames carry exactly one id.
    pub fn acknowledgments() -> Self {
        Self {
            max_len: ID_LEN as u32,
            exact_len: Some(ID_LEN as u32),
        }
    }

    /// Returns why `len` is unacceptable, if it is.
    pub fn reject_reason(&self, len: u32) -> Option<String> {
        if let Some(exact) = self.exact_len {
            if len != exact {
                return Some(format!("expected a {}-byte payload", exact));
            }
        }
        if len > self.max_len {
            return Some(format!("exceeds limit of {} bytes", self.max_len));
        }
        None
    }
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self::UNBOUNDED
    }
}

/// Outcome of one parse attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Parse<'a> {
    /// The window ends inside the length prefix or payload; `n` more bytes
    /// are needed to finish the part in progress.
    NeedMore(usize),
    /// A complete frame. `consumed` covers prefix and payload.
    Frame { payload: &'a [u8], consumed: usize },
    /// The length prefix was read (`consumed` bytes) but the length is not
    /// acceptable. The caller must skip the next `len` payload bytes.
    Malformed { len: u32, consumed: usize },
}

pub fn read_length(prefix: [u8; LENGTH_PREFIX_LEN]) -> u32 {
    u32::from_be_bytes(prefix)
}

/// Try to parse one frame from the front of `window`. Never blocks.
pub fn try_parse_frame<'a>(window: &'a [u8], limits: &FrameLimits) -> Parse<'a> {
    if window.len() < LENGTH_PREFIX_LEN {
        return Parse::NeedMore(LENGTH_PREFIX_LEN - window.len());
    }
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    prefix.copy_from_slice(&window[..LENGTH_PREFIX_LEN]);
    let len = read_length(prefix);

    if limits.reject_reason(len).is_some() {
        return Parse::Malformed {
            len,
            consumed: LENGTH_PREFIX_LEN,
        };
    }

    let available = window.len() - LENGTH_PREFIX_LEN;
    let len = len as usize;
    if available < len {
        return Parse::NeedMore(len - available);
    }

    let end = LENGTH_PREFIX_LEN + len;
    Parse::Frame {
        payload: &window[LENGTH_PREFIX_LEN..end],
        consumed: end,
    }
}

/// Prefix `payload` with its length.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        SyncError::Codec(format!(
            "payload of {} bytes does not fit in a frame",
            payload.len()
        ))
    })?;
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    buf.put_u32(len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// An acknowledgment frame for `id`.
pub fn encode_ack(id: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + ID_LEN);
    buf.put_u32(ID_LEN as u32);
    buf.put_u64(id);
    buf.freeze()
}
