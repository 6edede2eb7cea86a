//! Per-stream frame reassembly.
//!
//! The transport hands us deliveries of one or more discontiguous segments
//! whose boundaries have nothing to do with frame boundaries. The
//! [`Reassembler`] keeps a cursor describing what the next byte means, so a
//! frame split across any number of deliveries comes out exactly once, in
//! order, and identical to what the peer framed.

use crate::error::{Result, SyncError};
use crate::streaming::frame::{read_length, try_parse_frame, FrameLimits, Parse};
use crate::streaming::protocol::LENGTH_PREFIX_LEN;
use bytes::Bytes;
use std::collections::TryReserveError;

/// Reserves room for a payload in an empty buffer.
pub type ReserveFn = fn(&mut Vec<u8>, usize) -> std::result::Result<(), TryReserveError>;

/// What the next incoming byte belongs to.
#[derive(Debug)]
pub enum Cursor {
    /// Collecting a length prefix; `have` bytes of it are in `buf`.
    AwaitLength {
        buf: [u8; LENGTH_PREFIX_LEN],
        have: usize,
    },
    /// Collecting a payload of `want` bytes.
    AwaitPayload { buf: Vec<u8>, want: usize },
    /// Dropping the rest of a rejected payload.
    Skip { remaining: u64 },
}

impl Cursor {
    fn fresh() -> Self {
        Cursor::AwaitLength {
            buf: [0; LENGTH_PREFIX_LEN],
            have: 0,
        }
    }
}

/// Output of [`Reassembler::feed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembled {
    Frame(Bytes),
    /// A frame whose payload was skipped. Reported once, when skipping starts.
    Discarded { len: u32, reason: String },
}

impl Reassembled {
    pub fn into_frame(self) -> Result<Bytes> {
        match self {
            Reassembled::Frame(payload) => Ok(payload),
            Reassembled::Discarded { len, reason } => {
                Err(SyncError::FrameDiscarded { len, reason })
            }
        }
    }
}

#[derive(Debug)]
pub struct Reassembler {
    cursor: Cursor,
    limits: FrameLimits,
    frames: u64,
    discarded: u64,
    reserve: ReserveFn,
}

impl Reassembler {
    pub fn new(limits: FrameLimits) -> Self {
        Self {
            cursor: Cursor::fresh(),
            limits,
            frames: 0,
            discarded: 0,
            reserve: Vec::<u8>::try_reserve_exact,
        }
    }

    /// Allocate payload buffers with `reserve` instead of the global
    /// allocator's fallible reserve. A failed reservation discards the frame.
    pub fn with_reserve(mut self, reserve: ReserveFn) -> Self {
        self.reserve = reserve;
        self
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    /// True when no partial frame is buffered or being skipped.
    pub fn at_boundary(&self) -> bool {
        matches!(self.cursor, Cursor::AwaitLength { have: 0, .. })
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Consume one delivery. Segments are processed in order; every
    /// completed frame is handed to `sink` before this returns.
    pub fn feed<F>(&mut self, segments: &[&[u8]], mut sink: F)
    where
        F: FnMut(Reassembled),
    {
        for segment in segments {
            self.feed_segment(segment, &mut sink);
        }
    }

    fn feed_segment<F>(&mut self, mut data: &[u8], sink: &mut F)
    where
        F: FnMut(Reassembled),
    {
        while !data.is_empty() {
            let cursor = std::mem::replace(&mut self.cursor, Cursor::fresh());
            self.cursor = match cursor {
                Cursor::Skip { remaining } => {
                    let n = remaining.min(data.len() as u64) as usize;
                    data = &data[n..];
                    match remaining - n as u64 {
                        0 => Cursor::fresh(),
                        remaining => Cursor::Skip { remaining },
                    }
                }
                Cursor::AwaitPayload { mut buf, want } => {
                    let n = (want - buf.len()).min(data.len());
                    buf.extend_from_slice(&data[..n]);
                    data = &data[n..];
                    if buf.len() == want {
                        self.emit(Bytes::from(buf), sink);
                        Cursor::fresh()
                    } else {
                        Cursor::AwaitPayload { buf, want }
                    }
                }
                Cursor::AwaitLength { mut buf, have } if have > 0 => {
                    let n = (LENGTH_PREFIX_LEN - have).min(data.len());
                    buf[have..have + n].copy_from_slice(&data[..n]);
                    data = &data[n..];
                    let have = have + n;
                    if have == LENGTH_PREFIX_LEN {
                        self.begin_payload(read_length(buf), sink)
                    } else {
                        Cursor::AwaitLength { buf, have }
                    }
                }
                // On a boundary: parse straight out of the segment and only
                // buffer what the segment cannot complete.
                Cursor::AwaitLength { .. } => match try_parse_frame(data, &self.limits) {
                    Parse::Frame { payload, consumed } => {
                        match self.allocate(payload.len()) {
                            Ok(mut buf) => {
                                buf.extend_from_slice(payload);
                                self.emit(Bytes::from(buf), sink);
                            }
                            Err(reason) => self.report_discard(payload.len() as u32, reason, sink),
                        }
                        data = &data[consumed..];
                        Cursor::fresh()
                    }
                    Parse::Malformed { len, consumed } => {
                        data = &data[consumed..];
                        self.begin_payload(len, sink)
                    }
                    Parse::NeedMore(_) if data.len() < LENGTH_PREFIX_LEN => {
                        let mut buf = [0u8; LENGTH_PREFIX_LEN];
                        buf[..data.len()].copy_from_slice(data);
                        let have = data.len();
                        data = &[];
                        Cursor::AwaitLength { buf, have }
                    }
                    Parse::NeedMore(_) => {
                        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
                        prefix.copy_from_slice(&data[..LENGTH_PREFIX_LEN]);
                        data = &data[LENGTH_PREFIX_LEN..];
                        self.begin_payload(read_length(prefix), sink)
                    }
                },
            };
        }
    }

    /// Called once a full length prefix is known.
    fn begin_payload<F>(&mut self, len: u32, sink: &mut F) -> Cursor
    where
        F: FnMut(Reassembled),
    {
        if let Some(reason) = self.limits.reject_reason(len) {
            return self.begin_skip(len, reason, sink);
        }
        if len == 0 {
            self.emit(Bytes::new(), sink);
            return Cursor::fresh();
        }
        let want = len as usize;
        match self.allocate(want) {
            Ok(buf) => Cursor::AwaitPayload { buf, want },
            Err(reason) => self.begin_skip(len, reason, sink),
        }
    }

    fn allocate(&self, want: usize) -> std::result::Result<Vec<u8>, String> {
        let mut buf = Vec::new();
        (self.reserve)(&mut buf, want)
            .map_err(|e| format!("cannot allocate payload buffer: {}", e))?;
        Ok(buf)
    }

    fn report_discard<F>(&mut self, len: u32, reason: String, sink: &mut F)
    where
        F: FnMut(Reassembled),
    {
        tracing::warn!("Skipping {}-byte frame: {}", len, reason);
        self.discarded += 1;
        sink(Reassembled::Discarded { len, reason });
    }

    fn begin_skip<F>(&mut self, len: u32, reason: String, sink: &mut F) -> Cursor
    where
        F: FnMut(Reassembled),
    {
        self.report_discard(len, reason, sink);
        if len == 0 {
            Cursor::fresh()
        } else {
            Cursor::Skip {
                remaining: u64::from(len),
            }
        }
    }

    fn emit<F>(&mut self, payload: Bytes, sink: &mut F)
    where
        F: FnMut(Reassembled),
    {
        self.frames += 1;
        sink(Reassembled::Frame(payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::frame::{encode_ack, encode_frame};
    use proptest::prelude::*;

    fn wire(payloads: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        for p in payloads {
            out.extend_from_slice(&encode_frame(p).unwrap());
        }
        out
    }

    fn collect(reasm: &mut Reassembler, deliveries: &[Vec<&[u8]>]) -> Vec<Reassembled> {
        let mut out = Vec::new();
        for delivery in deliveries {
            reasm.feed(delivery, |r| out.push(r));
        }
        out
    }

    fn frames(payloads: &[Vec<u8>]) -> Vec<Reassembled> {
        payloads
            .iter()
            .map(|p| Reassembled::Frame(Bytes::copy_from_slice(p)))
            .collect()
    }

    #[test]
    fn test_single_delivery_many_frames() {
        let payloads = vec![b"one".to_vec(), vec![], b"three".to_vec()];
        let bytes = wire(&payloads);
        let mut reasm = Reassembler::new(FrameLimits::UNBOUNDED);
        let out = collect(&mut reasm, &[vec![&bytes[..]]]);
        assert_eq!(out, frames(&payloads));
        assert!(reasm.at_boundary());
        assert_eq!(reasm.frames(), 3);
    }

    #[test]
    fn test_one_byte_at_a_time() {
        let payloads = vec![vec![9u8; 300], b"x".to_vec(), vec![]];
        let bytes = wire(&payloads);
        let mut reasm = Reassembler::new(FrameLimits::UNBOUNDED);
        let deliveries: Vec<Vec<&[u8]>> = bytes.chunks(1).map(|c| vec![c]).collect();
        assert_eq!(collect(&mut reasm, &deliveries), frames(&payloads));
    }

    #[test]
    fn test_length_prefix_split_across_segments() {
        let bytes = wire(&[b"hello".to_vec()]);
        let mut reasm = Reassembler::new(FrameLimits::UNBOUNDED);
        let out = collect(
            &mut reasm,
            &[vec![&bytes[..1], &bytes[1..3]], vec![&bytes[3..6]], vec![&bytes[6..]]],
        );
        assert_eq!(out, frames(&[b"hello".to_vec()]));
    }

    #[test]
    fn test_partial_frame_stays_buffered() {
        let bytes = wire(&[b"abcdef".to_vec()]);
        let mut reasm = Reassembler::new(FrameLimits::UNBOUNDED);
        let out = collect(&mut reasm, &[vec![&bytes[..7]]]);
        assert!(out.is_empty());
        assert!(!reasm.at_boundary());
        assert!(matches!(reasm.cursor(), Cursor::AwaitPayload { want: 6, .. }));
    }

    #[test]
    fn test_oversized_frame_skipped_across_deliveries() {
        let payloads = vec![b"ok".to_vec(), vec![1u8; 100], b"after".to_vec()];
        let bytes = wire(&payloads);
        let mut reasm = Reassembler::new(FrameLimits::with_max(16));
        // Split inside the oversized payload, twice.
        let out = collect(
            &mut reasm,
            &[vec![&bytes[..20]], vec![&bytes[20..60]], vec![&bytes[60..]]],
        );
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], Reassembled::Frame(Bytes::from_static(b"ok")));
        assert!(matches!(out[1], Reassembled::Discarded { len: 100, .. }));
        assert_eq!(out[2], Reassembled::Frame(Bytes::from_static(b"after")));
        assert_eq!(reasm.discarded(), 1);
    }

    /// Refuses anything larger than 64 bytes.
    fn tight_reserve(buf: &mut Vec<u8>, want: usize) -> std::result::Result<(), TryReserveError> {
        if want > 64 {
            return buf.try_reserve_exact(usize::MAX);
        }
        buf.try_reserve_exact(want)
    }

    #[test]
    fn test_allocation_failure_skips_frame() {
        let payloads = vec![b"ok".to_vec(), vec![7u8; 100], b"after".to_vec()];
        let bytes = wire(&payloads);
        let mut reasm = Reassembler::new(FrameLimits::UNBOUNDED).with_reserve(tight_reserve);
        // The large frame starts in the first delivery and ends in the second.
        let out = collect(&mut reasm, &[vec![&bytes[..30]], vec![&bytes[30..]]]);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], Reassembled::Frame(Bytes::from_static(b"ok")));
        match &out[1] {
            Reassembled::Discarded { len: 100, reason } => {
                assert!(reason.starts_with("cannot allocate payload buffer"), "{}", reason)
            }
            other => panic!("Expected discard, got {:?}", other),
        }
        assert_eq!(out[2], Reassembled::Frame(Bytes::from_static(b"after")));
        assert_eq!(reasm.discarded(), 1);
        assert!(reasm.at_boundary());

        // Same outcome when the large frame arrives whole.
        let mut reasm = Reassembler::new(FrameLimits::UNBOUNDED).with_reserve(tight_reserve);
        let out = collect(&mut reasm, &[vec![&bytes[..]]]);
        assert!(matches!(out[1], Reassembled::Discarded { len: 100, .. }));
        assert_eq!(out[2], Reassembled::Frame(Bytes::from_static(b"after")));
        assert_eq!(reasm.frames(), 2);
    }

    #[test]
    fn test_ack_stream_rejects_wrong_length() {
        let mut bytes = encode_ack(5).to_vec();
        bytes.extend_from_slice(&encode_frame(&[0u8; 3]).unwrap());
        bytes.extend_from_slice(&encode_frame(&[]).unwrap());
        bytes.extend_from_slice(&encode_ack(6));
        let mut reasm = Reassembler::new(FrameLimits::acknowledgments());
        let out = collect(&mut reasm, &[vec![&bytes[..]]]);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].clone().into_frame().unwrap().as_ref(), &5u64.to_be_bytes());
        assert!(matches!(
            out[1].clone().into_frame(),
            Err(SyncError::FrameDiscarded { len: 3, .. })
        ));
        assert!(matches!(out[2], Reassembled::Discarded { len: 0, .. }));
        assert_eq!(out[3].clone().into_frame().unwrap().as_ref(), &6u64.to_be_bytes());
    }

    #[test]
    fn test_empty_segments_are_harmless() {
        let bytes = wire(&[b"z".to_vec()]);
        let empty: &[u8] = &[];
        let deliveries: Vec<Vec<&[u8]>> = vec![
            vec![empty, &bytes[..2], empty],
            Vec::new(),
            vec![&bytes[2..]],
        ];
        let mut reasm = Reassembler::new(FrameLimits::UNBOUNDED);
        let out = collect(&mut reasm, &deliveries);
        assert_eq!(out, frames(&[b"z".to_vec()]));
    }

    fn arb_payloads() -> impl Strategy<Value = Vec<Vec<u8>>> {
        prop::collection::vec(prop::collection::vec(any::<u8>(), 0..200), 0..12)
    }

    proptest! {
        #[test]
        fn prop_fragmentation_invariance(
            payloads in arb_payloads(),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..24),
            group in 1usize..4,
        ) {
            let bytes = wire(&payloads);
            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(bytes.len() + 1)).collect();
            points.push(0);
            points.push(bytes.len());
            points.sort_unstable();
            points.dedup();

            let segments: Vec<&[u8]> = points.windows(2).map(|w| &bytes[w[0]..w[1]]).collect();
            let deliveries: Vec<Vec<&[u8]>> = segments.chunks(group).map(|c| c.to_vec()).collect();

            let mut reasm = Reassembler::new(FrameLimits::UNBOUNDED);
            let out = collect(&mut reasm, &deliveries);
            prop_assert_eq!(out, frames(&payloads));
            prop_assert!(reasm.at_boundary());
        }

        #[test]
        fn prop_skip_keeps_stream_aligned(
            payloads in arb_payloads(),
            chunk in 1usize..32,
        ) {
            let limit = 64u32;
            let bytes = wire(&payloads);
            let deliveries: Vec<Vec<&[u8]>> = bytes.chunks(chunk).map(|c| vec![c]).collect();
            let mut reasm = Reassembler::new(FrameLimits::with_max(limit));
            let out = collect(&mut reasm, &deliveries);

            let expected: Vec<Reassembled> = payloads
                .iter()
                .map(|p| {
                    if p.len() as u32 > limit {
                        Reassembled::Discarded {
                            len: p.len() as u32,
                            reason: format!("exceeds limit of {} bytes", limit),
                        }
                    } else {
                        Reassembled::Frame(Bytes::copy_from_slice(p))
                    }
                })
                .collect();
            prop_assert_eq!(out, expected);
        }
    }
}
