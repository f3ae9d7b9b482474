use std::collections::{btree_map::Entry, BTreeMap};

use bytes::Bytes;
use replay_capture::TcpSegment;

use crate::{AssemblyStats, StreamSink};

/// A buffered out-of-order segment.
#[derive(Debug)]
struct Pending {
    payload: Bytes,
    /// Capture time the segment arrived at.
    seen_nanos: u64,
}

/// Limits applied to a half stream while it waits for missing data.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub(crate) max_buffered_segments: usize,
    pub(crate) reorder_window_nanos: u64,
}

/// One direction of a TCP connection.
///
/// Sequence numbers are unwrapped into a signed 64-bit offset space relative to a moving
/// reference, so comparisons stay correct across 32-bit wraparound.
#[derive(Debug)]
pub(crate) struct HalfStream<S> {
    sink: S,
    /// A known (sequence number, offset) pair. Moves with `next` as bytes are delivered.
    reference: Option<(u32, i64)>,
    /// Offset of the next byte to deliver. `None` until the stream is anchored.
    next: Option<i64>,
    /// Segments waiting for the bytes before them, keyed by start offset.
    pending: BTreeMap<i64, Pending>,
    /// Offset at which FIN or RST was seen.
    end: Option<i64>,
    closed: bool,
}

impl<S: StreamSink> HalfStream<S> {
    pub(crate) fn new(sink: S) -> Self {
        Self { sink, reference: None, next: None, pending: BTreeMap::new(), end: None, closed: false }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    #[cfg(test)]
    pub(crate) fn sink(&self) -> &S {
        &self.sink
    }

    /// Unwraps a sequence number into the offset space.
    fn offset(&mut self, seq: u32) -> i64 {
        match self.reference {
            Some((ref_seq, ref_offset)) => ref_offset + i64::from(seq.wrapping_sub(ref_seq) as i32),
            None => {
                self.reference = Some((seq, 0));
                0
            }
        }
    }

    /// Adds a segment captured at `now` (UNIX nanoseconds) and delivers whatever became
    /// contiguous.
    pub(crate) fn push(&mut self, segment: &TcpSegment, now: u64, limits: Limits, stats: &mut AssemblyStats) {
        if self.closed {
            stats.late_segments += 1;
            return;
        }

        let mut start = self.offset(segment.seq);
        if segment.flags.syn {
            // SYN occupies one sequence number
            start += 1;
            if self.next.is_none() {
                self.next = Some(start);
                self.pending = self.pending.split_off(&start);
            }
        }

        let end = start + segment.payload.len() as i64;
        if segment.flags.fin || segment.flags.rst {
            self.end = Some(self.end.map_or(end, |e| e.min(end)));
        }

        if !segment.payload.is_empty() {
            if matches!(self.next, Some(next) if end <= next) {
                stats.duplicates += 1;
            } else {
                let pending = Pending { payload: segment.payload.clone(), seen_nanos: now };
                match self.pending.entry(start) {
                    Entry::Vacant(entry) => {
                        entry.insert(pending);
                    }
                    Entry::Occupied(mut entry) => {
                        if entry.get().payload.len() < pending.payload.len() {
                            entry.insert(pending);
                        } else {
                            stats.duplicates += 1;
                        }
                    }
                }
            }
        }

        let skip = self.is_blocked() && self.must_skip(now, limits);
        self.advance(skip || self.end.is_some(), skip, stats);
    }

    /// Forces delivery of everything buffered, skipping gaps.
    pub(crate) fn flush(&mut self, stats: &mut AssemblyStats) {
        if !self.closed {
            self.advance(true, true, stats);
        }
    }

    /// Closes the stream, abandoning anything still buffered.
    pub(crate) fn abandon(&mut self, stats: &mut AssemblyStats) {
        if !self.closed {
            stats.abandoned_segments += self.pending.len() as u64;
            self.close();
        }
    }

    /// Returns `true` if buffered data is waiting on missing bytes.
    fn is_blocked(&self) -> bool {
        match (self.next, self.pending.keys().next()) {
            (None, Some(_)) => true,
            (Some(next), Some(&first)) => first > next,
            (_, None) => false,
        }
    }

    fn must_skip(&self, now: u64, limits: Limits) -> bool {
        if self.pending.len() > limits.max_buffered_segments {
            return true;
        }

        self.pending
            .values()
            .map(|p| p.seen_nanos)
            .min()
            .map_or(false, |oldest| oldest.saturating_add(limits.reorder_window_nanos) < now)
    }

    /// Delivers contiguous data. `anchor` allows an unanchored stream to start at its lowest
    /// buffered offset, `skip` allows jumping over missing bytes.
    fn advance(&mut self, anchor: bool, skip: bool, stats: &mut AssemblyStats) {
        if self.next.is_none() {
            if !anchor {
                return;
            }
            self.next = self.pending.keys().next().copied().or(self.end);
        }
        let Some(mut next) = self.next else {
            return;
        };

        while let Some((&start, _)) = self.pending.first_key_value() {
            if start > next {
                if !skip {
                    break;
                }
                self.skip_to(&mut next, start, stats);
            }

            let Some(segment) = self.pending.remove(&start) else {
                break;
            };
            let end = start + segment.payload.len() as i64;
            if end <= next {
                stats.duplicates += 1;
                continue;
            }

            // Overlaps deliver only the new tail
            let data = segment.payload.slice((next - start) as usize..);
            stats.delivered_bytes += data.len() as u64;
            self.sink.reassembled(data);
            next = end;
        }

        if let Some(end) = self.end {
            if skip && next < end {
                self.skip_to(&mut next, end, stats);
            }
        }

        self.rebase(next);

        if matches!(self.end, Some(end) if next >= end) {
            self.close();
        }
    }

    fn skip_to(&mut self, next: &mut i64, to: i64, stats: &mut AssemblyStats) {
        let skipped = (to - *next) as u64;
        stats.skipped_bytes += skipped;
        self.sink.skipped(skipped);
        *next = to;
    }

    fn rebase(&mut self, next: i64) {
        if let Some((ref_seq, ref_offset)) = self.reference {
            let seq = ref_seq.wrapping_add((next - ref_offset) as u32);
            self.reference = Some((seq, next));
        }
        self.next = Some(next);
    }

    fn close(&mut self) {
        self.closed = true;
        self.pending.clear();
        self.sink.finished();
    }
}

#[cfg(test)]
mod tests {
    use replay_capture::SegmentFlags;

    use super::*;

    #[derive(Debug, Default)]
    struct Collect {
        data: Vec<u8>,
        skipped: u64,
        finished: bool,
    }

    impl StreamSink for Collect {
        fn reassembled(&mut self, data: Bytes) {
            self.data.extend_from_slice(&data);
        }

        fn skipped(&mut self, bytes: u64) {
            self.skipped += bytes;
        }

        fn finished(&mut self) {
            self.finished = true;
        }
    }

    const LIMITS: Limits = Limits { max_buffered_segments: 4, reorder_window_nanos: 1_000 };

    const SYN: SegmentFlags = SegmentFlags { syn: true, fin: false, rst: false };
    const FIN: SegmentFlags = SegmentFlags { syn: false, fin: true, rst: false };

    fn seg(seq: u32, payload: &'static [u8]) -> TcpSegment {
        TcpSegment::new(1, 2, seq, payload)
    }

    fn push(half: &mut HalfStream<Collect>, segment: TcpSegment, now: u64) {
        half.push(&segment, now, LIMITS, &mut AssemblyStats::default());
    }

    #[test]
    fn sequence_wraparound() {
        let mut half = HalfStream::new(Collect::default());
        push(&mut half, seg(u32::MAX - 1, b"").with_flags(SYN), 0);
        push(&mut half, seg(2, b"d"), 0);
        push(&mut half, seg(u32::MAX, b"ab"), 0);
        // Overlaps the delivered "b"
        push(&mut half, seg(0, b"bc"), 0);

        assert_eq!(half.sink().data, b"abcd");
        assert_eq!(half.sink().skipped, 0);
    }

    #[test]
    fn waits_for_missing_bytes_until_window_expires() {
        let mut half = HalfStream::new(Collect::default());
        push(&mut half, seg(10, b"").with_flags(SYN), 0);
        push(&mut half, seg(15, b"world"), 100);
        assert!(half.sink().data.is_empty());

        // Window is measured in capture time
        push(&mut half, seg(20, b"!"), 2_000);
        assert_eq!(half.sink().data, b"world!");
        assert_eq!(half.sink().skipped, 4);
    }

    #[test]
    fn overflow_skips_gap() {
        let mut half = HalfStream::new(Collect::default());
        push(&mut half, seg(0, b"").with_flags(SYN), 0);
        for i in 0..5u32 {
            push(&mut half, seg(10 + i, b"x"), 0);
        }
        assert_eq!(half.sink().data, b"xxxxx");
    }

    #[test]
    fn fin_anchors_unsynchronized_stream() {
        let mut half = HalfStream::new(Collect::default());
        push(&mut half, seg(500, b"late"), 0);
        push(&mut half, seg(496, b"the "), 0);
        assert!(half.sink().data.is_empty());

        push(&mut half, seg(504, b"").with_flags(FIN), 0);
        assert_eq!(half.sink().data, b"the late");
        assert!(half.sink().finished);
        assert!(half.is_closed());
    }

    #[test]
    fn flush_delivers_and_abandon_drops() {
        let mut stats = AssemblyStats::default();

        let mut half = HalfStream::new(Collect::default());
        half.push(&seg(7, b"abc"), 0, LIMITS, &mut stats);
        half.flush(&mut stats);
        assert_eq!(half.sink().data, b"abc");
        assert!(!half.is_closed());

        half.push(&seg(20, b"zzz"), 0, LIMITS, &mut stats);
        half.abandon(&mut stats);
        assert_eq!(half.sink().data, b"abc");
        assert!(half.sink().finished);
        assert_eq!(stats.abandoned_segments, 1);
    }
}
