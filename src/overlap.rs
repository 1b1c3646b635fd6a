/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */

//! Overlap resolution between a new segment and the queued ones.
//!
//! Every target policy is a row of three resolvers: how the new segment's start is
//! treated when it falls inside a queued segment (left), how a queued segment partly
//! covered by the new one is treated (right), and what happens to a queued segment
//! the new one covers entirely (full).
//!
//! ```text
//!           left            right (partial)      right (full)
//!      |-----------|     |--------------|        |------|
//!              |====new====|            |====new============|
//! ```

use crate::{
    config::{NormMode, StreamPolicy},
    error::InsertError,
    packet::{PacketStatus, PacketView},
    segment::TcpSegment,
    segment_store::SegmentStore,
    seq::{seq_geq, seq_gt, seq_leq, seq_lt},
    stats::{NormPeg, TcpStats},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeftOverlap {
    /// Queued bytes win, the new segment starts after them.
    KeepFirst,
    /// New bytes win, the queued segment is cut back or split around the new one.
    KeepLast,
    /// Queued bytes win if they cover the new segment, otherwise the queued segment is cut back.
    TrimFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RightOverlap {
    TruncateExisting,
    TruncateNew,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullOverlap {
    /// bsd, macos, windows, win-2003
    Os1,
    /// linux, irix, hpux10
    Os2,
    /// solaris, hpux11
    Os3,
    /// old-linux, last
    Os4,
    /// first, vista, proxy
    Os5,
}

/// Resolver row of one target policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyPolicy {
    pub policy: StreamPolicy,
    pub left: LeftOverlap,
    pub right: RightOverlap,
    pub full: FullOverlap,
    /// Rewrite the packet with the bytes that won.
    pub ips_data: NormMode,
}

impl ReassemblyPolicy {
    /// With inline data rewriting on, the packet is fixed to what was queued first,
    /// which makes the host's own policy irrelevant.
    pub fn new(policy: StreamPolicy, ips_data: NormMode) -> Self {
        let policy = if ips_data.is_on() { StreamPolicy::First } else { policy };
        let (left, right, full) = match policy {
            StreamPolicy::First | StreamPolicy::Proxy => (LeftOverlap::KeepFirst, RightOverlap::TruncateNew, FullOverlap::Os5),
            StreamPolicy::Last => (LeftOverlap::KeepLast, RightOverlap::TruncateExisting, FullOverlap::Os4),
            StreamPolicy::Linux => (LeftOverlap::KeepFirst, RightOverlap::TruncateExisting, FullOverlap::Os2),
            StreamPolicy::OldLinux => (LeftOverlap::KeepFirst, RightOverlap::TruncateExisting, FullOverlap::Os4),
            StreamPolicy::Bsd | StreamPolicy::MacOs | StreamPolicy::Windows | StreamPolicy::Win2003 => {
                (LeftOverlap::KeepFirst, RightOverlap::TruncateExisting, FullOverlap::Os1)
            }
            StreamPolicy::Solaris | StreamPolicy::Hpux11 => (LeftOverlap::TrimFirst, RightOverlap::TruncateNew, FullOverlap::Os3),
            StreamPolicy::Irix | StreamPolicy::Hpux10 => (LeftOverlap::KeepFirst, RightOverlap::TruncateExisting, FullOverlap::Os2),
            StreamPolicy::Vista => (LeftOverlap::KeepFirst, RightOverlap::TruncateNew, FullOverlap::Os5),
        };
        Self {
            policy,
            left,
            right,
            full,
            ips_data: if policy == StreamPolicy::Proxy { NormMode::Off } else { ips_data },
        }
    }
}

/// Working state of one insert.
///
/// Offsets are relative to `origin_seq`, the first byte of the packet payload
/// (at `origin_offset`) still eligible for queueing.
#[derive(Debug)]
pub(crate) struct OverlapState {
    origin_seq: u32,
    pub(crate) origin_offset: usize,
    pub(crate) seq: u32,
    seq_end: u32,
    pub(crate) len: u32,
    overlap: u32,
    pub(crate) slide: u32,
    pub(crate) trunc_len: u32,
    /// Retransmission candidate still to be matched: offset, size and sequence.
    rdata: u32,
    rsize: u32,
    rseq: u32,
    keep_segment: bool,
    left: Option<usize>,
    right: Option<usize>,
    pub(crate) ts: u32,
    pub(crate) rebuilt: bool,
}

impl OverlapState {
    pub(crate) fn new(seq: u32, origin_offset: usize, len: u32, ts: u32) -> Self {
        Self {
            origin_seq: seq,
            origin_offset,
            seq,
            seq_end: seq.wrapping_add(len),
            len,
            overlap: 0,
            slide: 0,
            trunc_len: 0,
            rdata: 0,
            rsize: len,
            rseq: seq,
            keep_segment: true,
            left: None,
            right: None,
            ts,
            rebuilt: false,
        }
    }

    fn packet_index(&self, seq: u32) -> usize {
        self.origin_offset + seq.wrapping_sub(self.origin_seq) as usize
    }

    fn bad_segment(&self) -> InsertError {
        InsertError::BadSegment {
            seq: self.seq,
            end_seq: self.seq_end,
        }
    }
}

impl SegmentStore {
    pub(crate) fn resolve_and_insert(&mut self, state: &mut OverlapState, packet: &mut PacketView, stats: &mut TcpStats) -> Result<(), InsertError> {
        // left: last segment starting before the new one, right: first starting at or after it
        let position = self.segments.partition_point(|segment| seq_lt(segment.seq, state.seq));
        state.left = position.checked_sub(1);
        state.right = (position < self.segments.len()).then_some(position);

        self.eval_left(state, packet, stats)?;
        self.eval_right(state, packet, stats)?;

        if state.keep_segment {
            state.slide = state.seq.wrapping_sub(state.origin_seq);
            self.add_segment(state, packet, state.seq, state.left, stats);
        }
        Ok(())
    }

    fn next_index(&self, index: usize) -> Option<usize> {
        (index + 1 < self.segments.len()).then_some(index + 1)
    }

    fn count_overlap(&mut self, state: &mut OverlapState, stats: &mut TcpStats) {
        self.overlap_count += 1;
        stats.overlaps += 1;
        state.rebuilt = true;
    }

    /// Write queued bytes over the packet, so the packet carries what the host keeps.
    fn overwrite_packet(&self, state: &OverlapState, packet: &mut PacketView, segment: usize, from_seq: u32, len: u32, stats: &mut TcpStats) {
        if len == 0 {
            return;
        }
        let mode = self.policy.ips_data;
        stats.norm.add(NormPeg::IpsData, mode);
        if !mode.is_on() {
            return;
        }
        let segment = &self.segments[segment];
        let start = from_seq.wrapping_sub(segment.seq) as usize;
        let Some(bytes) = segment.payload().get(start..start + len as usize) else {
            return;
        };
        if let Some(mut edit) = packet.inline_edit() {
            edit.overwrite(state.packet_index(from_seq), bytes);
        }
    }

    fn retransmit(state: &mut OverlapState, packet: &mut PacketView, stats: &mut TcpStats) {
        state.keep_segment = false;
        stats.retransmits += 1;
        packet.status |= PacketStatus::RETRANSMIT;
    }

    fn eval_left(&mut self, state: &mut OverlapState, packet: &mut PacketView, stats: &mut TcpStats) -> Result<(), InsertError> {
        let Some(left) = state.left else {
            return Ok(());
        };
        match self.policy.left {
            LeftOverlap::KeepFirst => self.left_overlap_keep_first(left, state, packet, stats),
            LeftOverlap::KeepLast => self.left_overlap_keep_last(left, state, stats),
            LeftOverlap::TrimFirst => self.left_overlap_trim_first(left, state, stats),
        }
    }

    fn left_overlap_keep_first(&mut self, left: usize, state: &mut OverlapState, packet: &mut PacketView, stats: &mut TcpStats) -> Result<(), InsertError> {
        let left_end = self.segments[left].end_seq();
        if !seq_gt(left_end, state.seq) {
            return Ok(());
        }
        let overlap = left_end.wrapping_sub(state.seq);
        state.overlap = overlap;
        self.count_overlap(state, stats);

        let covered = if seq_gt(left_end, state.seq_end) {
            state.seq_end.wrapping_sub(state.seq)
        } else {
            overlap
        };
        self.overwrite_packet(state, packet, left, state.seq, covered, stats);

        state.seq = state.seq.wrapping_add(overlap);
        if seq_leq(state.seq_end, state.seq) {
            return Err(state.bad_segment());
        }
        Ok(())
    }

    fn left_overlap_trim_first(&mut self, left: usize, state: &mut OverlapState, stats: &mut TcpStats) -> Result<(), InsertError> {
        let left_end = self.segments[left].end_seq();
        if !seq_gt(left_end, state.seq) {
            return Ok(());
        }
        let overlap = left_end.wrapping_sub(state.seq);
        state.overlap = overlap;
        self.count_overlap(state, stats);

        if seq_geq(left_end, state.seq_end) {
            // queued segment covers the new one, nothing new
            state.seq = state.seq.wrapping_add(overlap);
            if seq_leq(state.seq_end, state.seq) {
                return Err(state.bad_segment());
            }
        }
        self.trim_segment_back(left, overlap);
        Ok(())
    }

    fn left_overlap_keep_last(&mut self, left: usize, state: &mut OverlapState, stats: &mut TcpStats) -> Result<(), InsertError> {
        let left_seq = self.segments[left].seq;
        let left_end = self.segments[left].end_seq();
        if !seq_gt(left_end, state.seq) {
            return Ok(());
        }
        let overlap = left_end.wrapping_sub(state.seq);
        state.overlap = overlap;
        self.count_overlap(state, stats);

        if seq_lt(left_seq, state.seq) && seq_gt(left_end, state.seq_end) {
            // new segment sits inside: split the queued one around it
            let tail_start = state.seq_end.wrapping_sub(left_seq) as usize;
            let mut tail = TcpSegment::new(state.seq_end, &self.segments[left].payload()[tail_start..], self.segments[left].ts);
            tail.rebuilt = true;
            self.move_charge(left, &mut tail);
            self.trim_segment_back(left, overlap);
            self.insert_segment(left + 1, tail);
            state.right = Some(left + 1);
        } else {
            self.trim_segment_back(left, overlap);
        }
        Ok(())
    }

    fn eval_right(&mut self, state: &mut OverlapState, packet: &mut PacketView, stats: &mut TcpStats) -> Result<(), InsertError> {
        while let Some(right) = state.right {
            let right_seq = self.segments[right].seq;
            let right_size = self.segments[right].size();
            if !seq_lt(right_seq, state.seq_end) {
                break;
            }
            state.overlap = state.seq_end.wrapping_sub(right_seq);

            let rdata_start = state.origin_offset + state.rdata as usize;
            let is_retransmit = self.segments[right].is_retransmit(
                &packet.payload()[rdata_start..rdata_start + state.rsize as usize],
                state.rseq,
            );

            if state.overlap < right_size {
                if is_retransmit {
                    Self::retransmit(state, packet, stats);
                } else {
                    self.count_overlap(state, stats);
                    self.insert_right_overlap(right, state, packet, stats);
                }
                break;
            }

            if is_retransmit {
                state.rdata += right_size;
                state.rsize -= right_size;
                state.rseq = state.rseq.wrapping_add(right_size);
                state.seq = state.seq.wrapping_add(right_size);
                state.left = Some(right);
                state.right = self.next_index(right);
                if state.rsize == 0 {
                    Self::retransmit(state, packet, stats);
                }
            } else {
                self.count_overlap(state, stats);
                self.insert_full_overlap(right, state, packet, stats)?;
            }
        }
        Ok(())
    }

    fn insert_right_overlap(&mut self, right: usize, state: &mut OverlapState, packet: &mut PacketView, stats: &mut TcpStats) {
        match self.policy.right {
            RightOverlap::TruncateExisting => self.right_overlap_truncate_existing(right, state),
            RightOverlap::TruncateNew => self.right_overlap_truncate_new(right, state, packet, stats),
        }
    }

    fn right_overlap_truncate_existing(&mut self, right: usize, state: &mut OverlapState) {
        let right_seq = self.segments[right].seq;
        if right_seq == state.seq && self.policy.policy != StreamPolicy::Last {
            // same start: the queued segment wins and the new one has nothing left
            state.slide = self.segments[right].end_seq().wrapping_sub(state.seq);
            state.seq = state.seq.wrapping_add(state.slide);
        } else {
            self.trim_segment_front(right, state.overlap);
        }
    }

    fn right_overlap_truncate_new(&mut self, right: usize, state: &mut OverlapState, packet: &mut PacketView, stats: &mut TcpStats) {
        let right_seq = self.segments[right].seq;
        self.overwrite_packet(state, packet, right, right_seq, state.overlap, stats);
        state.trunc_len = state.overlap;
    }

    fn insert_full_overlap(&mut self, right: usize, state: &mut OverlapState, packet: &mut PacketView, stats: &mut TcpStats) -> Result<(), InsertError> {
        let right_seq = self.segments[right].seq;
        let right_end = self.segments[right].end_seq();
        let right_size = self.segments[right].size();

        match self.policy.full {
            FullOverlap::Os1 => {
                if seq_geq(state.seq_end, right_end) && seq_lt(state.seq, right_seq) {
                    self.drop_old_segment(right, state);
                    Ok(())
                } else {
                    self.full_right_overlap_truncate_new(right, state, packet, stats)
                }
            }
            FullOverlap::Os2 => {
                if (seq_geq(state.seq_end, right_end) && seq_lt(state.seq, right_seq))
                    || (seq_gt(state.seq_end, right_end) && state.seq == right_seq)
                {
                    self.drop_old_segment(right, state);
                    Ok(())
                } else {
                    self.full_right_overlap_truncate_new(right, state, packet, stats)
                }
            }
            FullOverlap::Os3 => {
                let left_detached = state.left.is_some_and(|left| self.segments[left].end_seq() != state.seq);
                if right_seq == state.seq && right_size == state.len && left_detached {
                    state.trunc_len += state.overlap;
                    if seq_leq(state.seq_end.wrapping_sub(state.trunc_len), state.seq) {
                        return Err(state.bad_segment());
                    }
                    state.right = self.next_index(right);
                } else {
                    self.drop_old_segment(right, state);
                }
                Ok(())
            }
            FullOverlap::Os4 => {
                self.drop_old_segment(right, state);
                Ok(())
            }
            FullOverlap::Os5 => self.full_right_overlap_truncate_new(right, state, packet, stats),
        }
    }

    fn drop_old_segment(&mut self, right: usize, state: &mut OverlapState) {
        self.remove_segment(right);
        state.right = (right < self.segments.len()).then_some(right);
    }

    fn full_right_overlap_truncate_new(
        &mut self,
        right: usize,
        state: &mut OverlapState,
        packet: &mut PacketView,
        stats: &mut TcpStats,
    ) -> Result<(), InsertError> {
        let right_seq = self.segments[right].seq;
        let right_size = self.segments[right].size();
        self.overwrite_packet(state, packet, right, right_seq, right_size, stats);

        if right_seq == state.seq {
            // new segment starts with a queued one, skip over it
            state.seq = state.seq.wrapping_add(right_size);
            state.left = Some(right);
            state.right = self.next_index(right);
            if state.seq == state.seq_end {
                return Err(state.bad_segment());
            }
            return Ok(());
        }

        // queue the part in front of the queued segment, continue behind it
        state.trunc_len = state.overlap;
        state.slide = state.seq.wrapping_sub(state.origin_seq);
        let mut right = right;
        if self.add_segment(state, packet, state.seq, state.left, stats).is_some() {
            right += 1;
        }
        state.seq = self.segments[right].end_seq();
        state.left = Some(right);
        state.right = self.next_index(right);
        state.trunc_len = 0;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        data_block::TcpDataBlock,
        packet::{Direction, SegmentHeader, TcpFlags},
        segment_store::{
            test::{flush_all, insert, store},
            QueueLimits,
        },
    };

    fn a_bytes() -> Vec<u8> {
        (0..50).map(|index| b'a' + (index % 26) as u8).collect()
    }

    #[test]
    fn test_policy_table() {
        let linux = ReassemblyPolicy::new(StreamPolicy::Linux, NormMode::Off);
        assert_eq!((linux.left, linux.right, linux.full), (LeftOverlap::KeepFirst, RightOverlap::TruncateExisting, FullOverlap::Os2));
        let solaris = ReassemblyPolicy::new(StreamPolicy::Solaris, NormMode::Off);
        assert_eq!((solaris.left, solaris.right, solaris.full), (LeftOverlap::TrimFirst, RightOverlap::TruncateNew, FullOverlap::Os3));
        let last = ReassemblyPolicy::new(StreamPolicy::Last, NormMode::Off);
        assert_eq!((last.left, last.right, last.full), (LeftOverlap::KeepLast, RightOverlap::TruncateExisting, FullOverlap::Os4));

        // inline rewriting fixes the packet to first-come bytes, for every policy
        for policy in StreamPolicy::ALL {
            let inline = ReassemblyPolicy::new(policy, NormMode::On);
            assert_eq!(inline.policy, StreamPolicy::First);
            assert_eq!(inline.full, FullOverlap::Os5);
            assert_eq!(inline.ips_data, NormMode::On);
        }
        assert_eq!(ReassemblyPolicy::new(StreamPolicy::Proxy, NormMode::Off).ips_data, NormMode::Off);
    }

    #[test]
    fn test_keep_first_inner_overlap() {
        let mut stats = TcpStats::default();
        let mut store = store(StreamPolicy::First, 100);
        //  100                 150
        //  |--------A---------|
        //        |==B==|
        //       120   140
        let a = a_bytes();
        insert(&mut store, 100, &a, &mut stats).unwrap();
        let result = insert(&mut store, 120, &[b'X'; 20], &mut stats);
        assert_eq!(result, Err(InsertError::BadSegment { seq: 150, end_seq: 140 }));
        assert_eq!(store.overlap_count(), 1);

        let flushed = flush_all(&mut store);
        assert_eq!(&flushed[20..40], &a[20..40]);
        assert_eq!(flushed, a);
    }

    #[test]
    fn test_keep_last_splits_existing() {
        let mut stats = TcpStats::default();
        let mut store = store(StreamPolicy::Last, 100);
        let a = a_bytes();
        insert(&mut store, 100, &a, &mut stats).unwrap();
        insert(&mut store, 120, &[b'X'; 20], &mut stats).unwrap();

        let ranges: Vec<(u32, u32)> = store.segments().map(|segment| (segment.seq, segment.end_seq())).collect();
        assert_eq!(ranges, vec![(100, 120), (120, 140), (140, 150)]);
        assert!(store.segments().all(|segment| segment.rebuilt));
        assert_eq!(store.bytes_queued_logical(), 50);
        // the split tail is not charged twice, the 20 replaced bytes stay charged until flushed
        assert_eq!(store.bytes_queued_total(), 70);
        assert_eq!(store.overlap_count(), 1);

        let flushed = flush_all(&mut store);
        assert_eq!(store.bytes_queued_total(), 0);
        assert_eq!(&flushed[..20], &a[..20]);
        assert_eq!(&flushed[20..40], &[b'X'; 20]);
        assert_eq!(&flushed[40..], &a[40..]);
    }

    #[test]
    fn test_keep_last_left_tail() {
        let mut stats = TcpStats::default();
        let mut store = store(StreamPolicy::Last, 0);
        //  0        10
        //  |aaaaaaaa|
        //       |bbbbbbbb|
        //       5        15
        insert(&mut store, 0, &[b'a'; 10], &mut stats).unwrap();
        insert(&mut store, 5, &[b'b'; 10], &mut stats).unwrap();
        assert_eq!(flush_all(&mut store), b"aaaaabbbbbbbbbb");
    }

    #[test]
    fn test_left_tail_keep_first() {
        let mut stats = TcpStats::default();
        for policy in [StreamPolicy::Bsd, StreamPolicy::Linux, StreamPolicy::First, StreamPolicy::Windows] {
            let mut store = store(policy, 0);
            insert(&mut store, 0, &[b'a'; 10], &mut stats).unwrap();
            insert(&mut store, 5, &[b'b'; 10], &mut stats).unwrap();
            assert_eq!(flush_all(&mut store), b"aaaaaaaaaabbbbb", "{}", policy);
        }
    }

    #[test]
    fn test_trim_first_cuts_queued_segment() {
        let mut stats = TcpStats::default();
        let mut store = store(StreamPolicy::Solaris, 0);
        insert(&mut store, 0, &[b'a'; 10], &mut stats).unwrap();
        insert(&mut store, 5, &[b'b'; 10], &mut stats).unwrap();
        assert_eq!(store.segments().next().unwrap().end_seq(), 5);
        assert_eq!(store.bytes_queued_logical(), 15);
        assert_eq!(flush_all(&mut store), b"aaaaabbbbbbbbbb");

        // covered entirely: nothing new
        let mut store = self::store(StreamPolicy::Hpux11, 0);
        insert(&mut store, 0, &[b'a'; 10], &mut stats).unwrap();
        assert_eq!(
            insert(&mut store, 2, &[b'b'; 8], &mut stats),
            Err(InsertError::BadSegment { seq: 10, end_seq: 10 })
        );
    }

    #[test]
    fn test_right_partial_truncate_existing() {
        let mut stats = TcpStats::default();
        let mut store = store(StreamPolicy::Bsd, 0);
        //         5        15
        //         |aaaaaaaa|
        //  |bbbbbbbb|
        //  0        10
        insert(&mut store, 5, &[b'a'; 10], &mut stats).unwrap();
        insert(&mut store, 0, &[b'b'; 10], &mut stats).unwrap();
        assert_eq!(flush_all(&mut store), b"bbbbbbbbbbaaaaa");
    }

    #[test]
    fn test_right_partial_truncate_new() {
        let mut stats = TcpStats::default();
        let mut store = store(StreamPolicy::Vista, 0);
        insert(&mut store, 5, &[b'a'; 10], &mut stats).unwrap();
        insert(&mut store, 0, &[b'b'; 10], &mut stats).unwrap();
        assert_eq!(flush_all(&mut store), b"bbbbbaaaaaaaaaa");
    }

    #[test]
    fn test_right_partial_same_start() {
        let mut stats = TcpStats::default();
        // Queued segment keeps its bytes, the shorter new one is discarded
        let mut store = store(StreamPolicy::Bsd, 0);
        insert(&mut store, 0, &[b'a'; 10], &mut stats).unwrap();
        insert(&mut store, 0, &[b'b'; 4], &mut stats).unwrap();
        assert_eq!(flush_all(&mut store), b"aaaaaaaaaa");
        assert!(stats.discards > 0);

        // Except for last
        let mut store = self::store(StreamPolicy::Last, 0);
        insert(&mut store, 0, &[b'a'; 10], &mut stats).unwrap();
        insert(&mut store, 0, &[b'b'; 4], &mut stats).unwrap();
        assert_eq!(flush_all(&mut store), b"bbbbaaaaaa");
    }

    /// Queued segment at [5,10), new one [0,15) covering it.
    fn full_overlap(policy: StreamPolicy) -> Vec<u8> {
        let mut stats = TcpStats::default();
        let mut store = store(policy, 0);
        insert(&mut store, 5, &[b'a'; 5], &mut stats).unwrap();
        insert(&mut store, 0, &[b'b'; 15], &mut stats).unwrap();
        assert_eq!(store.overlap_count(), 1);
        flush_all(&mut store)
    }

    #[test]
    fn test_full_overlap_families() {
        // os1, os2, os4 replace the covered segment
        for policy in [StreamPolicy::Bsd, StreamPolicy::Linux, StreamPolicy::OldLinux, StreamPolicy::Last, StreamPolicy::Solaris] {
            assert_eq!(full_overlap(policy), [b'b'; 15], "{}", policy);
        }
        // os5 keeps it and queues the new bytes around it
        for policy in [StreamPolicy::First, StreamPolicy::Vista, StreamPolicy::Proxy] {
            assert_eq!(full_overlap(policy), b"bbbbbaaaaabbbbb", "{}", policy);
        }
    }

    #[test]
    fn test_full_overlap_same_start() {
        fn run(policy: StreamPolicy) -> Vec<u8> {
            let mut stats = TcpStats::default();
            let mut store = store(policy, 0);
            //  0    5
            //  |aaaa|
            //  |bbbbbbbbbb|
            insert(&mut store, 0, &[b'a'; 5], &mut stats).unwrap();
            insert(&mut store, 0, &[b'b'; 10], &mut stats).unwrap();
            flush_all(&mut store)
        }
        // os1 keeps the old segment, os2 drops it when the new one reaches further
        assert_eq!(run(StreamPolicy::Bsd), b"aaaaabbbbb");
        assert_eq!(run(StreamPolicy::Linux), b"bbbbbbbbbb");
        assert_eq!(run(StreamPolicy::Irix), b"bbbbbbbbbb");
        assert_eq!(run(StreamPolicy::OldLinux), b"bbbbbbbbbb");
    }

    #[test]
    fn test_full_overlap_exact_duplicate() {
        let mut stats = TcpStats::default();
        // keep first: same range, different bytes, nothing left to insert
        let mut store = store(StreamPolicy::First, 0);
        insert(&mut store, 0, &[b'a'; 5], &mut stats).unwrap();
        assert_eq!(
            insert(&mut store, 0, &[b'b'; 5], &mut stats),
            Err(InsertError::BadSegment { seq: 5, end_seq: 5 })
        );
        assert_eq!(flush_all(&mut store), b"aaaaa");

        // os3 with a detached left neighbour
        let mut store = self::store(StreamPolicy::Solaris, 0);
        insert(&mut store, 0, b"xx", &mut stats).unwrap();
        insert(&mut store, 5, &[b'a'; 5], &mut stats).unwrap();
        assert_eq!(
            insert(&mut store, 5, &[b'b'; 5], &mut stats),
            Err(InsertError::BadSegment { seq: 5, end_seq: 10 })
        );

        // os3 with a contiguous left neighbour drops the old one
        let mut store = self::store(StreamPolicy::Solaris, 0);
        insert(&mut store, 0, b"xxxxx", &mut stats).unwrap();
        insert(&mut store, 5, &[b'a'; 5], &mut stats).unwrap();
        insert(&mut store, 5, &[b'b'; 5], &mut stats).unwrap();
        assert_eq!(flush_all(&mut store), b"xxxxxbbbbb");
    }

    #[test]
    fn test_new_segment_spans_several() {
        let mut stats = TcpStats::default();
        let mut store = store(StreamPolicy::First, 0);
        //     2  4     7  9
        //     |aa|     |cc|
        //  |bbbbbbbbbbbbbbbbb|
        //  0                 12
        insert(&mut store, 2, b"aa", &mut stats).unwrap();
        insert(&mut store, 7, b"cc", &mut stats).unwrap();
        insert(&mut store, 0, &[b'b'; 12], &mut stats).unwrap();
        assert_eq!(store.overlap_count(), 2);
        let ranges: Vec<(u32, u32)> = store.segments().map(|segment| (segment.seq, segment.end_seq())).collect();
        assert_eq!(ranges, vec![(0, 2), (2, 4), (4, 7), (7, 9), (9, 12)]);
        assert_eq!(flush_all(&mut store), b"bbaabbbccbbb");
    }

    #[test]
    fn test_partial_retransmission_over_two_segments() {
        let mut stats = TcpStats::default();
        let mut store = store(StreamPolicy::Bsd, 0);
        insert(&mut store, 0, b"abcd", &mut stats).unwrap();
        insert(&mut store, 4, b"efgh", &mut stats).unwrap();
        // same bytes again, one packet
        insert(&mut store, 0, b"abcdefgh", &mut stats).unwrap();
        assert_eq!(store.overlap_count(), 0);
        assert_eq!(store.segment_count(), 2);
        assert_eq!(stats.retransmits, 1);
        assert_eq!(flush_all(&mut store), b"abcdefgh");
    }

    #[test]
    fn test_inline_rewrite_keeps_first_bytes() {
        let mut stats = TcpStats::default();
        let mut store = SegmentStore::new(ReassemblyPolicy::new(StreamPolicy::Linux, NormMode::On), QueueLimits::default());
        store.init_base_seq(0);
        insert(&mut store, 0, b"0123456789", &mut stats).unwrap();

        let header = SegmentHeader {
            seq: 5,
            flags: TcpFlags::ACK,
            ..Default::default()
        };
        let mut payload = *b"XXXXXabcde";
        let mut packet = PacketView::writable(header, &mut payload, Direction::FromClient);
        let tdb = TcpDataBlock::extract(&packet, &mut stats);
        store.insert(&tdb, &mut packet, 0, &mut stats).unwrap();
        assert!(packet.status.contains(PacketStatus::MODIFIED));
        assert_eq!(packet.payload(), b"56789abcde");
        assert_eq!(stats.norm.get(NormPeg::IpsData, NormMode::On), 1);
        assert_eq!(flush_all(&mut store), b"0123456789abcde");
    }

    #[test]
    fn test_passive_never_touches_packet() {
        let mut stats = TcpStats::default();
        let mut store = store(StreamPolicy::First, 0);
        insert(&mut store, 0, b"0123456789", &mut stats).unwrap();

        let header = SegmentHeader {
            seq: 5,
            flags: TcpFlags::ACK,
            ..Default::default()
        };
        let mut payload = *b"XXXXXabcde";
        let mut packet = PacketView::writable(header, &mut payload, Direction::FromClient);
        let tdb = TcpDataBlock::extract(&packet, &mut stats);
        store.insert(&tdb, &mut packet, 0, &mut stats).unwrap();
        assert_eq!(packet.payload(), b"XXXXXabcde");
        assert!(!packet.status.contains(PacketStatus::MODIFIED));
        assert_eq!(stats.norm.get(NormPeg::IpsData, NormMode::Off), 1);
    }
}
