/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */
use crate::{
    data_block::TcpDataBlock,
    error::InsertError,
    events::FlushFlags,
    overlap::{OverlapState, ReassemblyPolicy},
    packet::{PacketStatus, PacketView, TcpFlags},
    segment::TcpSegment,
    seq::{seq_geq, seq_gt, seq_leq, seq_lt, seq_max},
    stats::TcpStats,
};

/// Queue caps of one direction, 0 means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueLimits {
    pub max_bytes: u32,
    pub max_segs: u32,
}

/// Buffered, unflushed segments of one direction, ordered by sequence number.
///
/// Concept of operation:
/// * `base_seq` is the sequence number of the next byte to deliver. It only moves forward.
/// * Segments never overlap once an insert returns, overlaps are resolved by the [ReassemblyPolicy].
/// * Flushing hands the contiguous prefix starting at `base_seq` to a consumer, which may consume
///   less than offered. The rest stays queued.
#[derive(Debug)]
pub struct SegmentStore {
    pub(crate) segments: Vec<TcpSegment>,
    pub(crate) base_seq: u32,
    /// Bytes charged by all queued segments: live ones plus those given up to overlaps.
    pub(crate) bytes_total: u32,
    /// Live bytes of all queued segments, bytes given up to overlaps excluded.
    pub(crate) bytes_logical: u32,
    pub(crate) overlap_count: u32,
    pub(crate) policy: ReassemblyPolicy,
    limits: QueueLimits,
    /// Reused between flushes.
    flush_buffer: Vec<u8>,
    total_bytes_flushed: u64,
}

impl SegmentStore {
    pub fn new(policy: ReassemblyPolicy, limits: QueueLimits) -> Self {
        Self {
            segments: Vec::new(),
            base_seq: 0,
            bytes_total: 0,
            bytes_logical: 0,
            overlap_count: 0,
            policy,
            limits,
            flush_buffer: Vec::new(),
            total_bytes_flushed: 0,
        }
    }

    pub fn base_seq(&self) -> u32 {
        self.base_seq
    }

    /// Set the starting point of the stream. Only while nothing is queued.
    pub fn init_base_seq(&mut self, seq: u32) {
        if self.segments.is_empty() {
            self.base_seq = seq;
        }
    }

    /// Skip forward, e.g. over bytes nobody wants to see. Never moves backwards.
    pub fn advance_base_seq(&mut self, seq: u32) {
        if self.segments.is_empty() && seq_gt(seq, self.base_seq) {
            self.base_seq = seq;
        }
    }

    /// Jump over a hole in front of the head segment, if the head starts at or before `limit`.
    /// Returns the hole as (seq, length).
    pub fn skip_hole(&mut self, limit: u32) -> Option<(u32, u32)> {
        let head_seq = self.segments.first()?.seq;
        if seq_gt(head_seq, self.base_seq) && seq_geq(limit, head_seq) {
            let hole = (self.base_seq, head_seq.wrapping_sub(self.base_seq));
            self.base_seq = head_seq;
            return Some(hole);
        }
        None
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn bytes_queued_total(&self) -> u32 {
        self.bytes_total
    }

    pub fn bytes_queued_logical(&self) -> u32 {
        self.bytes_logical
    }

    pub fn overlap_count(&self) -> u32 {
        self.overlap_count
    }

    pub fn reset_overlap_count(&mut self) {
        self.overlap_count = 0;
    }

    pub fn total_bytes_flushed(&self) -> u64 {
        self.total_bytes_flushed
    }

    pub fn policy(&self) -> &ReassemblyPolicy {
        &self.policy
    }

    pub fn segments(&self) -> impl Iterator<Item = &TcpSegment> {
        self.segments.iter()
    }

    /// End of the last queued byte.
    pub fn seq_end(&self) -> Option<u32> {
        self.segments.last().map(|segment| segment.end_seq())
    }

    /// Queue the payload of `packet`, resolving overlaps with already queued bytes.
    /// Bytes before `base_seq` or `window_base` are already delivered and ignored.
    pub fn insert(&mut self, tdb: &TcpDataBlock, packet: &mut PacketView, window_base: u32, stats: &mut TcpStats) -> Result<(), InsertError> {
        let dsize = packet.dsize() as u32;
        if dsize == 0 {
            return Ok(());
        }

        let mut seq = tdb.seq;
        if packet.flags().contains(TcpFlags::SYN) {
            seq = seq.wrapping_add(1);
        }

        let clip = if self.segments.is_empty() {
            self.base_seq
        } else {
            seq_max(self.base_seq, window_base)
        };
        let mut offset = 0;
        if seq_gt(clip, seq) {
            offset = clip.wrapping_sub(seq);
            if offset >= dsize {
                log::trace!("segment {:#010x}+{} already delivered", seq, dsize);
                return Ok(());
            }
        }
        let seq = seq.wrapping_add(offset);
        if self.is_retransmit(seq, &packet.payload()[offset as usize..]) {
            stats.retransmits += 1;
            packet.status |= PacketStatus::RETRANSMIT;
            return Ok(());
        }
        self.check_limits(dsize - offset, stats)?;

        let mut state = OverlapState::new(seq, offset as usize, dsize - offset, tdb.ts);

        if self.segments.is_empty() {
            self.add_segment(&state, packet, state.seq, None, stats);
            return Ok(());
        }

        if let Some(tail) = self.segments.last() {
            if tail.end_seq() == state.seq {
                let left = Some(self.segments.len() - 1);
                self.add_segment(&state, packet, state.seq, left, stats);
                return Ok(());
            }
        }

        self.resolve_and_insert(&mut state, packet, stats)
    }

    /// All of `bytes` queued already, same bytes at the same sequence numbers.
    fn is_retransmit(&self, seq: u32, bytes: &[u8]) -> bool {
        let index = self.segments.partition_point(|segment| seq_leq(segment.end_seq(), seq));
        let mut cursor = seq;
        let mut rest = bytes;
        for segment in self.segments[index..].iter() {
            if rest.is_empty() || !segment.contains(cursor) {
                break;
            }
            let queued = &segment.payload()[cursor.wrapping_sub(segment.seq) as usize..];
            let len = rest.len().min(queued.len());
            if queued[..len] != rest[..len] {
                return false;
            }
            rest = &rest[len..];
            cursor = cursor.wrapping_add(len as u32);
        }
        rest.is_empty()
    }

    fn check_limits(&self, dsize: u32, stats: &mut TcpStats) -> Result<(), InsertError> {
        if self.limits.max_bytes > 0 && self.bytes_total.saturating_add(dsize) > self.limits.max_bytes {
            stats.max_bytes += 1;
            return Err(InsertError::QueuedBytesLimit {
                limit: self.limits.max_bytes,
            });
        }
        if self.limits.max_segs > 0 && self.segments.len() as u32 + 1 > self.limits.max_segs {
            stats.max_segs += 1;
            return Err(InsertError::QueuedSegmentsLimit {
                limit: self.limits.max_segs,
            });
        }
        Ok(())
    }

    /// New segment of `len - slide - trunc_len` packet bytes after `left`. Returns its index,
    /// `None` when trimming left nothing.
    pub(crate) fn add_segment(
        &mut self,
        state: &OverlapState,
        packet: &PacketView,
        seq: u32,
        left: Option<usize>,
        stats: &mut TcpStats,
    ) -> Option<usize> {
        let new_size = state.len as i64 - state.slide as i64 - state.trunc_len as i64;
        if new_size <= 0 {
            stats.discards += 1;
            log::trace!("segment {:#010x} trimmed to nothing, discarded", seq);
            return None;
        }
        let start = state.origin_offset + state.slide as usize;
        let bytes = &packet.payload()[start..start + new_size as usize];
        let mut segment = TcpSegment::new(seq, bytes, state.ts);
        segment.rebuilt = state.rebuilt;

        let index = left.map_or(0, |left| left + 1);
        self.insert_segment(index, segment);
        stats.segs_queued += 1;
        Some(index)
    }

    pub(crate) fn insert_segment(&mut self, index: usize, segment: TcpSegment) {
        self.bytes_total += segment.charged;
        self.bytes_logical += segment.size();
        self.segments.insert(index, segment);
    }

    pub(crate) fn remove_segment(&mut self, index: usize) -> TcpSegment {
        let segment = self.segments.remove(index);
        self.bytes_total -= segment.charged;
        self.bytes_logical -= segment.size();
        segment
    }

    pub(crate) fn trim_segment_front(&mut self, index: usize, len: u32) {
        let segment = &mut self.segments[index];
        let len = len.min(segment.size());
        segment.trim_front(len);
        segment.rebuilt = true;
        self.bytes_logical -= len;
    }

    pub(crate) fn trim_segment_back(&mut self, index: usize, len: u32) {
        let segment = &mut self.segments[index];
        let len = len.min(segment.size());
        segment.trim_back(len);
        segment.rebuilt = true;
        self.bytes_logical -= len;
    }

    /// Offer the contiguous prefix, up to `limit` if given. Returns the consumed amount.
    pub fn flush(&mut self, limit: Option<u32>, consume: &mut dyn FnMut(u32, &[u8], FlushFlags) -> usize) -> u32 {
        self.flush_run(limit, FlushFlags::empty(), consume).1
    }

    /// Returns (offered, consumed) bytes of the contiguous run at `base_seq`.
    fn flush_run(&mut self, limit: Option<u32>, flags: FlushFlags, consume: &mut dyn FnMut(u32, &[u8], FlushFlags) -> usize) -> (u32, u32) {
        if self.segments.first().map_or(true, |head| head.seq != self.base_seq) {
            return (0, 0);
        }

        let mut buffer = std::mem::take(&mut self.flush_buffer);
        buffer.clear();
        let mut cursor = self.base_seq;
        let mut flags = flags;
        let mut whole_queue = true;
        for segment in self.segments.iter() {
            if segment.seq != cursor {
                whole_queue = false;
                break;
            }
            let mut take = segment.size();
            if let Some(limit) = limit {
                if seq_geq(cursor, limit) {
                    whole_queue = false;
                    break;
                }
                take = take.min(limit.wrapping_sub(cursor));
            }
            buffer.extend_from_slice(&segment.payload()[..take as usize]);
            if segment.rebuilt {
                flags |= FlushFlags::REBUILT;
            }
            cursor = cursor.wrapping_add(take);
            if take < segment.size() {
                whole_queue = false;
                break;
            }
        }
        if whole_queue {
            flags |= FlushFlags::PDU_TAIL;
        }

        let offered = buffer.len() as u32;
        let consumed = if buffer.is_empty() {
            0
        } else {
            consume(self.base_seq, &buffer, flags).min(buffer.len()) as u32
        };
        self.flush_buffer = buffer;
        self.purge_front(consumed);
        (offered, consumed)
    }

    /// Deliver everything, holes included. Holes and unconsumed bytes are reported as lost.
    pub fn force_flush(
        &mut self,
        consume: &mut dyn FnMut(u32, &[u8], FlushFlags) -> usize,
        inform_packet_loss: &mut dyn FnMut(u32, u32),
        stats: &mut TcpStats,
    ) -> u32 {
        let mut flushed = 0;
        while let Some(head) = self.segments.first() {
            let head_seq = head.seq;
            if seq_gt(head_seq, self.base_seq) {
                stats.gaps += 1;
                inform_packet_loss(self.base_seq, head_seq.wrapping_sub(self.base_seq));
                self.base_seq = head_seq;
            } else if seq_lt(head_seq, self.base_seq) {
                // Stale head, should not happen after a clean insert.
                let stale = self.base_seq.wrapping_sub(head_seq);
                self.purge_stale_head(stale);
                continue;
            }

            let (offered, consumed) = self.flush_run(None, FlushFlags::FORCED, consume);
            flushed += consumed;
            if consumed < offered {
                let dropped = offered - consumed;
                inform_packet_loss(self.base_seq, dropped);
                self.purge_front(dropped);
            }
        }
        flushed
    }

    fn purge_stale_head(&mut self, stale: u32) {
        if self.segments[0].size() <= stale {
            self.remove_segment(0);
        } else {
            self.release_front(0, stale);
        }
    }

    /// Drop delivered bytes at the front of a segment, they no longer count against the limit.
    fn release_front(&mut self, index: usize, len: u32) {
        let segment = &mut self.segments[index];
        let len = len.min(segment.size());
        segment.trim_front(len);
        let released = len.min(segment.charged);
        segment.charged -= released;
        self.bytes_total -= released;
        self.bytes_logical -= len;
    }

    /// `tail` holds a copy of the last bytes of the segment at `index`, their charge moves with them.
    pub(crate) fn move_charge(&mut self, index: usize, tail: &mut TcpSegment) {
        let segment = &mut self.segments[index];
        let moved = tail.size().min(segment.charged);
        segment.charged -= moved;
        self.bytes_total -= moved;
        tail.charged = moved;
    }

    /// Drop `len` delivered bytes at the head and advance `base_seq`.
    fn purge_front(&mut self, len: u32) {
        let mut remaining = len;
        while remaining > 0 {
            let Some(head) = self.segments.first() else {
                break;
            };
            let size = head.size();
            if size <= remaining {
                self.remove_segment(0);
                remaining -= size;
            } else {
                self.release_front(0, remaining);
                remaining = 0;
            }
        }
        self.base_seq = self.base_seq.wrapping_add(len - remaining);
        self.total_bytes_flushed += (len - remaining) as u64;
    }

    /// Drop everything queued, `base_seq` stays.
    pub fn purge(&mut self) -> usize {
        let count = self.segments.len();
        self.segments.clear();
        self.bytes_total = 0;
        self.bytes_logical = 0;
        count
    }
}
