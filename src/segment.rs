/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */
use crate::seq::seq_lt;

/// Buffered, not yet flushed payload bytes starting at `seq`.
///
/// The captured bytes are kept as allocated, overlap resolution only moves the
/// live window (`offset`, `size`) over them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub seq: u32,
    data: Vec<u8>,
    offset: usize,
    size: usize,
    /// Timestamp option value of the packet that carried the bytes.
    pub ts: u32,
    /// Bytes were trimmed, split or inserted around an overlap.
    pub rebuilt: bool,
    /// Share of the queue limit held by this segment. Bytes given up to overlaps stay charged,
    /// delivered bytes do not.
    pub(crate) charged: u32,
}

impl TcpSegment {
    pub fn new(seq: u32, bytes: &[u8], ts: u32) -> Self {
        Self {
            seq,
            data: bytes.to_vec(),
            offset: 0,
            size: bytes.len(),
            ts,
            rebuilt: false,
            charged: bytes.len() as u32,
        }
    }

    pub fn size(&self) -> u32 {
        self.size as u32
    }

    pub fn end_seq(&self) -> u32 {
        self.seq.wrapping_add(self.size as u32)
    }

    /// Bytes counted against the queue limit.
    pub fn charged(&self) -> u32 {
        self.charged
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.size]
    }

    /// Drop `len` bytes at the beginning, the segment then starts `len` bytes later.
    pub fn trim_front(&mut self, len: u32) {
        let len = (len as usize).min(self.size);
        self.offset += len;
        self.size -= len;
        self.seq = self.seq.wrapping_add(len as u32);
    }

    pub fn trim_back(&mut self, len: u32) {
        self.size -= (len as usize).min(self.size);
    }

    /// Same start and the same bytes over the shorter of both lengths.
    pub fn is_retransmit(&self, rdata: &[u8], rseq: u32) -> bool {
        if self.seq != rseq {
            return false;
        }
        let len = self.size.min(rdata.len());
        self.payload()[..len] == rdata[..len]
    }

    pub fn contains(&self, seq: u32) -> bool {
        !seq_lt(seq, self.seq) && seq_lt(seq, self.end_seq())
    }
}
