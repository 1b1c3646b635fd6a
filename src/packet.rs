/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */

//! Decoded view of one TCP packet, as handed in by the capture/decoding layer.
//!
//! The payload is either shared (passive monitoring, never touched) or writable
//! (inline, the caller re-serializes the packet after processing). In-place
//! normalization is only reachable through [PacketView::inline_edit], which is
//! `None` for shared payloads.

use std::net::{IpAddr, Ipv4Addr};

use bitflags::bitflags;
use etherparse::{TcpHeaderSlice, TcpOptionElement};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
        const ECE = 0x40;
        const CWR = 0x80;
    }
}

impl TcpFlags {
    pub fn from_header(tcp_header_slice: &TcpHeaderSlice) -> Self {
        let mut flags = TcpFlags::empty();
        flags.set(TcpFlags::FIN, tcp_header_slice.fin());
        flags.set(TcpFlags::SYN, tcp_header_slice.syn());
        flags.set(TcpFlags::RST, tcp_header_slice.rst());
        flags.set(TcpFlags::PSH, tcp_header_slice.psh());
        flags.set(TcpFlags::ACK, tcp_header_slice.ack());
        flags.set(TcpFlags::URG, tcp_header_slice.urg());
        flags.set(TcpFlags::ECE, tcp_header_slice.ece());
        flags.set(TcpFlags::CWR, tcp_header_slice.cwr());
        flags
    }

    /// SYN without ACK. Other flags do not matter.
    pub fn is_syn_only(self) -> bool {
        self & (TcpFlags::SYN | TcpFlags::ACK) == TcpFlags::SYN
    }

    pub fn is_syn_ack(self) -> bool {
        self.contains(TcpFlags::SYN | TcpFlags::ACK)
    }
}

/// Direction of a packet relative to the session roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    FromClient,
    FromServer,
}

impl Direction {
    pub fn is_from_client(self) -> bool {
        self == Direction::FromClient
    }

    pub fn reverse(self) -> Self {
        match self {
            Direction::FromClient => Direction::FromServer,
            Direction::FromServer => Direction::FromClient,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpTimestamp {
    pub value: u32,
    pub echo: u32,
}

/// The TCP options the reassembly core cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpOptions {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    pub timestamp: Option<TcpTimestamp>,
}

impl TcpOptions {
    /// Malformed option lists are read up to the first broken element.
    pub fn from_header(tcp_header_slice: &TcpHeaderSlice) -> Self {
        let mut options = TcpOptions::default();
        for element in tcp_header_slice.options_iterator() {
            match element {
                Ok(TcpOptionElement::MaximumSegmentSize(mss)) => options.mss = Some(mss),
                Ok(TcpOptionElement::WindowScale(shift)) => options.window_scale = Some(shift),
                Ok(TcpOptionElement::Timestamp(value, echo)) => options.timestamp = Some(TcpTimestamp { value, echo }),
                Ok(_) => {}
                Err(_) => break,
            }
        }
        options
    }
}

/// TCP header fields copied out of the wire header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub window: u16,
    pub flags: TcpFlags,
    pub options: TcpOptions,
}

impl From<&TcpHeaderSlice<'_>> for SegmentHeader {
    fn from(tcp_header_slice: &TcpHeaderSlice<'_>) -> Self {
        Self {
            source_port: tcp_header_slice.source_port(),
            destination_port: tcp_header_slice.destination_port(),
            seq: tcp_header_slice.sequence_number(),
            ack: tcp_header_slice.acknowledgment_number(),
            window: tcp_header_slice.window_size(),
            flags: TcpFlags::from_header(tcp_header_slice),
            options: TcpOptions::from_header(tcp_header_slice),
        }
    }
}

/// Ethernet addresses of the frame, used for hijack detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MacAddresses {
    pub source: [u8; 6],
    pub destination: [u8; 6],
}

bitflags! {
    /// Verdict and bookkeeping bits left on the packet for the caller.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketStatus: u16 {
        /// Header or payload bytes were rewritten, the caller must re-serialize.
        const MODIFIED = 0x0001;
        /// Payload length changed.
        const RESIZED = 0x0002;
        /// Inline mode asked to block this packet.
        const DROPPED = 0x0004;
        const STREAM_ORDER_OK = 0x0008;
        const STREAM_ORDER_BAD = 0x0010;
        const STREAM_UNESTABLISHED = 0x0020;
        const STREAM_ESTABLISHED = 0x0040;
        /// Session has seen the full three-way handshake.
        const STREAM_TWH = 0x0080;
        const RETRANSMIT = 0x0100;
        /// Packet is ignored for stream purposes (discarded by the tracker).
        const IGNORED = 0x0200;
    }
}

#[derive(Debug)]
enum Payload<'a> {
    Shared(&'a [u8]),
    Writable(&'a mut [u8]),
}

/// One decoded TCP packet.
#[derive(Debug)]
pub struct PacketView<'a> {
    pub source_address: IpAddr,
    pub destination_address: IpAddr,
    pub header: SegmentHeader,
    payload: Payload<'a>,
    /// Logical payload length. Trimming reduces it, bytes past it are not part of the segment anymore.
    dsize: usize,
    pub direction: Direction,
    /// Capture time, seconds.
    pub time_secs: u32,
    pub macs: Option<MacAddresses>,
    pub status: PacketStatus,
}

impl<'a> PacketView<'a> {
    /// Passive view, payload is never modified.
    pub fn new(header: SegmentHeader, payload: &'a [u8], direction: Direction) -> Self {
        Self {
            source_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            destination_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            header,
            dsize: payload.len(),
            payload: Payload::Shared(payload),
            direction,
            time_secs: 0,
            macs: None,
            status: PacketStatus::empty(),
        }
    }

    /// Inline view, normalization may rewrite `payload` in place.
    pub fn writable(header: SegmentHeader, payload: &'a mut [u8], direction: Direction) -> Self {
        Self {
            source_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            destination_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            header,
            dsize: payload.len(),
            payload: Payload::Writable(payload),
            direction,
            time_secs: 0,
            macs: None,
            status: PacketStatus::empty(),
        }
    }

    pub fn with_addresses(mut self, source_address: IpAddr, destination_address: IpAddr) -> Self {
        self.source_address = source_address;
        self.destination_address = destination_address;
        self
    }

    pub fn with_time(mut self, time_secs: u32) -> Self {
        self.time_secs = time_secs;
        self
    }

    pub fn with_macs(mut self, macs: MacAddresses) -> Self {
        self.macs = Some(macs);
        self
    }

    pub fn flags(&self) -> TcpFlags {
        self.header.flags
    }

    pub fn dsize(&self) -> usize {
        self.dsize
    }

    /// Payload bytes up to the logical length.
    pub fn payload(&self) -> &[u8] {
        match &self.payload {
            Payload::Shared(payload) => &payload[..self.dsize],
            Payload::Writable(payload) => &payload[..self.dsize],
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.payload, Payload::Writable(_))
    }

    pub fn is_from_client(&self) -> bool {
        self.direction.is_from_client()
    }

    /// Mutation handle, present only for writable packets.
    pub fn inline_edit(&mut self) -> Option<InlineEdit<'_>> {
        match &mut self.payload {
            Payload::Shared(_) => None,
            Payload::Writable(payload) => Some(InlineEdit {
                payload: &mut payload[..],
                dsize: &mut self.dsize,
                header: &mut self.header,
                status: &mut self.status,
            }),
        }
    }
}

/// Capability to rewrite a packet in place.
pub struct InlineEdit<'p> {
    payload: &'p mut [u8],
    dsize: &'p mut usize,
    header: &'p mut SegmentHeader,
    status: &'p mut PacketStatus,
}

impl InlineEdit<'_> {
    /// Overwrite payload bytes starting at `offset`. Bytes past the logical length are left alone.
    pub fn overwrite(&mut self, offset: usize, bytes: &[u8]) {
        if offset >= *self.dsize {
            return;
        }
        let len = bytes.len().min(*self.dsize - offset);
        if self.payload[offset..offset + len] != bytes[..len] {
            self.payload[offset..offset + len].copy_from_slice(&bytes[..len]);
            *self.status |= PacketStatus::MODIFIED;
        }
    }

    /// Cut the payload down to `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        if len < *self.dsize {
            *self.dsize = len;
            *self.status |= PacketStatus::MODIFIED | PacketStatus::RESIZED;
        }
    }

    pub fn clear_flags(&mut self, flags: TcpFlags) {
        if self.header.flags.intersects(flags) {
            self.header.flags.remove(flags);
            *self.status |= PacketStatus::MODIFIED;
        }
    }

    /// Replace the timestamp option by NOPs.
    pub fn strip_timestamp(&mut self) {
        if self.header.options.timestamp.take().is_some() {
            *self.status |= PacketStatus::MODIFIED;
        }
    }

    pub fn block(&mut self) {
        *self.status |= PacketStatus::DROPPED;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn header(flags: TcpFlags) -> SegmentHeader {
        SegmentHeader {
            source_port: 1000,
            destination_port: 80,
            seq: 1,
            ack: 0,
            window: 1024,
            flags,
            options: TcpOptions::default(),
        }
    }

    #[test]
    fn test_flag_shapes() {
        assert!(TcpFlags::SYN.is_syn_only());
        assert!((TcpFlags::SYN | TcpFlags::ECE | TcpFlags::CWR).is_syn_only());
        assert!(!(TcpFlags::SYN | TcpFlags::ACK).is_syn_only());
        assert!((TcpFlags::SYN | TcpFlags::ACK).is_syn_ack());
    }

    #[test]
    fn test_shared_payload_has_no_edit() {
        let payload = [1u8, 2, 3];
        let mut packet = PacketView::new(header(TcpFlags::ACK), &payload, Direction::FromClient);
        assert!(packet.inline_edit().is_none());
        assert_eq!(packet.payload(), &[1, 2, 3]);
    }

    #[test]
    fn test_inline_edit() {
        let mut payload = [1u8, 2, 3, 4];
        let mut packet = PacketView::writable(header(TcpFlags::ACK | TcpFlags::ECE), &mut payload, Direction::FromClient);
        {
            let mut edit = packet.inline_edit().unwrap();
            edit.overwrite(1, &[9, 9, 9, 9, 9]);
            edit.truncate(3);
            edit.clear_flags(TcpFlags::ECE | TcpFlags::CWR);
        }
        assert_eq!(packet.payload(), &[1, 9, 9]);
        assert_eq!(packet.flags(), TcpFlags::ACK);
        assert!(packet.status.contains(PacketStatus::MODIFIED | PacketStatus::RESIZED));
    }
}
