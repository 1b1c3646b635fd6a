/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */

//! Anomaly events, per-packet actions and the interface to the upper layers.

use std::fmt;

use bitflags::bitflags;

use crate::{packet::Direction, tcp_connection::TcpConnection};

/// Generator id of TCP stream events.
pub const GID_STREAM_TCP: u32 = 129;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TcpEvent {
    SynOnEstablished = 1,
    DataOnSyn = 2,
    DataOnClosed = 3,
    BadTimestamp = 4,
    BadSegment = 5,
    WindowTooLarge = 6,
    ExcessiveOverlap = 7,
    DataAfterReset = 8,
    SessionHijackedClient = 9,
    SessionHijackedServer = 10,
    DataWithoutFlags = 11,
    SmallSegment = 12,
    FourWayHandshake = 13,
    NoTimestamp = 14,
    BadRst = 15,
    BadFin = 16,
    BadAck = 17,
    DataAfterRstRcvd = 18,
    WindowSlam = 19,
    No3WayHandshake = 20,
}

impl TcpEvent {
    pub const ALL: [TcpEvent; 20] = [
        TcpEvent::SynOnEstablished,
        TcpEvent::DataOnSyn,
        TcpEvent::DataOnClosed,
        TcpEvent::BadTimestamp,
        TcpEvent::BadSegment,
        TcpEvent::WindowTooLarge,
        TcpEvent::ExcessiveOverlap,
        TcpEvent::DataAfterReset,
        TcpEvent::SessionHijackedClient,
        TcpEvent::SessionHijackedServer,
        TcpEvent::DataWithoutFlags,
        TcpEvent::SmallSegment,
        TcpEvent::FourWayHandshake,
        TcpEvent::NoTimestamp,
        TcpEvent::BadRst,
        TcpEvent::BadFin,
        TcpEvent::BadAck,
        TcpEvent::DataAfterRstRcvd,
        TcpEvent::WindowSlam,
        TcpEvent::No3WayHandshake,
    ];

    pub fn gid(self) -> u32 {
        GID_STREAM_TCP
    }

    pub fn sid(self) -> u32 {
        self as u32
    }

    pub fn description(self) -> &'static str {
        match self {
            TcpEvent::SynOnEstablished => "SYN on established session",
            TcpEvent::DataOnSyn => "data on SYN packet",
            TcpEvent::DataOnClosed => "data sent on stream not accepting data",
            TcpEvent::BadTimestamp => "TCP timestamp is outside of PAWS window",
            TcpEvent::BadSegment => "bad segment, adjusted size <= 0",
            TcpEvent::WindowTooLarge => "window size (after scaling) larger than policy allows",
            TcpEvent::ExcessiveOverlap => "limit on number of overlapping TCP packets reached",
            TcpEvent::DataAfterReset => "data sent on stream after TCP reset sent",
            TcpEvent::SessionHijackedClient => "TCP client possibly hijacked, different ethernet address",
            TcpEvent::SessionHijackedServer => "TCP server possibly hijacked, different ethernet address",
            TcpEvent::DataWithoutFlags => "TCP data with no TCP flags set",
            TcpEvent::SmallSegment => "consecutive TCP small segments exceeding threshold",
            TcpEvent::FourWayHandshake => "TCP 4-way handshake detected",
            TcpEvent::NoTimestamp => "TCP timestamp is missing",
            TcpEvent::BadRst => "reset outside window",
            TcpEvent::BadFin => "FIN number is greater than prior FIN",
            TcpEvent::BadAck => "ACK number is greater than prior FIN",
            TcpEvent::DataAfterRstRcvd => "data sent on stream after TCP reset received",
            TcpEvent::WindowSlam => "TCP window closed before receiving data",
            TcpEvent::No3WayHandshake => "TCP session without 3-way handshake",
        }
    }

    fn mask(self) -> EventMask {
        EventMask::from_bits_retain(1 << (self as u32 - 1))
    }
}

impl fmt::Display for TcpEvent {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "({}:{}) {}", self.gid(), self.sid(), self.description())
    }
}

bitflags! {
    /// Events raised while processing one packet, one bit per [TcpEvent].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventMask: u32 {
        const SYN_ON_EST = 1 << 0;
        const DATA_ON_SYN = 1 << 1;
        const DATA_ON_CLOSED = 1 << 2;
        const BAD_TIMESTAMP = 1 << 3;
        const BAD_SEGMENT = 1 << 4;
        const WINDOW_TOO_LARGE = 1 << 5;
        const EXCESSIVE_OVERLAP = 1 << 6;
        const DATA_AFTER_RESET = 1 << 7;
        const SESSION_HIJACK_CLIENT = 1 << 8;
        const SESSION_HIJACK_SERVER = 1 << 9;
        const DATA_WITHOUT_FLAGS = 1 << 10;
        const SMALL_SEGMENT = 1 << 11;
        const FOUR_WAY_HANDSHAKE = 1 << 12;
        const NO_TIMESTAMP = 1 << 13;
        const BAD_RST = 1 << 14;
        const BAD_FIN = 1 << 15;
        const BAD_ACK = 1 << 16;
        const DATA_AFTER_RST_RCVD = 1 << 17;
        const WINDOW_SLAM = 1 << 18;
        const NO_3WHS = 1 << 19;
    }
}

impl EventMask {
    pub fn raise(&mut self, event: TcpEvent) {
        *self |= event.mask();
    }

    pub fn has(&self, event: TcpEvent) -> bool {
        self.contains(event.mask())
    }

    /// Raised events in sid order.
    pub fn events(self) -> impl Iterator<Item = TcpEvent> {
        TcpEvent::ALL.into_iter().filter(move |event| self.contains(event.mask()))
    }
}

bitflags! {
    /// What the caller should do with the packet or session. Empty means nothing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Action: u32 {
        /// Session was reset.
        const RST = 0x01;
        /// Packet is not acceptable, inline mode may drop it.
        const BAD_PKT = 0x02;
        /// Session is finished and released.
        const LWSSN_CLOSED = 0x04;
        const DISABLE_INSPECTION = 0x08;
    }
}

/// Session lifecycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    Established,
    Reset,
    Closed,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FlushFlags: u8 {
        /// At least one delivered byte was rewritten by overlap resolution or retransmission handling.
        const REBUILT = 0x01;
        /// Delivered while draining, unconsumed bytes are dropped afterwards.
        const FORCED = 0x02;
        /// Nothing else queued after this span right now.
        const PDU_TAIL = 0x04;
    }
}

/// One contiguous reassembled span.
#[derive(Debug)]
pub struct FlushData<'d> {
    pub connection_id: u32,
    pub connection: &'d TcpConnection,
    /// Direction in which the bytes travelled.
    pub direction: Direction,
    /// Sequence number of `data[0]`.
    pub seq: u32,
    pub data: &'d [u8],
    pub flags: FlushFlags,
}

/// Upper-layer collaborator: stream splitter, detection and alert sink.
pub trait StreamObserver {
    /// Return the amount of consumed bytes. Unconsumed bytes stay queued and are offered again
    /// together with more data, unless the flush is forced.
    fn flush(&mut self, data: FlushData<'_>) -> usize {
        data.data.len()
    }

    /// Bytes that will never be delivered: a hole in the stream or unconsumed bytes at a forced flush.
    fn packet_loss(&mut self, _connection_id: u32, _direction: Direction, _seq: u32, _lost_bytes: u32) {}

    fn session_event(&mut self, _connection_id: u32, _connection: &TcpConnection, _event: SessionEvent) {}

    fn alert(&mut self, _connection_id: u32, _event: TcpEvent) {}

    /// Asked when a session starts tracking. `false` means nobody inspects that direction
    /// and its data is not buffered at all.
    fn wants_reassembly(&mut self, _connection: &TcpConnection, _to_server: bool) -> bool {
        true
    }
}

/// Observer that consumes everything and ignores the rest.
#[derive(Debug, Default)]
pub struct NullObserver;

impl StreamObserver for NullObserver {}
