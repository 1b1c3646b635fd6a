/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */
use crate::{
    packet::{PacketView, TcpFlags},
    stats::TcpStats,
};

/// Sequence space of one packet, extracted once and adjusted while the packet is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpDataBlock {
    pub seq: u32,
    pub ack: u32,
    /// Advertised window, scaled once the session negotiated window scaling.
    pub window: u32,
    /// `seq + payload`, plus one for a SYN. FIN is accounted by the state machine.
    pub end_seq: u32,
    /// Timestamp option value, 0 when absent or not yet read.
    pub ts: u32,
}

impl TcpDataBlock {
    pub fn extract(packet: &PacketView, stats: &mut TcpStats) -> Self {
        let header = &packet.header;
        let mut end_seq = header.seq.wrapping_add(packet.dsize() as u32);
        if header.flags.contains(TcpFlags::SYN) {
            end_seq = end_seq.wrapping_add(1);
            if !header.flags.contains(TcpFlags::ACK) {
                stats.syns_received += 1;
                log::trace!("SYN received, seq {:#010x}", header.seq);
            }
        }
        Self {
            seq: header.seq,
            ack: header.ack,
            window: header.window as u32,
            end_seq,
            ts: 0,
        }
    }

    /// Payload length in sequence space, SYN excluded.
    pub fn payload_len(&self, flags: TcpFlags) -> u32 {
        let len = self.end_seq.wrapping_sub(self.seq);
        if flags.contains(TcpFlags::SYN) {
            len.saturating_sub(1)
        } else {
            len
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::{Direction, SegmentHeader};

    fn header(seq: u32, flags: TcpFlags) -> SegmentHeader {
        SegmentHeader {
            seq,
            ack: 77,
            window: 512,
            flags,
            ..Default::default()
        }
    }

    #[test]
    fn test_extract() {
        let mut stats = TcpStats::default();

        let packet = PacketView::new(header(u32::MAX - 1, TcpFlags::ACK | TcpFlags::PSH), b"hello", Direction::FromClient);
        let tdb = TcpDataBlock::extract(&packet, &mut stats);
        assert_eq!(tdb.end_seq, 3);
        assert_eq!(tdb.ack, 77);
        assert_eq!(tdb.window, 512);
        assert_eq!(tdb.payload_len(packet.flags()), 5);
        assert_eq!(stats.syns_received, 0);

        let packet = PacketView::new(header(1000, TcpFlags::SYN), b"", Direction::FromClient);
        let tdb = TcpDataBlock::extract(&packet, &mut stats);
        assert_eq!(tdb.end_seq, 1001);
        assert_eq!(tdb.payload_len(packet.flags()), 0);
        assert_eq!(stats.syns_received, 1);

        let packet = PacketView::new(header(1000, TcpFlags::FIN | TcpFlags::ACK), b"ab", Direction::FromServer);
        let tdb = TcpDataBlock::extract(&packet, &mut stats);
        assert_eq!(tdb.end_seq, 1002);
        assert_eq!(stats.syns_received, 1);
    }
}
