/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */

//! Per target policy decisions on non-conforming traffic.
//!
//! Every correction is counted in [crate::stats::NormStats] under the mode of its
//! category. It only touches the packet when the category is on and the packet was
//! handed in writable, passive builds can count but never mutate.

use crate::{
    config::{NormMode, NormalizationConfig, StreamPolicy},
    data_block::TcpDataBlock,
    events::{Action, EventMask, TcpEvent},
    packet::{PacketStatus, PacketView, TcpFlags},
    seq::{seq_geq, seq_leq},
    stats::{NormPeg, TcpStats},
    tracker::{TcpTracker, TrackerFlags},
};

/// Timestamps older than this are not compared anymore, in seconds.
pub const PAWS_24DAYS: u32 = 24 * 24 * 60 * 60;

/// Which RST a target host accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RstRule {
    /// `seq == next_ack`
    SeqEqual,
    /// `end_seq >= window_base` and `seq <= window_base + window`
    EndSeqInWindow,
    /// `seq >= next_ack`
    SeqGeq,
}

/// What a target host does with a SYN on an established connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatedSyn {
    Reset,
    Discard,
}

/// Block category of [Normalizer::packet_dropper].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCategory {
    Tcp,
    Options,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Normalizer {
    pub policy: StreamPolicy,
    modes: NormalizationConfig,
    paws_ts_fudge: u32,
    paws_drop_zero_ts: bool,
    rst_rule: RstRule,
}

impl Normalizer {
    pub fn new(policy: StreamPolicy, modes: NormalizationConfig) -> Self {
        let paws_ts_fudge = if policy == StreamPolicy::Linux { 1 } else { 0 };
        let paws_drop_zero_ts = !matches!(
            policy,
            StreamPolicy::OldLinux | StreamPolicy::Solaris | StreamPolicy::Windows | StreamPolicy::Win2003 | StreamPolicy::Vista
        );
        let rst_rule = match policy {
            StreamPolicy::Hpux11 => RstRule::SeqGeq,
            StreamPolicy::Bsd | StreamPolicy::Linux | StreamPolicy::OldLinux | StreamPolicy::Solaris => RstRule::EndSeqInWindow,
            _ => RstRule::SeqEqual,
        };
        Self {
            policy,
            modes,
            paws_ts_fudge,
            paws_drop_zero_ts,
            rst_rule,
        }
    }

    pub fn modes(&self) -> &NormalizationConfig {
        &self.modes
    }

    pub fn is_tcp_ips_enabled(&self) -> bool {
        self.modes.ips.is_on()
    }

    pub fn paws_ts_fudge(&self) -> u32 {
        self.paws_ts_fudge
    }

    pub fn paws_drop_zero_ts(&self) -> bool {
        self.paws_drop_zero_ts
    }

    pub fn rst_rule(&self) -> RstRule {
        self.rst_rule
    }

    fn trim_payload(&self, packet: &mut PacketView, tdb: &mut TcpDataBlock, max: u32, mode: NormMode, peg: NormPeg, stats: &mut TcpStats) -> bool {
        let dsize = packet.dsize() as u32;
        if dsize <= max {
            return false;
        }
        stats.norm.add(peg, mode);
        if !mode.is_on() {
            return false;
        }
        let Some(mut edit) = packet.inline_edit() else {
            return false;
        };
        edit.truncate(max as usize);
        tdb.end_seq = tdb.end_seq.wrapping_sub(dsize - max);
        true
    }

    pub fn trim_syn_payload(&self, packet: &mut PacketView, tdb: &mut TcpDataBlock, stats: &mut TcpStats) -> bool {
        self.trim_payload(packet, tdb, 0, self.modes.trim_syn, NormPeg::TrimSyn, stats)
    }

    pub fn trim_rst_payload(&self, packet: &mut PacketView, tdb: &mut TcpDataBlock, stats: &mut TcpStats) -> bool {
        self.trim_payload(packet, tdb, 0, self.modes.trim_rst, NormPeg::TrimRst, stats)
    }

    /// Cut data beyond the receiver's window.
    pub fn trim_win_payload(&self, packet: &mut PacketView, tdb: &mut TcpDataBlock, max: u32, stats: &mut TcpStats) -> bool {
        self.trim_payload(packet, tdb, max, self.modes.trim_win, NormPeg::TrimWin, stats)
    }

    /// Cut data beyond the negotiated MSS, `mss == 0` means none was negotiated.
    pub fn trim_mss_payload(&self, packet: &mut PacketView, tdb: &mut TcpDataBlock, mss: u16, stats: &mut TcpStats) -> bool {
        if mss == 0 {
            return false;
        }
        self.trim_payload(packet, tdb, mss as u32, self.modes.trim_mss, NormPeg::TrimMss, stats)
    }

    /// Mark the packet for dropping. True only when the category blocks.
    pub fn packet_dropper(&self, packet: &mut PacketView, category: BlockCategory, stats: &mut TcpStats) -> bool {
        let mode = match category {
            BlockCategory::Tcp => self.modes.tcp_block,
            BlockCategory::Options => self.modes.opt_block,
        };
        stats.norm.add(NormPeg::Block, mode);
        if mode.is_on() {
            packet.status |= PacketStatus::DROPPED;
            return true;
        }
        false
    }

    /// Track ECN negotiation of the session from SYN and SYN-ACK.
    pub fn ecn_tracker(&self, flags: TcpFlags, require_3whs: bool, ecn: &mut bool) {
        if flags.is_syn_ack() {
            if !require_3whs || *ecn {
                *ecn = flags & (TcpFlags::ECE | TcpFlags::CWR) == TcpFlags::ECE;
            }
        } else if flags.contains(TcpFlags::SYN) {
            *ecn = flags.contains(TcpFlags::ECE | TcpFlags::CWR);
        }
    }

    /// Clear ECN bits on a session that did not negotiate ECN.
    pub fn ecn_stripper(&self, packet: &mut PacketView, ecn: bool, stats: &mut TcpStats) {
        if ecn || !packet.flags().intersects(TcpFlags::ECE | TcpFlags::CWR) {
            return;
        }
        let mode = self.modes.strip_ecn;
        stats.norm.add(NormPeg::EcnSession, mode);
        if mode.is_on() {
            if let Some(mut edit) = packet.inline_edit() {
                edit.clear_flags(TcpFlags::ECE | TcpFlags::CWR);
            }
        }
    }

    /// Receive window of `listener` to check `tdb` against. A midstream session may have
    /// missed window scaling, so the packet's own extent is used instead.
    pub fn get_stream_window(&self, listener: &TcpTracker, tdb: &TcpDataBlock, midstream: bool, two_way: bool) -> u32 {
        if listener.window != 0 && !midstream {
            return listener.window;
        }
        // one way zero window is uninitialized, two way zero window is real
        if two_way && !midstream {
            return listener.window;
        }
        let window = tdb.end_seq.wrapping_sub(listener.window_base) as i32;
        window.max(0) as u32
    }

    /// Read the timestamp option into `tdb.ts`. With `strip`, the option is NOPed instead when
    /// option blocking is on and the packet is writable.
    pub fn get_tcp_timestamp(&self, packet: &mut PacketView, tdb: &mut TcpDataBlock, strip: bool, stats: &mut TcpStats) -> bool {
        let Some(timestamp) = packet.header.options.timestamp else {
            tdb.ts = 0;
            return false;
        };
        if strip {
            let mode = self.modes.opt_block;
            stats.norm.add(NormPeg::TsNop, mode);
            if mode.is_on() {
                if let Some(mut edit) = packet.inline_edit() {
                    edit.strip_timestamp();
                    tdb.ts = 0;
                    return false;
                }
            }
        }
        tdb.ts = timestamp.value;
        true
    }

    /// RST acceptance rule of the target host.
    pub fn validate_rst(&self, listener: &TcpTracker, tdb: &TcpDataBlock, window: u32) -> bool {
        match self.rst_rule {
            RstRule::SeqEqual => tdb.seq == listener.next_ack,
            RstRule::SeqGeq => seq_geq(tdb.seq, listener.next_ack),
            RstRule::EndSeqInWindow => {
                seq_geq(tdb.end_seq, listener.window_base) && seq_leq(tdb.seq, listener.window_base.wrapping_add(window))
            }
        }
    }

    pub fn handle_repeated_syn(&self, talker: &TcpTracker, listener: &TcpTracker, tdb: &TcpDataBlock) -> RepeatedSyn {
        if self.policy.is_windows_family() {
            if tdb.seq == listener.next_ack {
                RepeatedSyn::Reset
            } else {
                RepeatedSyn::Discard
            }
        } else if tdb.seq != talker.isn {
            RepeatedSyn::Reset
        } else {
            RepeatedSyn::Discard
        }
    }

    /// PAWS check of a `talker` packet against the timestamps it sent before.
    /// Returns the action and whether the packet carried a usable timestamp.
    pub fn handle_paws(
        &self,
        listener: &mut TcpTracker,
        talker: &TcpTracker,
        tdb: &mut TcpDataBlock,
        packet: &mut PacketView,
        events: &mut EventMask,
        stats: &mut TcpStats,
    ) -> (Action, bool) {
        if packet.flags().contains(TcpFlags::RST) {
            return (Action::empty(), false);
        }

        if !(listener.flags.contains(TrackerFlags::TSTAMP) && talker.flags.contains(TrackerFlags::TSTAMP)) {
            // timestamps were not negotiated, drop the option once the session is set up
            let strip = listener.is_setup_ok() && talker.is_setup_ok();
            let got_ts = self.get_tcp_timestamp(packet, tdb, strip, stats);
            return (Action::empty(), got_ts);
        }

        if self.get_tcp_timestamp(packet, tdb, false, stats) {
            return (self.validate_paws(talker, tdb, packet, events, stats), true);
        }

        // negotiated but missing, some servers ack it anyway
        events.raise(TcpEvent::NoTimestamp);
        if self.policy == StreamPolicy::Solaris {
            listener.flags.remove(TrackerFlags::TSTAMP);
        }
        if self.packet_dropper(packet, BlockCategory::Options, stats) {
            return (Action::BAD_PKT, false);
        }
        (Action::empty(), false)
    }

    fn validate_paws(&self, talker: &TcpTracker, tdb: &TcpDataBlock, packet: &mut PacketView, events: &mut EventMask, stats: &mut TcpStats) -> Action {
        if tdb.ts == 0 && !packet.flags().contains(TcpFlags::SYN) {
            if !self.paws_drop_zero_ts || talker.flags.contains(TrackerFlags::TSTAMP_ZERO) {
                return Action::empty();
            }
            events.raise(TcpEvent::BadTimestamp);
            self.packet_dropper(packet, BlockCategory::Options, stats);
            return Action::BAD_PKT;
        }
        if talker.ts_last == 0 {
            return Action::empty();
        }

        let paws_window_end = talker.ts_last_packet.saturating_add(PAWS_24DAYS);
        let age = tdb.ts.wrapping_sub(talker.ts_last).wrapping_add(self.paws_ts_fudge) as i32;
        if age < 0 {
            if packet.time_secs < paws_window_end {
                events.raise(TcpEvent::BadTimestamp);
                self.packet_dropper(packet, BlockCategory::Options, stats);
                return Action::BAD_PKT;
            }
        } else if packet.time_secs > paws_window_end {
            // last timestamp is too old to compare against
            events.raise(TcpEvent::BadTimestamp);
            self.packet_dropper(packet, BlockCategory::Options, stats);
            return Action::BAD_PKT;
        }
        Action::empty()
    }
}
