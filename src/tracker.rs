/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */
use bitflags::bitflags;

use crate::{
    config::{StreamPolicy, StreamTcpConfig},
    normalizer::Normalizer,
    overlap::ReassemblyPolicy,
    packet::TcpFlags,
    segment_store::{QueueLimits, SegmentStore},
};

/// Alerts remembered per tracker, so rebuilt data does not alert twice.
pub const MAX_SESSION_ALERTS: usize = 8;

/// Connection state of one side. Declaration order matters, closing states compare above `Established`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TcpState {
    Listen,
    SynRcvd,
    SynSent,
    Established,
    CloseWait,
    LastAck,
    FinWait1,
    Closing,
    FinWait2,
    TimeWait,
    #[default]
    Closed,
}

bitflags! {
    /// What this side has sent so far.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SubState: u8 {
        const SYN_SENT = 0x01;
        const ACK_SENT = 0x02;
        const FIN_SENT = 0x04;
        const RST_SENT = 0x08;
        const SETUP_OK = Self::SYN_SENT.bits() | Self::ACK_SENT.bits();
    }
}

bitflags! {
    /// Options negotiated by this side.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TrackerFlags: u8 {
        const TSTAMP = 0x01;
        /// The handshake carried a zero timestamp.
        const TSTAMP_ZERO = 0x02;
        const MSS = 0x04;
        const WSCALE = 0x08;
        /// Queue limit warning was logged already.
        const LIMIT_LOGGED = 0x10;
    }
}

/// State change staged until the peer acknowledges `trigger_ack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTransition {
    pub target: TcpState,
    pub trigger_ack: u32,
    pub expected_flags: TcpFlags,
}

/// When reassembled data is handed upwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushPolicy {
    /// Nobody inspects this direction, nothing is buffered.
    #[default]
    Ignore,
    /// Deliver what the receiver acknowledged.
    OnAck,
    /// Deliver as soon as it is contiguous, so an inline verdict can still drop the packet.
    OnData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamAlertInfo {
    pub gid: u32,
    pub sid: u32,
    pub seq: u32,
    pub event_id: u32,
    pub event_second: u32,
}

/// One direction of a session: the sequence space this side sends and the bytes it receives.
///
/// Naming follows the side's own point of view:
/// * `unacked`, `next_seq`, `window`: what this side sent and advertised.
/// * `next_ack`, `window_base`: what this side expects from and acknowledged to the peer.
/// * `store`: bytes sent by the peer, waiting for delivery.
#[derive(Debug)]
pub struct TcpTracker {
    pub state: TcpState,
    pub sub_state: SubState,
    pending: Option<PendingTransition>,

    pub isn: u32,
    pub unacked: u32,
    pub next_seq: u32,
    pub window: u32,
    pub next_ack: u32,
    pub window_base: u32,

    pub flags: TrackerFlags,
    pub mss: u16,
    pub wscale: u8,
    pub ts_last: u32,
    /// Capture second of the packet carrying `ts_last`.
    pub ts_last_packet: u32,
    pub mac_address: [u8; 6],

    pub small_seg_count: u32,
    alerts: Vec<StreamAlertInfo>,

    pub flush_policy: FlushPolicy,
    pub store: SegmentStore,
    pub normalizer: Normalizer,
}

impl TcpTracker {
    pub fn new(policy: StreamPolicy, config: &StreamTcpConfig) -> Self {
        let normalization = config.normalization;
        Self {
            state: TcpState::Closed,
            sub_state: SubState::empty(),
            pending: None,
            isn: 0,
            unacked: 0,
            next_seq: 0,
            window: 0,
            next_ack: 0,
            window_base: 0,
            flags: TrackerFlags::empty(),
            mss: 0,
            wscale: 0,
            ts_last: 0,
            ts_last_packet: 0,
            mac_address: [0; 6],
            small_seg_count: 0,
            alerts: Vec::new(),
            flush_policy: FlushPolicy::Ignore,
            store: SegmentStore::new(
                ReassemblyPolicy::new(policy, normalization.ips),
                QueueLimits {
                    max_bytes: config.max_queued_bytes,
                    max_segs: config.max_queued_segs,
                },
            ),
            normalizer: Normalizer::new(policy, normalization),
        }
    }

    pub fn policy(&self) -> StreamPolicy {
        self.normalizer.policy
    }

    /// Ignore without a collaborator, otherwise on-data when inline rewriting is on and on-ack when not.
    pub fn init_flush_policy(&mut self, reassembly_wanted: bool) {
        self.flush_policy = if !reassembly_wanted {
            FlushPolicy::Ignore
        } else if self.normalizer.is_tcp_ips_enabled() {
            FlushPolicy::OnData
        } else {
            FlushPolicy::OnAck
        };
    }

    pub fn pending(&self) -> Option<&PendingTransition> {
        self.pending.as_ref()
    }

    pub fn stage_transition(&mut self, target: TcpState, trigger_ack: u32, expected_flags: TcpFlags) {
        self.pending = Some(PendingTransition {
            target,
            trigger_ack,
            expected_flags,
        });
    }

    /// Apply the staged transition if `ack` is exactly its trigger. Returns the new state.
    pub fn commit_transition(&mut self, ack: u32) -> Option<TcpState> {
        match self.pending {
            Some(pending) if pending.trigger_ack == ack => {
                self.state = pending.target;
                self.pending = None;
                Some(pending.target)
            }
            _ => None,
        }
    }

    /// Change the target of a staged transition, its trigger stays.
    pub fn retarget_transition(&mut self, target: TcpState) {
        if let Some(pending) = self.pending.as_mut() {
            pending.target = target;
        }
    }

    pub fn clear_transition(&mut self) {
        self.pending = None;
    }

    pub fn is_setup_ok(&self) -> bool {
        self.sub_state.contains(SubState::SETUP_OK)
    }

    /// Remember an alert raised on rebuilt data. False once the bounded list is full.
    pub fn add_alert(&mut self, gid: u32, sid: u32) -> bool {
        if self.alerts.len() >= MAX_SESSION_ALERTS {
            return false;
        }
        self.alerts.push(StreamAlertInfo {
            gid,
            sid,
            seq: self.next_ack,
            event_id: 0,
            event_second: 0,
        });
        true
    }

    /// Alerted already on bytes at or past `seq`.
    pub fn check_alerted(&self, gid: u32, sid: u32, seq: u32) -> bool {
        self.alerts
            .iter()
            .any(|alert| alert.gid == gid && alert.sid == sid && crate::seq::seq_geq(alert.seq, seq))
    }

    /// Attach the event id to an alert added before. Returns false when no entry matches.
    pub fn update_alert(&mut self, gid: u32, sid: u32, event_id: u32, event_second: u32) -> bool {
        match self
            .alerts
            .iter_mut()
            .find(|alert| alert.gid == gid && alert.sid == sid && alert.event_id == 0)
        {
            Some(alert) => {
                alert.event_id = event_id;
                alert.event_second = event_second;
                true
            }
            None => false,
        }
    }

    pub fn alerts(&self) -> &[StreamAlertInfo] {
        &self.alerts
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{NormMode, NormalizationConfig};

    #[test]
    fn test_state_order() {
        assert!(TcpState::CloseWait > TcpState::Established);
        assert!(TcpState::Closed > TcpState::TimeWait);
        assert!(TcpState::SynSent < TcpState::Established);
    }

    #[test]
    fn test_transition_commits_on_exact_ack() {
        let mut tracker = TcpTracker::new(StreamPolicy::Bsd, &StreamTcpConfig::default());
        tracker.state = TcpState::Established;
        tracker.stage_transition(TcpState::CloseWait, 5001, TcpFlags::ACK);

        assert_eq!(tracker.commit_transition(5000), None);
        assert_eq!(tracker.commit_transition(5002), None);
        assert_eq!(tracker.state, TcpState::Established);
        assert!(tracker.pending().is_some());

        assert_eq!(tracker.commit_transition(5001), Some(TcpState::CloseWait));
        assert_eq!(tracker.state, TcpState::CloseWait);
        assert!(tracker.pending().is_none());
        assert_eq!(tracker.commit_transition(5001), None);
    }

    #[test]
    fn test_flush_policy_selection() {
        let mut tracker = TcpTracker::new(StreamPolicy::Linux, &StreamTcpConfig::default());
        tracker.init_flush_policy(true);
        assert_eq!(tracker.flush_policy, FlushPolicy::OnAck);
        tracker.init_flush_policy(false);
        assert_eq!(tracker.flush_policy, FlushPolicy::Ignore);

        let config = StreamTcpConfig {
            normalization: NormalizationConfig {
                ips: NormMode::On,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut tracker = TcpTracker::new(StreamPolicy::Linux, &config);
        tracker.init_flush_policy(true);
        assert_eq!(tracker.flush_policy, FlushPolicy::OnData);
        assert_eq!(tracker.store.policy().policy, StreamPolicy::First);
        assert_eq!(tracker.policy(), StreamPolicy::Linux);
    }

    #[test]
    fn test_alert_list_is_bounded() {
        let mut tracker = TcpTracker::new(StreamPolicy::Bsd, &StreamTcpConfig::default());
        tracker.next_ack = 1000;
        for sid in 0..MAX_SESSION_ALERTS as u32 {
            assert!(tracker.add_alert(1, sid));
        }
        assert!(!tracker.add_alert(1, 99));
        assert_eq!(tracker.alerts().len(), MAX_SESSION_ALERTS);

        assert!(tracker.check_alerted(1, 3, 900));
        assert!(!tracker.check_alerted(1, 3, 1100));
        assert!(!tracker.check_alerted(2, 3, 900));

        assert!(tracker.update_alert(1, 3, 42, 7));
        assert!(!tracker.update_alert(1, 3, 43, 7));
        assert_eq!(tracker.alerts()[3].event_id, 42);
    }
}
