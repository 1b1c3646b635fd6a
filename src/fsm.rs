/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */

//! Per-packet state machine of a [TcpSession].
//!
//! A packet is checked in a fixed order: pickup and session creation, re-SYN, the
//! SYN-ACK of an unestablished session, RST validity, PAWS, sequence window, repeated
//! SYN, window limits, staged transitions, ACK driven transitions, data and finally FIN.
//! Anomalies raise [TcpEvent]s, the returned [Action] tells the caller what to do with
//! the packet.

use crate::{
    config::StreamPolicy,
    data_block::TcpDataBlock,
    error::InsertError,
    events::{Action, EventMask, SessionEvent, TcpEvent},
    normalizer::{BlockCategory, RepeatedSyn, PAWS_24DAYS},
    packet::{PacketStatus, PacketView, TcpFlags},
    seq::{is_between, seq_geq, seq_gt, seq_leq, seq_lt},
    session::{
        finish_server_init, flush_on_ack, flush_on_data, flush_tracker, valid_mac_address, SessionFlags, SessionState,
        StreamContext, StreamState, TcpSession,
    },
    trace,
    tracker::{FlushPolicy, SubState, TcpState, TcpTracker, TrackerFlags},
};

/// A client window at or below this, right after the handshake, is a window slam.
pub const SLAM_MAX: u32 = 4;

impl TcpSession {
    /// Run one packet through the session. `packet.direction` must be relative to
    /// [SessionState::connection], it is flipped when the session swaps roles.
    pub fn process(&mut self, packet: &mut PacketView, ctx: &mut StreamContext<'_>) -> Action {
        if !self.ssn.lws_init && !self.pickup_allowed(packet, ctx) {
            return Action::empty();
        }

        if self.is_expired(packet.time_secs) {
            trace!("[{}]: timed out", &ctx.config.trace_connections, self.ssn.connection_id);
            self.cleanup(ctx);
            ctx.stats.timeouts += 1;
        }

        let mut events = EventMask::empty();
        let action = self.process_tcp(packet, &mut events, ctx);
        self.deliver_events(events, ctx);

        if action.contains(Action::LWSSN_CLOSED) {
            self.cleanup(ctx);
            self.ssn.stream_state |= StreamState::CLOSED;
        } else {
            packet.status |= if self.ssn.stream_state.contains(StreamState::ESTABLISHED) {
                PacketStatus::STREAM_ESTABLISHED
            } else {
                PacketStatus::STREAM_UNESTABLISHED
            };
            self.ssn.expire_at = packet.time_secs.saturating_add(ctx.config.session_timeout);
        }
        action
    }

    /// Lightweight session gate. A bare ACK is never worth a session, without a handshake
    /// requirement nor is a bare SYN.
    fn pickup_allowed(&mut self, packet: &PacketView, ctx: &mut StreamContext<'_>) -> bool {
        let flags = packet.flags();
        let config = ctx.config;
        let mut midstream_check = true;
        if config.require_3whs() {
            if flags.is_syn_only() {
                self.ssn.stream_state = StreamState::SYN;
                midstream_check = false;
            } else if !config.midstream_allowed(self.ssn.first_time, packet.time_secs) {
                if !flags.contains(TcpFlags::RST) && !self.ssn.event_mask.has(TcpEvent::No3WayHandshake) {
                    self.ssn.event_mask.raise(TcpEvent::No3WayHandshake);
                    let mut events = EventMask::empty();
                    events.raise(TcpEvent::No3WayHandshake);
                    self.deliver_events(events, ctx);
                }
                return false;
            }
        }
        if midstream_check && !flags.is_syn_ack() && packet.dsize() == 0 && packet.header.options.window_scale.is_none() {
            return false;
        }
        self.ssn.lws_init = true;
        true
    }

    pub(crate) fn deliver_events(&mut self, events: EventMask, ctx: &mut StreamContext<'_>) {
        for event in events.events() {
            ctx.stats.events += 1;
            log::debug!("[{}]: {}", self.ssn.connection_id, event);
            ctx.observer.alert(self.ssn.connection_id, event);
        }
    }

    fn process_tcp(&mut self, packet: &mut PacketView, events: &mut EventMask, ctx: &mut StreamContext<'_>) -> Action {
        let config = ctx.config;
        let mut tdb = TcpDataBlock::extract(packet, ctx.stats);
        let flags = packet.flags();
        let require_3whs = config.require_3whs();
        let midstream_allowed = config.midstream_allowed(self.ssn.first_time, packet.time_secs);
        let mut action = Action::empty();
        let mut new_ssn = false;

        if !self.ssn.tcp_init {
            let from_client = packet.is_from_client();
            if (flags.is_syn_only() && !from_client) || (flags.is_syn_ack() && from_client) {
                self.swap_roles();
                packet.direction = packet.direction.reverse();
                trace!("[{}]: roles swapped, client is {:?}", &config.trace_connections, self.ssn.connection_id, self.ssn.connection);
            }

            if flags.is_syn_only() {
                self.ssn.stream_state |= StreamState::SYN;
                if require_3whs || packet.header.options.window_scale.is_some() || packet.dsize() > 0 {
                    self.new_session_on_syn(packet, &mut tdb, ctx);
                    new_ssn = true;
                    self.server.normalizer.ecn_tracker(flags, require_3whs, &mut self.ssn.ecn);
                }
            } else if flags.is_syn_ack() {
                self.ssn.stream_state |= StreamState::SYN_ACK;
                if !require_3whs || midstream_allowed {
                    self.new_session_on_syn_ack(packet, &mut tdb, ctx);
                    new_ssn = true;
                }
                self.client.normalizer.ecn_tracker(flags, require_3whs, &mut self.ssn.ecn);
            } else if flags.contains(TcpFlags::ACK)
                && !flags.contains(TcpFlags::RST)
                && self.ssn.stream_state.contains(StreamState::SYN_ACK)
            {
                self.ssn.stream_state |= StreamState::ACK | StreamState::ESTABLISHED;
                self.new_session_on_3way(packet, &mut tdb, ctx);
                new_ssn = true;
                self.server.normalizer.ecn_tracker(flags, require_3whs, &mut self.ssn.ecn);
            } else if packet.dsize() > 0 && (!require_3whs || midstream_allowed) {
                self.ssn.stream_state |= StreamState::MIDSTREAM;
                self.ssn.flags |= SessionFlags::MIDSTREAM;
                self.new_session_on_data(packet, &mut tdb, ctx);
                new_ssn = true;
                let normalizer = if packet.is_from_client() {
                    self.server.normalizer
                } else {
                    self.client.normalizer
                };
                normalizer.ecn_tracker(flags, require_3whs, &mut self.ssn.ecn);
            } else if packet.dsize() == 0 {
                return action;
            }
        } else {
            if !self.ssn.stream_state.contains(StreamState::ESTABLISHED) && (!require_3whs || midstream_allowed) {
                if flags.is_syn_ack() {
                    if !self.ssn.stream_state.is_empty() {
                        self.ssn.stream_state |= StreamState::SYN_ACK;
                    }
                } else if flags.contains(TcpFlags::ACK) && self.ssn.stream_state.contains(StreamState::SYN_ACK) {
                    self.ssn.stream_state |= StreamState::ACK | StreamState::ESTABLISHED;
                }
            }
            if flags.contains(TcpFlags::SYN) {
                self.server.normalizer.ecn_tracker(flags, require_3whs, &mut self.ssn.ecn);
            }
        }

        let unestablished_midstream = self.ssn.is_midstream() && !self.ssn.stream_state.contains(StreamState::ESTABLISHED);
        if packet.is_from_client() {
            self.ssn.flags |= SessionFlags::SEEN_CLIENT;
            if unestablished_midstream && self.ssn.flags.contains(SessionFlags::SEEN_SERVER) {
                self.ssn.establish(ctx.observer, &config.trace_connections);
            }
        } else {
            self.ssn.flags |= SessionFlags::SEEN_SERVER;
            if self.ssn.tcp_init && self.server.state == TcpState::Listen && flags.is_syn_only() {
                events.raise(TcpEvent::FourWayHandshake);
            }
            if unestablished_midstream {
                if self.ssn.tcp_init {
                    finish_server_init(&mut self.server, &mut self.client, &self.ssn, &mut tdb, packet, ctx.stats);
                }
                if flags.contains(TcpFlags::ECE) && self.ssn.flags.contains(SessionFlags::ECN_CLIENT_QUERY) {
                    self.ssn.flags |= SessionFlags::ECN_SERVER_REPLY;
                }
                if self.ssn.flags.contains(SessionFlags::SEEN_CLIENT) {
                    self.ssn.establish(ctx.observer, &config.trace_connections);
                }
            }
        }

        if self.ssn.flags.contains(SessionFlags::RESET)
            && flags.contains(TcpFlags::SYN)
            && (!self.ssn.tcp_init || self.client.state == TcpState::Closed || self.server.state == TcpState::Closed)
        {
            trace!("[{}]: SYN on reset session, restarting", &config.trace_connections, self.ssn.connection_id);
            self.cleanup(ctx);

            if flags.contains(TcpFlags::RST) {
                let listener = if packet.is_from_client() { &self.server } else { &self.client };
                listener.normalizer.trim_syn_payload(packet, &mut tdb, ctx.stats);
                listener.normalizer.trim_rst_payload(packet, &mut tdb, ctx.stats);
                return action | Action::RST;
            } else if flags.is_syn_only() {
                if !packet.is_from_client() {
                    self.swap_roles();
                    packet.direction = packet.direction.reverse();
                }
                self.ssn.stream_state = StreamState::SYN;
                self.new_session_on_syn(packet, &mut tdb, ctx);
                ctx.stats.resyns += 1;
                new_ssn = true;
                self.server.normalizer.ecn_tracker(flags, require_3whs, &mut self.ssn.ecn);
                self.ssn.flags |= SessionFlags::SEEN_CLIENT;
            } else if flags.is_syn_ack() {
                if midstream_allowed {
                    if packet.is_from_client() {
                        self.swap_roles();
                        packet.direction = packet.direction.reverse();
                    }
                    self.ssn.stream_state = StreamState::SYN_ACK;
                    self.new_session_on_syn_ack(packet, &mut tdb, ctx);
                    ctx.stats.resyns += 1;
                    new_ssn = true;
                }
                self.client.normalizer.ecn_tracker(flags, require_3whs, &mut self.ssn.ecn);
                self.ssn.flags |= SessionFlags::SEEN_SERVER;
            }
        }

        if self.ssn.tcp_init && self.client.flush_policy == FlushPolicy::Ignore && self.server.flush_policy == FlushPolicy::Ignore {
            packet.status |= PacketStatus::IGNORED;
            action |= Action::DISABLE_INSPECTION;
        }

        if !self.ssn.tcp_init {
            return action;
        }

        let from_client = packet.is_from_client();
        let direction = packet.direction;
        let (talker, listener, ssn) = self.split(from_client);

        if packet.dsize() > 0 && flags.contains(TcpFlags::SYN) && talker.policy() != StreamPolicy::MacOs {
            listener.normalizer.trim_syn_payload(packet, &mut tdb, ctx.stats);
            if !config.normalization.trim_syn.is_on() {
                events.raise(TcpEvent::DataOnSyn);
                action |= Action::BAD_PKT;
            }
        }

        if flags.contains(TcpFlags::SYN) {
            talker.sub_state |= SubState::SYN_SENT;
        }
        if flags.contains(TcpFlags::ACK) {
            talker.sub_state |= SubState::ACK_SENT;
        }

        // SYN-ACK of a session that has seen the client's SYN only
        if listener.state == TcpState::SynSent && talker.state == TcpState::Listen {
            if flags.contains(TcpFlags::ACK) && !is_between(listener.unacked, listener.next_seq, tdb.ack) {
                trace!(
                    "[{}]: ack {:#010x} out of [{:#010x}, {:#010x}]",
                    &config.trace_connections,
                    ssn.connection_id,
                    tdb.ack,
                    listener.unacked,
                    listener.next_seq
                );
                ctx.stats.discards += 1;
                listener.normalizer.trim_win_payload(packet, &mut tdb, 0, ctx.stats);
                return action | Action::BAD_PKT;
            }

            if talker.normalizer.get_tcp_timestamp(packet, &mut tdb, false, ctx.stats) {
                talker.flags |= TrackerFlags::TSTAMP;
            }
            if tdb.ts == 0 {
                talker.flags |= TrackerFlags::TSTAMP_ZERO;
            }

            if flags.contains(TcpFlags::RST) {
                listener.normalizer.trim_rst_payload(packet, &mut tdb, ctx.stats);
                // must ack the SYN
                if tdb.ack == listener.unacked {
                    ssn.flags |= SessionFlags::RESET;
                    talker.state = TcpState::Closed;
                    trace!("[{}]: reset in SYN_SENT", &config.trace_connections, ssn.connection_id);
                    ssn.notify(ctx.observer, SessionEvent::Reset);
                    return action | Action::RST;
                }
                ctx.stats.discards += 1;
                events.raise(TcpEvent::BadRst);
                listener.normalizer.packet_dropper(packet, BlockCategory::Tcp, ctx.stats);
                return action;
            }

            if flags.contains(TcpFlags::SYN) {
                if from_client {
                    finish_server_init(listener, talker, ssn, &mut tdb, packet, ctx.stats);
                } else {
                    finish_server_init(talker, listener, ssn, &mut tdb, packet, ctx.stats);
                }
                if talker.flags.contains(TrackerFlags::TSTAMP) {
                    talker.ts_last_packet = packet.time_secs;
                    talker.ts_last = tdb.ts;
                }
            }

            if flags.contains(TcpFlags::ECE) && ssn.flags.contains(SessionFlags::ECN_CLIENT_QUERY) {
                ssn.flags |= SessionFlags::ECN_SERVER_REPLY;
            }
            listener.state = TcpState::SynSent;
            return action;
        }

        if talker.flags.contains(TrackerFlags::WSCALE) && listener.flags.contains(TrackerFlags::WSCALE) {
            tdb.window <<= talker.wscale;
        }

        *events |= valid_mac_address(talker, listener, ssn, packet);

        let normalizer = listener.normalizer;
        let (ts_action, got_ts) = normalizer.handle_paws(listener, talker, &mut tdb, packet, events, ctx.stats);

        if flags.contains(TcpFlags::RST) {
            normalizer.trim_rst_payload(packet, &mut tdb, ctx.stats);
            let window = normalizer.get_stream_window(listener, &tdb, ssn.is_midstream(), ssn.two_way_traffic());
            if normalizer.validate_rst(listener, &tdb, window) {
                if matches!(
                    listener.state,
                    TcpState::FinWait1 | TcpState::FinWait2 | TcpState::CloseWait | TcpState::Closing
                ) {
                    flush_tracker(talker, ssn, direction.reverse(), None, ctx);
                    flush_tracker(listener, ssn, direction, None, ctx);
                    talker.flush_policy = FlushPolicy::Ignore;
                    listener.flush_policy = FlushPolicy::Ignore;
                }
                ssn.flags |= SessionFlags::RESET;
                talker.state = TcpState::Closed;
                talker.sub_state |= SubState::RST_SENT;
                // passive: the peer may still have data in flight
                if normalizer.is_tcp_ips_enabled() {
                    listener.state = TcpState::Closed;
                }
                trace!("[{}]: reset {:?}", &config.trace_connections, ssn.connection_id, direction);
                ssn.notify(ctx.observer, SessionEvent::Reset);
                return action | Action::RST;
            }
            trace!("[{}]: RST seq {:#010x} rejected", &config.trace_connections, ssn.connection_id, tdb.seq);
            ctx.stats.discards += 1;
            events.raise(TcpEvent::BadRst);
            normalizer.packet_dropper(packet, BlockCategory::Tcp, ctx.stats);
            return action | ts_action;
        }

        if listener.policy() != StreamPolicy::Proxy
            && listener.state >= TcpState::Established
            && !valid_seq(listener, &tdb, packet.dsize(), ssn)
        {
            trace!(
                "[{}]: seq {:#010x} outside window at {:#010x}",
                &config.trace_connections,
                ssn.connection_id,
                tdb.seq,
                listener.window_base
            );
            ctx.stats.discards += 1;
            normalizer.trim_win_payload(packet, &mut tdb, 0, ctx.stats);
            return action | ts_action;
        }

        if !ts_action.is_empty() {
            ctx.stats.discards += 1;
            return action | ts_action;
        }

        if got_ts && listener.window_base == tdb.seq {
            let newer = tdb.ts.wrapping_sub(talker.ts_last) as i32 >= 0;
            if newer || packet.time_secs >= talker.ts_last_packet.saturating_add(PAWS_24DAYS) {
                talker.ts_last = tdb.ts;
                talker.ts_last_packet = packet.time_secs;
            }
        }

        if !new_ssn && flags.is_syn_only() {
            let mut syn_action = Action::empty();
            if tdb.seq != talker.isn && normalizer.packet_dropper(packet, BlockCategory::Tcp, ctx.stats) {
                syn_action = Action::BAD_PKT;
            } else if talker.state >= TcpState::Established {
                match normalizer.handle_repeated_syn(talker, listener, &tdb) {
                    RepeatedSyn::Reset => {
                        ssn.flags |= SessionFlags::RESET;
                        listener.state = TcpState::Closed;
                        syn_action = Action::RST;
                    }
                    RepeatedSyn::Discard => {
                        ctx.stats.discards += 1;
                        normalizer.trim_win_payload(packet, &mut tdb, 0, ctx.stats);
                    }
                }
            }
            if !syn_action.is_empty() {
                events.raise(TcpEvent::SynOnEstablished);
                if syn_action.contains(Action::RST) {
                    ssn.notify(ctx.observer, SessionEvent::Reset);
                }
                return action | syn_action;
            }
        }

        if listener.policy() != StreamPolicy::Proxy {
            if config.max_window > 0 && tdb.window > config.max_window {
                events.raise(TcpEvent::WindowTooLarge);
                ctx.stats.discards += 1;
                normalizer.packet_dropper(packet, BlockCategory::Tcp, ctx.stats);
                return action | Action::BAD_PKT;
            } else if from_client
                && tdb.window <= SLAM_MAX
                && tdb.ack == listener.isn.wrapping_add(1)
                && !flags.intersects(TcpFlags::FIN | TcpFlags::RST)
                && !ssn.flags.contains(SessionFlags::MIDSTREAM)
            {
                events.raise(TcpEvent::WindowSlam);
                ctx.stats.discards += 1;
                if normalizer.packet_dropper(packet, BlockCategory::Tcp, ctx.stats) {
                    return action | Action::BAD_PKT;
                }
            }
        }

        if let Some(state) = talker.commit_transition(tdb.ack) {
            trace!("[{}]: {:?} on ack {:#010x}", &config.trace_connections, ssn.connection_id, state, tdb.ack);
        }

        if flags.contains(TcpFlags::ACK) {
            match listener.state {
                TcpState::SynRcvd => {
                    if is_between(listener.unacked, listener.next_seq, tdb.ack) {
                        update_ssn(listener, talker, &tdb);
                        ssn.establish(ctx.observer, &config.trace_connections);
                        listener.state = TcpState::Established;
                        talker.state = TcpState::Established;
                        packet.status |= PacketStatus::STREAM_TWH;
                    }
                    if got_ts {
                        talker.flags |= TrackerFlags::TSTAMP;
                        if listener.next_ack == tdb.seq {
                            talker.ts_last_packet = packet.time_secs;
                            talker.ts_last = tdb.ts;
                        }
                    }
                }
                TcpState::Established | TcpState::CloseWait => update_ssn(listener, talker, &tdb),
                TcpState::FinWait1 => {
                    update_ssn(listener, talker, &tdb);
                    if tdb.ack == listener.next_seq {
                        if listener.policy() == StreamPolicy::Windows && tdb.window == 0 {
                            events.raise(TcpEvent::WindowSlam);
                            ctx.stats.discards += 1;
                            if normalizer.packet_dropper(packet, BlockCategory::Tcp, ctx.stats) {
                                return action | Action::BAD_PKT;
                            }
                        }
                        listener.state = TcpState::FinWait2;
                        if flags.contains(TcpFlags::FIN) {
                            if talker.pending().is_none() {
                                talker.state = TcpState::LastAck;
                            }
                            // midstream sessions fail the FIN sequence checks below
                            if ssn.flags.contains(SessionFlags::MIDSTREAM) {
                                listener.stage_transition(TcpState::TimeWait, tdb.end_seq, TcpFlags::ACK);
                            }
                        } else if listener.pending().map(|pending| pending.target) == Some(TcpState::Closing) {
                            listener.stage_transition(TcpState::TimeWait, tdb.end_seq, TcpFlags::ACK);
                        }
                    }
                }
                TcpState::FinWait2 => {
                    update_ssn(listener, talker, &tdb);
                    if seq_gt(tdb.ack, listener.next_seq) {
                        events.raise(TcpEvent::BadAck);
                        normalizer.packet_dropper(packet, BlockCategory::Tcp, ctx.stats);
                        return action | Action::BAD_PKT;
                    }
                }
                TcpState::Closing => {
                    update_ssn(listener, talker, &tdb);
                    if seq_geq(tdb.end_seq, listener.next_ack) {
                        listener.state = TcpState::TimeWait;
                    }
                }
                TcpState::LastAck => {
                    update_ssn(listener, talker, &tdb);
                    if tdb.ack == listener.next_seq {
                        listener.state = TcpState::Closed;
                    }
                }
                _ => {}
            }
            flush_on_ack(talker, ssn, direction, ctx);
        }

        if packet.dsize() > 0 {
            match talker.state {
                TcpState::FinWait2 | TcpState::TimeWait => {
                    events.raise(TcpEvent::DataOnClosed);
                    action |= Action::BAD_PKT;
                    normalizer.packet_dropper(packet, BlockCategory::Tcp, ctx.stats);
                }
                TcpState::Closed => {
                    let event = if !ssn.flags.contains(SessionFlags::RESET) {
                        TcpEvent::DataOnClosed
                    } else if talker.sub_state.contains(SubState::RST_SENT) {
                        TcpEvent::DataAfterReset
                    } else {
                        TcpEvent::DataAfterRstRcvd
                    };
                    events.raise(event);
                    action |= Action::BAD_PKT;
                    normalizer.packet_dropper(packet, BlockCategory::Tcp, ctx.stats);
                }
                _ => {
                    // window and MSS are unknown when the handshake was missed
                    if listener.policy() != StreamPolicy::Proxy && !ssn.flags.contains(SessionFlags::MIDSTREAM) {
                        if listener.window != 0 || ssn.two_way_traffic() {
                            let max = listener.window_base.wrapping_add(listener.window).wrapping_sub(listener.next_ack);
                            normalizer.trim_win_payload(packet, &mut tdb, max, ctx.stats);
                        }
                        normalizer.trim_mss_payload(packet, &mut tdb, listener.mss, ctx.stats);
                        normalizer.ecn_stripper(packet, ssn.ecn, ctx.stats);
                    }
                    if !flags.is_empty() || matches!(listener.policy(), StreamPolicy::Linux | StreamPolicy::Proxy) {
                        process_tcp_data(listener, ssn, &mut tdb, packet, events, ctx);
                    } else {
                        events.raise(TcpEvent::DataWithoutFlags);
                        normalizer.packet_dropper(packet, BlockCategory::Tcp, ctx.stats);
                    }
                }
            }
            flush_on_data(listener, ssn, direction, ctx);
        }

        if flags.contains(TcpFlags::FIN) {
            if seq_lt(tdb.end_seq, listener.window_base) {
                trace!("[{}]: duplicate FIN {:#010x}", &config.trace_connections, ssn.connection_id, tdb.end_seq);
            } else {
                if talker.state >= TcpState::Established && !talker.sub_state.contains(SubState::FIN_SENT) {
                    talker.next_seq = talker.next_seq.wrapping_add(1);
                    listener.next_ack = listener.next_ack.wrapping_add(1);
                    talker.sub_state |= SubState::FIN_SENT;
                }

                match talker.state {
                    TcpState::SynRcvd | TcpState::Established => {
                        if talker.pending().map(|pending| pending.target) == Some(TcpState::CloseWait) {
                            talker.retarget_transition(TcpState::Closing);
                        }
                        talker.state = TcpState::FinWait1;
                        if packet.dsize() == 0 {
                            flush_on_data(listener, ssn, direction, ctx);
                        }
                    }
                    TcpState::CloseWait => talker.state = TcpState::LastAck,
                    _ => {}
                }

                if matches!(talker.state, TcpState::FinWait1 | TcpState::LastAck) {
                    let end_seq = if ssn.flags.contains(SessionFlags::MIDSTREAM) {
                        tdb.end_seq.wrapping_sub(1)
                    } else {
                        tdb.end_seq
                    };
                    if let Some(pending) = listener.pending() {
                        if pending.expected_flags == TcpFlags::ACK && seq_geq(end_seq, pending.trigger_ack) {
                            events.raise(TcpEvent::BadFin);
                            normalizer.packet_dropper(packet, BlockCategory::Tcp, ctx.stats);
                            return action | Action::BAD_PKT;
                        }
                    }
                }

                let trigger_ack = tdb.end_seq.wrapping_add(1);
                match listener.state {
                    TcpState::Established => listener.stage_transition(TcpState::CloseWait, trigger_ack, TcpFlags::ACK),
                    TcpState::FinWait1 => listener.stage_transition(TcpState::Closing, trigger_ack, TcpFlags::ACK),
                    TcpState::FinWait2 => listener.stage_transition(TcpState::TimeWait, trigger_ack, TcpFlags::ACK),
                    _ => {}
                }
            }
        }

        trace!(
            "[{}]: talker {:?}, listener {:?}",
            &config.trace_connections,
            ssn.connection_id,
            talker.state,
            listener.state
        );

        if matches!(
            (talker.state, listener.state),
            (TcpState::TimeWait, TcpState::Closed) | (TcpState::Closed, TcpState::TimeWait) | (TcpState::TimeWait, TcpState::TimeWait)
        ) {
            return action | Action::LWSSN_CLOSED;
        }
        action
    }
}

/// Bookkeeping of an acceptable ACK from `talker`.
pub(crate) fn update_ssn(listener: &mut TcpTracker, talker: &mut TcpTracker, tdb: &TcpDataBlock) {
    // without seeing its segments, the listener's sequence is learnt from the ack
    if seq_gt(tdb.ack, listener.unacked) {
        listener.unacked = tdb.ack;
    }
    talker.unacked = tdb.seq;
    if seq_gt(tdb.end_seq, talker.next_seq) {
        talker.next_seq = tdb.end_seq;
    }
    if talker.window_base != tdb.ack {
        talker.small_seg_count = 0;
    }
    if seq_gt(tdb.ack, talker.window_base) {
        talker.window_base = tdb.ack;
    }
    talker.window = tdb.window;
}

/// `tdb` ends after what `listener` acknowledged and starts inside its receive window.
pub(crate) fn valid_seq(listener: &TcpTracker, tdb: &TcpDataBlock, dsize: usize, ssn: &SessionState) -> bool {
    let left = if seq_lt(listener.next_ack, listener.window_base) {
        listener.next_ack
    } else {
        listener.window_base
    };
    let right_ok = if dsize > 0 {
        seq_gt(tdb.end_seq, left)
    } else {
        seq_geq(tdb.end_seq, left)
    };
    if !right_ok {
        return false;
    }
    let window = listener
        .normalizer
        .get_stream_window(listener, tdb, ssn.is_midstream(), ssn.two_way_traffic());
    seq_leq(tdb.seq, listener.window_base.wrapping_add(window))
}

fn window_closed(listener: &TcpTracker, tdb: &TcpDataBlock, ssn: &SessionState) -> bool {
    listener.policy() != StreamPolicy::Proxy
        && listener
            .normalizer
            .get_stream_window(listener, tdb, ssn.is_midstream(), ssn.two_way_traffic())
            == 0
}

/// Data accepted by the state machine, in order or not.
fn process_tcp_data(
    listener: &mut TcpTracker,
    ssn: &mut SessionState,
    tdb: &mut TcpDataBlock,
    packet: &mut PacketView,
    events: &mut EventMask,
    ctx: &mut StreamContext<'_>,
) {
    let mut seq = tdb.seq;
    if packet.flags().contains(TcpFlags::SYN) {
        if listener.policy() == StreamPolicy::MacOs {
            seq = seq.wrapping_add(1);
        } else {
            listener.normalizer.trim_syn_payload(packet, tdb, ctx.stats);
            return;
        }
    }

    if seq == listener.next_ack {
        if window_closed(listener, tdb, ssn) {
            listener.normalizer.trim_win_payload(packet, tdb, 0, ctx.stats);
            return;
        }
        if listener.pending().is_none() {
            listener.next_ack = tdb.end_seq;
        }
        if packet.dsize() > 0 {
            if !ssn.flags.contains(SessionFlags::STREAM_ORDER_BAD) {
                packet.status |= PacketStatus::STREAM_ORDER_OK;
            }
            process_tcp_stream(listener, ssn, tdb, packet, events, ctx);
        }
        return;
    }

    trace!(
        "[{}]: out of order {:#010x}, expected {:#010x}",
        &ctx.config.trace_connections,
        ssn.connection_id,
        tdb.seq,
        listener.next_ack
    );
    if listener.pending().is_none() {
        if window_closed(listener, tdb, ssn) {
            listener.normalizer.trim_win_payload(packet, tdb, 0, ctx.stats);
            return;
        }
        // nothing is reassembled, keep following the sender
        if listener.state == TcpState::Established
            && listener.flush_policy == FlushPolicy::Ignore
            && seq_gt(tdb.end_seq, listener.next_ack)
        {
            listener.next_ack = tdb.end_seq;
        }
    }
    if packet.dsize() > 0 {
        let end = tdb.seq.wrapping_add(packet.dsize() as u32);
        if !ssn.flags.contains(SessionFlags::STREAM_ORDER_BAD) && !seq_leq(end, listener.next_ack) {
            ssn.flags |= SessionFlags::STREAM_ORDER_BAD;
            packet.status |= PacketStatus::STREAM_ORDER_BAD;
        }
        process_tcp_stream(listener, ssn, tdb, packet, events, ctx);
    }
}

/// Queue the payload in the listener's store.
fn process_tcp_stream(
    listener: &mut TcpTracker,
    ssn: &SessionState,
    tdb: &TcpDataBlock,
    packet: &mut PacketView,
    events: &mut EventMask,
    ctx: &mut StreamContext<'_>,
) {
    if packet.status.contains(PacketStatus::IGNORED) || listener.flush_policy == FlushPolicy::Ignore {
        return;
    }

    let config = ctx.config;
    if config.max_consec_small_segs > 0 {
        if (packet.dsize() as u32) < config.max_consec_small_seg_size {
            listener.small_seg_count += 1;
            if listener.small_seg_count > config.max_consec_small_segs {
                events.raise(TcpEvent::SmallSegment);
                listener.small_seg_count = 0;
            }
        } else {
            listener.small_seg_count = 0;
        }
    }

    let retransmits = ctx.stats.retransmits;
    match listener.store.insert(tdb, packet, listener.window_base, ctx.stats) {
        Ok(()) => {}
        Err(InsertError::BadSegment { seq, end_seq }) => {
            trace!("[{}]: bad segment {:#010x}..{:#010x}", &config.trace_connections, ssn.connection_id, seq, end_seq);
            events.raise(TcpEvent::BadSegment);
        }
        Err(error) => {
            if !listener.flags.contains(TrackerFlags::LIMIT_LOGGED) {
                log::warn!("[{}]: {}, dropping data", ssn.connection_id, error);
                listener.flags |= TrackerFlags::LIMIT_LOGGED;
            }
        }
    }
    if ctx.stats.retransmits > retransmits {
        packet.status |= PacketStatus::RETRANSMIT;
    }

    if config.overlap_limit > 0 && listener.store.overlap_count() > config.overlap_limit {
        events.raise(TcpEvent::ExcessiveOverlap);
        listener.store.reset_overlap_count();
    }
}
