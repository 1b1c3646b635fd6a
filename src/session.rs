/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */

//! One tracked TCP session: both trackers, session wide flags and the glue between
//! the trackers' segment stores and the [StreamObserver].
//!
//! Packet processing itself lives in [crate::fsm].

use bitflags::bitflags;

use crate::{
    config::StreamTcpConfig,
    data_block::TcpDataBlock,
    events::{EventMask, FlushData, SessionEvent, StreamObserver},
    packet::{Direction, PacketView, TcpFlags},
    stats::TcpStats,
    tcp_connection::TcpConnection,
    trace,
    tracker::{FlushPolicy, TcpState, TcpTracker, TrackerFlags},
};

/// Largest usable window scale shift.
pub const MAX_WINDOW_SCALE: u8 = 14;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SessionFlags: u16 {
        const SEEN_CLIENT = 0x0001;
        const SEEN_SERVER = 0x0002;
        const ESTABLISHED = 0x0004;
        const MIDSTREAM = 0x0008;
        const RESET = 0x0010;
        const ECN_CLIENT_QUERY = 0x0020;
        const ECN_SERVER_REPLY = 0x0040;
        /// Ethernet addresses were recorded when tracking started.
        const MACS_RECORDED = 0x0080;
        const CLIENT_SWAPPED = 0x0100;
        /// Data arrived out of order at least once.
        const STREAM_ORDER_BAD = 0x0200;
    }
}

bitflags! {
    /// Lightweight handshake progress, tracked before and alongside the trackers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StreamState: u8 {
        const SYN = 0x01;
        const SYN_ACK = 0x02;
        const ACK = 0x04;
        const ESTABLISHED = 0x08;
        const MIDSTREAM = 0x10;
        const CLOSED = 0x20;
    }
}

/// Per-call environment: configuration, the worker's counters and the upper layer.
pub struct StreamContext<'c> {
    pub config: &'c StreamTcpConfig,
    pub stats: &'c mut TcpStats,
    pub observer: &'c mut dyn StreamObserver,
}

/// Session wide state shared by both trackers.
#[derive(Debug)]
pub struct SessionState {
    /// Oriented client -> server.
    pub connection: TcpConnection,
    pub connection_id: u32,
    pub flags: SessionFlags,
    pub stream_state: StreamState,
    /// ECN negotiated by the handshake.
    pub ecn: bool,
    /// Trackers are initialized.
    pub tcp_init: bool,
    /// Lightweight session passed the pickup checks.
    pub lws_init: bool,
    /// Events raised at most once per session.
    pub event_mask: EventMask,
    /// Capture second of the first packet.
    pub first_time: u32,
    /// Capture second after which the idle session expires.
    pub expire_at: u32,
}

impl SessionState {
    pub fn two_way_traffic(&self) -> bool {
        self.flags.contains(SessionFlags::SEEN_CLIENT | SessionFlags::SEEN_SERVER)
    }

    pub fn is_midstream(&self) -> bool {
        self.stream_state.contains(StreamState::MIDSTREAM)
    }

    pub(crate) fn notify(&self, observer: &mut dyn StreamObserver, event: SessionEvent) {
        observer.session_event(self.connection_id, &self.connection, event);
    }

    /// Mark the session established, the observer hears about it once.
    pub(crate) fn establish(&mut self, observer: &mut dyn StreamObserver, trace_connections: &[u32]) {
        self.stream_state |= StreamState::ESTABLISHED;
        if !self.flags.contains(SessionFlags::ESTABLISHED) {
            self.flags |= SessionFlags::ESTABLISHED;
            trace!("[{}]: established {:?}", trace_connections, self.connection_id, self.connection);
            self.notify(observer, SessionEvent::Established);
        }
    }
}

#[derive(Debug)]
pub struct TcpSession {
    pub client: TcpTracker,
    pub server: TcpTracker,
    pub ssn: SessionState,
}

impl TcpSession {
    pub fn new(connection: TcpConnection, connection_id: u32, first_time: u32, config: &StreamTcpConfig) -> Self {
        Self {
            client: TcpTracker::new(config.policy_for(&connection.client_address), config),
            server: TcpTracker::new(config.policy_for(&connection.server_address), config),
            ssn: SessionState {
                connection,
                connection_id,
                flags: SessionFlags::empty(),
                stream_state: StreamState::empty(),
                ecn: false,
                tcp_init: false,
                lws_init: false,
                event_mask: EventMask::empty(),
                first_time,
                expire_at: first_time.saturating_add(config.session_timeout),
            },
        }
    }

    pub fn connection_id(&self) -> u32 {
        self.ssn.connection_id
    }

    pub fn connection(&self) -> &TcpConnection {
        &self.ssn.connection
    }

    /// (talker, listener, session) for a packet travelling in the given direction.
    pub(crate) fn split(&mut self, from_client: bool) -> (&mut TcpTracker, &mut TcpTracker, &mut SessionState) {
        if from_client {
            (&mut self.client, &mut self.server, &mut self.ssn)
        } else {
            (&mut self.server, &mut self.client, &mut self.ssn)
        }
    }

    /// The presumed server turned out to be the client.
    pub(crate) fn swap_roles(&mut self) {
        std::mem::swap(&mut self.client, &mut self.server);
        self.ssn.connection = self.ssn.connection.get_reverse_connection();
        if !self.ssn.two_way_traffic() {
            let seen_client = self.ssn.flags.contains(SessionFlags::SEEN_CLIENT);
            let seen_server = self.ssn.flags.contains(SessionFlags::SEEN_SERVER);
            self.ssn.flags.set(SessionFlags::SEEN_CLIENT, seen_server);
            self.ssn.flags.set(SessionFlags::SEEN_SERVER, seen_client);
        }
        self.ssn.flags |= SessionFlags::CLIENT_SWAPPED;
    }

    fn reset_trackers(&mut self, config: &StreamTcpConfig) {
        self.client = TcpTracker::new(config.policy_for(&self.ssn.connection.client_address), config);
        self.server = TcpTracker::new(config.policy_for(&self.ssn.connection.server_address), config);
    }

    pub(crate) fn new_session_on_syn(&mut self, packet: &mut PacketView, tdb: &mut TcpDataBlock, ctx: &mut StreamContext<'_>) {
        self.ssn.flags |= SessionFlags::SEEN_CLIENT;
        if packet.flags().contains(TcpFlags::CWR | TcpFlags::ECE) {
            self.ssn.flags |= SessionFlags::ECN_CLIENT_QUERY;
        }

        let client = &mut self.client;
        client.state = TcpState::SynSent;
        client.isn = tdb.seq;
        client.unacked = tdb.seq.wrapping_add(1);
        client.next_seq = tdb.end_seq;
        client.window = tdb.window;
        client.ts_last_packet = packet.time_secs;

        let server = &mut self.server;
        server.store.init_base_seq(client.unacked);
        server.next_ack = client.unacked;
        server.window_base = tdb.seq.wrapping_add(1);
        server.state = TcpState::Listen;

        record_options(&mut self.client, packet, tdb, ctx.stats);
        copy_macs(&mut self.client, &mut self.server, &mut self.ssn, packet);

        ctx.stats.sessions_on_syn += 1;
        self.new_session(packet, ctx);
    }

    pub(crate) fn new_session_on_syn_ack(&mut self, packet: &mut PacketView, tdb: &mut TcpDataBlock, ctx: &mut StreamContext<'_>) {
        self.ssn.flags |= SessionFlags::SEEN_SERVER;
        if packet.flags().contains(TcpFlags::CWR | TcpFlags::ECE) {
            self.ssn.flags |= SessionFlags::ECN_SERVER_REPLY;
        }

        let server = &mut self.server;
        server.state = TcpState::SynRcvd;
        server.isn = tdb.seq;
        server.unacked = tdb.seq.wrapping_add(1);
        server.next_seq = server.unacked;
        server.window = tdb.window;
        server.store.init_base_seq(tdb.ack);
        server.window_base = tdb.ack;
        server.next_ack = tdb.ack;
        server.ts_last_packet = packet.time_secs;

        let client = &mut self.client;
        client.store.init_base_seq(server.unacked);
        client.next_ack = server.unacked;
        client.window_base = tdb.seq.wrapping_add(1);
        client.next_seq = tdb.ack;
        client.isn = tdb.ack.wrapping_sub(1);
        client.state = TcpState::SynSent;

        record_options(&mut self.server, packet, tdb, ctx.stats);
        copy_macs(&mut self.client, &mut self.server, &mut self.ssn, packet);

        ctx.stats.sessions_on_syn_ack += 1;
        self.new_session(packet, ctx);
    }

    /// Pickup on the client's handshake ACK. The ACK consumes no sequence space, so `seq` is
    /// the first data byte.
    pub(crate) fn new_session_on_3way(&mut self, packet: &mut PacketView, tdb: &mut TcpDataBlock, ctx: &mut StreamContext<'_>) {
        self.ssn.flags |= SessionFlags::SEEN_CLIENT;
        if packet.flags().contains(TcpFlags::CWR | TcpFlags::ECE) {
            self.ssn.flags |= SessionFlags::ECN_CLIENT_QUERY;
        }

        let client = &mut self.client;
        client.state = TcpState::Established;
        client.isn = tdb.seq.wrapping_sub(1);
        client.unacked = tdb.seq;
        client.next_seq = tdb.seq;
        client.window = tdb.window;
        client.ts_last_packet = packet.time_secs;

        let server = &mut self.server;
        server.store.init_base_seq(client.unacked);
        server.next_ack = client.unacked;
        server.window_base = tdb.seq;
        server.state = TcpState::Established;

        record_options(&mut self.client, packet, tdb, ctx.stats);
        copy_macs(&mut self.client, &mut self.server, &mut self.ssn, packet);

        ctx.stats.sessions_on_3way += 1;
        self.new_session(packet, ctx);
        self.ssn.establish(ctx.observer, &ctx.config.trace_connections);
    }

    /// Midstream pickup, the sender of this packet keeps its role.
    pub(crate) fn new_session_on_data(&mut self, packet: &mut PacketView, tdb: &mut TcpDataBlock, ctx: &mut StreamContext<'_>) {
        if packet.is_from_client() {
            self.ssn.flags |= SessionFlags::SEEN_CLIENT;
            if packet.flags().contains(TcpFlags::CWR | TcpFlags::ECE) {
                self.ssn.flags |= SessionFlags::ECN_CLIENT_QUERY;
            }

            let client = &mut self.client;
            client.state = TcpState::Established;
            client.isn = tdb.seq;
            client.unacked = tdb.seq;
            client.next_seq = tdb.seq;
            client.window = tdb.window;
            client.ts_last_packet = packet.time_secs;

            let server = &mut self.server;
            server.store.init_base_seq(client.unacked);
            server.next_ack = client.unacked;
            server.window_base = tdb.seq;
            // learnt from the server's first packet
            server.window = 0;
            server.unacked = tdb.ack.wrapping_sub(1);
            server.state = TcpState::Established;

            record_options(&mut self.client, packet, tdb, ctx.stats);
        } else {
            self.ssn.flags |= SessionFlags::SEEN_SERVER;

            let server = &mut self.server;
            server.state = TcpState::Established;
            server.isn = tdb.seq;
            server.unacked = tdb.seq;
            server.next_seq = tdb.seq;
            server.window = tdb.window;
            server.store.init_base_seq(tdb.ack);
            server.window_base = tdb.ack;
            server.next_ack = tdb.ack;
            server.ts_last_packet = packet.time_secs;

            let client = &mut self.client;
            client.store.init_base_seq(server.unacked);
            client.next_ack = server.unacked;
            client.window_base = tdb.seq;
            client.window = 0;
            client.isn = tdb.ack.wrapping_sub(1);
            client.state = TcpState::Established;

            record_options(&mut self.server, packet, tdb, ctx.stats);
        }
        copy_macs(&mut self.client, &mut self.server, &mut self.ssn, packet);

        ctx.stats.sessions_on_data += 1;
        self.new_session(packet, ctx);
    }

    fn new_session(&mut self, packet: &PacketView, ctx: &mut StreamContext<'_>) {
        self.ssn.flags.remove(SessionFlags::RESET);

        let to_server = ctx.observer.wants_reassembly(&self.ssn.connection, true);
        self.server.init_flush_policy(to_server);
        let to_client = ctx.observer.wants_reassembly(&self.ssn.connection, false);
        self.client.init_flush_policy(to_client);

        self.ssn.expire_at = packet.time_secs.saturating_add(ctx.config.session_timeout);
        self.ssn.ecn = false;
        self.ssn.tcp_init = true;
        self.ssn.lws_init = true;
        ctx.stats.trackers_created += 1;

        trace!(
            "[{}]: tracking {:?}, client {} {:?}, server {} {:?}",
            &ctx.config.trace_connections,
            self.ssn.connection_id,
            self.ssn.connection,
            self.client.policy(),
            self.client.flush_policy,
            self.server.policy(),
            self.server.flush_policy,
        );
    }

    /// Release trackers and queued data without delivering it.
    pub fn clear(&mut self, ctx: &mut StreamContext<'_>) {
        if self.ssn.tcp_init {
            ctx.stats.trackers_released += 1;
            self.ssn.notify(ctx.observer, SessionEvent::Closed);
        } else if self.ssn.lws_init {
            ctx.stats.no_pickups += 1;
        } else {
            return;
        }

        let purged = self.client.store.purge() + self.server.store.purge();
        trace!("[{}]: cleared, {} segments purged", &ctx.config.trace_connections, self.ssn.connection_id, purged);

        self.reset_trackers(ctx.config);
        self.ssn.flags = SessionFlags::empty();
        self.ssn.stream_state = StreamState::empty();
        self.ssn.ecn = false;
        self.ssn.tcp_init = false;
        self.ssn.lws_init = false;
    }

    /// Deliver everything queued, holes included, then [TcpSession::clear].
    pub fn cleanup(&mut self, ctx: &mut StreamContext<'_>) {
        force_flush_tracker(&mut self.client, &self.ssn, Direction::FromServer, ctx);
        force_flush_tracker(&mut self.server, &self.ssn, Direction::FromClient, ctx);
        self.clear(ctx);
    }

    /// Re-run the flush policies for `packet` without processing it.
    pub fn restart(&mut self, packet: &PacketView, ctx: &mut StreamContext<'_>) {
        let direction = packet.direction;
        let (talker, listener, ssn) = self.split(direction.is_from_client());
        if packet.dsize() > 0 {
            flush_on_data(listener, ssn, direction, ctx);
        }
        if packet.flags().contains(TcpFlags::ACK) {
            flush_on_ack(talker, ssn, direction, ctx);
        }
    }

    /// Deliver the contiguous bytes sent by the server.
    pub fn flush_client(&mut self, ctx: &mut StreamContext<'_>) -> u32 {
        flush_tracker(&mut self.client, &self.ssn, Direction::FromServer, None, ctx)
    }

    /// Deliver the contiguous bytes sent by the client.
    pub fn flush_server(&mut self, ctx: &mut StreamContext<'_>) -> u32 {
        flush_tracker(&mut self.server, &self.ssn, Direction::FromClient, None, ctx)
    }

    /// Deliver the contiguous bytes received by the sender of a packet travelling in `direction`.
    pub fn flush_talker(&mut self, direction: Direction, ctx: &mut StreamContext<'_>) -> u32 {
        let (talker, _, ssn) = self.split(direction.is_from_client());
        flush_tracker(talker, ssn, direction.reverse(), None, ctx)
    }

    /// Deliver the contiguous bytes travelling in `direction`.
    pub fn flush_listener(&mut self, direction: Direction, ctx: &mut StreamContext<'_>) -> u32 {
        let (_, listener, ssn) = self.split(direction.is_from_client());
        flush_tracker(listener, ssn, direction, None, ctx)
    }

    /// Attach or detach the collaborator of one direction at runtime.
    pub fn set_splitter(&mut self, to_server: bool, attached: bool) {
        let tracker = if to_server { &mut self.server } else { &mut self.client };
        if attached {
            tracker.init_flush_policy(true);
        } else {
            tracker.flush_policy = FlushPolicy::Ignore;
        }
    }

    pub fn is_expired(&self, now: u32) -> bool {
        self.ssn.expire_at != 0 && now > self.ssn.expire_at
    }

    /// Tracker receiving the rebuilt data a packet in `direction` belongs to.
    fn alert_tracker(&mut self, direction: Direction) -> &mut TcpTracker {
        match direction {
            Direction::FromClient => &mut self.server,
            Direction::FromServer => &mut self.client,
        }
    }

    pub fn add_alert(&mut self, direction: Direction, gid: u32, sid: u32) -> bool {
        self.alert_tracker(direction).add_alert(gid, sid)
    }

    pub fn check_alerted(&mut self, direction: Direction, gid: u32, sid: u32, seq: u32) -> bool {
        self.alert_tracker(direction).check_alerted(gid, sid, seq)
    }

    pub fn update_alert(&mut self, direction: Direction, gid: u32, sid: u32, event_id: u32, event_second: u32) -> bool {
        self.alert_tracker(direction).update_alert(gid, sid, event_id, event_second)
    }
}

/// Timestamp, MSS and window scale announced by the sender of a handshake packet.
pub(crate) fn record_options(tracker: &mut TcpTracker, packet: &mut PacketView, tdb: &mut TcpDataBlock, stats: &mut TcpStats) {
    if tracker.normalizer.get_tcp_timestamp(packet, tdb, false, stats) {
        tracker.flags |= TrackerFlags::TSTAMP;
    }
    tracker.ts_last = tdb.ts;
    if tdb.ts == 0 {
        tracker.flags |= TrackerFlags::TSTAMP_ZERO;
    }
    match packet.header.options.mss {
        Some(mss) => {
            tracker.mss = mss;
            tracker.flags |= TrackerFlags::MSS;
        }
        None => tracker.mss = 0,
    }
    match packet.header.options.window_scale {
        Some(shift) => {
            tracker.wscale = shift.min(MAX_WINDOW_SCALE);
            tracker.flags |= TrackerFlags::WSCALE;
        }
        None => tracker.wscale = 0,
    }
}

/// Complete the server side from its SYN-ACK, or from its first packet on a midstream pickup.
pub(crate) fn finish_server_init(
    server: &mut TcpTracker,
    client: &mut TcpTracker,
    ssn: &SessionState,
    tdb: &mut TcpDataBlock,
    packet: &mut PacketView,
    stats: &mut TcpStats,
) {
    server.window = tdb.window;
    server.unacked = tdb.seq.wrapping_add(1);
    server.next_seq = server.unacked;
    server.isn = tdb.seq;
    client.next_ack = tdb.end_seq;
    if packet.flags().contains(TcpFlags::FIN) {
        server.next_seq = server.next_seq.wrapping_sub(1);
    }

    if ssn.is_midstream() {
        client.store.init_base_seq(tdb.seq);
        client.window_base = tdb.seq;
    } else {
        server.state = TcpState::SynRcvd;
        client.store.init_base_seq(server.unacked);
        client.window_base = tdb.end_seq;
    }

    if server.normalizer.get_tcp_timestamp(packet, tdb, false, stats) {
        server.flags |= TrackerFlags::TSTAMP;
    }
    server.ts_last = tdb.ts;
    if server.ts_last == 0 {
        server.flags |= TrackerFlags::TSTAMP_ZERO;
    } else {
        server.ts_last_packet = packet.time_secs;
    }
    if let Some(mss) = packet.header.options.mss {
        server.mss = mss;
        server.flags |= TrackerFlags::MSS;
    }
    if let Some(shift) = packet.header.options.window_scale {
        server.wscale = shift.min(MAX_WINDOW_SCALE);
        server.flags |= TrackerFlags::WSCALE;
    }
}

fn copy_macs(client: &mut TcpTracker, server: &mut TcpTracker, ssn: &mut SessionState, packet: &PacketView) {
    let Some(macs) = packet.macs else {
        return;
    };
    if packet.is_from_client() {
        client.mac_address = macs.source;
        server.mac_address = macs.destination;
    } else {
        server.mac_address = macs.source;
        client.mac_address = macs.destination;
    }
    ssn.flags |= SessionFlags::MACS_RECORDED;
}

/// Compare the frame's Ethernet addresses with the ones recorded at session start.
/// Both swapped is taken as a tap and accepted.
pub(crate) fn valid_mac_address(talker: &TcpTracker, listener: &TcpTracker, ssn: &SessionState, packet: &PacketView) -> EventMask {
    let mut events = EventMask::empty();
    let Some(macs) = packet.macs else {
        return events;
    };
    if !ssn.flags.contains(SessionFlags::MACS_RECORDED) {
        return events;
    }

    let talker_ok = talker.mac_address == macs.source;
    let listener_ok = listener.mac_address == macs.destination;
    if !talker_ok && !listener_ok && talker.mac_address == macs.destination && listener.mac_address == macs.source {
        return events;
    }

    let from_client = packet.is_from_client();
    if !talker_ok {
        events |= if from_client {
            EventMask::SESSION_HIJACK_CLIENT
        } else {
            EventMask::SESSION_HIJACK_SERVER
        };
    }
    if !listener_ok {
        events |= if from_client {
            EventMask::SESSION_HIJACK_SERVER
        } else {
            EventMask::SESSION_HIJACK_CLIENT
        };
    }
    events
}

/// Offer the contiguous bytes of `tracker`'s store, travelling in `direction`, up to `limit`.
pub(crate) fn flush_tracker(tracker: &mut TcpTracker, ssn: &SessionState, direction: Direction, limit: Option<u32>, ctx: &mut StreamContext<'_>) -> u32 {
    let connection = &ssn.connection;
    let connection_id = ssn.connection_id;
    let stats = &mut *ctx.stats;
    let observer = &mut *ctx.observer;
    let flushed = tracker.store.flush(limit, &mut |seq, data, flags| {
        stats.rebuilt_packets += 1;
        stats.rebuilt_bytes += data.len() as u64;
        observer.flush(FlushData {
            connection_id,
            connection,
            direction,
            seq,
            data,
            flags,
        })
    });
    if flushed > 0 {
        trace!(
            "[{}]: flushed {} bytes {:?}, next {:#010x}",
            &ctx.config.trace_connections,
            connection_id,
            flushed,
            direction,
            tracker.store.base_seq()
        );
    }
    flushed
}

/// Deliver everything `tracker` holds, reporting holes and unconsumed bytes as lost.
pub(crate) fn force_flush_tracker(tracker: &mut TcpTracker, ssn: &SessionState, direction: Direction, ctx: &mut StreamContext<'_>) -> u32 {
    if tracker.store.is_empty() {
        return 0;
    }
    let connection = &ssn.connection;
    let connection_id = ssn.connection_id;
    let mut rebuilt_packets = 0;
    let mut rebuilt_bytes = 0;
    let mut losses = Vec::new();
    let flushed = {
        let observer = &mut *ctx.observer;
        tracker.store.force_flush(
            &mut |seq, data, flags| {
                rebuilt_packets += 1;
                rebuilt_bytes += data.len() as u64;
                observer.flush(FlushData {
                    connection_id,
                    connection,
                    direction,
                    seq,
                    data,
                    flags,
                })
            },
            &mut |seq, lost| losses.push((seq, lost)),
            ctx.stats,
        )
    };
    ctx.stats.rebuilt_packets += rebuilt_packets;
    ctx.stats.rebuilt_bytes += rebuilt_bytes;
    for (seq, lost) in losses {
        trace!("[{}]: lost {} bytes at {:#010x}", &ctx.config.trace_connections, connection_id, lost, seq);
        ctx.observer.packet_loss(connection_id, direction, seq, lost);
    }
    flushed
}

/// Deliver what the talker acknowledged. Acknowledged holes are skipped and reported as lost.
pub(crate) fn flush_on_ack(talker: &mut TcpTracker, ssn: &SessionState, packet_direction: Direction, ctx: &mut StreamContext<'_>) -> u32 {
    if talker.flush_policy != FlushPolicy::OnAck {
        return 0;
    }
    let direction = packet_direction.reverse();
    let limit = talker.window_base;
    let mut flushed = 0;
    loop {
        flushed += flush_tracker(talker, ssn, direction, Some(limit), ctx);
        let Some((seq, lost)) = talker.store.skip_hole(limit) else {
            break;
        };
        ctx.stats.gaps += 1;
        trace!("[{}]: acked hole of {} bytes at {:#010x}", &ctx.config.trace_connections, ssn.connection_id, lost, seq);
        ctx.observer.packet_loss(ssn.connection_id, direction, seq, lost);
    }
    talker.store.advance_base_seq(limit);
    flushed
}

/// Deliver contiguous data as soon as it is queued.
pub(crate) fn flush_on_data(listener: &mut TcpTracker, ssn: &SessionState, packet_direction: Direction, ctx: &mut StreamContext<'_>) -> u32 {
    if listener.flush_policy != FlushPolicy::OnData {
        return 0;
    }
    flush_tracker(listener, ssn, packet_direction, None, ctx)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        events::{FlushFlags, NullObserver},
        packet::{MacAddresses, SegmentHeader},
        segment_store::test::insert,
    };
    use std::net::{IpAddr, Ipv4Addr};

    #[derive(Default)]
    struct Recorder {
        data: Vec<(Direction, u32, Vec<u8>, FlushFlags)>,
        losses: Vec<(Direction, u32, u32)>,
        events: Vec<SessionEvent>,
    }

    impl StreamObserver for Recorder {
        fn flush(&mut self, data: FlushData<'_>) -> usize {
            self.data.push((data.direction, data.seq, data.data.to_vec(), data.flags));
            data.data.len()
        }

        fn packet_loss(&mut self, _connection_id: u32, direction: Direction, seq: u32, lost_bytes: u32) {
            self.losses.push((direction, seq, lost_bytes));
        }

        fn session_event(&mut self, _connection_id: u32, _connection: &TcpConnection, event: SessionEvent) {
            self.events.push(event);
        }
    }

    fn connection() -> TcpConnection {
        TcpConnection::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 40000, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 80)
    }

    fn session(config: &StreamTcpConfig) -> TcpSession {
        let mut session = TcpSession::new(connection(), 1, 100, config);
        session.ssn.tcp_init = true;
        session.client.init_flush_policy(true);
        session.server.init_flush_policy(true);
        session
    }

    #[test]
    fn test_swap_roles() {
        let config = StreamTcpConfig::default();
        let mut session = TcpSession::new(connection(), 1, 0, &config);
        session.ssn.flags |= SessionFlags::SEEN_CLIENT;
        session.client.isn = 7;
        session.swap_roles();
        assert_eq!(session.ssn.connection, connection().get_reverse_connection());
        assert_eq!(session.server.isn, 7);
        assert!(session.ssn.flags.contains(SessionFlags::SEEN_SERVER | SessionFlags::CLIENT_SWAPPED));
        assert!(!session.ssn.flags.contains(SessionFlags::SEEN_CLIENT));
    }

    #[test]
    fn test_flush_on_ack_skips_acked_hole() {
        let config = StreamTcpConfig::default();
        let mut stats = TcpStats::default();
        let mut recorder = Recorder::default();
        let mut session = session(&config);
        session.server.store.init_base_seq(1000);
        insert(&mut session.server.store, 1000, b"abcd", &mut stats).unwrap();
        insert(&mut session.server.store, 1008, b"ijkl", &mut stats).unwrap();
        session.server.window_base = 1012;

        let mut ctx = StreamContext {
            config: &config,
            stats: &mut stats,
            observer: &mut recorder,
        };
        let TcpSession { server, ssn, .. } = &mut session;
        // the server acks client bytes, so the packet travels from the server
        let flushed = flush_on_ack(server, ssn, Direction::FromServer, &mut ctx);

        assert_eq!(flushed, 8);
        assert_eq!(stats.gaps, 1);
        assert_eq!(stats.rebuilt_packets, 2);
        assert_eq!(stats.rebuilt_bytes, 8);
        assert_eq!(recorder.losses, vec![(Direction::FromClient, 1004, 4)]);
        assert_eq!(recorder.data[0].1, 1000);
        assert_eq!(recorder.data[0].2, b"abcd");
        assert_eq!(recorder.data[1].1, 1008);
        assert_eq!(recorder.data[1].2, b"ijkl");
        assert!(session.server.store.is_empty());
        assert_eq!(session.server.store.base_seq(), 1012);
    }

    #[test]
    fn test_flush_on_ack_stops_at_ack() {
        let config = StreamTcpConfig::default();
        let mut stats = TcpStats::default();
        let mut recorder = Recorder::default();
        let mut session = session(&config);
        session.server.store.init_base_seq(1000);
        insert(&mut session.server.store, 1000, b"abcdefgh", &mut stats).unwrap();
        session.server.window_base = 1003;

        let mut ctx = StreamContext {
            config: &config,
            stats: &mut stats,
            observer: &mut recorder,
        };
        let TcpSession { server, ssn, .. } = &mut session;
        assert_eq!(flush_on_ack(server, ssn, Direction::FromServer, &mut ctx), 3);
        assert_eq!(recorder.data[0].2, b"abc");
        assert!(!recorder.data[0].3.contains(FlushFlags::PDU_TAIL));
        assert_eq!(session.server.store.base_seq(), 1003);
        assert_eq!(session.server.store.bytes_queued_logical(), 5);
    }

    #[test]
    fn test_cleanup_reports_and_releases() {
        let config = StreamTcpConfig::default();
        let mut stats = TcpStats::default();
        let mut recorder = Recorder::default();
        let mut session = session(&config);
        session.client.store.init_base_seq(5000);
        insert(&mut session.client.store, 5004, b"tail", &mut stats).unwrap();

        let mut ctx = StreamContext {
            config: &config,
            stats: &mut stats,
            observer: &mut recorder,
        };
        session.cleanup(&mut ctx);

        assert_eq!(recorder.losses, vec![(Direction::FromServer, 5000, 4)]);
        assert_eq!(recorder.data.len(), 1);
        assert_eq!(recorder.data[0].0, Direction::FromServer);
        assert!(recorder.data[0].3.contains(FlushFlags::FORCED));
        assert_eq!(recorder.events, vec![SessionEvent::Closed]);
        assert_eq!(stats.trackers_released, 1);
        assert!(!session.ssn.tcp_init);
        assert_eq!(session.client.state, TcpState::Closed);
        assert!(session.client.store.is_empty());
    }

    #[test]
    fn test_clear_without_tracking() {
        let config = StreamTcpConfig::default();
        let mut stats = TcpStats::default();
        let mut observer = NullObserver;
        let mut session = TcpSession::new(connection(), 1, 0, &config);
        let mut ctx = StreamContext {
            config: &config,
            stats: &mut stats,
            observer: &mut observer,
        };
        session.clear(&mut ctx);
        session.ssn.lws_init = true;
        session.clear(&mut ctx);
        assert_eq!(stats.no_pickups, 1);
        assert_eq!(stats.trackers_released, 0);
    }

    #[test]
    fn test_set_splitter_and_expiry() {
        let config = StreamTcpConfig::default();
        let mut session = session(&config);
        session.set_splitter(true, false);
        assert_eq!(session.server.flush_policy, FlushPolicy::Ignore);
        session.set_splitter(true, true);
        assert_eq!(session.server.flush_policy, FlushPolicy::OnAck);

        assert_eq!(session.ssn.expire_at, 100 + config.session_timeout);
        assert!(!session.is_expired(100 + config.session_timeout));
        assert!(session.is_expired(101 + config.session_timeout));
    }

    #[test]
    fn test_alerts_follow_direction() {
        let config = StreamTcpConfig::default();
        let mut session = session(&config);
        session.server.next_ack = 500;
        assert!(session.add_alert(Direction::FromClient, 129, 5));
        assert!(session.check_alerted(Direction::FromClient, 129, 5, 400));
        assert!(session.check_alerted(Direction::FromClient, 129, 5, 500));
        assert!(!session.check_alerted(Direction::FromClient, 129, 5, 600));
        assert!(!session.check_alerted(Direction::FromClient, 129, 6, 400));
        assert!(!session.check_alerted(Direction::FromServer, 129, 5, 400));
        assert!(session.update_alert(Direction::FromClient, 129, 5, 1, 2));
        assert_eq!(session.server.alerts().len(), 1);
    }

    #[test]
    fn test_hijack_detection() {
        let config = StreamTcpConfig::default();
        let mut stats = TcpStats::default();
        let mut observer = NullObserver;
        let mut session = TcpSession::new(connection(), 1, 0, &config);
        let client_mac = [2, 0, 0, 0, 0, 1];
        let server_mac = [2, 0, 0, 0, 0, 2];
        let header = SegmentHeader {
            seq: 100,
            flags: TcpFlags::SYN,
            window: 1024,
            ..Default::default()
        };
        let mut packet = PacketView::new(header, b"", Direction::FromClient).with_macs(MacAddresses {
            source: client_mac,
            destination: server_mac,
        });
        let mut tdb = TcpDataBlock::extract(&packet, &mut stats);
        let mut ctx = StreamContext {
            config: &config,
            stats: &mut stats,
            observer: &mut observer,
        };
        session.new_session_on_syn(&mut packet, &mut tdb, &mut ctx);
        assert_eq!(session.client.mac_address, client_mac);

        let TcpSession { client, server, ssn } = &session;
        assert!(valid_mac_address(client, server, ssn, &packet).is_empty());

        let tap = PacketView::new(header, b"", Direction::FromClient).with_macs(MacAddresses {
            source: server_mac,
            destination: client_mac,
        });
        assert!(valid_mac_address(client, server, ssn, &tap).is_empty());

        let forged = PacketView::new(header, b"", Direction::FromServer).with_macs(MacAddresses {
            source: [2, 0, 0, 0, 0, 9],
            destination: client_mac,
        });
        assert_eq!(valid_mac_address(server, client, ssn, &forged), EventMask::SESSION_HIJACK_SERVER);
    }
}
