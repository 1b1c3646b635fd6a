/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */
use std::net::IpAddr;

use etherparse::{IpNumber, Ipv4HeaderSlice, Ipv6HeaderSlice, TcpHeaderSlice};
use indexmap::IndexMap;

use crate::{
    config::StreamTcpConfig,
    error::PacketError,
    events::{Action, StreamObserver},
    packet::{Direction, PacketView, SegmentHeader},
    session::{StreamContext, TcpSession},
    stats::TcpStats,
    tcp_connection::TcpConnection,
    trace,
};

/// Flow table entry.
#[derive(Debug)]
pub struct Flow {
    pub session: TcpSession,
    /// Logging channel the flow was first seen on, 0 for none.
    pub stick_to_logging_channel: u16,
}

/// * Create one [StreamTcp] per worker. Flows must be sharded so that one flow is always handled by the same worker.
/// * For each TCP packet call [StreamTcp::handle_packet()], or one of the decoding entry points
///   [StreamTcp::handle_segment()], [StreamTcp::handle_segment_v6()], [StreamTcp::handle_ip_packet()].
/// * Reassembled data, anomalies and session lifecycle go to the [StreamObserver].
/// * Call [StreamTcp::flush_all()] at shutdown or at the end of a capture.
/// * Merge [StreamTcp::stats] into a [crate::StatsAccumulator] at checkpoints.
#[derive(Debug)]
pub struct StreamTcp {
    pub config: StreamTcpConfig,
    pub stats: TcpStats,
    /// Keyed by the orientation of the first packet seen. IndexMap keeps flows in order of
    /// appearance, expiry and drain visit the oldest first.
    flows: IndexMap<TcpConnection, Flow>,
    /// Connection id is sequentially generated on a first seen basis.
    last_connection_id: u32,
    last_expiry_check: u32,
}

impl Default for StreamTcp {
    fn default() -> Self {
        StreamTcp::new(StreamTcpConfig::default())
    }
}

impl StreamTcp {
    pub fn new(config: StreamTcpConfig) -> Self {
        Self {
            config,
            stats: TcpStats::default(),
            flows: IndexMap::new(),
            last_connection_id: 0,
            last_expiry_check: 0,
        }
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Session of `connection`, in either orientation.
    pub fn session(&self, connection: &TcpConnection) -> Option<&TcpSession> {
        self.flows
            .get(connection)
            .or_else(|| self.flows.get(&connection.get_reverse_connection()))
            .map(|flow| &flow.session)
    }

    pub fn session_mut(&mut self, connection: &TcpConnection) -> Option<&mut TcpSession> {
        let key = if self.flows.contains_key(connection) {
            *connection
        } else {
            connection.get_reverse_connection()
        };
        self.flows.get_mut(&key).map(|flow| &mut flow.session)
    }

    fn find_flow(&self, source_address: IpAddr, source_port: u16, destination_address: IpAddr, destination_port: u16) -> Option<usize> {
        let forward = TcpConnection::new(source_address, source_port, destination_address, destination_port);
        self.flows
            .get_index_of(&forward)
            .or_else(|| self.flows.get_index_of(&forward.get_reverse_connection()))
    }

    /// Orientation of a flow seen for the first time: SYN sender, SYN-ACK receiver, else the higher port.
    fn first_sight_connection(packet: &PacketView) -> TcpConnection {
        let header = &packet.header;
        let flags = header.flags;
        let source_is_client = if flags.is_syn_only() {
            true
        } else if flags.is_syn_ack() {
            false
        } else {
            header.source_port >= header.destination_port
        };
        if source_is_client {
            TcpConnection::new(packet.source_address, header.source_port, packet.destination_address, header.destination_port)
        } else {
            TcpConnection::new(packet.destination_address, header.destination_port, packet.source_address, header.source_port)
        }
    }

    /// Main function, runs one packet through its flow.
    /// # Arguments
    /// * `logging_channel_id`: Allow to ignore duplicated packets if they are captured multiple times by logging equipment.
    ///   A flow sticks to the channel it was first seen on.
    /// * `packet`: Addresses and time must be set. Its direction is set here. Writable packets may be normalized in place,
    ///   check [crate::PacketStatus::MODIFIED] afterwards.
    /// * `observer`: Upper layer receiving data, events and lifecycle notifications.
    pub fn handle_packet(&mut self, logging_channel_id: Option<u16>, packet: &mut PacketView, observer: &mut dyn StreamObserver) -> Action {
        let now = packet.time_secs;
        if now != self.last_expiry_check {
            self.expire_idle(now, observer);
            self.last_expiry_check = now;
        }

        let logging_channel_id = logging_channel_id.unwrap_or(0);
        let header = packet.header;
        let index = match self.find_flow(packet.source_address, header.source_port, packet.destination_address, header.destination_port) {
            Some(index) => {
                let stick_to_logging_channel = self.flows[index].stick_to_logging_channel;
                // Use packets from the logging channel which has appeared first, avoid processing the same packet twice.
                if logging_channel_id != 0 && stick_to_logging_channel != logging_channel_id {
                    return Action::empty();
                }
                index
            }
            None => {
                let connection = Self::first_sight_connection(packet);
                self.last_connection_id += 1;
                self.stats.sessions += 1;
                let session = TcpSession::new(connection, self.last_connection_id, now, &self.config);
                trace!("[{}]: new flow {:?}", &self.config.trace_connections, self.last_connection_id, connection);
                let (index, _) = self.flows.insert_full(
                    connection,
                    Flow {
                        session,
                        stick_to_logging_channel: logging_channel_id,
                    },
                );
                index
            }
        };

        let Some((_, flow)) = self.flows.get_index_mut(index) else {
            return Action::empty();
        };
        let Some(direction) = flow.session.connection().direction_of(
            packet.source_address,
            header.source_port,
            packet.destination_address,
            header.destination_port,
        ) else {
            return Action::empty();
        };
        packet.direction = direction;

        let mut ctx = StreamContext {
            config: &self.config,
            stats: &mut self.stats,
            observer,
        };
        let action = flow.session.process(packet, &mut ctx);

        if action.contains(Action::LWSSN_CLOSED) {
            if let Some((_, flow)) = self.flows.shift_remove_index(index) {
                trace!("[{}]: flow removed", &self.config.trace_connections, flow.session.connection_id());
            }
        }
        action
    }

    /// Decode entry point for IPv4.
    /// # Arguments
    /// * `tcp_payload`: Bytes after the TCP header. Link layer padding beyond the IP payload length is ignored.
    /// * `time_secs`: Capture time, seconds.
    pub fn handle_segment(
        &mut self,
        logging_channel_id: Option<u16>,
        ipv4_header_slice: &Ipv4HeaderSlice,
        tcp_header_slice: &TcpHeaderSlice,
        tcp_payload: &[u8],
        time_secs: u32,
        observer: &mut dyn StreamObserver,
    ) -> Result<Action, PacketError> {
        let ip_payload_len = ipv4_header_slice
            .payload_len()
            .map_err(|error| PacketError::IpPayloadLength(error.to_string()))?;
        let payload = segment_payload(ip_payload_len as usize, tcp_header_slice, tcp_payload)?;
        let mut packet = PacketView::new(SegmentHeader::from(tcp_header_slice), payload, Direction::FromClient)
            .with_addresses(
                IpAddr::V4(ipv4_header_slice.source_addr()),
                IpAddr::V4(ipv4_header_slice.destination_addr()),
            )
            .with_time(time_secs);
        Ok(self.handle_packet(logging_channel_id, &mut packet, observer))
    }

    /// Decode entry point for IPv6 without extension headers.
    pub fn handle_segment_v6(
        &mut self,
        logging_channel_id: Option<u16>,
        ipv6_header_slice: &Ipv6HeaderSlice,
        tcp_header_slice: &TcpHeaderSlice,
        tcp_payload: &[u8],
        time_secs: u32,
        observer: &mut dyn StreamObserver,
    ) -> Result<Action, PacketError> {
        let payload = segment_payload(ipv6_header_slice.payload_length() as usize, tcp_header_slice, tcp_payload)?;
        let mut packet = PacketView::new(SegmentHeader::from(tcp_header_slice), payload, Direction::FromClient)
            .with_addresses(
                IpAddr::V6(ipv6_header_slice.source_addr()),
                IpAddr::V6(ipv6_header_slice.destination_addr()),
            )
            .with_time(time_secs);
        Ok(self.handle_packet(logging_channel_id, &mut packet, observer))
    }

    /// Decode entry point for a raw IP packet.
    pub fn handle_ip_packet(
        &mut self,
        logging_channel_id: Option<u16>,
        ip_packet: &[u8],
        time_secs: u32,
        observer: &mut dyn StreamObserver,
    ) -> Result<Action, PacketError> {
        let Some(first) = ip_packet.first() else {
            return Err(PacketError::Header("empty packet".to_string()));
        };
        match first >> 4 {
            4 => {
                let ipv4_header_slice = Ipv4HeaderSlice::from_slice(ip_packet).map_err(|error| PacketError::Header(error.to_string()))?;
                let protocol = ipv4_header_slice.protocol();
                if protocol != IpNumber::TCP {
                    return Err(PacketError::NotTcp(protocol.0));
                }
                let tcp_bytes = &ip_packet[ipv4_header_slice.slice().len()..];
                let tcp_header_slice = TcpHeaderSlice::from_slice(tcp_bytes).map_err(|error| PacketError::Header(error.to_string()))?;
                let tcp_payload = &tcp_bytes[tcp_header_slice.slice().len()..];
                self.handle_segment(logging_channel_id, &ipv4_header_slice, &tcp_header_slice, tcp_payload, time_secs, observer)
            }
            6 => {
                let ipv6_header_slice = Ipv6HeaderSlice::from_slice(ip_packet).map_err(|error| PacketError::Header(error.to_string()))?;
                let next_header = ipv6_header_slice.next_header();
                if next_header != IpNumber::TCP {
                    return Err(PacketError::NotTcp(next_header.0));
                }
                let tcp_bytes = &ip_packet[ipv6_header_slice.slice().len()..];
                let tcp_header_slice = TcpHeaderSlice::from_slice(tcp_bytes).map_err(|error| PacketError::Header(error.to_string()))?;
                let tcp_payload = &tcp_bytes[tcp_header_slice.slice().len()..];
                self.handle_segment_v6(logging_channel_id, &ipv6_header_slice, &tcp_header_slice, tcp_payload, time_secs, observer)
            }
            version => Err(PacketError::UnsupportedIpVersion(version)),
        }
    }

    /// Release sessions idle past their timeout, delivering what they still hold.
    pub fn expire_idle(&mut self, now: u32, observer: &mut dyn StreamObserver) -> usize {
        let before = self.flows.len();
        let mut ctx = StreamContext {
            config: &self.config,
            stats: &mut self.stats,
            observer,
        };
        self.flows.retain(|_, flow| {
            if !flow.session.is_expired(now) {
                return true;
            }
            trace!("[{}]: idle timeout", &ctx.config.trace_connections, flow.session.connection_id());
            flow.session.cleanup(&mut ctx);
            ctx.stats.timeouts += 1;
            false
        });
        before - self.flows.len()
    }

    /// * Drain all sessions, holes are reported as packet loss.
    /// * Must be called at shutdown or at the end of a capture, after the last packet was handled.
    pub fn flush_all(&mut self, observer: &mut dyn StreamObserver) {
        let mut ctx = StreamContext {
            config: &self.config,
            stats: &mut self.stats,
            observer,
        };
        for (_, mut flow) in self.flows.drain(..) {
            flow.session.cleanup(&mut ctx);
        }
    }
}

/// TCP payload declared by the IP header, without link layer padding.
fn segment_payload<'p>(ip_payload_len: usize, tcp_header_slice: &TcpHeaderSlice, tcp_payload: &'p [u8]) -> Result<&'p [u8], PacketError> {
    let tcp_header_len = tcp_header_slice.slice().len();
    let Some(declared) = ip_payload_len.checked_sub(tcp_header_len) else {
        return Err(PacketError::IpPayloadLength(format!(
            "{ip_payload_len} bytes cannot hold a {tcp_header_len} bytes TCP header"
        )));
    };
    if tcp_payload.len() < declared {
        return Err(PacketError::Truncated {
            declared,
            captured: tcp_payload.len(),
        });
    }
    Ok(&tcp_payload[..declared])
}
