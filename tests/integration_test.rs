/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */
use std::net::{IpAddr, Ipv4Addr};

use etherparse::{TcpHeader, TcpHeaderSlice, TcpOptionElement};
// Seeded, the shuffle is the same on every run
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

use stream_tcp::{
    Action, Direction, FlushData, PacketStatus, PacketView, SegmentHeader, SessionEvent, StreamObserver, StreamTcp, StreamTcpConfig,
    TcpConnection, TcpEvent, TcpState,
};

const CLIENT: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
const SERVER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 2);
const CLIENT_PORT: u16 = 40000;
const SERVER_PORT: u16 = 80;
const CLIENT_ISN: u32 = 1000;
const SERVER_ISN: u32 = 9000;

const FIN: u8 = 0x01;
const SYN: u8 = 0x02;
const RST: u8 = 0x04;
const PSH: u8 = 0x08;
const ACK: u8 = 0x10;

#[derive(Default)]
struct Capture {
    to_server: Vec<u8>,
    to_client: Vec<u8>,
    losses: Vec<(Direction, u32, u32)>,
    alerts: Vec<TcpEvent>,
    events: Vec<SessionEvent>,
}

impl StreamObserver for Capture {
    fn flush(&mut self, data: FlushData<'_>) -> usize {
        match data.direction {
            Direction::FromClient => self.to_server.extend_from_slice(data.data),
            Direction::FromServer => self.to_client.extend_from_slice(data.data),
        }
        data.data.len()
    }

    fn packet_loss(&mut self, _connection_id: u32, direction: Direction, seq: u32, lost_bytes: u32) {
        self.losses.push((direction, seq, lost_bytes));
    }

    fn session_event(&mut self, _connection_id: u32, _connection: &TcpConnection, event: SessionEvent) {
        self.events.push(event);
    }

    fn alert(&mut self, _connection_id: u32, event: TcpEvent) {
        self.alerts.push(event);
    }
}

fn tcp_header_buf(source_port: u16, destination_port: u16, seq: u32, ack: u32, flags: u8, tcp_payload: &[u8]) -> Vec<u8> {
    let mut tcp_header = TcpHeader::new(source_port, destination_port, seq, 65535);
    tcp_header.fin = flags & FIN != 0;
    tcp_header.syn = flags & SYN != 0;
    tcp_header.rst = flags & RST != 0;
    tcp_header.psh = flags & PSH != 0;
    tcp_header.ack = flags & ACK != 0;
    tcp_header.acknowledgment_number = ack;
    if tcp_header.syn {
        tcp_header.set_options(&[TcpOptionElement::MaximumSegmentSize(1460)]).unwrap();
    }
    let mut tcp_header_buf = Vec::new();
    tcp_header.write(&mut tcp_header_buf).unwrap();
    tcp_header_buf.extend_from_slice(tcp_payload);
    tcp_header_buf
}

struct Wire {
    stream_tcp: StreamTcp,
    capture: Capture,
    time_secs: u32,
}

impl Wire {
    fn new(config: StreamTcpConfig) -> Self {
        Self {
            stream_tcp: StreamTcp::new(config),
            capture: Capture::default(),
            time_secs: 1,
        }
    }

    fn send(&mut self, from_client: bool, seq: u32, ack: u32, flags: u8, tcp_payload: &[u8]) -> (Action, PacketStatus) {
        let (source, destination, source_port, destination_port) = if from_client {
            (CLIENT, SERVER, CLIENT_PORT, SERVER_PORT)
        } else {
            (SERVER, CLIENT, SERVER_PORT, CLIENT_PORT)
        };
        let tcp_header_buf = tcp_header_buf(source_port, destination_port, seq, ack, flags, tcp_payload);
        let tcp_header_slice = TcpHeaderSlice::from_slice(&tcp_header_buf).unwrap();
        let payload = &tcp_header_buf[tcp_header_slice.slice().len()..];
        let mut packet = PacketView::new(SegmentHeader::from(&tcp_header_slice), payload, Direction::FromClient)
            .with_addresses(IpAddr::V4(source), IpAddr::V4(destination))
            .with_time(self.time_secs);
        let action = self.stream_tcp.handle_packet(None, &mut packet, &mut self.capture);
        (action, packet.status)
    }

    fn client(&mut self, seq: u32, ack: u32, flags: u8, tcp_payload: &[u8]) -> (Action, PacketStatus) {
        self.send(true, seq, ack, flags, tcp_payload)
    }

    fn server(&mut self, seq: u32, ack: u32, flags: u8, tcp_payload: &[u8]) -> (Action, PacketStatus) {
        self.send(false, seq, ack, flags, tcp_payload)
    }

    fn handshake(&mut self) {
        self.client(CLIENT_ISN, 0, SYN, b"");
        self.server(SERVER_ISN, CLIENT_ISN + 1, SYN | ACK, b"");
        let (_, status) = self.client(CLIENT_ISN + 1, SERVER_ISN + 1, ACK, b"");
        assert!(status.contains(PacketStatus::STREAM_TWH));
    }

    fn connection() -> TcpConnection {
        TcpConnection::new(IpAddr::V4(CLIENT), CLIENT_PORT, IpAddr::V4(SERVER), SERVER_PORT)
    }
}

fn require_3whs() -> StreamTcpConfig {
    StreamTcpConfig {
        require_3whs: Some(3600),
        ..Default::default()
    }
}

#[test]
fn test_request_response() {
    let mut wire = Wire::new(require_3whs());
    wire.handshake();

    let request = b"GET / HTTP/1.1\r\nHost: example\r\n\r\n";
    let response = b"HTTP/1.1 204 No Content\r\n\r\n";
    let client_seq = CLIENT_ISN + 1;
    let server_seq = SERVER_ISN + 1;
    let client_next = client_seq + request.len() as u32;
    let server_next = server_seq + response.len() as u32;

    wire.client(client_seq, server_seq, PSH | ACK, request);
    assert!(wire.capture.to_server.is_empty());
    wire.server(server_seq, client_next, PSH | ACK, response);
    assert_eq!(wire.capture.to_server, request);
    wire.client(client_next, server_next, ACK, b"");
    assert_eq!(wire.capture.to_client, response);

    let session = wire.stream_tcp.session(&Wire::connection()).unwrap();
    assert_eq!(session.client.state, TcpState::Established);
    assert_eq!(session.server.state, TcpState::Established);
    assert_eq!(session.client.mss, 1460);
    assert_eq!(wire.capture.events, vec![SessionEvent::Established]);
    assert!(wire.capture.alerts.is_empty());
    assert_eq!(wire.stream_tcp.stats.sessions, 1);
    assert_eq!(wire.stream_tcp.stats.sessions_on_syn, 1);
    assert_eq!(wire.stream_tcp.stats.rebuilt_bytes, (request.len() + response.len()) as u64);
}

#[test]
fn test_syn_ack_with_bad_ack_is_rejected() {
    let mut wire = Wire::new(require_3whs());
    wire.client(CLIENT_ISN, 0, SYN, b"");
    let (action, _) = wire.server(SERVER_ISN, CLIENT_ISN + 100, SYN | ACK, b"");
    assert!(action.contains(Action::BAD_PKT));
    assert_eq!(wire.stream_tcp.stats.discards, 1);

    let session = wire.stream_tcp.session(&Wire::connection()).unwrap();
    assert_eq!(session.client.state, TcpState::SynSent);
    assert_eq!(session.server.state, TcpState::Listen);
    assert!(wire.capture.events.is_empty());
}

#[test]
fn test_midstream_pickup() {
    let mut wire = Wire::new(StreamTcpConfig::default());
    let (_, status) = wire.client(5000, 7000, PSH | ACK, b"hello");
    assert!(status.contains(PacketStatus::STREAM_UNESTABLISHED));
    assert!(wire.capture.events.is_empty());

    let (_, status) = wire.server(7000, 5005, ACK, b"");
    assert!(status.contains(PacketStatus::STREAM_ESTABLISHED));
    assert_eq!(wire.capture.events, vec![SessionEvent::Established]);
    assert_eq!(wire.capture.to_server, b"hello");
    assert_eq!(wire.stream_tcp.stats.sessions_on_data, 1);

    // the higher port is taken for the client
    let session = wire.stream_tcp.session(&Wire::connection()).unwrap();
    assert_eq!(session.connection().client_port, CLIENT_PORT);
    assert!(session.ssn.is_midstream());
}

#[test]
fn test_no_pickup_without_handshake() {
    let config = StreamTcpConfig {
        require_3whs: Some(0),
        ..Default::default()
    };
    let mut wire = Wire::new(config);
    for seq in [5000, 5005, 5010] {
        let (action, _) = wire.client(seq, 7000, PSH | ACK, b"hello");
        assert!(action.is_empty());
    }
    assert_eq!(wire.capture.alerts, vec![TcpEvent::No3WayHandshake]);
    assert!(wire.capture.to_server.is_empty());
    assert_eq!(wire.stream_tcp.stats.sessions_on_data, 0);
}

#[test]
fn test_fin_teardown() {
    let mut wire = Wire::new(require_3whs());
    wire.handshake();
    let client_seq = CLIENT_ISN + 1;
    let server_seq = SERVER_ISN + 1;

    wire.client(client_seq, server_seq, PSH | ACK, b"bye");
    wire.client(client_seq + 3, server_seq, FIN | ACK, b"");
    {
        let session = wire.stream_tcp.session(&Wire::connection()).unwrap();
        assert_eq!(session.client.state, TcpState::FinWait1);
        assert_eq!(session.server.state, TcpState::Established);
    }

    // acks the data but not the FIN, nothing commits
    wire.server(server_seq, client_seq + 3, ACK, b"");
    assert_eq!(wire.stream_tcp.session(&Wire::connection()).unwrap().server.state, TcpState::Established);
    assert_eq!(wire.capture.to_server, b"bye");

    // an ack beyond the FIN does not commit either
    wire.server(server_seq, client_seq + 1000, ACK, b"");
    assert_eq!(wire.stream_tcp.session(&Wire::connection()).unwrap().server.state, TcpState::Established);

    wire.server(server_seq, client_seq + 4, ACK, b"");
    {
        let session = wire.stream_tcp.session(&Wire::connection()).unwrap();
        assert_eq!(session.server.state, TcpState::CloseWait);
        assert_eq!(session.client.state, TcpState::FinWait2);
    }

    wire.server(server_seq, client_seq + 4, FIN | ACK, b"");
    assert_eq!(wire.stream_tcp.session(&Wire::connection()).unwrap().server.state, TcpState::LastAck);

    let (action, _) = wire.client(client_seq + 4, server_seq + 1, ACK, b"");
    assert!(action.contains(Action::LWSSN_CLOSED));
    assert_eq!(wire.stream_tcp.flow_count(), 0);
    assert_eq!(wire.capture.events, vec![SessionEvent::Established, SessionEvent::Closed]);
    assert_eq!(wire.stream_tcp.stats.trackers_released, 1);
}

#[test]
fn test_rst_outside_window_is_ignored() {
    let mut wire = Wire::new(require_3whs());
    wire.handshake();

    let (action, _) = wire.server(SERVER_ISN + 200_000, 0, RST, b"");
    assert!(!action.contains(Action::RST));
    assert_eq!(wire.capture.alerts, vec![TcpEvent::BadRst]);
    assert_eq!(wire.stream_tcp.session(&Wire::connection()).unwrap().server.state, TcpState::Established);

    let (action, _) = wire.server(SERVER_ISN + 1, 0, RST, b"");
    assert!(action.contains(Action::RST));
    assert_eq!(wire.capture.events.last(), Some(&SessionEvent::Reset));
    assert_eq!(wire.stream_tcp.session(&Wire::connection()).unwrap().server.state, TcpState::Closed);
}

#[test]
fn test_shuffled_delivery() {
    const SEGMENT_SIZE: usize = 100;
    const AMOUNT_OF_SEGMENTS: usize = 40;

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let payload: Vec<u8> = (0..SEGMENT_SIZE * AMOUNT_OF_SEGMENTS).map(|_| rng.gen::<u8>()).collect();
    let mut order: Vec<usize> = (0..AMOUNT_OF_SEGMENTS).collect();
    order.shuffle(&mut rng);

    let mut wire = Wire::new(require_3whs());
    wire.handshake();
    let client_seq = CLIENT_ISN + 1;
    let server_seq = SERVER_ISN + 1;
    for index in order {
        let offset = index * SEGMENT_SIZE;
        wire.client(client_seq + offset as u32, server_seq, ACK, &payload[offset..offset + SEGMENT_SIZE]);
    }
    assert!(wire.capture.to_server.is_empty());

    wire.server(server_seq, client_seq + payload.len() as u32, ACK, b"");
    assert_eq!(wire.capture.to_server, payload);
    assert!(wire.capture.losses.is_empty());
}

#[test]
fn test_acked_hole_is_reported() {
    let mut wire = Wire::new(require_3whs());
    wire.handshake();
    let client_seq = CLIENT_ISN + 1;
    let server_seq = SERVER_ISN + 1;

    wire.client(client_seq, server_seq, ACK, b"aaaa");
    wire.client(client_seq + 8, server_seq, ACK, b"cccc");
    wire.server(server_seq, client_seq + 12, ACK, b"");

    assert_eq!(wire.capture.to_server, b"aaaacccc");
    assert_eq!(wire.capture.losses, vec![(Direction::FromClient, client_seq + 4, 4)]);
    assert_eq!(wire.stream_tcp.stats.gaps, 1);
}

#[test]
fn test_flush_all_drains_queued_data() {
    let mut wire = Wire::new(require_3whs());
    wire.handshake();
    wire.client(CLIENT_ISN + 1, SERVER_ISN + 1, PSH | ACK, b"pending");
    assert!(wire.capture.to_server.is_empty());

    wire.stream_tcp.flush_all(&mut wire.capture);
    assert_eq!(wire.capture.to_server, b"pending");
    assert_eq!(wire.stream_tcp.flow_count(), 0);
    assert_eq!(wire.capture.events.last(), Some(&SessionEvent::Closed));
}

fn ipv4_packet(protocol: u8, tcp_segment: &[u8]) -> Vec<u8> {
    let total_len = (20 + tcp_segment.len()) as u16;
    let mut ip_packet = vec![0x45, 0, (total_len >> 8) as u8, total_len as u8, 0, 0, 0x40, 0, 64, protocol, 0, 0];
    ip_packet.extend_from_slice(&CLIENT.octets());
    ip_packet.extend_from_slice(&SERVER.octets());
    ip_packet.extend_from_slice(tcp_segment);
    ip_packet
}

#[test]
fn test_raw_ipv4_packet() {
    let mut stream_tcp = StreamTcp::new(require_3whs());
    let mut capture = Capture::default();

    let syn = ipv4_packet(6, &tcp_header_buf(CLIENT_PORT, SERVER_PORT, CLIENT_ISN, 0, SYN, b""));
    let action = stream_tcp.handle_ip_packet(None, &syn, 1, &mut capture).unwrap();
    assert!(action.is_empty());
    let session = stream_tcp.session(&Wire::connection()).unwrap();
    assert_eq!(session.client.state, TcpState::SynSent);
    assert_eq!(session.client.isn, CLIENT_ISN);

    let udp = ipv4_packet(17, &[0; 8]);
    assert!(stream_tcp.handle_ip_packet(None, &udp, 1, &mut capture).is_err());
    assert_eq!(stream_tcp.flow_count(), 1);
}
