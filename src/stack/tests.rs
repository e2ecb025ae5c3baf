use super::device::{parse_packet, ParsedPacket, TcpPacket};
use super::smol::SmolStack;
use super::*;
use crate::config::BridgeConfig;
use std::net::SocketAddrV4;
use std::time::Duration;
use tokio::sync::Notify;

const SYN: u8 = 0x02;
const RST: u8 = 0x04;
const PSH: u8 = 0x08;
const ACK: u8 = 0x10;
const FIN: u8 = 0x01;

fn client() -> SocketAddrV4 {
    "10.0.0.2:40000".parse().expect("valid address")
}

fn target() -> SocketAddrV4 {
    "203.0.113.7:443".parse().expect("valid address")
}

fn ones_complement(bytes: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = bytes.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let Some(&byte) = chunks.remainder().first() {
        sum += u32::from(byte) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Builds an IPv4 TCP segment with valid checksums.
fn segment(src: SocketAddrV4, dst: SocketAddrV4, seq: u32, ack: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut tcp = vec![0u8; 20];
    tcp[0..2].copy_from_slice(&src.port().to_be_bytes());
    tcp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&ack.to_be_bytes());
    tcp[12] = 5 << 4;
    tcp[13] = flags;
    tcp[14..16].copy_from_slice(&u16::MAX.to_be_bytes());
    tcp.extend_from_slice(payload);

    let mut pseudo = Vec::with_capacity(12 + tcp.len());
    pseudo.extend_from_slice(&src.ip().octets());
    pseudo.extend_from_slice(&dst.ip().octets());
    pseudo.extend_from_slice(&[0, 6]);
    pseudo.extend_from_slice(&(tcp.len() as u16).to_be_bytes());
    pseudo.extend_from_slice(&tcp);
    let checksum = ones_complement(&pseudo);
    tcp[16..18].copy_from_slice(&checksum.to_be_bytes());

    let total_len = 20 + tcp.len();
    let mut packet = vec![0u8; 20];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    packet[5] = 0x01;
    packet[6] = 0x40;
    packet[8] = 64;
    packet[9] = 6;
    packet[12..16].copy_from_slice(&src.ip().octets());
    packet[16..20].copy_from_slice(&dst.ip().octets());
    let header_checksum = ones_complement(&packet);
    packet[10..12].copy_from_slice(&header_checksum.to_be_bytes());
    packet.extend_from_slice(&tcp);
    packet
}

fn tcp_of(frame: &Frame) -> TcpPacket<'_> {
    match parse_packet(&frame.packet).expect("parsable frame") {
        ParsedPacket::Tcp(tcp) => tcp,
        ParsedPacket::Other => panic!("expected TCP frame"),
    }
}

fn new_stack(config: BridgeConfig) -> SmolStack {
    SmolStack::new(&config, Arc::new(Notify::new()))
}

struct Handshake {
    pcb: PcbHandle,
    /// Next sequence number the client sends.
    client_seq: u32,
    /// Next sequence number expected from the stack.
    server_seq: u32,
}

fn handshake(stack: &mut SmolStack, now: Instant) -> Handshake {
    assert!(stack.input(&segment(client(), target(), 1000, 0, SYN, &[])));
    assert!(stack.poll(now).is_empty());

    let frames = stack.drain_outbound();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].protocol, AF_INET as u32);
    let syn_ack = tcp_of(&frames[0]);
    assert!(syn_ack.flags.syn && syn_ack.flags.ack);
    assert_eq!(syn_ack.ack_number, 1001);
    let server_seq = syn_ack.seq_number.wrapping_add(1);

    assert!(stack.input(&segment(client(), target(), 1001, server_seq, ACK, &[])));
    let events = stack.poll(now);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, StackEventKind::Accepted);
    Handshake {
        pcb: events[0].pcb,
        client_seq: 1001,
        server_seq,
    }
}

#[test]
fn completed_handshake_is_reported_once() {
    let mut stack = new_stack(BridgeConfig::default());
    let now = Instant::now();
    let flow = handshake(&mut stack, now);

    assert_eq!(
        stack.endpoints(flow.pcb),
        Some((SocketAddr::V4(target()), SocketAddr::V4(client())))
    );
    assert_eq!(stack.flow_count(), 1);
    assert!(stack.poll(now).is_empty());
}

#[test]
fn attached_flow_reports_data_acks_and_fin() {
    let mut stack = new_stack(BridgeConfig::default());
    let now = Instant::now();
    let flow = handshake(&mut stack, now);
    stack.set_arg(flow.pcb, Some(ConnKey::new(7)));
    stack.set_callbacks(flow.pcb, CallbackSet::ALL, 8);

    let hello = segment(client(), target(), flow.client_seq, flow.server_seq, PSH | ACK, b"hello");
    assert!(stack.input(&hello));
    let events = stack.poll(now);
    assert_eq!(
        events.into_iter().map(|event| event.kind).collect::<Vec<_>>(),
        vec![StackEventKind::Received(b"hello".to_vec())]
    );
    stack.recved(flow.pcb, 5);
    assert_eq!(stack.consumed(flow.pcb), 5);

    stack.write(flow.pcb, b"world").expect("queued");
    assert_eq!(stack.pending_send(flow.pcb), 5);
    stack.poll(now);
    let sent = stack.drain_outbound();
    assert!(sent.iter().any(|frame| tcp_of(frame).payload == b"world"));

    let client_seq = flow.client_seq + 5;
    let ack = segment(client(), target(), client_seq, flow.server_seq + 5, ACK, &[]);
    assert!(stack.input(&ack));
    let events = stack.poll(now);
    assert!(events.contains(&StackEvent::new(flow.pcb, StackEventKind::Sent(5))));
    assert_eq!(stack.pending_send(flow.pcb), 0);

    let fin = segment(client(), target(), client_seq, flow.server_seq + 5, FIN | ACK, &[]);
    assert!(stack.input(&fin));
    let events = stack.poll(now);
    assert!(events.contains(&StackEvent::new(flow.pcb, StackEventKind::RemoteClosed)));
    assert!(stack.poll(now).is_empty());
}

#[test]
fn unconsumed_payload_is_offered_again() {
    let mut stack = new_stack(BridgeConfig::default());
    let now = Instant::now();
    let flow = handshake(&mut stack, now);
    stack.set_arg(flow.pcb, Some(ConnKey::new(7)));
    stack.set_callbacks(flow.pcb, CallbackSet::ALL, 8);

    let hello = segment(client(), target(), flow.client_seq, flow.server_seq, PSH | ACK, b"hello");
    assert!(stack.input(&hello));
    let received = StackEvent::new(flow.pcb, StackEventKind::Received(b"hello".to_vec()));
    assert_eq!(stack.poll(now).to_vec(), vec![received.clone()]);

    // Nothing was consumed, so the same bytes come back.
    for _ in 0..3 {
        assert_eq!(stack.poll(now).to_vec(), vec![received.clone()]);
    }

    stack.recved(flow.pcb, 5);
    assert!(stack.poll(now).is_empty());
    assert_eq!(stack.consumed(flow.pcb), 5);
}

#[test]
fn fin_is_reported_after_payload_is_consumed() {
    let mut stack = new_stack(BridgeConfig::default());
    let now = Instant::now();
    let flow = handshake(&mut stack, now);
    stack.set_arg(flow.pcb, Some(ConnKey::new(7)));
    stack.set_callbacks(flow.pcb, CallbackSet::ALL, 8);

    let bye = segment(
        client(),
        target(),
        flow.client_seq,
        flow.server_seq,
        FIN | PSH | ACK,
        b"bye",
    );
    assert!(stack.input(&bye));
    assert_eq!(
        stack.poll(now).into_iter().map(|event| event.kind).collect::<Vec<_>>(),
        vec![StackEventKind::Received(b"bye".to_vec())]
    );

    stack.recved(flow.pcb, 3);
    assert_eq!(
        stack.poll(now).into_iter().map(|event| event.kind).collect::<Vec<_>>(),
        vec![StackEventKind::RemoteClosed]
    );
}

#[test]
fn reset_reports_error_and_frees_handle() {
    let mut stack = new_stack(BridgeConfig::default());
    let now = Instant::now();
    let flow = handshake(&mut stack, now);
    stack.set_arg(flow.pcb, Some(ConnKey::new(9)));
    stack.set_callbacks(flow.pcb, CallbackSet::ALL, 8);

    let rst = segment(client(), target(), flow.client_seq, flow.server_seq, RST | ACK, &[]);
    assert!(stack.input(&rst));
    let events = stack.poll(now);

    assert_eq!(
        events.into_iter().map(|event| event.kind).collect::<Vec<_>>(),
        vec![StackEventKind::Error {
            arg: ConnKey::new(9),
            err: EngineError::Reset
        }]
    );
    assert_eq!(stack.endpoints(flow.pcb), None);
    assert_eq!(stack.write(flow.pcb, b"x"), Err(EngineError::Closed));
    assert_eq!(stack.flow_count(), 0);
    assert_eq!(stack.counters().reclaimed, 1);
}

#[test]
fn poll_event_follows_interval() {
    let mut stack = new_stack(BridgeConfig::default());
    let now = Instant::now();
    let flow = handshake(&mut stack, now);
    stack.set_callbacks(flow.pcb, CallbackSet::POLL, 1);

    assert!(stack.poll(now + Duration::from_millis(100)).is_empty());
    let events = stack.poll(now + Duration::from_millis(600));
    assert_eq!(events.len(), 1);
    assert_eq!(events[0], StackEvent::new(flow.pcb, StackEventKind::Poll));
}

#[test]
fn aborted_handle_is_dead_immediately() {
    let mut stack = new_stack(BridgeConfig::default());
    let now = Instant::now();
    let flow = handshake(&mut stack, now);
    stack.set_callbacks(flow.pcb, CallbackSet::ALL, 8);

    stack.abort(flow.pcb);
    assert_eq!(stack.arg(flow.pcb), None);
    assert_eq!(stack.send_buffer(flow.pcb), 0);
    assert_eq!(stack.close(flow.pcb), Err(EngineError::Closed));

    stack.poll(now);
    let frames = stack.drain_outbound();
    assert!(frames.iter().any(|frame| tcp_of(frame).flags.rst));
    assert_eq!(stack.flow_count(), 0);
}

#[test]
fn admission_fails_when_pool_is_exhausted() {
    let mut stack = new_stack(BridgeConfig {
        tcp_socket_count: 1,
        ..BridgeConfig::default()
    });
    let other: SocketAddrV4 = "10.0.0.3:40001".parse().expect("valid address");

    assert!(stack.input(&segment(client(), target(), 1, 0, SYN, &[])));
    assert!(!stack.input(&segment(other, target(), 1, 0, SYN, &[])));
    assert_eq!(stack.counters().admitted, 1);
    assert_eq!(stack.counters().admission_failures, 1);
}

#[test]
fn stale_listener_is_reclaimed() {
    let mut stack = new_stack(BridgeConfig {
        listen_timeout_ms: 500,
        ..BridgeConfig::default()
    });
    let now = Instant::now();
    assert!(stack.input(&segment(client(), target(), 1000, 0, SYN, &[])));
    stack.poll(now);
    assert_eq!(stack.flow_count(), 1);

    stack.poll(now + Duration::from_secs(1));
    assert_eq!(stack.flow_count(), 0);
    assert_eq!(stack.counters().reclaimed, 1);
}

#[test]
fn malformed_packets_are_counted_and_dropped() {
    let mut stack = new_stack(BridgeConfig::default());
    assert!(!stack.input(&[0x45, 0x00]));
    assert!(!stack.input(&[]));
    assert_eq!(stack.counters().invalid_packets, 2);
}

#[test]
fn packet_above_mtu_is_dropped_whole() {
    let mut stack = new_stack(BridgeConfig::default());
    let oversized = segment(client(), target(), 1000, 0, SYN, &[0u8; 1300]);
    assert!(oversized.len() > BridgeConfig::default().mtu);

    assert!(!stack.input(&oversized));
    assert_eq!(stack.counters().invalid_packets, 1);
    assert_eq!(stack.flow_count(), 0);
    assert!(stack.poll(Instant::now()).is_empty());
    assert!(stack.drain_outbound().is_empty());
}

#[test]
fn frames_are_tagged_with_address_family() {
    assert_eq!(Frame::new(vec![0x45, 0]).protocol, AF_INET as u32);
    assert_eq!(Frame::new(vec![0x60, 0]).protocol, AF_INET6 as u32);
}

#[test]
fn engine_codes_match_lwip() {
    assert_eq!(EngineError::OutOfMemory.code(), -1);
    assert_eq!(EngineError::Reset.code(), -14);
    assert!(EngineError::OutOfMemory.is_retryable());
    assert!(!EngineError::Closed.is_retryable());
}
