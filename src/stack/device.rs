//! Ring-buffer smoltcp device plus the header parsing the engine needs to
//! admit new flows. The device is owned by the engine and only touched under
//! the stack lock, so the rings need no locking of their own.

use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const MAX_EMIT_BATCH: usize = 64;

/// Detailed error information for packet parsing failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty packet")]
    EmptyPacket,
    #[error("unsupported IP version {0}")]
    UnsupportedIpVersion(u8),
    #[error("malformed IPv4 header")]
    MalformedIpv4Header,
    #[error("malformed IPv6 header")]
    MalformedIpv6Header,
    #[error("malformed TCP segment")]
    MalformedTcpSegment,
}

#[derive(Debug, Clone)]
pub enum ParsedPacket<'a> {
    Tcp(TcpPacket<'a>),
    /// Valid IP, but not TCP.
    Other,
}

#[derive(Debug, Clone)]
pub struct TcpPacket<'a> {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub flags: TcpFlags,
    pub payload: &'a [u8],
}

impl TcpPacket<'_> {
    /// Opening segment of a new connection.
    pub fn is_initial_syn(&self) -> bool {
        self.flags.syn && !self.flags.ack && !self.flags.rst
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

pub struct TunDevice {
    inbound: VecDeque<Vec<u8>>,
    outbound: VecDeque<Vec<u8>>,
    capacity: usize,
    mtu: usize,
}

impl TunDevice {
    pub fn new(mtu: usize, ring_capacity: usize) -> Self {
        let capacity = ring_capacity.max(16);
        Self {
            inbound: VecDeque::with_capacity(capacity),
            outbound: VecDeque::with_capacity(capacity),
            capacity,
            mtu: mtu.max(576),
        }
    }

    /// Queues a copy of `packet` for the next poll, evicting the oldest
    /// packet when the ring is full. Empty packets and packets larger than
    /// the MTU are rejected.
    pub fn push_inbound(&mut self, packet: &[u8]) -> bool {
        if packet.is_empty() || packet.len() > self.mtu {
            return false;
        }
        if self.inbound.len() >= self.capacity {
            self.inbound.pop_front();
        }
        self.inbound.push_back(packet.to_vec());
        true
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Drains up to `MAX_EMIT_BATCH` outbound frames.
    pub fn drain_outbound(&mut self) -> Vec<Vec<u8>> {
        let drain_count = MAX_EMIT_BATCH.min(self.outbound.len());
        self.outbound.drain(..drain_count).collect()
    }

    pub fn inbound_queue_len(&self) -> usize {
        self.inbound.len()
    }

    pub fn outbound_queue_len(&self) -> usize {
        self.outbound.len()
    }
}

impl Device for TunDevice {
    type RxToken<'a>
        = TunRxToken
    where
        Self: 'a;
    type TxToken<'a>
        = TunTxToken<'a>
    where
        Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let packet = self.inbound.pop_front()?;
        let rx = TunRxToken { buffer: packet };
        let tx = TunTxToken {
            outbound: &mut self.outbound,
            mtu: self.mtu,
            capacity: self.capacity,
        };
        Some((rx, tx))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(TunTxToken {
            outbound: &mut self.outbound,
            mtu: self.mtu,
            capacity: self.capacity,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.max_transmission_unit = self.mtu;
        caps.medium = Medium::Ip;
        caps
    }
}

pub struct TunRxToken {
    buffer: Vec<u8>,
}

pub struct TunTxToken<'a> {
    outbound: &'a mut VecDeque<Vec<u8>>,
    mtu: usize,
    capacity: usize,
}

impl RxToken for TunRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = self.buffer;
        f(&mut buffer)
    }
}

impl TxToken for TunTxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut frame = vec![0u8; len.min(self.mtu)];
        let result = f(&mut frame);
        if self.outbound.len() >= self.capacity {
            self.outbound.pop_front();
        }
        self.outbound.push_back(frame);
        result
    }
}

pub fn parse_packet(packet: &[u8]) -> Result<ParsedPacket<'_>, ParseError> {
    if packet.is_empty() {
        return Err(ParseError::EmptyPacket);
    }
    let version = packet[0] >> 4;
    match version {
        4 => parse_ipv4(packet),
        6 => parse_ipv6(packet),
        _ => Err(ParseError::UnsupportedIpVersion(version)),
    }
}

fn parse_ipv4(packet: &[u8]) -> Result<ParsedPacket<'_>, ParseError> {
    if packet.len() < 20 {
        return Err(ParseError::MalformedIpv4Header);
    }
    let header_len = usize::from(packet[0] & 0x0F) * 4;
    if header_len < 20 || header_len > packet.len() {
        return Err(ParseError::MalformedIpv4Header);
    }
    let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    if total_len < header_len || total_len > packet.len() {
        return Err(ParseError::MalformedIpv4Header);
    }
    let src = IpAddr::V4(Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]));
    let dst = IpAddr::V4(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]));
    match packet[9] {
        6 => parse_tcp(src, dst, &packet[header_len..total_len]),
        _ => Ok(ParsedPacket::Other),
    }
}

fn parse_ipv6(packet: &[u8]) -> Result<ParsedPacket<'_>, ParseError> {
    if packet.len() < 40 {
        return Err(ParseError::MalformedIpv6Header);
    }
    let payload_len = u16::from_be_bytes([packet[4], packet[5]]) as usize;
    if 40 + payload_len > packet.len() {
        return Err(ParseError::MalformedIpv6Header);
    }
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&packet[8..24]);
    dst.copy_from_slice(&packet[24..40]);
    match packet[6] {
        6 => parse_tcp(
            IpAddr::V6(Ipv6Addr::from(src)),
            IpAddr::V6(Ipv6Addr::from(dst)),
            &packet[40..40 + payload_len],
        ),
        _ => Ok(ParsedPacket::Other),
    }
}

fn parse_tcp(src: IpAddr, dst: IpAddr, segment: &[u8]) -> Result<ParsedPacket<'_>, ParseError> {
    if segment.len() < 20 {
        return Err(ParseError::MalformedTcpSegment);
    }
    let data_offset = usize::from(segment[12] >> 4) * 4;
    if data_offset < 20 || data_offset > segment.len() {
        return Err(ParseError::MalformedTcpSegment);
    }
    let flags_byte = segment[13];
    Ok(ParsedPacket::Tcp(TcpPacket {
        src,
        dst,
        src_port: u16::from_be_bytes([segment[0], segment[1]]),
        dst_port: u16::from_be_bytes([segment[2], segment[3]]),
        seq_number: u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]),
        ack_number: u32::from_be_bytes([segment[8], segment[9], segment[10], segment[11]]),
        flags: TcpFlags {
            syn: flags_byte & 0x02 != 0,
            ack: flags_byte & 0x10 != 0,
            fin: flags_byte & 0x01 != 0,
            rst: flags_byte & 0x04 != 0,
        },
        payload: &segment[data_offset..],
    }))
}
