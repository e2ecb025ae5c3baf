//! `NativeStack` on smoltcp.
//!
//! A fixed pool of TCP sockets is created up front. An opening SYN for an
//! unknown 4-tuple takes a socket from the pool and listens on the flow's
//! destination, so smoltcp completes the handshake as if it owned that
//! address. Callback-style events are derived after every interface poll by
//! comparing each socket with what was last reported.

use super::device::{parse_packet, ParsedPacket, TunDevice};
use super::{
    CallbackSet, EngineError, Frame, NativeStack, PcbHandle, StackEvent, StackEventKind,
    StackEvents,
};
use crate::config::{BridgeConfig, SLOW_TIMER_INTERVAL};
use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use crate::registry::ConnKey;
use rustc_hash::FxHashMap;
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer as TcpSocketBuffer, State as TcpState};
use smoltcp::time::Instant as SmoltInstant;
use smoltcp::wire::{
    HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint, Ipv4Address, Ipv6Address,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SmolCounters {
    pub admitted: u64,
    pub admission_failures: u64,
    pub invalid_packets: u64,
    pub reclaimed: u64,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
struct FlowKey {
    client: SocketAddr,
    target: SocketAddr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Listening { since: Instant },
    Active,
    /// Closed or aborted by the connection layer; waiting for the socket to
    /// reach `Closed` before it returns to the pool.
    Draining,
}

struct Slot {
    socket: SocketHandle,
    generation: u32,
    phase: Phase,
    flow: Option<FlowKey>,
    arg: Option<ConnKey>,
    callbacks: CallbackSet,
    poll_every: Duration,
    last_poll: Instant,
    /// Send queue length as of the last report, for deriving acks.
    queued: usize,
    fin_delivered: bool,
    consumed: u64,
}

impl Slot {
    fn new(socket: SocketHandle) -> Self {
        Self {
            socket,
            generation: 0,
            phase: Phase::Idle,
            flow: None,
            arg: None,
            callbacks: CallbackSet::empty(),
            poll_every: SLOW_TIMER_INTERVAL,
            last_poll: Instant::now(),
            queued: 0,
            fin_delivered: false,
            consumed: 0,
        }
    }

    fn detach(&mut self) {
        self.arg = None;
        self.callbacks = CallbackSet::empty();
    }
}

pub struct SmolStack {
    device: TunDevice,
    interface: Interface,
    sockets: SocketSet<'static>,
    slots: Vec<Slot>,
    free: Vec<u32>,
    flows: FxHashMap<FlowKey, u32>,
    wake: Arc<Notify>,
    epoch: Instant,
    listen_timeout: Duration,
    counters: SmolCounters,
}

impl SmolStack {
    /// `wake` is notified whenever queued output should be flushed.
    pub fn new(config: &BridgeConfig, wake: Arc<Notify>) -> Self {
        let config = config.normalized();
        let mut device = TunDevice::new(config.mtu, config.ring_capacity);

        let ipv4_addr = Ipv4Address::new(10, 0, 0, 1);
        let ipv6_addr = Ipv6Address::new(0xfd00, 0, 0, 0, 0, 0, 0, 1);
        let mut iface_config = IfaceConfig::new(HardwareAddress::Ip);
        iface_config.random_seed = rand::random();
        let mut interface = Interface::new(iface_config, &mut device, SmoltInstant::from_millis(0));
        interface.set_any_ip(true);
        interface.update_ip_addrs(|ip_addrs| {
            ip_addrs.clear();
            let _ = ip_addrs.push(IpCidr::new(IpAddress::Ipv4(ipv4_addr), 24));
            let _ = ip_addrs.push(IpCidr::new(IpAddress::Ipv6(ipv6_addr), 64));
        });
        {
            let routes = interface.routes_mut();
            routes.add_default_ipv4_route(ipv4_addr).ok();
            routes.add_default_ipv6_route(ipv6_addr).ok();
        }

        let mut sockets = SocketSet::new(Vec::new());
        let mut slots = Vec::with_capacity(config.tcp_socket_count);
        for _ in 0..config.tcp_socket_count {
            let socket = TcpSocket::new(
                TcpSocketBuffer::new(vec![0; config.tcp_rx_buffer_size]),
                TcpSocketBuffer::new(vec![0; config.tcp_tx_buffer_size]),
            );
            slots.push(Slot::new(sockets.add(socket)));
        }
        let free = (0..slots.len() as u32).rev().collect();

        Self {
            device,
            interface,
            sockets,
            slots,
            free,
            flows: FxHashMap::default(),
            wake,
            epoch: Instant::now(),
            listen_timeout: config.listen_timeout(),
            counters: SmolCounters::default(),
        }
    }

    pub fn counters(&self) -> SmolCounters {
        self.counters
    }

    /// Slots currently holding a flow in any phase.
    pub fn flow_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Bytes acknowledged through `recved` for this handle.
    pub fn consumed(&self, pcb: PcbHandle) -> u64 {
        self.active_index(pcb)
            .map(|index| self.slots[index].consumed)
            .unwrap_or(0)
    }

    fn timestamp(&self, now: Instant) -> SmoltInstant {
        let elapsed = now.saturating_duration_since(self.epoch);
        SmoltInstant::from_millis(elapsed.as_millis().min(i64::MAX as u128) as i64)
    }

    fn active_index(&self, pcb: PcbHandle) -> Option<usize> {
        let index = pcb.index as usize;
        let slot = self.slots.get(index)?;
        (slot.generation == pcb.generation && slot.phase == Phase::Active).then_some(index)
    }

    fn socket(&self, index: usize) -> &TcpSocket<'static> {
        self.sockets.get::<TcpSocket>(self.slots[index].socket)
    }

    fn admit(&mut self, key: FlowKey) -> bool {
        let Some(index) = self.free.pop() else {
            self.counters.admission_failures += 1;
            logger::rate_limited_error(
                ErrorCategory::Admission,
                format!("no free TCP socket for {} -> {}", key.client, key.target),
            );
            return false;
        };
        let slot = &mut self.slots[index as usize];
        let socket = self.sockets.get_mut::<TcpSocket>(slot.socket);
        let endpoint = IpListenEndpoint {
            addr: Some(ip_address_from_std(key.target.ip())),
            port: key.target.port(),
        };
        if let Err(error) = socket.listen(endpoint) {
            self.free.push(index);
            self.counters.admission_failures += 1;
            logger::rate_limited_error(
                ErrorCategory::Admission,
                format!("listen on {} failed: {error:?}", key.target),
            );
            return false;
        }
        slot.phase = Phase::Listening {
            since: Instant::now(),
        };
        slot.flow = Some(key);
        self.flows.insert(key, index);
        self.counters.admitted += 1;
        logger::breadcrumb(
            BreadcrumbFlags::ENGINE,
            format!("slot {index} listening for {} -> {}", key.client, key.target),
        );
        true
    }

    /// Returns `true` if the slot should go back to the pool.
    fn collect_events(&mut self, index: u32, now: Instant, events: &mut StackEvents) -> bool {
        let slot = &mut self.slots[index as usize];
        let pcb = PcbHandle::new(index, slot.generation);
        let socket = self.sockets.get_mut::<TcpSocket>(slot.socket);

        match slot.phase {
            Phase::Idle => false,
            Phase::Listening { since } => match socket.state() {
                TcpState::Established | TcpState::CloseWait => {
                    slot.phase = Phase::Active;
                    slot.last_poll = now;
                    slot.queued = socket.send_queue();
                    events.push(StackEvent::new(pcb, StackEventKind::Accepted));
                    false
                }
                _ if now.saturating_duration_since(since) >= self.listen_timeout => {
                    socket.abort();
                    true
                }
                _ => false,
            },
            Phase::Active => {
                if socket.state() == TcpState::Closed {
                    if let (Some(arg), true) = (slot.arg, slot.callbacks.contains(CallbackSet::ERR)) {
                        events.push(StackEvent::new(
                            pcb,
                            StackEventKind::Error {
                                arg,
                                err: EngineError::Reset,
                            },
                        ));
                    }
                    return true;
                }

                let queued = socket.send_queue();
                if queued < slot.queued && slot.callbacks.contains(CallbackSet::SENT) {
                    events.push(StackEvent::new(pcb, StackEventKind::Sent(slot.queued - queued)));
                }
                slot.queued = queued;

                if slot.callbacks.contains(CallbackSet::RECV) {
                    // Payload is peeked, not dequeued: it stays in the socket
                    // and is offered again until `recved` consumes it.
                    let unread = socket.recv_queue();
                    if unread > 0 {
                        let mut data = vec![0u8; unread];
                        if let Ok(read) = socket.peek_slice(&mut data) {
                            data.truncate(read);
                            if !data.is_empty() {
                                events.push(StackEvent::new(pcb, StackEventKind::Received(data)));
                            }
                        }
                    }
                    // `may_recv` stays true while unconsumed payload remains.
                    if !slot.fin_delivered && !socket.may_recv() {
                        slot.fin_delivered = true;
                        events.push(StackEvent::new(pcb, StackEventKind::RemoteClosed));
                    }
                }

                if slot.callbacks.contains(CallbackSet::POLL)
                    && now.saturating_duration_since(slot.last_poll) >= slot.poll_every
                {
                    slot.last_poll = now;
                    events.push(StackEvent::new(pcb, StackEventKind::Poll));
                }
                false
            }
            Phase::Draining => socket.state() == TcpState::Closed,
        }
    }

    fn reclaim(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        if let Some(flow) = slot.flow.take() {
            self.flows.remove(&flow);
        }
        slot.generation = slot.generation.wrapping_add(1);
        slot.phase = Phase::Idle;
        slot.detach();
        slot.queued = 0;
        slot.fin_delivered = false;
        slot.consumed = 0;
        self.free.push(index);
        self.counters.reclaimed += 1;
        logger::breadcrumb(BreadcrumbFlags::ENGINE, format!("slot {index} reclaimed"));
    }

    fn retire(&mut self, pcb: PcbHandle) -> Option<&mut TcpSocket<'static>> {
        let index = self.active_index(pcb)?;
        let slot = &mut self.slots[index];
        slot.phase = Phase::Draining;
        slot.detach();
        Some(self.sockets.get_mut::<TcpSocket>(slot.socket))
    }
}

impl NativeStack for SmolStack {
    fn input(&mut self, packet: &[u8]) -> bool {
        let parsed = match parse_packet(packet) {
            Ok(parsed) => parsed,
            Err(error) => {
                self.counters.invalid_packets += 1;
                logger::rate_limited_error(
                    ErrorCategory::InvalidPacket,
                    format!("dropping inbound packet: {error}"),
                );
                return false;
            }
        };
        if packet.len() > self.device.mtu() {
            self.counters.invalid_packets += 1;
            logger::rate_limited_error(
                ErrorCategory::InvalidPacket,
                format!(
                    "dropping {}-byte inbound packet above mtu {}",
                    packet.len(),
                    self.device.mtu()
                ),
            );
            return false;
        }
        let ParsedPacket::Tcp(tcp) = parsed else {
            logger::breadcrumb(BreadcrumbFlags::PACKET, "ignoring non-TCP packet");
            return false;
        };
        if tcp.is_initial_syn() {
            let key = FlowKey {
                client: SocketAddr::new(tcp.src, tcp.src_port),
                target: SocketAddr::new(tcp.dst, tcp.dst_port),
            };
            if !self.flows.contains_key(&key) && !self.admit(key) {
                return false;
            }
        }
        self.device.push_inbound(packet)
    }

    fn poll(&mut self, now: Instant) -> StackEvents {
        let timestamp = self.timestamp(now);
        self.interface
            .poll(timestamp, &mut self.device, &mut self.sockets);

        let mut events = StackEvents::new();
        for index in 0..self.slots.len() as u32 {
            if self.collect_events(index, now, &mut events) {
                self.reclaim(index);
            }
        }
        events
    }

    fn drain_outbound(&mut self) -> Vec<Frame> {
        self.device
            .drain_outbound()
            .into_iter()
            .map(Frame::new)
            .collect()
    }

    fn endpoints(&self, pcb: PcbHandle) -> Option<(SocketAddr, SocketAddr)> {
        let socket = self.socket(self.active_index(pcb)?);
        let local = socket.local_endpoint()?;
        let remote = socket.remote_endpoint()?;
        Some((socket_addr(local), socket_addr(remote)))
    }

    fn arg(&self, pcb: PcbHandle) -> Option<ConnKey> {
        self.slots[self.active_index(pcb)?].arg
    }

    fn set_arg(&mut self, pcb: PcbHandle, arg: Option<ConnKey>) {
        if let Some(index) = self.active_index(pcb) {
            self.slots[index].arg = arg;
        }
    }

    fn set_callbacks(&mut self, pcb: PcbHandle, callbacks: CallbackSet, poll_interval: u8) {
        if let Some(index) = self.active_index(pcb) {
            let slot = &mut self.slots[index];
            slot.callbacks = callbacks;
            slot.poll_every = SLOW_TIMER_INTERVAL * u32::from(poll_interval.max(1));
        }
    }

    fn write(&mut self, pcb: PcbHandle, data: &[u8]) -> Result<(), EngineError> {
        let index = self.active_index(pcb).ok_or(EngineError::Closed)?;
        let socket = self.sockets.get_mut::<TcpSocket>(self.slots[index].socket);
        if !socket.may_send() {
            return Err(EngineError::NotConnected);
        }
        if socket.send_capacity() - socket.send_queue() < data.len() {
            return Err(EngineError::OutOfMemory);
        }
        socket
            .send_slice(data)
            .map_err(|_| EngineError::NotConnected)?;
        self.slots[index].queued = socket.send_queue();
        Ok(())
    }

    fn output(&mut self, pcb: PcbHandle) -> Result<(), EngineError> {
        self.active_index(pcb).ok_or(EngineError::Closed)?;
        self.wake.notify_one();
        Ok(())
    }

    fn recved(&mut self, pcb: PcbHandle, len: usize) {
        let Some(index) = self.active_index(pcb) else {
            return;
        };
        let socket = self.sockets.get_mut::<TcpSocket>(self.slots[index].socket);
        let mut remaining = len;
        while remaining > 0 {
            match socket.recv(|buf| {
                let take = buf.len().min(remaining);
                (take, take)
            }) {
                Ok(0) | Err(_) => break,
                Ok(taken) => remaining -= taken,
            }
        }
        self.slots[index].consumed += (len - remaining) as u64;
        // The next poll advertises the reopened window.
        self.wake.notify_one();
    }

    fn send_buffer(&self, pcb: PcbHandle) -> usize {
        match self.active_index(pcb) {
            Some(index) => {
                let socket = self.socket(index);
                if socket.may_send() {
                    socket.send_capacity() - socket.send_queue()
                } else {
                    0
                }
            }
            None => 0,
        }
    }

    fn pending_send(&self, pcb: PcbHandle) -> usize {
        self.active_index(pcb)
            .map(|index| self.socket(index).send_queue())
            .unwrap_or(0)
    }

    fn close(&mut self, pcb: PcbHandle) -> Result<(), EngineError> {
        let socket = self.retire(pcb).ok_or(EngineError::Closed)?;
        socket.close();
        self.wake.notify_one();
        Ok(())
    }

    fn abort(&mut self, pcb: PcbHandle) {
        if let Some(socket) = self.retire(pcb) {
            socket.abort();
            self.wake.notify_one();
        }
    }
}

fn ip_address_from_std(addr: IpAddr) -> IpAddress {
    match addr {
        IpAddr::V4(v4) => IpAddress::Ipv4(Ipv4Address::from_bytes(&v4.octets())),
        IpAddr::V6(v6) => IpAddress::Ipv6(Ipv6Address::from_bytes(&v6.octets())),
    }
}

fn socket_addr(endpoint: IpEndpoint) -> SocketAddr {
    let ip = match endpoint.addr {
        IpAddress::Ipv4(v4) => IpAddr::V4(Ipv4Addr::from(v4.0)),
        IpAddress::Ipv6(v6) => IpAddr::V6(Ipv6Addr::from(v6.0)),
    };
    SocketAddr::new(ip, endpoint.port)
}
