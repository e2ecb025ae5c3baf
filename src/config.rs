//! Tunable limits for the bridge. Every field has a production default; the
//! driver always works on a [`BridgeConfig::normalized`] copy.

use std::time::Duration;

pub const DEFAULT_MTU: usize = 1280;
pub const MIN_MTU: usize = 576;
pub const MAX_MTU: usize = 9000;

pub const DEFAULT_TCP_SOCKET_COUNT: usize = 128;
pub const DEFAULT_TCP_BUFFER_SIZE: usize = 16 * 1024;
pub const DEFAULT_RING_CAPACITY: usize = 512;
pub const DEFAULT_POLL_TICK_MS: u64 = 5;
pub const DEFAULT_LISTEN_TIMEOUT_MS: u64 = 10_000;

/// Poll callback period for accepted flows, in slow-timer ticks.
pub const TCP_POLL_INTERVAL: u8 = 8;

/// Length of one slow-timer tick.
pub const SLOW_TIMER_INTERVAL: Duration = Duration::from_millis(500);

const MIN_RING_CAPACITY: usize = 16;
const MIN_TCP_BUFFER_SIZE: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BridgeConfig {
    pub mtu: usize,
    pub tcp_socket_count: usize,
    pub tcp_rx_buffer_size: usize,
    pub tcp_tx_buffer_size: usize,
    pub ring_capacity: usize,
    /// Driver tick period in milliseconds.
    pub poll_tick_ms: u64,
    /// Poll callback period for accepted flows, in slow-timer ticks.
    pub tcp_poll_interval: u8,
    /// Half-open listeners that never complete the handshake are reclaimed
    /// after this long.
    pub listen_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            tcp_socket_count: DEFAULT_TCP_SOCKET_COUNT,
            tcp_rx_buffer_size: DEFAULT_TCP_BUFFER_SIZE,
            tcp_tx_buffer_size: DEFAULT_TCP_BUFFER_SIZE,
            ring_capacity: DEFAULT_RING_CAPACITY,
            poll_tick_ms: DEFAULT_POLL_TICK_MS,
            tcp_poll_interval: TCP_POLL_INTERVAL,
            listen_timeout_ms: DEFAULT_LISTEN_TIMEOUT_MS,
        }
    }
}

impl BridgeConfig {
    pub fn normalized(mut self) -> Self {
        self.mtu = normalize_mtu(self.mtu);
        self.tcp_socket_count = self.tcp_socket_count.max(1);
        self.tcp_rx_buffer_size = self.tcp_rx_buffer_size.max(MIN_TCP_BUFFER_SIZE);
        self.tcp_tx_buffer_size = self.tcp_tx_buffer_size.max(MIN_TCP_BUFFER_SIZE);
        self.ring_capacity = self.ring_capacity.max(MIN_RING_CAPACITY);
        self.poll_tick_ms = self.poll_tick_ms.max(1);
        self.tcp_poll_interval = self.tcp_poll_interval.max(1);
        self
    }

    pub fn poll_tick(&self) -> Duration {
        Duration::from_millis(self.poll_tick_ms)
    }

    pub fn listen_timeout(&self) -> Duration {
        Duration::from_millis(self.listen_timeout_ms)
    }
}

fn normalize_mtu(value: usize) -> usize {
    value.clamp(MIN_MTU, MAX_MTU)
}
