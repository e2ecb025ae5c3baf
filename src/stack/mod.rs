//! Contract between the connection layer and the embedded packet engine.
//!
//! The engine is single threaded and must never be re-entered. Every method
//! here is called with the shared stack lock held; handles are only valid
//! under that lock and only until the engine tears them down.

pub mod device;
pub mod smol;

#[cfg(test)]
pub(crate) mod mock;

use crate::registry::ConnKey;
use bitflags::bitflags;
use libc::{AF_INET, AF_INET6};
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// The single serialization lock around the engine.
pub type SharedStack = Arc<Mutex<dyn NativeStack>>;

/// Proof that the caller holds the engine lock.
pub type StackGuard<'a> = MutexGuard<'a, dyn NativeStack>;

pub type StackEvents = SmallVec<[StackEvent; 16]>;

/// Opaque reference to one flow inside the engine. The generation makes a
/// handle to a recycled slot compare unequal to the new occupant's.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PcbHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl PcbHandle {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl fmt::Display for PcbHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pcb#{}.{}", self.index, self.generation)
    }
}

bitflags! {
    /// Event kinds the engine delivers for a handle.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CallbackSet: u8 {
        const RECV = 0b0001;
        const SENT = 0b0010;
        const ERR  = 0b0100;
        const POLL = 0b1000;
        const ALL  = Self::RECV.bits() | Self::SENT.bits() | Self::ERR.bits() | Self::POLL.bits();
    }
}

/// Engine status codes. Numeric values match lwIP's `err_t` so logs stay
/// comparable with other stacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("timeout")]
    Timeout,
    #[error("illegal value")]
    IllegalValue,
    #[error("not connected")]
    NotConnected,
    #[error("connection aborted")]
    Aborted,
    #[error("connection reset")]
    Reset,
    #[error("connection closed")]
    Closed,
    #[error("illegal argument")]
    IllegalArgument,
}

impl EngineError {
    pub fn code(self) -> i8 {
        match self {
            Self::OutOfMemory => -1,
            Self::Timeout => -3,
            Self::IllegalValue => -6,
            Self::NotConnected => -11,
            Self::Aborted => -13,
            Self::Reset => -14,
            Self::Closed => -15,
            Self::IllegalArgument => -16,
        }
    }

    /// Transient shortage; the same write may succeed later.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::OutOfMemory)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineOp {
    Accept,
    Write,
    Output,
    Close,
}

impl fmt::Display for EngineOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineOp::Accept => "accept",
            EngineOp::Write => "write",
            EngineOp::Output => "output",
            EngineOp::Close => "close",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackEvent {
    pub pcb: PcbHandle,
    pub kind: StackEventKind,
}

impl StackEvent {
    pub fn new(pcb: PcbHandle, kind: StackEventKind) -> Self {
        Self { pcb, kind }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StackEventKind {
    /// Handshake completed for a new inbound flow.
    Accepted,
    /// Payload from the tunnelled client.
    Received(Vec<u8>),
    /// The tunnelled client sent FIN and all its data has been delivered.
    RemoteClosed,
    /// `len` bytes of previously written data were acknowledged.
    Sent(usize),
    Poll,
    /// The engine already freed the handle; only the argument survives.
    Error { arg: ConnKey, err: EngineError },
}

/// An IP packet ready for the capture loop, tagged with its address family.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub protocol: u32,
    pub packet: Vec<u8>,
}

impl Frame {
    pub fn new(packet: Vec<u8>) -> Self {
        Self {
            protocol: protocol_number(&packet),
            packet,
        }
    }
}

fn protocol_number(frame: &[u8]) -> u32 {
    if frame.first().map(|byte| (byte >> 4) == 6).unwrap_or(false) {
        AF_INET6 as u32
    } else {
        AF_INET as u32
    }
}

/// Operations the connection layer needs from the packet engine.
///
/// Calls on a handle the engine no longer owns must be harmless: queries
/// return zero or `None`, mutations return [`EngineError::Closed`] or do
/// nothing.
pub trait NativeStack: Send {
    /// Feeds one inbound IP packet. Returns `false` if it was dropped.
    fn input(&mut self, packet: &[u8]) -> bool;

    /// Advances timers and processes queued input, returning the resulting
    /// events in delivery order.
    fn poll(&mut self, now: Instant) -> StackEvents;

    fn drain_outbound(&mut self) -> Vec<Frame>;

    /// `(local, remote)` endpoints of the native handle.
    fn endpoints(&self, pcb: PcbHandle) -> Option<(SocketAddr, SocketAddr)>;

    fn arg(&self, pcb: PcbHandle) -> Option<ConnKey>;

    fn set_arg(&mut self, pcb: PcbHandle, arg: Option<ConnKey>);

    /// Replaces the delivered event set. An empty set detaches the handle.
    fn set_callbacks(&mut self, pcb: PcbHandle, callbacks: CallbackSet, poll_interval: u8);

    /// Queues all of `data` or nothing. [`EngineError::OutOfMemory`] means
    /// try again later.
    fn write(&mut self, pcb: PcbHandle, data: &[u8]) -> Result<(), EngineError>;

    fn output(&mut self, pcb: PcbHandle) -> Result<(), EngineError>;

    /// Acknowledges that `len` received bytes were consumed.
    fn recved(&mut self, pcb: PcbHandle, len: usize);

    /// Bytes that `write` would currently accept.
    fn send_buffer(&self, pcb: PcbHandle) -> usize;

    /// Bytes written but not yet acknowledged by the client.
    fn pending_send(&self, pcb: PcbHandle) -> usize;

    /// Starts a graceful close. The handle must not be used afterwards.
    fn close(&mut self, pcb: PcbHandle) -> Result<(), EngineError>;

    /// Discards the handle immediately and resets the flow.
    fn abort(&mut self, pcb: PcbHandle);
}

#[cfg(test)]
mod tests;
