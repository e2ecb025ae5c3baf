//! Scripted engine for exercising the connection layer without packets.

use super::{
    CallbackSet, EngineError, Frame, NativeStack, PcbHandle, StackEvent, StackEventKind,
    StackEvents,
};
use crate::registry::ConnKey;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    SetArg(PcbHandle, Option<ConnKey>),
    SetCallbacks(PcbHandle, CallbackSet),
    Write(PcbHandle, Vec<u8>),
    Output(PcbHandle),
    Recved(PcbHandle, usize),
    Close(PcbHandle),
    Abort(PcbHandle),
}

pub(crate) struct MockStack {
    pub(crate) calls: Vec<Call>,
    pub(crate) args: HashMap<PcbHandle, ConnKey>,
    pub(crate) callbacks: HashMap<PcbHandle, CallbackSet>,
    pub(crate) local: SocketAddr,
    pub(crate) remote: SocketAddr,
    /// Send-buffer sizes reported in order; `default_capacity` afterwards.
    pub(crate) capacities: RefCell<VecDeque<usize>>,
    pub(crate) default_capacity: usize,
    pub(crate) capacity_queries: Cell<usize>,
    pub(crate) pending: usize,
    pub(crate) write_results: VecDeque<Result<(), EngineError>>,
    pub(crate) close_result: Result<(), EngineError>,
    pub(crate) events: VecDeque<StackEvent>,
    pub(crate) inputs: Vec<Vec<u8>>,
    pub(crate) outbound: Vec<Frame>,
}

impl MockStack {
    pub(crate) fn new() -> Self {
        Self {
            calls: Vec::new(),
            args: HashMap::new(),
            callbacks: HashMap::new(),
            local: "203.0.113.7:443".parse().expect("valid address"),
            remote: "10.0.0.2:40000".parse().expect("valid address"),
            capacities: RefCell::new(VecDeque::new()),
            default_capacity: usize::MAX,
            capacity_queries: Cell::new(0),
            pending: 0,
            write_results: VecDeque::new(),
            close_result: Ok(()),
            events: VecDeque::new(),
            inputs: Vec::new(),
            outbound: Vec::new(),
        }
    }

    pub(crate) fn push_event(&mut self, pcb: PcbHandle, kind: StackEventKind) {
        self.events.push_back(StackEvent::new(pcb, kind));
    }

    pub(crate) fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|call| predicate(call)).count()
    }

    /// All bytes handed to `write`, in order.
    pub(crate) fn written(&self) -> Vec<u8> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::Write(_, data) => Some(data.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }
}

impl NativeStack for MockStack {
    fn input(&mut self, packet: &[u8]) -> bool {
        self.inputs.push(packet.to_vec());
        true
    }

    fn poll(&mut self, _now: Instant) -> StackEvents {
        let events: StackEvents = self.events.drain(..).collect();
        for event in &events {
            // The engine frees a handle before reporting its error.
            if let StackEventKind::Error { .. } = event.kind {
                self.args.remove(&event.pcb);
                self.callbacks.remove(&event.pcb);
            }
        }
        events
    }

    fn drain_outbound(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.outbound)
    }

    fn endpoints(&self, _pcb: PcbHandle) -> Option<(SocketAddr, SocketAddr)> {
        Some((self.local, self.remote))
    }

    fn arg(&self, pcb: PcbHandle) -> Option<ConnKey> {
        self.args.get(&pcb).copied()
    }

    fn set_arg(&mut self, pcb: PcbHandle, arg: Option<ConnKey>) {
        self.calls.push(Call::SetArg(pcb, arg));
        match arg {
            Some(key) => {
                self.args.insert(pcb, key);
            }
            None => {
                self.args.remove(&pcb);
            }
        }
    }

    fn set_callbacks(&mut self, pcb: PcbHandle, callbacks: CallbackSet, _poll_interval: u8) {
        self.calls.push(Call::SetCallbacks(pcb, callbacks));
        self.callbacks.insert(pcb, callbacks);
    }

    fn write(&mut self, pcb: PcbHandle, data: &[u8]) -> Result<(), EngineError> {
        let result = self.write_results.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.calls.push(Call::Write(pcb, data.to_vec()));
        }
        result
    }

    fn output(&mut self, pcb: PcbHandle) -> Result<(), EngineError> {
        self.calls.push(Call::Output(pcb));
        Ok(())
    }

    fn recved(&mut self, pcb: PcbHandle, len: usize) {
        self.calls.push(Call::Recved(pcb, len));
    }

    fn send_buffer(&self, _pcb: PcbHandle) -> usize {
        self.capacity_queries.set(self.capacity_queries.get() + 1);
        self.capacities
            .borrow_mut()
            .pop_front()
            .unwrap_or(self.default_capacity)
    }

    fn pending_send(&self, _pcb: PcbHandle) -> usize {
        self.pending
    }

    fn close(&mut self, pcb: PcbHandle) -> Result<(), EngineError> {
        self.calls.push(Call::Close(pcb));
        self.close_result
    }

    fn abort(&mut self, pcb: PcbHandle) {
        self.calls.push(Call::Abort(pcb));
        self.args.remove(&pcb);
        self.callbacks.remove(&pcb);
    }
}
