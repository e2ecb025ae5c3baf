//! One accepted TCP flow, bridging engine callbacks to a proxy handler.
//!
//! Engine callbacks (`accept`, `on_recv`, `on_sent`, `local_did_close`,
//! `on_poll`, `on_error`) run with the stack lock held and drop it around
//! every handler call. `write`, `close` and `abort` may be called from any
//! thread; only `write` touches the engine, and only under the lock.

mod gate;
mod state;

pub use gate::CloseToken;
pub use state::{ConnState, Release};

use crate::acceptor::{Acceptors, Network};
use crate::error::{BridgeError, Result, WriteError};
use crate::handler::ConnectionHandler;
use crate::logger::{self, BreadcrumbFlags};
use crate::registry::{ConnKey, ConnRegistry};
use crate::stack::{CallbackSet, EngineError, EngineOp, PcbHandle, SharedStack, StackGuard};
use gate::{CloseSignal, WriteGate};
use parking_lot::{Mutex, MutexGuard};
use state::{ConnEvent, Refusal, Step};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// Result of an engine callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackStatus {
    Ok,
    /// The handle was aborted during the callback and must not be used.
    Aborted,
}

/// Everything needed to admit a flow: the engine, the identity registry and
/// the registered handlers.
#[derive(Clone)]
pub struct FlowContext {
    pub stack: SharedStack,
    pub registry: Arc<ConnRegistry>,
    pub acceptors: Arc<Acceptors>,
    pub poll_interval: u8,
}

pub struct Connection {
    key: ConnKey,
    pcb: PcbHandle,
    stack: SharedStack,
    registry: Arc<ConnRegistry>,
    handler: Arc<dyn ConnectionHandler>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    state: Mutex<ConnState>,
    closed: CloseSignal,
    gate: WriteGate,
}

impl Connection {
    /// Admits a flow whose handshake just completed.
    ///
    /// On error nothing stays registered and the caller must abort `pcb`.
    pub(crate) fn accept(
        ctx: &FlowContext,
        stack: &mut StackGuard<'_>,
        pcb: PcbHandle,
    ) -> Result<Arc<Connection>> {
        let handler = ctx.acceptors.handler(Network::Tcp)?;
        // The engine's local endpoint is the address the client dialled.
        let (target, client) = stack.endpoints(pcb).ok_or(BridgeError::Engine {
            op: EngineOp::Accept,
            err: EngineError::Closed,
        })?;

        let conn = ctx.registry.insert_with(|key| {
            Arc::new(Connection {
                key,
                pcb,
                stack: Arc::clone(&ctx.stack),
                registry: Arc::clone(&ctx.registry),
                handler,
                local_addr: client,
                remote_addr: target,
                state: Mutex::new(ConnState::Open),
                closed: CloseSignal::new(),
                gate: WriteGate::new(),
            })
        });
        stack.set_arg(pcb, Some(conn.key));
        stack.set_callbacks(pcb, CallbackSet::ALL, ctx.poll_interval);
        logger::breadcrumb(
            BreadcrumbFlags::CONN,
            format!("{} accepted {} {client} -> {target}", conn.key, pcb),
        );

        let connected = MutexGuard::unlocked(stack, || conn.handler.connect(&conn, target));
        if let Err(source) = connected {
            // Nothing reaches the engine here; the caller resets the handle.
            if conn.state.lock().fail() {
                conn.release_bookkeeping();
            }
            return Err(BridgeError::ConnectRejected {
                remote: target,
                source,
            });
        }
        Ok(conn)
    }

    pub fn key(&self) -> ConnKey {
        self.key
    }

    /// The tunnelled client.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The destination the client dialled.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    pub fn is_released(&self) -> bool {
        self.state().is_released()
    }

    /// A token that resolves when this connection is released.
    pub fn closed(&self) -> CloseToken {
        self.closed.token()
    }

    /// Requests a graceful close. Buffered output still drains; the engine
    /// handle is closed from the next callback once it has.
    pub fn close(&self) {
        if self.state.lock().apply(ConnEvent::CloseRequested) {
            logger::breadcrumb(BreadcrumbFlags::CONN, format!("{} close requested", self.key));
        }
        self.gate.broadcast();
    }

    /// Requests an immediate reset. Blocked writers fail at once; the engine
    /// handle is discarded from the next callback.
    pub fn abort(&self) {
        if self.state.lock().apply(ConnEvent::AbortRequested) {
            logger::breadcrumb(BreadcrumbFlags::CONN, format!("{} abort requested", self.key));
        }
        self.gate.broadcast();
    }

    /// Writes all of `data`, blocking while the engine's send buffer is
    /// full. Returns the number of bytes queued.
    pub fn write(&self, data: &[u8]) -> std::result::Result<usize, WriteError> {
        let _writer = self.gate.writer();
        let mut written = 0;
        while written < data.len() {
            let seen = self.gate.epoch();
            {
                let mut stack = self.stack.lock();
                self.state()
                    .check_write()
                    .map_err(|refusal| self.write_error(written, self.refused(refusal)))?;
                let room = stack.send_buffer(self.pcb);
                let chunk = (data.len() - written).min(room);
                if chunk > 0 {
                    match stack.write(self.pcb, &data[written..written + chunk]) {
                        Ok(()) => {
                            written += chunk;
                            stack.output(self.pcb).map_err(|err| {
                                self.write_error(
                                    written,
                                    BridgeError::Engine {
                                        op: EngineOp::Output,
                                        err,
                                    },
                                )
                            })?;
                        }
                        Err(err) if err.is_retryable() => {}
                        Err(err) => {
                            return Err(self.write_error(
                                written,
                                BridgeError::Engine {
                                    op: EngineOp::Write,
                                    err,
                                },
                            ))
                        }
                    }
                }
            }
            if written < data.len() {
                logger::breadcrumb(
                    BreadcrumbFlags::WRITE,
                    format!("{} waiting for send buffer ({written}/{})", self.key, data.len()),
                );
                self.gate.wait_past(seen);
            }
        }
        Ok(written)
    }

    pub(crate) fn on_recv(
        self: &Arc<Self>,
        stack: &mut StackGuard<'_>,
        data: &[u8],
    ) -> Result<CallbackStatus> {
        if data.is_empty() {
            return Ok(CallbackStatus::Ok);
        }
        self.state()
            .check_receive()
            .map_err(|refusal| self.refused(refusal))?;
        MutexGuard::unlocked(stack, || self.handler.did_receive(self, data))
            .map_err(BridgeError::Forward)?;
        if !self.is_released() {
            stack.recved(self.pcb, data.len());
        }
        Ok(CallbackStatus::Ok)
    }

    pub(crate) fn on_sent(
        self: &Arc<Self>,
        stack: &mut StackGuard<'_>,
        len: usize,
    ) -> Result<CallbackStatus> {
        MutexGuard::unlocked(stack, || self.handler.did_send(self, len));
        self.check_state(stack)
    }

    /// The client finished sending.
    pub(crate) fn local_did_close(
        self: &Arc<Self>,
        stack: &mut StackGuard<'_>,
    ) -> Result<CallbackStatus> {
        MutexGuard::unlocked(stack, || self.handler.local_did_close(self));
        self.state.lock().apply(ConnEvent::PeerFinished);
        self.gate.broadcast();
        self.check_state(stack)
    }

    pub(crate) fn on_poll(self: &Arc<Self>, stack: &mut StackGuard<'_>) -> Result<CallbackStatus> {
        self.check_state(stack)
    }

    /// The engine already freed the handle, so no engine call is made.
    pub(crate) fn on_error(self: &Arc<Self>, stack: &mut StackGuard<'_>, err: EngineError) {
        if !self.state.lock().fail() {
            return;
        }
        logger::breadcrumb(
            BreadcrumbFlags::CONN,
            format!("{} engine error {} ({err})", self.key, err.code()),
        );
        self.release_bookkeeping();
        MutexGuard::unlocked(stack, || self.handler.did_close(self));
    }

    /// Moves the connection towards teardown once closing is possible.
    pub(crate) fn check_state(&self, stack: &mut StackGuard<'_>) -> Result<CallbackStatus> {
        let drained = matches!(self.state(), ConnState::Closing | ConnState::LocalClosing)
            && stack.pending_send(self.pcb) == 0;
        let step = self.state.lock().evaluate(drained);
        match step {
            Step::KeepGoing => {
                self.gate.broadcast();
                Ok(CallbackStatus::Ok)
            }
            Step::ReleaseGracefully => {
                stack.set_callbacks(self.pcb, CallbackSet::empty(), 0);
                stack.set_arg(self.pcb, None);
                self.release_bookkeeping();
                stack.close(self.pcb).map_err(|err| BridgeError::Engine {
                    op: EngineOp::Close,
                    err,
                })?;
                Ok(CallbackStatus::Ok)
            }
            Step::ReleaseForcibly => {
                self.release_bookkeeping();
                stack.abort(self.pcb);
                Ok(CallbackStatus::Aborted)
            }
            Step::Settled => Ok(CallbackStatus::Ok),
        }
    }

    fn release_bookkeeping(&self) {
        self.registry.free(self.key);
        self.closed.fire();
        self.gate.broadcast();
        logger::breadcrumb(
            BreadcrumbFlags::CONN,
            format!("{} released as {:?}", self.key, self.state()),
        );
    }

    fn refused(&self, refusal: Refusal) -> BridgeError {
        let (local, remote) = (self.local_addr, self.remote_addr);
        match refusal {
            Refusal::Closing => BridgeError::Closing { local, remote },
            Refusal::LocalClosed => BridgeError::LocalClosed { local, remote },
            Refusal::Aborting => BridgeError::Aborting { local, remote },
            Refusal::Released => BridgeError::Released { local, remote },
        }
    }

    fn write_error(&self, written: usize, source: BridgeError) -> WriteError {
        WriteError { written, source }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("pcb", &self.pcb)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl io::Write for &Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match Connection::write(self, buf) {
            Ok(written) => Ok(written),
            Err(error) if error.written > 0 => Ok(error.written),
            Err(error) => Err(io::Error::new(io_kind(&error.source), error.source)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn io_kind(error: &BridgeError) -> io::ErrorKind {
    match error {
        BridgeError::LocalClosed { .. } | BridgeError::Closing { .. } => io::ErrorKind::BrokenPipe,
        BridgeError::Aborting { .. } | BridgeError::Released { .. } => {
            io::ErrorKind::ConnectionAborted
        }
        BridgeError::Engine {
            err: EngineError::Reset,
            ..
        } => io::ErrorKind::ConnectionReset,
        _ => io::ErrorKind::Other,
    }
}
