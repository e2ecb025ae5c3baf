//! Owns the engine and pumps it: the capture path feeds packets through
//! `handle_packet`, a timer task polls on a fixed tick, and both dispatch the
//! resulting events to connections under the same stack lock.
//!
//! Lock order is dispatch, then stack. Handlers run with the stack lock
//! released but the dispatch lock held, so events for a connection are never
//! delivered while one of its callbacks is still running. Writers only take
//! the stack lock and keep making progress meanwhile.

use crate::acceptor::{Acceptors, Network};
use crate::config::BridgeConfig;
use crate::conn::{CallbackStatus, Connection, FlowContext};
use crate::error::{BridgeError, Result};
use crate::handler::ConnectionHandler;
use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use crate::registry::ConnRegistry;
use crate::stack::smol::SmolStack;
use crate::stack::{
    Frame, NativeStack, PcbHandle, SharedStack, StackEvent, StackEventKind, StackGuard,
};
use crossbeam_channel::{Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub poll_iterations: u64,
    pub packets_in: u64,
    pub packets_dropped: u64,
    pub frames_emitted: u64,
    pub bytes_emitted: u64,
    pub frames_dropped: u64,
    pub callbacks_dispatched: u64,
    pub aborted_callbacks: u64,
    pub callback_errors: u64,
    pub admission_rejections: u64,
}

pub struct StackDriver {
    runtime: Runtime,
    shared: Arc<DriverShared>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    poll_tick: Duration,
}

struct DriverShared {
    ctx: FlowContext,
    /// Held for the whole of every poll-and-dispatch pass.
    dispatch: Mutex<()>,
    state: Mutex<DriverState>,
    wake: Arc<Notify>,
    frames: Sender<Frame>,
    stats: Mutex<DriverStats>,
}

struct DriverState {
    running: bool,
}

impl StackDriver {
    /// Builds a smoltcp-backed driver. Outbound IP frames are sent to `frames`.
    pub fn new(config: BridgeConfig, frames: Sender<Frame>) -> anyhow::Result<Self> {
        let config = config.normalized();
        let wake = Arc::new(Notify::new());
        let stack: SharedStack = Arc::new(Mutex::new(SmolStack::new(&config, Arc::clone(&wake))));
        Self::with_stack(config, stack, wake, frames)
    }

    /// Drives an arbitrary engine. `wake` should be the notifier the engine
    /// signals when it has output to flush.
    pub fn with_stack(
        config: BridgeConfig,
        stack: SharedStack,
        wake: Arc<Notify>,
        frames: Sender<Frame>,
    ) -> anyhow::Result<Self> {
        let config = config.normalized();
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .enable_time()
            .build()?;

        let driver = Self {
            runtime,
            shared: Arc::new(DriverShared {
                ctx: FlowContext {
                    stack,
                    registry: Arc::new(ConnRegistry::new()),
                    acceptors: Arc::new(Acceptors::new()),
                    poll_interval: config.tcp_poll_interval,
                },
                dispatch: Mutex::new(()),
                state: Mutex::new(DriverState { running: false }),
                wake,
                frames,
                stats: Mutex::new(DriverStats::default()),
            }),
            poll_task: Mutex::new(None),
            poll_tick: config.poll_tick(),
        };

        logger::breadcrumb(
            BreadcrumbFlags::DRIVER,
            format!(
                "StackDriver initialized (mtu={}, sockets={}, tick={}ms)",
                config.mtu, config.tcp_socket_count, config.poll_tick_ms
            ),
        );
        Ok(driver)
    }

    pub fn context(&self) -> &FlowContext {
        &self.shared.ctx
    }

    pub fn register_handler(
        &self,
        network: Network,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<()> {
        self.shared.ctx.acceptors.register(network, handler)
    }

    pub fn start(&self) -> anyhow::Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.running {
                anyhow::bail!("stack driver already running");
            }
            state.running = true;
        }
        self.start_poll_loop();
        logger::breadcrumb(BreadcrumbFlags::DRIVER, "StackDriver poll loop running");
        Ok(())
    }

    pub fn stop(&self) {
        self.shared.state.lock().running = false;
        self.shared.wake.notify_waiters();
        if let Some(handle) = self.poll_task.lock().take() {
            handle.abort();
            logger::breadcrumb(BreadcrumbFlags::DRIVER, "StackDriver stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Feeds one packet from the capture loop and dispatches whatever it
    /// triggers. Returns `false` if the engine dropped it.
    pub fn handle_packet(&self, packet: &[u8]) -> bool {
        self.shared.handle_packet(packet)
    }

    /// Runs one engine poll and dispatches its events. Returns the number
    /// of events dispatched.
    pub fn poll_once(&self) -> usize {
        self.shared.poll_once()
    }

    /// Stops polling and resets every live connection.
    pub fn shutdown(&self) {
        self.stop();
        let _dispatch = self.shared.dispatch.lock();
        let conns = self.shared.ctx.registry.snapshot();
        let frames = {
            let mut stack = self.shared.ctx.stack.lock();
            for conn in &conns {
                conn.abort();
                if let Err(error) = conn.check_state(&mut stack) {
                    log_callback_error(&error);
                }
            }
            drain_frames(&mut stack)
        };
        self.shared.emit(frames);
        logger::info(format!("StackDriver shut down, reset {} connections", conns.len()));
    }

    pub fn stats(&self) -> DriverStats {
        *self.shared.stats.lock()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.ctx.registry.len()
    }

    fn start_poll_loop(&self) {
        let shared = Arc::clone(&self.shared);
        let tick = self.poll_tick;
        let handle = self.runtime.spawn(async move {
            let mut ticker = time::interval(tick);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shared.wake.notified() => {}
                }
                let running = shared.state.lock().running;
                if !running {
                    break;
                }
                shared.poll_once();
            }
        });
        *self.poll_task.lock() = Some(handle);
    }
}

impl Drop for StackDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

impl DriverShared {
    fn handle_packet(&self, packet: &[u8]) -> bool {
        let accepted = self.ctx.stack.lock().input(packet);
        {
            let mut stats = self.stats.lock();
            stats.packets_in += 1;
            if !accepted {
                stats.packets_dropped += 1;
            }
        }
        if accepted {
            self.poll_once();
        }
        accepted
    }

    fn poll_once(&self) -> usize {
        let _dispatch = self.dispatch.lock();
        let (dispatched, frames) = {
            let mut stack = self.ctx.stack.lock();
            let events = stack.poll(Instant::now());
            let dispatched = events.len();
            for event in events {
                self.dispatch(&mut stack, event);
            }
            (dispatched, drain_frames(&mut stack))
        };
        self.emit(frames);
        self.stats.lock().poll_iterations += 1;
        dispatched
    }

    fn dispatch(&self, stack: &mut StackGuard<'_>, event: StackEvent) {
        let StackEvent { pcb, kind } = event;
        let result = match kind {
            StackEventKind::Accepted => self.accept(stack, pcb),
            StackEventKind::Error { arg, err } => {
                if let Some(conn) = self.ctx.registry.lookup(arg) {
                    conn.on_error(stack, err);
                }
                Ok(CallbackStatus::Ok)
            }
            StackEventKind::Received(data) => {
                self.with_connection(stack, pcb, |conn, stack| conn.on_recv(stack, &data))
            }
            StackEventKind::RemoteClosed => {
                self.with_connection(stack, pcb, |conn, stack| conn.local_did_close(stack))
            }
            StackEventKind::Sent(len) => {
                self.with_connection(stack, pcb, |conn, stack| conn.on_sent(stack, len))
            }
            StackEventKind::Poll => {
                self.with_connection(stack, pcb, |conn, stack| conn.on_poll(stack))
            }
        };

        let mut stats = self.stats.lock();
        stats.callbacks_dispatched += 1;
        match result {
            Ok(CallbackStatus::Ok) => {}
            Ok(CallbackStatus::Aborted) => stats.aborted_callbacks += 1,
            Err(error) => {
                stats.callback_errors += 1;
                drop(stats);
                log_callback_error(&error);
            }
        }
    }

    fn accept(&self, stack: &mut StackGuard<'_>, pcb: PcbHandle) -> Result<CallbackStatus> {
        match Connection::accept(&self.ctx, stack, pcb) {
            Ok(_) => Ok(CallbackStatus::Ok),
            Err(error) => {
                stack.abort(pcb);
                self.stats.lock().admission_rejections += 1;
                Err(error)
            }
        }
    }

    /// Resolves the handle's argument at delivery time, so events queued
    /// behind a release in the same batch are dropped.
    fn with_connection<F>(
        &self,
        stack: &mut StackGuard<'_>,
        pcb: PcbHandle,
        deliver: F,
    ) -> Result<CallbackStatus>
    where
        F: FnOnce(&Arc<Connection>, &mut StackGuard<'_>) -> Result<CallbackStatus>,
    {
        let Some(key) = stack.arg(pcb) else {
            return Ok(CallbackStatus::Ok);
        };
        match self.ctx.registry.lookup(key) {
            Some(conn) => deliver(&conn, stack),
            None => {
                stack.abort(pcb);
                Err(BridgeError::UnknownConnection(key))
            }
        }
    }

    fn emit(&self, frames: Vec<Frame>) {
        if frames.is_empty() {
            return;
        }
        let mut stats = self.stats.lock();
        for frame in frames {
            let len = frame.packet.len() as u64;
            match self.frames.try_send(frame) {
                Ok(()) => {
                    stats.frames_emitted += 1;
                    stats.bytes_emitted += len;
                }
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    stats.frames_dropped += 1;
                }
            }
        }
    }
}

fn drain_frames(stack: &mut StackGuard<'_>) -> Vec<Frame> {
    let mut frames = Vec::new();
    loop {
        let batch = stack.drain_outbound();
        if batch.is_empty() {
            return frames;
        }
        frames.extend(batch);
    }
}

fn log_callback_error(error: &BridgeError) {
    let category = match error {
        BridgeError::Engine { .. } => ErrorCategory::EngineError,
        BridgeError::ConnectRejected { .. } | BridgeError::Forward(_) => ErrorCategory::HandlerError,
        BridgeError::NoHandlerRegistered(_) | BridgeError::HandlerAlreadyRegistered(_) => {
            ErrorCategory::Admission
        }
        BridgeError::UnknownConnection(_) => ErrorCategory::Dispatch,
        BridgeError::Closing { .. }
        | BridgeError::LocalClosed { .. }
        | BridgeError::Aborting { .. }
        | BridgeError::Released { .. } => ErrorCategory::StateConflict,
    };
    logger::rate_limited_error(category, error.to_string());
}
