use crate::acceptor::{Acceptors, Network};
use crate::conn::{Connection, FlowContext};
use crate::handler::ConnectionHandler;
use crate::registry::ConnRegistry;
use crate::stack::mock::MockStack;
use crate::stack::{PcbHandle, SharedStack};
use anyhow::anyhow;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
pub(crate) struct RecordingHandler {
    pub(crate) connects: Mutex<Vec<SocketAddr>>,
    pub(crate) received: Mutex<Vec<Vec<u8>>>,
    pub(crate) sent: Mutex<Vec<usize>>,
    pub(crate) local_closes: AtomicUsize,
    pub(crate) closes: AtomicUsize,
    pub(crate) reject_connect: AtomicBool,
    pub(crate) fail_receive: AtomicBool,
}

impl RecordingHandler {
    pub(crate) fn received_bytes(&self) -> usize {
        self.received.lock().iter().map(Vec::len).sum()
    }
}

impl ConnectionHandler for RecordingHandler {
    fn connect(&self, _conn: &Arc<Connection>, remote: SocketAddr) -> anyhow::Result<()> {
        self.connects.lock().push(remote);
        if self.reject_connect.load(Ordering::SeqCst) {
            return Err(anyhow!("upstream refused {remote}"));
        }
        Ok(())
    }

    fn did_receive(&self, _conn: &Arc<Connection>, data: &[u8]) -> anyhow::Result<()> {
        if self.fail_receive.load(Ordering::SeqCst) {
            return Err(anyhow!("upstream write failed"));
        }
        self.received.lock().push(data.to_vec());
        Ok(())
    }

    fn did_send(&self, _conn: &Arc<Connection>, len: usize) {
        self.sent.lock().push(len);
    }

    fn local_did_close(&self, _conn: &Arc<Connection>) {
        self.local_closes.fetch_add(1, Ordering::SeqCst);
    }

    fn did_close(&self, _conn: &Arc<Connection>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct Fixture {
    pub(crate) mock: Arc<Mutex<MockStack>>,
    pub(crate) ctx: FlowContext,
    pub(crate) handler: Arc<RecordingHandler>,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        let fixture = Self::without_handler();
        let handler: Arc<dyn ConnectionHandler> = fixture.handler.clone();
        fixture
            .ctx
            .acceptors
            .register(Network::Tcp, handler)
            .expect("register tcp handler");
        fixture
    }

    pub(crate) fn without_handler() -> Self {
        let mock = Arc::new(Mutex::new(MockStack::new()));
        let stack: SharedStack = mock.clone();
        Self {
            mock,
            ctx: FlowContext {
                stack,
                registry: Arc::new(ConnRegistry::new()),
                acceptors: Arc::new(Acceptors::new()),
                poll_interval: crate::config::TCP_POLL_INTERVAL,
            },
            handler: Arc::new(RecordingHandler::default()),
        }
    }

    pub(crate) fn accept(&self, pcb: PcbHandle) -> Arc<Connection> {
        let mut stack = self.ctx.stack.lock();
        Connection::accept(&self.ctx, &mut stack, pcb).expect("accept flow")
    }
}

pub(crate) fn pcb(index: u32) -> PcbHandle {
    PcbHandle::new(index, 0)
}

/// Polls `predicate` until it holds or `timeout` elapses.
pub(crate) fn wait_for(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    predicate()
}
