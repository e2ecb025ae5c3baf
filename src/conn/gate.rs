use parking_lot::{Condvar, Mutex, MutexGuard};
use tokio::sync::watch;

/// Parks writers until send-buffer space may have changed.
///
/// Writers snapshot the epoch before trying the engine and sleep only while
/// it is unchanged, so a broadcast between the attempt and the wait cannot
/// be lost.
pub(crate) struct WriteGate {
    writer: Mutex<()>,
    epoch: Mutex<u64>,
    changed: Condvar,
}

impl WriteGate {
    pub(crate) fn new() -> Self {
        Self {
            writer: Mutex::new(()),
            epoch: Mutex::new(0),
            changed: Condvar::new(),
        }
    }

    /// Serializes writers so their chunks never interleave.
    pub(crate) fn writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock()
    }

    pub(crate) fn epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    pub(crate) fn wait_past(&self, seen: u64) {
        let mut epoch = self.epoch.lock();
        while *epoch == seen {
            self.changed.wait(&mut epoch);
        }
    }

    pub(crate) fn broadcast(&self) {
        let mut epoch = self.epoch.lock();
        *epoch = epoch.wrapping_add(1);
        self.changed.notify_all();
    }
}

/// Fires once when the connection is released.
pub(crate) struct CloseSignal {
    tx: watch::Sender<bool>,
}

impl CloseSignal {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Returns `true` only for the call that actually fired the signal.
    pub(crate) fn fire(&self) -> bool {
        self.tx.send_if_modified(|closed| !std::mem::replace(closed, true))
    }

    pub(crate) fn token(&self) -> CloseToken {
        CloseToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observer side of a connection's release, for work that should stop when
/// the flow goes away.
#[derive(Clone)]
pub struct CloseToken {
    rx: watch::Receiver<bool>,
}

impl CloseToken {
    pub fn is_closed(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the connection has been released.
    pub async fn closed(&mut self) {
        let _ = self.rx.wait_for(|closed| *closed).await;
    }
}
