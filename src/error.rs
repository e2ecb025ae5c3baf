use crate::acceptor::Network;
use crate::registry::ConnKey;
use crate::stack::{EngineError, EngineOp};
use std::net::SocketAddr;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("no registered {0} connection handler found")]
    NoHandlerRegistered(Network),
    #[error("{0} connection handler already registered")]
    HandlerAlreadyRegistered(Network),
    #[error("connection {local}->{remote} was closed by remote")]
    Closing { local: SocketAddr, remote: SocketAddr },
    #[error("connection {local}->{remote} was closed by local")]
    LocalClosed { local: SocketAddr, remote: SocketAddr },
    #[error("connection {local}->{remote} is aborting")]
    Aborting { local: SocketAddr, remote: SocketAddr },
    #[error("connection {local}->{remote} has been released")]
    Released { local: SocketAddr, remote: SocketAddr },
    #[error("handler rejected connection to {remote}: {source}")]
    ConnectRejected {
        remote: SocketAddr,
        #[source]
        source: anyhow::Error,
    },
    #[error("write proxy failed: {0}")]
    Forward(#[source] anyhow::Error),
    #[error("engine {op} failed with error code {}: {err}", .err.code())]
    Engine { op: EngineOp, err: EngineError },
    #[error("no live connection for key {0}")]
    UnknownConnection(ConnKey),
}

impl BridgeError {
    /// Numeric engine code, if the failure came from the engine.
    pub fn engine_code(&self) -> Option<i8> {
        match self {
            BridgeError::Engine { err, .. } => Some(err.code()),
            _ => None,
        }
    }

    /// Errors caused by calling into a connection that is shutting down.
    pub fn is_state_conflict(&self) -> bool {
        matches!(
            self,
            BridgeError::Closing { .. }
                | BridgeError::LocalClosed { .. }
                | BridgeError::Aborting { .. }
                | BridgeError::Released { .. }
        )
    }
}

/// A write that stopped early. `written` bytes were queued before `source`.
#[derive(Debug, thiserror::Error)]
#[error("{source} after {written} bytes")]
pub struct WriteError {
    pub written: usize,
    #[source]
    pub source: BridgeError,
}
