//! TCP flow bridge for a user-space tunnel.
//!
//! A single-threaded TCP engine terminates the client side of every
//! tunnelled flow. [`StackDriver`] pumps that engine and turns its events
//! into [`Connection`] callbacks, which are forwarded to the registered
//! [`ConnectionHandler`] with the engine lock released. Proxy threads write
//! back through [`Connection::write`], which blocks while the engine's send
//! buffer is full.

pub mod acceptor;
pub mod config;
pub mod conn;
pub mod driver;
pub mod error;
pub mod handler;
pub mod logger;
pub mod registry;
pub mod stack;

#[cfg(test)]
mod test_support;

pub use acceptor::{Acceptors, Network};
pub use config::BridgeConfig;
pub use conn::{CallbackStatus, CloseToken, ConnState, Connection, FlowContext, Release};
pub use driver::{DriverStats, StackDriver};
pub use error::{BridgeError, Result, WriteError};
pub use handler::ConnectionHandler;
pub use logger::{BreadcrumbFlags, LogLevel, LogSink};
pub use registry::{ConnKey, ConnRegistry};
pub use stack::{EngineError, Frame, NativeStack, PcbHandle, SharedStack};
