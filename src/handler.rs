use crate::conn::Connection;
use std::net::SocketAddr;
use std::sync::Arc;

/// Proxy-side consumer of accepted flows.
///
/// Every method is invoked with the stack lock released, so implementations
/// may block on upstream I/O and may call back into [`Connection::write`],
/// [`Connection::close`] or [`Connection::abort`]. Calls for one connection
/// never overlap with each other, and arrive in engine order.
///
/// Callbacks are delivered one at a time by the driver, so acknowledgements
/// cannot arrive while a callback is running. A write that may block on a
/// full send buffer belongs on the proxy's own thread, not inside a callback.
pub trait ConnectionHandler: Send + Sync {
    /// A new flow to `remote` completed its handshake. Returning an error
    /// rejects it and the flow is reset.
    fn connect(&self, conn: &Arc<Connection>, remote: SocketAddr) -> anyhow::Result<()>;

    /// Client payload, in order. An error is logged and the bytes are not
    /// acknowledged, but the connection stays up.
    fn did_receive(&self, conn: &Arc<Connection>, data: &[u8]) -> anyhow::Result<()>;

    /// `len` bytes previously written were acknowledged by the client.
    fn did_send(&self, conn: &Arc<Connection>, len: usize);

    /// The client finished sending. Writes fail from here on.
    fn local_did_close(&self, conn: &Arc<Connection>);

    /// The engine dropped the flow (reset or timeout).
    fn did_close(&self, conn: &Arc<Connection>);
}
