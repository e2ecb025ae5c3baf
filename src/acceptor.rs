//! Write-once mapping from network kind to the handler that accepts its flows.

use crate::error::{BridgeError, Result};
use crate::handler::ConnectionHandler;
use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Network::Tcp => "TCP",
            Network::Udp => "UDP",
        })
    }
}

/// UDP flows never reach this crate's connection layer, but the slot exists
/// so one registration surface serves both networks.
#[derive(Default)]
pub struct Acceptors {
    tcp: OnceCell<Arc<dyn ConnectionHandler>>,
    udp: OnceCell<Arc<dyn ConnectionHandler>>,
}

impl Acceptors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, network: Network, handler: Arc<dyn ConnectionHandler>) -> Result<()> {
        self.slot(network)
            .set(handler)
            .map_err(|_| BridgeError::HandlerAlreadyRegistered(network))
    }

    pub fn handler(&self, network: Network) -> Result<Arc<dyn ConnectionHandler>> {
        self.slot(network)
            .get()
            .cloned()
            .ok_or(BridgeError::NoHandlerRegistered(network))
    }

    fn slot(&self, network: Network) -> &OnceCell<Arc<dyn ConnectionHandler>> {
        match network {
            Network::Tcp => &self.tcp,
            Network::Udp => &self.udp,
        }
    }
}
