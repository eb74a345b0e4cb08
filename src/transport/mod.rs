//! Transport to the relay.
//!
//! A [`Connector`] opens a [`TransportLink`]: a pair of channels carrying
//! decoded [`ProtocolMessage`]s to and from the relay. The WebSocket connector
//! talks to a `chatsync-relay` server; the in-memory connector talks to a
//! [`RelayHub`] in the same process.

mod memory;
mod protocol;
mod relay;
mod ws;

pub use memory::MemoryConnector;
pub use protocol::{generate_peer_id, ProtocolMessage, PROTOCOL_VERSION};
pub use relay::RelayHub;
pub use ws::WsConnector;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors raised while talking to the relay.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connect(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("CBOR error: {0}")]
    Cbor(String),

    #[error("Relay rejected the connection: {0}")]
    Rejected(String),

    #[error("Transport link closed")]
    Closed,
}

/// Opens links to a relay endpoint.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, endpoint: &'a str)
        -> BoxFuture<'a, Result<TransportLink, TransportError>>;
}

/// An open connection to the relay.
///
/// Dropping the link closes it.
#[derive(Debug)]
pub struct TransportLink {
    outbound: mpsc::UnboundedSender<ProtocolMessage>,
    inbound: mpsc::UnboundedReceiver<ProtocolMessage>,
}

impl TransportLink {
    pub fn new(
        outbound: mpsc::UnboundedSender<ProtocolMessage>,
        inbound: mpsc::UnboundedReceiver<ProtocolMessage>,
    ) -> Self {
        Self { outbound, inbound }
    }

    pub fn send(&self, msg: ProtocolMessage) -> Result<(), TransportError> {
        self.outbound.send(msg).map_err(|_| TransportError::Closed)
    }

    /// Receives the next message. Returns `None` once the relay side is gone.
    pub async fn recv(&mut self) -> Option<ProtocolMessage> {
        self.inbound.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}
