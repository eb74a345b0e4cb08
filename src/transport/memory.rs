use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use super::{Connector, RelayHub, TransportError, TransportLink};

/// Connects to a [`RelayHub`] running in the same process.
///
/// The endpoint string is ignored; every link joins the shared hub.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    hub: Arc<RelayHub>,
}

impl MemoryConnector {
    pub fn new(hub: Arc<RelayHub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }
}

impl Connector for MemoryConnector {
    fn connect<'a>(
        &'a self,
        _endpoint: &'a str,
    ) -> BoxFuture<'a, Result<TransportLink, TransportError>> {
        Box::pin(async move {
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

            let hub = self.hub.clone();
            tokio::spawn(async move { hub.run_peer(outbound_rx, inbound_tx).await });

            Ok(TransportLink::new(outbound_tx, inbound_rx))
        })
    }
}
