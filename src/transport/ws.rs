use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::{Connector, ProtocolMessage, TransportError, TransportLink};

/// Connects to a relay over WebSocket, one CBOR message per binary frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect<'a>(
        &'a self,
        endpoint: &'a str,
    ) -> BoxFuture<'a, Result<TransportLink, TransportError>> {
        Box::pin(async move {
            let (ws_stream, _) = connect_async(endpoint).await?;
            debug!(endpoint, "WebSocket connected");

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            tokio::spawn(pump(ws_stream, outbound_rx, inbound_tx));

            Ok(TransportLink::new(outbound_tx, inbound_rx))
        })
    }
}

/// Moves frames between the socket and the link channels until either side closes.
async fn pump(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::UnboundedReceiver<ProtocolMessage>,
    inbound: mpsc::UnboundedSender<ProtocolMessage>,
) {
    let (mut sender, mut receiver) = ws_stream.split();

    loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(msg) => match msg.encode() {
                    Ok(bytes) => {
                        if let Err(e) = sender.send(Message::Binary(bytes.into())).await {
                            debug!(error = %e, "WebSocket send failed");
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, kind = msg.kind(), "Failed to encode message"),
                },
                None => {
                    // Link dropped; close gracefully
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Binary(data))) => match ProtocolMessage::decode(&data) {
                    Ok(msg) => {
                        if inbound.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Dropping undecodable frame"),
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = sender.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {
                    // Ignore other message types
                }
                Some(Err(e)) => {
                    debug!(error = %e, "WebSocket receive failed");
                    break;
                }
            },
        }
    }

    debug!("WebSocket link closed");
}
