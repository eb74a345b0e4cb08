//! Chatsync Relay
//!
//! A content-blind relay: peers join an opaque room id and the relay forwards
//! their CBOR frames to one another. It never stores or decodes document data.
//!
//! # Configuration
//!
//! Environment variables:
//! - `CHATSYNC_RELAY_PORT`: Port to listen on (default: 4444)
//!
//! # Endpoints
//!
//! - `GET /health`: Health check endpoint
//! - `GET /`: WebSocket upgrade, one CBOR message per binary frame

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chatsync::transport::{ProtocolMessage, RelayHub};

// ============================================================================
// Configuration
// ============================================================================

/// Relay configuration
#[derive(Debug, Clone)]
struct Config {
    /// Port to listen on
    port: u16,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let port = std::env::var("CHATSYNC_RELAY_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(4444);

        Self { port }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    hub: Arc<RelayHub>,
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    rooms: usize,
}

/// Health check endpoint
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        rooms: state.hub.room_count().await,
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

/// Bridges one WebSocket to the hub until either side goes away.
async fn handle_socket(socket: WebSocket, hub: Arc<RelayHub>) {
    let (mut sender, mut receiver) = socket.split();
    let (from_peer_tx, from_peer_rx) = mpsc::unbounded_channel();
    let (to_peer_tx, mut to_peer_rx) = mpsc::unbounded_channel::<ProtocolMessage>();

    tracing::debug!("Peer connected");
    let peer = tokio::spawn(async move { hub.run_peer(from_peer_rx, to_peer_tx).await });

    loop {
        tokio::select! {
            outgoing = to_peer_rx.recv() => match outgoing {
                Some(msg) => match msg.encode() {
                    Ok(bytes) => {
                        if sender.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("Failed to encode {} message: {}", msg.kind(), e),
                },
                None => {
                    // Hub is done with this peer (left or kicked)
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Binary(data))) => match ProtocolMessage::decode(&data) {
                    Ok(msg) => {
                        if from_peer_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("Dropping undecodable frame: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {
                    // Ping/pong are answered by axum; text frames are ignored
                }
                Some(Err(e)) => {
                    tracing::debug!("WebSocket receive failed: {}", e);
                    break;
                }
            },
        }
    }

    // Closing the inbound channel makes the hub drop the peer from its room
    drop(from_peer_tx);
    let _ = peer.await;
    tracing::debug!("Peer disconnected");
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatsync=info,chatsync_relay=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env();

    let state = AppState {
        hub: Arc::new(RelayHub::new()),
    };

    let app = Router::new()
        .route("/", get(ws_handler))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting relay on {}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
