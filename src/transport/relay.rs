//! Room-based message router.
//!
//! The hub never inspects sync payloads. It tracks which peers are in which
//! room, forwards `sync` messages to their target, and broadcasts presence and
//! membership changes to the rest of the room.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info, warn};

use super::protocol::{ProtocolMessage, PROTOCOL_VERSION};

struct PeerEntry {
    sender: mpsc::UnboundedSender<ProtocolMessage>,
    kick: Arc<Notify>,
}

/// Routes messages among peers grouped by room id.
#[derive(Default)]
pub struct RelayHub {
    rooms: RwLock<HashMap<String, HashMap<String, PeerEntry>>>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves one peer connection until it leaves, disconnects or is kicked.
    ///
    /// `from_peer` carries the peer's messages; `to_peer` delivers messages to
    /// it. The peer must send `join` before anything else is routed.
    pub async fn run_peer(
        &self,
        mut from_peer: mpsc::UnboundedReceiver<ProtocolMessage>,
        to_peer: mpsc::UnboundedSender<ProtocolMessage>,
    ) {
        let kick = Arc::new(Notify::new());
        let mut joined: Option<(String, String)> = None;

        loop {
            let msg = tokio::select! {
                msg = from_peer.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
                _ = kick.notified() => {
                    debug!("Peer kicked");
                    break;
                }
            };

            let Some((room, peer_id)) = &joined else {
                match msg {
                    ProtocolMessage::Join {
                        sender_id,
                        room,
                        supported_protocol_versions,
                    } => {
                        if !supported_protocol_versions
                            .iter()
                            .any(|v| v == PROTOCOL_VERSION)
                        {
                            let _ = to_peer.send(ProtocolMessage::Error {
                                message: format!(
                                    "Unsupported protocol versions: {:?}",
                                    supported_protocol_versions
                                ),
                            });
                            break;
                        }

                        self.join(&room, &sender_id, to_peer.clone(), kick.clone())
                            .await;
                        joined = Some((room, sender_id));
                    }
                    other => {
                        let _ = to_peer.send(ProtocolMessage::Error {
                            message: format!("Expected join, got {}", other.kind()),
                        });
                    }
                }
                continue;
            };

            match msg {
                ProtocolMessage::Join { .. } => {
                    let _ = to_peer.send(ProtocolMessage::Error {
                        message: "Already joined".to_string(),
                    });
                }
                ProtocolMessage::Sync { .. } => self.forward(room, msg).await,
                ProtocolMessage::Awareness { .. } => self.broadcast(room, peer_id, msg).await,
                ProtocolMessage::Leave { .. } => break,
                other => debug!(kind = other.kind(), "Ignoring message from peer"),
            }
        }

        if let Some((room, peer_id)) = joined {
            self.leave(&room, &peer_id, &to_peer).await;
        }
    }

    async fn join(
        &self,
        room: &str,
        peer_id: &str,
        sender: mpsc::UnboundedSender<ProtocolMessage>,
        kick: Arc<Notify>,
    ) {
        let mut rooms = self.rooms.write().await;
        let members = rooms.entry(room.to_string()).or_default();

        let peers: Vec<String> = members
            .keys()
            .filter(|id| id.as_str() != peer_id)
            .cloned()
            .collect();

        for (id, entry) in members.iter() {
            if id != peer_id {
                let _ = entry.sender.send(ProtocolMessage::PeerJoined {
                    peer_id: peer_id.to_string(),
                });
            }
        }

        let _ = sender.send(ProtocolMessage::Welcome {
            peers: peers.clone(),
        });
        members.insert(peer_id.to_string(), PeerEntry { sender, kick });

        info!(
            room = %short(room),
            peer = %peer_id,
            peers = peers.len(),
            "Peer joined"
        );
    }

    async fn leave(
        &self,
        room: &str,
        peer_id: &str,
        sender: &mpsc::UnboundedSender<ProtocolMessage>,
    ) {
        let mut rooms = self.rooms.write().await;
        let Some(members) = rooms.get_mut(room) else {
            return;
        };

        // A reconnect under the same id may already have replaced this entry
        let owned = members
            .get(peer_id)
            .is_some_and(|entry| entry.sender.same_channel(sender));
        if !owned {
            return;
        }

        members.remove(peer_id);
        for entry in members.values() {
            let _ = entry.sender.send(ProtocolMessage::PeerLeft {
                peer_id: peer_id.to_string(),
            });
        }
        if members.is_empty() {
            rooms.remove(room);
        }

        info!(room = %short(room), peer = %peer_id, "Peer left");
    }

    async fn forward(&self, room: &str, msg: ProtocolMessage) {
        let ProtocolMessage::Sync { target_id, .. } = &msg else {
            return;
        };

        let rooms = self.rooms.read().await;
        match rooms.get(room).and_then(|members| members.get(target_id)) {
            Some(entry) => {
                let _ = entry.sender.send(msg);
            }
            None => warn!(target = %target_id, "Dropping sync message for unknown peer"),
        }
    }

    async fn broadcast(&self, room: &str, from: &str, msg: ProtocolMessage) {
        let rooms = self.rooms.read().await;
        if let Some(members) = rooms.get(room) {
            for (id, entry) in members {
                if id != from {
                    let _ = entry.sender.send(msg.clone());
                }
            }
        }
    }

    /// Drops a peer's connection from the relay side. Returns `false` if the
    /// peer is not connected.
    pub async fn kick(&self, peer_id: &str) -> bool {
        let rooms = self.rooms.read().await;
        let mut found = false;
        for members in rooms.values() {
            if let Some(entry) = members.get(peer_id) {
                entry.kick.notify_one();
                found = true;
            }
        }
        found
    }

    /// Ids of the peers currently in a room.
    pub async fn peers(&self, room: &str) -> Vec<String> {
        let rooms = self.rooms.read().await;
        let mut peers: Vec<String> = rooms
            .get(room)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

fn short(room: &str) -> &str {
    room.get(..8).unwrap_or(room)
}
