//! Transport session.
//!
//! A [`SyncProvider`] joins one relay room, runs the Automerge sync protocol
//! for every table with every peer in the room, and tracks presence. It does
//! no I/O scheduling of its own: the owner feeds it incoming messages via
//! [`SyncProvider::handle`] and reacts to the returned [`ProviderEvent`]s.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use automerge::sync;
use tracing::{debug, info, warn};

use crate::awareness::Awareness;
use crate::document::ReplicatedStore;
use crate::models::{PresenceRecord, SyncChannel, SyncUser, TableKey};
use crate::transport::{
    generate_peer_id, Connector, ProtocolMessage, TransportError, TransportLink, PROTOCOL_VERSION,
};

/// Lifecycle and presence events reported by the provider.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Status { connected: bool },
    Synced { synced: bool },
    AwarenessChanged(Vec<PresenceRecord>),
}

pub struct SyncProvider {
    peer_id: String,
    room: String,
    link: TransportLink,
    awareness: Awareness,
    peers: HashMap<String, HashMap<TableKey, sync::State>>,
    /// Initial exchanges still owed: (peer, table).
    pending: HashSet<(String, TableKey)>,
    connected: bool,
    synced: bool,
}

impl SyncProvider {
    /// Opens a link to the relay and asks to join the channel's room.
    ///
    /// Returns as soon as the join request is sent; `Status { connected: true }`
    /// follows when the relay welcomes us.
    pub async fn connect(
        connector: &dyn Connector,
        endpoint: &str,
        channel: &SyncChannel,
        user: SyncUser,
    ) -> Result<Self, TransportError> {
        let link = connector.connect(endpoint).await?;
        let peer_id = generate_peer_id();
        let room = channel.room_id();

        link.send(ProtocolMessage::Join {
            sender_id: peer_id.clone(),
            room: room.clone(),
            supported_protocol_versions: vec![PROTOCOL_VERSION.to_string()],
        })?;

        let mut awareness = Awareness::new();
        awareness.set_local_state(Some(user));

        debug!(peer = %peer_id, endpoint, "Join sent");

        Ok(Self {
            peer_id,
            room,
            link,
            awareness,
            peers: HashMap::new(),
            pending: HashSet::new(),
            connected: false,
            synced: false,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn awareness(&self) -> &Awareness {
        &self.awareness
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Ids of the peers currently known in the room.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.peers.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Waits for the next message from the relay. `None` means the link closed.
    pub async fn recv(&mut self) -> Option<ProtocolMessage> {
        self.link.recv().await
    }

    /// Processes one message from the relay.
    pub fn handle(
        &mut self,
        msg: ProtocolMessage,
        store: &mut ReplicatedStore,
    ) -> Vec<ProviderEvent> {
        let mut events = Vec::new();

        match msg {
            ProtocolMessage::Welcome { peers } => {
                info!(peer = %self.peer_id, peers = peers.len(), "Joined room");
                self.connected = true;
                events.push(ProviderEvent::Status { connected: true });

                self.send(self.awareness.local_update(&self.peer_id));
                for peer in peers {
                    for table in TableKey::ALL {
                        self.pending.insert((peer.clone(), table));
                    }
                    self.add_peer(&peer, store);
                }
                events.push(ProviderEvent::AwarenessChanged(self.awareness.records()));
                self.check_synced(&mut events);
            }
            ProtocolMessage::PeerJoined { peer_id } => {
                debug!(peer = %peer_id, "Peer joined");
                self.add_peer(&peer_id, store);
                // Let the newcomer see us
                self.send(self.awareness.local_update(&self.peer_id));
            }
            ProtocolMessage::PeerLeft { peer_id } => {
                debug!(peer = %peer_id, "Peer left");
                self.peers.remove(&peer_id);
                self.pending.retain(|(peer, _)| peer != &peer_id);
                if self.awareness.remove_peer(&peer_id) {
                    events.push(ProviderEvent::AwarenessChanged(self.awareness.records()));
                }
                self.check_synced(&mut events);
            }
            ProtocolMessage::Sync {
                document_id,
                sender_id,
                data,
                ..
            } => {
                let Ok(table) = TableKey::from_str(&document_id) else {
                    warn!(document = %document_id, "Ignoring sync for unknown table");
                    return events;
                };
                self.receive_sync(table, &sender_id, &data, store, &mut events);
            }
            ProtocolMessage::Awareness {
                sender_id,
                client_id,
                clock,
                state,
            } => {
                if sender_id != self.peer_id
                    && self
                        .awareness
                        .apply_remote(&sender_id, client_id, clock, state.as_deref())
                {
                    events.push(ProviderEvent::AwarenessChanged(self.awareness.records()));
                }
            }
            ProtocolMessage::Error { message } => {
                warn!(error = %message, "Relay reported an error");
                events.push(ProviderEvent::Synced { synced: false });
            }
            other => debug!(kind = other.kind(), "Ignoring unexpected message"),
        }

        events
    }

    /// Reports the loss of the relay link.
    pub fn handle_closed(&mut self) -> Vec<ProviderEvent> {
        self.connected = false;
        vec![ProviderEvent::Status { connected: false }]
    }

    /// Sends whatever each peer is missing of `table`.
    pub fn broadcast_changes(&mut self, store: &mut ReplicatedStore, table: TableKey) {
        let peers: Vec<String> = self.peers.keys().cloned().collect();
        for peer in peers {
            self.sync_with(&peer, table, store);
        }
    }

    /// Announces departure and closes the link.
    pub fn destroy(mut self) {
        self.awareness.set_local_state(None);
        self.send(self.awareness.local_update(&self.peer_id));
        self.send(ProtocolMessage::Leave {
            sender_id: self.peer_id.clone(),
        });
        debug!(peer = %self.peer_id, "Provider destroyed");
    }

    fn add_peer(&mut self, peer_id: &str, store: &mut ReplicatedStore) {
        self.peers.entry(peer_id.to_string()).or_insert_with(|| {
            TableKey::ALL
                .into_iter()
                .map(|table| (table, sync::State::new()))
                .collect()
        });
        for table in TableKey::ALL {
            self.sync_with(peer_id, table, store);
        }
    }

    fn receive_sync(
        &mut self,
        table: TableKey,
        sender_id: &str,
        data: &[u8],
        store: &mut ReplicatedStore,
        events: &mut Vec<ProviderEvent>,
    ) {
        let state = self
            .peers
            .entry(sender_id.to_string())
            .or_default()
            .entry(table)
            .or_insert_with(sync::State::new);

        let changed = match store.receive_sync_message(table, state, data) {
            Ok(batch) => batch.is_some(),
            Err(e) => {
                warn!(peer = %sender_id, table = %table, error = %e, "Sync message rejected");
                events.push(ProviderEvent::Synced { synced: false });
                return;
            }
        };

        let caught_up = state.their_heads.as_deref() == Some(store.heads(table).as_slice());
        if caught_up && self.pending.remove(&(sender_id.to_string(), table)) {
            debug!(peer = %sender_id, table = %table, "Initial exchange complete");
        }

        if changed {
            // Forward to everyone, the sender included
            self.broadcast_changes(store, table);
        } else {
            self.sync_with(sender_id, table, store);
        }

        self.check_synced(events);
    }

    fn sync_with(&mut self, peer_id: &str, table: TableKey, store: &mut ReplicatedStore) {
        let Some(state) = self
            .peers
            .get_mut(peer_id)
            .and_then(|states| states.get_mut(&table))
        else {
            return;
        };

        if let Some(data) = store.generate_sync_message(table, state) {
            self.send(ProtocolMessage::Sync {
                document_id: table.as_str().to_string(),
                sender_id: self.peer_id.clone(),
                target_id: peer_id.to_string(),
                data,
            });
        }
    }

    fn check_synced(&mut self, events: &mut Vec<ProviderEvent>) {
        if self.connected && !self.synced && self.pending.is_empty() {
            self.synced = true;
            info!(peer = %self.peer_id, "Initial sync complete");
            events.push(ProviderEvent::Synced { synced: true });
        }
    }

    fn send(&self, msg: ProtocolMessage) {
        if let Err(e) = self.link.send(msg) {
            debug!(error = %e, "Dropping outbound message");
        }
    }
}
