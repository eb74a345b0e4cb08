//! Presence ("awareness") state for one transport session.
//!
//! Each session picks a random client id. The local state and every peer's
//! last announced state are kept here; [`Awareness::records`] maps them to the
//! display shape, marking the local client as `current`.

use std::collections::HashMap;

use rand::Rng;
use tracing::warn;

use crate::models::{PresenceRecord, SyncUser};
use crate::transport::ProtocolMessage;

#[derive(Debug, Clone)]
struct RemoteState {
    client_id: u32,
    clock: u64,
    user: SyncUser,
}

#[derive(Debug)]
pub struct Awareness {
    client_id: u32,
    clock: u64,
    local: Option<SyncUser>,
    peers: HashMap<String, RemoteState>,
}

impl Default for Awareness {
    fn default() -> Self {
        Self::new()
    }
}

impl Awareness {
    pub fn new() -> Self {
        Self::with_client_id(rand::rng().random())
    }

    pub fn with_client_id(client_id: u32) -> Self {
        Self {
            client_id,
            clock: 0,
            local: None,
            peers: HashMap::new(),
        }
    }

    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    pub fn local_state(&self) -> Option<&SyncUser> {
        self.local.as_ref()
    }

    /// Replaces the local state. `None` announces that this client is leaving.
    pub fn set_local_state(&mut self, user: Option<SyncUser>) {
        self.local = user;
        self.clock += 1;
    }

    /// Builds the message announcing the current local state.
    pub fn local_update(&self, sender_id: &str) -> ProtocolMessage {
        ProtocolMessage::Awareness {
            sender_id: sender_id.to_string(),
            client_id: self.client_id,
            clock: self.clock,
            state: self
                .local
                .as_ref()
                .and_then(|user| serde_json::to_string(user).ok()),
        }
    }

    /// Applies a peer's announcement. Returns `true` if the visible set changed.
    ///
    /// Announcements older than the last one seen from the same client are
    /// ignored.
    pub fn apply_remote(
        &mut self,
        peer_id: &str,
        client_id: u32,
        clock: u64,
        state: Option<&str>,
    ) -> bool {
        if let Some(existing) = self.peers.get(peer_id) {
            if existing.client_id == client_id && existing.clock >= clock {
                return false;
            }
        }

        let Some(state) = state else {
            return self.peers.remove(peer_id).is_some();
        };

        let user: SyncUser = match serde_json::from_str(state) {
            Ok(user) => user,
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "Ignoring malformed presence state");
                return false;
            }
        };

        self.peers.insert(
            peer_id.to_string(),
            RemoteState {
                client_id,
                clock,
                user,
            },
        );
        true
    }

    /// Forgets a peer that left the room.
    pub fn remove_peer(&mut self, peer_id: &str) -> bool {
        self.peers.remove(peer_id).is_some()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Full presence set: the local client first, then peers by client id.
    pub fn records(&self) -> Vec<PresenceRecord> {
        let mut records = Vec::with_capacity(self.peers.len() + 1);

        if let Some(user) = &self.local {
            records.push(PresenceRecord {
                user: user.clone(),
                client_id: self.client_id,
                current: true,
            });
        }

        let mut peers: Vec<&RemoteState> = self.peers.values().collect();
        peers.sort_by_key(|state| state.client_id);
        records.extend(peers.into_iter().map(|state| PresenceRecord {
            user: state.user.clone(),
            client_id: state.client_id,
            current: false,
        }));

        records
    }
}
