//! Relay wire protocol.
//!
//! Every frame is one CBOR-encoded [`ProtocolMessage`]. Field names use
//! camelCase on the wire.

use serde::{Deserialize, Serialize};

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: &str = "1";

/// Message types exchanged between peers and the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProtocolMessage {
    /// Sent by a peer to enter a room
    #[serde(rename = "join")]
    Join {
        #[serde(rename = "senderId")]
        sender_id: String,
        room: String,
        #[serde(rename = "supportedProtocolVersions")]
        supported_protocol_versions: Vec<String>,
    },
    /// Sent by the relay in reply to `join`, listing peers already present
    #[serde(rename = "welcome")]
    Welcome { peers: Vec<String> },
    #[serde(rename = "peer-joined")]
    PeerJoined {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    #[serde(rename = "peer-left")]
    PeerLeft {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    /// Automerge sync message for one table, addressed to one peer
    #[serde(rename = "sync")]
    Sync {
        #[serde(rename = "documentId")]
        document_id: String,
        #[serde(rename = "senderId")]
        sender_id: String,
        #[serde(rename = "targetId")]
        target_id: String,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    /// Presence update, broadcast to the whole room
    #[serde(rename = "awareness")]
    Awareness {
        #[serde(rename = "senderId")]
        sender_id: String,
        #[serde(rename = "clientId")]
        client_id: u32,
        clock: u64,
        /// JSON-encoded presence payload; absent when the peer went away
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<String>,
    },
    /// Sent by a peer before disconnecting
    #[serde(rename = "leave")]
    Leave {
        #[serde(rename = "senderId")]
        sender_id: String,
    },
    /// Error reported by the relay
    #[serde(rename = "error")]
    Error { message: String },
}

impl ProtocolMessage {
    /// Encode message as CBOR bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ciborium::ser::Error<std::io::Error>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)?;
        Ok(buf)
    }

    /// Decode message from CBOR bytes.
    pub fn decode(data: &[u8]) -> Result<Self, ciborium::de::Error<std::io::Error>> {
        ciborium::from_reader(data)
    }

    /// Short name used in log output.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::Join { .. } => "join",
            ProtocolMessage::Welcome { .. } => "welcome",
            ProtocolMessage::PeerJoined { .. } => "peer-joined",
            ProtocolMessage::PeerLeft { .. } => "peer-left",
            ProtocolMessage::Sync { .. } => "sync",
            ProtocolMessage::Awareness { .. } => "awareness",
            ProtocolMessage::Leave { .. } => "leave",
            ProtocolMessage::Error { .. } => "error",
        }
    }
}

/// Generate a random peer ID for this connection.
pub fn generate_peer_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
