//! Chatsync Library
//!
//! Peer-to-peer replication of local chat tables through a relay.

pub mod awareness;
pub mod bus;
pub mod config;
pub mod db;
pub mod document;
pub mod error;
pub mod models;
pub mod provider;
pub mod transport;

pub use bus::{
    BusState, StartDataSyncParams, SyncBus, SyncHandle, SyncNotification, SyncOptions,
    DEFAULT_SIGNALING,
};
pub use config::{Config, ConfigError};
pub use db::{init_db, init_memory_db, TableStore, WriteSource};
pub use document::{Origin, ReplicatedStore};
pub use error::SyncError;
pub use models::{
    PresenceRecord, RowChange, SyncAction, SyncChannel, SyncEvent, SyncStatus, SyncUser, TableKey,
};
pub use transport::{Connector, MemoryConnector, RelayHub, WsConnector};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
