mod event;
mod table_key;
mod user;

pub use event::{record_id, RowChange, SyncAction, SyncEvent, SyncStatus};
pub use table_key::TableKey;
pub use user::{PresenceRecord, SyncChannel, SyncUser};
