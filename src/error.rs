use crate::db::TableError;
use crate::document::DocumentError;
use crate::transport::TransportError;

/// Errors surfaced by the sync bus.
#[derive(Debug)]
pub enum SyncError {
    /// No channel name configured
    NotConfigured,
    /// Local table store failure
    Table(TableError),
    /// Replicated document failure
    Document(DocumentError),
    /// Relay connection failure
    Transport(TransportError),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::NotConfigured => write!(
                f,
                "Sync not configured. Set sync.channel_name in the config file or CHATSYNC_CHANNEL."
            ),
            SyncError::Table(e) => write!(f, "Table error: {}", e),
            SyncError::Document(e) => write!(f, "Document error: {}", e),
            SyncError::Transport(e) => write!(f, "Transport error: {}", e),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::NotConfigured => None,
            SyncError::Table(e) => Some(e),
            SyncError::Document(e) => Some(e),
            SyncError::Transport(e) => Some(e),
        }
    }
}

impl From<TableError> for SyncError {
    fn from(e: TableError) -> Self {
        SyncError::Table(e)
    }
}

impl From<DocumentError> for SyncError {
    fn from(e: DocumentError) -> Self {
        SyncError::Document(e)
    }
}

impl From<TransportError> for SyncError {
    fn from(e: TransportError) -> Self {
        SyncError::Transport(e)
    }
}
