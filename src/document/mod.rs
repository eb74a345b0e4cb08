//! Replicated document store.
//!
//! One Automerge document per synchronized table; each row lives at the
//! document root keyed by its id.

mod store;
mod value;

pub use store::{ChangeBatch, KeyAction, KeyChange, Origin, ReplicatedStore};
pub use value::{read_value, write_value};

/// Error type for replicated document operations.
#[derive(Debug)]
pub enum DocumentError {
    /// Error from Automerge.
    Automerge(automerge::AutomergeError),
    /// A sync message could not be decoded.
    Decode(String),
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentError::Automerge(e) => write!(f, "Automerge error: {}", e),
            DocumentError::Decode(e) => write!(f, "Failed to decode sync message: {}", e),
        }
    }
}

impl std::error::Error for DocumentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DocumentError::Automerge(e) => Some(e),
            DocumentError::Decode(_) => None,
        }
    }
}

impl From<automerge::AutomergeError> for DocumentError {
    fn from(e: automerge::AutomergeError) -> Self {
        DocumentError::Automerge(e)
    }
}
