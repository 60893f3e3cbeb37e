//! Error types for wagate-core.

use thiserror::Error;

/// Result type alias using wagate-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for gateway operations
#[derive(Error, Debug)]
pub enum Error {
    // Store errors
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Record not found: {session_id}/{item_id}")]
    RecordNotFound { session_id: String, item_id: String },

    #[error("Store lock poisoned")]
    LockPoisoned,

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Backend socket errors
    #[error("Transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Not-found is a distinguished condition, not a generic store failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::RecordNotFound { .. })
    }
}
