//! Error types for sitesync-core

use thiserror::Error;

use crate::remote::RemoteError;

/// Result type alias using sitesync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in sitesync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Local persistence failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// SQLite error from the local store
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored document could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote store or transport failure
    #[error("Network error: {0}")]
    Network(#[from] RemoteError),

    /// Entity referenced by id does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Manual resolution required or resolution request invalid
    #[error("Conflict error: {0}")]
    Conflict(String),

    /// Malformed input rejected before it reaches the queue
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid engine configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the error comes from the local store.
    ///
    /// Storage errors abort the current sync pass because local state may be
    /// inconsistent.
    pub const fn is_storage(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Sqlite(_) | Self::Io(_) | Self::Serialization(_)
        )
    }

    /// Whether retrying the same operation later may succeed.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Network(error) => error.is_retryable(),
            _ => false,
        }
    }

    pub(crate) fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{kind} {id}"))
    }
}
