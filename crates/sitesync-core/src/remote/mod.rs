//! Remote store boundary.
//!
//! The remote store is the authoritative document database, reached only while
//! online. The driver talks to it exclusively through [`RemoteStore`].

mod http;
mod memory;

pub use http::HttpRemoteStore;
pub use memory::MemoryRemoteStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A document as held by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
    pub remote_id: String,
    pub payload: Value,
    /// Last write time assigned by the remote store (Unix ms)
    pub updated_at: i64,
    /// Device or service that performed the last write
    pub actor_id: String,
}

/// Acknowledgement of a successful write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAck {
    pub remote_id: String,
    pub updated_at: i64,
}

/// Failure talking to the remote store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote call timed out")]
    Timeout,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("remote store unavailable: {0}")]
    Unavailable(String),
    #[error("remote store rejected the request: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Timeouts, transport failures and server-side unavailability are worth
    /// retrying; rejections are not.
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Document-level access to the remote store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch a document, `None` when it does not exist.
    async fn get(
        &self,
        collection: &str,
        remote_id: &str,
    ) -> Result<Option<RemoteDocument>, RemoteError>;

    /// Create (`remote_id = None`) or overwrite a document.
    ///
    /// Writing to an id the store does not know creates the document under
    /// that id.
    async fn put(
        &self,
        collection: &str,
        remote_id: Option<&str>,
        payload: &Value,
    ) -> Result<RemoteAck, RemoteError>;

    /// Delete a document. Deleting a missing document succeeds.
    async fn delete(&self, collection: &str, remote_id: &str) -> Result<(), RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rejections_are_final() {
        assert!(RemoteError::Timeout.is_retryable());
        assert!(RemoteError::Transport("reset".into()).is_retryable());
        assert!(RemoteError::Unavailable("503".into()).is_retryable());
        assert!(!RemoteError::Rejected("422".into()).is_retryable());
    }
}
