//! Record model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::util::now_millis;

uuid_id!(
    /// Client-generated identifier for a record, stable for its whole life.
    RecordId
);

/// Synchronization state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Local changes not yet pushed
    #[default]
    Pending,
    /// A push is in flight
    Syncing,
    /// Local and remote agree
    Synced,
    /// Retries exhausted
    Failed,
    /// Waiting on manual conflict resolution
    Conflicted,
}

impl SyncStatus {
    /// Stable lowercase name, used as the status index value in the local store.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Failed => "failed",
            Self::Conflicted => "conflicted",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-created unit of work, e.g. an inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Client-generated primary key
    pub local_id: RecordId,
    /// Identifier assigned by the remote store on first sync
    pub remote_id: Option<String>,
    /// Device that created the record
    pub owner_device_id: String,
    /// Application data (always a JSON object)
    pub payload: Value,
    /// Synchronization state
    pub sync_status: SyncStatus,
    /// Failed push attempts for the current change
    pub retry_count: u32,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last local modification timestamp (Unix ms)
    pub updated_at: i64,
    /// Remote `updated_at` last observed by this device (Unix ms)
    #[serde(default)]
    pub base_updated_at: Option<i64>,
    /// Tombstone flag while a remote delete is pending
    #[serde(default)]
    pub is_deleted: bool,
}

impl Record {
    /// Create a new, never-synced record owned by `device_id`.
    #[must_use]
    pub fn new(device_id: impl Into<String>, payload: Value) -> Self {
        let now = now_millis();
        Self {
            local_id: RecordId::new(),
            remote_id: None,
            owner_device_id: device_id.into(),
            payload,
            sync_status: SyncStatus::Pending,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            base_updated_at: None,
            is_deleted: false,
        }
    }

    /// Whether the record has ever reached the remote store.
    pub const fn is_remote(&self) -> bool {
        self.remote_id.is_some()
    }

    /// Record a local change. The status only moves to `Pending` when the
    /// driver is not currently holding the record.
    pub fn touch(&mut self, payload: Value) {
        self.payload = payload;
        self.updated_at = now_millis().max(self.updated_at);
        self.retry_count = 0;
        if matches!(self.sync_status, SyncStatus::Synced | SyncStatus::Failed) {
            self.sync_status = SyncStatus::Pending;
        }
    }
}
