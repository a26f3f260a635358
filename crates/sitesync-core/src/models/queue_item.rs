//! Sync queue item model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::util::now_millis;

use super::conflict::ConflictId;

uuid_id!(
    /// A unique identifier for a queue item.
    QueueItemId
);

/// Kind of entity a queue item refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Record,
    Attachment,
}

impl EntityType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Record => "record",
            Self::Attachment => "attachment",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutation to replay against the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Merge a newer operation into an older pending one for the same entity.
    ///
    /// Returns `None` when the two cancel out: an entity created and deleted
    /// before it ever reached the remote store needs no remote work at all.
    pub const fn coalesce(self, newer: Self) -> Option<Self> {
        match (self, newer) {
            (Self::Create, Self::Delete) => None,
            (Self::Create, _) => Some(Self::Create),
            (Self::Update, Self::Create | Self::Update) => Some(Self::Update),
            (_, Self::Delete) | (Self::Delete, _) => Some(Self::Delete),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl QueueStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }

    /// `Pending` and `Syncing` items still have work outstanding.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Synced | Self::Failed)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutation recorded against an item while it is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUp {
    pub operation: Operation,
    pub payload: Option<Value>,
    pub priority: i32,
}

/// A pending operation on a record or attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    /// Higher is more urgent
    pub priority: i32,
    pub status: QueueStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Latest coalesced payload for create/update
    #[serde(default)]
    pub payload: Option<Value>,
    /// Remote id captured for deletes, when the local row may already be gone
    #[serde(default)]
    pub remote_id: Option<String>,
    #[serde(default)]
    pub follow_up: Option<FollowUp>,
    /// Pending manual conflict parking this item
    #[serde(default)]
    pub held_by: Option<ConflictId>,
    pub created_at: i64,
    pub updated_at: i64,
    /// Not eligible for dequeue before this time (Unix ms)
    pub scheduled_at: i64,
    #[serde(default)]
    pub error: Option<String>,
}

impl QueueItem {
    /// Create a pending item, eligible immediately.
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        operation: Operation,
        priority: i32,
        max_retries: u32,
    ) -> Self {
        let now = now_millis();
        Self {
            id: QueueItemId::new(),
            entity_type,
            entity_id: entity_id.into(),
            operation,
            priority,
            status: QueueStatus::Pending,
            retry_count: 0,
            max_retries,
            payload: None,
            remote_id: None,
            follow_up: None,
            held_by: None,
            created_at: now,
            updated_at: now,
            scheduled_at: now,
            error: None,
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    #[must_use]
    pub fn with_remote_id(mut self, remote_id: Option<String>) -> Self {
        self.remote_id = remote_id;
        self
    }

    /// Key identifying the entity stream this item belongs to.
    pub fn entity_key(&self) -> String {
        entity_key(self.entity_type, &self.entity_id)
    }

    /// Whether `dequeue_batch` may hand this item out at `now`.
    pub fn is_eligible(&self, now: i64) -> bool {
        self.status == QueueStatus::Pending && self.held_by.is_none() && self.scheduled_at <= now
    }
}

/// Owner index value used by the local store for queue items.
pub(crate) fn entity_key(entity_type: EntityType, entity_id: &str) -> String {
    format!("{}:{entity_id}", entity_type.as_str())
}
