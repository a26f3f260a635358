//! Sync conflict model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;
use crate::util::now_millis;

use super::queue_item::Operation;

uuid_id!(
    /// A unique identifier for a recorded conflict.
    ConflictId
);

/// How a divergence between local and remote versions is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// The version with the later `updated_at` wins
    #[default]
    LatestWins,
    LocalWins,
    RemoteWins,
    /// Park the entity until the application resolves it
    Manual,
}

impl ResolutionStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LatestWins => "latest_wins",
            Self::LocalWins => "local_wins",
            Self::RemoteWins => "remote_wins",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "latest_wins" | "lww" | "latest" => Ok(Self::LatestWins),
            "local_wins" | "local" => Ok(Self::LocalWins),
            "remote_wins" | "remote" => Ok(Self::RemoteWins),
            "manual" | "merge" => Ok(Self::Manual),
            other => Err(Error::Validation(format!(
                "Unknown resolution strategy '{other}'"
            ))),
        }
    }
}

/// Conflict lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
    Ignored,
}

impl ConflictStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Ignored => "ignored",
        }
    }
}

impl fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The device's side of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalVersion {
    pub payload: Value,
    pub updated_at: i64,
    pub device_id: String,
}

/// The remote store's side of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteVersion {
    pub payload: Value,
    pub updated_at: i64,
    pub actor_id: String,
}

/// Recorded divergence between a local and a remote version of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    /// Local id of the record involved
    pub entity_id: String,
    /// Local operation that ran into the remote change
    pub operation: Operation,
    pub local_version: LocalVersion,
    pub remote_version: RemoteVersion,
    pub resolution_strategy: ResolutionStrategy,
    pub status: ConflictStatus,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<i64>,
    /// Detection timestamp (Unix ms)
    pub detected_at: i64,
}

impl Conflict {
    /// A conflict awaiting manual resolution.
    pub fn pending(
        entity_id: impl Into<String>,
        operation: Operation,
        local_version: LocalVersion,
        remote_version: RemoteVersion,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            entity_id: entity_id.into(),
            operation,
            local_version,
            remote_version,
            resolution_strategy: ResolutionStrategy::Manual,
            status: ConflictStatus::Pending,
            resolved_by: None,
            resolved_at: None,
            detected_at: now_millis(),
        }
    }

    /// Audit entry for a conflict the driver settled on its own.
    pub fn auto_resolved(
        entity_id: impl Into<String>,
        operation: Operation,
        local_version: LocalVersion,
        remote_version: RemoteVersion,
        strategy: ResolutionStrategy,
    ) -> Self {
        let mut conflict = Self::pending(entity_id, operation, local_version, remote_version);
        conflict.resolution_strategy = strategy;
        conflict.status = ConflictStatus::Resolved;
        conflict.resolved_by = Some(format!("auto:{strategy}"));
        conflict.resolved_at = Some(conflict.detected_at);
        conflict
    }

    pub const fn is_pending(&self) -> bool {
        matches!(self.status, ConflictStatus::Pending)
    }
}
