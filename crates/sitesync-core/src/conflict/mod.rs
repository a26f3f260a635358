//! Conflict detection and resolution.
//!
//! A record conflicts with its remote counterpart when the remote document
//! was written after the last remote state this device observed
//! (`base_updated_at`). What happens next depends on the strategy:
//!
//! | strategy      | outcome                                            |
//! |---------------|----------------------------------------------------|
//! | `latest_wins` | later `updated_at` wins; ties go to the greater id |
//! | `local_wins`  | local version overwrites the remote                |
//! | `remote_wins` | remote version replaces the local one              |
//! | `manual`      | entity is parked until the application decides     |
//!
//! Resolution is a pure function of its inputs so every device reaches the
//! same decision for the same pair of versions.

use serde::{Deserialize, Serialize};

use crate::models::{LocalVersion, RemoteVersion, ResolutionStrategy};

/// Decision for one local/remote pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Remote unchanged since last observed; write the local version
    NoConflict,
    /// Both changed; the local version wins and overwrites the remote
    KeepLocal,
    /// Both changed; the remote version wins and replaces the local one
    KeepRemote,
    /// Both changed; the application must decide
    Manual,
}

impl Resolution {
    /// Whether both sides had diverged.
    pub const fn is_conflict(self) -> bool {
        !matches!(self, Self::NoConflict)
    }
}

/// Decide between `local` and `remote`.
///
/// `base_updated_at` is the remote `updated_at` the local edit was based on;
/// `None` means this device never observed the remote document.
pub fn resolve(
    local: &LocalVersion,
    base_updated_at: Option<i64>,
    remote: &RemoteVersion,
    strategy: ResolutionStrategy,
) -> Resolution {
    if base_updated_at.is_some_and(|base| remote.updated_at <= base) {
        return Resolution::NoConflict;
    }

    match strategy {
        ResolutionStrategy::LocalWins => Resolution::KeepLocal,
        ResolutionStrategy::RemoteWins => Resolution::KeepRemote,
        ResolutionStrategy::Manual => Resolution::Manual,
        ResolutionStrategy::LatestWins => {
            let local_key = (local.updated_at, local.device_id.as_str());
            let remote_key = (remote.updated_at, remote.actor_id.as_str());
            if local_key >= remote_key {
                Resolution::KeepLocal
            } else {
                Resolution::KeepRemote
            }
        }
    }
}
