//! Outcome of one sync pass.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a pass did not drain the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Offline,
    /// Data saver on and the link is below the configured threshold
    PoorLink,
    /// `pause_on_manual_conflict` is set and a manual conflict is pending
    BlockedByConflicts,
}

impl SkipReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::PoorLink => "poor_link",
            Self::BlockedByConflicts => "blocked_by_conflicts",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters collected while draining.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub started_at: i64,
    pub finished_at: i64,
    /// Items taken from the queue and attempted
    pub attempted: usize,
    pub succeeded: usize,
    /// Transient failures rescheduled with backoff
    pub retried: usize,
    /// Items that ran out of retries or were rejected
    pub failed: usize,
    /// Items waiting on a dependency
    pub deferred: usize,
    pub conflicts_detected: usize,
    pub conflicts_auto_resolved: usize,
    /// Conflicts parked for manual resolution
    pub conflicts_pending: usize,
    /// Stopped early by `cancel_sync`
    pub cancelled: bool,
    /// Another pass was already running; nothing was done
    pub coalesced: bool,
    pub skipped: Option<SkipReason>,
}

impl SyncReport {
    pub(crate) fn started(now: i64) -> Self {
        Self {
            started_at: now,
            finished_at: now,
            ..Self::default()
        }
    }

    pub(crate) fn coalesced(now: i64) -> Self {
        Self {
            coalesced: true,
            ..Self::started(now)
        }
    }

    /// Whether this pass drained the queue (fully or partially).
    pub const fn ran(&self) -> bool {
        !self.coalesced && self.skipped.is_none()
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.coalesced {
            return f.write_str("sync already in progress");
        }
        if let Some(reason) = self.skipped {
            return write!(f, "sync skipped ({reason})");
        }
        write!(
            f,
            "{} attempted, {} synced, {} retrying, {} failed, {} deferred, {} conflict(s) ({} auto-resolved)",
            self.attempted,
            self.succeeded,
            self.retried,
            self.failed,
            self.deferred,
            self.conflicts_detected,
            self.conflicts_auto_resolved
        )?;
        if self.cancelled {
            f.write_str(", cancelled")?;
        }
        Ok(())
    }
}
