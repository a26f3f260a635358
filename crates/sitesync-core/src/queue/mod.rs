//! Priority-aware sync queue persisted in the local store.
//!
//! The queue keeps at most one unfinished item per entity. New mutations are
//! folded into the existing item (see [`Operation::coalesce`]); a mutation
//! that arrives while its entity is being synced is parked on the in-flight
//! item as a [`FollowUp`] and re-armed once the attempt completes.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SyncConfig;
use crate::db::{Collection, Documents, LocalStore};
use crate::error::{Error, Result};
use crate::models::{
    ConflictId, EntityType, FollowUp, Operation, QueueItem, QueueItemId, QueueStatus,
};
use crate::util::now_millis;

/// Priority of record deletes.
pub const PRIORITY_DELETE: i32 = 100;
/// Priority of record updates.
pub const PRIORITY_UPDATE: i32 = 20;
/// Priority of record creates.
pub const PRIORITY_CREATE: i32 = 10;
/// Priority of attachment uploads.
pub const PRIORITY_ATTACHMENT: i32 = 5;

/// Default priority for a mutation.
pub const fn default_priority(entity_type: EntityType, operation: Operation) -> i32 {
    match (entity_type, operation) {
        (_, Operation::Delete) => PRIORITY_DELETE,
        (EntityType::Attachment, _) => PRIORITY_ATTACHMENT,
        (EntityType::Record, Operation::Update) => PRIORITY_UPDATE,
        (EntityType::Record, Operation::Create) => PRIORITY_CREATE,
    }
}

/// Result of a single sync attempt, reported through [`SyncQueue::mark_result`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Success,
    Failure { error: String, retryable: bool },
    /// Dependency not ready; try again shortly without consuming a retry
    Deferred { reason: String },
    /// Parked behind a manual conflict
    Held { conflict_id: ConflictId },
}

impl SyncOutcome {
    pub fn failure(error: &Error) -> Self {
        Self::Failure {
            error: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}

/// What `enqueue` did with a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    /// New item inserted
    Inserted(QueueItem),
    /// Folded into an existing pending or failed item
    Coalesced(QueueItem),
    /// Recorded as follow-up of an in-flight item
    FollowUp(QueueItem),
    /// Cancelled out an unsynced create; no remote work remains
    Cancelled,
}

impl Enqueued {
    pub const fn item(&self) -> Option<&QueueItem> {
        match self {
            Self::Inserted(item) | Self::Coalesced(item) | Self::FollowUp(item) => Some(item),
            Self::Cancelled => None,
        }
    }
}

/// Queue operations over the local store.
#[derive(Clone)]
pub struct SyncQueue {
    store: LocalStore,
    config: Arc<SyncConfig>,
}

impl SyncQueue {
    pub const fn new(store: LocalStore, config: Arc<SyncConfig>) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Add a mutation, superseding any unfinished item for the same entity.
    pub async fn enqueue(&self, item: QueueItem) -> Result<Enqueued> {
        self.store.transaction(|docs| enqueue_in(docs, item)).await
    }

    /// Take up to `max_items` eligible items and mark them `Syncing`.
    ///
    /// Items are ordered by priority (highest first) then age (oldest first).
    pub async fn dequeue_batch(&self, max_items: usize) -> Result<Vec<QueueItem>> {
        let now = now_millis();
        self.store
            .transaction(|docs| {
                let mut candidates: Vec<QueueItem> = docs
                    .scan_by_status::<QueueItem>(QueueStatus::Pending.as_str())?
                    .into_iter()
                    .filter(|item| item.is_eligible(now))
                    .collect();
                candidates.sort_by_key(|item| (Reverse(item.priority), item.created_at, item.id));

                let mut seen = HashSet::new();
                let mut batch = Vec::with_capacity(max_items.min(candidates.len()));
                for mut item in candidates {
                    if batch.len() >= max_items {
                        break;
                    }
                    if !seen.insert(item.entity_key()) {
                        continue;
                    }
                    item.status = QueueStatus::Syncing;
                    item.updated_at = now;
                    docs.put(&item)?;
                    batch.push(item);
                }
                Ok(batch)
            })
            .await
    }

    /// Record the outcome of an attempt.
    pub async fn mark_result(&self, id: QueueItemId, outcome: SyncOutcome) -> Result<QueueItem> {
        self.store
            .transaction(|docs| mark_result_in(docs, &self.config, id, outcome))
            .await
    }

    /// Re-arm every `Failed` item with a fresh retry budget.
    pub async fn retry_failed(&self) -> Result<Vec<QueueItem>> {
        let now = now_millis();
        self.store
            .transaction(|docs| {
                let mut revived = docs.scan_by_status::<QueueItem>(QueueStatus::Failed.as_str())?;
                for item in &mut revived {
                    item.status = QueueStatus::Pending;
                    item.retry_count = 0;
                    item.error = None;
                    item.scheduled_at = now;
                    item.updated_at = now;
                    docs.put(item)?;
                }
                Ok(revived)
            })
            .await
    }

    /// Drop `Synced` items last touched more than `older_than` ago.
    pub async fn purge_synced(&self, older_than: Duration) -> Result<usize> {
        let cutoff = now_millis().saturating_sub(duration_millis(older_than));
        self.store
            .transaction(|docs| {
                let synced = docs.scan_by_status::<QueueItem>(QueueStatus::Synced.as_str())?;
                let mut purged = 0;
                for item in synced.iter().filter(|item| item.updated_at <= cutoff) {
                    if docs.delete(Collection::SyncQueue, &item.id.to_string())? {
                        purged += 1;
                    }
                }
                Ok(purged)
            })
            .await
    }

    /// Park an item behind a pending manual conflict.
    pub async fn hold(&self, id: QueueItemId, conflict_id: ConflictId) -> Result<QueueItem> {
        self.mark_result(id, SyncOutcome::Held { conflict_id }).await
    }

    /// Release every item held by `conflict_id`, returning how many were held.
    pub async fn release(&self, conflict_id: ConflictId) -> Result<usize> {
        self.store
            .transaction(|docs| release_in(docs, conflict_id))
            .await
    }

    /// Reset items left `Syncing` by an interrupted pass back to `Pending`.
    pub async fn requeue_in_flight(&self) -> Result<usize> {
        let requeued = self
            .store
            .transaction(|docs| {
                let stale = docs.scan_by_status::<QueueItem>(QueueStatus::Syncing.as_str())?;
                for item in &stale {
                    requeue_in(docs, item.id)?;
                }
                Ok(stale.len())
            })
            .await?;
        if requeued > 0 {
            tracing::warn!("Requeued {requeued} item(s) from an interrupted sync pass");
        }
        Ok(requeued)
    }

    /// Hand a dequeued item back without counting an attempt.
    pub async fn requeue(&self, id: QueueItemId) -> Result<()> {
        self.store.transaction(|docs| requeue_in(docs, id)).await
    }

    pub async fn get(&self, id: QueueItemId) -> Result<Option<QueueItem>> {
        self.store.get(&id.to_string()).await
    }

    /// The unfinished (or failed) item for an entity, if any.
    pub async fn active_for(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<QueueItem>> {
        self.store
            .transaction(|docs| active_in(docs, entity_type, entity_id))
            .await
    }

    pub async fn items(&self, status: QueueStatus) -> Result<Vec<QueueItem>> {
        self.store.scan_by_status(status.as_str()).await
    }

    pub async fn count(&self, status: QueueStatus) -> Result<usize> {
        self.store
            .count_by_status(Collection::SyncQueue, status.as_str())
            .await
    }

    /// Earliest `scheduled_at` among pending, unheld items.
    pub async fn next_scheduled_at(&self) -> Result<Option<i64>> {
        let pending: Vec<QueueItem> = self
            .store
            .scan_by_status(QueueStatus::Pending.as_str())
            .await?;
        Ok(pending
            .iter()
            .filter(|item| item.held_by.is_none())
            .map(|item| item.scheduled_at)
            .min())
    }
}

/// Transactional body of [`SyncQueue::enqueue`].
pub fn enqueue_in(docs: &Documents<'_>, item: QueueItem) -> Result<Enqueued> {
    let now = now_millis();
    let Some(mut existing) = active_in(docs, item.entity_type, &item.entity_id)? else {
        docs.put(&item)?;
        tracing::debug!(
            "Enqueued {} {} {}",
            item.operation,
            item.entity_type,
            item.entity_id
        );
        return Ok(Enqueued::Inserted(item));
    };

    existing.priority = existing.priority.max(item.priority);
    existing.updated_at = now;
    if item.remote_id.is_some() {
        existing.remote_id.clone_from(&item.remote_id);
    }

    if existing.status == QueueStatus::Syncing {
        // The in-flight attempt will have created the entity by the time the
        // follow-up runs.
        let operation = match item.operation {
            Operation::Create => Operation::Update,
            other => other,
        };
        let follow_up = match existing.follow_up.take() {
            Some(previous) => FollowUp {
                operation: previous.operation.coalesce(operation).unwrap_or(operation),
                payload: item.payload.or(previous.payload),
                priority: previous.priority.max(item.priority),
            },
            None => FollowUp {
                operation,
                payload: item.payload,
                priority: item.priority,
            },
        };
        existing.follow_up = Some(follow_up);
        docs.put(&existing)?;
        return Ok(Enqueued::FollowUp(existing));
    }

    let Some(operation) = existing.operation.coalesce(item.operation) else {
        docs.delete(Collection::SyncQueue, &existing.id.to_string())?;
        tracing::debug!(
            "Dropped unsynced create for {} {}",
            existing.entity_type,
            existing.entity_id
        );
        return Ok(Enqueued::Cancelled);
    };
    existing.operation = operation;
    if item.payload.is_some() {
        existing.payload = item.payload;
    }
    if existing.status == QueueStatus::Failed {
        existing.status = QueueStatus::Pending;
        existing.retry_count = 0;
        existing.error = None;
        existing.scheduled_at = now;
    }
    docs.put(&existing)?;
    Ok(Enqueued::Coalesced(existing))
}

/// Transactional body of [`SyncQueue::mark_result`].
pub fn mark_result_in(
    docs: &Documents<'_>,
    config: &SyncConfig,
    id: QueueItemId,
    outcome: SyncOutcome,
) -> Result<QueueItem> {
    try_mark_result_in(docs, config, id, outcome)?
        .ok_or_else(|| Error::not_found("queue item", id))
}

/// Like [`mark_result_in`], but `None` when the item was removed meanwhile.
pub fn try_mark_result_in(
    docs: &Documents<'_>,
    config: &SyncConfig,
    id: QueueItemId,
    outcome: SyncOutcome,
) -> Result<Option<QueueItem>> {
    let Some(mut item) = docs.get::<QueueItem>(&id.to_string())? else {
        return Ok(None);
    };
    let now = now_millis();
    item.updated_at = now;

    match outcome {
        SyncOutcome::Success => {
            item.error = None;
            item.retry_count = 0;
            if let Some(follow_up) = item.follow_up.take() {
                item.operation = follow_up.operation;
                if follow_up.payload.is_some() {
                    item.payload = follow_up.payload;
                }
                item.priority = follow_up.priority;
                item.status = QueueStatus::Pending;
                item.scheduled_at = now;
            } else {
                item.status = QueueStatus::Synced;
            }
        }
        SyncOutcome::Failure { error, retryable } => {
            if !absorb_follow_up(&mut item) {
                // A create that never landed was deleted meanwhile
                item.status = QueueStatus::Synced;
                item.error = None;
                docs.put(&item)?;
                return Ok(Some(item));
            }
            item.retry_count += 1;
            if retryable && item.retry_count < item.max_retries {
                item.status = QueueStatus::Pending;
                item.scheduled_at = now + duration_millis(config.backoff(item.retry_count));
                tracing::warn!(
                    "Sync of {} {} failed (attempt {}/{}), retrying: {}",
                    item.entity_type,
                    item.entity_id,
                    item.retry_count,
                    item.max_retries,
                    error
                );
            } else {
                item.status = QueueStatus::Failed;
                tracing::warn!(
                    "Sync of {} {} failed permanently after {} attempt(s): {}",
                    item.entity_type,
                    item.entity_id,
                    item.retry_count,
                    error
                );
            }
            item.error = Some(error);
        }
        SyncOutcome::Deferred { reason } => {
            if !absorb_follow_up(&mut item) {
                item.status = QueueStatus::Synced;
                docs.put(&item)?;
                return Ok(Some(item));
            }
            tracing::debug!("Deferred {} {}: {}", item.entity_type, item.entity_id, reason);
            item.status = QueueStatus::Pending;
            item.scheduled_at = now + duration_millis(Duration::from_millis(config.deferred_delay_ms));
        }
        SyncOutcome::Held { conflict_id } => {
            absorb_follow_up(&mut item);
            item.status = QueueStatus::Pending;
            item.held_by = Some(conflict_id);
            item.error = None;
        }
    }

    docs.put(&item)?;
    Ok(Some(item))
}

/// Transactional body of [`SyncQueue::requeue`].
pub fn requeue_in(docs: &Documents<'_>, id: QueueItemId) -> Result<()> {
    let Some(mut item) = docs.get::<QueueItem>(&id.to_string())? else {
        return Ok(());
    };
    if item.status != QueueStatus::Syncing {
        return Ok(());
    }
    if absorb_follow_up(&mut item) {
        item.status = QueueStatus::Pending;
        item.updated_at = now_millis();
        docs.put(&item)?;
    } else {
        docs.delete(Collection::SyncQueue, &id.to_string())?;
    }
    Ok(())
}

/// Transactional body of [`SyncQueue::release`].
pub fn release_in(docs: &Documents<'_>, conflict_id: ConflictId) -> Result<usize> {
    let now = now_millis();
    let held = docs.scan::<QueueItem, _>(|item| item.held_by == Some(conflict_id))?;
    for mut item in held.iter().cloned() {
        item.held_by = None;
        item.scheduled_at = now;
        item.updated_at = now;
        docs.put(&item)?;
    }
    Ok(held.len())
}

/// The item still carrying work for an entity: pending, syncing or failed.
pub fn active_in(
    docs: &Documents<'_>,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<Option<QueueItem>> {
    let key = crate::models::entity_key(entity_type, entity_id);
    let mut items: Vec<QueueItem> = docs
        .scan_by_owner::<QueueItem>(&key)?
        .into_iter()
        .filter(|item| item.status != QueueStatus::Synced)
        .collect();
    items.sort_by_key(|item| (item.status.is_terminal(), Reverse(item.updated_at)));
    Ok(items.into_iter().next())
}

/// Delete every queue item of an entity, returning how many were removed.
pub fn remove_for_entity_in(
    docs: &Documents<'_>,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<usize> {
    let key = crate::models::entity_key(entity_type, entity_id);
    let mut removed = 0;
    for item in docs.scan_by_owner::<QueueItem>(&key)? {
        if docs.delete(Collection::SyncQueue, &item.id.to_string())? {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Fold a parked follow-up into an item that is no longer in flight.
/// Returns `false` when the two cancel out.
fn absorb_follow_up(item: &mut QueueItem) -> bool {
    let Some(follow_up) = item.follow_up.take() else {
        return true;
    };
    item.priority = item.priority.max(follow_up.priority);
    if follow_up.payload.is_some() {
        item.payload = follow_up.payload;
    }
    match item.operation.coalesce(follow_up.operation) {
        Some(operation) => {
            item.operation = operation;
            true
        }
        None => false,
    }
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
