//! Sync driver: drains the queue against the remote store.
//!
//! A pass moves `Idle -> Checking -> Draining -> Idle`. Only one pass runs at
//! a time; a pass requested while another is running returns a coalesced
//! report immediately. Within a pass, each batch is processed by up to
//! `max_concurrency` workers. The queue never hands out two items for the
//! same entity, and every item's local effects are applied in a single store
//! transaction that re-reads current state, so edits made by the application
//! mid-flight are never overwritten.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;

use super::report::{SkipReason, SyncReport};
use crate::config::SyncConfig;
use crate::conflict::{resolve, Resolution};
use crate::db::{Collection, Documents, LocalStore};
use crate::error::{Error, Result};
use crate::models::{
    Attachment, Conflict, ConflictStatus, DeviceMetadata, EntityType, LocalVersion, Operation,
    QueueItem, QueueItemId, QueueStatus, Record, RemoteVersion, SyncStatus,
};
use crate::network::NetworkMonitor;
use crate::queue::{
    enqueue_in, remove_for_entity_in, try_mark_result_in, SyncOutcome, SyncQueue, PRIORITY_DELETE,
};
use crate::remote::{RemoteAck, RemoteDocument, RemoteError, RemoteStore};
use crate::state::SyncPhase;
use crate::util::now_millis;

/// Drives sync passes for one device.
pub struct SyncDriver {
    worker: Worker,
    device_id: watch::Sender<Arc<str>>,
    network: Arc<dyn NetworkMonitor>,
    pass_lock: Mutex<()>,
    cancel: AtomicBool,
    phase: watch::Sender<SyncPhase>,
}

impl SyncDriver {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteStore>,
        network: Arc<dyn NetworkMonitor>,
        config: Arc<SyncConfig>,
        device: &DeviceMetadata,
    ) -> Self {
        let (phase, _rx) = watch::channel(SyncPhase::Idle);
        let device_id: Arc<str> = Arc::from(device.device_id.as_str());
        let (device_tx, _rx) = watch::channel(Arc::clone(&device_id));
        Self {
            worker: Worker {
                queue: SyncQueue::new(store.clone(), Arc::clone(&config)),
                store,
                remote,
                config,
                device_id,
                aborted: Arc::new(AtomicBool::new(false)),
            },
            device_id: device_tx,
            network,
            pass_lock: Mutex::new(()),
            cancel: AtomicBool::new(false),
            phase,
        }
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.worker.queue
    }

    /// Device whose writes this driver performs.
    pub fn device_id(&self) -> Arc<str> {
        Arc::clone(&self.device_id.borrow())
    }

    /// Switch to a new device identity (after a local wipe).
    pub fn set_device(&self, device: &DeviceMetadata) {
        self.device_id
            .send_replace(Arc::from(device.device_id.as_str()));
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    /// Whether a pass currently holds the pass lock.
    pub fn is_running(&self) -> bool {
        self.pass_lock.try_lock().is_err()
    }

    /// Ask the running pass to stop dispatching new items.
    pub fn cancel(&self) {
        if self.is_running() {
            tracing::info!("Sync cancellation requested");
            self.cancel.store(true, Ordering::SeqCst);
        }
    }

    /// Run one pass.
    ///
    /// Transient remote failures are recorded on the queue items; only local
    /// store failures abort the pass and are returned.
    pub async fn run_pass(&self) -> Result<SyncReport> {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            tracing::debug!("Sync pass already running; coalescing");
            return Ok(SyncReport::coalesced(now_millis()));
        };
        self.cancel.store(false, Ordering::SeqCst);
        self.worker.aborted.store(false, Ordering::SeqCst);

        let mut report = SyncReport::started(now_millis());
        self.set_phase(SyncPhase::Checking);
        let result = self.check_and_drain(&mut report).await;
        self.set_phase(SyncPhase::Idle);
        report.finished_at = now_millis();
        result?;

        if report.ran() {
            tracing::info!("Sync pass finished: {report}");
        } else {
            tracing::debug!("Sync pass finished: {report}");
        }
        Ok(report)
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.phase.send_if_modified(|current| {
            if *current == phase {
                false
            } else {
                *current = phase;
                true
            }
        });
    }

    async fn check_and_drain(&self, report: &mut SyncReport) -> Result<()> {
        if let Some(reason) = self.skip_reason().await? {
            report.skipped = Some(reason);
            return Ok(());
        }

        self.set_phase(SyncPhase::Draining);
        let queue = &self.worker.queue;
        if queue.requeue_in_flight().await? > 0 {
            self.reset_stale_records().await?;
        }

        let mut deferred = HashSet::new();
        // Set once nothing eligible is left for this pass
        let mut drained = false;
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                report.cancelled = true;
                break;
            }
            if !self.network.is_online() {
                tracing::info!("Connectivity lost; stopping sync pass");
                break;
            }

            let batch = queue.dequeue_batch(self.worker.config.batch_size).await?;
            if batch.is_empty() {
                drained = true;
                break;
            }

            // Items deferred earlier in this pass wait for the next one
            let mut fresh = Vec::with_capacity(batch.len());
            for item in batch {
                if deferred.contains(&item.id) {
                    queue.requeue(item.id).await?;
                } else {
                    fresh.push(item);
                }
            }
            if fresh.is_empty() {
                drained = true;
                break;
            }

            self.drain_batch(fresh, report, &mut deferred).await?;
        }

        self.finish_pass(drained).await
    }

    /// Records left `Syncing` by an interrupted pass go back to `Pending`.
    async fn reset_stale_records(&self) -> Result<()> {
        self.worker
            .store
            .transaction(|docs| {
                for mut record in docs.scan_by_status::<Record>(SyncStatus::Syncing.as_str())? {
                    record.sync_status = SyncStatus::Pending;
                    docs.put(&record)?;
                }
                Ok(())
            })
            .await
    }

    async fn skip_reason(&self) -> Result<Option<SkipReason>> {
        let state = self.network.state();
        if !state.online {
            return Ok(Some(SkipReason::Offline));
        }
        if !state.is_usable(self.worker.config.data_saver_min_bandwidth) {
            return Ok(Some(SkipReason::PoorLink));
        }
        if self.worker.config.pause_on_manual_conflict {
            let pending = self
                .worker
                .store
                .count_by_status(Collection::Conflicts, ConflictStatus::Pending.as_str())
                .await?;
            if pending > 0 {
                return Ok(Some(SkipReason::BlockedByConflicts));
            }
        }
        Ok(None)
    }

    async fn drain_batch(
        &self,
        batch: Vec<QueueItem>,
        report: &mut SyncReport,
        deferred: &mut HashSet<QueueItemId>,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.worker.config.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut worker = self.worker.clone();
        worker.device_id = self.device_id();

        for item in batch {
            let permit = if self.should_dispatch() {
                Arc::clone(&semaphore).acquire_owned().await.ok()
            } else {
                None
            };
            // Re-check after waiting for a slot
            let Some(permit) = permit.filter(|_| self.should_dispatch()) else {
                self.worker.queue.requeue(item.id).await?;
                continue;
            };

            let worker = worker.clone();
            tasks.spawn(async move {
                let _permit = permit;
                worker.process(item).await
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|error| Error::Storage(format!("sync worker failed: {error}")))
                .and_then(|result| result);
            match outcome {
                Ok(item) => item.tally(report, deferred),
                Err(error) => {
                    tracing::error!("Aborting sync pass: {error}");
                    first_error.get_or_insert(error);
                }
            }
        }

        if report.cancelled || self.cancel.load(Ordering::SeqCst) {
            report.cancelled = true;
        }
        first_error.map_or(Ok(()), Err)
    }

    fn should_dispatch(&self) -> bool {
        !self.cancel.load(Ordering::SeqCst) && !self.worker.aborted.load(Ordering::SeqCst)
    }

    /// Purge settled items; stamp `last_sync_at` only when the queue was drained.
    async fn finish_pass(&self, drained: bool) -> Result<()> {
        if drained {
            let finished = now_millis();
            let device_id = self.device_id().to_string();
            self.worker
                .store
                .transaction(|docs| {
                    let mut metadata = docs
                        .get::<DeviceMetadata>(DeviceMetadata::KEY)?
                        .unwrap_or_else(|| DeviceMetadata {
                            device_id,
                            created_at: finished,
                            last_sync_at: None,
                        });
                    metadata.last_sync_at = Some(finished);
                    docs.put(&metadata)
                })
                .await?;
        } else {
            tracing::debug!("Sync pass interrupted with work left; last sync time unchanged");
        }

        let retention = std::time::Duration::from_secs(self.worker.config.synced_retention_secs);
        let purged = self.worker.queue.purge_synced(retention).await?;
        if purged > 0 {
            tracing::debug!("Purged {purged} synced queue item(s)");
        }
        Ok(())
    }
}

/// How one item ended up after its attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Synced,
    Retrying,
    Failed,
    Deferred,
    Held,
}

#[derive(Debug, Clone, Copy)]
struct ItemReport {
    item_id: QueueItemId,
    outcome: ItemOutcome,
    resolution: Option<Resolution>,
}

impl ItemReport {
    const fn new(item_id: QueueItemId, outcome: ItemOutcome) -> Self {
        Self {
            item_id,
            outcome,
            resolution: None,
        }
    }

    const fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = Some(resolution);
        self
    }

    fn tally(self, report: &mut SyncReport, deferred: &mut HashSet<QueueItemId>) {
        report.attempted += 1;
        match self.outcome {
            ItemOutcome::Synced => report.succeeded += 1,
            ItemOutcome::Retrying => report.retried += 1,
            ItemOutcome::Failed => report.failed += 1,
            ItemOutcome::Deferred => {
                report.deferred += 1;
                deferred.insert(self.item_id);
            }
            ItemOutcome::Held => {}
        }
        match self.resolution {
            Some(Resolution::KeepLocal | Resolution::KeepRemote) => {
                report.conflicts_detected += 1;
                report.conflicts_auto_resolved += 1;
            }
            Some(Resolution::Manual) => {
                report.conflicts_detected += 1;
                report.conflicts_pending += 1;
            }
            Some(Resolution::NoConflict) | None => {}
        }
    }
}

/// Per-item sync logic, cloned into each worker task.
#[derive(Clone)]
struct Worker {
    store: LocalStore,
    queue: SyncQueue,
    remote: Arc<dyn RemoteStore>,
    config: Arc<SyncConfig>,
    device_id: Arc<str>,
    aborted: Arc<AtomicBool>,
}

impl Worker {
    async fn process(self, item: QueueItem) -> Result<ItemReport> {
        tracing::debug!(
            "Syncing {} {} {} (attempt {})",
            item.operation,
            item.entity_type,
            item.entity_id,
            item.retry_count + 1
        );
        let attempt = match item.entity_type {
            EntityType::Record => self.sync_record(&item).await,
            EntityType::Attachment => self.sync_attachment(&item).await,
        };

        match attempt {
            Ok(report) => Ok(report),
            Err(error) if error.is_storage() => {
                self.aborted.store(true, Ordering::SeqCst);
                Err(error)
            }
            Err(error) => self.record_failure(&item, &error).await,
        }
    }

    /// Record an outcome and settle the owning record. `None` when the item
    /// was removed while in flight.
    fn mark_in(
        &self,
        docs: &Documents<'_>,
        id: QueueItemId,
        outcome: SyncOutcome,
    ) -> Result<Option<QueueItem>> {
        let updated = try_mark_result_in(docs, &self.config, id, outcome)?;
        if let Some(updated) = &updated {
            settle_in(docs, updated)?;
        }
        Ok(updated)
    }

    /// Bound a remote call by the configured timeout.
    async fn call<T>(
        &self,
        call: impl Future<Output = std::result::Result<T, RemoteError>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.remote_timeout(), call).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(RemoteError::Timeout.into()),
        }
    }

    async fn record_failure(&self, item: &QueueItem, error: &Error) -> Result<ItemReport> {
        let outcome = SyncOutcome::failure(error);
        let id = item.id;
        self.store
            .transaction(|docs| {
                let outcome = match self.mark_in(docs, id, outcome)?.map(|item| item.status) {
                    Some(QueueStatus::Failed) => ItemOutcome::Failed,
                    Some(QueueStatus::Pending | QueueStatus::Syncing) => ItemOutcome::Retrying,
                    Some(QueueStatus::Synced) | None => ItemOutcome::Synced,
                };
                Ok(ItemReport::new(id, outcome))
            })
            .await
    }

    /// Mark an item done without touching the record, storing `audit` in the
    /// same transaction.
    async fn finish_plain(&self, item: &QueueItem, audit: Option<Conflict>) -> Result<ItemReport> {
        let id = item.id;
        self.store
            .transaction(|docs| {
                if let Some(audit) = &audit {
                    docs.put(audit)?;
                }
                self.mark_in(docs, id, SyncOutcome::Success)?;
                Ok(ItemReport::new(id, ItemOutcome::Synced))
            })
            .await
    }

    // Records

    async fn sync_record(&self, item: &QueueItem) -> Result<ItemReport> {
        let entity_id = item.entity_id.clone();
        let record = self
            .store
            .transaction(|docs| {
                let Some(mut record) = docs.get::<Record>(&entity_id)? else {
                    return Ok(None);
                };
                record.sync_status = SyncStatus::Syncing;
                docs.put(&record)?;
                Ok(Some(record))
            })
            .await?;

        let Some(record) = record else {
            return self.sync_orphan_delete(item).await;
        };

        match (item.operation, record.remote_id.clone()) {
            (Operation::Delete, _) => self.delete_record(item, &record).await,
            (Operation::Create | Operation::Update, None) => {
                let payload = item_payload(item, &record);
                let ack = self
                    .call(self.remote.put(&self.config.records_collection, None, &payload))
                    .await?;
                self.finish_write(item, ack, None).await
            }
            (Operation::Create | Operation::Update, Some(remote_id)) => {
                self.update_record(item, &record, &remote_id).await
            }
        }
    }

    async fn update_record(
        &self,
        item: &QueueItem,
        record: &Record,
        remote_id: &str,
    ) -> Result<ItemReport> {
        let collection = &self.config.records_collection;
        let payload = item_payload(item, record);

        let Some(remote) = self.call(self.remote.get(collection, remote_id)).await? else {
            tracing::warn!(
                "Record {} is missing remotely; recreating it as {}",
                record.local_id,
                remote_id
            );
            let ack = self
                .call(self.remote.put(collection, Some(remote_id), &payload))
                .await?;
            return self.finish_write(item, ack, None).await;
        };

        let local = self.local_version(record, payload.clone());
        let remote_version = remote_version(&remote);
        let resolution = resolve(
            &local,
            record.base_updated_at,
            &remote_version,
            self.config.conflict_strategy,
        );

        match resolution {
            Resolution::NoConflict | Resolution::KeepLocal => {
                let audit = resolution
                    .is_conflict()
                    .then(|| self.discard_remote(item, local, remote_version));
                let ack = self
                    .call(self.remote.put(collection, Some(remote_id), &payload))
                    .await?;
                Ok(self
                    .finish_write(item, ack, audit)
                    .await?
                    .with_resolution(resolution))
            }
            Resolution::KeepRemote => {
                let audit = self.audit(item, local, remote_version);
                Ok(self
                    .adopt_remote(item, &remote, audit)
                    .await?
                    .with_resolution(resolution))
            }
            Resolution::Manual => {
                let conflict =
                    Conflict::pending(item.entity_id.clone(), item.operation, local, remote_version);
                Ok(self.park(item, conflict).await?.with_resolution(resolution))
            }
        }
    }

    async fn delete_record(&self, item: &QueueItem, record: &Record) -> Result<ItemReport> {
        let collection = &self.config.records_collection;
        let Some(remote_id) = item.remote_id.clone().or_else(|| record.remote_id.clone()) else {
            return self.finish_plain(item, None).await;
        };

        let Some(remote) = self.call(self.remote.get(collection, &remote_id)).await? else {
            return self.finish_plain(item, None).await;
        };

        let local = self.local_version(record, Value::Null);
        let remote_version = remote_version(&remote);
        let resolution = resolve(
            &local,
            record.base_updated_at,
            &remote_version,
            self.config.conflict_strategy,
        );

        match resolution {
            Resolution::NoConflict | Resolution::KeepLocal => {
                let audit = resolution
                    .is_conflict()
                    .then(|| self.discard_remote(item, local, remote_version));
                self.call(self.remote.delete(collection, &remote_id)).await?;
                Ok(self
                    .finish_plain(item, audit)
                    .await?
                    .with_resolution(resolution))
            }
            Resolution::KeepRemote => {
                let audit = self.audit(item, local, remote_version);
                Ok(self
                    .adopt_remote(item, &remote, audit)
                    .await?
                    .with_resolution(resolution))
            }
            Resolution::Manual => {
                let conflict =
                    Conflict::pending(item.entity_id.clone(), item.operation, local, remote_version);
                Ok(self.park(item, conflict).await?.with_resolution(resolution))
            }
        }
    }

    /// Delete for a record whose local row is already gone.
    async fn sync_orphan_delete(&self, item: &QueueItem) -> Result<ItemReport> {
        if item.operation == Operation::Delete {
            if let Some(remote_id) = item.remote_id.as_deref() {
                self.call(
                    self.remote
                        .delete(&self.config.records_collection, remote_id),
                )
                .await?;
            }
        }
        self.finish_plain(item, None).await
    }

    /// Apply a successful record write locally.
    async fn finish_write(
        &self,
        item: &QueueItem,
        ack: RemoteAck,
        audit: Option<Conflict>,
    ) -> Result<ItemReport> {
        let id = item.id;
        let max_retries = self.config.max_retries;
        self.store
            .transaction(|docs| {
                if let Some(audit) = &audit {
                    docs.put(audit)?;
                }
                match docs.get::<Record>(&item.entity_id)? {
                    Some(mut record) => {
                        record.remote_id = Some(ack.remote_id);
                        record.base_updated_at = Some(ack.updated_at);
                        docs.put(&record)?;
                    }
                    None => {
                        // Wiped while the write was in flight
                        let cleanup = QueueItem::new(
                            EntityType::Record,
                            item.entity_id.clone(),
                            Operation::Delete,
                            PRIORITY_DELETE,
                            max_retries,
                        )
                        .with_remote_id(Some(ack.remote_id));
                        enqueue_in(docs, cleanup)?;
                    }
                }
                self.mark_in(docs, id, SyncOutcome::Success)?;
                Ok(ItemReport::new(id, ItemOutcome::Synced))
            })
            .await
    }

    /// Replace the local version with the remote one.
    async fn adopt_remote(
        &self,
        item: &QueueItem,
        remote: &RemoteDocument,
        audit: Conflict,
    ) -> Result<ItemReport> {
        tracing::warn!(
            "Conflict on record {}: remote version from {} kept, local changes discarded",
            item.entity_id,
            remote.actor_id
        );
        let id = item.id;
        self.store
            .transaction(|docs| {
                docs.put(&audit)?;
                let current: Option<QueueItem> = docs.get(&id.to_string())?;
                let edited_meanwhile = current.is_some_and(|current| current.follow_up.is_some());
                if let Some(mut record) = docs.get::<Record>(&item.entity_id)? {
                    if !edited_meanwhile {
                        record.payload = remote.payload.clone();
                        record.is_deleted = false;
                    }
                    record.remote_id = Some(remote.remote_id.clone());
                    record.base_updated_at = Some(remote.updated_at);
                    record.updated_at = record.updated_at.max(remote.updated_at);
                    docs.put(&record)?;
                }
                self.mark_in(docs, id, SyncOutcome::Success)?;
                Ok(ItemReport::new(id, ItemOutcome::Synced))
            })
            .await
    }

    /// Park the item behind a manual conflict.
    async fn park(&self, item: &QueueItem, conflict: Conflict) -> Result<ItemReport> {
        tracing::warn!(
            "Conflict on record {} needs manual resolution ({})",
            item.entity_id,
            conflict.id
        );
        let id = item.id;
        self.store
            .transaction(|docs| {
                docs.put(&conflict)?;
                self.mark_in(
                    docs,
                    id,
                    SyncOutcome::Held {
                        conflict_id: conflict.id,
                    },
                )?;
                Ok(ItemReport::new(id, ItemOutcome::Held))
            })
            .await
    }

    fn local_version(&self, record: &Record, payload: Value) -> LocalVersion {
        LocalVersion {
            payload,
            updated_at: record.updated_at,
            device_id: self.device_id.to_string(),
        }
    }

    /// Audit entry for a conflict the local version won.
    fn discard_remote(
        &self,
        item: &QueueItem,
        local: LocalVersion,
        remote: RemoteVersion,
    ) -> Conflict {
        tracing::warn!(
            "Conflict on record {}: local version kept, remote version from {} (updated_at {}) discarded",
            item.entity_id,
            remote.actor_id,
            remote.updated_at
        );
        self.audit(item, local, remote)
    }

    fn audit(&self, item: &QueueItem, local: LocalVersion, remote: RemoteVersion) -> Conflict {
        Conflict::auto_resolved(
            item.entity_id.clone(),
            item.operation,
            local,
            remote,
            self.config.conflict_strategy,
        )
    }

    // Attachments

    async fn sync_attachment(&self, item: &QueueItem) -> Result<ItemReport> {
        let collection = &self.config.attachments_collection;
        if item.operation == Operation::Delete {
            if let Some(remote_id) = item.remote_id.as_deref() {
                self.call(self.remote.delete(collection, remote_id)).await?;
            }
            return self.finish_plain(item, None).await;
        }

        let Some(attachment) = self.store.get::<Attachment>(&item.entity_id).await? else {
            return self.finish_plain(item, None).await;
        };
        let parent: Option<Record> = self.store.get(&attachment.record_id.to_string()).await?;
        let Some(parent) = parent.filter(|parent| !parent.is_deleted) else {
            return self.finish_plain(item, None).await;
        };
        let Some(parent_remote_id) = parent.remote_id else {
            return self
                .defer(item, "parent record has not reached the remote store")
                .await;
        };

        let payload = json!({
            "record_remote_id": parent_remote_id,
            "record_local_id": attachment.record_id,
            "mime_type": attachment.mime_type,
            "size_bytes": attachment.size_bytes,
            "data": STANDARD.encode(&attachment.blob),
        });
        let ack = self
            .call(
                self.remote
                    .put(collection, attachment.remote_id.as_deref(), &payload),
            )
            .await?;

        let id = item.id;
        let max_retries = self.config.max_retries;
        self.store
            .transaction(|docs| {
                match docs.get::<Attachment>(&item.entity_id)? {
                    Some(mut attachment) => {
                        attachment.uploaded = true;
                        attachment.upload_progress = 100;
                        attachment.remote_id = Some(ack.remote_id);
                        docs.put(&attachment)?;
                    }
                    None => {
                        // Deleted during upload: remove the remote copy next
                        let cleanup = QueueItem::new(
                            EntityType::Attachment,
                            item.entity_id.clone(),
                            Operation::Delete,
                            PRIORITY_DELETE,
                            max_retries,
                        )
                        .with_remote_id(Some(ack.remote_id));
                        enqueue_in(docs, cleanup)?;
                    }
                }
                self.mark_in(docs, id, SyncOutcome::Success)?;
                Ok(ItemReport::new(id, ItemOutcome::Synced))
            })
            .await
    }

    async fn defer(&self, item: &QueueItem, reason: &str) -> Result<ItemReport> {
        let id = item.id;
        let outcome = SyncOutcome::Deferred {
            reason: reason.to_string(),
        };
        self.store
            .transaction(|docs| {
                let outcome = match self.mark_in(docs, id, outcome)? {
                    Some(updated) if updated.status == QueueStatus::Pending => {
                        ItemOutcome::Deferred
                    }
                    _ => ItemOutcome::Synced,
                };
                Ok(ItemReport::new(id, outcome))
            })
            .await
    }
}

fn item_payload(item: &QueueItem, record: &Record) -> Value {
    item.payload
        .clone()
        .unwrap_or_else(|| record.payload.clone())
}

fn remote_version(remote: &RemoteDocument) -> RemoteVersion {
    RemoteVersion {
        payload: remote.payload.clone(),
        updated_at: remote.updated_at,
        actor_id: remote.actor_id.clone(),
    }
}

/// Bring a record in line with its queue item after an attempt.
///
/// A tombstoned record whose work is finished is removed together with its
/// attachments.
pub(crate) fn settle_in(docs: &Documents<'_>, item: &QueueItem) -> Result<()> {
    if item.entity_type != EntityType::Record {
        return Ok(());
    }
    let Some(mut record) = docs.get::<Record>(&item.entity_id)? else {
        return Ok(());
    };

    record.retry_count = item.retry_count;
    record.sync_status = match item.status {
        QueueStatus::Synced if record.is_deleted => {
            purge_record_in(docs, &record)?;
            return Ok(());
        }
        QueueStatus::Synced => SyncStatus::Synced,
        QueueStatus::Pending if item.held_by.is_some() => SyncStatus::Conflicted,
        QueueStatus::Pending => SyncStatus::Pending,
        QueueStatus::Syncing => SyncStatus::Syncing,
        QueueStatus::Failed => SyncStatus::Failed,
    };
    docs.put(&record)
}

/// Hard-delete a record and everything it owns.
pub(crate) fn purge_record_in(docs: &Documents<'_>, record: &Record) -> Result<()> {
    let key = record.local_id.to_string();
    for attachment in docs.scan_by_owner::<Attachment>(&key)? {
        let attachment_key = attachment.id.to_string();
        remove_for_entity_in(docs, EntityType::Attachment, &attachment_key)?;
        docs.delete(Collection::Attachments, &attachment_key)?;
    }
    docs.delete(Collection::Records, &key)?;
    tracing::debug!("Removed record {key} from the local store");
    Ok(())
}
