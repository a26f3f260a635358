//! Application-facing sync facade.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Mutex};

use super::scheduler::{self, SchedulerHandle};
use crate::config::SyncConfig;
use crate::conflict::{resolve, Resolution};
use crate::db::{Collection, Documents, LocalStore};
use crate::error::{Error, Result};
use crate::models::{
    Attachment, AttachmentId, Conflict, ConflictId, ConflictStatus, DeviceMetadata, EntityType,
    Operation, QueueItem, QueueStatus, Record, RecordId, ResolutionStrategy, SyncStatus,
};
use crate::network::{NetworkMonitor, NetworkState};
use crate::queue::{
    active_in, enqueue_in, release_in, remove_for_entity_in, Enqueued, SyncQueue,
    PRIORITY_ATTACHMENT, PRIORITY_CREATE, PRIORITY_DELETE, PRIORITY_UPDATE,
};
use crate::remote::RemoteStore;
use crate::state::SyncPhase;
use crate::sync::{purge_record_in, settle_in, SyncDriver, SyncReport};
use crate::util::now_millis;

/// Snapshot published to status subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    /// Queue items waiting or in flight
    pub pending: usize,
    /// Queue items that exhausted their retries
    pub failed: usize,
    /// Conflicts awaiting manual resolution
    pub conflicts: usize,
    pub in_progress: bool,
    pub last_sync_at: Option<i64>,
}

struct Inner {
    store: LocalStore,
    queue: SyncQueue,
    driver: SyncDriver,
    network: Arc<dyn NetworkMonitor>,
    config: Arc<SyncConfig>,
    status: watch::Sender<EngineStatus>,
    scheduler: Mutex<Option<SchedulerHandle>>,
}

/// Offline-first record store with background synchronization.
///
/// Every mutation is written to the local store together with its queue item
/// in one transaction, so it survives restarts and is replayed against the
/// remote store once connectivity allows.
#[derive(Clone)]
pub struct SyncService {
    inner: Arc<Inner>,
}

impl SyncService {
    /// Open the service over an existing local store.
    pub async fn open(
        store: LocalStore,
        remote: Arc<dyn RemoteStore>,
        network: Arc<dyn NetworkMonitor>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let device = Self::load_device(&store).await?;
        let driver = SyncDriver::new(
            store.clone(),
            remote,
            Arc::clone(&network),
            Arc::clone(&config),
            &device,
        );
        let (status, _rx) = watch::channel(EngineStatus::default());

        let service = Self {
            inner: Arc::new(Inner {
                queue: SyncQueue::new(store.clone(), Arc::clone(&config)),
                store,
                driver,
                network,
                config,
                status,
                scheduler: Mutex::new(None),
            }),
        };
        service.publish_status().await?;
        Ok(service)
    }

    /// Device metadata stored in `store`, generated and persisted on first use.
    pub async fn load_device(store: &LocalStore) -> Result<DeviceMetadata> {
        store
            .transaction(|docs| {
                if let Some(existing) = docs.get::<DeviceMetadata>(DeviceMetadata::KEY)? {
                    return Ok(existing);
                }
                let generated = DeviceMetadata::generate();
                docs.put(&generated)?;
                tracing::info!("Initialised device {}", generated.device_id);
                Ok(generated)
            })
            .await
    }

    /// Open the service with an on-disk store at `db_path`.
    pub async fn open_path(
        db_path: impl Into<PathBuf>,
        remote: Arc<dyn RemoteStore>,
        network: Arc<dyn NetworkMonitor>,
        config: SyncConfig,
    ) -> Result<Self> {
        let store = LocalStore::open_path(db_path)?;
        Self::open(store, remote, network, config).await
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    pub fn device_id(&self) -> Arc<str> {
        self.inner.driver.device_id()
    }

    pub fn network_state(&self) -> NetworkState {
        self.inner.network.state()
    }

    /// Where the driver currently is within a pass.
    pub fn phase(&self) -> SyncPhase {
        self.inner.driver.phase()
    }

    /// Receiver notified on every `Idle`/`Checking`/`Draining` transition.
    pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
        self.inner.driver.subscribe_phase()
    }

    pub(super) fn network(&self) -> &Arc<dyn NetworkMonitor> {
        &self.inner.network
    }

    // Mutations

    /// Create a record and queue it for upload.
    pub async fn create(&self, payload: Value) -> Result<Record> {
        self.validate_payload(&payload)?;
        let record = Record::new(self.device_id().to_string(), payload.clone());
        let item = self
            .queue_item(EntityType::Record, record.local_id.to_string(), Operation::Create)
            .with_payload(payload);

        self.inner
            .store
            .transaction(|docs| {
                docs.put(&record)?;
                enqueue_in(docs, item)?;
                Ok(())
            })
            .await?;

        tracing::debug!("Created record {}", record.local_id);
        self.after_mutation().await?;
        Ok(record)
    }

    /// Replace a record's payload.
    pub async fn update(&self, local_id: RecordId, payload: Value) -> Result<Record> {
        self.validate_payload(&payload)?;
        let max_retries = self.inner.config.max_retries;

        let record = self
            .inner
            .store
            .transaction(|docs| {
                let mut record = live_record_in(docs, local_id)?;
                record.touch(payload.clone());

                let operation = if record.is_remote() {
                    Operation::Update
                } else {
                    Operation::Create
                };
                let item = QueueItem::new(
                    EntityType::Record,
                    record.local_id.to_string(),
                    operation,
                    PRIORITY_UPDATE,
                    max_retries,
                )
                .with_payload(payload);

                enqueue_in(docs, item)?;
                docs.put(&record)?;
                Ok(record)
            })
            .await?;

        tracing::debug!("Updated record {}", record.local_id);
        self.after_mutation().await?;
        Ok(record)
    }

    /// Delete a record and its attachments.
    ///
    /// A record that never reached the remote store is removed immediately.
    /// Otherwise it is tombstoned until the remote delete succeeds.
    pub async fn delete(&self, local_id: RecordId) -> Result<()> {
        let max_retries = self.inner.config.max_retries;

        self.inner
            .store
            .transaction(|docs| {
                let mut record = live_record_in(docs, local_id)?;
                let key = record.local_id.to_string();
                let active = active_in(docs, EntityType::Record, &key)?;
                let in_flight = active
                    .as_ref()
                    .is_some_and(|item| item.status == QueueStatus::Syncing);

                if !record.is_remote() && !in_flight {
                    remove_for_entity_in(docs, EntityType::Record, &key)?;
                    purge_record_in(docs, &record)?;
                    return Ok(());
                }

                cascade_attachments_in(docs, &record, max_retries)?;

                record.is_deleted = true;
                record.updated_at = now_millis().max(record.updated_at);
                if !in_flight {
                    record.sync_status = SyncStatus::Pending;
                }
                let item = QueueItem::new(
                    EntityType::Record,
                    key,
                    Operation::Delete,
                    PRIORITY_DELETE,
                    max_retries,
                )
                .with_remote_id(record.remote_id.clone());

                if matches!(enqueue_in(docs, item)?, Enqueued::Cancelled) {
                    purge_record_in(docs, &record)?;
                } else {
                    docs.put(&record)?;
                }
                Ok(())
            })
            .await?;

        tracing::debug!("Deleted record {local_id}");
        self.after_mutation().await
    }

    /// Attach a blob to a record.
    pub async fn attach(
        &self,
        record_id: RecordId,
        blob: Vec<u8>,
        mime_type: &str,
    ) -> Result<AttachmentId> {
        if blob.len() > self.inner.config.max_attachment_bytes {
            return Err(Error::Validation(format!(
                "attachment is {} bytes; the limit is {}",
                blob.len(),
                self.inner.config.max_attachment_bytes
            )));
        }
        let attachment = Attachment::new(record_id, blob, mime_type)?;
        let item = self.queue_item(
            EntityType::Attachment,
            attachment.id.to_string(),
            Operation::Create,
        );

        self.inner
            .store
            .transaction(|docs| {
                live_record_in(docs, record_id)?;
                docs.put(&attachment)?;
                enqueue_in(docs, item)?;
                Ok(())
            })
            .await?;

        tracing::debug!(
            "Attached {} ({} bytes) to record {}",
            attachment.mime_type,
            attachment.size_bytes,
            record_id
        );
        self.after_mutation().await?;
        Ok(attachment.id)
    }

    // Queries

    /// A live (not deleted) record.
    pub async fn get(&self, local_id: RecordId) -> Result<Option<Record>> {
        let record: Option<Record> = self.inner.store.get(&local_id.to_string()).await?;
        Ok(record.filter(|record| !record.is_deleted))
    }

    /// Live records, most recently updated first.
    pub async fn list_records(&self, limit: usize, offset: usize) -> Result<Vec<Record>> {
        let mut records = self
            .inner
            .store
            .scan(|record: &Record| !record.is_deleted)
            .await?;
        records.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.local_id.cmp(&a.local_id))
        });
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    pub async fn list_attachments(&self, record_id: RecordId) -> Result<Vec<Attachment>> {
        let mut attachments: Vec<Attachment> = self
            .inner
            .store
            .scan_by_owner(&record_id.to_string())
            .await?;
        attachments.sort_by_key(|attachment| (attachment.created_at, attachment.id));
        Ok(attachments)
    }

    /// Conflicts, newest first, optionally filtered by status.
    pub async fn list_conflicts(&self, status: Option<ConflictStatus>) -> Result<Vec<Conflict>> {
        let mut conflicts: Vec<Conflict> = match status {
            Some(status) => self.inner.store.scan_by_status(status.as_str()).await?,
            None => self.inner.store.scan(|_: &Conflict| true).await?,
        };
        conflicts.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        Ok(conflicts)
    }

    /// Queue items in the given state.
    pub async fn queue_items(&self, status: QueueStatus) -> Result<Vec<QueueItem>> {
        self.inner.queue.items(status).await
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        let store = &self.inner.store;
        // Items held by a manual conflict are reported under `conflicts`
        let waiting = store
            .scan_by_status::<QueueItem>(QueueStatus::Pending.as_str())
            .await?
            .iter()
            .filter(|item| item.held_by.is_none())
            .count();
        let pending = waiting
            + store
                .count_by_status(Collection::SyncQueue, QueueStatus::Syncing.as_str())
                .await?;
        let failed = store
            .count_by_status(Collection::SyncQueue, QueueStatus::Failed.as_str())
            .await?;
        let conflicts = store
            .count_by_status(Collection::Conflicts, ConflictStatus::Pending.as_str())
            .await?;
        let metadata: Option<DeviceMetadata> = store.get(DeviceMetadata::KEY).await?;

        Ok(EngineStatus {
            pending,
            failed,
            conflicts,
            in_progress: self.inner.driver.is_running(),
            last_sync_at: metadata.and_then(|metadata| metadata.last_sync_at),
        })
    }

    /// Receiver notified whenever the status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.inner.status.subscribe()
    }

    // Sync control

    /// Run a sync pass now.
    ///
    /// Returns a coalesced report when a pass is already running.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        if !self.inner.driver.is_running() {
            self.inner.status.send_if_modified(|status| {
                let changed = !status.in_progress;
                status.in_progress = true;
                changed
            });
        }
        let result = self.inner.driver.run_pass().await;
        self.publish_status().await?;
        result
    }

    /// Stop dispatching new items in the running pass.
    pub fn cancel_sync(&self) {
        self.inner.driver.cancel();
    }

    /// Give every failed item a fresh retry budget.
    pub async fn retry_failed(&self) -> Result<usize> {
        let revived = self.inner.queue.retry_failed().await?;
        self.inner
            .store
            .transaction(|docs| {
                for item in &revived {
                    settle_in(docs, item)?;
                }
                Ok(())
            })
            .await?;

        if !revived.is_empty() {
            tracing::info!("Re-armed {} failed item(s)", revived.len());
        }
        self.after_mutation().await?;
        Ok(revived.len())
    }

    /// Settle a pending conflict.
    ///
    /// `LocalWins` and `Manual` (with `merged_payload`) push the chosen
    /// version to the remote store on the next pass; `RemoteWins` adopts the
    /// remote version locally; `LatestWins` picks by timestamp.
    pub async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        strategy: ResolutionStrategy,
        merged_payload: Option<Value>,
    ) -> Result<()> {
        if let Some(payload) = &merged_payload {
            self.validate_payload(payload)?;
        }
        let resolved_by = self.device_id().to_string();

        self.inner
            .store
            .transaction(|docs| {
                let mut conflict = pending_conflict_in(docs, conflict_id)?;
                let choice = match (strategy, merged_payload) {
                    (ResolutionStrategy::Manual, Some(payload)) => Choice::Merged(payload),
                    (ResolutionStrategy::Manual, None) => {
                        return Err(Error::Conflict(
                            "manual resolution requires a merged payload".to_string(),
                        ));
                    }
                    (ResolutionStrategy::LocalWins, _) => Choice::Local,
                    (ResolutionStrategy::RemoteWins, _) => Choice::Remote,
                    (ResolutionStrategy::LatestWins, _) => {
                        match resolve(
                            &conflict.local_version,
                            None,
                            &conflict.remote_version,
                            strategy,
                        ) {
                            Resolution::KeepRemote => Choice::Remote,
                            _ => Choice::Local,
                        }
                    }
                };

                apply_choice_in(docs, &conflict, choice)?;

                conflict.status = ConflictStatus::Resolved;
                conflict.resolution_strategy = strategy;
                conflict.resolved_by = Some(resolved_by);
                conflict.resolved_at = Some(now_millis());
                docs.put(&conflict)
            })
            .await?;

        tracing::info!("Resolved conflict {conflict_id} ({strategy})");
        self.after_mutation().await
    }

    /// Dismiss a pending conflict; the local version proceeds.
    pub async fn dismiss_conflict(&self, conflict_id: ConflictId) -> Result<()> {
        let resolved_by = self.device_id().to_string();
        self.inner
            .store
            .transaction(|docs| {
                let mut conflict = pending_conflict_in(docs, conflict_id)?;
                apply_choice_in(docs, &conflict, Choice::Local)?;
                conflict.status = ConflictStatus::Ignored;
                conflict.resolved_by = Some(resolved_by);
                conflict.resolved_at = Some(now_millis());
                docs.put(&conflict)
            })
            .await?;

        tracing::info!("Dismissed conflict {conflict_id}");
        self.after_mutation().await
    }

    // Lifecycle

    /// Start the background scheduler. Calling it again is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut scheduler = self.inner.scheduler.lock().await;
        if scheduler.is_none() {
            *scheduler = Some(scheduler::spawn(self.clone()));
            tracing::info!("Background sync started");
        }
        Ok(())
    }

    /// Stop the scheduler and wait for it to exit.
    pub async fn shutdown(&self) {
        let handle = self.inner.scheduler.lock().await.take();
        if let Some(handle) = handle {
            self.inner.driver.cancel();
            handle.stop().await;
            tracing::info!("Background sync stopped");
        }
    }

    /// Erase every local collection and start over with a new device id.
    pub async fn wipe_local_data(&self) -> Result<DeviceMetadata> {
        if self.inner.driver.is_running() {
            return Err(Error::Conflict(
                "cannot wipe local data while a sync pass is running".to_string(),
            ));
        }

        let device = self
            .inner
            .store
            .transaction(|docs| {
                for collection in Collection::ALL {
                    docs.clear(collection)?;
                }
                let device = DeviceMetadata::generate();
                docs.put(&device)?;
                Ok(device)
            })
            .await?;
        self.inner.driver.set_device(&device);

        tracing::warn!("Local data wiped; new device id {}", device.device_id);
        self.publish_status().await?;
        Ok(device)
    }

    // Internals

    /// When the earliest waiting queue item becomes eligible to sync.
    pub async fn next_attempt_at(&self) -> Result<Option<i64>> {
        self.inner.queue.next_scheduled_at().await
    }

    async fn after_mutation(&self) -> Result<()> {
        self.publish_status().await?;
        self.trigger().await;
        Ok(())
    }

    /// Nudge the scheduler if it is running and the device is online.
    async fn trigger(&self) {
        if !self.inner.network.is_online() {
            return;
        }
        if let Some(handle) = self.inner.scheduler.lock().await.as_ref() {
            handle.trigger();
        }
    }

    async fn publish_status(&self) -> Result<EngineStatus> {
        let status = self.status().await?;
        self.inner.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status.clone();
                true
            }
        });
        Ok(status)
    }

    fn queue_item(&self, entity_type: EntityType, entity_id: String, operation: Operation) -> QueueItem {
        let priority = match entity_type {
            EntityType::Attachment => PRIORITY_ATTACHMENT,
            EntityType::Record => PRIORITY_CREATE,
        };
        QueueItem::new(
            entity_type,
            entity_id,
            operation,
            priority,
            self.inner.config.max_retries,
        )
    }

    fn validate_payload(&self, payload: &Value) -> Result<()> {
        if !payload.is_object() {
            return Err(Error::Validation(
                "record payload must be a JSON object".to_string(),
            ));
        }
        let size = serde_json::to_vec(payload)?.len();
        if size > self.inner.config.max_payload_bytes {
            return Err(Error::Validation(format!(
                "record payload is {size} bytes; the limit is {}",
                self.inner.config.max_payload_bytes
            )));
        }
        Ok(())
    }
}

/// Version chosen when settling a conflict.
enum Choice {
    Local,
    Remote,
    Merged(Value),
}

fn live_record_in(docs: &Documents<'_>, local_id: RecordId) -> Result<Record> {
    docs.get::<Record>(&local_id.to_string())?
        .filter(|record| !record.is_deleted)
        .ok_or_else(|| Error::not_found("record", local_id))
}

fn pending_conflict_in(docs: &Documents<'_>, conflict_id: ConflictId) -> Result<Conflict> {
    let conflict = docs
        .get::<Conflict>(&conflict_id.to_string())?
        .ok_or_else(|| Error::not_found("conflict", conflict_id))?;
    if !conflict.is_pending() {
        return Err(Error::Conflict(format!(
            "conflict {conflict_id} is already {}",
            conflict.status
        )));
    }
    Ok(conflict)
}

/// Apply the chosen version to the record and the queue item held by the
/// conflict, then release the hold.
fn apply_choice_in(docs: &Documents<'_>, conflict: &Conflict, choice: Choice) -> Result<()> {
    let remote = &conflict.remote_version;
    let held = docs.scan::<QueueItem, _>(|item| item.held_by == Some(conflict.id))?;
    let record = docs.get::<Record>(&conflict.entity_id)?;
    let now = now_millis();

    let Some(mut record) = record else {
        for item in &held {
            docs.delete(Collection::SyncQueue, &item.id.to_string())?;
        }
        return Ok(());
    };
    record.base_updated_at = Some(remote.updated_at);
    record.retry_count = 0;

    match choice {
        Choice::Remote => {
            record.payload = remote.payload.clone();
            record.is_deleted = false;
            record.updated_at = record.updated_at.max(remote.updated_at);
            record.sync_status = SyncStatus::Synced;
            for mut item in held {
                item.held_by = None;
                item.follow_up = None;
                item.status = QueueStatus::Synced;
                item.updated_at = now;
                docs.put(&item)?;
            }
            docs.put(&record)?;
            return Ok(());
        }
        Choice::Merged(payload) => {
            record.payload = payload.clone();
            record.is_deleted = false;
            record.updated_at = now.max(record.updated_at);
            for mut item in held.iter().cloned() {
                item.operation = Operation::Update;
                item.payload = Some(payload.clone());
                item.priority = item.priority.max(PRIORITY_UPDATE);
                docs.put(&item)?;
            }
        }
        Choice::Local => {
            if !record.is_deleted {
                for mut item in held.iter().cloned() {
                    item.payload = Some(record.payload.clone());
                    docs.put(&item)?;
                }
            }
        }
    }

    record.sync_status = SyncStatus::Pending;
    docs.put(&record)?;
    release_in(docs, conflict.id)?;
    Ok(())
}

/// Remove a deleted record's attachments, queueing remote deletes for the
/// ones already uploaded.
fn cascade_attachments_in(docs: &Documents<'_>, record: &Record, max_retries: u32) -> Result<()> {
    for attachment in docs.scan_by_owner::<Attachment>(&record.local_id.to_string())? {
        let key = attachment.id.to_string();
        let in_flight = active_in(docs, EntityType::Attachment, &key)?
            .is_some_and(|item| item.status == QueueStatus::Syncing);
        if !in_flight {
            remove_for_entity_in(docs, EntityType::Attachment, &key)?;
        }
        if attachment.remote_id.is_some() {
            let item = QueueItem::new(
                EntityType::Attachment,
                key.clone(),
                Operation::Delete,
                PRIORITY_DELETE,
                max_retries,
            )
            .with_remote_id(attachment.remote_id.clone());
            enqueue_in(docs, item)?;
        }
        docs.delete(Collection::Attachments, &key)?;
    }
    Ok(())
}
