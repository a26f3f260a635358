use std::io;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tracing_subscriber::fmt::MakeWriter;

use super::*;
use crate::config::SyncConfig;
use crate::db::LocalStore;
use crate::error::Error;
use crate::models::{ConflictStatus, QueueStatus, Record, ResolutionStrategy, SyncStatus};
use crate::network::{BandwidthClass, ConnectionType, LinkQuality, ManualNetworkMonitor};
use crate::remote::{MemoryRemoteStore, RemoteAck, RemoteDocument, RemoteError, RemoteStore};
use crate::state::SyncPhase;
use crate::sync::SkipReason;
use crate::util::now_millis;

struct Harness {
    service: SyncService,
    remote: MemoryRemoteStore,
    network: Arc<ManualNetworkMonitor>,
}

fn fast_config() -> SyncConfig {
    SyncConfig {
        backoff_base_ms: 10,
        backoff_cap_ms: 50,
        deferred_delay_ms: 0,
        poll_interval_secs: 0,
        ..SyncConfig::default()
    }
}

async fn harness(config: SyncConfig) -> Harness {
    let remote = MemoryRemoteStore::new("device-a");
    let network = Arc::new(ManualNetworkMonitor::online());
    let service = SyncService::open(
        LocalStore::open_in_memory().unwrap(),
        Arc::new(remote.clone()),
        network.clone(),
        config,
    )
    .await
    .unwrap();
    Harness {
        service,
        remote,
        network,
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met within 5s");
}

async fn wait_for_documents(remote: &MemoryRemoteStore, collection: &str, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while remote.documents(collection).await.len() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("remote store did not reach the expected document count");
}

async fn stored_record(service: &SyncService, record: &Record) -> Option<Record> {
    service
        .store()
        .get::<Record>(&record.local_id.to_string())
        .await
        .unwrap()
}

async fn remote_payload(remote: &MemoryRemoteStore, record: &Record) -> Value {
    let remote_id = record.remote_id.as_deref().expect("record has a remote id");
    remote
        .document("records", remote_id)
        .await
        .expect("remote document exists")
        .payload
}

/// Synced record whose remote copy was then rewritten by another device.
async fn diverged(h: &Harness, local_first: bool) -> Record {
    let record = h.service.create(json!({"status": "draft"})).await.unwrap();
    h.service.sync_now().await.unwrap();
    let synced = h.service.get(record.local_id).await.unwrap().unwrap();
    let remote_id = synced.remote_id.clone().unwrap();
    let other_device = h.remote.with_actor("device-b");

    if local_first {
        h.service
            .update(record.local_id, json!({"status": "local"}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        other_device
            .put("records", Some(remote_id.as_str()), &json!({"status": "remote"}))
            .await
            .unwrap();
    } else {
        other_device
            .put("records", Some(remote_id.as_str()), &json!({"status": "remote"}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.service
            .update(record.local_id, json!({"status": "local"}))
            .await
            .unwrap();
    }
    synced
}

#[tokio::test(flavor = "multi_thread")]
async fn record_lifecycle_reaches_remote_store() {
    let h = harness(fast_config()).await;

    let record = h.service.create(json!({"site": "north"})).await.unwrap();
    assert_eq!(record.sync_status, SyncStatus::Pending);
    assert_eq!(h.service.status().await.unwrap().pending, 1);

    let report = h.service.sync_now().await.unwrap();
    assert_eq!(report.succeeded, 1);
    let synced = h.service.get(record.local_id).await.unwrap().unwrap();
    assert_eq!(synced.sync_status, SyncStatus::Synced);
    assert_eq!(remote_payload(&h.remote, &synced).await, json!({"site": "north"}));

    h.service
        .update(record.local_id, json!({"site": "south"}))
        .await
        .unwrap();
    h.service.sync_now().await.unwrap();
    assert_eq!(remote_payload(&h.remote, &synced).await, json!({"site": "south"}));

    h.service.delete(record.local_id).await.unwrap();
    assert!(h.service.get(record.local_id).await.unwrap().is_none());
    assert!(stored_record(&h.service, &record).await.is_some());

    h.service.sync_now().await.unwrap();
    assert!(h.remote.documents("records").await.is_empty());
    assert!(stored_record(&h.service, &record).await.is_none());

    let status = h.service.status().await.unwrap();
    assert_eq!(status.pending, 0);
    assert!(status.last_sync_at.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_edits_coalesce_into_one_write() {
    let h = harness(fast_config()).await;
    h.network.set_online(false);

    let record = h.service.create(json!({"v": 1})).await.unwrap();
    h.service.update(record.local_id, json!({"v": 2})).await.unwrap();
    h.service.update(record.local_id, json!({"v": 3})).await.unwrap();

    let pending = h.service.queue_items(QueueStatus::Pending).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payload, Some(json!({"v": 3})));

    let report = h.service.sync_now().await.unwrap();
    assert_eq!(report.skipped, Some(SkipReason::Offline));
    assert_eq!(h.remote.call_count(), 0);

    h.network.set_online(true);
    let report = h.service.sync_now().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(h.remote.call_count(), 1);

    let documents = h.remote.documents("records").await;
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].payload, json!({"v": 3}));
}

#[tokio::test(flavor = "multi_thread")]
async fn create_then_delete_offline_never_reaches_remote() {
    let h = harness(fast_config()).await;
    h.network.set_online(false);

    let record = h.service.create(json!({"draft": true})).await.unwrap();
    h.service.delete(record.local_id).await.unwrap();

    assert!(stored_record(&h.service, &record).await.is_none());
    assert_eq!(h.service.status().await.unwrap().pending, 0);

    h.network.set_online(true);
    let report = h.service.sync_now().await.unwrap();
    assert_eq!(report.attempted, 0);
    assert_eq!(h.remote.call_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_now_while_running_is_coalesced() {
    let h = harness(fast_config()).await;
    h.service.create(json!({"n": 1})).await.unwrap();

    h.remote.pause();
    let service = h.service.clone();
    let running = tokio::spawn(async move { service.sync_now().await });
    wait_for(|| h.remote.waiting_calls() == 1).await;

    assert!(h.service.status().await.unwrap().in_progress);
    let second = h.service.sync_now().await.unwrap();
    assert!(second.coalesced);
    assert!(!second.ran());

    h.remote.resume();
    let first = running.await.unwrap().unwrap();
    assert_eq!(first.succeeded, 1);
    assert_eq!(h.remote.call_count(), 1);
    assert!(!h.service.status().await.unwrap().in_progress);
}

#[tokio::test(flavor = "multi_thread")]
async fn edit_made_mid_flight_is_synced_afterwards() {
    let h = harness(fast_config()).await;
    let record = h.service.create(json!({"rev": 1})).await.unwrap();

    h.remote.pause();
    let service = h.service.clone();
    let running = tokio::spawn(async move { service.sync_now().await });
    wait_for(|| h.remote.waiting_calls() == 1).await;

    h.service
        .update(record.local_id, json!({"rev": 2}))
        .await
        .unwrap();
    h.remote.resume();
    let report = running.await.unwrap().unwrap();
    assert_eq!(report.succeeded, 2);

    let synced = h.service.get(record.local_id).await.unwrap().unwrap();
    assert_eq!(synced.payload, json!({"rev": 2}));
    assert_eq!(synced.sync_status, SyncStatus::Synced);
    assert_eq!(h.remote.documents("records").await.len(), 1);
    assert_eq!(remote_payload(&h.remote, &synced).await, json!({"rev": 2}));
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_failures_stop_at_max_retries() {
    let h = harness(SyncConfig {
        max_retries: 3,
        ..fast_config()
    })
    .await;
    h.remote.set_unavailable(true).await;
    let record = h.service.create(json!({"n": 1})).await.unwrap();

    let mut reports = Vec::new();
    for _ in 0..3 {
        reports.push(h.service.sync_now().await.unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(reports[0].retried, 1);
    assert_eq!(reports[1].retried, 1);
    assert_eq!(reports[2].failed, 1);

    let failed = h.service.queue_items(QueueStatus::Failed).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].retry_count, 3);
    assert!(failed[0].error.is_some());
    let stuck = stored_record(&h.service, &record).await.unwrap();
    assert_eq!(stuck.sync_status, SyncStatus::Failed);
    assert_eq!(h.service.status().await.unwrap().failed, 1);

    // Failed items stay put until retried explicitly
    let idle = h.service.sync_now().await.unwrap();
    assert_eq!(idle.attempted, 0);

    h.remote.set_unavailable(false).await;
    assert_eq!(h.service.retry_failed().await.unwrap(), 1);
    let revived = stored_record(&h.service, &record).await.unwrap();
    assert_eq!(revived.sync_status, SyncStatus::Pending);
    assert_eq!(revived.retry_count, 0);

    let report = h.service.sync_now().await.unwrap();
    assert_eq!(report.succeeded, 1);
    let synced = stored_record(&h.service, &record).await.unwrap();
    assert_eq!(synced.sync_status, SyncStatus::Synced);
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_write_fails_immediately() {
    let h = harness(fast_config()).await;
    h.remote
        .fail_next(1, RemoteError::Rejected("payload rejected".into()))
        .await;
    h.service.create(json!({"n": 1})).await.unwrap();

    let report = h.service.sync_now().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.retried, 0);
    assert_eq!(h.service.status().await.unwrap().failed, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn deletes_are_sent_before_creates() {
    let h = harness(SyncConfig {
        batch_size: 1,
        max_concurrency: 1,
        ..fast_config()
    })
    .await;
    let old = h.service.create(json!({"name": "old"})).await.unwrap();
    h.service.sync_now().await.unwrap();

    h.service.create(json!({"name": "new"})).await.unwrap();
    h.service.delete(old.local_id).await.unwrap();

    h.remote.pause();
    let service = h.service.clone();
    let running = tokio::spawn(async move { service.sync_now().await });
    wait_for(|| h.remote.waiting_calls() == 1).await;
    h.service.cancel_sync();
    h.remote.resume();

    let report = running.await.unwrap().unwrap();
    assert!(report.cancelled);
    assert_eq!(report.succeeded, 1);
    // The delete went first; the create is still queued
    assert!(h.remote.documents("records").await.is_empty());
    assert_eq!(h.service.status().await.unwrap().pending, 1);

    h.service.sync_now().await.unwrap();
    let documents = h.remote.documents("records").await;
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].payload, json!({"name": "new"}));
}

#[tokio::test(flavor = "multi_thread")]
async fn latest_wins_keeps_newer_local_edit() {
    let h = harness(fast_config()).await;
    let synced = diverged(&h, false).await;

    let report = h.service.sync_now().await.unwrap();
    assert_eq!(report.conflicts_detected, 1);
    assert_eq!(report.conflicts_auto_resolved, 1);
    assert_eq!(
        remote_payload(&h.remote, &synced).await,
        json!({"status": "local"})
    );

    let audit = h
        .service
        .list_conflicts(Some(ConflictStatus::Resolved))
        .await
        .unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].resolved_by.as_deref(), Some("auto:latest_wins"));
    assert_eq!(audit[0].remote_version.actor_id, "device-b");
}

#[tokio::test(flavor = "multi_thread")]
async fn latest_wins_adopts_newer_remote_edit() {
    let h = harness(fast_config()).await;
    let synced = diverged(&h, true).await;

    let report = h.service.sync_now().await.unwrap();
    assert_eq!(report.conflicts_auto_resolved, 1);

    let record = h.service.get(synced.local_id).await.unwrap().unwrap();
    assert_eq!(record.payload, json!({"status": "remote"}));
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(
        remote_payload(&h.remote, &synced).await,
        json!({"status": "remote"})
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn manual_conflict_waits_for_local_wins_resolution() {
    let h = harness(SyncConfig {
        conflict_strategy: ResolutionStrategy::Manual,
        ..fast_config()
    })
    .await;
    let synced = diverged(&h, false).await;

    let report = h.service.sync_now().await.unwrap();
    assert_eq!(report.conflicts_pending, 1);
    let parked = h.service.get(synced.local_id).await.unwrap().unwrap();
    assert_eq!(parked.sync_status, SyncStatus::Conflicted);
    let status = h.service.status().await.unwrap();
    assert_eq!(status.conflicts, 1);
    assert_eq!(status.pending, 0);

    // Held items are not retried
    let idle = h.service.sync_now().await.unwrap();
    assert_eq!(idle.attempted, 0);

    let conflicts = h
        .service
        .list_conflicts(Some(ConflictStatus::Pending))
        .await
        .unwrap();
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.local_version.payload, json!({"status": "local"}));
    assert_eq!(conflict.remote_version.payload, json!({"status": "remote"}));

    h.service
        .resolve_conflict(conflict.id, ResolutionStrategy::LocalWins, None)
        .await
        .unwrap();
    let report = h.service.sync_now().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.conflicts_detected, 0);
    assert_eq!(
        remote_payload(&h.remote, &synced).await,
        json!({"status": "local"})
    );

    let resolved = h.service.list_conflicts(None).await.unwrap();
    assert_eq!(resolved[0].status, ConflictStatus::Resolved);
    assert_eq!(
        resolved[0].resolved_by.as_deref(),
        Some(h.service.device_id().as_ref())
    );

    let again = h
        .service
        .resolve_conflict(conflict.id, ResolutionStrategy::LocalWins, None)
        .await;
    assert!(matches!(again, Err(Error::Conflict(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn manual_resolution_with_merged_payload() {
    let h = harness(SyncConfig {
        conflict_strategy: ResolutionStrategy::Manual,
        ..fast_config()
    })
    .await;
    let synced = diverged(&h, false).await;
    h.service.sync_now().await.unwrap();
    let conflict = h.service.list_conflicts(None).await.unwrap().remove(0);

    let missing = h
        .service
        .resolve_conflict(conflict.id, ResolutionStrategy::Manual, None)
        .await;
    assert!(matches!(missing, Err(Error::Conflict(_))));

    let merged = json!({"status": "local", "note": "remote"});
    h.service
        .resolve_conflict(conflict.id, ResolutionStrategy::Manual, Some(merged.clone()))
        .await
        .unwrap();
    h.service.sync_now().await.unwrap();

    assert_eq!(remote_payload(&h.remote, &synced).await, merged);
    let record = h.service.get(synced.local_id).await.unwrap().unwrap();
    assert_eq!(record.payload, merged);
    assert_eq!(record.sync_status, SyncStatus::Synced);
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_wins_resolution_adopts_remote_version() {
    let h = harness(SyncConfig {
        conflict_strategy: ResolutionStrategy::Manual,
        ..fast_config()
    })
    .await;
    let synced = diverged(&h, false).await;
    h.service.sync_now().await.unwrap();
    let conflict = h.service.list_conflicts(None).await.unwrap().remove(0);

    h.service
        .resolve_conflict(conflict.id, ResolutionStrategy::RemoteWins, None)
        .await
        .unwrap();

    let record = h.service.get(synced.local_id).await.unwrap().unwrap();
    assert_eq!(record.payload, json!({"status": "remote"}));
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(h.service.status().await.unwrap().pending, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn dismissed_conflict_lets_local_version_through() {
    let h = harness(SyncConfig {
        conflict_strategy: ResolutionStrategy::Manual,
        ..fast_config()
    })
    .await;
    let synced = diverged(&h, false).await;
    h.service.sync_now().await.unwrap();
    let conflict = h.service.list_conflicts(None).await.unwrap().remove(0);

    h.service.dismiss_conflict(conflict.id).await.unwrap();
    h.service.sync_now().await.unwrap();

    assert_eq!(
        remote_payload(&h.remote, &synced).await,
        json!({"status": "local"})
    );
    let dismissed = h.service.list_conflicts(None).await.unwrap();
    assert_eq!(dismissed[0].status, ConflictStatus::Ignored);
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_manual_conflict_can_pause_sync() {
    let h = harness(SyncConfig {
        conflict_strategy: ResolutionStrategy::Manual,
        pause_on_manual_conflict: true,
        ..fast_config()
    })
    .await;
    diverged(&h, false).await;
    h.service.sync_now().await.unwrap();

    h.service.create(json!({"other": true})).await.unwrap();
    let report = h.service.sync_now().await.unwrap();
    assert_eq!(report.skipped, Some(SkipReason::BlockedByConflicts));
}

#[tokio::test(flavor = "multi_thread")]
async fn data_saver_on_slow_link_skips_pass() {
    let h = harness(fast_config()).await;
    h.network.set_quality(LinkQuality {
        connection_type: ConnectionType::Cellular,
        effective_bandwidth: Some(BandwidthClass::TwoG),
        data_saver: true,
    });
    h.service.create(json!({"n": 1})).await.unwrap();

    let report = h.service.sync_now().await.unwrap();
    assert_eq!(report.skipped, Some(SkipReason::PoorLink));
    assert_eq!(h.remote.call_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn attachment_upload_waits_for_parent_record() {
    let h = harness(SyncConfig {
        max_concurrency: 1,
        ..fast_config()
    })
    .await;
    let record = h.service.create(json!({"photo": true})).await.unwrap();
    let attachment_id = h
        .service
        .attach(record.local_id, vec![1, 2, 3, 4], "image/jpeg")
        .await
        .unwrap();

    h.remote
        .fail_next(1, RemoteError::Unavailable("503".into()))
        .await;
    let report = h.service.sync_now().await.unwrap();
    assert_eq!(report.retried, 1);
    assert_eq!(report.deferred, 1);
    assert!(h.remote.documents("attachments").await.is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let report = h.service.sync_now().await.unwrap();
    assert_eq!(report.succeeded, 2);

    let parent = h.service.get(record.local_id).await.unwrap().unwrap();
    let attachments = h.service.list_attachments(record.local_id).await.unwrap();
    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0].id, attachment_id);
    assert!(attachments[0].uploaded);
    assert_eq!(attachments[0].upload_progress, 100);

    let uploaded = h.remote.documents("attachments").await;
    assert_eq!(uploaded.len(), 1);
    assert_eq!(
        uploaded[0].payload["record_remote_id"],
        json!(parent.remote_id.unwrap())
    );
    assert_eq!(uploaded[0].payload["data"], json!("AQIDBA=="));
}

#[tokio::test(flavor = "multi_thread")]
async fn deleting_record_cascades_to_attachments() {
    let h = harness(SyncConfig {
        max_concurrency: 1,
        ..fast_config()
    })
    .await;
    let record = h.service.create(json!({"photo": true})).await.unwrap();
    h.service
        .attach(record.local_id, vec![9; 16], "image/png")
        .await
        .unwrap();
    h.service.sync_now().await.unwrap();
    assert_eq!(h.remote.documents("attachments").await.len(), 1);

    h.service.delete(record.local_id).await.unwrap();
    assert!(h
        .service
        .list_attachments(record.local_id)
        .await
        .unwrap()
        .is_empty());

    h.service.sync_now().await.unwrap();
    assert!(h.remote.documents("records").await.is_empty());
    assert!(h.remote.documents("attachments").await.is_empty());
    assert!(stored_record(&h.service, &record).await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_mutations_are_rejected() {
    let h = harness(SyncConfig {
        max_payload_bytes: 64,
        max_attachment_bytes: 8,
        ..fast_config()
    })
    .await;

    let not_object = h.service.create(json!(["a", "b"])).await;
    assert!(matches!(not_object, Err(Error::Validation(_))));

    let too_large = h.service.create(json!({"text": "x".repeat(100)})).await;
    assert!(matches!(too_large, Err(Error::Validation(_))));

    let missing = h
        .service
        .update(crate::models::RecordId::new(), json!({}))
        .await;
    assert!(matches!(missing, Err(Error::NotFound(_))));

    let record = h.service.create(json!({})).await.unwrap();
    let big_blob = h.service.attach(record.local_id, vec![0; 9], "image/png").await;
    assert!(matches!(big_blob, Err(Error::Validation(_))));

    h.service.delete(record.local_id).await.unwrap();
    let deleted = h.service.update(record.local_id, json!({})).await;
    assert!(matches!(deleted, Err(Error::NotFound(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn records_are_listed_newest_first() {
    let h = harness(fast_config()).await;
    let mut ids = Vec::new();
    for n in 0..3 {
        ids.push(h.service.create(json!({"n": n})).await.unwrap().local_id);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let listed: Vec<_> = h
        .service
        .list_records(10, 0)
        .await
        .unwrap()
        .into_iter()
        .map(|record| record.local_id)
        .collect();
    assert_eq!(listed, vec![ids[2], ids[1], ids[0]]);

    let page = h.service.list_records(1, 1).await.unwrap();
    assert_eq!(page[0].local_id, ids[1]);
}

#[tokio::test(flavor = "multi_thread")]
async fn wipe_resets_store_and_device_identity() {
    let h = harness(fast_config()).await;
    let before = h.service.device_id();
    h.service.create(json!({"n": 1})).await.unwrap();

    let device = h.service.wipe_local_data().await.unwrap();
    assert_ne!(device.device_id, before.as_ref());
    assert_eq!(h.service.device_id().as_ref(), device.device_id);
    assert!(h.service.list_records(10, 0).await.unwrap().is_empty());
    assert_eq!(h.service.status().await.unwrap(), EngineStatus::default());

    let record = h.service.create(json!({"n": 2})).await.unwrap();
    assert_eq!(record.owner_device_id, device.device_id);
}

#[tokio::test(flavor = "multi_thread")]
async fn device_id_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sitesync.db");
    let remote = MemoryRemoteStore::new("device-a");

    let first = SyncService::open_path(
        &path,
        Arc::new(remote.clone()),
        Arc::new(ManualNetworkMonitor::offline()),
        fast_config(),
    )
    .await
    .unwrap();
    let device_id = first.device_id();
    first.create(json!({"kept": true})).await.unwrap();
    drop(first);

    let second = SyncService::open_path(
        &path,
        Arc::new(remote),
        Arc::new(ManualNetworkMonitor::offline()),
        fast_config(),
    )
    .await
    .unwrap();
    assert_eq!(second.device_id(), device_id);
    assert_eq!(second.status().await.unwrap().pending, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn status_subscribers_see_queue_changes() {
    let h = harness(fast_config()).await;
    h.network.set_online(false);
    let mut status = h.service.subscribe_status();

    h.service.create(json!({"n": 1})).await.unwrap();
    assert!(status.has_changed().unwrap());
    assert_eq!(status.borrow_and_update().pending, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduler_syncs_on_reconnect_and_mutation() {
    let h = harness(fast_config()).await;
    h.network.set_online(false);
    h.service.create(json!({"queued": "offline"})).await.unwrap();

    h.service.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.remote.call_count(), 0);

    h.network.set_online(true);
    wait_for_documents(&h.remote, "records", 1).await;

    h.service.create(json!({"queued": "online"})).await.unwrap();
    wait_for_documents(&h.remote, "records", 2).await;

    h.service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduler_waits_for_better_link_after_skipped_pass() {
    let h = harness(fast_config()).await;
    h.network.set_quality(LinkQuality {
        connection_type: ConnectionType::Cellular,
        effective_bandwidth: Some(BandwidthClass::TwoG),
        data_saver: true,
    });
    h.service.create(json!({"n": 1})).await.unwrap();
    let mut phases = h.service.subscribe_phase();

    h.service.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), phases.changed())
        .await
        .expect("startup pass did not run")
        .unwrap();
    wait_for(|| h.service.phase() == SyncPhase::Idle).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    phases.borrow_and_update();

    // The item is due, but a skipped pass must not be retried every second
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert!(!phases.has_changed().unwrap());
    assert_eq!(h.remote.call_count(), 0);

    h.network.set_quality(LinkQuality {
        connection_type: ConnectionType::Wifi,
        effective_bandwidth: Some(BandwidthClass::FourG),
        data_saver: false,
    });
    wait_for_documents(&h.remote, "records", 1).await;

    h.service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_pass_keeps_last_sync_time() {
    let h = harness(SyncConfig {
        batch_size: 1,
        max_concurrency: 1,
        ..fast_config()
    })
    .await;
    for n in 0..3 {
        h.service.create(json!({"n": n})).await.unwrap();
    }

    h.remote.pause();
    let service = h.service.clone();
    let running = tokio::spawn(async move { service.sync_now().await });
    wait_for(|| h.remote.waiting_calls() == 1).await;
    h.service.cancel_sync();
    h.remote.resume();

    let report = running.await.unwrap().unwrap();
    assert!(report.cancelled);
    assert_eq!(report.succeeded, 1);
    let status = h.service.status().await.unwrap();
    assert_eq!(status.pending, 2);
    assert_eq!(status.last_sync_at, None);

    let report = h.service.sync_now().await.unwrap();
    assert_eq!(report.succeeded, 2);
    assert!(h.service.status().await.unwrap().last_sync_at.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn pass_cut_short_by_connectivity_keeps_last_sync_time() {
    let h = harness(SyncConfig {
        batch_size: 1,
        max_concurrency: 1,
        ..fast_config()
    })
    .await;
    for n in 0..3 {
        h.service.create(json!({"n": n})).await.unwrap();
    }

    h.remote.pause();
    let service = h.service.clone();
    let running = tokio::spawn(async move { service.sync_now().await });
    wait_for(|| h.remote.waiting_calls() == 1).await;
    h.network.set_online(false);
    h.remote.resume();

    let report = running.await.unwrap().unwrap();
    assert!(!report.cancelled);
    assert_eq!(report.succeeded, 1);
    let status = h.service.status().await.unwrap();
    assert_eq!(status.pending, 2);
    assert_eq!(status.last_sync_at, None);

    h.network.set_online(true);
    h.service.sync_now().await.unwrap();
    let status = h.service.status().await.unwrap();
    assert_eq!(status.pending, 0);
    assert!(status.last_sync_at.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_remote_call_times_out_and_backs_off() {
    let h = harness(SyncConfig {
        remote_timeout_ms: 50,
        backoff_base_ms: 1_000,
        backoff_cap_ms: 300_000,
        ..fast_config()
    })
    .await;
    let record = h.service.create(json!({"n": 1})).await.unwrap();

    h.remote.pause();
    let before = now_millis();
    let report = h.service.sync_now().await.unwrap();
    let after = now_millis();
    h.remote.resume();

    assert_eq!(report.retried, 1);
    assert_eq!(report.failed, 0);
    let pending = h.service.queue_items(QueueStatus::Pending).await.unwrap();
    assert_eq!(pending.len(), 1);
    let item = &pending[0];
    assert_eq!(item.retry_count, 1);
    assert!(item.error.is_some());
    // First retry waits base × 2
    assert!(item.scheduled_at >= before + 2_000);
    assert!(item.scheduled_at <= after + 2_000);

    let stored = stored_record(&h.service, &record).await.unwrap();
    assert_eq!(stored.sync_status, SyncStatus::Pending);
    assert_eq!(stored.retry_count, 1);
    assert!(h.remote.documents("records").await.is_empty());

    // Not due yet
    let idle = h.service.sync_now().await.unwrap();
    assert_eq!(idle.attempted, 0);
}

/// Remote store that, right after its next write lands, runs SQL against the
/// local store to make the following local step fail.
struct FailingDisk {
    remote: MemoryRemoteStore,
    store: LocalStore,
    sql: StdMutex<Option<&'static str>>,
}

impl FailingDisk {
    fn arm(&self, sql: &'static str) {
        *self.sql.lock().unwrap() = Some(sql);
    }

    async fn strike(&self) {
        let sql = self.sql.lock().unwrap().take();
        if let Some(sql) = sql {
            self.store.execute_batch(sql).await.unwrap();
        }
    }
}

#[async_trait]
impl RemoteStore for FailingDisk {
    async fn get(
        &self,
        collection: &str,
        remote_id: &str,
    ) -> Result<Option<RemoteDocument>, RemoteError> {
        self.remote.get(collection, remote_id).await
    }

    async fn put(
        &self,
        collection: &str,
        remote_id: Option<&str>,
        payload: &Value,
    ) -> Result<RemoteAck, RemoteError> {
        let ack = self.remote.put(collection, remote_id, payload).await?;
        self.strike().await;
        Ok(ack)
    }

    async fn delete(&self, collection: &str, remote_id: &str) -> Result<(), RemoteError> {
        self.remote.delete(collection, remote_id).await?;
        self.strike().await;
        Ok(())
    }
}

async fn failing_disk_service(config: SyncConfig) -> (SyncService, Arc<FailingDisk>) {
    let store = LocalStore::open_in_memory().unwrap();
    let disk = Arc::new(FailingDisk {
        remote: MemoryRemoteStore::new("device-a"),
        store: store.clone(),
        sql: StdMutex::new(None),
    });
    let service = SyncService::open(
        store,
        disk.clone(),
        Arc::new(ManualNetworkMonitor::online()),
        config,
    )
    .await
    .unwrap();
    (service, disk)
}

#[tokio::test(flavor = "multi_thread")]
async fn storage_failure_aborts_pass_and_next_pass_recovers() {
    let (service, disk) = failing_disk_service(fast_config()).await;
    let record = service.create(json!({"n": 1})).await.unwrap();

    disk.arm("ALTER TABLE records RENAME TO records_unavailable");
    let error = service.sync_now().await.unwrap_err();
    assert!(error.is_storage(), "{error:?}");
    assert!(!service.status().await.unwrap().in_progress);
    assert_eq!(service.status().await.unwrap().last_sync_at, None);
    assert_eq!(
        service.queue_items(QueueStatus::Syncing).await.unwrap().len(),
        1
    );

    disk.store
        .execute_batch("ALTER TABLE records_unavailable RENAME TO records")
        .await
        .unwrap();
    let report = service.sync_now().await.unwrap();
    assert_eq!(report.succeeded, 1);

    let synced = service.get(record.local_id).await.unwrap().unwrap();
    assert_eq!(synced.sync_status, SyncStatus::Synced);
    assert!(synced.remote_id.is_some());
    let status = service.status().await.unwrap();
    assert_eq!(status.pending, 0);
    assert!(status.last_sync_at.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn conflict_audit_is_rolled_back_with_its_delete() {
    let (service, disk) = failing_disk_service(SyncConfig {
        conflict_strategy: ResolutionStrategy::LocalWins,
        ..fast_config()
    })
    .await;
    let record = service.create(json!({"status": "draft"})).await.unwrap();
    service.sync_now().await.unwrap();
    let synced = service.get(record.local_id).await.unwrap().unwrap();
    let remote_id = synced.remote_id.clone().unwrap();

    disk.remote
        .with_actor("device-b")
        .put("records", Some(remote_id.as_str()), &json!({"status": "remote"}))
        .await
        .unwrap();
    service.delete(record.local_id).await.unwrap();

    disk.arm("ALTER TABLE sync_queue RENAME TO sync_queue_unavailable");
    assert!(service.sync_now().await.is_err());
    assert!(service.list_conflicts(None).await.unwrap().is_empty());

    disk.store
        .execute_batch("ALTER TABLE sync_queue_unavailable RENAME TO sync_queue")
        .await
        .unwrap();
    service.sync_now().await.unwrap();

    assert!(service.get(record.local_id).await.unwrap().is_none());
    assert!(disk.remote.documents("records").await.is_empty());
    assert!(service.list_conflicts(None).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn kept_local_delete_records_one_audit_entry() {
    let (service, disk) = failing_disk_service(SyncConfig {
        conflict_strategy: ResolutionStrategy::LocalWins,
        ..fast_config()
    })
    .await;
    let record = service.create(json!({"status": "draft"})).await.unwrap();
    service.sync_now().await.unwrap();
    let remote_id = service
        .get(record.local_id)
        .await
        .unwrap()
        .unwrap()
        .remote_id
        .unwrap();

    disk.remote
        .with_actor("device-b")
        .put("records", Some(remote_id.as_str()), &json!({"status": "remote"}))
        .await
        .unwrap();
    service.delete(record.local_id).await.unwrap();

    let report = service.sync_now().await.unwrap();
    assert_eq!(report.conflicts_auto_resolved, 1);
    let conflicts = service.list_conflicts(None).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].status, ConflictStatus::Resolved);
    assert_eq!(conflicts[0].remote_version.actor_id, "device-b");
    assert!(disk.remote.documents("records").await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn phase_follows_the_running_pass() {
    let h = harness(fast_config()).await;
    let mut phases = h.service.subscribe_phase();
    assert_eq!(h.service.phase(), SyncPhase::Idle);
    h.service.create(json!({"n": 1})).await.unwrap();

    h.remote.pause();
    let service = h.service.clone();
    let running = tokio::spawn(async move { service.sync_now().await });
    wait_for(|| h.remote.waiting_calls() == 1).await;
    assert_eq!(h.service.phase(), SyncPhase::Draining);
    assert!(phases.has_changed().unwrap());
    assert_eq!(*phases.borrow_and_update(), SyncPhase::Draining);

    // A coalesced request leaves the running pass's phase alone
    let second = h.service.sync_now().await.unwrap();
    assert!(second.coalesced);
    assert_eq!(h.service.phase(), SyncPhase::Draining);
    assert!(!phases.has_changed().unwrap());

    h.remote.resume();
    running.await.unwrap().unwrap();
    assert_eq!(h.service.phase(), SyncPhase::Idle);
    assert!(phases.has_changed().unwrap());
    assert_eq!(*phases.borrow_and_update(), SyncPhase::Idle);

    // A skipped pass returns to idle without draining
    h.network.set_online(false);
    let skipped = h.service.sync_now().await.unwrap();
    assert_eq!(skipped.skipped, Some(SkipReason::Offline));
    assert!(phases.has_changed().unwrap());
    assert_eq!(*phases.borrow_and_update(), SyncPhase::Idle);
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<StdMutex<Vec<u8>>>);

struct LogWriter(Arc<StdMutex<Vec<u8>>>);

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter(Arc::clone(&self.0))
    }
}

impl io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .0
            .lock()
            .map_err(|_| io::Error::other("lock poisoned"))?;
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// Current-thread runtime so worker tasks log through the scoped subscriber
#[tokio::test]
async fn discarded_remote_version_is_logged() {
    let logs = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let h = harness(fast_config()).await;
    diverged(&h, false).await;
    let report = h.service.sync_now().await.unwrap();
    assert_eq!(report.conflicts_auto_resolved, 1);

    let text = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
    assert!(
        text.contains("local version kept, remote version from device-b"),
        "{text}"
    );
}
