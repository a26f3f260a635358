//! Collection-oriented document store over `SQLite`
//!
//! Every collection is a table of JSON documents keyed by a stable string id,
//! with two secondary indexes: one on status and one on the owning entity.

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // SQLite counts are i64

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::models::{Attachment, Conflict, DeviceMetadata, QueueItem, Record};

use super::connection::Database;

/// The five logical collections of the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Records,
    Attachments,
    SyncQueue,
    Conflicts,
    Metadata,
}

impl Collection {
    pub const ALL: [Self; 5] = [
        Self::Records,
        Self::Attachments,
        Self::SyncQueue,
        Self::Conflicts,
        Self::Metadata,
    ];

    /// Backing table name.
    pub const fn table(self) -> &'static str {
        match self {
            Self::Records => "records",
            Self::Attachments => "attachments",
            Self::SyncQueue => "sync_queue",
            Self::Conflicts => "conflicts",
            Self::Metadata => "metadata",
        }
    }
}

/// A value that lives in one collection of the local store.
pub trait Document: Serialize + DeserializeOwned {
    const COLLECTION: Collection;

    /// Primary key inside the collection.
    fn key(&self) -> String;

    /// Value of the status index.
    fn status_index(&self) -> Option<&'static str> {
        None
    }

    /// Value of the owning-entity index.
    fn owner_index(&self) -> Option<String> {
        None
    }

    /// Modification time stored alongside the body.
    fn updated_index(&self) -> i64 {
        0
    }
}

impl Document for Record {
    const COLLECTION: Collection = Collection::Records;

    fn key(&self) -> String {
        self.local_id.to_string()
    }

    fn status_index(&self) -> Option<&'static str> {
        Some(self.sync_status.as_str())
    }

    fn owner_index(&self) -> Option<String> {
        Some(self.owner_device_id.clone())
    }

    fn updated_index(&self) -> i64 {
        self.updated_at
    }
}

impl Document for Attachment {
    const COLLECTION: Collection = Collection::Attachments;

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn status_index(&self) -> Option<&'static str> {
        Some(if self.uploaded { "uploaded" } else { "local" })
    }

    fn owner_index(&self) -> Option<String> {
        Some(self.record_id.to_string())
    }

    fn updated_index(&self) -> i64 {
        self.created_at
    }
}

impl Document for QueueItem {
    const COLLECTION: Collection = Collection::SyncQueue;

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn status_index(&self) -> Option<&'static str> {
        Some(self.status.as_str())
    }

    fn owner_index(&self) -> Option<String> {
        Some(self.entity_key())
    }

    fn updated_index(&self) -> i64 {
        self.updated_at
    }
}

impl Document for Conflict {
    const COLLECTION: Collection = Collection::Conflicts;

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn status_index(&self) -> Option<&'static str> {
        Some(self.status.as_str())
    }

    fn owner_index(&self) -> Option<String> {
        Some(self.entity_id.clone())
    }

    fn updated_index(&self) -> i64 {
        self.resolved_at.unwrap_or(self.detected_at)
    }
}

impl Document for DeviceMetadata {
    const COLLECTION: Collection = Collection::Metadata;

    fn key(&self) -> String {
        Self::KEY.to_string()
    }

    fn updated_index(&self) -> i64 {
        self.last_sync_at.unwrap_or(self.created_at)
    }
}

/// Typed document access over a connection or an open transaction.
pub struct Documents<'a> {
    conn: &'a Connection,
}

impl<'a> Documents<'a> {
    /// Create a view over the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert or replace a document
    pub fn put<D: Document>(&self, doc: &D) -> Result<()> {
        let body = serde_json::to_string(doc)?;
        self.conn.execute(
            &format!(
                "INSERT INTO {} (id, status, owner_id, updated_at, body) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    owner_id = excluded.owner_id,
                    updated_at = excluded.updated_at,
                    body = excluded.body",
                D::COLLECTION.table()
            ),
            params![
                doc.key(),
                doc.status_index(),
                doc.owner_index(),
                doc.updated_index(),
                body
            ],
        )?;
        Ok(())
    }

    /// Fetch a document by key
    pub fn get<D: Document>(&self, key: &str) -> Result<Option<D>> {
        let body: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT body FROM {} WHERE id = ?1", D::COLLECTION.table()),
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        body.map(|body| serde_json::from_str(&body).map_err(Error::from))
            .transpose()
    }

    /// Delete a document by key, returning whether it existed
    pub fn delete(&self, collection: Collection, key: &str) -> Result<bool> {
        let rows = self.conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", collection.table()),
            params![key],
        )?;
        Ok(rows > 0)
    }

    /// All documents of a collection matching `predicate`, in key order
    pub fn scan<D, F>(&self, predicate: F) -> Result<Vec<D>>
    where
        D: Document,
        F: Fn(&D) -> bool,
    {
        let bodies = self.query_bodies(
            &format!("SELECT body FROM {} ORDER BY id", D::COLLECTION.table()),
            &[],
        )?;
        Self::decode_filtered(bodies, predicate)
    }

    /// Documents whose status index equals `status`
    pub fn scan_by_status<D: Document>(&self, status: &str) -> Result<Vec<D>> {
        let bodies = self.query_bodies(
            &format!(
                "SELECT body FROM {} WHERE status = ?1 ORDER BY id",
                D::COLLECTION.table()
            ),
            &[status],
        )?;
        Self::decode_filtered(bodies, |_: &D| true)
    }

    /// Documents whose owner index equals `owner`
    pub fn scan_by_owner<D: Document>(&self, owner: &str) -> Result<Vec<D>> {
        let bodies = self.query_bodies(
            &format!(
                "SELECT body FROM {} WHERE owner_id = ?1 ORDER BY id",
                D::COLLECTION.table()
            ),
            &[owner],
        )?;
        Self::decode_filtered(bodies, |_: &D| true)
    }

    /// Number of documents in `collection` with the given status
    pub fn count_by_status(&self, collection: Collection, status: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE status = ?1",
                collection.table()
            ),
            params![status],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Remove every document of a collection
    pub fn clear(&self, collection: Collection) -> Result<usize> {
        Ok(self
            .conn
            .execute(&format!("DELETE FROM {}", collection.table()), [])?)
    }

    fn query_bodies(&self, sql: &str, args: &[&str]) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(sql)?;
        let bodies = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(bodies)
    }

    fn decode_filtered<D, F>(bodies: Vec<String>, predicate: F) -> Result<Vec<D>>
    where
        D: DeserializeOwned,
        F: Fn(&D) -> bool,
    {
        let mut docs = Vec::with_capacity(bodies.len());
        for body in bodies {
            let doc: D = serde_json::from_str(&body)?;
            if predicate(&doc) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }
}

/// Thread-safe handle to the durable local store.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl LocalStore {
    /// Open the store at the given filesystem path, creating parent directories.
    ///
    /// A file that `SQLite` no longer recognises is moved aside and a fresh
    /// store is created in its place.
    pub fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = match Database::open(&db_path) {
            Ok(db) => db,
            Err(error) if is_corrupted_db_error(&error) => {
                tracing::warn!(
                    "Local store at {} is unreadable: {}. Quarantining and starting fresh.",
                    db_path.display(),
                    error
                );
                quarantine_corrupted_db_files(&db_path)?;
                Database::open(&db_path)?
            }
            Err(error) => return Err(error),
        };

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: Arc::new(Mutex::new(Database::open_in_memory()?)),
            db_path: None,
        })
    }

    /// Filesystem location, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub async fn put<D: Document>(&self, doc: &D) -> Result<()> {
        let db = self.db.lock().await;
        Documents::new(db.connection()).put(doc)
    }

    pub async fn get<D: Document>(&self, key: &str) -> Result<Option<D>> {
        let db = self.db.lock().await;
        Documents::new(db.connection()).get(key)
    }

    pub async fn delete(&self, collection: Collection, key: &str) -> Result<bool> {
        let db = self.db.lock().await;
        Documents::new(db.connection()).delete(collection, key)
    }

    pub async fn scan<D, F>(&self, predicate: F) -> Result<Vec<D>>
    where
        D: Document,
        F: Fn(&D) -> bool,
    {
        let db = self.db.lock().await;
        Documents::new(db.connection()).scan(predicate)
    }

    pub async fn scan_by_status<D: Document>(&self, status: &str) -> Result<Vec<D>> {
        let db = self.db.lock().await;
        Documents::new(db.connection()).scan_by_status(status)
    }

    pub async fn scan_by_owner<D: Document>(&self, owner: &str) -> Result<Vec<D>> {
        let db = self.db.lock().await;
        Documents::new(db.connection()).scan_by_owner(owner)
    }

    pub async fn count_by_status(&self, collection: Collection, status: &str) -> Result<usize> {
        let db = self.db.lock().await;
        Documents::new(db.connection()).count_by_status(collection, status)
    }

    /// Run `ops` atomically: either every write inside is committed or none is.
    pub async fn transaction<T, F>(&self, ops: F) -> Result<T>
    where
        F: FnOnce(&Documents<'_>) -> Result<T>,
    {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let output = ops(&Documents::new(&tx))?;
        tx.commit()?;
        Ok(output)
    }

    /// Run raw SQL, for tests that need to break the schema underneath.
    #[cfg(test)]
    pub(crate) async fn execute_batch(&self, sql: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.connection().execute_batch(sql)?;
        Ok(())
    }
}

fn is_corrupted_db_error(error: &Error) -> bool {
    error
        .to_string()
        .to_ascii_lowercase()
        .contains("file is not a database")
}

fn quarantine_corrupted_db_files(db_path: &Path) -> Result<()> {
    if db_path.exists() {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let file_name = db_path
            .file_name()
            .map_or_else(|| "sitesync.db".into(), |name| name.to_string_lossy());
        let backup_path = db_path.with_file_name(format!("{file_name}.corrupt-{timestamp}"));

        std::fs::rename(db_path, &backup_path)?;
        tracing::warn!(
            "Moved corrupted local store from {} to {}",
            db_path.display(),
            backup_path.display()
        );
    }

    let Some(parent) = db_path.parent() else {
        return Ok(());
    };
    let Some(base_name) = db_path.file_name().and_then(|name| name.to_str()) else {
        return Ok(());
    };
    let sidecar_prefix = format!("{base_name}-");

    for entry in std::fs::read_dir(parent)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if file_name.starts_with(&sidecar_prefix) {
            let path = entry.path();
            std::fs::remove_file(&path)?;
            tracing::warn!("Removed stale store sidecar {}", path.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QueueStatus, SyncStatus};
    use serde_json::json;
    use tempfile::tempdir;

    fn record(payload: serde_json::Value) -> Record {
        Record::new("device-test", payload)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn put_get_delete_roundtrip() {
        let store = LocalStore::open_in_memory().unwrap();
        let rec = record(json!({"site": "A"}));

        store.put(&rec).await.unwrap();
        let fetched: Record = store.get(&rec.key()).await.unwrap().unwrap();
        assert_eq!(fetched, rec);

        assert!(store.delete(Collection::Records, &rec.key()).await.unwrap());
        assert!(store.get::<Record>(&rec.key()).await.unwrap().is_none());
        assert!(!store.delete(Collection::Records, &rec.key()).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn put_replaces_existing_document_and_indexes() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut rec = record(json!({}));
        store.put(&rec).await.unwrap();

        rec.sync_status = SyncStatus::Synced;
        store.put(&rec).await.unwrap();

        let pending = store
            .count_by_status(Collection::Records, "pending")
            .await
            .unwrap();
        let synced = store
            .count_by_status(Collection::Records, "synced")
            .await
            .unwrap();
        assert_eq!((pending, synced), (0, 1));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scan_filters_and_indexes() {
        let store = LocalStore::open_in_memory().unwrap();
        let a = record(json!({"n": 1}));
        let b = record(json!({"n": 2}));
        store.put(&a).await.unwrap();
        store.put(&b).await.unwrap();

        let attachment = Attachment::new(a.local_id, vec![1, 2], "image/jpeg").unwrap();
        store.put(&attachment).await.unwrap();

        let big: Vec<Record> = store.scan(|r: &Record| r.payload["n"] == 2).await.unwrap();
        assert_eq!(big.len(), 1);
        assert_eq!(big[0].local_id, b.local_id);

        let owned: Vec<Attachment> = store.scan_by_owner(&a.key()).await.unwrap();
        assert_eq!(owned.len(), 1);
        assert!(store
            .scan_by_owner::<Attachment>(&b.key())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_transaction_has_no_visible_effect() {
        let store = LocalStore::open_in_memory().unwrap();
        let rec = record(json!({}));
        let item = QueueItem::new(
            crate::models::EntityType::Record,
            rec.key(),
            crate::models::Operation::Create,
            10,
            5,
        );

        let result: Result<()> = store
            .transaction(|docs| {
                docs.put(&rec)?;
                docs.put(&item)?;
                Err(Error::Storage("simulated disk full".into()))
            })
            .await;
        assert!(result.unwrap_err().is_storage());

        assert!(store.get::<Record>(&rec.key()).await.unwrap().is_none());
        assert!(store
            .scan_by_status::<QueueItem>(QueueStatus::Pending.as_str())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn committed_transaction_applies_all_writes() {
        let store = LocalStore::open_in_memory().unwrap();
        let rec = record(json!({}));
        let meta = DeviceMetadata::generate();

        store
            .transaction(|docs| {
                docs.put(&rec)?;
                docs.put(&meta)?;
                Ok(())
            })
            .await
            .unwrap();

        assert!(store.get::<Record>(&rec.key()).await.unwrap().is_some());
        let loaded: DeviceMetadata = store.get(DeviceMetadata::KEY).await.unwrap().unwrap();
        assert_eq!(loaded, meta);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_path_persists_between_opens() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("nested").join("store.db");
        let rec = record(json!({"persisted": true}));

        {
            let store = LocalStore::open_path(&path).unwrap();
            store.put(&rec).await.unwrap();
        }

        let store = LocalStore::open_path(&path).unwrap();
        assert_eq!(store.path(), Some(path.as_path()));
        let fetched: Record = store.get(&rec.key()).await.unwrap().unwrap();
        assert_eq!(fetched.payload, json!({"persisted": true}));
    }

    #[test]
    fn corrupted_file_is_quarantined_and_replaced() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("store.db");
        std::fs::write(&path, vec![b'x'; 4096]).unwrap();
        std::fs::write(tmp.path().join("store.db-wal"), b"wal").unwrap();

        let store = LocalStore::open_path(&path).unwrap();
        assert!(store.path().is_some());
        // The fresh store opens its own WAL; the stale sidecar must be gone
        let wal = std::fs::read(tmp.path().join("store.db-wal")).unwrap_or_default();
        assert_ne!(wal, b"wal".to_vec());

        let quarantined = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .any(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("store.db.corrupt-")
            });
        assert!(quarantined);
    }
}
