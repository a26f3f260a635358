//! In-process remote store.
//!
//! Several handles can share one backend, each writing under its own actor id,
//! which makes multi-device scenarios reproducible without a server. Faults
//! and a pause gate let callers script outages and in-flight windows.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use super::{RemoteAck, RemoteDocument, RemoteError, RemoteStore};
use crate::util::now_millis;

#[derive(Default)]
struct BackendState {
    documents: BTreeMap<(String, String), RemoteDocument>,
    faults: VecDeque<RemoteError>,
    unavailable: bool,
    last_timestamp: i64,
}

struct Backend {
    state: Mutex<BackendState>,
    paused: watch::Sender<bool>,
    calls: AtomicUsize,
    waiting: AtomicUsize,
}

/// Remote store held in memory.
#[derive(Clone)]
pub struct MemoryRemoteStore {
    backend: Arc<Backend>,
    actor_id: String,
}

impl MemoryRemoteStore {
    /// Fresh, empty backend written to as `actor_id`.
    pub fn new(actor_id: impl Into<String>) -> Self {
        let (paused, _rx) = watch::channel(false);
        Self {
            backend: Arc::new(Backend {
                state: Mutex::new(BackendState::default()),
                paused,
                calls: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
            }),
            actor_id: actor_id.into(),
        }
    }

    /// Another handle on the same backend, writing as `actor_id`.
    #[must_use]
    pub fn with_actor(&self, actor_id: impl Into<String>) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            actor_id: actor_id.into(),
        }
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// Fail the next `count` calls with `error`.
    pub async fn fail_next(&self, count: usize, error: RemoteError) {
        let mut state = self.backend.state.lock().await;
        for _ in 0..count {
            state.faults.push_back(error.clone());
        }
    }

    /// While set, every call fails with `RemoteError::Unavailable`.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.backend.state.lock().await.unavailable = unavailable;
    }

    /// Hold every call at the gate until [`Self::resume`].
    pub fn pause(&self) {
        self.backend.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.backend.paused.send_replace(false);
    }

    /// Calls currently blocked at the pause gate.
    pub fn waiting_calls(&self) -> usize {
        self.backend.waiting.load(Ordering::SeqCst)
    }

    /// Calls received so far, including failed ones.
    pub fn call_count(&self) -> usize {
        self.backend.calls.load(Ordering::SeqCst)
    }

    pub async fn document(&self, collection: &str, remote_id: &str) -> Option<RemoteDocument> {
        let state = self.backend.state.lock().await;
        state
            .documents
            .get(&(collection.to_string(), remote_id.to_string()))
            .cloned()
    }

    pub async fn documents(&self, collection: &str) -> Vec<RemoteDocument> {
        let state = self.backend.state.lock().await;
        state
            .documents
            .iter()
            .filter(|((name, _), _)| name == collection)
            .map(|(_, document)| document.clone())
            .collect()
    }

    async fn enter(&self) -> Result<(), RemoteError> {
        self.backend.calls.fetch_add(1, Ordering::SeqCst);

        let mut paused = self.backend.paused.subscribe();
        if *paused.borrow_and_update() {
            let _waiting = WaitingGuard::enter(&self.backend.waiting);
            paused
                .wait_for(|paused| !*paused)
                .await
                .map_err(|_| RemoteError::Transport("remote backend dropped".into()))?;
        }

        let mut state = self.backend.state.lock().await;
        if state.unavailable {
            return Err(RemoteError::Unavailable("memory backend offline".into()));
        }
        match state.faults.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Counts a call parked at the pause gate, including calls abandoned by a
/// caller's timeout.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl BackendState {
    /// Strictly increasing write clock.
    fn tick(&mut self) -> i64 {
        self.last_timestamp = now_millis().max(self.last_timestamp + 1);
        self.last_timestamp
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn get(
        &self,
        collection: &str,
        remote_id: &str,
    ) -> Result<Option<RemoteDocument>, RemoteError> {
        self.enter().await?;
        Ok(self.document(collection, remote_id).await)
    }

    async fn put(
        &self,
        collection: &str,
        remote_id: Option<&str>,
        payload: &Value,
    ) -> Result<RemoteAck, RemoteError> {
        self.enter().await?;

        let remote_id = remote_id.map_or_else(|| Uuid::now_v7().to_string(), str::to_string);
        let mut state = self.backend.state.lock().await;
        let updated_at = state.tick();
        state.documents.insert(
            (collection.to_string(), remote_id.clone()),
            RemoteDocument {
                remote_id: remote_id.clone(),
                payload: payload.clone(),
                updated_at,
                actor_id: self.actor_id.clone(),
            },
        );

        Ok(RemoteAck {
            remote_id,
            updated_at,
        })
    }

    async fn delete(&self, collection: &str, remote_id: &str) -> Result<(), RemoteError> {
        self.enter().await?;
        let mut state = self.backend.state.lock().await;
        state
            .documents
            .remove(&(collection.to_string(), remote_id.to_string()));
        Ok(())
    }
}
