//! sitesync-core - Core library for SiteSync
//!
//! An offline-first record store for field applications. Records and their
//! attachments are written to a local `SQLite` store and replayed against a
//! remote document store through a persistent, coalescing sync queue once
//! connectivity allows.

pub mod config;
pub mod conflict;
pub mod db;
pub mod error;
pub mod models;
pub mod network;
pub mod queue;
pub mod remote;
pub mod services;
pub mod state;
pub mod sync;
pub mod util;

pub use config::{ConfigError, RemoteConfig, SyncConfig};
pub use db::LocalStore;
pub use error::{Error, Result};
pub use models::{
    Attachment, AttachmentId, Conflict, ConflictId, ConflictStatus, Record, RecordId,
    ResolutionStrategy, SyncStatus,
};
pub use network::{HttpProbeMonitor, ManualNetworkMonitor, NetworkMonitor, NetworkState};
pub use remote::{HttpRemoteStore, MemoryRemoteStore, RemoteStore};
pub use services::{EngineStatus, SyncService};
pub use state::SyncPhase;
pub use sync::{SkipReason, SyncDriver, SyncReport};
