//! Device/session metadata

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::now_millis;

/// Process-wide device state, persisted once and injected into the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    /// Stable identifier for this device
    pub device_id: String,
    /// When the metadata was first initialised (Unix ms)
    pub created_at: i64,
    /// Completion time of the last successful sync pass (Unix ms)
    pub last_sync_at: Option<i64>,
}

impl DeviceMetadata {
    /// Storage key inside the `metadata` collection.
    pub const KEY: &'static str = "device";

    /// Fresh metadata with a newly generated device id.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            device_id: format!("device-{}", Uuid::now_v7().simple()),
            created_at: now_millis(),
            last_sync_at: None,
        }
    }
}
