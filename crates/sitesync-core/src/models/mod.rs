//! Data models for SiteSync

/// Declares a UUID v7 backed identifier newtype.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new unique, time-sortable identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Get the string representation of this ID.
            #[must_use]
            pub fn as_str(&self) -> String {
                self.0.to_string()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s.trim())?))
            }
        }
    };
}

pub(crate) use uuid_id;

mod attachment;
mod conflict;
mod metadata;
mod queue_item;
mod record;

pub use attachment::{Attachment, AttachmentId};
pub use conflict::{
    Conflict, ConflictId, ConflictStatus, LocalVersion, RemoteVersion, ResolutionStrategy,
};
pub use metadata::DeviceMetadata;
pub use queue_item::{EntityType, FollowUp, Operation, QueueItem, QueueItemId, QueueStatus};
pub use record::{Record, RecordId, SyncStatus};

pub(crate) use queue_item::entity_key;
