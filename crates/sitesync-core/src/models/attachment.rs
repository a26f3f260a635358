//! Attachment model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::util::now_millis;

use super::record::RecordId;

uuid_id!(
    /// A unique identifier for an attachment, using UUID v7.
    AttachmentId
);

/// Binary blob owned by exactly one record.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Unique attachment identifier.
    pub id: AttachmentId,
    /// Owning record.
    pub record_id: RecordId,
    /// File contents.
    #[serde(with = "base64_blob")]
    pub blob: Vec<u8>,
    /// Content MIME type.
    pub mime_type: String,
    /// Blob size in bytes.
    pub size_bytes: u64,
    /// Whether the blob has reached the remote store.
    pub uploaded: bool,
    /// Upload progress, 0-100.
    pub upload_progress: u8,
    /// Identifier assigned by the remote store.
    #[serde(default)]
    pub remote_id: Option<String>,
    /// Creation timestamp (Unix ms).
    pub created_at: i64,
}

impl fmt::Debug for Attachment {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Attachment")
            .field("id", &self.id)
            .field("record_id", &self.record_id)
            .field("blob", &format_args!("<{} bytes>", self.blob.len()))
            .field("mime_type", &self.mime_type)
            .field("uploaded", &self.uploaded)
            .field("upload_progress", &self.upload_progress)
            .field("remote_id", &self.remote_id)
            .finish_non_exhaustive()
    }
}

impl Attachment {
    /// Create a new attachment, validating the blob and MIME type.
    pub fn new(record_id: RecordId, blob: Vec<u8>, mime_type: impl Into<String>) -> Result<Self> {
        let mime_type = mime_type.into().trim().to_ascii_lowercase();

        if blob.is_empty() {
            return Err(Error::Validation(
                "Attachment blob cannot be empty".to_string(),
            ));
        }
        if !is_valid_mime_type(&mime_type) {
            return Err(Error::Validation(format!(
                "Attachment mime_type must look like type/subtype, got '{mime_type}'"
            )));
        }

        Ok(Self {
            id: AttachmentId::new(),
            record_id,
            size_bytes: blob.len() as u64,
            blob,
            mime_type,
            uploaded: false,
            upload_progress: 0,
            remote_id: None,
            created_at: now_millis(),
        })
    }
}

fn is_valid_mime_type(value: &str) -> bool {
    let Some((kind, subtype)) = value.split_once('/') else {
        return false;
    };
    !kind.is_empty()
        && !subtype.is_empty()
        && !value.contains(char::is_whitespace)
        && !subtype.contains('/')
}

mod base64_blob {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
