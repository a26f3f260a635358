use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] sitesync_core::Error),
    #[error(transparent)]
    Config(#[from] sitesync_core::ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("No payload provided; pass a JSON object or pipe one on stdin")]
    EmptyPayload,
    #[error("Payload is not valid JSON: {0}")]
    InvalidPayload(String),
    #[error("Record ID cannot be empty")]
    EmptyRecordId,
    #[error("Record not found for id/prefix: {0}")]
    RecordNotFound(String),
    #[error("{0}")]
    AmbiguousRecordId(String),
    #[error("Invalid conflict id: {0}")]
    InvalidConflictId(String),
    #[error("Refusing to wipe local data without --yes")]
    WipeNotConfirmed,
}
