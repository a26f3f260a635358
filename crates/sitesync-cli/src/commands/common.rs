use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sitesync_core::models::Conflict;
use sitesync_core::{
    HttpProbeMonitor, HttpRemoteStore, LocalStore, ManualNetworkMonitor, MemoryRemoteStore,
    NetworkMonitor, Record, RecordId, RemoteConfig, RemoteStore, SyncConfig,
    SyncService,
};

use crate::cli::Cli;
use crate::error::CliError;

/// Connection settings shared by every subcommand.
#[derive(Debug, Clone)]
pub struct GlobalArgs {
    pub db_path: PathBuf,
    pub remote_url: Option<String>,
    pub remote_token: Option<String>,
    pub offline: bool,
}

impl GlobalArgs {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            db_path: resolve_db_path(cli.db_path.clone()),
            remote_url: cli.remote_url.clone(),
            remote_token: cli.remote_token.clone(),
            offline: cli.offline,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RecordListItem {
    pub id: String,
    pub remote_id: Option<String>,
    pub status: String,
    pub preview: String,
    pub payload: Value,
    pub created_at: i64,
    pub updated_at: i64,
    pub relative_time: String,
}

#[derive(Debug, Serialize)]
pub struct ConflictItem {
    pub id: String,
    pub record_id: String,
    pub operation: String,
    pub status: String,
    pub strategy: String,
    pub local_updated_at: i64,
    pub remote_updated_at: i64,
    pub remote_actor: String,
    pub detected_at_iso: String,
    pub resolved_by: Option<String>,
}

/// Open the sync service for `args`.
///
/// Without a remote URL, or with `--offline`, the service runs against an
/// offline monitor so queued changes stay local.
pub async fn open_service(args: &GlobalArgs) -> Result<SyncService, CliError> {
    if let Some(parent) = args.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let config = SyncConfig::from_env()?;
    let remote_config = RemoteConfig::new(
        args.remote_url
            .clone()
            .or_else(|| env::var("SITESYNC_REMOTE_URL").ok()),
        args.remote_token
            .clone()
            .or_else(|| env::var("SITESYNC_REMOTE_TOKEN").ok()),
    )?;

    let store = LocalStore::open_path(args.db_path.clone())?;
    let device = SyncService::load_device(&store).await?;

    let (remote, network): (Arc<dyn RemoteStore>, Arc<dyn NetworkMonitor>) =
        match remote_config.base_url.as_deref() {
            Some(base_url) if !args.offline => {
                let remote =
                    HttpRemoteStore::new(&remote_config, &device.device_id, config.remote_timeout())?;
                let probe = HttpProbeMonitor::new(base_url, config.remote_timeout())?;
                let state = probe.probe_once().await;
                tracing::debug!(online = state.online, "Probed {base_url}");
                (Arc::new(remote), Arc::new(probe))
            }
            _ => {
                if !args.offline {
                    tracing::debug!("No remote store configured; working offline");
                }
                (
                    Arc::new(MemoryRemoteStore::new(device.device_id.clone())),
                    Arc::new(ManualNetworkMonitor::offline()),
                )
            }
        };

    Ok(SyncService::open(store, remote, network, config).await?)
}

/// Find a live record by full id or unique id prefix.
pub async fn resolve_record(query: &str, service: &SyncService) -> Result<Record, CliError> {
    let query = normalize_record_identifier(query)?;
    if let Ok(record_id) = query.parse::<RecordId>() {
        if let Some(record) = service.get(record_id).await? {
            return Ok(record);
        }
    }

    let mut matches = service
        .list_records(usize::MAX, 0)
        .await?
        .into_iter()
        .filter(|record| record.local_id.to_string().starts_with(&query))
        .collect::<Vec<_>>();

    match matches.len() {
        0 => Err(CliError::RecordNotFound(query)),
        1 => Ok(matches.remove(0)),
        _ => {
            let options = matches
                .iter()
                .take(3)
                .map(|record| short_id(&record.local_id.to_string()))
                .collect::<Vec<_>>()
                .join(", ");
            Err(CliError::AmbiguousRecordId(format!(
                "ID prefix '{query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

/// Payload from the argument, or from piped stdin when omitted.
pub fn resolve_payload(argument: Option<&str>) -> Result<Value, CliError> {
    if let Some(text) = argument.and_then(normalize_content) {
        return parse_payload(&text);
    }
    if let Some(text) = read_piped_stdin()? {
        return parse_payload(&text);
    }
    Err(CliError::EmptyPayload)
}

pub fn parse_payload(text: &str) -> Result<Value, CliError> {
    serde_json::from_str(text).map_err(|error| CliError::InvalidPayload(error.to_string()))
}

pub fn normalize_content(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn normalize_record_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyRecordId)
    } else {
        Ok(trimmed.to_ascii_lowercase())
    }
}

pub fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    Ok(normalize_content(&buffer))
}

/// Best-effort MIME type from a file extension.
pub fn guess_mime_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("heic") => "image/heic",
        Some("pdf") => "application/pdf",
        Some("json") => "application/json",
        Some("txt" | "md") => "text/plain",
        Some("csv") => "text/csv",
        Some("mp4") => "video/mp4",
        Some("m4a") => "audio/mp4",
        Some("wav") => "audio/wav",
        _ => "application/octet-stream",
    }
}

pub fn short_id(id: &str) -> String {
    id.chars().take(13).collect()
}

pub fn format_record_lines(records: &[Record]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    records
        .iter()
        .map(|record| {
            let id = short_id(&record.local_id.to_string());
            let status = record.sync_status.as_str();
            let preview = payload_preview(&record.payload, 40);
            let relative_time = format_relative_time(record.updated_at, now_ms);
            format!("{id:<13}  {status:<10}  {preview:<40}  {relative_time}")
        })
        .collect()
}

pub fn record_to_list_item(record: &Record) -> RecordListItem {
    let now_ms = Utc::now().timestamp_millis();
    RecordListItem {
        id: record.local_id.to_string(),
        remote_id: record.remote_id.clone(),
        status: record.sync_status.to_string(),
        preview: payload_preview(&record.payload, 80),
        payload: record.payload.clone(),
        created_at: record.created_at,
        updated_at: record.updated_at,
        relative_time: format_relative_time(record.updated_at, now_ms),
    }
}

pub fn conflict_to_item(conflict: &Conflict) -> ConflictItem {
    ConflictItem {
        id: conflict.id.to_string(),
        record_id: conflict.entity_id.clone(),
        operation: conflict.operation.to_string(),
        status: conflict.status.to_string(),
        strategy: conflict.resolution_strategy.to_string(),
        local_updated_at: conflict.local_version.updated_at,
        remote_updated_at: conflict.remote_version.updated_at,
        remote_actor: conflict.remote_version.actor_id.clone(),
        detected_at_iso: format_sync_timestamp(conflict.detected_at),
        resolved_by: conflict.resolved_by.clone(),
    }
}

pub fn format_conflict_lines(conflicts: &[Conflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {:<8}  {:<6}  record={}  local={} remote={} ({})  id={}",
                format_sync_timestamp(conflict.detected_at),
                conflict.status,
                conflict.operation,
                short_id(&conflict.entity_id),
                conflict.local_version.updated_at,
                conflict.remote_version.updated_at,
                conflict.remote_version.actor_id,
                conflict.id
            )
        })
        .collect()
}

/// Single-line summary of a payload, truncated to `max_chars`.
pub fn payload_preview(payload: &Value, max_chars: usize) -> String {
    let collapsed = payload.to_string();
    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

const RELATIVE_UNITS: [(i64, &str); 6] = [
    (365 * 24 * 60 * 60_000, "y"),
    (30 * 24 * 60 * 60_000, "mo"),
    (7 * 24 * 60 * 60_000, "w"),
    (24 * 60 * 60_000, "d"),
    (60 * 60_000, "h"),
    (60_000, "m"),
];

/// Human offset between `timestamp_ms` and `now_ms`: "3h ago" or "in 5m".
pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let magnitude = diff.saturating_abs();
    let Some((unit_ms, suffix)) = RELATIVE_UNITS
        .iter()
        .find(|(unit_ms, _)| magnitude >= *unit_ms)
    else {
        return "just now".to_string();
    };

    let amount = magnitude / unit_ms;
    if diff >= 0 {
        format!("{amount}{suffix} ago")
    } else {
        format!("in {amount}{suffix}")
    }
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("SITESYNC_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sitesync")
        .join("sitesync.db")
}
