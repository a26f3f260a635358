//! Engine configuration.
//!
//! `SyncConfig` tunes the queue, driver and facade. It deserializes from JSON
//! with defaults for every field, or is built from `SITESYNC_*` environment
//! variables through [`SyncConfig::from_lookup`]. `RemoteConfig` carries the
//! remote store endpoint and credentials.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::ResolutionStrategy;
use crate::network::BandwidthClass;
use crate::util::{non_blank, parse_base_url};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for crate::Error {
    fn from(error: ConfigError) -> Self {
        Self::Config(error.to_string())
    }
}

/// Tuning for the sync queue, driver and facade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Maximum items taken from the queue per batch
    pub batch_size: usize,
    /// Maximum items of one batch in flight at once
    pub max_concurrency: usize,
    /// Attempts before a queue item is marked failed
    pub max_retries: u32,
    /// First retry delay; doubles per attempt
    pub backoff_base_ms: u64,
    /// Upper bound for the retry delay
    pub backoff_cap_ms: u64,
    /// Delay before re-checking an item whose dependency is not synced yet
    pub deferred_delay_ms: u64,
    /// Timeout for each remote store call
    pub remote_timeout_ms: u64,
    /// Period of the background sync timer; 0 disables it
    pub poll_interval_secs: u64,
    /// Strategy applied when both sides changed
    pub conflict_strategy: ResolutionStrategy,
    /// With data saver on, links slower than this are not used for sync
    pub data_saver_min_bandwidth: BandwidthClass,
    /// Skip draining entirely while a manual conflict is pending
    pub pause_on_manual_conflict: bool,
    /// Maximum serialized payload size accepted by the facade
    pub max_payload_bytes: usize,
    /// Maximum attachment blob size accepted by the facade
    pub max_attachment_bytes: usize,
    /// Remote collection receiving records
    pub records_collection: String,
    /// Remote collection receiving attachments
    pub attachments_collection: String,
    /// How long synced queue items are kept before purge
    pub synced_retention_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_concurrency: 4,
            max_retries: 5,
            backoff_base_ms: 2_000,
            backoff_cap_ms: 300_000,
            deferred_delay_ms: 1_000,
            remote_timeout_ms: 15_000,
            poll_interval_secs: 60,
            conflict_strategy: ResolutionStrategy::LatestWins,
            data_saver_min_bandwidth: BandwidthClass::ThreeG,
            pause_on_manual_conflict: false,
            max_payload_bytes: 1024 * 1024,
            max_attachment_bytes: 25 * 1024 * 1024,
            records_collection: "records".to_string(),
            attachments_collection: "attachments".to_string(),
            synced_retention_secs: 3_600,
        }
    }
}

impl SyncConfig {
    /// Build from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            batch_size: parse_ranged(&lookup, "SITESYNC_BATCH_SIZE", defaults.batch_size, 1, 500)?,
            max_concurrency: parse_ranged(
                &lookup,
                "SITESYNC_MAX_CONCURRENCY",
                defaults.max_concurrency,
                1,
                32,
            )?,
            max_retries: parse_ranged(&lookup, "SITESYNC_MAX_RETRIES", defaults.max_retries, 1, 50)?,
            backoff_base_ms: parse_ranged(
                &lookup,
                "SITESYNC_BACKOFF_BASE_MS",
                defaults.backoff_base_ms,
                10,
                600_000,
            )?,
            backoff_cap_ms: parse_ranged(
                &lookup,
                "SITESYNC_BACKOFF_CAP_MS",
                defaults.backoff_cap_ms,
                10,
                86_400_000,
            )?,
            deferred_delay_ms: parse_ranged(
                &lookup,
                "SITESYNC_DEFERRED_DELAY_MS",
                defaults.deferred_delay_ms,
                0,
                600_000,
            )?,
            remote_timeout_ms: parse_ranged(
                &lookup,
                "SITESYNC_REMOTE_TIMEOUT_MS",
                defaults.remote_timeout_ms,
                100,
                120_000,
            )?,
            poll_interval_secs: parse_ranged(
                &lookup,
                "SITESYNC_POLL_INTERVAL_SECS",
                defaults.poll_interval_secs,
                0,
                86_400,
            )?,
            conflict_strategy: optional_trimmed(&lookup, "SITESYNC_CONFLICT_STRATEGY")
                .map(|value| {
                    value.parse().map_err(|_| {
                        ConfigError::Invalid(format!(
                            "SITESYNC_CONFLICT_STRATEGY must be one of latest_wins, local_wins, remote_wins, manual (got '{value}')"
                        ))
                    })
                })
                .transpose()?
                .unwrap_or(defaults.conflict_strategy),
            data_saver_min_bandwidth: optional_trimmed(&lookup, "SITESYNC_DATA_SAVER_MIN_BANDWIDTH")
                .map(|value| {
                    value.parse().map_err(|_| {
                        ConfigError::Invalid(format!(
                            "SITESYNC_DATA_SAVER_MIN_BANDWIDTH must be one of slow-2g, 2g, 3g, 4g (got '{value}')"
                        ))
                    })
                })
                .transpose()?
                .unwrap_or(defaults.data_saver_min_bandwidth),
            pause_on_manual_conflict: parse_bool(
                &lookup,
                "SITESYNC_PAUSE_ON_MANUAL_CONFLICT",
                defaults.pause_on_manual_conflict,
            )?,
            max_payload_bytes: parse_ranged(
                &lookup,
                "SITESYNC_MAX_PAYLOAD_BYTES",
                defaults.max_payload_bytes,
                64,
                64 * 1024 * 1024,
            )?,
            max_attachment_bytes: parse_ranged(
                &lookup,
                "SITESYNC_MAX_ATTACHMENT_BYTES",
                defaults.max_attachment_bytes,
                1,
                1024 * 1024 * 1024,
            )?,
            records_collection: optional_trimmed(&lookup, "SITESYNC_RECORDS_COLLECTION")
                .unwrap_or(defaults.records_collection),
            attachments_collection: optional_trimmed(&lookup, "SITESYNC_ATTACHMENTS_COLLECTION")
                .unwrap_or(defaults.attachments_collection),
            synced_retention_secs: parse_ranged(
                &lookup,
                "SITESYNC_SYNCED_RETENTION_SECS",
                defaults.synced_retention_secs,
                0,
                30 * 86_400,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(ConfigError::Invalid(
                "backoff_cap_ms must not be smaller than backoff_base_ms".into(),
            ));
        }
        for (name, value) in [
            ("records_collection", &self.records_collection),
            ("attachments_collection", &self.attachments_collection),
        ] {
            if !is_collection_name(value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be non-empty and contain only [A-Za-z0-9_-]"
                )));
            }
        }
        Ok(())
    }

    pub const fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    /// Background timer period, `None` when periodic sync is disabled.
    pub const fn poll_interval(&self) -> Option<Duration> {
        if self.poll_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.poll_interval_secs))
        }
    }

    /// Delay before retry number `retry_count` (1-based): base × 2^retry, capped.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 1_u64.checked_shl(retry_count.min(32)).unwrap_or(u64::MAX);
        let delay = self.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.backoff_cap_ms))
    }
}

/// Endpoint and credentials of an HTTP remote store.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RemoteConfig {
    pub base_url: Option<String>,
    pub auth_token: Option<String>,
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RemoteConfig")
            .field("base_url", &self.base_url)
            .field(
                "auth_token",
                &self.auth_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl RemoteConfig {
    pub fn new(base_url: Option<String>, auth_token: Option<String>) -> Result<Self, ConfigError> {
        let base_url = parse_base_url(base_url)
            .map_err(|error| ConfigError::Invalid(format!("SITESYNC_REMOTE_URL {error}")))?;
        Ok(Self {
            base_url,
            auth_token: non_blank(auth_token),
        })
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Self::new(
            lookup("SITESYNC_REMOTE_URL"),
            lookup("SITESYNC_REMOTE_TOKEN"),
        )
    }

    pub const fn is_configured(&self) -> bool {
        self.base_url.is_some()
    }
}

fn is_collection_name(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    non_blank(lookup(name))
}

fn parse_ranged<T>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
    min: T,
    max: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + fmt::Display + Copy,
{
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    let value = raw.parse::<T>().map_err(|_| {
        ConfigError::Invalid(format!("{name} must be an integer in [{min}, {max}]"))
    })?;
    if value < min || value > max {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{min}, {max}]"
        )));
    }
    Ok(value)
}

fn parse_bool(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid(format!("{name} must be a boolean"))),
    }
}
