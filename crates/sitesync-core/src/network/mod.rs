//! Connectivity and link-quality signal consumed by the sync driver.
//!
//! Monitors publish their state on a `tokio::sync::watch` channel; the
//! background scheduler subscribes instead of registering callbacks, so state
//! changes never re-enter the driver directly.

mod probe;

pub use probe::HttpProbeMonitor;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Physical link type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Ethernet,
    #[default]
    Unknown,
    None,
}

/// Effective bandwidth class, ordered slowest to fastest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BandwidthClass {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
}

impl BandwidthClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Slow2g => "slow-2g",
            Self::TwoG => "2g",
            Self::ThreeG => "3g",
            Self::FourG => "4g",
        }
    }
}

impl fmt::Display for BandwidthClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BandwidthClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "slow-2g" | "slow2g" => Ok(Self::Slow2g),
            "2g" => Ok(Self::TwoG),
            "3g" => Ok(Self::ThreeG),
            "4g" => Ok(Self::FourG),
            other => Err(format!("unknown bandwidth class '{other}'")),
        }
    }
}

/// Quality of the current link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkQuality {
    pub connection_type: ConnectionType,
    /// `None` when the platform cannot estimate bandwidth
    pub effective_bandwidth: Option<BandwidthClass>,
    pub data_saver: bool,
}

impl Default for LinkQuality {
    fn default() -> Self {
        Self {
            connection_type: ConnectionType::Unknown,
            effective_bandwidth: None,
            data_saver: false,
        }
    }
}

/// Snapshot published by a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NetworkState {
    pub online: bool,
    pub quality: LinkQuality,
}

impl NetworkState {
    pub const fn offline() -> Self {
        Self {
            online: false,
            quality: LinkQuality {
                connection_type: ConnectionType::None,
                effective_bandwidth: None,
                data_saver: false,
            },
        }
    }

    pub fn online() -> Self {
        Self {
            online: true,
            quality: LinkQuality::default(),
        }
    }

    /// Whether a sync pass should use this link.
    ///
    /// Offline links are never usable. With data saver on, links estimated
    /// below `data_saver_min` are skipped; unknown bandwidth is trusted.
    pub fn is_usable(&self, data_saver_min: BandwidthClass) -> bool {
        if !self.online || self.quality.connection_type == ConnectionType::None {
            return false;
        }
        if !self.quality.data_saver {
            return true;
        }
        self.quality
            .effective_bandwidth
            .map_or(true, |bandwidth| bandwidth >= data_saver_min)
    }
}

/// Source of connectivity information.
pub trait NetworkMonitor: Send + Sync {
    /// Current connectivity.
    fn is_online(&self) -> bool {
        self.state().online
    }

    /// Current link quality.
    fn link_quality(&self) -> LinkQuality {
        self.state().quality
    }

    /// Full current snapshot.
    fn state(&self) -> NetworkState;

    /// Subscribe to state changes.
    fn subscribe(&self) -> watch::Receiver<NetworkState>;
}

/// Monitor driven by the host application (OS callbacks, tests, CLI flags).
pub struct ManualNetworkMonitor {
    tx: watch::Sender<NetworkState>,
}

impl ManualNetworkMonitor {
    pub fn new(initial: NetworkState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn online() -> Self {
        Self::new(NetworkState::online())
    }

    pub fn offline() -> Self {
        Self::new(NetworkState::offline())
    }

    /// Publish a new connectivity state; subscribers are only woken on change.
    pub fn set_state(&self, state: NetworkState) {
        self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                tracing::debug!(online = state.online, "Network state changed");
                *current = state;
                true
            }
        });
    }

    pub fn set_online(&self, online: bool) {
        let state = if online {
            NetworkState {
                online: true,
                quality: LinkQuality {
                    connection_type: match self.state().quality.connection_type {
                        ConnectionType::None => ConnectionType::Unknown,
                        other => other,
                    },
                    ..self.state().quality
                },
            }
        } else {
            NetworkState::offline()
        };
        self.set_state(state);
    }

    pub fn set_quality(&self, quality: LinkQuality) {
        let online = self.state().online;
        self.set_state(NetworkState { online, quality });
    }
}

impl NetworkMonitor for ManualNetworkMonitor {
    fn state(&self) -> NetworkState {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.tx.subscribe()
    }
}
