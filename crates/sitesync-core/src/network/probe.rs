//! Connectivity monitor backed by an HTTP health endpoint.

use std::time::Duration;

use tokio::sync::watch;

use super::{ConnectionType, LinkQuality, NetworkMonitor, NetworkState};
use crate::config::ConfigError;
use crate::util::parse_base_url;

/// Treats the device as online whenever `url` answers at all.
///
/// The host decides when to call [`HttpProbeMonitor::probe_once`].
///
/// Server errors (5xx) count as offline since the remote store behind the
/// endpoint cannot accept writes either.
pub struct HttpProbeMonitor {
    client: reqwest::Client,
    url: String,
    tx: watch::Sender<NetworkState>,
}

impl HttpProbeMonitor {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ConfigError> {
        let url = parse_base_url(Some(url.into()))
            .map_err(|error| ConfigError::Invalid(format!("probe url {error}")))?
            .ok_or_else(|| ConfigError::Invalid("probe url must not be empty".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| ConfigError::Invalid(format!("probe client: {error}")))?;
        let (tx, _rx) = watch::channel(NetworkState::offline());

        Ok(Self { client, url, tx })
    }

    /// Probe once and publish the result.
    pub async fn probe_once(&self) -> NetworkState {
        let reachable = match self.client.head(&self.url).send().await {
            Ok(response) => !response.status().is_server_error(),
            Err(error) => {
                tracing::debug!("Connectivity probe to {} failed: {}", self.url, error);
                false
            }
        };

        let state = if reachable {
            NetworkState {
                online: true,
                quality: LinkQuality {
                    connection_type: ConnectionType::Unknown,
                    ..LinkQuality::default()
                },
            }
        } else {
            NetworkState::offline()
        };

        self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                tracing::info!(online = state.online, "Connectivity changed");
                *current = state;
                true
            }
        });
        state
    }

}

impl NetworkMonitor for HttpProbeMonitor {
    fn state(&self) -> NetworkState {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_urls() {
        let timeout = Duration::from_secs(1);
        assert!(HttpProbeMonitor::new("", timeout).is_err());
        assert!(HttpProbeMonitor::new("example.com/health", timeout).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_endpoint_reports_offline() {
        // Port 9 (discard) is closed on test machines
        let monitor =
            HttpProbeMonitor::new("http://127.0.0.1:9/health", Duration::from_millis(500)).unwrap();

        let state = monitor.probe_once().await;
        assert!(!state.online);
        assert!(!monitor.is_online());
    }
}
