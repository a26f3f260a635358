//! JSON-over-HTTP remote store adapter.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{RemoteAck, RemoteDocument, RemoteError, RemoteStore};
use crate::config::{ConfigError, RemoteConfig};
use crate::util::compact_text;

/// Remote store reached over a small REST API:
///
/// - `GET    {base}/v1/collections/{collection}/documents/{id}`
/// - `POST   {base}/v1/collections/{collection}/documents`
/// - `PUT    {base}/v1/collections/{collection}/documents/{id}`
/// - `DELETE {base}/v1/collections/{collection}/documents/{id}`
#[derive(Clone)]
pub struct HttpRemoteStore {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    actor_id: String,
}

impl std::fmt::Debug for HttpRemoteStore {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemoteStore")
            .field("base_url", &self.base_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("actor_id", &self.actor_id)
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct WriteRequest<'a> {
    payload: &'a Value,
    actor_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    id: String,
    updated_at: i64,
}

#[derive(Debug, Deserialize)]
struct DocumentResponse {
    id: String,
    payload: Value,
    updated_at: i64,
    #[serde(default)]
    actor_id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

impl HttpRemoteStore {
    /// Build a client for `config`. Writes are attributed to `actor_id`.
    pub fn new(
        config: &RemoteConfig,
        actor_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let base_url = config
            .base_url
            .clone()
            .ok_or(ConfigError::MissingVar("SITESYNC_REMOTE_URL"))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| ConfigError::Invalid(format!("remote client: {error}")))?;

        Ok(Self {
            client,
            base_url,
            auth_token: config.auth_token.clone(),
            actor_id: actor_id.into(),
        })
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/v1/collections/{collection}/documents", self.base_url)
    }

    fn document_url(&self, collection: &str, remote_id: &str) -> String {
        format!("{}/{remote_id}", self.collection_url(collection))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header("Accept", "application/json");
        match self.auth_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        self.authorize(request).send().await.map_err(transport_error)
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn get(
        &self,
        collection: &str,
        remote_id: &str,
    ) -> Result<Option<RemoteDocument>, RemoteError> {
        let response = self
            .send(self.client.get(self.document_url(collection, remote_id)))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response).await?;
        let document = response
            .json::<DocumentResponse>()
            .await
            .map_err(decode_error)?;

        Ok(Some(RemoteDocument {
            remote_id: document.id,
            payload: document.payload,
            updated_at: document.updated_at,
            actor_id: document.actor_id,
        }))
    }

    async fn put(
        &self,
        collection: &str,
        remote_id: Option<&str>,
        payload: &Value,
    ) -> Result<RemoteAck, RemoteError> {
        let body = WriteRequest {
            payload,
            actor_id: &self.actor_id,
        };
        let request = match remote_id {
            Some(remote_id) => self.client.put(self.document_url(collection, remote_id)),
            None => self.client.post(self.collection_url(collection)),
        };
        let response = check_status(self.send(request.json(&body)).await?).await?;
        let ack = response
            .json::<WriteResponse>()
            .await
            .map_err(decode_error)?;

        Ok(RemoteAck {
            remote_id: ack.id,
            updated_at: ack.updated_at,
        })
    }

    async fn delete(&self, collection: &str, remote_id: &str) -> Result<(), RemoteError> {
        let response = self
            .send(self.client.delete(self.document_url(collection, remote_id)))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
}

fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    let message = parse_api_error(status, body);
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RemoteError::Unavailable(message)
    } else {
        RemoteError::Rejected(message)
    }
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let compacted = compact_text(body);
    if compacted.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", compacted, status.as_u16())
    }
}

fn transport_error(error: reqwest::Error) -> RemoteError {
    if error.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Transport(error.to_string())
    }
}

fn decode_error(error: reqwest::Error) -> RemoteError {
    if error.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Rejected(format!("invalid response body: {error}"))
    }
}
