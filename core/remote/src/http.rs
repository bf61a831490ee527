//! HTTP implementation of the remote API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

use medipost_common::{EntityType, Error, Result};

use crate::api::{PullBatch, PushAck, RemoteApi, RemoteRecord};

/// Header carrying the client-generated deduplication token.
const IDEMPOTENCY_HEADER: &str = "X-Idempotency-Key";

/// HTTP client for the central server.
pub struct HttpRemoteApi {
    http: Client,
    base: Url,
}

impl HttpRemoteApi {
    /// Create a client for the given base URL.
    ///
    /// Every request shares one explicit timeout; a timed-out call surfaces
    /// as [`Error::Timeout`] and is treated as retryable, never as success.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::InvalidInput(format!("Bad server URL {base_url}: {e}")))?;
        let http = Client::builder()
            .user_agent("MediPost/0.1")
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { http, base })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| Error::InvalidInput("Server URL cannot be a base".to_string()))?;
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::Network(format!("Failed to parse response: {e}")))
        } else {
            debug!("Request failed with status {}", status);
            Err(error_for_status(status, response.text().await.unwrap_or_default()))
        }
    }
}

/// Map a non-success status to the error taxonomy: 5xx is transient, 404 is
/// not-found, every other 4xx is a permanent rejection.
fn error_for_status(status: StatusCode, body: String) -> Error {
    if status.is_server_error() {
        Error::Server {
            status: status.as_u16(),
            message: body,
        }
    } else if status == StatusCode::NOT_FOUND {
        Error::NotFound(body)
    } else {
        Error::Rejected {
            status: status.as_u16(),
            message: body,
        }
    }
}

fn transport_err(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Network(e.to_string())
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn health(&self) -> Result<()> {
        let url = self.endpoint(&["health"])?;
        let response = self
            .http
            .head(url)
            .send()
            .await
            .map_err(transport_err)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(error_for_status(status, String::new()))
        }
    }

    async fn create(
        &self,
        entity: EntityType,
        payload: &serde_json::Value,
        idempotency_key: &str,
    ) -> Result<PushAck> {
        let url = self.endpoint(&[entity.collection_path()])?;
        let response = self
            .http
            .post(url)
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .header(header::CONTENT_TYPE, "application/json")
            .json(payload)
            .send()
            .await
            .map_err(transport_err)?;

        self.handle_response(response).await
    }

    async fn update(
        &self,
        entity: EntityType,
        id: &str,
        payload: &serde_json::Value,
        idempotency_key: &str,
    ) -> Result<PushAck> {
        let url = self.endpoint(&[entity.collection_path(), id])?;
        let response = self
            .http
            .put(url)
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .header(header::CONTENT_TYPE, "application/json")
            .json(payload)
            .send()
            .await
            .map_err(transport_err)?;

        self.handle_response(response).await
    }

    async fn delete(&self, entity: EntityType, id: &str, idempotency_key: &str) -> Result<()> {
        let url = self.endpoint(&[entity.collection_path(), id])?;
        let response = self
            .http
            .delete(url)
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .send()
            .await
            .map_err(transport_err)?;

        let status = response.status();
        // Deleting something already gone is success from the client's view:
        // a retried delete must not wedge the outbox.
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(error_for_status(status, response.text().await.unwrap_or_default()))
        }
    }

    async fn list(
        &self,
        entity: EntityType,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteRecord>> {
        let url = self.endpoint(&[entity.collection_path()])?;
        let mut request = self.http.get(url);
        if let Some(cursor) = updated_since {
            request = request.query(&[("updated_since", cursor.to_rfc3339())]);
        }

        let response = request.send().await.map_err(transport_err)?;
        self.handle_response(response).await
    }

    async fn changes_since(&self, since: Option<DateTime<Utc>>) -> Result<PullBatch> {
        let url = self.endpoint(&["changes"])?;
        let mut request = self.http.get(url);
        if let Some(cursor) = since {
            request = request.query(&[("since", cursor.to_rfc3339())]);
        }

        let response = request.send().await.map_err(transport_err)?;
        let batch: PullBatch = self.handle_response(response).await?;
        Ok(batch)
    }
}
