//! Remote document store over HTTP.
//!
//! Documents map to `/v1/{collection}/{key}`: `PUT` upserts, `GET` reads
//! (404 means absent) and `GET /v1/{collection}` lists. Requests carry a
//! bearer token and a producer id derived from the hostname.

use super::{encode_key, DocumentStore, SinkError};
use crate::config::RemoteStoreConfig;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;

/// Listing response body.
#[derive(Debug, Deserialize)]
struct ListResponse {
    documents: Vec<ListedDocument>,
}

#[derive(Debug, Deserialize)]
struct ListedDocument {
    key: String,
    document: Value,
}

/// Async client for the remote store.
pub struct RemoteStoreClient {
    config: RemoteStoreConfig,
    client: reqwest::Client,
    producer_id: String,
}

impl RemoteStoreClient {
    pub fn new(config: RemoteStoreConfig) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SinkError::Unavailable(format!("Failed to create HTTP client: {e}")))?;

        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Ok(Self {
            config,
            client,
            producer_id: format!("motion-risk-{hostname}"),
        })
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/v1/{}", self.config.base_url.trim_end_matches('/'), encode_key(collection))
    }

    fn document_url(&self, collection: &str, key: &str) -> String {
        format!("{}/{}", self.collection_url(collection), encode_key(key))
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header("X-Producer-Id", &self.producer_id);
        match &self.config.api_key {
            Some(token) => builder.header("Authorization", format!("Bearer {token}")),
            None => builder,
        }
    }

    pub async fn put(&self, collection: &str, key: &str, document: &Value) -> Result<(), SinkError> {
        let response = self
            .request(self.client.put(self.document_url(collection, key)))
            .json(document)
            .send()
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
        Err(classify_failure(status, collection, key, message))
    }

    pub async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, SinkError> {
        let response = self
            .request(self.client.get(self.document_url(collection, key)))
            .send()
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(classify_failure(status, collection, key, message));
        }
        response
            .json()
            .await
            .map(Some)
            .map_err(|e| SinkError::Serialization(e.to_string()))
    }

    pub async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, SinkError> {
        let response = self
            .request(self.client.get(self.collection_url(collection)))
            .send()
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(classify_failure(status, collection, "*", message));
        }
        let body: ListResponse = response
            .json()
            .await
            .map_err(|e| SinkError::Serialization(e.to_string()))?;

        let mut documents: Vec<(String, Value)> = body.documents.into_iter().map(|d| (d.key, d.document)).collect();
        documents.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(documents)
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }
}

/// Rate limiting and server errors are transient, other failures are not.
fn classify_failure(status: StatusCode, collection: &str, key: &str, message: String) -> SinkError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        SinkError::Unavailable(format!("{status}: {message}"))
    } else {
        SinkError::Rejected {
            collection: collection.to_string(),
            key: key.to_string(),
            reason: format!("{status}: {message}"),
        }
    }
}

/// Blocking remote store for the synchronous sink writer.
///
/// Must not be used from inside an async runtime.
pub struct HttpStore {
    inner: RemoteStoreClient,
    runtime: tokio::runtime::Runtime,
}

impl HttpStore {
    pub fn new(config: RemoteStoreConfig) -> Result<Self, SinkError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| SinkError::Unavailable(format!("Failed to create runtime: {e}")))?;

        Ok(Self {
            inner: RemoteStoreClient::new(config)?,
            runtime,
        })
    }

    pub fn producer_id(&self) -> &str {
        self.inner.producer_id()
    }
}

impl DocumentStore for HttpStore {
    fn put(&self, collection: &str, key: &str, document: &Value) -> Result<(), SinkError> {
        self.runtime.block_on(self.inner.put(collection, key, document))
    }

    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, SinkError> {
        self.runtime.block_on(self.inner.get(collection, key))
    }

    fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, SinkError> {
        self.runtime.block_on(self.inner.list(collection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> RemoteStoreConfig {
        RemoteStoreConfig {
            base_url: "http://127.0.0.1:8700/".to_string(),
            api_key: Some("test-token".to_string()),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_document_urls() {
        let client = RemoteStoreClient::new(config()).unwrap();
        assert_eq!(client.collection_url("alerts"), "http://127.0.0.1:8700/v1/alerts");
        assert_eq!(
            client.document_url("composite_scores", "S1_1000_1"),
            "http://127.0.0.1:8700/v1/composite_scores/S1_1000_1"
        );
        assert!(client.producer_id().starts_with("motion-risk-"));
    }

    #[test]
    fn test_failure_classification() {
        let err = classify_failure(StatusCode::SERVICE_UNAVAILABLE, "alerts", "k", String::new());
        assert!(err.is_retryable());
        let err = classify_failure(StatusCode::BAD_REQUEST, "alerts", "k", String::new());
        assert!(matches!(err, SinkError::Rejected { .. }));
    }

    #[test]
    fn test_unreachable_store_is_unavailable() {
        let store = HttpStore::new(RemoteStoreConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            api_key: None,
            timeout: Duration::from_millis(500),
        })
        .unwrap();
        let err = store.put("alerts", "k", &serde_json::json!({})).unwrap_err();
        assert!(err.is_retryable());
    }
}
