//! Object-store transport.
//!
//! The uploader only sees [`ObjectStoreClient`]; the HTTP implementation
//! PUTs under the configured endpoint with a device credential, and the
//! in-memory implementation backs tests and local dry runs.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{AgentError, Result};
use crate::upload::credentials::CredentialProvider;

/// Remote object store, keyed by hierarchical string keys.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync + fmt::Debug {
    /// Store `body` under `key`. One attempt; retrying is the caller's
    /// concern.
    async fn upload(&self, key: &str, body: &[u8], token: &CancellationToken) -> Result<()>;

    /// Cheap reachability/auth probe used by connect and reconnect.
    async fn ping(&self, token: &CancellationToken) -> Result<()>;
}

/// PUT-over-HTTP object store.
#[derive(Debug)]
pub struct HttpObjectStore {
    http: reqwest::Client,
    endpoint: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpObjectStore {
    pub fn new(
        endpoint: &str,
        credentials: Arc<dyn CredentialProvider>,
        attempt_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(attempt_timeout)
            .build()
            .map_err(AgentError::Transport)?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn classify_status(status: reqwest::StatusCode, detail: String) -> AgentError {
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            AgentError::Auth(format!("status {status}: {detail}"))
        } else {
            AgentError::RemoteStatus {
                status: status.as_u16(),
                detail,
            }
        }
    }
}

#[async_trait]
impl ObjectStoreClient for HttpObjectStore {
    async fn upload(&self, key: &str, body: &[u8], token: &CancellationToken) -> Result<()> {
        let credential = self.credentials.get().await?;
        let url = format!("{}/{key}", self.endpoint);
        let request = self
            .http
            .put(&url)
            .header(reqwest::header::AUTHORIZATION, credential.token)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body.to_vec());

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(AgentError::Cancelled("upload".to_string())),
            response = request.send() => response.map_err(AgentError::Transport)?,
        };

        let status = response.status();
        if status.is_success() {
            debug!(%url, bytes = body.len(), "object stored");
            return Ok(());
        }
        let detail = response.text().await.unwrap_or_default();
        Err(Self::classify_status(status, detail))
    }

    async fn ping(&self, token: &CancellationToken) -> Result<()> {
        let credential = self.credentials.get().await?;
        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(AgentError::Cancelled("ping".to_string())),
            response = self
                .http
                .head(&self.endpoint)
                .header(reqwest::header::AUTHORIZATION, credential.token)
                .send() => response.map_err(AgentError::Transport)?,
        };

        let status = response.status();
        // Any response proves reachability; only auth failures matter
        // here, since HEAD on the root may well be 404.
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AgentError::Auth(format!("ping rejected: {status}")));
        }
        Ok(())
    }
}

/// In-memory store for tests and `--dry-run` style local use. Optionally
/// fails the next N operations with a transient error.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: std::sync::Mutex<HashMap<String, Vec<u8>>>,
    upload_order: std::sync::Mutex<Vec<String>>,
    fail_next: AtomicU32,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` uploads/pings fail with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().expect("objects lock").get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .expect("objects lock")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Keys in the order uploads completed.
    pub fn upload_order(&self) -> Vec<String> {
        self.upload_order.lock().expect("order lock").clone()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().expect("objects lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn maybe_fail(&self) -> Result<()> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.fetch_sub(1, Ordering::SeqCst);
            return Err(AgentError::Timeout("injected transport failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStoreClient for MemoryObjectStore {
    async fn upload(&self, key: &str, body: &[u8], _token: &CancellationToken) -> Result<()> {
        self.maybe_fail()?;
        self.objects
            .lock()
            .expect("objects lock")
            .insert(key.to_string(), body.to_vec());
        self.upload_order
            .lock()
            .expect("order lock")
            .push(key.to_string());
        Ok(())
    }

    async fn ping(&self, _token: &CancellationToken) -> Result<()> {
        self.maybe_fail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::credentials::StaticCredentialProvider;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_for(server_url: &str) -> HttpObjectStore {
        HttpObjectStore::new(
            server_url,
            Arc::new(StaticCredentialProvider::new("token-1".to_string())),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn put_carries_key_auth_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/logs/2024/05/02/press-07/abc.jsonl"))
            .and(header("authorization", "token-1"))
            .and(header("content-type", "application/x-ndjson"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server.uri());
        store
            .upload(
                "logs/2024/05/02/press-07/abc.jsonl",
                b"{\"id\":\"r1\"}\n",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn server_errors_classify_by_status() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let store = store_for(&server.uri());
        let error = store
            .upload("k", b"x", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(error, AgentError::RemoteStatus { status: 503, .. }));
    }

    #[tokio::test]
    async fn auth_failures_are_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        let store = store_for(&server.uri());
        let error = store
            .upload("k", b"x", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(error, AgentError::Auth(_)));
    }

    #[tokio::test]
    async fn memory_store_failure_injection() {
        let store = MemoryObjectStore::new();
        store.fail_next(2);
        let token = CancellationToken::new();
        assert!(store.upload("k", b"x", &token).await.is_err());
        assert!(store.upload("k", b"x", &token).await.is_err());
        store.upload("k", b"x", &token).await.unwrap();
        assert_eq!(store.keys(), vec!["k".to_string()]);
    }
}
