use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::error::{BackendError, Result};
use super::types::{
    BackendCapabilities, BackendHealth, ByteRange, HealthStatus, ObjectInfo, OpStats, RetryPolicy,
};
use super::StorageBackend;

/// Object-store backend speaking plain HTTP to a bucket endpoint.
///
/// Object layout is `{endpoint}/{bucket}/{key}`; listing is a JSON array from
/// `{endpoint}/{bucket}?prefix=`. Transient failures (5xx, transport errors)
/// are retried with exponential backoff per the configured policy; 4xx
/// responses are permanent.
pub struct HttpObjectBackend {
    name: String,
    endpoint: String,
    bucket: String,
    credentials: String,
    client: Client,
    retry: RetryPolicy,
    stats: OpStats,
}

#[derive(Deserialize)]
struct ListedObject {
    key: String,
    size: u64,
    #[serde(default)]
    modified_at: i64,
}

impl HttpObjectBackend {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        credentials: impl Into<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Http(e.to_string()))?;

        Ok(Self {
            name: name.into(),
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            credentials: credentials.into(),
            client,
            retry,
            stats: OpStats::default(),
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }

    fn bucket_url(&self) -> String {
        format!("{}/{}", self.endpoint, self.bucket)
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            multiplier: self.retry.backoff_multiplier,
            max_interval: self.retry.max_backoff,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Run `request` with retries. Transport errors and 5xx responses retry
    /// up to `max_retries`; everything else is permanent.
    async fn with_retry<F, Fut>(&self, request: F) -> Result<reqwest::Response>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<reqwest::Response, reqwest::Error>>,
    {
        let attempts = AtomicU32::new(0);
        let max_retries = self.retry.max_retries;

        let response = backoff::future::retry(self.backoff(), || {
            let fut = request();
            let attempts = &attempts;
            async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                match fut.await {
                    Ok(resp) if resp.status().is_server_error() => {
                        let err = BackendError::Http(format!("server error: {}", resp.status()));
                        if attempt >= max_retries {
                            Err(backoff::Error::permanent(err))
                        } else {
                            Err(backoff::Error::transient(err))
                        }
                    }
                    Ok(resp) => Ok(resp),
                    Err(e) => {
                        let err = BackendError::Http(e.to_string());
                        if attempt >= max_retries {
                            Err(backoff::Error::permanent(err))
                        } else {
                            Err(backoff::Error::transient(err))
                        }
                    }
                }
            }
        })
        .await;

        self.stats.record(response.is_ok());
        response
    }
}

#[async_trait]
impl StorageBackend for HttpObjectBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<()> {
        // The bucket must already exist; a probe confirms reachability.
        let resp = self
            .client
            .head(self.bucket_url())
            .bearer_auth(&self.credentials)
            .send()
            .await?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Unavailable(format!(
                "{}: bucket probe returned {}",
                self.name,
                resp.status()
            )))
        }
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn store(&self, key: &str, data: Bytes) -> Result<()> {
        let declared = data.len() as u64;
        let url = self.object_url(key);

        let resp = self
            .with_retry(|| {
                self.client
                    .put(&url)
                    .bearer_auth(&self.credentials)
                    .header("Content-Type", "application/octet-stream")
                    .header("Content-Length", declared)
                    .body(data.clone())
                    .send()
            })
            .await
            .map_err(|e| e.in_operation(&self.name, "store"))?;

        if !resp.status().is_success() {
            return Err(BackendError::Http(format!(
                "upload failed with {}",
                resp.status()
            ))
            .in_operation(&self.name, "store"));
        }

        Ok(())
    }

    async fn retrieve(&self, key: &str, range: Option<ByteRange>) -> Result<Bytes> {
        let url = self.object_url(key);

        let resp = self
            .with_retry(|| {
                let mut req = self.client.get(&url).bearer_auth(&self.credentials);
                if let Some(range) = range {
                    let header = match range.end {
                        Some(end) => format!("bytes={}-{}", range.start, end.saturating_sub(1)),
                        None => format!("bytes={}-", range.start),
                    };
                    req = req.header("Range", header);
                }
                req.send()
            })
            .await
            .map_err(|e| e.in_operation(&self.name, "retrieve"))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(key.to_string()));
        }
        if !resp.status().is_success() {
            return Err(BackendError::Http(format!(
                "download failed with {}",
                resp.status()
            ))
            .in_operation(&self.name, "retrieve"));
        }

        let served_partial = resp.status() == StatusCode::PARTIAL_CONTENT;
        let data = resp
            .bytes()
            .await
            .map_err(|e| BackendError::from(e).in_operation(&self.name, "retrieve"))?;

        // If the server ignored the Range header, apply it locally.
        Ok(match range {
            Some(r) if !served_partial => r.apply(&data),
            _ => data,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let url = self.object_url(key);

        let resp = self
            .with_retry(|| self.client.delete(&url).bearer_auth(&self.credentials).send())
            .await
            .map_err(|e| e.in_operation(&self.name, "delete"))?;

        // Already gone counts as deleted.
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(BackendError::Http(format!(
                "delete failed with {}",
                resp.status()
            ))
            .in_operation(&self.name, "delete"));
        }

        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let url = self.object_url(key);

        let resp = self
            .with_retry(|| self.client.head(&url).bearer_auth(&self.credentials).send())
            .await
            .map_err(|e| e.in_operation(&self.name, "exists"))?;

        Ok(resp.status().is_success())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let data = self.retrieve(from, None).await?;
        self.store(to, data).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.copy(from, to).await?;
        self.delete(from).await
    }

    async fn metadata(&self, key: &str) -> Result<ObjectInfo> {
        let url = self.object_url(key);

        let resp = self
            .with_retry(|| self.client.head(&url).bearer_auth(&self.credentials).send())
            .await
            .map_err(|e| e.in_operation(&self.name, "metadata"))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(key.to_string()));
        }

        let size = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Ok(ObjectInfo {
            key: key.to_string(),
            size,
            modified_at: chrono::Utc::now().timestamp_millis(),
        })
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let resp = self
            .with_retry(|| {
                self.client
                    .get(self.bucket_url())
                    .query(&[("prefix", prefix)])
                    .bearer_auth(&self.credentials)
                    .send()
            })
            .await
            .map_err(|e| e.in_operation(&self.name, "list_files"))?;

        if !resp.status().is_success() {
            return Err(BackendError::Http(format!(
                "list failed with {}",
                resp.status()
            ))
            .in_operation(&self.name, "list_files"));
        }

        let listed: Vec<ListedObject> = resp
            .json()
            .await
            .map_err(|e| BackendError::from(e).in_operation(&self.name, "list_files"))?;

        Ok(listed
            .into_iter()
            .map(|o| ObjectInfo {
                key: o.key,
                size: o.size,
                modified_at: o.modified_at,
            })
            .collect())
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_ranges: true,
            supports_signed_urls: true,
            supports_copy: true,
            max_file_size: Some(5 * 1024 * 1024 * 1024),
        }
    }

    async fn health(&self) -> BackendHealth {
        let start = Instant::now();
        let probe = self
            .client
            .head(self.bucket_url())
            .bearer_auth(&self.credentials)
            .send()
            .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let reachable = matches!(&probe, Ok(resp) if resp.status().is_success());
        if !reachable {
            return BackendHealth::unhealthy(latency_ms);
        }

        let error_rate = self.stats.error_rate();
        let status = if error_rate > 0.5 {
            HealthStatus::Unhealthy
        } else if error_rate > 0.1 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        BackendHealth {
            status,
            latency_ms,
            error_rate,
            last_checked: chrono::Utc::now().timestamp_millis(),
        }
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> Result<String> {
        let expires_at = chrono::Utc::now().timestamp() + expires_in.as_secs() as i64;

        // Keyed-hash token over (key, expiry) so the URL is self-authenticating
        // for a server sharing the credentials.
        let mut token_key = [0u8; 32];
        let cred = self.credentials.as_bytes();
        for (i, byte) in cred.iter().take(32).enumerate() {
            token_key[i] = *byte;
        }
        let token = blake3::keyed_hash(&token_key, format!("{key}:{expires_at}").as_bytes());

        Ok(format!(
            "{}?expires={}&token={}",
            self.object_url(key),
            expires_at,
            token.to_hex()
        ))
    }
}
