use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::error::{BackendError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health snapshot for one backend. Recomputed whole on every poll, never
/// partially updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendHealth {
    pub status: HealthStatus,
    pub latency_ms: u64,
    pub error_rate: f32,
    pub last_checked: i64,
}

impl BackendHealth {
    pub fn unhealthy(latency_ms: u64) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            latency_ms,
            error_rate: 1.0,
            last_checked: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackendCapabilities {
    pub supports_ranges: bool,
    pub supports_signed_urls: bool,
    pub supports_copy: bool,
    pub max_file_size: Option<u64>,
}

/// Half-open byte range `[start, end)`; `end = None` means to the end of the
/// payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    /// Apply the range to a payload, clamping to its length.
    pub fn apply(&self, data: &bytes::Bytes) -> bytes::Bytes {
        let len = data.len() as u64;
        let start = self.start.min(len) as usize;
        let end = self.end.unwrap_or(len).min(len) as usize;
        if start >= end {
            return bytes::Bytes::new();
        }
        data.slice(start..end)
    }
}

/// Directory-entry level information about a stored object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub modified_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EncryptionConfig {
    pub enabled: bool,
    pub algorithm: Option<String>,
}

/// Backend-type specific settings. Each variant carries only the fields its
/// type needs, so an s3 config without a bucket is unrepresentable after
/// validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendKind {
    Local {
        base_path: String,
    },
    S3 {
        bucket: String,
        region: String,
        credentials: String,
    },
    Azure {
        container_name: String,
        credentials: String,
    },
    Gcs {
        bucket: String,
        credentials: String,
    },
    Custom {
        endpoint: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    pub max_concurrent_operations: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    pub kind: BackendKind,
}

impl BackendConfig {
    pub fn local(name: impl Into<String>, base_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: Duration::from_secs(30),
            max_concurrent_operations: num_cpus::get(),
            retry: RetryPolicy::default(),
            encryption: EncryptionConfig::default(),
            kind: BackendKind::Local {
                base_path: base_path.into(),
            },
        }
    }

    /// Validate the config, reporting every missing required field rather than
    /// only the first one.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();

        if self.name.is_empty() {
            missing.push("name is required".to_string());
        }
        if self.timeout.is_zero() {
            missing.push("timeout must be non-zero".to_string());
        }

        match &self.kind {
            BackendKind::Local { base_path } => {
                if base_path.is_empty() {
                    missing.push("local: base_path is required".to_string());
                }
            }
            BackendKind::S3 {
                bucket,
                region,
                credentials,
            } => {
                if bucket.is_empty() {
                    missing.push("s3: bucket is required".to_string());
                }
                if region.is_empty() {
                    missing.push("s3: region is required".to_string());
                }
                if credentials.is_empty() {
                    missing.push("s3: credentials are required".to_string());
                }
            }
            BackendKind::Azure {
                container_name,
                credentials,
            } => {
                if container_name.is_empty() {
                    missing.push("azure: container_name is required".to_string());
                }
                if credentials.is_empty() {
                    missing.push("azure: credentials are required".to_string());
                }
            }
            BackendKind::Gcs {
                bucket,
                credentials,
            } => {
                if bucket.is_empty() {
                    missing.push("gcs: bucket is required".to_string());
                }
                if credentials.is_empty() {
                    missing.push("gcs: credentials are required".to_string());
                }
            }
            BackendKind::Custom { endpoint } => {
                if endpoint.is_empty() {
                    missing.push("custom: endpoint is required".to_string());
                }
            }
        }

        if self.encryption.enabled && self.encryption.algorithm.is_none() {
            missing.push("encryption: algorithm is required when enabled".to_string());
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(BackendError::InvalidConfig(missing))
        }
    }
}

/// Upload backend selection policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    #[default]
    RoundRobin,
    /// Lowest last-measured latency wins.
    LeastLoaded,
    /// Extension point for capability-aware routing; currently resolves to
    /// the first healthy backend.
    SizeBased,
    Random,
}

/// Rolling success/failure counters a backend feeds into its health reports.
#[derive(Debug, Default)]
pub struct OpStats {
    total: AtomicU64,
    failed: AtomicU64,
}

impl OpStats {
    pub fn record(&self, ok: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn error_rate(&self) -> f32 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.failed.load(Ordering::Relaxed) as f32 / total as f32
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
