//! Uploader configuration

use anyhow::{Context, Result, bail};
use easypan_api::ClientConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Upload pipeline settings.
///
/// Durations are stored as milliseconds when serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    /// Base URL of the EasyPan API
    pub base_url: String,
    /// Chunk size in bytes, also the digest read window
    pub chunk_size: u64,
    /// Maximum chunk sends in flight per task
    pub max_concurrent_chunks: usize,
    /// Attempts per chunk, including the first
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per retry
    #[serde(with = "duration_ms")]
    pub retry_base_delay: Duration,
    /// Upper bound on the retry delay
    #[serde(with = "duration_ms")]
    pub retry_max_delay: Duration,
    /// Timeout of regular API requests
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// Timeout of the transcode status stream
    #[serde(with = "duration_ms")]
    pub transcode_timeout: Duration,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
    /// Space usage polling interval while uploads are active
    #[serde(with = "duration_ms")]
    pub quota_refresh_interval: Duration,
    pub log_level: String,
    pub log_to_file: bool,
    pub log_max_files: usize,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:7090/api".to_string(),
            chunk_size: 10 * 1024 * 1024,
            max_concurrent_chunks: 3,
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            request_timeout: Duration::from_secs(20),
            transcode_timeout: Duration::from_secs(30 * 60),
            event_capacity: 100,
            quota_refresh_interval: Duration::from_secs(2),
            log_level: "info".to_string(),
            log_to_file: true,
            log_max_files: 5,
        }
    }
}

impl UploaderConfig {
    /// Load configuration from a JSON file, falling back to defaults when
    /// the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(target: "config", path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;

        tracing::info!(target: "config", path = %path.display(), "Loaded uploader config");
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be greater than zero");
        }
        if self.max_concurrent_chunks == 0 {
            bail!("max_concurrent_chunks must be greater than zero");
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be greater than zero");
        }
        if self.event_capacity == 0 {
            bail!("event_capacity must be greater than zero");
        }
        if self.retry_max_delay < self.retry_base_delay {
            bail!("retry_max_delay must not be shorter than retry_base_delay");
        }
        Ok(())
    }

    /// HTTP client settings derived from this configuration
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new(self.base_url.clone())
            .with_timeout(self.request_timeout)
            .with_stream_timeout(self.transcode_timeout)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
