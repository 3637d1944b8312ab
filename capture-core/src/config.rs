//! Configuration for the protocol client, coordinators and local store

use std::time::Duration;

use crate::error::{CaptureError, Result};
use crate::upload::part_size::MIN_PART_SIZE;
use crate::upload::retry::RetryPolicy;

/// Connection settings for the signing server
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the signing server, without trailing slash
    pub api_base: String,
    /// Bearer token sent on every signing-server call
    pub auth_token: String,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Request timeout, applied to part PUTs as well
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:3000".into(),
            auth_token: String::new(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(300),
        }
    }
}

impl ClientConfig {
    /// Load from `CAPTURE_*` environment variables
    pub fn from_env() -> Result<Self> {
        let api_base = std::env::var("CAPTURE_API_BASE").map_err(|_| CaptureError::Config {
            reason: "CAPTURE_API_BASE is not set".into(),
        })?;
        let auth_token = std::env::var("CAPTURE_AUTH_TOKEN").map_err(|_| CaptureError::Config {
            reason: "CAPTURE_AUTH_TOKEN is not set".into(),
        })?;

        let defaults = Self::default();
        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            auth_token,
            connect_timeout: env_secs("CAPTURE_CONNECT_TIMEOUT_SECS")?
                .unwrap_or(defaults.connect_timeout),
            request_timeout: env_secs("CAPTURE_REQUEST_TIMEOUT_SECS")?
                .unwrap_or(defaults.request_timeout),
        })
    }
}

fn env_secs(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|e| CaptureError::Config {
                reason: format!("{} must be a whole number of seconds: {}", name, e),
            }),
        Err(_) => Ok(None),
    }
}

/// Remote object description shared by both coordinators
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub file_name: String,
    /// Full MIME type, codec parameters included
    pub mime_type: String,
    /// Destination prefix on the remote side
    pub upload_path: String,
}

impl FileUpload {
    pub fn new(
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        upload_path: impl Into<String>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            upload_path: upload_path.into(),
        }
    }
}

/// Streaming coordinator settings
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Buffered bytes that trigger a part flush
    pub part_size: usize,
    /// Parts allowed to wait for upload before `handle_chunk` stalls
    pub max_pending_parts: usize,
    /// Minimum gap between progress callbacks
    pub progress_interval: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            part_size: MIN_PART_SIZE,
            max_pending_parts: 4,
            progress_interval: Duration::from_millis(500),
        }
    }
}

impl StreamingConfig {
    /// Part size with the protocol floor applied
    pub fn effective_part_size(&self) -> usize {
        self.part_size.max(MIN_PART_SIZE)
    }
}

/// Batch coordinator settings
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Parts in flight at once
    pub concurrency: usize,
    /// Per-part retry policy
    pub retry: RetryPolicy,
    /// Minimum gap between progress callbacks
    pub progress_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 6,
            retry: RetryPolicy::default(),
            progress_interval: Duration::from_millis(500),
        }
    }
}

/// Local persistence settings
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Headroom that must stay free on top of the incoming chunk
    pub min_free_bytes: u64,
    /// Minimum gap between storage estimate queries
    pub quota_check_interval: Duration,
    /// Notify the backup channel for every persisted index
    pub backup_enabled: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            min_free_bytes: 100 * 1024 * 1024,
            quota_check_interval: Duration::from_secs(5),
            backup_enabled: false,
        }
    }
}
