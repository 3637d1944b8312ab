//! Durable storage headroom estimates

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::error::Result;

/// Used vs. quota, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageEstimate {
    pub used: u64,
    pub quota: u64,
}

impl StorageEstimate {
    pub fn free(&self) -> u64 {
        self.quota.saturating_sub(self.used)
    }
}

/// Source of storage estimates. Queried at most once per check interval.
#[async_trait]
pub trait StorageEstimator: Send + Sync {
    async fn estimate(&self) -> Result<StorageEstimate>;
}

/// Estimate pushed in by the capture source
#[derive(Debug)]
pub struct ReportedEstimate {
    used: AtomicU64,
    quota: AtomicU64,
}

impl ReportedEstimate {
    pub fn new(used: u64, quota: u64) -> Self {
        Self {
            used: AtomicU64::new(used),
            quota: AtomicU64::new(quota),
        }
    }

    /// Record the latest (used, quota) report
    pub fn report(&self, used: u64, quota: u64) {
        self.used.store(used, Ordering::Relaxed);
        self.quota.store(quota, Ordering::Relaxed);
    }
}

#[async_trait]
impl StorageEstimator for ReportedEstimate {
    async fn estimate(&self) -> Result<StorageEstimate> {
        Ok(StorageEstimate {
            used: self.used.load(Ordering::Relaxed),
            quota: self.quota.load(Ordering::Relaxed),
        })
    }
}

/// Bytes under a directory against a fixed quota
#[derive(Debug, Clone)]
pub struct DirectoryEstimate {
    dir: PathBuf,
    quota: u64,
}

impl DirectoryEstimate {
    pub fn new(dir: impl Into<PathBuf>, quota: u64) -> Self {
        Self {
            dir: dir.into(),
            quota,
        }
    }
}

#[async_trait]
impl StorageEstimator for DirectoryEstimate {
    async fn estimate(&self) -> Result<StorageEstimate> {
        let mut used = 0u64;
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StorageEstimate { used: 0, quota: self.quota })
            }
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_file() {
                used += meta.len();
            }
        }
        Ok(StorageEstimate {
            used,
            quota: self.quota,
        })
    }
}
