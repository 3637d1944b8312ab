//! Upload progress reporting
//!
//! Snapshots are throttled to a fixed interval, except the completing
//! snapshot which is always delivered.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Point-in-time view of an upload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub percentage: f64,
    pub current_part: u32,
    pub total_parts: u32,
    /// Bytes per second since the upload started
    pub rate: f64,
    pub eta_seconds: Option<f64>,
    pub is_complete: bool,
}

/// Callback invoked with each emitted snapshot
pub type ProgressCallback = Arc<dyn Fn(&ProgressSnapshot) + Send + Sync>;

/// Builds and throttles progress snapshots for one session
pub struct ProgressTracker {
    callback: Option<ProgressCallback>,
    interval: Duration,
    started: Instant,
    last_emit: Option<Instant>,
    uploaded_bytes: u64,
    total_bytes: u64,
    total_parts: u32,
    completed: bool,
}

impl ProgressTracker {
    pub fn new(callback: Option<ProgressCallback>, interval: Duration) -> Self {
        Self {
            callback,
            interval,
            started: Instant::now(),
            last_emit: None,
            uploaded_bytes: 0,
            total_bytes: 0,
            total_parts: 0,
            completed: false,
        }
    }

    /// Update the expected totals; totals only grow
    pub fn set_totals(&mut self, total_bytes: u64, total_parts: u32) {
        self.total_bytes = self.total_bytes.max(total_bytes);
        self.total_parts = self.total_parts.max(total_parts);
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes
    }

    /// Record a finished part and emit if the throttle allows
    pub fn record(&mut self, uploaded_bytes: u64, current_part: u32) -> Option<ProgressSnapshot> {
        self.uploaded_bytes = self.uploaded_bytes.max(uploaded_bytes);
        let now = Instant::now();
        let due = self
            .last_emit
            .map_or(true, |last| now.duration_since(last) >= self.interval);
        if !due {
            return None;
        }
        self.last_emit = Some(now);
        let snapshot = self.snapshot(current_part, false);
        self.emit(&snapshot);
        Some(snapshot)
    }

    /// Emit the final snapshot, bypassing the throttle. Emits once.
    pub fn complete(&mut self, current_part: u32) -> Option<ProgressSnapshot> {
        if self.completed {
            return None;
        }
        self.completed = true;
        self.total_bytes = self.total_bytes.max(self.uploaded_bytes);
        self.uploaded_bytes = self.total_bytes;
        self.total_parts = self.total_parts.max(current_part);
        let snapshot = self.snapshot(current_part, true);
        self.emit(&snapshot);
        Some(snapshot)
    }

    /// Current snapshot without emitting
    pub fn snapshot(&self, current_part: u32, is_complete: bool) -> ProgressSnapshot {
        let elapsed = self.started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            self.uploaded_bytes as f64 / elapsed
        } else {
            0.0
        };
        let percentage = if is_complete {
            100.0
        } else if self.total_bytes > 0 {
            (self.uploaded_bytes as f64 / self.total_bytes as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
        let remaining = self.total_bytes.saturating_sub(self.uploaded_bytes);
        let eta_seconds = if is_complete {
            Some(0.0)
        } else if rate > 0.0 {
            Some(remaining as f64 / rate)
        } else {
            None
        };

        ProgressSnapshot {
            uploaded_bytes: self.uploaded_bytes,
            total_bytes: self.total_bytes,
            percentage,
            current_part,
            total_parts: self.total_parts,
            rate,
            eta_seconds,
            is_complete,
        }
    }

    fn emit(&self, snapshot: &ProgressSnapshot) {
        if let Some(callback) = &self.callback {
            callback(snapshot);
        }
    }
}
