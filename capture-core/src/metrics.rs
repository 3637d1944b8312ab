//! Prometheus-format metrics
//!
//! Process-wide counters, gauges and histograms for capture and upload.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

fn header(name: &str, help: &str, kind: &str) -> String {
    format!("# HELP {} {}\n# TYPE {} {}\n", name, help, name, kind)
}

/// Monotonically increasing counter
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
            help,
        }
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn to_prometheus(&self) -> String {
        let mut out = header(self.name, self.help, "counter");
        out.push_str(&format!("{} {}\n", self.name, self.get()));
        out
    }
}

/// Gauge that can move both ways
pub struct Gauge {
    value: AtomicI64,
    name: &'static str,
    help: &'static str,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name,
            help,
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Increment now, decrement when the guard drops
    pub fn track(&'static self) -> GaugeGuard {
        self.inc();
        GaugeGuard { gauge: self }
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn to_prometheus(&self) -> String {
        let mut out = header(self.name, self.help, "gauge");
        out.push_str(&format!("{} {}\n", self.name, self.get()));
        out
    }
}

/// Decrements its gauge on drop, including when a task is aborted mid-flight
pub struct GaugeGuard {
    gauge: &'static Gauge,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

/// Latency histogram in seconds
pub struct Histogram {
    bounds: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Histogram {
    pub fn with_buckets(name: &'static str, help: &'static str, bounds: Vec<f64>) -> Self {
        let counts = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            counts,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
            name,
            help,
        }
    }

    pub fn observe(&self, seconds: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((seconds * 1_000_000.0) as u64, Ordering::Relaxed);
        for (bound, count) in self.bounds.iter().zip(&self.counts) {
            if seconds <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn observe_duration(&self, elapsed: Duration) {
        self.observe(elapsed.as_secs_f64());
    }

    /// Observe the time since `started`
    pub fn observe_since(&self, started: Instant) {
        self.observe_duration(started.elapsed());
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn to_prometheus(&self) -> String {
        let mut out = header(self.name, self.help, "histogram");
        for (bound, count) in self.bounds.iter().zip(&self.counts) {
            out.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                self.name,
                bound,
                count.load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", self.name, self.count()));
        let sum_secs = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        out.push_str(&format!("{}_sum {}\n", self.name, sum_secs));
        out.push_str(&format!("{}_count {}\n", self.name, self.count()));
        out
    }
}

/// Standard capture and upload metrics
pub mod standard {
    use super::*;
    use std::sync::LazyLock;

    pub static PARTS_UPLOADED: Counter = Counter::new(
        "capture_parts_uploaded_total",
        "Total multipart parts accepted by storage",
    );

    pub static BYTES_UPLOADED: Counter = Counter::new(
        "capture_bytes_uploaded_total",
        "Total part bytes uploaded",
    );

    pub static PART_RETRIES: Counter = Counter::new(
        "capture_part_retries_total",
        "Part upload attempts that were retried",
    );

    pub static UPLOAD_FAILURES: Counter = Counter::new(
        "capture_upload_failures_total",
        "Upload sessions that ended in error",
    );

    pub static CHUNKS_PERSISTED: Counter = Counter::new(
        "capture_chunks_persisted_total",
        "Chunks durably written to the local store",
    );

    pub static BYTES_PERSISTED: Counter = Counter::new(
        "capture_bytes_persisted_total",
        "Chunk bytes durably written to the local store",
    );

    pub static DUPLICATE_CHUNKS_DROPPED: Counter = Counter::new(
        "capture_duplicate_chunks_dropped_total",
        "Chunks discarded as duplicates",
    );

    pub static CAPTURE_ABORTS: Counter = Counter::new(
        "capture_aborts_total",
        "Recordings stopped for low storage or write failure",
    );

    pub static ACTIVE_UPLOADS: Gauge =
        Gauge::new("capture_active_uploads", "Part uploads currently in flight");

    pub static PART_UPLOAD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::with_buckets(
            "capture_part_upload_duration_seconds",
            "Part PUT latency",
            vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0],
        )
    });
}

/// Render all standard metrics in Prometheus text format
pub fn gather_upload_metrics() -> String {
    let mut output = String::new();

    // Counters
    output.push_str(&standard::PARTS_UPLOADED.to_prometheus());
    output.push_str(&standard::BYTES_UPLOADED.to_prometheus());
    output.push_str(&standard::PART_RETRIES.to_prometheus());
    output.push_str(&standard::UPLOAD_FAILURES.to_prometheus());
    output.push_str(&standard::CHUNKS_PERSISTED.to_prometheus());
    output.push_str(&standard::BYTES_PERSISTED.to_prometheus());
    output.push_str(&standard::DUPLICATE_CHUNKS_DROPPED.to_prometheus());
    output.push_str(&standard::CAPTURE_ABORTS.to_prometheus());

    // Gauges
    output.push_str(&standard::ACTIVE_UPLOADS.to_prometheus());

    // Histograms
    output.push_str(&standard::PART_UPLOAD_DURATION.to_prometheus());

    output
}
