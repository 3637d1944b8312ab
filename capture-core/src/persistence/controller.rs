//! Local persistence and backpressure controller
//!
//! Single-consumer queue that durably writes captured chunks in arrival
//! order. Storage headroom is checked before every write (throttled);
//! running out of headroom or failing a write aborts the whole recording.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::quota::{StorageEstimate, StorageEstimator};
use super::signal::{AbortReason, AbortSignal};
use super::store::{ChunkRecord, ChunkStore};
use crate::config::PersistenceConfig;
use crate::error::{CaptureError, Result};
use crate::metrics::standard;

/// Counters for one recording session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistenceStats {
    pub persisted_chunks: u64,
    pub persisted_bytes: u64,
    pub duplicates_dropped: u64,
    pub drain_passes: u64,
}

struct PendingChunk {
    bytes: Bytes,
    timestamp: u64,
}

struct CachedEstimate {
    at: Instant,
    estimate: StorageEstimate,
    /// `persisted_bytes` when the estimate was taken
    persisted_at: u64,
}

/// State touched only by the active drain pass
#[derive(Default)]
struct DrainState {
    last_persisted: Option<(u64, usize)>,
    next_index: u64,
    persisted_bytes: u64,
    duplicates_dropped: u64,
    estimate: Option<CachedEstimate>,
}

struct Inner {
    store: Arc<dyn ChunkStore>,
    estimator: Arc<dyn StorageEstimator>,
    config: PersistenceConfig,
    queue: Mutex<VecDeque<PendingChunk>>,
    /// Set while a drain pass owns the queue
    draining: AtomicBool,
    aborted: AtomicBool,
    state: Mutex<DrainState>,
    drain_passes: AtomicU64,
    drained: Notify,
    signal: AbortSignal,
    backup: Mutex<Option<mpsc::UnboundedSender<u64>>>,
}

/// Persistence controller for one recording session
pub struct PersistenceController {
    inner: Arc<Inner>,
}

impl PersistenceController {
    /// Start a recording session on `store`, clearing whatever it held
    pub async fn open(
        store: Arc<dyn ChunkStore>,
        estimator: Arc<dyn StorageEstimator>,
        config: PersistenceConfig,
    ) -> Result<Self> {
        store.clear().await?;
        info!(
            "Persistence session opened (min free {} bytes, quota check every {:?})",
            config.min_free_bytes, config.quota_check_interval
        );

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                estimator,
                config,
                queue: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                aborted: AtomicBool::new(false),
                state: Mutex::new(DrainState::default()),
                drain_passes: AtomicU64::new(0),
                drained: Notify::new(),
                signal: AbortSignal::new(),
                backup: Mutex::new(None),
            }),
        })
    }

    /// Receive every persisted index while backup is enabled
    pub fn set_backup_channel(&self, sender: mpsc::UnboundedSender<u64>) {
        *self.inner.backup.lock() = Some(sender);
    }

    /// Queue a chunk for persistence. Returns false once the session has aborted.
    ///
    /// Never writes directly; a drain pass is started if none is running.
    /// Must be called from within a Tokio runtime.
    pub fn enqueue(&self, bytes: Bytes, timestamp: u64) -> bool {
        if self.inner.aborted.load(Ordering::Acquire) {
            return false;
        }
        self.inner
            .queue
            .lock()
            .push_back(PendingChunk { bytes, timestamp });
        self.inner.kick();
        true
    }

    /// Wait until the queue is empty and no write is in flight
    pub async fn wait_for_drain_completion(&self) {
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Listen for the one-shot abort signal
    pub fn subscribe_abort(&self) -> broadcast::Receiver<AbortReason> {
        self.inner.signal.subscribe()
    }

    pub fn abort_signal(&self) -> AbortSignal {
        self.inner.signal.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PersistenceStats {
        let state = self.inner.state.lock();
        PersistenceStats {
            persisted_chunks: state.next_index,
            persisted_bytes: state.persisted_bytes,
            duplicates_dropped: state.duplicates_dropped,
            drain_passes: self.inner.drain_passes.load(Ordering::Relaxed),
        }
    }

    pub fn store(&self) -> Arc<dyn ChunkStore> {
        self.inner.store.clone()
    }

    /// Drain what is queued, then close the store
    pub async fn close(self) -> Result<PersistenceStats> {
        self.wait_for_drain_completion().await;
        self.inner.store.close().await?;
        let stats = self.stats();
        info!(
            "Persistence session closed: {} chunks, {} bytes, {} duplicates dropped",
            stats.persisted_chunks, stats.persisted_bytes, stats.duplicates_dropped
        );
        Ok(stats)
    }
}

impl Inner {
    fn is_idle(&self) -> bool {
        !self.draining.load(Ordering::Acquire) && self.queue.lock().is_empty()
    }

    /// Start a drain pass unless one already owns the queue
    fn kick(self: &Arc<Self>) {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let inner = self.clone();
            tokio::spawn(async move { inner.drain().await });
        }
    }

    async fn drain(self: Arc<Self>) {
        self.drain_passes.fetch_add(1, Ordering::Relaxed);
        loop {
            loop {
                let next = self.queue.lock().pop_front();
                let Some(chunk) = next else { break };
                self.persist(chunk).await;
            }

            self.draining.store(false, Ordering::Release);
            // An enqueue may have slipped in after the last pop but before
            // the flag cleared; its kick lost the race, so pick it up here.
            let more = !self.queue.lock().is_empty();
            if !more
                || self
                    .draining
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                break;
            }
        }
        self.drained.notify_waiters();
    }

    async fn persist(&self, chunk: PendingChunk) {
        if self.aborted.load(Ordering::Acquire) {
            return;
        }
        let size = chunk.bytes.len();

        {
            let mut state = self.state.lock();
            if state.last_persisted == Some((chunk.timestamp, size)) {
                state.duplicates_dropped += 1;
                standard::DUPLICATE_CHUNKS_DROPPED.inc();
                debug!("Dropping duplicate chunk (ts={}, size={})", chunk.timestamp, size);
                return;
            }
            if let Some((last_ts, _)) = state.last_persisted {
                if chunk.timestamp < last_ts {
                    warn!("Chunk timestamp went backwards: {} < {}", chunk.timestamp, last_ts);
                }
            }
        }

        match self.check_headroom(size as u64).await {
            Ok(()) => {}
            Err(CaptureError::StorageExhausted { free, required }) => {
                self.abort(AbortReason::LowStorage { free, required });
                return;
            }
            Err(e) => warn!("Storage estimate unavailable, writing anyway: {}", e),
        }

        let index = self.state.lock().next_index;
        let record = ChunkRecord::new(index, chunk.bytes, chunk.timestamp);
        if let Err(e) = self.store.append(&record).await {
            error!("Chunk {} write failed: {}", index, e);
            self.abort(AbortReason::WriteFailed {
                message: e.to_string(),
            });
            return;
        }

        {
            let mut state = self.state.lock();
            state.next_index += 1;
            state.persisted_bytes += size as u64;
            state.last_persisted = Some((record.timestamp, size));
        }
        standard::CHUNKS_PERSISTED.inc();
        standard::BYTES_PERSISTED.inc_by(size as u64);
        debug!("Persisted chunk {} ({} bytes)", index, size);

        if self.config.backup_enabled {
            if let Some(sender) = self.backup.lock().as_ref() {
                let _ = sender.send(index);
            }
        }
    }

    /// Fail with `StorageExhausted` if the chunk would eat into the margin
    async fn check_headroom(&self, incoming: u64) -> Result<()> {
        let now = Instant::now();
        let projected = {
            let state = self.state.lock();
            state.estimate.as_ref().and_then(|cached| {
                (now.duration_since(cached.at) < self.config.quota_check_interval).then(|| {
                    StorageEstimate {
                        used: cached.estimate.used + (state.persisted_bytes - cached.persisted_at),
                        quota: cached.estimate.quota,
                    }
                })
            })
        };

        let estimate = match projected {
            Some(estimate) => estimate,
            None => {
                let fresh = self.estimator.estimate().await?;
                let mut state = self.state.lock();
                let persisted_at = state.persisted_bytes;
                state.estimate = Some(CachedEstimate {
                    at: now,
                    estimate: fresh,
                    persisted_at,
                });
                debug!("Storage estimate: {} used of {}", fresh.used, fresh.quota);
                fresh
            }
        };

        let free = estimate.free();
        let required = self.config.min_free_bytes + incoming;
        if free < required {
            return Err(CaptureError::StorageExhausted { free, required });
        }
        Ok(())
    }

    fn abort(&self, reason: AbortReason) {
        self.aborted.store(true, Ordering::Release);
        let discarded = {
            let mut queue = self.queue.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        if self.signal.fire(reason.clone()) {
            standard::CAPTURE_ABORTS.inc();
            error!(
                "Aborting capture: {:?} ({} queued chunks discarded)",
                reason, discarded
            );
        }
    }
}
