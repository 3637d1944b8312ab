//! Batch upload coordinator
//!
//! Uploads one complete blob of known size through a bounded pool of part
//! workers. A freed slot is refilled as soon as any in-flight part
//! finishes. Each part retries with linear backoff and a fresh presigned
//! URL per attempt; a part that exhausts its retries fails the whole upload,
//! which is then aborted remotely.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::part_size::PartPlan;
use super::retry::RetryPolicy;
use crate::config::{BatchConfig, FileUpload};
use crate::error::{CaptureError, Result};
use crate::metrics::standard;
use crate::progress::{ProgressCallback, ProgressTracker};
use crate::protocol::{
    abort_best_effort, content_type_for, CompleteResponse, CompletedPart, InitiateRequest,
    MultipartApi,
};
use crate::session::{SessionState, UploadSession};

/// Parallel multipart uploader for one complete blob
pub struct BatchUploader {
    api: Arc<dyn MultipartApi>,
    file: FileUpload,
    config: BatchConfig,
    session: Mutex<UploadSession>,
    on_progress: Option<ProgressCallback>,
    cancel: CancellationToken,
}

impl BatchUploader {
    pub fn new(
        api: Arc<dyn MultipartApi>,
        file: FileUpload,
        config: BatchConfig,
        on_progress: Option<ProgressCallback>,
    ) -> Self {
        Self {
            api,
            session: Mutex::new(UploadSession::new(file.mime_type.clone())),
            file,
            config,
            on_progress,
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.session.lock().state()
    }

    /// Token that cancels this upload when triggered
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop scheduling parts and interrupt in-flight requests.
    ///
    /// `upload` returns `Cancelled` once outstanding work has unwound.
    pub fn cancel(&self) {
        info!("Batch upload cancellation requested");
        self.cancel.cancel();
        let mut session = self.session.lock();
        if session.state() == SessionState::Idle {
            session.fail(SessionState::Cancelled);
        }
    }

    /// Upload `blob` and complete the multipart upload
    pub async fn upload(&self, blob: Bytes) -> Result<CompleteResponse> {
        if self.cancel.is_cancelled() {
            return Err(CaptureError::Cancelled);
        }
        if blob.is_empty() {
            return Err(CaptureError::EmptyUpload);
        }
        let local = PartPlan::local(blob.len() as u64);
        local.check_limits()?;
        self.session.lock().transition(SessionState::Initializing)?;

        let request = InitiateRequest {
            file_name: self.file.file_name.clone(),
            file_type: self.file.mime_type.clone(),
            file_size: local.total_size,
            upload_path: self.file.upload_path.clone(),
            part_size: Some(local.part_size),
        };
        let initiated = match self.guarded(self.api.initiate(&request)).await {
            Ok(initiated) => initiated,
            Err(e) => return Err(self.fail(e).await),
        };
        self.session
            .lock()
            .bind(initiated.upload_id.clone(), initiated.key.clone());

        let plan = match local.reconcile(initiated.total_parts) {
            Ok(plan) => plan,
            Err(e) => return Err(self.fail(e).await),
        };
        if plan != local {
            warn!(
                "Server declared {} parts, local plan had {}; using {} byte parts",
                plan.total_parts, local.total_parts, plan.part_size
            );
        }
        self.session.lock().transition(SessionState::Uploading)?;
        info!(
            "Batch upload {}: {} bytes in {} parts of {} bytes, concurrency {}",
            initiated.upload_id,
            plan.total_size,
            plan.total_parts,
            plan.part_size,
            self.config.concurrency
        );

        let target = Arc::new(PartTarget {
            api: self.api.clone(),
            upload_id: initiated.upload_id.clone(),
            key: initiated.key.clone(),
            content_type: content_type_for(&self.file.mime_type).to_string(),
            retry: self.config.retry,
            cancel: self.cancel.clone(),
        });
        let parts = match self.upload_parts(&blob, plan, target).await {
            Ok(parts) => parts,
            Err(e) => return Err(self.fail(e).await),
        };

        self.session.lock().transition(SessionState::Finalizing)?;
        let completed = self
            .guarded(
                self.api
                    .complete(&initiated.upload_id, &initiated.key, &parts),
            )
            .await;
        match completed {
            Ok(done) => {
                self.session.lock().transition(SessionState::Completed)?;
                info!(
                    "Batch upload {} completed at {}",
                    initiated.upload_id, done.location
                );
                Ok(done)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Run the bounded worker pool until every part is uploaded
    async fn upload_parts(
        &self,
        blob: &Bytes,
        plan: PartPlan,
        target: Arc<PartTarget>,
    ) -> Result<Vec<CompletedPart>> {
        let concurrency = self.config.concurrency.max(1);
        let mut progress = ProgressTracker::new(self.on_progress.clone(), self.config.progress_interval);
        progress.set_totals(plan.total_size, plan.total_parts);

        let mut in_flight: JoinSet<Result<CompletedPart>> = JoinSet::new();
        let mut parts = Vec::with_capacity(plan.total_parts as usize);
        let mut next_part = 1u32;
        let mut uploaded = 0u64;

        loop {
            while in_flight.len() < concurrency
                && next_part <= plan.total_parts
                && !self.cancel.is_cancelled()
            {
                let job = PartJob {
                    target: target.clone(),
                    part_number: next_part,
                    body: blob.slice(plan.range(next_part)),
                };
                in_flight.spawn(job.run());
                next_part += 1;
            }

            if self.cancel.is_cancelled() {
                in_flight.shutdown().await;
                return Err(CaptureError::Cancelled);
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let part = match joined {
                Ok(Ok(part)) => part,
                Ok(Err(e)) => {
                    in_flight.shutdown().await;
                    return Err(e);
                }
                Err(e) => {
                    in_flight.shutdown().await;
                    return Err(CaptureError::Internal {
                        message: format!("part task failed: {}", e),
                    });
                }
            };

            uploaded += part.size;
            parts.push(part);
            let done = parts.len() as u32;
            if done == plan.total_parts {
                progress.complete(done);
            } else {
                progress.record(uploaded, done);
            }
        }

        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    /// Run a network call unless cancelled, racing it against cancellation.
    ///
    /// The call is polled first, so a result that is already in hand wins
    /// over a cancellation that lands at the same time.
    async fn guarded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        if self.cancel.is_cancelled() {
            return Err(CaptureError::Cancelled);
        }
        tokio::select! {
            biased;
            result = call => result,
            _ = self.cancel.cancelled() => Err(CaptureError::Cancelled),
        }
    }

    /// Mark the session failed, release remote state, hand back the error
    async fn fail(&self, err: CaptureError) -> CaptureError {
        let terminal = match err {
            CaptureError::Cancelled => SessionState::Cancelled,
            _ => SessionState::Error,
        };
        let remote = {
            let mut session = self.session.lock();
            session.fail(terminal);
            session
                .remote()
                .map(|(id, key)| (id.to_string(), key.to_string()))
        };

        if terminal == SessionState::Error {
            standard::UPLOAD_FAILURES.inc();
            error!("Batch upload failed [{}]: {}", err.code(), err);
        } else {
            info!("Batch upload cancelled");
        }
        if let Some((upload_id, key)) = remote {
            abort_best_effort(self.api.as_ref(), &upload_id, &key).await;
        }
        err
    }
}

/// What every part of one upload shares
struct PartTarget {
    api: Arc<dyn MultipartApi>,
    upload_id: String,
    key: String,
    content_type: String,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

struct PartJob {
    target: Arc<PartTarget>,
    part_number: u32,
    body: Bytes,
}

impl PartJob {
    async fn run(self) -> Result<CompletedPart> {
        let _in_flight = standard::ACTIVE_UPLOADS.track();
        let cancel = self.target.cancel.clone();
        let mut attempt = 1u32;

        loop {
            if cancel.is_cancelled() {
                return Err(CaptureError::Cancelled);
            }
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(CaptureError::Cancelled),
                result = self.attempt() => result,
            };

            match result {
                Ok(etag) => {
                    debug!(
                        "Uploaded part {} ({} bytes) on attempt {}",
                        self.part_number,
                        self.body.len(),
                        attempt
                    );
                    return Ok(CompletedPart {
                        part_number: self.part_number,
                        etag,
                        size: self.body.len() as u64,
                    });
                }
                Err(e) if self.target.retry.should_retry(attempt, &e) => {
                    standard::PART_RETRIES.inc();
                    debug!("Part {} attempt {} failed: {}", self.part_number, attempt, e);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(CaptureError::Cancelled),
                        _ = self.target.retry.wait_before_retry(attempt, self.part_number) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    if !matches!(e, CaptureError::Cancelled) {
                        error!(
                            "Part {} failed after {} attempt(s): {}",
                            self.part_number, attempt, e
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    /// One try: fresh presigned URL, then PUT
    async fn attempt(&self) -> Result<String> {
        let target = &self.target;
        let url = target
            .api
            .part_upload_url(&target.upload_id, &target.key, self.part_number)
            .await?;
        if target.cancel.is_cancelled() {
            return Err(CaptureError::Cancelled);
        }

        let started = Instant::now();
        let etag = target
            .api
            .put_part(&url.upload_url, self.body.clone(), &target.content_type)
            .await?;
        standard::PART_UPLOAD_DURATION.observe_since(started);
        standard::PARTS_UPLOADED.inc();
        standard::BYTES_UPLOADED.inc_by(self.body.len() as u64);
        Ok(etag)
    }
}
