//! Streaming upload coordinator
//!
//! Buffers chunks as they arrive from a live capture and uploads them as
//! multipart parts, strictly one at a time and in order. The total size is
//! unknown until `finalize`.
//!
//! Parts travel over a bounded channel to a single upload worker. A failed
//! part ends the worker, so no later part ever starts; the next flush or
//! `finalize` surfaces the error and aborts the remote upload. There is no
//! retry here: a live capture cannot wait on one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{FileUpload, StreamingConfig};
use crate::error::{CaptureError, Result};
use crate::metrics::standard;
use crate::progress::{ProgressCallback, ProgressTracker};
use crate::protocol::{
    abort_best_effort, content_type_for, CompleteResponse, CompletedPart, InitiateRequest,
    MultipartApi,
};
use crate::session::{SessionState, UploadSession};

struct PendingPart {
    part_number: u32,
    bytes: Bytes,
}

struct Pipeline {
    sender: mpsc::Sender<PendingPart>,
    worker: JoinHandle<Result<Vec<CompletedPart>>>,
}

/// Incremental multipart uploader for one recording
pub struct StreamingUploader {
    api: Arc<dyn MultipartApi>,
    file: FileUpload,
    config: StreamingConfig,
    session: Arc<Mutex<UploadSession>>,
    buffer: BytesMut,
    next_part_number: u32,
    total_bytes: Arc<AtomicU64>,
    progress: Arc<Mutex<ProgressTracker>>,
    pipeline: Option<Pipeline>,
    cancel: CancellationToken,
}

impl StreamingUploader {
    pub fn new(
        api: Arc<dyn MultipartApi>,
        file: FileUpload,
        config: StreamingConfig,
        on_progress: Option<ProgressCallback>,
    ) -> Self {
        let progress = ProgressTracker::new(on_progress, config.progress_interval);
        Self {
            api,
            session: Arc::new(Mutex::new(UploadSession::new(file.mime_type.clone()))),
            file,
            buffer: BytesMut::with_capacity(config.effective_part_size()),
            config,
            next_part_number: 1,
            total_bytes: Arc::new(AtomicU64::new(0)),
            progress: Arc::new(Mutex::new(progress)),
            pipeline: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.session.lock().state()
    }

    pub fn upload_id(&self) -> Option<String> {
        self.session.lock().upload_id().map(str::to_string)
    }

    /// Bytes waiting for the next flush
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Parts handed to the upload worker so far
    pub fn parts_produced(&self) -> u32 {
        self.next_part_number - 1
    }

    /// Token that interrupts in-flight network calls when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Initiate the remote upload and start the part worker.
    ///
    /// Called implicitly by the first `handle_chunk`.
    pub async fn start(&mut self) -> Result<()> {
        self.session.lock().transition(SessionState::Initializing)?;

        let request = InitiateRequest {
            file_name: self.file.file_name.clone(),
            file_type: self.file.mime_type.clone(),
            file_size: 0,
            upload_path: self.file.upload_path.clone(),
            part_size: Some(self.config.effective_part_size() as u64),
        };
        let initiated = tokio::select! {
            _ = self.cancel.cancelled() => Err(CaptureError::Cancelled),
            result = self.api.initiate(&request) => result,
        };
        let initiated = match initiated {
            Ok(initiated) => initiated,
            Err(e) => return Err(self.fail(e).await),
        };

        {
            let mut session = self.session.lock();
            session.bind(initiated.upload_id.clone(), initiated.key.clone());
            session.transition(SessionState::Uploading)?;
        }
        info!(
            "Streaming upload {} started for {}",
            initiated.upload_id, initiated.key
        );

        let (sender, receiver) = mpsc::channel(self.config.max_pending_parts.max(1));
        let worker = PartWorker {
            api: self.api.clone(),
            upload_id: initiated.upload_id,
            key: initiated.key,
            content_type: content_type_for(&self.file.mime_type).to_string(),
            session: self.session.clone(),
            progress: self.progress.clone(),
            total_bytes: self.total_bytes.clone(),
            cancel: self.cancel.clone(),
        };
        self.pipeline = Some(Pipeline {
            sender,
            worker: tokio::spawn(worker.run(receiver)),
        });
        Ok(())
    }

    /// Append a captured chunk; flushes a part once the buffer reaches the part size.
    ///
    /// `cumulative_total` is the capture's running byte total, used for progress.
    /// Awaits when too many parts are already waiting for upload.
    pub async fn handle_chunk(&mut self, chunk: &[u8], cumulative_total: u64) -> Result<()> {
        self.surface_worker_failure().await?;
        let state = {
            let session = self.session.lock();
            session.ensure_open()?;
            session.state()
        };
        if state == SessionState::Idle {
            self.start().await?;
        }

        self.total_bytes.fetch_max(cumulative_total, Ordering::Relaxed);
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() >= self.config.effective_part_size() {
            self.flush_part().await?;
        }
        Ok(())
    }

    /// Flush what is buffered, wait for every part, then complete the upload.
    ///
    /// Returns `None` when nothing was ever uploaded.
    pub async fn finalize(&mut self) -> Result<Option<CompleteResponse>> {
        self.surface_worker_failure().await?;
        let state = {
            let session = self.session.lock();
            session.ensure_open()?;
            session.state()
        };

        if state == SessionState::Idle {
            if self.buffer.is_empty() {
                self.session.lock().transition(SessionState::Completed)?;
                info!("Streaming upload finished with no data");
                return Ok(None);
            }
            self.start().await?;
        }

        if !self.buffer.is_empty() {
            self.flush_part().await?;
        }

        let parts = match self.pipeline.take() {
            Some(pipeline) => {
                drop(pipeline.sender);
                match join_worker(pipeline.worker).await {
                    Ok(parts) => parts,
                    Err(e) => return Err(self.fail(e).await),
                }
            }
            None => Vec::new(),
        };

        let (upload_id, key) = self.remote()?;
        self.session.lock().transition(SessionState::Finalizing)?;

        if parts.is_empty() {
            abort_best_effort(self.api.as_ref(), &upload_id, &key).await;
            self.session.lock().transition(SessionState::Completed)?;
            self.progress.lock().complete(0);
            return Ok(None);
        }

        let completed = tokio::select! {
            _ = self.cancel.cancelled() => Err(CaptureError::Cancelled),
            result = self.api.complete(&upload_id, &key, &parts) => result,
        };
        match completed {
            Ok(done) => {
                self.session.lock().transition(SessionState::Completed)?;
                self.progress.lock().complete(parts.len() as u32);
                info!(
                    "Streaming upload {} completed: {} parts at {}",
                    upload_id,
                    parts.len(),
                    done.location
                );
                Ok(Some(done))
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Stop the session: drop buffered bytes, stop the worker, abort remotely.
    ///
    /// Errors from the in-flight part are swallowed.
    pub async fn cancel(&mut self) {
        if self.session.lock().state().is_terminal() {
            return;
        }
        self.cancel.cancel();
        self.session.lock().fail(SessionState::Cancelled);
        self.buffer.clear();

        if let Some(pipeline) = self.pipeline.take() {
            drop(pipeline.sender);
            if let Err(e) = join_worker(pipeline.worker).await {
                debug!("Ignoring pipeline error after cancel: {}", e);
            }
        }

        if let Ok((upload_id, key)) = self.remote() {
            abort_best_effort(self.api.as_ref(), &upload_id, &key).await;
        }
        info!("Streaming upload cancelled");
    }

    async fn flush_part(&mut self) -> Result<()> {
        let bytes = self.buffer.split().freeze();
        let part_number = self.next_part_number;
        self.next_part_number += 1;
        debug!("Flushing part {} ({} bytes)", part_number, bytes.len());

        let sender = match &self.pipeline {
            Some(pipeline) => pipeline.sender.clone(),
            None => {
                return Err(CaptureError::Internal {
                    message: "upload pipeline not running".into(),
                })
            }
        };

        let sent = tokio::select! {
            _ = self.cancel.cancelled() => Err(CaptureError::Cancelled),
            result = sender.send(PendingPart { part_number, bytes }) => Ok(result.is_ok()),
        };
        match sent {
            Ok(true) => Ok(()),
            // worker exited on an earlier failure; surface that failure
            Ok(false) => Err(self.harvest_worker().await),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Report a worker that already stopped on a failed part
    async fn surface_worker_failure(&mut self) -> Result<()> {
        let finished = self
            .pipeline
            .as_ref()
            .is_some_and(|pipeline| pipeline.worker.is_finished());
        if finished {
            return Err(self.harvest_worker().await);
        }
        Ok(())
    }

    /// Join a worker that exited early and fail the session with its error
    async fn harvest_worker(&mut self) -> CaptureError {
        let err = match self.pipeline.take() {
            Some(pipeline) => {
                drop(pipeline.sender);
                match join_worker(pipeline.worker).await {
                    Err(e) => e,
                    Ok(_) => CaptureError::Internal {
                        message: "upload worker stopped unexpectedly".into(),
                    },
                }
            }
            None => CaptureError::Internal {
                message: "upload pipeline not running".into(),
            },
        };
        self.fail(err).await
    }

    fn remote(&self) -> Result<(String, String)> {
        let session = self.session.lock();
        session
            .remote()
            .map(|(id, key)| (id.to_string(), key.to_string()))
            .ok_or_else(|| CaptureError::Internal {
                message: "upload was never initiated".into(),
            })
    }

    /// Mark the session failed, release remote state, hand back the error
    async fn fail(&mut self, err: CaptureError) -> CaptureError {
        let terminal = match err {
            CaptureError::Cancelled => SessionState::Cancelled,
            _ => SessionState::Error,
        };
        self.session.lock().fail(terminal);
        self.buffer.clear();

        if terminal == SessionState::Error {
            standard::UPLOAD_FAILURES.inc();
            error!("Streaming upload failed [{}]: {}", err.code(), err);
        }
        if let Some(pipeline) = self.pipeline.take() {
            self.cancel.cancel();
            drop(pipeline.sender);
            let _ = join_worker(pipeline.worker).await;
        }
        if let Ok((upload_id, key)) = self.remote() {
            abort_best_effort(self.api.as_ref(), &upload_id, &key).await;
        }
        err
    }
}

async fn join_worker(worker: JoinHandle<Result<Vec<CompletedPart>>>) -> Result<Vec<CompletedPart>> {
    worker.await.map_err(|e| CaptureError::Internal {
        message: format!("upload worker panicked: {}", e),
    })?
}

/// The single consumer that uploads parts in order
struct PartWorker {
    api: Arc<dyn MultipartApi>,
    upload_id: String,
    key: String,
    content_type: String,
    session: Arc<Mutex<UploadSession>>,
    progress: Arc<Mutex<ProgressTracker>>,
    total_bytes: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl PartWorker {
    async fn run(self, mut receiver: mpsc::Receiver<PendingPart>) -> Result<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let mut uploaded = 0u64;

        while let Some(part) = receiver.recv().await {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(CaptureError::Cancelled),
                result = self.upload(part) => result,
            };
            let completed = match result {
                Ok(completed) => completed,
                Err(e) => {
                    if !matches!(e, CaptureError::Cancelled) {
                        self.session.lock().fail(SessionState::Error);
                    }
                    return Err(e);
                }
            };

            uploaded += completed.size;
            let total = self.total_bytes.load(Ordering::Relaxed).max(uploaded);
            {
                let mut progress = self.progress.lock();
                progress.set_totals(total, completed.part_number);
                progress.record(uploaded, completed.part_number);
            }
            parts.push(completed);
        }

        Ok(parts)
    }

    async fn upload(&self, part: PendingPart) -> Result<CompletedPart> {
        let _in_flight = standard::ACTIVE_UPLOADS.track();
        let size = part.bytes.len() as u64;

        let url = self
            .api
            .part_upload_url(&self.upload_id, &self.key, part.part_number)
            .await?;
        let started = Instant::now();
        let etag = self
            .api
            .put_part(&url.upload_url, part.bytes, &self.content_type)
            .await?;
        standard::PART_UPLOAD_DURATION.observe_since(started);
        standard::PARTS_UPLOADED.inc();
        standard::BYTES_UPLOADED.inc_by(size);

        debug!("Uploaded part {} ({} bytes)", part.part_number, size);
        Ok(CompletedPart {
            part_number: part.part_number,
            etag,
            size,
        })
    }
}
