//! In-memory multipart endpoint shared by the upload tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use capture_core::error::{CaptureError, Result};
use capture_core::protocol::{
    CompleteResponse, CompletedPart, InitiateRequest, InitiateResponse, MultipartApi, PartUrl,
};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

pub const MIB: usize = 1024 * 1024;

/// One PUT the fake received
#[derive(Debug, Clone)]
pub struct PutAttempt {
    pub part_number: u32,
    pub size: usize,
    pub checksum: u32,
    pub content_type: String,
    pub at: Instant,
    pub succeeded: bool,
}

#[derive(Default)]
struct Recorded {
    initiates: Vec<InitiateRequest>,
    url_requests: Vec<u32>,
    puts: Vec<PutAttempt>,
    completed: Option<Vec<CompletedPart>>,
    aborts: usize,
}

/// Fake signing server plus object store
#[derive(Default)]
pub struct FakeApi {
    recorded: Mutex<Recorded>,
    /// Remaining scripted PUT failures per part, with the status to return
    put_failures: Mutex<HashMap<u32, (u32, u16)>>,
    declared_parts: Mutex<Option<u32>>,
    put_delay: Mutex<Duration>,
    staggered: AtomicBool,
    hold_puts: AtomicBool,
    fail_complete: AtomicBool,
    on_complete: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    pub put_started: Notify,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `times` PUTs of `part_number` with `status`
    pub fn fail_put(&self, part_number: u32, times: u32, status: u16) {
        self.put_failures.lock().insert(part_number, (times, status));
    }

    /// Report `totalParts` from initiate
    pub fn declare_parts(&self, parts: u32) {
        *self.declared_parts.lock() = Some(parts);
    }

    /// Sleep this long inside every PUT
    pub fn set_put_delay(&self, delay: Duration) {
        *self.put_delay.lock() = delay;
    }

    /// Vary the PUT delay by part number so parts finish out of order
    pub fn stagger_puts(&self) {
        self.staggered.store(true, Ordering::SeqCst);
    }

    /// Park every PUT until the caller cancels
    pub fn hold_puts(&self) {
        self.hold_puts.store(true, Ordering::SeqCst);
    }

    pub fn fail_complete(&self) {
        self.fail_complete.store(true, Ordering::SeqCst);
    }

    /// Run `hook` inside complete, before it answers
    pub fn on_complete(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_complete.lock() = Some(Box::new(hook));
    }

    pub fn initiates(&self) -> Vec<InitiateRequest> {
        self.recorded.lock().initiates.clone()
    }

    pub fn url_requests(&self) -> Vec<u32> {
        self.recorded.lock().url_requests.clone()
    }

    pub fn puts(&self) -> Vec<PutAttempt> {
        self.recorded.lock().puts.clone()
    }

    pub fn puts_for(&self, part_number: u32) -> Vec<PutAttempt> {
        self.puts()
            .into_iter()
            .filter(|p| p.part_number == part_number)
            .collect()
    }

    pub fn completed(&self) -> Option<Vec<CompletedPart>> {
        self.recorded.lock().completed.clone()
    }

    pub fn aborts(&self) -> usize {
        self.recorded.lock().aborts
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn part_from_url(url: &str) -> u32 {
        url.rsplit('/')
            .next()
            .and_then(|segment| segment.parse().ok())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MultipartApi for FakeApi {
    async fn initiate(&self, request: &InitiateRequest) -> Result<InitiateResponse> {
        self.recorded.lock().initiates.push(request.clone());
        Ok(InitiateResponse {
            upload_id: "upload-1".into(),
            key: format!("{}/{}", request.upload_path, request.file_name),
            total_parts: *self.declared_parts.lock(),
        })
    }

    async fn part_upload_url(&self, upload_id: &str, _key: &str, part_number: u32) -> Result<PartUrl> {
        self.recorded.lock().url_requests.push(part_number);
        Ok(PartUrl {
            upload_url: format!("https://storage.test/{}/{}", upload_id, part_number),
            expires_in: Some(3600),
        })
    }

    async fn put_part(&self, upload_url: &str, body: Bytes, content_type: &str) -> Result<String> {
        let part_number = Self::part_from_url(upload_url);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let in_flight = InFlight(&self.in_flight);
        self.put_started.notify_one();

        if self.hold_puts.load(Ordering::SeqCst) {
            // released only by the caller's cancellation dropping this future
            std::future::pending::<()>().await;
        }

        let mut delay = *self.put_delay.lock();
        if self.staggered.load(Ordering::SeqCst) {
            delay *= 1 + part_number % 3;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        drop(in_flight);

        let failure = {
            let mut failures = self.put_failures.lock();
            match failures.get_mut(&part_number) {
                Some((remaining, status)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(*status)
                }
                _ => None,
            }
        };

        self.recorded.lock().puts.push(PutAttempt {
            part_number,
            size: body.len(),
            checksum: crc32c::crc32c(&body),
            content_type: content_type.to_string(),
            at: Instant::now(),
            succeeded: failure.is_none(),
        });

        match failure {
            Some(status) => Err(CaptureError::Upload {
                status,
                message: "scripted failure".into(),
            }),
            None => Ok(format!("\"etag-{}\"", part_number)),
        }
    }

    async fn complete(
        &self,
        _upload_id: &str,
        key: &str,
        parts: &[CompletedPart],
    ) -> Result<CompleteResponse> {
        if self.fail_complete.load(Ordering::SeqCst) {
            return Err(CaptureError::Upload {
                status: 400,
                message: "InvalidPart".into(),
            });
        }
        if let Some(hook) = self.on_complete.lock().as_ref() {
            hook();
        }
        self.recorded.lock().completed = Some(parts.to_vec());
        Ok(CompleteResponse {
            location: format!("https://storage.test/{}", key),
            key: key.to_string(),
            etag: Some("\"final\"".into()),
        })
    }

    async fn abort(&self, _upload_id: &str, _key: &str) -> Result<()> {
        self.recorded.lock().aborts += 1;
        Ok(())
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Blob whose bytes encode their own offset
pub fn patterned(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}
