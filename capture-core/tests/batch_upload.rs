//! Integration tests for the batch upload coordinator

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use capture_core::error::CaptureError;
use capture_core::upload::RetryPolicy;
use capture_core::{BatchConfig, BatchUploader, FileUpload, ProgressCallback, ProgressSnapshot, SessionState};
use parking_lot::Mutex;

use common::{patterned, FakeApi, MIB};

fn file() -> FileUpload {
    FileUpload::new("talk.webm", "video/webm;codecs=vp9,opus", "recordings")
}

fn config(concurrency: usize) -> BatchConfig {
    BatchConfig {
        concurrency,
        retry: RetryPolicy::new(3, Duration::from_secs(1)),
        progress_interval: Duration::from_millis(500),
    }
}

fn uploader(api: &Arc<FakeApi>, concurrency: usize) -> BatchUploader {
    BatchUploader::new(api.clone(), file(), config(concurrency), None)
}

#[tokio::test(start_paused = true)]
async fn test_120mb_uploads_three_parts() {
    let api = FakeApi::new();
    api.set_put_delay(Duration::from_millis(10));
    let uploader = uploader(&api, 2);

    let done = uploader.upload(Bytes::from(vec![7u8; 120 * MIB])).await.unwrap();
    assert_eq!(done.key, "recordings/talk.webm");
    assert_eq!(uploader.state(), SessionState::Completed);

    let parts = api.completed().unwrap();
    let sizes: Vec<u64> = parts.iter().map(|p| p.size).collect();
    assert_eq!(sizes, vec![50 * MIB as u64, 50 * MIB as u64, 20 * MIB as u64]);
    assert_eq!(api.max_in_flight(), 2);

    let initiate = &api.initiates()[0];
    assert_eq!(initiate.file_size, 120 * MIB as u64);
    assert_eq!(initiate.part_size, Some(50 * MIB as u64));
    assert!(api.puts().iter().all(|p| p.content_type == "video/webm"));
    assert_eq!(api.aborts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_limit_respected() {
    let api = FakeApi::new();
    api.declare_parts(24);
    api.set_put_delay(Duration::from_millis(5));
    api.stagger_puts();
    let uploader = uploader(&api, 6);

    uploader.upload(Bytes::from(vec![1u8; 120 * MIB])).await.unwrap();

    assert!(api.max_in_flight() <= 6);
    assert_eq!(api.max_in_flight(), 6);
    let numbers: Vec<u32> = api.completed().unwrap().iter().map(|p| p.part_number).collect();
    assert_eq!(numbers, (1..=24).collect::<Vec<u32>>());
}

#[tokio::test(start_paused = true)]
async fn test_part_bytes_match_blob_ranges() {
    let api = FakeApi::new();
    api.declare_parts(3);
    let uploader = uploader(&api, 3);

    // 30MB with the server asking for 3 parts of 10MB
    let blob = patterned(30 * MIB);
    uploader.upload(blob.clone()).await.unwrap();

    let mut puts = api.puts();
    puts.sort_by_key(|p| p.part_number);
    assert_eq!(puts.len(), 3);
    for (i, put) in puts.iter().enumerate() {
        let range = i * 10 * MIB..(i + 1) * 10 * MIB;
        assert_eq!(put.size, 10 * MIB);
        assert_eq!(put.checksum, crc32c::crc32c(&blob[range]));
    }
}

#[tokio::test(start_paused = true)]
async fn test_retry_then_succeed_with_linear_backoff() {
    let api = FakeApi::new();
    api.fail_put(1, 2, 503);
    let uploader = uploader(&api, 1);

    uploader.upload(patterned(1024)).await.unwrap();

    let attempts = api.puts_for(1);
    assert_eq!(attempts.len(), 3);
    assert!(!attempts[0].succeeded && !attempts[1].succeeded && attempts[2].succeeded);

    let first_gap = attempts[1].at - attempts[0].at;
    let second_gap = attempts[2].at - attempts[1].at;
    assert!(second_gap > first_gap);
    assert!(first_gap >= Duration::from_secs(1) && first_gap < Duration::from_millis(1100));
    assert!(second_gap >= Duration::from_secs(2) && second_gap < Duration::from_millis(2100));

    // a fresh presigned URL for every attempt
    assert_eq!(api.url_requests(), vec![1, 1, 1]);
    assert_eq!(uploader.state(), SessionState::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_abort_upload() {
    let api = FakeApi::new();
    api.fail_put(1, 3, 500);
    let uploader = uploader(&api, 1);

    let err = uploader.upload(patterned(1024)).await.unwrap_err();
    assert!(matches!(err, CaptureError::Upload { status: 500, .. }));
    assert_eq!(api.puts_for(1).len(), 3);
    assert_eq!(api.aborts(), 1);
    assert!(api.completed().is_none());
    assert_eq!(uploader.state(), SessionState::Error);
}

#[tokio::test(start_paused = true)]
async fn test_client_error_not_retried() {
    let api = FakeApi::new();
    api.fail_put(1, 1, 403);
    let uploader = uploader(&api, 1);

    let err = uploader.upload(patterned(1024)).await.unwrap_err();
    assert_eq!(err.code(), "UPLOAD_ERROR");
    assert_eq!(api.puts_for(1).len(), 1);
    assert_eq!(api.aborts(), 1);
}

#[tokio::test]
async fn test_cancel_mid_upload() {
    let api = FakeApi::new();
    api.hold_puts();
    let uploader = Arc::new(uploader(&api, 2));

    let task = {
        let uploader = uploader.clone();
        tokio::spawn(async move { uploader.upload(Bytes::from(vec![0u8; 120 * MIB])).await })
    };
    api.put_started.notified().await;
    uploader.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, CaptureError::Cancelled));
    assert_eq!(uploader.state(), SessionState::Cancelled);
    assert!(api.completed().is_none());
    assert_eq!(api.aborts(), 1);
    // the third part was never scheduled
    assert!(api.url_requests().iter().all(|&n| n <= 2));

    let again = uploader.upload(patterned(10)).await.unwrap_err();
    assert!(matches!(again, CaptureError::Cancelled));
}

#[tokio::test]
async fn test_server_part_count_wins() {
    let api = FakeApi::new();
    api.declare_parts(4);
    let uploader = uploader(&api, 4);

    uploader.upload(Bytes::from(vec![0u8; 120 * MIB])).await.unwrap();
    let sizes: Vec<u64> = api.completed().unwrap().iter().map(|p| p.size).collect();
    assert_eq!(sizes, vec![30 * MIB as u64; 4]);
}

#[tokio::test]
async fn test_unreachable_server_part_count_aborts() {
    let api = FakeApi::new();
    api.declare_parts(7);
    let uploader = uploader(&api, 2);

    let err = uploader.upload(patterned(10)).await.unwrap_err();
    assert!(matches!(err, CaptureError::InvalidResponse { .. }));
    assert!(api.puts().is_empty());
    assert_eq!(api.aborts(), 1);
}

#[tokio::test]
async fn test_server_part_count_below_floor_aborts() {
    let api = FakeApi::new();
    // 20MB in 10 parts would need 2MB parts
    api.declare_parts(10);
    let uploader = uploader(&api, 2);

    let err = uploader.upload(Bytes::from(vec![0u8; 20 * MIB])).await.unwrap_err();
    assert!(matches!(err, CaptureError::InvalidResponse { operation: "initiate", .. }));
    assert!(api.url_requests().is_empty());
    assert!(api.puts().is_empty());
    assert_eq!(api.aborts(), 1);
    assert_eq!(uploader.state(), SessionState::Error);
}

#[tokio::test]
async fn test_server_single_part_above_ceiling_aborts() {
    let api = FakeApi::new();
    api.declare_parts(1);
    let uploader = uploader(&api, 2);

    let err = uploader.upload(Bytes::from(vec![0u8; 101 * MIB])).await.unwrap_err();
    assert!(matches!(err, CaptureError::InvalidResponse { operation: "initiate", .. }));
    assert!(api.puts().is_empty());
    assert_eq!(api.aborts(), 1);
}

#[tokio::test]
async fn test_completion_beats_simultaneous_cancel() {
    let api = FakeApi::new();
    let uploader = uploader(&api, 2);
    let token = uploader.cancellation_token();
    api.on_complete(move || token.cancel());

    let done = uploader.upload(patterned(4096)).await.unwrap();
    assert_eq!(done.key, "recordings/talk.webm");
    assert_eq!(uploader.state(), SessionState::Completed);
    assert_eq!(api.aborts(), 0);
    assert!(api.completed().is_some());
}

#[tokio::test]
async fn test_complete_failure_aborts() {
    let api = FakeApi::new();
    api.fail_complete();
    let uploader = uploader(&api, 2);

    let err = uploader.upload(patterned(4096)).await.unwrap_err();
    assert!(matches!(err, CaptureError::Upload { status: 400, .. }));
    assert_eq!(api.aborts(), 1);
    assert_eq!(uploader.state(), SessionState::Error);
}

#[tokio::test]
async fn test_empty_blob_rejected() {
    let api = FakeApi::new();
    let uploader = uploader(&api, 2);

    let err = uploader.upload(Bytes::new()).await.unwrap_err();
    assert!(matches!(err, CaptureError::EmptyUpload));
    assert!(api.initiates().is_empty());
    assert_eq!(uploader.state(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_progress_ends_complete() {
    let api = FakeApi::new();
    api.declare_parts(24);
    api.set_put_delay(Duration::from_millis(100));
    let seen: Arc<Mutex<Vec<ProgressSnapshot>>> = Arc::default();
    let on_progress: ProgressCallback = {
        let seen = seen.clone();
        Arc::new(move |snapshot: &ProgressSnapshot| seen.lock().push(snapshot.clone()))
    };
    let uploader = BatchUploader::new(api.clone(), file(), config(2), Some(on_progress));

    uploader.upload(Bytes::from(vec![0u8; 120 * MIB])).await.unwrap();

    let seen = seen.lock();
    let last = seen.last().unwrap();
    assert!(last.is_complete);
    assert_eq!(last.uploaded_bytes, 120 * MIB as u64);
    assert_eq!(last.current_part, 24);
    assert!(seen.windows(2).all(|w| w[0].uploaded_bytes <= w[1].uploaded_bytes));
    // throttled: far fewer callbacks than parts
    assert!(seen.len() < 24);
}
