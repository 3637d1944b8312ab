//! Live capture binary
//!
//! Reads a recording from stdin, persisting every chunk locally while
//! streaming it to the multipart endpoint.
//!
//! Usage: capture-record <store-dir> [upload-path]

use std::sync::Arc;

use bytes::Bytes;
use capture_core::metrics::gather_upload_metrics;
use capture_core::persistence::{DirectoryEstimate, FileChunkStore, PersistenceController};
use capture_core::{
    ClientConfig, FileUpload, HttpMultipartClient, PersistenceConfig, StreamingConfig,
    StreamingUploader, DEFAULT_MIME_TYPE,
};
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Bytes read from stdin per captured chunk
const CHUNK_SIZE: usize = 256 * 1024;

/// Local quota for the store directory
const STORE_QUOTA: u64 = 4 * 1024 * 1024 * 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let Some(store_dir) = args.next() else {
        return Err("usage: capture-record <store-dir> [upload-path]".into());
    };
    let upload_path = args.next().unwrap_or_else(|| "recordings".into());
    let file_name = format!("recording-{}.webm", chrono::Utc::now().format("%Y%m%d-%H%M%S"));

    let client = Arc::new(HttpMultipartClient::new(ClientConfig::from_env()?)?);
    let store = Arc::new(FileChunkStore::open(&store_dir).await?);
    let estimator = Arc::new(DirectoryEstimate::new(&store_dir, STORE_QUOTA));
    let controller =
        PersistenceController::open(store, estimator, PersistenceConfig::default()).await?;
    let mut aborted = controller.subscribe_abort();

    let mut uploader = StreamingUploader::new(
        client,
        FileUpload::new(file_name.clone(), DEFAULT_MIME_TYPE, upload_path),
        StreamingConfig::default(),
        None,
    );
    info!("Recording {} from stdin into {}", file_name, store_dir);

    let started = Instant::now();
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    let mut last_timestamp = None;
    let mut upload_error = None;

    loop {
        let read = tokio::select! {
            reason = aborted.recv() => {
                warn!("Capture aborted: {:?}", reason);
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping capture");
                break;
            }
            read = stdin.read(&mut buf) => read?,
        };
        if read == 0 {
            break;
        }

        let chunk = Bytes::copy_from_slice(&buf[..read]);
        total += read as u64;
        // stdin reads can land in the same millisecond; keep stamps distinct
        let elapsed = started.elapsed().as_millis() as u64;
        let timestamp = match last_timestamp {
            Some(last) if elapsed <= last => last + 1,
            _ => elapsed,
        };
        last_timestamp = Some(timestamp);
        if !controller.enqueue(chunk.clone(), timestamp) {
            warn!("Persistence aborted, stopping capture");
            break;
        }
        if let Err(e) = uploader.handle_chunk(&chunk, total).await {
            error!("Streaming upload failed: {}", e);
            upload_error = Some(e);
            break;
        }
    }

    let capture_aborted = controller.is_aborted();
    let stats = controller.close().await?;
    info!(
        "Persisted {} chunks ({} bytes) locally",
        stats.persisted_chunks, stats.persisted_bytes
    );

    let result = if let Some(e) = upload_error {
        Err(e)
    } else if capture_aborted {
        uploader.cancel().await;
        Ok(None)
    } else {
        uploader.finalize().await
    };
    info!("Metrics:\n{}", gather_upload_metrics());

    match result {
        Ok(Some(done)) => info!("Recording uploaded to {}", done.location),
        Ok(None) => info!("Nothing uploaded"),
        Err(e) => {
            error!("Upload failed: {}", serde_json::to_string(&e.to_report())?);
            return Err(e.into());
        }
    }
    Ok(())
}
