//! Batch upload binary
//!
//! Usage: capture-upload <file> [upload-path]

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use capture_core::metrics::gather_upload_metrics;
use capture_core::{
    BatchConfig, BatchUploader, ClientConfig, FileUpload, HttpMultipartClient, ProgressCallback,
    ProgressSnapshot,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn mime_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("webm") => "video/webm",
        Some("mp4") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("ogg") => "audio/ogg",
        Some("wav") => "audio/wav",
        _ => "application/octet-stream",
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let Some(file) = args.next() else {
        return Err("usage: capture-upload <file> [upload-path]".into());
    };
    let upload_path = args.next().unwrap_or_else(|| "uploads".into());

    let path = Path::new(&file);
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or("file path has no file name")?
        .to_string();
    let blob = Bytes::from(tokio::fs::read(path).await?);
    info!("Uploading {} ({} bytes) to {}", file_name, blob.len(), upload_path);

    let client = HttpMultipartClient::new(ClientConfig::from_env()?)?;
    let on_progress: ProgressCallback = Arc::new(|snapshot: &ProgressSnapshot| {
        info!(
            "{:.1}% ({} / {} bytes, part {} of {})",
            snapshot.percentage,
            snapshot.uploaded_bytes,
            snapshot.total_bytes,
            snapshot.current_part,
            snapshot.total_parts
        );
    });
    let uploader = Arc::new(BatchUploader::new(
        Arc::new(client),
        FileUpload::new(file_name, mime_type_for(path), upload_path),
        BatchConfig::default(),
        Some(on_progress),
    ));

    let interrupt = {
        let uploader = uploader.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling upload");
                uploader.cancel();
            }
        })
    };

    let result = uploader.upload(blob).await;
    interrupt.abort();
    info!("Metrics:\n{}", gather_upload_metrics());

    match result {
        Ok(done) => {
            info!("Uploaded to {} (key {})", done.location, done.key);
            Ok(())
        }
        Err(e) => {
            error!("Upload failed: {}", serde_json::to_string(&e.to_report())?);
            Err(e.into())
        }
    }
}
