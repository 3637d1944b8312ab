//! Capture Core - durable chunked capture and resilient multipart upload
//!
//! This crate provides:
//! - Local persistence of captured chunks with storage backpressure
//! - Streaming multipart upload of a capture while it is recorded
//! - Parallel multipart upload of a finished recording
//! - The signing-server protocol client both uploaders share

pub mod config;
pub mod error;
pub mod metrics;
pub mod persistence;
pub mod progress;
pub mod protocol;
pub mod session;
pub mod upload;

pub use config::{BatchConfig, ClientConfig, FileUpload, PersistenceConfig, StreamingConfig};
pub use error::{CaptureError, Result};
pub use persistence::PersistenceController;
pub use progress::{ProgressCallback, ProgressSnapshot};
pub use protocol::{HttpMultipartClient, MultipartApi};
pub use session::SessionState;
pub use upload::{BatchUploader, StreamingUploader};

/// Default MIME type for recorded streams
pub const DEFAULT_MIME_TYPE: &str = "video/webm;codecs=vp9,opus";
