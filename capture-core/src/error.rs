//! Error types for capture and upload
//!
//! Covers the remote multipart protocol, the local chunk store, and the
//! upload session state machine.

use serde::Serialize;
use thiserror::Error;

use crate::session::SessionState;

/// Primary error type for all capture operations
#[derive(Debug, Error)]
pub enum CaptureError {
    // ========== Remote Errors ==========

    /// Signing server rejected the bearer token
    #[error("Authentication failed: {message}")]
    Auth { message: String },

    /// Could not obtain a presigned URL for a part
    #[error("Presigned URL request failed for part {part_number}: {message}")]
    PresignedUrl { part_number: u32, message: String },

    /// Transport-level failure (connect, timeout, reset)
    #[error("Network error: {message}")]
    Network { message: String },

    /// Remote returned a non-2xx status
    #[error("Upload failed with status {status}: {message}")]
    Upload { status: u16, message: String },

    /// Response body or header failed validation
    #[error("Invalid response from {operation}: {reason}")]
    InvalidResponse { operation: &'static str, reason: String },

    /// Operation cancelled by the caller
    #[error("Upload cancelled")]
    Cancelled,

    // ========== Local Store Errors ==========

    /// Not enough durable storage headroom for the next chunk
    #[error("Insufficient storage: {free} bytes free, {required} required")]
    StorageExhausted { free: u64, required: u64 },

    /// Chunk write to the local store failed
    #[error("Chunk store write failed for index {index}: {message}")]
    StoreWrite { index: u64, message: String },

    /// Stored record failed checksum or framing validation
    #[error("Chunk store corrupted at offset {offset}: {reason}")]
    StoreCorrupted { offset: u64, reason: String },

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ========== Session Errors ==========

    /// Illegal session state transition
    #[error("Invalid session transition from {from:?} to {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },

    /// Session already reached a terminal state
    #[error("Session is closed ({state:?})")]
    SessionClosed { state: SessionState },

    /// Nothing to upload
    #[error("Refusing to upload an empty blob")]
    EmptyUpload,

    /// Blob needs more parts than the protocol allows
    #[error("Blob of {size} bytes needs {parts} parts, more than the protocol allows")]
    TooLarge { size: u64, parts: u64 },

    // ========== Runtime Errors ==========

    /// Configuration missing or malformed
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Serializable `{code, message}` pair handed to the UI layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub code: &'static str,
    pub message: String,
}

impl CaptureError {
    /// Returns true if a part upload may be retried after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            CaptureError::Network { .. } | CaptureError::PresignedUrl { .. } => true,
            CaptureError::Upload { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }

    /// Returns true if this error came from the local chunk store
    pub fn is_local_storage(&self) -> bool {
        matches!(
            self,
            CaptureError::StorageExhausted { .. }
                | CaptureError::StoreWrite { .. }
                | CaptureError::StoreCorrupted { .. }
                | CaptureError::Io(_)
        )
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            CaptureError::Auth { .. } => "AUTH_ERROR",
            CaptureError::PresignedUrl { .. } => "PRESIGNED_URL_ERROR",
            CaptureError::Network { .. } => "NETWORK_ERROR",
            CaptureError::Upload { .. } => "UPLOAD_ERROR",
            CaptureError::InvalidResponse { .. } => "INVALID_RESPONSE",
            CaptureError::Cancelled => "CANCELLED",
            CaptureError::StorageExhausted { .. } => "STORAGE_EXHAUSTED",
            CaptureError::StoreWrite { .. } => "STORE_WRITE_FAILED",
            CaptureError::StoreCorrupted { .. } => "STORE_CORRUPTED",
            CaptureError::Io(_) => "IO_ERROR",
            CaptureError::InvalidTransition { .. } => "INVALID_TRANSITION",
            CaptureError::SessionClosed { .. } => "SESSION_CLOSED",
            CaptureError::EmptyUpload => "EMPTY_UPLOAD",
            CaptureError::TooLarge { .. } => "TOO_LARGE",
            CaptureError::Config { .. } => "CONFIG_ERROR",
            CaptureError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Build the report shown to the user
    pub fn to_report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

/// Result type alias for capture operations
pub type Result<T> = std::result::Result<T, CaptureError>;
