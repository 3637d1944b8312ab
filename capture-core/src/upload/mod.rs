//! Multipart upload coordinators
//!
//! `StreamingUploader` uploads a live capture part by part as it grows;
//! `BatchUploader` uploads a finished blob through a bounded worker pool.

pub mod batch;
pub mod part_size;
pub mod retry;
pub mod streaming;

pub use batch::BatchUploader;
pub use part_size::{part_size_for, PartPlan, MAX_PARTS, MAX_PART_SIZE, MIN_PART_SIZE};
pub use retry::RetryPolicy;
pub use streaming::StreamingUploader;
