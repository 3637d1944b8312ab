//! Remote multipart upload protocol
//!
//! Four signing-server operations (initiate, part-url, complete, abort)
//! plus the presigned part PUT, shared by both upload coordinators.

pub mod client;
pub mod types;

pub use client::{abort_best_effort, HttpMultipartClient, MultipartApi};
pub use types::{
    content_type_for, CompleteResponse, CompletedPart, InitiateRequest, InitiateResponse, PartUrl,
};
