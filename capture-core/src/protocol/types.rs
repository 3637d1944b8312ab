//! Wire types for the signing server
//!
//! Every response is decoded into a typed struct and validated before use.

use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, Result};
use crate::upload::part_size::MAX_PARTS;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub file_name: String,
    pub file_type: String,
    /// Zero when the final size is not known up front
    pub file_size: u64,
    pub upload_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    pub upload_id: String,
    pub key: String,
    #[serde(default)]
    pub total_parts: Option<u32>,
}

impl InitiateResponse {
    pub fn validate(self) -> Result<Self> {
        require_non_empty("initiate", "uploadId", &self.upload_id)?;
        require_non_empty("initiate", "key", &self.key)?;
        if let Some(parts) = self.total_parts {
            if parts == 0 || u64::from(parts) > MAX_PARTS {
                return Err(CaptureError::InvalidResponse {
                    operation: "initiate",
                    reason: format!("totalParts {} outside 1..={}", parts, MAX_PARTS),
                });
            }
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartUrlRequest<'a> {
    pub upload_id: &'a str,
    pub key: &'a str,
    pub part_number: u32,
}

/// Single-use presigned URL for one part
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartUrl {
    pub upload_url: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl PartUrl {
    pub fn validate(self) -> Result<Self> {
        let parsed = reqwest::Url::parse(&self.upload_url).map_err(|e| {
            CaptureError::InvalidResponse {
                operation: "part-url",
                reason: format!("uploadUrl is not an absolute URL: {}", e),
            }
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(CaptureError::InvalidResponse {
                operation: "part-url",
                reason: format!("unsupported uploadUrl scheme {}", parsed.scheme()),
            });
        }
        Ok(self)
    }
}

/// A part that has been accepted by object storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CompletePartEntry<'a> {
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub etag: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest<'a> {
    pub upload_id: &'a str,
    pub key: &'a str,
    pub parts: Vec<CompletePartEntry<'a>>,
}

impl<'a> CompleteRequest<'a> {
    pub fn new(upload_id: &'a str, key: &'a str, parts: &'a [CompletedPart]) -> Self {
        Self {
            upload_id,
            key,
            parts: parts
                .iter()
                .map(|p| CompletePartEntry {
                    part_number: p.part_number,
                    etag: &p.etag,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    pub location: String,
    pub key: String,
    #[serde(default)]
    pub etag: Option<String>,
}

impl CompleteResponse {
    pub fn validate(self) -> Result<Self> {
        require_non_empty("complete", "location", &self.location)?;
        require_non_empty("complete", "key", &self.key)?;
        Ok(self)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortRequest<'a> {
    pub upload_id: &'a str,
    pub key: &'a str,
}

/// Strip codec parameters from a MIME type (`video/webm;codecs=vp9` -> `video/webm`)
pub fn content_type_for(mime_type: &str) -> &str {
    let base = mime_type.split(';').next().unwrap_or(mime_type).trim();
    if base.is_empty() {
        "application/octet-stream"
    } else {
        base
    }
}

fn require_non_empty(operation: &'static str, field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CaptureError::InvalidResponse {
            operation,
            reason: format!("{} is missing or empty", field),
        });
    }
    Ok(())
}
