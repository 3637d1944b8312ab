//! Part sizing for multipart uploads

use std::ops::Range;

use crate::error::{CaptureError, Result};

const MIB: u64 = 1024 * 1024;

/// Minimum part size accepted by the object store (5MB), except for the last part
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Largest part the tiered policy hands out (100MB)
pub const MAX_PART_SIZE: u64 = 100 * MIB;

/// Hard ceiling on parts per upload
pub const MAX_PARTS: u64 = 10_000;

/// Tiered part size for a blob of `total_size` bytes
pub fn part_size_for(total_size: u64) -> u64 {
    if total_size < 100 * MIB {
        25 * MIB
    } else if total_size < 1024 * MIB {
        50 * MIB
    } else if total_size < 10 * 1024 * MIB {
        100 * MIB
    } else {
        total_size
            .div_ceil(MAX_PARTS)
            .clamp(MIN_PART_SIZE as u64, MAX_PART_SIZE)
    }
}

/// How a blob is cut into parts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    pub total_size: u64,
    pub part_size: u64,
    pub total_parts: u32,
}

impl PartPlan {
    /// Plan from the local tiered policy alone
    pub fn local(total_size: u64) -> Self {
        let part_size = part_size_for(total_size);
        Self {
            total_size,
            part_size,
            total_parts: total_size.div_ceil(part_size).min(u64::from(u32::MAX)) as u32,
        }
    }

    /// Reject blobs the 100MB ceiling cannot fit into 10000 parts
    pub fn check_limits(&self) -> Result<()> {
        let parts = self.total_size.div_ceil(self.part_size);
        if parts > MAX_PARTS {
            return Err(CaptureError::TooLarge {
                size: self.total_size,
                parts,
            });
        }
        Ok(())
    }

    /// Reconcile the local plan with the part count the server declared.
    ///
    /// The server wins. The local size is kept when it yields the same
    /// count; otherwise the size is re-derived from the server's count. The
    /// new size must reproduce that count exactly and stay within the part
    /// bounds (a single part may be smaller than the floor).
    pub fn reconcile(self, server_parts: Option<u32>) -> Result<Self> {
        let Some(declared) = server_parts else {
            return Ok(self);
        };
        if declared == self.total_parts {
            return Ok(self);
        }
        if declared == 0 || u64::from(declared) > MAX_PARTS {
            return Err(CaptureError::InvalidResponse {
                operation: "initiate",
                reason: format!("totalParts {} outside 1..={}", declared, MAX_PARTS),
            });
        }

        let part_size = self.total_size.div_ceil(u64::from(declared));
        if part_size == 0 || self.total_size.div_ceil(part_size) != u64::from(declared) {
            return Err(CaptureError::InvalidResponse {
                operation: "initiate",
                reason: format!(
                    "totalParts {} cannot cover {} bytes in equal parts",
                    declared, self.total_size
                ),
            });
        }

        if (declared > 1 && part_size < MIN_PART_SIZE as u64) || part_size > MAX_PART_SIZE {
            return Err(CaptureError::InvalidResponse {
                operation: "initiate",
                reason: format!(
                    "totalParts {} gives {} byte parts, outside {}..={}",
                    declared, part_size, MIN_PART_SIZE, MAX_PART_SIZE
                ),
            });
        }

        Ok(Self {
            total_size: self.total_size,
            part_size,
            total_parts: declared,
        })
    }

    /// Byte range of a 1-indexed part
    pub fn range(&self, part_number: u32) -> Range<usize> {
        let start = u64::from(part_number - 1) * self.part_size;
        let end = (start + self.part_size).min(self.total_size);
        start as usize..end as usize
    }
}
