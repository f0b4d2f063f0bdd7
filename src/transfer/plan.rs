//! Part planning
//!
//! Splits `[0, size)` into fixed-size parts with the remainder in the last
//! one. Multipart uploads obey the S3 limits: every part but the last is at
//! least 5 MiB, no part exceeds 5 GiB, and there are at most 10,000 parts.
//! A plan that would exceed the part count grows its part size instead of
//! failing.

use super::store::ByteRange;
use super::TransferError;

const MIB: u64 = 1024 * 1024;

/// Smallest part size S3 accepts for all but the last part
pub const MIN_PART_SIZE: u64 = 5 * MIB;
/// Largest part size S3 accepts
pub const MAX_PART_SIZE: u64 = 5 * 1024 * MIB;
/// Maximum number of parts in one multipart upload
pub const MAX_PARTS: u64 = 10_000;
/// Largest object a multipart upload can produce
pub const MAX_OBJECT_SIZE: u64 = 5 * 1024 * 1024 * MIB;

/// How an object is moved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// One PUT or GET
    Single,
    Multipart,
}

impl TransferMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferMode::Single => "single",
            TransferMode::Multipart => "multipart",
        }
    }
}

/// One planned part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartSpec {
    /// 1-based
    pub index: u32,
    pub range: ByteRange,
}

/// Ordered parts covering an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartPlan {
    object_size: u64,
    part_size: u64,
    parts: Vec<PartSpec>,
}

impl PartPlan {
    /// Plan a multipart upload. The part size is raised to the 5 MiB floor
    /// and then, if needed, to the smallest whole MiB that fits in 10,000 parts.
    pub fn for_upload(object_size: u64, requested_part_size: u64) -> Result<Self, TransferError> {
        if object_size > MAX_OBJECT_SIZE {
            return Err(TransferError::Configuration(format!(
                "object size {} exceeds the 5 TiB multipart limit",
                object_size
            )));
        }
        let part_size = fit_part_count(requested_part_size.max(MIN_PART_SIZE), object_size);
        if part_size > MAX_PART_SIZE {
            return Err(TransferError::Configuration(format!(
                "part size {} exceeds the 5 GiB limit",
                part_size
            )));
        }
        Ok(Self::build(object_size, part_size))
    }

    /// Plan a ranged download. No minimum part size applies.
    pub fn for_download(object_size: u64, requested_part_size: u64) -> Result<Self, TransferError> {
        if requested_part_size == 0 {
            return Err(TransferError::Configuration(
                "part size must be greater than zero".into(),
            ));
        }
        let part_size = fit_part_count(requested_part_size, object_size);
        Ok(Self::build(object_size, part_size))
    }

    /// A single part covering the whole object
    pub fn single(object_size: u64) -> Self {
        Self {
            object_size,
            part_size: object_size,
            parts: vec![PartSpec {
                index: 1,
                range: ByteRange::new(0, object_size),
            }],
        }
    }

    fn build(object_size: u64, part_size: u64) -> Self {
        let mut parts = Vec::with_capacity(object_size.div_ceil(part_size).max(1) as usize);
        let mut start = 0;
        let mut index = 1;
        while start < object_size {
            let end = (start + part_size).min(object_size);
            parts.push(PartSpec {
                index,
                range: ByteRange::new(start, end),
            });
            start = end;
            index += 1;
        }
        if parts.is_empty() {
            parts.push(PartSpec {
                index: 1,
                range: ByteRange::new(0, 0),
            });
        }
        Self {
            object_size,
            part_size,
            parts,
        }
    }

    pub fn object_size(&self) -> u64 {
        self.object_size
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn parts(&self) -> &[PartSpec] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

/// Grow `part_size` (to whole MiB) until `object_size` fits in `MAX_PARTS`
fn fit_part_count(part_size: u64, object_size: u64) -> u64 {
    if object_size.div_ceil(part_size) <= MAX_PARTS {
        return part_size;
    }
    let minimum = object_size.div_ceil(MAX_PARTS);
    minimum.div_ceil(MIB) * MIB
}
