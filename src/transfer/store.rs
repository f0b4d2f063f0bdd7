//! Object store seam
//!
//! The engine talks to storage only through [`ObjectStore`]. Each call is a
//! single attempt; retrying belongs to the caller.

use crate::transport::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

/// Half-open byte range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `Range` header value (HTTP ranges are inclusive)
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end.saturating_sub(1))
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Object metadata from HEAD
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_type: Option<String>,
}

/// A stored part, as listed in CompleteMultipartUpload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Storage operations used by the transfer engine
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectInfo, TransportError>;

    /// Single-request upload; returns the ETag when the server sends one
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
    ) -> Result<Option<String>, TransportError>;

    /// Download the whole object or `range`. A short body is a
    /// [`TransportError::Truncated`]. With `if_match`, a changed object fails
    /// with 412.
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
        if_match: Option<&str>,
    ) -> Result<Bytes, TransportError>;

    /// Returns the upload id
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<String, TransportError>;

    /// Returns the part's ETag
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String, TransportError>;

    /// `parts` must be in ascending part number order
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<Option<String>, TransportError>;

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), TransportError>;
}
