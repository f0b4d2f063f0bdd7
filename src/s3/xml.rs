//! S3 XML request and response bodies

use serde::{Deserialize, Serialize};

/// `<Error>` document returned with failed requests
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorDocument {
    #[serde(rename = "Code")]
    pub code: String,
    #[serde(rename = "Message", default)]
    pub message: String,
    #[serde(rename = "RequestId", default)]
    pub request_id: Option<String>,
}

impl ErrorDocument {
    /// Parse `body` if it is an `<Error>` document
    pub fn parse(body: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(body).ok()?;
        if !text.contains("<Error>") {
            return None;
        }
        quick_xml::de::from_str::<ErrorDocument>(text)
            .ok()
            .filter(|doc| !doc.code.is_empty())
    }
}

/// Response to CreateMultipartUpload
#[derive(Debug, Clone, Deserialize)]
pub struct InitiateMultipartUploadResult {
    #[serde(rename = "Bucket", default)]
    pub bucket: String,
    #[serde(rename = "Key", default)]
    pub key: String,
    #[serde(rename = "UploadId")]
    pub upload_id: String,
}

/// Body of CompleteMultipartUpload
#[derive(Debug, Clone, Serialize)]
#[serde(rename = "CompleteMultipartUpload")]
pub struct CompleteMultipartUpload {
    #[serde(rename = "Part")]
    pub parts: Vec<CompletedPartXml>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletedPartXml {
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub etag: String,
}

/// Response to CompleteMultipartUpload
#[derive(Debug, Clone, Deserialize)]
pub struct CompleteMultipartUploadResult {
    #[serde(rename = "Location", default)]
    pub location: Option<String>,
    #[serde(rename = "ETag", default)]
    pub etag: Option<String>,
}

/// Response to ListObjectsV2
#[derive(Debug, Clone, Deserialize)]
pub struct ListBucketResult {
    #[serde(rename = "IsTruncated", default)]
    pub is_truncated: bool,
    #[serde(rename = "NextContinuationToken", default)]
    pub next_continuation_token: Option<String>,
    #[serde(rename = "Contents", default)]
    pub contents: Vec<ListEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListEntry {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Size", default)]
    pub size: u64,
    #[serde(rename = "ETag", default)]
    pub etag: Option<String>,
    #[serde(rename = "LastModified", default)]
    pub last_modified: Option<String>,
}

pub fn to_xml<T: Serialize>(value: &T) -> Result<String, quick_xml::SeError> {
    quick_xml::se::to_string(value)
}

pub fn from_xml<'de, T: Deserialize<'de>>(body: &'de str) -> Result<T, quick_xml::DeError> {
    quick_xml::de::from_str(body)
}
