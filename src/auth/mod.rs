//! Request authentication
//!
//! Builds AWS Signature Version 4 signed requests for S3-compatible endpoints.
//!
//! The [`SignableRequest`] holds everything that takes part in the signature
//! (method, URL, headers, payload hash). [`sigv4::SigV4Signer`] turns it into a
//! signed request by adding `x-amz-date`, `x-amz-content-sha256`, the optional
//! session token and finally the `Authorization` header.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Url;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

pub mod sigv4;

pub use sigv4::SigV4Signer;

/// SHA-256 of an empty payload
pub const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Characters left alone by S3 URI encoding: `A-Z a-z 0-9 - . _ ~`
const URI_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Same as [`URI_ENCODE_SET`] but keeps `/` for object key paths
const PATH_ENCODE_SET: &AsciiSet = &URI_ENCODE_SET.remove(b'/');

/// Signing errors
#[derive(Error, Debug)]
pub enum SigningError {
    #[error("URL has no host: {0}")]
    MissingHost(String),
}

/// A request that is about to be signed
#[derive(Debug, Clone)]
pub struct SignableRequest {
    method: String,
    url: Url,
    headers: BTreeMap<String, String>,
    payload_hash: String,
}

impl SignableRequest {
    /// Create a request for `method` on `url` whose body hashes to `payload_hash`
    pub fn new(method: impl Into<String>, url: Url, payload_hash: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url,
            headers: BTreeMap::new(),
            payload_hash: payload_hash.into(),
        }
    }

    /// Add a header. Names are stored lowercase.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.insert_header(name, value);
        self
    }

    /// Insert or replace a header
    pub fn insert_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn payload_hash(&self) -> &str {
        &self.payload_hash
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Consume the request, returning its URL and headers
    pub fn into_parts(self) -> (Url, BTreeMap<String, String>) {
        (self.url, self.headers)
    }
}

/// Hex-encoded SHA-256 of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// URI-encode a single query component (encodes `/` too)
pub fn uri_encode(value: &str) -> String {
    utf8_percent_encode(value, URI_ENCODE_SET).to_string()
}

/// URI-encode an object key for use as a URL path, keeping `/` separators
pub fn uri_encode_path(path: &str) -> String {
    utf8_percent_encode(path, PATH_ENCODE_SET).to_string()
}

/// Host header value as it is sent on the wire (port only when non-default)
pub fn host_header(url: &Url) -> Result<String, SigningError> {
    let host = url
        .host_str()
        .ok_or_else(|| SigningError::MissingHost(url.to_string()))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_payload_hash() {
        assert_eq!(sha256_hex(b""), EMPTY_PAYLOAD_SHA256);
    }

    #[test]
    fn test_uri_encode_reserved_characters() {
        assert_eq!(uri_encode("a b/c~d"), "a%20b%2Fc~d");
        assert_eq!(uri_encode("test$file.text"), "test%24file.text");
    }

    #[test]
    fn test_uri_encode_path_keeps_slashes() {
        assert_eq!(uri_encode_path("photos/2024/a b.jpg"), "photos/2024/a%20b.jpg");
        assert_eq!(uri_encode_path("ключ"), "%D0%BA%D0%BB%D1%8E%D1%87");
    }

    #[test]
    fn test_host_header_with_port() {
        let url = Url::parse("http://localhost:9000/bucket/key").unwrap();
        assert_eq!(host_header(&url).unwrap(), "localhost:9000");

        let url = Url::parse("https://s3.us-east-1.amazonaws.com/bucket").unwrap();
        assert_eq!(host_header(&url).unwrap(), "s3.us-east-1.amazonaws.com");
    }

    #[test]
    fn test_headers_are_lowercased() {
        let url = Url::parse("https://example.com/key").unwrap();
        let request = SignableRequest::new("GET", url, EMPTY_PAYLOAD_SHA256)
            .with_header("Range", "bytes=0-9");
        assert_eq!(request.header("range"), Some("bytes=0-9"));
        assert_eq!(request.header("RANGE"), Some("bytes=0-9"));
    }
}
