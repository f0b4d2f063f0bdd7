//! Object addresses
//!
//! Commands accept `s3://bucket/key`, `s3://bucket/prefix/` or a bare key
//! that lives in the configured default bucket.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LocationError {
    #[error("No bucket in '{0}' and no default bucket configured")]
    MissingBucket(String),

    #[error("Invalid object location '{0}': {1}")]
    Invalid(String, String),
}

/// A bucket and key (the key may be empty or end with `/` for prefixes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parse `input`, falling back to `default_bucket` for bare keys
    pub fn parse(input: &str, default_bucket: Option<&str>) -> Result<Self, LocationError> {
        if let Some(rest) = input.strip_prefix("s3://") {
            let (bucket, key) = match rest.split_once('/') {
                Some((bucket, key)) => (bucket, key),
                None => (rest, ""),
            };
            if bucket.is_empty() {
                return Err(LocationError::Invalid(
                    input.to_string(),
                    "empty bucket name".into(),
                ));
            }
            return Ok(Self::new(bucket, key));
        }

        if input.contains("://") {
            return Err(LocationError::Invalid(
                input.to_string(),
                "only s3:// locations are supported".into(),
            ));
        }

        match default_bucket {
            Some(bucket) if !bucket.is_empty() => {
                Ok(Self::new(bucket, input.trim_start_matches('/')))
            }
            _ => Err(LocationError::MissingBucket(input.to_string())),
        }
    }

    /// True for `s3://bucket/` and `s3://bucket/prefix/`
    pub fn is_prefix(&self) -> bool {
        self.key.is_empty() || self.key.ends_with('/')
    }

    /// Append `name` when the location is a prefix
    pub fn join_if_prefix(mut self, name: &str) -> Self {
        if self.is_prefix() {
            self.key.push_str(name);
        }
        self
    }

    /// Last path segment of the key
    pub fn file_name(&self) -> Option<&str> {
        self.key.rsplit('/').next().filter(|name| !name.is_empty())
    }
}

impl FromStr for ObjectLocation {
    type Err = LocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, None)
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}
