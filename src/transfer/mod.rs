//! Object transfers
//!
//! Moves one object between a local file and a bucket, as a single request
//! or as a parallel multipart transfer.
//!
//! - [`TransferCoordinator`] validates a [`TransferRequest`], discovers the
//!   object size, picks single or multipart mode, decides whether to resume
//!   and starts the engine.
//! - The engine runs a bounded worker pool over a [`TransferSession`]; each
//!   part goes through its own attempt/retry state machine.
//! - [`TransferHandle`] lets the caller watch progress, cancel, and wait for
//!   the [`TransferResult`].
//!
//! # Example
//!
//! ```no_run
//! use s3_cli::transfer::{TransferCoordinator, TransferRequest, TransferSettings};
//! use s3_cli::transfer::store::ObjectStore;
//! use std::sync::Arc;
//!
//! # async fn example(store: Arc<dyn ObjectStore>) -> Result<(), Box<dyn std::error::Error>> {
//! let coordinator = TransferCoordinator::new(store, TransferSettings::default());
//! let request = TransferRequest::upload("backups", "db/dump.tar", "/var/backups/dump.tar");
//! let result = coordinator.run(request).await?.ensure_completed()?;
//! println!("{} bytes in {:?}", result.bytes_transferred, result.duration);
//! # Ok(())
//! # }
//! ```

use crate::transport::retry::RetryPolicy;
use crate::transport::{FailureKind, TransportError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub mod coordinator;
pub mod engine;
pub mod io;
pub mod plan;
pub mod resume;
pub mod session;
pub mod store;
#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{TransferControl, TransferCoordinator, TransferHandle, TransferSettings};
pub use plan::{PartPlan, TransferMode};
pub use session::{PartErrorSummary, PartState, Progress, TransferSession, TransferState};

/// Which way the bytes flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error categories surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    TransientNetwork,
    Authentication,
    ServerRejection,
    PartialTransfer,
    LocalIo,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::Authentication => "authentication",
            ErrorKind::ServerRejection => "server_rejection",
            ErrorKind::PartialTransfer => "partial_transfer",
            ErrorKind::LocalIo => "local_io",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transfer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Invalid transfer request: {0}")]
    Configuration(String),

    #[error("Network error after {attempts} attempt(s): {message}")]
    TransientNetwork { attempts: u32, message: String },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Request rejected{}: {message}", status_suffix(.status, .code))]
    ServerRejection {
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },

    #[error("Transfer failed with {completed}/{total} parts completed ({kind}): {message}")]
    PartialTransfer {
        completed: usize,
        total: usize,
        kind: ErrorKind,
        message: String,
    },

    #[error("Local I/O error on {}: {message}", .path.display())]
    LocalIo { path: PathBuf, message: String },

    #[error("Transfer cancelled")]
    Cancelled,
}

fn status_suffix(status: &Option<u16>, code: &Option<String>) -> String {
    match (status, code) {
        (Some(status), Some(code)) => format!(" (HTTP {} {})", status, code),
        (Some(status), None) => format!(" (HTTP {})", status),
        (None, Some(code)) => format!(" ({})", code),
        (None, None) => String::new(),
    }
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Configuration(_) => ErrorKind::Configuration,
            TransferError::TransientNetwork { .. } => ErrorKind::TransientNetwork,
            TransferError::Authentication(_) => ErrorKind::Authentication,
            TransferError::ServerRejection { .. } => ErrorKind::ServerRejection,
            TransferError::PartialTransfer { .. } => ErrorKind::PartialTransfer,
            TransferError::LocalIo { .. } => ErrorKind::LocalIo,
            TransferError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Classify a terminal transport error after `attempts` attempts
    pub fn from_transport(err: TransportError, attempts: u32) -> Self {
        match err.kind() {
            FailureKind::Authentication => TransferError::Authentication(err.to_string()),
            FailureKind::Timeout
            | FailureKind::Connection
            | FailureKind::Throttled
            | FailureKind::ServerError => TransferError::TransientNetwork {
                attempts,
                message: err.to_string(),
            },
            FailureKind::Rejected | FailureKind::InvalidResponse => {
                let message = match &err {
                    TransportError::Http { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                TransferError::ServerRejection {
                    status: err.status(),
                    code: err.code().map(String::from),
                    message,
                }
            }
            FailureKind::InvalidRequest => TransferError::Configuration(err.to_string()),
        }
    }

    pub fn local_io(path: &Path, err: impl fmt::Display) -> Self {
        TransferError::LocalIo {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

impl From<TransportError> for TransferError {
    fn from(err: TransportError) -> Self {
        TransferError::from_transport(err, 1)
    }
}

/// A transfer to run. Immutable once handed to the coordinator.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub direction: Direction,
    pub bucket: String,
    pub key: String,
    pub local_path: PathBuf,
    /// Known size; downloads discover it with HEAD when absent
    pub object_size: Option<u64>,
    pub part_size: Option<u64>,
    pub max_parallel_parts: Option<usize>,
    pub retry_policy: Option<RetryPolicy>,
}

impl TransferRequest {
    fn new(
        direction: Direction,
        bucket: impl Into<String>,
        key: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            direction,
            bucket: bucket.into(),
            key: key.into(),
            local_path: local_path.into(),
            object_size: None,
            part_size: None,
            max_parallel_parts: None,
            retry_policy: None,
        }
    }

    pub fn upload(
        bucket: impl Into<String>,
        key: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        Self::new(Direction::Upload, bucket, key, local_path)
    }

    pub fn download(
        bucket: impl Into<String>,
        key: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        Self::new(Direction::Download, bucket, key, local_path)
    }

    pub fn with_object_size(mut self, size: u64) -> Self {
        self.object_size = Some(size);
        self
    }

    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = Some(part_size);
        self
    }

    pub fn with_max_parallel_parts(mut self, parts: usize) -> Self {
        self.max_parallel_parts = Some(parts);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

/// Kind and message of a failed transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureSummary {
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of a transfer
#[derive(Debug, Clone)]
pub struct TransferResult {
    pub direction: Direction,
    pub bucket: String,
    pub key: String,
    pub local_path: PathBuf,
    pub mode: TransferMode,
    pub state: TransferState,
    pub object_size: u64,
    /// Bytes moved by this run
    pub bytes_transferred: u64,
    /// Bytes skipped because an earlier run already moved them
    pub resumed_bytes: u64,
    pub duration: Duration,
    pub parts_completed: usize,
    pub parts_total: usize,
    pub part_errors: Vec<PartErrorSummary>,
    pub etag: Option<String>,
    pub upload_id: Option<String>,
    pub error: Option<TransferError>,
}

impl TransferResult {
    pub fn is_success(&self) -> bool {
        self.state == TransferState::Completed
    }

    pub fn failure(&self) -> Option<FailureSummary> {
        self.error.as_ref().map(|err| FailureSummary {
            kind: err.kind(),
            message: err.to_string(),
        })
    }

    /// The result itself when completed, otherwise the terminal error. A
    /// multipart failure with some parts done is reported as
    /// [`TransferError::PartialTransfer`].
    pub fn ensure_completed(self) -> Result<Self, TransferError> {
        match self.state {
            TransferState::Completed => Ok(self),
            TransferState::Cancelled => Err(TransferError::Cancelled),
            TransferState::Running | TransferState::Failed => {
                let err = self.error.clone().unwrap_or_else(|| {
                    TransferError::Configuration("transfer ended without completing".into())
                });
                if self.parts_completed > 0 && self.parts_total > 1 {
                    Err(TransferError::PartialTransfer {
                        completed: self.parts_completed,
                        total: self.parts_total,
                        kind: err.kind(),
                        message: err.to_string(),
                    })
                } else {
                    Err(err)
                }
            }
        }
    }
}
