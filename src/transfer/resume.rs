//! Resume journal
//!
//! A small JSON sidecar that records which parts of a transfer are done
//! (and, for uploads, the multipart upload id and part ETags). A later run of
//! the same transfer picks up from there. The journal is tied to a
//! [`TransferIdentity`]; any change in size, modification time or part size
//! invalidates it.
//!
//! The journal is rewritten after every completed part through a temporary
//! file and a rename, so a crash leaves either the old or the new version.

use super::Direction;
use crate::auth::sha256_hex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;

const JOURNAL_VERSION: u32 = 1;
const JOURNAL_SUFFIX: &str = ".s3resume";

/// Journal errors
#[derive(Error, Debug)]
pub enum ResumeError {
    #[error("Failed to access resume journal {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode resume journal: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What makes two runs "the same transfer"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferIdentity {
    pub direction: Direction,
    pub bucket: String,
    pub key: String,
    pub local_path: PathBuf,
    pub size: u64,
    /// Source version: local mtime (uploads) or remote ETag / Last-Modified (downloads)
    pub source_version: Option<String>,
    pub part_size: u64,
}

/// On-disk journal contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub version: u32,
    pub identity: TransferIdentity,
    #[serde(default)]
    pub upload_id: Option<String>,
    /// Completed part index -> ETag (uploads) or `None` (downloads)
    #[serde(default)]
    pub parts: BTreeMap<u32, Option<String>>,
}

impl JournalRecord {
    fn new(identity: TransferIdentity) -> Self {
        Self {
            version: JOURNAL_VERSION,
            identity,
            upload_id: None,
            parts: BTreeMap::new(),
        }
    }
}

/// Result of opening a journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeDecision {
    /// No usable journal
    Fresh,
    /// A matching journal with completed parts
    Resume {
        upload_id: Option<String>,
        parts: BTreeMap<u32, Option<String>>,
    },
    /// A journal for an older version of the transfer was discarded
    Invalidated { stale_upload: Option<StaleUpload> },
}

/// Multipart upload left behind by a discarded journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleUpload {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

/// Journal for one transfer
#[derive(Debug)]
pub struct ResumeJournal {
    path: PathBuf,
    record: Mutex<JournalRecord>,
}

impl ResumeJournal {
    /// Where the journal of `identity` lives: next to the local file, or in
    /// `state_dir` under a name derived from the identity
    pub fn location(identity: &TransferIdentity, state_dir: Option<&Path>) -> PathBuf {
        match state_dir {
            Some(dir) => {
                let name = format!(
                    "{}\n{}\n{}\n{}",
                    identity.direction,
                    identity.bucket,
                    identity.key,
                    identity.local_path.display()
                );
                dir.join(format!("{}.json", sha256_hex(name.as_bytes())))
            }
            None => {
                let mut os = identity.local_path.clone().into_os_string();
                os.push(JOURNAL_SUFFIX);
                PathBuf::from(os)
            }
        }
    }

    /// Open the journal at `path`, checking it against `identity`
    pub async fn open(
        path: PathBuf,
        identity: TransferIdentity,
    ) -> Result<(Self, ResumeDecision), ResumeError> {
        let existing = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<JournalRecord>(&bytes) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Ignoring unreadable resume journal"
                    );
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => return Err(ResumeError::Io { path, source }),
        };

        let (record, decision) = match existing {
            Some(record)
                if record.version == JOURNAL_VERSION
                    && record.identity == identity
                    && (!record.parts.is_empty() || record.upload_id.is_some()) =>
            {
                let decision = ResumeDecision::Resume {
                    upload_id: record.upload_id.clone(),
                    parts: record.parts.clone(),
                };
                (record, decision)
            }
            Some(empty) if empty.version == JOURNAL_VERSION && empty.identity == identity => {
                (empty, ResumeDecision::Fresh)
            }
            Some(stale) => {
                tracing::info!(path = %path.display(), "Resume journal is stale, starting over");
                let stale_upload = match (stale.identity.direction, stale.upload_id) {
                    (Direction::Upload, Some(upload_id)) => Some(StaleUpload {
                        bucket: stale.identity.bucket,
                        key: stale.identity.key,
                        upload_id,
                    }),
                    _ => None,
                };
                let decision = ResumeDecision::Invalidated { stale_upload };
                (JournalRecord::new(identity), decision)
            }
            None => (JournalRecord::new(identity), ResumeDecision::Fresh),
        };

        Ok((
            Self {
                path,
                record: Mutex::new(record),
            },
            decision,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remember the upload id of a newly created multipart upload
    pub async fn set_upload_id(&self, upload_id: &str) -> Result<(), ResumeError> {
        let mut record = self.record.lock().await;
        record.upload_id = Some(upload_id.to_string());
        record.parts.clear();
        self.persist(&record).await
    }

    /// Record a completed part and persist the journal
    pub async fn record_part(&self, index: u32, etag: Option<String>) -> Result<(), ResumeError> {
        let mut record = self.record.lock().await;
        record.parts.insert(index, etag);
        self.persist(&record).await
    }

    /// Copy of the current record
    pub async fn snapshot(&self) -> JournalRecord {
        self.record.lock().await.clone()
    }

    /// Forget every recorded part and delete the file
    pub async fn reset(&self) -> Result<(), ResumeError> {
        {
            let mut record = self.record.lock().await;
            record.upload_id = None;
            record.parts.clear();
        }
        self.remove().await
    }

    /// Delete the journal (finished or abandoned transfer)
    pub async fn remove(&self) -> Result<(), ResumeError> {
        let _guard = self.record.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ResumeError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    async fn persist(&self, record: &JournalRecord) -> Result<(), ResumeError> {
        let json = serde_json::to_vec_pretty(record)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| ResumeError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|source| ResumeError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| ResumeError::Io {
                path: self.path.clone(),
                source,
            })
    }
}
