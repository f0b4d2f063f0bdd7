//! Multipart transfer engine
//!
//! Runs a fixed pool of workers over a [`TransferSession`]. Each worker
//! claims the next pending part, drives it through
//! `InFlight -> (Completed | RetryScheduled -> InFlight | Failed)` and moves
//! on. The first part that fails for good fails the session and stops
//! dispatch; parts already in flight finish on their own and their results
//! are dropped.
//!
//! Uploads end with CompleteMultipartUpload (parts in ascending order) or,
//! when the session failed or was cancelled, a single best-effort
//! AbortMultipartUpload.

use super::io::{ObjectReader, ObjectWriter};
use super::plan::PartSpec;
use super::resume::ResumeJournal;
use super::session::{TransferSession, TransferState};
use super::store::ObjectStore;
use super::{Direction, TransferError};
use crate::metrics;
use crate::transport::retry::RetryPolicy;
use crate::transport::TransportError;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// What the engine has to do
#[derive(Clone)]
pub enum EngineJob {
    /// One PutObject
    SingleUpload { reader: Arc<dyn ObjectReader> },
    /// Multipart upload, optionally continuing an existing upload id
    MultipartUpload {
        reader: Arc<dyn ObjectReader>,
        upload_id: Option<String>,
    },
    /// One GetObject
    SingleDownload {
        writer: Arc<dyn ObjectWriter>,
        if_match: Option<String>,
    },
    /// Ranged GETs written at their offsets
    MultipartDownload {
        writer: Arc<dyn ObjectWriter>,
        if_match: Option<String>,
    },
}

/// Remote results of a finished run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineReport {
    pub etag: Option<String>,
    pub upload_id: Option<String>,
    pub aborted: bool,
}

/// Per-part work, shared by all workers
#[derive(Clone)]
enum PartWork {
    Put {
        reader: Arc<dyn ObjectReader>,
    },
    UploadPart {
        reader: Arc<dyn ObjectReader>,
        upload_id: Arc<str>,
    },
    Get {
        writer: Arc<dyn ObjectWriter>,
        if_match: Option<Arc<str>>,
        ranged: bool,
    },
}

enum PartFailure {
    Remote(TransportError),
    Local(TransferError),
}

struct Shared {
    store: Arc<dyn ObjectStore>,
    session: Arc<TransferSession>,
    bucket: String,
    key: String,
    policy: RetryPolicy,
    direction: Direction,
    journal: Option<Arc<ResumeJournal>>,
}

/// Drives one transfer session to a terminal state
pub struct MultipartEngine {
    shared: Shared,
    workers: usize,
    cancel: CancellationToken,
}

struct Driver {
    shared: Arc<Shared>,
    workers: usize,
    cancel: CancellationToken,
}

impl MultipartEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        session: Arc<TransferSession>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        direction: Direction,
        policy: RetryPolicy,
        workers: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared: Shared {
                store,
                session,
                bucket: bucket.into(),
                key: key.into(),
                policy,
                direction,
                journal: None,
            },
            workers: workers.max(1),
            cancel,
        }
    }

    /// Persist completed parts to `journal`
    pub fn with_journal(mut self, journal: Option<Arc<ResumeJournal>>) -> Self {
        self.shared.journal = journal;
        self
    }

    /// Run `job` until the session is terminal
    pub async fn run(self, job: EngineJob) -> EngineReport {
        Driver {
            shared: Arc::new(self.shared),
            workers: self.workers,
            cancel: self.cancel,
        }
        .run(job)
        .await
    }
}

impl Driver {
    async fn run(self, job: EngineJob) -> EngineReport {
        match job {
            EngineJob::SingleUpload { reader } => {
                self.run_parts(PartWork::Put { reader }).await;
                self.finish_simple(None).await;
                EngineReport {
                    etag: self.single_etag(),
                    ..EngineReport::default()
                }
            }
            EngineJob::MultipartUpload { reader, upload_id } => {
                self.run_multipart_upload(reader, upload_id).await
            }
            EngineJob::SingleDownload { writer, if_match } => {
                self.run_parts(PartWork::Get {
                    writer: Arc::clone(&writer),
                    if_match: if_match.as_deref().map(Arc::from),
                    ranged: false,
                })
                .await;
                self.finish_simple(Some(writer)).await;
                EngineReport {
                    etag: if_match,
                    ..EngineReport::default()
                }
            }
            EngineJob::MultipartDownload { writer, if_match } => {
                self.run_parts(PartWork::Get {
                    writer: Arc::clone(&writer),
                    if_match: if_match.as_deref().map(Arc::from),
                    ranged: true,
                })
                .await;
                self.finish_simple(Some(writer)).await;
                EngineReport {
                    etag: if_match,
                    ..EngineReport::default()
                }
            }
        }
    }

    async fn run_multipart_upload(
        &self,
        reader: Arc<dyn ObjectReader>,
        upload_id: Option<String>,
    ) -> EngineReport {
        let shared = &self.shared;
        let upload_id = match upload_id {
            Some(id) => {
                tracing::info!(upload_id = %id, "Resuming multipart upload");
                id
            }
            None => {
                if !shared.session.is_running() {
                    return EngineReport::default();
                }
                let created = shared
                    .policy
                    .run("create_multipart_upload", || {
                        shared.store.create_multipart_upload(&shared.bucket, &shared.key)
                    })
                    .await;
                match created {
                    Ok(id) => {
                        if let Some(journal) = &shared.journal {
                            if let Err(e) = journal.set_upload_id(&id).await {
                                tracing::warn!(error = %e, "Failed to write resume journal");
                            }
                        }
                        id
                    }
                    Err(err) => {
                        let attempts = attempts_used(&shared.policy, &err);
                        shared.session.fail(TransferError::from_transport(err, attempts));
                        return EngineReport::default();
                    }
                }
            }
        };

        self.run_parts(PartWork::UploadPart {
            reader,
            upload_id: Arc::from(upload_id.as_str()),
        })
        .await;

        let mut report = EngineReport {
            upload_id: Some(upload_id.clone()),
            ..EngineReport::default()
        };

        if shared.session.state() == TransferState::Running {
            if shared.session.all_parts_completed() {
                let parts = shared.session.completed_parts();
                let completed = shared
                    .policy
                    .run("complete_multipart_upload", || {
                        shared.store.complete_multipart_upload(
                            &shared.bucket,
                            &shared.key,
                            &upload_id,
                            &parts,
                        )
                    })
                    .await;
                match completed {
                    Ok(etag) => {
                        shared.session.mark_committed();
                        report.etag = etag;
                        tracing::info!(parts = parts.len(), "Multipart upload completed");
                    }
                    Err(err) => {
                        let attempts = attempts_used(&shared.policy, &err);
                        shared.session.fail(TransferError::from_transport(err, attempts));
                    }
                }
            } else {
                shared.session.fail(TransferError::Configuration(
                    "workers stopped before every part completed".into(),
                ));
            }
        }

        match shared.session.state() {
            TransferState::Completed => self.remove_journal().await,
            TransferState::Failed | TransferState::Cancelled => {
                report.aborted = self.abort_once(&upload_id).await;
                self.remove_journal().await;
            }
            TransferState::Running => {}
        }
        report
    }

    /// Best-effort abort. Exactly one attempt; failure is only logged.
    async fn abort_once(&self, upload_id: &str) -> bool {
        let shared = &self.shared;
        match shared
            .store
            .abort_multipart_upload(&shared.bucket, &shared.key, upload_id)
            .await
        {
            Ok(()) => {
                metrics::record_multipart_abort("success");
                tracing::info!(upload_id = %upload_id, "Aborted multipart upload");
                true
            }
            Err(err) => {
                metrics::record_multipart_abort("failure");
                tracing::warn!(
                    upload_id = %upload_id,
                    error = %err,
                    "Failed to abort multipart upload; uncommitted parts may remain"
                );
                false
            }
        }
    }

    /// Completion for single requests and downloads. A download replaces its
    /// target only after every part is written and synced. A failed one
    /// drops its partial data unless the journal can resume it.
    async fn finish_simple(&self, writer: Option<Arc<dyn ObjectWriter>>) {
        let session = &self.shared.session;
        if session.state() == TransferState::Running {
            if !session.all_parts_completed() {
                session.fail(TransferError::Configuration(
                    "workers stopped before every part completed".into(),
                ));
            } else if let Some(writer) = &writer {
                let stored = match writer.sync().await {
                    Ok(()) => writer.persist().await,
                    Err(err) => Err(err),
                };
                match stored {
                    Ok(()) => {
                        session.mark_committed();
                    }
                    Err(err) => session.fail(err),
                }
            } else {
                session.mark_completed();
            }
        }

        match session.state() {
            TransferState::Completed => self.remove_journal().await,
            TransferState::Failed | TransferState::Cancelled => {
                let resumable =
                    self.shared.journal.is_some() && session.progress().parts_completed > 0;
                if let (Some(writer), false) = (&writer, resumable) {
                    writer.discard().await;
                }
            }
            TransferState::Running => {}
        }
    }

    fn single_etag(&self) -> Option<String> {
        self.shared
            .session
            .parts()
            .into_iter()
            .next()
            .and_then(|part| part.etag)
    }

    async fn remove_journal(&self) {
        if let Some(journal) = &self.shared.journal {
            if let Err(e) = journal.remove().await {
                tracing::warn!(error = %e, "Failed to remove resume journal");
            }
        }
    }

    /// Run the worker pool until nothing is left to dispatch
    async fn run_parts(&self, work: PartWork) {
        let dispatch = self.cancel.child_token();
        let progress = self.shared.session.progress();
        let workers = self
            .workers
            .min(progress.parts_total.saturating_sub(progress.parts_completed))
            .max(1);

        let mut set = JoinSet::new();
        for worker in 0..workers {
            let shared = Arc::clone(&self.shared);
            let work = work.clone();
            let dispatch = dispatch.clone();
            let span = tracing::debug_span!("transfer.worker", worker);
            set.spawn(worker_loop(shared, work, dispatch).instrument(span));
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                self.shared.session.fail(TransferError::Configuration(format!(
                    "transfer worker stopped unexpectedly: {}",
                    e
                )));
                dispatch.cancel();
            }
        }
    }
}

async fn worker_loop(shared: Arc<Shared>, work: PartWork, dispatch: CancellationToken) {
    loop {
        if dispatch.is_cancelled() {
            break;
        }
        let Some(part) = shared.session.claim_next() else {
            break;
        };
        run_part(&shared, &work, &dispatch, part).await;
    }
}

#[tracing::instrument(
    name = "transfer.part",
    skip_all,
    fields(part = part.index, start = part.range.start, len = part.range.len())
)]
async fn run_part(shared: &Shared, work: &PartWork, dispatch: &CancellationToken, part: PartSpec) {
    let session = &shared.session;
    let direction = shared.direction.as_str();

    // Read once: every attempt re-sends the identical bytes
    let body = match work {
        PartWork::Put { reader } | PartWork::UploadPart { reader, .. } => {
            match reader.read_range(part.range).await {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    metrics::record_part_attempt(direction, "failed");
                    session.fail_part(part.index, err);
                    dispatch.cancel();
                    return;
                }
            }
        }
        PartWork::Get { .. } => None,
    };

    loop {
        let attempt = session.begin_attempt(part.index);
        let result = attempt_part(shared, work, &part, body.clone()).await;

        match result {
            Ok(etag) => {
                metrics::record_part_attempt(direction, "success");
                if session.complete_part(part.index, etag.clone(), part.range.len()) {
                    tracing::debug!(attempt, "Part completed");
                    if let Some(journal) = &shared.journal {
                        if let Err(e) = journal.record_part(part.index, etag).await {
                            tracing::warn!(error = %e, "Failed to write resume journal");
                        }
                    }
                } else {
                    tracing::debug!("Transfer no longer running, discarding part result");
                }
                return;
            }
            Err(PartFailure::Remote(err)) if shared.policy.should_retry(&err, attempt) => {
                metrics::record_part_attempt(direction, "retry");
                let delay = shared.policy.backoff(attempt, err.retry_after());
                session.schedule_retry(part.index, &err.to_string());
                tracing::warn!(
                    attempt,
                    max_attempts = shared.policy.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Part attempt failed, retrying"
                );
                tokio::select! {
                    _ = dispatch.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                if !session.is_running() {
                    return;
                }
            }
            Err(PartFailure::Remote(err)) => {
                metrics::record_part_attempt(direction, "failed");
                tracing::error!(attempt, error = %err, "Part failed");
                session.fail_part(part.index, TransferError::from_transport(err, attempt));
                dispatch.cancel();
                return;
            }
            Err(PartFailure::Local(err)) => {
                metrics::record_part_attempt(direction, "failed");
                tracing::error!(attempt, error = %err, "Part failed on local I/O");
                session.fail_part(part.index, err);
                dispatch.cancel();
                return;
            }
        }
    }
}

/// One attempt; returns the part ETag for uploads
async fn attempt_part(
    shared: &Shared,
    work: &PartWork,
    part: &PartSpec,
    body: Option<bytes::Bytes>,
) -> Result<Option<String>, PartFailure> {
    let (bucket, key) = (shared.bucket.as_str(), shared.key.as_str());
    match work {
        PartWork::Put { .. } => shared
            .store
            .put_object(bucket, key, body.unwrap_or_default())
            .await
            .map_err(PartFailure::Remote),
        PartWork::UploadPart { upload_id, .. } => shared
            .store
            .upload_part(bucket, key, upload_id, part.index, body.unwrap_or_default())
            .await
            .map(Some)
            .map_err(PartFailure::Remote),
        PartWork::Get {
            writer,
            if_match,
            ranged,
        } => {
            let range = ranged.then_some(part.range);
            let bytes = shared
                .store
                .get_object(bucket, key, range, if_match.as_deref())
                .await
                .map_err(PartFailure::Remote)?;

            let expected = part.range.len();
            let received = bytes.len() as u64;
            if received < expected {
                return Err(PartFailure::Remote(TransportError::Truncated {
                    expected,
                    received,
                }));
            }
            if received > expected {
                return Err(PartFailure::Remote(TransportError::InvalidResponse(format!(
                    "expected {} bytes, received {}",
                    expected, received
                ))));
            }
            writer
                .write_at(part.range.start, bytes)
                .await
                .map_err(PartFailure::Local)?;
            Ok(None)
        }
    }
}

/// Attempts spent by `RetryPolicy::run` before returning `err`
pub(super) fn attempts_used(policy: &RetryPolicy, err: &TransportError) -> u32 {
    if policy.is_retryable(err) {
        policy.max_attempts()
    } else {
        1
    }
}
