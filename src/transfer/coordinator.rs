//! Transfer coordinator
//!
//! Entry point for a transfer: validates the request, discovers the object
//! size (HEAD for downloads), picks single or multipart mode, decides
//! whether to resume, opens the local file and starts the engine on its own
//! task. The coordinator never retries anything itself.
//!
//! Downloads are written to `<file>.s3part` and renamed over `<file>` once
//! complete, so a failed or cancelled download leaves an existing file as
//! it was.

use super::engine::{attempts_used, EngineJob, EngineReport, MultipartEngine};
use super::io::{local_metadata, staging_path, LocalFile, StagedFile};
use super::plan::{PartPlan, TransferMode, MAX_OBJECT_SIZE};
use super::resume::{ResumeDecision, ResumeJournal, StaleUpload, TransferIdentity};
use super::session::{Progress, TransferSession};
use super::store::ObjectStore;
use super::{Direction, TransferError, TransferRequest, TransferResult};
use crate::config::{RetryConfig, TransferConfig};
use crate::metrics;
use crate::transport::retry::RetryPolicy;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Defaults applied to every request that does not override them
#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Objects smaller than this use a single PUT/GET
    pub multipart_threshold: u64,
    pub part_size: u64,
    pub max_parallel_parts: usize,
    pub retry: RetryPolicy,
    pub resume: bool,
    /// Directory for resume journals; next to the local file when unset
    pub state_dir: Option<PathBuf>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default(), &RetryConfig::default())
    }
}

impl TransferSettings {
    pub fn from_config(transfer: &TransferConfig, retry: &RetryConfig) -> Self {
        Self {
            multipart_threshold: transfer.multipart_threshold,
            part_size: transfer.part_size,
            max_parallel_parts: transfer.max_parallel_parts,
            retry: retry.to_policy(),
            resume: transfer.resume,
            state_dir: transfer.state_dir.clone(),
        }
    }
}

/// Starts transfers against one object store
pub struct TransferCoordinator {
    store: Arc<dyn ObjectStore>,
    settings: TransferSettings,
}

impl TransferCoordinator {
    pub fn new(store: Arc<dyn ObjectStore>, settings: TransferSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Start `request` and wait for its result
    pub async fn run(&self, request: TransferRequest) -> Result<TransferResult, TransferError> {
        self.start(request).await?.join().await
    }

    /// Start `request` in the background.
    ///
    /// Errors returned here happen before any part is dispatched (invalid
    /// request, missing local file, failed HEAD). Everything later is
    /// reported through [`TransferHandle::join`].
    pub async fn start(&self, request: TransferRequest) -> Result<TransferHandle, TransferError> {
        let started = Instant::now();
        let policy = request
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.settings.retry.clone());
        let part_size = request.part_size.unwrap_or(self.settings.part_size);
        let workers = request
            .max_parallel_parts
            .unwrap_or(self.settings.max_parallel_parts);
        validate(&request, part_size, workers)?;

        let prepared = match request.direction {
            Direction::Upload => self.prepare_upload(&request, part_size).await?,
            Direction::Download => self.prepare_download(&request, part_size, &policy).await?,
        };
        let Prepared {
            local_path,
            plan,
            mode,
            source_version,
            if_match,
        } = prepared;

        let session = Arc::new(TransferSession::new(&plan));
        let (journal, resumed_upload_id) = match mode {
            TransferMode::Multipart if self.settings.resume => {
                let identity = TransferIdentity {
                    direction: request.direction,
                    bucket: request.bucket.clone(),
                    key: request.key.clone(),
                    local_path: local_path.clone(),
                    size: plan.object_size(),
                    source_version,
                    part_size: plan.part_size(),
                };
                let (journal, upload_id) = self
                    .open_journal(identity, &session, &local_path)
                    .await?;
                (Some(Arc::new(journal)), upload_id)
            }
            _ => (None, None),
        };
        let resuming = session.resumed_bytes() > 0 || resumed_upload_id.is_some();

        let job = match (request.direction, mode) {
            (Direction::Upload, TransferMode::Single) => EngineJob::SingleUpload {
                reader: Arc::new(LocalFile::open(&local_path).await?),
            },
            (Direction::Upload, TransferMode::Multipart) => EngineJob::MultipartUpload {
                reader: Arc::new(LocalFile::open(&local_path).await?),
                upload_id: resumed_upload_id,
            },
            (Direction::Download, TransferMode::Single) => EngineJob::SingleDownload {
                writer: Arc::new(StagedFile::create(&local_path, plan.object_size(), false).await?),
                if_match,
            },
            (Direction::Download, TransferMode::Multipart) => EngineJob::MultipartDownload {
                writer: Arc::new(
                    StagedFile::create(&local_path, plan.object_size(), resuming).await?,
                ),
                if_match,
            },
        };

        let cancel = CancellationToken::new();
        let span = tracing::info_span!(
            "transfer",
            direction = %request.direction,
            bucket = %request.bucket,
            key = %request.key,
        );
        span.in_scope(|| {
            tracing::info!(
                path = %local_path.display(),
                mode = mode.as_str(),
                size = plan.object_size(),
                parts = plan.len(),
                part_size = plan.part_size(),
                workers,
                resumed_bytes = session.resumed_bytes(),
                "Starting transfer"
            );
        });

        let engine = MultipartEngine::new(
            Arc::clone(&self.store),
            Arc::clone(&session),
            request.bucket.clone(),
            request.key.clone(),
            request.direction,
            policy,
            workers,
            cancel.clone(),
        )
        .with_journal(journal);
        let task = tokio::spawn(engine.run(job).instrument(span));

        Ok(TransferHandle {
            control: TransferControl { session, cancel },
            task,
            direction: request.direction,
            bucket: request.bucket,
            key: request.key,
            local_path,
            mode,
            object_size: plan.object_size(),
            started,
        })
    }

    async fn prepare_upload(
        &self,
        request: &TransferRequest,
        part_size: u64,
    ) -> Result<Prepared, TransferError> {
        let meta = local_metadata(&request.local_path).await?;
        if meta.size > MAX_OBJECT_SIZE {
            return Err(TransferError::Configuration(format!(
                "object of {} bytes exceeds the maximum object size of {} bytes",
                meta.size, MAX_OBJECT_SIZE
            )));
        }
        let mode = self.choose_mode(meta.size);
        let plan = match mode {
            TransferMode::Single => PartPlan::single(meta.size),
            TransferMode::Multipart => PartPlan::for_upload(meta.size, part_size)?,
        };
        Ok(Prepared {
            local_path: request.local_path.clone(),
            plan,
            mode,
            source_version: meta.modified.map(|nanos| nanos.to_string()),
            if_match: None,
        })
    }

    async fn prepare_download(
        &self,
        request: &TransferRequest,
        part_size: u64,
        policy: &RetryPolicy,
    ) -> Result<Prepared, TransferError> {
        let (size, etag, last_modified) = match request.object_size {
            Some(size) => (size, None, None),
            None => {
                let info = policy
                    .run("head_object", || {
                        self.store.head_object(&request.bucket, &request.key)
                    })
                    .await
                    .map_err(|err| {
                        let attempts = attempts_used(policy, &err);
                        TransferError::from_transport(err, attempts)
                    })?;
                (info.size, info.etag, info.last_modified)
            }
        };

        let local_path = download_target(&request.local_path, &request.key).await?;
        if let Some(parent) = local_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| TransferError::local_io(parent, e))?;
            }
        }

        let mode = self.choose_mode(size);
        let plan = match mode {
            TransferMode::Single => PartPlan::single(size),
            TransferMode::Multipart => PartPlan::for_download(size, part_size)?,
        };
        Ok(Prepared {
            local_path,
            plan,
            mode,
            source_version: etag.clone().or(last_modified),
            if_match: etag,
        })
    }

    fn choose_mode(&self, size: u64) -> TransferMode {
        if size == 0 || size < self.settings.multipart_threshold {
            TransferMode::Single
        } else {
            TransferMode::Multipart
        }
    }

    /// Open the journal and replay completed parts into `session`. Returns
    /// the upload id to continue, if any.
    async fn open_journal(
        &self,
        identity: TransferIdentity,
        session: &TransferSession,
        local_path: &Path,
    ) -> Result<(ResumeJournal, Option<String>), TransferError> {
        let direction = identity.direction;
        let size = identity.size;
        let path = ResumeJournal::location(&identity, self.settings.state_dir.as_deref());
        let (journal, decision) = ResumeJournal::open(path.clone(), identity)
            .await
            .map_err(|e| TransferError::local_io(&path, e))?;

        match decision {
            ResumeDecision::Fresh => Ok((journal, None)),
            ResumeDecision::Invalidated { stale_upload } => {
                if let Some(stale) = stale_upload {
                    self.abort_stale(&stale).await;
                }
                Ok((journal, None))
            }
            ResumeDecision::Resume { upload_id, parts } => {
                let partial = staging_path(local_path);
                if direction == Direction::Download && !partial_file_matches(&partial, size).await {
                    tracing::info!(
                        path = %partial.display(),
                        "Partial download is missing or has the wrong size, starting over"
                    );
                    journal
                        .reset()
                        .await
                        .map_err(|e| TransferError::local_io(&path, e))?;
                    return Ok((journal, None));
                }
                if direction == Direction::Upload && upload_id.is_none() {
                    return Ok((journal, None));
                }

                let mut restored = 0;
                for (index, etag) in parts {
                    if direction == Direction::Upload && etag.is_none() {
                        continue;
                    }
                    if session.mark_resumed(index, etag) {
                        restored += 1;
                    }
                }
                tracing::info!(
                    journal = %path.display(),
                    parts = restored,
                    bytes = session.resumed_bytes(),
                    "Resuming transfer"
                );
                Ok((journal, upload_id))
            }
        }
    }

    /// One best-effort abort for an upload a stale journal left behind
    async fn abort_stale(&self, stale: &StaleUpload) {
        match self
            .store
            .abort_multipart_upload(&stale.bucket, &stale.key, &stale.upload_id)
            .await
        {
            Ok(()) => {
                metrics::record_multipart_abort("success");
                tracing::info!(upload_id = %stale.upload_id, "Aborted stale multipart upload");
            }
            Err(e) => {
                metrics::record_multipart_abort("failure");
                tracing::warn!(
                    upload_id = %stale.upload_id,
                    error = %e,
                    "Failed to abort stale multipart upload"
                );
            }
        }
    }
}

struct Prepared {
    local_path: PathBuf,
    plan: PartPlan,
    mode: TransferMode,
    source_version: Option<String>,
    if_match: Option<String>,
}

fn validate(
    request: &TransferRequest,
    part_size: u64,
    workers: usize,
) -> Result<(), TransferError> {
    if request.bucket.is_empty() {
        return Err(TransferError::Configuration("bucket must not be empty".into()));
    }
    if request.key.is_empty() {
        return Err(TransferError::Configuration("object key must not be empty".into()));
    }
    if request.local_path.as_os_str().is_empty() {
        return Err(TransferError::Configuration("local path must not be empty".into()));
    }
    if part_size == 0 {
        return Err(TransferError::Configuration("part size must be greater than 0".into()));
    }
    if workers == 0 {
        return Err(TransferError::Configuration(
            "max parallel parts must be at least 1".into(),
        ));
    }
    Ok(())
}

/// A directory target receives the object's base name
async fn download_target(local_path: &Path, key: &str) -> Result<PathBuf, TransferError> {
    let is_dir = tokio::fs::metadata(local_path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if !is_dir {
        return Ok(local_path.to_path_buf());
    }
    match key.rsplit('/').next().filter(|name| !name.is_empty()) {
        Some(name) => Ok(local_path.join(name)),
        None => Err(TransferError::Configuration(format!(
            "cannot derive a file name from key '{}'",
            key
        ))),
    }
}

async fn partial_file_matches(path: &Path, size: u64) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file() && m.len() == size)
        .unwrap_or(false)
}

/// Cancel and observe a running transfer. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TransferControl {
    session: Arc<TransferSession>,
    cancel: CancellationToken,
}

impl TransferControl {
    /// Stop dispatching parts. Parts in flight finish; uploads are aborted.
    pub fn cancel(&self) {
        if self.session.cancel() {
            tracing::info!("Cancelling transfer");
        }
        self.cancel.cancel();
    }

    pub fn progress(&self) -> Progress {
        self.session.progress()
    }

    pub fn is_finished(&self) -> bool {
        self.session.state().is_terminal()
    }
}

/// A transfer running in the background
#[derive(Debug)]
pub struct TransferHandle {
    control: TransferControl,
    task: JoinHandle<EngineReport>,
    direction: Direction,
    bucket: String,
    key: String,
    local_path: PathBuf,
    mode: TransferMode,
    object_size: u64,
    started: Instant,
}

impl TransferHandle {
    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn progress(&self) -> Progress {
        self.control.progress()
    }

    /// Handle for cancelling or polling from another task
    pub fn control(&self) -> TransferControl {
        self.control.clone()
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn mode(&self) -> TransferMode {
        self.mode
    }

    /// Wait for the transfer to reach a terminal state
    pub async fn join(self) -> Result<TransferResult, TransferError> {
        let report = self.task.await.map_err(|e| {
            TransferError::Configuration(format!("transfer task stopped unexpectedly: {}", e))
        })?;

        let session = &self.control.session;
        let progress = session.progress();
        let resumed_bytes = session.resumed_bytes();
        let result = TransferResult {
            direction: self.direction,
            bucket: self.bucket,
            key: self.key,
            local_path: self.local_path,
            mode: self.mode,
            state: progress.state,
            object_size: self.object_size,
            bytes_transferred: progress.bytes_completed.saturating_sub(resumed_bytes),
            resumed_bytes,
            duration: self.started.elapsed(),
            parts_completed: progress.parts_completed,
            parts_total: progress.parts_total,
            part_errors: session.part_errors(),
            etag: report.etag,
            upload_id: report.upload_id,
            error: session.failure(),
        };

        metrics::record_transfer(
            result.direction.as_str(),
            result.state.as_str(),
            result.bytes_transferred,
            result.duration.as_secs_f64(),
        );
        match &result.error {
            None => tracing::info!(
                direction = %result.direction,
                key = %result.key,
                bytes = result.bytes_transferred,
                duration_ms = result.duration.as_millis() as u64,
                parts = result.parts_total,
                "Transfer completed"
            ),
            Some(err) => {
                metrics::record_error(err.kind().as_str());
                tracing::warn!(
                    direction = %result.direction,
                    key = %result.key,
                    state = %result.state,
                    parts_completed = result.parts_completed,
                    parts_total = result.parts_total,
                    error = %err,
                    "Transfer did not complete"
                );
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::testing::{data, MemoryStore};
    use crate::transfer::{ErrorKind, TransferState};
    use std::time::Duration;
    use tempfile::TempDir;

    fn settings(threshold: u64, resume: bool) -> TransferSettings {
        TransferSettings {
            multipart_threshold: threshold,
            part_size: 10_000,
            max_parallel_parts: 3,
            retry: RetryPolicy::new(4)
                .with_base_delay(Duration::from_millis(1))
                .with_jitter(0.0),
            resume,
            state_dir: None,
        }
    }

    fn coordinator(store: &Arc<MemoryStore>, threshold: u64, resume: bool) -> TransferCoordinator {
        TransferCoordinator::new(
            Arc::clone(store) as Arc<dyn ObjectStore>,
            settings(threshold, resume),
        )
    }

    fn write_source(dir: &TempDir, len: usize) -> (PathBuf, Vec<u8>) {
        let path = dir.path().join("source.bin");
        let bytes = data(len);
        std::fs::write(&path, &bytes).unwrap();
        (path, bytes)
    }

    #[tokio::test]
    async fn test_small_upload_uses_single_request() {
        let dir = TempDir::new().unwrap();
        let (path, bytes) = write_source(&dir, 1_000);
        let store = Arc::new(MemoryStore::default());

        let result = coordinator(&store, 5_000, true)
            .run(TransferRequest::upload("bucket", "small.bin", &path))
            .await
            .unwrap();

        assert_eq!(result.mode, TransferMode::Single);
        assert!(result.is_success());
        assert_eq!(store.calls("create"), 0);
        assert_eq!(store.calls("put"), 1);
        assert_eq!(*store.object.lock(), bytes);
    }

    #[tokio::test]
    async fn test_empty_upload_uses_single_request() {
        let dir = TempDir::new().unwrap();
        let (path, _) = write_source(&dir, 0);
        let store = Arc::new(MemoryStore::default());

        let result = coordinator(&store, 0, true)
            .run(TransferRequest::upload("bucket", "empty.bin", &path))
            .await
            .unwrap();

        assert_eq!(result.mode, TransferMode::Single);
        assert_eq!(result.parts_total, 1);
        assert!(result.is_success());
        assert_eq!(store.calls("put"), 1);
    }

    #[tokio::test]
    async fn test_multipart_upload_removes_journal() {
        let dir = TempDir::new().unwrap();
        let (path, bytes) = write_source(&dir, 35_000);
        let store = Arc::new(MemoryStore::default());

        let result = coordinator(&store, 5_000, true)
            .run(TransferRequest::upload("bucket", "big.bin", &path).with_part_size(10_000))
            .await
            .unwrap()
            .ensure_completed()
            .unwrap();

        assert_eq!(result.mode, TransferMode::Multipart);
        assert_eq!(result.parts_total, 1);
        assert_eq!(*store.object.lock(), bytes);
        assert!(!dir.path().join("source.bin.s3resume").exists());
    }

    #[tokio::test]
    async fn test_failed_upload_reports_partial_transfer() {
        let dir = TempDir::new().unwrap();
        let (path, _) = write_source(&dir, 40_000_000);
        let store = Arc::new(MemoryStore::default());
        store.fail_part(5, 1, 403);

        let request = TransferRequest::upload("bucket", "big.bin", &path)
            .with_part_size(5 * 1024 * 1024)
            .with_max_parallel_parts(1);
        let result = coordinator(&store, 5_000, true).run(request).await.unwrap();

        assert_eq!(result.state, TransferState::Failed);
        assert_eq!(result.parts_completed, 4);
        assert_eq!(result.parts_total, 8);
        assert_eq!(store.calls("abort"), 1);
        assert!(!dir.path().join("source.bin.s3resume").exists());
        match result.ensure_completed() {
            Err(TransferError::PartialTransfer {
                completed,
                total,
                kind,
                ..
            }) => {
                assert_eq!((completed, total), (4, 8));
                assert_eq!(kind, ErrorKind::Authentication);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_download_into_directory_uses_key_name() {
        let dir = TempDir::new().unwrap();
        let object = data(25_000);
        let store = Arc::new(MemoryStore::with_object(object.clone()));

        let result = coordinator(&store, 5_000, true)
            .run(
                TransferRequest::download("bucket", "nested/report.bin", dir.path())
                    .with_part_size(4_000),
            )
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.local_path, dir.path().join("report.bin"));
        assert_eq!(std::fs::read(dir.path().join("report.bin")).unwrap(), object);
        assert_eq!(store.calls("head"), 1);
        assert_eq!(store.calls("get"), 7);
        assert!(store
            .if_match
            .lock()
            .iter()
            .all(|tag| tag.as_deref() == Some("\"memory\"")));
    }

    #[tokio::test]
    async fn test_resumed_download_fetches_missing_parts_only() {
        let dir = TempDir::new().unwrap();
        let object = data(30_000);
        let target = dir.path().join("object.bin");
        let store = Arc::new(MemoryStore::with_object(object.clone()));

        // First 10_000 bytes are staged from an earlier run
        let mut partial = object[..10_000].to_vec();
        partial.resize(30_000, 0);
        std::fs::write(staging_path(&target), &partial).unwrap();
        let identity = TransferIdentity {
            direction: Direction::Download,
            bucket: "bucket".into(),
            key: "object.bin".into(),
            local_path: target.clone(),
            size: 30_000,
            source_version: Some("\"memory\"".into()),
            part_size: 10_000,
        };
        let journal_path = ResumeJournal::location(&identity, None);
        let (journal, _) = ResumeJournal::open(journal_path.clone(), identity).await.unwrap();
        journal.record_part(1, None).await.unwrap();

        let result = coordinator(&store, 5_000, true)
            .run(TransferRequest::download("bucket", "object.bin", &target))
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.resumed_bytes, 10_000);
        assert_eq!(result.bytes_transferred, 20_000);
        assert_eq!(store.calls("get"), 2);
        assert_eq!(std::fs::read(&target).unwrap(), object);
        assert!(!journal_path.exists());
        assert!(!staging_path(&target).exists());
    }

    #[tokio::test]
    async fn test_failed_download_keeps_existing_file() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("keep.bin");
        std::fs::write(&target, b"existing local data").unwrap();
        let store = Arc::new(MemoryStore::with_object(data(30_000)));
        *store.get_status.lock() = Some(403);

        for threshold in [5_000, 100_000] {
            let result = coordinator(&store, threshold, true)
                .run(TransferRequest::download("bucket", "keep.bin", &target))
                .await
                .unwrap();

            assert_eq!(result.state, TransferState::Failed);
            assert_eq!(std::fs::read(&target).unwrap(), b"existing local data");
        }
        // Nothing completed, so no journal and no staged data are left
        assert!(!staging_path(&target).exists());
        assert!(!dir.path().join("keep.bin.s3resume").exists());
    }

    #[tokio::test]
    async fn test_duration_includes_size_discovery() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::with_object(data(1_000)));
        *store.head_delay.lock() = Some(Duration::from_millis(100));

        let result = coordinator(&store, 5_000, false)
            .run(TransferRequest::download("bucket", "slow.bin", dir.path().join("slow.bin")))
            .await
            .unwrap();

        assert!(result.is_success());
        assert!(result.duration >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let store = Arc::new(MemoryStore::default());
        let coordinator = coordinator(&store, 5_000, false);

        let err = coordinator
            .start(TransferRequest::upload("bucket", "", "/tmp/x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err = coordinator
            .start(TransferRequest::upload("bucket", "k", "/tmp/x").with_max_parallel_parts(0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err = coordinator
            .start(TransferRequest::upload("bucket", "k", "/definitely/missing/file"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LocalIo);
        assert!(store.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_reports_cancelled() {
        let dir = TempDir::new().unwrap();
        let (path, _) = write_source(&dir, 40_000);
        let store = Arc::new(MemoryStore::default());
        store.fail_part(1, 1_000, 503);

        let request = TransferRequest::upload("bucket", "big.bin", &path)
            .with_part_size(10_000)
            .with_max_parallel_parts(1)
            .with_retry_policy(
                RetryPolicy::new(1_000)
                    .with_base_delay(Duration::from_millis(10))
                    .with_max_delay(Duration::from_millis(10))
                    .with_jitter(0.0),
            );
        let handle = coordinator(&store, 5_000, true).start(request).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.progress().dispatched >= 1);
        handle.cancel();

        let result = handle.join().await.unwrap();
        assert_eq!(result.state, TransferState::Cancelled);
        assert_eq!(store.calls("abort"), 1);
        assert!(matches!(result.ensure_completed(), Err(TransferError::Cancelled)));
    }
}
