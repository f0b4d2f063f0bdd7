//! Transfer session state
//!
//! All parts of one transfer live behind a single lock. Workers claim parts,
//! report attempts and outcomes; nothing else mutates the session. Once the
//! session leaves `Running` no further part is handed out and late part
//! results are discarded.

use super::plan::{PartPlan, PartSpec};
use super::store::{ByteRange, CompletedPart};
use super::TransferError;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;

/// Per-part attempt state machine:
/// `Pending -> InFlight -> (Completed | RetryScheduled -> InFlight | Failed)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartState {
    Pending,
    InFlight,
    RetryScheduled,
    Completed,
    Failed,
}

/// Terminal and running states of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TransferState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferState::Running => "running",
            TransferState::Completed => "completed",
            TransferState::Failed => "failed",
            TransferState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One part and its bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub index: u32,
    pub range: ByteRange,
    pub state: PartState,
    pub attempts: u32,
    /// Upload only
    pub etag: Option<String>,
    /// Download only
    pub received: u64,
    pub last_error: Option<String>,
}

/// Summary of a part that did not complete cleanly
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartErrorSummary {
    pub index: u32,
    pub attempts: u32,
    pub state: PartState,
    pub message: String,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub state: TransferState,
    pub parts_total: usize,
    pub parts_completed: usize,
    pub bytes_total: u64,
    pub bytes_completed: u64,
    /// Parts handed to workers so far
    pub dispatched: u64,
}

struct Inner {
    parts: Vec<Part>,
    cursor: usize,
    state: TransferState,
    completed: usize,
    dispatched: u64,
    bytes_completed: u64,
    resumed_bytes: u64,
    failure: Option<TransferError>,
}

impl Inner {
    fn part_mut(&mut self, index: u32) -> Option<&mut Part> {
        self.parts.get_mut((index as usize).checked_sub(1)?)
    }
}

/// Shared state of one transfer
pub struct TransferSession {
    object_size: u64,
    inner: Mutex<Inner>,
}

impl TransferSession {
    pub fn new(plan: &PartPlan) -> Self {
        let parts = plan
            .parts()
            .iter()
            .map(|spec| Part {
                index: spec.index,
                range: spec.range,
                state: PartState::Pending,
                attempts: 0,
                etag: None,
                received: 0,
                last_error: None,
            })
            .collect();

        Self {
            object_size: plan.object_size(),
            inner: Mutex::new(Inner {
                parts,
                cursor: 0,
                state: TransferState::Running,
                completed: 0,
                dispatched: 0,
                bytes_completed: 0,
                resumed_bytes: 0,
                failure: None,
            }),
        }
    }

    /// Mark a part as already done by an earlier run. Call before dispatching.
    pub fn mark_resumed(&self, index: u32, etag: Option<String>) -> bool {
        let mut inner = self.inner.lock();
        let Some(part) = inner.part_mut(index) else {
            return false;
        };
        if part.state == PartState::Completed {
            return false;
        }
        part.state = PartState::Completed;
        part.etag = etag;
        part.received = part.range.len();
        let len = part.range.len();
        inner.completed += 1;
        inner.bytes_completed += len;
        inner.resumed_bytes += len;
        true
    }

    /// Hand out the next pending part, or `None` once the session stopped
    /// running or every part has been dispatched.
    pub fn claim_next(&self) -> Option<PartSpec> {
        let mut inner = self.inner.lock();
        if inner.state != TransferState::Running {
            return None;
        }
        while inner.cursor < inner.parts.len() {
            let position = inner.cursor;
            inner.cursor += 1;
            let part = &mut inner.parts[position];
            if part.state != PartState::Pending {
                continue;
            }
            part.state = PartState::InFlight;
            let spec = PartSpec {
                index: part.index,
                range: part.range,
            };
            inner.dispatched += 1;
            return Some(spec);
        }
        None
    }

    /// Record the start of an attempt; returns the attempt number (1-based)
    pub fn begin_attempt(&self, index: u32) -> u32 {
        let mut inner = self.inner.lock();
        match inner.part_mut(index) {
            Some(part) => {
                part.attempts += 1;
                part.state = PartState::InFlight;
                part.attempts
            }
            None => 0,
        }
    }

    pub fn schedule_retry(&self, index: u32, error: &str) {
        let mut inner = self.inner.lock();
        if let Some(part) = inner.part_mut(index) {
            part.state = PartState::RetryScheduled;
            part.last_error = Some(error.to_string());
        }
    }

    /// Record a finished part. Returns false (and drops the result) when the
    /// session is no longer running.
    pub fn complete_part(&self, index: u32, etag: Option<String>, bytes: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != TransferState::Running {
            return false;
        }
        let Some(part) = inner.part_mut(index) else {
            return false;
        };
        if part.state == PartState::Completed {
            return false;
        }
        part.state = PartState::Completed;
        part.etag = etag;
        part.received = bytes;
        inner.completed += 1;
        inner.bytes_completed += bytes;
        true
    }

    /// Mark a part failed for good. The first failure moves a running
    /// session to `Failed` and becomes its terminal error.
    pub fn fail_part(&self, index: u32, error: TransferError) {
        let mut inner = self.inner.lock();
        if let Some(part) = inner.part_mut(index) {
            part.state = PartState::Failed;
            part.last_error = Some(error.to_string());
        }
        if inner.state == TransferState::Running {
            inner.state = TransferState::Failed;
            inner.failure = Some(error);
        }
    }

    /// Fail the session for a reason outside any part (initiate, complete, local I/O)
    pub fn fail(&self, error: TransferError) {
        let mut inner = self.inner.lock();
        if !inner.state.is_terminal() {
            inner.state = TransferState::Failed;
            inner.failure = Some(error);
        }
    }

    /// Returns true when this call moved the session to `Cancelled`
    pub fn cancel(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == TransferState::Running {
            inner.state = TransferState::Cancelled;
            inner.failure = Some(TransferError::Cancelled);
            true
        } else {
            false
        }
    }

    /// Move to `Completed` if every part is done
    pub fn mark_completed(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == TransferState::Running && inner.completed == inner.parts.len() {
            inner.state = TransferState::Completed;
            true
        } else {
            false
        }
    }

    /// Record a remote commit (CompleteMultipartUpload succeeded). A cancel
    /// that raced the commit is overridden; the object exists.
    pub fn mark_committed(&self) -> bool {
        let mut inner = self.inner.lock();
        let committable = matches!(
            inner.state,
            TransferState::Running | TransferState::Cancelled
        );
        if committable && inner.completed == inner.parts.len() {
            inner.state = TransferState::Completed;
            inner.failure = None;
            true
        } else {
            false
        }
    }

    pub fn state(&self) -> TransferState {
        self.inner.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == TransferState::Running
    }

    pub fn all_parts_completed(&self) -> bool {
        let inner = self.inner.lock();
        inner.completed == inner.parts.len()
    }

    pub fn progress(&self) -> Progress {
        let inner = self.inner.lock();
        Progress {
            state: inner.state,
            parts_total: inner.parts.len(),
            parts_completed: inner.completed,
            bytes_total: self.object_size,
            bytes_completed: inner.bytes_completed,
            dispatched: inner.dispatched,
        }
    }

    pub fn dispatched(&self) -> u64 {
        self.inner.lock().dispatched
    }

    pub fn resumed_bytes(&self) -> u64 {
        self.inner.lock().resumed_bytes
    }

    pub fn attempts(&self, index: u32) -> u32 {
        let inner = self.inner.lock();
        index
            .checked_sub(1)
            .and_then(|i| inner.parts.get(i as usize))
            .map(|p| p.attempts)
            .unwrap_or(0)
    }

    /// Completed parts with their ETags, ascending by part number
    pub fn completed_parts(&self) -> Vec<CompletedPart> {
        let inner = self.inner.lock();
        let mut parts: Vec<CompletedPart> = inner
            .parts
            .iter()
            .filter(|p| p.state == PartState::Completed)
            .filter_map(|p| {
                p.etag.as_ref().map(|etag| CompletedPart {
                    part_number: p.index,
                    etag: etag.clone(),
                })
            })
            .collect();
        parts.sort_by_key(|p| p.part_number);
        parts
    }

    /// Parts that failed or needed retries
    pub fn part_errors(&self) -> Vec<PartErrorSummary> {
        let inner = self.inner.lock();
        inner
            .parts
            .iter()
            .filter(|p| p.state != PartState::Completed || p.attempts > 1)
            .filter_map(|p| {
                p.last_error.as_ref().map(|message| PartErrorSummary {
                    index: p.index,
                    attempts: p.attempts,
                    state: p.state,
                    message: message.clone(),
                })
            })
            .collect()
    }

    pub fn failure(&self) -> Option<TransferError> {
        self.inner.lock().failure.clone()
    }

    /// Copy of every part, in index order
    pub fn parts(&self) -> Vec<Part> {
        self.inner.lock().parts.clone()
    }
}

impl fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let progress = self.progress();
        f.debug_struct("TransferSession")
            .field("state", &progress.state)
            .field("parts_completed", &progress.parts_completed)
            .field("parts_total", &progress.parts_total)
            .finish()
    }
}
