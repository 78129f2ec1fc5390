//! Upload task model and its status lifecycle

use crate::uploader::chunk::ChunkPlan;
use crate::uploader::error::{TaskError, UploadError, UploadResult};
use crate::uploader::probe::ResumeSet;
use crate::uploader::progress::SpeedCalculator;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Local task identifier
pub type TaskId = String;

const UPLOAD_ID_LEN: usize = 12;
const UPLOAD_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Random 12-character alphanumeric id sent to the server as `fileId`
pub fn generate_upload_id() -> String {
    Uuid::new_v4()
        .as_bytes()
        .iter()
        .take(UPLOAD_ID_LEN)
        .map(|b| UPLOAD_ID_ALPHABET[*b as usize % UPLOAD_ID_ALPHABET.len()] as char)
        .collect()
}

/// A local file handed to the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSource {
    pub path: PathBuf,
    /// Name declared to the server
    pub name: String,
    pub size: u64,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            size,
        }
    }

    /// Describe the file at `path`, using its file name as the declared name
    pub async fn from_path(path: impl Into<PathBuf>) -> UploadResult<Self> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(UploadError::FileRead(format!("{} is not a file", path.display())));
        }

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| UploadError::FileRead(format!("{} has no file name", path.display())))?;

        Ok(Self::new(path, name, metadata.len()))
    }
}

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Digesting,
    Transferring,
    Retrying,
    FinishedTransfer,
    Transcoding,
    TranscodeDone,
    TranscodeFailed,
    EmptyFile,
    FastMatched,
    Failed,
    Paused,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Digesting => "digesting",
            TaskStatus::Transferring => "transferring",
            TaskStatus::Retrying => "retrying",
            TaskStatus::FinishedTransfer => "finished_transfer",
            TaskStatus::Transcoding => "transcoding",
            TaskStatus::TranscodeDone => "transcode_done",
            TaskStatus::TranscodeFailed => "transcode_failed",
            TaskStatus::EmptyFile => "empty_file",
            TaskStatus::FastMatched => "fast_matched",
            TaskStatus::Failed => "failed",
            TaskStatus::Paused => "paused",
        }
    }

    /// No further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::TranscodeDone
                | TaskStatus::TranscodeFailed
                | TaskStatus::EmptyFile
                | TaskStatus::FastMatched
        )
    }

    /// Counted by the registry's active task count
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && !matches!(self, TaskStatus::Paused | TaskStatus::Failed)
    }

    /// Chunk acknowledgements and retries still apply
    pub fn accepts_chunk_updates(&self) -> bool {
        matches!(self, TaskStatus::Transferring | TaskStatus::Retrying | TaskStatus::Paused)
    }

    /// Transfer succeeded; removed by `clear_completed`
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            TaskStatus::FinishedTransfer | TaskStatus::FastMatched | TaskStatus::TranscodeDone
        )
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, next),
            (Digesting, Transferring | Failed | Paused)
                | (Transferring, Retrying | FinishedTransfer | FastMatched | Failed | Paused)
                | (Retrying, Transferring | FinishedTransfer | FastMatched | Failed | Paused)
                | (FinishedTransfer, Transcoding)
                | (Transcoding, TranscodeDone | TranscodeFailed)
                | (Failed, Retrying | Digesting)
                | (Paused, Transferring | Digesting | Failed | FastMatched | FinishedTransfer)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which chunk is being retried, for the "retrying (k/N)" indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    pub chunk_index: u32,
    /// Attempt about to be made, starting at 2
    pub attempt: u32,
    pub max_attempts: u32,
}

/// One file being uploaded
pub struct UploadTask {
    pub id: TaskId,
    /// Server-facing id; replaced when a chunk response revises it
    pub upload_id: String,
    pub source: FileSource,
    pub folder_id: String,
    pub digest: Option<String>,
    pub digest_progress: u8,
    pub paused: bool,
    /// A runner currently owns this task
    pub in_flight: bool,
    pub error: Option<TaskError>,
    /// Some chunks were already on the server when the transfer started
    pub resumed: bool,
    /// The resume probe has run for the current digest
    pub probed: bool,
    pub retry: Option<RetryState>,
    pub created_at: DateTime<Utc>,
    pub(crate) seq: u64,
    /// Cancelled when the task is removed
    pub(crate) cancel: CancellationToken,
    /// Cancels the running digest worker only
    pub(crate) digest_cancel: Option<CancellationToken>,
    status: TaskStatus,
    plan: ChunkPlan,
    chunk_loaded: BTreeMap<u32, u64>,
    completed_chunks: BTreeSet<u32>,
    chunk_cursor: u32,
    speed: SpeedCalculator,
}

impl UploadTask {
    /// Zero-byte sources start out as `EmptyFile`
    pub fn new(source: FileSource, folder_id: impl Into<String>, chunk_size: u64) -> Self {
        let status = if source.size == 0 {
            TaskStatus::EmptyFile
        } else {
            TaskStatus::Digesting
        };

        Self {
            id: Uuid::new_v4().to_string(),
            upload_id: generate_upload_id(),
            plan: ChunkPlan::new(source.size, chunk_size),
            source,
            folder_id: folder_id.into(),
            digest: None,
            digest_progress: 0,
            paused: false,
            in_flight: false,
            error: None,
            resumed: false,
            probed: false,
            retry: None,
            created_at: Utc::now(),
            seq: 0,
            cancel: CancellationToken::new(),
            digest_cancel: None,
            status,
            chunk_loaded: BTreeMap::new(),
            completed_chunks: BTreeSet::new(),
            chunk_cursor: 0,
            speed: SpeedCalculator::default(),
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    pub fn total_size(&self) -> u64 {
        self.source.size
    }

    /// Move to `next`, rejecting changes outside the lifecycle.
    /// Staying in the same status is a no-op.
    pub fn transition(&mut self, next: TaskStatus) -> UploadResult<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(UploadError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        tracing::trace!(target: "uploader::task", task_id = %self.id, from = %self.status, to = %next, "Status change");
        if !matches!(next, TaskStatus::Transferring | TaskStatus::Retrying) {
            self.speed.reset();
        }
        self.status = next;
        Ok(())
    }

    /// Record a failure and move to `Failed`
    pub fn fail(&mut self, err: &UploadError) -> UploadResult<()> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(TaskError::from(err));
        self.retry = None;
        Ok(())
    }

    /// `min(total, Σ loaded)`
    pub fn uploaded_bytes(&self) -> u64 {
        let sum: u64 = self.chunk_loaded.values().sum();
        sum.min(self.total_size())
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_size() == 0 {
            return if self.status == TaskStatus::EmptyFile { 100.0 } else { 0.0 };
        }
        self.uploaded_bytes() as f64 / self.total_size() as f64 * 100.0
    }

    /// Bytes read so far for a chunk that is still being sent.
    /// A smaller value than before means the chunk restarted.
    pub fn set_chunk_loaded(&mut self, index: u32, loaded: u64) {
        if !self.plan.contains(index) || self.completed_chunks.contains(&index) {
            return;
        }

        let loaded = loaded.min(self.plan.chunk_len(index));
        let previous = self.chunk_loaded.insert(index, loaded).unwrap_or(0);
        if loaded > previous {
            self.speed.add_sample(loaded - previous);
        }
    }

    /// Mark a chunk as acknowledged by the server
    pub fn complete_chunk(&mut self, index: u32) {
        if !self.plan.contains(index) {
            return;
        }
        self.chunk_loaded.insert(index, self.plan.chunk_len(index));
        self.completed_chunks.insert(index);
        self.chunk_cursor = self.chunk_cursor.max(index + 1);
    }

    /// The server holds the whole file; count every chunk as sent
    pub fn mark_transferred(&mut self) {
        for index in 0..self.plan.chunk_count() {
            self.complete_chunk(index);
        }
    }

    /// Pre-fill the chunk map from a resume probe
    pub fn apply_resume_set(&mut self, set: &ResumeSet) {
        for index in set.iter() {
            self.complete_chunk(index);
        }
        self.resumed = self.resumed || !set.is_empty();
        self.probed = true;
    }

    /// Take a server-revised upload id; the latest one applied wins
    pub fn apply_upload_id(&mut self, upload_id: Option<&str>) {
        if let Some(upload_id) = upload_id.filter(|id| !id.is_empty()) {
            if upload_id != self.upload_id {
                tracing::debug!(
                    target: "uploader::task",
                    task_id = %self.id,
                    old = %self.upload_id,
                    new = %upload_id,
                    "Server revised upload id"
                );
                self.upload_id = upload_id.to_string();
            }
        }
    }

    /// Indices in `range` not yet acknowledged
    pub fn pending_in(&self, range: RangeInclusive<u32>) -> Vec<u32> {
        range
            .filter(|index| !self.completed_chunks.contains(index))
            .collect()
    }

    pub fn all_chunks_complete(&self) -> bool {
        self.completed_chunks.len() as u32 == self.plan.chunk_count()
    }

    pub fn completed_chunks(&self) -> &BTreeSet<u32> {
        &self.completed_chunks
    }

    /// Highest acknowledged index + 1
    pub fn chunk_cursor(&self) -> u32 {
        self.chunk_cursor
    }

    /// Human-readable status tag
    pub fn status_label(&self) -> String {
        match self.status {
            TaskStatus::Digesting => format!("digesting {}%", self.digest_progress),
            TaskStatus::Transferring => "uploading".to_string(),
            TaskStatus::Retrying => match self.retry {
                Some(retry) => format!("retrying ({}/{})", retry.attempt, retry.max_attempts),
                None => "retrying".to_string(),
            },
            TaskStatus::FinishedTransfer => "upload finished".to_string(),
            TaskStatus::Transcoding => "transcoding".to_string(),
            TaskStatus::TranscodeDone => "done".to_string(),
            TaskStatus::TranscodeFailed => "transcode failed".to_string(),
            TaskStatus::EmptyFile => "empty file".to_string(),
            TaskStatus::FastMatched => "fast upload".to_string(),
            TaskStatus::Failed => self
                .error
                .as_ref()
                .map(|error| error.kind.failure_label())
                .unwrap_or("failed")
                .to_string(),
            TaskStatus::Paused => "paused".to_string(),
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let transferring = matches!(self.status, TaskStatus::Transferring | TaskStatus::Retrying);
        let remaining = self.total_size() - self.uploaded_bytes();

        TaskSnapshot {
            id: self.id.clone(),
            upload_id: self.upload_id.clone(),
            file_name: self.source.name.clone(),
            folder_id: self.folder_id.clone(),
            status: self.status,
            status_label: self.status_label(),
            total_size: self.total_size(),
            uploaded_bytes: self.uploaded_bytes(),
            progress_percent: self.progress_percent(),
            digest_progress: self.digest_progress,
            chunk_count: self.plan.chunk_count(),
            completed_chunks: self.completed_chunks.len() as u32,
            bytes_per_second: if transferring { self.speed.bytes_per_second() } else { 0.0 },
            eta_secs: if transferring {
                self.speed.eta(remaining).map(|eta| eta.as_secs())
            } else {
                None
            },
            error: self.error.clone(),
            resumed: self.resumed,
            created_at: self.created_at,
        }
    }
}

/// Read-only view of a task for rendering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub upload_id: String,
    pub file_name: String,
    pub folder_id: String,
    pub status: TaskStatus,
    pub status_label: String,
    pub total_size: u64,
    pub uploaded_bytes: u64,
    pub progress_percent: f64,
    pub digest_progress: u8,
    pub chunk_count: u32,
    pub completed_chunks: u32,
    pub bytes_per_second: f64,
    pub eta_secs: Option<u64>,
    pub error: Option<TaskError>,
    pub resumed: bool,
    pub created_at: DateTime<Utc>,
}
