//! Sends one chunk with byte-level progress and bounded retry

use crate::uploader::UploaderConfig;
use crate::uploader::chunk::{ChunkInfo, ChunkStream, ReadProgress};
use crate::uploader::error::{UploadError, UploadResult};
use crate::uploader::progress::ChunkObserver;
use easypan_api::api::UploadApi;
use easypan_api::models::upload::{ChunkUpload, ChunkUploadForm, UploadResult as ServerResult, UploadStatus};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Everything needed to send one chunk
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub upload_id: String,
    pub folder_id: String,
    pub file_name: String,
    pub file_md5: String,
    pub chunk: ChunkInfo,
    pub chunk_count: u32,
}

impl ChunkRequest {
    fn form(&self) -> ChunkUploadForm {
        ChunkUploadForm {
            file_id: self.upload_id.clone(),
            file_pid: self.folder_id.clone(),
            file_name: self.file_name.clone(),
            file_md5: self.file_md5.clone(),
            chunk_index: self.chunk.index,
            chunks: self.chunk_count,
        }
    }
}

/// What the server said about an accepted chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// More chunks are needed
    Transferring,
    /// The server assembled the file
    Finished,
    /// The server already had this content
    FastMatched,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkAck {
    pub index: u32,
    /// Upload id revised by the server, if any
    pub upload_id: Option<String>,
    pub outcome: ChunkOutcome,
}

impl ChunkAck {
    fn from_server(index: u32, result: ServerResult) -> Self {
        let outcome = match result.status {
            UploadStatus::Uploading => ChunkOutcome::Transferring,
            UploadStatus::UploadFinish => ChunkOutcome::Finished,
            UploadStatus::UploadSeconds => ChunkOutcome::FastMatched,
            UploadStatus::Unknown => {
                warn!(target: "uploader::transport", chunk = index, "Unknown upload status, treating as in progress");
                ChunkOutcome::Transferring
            }
        };

        Self {
            index,
            upload_id: result.file_id.filter(|id| !id.is_empty()),
            outcome,
        }
    }

    /// No further chunks should be sent for this task
    pub fn ends_transfer(&self) -> bool {
        matches!(self.outcome, ChunkOutcome::Finished | ChunkOutcome::FastMatched)
    }
}

/// Chunk sender with retry
#[derive(Clone)]
pub struct ChunkTransport {
    api: Arc<dyn UploadApi>,
    max_attempts: u32,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
}

impl ChunkTransport {
    pub fn new(api: Arc<dyn UploadApi>, config: &UploaderConfig) -> Self {
        Self {
            api,
            max_attempts: config.max_attempts.max(1),
            retry_base_delay: config.retry_base_delay,
            retry_max_delay: config.retry_max_delay,
        }
    }

    /// Send one chunk, retrying retryable failures up to `max_attempts`
    /// attempts in total. Once `cancel` fires no further attempt starts and
    /// a backoff sleep ends early.
    pub async fn send_chunk(
        &self,
        request: &ChunkRequest,
        source: &Path,
        observer: Arc<dyn ChunkObserver>,
        cancel: &CancellationToken,
    ) -> UploadResult<ChunkAck> {
        let index = request.chunk.index;
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                debug!(target: "uploader::transport", chunk = index, attempt, "Chunk send cancelled");
                return Err(UploadError::Cancelled);
            }

            if let Some(err) = last_error.as_ref() {
                observer.on_retry(index, attempt, self.max_attempts, err);

                let delay = self.calculate_retry_delay(attempt - 1);
                debug!(
                    target: "uploader::transport",
                    chunk = index,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying chunk upload"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return Err(UploadError::Cancelled);
                    }
                }
            }

            match self.send_once(request, source, Arc::clone(&observer)).await {
                Ok(ack) => {
                    debug!(
                        target: "uploader::transport",
                        chunk = index,
                        attempt,
                        outcome = ?ack.outcome,
                        "Chunk uploaded"
                    );
                    return Ok(ack);
                }
                Err(e) => {
                    if !e.is_retryable() || attempt == self.max_attempts {
                        error!(
                            target: "uploader::transport",
                            chunk = index,
                            error = %e,
                            attempt,
                            "Chunk upload failed"
                        );
                        return Err(e);
                    }
                    warn!(
                        target: "uploader::transport",
                        chunk = index,
                        error = %e,
                        attempt,
                        "Chunk upload failed, will retry"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| UploadError::Other(format!("chunk {index} was never attempted"))))
    }

    async fn send_once(
        &self,
        request: &ChunkRequest,
        source: &Path,
        observer: Arc<dyn ChunkObserver>,
    ) -> UploadResult<ChunkAck> {
        let index = request.chunk.index;
        observer.on_progress(index, 0);

        // Fresh stream per attempt so the byte counter restarts
        let on_read: ReadProgress = Arc::new(move |loaded: u64| observer.on_progress(index, loaded));
        let stream = ChunkStream::open(source, &request.chunk, on_read)
            .await
            .map_err(|e| UploadError::FileRead(format!("chunk {index}: {e}")))?;

        let upload = ChunkUpload {
            form: request.form(),
            length: request.chunk.size,
            body: Box::pin(stream),
        };

        let result = self.api.upload_chunk(upload).await?;
        Ok(ChunkAck::from_server(index, result))
    }

    /// `base * 2^(retry - 1)`, capped at the maximum delay
    fn calculate_retry_delay(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }
}
