//! Background MD5 computation over a file, window by window

use crate::uploader::error::{UploadError, UploadResult};
use md5::{Digest, Md5};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Messages emitted by a digest worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DigestEvent {
    /// Percent of the file absorbed so far
    Progress(u8),
    /// Lower-case hex digest of the whole file
    Done(String),
    /// The file could not be read
    Failed(String),
    /// The worker stopped because its token was cancelled
    Cancelled,
}

/// Handle to a digest computation running on the blocking pool.
///
/// Dropping the handle stops the worker at its next window boundary.
pub struct DigestWorker {
    events: mpsc::Receiver<DigestEvent>,
}

impl DigestWorker {
    /// Start hashing `path` in windows of `window_size` bytes
    pub fn spawn(path: PathBuf, window_size: u64, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(16);

        tokio::task::spawn_blocking(move || {
            let event = match hash_file(&path, window_size.max(1), &cancel, &tx) {
                Ok(Some(digest)) => DigestEvent::Done(digest),
                Ok(None) => DigestEvent::Cancelled,
                Err(e) => {
                    tracing::warn!(target: "uploader::digest", path = %path.display(), error = %e, "Digest failed");
                    DigestEvent::Failed(e.to_string())
                }
            };
            let _ = tx.blocking_send(event);
        });

        Self { events: rx }
    }

    /// Next event, or `None` once the worker has exited
    pub async fn recv(&mut self) -> Option<DigestEvent> {
        self.events.recv().await
    }

    /// Drive the worker to completion, forwarding progress
    pub async fn finish(mut self, mut on_progress: impl FnMut(u8)) -> UploadResult<String> {
        while let Some(event) = self.recv().await {
            match event {
                DigestEvent::Progress(percent) => on_progress(percent),
                DigestEvent::Done(digest) => return Ok(digest),
                DigestEvent::Failed(message) => return Err(UploadError::Digest(message)),
                DigestEvent::Cancelled => return Err(UploadError::Cancelled),
            }
        }
        Err(UploadError::Cancelled)
    }
}

/// Returns `Ok(None)` when cancelled or when nobody is listening any more
fn hash_file(
    path: &Path,
    window_size: u64,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<DigestEvent>,
) -> io::Result<Option<String>> {
    let mut file = File::open(path)?;
    let total = file.metadata()?.len();
    let windows = total.div_ceil(window_size).max(1);

    tracing::debug!(target: "uploader::digest", path = %path.display(), total, windows, "Computing digest");

    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; window_size.min(total.max(1)) as usize];

    for window in 0..windows {
        if cancel.is_cancelled() {
            tracing::debug!(target: "uploader::digest", path = %path.display(), window, "Digest cancelled");
            return Ok(None);
        }

        let expected = (total - window * window_size).min(window_size) as usize;
        file.read_exact(&mut buffer[..expected])?;
        hasher.update(&buffer[..expected]);

        let percent = ((window + 1) * 100 / windows) as u8;
        if tx.blocking_send(DigestEvent::Progress(percent)).is_err() {
            return Ok(None);
        }
    }

    Ok(Some(format!("{:x}", hasher.finalize())))
}
