//! Waits for server-side processing of an uploaded file

use easypan_api::api::UploadApi;
use easypan_api::models::upload::TranscodeStatus;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Final result of a transcode watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscodeOutcome {
    Done,
    Failed(String),
    /// The owning task was removed
    Cancelled,
}

/// Subscribe to the status channel for `file_id` and wait for a terminal
/// status. The subscription is dropped, closing the connection, as soon as
/// this returns.
pub async fn watch_transcode(api: &dyn UploadApi, file_id: &str, cancel: &CancellationToken) -> TranscodeOutcome {
    let mut subscription = tokio::select! {
        result = api.subscribe_transcode_status(file_id) => match result {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(target: "uploader::transcode", file_id = %file_id, error = %e, "Failed to subscribe to transcode status");
                return TranscodeOutcome::Failed(e.to_string());
            }
        },
        _ = cancel.cancelled() => return TranscodeOutcome::Cancelled,
    };

    debug!(target: "uploader::transcode", file_id = %file_id, "Watching transcode status");

    loop {
        let event = tokio::select! {
            event = subscription.next_event() => event,
            _ = cancel.cancelled() => {
                debug!(target: "uploader::transcode", file_id = %file_id, "Transcode watch cancelled");
                return TranscodeOutcome::Cancelled;
            }
        };

        match event {
            Ok(Some(TranscodeStatus::Pending)) => {
                trace!(target: "uploader::transcode", file_id = %file_id, "Transcode pending");
            }
            Ok(Some(TranscodeStatus::Done)) => {
                debug!(target: "uploader::transcode", file_id = %file_id, "Transcode done");
                return TranscodeOutcome::Done;
            }
            Ok(Some(TranscodeStatus::Failed)) => {
                warn!(target: "uploader::transcode", file_id = %file_id, "Server reported transcode failure");
                return TranscodeOutcome::Failed("server reported failure".to_string());
            }
            Ok(None) => {
                warn!(target: "uploader::transcode", file_id = %file_id, "Transcode channel closed early");
                return TranscodeOutcome::Failed("status channel closed before completion".to_string());
            }
            Err(e) => {
                warn!(target: "uploader::transcode", file_id = %file_id, error = %e, "Transcode channel error");
                return TranscodeOutcome::Failed(e.to_string());
            }
        }
    }
}
