//! Public entry point: owns every upload task and its runner

use crate::events::{Event, EventBroadcaster};
use crate::uploader::UploaderConfig;
use crate::uploader::error::{UploadError, UploadResult};
use crate::uploader::pipeline::{self, PipelineContext};
use crate::uploader::task::{FileSource, TaskSnapshot, TaskStatus, UploadTask};
use easypan_api::Client;
use easypan_api::api::UploadApi;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info};

/// Result of a bulk operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub succeeded: usize,
    pub total: usize,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.succeeded == self.total
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "succeeded for {} of {}", self.succeeded, self.total)
    }
}

/// Set of concurrent upload tasks.
///
/// Cloning is cheap; clones share the same tasks. Adding, resuming and
/// retrying spawn runners and so must happen inside a tokio runtime.
#[derive(Clone)]
pub struct TaskRegistry {
    ctx: Arc<PipelineContext>,
}

impl TaskRegistry {
    pub fn new(api: Arc<dyn UploadApi>, config: UploaderConfig) -> Self {
        let events = EventBroadcaster::new(config.event_capacity);
        Self {
            ctx: Arc::new(PipelineContext::new(api, config, events)),
        }
    }

    /// Registry backed by the HTTP client
    pub fn from_client(client: Arc<Client>, config: UploaderConfig) -> Self {
        Self::new(client, config)
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.ctx.config
    }

    /// Broadcaster the registry publishes on
    pub fn events(&self) -> EventBroadcaster {
        self.ctx.events.clone()
    }

    /// Queue the file at `path` for upload into `folder_id`
    pub async fn add_file(&self, path: impl Into<PathBuf>, folder_id: &str) -> UploadResult<TaskSnapshot> {
        let source = FileSource::from_path(path).await?;
        Ok(self.add_source(source, folder_id))
    }

    /// Queue an already described source. Zero-byte sources finish
    /// immediately as `EmptyFile` without contacting the server.
    pub fn add_source(&self, source: FileSource, folder_id: &str) -> TaskSnapshot {
        let mut task = UploadTask::new(source, folder_id, self.ctx.config.chunk_size);
        let start = task.status() == TaskStatus::Digesting;
        task.in_flight = start;

        let snapshot = self.ctx.store.insert(task);
        info!(
            target: "uploader::registry",
            task_id = %snapshot.id,
            file_name = %snapshot.file_name,
            size = snapshot.total_size,
            chunks = snapshot.chunk_count,
            "Upload task added"
        );

        if start {
            pipeline::spawn_runner(Arc::clone(&self.ctx), snapshot.id.clone());
        }
        snapshot
    }

    /// Stop launching chunks; sends already dispatched finish. A running
    /// digest is abandoned and recomputed on resume.
    pub fn pause(&self, id: &str) -> UploadResult<TaskSnapshot> {
        let snapshot = self
            .ctx
            .store
            .update(id, |t| match t.status() {
                TaskStatus::Digesting | TaskStatus::Transferring | TaskStatus::Retrying => {
                    t.transition(TaskStatus::Paused)?;
                    t.paused = true;
                    if let Some(token) = t.digest_cancel.take() {
                        token.cancel();
                    }
                    Ok(t.snapshot())
                }
                TaskStatus::Paused => Ok(t.snapshot()),
                status => Err(UploadError::invalid_state("pause", status)),
            })
            .ok_or_else(|| UploadError::TaskNotFound(id.to_string()))??;

        debug!(target: "uploader::registry", task_id = %id, "Task paused");
        Ok(snapshot)
    }

    /// Continue a paused task from its chunk map
    pub fn resume(&self, id: &str) -> UploadResult<TaskSnapshot> {
        self.restart(id, "resume", |t| {
            if t.status() != TaskStatus::Paused {
                return Err(UploadError::invalid_state("resume", t.status()));
            }
            let next = if t.digest.is_some() {
                TaskStatus::Transferring
            } else {
                TaskStatus::Digesting
            };
            t.transition(next)?;
            t.paused = false;
            Ok(())
        })
    }

    /// Retry a failed task from its chunk map
    pub fn retry(&self, id: &str) -> UploadResult<TaskSnapshot> {
        self.restart(id, "retry", |t| {
            if t.status() != TaskStatus::Failed {
                return Err(UploadError::invalid_state("retry", t.status()));
            }
            let next = if t.digest.is_some() {
                TaskStatus::Retrying
            } else {
                TaskStatus::Digesting
            };
            t.transition(next)?;
            t.retry = None;
            Ok(())
        })
    }

    /// Retry every failed task
    pub fn retry_all_failed(&self) -> BatchReport {
        let ids = self.ctx.store.ids_where(|t| t.status() == TaskStatus::Failed);
        let report = BatchReport {
            succeeded: ids.iter().filter(|id| self.retry(id).is_ok()).count(),
            total: ids.len(),
        };
        info!(target: "uploader::registry", report = %report, "Retried failed tasks");
        report
    }

    /// Drop a task, stopping its digest worker and transcode watch
    pub fn remove(&self, id: &str) -> UploadResult<TaskSnapshot> {
        let task = self
            .ctx
            .store
            .remove(id)
            .ok_or_else(|| UploadError::TaskNotFound(id.to_string()))?;
        task.cancel.cancel();

        debug!(target: "uploader::registry", task_id = %id, status = %task.status(), "Task removed");
        Ok(task.snapshot())
    }

    /// Remove every task whose transfer succeeded
    pub fn clear_completed(&self) -> BatchReport {
        let ids = self.ctx.store.ids_where(|t| t.status().is_completed());
        let report = BatchReport {
            succeeded: ids.iter().filter(|id| self.remove(id).is_ok()).count(),
            total: ids.len(),
        };
        info!(target: "uploader::registry", report = %report, "Cleared completed tasks");
        report
    }

    pub fn snapshot(&self, id: &str) -> Option<TaskSnapshot> {
        self.ctx.store.snapshot(id)
    }

    /// All tasks in the order they were added
    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        self.ctx.store.snapshots()
    }

    /// Tasks neither finished, failed nor paused
    pub fn active_task_count(&self) -> usize {
        self.ctx.store.active_count()
    }

    pub fn watch_active_count(&self) -> watch::Receiver<usize> {
        self.ctx.store.watch_active_count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.ctx.events.subscribe()
    }

    /// Snapshots of added and updated tasks, as they happen
    pub fn snapshot_stream(&self) -> impl Stream<Item = TaskSnapshot> + Send + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(|event| async move {
            match event {
                Ok(Event::TaskAdded { snapshot }) | Ok(Event::TaskUpdated { snapshot }) => Some(snapshot),
                Ok(_) => None,
                Err(e) => {
                    tracing::trace!(target: "uploader::registry", error = %e, "Snapshot stream lagged");
                    None
                }
            }
        })
    }

    /// Apply `f` and, unless a runner still owns the task, start one
    fn restart(
        &self,
        id: &str,
        action: &'static str,
        f: impl FnOnce(&mut UploadTask) -> UploadResult<()>,
    ) -> UploadResult<TaskSnapshot> {
        let (snapshot, spawn) = self
            .ctx
            .store
            .update(id, |t| {
                f(t)?;
                let spawn = !t.in_flight;
                t.in_flight = true;
                Ok::<_, UploadError>((t.snapshot(), spawn))
            })
            .ok_or_else(|| UploadError::TaskNotFound(id.to_string()))??;

        debug!(target: "uploader::registry", task_id = %id, action, spawn, "Task restarted");
        if spawn {
            pipeline::spawn_runner(Arc::clone(&self.ctx), id.to_string());
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::error::ErrorKind;
    use crate::uploader::test_support::*;
    use easypan_api::ApiError;
    use easypan_api::models::upload::{TranscodeStatus, UploadStatus};
    use std::time::Duration;

    fn registry(api: &Arc<MockApi>, chunk_size: u64) -> TaskRegistry {
        TaskRegistry::new(api.clone(), test_config(chunk_size))
    }

    #[tokio::test]
    async fn zero_byte_file_is_empty_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(MockApi::new());
        let registry = registry(&api, 10);

        let path = write_source(&dir, "empty.txt", 0);
        let snapshot = registry.add_file(path, "0").await.unwrap();

        assert_eq!(snapshot.status, TaskStatus::EmptyFile);
        assert_eq!(registry.active_task_count(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(api.probe_calls(), 0);
        assert!(api.sent().is_empty());
        assert!(api.transcode_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn three_chunks_go_in_three_sequential_phases() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(MockApi::new().with_delay(Duration::from_millis(10)));
        let registry = registry(&api, 10);
        let mut events = registry.subscribe();

        let path = write_source(&dir, "clip.mp4", 25);
        let added = registry.add_file(path, "folder-1").await.unwrap();
        assert_eq!(added.chunk_count, 3);

        let done = wait_for(&registry, &added.id, |s| s.status == TaskStatus::TranscodeDone).await;
        assert_eq!(done.uploaded_bytes, 25);
        assert_eq!(done.progress_percent, 100.0);
        assert_eq!(done.status_label, "done");

        use MockEvent::*;
        assert_eq!(api.log(), vec![Start(0), End(0), Start(1), End(1), Start(2), End(2)]);
        assert_eq!(api.sent_bytes(2), vec![5]);
        assert!(api.sent().iter().all(|c| c.folder_id == "folder-1"));
        assert_eq!(api.transcode_subscriptions(), vec![added.upload_id.clone()]);

        let mut completed = false;
        while let Ok(event) = events.try_recv() {
            if let Event::UploadCompleted { task_id, .. } = event {
                completed = task_id == added.id;
            }
        }
        assert!(completed);
    }

    #[tokio::test]
    async fn fast_match_on_first_chunk_skips_everything() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(MockApi::new().with_replies(
            0,
            vec![Reply::Status(UploadStatus::UploadSeconds, Some("ServerId0001".to_string()))],
        ));
        let registry = registry(&api, 10);

        let added = registry.add_file(write_source(&dir, "known.iso", 50), "0").await.unwrap();
        let done = wait_for(&registry, &added.id, |s| s.status.is_terminal()).await;

        assert_eq!(done.status, TaskStatus::FastMatched);
        assert_eq!(done.status_label, "fast upload");
        assert_eq!(done.upload_id, "ServerId0001");
        assert_eq!(done.uploaded_bytes, 50);
        assert_eq!(done.progress_percent, 100.0);
        assert_eq!(done.completed_chunks, 5);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(api.sent_indices(), vec![0]);
        assert!(api.transcode_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn fast_match_mid_window_stops_sibling_retries() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(
            MockApi::new()
                .with_replies(1, vec![Reply::Status(UploadStatus::UploadSeconds, None)])
                .with_replies(2, vec![
                    Reply::Error(ApiError::Http("reset 2".to_string())),
                    Reply::Error(ApiError::Http("reset 2".to_string())),
                ])
                .with_replies(3, vec![
                    Reply::Error(ApiError::Http("reset 3".to_string())),
                    Reply::Error(ApiError::Http("reset 3".to_string())),
                ]),
        );
        let config = UploaderConfig {
            retry_base_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_millis(100),
            ..test_config(10)
        };
        let registry = TaskRegistry::new(api.clone(), config);

        let added = registry.add_file(write_source(&dir, "six.bin", 60), "0").await.unwrap();
        let done = wait_for(&registry, &added.id, |s| s.status.is_terminal()).await;
        assert_eq!(done.status, TaskStatus::FastMatched);

        // Long enough for any surviving backoff to have fired twice
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(api.send_count(1), 1);
        assert!(api.send_count(2) <= 1);
        assert!(api.send_count(3) <= 1);
        assert_eq!(api.send_count(4), 0);
        assert_eq!(api.send_count(5), 0);

        let settled = registry.snapshot(&added.id).unwrap();
        assert_eq!(settled.status, TaskStatus::FastMatched);
        assert_eq!(settled.status_label, "fast upload");
        assert!(settled.error.is_none());
        assert_eq!(settled.uploaded_bytes, 60);
        assert_eq!(settled.progress_percent, 100.0);
        assert!(api.transcode_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn revised_upload_id_is_used_by_later_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(MockApi::new().with_replies(
            0,
            vec![Reply::Status(UploadStatus::Uploading, Some("Revised00001".to_string()))],
        ));
        let registry = registry(&api, 10);

        let added = registry.add_file(write_source(&dir, "doc.pdf", 45), "0").await.unwrap();
        wait_for(&registry, &added.id, |s| s.status == TaskStatus::TranscodeDone).await;

        let sent = api.sent();
        assert_eq!(sent[0].file_id, added.upload_id);
        assert!(sent[1..].iter().all(|c| c.file_id == "Revised00001"));
        assert_eq!(api.transcode_subscriptions(), vec!["Revised00001".to_string()]);
    }

    #[tokio::test]
    async fn resume_skips_chunks_the_server_has() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(MockApi::new().with_resume(vec![0, 2, 9]));
        let registry = registry(&api, 10);

        let added = registry.add_file(write_source(&dir, "big.bin", 40), "0").await.unwrap();
        let done = wait_for(&registry, &added.id, |s| s.status == TaskStatus::TranscodeDone).await;

        assert!(done.resumed);
        let mut sent = api.sent_indices();
        sent.sort();
        assert_eq!(sent, vec![1, 3]);
        assert_eq!(api.probe_calls(), 1);
    }

    #[tokio::test]
    async fn fully_uploaded_file_sends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(MockApi::new().with_resume(vec![0, 1, 2]));
        let registry = registry(&api, 10);

        let added = registry.add_file(write_source(&dir, "big.bin", 30), "0").await.unwrap();
        let done = wait_for(&registry, &added.id, |s| s.status == TaskStatus::TranscodeDone).await;

        assert_eq!(done.uploaded_bytes, 30);
        assert!(api.sent().is_empty());
        assert_eq!(api.transcode_subscriptions(), vec![added.upload_id]);
    }

    #[tokio::test]
    async fn network_failures_fail_task_then_retry_resumes_at_same_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(MockApi::new().with_replies(
            1,
            vec![
                Reply::Error(ApiError::Http("reset 1".to_string())),
                Reply::Error(ApiError::Http("reset 2".to_string())),
                Reply::Error(ApiError::Http("reset 3".to_string())),
            ],
        ));
        let registry = registry(&api, 10);
        let mut events = registry.subscribe();

        let added = registry.add_file(write_source(&dir, "movie.mkv", 25), "0").await.unwrap();
        let failed = wait_for(&registry, &added.id, |s| s.status == TaskStatus::Failed).await;

        let error = failed.error.clone().unwrap();
        assert_eq!(error.kind, ErrorKind::Network);
        assert!(error.message.contains("reset 3"));
        assert_eq!(failed.status_label, "network error");
        assert_eq!(failed.completed_chunks, 1);
        assert_eq!(api.send_count(0), 1);
        assert_eq!(api.send_count(1), 3);
        assert_eq!(registry.active_task_count(), 0);

        let mut labels = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let Event::TaskUpdated { snapshot } = event {
                labels.push(snapshot.status_label);
            }
        }
        assert!(labels.contains(&"retrying (2/3)".to_string()));
        assert!(labels.contains(&"retrying (3/3)".to_string()));

        let report = registry.retry_all_failed();
        assert_eq!(report, BatchReport { succeeded: 1, total: 1 });
        assert_eq!(report.to_string(), "succeeded for 1 of 1");

        wait_for(&registry, &added.id, |s| s.status == TaskStatus::TranscodeDone).await;
        assert_eq!(api.send_count(0), 1);
        assert_eq!(api.send_count(1), 4);
        assert_eq!(api.send_count(2), 1);
    }

    #[tokio::test]
    async fn auth_error_fails_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(MockApi::new().with_replies(
            0,
            vec![Reply::Error(ApiError::Unauthorized("登录超时".to_string()))],
        ));
        let registry = registry(&api, 10);

        let added = registry.add_file(write_source(&dir, "a.bin", 25), "0").await.unwrap();
        let failed = wait_for(&registry, &added.id, |s| s.status == TaskStatus::Failed).await;

        assert_eq!(failed.error.unwrap().kind, ErrorKind::Auth);
        assert_eq!(failed.status_label, "login required");
        assert_eq!(api.send_count(0), 1);
    }

    #[tokio::test]
    async fn pause_mid_window_then_resume_sends_only_incomplete_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(
            MockApi::new()
                .with_delay(Duration::from_millis(30))
                .with_hold(1),
        );
        let registry = registry(&api, 10);

        let added = registry.add_file(write_source(&dir, "six.bin", 60), "0").await.unwrap();
        api.wait_reached().await;

        let paused = registry.pause(&added.id).unwrap();
        assert_eq!(paused.status, TaskStatus::Paused);
        api.release();

        let settled = wait_for(&registry, &added.id, |s| s.completed_chunks == 4).await;
        assert_eq!(settled.status_label, "paused");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut before = api.sent_indices();
        before.sort();
        assert_eq!(before, vec![0, 1, 2, 3]);
        assert_eq!(registry.active_task_count(), 0);

        registry.resume(&added.id).unwrap();
        wait_for(&registry, &added.id, |s| s.status == TaskStatus::TranscodeDone).await;

        let mut after = api.sent_indices();
        after.sort();
        assert_eq!(after, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn pause_right_after_add_is_resumable() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(MockApi::new().with_delay(Duration::from_millis(5)));
        let registry = registry(&api, 10);

        let added = registry.add_file(write_source(&dir, "early.bin", 35), "0").await.unwrap();
        registry.pause(&added.id).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.snapshot(&added.id).unwrap().status, TaskStatus::Paused);

        registry.resume(&added.id).unwrap();
        wait_for(&registry, &added.id, |s| s.status == TaskStatus::TranscodeDone).await;

        let mut sent = api.sent_indices();
        sent.sort();
        assert_eq!(sent, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn per_task_cap_is_independent_across_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(MockApi::new().with_delay(Duration::from_millis(30)));
        let registry = registry(&api, 10);

        let a = registry.add_file(write_source(&dir, "a.bin", 80), "0").await.unwrap();
        let b = registry.add_file(write_source(&dir, "b.bin", 80), "0").await.unwrap();
        wait_for(&registry, &a.id, |s| s.status == TaskStatus::TranscodeDone).await;
        wait_for(&registry, &b.id, |s| s.status == TaskStatus::TranscodeDone).await;

        assert_eq!(api.sent().iter().filter(|c| c.file_name == "a.bin").count(), 8);
        assert_eq!(api.max_in_flight("a.bin"), 3);
        assert_eq!(api.max_in_flight("b.bin"), 3);
        assert!(api.global_max_in_flight() > 3);
    }

    #[tokio::test]
    async fn remove_detaches_transcode_watch() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(MockApi::new().with_transcode(TranscodeScript::Pending));
        let registry = registry(&api, 10);
        let mut active = registry.watch_active_count();

        let added = registry.add_file(write_source(&dir, "slow.mov", 15), "0").await.unwrap();
        wait_for(&registry, &added.id, |s| s.status == TaskStatus::Transcoding).await;
        assert_eq!(*active.borrow_and_update(), 1);

        let removed = registry.remove(&added.id).unwrap();
        assert_eq!(removed.status, TaskStatus::Transcoding);
        assert!(registry.snapshot(&added.id).is_none());
        assert_eq!(*active.borrow_and_update(), 0);
        assert!(matches!(registry.remove(&added.id), Err(UploadError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn remove_while_digesting_sends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(MockApi::new());
        // One-byte windows keep the digest busy
        let registry = registry(&api, 1);
        let mut active = registry.watch_active_count();

        let added = registry.add_file(write_source(&dir, "long.bin", 100_000), "0").await.unwrap();
        let digesting = wait_for(&registry, &added.id, |s| s.digest_progress > 0).await;
        assert_eq!(digesting.status, TaskStatus::Digesting);

        let removed = registry.remove(&added.id).unwrap();
        assert_eq!(removed.status, TaskStatus::Digesting);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(registry.snapshot(&added.id).is_none());
        assert_eq!(*active.borrow_and_update(), 0);
        assert_eq!(api.probe_calls(), 0);
        assert!(api.sent().is_empty());
        assert!(api.transcode_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn transcode_failure_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(
            MockApi::new().with_transcode(TranscodeScript::Events(vec![TranscodeStatus::Failed])),
        );
        let registry = registry(&api, 10);

        let added = registry.add_file(write_source(&dir, "broken.avi", 15), "0").await.unwrap();
        let done = wait_for(&registry, &added.id, |s| s.status.is_terminal()).await;

        assert_eq!(done.status, TaskStatus::TranscodeFailed);
        assert_eq!(done.error.unwrap().kind, ErrorKind::Transcode);
        assert!(matches!(registry.retry(&added.id), Err(UploadError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn unreadable_source_fails_digest() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(MockApi::new());
        let registry = registry(&api, 10);

        let source = FileSource::new(dir.path().join("vanished.bin"), "vanished.bin", 20);
        let added = registry.add_source(source, "0");
        let failed = wait_for(&registry, &added.id, |s| s.status == TaskStatus::Failed).await;

        assert_eq!(failed.error.unwrap().kind, ErrorKind::Digest);
        assert_eq!(failed.status_label, "digest failed");
        assert_eq!(api.probe_calls(), 0);
        assert!(matches!(registry.pause(&added.id), Err(UploadError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn clear_completed_keeps_failed_and_empty_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(MockApi::new().with_replies_for(
            "bad.bin",
            0,
            vec![Reply::Error(ApiError::Unauthorized("login required".to_string()))],
        ));
        let registry = registry(&api, 10);

        let done = registry.add_file(write_source(&dir, "done.bin", 5), "0").await.unwrap();
        registry.add_file(write_source(&dir, "empty.bin", 0), "0").await.unwrap();
        let bad = registry.add_file(write_source(&dir, "bad.bin", 5), "0").await.unwrap();
        wait_for(&registry, &done.id, |s| s.status == TaskStatus::TranscodeDone).await;
        wait_for(&registry, &bad.id, |s| s.status == TaskStatus::Failed).await;

        assert_eq!(registry.clear_completed(), BatchReport { succeeded: 1, total: 1 });
        let left: Vec<String> = registry.snapshots().into_iter().map(|s| s.file_name).collect();
        assert_eq!(left, vec!["empty.bin".to_string(), "bad.bin".to_string()]);
        assert_eq!(registry.retry_all_failed().total, 1);
    }

    #[tokio::test]
    async fn snapshot_stream_follows_progress() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(MockApi::new());
        let registry = registry(&api, 10);
        let stream = registry.snapshot_stream();
        tokio::pin!(stream);

        let added = registry.add_file(write_source(&dir, "s.bin", 15), "0").await.unwrap();
        let first = stream.next().await.unwrap();
        assert_eq!(first.id, added.id);

        loop {
            let snapshot = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .unwrap()
                .unwrap();
            assert!(snapshot.uploaded_bytes <= snapshot.total_size);
            if snapshot.status == TaskStatus::TranscodeDone {
                break;
            }
        }
    }
}
