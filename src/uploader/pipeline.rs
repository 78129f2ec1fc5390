//! Drives one task from digest through transfer to transcode

use crate::events::EventBroadcaster;
use crate::uploader::UploaderConfig;
use crate::uploader::digest::DigestWorker;
use crate::uploader::error::{TaskError, UploadError, UploadResult};
use crate::uploader::probe::ResumeProbe;
use crate::uploader::progress::ChunkObserver;
use crate::uploader::scheduler::{self, WindowOutcome};
use crate::uploader::store::TaskStore;
use crate::uploader::task::{RetryState, TaskId, TaskStatus};
use crate::uploader::transcode::{TranscodeOutcome, watch_transcode};
use crate::uploader::transport::{ChunkAck, ChunkOutcome, ChunkRequest, ChunkTransport};
use easypan_api::api::UploadApi;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared collaborators of every task runner
pub(crate) struct PipelineContext {
    pub store: Arc<TaskStore>,
    pub api: Arc<dyn UploadApi>,
    pub transport: ChunkTransport,
    pub probe: ResumeProbe,
    pub config: UploaderConfig,
    pub events: EventBroadcaster,
}

impl PipelineContext {
    pub fn new(api: Arc<dyn UploadApi>, config: UploaderConfig, events: EventBroadcaster) -> Self {
        Self {
            store: Arc::new(TaskStore::new(events.clone())),
            transport: ChunkTransport::new(Arc::clone(&api), &config),
            probe: ResumeProbe::new(Arc::clone(&api)),
            api,
            config,
            events,
        }
    }
}

/// Why a run of the pipeline ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOutcome {
    Paused,
    Failed,
    /// Reached a terminal status
    Completed,
    Removed,
}

/// Start a runner for a task whose `in_flight` flag the caller has just set
pub(crate) fn spawn_runner(ctx: Arc<PipelineContext>, id: TaskId) -> JoinHandle<()> {
    tokio::spawn(async move { run(ctx, id).await })
}

async fn run(ctx: Arc<PipelineContext>, id: TaskId) {
    loop {
        let outcome = drive(&ctx, &id).await;
        debug!(target: "uploader::pipeline", task_id = %id, outcome = ?outcome, "Run ended");

        // A resume or retry that arrived while this run was winding down
        // found `in_flight` set and left the work to us
        let again = ctx
            .store
            .update(&id, |t| {
                let restarted = matches!(outcome, RunOutcome::Paused | RunOutcome::Failed)
                    && !t.paused
                    && matches!(
                        t.status(),
                        TaskStatus::Digesting | TaskStatus::Transferring | TaskStatus::Retrying
                    );
                if !restarted {
                    t.in_flight = false;
                }
                restarted
            })
            .unwrap_or(false);

        if !again {
            break;
        }
    }
}

async fn drive(ctx: &Arc<PipelineContext>, id: &str) -> RunOutcome {
    let Some(needs_digest) = ctx.store.read(id, |t| t.digest.is_none()) else {
        return RunOutcome::Removed;
    };
    if needs_digest {
        if let Err(outcome) = compute_digest(ctx, id).await {
            return outcome;
        }
    }

    if let Err(outcome) = probe_once(ctx, id).await {
        return outcome;
    }

    let entered = ctx.store.update(id, |t| {
        if t.paused {
            return Err(RunOutcome::Paused);
        }
        t.transition(TaskStatus::Transferring).map_err(|e| {
            warn!(target: "uploader::pipeline", task_id = %t.id, error = %e, "Cannot start transfer");
            RunOutcome::Failed
        })
    });
    match entered {
        None => return RunOutcome::Removed,
        Some(Err(outcome)) => return outcome,
        Some(Ok(())) => {}
    }

    let Some((plan, cancel)) = ctx.store.read(id, |t| (*t.plan(), t.cancel.clone())) else {
        return RunOutcome::Removed;
    };

    for phase in plan.phases() {
        let Some(pending) = ctx.store.read(id, |t| t.pending_in(phase.clone())) else {
            return RunOutcome::Removed;
        };
        if pending.is_empty() {
            continue;
        }

        debug!(
            target: "uploader::pipeline",
            task_id = %id,
            from = phase.start(),
            to = phase.end(),
            pending = pending.len(),
            "Sending chunk phase"
        );

        // Cancelled once a chunk ends the transfer, so sibling sends stop retrying
        let window = cancel.child_token();
        let task_id = id.to_string();
        let launch_ctx = Arc::clone(ctx);
        let launch_window = window.clone();
        let outcome = scheduler::run_window(
            pending,
            ctx.config.max_concurrent_chunks,
            move |index| launch_chunk(Arc::clone(&launch_ctx), task_id.clone(), index, launch_window.clone()),
            || {
                ctx.store
                    .read(id, |t| !t.paused && t.status() != TaskStatus::Failed)
                    .unwrap_or(false)
            },
            &window,
        )
        .await;

        match outcome {
            WindowOutcome::Completed => {}
            WindowOutcome::ShortCircuit(ack) => return finish_transfer(ctx, id, ack.outcome).await,
            // The run loop restarts if a resume slipped in since the gate closed
            WindowOutcome::Stopped => {
                return match ctx.store.read(id, |t| t.paused) {
                    Some(_) => RunOutcome::Paused,
                    None => RunOutcome::Removed,
                };
            }
            WindowOutcome::Failed { index, error } => {
                warn!(target: "uploader::pipeline", task_id = %id, chunk = index, error = %error, "Transfer failed");
                return match ctx.store.update(id, |t| {
                    t.paused = false;
                    t.fail(&error)
                }) {
                    Some(_) => RunOutcome::Failed,
                    None => RunOutcome::Removed,
                };
            }
        }
    }

    // Every chunk was already on the server
    finish_transfer(ctx, id, ChunkOutcome::Finished).await
}

async fn compute_digest(ctx: &Arc<PipelineContext>, id: &str) -> Result<(), RunOutcome> {
    let Some((path, cancel)) = ctx.store.update(id, |t| {
        let token = t.cancel.child_token();
        t.digest_cancel = Some(token.clone());
        t.digest_progress = 0;
        (t.source.path.clone(), token)
    }) else {
        return Err(RunOutcome::Removed);
    };

    let worker = DigestWorker::spawn(path, ctx.config.chunk_size, cancel);
    let result = worker
        .finish(|percent| {
            ctx.store.update(id, |t| t.digest_progress = percent);
        })
        .await;

    match result {
        Ok(digest) => {
            debug!(target: "uploader::pipeline", task_id = %id, digest = %digest, "Digest computed");
            match ctx.store.update(id, |t| {
                t.digest_cancel = None;
                t.digest = Some(digest);
                t.probed = false;
                t.paused
            }) {
                None => Err(RunOutcome::Removed),
                Some(true) => Err(RunOutcome::Paused),
                Some(false) => Ok(()),
            }
        }
        Err(UploadError::Cancelled) => match ctx.store.update(id, |t| t.digest_cancel = None) {
            Some(()) => Err(RunOutcome::Paused),
            None => Err(RunOutcome::Removed),
        },
        Err(e) => {
            ctx.store.update(id, |t| {
                t.digest_cancel = None;
                t.paused = false;
                t.fail(&e)
            });
            Err(RunOutcome::Failed)
        }
    }
}

async fn probe_once(ctx: &Arc<PipelineContext>, id: &str) -> Result<(), RunOutcome> {
    let Some((probed, upload_id, folder_id, plan)) =
        ctx.store.read(id, |t| (t.probed, t.upload_id.clone(), t.folder_id.clone(), *t.plan()))
    else {
        return Err(RunOutcome::Removed);
    };
    if probed {
        return Ok(());
    }

    let set = ctx.probe.probe(&upload_id, &folder_id, &plan).await;
    if !set.is_empty() {
        info!(
            target: "uploader::pipeline",
            task_id = %id,
            held = set.len(),
            chunk_count = plan.chunk_count(),
            "Resuming partial upload"
        );
    }

    ctx.store
        .update(id, |t| t.apply_resume_set(&set))
        .ok_or(RunOutcome::Removed)
}

/// Send one chunk and record the acknowledgement in the task
fn launch_chunk(
    ctx: Arc<PipelineContext>,
    id: TaskId,
    index: u32,
    cancel: CancellationToken,
) -> impl Future<Output = (u32, UploadResult<ChunkAck>)> + Send + 'static {
    async move {
        // Read at launch so a revised upload id applies to every later send
        let Some((request, path)) = ctx.store.read(&id, |t| {
            let request = ChunkRequest {
                upload_id: t.upload_id.clone(),
                folder_id: t.folder_id.clone(),
                file_name: t.source.name.clone(),
                file_md5: t.digest.clone().unwrap_or_default(),
                chunk: t.plan().chunk(index),
                chunk_count: t.plan().chunk_count(),
            };
            (request, t.source.path.clone())
        }) else {
            return (index, Err(UploadError::Cancelled));
        };

        let observer: Arc<dyn ChunkObserver> = Arc::new(TaskObserver {
            store: Arc::clone(&ctx.store),
            id: id.clone(),
        });
        let result = ctx.transport.send_chunk(&request, &path, observer, &cancel).await;

        if let Ok(ack) = &result {
            ctx.store.update(&id, |t| {
                // A sibling already ended the transfer
                if !t.status().accepts_chunk_updates() {
                    return;
                }
                t.complete_chunk(ack.index);
                t.apply_upload_id(ack.upload_id.as_deref());
                if t.retry.map(|retry| retry.chunk_index) == Some(ack.index) {
                    t.retry = None;
                    if t.status() == TaskStatus::Retrying {
                        let _ = t.transition(TaskStatus::Transferring);
                    }
                }
            });
        }

        (index, result)
    }
}

async fn finish_transfer(ctx: &Arc<PipelineContext>, id: &str, outcome: ChunkOutcome) -> RunOutcome {
    if outcome == ChunkOutcome::FastMatched {
        let matched = ctx.store.update(id, |t| -> UploadResult<(String, String)> {
            t.paused = false;
            t.retry = None;
            t.error = None;
            t.transition(TaskStatus::FastMatched)?;
            t.mark_transferred();
            Ok((t.source.name.clone(), t.folder_id.clone()))
        });
        return match matched {
            None => RunOutcome::Removed,
            Some(Err(e)) => {
                warn!(target: "uploader::pipeline", task_id = %id, error = %e, "Cannot complete fast upload");
                RunOutcome::Failed
            }
            Some(Ok((file_name, folder_id))) => {
                info!(target: "uploader::pipeline", task_id = %id, file_name = %file_name, "Fast upload matched");
                ctx.events.upload_completed(id.to_string(), file_name, folder_id);
                RunOutcome::Completed
            }
        };
    }

    let finished = ctx.store.update(id, |t| -> UploadResult<()> {
        t.paused = false;
        t.retry = None;
        t.error = None;
        t.transition(TaskStatus::FinishedTransfer)?;
        t.mark_transferred();
        Ok(())
    });
    match finished {
        None => return RunOutcome::Removed,
        Some(Err(e)) => {
            warn!(target: "uploader::pipeline", task_id = %id, error = %e, "Cannot finish transfer");
            return RunOutcome::Failed;
        }
        Some(Ok(())) => {}
    }

    let Some(Ok((upload_id, cancel))) = ctx.store.update(id, |t| {
        t.transition(TaskStatus::Transcoding)
            .map(|_| (t.upload_id.clone(), t.cancel.clone()))
    }) else {
        return RunOutcome::Removed;
    };

    info!(target: "uploader::pipeline", task_id = %id, upload_id = %upload_id, "Transfer finished, waiting for transcode");

    match watch_transcode(ctx.api.as_ref(), &upload_id, &cancel).await {
        TranscodeOutcome::Done => {
            let Some(Ok((file_name, folder_id))) = ctx.store.update(id, |t| {
                t.transition(TaskStatus::TranscodeDone)
                    .map(|_| (t.source.name.clone(), t.folder_id.clone()))
            }) else {
                return RunOutcome::Removed;
            };
            ctx.events.upload_completed(id.to_string(), file_name, folder_id);
            RunOutcome::Completed
        }
        TranscodeOutcome::Failed(message) => {
            let error = UploadError::Transcode(message);
            ctx.store.update(id, |t| {
                t.error = Some(TaskError::from(&error));
                t.transition(TaskStatus::TranscodeFailed)
            });
            RunOutcome::Completed
        }
        TranscodeOutcome::Cancelled => RunOutcome::Removed,
    }
}

/// Routes transport progress into the store
struct TaskObserver {
    store: Arc<TaskStore>,
    id: TaskId,
}

impl ChunkObserver for TaskObserver {
    fn on_progress(&self, chunk_index: u32, loaded: u64) {
        self.store.update(&self.id, |t| {
            if t.status().accepts_chunk_updates() {
                t.set_chunk_loaded(chunk_index, loaded);
            }
        });
    }

    fn on_retry(&self, chunk_index: u32, attempt: u32, max_attempts: u32, error: &UploadError) {
        self.store.update(&self.id, |t| {
            if !t.status().accepts_chunk_updates() {
                return;
            }
            t.retry = Some(RetryState {
                chunk_index,
                attempt,
                max_attempts,
            });
            t.error = Some(TaskError::from(error));
            if !t.paused {
                let _ = t.transition(TaskStatus::Retrying);
            }
        });
    }
}
