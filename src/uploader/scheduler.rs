//! Bounded sliding window of concurrent chunk sends

use crate::uploader::error::UploadError;
use crate::uploader::transport::{ChunkAck, ChunkOutcome};
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// How a window ended
#[derive(Debug)]
pub enum WindowOutcome {
    /// Every index was sent and acknowledged
    Completed,
    /// A chunk reported `Finished` or `FastMatched`; nothing more is needed
    ShortCircuit(ChunkAck),
    /// The gate closed (pause, removal) before every index was launched
    Stopped,
    /// A chunk exhausted its attempts
    Failed { index: u32, error: UploadError },
}

/// Send `indices` with at most `cap` in flight.
///
/// A new index is launched only while `gate` returns true. On a short
/// circuit `window` is cancelled and the remaining in-flight sends are
/// detached to wind down; on failure or a closed gate they are drained
/// before returning. Launched sends must observe `window`.
pub async fn run_window<L, Fut, G>(
    indices: Vec<u32>,
    cap: usize,
    mut launch: L,
    gate: G,
    window: &CancellationToken,
) -> WindowOutcome
where
    L: FnMut(u32) -> Fut,
    Fut: Future<Output = (u32, Result<ChunkAck, UploadError>)> + Send + 'static,
    G: Fn() -> bool,
{
    let cap = cap.max(1);
    let mut pending = indices.into_iter();
    let mut in_flight = FuturesUnordered::new();
    let mut stopped = false;
    let mut failure: Option<(u32, UploadError)> = None;

    while in_flight.len() < cap {
        if !gate() {
            stopped = true;
            break;
        }
        match pending.next() {
            Some(index) => in_flight.push(launch(index)),
            None => break,
        }
    }

    while let Some((index, result)) = in_flight.next().await {
        match result {
            Ok(ack) if ack.outcome != ChunkOutcome::Transferring => {
                debug!(
                    target: "uploader::scheduler",
                    chunk = index,
                    outcome = ?ack.outcome,
                    detached = in_flight.len(),
                    "Window short-circuited"
                );
                window.cancel();
                if !in_flight.is_empty() {
                    tokio::spawn(async move {
                        while let Some((index, result)) = in_flight.next().await {
                            trace!(target: "uploader::scheduler", chunk = index, ok = result.is_ok(), "Detached send finished");
                        }
                    });
                }
                return WindowOutcome::ShortCircuit(ack);
            }
            Ok(_) => {}
            Err(error) => {
                if failure.is_none() {
                    failure = Some((index, error));
                }
            }
        }

        if failure.is_some() || stopped {
            continue;
        }
        if !gate() {
            stopped = true;
            continue;
        }
        if let Some(next) = pending.next() {
            in_flight.push(launch(next));
        }
    }

    if let Some((index, error)) = failure {
        return WindowOutcome::Failed { index, error };
    }
    if stopped && pending.len() > 0 {
        return WindowOutcome::Stopped;
    }
    WindowOutcome::Completed
}
