//! Storage space usage, refreshed while uploads run

use crate::events::{Event, EventBroadcaster};
use crate::uploader::TaskRegistry;
use easypan_api::api::UserApi;
use easypan_api::models::user::UseSpace;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast::error::RecvError, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Keeps the user's space usage current.
///
/// Polls while any upload is active, refreshes once more when the last one
/// settles and after every completed upload.
pub struct SpaceMonitor {
    api: Arc<dyn UserApi>,
    events: EventBroadcaster,
    interval: Duration,
    latest: watch::Sender<Option<UseSpace>>,
}

impl SpaceMonitor {
    pub fn new(api: Arc<dyn UserApi>, events: EventBroadcaster, interval: Duration) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            api,
            events,
            interval: interval.max(Duration::from_millis(1)),
            latest,
        }
    }

    pub fn latest(&self) -> Option<UseSpace> {
        *self.latest.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<UseSpace>> {
        self.latest.subscribe()
    }

    /// Fetch usage now. Failures are logged and leave the last value in place.
    pub async fn refresh(&self) -> Option<UseSpace> {
        match self.api.get_use_space().await {
            Ok(space) => {
                trace!(target: "quota", use_space = space.use_space, total_space = space.total_space, "Space usage refreshed");
                self.latest.send_replace(Some(space));
                self.events.space_usage_updated(space.use_space, space.total_space);
                Some(space)
            }
            Err(e) => {
                warn!(target: "quota", error = %e, "Failed to refresh space usage");
                None
            }
        }
    }

    /// Run against `registry` until `cancel` fires
    pub fn spawn(self: Arc<Self>, registry: &TaskRegistry, cancel: CancellationToken) -> JoinHandle<()> {
        let active = registry.watch_active_count();
        tokio::spawn(async move { self.run(active, cancel).await })
    }

    pub async fn run(self: Arc<Self>, mut active: watch::Receiver<usize>, cancel: CancellationToken) {
        let mut events = self.events.subscribe();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut polling = *active.borrow_and_update() > 0;

        debug!(target: "quota", interval = ?self.interval, polling, "Space monitor started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = active.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let count = *active.borrow_and_update();
                    if count > 0 && !polling {
                        polling = true;
                        ticker.reset();
                    } else if count == 0 && polling {
                        polling = false;
                        self.refresh().await;
                    }
                }
                _ = ticker.tick(), if polling => {
                    self.refresh().await;
                }
                event = events.recv() => match event {
                    Ok(Event::UploadCompleted { .. }) => {
                        self.refresh().await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        trace!(target: "quota", skipped, "Space monitor lagged behind events");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        debug!(target: "quota", "Space monitor stopped");
    }
}
