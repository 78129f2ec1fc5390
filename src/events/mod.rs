use crate::uploader::task::{TaskId, TaskSnapshot};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing;

/// Notifications published by the upload registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    TaskAdded {
        snapshot: TaskSnapshot,
    },
    TaskUpdated {
        snapshot: TaskSnapshot,
    },
    TaskRemoved {
        task_id: TaskId,
    },
    ActiveCountChanged {
        count: usize,
    },
    /// A file is usable on the server; listings and space usage are stale
    UploadCompleted {
        task_id: TaskId,
        file_name: String,
        folder_id: String,
    },
    SpaceUsageUpdated {
        use_space: u64,
        total_space: u64,
    },
}

/// Event broadcaster shared by the registry and its consumers
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: Arc<broadcast::Sender<Event>>,
}

impl EventBroadcaster {
    /// Create a new event broadcaster
    ///
    /// # Arguments
    /// * `capacity` - The capacity of the broadcast channel (default: 100)
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Subscribe to events and get a receiver
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Broadcast an event to all subscribers
    ///
    /// # Returns
    /// The number of receivers that received the event
    pub fn broadcast(&self, event: Event) -> usize {
        match self.sender.send(event) {
            Ok(count) => {
                tracing::trace!(target: "events", subscribers = count, "Broadcast event to subscriber(s)");
                count
            }
            Err(_) => {
                tracing::trace!(target: "events", "No active subscribers for event");
                0
            }
        }
    }

    pub fn task_added(&self, snapshot: TaskSnapshot) {
        self.broadcast(Event::TaskAdded { snapshot });
    }

    pub fn task_updated(&self, snapshot: TaskSnapshot) {
        self.broadcast(Event::TaskUpdated { snapshot });
    }

    pub fn task_removed(&self, task_id: TaskId) {
        self.broadcast(Event::TaskRemoved { task_id });
    }

    pub fn active_count_changed(&self, count: usize) {
        tracing::debug!(target: "events", count, "Active upload count changed");
        self.broadcast(Event::ActiveCountChanged { count });
    }

    pub fn upload_completed(&self, task_id: TaskId, file_name: String, folder_id: String) {
        tracing::debug!(target: "events", task_id = %task_id, file_name = %file_name, "Upload completed");
        self.broadcast(Event::UploadCompleted {
            task_id,
            file_name,
            folder_id,
        });
    }

    pub fn space_usage_updated(&self, use_space: u64, total_space: u64) {
        self.broadcast(Event::SpaceUsageUpdated {
            use_space,
            total_space,
        });
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}
