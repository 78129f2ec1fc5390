//! Single-owner task store

use crate::events::EventBroadcaster;
use crate::uploader::task::{TaskId, TaskSnapshot, UploadTask};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;

/// Holds every task. All mutation goes through [`TaskStore::update`], a
/// read-modify-write under the entry lock. The new snapshot is published
/// before that lock is released, so events for one task follow the order
/// of its mutations.
pub struct TaskStore {
    tasks: DashMap<TaskId, UploadTask>,
    next_seq: AtomicU64,
    active_tx: watch::Sender<usize>,
    /// Serializes counting and publishing the active count
    count_lock: Mutex<()>,
    events: EventBroadcaster,
}

impl TaskStore {
    pub fn new(events: EventBroadcaster) -> Self {
        let (active_tx, _) = watch::channel(0);
        Self {
            tasks: DashMap::new(),
            next_seq: AtomicU64::new(0),
            active_tx,
            count_lock: Mutex::new(()),
            events,
        }
    }

    pub fn insert(&self, mut task: UploadTask) -> TaskSnapshot {
        task.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let snapshot = task.snapshot();
        {
            let _entry = self.tasks.entry(task.id.clone()).insert(task);
            self.events.task_added(snapshot.clone());
        }

        self.refresh_active_count();
        snapshot
    }

    /// Apply `f` to the task and publish the result.
    /// Returns `None` if the task no longer exists.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut UploadTask) -> R) -> Option<R> {
        let result = {
            let mut task = self.tasks.get_mut(id)?;
            let result = f(task.value_mut());
            self.events.task_updated(task.snapshot());
            result
        };

        // The shard lock is released; counting iterates every shard
        self.refresh_active_count();
        Some(result)
    }

    /// Read from the task without publishing anything
    pub fn read<R>(&self, id: &str, f: impl FnOnce(&UploadTask) -> R) -> Option<R> {
        self.tasks.get(id).map(|task| f(task.value()))
    }

    pub fn remove(&self, id: &str) -> Option<UploadTask> {
        let (_, task) = self.tasks.remove(id)?;
        self.events.task_removed(task.id.clone());
        self.refresh_active_count();
        Some(task)
    }

    pub fn snapshot(&self, id: &str) -> Option<TaskSnapshot> {
        self.read(id, UploadTask::snapshot)
    }

    /// All tasks in insertion order
    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        let mut tasks: Vec<(u64, TaskSnapshot)> = self
            .tasks
            .iter()
            .map(|entry| (entry.seq, entry.snapshot()))
            .collect();
        tasks.sort_by_key(|(seq, _)| *seq);
        tasks.into_iter().map(|(_, snapshot)| snapshot).collect()
    }

    /// Ids of tasks matching `predicate`, in insertion order
    pub fn ids_where(&self, predicate: impl Fn(&UploadTask) -> bool) -> Vec<TaskId> {
        let mut ids: Vec<(u64, TaskId)> = self
            .tasks
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| (entry.seq, entry.id.clone()))
            .collect();
        ids.sort_by_key(|(seq, _)| *seq);
        ids.into_iter().map(|(_, id)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn active_count(&self) -> usize {
        *self.active_tx.borrow()
    }

    pub fn watch_active_count(&self) -> watch::Receiver<usize> {
        self.active_tx.subscribe()
    }

    /// Recount under `count_lock` so a stale count never replaces a newer one
    fn refresh_active_count(&self) {
        let _guard = self.count_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let count = self
            .tasks
            .iter()
            .filter(|entry| entry.status().is_active())
            .count();

        let changed = self.active_tx.send_if_modified(|current| {
            if *current == count {
                return false;
            }
            *current = count;
            true
        });
        if changed {
            self.events.active_count_changed(count);
        }
    }
}
