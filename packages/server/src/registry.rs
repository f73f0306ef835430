//! Lookup of live queues and queue classes by name.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use netschedule_core::{QueueError, QueueParams};

use crate::queue::Queue;

/// Live queues of one server.
///
/// Request handlers resolve queues here without going through the
/// supervisor; only the supervisor inserts, replaces and removes.
#[derive(Debug, Default)]
pub struct QueueRegistry {
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    classes: RwLock<HashMap<String, QueueParams>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a queue; fails if the name is taken.
    pub fn insert(&self, queue: Arc<Queue>) -> Result<(), QueueError> {
        let mut queues = write(&self.queues);
        if queues.contains_key(queue.name()) {
            return Err(QueueError::QueueExists(queue.name().to_string()));
        }
        queues.insert(queue.name().to_string(), queue);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<Queue>, QueueError> {
        read(&self.queues)
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        read(&self.queues).contains_key(name)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Queue>> {
        write(&self.queues).remove(name)
    }

    /// Swap in a new instance under the same name; returns the old one.
    pub fn replace(&self, queue: Arc<Queue>) -> Option<Arc<Queue>> {
        write(&self.queues).insert(queue.name().to_string(), queue)
    }

    /// Snapshot of all live queues, sorted by name.
    pub fn list(&self) -> Vec<Arc<Queue>> {
        let mut queues: Vec<Arc<Queue>> = read(&self.queues).values().cloned().collect();
        queues.sort_by(|a, b| a.name().cmp(b.name()));
        queues
    }

    pub fn set_class(&self, name: &str, params: QueueParams) {
        write(&self.classes).insert(name.to_string(), params);
    }

    pub fn class(&self, name: &str) -> Option<QueueParams> {
        read(&self.classes).get(name).cloned()
    }
}
