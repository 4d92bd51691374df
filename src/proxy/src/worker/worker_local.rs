//! Per-worker snapshot cells. A publisher replaces every worker's pointer
//! with a new immutable snapshot; readers clone the `Arc` and keep using the
//! old snapshot until they drop it, so a publish never invalidates data a
//! session is still looking at.

use std::sync::{Arc, RwLock};

pub struct WorkerLocal<T> {
    slots: Vec<RwLock<Arc<T>>>,
}

impl<T> WorkerLocal<T> {
    pub fn new(workers: usize, initial: Arc<T>) -> Self {
        let slots = (0..workers.max(1))
            .map(|_| RwLock::new(Arc::clone(&initial)))
            .collect();
        Self { slots }
    }

    /// The current snapshot as seen by `worker_id`.
    pub fn get(&self, worker_id: usize) -> Arc<T> {
        let slot = &self.slots[worker_id % self.slots.len()];
        Arc::clone(&slot.read().expect("worker-local slot poisoned"))
    }

    /// Publishes a new snapshot to every worker.
    pub fn publish(&self, value: Arc<T>) {
        for slot in &self.slots {
            *slot.write().expect("worker-local slot poisoned") = Arc::clone(&value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_old_snapshot_survives_publish() {
        let cell = WorkerLocal::new(2, Arc::new("v1"));
        let held = cell.get(0);
        cell.publish(Arc::new("v2"));
        assert_eq!(*held, "v1");
        assert_eq!(*cell.get(0), "v2");
        assert_eq!(*cell.get(1), "v2");
    }
}
