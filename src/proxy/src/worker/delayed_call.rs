use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

/// Action tag delivered to a delayed-call callback: `Execute` when the
/// deadline fires, `Cancel` when the call is dropped before firing (explicit
/// cancellation or worker shutdown) so user code can release resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DcAction {
    Execute,
    Cancel,
}

/// Token identifying a registered delayed call on one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DcId(pub(crate) u64);

/// Returning `true` from an `Execute` delivery re-arms the call with its
/// original period.
pub type DcCallback = Box<dyn FnMut(DcAction) -> bool>;

struct HeapKey {
    deadline: Instant,
    insertion: u64,
    id: u64,
}

impl PartialEq for HeapKey {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.insertion == other.insertion
    }
}
impl Eq for HeapKey {}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline pops
        // first, ties resolved in insertion order.
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.insertion.cmp(&self.insertion))
    }
}
impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Entry {
    period: Duration,
    callback: DcCallback,
}

/// The deadline queue owned by one worker. Not `Send`: all registration,
/// firing and cancellation happen on the worker's own thread.
#[derive(Default)]
pub struct DelayedCalls {
    heap: BinaryHeap<HeapKey>,
    entries: HashMap<u64, Entry>,
    next_id: u64,
    insertions: u64,
}

impl DelayedCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, delay: Duration, callback: DcCallback) -> DcId {
        self.next_id += 1;
        self.insertions += 1;
        let id = self.next_id;
        self.heap.push(HeapKey {
            deadline: Instant::now() + delay,
            insertion: self.insertions,
            id,
        });
        self.entries.insert(
            id,
            Entry {
                period: delay,
                callback,
            },
        );
        DcId(id)
    }

    /// Delivers `Cancel` and forgets the call. Unknown ids are a no-op (the
    /// call may have fired already).
    pub fn cancel(&mut self, id: DcId) {
        if let Some(mut entry) = self.entries.remove(&id.0) {
            (entry.callback)(DcAction::Cancel);
        }
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        // skip keys whose entry was cancelled
        while let Some(key) = self.heap.peek() {
            if self.entries.contains_key(&key.id) {
                return Some(key.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Fires every call due at `now`. Calls returning `true` re-arm with
    /// their original period; equal deadlines fire in insertion order.
    pub fn fire_due(&mut self, now: Instant) {
        while let Some(key) = self.heap.peek() {
            if key.deadline > now {
                break;
            }
            let key = self.heap.pop().expect("peeked above");
            if let Some(mut entry) = self.entries.remove(&key.id) {
                if (entry.callback)(DcAction::Execute) {
                    self.insertions += 1;
                    self.heap.push(HeapKey {
                        deadline: now + entry.period,
                        insertion: self.insertions,
                        id: key.id,
                    });
                    self.entries.insert(key.id, entry);
                }
            }
        }
    }

    /// Shutdown path: every still-pending call sees `Cancel` exactly once.
    pub fn cancel_all(&mut self) {
        for (_, mut entry) in self.entries.drain() {
            (entry.callback)(DcAction::Cancel);
        }
        self.heap.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
