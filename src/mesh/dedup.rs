//! Bounded Dedup Cache
//!
//! Insertion-ordered set of identities with strict FIFO eviction. Check and
//! insert happen under one lock so two relay tasks cannot both conclude a
//! message is new.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use uuid::Uuid;

#[derive(Debug)]
struct SeenSet<K> {
    members: HashSet<K>,
    order: VecDeque<K>,
}

#[derive(Debug)]
pub struct DedupCache<K = Uuid> {
    seen: Mutex<SeenSet<K>>,
    capacity: usize,
}

impl<K> DedupCache<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: Mutex::new(SeenSet {
                members: HashSet::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
            }),
            capacity,
        }
    }

    /// Insert `key` if absent. Returns true when it was not seen before.
    ///
    /// Re-marking a present key does not refresh its position.
    pub fn mark_seen(&self, key: K) -> bool {
        let mut seen = self.seen.lock();
        if !seen.members.insert(key.clone()) {
            return false;
        }
        seen.order.push_back(key);

        if seen.order.len() > self.capacity {
            if let Some(oldest) = seen.order.pop_front() {
                seen.members.remove(&oldest);
            }
        }
        true
    }

    pub fn is_seen(&self, key: &K) -> bool {
        self.seen.lock().members.contains(key)
    }

    /// Atomic check-then-mark: true only for the first caller with `key`
    pub fn check_and_mark(&self, key: K) -> bool {
        self.mark_seen(key)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        let mut seen = self.seen.lock();
        seen.members.clear();
        seen.order.clear();
    }
}
