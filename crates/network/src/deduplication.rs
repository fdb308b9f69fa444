use parking_lot::Mutex;
use std::collections::HashSet;

use crate::protocol::TxId;

/// Bounded recency set of transaction ids used to suppress rebroadcast.
///
/// Holds at most `capacity` ids. Ids live in a ring in insertion order and
/// the oldest surviving id is always the next one evicted. A single mutex
/// guards both the ring and the membership set.
#[derive(Debug)]
pub struct TransactionDedupCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

#[derive(Debug)]
struct Inner {
    ring: Vec<Option<TxId>>,
    seen: HashSet<TxId>,
    index: usize,
}

impl TransactionDedupCache {
    /// Create a cache holding at most `capacity` ids (minimum one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                ring: vec![None; capacity],
                seen: HashSet::with_capacity(capacity),
                index: 0,
            }),
            capacity,
        }
    }

    /// Record `id`. Returns `true` if it was not present, `false` for a
    /// duplicate. The check and the insert happen under one lock, so of two
    /// concurrent calls with the same id exactly one returns `true`.
    pub fn add(&self, id: TxId) -> bool {
        let mut inner = self.inner.lock();
        if !inner.seen.insert(id) {
            return false;
        }
        let slot = inner.index % self.capacity;
        if let Some(evicted) = inner.ring[slot].replace(id) {
            inner.seen.remove(&evicted);
        }
        inner.index = inner.index.wrapping_add(1);
        true
    }

    pub fn exists(&self, id: &TxId) -> bool {
        self.inner.lock().seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for TransactionDedupCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}
