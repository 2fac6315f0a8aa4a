//! Bounded touch-ordered set of remote service references.
//!
//! Only remote services without a parent device live here. When a new
//! entry pushes the set past capacity, the least recently touched one is
//! handed back to the caller, which unregisters and disposes it.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::reference::{Reference, ReferenceId};

pub struct EvictionCache {
    entries: Mutex<LruCache<ReferenceId, Arc<Reference>>>,
}

impl EvictionCache {
    /// A capacity of zero means unbounded.
    pub fn new(capacity: usize) -> Self {
        let entries = match NonZeroUsize::new(capacity) {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// Insert or refresh `reference`. Returns the evicted eldest entry, if any.
    pub fn admit(&self, reference: Arc<Reference>) -> Option<Arc<Reference>> {
        let id = reference.id();
        let mut entries = self.entries.lock();
        match entries.push(id, reference) {
            // `push` also hands back the old value when the key was present.
            Some((evicted_id, evicted)) if evicted_id != id => Some(evicted),
            _ => None,
        }
    }

    /// Mark as most recently used. Unknown ids are ignored.
    pub fn touch(&self, id: ReferenceId) {
        self.entries.lock().promote(&id);
    }

    pub fn remove(&self, id: ReferenceId) -> Option<Arc<Reference>> {
        self.entries.lock().pop(&id)
    }

    pub fn contains(&self, id: ReferenceId) -> bool {
        self.entries.lock().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> Option<usize> {
        let cap = self.entries.lock().cap().get();
        (cap != usize::MAX).then_some(cap)
    }
}
