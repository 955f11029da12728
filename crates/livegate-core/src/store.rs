//! Bounded per-subject state.
//!
//! Every component that keeps state per subject goes through [`StateStore`],
//! so transient subject ids can never grow memory without bound.

use lru::LruCache;
use std::num::NonZeroUsize;

use crate::types::SubjectId;

pub trait StateStore<T> {
    /// Return the subject's state, creating a default entry on first sighting.
    fn get_or_create(&mut self, id: &SubjectId) -> &mut T;
    /// Look up without counting as use.
    fn get(&self, id: &SubjectId) -> Option<&T>;
    /// Look up for update; counts as use, like `get_or_create`.
    fn get_mut(&mut self, id: &SubjectId) -> Option<&mut T>;
    /// Drop the subject's state, returning it if present.
    fn expire(&mut self, id: &SubjectId) -> Option<T>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// [`StateStore`] that evicts the least recently created or updated subject
/// once `capacity` is reached.
pub struct LruStateStore<T> {
    entries: LruCache<SubjectId, T>,
}

impl<T> LruStateStore<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }
}

impl<T: Default> StateStore<T> for LruStateStore<T> {
    fn get_or_create(&mut self, id: &SubjectId) -> &mut T {
        if !self.entries.contains(id) && self.entries.len() == self.capacity() {
            if let Some((evicted, _)) = self.entries.peek_lru() {
                tracing::debug!(subject = %evicted, "evicting least recently seen subject state");
            }
        }
        // Inserting at capacity evicts the LRU entry.
        self.entries.get_or_insert_mut(id.clone(), T::default)
    }

    fn get(&self, id: &SubjectId) -> Option<&T> {
        self.entries.peek(id)
    }

    fn get_mut(&mut self, id: &SubjectId) -> Option<&mut T> {
        self.entries.get_mut(id)
    }

    fn expire(&mut self, id: &SubjectId) -> Option<T> {
        self.entries.pop(id)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_defaults() {
        let mut store: LruStateStore<u32> = LruStateStore::new(4);
        *store.get_or_create(&"alice".into()) += 3;
        assert_eq!(store.get(&"alice".into()), Some(&3));
        assert!(store.get(&"bob".into()).is_none());
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut store: LruStateStore<u32> = LruStateStore::new(2);
        store.get_or_create(&"alice".into());
        store.get_or_create(&"bob".into());
        // touch alice so bob becomes the eviction candidate
        store.get_or_create(&"alice".into());
        store.get_or_create(&"carol".into());
        assert_eq!(store.len(), 2);
        assert!(store.get(&"bob".into()).is_none());
        assert!(store.get(&"alice".into()).is_some());
    }

    #[test]
    fn test_update_counts_as_use() {
        let mut store: LruStateStore<u32> = LruStateStore::new(2);
        store.get_or_create(&"alice".into());
        store.get_or_create(&"bob".into());
        for _ in 0..3 {
            *store.get_mut(&"alice".into()).unwrap() += 1;
        }
        store.get_or_create(&"carol".into());
        assert_eq!(store.get(&"alice".into()), Some(&3));
        assert!(store.get(&"bob".into()).is_none());
    }

    #[test]
    fn test_plain_get_does_not_refresh() {
        let mut store: LruStateStore<u32> = LruStateStore::new(2);
        store.get_or_create(&"alice".into());
        store.get_or_create(&"bob".into());
        assert!(store.get(&"alice".into()).is_some());
        store.get_or_create(&"carol".into());
        assert!(store.get(&"alice".into()).is_none());
        assert!(store.get(&"bob".into()).is_some());
    }

    #[test]
    fn test_expire_removes_entry() {
        let mut store: LruStateStore<u32> = LruStateStore::new(2);
        *store.get_or_create(&"alice".into()) = 7;
        assert_eq!(store.expire(&"alice".into()), Some(7));
        assert!(store.is_empty());
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let mut store: LruStateStore<u32> = LruStateStore::new(0);
        store.get_or_create(&"alice".into());
        store.get_or_create(&"bob".into());
        assert_eq!(store.capacity(), 1);
        assert_eq!(store.len(), 1);
    }
}
