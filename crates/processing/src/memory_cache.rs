//! In-memory cache of rehydrated aggregates.

use common::AggregateId;
use dashmap::DashMap;
use domain::{Aggregate, AggregateRoot};
use event_store::Version;

/// Latest known aggregate instances keyed by id.
///
/// Entries are replaced after every successful append and removed when a
/// conflict or duplicate shows the cached copy may be stale. Readers always
/// get a clone, never a shared reference.
pub struct MemoryCache<A: Aggregate> {
    entries: DashMap<AggregateId, AggregateRoot<A>>,
}

impl<A: Aggregate> MemoryCache<A> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, aggregate_id: &AggregateId) -> Option<AggregateRoot<A>> {
        self.entries.get(aggregate_id).map(|root| root.clone())
    }

    pub fn set(&self, aggregate_id: AggregateId, root: AggregateRoot<A>) {
        self.entries.insert(aggregate_id, root);
    }

    pub fn remove(&self, aggregate_id: &AggregateId) -> bool {
        self.entries.remove(aggregate_id).is_some()
    }

    /// Version of the cached instance, if any.
    pub fn version(&self, aggregate_id: &AggregateId) -> Option<Version> {
        self.entries.get(aggregate_id).map(|root| root.version())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<A: Aggregate> Default for MemoryCache<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Counter;

    #[test]
    fn set_get_remove() {
        let cache = MemoryCache::<Counter>::new();
        let id = AggregateId::from("c-1");
        assert!(cache.get(&id).is_none());

        let root = AggregateRoot::restore(id.clone(), Version::new(3), Counter { value: 7 });
        cache.set(id.clone(), root);

        let cached = cache.get(&id).unwrap();
        assert_eq!(cached.state().value, 7);
        assert_eq!(cache.version(&id), Some(Version::new(3)));
        assert_eq!(cache.len(), 1);

        assert!(cache.remove(&id));
        assert!(!cache.remove(&id));
        assert!(cache.is_empty());
    }

    #[test]
    fn readers_get_independent_copies() {
        let cache = MemoryCache::<Counter>::new();
        let id = AggregateId::from("c-1");
        cache.set(
            id.clone(),
            AggregateRoot::restore(id.clone(), Version::new(1), Counter { value: 1 }),
        );

        let mut copy = cache.get(&id).unwrap();
        copy.commit(Version::new(2));

        assert_eq!(cache.version(&id), Some(Version::new(1)));
    }
}
