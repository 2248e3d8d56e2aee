use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use moka::future::Cache;
use tracing::debug;

/// An in-process cache that is only ever invalidated as a whole.
///
/// The region holds at most `max_capacity` entries; moka evicts the least useful ones beyond
/// that. Every [`clean`](Self::clean) bumps the generation. Writers capture the generation before
/// computing a value and [`insert`](Self::insert) drops the value if a clean happened meanwhile.
/// Entries are tagged with the generation they were stored under and never served past it.
pub struct CacheRegion<K, V> {
    name: &'static str,
    generation: AtomicU64,
    entries: Cache<K, (u64, V)>,
}

impl<K, V> CacheRegion<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, max_capacity: u64) -> Self {
        Self {
            name,
            generation: AtomicU64::new(0),
            entries: Cache::builder().name(name).max_capacity(max_capacity).build(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let generation = self.generation();

        self.entries
            .get(key)
            .await
            .filter(|(stored_under, _)| *stored_under == generation)
            .map(|(_, value)| value)
    }

    /// Stores the value unless the region was cleaned after `generation` was observed.
    pub async fn insert(&self, key: K, value: V, generation: u64) -> bool {
        if self.generation() != generation {
            return false;
        }

        self.entries.insert(key, (generation, value)).await;

        true
    }

    #[cfg(test)]
    pub async fn len(&self) -> u64 {
        self.entries.run_pending_tasks().await;

        self.entries.entry_count()
    }

    /// Drops every entry of the region.
    pub fn clean(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.entries.invalidate_all();

        debug!(region = self.name, generation, "Cleaned the cache region");
    }
}
