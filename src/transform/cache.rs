//! Memoized transformation results.
//!
//! Entries are keyed by fact id, target version and chain id. Dropping an
//! entry only forces recomputation, so eviction and compaction never affect
//! what subscribers receive.

use crate::types::{Fact, Hash, Timestamp};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Default number of transformed facts kept.
pub const DEFAULT_TRANSFORMATION_CACHE_SIZE: usize = 10_000;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub fact_id: Uuid,
    pub version: u32,
    pub chain_id: Hash,
}

/// Storage for transformed facts.
///
/// Concurrent `put`s for the same key are allowed: transformations are
/// deterministic, so whichever write lands last stores the same value.
pub trait TransformationCache: Send + Sync {
    fn find(&self, fact_id: Uuid, version: u32, chain_id: &Hash) -> Option<Fact>;

    /// Store `fact` (already in its target version) as produced by `chain_id`.
    fn put(&self, fact: &Fact, chain_id: &Hash);

    /// Remove entries not used for `older_than`. Returns the number removed.
    fn compact(&self, older_than: Duration) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Entry {
    fact: Fact,
    touched: Timestamp,
}

/// Bounded in-memory cache with least-recently-used eviction.
pub struct MemoryTransformationCache {
    entries: Mutex<LruCache<CacheKey, Entry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryTransformationCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl Default for MemoryTransformationCache {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSFORMATION_CACHE_SIZE)
    }
}

impl TransformationCache for MemoryTransformationCache {
    fn find(&self, fact_id: Uuid, version: u32, chain_id: &Hash) -> Option<Fact> {
        let key = CacheKey {
            fact_id,
            version,
            chain_id: *chain_id,
        };
        let mut entries = self.entries.lock();
        match entries.get_mut(&key) {
            Some(entry) => {
                entry.touched = Timestamp::now();
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.fact.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn put(&self, fact: &Fact, chain_id: &Hash) {
        let key = CacheKey {
            fact_id: fact.id,
            version: fact.version,
            chain_id: *chain_id,
        };
        self.entries.lock().put(
            key,
            Entry {
                fact: fact.clone(),
                touched: Timestamp::now(),
            },
        );
    }

    fn compact(&self, older_than: Duration) -> usize {
        let cutoff = Timestamp::now().minus(older_than);
        let mut entries = self.entries.lock();
        let stale: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, entry)| entry.touched <= cutoff)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            entries.pop(key);
        }
        if !stale.is_empty() {
            debug!(removed = stale.len(), "compacted transformation cache");
        }
        stale.len()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
