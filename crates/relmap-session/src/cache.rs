//! Second-level cache bridge.
//!
//! An optional shared cache sitting between the session and its persister:
//! a hit reconstructs a managed entity from cached scalar data without a
//! storage round-trip; a miss falls through to the persister and populates
//! the region afterwards. Distinct from the identity map, which is
//! per-session.
//!
//! Each root entity class gets one region with a concurrency strategy:
//!
//! - `ReadOnly` — write-once; a second write to an entry is an error, and
//!   the coordinator rejects scheduled updates against such regions during
//!   flush validation, before storage is touched.
//! - `NonstrictReadWrite` — best-effort: entries are evicted on commit, no
//!   locking.
//! - `ReadWrite` — a time-bounded soft lock is placed on touched entries
//!   for the duration of the commit; concurrent readers treat locked
//!   entries as misses and fall back to storage. Locks left behind by a
//!   rolled-back flush simply expire.
//!
//! Query results (identifier lists keyed by the criteria's canonical hash)
//! cache per region and are invalidated wholesale on any write to the
//! region's class.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use relmap_core::{EntityRecord, Error, Result, Value};

/// Region concurrency strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConcurrencyStrategy {
    /// Write-once; subsequent writes are rejected as errors.
    ReadOnly,
    /// Best-effort invalidation, no locking.
    #[default]
    NonstrictReadWrite,
    /// Soft-locked during commit; readers fall back to storage.
    ReadWrite,
}

/// Cached scalar data for one entity row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedEntity {
    /// The row's field values, as last synchronized.
    pub record: EntityRecord,
    /// The row's optimistic-lock version, if the class is versioned.
    pub version: Option<Value>,
}

/// Hit/miss counters for one cache.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Entity-region hits.
    pub hits: u64,
    /// Entity-region misses.
    pub misses: u64,
    /// Entity-region writes.
    pub puts: u64,
}

#[derive(Default)]
struct Region {
    strategy: ConcurrencyStrategy,
    entries: HashMap<u64, CachedEntity>,
    soft_locks: HashMap<u64, Instant>,
    queries: HashMap<u64, Vec<Vec<Value>>>,
}

/// The second-level cache: one region per root entity class.
pub struct SecondLevelCache {
    regions: HashMap<&'static str, Region>,
    lock_timeout: Duration,
    stats: CacheStats,
}

impl Default for SecondLevelCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SecondLevelCache {
    /// Create a cache with the default 60-second soft-lock timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_lock_timeout(Duration::from_secs(60))
    }

    /// Create a cache with an explicit soft-lock timeout.
    #[must_use]
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            regions: HashMap::new(),
            lock_timeout,
            stats: CacheStats::default(),
        }
    }

    /// Set the concurrency strategy for a root class's region.
    pub fn configure_region(&mut self, root: &'static str, strategy: ConcurrencyStrategy) {
        self.regions.entry(root).or_default().strategy = strategy;
    }

    /// The strategy configured for a root class's region.
    #[must_use]
    pub fn strategy(&self, root: &str) -> ConcurrencyStrategy {
        self.regions
            .get(root)
            .map(|r| r.strategy)
            .unwrap_or_default()
    }

    /// Look up a cached row. Soft-locked entries read as misses.
    pub fn get(&mut self, root: &str, id_hash: u64) -> Option<CachedEntity> {
        let Some(region) = self.regions.get_mut(root) else {
            self.stats.misses += 1;
            return None;
        };

        if let Some(expiry) = region.soft_locks.get(&id_hash) {
            if Instant::now() < *expiry {
                self.stats.misses += 1;
                return None;
            }
            region.soft_locks.remove(&id_hash);
        }

        match region.entries.get(&id_hash) {
            Some(entry) => {
                self.stats.hits += 1;
                Some(entry.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Store a row in its region.
    ///
    /// Fails for a second write to an entry in a `ReadOnly` region.
    pub fn put(&mut self, root: &'static str, id_hash: u64, entity: CachedEntity) -> Result<()> {
        let region = self.regions.entry(root).or_default();
        if region.strategy == ConcurrencyStrategy::ReadOnly
            && region.entries.contains_key(&id_hash)
        {
            return Err(Error::invalid_argument(format!(
                "cache region '{root}' is read-only; entries are write-once"
            )));
        }
        region.soft_locks.remove(&id_hash);
        region.entries.insert(id_hash, entity);
        self.stats.puts += 1;
        Ok(())
    }

    /// Remove a row from its region.
    pub fn evict(&mut self, root: &str, id_hash: u64) {
        if let Some(region) = self.regions.get_mut(root) {
            region.entries.remove(&id_hash);
            region.soft_locks.remove(&id_hash);
        }
    }

    /// Place a commit-duration soft lock on an entry of a `ReadWrite`
    /// region. No-op for other strategies.
    pub fn lock(&mut self, root: &'static str, id_hash: u64) {
        let region = self.regions.entry(root).or_default();
        if region.strategy == ConcurrencyStrategy::ReadWrite {
            region
                .soft_locks
                .insert(id_hash, Instant::now() + self.lock_timeout);
        }
    }

    /// Whether an entry is currently soft-locked.
    #[must_use]
    pub fn is_locked(&self, root: &str, id_hash: u64) -> bool {
        self.regions
            .get(root)
            .and_then(|r| r.soft_locks.get(&id_hash))
            .is_some_and(|expiry| Instant::now() < *expiry)
    }

    /// Look up a cached query result (identifier tuples).
    #[must_use]
    pub fn get_query(&self, root: &str, key: u64) -> Option<&Vec<Vec<Value>>> {
        self.regions.get(root).and_then(|r| r.queries.get(&key))
    }

    /// Store a query result in its region.
    pub fn put_query(&mut self, root: &'static str, key: u64, identities: Vec<Vec<Value>>) {
        self.regions
            .entry(root)
            .or_default()
            .queries
            .insert(key, identities);
    }

    /// Drop every cached query result for a root class. Called on any
    /// write to the class; per-row dependency tracking is not attempted.
    pub fn invalidate_queries(&mut self, root: &str) {
        if let Some(region) = self.regions.get_mut(root) {
            region.queries.clear();
        }
    }

    /// Drop every entry and query result for a root class.
    pub fn evict_region(&mut self, root: &str) {
        if let Some(region) = self.regions.get_mut(root) {
            region.entries.clear();
            region.queries.clear();
            region.soft_locks.clear();
        }
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.regions.clear();
    }

    /// Hit/miss counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(total: i64) -> CachedEntity {
        CachedEntity {
            record: EntityRecord::from_pairs(vec![
                ("id", Value::BigInt(1)),
                ("total", Value::BigInt(total)),
            ]),
            version: None,
        }
    }

    #[test]
    fn test_put_then_get() {
        let mut cache = SecondLevelCache::new();
        cache.put("Order", 1, entry(100)).unwrap();

        let hit = cache.get("Order", 1).expect("cached");
        assert_eq!(hit.record.get("total"), Some(&Value::BigInt(100)));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_miss_on_unknown_region_and_key() {
        let mut cache = SecondLevelCache::new();
        assert!(cache.get("Order", 1).is_none());

        cache.put("Order", 1, entry(100)).unwrap();
        assert!(cache.get("Order", 2).is_none());
        assert_eq!(cache.stats().misses, 2);
    }

    #[test]
    fn test_read_only_region_is_write_once() {
        let mut cache = SecondLevelCache::new();
        cache.configure_region("Country", ConcurrencyStrategy::ReadOnly);

        cache.put("Country", 1, entry(1)).unwrap();
        let err = cache.put("Country", 1, entry(2)).unwrap_err();
        assert!(err.to_string().contains("write-once"));

        // Fresh keys are still writable.
        cache.put("Country", 2, entry(2)).unwrap();
    }

    #[test]
    fn test_soft_lock_reads_as_miss_until_released() {
        let mut cache = SecondLevelCache::new();
        cache.configure_region("Order", ConcurrencyStrategy::ReadWrite);
        cache.put("Order", 1, entry(100)).unwrap();

        cache.lock("Order", 1);
        assert!(cache.is_locked("Order", 1));
        assert!(cache.get("Order", 1).is_none());

        // A put (commit synchronization) releases the lock.
        cache.put("Order", 1, entry(150)).unwrap();
        assert!(!cache.is_locked("Order", 1));
        let hit = cache.get("Order", 1).expect("unlocked");
        assert_eq!(hit.record.get("total"), Some(&Value::BigInt(150)));
    }

    #[test]
    fn test_expired_soft_lock_reads_again() {
        let mut cache = SecondLevelCache::with_lock_timeout(Duration::from_millis(0));
        cache.configure_region("Order", ConcurrencyStrategy::ReadWrite);
        cache.put("Order", 1, entry(100)).unwrap();

        cache.lock("Order", 1);
        // Zero timeout: the lock is expired immediately.
        assert!(cache.get("Order", 1).is_some());
    }

    #[test]
    fn test_lock_is_noop_for_nonstrict_regions() {
        let mut cache = SecondLevelCache::new();
        cache.put("Order", 1, entry(100)).unwrap();
        cache.lock("Order", 1);
        assert!(!cache.is_locked("Order", 1));
        assert!(cache.get("Order", 1).is_some());
    }

    #[test]
    fn test_query_cache_roundtrip_and_invalidation() {
        let mut cache = SecondLevelCache::new();
        let ids = vec![vec![Value::BigInt(1)], vec![Value::BigInt(2)]];
        cache.put_query("Order", 42, ids.clone());

        assert_eq!(cache.get_query("Order", 42), Some(&ids));

        cache.invalidate_queries("Order");
        assert!(cache.get_query("Order", 42).is_none());
    }

    #[test]
    fn test_evict_region_drops_entries_and_queries() {
        let mut cache = SecondLevelCache::new();
        cache.put("Order", 1, entry(100)).unwrap();
        cache.put_query("Order", 42, vec![vec![Value::BigInt(1)]]);

        cache.evict_region("Order");

        assert!(cache.get("Order", 1).is_none());
        assert!(cache.get_query("Order", 42).is_none());
    }
}
