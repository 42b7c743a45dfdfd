//! Cache tier: fast, volatile storage of compressed cuboids keyed by cuboid key

use crate::error::{Result, SpatialError};
use crate::index::CuboidKey;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A compressed cuboid as held in the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedCuboid {
    pub payload: Bytes,
    pub version: u64,
}

/// Previous cache contents for a key, used to roll back a batch commit
pub type PriorEntry = (CuboidKey, Option<CachedCuboid>);

#[async_trait]
pub trait CacheTier: Send + Sync {
    async fn get(&self, key: &CuboidKey) -> Result<Option<CachedCuboid>>;

    /// Insert only when the key has no entry yet; returns whether it inserted.
    /// Used for read-through repopulation so it never clobbers a newer write.
    async fn put_if_absent(&self, key: &CuboidKey, entry: CachedCuboid) -> Result<bool>;

    /// Store every entry as one atomic batch and return what each key held
    /// before.
    async fn commit(&self, entries: Vec<(CuboidKey, CachedCuboid)>) -> Result<Vec<PriorEntry>>;

    /// Undo a [`CacheTier::commit`] by reinstating the prior entries.
    async fn restore(&self, prior: Vec<PriorEntry>) -> Result<()>;

    /// Remove the entry for `key` only if it still holds `version`; returns
    /// whether it removed one. A newer write is never evicted.
    async fn evict_version(&self, key: &CuboidKey, version: u64) -> Result<bool>;
}

/// Operation counters for a [`MemoryCache`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub reads: u64,
    pub hits: u64,
    pub writes: u64,
}

/// In-process cache tier
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<CuboidKey, CachedCuboid>>,
    offline: AtomicBool,
    reads: AtomicU64,
    hits: AtomicU64,
    writes: AtomicU64,
}

impl MemoryCache {
    /// Create an empty, online cache
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with `StoreUnavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Drop every entry, as a cache node restart would.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of the operation counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            reads: self.reads.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    /// Overwrite an entry directly, bypassing versioning.
    pub fn insert_raw(&self, key: CuboidKey, entry: CachedCuboid) {
        self.entries.write().insert(key, entry);
    }

    fn check_online(&self, context: &str) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SpatialError::unavailable(context, "cache tier offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheTier for MemoryCache {
    async fn get(&self, key: &CuboidKey) -> Result<Option<CachedCuboid>> {
        self.check_online(&format!("cache get {}", key))?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        let entry = self.entries.read().get(key).cloned();
        if entry.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(entry)
    }

    async fn put_if_absent(&self, key: &CuboidKey, entry: CachedCuboid) -> Result<bool> {
        self.check_online(&format!("cache put {}", key))?;
        let mut entries = self.entries.write();
        if entries.contains_key(key) {
            return Ok(false);
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        entries.insert(key.clone(), entry);
        Ok(true)
    }

    async fn commit(&self, batch: Vec<(CuboidKey, CachedCuboid)>) -> Result<Vec<PriorEntry>> {
        self.check_online("cache commit")?;
        let mut entries = self.entries.write();
        self.writes.fetch_add(batch.len() as u64, Ordering::Relaxed);
        Ok(batch
            .into_iter()
            .map(|(key, entry)| {
                let prior = entries.insert(key.clone(), entry);
                (key, prior)
            })
            .collect())
    }

    async fn restore(&self, prior: Vec<PriorEntry>) -> Result<()> {
        self.check_online("cache restore")?;
        let mut entries = self.entries.write();
        for (key, entry) in prior {
            match entry {
                Some(entry) => entries.insert(key, entry),
                None => entries.remove(&key),
            };
        }
        Ok(())
    }

    async fn evict_version(&self, key: &CuboidKey, version: u64) -> Result<bool> {
        self.check_online(&format!("cache evict {}", key))?;
        let mut entries = self.entries.write();
        if entries.get(key).is_some_and(|entry| entry.version == version) {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::CuboidIndexer;
    use crate::layout::GridCoord;
    use crate::types::VolumeIdentity;

    fn key(x: u64) -> CuboidKey {
        CuboidIndexer::new(8)
            .key_for(&VolumeIdentity::new("c", "e", "ch"), 0, GridCoord::new(x, 0, 0), 0)
            .unwrap()
    }

    fn entry(byte: u8, version: u64) -> CachedCuboid {
        CachedCuboid {
            payload: Bytes::from(vec![byte; 4]),
            version,
        }
    }

    #[tokio::test]
    async fn test_put_if_absent_keeps_existing() {
        let cache = MemoryCache::new();
        assert!(cache.put_if_absent(&key(0), entry(1, 1)).await.unwrap());
        assert!(!cache.put_if_absent(&key(0), entry(2, 2)).await.unwrap());
        assert_eq!(cache.get(&key(0)).await.unwrap(), Some(entry(1, 1)));
    }

    #[tokio::test]
    async fn test_commit_and_restore() {
        let cache = MemoryCache::new();
        cache.commit(vec![(key(0), entry(1, 1))]).await.unwrap();

        let prior = cache
            .commit(vec![(key(0), entry(2, 2)), (key(1), entry(3, 2))])
            .await
            .unwrap();
        assert_eq!(prior[0], (key(0), Some(entry(1, 1))));
        assert_eq!(prior[1], (key(1), None));

        cache.restore(prior).await.unwrap();
        assert_eq!(cache.get(&key(0)).await.unwrap(), Some(entry(1, 1)));
        assert_eq!(cache.get(&key(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_evict_only_matching_version() {
        let cache = MemoryCache::new();
        cache.commit(vec![(key(0), entry(1, 4))]).await.unwrap();
        assert!(!cache.evict_version(&key(0), 3).await.unwrap());
        assert!(!cache.evict_version(&key(1), 4).await.unwrap());
        assert_eq!(cache.len(), 1);
        assert!(cache.evict_version(&key(0), 4).await.unwrap());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_offline_and_stats() {
        let cache = MemoryCache::new();
        cache.commit(vec![(key(0), entry(1, 1))]).await.unwrap();
        cache.get(&key(0)).await.unwrap();
        cache.get(&key(1)).await.unwrap();
        assert_eq!(
            cache.stats(),
            CacheStats {
                reads: 2,
                hits: 1,
                writes: 1
            }
        );

        cache.set_offline(true);
        assert!(matches!(
            cache.get(&key(0)).await,
            Err(SpatialError::StoreUnavailable { .. })
        ));
        cache.set_offline(false);
        cache.clear();
        assert!(cache.is_empty());
    }
}
