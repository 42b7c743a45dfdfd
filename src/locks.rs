//! Per-key async mutual exclusion for read-modify-write sequences

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Number of table entries that triggers a sweep of released locks
const PRUNE_THRESHOLD: usize = 1024;

/// Table of lazily created locks, one per key.
///
/// Entries hold weak references, so a key's lock disappears once no task is
/// holding or waiting on it.
#[derive(Default)]
pub struct KeyLocks {
    table: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

impl KeyLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut table = self.table.lock();
        if let Some(existing) = table.get(key).and_then(Weak::upgrade) {
            return existing;
        }
        if table.len() >= PRUNE_THRESHOLD {
            table.retain(|_, lock| lock.strong_count() > 0);
        }
        let lock = Arc::new(AsyncMutex::new(()));
        table.insert(key.to_string(), Arc::downgrade(&lock));
        lock
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        self.handle(key).lock_owned().await
    }

    /// Lock several keys. Keys are taken in sorted order, so two callers with
    /// overlapping key sets cannot deadlock.
    pub async fn lock_all<I, S>(&self, keys: I) -> Vec<OwnedMutexGuard<()>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.lock(key).await);
        }
        guards
    }

    /// Keys with a live lock handle.
    pub fn active(&self) -> usize {
        self.table
            .lock()
            .values()
            .filter(|lock| lock.strong_count() > 0)
            .count()
    }
}
