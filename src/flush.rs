//! Write-back of cached cuboids to the durable store.
//!
//! Every cuboid write posts a [`DirtyMarker`] on the flush queue. Workers
//! receive markers, copy the current cache value to the durable store with
//! last-writer-wins semantics and acknowledge. Failed markers are requeued
//! with backoff and dead-lettered after `FlushConfig::max_attempts`
//! deliveries. A client-class error dead-letters at once.

use crate::cache::CacheTier;
use crate::config::FlushConfig;
use crate::error::{Result, SpatialError};
use crate::index::CuboidKey;
use crate::queue::WorkQueue;
use crate::retry::RetryPolicy;
use crate::store::{ObjectStore, PutOutcome, StoredCuboid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A cuboid whose cached value may be newer than its durable copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyMarker {
    pub key: CuboidKey,
    pub version: u64,
    pub written_at: DateTime<Utc>,
}

impl DirtyMarker {
    pub fn new(key: CuboidKey, version: u64) -> Self {
        Self {
            key,
            version,
            written_at: Utc::now(),
        }
    }
}

pub type FlushQueue = dyn WorkQueue<DirtyMarker>;

/// How a marker was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The cached value was written to the durable store
    Persisted { version: u64 },
    /// The durable store already held this version or a newer one
    AlreadyDurable,
}

/// Result of one worker step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStep {
    /// Nothing visible on the queue
    Idle,
    Flushed(FlushOutcome),
    Requeued { attempts: u32 },
    DeadLettered,
}

/// Totals from [`FlushWorker::drain`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub flushed: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
}

pub struct FlushWorker {
    cache: Arc<dyn CacheTier>,
    store: Arc<dyn ObjectStore>,
    queue: Arc<FlushQueue>,
    retry: RetryPolicy,
    config: FlushConfig,
}

impl FlushWorker {
    /// Create a worker over the engine's cache, store and flush queue
    pub fn new(
        cache: Arc<dyn CacheTier>,
        store: Arc<dyn ObjectStore>,
        queue: Arc<FlushQueue>,
        retry: RetryPolicy,
        config: FlushConfig,
    ) -> Self {
        Self {
            cache,
            store,
            queue,
            retry,
            config,
        }
    }

    pub fn config(&self) -> &FlushConfig {
        &self.config
    }

    /// Persist the cache value behind one marker. Safe to apply any number
    /// of times.
    pub async fn flush_marker(&self, marker: &DirtyMarker) -> Result<FlushOutcome> {
        let key = &marker.key;
        let context = format!("flush {}", key);
        let cache = &self.cache;
        let store = &self.store;

        let cached = self.retry.run(&context, move || cache.get(key)).await?;
        if let Some(entry) = cached.filter(|entry| entry.version >= marker.version) {
            let version = entry.version;
            let payload = entry.payload;
            let outcome = self
                .retry
                .run(&context, move || {
                    store.put(
                        key,
                        StoredCuboid {
                            payload: payload.clone(),
                            version,
                        },
                    )
                })
                .await?;
            return Ok(match outcome {
                PutOutcome::Written => FlushOutcome::Persisted { version },
                PutOutcome::Unchanged | PutOutcome::Stale { .. } => FlushOutcome::AlreadyDurable,
            });
        }

        let durable = self.retry.run(&context, move || store.index_entry(key)).await?;
        match durable {
            Some(entry) if entry.version >= marker.version => Ok(FlushOutcome::AlreadyDurable),
            _ => Err(SpatialError::unavailable(
                context,
                format!("version {} is neither cached nor durable", marker.version),
            )),
        }
    }

    /// Receive and settle at most one marker.
    pub async fn process_next(&self) -> Result<FlushStep> {
        let Some(delivery) = self.queue.receive().await? else {
            return Ok(FlushStep::Idle);
        };
        let marker = &delivery.body;

        match self.flush_marker(marker).await {
            Ok(outcome) => {
                self.queue.ack(delivery.receipt).await?;
                debug!(key = %marker.key, version = marker.version, ?outcome, "marker flushed");
                Ok(FlushStep::Flushed(outcome))
            }
            Err(e) if e.is_client_error() || delivery.attempts >= self.config.max_attempts => {
                self.queue.dead_letter(delivery.receipt).await?;
                error!(
                    key = %marker.key,
                    version = marker.version,
                    attempts = delivery.attempts,
                    error = %e,
                    "marker dead-lettered; cuboid is not durable"
                );
                Ok(FlushStep::DeadLettered)
            }
            Err(e) => {
                let delay = self.config.requeue_delay(delivery.attempts);
                self.queue.nack(delivery.receipt, delay).await?;
                warn!(
                    key = %marker.key,
                    version = marker.version,
                    attempts = delivery.attempts,
                    error = %e,
                    "flush failed, marker requeued"
                );
                Ok(FlushStep::Requeued {
                    attempts: delivery.attempts,
                })
            }
        }
    }

    /// Process markers until none is visible.
    pub async fn drain(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        loop {
            match self.process_next().await? {
                FlushStep::Idle => return Ok(report),
                FlushStep::Flushed(_) => report.flushed += 1,
                FlushStep::Requeued { .. } => report.requeued += 1,
                FlushStep::DeadLettered => report.dead_lettered += 1,
            }
        }
    }
}

/// Fixed set of tokio tasks running a [`FlushWorker`]
pub struct FlushPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl FlushPool {
    /// Spawn `workers` tasks polling the queue until shutdown
    pub fn spawn(worker: Arc<FlushWorker>, workers: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        let handles = (0..workers.max(1))
            .map(|id| {
                let worker = Arc::clone(&worker);
                let stop = shutdown.subscribe();
                tokio::spawn(run_worker(id, worker, stop))
            })
            .collect();
        info!(workers, "flush pool started");
        Self { shutdown, handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stop polling and wait for every worker to finish its current marker.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "flush worker ended abnormally");
            }
        }
        info!("flush pool stopped");
    }
}

async fn run_worker(id: usize, worker: Arc<FlushWorker>, mut stop: watch::Receiver<bool>) {
    let poll = worker.config().poll_interval();
    loop {
        if *stop.borrow() {
            break;
        }
        let idle = match worker.process_next().await {
            Ok(FlushStep::Idle) => true,
            Ok(_) => false,
            Err(e) => {
                warn!(worker = id, error = %e, "flush queue unavailable");
                true
            }
        };
        if idle {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
    debug!(worker = id, "flush worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CachedCuboid, MemoryCache};
    use crate::codec::Codec;
    use crate::index::CuboidIndexer;
    use crate::io::MemoryIOManager;
    use crate::layout::GridCoord;
    use crate::queue::MemoryQueue;
    use crate::store::{BlobObjectStore, IndexEntry};
    use crate::types::{DataType, VolumeIdentity};
    use bytes::Bytes;
    use std::time::Duration;

    struct Harness {
        cache: Arc<MemoryCache>,
        store: Arc<BlobObjectStore>,
        queue: Arc<MemoryQueue<DirtyMarker>>,
        worker: Arc<FlushWorker>,
    }

    fn harness() -> Harness {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(BlobObjectStore::new(Arc::new(MemoryIOManager::new())));
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
        let config = FlushConfig {
            max_attempts: 2,
            requeue_delay_ms: 0,
            poll_interval_ms: 5,
            ..FlushConfig::default()
        };
        let retry = RetryPolicy {
            max_attempts: 1,
            base_backoff_ms: 1,
            attempt_timeout_ms: 1_000,
        };
        let worker = Arc::new(FlushWorker::new(
            cache.clone(),
            store.clone(),
            queue.clone(),
            retry,
            config,
        ));
        Harness {
            cache,
            store,
            queue,
            worker,
        }
    }

    fn key(x: u64) -> CuboidKey {
        CuboidIndexer::new(4)
            .key_for(&VolumeIdentity::new("c", "e", "ch"), 0, GridCoord::new(x, 0, 0), 0)
            .unwrap()
    }

    fn cached(fill: u8, version: u64) -> CachedCuboid {
        CachedCuboid {
            payload: Bytes::from(Codec::default().encode_bytes(DataType::U8, &[fill; 32]).unwrap()),
            version,
        }
    }

    /// Store that refuses every write as a bad request
    struct RejectingStore;

    #[async_trait::async_trait]
    impl ObjectStore for RejectingStore {
        async fn get(&self, _key: &CuboidKey) -> Result<Option<StoredCuboid>> {
            Ok(None)
        }

        async fn put(&self, key: &CuboidKey, _cuboid: StoredCuboid) -> Result<PutOutcome> {
            Err(SpatialError::InvalidCoordinate(format!("{} rejected", key)))
        }

        async fn index_entry(&self, _key: &CuboidKey) -> Result<Option<IndexEntry>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_client_error_dead_letters_immediately() {
        let h = harness();
        let worker = FlushWorker::new(
            h.cache.clone(),
            Arc::new(RejectingStore),
            h.queue.clone(),
            RetryPolicy::none(),
            FlushConfig {
                max_attempts: 5,
                ..FlushConfig::default()
            },
        );
        h.cache.commit(vec![(key(0), cached(7, 10))]).await.unwrap();
        h.queue.send(DirtyMarker::new(key(0), 10)).await.unwrap();

        assert_eq!(worker.process_next().await.unwrap(), FlushStep::DeadLettered);
        assert_eq!(h.queue.depth().await.unwrap().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_flush_persists_cached_value() {
        let h = harness();
        h.cache.commit(vec![(key(0), cached(7, 10))]).await.unwrap();
        h.queue.send(DirtyMarker::new(key(0), 10)).await.unwrap();

        assert_eq!(
            h.worker.process_next().await.unwrap(),
            FlushStep::Flushed(FlushOutcome::Persisted { version: 10 })
        );
        let stored = h.store.get(&key(0)).await.unwrap().unwrap();
        assert_eq!(stored.version, 10);
        assert_eq!(stored.payload, cached(7, 10).payload);
        assert_eq!(h.queue.depth().await.unwrap().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_reapplying_marker_is_idempotent() {
        let h = harness();
        h.cache.commit(vec![(key(0), cached(1, 5))]).await.unwrap();
        let marker = DirtyMarker::new(key(0), 5);

        assert!(matches!(
            h.worker.flush_marker(&marker).await.unwrap(),
            FlushOutcome::Persisted { .. }
        ));
        assert_eq!(h.worker.flush_marker(&marker).await.unwrap(), FlushOutcome::AlreadyDurable);
        assert_eq!(h.store.get(&key(0)).await.unwrap().unwrap().version, 5);
    }

    #[tokio::test]
    async fn test_older_marker_flushes_newest_cached_version() {
        let h = harness();
        h.cache.commit(vec![(key(0), cached(2, 20))]).await.unwrap();
        h.queue
            .send_batch(vec![DirtyMarker::new(key(0), 10), DirtyMarker::new(key(0), 20)])
            .await
            .unwrap();

        let report = h.worker.drain().await.unwrap();
        assert_eq!(report.flushed, 2);
        assert_eq!(h.store.get(&key(0)).await.unwrap().unwrap().version, 20);
    }

    #[tokio::test]
    async fn test_missing_cache_entry_acked_when_durable() {
        let h = harness();
        h.cache.commit(vec![(key(0), cached(1, 3))]).await.unwrap();
        h.worker.flush_marker(&DirtyMarker::new(key(0), 3)).await.unwrap();
        h.cache.clear();

        assert_eq!(
            h.worker.flush_marker(&DirtyMarker::new(key(0), 3)).await.unwrap(),
            FlushOutcome::AlreadyDurable
        );
    }

    #[tokio::test]
    async fn test_repeated_failure_dead_letters() {
        let h = harness();
        h.queue.send(DirtyMarker::new(key(1), 9)).await.unwrap();

        assert_eq!(
            h.worker.process_next().await.unwrap(),
            FlushStep::Requeued { attempts: 1 }
        );
        assert_eq!(h.worker.process_next().await.unwrap(), FlushStep::DeadLettered);
        assert_eq!(h.queue.dead_letters().len(), 1);

        // Once the value is back in cache the marker can be replayed.
        h.cache.commit(vec![(key(1), cached(4, 9))]).await.unwrap();
        assert_eq!(h.queue.redrive_dead_letters().await.unwrap(), 1);
        assert_eq!(h.worker.drain().await.unwrap().flushed, 1);
        assert!(h.store.exists(&key(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_pool_flushes_and_shuts_down() {
        let h = harness();
        let batch: Vec<(CuboidKey, CachedCuboid)> = (0..8).map(|x| (key(x), cached(x as u8, 1))).collect();
        h.cache.commit(batch).await.unwrap();
        h.queue
            .send_batch((0..8).map(|x| DirtyMarker::new(key(x), 1)).collect())
            .await
            .unwrap();

        let pool = FlushPool::spawn(h.worker.clone(), 3);
        assert_eq!(pool.size(), 3);
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.queue.depth().await.unwrap().outstanding() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        pool.shutdown().await;

        for x in 0..8 {
            assert!(h.store.exists(&key(x)).await.unwrap());
        }
    }
}
