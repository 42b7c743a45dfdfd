//! Write-back behaviour: idempotent flushes, last-writer-wins, dead letters
//! and the worker pool.

use spatialdb::flush::{DirtyMarker, FlushOutcome, FlushStep};
use spatialdb::io::MemoryIOManager;
use spatialdb::{
    BlobObjectStore, CuboidShape, CutoutEngine, CutoutRange, CutoutRequest, DataType, EngineConfig, FlushConfig,
    FlushPool, MemoryCache, MemoryQueue, ObjectStore, RetryPolicy, VolumeIdentity, VoxelBuffer, WorkQueue,
};
use std::sync::Arc;
use std::time::Duration;

struct Stack {
    io: Arc<MemoryIOManager>,
    cache: Arc<MemoryCache>,
    store: Arc<BlobObjectStore>,
    queue: Arc<MemoryQueue<DirtyMarker>>,
    engine: Arc<CutoutEngine>,
}

fn stack() -> Stack {
    let config = EngineConfig::new()
        .with_cuboid_shape(CuboidShape::new(8, 8, 2))
        .with_retry(RetryPolicy {
            max_attempts: 1,
            base_backoff_ms: 1,
            attempt_timeout_ms: 1_000,
        })
        .with_flush(FlushConfig {
            workers: 2,
            max_attempts: 3,
            requeue_delay_ms: 0,
            poll_interval_ms: 5,
            ..FlushConfig::default()
        });
    let io = Arc::new(MemoryIOManager::new());
    let cache = Arc::new(MemoryCache::new());
    let store = Arc::new(BlobObjectStore::new(io.clone()));
    let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
    let engine = Arc::new(CutoutEngine::new(config, cache.clone(), store.clone(), queue.clone()).unwrap());
    Stack {
        io,
        cache,
        store,
        queue,
        engine,
    }
}

fn request(x: &str) -> CutoutRequest {
    CutoutRequest::new(
        VolumeIdentity::new("c", "e", "ch"),
        0,
        CutoutRange::parse(x, "0:8", "0:2", None).unwrap(),
        DataType::U8,
    )
}

fn filled(req: &CutoutRequest, value: u8) -> VoxelBuffer {
    let shape = req.range.shape();
    VoxelBuffer::from_voxels(shape, &vec![value; shape.iter().product()]).unwrap()
}

#[tokio::test]
async fn test_flush_is_idempotent() {
    let s = stack();
    let req = request("0:8");
    s.engine.write_cutout(&req, filled(&req, 1)).await.unwrap();

    let delivery = s.queue.receive().await.unwrap().unwrap();
    let marker = delivery.body.clone();
    let worker = s.engine.flush_worker();
    assert!(matches!(
        worker.flush_marker(&marker).await.unwrap(),
        FlushOutcome::Persisted { .. }
    ));
    let first = s.store.index_entry(&marker.key).await.unwrap().unwrap();

    for _ in 0..3 {
        assert_eq!(worker.flush_marker(&marker).await.unwrap(), FlushOutcome::AlreadyDurable);
    }
    let again = s.store.index_entry(&marker.key).await.unwrap().unwrap();
    assert_eq!(first.version, again.version);
    assert_eq!(first.location, again.location);
}

#[tokio::test]
async fn test_newest_write_wins_regardless_of_marker_order() {
    let s = stack();
    let req = request("0:8");
    let first = s.engine.write_cutout(&req, filled(&req, 1)).await.unwrap();
    let second = s.engine.write_cutout(&req, filled(&req, 2)).await.unwrap();
    assert!(second.version > first.version);

    let report = s.engine.flush_worker().drain().await.unwrap();
    assert_eq!(report.flushed, 2);

    assert!(s.queue.dead_letters().is_empty());
    s.cache.clear();
    assert_eq!(s.engine.read_cutout(&req).await.unwrap(), filled(&req, 2));
}

#[tokio::test]
async fn test_store_outage_dead_letters_then_redrives() {
    let s = stack();
    let req = request("0:16");
    s.engine.write_cutout(&req, filled(&req, 7)).await.unwrap();
    s.io.set_offline(true);

    let worker = s.engine.flush_worker();
    let mut steps = Vec::new();
    loop {
        match worker.process_next().await.unwrap() {
            FlushStep::Idle => break,
            step => steps.push(step),
        }
    }
    let dead = steps.iter().filter(|step| **step == FlushStep::DeadLettered).count();
    assert_eq!(dead, 2);
    assert_eq!(steps.len(), 2 * 3);
    assert_eq!(s.queue.depth().await.unwrap().dead_lettered, 2);

    // The writes are still served from the cache meanwhile.
    assert_eq!(s.engine.read_cutout(&req).await.unwrap(), filled(&req, 7));

    s.io.set_offline(false);
    assert_eq!(s.queue.redrive_dead_letters().await.unwrap(), 2);
    assert_eq!(worker.drain().await.unwrap().flushed, 2);

    s.cache.clear();
    assert_eq!(s.engine.read_cutout(&req).await.unwrap(), filled(&req, 7));
}

#[tokio::test]
async fn test_pool_persists_concurrent_writes() {
    let s = stack();
    let pool = FlushPool::spawn(Arc::new(s.engine.flush_worker()), s.engine.config().flush.workers);

    let mut writes = Vec::new();
    for i in 0..6u8 {
        let engine = Arc::clone(&s.engine);
        writes.push(tokio::spawn(async move {
            let x = format!("{}:{}", i as u64 * 8, i as u64 * 8 + 8);
            let req = request(&x);
            engine.write_cutout(&req, filled(&req, i + 1)).await.unwrap();
        }));
    }
    for write in writes {
        write.await.unwrap();
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while s.queue.depth().await.unwrap().outstanding() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    pool.shutdown().await;

    s.cache.clear();
    for i in 0..6u8 {
        let x = format!("{}:{}", i as u64 * 8, i as u64 * 8 + 8);
        let req = request(&x);
        assert_eq!(s.engine.read_cutout(&req).await.unwrap(), filled(&req, i + 1));
    }
}
