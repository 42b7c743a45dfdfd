//! End-to-end cutout reads and writes through the cache, the durable store
//! and the flush queue.

use spatialdb::{
    flush::DirtyMarker, AxisRange, BlobObjectStore, CuboidShape, CutoutEngine, CutoutRange, CutoutRequest,
    DataType, EngineConfig, MemoryCache, MemoryQueue, RetryPolicy, SpatialError, TransferEncoding,
    VolumeIdentity, VoxelBuffer, WorkQueue,
};
use spatialdb::io::create_io_manager;
use std::sync::Arc;
use tempfile::TempDir;

struct Stack {
    _dir: TempDir,
    cache: Arc<MemoryCache>,
    queue: Arc<MemoryQueue<DirtyMarker>>,
    engine: Arc<CutoutEngine>,
}

fn stack(shape: CuboidShape) -> Stack {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::new()
        .with_cuboid_shape(shape)
        .with_retry(RetryPolicy {
            max_attempts: 2,
            base_backoff_ms: 1,
            attempt_timeout_ms: 5_000,
        });
    let cache = Arc::new(MemoryCache::new());
    let url = format!("file://{}", dir.path().display());
    let store = Arc::new(BlobObjectStore::new(create_io_manager(&url).unwrap()));
    let queue = Arc::new(MemoryQueue::new(config.flush.visibility_timeout()));
    let engine = Arc::new(CutoutEngine::new(config, cache.clone(), store, queue.clone()).unwrap());
    Stack {
        _dir: dir,
        cache,
        queue,
        engine,
    }
}

fn identity() -> VolumeIdentity {
    VolumeIdentity::new("mouse", "v1", "em")
}

fn request(range: CutoutRange, data_type: DataType) -> CutoutRequest {
    CutoutRequest::new(identity(), 0, range, data_type)
}

fn pattern_u8(shape: [usize; 4], seed: usize) -> VoxelBuffer {
    let n: usize = shape.iter().product();
    let voxels: Vec<u8> = (0..n).map(|i| ((i * 7 + seed) % 254) as u8 + 1).collect();
    VoxelBuffer::from_voxels(shape, &voxels).unwrap()
}

#[tokio::test]
async fn test_unaligned_write_across_eight_default_cuboids() {
    let s = stack(CuboidShape::default());
    let range = CutoutRange::parse("100:600", "450:750", "20:37", None).unwrap();
    let data = pattern_u8(range.shape(), 3);

    let receipt = s.engine.write_cutout(&request(range, DataType::U8), data.clone()).await.unwrap();
    assert_eq!(receipt.cuboids, 8);
    assert_eq!(s.queue.depth().await.unwrap().pending, 8);

    let read = s.engine.read_cutout(&request(range, DataType::U8)).await.unwrap();
    assert_eq!(read, data);

    // Everything else in the touched cuboids is still background.
    let touched = CutoutRange::parse("0:1024", "0:1024", "16:48", None).unwrap();
    let whole = s.engine.read_cutout(&request(touched, DataType::U8)).await.unwrap();
    let voxels: Vec<u8> = whole.to_voxels().unwrap();
    let nonzero = voxels.iter().filter(|&&v| v != 0).count();
    assert_eq!(nonzero, 500 * 300 * 17);
    let [_, _, y, x] = touched.shape();
    let at = |z: usize, yy: usize, xx: usize| voxels[((z - 16) * y + yy) * x + xx];
    assert_eq!(at(20, 450, 100), 4);
    assert_ne!(at(36, 749, 599), 0);
    assert_eq!(at(19, 450, 100), 0);
    assert_eq!(at(37, 749, 599), 0);
    assert_eq!(at(20, 449, 100), 0);
    assert_eq!(at(20, 450, 600), 0);
}

#[tokio::test]
async fn test_time_range_write_then_read() {
    let s = stack(CuboidShape::new(32, 32, 4).with_time_bucket(2));
    let range = CutoutRange::parse("5:40", "0:10", "2:7", Some("200:203")).unwrap();
    let n: usize = range.shape().iter().product();
    let voxels: Vec<u16> = (0..n).map(|i| (i as u16).wrapping_mul(31).wrapping_add(1)).collect();
    let data = VoxelBuffer::from_voxels(range.shape(), &voxels).unwrap();

    let receipt = s.engine.write_cutout(&request(range, DataType::U16), data.clone()).await.unwrap();
    // x: 2 cells, y: 1, z: 2, t: buckets 100 and 101
    assert_eq!(receipt.cuboids, 2 * 2 * 2);
    assert_eq!(s.engine.read_cutout(&request(range, DataType::U16)).await.unwrap(), data);

    let before = CutoutRange::parse("5:40", "0:10", "2:7", Some("199:200")).unwrap();
    assert!(s
        .engine
        .read_cutout(&request(before, DataType::U16))
        .await
        .unwrap()
        .is_background());

    // No time range means time index 0, which was never written.
    let untimed = CutoutRange::parse("5:40", "0:10", "2:7", None).unwrap();
    assert!(s
        .engine
        .read_cutout(&request(untimed, DataType::U16))
        .await
        .unwrap()
        .is_background());
}

#[tokio::test]
async fn test_partial_time_range_inside_bucket() {
    let s = stack(CuboidShape::new(16, 16, 4).with_time_bucket(4));
    let full = CutoutRange::parse("0:16", "0:16", "0:4", Some("0:4")).unwrap();
    let base = pattern_u8(full.shape(), 11);
    s.engine.write_cutout(&request(full, DataType::U8), base.clone()).await.unwrap();

    let slice = CutoutRange::parse("0:16", "0:16", "0:4", Some("1:2")).unwrap();
    let patch = VoxelBuffer::from_voxels(slice.shape(), &vec![0xAAu8; 16 * 16 * 4]).unwrap();
    s.engine.write_cutout(&request(slice, DataType::U8), patch.clone()).await.unwrap();

    assert_eq!(s.engine.read_cutout(&request(slice, DataType::U8)).await.unwrap(), patch);
    let t0 = CutoutRange::parse("0:16", "0:16", "0:4", Some("0:1")).unwrap();
    let expected = base.crop(&spatialdb::layout::Block::new([0; 4], t0.shape())).unwrap();
    assert_eq!(s.engine.read_cutout(&request(t0, DataType::U8)).await.unwrap(), expected);
}

#[tokio::test]
async fn test_every_data_type_round_trips() {
    let s = stack(CuboidShape::new(8, 8, 2));
    let range = CutoutRange::parse("3:12", "1:4", "1:3", None).unwrap();
    let shape = range.shape();
    let n: usize = shape.iter().product();

    let buffers = vec![
        VoxelBuffer::from_voxels(shape, &(0..n).map(|i| i as u8).collect::<Vec<_>>()).unwrap(),
        VoxelBuffer::from_voxels(shape, &(0..n).map(|i| (i as u16) << 7).collect::<Vec<_>>()).unwrap(),
        VoxelBuffer::from_voxels(shape, &(0..n).map(|i| (i as u32) * 65_537).collect::<Vec<_>>()).unwrap(),
        VoxelBuffer::from_voxels(shape, &(0..n).map(|i| (i as u64) << 40).collect::<Vec<_>>()).unwrap(),
        VoxelBuffer::from_voxels(shape, &(0..n).map(|i| i as f32 * -0.5).collect::<Vec<_>>()).unwrap(),
    ];
    for (channel, data) in buffers.into_iter().enumerate() {
        let req = CutoutRequest::new(
            VolumeIdentity::new("mouse", "v1", format!("ch{}", channel)),
            0,
            range,
            data.data_type(),
        );
        s.engine.write_cutout(&req, data.clone()).await.unwrap();
        assert_eq!(s.engine.read_cutout(&req).await.unwrap(), data);
    }
}

#[tokio::test]
async fn test_concurrent_overlapping_writers_lose_nothing() {
    let s = stack(CuboidShape::new(16, 16, 4));
    let mut tasks = Vec::new();
    for i in 0..16u64 {
        let engine = Arc::clone(&s.engine);
        tasks.push(tokio::spawn(async move {
            // Each writer owns a 4x4 column but every write straddles the
            // same two cuboids along z.
            let (x, y) = ((i % 4) * 4, (i / 4) * 4);
            let range = CutoutRange::new(
                AxisRange::new(x, x + 4).unwrap(),
                AxisRange::new(y, y + 4).unwrap(),
                AxisRange::new(2, 6).unwrap(),
            );
            let data = VoxelBuffer::from_voxels(range.shape(), &[i as u8 + 1; 64]).unwrap();
            engine.write_cutout(&request(range, DataType::U8), data).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let range = CutoutRange::parse("0:16", "0:16", "2:6", None).unwrap();
    let voxels: Vec<u8> = s.engine.read_cutout(&request(range, DataType::U8)).await.unwrap().to_voxels().unwrap();
    for (idx, v) in voxels.iter().enumerate() {
        let (y, x) = ((idx / 16) % 16, idx % 16);
        let writer = (y / 4) * 4 + x / 4;
        assert_eq!(*v as usize, writer + 1, "voxel y={} x={}", y, x);
    }
}

#[tokio::test]
async fn test_request_validation() {
    let s = stack(CuboidShape::new(8, 8, 2));
    assert!(matches!(AxisRange::from_signed(-5, 10), Err(SpatialError::InvalidRange(_))));
    assert!(matches!(AxisRange::parse("10:10"), Err(SpatialError::InvalidRange(_))));

    let range = CutoutRange::parse("0:8", "0:8", "0:2", None).unwrap();
    let wrong_depth = VoxelBuffer::zeros(DataType::U16, range.shape()).unwrap();
    assert!(matches!(
        s.engine.write_cutout(&request(range, DataType::U8), wrong_depth).await,
        Err(SpatialError::TypeMismatch { .. })
    ));
    let wrong_dims = VoxelBuffer::zeros(DataType::U8, [1, 2, 8, 7]).unwrap();
    assert!(matches!(
        s.engine.write_cutout(&request(range, DataType::U8), wrong_dims).await,
        Err(SpatialError::InvalidRange(_))
    ));
    assert_eq!(s.queue.depth().await.unwrap().pending, 0);
}

#[tokio::test]
async fn test_size_ceiling_rejected_without_io() {
    let s = stack(CuboidShape::default());
    let range = CutoutRange::parse("0:2048", "0:2048", "0:512", None).unwrap();
    let err = s.engine.read_cutout(&request(range, DataType::U8)).await.unwrap_err();
    assert!(matches!(err, SpatialError::PayloadTooLarge { .. }));
    assert!(err.is_client_error());
    assert_eq!(s.cache.stats().reads, 0);
}

#[tokio::test]
async fn test_transfer_encodings_decode_identically() {
    let s = stack(CuboidShape::new(8, 8, 2));
    let range = CutoutRange::parse("1:20", "2:9", "0:3", None).unwrap();
    let data = pattern_u8(range.shape(), 5);
    let req = request(range, DataType::U8);
    s.engine.write_cutout(&req, data.clone()).await.unwrap();

    for encoding in [
        TransferEncoding::RawCompressed,
        TransferEncoding::ArrayContainer,
        TransferEncoding::GzipArray,
    ] {
        let body = s.engine.read_cutout_encoded(&req, encoding).await.unwrap();
        assert_eq!(
            encoding.decode(&body, DataType::U8, range.shape()).unwrap(),
            data,
            "{}",
            encoding.media_type()
        );
    }
}

#[tokio::test]
async fn test_cache_loss_after_flush_recovers_from_store() {
    let s = stack(CuboidShape::new(8, 8, 2));
    let range = CutoutRange::parse("0:24", "0:8", "0:2", None).unwrap();
    let data = pattern_u8(range.shape(), 9);
    let req = request(range, DataType::U8);
    s.engine.write_cutout(&req, data.clone()).await.unwrap();

    let report = s.engine.flush_worker().drain().await.unwrap();
    assert_eq!(report.flushed, 3);
    assert_eq!(s.queue.depth().await.unwrap().outstanding(), 0);

    s.cache.clear();
    assert_eq!(s.engine.read_cutout(&req).await.unwrap(), data);
    assert_eq!(s.cache.len(), 3);
}
