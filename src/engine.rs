//! Cutout engine: reads and writes arbitrary coordinate ranges by splitting
//! them into cuboids held in the cache tier and the durable store.

use crate::buffer::VoxelBuffer;
use crate::cache::{CacheTier, CachedCuboid};
use crate::codec::Codec;
use crate::config::EngineConfig;
use crate::error::{Result, SpatialError};
use crate::flush::{DirtyMarker, FlushQueue, FlushWorker};
use crate::index::{CuboidIndexer, CuboidKey};
use crate::layout::{cuboids_covering, CuboidOverlap};
use crate::locks::KeyLocks;
use crate::retry::RetryPolicy;
use crate::store::ObjectStore;
use crate::transfer::TransferEncoding;
use crate::types::{CutoutRange, DataType, VolumeIdentity};
use crate::utils::format_bytes;
use bytes::Bytes;
use chrono::Utc;
use futures::future::try_join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A pre-authorized cutout request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CutoutRequest {
    pub identity: VolumeIdentity,
    pub resolution: u32,
    pub range: CutoutRange,
    /// Channel data type
    pub data_type: DataType,
    /// Coordinate-frame extent the range must lie inside
    pub extent: Option<CutoutRange>,
}

impl CutoutRequest {
    /// Request with no coordinate-frame check
    pub fn new(identity: VolumeIdentity, resolution: u32, range: CutoutRange, data_type: DataType) -> Self {
        Self {
            identity,
            resolution,
            range,
            data_type,
            extent: None,
        }
    }

    /// Request against a channel described by its bit depth, as channel
    /// metadata records it.
    pub fn for_channel(identity: VolumeIdentity, resolution: u32, range: CutoutRange, bit_depth: u32) -> Result<Self> {
        Ok(Self::new(identity, resolution, range, DataType::from_bit_depth(bit_depth)?))
    }

    pub fn with_extent(mut self, extent: CutoutRange) -> Self {
        self.extent = Some(extent);
        self
    }
}

/// Outcome of a committed write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReceipt {
    /// Version stamped on every cuboid of the write
    pub version: u64,
    pub cuboids: usize,
}

/// Strictly increasing write versions: microseconds since the Unix epoch,
/// bumped when two writes land in the same microsecond.
#[derive(Debug, Default)]
pub struct VersionClock {
    last: AtomicU64,
}

impl VersionClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next version, strictly greater than any returned before
    pub fn next(&self) -> u64 {
        let now = Utc::now().timestamp_micros().max(0) as u64;
        let mut prev = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadMode {
    /// Cache failures degrade to the durable store; misses repopulate the cache
    Read,
    /// Cache failures fail the write, since the cache may hold unflushed data
    Merge,
}

pub struct CutoutEngine {
    config: EngineConfig,
    indexer: CuboidIndexer,
    codec: Codec,
    cache: Arc<dyn CacheTier>,
    store: Arc<dyn ObjectStore>,
    flush_queue: Arc<FlushQueue>,
    locks: KeyLocks,
    clock: VersionClock,
}

impl CutoutEngine {
    /// Build an engine over the given tiers. Fails on an invalid config.
    pub fn new(
        config: EngineConfig,
        cache: Arc<dyn CacheTier>,
        store: Arc<dyn ObjectStore>,
        flush_queue: Arc<FlushQueue>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            indexer: CuboidIndexer::new(config.max_resolution),
            codec: config.codec(),
            config,
            cache,
            store,
            flush_queue,
            locks: KeyLocks::new(),
            clock: VersionClock::new(),
        })
    }

    /// Get the engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn indexer(&self) -> &CuboidIndexer {
        &self.indexer
    }

    pub fn flush_queue(&self) -> Arc<FlushQueue> {
        Arc::clone(&self.flush_queue)
    }

    /// A write-back worker sharing this engine's cache, store and queue.
    pub fn flush_worker(&self) -> FlushWorker {
        FlushWorker::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.store),
            Arc::clone(&self.flush_queue),
            self.config.retry.clone(),
            self.config.flush.clone(),
        )
    }

    /// Request checks that need no I/O.
    fn check_request(&self, request: &CutoutRequest) -> Result<()> {
        let range = &request.range;
        range.validate()?;
        self.indexer.check_addressable(range, &self.config.cuboid_shape)?;
        if let Some(extent) = &request.extent {
            if !extent.contains(range) {
                return Err(SpatialError::InvalidRange(format!(
                    "{} lies outside the coordinate frame {}",
                    range, extent
                )));
            }
        }
        let limit = self.config.max_cutout_bytes;
        match range.byte_size(request.data_type) {
            Some(bytes) if bytes <= limit => Ok(()),
            requested => Err(SpatialError::PayloadTooLarge {
                requested: requested.map_or_else(|| "more than 16 EiB".to_string(), format_bytes),
                limit: format_bytes(limit),
            }),
        }
    }

    /// Covering cuboids of a checked request, each with its key.
    fn plan(&self, request: &CutoutRequest) -> Result<Vec<(CuboidOverlap, CuboidKey)>> {
        self.check_request(request)?;
        cuboids_covering(&request.range, &self.config.cuboid_shape)
            .into_iter()
            .map(|overlap| {
                let key = self.indexer.key_for(
                    &request.identity,
                    request.resolution,
                    overlap.grid,
                    overlap.time_bucket,
                )?;
                Ok((overlap, key))
            })
            .collect()
    }

    /// Fetch and decode one whole cuboid: cache, then durable store. `None`
    /// means the cuboid was never written.
    async fn load_cuboid(
        &self,
        key: &CuboidKey,
        data_type: DataType,
        mode: LoadMode,
    ) -> Result<Option<VoxelBuffer>> {
        let dims = self.config.cuboid_shape.dims();
        let context = format!("cuboid {}", key);
        let retry = &self.config.retry;
        let cache = &self.cache;
        let store = &self.store;

        let cached = match retry.run(&context, move || cache.get(key)).await {
            Ok(cached) => cached,
            Err(e) if mode == LoadMode::Read => {
                warn!(key = %key, error = %e, "cache unavailable, reading durable store");
                None
            }
            Err(e) => return Err(e),
        };
        let mut cache_occupied = cached.is_some();
        if let Some(entry) = cached {
            match Codec::decode(&entry.payload, data_type, dims) {
                Ok(buffer) => return Ok(Some(buffer)),
                Err(e) => {
                    warn!(key = %key, version = entry.version, error = %e, "corrupt cached cuboid, refetching from durable store");
                    if mode == LoadMode::Read {
                        match self.cache.evict_version(key, entry.version).await {
                            Ok(evicted) => cache_occupied = !evicted,
                            Err(e) => warn!(key = %key, error = %e, "corrupt cached cuboid not evicted"),
                        }
                    }
                }
            }
        }

        let Some(stored) = retry.run(&context, move || store.get(key)).await? else {
            return Ok(None);
        };
        let buffer = Codec::decode(&stored.payload, data_type, dims)?;

        if mode == LoadMode::Read && !cache_occupied {
            let entry = CachedCuboid {
                payload: stored.payload,
                version: stored.version,
            };
            if let Err(e) = self.cache.put_if_absent(key, entry).await {
                warn!(key = %key, error = %e, "cache repopulation failed");
            }
        }
        Ok(Some(buffer))
    }

    /// Read a cutout. Never-written voxels read as zero.
    pub async fn read_cutout(&self, request: &CutoutRequest) -> Result<VoxelBuffer> {
        let plan = self.plan(request)?;
        let data_type = request.data_type;
        let mut out = VoxelBuffer::zeros(data_type, request.range.shape())?;

        let loaded = try_join_all(
            plan.iter()
                .map(|(_, key)| self.load_cuboid(key, data_type, LoadMode::Read)),
        )
        .await?;

        let mut found = 0;
        for ((overlap, _), cuboid) in plan.iter().zip(loaded) {
            if let Some(cuboid) = cuboid {
                out.copy_from(&cuboid, &overlap.local, overlap.cutout.start)?;
                found += 1;
            }
        }
        debug!(
            identity = %request.identity,
            resolution = request.resolution,
            range = %request.range,
            cuboids = plan.len(),
            found,
            "cutout read"
        );
        Ok(out)
    }

    /// Read a cutout and encode it for transfer.
    pub async fn read_cutout_encoded(&self, request: &CutoutRequest, encoding: TransferEncoding) -> Result<Bytes> {
        let buffer = self.read_cutout(request).await?;
        encoding.encode(&self.codec, &buffer)
    }

    /// Merged, encoded replacement for one cuboid touched by a write.
    async fn stage_cuboid(
        &self,
        overlap: &CuboidOverlap,
        key: &CuboidKey,
        source: &VoxelBuffer,
        version: u64,
    ) -> Result<(CuboidKey, CachedCuboid)> {
        let shape = &self.config.cuboid_shape;
        let data_type = source.data_type();
        let cuboid = if overlap.is_full(shape) {
            source.crop(&overlap.cutout)?
        } else {
            let mut existing = match self.load_cuboid(key, data_type, LoadMode::Merge).await? {
                Some(existing) => existing,
                None => VoxelBuffer::zeros(data_type, shape.dims())?,
            };
            existing.copy_from(source, &overlap.cutout, overlap.local.start)?;
            existing
        };
        let payload = self.codec.encode(&cuboid)?;
        Ok((
            key.clone(),
            CachedCuboid {
                payload: Bytes::from(payload),
                version,
            },
        ))
    }

    /// Write `buffer` over the request range. Either every touched cuboid is
    /// committed to the cache with a dirty marker queued, or none is.
    pub async fn write_cutout(&self, request: &CutoutRequest, buffer: VoxelBuffer) -> Result<WriteReceipt> {
        let plan = self.plan(request)?;
        if buffer.data_type() != request.data_type {
            return Err(SpatialError::TypeMismatch {
                expected: request.data_type.to_string(),
                actual: buffer.data_type().to_string(),
            });
        }
        let shape = request.range.shape();
        let expected: usize = shape.iter().product();
        if buffer.voxel_count() != expected {
            return Err(SpatialError::InvalidRange(format!(
                "buffer of shape {:?} does not fill {} ({} voxels)",
                buffer.shape(),
                request.range,
                expected
            )));
        }
        let buffer = if buffer.shape() == shape {
            buffer
        } else {
            VoxelBuffer::new(request.data_type, shape, buffer.into_bytes())?
        };

        let guards = self.locks.lock_all(plan.iter().map(|(_, key)| key.to_string())).await;
        let version = self.clock.next();

        let staged = try_join_all(
            plan.iter()
                .map(|(overlap, key)| self.stage_cuboid(overlap, key, &buffer, version)),
        )
        .await?;
        let cuboids = staged.len();

        // The commit runs to completion even if the caller goes away.
        let cache = Arc::clone(&self.cache);
        let queue = Arc::clone(&self.flush_queue);
        let retry = self.config.retry.clone();
        let commit = tokio::spawn(async move {
            let result = commit_staged(cache, queue, retry, staged, version).await;
            drop(guards);
            result
        });
        commit
            .await
            .map_err(|e| SpatialError::unavailable("write commit", e))??;

        info!(
            identity = %request.identity,
            resolution = request.resolution,
            range = %request.range,
            version,
            cuboids,
            "cutout written"
        );
        Ok(WriteReceipt { version, cuboids })
    }

    /// Decode a client body in `encoding` and write it.
    pub async fn write_cutout_encoded(
        &self,
        request: &CutoutRequest,
        body: &[u8],
        encoding: TransferEncoding,
    ) -> Result<WriteReceipt> {
        self.check_request(request)?;
        let buffer = encoding.decode(body, request.data_type, request.range.shape())?;
        self.write_cutout(request, buffer).await
    }
}

/// Cache batch commit, then marker enqueue. A failed enqueue rolls the cache
/// back to its prior entries.
async fn commit_staged(
    cache: Arc<dyn CacheTier>,
    queue: Arc<FlushQueue>,
    retry: RetryPolicy,
    staged: Vec<(CuboidKey, CachedCuboid)>,
    version: u64,
) -> Result<()> {
    let markers: Vec<DirtyMarker> = staged
        .iter()
        .map(|(key, _)| DirtyMarker::new(key.clone(), version))
        .collect();

    let prior = cache.commit(staged).await?;

    let queue = &queue;
    let markers = &markers;
    let enqueued = retry
        .run("flush enqueue", move || queue.send_batch(markers.clone()))
        .await;
    if let Err(e) = enqueued {
        warn!(version, error = %e, "dirty markers not queued, rolling back cache commit");
        if let Err(restore_error) = cache.restore(prior).await {
            error!(version, error = %restore_error, "cache rollback failed");
        }
        return Err(e);
    }
    Ok(())
}
