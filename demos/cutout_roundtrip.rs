//! Example: Write an unaligned cutout, flush it to disk and read it back cold
//!
//! Run with: cargo run --example cutout_roundtrip

use spatialdb::io::create_io_manager;
use spatialdb::utils::format_bytes;
use spatialdb::{
    BlobObjectStore, CutoutEngine, CutoutRange, CutoutRequest, EngineConfig, FlushPool, IOManager, MemoryCache,
    MemoryQueue, VolumeIdentity, VoxelBuffer, WorkQueue,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("spatialdb Example: Cutout Round Trip");
    println!("====================================\n");

    let config = EngineConfig::new();
    println!("Cuboid shape: {:?}", config.cuboid_shape.dims());
    println!("Compression: {:?}", config.compression);
    println!();

    // Durable cuboids go to a temp directory; implement IOManager for
    // object storage instead.
    let temp_dir = tempfile::tempdir()?;
    println!("Object store at: {}", temp_dir.path().display());
    let cache = Arc::new(MemoryCache::new());
    let io = create_io_manager(&format!("file://{}", temp_dir.path().display()))?;
    println!("Backend: {:?}", io.backend());
    let store = Arc::new(BlobObjectStore::new(io));
    let queue = Arc::new(MemoryQueue::new(config.flush.visibility_timeout()));
    let engine = Arc::new(CutoutEngine::new(config, cache.clone(), store, queue.clone())?);

    let pool = FlushPool::spawn(Arc::new(engine.flush_worker()), engine.config().flush.workers);
    println!("Flush pool running with {} workers\n", pool.size());

    // A region that straddles eight default cuboids
    let range = CutoutRange::parse("100:600", "450:750", "20:37", None)?;
    let shape = range.shape();
    let voxels: Vec<u16> = (0..shape.iter().product::<usize>())
        .map(|i| (i % 4096) as u16 + 1)
        .collect();
    let data = VoxelBuffer::from_voxels(shape, &voxels)?;
    // A 16-bit channel
    let request = CutoutRequest::for_channel(VolumeIdentity::new("demo", "session1", "em"), 0, range, 16)?;

    println!("Writing cutout {:?} ({})", shape, format_bytes(data.as_bytes().len() as u64));
    let receipt = engine.write_cutout(&request, data.clone()).await?;
    println!("  version {} across {} cuboids", receipt.version, receipt.cuboids);

    print!("Waiting for write-back...");
    while queue.depth().await?.outstanding() > 0 {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    println!(" done");
    pool.shutdown().await;

    let stats = cache.stats();
    println!("Cache: {} entries, {} reads, {} writes", cache.len(), stats.reads, stats.writes);

    // Drop the cache so the read has to come from disk.
    cache.clear();
    let read = engine.read_cutout(&request).await?;
    println!("Cold read returned {}", format_bytes(read.as_bytes().len() as u64));
    println!("Round trip matches: {}", read == data);

    let encoded = engine
        .read_cutout_encoded(&request, engine.config().ingest.tile_encoding)
        .await?;
    println!(
        "Encoded as {}: {}",
        engine.config().ingest.tile_encoding.media_type(),
        format_bytes(encoded.len() as u64)
    );

    println!("\nExample completed successfully!");
    Ok(())
}
