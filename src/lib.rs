//! spatialdb - cuboid storage and cutout engine
//!
//! Stores multi-resolution X/Y/Z/T voxel volumes as fixed-size compressed
//! cuboids and serves arbitrary coordinate ranges ("cutouts") over them.
//!
//! # Features
//!
//! - Morton-ordered cuboid keys per collection/experiment/channel/resolution
//! - Byte-shuffled Zstd or Deflate cuboid payloads with exact round trip
//! - Cache tier in front of a durable object store with a secondary index
//! - Atomic multi-cuboid writes with asynchronous write-back through a flush queue
//! - Bulk ingest jobs with tile tasks and scoped upload credentials
//!
//! # Storage Backends
//!
//! The durable store lays cuboids out on any [`IOManager`]. A filesystem and
//! an in-memory backend are included; implement the trait for object stores
//! such as S3. Cache tiers and work queues are likewise traits
//! ([`CacheTier`], [`WorkQueue`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use spatialdb::{CutoutEngine, CutoutRequest, CutoutRange, DataType, VolumeIdentity};
//!
//! # async fn example(engine: CutoutEngine) -> spatialdb::Result<()> {
//! let range = CutoutRange::parse("100:600", "450:750", "20:37", None)?;
//! let request = CutoutRequest::new(VolumeIdentity::new("col", "exp", "em"), 0, range, DataType::U8);
//! let cutout = engine.read_cutout(&request).await?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod cache;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod flush;
pub mod index;
pub mod ingest;
pub mod io;
pub mod layout;
pub mod locks;
pub mod queue;
pub mod retry;
pub mod store;
pub mod transfer;
pub mod types;
pub mod utils;

// Re-exports
pub use buffer::VoxelBuffer;
pub use cache::{CacheTier, CachedCuboid, MemoryCache};
pub use codec::{Codec, CompressionLevel, CompressionMethod};
pub use config::{EngineConfig, FlushConfig, IngestConfig};
pub use engine::{CutoutEngine, CutoutRequest, WriteReceipt};
pub use error::{Result, SpatialError};
pub use flush::{DirtyMarker, FlushPool, FlushWorker};
pub use index::{CuboidIndexer, CuboidKey};
pub use ingest::{IngestJobManager, IngestJobRequest, JobStatus, LocalCredentialIssuer, TileCoord};
pub use io::{IOManager, StorageBackend};
pub use layout::{CuboidShape, GridCoord};
pub use queue::{MemoryQueue, WorkQueue};
pub use retry::RetryPolicy;
pub use store::{BlobObjectStore, ObjectStore};
pub use transfer::TransferEncoding;
pub use types::{AxisRange, CutoutRange, DataType, VolumeIdentity};

/// Version of the spatialdb crate
pub const SPATIALDB_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!SPATIALDB_VERSION.is_empty());
    }
}
