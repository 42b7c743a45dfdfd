//! Durable object store: authoritative cuboid payloads plus a secondary index
//! mapping each cuboid key to its storage location and version.

use crate::codec::PayloadHeader;
use crate::error::{Result, SpatialError};
use crate::index::CuboidKey;
use crate::io::IOManager;
use crate::locks::KeyLocks;
use crate::utils::{calculate_checksum, verify_checksum};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Index re-reads allowed when a payload vanishes under a concurrent put
const INDEX_REREADS: usize = 3;

/// A compressed cuboid as held in the durable store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCuboid {
    pub payload: Bytes,
    pub version: u64,
}

/// Row of the secondary index table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: CuboidKey,
    /// Object path of the payload
    pub location: String,
    pub version: u64,
    pub compressed_len: u64,
    pub uncompressed_len: u64,
    pub checksum: u32,
    pub stored_at: DateTime<Utc>,
}

/// Result of a versioned put
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The payload is now the durable copy
    Written,
    /// The store already held this exact version
    Unchanged,
    /// The store holds a newer version; nothing was written
    Stale { current: u64 },
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &CuboidKey) -> Result<Option<StoredCuboid>>;

    /// Last-writer-wins by version: a put never replaces a newer version.
    async fn put(&self, key: &CuboidKey, cuboid: StoredCuboid) -> Result<PutOutcome>;

    /// Index lookup without fetching the payload.
    async fn index_entry(&self, key: &CuboidKey) -> Result<Option<IndexEntry>>;

    async fn exists(&self, key: &CuboidKey) -> Result<bool> {
        Ok(self.index_entry(key).await?.is_some())
    }
}

/// [`ObjectStore`] laid out on any [`IOManager`]:
///
/// * `cuboids/<key path>.v<version>` - payloads
/// * `index/<key path>.json` - index entries
pub struct BlobObjectStore {
    io: Arc<dyn IOManager>,
    locks: KeyLocks,
}

impl BlobObjectStore {
    /// Create a store laid out on `io`
    pub fn new(io: Arc<dyn IOManager>) -> Self {
        Self {
            io,
            locks: KeyLocks::new(),
        }
    }

    fn payload_path(key: &CuboidKey, version: u64) -> String {
        format!("cuboids/{}.v{}", key.object_path(), version)
    }

    fn index_path(key: &CuboidKey) -> String {
        format!("index/{}.json", key.object_path())
    }

    async fn read_index(&self, key: &CuboidKey) -> Result<Option<IndexEntry>> {
        match self.io.read(&Self::index_path(key)).await? {
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| SpatialError::corrupt(format!("index entry {}", key), e)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ObjectStore for BlobObjectStore {
    async fn get(&self, key: &CuboidKey) -> Result<Option<StoredCuboid>> {
        let Some(mut entry) = self.read_index(key).await? else {
            return Ok(None);
        };
        for _ in 0..INDEX_REREADS {
            if let Some(payload) = self.io.read(&entry.location).await? {
                if !verify_checksum(&payload, entry.checksum) {
                    return Err(SpatialError::corrupt(format!("cuboid {}", key), "checksum mismatch"));
                }
                return Ok(Some(StoredCuboid {
                    payload,
                    version: entry.version,
                }));
            }
            // A put may have superseded and removed the payload since the
            // index was read.
            match self.read_index(key).await? {
                Some(next) if next.location != entry.location => {
                    debug!(key = %key, from = entry.version, to = next.version, "index moved, rereading");
                    entry = next;
                }
                _ => {
                    return Err(SpatialError::corrupt(
                        format!("cuboid {}", key),
                        format!("index points at missing object {}", entry.location),
                    ))
                }
            }
        }
        Err(SpatialError::unavailable(
            format!("cuboid {}", key),
            "index kept moving under concurrent puts",
        ))
    }

    async fn put(&self, key: &CuboidKey, cuboid: StoredCuboid) -> Result<PutOutcome> {
        let _guard = self.locks.lock(&key.to_string()).await;

        let previous = self.read_index(key).await?;
        if let Some(current) = &previous {
            if current.version > cuboid.version {
                debug!(key = %key, current = current.version, incoming = cuboid.version, "stale put ignored");
                return Ok(PutOutcome::Stale {
                    current: current.version,
                });
            }
            if current.version == cuboid.version {
                return Ok(PutOutcome::Unchanged);
            }
        }

        let header = PayloadHeader::parse(&cuboid.payload)?;
        let location = Self::payload_path(key, cuboid.version);
        self.io.write(&location, &cuboid.payload).await?;

        let entry = IndexEntry {
            key: key.clone(),
            location,
            version: cuboid.version,
            compressed_len: cuboid.payload.len() as u64,
            uncompressed_len: header.uncompressed_len,
            checksum: calculate_checksum(&cuboid.payload),
            stored_at: Utc::now(),
        };
        self.io
            .write(&Self::index_path(key), &serde_json::to_vec(&entry)?)
            .await?;

        if let Some(old) = previous {
            if let Err(e) = self.io.delete(&old.location).await {
                warn!(key = %key, location = %old.location, error = %e, "failed to remove superseded payload");
            }
        }
        Ok(PutOutcome::Written)
    }

    async fn index_entry(&self, key: &CuboidKey) -> Result<Option<IndexEntry>> {
        self.read_index(key).await
    }
}
