//! Engine configuration

use crate::codec::{Codec, CompressionLevel, CompressionMethod};
use crate::error::{Result, SpatialError};
use crate::layout::CuboidShape;
use crate::retry::RetryPolicy;
use crate::transfer::TransferEncoding;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default ceiling on a single cutout, uncompressed
pub const DEFAULT_MAX_CUTOUT_BYTES: u64 = 1 << 30;

/// Settings for the cutout engine and the services around it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cuboid_shape: CuboidShape,
    pub max_resolution: u32,
    /// Largest uncompressed cutout, in bytes, a read or write may touch
    pub max_cutout_bytes: u64,
    pub compression: CompressionMethod,
    pub compression_level: CompressionLevel,
    /// Retry and per-call timeout for cache and store calls
    pub retry: RetryPolicy,
    pub flush: FlushConfig,
    pub ingest: IngestConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cuboid_shape: CuboidShape::default(),
            max_resolution: 16,
            max_cutout_bytes: DEFAULT_MAX_CUTOUT_BYTES,
            compression: CompressionMethod::Zstd,
            compression_level: CompressionLevel::default(),
            retry: RetryPolicy::default(),
            flush: FlushConfig::default(),
            ingest: IngestConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cuboid_shape(mut self, shape: CuboidShape) -> Self {
        self.cuboid_shape = shape;
        self
    }

    pub fn with_max_resolution(mut self, max_resolution: u32) -> Self {
        self.max_resolution = max_resolution;
        self
    }

    pub fn with_max_cutout_bytes(mut self, bytes: u64) -> Self {
        self.max_cutout_bytes = bytes;
        self
    }

    pub fn with_compression(mut self, method: CompressionMethod, level: CompressionLevel) -> Self {
        self.compression = method;
        self.compression_level = level;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_flush(mut self, flush: FlushConfig) -> Self {
        self.flush = flush;
        self
    }

    pub fn with_ingest(mut self, ingest: IngestConfig) -> Self {
        self.ingest = ingest;
        self
    }

    /// Codec for the configured compression
    pub fn codec(&self) -> Codec {
        Codec::new(self.compression, self.compression_level)
    }

    /// Parse and validate a JSON config; missing fields take defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SpatialError::Configuration(format!("invalid engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON config file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            SpatialError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    /// Check every section for values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        self.cuboid_shape.validate()?;
        if self.max_cutout_bytes == 0 {
            return Err(SpatialError::Configuration(
                "max_cutout_bytes must be positive".into(),
            ));
        }
        if self.retry.max_attempts == 0 || self.retry.attempt_timeout_ms == 0 {
            return Err(SpatialError::Configuration(
                "retry needs at least one attempt and a non-zero timeout".into(),
            ));
        }
        self.flush.validate()?;
        self.ingest.validate()
    }
}

/// Write-back worker pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    pub workers: usize,
    /// Deliveries of one marker before it is dead-lettered
    pub max_attempts: u32,
    pub visibility_timeout_ms: u64,
    /// Sleep between polls of an empty queue
    pub poll_interval_ms: u64,
    /// Base requeue delay, multiplied by the attempt number
    pub requeue_delay_ms: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 5,
            visibility_timeout_ms: 30_000,
            poll_interval_ms: 50,
            requeue_delay_ms: 250,
        }
    }
}

impl FlushConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn requeue_delay(&self, attempts: u32) -> Duration {
        Duration::from_millis(self.requeue_delay_ms.saturating_mul(attempts as u64))
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.max_attempts == 0 {
            return Err(SpatialError::Configuration(
                "flush needs at least one worker and one attempt".into(),
            ));
        }
        Ok(())
    }
}

/// Bulk ingest settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub credential_ttl_secs: u64,
    /// Age after which a job that never completed is swept
    pub job_timeout_secs: u64,
    pub tile_visibility_timeout_secs: u64,
    /// Encoding uploaded tiles are stored in
    pub tile_encoding: TransferEncoding,
    /// Largest tile plan a single job may carry
    pub max_tiles: u64,
    /// How long a completed or deleted job stays pollable
    pub retention_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            credential_ttl_secs: 3_600,
            job_timeout_secs: 7 * 24 * 3_600,
            tile_visibility_timeout_secs: 300,
            tile_encoding: TransferEncoding::RawCompressed,
            max_tiles: 1_000_000,
            retention_secs: 24 * 3_600,
        }
    }
}

impl IngestConfig {
    pub fn tile_visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.tile_visibility_timeout_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.credential_ttl_secs == 0 || self.job_timeout_secs == 0 {
            return Err(SpatialError::Configuration(
                "ingest credential TTL and job timeout must be positive".into(),
            ));
        }
        if self.max_tiles == 0 {
            return Err(SpatialError::Configuration("ingest max_tiles must be positive".into()));
        }
        Ok(())
    }
}
