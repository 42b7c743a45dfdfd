//! Bulk ingest: a job tiles an extent, hands out scoped upload credentials
//! and queues one task per tile. Uploaded tiles are read from the staging
//! area and written through the cutout engine.

use crate::config::IngestConfig;
use crate::engine::{CutoutEngine, CutoutRequest};
use crate::error::{Result, SpatialError};
use crate::io::IOManager;
use crate::layout::{cuboid_count, cuboids_covering, CuboidShape, GridCoord};
use crate::queue::{MemoryQueue, WorkQueue};
use crate::types::{CutoutRange, DataType, VolumeIdentity};
use crate::utils::format_bytes;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Uploading,
    Completed,
    Deleted,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Deleted)
    }
}

/// Position of a tile in the job's tile grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    pub grid: GridCoord,
    pub time_bucket: u64,
}

impl TileCoord {
    pub fn new(grid: GridCoord, time_bucket: u64) -> Self {
        Self { grid, time_bucket }
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}_{}", self.time_bucket, self.grid)
    }
}

/// Object path a tile is uploaded to
pub fn staging_path(job_id: Uuid, tile: TileCoord) -> String {
    format!("{}{}", staging_prefix(job_id), tile)
}

fn staging_prefix(job_id: Uuid) -> String {
    format!("ingest/{}/", job_id)
}

/// Upload credentials scoped to one job's staging prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub prefix: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn issue(&self, prefix: &str, ttl: Duration) -> Result<UploadCredentials>;

    async fn revoke(&self, credentials: &UploadCredentials) -> Result<()>;

    /// Whether `access_key` is live at `now` and may write under `path`.
    async fn authorizes(&self, access_key: &str, path: &str, now: DateTime<Utc>) -> Result<bool>;
}

/// Issues random key pairs and tracks them in process
#[derive(Default)]
pub struct LocalCredentialIssuer {
    live: RwLock<HashMap<String, UploadCredentials>>,
}

impl LocalCredentialIssuer {
    /// Create an issuer with no live credentials
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_count(&self) -> usize {
        self.live.read().len()
    }
}

#[async_trait]
impl CredentialIssuer for LocalCredentialIssuer {
    async fn issue(&self, prefix: &str, ttl: Duration) -> Result<UploadCredentials> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| SpatialError::Configuration(format!("credential TTL: {}", e)))?;
        let credentials = UploadCredentials {
            access_key: Uuid::new_v4().simple().to_string(),
            secret_key: Uuid::new_v4().simple().to_string(),
            prefix: prefix.to_string(),
            expires_at: Utc::now() + ttl,
        };
        self.live
            .write()
            .insert(credentials.access_key.clone(), credentials.clone());
        Ok(credentials)
    }

    async fn revoke(&self, credentials: &UploadCredentials) -> Result<()> {
        self.live.write().remove(&credentials.access_key);
        Ok(())
    }

    async fn authorizes(&self, access_key: &str, path: &str, now: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .live
            .read()
            .get(access_key)
            .is_some_and(|c| c.expires_at > now && path.starts_with(&c.prefix)))
    }
}

/// Parameters of a new ingest job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestJobRequest {
    pub identity: VolumeIdentity,
    pub resolution: u32,
    pub extent: CutoutRange,
    pub tile_shape: CuboidShape,
    pub data_type: DataType,
}

/// A created ingest job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestJob {
    pub id: Uuid,
    pub identity: VolumeIdentity,
    pub resolution: u32,
    pub extent: CutoutRange,
    pub tile_shape: CuboidShape,
    pub data_type: DataType,
    pub credentials: UploadCredentials,
    /// Every tile of the job with its absolute range
    pub tiles: Vec<(TileCoord, CutoutRange)>,
    pub created_at: DateTime<Utc>,
}

/// Pollable view of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestJobStatus {
    pub id: Uuid,
    pub status: JobStatus,
    /// Present until the job completes or is deleted
    pub credentials: Option<UploadCredentials>,
    pub tiles_total: usize,
    pub tiles_completed: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Queue entry for one tile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileTask {
    pub job_id: Uuid,
    pub tile: TileCoord,
}

/// A tile task claimed by an uploader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedTile {
    pub receipt: Uuid,
    pub tile: TileCoord,
    pub range: CutoutRange,
    /// Where the uploader must put the tile body
    pub staging_path: String,
    pub attempts: u32,
}

/// Result of reporting an uploaded tile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileOutcome {
    Applied { job_completed: bool },
    /// The job was deleted; the tile was not written
    Discarded,
    /// The tile had already been applied
    AlreadyComplete,
}

struct TileState {
    range: CutoutRange,
    completed: bool,
}

struct JobRecord {
    request: IngestJobRequest,
    status: JobStatus,
    credentials: Option<UploadCredentials>,
    /// Emptied once the job completes or is deleted
    tiles: BTreeMap<TileCoord, TileState>,
    tiles_total: usize,
    completed: usize,
    /// Receipts of tiles currently claimed
    claims: HashMap<TileCoord, Uuid>,
    /// `None` once the job is terminal
    queue: Option<Arc<dyn WorkQueue<TileTask>>>,
    /// Completions hold it shared, deletion exclusively
    gate: Arc<AsyncRwLock<()>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRecord {
    fn status(&self, id: Uuid) -> IngestJobStatus {
        IngestJobStatus {
            id,
            status: self.status,
            credentials: self.credentials.clone(),
            tiles_total: self.tiles_total,
            tiles_completed: self.completed,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Move to a terminal status and drop the per-tile state.
    fn finish(&mut self, status: JobStatus) -> (Option<Arc<dyn WorkQueue<TileTask>>>, Option<UploadCredentials>) {
        self.status = status;
        self.tiles = BTreeMap::new();
        self.claims = HashMap::new();
        self.updated_at = Utc::now();
        (self.queue.take(), self.credentials.take())
    }
}

/// True when `age` has passed since `since` as of `now`.
fn elapsed(since: DateTime<Utc>, age: Duration, now: DateTime<Utc>) -> bool {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| since.checked_add_signed(age))
        .is_some_and(|deadline| deadline < now)
}

pub struct IngestJobManager {
    engine: Arc<CutoutEngine>,
    staging: Arc<dyn IOManager>,
    credentials: Arc<dyn CredentialIssuer>,
    config: IngestConfig,
    jobs: RwLock<HashMap<Uuid, JobRecord>>,
}

impl IngestJobManager {
    /// Create a manager writing tiles through `engine` and reading them from `staging`
    pub fn new(
        engine: Arc<CutoutEngine>,
        staging: Arc<dyn IOManager>,
        credentials: Arc<dyn CredentialIssuer>,
    ) -> Self {
        let config = engine.config().ingest.clone();
        Self {
            engine,
            staging,
            credentials,
            config,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Plan a job's tiles, issue upload credentials and queue one task per tile.
    pub async fn create_job(&self, request: IngestJobRequest) -> Result<IngestJob> {
        request.identity.validate()?;
        request.extent.validate()?;
        request.tile_shape.validate()?;
        let engine = &self.engine;
        engine.indexer().check_resolution(request.resolution)?;
        engine
            .indexer()
            .check_addressable(&request.extent, &engine.config().cuboid_shape)?;
        let limit = engine.config().max_cutout_bytes;
        let tile_bytes = request
            .tile_shape
            .total_voxels()
            .saturating_mul(request.data_type.size_in_bytes() as u64);
        if tile_bytes > limit {
            return Err(SpatialError::PayloadTooLarge {
                requested: format_bytes(tile_bytes),
                limit: format_bytes(limit),
            });
        }
        match cuboid_count(&request.extent, &request.tile_shape) {
            Some(count) if count <= self.config.max_tiles => {}
            count => {
                return Err(SpatialError::PayloadTooLarge {
                    requested: count.map_or_else(|| "more than u64::MAX tiles".to_string(), |c| format!("{} tiles", c)),
                    limit: format!("{} tiles", self.config.max_tiles),
                });
            }
        }
        self.ensure_no_active_job(&request)?;

        let tiles: Vec<(TileCoord, CutoutRange)> = cuboids_covering(&request.extent, &request.tile_shape)
            .into_iter()
            .map(|overlap| {
                (
                    TileCoord::new(overlap.grid, overlap.time_bucket),
                    overlap.absolute_range(&request.tile_shape),
                )
            })
            .collect();

        let id = Uuid::new_v4();
        let credentials = self
            .credentials
            .issue(&staging_prefix(id), Duration::from_secs(self.config.credential_ttl_secs))
            .await?;

        let queue: Arc<dyn WorkQueue<TileTask>> =
            Arc::new(MemoryQueue::new(self.config.tile_visibility_timeout()));
        queue
            .send_batch(
                tiles
                    .iter()
                    .map(|(tile, _)| TileTask { job_id: id, tile: *tile })
                    .collect(),
            )
            .await?;

        let now = Utc::now();
        let record = JobRecord {
            request: request.clone(),
            status: JobStatus::Created,
            credentials: Some(credentials.clone()),
            tiles: tiles
                .iter()
                .map(|(tile, range)| {
                    (
                        *tile,
                        TileState {
                            range: *range,
                            completed: false,
                        },
                    )
                })
                .collect(),
            tiles_total: tiles.len(),
            completed: 0,
            claims: HashMap::new(),
            queue: Some(queue),
            gate: Arc::new(AsyncRwLock::new(())),
            created_at: now,
            updated_at: now,
        };

        // A concurrent create may have won while credentials were issued.
        let duplicate = {
            let mut jobs = self.jobs.write();
            let existing = find_active(&jobs, &request);
            if existing.is_none() {
                jobs.insert(id, record);
            }
            existing
        };
        if let Some(existing) = duplicate {
            if let Err(e) = self.credentials.revoke(&credentials).await {
                warn!(job_id = %id, error = %e, "failed to revoke unused credentials");
            }
            return Err(SpatialError::DuplicateJob(format!(
                "job {} is already ingesting {} at resolution {}",
                existing, request.identity, request.resolution
            )));
        }

        info!(job_id = %id, identity = %request.identity, resolution = request.resolution, tiles = tiles.len(), "ingest job created");
        Ok(IngestJob {
            id,
            identity: request.identity,
            resolution: request.resolution,
            extent: request.extent,
            tile_shape: request.tile_shape,
            data_type: request.data_type,
            credentials,
            tiles,
            created_at: now,
        })
    }

    fn ensure_no_active_job(&self, request: &IngestJobRequest) -> Result<()> {
        match find_active(&self.jobs.read(), request) {
            Some(existing) => Err(SpatialError::DuplicateJob(format!(
                "job {} is already ingesting {} at resolution {}",
                existing, request.identity, request.resolution
            ))),
            None => Ok(()),
        }
    }

    /// Current status of a job
    pub fn get_job(&self, job_id: Uuid) -> Result<IngestJobStatus> {
        self.jobs
            .read()
            .get(&job_id)
            .map(|record| record.status(job_id))
            .ok_or_else(|| SpatialError::JobNotFound(job_id.to_string()))
    }

    fn job_queue(&self, job_id: Uuid) -> Result<Option<Arc<dyn WorkQueue<TileTask>>>> {
        let jobs = self.jobs.read();
        let record = jobs
            .get(&job_id)
            .ok_or_else(|| SpatialError::JobNotFound(job_id.to_string()))?;
        if record.status.is_terminal() {
            return Ok(None);
        }
        Ok(record.queue.clone())
    }

    /// Claim the next unclaimed tile. A claimed tile is hidden from other
    /// claimers until it is released, completed, or its visibility window
    /// lapses.
    pub async fn claim_tile_task(&self, job_id: Uuid) -> Result<Option<ClaimedTile>> {
        let Some(queue) = self.job_queue(job_id)? else {
            return Ok(None);
        };
        loop {
            let Some(delivery) = queue.receive().await? else {
                return Ok(None);
            };
            let tile = delivery.body.tile;
            let claimed = {
                let mut jobs = self.jobs.write();
                let Some(record) = jobs.get_mut(&job_id) else {
                    return Err(SpatialError::JobNotFound(job_id.to_string()));
                };
                if record.status.is_terminal() {
                    return Ok(None);
                }
                match record.tiles.get(&tile) {
                    Some(state) if !state.completed => {
                        let range = state.range;
                        record.claims.insert(tile, delivery.receipt);
                        if record.status == JobStatus::Created {
                            record.status = JobStatus::Uploading;
                        }
                        record.updated_at = Utc::now();
                        Some(range)
                    }
                    _ => None,
                }
            };
            match claimed {
                Some(range) => {
                    debug!(job_id = %job_id, tile = %tile, attempts = delivery.attempts, "tile claimed");
                    return Ok(Some(ClaimedTile {
                        receipt: delivery.receipt,
                        tile,
                        range,
                        staging_path: staging_path(job_id, tile),
                        attempts: delivery.attempts,
                    }));
                }
                // Completed before it was claimed; retire the task.
                None => {
                    queue.ack(delivery.receipt).await?;
                }
            }
        }
    }

    /// Give a claimed tile back so another uploader can take it.
    pub async fn release_tile(&self, job_id: Uuid, claim: &ClaimedTile) -> Result<bool> {
        let Some(queue) = self.job_queue(job_id)? else {
            return Ok(false);
        };
        {
            let mut jobs = self.jobs.write();
            if let Some(record) = jobs.get_mut(&job_id) {
                if record.claims.get(&claim.tile) == Some(&claim.receipt) {
                    record.claims.remove(&claim.tile);
                }
            }
        }
        queue.nack(claim.receipt, Duration::ZERO).await
    }

    /// Apply an uploaded tile: read it from staging, write it through the
    /// cutout engine and mark it complete.
    pub async fn tile_uploaded(&self, job_id: Uuid, tile: TileCoord) -> Result<TileOutcome> {
        let gate = {
            let jobs = self.jobs.read();
            let record = jobs
                .get(&job_id)
                .ok_or_else(|| SpatialError::JobNotFound(job_id.to_string()))?;
            Arc::clone(&record.gate)
        };
        let _permit = gate.read().await;

        let (request, range) = {
            let jobs = self.jobs.read();
            let record = jobs
                .get(&job_id)
                .ok_or_else(|| SpatialError::JobNotFound(job_id.to_string()))?;
            match record.status {
                JobStatus::Deleted => {
                    debug!(job_id = %job_id, tile = %tile, "completion for deleted job discarded");
                    return Ok(TileOutcome::Discarded);
                }
                JobStatus::Completed => return Ok(TileOutcome::AlreadyComplete),
                _ => {}
            }
            let state = record.tiles.get(&tile).ok_or_else(|| {
                SpatialError::InvalidCoordinate(format!("tile {} is not part of job {}", tile, job_id))
            })?;
            if state.completed {
                return Ok(TileOutcome::AlreadyComplete);
            }
            (record.request.clone(), state.range)
        };

        let path = staging_path(job_id, tile);
        let body = self.staging.read(&path).await?.ok_or_else(|| {
            SpatialError::InvalidRange(format!("tile {} of job {} has not been uploaded", tile, job_id))
        })?;
        let buffer = self
            .config
            .tile_encoding
            .decode(&body, request.data_type, range.shape())?;
        let cutout = CutoutRequest::new(request.identity, request.resolution, range, request.data_type)
            .with_extent(request.extent);
        self.engine.write_cutout(&cutout, buffer).await?;

        let (receipt, queue, job_completed, credentials) = {
            let mut jobs = self.jobs.write();
            let record = jobs
                .get_mut(&job_id)
                .ok_or_else(|| SpatialError::JobNotFound(job_id.to_string()))?;
            let mut newly_completed = false;
            if let Some(state) = record.tiles.get_mut(&tile) {
                if !state.completed {
                    state.completed = true;
                    newly_completed = true;
                }
            }
            if !newly_completed {
                return Ok(TileOutcome::AlreadyComplete);
            }
            record.completed += 1;
            record.status = JobStatus::Uploading;
            record.updated_at = Utc::now();
            let receipt = record.claims.remove(&tile);
            let job_completed = record.completed == record.tiles_total;
            let (queue, credentials) = if job_completed {
                record.finish(JobStatus::Completed)
            } else {
                (record.queue.clone(), None)
            };
            (receipt, queue, job_completed, credentials)
        };

        if let (Some(receipt), Some(queue)) = (receipt, queue) {
            if let Err(e) = queue.ack(receipt).await {
                warn!(job_id = %job_id, tile = %tile, error = %e, "failed to acknowledge tile task");
            }
        }
        if let Err(e) = self.staging.delete(&path).await {
            warn!(job_id = %job_id, path = %path, error = %e, "failed to remove staged tile");
        }
        if let Some(credentials) = credentials {
            self.credentials.revoke(&credentials).await?;
            info!(job_id = %job_id, "ingest job completed");
        } else {
            debug!(job_id = %job_id, tile = %tile, "tile applied");
        }
        Ok(TileOutcome::Applied { job_completed })
    }

    /// Delete a job: revoke its credentials, drain its queue and remove staged
    /// tiles. Waits for completions already in progress; later completions
    /// are discarded. Deleting a completed or deleted job changes nothing.
    pub async fn delete_job(&self, job_id: Uuid) -> Result<()> {
        let gate = {
            let jobs = self.jobs.read();
            let record = jobs
                .get(&job_id)
                .ok_or_else(|| SpatialError::JobNotFound(job_id.to_string()))?;
            if record.status.is_terminal() {
                return Ok(());
            }
            Arc::clone(&record.gate)
        };
        let _exclusive = gate.write().await;

        let (queue, credentials) = {
            let mut jobs = self.jobs.write();
            let record = jobs
                .get_mut(&job_id)
                .ok_or_else(|| SpatialError::JobNotFound(job_id.to_string()))?;
            if record.status.is_terminal() {
                return Ok(());
            }
            record.finish(JobStatus::Deleted)
        };

        if let Some(credentials) = credentials {
            self.credentials.revoke(&credentials).await?;
        }
        let drained = match queue {
            Some(queue) => queue.purge().await?,
            None => 0,
        };
        for path in self.staging.list(&staging_prefix(job_id)).await? {
            if let Err(e) = self.staging.delete(&path).await {
                warn!(job_id = %job_id, path = %path, error = %e, "failed to remove staged tile");
            }
        }
        info!(job_id = %job_id, drained, "ingest job deleted");
        Ok(())
    }

    /// Delete every unfinished job created longer than `job_timeout_secs`
    /// before `now`, and forget terminal jobs that finished more than
    /// `retention_secs` ago. Returns the ids of the jobs deleted here.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let timeout = self.config.job_timeout();
        let retention = self.config.retention();
        let expired: Vec<Uuid> = {
            let mut jobs = self.jobs.write();
            let before = jobs.len();
            jobs.retain(|_, record| !(record.status.is_terminal() && elapsed(record.updated_at, retention, now)));
            let forgotten = before - jobs.len();
            if forgotten > 0 {
                debug!(forgotten, "terminal ingest jobs removed");
            }
            jobs.iter()
                .filter(|(_, record)| !record.status.is_terminal() && elapsed(record.created_at, timeout, now))
                .map(|(id, _)| *id)
                .collect()
        };
        for id in &expired {
            warn!(job_id = %id, "ingest job timed out");
            self.delete_job(*id).await?;
        }
        Ok(expired)
    }

    /// Number of jobs still held, terminal ones included.
    pub fn job_count(&self) -> usize {
        self.jobs.read().len()
    }
}

fn find_active(jobs: &HashMap<Uuid, JobRecord>, request: &IngestJobRequest) -> Option<Uuid> {
    jobs.iter()
        .find(|(_, record)| {
            !record.status.is_terminal()
                && record.request.identity == request.identity
                && record.request.resolution == request.resolution
        })
        .map(|(id, _)| *id)
}
