//! Cuboid keys: Morton-ordered, deterministic addresses for stored cuboids

use crate::error::{Result, SpatialError};
use crate::layout::{CuboidShape, GridCoord};
use crate::types::{CutoutRange, VolumeIdentity, KEY_SEPARATOR};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bits available per axis in a 3-D Morton code packed into a `u64`
pub const MORTON_BITS_PER_AXIS: u32 = 21;

/// Largest grid coordinate that can be Morton encoded
pub const MAX_GRID_COORD: u64 = (1 << MORTON_BITS_PER_AXIS) - 1;

/// Spread the low 21 bits of `v` so that two zero bits follow each bit.
fn split_by_3(v: u64) -> u64 {
    let mut x = v & MAX_GRID_COORD;
    x = (x | (x << 32)) & 0x001f_0000_0000_ffff;
    x = (x | (x << 16)) & 0x001f_0000_ff00_00ff;
    x = (x | (x << 8)) & 0x100f_00f0_0f00_f00f;
    x = (x | (x << 4)) & 0x10c3_0c30_c30c_30c3;
    x = (x | (x << 2)) & 0x1249_2492_4924_9249;
    x
}

fn compact_by_3(v: u64) -> u64 {
    let mut x = v & 0x1249_2492_4924_9249;
    x = (x ^ (x >> 2)) & 0x10c3_0c30_c30c_30c3;
    x = (x ^ (x >> 4)) & 0x100f_00f0_0f00_f00f;
    x = (x ^ (x >> 8)) & 0x001f_0000_ff00_00ff;
    x = (x ^ (x >> 16)) & 0x001f_0000_0000_ffff;
    x = (x ^ (x >> 32)) & MAX_GRID_COORD;
    x
}

/// Interleave x, y, z (x in the lowest bit) into a Morton index.
pub fn morton_encode(grid: GridCoord) -> u64 {
    split_by_3(grid.x) | (split_by_3(grid.y) << 1) | (split_by_3(grid.z) << 2)
}

/// Inverse of [`morton_encode`]
pub fn morton_decode(morton: u64) -> GridCoord {
    GridCoord::new(
        compact_by_3(morton),
        compact_by_3(morton >> 1),
        compact_by_3(morton >> 2),
    )
}

/// Address of one stored cuboid.
///
/// Textual form: `collection&experiment&channel&resolution&time_bucket&morton`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CuboidKey {
    pub identity: VolumeIdentity,
    pub resolution: u32,
    pub time_bucket: u64,
    pub morton: u64,
}

impl CuboidKey {
    pub fn grid(&self) -> GridCoord {
        morton_decode(self.morton)
    }

    /// Relative object path, e.g. `col/exp/chan/0/0/1234`.
    pub fn object_path(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}/{}",
            self.identity.collection,
            self.identity.experiment,
            self.identity.channel,
            self.resolution,
            self.time_bucket,
            self.morton
        )
    }
}

impl fmt::Display for CuboidKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = KEY_SEPARATOR;
        write!(
            f,
            "{}{s}{}{s}{}{s}{}{s}{}{s}{}",
            self.identity.collection,
            self.identity.experiment,
            self.identity.channel,
            self.resolution,
            self.time_bucket,
            self.morton
        )
    }
}

impl FromStr for CuboidKey {
    type Err = SpatialError;

    fn from_str(text: &str) -> Result<Self> {
        let parts: Vec<&str> = text.split(KEY_SEPARATOR).collect();
        let bad = || SpatialError::InvalidCoordinate(format!("malformed cuboid key {:?}", text));
        if parts.len() != 6 {
            return Err(bad());
        }
        let identity = VolumeIdentity::new(parts[0], parts[1], parts[2]);
        identity.validate()?;
        Ok(Self {
            identity,
            resolution: parts[3].parse().map_err(|_| bad())?,
            time_bucket: parts[4].parse().map_err(|_| bad())?,
            morton: parts[5].parse().map_err(|_| bad())?,
        })
    }
}

impl From<CuboidKey> for String {
    fn from(key: CuboidKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for CuboidKey {
    type Error = SpatialError;

    fn try_from(text: String) -> Result<Self> {
        text.parse()
    }
}

/// Builds cuboid keys within the configured addressable space.
#[derive(Debug, Clone, Copy)]
pub struct CuboidIndexer {
    max_resolution: u32,
}

impl CuboidIndexer {
    /// Create an indexer accepting resolutions up to `max_resolution`
    pub fn new(max_resolution: u32) -> Self {
        Self { max_resolution }
    }

    pub fn max_resolution(&self) -> u32 {
        self.max_resolution
    }

    pub fn check_resolution(&self, resolution: u32) -> Result<()> {
        if resolution > self.max_resolution {
            return Err(SpatialError::InvalidCoordinate(format!(
                "resolution {} exceeds the maximum of {}",
                resolution, self.max_resolution
            )));
        }
        Ok(())
    }

    /// Reject a range that reaches past the last addressable cuboid of
    /// `shape` on any spatial axis.
    pub fn check_addressable(&self, range: &CutoutRange, shape: &CuboidShape) -> Result<()> {
        for (axis, r, size) in [("x", range.x, shape.x), ("y", range.y, shape.y), ("z", range.z, shape.z)] {
            let last = r.stop.saturating_sub(1) / size;
            if last > MAX_GRID_COORD {
                return Err(SpatialError::InvalidCoordinate(format!(
                    "{} range {} reaches cuboid {}, past the addressable maximum of {}",
                    axis, r, last, MAX_GRID_COORD
                )));
            }
        }
        Ok(())
    }

    /// Key of the cuboid at `grid` and `time_bucket`
    pub fn key_for(
        &self,
        identity: &VolumeIdentity,
        resolution: u32,
        grid: GridCoord,
        time_bucket: u64,
    ) -> Result<CuboidKey> {
        identity.validate()?;
        self.check_resolution(resolution)?;
        if grid.x > MAX_GRID_COORD || grid.y > MAX_GRID_COORD || grid.z > MAX_GRID_COORD {
            return Err(SpatialError::InvalidCoordinate(format!(
                "grid coordinate {} exceeds the addressable maximum of {}",
                grid, MAX_GRID_COORD
            )));
        }
        Ok(CuboidKey {
            identity: identity.clone(),
            resolution,
            time_bucket,
            morton: morton_encode(grid),
        })
    }
}
