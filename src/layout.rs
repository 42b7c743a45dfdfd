//! Cuboid geometry - how cutout ranges are divided into fixed-size cuboids

use crate::error::{Result, SpatialError};
use crate::types::{AxisRange, CutoutRange};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a cuboid along x, y, z and time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CuboidShape {
    pub x: u64,
    pub y: u64,
    pub z: u64,
    /// Time indices stored together in one cuboid
    #[serde(default = "default_time_bucket")]
    pub t: u64,
}

fn default_time_bucket() -> u64 {
    1
}

impl CuboidShape {
    pub fn new(x: u64, y: u64, z: u64) -> Self {
        Self { x, y, z, t: 1 }
    }

    pub fn with_time_bucket(mut self, t: u64) -> Self {
        self.t = t;
        self
    }

    /// Reject shapes with a zero dimension
    pub fn validate(&self) -> Result<()> {
        if self.x == 0 || self.y == 0 || self.z == 0 || self.t == 0 {
            return Err(SpatialError::Configuration(format!(
                "cuboid shape {} has a zero dimension",
                self
            )));
        }
        Ok(())
    }

    /// Dimensions in C order `(t, z, y, x)`
    pub fn dims(&self) -> [usize; 4] {
        [self.t as usize, self.z as usize, self.y as usize, self.x as usize]
    }

    /// Total number of voxels in a cuboid, saturating at `u64::MAX`
    pub fn total_voxels(&self) -> u64 {
        self.x
            .saturating_mul(self.y)
            .saturating_mul(self.z)
            .saturating_mul(self.t)
    }

    /// Absolute coordinate range covered by the cuboid at `grid` / `time_bucket`.
    pub fn cell_range(&self, grid: GridCoord, time_bucket: u64) -> CutoutRange {
        let axis = |index: u64, size: u64| AxisRange {
            start: index.saturating_mul(size),
            stop: index.saturating_add(1).saturating_mul(size),
        };
        CutoutRange {
            x: axis(grid.x, self.x),
            y: axis(grid.y, self.y),
            z: axis(grid.z, self.z),
            t: Some(axis(time_bucket, self.t)),
        }
    }
}

impl Default for CuboidShape {
    fn default() -> Self {
        Self::new(512, 512, 16)
    }
}

impl fmt::Display for CuboidShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.x, self.y, self.z)?;
        if self.t != 1 {
            write!(f, "x{}t", self.t)?;
        }
        Ok(())
    }
}

/// Position of a cuboid in the grid, `floor(coord / cuboid_dim)` per axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridCoord {
    pub x: u64,
    pub y: u64,
    pub z: u64,
}

impl GridCoord {
    pub fn new(x: u64, y: u64, z: u64) -> Self {
        Self { x, y, z }
    }

    /// Build a grid coordinate from signed input, rejecting negatives.
    pub fn from_signed(x: i64, y: i64, z: i64) -> Result<Self> {
        if x < 0 || y < 0 || z < 0 {
            return Err(SpatialError::InvalidCoordinate(format!(
                "grid coordinate ({}, {}, {}) is negative",
                x, y, z
            )));
        }
        Ok(Self::new(x as u64, y as u64, z as u64))
    }
}

impl fmt::Display for GridCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}_y{}_z{}", self.x, self.y, self.z)
    }
}

/// A 4-D box in C order `(t, z, y, x)`: start offsets plus extents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    pub start: [usize; 4],
    pub shape: [usize; 4],
}

impl Block {
    pub fn new(start: [usize; 4], shape: [usize; 4]) -> Self {
        Self { start, shape }
    }

    pub fn voxels(&self) -> usize {
        self.shape.iter().product()
    }
}

/// One cuboid touched by a cutout, with the overlapping region expressed both
/// in cuboid-local coordinates and in cutout-buffer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CuboidOverlap {
    pub grid: GridCoord,
    pub time_bucket: u64,
    /// Overlap inside the cuboid, always within `[0, cuboid_dim)`
    pub local: Block,
    /// The same overlap inside the cutout buffer
    pub cutout: Block,
}

impl CuboidOverlap {
    /// True when the overlap covers the whole cuboid.
    pub fn is_full(&self, shape: &CuboidShape) -> bool {
        self.local.start == [0; 4] && self.local.shape == shape.dims()
    }

    /// Absolute coordinates of the overlap.
    pub fn absolute_range(&self, shape: &CuboidShape) -> CutoutRange {
        let axis = |index: u64, size: u64, local_start: usize, len: usize| {
            let start = index.saturating_mul(size).saturating_add(local_start as u64);
            AxisRange {
                start,
                stop: start.saturating_add(len as u64),
            }
        };
        let l = &self.local;
        CutoutRange {
            x: axis(self.grid.x, shape.x, l.start[3], l.shape[3]),
            y: axis(self.grid.y, shape.y, l.start[2], l.shape[2]),
            z: axis(self.grid.z, shape.z, l.start[1], l.shape[1]),
            t: Some(axis(self.time_bucket, shape.t, l.start[0], l.shape[0])),
        }
    }
}

/// Per-axis split of `range` into cells of `size`:
/// `(cell index, local start, buffer start, length)`.
fn axis_cells(range: AxisRange, size: u64) -> Vec<(u64, usize, usize, usize)> {
    let first = range.start / size;
    let last = (range.stop - 1) / size;
    (first..=last)
        .map(|cell| {
            let cell_start = cell * size;
            let lo = range.start.max(cell_start);
            let hi = range.stop.min(cell_start.saturating_add(size));
            (
                cell,
                (lo - cell_start) as usize,
                (lo - range.start) as usize,
                (hi - lo) as usize,
            )
        })
        .collect()
}

/// Enumerate every cuboid a range touches, in ascending z, then y, then x,
/// then time bucket order.
pub fn cuboids_covering(range: &CutoutRange, shape: &CuboidShape) -> Vec<CuboidOverlap> {
    let xs = axis_cells(range.x, shape.x);
    let ys = axis_cells(range.y, shape.y);
    let zs = axis_cells(range.z, shape.z);
    let ts = axis_cells(range.time(), shape.t);

    let mut overlaps = Vec::with_capacity(xs.len() * ys.len() * zs.len() * ts.len());
    for &(cz, lz, bz, nz) in &zs {
        for &(cy, ly, by, ny) in &ys {
            for &(cx, lx, bx, nx) in &xs {
                for &(ct, lt, bt, nt) in &ts {
                    overlaps.push(CuboidOverlap {
                        grid: GridCoord::new(cx, cy, cz),
                        time_bucket: ct,
                        local: Block::new([lt, lz, ly, lx], [nt, nz, ny, nx]),
                        cutout: Block::new([bt, bz, by, bx], [nt, nz, ny, nx]),
                    });
                }
            }
        }
    }
    overlaps
}

/// Number of cuboids a range touches, without materializing them. `None`
/// when the count does not fit in a `u64`.
pub fn cuboid_count(range: &CutoutRange, shape: &CuboidShape) -> Option<u64> {
    let cells = |r: AxisRange, size: u64| (r.stop.saturating_sub(1) / size).saturating_sub(r.start / size) + 1;
    cells(range.x, shape.x)
        .checked_mul(cells(range.y, shape.y))?
        .checked_mul(cells(range.z, shape.z))?
        .checked_mul(cells(range.time(), shape.t))
}
