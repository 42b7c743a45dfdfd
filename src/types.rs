//! Core data types: voxel element types, volume identity and coordinate ranges

use crate::error::{Result, SpatialError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Voxel element types a channel can be configured with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DataType {
    /// Unsigned 8-bit integer
    U8 = 1,
    /// Unsigned 16-bit integer
    U16 = 2,
    /// Unsigned 32-bit integer
    U32 = 3,
    /// Unsigned 64-bit integer
    U64 = 4,
    /// Signed 8-bit integer
    I8 = 5,
    /// Signed 16-bit integer
    I16 = 6,
    /// Signed 32-bit integer
    I32 = 7,
    /// Signed 64-bit integer
    I64 = 8,
    /// 32-bit floating point
    F32 = 9,
    /// 64-bit floating point
    F64 = 10,
}

impl DataType {
    /// Size in bytes of one element
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::U64 | DataType::I64 | DataType::F64 => 8,
        }
    }

    /// Tag byte used in codec headers
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(DataType::U8),
            2 => Some(DataType::U16),
            3 => Some(DataType::U32),
            4 => Some(DataType::U64),
            5 => Some(DataType::I8),
            6 => Some(DataType::I16),
            7 => Some(DataType::I32),
            8 => Some(DataType::I64),
            9 => Some(DataType::F32),
            10 => Some(DataType::F64),
            _ => None,
        }
    }

    /// Unsigned integer type for a channel bit depth (8, 16, 32 or 64)
    pub fn from_bit_depth(bits: u32) -> Result<Self> {
        match bits {
            8 => Ok(DataType::U8),
            16 => Ok(DataType::U16),
            32 => Ok(DataType::U32),
            64 => Ok(DataType::U64),
            other => Err(SpatialError::TypeMismatch {
                expected: "bit depth of 8, 16, 32 or 64".to_string(),
                actual: format!("{} bits", other),
            }),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::U8 => "uint8",
            DataType::U16 => "uint16",
            DataType::U32 => "uint32",
            DataType::U64 => "uint64",
            DataType::I8 => "int8",
            DataType::I16 => "int16",
            DataType::I32 => "int32",
            DataType::I64 => "int64",
            DataType::F32 => "float32",
            DataType::F64 => "float64",
        };
        f.write_str(name)
    }
}

/// A Rust scalar that can be stored as a voxel.
///
/// Voxels are always laid out little-endian in buffers and cuboids.
pub trait Voxel: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    const DATA_TYPE: DataType;

    fn write_le(self, out: &mut Vec<u8>);

    /// `bytes` is exactly `DATA_TYPE.size_in_bytes()` long.
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_voxel {
    ($($ty:ty => $dt:expr),* $(,)?) => {
        $(
            impl Voxel for $ty {
                const DATA_TYPE: DataType = $dt;

                fn write_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_voxel!(
    u8 => DataType::U8,
    u16 => DataType::U16,
    u32 => DataType::U32,
    u64 => DataType::U64,
    i8 => DataType::I8,
    i16 => DataType::I16,
    i32 => DataType::I32,
    i64 => DataType::I64,
    f32 => DataType::F32,
    f64 => DataType::F64,
);

/// Character reserved as the separator inside cuboid keys
pub const KEY_SEPARATOR: char = '&';

/// Resolved (collection, experiment, channel) a request operates on
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeIdentity {
    pub collection: String,
    pub experiment: String,
    pub channel: String,
}

impl VolumeIdentity {
    pub fn new(
        collection: impl Into<String>,
        experiment: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            collection: collection.into(),
            experiment: experiment.into(),
            channel: channel.into(),
        }
    }

    /// Names must be non-empty and free of key and path separators.
    pub fn validate(&self) -> Result<()> {
        for (field, name) in [
            ("collection", &self.collection),
            ("experiment", &self.experiment),
            ("channel", &self.channel),
        ] {
            if name.is_empty() || name.contains(KEY_SEPARATOR) || name.contains('/') {
                return Err(SpatialError::InvalidCoordinate(format!(
                    "{} name {:?} is empty or contains a reserved character",
                    field, name
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for VolumeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.collection, self.experiment, self.channel)
    }
}

/// Half-open interval `[start, stop)` along one axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AxisRange {
    pub start: u64,
    pub stop: u64,
}

impl AxisRange {
    /// Create a half-open range; `stop` must exceed `start`
    pub fn new(start: u64, stop: u64) -> Result<Self> {
        if stop <= start {
            return Err(SpatialError::InvalidRange(format!(
                "{}:{} (stop must be greater than start)",
                start, stop
            )));
        }
        Ok(Self { start, stop })
    }

    /// Build a range from signed collaborator input, rejecting negatives.
    pub fn from_signed(start: i64, stop: i64) -> Result<Self> {
        if start < 0 || stop < 0 {
            return Err(SpatialError::InvalidRange(format!(
                "{}:{} (coordinates must be non-negative)",
                start, stop
            )));
        }
        Self::new(start as u64, stop as u64)
    }

    /// Parse the `start:stop` form used in cutout URLs.
    pub fn parse(text: &str) -> Result<Self> {
        let (start, stop) = text
            .split_once(':')
            .ok_or_else(|| SpatialError::InvalidRange(format!("{:?} is not start:stop", text)))?;
        let parse = |s: &str| {
            s.trim()
                .parse::<i64>()
                .map_err(|_| SpatialError::InvalidRange(format!("{:?} is not an integer", s)))
        };
        Self::from_signed(parse(start)?, parse(stop)?)
    }

    pub fn len(&self) -> u64 {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.stop <= self.start
    }

    pub fn contains(&self, other: &AxisRange) -> bool {
        self.start <= other.start && other.stop <= self.stop
    }
}

impl fmt::Display for AxisRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start, self.stop)
    }
}

/// Implicit time range used when a request carries none
pub const SINGLE_TIME: AxisRange = AxisRange { start: 0, stop: 1 };

/// Coordinate range of a cutout: x, y, z and an optional time interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CutoutRange {
    pub x: AxisRange,
    pub y: AxisRange,
    pub z: AxisRange,
    pub t: Option<AxisRange>,
}

impl CutoutRange {
    /// Create a range with the implicit single time index
    pub fn new(x: AxisRange, y: AxisRange, z: AxisRange) -> Self {
        Self { x, y, z, t: None }
    }

    pub fn with_time(mut self, t: AxisRange) -> Self {
        self.t = Some(t);
        self
    }

    /// Parse the textual `x`, `y`, `z` and optional `t` ranges.
    pub fn parse(x: &str, y: &str, z: &str, t: Option<&str>) -> Result<Self> {
        let range = Self::new(AxisRange::parse(x)?, AxisRange::parse(y)?, AxisRange::parse(z)?);
        match t {
            Some(t) => Ok(range.with_time(AxisRange::parse(t)?)),
            None => Ok(range),
        }
    }

    /// Time interval, defaulting to the single implicit index.
    pub fn time(&self) -> AxisRange {
        self.t.unwrap_or(SINGLE_TIME)
    }

    /// Buffer shape in C order `(t, z, y, x)`.
    pub fn shape(&self) -> [usize; 4] {
        [
            self.time().len() as usize,
            self.z.len() as usize,
            self.y.len() as usize,
            self.x.len() as usize,
        ]
    }

    /// Voxel count, `None` on overflow.
    pub fn voxel_count(&self) -> Option<u64> {
        self.time()
            .len()
            .checked_mul(self.z.len())?
            .checked_mul(self.y.len())?
            .checked_mul(self.x.len())
    }

    /// Uncompressed byte size for a data type, `None` on overflow.
    pub fn byte_size(&self, data_type: DataType) -> Option<u64> {
        self.voxel_count()?
            .checked_mul(data_type.size_in_bytes() as u64)
    }

    pub fn contains(&self, other: &CutoutRange) -> bool {
        self.x.contains(&other.x)
            && self.y.contains(&other.y)
            && self.z.contains(&other.z)
            && self.time().contains(&other.time())
    }

    /// Rejects empty axes, which deserialized ranges can carry.
    pub fn validate(&self) -> Result<()> {
        for (axis, range) in [("x", self.x), ("y", self.y), ("z", self.z), ("t", self.time())] {
            if range.is_empty() {
                return Err(SpatialError::InvalidRange(format!(
                    "{} range {} is empty",
                    axis, range
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for CutoutRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x={} y={} z={}", self.x, self.y, self.z)?;
        if let Some(t) = self.t {
            write!(f, " t={}", t)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_sizes() {
        assert_eq!(DataType::U8.size_in_bytes(), 1);
        assert_eq!(DataType::U16.size_in_bytes(), 2);
        assert_eq!(DataType::F32.size_in_bytes(), 4);
        assert_eq!(DataType::U64.size_in_bytes(), 8);
    }

    #[test]
    fn test_data_type_tags() {
        for dt in [DataType::U8, DataType::U16, DataType::U32, DataType::U64, DataType::F64] {
            assert_eq!(DataType::from_u8(dt as u8), Some(dt));
        }
        assert_eq!(DataType::from_u8(0), None);
        assert_eq!(DataType::from_bit_depth(16).unwrap(), DataType::U16);
        assert!(DataType::from_bit_depth(12).is_err());
    }

    #[test]
    fn test_voxel_le_bytes() {
        let mut out = Vec::new();
        0x1234u16.write_le(&mut out);
        assert_eq!(out, vec![0x34, 0x12]);
        assert_eq!(u16::read_le(&out), 0x1234);
        assert_eq!(<f32 as Voxel>::DATA_TYPE, DataType::F32);
    }

    #[test]
    fn test_axis_range_parse() {
        let r = AxisRange::parse("100:600").unwrap();
        assert_eq!((r.start, r.stop, r.len()), (100, 600, 500));
        assert!(AxisRange::parse("600:100").is_err());
        assert!(AxisRange::parse("5:5").is_err());
        assert!(AxisRange::parse("-1:5").is_err());
        assert!(AxisRange::parse("abc").is_err());
        assert!(AxisRange::from_signed(-4, 2).is_err());
    }

    #[test]
    fn test_cutout_range_shape() {
        let range = CutoutRange::parse("100:600", "450:750", "20:37", None).unwrap();
        assert_eq!(range.shape(), [1, 17, 300, 500]);
        assert_eq!(range.byte_size(DataType::U16), Some(2 * 17 * 300 * 500));

        let timed = range.with_time(AxisRange::new(200, 203).unwrap());
        assert_eq!(timed.shape(), [3, 17, 300, 500]);
    }

    #[test]
    fn test_identity_validation() {
        assert!(VolumeIdentity::new("col1", "exp1", "channel1").validate().is_ok());
        assert!(VolumeIdentity::new("", "exp1", "ch").validate().is_err());
        assert!(VolumeIdentity::new("a&b", "exp1", "ch").validate().is_err());
        assert!(VolumeIdentity::new("col", "e/x", "ch").validate().is_err());
    }
}
