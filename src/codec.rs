//! Cuboid codec: byte-shuffled, block-compressed voxel arrays with a small
//! self-describing header.
//!
//! Layout of an encoded payload:
//!
//! ```text
//! 0..2   magic "SC"
//! 2      format version (1)
//! 3      data type tag
//! 4      compression method
//! 5      shuffle flag
//! 6..14  uncompressed length, u64 little-endian
//! 14..   compressed body
//! ```

use crate::buffer::VoxelBuffer;
use crate::error::{Result, SpatialError};
use crate::types::DataType;
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};
use std::io::Read;

const MAGIC: &[u8; 2] = b"SC";
const FORMAT_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 14;

/// Block compressors available for cuboid payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CompressionMethod {
    /// Stored as-is
    None = 0,
    /// Deflate/ZIP compression
    Deflate = 1,
    /// Zstandard compression
    Zstd = 3,
}

impl CompressionMethod {
    /// Method for a header tag byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionMethod::None),
            1 => Some(CompressionMethod::Deflate),
            3 => Some(CompressionMethod::Zstd),
            _ => None,
        }
    }
}

/// Compression level (0-9, where 0 is fastest and 9 is maximum)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    /// Create a level, clamped to 9
    pub fn new(level: u8) -> Self {
        Self(level.min(9))
    }

    pub fn fast() -> Self {
        Self(1)
    }

    pub fn best() -> Self {
        Self(9)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(3)
    }
}

impl CompressionMethod {
    /// Compress a (possibly shuffled) cuboid body.
    pub fn compress(&self, body: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        match self {
            CompressionMethod::None => Ok(body.to_vec()),
            CompressionMethod::Deflate => {
                let mut out = Vec::with_capacity(body.len() / 2);
                DeflateEncoder::new(body, FlateCompression::new(level.value() as u32))
                    .read_to_end(&mut out)
                    .map_err(|e| SpatialError::Compression(format!("deflate: {}", e)))?;
                Ok(out)
            }
            CompressionMethod::Zstd => zstd::bulk::compress(body, level.value() as i32)
                .map_err(|e| SpatialError::Compression(format!("zstd: {}", e))),
        }
    }

    /// Inflate a body whose uncompressed length should be `expected`; never
    /// yields more than one byte past it.
    pub fn decompress(&self, body: &[u8], expected: usize) -> Result<Vec<u8>> {
        match self {
            CompressionMethod::None => Ok(body[..body.len().min(expected + 1)].to_vec()),
            CompressionMethod::Deflate => {
                let mut out = Vec::with_capacity(expected);
                DeflateDecoder::new(body)
                    .take(expected as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|e| SpatialError::corrupt("deflate body", e))?;
                Ok(out)
            }
            CompressionMethod::Zstd => {
                zstd::bulk::decompress(body, expected).map_err(|e| SpatialError::corrupt("zstd body", e))
            }
        }
    }
}

/// Group byte `k` of every element together so similar bytes compress well.
pub fn shuffle(data: &[u8], width: usize) -> Vec<u8> {
    if width <= 1 {
        return data.to_vec();
    }
    let count = data.len() / width;
    let mut out = vec![0u8; data.len()];
    for (i, element) in data.chunks_exact(width).enumerate() {
        for (k, &byte) in element.iter().enumerate() {
            out[k * count + i] = byte;
        }
    }
    out
}

/// Inverse of [`shuffle`]
pub fn unshuffle(data: &[u8], width: usize) -> Vec<u8> {
    if width <= 1 {
        return data.to_vec();
    }
    let count = data.len() / width;
    let mut out = vec![0u8; data.len()];
    for (i, element) in out.chunks_exact_mut(width).enumerate() {
        for (k, byte) in element.iter_mut().enumerate() {
            *byte = data[k * count + i];
        }
    }
    out
}

/// Parsed payload header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    pub data_type: DataType,
    pub method: CompressionMethod,
    pub shuffled: bool,
    pub uncompressed_len: u64,
}

impl PayloadHeader {
    /// Parse and check the fixed-size header at the start of a payload
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < HEADER_LEN {
            return Err(SpatialError::corrupt(
                "cuboid payload",
                format!("{} bytes is shorter than the header", payload.len()),
            ));
        }
        if &payload[0..2] != MAGIC || payload[2] != FORMAT_VERSION {
            return Err(SpatialError::corrupt("cuboid payload", "bad magic or version"));
        }
        let data_type = DataType::from_u8(payload[3])
            .ok_or_else(|| SpatialError::corrupt("cuboid payload", format!("unknown data type tag {}", payload[3])))?;
        let method = CompressionMethod::from_u8(payload[4])
            .ok_or_else(|| SpatialError::corrupt("cuboid payload", format!("unknown compression method {}", payload[4])))?;
        let mut len = [0u8; 8];
        len.copy_from_slice(&payload[6..14]);
        Ok(Self {
            data_type,
            method,
            shuffled: payload[5] != 0,
            uncompressed_len: u64::from_le_bytes(len),
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        out.push(self.data_type as u8);
        out.push(self.method as u8);
        out.push(self.shuffled as u8);
        out.extend_from_slice(&self.uncompressed_len.to_le_bytes());
    }
}

/// Encoder/decoder for cuboid payloads
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    method: CompressionMethod,
    level: CompressionLevel,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(CompressionMethod::Zstd, CompressionLevel::default())
    }
}

impl Codec {
    /// Create a codec compressing with `method` at `level`
    pub fn new(method: CompressionMethod, level: CompressionLevel) -> Self {
        Self { method, level }
    }

    pub fn method(&self) -> CompressionMethod {
        self.method
    }

    /// Compress raw little-endian voxel bytes of `data_type`.
    pub fn encode_bytes(&self, data_type: DataType, raw: &[u8]) -> Result<Vec<u8>> {
        let width = data_type.size_in_bytes();
        if raw.len() % width != 0 {
            return Err(SpatialError::InvalidRange(format!(
                "{} bytes is not a whole number of {} elements",
                raw.len(),
                data_type
            )));
        }
        let shuffled = width > 1;
        let body = if shuffled { shuffle(raw, width) } else { raw.to_vec() };
        let compressed = self.method.compress(&body, self.level)?;

        let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
        PayloadHeader {
            data_type,
            method: self.method,
            shuffled,
            uncompressed_len: raw.len() as u64,
        }
        .write(&mut out);
        out.extend_from_slice(&compressed);
        Ok(out)
    }

    /// Encode a voxel buffer
    pub fn encode(&self, buffer: &VoxelBuffer) -> Result<Vec<u8>> {
        self.encode_bytes(buffer.data_type(), buffer.as_bytes())
    }

    /// Exact inverse of [`Codec::encode`]: fails unless the payload yields
    /// exactly `shape` elements of `data_type`.
    ///
    /// The header's length is checked against `shape` before anything is
    /// inflated, so a corrupt header cannot size the output buffer.
    pub fn decode(payload: &[u8], data_type: DataType, shape: [usize; 4]) -> Result<VoxelBuffer> {
        let header = PayloadHeader::parse(payload)?;
        if header.data_type != data_type {
            return Err(SpatialError::corrupt(
                "cuboid payload",
                format!("tagged {} but {} was expected", header.data_type, data_type),
            ));
        }
        let expected = shape
            .iter()
            .try_fold(data_type.size_in_bytes(), |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| SpatialError::InvalidRange(format!("shape {:?} overflows", shape)))?;
        if header.uncompressed_len != expected as u64 {
            return Err(SpatialError::corrupt(
                "cuboid payload",
                format!(
                    "header says {} bytes, shape {:?} needs {}",
                    header.uncompressed_len, shape, expected
                ),
            ));
        }
        let body = header.method.decompress(&payload[HEADER_LEN..], expected)?;
        if body.len() != expected {
            return Err(SpatialError::corrupt(
                "cuboid payload",
                format!("decompressed {} bytes, header says {}", body.len(), expected),
            ));
        }
        let raw = if header.shuffled {
            unshuffle(&body, data_type.size_in_bytes())
        } else {
            body
        };
        VoxelBuffer::new(data_type, shape, raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern<T: crate::types::Voxel>(n: usize, f: impl Fn(usize) -> T) -> Vec<T> {
        (0..n).map(f).collect()
    }

    #[test]
    fn test_round_trip_every_width() {
        let shape = [1, 4, 8, 16];
        let n = 4 * 8 * 16;
        let buffers = vec![
            VoxelBuffer::from_voxels(shape, &pattern(n, |i| (i % 251) as u8)).unwrap(),
            VoxelBuffer::from_voxels(shape, &pattern(n, |i| (i * 37) as u16)).unwrap(),
            VoxelBuffer::from_voxels(shape, &pattern(n, |i| (i as u32).wrapping_mul(2_654_435_761))).unwrap(),
            VoxelBuffer::from_voxels(shape, &pattern(n, |i| u64::MAX - i as u64)).unwrap(),
        ];
        for method in [CompressionMethod::None, CompressionMethod::Deflate, CompressionMethod::Zstd] {
            let codec = Codec::new(method, CompressionLevel::default());
            for buf in &buffers {
                let payload = codec.encode(buf).unwrap();
                let back = Codec::decode(&payload, buf.data_type(), shape).unwrap();
                assert_eq!(&back, buf, "{:?} {}", method, buf.data_type());
            }
        }
    }

    #[test]
    fn test_encode_leaves_input_untouched() {
        let buf = VoxelBuffer::from_voxels([1, 1, 2, 2], &[1u16, 2, 3, 4]).unwrap();
        let copy = buf.clone();
        let _ = Codec::default().encode(&buf).unwrap();
        assert_eq!(buf, copy);
    }

    #[test]
    fn test_compresses_background() {
        let buf = VoxelBuffer::zeros(DataType::U16, [1, 16, 64, 64]).unwrap();
        let payload = Codec::default().encode(&buf).unwrap();
        assert!(payload.len() < buf.as_bytes().len() / 10);
    }

    #[test]
    fn test_decode_rejects_wrong_shape_and_type() {
        let buf = VoxelBuffer::from_voxels([1, 1, 2, 2], &[1u8, 2, 3, 4]).unwrap();
        let payload = Codec::default().encode(&buf).unwrap();
        assert!(matches!(
            Codec::decode(&payload, DataType::U8, [1, 1, 2, 3]),
            Err(SpatialError::CorruptPayload { .. })
        ));
        assert!(matches!(
            Codec::decode(&payload, DataType::U16, [1, 1, 1, 2]),
            Err(SpatialError::CorruptPayload { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Codec::decode(b"not a cuboid", DataType::U8, [1, 1, 1, 1]),
            Err(SpatialError::CorruptPayload { .. })
        ));
        let buf = VoxelBuffer::from_voxels([1, 1, 4, 4], &[7u8; 16]).unwrap();
        let mut payload = Codec::default().encode(&buf).unwrap();
        payload.truncate(HEADER_LEN + 2);
        assert!(matches!(
            Codec::decode(&payload, DataType::U8, [1, 1, 4, 4]),
            Err(SpatialError::CorruptPayload { .. })
        ));
    }

    #[test]
    fn test_oversized_length_in_header_is_corrupt() {
        let buf = VoxelBuffer::from_voxels([1, 1, 1, 1], &[9u8]).unwrap();
        for method in [CompressionMethod::None, CompressionMethod::Deflate, CompressionMethod::Zstd] {
            let mut payload = Codec::new(method, CompressionLevel::default()).encode(&buf).unwrap();
            payload[6..14].copy_from_slice(&(1u64 << 46).to_le_bytes());
            assert!(matches!(
                Codec::decode(&payload, DataType::U8, [1, 1, 1, 1]),
                Err(SpatialError::CorruptPayload { .. })
            ));
        }
    }

    #[test]
    fn test_shuffle_inverse() {
        let data: Vec<u8> = (0..24).collect();
        let shuffled = shuffle(&data, 4);
        assert_eq!(&shuffled[..6], &[0, 4, 8, 12, 16, 20]);
        assert_eq!(unshuffle(&shuffled, 4), data);
    }

    #[test]
    fn test_header_parse() {
        let payload = Codec::new(CompressionMethod::Deflate, CompressionLevel::best())
            .encode_bytes(DataType::U32, &[0u8; 40])
            .unwrap();
        let header = PayloadHeader::parse(&payload).unwrap();
        assert_eq!(header.data_type, DataType::U32);
        assert_eq!(header.method, CompressionMethod::Deflate);
        assert!(header.shuffled);
        assert_eq!(header.uncompressed_len, 40);
    }
}
