//! Transfer encodings a caller can select for cutout bodies

use crate::buffer::VoxelBuffer;
use crate::codec::{Codec, PayloadHeader, HEADER_LEN};
use crate::error::{Result, SpatialError};
use crate::types::DataType;
use crate::utils::format_bytes;
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Upper bound on a container header, far above any real header
const MAX_CONTAINER_HEADER: usize = 4096;

/// How a cutout body is framed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferEncoding {
    /// Codec payload of the raw array; the shape comes from the request
    RawCompressed,
    /// Data type and shape header followed by the codec payload
    ArrayContainer,
    /// Gzip stream of an [`TransferEncoding::ArrayContainer`] body
    GzipArray,
}

impl TransferEncoding {
    /// Media type sent with bodies in this encoding
    pub fn media_type(&self) -> &'static str {
        match self {
            TransferEncoding::RawCompressed => "application/blosc",
            TransferEncoding::ArrayContainer => "application/blosc-python",
            TransferEncoding::GzipArray => "application/npygz",
        }
    }

    pub fn from_media_type(media_type: &str) -> Option<Self> {
        match media_type.split(';').next().map(str::trim) {
            Some("application/blosc") => Some(TransferEncoding::RawCompressed),
            Some("application/blosc-python") => Some(TransferEncoding::ArrayContainer),
            Some("application/npygz") => Some(TransferEncoding::GzipArray),
            _ => None,
        }
    }

    /// Encode a buffer for transfer
    pub fn encode(&self, codec: &Codec, buffer: &VoxelBuffer) -> Result<Bytes> {
        match self {
            TransferEncoding::RawCompressed => Ok(Bytes::from(codec.encode(buffer)?)),
            TransferEncoding::ArrayContainer => Ok(Bytes::from(encode_container(codec, buffer)?)),
            TransferEncoding::GzipArray => {
                let container = encode_container(codec, buffer)?;
                let mut gz = GzEncoder::new(Vec::new(), FlateCompression::default());
                gz.write_all(&container)?;
                Ok(Bytes::from(gz.finish()?))
            }
        }
    }

    /// Decode a client body that must describe exactly `shape` elements of
    /// `data_type`. Element type disagreements are reported as
    /// `TypeMismatch`, size disagreements as `InvalidRange`.
    pub fn decode(&self, body: &[u8], data_type: DataType, shape: [usize; 4]) -> Result<VoxelBuffer> {
        match self {
            TransferEncoding::RawCompressed => decode_payload(body, data_type, shape),
            TransferEncoding::ArrayContainer => decode_container(body, data_type, shape),
            TransferEncoding::GzipArray => {
                let limit = container_limit(data_type, shape)?;
                let mut container = Vec::new();
                GzDecoder::new(body)
                    .take(limit as u64 + 1)
                    .read_to_end(&mut container)
                    .map_err(|e| SpatialError::corrupt("gzip body", e))?;
                if container.len() > limit {
                    return Err(SpatialError::PayloadTooLarge {
                        requested: format!("more than {}", format_bytes(limit as u64)),
                        limit: format_bytes(limit as u64),
                    });
                }
                decode_container(&container, data_type, shape)
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ContainerHeader {
    data_type: DataType,
    shape: [u64; 4],
}

fn encode_container(codec: &Codec, buffer: &VoxelBuffer) -> Result<Vec<u8>> {
    let header = ContainerHeader {
        data_type: buffer.data_type(),
        shape: buffer.shape().map(|d| d as u64),
    };
    let header = bincode::serialize(&header)?;
    let payload = codec.encode(buffer)?;
    let mut out = Vec::with_capacity(4 + header.len() + payload.len());
    out.extend_from_slice(&(header.len() as u32).to_le_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Raw byte size of `shape` elements of `data_type`.
fn array_bytes(data_type: DataType, shape: [usize; 4]) -> Result<usize> {
    shape
        .iter()
        .try_fold(data_type.size_in_bytes(), |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| SpatialError::InvalidRange(format!("shape {:?} overflows", shape)))
}

/// Largest container a body for `shape` can legitimately inflate to: header
/// framing plus a codec payload no bigger than an incompressible one.
fn container_limit(data_type: DataType, shape: [usize; 4]) -> Result<usize> {
    let raw = array_bytes(data_type, shape)?;
    Ok(raw
        .saturating_add(raw / 64)
        .saturating_add(4 + MAX_CONTAINER_HEADER + HEADER_LEN + 1024))
}

fn decode_container(body: &[u8], data_type: DataType, shape: [usize; 4]) -> Result<VoxelBuffer> {
    if body.len() < 4 {
        return Err(SpatialError::corrupt("array container", "missing header length"));
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&body[..4]);
    let header_len = u32::from_le_bytes(len) as usize;
    if header_len > MAX_CONTAINER_HEADER || body.len() < 4 + header_len {
        return Err(SpatialError::corrupt("array container", "truncated header"));
    }
    let header: ContainerHeader = bincode::deserialize(&body[4..4 + header_len])
        .map_err(|e| SpatialError::corrupt("array container header", e))?;
    if header.data_type != data_type {
        return Err(SpatialError::TypeMismatch {
            expected: data_type.to_string(),
            actual: header.data_type.to_string(),
        });
    }
    // Singleton axes are squeezed away by some clients, so compare voxel counts
    // and the non-unit dimensions rather than the literal shape.
    let declared = header.shape.map(|d| d as usize);
    if squeeze(declared) != squeeze(shape) {
        return Err(SpatialError::InvalidRange(format!(
            "body has shape {:?}, request needs {:?}",
            declared, shape
        )));
    }
    decode_payload(&body[4 + header_len..], data_type, shape)
}

fn squeeze(shape: [usize; 4]) -> Vec<usize> {
    shape.into_iter().filter(|&d| d != 1).collect()
}

fn decode_payload(payload: &[u8], data_type: DataType, shape: [usize; 4]) -> Result<VoxelBuffer> {
    let header = PayloadHeader::parse(payload)?;
    if header.data_type != data_type {
        return Err(SpatialError::TypeMismatch {
            expected: data_type.to_string(),
            actual: header.data_type.to_string(),
        });
    }
    let expected = array_bytes(data_type, shape)?;
    if header.uncompressed_len != expected as u64 {
        return Err(SpatialError::InvalidRange(format!(
            "body holds {} bytes, range needs {}",
            header.uncompressed_len, expected
        )));
    }
    Codec::decode(payload, data_type, shape)
}
