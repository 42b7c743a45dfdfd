//! Dense voxel buffers used for cutouts and decoded cuboids

use crate::error::{Result, SpatialError};
use crate::layout::Block;
use crate::types::{DataType, Voxel};
use ndarray::{s, ArrayView4, ArrayViewMut4};

/// A dense `(t, z, y, x)` array of voxels stored as little-endian bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoxelBuffer {
    data_type: DataType,
    shape: [usize; 4],
    data: Vec<u8>,
}

impl VoxelBuffer {
    /// Wrap raw little-endian bytes; the length must match the shape exactly.
    pub fn new(data_type: DataType, shape: [usize; 4], data: Vec<u8>) -> Result<Self> {
        let expected = byte_len(data_type, shape)?;
        if data.len() != expected {
            return Err(SpatialError::InvalidRange(format!(
                "buffer holds {} bytes but shape {:?} of {} needs {}",
                data.len(),
                shape,
                data_type,
                expected
            )));
        }
        Ok(Self {
            data_type,
            shape,
            data,
        })
    }

    /// All-background buffer.
    pub fn zeros(data_type: DataType, shape: [usize; 4]) -> Result<Self> {
        let len = byte_len(data_type, shape)?;
        Ok(Self {
            data_type,
            shape,
            data: vec![0; len],
        })
    }

    /// Create a buffer from typed voxels in C order
    pub fn from_voxels<T: Voxel>(shape: [usize; 4], voxels: &[T]) -> Result<Self> {
        let mut data = Vec::with_capacity(std::mem::size_of_val(voxels));
        for &v in voxels {
            v.write_le(&mut data);
        }
        Self::new(T::DATA_TYPE, shape, data)
    }

    /// Copy the voxels out as `T`; fails if `T` is not the buffer type
    pub fn to_voxels<T: Voxel>(&self) -> Result<Vec<T>> {
        if T::DATA_TYPE != self.data_type {
            return Err(SpatialError::TypeMismatch {
                expected: self.data_type.to_string(),
                actual: T::DATA_TYPE.to_string(),
            });
        }
        Ok(self
            .data
            .chunks_exact(self.data_type.size_in_bytes())
            .map(T::read_le)
            .collect())
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn voxel_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Raw little-endian voxel bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// True when every voxel is zero.
    pub fn is_background(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }

    /// Byte view with the element width folded into the x axis.
    fn view(&self) -> Result<ArrayView4<'_, u8>> {
        let [t, z, y, x] = self.shape;
        ArrayView4::from_shape((t, z, y, x * self.data_type.size_in_bytes()), &self.data)
            .map_err(|e| SpatialError::InvalidRange(e.to_string()))
    }

    fn view_mut(&mut self) -> Result<ArrayViewMut4<'_, u8>> {
        let [t, z, y, x] = self.shape;
        let width = self.data_type.size_in_bytes();
        ArrayViewMut4::from_shape((t, z, y, x * width), &mut self.data)
            .map_err(|e| SpatialError::InvalidRange(e.to_string()))
    }

    /// Copy `src_block` of `src` into this buffer starting at `dst_start`.
    pub fn copy_from(&mut self, src: &VoxelBuffer, src_block: &Block, dst_start: [usize; 4]) -> Result<()> {
        if src.data_type != self.data_type {
            return Err(SpatialError::TypeMismatch {
                expected: self.data_type.to_string(),
                actual: src.data_type.to_string(),
            });
        }
        let dst_block = Block::new(dst_start, src_block.shape);
        check_inside(src_block, src.shape)?;
        check_inside(&dst_block, self.shape)?;

        let width = self.data_type.size_in_bytes();
        let source = src.view()?;
        let source = source.slice(block_slice(src_block, width));
        let mut target = self.view_mut()?;
        target.slice_mut(block_slice(&dst_block, width)).assign(&source);
        Ok(())
    }

    /// Extract `block` into a new buffer.
    pub fn crop(&self, block: &Block) -> Result<VoxelBuffer> {
        let mut out = VoxelBuffer::zeros(self.data_type, block.shape)?;
        out.copy_from(self, block, [0; 4])?;
        Ok(out)
    }
}

fn byte_len(data_type: DataType, shape: [usize; 4]) -> Result<usize> {
    shape
        .iter()
        .try_fold(data_type.size_in_bytes(), |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| SpatialError::InvalidRange(format!("shape {:?} overflows", shape)))
}

fn check_inside(block: &Block, shape: [usize; 4]) -> Result<()> {
    let fits = (0..4).all(|i| block.start[i] + block.shape[i] <= shape[i]);
    if !fits {
        return Err(SpatialError::InvalidRange(format!(
            "block at {:?} of {:?} does not fit in {:?}",
            block.start, block.shape, shape
        )));
    }
    Ok(())
}

fn block_slice(block: &Block, width: usize) -> ndarray::SliceInfo<[ndarray::SliceInfoElem; 4], ndarray::Ix4, ndarray::Ix4> {
    let [t, z, y, x] = block.start;
    let [nt, nz, ny, nx] = block.shape;
    s![t..t + nt, z..z + nz, y..y + ny, x * width..(x + nx) * width]
}
