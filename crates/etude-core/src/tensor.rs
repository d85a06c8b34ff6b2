//! N-dimensional tensor model
//!
//! A tensor couples a dtype, a shape, and a storage buffer. Storage is
//! either owned (pool-recyclable, aligned) or shared (externally owned,
//! reference counted). Tensors never free shared data; dropping the last
//! `Arc` clone does.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pool::{AlignedBuf, MemoryPool, POOL_ALIGNMENT};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit IEEE-754 float.
    F32,
    /// bfloat16, stored as the upper 16 bits of an f32.
    Bf16,
    /// Signed 8-bit quantized.
    Int8,
    /// 4-bit quantized, two values per byte.
    Int4,
    /// Mixed-precision quantized blob; opaque bytes at this level.
    Mixed,
}

impl DType {
    /// Storage bits per element.
    pub fn size_bits(&self) -> usize {
        match self {
            DType::F32 => 32,
            DType::Bf16 => 16,
            DType::Int8 => 8,
            DType::Int4 => 4,
            DType::Mixed => 8,
        }
    }

    /// Bytes needed to store `elements` values, rounding up for sub-byte
    /// types.
    pub fn byte_len(&self, elements: usize) -> usize {
        (elements * self.size_bits() + 7) / 8
    }
}

/// Backing memory of a tensor.
#[derive(Debug)]
pub enum Storage {
    /// Owned, aligned, recyclable into a [`MemoryPool`].
    Owned(AlignedBuf),
    /// Externally owned bytes; never freed by the tensor.
    Shared(Arc<[u8]>),
}

/// A dtype-tagged n-dimensional array.
#[derive(Debug)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    storage: Storage,
}

impl Tensor {
    /// Wraps an aligned buffer. The buffer's logical length must match the
    /// dtype/shape byte requirement exactly.
    pub fn from_buf(dtype: DType, shape: Vec<usize>, buf: AlignedBuf) -> Result<Self> {
        let count: usize = shape.iter().product();
        let expected = dtype.byte_len(count);
        if buf.len() != expected {
            return Err(Error::invalid_argument(format!(
                "buffer holds {} bytes but {:?}{:?} needs {}",
                buf.len(),
                dtype,
                shape,
                expected
            )));
        }
        Ok(Self {
            dtype,
            shape,
            storage: Storage::Owned(buf),
        })
    }

    /// Builds an owned f32 tensor by copying `data`. Allocates outside any
    /// pool; intended for weights, bound inputs, and tests.
    pub fn from_f32(shape: Vec<usize>, data: &[f32]) -> Result<Self> {
        let count: usize = shape.iter().product();
        if data.len() != count {
            return Err(Error::invalid_argument(format!(
                "{} values do not fill shape {:?} ({} elements)",
                data.len(),
                shape,
                count
            )));
        }
        let mut buf = AlignedBuf::allocate(count * 4, POOL_ALIGNMENT)?;
        buf.as_f32_mut().copy_from_slice(data);
        Tensor::from_buf(DType::F32, shape, buf)
    }

    /// Builds a BF16 tensor by copying raw `u16` words.
    pub fn from_bf16(shape: Vec<usize>, data: &[u16]) -> Result<Self> {
        let count: usize = shape.iter().product();
        if data.len() != count {
            return Err(Error::invalid_argument(format!(
                "{} values do not fill shape {:?}",
                data.len(),
                shape
            )));
        }
        let mut buf = AlignedBuf::allocate(count * 2, POOL_ALIGNMENT)?;
        buf.as_u16_mut().copy_from_slice(data);
        Tensor::from_buf(DType::Bf16, shape, buf)
    }

    /// Wraps externally owned bytes without copying.
    pub fn from_shared(dtype: DType, shape: Vec<usize>, bytes: Arc<[u8]>) -> Result<Self> {
        let count: usize = shape.iter().product();
        let expected = dtype.byte_len(count);
        if bytes.len() != expected {
            return Err(Error::invalid_argument(format!(
                "shared buffer holds {} bytes but {:?}{:?} needs {}",
                bytes.len(),
                dtype,
                shape,
                expected
            )));
        }
        Ok(Self {
            dtype,
            shape,
            storage: Storage::Shared(bytes),
        })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Product of all dimensions.
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_len(&self) -> usize {
        self.dtype.byte_len(self.element_count())
    }

    /// True when the storage is externally owned.
    pub fn is_shared(&self) -> bool {
        matches!(self.storage, Storage::Shared(_))
    }

    /// Raw bytes, regardless of storage kind.
    pub fn bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Owned(buf) => buf.as_bytes(),
            Storage::Shared(bytes) => bytes,
        }
    }

    /// f32 view. Requires owned f32 storage; shared bytes carry no
    /// alignment guarantee, use [`Tensor::to_f32_vec`] for those.
    pub fn as_f32(&self) -> Result<&[f32]> {
        self.expect_dtype(DType::F32)?;
        match &self.storage {
            Storage::Owned(buf) => Ok(buf.as_f32()),
            Storage::Shared(_) => Err(Error::invalid_state(
                "shared tensor storage has no typed view; copy with to_f32_vec",
            )),
        }
    }

    /// Mutable f32 view. Owned storage only; shared storage is immutable.
    pub fn as_f32_mut(&mut self) -> Result<&mut [f32]> {
        self.expect_dtype(DType::F32)?;
        match &mut self.storage {
            Storage::Owned(buf) => Ok(buf.as_f32_mut()),
            Storage::Shared(_) => Err(Error::invalid_state(
                "shared tensor storage is externally owned and immutable",
            )),
        }
    }

    /// BF16 view over owned storage.
    pub fn as_bf16(&self) -> Result<&[u16]> {
        self.expect_dtype(DType::Bf16)?;
        match &self.storage {
            Storage::Owned(buf) => Ok(buf.as_u16()),
            Storage::Shared(_) => Err(Error::invalid_state(
                "shared tensor storage has no typed view",
            )),
        }
    }

    pub fn as_bf16_mut(&mut self) -> Result<&mut [u16]> {
        self.expect_dtype(DType::Bf16)?;
        match &mut self.storage {
            Storage::Owned(buf) => Ok(buf.as_u16_mut()),
            Storage::Shared(_) => Err(Error::invalid_state(
                "shared tensor storage is externally owned and immutable",
            )),
        }
    }

    /// Copies the tensor into a `Vec<f32>`, decoding little-endian bytes
    /// when the storage is shared.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        self.expect_dtype(DType::F32)?;
        match &self.storage {
            Storage::Owned(buf) => Ok(buf.as_f32().to_vec()),
            Storage::Shared(bytes) => Ok(bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()),
        }
    }

    /// Deep-copies the tensor into pool-owned storage.
    pub fn duplicate(&self, pool: &MemoryPool) -> Result<Tensor> {
        let mut buf = pool.alloc_raw(self.byte_len())?;
        buf.as_bytes_mut().copy_from_slice(self.bytes());
        Tensor::from_buf(self.dtype, self.shape.clone(), buf)
    }

    /// Consumes the tensor, surrendering its storage (used by the pool's
    /// recycler).
    pub fn into_storage(self) -> Storage {
        self.storage
    }

    fn expect_dtype(&self, want: DType) -> Result<()> {
        if self.dtype != want {
            return Err(Error::invalid_state(format!(
                "tensor is {:?}, expected {:?}",
                self.dtype, want
            )));
        }
        Ok(())
    }
}
