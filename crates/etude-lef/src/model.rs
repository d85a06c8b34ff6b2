//! Loaded-model handle
//!
//! Materializes a container's layers into tensors inside a dedicated
//! memory pool and keeps them addressable by layer id. Quantized layers
//! dequantize at load (linear INT8 with params, FP16/BF16 widening);
//! INT4 and mixed blobs stay as raw bytes for the consumer to interpret.
//! Dropping the model frees the pool and the map together.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use etude_core::{DType, Error, MemoryPool, Result, Tensor};
use log::debug;

use crate::consts::QuantKind;
use crate::format::ModelMetadata;
use crate::reader::LefReader;

/// Headroom multiplier for the model pool: dequantization can widen
/// payloads up to 4x (INT8 -> f32), plus alignment rounding.
const POOL_HEADROOM: usize = 5;

/// A loaded model: metadata plus the layer-id -> tensor map.
pub struct Model {
    metadata: ModelMetadata,
    pool: MemoryPool,
    tensors: HashMap<u16, Arc<Tensor>>,
}

impl Model {
    /// Loads a container file, fetching and materializing every layer.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_reader(&LefReader::open(path)?)
    }

    /// Materializes all layers of an already-validated reader.
    pub fn from_reader(reader: &LefReader) -> Result<Self> {
        let total_raw: usize = reader
            .layer_ids()
            .iter()
            .map(|&id| {
                reader
                    .get_layer_header(id)
                    .map(|h| h.data_size as usize)
                    .unwrap_or(0)
            })
            .sum();
        let pool = MemoryPool::new(total_raw * POOL_HEADROOM + (1 << 20));

        let mut tensors = HashMap::new();
        for id in reader.layer_ids() {
            let header = reader.get_layer_header(id)?;
            let data = reader.get_layer_data(id)?;
            let shape = layer_shape(reader, id, &header.quantization, data.len())?;
            let tensor = materialize(&pool, reader, id, header.quantization, &data, shape)?;
            tensors.insert(id, Arc::new(tensor));
        }

        debug!(
            "loaded model '{}': {} layers, {} pool bytes",
            reader.metadata().name,
            tensors.len(),
            pool.in_use()
        );
        Ok(Self {
            metadata: reader.metadata().clone(),
            pool,
            tensors,
        })
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn num_layers(&self) -> usize {
        self.tensors.len()
    }

    /// The tensor stored under a layer id.
    pub fn get(&self, layer_id: u16) -> Result<Arc<Tensor>> {
        self.tensors
            .get(&layer_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("layer {layer_id}")))
    }

    /// The full layer map, in the shape the graph builder consumes.
    pub fn weights(&self) -> &HashMap<u16, Arc<Tensor>> {
        &self.tensors
    }

    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    /// Explicit unload; equivalent to dropping the value.
    pub fn unload(self) {}
}

/// Shape from the per-layer metadata blob (`{"shape": [...]}`), falling
/// back to a flat vector sized by the element count.
fn layer_shape(
    reader: &LefReader,
    id: u16,
    quantization: &QuantKind,
    data_len: usize,
) -> Result<Vec<usize>> {
    if let Some(blob) = reader.get_layer_metadata(id)? {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&blob) {
            if let Some(dims) = value.get("shape").and_then(|s| s.as_array()) {
                let shape: Option<Vec<usize>> =
                    dims.iter().map(|d| d.as_u64().map(|v| v as usize)).collect();
                if let Some(shape) = shape {
                    return Ok(shape);
                }
            }
        }
    }
    let elements = match quantization {
        QuantKind::None => data_len / 4,
        QuantKind::Fp16 | QuantKind::Bf16 => data_len / 2,
        QuantKind::Int8 | QuantKind::Mixed => data_len,
        QuantKind::Int4 => data_len * 2,
    };
    Ok(vec![elements])
}

fn materialize(
    pool: &MemoryPool,
    reader: &LefReader,
    id: u16,
    quantization: QuantKind,
    data: &[u8],
    shape: Vec<usize>,
) -> Result<Tensor> {
    match quantization {
        QuantKind::None => {
            if data.len() % 4 != 0 {
                return Err(Error::format(format!(
                    "layer {id}: f32 payload of {} bytes",
                    data.len()
                )));
            }
            let mut tensor = pool.alloc(DType::F32, &shape)?;
            let out = tensor.as_f32_mut()?;
            if out.len() != data.len() / 4 {
                return Err(Error::format(format!(
                    "layer {id}: shape {shape:?} does not match payload"
                )));
            }
            for (v, chunk) in out.iter_mut().zip(data.chunks_exact(4)) {
                *v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
            Ok(tensor)
        }
        QuantKind::Bf16 => {
            let mut tensor = pool.alloc(DType::Bf16, &shape)?;
            let out = tensor.as_bf16_mut()?;
            if out.len() != data.len() / 2 {
                return Err(Error::format(format!(
                    "layer {id}: shape {shape:?} does not match payload"
                )));
            }
            for (v, chunk) in out.iter_mut().zip(data.chunks_exact(2)) {
                *v = u16::from_le_bytes([chunk[0], chunk[1]]);
            }
            Ok(tensor)
        }
        QuantKind::Fp16 => {
            // Widened to f32 at load; the runtime has no half-float path.
            let mut tensor = pool.alloc(DType::F32, &shape)?;
            let out = tensor.as_f32_mut()?;
            if out.len() != data.len() / 2 {
                return Err(Error::format(format!(
                    "layer {id}: shape {shape:?} does not match payload"
                )));
            }
            for (v, chunk) in out.iter_mut().zip(data.chunks_exact(2)) {
                *v = half_to_f32(u16::from_le_bytes([chunk[0], chunk[1]]));
            }
            Ok(tensor)
        }
        QuantKind::Int8 => match reader.get_quant_params(id)? {
            Some(params) => {
                let mut tensor = pool.alloc(DType::F32, &shape)?;
                let out = tensor.as_f32_mut()?;
                if out.len() != data.len() {
                    return Err(Error::format(format!(
                        "layer {id}: shape {shape:?} does not match payload"
                    )));
                }
                for (v, &q) in out.iter_mut().zip(data.iter()) {
                    *v = (q as i8 as i32 - params.zero_point) as f32 * params.scale;
                }
                Ok(tensor)
            }
            None => raw_tensor(pool, DType::Int8, shape, data),
        },
        QuantKind::Int4 => raw_tensor(pool, DType::Int4, shape, data),
        QuantKind::Mixed => raw_tensor(pool, DType::Mixed, shape, data),
    }
}

fn raw_tensor(pool: &MemoryPool, dtype: DType, shape: Vec<usize>, data: &[u8]) -> Result<Tensor> {
    let mut buf = pool.alloc_raw(data.len())?;
    buf.as_bytes_mut().copy_from_slice(data);
    Tensor::from_buf(dtype, shape, buf)
}

/// IEEE-754 binary16 -> binary32.
fn half_to_f32(half: u16) -> f32 {
    let sign = (half >> 15) as u32;
    let exponent = ((half >> 10) & 0x1F) as u32;
    let fraction = (half & 0x3FF) as u32;

    let bits = match (exponent, fraction) {
        (0, 0) => sign << 31,
        (0, f) => {
            // Subnormal half: renormalize into the f32 exponent range.
            let mut exp = 113u32;
            let mut frac = f;
            while frac & 0x400 == 0 {
                frac <<= 1;
                exp -= 1;
            }
            (sign << 31) | (exp << 23) | ((frac & 0x3FF) << 13)
        }
        (31, 0) => (sign << 31) | 0x7F80_0000,
        (31, _) => (sign << 31) | 0x7FC0_0000,
        (exp, frac) => (sign << 31) | ((exp + 112) << 23) | (frac << 13),
    };
    f32::from_bits(bits)
}
