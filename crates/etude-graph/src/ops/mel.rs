//! Mel-scale projection operator

use std::sync::Arc;

use etude_core::{DType, Error, MemoryPool, Result, Tensor};
use etude_kernels::dispatch;
use serde_json::Value;

use super::{
    attr_f32_or, attr_usize, resolve_weight_opt, single_input, BuildCtx, OpKernel, Operator,
};
use crate::runtime::Runtime;

/// Factory for `"mel_scale"` nodes.
///
/// Projects a magnitude spectrogram `(n_frames, n_bins)` through a
/// filterbank `(n_mels, n_bins)` transposed. Filters come inline
/// (`filters`/`filters_layer`) or are synthesized as triangular mel
/// filters from `sample_rate` (default 22050) at first forward, when the
/// bin count is known.
pub struct MelScaleOp;

impl Operator for MelScaleOp {
    fn op_type(&self) -> &str {
        "mel_scale"
    }

    fn create(&self, attrs: &Value, ctx: &BuildCtx<'_>) -> Result<Box<dyn OpKernel>> {
        let n_mels = attr_usize(attrs, "n_mels")?;
        if n_mels == 0 {
            return Err(Error::invalid_argument("mel_scale: n_mels must be > 0"));
        }
        let sample_rate = attr_f32_or(attrs, "sample_rate", 22_050.0)?;
        // Inline filters need the bin count to be declared up front.
        let filters = match attrs.get("n_bins").and_then(Value::as_u64) {
            Some(n_bins) => {
                resolve_weight_opt(attrs, "filters", ctx, &[n_mels, n_bins as usize])?
            }
            None => None,
        };
        Ok(Box::new(MelScaleKernel {
            n_mels,
            sample_rate,
            filters,
        }))
    }
}

pub struct MelScaleKernel {
    n_mels: usize,
    sample_rate: f32,
    filters: Option<Arc<Tensor>>,
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10f32.powf(mel / 2595.0) - 1.0)
}

/// Triangular mel filterbank of shape `(n_mels, n_bins)` covering
/// 0..sample_rate/2.
fn mel_filterbank(n_mels: usize, n_bins: usize, sample_rate: f32) -> Result<Tensor> {
    let nyquist = sample_rate / 2.0;
    let mel_max = hz_to_mel(nyquist);
    // n_mels + 2 edge points, equally spaced on the mel scale.
    let edges: Vec<f32> = (0..n_mels + 2)
        .map(|i| {
            let hz = mel_to_hz(mel_max * i as f32 / (n_mels + 1) as f32);
            hz / nyquist * (n_bins - 1) as f32
        })
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_bins];
    for m in 0..n_mels {
        let (left, center, right) = (edges[m], edges[m + 1], edges[m + 2]);
        for bin in 0..n_bins {
            let f = bin as f32;
            let weight = if f > left && f < center {
                (f - left) / (center - left).max(f32::EPSILON)
            } else if (f - center).abs() < f32::EPSILON {
                1.0
            } else if f > center && f < right {
                (right - f) / (right - center).max(f32::EPSILON)
            } else {
                0.0
            };
            filters[m * n_bins + bin] = weight;
        }
    }
    Tensor::from_f32(vec![n_mels, n_bins], &filters)
}

impl OpKernel for MelScaleKernel {
    fn op_type(&self) -> &str {
        "mel_scale"
    }

    fn forward(
        &mut self,
        runtime: &Runtime,
        inputs: &[&Tensor],
        pool: &MemoryPool,
    ) -> Result<Vec<Tensor>> {
        let input = single_input("mel_scale", inputs)?;
        let [n_frames, n_bins] = input.shape() else {
            return Err(Error::invalid_argument(format!(
                "mel_scale: expected (n_frames, n_bins) input, got {:?}",
                input.shape()
            )));
        };
        let (n_frames, n_bins) = (*n_frames, *n_bins);

        if self.filters.is_none() {
            self.filters = Some(Arc::new(mel_filterbank(
                self.n_mels,
                n_bins,
                self.sample_rate,
            )?));
        }
        let filters = self.filters.as_ref().unwrap();
        if filters.shape() != [self.n_mels, n_bins] {
            return Err(Error::invalid_argument(format!(
                "mel_scale: filterbank {:?} does not match {n_bins} input bins",
                filters.shape()
            )));
        }

        let mut out = pool.alloc(DType::F32, &[n_frames, self.n_mels])?;
        dispatch::mel_filterbank_optimal(
            &runtime.kernels,
            input.as_f32()?,
            filters.as_f32()?,
            out.as_f32_mut()?,
            n_frames,
            n_bins,
            self.n_mels,
        )?;
        Ok(vec![out])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_explicit_filters() {
        let rt = Runtime::new().unwrap();
        let pool = MemoryPool::new(1 << 20);
        let mut k = MelScaleOp
            .create(
                &json!({
                    "n_mels": 2,
                    "n_bins": 3,
                    "filters": [1.0, 0.0, 0.0, 0.0, 0.5, 0.5],
                }),
                &BuildCtx::default(),
            )
            .unwrap();
        let spec = Tensor::from_f32(vec![2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let out = k.forward(&rt, &[&spec], &pool).unwrap();
        assert_eq!(out[0].shape(), &[2, 2]);
        assert_eq!(out[0].as_f32().unwrap(), &[1.0, 2.5, 4.0, 5.5]);
    }

    #[test]
    fn test_synthesized_filterbank_properties() {
        let rt = Runtime::new().unwrap();
        let pool = MemoryPool::new(1 << 20);
        let mut k = MelScaleOp
            .create(&json!({"n_mels": 8}), &BuildCtx::default())
            .unwrap();
        let spec = Tensor::from_f32(vec![1, 65], &[1.0; 65]).unwrap();
        let out = k.forward(&rt, &[&spec], &pool).unwrap();
        assert_eq!(out[0].shape(), &[1, 8]);
        // Non-negative responses, and at least one filter fires on a
        // flat spectrum.
        let y = out[0].as_f32().unwrap();
        assert!(y.iter().all(|&v| v >= 0.0));
        assert!(y.iter().any(|&v| v > 0.0));
    }

    #[test]
    fn test_filterbank_shape_and_peaks() {
        let fb = mel_filterbank(4, 33, 16_000.0).unwrap();
        assert_eq!(fb.shape(), &[4, 33]);
        let data = fb.as_f32().unwrap();
        for m in 0..4 {
            let row = &data[m * 33..(m + 1) * 33];
            let max = row.iter().fold(0.0f32, |a, &b| a.max(b));
            assert!(max > 0.0, "filter {m} is empty");
            assert!(max <= 1.0 + 1e-6);
        }
    }

    #[test]
    fn test_rank_mismatch_rejected() {
        let rt = Runtime::new().unwrap();
        let pool = MemoryPool::new(1 << 20);
        let mut k = MelScaleOp
            .create(&json!({"n_mels": 4}), &BuildCtx::default())
            .unwrap();
        let bad = Tensor::from_f32(vec![6], &[0.0; 6]).unwrap();
        assert!(matches!(
            k.forward(&rt, &[&bad], &pool),
            Err(Error::InvalidArgument(_))
        ));
    }
}
