//! Short-time Fourier transform operator
//!
//! Frames the input, applies the analysis window, and evaluates a direct
//! DFT per frame against precomputed cosine/sine tables (each bin is a
//! dot product, so the dispatch façade carries the inner loops). Outputs
//! magnitude and phase, each `(n_frames, n_fft/2 + 1)`.

use etude_core::{DType, Error, MemoryPool, Result, Tensor};
use etude_kernels::dispatch;
use serde_json::Value;

use super::{attr_str_or, attr_usize, attr_usize_or, single_input, BuildCtx, OpKernel, Operator};
use crate::runtime::Runtime;

/// Factory for `"stft"` nodes.
///
/// Attributes: `n_fft`, `hop_length`, `window` (`"hann"` default or
/// `"rect"`).
pub struct StftOp;

impl Operator for StftOp {
    fn op_type(&self) -> &str {
        "stft"
    }

    fn create(&self, attrs: &Value, _ctx: &BuildCtx<'_>) -> Result<Box<dyn OpKernel>> {
        let n_fft = attr_usize(attrs, "n_fft")?;
        let hop = attr_usize_or(attrs, "hop_length", n_fft / 4)?;
        if n_fft == 0 || hop == 0 {
            return Err(Error::invalid_argument("stft: n_fft and hop_length must be > 0"));
        }
        let window = match attr_str_or(attrs, "window", "hann")? {
            "hann" => hann_window(n_fft),
            "rect" => vec![1.0; n_fft],
            other => {
                return Err(Error::invalid_argument(format!(
                    "stft: unknown window '{other}'"
                )))
            }
        };

        // One cosine and one sine row per bin, n_fft samples each.
        let n_bins = n_fft / 2 + 1;
        let mut cos_table = vec![0.0f32; n_bins * n_fft];
        let mut sin_table = vec![0.0f32; n_bins * n_fft];
        for bin in 0..n_bins {
            for n in 0..n_fft {
                let angle = 2.0 * std::f64::consts::PI * bin as f64 * n as f64 / n_fft as f64;
                cos_table[bin * n_fft + n] = angle.cos() as f32;
                sin_table[bin * n_fft + n] = angle.sin() as f32;
            }
        }

        Ok(Box::new(StftKernel {
            n_fft,
            hop,
            window,
            cos_table,
            sin_table,
        }))
    }
}

fn hann_window(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| {
            let phase = 2.0 * std::f64::consts::PI * i as f64 / n as f64;
            (0.5 - 0.5 * phase.cos()) as f32
        })
        .collect()
}

pub struct StftKernel {
    n_fft: usize,
    hop: usize,
    window: Vec<f32>,
    cos_table: Vec<f32>,
    sin_table: Vec<f32>,
}

impl OpKernel for StftKernel {
    fn op_type(&self) -> &str {
        "stft"
    }

    fn forward(
        &mut self,
        runtime: &Runtime,
        inputs: &[&Tensor],
        pool: &MemoryPool,
    ) -> Result<Vec<Tensor>> {
        let input = single_input("stft", inputs)?;
        let samples = input.as_f32()?;
        let len = samples.len();
        if len < self.n_fft {
            return Err(Error::invalid_argument(format!(
                "stft: {len} samples shorter than n_fft {}",
                self.n_fft
            )));
        }
        let n_frames = (len - self.n_fft) / self.hop + 1;
        let n_bins = self.n_fft / 2 + 1;

        let mut magnitude = pool.alloc(DType::F32, &[n_frames, n_bins])?;
        let mut phase = pool.alloc(DType::F32, &[n_frames, n_bins])?;

        let mut windowed = vec![0.0f32; self.n_fft];
        let mut re = vec![0.0f32; n_bins];
        let mut im = vec![0.0f32; n_bins];

        let mag = magnitude.as_f32_mut()?;
        let ph = phase.as_f32_mut()?;
        for frame in 0..n_frames {
            let start = frame * self.hop;
            dispatch::window_apply_optimal(
                &runtime.kernels,
                &samples[start..start + self.n_fft],
                &self.window,
                &mut windowed,
            )?;

            for bin in 0..n_bins {
                let cos_row = &self.cos_table[bin * self.n_fft..(bin + 1) * self.n_fft];
                let sin_row = &self.sin_table[bin * self.n_fft..(bin + 1) * self.n_fft];
                re[bin] = dispatch::vector_dot_optimal(&runtime.kernels, &windowed, cos_row)?;
                im[bin] = -dispatch::vector_dot_optimal(&runtime.kernels, &windowed, sin_row)?;
            }

            dispatch::complex_magnitude_optimal(
                &runtime.kernels,
                &re,
                &im,
                &mut mag[frame * n_bins..(frame + 1) * n_bins],
            )?;
            for bin in 0..n_bins {
                ph[frame * n_bins + bin] = im[bin].atan2(re[bin]);
            }
        }

        Ok(vec![magnitude, phase])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_count() {
        let rt = Runtime::new().unwrap();
        let pool = MemoryPool::new(1 << 22);
        let mut k = StftOp
            .create(&json!({"n_fft": 8, "hop_length": 4, "window": "rect"}), &BuildCtx::default())
            .unwrap();
        let x = Tensor::from_f32(vec![20], &[0.0; 20]).unwrap();
        let out = k.forward(&rt, &[&x], &pool).unwrap();
        // (20 - 8)/4 + 1 = 4 frames, 8/2 + 1 = 5 bins, two outputs.
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].shape(), &[4, 5]);
        assert_eq!(out[1].shape(), &[4, 5]);
    }

    #[test]
    fn test_dc_signal_lands_in_bin_zero() {
        let rt = Runtime::new().unwrap();
        let pool = MemoryPool::new(1 << 22);
        let mut k = StftOp
            .create(&json!({"n_fft": 8, "hop_length": 8, "window": "rect"}), &BuildCtx::default())
            .unwrap();
        let x = Tensor::from_f32(vec![8], &[1.0; 8]).unwrap();
        let out = k.forward(&rt, &[&x], &pool).unwrap();
        let mag = out[0].as_f32().unwrap();
        // DC bin collects the full energy (8), every other bin is ~0.
        assert!((mag[0] - 8.0).abs() < 1e-3);
        for &m in &mag[1..] {
            assert!(m.abs() < 1e-3, "leakage {m}");
        }
    }

    #[test]
    fn test_pure_tone_peaks_at_its_bin() {
        let rt = Runtime::new().unwrap();
        let pool = MemoryPool::new(1 << 22);
        let n_fft = 16;
        let mut k = StftOp
            .create(
                &json!({"n_fft": n_fft, "hop_length": n_fft, "window": "rect"}),
                &BuildCtx::default(),
            )
            .unwrap();
        // Two full cycles across the frame: energy in bin 2.
        let samples: Vec<f32> = (0..n_fft)
            .map(|i| (2.0 * std::f32::consts::PI * 2.0 * i as f32 / n_fft as f32).cos())
            .collect();
        let x = Tensor::from_f32(vec![n_fft], &samples).unwrap();
        let out = k.forward(&rt, &[&x], &pool).unwrap();
        let mag = out[0].as_f32().unwrap();
        let peak = mag
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        assert_eq!(peak, 2);
    }

    #[test]
    fn test_short_input_rejected() {
        let rt = Runtime::new().unwrap();
        let pool = MemoryPool::new(1 << 22);
        let mut k = StftOp
            .create(&json!({"n_fft": 16, "hop_length": 4}), &BuildCtx::default())
            .unwrap();
        let x = Tensor::from_f32(vec![8], &[0.0; 8]).unwrap();
        assert!(matches!(
            k.forward(&rt, &[&x], &pool),
            Err(Error::InvalidArgument(_))
        ));
    }
}
