//! Vocoder operator: learned upsampling from mel frames to audio

use std::sync::Arc;

use etude_core::{DType, Error, MemoryPool, Result, Tensor};
use etude_kernels::dispatch;
use serde_json::Value;

use super::{attr_usize, resolve_weight, single_input, BuildCtx, OpKernel, Operator};
use crate::runtime::Runtime;

/// Factory for `"vocoder"` nodes.
///
/// Upsamples `(n_frames, mel_channels)` (or batched
/// `(B, n_frames, mel_channels)`) to `n_frames * upsample_factor` audio
/// samples per batch item: each frame projects through the learned
/// `(mel_channels, upsample_factor)` matrix, then a tanh keeps the
/// waveform in range.
///
/// Attributes: `mel_channels`, `upsample_factor`,
/// `weight`/`weight_layer`.
pub struct VocoderOp;

impl Operator for VocoderOp {
    fn op_type(&self) -> &str {
        "vocoder"
    }

    fn create(&self, attrs: &Value, ctx: &BuildCtx<'_>) -> Result<Box<dyn OpKernel>> {
        let mel_channels = attr_usize(attrs, "mel_channels")?;
        let upsample_factor = attr_usize(attrs, "upsample_factor")?;
        if mel_channels == 0 || upsample_factor == 0 {
            return Err(Error::invalid_argument(
                "vocoder: mel_channels and upsample_factor must be > 0",
            ));
        }
        let weight = resolve_weight(attrs, "weight", ctx, &[mel_channels, upsample_factor])?;
        Ok(Box::new(VocoderKernel {
            mel_channels,
            upsample_factor,
            weight,
        }))
    }
}

pub struct VocoderKernel {
    mel_channels: usize,
    upsample_factor: usize,
    weight: Arc<Tensor>,
}

impl OpKernel for VocoderKernel {
    fn op_type(&self) -> &str {
        "vocoder"
    }

    fn forward(
        &mut self,
        runtime: &Runtime,
        inputs: &[&Tensor],
        pool: &MemoryPool,
    ) -> Result<Vec<Tensor>> {
        let input = single_input("vocoder", inputs)?;
        let (batch, frames) = match input.shape() {
            [f, c] if *c == self.mel_channels => (1usize, *f),
            [b, f, c] if *c == self.mel_channels => (*b, *f),
            other => {
                return Err(Error::invalid_argument(format!(
                    "vocoder: input shape {other:?} does not end in {} mel channels",
                    self.mel_channels
                )))
            }
        };
        let out_len = frames * self.upsample_factor;
        let out_shape = if input.rank() == 2 {
            vec![out_len]
        } else {
            vec![batch, out_len]
        };

        let mel = input.as_f32()?;
        let mut out = pool.alloc(DType::F32, &out_shape)?;
        let audio = out.as_f32_mut()?;

        // (frames, C) x (C, U) lays the upsampled frames out
        // consecutively, which is exactly the audio stream.
        for b in 0..batch {
            let mel_b = &mel[b * frames * self.mel_channels..(b + 1) * frames * self.mel_channels];
            let audio_b = &mut audio[b * out_len..(b + 1) * out_len];
            dispatch::matmul_optimal(
                &runtime.kernels,
                mel_b,
                self.weight.as_f32()?,
                audio_b,
                frames,
                self.mel_channels,
                self.upsample_factor,
            )?;
        }

        // Saturate to the waveform range.
        let mut clamped = vec![0.0f32; audio.len()];
        dispatch::tanh_optimal(&runtime.kernels, audio, &mut clamped)?;
        audio.copy_from_slice(&clamped);

        Ok(vec![out])
    }
}
