//! Fused composite operators
//!
//! Products of the peephole fusion pass, also registrable directly from a
//! descriptor. A fused kernel chains two stages: the second consumes one
//! output of the first, intermediate tensors go straight back to the
//! pool, and any other first-stage outputs are dropped (STFT -> MelScale
//! loses the phase plane by construction).

use etude_core::{Error, MemoryPool, Result, Tensor};
use serde_json::Value;

use super::{activation, conv1d, linear, mel, stft, BuildCtx, OpKernel, Operator};
use crate::runtime::Runtime;

/// Two-stage composite kernel.
pub struct FusedKernel {
    op_type: String,
    first: Box<dyn OpKernel>,
    second: Box<dyn OpKernel>,
    /// Which output of `first` feeds `second`.
    mid_slot: usize,
}

impl FusedKernel {
    pub fn new(
        op_type: impl Into<String>,
        first: Box<dyn OpKernel>,
        second: Box<dyn OpKernel>,
        mid_slot: usize,
    ) -> Self {
        Self {
            op_type: op_type.into(),
            first,
            second,
            mid_slot,
        }
    }

    /// Builds the composite for a fused `op_type`, reusing the two
    /// existing stage kernels (the fusion pass path).
    pub fn compose(
        first_type: &str,
        second_type: &str,
        first: Box<dyn OpKernel>,
        second: Box<dyn OpKernel>,
    ) -> Result<Self> {
        let op_type = match (first_type, second_type) {
            ("linear", "relu") => "linear_relu",
            ("conv1d", "relu") => "conv1d_relu",
            ("stft", "mel_scale") => "stft_mel",
            other => {
                return Err(Error::invalid_state(format!(
                    "no fused form for {other:?}"
                )))
            }
        };
        Ok(Self::new(op_type, first, second, 0))
    }
}

impl OpKernel for FusedKernel {
    fn op_type(&self) -> &str {
        &self.op_type
    }

    fn forward(
        &mut self,
        runtime: &Runtime,
        inputs: &[&Tensor],
        pool: &MemoryPool,
    ) -> Result<Vec<Tensor>> {
        let mut mid = self.first.forward(runtime, inputs, pool)?;
        if self.mid_slot >= mid.len() {
            return Err(Error::invalid_state(format!(
                "{}: first stage produced {} outputs, need slot {}",
                self.op_type,
                mid.len(),
                self.mid_slot
            )));
        }
        let feed = mid.swap_remove(self.mid_slot);
        let outputs = self.second.forward(runtime, &[&feed], pool)?;
        pool.recycle(feed);
        for dropped in mid {
            pool.recycle(dropped);
        }
        Ok(outputs)
    }
}

macro_rules! fused_factory {
    ($(#[$meta:meta])* $factory:ident, $name:literal, $first:expr, $second:expr) => {
        $(#[$meta])*
        pub struct $factory;

        impl Operator for $factory {
            fn op_type(&self) -> &str {
                $name
            }

            fn create(&self, attrs: &Value, ctx: &BuildCtx<'_>) -> Result<Box<dyn OpKernel>> {
                let first = $first.create(attrs, ctx)?;
                let second = $second.create(attrs, ctx)?;
                Ok(Box::new(FusedKernel::new($name, first, second, 0)))
            }
        }
    };
}

fused_factory!(
    /// Linear with the ReLU absorbed.
    LinearReluOp, "linear_relu", linear::LinearOp, activation::ReluOp
);
fused_factory!(
    /// Conv1D with the ReLU absorbed.
    Conv1dReluOp, "conv1d_relu", conv1d::Conv1dOp, activation::ReluOp
);
fused_factory!(
    /// STFT feeding MelScale directly; the phase output is dropped.
    StftMelOp, "stft_mel", stft::StftOp, mel::MelScaleOp
);
