//! Elementwise activation operators
//!
//! Single-input, single-output, shape-preserving. All of them support the
//! in-place rewrite; the in-place path mutates the buffer directly with
//! the same bounded approximations the scalar kernels use (input and
//! output alias, so the two-slice SIMD kernels cannot be borrowed).

use etude_core::{DType, MemoryPool, Result, Tensor};
use etude_kernels::{dispatch, scalar};
use serde_json::Value;

use super::{BuildCtx, OpKernel, Operator};
use crate::runtime::Runtime;

macro_rules! activation_op {
    ($(#[$meta:meta])* $factory:ident, $kernel:ident, $name:literal, $optimal:path, $inplace:expr) => {
        $(#[$meta])*
        pub struct $factory;

        impl Operator for $factory {
            fn op_type(&self) -> &str {
                $name
            }

            fn create(&self, _attrs: &Value, _ctx: &BuildCtx<'_>) -> Result<Box<dyn OpKernel>> {
                Ok(Box::new($kernel))
            }
        }

        pub struct $kernel;

        impl OpKernel for $kernel {
            fn op_type(&self) -> &str {
                $name
            }

            fn forward(
                &mut self,
                runtime: &Runtime,
                inputs: &[&Tensor],
                pool: &MemoryPool,
            ) -> Result<Vec<Tensor>> {
                let input = super::single_input($name, inputs)?;
                let x = input.as_f32()?;
                let mut out = pool.alloc(DType::F32, input.shape())?;
                $optimal(&runtime.kernels, x, out.as_f32_mut()?)?;
                Ok(vec![out])
            }

            fn supports_inplace(&self) -> bool {
                true
            }

            fn forward_inplace(&mut self, _runtime: &Runtime, tensor: &mut Tensor) -> Result<()> {
                let data = tensor.as_f32_mut()?;
                let apply: fn(f32) -> f32 = $inplace;
                for v in data.iter_mut() {
                    *v = apply(*v);
                }
                Ok(())
            }
        }
    };
}

activation_op!(
    /// `max(x, 0)`.
    ReluOp, ReluKernel, "relu", dispatch::relu_optimal,
    |v| v.max(0.0)
);
activation_op!(
    /// Bounded sigmoid.
    SigmoidOp, SigmoidKernel, "sigmoid", dispatch::sigmoid_optimal,
    |v| 0.5 + 0.5 * scalar::tanh_pade(0.5 * v.clamp(-10.0, 10.0))
);
activation_op!(
    /// Bounded tanh.
    TanhOp, TanhKernel, "tanh", dispatch::tanh_optimal,
    scalar::tanh_pade
);
activation_op!(
    /// Tanh-form GELU.
    GeluOp, GeluKernel, "gelu", dispatch::gelu_optimal,
    |v| 0.5 * v * (1.0 + scalar::tanh_pade(0.797_884_56 * (v + 0.044_715 * v * v * v)))
);
