//! Elementwise binary operators and the output passthrough

use etude_core::{DType, Error, MemoryPool, Result, Tensor};
use etude_kernels::dispatch;
use serde_json::Value;

use super::{single_input, two_inputs, BuildCtx, OpKernel, Operator};
use crate::runtime::Runtime;

macro_rules! binary_op {
    ($(#[$meta:meta])* $factory:ident, $kernel:ident, $name:literal, $optimal:path) => {
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
                let (a, b) = two_inputs($name, inputs)?;
                if a.shape() != b.shape() {
                    return Err(Error::invalid_argument(format!(
                        "{}: shape mismatch {:?} vs {:?}",
                        $name,
                        a.shape(),
                        b.shape()
                    )));
                }
                let mut out = pool.alloc(DType::F32, a.shape())?;
                $optimal(&runtime.kernels, a.as_f32()?, b.as_f32()?, out.as_f32_mut()?)?;
                Ok(vec![out])
            }
        }
    };
}

binary_op!(
    /// Elementwise addition (residual connections).
    AddOp, AddKernel, "add", dispatch::vector_add_optimal
);
binary_op!(
    /// Elementwise multiplication (gating).
    MulOp, MulKernel, "mul", dispatch::vector_mul_optimal
);

/// Graph-output passthrough: copies its input so the result survives
/// upstream recycling.
pub struct OutputOp;

impl Operator for OutputOp {
    fn op_type(&self) -> &str {
        "output"
    }

    fn create(&self, _attrs: &Value, _ctx: &BuildCtx<'_>) -> Result<Box<dyn OpKernel>> {
        Ok(Box::new(OutputKernel))
    }
}

pub struct OutputKernel;

impl OpKernel for OutputKernel {
    fn op_type(&self) -> &str {
        "output"
    }

    fn forward(
        &mut self,
        _runtime: &Runtime,
        inputs: &[&Tensor],
        pool: &MemoryPool,
    ) -> Result<Vec<Tensor>> {
        let input = single_input("output", inputs)?;
        Ok(vec![input.duplicate(pool)?])
    }
}
