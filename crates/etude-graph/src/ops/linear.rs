//! Linear (fully connected) operator: `y = x . W + b`

use std::sync::Arc;

use etude_core::{DType, MemoryPool, Result, Tensor};
use etude_kernels::dispatch;
use serde_json::Value;

use super::{
    as_matrix, attr_bool_or, attr_usize, resolve_weight, resolve_weight_opt, single_input,
    BuildCtx, OpKernel, Operator,
};
use crate::runtime::Runtime;

/// Factory for `"linear"` nodes.
///
/// Attributes: `input_size`, `output_size`, `use_bias` (default: bias
/// present), `weight`/`weight_layer` of shape `(input_size, output_size)`
/// row-major, optional `bias`/`bias_layer` of `output_size`.
pub struct LinearOp;

impl Operator for LinearOp {
    fn op_type(&self) -> &str {
        "linear"
    }

    fn create(&self, attrs: &Value, ctx: &BuildCtx<'_>) -> Result<Box<dyn OpKernel>> {
        let input_size = attr_usize(attrs, "input_size")?;
        let output_size = attr_usize(attrs, "output_size")?;
        let weight = resolve_weight(attrs, "weight", ctx, &[input_size, output_size])?;

        let bias = if attr_bool_or(attrs, "use_bias", true)? {
            resolve_weight_opt(attrs, "bias", ctx, &[output_size])?
        } else {
            None
        };

        Ok(Box::new(LinearKernel {
            input_size,
            output_size,
            weight,
            bias,
        }))
    }
}

pub struct LinearKernel {
    input_size: usize,
    output_size: usize,
    weight: Arc<Tensor>,
    bias: Option<Arc<Tensor>>,
}

impl OpKernel for LinearKernel {
    fn op_type(&self) -> &str {
        "linear"
    }

    fn forward(
        &mut self,
        runtime: &Runtime,
        inputs: &[&Tensor],
        pool: &MemoryPool,
    ) -> Result<Vec<Tensor>> {
        let input = single_input("linear", inputs)?;
        let (batch, x) = as_matrix(input, "input_size", self.input_size)?;

        let mut out_shape = input.shape().to_vec();
        if let Some(last) = out_shape.last_mut() {
            *last = self.output_size;
        }
        let mut out = pool.alloc(DType::F32, &out_shape)?;
        let y = out.as_f32_mut()?;

        dispatch::matmul_optimal(
            &runtime.kernels,
            x,
            self.weight.as_f32()?,
            y,
            batch,
            self.input_size,
            self.output_size,
        )?;

        if let Some(bias) = &self.bias {
            let b = bias.as_f32()?;
            for row in y.chunks_exact_mut(self.output_size) {
                for (v, add) in row.iter_mut().zip(b) {
                    *v += add;
                }
            }
        }

        Ok(vec![out])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kernel(attrs: Value) -> Box<dyn OpKernel> {
        LinearOp.create(&attrs, &BuildCtx::default()).unwrap()
    }

    #[test]
    fn test_linear_known_answer() {
        let rt = Runtime::new().unwrap();
        let pool = MemoryPool::new(1 << 20);
        // W = [[1, 0], [0, 1], [1, 1]] (3 in, 2 out), b = [10, 20]
        let mut k = kernel(json!({
            "input_size": 3,
            "output_size": 2,
            "weight": [1.0, 0.0, 0.0, 1.0, 1.0, 1.0],
            "bias": [10.0, 20.0],
        }));
        let x = Tensor::from_f32(vec![1, 3], &[1.0, 2.0, 3.0]).unwrap();
        let y = k.forward(&rt, &[&x], &pool).unwrap();
        assert_eq!(y[0].shape(), &[1, 2]);
        assert_eq!(y[0].as_f32().unwrap(), &[14.0, 25.0]);
    }

    #[test]
    fn test_linear_batched_no_bias() {
        let rt = Runtime::new().unwrap();
        let pool = MemoryPool::new(1 << 20);
        let mut k = kernel(json!({
            "input_size": 2,
            "output_size": 2,
            "weight": [1.0, 2.0, 3.0, 4.0],
            "use_bias": false,
        }));
        let x = Tensor::from_f32(vec![2, 2], &[1.0, 0.0, 0.0, 1.0]).unwrap();
        let y = k.forward(&rt, &[&x], &pool).unwrap();
        // Identity input returns W itself.
        assert_eq!(y[0].as_f32().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_linear_rank1_input() {
        let rt = Runtime::new().unwrap();
        let pool = MemoryPool::new(1 << 20);
        let mut k = kernel(json!({
            "input_size": 2,
            "output_size": 1,
            "weight": [2.0, 3.0],
            "use_bias": false,
        }));
        let x = Tensor::from_f32(vec![2], &[5.0, 7.0]).unwrap();
        let y = k.forward(&rt, &[&x], &pool).unwrap();
        assert_eq!(y[0].shape(), &[1]);
        assert_eq!(y[0].as_f32().unwrap(), &[31.0]);
    }

    #[test]
    fn test_wrong_width_rejected() {
        let rt = Runtime::new().unwrap();
        let pool = MemoryPool::new(1 << 20);
        let mut k = kernel(json!({
            "input_size": 3,
            "output_size": 2,
            "weight": [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            "use_bias": false,
        }));
        let x = Tensor::from_f32(vec![4], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert!(k.forward(&rt, &[&x], &pool).is_err());
    }
}
