//! Normalization operators

use std::sync::Arc;

use etude_core::{DType, Error, MemoryPool, Result, Tensor};
use etude_kernels::dispatch;
use serde_json::Value;

use super::{
    attr_f32_or, attr_usize, resolve_weight, resolve_weight_opt, single_input, BuildCtx,
    OpKernel, Operator,
};
use crate::runtime::Runtime;

/// Layer normalization over the last dimension.
///
/// Attributes: `dim`, `epsilon` (default 1e-5), optional `gamma`/`beta`
/// (inline or by layer id) of length `dim`.
pub struct LayerNormOp;

impl Operator for LayerNormOp {
    fn op_type(&self) -> &str {
        "layer_norm"
    }

    fn create(&self, attrs: &Value, ctx: &BuildCtx<'_>) -> Result<Box<dyn OpKernel>> {
        let dim = attr_usize(attrs, "dim")?;
        let epsilon = attr_f32_or(attrs, "epsilon", 1e-5)?;
        if epsilon <= 0.0 {
            return Err(Error::invalid_argument("layer_norm: epsilon must be > 0"));
        }
        Ok(Box::new(LayerNormKernel {
            dim,
            epsilon,
            gamma: resolve_weight_opt(attrs, "gamma", ctx, &[dim])?,
            beta: resolve_weight_opt(attrs, "beta", ctx, &[dim])?,
        }))
    }
}

pub struct LayerNormKernel {
    dim: usize,
    epsilon: f32,
    gamma: Option<Arc<Tensor>>,
    beta: Option<Arc<Tensor>>,
}

impl OpKernel for LayerNormKernel {
    fn op_type(&self) -> &str {
        "layer_norm"
    }

    fn forward(
        &mut self,
        runtime: &Runtime,
        inputs: &[&Tensor],
        pool: &MemoryPool,
    ) -> Result<Vec<Tensor>> {
        let input = single_input("layer_norm", inputs)?;
        let x = input.as_f32()?;
        if self.dim == 0 || x.len() % self.dim != 0 {
            return Err(Error::invalid_argument(format!(
                "layer_norm: {} elements do not divide into rows of {}",
                x.len(),
                self.dim
            )));
        }
        let gamma = self.gamma.as_deref().map(Tensor::as_f32).transpose()?;
        let beta = self.beta.as_deref().map(Tensor::as_f32).transpose()?;

        let mut out = pool.alloc(DType::F32, input.shape())?;
        let y = out.as_f32_mut()?;
        for (row_in, row_out) in x.chunks_exact(self.dim).zip(y.chunks_exact_mut(self.dim)) {
            dispatch::layer_norm_optimal(
                &runtime.kernels,
                row_in,
                gamma,
                beta,
                self.epsilon,
                row_out,
            )?;
        }
        Ok(vec![out])
    }
}

/// Batch normalization with stored per-channel statistics.
///
/// Attributes: `channels`, `epsilon` (default 1e-5), `mean`/`var`
/// (required, length `channels`), optional `gamma`/`beta`.
pub struct BatchNormOp;

impl Operator for BatchNormOp {
    fn op_type(&self) -> &str {
        "batch_norm"
    }

    fn create(&self, attrs: &Value, ctx: &BuildCtx<'_>) -> Result<Box<dyn OpKernel>> {
        let channels = attr_usize(attrs, "channels")?;
        let epsilon = attr_f32_or(attrs, "epsilon", 1e-5)?;
        if epsilon <= 0.0 {
            return Err(Error::invalid_argument("batch_norm: epsilon must be > 0"));
        }
        Ok(Box::new(BatchNormKernel {
            channels,
            epsilon,
            mean: resolve_weight(attrs, "mean", ctx, &[channels])?,
            var: resolve_weight(attrs, "var", ctx, &[channels])?,
            gamma: resolve_weight_opt(attrs, "gamma", ctx, &[channels])?,
            beta: resolve_weight_opt(attrs, "beta", ctx, &[channels])?,
        }))
    }
}

pub struct BatchNormKernel {
    channels: usize,
    epsilon: f32,
    mean: Arc<Tensor>,
    var: Arc<Tensor>,
    gamma: Option<Arc<Tensor>>,
    beta: Option<Arc<Tensor>>,
}

impl OpKernel for BatchNormKernel {
    fn op_type(&self) -> &str {
        "batch_norm"
    }

    fn forward(
        &mut self,
        runtime: &Runtime,
        inputs: &[&Tensor],
        pool: &MemoryPool,
    ) -> Result<Vec<Tensor>> {
        let input = single_input("batch_norm", inputs)?;
        let x = input.as_f32()?;
        if x.len() % self.channels != 0 {
            return Err(Error::invalid_argument(format!(
                "batch_norm: {} elements do not divide into {} channels",
                x.len(),
                self.channels
            )));
        }
        let mut out = pool.alloc(DType::F32, input.shape())?;
        dispatch::batch_norm_optimal(
            &runtime.kernels,
            x,
            self.mean.as_f32()?,
            self.var.as_f32()?,
            self.gamma.as_deref().map(Tensor::as_f32).transpose()?,
            self.beta.as_deref().map(Tensor::as_f32).transpose()?,
            self.epsilon,
            out.as_f32_mut()?,
        )?;
        Ok(vec![out])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_layer_norm_rows_normalized() {
        let rt = Runtime::new().unwrap();
        let pool = MemoryPool::new(1 << 20);
        let mut k = LayerNormOp
            .create(&json!({"dim": 4}), &BuildCtx::default())
            .unwrap();
        let x = Tensor::from_f32(vec![2, 4], &[1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0])
            .unwrap();
        let y = k.forward(&rt, &[&x], &pool).unwrap();
        let out = y[0].as_f32().unwrap();
        for row in out.chunks_exact(4) {
            let mean: f32 = row.iter().sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5, "row mean {mean}");
        }
    }

    #[test]
    fn test_batch_norm_identity() {
        let rt = Runtime::new().unwrap();
        let pool = MemoryPool::new(1 << 20);
        let mut k = BatchNormOp
            .create(
                &json!({"channels": 2, "mean": [0.0, 0.0], "var": [1.0, 1.0], "epsilon": 1e-9}),
                &BuildCtx::default(),
            )
            .unwrap();
        let x = Tensor::from_f32(vec![2, 2], &[1.0, -2.0, 3.0, -4.0]).unwrap();
        let y = k.forward(&rt, &[&x], &pool).unwrap();
        let out = y[0].as_f32().unwrap();
        for (got, want) in out.iter().zip(&[1.0f32, -2.0, 3.0, -4.0]) {
            assert!((got - want).abs() < 1e-4);
        }
    }

    #[test]
    fn test_missing_stats_rejected() {
        assert!(BatchNormOp
            .create(&json!({"channels": 2}), &BuildCtx::default())
            .is_err());
    }
}
