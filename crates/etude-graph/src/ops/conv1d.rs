//! 1-D convolution operator (direct form)

use std::sync::Arc;

use etude_core::{DType, Error, MemoryPool, Result, Tensor};
use etude_kernels::dispatch;
use serde_json::Value;

use super::{
    attr_bool_or, attr_usize, attr_usize_or, resolve_weight, resolve_weight_opt, single_input,
    BuildCtx, OpKernel, Operator,
};
use crate::runtime::Runtime;

/// Factory for `"conv1d"` nodes.
///
/// Attributes: `in_channels`, `out_channels`, `kernel_size`, `stride`
/// (1), `padding` (0), `dilation` (1), `use_bias` (default bias
/// present), `weight`/`weight_layer` of shape
/// `(out_channels, in_channels, kernel_size)`, optional `bias`.
pub struct Conv1dOp;

impl Operator for Conv1dOp {
    fn op_type(&self) -> &str {
        "conv1d"
    }

    fn create(&self, attrs: &Value, ctx: &BuildCtx<'_>) -> Result<Box<dyn OpKernel>> {
        let in_channels = attr_usize(attrs, "in_channels")?;
        let out_channels = attr_usize(attrs, "out_channels")?;
        let kernel_size = attr_usize(attrs, "kernel_size")?;
        let stride = attr_usize_or(attrs, "stride", 1)?;
        let padding = attr_usize_or(attrs, "padding", 0)?;
        let dilation = attr_usize_or(attrs, "dilation", 1)?;
        if stride == 0 || dilation == 0 || kernel_size == 0 {
            return Err(Error::invalid_argument(
                "conv1d: stride, dilation, and kernel_size must be > 0",
            ));
        }

        let weight = resolve_weight(attrs, "weight", ctx, &[out_channels, in_channels, kernel_size])?;
        let bias = if attr_bool_or(attrs, "use_bias", true)? {
            resolve_weight_opt(attrs, "bias", ctx, &[out_channels])?
        } else {
            None
        };

        Ok(Box::new(Conv1dKernel {
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
            dilation,
            weight,
            bias,
        }))
    }
}

pub struct Conv1dKernel {
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    padding: usize,
    dilation: usize,
    weight: Arc<Tensor>,
    bias: Option<Arc<Tensor>>,
}

impl Conv1dKernel {
    fn output_len(&self, input_len: usize) -> Result<usize> {
        let span = self.dilation * (self.kernel_size - 1) + 1;
        let padded = input_len + 2 * self.padding;
        if padded < span {
            return Err(Error::invalid_argument(format!(
                "conv1d: input length {input_len} too short for kernel span {span}"
            )));
        }
        Ok((padded - span) / self.stride + 1)
    }
}

impl OpKernel for Conv1dKernel {
    fn op_type(&self) -> &str {
        "conv1d"
    }

    fn forward(
        &mut self,
        runtime: &Runtime,
        inputs: &[&Tensor],
        pool: &MemoryPool,
    ) -> Result<Vec<Tensor>> {
        let input = single_input("conv1d", inputs)?;
        // Accept (C, L) or (B, C, L).
        let (batch, length) = match input.shape() {
            [c, l] if *c == self.in_channels => (1usize, *l),
            [b, c, l] if *c == self.in_channels => (*b, *l),
            other => {
                return Err(Error::invalid_argument(format!(
                    "conv1d: input shape {other:?} does not carry {} channels",
                    self.in_channels
                )))
            }
        };
        let out_len = self.output_len(length)?;

        let x = input.as_f32()?;
        let w = self.weight.as_f32()?;
        let bias = self.bias.as_deref().map(Tensor::as_f32).transpose()?;

        let out_shape = if input.rank() == 2 {
            vec![self.out_channels, out_len]
        } else {
            vec![batch, self.out_channels, out_len]
        };
        let mut out = pool.alloc(DType::F32, &out_shape)?;
        let y = out.as_f32_mut()?;

        let k = self.kernel_size;
        for b in 0..batch {
            let x_batch = &x[b * self.in_channels * length..(b + 1) * self.in_channels * length];
            let y_batch =
                &mut y[b * self.out_channels * out_len..(b + 1) * self.out_channels * out_len];
            for oc in 0..self.out_channels {
                for t in 0..out_len {
                    let origin = (t * self.stride) as isize - self.padding as isize;
                    let mut acc = 0.0f32;
                    for ic in 0..self.in_channels {
                        let x_row = &x_batch[ic * length..(ic + 1) * length];
                        let w_row = &w[(oc * self.in_channels + ic) * k..][..k];
                        if self.dilation == 1
                            && origin >= 0
                            && (origin as usize) + k <= length
                        {
                            // Contiguous window: use the dot kernel.
                            let start = origin as usize;
                            acc += dispatch::vector_dot_optimal(
                                &runtime.kernels,
                                &x_row[start..start + k],
                                w_row,
                            )?;
                        } else {
                            for (j, &wv) in w_row.iter().enumerate() {
                                let pos = origin + (j * self.dilation) as isize;
                                if pos >= 0 && (pos as usize) < length {
                                    acc += wv * x_row[pos as usize];
                                }
                            }
                        }
                    }
                    if let Some(bias) = bias {
                        acc += bias[oc];
                    }
                    y_batch[oc * out_len + t] = acc;
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

    #[test]
    fn test_conv1d_identity_kernel() {
        let rt = Runtime::new().unwrap();
        let pool = MemoryPool::new(1 << 20);
        let mut k = Conv1dOp
            .create(
                &json!({
                    "in_channels": 1,
                    "out_channels": 1,
                    "kernel_size": 1,
                    "weight": [2.0],
                    "use_bias": false,
                }),
                &BuildCtx::default(),
            )
            .unwrap();
        let x = Tensor::from_f32(vec![1, 4], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let y = k.forward(&rt, &[&x], &pool).unwrap();
        assert_eq!(y[0].shape(), &[1, 4]);
        assert_eq!(y[0].as_f32().unwrap(), &[2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_conv1d_moving_sum_with_padding() {
        let rt = Runtime::new().unwrap();
        let pool = MemoryPool::new(1 << 20);
        let mut k = Conv1dOp
            .create(
                &json!({
                    "in_channels": 1,
                    "out_channels": 1,
                    "kernel_size": 3,
                    "padding": 1,
                    "weight": [1.0, 1.0, 1.0],
                    "use_bias": false,
                }),
                &BuildCtx::default(),
            )
            .unwrap();
        let x = Tensor::from_f32(vec![1, 4], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let y = k.forward(&rt, &[&x], &pool).unwrap();
        // Zero-padded moving sum keeps the length.
        assert_eq!(y[0].as_f32().unwrap(), &[3.0, 6.0, 9.0, 7.0]);
    }

    #[test]
    fn test_conv1d_stride_and_output_len() {
        let rt = Runtime::new().unwrap();
        let pool = MemoryPool::new(1 << 20);
        let mut k = Conv1dOp
            .create(
                &json!({
                    "in_channels": 1,
                    "out_channels": 1,
                    "kernel_size": 2,
                    "stride": 2,
                    "weight": [1.0, 1.0],
                    "use_bias": false,
                }),
                &BuildCtx::default(),
            )
            .unwrap();
        let x = Tensor::from_f32(vec![1, 6], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let y = k.forward(&rt, &[&x], &pool).unwrap();
        // (6 - 2)/2 + 1 = 3 outputs.
        assert_eq!(y[0].shape(), &[1, 3]);
        assert_eq!(y[0].as_f32().unwrap(), &[3.0, 7.0, 11.0]);
    }

    #[test]
    fn test_conv1d_dilation() {
        let rt = Runtime::new().unwrap();
        let pool = MemoryPool::new(1 << 20);
        let mut k = Conv1dOp
            .create(
                &json!({
                    "in_channels": 1,
                    "out_channels": 1,
                    "kernel_size": 2,
                    "dilation": 2,
                    "weight": [1.0, 1.0],
                    "use_bias": false,
                }),
                &BuildCtx::default(),
            )
            .unwrap();
        let x = Tensor::from_f32(vec![1, 5], &[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        let y = k.forward(&rt, &[&x], &pool).unwrap();
        // span = 2*(2-1)+1 = 3 -> (5-3)/1 + 1 = 3 outputs: x[t] + x[t+2].
        assert_eq!(y[0].as_f32().unwrap(), &[4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_conv1d_bias_broadcast_over_channels() {
        let rt = Runtime::new().unwrap();
        let pool = MemoryPool::new(1 << 20);
        let mut k = Conv1dOp
            .create(
                &json!({
                    "in_channels": 1,
                    "out_channels": 2,
                    "kernel_size": 1,
                    "weight": [1.0, -1.0],
                    "bias": [100.0, 200.0],
                }),
                &BuildCtx::default(),
            )
            .unwrap();
        let x = Tensor::from_f32(vec![1, 2], &[1.0, 2.0]).unwrap();
        let y = k.forward(&rt, &[&x], &pool).unwrap();
        assert_eq!(y[0].as_f32().unwrap(), &[101.0, 102.0, 199.0, 198.0]);
    }

    #[test]
    fn test_too_short_input_rejected() {
        let rt = Runtime::new().unwrap();
        let pool = MemoryPool::new(1 << 20);
        let mut k = Conv1dOp
            .create(
                &json!({
                    "in_channels": 1,
                    "out_channels": 1,
                    "kernel_size": 5,
                    "weight": [1.0, 1.0, 1.0, 1.0, 1.0],
                    "use_bias": false,
                }),
                &BuildCtx::default(),
            )
            .unwrap();
        let x = Tensor::from_f32(vec![1, 3], &[1.0, 2.0, 3.0]).unwrap();
        assert!(matches!(
            k.forward(&rt, &[&x], &pool),
            Err(Error::InvalidArgument(_))
        ));
    }
}
