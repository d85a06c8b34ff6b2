//! Single-block multi-head scaled dot-product attention

use etude_core::{DType, Error, MemoryPool, Result, Tensor};
use etude_kernels::dispatch;
use serde_json::Value;

use super::{attr_bool_or, attr_usize, BuildCtx, OpKernel, Operator};
use crate::runtime::Runtime;

/// Factory for `"attention"` nodes.
///
/// Inputs: Q, K, V of shape `(B, T, D)` (or `(T, D)` for batch 1).
/// Attributes: `num_heads`, `causal` (default false). Scaling is
/// `1/sqrt(D / num_heads)`; no mask unless `causal` asks for one.
pub struct AttentionOp;

impl Operator for AttentionOp {
    fn op_type(&self) -> &str {
        "attention"
    }

    fn create(&self, attrs: &Value, _ctx: &BuildCtx<'_>) -> Result<Box<dyn OpKernel>> {
        let num_heads = attr_usize(attrs, "num_heads")?;
        if num_heads == 0 {
            return Err(Error::invalid_argument("attention: num_heads must be > 0"));
        }
        Ok(Box::new(AttentionKernel {
            num_heads,
            causal: attr_bool_or(attrs, "causal", false)?,
        }))
    }
}

pub struct AttentionKernel {
    num_heads: usize,
    causal: bool,
}

impl AttentionKernel {
    fn dims(&self, tensor: &Tensor) -> Result<(usize, usize, usize)> {
        match tensor.shape() {
            [t, d] => Ok((1, *t, *d)),
            [b, t, d] => Ok((*b, *t, *d)),
            other => Err(Error::invalid_argument(format!(
                "attention: expected (B, T, D) input, got {other:?}"
            ))),
        }
    }
}

impl OpKernel for AttentionKernel {
    fn op_type(&self) -> &str {
        "attention"
    }

    fn forward(
        &mut self,
        runtime: &Runtime,
        inputs: &[&Tensor],
        pool: &MemoryPool,
    ) -> Result<Vec<Tensor>> {
        let [q, k, v] = inputs else {
            return Err(Error::invalid_argument(format!(
                "attention: expected inputs Q, K, V, got {}",
                inputs.len()
            )));
        };
        let (batch, seq, dim) = self.dims(q)?;
        if self.dims(k)? != (batch, seq, dim) || self.dims(v)? != (batch, seq, dim) {
            return Err(Error::invalid_argument("attention: Q/K/V shapes differ"));
        }
        if dim % self.num_heads != 0 {
            return Err(Error::invalid_argument(format!(
                "attention: dim {dim} not divisible by {} heads",
                self.num_heads
            )));
        }
        let head_dim = dim / self.num_heads;
        let scale = 1.0 / (head_dim as f32).sqrt();

        let qs = q.as_f32()?;
        let ks = k.as_f32()?;
        let vs = v.as_f32()?;

        let mut out = pool.alloc(DType::F32, q.shape())?;

        // Scratch: per-head contiguous copies plus the score matrix.
        let mut q_head = pool.alloc(DType::F32, &[seq, head_dim])?;
        let mut kt_head = pool.alloc(DType::F32, &[head_dim, seq])?;
        let mut v_head = pool.alloc(DType::F32, &[seq, head_dim])?;
        let mut scores = pool.alloc(DType::F32, &[seq, seq])?;
        let mut o_head = pool.alloc(DType::F32, &[seq, head_dim])?;

        for b in 0..batch {
            let base = b * seq * dim;
            for h in 0..self.num_heads {
                let col = h * head_dim;
                {
                    let qh = q_head.as_f32_mut()?;
                    let kt = kt_head.as_f32_mut()?;
                    let vh = v_head.as_f32_mut()?;
                    for t in 0..seq {
                        let row = base + t * dim + col;
                        qh[t * head_dim..(t + 1) * head_dim]
                            .copy_from_slice(&qs[row..row + head_dim]);
                        vh[t * head_dim..(t + 1) * head_dim]
                            .copy_from_slice(&vs[row..row + head_dim]);
                        // K is stored transposed so scores = Q . K^T is a
                        // plain row-major GEMM.
                        for j in 0..head_dim {
                            kt[j * seq + t] = ks[row + j];
                        }
                    }
                }

                dispatch::matmul_optimal(
                    &runtime.kernels,
                    q_head.as_f32()?,
                    kt_head.as_f32()?,
                    scores.as_f32_mut()?,
                    seq,
                    head_dim,
                    seq,
                )?;

                {
                    let s = scores.as_f32_mut()?;
                    for v in s.iter_mut() {
                        *v *= scale;
                    }
                    if self.causal {
                        for i in 0..seq {
                            for j in (i + 1)..seq {
                                s[i * seq + j] = f32::NEG_INFINITY;
                            }
                        }
                    }
                }

                // Row-wise softmax in place over a scratch row.
                {
                    let s = scores.as_f32_mut()?;
                    let mut row_buf = vec![0.0f32; seq];
                    for i in 0..seq {
                        let row = &mut s[i * seq..(i + 1) * seq];
                        dispatch::softmax_optimal(&runtime.kernels, row, &mut row_buf)?;
                        row.copy_from_slice(&row_buf);
                    }
                }

                dispatch::matmul_optimal(
                    &runtime.kernels,
                    scores.as_f32()?,
                    v_head.as_f32()?,
                    o_head.as_f32_mut()?,
                    seq,
                    seq,
                    head_dim,
                )?;

                {
                    let oh = o_head.as_f32()?;
                    let y = out.as_f32_mut()?;
                    for t in 0..seq {
                        let row = base + t * dim + col;
                        y[row..row + head_dim]
                            .copy_from_slice(&oh[t * head_dim..(t + 1) * head_dim]);
                    }
                }
            }
        }

        for scratch in [q_head, kt_head, v_head, scores, o_head] {
            pool.recycle(scratch);
        }
        Ok(vec![out])
    }
}
