//! Operator registry and the create/forward contract
//!
//! An [`Operator`] is a factory registered under a unique type name; its
//! `create` copies the node attributes into an [`OpKernel`], the per-node
//! state whose `forward` computes output tensors from input tensors.
//! Destruction is `Drop`; output tensors belong to the memory pool.
//!
//! Attributes arrive as JSON values (the graph descriptor format) and
//! weights resolve either inline from the attributes or by LEF layer id
//! through the [`BuildCtx`].

use std::collections::HashMap;
use std::sync::Arc;

use etude_core::{DType, Error, MemoryPool, Result, Tensor};
use serde_json::Value;

use crate::runtime::Runtime;

pub mod activation;
pub mod attention;
pub mod conv1d;
pub mod elementwise;
pub mod fused;
pub mod linear;
pub mod mel;
pub mod norm;
pub mod stft;
pub mod vocoder;

/// Context available while instantiating operators: the loaded model's
/// layer-id -> tensor map, when a model is attached.
#[derive(Default)]
pub struct BuildCtx<'a> {
    pub weights: Option<&'a HashMap<u16, Arc<Tensor>>>,
}

/// Operator factory, registered by type name.
pub trait Operator: Send + Sync {
    /// Unique type name, e.g. `"linear"`.
    fn op_type(&self) -> &str;

    /// Builds per-node state from attributes. Copies everything it needs;
    /// the attribute value is not retained.
    fn create(&self, attrs: &Value, ctx: &BuildCtx<'_>) -> Result<Box<dyn OpKernel>>;
}

/// Per-node operator state.
pub trait OpKernel: Send {
    fn op_type(&self) -> &str;

    /// Computes the node's outputs. Output tensors are allocated from
    /// `pool` on every call; shape is derived from inputs and attributes.
    fn forward(
        &mut self,
        runtime: &Runtime,
        inputs: &[&Tensor],
        pool: &MemoryPool,
    ) -> Result<Vec<Tensor>>;

    /// True for elementwise single-input/single-output kernels that can
    /// overwrite their input buffer.
    fn supports_inplace(&self) -> bool {
        false
    }

    /// In-place forward over the (owned) input tensor. Only called when
    /// [`OpKernel::supports_inplace`] returned true.
    fn forward_inplace(&mut self, _runtime: &Runtime, _tensor: &mut Tensor) -> Result<()> {
        Err(Error::unsupported("in-place forward"))
    }
}

/// Process-scope mapping from operator type name to factory.
pub struct OperatorRegistry {
    ops: HashMap<String, Arc<dyn Operator>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self { ops: HashMap::new() }
    }

    /// Registers a factory. Names are unique; a duplicate is an
    /// [`Error::InvalidState`].
    pub fn register(&mut self, op: Arc<dyn Operator>) -> Result<()> {
        let name = op.op_type().to_string();
        if self.ops.contains_key(&name) {
            return Err(Error::invalid_state(format!(
                "operator '{name}' already registered"
            )));
        }
        self.ops.insert(name, op);
        Ok(())
    }

    /// Stable reference to a factory by type name.
    pub fn find(&self, op_type: &str) -> Result<Arc<dyn Operator>> {
        self.ops
            .get(op_type)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("operator '{op_type}'")))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ops.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Linear, Conv1D, Attention.
    pub fn register_basic(&mut self) -> Result<()> {
        self.register(Arc::new(linear::LinearOp))?;
        self.register(Arc::new(conv1d::Conv1dOp))?;
        self.register(Arc::new(attention::AttentionOp))?;
        Ok(())
    }

    /// STFT, MelScale, Vocoder.
    pub fn register_audio(&mut self) -> Result<()> {
        self.register(Arc::new(stft::StftOp))?;
        self.register(Arc::new(mel::MelScaleOp))?;
        self.register(Arc::new(vocoder::VocoderOp))?;
        Ok(())
    }

    /// Activations, norms, elementwise binaries, identity, fused forms.
    pub fn register_support(&mut self) -> Result<()> {
        self.register(Arc::new(activation::ReluOp))?;
        self.register(Arc::new(activation::SigmoidOp))?;
        self.register(Arc::new(activation::TanhOp))?;
        self.register(Arc::new(activation::GeluOp))?;
        self.register(Arc::new(norm::LayerNormOp))?;
        self.register(Arc::new(norm::BatchNormOp))?;
        self.register(Arc::new(elementwise::AddOp))?;
        self.register(Arc::new(elementwise::MulOp))?;
        self.register(Arc::new(elementwise::OutputOp))?;
        self.register(Arc::new(fused::LinearReluOp))?;
        self.register(Arc::new(fused::Conv1dReluOp))?;
        self.register(Arc::new(fused::StftMelOp))?;
        Ok(())
    }

    /// Everything.
    pub fn register_all(&mut self) -> Result<()> {
        self.register_basic()?;
        self.register_audio()?;
        self.register_support()?;
        Ok(())
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Attribute helpers
// ============================================================================

pub(crate) fn attr_usize(attrs: &Value, key: &str) -> Result<usize> {
    attrs
        .get(key)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .ok_or_else(|| Error::invalid_argument(format!("missing integer attribute '{key}'")))
}

pub(crate) fn attr_usize_or(attrs: &Value, key: &str, default: usize) -> Result<usize> {
    match attrs.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_u64()
            .map(|v| v as usize)
            .ok_or_else(|| Error::invalid_argument(format!("attribute '{key}' must be an integer"))),
    }
}

pub(crate) fn attr_f32_or(attrs: &Value, key: &str, default: f32) -> Result<f32> {
    match attrs.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_f64()
            .map(|v| v as f32)
            .ok_or_else(|| Error::invalid_argument(format!("attribute '{key}' must be a number"))),
    }
}

pub(crate) fn attr_bool_or(attrs: &Value, key: &str, default: bool) -> Result<bool> {
    match attrs.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_bool()
            .ok_or_else(|| Error::invalid_argument(format!("attribute '{key}' must be a boolean"))),
    }
}

pub(crate) fn attr_str_or<'a>(attrs: &'a Value, key: &str, default: &'a str) -> Result<&'a str> {
    match attrs.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_str()
            .ok_or_else(|| Error::invalid_argument(format!("attribute '{key}' must be a string"))),
    }
}

/// Resolves a weight tensor: `"<key>_layer": id` fetches from the loaded
/// model; `"<key>": [..]` parses an inline flat array. The result is
/// always owned f32 with `expected_shape` (BF16 model layers are widened
/// here, once, at create time).
pub(crate) fn resolve_weight(
    attrs: &Value,
    key: &str,
    ctx: &BuildCtx<'_>,
    expected_shape: &[usize],
) -> Result<Arc<Tensor>> {
    let expected: usize = expected_shape.iter().product();

    if let Some(id) = attrs.get(format!("{key}_layer")).and_then(Value::as_u64) {
        let weights = ctx.weights.ok_or_else(|| {
            Error::invalid_state(format!(
                "attribute '{key}_layer' given but no model is attached"
            ))
        })?;
        let tensor = weights
            .get(&(id as u16))
            .cloned()
            .ok_or_else(|| Error::not_found(format!("model layer {id}")))?;
        if tensor.element_count() != expected {
            return Err(Error::invalid_argument(format!(
                "layer {id} holds {} elements, '{key}' needs {expected}",
                tensor.element_count()
            )));
        }
        return match tensor.dtype() {
            DType::F32 => {
                let data = tensor.to_f32_vec()?;
                Ok(Arc::new(Tensor::from_f32(expected_shape.to_vec(), &data)?))
            }
            DType::Bf16 => {
                let halves = tensor.as_bf16()?;
                let mut widened = vec![0.0f32; halves.len()];
                etude_kernels::bf16::bf16_slice_to_f32(halves, &mut widened);
                Ok(Arc::new(Tensor::from_f32(expected_shape.to_vec(), &widened)?))
            }
            other => Err(Error::unsupported(format!(
                "layer {id} dtype {other:?} cannot back weight '{key}'"
            ))),
        };
    }

    if let Some(values) = attrs.get(key).and_then(Value::as_array) {
        let data: Option<Vec<f32>> = values.iter().map(|v| v.as_f64().map(|f| f as f32)).collect();
        let data = data.ok_or_else(|| {
            Error::invalid_argument(format!("attribute '{key}' must be a numeric array"))
        })?;
        if data.len() != expected {
            return Err(Error::invalid_argument(format!(
                "attribute '{key}' holds {} values, expected {expected}",
                data.len()
            )));
        }
        return Ok(Arc::new(Tensor::from_f32(expected_shape.to_vec(), &data)?));
    }

    Err(Error::not_found(format!(
        "weight '{key}' (neither '{key}' nor '{key}_layer' present)"
    )))
}

/// Optional variant of [`resolve_weight`]: absent keys are `None`.
pub(crate) fn resolve_weight_opt(
    attrs: &Value,
    key: &str,
    ctx: &BuildCtx<'_>,
    expected_shape: &[usize],
) -> Result<Option<Arc<Tensor>>> {
    let present = attrs.get(key).map(|v| !v.is_null()).unwrap_or(false)
        || attrs
            .get(format!("{key}_layer"))
            .map(|v| !v.is_null())
            .unwrap_or(false);
    if !present {
        return Ok(None);
    }
    resolve_weight(attrs, key, ctx, expected_shape).map(Some)
}

pub(crate) fn single_input<'a>(what: &str, inputs: &[&'a Tensor]) -> Result<&'a Tensor> {
    match inputs {
        [one] => Ok(*one),
        _ => Err(Error::invalid_argument(format!(
            "{what}: expected 1 input, got {}",
            inputs.len()
        ))),
    }
}

pub(crate) fn two_inputs<'a>(what: &str, inputs: &[&'a Tensor]) -> Result<(&'a Tensor, &'a Tensor)> {
    match inputs {
        [a, b] => Ok((*a, *b)),
        _ => Err(Error::invalid_argument(format!(
            "{what}: expected 2 inputs, got {}",
            inputs.len()
        ))),
    }
}

/// Interprets a tensor as a `(rows, cols)` matrix: rank-1 input is one
/// row, higher ranks flatten every leading dimension into rows.
pub(crate) fn as_matrix<'a>(tensor: &'a Tensor, cols_name: &str, cols: usize) -> Result<(usize, &'a [f32])> {
    let data = tensor.as_f32()?;
    if cols == 0 || data.len() % cols != 0 {
        return Err(Error::invalid_argument(format!(
            "input of {} elements does not divide into {cols_name} = {cols} columns",
            data.len()
        )));
    }
    Ok((data.len() / cols, data))
}
