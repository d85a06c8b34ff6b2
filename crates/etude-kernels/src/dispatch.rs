//! Dispatch façade: the "optimal" entry point for every primitive
//!
//! Each function validates its arguments, resolves a kernel through
//! [`KernelRegistry::select`], invokes it, and falls back to the inline
//! scalar implementation when the lookup misses (uninitialized registry,
//! no compatible entry, or an entry of the wrong family). Operators call
//! only these entry points; tests may call concrete kernels directly.

use etude_core::{Error, Result};
use log::trace;

use crate::registry::{KernelFn, KernelRegistry};
use crate::scalar;

fn check_same_len(what: &str, a: usize, b: usize) -> Result<()> {
    if a != b {
        return Err(Error::invalid_argument(format!(
            "{what}: length mismatch ({a} vs {b})"
        )));
    }
    Ok(())
}

fn check_nonempty(what: &str, n: usize) -> Result<()> {
    if n == 0 {
        return Err(Error::invalid_argument(format!("{what}: empty input")));
    }
    Ok(())
}

fn resolve(reg: &KernelRegistry, query: &str, size: usize) -> Option<KernelFn> {
    match reg.select(query, size) {
        Ok(entry) => Some(entry.kernel),
        Err(err) => {
            trace!("dispatch {query}: falling back to scalar ({err})");
            None
        }
    }
}

macro_rules! binary_entry {
    ($(#[$meta:meta])* $name:ident, $query:literal, $fallback:path) => {
        $(#[$meta])*
        pub fn $name(reg: &KernelRegistry, a: &[f32], b: &[f32], out: &mut [f32]) -> Result<()> {
            check_nonempty($query, a.len())?;
            check_same_len($query, a.len(), b.len())?;
            check_same_len($query, a.len(), out.len())?;
            if let Some(KernelFn::VectorBinary(f)) = resolve(reg, $query, a.len()) {
                f(a, b, out);
            } else {
                $fallback(a, b, out);
            }
            Ok(())
        }
    };
}

macro_rules! map_entry {
    ($(#[$meta:meta])* $name:ident, $query:literal, $fallback:path) => {
        $(#[$meta])*
        pub fn $name(reg: &KernelRegistry, x: &[f32], out: &mut [f32]) -> Result<()> {
            check_nonempty($query, x.len())?;
            check_same_len($query, x.len(), out.len())?;
            if let Some(KernelFn::Map(f)) = resolve(reg, $query, x.len()) {
                f(x, out);
            } else {
                $fallback(x, out);
            }
            Ok(())
        }
    };
}

binary_entry!(
    /// Elementwise addition.
    vector_add_optimal, "vector_add", scalar::vector_add
);
binary_entry!(
    /// Elementwise multiplication.
    vector_mul_optimal, "vector_mul", scalar::vector_mul
);
binary_entry!(
    /// Analysis-window application (`frame * window`).
    window_apply_optimal, "window_apply", scalar::window_apply
);

map_entry!(
    /// `max(x, 0)`.
    relu_optimal, "relu", scalar::relu
);
map_entry!(
    /// Bounded sigmoid.
    sigmoid_optimal, "sigmoid", scalar::sigmoid
);
map_entry!(
    /// Bounded tanh.
    tanh_optimal, "tanh", scalar::tanh_act
);
map_entry!(
    /// Tanh-form GELU.
    gelu_optimal, "gelu", scalar::gelu
);
map_entry!(
    /// Stabilized softmax.
    softmax_optimal, "softmax", scalar::softmax
);
map_entry!(
    /// Natural-log spectrum with a silence floor.
    log_spectrum_optimal, "log_spectrum", scalar::log_spectrum
);

/// Elementwise scale.
pub fn vector_scale_optimal(
    reg: &KernelRegistry,
    x: &[f32],
    scale: f32,
    out: &mut [f32],
) -> Result<()> {
    check_nonempty("vector_scale", x.len())?;
    check_same_len("vector_scale", x.len(), out.len())?;
    if let Some(KernelFn::VectorScale(f)) = resolve(reg, "vector_scale", x.len()) {
        f(x, scale, out);
    } else {
        scalar::vector_scale(x, scale, out);
    }
    Ok(())
}

/// Dot product.
pub fn vector_dot_optimal(reg: &KernelRegistry, a: &[f32], b: &[f32]) -> Result<f32> {
    check_nonempty("vector_dot", a.len())?;
    check_same_len("vector_dot", a.len(), b.len())?;
    if let Some(KernelFn::Dot(f)) = resolve(reg, "vector_dot", a.len()) {
        Ok(f(a, b))
    } else {
        Ok(scalar::vector_dot(a, b))
    }
}

/// Row-major GEMM `C = A * B`. The selection size is the multiply count
/// `m * k * n` so large products can route to blocked or parallel kernels.
pub fn matmul_optimal(
    reg: &KernelRegistry,
    a: &[f32],
    b: &[f32],
    c: &mut [f32],
    m: usize,
    k: usize,
    n: usize,
) -> Result<()> {
    if m == 0 || k == 0 || n == 0 {
        return Err(Error::invalid_argument(format!(
            "matmul: zero dimension (m={m}, k={k}, n={n})"
        )));
    }
    if a.len() != m * k || b.len() != k * n || c.len() != m * n {
        return Err(Error::invalid_argument(format!(
            "matmul: buffer sizes {}/{}/{} do not match ({m}x{k})({k}x{n})",
            a.len(),
            b.len(),
            c.len()
        )));
    }
    if let Some(KernelFn::Matmul(f)) = resolve(reg, "matmul", m * k * n) {
        f(a, b, c, m, k, n);
    } else {
        scalar::matmul(a, b, c, m, k, n);
    }
    Ok(())
}

/// Per-vector layer normalization.
pub fn layer_norm_optimal(
    reg: &KernelRegistry,
    x: &[f32],
    gamma: Option<&[f32]>,
    beta: Option<&[f32]>,
    epsilon: f32,
    out: &mut [f32],
) -> Result<()> {
    check_nonempty("layer_norm", x.len())?;
    check_same_len("layer_norm", x.len(), out.len())?;
    if let Some(g) = gamma {
        check_same_len("layer_norm gamma", x.len(), g.len())?;
    }
    if let Some(b) = beta {
        check_same_len("layer_norm beta", x.len(), b.len())?;
    }
    if epsilon <= 0.0 {
        return Err(Error::invalid_argument("layer_norm: epsilon must be > 0"));
    }
    if let Some(KernelFn::LayerNorm(f)) = resolve(reg, "layer_norm", x.len()) {
        f(x, gamma, beta, epsilon, out);
    } else {
        scalar::layer_norm(x, gamma, beta, epsilon, out);
    }
    Ok(())
}

/// Batch normalization over `(rows, channels)` with per-channel stats.
pub fn batch_norm_optimal(
    reg: &KernelRegistry,
    x: &[f32],
    mean: &[f32],
    var: &[f32],
    gamma: Option<&[f32]>,
    beta: Option<&[f32]>,
    epsilon: f32,
    out: &mut [f32],
) -> Result<()> {
    check_nonempty("batch_norm", x.len())?;
    check_nonempty("batch_norm channels", mean.len())?;
    check_same_len("batch_norm stats", mean.len(), var.len())?;
    check_same_len("batch_norm", x.len(), out.len())?;
    if x.len() % mean.len() != 0 {
        return Err(Error::invalid_argument(format!(
            "batch_norm: {} elements not divisible by {} channels",
            x.len(),
            mean.len()
        )));
    }
    if let Some(g) = gamma {
        check_same_len("batch_norm gamma", mean.len(), g.len())?;
    }
    if let Some(b) = beta {
        check_same_len("batch_norm beta", mean.len(), b.len())?;
    }
    if epsilon <= 0.0 {
        return Err(Error::invalid_argument("batch_norm: epsilon must be > 0"));
    }
    if let Some(KernelFn::BatchNorm(f)) = resolve(reg, "batch_norm", x.len()) {
        f(x, mean, var, gamma, beta, epsilon, out);
    } else {
        scalar::batch_norm(x, mean, var, gamma, beta, epsilon, out);
    }
    Ok(())
}

/// Mel filterbank projection `(n_frames, n_fft) x (n_mels, n_fft)^T`.
pub fn mel_filterbank_optimal(
    reg: &KernelRegistry,
    spec: &[f32],
    filters: &[f32],
    out: &mut [f32],
    n_frames: usize,
    n_fft: usize,
    n_mels: usize,
) -> Result<()> {
    if n_frames == 0 || n_fft == 0 || n_mels == 0 {
        return Err(Error::invalid_argument(format!(
            "mel_filterbank: zero dimension (frames={n_frames}, fft={n_fft}, mels={n_mels})"
        )));
    }
    if spec.len() != n_frames * n_fft || filters.len() != n_mels * n_fft
        || out.len() != n_frames * n_mels
    {
        return Err(Error::invalid_argument(
            "mel_filterbank: buffer sizes do not match the given dimensions",
        ));
    }
    if let Some(KernelFn::MelFilterbank(f)) = resolve(reg, "mel_filterbank", n_frames * n_fft) {
        f(spec, filters, out, n_frames, n_fft, n_mels);
    } else {
        scalar::mel_filterbank(spec, filters, out, n_frames, n_fft, n_mels);
    }
    Ok(())
}

/// Elementwise complex multiply over split re/im planes.
pub fn complex_mul_optimal(
    reg: &KernelRegistry,
    ar: &[f32],
    ai: &[f32],
    br: &[f32],
    bi: &[f32],
    out_re: &mut [f32],
    out_im: &mut [f32],
) -> Result<()> {
    let n = ar.len();
    check_nonempty("complex_mul", n)?;
    for (what, len) in [
        ("complex_mul ai", ai.len()),
        ("complex_mul br", br.len()),
        ("complex_mul bi", bi.len()),
        ("complex_mul out_re", out_re.len()),
        ("complex_mul out_im", out_im.len()),
    ] {
        check_same_len(what, n, len)?;
    }
    if let Some(KernelFn::ComplexBinary(f)) = resolve(reg, "complex_mul", n) {
        f(ar, ai, br, bi, out_re, out_im);
    } else {
        scalar::complex_mul(ar, ai, br, bi, out_re, out_im);
    }
    Ok(())
}

/// Elementwise complex magnitude.
pub fn complex_magnitude_optimal(
    reg: &KernelRegistry,
    re: &[f32],
    im: &[f32],
    out: &mut [f32],
) -> Result<()> {
    check_nonempty("complex_magnitude", re.len())?;
    check_same_len("complex_magnitude", re.len(), im.len())?;
    check_same_len("complex_magnitude", re.len(), out.len())?;
    if let Some(KernelFn::ComplexMagnitude(f)) = resolve(reg, "complex_magnitude", re.len()) {
        f(re, im, out);
    } else {
        scalar::complex_magnitude(re, im, out);
    }
    Ok(())
}

/// f32 -> BF16 slice conversion.
pub fn bfloat16_from_f32_optimal(
    reg: &KernelRegistry,
    src: &[f32],
    out: &mut [u16],
) -> Result<()> {
    check_nonempty("bfloat16_from_f32", src.len())?;
    check_same_len("bfloat16_from_f32", src.len(), out.len())?;
    if let Some(KernelFn::Bf16FromF32(f)) = resolve(reg, "bfloat16_from_f32", src.len()) {
        f(src, out);
    } else {
        crate::bf16::f32_slice_to_bf16(src, out);
    }
    Ok(())
}

/// BF16 -> f32 slice conversion.
pub fn bfloat16_to_f32_optimal(reg: &KernelRegistry, src: &[u16], out: &mut [f32]) -> Result<()> {
    check_nonempty("bfloat16_to_f32", src.len())?;
    check_same_len("bfloat16_to_f32", src.len(), out.len())?;
    if let Some(KernelFn::Bf16ToF32(f)) = resolve(reg, "bfloat16_to_f32", src.len()) {
        f(src, out);
    } else {
        crate::bf16::bf16_slice_to_f32(src, out);
    }
    Ok(())
}

/// BF16 elementwise addition.
pub fn bfloat16_add_optimal(
    reg: &KernelRegistry,
    a: &[u16],
    b: &[u16],
    out: &mut [u16],
) -> Result<()> {
    check_nonempty("bfloat16_add", a.len())?;
    check_same_len("bfloat16_add", a.len(), b.len())?;
    check_same_len("bfloat16_add", a.len(), out.len())?;
    if let Some(KernelFn::Bf16Binary(f)) = resolve(reg, "bfloat16_add", a.len()) {
        f(a, b, out);
    } else {
        crate::bf16::bf16_add(a, b, out);
    }
    Ok(())
}

/// BF16 elementwise multiplication.
pub fn bfloat16_mul_optimal(
    reg: &KernelRegistry,
    a: &[u16],
    b: &[u16],
    out: &mut [u16],
) -> Result<()> {
    check_nonempty("bfloat16_mul", a.len())?;
    check_same_len("bfloat16_mul", a.len(), b.len())?;
    check_same_len("bfloat16_mul", a.len(), out.len())?;
    if let Some(KernelFn::Bf16Binary(f)) = resolve(reg, "bfloat16_mul", a.len()) {
        f(a, b, out);
    } else {
        crate::bf16::bf16_mul(a, b, out);
    }
    Ok(())
}
