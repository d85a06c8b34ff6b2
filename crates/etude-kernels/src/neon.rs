//! ARM NEON kernel implementations (aarch64, 4-wide f32)
//!
//! NEON is architecturally mandatory on AArch64, so no runtime guard is
//! needed inside the kernels themselves.
//!
//! Besides the straight vector kernels this module carries the
//! mobile-specialized variants: `*_power_efficient` (small chunks with
//! periodic yields to cap sustained load), `*_thermal_aware` (chunk size
//! follows a 3-level thermal counter), `matmul_low_power` (smaller block)
//! and `matmul_adaptive` (timing feedback grows or shrinks the block
//! between 32 and 512 columns). They register under distinct names with
//! deliberately low scores so only an explicit by-name query selects them.

#![cfg(target_arch = "aarch64")]

use std::arch::aarch64::*;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

/// Elementwise `out = a + b`.
pub fn vector_add(a: &[f32], b: &[f32], out: &mut [f32]) {
    debug_assert!(a.len() == b.len() && a.len() == out.len());
    let n = a.len();
    let main = n - n % 4;
    unsafe {
        for i in (0..main).step_by(4) {
            let va = vld1q_f32(a.as_ptr().add(i));
            let vb = vld1q_f32(b.as_ptr().add(i));
            vst1q_f32(out.as_mut_ptr().add(i), vaddq_f32(va, vb));
        }
    }
    for i in main..n {
        out[i] = a[i] + b[i];
    }
}

/// Elementwise `out = a * b`.
pub fn vector_mul(a: &[f32], b: &[f32], out: &mut [f32]) {
    debug_assert!(a.len() == b.len() && a.len() == out.len());
    let n = a.len();
    let main = n - n % 4;
    unsafe {
        for i in (0..main).step_by(4) {
            let va = vld1q_f32(a.as_ptr().add(i));
            let vb = vld1q_f32(b.as_ptr().add(i));
            vst1q_f32(out.as_mut_ptr().add(i), vmulq_f32(va, vb));
        }
    }
    for i in main..n {
        out[i] = a[i] * b[i];
    }
}

/// Elementwise `out = x * scale`.
pub fn vector_scale(x: &[f32], scale: f32, out: &mut [f32]) {
    debug_assert_eq!(x.len(), out.len());
    let n = x.len();
    let main = n - n % 4;
    unsafe {
        let vs = vdupq_n_f32(scale);
        for i in (0..main).step_by(4) {
            let vx = vld1q_f32(x.as_ptr().add(i));
            vst1q_f32(out.as_mut_ptr().add(i), vmulq_f32(vx, vs));
        }
    }
    for i in main..n {
        out[i] = x[i] * scale;
    }
}

/// Tree-reduced dot product using fused multiply-add lanes.
pub fn vector_dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let n = a.len();
    let main = n - n % 4;
    let mut acc;
    unsafe {
        let mut vacc = vdupq_n_f32(0.0);
        for i in (0..main).step_by(4) {
            let va = vld1q_f32(a.as_ptr().add(i));
            let vb = vld1q_f32(b.as_ptr().add(i));
            vacc = vfmaq_f32(vacc, va, vb);
        }
        acc = vaddvq_f32(vacc);
    }
    for i in main..n {
        acc += a[i] * b[i];
    }
    acc
}

/// Row-major GEMM, 4-wide over columns of C with FMA. C is zeroed first.
pub fn matmul(a: &[f32], b: &[f32], c: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert!(a.len() >= m * k && b.len() >= k * n && c.len() >= m * n);
    c[..m * n].fill(0.0);
    let main = n - n % 4;
    unsafe {
        for i in 0..m {
            for p in 0..k {
                let a_ip = a[i * k + p];
                if a_ip == 0.0 {
                    continue;
                }
                let va = vdupq_n_f32(a_ip);
                let b_row = b.as_ptr().add(p * n);
                let c_row = c.as_mut_ptr().add(i * n);
                for j in (0..main).step_by(4) {
                    let vb = vld1q_f32(b_row.add(j));
                    let vc = vld1q_f32(c_row.add(j));
                    vst1q_f32(c_row.add(j), vfmaq_f32(vc, va, vb));
                }
                for j in main..n {
                    *c_row.add(j) += a_ip * *b_row.add(j);
                }
            }
        }
    }
}

/// `out = max(x, 0)`.
pub fn relu(x: &[f32], out: &mut [f32]) {
    debug_assert_eq!(x.len(), out.len());
    let n = x.len();
    let main = n - n % 4;
    unsafe {
        let zero = vdupq_n_f32(0.0);
        for i in (0..main).step_by(4) {
            let vx = vld1q_f32(x.as_ptr().add(i));
            vst1q_f32(out.as_mut_ptr().add(i), vmaxq_f32(vx, zero));
        }
    }
    for i in main..n {
        out[i] = x[i].max(0.0);
    }
}

/// Padé 7/6 tanh on 4 lanes, input pre-clamped to [-5, 5].
#[inline]
unsafe fn tanh_lanes(x: float32x4_t) -> float32x4_t {
    let x = vmaxq_f32(vminq_f32(x, vdupq_n_f32(5.0)), vdupq_n_f32(-5.0));
    let x2 = vmulq_f32(x, x);
    let num = vmulq_f32(
        x,
        vfmaq_f32(
            vdupq_n_f32(135_135.0),
            x2,
            vfmaq_f32(vdupq_n_f32(17_325.0), x2, vaddq_f32(vdupq_n_f32(378.0), x2)),
        ),
    );
    let den = vfmaq_f32(
        vdupq_n_f32(135_135.0),
        x2,
        vfmaq_f32(
            vdupq_n_f32(62_370.0),
            x2,
            vfmaq_f32(vdupq_n_f32(3_150.0), x2, vdupq_n_f32(28.0)),
        ),
    );
    vdivq_f32(num, den)
}

/// `out = tanh(x)` via the shared Padé approximation.
pub fn tanh_act(x: &[f32], out: &mut [f32]) {
    debug_assert_eq!(x.len(), out.len());
    let n = x.len();
    let main = n - n % 4;
    unsafe {
        for i in (0..main).step_by(4) {
            let vx = vld1q_f32(x.as_ptr().add(i));
            vst1q_f32(out.as_mut_ptr().add(i), tanh_lanes(vx));
        }
    }
    for i in main..n {
        out[i] = crate::scalar::tanh_pade(x[i]);
    }
}

/// Bounded sigmoid via tanh (inputs clamped to [-10, 10]).
pub fn sigmoid(x: &[f32], out: &mut [f32]) {
    debug_assert_eq!(x.len(), out.len());
    let n = x.len();
    let main = n - n % 4;
    unsafe {
        let half = vdupq_n_f32(0.5);
        let hi = vdupq_n_f32(10.0);
        let lo = vdupq_n_f32(-10.0);
        for i in (0..main).step_by(4) {
            let vx = vld1q_f32(x.as_ptr().add(i));
            let clamped = vmaxq_f32(vminq_f32(vx, hi), lo);
            let t = tanh_lanes(vmulq_f32(clamped, half));
            vst1q_f32(out.as_mut_ptr().add(i), vfmaq_f32(half, half, t));
        }
    }
    for i in main..n {
        let v = x[i].clamp(-10.0, 10.0);
        out[i] = 0.5 + 0.5 * crate::scalar::tanh_pade(0.5 * v);
    }
}

/// Tanh-form GELU.
pub fn gelu(x: &[f32], out: &mut [f32]) {
    debug_assert_eq!(x.len(), out.len());
    let n = x.len();
    let main = n - n % 4;
    unsafe {
        let half = vdupq_n_f32(0.5);
        let one = vdupq_n_f32(1.0);
        let c0 = vdupq_n_f32(0.797_884_56);
        let c1 = vdupq_n_f32(0.044_715);
        for i in (0..main).step_by(4) {
            let vx = vld1q_f32(x.as_ptr().add(i));
            let x3 = vmulq_f32(vx, vmulq_f32(vx, vx));
            let inner = vmulq_f32(c0, vfmaq_f32(vx, c1, x3));
            let t = tanh_lanes(inner);
            let result = vmulq_f32(vmulq_f32(half, vx), vaddq_f32(one, t));
            vst1q_f32(out.as_mut_ptr().add(i), result);
        }
    }
    for i in main..n {
        let v = x[i];
        let inner = 0.797_884_56 * (v + 0.044_715 * v * v * v);
        out[i] = 0.5 * v * (1.0 + crate::scalar::tanh_pade(inner));
    }
}

/// Stabilized softmax; max-reduce and normalization vectorized, the
/// exponential itself scalar.
pub fn softmax(x: &[f32], out: &mut [f32]) {
    debug_assert_eq!(x.len(), out.len());
    let n = x.len();
    if n == 0 {
        return;
    }
    let main = n - n % 4;
    let mut max = f32::NEG_INFINITY;
    unsafe {
        if main > 0 {
            let mut vmax = vdupq_n_f32(f32::NEG_INFINITY);
            for i in (0..main).step_by(4) {
                vmax = vmaxq_f32(vmax, vld1q_f32(x.as_ptr().add(i)));
            }
            max = vmaxvq_f32(vmax);
        }
    }
    for i in main..n {
        max = max.max(x[i]);
    }

    let mut sum = 0.0f64;
    for i in 0..n {
        let e = (x[i] - max).exp();
        out[i] = e;
        sum += e as f64;
    }

    let inv = (1.0 / sum) as f32;
    unsafe {
        let vinv = vdupq_n_f32(inv);
        for i in (0..main).step_by(4) {
            let v = vld1q_f32(out.as_ptr().add(i));
            vst1q_f32(out.as_mut_ptr().add(i), vmulq_f32(v, vinv));
        }
    }
    for v in out[main..n].iter_mut() {
        *v *= inv;
    }
}

/// Per-vector layer normalization with optional affine parameters.
pub fn layer_norm(
    x: &[f32],
    gamma: Option<&[f32]>,
    beta: Option<&[f32]>,
    epsilon: f32,
    out: &mut [f32],
) {
    debug_assert_eq!(x.len(), out.len());
    let n = x.len();
    if n == 0 {
        return;
    }
    let main = n - n % 4;

    let mut sum = unsafe {
        let mut vsum = vdupq_n_f32(0.0);
        for i in (0..main).step_by(4) {
            vsum = vaddq_f32(vsum, vld1q_f32(x.as_ptr().add(i)));
        }
        vaddvq_f32(vsum)
    };
    for i in main..n {
        sum += x[i];
    }
    let mean = sum / n as f32;

    let mut var = unsafe {
        let vmean = vdupq_n_f32(mean);
        let mut vvar = vdupq_n_f32(0.0);
        for i in (0..main).step_by(4) {
            let d = vsubq_f32(vld1q_f32(x.as_ptr().add(i)), vmean);
            vvar = vfmaq_f32(vvar, d, d);
        }
        vaddvq_f32(vvar)
    };
    for i in main..n {
        let d = x[i] - mean;
        var += d * d;
    }
    var /= n as f32;

    let inv_std = 1.0 / (var + epsilon).sqrt();
    unsafe {
        let vmean = vdupq_n_f32(mean);
        let vinv = vdupq_n_f32(inv_std);
        for i in (0..main).step_by(4) {
            let d = vsubq_f32(vld1q_f32(x.as_ptr().add(i)), vmean);
            vst1q_f32(out.as_mut_ptr().add(i), vmulq_f32(d, vinv));
        }
    }
    for i in main..n {
        out[i] = (x[i] - mean) * inv_std;
    }

    if let Some(g) = gamma {
        unsafe {
            for i in (0..main).step_by(4) {
                let v = vmulq_f32(vld1q_f32(out.as_ptr().add(i)), vld1q_f32(g.as_ptr().add(i)));
                vst1q_f32(out.as_mut_ptr().add(i), v);
            }
        }
        for i in main..n {
            out[i] *= g[i];
        }
    }
    if let Some(b) = beta {
        unsafe {
            for i in (0..main).step_by(4) {
                let v = vaddq_f32(vld1q_f32(out.as_ptr().add(i)), vld1q_f32(b.as_ptr().add(i)));
                vst1q_f32(out.as_mut_ptr().add(i), v);
            }
        }
        for i in main..n {
            out[i] += b[i];
        }
    }
}

/// Elementwise complex multiply over split re/im planes.
pub fn complex_mul(
    ar: &[f32],
    ai: &[f32],
    br: &[f32],
    bi: &[f32],
    out_re: &mut [f32],
    out_im: &mut [f32],
) {
    debug_assert!(ar.len() == ai.len() && ar.len() == br.len() && ar.len() == bi.len());
    debug_assert!(ar.len() == out_re.len() && ar.len() == out_im.len());
    let n = ar.len();
    let main = n - n % 4;
    unsafe {
        for i in (0..main).step_by(4) {
            let var = vld1q_f32(ar.as_ptr().add(i));
            let vai = vld1q_f32(ai.as_ptr().add(i));
            let vbr = vld1q_f32(br.as_ptr().add(i));
            let vbi = vld1q_f32(bi.as_ptr().add(i));
            let re = vsubq_f32(vmulq_f32(var, vbr), vmulq_f32(vai, vbi));
            let im = vfmaq_f32(vmulq_f32(var, vbi), vai, vbr);
            vst1q_f32(out_re.as_mut_ptr().add(i), re);
            vst1q_f32(out_im.as_mut_ptr().add(i), im);
        }
    }
    for i in main..n {
        out_re[i] = ar[i] * br[i] - ai[i] * bi[i];
        out_im[i] = ar[i] * bi[i] + ai[i] * br[i];
    }
}

/// `out = sqrt(re^2 + im^2)`.
pub fn complex_magnitude(re: &[f32], im: &[f32], out: &mut [f32]) {
    debug_assert!(re.len() == im.len() && re.len() == out.len());
    let n = re.len();
    let main = n - n % 4;
    unsafe {
        for i in (0..main).step_by(4) {
            let vr = vld1q_f32(re.as_ptr().add(i));
            let vi = vld1q_f32(im.as_ptr().add(i));
            let mag = vsqrtq_f32(vfmaq_f32(vmulq_f32(vr, vr), vi, vi));
            vst1q_f32(out.as_mut_ptr().add(i), mag);
        }
    }
    for i in main..n {
        out[i] = (re[i] * re[i] + im[i] * im[i]).sqrt();
    }
}

// ============================================================================
// Mobile-specialized variants
// ============================================================================

/// Thermal level driven by the host's thermal policy: 0 = nominal,
/// 1 = warm, 2 = hot. Clamped on write.
static THERMAL_LEVEL: AtomicU8 = AtomicU8::new(0);

pub fn set_thermal_level(level: u8) {
    THERMAL_LEVEL.store(level.min(2), Ordering::Relaxed);
}

pub fn thermal_level() -> u8 {
    THERMAL_LEVEL.load(Ordering::Relaxed)
}

/// Power-efficient add: small chunks with a periodic yield so sustained
/// load stays below the thermal envelope of passive-cooled devices.
pub fn vector_add_power_efficient(a: &[f32], b: &[f32], out: &mut [f32]) {
    const CHUNK: usize = 256;
    const YIELD_EVERY: usize = 16;
    let n = a.len();
    let mut chunk_index = 0usize;
    let mut start = 0usize;
    while start < n {
        let end = (start + CHUNK).min(n);
        vector_add(&a[start..end], &b[start..end], &mut out[start..end]);
        chunk_index += 1;
        if chunk_index % YIELD_EVERY == 0 {
            std::thread::yield_now();
        }
        start = end;
    }
}

/// Thermal-aware add: chunk size shrinks as the thermal counter rises.
pub fn vector_add_thermal_aware(a: &[f32], b: &[f32], out: &mut [f32]) {
    let chunk = match thermal_level() {
        0 => 4096,
        1 => 1024,
        _ => 256,
    };
    let n = a.len();
    let mut start = 0usize;
    while start < n {
        let end = (start + chunk).min(n);
        vector_add(&a[start..end], &b[start..end], &mut out[start..end]);
        if thermal_level() >= 2 {
            std::thread::yield_now();
        }
        start = end;
    }
}

/// GEMM with a small fixed column block; trades throughput for a flatter
/// power draw.
pub fn matmul_low_power(a: &[f32], b: &[f32], c: &mut [f32], m: usize, k: usize, n: usize) {
    matmul_blocked(a, b, c, m, k, n, 16);
}

/// GEMM whose column block adapts between 32 and 512 from per-block
/// timing feedback.
pub fn matmul_adaptive(a: &[f32], b: &[f32], c: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert!(a.len() >= m * k && b.len() >= k * n && c.len() >= m * n);
    c[..m * n].fill(0.0);

    let mut block = 128usize;
    let mut avg_per_elem = f64::NAN;
    let mut j0 = 0usize;
    while j0 < n {
        let j1 = (j0 + block).min(n);
        let started = Instant::now();
        matmul_block_cols(a, b, c, m, k, n, j0, j1);
        let elems = (m * k * (j1 - j0)).max(1) as f64;
        let per_elem = started.elapsed().as_secs_f64() / elems;

        if avg_per_elem.is_nan() {
            avg_per_elem = per_elem;
        } else {
            // Shrink when this block ran slow (cache pressure, throttling),
            // grow when it ran fast.
            if per_elem > avg_per_elem * 1.25 {
                block = (block / 2).max(32);
            } else if per_elem < avg_per_elem * 0.8 {
                block = (block * 2).min(512);
            }
            avg_per_elem = 0.7 * avg_per_elem + 0.3 * per_elem;
        }
        j0 = j1;
    }
}

fn matmul_blocked(
    a: &[f32],
    b: &[f32],
    c: &mut [f32],
    m: usize,
    k: usize,
    n: usize,
    block: usize,
) {
    debug_assert!(a.len() >= m * k && b.len() >= k * n && c.len() >= m * n);
    c[..m * n].fill(0.0);
    let mut j0 = 0usize;
    while j0 < n {
        let j1 = (j0 + block).min(n);
        matmul_block_cols(a, b, c, m, k, n, j0, j1);
        j0 = j1;
    }
}

/// Accumulates columns `[j0, j1)` of C; C must already be zeroed there.
fn matmul_block_cols(
    a: &[f32],
    b: &[f32],
    c: &mut [f32],
    m: usize,
    k: usize,
    n: usize,
    j0: usize,
    j1: usize,
) {
    let width = j1 - j0;
    let main = width - width % 4;
    unsafe {
        for i in 0..m {
            for p in 0..k {
                let a_ip = a[i * k + p];
                if a_ip == 0.0 {
                    continue;
                }
                let va = vdupq_n_f32(a_ip);
                let b_row = b.as_ptr().add(p * n + j0);
                let c_row = c.as_mut_ptr().add(i * n + j0);
                for j in (0..main).step_by(4) {
                    let vb = vld1q_f32(b_row.add(j));
                    let vc = vld1q_f32(c_row.add(j));
                    vst1q_f32(c_row.add(j), vfmaq_f32(vc, va, vb));
                }
                for j in main..width {
                    *c_row.add(j) += a_ip * *b_row.add(j);
                }
            }
        }
    }
}
