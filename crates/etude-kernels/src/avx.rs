//! AVX kernel implementations (x86-64, 8-wide f32, FMA where compiled in)
//!
//! Unlike SSE these are not part of the baseline ABI, so every public
//! entry is a safe wrapper around a `#[target_feature]` body. The wrappers
//! are only ever reached through registry entries whose `required_isa`
//! carries the AVX bits, which the registry checks against the detected
//! process mask before selection.

#![cfg(target_arch = "x86_64")]

use std::arch::x86_64::*;

macro_rules! avx_wrapper {
    ($(#[$meta:meta])* $name:ident, $impl_name:ident, ($($arg:ident: $ty:ty),*) $(-> $ret:ty)?) => {
        $(#[$meta])*
        pub fn $name($($arg: $ty),*) $(-> $ret)? {
            debug_assert!(is_x86_feature_detected!("avx"));
            // Safety: selected only on hosts whose ISA mask includes AVX.
            unsafe { $impl_name($($arg),*) }
        }
    };
}

avx_wrapper!(
    /// Elementwise `out = a + b`.
    vector_add, vector_add_impl, (a: &[f32], b: &[f32], out: &mut [f32])
);
avx_wrapper!(
    /// Elementwise `out = a * b`.
    vector_mul, vector_mul_impl, (a: &[f32], b: &[f32], out: &mut [f32])
);
avx_wrapper!(
    /// Elementwise `out = x * scale`.
    vector_scale, vector_scale_impl, (x: &[f32], scale: f32, out: &mut [f32])
);
avx_wrapper!(
    /// Tree-reduced dot product.
    vector_dot, vector_dot_impl, (a: &[f32], b: &[f32]) -> f32
);
avx_wrapper!(
    /// Row-major GEMM, mul+add form. C is zeroed first.
    matmul, matmul_impl, (a: &[f32], b: &[f32], c: &mut [f32], m: usize, k: usize, n: usize)
);
avx_wrapper!(
    /// `out = max(x, 0)`.
    relu, relu_impl, (x: &[f32], out: &mut [f32])
);
avx_wrapper!(
    /// Bounded sigmoid via the shared Padé tanh (inputs clamped to [-10, 10]).
    sigmoid, sigmoid_impl, (x: &[f32], out: &mut [f32])
);
avx_wrapper!(
    /// Padé tanh, clamped to [-5, 5].
    tanh_act, tanh_impl, (x: &[f32], out: &mut [f32])
);
avx_wrapper!(
    /// Tanh-form GELU.
    gelu, gelu_impl, (x: &[f32], out: &mut [f32])
);
avx_wrapper!(
    /// Stabilized softmax; max-reduce and normalization are vectorized,
    /// exponentiation stays scalar.
    softmax, softmax_impl, (x: &[f32], out: &mut [f32])
);
avx_wrapper!(
    /// Per-vector layer normalization with optional affine parameters.
    layer_norm, layer_norm_impl,
    (x: &[f32], gamma: Option<&[f32]>, beta: Option<&[f32]>, epsilon: f32, out: &mut [f32])
);
avx_wrapper!(
    /// Elementwise complex multiply over split planes.
    complex_mul, complex_mul_impl,
    (ar: &[f32], ai: &[f32], br: &[f32], bi: &[f32], out_re: &mut [f32], out_im: &mut [f32])
);
avx_wrapper!(
    /// `out = sqrt(re^2 + im^2)`.
    complex_magnitude, complex_magnitude_impl, (re: &[f32], im: &[f32], out: &mut [f32])
);

/// FMA GEMM variant; requires both AVX2 and FMA in the process mask.
pub fn matmul_fma(a: &[f32], b: &[f32], c: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert!(is_x86_feature_detected!("fma"));
    // Safety: selected only on hosts whose ISA mask includes AVX2 and FMA.
    unsafe { matmul_fma_impl(a, b, c, m, k, n) }
}

#[inline]
#[target_feature(enable = "avx")]
unsafe fn hsum256(v: __m256) -> f32 {
    let lo = _mm256_castps256_ps128(v);
    let hi = _mm256_extractf128_ps::<1>(v);
    let sum4 = _mm_add_ps(lo, hi);
    let hi2 = _mm_movehl_ps(sum4, sum4);
    let sum2 = _mm_add_ps(sum4, hi2);
    let lane1 = _mm_shuffle_ps::<0b01>(sum2, sum2);
    _mm_cvtss_f32(_mm_add_ss(sum2, lane1))
}

#[inline]
#[target_feature(enable = "avx")]
unsafe fn hmax256(v: __m256) -> f32 {
    let lo = _mm256_castps256_ps128(v);
    let hi = _mm256_extractf128_ps::<1>(v);
    let max4 = _mm_max_ps(lo, hi);
    let hi2 = _mm_movehl_ps(max4, max4);
    let max2 = _mm_max_ps(max4, hi2);
    let lane1 = _mm_shuffle_ps::<0b01>(max2, max2);
    _mm_cvtss_f32(_mm_max_ss(max2, lane1))
}

#[target_feature(enable = "avx")]
unsafe fn vector_add_impl(a: &[f32], b: &[f32], out: &mut [f32]) {
    debug_assert!(a.len() == b.len() && a.len() == out.len());
    let n = a.len();
    let main = n - n % 8;
    for i in (0..main).step_by(8) {
        let va = _mm256_loadu_ps(a.as_ptr().add(i));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i));
        _mm256_storeu_ps(out.as_mut_ptr().add(i), _mm256_add_ps(va, vb));
    }
    for i in main..n {
        out[i] = a[i] + b[i];
    }
}

#[target_feature(enable = "avx")]
unsafe fn vector_mul_impl(a: &[f32], b: &[f32], out: &mut [f32]) {
    debug_assert!(a.len() == b.len() && a.len() == out.len());
    let n = a.len();
    let main = n - n % 8;
    for i in (0..main).step_by(8) {
        let va = _mm256_loadu_ps(a.as_ptr().add(i));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i));
        _mm256_storeu_ps(out.as_mut_ptr().add(i), _mm256_mul_ps(va, vb));
    }
    for i in main..n {
        out[i] = a[i] * b[i];
    }
}

#[target_feature(enable = "avx")]
unsafe fn vector_scale_impl(x: &[f32], scale: f32, out: &mut [f32]) {
    debug_assert_eq!(x.len(), out.len());
    let n = x.len();
    let main = n - n % 8;
    let vs = _mm256_set1_ps(scale);
    for i in (0..main).step_by(8) {
        let vx = _mm256_loadu_ps(x.as_ptr().add(i));
        _mm256_storeu_ps(out.as_mut_ptr().add(i), _mm256_mul_ps(vx, vs));
    }
    for i in main..n {
        out[i] = x[i] * scale;
    }
}

#[target_feature(enable = "avx")]
unsafe fn vector_dot_impl(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let n = a.len();
    let main = n - n % 8;
    let mut vacc = _mm256_setzero_ps();
    for i in (0..main).step_by(8) {
        let va = _mm256_loadu_ps(a.as_ptr().add(i));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i));
        vacc = _mm256_add_ps(vacc, _mm256_mul_ps(va, vb));
    }
    let mut acc = hsum256(vacc);
    for i in main..n {
        acc += a[i] * b[i];
    }
    acc
}

#[target_feature(enable = "avx")]
unsafe fn matmul_impl(a: &[f32], b: &[f32], c: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert!(a.len() >= m * k && b.len() >= k * n && c.len() >= m * n);
    c[..m * n].fill(0.0);
    let main = n - n % 8;
    for i in 0..m {
        for p in 0..k {
            let a_ip = a[i * k + p];
            if a_ip == 0.0 {
                continue;
            }
            let va = _mm256_set1_ps(a_ip);
            let b_row = b.as_ptr().add(p * n);
            let c_row = c.as_mut_ptr().add(i * n);
            for j in (0..main).step_by(8) {
                let vb = _mm256_loadu_ps(b_row.add(j));
                let vc = _mm256_loadu_ps(c_row.add(j));
                _mm256_storeu_ps(c_row.add(j), _mm256_add_ps(vc, _mm256_mul_ps(va, vb)));
            }
            for j in main..n {
                *c_row.add(j) += a_ip * *b_row.add(j);
            }
        }
    }
}

#[target_feature(enable = "avx2,fma")]
unsafe fn matmul_fma_impl(a: &[f32], b: &[f32], c: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert!(a.len() >= m * k && b.len() >= k * n && c.len() >= m * n);
    c[..m * n].fill(0.0);
    let main = n - n % 8;
    for i in 0..m {
        for p in 0..k {
            let a_ip = a[i * k + p];
            if a_ip == 0.0 {
                continue;
            }
            let va = _mm256_set1_ps(a_ip);
            let b_row = b.as_ptr().add(p * n);
            let c_row = c.as_mut_ptr().add(i * n);
            for j in (0..main).step_by(8) {
                let vb = _mm256_loadu_ps(b_row.add(j));
                let vc = _mm256_loadu_ps(c_row.add(j));
                _mm256_storeu_ps(c_row.add(j), _mm256_fmadd_ps(va, vb, vc));
            }
            for j in main..n {
                *c_row.add(j) = a_ip.mul_add(*b_row.add(j), *c_row.add(j));
            }
        }
    }
}

#[target_feature(enable = "avx")]
unsafe fn relu_impl(x: &[f32], out: &mut [f32]) {
    debug_assert_eq!(x.len(), out.len());
    let n = x.len();
    let main = n - n % 8;
    let zero = _mm256_setzero_ps();
    for i in (0..main).step_by(8) {
        let vx = _mm256_loadu_ps(x.as_ptr().add(i));
        _mm256_storeu_ps(out.as_mut_ptr().add(i), _mm256_max_ps(vx, zero));
    }
    for i in main..n {
        out[i] = x[i].max(0.0);
    }
}

/// Padé 7/6 tanh on 8 lanes, input pre-clamped to [-5, 5].
#[inline]
#[target_feature(enable = "avx")]
unsafe fn tanh_lanes(x: __m256) -> __m256 {
    let x = _mm256_max_ps(_mm256_min_ps(x, _mm256_set1_ps(5.0)), _mm256_set1_ps(-5.0));
    let x2 = _mm256_mul_ps(x, x);
    let num = _mm256_mul_ps(
        x,
        _mm256_add_ps(
            _mm256_set1_ps(135_135.0),
            _mm256_mul_ps(
                x2,
                _mm256_add_ps(
                    _mm256_set1_ps(17_325.0),
                    _mm256_mul_ps(x2, _mm256_add_ps(_mm256_set1_ps(378.0), x2)),
                ),
            ),
        ),
    );
    let den = _mm256_add_ps(
        _mm256_set1_ps(135_135.0),
        _mm256_mul_ps(
            x2,
            _mm256_add_ps(
                _mm256_set1_ps(62_370.0),
                _mm256_mul_ps(
                    x2,
                    _mm256_add_ps(
                        _mm256_set1_ps(3_150.0),
                        _mm256_mul_ps(x2, _mm256_set1_ps(28.0)),
                    ),
                ),
            ),
        ),
    );
    _mm256_div_ps(num, den)
}

#[target_feature(enable = "avx")]
unsafe fn tanh_impl(x: &[f32], out: &mut [f32]) {
    debug_assert_eq!(x.len(), out.len());
    let n = x.len();
    let main = n - n % 8;
    for i in (0..main).step_by(8) {
        let vx = _mm256_loadu_ps(x.as_ptr().add(i));
        _mm256_storeu_ps(out.as_mut_ptr().add(i), tanh_lanes(vx));
    }
    for i in main..n {
        out[i] = crate::scalar::tanh_pade(x[i]);
    }
}

#[target_feature(enable = "avx")]
unsafe fn sigmoid_impl(x: &[f32], out: &mut [f32]) {
    debug_assert_eq!(x.len(), out.len());
    let n = x.len();
    let main = n - n % 8;
    let half = _mm256_set1_ps(0.5);
    let hi = _mm256_set1_ps(10.0);
    let lo = _mm256_set1_ps(-10.0);
    for i in (0..main).step_by(8) {
        let vx = _mm256_loadu_ps(x.as_ptr().add(i));
        let clamped = _mm256_max_ps(_mm256_min_ps(vx, hi), lo);
        let t = tanh_lanes(_mm256_mul_ps(clamped, half));
        let result = _mm256_add_ps(half, _mm256_mul_ps(half, t));
        _mm256_storeu_ps(out.as_mut_ptr().add(i), result);
    }
    for i in main..n {
        let v = x[i].clamp(-10.0, 10.0);
        out[i] = 0.5 + 0.5 * crate::scalar::tanh_pade(0.5 * v);
    }
}

#[target_feature(enable = "avx")]
unsafe fn gelu_impl(x: &[f32], out: &mut [f32]) {
    debug_assert_eq!(x.len(), out.len());
    let n = x.len();
    let main = n - n % 8;
    let half = _mm256_set1_ps(0.5);
    let one = _mm256_set1_ps(1.0);
    let c0 = _mm256_set1_ps(0.797_884_56);
    let c1 = _mm256_set1_ps(0.044_715);
    for i in (0..main).step_by(8) {
        let vx = _mm256_loadu_ps(x.as_ptr().add(i));
        let x3 = _mm256_mul_ps(vx, _mm256_mul_ps(vx, vx));
        let inner = _mm256_mul_ps(c0, _mm256_add_ps(vx, _mm256_mul_ps(c1, x3)));
        let t = tanh_lanes(inner);
        let result = _mm256_mul_ps(_mm256_mul_ps(half, vx), _mm256_add_ps(one, t));
        _mm256_storeu_ps(out.as_mut_ptr().add(i), result);
    }
    for i in main..n {
        let v = x[i];
        let inner = 0.797_884_56 * (v + 0.044_715 * v * v * v);
        out[i] = 0.5 * v * (1.0 + crate::scalar::tanh_pade(inner));
    }
}

#[target_feature(enable = "avx")]
unsafe fn softmax_impl(x: &[f32], out: &mut [f32]) {
    debug_assert_eq!(x.len(), out.len());
    let n = x.len();
    if n == 0 {
        return;
    }
    let main = n - n % 8;

    let mut vmax = _mm256_set1_ps(f32::NEG_INFINITY);
    for i in (0..main).step_by(8) {
        vmax = _mm256_max_ps(vmax, _mm256_loadu_ps(x.as_ptr().add(i)));
    }
    let mut max = hmax256(vmax);
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
    let vinv = _mm256_set1_ps(inv);
    for i in (0..main).step_by(8) {
        let v = _mm256_loadu_ps(out.as_ptr().add(i));
        _mm256_storeu_ps(out.as_mut_ptr().add(i), _mm256_mul_ps(v, vinv));
    }
    for v in out[main..n].iter_mut() {
        *v *= inv;
    }
}

#[target_feature(enable = "avx")]
unsafe fn layer_norm_impl(
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
    let main = n - n % 8;

    let mut vsum = _mm256_setzero_ps();
    for i in (0..main).step_by(8) {
        vsum = _mm256_add_ps(vsum, _mm256_loadu_ps(x.as_ptr().add(i)));
    }
    let mut sum = hsum256(vsum);
    for i in main..n {
        sum += x[i];
    }
    let mean = sum / n as f32;

    let vmean = _mm256_set1_ps(mean);
    let mut vvar = _mm256_setzero_ps();
    for i in (0..main).step_by(8) {
        let d = _mm256_sub_ps(_mm256_loadu_ps(x.as_ptr().add(i)), vmean);
        vvar = _mm256_add_ps(vvar, _mm256_mul_ps(d, d));
    }
    let mut var = hsum256(vvar);
    for i in main..n {
        let d = x[i] - mean;
        var += d * d;
    }
    var /= n as f32;

    let inv_std = 1.0 / (var + epsilon).sqrt();
    let vinv = _mm256_set1_ps(inv_std);
    for i in (0..main).step_by(8) {
        let d = _mm256_sub_ps(_mm256_loadu_ps(x.as_ptr().add(i)), vmean);
        _mm256_storeu_ps(out.as_mut_ptr().add(i), _mm256_mul_ps(d, vinv));
    }
    for i in main..n {
        out[i] = (x[i] - mean) * inv_std;
    }

    if let Some(g) = gamma {
        for i in (0..main).step_by(8) {
            let v = _mm256_mul_ps(
                _mm256_loadu_ps(out.as_ptr().add(i)),
                _mm256_loadu_ps(g.as_ptr().add(i)),
            );
            _mm256_storeu_ps(out.as_mut_ptr().add(i), v);
        }
        for i in main..n {
            out[i] *= g[i];
        }
    }
    if let Some(b) = beta {
        for i in (0..main).step_by(8) {
            let v = _mm256_add_ps(
                _mm256_loadu_ps(out.as_ptr().add(i)),
                _mm256_loadu_ps(b.as_ptr().add(i)),
            );
            _mm256_storeu_ps(out.as_mut_ptr().add(i), v);
        }
        for i in main..n {
            out[i] += b[i];
        }
    }
}

#[target_feature(enable = "avx")]
unsafe fn complex_mul_impl(
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
    let main = n - n % 8;
    for i in (0..main).step_by(8) {
        let var = _mm256_loadu_ps(ar.as_ptr().add(i));
        let vai = _mm256_loadu_ps(ai.as_ptr().add(i));
        let vbr = _mm256_loadu_ps(br.as_ptr().add(i));
        let vbi = _mm256_loadu_ps(bi.as_ptr().add(i));
        let re = _mm256_sub_ps(_mm256_mul_ps(var, vbr), _mm256_mul_ps(vai, vbi));
        let im = _mm256_add_ps(_mm256_mul_ps(var, vbi), _mm256_mul_ps(vai, vbr));
        _mm256_storeu_ps(out_re.as_mut_ptr().add(i), re);
        _mm256_storeu_ps(out_im.as_mut_ptr().add(i), im);
    }
    for i in main..n {
        out_re[i] = ar[i] * br[i] - ai[i] * bi[i];
        out_im[i] = ar[i] * bi[i] + ai[i] * br[i];
    }
}

#[target_feature(enable = "avx")]
unsafe fn complex_magnitude_impl(re: &[f32], im: &[f32], out: &mut [f32]) {
    debug_assert!(re.len() == im.len() && re.len() == out.len());
    let n = re.len();
    let main = n - n % 8;
    for i in (0..main).step_by(8) {
        let vr = _mm256_loadu_ps(re.as_ptr().add(i));
        let vi = _mm256_loadu_ps(im.as_ptr().add(i));
        let mag = _mm256_sqrt_ps(_mm256_add_ps(_mm256_mul_ps(vr, vr), _mm256_mul_ps(vi, vi)));
        _mm256_storeu_ps(out.as_mut_ptr().add(i), mag);
    }
    for i in main..n {
        out[i] = (re[i] * re[i] + im[i] * im[i]).sqrt();
    }
}
