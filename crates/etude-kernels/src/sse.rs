//! SSE/SSE2 kernel implementations (x86-64, 4-wide f32)
//!
//! SSE and SSE2 are part of the x86-64 baseline ABI, so these functions
//! need no runtime guard of their own; the registry still records the
//! requirement so `select` stays honest on hypothetical no-SSE masks.
//!
//! Main lanes run 4 wide with unaligned loads; tails fall back to scalar.

#![cfg(target_arch = "x86_64")]

use std::arch::x86_64::*;

/// Elementwise `out = a + b`.
pub fn vector_add(a: &[f32], b: &[f32], out: &mut [f32]) {
    debug_assert!(a.len() == b.len() && a.len() == out.len());
    let n = a.len();
    let main = n - n % 4;
    unsafe {
        for i in (0..main).step_by(4) {
            let va = _mm_loadu_ps(a.as_ptr().add(i));
            let vb = _mm_loadu_ps(b.as_ptr().add(i));
            _mm_storeu_ps(out.as_mut_ptr().add(i), _mm_add_ps(va, vb));
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
            let va = _mm_loadu_ps(a.as_ptr().add(i));
            let vb = _mm_loadu_ps(b.as_ptr().add(i));
            _mm_storeu_ps(out.as_mut_ptr().add(i), _mm_mul_ps(va, vb));
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
        let vs = _mm_set1_ps(scale);
        for i in (0..main).step_by(4) {
            let vx = _mm_loadu_ps(x.as_ptr().add(i));
            _mm_storeu_ps(out.as_mut_ptr().add(i), _mm_mul_ps(vx, vs));
        }
    }
    for i in main..n {
        out[i] = x[i] * scale;
    }
}

/// Horizontal sum of all four lanes.
#[inline]
unsafe fn hsum128(v: __m128) -> f32 {
    let hi = _mm_movehl_ps(v, v);
    let sum2 = _mm_add_ps(v, hi);
    let lane1 = _mm_shuffle_ps::<0b01>(sum2, sum2);
    _mm_cvtss_f32(_mm_add_ss(sum2, lane1))
}

/// Tree-reduced dot product.
pub fn vector_dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let n = a.len();
    let main = n - n % 4;
    let mut acc;
    unsafe {
        let mut vacc = _mm_setzero_ps();
        for i in (0..main).step_by(4) {
            let va = _mm_loadu_ps(a.as_ptr().add(i));
            let vb = _mm_loadu_ps(b.as_ptr().add(i));
            vacc = _mm_add_ps(vacc, _mm_mul_ps(va, vb));
        }
        acc = hsum128(vacc);
    }
    for i in main..n {
        acc += a[i] * b[i];
    }
    acc
}

/// Row-major GEMM, 4-wide over columns of C. C is zeroed first.
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
                let va = _mm_set1_ps(a_ip);
                let b_row = b.as_ptr().add(p * n);
                let c_row = c.as_mut_ptr().add(i * n);
                for j in (0..main).step_by(4) {
                    let vb = _mm_loadu_ps(b_row.add(j));
                    let vc = _mm_loadu_ps(c_row.add(j));
                    _mm_storeu_ps(c_row.add(j), _mm_add_ps(vc, _mm_mul_ps(va, vb)));
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
        let zero = _mm_setzero_ps();
        for i in (0..main).step_by(4) {
            let vx = _mm_loadu_ps(x.as_ptr().add(i));
            _mm_storeu_ps(out.as_mut_ptr().add(i), _mm_max_ps(vx, zero));
        }
    }
    for i in main..n {
        out[i] = x[i].max(0.0);
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
    let n = ar.len();
    let main = n - n % 4;
    unsafe {
        for i in (0..main).step_by(4) {
            let var = _mm_loadu_ps(ar.as_ptr().add(i));
            let vai = _mm_loadu_ps(ai.as_ptr().add(i));
            let vbr = _mm_loadu_ps(br.as_ptr().add(i));
            let vbi = _mm_loadu_ps(bi.as_ptr().add(i));
            let re = _mm_sub_ps(_mm_mul_ps(var, vbr), _mm_mul_ps(vai, vbi));
            let im = _mm_add_ps(_mm_mul_ps(var, vbi), _mm_mul_ps(vai, vbr));
            _mm_storeu_ps(out_re.as_mut_ptr().add(i), re);
            _mm_storeu_ps(out_im.as_mut_ptr().add(i), im);
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
            let vr = _mm_loadu_ps(re.as_ptr().add(i));
            let vi = _mm_loadu_ps(im.as_ptr().add(i));
            let mag = _mm_sqrt_ps(_mm_add_ps(_mm_mul_ps(vr, vr), _mm_mul_ps(vi, vi)));
            _mm_storeu_ps(out.as_mut_ptr().add(i), mag);
        }
    }
    for i in main..n {
        out[i] = (re[i] * re[i] + im[i] * im[i]).sqrt();
    }
}
