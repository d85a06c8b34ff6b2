//! Scalar (portable CPU) kernel implementations
//!
//! Reference semantics for every primitive. Every SIMD backend is tested
//! against these, and the dispatch façade falls back to them when no
//! registered kernel matches.
//!
//! Kernels trust their arguments; the façade validates shapes before
//! calling in. Length relationships are `debug_assert`ed only.

/// Elementwise `out = a + b`.
pub fn vector_add(a: &[f32], b: &[f32], out: &mut [f32]) {
    debug_assert!(a.len() == b.len() && a.len() == out.len());
    for i in 0..a.len() {
        out[i] = a[i] + b[i];
    }
}

/// Elementwise `out = a * b`.
pub fn vector_mul(a: &[f32], b: &[f32], out: &mut [f32]) {
    debug_assert!(a.len() == b.len() && a.len() == out.len());
    for i in 0..a.len() {
        out[i] = a[i] * b[i];
    }
}

/// Analysis-window application: `out = frame * window`.
pub fn window_apply(frame: &[f32], window: &[f32], out: &mut [f32]) {
    vector_mul(frame, window, out)
}

/// Elementwise `out = x * scale`.
pub fn vector_scale(x: &[f32], scale: f32, out: &mut [f32]) {
    debug_assert_eq!(x.len(), out.len());
    for i in 0..x.len() {
        out[i] = x[i] * scale;
    }
}

/// Inner product of `a` and `b`.
pub fn vector_dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut acc = 0.0f32;
    for i in 0..a.len() {
        acc += a[i] * b[i];
    }
    acc
}

/// Row-major GEMM: `C = A * B` with A `(m, k)`, B `(k, n)`, C `(m, n)`.
/// C is zeroed before accumulation; no bias.
pub fn matmul(a: &[f32], b: &[f32], c: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert!(a.len() >= m * k && b.len() >= k * n && c.len() >= m * n);
    c[..m * n].fill(0.0);
    for i in 0..m {
        for p in 0..k {
            let a_ip = a[i * k + p];
            if a_ip == 0.0 {
                continue;
            }
            let b_row = &b[p * n..p * n + n];
            let c_row = &mut c[i * n..i * n + n];
            for j in 0..n {
                c_row[j] += a_ip * b_row[j];
            }
        }
    }
}

/// GEMM with rayon row partitioning. Registered under a large
/// `optimal_size` so it only wins for work sizes where thread fan-out
/// pays for itself.
pub fn matmul_parallel(a: &[f32], b: &[f32], c: &mut [f32], m: usize, k: usize, n: usize) {
    use rayon::prelude::*;
    debug_assert!(a.len() >= m * k && b.len() >= k * n && c.len() >= m * n);
    c[..m * n]
        .par_chunks_mut(n)
        .enumerate()
        .for_each(|(i, c_row)| {
            c_row.fill(0.0);
            for p in 0..k {
                let a_ip = a[i * k + p];
                if a_ip == 0.0 {
                    continue;
                }
                let b_row = &b[p * n..p * n + n];
                for j in 0..n {
                    c_row[j] += a_ip * b_row[j];
                }
            }
        });
}

/// `out = max(x, 0)`.
pub fn relu(x: &[f32], out: &mut [f32]) {
    debug_assert_eq!(x.len(), out.len());
    for i in 0..x.len() {
        out[i] = x[i].max(0.0);
    }
}

/// Padé 7/6 tanh approximation, clamped to the [-5, 5] validity window.
/// Max absolute error against `f64::tanh` stays within ~1e-3 across the
/// window (worst at the clamp edges) and the clamp saturates toward ±1
/// beyond it, well inside the 5e-3 activation contract.
pub fn tanh_pade(x: f32) -> f32 {
    let x = x.clamp(-5.0, 5.0);
    let x2 = x * x;
    let num = x * (135_135.0 + x2 * (17_325.0 + x2 * (378.0 + x2)));
    let den = 135_135.0 + x2 * (62_370.0 + x2 * (3_150.0 + x2 * 28.0));
    num / den
}

/// `out = tanh(x)` via the shared Padé approximation.
pub fn tanh_act(x: &[f32], out: &mut [f32]) {
    debug_assert_eq!(x.len(), out.len());
    for i in 0..x.len() {
        out[i] = tanh_pade(x[i]);
    }
}

/// `out = 1 / (1 + exp(-x))`, expressed through tanh so the same bounded
/// approximation serves both: sigmoid(x) = 0.5 + 0.5*tanh(x/2), with the
/// input clamped to [-10, 10].
pub fn sigmoid(x: &[f32], out: &mut [f32]) {
    debug_assert_eq!(x.len(), out.len());
    for i in 0..x.len() {
        let v = x[i].clamp(-10.0, 10.0);
        out[i] = 0.5 + 0.5 * tanh_pade(0.5 * v);
    }
}

/// Tanh-form GELU: `0.5*x*(1 + tanh(sqrt(2/pi)*(x + 0.044715*x^3)))`.
pub fn gelu(x: &[f32], out: &mut [f32]) {
    debug_assert_eq!(x.len(), out.len());
    const SQRT_2_OVER_PI: f32 = 0.797_884_56;
    for i in 0..x.len() {
        let v = x[i];
        let inner = SQRT_2_OVER_PI * (v + 0.044_715 * v * v * v);
        out[i] = 0.5 * v * (1.0 + tanh_pade(inner));
    }
}

/// Numerically stabilized softmax: subtract the max, exponentiate,
/// normalize. The sum runs in f64 so a 10k-element output still sums to
/// 1 within 1e-5.
pub fn softmax(x: &[f32], out: &mut [f32]) {
    debug_assert_eq!(x.len(), out.len());
    if x.is_empty() {
        return;
    }
    let max = x.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    let mut sum = 0.0f64;
    for i in 0..x.len() {
        let e = (x[i] - max).exp();
        out[i] = e;
        sum += e as f64;
    }
    let inv = (1.0 / sum) as f32;
    for v in out.iter_mut() {
        *v *= inv;
    }
}

/// Per-vector layer normalization with optional affine parameters.
/// `epsilon` is added under the square root.
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
    let mean = x.iter().sum::<f32>() / n as f32;
    let var = x.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / n as f32;
    let inv_std = 1.0 / (var + epsilon).sqrt();
    for i in 0..n {
        let mut v = (x[i] - mean) * inv_std;
        if let Some(g) = gamma {
            v *= g[i];
        }
        if let Some(b) = beta {
            v += b[i];
        }
        out[i] = v;
    }
}

/// Batch normalization over `(rows, channels)` with per-channel running
/// mean/variance and optional affine parameters. `channels = mean.len()`.
pub fn batch_norm(
    x: &[f32],
    mean: &[f32],
    var: &[f32],
    gamma: Option<&[f32]>,
    beta: Option<&[f32]>,
    epsilon: f32,
    out: &mut [f32],
) {
    debug_assert_eq!(x.len(), out.len());
    debug_assert_eq!(mean.len(), var.len());
    let channels = mean.len();
    if channels == 0 {
        return;
    }
    for (i, &v) in x.iter().enumerate() {
        let c = i % channels;
        let mut r = (v - mean[c]) / (var[c] + epsilon).sqrt();
        if let Some(g) = gamma {
            r *= g[c];
        }
        if let Some(b) = beta {
            r += b[c];
        }
        out[i] = r;
    }
}

/// Mel filterbank projection: spectrogram `(n_frames, n_fft)` times
/// filters `(n_mels, n_fft)` transposed, producing `(n_frames, n_mels)`.
pub fn mel_filterbank(
    spec: &[f32],
    filters: &[f32],
    out: &mut [f32],
    n_frames: usize,
    n_fft: usize,
    n_mels: usize,
) {
    debug_assert!(spec.len() >= n_frames * n_fft);
    debug_assert!(filters.len() >= n_mels * n_fft);
    debug_assert!(out.len() >= n_frames * n_mels);
    for t in 0..n_frames {
        let frame = &spec[t * n_fft..(t + 1) * n_fft];
        for m in 0..n_mels {
            let filt = &filters[m * n_fft..(m + 1) * n_fft];
            out[t * n_mels + m] = vector_dot(frame, filt);
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
    for i in 0..ar.len() {
        out_re[i] = ar[i] * br[i] - ai[i] * bi[i];
        out_im[i] = ar[i] * bi[i] + ai[i] * br[i];
    }
}

/// Elementwise complex magnitude: `out = sqrt(re^2 + im^2)`.
pub fn complex_magnitude(re: &[f32], im: &[f32], out: &mut [f32]) {
    debug_assert!(re.len() == im.len() && re.len() == out.len());
    for i in 0..re.len() {
        out[i] = (re[i] * re[i] + im[i] * im[i]).sqrt();
    }
}

/// Floor under log inputs so silent bins stay finite.
pub const LOG_SPECTRUM_FLOOR: f32 = 1e-10;

/// Natural-log spectrum: `out = ln(max(x, floor))`.
pub fn log_spectrum(x: &[f32], out: &mut [f32]) {
    debug_assert_eq!(x.len(), out.len());
    for i in 0..x.len() {
        out[i] = x[i].max(LOG_SPECTRUM_FLOOR).ln();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_ops() {
        let a = [1.0, 2.0, 3.0];
        let b = [4.0, 5.0, 6.0];
        let mut out = [0.0; 3];

        vector_add(&a, &b, &mut out);
        assert_eq!(out, [5.0, 7.0, 9.0]);

        vector_mul(&a, &b, &mut out);
        assert_eq!(out, [4.0, 10.0, 18.0]);

        vector_scale(&a, 2.0, &mut out);
        assert_eq!(out, [2.0, 4.0, 6.0]);

        assert_eq!(vector_dot(&a, &b), 32.0);
    }

    #[test]
    fn test_matmul_known_answer() {
        // [[1,2],[3,4]] * [[5,6],[7,8]] = [[19,22],[43,50]]
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [5.0, 6.0, 7.0, 8.0];
        let mut c = [0.0; 4];
        matmul(&a, &b, &mut c, 2, 2, 2);
        assert_eq!(c, [19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_matmul_zeroes_destination() {
        let a = [1.0];
        let b = [1.0];
        let mut c = [99.0];
        matmul(&a, &b, &mut c, 1, 1, 1);
        assert_eq!(c, [1.0]);
    }

    #[test]
    fn test_matmul_degenerate_shapes() {
        // m = 1, n = 3, k = 2
        let a = [1.0, 2.0];
        let b = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut c = [0.0; 3];
        matmul(&a, &b, &mut c, 1, 2, 3);
        assert_eq!(c, [9.0, 12.0, 15.0]);
    }

    #[test]
    fn test_matmul_parallel_matches_serial() {
        let m = 17;
        let k = 9;
        let n = 13;
        let a: Vec<f32> = (0..m * k).map(|i| (i % 7) as f32 - 3.0).collect();
        let b: Vec<f32> = (0..k * n).map(|i| (i % 5) as f32 * 0.5).collect();
        let mut c1 = vec![0.0; m * n];
        let mut c2 = vec![0.0; m * n];
        matmul(&a, &b, &mut c1, m, k, n);
        matmul_parallel(&a, &b, &mut c2, m, k, n);
        assert_eq!(c1, c2);
    }

    #[test]
    fn test_relu() {
        let x = [-1.0, 0.0, 2.5];
        let mut out = [0.0; 3];
        relu(&x, &mut out);
        assert_eq!(out, [0.0, 0.0, 2.5]);
    }

    #[test]
    fn test_tanh_pade_accuracy() {
        for i in -50..=50 {
            let x = i as f32 * 0.1;
            let approx = tanh_pade(x);
            let exact = (x as f64).tanh() as f32;
            assert!(
                (approx - exact).abs() <= 5e-3,
                "tanh({x}) = {approx}, exact {exact}"
            );
        }
        // Saturation outside the window.
        assert!((tanh_pade(8.0) - 1.0).abs() < 1e-3);
        assert!((tanh_pade(-8.0) + 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_sigmoid_accuracy() {
        let xs: Vec<f32> = (-100..=100).map(|i| i as f32 * 0.1).collect();
        let mut out = vec![0.0; xs.len()];
        sigmoid(&xs, &mut out);
        for (&x, &y) in xs.iter().zip(&out) {
            let exact = 1.0 / (1.0 + (-x as f64).exp());
            assert!(
                (y as f64 - exact).abs() <= 1e-3,
                "sigmoid({x}) = {y}, exact {exact}"
            );
        }
    }

    #[test]
    fn test_gelu_reference_points() {
        let x = [0.0f32, 1.0, -1.0];
        let mut out = [0.0; 3];
        gelu(&x, &mut out);
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 0.8412).abs() < 1e-2);
        assert!((out[2] + 0.1588).abs() < 1e-2);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let x: Vec<f32> = (0..1000).map(|i| (i as f32 * 0.013).sin() * 8.0).collect();
        let mut out = vec![0.0; x.len()];
        softmax(&x, &mut out);
        let sum: f32 = out.iter().sum();
        assert!((sum - 1.0).abs() <= 1e-5, "sum = {sum}");
        assert!(out.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn test_softmax_handles_large_inputs() {
        let x = [1000.0f32, 1000.0, 1000.0];
        let mut out = [0.0; 3];
        softmax(&x, &mut out);
        for v in out {
            assert!((v - 1.0 / 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_layer_norm_zero_mean_unit_var() {
        let x = [1.0f32, 2.0, 3.0, 4.0];
        let mut out = [0.0; 4];
        layer_norm(&x, None, None, 1e-5, &mut out);
        let mean: f32 = out.iter().sum::<f32>() / 4.0;
        let var: f32 = out.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-6);
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_layer_norm_affine() {
        let x = [1.0f32, 2.0, 3.0, 4.0];
        let gamma = [2.0f32; 4];
        let beta = [1.0f32; 4];
        let mut plain = [0.0; 4];
        let mut affine = [0.0; 4];
        layer_norm(&x, None, None, 1e-5, &mut plain);
        layer_norm(&x, Some(&gamma), Some(&beta), 1e-5, &mut affine);
        for i in 0..4 {
            assert!((affine[i] - (plain[i] * 2.0 + 1.0)).abs() < 1e-6);
        }
    }

    #[test]
    fn test_batch_norm_identity_stats() {
        // mean 0, var 1 and no affine leaves the input unchanged
        // (up to the epsilon term).
        let x = [1.0f32, -2.0, 3.0, -4.0];
        let mean = [0.0f32, 0.0];
        let var = [1.0f32, 1.0];
        let mut out = [0.0; 4];
        batch_norm(&x, &mean, &var, None, None, 0.0, &mut out);
        for i in 0..4 {
            assert!((out[i] - x[i]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_mel_filterbank_shapes() {
        // 2 frames, 4 bins, 2 mel channels.
        let spec = [1.0f32, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0];
        let filters = [0.5f32, 0.5, 0.0, 0.0, 0.0, 0.0, 0.5, 0.5];
        let mut out = [0.0; 4];
        mel_filterbank(&spec, &filters, &mut out, 2, 4, 2);
        assert_eq!(out, [0.5, 0.0, 0.5, 0.0]);
    }

    #[test]
    fn test_complex_mul() {
        // (1 + 2i) * (3 + 4i) = -5 + 10i
        let mut re = [0.0];
        let mut im = [0.0];
        complex_mul(&[1.0], &[2.0], &[3.0], &[4.0], &mut re, &mut im);
        assert_eq!(re, [-5.0]);
        assert_eq!(im, [10.0]);
    }

    #[test]
    fn test_complex_magnitude() {
        let mut out = [0.0];
        complex_magnitude(&[3.0], &[4.0], &mut out);
        assert_eq!(out, [5.0]);
    }

    #[test]
    fn test_log_spectrum_floors_zero() {
        let mut out = [0.0; 2];
        log_spectrum(&[0.0, 1.0], &mut out);
        assert_eq!(out[0], LOG_SPECTRUM_FLOOR.ln());
        assert_eq!(out[1], 0.0);
    }
}
