//! Per-backend kernel registration
//!
//! Called by [`KernelRegistry::init`](crate::KernelRegistry::init) in
//! backend order: scalar, SSE, AVX, NEON, GPU stub. Seed scores reflect
//! rough relative throughput (scalar 1.0, SSE 2.5, NEON 3.5, AVX 4.0);
//! the self-benchmark replaces them with measured numbers.

use etude_core::{IsaSet, Result};

use crate::registry::{KernelEntry, KernelFn, KernelRegistry};
use crate::{bf16, scalar};

fn entry(name: &str, isa: IsaSet, optimal: usize, score: f64, kernel: KernelFn) -> KernelEntry {
    KernelEntry {
        name: name.to_string(),
        required_isa: isa,
        optimal_size: optimal,
        performance_score: score,
        kernel,
    }
}

/// Scalar CPU backend: every primitive, all sizes, no ISA requirement.
pub fn register_scalar(reg: &mut KernelRegistry) -> Result<()> {
    let none = IsaSet::default();
    let entries = [
        entry("vector_add_cpu", none, 0, 1.0, KernelFn::VectorBinary(scalar::vector_add)),
        entry("vector_mul_cpu", none, 0, 1.0, KernelFn::VectorBinary(scalar::vector_mul)),
        entry("window_apply_cpu", none, 0, 1.0, KernelFn::VectorBinary(scalar::window_apply)),
        entry("vector_scale_cpu", none, 0, 1.0, KernelFn::VectorScale(scalar::vector_scale)),
        entry("vector_dot_cpu", none, 0, 1.0, KernelFn::Dot(scalar::vector_dot)),
        entry("matmul_cpu", none, 0, 1.0, KernelFn::Matmul(scalar::matmul)),
        // Thread fan-out only pays off for large work; the optimal size
        // keeps it out of small GEMMs (select passes m*k*n).
        entry(
            "matmul_parallel",
            none,
            1 << 18,
            1.5,
            KernelFn::Matmul(scalar::matmul_parallel),
        ),
        entry("relu_cpu", none, 0, 1.0, KernelFn::Map(scalar::relu)),
        entry("sigmoid_cpu", none, 0, 1.0, KernelFn::Map(scalar::sigmoid)),
        entry("tanh_cpu", none, 0, 1.0, KernelFn::Map(scalar::tanh_act)),
        entry("gelu_cpu", none, 0, 1.0, KernelFn::Map(scalar::gelu)),
        entry("softmax_cpu", none, 0, 1.0, KernelFn::Map(scalar::softmax)),
        entry("log_spectrum_cpu", none, 0, 1.0, KernelFn::Map(scalar::log_spectrum)),
        entry("layer_norm_cpu", none, 0, 1.0, KernelFn::LayerNorm(scalar::layer_norm)),
        entry("batch_norm_cpu", none, 0, 1.0, KernelFn::BatchNorm(scalar::batch_norm)),
        entry(
            "mel_filterbank_cpu",
            none,
            0,
            1.0,
            KernelFn::MelFilterbank(scalar::mel_filterbank),
        ),
        entry("complex_mul_cpu", none, 0, 1.0, KernelFn::ComplexBinary(scalar::complex_mul)),
        entry(
            "complex_magnitude_cpu",
            none,
            0,
            1.0,
            KernelFn::ComplexMagnitude(scalar::complex_magnitude),
        ),
        entry(
            "bfloat16_from_f32_cpu",
            none,
            0,
            1.0,
            KernelFn::Bf16FromF32(bf16::f32_slice_to_bf16),
        ),
        entry(
            "bfloat16_to_f32_cpu",
            none,
            0,
            1.0,
            KernelFn::Bf16ToF32(bf16::bf16_slice_to_f32),
        ),
        entry("bfloat16_add_cpu", none, 0, 1.0, KernelFn::Bf16Binary(bf16::bf16_add)),
        entry("bfloat16_mul_cpu", none, 0, 1.0, KernelFn::Bf16Binary(bf16::bf16_mul)),
    ];
    for e in entries {
        reg.register(e)?;
    }
    Ok(())
}

/// SSE backend (x86-64, 4-wide).
#[cfg(target_arch = "x86_64")]
pub fn register_sse(reg: &mut KernelRegistry) -> Result<()> {
    use crate::sse;
    use etude_core::IsaFlag;

    let isa = IsaFlag::Sse | IsaFlag::Sse2;
    let entries = [
        entry("vector_add_sse", isa, 64, 2.5, KernelFn::VectorBinary(sse::vector_add)),
        entry("vector_mul_sse", isa, 64, 2.5, KernelFn::VectorBinary(sse::vector_mul)),
        entry("window_apply_sse", isa, 64, 2.5, KernelFn::VectorBinary(sse::vector_mul)),
        entry("vector_scale_sse", isa, 64, 2.5, KernelFn::VectorScale(sse::vector_scale)),
        entry("vector_dot_sse", isa, 64, 2.5, KernelFn::Dot(sse::vector_dot)),
        entry("matmul_sse", isa, 256, 2.5, KernelFn::Matmul(sse::matmul)),
        entry("relu_sse", isa, 64, 2.5, KernelFn::Map(sse::relu)),
        entry("complex_mul_sse", isa, 64, 2.5, KernelFn::ComplexBinary(sse::complex_mul)),
        entry(
            "complex_magnitude_sse",
            isa,
            64,
            2.5,
            KernelFn::ComplexMagnitude(sse::complex_magnitude),
        ),
    ];
    for e in entries {
        reg.register(e)?;
    }
    Ok(())
}

/// AVX backend (x86-64, 8-wide; FMA GEMM when the mask allows).
#[cfg(target_arch = "x86_64")]
pub fn register_avx(reg: &mut KernelRegistry) -> Result<()> {
    use crate::avx;
    use etude_core::IsaFlag;

    let isa: IsaSet = IsaFlag::Avx.into();
    let entries = [
        entry("vector_add_avx", isa, 128, 4.0, KernelFn::VectorBinary(avx::vector_add)),
        entry("vector_mul_avx", isa, 128, 4.0, KernelFn::VectorBinary(avx::vector_mul)),
        entry("window_apply_avx", isa, 128, 4.0, KernelFn::VectorBinary(avx::vector_mul)),
        entry("vector_scale_avx", isa, 128, 4.0, KernelFn::VectorScale(avx::vector_scale)),
        entry("vector_dot_avx", isa, 128, 4.0, KernelFn::Dot(avx::vector_dot)),
        entry("matmul_avx", isa, 512, 4.0, KernelFn::Matmul(avx::matmul)),
        entry("relu_avx", isa, 128, 4.0, KernelFn::Map(avx::relu)),
        entry("sigmoid_avx", isa, 128, 4.0, KernelFn::Map(avx::sigmoid)),
        entry("tanh_avx", isa, 128, 4.0, KernelFn::Map(avx::tanh_act)),
        entry("gelu_avx", isa, 128, 4.0, KernelFn::Map(avx::gelu)),
        entry("softmax_avx", isa, 128, 2.0, KernelFn::Map(avx::softmax)),
        entry("layer_norm_avx", isa, 128, 4.0, KernelFn::LayerNorm(avx::layer_norm)),
        entry("complex_mul_avx", isa, 128, 4.0, KernelFn::ComplexBinary(avx::complex_mul)),
        entry(
            "complex_magnitude_avx",
            isa,
            128,
            4.0,
            KernelFn::ComplexMagnitude(avx::complex_magnitude),
        ),
        entry(
            "matmul_avx_fma",
            IsaFlag::Avx | IsaFlag::Avx2 | IsaFlag::Fma,
            512,
            5.0,
            KernelFn::Matmul(avx::matmul_fma),
        ),
    ];
    for e in entries {
        reg.register(e)?;
    }
    Ok(())
}

/// NEON backend (aarch64, 4-wide) plus the mobile specializations.
#[cfg(target_arch = "aarch64")]
pub fn register_neon(reg: &mut KernelRegistry) -> Result<()> {
    use crate::neon;
    use etude_core::IsaFlag;

    let isa: IsaSet = IsaFlag::Neon.into();
    let entries = [
        entry("vector_add_neon", isa, 64, 3.5, KernelFn::VectorBinary(neon::vector_add)),
        entry("vector_mul_neon", isa, 64, 3.5, KernelFn::VectorBinary(neon::vector_mul)),
        entry("window_apply_neon", isa, 64, 3.5, KernelFn::VectorBinary(neon::vector_mul)),
        entry("vector_scale_neon", isa, 64, 3.5, KernelFn::VectorScale(neon::vector_scale)),
        entry("vector_dot_neon", isa, 64, 3.5, KernelFn::Dot(neon::vector_dot)),
        entry("matmul_neon", isa, 256, 3.5, KernelFn::Matmul(neon::matmul)),
        entry("relu_neon", isa, 64, 3.5, KernelFn::Map(neon::relu)),
        entry("sigmoid_neon", isa, 64, 3.5, KernelFn::Map(neon::sigmoid)),
        entry("tanh_neon", isa, 64, 3.5, KernelFn::Map(neon::tanh_act)),
        entry("gelu_neon", isa, 64, 3.5, KernelFn::Map(neon::gelu)),
        entry("softmax_neon", isa, 64, 2.0, KernelFn::Map(neon::softmax)),
        entry("layer_norm_neon", isa, 64, 3.5, KernelFn::LayerNorm(neon::layer_norm)),
        entry("complex_mul_neon", isa, 64, 3.5, KernelFn::ComplexBinary(neon::complex_mul)),
        entry(
            "complex_magnitude_neon",
            isa,
            64,
            3.5,
            KernelFn::ComplexMagnitude(neon::complex_magnitude),
        ),
        // Mobile specializations: selectable by name only, never by the
        // family query (scores sit below every general kernel).
        entry(
            "vector_add_neon_power_efficient",
            isa,
            0,
            0.5,
            KernelFn::VectorBinary(neon::vector_add_power_efficient),
        ),
        entry(
            "vector_add_neon_thermal_aware",
            isa,
            0,
            0.5,
            KernelFn::VectorBinary(neon::vector_add_thermal_aware),
        ),
        entry(
            "matmul_neon_low_power",
            isa,
            0,
            0.5,
            KernelFn::Matmul(neon::matmul_low_power),
        ),
        entry(
            "matmul_neon_adaptive",
            isa,
            0,
            0.6,
            KernelFn::Matmul(neon::matmul_adaptive),
        ),
    ];
    for e in entries {
        reg.register(e)?;
    }
    Ok(())
}

/// GPU stub backend. Placeholder entries that delegate to the scalar
/// kernels with a vanishingly small score, keeping the backend list and
/// registration order complete without a device runtime.
pub fn register_gpu_stub(reg: &mut KernelRegistry) -> Result<()> {
    let none = IsaSet::default();
    let entries = [
        entry("vector_add_gpu", none, 0, 0.01, KernelFn::VectorBinary(scalar::vector_add)),
        entry("matmul_gpu", none, 0, 0.01, KernelFn::Matmul(scalar::matmul)),
        entry("relu_gpu", none, 0, 0.01, KernelFn::Map(scalar::relu)),
        entry("softmax_gpu", none, 0, 0.01, KernelFn::Map(scalar::softmax)),
    ];
    for e in entries {
        reg.register(e)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use etude_core::HardwareProfile;

    #[test]
    fn test_scalar_backend_registers_once() {
        let mut reg = KernelRegistry::with_isa(IsaSet::default());
        register_scalar(&mut reg).unwrap();
        let count = reg.len();
        // Re-registration updates in place, never grows the table.
        register_scalar(&mut reg).unwrap();
        assert_eq!(reg.len(), count);
    }

    #[test]
    fn test_gpu_stub_never_beats_cpu() {
        let mut reg = KernelRegistry::with_isa(IsaSet::default());
        register_scalar(&mut reg).unwrap();
        register_gpu_stub(&mut reg).unwrap();
        for size in [1usize, 1000, 1 << 20] {
            assert_eq!(reg.select("vector_add", size).unwrap().name, "vector_add_cpu");
        }
        // But an explicit stub query still resolves.
        assert_eq!(reg.select("vector_add_gpu", 100).unwrap().name, "vector_add_gpu");
    }

    #[test]
    fn test_full_init_order_and_dedup() {
        let mut reg = KernelRegistry::new();
        reg.init(HardwareProfile::detect()).unwrap();
        let mut names: Vec<&str> = reg.entries().iter().map(|e| e.name.as_str()).collect();
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total, "duplicate kernel names registered");
        // Scalar always precedes the GPU stub.
        let pos = |n: &str| {
            reg.entries()
                .iter()
                .position(|e| e.name == n)
                .unwrap_or(usize::MAX)
        };
        assert!(pos("vector_add_cpu") < pos("vector_add_gpu"));
    }
}
