//! Property tests for kernel contracts and registry selection

use etude_core::{isa_supports, HardwareProfile, IsaFlag, IsaSet};
use etude_kernels::dispatch;
use etude_kernels::registry::{KernelEntry, KernelFn, KernelRegistry};
use etude_kernels::scalar;
use proptest::prelude::*;

fn initialized() -> KernelRegistry {
    let mut reg = KernelRegistry::new();
    reg.init(HardwareProfile::detect()).unwrap();
    reg
}

fn add_entry(name: &str, isa: IsaSet, optimal: usize, score: f64) -> KernelEntry {
    KernelEntry {
        name: name.to_string(),
        required_isa: isa,
        optimal_size: optimal,
        performance_score: score,
        kernel: KernelFn::VectorBinary(scalar::vector_add),
    }
}

proptest! {
    #[test]
    fn softmax_always_sums_to_one(
        xs in prop::collection::vec(-50.0f32..50.0, 1..2000)
    ) {
        let reg = initialized();
        let mut out = vec![0.0; xs.len()];
        dispatch::softmax_optimal(&reg, &xs, &mut out).unwrap();
        let sum: f32 = out.iter().sum();
        prop_assert!((sum - 1.0).abs() <= 1e-5, "sum = {}", sum);
        prop_assert!(out.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn vector_add_matches_scalar_everywhere(
        xs in prop::collection::vec(-1e3f32..1e3, 1..600)
    ) {
        let reg = initialized();
        let ys: Vec<f32> = xs.iter().map(|v| v * 0.5 - 1.0).collect();
        let mut got = vec![0.0; xs.len()];
        let mut want = vec![0.0; xs.len()];
        dispatch::vector_add_optimal(&reg, &xs, &ys, &mut got).unwrap();
        scalar::vector_add(&xs, &ys, &mut want);
        prop_assert_eq!(got, want);
    }

    #[test]
    fn selected_kernel_isa_is_subset_of_mask(
        mask_bits in 0u32..(1 << 14),
        size in 0usize..100_000
    ) {
        let mask = IsaSet::new_truncated(mask_bits);
        let mut reg = KernelRegistry::with_isa(mask);
        reg.register(add_entry("vector_add_cpu", IsaSet::default(), 0, 1.0)).unwrap();
        reg.register(add_entry("vector_add_sse", IsaFlag::Sse | IsaFlag::Sse2, 64, 2.5)).unwrap();
        reg.register(add_entry("vector_add_avx", IsaFlag::Avx | IsaFlag::Avx2, 128, 4.0)).unwrap();
        reg.register(add_entry("vector_add_neon", IsaFlag::Neon.into(), 64, 3.5)).unwrap();

        let selected = reg.select("vector_add", size).unwrap();
        prop_assert!(
            isa_supports(mask, selected.required_isa),
            "mask {:?} selected {}", mask, selected.name
        );
    }

    #[test]
    fn gemm_matches_scalar_on_random_shapes(
        m in 1usize..8,
        k in 1usize..8,
        n in 1usize..12,
        seed in 0u64..1000
    ) {
        let reg = initialized();
        let gen = |count: usize, salt: u64| -> Vec<f32> {
            (0..count)
                .map(|i| (((i as u64 + 1) * (seed + salt + 1)) % 17) as f32 - 8.0)
                .collect()
        };
        let a = gen(m * k, 0);
        let b = gen(k * n, 7);
        let mut got = vec![0.0; m * n];
        let mut want = vec![0.0; m * n];
        dispatch::matmul_optimal(&reg, &a, &b, &mut got, m, k, n).unwrap();
        scalar::matmul(&a, &b, &mut want, m, k, n);
        for (g, w) in got.iter().zip(&want) {
            prop_assert!((g - w).abs() <= 1e-3, "{} vs {}", g, w);
        }
    }
}
