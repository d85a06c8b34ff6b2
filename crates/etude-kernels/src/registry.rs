//! Kernel registry: the table behind runtime backend selection
//!
//! Each entry couples a name, the ISA bits it needs, the input size at
//! which it starts to dominate, a performance score, and a type-tagged
//! function handle. `select` scans the table for substring matches so one
//! family query (`"vector_add"`) spans every backend
//! (`"vector_add_sse"`, `"vector_add_avx"`, ...), scores the compatible
//! candidates, and returns the winner.
//!
//! All mutation (init, register, benchmark) happens once at startup on a
//! single thread; afterwards the registry is read-only and freely shared.

use std::time::Instant;

use etude_core::{isa_supports, Error, HardwareProfile, IsaSet, Result};
use log::{debug, info};

/// Bounded capacity of the kernel table.
pub const MAX_KERNELS: usize = 256;

/// Type-tagged kernel handle, keyed by primitive family. Replaces the
/// reference design's `void*`-and-cast convention with a representation
/// the compiler checks at every call site.
#[derive(Clone, Copy)]
pub enum KernelFn {
    /// `(a, b, out)` elementwise binary op.
    VectorBinary(fn(&[f32], &[f32], &mut [f32])),
    /// `(x, scale, out)`.
    VectorScale(fn(&[f32], f32, &mut [f32])),
    /// `(a, b) -> dot`.
    Dot(fn(&[f32], &[f32]) -> f32),
    /// `(a, b, c, m, k, n)` row-major GEMM.
    Matmul(fn(&[f32], &[f32], &mut [f32], usize, usize, usize)),
    /// `(x, out)` elementwise map (activations, softmax, log-spectrum).
    Map(fn(&[f32], &mut [f32])),
    /// `(x, gamma?, beta?, epsilon, out)`.
    LayerNorm(fn(&[f32], Option<&[f32]>, Option<&[f32]>, f32, &mut [f32])),
    /// `(x, mean, var, gamma?, beta?, epsilon, out)`.
    BatchNorm(
        fn(&[f32], &[f32], &[f32], Option<&[f32]>, Option<&[f32]>, f32, &mut [f32]),
    ),
    /// `(spec, filters, out, n_frames, n_fft, n_mels)`.
    MelFilterbank(fn(&[f32], &[f32], &mut [f32], usize, usize, usize)),
    /// `(ar, ai, br, bi, out_re, out_im)`.
    ComplexBinary(fn(&[f32], &[f32], &[f32], &[f32], &mut [f32], &mut [f32])),
    /// `(re, im, out)`.
    ComplexMagnitude(fn(&[f32], &[f32], &mut [f32])),
    /// `(src_f32, out_bf16)`.
    Bf16FromF32(fn(&[f32], &mut [u16])),
    /// `(src_bf16, out_f32)`.
    Bf16ToF32(fn(&[u16], &mut [f32])),
    /// `(a, b, out)` BF16 elementwise binary op.
    Bf16Binary(fn(&[u16], &[u16], &mut [u16])),
}

/// Family discriminant, used by the self-benchmark and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelFamily {
    VectorBinary,
    VectorScale,
    Dot,
    Matmul,
    Map,
    LayerNorm,
    BatchNorm,
    MelFilterbank,
    ComplexBinary,
    ComplexMagnitude,
    Bf16FromF32,
    Bf16ToF32,
    Bf16Binary,
}

impl KernelFn {
    pub fn family(&self) -> KernelFamily {
        match self {
            KernelFn::VectorBinary(_) => KernelFamily::VectorBinary,
            KernelFn::VectorScale(_) => KernelFamily::VectorScale,
            KernelFn::Dot(_) => KernelFamily::Dot,
            KernelFn::Matmul(_) => KernelFamily::Matmul,
            KernelFn::Map(_) => KernelFamily::Map,
            KernelFn::LayerNorm(_) => KernelFamily::LayerNorm,
            KernelFn::BatchNorm(_) => KernelFamily::BatchNorm,
            KernelFn::MelFilterbank(_) => KernelFamily::MelFilterbank,
            KernelFn::ComplexBinary(_) => KernelFamily::ComplexBinary,
            KernelFn::ComplexMagnitude(_) => KernelFamily::ComplexMagnitude,
            KernelFn::Bf16FromF32(_) => KernelFamily::Bf16FromF32,
            KernelFn::Bf16ToF32(_) => KernelFamily::Bf16ToF32,
            KernelFn::Bf16Binary(_) => KernelFamily::Bf16Binary,
        }
    }
}

impl std::fmt::Debug for KernelFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KernelFn::{:?}", self.family())
    }
}

/// One registered kernel.
#[derive(Debug, Clone)]
pub struct KernelEntry {
    /// Unique symbol, e.g. `"vector_add_avx"`.
    pub name: String,

    /// ISA bits that must all be present for this kernel to be selectable.
    pub required_isa: IsaSet,

    /// Input size at/above which this kernel dominates; 0 = all sizes.
    pub optimal_size: usize,

    /// Positive throughput score; seeded at registration, overwritten by
    /// [`KernelRegistry::benchmark`].
    pub performance_score: f64,

    /// The implementation.
    pub kernel: KernelFn,
}

/// Process-wide kernel table plus the detected ISA mask.
#[derive(Debug)]
pub struct KernelRegistry {
    entries: Vec<KernelEntry>,
    isa: IsaSet,
    initialized: bool,
}

impl KernelRegistry {
    /// An empty, uninitialized registry.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            isa: IsaSet::default(),
            initialized: false,
        }
    }

    /// Empty registry pinned to an explicit ISA mask. Meant for tests and
    /// controlled deployments that register kernels by hand.
    pub fn with_isa(isa: IsaSet) -> Self {
        Self {
            entries: Vec::new(),
            isa,
            initialized: true,
        }
    }

    /// Populates the table for the given hardware: scalar first, then SSE,
    /// AVX, and NEON when the mask allows, then the GPU stub. Calling
    /// `init` on an initialized registry is an idempotent success.
    pub fn init(&mut self, profile: &HardwareProfile) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.isa = profile.isa;

        crate::backends::register_scalar(self)?;

        #[cfg(target_arch = "x86_64")]
        {
            use etude_core::IsaFlag;
            if isa_supports(self.isa, IsaFlag::Sse | IsaFlag::Sse2) {
                crate::backends::register_sse(self)?;
            }
            if isa_supports(self.isa, IsaFlag::Avx.into()) {
                crate::backends::register_avx(self)?;
            }
        }

        #[cfg(target_arch = "aarch64")]
        {
            use etude_core::IsaFlag;
            if isa_supports(self.isa, IsaFlag::Neon.into()) {
                crate::backends::register_neon(self)?;
            }
        }

        crate::backends::register_gpu_stub(self)?;

        self.initialized = true;
        info!(
            "kernel registry initialized: {} kernels, isa {}",
            self.entries.len(),
            etude_core::isa_names(self.isa)
        );
        Ok(())
    }

    /// Inserts a kernel, or updates the existing entry in place when the
    /// name is already registered.
    pub fn register(&mut self, entry: KernelEntry) -> Result<()> {
        if entry.name.is_empty() {
            return Err(Error::invalid_argument("kernel name must be non-empty"));
        }
        if entry.performance_score <= 0.0 {
            return Err(Error::invalid_argument(format!(
                "kernel '{}' has non-positive score {}",
                entry.name, entry.performance_score
            )));
        }
        if let Some(existing) = self.entries.iter_mut().find(|e| e.name == entry.name) {
            *existing = entry;
            return Ok(());
        }
        if self.entries.len() >= MAX_KERNELS {
            return Err(Error::out_of_memory(format!(
                "kernel table full ({MAX_KERNELS} entries)"
            )));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Weight applied to the score for a given input size.
    fn size_factor(data_size: usize, optimal_size: usize) -> f64 {
        if optimal_size == 0 {
            return 1.0;
        }
        if data_size >= optimal_size {
            2.0
        } else if data_size < optimal_size / 4 {
            0.5
        } else {
            1.0
        }
    }

    /// Picks the best ISA-compatible kernel whose name contains
    /// `name_query`, maximizing `performance_score * size_factor`.
    pub fn select(&self, name_query: &str, data_size: usize) -> Result<&KernelEntry> {
        if !self.initialized {
            return Err(Error::NotInitialized("kernel registry"));
        }
        let mut best: Option<(&KernelEntry, f64)> = None;
        for entry in &self.entries {
            if !entry.name.contains(name_query) {
                continue;
            }
            if !isa_supports(self.isa, entry.required_isa) {
                continue;
            }
            let weighted =
                entry.performance_score * Self::size_factor(data_size, entry.optimal_size);
            match best {
                Some((_, best_score)) if best_score >= weighted => {}
                _ => best = Some((entry, weighted)),
            }
        }
        best.map(|(entry, _)| entry).ok_or_else(|| {
            Error::not_found(format!("no compatible kernel matches '{name_query}'"))
        })
    }

    /// Re-measures every ISA-compatible kernel with a fixed-shape
    /// micro-benchmark and overwrites its `performance_score` with
    /// iterations per elapsed second.
    pub fn benchmark(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(Error::NotInitialized("kernel registry"));
        }
        let isa = self.isa;
        for entry in &mut self.entries {
            if !isa_supports(isa, entry.required_isa) {
                continue;
            }
            let score = bench_kernel(&entry.kernel);
            debug!(
                "benchmark {}: {:.0} -> {:.0}",
                entry.name, entry.performance_score, score
            );
            entry.performance_score = score;
        }
        Ok(())
    }

    pub fn entries(&self) -> &[KernelEntry] {
        &self.entries
    }

    pub fn isa(&self) -> IsaSet {
        self.isa
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// Fixed benchmark shapes: vector families run 10 000 elements x 100
// iterations, matrix families 100x100 x 10 iterations.
const VEC_ELEMS: usize = 10_000;
const VEC_ITERS: usize = 100;
const MAT_DIM: usize = 100;
const MAT_ITERS: usize = 10;

fn bench_kernel(kernel: &KernelFn) -> f64 {
    let ramp: Vec<f32> = (0..VEC_ELEMS).map(|i| (i % 97) as f32 * 0.01 + 0.1).collect();
    let ramp_b: Vec<f32> = ramp.iter().map(|v| v * 0.5 + 0.25).collect();
    let mut out = vec![0.0f32; VEC_ELEMS];

    let started = Instant::now();
    let iters = match kernel {
        KernelFn::VectorBinary(f) => {
            for _ in 0..VEC_ITERS {
                f(&ramp, &ramp_b, &mut out);
            }
            VEC_ITERS
        }
        KernelFn::VectorScale(f) => {
            for _ in 0..VEC_ITERS {
                f(&ramp, 1.0001, &mut out);
            }
            VEC_ITERS
        }
        KernelFn::Dot(f) => {
            let mut acc = 0.0f32;
            for _ in 0..VEC_ITERS {
                acc += f(&ramp, &ramp_b);
            }
            std::hint::black_box(acc);
            VEC_ITERS
        }
        KernelFn::Matmul(f) => {
            let a = vec![0.5f32; MAT_DIM * MAT_DIM];
            let b = vec![0.25f32; MAT_DIM * MAT_DIM];
            let mut c = vec![0.0f32; MAT_DIM * MAT_DIM];
            for _ in 0..MAT_ITERS {
                f(&a, &b, &mut c, MAT_DIM, MAT_DIM, MAT_DIM);
            }
            MAT_ITERS
        }
        KernelFn::Map(f) => {
            for _ in 0..VEC_ITERS {
                f(&ramp, &mut out);
            }
            VEC_ITERS
        }
        KernelFn::LayerNorm(f) => {
            for _ in 0..VEC_ITERS {
                f(&ramp, None, None, 1e-5, &mut out);
            }
            VEC_ITERS
        }
        KernelFn::BatchNorm(f) => {
            let mean = vec![0.0f32; 100];
            let var = vec![1.0f32; 100];
            for _ in 0..VEC_ITERS {
                f(&ramp, &mean, &var, None, None, 1e-5, &mut out);
            }
            VEC_ITERS
        }
        KernelFn::MelFilterbank(f) => {
            let spec = vec![0.5f32; MAT_DIM * MAT_DIM];
            let filters = vec![0.25f32; MAT_DIM * MAT_DIM];
            let mut mel = vec![0.0f32; MAT_DIM * MAT_DIM];
            for _ in 0..MAT_ITERS {
                f(&spec, &filters, &mut mel, MAT_DIM, MAT_DIM, MAT_DIM);
            }
            MAT_ITERS
        }
        KernelFn::ComplexBinary(f) => {
            let mut out_im = vec![0.0f32; VEC_ELEMS];
            for _ in 0..VEC_ITERS {
                f(&ramp, &ramp_b, &ramp_b, &ramp, &mut out, &mut out_im);
            }
            VEC_ITERS
        }
        KernelFn::ComplexMagnitude(f) => {
            for _ in 0..VEC_ITERS {
                f(&ramp, &ramp_b, &mut out);
            }
            VEC_ITERS
        }
        KernelFn::Bf16FromF32(f) => {
            let mut h = vec![0u16; VEC_ELEMS];
            for _ in 0..VEC_ITERS {
                f(&ramp, &mut h);
            }
            VEC_ITERS
        }
        KernelFn::Bf16ToF32(f) => {
            let h = vec![0x3F80u16; VEC_ELEMS];
            for _ in 0..VEC_ITERS {
                f(&h, &mut out);
            }
            VEC_ITERS
        }
        KernelFn::Bf16Binary(f) => {
            let a = vec![0x3F80u16; VEC_ELEMS];
            let b = vec![0x4000u16; VEC_ELEMS];
            let mut h = vec![0u16; VEC_ELEMS];
            for _ in 0..VEC_ITERS {
                f(&a, &b, &mut h);
            }
            VEC_ITERS
        }
    };

    let elapsed = started.elapsed().as_secs_f64().max(1e-9);
    iters as f64 / elapsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalar;
    use etude_core::IsaFlag;

    fn entry(name: &str, isa: IsaSet, optimal: usize, score: f64) -> KernelEntry {
        KernelEntry {
            name: name.to_string(),
            required_isa: isa,
            optimal_size: optimal,
            performance_score: score,
            kernel: KernelFn::VectorBinary(scalar::vector_add),
        }
    }

    #[test]
    fn test_select_prefers_higher_score_on_avx_host() {
        // AVX-only host with SSE and AVX candidates at the same
        // optimal size: the AVX entry's higher score must win.
        let mut reg = KernelRegistry::with_isa(IsaFlag::Avx | IsaFlag::Avx2);
        reg.register(entry("vector_add_sse", IsaFlag::Sse.into(), 128, 2.5))
            .unwrap();
        reg.register(entry("vector_add_avx", IsaFlag::Avx.into(), 128, 4.0))
            .unwrap();

        let selected = reg.select("vector_add", 1024).unwrap();
        assert_eq!(selected.name, "vector_add_avx");
    }

    #[test]
    fn test_select_skips_isa_incompatible() {
        // No SIMD at all: only the plain CPU kernel is eligible, and a
        // by-name query for the AVX variant finds nothing compatible.
        let mut reg = KernelRegistry::with_isa(IsaSet::default());
        reg.register(entry("vector_add_cpu", IsaSet::default(), 0, 1.0))
            .unwrap();
        reg.register(entry("vector_add_avx", IsaFlag::Avx.into(), 128, 4.0))
            .unwrap();

        assert_eq!(reg.select("vector_add", 100).unwrap().name, "vector_add_cpu");
        assert!(matches!(
            reg.select("vector_add_avx", 100),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_selected_entry_isa_is_subset_of_process_isa() {
        let masks = [
            IsaSet::default(),
            IsaFlag::Sse | IsaFlag::Sse2,
            IsaFlag::Sse | IsaFlag::Sse2 | IsaFlag::Avx | IsaFlag::Avx2,
            IsaFlag::Neon.into(),
        ];
        for mask in masks {
            let mut reg = KernelRegistry::with_isa(mask);
            reg.register(entry("vector_add_cpu", IsaSet::default(), 0, 1.0))
                .unwrap();
            reg.register(entry("vector_add_sse", IsaFlag::Sse | IsaFlag::Sse2, 64, 2.5))
                .unwrap();
            reg.register(entry("vector_add_avx", IsaFlag::Avx.into(), 128, 4.0))
                .unwrap();
            reg.register(entry("vector_add_neon", IsaFlag::Neon.into(), 64, 3.5))
                .unwrap();

            for size in [1usize, 64, 1024, 1 << 20] {
                let selected = reg.select("vector_add", size).unwrap();
                assert!(
                    etude_core::isa_supports(mask, selected.required_isa),
                    "mask {mask:?} selected {}",
                    selected.name
                );
            }
        }
    }

    #[test]
    fn test_size_factor_boundaries() {
        assert_eq!(KernelRegistry::size_factor(0, 0), 1.0);
        assert_eq!(KernelRegistry::size_factor(1024, 128), 2.0);
        assert_eq!(KernelRegistry::size_factor(128, 128), 2.0);
        assert_eq!(KernelRegistry::size_factor(31, 128), 0.5);
        assert_eq!(KernelRegistry::size_factor(64, 128), 1.0);
    }

    #[test]
    fn test_size_factor_changes_winner() {
        // A small-input specialist (optimal 0) should beat a large-input
        // kernel on tiny sizes despite a lower raw score.
        let mut reg = KernelRegistry::with_isa(IsaSet::default());
        reg.register(entry("relu_cpu", IsaSet::default(), 0, 1.5)).unwrap();
        reg.register(entry("relu_wide", IsaSet::default(), 4096, 2.0))
            .unwrap();

        assert_eq!(reg.select("relu", 16).unwrap().name, "relu_cpu");
        assert_eq!(reg.select("relu", 8192).unwrap().name, "relu_wide");
    }

    #[test]
    fn test_duplicate_name_updates_in_place() {
        let mut reg = KernelRegistry::with_isa(IsaSet::default());
        reg.register(entry("vector_add_cpu", IsaSet::default(), 0, 1.0))
            .unwrap();
        reg.register(entry("vector_add_cpu", IsaSet::default(), 64, 9.0))
            .unwrap();
        assert_eq!(reg.len(), 1);
        let e = reg.select("vector_add", 1).unwrap();
        assert_eq!(e.performance_score, 9.0);
        assert_eq!(e.optimal_size, 64);
    }

    #[test]
    fn test_capacity_overflow() {
        let mut reg = KernelRegistry::with_isa(IsaSet::default());
        for i in 0..MAX_KERNELS {
            reg.register(entry(&format!("k{i}"), IsaSet::default(), 0, 1.0))
                .unwrap();
        }
        let err = reg
            .register(entry("one_too_many", IsaSet::default(), 0, 1.0))
            .unwrap_err();
        assert!(matches!(err, Error::OutOfMemory(_)));
    }

    #[test]
    fn test_uninitialized_select_fails() {
        let reg = KernelRegistry::new();
        assert!(matches!(
            reg.select("vector_add", 1),
            Err(Error::NotInitialized(_))
        ));
    }

    #[test]
    fn test_init_is_idempotent() {
        let profile = HardwareProfile::scalar_only();
        let mut reg = KernelRegistry::new();
        reg.init(&profile).unwrap();
        let count = reg.len();
        reg.init(&profile).unwrap();
        assert_eq!(reg.len(), count);
    }

    #[test]
    fn test_init_registers_scalar_backend() {
        let mut reg = KernelRegistry::new();
        reg.init(&HardwareProfile::scalar_only()).unwrap();
        // Every primitive family has at least its CPU form.
        for query in [
            "vector_add",
            "vector_mul",
            "vector_scale",
            "vector_dot",
            "matmul",
            "relu",
            "sigmoid",
            "tanh",
            "gelu",
            "softmax",
            "layer_norm",
            "batch_norm",
            "window_apply",
            "mel_filterbank",
            "complex_mul",
            "complex_magnitude",
            "log_spectrum",
            "bfloat16_add",
            "bfloat16_mul",
            "bfloat16_from_f32",
            "bfloat16_to_f32",
        ] {
            assert!(reg.select(query, 128).is_ok(), "missing kernel for {query}");
        }
    }

    #[test]
    fn test_benchmark_overwrites_scores() {
        let mut reg = KernelRegistry::new();
        reg.init(&HardwareProfile::scalar_only()).unwrap();
        let before: Vec<f64> = reg.entries().iter().map(|e| e.performance_score).collect();
        reg.benchmark().unwrap();
        let after: Vec<f64> = reg.entries().iter().map(|e| e.performance_score).collect();
        assert_eq!(before.len(), after.len());
        // Measured throughput is far larger than the seed scores.
        assert!(after.iter().all(|&s| s > 0.0));
        assert!(after.iter().sum::<f64>() > before.iter().sum::<f64>());
    }

    #[test]
    fn test_mobile_variants_not_selected_by_family_query() {
        // Mobile specializations register with low scores under longer
        // names; the family query must keep resolving to the plain kernel.
        let mut reg = KernelRegistry::with_isa(IsaFlag::Neon.into());
        reg.register(entry("vector_add_neon", IsaFlag::Neon.into(), 64, 3.5))
            .unwrap();
        reg.register(entry(
            "vector_add_neon_power_efficient",
            IsaFlag::Neon.into(),
            0,
            0.5,
        ))
        .unwrap();

        assert_eq!(reg.select("vector_add", 4096).unwrap().name, "vector_add_neon");
        assert_eq!(
            reg.select("power_efficient", 4096).unwrap().name,
            "vector_add_neon_power_efficient"
        );
    }
}
