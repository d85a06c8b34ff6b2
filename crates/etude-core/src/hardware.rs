//! Hardware feature detection
//!
//! Probes the host CPU once and caches the result process-wide. Detection
//! failure is never fatal: the profile degrades to an empty ISA mask and
//! every kernel lookup falls through to the scalar backend.

use std::sync::OnceLock;

use log::debug;

use crate::isa::{IsaFlag, IsaSet};

/// Detected capabilities of the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareProfile {
    /// Vector extensions enabled by both CPU and OS.
    pub isa: IsaSet,

    /// Physical core count.
    pub num_physical_cores: usize,

    /// Logical (SMT) core count.
    pub num_logical_cores: usize,

    /// Cache line size in bytes.
    pub cache_line_size: usize,

    /// Per-core L1 data cache size in bytes.
    pub l1_cache_size: usize,

    /// Per-core L2 cache size in bytes.
    pub l2_cache_size: usize,

    /// Shared L3 cache size in bytes.
    pub l3_cache_size: usize,
}

static PROFILE: OnceLock<HardwareProfile> = OnceLock::new();

impl HardwareProfile {
    /// Returns the cached profile, probing on first call.
    pub fn detect() -> &'static HardwareProfile {
        PROFILE.get_or_init(Self::probe)
    }

    fn probe() -> Self {
        let isa = detect_isa();
        debug!("detected ISA: {}", crate::isa::isa_names(isa));

        // Topology defaults match common desktop parts; exact sizes only
        // steer block-size heuristics, never correctness.
        Self {
            isa,
            num_physical_cores: num_cpus::get_physical(),
            num_logical_cores: num_cpus::get(),
            cache_line_size: 64,
            l1_cache_size: 32 * 1024,
            l2_cache_size: 256 * 1024,
            l3_cache_size: 8 * 1024 * 1024,
        }
    }

    /// A profile with no vector extensions. Scalar kernels only.
    pub fn scalar_only() -> Self {
        Self {
            isa: IsaSet::default(),
            num_physical_cores: 1,
            num_logical_cores: 1,
            cache_line_size: 64,
            l1_cache_size: 32 * 1024,
            l2_cache_size: 256 * 1024,
            l3_cache_size: 4 * 1024 * 1024,
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn detect_isa() -> IsaSet {
    // is_x86_feature_detected! reports a feature only when the OS also
    // saves the register state (XCR0 bits for AVX / AVX-512).
    let mut isa = IsaSet::default();
    if is_x86_feature_detected!("sse") {
        isa |= IsaFlag::Sse;
    }
    if is_x86_feature_detected!("sse2") {
        isa |= IsaFlag::Sse2;
    }
    if is_x86_feature_detected!("sse3") {
        isa |= IsaFlag::Sse3;
    }
    if is_x86_feature_detected!("ssse3") {
        isa |= IsaFlag::Ssse3;
    }
    if is_x86_feature_detected!("sse4.1") {
        isa |= IsaFlag::Sse41;
    }
    if is_x86_feature_detected!("sse4.2") {
        isa |= IsaFlag::Sse42;
    }
    if is_x86_feature_detected!("avx") {
        isa |= IsaFlag::Avx;
    }
    if is_x86_feature_detected!("avx2") {
        isa |= IsaFlag::Avx2;
    }
    if is_x86_feature_detected!("avx512f") {
        isa |= IsaFlag::Avx512f;
    }
    if is_x86_feature_detected!("avx512dq") {
        isa |= IsaFlag::Avx512dq;
    }
    if is_x86_feature_detected!("avx512bw") {
        isa |= IsaFlag::Avx512bw;
    }
    if is_x86_feature_detected!("avx512vl") {
        isa |= IsaFlag::Avx512vl;
    }
    if is_x86_feature_detected!("fma") {
        isa |= IsaFlag::Fma;
    }
    isa
}

#[cfg(target_arch = "aarch64")]
fn detect_isa() -> IsaSet {
    // NEON is architecturally mandatory on AArch64.
    IsaFlag::Neon.into()
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn detect_isa() -> IsaSet {
    IsaSet::default()
}
