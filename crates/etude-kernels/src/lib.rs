//! SIMD kernels, registry, and dispatch for the LibEtude runtime
//!
//! Layout mirrors the backend split:
//!
//! - [`scalar`]: portable reference implementations of every primitive
//! - [`sse`] / [`avx`]: x86-64 4-wide and 8-wide variants
//! - [`neon`]: AArch64 variants plus the mobile specializations
//! - [`bf16`]: bfloat16 conversion and convert-compute-convert ops
//! - [`registry`]: the kernel table and runtime selection
//! - [`backends`]: per-backend registration called from `init`
//! - [`dispatch`]: the `*_optimal` façade everything else calls
//!
//! The registry is populated once at startup (scalar, then SSE/AVX/NEON
//! as the detected ISA mask allows, then the GPU stub) and read-only
//! afterwards.

pub mod backends;
pub mod bf16;
pub mod dispatch;
pub mod registry;
pub mod scalar;

#[cfg(target_arch = "x86_64")]
pub mod avx;
#[cfg(target_arch = "aarch64")]
pub mod neon;
#[cfg(target_arch = "x86_64")]
pub mod sse;

pub use registry::{KernelEntry, KernelFamily, KernelFn, KernelRegistry, MAX_KERNELS};
