//! Core types for the LibEtude on-device inference runtime
//!
//! This crate holds the pieces every other runtime crate builds on:
//!
//! - a shared error enum with one variant per failure class
//! - the ISA feature bitmask and cached hardware detection
//! - the tensor model (dtype, shape, owned-or-shared storage)
//! - the memory pool that feeds tensor allocations during inference
//! - the quality-mode setpoint handed down by the host engine
//! - an optional resource-monitoring thread
//!
//! Kernel implementations, the operator graph, and the model container
//! live in their own crates on top of these types.

pub mod error;
pub mod hardware;
pub mod isa;
pub mod monitor;
pub mod pool;
pub mod quality;
pub mod tensor;

pub use error::{Error, Result};
pub use hardware::HardwareProfile;
pub use isa::{isa_names, isa_supports, IsaFlag, IsaSet};
pub use monitor::{ResourceMonitor, ResourceSnapshot};
pub use pool::{AlignedBuf, MemoryPool, POOL_ALIGNMENT};
pub use quality::QualityMode;
pub use tensor::{DType, Storage, Tensor};
