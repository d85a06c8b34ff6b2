//! Runtime context
//!
//! One value owns everything that used to be process-global in older
//! renditions of this engine: the detected hardware profile, the kernel
//! registry, the operator registry, and the quality setpoint. Every graph
//! API takes `&Runtime` explicitly; nothing here is a singleton.

use etude_core::{HardwareProfile, QualityMode, Result};
use etude_kernels::KernelRegistry;
use log::debug;

use crate::ops::OperatorRegistry;

/// Explicit runtime context for building and executing graphs.
pub struct Runtime {
    profile: &'static HardwareProfile,
    pub kernels: KernelRegistry,
    pub operators: OperatorRegistry,
    quality: QualityMode,
}

impl Runtime {
    /// Detects hardware, initializes the kernel registry (scalar + every
    /// backend the ISA mask allows + GPU stub), and registers all
    /// operators. Seed scores are kept; call [`Runtime::with_benchmark`]
    /// to replace them with measured throughput.
    pub fn new() -> Result<Self> {
        let profile = HardwareProfile::detect();
        let mut kernels = KernelRegistry::new();
        kernels.init(profile)?;

        let mut operators = OperatorRegistry::new();
        operators.register_all()?;

        debug!(
            "runtime ready: {} kernels, {} operators",
            kernels.len(),
            operators.len()
        );
        Ok(Self {
            profile,
            kernels,
            operators,
            quality: QualityMode::default(),
        })
    }

    /// Like [`Runtime::new`], then runs the registry self-benchmark so
    /// selection uses measured scores.
    pub fn with_benchmark() -> Result<Self> {
        let mut runtime = Self::new()?;
        runtime.kernels.benchmark()?;
        Ok(runtime)
    }

    pub fn profile(&self) -> &HardwareProfile {
        self.profile
    }

    /// Quality setpoint handed down by the host engine. Stored and
    /// exposed; kernel selection itself stays score-driven.
    pub fn quality(&self) -> QualityMode {
        self.quality
    }

    pub fn set_quality(&mut self, quality: QualityMode) {
        self.quality = quality;
    }
}
