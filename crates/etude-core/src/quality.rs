//! Quality-mode setpoint
//!
//! The high-level engine (outside this core) decides a quality mode from
//! its power/thermal policy and hands it down. The core stores and exposes
//! it; kernel selection itself stays score-driven, and external callers use
//! the hint to query specialized kernel families by name.

use serde::{Deserialize, Serialize};

/// Synthesis quality setpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityMode {
    /// Lowest latency; callers may route to power-efficient kernel
    /// variants.
    Fast,
    /// Default trade-off.
    #[default]
    Balanced,
    /// Best output quality; full-rate kernels.
    High,
}

impl QualityMode {
    /// Name suffix of the kernel family a caller in this mode would query,
    /// if it wants something other than the best-scored kernel.
    pub fn kernel_suffix_hint(&self) -> Option<&'static str> {
        match self {
            QualityMode::Fast => Some("power_efficient"),
            QualityMode::Balanced | QualityMode::High => None,
        }
    }
}
