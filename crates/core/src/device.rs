//! Device kinds and execution-provider names.
//!
//! The compute runtime binds each pipeline stage to an execution provider
//! (`"cuda"`, `"metal"`, ...). Managed tensors live on the batch's primary
//! device; this module maps between the two vocabularies.

use std::fmt;

use candle_core::{Device, DeviceLocation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Cpu,
    Cuda,
    Metal,
}

impl DeviceKind {
    /// Kind of an allocated candle device.
    pub fn of(device: &Device) -> Self {
        match device.location() {
            DeviceLocation::Cpu => Self::Cpu,
            DeviceLocation::Cuda { .. } => Self::Cuda,
            DeviceLocation::Metal { .. } => Self::Metal,
        }
    }

    /// Map a provider name from session options to a device kind.
    ///
    /// Providers that do not own an accelerator memory space (or that this
    /// engine does not know) resolve to CPU.
    pub fn from_provider(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "cuda" => Self::Cuda,
            "metal" => Self::Metal,
            _ => Self::Cpu,
        }
    }

    /// Provider name a stage must list to accept tensors of this kind.
    pub fn provider_name(self) -> Option<&'static str> {
        match self {
            Self::Cpu => None,
            Self::Cuda => Some("cuda"),
            Self::Metal => Some("metal"),
        }
    }

    pub fn is_cpu(self) -> bool {
        self == Self::Cpu
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::Metal => "metal",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_device_maps_to_cpu_kind() {
        assert_eq!(DeviceKind::of(&Device::Cpu), DeviceKind::Cpu);
    }

    #[test]
    fn provider_names_round_trip() {
        for kind in [DeviceKind::Cuda, DeviceKind::Metal] {
            let name = kind.provider_name().unwrap();
            assert_eq!(DeviceKind::from_provider(name), kind);
        }
        assert_eq!(DeviceKind::Cpu.provider_name(), None);
    }

    #[test]
    fn unknown_provider_is_cpu() {
        assert_eq!(DeviceKind::from_provider("qnn"), DeviceKind::Cpu);
        assert_eq!(DeviceKind::from_provider("CUDA"), DeviceKind::Cuda);
    }

    #[test]
    fn display_is_lowercase() {
        assert_eq!(DeviceKind::Cuda.to_string(), "cuda");
    }
}
