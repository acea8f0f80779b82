//! # Device Selection
//!
//! Picks the compute device for the local Whisper engine. GPU backends are
//! only used when candle was built with them and a device actually opens;
//! otherwise everything falls back to the CPU.

use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

static DETECTED_DEVICE: OnceLock<Device> = OnceLock::new();

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(format!("Unknown device preference: {}", s)),
        }
    }
}

impl DevicePreference {
    /// Open the preferred device, falling back to the CPU when it is unavailable.
    pub fn resolve(self) -> Device {
        match self {
            DevicePreference::Auto => detected_device(),
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda => open_cuda().unwrap_or_else(|| {
                warn!("CUDA requested but unavailable, using CPU");
                Device::Cpu
            }),
            DevicePreference::Metal => open_metal().unwrap_or_else(|| {
                warn!("Metal requested but unavailable, using CPU");
                Device::Cpu
            }),
        }
    }
}

/// Best device on this host, detected once per process.
fn detected_device() -> Device {
    DETECTED_DEVICE
        .get_or_init(|| {
            if let Some(device) = open_cuda() {
                info!("Selected CUDA GPU for local recognition");
                return device;
            }
            if let Some(device) = open_metal() {
                info!("Selected Metal GPU for local recognition");
                return device;
            }
            info!("Using CPU for local recognition");
            Device::Cpu
        })
        .clone()
}

fn open_cuda() -> Option<Device> {
    Device::new_cuda(0)
        .map_err(|e| debug!("CUDA not available: {}", e))
        .ok()
}

fn open_metal() -> Option<Device> {
    Device::new_metal(0)
        .map_err(|e| debug!("Metal not available: {}", e))
        .ok()
}

pub fn describe(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_preference_parsing() {
        assert_eq!("auto".parse::<DevicePreference>().unwrap(), DevicePreference::Auto);
        assert_eq!("CPU".parse::<DevicePreference>().unwrap(), DevicePreference::Cpu);
        assert_eq!("gpu".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert_eq!("metal".parse::<DevicePreference>().unwrap(), DevicePreference::Metal);
        assert!("tpu".parse::<DevicePreference>().is_err());
    }

    #[test]
    fn test_cpu_preference_is_always_cpu() {
        let device = DevicePreference::Cpu.resolve();
        assert!(matches!(device, Device::Cpu));
        assert_eq!(describe(&device), "cpu");
    }

    #[test]
    fn test_auto_detection_resolves() {
        let device = DevicePreference::Auto.resolve();
        assert!(!describe(&device).is_empty());
    }
}
