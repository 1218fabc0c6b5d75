// src/config.rs - Backend selection for the process-wide runtime
use crate::backend::{Backend, SimBackend, SimConfig, UnavailableBackend};
use crate::device::DeviceType;
use crate::error::{AccelError, Result};
use std::str::FromStr;
use std::sync::Arc;

pub const ENV_BACKEND: &str = "ACCEL_BACKEND";
pub const ENV_SIM_DEVICES: &str = "ACCEL_SIM_DEVICES";
pub const ENV_SIM_DEVICE_NAME: &str = "ACCEL_SIM_DEVICE_NAME";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// CUDA when built with the `cuda` feature, otherwise no backend.
    #[default]
    Auto,
    Cuda,
    Sim,
    None,
}

impl FromStr for BackendKind {
    type Err = AccelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(BackendKind::Auto),
            "cuda" => Ok(BackendKind::Cuda),
            "sim" => Ok(BackendKind::Sim),
            "none" | "off" => Ok(BackendKind::None),
            other => Err(AccelError::invalid_argument(format!(
                "unknown backend '{}', expected auto|cuda|sim|none",
                other
            ))),
        }
    }
}

/// Configuration for the runtime behind the crate-level functions.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub backend: BackendKind,
    /// Virtual device count for the sim backend
    pub sim_devices: usize,
    pub sim_device_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let sim = SimConfig::default();
        Self {
            backend: BackendKind::Auto,
            sim_devices: sim.device_count,
            sim_device_name: sim.device_name,
        }
    }
}

impl RuntimeConfig {
    /// Reads `ACCEL_BACKEND`, `ACCEL_SIM_DEVICES` and `ACCEL_SIM_DEVICE_NAME`.
    /// Unparseable values are logged and replaced by defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_BACKEND) {
            match value.parse() {
                Ok(kind) => config.backend = kind,
                Err(e) => log::warn!("ignoring {}: {}", ENV_BACKEND, e),
            }
        }

        if let Some(value) = lookup(ENV_SIM_DEVICES) {
            match value.trim().parse::<usize>() {
                Ok(count) => config.sim_devices = count,
                Err(_) => log::warn!("ignoring {}={:?}: not a device count", ENV_SIM_DEVICES, value),
            }
        }

        if let Some(name) = lookup(ENV_SIM_DEVICE_NAME) {
            if !name.trim().is_empty() {
                config.sim_device_name = name;
            }
        }

        config
    }

    pub fn build_backend(&self) -> Arc<dyn Backend> {
        match self.backend {
            BackendKind::Auto | BackendKind::Cuda => cuda_backend(self.backend),
            BackendKind::Sim => Arc::new(SimBackend::new(SimConfig {
                device_count: self.sim_devices,
                device_name: self.sim_device_name.clone(),
                ..Default::default()
            })),
            BackendKind::None => Arc::new(UnavailableBackend::new(DeviceType::Cuda)),
        }
    }
}

#[cfg(feature = "cuda")]
fn cuda_backend(_kind: BackendKind) -> Arc<dyn Backend> {
    Arc::new(crate::backend::CudaBackend::new())
}

#[cfg(not(feature = "cuda"))]
fn cuda_backend(kind: BackendKind) -> Arc<dyn Backend> {
    if kind == BackendKind::Cuda {
        log::warn!("CUDA backend requested but the `cuda` feature is not enabled");
    }
    Arc::new(UnavailableBackend::new(DeviceType::Cuda))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::from_lookup(|_| None);
        assert_eq!(config.backend, BackendKind::Auto);
        assert_eq!(config.sim_devices, 2);
    }

    #[test]
    fn test_sim_from_env() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (ENV_BACKEND, "SIM"),
            (ENV_SIM_DEVICES, "4"),
            (ENV_SIM_DEVICE_NAME, "Virtual GPU"),
        ]));
        assert_eq!(config.backend, BackendKind::Sim);

        let backend = config.build_backend();
        assert_eq!(backend.device_type(), DeviceType::Sim);
        assert_eq!(backend.device_count(), Ok(4));
        assert_eq!(backend.device_properties(3).unwrap().name, "Virtual GPU");
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (ENV_BACKEND, "quantum"),
            (ENV_SIM_DEVICES, "many"),
        ]));
        assert_eq!(config.backend, BackendKind::Auto);
        assert_eq!(config.sim_devices, 2);
    }

    #[test]
    fn test_none_backend_has_no_devices() {
        let config = RuntimeConfig {
            backend: BackendKind::None,
            ..Default::default()
        };
        let backend = config.build_backend();
        assert!(!backend.is_compiled());
        assert_eq!(backend.device_count(), Ok(0));
    }
}
