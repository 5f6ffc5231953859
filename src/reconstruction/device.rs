//! Compute device discovery and selection.
//!
//! Ranking, best first:
//! 1. A GPU whose name matches an entry of the preference list (earlier
//!    entries win)
//! 2. Integrated GPU
//! 3. Discrete GPU
//! 4. Any other GPU
//! 5. A CPU adapter exposed by the graphics stack
//! 6. The built-in CPU kernels, if fallback is allowed
//!
//! With nothing left, selection fails with [`OctError::NoComputeDevice`]
//! before the pipeline starts.

use serde::Serialize;
use tracing::info;

use super::cpu::CpuBackend;
use super::gpu::GpuBackend;
use super::ComputeBackend;
use crate::config::{BackendChoice, ReconstructionConfig};
use crate::data::FrameShape;
use crate::error::{AppResult, OctError};

/// Adapter kind, in ranking order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceClass {
    /// GPU sharing memory with the host.
    IntegratedGpu,
    /// Dedicated GPU.
    DiscreteGpu,
    /// Virtual or unknown GPU.
    OtherGpu,
    /// Software rasterizer exposed as an adapter.
    Cpu,
}

impl From<wgpu::DeviceType> for DeviceClass {
    fn from(ty: wgpu::DeviceType) -> Self {
        match ty {
            wgpu::DeviceType::IntegratedGpu => Self::IntegratedGpu,
            wgpu::DeviceType::DiscreteGpu => Self::DiscreteGpu,
            wgpu::DeviceType::Cpu => Self::Cpu,
            wgpu::DeviceType::VirtualGpu | wgpu::DeviceType::Other => Self::OtherGpu,
        }
    }
}

/// What selection knows about one adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterCandidate {
    /// Adapter name reported by the driver.
    pub name: String,
    /// Graphics API backing the adapter.
    pub backend: String,
    /// Adapter kind.
    pub class: DeviceClass,
}

impl AdapterCandidate {
    fn from_adapter(adapter: &wgpu::Adapter) -> Self {
        let info = adapter.get_info();
        Self {
            name: info.name,
            backend: format!("{:?}", info.backend),
            class: info.device_type.into(),
        }
    }
}

/// Result of ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceChoice {
    /// Index into the candidate list.
    Adapter(usize),
    /// No adapter; run the built-in CPU kernels.
    BuiltinCpu,
}

fn rank(candidate: &AdapterCandidate, preferences: &[String]) -> (u8, usize) {
    if candidate.class != DeviceClass::Cpu {
        let name = candidate.name.to_lowercase();
        if let Some(pos) = preferences
            .iter()
            .position(|p| !p.is_empty() && name.contains(&p.to_lowercase()))
        {
            return (0, pos);
        }
    }
    let tier = match candidate.class {
        DeviceClass::IntegratedGpu => 1,
        DeviceClass::DiscreteGpu => 2,
        DeviceClass::OtherGpu => 3,
        DeviceClass::Cpu => 4,
    };
    (tier, 0)
}

/// Pick the best candidate. Ties keep enumeration order.
pub fn choose_device(
    candidates: &[AdapterCandidate],
    preferences: &[String],
    allow_cpu_fallback: bool,
) -> AppResult<DeviceChoice> {
    if let Some((index, _)) = candidates
        .iter()
        .enumerate()
        .min_by_key(|(i, c)| (rank(c, preferences), *i))
    {
        return Ok(DeviceChoice::Adapter(index));
    }
    if allow_cpu_fallback {
        return Ok(DeviceChoice::BuiltinCpu);
    }
    Err(OctError::NoComputeDevice {
        checked: candidates.len(),
    })
}

/// Every adapter the graphics stack reports.
#[must_use]
pub fn enumerate_adapters() -> Vec<(wgpu::Adapter, AdapterCandidate)> {
    let instance = wgpu::Instance::default();
    instance
        .enumerate_adapters(wgpu::Backends::all())
        .into_iter()
        .map(|adapter| {
            let candidate = AdapterCandidate::from_adapter(&adapter);
            (adapter, candidate)
        })
        .collect()
}

/// Candidate list plus the choice that would be made, for `rust_oct devices`.
pub fn describe_devices(
    config: &ReconstructionConfig,
) -> (Vec<AdapterCandidate>, AppResult<DeviceChoice>) {
    let candidates: Vec<_> = enumerate_adapters().into_iter().map(|(_, c)| c).collect();
    let choice = match config.backend {
        BackendChoice::Cpu => Ok(DeviceChoice::BuiltinCpu),
        BackendChoice::Gpu => choose_device(&candidates, &config.compute_preference, false),
        BackendChoice::Auto => choose_device(
            &candidates,
            &config.compute_preference,
            config.allow_cpu_fallback,
        ),
    };
    (candidates, choice)
}

/// Build the compute backend the configuration asks for.
///
/// Runs on the thread that starts the pipeline so that device and kernel
/// build failures surface before any imaging begins.
pub fn create_backend(
    config: &ReconstructionConfig,
    shape: FrameShape,
) -> AppResult<Box<dyn ComputeBackend>> {
    let allow_cpu = match config.backend {
        BackendChoice::Cpu => {
            info!("Using CPU reconstruction backend");
            return Ok(Box::new(CpuBackend::new(shape)));
        }
        BackendChoice::Gpu => false,
        BackendChoice::Auto => config.allow_cpu_fallback,
    };

    let mut adapters = enumerate_adapters();
    let candidates: Vec<_> = adapters.iter().map(|(_, c)| c.clone()).collect();
    match choose_device(&candidates, &config.compute_preference, allow_cpu)? {
        DeviceChoice::Adapter(index) => {
            let (adapter, candidate) = adapters.swap_remove(index);
            info!(
                adapter = %candidate.name,
                backend = %candidate.backend,
                class = ?candidate.class,
                "Selected compute device"
            );
            Ok(Box::new(GpuBackend::new(adapter, shape)?))
        }
        DeviceChoice::BuiltinCpu => {
            info!(checked = candidates.len(), "No compute adapter, using CPU kernels");
            Ok(Box::new(CpuBackend::new(shape)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, class: DeviceClass) -> AdapterCandidate {
        AdapterCandidate {
            name: name.into(),
            backend: "Vulkan".into(),
            class,
        }
    }

    fn prefs() -> Vec<String> {
        vec!["intel".into(), "amd".into()]
    }

    #[test]
    fn test_preference_match_wins() {
        let list = [
            candidate("NVIDIA GeForce", DeviceClass::IntegratedGpu),
            candidate("AMD Radeon", DeviceClass::DiscreteGpu),
        ];
        assert_eq!(
            choose_device(&list, &prefs(), true).unwrap(),
            DeviceChoice::Adapter(1)
        );
    }

    #[test]
    fn test_earlier_preference_beats_later() {
        let list = [
            candidate("AMD Radeon", DeviceClass::DiscreteGpu),
            candidate("Intel(R) Iris Xe", DeviceClass::IntegratedGpu),
        ];
        assert_eq!(
            choose_device(&list, &prefs(), true).unwrap(),
            DeviceChoice::Adapter(1)
        );
    }

    #[test]
    fn test_integrated_preferred_over_discrete() {
        let list = [
            candidate("Vendor X", DeviceClass::DiscreteGpu),
            candidate("Vendor Y", DeviceClass::IntegratedGpu),
        ];
        assert_eq!(
            choose_device(&list, &[], true).unwrap(),
            DeviceChoice::Adapter(1)
        );
    }

    #[test]
    fn test_cpu_adapter_used_when_no_gpu() {
        let list = [candidate("llvmpipe (intel-ish)", DeviceClass::Cpu)];
        assert_eq!(
            choose_device(&list, &prefs(), false).unwrap(),
            DeviceChoice::Adapter(0)
        );
    }

    #[test]
    fn test_cpu_adapter_never_matches_preferences() {
        let list = [
            candidate("llvmpipe intel", DeviceClass::Cpu),
            candidate("Vendor Z", DeviceClass::OtherGpu),
        ];
        assert_eq!(
            choose_device(&list, &prefs(), false).unwrap(),
            DeviceChoice::Adapter(1)
        );
    }

    #[test]
    fn test_builtin_fallback_or_fatal() {
        assert_eq!(
            choose_device(&[], &prefs(), true).unwrap(),
            DeviceChoice::BuiltinCpu
        );
        let err = choose_device(&[], &prefs(), false).unwrap_err();
        assert!(matches!(err, OctError::NoComputeDevice { checked: 0 }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_cpu_choice_skips_enumeration() {
        let config = ReconstructionConfig {
            backend: BackendChoice::Cpu,
            ..ReconstructionConfig::default()
        };
        let shape = FrameShape {
            lines: 4,
            depth: 4,
            sector_size: 8,
        };
        let backend = create_backend(&config, shape).unwrap();
        assert_eq!(backend.name(), "cpu");
    }
}
