use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::shared::pipeline_error::PipelineError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Cpu,
    Accelerator,
}

/// What each worker reserves for its lifetime.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSpec {
    pub device: DeviceKind,
    /// Accelerator ordinals to hand out, one per worker. Empty means `0..concurrency`.
    pub accelerators: Vec<u32>,
    /// Per-worker memory budget for one batch's input tensor. `None` is unbounded.
    pub memory_budget_mb: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Accelerator(u32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Accelerator(ordinal) => write!(f, "accelerator:{ordinal}"),
        }
    }
}

/// A resource unit held by exactly one worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceReservation {
    pub worker_id: usize,
    pub device: Device,
    pub memory_budget_bytes: Option<u64>,
}

impl ResourceSpec {
    pub fn cpu() -> Self {
        Self::default()
    }

    pub fn accelerators(ordinals: Vec<u32>) -> Self {
        Self {
            device: DeviceKind::Accelerator,
            accelerators: ordinals,
            memory_budget_mb: None,
        }
    }

    pub fn with_memory_budget_mb(mut self, mb: u64) -> Self {
        self.memory_budget_mb = Some(mb);
        self
    }

    /// Hands out one reservation per worker.
    ///
    /// Accelerator reservations are exclusive: two workers never share an
    /// ordinal, so there must be at least `concurrency` distinct ordinals.
    pub fn reserve(&self, concurrency: usize) -> Result<Vec<DeviceReservation>, PipelineError> {
        if concurrency == 0 {
            return Err(PipelineError::Config("concurrency must be at least 1".into()));
        }
        let memory_budget_bytes = self.memory_budget_mb.map(|mb| mb.saturating_mul(1024 * 1024));

        let devices: Vec<Device> = match self.device {
            DeviceKind::Cpu => vec![Device::Cpu; concurrency],
            DeviceKind::Accelerator => {
                let ordinals: Vec<u32> = if self.accelerators.is_empty() {
                    (0..concurrency as u32).collect()
                } else {
                    self.accelerators.clone()
                };
                let mut seen = HashSet::new();
                if let Some(dup) = ordinals.iter().find(|o| !seen.insert(**o)) {
                    return Err(PipelineError::Config(format!(
                        "accelerator {dup} is listed more than once"
                    )));
                }
                if ordinals.len() < concurrency {
                    return Err(PipelineError::Config(format!(
                        "concurrency {concurrency} needs {concurrency} accelerators, only {} configured",
                        ordinals.len()
                    )));
                }
                ordinals
                    .into_iter()
                    .take(concurrency)
                    .map(Device::Accelerator)
                    .collect()
            }
        };

        Ok(devices
            .into_iter()
            .enumerate()
            .map(|(worker_id, device)| DeviceReservation {
                worker_id,
                device,
                memory_budget_bytes,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_reservations_one_per_worker() {
        let reservations = ResourceSpec::cpu().reserve(3).unwrap();
        assert_eq!(reservations.len(), 3);
        assert!(reservations.iter().all(|r| r.device == Device::Cpu));
        let ids: Vec<usize> = reservations.iter().map(|r| r.worker_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_accelerators_default_to_leading_ordinals() {
        let reservations = ResourceSpec::accelerators(vec![]).reserve(2).unwrap();
        assert_eq!(reservations[0].device, Device::Accelerator(0));
        assert_eq!(reservations[1].device, Device::Accelerator(1));
    }

    #[test]
    fn test_explicit_accelerators_are_exclusive() {
        let reservations = ResourceSpec::accelerators(vec![3, 1, 2]).reserve(2).unwrap();
        assert_eq!(reservations[0].device, Device::Accelerator(3));
        assert_eq!(reservations[1].device, Device::Accelerator(1));
    }

    #[test]
    fn test_too_few_accelerators_is_config_error() {
        let err = ResourceSpec::accelerators(vec![0]).reserve(2).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_duplicate_accelerator_is_config_error() {
        let err = ResourceSpec::accelerators(vec![0, 0]).reserve(2).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_memory_budget_converted_to_bytes() {
        let reservations = ResourceSpec::cpu().with_memory_budget_mb(2).reserve(1).unwrap();
        assert_eq!(reservations[0].memory_budget_bytes, Some(2 * 1024 * 1024));
    }

    #[test]
    fn test_huge_memory_budget_saturates() {
        let reservations = ResourceSpec::cpu()
            .with_memory_budget_mb(u64::MAX / 2)
            .reserve(1)
            .unwrap();
        assert_eq!(reservations[0].memory_budget_bytes, Some(u64::MAX));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        assert!(ResourceSpec::cpu().reserve(0).is_err());
    }

    #[test]
    fn test_deserialize_lowercase_device() {
        let spec: ResourceSpec =
            serde_json::from_str(r#"{ "device": "accelerator", "accelerators": [1] }"#).unwrap();
        assert_eq!(spec.device, DeviceKind::Accelerator);
        assert_eq!(spec.memory_budget_mb, None);
    }
}
