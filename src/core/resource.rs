//! Resource allocations and concurrency derivation.

use serde::{Deserialize, Serialize};

/// A vector of host resources, either required by a task or available on the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    /// Logical CPU cores.
    pub cpu_cores: u32,
    /// Memory in megabytes.
    pub memory_mb: u64,
    /// GPU devices.
    pub gpu_count: u32,
    /// Disk space in gigabytes.
    #[serde(default)]
    pub storage_gb: f64,
}

impl ResourceAllocation {
    /// Allocation with the given cpu, memory and gpu and no storage requirement.
    pub const fn new(cpu_cores: u32, memory_mb: u64, gpu_count: u32) -> Self {
        Self {
            cpu_cores,
            memory_mb,
            gpu_count,
            storage_gb: 0.0,
        }
    }

    /// Whether every dimension of `self` is within `available`.
    pub fn fits(&self, available: &Self) -> bool {
        self.cpu_cores <= available.cpu_cores
            && self.memory_mb <= available.memory_mb
            && self.gpu_count <= available.gpu_count
            && self.storage_gb <= available.storage_gb
    }

    /// How many tasks needing `self` can run side by side on `available`.
    ///
    /// Takes the minimum over cpu, memory and (when required) gpu of
    /// `available / required`, floored at 1 so a batch always makes progress.
    /// Dimensions the task does not require are ignored.
    pub fn max_concurrent(&self, available: &Self) -> usize {
        let mut limits: Vec<u64> = Vec::with_capacity(3);
        if self.cpu_cores > 0 {
            limits.push(u64::from(available.cpu_cores / self.cpu_cores));
        }
        if self.memory_mb > 0 {
            limits.push(available.memory_mb / self.memory_mb);
        }
        if self.gpu_count > 0 {
            limits.push(u64::from(available.gpu_count / self.gpu_count));
        }
        let min = limits.into_iter().min().unwrap_or(u64::MAX);
        usize::try_from(min).unwrap_or(usize::MAX).max(1)
    }
}
