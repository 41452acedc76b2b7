//! Host resource sampling and short-horizon forecasting.
//!
//! Snapshots are advisory: nothing is reserved, so two batches sampling the
//! same host may jointly exceed its capacity.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};
use tokio::process::Command;

use crate::config::MonitorConfig;
use crate::core::resource::ResourceAllocation;

/// Direction of recent capacity changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    /// More capacity than before.
    Improving,
    /// Roughly unchanged.
    #[default]
    Stable,
    /// Less capacity than before.
    Degrading,
}

/// Capacity forecast.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceForecast {
    /// Snapshot taken now.
    pub current: ResourceAllocation,
    /// Projection five minutes out.
    pub next_5min: ResourceAllocation,
    /// Projection fifteen minutes out.
    pub next_15min: ResourceAllocation,
    /// Trend across the sample history.
    pub trend: Trend,
}

impl ResourceForecast {
    /// Forecast that echoes the current snapshot.
    pub const fn flat(current: ResourceAllocation, trend: Trend) -> Self {
        Self {
            current,
            next_5min: current,
            next_15min: current,
            trend,
        }
    }
}

/// Source of host capacity snapshots.
#[async_trait]
pub trait ResourceMonitor: Send + Sync {
    /// Capacity available right now.
    async fn get_available_resources(&self) -> ResourceAllocation;

    /// Current snapshot plus projections and trend.
    async fn get_resource_forecast(&self) -> ResourceForecast;
}

/// Bounded snapshot history used for trend detection.
#[derive(Debug)]
pub struct ResourceHistory {
    samples: VecDeque<ResourceAllocation>,
    capacity: usize,
    tolerance: f64,
}

impl ResourceHistory {
    /// History holding at most `capacity` snapshots.
    pub fn new(capacity: usize, tolerance: f64) -> Self {
        let capacity = capacity.max(2);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            tolerance,
        }
    }

    /// Record a snapshot, evicting the oldest when full.
    pub fn record(&mut self, sample: ResourceAllocation) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Number of recorded snapshots.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether nothing was recorded yet.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Compare the oldest and newest snapshots.
    ///
    /// The score is the mean relative change of cpu and memory.
    pub fn trend(&self) -> Trend {
        let (Some(oldest), Some(newest)) = (self.samples.front(), self.samples.back()) else {
            return Trend::Stable;
        };
        let change = (relative_change(f64::from(oldest.cpu_cores), f64::from(newest.cpu_cores))
            + relative_change(u64_to_f64(oldest.memory_mb), u64_to_f64(newest.memory_mb)))
            / 2.0;
        if change > self.tolerance {
            Trend::Improving
        } else if change < -self.tolerance {
            Trend::Degrading
        } else {
            Trend::Stable
        }
    }
}

#[allow(clippy::cast_precision_loss)]
const fn u64_to_f64(v: u64) -> f64 {
    v as f64
}

fn relative_change(old: f64, new: f64) -> f64 {
    if old <= 0.0 {
        if new > 0.0 {
            1.0
        } else {
            0.0
        }
    } else {
        (new - old) / old
    }
}

/// Monitor sampling the local host through `sysinfo` and `nvidia-smi`.
pub struct SystemResourceMonitor {
    system: Mutex<System>,
    history: Mutex<ResourceHistory>,
    config: MonitorConfig,
    disk_root: PathBuf,
}

impl SystemResourceMonitor {
    /// Create a monitor with the given sampling configuration.
    pub fn new(config: MonitorConfig) -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
            history: Mutex::new(ResourceHistory::new(config.history_len, config.trend_tolerance)),
            config,
            disk_root: PathBuf::from("/"),
        }
    }

    /// Measure free space on the disk mounted at `path` instead of `/`.
    #[must_use]
    pub fn with_disk_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.disk_root = path.into();
        self
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    async fn sample_cpu(&self) -> u32 {
        self.system.lock().refresh_cpu();
        tokio::time::sleep(Duration::from_millis(self.config.cpu_sample_ms)).await;
        let mut system = self.system.lock();
        system.refresh_cpu();
        let count = system.cpus().len().max(num_cpus::get()).max(1);
        let usage = f64::from(system.global_cpu_info().cpu_usage()).clamp(0.0, 100.0);
        let available = (count as f64 * (100.0 - usage) / 100.0).floor() as u32;
        available.max(1)
    }

    fn sample_memory_mb(&self) -> u64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.available_memory() / (1024 * 1024)
    }

    #[allow(clippy::cast_precision_loss)]
    fn sample_storage_gb(root: &Path) -> f64 {
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| root.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map_or(0.0, |d| d.available_space() as f64 / 1024.0 / 1024.0 / 1024.0)
    }

    async fn sample_gpus(&self) -> u32 {
        let output = Command::new("nvidia-smi")
            .args(["--query-gpu=utilization.gpu", "--format=csv,noheader,nounits"])
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => count_available_gpus(
                &String::from_utf8_lossy(&out.stdout),
                self.config.gpu_utilization_threshold,
            ),
            Ok(out) => {
                tracing::debug!(status = %out.status, "nvidia-smi exited unsuccessfully, assuming no gpu");
                0
            }
            Err(e) => {
                tracing::debug!(error = %e, "nvidia-smi unavailable, assuming no gpu");
                0
            }
        }
    }
}

/// Count GPUs whose utilization is below `threshold` in `nvidia-smi` csv output.
pub fn count_available_gpus(output: &str, threshold: f64) -> u32 {
    let count = output
        .lines()
        .filter_map(|line| line.trim().parse::<f64>().ok())
        .filter(|u| *u < threshold)
        .count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

#[async_trait]
impl ResourceMonitor for SystemResourceMonitor {
    async fn get_available_resources(&self) -> ResourceAllocation {
        let cpu_cores = self.sample_cpu().await;
        let memory_mb = self.sample_memory_mb();
        let gpu_count = self.sample_gpus().await;
        let storage_gb = Self::sample_storage_gb(&self.disk_root);
        let snapshot = ResourceAllocation {
            cpu_cores,
            memory_mb,
            gpu_count,
            storage_gb,
        };
        tracing::debug!(
            cpu_cores,
            memory_mb,
            gpu_count,
            storage_gb,
            "sampled host resources"
        );
        self.history.lock().record(snapshot);
        snapshot
    }

    async fn get_resource_forecast(&self) -> ResourceForecast {
        let current = self.get_available_resources().await;
        let trend = self.history.lock().trend();
        ResourceForecast::flat(current, trend)
    }
}

/// Monitor returning a settable fixed snapshot.
pub struct StaticResourceMonitor {
    current: Mutex<ResourceAllocation>,
    history: Mutex<ResourceHistory>,
}

impl StaticResourceMonitor {
    /// Monitor that always reports `snapshot`.
    pub fn new(snapshot: ResourceAllocation) -> Self {
        Self {
            current: Mutex::new(snapshot),
            history: Mutex::new(ResourceHistory::new(12, 0.05)),
        }
    }

    /// Replace the reported snapshot.
    pub fn set(&self, snapshot: ResourceAllocation) {
        *self.current.lock() = snapshot;
    }
}

#[async_trait]
impl ResourceMonitor for StaticResourceMonitor {
    async fn get_available_resources(&self) -> ResourceAllocation {
        let snapshot = *self.current.lock();
        self.history.lock().record(snapshot);
        snapshot
    }

    async fn get_resource_forecast(&self) -> ResourceForecast {
        let current = self.get_available_resources().await;
        let trend = self.history.lock().trend();
        ResourceForecast::flat(current, trend)
    }
}
