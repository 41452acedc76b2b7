//! Scheduler configuration structures.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::resource::ResourceAllocation;
use crate::core::task::TaskType;

/// Resource requirement and timeout for one task type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskProfile {
    /// Resources a single task of this type consumes.
    pub requirements: ResourceAllocation,
    /// Maximum wait for a terminal state, in milliseconds.
    pub timeout_ms: u64,
}

impl TaskProfile {
    const fn new(cpu_cores: u32, memory_mb: u64, gpu_count: u32, timeout_secs: u64) -> Self {
        Self {
            requirements: ResourceAllocation::new(cpu_cores, memory_mb, gpu_count),
            timeout_ms: timeout_secs * 1000,
        }
    }

    /// Timeout as a [`Duration`].
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Profiles for every task type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskProfiles {
    /// Content generation.
    pub content: TaskProfile,
    /// Speech synthesis.
    pub tts: TaskProfile,
    /// Standard render.
    pub video: TaskProfile,
    /// Advanced render.
    pub advanced_video: TaskProfile,
    /// GPU render.
    pub ultra_video: TaskProfile,
}

impl Default for TaskProfiles {
    fn default() -> Self {
        Self {
            content: TaskProfile::new(1, 512, 0, 300),
            tts: TaskProfile::new(1, 1024, 0, 300),
            video: TaskProfile::new(2, 2048, 0, 900),
            advanced_video: TaskProfile::new(4, 4096, 0, 1800),
            ultra_video: TaskProfile::new(4, 8192, 1, 3600),
        }
    }
}

impl TaskProfiles {
    /// Profile for a task type.
    pub const fn get(&self, task_type: TaskType) -> &TaskProfile {
        match task_type {
            TaskType::Content => &self.content,
            TaskType::Tts => &self.tts,
            TaskType::Video => &self.video,
            TaskType::AdvancedVideo => &self.advanced_video,
            TaskType::UltraVideo => &self.ultra_video,
        }
    }

    /// Mutable profile for a task type.
    pub fn get_mut(&mut self, task_type: TaskType) -> &mut TaskProfile {
        match task_type {
            TaskType::Content => &mut self.content,
            TaskType::Tts => &mut self.tts,
            TaskType::Video => &mut self.video,
            TaskType::AdvancedVideo => &mut self.advanced_video,
            TaskType::UltraVideo => &mut self.ultra_video,
        }
    }
}

/// Host sampling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// GPUs below this utilization percentage count as available.
    pub gpu_utilization_threshold: f64,
    /// CPU usage sampling window in milliseconds.
    pub cpu_sample_ms: u64,
    /// Snapshots kept for trend detection.
    pub history_len: usize,
    /// Relative change between oldest and newest snapshot that counts as a trend.
    pub trend_tolerance: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            gpu_utilization_threshold: 80.0,
            cpu_sample_ms: 250,
            history_len: 12,
            trend_tolerance: 0.05,
        }
    }
}

/// Batch store backend selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreBackendConfig {
    /// Process-local maps.
    #[default]
    InMemory,
    /// JSON lines journal on disk.
    File {
        /// Journal file.
        path: PathBuf,
    },
}

/// Root scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on project ids per batch.
    pub max_projects_per_batch: usize,
    /// Parallel limit used when settings carry no override.
    pub default_parallel_limit: u32,
    /// Batches the dispatcher runs concurrently.
    pub max_parallel_batches: usize,
    /// Lifetime of batch records, refreshed on every write.
    pub batch_ttl_secs: u64,
    /// Recovery chain length limit.
    pub max_recovery_attempts: u32,
    /// Task handle polling interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Capacity of the event buffer.
    pub event_buffer: usize,
    /// Per task type requirements and timeouts.
    pub tasks: TaskProfiles,
    /// Host sampling.
    pub monitor: MonitorConfig,
    /// Store backend.
    pub store: StoreBackendConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_projects_per_batch: 50,
            default_parallel_limit: 3,
            max_parallel_batches: 5,
            batch_ttl_secs: 86_400,
            max_recovery_attempts: 3,
            poll_interval_ms: 500,
            event_buffer: 1024,
            tasks: TaskProfiles::default(),
            monitor: MonitorConfig::default(),
            store: StoreBackendConfig::InMemory,
        }
    }
}

impl SchedulerConfig {
    /// Record lifetime as a [`Duration`].
    pub const fn batch_ttl(&self) -> Duration {
        Duration::from_secs(self.batch_ttl_secs)
    }

    /// Polling interval as a [`Duration`].
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_projects_per_batch == 0 {
            return Err("max_projects_per_batch must be greater than 0".into());
        }
        if self.default_parallel_limit == 0 {
            return Err("default_parallel_limit must be greater than 0".into());
        }
        if self.max_parallel_batches == 0 {
            return Err("max_parallel_batches must be greater than 0".into());
        }
        if self.batch_ttl_secs == 0 {
            return Err("batch_ttl_secs must be greater than 0".into());
        }
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than 0".into());
        }
        if self.event_buffer == 0 {
            return Err("event_buffer must be greater than 0".into());
        }
        if !(0.0..=100.0).contains(&self.monitor.gpu_utilization_threshold) {
            return Err("gpu_utilization_threshold must be within 0..=100".into());
        }
        if self.monitor.history_len < 2 {
            return Err("monitor.history_len must be at least 2".into());
        }
        for task_type in TaskType::ALL {
            if self.tasks.get(task_type).timeout_ms == 0 {
                return Err(format!("task `{task_type}` timeout_ms must be greater than 0"));
            }
        }
        Ok(())
    }

    /// Parse scheduler configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `BATCH_*` environment variables, after loading `.env`.
    pub fn from_env() -> Result<Self, String> {
        // A missing .env file is fine.
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();
        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), String> {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, String> {
            raw.trim()
                .parse()
                .map_err(|_| format!("{key}: cannot parse `{raw}`"))
        }

        if let Some(v) = lookup("BATCH_MAX_PROJECTS") {
            self.max_projects_per_batch = parse("BATCH_MAX_PROJECTS", &v)?;
        }
        if let Some(v) = lookup("BATCH_PARALLEL_LIMIT") {
            self.default_parallel_limit = parse("BATCH_PARALLEL_LIMIT", &v)?;
        }
        if let Some(v) = lookup("BATCH_MAX_PARALLEL_BATCHES") {
            self.max_parallel_batches = parse("BATCH_MAX_PARALLEL_BATCHES", &v)?;
        }
        if let Some(v) = lookup("BATCH_TTL_SECS") {
            self.batch_ttl_secs = parse("BATCH_TTL_SECS", &v)?;
        }
        if let Some(v) = lookup("BATCH_MAX_RECOVERY_ATTEMPTS") {
            self.max_recovery_attempts = parse("BATCH_MAX_RECOVERY_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("BATCH_POLL_INTERVAL_MS") {
            self.poll_interval_ms = parse("BATCH_POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("BATCH_GPU_THRESHOLD") {
            self.monitor.gpu_utilization_threshold = parse("BATCH_GPU_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("BATCH_STORE_PATH") {
            if !v.trim().is_empty() {
                self.store = StoreBackendConfig::File {
                    path: PathBuf::from(v.trim()),
                };
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = SchedulerConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.tasks.get(TaskType::UltraVideo).requirements.gpu_count, 1);
        assert_eq!(cfg.tasks.get(TaskType::AdvancedVideo).timeout(), Duration::from_secs(1800));
    }

    #[test]
    fn test_from_json_partial_document() {
        let cfg = SchedulerConfig::from_json_str(
            r#"{ "default_parallel_limit": 4, "store": { "kind": "file", "path": "/tmp/batches.jsonl" } }"#,
        )
        .unwrap();
        assert_eq!(cfg.default_parallel_limit, 4);
        assert_eq!(cfg.max_projects_per_batch, 50);
        assert_eq!(
            cfg.store,
            StoreBackendConfig::File {
                path: PathBuf::from("/tmp/batches.jsonl")
            }
        );
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let err = SchedulerConfig::from_json_str(r#"{ "max_parallel_batches": 0 }"#).unwrap_err();
        assert!(err.contains("max_parallel_batches"));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("BATCH_PARALLEL_LIMIT", "7"),
            ("BATCH_TTL_SECS", "60"),
            ("BATCH_STORE_PATH", "/var/lib/batches.jsonl"),
        ]
        .into_iter()
        .collect();
        let mut cfg = SchedulerConfig::default();
        cfg.apply_env(|k| vars.get(k).map(ToString::to_string)).unwrap();
        assert_eq!(cfg.default_parallel_limit, 7);
        assert_eq!(cfg.batch_ttl_secs, 60);
        assert!(matches!(cfg.store, StoreBackendConfig::File { .. }));
    }

    #[test]
    fn test_env_rejects_garbage() {
        let mut cfg = SchedulerConfig::default();
        let err = cfg
            .apply_env(|k| (k == "BATCH_MAX_PROJECTS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.contains("BATCH_MAX_PROJECTS"));
    }
}
