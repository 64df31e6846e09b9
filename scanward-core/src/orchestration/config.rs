//! Orchestrator settings with serde defaults.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};

use super::cache::CacheCategory;

/// Global knobs that tune orchestrator behaviour.
///
/// All fields carry defaults so a deployment only needs to spell out the
/// values it wants to change.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Scheduler loop cadence, wait estimation and stall reporting.
    pub scheduler: SchedulerConfig,
    /// Resource sampling and admission thresholds.
    pub resources: ResourceConfig,
    /// Worker pool bounds.
    pub workers: WorkerPoolConfig,
    /// Result cache location, key shape and TTLs.
    pub cache: CacheConfig,
    /// Learning rate for scanner duration/success estimates.
    pub profiles: ProfileConfig,
    /// Per-task deadlines.
    pub timeouts: TimeoutConfig,
    /// In-process event bus sizing.
    pub events: EventConfig,
    /// How long finished jobs stay queryable.
    pub retention: RetentionConfig,
    /// Additional named scanner bundles, merged over the built-in ones.
    pub bundles: HashMap<String, Vec<String>>,
}

impl OrchestratorConfig {
    /// Reject values that would make the scheduler misbehave.
    pub fn validate(&self) -> Result<()> {
        let score = self.resources.min_admission_score;
        if !(0.0..=1.0).contains(&score) {
            return Err(ScanError::InvalidConfig(format!(
                "resources.min_admission_score must be within [0, 1], got {score}"
            )));
        }
        let alpha = self.profiles.ema_alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(ScanError::InvalidConfig(format!(
                "profiles.ema_alpha must be within (0, 1], got {alpha}"
            )));
        }
        if self.scheduler.poll_interval_ms == 0 {
            return Err(ScanError::InvalidConfig(
                "scheduler.poll_interval_ms must be positive".into(),
            ));
        }
        if self.scheduler.rebalance_interval_ms == 0
            || self.workers.resize_interval_ms == 0
            || self.retention.sweep_interval_ms == 0
        {
            return Err(ScanError::InvalidConfig(
                "maintenance intervals must be positive".into(),
            ));
        }
        if self.workers.max_workers_per_pool == 0 {
            return Err(ScanError::InvalidConfig(
                "workers.max_workers_per_pool must be at least 1".into(),
            ));
        }
        if self.cache.path_components == 0 {
            return Err(ScanError::InvalidConfig(
                "cache.path_components must be at least 1".into(),
            ));
        }
        if self.timeouts.default_secs == 0 {
            return Err(ScanError::InvalidConfig(
                "timeouts.default_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Scheduler loop settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on how long the scheduler loop sleeps when nothing is ready (ms).
    pub poll_interval_ms: u64,
    /// Cadence for recomputing queued estimates and re-heapifying (ms).
    pub rebalance_interval_ms: u64,
    /// How long the queue head may stay inadmissible before a stall is reported (ms).
    pub stall_warning_ms: u64,
    /// Fraction of `queue_len * avg_duration` used as the estimated wait.
    pub wait_time_factor: f64,
    /// Multiplier applied to the wait estimate when a task is not admissible at enqueue.
    pub inadmissible_wait_multiplier: f64,
    /// Number of entries behind the head that may be probed when the head is
    /// inadmissible. Zero keeps strict head-of-line ordering.
    pub lookahead: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            rebalance_interval_ms: 10_000,
            stall_warning_ms: 30_000,
            wait_time_factor: 0.5,
            inadmissible_wait_multiplier: 2.0,
            lookahead: 0,
        }
    }
}

/// Host sampling and pool sizing inputs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Snapshot cache lifetime (ms). Samples are never taken more often than this.
    pub sample_interval_ms: u64,
    /// Below this performance score nothing new is admitted.
    pub min_admission_score: f64,
    /// Memory budget assumed per memory-intensive worker (MB).
    pub per_worker_memory_mb: u64,
    /// Share of physical cores handed to CPU-intensive workers.
    pub cpu_worker_fraction: f64,
    /// Upper bound for the I/O pool.
    pub io_worker_cap: usize,
    /// Upper bound for the network pool.
    pub network_worker_cap: usize,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 1_000,
            min_admission_score: 0.3,
            per_worker_memory_mb: 512,
            cpu_worker_fraction: 0.8,
            io_worker_cap: 16,
            network_worker_cap: 8,
        }
    }
}

impl ResourceConfig {
    /// [`Self::sample_interval_ms`] as a duration.
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

/// Worker pool bounds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Hard ceiling for any single pool, regardless of what sizing suggests.
    pub max_workers_per_pool: usize,
    /// Cadence for re-sizing pools from fresh resource snapshots (ms).
    pub resize_interval_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers_per_pool: 16,
            resize_interval_ms: 30_000,
        }
    }
}

/// Result cache settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// On-disk cache directory. `None` keeps entries in memory only.
    pub root: Option<PathBuf>,
    /// Trailing path components of the target folded into cache keys.
    pub path_components: usize,
    /// Lifetime per cache category.
    pub ttl: CacheTtlConfig,
    /// gzip level for stored payloads (0-9).
    pub compression_level: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: None,
            path_components: 3,
            ttl: CacheTtlConfig::default(),
            compression_level: 6,
        }
    }
}

/// Cache entry lifetimes in seconds.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTtlConfig {
    /// Generic scanner results.
    pub scan_results_secs: u64,
    /// Recorded target checksums.
    pub content_checksum_secs: u64,
    /// Dependency-analysis results.
    pub dependency_secs: u64,
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            scan_results_secs: 3_600,
            content_checksum_secs: 86_400,
            dependency_secs: 14_400,
        }
    }
}

impl CacheTtlConfig {
    /// TTL for entries of `category`.
    pub fn for_category(&self, category: CacheCategory) -> Duration {
        let secs = match category {
            CacheCategory::ScanResults => self.scan_results_secs,
            CacheCategory::ContentChecksum => self.content_checksum_secs,
            CacheCategory::DependencyAnalysis => self.dependency_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Estimate learning.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Smoothing factor for the duration and success-rate moving averages.
    pub ema_alpha: f64,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self { ema_alpha: 0.1 }
    }
}

/// Task deadlines.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Deadline for scanners without an override.
    pub default_secs: u64,
    /// Scanner name -> deadline in seconds.
    pub per_scanner: HashMap<String, u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_secs: 600,
            per_scanner: HashMap::new(),
        }
    }
}

impl TimeoutConfig {
    /// Deadline for `scanner`.
    pub fn for_scanner(&self, scanner: &str) -> Duration {
        let secs = self
            .per_scanner
            .get(scanner)
            .copied()
            .unwrap_or(self.default_secs);
        Duration::from_secs(secs)
    }
}

/// Event bus sizing.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Broadcast buffer; slow subscribers lag past this.
    pub bus_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { bus_capacity: 1024 }
    }
}

/// Bounds on how long terminal jobs are kept in memory.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Terminal jobs older than this are dropped from the live table (s).
    /// Their persisted records are untouched.
    pub completed_job_secs: u64,
    /// Cadence of the job and cache sweep (ms).
    pub sweep_interval_ms: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            completed_job_secs: 3_600,
            sweep_interval_ms: 60_000,
        }
    }
}

impl RetentionConfig {
    /// [`Self::completed_job_secs`] as a duration.
    pub fn completed_job(&self) -> Duration {
        Duration::from_secs(self.completed_job_secs)
    }

    /// [`Self::sweep_interval_ms`] as a duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
