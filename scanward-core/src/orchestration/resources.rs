//! Cached system resource sampling, admission checks and pool sizing.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};

use super::config::ResourceConfig;
use super::task::{ResourceRequirement, ResourceType};

const MB: u64 = 1024 * 1024;

/// Raw numbers read from the host, before derived values are computed.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    /// Fraction of total CPU in use, 0-1.
    pub cpu_utilization: f64,
    /// Physical memory.
    pub memory_total_mb: u64,
    /// Memory the OS reports as available.
    pub memory_available_mb: u64,
    /// Fraction of disk capacity in use, 0-1.
    pub disk_utilization: f64,
    /// Hardware threads.
    pub logical_cores: usize,
    /// Physical cores.
    pub physical_cores: usize,
}

/// Cached view of host headroom used for admission and sizing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Clamped CPU utilization, 0-1.
    pub cpu_utilization: f64,
    /// Used share of memory, 0-1.
    pub memory_utilization: f64,
    /// Clamped disk utilization, 0-1.
    pub disk_utilization: f64,
    /// Idle cores, never below one.
    pub available_cpu_cores: f64,
    /// Available memory.
    pub available_memory_mb: u64,
    /// Hardware threads, at least one.
    pub logical_cores: usize,
    /// Physical cores, at least one.
    pub physical_cores: usize,
    /// Weighted CPU/memory/disk headroom, 0-1.
    pub performance_score: f64,
    /// Sample time.
    pub sampled_at: DateTime<Utc>,
}

impl ResourceSnapshot {
    /// Derives headroom and the performance score.
    pub fn from_raw(raw: RawSample) -> Self {
        let cpu = raw.cpu_utilization.clamp(0.0, 1.0);
        let disk = raw.disk_utilization.clamp(0.0, 1.0);
        let memory = if raw.memory_total_mb == 0 {
            1.0
        } else {
            let used = raw.memory_total_mb.saturating_sub(raw.memory_available_mb);
            (used as f64 / raw.memory_total_mb as f64).clamp(0.0, 1.0)
        };
        let logical = raw.logical_cores.max(1);
        let score = 0.4 * (1.0 - cpu) + 0.4 * (1.0 - memory) + 0.2 * (1.0 - disk);

        Self {
            cpu_utilization: cpu,
            memory_utilization: memory,
            disk_utilization: disk,
            available_cpu_cores: (logical as f64 * (1.0 - cpu)).max(1.0),
            available_memory_mb: raw.memory_available_mb,
            logical_cores: logical,
            physical_cores: raw.physical_cores.max(1),
            performance_score: score.clamp(0.0, 1.0),
            sampled_at: Utc::now(),
        }
    }

    /// True iff the requirement fits current headroom and the host is not
    /// under heavy load.
    pub fn admits(&self, requirement: &ResourceRequirement, min_score: f64) -> bool {
        requirement.cpu_cores <= self.available_cpu_cores
            && requirement.memory_mb <= self.available_memory_mb
            && self.performance_score >= min_score
    }
}

/// Source of raw host samples.
pub trait ResourceProbe: Send + Sync {
    /// Reads the host now.
    fn sample(&self) -> RawSample;
}

/// Probe backed by `sysinfo`.
pub struct SystemResourceProbe {
    system: Mutex<System>,
}

impl fmt::Debug for SystemResourceProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemResourceProbe").finish_non_exhaustive()
    }
}

impl Default for SystemResourceProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemResourceProbe {
    /// Primes CPU counters for the first sample.
    pub fn new() -> Self {
        let mut system = System::new();
        // Prime the CPU counters so the first real sample has a baseline.
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl ResourceProbe for SystemResourceProbe {
    fn sample(&self) -> RawSample {
        let (cpu, total, available) = {
            let mut system = self.system.lock();
            system.refresh_cpu_usage();
            system.refresh_memory();
            (
                f64::from(system.global_cpu_usage()) / 100.0,
                system.total_memory() / MB,
                system.available_memory() / MB,
            )
        };

        let disks = Disks::new_with_refreshed_list();
        let (disk_total, disk_available) = disks
            .list()
            .iter()
            .fold((0u64, 0u64), |(total, avail), disk| {
                (total + disk.total_space(), avail + disk.available_space())
            });
        let disk_utilization = if disk_total == 0 {
            0.0
        } else {
            1.0 - disk_available as f64 / disk_total as f64
        };

        RawSample {
            cpu_utilization: cpu,
            memory_total_mb: total,
            memory_available_mb: available,
            disk_utilization,
            logical_cores: num_cpus::get(),
            physical_cores: num_cpus::get_physical(),
        }
    }
}

/// Fixed, externally adjustable probe. Lets callers and tests drive admission
/// deterministically.
#[derive(Debug)]
pub struct StaticResourceProbe {
    sample: RwLock<RawSample>,
    reads: AtomicUsize,
}

impl StaticResourceProbe {
    /// Reports `sample` until changed.
    pub fn new(sample: RawSample) -> Self {
        Self {
            sample: RwLock::new(sample),
            reads: AtomicUsize::new(0),
        }
    }

    /// A lightly loaded host with the given shape.
    pub fn idle(cores: usize, memory_mb: u64) -> Self {
        Self::new(RawSample {
            cpu_utilization: 0.1,
            memory_total_mb: memory_mb,
            memory_available_mb: memory_mb,
            disk_utilization: 0.2,
            logical_cores: cores,
            physical_cores: cores,
        })
    }

    /// Replaces the reported sample.
    pub fn set(&self, sample: RawSample) {
        *self.sample.write() = sample;
    }

    /// Edits the reported sample in place.
    pub fn update(&self, f: impl FnOnce(&mut RawSample)) {
        f(&mut self.sample.write());
    }

    /// Number of times the monitor actually sampled this probe.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

impl ResourceProbe for StaticResourceProbe {
    fn sample(&self) -> RawSample {
        self.reads.fetch_add(1, Ordering::Relaxed);
        *self.sample.read()
    }
}

struct CachedSnapshot {
    taken_at: Instant,
    snapshot: ResourceSnapshot,
}

/// Serves resource snapshots, refreshing from the probe at most once per
/// sampling interval.
pub struct ResourceMonitor {
    probe: Arc<dyn ResourceProbe>,
    config: ResourceConfig,
    cached: Mutex<Option<CachedSnapshot>>,
}

impl fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cached = self
            .cached
            .try_lock()
            .and_then(|guard| guard.as_ref().map(|c| c.snapshot.performance_score));
        f.debug_struct("ResourceMonitor")
            .field("sample_interval_ms", &self.config.sample_interval_ms)
            .field("min_admission_score", &self.config.min_admission_score)
            .field("cached_score", &cached)
            .finish()
    }
}

impl ResourceMonitor {
    /// Monitor over `probe`; nothing is sampled until first asked.
    pub fn new(probe: Arc<dyn ResourceProbe>, config: ResourceConfig) -> Self {
        Self {
            probe,
            config,
            cached: Mutex::new(None),
        }
    }

    /// Settings in effect.
    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    /// Returns the cached snapshot, sampling the probe only when the cached
    /// one is older than the configured interval.
    pub fn sample(&self) -> ResourceSnapshot {
        let interval = self.config.sample_interval();
        let mut cached = self.cached.lock();
        if let Some(entry) = cached.as_ref()
            && !interval.is_zero()
            && entry.taken_at.elapsed() < interval
        {
            return entry.snapshot.clone();
        }

        let snapshot = ResourceSnapshot::from_raw(self.probe.sample());
        tracing::trace!(
            cpu = snapshot.cpu_utilization,
            memory = snapshot.memory_utilization,
            available_mb = snapshot.available_memory_mb,
            score = snapshot.performance_score,
            "resource snapshot refreshed"
        );
        *cached = Some(CachedSnapshot {
            taken_at: Instant::now(),
            snapshot: snapshot.clone(),
        });
        snapshot
    }

    /// Whether `requirement` fits the current snapshot.
    pub fn can_admit(&self, requirement: &ResourceRequirement) -> bool {
        self.sample()
            .admits(requirement, self.config.min_admission_score)
    }

    /// Score below which nothing is admitted.
    pub fn min_admission_score(&self) -> f64 {
        self.config.min_admission_score
    }

    /// Suggested pool size for `resource_type`.
    pub fn optimal_worker_count(&self, resource_type: ResourceType) -> usize {
        worker_count_for(&self.sample(), &self.config, resource_type)
    }

    /// Snapshot cache lifetime.
    pub fn sample_interval(&self) -> Duration {
        self.config.sample_interval()
    }
}

/// Pool size suggested by a snapshot for one resource type.
pub fn worker_count_for(
    snapshot: &ResourceSnapshot,
    config: &ResourceConfig,
    resource_type: ResourceType,
) -> usize {
    let score = snapshot.performance_score;
    let logical = snapshot.logical_cores.max(1);
    match resource_type {
        ResourceType::CpuIntensive => {
            let base =
                ((snapshot.physical_cores as f64 * config.cpu_worker_fraction) as usize).max(1);
            ((base as f64 * score) as usize).max(1)
        }
        ResourceType::IoIntensive => {
            let base = (logical * 2).min(config.io_worker_cap);
            ((base as f64 * score) as usize).max(2)
        }
        ResourceType::MemoryIntensive => {
            let per_worker = config.per_worker_memory_mb.max(1);
            let by_memory = (snapshot.available_memory_mb / per_worker) as usize;
            by_memory.min(logical).max(1)
        }
        ResourceType::NetworkIntensive => (logical * 2).min(config.network_worker_cap).max(1),
    }
}
