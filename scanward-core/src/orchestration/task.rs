//! Per-scanner tasks, their priorities and outcomes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::ids::{JobId, TaskId};

use super::cache::{CacheCategory, CacheKey};

/// Ordering tier used by the scheduler. Lower discriminant runs first.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum PriorityClass {
    /// Runs ahead of everything.
    Critical = 0,
    /// Runs ahead of the default tier.
    High = 1,
    /// Default tier.
    Medium = 2,
    /// Runs when nothing else is queued.
    Low = 3,
}

impl PriorityClass {
    /// Numeric tier; smaller is more urgent.
    pub fn rank(self) -> u8 {
        self as u8
    }

    /// Returns the more urgent of the two classes.
    pub fn elevate(self, other: PriorityClass) -> PriorityClass {
        if other < self { other } else { self }
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PriorityClass::Critical => "critical",
            PriorityClass::High => "high",
            PriorityClass::Medium => "medium",
            PriorityClass::Low => "low",
        };
        f.write_str(label)
    }
}

/// Dominant resource a scanner consumes; selects the worker pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    /// Compute-bound analysis.
    CpuIntensive,
    /// File system heavy.
    IoIntensive,
    /// Large in-memory working set.
    MemoryIntensive,
    /// Talks to remote services.
    NetworkIntensive,
}

impl ResourceType {
    /// Every pool, in a fixed order.
    pub const ALL: [ResourceType; 4] = [
        ResourceType::CpuIntensive,
        ResourceType::IoIntensive,
        ResourceType::MemoryIntensive,
        ResourceType::NetworkIntensive,
    ];
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResourceType::CpuIntensive => "cpu",
            ResourceType::IoIntensive => "io",
            ResourceType::MemoryIntensive => "memory",
            ResourceType::NetworkIntensive => "network",
        };
        f.write_str(label)
    }
}

/// Declared resource need checked during admission.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    /// Cores the task expects to keep busy.
    pub cpu_cores: f64,
    /// Peak resident memory in MiB.
    pub memory_mb: u64,
}

impl ResourceRequirement {
    /// Requirement of `cpu_cores` and `memory_mb`.
    pub fn new(cpu_cores: f64, memory_mb: u64) -> Self {
        Self {
            cpu_cores,
            memory_mb,
        }
    }
}

/// Scanner-specific options. Ordered so cache keys hash deterministically.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanConfig(pub BTreeMap<String, serde_json::Value>);

impl ScanConfig {
    /// Empty option set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces one option.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Looks up one option.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }
}

/// Whether a task may serve a cached result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePolicy {
    /// Serve a valid cached result when one exists.
    PreferCache,
    /// Always run the adapter; the fresh result still replaces the cached one.
    Refresh,
}

/// Lifecycle of a task inside its job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Waiting in the scheduler.
    Queued,
    /// Handed to a worker.
    Running,
    /// Findings recorded.
    Completed,
    /// Settled with a [`TaskFailure`].
    Failed,
}

impl TaskState {
    /// Whether the task will not change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// Why a task failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskFailureKind {
    /// The adapter returned an error.
    Execution,
    /// The adapter exceeded its deadline.
    Timeout,
    /// A task this one depends on failed.
    DependencyFailed,
    /// The execution this task was sharing went away without a result.
    Abandoned,
    /// The scanner's tool is not usable on this host.
    Unavailable,
}

/// Per-task failure, recorded on the task and never raised to the job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Failure category.
    pub kind: TaskFailureKind,
    /// Human-readable detail.
    pub message: String,
}

impl TaskFailure {
    /// Failure of `kind` with `message`.
    pub fn new(kind: TaskFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// How a completed task obtained its findings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultSource {
    /// The adapter ran for this task.
    Fresh,
    /// A valid cache entry was served.
    Cache,
    /// Another task's in-flight execution was joined.
    Shared,
}

/// One (scanner, target) unit of work.
///
/// Immutable once built; the scheduler and worker pools share it behind an
/// `Arc` while the owning job tracks its state in a [`TaskRecord`].
#[derive(Clone, Debug)]
pub struct ScanTask {
    /// Task identifier.
    pub id: TaskId,
    /// Owning job.
    pub job_id: JobId,
    /// Registered scanner name.
    pub scanner: String,
    /// Resolved directory to scan.
    pub target: PathBuf,
    /// Options passed to the adapter.
    pub config: ScanConfig,
    /// Effective priority after inheritance.
    pub priority: PriorityClass,
    /// Pool the task runs in.
    pub resource_type: ResourceType,
    /// Headroom needed for admission.
    pub requirement: ResourceRequirement,
    /// Expected run time.
    pub estimated_duration: Duration,
    /// Tasks that must succeed first.
    pub dependencies: BTreeSet<TaskId>,
    /// Key of the cached result.
    pub cache_key: CacheKey,
    /// Drives the cache TTL.
    pub cache_category: CacheCategory,
    /// Whether a cached result may be served.
    pub cache_policy: CachePolicy,
    /// Adapter deadline.
    pub timeout: Duration,
}

/// A job's view of one of its tasks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Task identifier.
    pub task_id: TaskId,
    /// Registered scanner name.
    pub scanner: String,
    /// Effective priority.
    pub priority: PriorityClass,
    /// Pool the task runs in.
    pub resource_type: ResourceType,
    /// Current state.
    pub state: TaskState,
    /// Whether a cached result could be served.
    pub cache_policy: CachePolicy,
    /// Where the findings came from, once completed.
    pub source: Option<ResultSource>,
    /// Findings recorded.
    pub findings_count: usize,
    /// Execution time, once settled.
    pub duration_ms: Option<u64>,
    /// Failure, when the task failed.
    pub error: Option<TaskFailure>,
}

impl TaskRecord {
    /// Queued record for `task`.
    pub fn from_task(task: &ScanTask) -> Self {
        Self {
            task_id: task.id,
            scanner: task.scanner.clone(),
            priority: task.priority,
            resource_type: task.resource_type,
            state: TaskState::Queued,
            cache_policy: task.cache_policy,
            source: None,
            findings_count: 0,
            duration_ms: None,
            error: None,
        }
    }

    /// Whether the findings were served from the cache.
    pub fn cache_hit(&self) -> bool {
        matches!(self.source, Some(ResultSource::Cache))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elevate_never_demotes() {
        assert_eq!(
            PriorityClass::Low.elevate(PriorityClass::Critical),
            PriorityClass::Critical
        );
        assert_eq!(
            PriorityClass::High.elevate(PriorityClass::Low),
            PriorityClass::High
        );
    }

    #[test]
    fn critical_sorts_first() {
        let mut classes = vec![
            PriorityClass::Low,
            PriorityClass::Critical,
            PriorityClass::Medium,
        ];
        classes.sort();
        assert_eq!(classes[0], PriorityClass::Critical);
    }
}
