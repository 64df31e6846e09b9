//! Scan job orchestration: decomposition, scheduling, execution and caching.
//!
//! The pieces, bottom-up:
//! - [`registry::ScannerRegistry`]: adapters, resource profiles, learned estimates.
//! - [`resources::ResourceMonitor`]: host sampling, admission, pool sizing.
//! - [`cache::CacheStore`]: checksum-validated results with in-flight dedup.
//! - [`planner::IncrementalPlanner`]: which scanners a change set forces to rerun.
//! - [`changes::changed_since`]: change sets read from git history.
//! - [`scheduler::TaskScheduler`]: the global priority queue.
//! - [`orchestrator::ScanOrchestrator`]: the job state machine tying them together.

pub mod cache;
pub mod changes;
pub mod checksum;
pub mod config;
pub mod context;
pub mod events;
pub mod finding;
pub mod job;
pub mod orchestrator;
pub mod persistence;
pub mod planner;
pub mod registry;
pub mod resources;
pub mod runtime;
pub mod scheduler;
pub mod target;
pub mod task;

pub use cache::{CacheCategory, CacheKey, CacheStats, CacheStore};
pub use changes::changed_since;
pub use config::{OrchestratorConfig, RetentionConfig};
pub use context::{OrchestrationContext, OrchestrationContextBuilder};
pub use events::{EventSink, ScanEvent, ScanEventPayload};
pub use finding::{Finding, Location, Severity};
pub use job::{
    CancelAck, JobOutcome, JobStatus, ProgressSnapshot, ScanJob, ScanRequest, ScannerSelection,
};
pub use orchestrator::{OrchestratorMetrics, ScanOrchestrator};
pub use persistence::{InMemoryScanPersistence, ScanPersistence};
pub use planner::{ProjectProfile, Recommendation};
pub use registry::{ResourceProfile, ScannerAdapter, ScannerRegistry, ScannerStats};
pub use resources::{ResourceMonitor, ResourceProbe, StaticResourceProbe, SystemResourceProbe};
pub use runtime::InProcEventBus;
pub use target::{DefaultTargetResolver, GitCloneResolver, LocalPathResolver, TargetResolver};
pub use task::{
    CachePolicy, PriorityClass, ResourceType, ResultSource, ScanConfig, TaskFailure,
    TaskFailureKind, TaskState,
};
