//! Top-level job state machine.
//!
//! `start_scan` registers the job and returns; a background preparation step
//! resolves the target, decomposes the request into one task per scanner and
//! hands the tasks to the global scheduler. A single scheduler
//! loop moves admissible tasks onto the worker pools; a result aggregator folds
//! task outcomes back into their jobs. Events and persistence calls always run
//! after the in-memory state change they describe, outside the job lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, ScanError};
use crate::types::ids::{JobId, TaskId};

use super::cache::{CacheRequest, CacheStats, CacheStore, ClaimOutcome};
use super::changes::changed_since;
use super::config::OrchestratorConfig;
use super::context::OrchestrationContext;
use super::events::{EventForwarder, ScanEvent, ScanEventPayload};
use super::finding::Finding;
use super::job::{CancelAck, JobStatus, ProgressSnapshot, ScanJob, ScanRequest, ScannerSelection};
use super::persistence::ScanPersistence;
use super::planner::{IncrementalPlanner, ProjectProfile, ScanPlan};
use super::registry::{ResourceProfile, ScannerRegistry};
use super::resources::ResourceMonitor;
use super::runtime::{PoolSizes, PoolSlot, TaskExecutor, TaskOutcome, WorkerPools};
use super::scheduler::{SchedulerPoll, SchedulerStatus, TaskScheduler};
use super::target::TargetResolver;
use super::task::{
    CachePolicy, PriorityClass, ResultSource, ScanTask, TaskFailure, TaskFailureKind, TaskRecord,
    TaskState,
};

/// Point-in-time counters across the whole engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrchestratorMetrics {
    /// Queue depth and task counters.
    pub scheduler: SchedulerStatus,
    /// Hit, miss and eviction counters.
    pub cache: CacheStats,
    /// Current worker bound per pool.
    pub pool_sizes: PoolSizes,
    /// Workers busy right now per pool.
    pub active_workers: PoolSizes,
    /// Jobs still held in memory, terminal ones included until swept.
    pub jobs: usize,
}

struct JobEntry {
    job: ScanJob,
    status_tx: watch::Sender<JobStatus>,
    /// Tasks handed to a worker whose outcome has not arrived yet.
    in_flight: usize,
    /// Target resolution or decomposition still running.
    preparing: bool,
    released: bool,
}

impl JobEntry {
    fn set_status(&mut self, next: JobStatus) -> bool {
        if !self.job.transition(next) {
            return false;
        }
        self.status_tx.send_replace(next);
        true
    }

    /// The resolved target, once the job is terminal and nothing still runs
    /// against it. Handed out at most once.
    fn take_release(&mut self) -> Option<PathBuf> {
        if self.released || !self.job.status.is_terminal() || self.in_flight > 0 {
            return None;
        }
        let path = self.job.local_path.clone()?;
        self.released = true;
        Some(path)
    }

    /// Terminal, idle and older than `window`.
    fn expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        !self.preparing
            && self.in_flight == 0
            && self.job.status.is_terminal()
            && self
                .job
                .completed_at
                .is_some_and(|at| (now - at).to_std().is_ok_and(|age| age >= window))
    }
}

/// Tasks ready to launch, plus the ones whose tool is missing on this host.
struct Prepared {
    tasks: Vec<Arc<ScanTask>>,
    unavailable: HashSet<String>,
}

/// A task outcome routed into its job.
struct Settled {
    task: Arc<ScanTask>,
    result: ClaimOutcome,
    source: Option<ResultSource>,
    duration: Duration,
    dispatched: bool,
}

/// Side effects of applying one outcome, performed after the job lock is
/// released.
#[derive(Default)]
struct Applied {
    progress: Option<(u8, String, usize, usize)>,
    task_id: Option<TaskId>,
    findings: Vec<Finding>,
    completed: Option<(usize, usize)>,
    release: Option<PathBuf>,
    finished_tasks: Vec<TaskId>,
}

struct Inner {
    config: OrchestratorConfig,
    registry: Arc<ScannerRegistry>,
    monitor: Arc<ResourceMonitor>,
    cache: CacheStore,
    resolver: Arc<dyn TargetResolver>,
    persistence: Arc<dyn ScanPersistence>,
    planner: IncrementalPlanner,
    scheduler: Arc<TaskScheduler>,
    pools: WorkerPools,
    events: EventForwarder,
    jobs: RwLock<HashMap<JobId, Arc<Mutex<JobEntry>>>>,
    shutdown: CancellationToken,
}

/// Entry point of the engine. See the module docs for the moving parts.
pub struct ScanOrchestrator {
    inner: Arc<Inner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    preparing: Mutex<Vec<JoinHandle<()>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    events_shutdown: CancellationToken,
}

impl fmt::Debug for ScanOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let jobs = self
            .inner
            .jobs
            .try_read()
            .map(|jobs| jobs.len())
            .unwrap_or_default();
        f.debug_struct("ScanOrchestrator")
            .field("jobs", &jobs)
            .field("scheduler", &self.inner.scheduler)
            .field("pools", &self.inner.pools)
            .field("cache", &self.inner.cache)
            .field("shutdown", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

impl ScanOrchestrator {
    /// Spawns the scheduler loop, worker pools, result aggregator, event
    /// forwarder and maintenance ticker. Must be called inside a tokio runtime.
    pub fn start(ctx: OrchestrationContext) -> Self {
        let OrchestrationContext {
            config,
            registry,
            monitor,
            cache,
            resolver,
            persistence,
            events,
        } = ctx;

        let shutdown = CancellationToken::new();
        let events_shutdown = CancellationToken::new();
        let (events, forwarder) = EventForwarder::spawn(events, events_shutdown.clone());

        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let executor = TaskExecutor::new(cache.clone(), Arc::clone(&registry));
        let (pools, mut handles) = WorkerPools::spawn(
            executor,
            &monitor,
            &config.workers,
            results_tx,
            shutdown.clone(),
        );
        let scheduler = Arc::new(TaskScheduler::new(
            config.scheduler.clone(),
            Arc::clone(&monitor),
            Arc::clone(&registry),
        ));

        let inner = Arc::new(Inner {
            config,
            registry,
            monitor,
            cache,
            resolver,
            persistence,
            planner: IncrementalPlanner::new(),
            scheduler,
            pools,
            events,
            jobs: RwLock::new(HashMap::new()),
            shutdown,
        });

        handles.push(tokio::spawn(scheduler_loop(Arc::clone(&inner))));
        handles.push(tokio::spawn(aggregate_results(
            Arc::clone(&inner),
            results_rx,
        )));
        handles.push(tokio::spawn(maintenance_loop(Arc::clone(&inner))));

        tracing::info!(pools = ?inner.pools.sizes(), "scan orchestrator started");
        Self {
            inner,
            handles: Mutex::new(handles),
            preparing: Mutex::new(Vec::new()),
            forwarder: Mutex::new(Some(forwarder)),
            events_shutdown,
        }
    }

    /// Accepts a scan and returns its id without waiting for the target.
    ///
    /// The job starts `Pending`; resolution, change detection and
    /// decomposition run in the background. Job-fatal problems (unresolvable
    /// target, unknown bundle, no scanners) move it to `Failed`, observable
    /// through [`get_progress`](Self::get_progress) or
    /// [`wait_for_completion`](Self::wait_for_completion).
    pub async fn start_scan(&self, request: ScanRequest) -> Result<JobId> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ScanError::ShuttingDown);
        }

        let job_id = JobId::new();
        let job = ScanJob::new(job_id, &request);
        log_persistence(job_id, "create_job", self.inner.persistence.create_job(&job).await);

        let (status_tx, _) = watch::channel(JobStatus::Pending);
        self.inner.jobs.write().insert(
            job_id,
            Arc::new(Mutex::new(JobEntry {
                job,
                status_tx,
                in_flight: 0,
                preparing: true,
                released: false,
            })),
        );
        tracing::info!(job = %job_id, target_ref = %request.target_ref, "scan job accepted");

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let shutdown = inner.shutdown.clone();
            tokio::select! {
                _ = shutdown.cancelled() => inner.fail_job(job_id, &ScanError::ShuttingDown).await,
                _ = inner.run_preparation(job_id, request) => {}
            }
        });
        let mut preparing = self.preparing.lock();
        preparing.retain(|handle| !handle.is_finished());
        preparing.push(handle);
        Ok(job_id)
    }

    /// Status, progress and per-task state of a job still held in memory.
    pub fn get_progress(&self, job_id: JobId) -> Result<ProgressSnapshot> {
        let entry = self.inner.entry(job_id)?;
        let snapshot = entry.lock().job.snapshot();
        Ok(snapshot)
    }

    /// Full job including findings and per-task status.
    pub fn job_report(&self, job_id: JobId) -> Result<ScanJob> {
        let entry = self.inner.entry(job_id)?;
        let job = entry.lock().job.clone();
        Ok(job)
    }

    /// Cooperative cancellation. Queued tasks are dropped; running ones are
    /// left to finish and their results discarded.
    pub async fn cancel_scan(&self, job_id: JobId) -> Result<CancelAck> {
        self.inner.cancel(job_id).await
    }

    /// Resolves once the job is terminal.
    pub async fn wait_for_completion(&self, job_id: JobId) -> Result<ScanJob> {
        let entry = self.inner.entry(job_id)?;
        let mut rx = entry.lock().status_tx.subscribe();
        rx.wait_for(|status| status.is_terminal())
            .await
            .map_err(|_| ScanError::ShuttingDown)?;
        let job = entry.lock().job.clone();
        Ok(job)
    }

    /// Engine-wide counters.
    pub fn metrics(&self) -> OrchestratorMetrics {
        OrchestratorMetrics {
            scheduler: self.inner.scheduler.status(),
            cache: self.inner.cache.stats(),
            pool_sizes: self.inner.pools.sizes(),
            active_workers: self.inner.pools.active(),
            jobs: self.inner.jobs.read().len(),
        }
    }

    /// The shared result cache.
    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    /// Registered scanners and their learned estimates.
    pub fn registry(&self) -> &Arc<ScannerRegistry> {
        &self.inner.registry
    }

    /// Stops every background task and flushes pending events.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let preparing = std::mem::take(&mut *self.preparing.lock());
        for handle in preparing {
            if let Err(err) = handle.await
                && err.is_panic()
            {
                tracing::error!(error = %err, "job preparation panicked");
            }
        }
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(err) = handle.await
                && err.is_panic()
            {
                tracing::error!(error = %err, "orchestrator task panicked");
            }
        }

        self.events_shutdown.cancel();
        let forwarder = self.forwarder.lock().take();
        if let Some(forwarder) = forwarder {
            let _ = forwarder.await;
        }
        tracing::info!("scan orchestrator stopped");
    }
}

impl Drop for ScanOrchestrator {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        self.events_shutdown.cancel();
    }
}

impl Inner {
    fn entry(&self, job_id: JobId) -> Result<Arc<Mutex<JobEntry>>> {
        self.jobs
            .read()
            .get(&job_id)
            .cloned()
            .ok_or(ScanError::JobNotFound(job_id))
    }

    fn emit(&self, job_id: JobId, payload: ScanEventPayload) {
        self.events.emit(ScanEvent::new(job_id, payload));
    }

    async fn run_preparation(&self, job_id: JobId, request: ScanRequest) {
        match self.prepare(job_id, &request).await {
            Ok(prepared) => self.launch(job_id, prepared).await,
            Err(err) => self.fail_job(job_id, &err).await,
        }
    }

    async fn prepare(&self, job_id: JobId, request: &ScanRequest) -> Result<Prepared> {
        let target = self
            .resolver
            .resolve(job_id, &request.target_ref)
            .await
            .map_err(|err| match err {
                ScanError::TargetAcquisition { .. } => err,
                other => ScanError::target(&request.target_ref, other.to_string()),
            })?;
        self.entry(job_id)?.lock().job.local_path = Some(target.clone());

        let project = match request.selection {
            ScannerSelection::Auto => {
                let root = target.clone();
                let project = tokio::task::spawn_blocking(move || ProjectProfile::detect(&root))
                    .await
                    .unwrap_or_default();
                tracing::debug!(job = %job_id, ?project, "project detected for automatic selection");
                project
            }
            _ => ProjectProfile::default(),
        };
        let scanners = self.registry.resolve_for(&request.selection, &project)?;
        if scanners.is_empty() {
            return Err(ScanError::NoSchedulableTasks(job_id));
        }

        let changed = self.change_set(job_id, &target, request).await;
        let plan = self.planner.plan(
            &target,
            scanners
                .iter()
                .filter_map(|name| self.registry.relevance(name).map(|r| (name.as_str(), r))),
            &changed,
        );
        let unavailable = self.registry.unavailable(&scanners).await;
        Ok(Prepared {
            tasks: self.decompose(job_id, &target, &scanners, &plan, request),
            unavailable,
        })
    }

    /// Explicit changed files win; otherwise the git diff since
    /// `since_commit`. A failed diff yields an empty set, leaving every
    /// scanner to the checksum-validated cache.
    async fn change_set(&self, job_id: JobId, target: &Path, request: &ScanRequest) -> Vec<PathBuf> {
        let Some(revision) = request.since_commit.as_deref() else {
            return request.changed_files.clone();
        };
        if !request.changed_files.is_empty() {
            return request.changed_files.clone();
        }
        match changed_since(target, revision).await {
            Ok(files) => files,
            Err(err) => {
                tracing::warn!(job = %job_id, revision, error = %err, "change detection failed; relying on cache validation");
                Vec::new()
            }
        }
    }

    /// One task per scanner, returned dependencies-first.
    fn decompose(
        &self,
        job_id: JobId,
        target: &Path,
        scanners: &[String],
        plan: &ScanPlan,
        request: &ScanRequest,
    ) -> Vec<Arc<ScanTask>> {
        let profiles: Vec<ResourceProfile> = scanners
            .iter()
            .map(|name| {
                self.registry
                    .profile(name)
                    .unwrap_or_else(ResourceProfile::fallback)
            })
            .collect();
        let layout = DependencyLayout::new(scanners, &profiles, request.priority_hint);
        let ids: Vec<TaskId> = scanners.iter().map(|_| TaskId::new()).collect();

        layout
            .order
            .iter()
            .map(|&i| {
                let name = &scanners[i];
                let profile = &profiles[i];
                let cache_key = self.cache.key_for(
                    &CacheRequest::new(name, target, &request.config)
                        .category(profile.cache_category),
                );
                let cache_policy = if plan.must_run(name) {
                    CachePolicy::Refresh
                } else {
                    CachePolicy::PreferCache
                };
                Arc::new(ScanTask {
                    id: ids[i],
                    job_id,
                    scanner: name.clone(),
                    target: target.to_path_buf(),
                    config: request.config.clone(),
                    priority: layout.priorities[i],
                    resource_type: profile.resource_type,
                    requirement: profile.requirement(),
                    estimated_duration: profile.estimated_duration,
                    dependencies: layout.deps[i].iter().map(|&d| ids[d]).collect(),
                    cache_key,
                    cache_category: profile.cache_category,
                    cache_policy,
                    timeout: self.config.timeouts.for_scanner(name),
                })
            })
            .collect()
    }

    async fn launch(&self, job_id: JobId, prepared: Prepared) {
        let Ok(entry) = self.entry(job_id) else {
            return;
        };
        let Prepared { tasks, unavailable } = prepared;
        let (started, release) = {
            let mut entry = entry.lock();
            entry.preparing = false;
            if entry.set_status(JobStatus::Running) {
                entry.job.tasks = tasks.iter().map(|t| TaskRecord::from_task(t)).collect();
                entry.job.current_stage = "Scanning".into();
                (true, None)
            } else {
                // Cancelled while the target was being resolved.
                (false, entry.take_release())
            }
        };
        if !started {
            self.release(release).await;
            return;
        }

        let scanners: Vec<String> = tasks.iter().map(|t| t.scanner.clone()).collect();
        tracing::info!(job = %job_id, tasks = tasks.len(), scanners = ?scanners, "scan job running");
        self.emit(
            job_id,
            ScanEventPayload::Started {
                target_ref: entry.lock().job.target_ref.clone(),
                scanners,
                total_tasks: tasks.len(),
            },
        );
        log_persistence(
            job_id,
            "update_job_status",
            self.persistence
                .update_job_status(job_id, JobStatus::Running, None)
                .await,
        );

        // Settled as failed before anything is queued so dependents see it.
        let (missing, runnable): (Vec<_>, Vec<_>) = tasks
            .into_iter()
            .partition(|task| unavailable.contains(&task.scanner));
        for task in &missing {
            self.scheduler.mark_settled(task.id, false);
        }
        for task in runnable {
            self.scheduler.schedule(task);
        }
        // A cancel that raced with scheduling may have missed some tasks.
        if entry.lock().job.status == JobStatus::Cancelled {
            self.scheduler.cancel_job(job_id);
        }
        for task in missing {
            let failure = TaskFailure::new(
                TaskFailureKind::Unavailable,
                format!("{} is not available on this host", task.scanner),
            );
            self.settle(Settled {
                task,
                result: Err(failure),
                source: None,
                duration: Duration::ZERO,
                dispatched: false,
            })
            .await;
        }
    }

    async fn fail_job(&self, job_id: JobId, err: &ScanError) {
        let Ok(entry) = self.entry(job_id) else {
            return;
        };
        let message = err.to_string();
        let (failed, release) = {
            let mut entry = entry.lock();
            entry.preparing = false;
            let failed = entry.job.fail(message.clone());
            if failed {
                entry.status_tx.send_replace(JobStatus::Failed);
            }
            (failed, entry.take_release())
        };
        if failed {
            tracing::warn!(job = %job_id, error = %message, "scan job failed");
            self.emit(
                job_id,
                ScanEventPayload::Failed {
                    error: message.clone(),
                },
            );
            log_persistence(
                job_id,
                "update_job_status",
                self.persistence
                    .update_job_status(job_id, JobStatus::Failed, Some(&message))
                    .await,
            );
        }
        self.release(release).await;
    }

    async fn cancel(&self, job_id: JobId) -> Result<CancelAck> {
        let entry = self.entry(job_id)?;
        let (previous, release, task_ids) = {
            let mut entry = entry.lock();
            let previous = entry.job.status;
            if previous.is_terminal() {
                return Ok(CancelAck::AlreadyTerminal(previous));
            }
            entry.set_status(JobStatus::Cancelled);
            entry.job.current_stage = "Cancelled".into();
            let task_ids: Vec<TaskId> = entry.job.tasks.iter().map(|t| t.task_id).collect();
            (previous, entry.take_release(), task_ids)
        };

        let dropped = self.scheduler.cancel_job(job_id);
        tracing::info!(job = %job_id, previous = %previous, dropped = dropped.len(), "scan job cancelled");
        self.emit(
            job_id,
            ScanEventPayload::Cancelled {
                previous_status: previous,
            },
        );
        log_persistence(
            job_id,
            "update_job_status",
            self.persistence
                .update_job_status(job_id, JobStatus::Cancelled, None)
                .await,
        );
        if release.is_some() {
            self.scheduler.forget(&task_ids);
        }
        self.release(release).await;
        Ok(CancelAck::Cancelled)
    }

    /// Called by the scheduler loop with a pool slot already reserved.
    fn dispatch(&self, task: Arc<ScanTask>, slot: PoolSlot) {
        let accepted = self.entry(task.job_id).is_ok_and(|entry| {
            let mut entry = entry.lock();
            if entry.job.status != JobStatus::Running {
                return false;
            }
            if let Some(record) = entry.job.task_mut(task.id) {
                record.state = TaskState::Running;
            }
            entry.in_flight += 1;
            true
        });
        if !accepted {
            tracing::debug!(task = %task.id, job = %task.job_id, "dropping task of inactive job");
            self.scheduler.mark_settled(task.id, false);
            return;
        }

        tracing::trace!(
            task = %task.id,
            job = %task.job_id,
            scanner = %task.scanner,
            pool = %slot.resource_type(),
            "task dispatched"
        );
        let task_id = task.id;
        let job_id = task.job_id;
        if let Err(err) = self.pools.submit(task, slot) {
            tracing::warn!(task = %task_id, error = %err, "worker pool rejected task");
            self.scheduler.mark_settled(task_id, false);
            if let Ok(entry) = self.entry(job_id) {
                entry.lock().in_flight -= 1;
            }
        }
    }

    async fn settle(&self, settled: Settled) {
        let job_id = settled.task.job_id;
        let Ok(entry) = self.entry(job_id) else {
            return;
        };
        let applied = {
            let mut entry = entry.lock();
            apply_outcome(&mut entry, settled)
        };

        if let Some((progress, stage, finished, total)) = applied.progress {
            self.emit(
                job_id,
                ScanEventPayload::Progress {
                    progress,
                    stage: stage.clone(),
                    finished_tasks: finished,
                    total_tasks: total,
                },
            );
            if let Some(task_id) = applied.task_id {
                for finding in &applied.findings {
                    self.emit(
                        job_id,
                        ScanEventPayload::FindingFound {
                            task_id,
                            finding: finding.clone(),
                        },
                    );
                }
            }
            log_persistence(
                job_id,
                "update_job_progress",
                self.persistence
                    .update_job_progress(job_id, progress, &stage)
                    .await,
            );
        }
        if !applied.findings.is_empty() {
            log_persistence(
                job_id,
                "bulk_insert_findings",
                self.persistence
                    .bulk_insert_findings(job_id, &applied.findings)
                    .await,
            );
        }
        if let Some((findings_count, failed_tasks)) = applied.completed {
            tracing::info!(job = %job_id, findings = findings_count, failed_tasks, "scan job completed");
            self.emit(
                job_id,
                ScanEventPayload::Completed {
                    findings_count,
                    failed_tasks,
                },
            );
            log_persistence(
                job_id,
                "update_job_status",
                self.persistence
                    .update_job_status(job_id, JobStatus::Completed, None)
                    .await,
            );
        }
        if !applied.finished_tasks.is_empty() {
            self.scheduler.forget(&applied.finished_tasks);
        }
        self.release(applied.release).await;
    }

    async fn release(&self, path: Option<PathBuf>) {
        if let Some(path) = path {
            self.resolver.release(&path).await;
        }
    }

    /// Drops terminal jobs past the retention window and expired cache
    /// entries.
    async fn sweep(&self) {
        let window = self.config.retention.completed_job();
        let now = Utc::now();
        let removed = {
            let mut jobs = self.jobs.write();
            let before = jobs.len();
            jobs.retain(|_, entry| !entry.lock().expired(now, window));
            before - jobs.len()
        };
        let evicted = self.cache.sweep_expired().await;
        if removed > 0 || evicted > 0 {
            tracing::debug!(jobs = removed, cache_entries = evicted, "retention sweep");
        }
    }
}

fn apply_outcome(entry: &mut JobEntry, settled: Settled) -> Applied {
    let Settled {
        task,
        result,
        source,
        duration,
        dispatched,
    } = settled;
    if dispatched {
        entry.in_flight = entry.in_flight.saturating_sub(1);
    }

    let mut applied = Applied::default();
    let live = entry.job.status == JobStatus::Running
        && entry
            .job
            .task_mut(task.id)
            .is_some_and(|record| !record.state.is_terminal());
    if !live {
        if entry.job.status == JobStatus::Cancelled {
            tracing::debug!(task = %task.id, job = %task.job_id, "discarding result of cancelled job");
        }
        applied.release = entry.take_release();
        if applied.release.is_some() {
            applied.finished_tasks = entry.job.tasks.iter().map(|t| t.task_id).collect();
        }
        return applied;
    }

    if let Some(record) = entry.job.task_mut(task.id) {
        record.duration_ms = Some(duration.as_millis() as u64);
        match &result {
            Ok(findings) => {
                record.state = TaskState::Completed;
                record.source = source;
                record.findings_count = findings.len();
            }
            Err(failure) => {
                tracing::debug!(task = %task.id, scanner = %task.scanner, error = %failure, "task failed");
                record.state = TaskState::Failed;
                record.error = Some(failure.clone());
            }
        }
    }
    if let Ok(findings) = result {
        entry.job.findings.extend(findings.iter().cloned());
        applied.findings = findings;
        applied.task_id = Some(task.id);
    }

    entry.job.recompute_progress();
    let finished = entry.job.finished_tasks();
    let total = entry.job.tasks.len();
    entry.job.current_stage = format!("Scanning ({finished}/{total} tasks)");

    if entry.job.all_tasks_finished() && entry.set_status(JobStatus::Completed) {
        entry.job.current_stage = "Completed".into();
        applied.completed = Some((entry.job.findings.len(), entry.job.failed_tasks()));
        applied.finished_tasks = entry.job.tasks.iter().map(|t| t.task_id).collect();
    }
    applied.progress = Some((
        entry.job.progress,
        entry.job.current_stage.clone(),
        finished,
        total,
    ));
    applied.release = entry.take_release();
    applied
}

fn log_persistence(job_id: JobId, operation: &'static str, result: Result<()>) {
    if let Err(err) = result {
        tracing::warn!(job = %job_id, operation, error = %err, "persistence call failed");
    }
}

/// Task order, dependency edges and effective priorities for one job.
struct DependencyLayout {
    /// Indices into the scanner list, every dependency before its dependents.
    order: Vec<usize>,
    deps: Vec<Vec<usize>>,
    priorities: Vec<PriorityClass>,
}

impl DependencyLayout {
    fn new(
        scanners: &[String],
        profiles: &[ResourceProfile],
        hint: Option<PriorityClass>,
    ) -> Self {
        let index: HashMap<&str, usize> = scanners
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();
        let mut deps: Vec<Vec<usize>> = profiles
            .iter()
            .enumerate()
            .map(|(i, profile)| {
                let mut deps: Vec<usize> = profile
                    .run_after
                    .iter()
                    .filter_map(|name| index.get(name.as_str()).copied())
                    .filter(|&d| d != i)
                    .collect();
                deps.sort_unstable();
                deps.dedup();
                deps
            })
            .collect();
        let order = topological_order(scanners, &mut deps);

        let mut priorities: Vec<PriorityClass> = profiles
            .iter()
            .map(|p| hint.map_or(p.priority, |h| p.priority.elevate(h)))
            .collect();
        // Dependents first, so elevation flows down whole chains.
        for &i in order.iter().rev() {
            for &d in &deps[i] {
                priorities[d] = priorities[d].elevate(priorities[i]);
            }
        }

        Self {
            order,
            deps,
            priorities,
        }
    }
}

/// Kahn's algorithm. Members of a cycle lose the edges that close it and are
/// appended in input order.
fn topological_order(scanners: &[String], deps: &mut [Vec<usize>]) -> Vec<usize> {
    let n = deps.len();
    let mut remaining: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, ds) in deps.iter().enumerate() {
        for &d in ds {
            dependents[d].push(i);
        }
    }

    let mut ready: VecDeque<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = ready.pop_front() {
        order.push(i);
        for &j in &dependents[i] {
            remaining[j] -= 1;
            if remaining[j] == 0 {
                ready.push_back(j);
            }
        }
    }

    if order.len() < n {
        let mut placed: HashSet<usize> = order.iter().copied().collect();
        for i in 0..n {
            if placed.contains(&i) {
                continue;
            }
            tracing::warn!(scanner = %scanners[i], "dependency cycle; ignoring unresolved run_after edges");
            deps[i].retain(|d| placed.contains(d));
            placed.insert(i);
            order.push(i);
        }
    }
    order
}

async fn scheduler_loop(inner: Arc<Inner>) {
    let idle = Duration::from_millis(inner.config.scheduler.poll_interval_ms.max(1));
    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }
        match inner
            .scheduler
            .poll(|task| inner.pools.try_reserve(task.resource_type))
        {
            SchedulerPoll::Dispatch { task, reservation } => {
                inner.dispatch(task, reservation);
                tokio::task::yield_now().await;
            }
            SchedulerPoll::DependencyFailed { task, dependency } => {
                let failure = TaskFailure::new(
                    TaskFailureKind::DependencyFailed,
                    format!("dependency task {dependency} failed"),
                );
                inner
                    .settle(Settled {
                        task,
                        result: Err(failure),
                        source: None,
                        duration: Duration::ZERO,
                        dispatched: false,
                    })
                    .await;
            }
            SchedulerPoll::Waiting(_) => {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = inner.scheduler.wait_for_work(idle) => {}
                }
            }
        }
    }
    tracing::debug!("scheduler loop stopped");
}

async fn aggregate_results(inner: Arc<Inner>, mut results: mpsc::UnboundedReceiver<TaskOutcome>) {
    loop {
        let outcome = tokio::select! {
            biased;
            maybe = results.recv() => match maybe {
                Some(outcome) => outcome,
                None => break,
            },
            _ = inner.shutdown.cancelled() => break,
        };

        let success = outcome.result.is_ok();
        if outcome.adapter_invoked {
            inner
                .scheduler
                .mark_completed(outcome.task.id, success, outcome.duration);
        } else {
            inner.scheduler.mark_settled(outcome.task.id, success);
        }
        inner
            .settle(Settled {
                task: outcome.task,
                result: outcome.result,
                source: Some(outcome.source),
                duration: outcome.duration,
                dispatched: true,
            })
            .await;
    }
    tracing::debug!("result aggregator stopped");
}

async fn maintenance_loop(inner: Arc<Inner>) {
    let rebalance_every =
        Duration::from_millis(inner.config.scheduler.rebalance_interval_ms.max(1));
    let resize_every = Duration::from_millis(inner.config.workers.resize_interval_ms.max(1));
    let sweep_every = inner.config.retention.sweep_interval().max(Duration::from_millis(1));
    let mut rebalance = tokio::time::interval_at(Instant::now() + rebalance_every, rebalance_every);
    let mut resize = tokio::time::interval_at(Instant::now() + resize_every, resize_every);
    let mut sweep = tokio::time::interval_at(Instant::now() + sweep_every, sweep_every);
    rebalance.set_missed_tick_behavior(MissedTickBehavior::Delay);
    resize.set_missed_tick_behavior(MissedTickBehavior::Delay);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = rebalance.tick() => inner.scheduler.rebalance(),
            _ = resize.tick() => {
                let sizes = inner.pools.resize(&inner.monitor);
                tracing::trace!(?sizes, "worker pools resized");
                inner.scheduler.wake();
            }
            _ = sweep.tick() => inner.sweep().await,
        }
    }
    tracing::debug!("maintenance loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::job::ScannerSelection;
    use crate::orchestration::resources::StaticResourceProbe;
    use crate::orchestration::target::MockTargetResolver;
    use crate::orchestration::task::ResourceType;

    fn profile(priority: PriorityClass, run_after: &[&str]) -> ResourceProfile {
        ResourceProfile::new(ResourceType::CpuIntensive, 1.0, 64, priority)
            .run_after(run_after.iter().copied())
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn dependencies_come_first_and_inherit_urgency() {
        let scanners = names(&["snyk", "dependency"]);
        let profiles = vec![
            profile(PriorityClass::Critical, &["dependency"]),
            profile(PriorityClass::Low, &[]),
        ];
        let layout = DependencyLayout::new(&scanners, &profiles, None);

        assert_eq!(layout.order, vec![1, 0]);
        assert_eq!(layout.deps[0], vec![1]);
        assert_eq!(layout.priorities[1], PriorityClass::Critical);
    }

    #[test]
    fn hint_elevates_but_never_demotes() {
        let scanners = names(&["secret", "trivy"]);
        let profiles = vec![
            profile(PriorityClass::Critical, &[]),
            profile(PriorityClass::Medium, &[]),
        ];
        let layout = DependencyLayout::new(&scanners, &profiles, Some(PriorityClass::High));
        assert_eq!(layout.priorities, vec![PriorityClass::Critical, PriorityClass::High]);
    }

    #[test]
    fn cycles_are_broken_rather_than_deadlocking() {
        let scanners = names(&["a", "b", "c"]);
        let profiles = vec![
            profile(PriorityClass::High, &["b"]),
            profile(PriorityClass::High, &["a"]),
            profile(PriorityClass::High, &["missing"]),
        ];
        let layout = DependencyLayout::new(&scanners, &profiles, None);

        assert_eq!(layout.order.len(), 3);
        assert!(layout.deps[2].is_empty());
        let position = |i: usize| layout.order.iter().position(|&x| x == i).expect("placed");
        for (i, deps) in layout.deps.iter().enumerate() {
            for &d in deps {
                assert!(position(d) < position(i));
            }
        }
    }

    #[tokio::test]
    async fn unresolvable_target_fails_the_job() {
        let mut resolver = MockTargetResolver::new();
        resolver
            .expect_resolve()
            .returning(|_, target| Err(ScanError::target(target, "permission denied")));
        resolver.expect_release().never();

        let ctx = OrchestrationContext::builder(OrchestratorConfig::default())
            .resolver(Arc::new(resolver))
            .resource_probe(Arc::new(StaticResourceProbe::idle(4, 4096)))
            .build()
            .expect("context");
        let orchestrator = ScanOrchestrator::start(ctx);

        let job_id = orchestrator
            .start_scan(ScanRequest::new(
                "/does/not/matter",
                ScannerSelection::bundle("basic"),
            ))
            .await
            .expect("job accepted");
        let job = orchestrator
            .wait_for_completion(job_id)
            .await
            .expect("job exists");

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.tasks.is_empty());
        assert!(
            job
                .error_message
                .as_deref()
                .is_some_and(|m| m.contains("permission denied"))
        );
        orchestrator.shutdown().await;
    }

    fn entry(status: JobStatus) -> JobEntry {
        let request = ScanRequest::new("/srv/app", ScannerSelection::bundle("basic"));
        let mut job = ScanJob::new(JobId::new(), &request);
        job.transition(status);
        let (status_tx, _) = watch::channel(status);
        JobEntry {
            job,
            status_tx,
            in_flight: 0,
            preparing: false,
            released: false,
        }
    }

    #[test]
    fn release_waits_for_a_resolved_path() {
        let mut cancelled = entry(JobStatus::Cancelled);
        assert_eq!(cancelled.take_release(), None);

        cancelled.job.local_path = Some(PathBuf::from("/tmp/scanward/clone"));
        assert_eq!(
            cancelled.take_release(),
            Some(PathBuf::from("/tmp/scanward/clone"))
        );
        assert_eq!(cancelled.take_release(), None);
    }

    #[test]
    fn only_idle_terminal_jobs_expire() {
        let now = Utc::now();
        assert!(entry(JobStatus::Cancelled).expired(now, Duration::ZERO));
        assert!(!entry(JobStatus::Cancelled).expired(now, Duration::from_secs(3_600)));
        assert!(!entry(JobStatus::Pending).expired(now, Duration::ZERO));

        let mut busy = entry(JobStatus::Cancelled);
        busy.in_flight = 1;
        assert!(!busy.expired(now, Duration::ZERO));

        let mut resolving = entry(JobStatus::Cancelled);
        resolving.preparing = true;
        assert!(!resolving.expired(now, Duration::ZERO));
    }

    #[tokio::test]
    async fn unknown_job_is_reported() {
        let ctx = OrchestrationContext::builder(OrchestratorConfig::default())
            .resource_probe(Arc::new(StaticResourceProbe::idle(2, 2048)))
            .build()
            .expect("context");
        let orchestrator = ScanOrchestrator::start(ctx);
        let missing = JobId::new();

        assert!(matches!(
            orchestrator.get_progress(missing),
            Err(ScanError::JobNotFound(id)) if id == missing
        ));
        assert!(matches!(
            orchestrator.cancel_scan(missing).await,
            Err(ScanError::JobNotFound(_))
        ));
        orchestrator.shutdown().await;
    }
}
