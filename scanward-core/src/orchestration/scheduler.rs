//! Global priority queue with head-of-line admission control.
//!
//! Tasks from every job share one min-heap ordered by
//! `(priority class, estimated completion, arrival)`. Only the head is
//! considered for dispatch (plus an optional bounded look-ahead): when it
//! cannot run, nothing behind it runs either.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::types::ids::{JobId, TaskId};

use super::config::SchedulerConfig;
use super::registry::ScannerRegistry;
use super::resources::{ResourceMonitor, ResourceSnapshot};
use super::task::{PriorityClass, ResourceType, ScanTask};

struct QueueEntry {
    priority: PriorityClass,
    estimated_completion: Instant,
    seq: u64,
    task: Arc<ScanTask>,
}

impl QueueEntry {
    fn key(&self) -> (PriorityClass, Instant, u64) {
        (self.priority, self.estimated_completion, self.seq)
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // Reversed: BinaryHeap is a max-heap and the smallest key must surface.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

/// Why nothing was dispatched this cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitReason {
    /// Nothing is queued.
    Empty,
    /// Head task has dependencies that have not finished.
    DependenciesPending { task_id: TaskId },
    /// Head task does not fit current headroom.
    ResourceExhausted { task_id: TaskId },
    /// Head task's worker pool has no free slot.
    PoolSaturated {
        task_id: TaskId,
        resource_type: ResourceType,
    },
}

/// Result of one [`TaskScheduler::poll`] cycle.
#[derive(Debug)]
pub enum SchedulerPoll<R> {
    /// Admitted task and the headroom reserved for it.
    Dispatch {
        task: Arc<ScanTask>,
        reservation: R,
    },
    /// The task was removed because a dependency failed; it will never run.
    DependencyFailed {
        task: Arc<ScanTask>,
        dependency: TaskId,
    },
    /// Nothing could be dispatched.
    Waiting(WaitReason),
}

/// Estimates handed back when a task is queued.
#[derive(Clone, Copy, Debug)]
pub struct ScheduleTicket {
    /// Queued task.
    pub task_id: TaskId,
    /// Expected time before dispatch.
    pub estimated_wait: Duration,
    /// Expected finish time.
    pub estimated_completion: Instant,
}

/// Lifetime counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Tasks queued.
    pub scheduled: u64,
    /// Tasks handed to a pool.
    pub dispatched: u64,
    /// Tasks that settled successfully.
    pub completed: u64,
    /// Tasks that settled with a failure.
    pub failed: u64,
    /// Tasks dropped because a dependency failed.
    pub dependency_failures: u64,
    /// Tasks removed by job cancellation.
    pub cancelled: u64,
    /// Cycles where a runnable task waited on headroom.
    pub stalls: u64,
    /// Queue re-orderings.
    pub rebalances: u64,
}

/// Point-in-time view of the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    /// Tasks waiting for dispatch.
    pub queued: usize,
    /// Tasks dispatched and not yet settled.
    pub running: usize,
    /// Lifetime counters.
    pub stats: SchedulerStats,
}

struct RunningTask {
    task: Arc<ScanTask>,
    started: Instant,
}

struct BlockedHead {
    task_id: TaskId,
    since: Instant,
    reported: bool,
}

#[derive(Default)]
struct SchedulerState {
    queue: BinaryHeap<QueueEntry>,
    /// Estimated completion of every queued task, for dependency ordering.
    queued_completion: HashMap<TaskId, Instant>,
    queued_secs: f64,
    running: HashMap<TaskId, RunningTask>,
    /// Terminal tasks and whether they succeeded.
    finished: HashMap<TaskId, bool>,
    next_seq: u64,
    blocked_head: Option<BlockedHead>,
    stats: SchedulerStats,
}

enum Verdict {
    Ready,
    Blocked(WaitReason),
    DependencyFailed(TaskId),
}

impl SchedulerState {
    /// `len * avg_duration * factor`, where `len` counts queued tasks.
    fn base_wait_secs(&self, len: usize, config: &SchedulerConfig) -> f64 {
        if len == 0 {
            return 0.0;
        }
        let avg = self.queued_secs / len as f64;
        len as f64 * avg * config.wait_time_factor
    }

    fn earliest_start(&self, task: &ScanTask, floor: Instant) -> Instant {
        task.dependencies.iter().fold(floor, |start, dep| {
            let dep_done = self.queued_completion.get(dep).copied().or_else(|| {
                self.running
                    .get(dep)
                    .map(|r| r.started + r.task.estimated_duration)
            });
            dep_done.map_or(start, |done| start.max(done))
        })
    }

    fn evaluate(&self, task: &ScanTask, snapshot: &ResourceSnapshot, min_score: f64) -> Verdict {
        for dep in &task.dependencies {
            match self.finished.get(dep) {
                Some(true) => {}
                Some(false) => return Verdict::DependencyFailed(*dep),
                None => {
                    return Verdict::Blocked(WaitReason::DependenciesPending { task_id: task.id });
                }
            }
        }
        if !snapshot.admits(&task.requirement, min_score) {
            return Verdict::Blocked(WaitReason::ResourceExhausted { task_id: task.id });
        }
        Verdict::Ready
    }

    fn dequeued(&mut self, task: &ScanTask) {
        self.queued_completion.remove(&task.id);
        self.queued_secs = (self.queued_secs - task.estimated_duration.as_secs_f64()).max(0.0);
    }
}

/// Shared, lock-protected priority queue of ready-to-run tasks.
pub struct TaskScheduler {
    state: Mutex<SchedulerState>,
    monitor: Arc<ResourceMonitor>,
    registry: Arc<ScannerRegistry>,
    config: SchedulerConfig,
    wakeup: Notify,
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("TaskScheduler");
        if let Some(state) = self.state.try_lock() {
            dbg.field("queued", &state.queue.len())
                .field("running", &state.running.len())
                .field("stats", &state.stats);
        }
        dbg.field("lookahead", &self.config.lookahead).finish()
    }
}

impl TaskScheduler {
    /// Scheduler admitting against `monitor` with estimates from `registry`.
    pub fn new(
        config: SchedulerConfig,
        monitor: Arc<ResourceMonitor>,
        registry: Arc<ScannerRegistry>,
    ) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            monitor,
            registry,
            config,
            wakeup: Notify::new(),
        }
    }

    /// Queues a task with an estimated completion time derived from current
    /// queue depth. Dependencies must be scheduled before their dependents.
    pub fn schedule(&self, task: Arc<ScanTask>) -> ScheduleTicket {
        let admissible = self.monitor.can_admit(&task.requirement);
        let ticket = {
            let mut state = self.state.lock();
            let mut wait_secs = state.base_wait_secs(state.queue.len(), &self.config);
            if !admissible {
                wait_secs *= self.config.inadmissible_wait_multiplier;
            }
            let now = Instant::now();
            let estimated_wait = Duration::from_secs_f64(wait_secs.max(0.0));
            let start = state.earliest_start(&task, now + estimated_wait);
            let estimated_completion = start + task.estimated_duration;

            let seq = state.next_seq;
            state.next_seq += 1;
            state.queued_secs += task.estimated_duration.as_secs_f64();
            state.queued_completion.insert(task.id, estimated_completion);
            state.stats.scheduled += 1;
            state.queue.push(QueueEntry {
                priority: task.priority,
                estimated_completion,
                seq,
                task: task.clone(),
            });
            ScheduleTicket {
                task_id: task.id,
                estimated_wait,
                estimated_completion,
            }
        };
        tracing::trace!(
            task = %task.id,
            job = %task.job_id,
            scanner = %task.scanner,
            priority = %task.priority,
            wait_ms = ticket.estimated_wait.as_millis() as u64,
            admissible,
            "task scheduled"
        );
        self.wakeup.notify_one();
        ticket
    }

    /// Tries to hand out the next task.
    ///
    /// `reserve` is asked for a worker slot once the head task is
    /// dependency-satisfied and admissible; returning `None` leaves the task
    /// queued.
    pub fn poll<R>(&self, mut reserve: impl FnMut(&ScanTask) -> Option<R>) -> SchedulerPoll<R> {
        let snapshot = self.monitor.sample();
        let min_score = self.monitor.min_admission_score();
        let lookahead = self.config.lookahead;

        let mut state = self.state.lock();
        let mut skipped = Vec::new();
        let mut head_reason = None;
        let mut outcome = None;

        for probe in 0..=lookahead {
            let Some(entry) = state.queue.pop() else {
                break;
            };
            let reason = match state.evaluate(&entry.task, &snapshot, min_score) {
                Verdict::DependencyFailed(dependency) => {
                    state.dequeued(&entry.task);
                    state.finished.insert(entry.task.id, false);
                    state.stats.dependency_failures += 1;
                    outcome = Some(SchedulerPoll::DependencyFailed {
                        task: entry.task,
                        dependency,
                    });
                    break;
                }
                Verdict::Ready => match reserve(entry.task.as_ref()) {
                    Some(reservation) => {
                        state.dequeued(&entry.task);
                        state.running.insert(
                            entry.task.id,
                            RunningTask {
                                task: entry.task.clone(),
                                started: Instant::now(),
                            },
                        );
                        state.stats.dispatched += 1;
                        outcome = Some(SchedulerPoll::Dispatch {
                            task: entry.task,
                            reservation,
                        });
                        break;
                    }
                    None => WaitReason::PoolSaturated {
                        task_id: entry.task.id,
                        resource_type: entry.task.resource_type,
                    },
                },
                Verdict::Blocked(reason) => reason,
            };
            if probe == 0 {
                head_reason = Some(reason);
            }
            skipped.push(entry);
        }

        for entry in skipped {
            state.queue.push(entry);
        }

        match outcome {
            Some(poll) => {
                if matches!(poll, SchedulerPoll::Dispatch { .. }) && head_reason.is_none() {
                    state.blocked_head = None;
                }
                poll
            }
            None => {
                let reason = head_reason.unwrap_or(WaitReason::Empty);
                self.track_stall(&mut state, reason);
                SchedulerPoll::Waiting(reason)
            }
        }
    }

    fn track_stall(&self, state: &mut SchedulerState, reason: WaitReason) {
        let WaitReason::ResourceExhausted { task_id } = reason else {
            state.blocked_head = None;
            return;
        };
        let threshold = Duration::from_millis(self.config.stall_warning_ms);
        match state.blocked_head.as_mut() {
            Some(blocked) if blocked.task_id == task_id => {
                if !blocked.reported && blocked.since.elapsed() >= threshold {
                    blocked.reported = true;
                    state.stats.stalls += 1;
                    tracing::warn!(
                        task = %task_id,
                        blocked_ms = blocked.since.elapsed().as_millis() as u64,
                        queued = state.queue.len(),
                        stalls = state.stats.stalls,
                        "scheduler stalled: queue head remains inadmissible"
                    );
                }
            }
            _ => {
                state.blocked_head = Some(BlockedHead {
                    task_id,
                    since: Instant::now(),
                    reported: false,
                });
            }
        }
    }

    /// Records an executed task and feeds its scanner's moving averages.
    pub fn mark_completed(&self, task_id: TaskId, success: bool, duration: Duration) {
        let scanner = self.finish(task_id, success);
        if let Some(scanner) = scanner {
            self.registry.record_outcome(&scanner, duration, success);
        }
        self.wakeup.notify_one();
    }

    /// Records a task that finished without running its adapter (served
    /// from cache, shared, or discarded). Estimates are left untouched.
    pub fn mark_settled(&self, task_id: TaskId, success: bool) {
        self.finish(task_id, success);
        self.wakeup.notify_one();
    }

    fn finish(&self, task_id: TaskId, success: bool) -> Option<String> {
        let mut state = self.state.lock();
        let running = state.running.remove(&task_id);
        state.finished.insert(task_id, success);
        if success {
            state.stats.completed += 1;
        } else {
            state.stats.failed += 1;
        }
        running.map(|r| r.task.scanner.clone())
    }

    /// Drops every queued task of `job_id`. Returns the removed task ids.
    pub fn cancel_job(&self, job_id: JobId) -> Vec<TaskId> {
        let mut state = self.state.lock();
        let entries = std::mem::take(&mut state.queue).into_vec();
        let (removed, kept): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|e| e.task.job_id == job_id);
        state.queue = BinaryHeap::from(kept);
        for entry in &removed {
            state.dequeued(&entry.task);
        }
        state.stats.cancelled += removed.len() as u64;
        removed.into_iter().map(|e| e.task.id).collect()
    }

    /// Forgets terminal bookkeeping for tasks nobody can depend on anymore.
    pub fn forget(&self, task_ids: &[TaskId]) {
        let mut state = self.state.lock();
        for id in task_ids {
            state.finished.remove(id);
        }
    }

    /// Recomputes every queued task's estimate from the current snapshot and
    /// re-heapifies.
    pub fn rebalance(&self) {
        let snapshot = self.monitor.sample();
        let min_score = self.monitor.min_admission_score();
        let mut state = self.state.lock();

        let mut entries = std::mem::take(&mut state.queue).into_sorted_vec();
        // Ord is reversed, so the sorted vec runs from last-to-dispatch to first.
        entries.reverse();

        let base_wait = state.base_wait_secs(entries.len(), &self.config);
        let now = Instant::now();
        state.queued_completion.clear();
        for entry in &mut entries {
            let mut wait = base_wait;
            if !snapshot.admits(&entry.task.requirement, min_score) {
                wait *= self.config.inadmissible_wait_multiplier;
            }
            let floor = now + Duration::from_secs_f64(wait.max(0.0));
            let start = state.earliest_start(&entry.task, floor);
            entry.estimated_completion = start + entry.task.estimated_duration;
            state
                .queued_completion
                .insert(entry.task.id, entry.estimated_completion);
        }
        let queued = entries.len();
        state.queue = BinaryHeap::from(entries);
        state.stats.rebalances += 1;
        drop(state);
        tracing::debug!(queued, "scheduler rebalanced");
        self.wakeup.notify_one();
    }

    /// Queue depth, running count and counters.
    pub fn status(&self) -> SchedulerStatus {
        let state = self.state.lock();
        SchedulerStatus {
            queued: state.queue.len(),
            running: state.running.len(),
            stats: state.stats,
        }
    }

    /// Resolves when work may have become available, or after `max_wait`.
    pub async fn wait_for_work(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.wakeup.notified()).await;
    }

    /// Forces the dispatch loop to poll now.
    pub fn wake(&self) {
        self.wakeup.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::cache::{CacheCategory, CacheKey};
    use crate::orchestration::config::ResourceConfig;
    use crate::error::Result;
    use crate::orchestration::finding::Finding;
    use crate::orchestration::registry::ScannerAdapter;
    use crate::orchestration::resources::{RawSample, StaticResourceProbe};
    use crate::orchestration::task::{CachePolicy, ResourceRequirement, ScanConfig};
    use std::collections::BTreeSet;
    use std::path::{Path, PathBuf};

    struct Harness {
        probe: Arc<StaticResourceProbe>,
        scheduler: TaskScheduler,
        registry: Arc<ScannerRegistry>,
    }

    struct Noop(&'static str);

    #[async_trait::async_trait]
    impl ScannerAdapter for Noop {
        fn name(&self) -> &str {
            self.0
        }

        async fn scan(&self, _target: &Path, _config: &ScanConfig) -> Result<Vec<Finding>> {
            Ok(Vec::new())
        }
    }

    fn harness(config: SchedulerConfig) -> Harness {
        let probe = Arc::new(StaticResourceProbe::idle(8, 4096));
        let monitor = Arc::new(ResourceMonitor::new(
            probe.clone(),
            ResourceConfig {
                sample_interval_ms: 0,
                ..ResourceConfig::default()
            },
        ));
        let mut registry = ScannerRegistry::default();
        registry.register(Arc::new(Noop("secret")));
        let registry = Arc::new(registry);
        Harness {
            probe,
            scheduler: TaskScheduler::new(config, monitor, registry.clone()),
            registry,
        }
    }

    fn task(job: JobId, scanner: &str, priority: PriorityClass, memory_mb: u64) -> ScanTask {
        let target = PathBuf::from("/repo");
        let config = ScanConfig::new();
        ScanTask {
            id: TaskId::new(),
            job_id: job,
            scanner: scanner.to_string(),
            cache_key: CacheKey::derive(CacheCategory::ScanResults, scanner, &target, &config, 3),
            target,
            config,
            priority,
            resource_type: ResourceType::CpuIntensive,
            requirement: ResourceRequirement::new(1.0, memory_mb),
            estimated_duration: Duration::from_secs(10),
            dependencies: BTreeSet::new(),
            cache_category: CacheCategory::ScanResults,
            cache_policy: CachePolicy::PreferCache,
            timeout: Duration::from_secs(60),
        }
    }

    fn dispatched(poll: SchedulerPoll<()>) -> Arc<ScanTask> {
        match poll {
            SchedulerPoll::Dispatch { task, .. } => task,
            other => panic!("expected dispatch, got {other:?}"),
        }
    }

    #[test]
    fn critical_dispatches_before_low_regardless_of_arrival() {
        let h = harness(SchedulerConfig::default());
        let job = JobId::new();
        let low = Arc::new(task(job, "b", PriorityClass::Low, 64));
        let critical = Arc::new(task(job, "a", PriorityClass::Critical, 64));
        h.scheduler.schedule(low.clone());
        h.scheduler.schedule(critical.clone());

        assert_eq!(dispatched(h.scheduler.poll(|_| Some(()))).id, critical.id);
        assert_eq!(dispatched(h.scheduler.poll(|_| Some(()))).id, low.id);
        assert!(matches!(
            h.scheduler.poll(|_| Some(())),
            SchedulerPoll::Waiting(WaitReason::Empty)
        ));
    }

    #[test]
    fn memory_deficit_holds_task_until_headroom_returns() {
        let h = harness(SchedulerConfig::default());
        h.probe.update(|s| s.memory_available_mb = 100);
        let big = Arc::new(task(JobId::new(), "trivy", PriorityClass::High, 384));
        h.scheduler.schedule(big.clone());

        for _ in 0..3 {
            assert!(matches!(
                h.scheduler.poll(|_| Some(())),
                SchedulerPoll::Waiting(WaitReason::ResourceExhausted { .. })
            ));
        }

        h.probe.update(|s| s.memory_available_mb = 2048);
        assert_eq!(dispatched(h.scheduler.poll(|_| Some(()))).id, big.id);
    }

    #[test]
    fn blocked_head_stalls_smaller_tasks_behind_it() {
        let h = harness(SchedulerConfig::default());
        h.probe.update(|s| s.memory_available_mb = 200);
        let job = JobId::new();
        h.scheduler
            .schedule(Arc::new(task(job, "big", PriorityClass::Critical, 1024)));
        h.scheduler
            .schedule(Arc::new(task(job, "small", PriorityClass::Low, 32)));

        assert!(matches!(
            h.scheduler.poll(|_| Some(())),
            SchedulerPoll::Waiting(WaitReason::ResourceExhausted { .. })
        ));
        assert_eq!(h.scheduler.status().queued, 2);
    }

    #[test]
    fn lookahead_lets_a_fitting_task_pass_a_blocked_head() {
        let h = harness(SchedulerConfig {
            lookahead: 1,
            ..SchedulerConfig::default()
        });
        h.probe.update(|s| s.memory_available_mb = 200);
        let job = JobId::new();
        h.scheduler
            .schedule(Arc::new(task(job, "big", PriorityClass::Critical, 1024)));
        let small = Arc::new(task(job, "small", PriorityClass::Low, 32));
        h.scheduler.schedule(small.clone());

        assert_eq!(dispatched(h.scheduler.poll(|_| Some(()))).id, small.id);
        assert_eq!(h.scheduler.status().queued, 1);
    }

    #[test]
    fn saturated_pool_keeps_task_queued() {
        let h = harness(SchedulerConfig::default());
        h.scheduler
            .schedule(Arc::new(task(JobId::new(), "sast", PriorityClass::High, 64)));
        assert!(matches!(
            h.scheduler.poll(|_| None::<()>),
            SchedulerPoll::Waiting(WaitReason::PoolSaturated { .. })
        ));
        assert_eq!(h.scheduler.status().queued, 1);
    }

    #[test]
    fn dependents_wait_for_dependencies_and_die_with_them() {
        let h = harness(SchedulerConfig::default());
        let job = JobId::new();
        let first = Arc::new(task(job, "dependency", PriorityClass::High, 64));
        let mut second = task(job, "snyk", PriorityClass::High, 64);
        second.dependencies.insert(first.id);
        let second = Arc::new(second);
        h.scheduler.schedule(first.clone());
        h.scheduler.schedule(second.clone());

        assert_eq!(dispatched(h.scheduler.poll(|_| Some(()))).id, first.id);
        assert!(matches!(
            h.scheduler.poll(|_| Some(())),
            SchedulerPoll::Waiting(WaitReason::DependenciesPending { .. })
        ));

        h.scheduler
            .mark_completed(first.id, false, Duration::from_secs(5));
        match h.scheduler.poll(|_| Some(())) {
            SchedulerPoll::DependencyFailed { task, dependency } => {
                assert_eq!(task.id, second.id);
                assert_eq!(dependency, first.id);
            }
            other => panic!("expected dependency failure, got {other:?}"),
        }
        assert_eq!(h.scheduler.status().stats.dependency_failures, 1);
    }

    #[test]
    fn completed_runs_feed_scanner_estimates() {
        let h = harness(SchedulerConfig::default());
        let before = h.registry.stats("secret").expect("seeded stats");

        let t = Arc::new(task(JobId::new(), "secret", PriorityClass::Critical, 64));
        h.scheduler.schedule(t.clone());
        dispatched(h.scheduler.poll(|_| Some(())));
        h.scheduler
            .mark_completed(t.id, true, Duration::from_secs(600));

        let after = h.registry.stats("secret").expect("stats");
        assert_eq!(after.samples, 1);
        assert!(after.estimated_duration_secs > before.estimated_duration_secs);
        assert_eq!(h.scheduler.status().stats.completed, 1);
    }

    #[test]
    fn settled_tasks_leave_estimates_alone() {
        let h = harness(SchedulerConfig::default());
        let t = Arc::new(task(JobId::new(), "secret", PriorityClass::Critical, 64));
        h.scheduler.schedule(t.clone());
        dispatched(h.scheduler.poll(|_| Some(())));
        h.scheduler.mark_settled(t.id, true);
        assert_eq!(h.registry.stats("secret").expect("stats").samples, 0);
        assert_eq!(h.scheduler.status().running, 0);
    }

    #[test]
    fn cancel_job_removes_only_its_queued_tasks() {
        let h = harness(SchedulerConfig::default());
        let doomed = JobId::new();
        let kept = JobId::new();
        h.scheduler
            .schedule(Arc::new(task(doomed, "a", PriorityClass::High, 64)));
        h.scheduler
            .schedule(Arc::new(task(doomed, "b", PriorityClass::High, 64)));
        let survivor = Arc::new(task(kept, "c", PriorityClass::Low, 64));
        h.scheduler.schedule(survivor.clone());

        assert_eq!(h.scheduler.cancel_job(doomed).len(), 2);
        assert_eq!(dispatched(h.scheduler.poll(|_| Some(()))).id, survivor.id);
    }

    #[test]
    fn rebalance_preserves_priority_order() {
        let h = harness(SchedulerConfig::default());
        let job = JobId::new();
        let medium = Arc::new(task(job, "m", PriorityClass::Medium, 64));
        let high = Arc::new(task(job, "h", PriorityClass::High, 64));
        h.scheduler.schedule(medium.clone());
        h.scheduler.schedule(high.clone());

        h.scheduler.rebalance();
        assert_eq!(h.scheduler.status().stats.rebalances, 1);
        assert_eq!(dispatched(h.scheduler.poll(|_| Some(()))).id, high.id);
        assert_eq!(dispatched(h.scheduler.poll(|_| Some(()))).id, medium.id);
    }

    #[test]
    fn persistent_inadmissibility_is_reported_once_as_a_stall() {
        let h = harness(SchedulerConfig {
            stall_warning_ms: 0,
            ..SchedulerConfig::default()
        });
        h.probe.set(RawSample {
            cpu_utilization: 0.99,
            memory_total_mb: 4096,
            memory_available_mb: 100,
            disk_utilization: 0.99,
            logical_cores: 4,
            physical_cores: 4,
        });
        h.scheduler
            .schedule(Arc::new(task(JobId::new(), "sast", PriorityClass::High, 64)));

        for _ in 0..5 {
            h.scheduler.poll(|_| Some(()));
        }
        assert_eq!(h.scheduler.status().stats.stalls, 1);
    }
}
