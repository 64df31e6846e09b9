//! Scan requests, jobs and their status machine.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ids::{JobId, TaskId};

use super::finding::Finding;
use super::task::{PriorityClass, ScanConfig, TaskRecord, TaskState};

/// Lifecycle state of a scan job. Terminal states are never left.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Accepted; target resolution and decomposition in progress.
    Pending,
    /// Tasks are queued or executing.
    Running,
    /// Every task settled, successfully or not.
    Completed,
    /// The job could not run at all.
    Failed,
    /// Stopped at the caller's request.
    Cancelled,
}

impl JobStatus {
    /// Completed, Failed or Cancelled.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal forward step.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Which scanners a request wants.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScannerSelection {
    /// A named bundle such as `basic` or `full`.
    Bundle(String),
    /// Scanner names; unknown names are dropped during decomposition.
    Explicit(Vec<String>),
    /// Scanners recommended for the detected project type.
    Auto,
}

impl ScannerSelection {
    /// A named bundle.
    pub fn bundle(name: impl Into<String>) -> Self {
        ScannerSelection::Bundle(name.into())
    }

    /// An explicit list of scanner names.
    pub fn explicit<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ScannerSelection::Explicit(names.into_iter().map(Into::into).collect())
    }
}

/// Input to [`ScanOrchestrator::start_scan`](super::ScanOrchestrator::start_scan).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanRequest {
    /// Local path or repository URL, interpreted by the target resolver.
    pub target_ref: String,
    /// Which scanners to run.
    pub selection: ScannerSelection,
    /// Raises (never lowers) the priority class of every task in the job.
    pub priority_hint: Option<PriorityClass>,
    /// Files known to have changed since the previous scan, relative to the
    /// target root. Empty means "nothing known to have changed".
    pub changed_files: Vec<PathBuf>,
    /// Derive `changed_files` from `git diff` against this revision of the
    /// resolved target. Ignored when `changed_files` is non-empty.
    #[serde(default)]
    pub since_commit: Option<String>,
    /// Opaque scanner options, folded into cache keys.
    pub config: ScanConfig,
}

impl ScanRequest {
    /// A request with default priority, options and no change set.
    pub fn new(target_ref: impl Into<String>, selection: ScannerSelection) -> Self {
        Self {
            target_ref: target_ref.into(),
            selection,
            priority_hint: None,
            changed_files: Vec::new(),
            since_commit: None,
            config: ScanConfig::default(),
        }
    }

    /// Raises every task of the job to at least `hint`.
    pub fn with_priority(mut self, hint: PriorityClass) -> Self {
        self.priority_hint = Some(hint);
        self
    }

    /// Files known to have changed since the previous scan.
    pub fn with_changed_files<I, P>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.changed_files = files.into_iter().map(Into::into).collect();
        self
    }

    /// Computes the change set from the target's git history since `revision`
    /// (for example `HEAD~1` or a commit hash).
    pub fn since_commit(mut self, revision: impl Into<String>) -> Self {
        self.since_commit = Some(revision.into());
        self
    }

    /// Scanner options.
    pub fn with_config(mut self, config: ScanConfig) -> Self {
        self.config = config;
        self
    }
}

/// One orchestrated scan and its aggregate state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanJob {
    /// Job identifier.
    pub id: JobId,
    /// Target as requested.
    pub target_ref: String,
    /// Resolved target, once known.
    pub local_path: Option<PathBuf>,
    /// Bundle name or scanner names as requested.
    pub requested_scanners: BTreeSet<String>,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Percentage of tasks in a terminal state.
    pub progress: u8,
    /// Human-readable stage.
    pub current_stage: String,
    /// Acceptance time.
    pub created_at: DateTime<Utc>,
    /// When tasks were queued.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job became terminal.
    pub completed_at: Option<DateTime<Utc>>,
    /// Job-level failure reason.
    pub error_message: Option<String>,
    /// Per-scanner task state.
    pub tasks: Vec<TaskRecord>,
    /// Findings of every successful task.
    pub findings: Vec<Finding>,
}

impl ScanJob {
    /// A `Pending` job for `request`.
    pub fn new(id: JobId, request: &ScanRequest) -> Self {
        let requested_scanners = match &request.selection {
            ScannerSelection::Bundle(name) => BTreeSet::from([name.clone()]),
            ScannerSelection::Explicit(names) => names.iter().cloned().collect(),
            ScannerSelection::Auto => BTreeSet::from(["auto".to_string()]),
        };
        Self {
            id,
            target_ref: request.target_ref.clone(),
            local_path: None,
            requested_scanners,
            status: JobStatus::Pending,
            progress: 0,
            current_stage: "Queued".into(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            tasks: Vec::new(),
            findings: Vec::new(),
        }
    }

    /// Applies a status change if it is a legal forward transition.
    ///
    /// Returns `false` (and leaves the job untouched) otherwise.
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        match next {
            JobStatus::Running => self.started_at = Some(now),
            _ if next.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }
        self.status = next;
        true
    }

    /// Moves to `Failed` with `message`; `false` if already terminal.
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        let message = message.into();
        if !self.transition(JobStatus::Failed) {
            return false;
        }
        self.current_stage = "Failed".into();
        self.error_message = Some(message);
        true
    }

    /// The record of `task_id`.
    pub fn task_mut(&mut self, task_id: TaskId) -> Option<&mut TaskRecord> {
        self.tasks.iter_mut().find(|t| t.task_id == task_id)
    }

    /// Tasks in a terminal state.
    pub fn finished_tasks(&self) -> usize {
        self.tasks.iter().filter(|t| t.state.is_terminal()).count()
    }

    /// Tasks that ended `Failed`.
    pub fn failed_tasks(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.state == TaskState::Failed)
            .count()
    }

    /// At least one task, and every task terminal.
    pub fn all_tasks_finished(&self) -> bool {
        !self.tasks.is_empty() && self.finished_tasks() == self.tasks.len()
    }

    /// Refreshes `progress` from the task states.
    pub fn recompute_progress(&mut self) {
        let total = self.tasks.len();
        self.progress = if total == 0 {
            0
        } else {
            ((self.finished_tasks() * 100) / total) as u8
        };
    }

    /// Progress view without findings.
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            job_id: self.id,
            status: self.status,
            progress: self.progress,
            current_stage: self.current_stage.clone(),
            findings_count: self.findings.len(),
            tasks: self.tasks.clone(),
            error_message: self.error_message.clone(),
        }
    }

    /// Summary of how the job ended, or `InProgress`.
    pub fn outcome(&self) -> JobOutcome {
        match self.status {
            JobStatus::Pending | JobStatus::Running => JobOutcome::InProgress,
            JobStatus::Failed => JobOutcome::Failed,
            JobStatus::Cancelled => JobOutcome::Cancelled,
            JobStatus::Completed if self.failed_tasks() == 0 => JobOutcome::Succeeded,
            JobStatus::Completed => JobOutcome::PartiallySucceeded,
        }
    }
}

/// Point-in-time view returned by `get_progress`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Job identifier.
    pub job_id: JobId,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Percent of tasks finished.
    pub progress: u8,
    /// Human-readable stage.
    pub current_stage: String,
    /// Findings collected so far.
    pub findings_count: usize,
    /// Per-scanner task state.
    pub tasks: Vec<TaskRecord>,
    /// Job-level failure reason.
    pub error_message: Option<String>,
}

/// Caller-facing summary of how a job ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    /// Not terminal yet.
    InProgress,
    /// Completed with no failed task.
    Succeeded,
    /// Completed with at least one failed task.
    PartiallySucceeded,
    /// The job failed.
    Failed,
    /// The job was cancelled.
    Cancelled,
}

/// Acknowledgement returned by `cancel_scan`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelAck {
    /// The job moved to Cancelled as a result of this call.
    Cancelled,
    /// The job had already reached this terminal state; nothing changed.
    AlreadyTerminal(JobStatus),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> ScanJob {
        let request = ScanRequest::new("/tmp/repo", ScannerSelection::bundle("basic"));
        ScanJob::new(JobId::new(), &request)
    }

    #[test]
    fn terminal_states_are_never_left() {
        let mut job = job();
        assert!(job.transition(JobStatus::Running));
        assert!(job.transition(JobStatus::Completed));
        assert!(!job.transition(JobStatus::Running));
        assert!(!job.transition(JobStatus::Cancelled));
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn fail_records_message_once() {
        let mut job = job();
        assert!(job.fail("no scanners"));
        assert!(!job.fail("second"));
        assert_eq!(job.error_message.as_deref(), Some("no scanners"));
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn empty_job_reports_zero_progress() {
        let mut job = job();
        job.recompute_progress();
        assert_eq!(job.progress, 0);
        assert!(!job.all_tasks_finished());
    }
}
