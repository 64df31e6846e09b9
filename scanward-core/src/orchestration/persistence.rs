//! Storage boundary for job rows and findings.
//!
//! The orchestrator calls these on every transition. Failures are logged and
//! never change in-memory job state.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use crate::types::ids::JobId;

use super::finding::Finding;
use super::job::{JobStatus, ScanJob};

/// Durable record of jobs, their progress and findings.
#[async_trait]
pub trait ScanPersistence: Send + Sync {
    /// Inserts the row for a freshly accepted job.
    async fn create_job(&self, job: &ScanJob) -> Result<()>;

    /// Records a status change; `error_message` accompanies `Failed`.
    async fn update_job_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<()>;

    /// Records progress after a task settles.
    async fn update_job_progress(&self, job_id: JobId, progress: u8, stage: &str) -> Result<()>;

    /// Appends findings of one settled task.
    async fn bulk_insert_findings(&self, job_id: JobId, findings: &[Finding]) -> Result<()>;
}

/// One recorded persistence call.
#[derive(Clone, Debug, PartialEq)]
pub enum PersistenceCall {
    /// `create_job`.
    CreateJob(JobId),
    /// `update_job_status`.
    UpdateStatus {
        /// Job.
        job_id: JobId,
        /// New status.
        status: JobStatus,
        /// Failure reason.
        error_message: Option<String>,
    },
    /// `update_job_progress`.
    UpdateProgress {
        /// Job.
        job_id: JobId,
        /// Percent finished.
        progress: u8,
        /// Stage label.
        stage: String,
    },
    /// `bulk_insert_findings`, by count.
    InsertFindings {
        /// Job.
        job_id: JobId,
        /// Findings inserted.
        count: usize,
    },
}

#[derive(Default)]
struct MemoryState {
    calls: Vec<PersistenceCall>,
    findings: HashMap<JobId, Vec<Finding>>,
}

/// Keeps every call in memory. Used when no database is wired in.
#[derive(Default)]
pub struct InMemoryScanPersistence {
    state: Mutex<MemoryState>,
}

impl fmt::Debug for InMemoryScanPersistence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let calls = self.state.try_lock().map(|s| s.calls.len()).unwrap_or_default();
        f.debug_struct("InMemoryScanPersistence")
            .field("calls", &calls)
            .finish()
    }
}

impl InMemoryScanPersistence {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<PersistenceCall> {
        self.state.lock().calls.clone()
    }

    /// Calls concerning `job_id`, in order.
    pub fn calls_for(&self, job_id: JobId) -> Vec<PersistenceCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.job_id() == job_id)
            .cloned()
            .collect()
    }

    /// Findings stored for `job_id`.
    pub fn findings(&self, job_id: JobId) -> Vec<Finding> {
        self.state
            .lock()
            .findings
            .get(&job_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl PersistenceCall {
    /// Job the call concerns.
    pub fn job_id(&self) -> JobId {
        match self {
            PersistenceCall::CreateJob(job_id)
            | PersistenceCall::UpdateStatus { job_id, .. }
            | PersistenceCall::UpdateProgress { job_id, .. }
            | PersistenceCall::InsertFindings { job_id, .. } => *job_id,
        }
    }
}

#[async_trait]
impl ScanPersistence for InMemoryScanPersistence {
    async fn create_job(&self, job: &ScanJob) -> Result<()> {
        self.state.lock().calls.push(PersistenceCall::CreateJob(job.id));
        Ok(())
    }

    async fn update_job_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.state.lock().calls.push(PersistenceCall::UpdateStatus {
            job_id,
            status,
            error_message: error_message.map(str::to_string),
        });
        Ok(())
    }

    async fn update_job_progress(&self, job_id: JobId, progress: u8, stage: &str) -> Result<()> {
        self.state.lock().calls.push(PersistenceCall::UpdateProgress {
            job_id,
            progress,
            stage: stage.to_string(),
        });
        Ok(())
    }

    async fn bulk_insert_findings(&self, job_id: JobId, findings: &[Finding]) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(PersistenceCall::InsertFindings {
            job_id,
            count: findings.len(),
        });
        state
            .findings
            .entry(job_id)
            .or_default()
            .extend_from_slice(findings);
        Ok(())
    }
}
