//! Runs one task against the cache and its scanner adapter.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;

use crate::error::{Result, ScanError};
use crate::orchestration::cache::{CacheLookup, CacheRequest, CacheStore, ClaimOutcome};
use crate::orchestration::finding::Finding;
use crate::orchestration::registry::ScannerRegistry;
use crate::orchestration::task::{
    CachePolicy, ResultSource, ScanTask, TaskFailure, TaskFailureKind,
};

/// What a worker reports back for one executed task.
#[derive(Debug)]
pub struct TaskOutcome {
    /// The task that ran.
    pub task: Arc<ScanTask>,
    /// Findings or the failure.
    pub result: ClaimOutcome,
    /// Where the result came from.
    pub source: ResultSource,
    /// Wall time spent in `execute`.
    pub duration: Duration,
    /// False when the findings came from the cache or a shared execution.
    pub adapter_invoked: bool,
}

/// Runs one task: consults the cache, joins an in-flight execution, or
/// invokes the adapter under the task's deadline.
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    cache: CacheStore,
    registry: Arc<ScannerRegistry>,
}

impl TaskExecutor {
    /// Executor over `cache` and `registry`.
    pub fn new(cache: CacheStore, registry: Arc<ScannerRegistry>) -> Self {
        Self { cache, registry }
    }

    /// Runs `task` to an outcome; never panics or returns early.
    pub async fn execute(&self, task: Arc<ScanTask>) -> TaskOutcome {
        let started = Instant::now();
        let relevance = self.registry.relevance(&task.scanner);
        let mut request = CacheRequest::new(&task.scanner, &task.target, &task.config)
            .category(task.cache_category);
        if let Some(relevance) = relevance {
            request = request.scoped_to(relevance);
        }
        let lookup = match task.cache_policy {
            CachePolicy::PreferCache => self.cache.lookup(&request).await,
            CachePolicy::Refresh => self.cache.refresh(&request).await,
        };

        let (result, source, adapter_invoked) = match lookup {
            CacheLookup::Hit(entry) => {
                tracing::debug!(task = %task.id, scanner = %task.scanner, "served from cache");
                (Ok(entry.findings), ResultSource::Cache, false)
            }
            CacheLookup::InFlight(pending) => {
                tracing::debug!(
                    task = %task.id,
                    scanner = %task.scanner,
                    key = %pending.key(),
                    "joining in-flight execution"
                );
                (pending.wait(task.timeout).await, ResultSource::Shared, false)
            }
            CacheLookup::Miss(claim) => {
                let result = self.run_adapter(&task).await;
                claim.complete(result.clone()).await;
                (result, ResultSource::Fresh, true)
            }
        };

        TaskOutcome {
            task,
            result,
            source,
            duration: started.elapsed(),
            adapter_invoked,
        }
    }

    async fn run_adapter(&self, task: &ScanTask) -> ClaimOutcome {
        self.invoke(task).await.map_err(|err| {
            let kind = match err {
                ScanError::ScannerTimeout { .. } => TaskFailureKind::Timeout,
                _ => TaskFailureKind::Execution,
            };
            TaskFailure::new(kind, err.to_string())
        })
    }

    async fn invoke(&self, task: &ScanTask) -> Result<Vec<Finding>> {
        let adapter = self
            .registry
            .adapter(&task.scanner)
            .ok_or_else(|| ScanError::UnknownScanner(task.scanner.clone()))?;

        tracing::debug!(
            task = %task.id,
            job = %task.job_id,
            scanner = %task.scanner,
            timeout_secs = task.timeout.as_secs(),
            "invoking scanner"
        );
        let scan = AssertUnwindSafe(adapter.scan(&task.target, &task.config)).catch_unwind();
        match tokio::time::timeout(task.timeout, scan).await {
            Ok(Ok(result)) => result.map_err(|err| match err {
                ScanError::ScannerExecution { .. } | ScanError::ScannerTimeout { .. } => err,
                other => ScanError::execution(&task.scanner, other.to_string()),
            }),
            Ok(Err(_panic)) => {
                tracing::warn!(task = %task.id, scanner = %task.scanner, "scanner panicked");
                Err(ScanError::execution(&task.scanner, "adapter panicked"))
            }
            Err(_) => {
                tracing::warn!(
                    task = %task.id,
                    scanner = %task.scanner,
                    timeout_secs = task.timeout.as_secs(),
                    "scanner timed out"
                );
                Err(ScanError::ScannerTimeout {
                    scanner: task.scanner.clone(),
                    timeout: task.timeout,
                })
            }
        }
    }
}
