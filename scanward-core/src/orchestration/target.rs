//! Turning a target reference into a local directory the scanners can read.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Result, ScanError};
use crate::types::ids::JobId;

/// Resolves a target reference (local path, repository URL) to a local path.
///
/// A resolution error is fatal to the job that asked for it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TargetResolver: Send + Sync {
    /// Local path the scanners of `job_id` will read.
    async fn resolve(&self, job_id: JobId, target_ref: &str) -> Result<PathBuf>;

    /// Called once the job that resolved `path` is terminal.
    async fn release(&self, _path: &Path) {}
}

/// Accepts existing local directories and files.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalPathResolver;

#[async_trait]
impl TargetResolver for LocalPathResolver {
    async fn resolve(&self, _job_id: JobId, target_ref: &str) -> Result<PathBuf> {
        let path = target_ref.strip_prefix("file://").unwrap_or(target_ref);
        tokio::fs::canonicalize(path)
            .await
            .map_err(|e| ScanError::target(target_ref, e.to_string()))
    }
}

const CLONE_TIMEOUT: Duration = Duration::from_secs(300);

/// Shallow-clones repositories into a per-job directory under `work_dir`.
#[derive(Clone, Debug)]
pub struct GitCloneResolver {
    work_dir: PathBuf,
    timeout: Duration,
}

impl GitCloneResolver {
    /// Clones land in `work_dir/clone-<job id>`.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            timeout: CLONE_TIMEOUT,
        }
    }

    /// Overrides the 300s clone deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn clone_dir(&self, job_id: JobId) -> PathBuf {
        self.work_dir.join(format!("clone-{job_id}"))
    }
}

#[async_trait]
impl TargetResolver for GitCloneResolver {
    async fn resolve(&self, job_id: JobId, target_ref: &str) -> Result<PathBuf> {
        let dest = self.clone_dir(job_id);
        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .map_err(|e| ScanError::target(target_ref, format!("work dir unavailable: {e}")))?;

        tracing::info!(job = %job_id, repo = target_ref, dest = %dest.display(), "cloning repository");
        let clone = Command::new("git")
            .args(["clone", "--depth", "1", "--quiet", target_ref])
            .arg(&dest)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, clone)
            .await
            .map_err(|_| {
                ScanError::target(
                    target_ref,
                    format!("clone timed out after {}s", self.timeout.as_secs()),
                )
            })?
            .map_err(|e| ScanError::target(target_ref, format!("failed to run git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let _ = tokio::fs::remove_dir_all(&dest).await;
            return Err(ScanError::target(target_ref, stderr.trim().to_string()));
        }
        Ok(dest)
    }

    async fn release(&self, path: &Path) {
        if !path.starts_with(&self.work_dir) {
            return;
        }
        if let Err(err) = tokio::fs::remove_dir_all(path).await {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove clone");
        }
    }
}

/// Sends repository URLs to git and everything else to the local resolver.
#[derive(Clone)]
pub struct DefaultTargetResolver {
    work_dir: PathBuf,
    local: Arc<dyn TargetResolver>,
    git: Arc<dyn TargetResolver>,
}

impl fmt::Debug for DefaultTargetResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultTargetResolver")
            .field("work_dir", &self.work_dir)
            .finish_non_exhaustive()
    }
}

impl DefaultTargetResolver {
    /// Repository clones go under `work_dir`.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        Self {
            local: Arc::new(LocalPathResolver),
            git: Arc::new(GitCloneResolver::new(work_dir.clone())),
            work_dir,
        }
    }

    /// Where clones are created.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Whether `target_ref` names a remote repository rather than a path.
    pub fn is_repository(target_ref: &str) -> bool {
        target_ref.starts_with("https://")
            || target_ref.starts_with("http://")
            || target_ref.starts_with("ssh://")
            || target_ref.starts_with("git@")
            || target_ref.ends_with(".git")
    }
}

impl Default for DefaultTargetResolver {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("scanward"))
    }
}

#[async_trait]
impl TargetResolver for DefaultTargetResolver {
    async fn resolve(&self, job_id: JobId, target_ref: &str) -> Result<PathBuf> {
        if Self::is_repository(target_ref) {
            self.git.resolve(job_id, target_ref).await
        } else {
            self.local.resolve(job_id, target_ref).await
        }
    }

    async fn release(&self, path: &Path) {
        self.git.release(path).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_refs_are_recognised() {
        assert!(DefaultTargetResolver::is_repository(
            "https://github.com/acme/app"
        ));
        assert!(DefaultTargetResolver::is_repository(
            "git@github.com:acme/app.git"
        ));
        assert!(!DefaultTargetResolver::is_repository("/srv/checkouts/app"));
        assert!(!DefaultTargetResolver::is_repository("./app"));
    }

    #[test]
    fn default_resolver_clones_under_the_temp_dir() {
        let resolver = DefaultTargetResolver::default();
        assert_eq!(resolver.work_dir(), std::env::temp_dir().join("scanward"));
    }

    #[tokio::test]
    async fn local_resolver_requires_existing_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resolved = LocalPathResolver
            .resolve(JobId::new(), dir.path().to_str().expect("utf8 path"))
            .await
            .expect("existing dir resolves");
        assert!(resolved.is_absolute());

        let missing = dir.path().join("nope");
        let err = LocalPathResolver
            .resolve(JobId::new(), missing.to_str().expect("utf8 path"))
            .await
            .expect_err("missing dir");
        assert!(matches!(err, ScanError::TargetAcquisition { .. }));
    }

    #[tokio::test]
    async fn git_release_ignores_paths_outside_work_dir() {
        let work = tempfile::tempdir().expect("tempdir");
        let outside = tempfile::tempdir().expect("tempdir");
        let resolver = GitCloneResolver::new(work.path());
        resolver.release(outside.path()).await;
        assert!(outside.path().exists());
    }
}
