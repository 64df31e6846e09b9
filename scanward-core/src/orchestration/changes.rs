//! Change sets read from a target's git history.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;

use crate::error::{Result, ScanError};

const DIFF_TIMEOUT: Duration = Duration::from_secs(30);

/// Files that differ between `revision` and `HEAD` in the repository at
/// `repo`, relative to the repository root.
///
/// Fails when `repo` is not a work tree, the revision is unknown (a shallow
/// clone has no `HEAD~1`), or git does not answer within 30s.
pub async fn changed_since(repo: &Path, revision: &str) -> Result<Vec<PathBuf>> {
    let revision = revision.trim();
    if revision.is_empty() || revision.starts_with('-') {
        return Err(change_error(repo, format!("invalid revision {revision:?}")));
    }

    let diff = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(["diff", "--name-only", revision, "HEAD", "--"])
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(DIFF_TIMEOUT, diff)
        .await
        .map_err(|_| change_error(repo, format!("git diff timed out after {}s", DIFF_TIMEOUT.as_secs())))?
        .map_err(|e| change_error(repo, format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(change_error(repo, stderr.trim().to_string()));
    }

    let files: Vec<PathBuf> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect();
    tracing::debug!(repo = %repo.display(), revision, changed = files.len(), "git change set computed");
    Ok(files)
}

fn change_error(repo: &Path, reason: String) -> ScanError {
    ScanError::ChangeDetection {
        target: repo.display().to_string(),
        reason,
    }
}
